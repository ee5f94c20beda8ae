//! Hair objects: batches of degree-1/2/3 curves with per-vertex radii.
//!
//! Curves share one generic basis (de Casteljau) across degrees, both
//! for intersection and for primitive variable interpolation.

use crate::error::{Error, Result};
use crate::math::*;
use crate::nodesys::{Node, NodeSystem};
use crate::obj::{assemble_value, ObjectElement, TesselJob, Tessellable};
use crate::rt::tessel::{create_tessel, CurveSegment, RayTessel, RayVertex};
use crate::rt::trace::eval_curve_scalar;
use crate::state::State;
use ember_db::array::DataArray;
use ember_db::{Database, Tag, Value};
use log::{error, warn};
use std::sync::atomic::{AtomicBool, Ordering};

pub struct HairObject;

fn tag_param(db: &Database, node: Tag, name: &str) -> Tag {
    let n = db.read::<Node>(node);
    match n.lookup_parameter(name).map(|i| &n.read_parameter(i).value) {
        Some(Value::Tag(t)) => *t,
        _ => Tag::null(),
    }
}

fn int_param(db: &Database, node: Tag, name: &str, default: i32) -> i32 {
    let n = db.read::<Node>(node);
    match n.lookup_parameter(name).map(|i| &n.read_parameter(i).value) {
        Some(Value::Int(v)) => *v,
        _ => default,
    }
}

struct HairData {
    points: Vec<[f32; 3]>,
    m_points: Option<Vec<[f32; 3]>>,
    radii: Vec<f32>,
    degree: u8,
}

fn hair_data(db: &Database, node: Tag, motion: bool) -> HairData {
    let points_tag = tag_param(db, node, "vertex_list");
    let points = if points_tag.is_null() {
        Vec::new()
    } else {
        db.read::<DataArray<[f32; 3]>>(points_tag).items.clone()
    };
    let m_points = if motion {
        let t = tag_param(db, node, "motion_vertex_list");
        if t.is_null() {
            None
        } else {
            Some(db.read::<DataArray<[f32; 3]>>(t).items.clone())
        }
    } else {
        None
    };
    let radii_tag = tag_param(db, node, "radius_list");
    let radii = if radii_tag.is_null() {
        Vec::new()
    } else {
        db.read::<DataArray<f32>>(radii_tag).items.clone()
    };
    let degree = int_param(db, node, "degree", 1).max(1).min(3) as u8;
    HairData {
        points,
        m_points,
        radii,
        degree,
    }
}

impl HairObject {
    fn points_per_curve(degree: u8) -> u32 {
        degree as u32 + 1
    }
}

impl ObjectElement for HairObject {
    fn create(&self, db: &Database, source: Tag) -> Result<Tessellable> {
        let data = hair_data(db, source, false);
        let per_curve = HairObject::points_per_curve(data.degree);
        if data.points.is_empty() || data.points.len() as u32 % per_curve != 0 {
            error!("hair vertex list does not decompose into whole curves");
            return Err(Error::UnsupportedObjectKind("hair".to_owned()));
        }
        Ok(Tessellable {
            first_prim: 0,
            num_prims: data.points.len() as u32 / per_curve,
            subdiv: 0,
        })
    }

    fn bound(&self, db: &Database, job: &TesselJob, sub: &Tessellable) -> BBox {
        let data = hair_data(db, job.source, job.motion);
        let per_curve = HairObject::points_per_curve(data.degree) as usize;
        let mut bbox = BBox::empty();
        let first = sub.first_prim as usize * per_curve;
        let last = ((sub.first_prim + sub.num_prims) as usize * per_curve).min(data.points.len());
        let mut max_r = 0.0f32;
        for vi in first..last {
            let p = data.points[vi];
            bbox.add_point(&Vec3::new(p[0], p[1], p[2]));
            if let Some(mp) = data.m_points.as_ref().and_then(|m| m.get(vi)) {
                bbox.add_point(&Vec3::new(mp[0], mp[1], mp[2]));
            }
            max_r = max_r.max(data.radii.get(vi).copied().unwrap_or(0.0));
        }
        bbox.min -= Vec3::new(max_r, max_r, max_r);
        bbox.max += Vec3::new(max_r, max_r, max_r);
        bbox
    }

    fn dice(
        &self,
        db: &Database,
        _nodesys: &NodeSystem,
        job: &TesselJob,
        sub: &Tessellable,
        into: Option<Tag>,
    ) -> Result<Tag> {
        let data = hair_data(db, job.source, job.motion);
        let per_curve = HairObject::points_per_curve(data.degree);
        let mut tessel = RayTessel::new(0, 0);
        let first = sub.first_prim * per_curve;
        let last = ((sub.first_prim + sub.num_prims) * per_curve).min(data.points.len() as u32);
        for vi in first..last {
            let p = data.points[vi as usize];
            let position = Vec3::new(p[0], p[1], p[2]);
            let m_position = data
                .m_points
                .as_ref()
                .and_then(|m| m.get(vi as usize))
                .map(|mp| Vec3::new(mp[0], mp[1], mp[2]))
                .unwrap_or(position);
            tessel.add_vertex(RayVertex {
                pos: position,
                m_pos: m_position,
            });
            let r = data.radii.get(vi as usize).copied().unwrap_or(0.0);
            tessel.radii.push(r);
        }
        // pad the bound by the thickest radius
        let max_r = tessel.radii.iter().cloned().fold(0.0f32, f32::max);
        tessel.bbox.min -= Vec3::new(max_r, max_r, max_r);
        tessel.bbox.max += Vec3::new(max_r, max_r, max_r);
        tessel.motion_bbox.min -= Vec3::new(max_r, max_r, max_r);
        tessel.motion_bbox.max += Vec3::new(max_r, max_r, max_r);
        for c in 0..sub.num_prims {
            tessel.curves.push(CurveSegment {
                first: c * per_curve,
                count: per_curve,
                degree: data.degree,
                prim_index: sub.first_prim + c,
            });
        }
        match into {
            Some(tag) => {
                *db.write::<RayTessel>(tag) = tessel;
                Ok(tag)
            }
            None => {
                let tag = create_tessel(db, 0, 0);
                *db.write::<RayTessel>(tag) = tessel;
                Ok(tag)
            }
        }
    }

    /// Curve-basis interpolation instead of the barycentric default.
    fn interp_prim_var(
        &self,
        _db: &Database,
        state: &State,
        tessel: &RayTessel,
        param: &crate::nodesys::NodeParam,
    ) -> Option<Value> {
        interp_curve_channels(state, tessel, param)
    }

    /// Deferred dicing of hair is not implemented; the kind reports it
    /// unsupported so the executor dices immediately.
    fn deferred_dice_supported(&self) -> bool {
        static WARNED: AtomicBool = AtomicBool::new(false);
        if !WARNED.swap(true, Ordering::Relaxed) {
            warn!("deferred dicing is not supported for hair, dicing immediately");
        }
        false
    }
}

/// Curve-basis interpolation of vertex channels at the hit parameter.
pub(crate) fn interp_curve_channels(
    state: &State,
    tessel: &RayTessel,
    param: &crate::nodesys::NodeParam,
) -> Option<Value> {
    if param.channel_dim == 0 {
        return None;
    }
    let curve = tessel.curves.get(state.hit_tri as usize)?;
    let t = state.user_data[0];
    let dim = param.channel_dim as usize;
    let mut comps = [0.0f32; 4];
    for k in 0..dim.min(4) {
        let ch = tessel.vertex_channels.get(param.channel_offset as usize + k)?;
        let first = curve.first as usize;
        let count = (curve.count as usize).min(4);
        let mut ctrl = [0.0f32; 4];
        for i in 0..count {
            ctrl[i] = ch.get(first + i).copied()?;
        }
        comps[k] = eval_curve_scalar(&ctrl[..count], t);
    }
    Some(assemble_value(param.ty, &comps))
}
