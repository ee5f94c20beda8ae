//! Polygon mesh objects.
//!
//! The source node carries `pos_list` / `motion_pos_list` /
//! `triangle_list` tags plus any number of user primitive variables;
//! dicing turns a triangle range into a ray-traceable tessellation and
//! bakes the interpolated channels.

use crate::error::{Error, Result};
use crate::math::*;
use crate::nodesys::{Node, NodeSystem, StorageClass};
use crate::obj::{ObjectElement, TesselJob, Tessellable};
use crate::rt::tessel::{create_tessel, RayTessel, RayTriangle, RayVertex};
use ember_db::array::DataArray;
use ember_db::{Database, Tag, Value};
use log::error;

pub struct PolyObject;

fn tag_param(db: &Database, node: Tag, name: &str) -> Tag {
    let n = db.read::<Node>(node);
    match n.lookup_parameter(name).map(|i| &n.read_parameter(i).value) {
        Some(Value::Tag(t)) => *t,
        _ => Tag::null(),
    }
}

fn positions(db: &Database, node: Tag, motion: bool) -> (Vec<[f32; 3]>, Option<Vec<[f32; 3]>>) {
    let pos_tag = tag_param(db, node, "pos_list");
    let pos = if pos_tag.is_null() {
        Vec::new()
    } else {
        db.read::<DataArray<[f32; 3]>>(pos_tag).items.clone()
    };
    let m_pos = if motion {
        let m_tag = tag_param(db, node, "motion_pos_list");
        if m_tag.is_null() {
            None
        } else {
            Some(db.read::<DataArray<[f32; 3]>>(m_tag).items.clone())
        }
    } else {
        None
    };
    (pos, m_pos)
}

fn triangle_indices(db: &Database, node: Tag) -> Vec<u32> {
    let tag = tag_param(db, node, "triangle_list");
    if tag.is_null() {
        Vec::new()
    } else {
        db.read::<DataArray<u32>>(tag).items.clone()
    }
}

impl ObjectElement for PolyObject {
    fn create(&self, db: &Database, source: Tag) -> Result<Tessellable> {
        let indices = triangle_indices(db, source);
        if indices.len() % 3 != 0 {
            error!("triangle list length is not a multiple of three");
            return Err(Error::UnsupportedObjectKind("poly".to_owned()));
        }
        Ok(Tessellable {
            first_prim: 0,
            num_prims: (indices.len() / 3) as u32,
            subdiv: 0,
        })
    }

    fn bound(&self, db: &Database, job: &TesselJob, sub: &Tessellable) -> BBox {
        let (pos, m_pos) = positions(db, job.source, job.motion);
        let indices = triangle_indices(db, job.source);
        let mut bbox = BBox::empty();
        let first = sub.first_prim as usize * 3;
        let last = ((sub.first_prim + sub.num_prims) as usize * 3).min(indices.len());
        for &vi in &indices[first..last] {
            if let Some(p) = pos.get(vi as usize) {
                bbox.add_point(&Vec3::new(p[0], p[1], p[2]));
            }
            if let Some(mp) = m_pos.as_ref().and_then(|m| m.get(vi as usize)) {
                bbox.add_point(&Vec3::new(mp[0], mp[1], mp[2]));
            }
        }
        bbox
    }

    fn dice(
        &self,
        db: &Database,
        nodesys: &NodeSystem,
        job: &TesselJob,
        sub: &Tessellable,
        into: Option<Tag>,
    ) -> Result<Tag> {
        let (pos, m_pos) = positions(db, job.source, job.motion);
        let indices = triangle_indices(db, job.source);
        let deform_moving = m_pos.is_some();

        // interpolated channels come from the source's primitive
        // variables: value tags name flat scalar arrays
        let (vertex_params, uniform_params) = {
            let node = nodesys.db.read::<Node>(job.source);
            let mut vp = Vec::new();
            let mut up = Vec::new();
            for p in node.params.iter() {
                match p.storage_class {
                    StorageClass::Varying | StorageClass::Vertex => vp.push(p.clone()),
                    StorageClass::Uniform => up.push(p.clone()),
                    StorageClass::Constant => {}
                }
            }
            (vp, up)
        };
        let num_vertex_channels: usize = vertex_params
            .iter()
            .map(|p| p.channel_dim as usize)
            .sum();
        let num_uniform_channels: usize = uniform_params
            .iter()
            .map(|p| p.channel_dim as usize)
            .sum();

        let mut tessel = RayTessel::new(num_uniform_channels, num_vertex_channels);
        for (vi, p) in pos.iter().enumerate() {
            let position = Vec3::new(p[0], p[1], p[2]);
            let m_position = match &m_pos {
                Some(m) => m
                    .get(vi)
                    .map(|mp| Vec3::new(mp[0], mp[1], mp[2]))
                    .unwrap_or(position),
                None => position,
            };
            tessel.add_vertex(RayVertex {
                pos: position,
                m_pos: m_position,
            });
        }
        for p in vertex_params.iter() {
            let data_tag = match p.value {
                Value::Tag(t) if !t.is_null() => t,
                _ => continue,
            };
            let data = db.read::<DataArray<f32>>(data_tag);
            let dim = p.channel_dim as usize;
            for k in 0..dim {
                let ch = (p.channel_offset as usize + k).min(num_vertex_channels - 1);
                for vi in 0..pos.len() {
                    let v = data.items.get(vi * dim + k).copied().unwrap_or(0.0);
                    tessel.add_vertex_data(ch, v);
                }
            }
        }
        for p in uniform_params.iter() {
            let data_tag = match p.value {
                Value::Tag(t) if !t.is_null() => t,
                _ => continue,
            };
            let data = db.read::<DataArray<f32>>(data_tag);
            let dim = p.channel_dim as usize;
            let num_prims = indices.len() / 3;
            for k in 0..dim {
                let ch = (p.channel_offset as usize + k).min(num_uniform_channels - 1);
                for pi in 0..num_prims {
                    let v = data.items.get(pi * dim + k).copied().unwrap_or(0.0);
                    tessel.add_uniform_data(ch, v);
                }
            }
        }
        let first = sub.first_prim as usize;
        let last = (sub.first_prim + sub.num_prims) as usize;
        for prim in first..last.min(indices.len() / 3) {
            tessel.add_triangle(RayTriangle {
                v1: indices[prim * 3],
                v2: indices[prim * 3 + 1],
                v3: indices[prim * 3 + 2],
                prim_index: prim as u32,
                deform_moving,
            });
        }

        match into {
            Some(tag) => {
                let mut t = db.write::<RayTessel>(tag);
                *t = tessel;
                Ok(tag)
            }
            None => {
                let tag = create_tessel(db, 0, 0);
                let mut t = db.write::<RayTessel>(tag);
                *t = tessel;
                Ok(tag)
            }
        }
    }
}
