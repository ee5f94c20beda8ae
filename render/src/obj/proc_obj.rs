//! Procedural objects: a user bounding box plus a geometry shader list
//! that performs the intersection test itself.
//!
//! The geometry shader reads the object-space ray from the state
//! (`obj_org`, `obj_dir`). On a hit it sets `found_hit`, writes the
//! parametric distance to `hit_t` and stores the object-space normal in
//! `user_data[1..4]`; the tracer fills in the instance-level fields.

use crate::error::{Error, Result};
use crate::math::*;
use crate::nodesys::{Node, NodeSystem};
use crate::obj::{ObjectElement, TesselJob, Tessellable, IFACE_NODESYS};
use crate::rt::tessel::{create_tessel, RayTessel};
use crate::rt::RayTracer;
use crate::shader;
use crate::state::State;
use ember_db::{Database, Tag, Value};
use log::warn;

pub struct ProcObject;

fn vec3_param(db: &Database, node: Tag, name: &str) -> Vec3 {
    let n = db.read::<Node>(node);
    match n.lookup_parameter(name).map(|i| &n.read_parameter(i).value) {
        Some(Value::Vec3(v)) => Vec3::new(v[0], v[1], v[2]),
        _ => Vec3::zeros(),
    }
}

fn tag_param(db: &Database, node: Tag, name: &str) -> Tag {
    let n = db.read::<Node>(node);
    match n.lookup_parameter(name).map(|i| &n.read_parameter(i).value) {
        Some(Value::Tag(t)) => *t,
        _ => Tag::null(),
    }
}

impl ObjectElement for ProcObject {
    fn create(&self, db: &Database, source: Tag) -> Result<Tessellable> {
        if tag_param(db, source, "geometry_list").is_null() {
            return Err(Error::UnsupportedObjectKind("procedural".to_owned()));
        }
        Ok(Tessellable {
            first_prim: 0,
            num_prims: 1,
            subdiv: 0,
        })
    }

    fn bound(&self, db: &Database, job: &TesselJob, _sub: &Tessellable) -> BBox {
        let mut b = BBox::empty();
        b.add_point(&vec3_param(db, job.source, "box_min"));
        b.add_point(&vec3_param(db, job.source, "box_max"));
        b
    }

    fn diceable(&self, _db: &Database, _job: &TesselJob, _sub: &Tessellable, _bbox: &BBox) -> bool {
        true
    }

    fn dice(
        &self,
        db: &Database,
        _nodesys: &NodeSystem,
        job: &TesselJob,
        sub: &Tessellable,
        into: Option<Tag>,
    ) -> Result<Tag> {
        let bbox = self.bound(db, job, sub);
        let mut tessel = RayTessel::new(0, 0);
        tessel.bbox = bbox;
        tessel.motion_bbox = bbox;
        tessel.procedural = true;
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

    /// Procedural leaves never dice; a box is all the scene BSP needs.
    fn deferred_dice_supported(&self) -> bool {
        false
    }

    fn intersect(&self, rt: &RayTracer, state: &mut State, tessel: Tag, tessel_inst: u32) {
        let nodesys = match rt.db.interface::<NodeSystem>(IFACE_NODESYS) {
            Some(ns) => ns,
            None => return,
        };
        let source = {
            let scene = rt.db.read::<crate::rt::RayScene>(rt.scene_tag());
            let tinst = scene.tessel_instances[tessel_inst as usize];
            let inst = &scene.instances[tinst.instance as usize];
            rt.db.read::<crate::rt::RayObject>(inst.object).source
        };
        let geometry_list = tag_param(&rt.db, source, "geometry_list");
        if geometry_list.is_null() {
            warn!("procedural object without geometry shader list");
            return;
        }
        let prev_hit_t = state.hit_t;
        let prev_found = state.found_hit;
        state.found_hit = false;
        let mut result = Vec4::zeros();
        shader::call_shader_instance_list(&nodesys, &mut result, state, geometry_list, None);
        if state.found_hit && state.hit_t < prev_hit_t {
            state.hit_tessel = tessel;
            state.hit_tessel_inst = tessel_inst;
        } else {
            state.found_hit = prev_found;
            state.hit_t = prev_hit_t;
        }
    }
}
