//! The ray-traceable scene: objects, instances and the top-level BSP
//! over tessellation bounds.

use crate::math::*;
use crate::rt::bsp::BspTree;
use crate::rtypes;
use ember_db::array::DataArray;
use ember_db::{Database, DbFlags, Record, RecordType, Tag, NULL_INDEX};
use std::mem;

bitflags::bitflags! {
    /// Per-instance render switches.
    pub struct AttrFlags: u32 {
        const VISIBLE     = 0b001;
        const CAST_SHADOW = 0b010;
        const MOTION      = 0b100;
    }
}

/// The attribute set merged from an object and its instancing chain.
#[derive(Clone, Debug)]
pub struct Attributes {
    pub material: Tag,
    pub flags: AttrFlags,
}

impl Default for Attributes {
    fn default() -> Attributes {
        Attributes {
            material: Tag::null(),
            flags: AttrFlags::VISIBLE | AttrFlags::CAST_SHADOW,
        }
    }
}

impl Attributes {
    pub fn visible(&self) -> bool {
        self.flags.contains(AttrFlags::VISIBLE)
    }

    pub fn cast_shadow(&self) -> bool {
        self.flags.contains(AttrFlags::CAST_SHADOW)
    }

    pub fn motion(&self) -> bool {
        self.flags.contains(AttrFlags::MOTION)
    }

    /// Child attributes override unset parent slots; the boolean
    /// switches AND together except motion, which propagates down.
    pub fn merge(&self, child: &Attributes) -> Attributes {
        let mut flags = self.flags & child.flags;
        if (self.flags | child.flags).contains(AttrFlags::MOTION) {
            flags |= AttrFlags::MOTION;
        }
        Attributes {
            material: if child.material.is_null() {
                self.material
            } else {
                child.material
            },
            flags,
        }
    }
}

/// A tessellated ray-traceable object: the source object node plus the
/// tag array of its finished tessellations.
pub struct RayObject {
    pub source: Tag,
    pub tessels: Tag,
}

impl Record for RayObject {
    fn type_id(&self) -> RecordType {
        rtypes::RAY_OBJECT
    }

    fn size_hint(&self) -> usize {
        mem::size_of::<Self>()
    }
}

impl RayObject {
    pub fn create(db: &Database, source: Tag) -> Tag {
        let tessels = DataArray::<Tag>::create(db, rtypes::TAG_ARRAY);
        db.create(RayObject { source, tessels }, DbFlags::empty())
    }
}

/// An instance of a ray-traceable object with its transforms and the
/// precomputed inverses.
#[derive(Clone)]
pub struct RayObjectInstance {
    pub object: Tag,
    pub attr: Attributes,
    pub moving: bool,
    pub object_to_world: Mat4,
    pub world_to_object: Mat4,
    pub motion_object_to_world: Mat4,
    pub motion_world_to_object: Mat4,
    /// `motion_world_to_object * object_to_world`, transforms rays
    /// already in object space into the motion object space.
    pub world_to_motion: Mat4,
}

impl RayObjectInstance {
    pub fn new(
        object: Tag,
        attr: Attributes,
        object_to_world: Mat4,
        motion_object_to_world: Mat4,
    ) -> RayObjectInstance {
        let world_to_object = glm::inverse(&object_to_world);
        let motion_world_to_object = glm::inverse(&motion_object_to_world);
        let world_to_motion = motion_world_to_object * object_to_world;
        let moving = object_to_world != motion_object_to_world;
        RayObjectInstance {
            object,
            attr,
            moving,
            object_to_world,
            world_to_object,
            motion_object_to_world,
            motion_world_to_object,
            world_to_motion,
        }
    }
}

/// A (tessellation, object instance) pair, the primitive of the
/// top-level BSP.
#[derive(Copy, Clone, Debug)]
pub struct RayTesselInstance {
    pub tessel: Tag,
    pub instance: u32,
}

/// The in-memory scene, valid between `scene` and `end_scene`.
pub struct RayScene {
    pub instances: Vec<RayObjectInstance>,
    pub tessel_instances: Vec<RayTesselInstance>,
    pub tree: BspTree,
    pub scene_box: BBox,
}

impl Record for RayScene {
    fn type_id(&self) -> RecordType {
        rtypes::RAY_SCENE
    }

    fn size_hint(&self) -> usize {
        self.instances.len() * mem::size_of::<RayObjectInstance>()
            + self.tessel_instances.len() * mem::size_of::<RayTesselInstance>()
            + self.tree.size_hint()
            + mem::size_of::<Self>()
    }
}

impl RayScene {
    pub fn empty() -> RayScene {
        RayScene {
            instances: Vec::new(),
            tessel_instances: Vec::new(),
            tree: BspTree::default(),
            scene_box: BBox::empty(),
        }
    }
}

/// Hit info captured for sort-mode traversal.
#[derive(Copy, Clone, Debug)]
pub struct RayHitInfo {
    pub hit_tessel_inst: u32,
    pub hit_tri: u32,
    pub hit_prim: u32,
    pub hit_motion: bool,
    pub hit_t: f32,
    pub bary: Vec3,
    pub bias: f32,
    pub bias_scale: f32,
    pub user_data: [f32; crate::state::MAX_USER_DATA],
}

impl Default for RayHitInfo {
    fn default() -> RayHitInfo {
        RayHitInfo {
            hit_tessel_inst: NULL_INDEX,
            hit_tri: NULL_INDEX,
            hit_prim: NULL_INDEX,
            hit_motion: false,
            hit_t: MAX_SCALAR,
            bary: Vec3::zeros(),
            bias: crate::state::RAY_BIAS,
            bias_scale: crate::state::RAY_BIAS_SCALE,
            user_data: [0.0; crate::state::MAX_USER_DATA],
        }
    }
}

/// Transforms a box through a matrix by its eight corners.
pub fn transform_bbox(m: &Mat4, b: &BBox) -> BBox {
    let mut out = BBox::empty();
    if b.is_empty() {
        return out;
    }
    for i in 0..8 {
        let p = Vec3::new(
            if i & 1 == 0 { b.min.x } else { b.max.x },
            if i & 2 == 0 { b.min.y } else { b.max.y },
            if i & 4 == 0 { b.min.z } else { b.max.z },
        );
        out.add_point(&point_transform(m, &p));
    }
    out
}
