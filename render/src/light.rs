//! Light instances collected at scene commit.

use crate::math::*;
use crate::nodesys::{Node, NodeSystem, StorageClass};
use ember_db::{Tag, Value, ValueType};

/// A committed light: the light node plus its world-space placement.
#[derive(Clone)]
pub struct LightInstance {
    pub light: Tag,
    pub origin: Vec3,
    pub energy: Vec3,
    pub emitter_list: Tag,
    /// Samples taken for area lights; point lights use one.
    pub samples: u32,
    pub cast_shadow: bool,
}

/// Declares the `light` node desc.
pub fn install_light_desc(nodesys: &NodeSystem) {
    let desc = nodesys.node_desc("light");
    nodesys.desc_add_parameter(
        desc,
        StorageClass::Constant,
        ValueType::Vec3,
        "origin",
        Value::Vec3([0.0; 3]),
    );
    nodesys.desc_add_parameter(
        desc,
        StorageClass::Constant,
        ValueType::Vec3,
        "energy",
        Value::Vec3([1.0; 3]),
    );
    nodesys.desc_add_parameter(
        desc,
        StorageClass::Constant,
        ValueType::Tag,
        "emitter_list",
        Value::Tag(Tag::null()),
    );
    nodesys.desc_add_parameter(
        desc,
        StorageClass::Constant,
        ValueType::Int,
        "samples",
        Value::Int(1),
    );
    nodesys.desc_add_parameter(
        desc,
        StorageClass::Constant,
        ValueType::Bool,
        "shadow",
        Value::Bool(true),
    );
    nodesys.end_node_desc(desc);
}

impl LightInstance {
    /// Snapshot of a committed light node placed by `transform`.
    pub fn from_node(nodesys: &NodeSystem, node: Tag, transform: &Mat4) -> LightInstance {
        let n = nodesys.db.read::<Node>(node);
        let origin = match n.get_parameter("origin") {
            Some(Value::Vec3(v)) => Vec3::new(v[0], v[1], v[2]),
            _ => Vec3::zeros(),
        };
        let energy = match n.get_parameter("energy") {
            Some(Value::Vec3(v)) => Vec3::new(v[0], v[1], v[2]),
            _ => Vec3::new(1.0, 1.0, 1.0),
        };
        let emitter_list = match n.get_parameter("emitter_list") {
            Some(Value::Tag(t)) => t,
            _ => Tag::null(),
        };
        let samples = match n.get_parameter("samples") {
            Some(Value::Int(s)) => s.max(1) as u32,
            _ => 1,
        };
        let cast_shadow = match n.get_parameter("shadow") {
            Some(Value::Bool(b)) => b,
            _ => true,
        };
        LightInstance {
            light: node,
            origin: point_transform(transform, &origin),
            energy,
            emitter_list,
            samples,
            cast_shadow,
        }
    }
}
