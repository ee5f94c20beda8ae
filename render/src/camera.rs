//! The render camera: resolution, film geometry, transforms and the
//! shader lists attached to the lens.

use crate::math::*;
use crate::nodesys::{Node, NodeSystem, StorageClass};
use ember_db::{Tag, Value, ValueType};

#[derive(Clone)]
pub struct Camera {
    pub res_x: u32,
    pub res_y: u32,
    /// Horizontal film width at the focal plane.
    pub aperture: f32,
    pub aspect: f32,
    pub focal: f32,
    pub clip_hither: f32,
    pub clip_yon: f32,
    pub camera_to_world: Mat4,
    pub motion_camera_to_world: Mat4,
    pub lens_list: Tag,
    pub environment_list: Tag,
    pub imager_list: Tag,
}

impl Default for Camera {
    fn default() -> Camera {
        Camera {
            res_x: 640,
            res_y: 480,
            aperture: 1.0,
            aspect: 4.0 / 3.0,
            focal: 1.0,
            clip_hither: 0.001,
            clip_yon: MAX_SCALAR,
            camera_to_world: Mat4::identity(),
            motion_camera_to_world: Mat4::identity(),
            lens_list: Tag::null(),
            environment_list: Tag::null(),
            imager_list: Tag::null(),
        }
    }
}

impl Camera {
    /// Primary ray through raster position `(x, y)` at `time`, in
    /// world space. The camera looks down its local `+z`.
    pub fn primary_ray(&self, x: f32, y: f32, time: f32) -> (Vec3, Vec3) {
        let fx = (x / self.res_x as f32 - 0.5) * self.aperture;
        let fy = (0.5 - y / self.res_y as f32) * self.aperture / self.aspect;
        let dir_cam = Vec3::new(fx, fy, self.focal);
        let org_cam = Vec3::zeros();
        let c2w = if self.camera_to_world == self.motion_camera_to_world {
            self.camera_to_world
        } else {
            let mut m = self.camera_to_world;
            let m2 = self.motion_camera_to_world;
            for c in 0..4 {
                for r in 0..4 {
                    m[(r, c)] = lerp(m[(r, c)], m2[(r, c)], time);
                }
            }
            m
        };
        let org = point_transform(&c2w, &org_cam);
        let dir = glm::normalize(&vector_transform(&c2w, &dir_cam));
        (org, dir)
    }

    /// Approximate world-space footprint of one pixel at unit distance.
    pub fn pixel_size(&self) -> f32 {
        self.aperture / (self.focal.max(SCALAR_EPS) * self.res_x as f32)
    }
}

/// Declares the `camera` node desc.
pub fn install_camera_desc(nodesys: &NodeSystem) {
    let d = Camera::default();
    let desc = nodesys.node_desc("camera");
    let add = |name: &str, ty: ValueType, value: Value| {
        nodesys.desc_add_parameter(desc, StorageClass::Constant, ty, name, value);
    };
    add("res_x", ValueType::Int, Value::Int(d.res_x as i32));
    add("res_y", ValueType::Int, Value::Int(d.res_y as i32));
    add("aperture", ValueType::Scalar, Value::Scalar(d.aperture));
    add("aspect", ValueType::Scalar, Value::Scalar(d.aspect));
    add("focal", ValueType::Scalar, Value::Scalar(d.focal));
    add("clip_hither", ValueType::Scalar, Value::Scalar(d.clip_hither));
    add("clip_yon", ValueType::Scalar, Value::Scalar(d.clip_yon));
    add(
        "transform",
        ValueType::Matrix,
        Value::Matrix(ember_db::value::identity_matrix()),
    );
    add(
        "motion_transform",
        ValueType::Matrix,
        Value::Matrix(ember_db::value::identity_matrix()),
    );
    add("lens_list", ValueType::Tag, Value::Tag(Tag::null()));
    add("environment_list", ValueType::Tag, Value::Tag(Tag::null()));
    add("imager_list", ValueType::Tag, Value::Tag(Tag::null()));
    nodesys.end_node_desc(desc);
}

fn matrix_param(nodesys: &NodeSystem, node: Tag, name: &str) -> Mat4 {
    match nodesys.db.read::<Node>(node).get_parameter(name) {
        Some(Value::Matrix(m)) => {
            let mut out = Mat4::identity();
            for r in 0..4 {
                for c in 0..4 {
                    out[(r, c)] = m[r][c];
                }
            }
            out
        }
        _ => Mat4::identity(),
    }
}

impl Camera {
    /// Snapshot of a committed `camera` node.
    pub fn from_node(nodesys: &NodeSystem, node: Tag) -> Camera {
        let n = nodesys.db.read::<Node>(node);
        let mut c = Camera::default();
        if let Some(Value::Int(v)) = n.get_parameter("res_x") {
            c.res_x = v.max(1) as u32;
        }
        if let Some(Value::Int(v)) = n.get_parameter("res_y") {
            c.res_y = v.max(1) as u32;
        }
        if let Some(Value::Scalar(v)) = n.get_parameter("aperture") {
            c.aperture = v;
        }
        if let Some(Value::Scalar(v)) = n.get_parameter("aspect") {
            c.aspect = v;
        }
        if let Some(Value::Scalar(v)) = n.get_parameter("focal") {
            c.focal = v;
        }
        if let Some(Value::Scalar(v)) = n.get_parameter("clip_hither") {
            c.clip_hither = v;
        }
        if let Some(Value::Scalar(v)) = n.get_parameter("clip_yon") {
            c.clip_yon = v;
        }
        if let Some(Value::Tag(t)) = n.get_parameter("lens_list") {
            c.lens_list = t;
        }
        if let Some(Value::Tag(t)) = n.get_parameter("environment_list") {
            c.environment_list = t;
        }
        if let Some(Value::Tag(t)) = n.get_parameter("imager_list") {
            c.imager_list = t;
        }
        drop(n);
        c.camera_to_world = matrix_param(nodesys, node, "transform");
        c.motion_camera_to_world = matrix_param(nodesys, node, "motion_transform");
        c
    }
}
