#![allow(dead_code)]

//! Shared scene builders and built-in test shaders.

use ember_render::illum;
use ember_render::math::{glm, mat4_to_rows, Mat4, Vec3, Vec4};
use ember_render::nodesys::{NodeObject, NodeSystem};
use ember_render::obj::IFACE_NODESYS;
use ember_render::shader;
use ember_render::state::State;
use ember_render::{InstanceDef, RenderContext, Value, ValueType};
use std::any::Any;

pub fn test_config(threads: usize) -> config::Config {
    let mut cfg = config::Config::new();
    cfg.set("render.threads", threads as i64).unwrap();
    cfg
}

pub fn new_context(threads: usize) -> RenderContext {
    let _ = pretty_env_logger::try_init();
    RenderContext::new(&test_config(threads)).unwrap()
}

fn nodesys_of(state: &State) -> std::sync::Arc<NodeSystem> {
    state.db().interface::<NodeSystem>(IFACE_NODESYS).unwrap()
}

fn vec3_param(v: &Value) -> Vec3 {
    match v {
        Value::Vec3(c) => Vec3::new(c[0], c[1], c[2]),
        _ => Vec3::zeros(),
    }
}

/// Writes its `color` parameter straight to the sample.
pub struct FlatShader;

impl NodeObject for FlatShader {
    fn main(&self, result: &mut Vec4, state: &mut State, _arg: Option<&mut dyn Any>) -> bool {
        let ns = nodesys_of(state);
        let color = vec3_param(&shader::eval(&ns, state, 0));
        *result = Vec4::new(color.x, color.y, color.z, 1.0);
        state.result.color = color;
        state.result.opacity = Vec3::new(1.0, 1.0, 1.0);
        true
    }
}

/// Diffuse direct lighting over the committed lights.
pub struct LambertShader;

impl NodeObject for LambertShader {
    fn main(&self, result: &mut Vec4, state: &mut State, _arg: Option<&mut dyn Any>) -> bool {
        let ns = nodesys_of(state);
        let kd = vec3_param(&shader::eval(&ns, state, 0));
        let mut color = Vec3::zeros();
        let n = if state.dot_nd > 0.0 { -state.n } else { state.n };
        for i in 0..illum::num_lights(state) {
            if !illum::sample_light(state, i) {
                break;
            }
            let cos = glm::dot(&n, &state.l).max(0.0);
            let cl = state.cl;
            color += Vec3::new(kd.x * cl.x, kd.y * cl.y, kd.z * cl.z)
                * (cos * (1.0 / std::f32::consts::PI));
        }
        *result = Vec4::new(color.x, color.y, color.z, 1.0);
        state.result.color = color;
        state.result.opacity = Vec3::new(1.0, 1.0, 1.0);
        true
    }
}

/// Shadow shader returning its `transparency` parameter.
pub struct ShadowTransShader;

impl NodeObject for ShadowTransShader {
    fn main(&self, result: &mut Vec4, state: &mut State, _arg: Option<&mut dyn Any>) -> bool {
        let ns = nodesys_of(state);
        let t = vec3_param(&shader::eval(&ns, state, 0));
        *result = Vec4::new(t.x, t.y, t.z, 1.0);
        true
    }
}

pub fn declare_test_shaders(ctx: &RenderContext) {
    ctx.declare_shader(
        "flat",
        &[("color", ValueType::Vec3, Value::Vec3([1.0, 1.0, 1.0]))],
        Box::new(|| Box::new(FlatShader)),
    );
    ctx.declare_shader(
        "lambert",
        &[("Kd", ValueType::Vec3, Value::Vec3([0.7, 0.7, 0.7]))],
        Box::new(|| Box::new(LambertShader)),
    );
    ctx.declare_shader(
        "shadowtrans",
        &[(
            "transparency",
            ValueType::Vec3,
            Value::Vec3([1.0, 1.0, 1.0]),
        )],
        Box::new(|| Box::new(ShadowTransShader)),
    );
}

/// A quad as a two-triangle polygon mesh object.
pub fn quad_object(ctx: &RenderContext, name: &str, corners: [[f32; 3]; 4]) {
    let obj = ctx.object("poly", name).unwrap();
    let pos = ctx.vec3_array(corners.to_vec());
    let tris = ctx.index_array(vec![0, 1, 2, 0, 2, 3]);
    ctx.nodesys.set_parameter(obj, "pos_list", Value::Tag(pos));
    ctx.nodesys
        .set_parameter(obj, "triangle_list", Value::Tag(tris));
    ctx.end_object(obj);
}

/// Options + camera pair for a small deterministic render.
pub fn setup_frame(ctx: &RenderContext, res: u32, cam_transform: &Mat4) {
    let opt = ctx.options("opt").unwrap();
    ctx.nodesys.set_parameter(opt, "min_samples", Value::Int(0));
    ctx.nodesys.set_parameter(opt, "max_samples", Value::Int(0));
    ctx.nodesys.set_parameter(opt, "bucket_size", Value::Int(16));
    ctx.end_options(opt);
    let cam = ctx.camera("cam").unwrap();
    ctx.nodesys.set_parameter(cam, "res_x", Value::Int(res as i32));
    ctx.nodesys.set_parameter(cam, "res_y", Value::Int(res as i32));
    ctx.nodesys.set_parameter(cam, "aspect", Value::Scalar(1.0));
    ctx.nodesys.set_parameter(
        cam,
        "transform",
        Value::Matrix(mat4_to_rows(cam_transform)),
    );
    ctx.end_camera(cam);
}

/// Places an instance with an identity transform.
pub fn place(ctx: &mut RenderContext, inst_name: &str, element: &str, material: Option<&str>) {
    ctx.instance(
        inst_name,
        InstanceDef {
            element: element.to_owned(),
            material: material.map(|m| m.to_owned()),
            ..InstanceDef::default()
        },
    );
}

pub fn look_from(origin: Vec3) -> Mat4 {
    glm::translation(&origin)
}
