//! Transparent shadow traversal: occluders replay in distance order
//! and their transparencies multiply, independent of scene order.

mod common;

use common::*;
use ember_render::camera::Camera;
use ember_render::material::Material;
use ember_render::math::Vec3;
use ember_render::options::Options;
use ember_render::sampler::{BaseBucket, BucketType, PassParams};
use ember_render::state::{RayType, State};
use ember_render::tls::RayTls;
use ember_render::{illum, RenderContext, Value};
use std::cell::RefCell;
use std::sync::Arc;

fn translucent_quad(ctx: &mut RenderContext, name: &str, z: f32, transparency: f32) {
    let mtl_name = format!("mtl_{}", name);
    let mtl = ctx.material(&mtl_name);
    let shader_name = format!("st_{}", name);
    let st = ctx.shader("shadowtrans", &shader_name).unwrap();
    ctx.nodesys.set_parameter(
        st,
        "transparency",
        Value::Vec3([transparency, transparency, transparency]),
    );
    ctx.end_shader(st);
    Material::add_shadow(&ctx.db, mtl, st);
    quad_object(
        ctx,
        name,
        [
            [-2.0, -2.0, z],
            [2.0, -2.0, z],
            [2.0, 2.0, z],
            [-2.0, 2.0, z],
        ],
    );
    let inst_name = format!("{}_inst", name);
    place(ctx, &inst_name, name, Some(&mtl_name));
}

fn shadow_through(order_swapped: bool) -> Vec3 {
    let mut ctx = new_context(1);
    declare_test_shaders(&ctx);
    let (trans_near, trans_far) = if order_swapped { (0.3, 0.5) } else { (0.5, 0.3) };
    translucent_quad(&mut ctx, "near_quad", 3.0, trans_near);
    translucent_quad(&mut ctx, "far_quad", 6.0, trans_far);
    ctx.instgroup(
        "root",
        vec!["near_quad_inst".to_owned(), "far_quad_inst".to_owned()],
    );
    setup_frame(&ctx, 2, &look_from(Vec3::new(50.0, 0.0, 0.0)));
    ctx.render("opt", "cam", "root").unwrap();

    let bucket = Arc::new(BaseBucket {
        db: ctx.db.clone(),
        opt: Arc::new(Options::default()),
        cam: Arc::new(Camera::default()),
        bucket_type: BucketType::Frame,
        pass: PassParams::default(),
        channels: Vec::new(),
        num_user_channels: 0,
        lights: Arc::new(Vec::new()),
        framebuffers: Arc::new(Vec::new()),
    });
    let tls = RefCell::new(RayTls::new());
    let mut state = State::new(RayType::Eye, &bucket, &tls);
    // off the quad diagonals so each occluder registers exactly once
    state.p = Vec3::new(0.3, 0.7, 0.0);
    state.ng = Vec3::new(0.0, 0.0, 1.0);
    state.n = state.ng;
    // the light sits behind both quads
    illum::trace_shadow(&mut state, &Vec3::new(0.3, 0.7, 10.0))
}

#[test]
fn transparent_shadow_transmittance_multiplies() {
    let t = shadow_through(false);
    assert!(
        (t.x - 0.15).abs() < 1.0e-3,
        "transmittance {} != 0.5 * 0.3",
        t.x
    );
}

#[test]
fn transmittance_is_order_independent() {
    let a = shadow_through(false);
    let b = shadow_through(true);
    assert!((a.x - b.x).abs() < 1.0e-5);
    assert!((a.x - 0.15).abs() < 1.0e-3);
}

#[test]
fn opaque_occluder_blocks_completely() {
    let mut ctx = new_context(1);
    declare_test_shaders(&ctx);
    // a quad with a material but no shadow shader is opaque
    let mtl = ctx.material("opaque");
    let flat = ctx.shader("flat", "flat_opaque").unwrap();
    ctx.end_shader(flat);
    Material::add_surface(&ctx.db, mtl, flat);
    quad_object(
        &ctx,
        "blocker",
        [
            [-2.0, -2.0, 4.0],
            [2.0, -2.0, 4.0],
            [2.0, 2.0, 4.0],
            [-2.0, 2.0, 4.0],
        ],
    );
    place(&mut ctx, "blocker_inst", "blocker", Some("opaque"));
    ctx.instgroup("root", vec!["blocker_inst".to_owned()]);
    setup_frame(&ctx, 2, &look_from(Vec3::new(50.0, 0.0, 0.0)));
    ctx.render("opt", "cam", "root").unwrap();

    let bucket = Arc::new(BaseBucket {
        db: ctx.db.clone(),
        opt: Arc::new(Options::default()),
        cam: Arc::new(Camera::default()),
        bucket_type: BucketType::Frame,
        pass: PassParams::default(),
        channels: Vec::new(),
        num_user_channels: 0,
        lights: Arc::new(Vec::new()),
        framebuffers: Arc::new(Vec::new()),
    });
    let tls = RefCell::new(RayTls::new());
    let mut state = State::new(RayType::Eye, &bucket, &tls);
    state.p = Vec3::new(0.3, 0.7, 0.0);
    state.ng = Vec3::new(0.0, 0.0, 1.0);
    state.n = state.ng;
    let t = illum::trace_shadow(&mut state, &Vec3::new(0.3, 0.7, 10.0));
    assert_eq!(t, Vec3::zeros());
}
