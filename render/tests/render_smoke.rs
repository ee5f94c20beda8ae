//! End-to-end frame rendering: flat shading, direct lighting against
//! the analytic value, and user output channel binding.

mod common;

use common::*;
use ember_render::framebuffer;
use ember_render::material::Material;
use ember_render::math::{Vec3, PI};
use ember_render::{Value, ValueType};

fn wall(ctx: &ember_render::RenderContext, name: &str) {
    quad_object(
        ctx,
        name,
        [
            [-3.0, -3.0, 4.0],
            [3.0, -3.0, 4.0],
            [3.0, 3.0, 4.0],
            [-3.0, 3.0, 4.0],
        ],
    );
}

#[test]
fn flat_shader_fills_the_frame() {
    let mut ctx = new_context(2);
    declare_test_shaders(&ctx);
    let mtl = ctx.material("m");
    let flat = ctx.shader("flat", "f").unwrap();
    ctx.nodesys
        .set_parameter(flat, "color", Value::Vec3([0.2, 0.4, 0.8]));
    ctx.end_shader(flat);
    Material::add_surface(&ctx.db, mtl, flat);
    wall(&ctx, "wall");
    place(&mut ctx, "wall_inst", "wall", Some("m"));
    ctx.instgroup("root", vec!["wall_inst".to_owned()]);
    setup_frame(&ctx, 16, &look_from(Vec3::zeros()));
    let out = ctx.render("opt", "cam", "root").unwrap();

    for y in [0u32, 7, 15].iter().copied() {
        let line = framebuffer::get_scanline(&ctx.db, out.color, y);
        for px in line {
            assert!((px[0] - 0.2).abs() < 1.0e-4, "bad pixel {:?}", px);
            assert!((px[1] - 0.4).abs() < 1.0e-4);
            assert!((px[2] - 0.8).abs() < 1.0e-4);
        }
    }
    let line = framebuffer::get_scanline(&ctx.db, out.opacity, 8);
    assert!((line[8][0] - 1.0).abs() < 1.0e-4);
}

#[test]
fn lambert_matches_the_analytic_point_light_value() {
    let mut ctx = new_context(1);
    declare_test_shaders(&ctx);
    let mtl = ctx.material("gray");
    let lam = ctx.shader("lambert", "l").unwrap();
    ctx.nodesys
        .set_parameter(lam, "Kd", Value::Vec3([0.7, 0.7, 0.7]));
    ctx.end_shader(lam);
    Material::add_surface(&ctx.db, mtl, lam);
    wall(&ctx, "wall");
    place(&mut ctx, "wall_inst", "wall", Some("gray"));

    // the light sits at the camera origin, 16 pi energy cancels the
    // falloff over the 4 unit distance
    let light = ctx.light("key").unwrap();
    ctx.nodesys
        .set_parameter(light, "origin", Value::Vec3([0.0, 0.0, 0.0]));
    let e = 16.0 * PI;
    ctx.nodesys
        .set_parameter(light, "energy", Value::Vec3([e, e, e]));
    ctx.end_light(light);
    place(&mut ctx, "key_inst", "key", None);

    ctx.instgroup(
        "root",
        vec!["wall_inst".to_owned(), "key_inst".to_owned()],
    );
    setup_frame(&ctx, 8, &look_from(Vec3::zeros()));
    let opt = ctx.options("opt").unwrap();
    ctx.nodesys.set_parameter(opt, "min_samples", Value::Int(2));
    ctx.nodesys.set_parameter(opt, "max_samples", Value::Int(2));
    ctx.end_options(opt);
    let out = ctx.render("opt", "cam", "root").unwrap();

    let px = framebuffer::get_pixel(&ctx.db, out.color, 4, 4);
    assert!(
        (px[0] - 0.7).abs() < 0.05,
        "lambert value {} too far from analytic 0.7",
        px[0]
    );
}

#[test]
fn output_channels_bind_by_parameter_name() {
    let mut ctx = new_context(1);
    declare_test_shaders(&ctx);
    ctx.declare_channel("Kd", ValueType::Vec3);
    let mtl = ctx.material("gray");
    let lam = ctx.shader("lambert", "l2").unwrap();
    ctx.nodesys
        .set_parameter(lam, "Kd", Value::Vec3([0.1, 0.6, 0.9]));
    ctx.end_shader(lam);
    Material::add_surface(&ctx.db, mtl, lam);
    wall(&ctx, "wall");
    place(&mut ctx, "wall_inst", "wall", Some("gray"));
    ctx.instgroup("root", vec!["wall_inst".to_owned()]);
    setup_frame(&ctx, 8, &look_from(Vec3::zeros()));
    let out = ctx.render("opt", "cam", "root").unwrap();

    assert_eq!(out.user.len(), 1);
    let (name, fb) = &out.user[0];
    assert_eq!(name, "Kd");
    let px = framebuffer::get_pixel(&ctx.db, *fb, 4, 4);
    assert!((px[0] - 0.1).abs() < 1.0e-4, "channel {:?}", px);
    assert!((px[1] - 0.6).abs() < 1.0e-4);
    assert!((px[2] - 0.9).abs() < 1.0e-4);
}

#[test]
fn quantization_respects_the_options() {
    let opt = ember_render::Options::default();
    let q = ember_render::sampler::quantize_value(&opt, 1.0, 0.0);
    assert_eq!(q, 255.0);
    let q = ember_render::sampler::quantize_value(&opt, -0.5, 0.0);
    assert_eq!(q, 0.0);
    let q = ember_render::sampler::quantize_value(&opt, 0.5, 0.0);
    assert!((q - 128.0).abs() <= 1.0);
}
