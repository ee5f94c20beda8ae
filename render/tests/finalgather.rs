//! The irradiance cache: constant-field reconstruction and reuse of
//! cached records across renders.

mod common;

use common::*;
use ember_render::fg::{self, Irradiance, IrradianceGradient};
use ember_render::map;
use ember_render::material::Material;
use ember_render::math::{Vec3, PI};
use ember_render::nodesys::{NodeObject, NodeSystem};
use ember_render::obj::IFACE_NODESYS;
use ember_render::rtypes;
use ember_render::shader;
use ember_render::state::State;
use ember_render::math::Vec4;
use ember_render::{Value, ValueType};
use std::any::Any;

#[test]
fn zero_gradients_reconstruct_piecewise_constant() {
    let ctx = new_context(1);
    let map_tag = map::create_map::<Irradiance>(
        &ctx.db,
        rtypes::IRRAD_TABLE,
        rtypes::IRRAD_BLOCK,
        1000,
    );
    let e = Vec3::new(0.3, 0.6, 0.9);
    let n = Vec3::new(0.0, 1.0, 0.0);
    let zero = IrradianceGradient::default();
    let mut records = Vec::new();
    for i in 0..25 {
        let p = Vec3::new((i % 5) as f32, 0.0, (i / 5) as f32);
        records.push(Irradiance::init(&p, &n, &e, &zero, &zero, 1.0));
    }
    map::map_store_points(&ctx.db, map_tag, &records);
    map::map_balance::<Irradiance>(&ctx.db, map_tag);

    for q in [
        Vec3::new(0.1, 0.0, 0.1),
        Vec3::new(2.5, 0.0, 2.5),
        Vec3::new(3.9, 0.0, 1.2),
    ]
    .iter()
    {
        let mut l = Vec3::zeros();
        let mut w = 0.0f32;
        let mut available = 0u32;
        fg::irrad_cache_find(
            &ctx.db, map_tag, &mut l, q, &n, 1.0, 5.0, 8, &mut w, &mut available,
        );
        assert!(available > 0, "no records accepted at {:?}", q);
        let reconstructed = l / w;
        let expected = e / PI;
        for k in 0..3 {
            assert!(
                (reconstructed[k] - expected[k]).abs() < 1.0e-3,
                "constant field not reproduced at {:?}: {} vs {}",
                q,
                reconstructed[k],
                expected[k]
            );
        }
    }
}

/// Surface shader adding the interpolated indirect term.
struct IndirectShader;

impl NodeObject for IndirectShader {
    fn main(&self, result: &mut Vec4, state: &mut State, _arg: Option<&mut dyn Any>) -> bool {
        let ns = state
            .db()
            .interface::<NodeSystem>(IFACE_NODESYS)
            .unwrap();
        let kd = match shader::eval(&ns, state, 0) {
            Value::Vec3(c) => Vec3::new(c[0], c[1], c[2]),
            _ => Vec3::zeros(),
        };
        let mut irrad = Vec3::zeros();
        fg::compute_irradiance(&mut irrad, state);
        let color = Vec3::new(kd.x * irrad.x, kd.y * irrad.y, kd.z * irrad.z) + kd * 0.01;
        *result = Vec4::new(color.x, color.y, color.z, 1.0);
        state.result.color = color;
        state.result.opacity = Vec3::new(1.0, 1.0, 1.0);
        true
    }
}

#[test]
fn irradiance_cache_is_reused_on_the_second_render() {
    let mut ctx = new_context(1);
    declare_test_shaders(&ctx);
    ctx.declare_shader(
        "indirect",
        &[("Kd", ValueType::Vec3, Value::Vec3([0.7, 0.7, 0.7]))],
        Box::new(|| Box::new(IndirectShader)),
    );
    let mtl = ctx.material("gi");
    let sh = ctx.shader("indirect", "gi0").unwrap();
    ctx.end_shader(sh);
    Material::add_surface(&ctx.db, mtl, sh);
    quad_object(
        &ctx,
        "floor",
        [
            [-4.0, -4.0, 4.0],
            [4.0, -4.0, 4.0],
            [4.0, 4.0, 4.0],
            [-4.0, 4.0, 4.0],
        ],
    );
    place(&mut ctx, "floor_inst", "floor", Some("gi"));
    ctx.instgroup("root", vec!["floor_inst".to_owned()]);
    setup_frame(&ctx, 8, &look_from(Vec3::zeros()));
    let opt = ctx.options("opt").unwrap();
    ctx.nodesys.set_parameter(opt, "finalgather", Value::Bool(true));
    ctx.nodesys
        .set_parameter(opt, "finalgather_rays", Value::Int(64));
    ctx.nodesys
        .set_parameter(opt, "finalgather_samples", Value::Int(16));
    ctx.end_options(opt);

    let out1 = ctx.render("opt", "cam", "root").unwrap();
    let fg_map = ctx.finalgather_map().expect("irradiance cache missing");
    let s1 = map::map_size(&ctx.db, fg_map);
    assert!(s1 > 0, "first render cached no irradiance");
    let px1 = ember_render::framebuffer::get_pixel(&ctx.db, out1.color, 4, 4);

    let out2 = ctx.render("opt", "cam", "root").unwrap();
    let s2 = map::map_size(&ctx.db, fg_map);
    assert!(
        s2 <= s1 + (s1 / 10).max(2),
        "second render resampled the hemisphere: {} -> {}",
        s1,
        s2
    );
    let px2 = ember_render::framebuffer::get_pixel(&ctx.db, out2.color, 4, 4);
    for k in 0..3 {
        assert!(
            (px1[k] - px2[k]).abs() < 0.05,
            "images diverged between renders: {:?} vs {:?}",
            px1,
            px2
        );
    }
}
