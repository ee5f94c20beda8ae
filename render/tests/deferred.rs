//! Deferred tessellation: placeholders dice only when a ray descends
//! into them, and untouched placeholders stay reclaimable.

mod common;

use common::*;
use ember_render::math::Vec3;
use ember_render::rt::{RayScene, RayTessel};
use ember_render::Value;

fn deferred_quad(ctx: &mut ember_render::RenderContext, name: &str, center_x: f32) {
    let obj = ctx.object("poly", name).unwrap();
    let pos = ctx.vec3_array(vec![
        [center_x - 1.0, -1.0, 4.0],
        [center_x + 1.0, -1.0, 4.0],
        [center_x + 1.0, 1.0, 4.0],
        [center_x - 1.0, 1.0, 4.0],
    ]);
    let tris = ctx.index_array(vec![0, 1, 2, 0, 2, 3]);
    ctx.nodesys.set_parameter(obj, "pos_list", Value::Tag(pos));
    ctx.nodesys
        .set_parameter(obj, "triangle_list", Value::Tag(tris));
    ctx.nodesys
        .set_parameter(obj, "deferred_dice", Value::Bool(true));
    ctx.end_object(obj);
    let inst = format!("{}_inst", name);
    place(ctx, &inst, name, None);
}

#[test]
fn unseen_placeholder_is_never_diced_and_gc_reclaims_it() {
    let mut ctx = new_context(1);
    declare_test_shaders(&ctx);
    // one quad in front of the camera, one far outside every ray
    deferred_quad(&mut ctx, "seen", 0.0);
    deferred_quad(&mut ctx, "unseen", 500.0);
    ctx.instgroup(
        "root",
        vec!["seen_inst".to_owned(), "unseen_inst".to_owned()],
    );
    setup_frame(&ctx, 8, &look_from(Vec3::zeros()));
    ctx.render("opt", "cam", "root").unwrap();

    let scene = ctx.rt.db.read::<RayScene>(ctx.rt.scene_tag());
    let mut seen_diced = false;
    let mut unseen_placeholder = false;
    for tinst in scene.tessel_instances.iter() {
        let tessel = ctx.db.read::<RayTessel>(tinst.tessel);
        if tessel.is_placeholder() {
            // the sub-BSP of an untouched placeholder stays
            // uninstantiated
            assert!(tessel.subtree.is_null());
            unseen_placeholder = true;
        } else if !tessel.triangles.is_empty() {
            seen_diced = true;
        }
    }
    drop(scene);
    assert!(seen_diced, "the visible placeholder never diced");
    assert!(unseen_placeholder, "the unseen placeholder diced eagerly");

    let stats = ctx.db.gc();
    assert!(stats.evicted > 0, "gc reclaimed nothing");
}

#[test]
fn diced_geometry_is_visible() {
    let mut ctx = new_context(1);
    declare_test_shaders(&ctx);
    let mtl = ctx.material("white");
    let flat = ctx.shader("flat", "flat_white").unwrap();
    ctx.nodesys
        .set_parameter(flat, "color", Value::Vec3([1.0, 1.0, 1.0]));
    ctx.end_shader(flat);
    ember_render::material::Material::add_surface(&ctx.db, mtl, flat);

    let obj = ctx.object("poly", "wall").unwrap();
    let pos = ctx.vec3_array(vec![
        [-3.0, -3.0, 4.0],
        [3.0, -3.0, 4.0],
        [3.0, 3.0, 4.0],
        [-3.0, 3.0, 4.0],
    ]);
    let tris = ctx.index_array(vec![0, 1, 2, 0, 2, 3]);
    ctx.nodesys.set_parameter(obj, "pos_list", Value::Tag(pos));
    ctx.nodesys
        .set_parameter(obj, "triangle_list", Value::Tag(tris));
    ctx.nodesys
        .set_parameter(obj, "deferred_dice", Value::Bool(true));
    ctx.end_object(obj);
    place(&mut ctx, "wall_inst", "wall", Some("white"));
    ctx.instgroup("root", vec!["wall_inst".to_owned()]);
    setup_frame(&ctx, 8, &look_from(Vec3::zeros()));
    let out = ctx.render("opt", "cam", "root").unwrap();

    let px = ember_render::framebuffer::get_pixel(&ctx.db, out.color, 4, 4);
    assert!(
        (px[0] - 1.0).abs() < 1.0e-4,
        "deferred-diced wall invisible, center pixel {:?}",
        px
    );
}
