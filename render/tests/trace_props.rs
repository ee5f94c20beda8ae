//! Traversal soundness: the nearest hit found through the two-level
//! BSP must match brute-force intersection over every triangle.

mod common;

use common::*;
use ember_render::math::{glm, Vec3};
use ember_render::rt::trace::{self, intersect_triangle, TraceMode};
use ember_render::rt::{RayScene, RayTessel};
use ember_render::sampler::{BaseBucket, BucketType, PassParams};
use ember_render::state::{RayType, State};
use ember_render::tls::RayTls;
use ember_render::RenderContext;
use std::cell::RefCell;
use std::sync::Arc;

/// Small deterministic generator for scattered geometry.
struct Lcg(u64);

impl Lcg {
    fn next_f32(&mut self) -> f32 {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        ((self.0 >> 33) as u32 as f64 / u32::max_value() as f64) as f32
    }

    fn in_range(&mut self, lo: f32, hi: f32) -> f32 {
        lo + self.next_f32() * (hi - lo)
    }
}

fn build_soup(ctx: &mut RenderContext, num_tris: usize) {
    let mut rng = Lcg(0x1234_5678);
    let mut pos = Vec::new();
    let mut tris = Vec::new();
    for i in 0..num_tris {
        let cx = rng.in_range(-4.0, 4.0);
        let cy = rng.in_range(-4.0, 4.0);
        let cz = rng.in_range(2.0, 10.0);
        for _ in 0..3 {
            pos.push([
                cx + rng.in_range(-0.8, 0.8),
                cy + rng.in_range(-0.8, 0.8),
                cz + rng.in_range(-0.8, 0.8),
            ]);
        }
        tris.push(i as u32 * 3);
        tris.push(i as u32 * 3 + 1);
        tris.push(i as u32 * 3 + 2);
    }
    let obj = ctx.object("poly", "soup").unwrap();
    let pos_tag = ctx.vec3_array(pos);
    let tri_tag = ctx.index_array(tris);
    ctx.nodesys
        .set_parameter(obj, "pos_list", ember_render::Value::Tag(pos_tag));
    ctx.nodesys
        .set_parameter(obj, "triangle_list", ember_render::Value::Tag(tri_tag));
    ctx.end_object(obj);
    place(ctx, "soup_inst", "soup", None);
    ctx.instgroup("root", vec!["soup_inst".to_owned()]);
}

fn bare_bucket(ctx: &RenderContext) -> Arc<BaseBucket> {
    Arc::new(BaseBucket {
        db: ctx.db.clone(),
        opt: Arc::new(ember_render::Options::default()),
        cam: Arc::new(ember_render::camera::Camera::default()),
        bucket_type: BucketType::Frame,
        pass: PassParams::default(),
        channels: Vec::new(),
        num_user_channels: 0,
        lights: Arc::new(Vec::new()),
        framebuffers: Arc::new(Vec::new()),
    })
}

/// Brute-force nearest intersection over every triangle of the scene.
fn brute_force(ctx: &RenderContext, org: &Vec3, dir: &Vec3) -> Option<f32> {
    let scene = ctx.rt.db.read::<RayScene>(ctx.rt.scene_tag());
    let mut best: Option<f32> = None;
    for tinst in scene.tessel_instances.iter() {
        let tessel = ctx.db.read::<RayTessel>(tinst.tessel);
        for tri in tessel.triangles.iter() {
            let a = tessel.vertices[tri.v1 as usize].pos;
            let b = tessel.vertices[tri.v2 as usize].pos;
            let c = tessel.vertices[tri.v3 as usize].pos;
            let e1 = b - a;
            let e2 = c - a;
            if let Some((t, _, _)) = intersect_triangle(org, dir, &a, &e1, &e2) {
                if best.map_or(true, |bt| t < bt) {
                    best = Some(t);
                }
            }
        }
    }
    best
}

#[test]
fn nearest_traversal_matches_brute_force() {
    let mut ctx = new_context(1);
    declare_test_shaders(&ctx);
    build_soup(&mut ctx, 120);
    setup_frame(&ctx, 4, &look_from(Vec3::zeros()));
    ctx.render("opt", "cam", "root").unwrap();

    let bucket = bare_bucket(&ctx);
    let tls = RefCell::new(RayTls::new());
    let mut rng = Lcg(0xfeed_beef);
    let mut tested_hits = 0;
    for _ in 0..200 {
        let org = Vec3::new(
            rng.in_range(-5.0, 5.0),
            rng.in_range(-5.0, 5.0),
            rng.in_range(-2.0, 0.0),
        );
        let target = Vec3::new(
            rng.in_range(-4.0, 4.0),
            rng.in_range(-4.0, 4.0),
            rng.in_range(2.0, 10.0),
        );
        let dir = glm::normalize(&(target - org));

        let mut state = State::new(RayType::Eye, &bucket, &tls);
        state.org = org;
        state.dir = dir;
        let hit = trace::trace(&ctx.rt, &mut state, TraceMode::Nearest, |_| true);

        let expected = brute_force(&ctx, &org, &dir);
        match expected {
            Some(t) => {
                assert!(hit, "BSP missed a hit at t={}", t);
                assert!(
                    (state.hit_t - t).abs() <= 5.0e-4 + t * 1.0e-4,
                    "BSP hit_t {} differs from brute force {}",
                    state.hit_t,
                    t
                );
                tested_hits += 1;
            }
            None => {
                assert!(!hit, "BSP reported a phantom hit at t={}", state.hit_t);
            }
        }
    }
    assert!(tested_hits > 20, "test rays barely hit the soup");
}

#[test]
fn rerendering_reproduces_pixel_bytes() {
    let render_once = || -> Vec<[f32; 4]> {
        let mut ctx = new_context(1);
        declare_test_shaders(&ctx);
        let mtl = ctx.material("gray");
        let flat = ctx.shader("flat", "flat_gray").unwrap();
        ctx.nodesys.set_parameter(
            flat,
            "color",
            ember_render::Value::Vec3([0.25, 0.5, 0.75]),
        );
        ctx.end_shader(flat);
        ember_render::material::Material::add_surface(&ctx.db, mtl, flat);
        quad_object(
            &ctx,
            "wall",
            [
                [-3.0, -3.0, 4.0],
                [3.0, -3.0, 4.0],
                [3.0, 3.0, 4.0],
                [-3.0, 3.0, 4.0],
            ],
        );
        place(&mut ctx, "wall_inst", "wall", Some("gray"));
        ctx.instgroup("root", vec!["wall_inst".to_owned()]);
        setup_frame(&ctx, 16, &look_from(Vec3::zeros()));
        let out = ctx.render("opt", "cam", "root").unwrap();
        let mut pixels = Vec::new();
        for y in 0..16 {
            pixels.extend(ember_render::framebuffer::get_scanline(
                &ctx.db, out.color, y,
            ));
        }
        pixels
    };
    let a = render_once();
    let b = render_once();
    assert_eq!(a.len(), b.len());
    for (pa, pb) in a.iter().zip(b.iter()) {
        for k in 0..4 {
            assert!(
                pa[k].to_bits() == pb[k].to_bits(),
                "pixel bytes differ between identical renders"
            );
        }
    }
}
