//! Photon emission, storage and balanced lookup through the full pass.

mod common;

use common::*;
use ember_render::map::{self, MapLookup, MapPoint};
use ember_render::math::Vec3;
use ember_render::photon::Photon;
use ember_render::Value;

#[test]
fn globillum_pass_fills_and_balances_the_map() {
    let mut ctx = new_context(1);
    declare_test_shaders(&ctx);

    // a diffuse floor under a point light; the default photon behavior
    // deposits and absorbs at the first diffuse hit
    let mtl = ctx.material("floor");
    let lam = ctx.shader("lambert", "floor_lambert").unwrap();
    ctx.end_shader(lam);
    ember_render::material::Material::add_surface(&ctx.db, mtl, lam);
    quad_object(
        &ctx,
        "floor",
        [
            [-5.0, -1.0, -5.0],
            [5.0, -1.0, -5.0],
            [5.0, -1.0, 5.0],
            [-5.0, -1.0, 5.0],
        ],
    );
    place(&mut ctx, "floor_inst", "floor", Some("floor"));

    let light = ctx.light("key").unwrap();
    ctx.nodesys
        .set_parameter(light, "origin", Value::Vec3([0.0, 3.0, 0.0]));
    ctx.nodesys
        .set_parameter(light, "energy", Value::Vec3([10.0, 10.0, 10.0]));
    ctx.end_light(light);
    place(&mut ctx, "key_inst", "key", None);

    ctx.instgroup(
        "root",
        vec!["floor_inst".to_owned(), "key_inst".to_owned()],
    );
    setup_frame(&ctx, 4, &look_from(Vec3::new(0.0, 0.0, -4.0)));
    let opt = ctx.options("opt").unwrap();
    ctx.nodesys.set_parameter(opt, "globillum", Value::Bool(true));
    ctx.nodesys
        .set_parameter(opt, "globillum_photons", Value::Int(2000));
    ctx.end_options(opt);

    let out = ctx.render("opt", "cam", "root").unwrap();
    assert!(!out.globillum_map.is_null());
    let stored = map::map_size(&ctx.db, out.globillum_map);
    assert!(
        stored > 500,
        "only {} photons reached the floor",
        stored
    );

    // every stored photon must find itself as its nearest neighbour
    let mut positions = Vec::new();
    map::map_traverse::<Photon>(&ctx.db, out.globillum_map, |p| {
        positions.push(p.position());
        positions.len() < 64
    });
    for pos in positions {
        let mut np = MapLookup::new(pos, 4, 100.0);
        map::map_locate_points::<Photon>(&ctx.db, out.globillum_map, &mut np, 1, |_, _| true);
        assert!(np.found > 0);
        let best = (1..=np.found)
            .map(|i| np.dist2[i])
            .fold(f32::INFINITY, f32::min);
        assert!(
            best < 1.0e-8,
            "own emission point is not the nearest neighbour (d2 = {})",
            best
        );
        // photons land on the floor plane
        assert!((pos.y - (-1.0)).abs() < 1.0e-3);
    }

    // the balanced heap keeps children on the correct side of parents
    let stored = map::map_size(&ctx.db, out.globillum_map);
    let half = ctx
        .db
        .read::<map::Map>(out.globillum_map)
        .half_stored_points;
    for i in 2..=stored.min(512) {
        if i / 2 >= half {
            continue;
        }
        let parent = map::map_get::<Photon>(&ctx.db, out.globillum_map, i / 2);
        let child = map::map_get::<Photon>(&ctx.db, out.globillum_map, i);
        let axis = parent.plane() as usize;
        if i % 2 == 0 {
            assert!(child.position()[axis] <= parent.position()[axis] + 1.0e-4);
        } else {
            assert!(child.position()[axis] >= parent.position()[axis] - 1.0e-4);
        }
    }
}

#[test]
fn photon_energy_roundtrips_through_compression() {
    let power = Vec3::new(0.8, 0.2, 0.05);
    let p = Photon::new(&Vec3::zeros(), &Vec3::new(0.0, -1.0, 0.0), &power);
    let e = p.energy();
    for k in 0..3 {
        assert!(
            (e[k] - power[k]).abs() < 0.02,
            "channel {} decayed: {} vs {}",
            k,
            e[k],
            power[k]
        );
    }
    let d = p.direction();
    assert!(d.y < -0.95, "direction quantization too lossy: {:?}", d);
}
