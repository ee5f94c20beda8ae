//! The photon map: emission, Russian-roulette tracing and the filtered
//! irradiance estimate.

use crate::map::{self, MapLookup, MapPoint};
use crate::material::Material;
use crate::math::*;
use crate::nodesys::NodeSystem;
use crate::obj::IFACE_NODESYS;
use crate::options::CausticFilter;
use crate::rt::trace::{self, TraceMode};
use crate::rt::{RayTracer, IFACE_RAYTRACER};
use crate::shader;
use crate::state::{RayType, State};
use ember_db::table::TableItem;
use ember_db::{Database, Tag};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::any::Any;

/// A stored photon: position, compressed incident direction and RGBE
/// packed power.
#[derive(Copy, Clone, Debug, Default)]
pub struct Photon {
    pub pos: [f32; 3],
    pub plane: i32,
    pub index: i32,
    pub theta: u8,
    pub phi: u8,
    pub power: Rgbe,
}

impl Photon {
    pub fn new(pos: &Vec3, dir: &Vec3, power: &Vec3) -> Photon {
        let (theta, phi) = encode_dir(dir);
        Photon {
            pos: [pos.x, pos.y, pos.z],
            plane: 0,
            index: 0,
            theta,
            phi,
            power: set_rgbe(power),
        }
    }

    pub fn direction(&self) -> Vec3 {
        decode_dir(self.theta, self.phi)
    }

    pub fn energy(&self) -> Vec3 {
        get_rgbe(&self.power)
    }
}

fn encode_dir(dir: &Vec3) -> (u8, u8) {
    let theta = (dir.z.max(-1.0).min(1.0).acos() * (256.0 / PI)) as i32;
    let phi_angle = dir.y.atan2(dir.x);
    let phi_angle = if phi_angle < 0.0 {
        phi_angle + 2.0 * PI
    } else {
        phi_angle
    };
    let phi = (phi_angle * (256.0 / (2.0 * PI))) as i32;
    (theta.max(0).min(255) as u8, phi.max(0).min(255) as u8)
}

fn decode_dir(theta: u8, phi: u8) -> Vec3 {
    let t = theta as f32 * (PI / 256.0);
    let p = phi as f32 * (2.0 * PI / 256.0);
    Vec3::new(t.sin() * p.cos(), t.sin() * p.sin(), t.cos())
}

impl TableItem for Photon {
    fn encode_item(&self, w: &mut Vec<u8>) {
        for c in self.pos.iter() {
            w.write_f32::<LittleEndian>(*c).unwrap();
        }
        w.write_i32::<LittleEndian>(self.plane).unwrap();
        w.write_i32::<LittleEndian>(self.index).unwrap();
        w.push(self.theta);
        w.push(self.phi);
        w.push(self.power.r);
        w.push(self.power.g);
        w.push(self.power.b);
        w.push(self.power.e);
    }

    fn decode_item(r: &mut &[u8]) -> Option<Photon> {
        use std::io::Read;
        let mut pos = [0f32; 3];
        for c in pos.iter_mut() {
            *c = r.read_f32::<LittleEndian>().ok()?;
        }
        let plane = r.read_i32::<LittleEndian>().ok()?;
        let index = r.read_i32::<LittleEndian>().ok()?;
        let mut b = [0u8; 6];
        r.read_exact(&mut b).ok()?;
        Some(Photon {
            pos,
            plane,
            index,
            theta: b[0],
            phi: b[1],
            power: Rgbe {
                r: b[2],
                g: b[3],
                b: b[4],
                e: b[5],
            },
        })
    }
}

impl MapPoint for Photon {
    fn position(&self) -> Vec3 {
        Vec3::new(self.pos[0], self.pos[1], self.pos[2])
    }

    fn plane(&self) -> i32 {
        self.plane
    }

    fn set_plane(&mut self, plane: i32) {
        self.plane = plane;
    }

    fn index(&self) -> i32 {
        self.index
    }

    fn set_index(&mut self, index: i32) {
        self.index = index;
    }
}

//--------------------------------------------------------------------------------------------------
// lookup

/// Filtered density estimate over the k nearest photons whose incident
/// direction faces the surface.
pub fn photon_map_lookup_irrad(
    db: &Database,
    tag: Tag,
    out: &mut Vec3,
    p: &Vec3,
    n: &Vec3,
    max_dist: f32,
    nsamples: i32,
    filter: CausticFilter,
    filter_const: f32,
) {
    *out = Vec3::zeros();
    if tag.is_null() || map::map_size(db, tag) == 0 {
        return;
    }
    let max_dist = if max_dist > 0.0 {
        max_dist
    } else {
        // derive a radius from the map bound when the user left it zero
        let bbox = db.read::<crate::map::Map>(tag).bbox;
        (bbox.diag() * 0.05).max(SCALAR_EPS)
    };
    let n_copy = *n;
    let mut np = MapLookup::new(*p, nsamples.max(1) as usize, max_dist);
    map::map_locate_points::<Photon>(db, tag, &mut np, 1, |photon, _d2| {
        glm::dot(&photon.direction(), &n_copy) < 0.0
    });
    if np.found < 8usize.min(np.max) {
        return;
    }
    let r2 = np.dist2[0].max(SCALAR_EPS);
    let r = r2.sqrt();
    let mut sum = Vec3::zeros();
    for i in 1..=np.found {
        let photon = map::map_get::<Photon>(db, tag, np.index[i]);
        let weight = match filter {
            CausticFilter::None | CausticFilter::Box => 1.0,
            CausticFilter::Cone => {
                let d = np.dist2[i].sqrt();
                (1.0 - d / (filter_const.max(1.0) * r)).max(0.0)
            }
            CausticFilter::Gaussian => {
                let alpha = 1.818;
                let beta = 1.953;
                alpha
                    * (1.0
                        - (1.0 - (-beta * np.dist2[i] / (2.0 * r2)).exp())
                            / (1.0 - (-beta).exp()))
            }
        };
        sum += photon.energy() * weight;
    }
    let norm = match filter {
        CausticFilter::Cone => {
            let k = filter_const.max(1.0);
            1.0 - 2.0 / (3.0 * k)
        }
        _ => 1.0,
    };
    *out = sum / (PI * r2 * norm);
}

//--------------------------------------------------------------------------------------------------
// emission and tracing

/// Argument handed to photon shaders through the shader call.
pub struct PhotonArg {
    pub energy: Vec3,
}

/// Stores a photon carried by `state` into the emission pass's target
/// map.
pub fn store_photon(state: &mut State, energy: &Vec3) -> bool {
    let target = state.bucket.pass.photon_target;
    if target.is_null() || map::map_full(state.db(), target) {
        return false;
    }
    let photon = Photon::new(&state.p, &glm::normalize(&state.dir), energy);
    map::map_store_points(state.db(), target, &[photon]);
    true
}

/// Traces one photon through the scene. At each hit the material's
/// photon shader list decides the Russian-roulette outcome and scales
/// the energy; with no photon shader the photon is stored and absorbed.
pub fn trace_photon(state: &mut State, energy: Vec3) -> bool {
    let db = state.bucket.db.clone();
    let rt = match db.interface::<RayTracer>(IFACE_RAYTRACER) {
        Some(rt) => rt,
        None => return false,
    };
    let nodesys = match db.interface::<NodeSystem>(IFACE_NODESYS) {
        Some(ns) => ns,
        None => return false,
    };
    let depth_limit = state.opt().photon_reflect_depth + state.opt().photon_refract_depth;
    if state.reflect_depth + state.refract_depth > depth_limit {
        return false;
    }
    let hit = trace::trace(&rt, state, TraceMode::Nearest, |_s| true);
    if !hit {
        return false;
    }
    trace::compute_hit_details(&rt, state);
    if state.hit_mtl.is_null() {
        return false;
    }
    let photon_list = db.read::<Material>(state.hit_mtl).photon_list;
    let has_photon_shader = !photon_list.is_null()
        && !db
            .read::<ember_db::array::DataArray<Tag>>(photon_list)
            .items
            .is_empty();
    if !has_photon_shader {
        // no photon shader: deposit and absorb
        store_photon(state, &energy);
        return true;
    }
    let mut arg = PhotonArg { energy };
    let mut result = Vec4::zeros();
    shader::call_shader_instance_list(
        &nodesys,
        &mut result,
        state,
        photon_list,
        Some(&mut arg as &mut dyn Any),
    )
}

/// Spawns the scattered child of a photon interaction and keeps
/// tracing it; called from photon shaders.
pub fn photon_continue(state: &mut State, child_type: RayType, dir: &Vec3, energy: Vec3) -> bool {
    debug_assert!(child_type.is_photon());
    let bias = calc_bias(&state.ng, dir, state.bias, state.bias_scale);
    let mut child = State::new(child_type, state.bucket, state.tls);
    child.inherit(state);
    match child_type {
        RayType::PhotonReflectSpecular
        | RayType::PhotonReflectGlossy
        | RayType::PhotonReflectDiffuse => child.reflect_depth += 1,
        RayType::PhotonTransmitSpecular
        | RayType::PhotonTransmitGlossy
        | RayType::PhotonTransmitDiffuse
        | RayType::PhotonTransparent => child.refract_depth += 1,
        _ => {}
    }
    child.org = state.p + state.ng * bias * glm::dot(&state.ng, dir).signum();
    child.dir = *dir;
    child.instance_number = state.instance_number + 1;
    child.dimension = state.dimension + 2;
    child.inherit_volume(state);
    let status = trace_photon(&mut child, energy);
    state.pass_motion |= child.pass_motion;
    status
}
