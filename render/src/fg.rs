//! The irradiance cache: hemisphere sampling with Ward-style gradients
//! and gradient-corrected interpolation of cached records.

use crate::map::{self, MapLookup, MapPoint};
use crate::material::Material;
use crate::math::*;
use crate::nodesys::NodeSystem;
use crate::obj::IFACE_NODESYS;
use crate::rt::trace::{self, TraceMode};
use crate::rt::{RayTracer, IFACE_RAYTRACER};
use crate::sampler::qmc::sigma;
use crate::shader;
use crate::state::{RayType, State};
use ember_db::table::TableItem;
use ember_db::{Database, Tag};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

const BIG_NUM: f32 = 1.0e5;
const HARMONIC_MEAN_COEFF: f32 = 0.1;
/// tan(89.9999 degrees)
const MAX_TAN: f32 = 999999.999999499999999999875;
/// Weight coefficient of the acceptance test.
pub const FG_ERROR_COEFF: f32 = 0.4;

/// One cell of the stratified hemisphere buffer.
#[derive(Copy, Clone, Debug)]
pub struct HemisphereSample {
    pub color: Vec3,
    pub tan_theta: f32,
    pub r: f32,
}

impl Default for HemisphereSample {
    fn default() -> HemisphereSample {
        HemisphereSample {
            color: Vec3::zeros(),
            tan_theta: 0.0,
            r: MAX_SCALAR,
        }
    }
}

impl ember_db::buffer::BufferItem for HemisphereSample {
    fn zero_item(&mut self) {
        self.color = Vec3::zeros();
    }

    fn add_item(&mut self, other: &HemisphereSample) {
        self.color += other.color;
    }

    fn mul_item(&mut self, scale: f32) {
        self.color *= scale;
    }
}

#[derive(Copy, Clone, Debug, Default)]
pub struct IrradianceGradient {
    pub r: Vec3,
    pub g: Vec3,
    pub b: Vec3,
}

/// A cached irradiance record; colors are RGBE compressed.
#[derive(Copy, Clone, Debug, Default)]
pub struct Irradiance {
    pub pos: [f32; 3],
    pub plane: i32,
    pub index: i32,
    pub ni: [f32; 3],
    pub ei: Rgbe,
    pub grad_r: [Rgbe; 3],
    pub grad_t: [Rgbe; 3],
    pub inv_ri: f32,
}

impl Irradiance {
    pub fn init(
        p: &Vec3,
        n: &Vec3,
        e: &Vec3,
        grad_r: &IrradianceGradient,
        grad_t: &IrradianceGradient,
        inv_ri: f32,
    ) -> Irradiance {
        Irradiance {
            pos: [p.x, p.y, p.z],
            plane: 0,
            index: 0,
            ni: [n.x, n.y, n.z],
            ei: set_rgbe(e),
            grad_r: [set_rgbe(&grad_r.r), set_rgbe(&grad_r.g), set_rgbe(&grad_r.b)],
            grad_t: [set_rgbe(&grad_t.r), set_rgbe(&grad_t.g), set_rgbe(&grad_t.b)],
            inv_ri,
        }
    }

    pub fn normal(&self) -> Vec3 {
        Vec3::new(self.ni[0], self.ni[1], self.ni[2])
    }
}

fn encode_rgbe(c: &Rgbe, w: &mut Vec<u8>) {
    w.push(c.r);
    w.push(c.g);
    w.push(c.b);
    w.push(c.e);
}

fn decode_rgbe(r: &mut &[u8]) -> Option<Rgbe> {
    use std::io::Read;
    let mut b = [0u8; 4];
    r.read_exact(&mut b).ok()?;
    Some(Rgbe {
        r: b[0],
        g: b[1],
        b: b[2],
        e: b[3],
    })
}

impl TableItem for Irradiance {
    fn encode_item(&self, w: &mut Vec<u8>) {
        for c in self.pos.iter().chain(self.ni.iter()) {
            w.write_f32::<LittleEndian>(*c).unwrap();
        }
        w.write_i32::<LittleEndian>(self.plane).unwrap();
        w.write_i32::<LittleEndian>(self.index).unwrap();
        encode_rgbe(&self.ei, w);
        for g in self.grad_r.iter().chain(self.grad_t.iter()) {
            encode_rgbe(g, w);
        }
        w.write_f32::<LittleEndian>(self.inv_ri).unwrap();
    }

    fn decode_item(r: &mut &[u8]) -> Option<Irradiance> {
        let mut pos = [0f32; 3];
        let mut ni = [0f32; 3];
        for c in pos.iter_mut() {
            *c = r.read_f32::<LittleEndian>().ok()?;
        }
        for c in ni.iter_mut() {
            *c = r.read_f32::<LittleEndian>().ok()?;
        }
        let plane = r.read_i32::<LittleEndian>().ok()?;
        let index = r.read_i32::<LittleEndian>().ok()?;
        let ei = decode_rgbe(r)?;
        let mut grad_r = [Rgbe::default(); 3];
        let mut grad_t = [Rgbe::default(); 3];
        for g in grad_r.iter_mut() {
            *g = decode_rgbe(r)?;
        }
        for g in grad_t.iter_mut() {
            *g = decode_rgbe(r)?;
        }
        Some(Irradiance {
            pos,
            plane,
            index,
            ni,
            ei,
            grad_r,
            grad_t,
            inv_ri: r.read_f32::<LittleEndian>().ok()?,
        })
    }
}

impl MapPoint for Irradiance {
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

/// Acceptance test of a stored record against the query point.
fn irrad_accept(irrad: &Irradiance, r2: f32, n: &Vec3, a: f32) -> bool {
    let inv_a = 1.0 / a.max(SCALAR_EPS);
    let inv_rmin = inv_a * (1.0 / 10.0);
    let inv_rmax = inv_a * (1.0 / 1.5);
    let inv_ri = irrad.inv_ri.max(inv_rmin).min(inv_rmax);
    let wi = r2.sqrt() * inv_ri + (1.0 - glm::dot(n, &irrad.normal())).max(0.0).sqrt();
    (1.0 - FG_ERROR_COEFF * wi) >= 0.0
}

fn interp_irradiances(
    db: &Database,
    tag: Tag,
    l: &mut Vec3,
    p: &Vec3,
    n: &Vec3,
    w: &mut f32,
    num_available: &mut u32,
    np: &MapLookup,
) {
    for i in 1..=np.found {
        let irrad = map::map_get::<Irradiance>(db, tag, np.index[i]);
        let dp = p - irrad.position();
        let ni = irrad.normal();
        let mut wi =
            np.dist2[i].sqrt() * irrad.inv_ri + (1.0 - glm::dot(n, &ni)).max(0.0).sqrt();
        *num_available += 1;
        if almost_zero(wi, SCALAR_EPS) {
            wi = BIG_NUM;
        } else {
            wi = 1.0 / wi;
        }
        *w += wi;

        // rotate into the record's local frame for the gradients
        let dn = glm::cross(&ni, n);
        let (u_axis, v_axis) = ortho_basis(&ni);
        let local_dn = Vec3::new(
            glm::dot(&dn, &u_axis),
            glm::dot(&dn, &v_axis),
            glm::dot(&dn, &ni),
        );
        let local_dp = Vec3::new(
            glm::dot(&dp, &u_axis),
            glm::dot(&dp, &v_axis),
            glm::dot(&dp, &ni),
        );

        let mut li = get_rgbe(&irrad.ei);
        let grad_r = IrradianceGradient {
            r: get_rgbe(&irrad.grad_r[0]),
            g: get_rgbe(&irrad.grad_r[1]),
            b: get_rgbe(&irrad.grad_r[2]),
        };
        let grad_t = IrradianceGradient {
            r: get_rgbe(&irrad.grad_t[0]),
            g: get_rgbe(&irrad.grad_t[1]),
            b: get_rgbe(&irrad.grad_t[2]),
        };
        li.x += glm::dot(&local_dn, &grad_r.r) + glm::dot(&local_dp, &grad_t.r);
        li.y += glm::dot(&local_dn, &grad_r.g) + glm::dot(&local_dp, &grad_t.g);
        li.z += glm::dot(&local_dn, &grad_r.b) + glm::dot(&local_dp, &grad_t.b);

        *l += li * (wi * (1.0 / PI));
    }
}

/// k-nearest lookup with the error-weighted acceptance test and
/// gradient-corrected reconstruction. Returns the accumulated weight
/// and the number of accepted records through the out parameters.
pub fn irrad_cache_find(
    db: &Database,
    tag: Tag,
    l: &mut Vec3,
    p: &Vec3,
    n: &Vec3,
    a: f32,
    max_dist: f32,
    gather_points: u32,
    w: &mut f32,
    num_available: &mut u32,
) {
    let mut np = MapLookup::new(*p, gather_points as usize, max_dist);
    map_locate(db, tag, &mut np, |rec, r2| irrad_accept(rec, r2, n, a));
    interp_irradiances(db, tag, l, p, n, w, num_available, &np);
}

/// Forced interpolation used when hemisphere sampling is exhausted:
/// accepts any record whose normal roughly aligns.
pub fn irrad_cache_force_interp(
    db: &Database,
    tag: Tag,
    l: &mut Vec3,
    p: &Vec3,
    n: &Vec3,
    max_dist: f32,
    gather_points: u32,
    w: &mut f32,
    num_available: &mut u32,
) {
    let sqrt2_half = std::f32::consts::SQRT_2 * 0.5;
    let mut np = MapLookup::new(*p, gather_points as usize, max_dist);
    let n_copy = *n;
    map_locate(db, tag, &mut np, move |rec, _r2| {
        glm::dot(&n_copy, &rec.normal()) > sqrt2_half
    });
    interp_irradiances(db, tag, l, p, n, w, num_available, &np);
}

fn map_locate(
    db: &Database,
    tag: Tag,
    np: &mut MapLookup,
    pred: impl FnMut(&Irradiance, f32) -> bool,
) {
    map::map_locate_points::<Irradiance>(db, tag, np, 1, pred);
}

//--------------------------------------------------------------------------------------------------
// sampling

fn finalgather_ray_hit(rt: &RayTracer, nodesys: &NodeSystem, state: &mut State) -> bool {
    let hit = trace::trace(rt, state, TraceMode::Nearest, |_s| true);
    if hit {
        let mut result = Vec4::zeros();
        trace::compute_hit_details(rt, state);
        if !state.hit_mtl.is_null() {
            let surface_list = rt.db.read::<Material>(state.hit_mtl).surface_list;
            shader::call_shader_instance_list(nodesys, &mut result, state, surface_list, None);
            shader::call_current_volume_list(nodesys, &mut result, state, None);
        }
        // linear fade towards the environment beyond the fall-off start
        let pass = &state.bucket.pass;
        let dist = state.hit_t;
        if pass.finalgather_falloff && dist > pass.finalgather_falloff_start {
            let fore_color = state.result.color;
            state.result.color = Vec3::zeros();
            crate::illum::trace_environment(state);
            let back_color = state.result.color;
            let t = (dist - pass.finalgather_falloff_start)
                / (pass.finalgather_falloff_stop - pass.finalgather_falloff_start).max(SCALAR_EPS);
            state.result.color = lerp3(&fore_color, &back_color, t.max(0.0).min(1.0));
        }
        true
    } else {
        crate::illum::trace_environment(state);
        false
    }
}

/// Samples the hemisphere above the hit with `M x N` stratified cells,
/// filters the buffer, derives the irradiance gradients and caches the
/// record.
pub fn sample_finalgather(color: &mut Vec3, state: &mut State) {
    let db = state.db();
    let rt = match db.interface::<RayTracer>(IFACE_RAYTRACER) {
        Some(rt) => rt,
        None => return,
    };
    let nodesys = match db.interface::<NodeSystem>(IFACE_NODESYS) {
        Some(ns) => ns,
        None => return,
    };

    *color = Vec3::zeros();
    let mut grad_r = IrradianceGradient::default();
    let mut grad_t = IrradianceGradient::default();

    // step back a little from the hit point
    let bias = calc_bias(&state.ng, &state.i, state.bias, state.bias_scale);
    let biased_p = state.p - state.i * bias;

    let opt = state.opt();
    let fg_rays = opt.finalgather_rays;
    let mut ri = state.bucket.pass.finalgather_radius;
    let mut ham_ri = 0.0f32;

    let (m, n) = {
        let mut tls = state.tls.borrow_mut();
        let buf = tls.acquire_finalgather_buffer(fg_rays);
        (buf.width(), buf.height())
    };
    let inv_m = 1.0 / m as f32;
    let inv_n = 1.0 / n as f32;
    let mn = (m * n) as f32;
    let inv_mn = 1.0 / mn;

    let (u_axis, v_axis) = ortho_basis(&state.n);
    let offset_x = sigma(state.dimension, state.instance_number);
    let offset_y = sigma(state.dimension + 1, state.instance_number);

    let mut instance_offset = 0u32;
    let parent_result = state.result.clone();
    for k in 0..n {
        for j in 0..m {
            let rand_var = [
                (offset_x + instance_offset as f32 * inv_mn).fract(),
                (offset_y + sigma(0, instance_offset)).fract(),
            ];
            let mut fg_ray = State::new(RayType::FinalGather, state.bucket, state.tls);
            fg_ray.inherit(state);
            fg_ray.finalgather_diffuse_depth += 1;
            fg_ray.instance_number = state.instance_number + instance_offset;
            fg_ray.dimension = state.dimension + 2;
            fg_ray.result = parent_result.clone();
            fg_ray.result.color = Vec3::zeros();
            fg_ray.result.opacity = Vec3::zeros();

            let sin_theta = ((j as f32 + rand_var[0]) * inv_m).sqrt();
            let cos_theta = (1.0 - sin_theta * sin_theta).sqrt();
            let phi = 2.0 * PI * (k as f32 + rand_var[1]) * inv_n;
            let local = Vec3::new(sin_theta * phi.cos(), sin_theta * phi.sin(), cos_theta);
            let dir = u_axis * local.x + v_axis * local.y + state.n * local.z;

            fg_ray.org = biased_p;
            fg_ray.dir = dir;
            if state.bucket.pass.finalgather_falloff {
                fg_ray.max_t = state.bucket.pass.finalgather_falloff_stop;
            }
            fg_ray.inherit_volume(state);

            finalgather_ray_hit(&rt, &nodesys, &mut fg_ray);

            let tan_theta = if almost_zero(cos_theta, SCALAR_EPS) {
                MAX_TAN
            } else {
                sin_theta / cos_theta
            };
            let sample = HemisphereSample {
                color: fg_ray.result.color,
                tan_theta,
                r: fg_ray.hit_t,
            };
            {
                let mut tls = state.tls.borrow_mut();
                let buf = tls.fg_buffer.as_mut().expect("hemisphere buffer");
                buf.set(j as isize, k as isize, sample);
            }

            ri = ri.min(sample.r);
            ham_ri += 1.0 / sample.r;
            instance_offset += 1;
            state.pass_motion |= fg_ray.pass_motion;
        }
    }
    state.result = parent_result;

    // harmonic mean of the hit distances
    ham_ri = mn / ham_ri.max(SCALAR_EPS);

    // box filter the hemisphere, unless nothing will be interpolated
    if opt.finalgather_samples > 0 {
        let radius = opt.finalgather_filter_size.trunc() as i32;
        let mut tls = state.tls.borrow_mut();
        if let Some(buf) = tls.fg_buffer.as_mut() {
            buf.filter(radius);
        }
    }

    {
        let tls = state.tls.borrow();
        let buf = tls.fg_buffer.as_ref().expect("hemisphere buffer");
        for k in 0..n as isize {
            let phik = 2.0 * PI * (k as f32 + 0.5) * inv_n;
            let phik_minor = 2.0 * PI * k as f32 * inv_n;
            let uk = Vec3::new(phik.cos(), phik.sin(), 0.0);
            let vk = Vec3::new(
                (phik + PI * 0.5).cos(),
                (phik + PI * 0.5).sin(),
                0.0,
            );
            let vk_minor = Vec3::new(
                (phik_minor + PI * 0.5).cos(),
                (phik_minor + PI * 0.5).sin(),
                0.0,
            );

            let mut sum_part1 = IrradianceGradient::default();
            let mut sum_t_l = Vec3::zeros();
            let mut sum_part2 = Vec3::zeros();

            for j in 0..m as isize {
                let sin_thetaj_minor = (j as f32 * inv_m).sqrt();
                let sin_thetaj_plus = ((j as f32 + 1.0) * inv_m).sqrt();
                let cos_thetaj_minor = (1.0 - sin_thetaj_minor * sin_thetaj_minor).sqrt();

                let cell = buf.get(j, k);
                *color += cell.color;

                // rotational gradient
                sum_t_l += cell.color * (-cell.tan_theta);

                // translational gradient, theta part
                let prev_j = buf.get(j - 1, k);
                let part1 = (cell.color - prev_j.color)
                    * (sin_thetaj_minor * cos_thetaj_minor * cos_thetaj_minor
                        / cell.r.min(prev_j.r).max(SCALAR_EPS));
                sum_part1.r += uk * part1.x;
                sum_part1.g += uk * part1.y;
                sum_part1.b += uk * part1.z;

                // translational gradient, phi part
                let prev_k = buf.get_tiled(j, k - 1);
                let part2 = (cell.color - prev_k.color)
                    * ((sin_thetaj_plus - sin_thetaj_minor)
                        / cell.r.min(prev_k.r).max(SCALAR_EPS));
                sum_part2 += part2;
            }

            grad_r.r += vk * sum_t_l.x;
            grad_r.g += vk * sum_t_l.y;
            grad_r.b += vk * sum_t_l.z;

            let phi_weight = 2.0 * PI * inv_n;
            grad_t.r += sum_part1.r * phi_weight + vk_minor * sum_part2.x;
            grad_t.g += sum_part1.g * phi_weight + vk_minor * sum_part2.y;
            grad_t.b += sum_part1.b * phi_weight + vk_minor * sum_part2.z;
        }
    }

    grad_r.r *= PI * inv_mn;
    grad_r.g *= PI * inv_mn;
    grad_r.b *= PI * inv_mn;
    *color *= PI * inv_mn;

    // cache the irradiance with the blended inverse radius
    let mut inv_ri = BIG_NUM;
    let mut inv_ham_ri = BIG_NUM;
    if !almost_zero(ri, SCALAR_EPS) {
        inv_ri = 1.0 / ri;
    }
    if !almost_zero(ham_ri, SCALAR_EPS) {
        inv_ham_ri = 1.0 / ham_ri;
    }
    let irrad = Irradiance::init(
        &state.p,
        &state.n,
        color,
        &grad_r,
        &grad_t,
        HARMONIC_MEAN_COEFF * inv_ham_ri + (1.0 - HARMONIC_MEAN_COEFF) * inv_ri,
    );
    let fg_map = state.bucket.pass.finalgather_map;
    if !fg_map.is_null() {
        map::map_store_points(db, fg_map, &[irrad]);
    }
}

/// Computes indirect irradiance at the hit: caustic photons plus either
/// interpolated final gather or a photon-map estimate at deep recursion.
pub fn compute_irradiance(irrad: &mut Vec3, state: &mut State) {
    let db_owner = state.bucket.db.clone();
    let db = &*db_owner;
    *irrad = Vec3::zeros();
    let pass = state.bucket.pass.clone();

    if !pass.caustic_map.is_null() {
        let mut color = Vec3::zeros();
        crate::photon::photon_map_lookup_irrad(
            db,
            pass.caustic_map,
            &mut color,
            &state.p,
            &state.n,
            pass.caustic_radius,
            state.opt().caustic_samples,
            state.opt().caustic_filter,
            state.opt().caustic_filter_const,
        );
        *irrad += color;
    }

    if !state.opt().finalgather {
        return;
    }

    let deep = state.ray_type == RayType::FinalGather
        || state.reflect_depth > state.opt().finalgather_reflect_depth
        || state.refract_depth > state.opt().finalgather_refract_depth;
    if deep {
        if !pass.globillum_map.is_null() {
            let mut color = Vec3::zeros();
            crate::photon::photon_map_lookup_irrad(
                db,
                pass.globillum_map,
                &mut color,
                &state.p,
                &state.n,
                pass.globillum_radius,
                state.opt().globillum_samples,
                crate::options::CausticFilter::Box,
                1.0,
            );
            *irrad += color;
        } else if state.finalgather_diffuse_depth <= state.opt().finalgather_diffuse_bounces {
            // a single diffuse bounce approximates the indirect term
            let mut color = Vec3::zeros();
            diffuse_bounce(&mut color, state);
            *irrad += color;
        }
        return;
    }

    // try interpolation from the cache first
    let fg_map = pass.finalgather_map;
    if fg_map.is_null() {
        return;
    }
    let a = projected_pixel_area(state);
    let max_dist = pass.finalgather_max_dist;
    let mut l = Vec3::zeros();
    let mut w = 0.0f32;
    let mut available = 0u32;
    if state.opt().finalgather_samples > 0 {
        irrad_cache_find(
            db,
            fg_map,
            &mut l,
            &state.p,
            &state.n,
            a,
            max_dist,
            state.opt().finalgather_samples as u32,
            &mut w,
            &mut available,
        );
    }
    if available > 0 && w > SCALAR_EPS {
        *irrad += l / w;
    } else {
        let mut color = Vec3::zeros();
        sample_finalgather(&mut color, state);
        *irrad += color;
    }
}

fn diffuse_bounce(color: &mut Vec3, state: &mut State) {
    let db = state.bucket.db.clone();
    let rt = match db.interface::<RayTracer>(IFACE_RAYTRACER) {
        Some(rt) => rt,
        None => return,
    };
    let nodesys = match db.interface::<NodeSystem>(IFACE_NODESYS) {
        Some(ns) => ns,
        None => return,
    };
    let u1 = sigma(state.dimension, state.instance_number);
    let u2 = sigma(state.dimension + 1, state.instance_number);
    state.dimension += 2;
    let (u_axis, v_axis) = ortho_basis(&state.n);
    let local = cosine_sample_hemisphere(u1, u2);
    let dir = u_axis * local.x + v_axis * local.y + state.n * local.z;
    let bias = calc_bias(&state.ng, &state.i, state.bias, state.bias_scale);

    let mut ray = State::new(RayType::FinalGather, state.bucket, state.tls);
    ray.inherit(state);
    ray.finalgather_diffuse_depth += 1;
    ray.result = state.result.clone();
    ray.result.color = Vec3::zeros();
    ray.org = state.p - state.i * bias;
    ray.dir = dir;
    ray.inherit_volume(state);
    finalgather_ray_hit(&rt, &nodesys, &mut ray);
    *color = ray.result.color;
    state.pass_motion |= ray.pass_motion;
}

/// Cosine-weighted hemisphere direction in the local frame.
pub fn cosine_sample_hemisphere(u1: f32, u2: f32) -> Vec3 {
    let r = u1.sqrt();
    let phi = 2.0 * PI * u2;
    let x = r * phi.cos();
    let y = r * phi.sin();
    Vec3::new(x, y, (1.0 - u1).max(0.0).sqrt())
}

/// Projected pixel footprint in object space, clamping the record
/// radius at lookup time.
fn projected_pixel_area(state: &State) -> f32 {
    let dist = state.distance.max(state.hit_t);
    let pixel = state.cam().pixel_size();
    (dist * pixel).max(SCALAR_EPS)
}
