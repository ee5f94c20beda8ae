//! Ray traversal: top-level BSP descent, per-instance transform into
//! object space, sub-BSP descent and primitive intersection.

use crate::math::*;
use crate::rt::bsp::{self, BspStack};
use crate::rt::scene::{RayHitInfo, RayScene};
use crate::rt::tessel::{RayAccelTriangles, RaySubtree, RayTessel};
use crate::rt::{RayTracer, DISTANCE_TOL};
use crate::state::{calc_inv_dir, motion_transform_ray, transform_ray, State};
use ember_db::{Tag, NULL_INDEX};
use log::error;
use ordered_float::OrderedFloat;
use std::mem;

/// How the intersection consumer wants hits delivered.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TraceMode {
    /// Keep the nearest hit; traversal continues until the stack drains
    /// because spatial splits void leaf ordering, pruned by the running
    /// `hit_t`.
    Nearest,
    /// Exit on the first accepted hit (opaque shadows).
    AnyHit,
    /// Collect every hit, order by `t`, and replay for transparency.
    Sort,
}

/// Möller–Trumbore with the fixed distance-tolerance rejection.
#[inline]
pub fn intersect_triangle(
    org: &Vec3,
    dir: &Vec3,
    v0: &Vec3,
    e1: &Vec3,
    e2: &Vec3,
) -> Option<(f32, f32, f32)> {
    let pvec = glm::cross(dir, e2);
    let det = glm::dot(e1, &pvec);
    if det.abs() < 1.0e-12 {
        return None;
    }
    let inv_det = 1.0 / det;
    let tvec = org - v0;
    let b1 = glm::dot(&tvec, &pvec) * inv_det;
    if b1 < 0.0 || b1 > 1.0 {
        return None;
    }
    let qvec = glm::cross(&tvec, e1);
    let b2 = glm::dot(dir, &qvec) * inv_det;
    if b2 < 0.0 || b1 + b2 > 1.0 {
        return None;
    }
    let t = glm::dot(e2, &qvec) * inv_det;
    if t < DISTANCE_TOL {
        return None;
    }
    Some((t, b1, b2))
}

/// de Casteljau evaluation, one basis for every curve degree.
pub fn eval_curve(ctrl: &[Vec3], t: f32) -> Vec3 {
    let mut tmp: [Vec3; 4] = [Vec3::zeros(); 4];
    let n = ctrl.len().min(4);
    tmp[..n].copy_from_slice(&ctrl[..n]);
    for level in (1..n).rev() {
        for i in 0..level {
            tmp[i] = lerp3(&tmp[i], &tmp[i + 1], t);
        }
    }
    tmp[0]
}

pub fn eval_curve_scalar(ctrl: &[f32], t: f32) -> f32 {
    let mut tmp: [f32; 4] = [0.0; 4];
    let n = ctrl.len().min(4);
    tmp[..n].copy_from_slice(&ctrl[..n]);
    for level in (1..n).rev() {
        for i in 0..level {
            tmp[i] = lerp(tmp[i], tmp[i + 1], t);
        }
    }
    tmp[0]
}

/// Closest approach of a ray and a thick linear span; returns
/// `(t, s, dist2)`.
fn ray_segment_closest(
    org: &Vec3,
    dir: &Vec3,
    a: &Vec3,
    b: &Vec3,
) -> Option<(f32, f32, f32)> {
    let u = *dir;
    let v = b - a;
    let w0 = org - a;
    let uu = glm::dot(&u, &u);
    let uv = glm::dot(&u, &v);
    let vv = glm::dot(&v, &v);
    let uw = glm::dot(&u, &w0);
    let vw = glm::dot(&v, &w0);
    let den = uu * vv - uv * uv;
    if den.abs() < 1.0e-12 || uu < 1.0e-12 {
        return None;
    }
    let mut s = (uu * vw - uv * uw) / den;
    s = s.max(0.0).min(1.0);
    let t = (glm::dot(&(a + v * s - org), &u)) / uu;
    if t < DISTANCE_TOL {
        return None;
    }
    let p_ray = org + u * t;
    let p_seg = a + v * s;
    let d = p_ray - p_seg;
    Some((t, s, glm::dot(&d, &d)))
}

struct Candidate {
    t: f32,
    bary: Vec3,
    tri: u32,
    prim: u32,
    motion: bool,
    user_data: [f32; crate::state::MAX_USER_DATA],
}

/// Traces a generic ray. Returns whether any intersection satisfied
/// `hit_proc`.
pub fn trace<F>(rt: &RayTracer, state: &mut State, mode: TraceMode, mut hit_proc: F) -> bool
where
    F: FnMut(&mut State) -> bool,
{
    state.precompute();
    let scene_tag = rt.scene_tag();
    let t_far_limit = state.t_far.min(state.max_t);
    state.t_far = t_far_limit;

    // the worker-owned stacks; returned before any shading runs
    let (mut stack, mut sub_stack, mut sort_hits) = {
        let mut tls = state.tls.borrow_mut();
        (
            mem::take(&mut tls.bsp_stack),
            mem::take(&mut tls.sub_bsp_stack),
            mem::take(&mut tls.hit_infos),
        )
    };
    sort_hits.clear();

    {
        let scene = rt.db.read::<RayScene>(scene_tag);
        let org = state.org;
        let dir = state.dir;
        let inv_dir = state.inv_dir;
        let t_near = state.t_near;
        bsp::traverse(
            &scene.tree,
            &org,
            &dir,
            &inv_dir,
            t_near,
            t_far_limit,
            &mut stack,
            |leaf, _t0, _t1| {
                for &ti in scene.tree.leaf_slice(leaf) {
                    intersect_tessel_instance(
                        rt,
                        &scene,
                        state,
                        ti,
                        mode,
                        &mut sub_stack,
                        &mut sort_hits,
                    );
                    if mode == TraceMode::AnyHit && state.found_hit {
                        return (true, state.hit_t);
                    }
                }
                let prune = if mode == TraceMode::Sort {
                    t_far_limit
                } else {
                    state.hit_t
                };
                (false, prune)
            },
        );
    }

    {
        let mut tls = state.tls.borrow_mut();
        tls.bsp_stack = stack;
        tls.sub_bsp_stack = sub_stack;
        tls.num_rays += 1;
        if mode != TraceMode::Sort {
            sort_hits.clear();
            tls.hit_infos = mem::take(&mut sort_hits);
        }
    }

    match mode {
        TraceMode::Nearest => {
            if state.found_hit {
                hit_proc(state)
            } else {
                false
            }
        }
        TraceMode::AnyHit => state.found_hit,
        TraceMode::Sort => {
            sort_hits.sort_by_key(|h| OrderedFloat(h.hit_t));
            let mut stopped = false;
            let scene = rt.db.read::<RayScene>(scene_tag);
            for h in sort_hits.iter() {
                state.found_hit = true;
                state.prev_hit_t = state.hit_t;
                state.hit_t = h.hit_t;
                state.hit_tessel_inst = h.hit_tessel_inst;
                state.hit_tri = h.hit_tri;
                state.hit_prim = h.hit_prim;
                state.hit_motion = h.hit_motion;
                state.bary = h.bary;
                state.user_data = h.user_data;
                let tinst = scene.tessel_instances[h.hit_tessel_inst as usize];
                state.hit_tessel = tinst.tessel;
                let inst = &scene.instances[tinst.instance as usize];
                state.hit_obj = rt
                    .db
                    .read::<crate::rt::RayObject>(inst.object)
                    .source;
                state.hit_mtl = inst.attr.material;
                if hit_proc(state) {
                    stopped = true;
                    break;
                }
            }
            let mut tls = state.tls.borrow_mut();
            sort_hits.clear();
            tls.hit_infos = sort_hits;
            stopped
        }
    }
}

fn intersect_tessel_instance(
    rt: &RayTracer,
    scene: &RayScene,
    state: &mut State,
    ti: u32,
    mode: TraceMode,
    sub_stack: &mut BspStack,
    sort_hits: &mut Vec<RayHitInfo>,
) {
    let tinst = scene.tessel_instances[ti as usize];
    let inst = &scene.instances[tinst.instance as usize];
    if mode != TraceMode::Nearest && !inst.attr.cast_shadow() {
        return;
    }

    // transform the ray into the instanced object's local space
    let (obj_org, obj_dir) = if inst.moving {
        state.pass_motion = true;
        motion_transform_ray(
            &inst.world_to_object,
            &inst.motion_world_to_object,
            state.time,
            &state.org,
            &state.dir,
        )
    } else {
        transform_ray(&inst.world_to_object, &state.org, &state.dir)
    };
    state.obj_org = obj_org;
    state.obj_dir = obj_dir;
    let obj_inv = calc_inv_dir(&obj_dir);

    let (bbox, motion_bbox, placeholder, job) = {
        let t = rt.db.read::<RayTessel>(tinst.tessel);
        (t.bbox, t.motion_bbox, t.is_placeholder(), t.job)
    };

    // the bound gates everything, including deferred dicing
    let clip_box = if inst.attr.motion() { motion_bbox } else { bbox };
    let span =
        clip_box.intersect_ray(&obj_org, &obj_inv, state.t_near, state.t_far.min(state.hit_t));
    let (clip_t0, clip_t1) = match span {
        Some(r) => r,
        None => return,
    };

    if placeholder {
        // first descent into a deferred tessellation: dice it now
        let mut ctx = crate::obj::DeferredDiceCtx {
            tessel: tinst.tessel,
        };
        if let Err(e) = rt.db.exec_job(job, &mut ctx) {
            error!("deferred dicing failed: {}", e);
            return;
        }
    }

    let (accel_tag, subtree_tag, procedural, has_curves) = {
        let t = rt.db.read::<RayTessel>(tinst.tessel);
        (t.accel, t.subtree, t.procedural, !t.curves.is_empty())
    };

    if procedural {
        let hook = match rt.procedural_intersect.read() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        };
        if let Some(hook) = hook.as_ref() {
            hook(
                rt,
                state,
                ti,
                tinst.tessel,
                mode == TraceMode::Sort,
                sort_hits,
            );
        }
        return;
    }
    if subtree_tag.is_null() {
        return;
    }

    let motion_enabled = inst.attr.motion();
    let subtree = rt.db.read::<RaySubtree>(subtree_tag);
    let mut best: Option<Candidate> = None;
    let time = state.time;
    let hit_t_in = state.hit_t;
    {
        let mut local_hits: Vec<Candidate> = Vec::new();
        if has_curves {
            let tessel = rt.db.read::<RayTessel>(tinst.tessel);
            bsp::traverse(
                &subtree.tree,
                &obj_org,
                &obj_dir,
                &obj_inv,
                clip_t0.max(0.0),
                clip_t1,
                sub_stack,
                |leaf, _t0, _t1| {
                    for &ci in subtree.tree.leaf_slice(leaf) {
                        if let Some(c) = intersect_curve(
                            &tessel,
                            ci,
                            &obj_org,
                            &obj_dir,
                            time,
                            motion_enabled,
                        ) {
                            collect_candidate(c, mode, &mut best, &mut local_hits, hit_t_in);
                        }
                    }
                    (false, best.as_ref().map_or(hit_t_in, |b| b.t))
                },
            );
        } else {
            let accel = rt.db.read::<RayAccelTriangles>(accel_tag);
            bsp::traverse(
                &subtree.tree,
                &obj_org,
                &obj_dir,
                &obj_inv,
                clip_t0.max(0.0),
                clip_t1,
                sub_stack,
                |leaf, _t0, _t1| {
                    for &tri_idx in subtree.tree.leaf_slice(leaf) {
                        let tri = &accel.tris[tri_idx as usize];
                        let (v0, e1, e2, moving) = if motion_enabled && tri.moving {
                            (
                                lerp3(&tri.v0, &tri.m_v0, time),
                                lerp3(&tri.e1, &tri.m_e1, time),
                                lerp3(&tri.e2, &tri.m_e2, time),
                                true,
                            )
                        } else {
                            (tri.v0, tri.e1, tri.e2, false)
                        };
                        if let Some((t, b1, b2)) =
                            intersect_triangle(&obj_org, &obj_dir, &v0, &e1, &e2)
                        {
                            let c = Candidate {
                                t,
                                bary: Vec3::new(1.0 - b1 - b2, b1, b2),
                                tri: tri_idx,
                                prim: 0,
                                motion: moving,
                                user_data: [0.0; crate::state::MAX_USER_DATA],
                            };
                            collect_candidate(c, mode, &mut best, &mut local_hits, hit_t_in);
                        }
                    }
                    (false, best.as_ref().map_or(hit_t_in, |b| b.t))
                },
            );
            // resolve source primitive indices
            if let Some(b) = best.as_mut() {
                let tessel = rt.db.read::<RayTessel>(tinst.tessel);
                b.prim = tessel.triangles[b.tri as usize].prim_index;
            }
            if !local_hits.is_empty() {
                let tessel = rt.db.read::<RayTessel>(tinst.tessel);
                for h in local_hits.iter_mut() {
                    h.prim = tessel.triangles[h.tri as usize].prim_index;
                }
            }
        }
        for h in local_hits {
            sort_hits.push(RayHitInfo {
                hit_tessel_inst: ti,
                hit_tri: h.tri,
                hit_prim: h.prim,
                hit_motion: h.motion,
                hit_t: h.t,
                bary: h.bary,
                bias: state.bias,
                bias_scale: state.bias_scale,
                user_data: h.user_data,
            });
        }
    }

    if mode != TraceMode::Sort {
        if let Some(b) = best {
            if b.t < state.hit_t {
                state.found_hit = true;
                state.hit_t = b.t;
                state.hit_bsp = subtree_tag;
                state.hit_tessel = tinst.tessel;
                state.hit_tessel_inst = ti;
                state.hit_inst = Tag::null();
                state.hit_obj = rt.db.read::<crate::rt::RayObject>(inst.object).source;
                state.hit_mtl = inst.attr.material;
                state.hit_tri = b.tri;
                state.hit_prim = b.prim;
                state.hit_motion = b.motion || inst.moving;
                state.bary = b.bary;
                state.user_data = b.user_data;
            }
        }
    }
}

fn collect_candidate(
    c: Candidate,
    mode: TraceMode,
    best: &mut Option<Candidate>,
    local_hits: &mut Vec<Candidate>,
    hit_t_in: f32,
) {
    match mode {
        TraceMode::Sort => local_hits.push(c),
        _ => {
            if c.t < best.as_ref().map_or(hit_t_in, |b| b.t) {
                *best = Some(c);
            }
        }
    }
}

fn intersect_curve(
    tessel: &RayTessel,
    curve_index: u32,
    org: &Vec3,
    dir: &Vec3,
    time: f32,
    motion: bool,
) -> Option<Candidate> {
    let curve = &tessel.curves[curve_index as usize];
    let first = curve.first as usize;
    let count = curve.count as usize;
    let mut ctrl: [Vec3; 4] = [Vec3::zeros(); 4];
    let mut ctrl_r: [f32; 4] = [0.0; 4];
    for i in 0..count.min(4) {
        let v = &tessel.vertices[first + i];
        ctrl[i] = if motion {
            lerp3(&v.pos, &v.m_pos, time)
        } else {
            v.pos
        };
        ctrl_r[i] = tessel.radii.get(first + i).copied().unwrap_or(0.0);
    }
    let spans = if curve.degree <= 1 { 1 } else { 8 };
    let inv_spans = 1.0 / spans as f32;
    let mut best: Option<Candidate> = None;
    for s in 0..spans {
        let s0 = s as f32 * inv_spans;
        let s1 = (s + 1) as f32 * inv_spans;
        let a = eval_curve(&ctrl[..count.min(4)], s0);
        let b = eval_curve(&ctrl[..count.min(4)], s1);
        if let Some((t, ls, dist2)) = ray_segment_closest(org, dir, &a, &b) {
            let param = lerp(s0, s1, ls);
            let r = eval_curve_scalar(&ctrl_r[..count.min(4)], param);
            if dist2 < r * r {
                if best.as_ref().map_or(true, |c| t < c.t) {
                    let mut user_data = [0.0; crate::state::MAX_USER_DATA];
                    user_data[0] = param;
                    best = Some(Candidate {
                        t,
                        bary: Vec3::new(1.0 - param, param, 0.0),
                        tri: curve_index,
                        prim: curve.prim_index,
                        motion,
                        user_data,
                    });
                }
            }
        }
    }
    best
}

//--------------------------------------------------------------------------------------------------
// hit details

/// Computes the differential geometry of the recorded hit and merges
/// the instance attributes into the state.
pub fn compute_hit_details(rt: &RayTracer, state: &mut State) {
    if !state.found_hit || state.hit_tessel_inst == NULL_INDEX {
        return;
    }
    let scene_tag = rt.scene_tag();
    let scene = rt.db.read::<RayScene>(scene_tag);
    let tinst = scene.tessel_instances[state.hit_tessel_inst as usize];
    let inst = &scene.instances[tinst.instance as usize];
    state.hit_tessel = tinst.tessel;
    state.hit_mtl = inst.attr.material;
    state.hit_obj = rt.db.read::<crate::rt::RayObject>(inst.object).source;

    let tessel = rt.db.read::<RayTessel>(tinst.tessel);
    let object_to_world = if inst.moving {
        // blend the end-point transforms at the sample time
        let mut m = inst.object_to_world;
        let m2 = inst.motion_object_to_world;
        for c in 0..4 {
            for r in 0..4 {
                m[(r, c)] = lerp(m[(r, c)], m2[(r, c)], state.time);
            }
        }
        m
    } else {
        inst.object_to_world
    };

    if tessel.procedural {
        // the geometry shader reported the hit; it left the
        // object-space normal in the user data
        let p_obj = state.obj_org + state.obj_dir * state.hit_t;
        state.p = point_transform(&object_to_world, &p_obj);
        let n_obj = Vec3::new(state.user_data[1], state.user_data[2], state.user_data[3]);
        let world_to_object = glm::inverse(&object_to_world);
        let n = normal_transform(&world_to_object, &n_obj);
        state.ng = if glm::dot(&n, &n) > SCALAR_EPS {
            glm::normalize(&n)
        } else {
            -glm::normalize(&state.dir)
        };
        state.n = state.ng;
        let (u_axis, v_axis) = ortho_basis(&state.ng);
        state.dpdu = u_axis;
        state.dpdv = v_axis;
    } else if !tessel.curves.is_empty() {
        // curve hit: position from the curve point, normal faces the ray
        let param = state.user_data[0];
        let curve = &tessel.curves[state.hit_tri as usize];
        let first = curve.first as usize;
        let count = (curve.count as usize).min(4);
        let mut ctrl: [Vec3; 4] = [Vec3::zeros(); 4];
        for i in 0..count {
            let v = &tessel.vertices[first + i];
            ctrl[i] = if state.hit_motion {
                lerp3(&v.pos, &v.m_pos, state.time)
            } else {
                v.pos
            };
        }
        let p_obj = eval_curve(&ctrl[..count], param);
        state.p = point_transform(&object_to_world, &p_obj);
        let dir_n = glm::normalize(&state.dir);
        state.ng = -dir_n;
        state.n = state.ng;
        let t0 = eval_curve(&ctrl[..count], (param - 0.05).max(0.0));
        let t1 = eval_curve(&ctrl[..count], (param + 0.05).min(1.0));
        state.dpdu = vector_transform(&object_to_world, &(t1 - t0));
        state.dpdv = glm::cross(&state.ng, &state.dpdu);
        state.u = param;
        state.v = 0.0;
    } else {
        let tri = &tessel.triangles[state.hit_tri as usize];
        let (a, b, c) = (
            &tessel.vertices[tri.v1 as usize],
            &tessel.vertices[tri.v2 as usize],
            &tessel.vertices[tri.v3 as usize],
        );
        let (p0, p1, p2) = if state.hit_motion {
            (
                lerp3(&a.pos, &a.m_pos, state.time),
                lerp3(&b.pos, &b.m_pos, state.time),
                lerp3(&c.pos, &c.m_pos, state.time),
            )
        } else {
            (a.pos, b.pos, c.pos)
        };
        let p_obj = p0 * state.bary.x + p1 * state.bary.y + p2 * state.bary.z;
        state.p = point_transform(&object_to_world, &p_obj);
        let e1 = p1 - p0;
        let e2 = p2 - p0;
        let ng_obj = glm::cross(&e1, &e2);
        // normals transform by the inverse transpose
        let world_to_object = glm::inverse(&object_to_world);
        let ng_world = normal_transform(&world_to_object, &ng_obj);
        state.ng = glm::normalize(&ng_world);
        state.dpdu = vector_transform(&object_to_world, &e1);
        state.dpdv = vector_transform(&object_to_world, &e2);
        state.u = state.bary.y;
        state.v = state.bary.z;
        // smooth normal from the object's vertex channels when present
        state.n = match crate::obj::interp_prim_vec3(rt, state, &tessel, "N") {
            Some(n_obj) => {
                let n = normal_transform(&world_to_object, &n_obj);
                if glm::dot(&n, &n) > SCALAR_EPS {
                    glm::normalize(&n)
                } else {
                    state.ng
                }
            }
            None => state.ng,
        };
        // derivative of position per unit time for motion hits
        if state.hit_motion {
            let m0 = a.m_pos - a.pos;
            let m1 = b.m_pos - b.pos;
            let m2 = c.m_pos - c.pos;
            let dp = m0 * state.bary.x + m1 * state.bary.y + m2 * state.bary.z;
            state.dpdtime = vector_transform(&object_to_world, &dp);
        } else {
            state.dpdtime = Vec3::zeros();
        }
    }

    let dir_n = glm::normalize(&state.dir);
    state.i = dir_n;
    state.e = state.org;
    state.dot_nd = glm::dot(&state.n, &dir_n);
    state.distance += state.hit_t;
}

/// Normal transform through the inverse matrix (multiplies by its
/// transpose).
#[inline]
pub fn normal_transform(inv: &Mat4, n: &Vec3) -> Vec3 {
    let m = inv.transpose();
    vector_transform(&m, n)
}
