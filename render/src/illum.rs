//! Integration helpers the shading interface exposes to shaders:
//! environment and child-ray tracing, transparent shadows and the
//! illuminance loop over the committed lights.

use crate::material::Material;
use crate::math::*;
use crate::nodesys::NodeSystem;
use crate::obj::IFACE_NODESYS;
use crate::rt::trace::{self, TraceMode};
use crate::rt::{RayTracer, IFACE_RAYTRACER};
use crate::shader;
use crate::state::{RayType, State};
use ember_db::Tag;

fn interfaces<'a>(
    state: &State<'a>,
) -> Option<(std::sync::Arc<RayTracer>, std::sync::Arc<NodeSystem>)> {
    let db = state.db();
    Some((
        db.interface::<RayTracer>(IFACE_RAYTRACER)?,
        db.interface::<NodeSystem>(IFACE_NODESYS)?,
    ))
}

/// Runs the camera environment shader list for the state's ray
/// direction; the shaders write into the state's result.
pub fn trace_environment(state: &mut State) -> bool {
    let (_rt, nodesys) = match interfaces(state) {
        Some(i) => i,
        None => return false,
    };
    let env_list = state.cam().environment_list;
    if env_list.is_null() {
        return false;
    }
    let mut result = Vec4::zeros();
    let status = shader::call_shader_instance_list(&nodesys, &mut result, state, env_list, None);
    if status {
        state.result.color = Vec3::new(result.x, result.y, result.z);
    }
    status
}

/// Shades the recorded hit: surface shader list, then the inherited
/// volume list. Returns the shaded color.
pub fn shade_hit(state: &mut State) -> Vec3 {
    let (rt, nodesys) = match interfaces(state) {
        Some(i) => i,
        None => return Vec3::zeros(),
    };
    trace::compute_hit_details(&rt, state);
    let mut result = Vec4::zeros();
    if !state.hit_mtl.is_null() {
        let surface_list = rt.db.read::<Material>(state.hit_mtl).surface_list;
        shader::call_shader_instance_list(&nodesys, &mut result, state, surface_list, None);
        shader::call_current_volume_list(&nodesys, &mut result, state, None);
    }
    state.result.color
}

fn spawn_child<'a>(state: &State<'a>, ray_type: RayType, dir: &Vec3) -> State<'a> {
    let mut child = State::new(ray_type, state.bucket, state.tls);
    child.inherit(state);
    let bias = calc_bias(&state.ng, dir, state.bias, state.bias_scale);
    child.org = state.p + state.ng * bias * glm::dot(&state.ng, dir).signum();
    child.dir = *dir;
    child.instance_number = state.instance_number + 1;
    child.dimension = state.dimension + 2;
    child.inherit_volume(state);
    child
}

/// Traces a reflection child ray and returns its shaded color.
pub fn trace_reflection(state: &mut State, dir: &Vec3) -> (bool, Vec3) {
    if state.reflect_depth >= state.opt().trace_reflect_depth
        || state.reflect_depth + state.refract_depth >= state.opt().trace_sum_depth
    {
        return (false, Vec3::zeros());
    }
    let (rt, _nodesys) = match interfaces(state) {
        Some(i) => i,
        None => return (false, Vec3::zeros()),
    };
    let mut child = spawn_child(state, RayType::Reflect, dir);
    child.reflect_depth += 1;
    let hit = trace::trace(&rt, &mut child, TraceMode::Nearest, |s| {
        shade_hit(s);
        true
    });
    let color = if hit {
        child.result.color
    } else {
        child.result.color = Vec3::zeros();
        trace_environment(&mut child);
        child.result.color
    };
    state.pass_motion |= child.pass_motion;
    state.instance_number = state.instance_number.max(child.instance_number);
    (hit, color)
}

/// Traces a refraction child ray and returns its shaded color.
pub fn trace_refraction(state: &mut State, dir: &Vec3) -> (bool, Vec3) {
    if state.refract_depth >= state.opt().trace_refract_depth
        || state.reflect_depth + state.refract_depth >= state.opt().trace_sum_depth
    {
        return (false, Vec3::zeros());
    }
    let (rt, _nodesys) = match interfaces(state) {
        Some(i) => i,
        None => return (false, Vec3::zeros()),
    };
    let mut child = spawn_child(state, RayType::Refract, dir);
    child.refract_depth += 1;
    let hit = trace::trace(&rt, &mut child, TraceMode::Nearest, |s| {
        shade_hit(s);
        true
    });
    let color = if hit {
        child.result.color
    } else {
        child.result.color = Vec3::zeros();
        trace_environment(&mut child);
        child.result.color
    };
    state.pass_motion |= child.pass_motion;
    (hit, color)
}

/// Continues the ray through the surface unchanged (transparency).
pub fn trace_transparent(state: &mut State) -> (bool, Vec3) {
    let dir = state.dir;
    let dir = glm::normalize(&dir);
    if state.refract_depth >= state.opt().trace_refract_depth {
        return (false, Vec3::zeros());
    }
    let (rt, _nodesys) = match interfaces(state) {
        Some(i) => i,
        None => return (false, Vec3::zeros()),
    };
    let mut child = spawn_child(state, RayType::Transparent, &dir);
    child.refract_depth += 1;
    let hit = trace::trace(&rt, &mut child, TraceMode::Nearest, |s| {
        shade_hit(s);
        true
    });
    let color = if hit {
        child.result.color
    } else {
        child.result.color = Vec3::zeros();
        trace_environment(&mut child);
        child.result.color
    };
    state.pass_motion |= child.pass_motion;
    (hit, color)
}

/// Shadow transmittance from the shading point towards a light.
///
/// The traversal collects every intersection along the segment, sorts
/// by distance and replays: opaque surfaces stop the walk, surfaces
/// with a shadow shader multiply their transparency in. The result is
/// componentwise transmittance, one for a clear path.
pub fn trace_shadow(state: &mut State, light_org: &Vec3) -> Vec3 {
    let (rt, nodesys) = match interfaces(state) {
        Some(i) => i,
        None => return Vec3::new(1.0, 1.0, 1.0),
    };
    let to_light = light_org - state.p;
    let dist = glm::length(&to_light);
    if dist < SCALAR_EPS {
        return Vec3::new(1.0, 1.0, 1.0);
    }
    let dir = to_light / dist;
    let bias = calc_bias(&state.ng, &dir, state.bias, state.bias_scale);
    let mut shadow = State::new(RayType::Shadow, state.bucket, state.tls);
    shadow.inherit(state);
    shadow.org = state.p + state.ng * bias * glm::dot(&state.ng, &dir).signum();
    shadow.dir = dir;
    shadow.max_t = dist - bias;
    shadow.current_volumes = state.current_volumes.clone();

    let mut transmittance = Vec3::new(1.0, 1.0, 1.0);
    trace::trace(&rt, &mut shadow, TraceMode::Sort, |s| {
        let mtl = s.hit_mtl;
        if mtl.is_null() {
            transmittance = Vec3::zeros();
            return true;
        }
        let shadow_list = rt.db.read::<Material>(mtl).shadow_list;
        let has_shadow_shader = !shadow_list.is_null()
            && !rt
                .db
                .read::<ember_db::array::DataArray<Tag>>(shadow_list)
                .items
                .is_empty();
        if has_shadow_shader {
            trace::compute_hit_details(&rt, s);
            let mut result = Vec4::zeros();
            shader::call_shader_instance_list(&nodesys, &mut result, s, shadow_list, None);
            // the shadow shader returns per-channel transparency
            transmittance.x *= result.x;
            transmittance.y *= result.y;
            transmittance.z *= result.z;
            transmittance.x.max(transmittance.y).max(transmittance.z) < 1.0e-4
        } else {
            // opaque occluder
            transmittance = Vec3::zeros();
            true
        }
    });
    state.pass_motion |= shadow.pass_motion;
    transmittance
}

/// One step of the illuminance loop: samples light `index` from the
/// committed light list, filling `L` (unit direction towards the
/// light) and `Cl` (arriving radiance after shadowing). Returns false
/// past the last light.
pub fn sample_light(state: &mut State, index: usize) -> bool {
    let lights = state.bucket.lights.clone();
    let light = match lights.get(index) {
        Some(l) => l.clone(),
        None => return false,
    };
    let to_light = light.origin - state.p;
    let dist2 = glm::dot(&to_light, &to_light).max(SCALAR_EPS);
    let dist = dist2.sqrt();
    state.l = to_light / dist;
    let mut cl = light.energy / dist2;
    if light.cast_shadow {
        let origin = light.origin;
        let transmittance = trace_shadow(state, &origin);
        cl.x *= transmittance.x;
        cl.y *= transmittance.y;
        cl.z *= transmittance.z;
    }
    state.cl = cl;
    state.ol = Vec3::new(1.0, 1.0, 1.0);
    state.current_light_index = index as i32;
    true
}

/// Number of committed lights visible to the illuminance loop.
pub fn num_lights(state: &State) -> usize {
    state.bucket.lights.len()
}
