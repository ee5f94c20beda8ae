//! The rendering state of a ray, threaded through traversal and shading.

use crate::camera::Camera;
use crate::material::Material;
use crate::math::*;
use crate::options::Options;
use crate::sampler::BaseBucket;
use crate::shader::{ShaderCache, ShaderFrame};
use crate::tls::RayTls;
use ember_db::{Database, Tag, Value, NULL_INDEX};
use smallvec::SmallVec;
use std::cell::RefCell;

/// Absolute ray bias for avoiding self-intersections.
pub const RAY_BIAS: f32 = 0.0025;
/// Slope bias scale, proportional to the error of the intersection point.
pub const RAY_BIAS_SCALE: f32 = 0.02;
/// Number of user scalars describing an intersection.
pub const MAX_USER_DATA: usize = 8;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RayType {
    Eye,
    Transparent,
    Reflect,
    Refract,
    Light,
    Shadow,
    Environment,
    PhotonAbsorb,
    PhotonLight,
    PhotonReflectSpecular,
    PhotonReflectGlossy,
    PhotonReflectDiffuse,
    PhotonTransmitSpecular,
    PhotonTransmitGlossy,
    PhotonTransmitDiffuse,
    Displace,
    Output,
    PhotonScatterVolume,
    PhotonTransparent,
    FinalGather,
    PhotonEmitGlobillum,
    PhotonEmitCaustic,
    Probe,
}

impl RayType {
    pub fn is_photon(self) -> bool {
        match self {
            RayType::PhotonAbsorb
            | RayType::PhotonLight
            | RayType::PhotonReflectSpecular
            | RayType::PhotonReflectGlossy
            | RayType::PhotonReflectDiffuse
            | RayType::PhotonTransmitSpecular
            | RayType::PhotonTransmitGlossy
            | RayType::PhotonTransmitDiffuse
            | RayType::PhotonScatterVolume
            | RayType::PhotonTransparent
            | RayType::PhotonEmitGlobillum
            | RayType::PhotonEmitCaustic => true,
            _ => false,
        }
    }
}

/// The sampled information of one sub-pixel: the standard color and
/// opacity plus one slot per user output channel. All framebuffers of a
/// frame share this composite layout.
#[derive(Clone, Debug)]
pub struct SampleInfo {
    pub x: i32,
    pub y: i32,
    pub weight: f32,
    pub color: Vec3,
    pub opacity: Vec3,
    pub user: Vec<Value>,
}

impl SampleInfo {
    pub fn new(num_user: usize) -> SampleInfo {
        SampleInfo {
            x: 0,
            y: 0,
            weight: 0.0,
            color: Vec3::zeros(),
            opacity: Vec3::zeros(),
            user: vec![Value::None; num_user],
        }
    }

    pub fn reset(&mut self) {
        self.weight = 0.0;
        self.color = Vec3::zeros();
        self.opacity = Vec3::zeros();
        for u in self.user.iter_mut() {
            *u = Value::None;
        }
    }

    pub fn add(&mut self, other: &SampleInfo) {
        self.color += other.color;
        self.opacity += other.opacity;
        self.weight += other.weight;
    }

    pub fn scale(&mut self, s: f32) {
        self.color *= s;
        self.opacity *= s;
        self.weight *= s;
    }
}

/// The per-ray mutable record.
pub struct State<'a> {
    pub ray_type: RayType,
    pub bucket: &'a BaseBucket,
    pub tls: &'a RefCell<RayTls>,

    // ray geometry in world space
    pub org: Vec3,
    pub dir: Vec3,
    pub inv_dir: Vec3,
    pub raster: Vec2,
    pub time: f32,
    pub max_t: f32,
    pub t_near: f32,
    pub t_far: f32,

    // object-space ray, refreshed whenever the instance changes
    pub obj_org: Vec3,
    pub obj_dir: Vec3,

    // hit descriptor
    pub found_hit: bool,
    pub dot_nd: f32,
    pub hit_t: f32,
    pub prev_hit_t: f32,
    pub hit_bsp: Tag,
    pub hit_tessel_inst: u32,
    pub hit_tessel: Tag,
    pub hit_inst: Tag,
    pub hit_obj: Tag,
    pub hit_mtl: Tag,
    pub hit_tri: u32,
    pub hit_prim: u32,
    pub pass_motion: bool,
    pub hit_motion: bool,
    pub bary: Vec3,
    pub bias: f32,
    pub bias_scale: f32,
    pub user_data: [f32; MAX_USER_DATA],

    // shading differential geometry
    pub p: Vec3,
    pub n: Vec3,
    pub ng: Vec3,
    pub dpdu: Vec3,
    pub dpdv: Vec3,
    pub u: f32,
    pub v: f32,
    pub du: f32,
    pub dv: f32,
    pub dtime: f32,
    pub dpdtime: Vec3,
    pub distance: f32,

    // recursion counters
    pub reflect_depth: i32,
    pub refract_depth: i32,
    pub finalgather_diffuse_depth: i32,
    pub caustic_reflect_depth: i32,
    pub caustic_refract_depth: i32,
    pub globillum_reflect_depth: i32,
    pub globillum_refract_depth: i32,

    // Quasi-Monte Carlo cursors, strictly monotone across child rays
    pub instance_number: u32,
    pub dimension: u32,
    pub temp_dimension: u32,

    pub result: SampleInfo,

    // shader graph registers
    pub caches: Vec<ShaderCache>,
    pub frames: Vec<ShaderFrame>,
    /// The currently calling shader instance.
    pub shader: Tag,

    // predefined shader variables
    pub l: Vec3,
    pub cl: Vec3,
    pub ol: Vec3,
    /// Ray origin in camera space.
    pub e: Vec3,
    /// Ray direction in camera space.
    pub i: Vec3,

    // area light iteration
    pub u1: f32,
    pub u2: f32,
    pub current_light_index: i32,
    pub current_area_sample: u32,
    pub num_area_samples: u32,
    pub current_light_org: Vec3,
    pub current_light_dir: Vec3,
    pub current_surface: u32,

    /// Volume shader lists the ray is currently inside.
    pub current_volumes: SmallVec<[Tag; 4]>,
}

impl<'a> State<'a> {
    pub fn new(ray_type: RayType, bucket: &'a BaseBucket, tls: &'a RefCell<RayTls>) -> State<'a> {
        let num_user = bucket.num_user_channels;
        let mut state = State {
            ray_type,
            bucket,
            tls,
            org: Vec3::zeros(),
            dir: Vec3::zeros(),
            inv_dir: Vec3::zeros(),
            raster: Vec2::zeros(),
            time: 0.0,
            max_t: MAX_SCALAR,
            t_near: 0.0,
            t_far: MAX_SCALAR,
            obj_org: Vec3::zeros(),
            obj_dir: Vec3::zeros(),
            found_hit: false,
            dot_nd: 0.0,
            hit_t: MAX_SCALAR,
            prev_hit_t: 0.0,
            hit_bsp: Tag::null(),
            hit_tessel_inst: NULL_INDEX,
            hit_tessel: Tag::null(),
            hit_inst: Tag::null(),
            hit_obj: Tag::null(),
            hit_mtl: Tag::null(),
            hit_tri: NULL_INDEX,
            hit_prim: NULL_INDEX,
            pass_motion: false,
            hit_motion: false,
            bary: Vec3::zeros(),
            bias: RAY_BIAS,
            bias_scale: RAY_BIAS_SCALE,
            user_data: [0.0; MAX_USER_DATA],
            p: Vec3::zeros(),
            n: Vec3::zeros(),
            ng: Vec3::zeros(),
            dpdu: Vec3::zeros(),
            dpdv: Vec3::zeros(),
            u: 0.0,
            v: 0.0,
            du: 0.0,
            dv: 0.0,
            dtime: 0.0,
            dpdtime: Vec3::zeros(),
            distance: 0.0,
            reflect_depth: 0,
            refract_depth: 0,
            finalgather_diffuse_depth: 0,
            caustic_reflect_depth: 0,
            caustic_refract_depth: 0,
            globillum_reflect_depth: 0,
            globillum_refract_depth: 0,
            instance_number: 0,
            dimension: 0,
            temp_dimension: 0,
            result: SampleInfo::new(num_user),
            caches: Vec::new(),
            frames: Vec::new(),
            shader: Tag::null(),
            l: Vec3::zeros(),
            cl: Vec3::zeros(),
            ol: Vec3::zeros(),
            e: Vec3::zeros(),
            i: Vec3::zeros(),
            u1: 0.0,
            u2: 0.0,
            current_light_index: -1,
            current_area_sample: 0,
            num_area_samples: 0,
            current_light_org: Vec3::zeros(),
            current_light_dir: Vec3::zeros(),
            current_surface: 0,
            current_volumes: SmallVec::new(),
        };
        state.new_ray();
        state
    }

    pub fn db(&self) -> &'a Database {
        &self.bucket.db
    }

    pub fn opt(&self) -> &'a Options {
        &self.bucket.opt
    }

    pub fn cam(&self) -> &'a Camera {
        &self.bucket.cam
    }

    /// Precompute the inverse direction used by the slab tests.
    pub fn precompute(&mut self) {
        self.inv_dir = calc_inv_dir(&self.dir);
    }

    /// Resets hit information so the state can be reused for a new ray.
    pub fn new_ray(&mut self) {
        self.t_near = 0.0;
        self.t_far = MAX_SCALAR;
        self.found_hit = false;
        self.hit_t = MAX_SCALAR;
        self.hit_bsp = Tag::null();
        self.hit_tessel_inst = NULL_INDEX;
        self.hit_tessel = Tag::null();
        self.hit_inst = Tag::null();
        self.hit_obj = Tag::null();
        self.hit_mtl = Tag::null();
        self.hit_tri = NULL_INDEX;
        self.hit_prim = NULL_INDEX;
        self.pass_motion = false;
        self.hit_motion = false;
        self.bary = Vec3::zeros();
        self.bias = RAY_BIAS;
        self.bias_scale = RAY_BIAS_SCALE;
        self.user_data = [0.0; MAX_USER_DATA];
        self.current_light_index = -1;
        self.current_area_sample = 0;
        self.current_surface = 0;
        self.current_volumes.clear();
    }

    /// Seeds child-ray fields from a parent state: QMC cursors stay
    /// strictly monotone, time and raster position carry over.
    pub fn inherit(&mut self, parent: &State) {
        self.time = parent.time;
        self.dtime = parent.dtime;
        self.raster = parent.raster;
        self.instance_number = parent.instance_number;
        self.dimension = parent.dimension;
        self.temp_dimension = parent.temp_dimension;
        self.distance = parent.distance;
        self.reflect_depth = parent.reflect_depth;
        self.refract_depth = parent.refract_depth;
        self.finalgather_diffuse_depth = parent.finalgather_diffuse_depth;
        self.caustic_reflect_depth = parent.caustic_reflect_depth;
        self.caustic_refract_depth = parent.caustic_refract_depth;
        self.globillum_reflect_depth = parent.globillum_reflect_depth;
        self.globillum_refract_depth = parent.globillum_refract_depth;
    }

    /// Sets the initial volume list, clearing any existing volumes.
    pub fn init_volume(&mut self, volume: Tag) {
        if volume.is_null() {
            log::warn!("invalid volume shader to add");
            return;
        }
        self.current_volumes.clear();
        self.current_volumes.push(volume);
    }

    /// Inherits the parent's volume stack; guided by the sign of the
    /// parent's `dot_nd`, the hit material's volume list is appended
    /// when the ray enters the hit instance and removed when it leaves.
    pub fn inherit_volume(&mut self, parent: &State) {
        let mut hit_volume = Tag::null();
        if !parent.hit_mtl.is_null() {
            let list = parent.db().read::<Material>(parent.hit_mtl).volume_list;
            if !list.is_null() && Material::has_volume(parent.db(), parent.hit_mtl) {
                hit_volume = list;
            }
        }
        if hit_volume.is_null() {
            self.current_volumes = parent.current_volumes.clone();
            return;
        }
        let hit_index = parent
            .current_volumes
            .iter()
            .position(|v| *v == hit_volume);
        if parent.dot_nd < 0.0 {
            // entering the volume of the hit instance
            self.current_volumes = parent.current_volumes.clone();
            if hit_index.is_none() {
                self.current_volumes.push(hit_volume);
            }
        } else {
            // leaving the volume of the hit instance
            self.current_volumes = parent.current_volumes.clone();
            if let Some(i) = hit_index {
                self.current_volumes.remove(i);
            }
        }
    }
}

#[inline]
pub fn calc_inv_dir(dir: &Vec3) -> Vec3 {
    let mut inv = Vec3::zeros();
    for i in 0..3 {
        inv[i] = if dir[i].abs() > SCALAR_EPS {
            1.0 / dir[i]
        } else {
            dir[i].signum() / SCALAR_EPS
        };
    }
    inv
}

/// Transform a ray with a single matrix.
#[inline]
pub fn transform_ray(transform: &Mat4, org: &Vec3, dir: &Vec3) -> (Vec3, Vec3) {
    (point_transform(transform, org), vector_transform(transform, dir))
}

/// Transform a ray with a transform, a motion transform and a sample
/// time; end points are interpolated so `hit_t` stays uniform.
#[inline]
pub fn motion_transform_ray(
    transform: &Mat4,
    motion_transform: &Mat4,
    time: f32,
    org: &Vec3,
    dir: &Vec3,
) -> (Vec3, Vec3) {
    let org1 = point_transform(transform, org);
    let org2 = point_transform(motion_transform, org);
    let dir1 = vector_transform(transform, dir);
    let dir2 = vector_transform(motion_transform, dir);
    let out_org = lerp3(&org1, &org2, time);
    let end1 = dir1 + org1;
    let end2 = dir2 + org2;
    let out_dir = lerp3(&end1, &end2, time) - out_org;
    (out_org, out_dir)
}
