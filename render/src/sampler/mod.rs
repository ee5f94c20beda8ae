//! The bucket pipeline: screen-space bucket jobs, adaptive
//! supersampling and sample reconstruction.

pub mod filter;
pub mod qmc;

use crate::camera::Camera;
use crate::framebuffer::FrameBufferCache;
use crate::illum;
use crate::light::LightInstance;
use crate::math::*;
use crate::nodesys::NodeSystem;
use crate::obj::IFACE_NODESYS;
use crate::options::Options;
use crate::photon;
use crate::rt::trace::{self, TraceMode};
use crate::rt::{RayTracer, IFACE_RAYTRACER};
use crate::rtypes;
use crate::shader;
use crate::state::{RayType, SampleInfo, State};
use crate::tls::RayTls;
use ember_db::record::{register_type, TypeDesc};
use ember_db::{Database, Error as DbError, Record, RecordType, Tag, ValueType};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::error;
use smallvec::SmallVec;
use std::cell::RefCell;
use std::mem;
use std::sync::Arc;

pub const DEFAULT_BUCKET_SIZE: u32 = 48;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BucketType {
    /// Camera-plane rendering into framebuffers.
    Frame,
    /// Photon emission pass.
    Photon,
    /// Final gather precompute pass.
    FinalGather,
    /// Geometry approximation pass.
    Tessel,
}

/// Per-pass parameters shared by every bucket of the pass.
#[derive(Clone)]
pub struct PassParams {
    pub photon_target: Tag,
    pub caustic_map: Tag,
    pub globillum_map: Tag,
    pub finalgather_map: Tag,
    pub caustic_radius: f32,
    pub globillum_radius: f32,
    pub finalgather_radius: f32,
    pub finalgather_max_dist: f32,
    pub finalgather_falloff: bool,
    pub finalgather_falloff_start: f32,
    pub finalgather_falloff_stop: f32,
}

impl Default for PassParams {
    fn default() -> PassParams {
        PassParams {
            photon_target: Tag::null(),
            caustic_map: Tag::null(),
            globillum_map: Tag::null(),
            finalgather_map: Tag::null(),
            caustic_radius: 0.0,
            globillum_radius: 0.0,
            finalgather_radius: MAX_SCALAR,
            finalgather_max_dist: 1.0,
            finalgather_falloff: false,
            finalgather_falloff_start: 0.0,
            finalgather_falloff_stop: 0.0,
        }
    }
}

/// Binding of a user output channel to a shader parameter name.
#[derive(Clone, Debug)]
pub struct ChannelBinding {
    pub name: String,
    pub slot: usize,
    pub ty: ValueType,
}

/// Everything a ray state needs to reach the pass context.
pub struct BaseBucket {
    pub db: Arc<Database>,
    pub opt: Arc<Options>,
    pub cam: Arc<Camera>,
    pub bucket_type: BucketType,
    pub pass: PassParams,
    pub channels: Vec<ChannelBinding>,
    pub num_user_channels: usize,
    pub lights: Arc<Vec<LightInstance>>,
    /// Framebuffers receiving samples in a frame pass.
    pub framebuffers: Arc<Vec<Tag>>,
}

//--------------------------------------------------------------------------------------------------
// job records

/// One screen bucket.
pub struct BucketJob {
    pub x0: i32,
    pub y0: i32,
    pub x1: i32,
    pub y1: i32,
}

impl Record for BucketJob {
    fn type_id(&self) -> RecordType {
        rtypes::BUCKET_JOB
    }

    fn size_hint(&self) -> usize {
        mem::size_of::<Self>()
    }

    fn encode(&self, w: &mut Vec<u8>) -> ember_db::Result<()> {
        for v in [self.x0, self.y0, self.x1, self.y1].iter() {
            w.write_i32::<LittleEndian>(*v).unwrap();
        }
        Ok(())
    }
}

/// A slice of one light's photon emission.
pub struct PhotonJob {
    pub light_index: u32,
    pub first: u32,
    pub count: u32,
    pub total: u32,
}

impl Record for PhotonJob {
    fn type_id(&self) -> RecordType {
        rtypes::PHOTON_JOB
    }

    fn size_hint(&self) -> usize {
        mem::size_of::<Self>()
    }

    fn encode(&self, w: &mut Vec<u8>) -> ember_db::Result<()> {
        for v in [self.light_index, self.first, self.count, self.total].iter() {
            w.write_u32::<LittleEndian>(*v).unwrap();
        }
        Ok(())
    }
}

/// Worker context of frame and photon jobs.
pub struct BucketJobCtx {
    pub bucket: Arc<BaseBucket>,
}

pub(crate) fn register_sampler_types() {
    register_type(
        rtypes::BUCKET_JOB,
        TypeDesc::new("bucket_job")
            .with_decode(Box::new(|bytes| {
                let mut r = bytes;
                let mut v = [0i32; 4];
                for x in v.iter_mut() {
                    *x = r
                        .read_i32::<LittleEndian>()
                        .map_err(|_| DbError::Corrupt("bucket job"))?;
                }
                Ok(Box::new(BucketJob {
                    x0: v[0],
                    y0: v[1],
                    x1: v[2],
                    y1: v[3],
                }) as Box<dyn Record>)
            }))
            .with_exec_job(Box::new(|db, tag, ctx| {
                let ctx = match ctx.downcast_ref::<BucketJobCtx>() {
                    Some(c) => c,
                    None => return Err(DbError::UnknownType),
                };
                let job = {
                    let j = db.read::<BucketJob>(tag);
                    BucketJob {
                        x0: j.x0,
                        y0: j.y0,
                        x1: j.x1,
                        y1: j.y1,
                    }
                };
                render_bucket(&ctx.bucket, &job);
                Ok(())
            })),
    );
    register_type(
        rtypes::PHOTON_JOB,
        TypeDesc::new("photon_job")
            .with_decode(Box::new(|bytes| {
                let mut r = bytes;
                let mut v = [0u32; 4];
                for x in v.iter_mut() {
                    *x = r
                        .read_u32::<LittleEndian>()
                        .map_err(|_| DbError::Corrupt("photon job"))?;
                }
                Ok(Box::new(PhotonJob {
                    light_index: v[0],
                    first: v[1],
                    count: v[2],
                    total: v[3],
                }) as Box<dyn Record>)
            }))
            .with_exec_job(Box::new(|db, tag, ctx| {
                let ctx = match ctx.downcast_ref::<BucketJobCtx>() {
                    Some(c) => c,
                    None => return Err(DbError::UnknownType),
                };
                let job = {
                    let j = db.read::<PhotonJob>(tag);
                    PhotonJob {
                        light_index: j.light_index,
                        first: j.first,
                        count: j.count,
                        total: j.total,
                    }
                };
                emit_photons(&ctx.bucket, &job);
                Ok(())
            })),
    );
}

//--------------------------------------------------------------------------------------------------
// frame buckets

type PixelSamples = SmallVec<[(f32, f32, SampleInfo); 16]>;

/// Renders one bucket: adaptive sampling per pixel, reconstruction
/// into the per-bucket framebuffer caches, one flush at the end.
pub fn render_bucket(bucket: &Arc<BaseBucket>, job: &BucketJob) {
    let db = &bucket.db;
    let tls = RefCell::new(RayTls::new());
    let margin = (bucket.opt.filter_size * 0.5).ceil() as i32;
    let mut caches: Vec<FrameBufferCache> = bucket
        .framebuffers
        .iter()
        .map(|fb| {
            FrameBufferCache::new(
                db,
                *fb,
                job.x0 - margin,
                job.y0 - margin,
                job.x1 + margin,
                job.y1 + margin,
            )
        })
        .collect();

    for py in job.y0..job.y1 {
        for px in job.x0..job.x1 {
            let samples = sample_pixel(bucket, &tls, px, py);
            for (sx, sy, info) in samples.iter() {
                splat_sample(bucket, &mut caches, *sx, *sy, info);
            }
        }
    }
    for cache in caches.iter_mut() {
        cache.flush(db);
    }
}

/// Accumulates one sample into every framebuffer under the
/// reconstruction filter.
fn splat_sample(
    bucket: &BaseBucket,
    caches: &mut [FrameBufferCache],
    sx: f32,
    sy: f32,
    info: &SampleInfo,
) {
    let radius = bucket.opt.filter_size * 0.5;
    let x_min = (sx - radius).floor() as i32;
    let x_max = (sx + radius).ceil() as i32;
    let y_min = (sy - radius).floor() as i32;
    let y_max = (sy + radius).ceil() as i32;
    for py in y_min..=y_max {
        for px in x_min..=x_max {
            let dx = px as f32 + 0.5 - sx;
            let dy = py as f32 + 0.5 - sy;
            let w = filter::filter_weight(bucket.opt.filter, dx, dy, bucket.opt.filter_size);
            if w <= 0.0 {
                continue;
            }
            for cache in caches.iter_mut() {
                let value = cache.source.extract(info);
                cache.add_sample(px, py, value, w);
            }
        }
    }
}

/// Adaptive supersampling of one pixel: start at `2^min_samples`
/// samples, double while the per-channel contrast between the samples
/// exceeds the threshold, up to `2^max_samples`.
fn sample_pixel(bucket: &Arc<BaseBucket>, tls: &RefCell<RayTls>, px: i32, py: i32) -> PixelSamples {
    let opt = &bucket.opt;
    let min_n = 1usize << opt.min_samples.max(0) as usize;
    let max_n = (1usize << opt.max_samples.max(0) as usize).max(min_n);
    let mut samples: PixelSamples = SmallVec::new();
    let mut n = 0usize;
    let mut target = min_n;
    loop {
        while n < target {
            let (sx, sy, info) = sample_once(bucket, tls, px, py, n as u32);
            samples.push((sx, sy, info));
            n += 1;
        }
        if target >= max_n || !contrast_exceeded(&samples, &opt.contrast) {
            break;
        }
        target = (target * 2).min(max_n);
    }
    samples
}

fn contrast_exceeded(samples: &PixelSamples, contrast: &Vec4) -> bool {
    if samples.len() < 2 {
        return true;
    }
    let mut min_c = Vec3::new(MAX_SCALAR, MAX_SCALAR, MAX_SCALAR);
    let mut max_c = Vec3::new(-MAX_SCALAR, -MAX_SCALAR, -MAX_SCALAR);
    for (_, _, info) in samples.iter() {
        for k in 0..3 {
            min_c[k] = min_c[k].min(info.color[k]);
            max_c[k] = max_c[k].max(info.color[k]);
        }
    }
    (0..3).any(|k| max_c[k] - min_c[k] > contrast[k])
}

fn hash01(x: u32, y: u32) -> f32 {
    let mut h = x.wrapping_mul(0x85ebca6b) ^ y.wrapping_mul(0xc2b2ae35);
    h ^= h >> 13;
    h = h.wrapping_mul(0x27d4eb2f);
    (h >> 8) as f32 / (1u32 << 24) as f32
}

/// Takes one eye sample of the pixel.
fn sample_once(
    bucket: &Arc<BaseBucket>,
    tls: &RefCell<RayTls>,
    px: i32,
    py: i32,
    sample_index: u32,
) -> (f32, f32, SampleInfo) {
    let db = &bucket.db;
    let rt = db.interface::<RayTracer>(IFACE_RAYTRACER);
    let nodesys = db.interface::<NodeSystem>(IFACE_NODESYS);

    // Cranley-Patterson rotated stratified sub-pixel position
    let jx = (qmc::sigma(0, sample_index) + hash01(px as u32, py as u32)).fract();
    let jy = (qmc::sigma(1, sample_index) + hash01(py as u32, px as u32)).fract();
    let sx = px as f32 + jx;
    let sy = py as f32 + jy;

    let mut state = State::new(RayType::Eye, bucket, tls);
    let seed = qmc::stream_seed(px as u32, py as u32, sample_index);
    state.instance_number = seed;
    state.dimension = 2;
    state.raster = Vec2::new(sx, sy);
    state.du = 1.0;
    state.dv = 1.0;
    if bucket.opt.motion {
        state.time = bucket.opt.shutter_open
            + qmc::sigma(2, seed) * (bucket.opt.shutter_close - bucket.opt.shutter_open);
    }

    // the lens chain seeds the primary ray; default perspective when
    // the camera has no lens shaders
    let mut shot = false;
    if !bucket.cam.lens_list.is_null() {
        if let Some(ns) = nodesys.as_ref() {
            let mut result = Vec4::zeros();
            shot = shader::call_shader_instance_list(
                ns,
                &mut result,
                &mut state,
                bucket.cam.lens_list,
                None,
            );
        }
    }
    if !shot {
        let (org, dir) = bucket.cam.primary_ray(sx, sy, state.time);
        state.org = org;
        state.dir = dir;
    }
    state.t_near = bucket.cam.clip_hither;
    state.max_t = bucket.cam.clip_yon;

    if let Some(rt) = rt.as_ref() {
        let hit = trace::trace(rt, &mut state, TraceMode::Nearest, |s| {
            illum::shade_hit(s);
            s.result.weight = 1.0;
            true
        });
        if !hit {
            illum::trace_environment(&mut state);
        }
    }

    state.result.x = px;
    state.result.y = py;
    let info = state.result.clone();
    (sx, sy, info)
}

//--------------------------------------------------------------------------------------------------
// photon buckets

/// Emits one slice of a light's photons and traces them into the
/// pass's target map.
pub fn emit_photons(bucket: &Arc<BaseBucket>, job: &PhotonJob) {
    let lights = bucket.lights.clone();
    let light = match lights.get(job.light_index as usize) {
        Some(l) => l.clone(),
        None => {
            error!("photon job names a missing light");
            return;
        }
    };
    let tls = RefCell::new(RayTls::new());
    let ray_type = if bucket.pass.photon_target == bucket.pass.caustic_map {
        RayType::PhotonEmitCaustic
    } else {
        RayType::PhotonEmitGlobillum
    };
    let inv_total = 1.0 / job.total.max(1) as f32;
    for i in job.first..job.first + job.count {
        let mut state = State::new(ray_type, bucket, &tls);
        state.instance_number = i;
        state.dimension = 2;
        // uniform sphere direction from the low-discrepancy pair
        let u1 = qmc::sigma(0, i);
        let u2 = qmc::sigma(1, i);
        let z = 1.0 - 2.0 * u1;
        let r = (1.0 - z * z).max(0.0).sqrt();
        let phi = 2.0 * PI * u2;
        state.org = light.origin;
        state.dir = Vec3::new(r * phi.cos(), r * phi.sin(), z);
        let energy = light.energy * (4.0 * PI) * inv_total;
        photon::trace_photon(&mut state, energy);
    }
}

//--------------------------------------------------------------------------------------------------
// quantization

/// Quantizes one channel value through the options' exposure and
/// quantize settings; `dither` is the per-pixel dither offset.
pub fn quantize_value(opt: &Options, v: f32, dither: f32) -> f32 {
    let exposed = if opt.exposure_gamma != 1.0 && v > 0.0 {
        (v * opt.exposure_gain).powf(1.0 / opt.exposure_gamma)
    } else {
        v * opt.exposure_gain
    };
    let q = (exposed * opt.quantize_one + opt.quantize_dither_amplitude * dither).round();
    q.max(opt.quantize_min).min(opt.quantize_max)
}

/// Quantizes a resolved scanline for a codec.
pub fn quantize_scanline(opt: &Options, scanline: &[[f32; 4]], y: u32) -> Vec<[f32; 4]> {
    scanline
        .iter()
        .enumerate()
        .map(|(x, px)| {
            let dither = hash01(x as u32, y) - 0.5;
            [
                quantize_value(opt, px[0], dither),
                quantize_value(opt, px[1], dither),
                quantize_value(opt, px[2], dither),
                quantize_value(opt, px[3], dither),
            ]
        })
        .collect()
}

/// Splits the screen into square buckets, left-to-right, top-to-bottom.
pub fn split_buckets(width: u32, height: u32, bucket_size: u32) -> Vec<BucketJob> {
    let size = bucket_size.max(1) as i32;
    let mut jobs = Vec::new();
    let mut y = 0i32;
    while y < height as i32 {
        let mut x = 0i32;
        while x < width as i32 {
            jobs.push(BucketJob {
                x0: x,
                y0: y,
                x1: (x + size).min(width as i32),
                y1: (y + size).min(height as i32),
            });
            x += size;
        }
        y += size;
    }
    jobs
}
