//! The standard ray-tracing engine of the rendering core, independent
//! of the scene description interface.

pub mod bsp;
pub mod scene;
pub mod tessel;
pub mod trace;

pub use self::scene::{
    AttrFlags, Attributes, RayHitInfo, RayObject, RayObjectInstance, RayScene,
    RayTesselInstance,
};
pub use self::tessel::{CurveSegment, RayTessel, RayTriangle, RayVertex};

use self::bsp::{build_bsp, BspParams, BspPrimitives, BspTree};
use self::scene::transform_bbox;
use self::tessel::{generate_accel_triangles, RayAccelTriangles, RaySubtree};
use crate::error::Result;
use crate::math::*;
use crate::rtypes;
use crate::state::State;
use ember_db::array::DataArray;
use ember_db::record::{register_type, TypeDesc};
use ember_db::{Database, DbFlags, Error as DbError, Record, Tag};
use fxhash::FxHashMap;
use log::info;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

/// For fixing numerical error caused by `t_near`/`t_far` rejections.
pub const DISTANCE_TOL: f32 = 0.00005;
/// The hair sub-BSP must not be deeper than this.
pub const MAX_HAIR_BSP_DEPTH: i32 = 40;

/// The ray-tracing global options, provided by the user.
#[derive(Copy, Clone, Debug)]
pub struct RayOptions {
    pub acceleration: i32,
    pub bsp_size: usize,
    pub bsp_depth: i32,
}

impl Default for RayOptions {
    fn default() -> RayOptions {
        RayOptions {
            acceleration: 1,
            bsp_size: 10,
            bsp_depth: 30,
        }
    }
}

/// The ray-tracing camera transforms.
#[derive(Clone)]
pub struct RayCamera {
    pub camera_to_world: Mat4,
    pub motion_camera_to_world: Mat4,
    pub world_to_camera: Mat4,
    pub motion_world_to_camera: Mat4,
    pub moving: bool,
}

impl Default for RayCamera {
    fn default() -> RayCamera {
        RayCamera {
            camera_to_world: Mat4::identity(),
            motion_camera_to_world: Mat4::identity(),
            world_to_camera: Mat4::identity(),
            motion_world_to_camera: Mat4::identity(),
            moving: false,
        }
    }
}

/// Hook intersecting procedural tessellations; installed by the object
/// layer so the tracer stays independent of object kinds.
pub type ProceduralIntersectFn = Box<
    dyn Fn(&RayTracer, &mut State, u32, Tag, bool, &mut Vec<RayHitInfo>) + Send + Sync,
>;

/// Progress callback polled by builders; returning true aborts.
pub type BuildProgressFn = Box<dyn Fn(f32) -> bool + Send + Sync>;

struct RtInner {
    options: RayOptions,
    camera: RayCamera,
    scene: Tag,
}

/// The standard interface of the ray-tracing engine.
pub struct RayTracer {
    pub db: Arc<Database>,
    inner: RwLock<RtInner>,
    /// Source tessellation of each deferred accel/subtree record.
    links: Mutex<FxHashMap<Tag, Tag>>,
    pub procedural_intersect: RwLock<Option<ProceduralIntersectFn>>,
    pub build_progress: RwLock<Option<BuildProgressFn>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<T> {
    match m.lock() {
        Ok(g) => g,
        Err(p) => p.into_inner(),
    }
}

fn rlock<T>(l: &RwLock<T>) -> std::sync::RwLockReadGuard<T> {
    match l.read() {
        Ok(g) => g,
        Err(p) => p.into_inner(),
    }
}

fn wlock<T>(l: &RwLock<T>) -> std::sync::RwLockWriteGuard<T> {
    match l.write() {
        Ok(g) => g,
        Err(p) => p.into_inner(),
    }
}

/// Interface id of the ray tracer inside the database globals.
pub const IFACE_RAYTRACER: u32 = 1;

pub(crate) fn register_ray_types() {
    register_type(
        rtypes::RAY_TESSEL,
        TypeDesc::new("ray_tessel").with_decode(Box::new(|bytes| {
            RayTessel::decode(bytes)
                .map(|t| Box::new(t) as Box<dyn Record>)
                .ok_or(DbError::Corrupt("ray_tessel"))
        })),
    );
    register_type(rtypes::RAY_OBJECT, TypeDesc::new("ray_object"));
    register_type(rtypes::RAY_SCENE, TypeDesc::new("ray_scene"));
    register_type(
        rtypes::RAY_ACCEL_TRIANGLES,
        TypeDesc::new("ray_accel_triangles").with_generate(Box::new(|db, tag| {
            let rt = db
                .interface::<RayTracer>(IFACE_RAYTRACER)
                .ok_or(DbError::NoGenerator)?;
            let src = rt.link_source(tag).ok_or(DbError::NoGenerator)?;
            let tessel = db.read::<RayTessel>(src);
            Ok(Box::new(generate_accel_triangles(&tessel)) as Box<dyn Record>)
        })),
    );
    register_type(
        rtypes::RAY_SUBTREE,
        TypeDesc::new("ray_subtree").with_generate(Box::new(|db, tag| {
            let rt = db
                .interface::<RayTracer>(IFACE_RAYTRACER)
                .ok_or(DbError::NoGenerator)?;
            let src = rt.link_source(tag).ok_or(DbError::NoGenerator)?;
            let tree = rt
                .generate_subtree(src)
                .map_err(|_| DbError::Corrupt("sub-BSP build failed"))?;
            Ok(Box::new(RaySubtree { tree }) as Box<dyn Record>)
        })),
    );
}

/// Builds the sub-BSP over the triangles or curves of a tessellation.
struct TesselBspPrims<'a> {
    tessel: &'a RayTessel,
    motion: bool,
}

impl<'a> BspPrimitives for TesselBspPrims<'a> {
    fn num_prims(&self) -> usize {
        if self.tessel.curves.is_empty() {
            self.tessel.triangles.len()
        } else {
            self.tessel.curves.len()
        }
    }

    fn prim_bound(&self, index: u32) -> BBox {
        if self.tessel.curves.is_empty() {
            self.tessel
                .triangle_bound(&self.tessel.triangles[index as usize], self.motion)
        } else {
            self.tessel
                .curve_bound(&self.tessel.curves[index as usize], self.motion)
        }
    }

    fn prim_icost(&self, _index: u32) -> f32 {
        if self.tessel.curves.is_empty() {
            1.0
        } else {
            // curve tests are priced higher than triangle tests
            2.0
        }
    }
}

/// The top-level BSP primitives: world-space tessellation bounds.
struct SceneBspPrims<'a> {
    bounds: &'a [BBox],
    icosts: &'a [f32],
}

impl<'a> BspPrimitives for SceneBspPrims<'a> {
    fn num_prims(&self) -> usize {
        self.bounds.len()
    }

    fn prim_bound(&self, index: u32) -> BBox {
        self.bounds[index as usize]
    }

    fn prim_icost(&self, index: u32) -> f32 {
        self.icosts[index as usize]
    }
}

impl RayTracer {
    pub fn new(db: Arc<Database>) -> RayTracer {
        let scene = db.create(RayScene::empty(), DbFlags::empty());
        RayTracer {
            db,
            inner: RwLock::new(RtInner {
                options: RayOptions::default(),
                camera: RayCamera::default(),
                scene,
            }),
            links: Mutex::new(FxHashMap::default()),
            procedural_intersect: RwLock::new(None),
            build_progress: RwLock::new(None),
        }
    }

    pub fn scene_tag(&self) -> Tag {
        rlock(&self.inner).scene
    }

    pub fn options(&self) -> RayOptions {
        rlock(&self.inner).options
    }

    pub fn set_options(&self, options: RayOptions) {
        wlock(&self.inner).options = options;
    }

    pub fn camera(&self) -> RayCamera {
        rlock(&self.inner).camera.clone()
    }

    /// Installs the camera transforms and precomputes the inverses.
    pub fn set_camera(&self, camera_to_world: Mat4, motion_camera_to_world: Mat4) {
        let mut inner = wlock(&self.inner);
        inner.camera = RayCamera {
            camera_to_world,
            motion_camera_to_world,
            world_to_camera: glm::inverse(&camera_to_world),
            motion_world_to_camera: glm::inverse(&motion_camera_to_world),
            moving: camera_to_world != motion_camera_to_world,
        };
    }

    //----------------------------------------------------------------------------------------------
    // deferred record links

    pub fn set_link_source(&self, record: Tag, tessel: Tag) {
        lock(&self.links).insert(record, tessel);
    }

    pub fn link_source(&self, record: Tag) -> Option<Tag> {
        lock(&self.links).get(&record).copied()
    }

    fn generate_subtree(&self, tessel_tag: Tag) -> Result<BspTree> {
        let tessel = self.db.read::<RayTessel>(tessel_tag);
        let options = self.options();
        let is_hair = !tessel.curves.is_empty();
        let depth = if is_hair {
            options.bsp_depth.min(MAX_HAIR_BSP_DEPTH)
        } else {
            options.bsp_depth
        };
        let params = BspParams {
            bsp_size: options.bsp_size,
            bsp_depth: depth,
            progress: None,
        };
        let prims = TesselBspPrims {
            tessel: &tessel,
            motion: true,
        };
        let (tree, _stats) = build_bsp(&prims, &params)?;
        Ok(tree)
    }

    //----------------------------------------------------------------------------------------------
    // scene assembly

    /// Adds a finished tessellation to an object; thread-safe so
    /// approximation jobs can attach concurrently.
    pub fn add_tessel(&self, object: Tag, tessel: Tag) {
        let tessels = self.db.read::<RayObject>(object).tessels;
        DataArray::<Tag>::push(&self.db, tessels, tessel);
    }

    /// Clears the tessellations of a changed object so it re-dices.
    pub fn clear_tessels(&self, object: Tag) {
        let tessels = self.db.read::<RayObject>(object).tessels;
        let old: Vec<Tag> = self.db.read::<DataArray<Tag>>(tessels).items.clone();
        for t in old {
            let (accel, subtree) = {
                let tessel = self.db.read::<RayTessel>(t);
                (tessel.accel, tessel.subtree)
            };
            if !accel.is_null() {
                lock(&self.links).remove(&accel);
                self.db.delete(accel);
            }
            if !subtree.is_null() {
                lock(&self.links).remove(&subtree);
                self.db.delete(subtree);
            }
            self.db.delete(t);
        }
        self.db.write::<DataArray<Tag>>(tessels).items.clear();
    }

    /// Installs the object instances of the scene.
    pub fn set_instances(&self, instances: Vec<RayObjectInstance>) {
        let scene = self.scene_tag();
        self.db.write::<RayScene>(scene).instances = instances;
    }

    pub fn remove_instances(&self) {
        let scene = self.scene_tag();
        let mut s = self.db.write::<RayScene>(scene);
        s.instances.clear();
        s.tessel_instances.clear();
        s.tree = BspTree::default();
        s.scene_box = BBox::empty();
    }

    /// Begin ray-tracing mode: flattens (instance, tessellation) pairs
    /// and builds the top-level BSP over their world bounds.
    pub fn tracing(&self) -> Result<()> {
        let scene = self.scene_tag();
        let options = self.options();
        let mut tessel_instances = Vec::new();
        let mut bounds = Vec::new();
        let mut icosts = Vec::new();
        {
            let s = self.db.read::<RayScene>(scene);
            for (ii, inst) in s.instances.iter().enumerate() {
                if !inst.attr.visible() {
                    continue;
                }
                let tessels_tag = self.db.read::<RayObject>(inst.object).tessels;
                let tessels: Vec<Tag> =
                    self.db.read::<DataArray<Tag>>(tessels_tag).items.clone();
                for tessel in tessels {
                    let t = self.db.read::<RayTessel>(tessel);
                    let motion = inst.attr.motion();
                    let local = t.bound(motion);
                    let mut world = transform_bbox(&inst.object_to_world, &local);
                    if inst.moving {
                        world.union(&transform_bbox(&inst.motion_object_to_world, &local));
                    }
                    // guard against infinitely thin bounds
                    world.expand_relative(1.0e-4);
                    tessel_instances.push(RayTesselInstance {
                        tessel,
                        instance: ii as u32,
                    });
                    bounds.push(world);
                    icosts.push(if t.procedural || !t.curves.is_empty() {
                        2.0
                    } else {
                        1.0
                    });
                }
            }
        }
        // user aborts are polled through the progress callback
        let progress_guard = rlock(&self.build_progress);
        let progress = progress_guard
            .as_ref()
            .map(|f| f.as_ref() as &dyn Fn(f32) -> bool);
        let params = BspParams {
            bsp_size: options.bsp_size,
            bsp_depth: options.bsp_depth,
            progress,
        };
        let prims = SceneBspPrims {
            bounds: &bounds,
            icosts: &icosts,
        };
        let (tree, stats) = build_bsp(&prims, &params)?;
        drop(progress_guard);
        info!(
            "scene BSP: {} nodes, {} leaves over {} tessellation instances",
            stats.num_nodes,
            stats.num_leaves,
            tessel_instances.len()
        );
        let mut s = self.db.write::<RayScene>(scene);
        s.tessel_instances = tessel_instances;
        s.scene_box = tree.scene_box;
        s.tree = tree;
        Ok(())
    }

    pub fn end_tracing(&self) {}

    pub fn scene_box(&self) -> BBox {
        let scene = self.scene_tag();
        self.db.read::<RayScene>(scene).scene_box
    }

    pub fn scene_diag(&self) -> f32 {
        self.scene_box().diag()
    }

    pub fn end_scene(&self) {
        self.remove_instances();
    }
}
