//! The imperative scene description front-end.
//!
//! A thin layer that turns API calls into node-system edits and finally
//! a `render` command: photon passes, tessellation, the bucket loop and
//! the framebuffer flush.

use crate::camera::Camera;
use crate::error::{Error, Result};
use crate::framebuffer::{self, ChannelSource};
use crate::job;
use crate::light::LightInstance;
use crate::map;
use crate::material::Material;
use crate::math::*;
use crate::nodesys::{CreateNodeObjectFn, Node, NodeSystem, StorageClass};
use crate::obj::{
    self, ObjectSystem, TesselJob, TesselJobCtx, IFACE_NODESYS, IFACE_OBJECTS,
};
use crate::options::Options;
use crate::photon::Photon;
use crate::rt::{RayObject, RayObjectInstance, RayTracer, IFACE_RAYTRACER};
use crate::rtypes;
use crate::sampler::{
    self, BaseBucket, BucketJobCtx, BucketType, ChannelBinding, PassParams,
};
use crate::shader;
use crate::texture::{TextureSystem, IFACE_TEXTURES};
use crate::fg::Irradiance;
use ember_db::array::DataArray;
use ember_db::{Database, DbFlags, Tag, Value, ValueType};
use ember_plugin::PluginSystem;
use config::Config;
use fxhash::FxHashMap;
use log::{error, info, warn};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

/// A scene element reference inside an instance group.
#[derive(Clone)]
pub struct InstanceDef {
    pub element: String,
    pub transform: Mat4,
    pub motion_transform: Mat4,
    pub material: Option<String>,
    pub visible: bool,
    pub cast_shadow: bool,
}

#[derive(Clone, Eq, PartialEq, Hash)]
struct RepKey {
    object: Tag,
    motion: bool,
    displace: Tag,
    time: u32,
    view_time: u32,
}

/// Handles of the rendered output channels and the pass maps.
pub struct RenderOutput {
    pub color: Tag,
    pub opacity: Tag,
    pub user: Vec<(String, Tag)>,
    pub caustic_map: Tag,
    pub globillum_map: Tag,
}

/// One render context: the database and every engine interface built
/// on top of it.
pub struct RenderContext {
    pub db: Arc<Database>,
    pub nodesys: Arc<NodeSystem>,
    pub rt: Arc<RayTracer>,
    pub objects: Arc<ObjectSystem>,
    pub textures: Arc<TextureSystem>,
    materials: FxHashMap<String, Tag>,
    instances: FxHashMap<String, InstanceDef>,
    groups: FxHashMap<String, Vec<String>>,
    user_channels: Vec<(String, ValueType)>,
    shader_insts: Vec<Tag>,
    rep_cache: FxHashMap<RepKey, Tag>,
    fg_map: Option<Tag>,
    threads: usize,
    pub abort: Arc<AtomicBool>,
}

impl RenderContext {
    /// Creates a context; `cfg` supplies host-level tuning.
    pub fn new(cfg: &Config) -> Result<RenderContext> {
        rtypes::register_render_types();
        let mem_limit = cfg
            .get::<u64>("render.memory_limit")
            .unwrap_or(512 * 1024 * 1024) as usize;
        let threads = cfg.get::<usize>("render.threads").unwrap_or(0);
        let db = Arc::new(
            match cfg.get::<String>("render.page_file") {
                Ok(path) => Database::open(path.into(), mem_limit)?,
                Err(_) => Database::open_in_temp(mem_limit)?,
            },
        );
        let mut plugsys = PluginSystem::new();
        if let Ok(paths) = cfg.get::<Vec<String>>("render.plugin_paths") {
            for p in paths {
                plugsys.add_search_path(p.into());
            }
        }
        let nodesys = Arc::new(NodeSystem::new(db.clone(), plugsys));
        let rt = Arc::new(RayTracer::new(db.clone()));
        let objects = Arc::new(ObjectSystem::new());
        let textures = Arc::new(TextureSystem::new());

        db.set_interface(IFACE_RAYTRACER, rt.clone());
        db.set_interface(IFACE_NODESYS, nodesys.clone());
        db.set_interface(IFACE_OBJECTS, objects.clone());
        db.set_interface(IFACE_TEXTURES, textures.clone());
        obj::install_procedural_hook(&rt, objects.clone());

        crate::options::install_options_desc(&nodesys);
        crate::camera::install_camera_desc(&nodesys);
        crate::light::install_light_desc(&nodesys);
        install_object_descs(&nodesys);

        Ok(RenderContext {
            db,
            nodesys,
            rt,
            objects,
            textures,
            materials: FxHashMap::default(),
            instances: FxHashMap::default(),
            groups: FxHashMap::default(),
            user_channels: Vec::new(),
            shader_insts: Vec::new(),
            rep_cache: FxHashMap::default(),
            fg_map: None,
            threads: job::detect_threads(threads),
            abort: Arc::new(AtomicBool::new(false)),
        })
    }

    //----------------------------------------------------------------------------------------------
    // element blocks

    pub fn options(&self, name: &str) -> Result<Tag> {
        Ok(self.nodesys.node("options", name)?.0)
    }

    pub fn end_options(&self, tag: Tag) {
        self.nodesys.end_node(tag);
    }

    pub fn camera(&self, name: &str) -> Result<Tag> {
        Ok(self.nodesys.node("camera", name)?.0)
    }

    pub fn end_camera(&self, tag: Tag) {
        self.nodesys.end_node(tag);
    }

    pub fn light(&self, name: &str) -> Result<Tag> {
        Ok(self.nodesys.node("light", name)?.0)
    }

    pub fn end_light(&self, tag: Tag) {
        self.nodesys.end_node(tag);
    }

    /// Registers a built-in shader: its parameter interface and the
    /// object creator.
    pub fn declare_shader(
        &self,
        name: &str,
        params: &[(&str, ValueType, Value)],
        creator: CreateNodeObjectFn,
    ) {
        self.nodesys.register_creator(name, creator);
        let desc = self.nodesys.node_desc(name);
        for (pname, ty, default) in params {
            self.nodesys
                .desc_add_parameter(desc, StorageClass::Constant, *ty, pname, default.clone());
        }
        self.nodesys.end_node_desc(desc);
    }

    /// Begin editing a shader instance.
    pub fn shader(&mut self, desc_name: &str, inst_name: &str) -> Result<Tag> {
        let tag = shader::shader_instance(&self.nodesys, desc_name, inst_name)?;
        if !self.shader_insts.contains(&tag) {
            self.shader_insts.push(tag);
        }
        Ok(tag)
    }

    pub fn end_shader(&self, tag: Tag) {
        shader::end_shader_instance(&self.nodesys, tag);
    }

    /// Creates a named material; attach shaders with the `Material`
    /// helpers.
    pub fn material(&mut self, name: &str) -> Tag {
        if let Some(tag) = self.materials.get(name) {
            return *tag;
        }
        let tag = Material::create(&self.db);
        self.materials.insert(name.to_owned(), tag);
        tag
    }

    pub fn find_material(&self, name: &str) -> Option<Tag> {
        self.materials.get(name).copied()
    }

    /// Begin editing an object of the given kind.
    pub fn object(&self, kind: &str, name: &str) -> Result<Tag> {
        if self.objects.find(kind).is_none() {
            return Err(Error::UnsupportedObjectKind(kind.to_owned()));
        }
        let (tag, _) = self.nodesys.node(kind, name)?;
        Ok(tag)
    }

    pub fn end_object(&self, tag: Tag) {
        self.nodesys.end_node(tag);
    }

    /// Data array helpers for object geometry.
    pub fn vec3_array(&self, items: Vec<[f32; 3]>) -> Tag {
        DataArray::create_from(&self.db, rtypes::VEC3_ARRAY, items)
    }

    pub fn index_array(&self, items: Vec<u32>) -> Tag {
        DataArray::create_from(&self.db, rtypes::INDEX_ARRAY, items)
    }

    pub fn scalar_array(&self, items: Vec<f32>) -> Tag {
        DataArray::create_from(&self.db, rtypes::SCALAR_ARRAY, items)
    }

    pub fn tag_array(&self, items: Vec<Tag>) -> Tag {
        DataArray::create_from(&self.db, rtypes::TAG_ARRAY, items)
    }

    /// Places an element (object, light or group) into the scene.
    pub fn instance(&mut self, name: &str, def: InstanceDef) {
        self.instances.insert(name.to_owned(), def);
    }

    /// Declares an instance group from previously closed instances.
    pub fn instgroup(&mut self, name: &str, members: Vec<String>) {
        self.groups.insert(name.to_owned(), members);
    }

    /// Adds a user output channel populated from shader parameters of
    /// the same name.
    pub fn declare_channel(&mut self, name: &str, ty: ValueType) {
        self.user_channels.push((name.to_owned(), ty));
    }

    //----------------------------------------------------------------------------------------------
    // commit

    /// Resolves the instance DAG from the root group into flat object
    /// and light instances. Unresolved references are logged and
    /// skipped; cyclic groups abort the resolve of that branch.
    fn resolve_instances(
        &self,
        root: &str,
    ) -> (Vec<(Tag, InstanceDef)>, Vec<LightInstance>) {
        let mut objects = Vec::new();
        let mut lights = Vec::new();
        let mut visiting = Vec::new();
        self.resolve_group(
            root,
            &Mat4::identity(),
            &Mat4::identity(),
            &mut visiting,
            &mut objects,
            &mut lights,
        );
        (objects, lights)
    }

    fn resolve_group(
        &self,
        name: &str,
        parent: &Mat4,
        motion_parent: &Mat4,
        visiting: &mut Vec<String>,
        objects: &mut Vec<(Tag, InstanceDef)>,
        lights: &mut Vec<LightInstance>,
    ) {
        if visiting.iter().any(|n| n == name) {
            error!("{}", Error::CyclicInstanceGroup(name.to_owned()));
            return;
        }
        let members = match self.groups.get(name) {
            Some(m) => m.clone(),
            None => {
                error!("{}", Error::UnresolvedElement(name.to_owned()));
                return;
            }
        };
        visiting.push(name.to_owned());
        for member in members {
            let def = match self.instances.get(&member) {
                Some(d) => d.clone(),
                None => {
                    error!("{}", Error::UnresolvedElement(member.clone()));
                    continue;
                }
            };
            let transform = parent * def.transform;
            let motion_transform = motion_parent * def.motion_transform;
            if self.groups.contains_key(&def.element) {
                self.resolve_group(
                    &def.element,
                    &transform,
                    &motion_transform,
                    visiting,
                    objects,
                    lights,
                );
                continue;
            }
            let node = match self.nodesys.find_node(&def.element) {
                Some(t) => t,
                None => {
                    error!("{}", Error::UnresolvedElement(def.element.clone()));
                    continue;
                }
            };
            let desc_name = {
                let desc = self.db.read::<Node>(node).desc;
                self.db.read::<crate::nodesys::NodeDesc>(desc).name.clone()
            };
            if desc_name == "light" {
                lights.push(LightInstance::from_node(&self.nodesys, node, &transform));
            } else {
                let mut resolved = def.clone();
                resolved.transform = transform;
                resolved.motion_transform = motion_transform;
                objects.push((node, resolved));
            }
        }
        visiting.pop();
    }

    /// Ensures a ray-traceable representation of the object exists for
    /// these approximation inputs, sharing identical representations
    /// across instances. Returns the representation and, when newly
    /// created, its tessellation job.
    fn object_representation(
        &mut self,
        source: Tag,
        motion: bool,
        displace: Tag,
    ) -> Result<(Tag, Option<Tag>)> {
        let time = self.db.read::<Node>(source).time;
        let key = RepKey {
            object: source,
            motion,
            displace,
            time,
            view_time: 0,
        };
        if let Some(rep) = self.rep_cache.get(&key) {
            return Ok((*rep, None));
        }
        let kind = {
            let desc = self.db.read::<Node>(source).desc;
            self.db.read::<crate::nodesys::NodeDesc>(desc).name.clone()
        };
        let element = self
            .objects
            .find(&kind)
            .ok_or_else(|| Error::UnsupportedObjectKind(kind.clone()))?;
        let rep = RayObject::create(&self.db, source);
        let sub = element.create(&self.db, source)?;
        let deferred_dice = obj::object_wants_deferred_dice(&self.nodesys, source);
        let job = self.db.create(
            TesselJob {
                cam: Tag::null(),
                inst: Tag::null(),
                source,
                kind,
                motion,
                displace_list: displace,
                sub,
                raytraceable: rep,
                deferred_dice,
            },
            DbFlags::FLUSHABLE,
        );
        self.rep_cache.insert(key, rep);
        Ok((rep, Some(job)))
    }

    //----------------------------------------------------------------------------------------------
    // render

    pub fn render(
        &mut self,
        options_name: &str,
        camera_name: &str,
        root_group: &str,
    ) -> Result<RenderOutput> {
        let opt_node = self
            .nodesys
            .find_node(options_name)
            .ok_or_else(|| Error::UnresolvedElement(options_name.to_owned()))?;
        let cam_node = self
            .nodesys
            .find_node(camera_name)
            .ok_or_else(|| Error::UnresolvedElement(camera_name.to_owned()))?;
        let opt = Arc::new(Options::from_node(&self.nodesys, opt_node));
        let cam = Arc::new(Camera::from_node(&self.nodesys, cam_node));

        // committed graphs regenerate their closures lazily
        shader::invalidate_param_tables(&self.db, &self.shader_insts);

        self.rt.set_options(crate::rt::RayOptions {
            acceleration: opt.acceleration,
            bsp_size: opt.bsp_size,
            bsp_depth: opt.bsp_depth,
        });
        self.rt
            .set_camera(cam.camera_to_world, cam.motion_camera_to_world);

        // resolve the scene graph
        let (object_defs, lights) = self.resolve_instances(root_group);
        let lights = Arc::new(lights);
        info!(
            "committed {} object instances, {} lights",
            object_defs.len(),
            lights.len()
        );

        // build ray-traceable representations, sharing identical ones
        let mut ray_instances = Vec::new();
        let mut tessel_jobs = Vec::new();
        for (source, def) in object_defs {
            let material = def
                .material
                .as_ref()
                .and_then(|m| self.find_material(m))
                .unwrap_or_else(Tag::null);
            let displace = if material.is_null() {
                Tag::null()
            } else {
                self.db.read::<Material>(material).displace_list
            };
            let (rep, job) = match self.object_representation(source, opt.motion, displace) {
                Ok(r) => r,
                Err(e) => {
                    error!("skipping object instance: {}", e);
                    continue;
                }
            };
            if let Some(job) = job {
                tessel_jobs.push(job);
            }
            let mut flags = crate::rt::AttrFlags::empty();
            if def.visible {
                flags |= crate::rt::AttrFlags::VISIBLE;
            }
            if def.cast_shadow {
                flags |= crate::rt::AttrFlags::CAST_SHADOW;
            }
            if opt.motion {
                flags |= crate::rt::AttrFlags::MOTION;
            }
            let attr = crate::rt::Attributes { material, flags };
            ray_instances.push(RayObjectInstance::new(
                rep,
                attr,
                def.transform,
                def.motion_transform,
            ));
        }

        // the pass skeleton shared by all buckets
        let num_user_channels = self.user_channels.len();
        let mut pass = PassParams::default();

        let bucket_db = self.db.clone();
        let bucket_opt = opt.clone();
        let bucket_cam = cam.clone();
        let bucket_lights = lights.clone();
        let make_bucket = move |bucket_type: BucketType,
                                pass: PassParams,
                                channels: Vec<ChannelBinding>,
                                framebuffers: Arc<Vec<Tag>>| {
            Arc::new(BaseBucket {
                db: bucket_db.clone(),
                opt: bucket_opt.clone(),
                cam: bucket_cam.clone(),
                bucket_type,
                pass,
                channels,
                num_user_channels,
                lights: bucket_lights.clone(),
                framebuffers,
            })
        };

        // geometry approximation pass
        let tessel_bucket = make_bucket(
            BucketType::Tessel,
            pass.clone(),
            Vec::new(),
            Arc::new(Vec::new()),
        );
        job::run_jobs(&self.db, tessel_jobs, self.threads, &self.abort, |db, tag| {
            let mut ctx = TesselJobCtx {
                bucket: tessel_bucket.clone(),
            };
            if let Err(e) = db.exec_job(tag, &mut ctx) {
                error!("tessellation job failed: {}", e);
            }
        });

        self.rt.set_instances(ray_instances);
        self.rt.tracing()?;
        let scene_diag = self.rt.scene_diag().max(SCALAR_EPS);
        pass.caustic_radius = if opt.caustic_radius > 0.0 {
            opt.caustic_radius
        } else {
            scene_diag * 0.01
        };
        pass.globillum_radius = if opt.globillum_radius > 0.0 {
            opt.globillum_radius
        } else {
            scene_diag * 0.05
        };
        pass.finalgather_radius = if opt.finalgather_radius > 0.0 {
            opt.finalgather_radius
        } else {
            scene_diag * 0.1
        };
        pass.finalgather_max_dist = pass.finalgather_radius * 10.0;

        // photon passes
        if opt.caustic {
            let map = map::create_map::<Photon>(
                &self.db,
                rtypes::PHOTON_TABLE,
                rtypes::PHOTON_BLOCK,
                opt.caustic_photons,
            );
            pass.caustic_map = map;
            let mut photon_pass = pass.clone();
            photon_pass.photon_target = map;
            self.photon_pass(&make_bucket, photon_pass, opt.caustic_photons, &lights);
            map::map_balance::<Photon>(&self.db, map);
        }
        if opt.globillum {
            let map = map::create_map::<Photon>(
                &self.db,
                rtypes::PHOTON_TABLE,
                rtypes::PHOTON_BLOCK,
                opt.globillum_photons,
            );
            pass.globillum_map = map;
            let mut photon_pass = pass.clone();
            photon_pass.photon_target = map;
            self.photon_pass(&make_bucket, photon_pass, opt.globillum_photons, &lights);
            map::map_balance::<Photon>(&self.db, map);
        }

        // the irradiance cache persists across renders of one context
        if opt.finalgather {
            let map = match self.fg_map {
                Some(m) => m,
                None => {
                    let m = map::create_map::<Irradiance>(
                        &self.db,
                        rtypes::IRRAD_TABLE,
                        rtypes::IRRAD_BLOCK,
                        i32::max_value(),
                    );
                    self.fg_map = Some(m);
                    m
                }
            };
            pass.finalgather_map = map;
            // precompute pass: walk a coarse pixel grid, interpolating
            // where the cache answers and hemisphere-sampling where it
            // does not, then balance for the bucket loop
            let fg_bucket = make_bucket(
                BucketType::FinalGather,
                pass.clone(),
                Vec::new(),
                Arc::new(Vec::new()),
            );
            self.finalgather_prepass(&fg_bucket, &cam, &opt);
            map::map_balance::<Irradiance>(&self.db, map);
        }

        // output framebuffers: the standard pair plus user channels
        let color = framebuffer::create_framebuffer(
            &self.db,
            "color",
            ValueType::Vec3,
            ChannelSource::Color,
            cam.res_x,
            cam.res_y,
        );
        let opacity = framebuffer::create_framebuffer(
            &self.db,
            "opacity",
            ValueType::Vec3,
            ChannelSource::Opacity,
            cam.res_x,
            cam.res_y,
        );
        let mut fbs = vec![color, opacity];
        let mut channels = Vec::new();
        let mut user = Vec::new();
        for (slot, (name, ty)) in self.user_channels.iter().enumerate() {
            let fb = framebuffer::create_framebuffer(
                &self.db,
                name,
                *ty,
                ChannelSource::User(slot as u32),
                cam.res_x,
                cam.res_y,
            );
            channels.push(ChannelBinding {
                name: name.clone(),
                slot,
                ty: *ty,
            });
            user.push((name.clone(), fb));
            fbs.push(fb);
        }

        // the bucket loop
        let frame_bucket = make_bucket(
            BucketType::Frame,
            pass.clone(),
            channels,
            Arc::new(fbs),
        );
        let bucket_jobs: Vec<Tag> = sampler::split_buckets(cam.res_x, cam.res_y, opt.bucket_size)
            .into_iter()
            .map(|j| self.db.create(j, DbFlags::FLUSHABLE))
            .collect();
        info!("rendering {} buckets over {} threads", bucket_jobs.len(), self.threads);
        job::run_jobs(&self.db, bucket_jobs, self.threads, &self.abort, |db, tag| {
            let mut ctx = BucketJobCtx {
                bucket: frame_bucket.clone(),
            };
            if let Err(e) = db.exec_job(tag, &mut ctx) {
                error!("bucket job failed: {}", e);
            }
        });

        // records appended during the bucket loop become visible to the
        // next render's lookups
        if !pass.finalgather_map.is_null() {
            map::map_balance::<Irradiance>(&self.db, pass.finalgather_map);
        }

        // the imager chain reworks the resolved color plane in place
        if opt.imager && !cam.imager_list.is_null() {
            self.run_imager(&frame_bucket, color, cam.res_x, cam.res_y);
        }

        self.rt.end_tracing();
        Ok(RenderOutput {
            color,
            opacity,
            user,
            caustic_map: pass.caustic_map,
            globillum_map: pass.globillum_map,
        })
    }

    /// Runs the camera's imager shader list over every resolved pixel.
    fn run_imager(&self, bucket: &Arc<BaseBucket>, color_fb: Tag, res_x: u32, res_y: u32) {
        use crate::state::{RayType, State};
        use crate::tls::RayTls;
        use std::cell::RefCell;

        let imager_list = bucket.cam.imager_list;
        let tls = RefCell::new(RayTls::new());
        for y in 0..res_y {
            for x in 0..res_x {
                let px = framebuffer::get_pixel(&self.db, color_fb, x, y);
                let mut state = State::new(RayType::Output, bucket, &tls);
                state.raster = Vec2::new(x as f32 + 0.5, y as f32 + 0.5);
                state.result.color = Vec3::new(px[0], px[1], px[2]);
                let mut result = Vec4::new(px[0], px[1], px[2], 0.0);
                let changed = shader::call_shader_instance_list(
                    &self.nodesys,
                    &mut result,
                    &mut state,
                    imager_list,
                    None,
                );
                if changed {
                    framebuffer::set_pixel(
                        &self.db,
                        color_fb,
                        x,
                        y,
                        [result.x, result.y, result.z, px[3]],
                    );
                }
            }
        }
    }

    /// Coarse-grid final gather precompute over the camera plane.
    fn finalgather_prepass(
        &self,
        bucket: &Arc<BaseBucket>,
        cam: &Camera,
        opt: &Options,
    ) {
        use crate::rt::trace::{self, TraceMode};
        use crate::state::{RayType, State};
        use crate::tls::RayTls;
        use std::cell::RefCell;

        let tls = RefCell::new(RayTls::new());
        let step = ((4.0 / opt.finalgather_density.max(0.1)) as u32).max(1);
        let mut py = 0;
        while py < cam.res_y {
            let mut px = 0;
            while px < cam.res_x {
                let mut state = State::new(RayType::Eye, bucket, &tls);
                state.instance_number = crate::sampler::qmc::stream_seed(px, py, 0);
                state.dimension = 2;
                let (org, dir) =
                    cam.primary_ray(px as f32 + 0.5, py as f32 + 0.5, 0.0);
                state.org = org;
                state.dir = dir;
                state.t_near = cam.clip_hither;
                state.max_t = cam.clip_yon;
                let hit = trace::trace(&self.rt, &mut state, TraceMode::Nearest, |_| true);
                if hit {
                    trace::compute_hit_details(&self.rt, &mut state);
                    let mut irrad = Vec3::zeros();
                    crate::fg::compute_irradiance(&mut irrad, &mut state);
                }
                px += step;
            }
            py += step;
        }
    }

    /// The irradiance cache persisted across renders of this context.
    pub fn finalgather_map(&self) -> Option<Tag> {
        self.fg_map
    }

    fn photon_pass<F>(
        &self,
        make_bucket: &F,
        pass: PassParams,
        total_photons: i32,
        lights: &Arc<Vec<LightInstance>>,
    ) where
        F: Fn(BucketType, PassParams, Vec<ChannelBinding>, Arc<Vec<Tag>>) -> Arc<BaseBucket>,
    {
        if lights.is_empty() {
            warn!("photon pass without lights");
            return;
        }
        let bucket = make_bucket(BucketType::Photon, pass, Vec::new(), Arc::new(Vec::new()));
        let per_light = (total_photons.max(1) as u32) / lights.len() as u32;
        let slice = 1024u32;
        let mut jobs = Vec::new();
        for li in 0..lights.len() as u32 {
            let mut first = 0u32;
            while first < per_light {
                let count = slice.min(per_light - first);
                jobs.push(self.db.create(
                    sampler::PhotonJob {
                        light_index: li,
                        first,
                        count,
                        total: per_light,
                    },
                    DbFlags::FLUSHABLE,
                ));
                first += count;
            }
        }
        job::run_jobs(&self.db, jobs, self.threads, &self.abort, |db, tag| {
            let mut ctx = BucketJobCtx {
                bucket: bucket.clone(),
            };
            if let Err(e) = db.exec_job(tag, &mut ctx) {
                error!("photon job failed: {}", e);
            }
        });
    }
}

/// Installs the node descs of the built-in object kinds.
fn install_object_descs(nodesys: &NodeSystem) {
    let poly = nodesys.node_desc("poly");
    for name in ["pos_list", "motion_pos_list", "triangle_list"].iter().copied() {
        nodesys.desc_add_parameter(
            poly,
            StorageClass::Constant,
            ValueType::Tag,
            name,
            Value::Tag(Tag::null()),
        );
    }
    nodesys.desc_add_parameter(
        poly,
        StorageClass::Constant,
        ValueType::Bool,
        "deferred_dice",
        Value::Bool(false),
    );
    nodesys.end_node_desc(poly);

    let hair = nodesys.node_desc("hair");
    for name in ["vertex_list", "motion_vertex_list", "radius_list"].iter().copied() {
        nodesys.desc_add_parameter(
            hair,
            StorageClass::Constant,
            ValueType::Tag,
            name,
            Value::Tag(Tag::null()),
        );
    }
    nodesys.desc_add_parameter(
        hair,
        StorageClass::Constant,
        ValueType::Int,
        "degree",
        Value::Int(1),
    );
    nodesys.end_node_desc(hair);

    let proc = nodesys.node_desc("procedural");
    nodesys.desc_add_parameter(
        proc,
        StorageClass::Constant,
        ValueType::Vec3,
        "box_min",
        Value::Vec3([0.0; 3]),
    );
    nodesys.desc_add_parameter(
        proc,
        StorageClass::Constant,
        ValueType::Vec3,
        "box_max",
        Value::Vec3([0.0; 3]),
    );
    nodesys.desc_add_parameter(
        proc,
        StorageClass::Constant,
        ValueType::Tag,
        "geometry_list",
        Value::Tag(Tag::null()),
    );
    nodesys.desc_add_parameter(
        proc,
        StorageClass::Constant,
        ValueType::Bool,
        "deferred_dice",
        Value::Bool(false),
    );
    nodesys.end_node_desc(proc);
}

impl Default for InstanceDef {
    fn default() -> InstanceDef {
        InstanceDef {
            element: String::new(),
            transform: Mat4::identity(),
            motion_transform: Mat4::identity(),
            material: None,
            visible: true,
            cast_shadow: true,
        }
    }
}
