//! Geometry approximation: per-kind object elements, the tessellation
//! job executor and primitive variable interpolation.

pub mod hair;
pub mod poly;
pub mod proc_obj;

use crate::error::{Error, Result};
use crate::math::*;
use crate::nodesys::{Node, NodeSystem, StorageClass};
use crate::rt::tessel::{create_deferred_tessel, end_tessel, RayTessel};
use crate::rt::{RayTracer, IFACE_RAYTRACER};
use crate::rtypes;
use crate::shader;
use crate::state::{RayType, State};
use crate::tls::RayTls;
use ember_db::record::{register_type, TypeDesc};
use ember_db::table::TableItem;
use ember_db::{Database, DbFlags, Record, RecordType, Tag, Value, ValueType};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use fxhash::FxHashMap;
use log::{debug, error, warn};
use std::cell::RefCell;
use std::mem;
use std::sync::{Arc, RwLock};

/// Interface id of the object system inside the database globals.
pub const IFACE_OBJECTS: u32 = 3;
/// Interface id of the node system inside the database globals.
pub const IFACE_NODESYS: u32 = 2;

/// Upper bound of primitives diced into a single tessellation.
pub const MAX_TESSEL_PRIMS: u32 = 4096;

/// The tessellable sub-object fed to dicing: a primitive range of the
/// source object at a subdivision level.
#[derive(Copy, Clone, Debug)]
pub struct Tessellable {
    pub first_prim: u32,
    pub num_prims: u32,
    pub subdiv: u32,
}

impl Tessellable {
    fn encode(&self, w: &mut Vec<u8>) {
        w.write_u32::<LittleEndian>(self.first_prim).unwrap();
        w.write_u32::<LittleEndian>(self.num_prims).unwrap();
        w.write_u32::<LittleEndian>(self.subdiv).unwrap();
    }

    fn decode(r: &mut &[u8]) -> Option<Tessellable> {
        Some(Tessellable {
            first_prim: r.read_u32::<LittleEndian>().ok()?,
            num_prims: r.read_u32::<LittleEndian>().ok()?,
            subdiv: r.read_u32::<LittleEndian>().ok()?,
        })
    }
}

/// The tessellation job stored in the database so deferred dicing can
/// execute it from any worker.
pub struct TesselJob {
    /// Current camera for view-dependent tessellation; null for object
    /// space representations shared across instances.
    pub cam: Tag,
    pub inst: Tag,
    pub source: Tag,
    /// Dispatch key into the object element registry.
    pub kind: String,
    pub motion: bool,
    pub displace_list: Tag,
    pub sub: Tessellable,
    /// The ray-traceable object collecting finished tessellations.
    pub raytraceable: Tag,
    pub deferred_dice: bool,
}

impl Record for TesselJob {
    fn type_id(&self) -> RecordType {
        rtypes::TESSEL_JOB
    }

    fn size_hint(&self) -> usize {
        mem::size_of::<Self>() + self.kind.len()
    }

    fn encode(&self, w: &mut Vec<u8>) -> ember_db::Result<()> {
        self.cam.encode_item(w);
        self.inst.encode_item(w);
        self.source.encode_item(w);
        w.write_u32::<LittleEndian>(self.kind.len() as u32).unwrap();
        w.extend_from_slice(self.kind.as_bytes());
        w.push(self.motion as u8);
        self.displace_list.encode_item(w);
        self.sub.encode(w);
        self.raytraceable.encode_item(w);
        w.push(self.deferred_dice as u8);
        Ok(())
    }
}

/// Context for the normal tessellation pass: displacement runs with the
/// pass bucket.
pub struct TesselJobCtx {
    pub bucket: Arc<crate::sampler::BaseBucket>,
}

/// Context for dicing a deferred placeholder hit by traversal; the
/// geometry lands in the existing tessellation record.
pub struct DeferredDiceCtx {
    pub tessel: Tag,
}

//--------------------------------------------------------------------------------------------------

/// The per-object-kind approximation contract.
pub trait ObjectElement: Send + Sync {
    /// Produces the tessellable covering the whole source object.
    fn create(&self, db: &Database, source: Tag) -> Result<Tessellable>;

    /// Object-space bound, including the motion sweep when enabled.
    fn bound(&self, db: &Database, job: &TesselJob, sub: &Tessellable) -> BBox;

    /// True when the sub-object is small enough to dice directly.
    fn diceable(&self, _db: &Database, _job: &TesselJob, sub: &Tessellable, _bbox: &BBox) -> bool {
        sub.num_prims <= MAX_TESSEL_PRIMS
    }

    /// Produces micro-triangles (or curves). When `into` names an
    /// existing placeholder, the geometry replaces its payload.
    fn dice(
        &self,
        db: &Database,
        nodesys: &NodeSystem,
        job: &TesselJob,
        sub: &Tessellable,
        into: Option<Tag>,
    ) -> Result<Tag>;

    /// Subdivides into further sub-objects.
    fn split(&self, _db: &Database, _job: &TesselJob, sub: &Tessellable) -> Vec<Tessellable> {
        let half = sub.num_prims / 2;
        if half == 0 {
            return vec![*sub];
        }
        vec![
            Tessellable {
                first_prim: sub.first_prim,
                num_prims: half,
                subdiv: sub.subdiv + 1,
            },
            Tessellable {
                first_prim: sub.first_prim + half,
                num_prims: sub.num_prims - half,
                subdiv: sub.subdiv + 1,
            },
        ]
    }

    /// Whether the kind supports dicing on first traversal descent.
    fn deferred_dice_supported(&self) -> bool {
        true
    }

    /// Procedural intersection hook for leaves with no triangulated
    /// form.
    fn intersect(&self, _rt: &RayTracer, _state: &mut State, _tessel: Tag, _tessel_inst: u32) {}

    /// Interpolates a named primitive variable at the current hit using
    /// the kind's basis. The default handles barycentric triangles.
    fn interp_prim_var(
        &self,
        db: &Database,
        state: &State,
        tessel: &RayTessel,
        param: &crate::nodesys::NodeParam,
    ) -> Option<Value> {
        let _ = db;
        interp_triangle_channels(state, tessel, param)
    }
}

/// Registry of object elements keyed by object kind.
pub struct ObjectSystem {
    elements: RwLock<FxHashMap<String, Arc<dyn ObjectElement>>>,
}

impl ObjectSystem {
    pub fn new() -> ObjectSystem {
        let sys = ObjectSystem {
            elements: RwLock::new(FxHashMap::default()),
        };
        sys.register("poly", Arc::new(poly::PolyObject));
        sys.register("hair", Arc::new(hair::HairObject));
        sys.register("procedural", Arc::new(proc_obj::ProcObject));
        sys
    }

    pub fn register(&self, kind: &str, element: Arc<dyn ObjectElement>) {
        match self.elements.write() {
            Ok(mut g) => {
                g.insert(kind.to_owned(), element);
            }
            Err(p) => {
                p.into_inner().insert(kind.to_owned(), element);
            }
        }
    }

    pub fn find(&self, kind: &str) -> Option<Arc<dyn ObjectElement>> {
        match self.elements.read() {
            Ok(g) => g.get(kind).cloned(),
            Err(p) => p.into_inner().get(kind).cloned(),
        }
    }
}

impl Default for ObjectSystem {
    fn default() -> ObjectSystem {
        ObjectSystem::new()
    }
}

pub(crate) fn register_object_types() {
    register_type(
        rtypes::TESSEL_JOB,
        TypeDesc::new("tessel_job")
            .with_decode(Box::new(|bytes| {
                let mut r = bytes;
                let cam = Tag::decode_item(&mut r).ok_or(ember_db::Error::Corrupt("job"))?;
                let inst = Tag::decode_item(&mut r).ok_or(ember_db::Error::Corrupt("job"))?;
                let source = Tag::decode_item(&mut r).ok_or(ember_db::Error::Corrupt("job"))?;
                let len = r
                    .read_u32::<LittleEndian>()
                    .map_err(|_| ember_db::Error::Corrupt("job kind"))? as usize;
                if r.len() < len {
                    return Err(ember_db::Error::Corrupt("job kind"));
                }
                let (k, rest) = r.split_at(len);
                let kind = String::from_utf8(k.to_vec())
                    .map_err(|_| ember_db::Error::Corrupt("job kind"))?;
                r = rest;
                use std::io::Read;
                let mut flag = [0u8; 1];
                r.read_exact(&mut flag)
                    .map_err(|_| ember_db::Error::Corrupt("job"))?;
                let motion = flag[0] != 0;
                let displace_list =
                    Tag::decode_item(&mut r).ok_or(ember_db::Error::Corrupt("job"))?;
                let sub = Tessellable::decode(&mut r).ok_or(ember_db::Error::Corrupt("job"))?;
                let raytraceable =
                    Tag::decode_item(&mut r).ok_or(ember_db::Error::Corrupt("job"))?;
                r.read_exact(&mut flag)
                    .map_err(|_| ember_db::Error::Corrupt("job"))?;
                Ok(Box::new(TesselJob {
                    cam,
                    inst,
                    source,
                    kind,
                    motion,
                    displace_list,
                    sub,
                    raytraceable,
                    deferred_dice: flag[0] != 0,
                }) as Box<dyn Record>)
            }))
            .with_exec_job(Box::new(|db, tag, ctx| {
                execute_job_tessel(db, tag, ctx).map_err(|e| {
                    error!("tessellation job failed: {}", e);
                    ember_db::Error::UnknownType
                })
            })),
    );
}

//--------------------------------------------------------------------------------------------------
// the job executor

/// Drives one tessellation job: dequeue a sub-object, dice it when
/// small enough, split it otherwise.
pub fn execute_job_tessel(db: &Database, job_tag: Tag, ctx: &mut dyn std::any::Any) -> Result<()> {
    let rt = db
        .interface::<RayTracer>(IFACE_RAYTRACER)
        .ok_or_else(|| Error::UnresolvedElement("raytracer interface".to_owned()))?;
    let nodesys = db
        .interface::<NodeSystem>(IFACE_NODESYS)
        .ok_or_else(|| Error::UnresolvedElement("node system interface".to_owned()))?;
    let objects = db
        .interface::<ObjectSystem>(IFACE_OBJECTS)
        .ok_or_else(|| Error::UnresolvedElement("object system interface".to_owned()))?;

    let (kind, root_sub) = {
        let job = db.read::<TesselJob>(job_tag);
        (job.kind.clone(), job.sub)
    };
    let element = objects
        .find(&kind)
        .ok_or_else(|| Error::UnsupportedObjectKind(kind.clone()))?;

    // dicing a deferred placeholder hit by traversal
    if let Some(defer) = ctx.downcast_ref::<DeferredDiceCtx>() {
        let job = db.read::<TesselJob>(job_tag);
        element.dice(db, &nodesys, &job, &job.sub, Some(defer.tessel))?;
        drop(job);
        end_tessel(&rt, defer.tessel);
        return Ok(());
    }

    let bucket = ctx
        .downcast_ref::<TesselJobCtx>()
        .map(|c| c.bucket.clone());

    let job = db.read::<TesselJob>(job_tag);
    let mut queue = vec![root_sub];
    while let Some(sub) = queue.pop() {
        let bbox = element.bound(db, &job, &sub);
        if element.diceable(db, &job, &sub, &bbox) {
            if job.deferred_dice && element.deferred_dice_supported() {
                // a placeholder pointing back at its own approximation job
                let child_job = db.create(
                    TesselJob {
                        cam: job.cam,
                        inst: job.inst,
                        source: job.source,
                        kind: job.kind.clone(),
                        motion: job.motion,
                        displace_list: job.displace_list,
                        sub,
                        raytraceable: job.raytraceable,
                        deferred_dice: true,
                    },
                    DbFlags::FLUSHABLE,
                );
                let tessel = create_deferred_tessel(db, bbox, child_job);
                rt.add_tessel(job.raytraceable, tessel);
            } else {
                let tessel = element.dice(db, &nodesys, &job, &sub, None)?;
                if !job.displace_list.is_null() {
                    if let Some(bucket) = bucket.as_ref() {
                        displace_tessel(&nodesys, bucket, &job, tessel);
                    } else {
                        debug!("no bucket context, skipping displacement");
                    }
                }
                end_tessel(&rt, tessel);
                rt.add_tessel(job.raytraceable, tessel);
            }
        } else {
            queue.extend(element.split(db, &job, &sub));
        }
    }
    Ok(())
}

/// Applies the displacement shader list to every vertex of a finished
/// tessellation.
pub fn displace_tessel(
    nodesys: &NodeSystem,
    bucket: &Arc<crate::sampler::BaseBucket>,
    job: &TesselJob,
    tessel_tag: Tag,
) {
    let tls = RefCell::new(RayTls::new());
    let num_vertices = nodesys.db.read::<RayTessel>(tessel_tag).vertices.len();
    for vi in 0..num_vertices {
        let (pos, m_pos) = {
            let t = nodesys.db.read::<RayTessel>(tessel_tag);
            (t.vertices[vi].pos, t.vertices[vi].m_pos)
        };
        let mut state = State::new(RayType::Displace, bucket, &tls);
        state.p = pos;
        state.hit_tessel = tessel_tag;
        state.hit_obj = job.source;
        let mut result = Vec4::zeros();
        let moved = shader::call_shader_instance_list(
            nodesys,
            &mut result,
            &mut state,
            job.displace_list,
            None,
        );
        if moved {
            let offset = Vec3::new(result.x, result.y, result.z);
            let mut t = nodesys.db.write::<RayTessel>(tessel_tag);
            t.vertices[vi].pos = pos + offset;
            t.vertices[vi].m_pos = m_pos + offset;
            let p = t.vertices[vi].pos;
            let mp = t.vertices[vi].m_pos;
            t.bbox.add_point(&p);
            t.motion_bbox.add_point(&p);
            t.motion_bbox.add_point(&mp);
        }
    }
}

//--------------------------------------------------------------------------------------------------
// primitive variable interpolation

/// The object element registered for the hit object's kind.
fn hit_element(state: &State) -> Option<Arc<dyn ObjectElement>> {
    let db = state.db();
    let objects = db.interface::<ObjectSystem>(IFACE_OBJECTS)?;
    let kind = {
        let desc = db.try_read::<Node>(state.hit_obj).ok()?.desc;
        db.read::<crate::nodesys::NodeDesc>(desc).name.clone()
    };
    objects.find(&kind)
}

/// Binds a named primitive variable of the hit object, interpolated at
/// the hit with the object kind's basis.
pub fn get_prim_var(state: &State, name: &str, ty: ValueType) -> Option<Value> {
    if state.hit_obj.is_null() || state.hit_tessel.is_null() {
        return None;
    }
    let db = state.db();
    let param = {
        let obj = db.try_read::<Node>(state.hit_obj).ok()?;
        let i = obj.lookup_parameter(name)?;
        obj.read_parameter(i).clone()
    };
    let tessel = db.read::<RayTessel>(state.hit_tessel);
    let value = match param.storage_class {
        StorageClass::Constant => Some(param.value.clone()),
        StorageClass::Uniform => interp_uniform_channels(state, &tessel, &param),
        StorageClass::Varying | StorageClass::Vertex => match hit_element(state) {
            Some(element) => element.interp_prim_var(db, state, &tessel, &param),
            None => interp_triangle_channels(state, &tessel, &param),
        },
    };
    value.map(|v| v.cast(ty))
}

/// Object-space vector channel lookup used by hit detail computation.
pub fn interp_prim_vec3(
    _rt: &RayTracer,
    state: &State,
    tessel: &RayTessel,
    name: &str,
) -> Option<Vec3> {
    if state.hit_obj.is_null() {
        return None;
    }
    let db = state.db();
    let param = {
        let obj = db.try_read::<Node>(state.hit_obj).ok()?;
        let i = obj.lookup_parameter(name)?;
        obj.read_parameter(i).clone()
    };
    match param.storage_class {
        StorageClass::Varying | StorageClass::Vertex => {
            let v = interp_triangle_channels(state, tessel, &param)?;
            match v.cast(ValueType::Vec3) {
                Value::Vec3(a) => Some(Vec3::new(a[0], a[1], a[2])),
                _ => None,
            }
        }
        _ => None,
    }
}

/// Barycentric interpolation over the hit triangle's vertex channels.
pub(crate) fn interp_triangle_channels(
    state: &State,
    tessel: &RayTessel,
    param: &crate::nodesys::NodeParam,
) -> Option<Value> {
    if param.channel_dim == 0 || state.hit_tri == ember_db::NULL_INDEX {
        return None;
    }
    let tri = tessel.triangles.get(state.hit_tri as usize)?;
    let dim = param.channel_dim as usize;
    let mut comps = [0.0f32; 4];
    for k in 0..dim.min(4) {
        let ch = tessel.vertex_channels.get(param.channel_offset as usize + k)?;
        let c0 = *ch.get(tri.v1 as usize)?;
        let c1 = *ch.get(tri.v2 as usize)?;
        let c2 = *ch.get(tri.v3 as usize)?;
        comps[k] = c0 * state.bary.x + c1 * state.bary.y + c2 * state.bary.z;
    }
    Some(assemble_value(param.ty, &comps))
}

pub(crate) fn interp_uniform_channels(
    state: &State,
    tessel: &RayTessel,
    param: &crate::nodesys::NodeParam,
) -> Option<Value> {
    if param.channel_dim == 0 || state.hit_prim == ember_db::NULL_INDEX {
        return None;
    }
    let dim = param.channel_dim as usize;
    let mut comps = [0.0f32; 4];
    for k in 0..dim.min(4) {
        let ch = tessel
            .uniform_channels
            .get(param.channel_offset as usize + k)?;
        comps[k] = *ch.get(state.hit_prim as usize)?;
    }
    Some(assemble_value(param.ty, &comps))
}

pub(crate) fn assemble_value(ty: ValueType, comps: &[f32; 4]) -> Value {
    match ty {
        ValueType::Vec2 => Value::Vec2([comps[0], comps[1]]),
        ValueType::Vec3 => Value::Vec3([comps[0], comps[1], comps[2]]),
        ValueType::Vec4 => Value::Vec4(*comps),
        _ => Value::Scalar(comps[0]).cast(ty),
    }
}

/// Reads the diceable flag of an object node, defaulting to immediate
/// dicing.
pub fn object_wants_deferred_dice(nodesys: &NodeSystem, source: Tag) -> bool {
    let n = nodesys.db.read::<Node>(source);
    match n.lookup_parameter("deferred_dice") {
        Some(i) => matches!(n.read_parameter(i).value, Value::Bool(true)),
        None => false,
    }
}

/// Installs the procedural intersection dispatcher on the ray tracer.
pub fn install_procedural_hook(rt: &RayTracer, objects: Arc<ObjectSystem>) {
    let hook: crate::rt::ProceduralIntersectFn = Box::new(
        move |rt, state, tessel_inst, tessel, _sort, _hits| {
            let kind = {
                let scene = rt
                    .db
                    .read::<crate::rt::RayScene>(rt.scene_tag());
                let tinst = scene.tessel_instances[tessel_inst as usize];
                let inst = &scene.instances[tinst.instance as usize];
                let source = rt.db.read::<crate::rt::RayObject>(inst.object).source;
                let nodesys = match rt.db.interface::<NodeSystem>(IFACE_NODESYS) {
                    Some(ns) => ns,
                    None => return,
                };
                let desc = rt.db.read::<Node>(source).desc;
                nodesys
                    .db
                    .read::<crate::nodesys::NodeDesc>(desc)
                    .name
                    .clone()
            };
            match objects.find(&kind) {
                Some(element) => element.intersect(rt, state, tessel, tessel_inst),
                None => warn!("no object element for procedural kind {}", kind),
            }
        },
    );
    match rt.procedural_intersect.write() {
        Ok(mut g) => *g = Some(hook),
        Err(p) => *p.into_inner() = Some(hook),
    }
}
