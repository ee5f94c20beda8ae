//! Shader graph evaluation.
//!
//! A shader instance is a node whose hidden first parameter holds the
//! tag of its parameter table: the flattened closure of every node
//! reachable from it through parameter edges, sorted by tag for binary
//! search. Calling a shader allocates a shader cache covering that
//! closure; within one graph invocation every instance runs at most once
//! and every parameter is evaluated at most once, unless caching is
//! explicitly bypassed.

use crate::error::Result;
use crate::math::*;
use crate::nodesys::{Node, NodeSystem, StorageClass};
use crate::rtypes;
use crate::sampler::BucketType;
use crate::state::State;
use ember_db::record::{register_type, TypeDesc};
use ember_db::table::TableItem;
use ember_db::{
    Database, DataRef, DbFlags, Error as DbError, Record, RecordType, Tag, Value, ValueType,
    NULL_INDEX,
};
use ember_db::array::DataArray;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use fxhash::FxHashSet;
use std::any::Any;
use std::mem;

/// Hidden per-instance parameters preceding the user parameters.
pub const INTERNAL_PARAM_COUNT: usize = 1;

/// One reachable node of a shader graph closure.
#[derive(Clone, Debug)]
pub struct SortedNode {
    pub tag: Tag,
    pub num_params: usize,
}

/// The parameter table of a shader instance.
pub struct ShaderInstParamTable {
    pub inst: Tag,
    pub generated: bool,
    /// Strictly ascending by tag; one entry per reachable node.
    pub nodes: Vec<SortedNode>,
}

impl ShaderInstParamTable {
    /// Total number of cached parameter slots across the closure, the
    /// shader cache footprint of one invocation.
    pub fn shader_cache_size(&self) -> usize {
        self.nodes.iter().map(|n| n.num_params).sum()
    }
}

impl Record for ShaderInstParamTable {
    fn type_id(&self) -> RecordType {
        rtypes::SHADER_PARAM_TABLE
    }

    fn size_hint(&self) -> usize {
        self.nodes.len() * mem::size_of::<SortedNode>() + mem::size_of::<Self>()
    }

    fn encode(&self, w: &mut Vec<u8>) -> ember_db::Result<()> {
        self.inst.encode_item(w);
        w.push(self.generated as u8);
        w.write_u32::<LittleEndian>(self.nodes.len() as u32).unwrap();
        for n in &self.nodes {
            n.tag.encode_item(w);
            w.write_u32::<LittleEndian>(n.num_params as u32).unwrap();
        }
        Ok(())
    }
}

pub(crate) fn register_shader_types() {
    register_type(
        rtypes::SHADER_PARAM_TABLE,
        TypeDesc::new("shader_inst_param_table").with_decode(Box::new(|bytes| {
            let mut r = bytes;
            let inst = Tag::decode_item(&mut r).ok_or(DbError::Corrupt("param table inst"))?;
            let mut flag = [0u8; 1];
            use std::io::Read;
            r.read_exact(&mut flag).map_err(|_| DbError::Corrupt("param table flag"))?;
            let count = r
                .read_u32::<LittleEndian>()
                .map_err(|_| DbError::Corrupt("param table count"))?;
            let mut nodes = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let tag = Tag::decode_item(&mut r).ok_or(DbError::Corrupt("sorted node"))?;
                let num_params = r
                    .read_u32::<LittleEndian>()
                    .map_err(|_| DbError::Corrupt("sorted node"))?
                    as usize;
                nodes.push(SortedNode { tag, num_params });
            }
            Ok(Box::new(ShaderInstParamTable {
                inst,
                generated: flag[0] != 0,
                nodes,
            }) as Box<dyn Record>)
        })),
    );
}

//--------------------------------------------------------------------------------------------------
// shader instance lifecycle

/// Begin editing a shader instance; creates the node and its parameter
/// table on first use.
pub fn shader_instance(nodesys: &NodeSystem, desc_name: &str, inst_name: &str) -> Result<Tag> {
    let (tag, created) = nodesys.node(desc_name, inst_name)?;
    if created {
        let table = nodesys.db.create(
            ShaderInstParamTable {
                inst: tag,
                generated: false,
                nodes: Vec::new(),
            },
            DbFlags::FLUSHABLE,
        );
        let mut n = nodesys.db.write::<Node>(tag);
        n.params.insert(
            0,
            crate::nodesys::NodeParam {
                name: "param_table".to_owned(),
                storage_class: StorageClass::Constant,
                ty: ValueType::Tag,
                value: Value::Tag(table),
                inst: Tag::null(),
                param: NULL_INDEX,
                channel_offset: 0,
                channel_dim: 0,
            },
        );
    }
    Ok(tag)
}

/// End editing a shader instance. The parameter table of the edited
/// graph is invalidated and lazily regenerated on the next call.
pub fn end_shader_instance(nodesys: &NodeSystem, inst: Tag) {
    nodesys.end_node(inst);
    let table = param_table_of(&nodesys.db, inst);
    if !table.is_null() {
        nodesys.db.write::<ShaderInstParamTable>(table).generated = false;
    }
}

/// Delete a shader instance along with its parameter table.
pub fn delete_shader_instance(nodesys: &NodeSystem, inst: Tag) {
    let table = param_table_of(&nodesys.db, inst);
    nodesys.delete_node(inst);
    if !table.is_null() {
        nodesys.db.delete(table);
    }
}

pub fn param_table_of(db: &Database, inst: Tag) -> Tag {
    let n = db.read::<Node>(inst);
    match n.params.get(0).map(|p| &p.value) {
        Some(Value::Tag(t)) => *t,
        _ => Tag::null(),
    }
}

/// Invalidate every shader parameter table so the closures regenerate
/// against the committed graph; called once per render pass.
pub fn invalidate_param_tables(db: &Database, shader_insts: &[Tag]) {
    for inst in shader_insts {
        let table = param_table_of(db, *inst);
        if !table.is_null() {
            db.write::<ShaderInstParamTable>(table).generated = false;
        }
    }
}

//--------------------------------------------------------------------------------------------------
// parameter table generation

fn collect_reachable(db: &Database, tag: Tag, seen: &mut FxHashSet<Tag>, out: &mut Vec<Tag>) {
    if !seen.insert(tag) {
        return;
    }
    let deps: Vec<Tag> = {
        let node = db.read::<Node>(tag);
        node.params
            .iter()
            .filter(|p| !p.inst.is_null())
            .map(|p| p.inst)
            .collect()
    };
    for dep in deps {
        collect_reachable(db, dep, seen, out);
    }
    // depth first: dependencies land before their consumers
    out.push(tag);
}

/// Ensures the parameter table of `inst` is generated, regenerating it
/// when an edit invalidated it.
fn ensure_param_table(db: &Database, inst: Tag) -> Tag {
    let table = param_table_of(db, inst);
    debug_assert!(!table.is_null(), "shader instance without parameter table");
    {
        let t = db.read::<ShaderInstParamTable>(table);
        if t.generated {
            return table;
        }
    }
    let mut seen = FxHashSet::default();
    let mut reachable = Vec::new();
    collect_reachable(db, inst, &mut seen, &mut reachable);
    let mut nodes: Vec<SortedNode> = reachable
        .into_iter()
        .map(|tag| {
            let num_params = db.read::<Node>(tag).num_params();
            SortedNode { tag, num_params }
        })
        .collect();
    nodes.sort_by_key(|n| n.tag.raw());
    let mut t = db.write::<ShaderInstParamTable>(table);
    t.nodes = nodes;
    t.generated = true;
    table
}

//--------------------------------------------------------------------------------------------------
// the per-invocation shader cache

/// Per-instance slot of the shader cache.
pub struct CacheNode {
    pub tag: Tag,
    pub called: bool,
    pub ret_val: bool,
    pub result: Vec4,
    /// Graph-scope cached parameter values.
    pub graph: Vec<Option<Value>>,
}

/// Memoization frame covering one whole shader-graph invocation.
pub struct ShaderCache {
    pub root: Tag,
    pub enabled: bool,
    pub nodes: Vec<CacheNode>,
}

impl ShaderCache {
    fn from_table(table: &DataRef<ShaderInstParamTable>) -> ShaderCache {
        ShaderCache {
            root: table.inst,
            enabled: true,
            nodes: table
                .nodes
                .iter()
                .map(|n| CacheNode {
                    tag: n.tag,
                    called: false,
                    ret_val: false,
                    result: Vec4::zeros(),
                    graph: vec![None; n.num_params],
                })
                .collect(),
        }
    }

    /// Binary search by tag over the sorted closure.
    pub fn find(&self, tag: Tag) -> Option<usize> {
        self.nodes
            .binary_search_by_key(&tag.raw(), |n| n.tag.raw())
            .ok()
    }

    /// Clears every memoized value, keeping the layout.
    pub fn flush(&mut self) {
        for n in self.nodes.iter_mut() {
            n.called = false;
            n.ret_val = false;
            n.result = Vec4::zeros();
            for g in n.graph.iter_mut() {
                *g = None;
            }
        }
    }
}

/// The working parameter slice of one shader invocation.
pub struct ShaderFrame {
    pub inst: Tag,
    pub cache_slot: usize,
    /// Locally evaluated or shader-written parameter values.
    pub local: Vec<Option<Value>>,
}

//--------------------------------------------------------------------------------------------------
// calling shaders

fn call_imp(
    nodesys: &NodeSystem,
    result: &mut Vec4,
    state: &mut State,
    shader: Tag,
    arg: Option<&mut dyn Any>,
) -> (bool, ShaderFrame) {
    let cache_idx = state.caches.len() - 1;
    let (slot, num_params) = {
        let cache = &state.caches[cache_idx];
        let slot = match cache.find(shader) {
            Some(s) => s,
            None => {
                // instance outside the committed closure: run uncached
                log::warn!("shader instance called outside its graph closure");
                let num_params = nodesys.db.read::<Node>(shader).num_params();
                let frame = ShaderFrame {
                    inst: shader,
                    cache_slot: usize::max_value(),
                    local: vec![None; num_params],
                };
                state.frames.push(frame);
                let prev = mem::replace(&mut state.shader, shader);
                let ret = nodesys.node_object(shader).main(result, state, arg);
                state.shader = prev;
                return (ret, state.frames.pop().expect("frame stack underflow"));
            }
        };
        (slot, state.caches[cache_idx].nodes[slot].graph.len())
    };

    // short-circuit on a memoized call
    {
        let cache = &state.caches[cache_idx];
        if cache.enabled && cache.nodes[slot].called {
            *result = cache.nodes[slot].result;
            let local = vec![None; num_params];
            return (
                cache.nodes[slot].ret_val,
                ShaderFrame {
                    inst: shader,
                    cache_slot: slot,
                    local,
                },
            );
        }
    }

    state.frames.push(ShaderFrame {
        inst: shader,
        cache_slot: slot,
        local: vec![None; num_params],
    });
    let prev = mem::replace(&mut state.shader, shader);
    let ret = nodesys.node_object(shader).main(result, state, arg);
    state.shader = prev;
    let frame = state.frames.pop().expect("frame stack underflow");

    let cache = &mut state.caches[cache_idx];
    if cache.enabled {
        cache.nodes[slot].called = true;
        cache.nodes[slot].ret_val = ret;
        cache.nodes[slot].result = *result;
    }
    (ret, frame)
}

/// Calls a shader instance as the root of a fresh shader cache, then
/// binds matching output channels into the sample info.
pub fn call_shader_instance(
    nodesys: &NodeSystem,
    result: &mut Vec4,
    state: &mut State,
    shader: Tag,
    arg: Option<&mut dyn Any>,
) -> bool {
    if shader.is_null() {
        return false;
    }
    let table = ensure_param_table(&nodesys.db, shader);
    let cache = {
        let t = nodesys.db.read::<ShaderInstParamTable>(table);
        ShaderCache::from_table(&t)
    };
    state.caches.push(cache);
    let (ret, frame) = call_imp(nodesys, result, state, shader, arg);
    bind_output_channels(nodesys, state, shader, &frame);
    state.caches.pop();
    ret
}

/// Calls every shader of a list; all entries share one result and the
/// statuses are OR-combined.
pub fn call_shader_instance_list(
    nodesys: &NodeSystem,
    result: &mut Vec4,
    state: &mut State,
    shader_list: Tag,
    mut arg: Option<&mut dyn Any>,
) -> bool {
    if shader_list.is_null() {
        return false;
    }
    let shaders: Vec<Tag> = nodesys
        .db
        .read::<DataArray<Tag>>(shader_list)
        .items
        .clone();
    let mut status = false;
    for shader in shaders {
        if !shader.is_null() {
            status |= call_shader_instance(nodesys, result, state, shader, arg.as_mut().map(|a| &mut **a));
        }
    }
    status
}

/// Runs the volume lists the ray currently sits inside.
pub fn call_current_volume_list(
    nodesys: &NodeSystem,
    result: &mut Vec4,
    state: &mut State,
    mut arg: Option<&mut dyn Any>,
) -> bool {
    let volumes: Vec<Tag> = state.current_volumes.iter().copied().collect();
    let mut status = false;
    for list in volumes {
        status |= call_shader_instance_list(nodesys, result, state, list, arg.as_mut().map(|a| &mut **a));
    }
    status
}

fn bind_output_channels(nodesys: &NodeSystem, state: &mut State, shader: Tag, frame: &ShaderFrame) {
    if state.bucket.bucket_type != BucketType::Frame || state.bucket.channels.is_empty() {
        return;
    }
    let node = nodesys.db.read::<Node>(shader);
    for ch in state.bucket.channels.iter() {
        if let Some(i) = node.lookup_parameter(&ch.name) {
            let value = frame.local[i]
                .clone()
                .unwrap_or_else(|| node.params[i].value.clone());
            state.result.user[ch.slot] = value.cast(ch.ty);
        }
    }
}

//--------------------------------------------------------------------------------------------------
// parameter evaluation

fn eval_imp(nodesys: &NodeSystem, state: &mut State, param_index: usize, caching: bool) -> Value {
    let shader = state.shader;
    debug_assert!(!shader.is_null(), "eval outside a shader call");
    let pidx = param_index + INTERNAL_PARAM_COUNT;
    let param = {
        let node = nodesys.db.read::<Node>(shader);
        node.read_parameter(pidx).clone()
    };
    let cache_idx = state.caches.len() - 1;
    let frame_idx = state.frames.len() - 1;
    let slot = state.frames[frame_idx].cache_slot;
    let cache_enabled = caching && state.caches[cache_idx].enabled && slot != usize::max_value();

    if cache_enabled {
        // the shader itself may have touched the local slot, keep it
        if let Some(v) = state.frames[frame_idx].local[pidx].clone() {
            return v;
        }
        if let Some(v) = state.caches[cache_idx].nodes[slot].graph[pidx].clone() {
            state.frames[frame_idx].local[pidx] = Some(v.clone());
            return v;
        }
    }

    let value = if !param.inst.is_null() {
        // evaluate through the incoming edge
        let prev_enabled = state.caches[cache_idx].enabled;
        state.caches[cache_idx].enabled = caching && prev_enabled;
        let mut result = Vec4::zeros();
        let (_ret, src_frame) = call_imp(nodesys, &mut result, state, param.inst, None);
        state.caches[cache_idx].enabled = prev_enabled;
        if param.param != NULL_INDEX {
            let src_idx = param.param as usize;
            let src_value = src_frame.local.get(src_idx).and_then(|v| v.clone());
            let src_value = src_value.or_else(|| {
                // fall back to the graph cache, then the stable block
                let cached = if src_frame.cache_slot != usize::max_value() {
                    state.caches[cache_idx].nodes[src_frame.cache_slot].graph[src_idx].clone()
                } else {
                    None
                };
                cached.or_else(|| {
                    let src = nodesys.db.read::<Node>(param.inst);
                    src.params.get(src_idx).map(|p| p.value.clone())
                })
            });
            src_value
                .unwrap_or_else(|| Value::default_of(param.ty))
                .cast(param.ty)
        } else {
            // the standard result
            Value::Vec4([result.x, result.y, result.z, result.w]).cast(param.ty)
        }
    } else if let Some(v) = crate::obj::get_prim_var(state, &param.name, param.ty) {
        v
    } else {
        // constant default from the stable block
        param.value.clone()
    };

    if cache_enabled {
        state.caches[cache_idx].nodes[slot].graph[pidx] = Some(value.clone());
        state.frames[frame_idx].local[pidx] = Some(value.clone());
    }
    value
}

/// Evaluates parameter `param_index` of the currently calling shader,
/// memoizing through the shader cache.
pub fn eval(nodesys: &NodeSystem, state: &mut State, param_index: usize) -> Value {
    eval_imp(nodesys, state, param_index, true)
}

/// Writes an output parameter value into the current working slice so
/// downstream shaders can read it by name.
pub fn set_output(state: &mut State, param_index: usize, value: Value) {
    let pidx = param_index + INTERNAL_PARAM_COUNT;
    if let Some(frame) = state.frames.last_mut() {
        if pidx < frame.local.len() {
            frame.local[pidx] = Some(value);
        }
    }
}

/// Forces re-execution of the shader connected to `param_index`,
/// bypassing the cache.
pub fn call(nodesys: &NodeSystem, state: &mut State, param_index: usize) -> Value {
    eval_imp(nodesys, state, param_index, false)
}

/// Non-cached evaluation returning the value plus parametric-derivative
/// pairs, produced by re-running the source with perturbed `(u, v)`.
pub fn call_uv(
    nodesys: &NodeSystem,
    state: &mut State,
    param_index: usize,
) -> (Value, Value, Value) {
    let x = eval_imp(nodesys, state, param_index, false);
    let (du, dv) = (state.du.max(SCALAR_EPS), state.dv.max(SCALAR_EPS));
    let (u0, v0) = (state.u, state.v);
    state.u = u0 + du;
    let xu = eval_imp(nodesys, state, param_index, false);
    state.u = u0;
    state.v = v0 + dv;
    let xv = eval_imp(nodesys, state, param_index, false);
    state.v = v0;
    (x, xu, xv)
}

/// Non-cached evaluation with raster-space derivative pairs, produced by
/// re-running the source with the raster position perturbed by one unit.
pub fn call_xy(
    nodesys: &NodeSystem,
    state: &mut State,
    param_index: usize,
) -> (Value, Value, Value) {
    let x = eval_imp(nodesys, state, param_index, false);
    let raster = state.raster;
    state.raster.x = raster.x + 1.0;
    let xx = eval_imp(nodesys, state, param_index, false);
    state.raster.x = raster.x;
    state.raster.y = raster.y + 1.0;
    let xy = eval_imp(nodesys, state, param_index, false);
    state.raster = raster;
    (x, xx, xy)
}
