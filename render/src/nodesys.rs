//! The pluggable node system for scene management.
//!
//! Named node descriptors carry typed parameters; node instances hold a
//! parameter block initialized from the descriptor defaults, and any
//! parameter may be linked edge-wise to an output parameter of another,
//! already finalized instance. Cycles are impossible by construction.
//!
//! Editing follows begin/end brackets. While a node is being edited its
//! symbol table is stale, so name lookups go through the slow linear
//! scan; `end_node` rebuilds the table and bumps the node's timestamp.

use crate::error::Result;
use crate::rtypes;
use crate::state::State;
use downcast_rs::{impl_downcast, Downcast};
use ember_db::record::{register_type, TypeDesc};
use ember_db::{Database, DbFlags, Record, RecordType, Tag, Value, ValueType, NULL_INDEX};
use ember_plugin::{PluginSystem, CREATE_PREFIX};
use fxhash::FxHashMap;
use log::{error, warn};
use std::any::Any;
use std::mem;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// The storage class of node parameters and primitive variables.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum StorageClass {
    /// Constant per object.
    Constant,
    /// Constant per primitive.
    Uniform,
    /// Bilinearly interpolated.
    Varying,
    /// Vertex interpolated.
    Vertex,
}

/// One parameter slot of a node instance.
#[derive(Clone, Debug)]
pub struct NodeParam {
    pub name: String,
    pub storage_class: StorageClass,
    pub ty: ValueType,
    /// The stable value slice as committed through the scene API.
    pub value: Value,
    /// Incoming edge: source instance, or null when unconnected.
    pub inst: Tag,
    /// Incoming edge: source parameter index; NULL_INDEX asks for the
    /// source's standard result.
    pub param: u32,
    /// Offset in interpolated (varying/vertex) scalar channels.
    pub channel_offset: i32,
    /// Dimension in interpolated scalar channels.
    pub channel_dim: i32,
}

impl NodeParam {
    fn new(name: &str, storage_class: StorageClass, ty: ValueType, value: Value) -> NodeParam {
        NodeParam {
            name: name.to_owned(),
            storage_class,
            ty,
            value,
            inst: Tag::null(),
            param: NULL_INDEX,
            channel_offset: 0,
            channel_dim: 0,
        }
    }
}

fn channel_dim_of(ty: ValueType) -> i32 {
    match ty {
        ValueType::Vec2 => 2,
        ValueType::Vec3 => 3,
        ValueType::Vec4 => 4,
        _ => 1,
    }
}

/// A node descriptor: the ordered parameter list shared by instances.
pub struct NodeDesc {
    pub name: String,
    pub params: Vec<NodeParam>,
    pub editing: bool,
}

impl Record for NodeDesc {
    fn type_id(&self) -> RecordType {
        rtypes::NODE_DESC
    }

    fn size_hint(&self) -> usize {
        self.params.len() * mem::size_of::<NodeParam>() + mem::size_of::<Self>()
    }
}

/// A node instance in the scene graph.
pub struct Node {
    pub name: String,
    /// User type flag, untouched by the node system.
    pub kind: u32,
    /// This node's own tag.
    pub tag: Tag,
    /// The descriptor this node was instanced from.
    pub desc: Tag,
    pub params: Vec<NodeParam>,
    symbols: FxHashMap<String, u32>,
    /// Timestamp of the last finished edit.
    pub time: u32,
    pub editing: bool,
}

impl Record for Node {
    fn type_id(&self) -> RecordType {
        rtypes::NODE
    }

    fn size_hint(&self) -> usize {
        self.params.len() * mem::size_of::<NodeParam>() + mem::size_of::<Self>()
    }
}

impl Node {
    /// O(1) name lookup; only valid outside the edit bracket.
    pub fn lookup_parameter(&self, name: &str) -> Option<usize> {
        debug_assert!(!self.editing, "symbol lookup during node edit");
        self.symbols.get(name).map(|i| *i as usize)
    }

    /// Linear scan usable while editing.
    pub fn find_parameter(&self, name: &str) -> Option<usize> {
        self.params.iter().position(|p| p.name == name)
    }

    pub fn read_parameter(&self, index: usize) -> &NodeParam {
        &self.params[index]
    }

    pub fn num_params(&self) -> usize {
        self.params.len()
    }

    /// Copy of the constant block slot.
    pub fn get_parameter(&self, name: &str) -> Option<Value> {
        self.lookup_parameter(name).map(|i| self.params[i].value.clone())
    }
}

//--------------------------------------------------------------------------------------------------
// node objects

/// The capability set a node plug-in exposes. Shaders implement `main`;
/// passive nodes keep the defaults.
pub trait NodeObject: Downcast + Send + Sync {
    fn init_node(&self, _nodesys: &NodeSystem, _node: Tag) {}

    fn exit_node(&self, _nodesys: &NodeSystem, _node: Tag) {}

    /// Called when an edit bracket on the node closes.
    fn node_changed(&self, _nodesys: &NodeSystem, _node: Tag) {}

    /// Shader entry point. Returning false means "this contribution is
    /// zero"; the rest of the shader list still executes.
    fn main(
        &self,
        _result: &mut crate::math::Vec4,
        _state: &mut State,
        _arg: Option<&mut dyn Any>,
    ) -> bool {
        false
    }
}
impl_downcast!(NodeObject);

/// Passive placeholder object for descs with no creator.
struct NullObject;

impl NodeObject for NullObject {}

pub type CreateNodeObjectFn = Box<dyn Fn() -> Box<dyn NodeObject> + Send + Sync>;

//--------------------------------------------------------------------------------------------------

pub struct NodeSystem {
    pub db: Arc<Database>,
    plugsys: PluginSystem,
    desc_table: RwLock<FxHashMap<String, Tag>>,
    node_table: RwLock<FxHashMap<String, Tag>>,
    creators: RwLock<FxHashMap<String, CreateNodeObjectFn>>,
    objects: RwLock<FxHashMap<Tag, Arc<dyn NodeObject>>>,
    clock: AtomicU32,
}

fn read_lock<T>(l: &RwLock<T>) -> RwLockReadGuard<T> {
    match l.read() {
        Ok(g) => g,
        Err(p) => p.into_inner(),
    }
}

fn write_lock<T>(l: &RwLock<T>) -> RwLockWriteGuard<T> {
    match l.write() {
        Ok(g) => g,
        Err(p) => p.into_inner(),
    }
}

pub(crate) fn register_node_types() {
    register_type(rtypes::NODE_DESC, TypeDesc::new("node_desc"));
    register_type(rtypes::NODE, TypeDesc::new("node"));
}

impl NodeSystem {
    pub fn new(db: Arc<Database>, plugsys: PluginSystem) -> NodeSystem {
        NodeSystem {
            db,
            plugsys,
            desc_table: RwLock::new(FxHashMap::default()),
            node_table: RwLock::new(FxHashMap::default()),
            creators: RwLock::new(FxHashMap::default()),
            objects: RwLock::new(FxHashMap::default()),
            clock: AtomicU32::new(1),
        }
    }

    pub fn plugin_system(&self) -> &PluginSystem {
        &self.plugsys
    }

    /// Registers a built-in creator for node objects; plug-in modules
    /// are only consulted when no built-in matches.
    pub fn register_creator(&self, name: &str, creator: CreateNodeObjectFn) {
        write_lock(&self.creators).insert(name.to_owned(), creator);
    }

    fn tick(&self) -> u32 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    //----------------------------------------------------------------------------------------------
    // node descs

    pub fn find_node_desc(&self, name: &str) -> Option<Tag> {
        read_lock(&self.desc_table).get(name).copied()
    }

    /// Begin editing a node desc, creating it on first use.
    pub fn node_desc(&self, name: &str) -> Tag {
        if let Some(tag) = self.find_node_desc(name) {
            self.db.write::<NodeDesc>(tag).editing = true;
            return tag;
        }
        let tag = self.db.create(
            NodeDesc {
                name: name.to_owned(),
                params: Vec::new(),
                editing: true,
            },
            DbFlags::empty(),
        );
        write_lock(&self.desc_table).insert(name.to_owned(), tag);
        tag
    }

    pub fn desc_add_parameter(
        &self,
        desc: Tag,
        storage_class: StorageClass,
        ty: ValueType,
        name: &str,
        default_value: Value,
    ) {
        let mut d = self.db.write::<NodeDesc>(desc);
        debug_assert!(d.editing, "desc_add_parameter outside edit bracket");
        if d.params.iter().any(|p| p.name == name) {
            warn!("duplicate parameter {} on desc {}", name, d.name);
            return;
        }
        let value = default_value.cast(ty);
        d.params.push(NodeParam::new(name, storage_class, ty, value));
    }

    /// End editing a node desc; resolves and caches the plug-in object.
    pub fn end_node_desc(&self, desc: Tag) {
        let name = {
            let mut d = self.db.write::<NodeDesc>(desc);
            d.editing = false;
            d.name.clone()
        };
        let object = self.create_node_object(&name);
        write_lock(&self.objects).insert(desc, object.into());
    }

    pub fn delete_node_desc(&self, desc: Tag) {
        let name = self.db.read::<NodeDesc>(desc).name.clone();
        write_lock(&self.desc_table).remove(&name);
        write_lock(&self.objects).remove(&desc);
        self.db.delete(desc);
    }

    fn create_node_object(&self, name: &str) -> Box<dyn NodeObject> {
        if let Some(creator) = read_lock(&self.creators).get(name) {
            return creator();
        }
        let symbol = format!("{}{}", CREATE_PREFIX, name);
        if let Some(plugin) = self.plugsys.find_symbol(&symbol) {
            match unsafe { plugin.invoke0::<Box<dyn NodeObject>>(&symbol) } {
                Ok(obj) => return obj,
                Err(e) => error!("plug-in object creation failed for {}: {}", name, e),
            }
        }
        Box::new(NullObject)
    }

    /// The plug-in object attached to a node's descriptor.
    pub fn node_object(&self, node: Tag) -> Arc<dyn NodeObject> {
        let desc = self.db.read::<Node>(node).desc;
        self.desc_object(desc)
    }

    pub fn desc_object(&self, desc: Tag) -> Arc<dyn NodeObject> {
        read_lock(&self.objects)
            .get(&desc)
            .cloned()
            .unwrap_or_else(|| Arc::new(NullObject))
    }

    //----------------------------------------------------------------------------------------------
    // node instances

    pub fn find_node(&self, name: &str) -> Option<Tag> {
        read_lock(&self.node_table).get(name).copied()
    }

    /// Begin editing a node, creating it from `desc_name` on first use.
    /// Returns the tag and whether the node was newly created.
    pub fn node(&self, desc_name: &str, inst_name: &str) -> Result<(Tag, bool)> {
        if let Some(tag) = self.find_node(inst_name) {
            self.db.write::<Node>(tag).editing = true;
            return Ok((tag, false));
        }
        let desc = self.find_node_desc(desc_name).ok_or_else(|| {
            crate::error::Error::UnresolvedElement(desc_name.to_owned())
        })?;
        let params = self.db.read::<NodeDesc>(desc).params.clone();
        let tag = self.db.create(
            Node {
                name: inst_name.to_owned(),
                kind: 0,
                tag: Tag::null(),
                desc,
                params,
                symbols: FxHashMap::default(),
                time: 0,
                editing: true,
            },
            DbFlags::empty(),
        );
        self.db.write::<Node>(tag).tag = tag;
        write_lock(&self.node_table).insert(inst_name.to_owned(), tag);
        self.node_object(tag).init_node(self, tag);
        Ok((tag, true))
    }

    /// Set a parameter value by name; valid inside the edit bracket.
    pub fn set_parameter(&self, node: Tag, name: &str, value: Value) {
        let mut n = self.db.write::<Node>(node);
        match n.find_parameter(name) {
            Some(i) => {
                let ty = n.params[i].ty;
                n.params[i].value = value.cast(ty);
            }
            None => warn!("set of undeclared parameter {} on node {}", name, n.name),
        }
    }

    /// Declare a per-instance user parameter; returns its index.
    pub fn declare_parameter(
        &self,
        node: Tag,
        storage_class: StorageClass,
        ty: ValueType,
        name: &str,
        default_value: Value,
    ) -> usize {
        let mut n = self.db.write::<Node>(node);
        if let Some(i) = n.find_parameter(name) {
            warn!("re-declaration of parameter {} on node {}", name, n.name);
            return i;
        }
        let value = default_value.cast(ty);
        n.params.push(NodeParam::new(name, storage_class, ty, value));
        n.params.len() - 1
    }

    /// Link an input parameter to the output parameter of a previously
    /// finalized node.
    pub fn link_parameter(
        &self,
        node: Tag,
        param_name: &str,
        src_node_name: &str,
        src_param_name: &str,
    ) {
        let src_tag = match self.find_node(src_node_name) {
            Some(t) => t,
            None => {
                error!(
                    "link source {} does not name a finished node",
                    src_node_name
                );
                return;
            }
        };
        let src_param = if src_param_name.is_empty() || src_param_name == "result" {
            NULL_INDEX
        } else {
            let src = self.db.read::<Node>(src_tag);
            match src.lookup_parameter(src_param_name) {
                Some(i) => i as u32,
                None => {
                    error!(
                        "link source parameter {}::{} not found",
                        src_node_name, src_param_name
                    );
                    return;
                }
            }
        };
        let mut n = self.db.write::<Node>(node);
        match n.find_parameter(param_name) {
            Some(i) => {
                n.params[i].inst = src_tag;
                n.params[i].param = src_param;
            }
            None => warn!("link of undeclared parameter {} on node {}", param_name, n.name),
        }
    }

    pub fn unlink_parameter(&self, node: Tag, param_name: &str) {
        let mut n = self.db.write::<Node>(node);
        if let Some(i) = n.find_parameter(param_name) {
            n.params[i].inst = Tag::null();
            n.params[i].param = NULL_INDEX;
        }
    }

    /// End editing a node: rebuild the symbol table, recompute the
    /// interpolated channel layout, and bump the timestamp.
    pub fn end_node(&self, node: Tag) {
        let time = self.tick();
        {
            let mut guard = self.db.write::<Node>(node);
            let n: &mut Node = &mut *guard;
            n.symbols = n
                .params
                .iter()
                .enumerate()
                .map(|(i, p)| (p.name.clone(), i as u32))
                .collect();
            let mut vertex_offset = 0;
            let mut uniform_offset = 0;
            for p in n.params.iter_mut() {
                match p.storage_class {
                    StorageClass::Varying | StorageClass::Vertex => {
                        p.channel_offset = vertex_offset;
                        p.channel_dim = channel_dim_of(p.ty);
                        vertex_offset += p.channel_dim;
                    }
                    StorageClass::Uniform => {
                        p.channel_offset = uniform_offset;
                        p.channel_dim = channel_dim_of(p.ty);
                        uniform_offset += p.channel_dim;
                    }
                    StorageClass::Constant => {}
                }
            }
            n.time = time;
            n.editing = false;
        }
        self.node_object(node).node_changed(self, node);
    }

    pub fn delete_node(&self, node: Tag) {
        self.node_object(node).exit_node(self, node);
        let name = self.db.read::<Node>(node).name.clone();
        write_lock(&self.node_table).remove(&name);
        self.db.delete(node);
    }

    //----------------------------------------------------------------------------------------------
    // typed helpers

    pub fn get_int(&self, node: Tag, name: &str) -> i32 {
        match self.db.read::<Node>(node).get_parameter(name) {
            Some(v) => match v.cast(ValueType::Int) {
                Value::Int(i) => i,
                _ => 0,
            },
            None => 0,
        }
    }

    pub fn get_scalar(&self, node: Tag, name: &str) -> f32 {
        match self.db.read::<Node>(node).get_parameter(name) {
            Some(v) => match v.cast(ValueType::Scalar) {
                Value::Scalar(s) => s,
                _ => 0.0,
            },
            None => 0.0,
        }
    }

    pub fn get_tag(&self, node: Tag, name: &str) -> Tag {
        match self.db.read::<Node>(node).get_parameter(name) {
            Some(Value::Tag(t)) => t,
            _ => Tag::null(),
        }
    }

    pub fn get_bool(&self, node: Tag, name: &str) -> bool {
        match self.db.read::<Node>(node).get_parameter(name) {
            Some(v) => match v.cast(ValueType::Bool) {
                Value::Bool(b) => b,
                _ => false,
            },
            None => false,
        }
    }

    pub fn get_vec3(&self, node: Tag, name: &str) -> [f32; 3] {
        match self.db.read::<Node>(node).get_parameter(name) {
            Some(v) => match v.cast(ValueType::Vec3) {
                Value::Vec3(v) => v,
                _ => [0.0; 3],
            },
            None => [0.0; 3],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> NodeSystem {
        crate::rtypes::register_render_types();
        let db = Arc::new(Database::open_in_temp(0).unwrap());
        NodeSystem::new(db, PluginSystem::new())
    }

    #[test]
    fn desc_and_instance_lifecycle() {
        let ns = setup();
        let desc = ns.node_desc("lambert");
        ns.desc_add_parameter(
            desc,
            StorageClass::Constant,
            ValueType::Vec3,
            "Kd",
            Value::Vec3([0.5, 0.5, 0.5]),
        );
        ns.desc_add_parameter(
            desc,
            StorageClass::Constant,
            ValueType::Scalar,
            "roughness",
            Value::Scalar(0.1),
        );
        ns.end_node_desc(desc);

        let (node, created) = ns.node("lambert", "mtl0").unwrap();
        assert!(created);
        ns.set_parameter(node, "Kd", Value::Vec3([0.7, 0.6, 0.5]));
        ns.end_node(node);

        let n = ns.db.read::<Node>(node);
        assert_eq!(n.lookup_parameter("roughness"), Some(1));
        assert_eq!(n.get_parameter("Kd"), Some(Value::Vec3([0.7, 0.6, 0.5])));
        assert_eq!(n.get_parameter("roughness"), Some(Value::Scalar(0.1)));
    }

    #[test]
    fn set_parameter_casts_to_declared_type() {
        let ns = setup();
        let desc = ns.node_desc("caster");
        ns.desc_add_parameter(
            desc,
            StorageClass::Constant,
            ValueType::Vec3,
            "tint",
            Value::Vec3([0.0; 3]),
        );
        ns.end_node_desc(desc);
        let (node, _) = ns.node("caster", "c0").unwrap();
        ns.set_parameter(node, "tint", Value::Scalar(0.25));
        ns.end_node(node);
        let n = ns.db.read::<Node>(node);
        assert_eq!(n.get_parameter("tint"), Some(Value::Vec3([0.25; 3])));
    }

    #[test]
    fn links_only_resolve_finished_nodes() {
        let ns = setup();
        let desc = ns.node_desc("n");
        ns.desc_add_parameter(
            desc,
            StorageClass::Constant,
            ValueType::Scalar,
            "x",
            Value::Scalar(0.0),
        );
        ns.end_node_desc(desc);

        let (a, _) = ns.node("n", "a").unwrap();
        ns.end_node(a);
        let (b, _) = ns.node("n", "b").unwrap();
        ns.link_parameter(b, "x", "a", "x");
        // linking to a node that was never created is skipped
        ns.link_parameter(b, "x", "ghost", "x");
        ns.end_node(b);

        let nb = ns.db.read::<Node>(b);
        let p = nb.read_parameter(0);
        assert_eq!(p.inst, a);
        assert_eq!(p.param, 0);
    }

    #[test]
    fn varying_channels_are_laid_out_at_end_node() {
        let ns = setup();
        let desc = ns.node_desc("geomish");
        ns.desc_add_parameter(
            desc,
            StorageClass::Vertex,
            ValueType::Vec3,
            "Pref",
            Value::Vec3([0.0; 3]),
        );
        ns.desc_add_parameter(
            desc,
            StorageClass::Varying,
            ValueType::Scalar,
            "temp",
            Value::Scalar(0.0),
        );
        ns.end_node_desc(desc);
        let (node, _) = ns.node("geomish", "g0").unwrap();
        ns.end_node(node);
        let n = ns.db.read::<Node>(node);
        assert_eq!(n.params[0].channel_offset, 0);
        assert_eq!(n.params[0].channel_dim, 3);
        assert_eq!(n.params[1].channel_offset, 3);
        assert_eq!(n.params[1].channel_dim, 1);
    }
}
