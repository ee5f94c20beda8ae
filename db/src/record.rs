//! Record payloads and the process-wide record type registry.
//!
//! Every heavy object managed by the database implements [Record]. The
//! registry associates a [RecordType] id with the callbacks the database
//! needs to page a record back in (`decode`) or to produce a deferred
//! record's payload on first access (`generate`). Job records additionally
//! carry an `exec_job` entry so the scheduler can dispatch them without
//! knowing their concrete type.

use crate::error::{Error, Result};
use crate::{Database, Tag};
use downcast_rs::impl_downcast;
use downcast_rs::Downcast;
use fxhash::FxHashMap;
use lazy_static::lazy_static;
use std::any::Any;
use std::sync::{Arc, RwLock};

/// Identifies a record type to the registry.
///
/// Core types use the ids below; higher layers allocate their own ids
/// starting at [RecordType::USER_BASE].
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct RecordType(pub u32);

impl RecordType {
    pub const NONE: RecordType = RecordType(0);
    pub const BLOB: RecordType = RecordType(1);
    pub const TABLE: RecordType = RecordType(2);
    pub const BLOCK: RecordType = RecordType(3);
    pub const ARRAY: RecordType = RecordType(4);
    pub const BUFFER: RecordType = RecordType(5);

    /// First id available to higher layers.
    pub const USER_BASE: u32 = 64;
}

bitflags::bitflags! {
    pub struct DbFlags: u32 {
        /// May be evicted to the page file when unpinned.
        const FLUSHABLE  = 0b0001;
        /// Must be regenerated on the host that first created it.
        const GEN_LOCAL  = 0b0010;
        /// Regenerate on demand rather than page or transmit.
        const GEN_ALWAYS = 0b0100;
    }
}

/// A database-managed payload.
///
/// `encode` is the page-out path; types that never page (or always
/// regenerate) keep the default and stay resident.
pub trait Record: Downcast + Send + Sync {
    fn type_id(&self) -> RecordType;

    /// Approximate in-memory size in bytes, for memory accounting.
    fn size_hint(&self) -> usize {
        0
    }

    fn encode(&self, _w: &mut Vec<u8>) -> Result<()> {
        Err(Error::NotFlushable)
    }
}
impl_downcast!(Record);

pub type DecodeFn = Box<dyn Fn(&[u8]) -> Result<Box<dyn Record>> + Send + Sync>;
pub type GenerateFn = Box<dyn Fn(&Database, Tag) -> Result<Box<dyn Record>> + Send + Sync>;
pub type ExecJobFn = Box<dyn Fn(&Database, Tag, &mut dyn Any) -> Result<()> + Send + Sync>;

/// Registry entry for one record type.
pub struct TypeDesc {
    pub name: &'static str,
    pub decode: Option<DecodeFn>,
    pub generate: Option<GenerateFn>,
    pub exec_job: Option<ExecJobFn>,
}

impl TypeDesc {
    pub fn new(name: &'static str) -> TypeDesc {
        TypeDesc {
            name,
            decode: None,
            generate: None,
            exec_job: None,
        }
    }

    pub fn with_decode(mut self, f: DecodeFn) -> TypeDesc {
        self.decode = Some(f);
        self
    }

    pub fn with_generate(mut self, f: GenerateFn) -> TypeDesc {
        self.generate = Some(f);
        self
    }

    pub fn with_exec_job(mut self, f: ExecJobFn) -> TypeDesc {
        self.exec_job = Some(f);
        self
    }
}

lazy_static! {
    static ref REGISTRY: RwLock<FxHashMap<RecordType, Arc<TypeDesc>>> =
        RwLock::new(FxHashMap::default());
}

/// Register a record type. Registration is idempotent: re-registering the
/// same id is a no-op so engine start-up can run more than once in one
/// process (tests).
pub fn register_type(id: RecordType, desc: TypeDesc) {
    let mut reg = match REGISTRY.write() {
        Ok(g) => g,
        Err(p) => p.into_inner(),
    };
    reg.entry(id).or_insert_with(|| Arc::new(desc));
}

pub fn type_name(id: RecordType) -> &'static str {
    lookup_type(id).map(|d| d.name).unwrap_or("<unregistered>")
}

/// Returns the descriptor without holding the registry lock, so
/// generators are free to consult the registry themselves.
pub(crate) fn lookup_type(id: RecordType) -> Option<Arc<TypeDesc>> {
    let reg = match REGISTRY.read() {
        Ok(g) => g,
        Err(p) => p.into_inner(),
    };
    reg.get(&id).cloned()
}

pub(crate) fn decode_record(id: RecordType, bytes: &[u8]) -> Result<Box<dyn Record>> {
    match lookup_type(id) {
        Some(desc) => match desc.decode.as_ref() {
            Some(f) => f(bytes),
            None => Err(Error::NotFlushable),
        },
        None => Err(Error::UnknownType),
    }
}

/// A raw byte record, used for payloads whose internal structure lives
/// above the database (texture tiles, packed caches).
pub struct Blob(pub Vec<u8>);

impl Record for Blob {
    fn type_id(&self) -> RecordType {
        RecordType::BLOB
    }

    fn size_hint(&self) -> usize {
        self.0.len()
    }

    fn encode(&self, w: &mut Vec<u8>) -> Result<()> {
        w.extend_from_slice(&self.0);
        Ok(())
    }
}

pub(crate) fn register_core_types() {
    register_type(
        RecordType::BLOB,
        TypeDesc::new("blob").with_decode(Box::new(|bytes| {
            Ok(Box::new(Blob(bytes.to_vec())) as Box<dyn Record>)
        })),
    );
}
