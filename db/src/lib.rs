//! Tag-addressed paging object database.
//!
//! Every heavy object of the renderer (parameter tables, tessellations,
//! BSP node arrays, framebuffer tiles, texture tiles, map point blocks)
//! lives behind an opaque [Tag]. Records are reference counted, may be
//! generated lazily on first access, and may be evicted to a page file
//! when memory runs low.
//!
//! Access is bracketed by scoped guards instead of hand-balanced
//! `access`/`end` pairs: [Database::read] and [Database::write] return
//! guards that own the pin and release it on every exit path. A write
//! guard marks the record dirty when dropped, which is what makes the
//! record eligible for write-back on the next eviction.

pub mod array;
pub mod buffer;
pub mod error;
pub mod pagefile;
pub mod record;
pub mod table;
pub mod value;

pub use crate::error::{Error, Result};
pub use crate::record::{Blob, DbFlags, Record, RecordType, TypeDesc};
pub use crate::value::{Value, ValueType, NULL_INDEX};

use crate::pagefile::{Extent, PageFile};
use crate::record::{decode_record, lookup_type, register_core_types};
use fxhash::FxHashMap;
use log::{error, warn};
use slotmap::{Key, SlotMap};
use std::any::Any;
use std::marker::PhantomData;
use std::mem::{self, ManuallyDrop};
use std::ops::{Deref, DerefMut};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

slotmap::new_key_type! {
    /// Opaque identifier of a database record.
    pub struct Tag;
}

impl Tag {
    pub fn null() -> Tag {
        <Tag as Key>::null()
    }

    pub fn is_null(self) -> bool {
        <Tag as Key>::is_null(&self)
    }

    /// Raw value used wherever tags need a total order (sorted shader
    /// node tables, binary search).
    pub fn raw(self) -> u64 {
        self.data().as_ffi()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<T> {
    match m.lock() {
        Ok(g) => g,
        Err(p) => p.into_inner(),
    }
}

type Payload = Arc<RwLock<Box<dyn Record>>>;

enum Residency {
    /// In memory; the arc is cloned into every outstanding guard, so a
    /// strong count of one means the record is unpinned.
    Resident(Payload),
    /// Evicted to the page file.
    Paged,
    /// Deferred record whose payload has never been produced.
    Empty,
}

struct Slot {
    type_id: RecordType,
    flags: DbFlags,
    refcount: AtomicU32,
    dirty: AtomicBool,
    /// Host the record originated on; single-host builds always use 0.
    host: u32,
    mem_size: AtomicUsize,
    extent: Mutex<Option<Extent>>,
    state: Mutex<Residency>,
}

/// Statistics returned by [Database::gc].
#[derive(Copy, Clone, Debug, Default)]
pub struct GcStats {
    pub evicted: usize,
    pub reclaimed_bytes: usize,
}

/// The tag database.
pub struct Database {
    slots: RwLock<SlotMap<Tag, Arc<Slot>>>,
    pagefile: Mutex<PageFile>,
    globals: RwLock<FxHashMap<u32, Arc<dyn Any + Send + Sync>>>,
    mem_used: AtomicUsize,
    mem_limit: usize,
    host: u32,
}

impl Database {
    /// Opens a database backed by a page file at `path`. `mem_limit` is
    /// the soft ceiling above which record creation evicts flushable
    /// records.
    pub fn open(path: PathBuf, mem_limit: usize) -> Result<Database> {
        register_core_types();
        Ok(Database {
            slots: RwLock::new(SlotMap::with_key()),
            pagefile: Mutex::new(PageFile::open(&path)?),
            globals: RwLock::new(FxHashMap::default()),
            mem_used: AtomicUsize::new(0),
            mem_limit,
            host: 0,
        })
    }

    /// Opens a database with a page file in the system temp directory,
    /// which is what render contexts and tests use.
    pub fn open_in_temp(mem_limit: usize) -> Result<Database> {
        static COUNTER: AtomicU32 = AtomicU32::new(0);
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        let path = std::env::temp_dir().join(format!(
            "ember-page-{}-{}.bin",
            std::process::id(),
            n
        ));
        Database::open(path, mem_limit)
    }

    pub fn host(&self) -> u32 {
        self.host
    }

    /// Host a record originated on; deferred fetch goes to this host when
    /// the record is neither local nor `GEN_LOCAL`.
    pub fn host_of(&self, tag: Tag) -> u32 {
        self.slot(tag).host
    }

    pub fn num_records(&self) -> usize {
        read_lock(&self.slots).len()
    }

    pub fn memory_used(&self) -> usize {
        self.mem_used.load(Ordering::Relaxed)
    }

    //----------------------------------------------------------------------------------------------
    // creation / deletion

    /// Creates a record from an existing payload and returns its tag.
    pub fn create<T: Record>(&self, payload: T, flags: DbFlags) -> Tag {
        self.create_boxed(Box::new(payload), flags)
    }

    pub fn create_boxed(&self, payload: Box<dyn Record>, flags: DbFlags) -> Tag {
        let size = payload.size_hint();
        let type_id = Record::type_id(&*payload);
        let slot = Arc::new(Slot {
            type_id,
            flags,
            refcount: AtomicU32::new(0),
            dirty: AtomicBool::new(true),
            host: self.host,
            mem_size: AtomicUsize::new(size),
            extent: Mutex::new(None),
            state: Mutex::new(Residency::Resident(Arc::new(RwLock::new(payload)))),
        });
        self.mem_used.fetch_add(size, Ordering::Relaxed);
        self.balance_memory();
        write_lock(&self.slots).insert(slot)
    }

    /// Creates a deferred record: the payload is produced by the type's
    /// registered generator on first access.
    pub fn create_deferred(&self, type_id: RecordType, flags: DbFlags) -> Tag {
        let slot = Arc::new(Slot {
            type_id,
            flags,
            refcount: AtomicU32::new(0),
            dirty: AtomicBool::new(false),
            host: self.host,
            mem_size: AtomicUsize::new(0),
            extent: Mutex::new(None),
            state: Mutex::new(Residency::Empty),
        });
        write_lock(&self.slots).insert(slot)
    }

    /// Deletes a record. Deleting while references are outstanding is a
    /// programmer error.
    pub fn delete(&self, tag: Tag) {
        let slot = match write_lock(&self.slots).remove(tag) {
            Some(s) => s,
            None => panic!("delete of dead tag {:?}", tag),
        };
        assert_eq!(
            slot.refcount.load(Ordering::SeqCst),
            0,
            "delete of referenced record {:?} ({})",
            tag,
            record::type_name(slot.type_id)
        );
        self.mem_used
            .fetch_sub(slot.mem_size.load(Ordering::Relaxed), Ordering::Relaxed);
    }

    pub fn exists(&self, tag: Tag) -> bool {
        read_lock(&self.slots).contains_key(tag)
    }

    pub fn type_of(&self, tag: Tag) -> RecordType {
        self.slot(tag).type_id
    }

    //----------------------------------------------------------------------------------------------
    // reference counting

    pub fn ref_tag(&self, tag: Tag) -> u32 {
        self.slot(tag).refcount.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Drops one reference; the record is deleted when the count returns
    /// to zero.
    pub fn unref_tag(&self, tag: Tag) -> u32 {
        let slot = self.slot(tag);
        let prev = slot.refcount.fetch_sub(1, Ordering::SeqCst);
        assert!(prev > 0, "unref of unreferenced record {:?}", tag);
        if prev == 1 {
            self.delete(tag);
        }
        prev - 1
    }

    pub fn refcount(&self, tag: Tag) -> u32 {
        self.slot(tag).refcount.load(Ordering::SeqCst)
    }

    //----------------------------------------------------------------------------------------------
    // access brackets

    /// Pins the record and returns a read guard. Panics on a dead tag or
    /// a payload type mismatch (programmer errors).
    pub fn read<T: Record>(&self, tag: Tag) -> DataRef<T> {
        let slot = self.slot(tag);
        let payload = self.resident_payload(tag, &slot);
        DataRef::new(payload, slot.type_id)
    }

    /// Pins the record and returns a write guard. The record is marked
    /// dirty when the guard drops.
    pub fn write<T: Record>(&self, tag: Tag) -> DataRefMut<T> {
        let slot = self.slot(tag);
        let payload = self.resident_payload(tag, &slot);
        DataRefMut::new(self, slot, payload)
    }

    /// Fallible probe used by paths that tolerate missing records.
    pub fn try_read<T: Record>(&self, tag: Tag) -> Result<DataRef<T>> {
        if !self.exists(tag) {
            return Err(Error::InvalidTag);
        }
        Ok(self.read(tag))
    }

    /// Marks a record dirty without opening a write bracket.
    pub fn dirt(&self, tag: Tag) {
        self.slot(tag).dirty.store(true, Ordering::Release);
    }

    /// Resizes a raw byte record, preserving contents up to
    /// `min(old, new)`. The tag stays stable; any outstanding guard
    /// observes the new bytes only after re-acquiring access.
    pub fn resize_blob(&self, tag: Tag, new_size: usize) {
        let mut blob = self.write::<Blob>(tag);
        blob.0.resize(new_size, 0);
    }

    //----------------------------------------------------------------------------------------------
    // garbage collection / paging

    /// Walks unreferenced flushable records and reclaims their memory.
    /// On-disk extents are kept for the duration of the render context.
    pub fn gc(&self) -> GcStats {
        let candidates: Vec<Arc<Slot>> = read_lock(&self.slots)
            .iter()
            .filter(|(_, s)| {
                s.flags.contains(DbFlags::FLUSHABLE)
                    && s.refcount.load(Ordering::SeqCst) == 0
            })
            .map(|(_, s)| s.clone())
            .collect();
        let mut stats = GcStats::default();
        for slot in candidates {
            if let Some(bytes) = self.evict_slot(&slot) {
                stats.evicted += 1;
                stats.reclaimed_bytes += bytes;
            }
        }
        stats
    }

    /// Evicts flushable records, referenced or not, until memory drops
    /// under the limit. Called from record creation.
    fn balance_memory(&self) {
        if self.mem_limit == 0 || self.mem_used.load(Ordering::Relaxed) <= self.mem_limit {
            return;
        }
        let candidates: Vec<Arc<Slot>> = read_lock(&self.slots)
            .iter()
            .filter(|(_, s)| s.flags.contains(DbFlags::FLUSHABLE))
            .map(|(_, s)| s.clone())
            .collect();
        for slot in candidates {
            if self.mem_used.load(Ordering::Relaxed) <= self.mem_limit {
                break;
            }
            self.evict_slot(&slot);
        }
        if self.mem_used.load(Ordering::Relaxed) > self.mem_limit {
            warn!(
                "memory limit exceeded after eviction: {} bytes used",
                self.mem_used.load(Ordering::Relaxed)
            );
        }
    }

    /// Pages one record out, returning the number of bytes reclaimed, or
    /// None when the record is pinned, absent, or has no codec.
    fn evict_slot(&self, slot: &Arc<Slot>) -> Option<usize> {
        let mut st = lock(&slot.state);
        let payload = match &*st {
            Residency::Resident(p) => p.clone(),
            _ => return None,
        };
        // a strong count above one means a guard is outstanding
        if Arc::strong_count(&payload) != 2 {
            return None;
        }
        let regenerates = slot.flags.contains(DbFlags::GEN_ALWAYS)
            || (slot.flags.contains(DbFlags::GEN_LOCAL)
                && lookup_type(slot.type_id).map_or(false, |d| d.generate.is_some()));
        if regenerates {
            // cheaper to regenerate than to page
            let size = slot.mem_size.swap(0, Ordering::Relaxed);
            self.mem_used.fetch_sub(size, Ordering::Relaxed);
            *st = Residency::Empty;
            slot.dirty.store(false, Ordering::Release);
            return Some(size);
        }
        let dirty = slot.dirty.load(Ordering::Acquire);
        let has_extent = (*lock(&slot.extent)).is_some();
        if dirty || !has_extent {
            let mut bytes = Vec::new();
            let rec = match payload.try_read() {
                Ok(g) => g,
                Err(_) => return None,
            };
            if let Err(e) = rec.encode(&mut bytes) {
                match e {
                    Error::NotFlushable => {}
                    other => error!(
                        "failed to page out {} record: {}",
                        record::type_name(slot.type_id),
                        other
                    ),
                }
                return None;
            }
            drop(rec);
            let extent = match lock(&self.pagefile).write_record(slot.type_id.0, &bytes) {
                Ok(ext) => ext,
                Err(e) => {
                    error!("page file write failed: {}", e);
                    return None;
                }
            };
            *lock(&slot.extent) = Some(extent);
            slot.dirty.store(false, Ordering::Release);
        }
        let size = slot.mem_size.swap(0, Ordering::Relaxed);
        self.mem_used.fetch_sub(size, Ordering::Relaxed);
        *st = Residency::Paged;
        Some(size)
    }

    //----------------------------------------------------------------------------------------------
    // global interfaces

    /// Installs a render-context global (ray tracer, node system, ...)
    /// reachable from record generators.
    pub fn set_interface(&self, id: u32, iface: Arc<dyn Any + Send + Sync>) {
        write_lock(&self.globals).insert(id, iface);
    }

    pub fn interface<T: Any + Send + Sync>(&self, id: u32) -> Option<Arc<T>> {
        read_lock(&self.globals)
            .get(&id)
            .cloned()
            .and_then(|a| a.downcast::<T>().ok())
    }

    pub fn clear_interfaces(&self) {
        write_lock(&self.globals).clear();
    }

    //----------------------------------------------------------------------------------------------
    // jobs

    /// Dispatches a job record through its type's `exec_job` callback.
    pub fn exec_job(&self, tag: Tag, ctx: &mut dyn Any) -> Result<()> {
        let type_id = self.slot(tag).type_id;
        match lookup_type(type_id) {
            Some(desc) => match desc.exec_job.as_ref() {
                Some(f) => f(self, tag, ctx),
                None => Err(Error::UnknownType),
            },
            None => Err(Error::UnknownType),
        }
    }

    //----------------------------------------------------------------------------------------------

    fn slot(&self, tag: Tag) -> Arc<Slot> {
        match read_lock(&self.slots).get(tag) {
            Some(s) => s.clone(),
            None => panic!("access of deleted tag {:?}", tag),
        }
    }

    /// Makes the record resident, paging it in or running its generator
    /// under the per-record lock, and returns the shared payload.
    fn resident_payload(&self, tag: Tag, slot: &Arc<Slot>) -> Payload {
        let mut st = lock(&slot.state);
        match &*st {
            Residency::Resident(p) => p.clone(),
            Residency::Paged => {
                let extent = match *lock(&slot.extent) {
                    Some(e) => e,
                    None => panic!("paged record {:?} lost its extent", tag),
                };
                let (stored_type, bytes) = lock(&self.pagefile)
                    .read_record(extent)
                    .unwrap_or_else(|e| panic!("page file read failed for {:?}: {}", tag, e));
                debug_assert_eq!(stored_type, slot.type_id.0);
                let rec = decode_record(slot.type_id, &bytes).unwrap_or_else(|e| {
                    panic!(
                        "failed to decode paged {} record: {}",
                        record::type_name(slot.type_id),
                        e
                    )
                });
                let size = rec.size_hint();
                slot.mem_size.store(size, Ordering::Relaxed);
                self.mem_used.fetch_add(size, Ordering::Relaxed);
                let payload: Payload = Arc::new(RwLock::new(rec));
                *st = Residency::Resident(payload.clone());
                payload
            }
            Residency::Empty => {
                let desc = lookup_type(slot.type_id).unwrap_or_else(|| {
                    panic!("deferred record of unregistered type {:?}", slot.type_id)
                });
                let generate = desc.generate.as_ref().unwrap_or_else(|| {
                    panic!(
                        "deferred {} record has no generator",
                        record::type_name(slot.type_id)
                    )
                });
                let rec = generate(self, tag).unwrap_or_else(|e| {
                    panic!(
                        "generator for {} record failed: {}",
                        record::type_name(slot.type_id),
                        e
                    )
                });
                debug_assert_eq!(Record::type_id(&*rec), slot.type_id);
                let size = rec.size_hint();
                slot.mem_size.store(size, Ordering::Relaxed);
                self.mem_used.fetch_add(size, Ordering::Relaxed);
                let payload: Payload = Arc::new(RwLock::new(rec));
                *st = Residency::Resident(payload.clone());
                payload
            }
        }
    }
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

//--------------------------------------------------------------------------------------------------
// access guards

/// Read bracket: pins the record in memory for the guard's lifetime.
pub struct DataRef<T: Record> {
    // declared before `payload` so the guard drops first
    guard: ManuallyDrop<RwLockReadGuard<'static, Box<dyn Record>>>,
    _payload: Payload,
    marker: PhantomData<T>,
}

impl<T: Record> DataRef<T> {
    fn new(payload: Payload, type_id: RecordType) -> DataRef<T> {
        let guard = match payload.read() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        };
        // the guard borrows from inside `payload`, which the struct keeps
        // alive; the Drop impl releases the guard before the arc
        let guard: RwLockReadGuard<'static, Box<dyn Record>> = unsafe { mem::transmute(guard) };
        if !guard.is::<T>() {
            panic!(
                "record type mismatch: stored {}, requested {}",
                record::type_name(type_id),
                std::any::type_name::<T>()
            );
        }
        DataRef {
            guard: ManuallyDrop::new(guard),
            _payload: payload,
            marker: PhantomData,
        }
    }
}

impl<T: Record> Deref for DataRef<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.guard.downcast_ref::<T>().expect("record type mismatch")
    }
}

impl<T: Record> Drop for DataRef<T> {
    fn drop(&mut self) {
        unsafe {
            ManuallyDrop::drop(&mut self.guard);
        }
    }
}

/// Write bracket: exclusive pin; marks the record dirty and refreshes the
/// memory accounting when dropped.
pub struct DataRefMut<'db, T: Record> {
    guard: ManuallyDrop<RwLockWriteGuard<'static, Box<dyn Record>>>,
    _payload: Payload,
    slot: Arc<Slot>,
    db: &'db Database,
    marker: PhantomData<T>,
}

impl<'db, T: Record> DataRefMut<'db, T> {
    fn new(db: &'db Database, slot: Arc<Slot>, payload: Payload) -> DataRefMut<'db, T> {
        let guard = match payload.write() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        };
        let guard: RwLockWriteGuard<'static, Box<dyn Record>> = unsafe { mem::transmute(guard) };
        if !guard.is::<T>() {
            panic!(
                "record type mismatch: stored {}, requested {}",
                record::type_name(slot.type_id),
                std::any::type_name::<T>()
            );
        }
        DataRefMut {
            guard: ManuallyDrop::new(guard),
            _payload: payload,
            slot,
            db,
            marker: PhantomData,
        }
    }
}

impl<'db, T: Record> Deref for DataRefMut<'db, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.guard.downcast_ref::<T>().expect("record type mismatch")
    }
}

impl<'db, T: Record> DerefMut for DataRefMut<'db, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.guard
            .downcast_mut::<T>()
            .expect("record type mismatch")
    }
}

impl<'db, T: Record> Drop for DataRefMut<'db, T> {
    fn drop(&mut self) {
        let new_size = self.guard.size_hint();
        let old_size = self.slot.mem_size.swap(new_size, Ordering::Relaxed);
        if new_size >= old_size {
            self.db
                .mem_used
                .fetch_add(new_size - old_size, Ordering::Relaxed);
        } else {
            self.db
                .mem_used
                .fetch_sub(old_size - new_size, Ordering::Relaxed);
        }
        self.slot.dirty.store(true, Ordering::Release);
        unsafe {
            ManuallyDrop::drop(&mut self.guard);
        }
    }
}
