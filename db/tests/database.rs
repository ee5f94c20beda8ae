use ember_db::record::{register_type, TypeDesc};
use ember_db::{Blob, Database, DbFlags, Record, RecordType, Tag};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[test]
fn create_write_dirt_gc_read_roundtrip() {
    let db = Database::open_in_temp(0).unwrap();
    let tag = db.create(Blob(vec![0u8; 16]), DbFlags::FLUSHABLE);
    {
        let mut blob = db.write::<Blob>(tag);
        for (i, b) in blob.0.iter_mut().enumerate() {
            *b = (i * 7) as u8;
        }
    }
    let stats = db.gc();
    assert_eq!(stats.evicted, 1);
    let blob = db.read::<Blob>(tag);
    for (i, b) in blob.0.iter().enumerate() {
        assert_eq!(*b, (i * 7) as u8);
    }
}

#[test]
fn resize_preserves_contents_and_tag() {
    let db = Database::open_in_temp(0).unwrap();
    let tag = db.create(Blob((0u8..32).collect()), DbFlags::FLUSHABLE);
    db.resize_blob(tag, 64);
    {
        let blob = db.read::<Blob>(tag);
        assert_eq!(blob.0.len(), 64);
        for i in 0..32 {
            assert_eq!(blob.0[i], i as u8);
        }
        assert_eq!(blob.0[63], 0);
    }
    db.resize_blob(tag, 8);
    let blob = db.read::<Blob>(tag);
    assert_eq!(&blob.0[..], &(0u8..8).collect::<Vec<u8>>()[..]);
}

#[test]
fn pinned_records_are_not_evicted() {
    let db = Database::open_in_temp(0).unwrap();
    let tag = db.create(Blob(vec![1u8; 8]), DbFlags::FLUSHABLE);
    let pin = db.read::<Blob>(tag);
    let stats = db.gc();
    assert_eq!(stats.evicted, 0);
    assert_eq!(pin.0[0], 1);
}

#[test]
fn refcount_keeps_record_alive_until_zero() {
    let db = Database::open_in_temp(0).unwrap();
    let tag = db.create(Blob(vec![9u8; 4]), DbFlags::empty());
    assert_eq!(db.ref_tag(tag), 1);
    assert_eq!(db.ref_tag(tag), 2);
    assert_eq!(db.unref_tag(tag), 1);
    assert!(db.exists(tag));
    assert_eq!(db.unref_tag(tag), 0);
    assert!(!db.exists(tag));
}

#[test]
#[should_panic(expected = "delete of referenced record")]
fn delete_of_referenced_record_panics() {
    let db = Database::open_in_temp(0).unwrap();
    let tag = db.create(Blob(vec![0u8; 4]), DbFlags::empty());
    db.ref_tag(tag);
    db.delete(tag);
}

const T_COUNTED: RecordType = RecordType(RecordType::USER_BASE + 950);

struct Counted(u32);

impl Record for Counted {
    fn type_id(&self) -> RecordType {
        T_COUNTED
    }

    fn size_hint(&self) -> usize {
        64
    }
}

#[test]
fn deferred_record_generates_once_on_first_access() {
    static GEN_CALLS: AtomicUsize = AtomicUsize::new(0);
    register_type(
        T_COUNTED,
        TypeDesc::new("counted").with_generate(Box::new(|_db: &Database, _tag: Tag| {
            GEN_CALLS.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(Counted(42)) as Box<dyn Record>)
        })),
    );
    let db = Database::open_in_temp(0).unwrap();
    let tag = db.create_deferred(T_COUNTED, DbFlags::GEN_ALWAYS);
    assert_eq!(GEN_CALLS.load(Ordering::SeqCst), 0);
    assert_eq!(db.read::<Counted>(tag).0, 42);
    assert_eq!(db.read::<Counted>(tag).0, 42);
    assert_eq!(GEN_CALLS.load(Ordering::SeqCst), 1);
    // gc drops a regenerable record back to its empty state
    let stats = db.gc();
    assert_eq!(stats.evicted, 0, "GEN_ALWAYS records are not gc'd while unflushable");
    let _ = db.read::<Counted>(tag);
}

#[test]
fn gen_always_flushable_record_regenerates_after_gc() {
    static GEN_CALLS: AtomicUsize = AtomicUsize::new(0);
    const T_REGEN: RecordType = RecordType(RecordType::USER_BASE + 951);
    struct Regen;
    impl Record for Regen {
        fn type_id(&self) -> RecordType {
            T_REGEN
        }
        fn size_hint(&self) -> usize {
            32
        }
    }
    register_type(
        T_REGEN,
        TypeDesc::new("regen").with_generate(Box::new(|_db: &Database, _tag: Tag| {
            GEN_CALLS.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(Regen) as Box<dyn Record>)
        })),
    );
    let db = Database::open_in_temp(0).unwrap();
    let tag = db.create_deferred(T_REGEN, DbFlags::FLUSHABLE | DbFlags::GEN_ALWAYS);
    let _ = db.read::<Regen>(tag);
    assert_eq!(GEN_CALLS.load(Ordering::SeqCst), 1);
    let stats = db.gc();
    assert_eq!(stats.evicted, 1);
    let _ = db.read::<Regen>(tag);
    assert_eq!(GEN_CALLS.load(Ordering::SeqCst), 2);
}

#[test]
fn interfaces_are_shared_globals() {
    let db = Database::open_in_temp(0).unwrap();
    db.set_interface(7, Arc::new(String::from("raytracer")));
    let iface = db.interface::<String>(7).unwrap();
    assert_eq!(&*iface, "raytracer");
    assert!(db.interface::<u32>(7).is_none());
}

#[test]
fn concurrent_readers_share_a_record() {
    let db = Arc::new(Database::open_in_temp(0).unwrap());
    let tag = db.create(Blob((0..64).collect()), DbFlags::FLUSHABLE);
    let mut handles = Vec::new();
    for _ in 0..4 {
        let db = db.clone();
        handles.push(std::thread::spawn(move || {
            for _ in 0..100 {
                let blob = db.read::<Blob>(tag);
                assert_eq!(blob.0.len(), 64);
                assert_eq!(blob.0[63], 63);
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }
}
