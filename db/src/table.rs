//! Block-paged append-only sequences.
//!
//! A data table is an index of block tags; each block is its own
//! flushable record holding up to `items_per_slot` (rounded to a power of
//! two) elements, so large sequences page in and out block by block.
//! Random access decodes `(slot = i >> shift, offset = i & mask)`.

use crate::error::{Error, Result};
use crate::record::{register_type, Record, RecordType, TypeDesc};
use crate::value::Value;
use crate::{Database, DataRef, DataRefMut, DbFlags, Tag};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use slotmap::{Key, KeyData};
use std::marker::PhantomData;
use std::mem;

/// Elements stored in tables, arrays and buffers.
pub trait TableItem: Clone + Send + Sync + 'static {
    fn encode_item(&self, w: &mut Vec<u8>);
    fn decode_item(r: &mut &[u8]) -> Option<Self>
    where
        Self: Sized;

    fn item_size() -> usize {
        mem::size_of::<Self>()
    }
}

impl TableItem for u32 {
    fn encode_item(&self, w: &mut Vec<u8>) {
        w.write_u32::<LittleEndian>(*self).unwrap();
    }

    fn decode_item(r: &mut &[u8]) -> Option<u32> {
        r.read_u32::<LittleEndian>().ok()
    }
}

impl TableItem for f32 {
    fn encode_item(&self, w: &mut Vec<u8>) {
        w.write_f32::<LittleEndian>(*self).unwrap();
    }

    fn decode_item(r: &mut &[u8]) -> Option<f32> {
        r.read_f32::<LittleEndian>().ok()
    }
}

impl TableItem for Tag {
    fn encode_item(&self, w: &mut Vec<u8>) {
        w.write_u64::<LittleEndian>(self.data().as_ffi()).unwrap();
    }

    fn decode_item(r: &mut &[u8]) -> Option<Tag> {
        Some(Tag::from(KeyData::from_ffi(r.read_u64::<LittleEndian>().ok()?)))
    }
}

impl TableItem for [f32; 3] {
    fn encode_item(&self, w: &mut Vec<u8>) {
        for c in self.iter() {
            w.write_f32::<LittleEndian>(*c).unwrap();
        }
    }

    fn decode_item(r: &mut &[u8]) -> Option<[f32; 3]> {
        let mut v = [0f32; 3];
        for c in v.iter_mut() {
            *c = r.read_f32::<LittleEndian>().ok()?;
        }
        Some(v)
    }
}

impl TableItem for Value {
    fn encode_item(&self, w: &mut Vec<u8>) {
        self.encode(w);
    }

    fn decode_item(r: &mut &[u8]) -> Option<Value> {
        Value::decode(r)
    }

    fn item_size() -> usize {
        mem::size_of::<Value>()
    }
}

//--------------------------------------------------------------------------------------------------

/// One block of a data table.
pub struct Block<T: TableItem> {
    type_id: RecordType,
    pub items: Vec<T>,
}

impl<T: TableItem> Record for Block<T> {
    fn type_id(&self) -> RecordType {
        self.type_id
    }

    fn size_hint(&self) -> usize {
        self.items.len() * T::item_size() + mem::size_of::<Self>()
    }

    fn encode(&self, w: &mut Vec<u8>) -> Result<()> {
        w.write_u32::<LittleEndian>(self.items.len() as u32).unwrap();
        for item in &self.items {
            item.encode_item(w);
        }
        Ok(())
    }
}

/// The table record: an index of block tags plus addressing parameters.
pub struct DataTable<T: TableItem> {
    type_id: RecordType,
    block_type: RecordType,
    blocks: Vec<Tag>,
    item_count: usize,
    items_per_slot: usize,
    shift: u32,
    marker: PhantomData<fn() -> T>,
}

impl<T: TableItem> Record for DataTable<T> {
    fn type_id(&self) -> RecordType {
        self.type_id
    }

    fn size_hint(&self) -> usize {
        self.blocks.len() * mem::size_of::<Tag>() + mem::size_of::<Self>()
    }

    fn encode(&self, w: &mut Vec<u8>) -> Result<()> {
        w.write_u32::<LittleEndian>(self.block_type.0).unwrap();
        w.write_u64::<LittleEndian>(self.item_count as u64).unwrap();
        w.write_u32::<LittleEndian>(self.items_per_slot as u32).unwrap();
        w.write_u32::<LittleEndian>(self.blocks.len() as u32).unwrap();
        for b in &self.blocks {
            b.encode_item(w);
        }
        Ok(())
    }
}

/// Registers the table and block record types for one item type.
pub fn register_table_type<T: TableItem>(
    table_id: RecordType,
    block_id: RecordType,
    name: &'static str,
) {
    register_type(
        block_id,
        TypeDesc::new(name).with_decode(Box::new(move |bytes| {
            let mut r = bytes;
            let count = r.read_u32::<LittleEndian>().map_err(|_| Error::Corrupt("block count"))?;
            let mut items = Vec::with_capacity(count as usize);
            for _ in 0..count {
                items.push(T::decode_item(&mut r).ok_or(Error::Corrupt("block item"))?);
            }
            Ok(Box::new(Block::<T> {
                type_id: block_id,
                items,
            }) as Box<dyn Record>)
        })),
    );
    register_type(
        table_id,
        TypeDesc::new(name).with_decode(Box::new(move |bytes| {
            let mut r = bytes;
            let block_type =
                RecordType(r.read_u32::<LittleEndian>().map_err(|_| Error::Corrupt("table"))?);
            let item_count =
                r.read_u64::<LittleEndian>().map_err(|_| Error::Corrupt("table"))? as usize;
            let items_per_slot =
                r.read_u32::<LittleEndian>().map_err(|_| Error::Corrupt("table"))? as usize;
            let num_blocks =
                r.read_u32::<LittleEndian>().map_err(|_| Error::Corrupt("table"))? as usize;
            let mut blocks = Vec::with_capacity(num_blocks);
            for _ in 0..num_blocks {
                blocks.push(Tag::decode_item(&mut r).ok_or(Error::Corrupt("table block tag"))?);
            }
            Ok(Box::new(DataTable::<T> {
                type_id: table_id,
                block_type,
                blocks,
                item_count,
                items_per_slot,
                shift: items_per_slot.trailing_zeros(),
                marker: PhantomData,
            }) as Box<dyn Record>)
        })),
    );
}

impl<T: TableItem> DataTable<T> {
    /// Creates an empty table as a database record.
    pub fn create(
        db: &Database,
        table_type: RecordType,
        block_type: RecordType,
        items_per_slot: usize,
    ) -> Tag {
        // round down to the nearest power of two
        let mut slot = 1usize;
        let mut shift = 0u32;
        while slot * 2 <= items_per_slot.max(1) {
            slot <<= 1;
            shift += 1;
        }
        db.create(
            DataTable::<T> {
                type_id: table_type,
                block_type,
                blocks: Vec::new(),
                item_count: 0,
                items_per_slot: slot,
                shift,
                marker: PhantomData,
            },
            DbFlags::FLUSHABLE,
        )
    }

    pub fn len(&self) -> usize {
        self.item_count
    }

    pub fn is_empty(&self) -> bool {
        self.item_count == 0
    }

    pub fn items_per_slot(&self) -> usize {
        self.items_per_slot
    }

    fn locate(&self, index: usize) -> (Tag, usize) {
        debug_assert!(index < self.item_count);
        let slot = index >> self.shift;
        let sub = index & (self.items_per_slot - 1);
        (self.blocks[slot], sub)
    }

    /// Appends one element, allocating a new block when the back block
    /// fills up.
    pub fn push_back(db: &Database, tag: Tag, item: T) {
        let mut tab = db.write::<DataTable<T>>(tag);
        let fill = tab.item_count & (tab.items_per_slot - 1);
        let need_block = tab.item_count >> tab.shift >= tab.blocks.len();
        if need_block {
            debug_assert_eq!(fill, 0);
            let block_type = tab.block_type;
            let btag = db.create(
                Block::<T> {
                    type_id: block_type,
                    items: Vec::new(),
                },
                DbFlags::FLUSHABLE,
            );
            tab.blocks.push(btag);
        }
        let btag = *tab.blocks.last().expect("table without blocks");
        db.write::<Block<T>>(btag).items.push(item);
        tab.item_count += 1;
    }

    /// Deletes the table and all of its blocks.
    pub fn delete(db: &Database, tag: Tag) {
        let blocks = {
            let tab = db.read::<DataTable<T>>(tag);
            tab.blocks.clone()
        };
        for b in blocks {
            db.delete(b);
        }
        db.delete(tag);
    }

    /// Drops all elements but keeps the table record alive.
    pub fn clear(db: &Database, tag: Tag) {
        let blocks = {
            let mut tab = db.write::<DataTable<T>>(tag);
            tab.item_count = 0;
            mem::replace(&mut tab.blocks, Vec::new())
        };
        for b in blocks {
            db.delete(b);
        }
    }
}

//--------------------------------------------------------------------------------------------------

/// Read iterator caching the pin on the current block.
pub struct DataTableIter<'db, T: TableItem> {
    db: &'db Database,
    tab: DataRef<DataTable<T>>,
    cur: Option<(Tag, DataRef<Block<T>>)>,
}

impl<'db, T: TableItem> DataTableIter<'db, T> {
    pub fn begin(db: &'db Database, tag: Tag) -> DataTableIter<'db, T> {
        DataTableIter {
            db,
            tab: db.read::<DataTable<T>>(tag),
            cur: None,
        }
    }

    pub fn len(&self) -> usize {
        self.tab.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tab.is_empty()
    }

    pub fn get(&mut self, index: usize) -> T {
        let (btag, sub) = self.tab.locate(index);
        let switch = match &self.cur {
            Some((t, _)) => *t != btag,
            None => true,
        };
        if switch {
            self.cur = Some((btag, self.db.read::<Block<T>>(btag)));
        }
        let (_, block) = self.cur.as_ref().expect("current block");
        block.items[sub].clone()
    }
}

/// Write iterator; every touched block is dirtied when its pin drops.
pub struct DataTableIterMut<'db, T: TableItem> {
    db: &'db Database,
    tag: Tag,
    cur: Option<(Tag, DataRefMut<'db, Block<T>>)>,
    len: usize,
    items_per_slot: usize,
    shift: u32,
    blocks: Vec<Tag>,
}

impl<'db, T: TableItem> DataTableIterMut<'db, T> {
    pub fn begin(db: &'db Database, tag: Tag) -> DataTableIterMut<'db, T> {
        let (len, items_per_slot, shift, blocks) = {
            let tab = db.read::<DataTable<T>>(tag);
            (tab.item_count, tab.items_per_slot, tab.shift, tab.blocks.clone())
        };
        DataTableIterMut {
            db,
            tag,
            cur: None,
            len,
            items_per_slot,
            shift,
            blocks,
        }
    }

    pub fn table_tag(&self) -> Tag {
        self.tag
    }

    pub fn len(&self) -> usize {
        self.len
    }

    fn locate(&self, index: usize) -> (Tag, usize) {
        debug_assert!(index < self.len);
        (self.blocks[index >> self.shift], index & (self.items_per_slot - 1))
    }

    fn switch_to(&mut self, btag: Tag) {
        let switch = match &self.cur {
            Some((t, _)) => *t != btag,
            None => true,
        };
        if switch {
            self.cur = Some((btag, self.db.write::<Block<T>>(btag)));
        }
    }

    pub fn get(&mut self, index: usize) -> T {
        let (btag, sub) = self.locate(index);
        self.switch_to(btag);
        let (_, block) = self.cur.as_ref().expect("current block");
        block.items[sub].clone()
    }

    pub fn set(&mut self, index: usize, item: T) {
        let (btag, sub) = self.locate(index);
        self.switch_to(btag);
        let (_, block) = self.cur.as_mut().expect("current block");
        block.items[sub] = item;
    }

    pub fn swap(&mut self, a: usize, b: usize) {
        let va = self.get(a);
        let vb = self.get(b);
        self.set(a, vb);
        self.set(b, va);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T_TABLE: RecordType = RecordType(RecordType::USER_BASE + 900);
    const T_BLOCK: RecordType = RecordType(RecordType::USER_BASE + 901);

    fn setup() -> Database {
        register_table_type::<u32>(T_TABLE, T_BLOCK, "test_u32_table");
        Database::open_in_temp(0).unwrap()
    }

    #[test]
    fn push_and_read_across_blocks() {
        let db = setup();
        let tag = DataTable::<u32>::create(&db, T_TABLE, T_BLOCK, 8);
        for i in 0..100u32 {
            DataTable::push_back(&db, tag, i * 3);
        }
        let mut iter = DataTableIter::<u32>::begin(&db, tag);
        assert_eq!(iter.len(), 100);
        for i in 0..100usize {
            assert_eq!(iter.get(i), (i as u32) * 3);
        }
    }

    #[test]
    fn items_per_slot_rounds_to_power_of_two() {
        let db = setup();
        let tag = DataTable::<u32>::create(&db, T_TABLE, T_BLOCK, 100);
        let tab = db.read::<DataTable<u32>>(tag);
        assert_eq!(tab.items_per_slot(), 64);
    }

    #[test]
    fn survives_paging() {
        let db = setup();
        let tag = DataTable::<u32>::create(&db, T_TABLE, T_BLOCK, 16);
        for i in 0..64u32 {
            DataTable::push_back(&db, tag, i ^ 0xdead);
        }
        let stats = db.gc();
        assert!(stats.evicted > 0);
        let mut iter = DataTableIter::<u32>::begin(&db, tag);
        for i in 0..64usize {
            assert_eq!(iter.get(i), (i as u32) ^ 0xdead);
        }
    }

    #[test]
    fn write_iterator_swaps() {
        let db = setup();
        let tag = DataTable::<u32>::create(&db, T_TABLE, T_BLOCK, 4);
        for i in 0..10u32 {
            DataTable::push_back(&db, tag, i);
        }
        {
            let mut iter = DataTableIterMut::<u32>::begin(&db, tag);
            iter.swap(0, 9);
        }
        let mut iter = DataTableIter::<u32>::begin(&db, tag);
        assert_eq!(iter.get(0), 9);
        assert_eq!(iter.get(9), 0);
    }
}
