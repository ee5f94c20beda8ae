//! Random-access resizable arrays stored as single records, used for
//! small homogeneous sequences (shader lists, tessellation lists).

use crate::error::{Error, Result};
use crate::record::{register_type, Record, RecordType, TypeDesc};
use crate::table::TableItem;
use crate::{Database, DbFlags, Tag};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::mem;

pub struct DataArray<T: TableItem> {
    type_id: RecordType,
    pub items: Vec<T>,
}

impl<T: TableItem> Record for DataArray<T> {
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

pub fn register_array_type<T: TableItem>(id: RecordType, name: &'static str) {
    register_type(
        id,
        TypeDesc::new(name).with_decode(Box::new(move |bytes| {
            let mut r = bytes;
            let count = r.read_u32::<LittleEndian>().map_err(|_| Error::Corrupt("array count"))?;
            let mut items = Vec::with_capacity(count as usize);
            for _ in 0..count {
                items.push(T::decode_item(&mut r).ok_or(Error::Corrupt("array item"))?);
            }
            Ok(Box::new(DataArray::<T> { type_id: id, items }) as Box<dyn Record>)
        })),
    );
}

impl<T: TableItem> DataArray<T> {
    pub fn create(db: &Database, type_id: RecordType) -> Tag {
        db.create(
            DataArray::<T> {
                type_id,
                items: Vec::new(),
            },
            DbFlags::FLUSHABLE,
        )
    }

    pub fn create_from(db: &Database, type_id: RecordType, items: Vec<T>) -> Tag {
        db.create(DataArray::<T> { type_id, items }, DbFlags::FLUSHABLE)
    }

    pub fn push(db: &Database, tag: Tag, item: T) {
        db.write::<DataArray<T>>(tag).items.push(item);
    }

    pub fn len(db: &Database, tag: Tag) -> usize {
        db.read::<DataArray<T>>(tag).items.len()
    }

    pub fn get(db: &Database, tag: Tag, index: usize) -> T {
        db.read::<DataArray<T>>(tag).items[index].clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T_ARRAY: RecordType = RecordType(RecordType::USER_BASE + 902);

    #[test]
    fn push_resize_and_page() {
        register_array_type::<f32>(T_ARRAY, "test_f32_array");
        let db = Database::open_in_temp(0).unwrap();
        let tag = DataArray::<f32>::create(&db, T_ARRAY);
        for i in 0..33 {
            DataArray::push(&db, tag, i as f32 * 0.5);
        }
        db.gc();
        assert_eq!(DataArray::<f32>::len(&db, tag), 33);
        assert_eq!(DataArray::<f32>::get(&db, tag, 32), 16.0);
    }
}
