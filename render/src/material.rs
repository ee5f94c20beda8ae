//! Materials: the bundle of shader lists attached to object instances.

use crate::rtypes;
use ember_db::array::DataArray;
use ember_db::record::{register_type, TypeDesc};
use ember_db::table::TableItem;
use ember_db::{Database, DbFlags, Error as DbError, Record, RecordType, Tag};
use std::mem;

pub struct Material {
    pub surface_list: Tag,
    pub displace_list: Tag,
    pub shadow_list: Tag,
    pub volume_list: Tag,
    pub environment_list: Tag,
    pub photon_list: Tag,
}

impl Record for Material {
    fn type_id(&self) -> RecordType {
        rtypes::MATERIAL
    }

    fn size_hint(&self) -> usize {
        mem::size_of::<Self>()
    }

    fn encode(&self, w: &mut Vec<u8>) -> ember_db::Result<()> {
        for t in [
            self.surface_list,
            self.displace_list,
            self.shadow_list,
            self.volume_list,
            self.environment_list,
            self.photon_list,
        ]
        .iter()
        {
            t.encode_item(w);
        }
        Ok(())
    }
}

pub(crate) fn register_material_types() {
    register_type(
        rtypes::MATERIAL,
        TypeDesc::new("material").with_decode(Box::new(|bytes| {
            let mut r = bytes;
            let mut tags = [Tag::null(); 6];
            for t in tags.iter_mut() {
                *t = Tag::decode_item(&mut r).ok_or(DbError::Corrupt("material"))?;
            }
            Ok(Box::new(Material {
                surface_list: tags[0],
                displace_list: tags[1],
                shadow_list: tags[2],
                volume_list: tags[3],
                environment_list: tags[4],
                photon_list: tags[5],
            }) as Box<dyn Record>)
        })),
    );
}

impl Material {
    /// Creates a material with empty shader lists.
    pub fn create(db: &Database) -> Tag {
        db.create(
            Material {
                surface_list: DataArray::<Tag>::create(db, rtypes::TAG_ARRAY),
                displace_list: DataArray::<Tag>::create(db, rtypes::TAG_ARRAY),
                shadow_list: DataArray::<Tag>::create(db, rtypes::TAG_ARRAY),
                volume_list: DataArray::<Tag>::create(db, rtypes::TAG_ARRAY),
                environment_list: DataArray::<Tag>::create(db, rtypes::TAG_ARRAY),
                photon_list: DataArray::<Tag>::create(db, rtypes::TAG_ARRAY),
            },
            DbFlags::empty(),
        )
    }

    pub fn add_surface(db: &Database, mtl: Tag, shader: Tag) {
        let list = db.read::<Material>(mtl).surface_list;
        DataArray::<Tag>::push(db, list, shader);
    }

    pub fn add_displace(db: &Database, mtl: Tag, shader: Tag) {
        let list = db.read::<Material>(mtl).displace_list;
        DataArray::<Tag>::push(db, list, shader);
    }

    pub fn add_shadow(db: &Database, mtl: Tag, shader: Tag) {
        let list = db.read::<Material>(mtl).shadow_list;
        DataArray::<Tag>::push(db, list, shader);
    }

    pub fn add_volume(db: &Database, mtl: Tag, shader: Tag) {
        let list = db.read::<Material>(mtl).volume_list;
        DataArray::<Tag>::push(db, list, shader);
    }

    pub fn add_environment(db: &Database, mtl: Tag, shader: Tag) {
        let list = db.read::<Material>(mtl).environment_list;
        DataArray::<Tag>::push(db, list, shader);
    }

    pub fn add_photon(db: &Database, mtl: Tag, shader: Tag) {
        let list = db.read::<Material>(mtl).photon_list;
        DataArray::<Tag>::push(db, list, shader);
    }

    /// Whether the volume list actually holds shaders; an empty list
    /// does not join the volume stack.
    pub fn has_volume(db: &Database, mtl: Tag) -> bool {
        let list = db.read::<Material>(mtl).volume_list;
        !db.read::<DataArray<Tag>>(list).items.is_empty()
    }
}
