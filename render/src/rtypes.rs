//! Record type ids owned by the render layer, and the deterministic
//! start-up sequence that registers them with the database.

use crate::fg::Irradiance;
use crate::photon::Photon;
use ember_db::array::register_array_type;
use ember_db::record::RecordType;
use ember_db::table::register_table_type;
use ember_db::Tag;
use std::sync::Once;

const BASE: u32 = RecordType::USER_BASE;

pub const NODE_DESC: RecordType = RecordType(BASE);
pub const NODE: RecordType = RecordType(BASE + 1);
pub const SHADER_PARAM_TABLE: RecordType = RecordType(BASE + 2);
pub const TAG_ARRAY: RecordType = RecordType(BASE + 3);
pub const RAY_TESSEL: RecordType = RecordType(BASE + 4);
pub const RAY_ACCEL_TRIANGLES: RecordType = RecordType(BASE + 5);
pub const RAY_SUBTREE: RecordType = RecordType(BASE + 6);
pub const PRIM_LIST: RecordType = RecordType(BASE + 7);
pub const RAY_OBJECT: RecordType = RecordType(BASE + 8);
pub const RAY_OBJECT_INSTANCES: RecordType = RecordType(BASE + 9);
pub const RAY_SCENE: RecordType = RecordType(BASE + 10);
pub const TESSEL_JOB: RecordType = RecordType(BASE + 11);
pub const MAP: RecordType = RecordType(BASE + 12);
pub const PHOTON_TABLE: RecordType = RecordType(BASE + 13);
pub const PHOTON_BLOCK: RecordType = RecordType(BASE + 14);
pub const IRRAD_TABLE: RecordType = RecordType(BASE + 15);
pub const IRRAD_BLOCK: RecordType = RecordType(BASE + 16);
pub const FRAMEBUFFER: RecordType = RecordType(BASE + 17);
pub const FB_TILE: RecordType = RecordType(BASE + 18);
pub const TEXTURE: RecordType = RecordType(BASE + 19);
pub const TEX_TILE: RecordType = RecordType(BASE + 20);
pub const MATERIAL: RecordType = RecordType(BASE + 21);
pub const SOURCE_OBJECT: RecordType = RecordType(BASE + 22);
pub const TESSELLABLE: RecordType = RecordType(BASE + 23);
pub const BUCKET_JOB: RecordType = RecordType(BASE + 24);
pub const PHOTON_JOB: RecordType = RecordType(BASE + 25);
pub const VEC3_ARRAY: RecordType = RecordType(BASE + 26);
pub const INDEX_ARRAY: RecordType = RecordType(BASE + 27);
pub const SCALAR_ARRAY: RecordType = RecordType(BASE + 28);

static REGISTER: Once = Once::new();

/// Registers every render-side record type exactly once per process, in
/// a fixed order.
pub fn register_render_types() {
    REGISTER.call_once(|| {
        register_array_type::<Tag>(TAG_ARRAY, "tag_array");
        register_array_type::<[f32; 3]>(VEC3_ARRAY, "vec3_array");
        register_array_type::<u32>(INDEX_ARRAY, "index_array");
        register_array_type::<f32>(SCALAR_ARRAY, "scalar_array");
        register_table_type::<Photon>(PHOTON_TABLE, PHOTON_BLOCK, "photon_table");
        register_table_type::<Irradiance>(IRRAD_TABLE, IRRAD_BLOCK, "irradiance_table");
        crate::nodesys::register_node_types();
        crate::shader::register_shader_types();
        crate::rt::register_ray_types();
        crate::map::register_map_types();
        crate::framebuffer::register_framebuffer_types();
        crate::texture::register_texture_types();
        crate::material::register_material_types();
        crate::obj::register_object_types();
        crate::sampler::register_sampler_types();
    });
}
