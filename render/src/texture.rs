//! Texture maps: the mip-pyramid tile file format and the deferred,
//! locally generating tile records behind it.
//!
//! A texture file carries a fixed header, a layer-info table and then
//! row-major grids of square tiles per layer. Tiles become database
//! records generated on first access by seeking to the layer's data
//! offset and reading one tile; a read failure yields a zero-filled
//! placeholder and the render continues.

use crate::error::{Error, Result};
use crate::math::*;
use crate::rtypes;
use ember_db::record::{register_type, TypeDesc};
use ember_db::{Blob, Database, DbFlags, Error as DbError, Record, RecordType, Tag};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use fxhash::FxHashMap;
use log::error;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::mem;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

/// Sentinel of the texture file format.
pub const TEXTURE_FILE_CODE: u32 = 0x4569_5478;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Wrap {
    Clamp,
    Repeat,
}

impl Wrap {
    fn from_code(code: u32) -> Wrap {
        if code == 1 {
            Wrap::Repeat
        } else {
            Wrap::Clamp
        }
    }

    fn code(self) -> u32 {
        match self {
            Wrap::Clamp => 0,
            Wrap::Repeat => 1,
        }
    }
}

#[derive(Copy, Clone, Debug)]
pub struct LayerInfo {
    pub width: u32,
    pub height: u32,
    pub data_offset: u64,
}

impl LayerInfo {
    pub fn tiles_x(&self, tile_size: u32) -> u32 {
        (self.width + tile_size - 1) / tile_size
    }

    pub fn tiles_y(&self, tile_size: u32) -> u32 {
        (self.height + tile_size - 1) / tile_size
    }
}

/// The texture header record; tiles are separate deferred records.
pub struct Texture {
    pub path: PathBuf,
    pub tile_size: u32,
    pub num_channels: u32,
    pub channel_size: u32,
    pub swrap: Wrap,
    pub twrap: Wrap,
    pub layers: Vec<LayerInfo>,
    /// Per layer, the row-major grid of tile record tags.
    pub tiles: Vec<Vec<Tag>>,
}

impl Record for Texture {
    fn type_id(&self) -> RecordType {
        rtypes::TEXTURE
    }

    fn size_hint(&self) -> usize {
        self.tiles.iter().map(|l| l.len() * mem::size_of::<Tag>()).sum::<usize>()
            + mem::size_of::<Self>()
    }
}

/// Where a deferred tile reads from.
#[derive(Clone)]
struct TileSource {
    path: PathBuf,
    offset: u64,
    len: usize,
}

/// Process-wide link map from tile records to their file extents.
pub struct TextureSystem {
    sources: Mutex<FxHashMap<Tag, TileSource>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<T> {
    match m.lock() {
        Ok(g) => g,
        Err(p) => p.into_inner(),
    }
}

pub const IFACE_TEXTURES: u32 = 4;

impl TextureSystem {
    pub fn new() -> TextureSystem {
        TextureSystem {
            sources: Mutex::new(FxHashMap::default()),
        }
    }
}

impl Default for TextureSystem {
    fn default() -> TextureSystem {
        TextureSystem::new()
    }
}

pub(crate) fn register_texture_types() {
    register_type(rtypes::TEXTURE, TypeDesc::new("texture"));
    register_type(
        rtypes::TEX_TILE,
        TypeDesc::new("texture_tile").with_generate(Box::new(|db, tag| {
            let textures = db
                .interface::<TextureSystem>(IFACE_TEXTURES)
                .ok_or(DbError::NoGenerator)?;
            let source = lock(&textures.sources)
                .get(&tag)
                .cloned()
                .ok_or(DbError::NoGenerator)?;
            let mut bytes = vec![0u8; source.len];
            match read_tile_bytes(&source.path, source.offset, &mut bytes) {
                Ok(()) => {}
                Err(e) => {
                    // zero-filled placeholder, the render continues
                    error!("texture tile read failed ({:?}): {}", source.path, e);
                    for b in bytes.iter_mut() {
                        *b = 0;
                    }
                }
            }
            Ok(Box::new(Blob(bytes)) as Box<dyn Record>)
        })),
    );
}

fn read_tile_bytes(path: &Path, offset: u64, bytes: &mut [u8]) -> Result<()> {
    let mut f = File::open(path)?;
    f.seek(SeekFrom::Start(offset))?;
    f.read_exact(bytes)?;
    Ok(())
}

/// Opens a texture file, validates the header and creates the header
/// record plus one deferred tile record per layer tile.
pub fn open_texture(db: &Database, textures: &TextureSystem, path: &Path) -> Result<Tag> {
    let mut f = File::open(path)?;
    let code = f.read_u32::<LittleEndian>()?;
    if code != TEXTURE_FILE_CODE {
        return Err(Error::BadTextureFile("wrong format code"));
    }
    let tile_size = f.read_u32::<LittleEndian>()?;
    let num_channels = f.read_u32::<LittleEndian>()?;
    let channel_size = f.read_u32::<LittleEndian>()?;
    let swrap = Wrap::from_code(f.read_u32::<LittleEndian>()?);
    let twrap = Wrap::from_code(f.read_u32::<LittleEndian>()?);
    let num_layers = f.read_u32::<LittleEndian>()?;
    let _file_length = f.read_u64::<LittleEndian>()?;
    if tile_size == 0 || num_channels == 0 || channel_size == 0 || num_layers == 0 {
        return Err(Error::BadTextureFile("degenerate header"));
    }
    let mut layers = Vec::with_capacity(num_layers as usize);
    for _ in 0..num_layers {
        let width = f.read_u32::<LittleEndian>()?;
        let height = f.read_u32::<LittleEndian>()?;
        let data_offset = f.read_u64::<LittleEndian>()?;
        layers.push(LayerInfo {
            width,
            height,
            data_offset,
        });
    }
    let tile_bytes = (tile_size * tile_size * num_channels * channel_size) as usize;
    let mut tiles = Vec::with_capacity(layers.len());
    for layer in layers.iter() {
        let tx = layer.tiles_x(tile_size);
        let ty = layer.tiles_y(tile_size);
        let mut grid = Vec::with_capacity((tx * ty) as usize);
        for t in 0..tx * ty {
            let tile = db.create_deferred(
                rtypes::TEX_TILE,
                DbFlags::FLUSHABLE | DbFlags::GEN_LOCAL | DbFlags::GEN_ALWAYS,
            );
            lock(&textures.sources).insert(
                tile,
                TileSource {
                    path: path.to_owned(),
                    offset: layer.data_offset + t as u64 * tile_bytes as u64,
                    len: tile_bytes,
                },
            );
            grid.push(tile);
        }
        tiles.push(grid);
    }
    Ok(db.create(
        Texture {
            path: path.to_owned(),
            tile_size,
            num_channels,
            channel_size,
            swrap,
            twrap,
            layers,
            tiles,
        },
        DbFlags::empty(),
    ))
}

fn wrap_coord(v: f32, wrap: Wrap) -> f32 {
    match wrap {
        Wrap::Clamp => v.max(0.0).min(1.0),
        Wrap::Repeat => v - v.floor(),
    }
}

fn texel(db: &Database, tex: &Texture, layer: usize, x: u32, y: u32, channel: u32) -> f32 {
    let info = &tex.layers[layer];
    let x = x.min(info.width.saturating_sub(1));
    let y = y.min(info.height.saturating_sub(1));
    let tx = x / tex.tile_size;
    let ty = y / tex.tile_size;
    let tile_tag = tex.tiles[layer][(ty * info.tiles_x(tex.tile_size) + tx) as usize];
    let tile = db.read::<Blob>(tile_tag);
    let lx = (x % tex.tile_size) as usize;
    let ly = (y % tex.tile_size) as usize;
    let sample_bytes = (tex.num_channels * tex.channel_size) as usize;
    let base = (ly * tex.tile_size as usize + lx) * sample_bytes
        + (channel * tex.channel_size) as usize;
    match tex.channel_size {
        1 => tile.0.get(base).map(|b| *b as f32 / 255.0).unwrap_or(0.0),
        4 => {
            let b = tile.0.get(base..base + 4).unwrap_or(&[0, 0, 0, 0][..]);
            f32::from_le_bytes([b[0], b[1], b[2], b[3]])
        }
        _ => 0.0,
    }
}

/// Bilinear lookup of one channel at `(s, t)` on a mip layer.
pub fn lookup_texture(db: &Database, tex_tag: Tag, s: f32, t: f32, layer: usize, channel: u32) -> f32 {
    let tex = db.read::<Texture>(tex_tag);
    let layer = layer.min(tex.layers.len() - 1);
    let info = &tex.layers[layer];
    let s = wrap_coord(s, tex.swrap);
    let t = wrap_coord(t, tex.twrap);
    let fx = s * info.width.saturating_sub(1) as f32;
    let fy = t * info.height.saturating_sub(1) as f32;
    let x0 = fx.floor() as u32;
    let y0 = fy.floor() as u32;
    let dx = fx - x0 as f32;
    let dy = fy - y0 as f32;
    let c00 = texel(db, &tex, layer, x0, y0, channel);
    let c10 = texel(db, &tex, layer, x0 + 1, y0, channel);
    let c01 = texel(db, &tex, layer, x0, y0 + 1, channel);
    let c11 = texel(db, &tex, layer, x0 + 1, y0 + 1, channel);
    lerp(lerp(c00, c10, dx), lerp(c01, c11, dx), dy)
}

/// Filtered color lookup choosing the mip layer from the footprint
/// width in texture space.
pub fn lookup_texture_filtered(
    db: &Database,
    tex_tag: Tag,
    s: f32,
    t: f32,
    footprint: f32,
) -> Vec3 {
    let (num_layers, num_channels, base_width) = {
        let tex = db.read::<Texture>(tex_tag);
        (
            tex.layers.len(),
            tex.num_channels,
            tex.layers[0].width.max(1),
        )
    };
    let level = if footprint > 0.0 {
        (footprint * base_width as f32).log2().max(0.0) as usize
    } else {
        0
    };
    let layer = level.min(num_layers - 1);
    let mut out = Vec3::zeros();
    for c in 0..num_channels.min(3) {
        out[c as usize] = lookup_texture(db, tex_tag, s, t, layer, c);
    }
    if num_channels == 1 {
        out.y = out.x;
        out.z = out.x;
    }
    out
}

//--------------------------------------------------------------------------------------------------
// file writing (used by the pyramid builder and the tests)

/// Writes a texture file from float layers; `layers[0]` is the base
/// level, each following layer one mip step smaller.
pub fn write_texture_file(
    path: &Path,
    tile_size: u32,
    num_channels: u32,
    swrap: Wrap,
    twrap: Wrap,
    layers: &[(u32, u32, Vec<f32>)],
) -> Result<()> {
    let channel_size = 4u32;
    let mut f = File::create(path)?;
    f.write_u32::<LittleEndian>(TEXTURE_FILE_CODE)?;
    f.write_u32::<LittleEndian>(tile_size)?;
    f.write_u32::<LittleEndian>(num_channels)?;
    f.write_u32::<LittleEndian>(channel_size)?;
    f.write_u32::<LittleEndian>(swrap.code())?;
    f.write_u32::<LittleEndian>(twrap.code())?;
    f.write_u32::<LittleEndian>(layers.len() as u32)?;
    // patched after layout
    f.write_u64::<LittleEndian>(0)?;
    let header_end = 4 * 7 + 8;
    let layer_table_len = layers.len() as u64 * (4 + 4 + 8);
    let mut data_offset = header_end as u64 + layer_table_len;
    let mut offsets = Vec::new();
    for (w, h, _) in layers.iter() {
        f.write_u32::<LittleEndian>(*w)?;
        f.write_u32::<LittleEndian>(*h)?;
        f.write_u64::<LittleEndian>(data_offset)?;
        offsets.push(data_offset);
        let tiles_x = (w + tile_size - 1) / tile_size;
        let tiles_y = (h + tile_size - 1) / tile_size;
        data_offset += (tiles_x * tiles_y) as u64
            * (tile_size * tile_size * num_channels * channel_size) as u64;
    }
    for (li, (w, h, data)) in layers.iter().enumerate() {
        f.seek(SeekFrom::Start(offsets[li]))?;
        let tiles_x = (w + tile_size - 1) / tile_size;
        let tiles_y = (h + tile_size - 1) / tile_size;
        for ty in 0..tiles_y {
            for tx in 0..tiles_x {
                for y in 0..tile_size {
                    for x in 0..tile_size {
                        let sx = (tx * tile_size + x).min(w.saturating_sub(1));
                        let sy = (ty * tile_size + y).min(h.saturating_sub(1));
                        for c in 0..num_channels {
                            let idx =
                                ((sy * w + sx) * num_channels + c) as usize;
                            let v = data.get(idx).copied().unwrap_or(0.0);
                            f.write_f32::<LittleEndian>(v)?;
                        }
                    }
                }
            }
        }
    }
    let file_length = f.seek(SeekFrom::End(0))?;
    f.seek(SeekFrom::Start(4 * 7))?;
    f.write_u64::<LittleEndian>(file_length)?;
    Ok(())
}

/// Drops the tile source links of a deleted texture.
pub fn close_texture(db: &Database, textures: &TextureSystem, tex_tag: Tag) {
    let tiles = {
        let tex = db.read::<Texture>(tex_tag);
        tex.tiles.clone()
    };
    for grid in tiles {
        for t in grid {
            lock(&textures.sources).remove(&t);
            db.delete(t);
        }
    }
    db.delete(tex_tag);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn temp_path(name: &str) -> PathBuf {
        static N: AtomicU32 = AtomicU32::new(0);
        std::env::temp_dir().join(format!(
            "ember-tex-{}-{}-{}.tex",
            std::process::id(),
            N.fetch_add(1, Ordering::Relaxed),
            name
        ))
    }

    fn setup() -> (Database, Arc<TextureSystem>) {
        crate::rtypes::register_render_types();
        let db = Database::open_in_temp(0).unwrap();
        let textures = Arc::new(TextureSystem::new());
        db.set_interface(IFACE_TEXTURES, textures.clone());
        (db, textures)
    }

    #[test]
    fn header_and_tile_roundtrip() {
        let (db, textures) = setup();
        let path = temp_path("rt");
        // a 4x4 single-channel ramp
        let data: Vec<f32> = (0..16).map(|i| i as f32 / 15.0).collect();
        write_texture_file(&path, 4, 1, Wrap::Clamp, Wrap::Clamp, &[(4, 4, data)]).unwrap();
        let tex = open_texture(&db, &textures, &path).unwrap();
        let v = lookup_texture(&db, tex, 0.0, 0.0, 0, 0);
        assert!(v.abs() < 1.0e-6);
        let v = lookup_texture(&db, tex, 1.0, 1.0, 0, 0);
        assert!((v - 1.0).abs() < 1.0e-6);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn foreign_file_is_rejected() {
        let (db, textures) = setup();
        let path = temp_path("bad");
        std::fs::write(&path, b"not a texture").unwrap();
        assert!(open_texture(&db, &textures, &path).is_err());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn missing_tile_reads_zero_filled() {
        let (db, textures) = setup();
        let path = temp_path("trunc");
        let data: Vec<f32> = vec![0.5; 64 * 64];
        write_texture_file(&path, 16, 1, Wrap::Repeat, Wrap::Repeat, &[(64, 64, data)])
            .unwrap();
        let tex = open_texture(&db, &textures, &path).unwrap();
        // truncate the file behind the header so tile reads fail
        let f = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        f.set_len(128).unwrap();
        let v = lookup_texture(&db, tex, 0.9, 0.9, 0, 0);
        assert_eq!(v, 0.0);
        let _ = std::fs::remove_file(&path);
    }
}
