//! Tiled framebuffers.
//!
//! A framebuffer is a named 2-D grid of sample-info-typed pixels
//! chunked into tiles; every tile is a flushable record. Each output
//! channel owns one slice of the composite sample info (the standard
//! color or opacity, or one user slot); several channels can share one
//! composite layout. Samples accumulate with their filter weights and
//! a final resolve divides them out.

use crate::math::*;
use crate::rtypes;
use crate::state::SampleInfo;
use ember_db::record::{register_type, TypeDesc};
use ember_db::{Database, DbFlags, Error as DbError, Record, RecordType, Tag, Value, ValueType};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::mem;

pub const DEFAULT_TILE_SIZE: u32 = 64;

/// Which slice of the composite sample info a channel owns.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ChannelSource {
    Color,
    Opacity,
    User(u32),
}

impl ChannelSource {
    fn encode(self, w: &mut Vec<u8>) {
        match self {
            ChannelSource::Color => w.write_u32::<LittleEndian>(0).unwrap(),
            ChannelSource::Opacity => w.write_u32::<LittleEndian>(1).unwrap(),
            ChannelSource::User(i) => w.write_u32::<LittleEndian>(2 + i).unwrap(),
        }
    }

    fn decode(r: &mut &[u8]) -> Option<ChannelSource> {
        Some(match r.read_u32::<LittleEndian>().ok()? {
            0 => ChannelSource::Color,
            1 => ChannelSource::Opacity,
            n => ChannelSource::User(n - 2),
        })
    }

    /// Extracts this channel's value from a sample.
    pub fn extract(self, sample: &SampleInfo) -> [f32; 4] {
        match self {
            ChannelSource::Color => [sample.color.x, sample.color.y, sample.color.z, 0.0],
            ChannelSource::Opacity => {
                [sample.opacity.x, sample.opacity.y, sample.opacity.z, 0.0]
            }
            ChannelSource::User(i) => match sample.user.get(i as usize) {
                Some(v) => match v.cast(ValueType::Vec4) {
                    Value::Vec4(c) => c,
                    _ => [0.0; 4],
                },
                None => [0.0; 4],
            },
        }
    }
}

/// One tile: accumulated channel components plus the filter weight.
pub struct FbTile {
    pub acc: Vec<[f32; 4]>,
    pub weight: Vec<f32>,
}

impl FbTile {
    fn new(len: usize) -> FbTile {
        FbTile {
            acc: vec![[0.0; 4]; len],
            weight: vec![0.0; len],
        }
    }
}

impl Record for FbTile {
    fn type_id(&self) -> RecordType {
        rtypes::FB_TILE
    }

    fn size_hint(&self) -> usize {
        self.acc.len() * 20 + mem::size_of::<Self>()
    }

    fn encode(&self, w: &mut Vec<u8>) -> ember_db::Result<()> {
        w.write_u32::<LittleEndian>(self.acc.len() as u32).unwrap();
        for (a, wt) in self.acc.iter().zip(self.weight.iter()) {
            for c in a.iter() {
                w.write_f32::<LittleEndian>(*c).unwrap();
            }
            w.write_f32::<LittleEndian>(*wt).unwrap();
        }
        Ok(())
    }
}

/// The framebuffer header record.
pub struct FrameBuffer {
    pub name: String,
    pub ty: ValueType,
    pub source: ChannelSource,
    pub width: u32,
    pub height: u32,
    pub tile_size: u32,
    pub tiles: Vec<Tag>,
}

impl FrameBuffer {
    pub fn tiles_x(&self) -> u32 {
        (self.width + self.tile_size - 1) / self.tile_size
    }

    pub fn tiles_y(&self) -> u32 {
        (self.height + self.tile_size - 1) / self.tile_size
    }
}

impl Record for FrameBuffer {
    fn type_id(&self) -> RecordType {
        rtypes::FRAMEBUFFER
    }

    fn size_hint(&self) -> usize {
        self.tiles.len() * mem::size_of::<Tag>() + mem::size_of::<Self>()
    }

    fn encode(&self, w: &mut Vec<u8>) -> ember_db::Result<()> {
        use ember_db::table::TableItem;
        w.write_u32::<LittleEndian>(self.name.len() as u32).unwrap();
        w.extend_from_slice(self.name.as_bytes());
        w.write_u32::<LittleEndian>(value_type_code(self.ty)).unwrap();
        self.source.encode(w);
        w.write_u32::<LittleEndian>(self.width).unwrap();
        w.write_u32::<LittleEndian>(self.height).unwrap();
        w.write_u32::<LittleEndian>(self.tile_size).unwrap();
        w.write_u32::<LittleEndian>(self.tiles.len() as u32).unwrap();
        for t in &self.tiles {
            t.encode_item(w);
        }
        Ok(())
    }
}

fn value_type_code(ty: ValueType) -> u32 {
    match ty {
        ValueType::Scalar => 7,
        ValueType::Vec2 => 8,
        ValueType::Vec3 => 9,
        ValueType::Vec4 => 10,
        _ => 7,
    }
}

fn value_type_from_code(code: u32) -> ValueType {
    match code {
        8 => ValueType::Vec2,
        9 => ValueType::Vec3,
        10 => ValueType::Vec4,
        _ => ValueType::Scalar,
    }
}

pub(crate) fn register_framebuffer_types() {
    register_type(
        rtypes::FB_TILE,
        TypeDesc::new("framebuffer_tile").with_decode(Box::new(|bytes| {
            let mut r = bytes;
            let len = r
                .read_u32::<LittleEndian>()
                .map_err(|_| DbError::Corrupt("tile"))? as usize;
            let mut tile = FbTile::new(len);
            for i in 0..len {
                for c in tile.acc[i].iter_mut() {
                    *c = r
                        .read_f32::<LittleEndian>()
                        .map_err(|_| DbError::Corrupt("tile"))?;
                }
                tile.weight[i] = r
                    .read_f32::<LittleEndian>()
                    .map_err(|_| DbError::Corrupt("tile"))?;
            }
            Ok(Box::new(tile) as Box<dyn Record>)
        })),
    );
    register_type(
        rtypes::FRAMEBUFFER,
        TypeDesc::new("framebuffer").with_decode(Box::new(|bytes| {
            use ember_db::table::TableItem;
            let mut r = bytes;
            let name_len = r
                .read_u32::<LittleEndian>()
                .map_err(|_| DbError::Corrupt("fb"))? as usize;
            if r.len() < name_len {
                return Err(DbError::Corrupt("fb name"));
            }
            let (n, rest) = r.split_at(name_len);
            let name = String::from_utf8(n.to_vec()).map_err(|_| DbError::Corrupt("fb name"))?;
            r = rest;
            let ty = value_type_from_code(
                r.read_u32::<LittleEndian>().map_err(|_| DbError::Corrupt("fb"))?,
            );
            let source = ChannelSource::decode(&mut r).ok_or(DbError::Corrupt("fb"))?;
            let width = r.read_u32::<LittleEndian>().map_err(|_| DbError::Corrupt("fb"))?;
            let height = r.read_u32::<LittleEndian>().map_err(|_| DbError::Corrupt("fb"))?;
            let tile_size = r.read_u32::<LittleEndian>().map_err(|_| DbError::Corrupt("fb"))?;
            let num_tiles =
                r.read_u32::<LittleEndian>().map_err(|_| DbError::Corrupt("fb"))? as usize;
            let mut tiles = Vec::with_capacity(num_tiles);
            for _ in 0..num_tiles {
                tiles.push(Tag::decode_item(&mut r).ok_or(DbError::Corrupt("fb tiles"))?);
            }
            Ok(Box::new(FrameBuffer {
                name,
                ty,
                source,
                width,
                height,
                tile_size,
                tiles,
            }) as Box<dyn Record>)
        })),
    );
}

/// Creates a framebuffer with zeroed tiles.
pub fn create_framebuffer(
    db: &Database,
    name: &str,
    ty: ValueType,
    source: ChannelSource,
    width: u32,
    height: u32,
) -> Tag {
    let tile_size = DEFAULT_TILE_SIZE;
    let tiles_x = (width + tile_size - 1) / tile_size;
    let tiles_y = (height + tile_size - 1) / tile_size;
    let mut tiles = Vec::with_capacity((tiles_x * tiles_y) as usize);
    for _ in 0..tiles_x * tiles_y {
        tiles.push(db.create(
            FbTile::new((tile_size * tile_size) as usize),
            DbFlags::FLUSHABLE,
        ));
    }
    db.create(
        FrameBuffer {
            name: name.to_owned(),
            ty,
            source,
            width,
            height,
            tile_size,
            tiles,
        },
        DbFlags::empty(),
    )
}

pub fn delete_framebuffer(db: &Database, fb: Tag) {
    let tiles = db.read::<FrameBuffer>(fb).tiles.clone();
    for t in tiles {
        db.delete(t);
    }
    db.delete(fb);
}

/// Reads one resolved scanline; codecs quantize the values through the
/// options afterwards.
pub fn get_scanline(db: &Database, fb_tag: Tag, y: u32) -> Vec<[f32; 4]> {
    let fb = db.read::<FrameBuffer>(fb_tag);
    let mut out = Vec::with_capacity(fb.width as usize);
    let ty = y / fb.tile_size;
    let iy = (y % fb.tile_size) as usize;
    for x in 0..fb.width {
        let tx = x / fb.tile_size;
        let tile_tag = fb.tiles[(ty * fb.tiles_x() + tx) as usize];
        let tile = db.read::<FbTile>(tile_tag);
        let idx = iy * fb.tile_size as usize + (x % fb.tile_size) as usize;
        let w = tile.weight[idx];
        let a = tile.acc[idx];
        if w > SCALAR_EPS {
            out.push([a[0] / w, a[1] / w, a[2] / w, a[3] / w]);
        } else {
            out.push([0.0; 4]);
        }
    }
    out
}

/// Overwrites one resolved pixel; used by the imager chain.
pub fn set_pixel(db: &Database, fb_tag: Tag, x: u32, y: u32, value: [f32; 4]) {
    let (tile_tag, idx) = {
        let fb = db.read::<FrameBuffer>(fb_tag);
        let tx = x / fb.tile_size;
        let ty = y / fb.tile_size;
        let tile_tag = fb.tiles[(ty * fb.tiles_x() + tx) as usize];
        let idx =
            (y % fb.tile_size) as usize * fb.tile_size as usize + (x % fb.tile_size) as usize;
        (tile_tag, idx)
    };
    let mut tile = db.write::<FbTile>(tile_tag);
    tile.acc[idx] = value;
    tile.weight[idx] = 1.0;
}

/// Resolved value of a single pixel.
pub fn get_pixel(db: &Database, fb_tag: Tag, x: u32, y: u32) -> [f32; 4] {
    let fb = db.read::<FrameBuffer>(fb_tag);
    let tx = x / fb.tile_size;
    let ty = y / fb.tile_size;
    let tile_tag = fb.tiles[(ty * fb.tiles_x() + tx) as usize];
    let tile = db.read::<FbTile>(tile_tag);
    let idx =
        (y % fb.tile_size) as usize * fb.tile_size as usize + (x % fb.tile_size) as usize;
    let w = tile.weight[idx];
    if w > SCALAR_EPS {
        let a = tile.acc[idx];
        [a[0] / w, a[1] / w, a[2] / w, a[3] / w]
    } else {
        [0.0; 4]
    }
}

//--------------------------------------------------------------------------------------------------

/// Per-bucket accumulation cache: batches tile access so each touched
/// tile is written exactly once when the cache flushes.
pub struct FrameBufferCache {
    pub fb: Tag,
    pub name: String,
    pub ty: ValueType,
    pub source: ChannelSource,
    x0: i32,
    y0: i32,
    width: usize,
    height: usize,
    acc: Vec<[f32; 4]>,
    weight: Vec<f32>,
}

impl FrameBufferCache {
    /// Covers the pixel rect `[x0, x1) x [y0, y1)`.
    pub fn new(db: &Database, fb_tag: Tag, x0: i32, y0: i32, x1: i32, y1: i32) -> FrameBufferCache {
        let fb = db.read::<FrameBuffer>(fb_tag);
        let width = (x1 - x0).max(0) as usize;
        let height = (y1 - y0).max(0) as usize;
        FrameBufferCache {
            fb: fb_tag,
            name: fb.name.clone(),
            ty: fb.ty,
            source: fb.source,
            x0,
            y0,
            width,
            height,
            acc: vec![[0.0; 4]; width * height],
            weight: vec![0.0; width * height],
        }
    }

    /// Adds one weighted sample to a covered pixel.
    pub fn add_sample(&mut self, x: i32, y: i32, value: [f32; 4], weight: f32) {
        if x < self.x0
            || y < self.y0
            || x >= self.x0 + self.width as i32
            || y >= self.y0 + self.height as i32
        {
            return;
        }
        let idx = (y - self.y0) as usize * self.width + (x - self.x0) as usize;
        for k in 0..4 {
            self.acc[idx][k] += value[k] * weight;
        }
        self.weight[idx] += weight;
    }

    /// Merges the accumulated region into the framebuffer tiles.
    pub fn flush(&mut self, db: &Database) {
        let (tile_size, tiles_x, fb_width, fb_height, tiles) = {
            let fb = db.read::<FrameBuffer>(self.fb);
            (
                fb.tile_size as i32,
                fb.tiles_x() as i32,
                fb.width as i32,
                fb.height as i32,
                fb.tiles.clone(),
            )
        };
        // visit each overlapped tile once
        let tx0 = (self.x0.max(0)) / tile_size;
        let ty0 = (self.y0.max(0)) / tile_size;
        let tx1 = ((self.x0 + self.width as i32 - 1).min(fb_width - 1)) / tile_size;
        let ty1 = ((self.y0 + self.height as i32 - 1).min(fb_height - 1)) / tile_size;
        for ty in ty0..=ty1 {
            for tx in tx0..=tx1 {
                let tile_tag = tiles[(ty * tiles_x + tx) as usize];
                let mut tile = db.write::<FbTile>(tile_tag);
                let px0 = (tx * tile_size).max(self.x0);
                let py0 = (ty * tile_size).max(self.y0);
                let px1 = ((tx + 1) * tile_size)
                    .min(self.x0 + self.width as i32)
                    .min(fb_width);
                let py1 = ((ty + 1) * tile_size)
                    .min(self.y0 + self.height as i32)
                    .min(fb_height);
                for py in py0..py1 {
                    for px in px0..px1 {
                        let src =
                            (py - self.y0) as usize * self.width + (px - self.x0) as usize;
                        if self.weight[src] == 0.0 {
                            continue;
                        }
                        let dst = (py % tile_size) as usize * tile_size as usize
                            + (px % tile_size) as usize;
                        for k in 0..4 {
                            tile.acc[dst][k] += self.acc[src][k];
                        }
                        tile.weight[dst] += self.weight[src];
                    }
                }
            }
        }
        for a in self.acc.iter_mut() {
            *a = [0.0; 4];
        }
        for w in self.weight.iter_mut() {
            *w = 0.0;
        }
    }
}
