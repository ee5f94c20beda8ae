//! Ray-traceable tessellations: micro-triangle meshes (and curve
//! batches for hair) produced by the geometry approximation layer.
//!
//! A tessellation owns its vertex and triangle lists plus uniform and
//! vertex attribute channels. The accelerated-triangle record and the
//! private sub-BSP are deferred: they are generated the first time a ray
//! descends into the tessellation.

use crate::math::*;
use crate::rtypes;
use ember_db::table::TableItem;
use ember_db::{Database, DbFlags, Record, RecordType, Tag};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::mem;

fn write_vec3(w: &mut Vec<u8>, v: &Vec3) {
    for i in 0..3 {
        w.write_f32::<LittleEndian>(v[i]).unwrap();
    }
}

fn read_vec3(r: &mut &[u8]) -> Option<Vec3> {
    let mut v = Vec3::zeros();
    for i in 0..3 {
        v[i] = r.read_f32::<LittleEndian>().ok()?;
    }
    Some(v)
}

fn write_bbox(w: &mut Vec<u8>, b: &BBox) {
    write_vec3(w, &b.min);
    write_vec3(w, &b.max);
}

fn read_bbox(r: &mut &[u8]) -> Option<BBox> {
    Some(BBox {
        min: read_vec3(r)?,
        max: read_vec3(r)?,
    })
}

fn write_channels(w: &mut Vec<u8>, channels: &[Vec<f32>]) {
    w.write_u32::<LittleEndian>(channels.len() as u32).unwrap();
    for ch in channels {
        w.write_u32::<LittleEndian>(ch.len() as u32).unwrap();
        for v in ch {
            w.write_f32::<LittleEndian>(*v).unwrap();
        }
    }
}

fn read_channels(r: &mut &[u8]) -> Option<Vec<Vec<f32>>> {
    let n = r.read_u32::<LittleEndian>().ok()? as usize;
    let mut channels = Vec::with_capacity(n);
    for _ in 0..n {
        let len = r.read_u32::<LittleEndian>().ok()? as usize;
        let mut ch = Vec::with_capacity(len);
        for _ in 0..len {
            ch.push(r.read_f32::<LittleEndian>().ok()?);
        }
        channels.push(ch);
    }
    Some(channels)
}

/// A tessellated vertex with its motion end position.
#[derive(Copy, Clone, Debug)]
pub struct RayVertex {
    pub pos: Vec3,
    pub m_pos: Vec3,
}

impl RayVertex {
    pub fn fixed(pos: Vec3) -> RayVertex {
        RayVertex { pos, m_pos: pos }
    }
}

/// A tessellated ray-traceable triangle.
#[derive(Copy, Clone, Debug)]
pub struct RayTriangle {
    pub v1: u32,
    pub v2: u32,
    pub v3: u32,
    /// Source primitive index for uniform channels.
    pub prim_index: u32,
    pub deform_moving: bool,
}

/// One curve of a hair tessellation; control points live in the vertex
/// list, the per-vertex radius in `radii`.
#[derive(Copy, Clone, Debug)]
pub struct CurveSegment {
    pub first: u32,
    pub count: u32,
    pub degree: u8,
    pub prim_index: u32,
}

pub struct RayTessel {
    pub bbox: BBox,
    pub motion_bbox: BBox,
    /// Deferred dice job; a tessellation carrying a job but no geometry
    /// is a placeholder diced on first descent.
    pub job: Tag,
    /// Intersected through the object's procedural hook instead of
    /// accelerated triangles.
    pub procedural: bool,
    pub vertices: Vec<RayVertex>,
    pub triangles: Vec<RayTriangle>,
    pub curves: Vec<CurveSegment>,
    pub radii: Vec<f32>,
    /// Per source primitive scalar channels.
    pub uniform_channels: Vec<Vec<f32>>,
    /// Per vertex scalar channels, laid out by the source object's
    /// interpolated parameter layout.
    pub vertex_channels: Vec<Vec<f32>>,
    /// Deferred accelerated-triangle record.
    pub accel: Tag,
    /// Deferred private sub-BSP record.
    pub subtree: Tag,
}

impl RayTessel {
    pub fn new(num_uniform_channels: usize, num_vertex_channels: usize) -> RayTessel {
        RayTessel {
            bbox: BBox::empty(),
            motion_bbox: BBox::empty(),
            job: Tag::null(),
            procedural: false,
            vertices: Vec::new(),
            triangles: Vec::new(),
            curves: Vec::new(),
            radii: Vec::new(),
            uniform_channels: vec![Vec::new(); num_uniform_channels],
            vertex_channels: vec![Vec::new(); num_vertex_channels],
            accel: Tag::null(),
            subtree: Tag::null(),
        }
    }

    /// A placeholder carrying only a bounding box and the dice job.
    pub fn deferred(bbox: BBox, job: Tag) -> RayTessel {
        let mut t = RayTessel::new(0, 0);
        t.bbox = bbox;
        t.motion_bbox = bbox;
        t.job = job;
        t
    }

    pub fn is_placeholder(&self) -> bool {
        !self.job.is_null() && self.vertices.is_empty() && !self.procedural
    }

    pub fn add_vertex(&mut self, v: RayVertex) {
        self.bbox.add_point(&v.pos);
        self.motion_bbox.add_point(&v.pos);
        self.motion_bbox.add_point(&v.m_pos);
        self.vertices.push(v);
    }

    pub fn add_triangle(&mut self, tri: RayTriangle) {
        self.triangles.push(tri);
    }

    pub fn add_vertex_data(&mut self, channel: usize, value: f32) {
        self.vertex_channels[channel].push(value);
    }

    pub fn add_uniform_data(&mut self, channel: usize, value: f32) {
        self.uniform_channels[channel].push(value);
    }

    /// Combined static and motion bound.
    pub fn bound(&self, motion: bool) -> BBox {
        if motion {
            self.motion_bbox
        } else {
            self.bbox
        }
    }

    /// Bound of one triangle including its motion sweep.
    pub fn triangle_bound(&self, tri: &RayTriangle, motion: bool) -> BBox {
        let mut b = BBox::empty();
        for &vi in [tri.v1, tri.v2, tri.v3].iter() {
            let v = &self.vertices[vi as usize];
            b.add_point(&v.pos);
            if motion {
                b.add_point(&v.m_pos);
            }
        }
        b
    }

    /// Bound of one curve including radius padding.
    pub fn curve_bound(&self, curve: &CurveSegment, motion: bool) -> BBox {
        let mut b = BBox::empty();
        let mut max_r = 0.0f32;
        for i in curve.first..curve.first + curve.count {
            let v = &self.vertices[i as usize];
            b.add_point(&v.pos);
            if motion {
                b.add_point(&v.m_pos);
            }
            max_r = max_r.max(self.radii.get(i as usize).copied().unwrap_or(0.0));
        }
        b.min -= Vec3::new(max_r, max_r, max_r);
        b.max += Vec3::new(max_r, max_r, max_r);
        b
    }
}

impl RayTessel {
    pub fn decode(bytes: &[u8]) -> Option<RayTessel> {
        let mut r = bytes;
        let bbox = read_bbox(&mut r)?;
        let motion_bbox = read_bbox(&mut r)?;
        let job = Tag::decode_item(&mut r)?;
        let accel = Tag::decode_item(&mut r)?;
        let subtree = Tag::decode_item(&mut r)?;
        use std::io::Read;
        let mut flag = [0u8; 1];
        r.read_exact(&mut flag).ok()?;
        let procedural = flag[0] != 0;
        let num_vertices = r.read_u32::<LittleEndian>().ok()? as usize;
        let mut vertices = Vec::with_capacity(num_vertices);
        for _ in 0..num_vertices {
            vertices.push(RayVertex {
                pos: read_vec3(&mut r)?,
                m_pos: read_vec3(&mut r)?,
            });
        }
        let num_triangles = r.read_u32::<LittleEndian>().ok()? as usize;
        let mut triangles = Vec::with_capacity(num_triangles);
        for _ in 0..num_triangles {
            let v1 = r.read_u32::<LittleEndian>().ok()?;
            let v2 = r.read_u32::<LittleEndian>().ok()?;
            let v3 = r.read_u32::<LittleEndian>().ok()?;
            let prim_index = r.read_u32::<LittleEndian>().ok()?;
            r.read_exact(&mut flag).ok()?;
            triangles.push(RayTriangle {
                v1,
                v2,
                v3,
                prim_index,
                deform_moving: flag[0] != 0,
            });
        }
        let num_curves = r.read_u32::<LittleEndian>().ok()? as usize;
        let mut curves = Vec::with_capacity(num_curves);
        for _ in 0..num_curves {
            let first = r.read_u32::<LittleEndian>().ok()?;
            let count = r.read_u32::<LittleEndian>().ok()?;
            r.read_exact(&mut flag).ok()?;
            let degree = flag[0];
            let prim_index = r.read_u32::<LittleEndian>().ok()?;
            curves.push(CurveSegment {
                first,
                count,
                degree,
                prim_index,
            });
        }
        let num_radii = r.read_u32::<LittleEndian>().ok()? as usize;
        let mut radii = Vec::with_capacity(num_radii);
        for _ in 0..num_radii {
            radii.push(r.read_f32::<LittleEndian>().ok()?);
        }
        let uniform_channels = read_channels(&mut r)?;
        let vertex_channels = read_channels(&mut r)?;
        Some(RayTessel {
            bbox,
            motion_bbox,
            job,
            procedural,
            vertices,
            triangles,
            curves,
            radii,
            uniform_channels,
            vertex_channels,
            accel,
            subtree,
        })
    }
}

impl Record for RayTessel {
    fn type_id(&self) -> RecordType {
        rtypes::RAY_TESSEL
    }

    fn encode(&self, w: &mut Vec<u8>) -> ember_db::Result<()> {
        write_bbox(w, &self.bbox);
        write_bbox(w, &self.motion_bbox);
        self.job.encode_item(w);
        self.accel.encode_item(w);
        self.subtree.encode_item(w);
        w.push(self.procedural as u8);
        w.write_u32::<LittleEndian>(self.vertices.len() as u32).unwrap();
        for v in &self.vertices {
            write_vec3(w, &v.pos);
            write_vec3(w, &v.m_pos);
        }
        w.write_u32::<LittleEndian>(self.triangles.len() as u32).unwrap();
        for t in &self.triangles {
            w.write_u32::<LittleEndian>(t.v1).unwrap();
            w.write_u32::<LittleEndian>(t.v2).unwrap();
            w.write_u32::<LittleEndian>(t.v3).unwrap();
            w.write_u32::<LittleEndian>(t.prim_index).unwrap();
            w.push(t.deform_moving as u8);
        }
        w.write_u32::<LittleEndian>(self.curves.len() as u32).unwrap();
        for c in &self.curves {
            w.write_u32::<LittleEndian>(c.first).unwrap();
            w.write_u32::<LittleEndian>(c.count).unwrap();
            w.push(c.degree);
            w.write_u32::<LittleEndian>(c.prim_index).unwrap();
        }
        w.write_u32::<LittleEndian>(self.radii.len() as u32).unwrap();
        for radius in &self.radii {
            w.write_f32::<LittleEndian>(*radius).unwrap();
        }
        write_channels(w, &self.uniform_channels);
        write_channels(w, &self.vertex_channels);
        Ok(())
    }

    fn size_hint(&self) -> usize {
        self.vertices.len() * mem::size_of::<RayVertex>()
            + self.triangles.len() * mem::size_of::<RayTriangle>()
            + self.curves.len() * mem::size_of::<CurveSegment>()
            + self.radii.len() * 4
            + self
                .vertex_channels
                .iter()
                .chain(self.uniform_channels.iter())
                .map(|c| c.len() * 4)
                .sum::<usize>()
            + mem::size_of::<Self>()
    }
}

/// Begin describing a tessellation; finish with [end_tessel].
pub fn create_tessel(
    db: &Database,
    num_uniform_channels: usize,
    num_vertex_channels: usize,
) -> Tag {
    db.create(
        RayTessel::new(num_uniform_channels, num_vertex_channels),
        DbFlags::FLUSHABLE | DbFlags::GEN_LOCAL,
    )
}

/// Begin describing a deferred tessellation: a bounding box plus the
/// dice job executed on first descent.
pub fn create_deferred_tessel(db: &Database, bbox: BBox, job: Tag) -> Tag {
    db.create(
        RayTessel::deferred(bbox, job),
        DbFlags::FLUSHABLE | DbFlags::GEN_LOCAL,
    )
}

/// Finishes a tessellation: attaches the deferred accelerated-triangle
/// and sub-BSP records and registers their source link with the ray
/// tracer so the generators can find the tessellation.
pub fn end_tessel(rt: &crate::rt::RayTracer, tessel: Tag) {
    let needs_accel = {
        let t = rt.db.read::<RayTessel>(tessel);
        !t.triangles.is_empty() || !t.curves.is_empty()
    };
    if !needs_accel {
        return;
    }
    let accel = rt.db.create_deferred(
        rtypes::RAY_ACCEL_TRIANGLES,
        DbFlags::FLUSHABLE | DbFlags::GEN_ALWAYS,
    );
    let subtree = rt.db.create_deferred(
        rtypes::RAY_SUBTREE,
        DbFlags::FLUSHABLE | DbFlags::GEN_ALWAYS,
    );
    rt.set_link_source(accel, tessel);
    rt.set_link_source(subtree, tessel);
    let mut t = rt.db.write::<RayTessel>(tessel);
    t.accel = accel;
    t.subtree = subtree;
}

/// Accelerated triangle with the edge vectors of the Möller–Trumbore
/// test precomputed for both motion end points.
#[derive(Copy, Clone, Debug)]
pub struct RayAccelTriangle {
    pub v0: Vec3,
    pub e1: Vec3,
    pub e2: Vec3,
    pub m_v0: Vec3,
    pub m_e1: Vec3,
    pub m_e2: Vec3,
    pub moving: bool,
}

pub struct RayAccelTriangles {
    pub tris: Vec<RayAccelTriangle>,
}

impl Record for RayAccelTriangles {
    fn type_id(&self) -> RecordType {
        rtypes::RAY_ACCEL_TRIANGLES
    }

    fn size_hint(&self) -> usize {
        self.tris.len() * mem::size_of::<RayAccelTriangle>() + mem::size_of::<Self>()
    }
}

pub(crate) fn generate_accel_triangles(tessel: &RayTessel) -> RayAccelTriangles {
    let tris = tessel
        .triangles
        .iter()
        .map(|tri| {
            let a = &tessel.vertices[tri.v1 as usize];
            let b = &tessel.vertices[tri.v2 as usize];
            let c = &tessel.vertices[tri.v3 as usize];
            RayAccelTriangle {
                v0: a.pos,
                e1: b.pos - a.pos,
                e2: c.pos - a.pos,
                m_v0: a.m_pos,
                m_e1: b.m_pos - a.m_pos,
                m_e2: c.m_pos - a.m_pos,
                moving: tri.deform_moving,
            }
        })
        .collect();
    RayAccelTriangles { tris }
}

/// The private sub-BSP of one tessellation.
pub struct RaySubtree {
    pub tree: crate::rt::bsp::BspTree,
}

impl Record for RaySubtree {
    fn type_id(&self) -> RecordType {
        rtypes::RAY_SUBTREE
    }

    fn size_hint(&self) -> usize {
        self.tree.size_hint() + mem::size_of::<Self>()
    }
}
