//! Math types shared across the engine, a thin layer over nalgebra-glm.

pub use nalgebra_glm as glm;

pub type Vec2 = glm::Vec2;
pub type Vec3 = glm::Vec3;
pub type Vec4 = glm::Vec4;
pub type Mat4 = glm::Mat4;

pub const SCALAR_EPS: f32 = 1.0e-6;
pub const MAX_SCALAR: f32 = ::std::f32::MAX;
pub const PI: f32 = ::std::f32::consts::PI;

#[inline]
pub fn almost_zero(x: f32, eps: f32) -> bool {
    x.abs() < eps
}

#[inline]
pub fn lerp(a: f32, b: f32, t: f32) -> f32 {
    a + (b - a) * t
}

#[inline]
pub fn lerp3(a: &Vec3, b: &Vec3, t: f32) -> Vec3 {
    a + (b - a) * t
}

#[inline]
pub fn point_transform(m: &Mat4, p: &Vec3) -> Vec3 {
    let v = m * Vec4::new(p.x, p.y, p.z, 1.0);
    Vec3::new(v.x, v.y, v.z)
}

#[inline]
pub fn vector_transform(m: &Mat4, v: &Vec3) -> Vec3 {
    let v = m * Vec4::new(v.x, v.y, v.z, 0.0);
    Vec3::new(v.x, v.y, v.z)
}

/// Row-major array form of a matrix, the layout of matrix-typed node
/// parameter values.
pub fn mat4_to_rows(m: &Mat4) -> [[f32; 4]; 4] {
    let mut out = [[0.0f32; 4]; 4];
    for r in 0..4 {
        for c in 0..4 {
            out[r][c] = m[(r, c)];
        }
    }
    out
}

/// Builds an orthonormal basis around `n`.
pub fn ortho_basis(n: &Vec3) -> (Vec3, Vec3) {
    let a = if n.x.abs() > 0.9 {
        Vec3::new(0.0, 1.0, 0.0)
    } else {
        Vec3::new(1.0, 0.0, 0.0)
    };
    let v = glm::normalize(&glm::cross(n, &a));
    let u = glm::cross(&v, n);
    (u, v)
}

/// Slope-scaled offset along the normal used to avoid self-intersection
/// of child rays.
#[inline]
pub fn calc_bias(ng: &Vec3, dir: &Vec3, bias: f32, bias_scale: f32) -> f32 {
    let cosine = glm::dot(ng, dir).abs().max(SCALAR_EPS);
    bias + bias_scale * (1.0 - cosine)
}

//--------------------------------------------------------------------------------------------------
// axis-aligned bounding boxes

pub const AXIS_X: usize = 0;
pub const AXIS_Y: usize = 1;
pub const AXIS_Z: usize = 2;

#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct BBox {
    pub min: Vec3,
    pub max: Vec3,
}

impl BBox {
    /// An inverted box that unions correctly with anything.
    pub fn empty() -> BBox {
        BBox {
            min: Vec3::new(MAX_SCALAR, MAX_SCALAR, MAX_SCALAR),
            max: Vec3::new(-MAX_SCALAR, -MAX_SCALAR, -MAX_SCALAR),
        }
    }

    pub fn from_points(points: &[Vec3]) -> BBox {
        let mut b = BBox::empty();
        for p in points {
            b.add_point(p);
        }
        b
    }

    pub fn is_empty(&self) -> bool {
        self.min.x > self.max.x || self.min.y > self.max.y || self.min.z > self.max.z
    }

    pub fn add_point(&mut self, p: &Vec3) {
        for i in 0..3 {
            self.min[i] = self.min[i].min(p[i]);
            self.max[i] = self.max[i].max(p[i]);
        }
    }

    pub fn union(&mut self, other: &BBox) {
        for i in 0..3 {
            self.min[i] = self.min[i].min(other.min[i]);
            self.max[i] = self.max[i].max(other.max[i]);
        }
    }

    pub fn intersection(&self, other: &BBox) -> BBox {
        let mut b = BBox::empty();
        for i in 0..3 {
            b.min[i] = self.min[i].max(other.min[i]);
            b.max[i] = self.max[i].min(other.max[i]);
        }
        b
    }

    pub fn overlaps(&self, other: &BBox) -> bool {
        (0..3).all(|i| self.min[i] <= other.max[i] && self.max[i] >= other.min[i])
    }

    pub fn contains_point(&self, p: &Vec3) -> bool {
        (0..3).all(|i| p[i] >= self.min[i] && p[i] <= self.max[i])
    }

    pub fn extent(&self, axis: usize) -> f32 {
        self.max[axis] - self.min[axis]
    }

    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    pub fn diag(&self) -> f32 {
        if self.is_empty() {
            0.0
        } else {
            glm::length(&(self.max - self.min))
        }
    }

    /// Axis of maximum extent.
    pub fn max_axis(&self) -> usize {
        let dx = self.extent(AXIS_X);
        let dy = self.extent(AXIS_Y);
        let dz = self.extent(AXIS_Z);
        if dx >= dy && dx >= dz {
            AXIS_X
        } else if dy >= dz {
            AXIS_Y
        } else {
            AXIS_Z
        }
    }

    pub fn surface_area(&self) -> f32 {
        if self.is_empty() {
            return 0.0;
        }
        let d = self.max - self.min;
        2.0 * (d.x * d.y + d.y * d.z + d.z * d.x)
    }

    /// Enlarges the box by a small relative amount on every side.
    pub fn expand_relative(&mut self, ratio: f32) {
        if self.is_empty() {
            return;
        }
        let d = (self.max - self.min) * ratio;
        self.min -= d;
        self.max += d;
    }

    /// Clips a ray against the box; returns the parametric range or None
    /// when the ray misses.
    pub fn intersect_ray(&self, org: &Vec3, inv_dir: &Vec3, t_near: f32, t_far: f32) -> Option<(f32, f32)> {
        let mut t0 = t_near;
        let mut t1 = t_far;
        for i in 0..3 {
            let mut near = (self.min[i] - org[i]) * inv_dir[i];
            let mut far = (self.max[i] - org[i]) * inv_dir[i];
            if near > far {
                ::std::mem::swap(&mut near, &mut far);
            }
            t0 = t0.max(near);
            t1 = t1.min(far);
            if t0 > t1 {
                return None;
            }
        }
        Some((t0, t1))
    }
}

//--------------------------------------------------------------------------------------------------
// shared-exponent compressed color

/// RGBE compressed color, stores irradiance records compactly.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct Rgbe {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub e: u8,
}

pub fn set_rgbe(c: &Vec3) -> Rgbe {
    let v = c.x.max(c.y).max(c.z);
    if v < 1.0e-32 {
        return Rgbe::default();
    }
    let (m, e) = frexp(v);
    let scale = m * 256.0 / v;
    Rgbe {
        r: (c.x * scale) as u8,
        g: (c.y * scale) as u8,
        b: (c.z * scale) as u8,
        e: (e + 128) as u8,
    }
}

pub fn get_rgbe(c: &Rgbe) -> Vec3 {
    if c.e == 0 {
        return Vec3::zeros();
    }
    let f = ldexp(1.0, c.e as i32 - 128 - 8);
    Vec3::new(
        (c.r as f32 + 0.5) * f,
        (c.g as f32 + 0.5) * f,
        (c.b as f32 + 0.5) * f,
    )
}

fn frexp(v: f32) -> (f32, i32) {
    if v == 0.0 || !v.is_finite() {
        return (v, 0);
    }
    let bits = v.to_bits();
    let exp = ((bits >> 23) & 0xff) as i32 - 126;
    let mantissa = f32::from_bits((bits & 0x807f_ffff) | 0x3f00_0000);
    (mantissa, exp)
}

fn ldexp(v: f32, e: i32) -> f32 {
    v * (e as f32).exp2()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bbox_union_and_axis() {
        let mut b = BBox::empty();
        b.add_point(&Vec3::new(-1.0, 0.0, 0.0));
        b.add_point(&Vec3::new(3.0, 1.0, 0.5));
        assert_eq!(b.max_axis(), AXIS_X);
        assert!((b.surface_area() - 2.0 * (4.0 + 0.5 + 2.0)).abs() < 1e-5);
    }

    #[test]
    fn bbox_ray_slab() {
        let b = BBox {
            min: Vec3::new(-1.0, -1.0, -1.0),
            max: Vec3::new(1.0, 1.0, 1.0),
        };
        let org = Vec3::new(0.0, 0.0, -5.0);
        let dir = Vec3::new(0.0, 0.0, 1.0);
        let inv = Vec3::new(1.0 / SCALAR_EPS, 1.0 / SCALAR_EPS, 1.0);
        let (t0, t1) = b.intersect_ray(&org, &inv, 0.0, MAX_SCALAR).unwrap();
        assert!((t0 - 4.0).abs() < 1e-4);
        assert!((t1 - 6.0).abs() < 1e-4);
        let miss = Vec3::new(0.0, 5.0, -5.0);
        assert!(b.intersect_ray(&miss, &inv, 0.0, MAX_SCALAR).is_none());
        let _ = dir;
    }

    #[test]
    fn rgbe_roundtrip_tolerance() {
        let c = Vec3::new(0.7, 0.31, 0.02);
        let out = get_rgbe(&set_rgbe(&c));
        for i in 0..3 {
            assert!((out[i] - c[i]).abs() < 0.01, "channel {} off: {}", i, out[i]);
        }
    }

    #[test]
    fn ortho_basis_is_orthonormal() {
        let n = glm::normalize(&Vec3::new(0.3, -0.5, 0.8));
        let (u, v) = ortho_basis(&n);
        assert!(glm::dot(&u, &n).abs() < 1e-5);
        assert!(glm::dot(&v, &n).abs() < 1e-5);
        assert!(glm::dot(&u, &v).abs() < 1e-5);
        assert!((glm::length(&u) - 1.0).abs() < 1e-4);
    }
}
