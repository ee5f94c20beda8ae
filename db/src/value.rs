//! Typed parameter values and the type-driven conversion table.

use crate::Tag;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use slotmap::{Key, KeyData};
use std::io::Read;

/// The data types understood by the conversion table and the node system.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum ValueType {
    None,
    Byte,
    Short,
    Int,
    Bool,
    Index,
    Tag,
    Scalar,
    Vec2,
    Vec3,
    Vec4,
    Matrix,
    Str,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    None,
    Byte(u8),
    Short(i16),
    Int(i32),
    Bool(bool),
    Index(u32),
    Tag(Tag),
    Scalar(f32),
    Vec2([f32; 2]),
    Vec3([f32; 3]),
    Vec4([f32; 4]),
    Matrix([[f32; 4]; 4]),
    Str(String),
}

/// Index value meaning "no index", mirrors the null tag.
pub const NULL_INDEX: u32 = !0u32;

impl Value {
    pub fn ty(&self) -> ValueType {
        match self {
            Value::None => ValueType::None,
            Value::Byte(_) => ValueType::Byte,
            Value::Short(_) => ValueType::Short,
            Value::Int(_) => ValueType::Int,
            Value::Bool(_) => ValueType::Bool,
            Value::Index(_) => ValueType::Index,
            Value::Tag(_) => ValueType::Tag,
            Value::Scalar(_) => ValueType::Scalar,
            Value::Vec2(_) => ValueType::Vec2,
            Value::Vec3(_) => ValueType::Vec3,
            Value::Vec4(_) => ValueType::Vec4,
            Value::Matrix(_) => ValueType::Matrix,
            Value::Str(_) => ValueType::Str,
        }
    }

    pub fn default_of(ty: ValueType) -> Value {
        match ty {
            ValueType::None => Value::None,
            ValueType::Byte => Value::Byte(0),
            ValueType::Short => Value::Short(0),
            ValueType::Int => Value::Int(0),
            ValueType::Bool => Value::Bool(false),
            ValueType::Index => Value::Index(NULL_INDEX),
            ValueType::Tag => Value::Tag(Tag::null()),
            ValueType::Scalar => Value::Scalar(0.0),
            ValueType::Vec2 => Value::Vec2([0.0; 2]),
            ValueType::Vec3 => Value::Vec3([0.0; 3]),
            ValueType::Vec4 => Value::Vec4([0.0; 4]),
            ValueType::Matrix => Value::Matrix(identity_matrix()),
            ValueType::Str => Value::Str(String::new()),
        }
    }

    fn as_scalar(&self) -> f32 {
        match self {
            Value::None => 0.0,
            Value::Byte(v) => *v as f32,
            Value::Short(v) => *v as f32,
            Value::Int(v) => *v as f32,
            Value::Bool(v) => {
                if *v {
                    1.0
                } else {
                    0.0
                }
            }
            Value::Index(v) => *v as f32,
            Value::Tag(_) => 0.0,
            Value::Scalar(v) => *v,
            Value::Vec2(v) => v[0],
            Value::Vec3(v) => v[0],
            Value::Vec4(v) => v[0],
            Value::Matrix(m) => m[0][0],
            Value::Str(_) => 0.0,
        }
    }

    fn components(&self) -> [f32; 4] {
        match self {
            Value::Vec2(v) => [v[0], v[1], 0.0, 0.0],
            Value::Vec3(v) => [v[0], v[1], v[2], 0.0],
            Value::Vec4(v) => *v,
            // scalars broadcast into every component
            other => {
                let s = other.as_scalar();
                [s, s, s, s]
            }
        }
    }

    /// Type-driven conversion. Numeric types convert through `f32`,
    /// scalars broadcast into vectors, vectors truncate or zero-extend.
    /// Tags and strings only cast to themselves.
    pub fn cast(&self, dst: ValueType) -> Value {
        if self.ty() == dst {
            return self.clone();
        }
        match dst {
            ValueType::None => Value::None,
            ValueType::Byte => Value::Byte(self.as_scalar() as u8),
            ValueType::Short => Value::Short(self.as_scalar() as i16),
            ValueType::Int => Value::Int(self.as_scalar() as i32),
            ValueType::Bool => Value::Bool(self.as_scalar() != 0.0),
            ValueType::Index => match self {
                Value::Index(v) => Value::Index(*v),
                other => Value::Index(other.as_scalar() as u32),
            },
            ValueType::Tag => match self {
                Value::Tag(t) => Value::Tag(*t),
                _ => Value::Tag(Tag::null()),
            },
            ValueType::Scalar => Value::Scalar(self.as_scalar()),
            ValueType::Vec2 => {
                let c = self.components();
                Value::Vec2([c[0], c[1]])
            }
            ValueType::Vec3 => {
                let c = self.components();
                Value::Vec3([c[0], c[1], c[2]])
            }
            ValueType::Vec4 => Value::Vec4(self.components()),
            ValueType::Matrix => match self {
                Value::Matrix(m) => Value::Matrix(*m),
                _ => Value::Matrix(identity_matrix()),
            },
            ValueType::Str => match self {
                Value::Str(s) => Value::Str(s.clone()),
                _ => Value::Str(String::new()),
            },
        }
    }

    pub fn encode(&self, w: &mut Vec<u8>) {
        match self {
            Value::None => w.push(0),
            Value::Byte(v) => {
                w.push(1);
                w.push(*v);
            }
            Value::Short(v) => {
                w.push(2);
                w.write_i16::<LittleEndian>(*v).unwrap();
            }
            Value::Int(v) => {
                w.push(3);
                w.write_i32::<LittleEndian>(*v).unwrap();
            }
            Value::Bool(v) => {
                w.push(4);
                w.push(*v as u8);
            }
            Value::Index(v) => {
                w.push(5);
                w.write_u32::<LittleEndian>(*v).unwrap();
            }
            Value::Tag(t) => {
                w.push(6);
                w.write_u64::<LittleEndian>(t.data().as_ffi()).unwrap();
            }
            Value::Scalar(v) => {
                w.push(7);
                w.write_f32::<LittleEndian>(*v).unwrap();
            }
            Value::Vec2(v) => {
                w.push(8);
                for c in v.iter() {
                    w.write_f32::<LittleEndian>(*c).unwrap();
                }
            }
            Value::Vec3(v) => {
                w.push(9);
                for c in v.iter() {
                    w.write_f32::<LittleEndian>(*c).unwrap();
                }
            }
            Value::Vec4(v) => {
                w.push(10);
                for c in v.iter() {
                    w.write_f32::<LittleEndian>(*c).unwrap();
                }
            }
            Value::Matrix(m) => {
                w.push(11);
                for row in m.iter() {
                    for c in row.iter() {
                        w.write_f32::<LittleEndian>(*c).unwrap();
                    }
                }
            }
            Value::Str(s) => {
                w.push(12);
                w.write_u32::<LittleEndian>(s.len() as u32).unwrap();
                w.extend_from_slice(s.as_bytes());
            }
        }
    }

    pub fn decode(r: &mut &[u8]) -> Option<Value> {
        let mut kind = [0u8; 1];
        r.read_exact(&mut kind).ok()?;
        Some(match kind[0] {
            0 => Value::None,
            1 => {
                let mut b = [0u8; 1];
                r.read_exact(&mut b).ok()?;
                Value::Byte(b[0])
            }
            2 => Value::Short(r.read_i16::<LittleEndian>().ok()?),
            3 => Value::Int(r.read_i32::<LittleEndian>().ok()?),
            4 => {
                let mut b = [0u8; 1];
                r.read_exact(&mut b).ok()?;
                Value::Bool(b[0] != 0)
            }
            5 => Value::Index(r.read_u32::<LittleEndian>().ok()?),
            6 => {
                let raw = r.read_u64::<LittleEndian>().ok()?;
                Value::Tag(Tag::from(KeyData::from_ffi(raw)))
            }
            7 => Value::Scalar(r.read_f32::<LittleEndian>().ok()?),
            8 => {
                let mut v = [0f32; 2];
                for c in v.iter_mut() {
                    *c = r.read_f32::<LittleEndian>().ok()?;
                }
                Value::Vec2(v)
            }
            9 => {
                let mut v = [0f32; 3];
                for c in v.iter_mut() {
                    *c = r.read_f32::<LittleEndian>().ok()?;
                }
                Value::Vec3(v)
            }
            10 => {
                let mut v = [0f32; 4];
                for c in v.iter_mut() {
                    *c = r.read_f32::<LittleEndian>().ok()?;
                }
                Value::Vec4(v)
            }
            11 => {
                let mut m = [[0f32; 4]; 4];
                for row in m.iter_mut() {
                    for c in row.iter_mut() {
                        *c = r.read_f32::<LittleEndian>().ok()?;
                    }
                }
                Value::Matrix(m)
            }
            12 => {
                let len = r.read_u32::<LittleEndian>().ok()? as usize;
                if r.len() < len {
                    return None;
                }
                let (s, rest) = r.split_at(len);
                let s = String::from_utf8(s.to_vec()).ok()?;
                *r = rest;
                Value::Str(s)
            }
            _ => return None,
        })
    }
}

pub fn identity_matrix() -> [[f32; 4]; 4] {
    let mut m = [[0.0f32; 4]; 4];
    for i in 0..4 {
        m[i][i] = 1.0;
    }
    m
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cast_scalar_broadcast() {
        let v = Value::Scalar(0.5).cast(ValueType::Vec3);
        assert_eq!(v, Value::Vec3([0.5, 0.5, 0.5]));
    }

    #[test]
    fn cast_vector_truncate_extend() {
        let v = Value::Vec4([1.0, 2.0, 3.0, 4.0]).cast(ValueType::Vec3);
        assert_eq!(v, Value::Vec3([1.0, 2.0, 3.0]));
        let v = Value::Vec3([1.0, 2.0, 3.0]).cast(ValueType::Vec4);
        assert_eq!(v, Value::Vec4([1.0, 2.0, 3.0, 0.0]));
    }

    #[test]
    fn cast_numeric() {
        assert_eq!(Value::Int(3).cast(ValueType::Scalar), Value::Scalar(3.0));
        assert_eq!(Value::Scalar(2.7).cast(ValueType::Int), Value::Int(2));
        assert_eq!(Value::Bool(true).cast(ValueType::Scalar), Value::Scalar(1.0));
    }

    #[test]
    fn value_roundtrip() {
        let vals = vec![
            Value::Int(-7),
            Value::Scalar(3.25),
            Value::Vec3([0.1, 0.2, 0.3]),
            Value::Str("Cs".to_owned()),
            Value::Bool(true),
        ];
        let mut bytes = Vec::new();
        for v in &vals {
            v.encode(&mut bytes);
        }
        let mut r = &bytes[..];
        for v in &vals {
            assert_eq!(Value::decode(&mut r).unwrap(), *v);
        }
        assert!(r.is_empty());
    }
}
