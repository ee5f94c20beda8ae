//! 2-D grids of uniform elements with clamped and tiled access.
//!
//! Buffers back the hemisphere sample grid of the final-gather sampler
//! (worker-owned) and can also live behind a tag like any other record.

use crate::error::Result;
use crate::record::{Record, RecordType};
use crate::table::TableItem;
use byteorder::{LittleEndian, WriteBytesExt};
use std::mem;

/// Element operations needed by the rectangular filter.
pub trait BufferItem: Clone {
    fn zero_item(&mut self);
    fn add_item(&mut self, other: &Self);
    fn mul_item(&mut self, scale: f32);
}

pub struct Buffer2<T> {
    width: usize,
    height: usize,
    data: Vec<T>,
}

impl<T: Clone> Buffer2<T> {
    pub fn new(width: usize, height: usize, fill: T) -> Buffer2<T> {
        Buffer2 {
            width,
            height,
            data: vec![fill; width * height],
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    /// Clamped access.
    pub fn get(&self, x: isize, y: isize) -> &T {
        let x = x.max(0).min(self.width as isize - 1) as usize;
        let y = y.max(0).min(self.height as isize - 1) as usize;
        &self.data[x + y * self.width]
    }

    /// Tiled (wrap-around) access.
    pub fn get_tiled(&self, x: isize, y: isize) -> &T {
        let w = self.width as isize;
        let h = self.height as isize;
        let x = if x < 0 {
            w - ((-x) % w) - 1
        } else {
            x % w
        } as usize;
        let y = if y < 0 {
            h - ((-y) % h) - 1
        } else {
            y % h
        } as usize;
        &self.data[x + y * self.width]
    }

    /// In-range set; out-of-range writes are dropped.
    pub fn set(&mut self, x: isize, y: isize, val: T) {
        if x >= 0 && (x as usize) < self.width && y >= 0 && (y as usize) < self.height {
            let w = self.width;
            self.data[x as usize + y as usize * w] = val;
        }
    }
}

impl<T: BufferItem> Buffer2<T> {
    /// Rectangular filtering within `radius`, run as two separable passes
    /// (columns then rows). Taps outside the grid wrap around; results
    /// are written back in place as each pass proceeds.
    pub fn filter(&mut self, radius: i32) {
        if radius <= 0 {
            return;
        }
        let inv = 1.0 / (2 * radius + 1) as f32;
        for j in 0..self.height as isize {
            for i in 0..self.width as isize {
                let mut avg = self.get(i, j).clone();
                avg.zero_item();
                for k in -radius as isize..=radius as isize {
                    avg.add_item(self.get_tiled(i, j + k));
                }
                avg.mul_item(inv);
                self.set(i, j, avg);
            }
        }
        for j in 0..self.height as isize {
            for i in 0..self.width as isize {
                let mut avg = self.get(i, j).clone();
                avg.zero_item();
                for k in -radius as isize..=radius as isize {
                    avg.add_item(self.get_tiled(i + k, j));
                }
                avg.mul_item(inv);
                self.set(i, j, avg);
            }
        }
    }
}

/// A buffer stored behind a tag; `T` must be table-encodable.
pub struct DataBuffer<T: TableItem> {
    type_id: RecordType,
    pub grid: Buffer2<T>,
}

impl<T: TableItem> Record for DataBuffer<T> {
    fn type_id(&self) -> RecordType {
        self.type_id
    }

    fn size_hint(&self) -> usize {
        self.grid.data.len() * T::item_size() + mem::size_of::<Self>()
    }

    fn encode(&self, w: &mut Vec<u8>) -> Result<()> {
        w.write_u32::<LittleEndian>(self.grid.width as u32).unwrap();
        w.write_u32::<LittleEndian>(self.grid.height as u32).unwrap();
        for item in &self.grid.data {
            item.encode_item(w);
        }
        Ok(())
    }
}

impl<T: TableItem> DataBuffer<T> {
    pub fn new(type_id: RecordType, width: usize, height: usize, fill: T) -> DataBuffer<T> {
        DataBuffer {
            type_id,
            grid: Buffer2::new(width, height, fill),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    impl BufferItem for f32 {
        fn zero_item(&mut self) {
            *self = 0.0;
        }

        fn add_item(&mut self, other: &f32) {
            *self += *other;
        }

        fn mul_item(&mut self, scale: f32) {
            *self *= scale;
        }
    }

    #[test]
    fn clamped_and_tiled_access() {
        let mut b = Buffer2::new(4, 3, 0.0f32);
        b.set(0, 0, 1.0);
        b.set(3, 2, 2.0);
        assert_eq!(*b.get(-5, -5), 1.0);
        assert_eq!(*b.get(100, 100), 2.0);
        assert_eq!(*b.get_tiled(4, 3), 1.0);
        assert_eq!(*b.get_tiled(-1, -1), 2.0);
    }

    #[test]
    fn filter_preserves_constant_field() {
        let mut b = Buffer2::new(8, 8, 3.0f32);
        b.filter(2);
        for j in 0..8 {
            for i in 0..8 {
                assert!((b.get(i, j) - 3.0).abs() < 1e-5);
            }
        }
    }
}
