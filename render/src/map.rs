//! Balanced point maps: the storage behind the photon map and the
//! irradiance cache.
//!
//! Points accumulate in a data table (one-based, with a dummy zeroth
//! element), then `balance` rewrites the storage into a left-balanced
//! implicit heap by median split along the widest axis of a rolling
//! bounding box, so lookups recurse with `2i` / `2i+1`.

use crate::math::*;
use crate::rtypes;
use ember_db::record::{register_type, TypeDesc};
use ember_db::table::{DataTable, DataTableIter, DataTableIterMut, TableItem};
use ember_db::{Database, DbFlags, Error as DbError, Record, RecordType, Tag};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::mem;

const MAP_POINTS_PER_BLOCK: usize = 100000;

/// A record stored in a map: a position plus the split plane and heap
/// index rewritten during balancing.
pub trait MapPoint: TableItem + Default {
    fn position(&self) -> Vec3;

    fn plane(&self) -> i32;
    fn set_plane(&mut self, plane: i32);

    fn index(&self) -> i32;
    fn set_index(&mut self, index: i32);
}

/// The map header record; the points live in their own data table.
pub struct Map {
    pub points: Tag,
    pub stored_points: i32,
    pub half_stored_points: i32,
    pub max_points: i32,
    pub bbox: BBox,
}

impl Record for Map {
    fn type_id(&self) -> RecordType {
        rtypes::MAP
    }

    fn size_hint(&self) -> usize {
        mem::size_of::<Self>()
    }

    fn encode(&self, w: &mut Vec<u8>) -> ember_db::Result<()> {
        self.points.encode_item(w);
        w.write_i32::<LittleEndian>(self.stored_points).unwrap();
        w.write_i32::<LittleEndian>(self.half_stored_points).unwrap();
        w.write_i32::<LittleEndian>(self.max_points).unwrap();
        for i in 0..3 {
            w.write_f32::<LittleEndian>(self.bbox.min[i]).unwrap();
        }
        for i in 0..3 {
            w.write_f32::<LittleEndian>(self.bbox.max[i]).unwrap();
        }
        Ok(())
    }
}

pub(crate) fn register_map_types() {
    register_type(
        rtypes::MAP,
        TypeDesc::new("map").with_decode(Box::new(|bytes| {
            let mut r = bytes;
            let points = Tag::decode_item(&mut r).ok_or(DbError::Corrupt("map points"))?;
            let stored_points = r
                .read_i32::<LittleEndian>()
                .map_err(|_| DbError::Corrupt("map"))?;
            let half_stored_points = r
                .read_i32::<LittleEndian>()
                .map_err(|_| DbError::Corrupt("map"))?;
            let max_points = r
                .read_i32::<LittleEndian>()
                .map_err(|_| DbError::Corrupt("map"))?;
            let mut bbox = BBox::empty();
            for i in 0..3 {
                bbox.min[i] = r
                    .read_f32::<LittleEndian>()
                    .map_err(|_| DbError::Corrupt("map"))?;
            }
            for i in 0..3 {
                bbox.max[i] = r
                    .read_f32::<LittleEndian>()
                    .map_err(|_| DbError::Corrupt("map"))?;
            }
            Ok(Box::new(Map {
                points,
                stored_points,
                half_stored_points,
                max_points,
                bbox,
            }) as Box<dyn Record>)
        })),
    );
}

/// Creates an empty map over `T` points, with the dummy zeroth element
/// already in place.
pub fn create_map<T: MapPoint>(
    db: &Database,
    table_type: RecordType,
    block_type: RecordType,
    max_points: i32,
) -> Tag {
    let points = DataTable::<T>::create(db, table_type, block_type, MAP_POINTS_PER_BLOCK);
    DataTable::push_back(db, points, T::default());
    db.create(
        Map {
            points,
            stored_points: 0,
            half_stored_points: 0,
            max_points,
            bbox: BBox::empty(),
        },
        DbFlags::FLUSHABLE,
    )
}

pub fn delete_map<T: MapPoint>(db: &Database, tag: Tag) {
    let points = db.read::<Map>(tag).points;
    DataTable::<T>::delete(db, points);
    db.delete(tag);
}

pub fn map_size(db: &Database, tag: Tag) -> i32 {
    db.read::<Map>(tag).stored_points
}

pub fn map_full(db: &Database, tag: Tag) -> bool {
    let m = db.read::<Map>(tag);
    m.stored_points >= m.max_points
}

/// Appends points, bounded by the map capacity; dirts the map.
pub fn map_store_points<T: MapPoint>(db: &Database, tag: Tag, points: &[T]) {
    let (points_tag, room) = {
        let m = db.read::<Map>(tag);
        (m.points, (m.max_points - m.stored_points).max(0) as usize)
    };
    let to_store = points.len().min(room);
    for p in &points[..to_store] {
        {
            let mut m = db.write::<Map>(tag);
            m.stored_points += 1;
            let pos = p.position();
            m.bbox.add_point(&pos);
        }
        DataTable::push_back(db, points_tag, p.clone());
    }
}

/// Walks the stored points in storage order; the callback returns false
/// to stop.
pub fn map_traverse<T: MapPoint>(
    db: &Database,
    tag: Tag,
    mut proc_fn: impl FnMut(&T) -> bool,
) {
    let (points_tag, stored) = {
        let m = db.read::<Map>(tag);
        (m.points, m.stored_points)
    };
    let mut iter = DataTableIter::<T>::begin(db, points_tag);
    for i in 1..=stored as usize {
        let p = iter.get(i);
        if !proc_fn(&p) {
            break;
        }
    }
}

//--------------------------------------------------------------------------------------------------
// balancing

fn median_split<T: MapPoint>(
    iter: &mut DataTableIterMut<T>,
    start: i32,
    end: i32,
    median: i32,
    axis: usize,
) {
    let mut left = start;
    let mut right = end;
    while right > left {
        let v = iter.get(right as usize).position()[axis];
        let mut i = left - 1;
        let mut j = right;
        loop {
            loop {
                i += 1;
                if iter.get(i as usize).position()[axis] >= v {
                    break;
                }
            }
            loop {
                j -= 1;
                if iter.get(j as usize).position()[axis] <= v || j <= left {
                    break;
                }
            }
            if i >= j {
                break;
            }
            iter.swap(i as usize, j as usize);
        }
        iter.swap(i as usize, right as usize);
        if i >= median {
            right = i - 1;
        }
        if i <= median {
            left = i + 1;
        }
    }
}

fn balance_segment<T: MapPoint>(
    iter: &mut DataTableIterMut<T>,
    bbox: &mut BBox,
    index: i32,
    start: i32,
    end: i32,
) {
    // choose the median so the left subtree stays complete
    let mut median = 1;
    while 4 * median <= end - start + 1 {
        median += median;
    }
    if 3 * median <= end - start + 1 {
        median += median;
        median += start - 1;
    } else {
        median = end - median + 1;
    }

    let axis = bbox.max_axis();
    median_split(iter, start, end, median, axis);

    let mut median_point = iter.get(median as usize);
    median_point.set_index(index);
    median_point.set_plane(axis as i32);
    let split_pos = median_point.position()[axis];
    iter.set(median as usize, median_point);

    if median > start {
        if start < median - 1 {
            let tmp = bbox.max[axis];
            bbox.max[axis] = split_pos;
            balance_segment(iter, bbox, 2 * index, start, median - 1);
            bbox.max[axis] = tmp;
        } else {
            let mut p = iter.get(start as usize);
            p.set_index(2 * index);
            iter.set(start as usize, p);
        }
    }
    if median < end {
        if median + 1 < end {
            let tmp = bbox.min[axis];
            bbox.min[axis] = split_pos;
            balance_segment(iter, bbox, 2 * index + 1, median + 1, end);
            bbox.min[axis] = tmp;
        } else {
            let mut p = iter.get(end as usize);
            p.set_index(2 * index + 1);
            iter.set(end as usize, p);
        }
    }
}

/// Balances the accumulated points into the implicit-heap layout in
/// place: a median pass records where each element belongs, then a
/// circular permutation pass reshuffles storage to match.
pub fn map_balance<T: MapPoint>(db: &Database, tag: Tag) {
    let (points_tag, stored) = {
        let m = db.read::<Map>(tag);
        (m.points, m.stored_points)
    };
    if stored > 1 {
        let mut bbox = db.read::<Map>(tag).bbox;
        let mut iter = DataTableIterMut::<T>::begin(db, points_tag);
        balance_segment(&mut iter, &mut bbox, 1, 1, stored);

        // reshuffle into heap order following the recorded target
        // indices, one movement circle at a time
        let mut src = iter.get(1);
        let mut src_id = 1i32;
        let mut dst_id = src.index();
        let mut circle_start = 1i32;
        for _ in 1..=stored {
            let mut prev = iter.get(src_id as usize);
            prev.set_index(-1);
            iter.set(src_id as usize, prev);

            if dst_id == circle_start {
                // the circle closes; move and find a new start
                if src_id != dst_id {
                    iter.set(dst_id as usize, src.clone());
                }
                circle_start += 1;
                while circle_start <= stored {
                    let p = iter.get(circle_start as usize);
                    if p.index() != -1 {
                        src = p;
                        src_id = circle_start;
                        dst_id = src.index();
                        break;
                    }
                    circle_start += 1;
                }
            } else if src_id != dst_id {
                let next = iter.get(dst_id as usize);
                iter.set(dst_id as usize, src.clone());
                src = next;
                src_id = dst_id;
                dst_id = src.index();
            } else {
                circle_start += 1;
                while circle_start <= stored {
                    let p = iter.get(circle_start as usize);
                    if p.index() != -1 {
                        src = p;
                        src_id = circle_start;
                        dst_id = src.index();
                        break;
                    }
                    circle_start += 1;
                }
            }
        }
    }
    let mut m = db.write::<Map>(tag);
    m.half_stored_points = m.stored_points / 2 - 1;
}

//--------------------------------------------------------------------------------------------------
// lookup

/// k-nearest lookup state; `dist2[0]` is the squared search radius and
/// shrinks once the candidate heap fills up.
pub struct MapLookup {
    pub pos: Vec3,
    pub max: usize,
    pub found: usize,
    pub got_heap: bool,
    pub dist2: Vec<f32>,
    pub index: Vec<i32>,
}

impl MapLookup {
    pub fn new(pos: Vec3, max: usize, max_dist: f32) -> MapLookup {
        let mut dist2 = vec![0.0f32; max + 1];
        dist2[0] = max_dist * max_dist;
        MapLookup {
            pos,
            max,
            found: 0,
            got_heap: false,
            dist2,
            index: vec![0i32; max + 1],
        }
    }
}

fn locate_points<T: MapPoint>(
    iter: &mut DataTableIter<T>,
    half_stored: i32,
    np: &mut MapLookup,
    index: i32,
    pred: &mut impl FnMut(&T, f32) -> bool,
) {
    let p = iter.get(index as usize);
    if index < half_stored {
        let plane = p.plane() as usize;
        let dist1 = np.pos[plane] - p.position()[plane];
        if dist1 > 0.0 {
            locate_points(iter, half_stored, np, 2 * index + 1, pred);
            if dist1 * dist1 < np.dist2[0] {
                locate_points(iter, half_stored, np, 2 * index, pred);
            }
        } else {
            locate_points(iter, half_stored, np, 2 * index, pred);
            if dist1 * dist1 < np.dist2[0] {
                locate_points(iter, half_stored, np, 2 * index + 1, pred);
            }
        }
    }

    let d = p.position() - np.pos;
    let dist_2 = glm::dot(&d, &d);
    if dist_2 < np.dist2[0] && pred(&p, dist_2) {
        if np.found < np.max {
            np.found += 1;
            np.dist2[np.found] = dist_2;
            np.index[np.found] = index;
        } else {
            // the heap is full, replace the current farthest
            if !np.got_heap {
                let half_found = np.found / 2;
                for k in (1..=half_found).rev() {
                    let mut parent = k;
                    let phot = np.index[k];
                    let dst2 = np.dist2[k];
                    while parent <= half_found {
                        let mut j = parent + parent;
                        if j < np.found && np.dist2[j] < np.dist2[j + 1] {
                            j += 1;
                        }
                        if dst2 >= np.dist2[j] {
                            break;
                        }
                        np.dist2[parent] = np.dist2[j];
                        np.index[parent] = np.index[j];
                        parent = j;
                    }
                    np.dist2[parent] = dst2;
                    np.index[parent] = phot;
                }
                np.got_heap = true;
            }
            let mut parent = 1;
            let mut j = 2;
            while j <= np.found {
                if j < np.found && np.dist2[j] < np.dist2[j + 1] {
                    j += 1;
                }
                if dist_2 > np.dist2[j] {
                    break;
                }
                np.dist2[parent] = np.dist2[j];
                np.index[parent] = np.index[j];
                parent = j;
                j += j;
            }
            np.index[parent] = index;
            np.dist2[parent] = dist_2;
            // the bound shrinks to the farthest kept candidate
            np.dist2[0] = np.dist2[1];
        }
    }
}

/// k-nearest spatial query with a caller-supplied record predicate.
pub fn map_locate_points<T: MapPoint>(
    db: &Database,
    tag: Tag,
    np: &mut MapLookup,
    index: i32,
    mut pred: impl FnMut(&T, f32) -> bool,
) {
    let (points_tag, stored, half_stored) = {
        let m = db.read::<Map>(tag);
        (m.points, m.stored_points, m.half_stored_points)
    };
    if stored == 0 {
        return;
    }
    let mut iter = DataTableIter::<T>::begin(db, points_tag);
    locate_points(&mut iter, half_stored, np, index, &mut pred);
}

/// Reads a stored point by its heap index.
pub fn map_get<T: MapPoint>(db: &Database, tag: Tag, index: i32) -> T {
    let points_tag = db.read::<Map>(tag).points;
    let mut iter = DataTableIter::<T>::begin(db, points_tag);
    iter.get(index as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_db::table::register_table_type;

    #[derive(Clone, Default)]
    struct TestPoint {
        pos: [f32; 3],
        plane: i32,
        index: i32,
    }

    impl TableItem for TestPoint {
        fn encode_item(&self, w: &mut Vec<u8>) {
            for c in self.pos.iter() {
                w.write_f32::<LittleEndian>(*c).unwrap();
            }
            w.write_i32::<LittleEndian>(self.plane).unwrap();
            w.write_i32::<LittleEndian>(self.index).unwrap();
        }

        fn decode_item(r: &mut &[u8]) -> Option<TestPoint> {
            let mut pos = [0f32; 3];
            for c in pos.iter_mut() {
                *c = r.read_f32::<LittleEndian>().ok()?;
            }
            Some(TestPoint {
                pos,
                plane: r.read_i32::<LittleEndian>().ok()?,
                index: r.read_i32::<LittleEndian>().ok()?,
            })
        }
    }

    impl MapPoint for TestPoint {
        fn position(&self) -> Vec3 {
            Vec3::new(self.pos[0], self.pos[1], self.pos[2])
        }

        fn plane(&self) -> i32 {
            self.plane
        }

        fn set_plane(&mut self, plane: i32) {
            self.plane = plane;
        }

        fn index(&self) -> i32 {
            self.index
        }

        fn set_index(&mut self, index: i32) {
            self.index = index;
        }
    }

    const T_TABLE: RecordType = RecordType(RecordType::USER_BASE + 960);
    const T_BLOCK: RecordType = RecordType(RecordType::USER_BASE + 961);

    fn setup() -> Database {
        crate::rtypes::register_render_types();
        register_table_type::<TestPoint>(T_TABLE, T_BLOCK, "test_map_points");
        Database::open_in_temp(0).unwrap()
    }

    fn pseudo_points(n: usize) -> Vec<TestPoint> {
        // deterministic scattered positions
        (0..n)
            .map(|i| {
                let x = ((i * 73 + 13) % 101) as f32 * 0.1;
                let y = ((i * 37 + 7) % 89) as f32 * 0.13;
                let z = ((i * 51 + 3) % 97) as f32 * 0.07;
                TestPoint {
                    pos: [x, y, z],
                    plane: 0,
                    index: 0,
                }
            })
            .collect()
    }

    #[test]
    fn balance_preserves_heap_invariant() {
        let db = setup();
        let map = create_map::<TestPoint>(&db, T_TABLE, T_BLOCK, 10000);
        let pts = pseudo_points(500);
        map_store_points(&db, map, &pts);
        map_balance::<TestPoint>(&db, map);
        let stored = map_size(&db, map);
        assert_eq!(stored, 500);
        let half = db.read::<Map>(map).half_stored_points;
        // every child must lie on the correct side of its parent's plane
        for i in 2..=stored {
            let parent = map_get::<TestPoint>(&db, map, i / 2);
            if i / 2 >= half {
                continue;
            }
            let child = map_get::<TestPoint>(&db, map, i);
            let axis = parent.plane() as usize;
            if i % 2 == 0 {
                assert!(
                    child.position()[axis] <= parent.position()[axis] + 1.0e-4,
                    "left child {} beyond parent plane",
                    i
                );
            } else {
                assert!(
                    child.position()[axis] >= parent.position()[axis] - 1.0e-4,
                    "right child {} before parent plane",
                    i
                );
            }
        }
    }

    #[test]
    fn knn_finds_own_position() {
        let db = setup();
        let map = create_map::<TestPoint>(&db, T_TABLE, T_BLOCK, 10000);
        let pts = pseudo_points(200);
        map_store_points(&db, map, &pts);
        map_balance::<TestPoint>(&db, map);
        for p in pts.iter().step_by(17) {
            let mut np = MapLookup::new(p.position(), 4, 10.0);
            map_locate_points::<TestPoint>(&db, map, &mut np, 1, |_, _| true);
            assert!(np.found > 0);
            let best = (1..=np.found)
                .map(|i| np.dist2[i])
                .fold(f32::INFINITY, f32::min);
            assert!(best < 1.0e-6, "own position not the nearest neighbour");
        }
    }

    #[test]
    fn store_respects_capacity() {
        let db = setup();
        let map = create_map::<TestPoint>(&db, T_TABLE, T_BLOCK, 50);
        let pts = pseudo_points(100);
        map_store_points(&db, map, &pts);
        assert_eq!(map_size(&db, map), 50);
        assert!(map_full(&db, map));
    }
}
