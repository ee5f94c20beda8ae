//! Binary space partitioning for splitting primitives into optimized
//! kd-trees.
//!
//! Primitives are addressed as indices into a caller-owned array; the
//! builder sorts them into leaf index lists and the caller attaches real
//! leaf data afterwards. Splitting uses the surface-area heuristic over
//! begin/planar/end event lists, with a closed-form fast-sort path for
//! small primitive counts and spatial splits that clip straddling
//! primitives into tight child bounds.

use crate::error::{Error, Result};
use crate::math::*;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use ordered_float::OrderedFloat;
use typed_arena::Arena;

pub const MAX_BSP_DEPTH: i32 = 50;
pub const BSP_STACK_SIZE: usize = 83;
pub const BSP_FASTSORT_SIZE: usize = 32;
pub const CUT_OFF_EMPTY: f32 = 0.8;
pub const TRAVERSE_COST: f32 = 0.7;
pub const INTERSECT_COST: f32 = 0.3;

/// A packed 64-bit tree node: either an interior node carrying the
/// splitter position, or a leaf carrying a primitive-list index. The
/// low two flag bits hold the axis (interior) or the value 3 (leaf);
/// the remaining 30 bits pack the right-child index.
#[derive(Copy, Clone, Debug, Default)]
pub struct BspNode {
    word: u32,
    flags: u32,
}

const LEAF_FLAG: u32 = 3;

impl BspNode {
    pub fn leaf(prim_list: u32) -> BspNode {
        BspNode {
            word: prim_list,
            flags: LEAF_FLAG,
        }
    }

    pub fn interior(axis: usize, splitter: f32) -> BspNode {
        BspNode {
            word: splitter.to_bits(),
            flags: axis as u32,
        }
    }

    pub fn is_leaf(self) -> bool {
        (self.flags & 3) == LEAF_FLAG
    }

    pub fn axis(self) -> usize {
        (self.flags & 3) as usize
    }

    pub fn splitter(self) -> f32 {
        f32::from_bits(self.word)
    }

    pub fn prim_list(self) -> u32 {
        self.word
    }

    pub fn right_child(self) -> u32 {
        self.flags >> 2
    }

    pub fn set_right_child(&mut self, index: u32) {
        debug_assert!(index < (1 << 30), "BSP tree exceeds 2^30 interior nodes");
        self.flags = (self.flags & 3) | (index << 2);
    }

    fn encode(self, w: &mut Vec<u8>) {
        w.write_u32::<LittleEndian>(self.word).unwrap();
        w.write_u32::<LittleEndian>(self.flags).unwrap();
    }

    fn decode(r: &mut &[u8]) -> Option<BspNode> {
        Some(BspNode {
            word: r.read_u32::<LittleEndian>().ok()?,
            flags: r.read_u32::<LittleEndian>().ok()?,
        })
    }
}

/// A leaf's slice into the flattened primitive index array.
#[derive(Copy, Clone, Debug)]
pub struct LeafList {
    pub first: u32,
    pub count: u32,
}

/// The finished tree.
#[derive(Default)]
pub struct BspTree {
    pub nodes: Vec<BspNode>,
    pub leaves: Vec<LeafList>,
    pub leaf_prims: Vec<u32>,
    pub scene_box: BBox,
}

impl BspTree {
    pub fn leaf_slice(&self, prim_list: u32) -> &[u32] {
        let l = self.leaves[prim_list as usize];
        &self.leaf_prims[l.first as usize..(l.first + l.count) as usize]
    }

    pub fn encode(&self, w: &mut Vec<u8>) {
        w.write_u32::<LittleEndian>(self.nodes.len() as u32).unwrap();
        for n in &self.nodes {
            n.encode(w);
        }
        w.write_u32::<LittleEndian>(self.leaves.len() as u32).unwrap();
        for l in &self.leaves {
            w.write_u32::<LittleEndian>(l.first).unwrap();
            w.write_u32::<LittleEndian>(l.count).unwrap();
        }
        w.write_u32::<LittleEndian>(self.leaf_prims.len() as u32).unwrap();
        for p in &self.leaf_prims {
            w.write_u32::<LittleEndian>(*p).unwrap();
        }
        for i in 0..3 {
            w.write_f32::<LittleEndian>(self.scene_box.min[i]).unwrap();
        }
        for i in 0..3 {
            w.write_f32::<LittleEndian>(self.scene_box.max[i]).unwrap();
        }
    }

    pub fn decode(r: &mut &[u8]) -> Option<BspTree> {
        let num_nodes = r.read_u32::<LittleEndian>().ok()? as usize;
        let mut nodes = Vec::with_capacity(num_nodes);
        for _ in 0..num_nodes {
            nodes.push(BspNode::decode(r)?);
        }
        let num_leaves = r.read_u32::<LittleEndian>().ok()? as usize;
        let mut leaves = Vec::with_capacity(num_leaves);
        for _ in 0..num_leaves {
            let first = r.read_u32::<LittleEndian>().ok()?;
            let count = r.read_u32::<LittleEndian>().ok()?;
            leaves.push(LeafList { first, count });
        }
        let num_prims = r.read_u32::<LittleEndian>().ok()? as usize;
        let mut leaf_prims = Vec::with_capacity(num_prims);
        for _ in 0..num_prims {
            leaf_prims.push(r.read_u32::<LittleEndian>().ok()?);
        }
        let mut scene_box = BBox::empty();
        for i in 0..3 {
            scene_box.min[i] = r.read_f32::<LittleEndian>().ok()?;
        }
        for i in 0..3 {
            scene_box.max[i] = r.read_f32::<LittleEndian>().ok()?;
        }
        Some(BspTree {
            nodes,
            leaves,
            leaf_prims,
            scene_box,
        })
    }

    pub fn size_hint(&self) -> usize {
        self.nodes.len() * 8 + self.leaves.len() * 8 + self.leaf_prims.len() * 4 + 64
    }
}

/// Statistics filled while building.
#[derive(Clone, Debug, Default)]
pub struct BspStats {
    pub num_nodes: usize,
    pub num_leaves: usize,
    pub num_empty_leaves: usize,
    pub num_bad_splits: usize,
    pub max_depth: i32,
    pub max_leaf_size: usize,
}

/// Per-kind build interface; replaces the callback table of the C
/// original with a trait.
pub trait BspPrimitives {
    fn num_prims(&self) -> usize;

    fn prim_bound(&self, index: u32) -> BBox;

    /// Relative intersection test cost; procedural leaves price higher
    /// than triangles.
    fn prim_icost(&self, _index: u32) -> f32 {
        1.0
    }

    /// Splits a straddling primitive at `plane`, producing tight child
    /// bounds. The default clips the bounding box.
    fn spatial_split(
        &self,
        _index: u32,
        bbox: &BBox,
        axis: usize,
        plane: f32,
    ) -> (BBox, BBox) {
        let mut left = *bbox;
        let mut right = *bbox;
        left.max[axis] = plane;
        right.min[axis] = plane;
        (left, right)
    }
}

pub struct BspParams<'a> {
    /// Maximum primitives per leaf.
    pub bsp_size: usize,
    /// Maximum tree depth.
    pub bsp_depth: i32,
    /// Progress callback; returning true aborts the build.
    pub progress: Option<&'a dyn Fn(f32) -> bool>,
}

impl<'a> Default for BspParams<'a> {
    fn default() -> BspParams<'a> {
        BspParams {
            bsp_size: 10,
            bsp_depth: 30,
            progress: None,
        }
    }
}

struct Builder<'a, P: BspPrimitives> {
    prims: &'a P,
    params: &'a BspParams<'a>,
    tree: BspTree,
    stats: BspStats,
    total_jobs: f32,
    done_jobs: f32,
}

#[derive(Copy, Clone)]
struct Candidate {
    axis: usize,
    plane: f32,
    cost: f32,
    planar_left: bool,
}

/// Sort event over primitive bound end points.
#[derive(Copy, Clone)]
struct SortEvent {
    pos: f32,
    /// 0 = end, 1 = planar, 2 = begin; the order resolves ties.
    etype: u8,
    icost: f32,
}

/// Builds a kd-tree over the primitives. The caller resolves leaf
/// primitive indices through [BspTree::leaf_slice].
pub fn build_bsp<P: BspPrimitives>(prims: &P, params: &BspParams) -> Result<(BspTree, BspStats)> {
    let n = prims.num_prims();
    let arena: Arena<BBox> = Arena::new();
    let mut scene_box = BBox::empty();
    let mut list: Vec<(u32, &BBox)> = Vec::with_capacity(n);
    for i in 0..n as u32 {
        let b = arena.alloc(prims.prim_bound(i));
        scene_box.union(b);
        list.push((i, b));
    }
    let mut builder = Builder {
        prims,
        params,
        tree: BspTree {
            nodes: Vec::new(),
            leaves: Vec::new(),
            leaf_prims: Vec::new(),
            scene_box,
        },
        stats: BspStats::default(),
        total_jobs: (n.max(1)) as f32,
        done_jobs: 0.0,
    };
    let node_box = scene_box;
    builder.build_rec(&arena, list, node_box, 0)?;
    builder.stats.num_nodes = builder.tree.nodes.len();
    Ok((builder.tree, builder.stats))
}

impl<'a, P: BspPrimitives> Builder<'a, P> {
    fn emit_leaf(&mut self, list: &[(u32, &BBox)], depth: i32) {
        let first = self.tree.leaf_prims.len() as u32;
        for (idx, _) in list {
            self.tree.leaf_prims.push(*idx);
        }
        let leaf = LeafList {
            first,
            count: list.len() as u32,
        };
        self.tree.leaves.push(leaf);
        self.tree
            .nodes
            .push(BspNode::leaf(self.tree.leaves.len() as u32 - 1));
        self.stats.num_leaves += 1;
        if list.is_empty() {
            self.stats.num_empty_leaves += 1;
        }
        self.stats.max_depth = self.stats.max_depth.max(depth);
        self.stats.max_leaf_size = self.stats.max_leaf_size.max(list.len());
        self.done_jobs += list.len() as f32;
    }

    fn check_abort(&self) -> Result<()> {
        if let Some(progress) = self.params.progress {
            if progress((self.done_jobs / self.total_jobs).min(1.0)) {
                return Err(Error::Aborted);
            }
        }
        Ok(())
    }

    fn build_rec<'b>(
        &mut self,
        arena: &'b Arena<BBox>,
        list: Vec<(u32, &'b BBox)>,
        node_box: BBox,
        depth: i32,
    ) -> Result<()> {
        self.check_abort()?;
        if list.len() <= self.params.bsp_size
            || depth >= self.params.bsp_depth.min(MAX_BSP_DEPTH)
        {
            self.emit_leaf(&list, depth);
            return Ok(());
        }

        let unsplit_cost: f32 = list
            .iter()
            .map(|(i, _)| INTERSECT_COST * self.prims.prim_icost(*i))
            .sum();
        let best = if list.len() <= BSP_FASTSORT_SIZE {
            self.best_plane_fast(&list, &node_box)
        } else {
            self.best_plane_sorted(&list, &node_box)
        };
        let best = match best {
            Some(c) if c.cost < unsplit_cost => c,
            _ => {
                self.emit_leaf(&list, depth);
                return Ok(());
            }
        };

        // partition, clipping straddlers into both children
        let mut left_box = node_box;
        left_box.max[best.axis] = best.plane;
        let mut right_box = node_box;
        right_box.min[best.axis] = best.plane;
        let mut left: Vec<(u32, &'b BBox)> = Vec::new();
        let mut right: Vec<(u32, &'b BBox)> = Vec::new();
        for (idx, b) in &list {
            let bmin = b.min[best.axis];
            let bmax = b.max[best.axis];
            if bmin == best.plane && bmax == best.plane {
                if best.planar_left {
                    left.push((*idx, *b));
                } else {
                    right.push((*idx, *b));
                }
            } else if bmax <= best.plane {
                left.push((*idx, *b));
            } else if bmin >= best.plane {
                right.push((*idx, *b));
            } else {
                let (lb, rb) = self
                    .prims
                    .spatial_split(*idx, b, best.axis, best.plane);
                let lb = lb.intersection(&left_box);
                let rb = rb.intersection(&right_box);
                if !lb.is_empty() {
                    left.push((*idx, &*arena.alloc(lb)));
                }
                if !rb.is_empty() {
                    right.push((*idx, &*arena.alloc(rb)));
                }
            }
        }

        if left.len() == list.len() && right.len() == list.len() {
            // the split separated nothing
            self.stats.num_bad_splits += 1;
            self.emit_leaf(&list, depth);
            return Ok(());
        }
        drop(list);

        let node_index = self.tree.nodes.len();
        self.tree
            .nodes
            .push(BspNode::interior(best.axis, best.plane));
        self.build_rec(arena, left, left_box, depth + 1)?;
        let right_index = self.tree.nodes.len() as u32;
        self.tree.nodes[node_index].set_right_child(right_index);
        self.build_rec(arena, right, right_box, depth + 1)?;
        Ok(())
    }

    fn sah_cost(
        &self,
        node_box: &BBox,
        axis: usize,
        plane: f32,
        left_sum: f32,
        right_sum: f32,
        left_count: usize,
        right_count: usize,
    ) -> f32 {
        let inv_area = 1.0 / node_box.surface_area().max(SCALAR_EPS);
        let mut left_box = *node_box;
        left_box.max[axis] = plane;
        let mut right_box = *node_box;
        right_box.min[axis] = plane;
        let pl = left_box.surface_area() * inv_area;
        let pr = right_box.surface_area() * inv_area;
        let mut cost = TRAVERSE_COST + pl * left_sum + pr * right_sum;
        if left_count == 0 || right_count == 0 {
            cost *= CUT_OFF_EMPTY;
        }
        cost
    }

    /// Closed-form candidate enumeration for small primitive counts.
    fn best_plane_fast(&self, list: &[(u32, &BBox)], node_box: &BBox) -> Option<Candidate> {
        let mut best: Option<Candidate> = None;
        for axis in 0..3 {
            for (_, cb) in list {
                for plane in [cb.min[axis], cb.max[axis]].iter().copied() {
                    if plane <= node_box.min[axis] || plane >= node_box.max[axis] {
                        continue;
                    }
                    let mut left_count = 0usize;
                    let mut right_count = 0usize;
                    let mut planar_count = 0usize;
                    let mut left_sum = 0.0f32;
                    let mut right_sum = 0.0f32;
                    let mut planar_sum = 0.0f32;
                    for (idx, b) in list {
                        let icost = INTERSECT_COST * self.prims.prim_icost(*idx);
                        let bmin = b.min[axis];
                        let bmax = b.max[axis];
                        if bmin == plane && bmax == plane {
                            planar_count += 1;
                            planar_sum += icost;
                        } else {
                            if bmin < plane {
                                left_count += 1;
                                left_sum += icost;
                            }
                            if bmax > plane {
                                right_count += 1;
                                right_sum += icost;
                            }
                        }
                    }
                    // place planar primitives on the cheaper side
                    let cost_pl = self.sah_cost(
                        node_box,
                        axis,
                        plane,
                        left_sum + planar_sum,
                        right_sum,
                        left_count + planar_count,
                        right_count,
                    );
                    let cost_pr = self.sah_cost(
                        node_box,
                        axis,
                        plane,
                        left_sum,
                        right_sum + planar_sum,
                        left_count,
                        right_count + planar_count,
                    );
                    let (cost, planar_left) = if cost_pl <= cost_pr {
                        (cost_pl, true)
                    } else {
                        (cost_pr, false)
                    };
                    if best.map_or(true, |b| cost < b.cost) {
                        best = Some(Candidate {
                            axis,
                            plane,
                            cost,
                            planar_left,
                        });
                    }
                }
            }
        }
        best
    }

    /// Event-list sweep, at most two events per primitive per axis.
    fn best_plane_sorted(&self, list: &[(u32, &BBox)], node_box: &BBox) -> Option<Candidate> {
        let total_sum: f32 = list
            .iter()
            .map(|(i, _)| INTERSECT_COST * self.prims.prim_icost(*i))
            .sum();
        let mut best: Option<Candidate> = None;
        let mut events: Vec<SortEvent> = Vec::with_capacity(list.len() * 2);
        for axis in 0..3 {
            events.clear();
            for (idx, b) in list {
                let icost = INTERSECT_COST * self.prims.prim_icost(*idx);
                let bmin = b.min[axis];
                let bmax = b.max[axis];
                if bmin == bmax {
                    events.push(SortEvent {
                        pos: bmin,
                        etype: 1,
                        icost,
                    });
                } else {
                    events.push(SortEvent {
                        pos: bmin,
                        etype: 2,
                        icost,
                    });
                    events.push(SortEvent {
                        pos: bmax,
                        etype: 0,
                        icost,
                    });
                }
            }
            events.sort_by_key(|e| (OrderedFloat(e.pos), e.etype));

            let mut left_sum = 0.0f32;
            let mut left_count = 0usize;
            let mut right_sum = total_sum;
            let mut right_count = list.len();
            let mut i = 0;
            while i < events.len() {
                let pos = events[i].pos;
                let mut end_sum = 0.0;
                let mut end_count = 0usize;
                let mut planar_sum = 0.0;
                let mut planar_count = 0usize;
                let mut begin_sum = 0.0;
                let mut begin_count = 0usize;
                while i < events.len() && events[i].pos == pos {
                    match events[i].etype {
                        0 => {
                            end_sum += events[i].icost;
                            end_count += 1;
                        }
                        1 => {
                            planar_sum += events[i].icost;
                            planar_count += 1;
                        }
                        _ => {
                            begin_sum += events[i].icost;
                            begin_count += 1;
                        }
                    }
                    i += 1;
                }
                right_sum -= end_sum + planar_sum;
                right_count -= end_count + planar_count;
                if pos > node_box.min[axis] && pos < node_box.max[axis] {
                    let cost_pl = self.sah_cost(
                        node_box,
                        axis,
                        pos,
                        left_sum + planar_sum,
                        right_sum,
                        left_count + planar_count,
                        right_count,
                    );
                    let cost_pr = self.sah_cost(
                        node_box,
                        axis,
                        pos,
                        left_sum,
                        right_sum + planar_sum,
                        left_count,
                        right_count + planar_count,
                    );
                    let (cost, planar_left) = if cost_pl <= cost_pr {
                        (cost_pl, true)
                    } else {
                        (cost_pr, false)
                    };
                    if best.map_or(true, |b| cost < b.cost) {
                        best = Some(Candidate {
                            axis,
                            plane: pos,
                            cost,
                            planar_left,
                        });
                    }
                }
                left_sum += begin_sum + planar_sum;
                left_count += begin_count + planar_count;
            }
        }
        best
    }
}

//--------------------------------------------------------------------------------------------------
// traversal

/// One suspended far-child span.
#[derive(Copy, Clone, Debug, Default)]
pub struct BspStackElem {
    pub node: u32,
    pub t_near: f32,
    pub t_far: f32,
}

/// Reusable traversal stack owned by a worker thread.
pub struct BspStack {
    buf: Vec<BspStackElem>,
}

impl BspStack {
    pub fn new() -> BspStack {
        BspStack {
            buf: Vec::with_capacity(BSP_STACK_SIZE + 1),
        }
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

impl Default for BspStack {
    fn default() -> BspStack {
        BspStack::new()
    }
}

/// Descends the tree for the ray `(org, dir)` clipped to
/// `[t_near, t_far]`. At each leaf `intersect(prim_list, t0, t1)` runs;
/// it returns `(early_exit, prune_t)` where `prune_t` is the running
/// nearest-hit bound used to skip suspended far spans. Leaves are not
/// globally t-ordered once spatial splits exist, so traversal continues
/// until the stack drains unless the callback exits early.
pub fn traverse<F>(
    tree: &BspTree,
    org: &Vec3,
    dir: &Vec3,
    inv_dir: &Vec3,
    t_near: f32,
    t_far: f32,
    stack: &mut BspStack,
    mut intersect: F,
) -> bool
where
    F: FnMut(u32, f32, f32) -> (bool, f32),
{
    if tree.nodes.is_empty() {
        return false;
    }
    let (mut t0, mut t1) = match tree.scene_box.intersect_ray(org, inv_dir, t_near, t_far) {
        Some(r) => r,
        None => return false,
    };
    stack.clear();
    let mut cur = 0u32;
    let mut any_hit = false;
    let mut prune_t = t_far;
    loop {
        let mut node = tree.nodes[cur as usize];
        while !node.is_leaf() {
            let axis = node.axis();
            let split = node.splitter();
            let d = (split - org[axis]) * inv_dir[axis];
            let below = org[axis] < split || (org[axis] == split && dir[axis] <= 0.0);
            let (near, far) = if below {
                (cur + 1, node.right_child())
            } else {
                (node.right_child(), cur + 1)
            };
            if d >= t1 || d < 0.0 {
                cur = near;
            } else if d <= t0 {
                cur = far;
            } else {
                stack.buf.push(BspStackElem {
                    node: far,
                    t_near: d,
                    t_far: t1,
                });
                cur = near;
                t1 = d;
            }
            node = tree.nodes[cur as usize];
        }

        let (early_exit, new_prune) = intersect(node.prim_list(), t0, t1);
        if early_exit {
            return true;
        }
        prune_t = prune_t.min(new_prune);
        if prune_t < t_far {
            any_hit = true;
        }
        // pop the next span, skipping those beyond the pruning bound
        loop {
            match stack.buf.pop() {
                Some(e) => {
                    if e.t_near <= prune_t {
                        cur = e.node;
                        t0 = e.t_near;
                        t1 = e.t_far;
                        break;
                    }
                }
                None => return any_hit,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Boxes(Vec<BBox>);

    impl BspPrimitives for Boxes {
        fn num_prims(&self) -> usize {
            self.0.len()
        }

        fn prim_bound(&self, index: u32) -> BBox {
            self.0[index as usize]
        }
    }

    fn grid_boxes(n: usize) -> Boxes {
        let mut v = Vec::new();
        for i in 0..n {
            let x = i as f32;
            v.push(BBox {
                min: Vec3::new(x, 0.0, 0.0),
                max: Vec3::new(x + 0.5, 1.0, 1.0),
            });
        }
        Boxes(v)
    }

    #[test]
    fn node_packing_roundtrip() {
        let mut n = BspNode::interior(2, 1.25);
        n.set_right_child(77);
        assert!(!n.is_leaf());
        assert_eq!(n.axis(), 2);
        assert_eq!(n.splitter(), 1.25);
        assert_eq!(n.right_child(), 77);
        let l = BspNode::leaf(5);
        assert!(l.is_leaf());
        assert_eq!(l.prim_list(), 5);
    }

    /// Every leaf must contain every primitive whose box overlaps the
    /// leaf's region of space.
    #[test]
    fn containment_over_grid() {
        let prims = grid_boxes(100);
        let params = BspParams {
            bsp_size: 4,
            bsp_depth: 30,
            progress: None,
        };
        let (tree, stats) = build_bsp(&prims, &params).unwrap();
        assert!(stats.num_leaves > 1);
        // walk the tree with explicit region boxes
        let mut work = vec![(0u32, tree.scene_box)];
        while let Some((ni, region)) = work.pop() {
            let node = tree.nodes[ni as usize];
            if node.is_leaf() {
                let listed = tree.leaf_slice(node.prim_list());
                for i in 0..prims.num_prims() as u32 {
                    let b = prims.prim_bound(i);
                    let overlaps_interior = (0..3).all(|a| {
                        b.min[a] < region.max[a] && b.max[a] > region.min[a]
                    });
                    if overlaps_interior {
                        assert!(
                            listed.contains(&i),
                            "prim {} missing from overlapping leaf",
                            i
                        );
                    }
                }
            } else {
                let mut lb = region;
                lb.max[node.axis()] = node.splitter();
                let mut rb = region;
                rb.min[node.axis()] = node.splitter();
                work.push((ni + 1, lb));
                work.push((node.right_child(), rb));
            }
        }
    }

    #[test]
    fn traversal_visits_hit_leaf() {
        let prims = grid_boxes(64);
        let params = BspParams::default();
        let (tree, _) = build_bsp(&prims, &params).unwrap();
        let org = Vec3::new(10.25, 0.5, -5.0);
        let dir = Vec3::new(0.0, 0.0, 1.0);
        let inv = crate::state::calc_inv_dir(&dir);
        let mut stack = BspStack::new();
        let mut seen = Vec::new();
        let hit = traverse(
            &tree,
            &org,
            &dir,
            &inv,
            0.0,
            MAX_SCALAR,
            &mut stack,
            |leaf, _t0, _t1| {
                seen.extend_from_slice(tree.leaf_slice(leaf));
                (false, MAX_SCALAR)
            },
        );
        assert!(!hit);
        assert!(seen.contains(&10), "leaf containing prim 10 never visited");
    }

    #[test]
    fn build_abort_via_progress() {
        let prims = grid_boxes(256);
        let aborter = |_p: f32| true;
        let params = BspParams {
            bsp_size: 2,
            bsp_depth: 30,
            progress: Some(&aborter),
        };
        assert!(build_bsp(&prims, &params).is_err());
    }

    #[test]
    fn tree_encode_decode() {
        let prims = grid_boxes(32);
        let (tree, _) = build_bsp(&prims, &BspParams::default()).unwrap();
        let mut bytes = Vec::new();
        tree.encode(&mut bytes);
        let mut r = &bytes[..];
        let out = BspTree::decode(&mut r).unwrap();
        assert_eq!(out.nodes.len(), tree.nodes.len());
        assert_eq!(out.leaf_prims, tree.leaf_prims);
        assert_eq!(out.scene_box, tree.scene_box);
    }
}
