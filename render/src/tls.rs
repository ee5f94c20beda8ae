//! Worker-owned scratch replacing the thread-local blocks of the C
//! original: traversal stacks, the sort-mode hit array, the final
//! gather hemisphere buffer and per-thread statistics.

use crate::fg::HemisphereSample;
use crate::math::PI;
use crate::rt::bsp::BspStack;
use crate::rt::scene::RayHitInfo;
use ember_db::buffer::Buffer2;

pub struct RayTls {
    pub bsp_stack: BspStack,
    pub sub_bsp_stack: BspStack,
    pub hit_infos: Vec<RayHitInfo>,
    pub fg_buffer: Option<Buffer2<HemisphereSample>>,
    // per-thread statistics
    pub num_rays: u64,
    pub num_tessellated: u64,
}

impl RayTls {
    pub fn new() -> RayTls {
        RayTls {
            bsp_stack: BspStack::new(),
            sub_bsp_stack: BspStack::new(),
            hit_infos: Vec::new(),
            fg_buffer: None,
            num_rays: 0,
            num_tessellated: 0,
        }
    }

    /// The stratified hemisphere buffer sized `M x N` with
    /// `M = sqrt(rays / pi)` and `N = pi * M`; reallocated only when the
    /// ray count changes.
    pub fn acquire_finalgather_buffer(
        &mut self,
        finalgather_rays: u32,
    ) -> &mut Buffer2<HemisphereSample> {
        let m = ((finalgather_rays as f32 * (1.0 / PI)).sqrt() as usize).max(1);
        let n = ((PI * m as f32) as usize).max(1);
        let needs_alloc = match &self.fg_buffer {
            Some(b) => b.width() != m || b.height() != n,
            None => true,
        };
        if needs_alloc {
            self.fg_buffer = Some(Buffer2::new(m, n, HemisphereSample::default()));
        }
        self.fg_buffer.as_mut().expect("hemisphere buffer")
    }
}

impl Default for RayTls {
    fn default() -> RayTls {
        RayTls::new()
    }
}
