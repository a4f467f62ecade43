//! Per-segment statistics snapshots.

use core::fmt;

use crate::MAX_ORDER;

/// A point-in-time view of one segment.
///
/// `nr_free_pages` counts pages in the free lists and in the CPU pools;
/// at any quiescent moment it equals
/// `sum(pow(2, k) * free_blocks[k]) + pool_pages`.
#[derive(Debug, Clone)]
pub struct SegStat {
    pub name: &'static str,
    /// Pages managed by the segment.
    pub nr_pages: usize,
    /// Free pages, pools included.
    pub nr_free_pages: usize,
    /// Number of free blocks per order.
    pub free_blocks: [usize; MAX_ORDER],
    /// Pages currently sitting in CPU pools.
    pub pool_pages: usize,
    /// Cumulative pool refills from the buddy system.
    pub pool_fills: usize,
    /// Cumulative pool drains back to the buddy system.
    pub pool_drains: usize,
}

impl fmt::Display for SegStat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "segment {}:", self.name)?;
        writeln!(f, "\tpages: {:#x}", self.nr_pages)?;
        writeln!(f, "\tfree pages: {:#x}", self.nr_free_pages)?;
        writeln!(
            f,
            "\tpool pages: {:#x} (fills: {}, drains: {})",
            self.pool_pages, self.pool_fills, self.pool_drains
        )?;
        for (order, nr) in self.free_blocks.iter().enumerate() {
            if *nr != 0 {
                writeln!(f, "\torder {:2}: {} blocks", order, nr)?;
            }
        }
        Ok(())
    }
}
