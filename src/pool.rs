//! Per-CPU pools of single pages.
//!
//! Each segment keeps one pool per CPU. A pool is a small LIFO stack of
//! order-0 pages that isolates the common single-page path from the
//! segment lock; it is refilled from, and drained to, the buddy system in
//! bulk transfers of half its capacity.
//!
//! The pool lock is taken even though only the owning CPU touches its
//! pool, to serialize against interrupt handlers allocating on the same
//! CPU. Whenever both locks are needed, the pool lock is taken first and
//! the segment lock second; `fill` and `drain` are the only two places
//! where that happens.

use intrusive_collections::{LinkedList, UnsafeRef};
use spin::{Mutex, MutexGuard};

use crate::buddy::Seg;
use crate::page::{Page, PageAdapter};

pub(crate) struct CpuPool {
    size: usize,
    transfer_size: usize,
    inner: Mutex<PoolInner>,
}

pub(crate) struct PoolInner {
    nr_pages: usize,
    pages: LinkedList<PageAdapter>,
    nr_fills: usize,
    nr_drains: usize,
}

impl PoolInner {
    pub(crate) fn nr_pages(&self) -> usize {
        self.nr_pages
    }

    pub(crate) fn pop(&mut self) -> UnsafeRef<Page> {
        debug_assert!(self.nr_pages != 0);
        self.nr_pages -= 1;
        self.pages.pop_front().expect("cpu pool underflow")
    }

    pub(crate) fn push(&mut self, page: UnsafeRef<Page>) {
        self.nr_pages += 1;
        self.pages.push_front(page);
    }
}

impl CpuPool {
    pub(crate) fn new() -> CpuPool {
        CpuPool {
            size: 0,
            transfer_size: 0,
            inner: Mutex::new(PoolInner {
                nr_pages: 0,
                pages: LinkedList::new(PageAdapter::new()),
                nr_fills: 0,
                nr_drains: 0,
            }),
        }
    }

    pub(crate) fn init(&mut self, size: usize) {
        self.size = size;
        self.transfer_size = (size + 1) / 2;
    }

    pub(crate) fn size(&self) -> usize {
        self.size
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, PoolInner> {
        self.inner.lock()
    }

    /// Move up to `transfer_size` order-0 pages from the buddy system into
    /// the pool. Only called on an empty pool. Returns the number of pages
    /// actually moved; a partial fill is not an error.
    pub(crate) fn fill(&self, inner: &mut PoolInner, seg: &Seg) -> usize {
        debug_assert_eq!(inner.nr_pages, 0);

        let mut heap = seg.lock_heap();
        inner.nr_fills += 1;

        let mut moved = 0;
        while moved < self.transfer_size {
            let page = match seg.alloc_from_buddy(&mut heap, 0) {
                Some(page) => page,
                None => break,
            };
            inner.push(unsafe { UnsafeRef::from_raw(page) });
            moved += 1;
        }

        moved
    }

    /// Move `transfer_size` pages back to the buddy system. Only called on
    /// a full pool.
    pub(crate) fn drain(&self, inner: &mut PoolInner, seg: &Seg) {
        debug_assert_eq!(inner.nr_pages, self.size);

        let mut heap = seg.lock_heap();
        inner.nr_drains += 1;

        for _ in 0..self.transfer_size {
            let page = inner.pop();
            seg.free_to_buddy(&mut heap, &page, 0);
        }
    }

    pub(crate) fn stat(&self) -> (usize, usize, usize) {
        let inner = self.inner.lock();
        (inner.nr_pages, inner.nr_fills, inner.nr_drains)
    }
}
