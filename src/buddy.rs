//! Per-segment binary buddy system.
//!
//! Each loaded segment owns `MAX_ORDER` free-block lists protected by one
//! spinlock, plus its per-CPU pools. Allocation scans the lists upwards
//! from the requested order and splits the first block found; freeing
//! walks the buddy chain upwards, merging as long as the buddy is the
//! free head of a block of the same order.
//!
//! Free-list insertion is at the head and removal for allocation pops the
//! head, so recently freed pages are reused first.

use core::ptr;
use core::ptr::NonNull;

use crossbeam_utils::CachePadded;
use intrusive_collections::{LinkedList, UnsafeRef};
use spin::{Mutex, MutexGuard};

use crate::addr::PAddr;
use crate::cpu::{CpuOps, PinnedCpu};
use crate::page::{Page, PageAdapter, PageType, ORDER_UNLISTED};
use crate::pool::CpuPool;
use crate::stat::SegStat;
use crate::{atop, ptoa, MAX_CPUS, MAX_ORDER};

/// A CPU pool holds one page per this many segment pages.
const CPU_POOL_RATIO: usize = 1024;

/// Upper bound on the size of a CPU pool.
const CPU_POOL_MAX_SIZE: usize = 128;

/// Doubly-linked list of free blocks of one order.
pub(crate) struct FreeList {
    size: usize,
    blocks: LinkedList<PageAdapter>,
}

impl FreeList {
    fn new() -> FreeList {
        FreeList {
            size: 0,
            blocks: LinkedList::new(PageAdapter::new()),
        }
    }

    fn insert(&mut self, page: &Page) {
        debug_assert_eq!(page.order(), ORDER_UNLISTED);
        self.size += 1;
        self.blocks.push_front(unsafe { UnsafeRef::from_raw(page) });
    }

    fn remove(&mut self, page: &Page) {
        debug_assert_ne!(page.order(), ORDER_UNLISTED);
        self.size -= 1;
        // The order field says the page is linked in this very list.
        unsafe { self.blocks.cursor_mut_from_ptr(page).remove() };
    }

    fn pop(&mut self) -> UnsafeRef<Page> {
        self.size -= 1;
        self.blocks.pop_front().expect("free list underflow")
    }

    pub(crate) fn size(&self) -> usize {
        self.size
    }

    #[cfg(test)]
    fn head_addr(&self) -> Option<PAddr> {
        self.blocks.front().get().map(|page| page.phys_addr())
    }
}

/// The lock-protected part of a segment.
pub(crate) struct SegHeap {
    free_lists: [FreeList; MAX_ORDER],
    nr_free_pages: usize,
}

impl SegHeap {
    fn new() -> SegHeap {
        SegHeap {
            free_lists: core::array::from_fn(|_| FreeList::new()),
            nr_free_pages: 0,
        }
    }

    pub(crate) fn nr_free_pages(&self) -> usize {
        self.nr_free_pages
    }

    pub(crate) fn free_lists(&self) -> &[FreeList; MAX_ORDER] {
        &self.free_lists
    }
}

/// A segment of contiguous physical memory.
pub(crate) struct Seg {
    start: PAddr,
    end: PAddr,
    pages: *mut Page,
    nr_pages: usize,
    heap: Mutex<SegHeap>,
    pools: [CachePadded<CpuPool>; MAX_CPUS],
}

impl Seg {
    pub(crate) fn new() -> Seg {
        Seg {
            start: PAddr::new(0),
            end: PAddr::new(0),
            pages: ptr::null_mut(),
            nr_pages: 0,
            heap: Mutex::new(SegHeap::new()),
            pools: core::array::from_fn(|_| CachePadded::new(CpuPool::new())),
        }
    }

    /// Associate the segment with its bounds and descriptor subtable, and
    /// write one RESERVED descriptor per page.
    ///
    /// # Safety
    ///
    /// `pages` must point to writable memory large enough for one [`Page`]
    /// per page of `start..end`, staying valid for the segment's lifetime.
    pub(crate) unsafe fn init(
        &mut self,
        seg_index: u16,
        start: PAddr,
        end: PAddr,
        pages: NonNull<Page>,
    ) {
        debug_assert!(start < end);

        self.start = start;
        self.end = end;
        self.pages = pages.as_ptr();
        self.nr_pages = atop(end.val() - start.val());

        let pool_size = self.compute_pool_size();
        for pool in self.pools.iter_mut() {
            pool.init(pool_size);
        }

        for i in 0..self.nr_pages {
            let pa = PAddr::new(start.val() + ptoa(i));
            self.pages.add(i).write(Page::new(seg_index, pa));
        }
    }

    fn compute_pool_size(&self) -> usize {
        let size = (self.nr_pages + CPU_POOL_RATIO - 1) / CPU_POOL_RATIO;
        size.clamp(1, CPU_POOL_MAX_SIZE)
    }

    pub(crate) fn start(&self) -> PAddr {
        self.start
    }

    pub(crate) fn end(&self) -> PAddr {
        self.end
    }

    pub(crate) fn nr_pages(&self) -> usize {
        self.nr_pages
    }

    pub(crate) fn contains(&self, pa: PAddr) -> bool {
        self.start <= pa && pa < self.end
    }

    pub(crate) fn page_at(&self, index: usize) -> &Page {
        debug_assert!(index < self.nr_pages);
        unsafe { &*self.pages.add(index) }
    }

    /// The descriptor of the page containing `pa`.
    pub(crate) fn page_of(&self, pa: PAddr) -> &Page {
        debug_assert!(self.contains(pa));
        self.page_at(atop(pa.val() - self.start.val()))
    }

    fn page_index(&self, page: &Page) -> usize {
        atop(page.phys_addr().val() - self.start.val())
    }

    pub(crate) fn lock_heap(&self) -> MutexGuard<'_, SegHeap> {
        self.heap.lock()
    }

    /// Pop a block of `order` out of the free lists, splitting a larger
    /// block if needed. Returns `None` when every list from `order` up is
    /// empty.
    pub(crate) fn alloc_from_buddy<'a>(
        &'a self,
        heap: &mut SegHeap,
        order: usize,
    ) -> Option<&'a Page> {
        debug_assert!(order < MAX_ORDER);

        let mut i = (order..MAX_ORDER).find(|&i| heap.free_lists[i].size != 0)?;

        let page = heap.free_lists[i].pop();
        let page: &Page = unsafe { &*UnsafeRef::into_raw(page) };
        page.set_order(ORDER_UNLISTED);

        while i > order {
            i -= 1;
            let buddy = self.page_at(self.page_index(page) + (1 << i));
            heap.free_lists[i].insert(buddy);
            buddy.set_order(i as u16);
        }

        heap.nr_free_pages -= 1 << order;
        Some(page)
    }

    /// Insert a block of `order` at `page` into the free lists, merging
    /// with its buddies as far as possible.
    pub(crate) fn free_to_buddy(&self, heap: &mut SegHeap, page: &Page, order: usize) {
        debug_assert!(self.contains(page.phys_addr()));
        debug_assert_eq!(page.order(), ORDER_UNLISTED);
        debug_assert!(order < MAX_ORDER);

        let nr_pages = 1 << order;
        let mut pa = page.phys_addr().val();
        let mut order = order;
        let mut page = page;

        while order < MAX_ORDER - 1 {
            let buddy_pa = pa ^ ptoa(1 << order);

            if buddy_pa < self.start.val() || buddy_pa >= self.end.val() {
                break;
            }

            let buddy = self.page_of(PAddr::new(buddy_pa));

            if buddy.order() as usize != order {
                break;
            }

            heap.free_lists[order].remove(buddy);
            buddy.set_order(ORDER_UNLISTED);
            order += 1;
            pa &= !(ptoa(1 << order) - 1);
            page = self.page_of(PAddr::new(pa));
        }

        heap.free_lists[order].insert(page);
        page.set_order(order as u16);
        heap.nr_free_pages += nr_pages;
    }

    /// Retag the `pow(2, order)` descriptors of the block headed by `page`.
    pub(crate) fn set_range_type(&self, page: &Page, order: usize, ty: PageType) {
        let base = self.page_index(page);
        debug_assert!(base + (1 << order) <= self.nr_pages);

        for i in 0..(1usize << order) {
            self.page_at(base + i).set_page_type(ty);
        }
    }

    pub(crate) fn alloc(&self, cpu: &CpuOps, order: usize, ty: PageType) -> Option<&Page> {
        debug_assert!(order < MAX_ORDER);

        let page = if order == 0 {
            let pinned = PinnedCpu::new(cpu);
            let pool = &self.pools[pinned.id()];
            let mut inner = pool.lock();

            if inner.nr_pages() == 0 {
                let filled = pool.fill(&mut inner, self);
                if filled == 0 {
                    return None;
                }
            }

            let page = inner.pop();
            unsafe { &*UnsafeRef::into_raw(page) }
        } else {
            let mut heap = self.heap.lock();
            self.alloc_from_buddy(&mut heap, order)?
        };

        debug_assert_eq!(page.page_type(), PageType::Free);
        self.set_range_type(page, order, ty);
        Some(page)
    }

    pub(crate) fn free(&self, cpu: &CpuOps, page: &Page, order: usize) {
        debug_assert_ne!(page.page_type(), PageType::Free);
        debug_assert!(order < MAX_ORDER);

        self.set_range_type(page, order, PageType::Free);

        if order == 0 {
            let pinned = PinnedCpu::new(cpu);
            let pool = &self.pools[pinned.id()];
            let mut inner = pool.lock();

            if inner.nr_pages() == pool.size() {
                pool.drain(&mut inner, self);
            }

            debug_assert!(inner.nr_pages() < pool.size());
            inner.push(unsafe { UnsafeRef::from_raw(page) });
        } else {
            let mut heap = self.heap.lock();
            self.free_to_buddy(&mut heap, page, order);
        }
    }

    /// Free pages currently held, including the CPU pools.
    pub(crate) fn nr_free_total(&self) -> usize {
        let buddy = self.heap.lock().nr_free_pages;
        let pooled: usize = self.pools.iter().map(|pool| pool.stat().0).sum();
        buddy + pooled
    }

    pub(crate) fn stat(&self, name: &'static str) -> SegStat {
        let mut stat = SegStat {
            name,
            nr_pages: self.nr_pages,
            nr_free_pages: 0,
            free_blocks: [0; MAX_ORDER],
            pool_pages: 0,
            pool_fills: 0,
            pool_drains: 0,
        };

        {
            let heap = self.heap.lock();
            stat.nr_free_pages = heap.nr_free_pages();
            for (order, list) in heap.free_lists().iter().enumerate() {
                stat.free_blocks[order] = list.size();
            }
        }

        for pool in self.pools.iter() {
            let (pages, fills, drains) = pool.stat();
            stat.pool_pages += pages;
            stat.pool_fills += fills;
            stat.pool_drains += drains;
        }

        stat.nr_free_pages += stat.pool_pages;
        stat
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ORDERS;
    use std::alloc::Layout;

    fn new_seg(nr_pages: usize) -> Seg {
        let mut seg = Seg::new();
        let layout = Layout::array::<Page>(nr_pages).unwrap();
        let table = unsafe { std::alloc::alloc(layout) } as *mut Page;
        let table = NonNull::new(table).unwrap();

        unsafe { seg.init(0, PAddr::new(0), PAddr::new(ptoa(nr_pages)), table) };
        seg
    }

    // Release every page, the way setup populates a fresh segment.
    fn manage_all(seg: &Seg) {
        let mut heap = seg.lock_heap();
        for i in 0..seg.nr_pages() {
            let page = seg.page_at(i);
            page.set_page_type(PageType::Free);
            seg.free_to_buddy(&mut heap, page, 0);
        }
    }

    fn list_shape(seg: &Seg) -> Vec<(usize, Option<PAddr>)> {
        let heap = seg.lock_heap();
        heap.free_lists
            .iter()
            .map(|list| (list.size(), list.head_addr()))
            .collect()
    }

    #[test]
    fn fresh_segment_collapses_to_top_order() {
        let seg = new_seg(1024);
        manage_all(&seg);

        let heap = seg.lock_heap();
        assert_eq!(heap.nr_free_pages(), 1024);
        for order in ORDERS {
            let expect = if order == MAX_ORDER - 1 { 1 } else { 0 };
            assert_eq!(heap.free_lists()[order].size(), expect);
        }
    }

    #[test]
    fn split_order_3_from_single_block() {
        let seg = new_seg(1024);
        manage_all(&seg);

        let page = {
            let mut heap = seg.lock_heap();
            seg.alloc_from_buddy(&mut heap, 3).unwrap()
        };
        // The single top-order block is split; its lower half goes out.
        assert_eq!(page.phys_addr(), PAddr::new(0));

        {
            let heap = seg.lock_heap();
            assert_eq!(heap.nr_free_pages(), 1024 - 8);
            for order in 3..MAX_ORDER - 1 {
                assert_eq!(heap.free_lists()[order].size(), 1);
                let head = heap.free_lists()[order].head_addr().unwrap();
                assert_eq!(head, PAddr::new(ptoa(1 << order)));
            }
            assert_eq!(heap.free_lists()[MAX_ORDER - 1].size(), 0);
        }

        {
            let mut heap = seg.lock_heap();
            seg.free_to_buddy(&mut heap, page, 3);
        }

        let heap = seg.lock_heap();
        assert_eq!(heap.nr_free_pages(), 1024);
        assert_eq!(heap.free_lists()[MAX_ORDER - 1].size(), 1);
        let head = heap.free_lists()[MAX_ORDER - 1].head_addr().unwrap();
        assert_eq!(head, PAddr::new(0));
        for order in 0..MAX_ORDER - 1 {
            assert_eq!(heap.free_lists()[order].size(), 0);
        }
    }

    #[test]
    fn round_trip_restores_free_lists() {
        let seg = new_seg(8192);
        manage_all(&seg);

        for order in ORDERS {
            let before = list_shape(&seg);
            let nr_before = seg.lock_heap().nr_free_pages();

            let page = {
                let mut heap = seg.lock_heap();
                seg.alloc_from_buddy(&mut heap, order).unwrap()
            };
            {
                let mut heap = seg.lock_heap();
                seg.free_to_buddy(&mut heap, page, order);
            }

            assert_eq!(list_shape(&seg), before, "order {}", order);
            assert_eq!(seg.lock_heap().nr_free_pages(), nr_before);
        }
    }

    #[test]
    fn returned_blocks_are_aligned() {
        let seg = new_seg(8192);
        manage_all(&seg);

        for order in ORDERS {
            let page = {
                let mut heap = seg.lock_heap();
                seg.alloc_from_buddy(&mut heap, order).unwrap()
            };
            assert_eq!(page.phys_addr().val() % ptoa(1 << order), 0);
            let mut heap = seg.lock_heap();
            seg.free_to_buddy(&mut heap, page, order);
        }
    }

    #[test]
    fn reverse_free_merges_back_to_one_block() {
        let seg = new_seg(16);
        manage_all(&seg);

        let pages: Vec<&Page> = (0..16)
            .map(|_| {
                let mut heap = seg.lock_heap();
                seg.alloc_from_buddy(&mut heap, 0).unwrap()
            })
            .collect();

        // Single-page splits of one block come out in address order.
        for (i, page) in pages.iter().enumerate() {
            assert_eq!(page.phys_addr(), PAddr::new(ptoa(i)));
        }

        for page in pages.into_iter().rev() {
            let mut heap = seg.lock_heap();
            seg.free_to_buddy(&mut heap, page, 0);
        }

        let heap = seg.lock_heap();
        assert_eq!(heap.free_lists()[4].size(), 1);
        for order in 0..4 {
            assert_eq!(heap.free_lists()[order].size(), 0);
        }
        assert_eq!(heap.nr_free_pages(), 16);
    }

    #[test]
    fn merge_completeness_after_mixed_allocations() {
        let seg = new_seg(8192);
        manage_all(&seg);
        let fresh = list_shape(&seg);

        let mut held = Vec::new();
        for order in [0, 5, 3, 0, 10, 7, 1, 2, 0, 6] {
            let mut heap = seg.lock_heap();
            held.push((seg.alloc_from_buddy(&mut heap, order).unwrap(), order));
        }

        for (page, order) in held.into_iter().rev() {
            let mut heap = seg.lock_heap();
            seg.free_to_buddy(&mut heap, page, order);
        }

        assert_eq!(list_shape(&seg), fresh);
        assert_eq!(seg.lock_heap().nr_free_pages(), 8192);
    }

    #[test]
    fn buddy_exhaustion_returns_none() {
        let seg = new_seg(16);
        manage_all(&seg);

        let mut heap = seg.lock_heap();
        assert!(seg.alloc_from_buddy(&mut heap, 4).is_some());
        assert!(seg.alloc_from_buddy(&mut heap, 0).is_none());
    }

    #[test]
    fn unlisted_orders_inside_free_blocks() {
        let seg = new_seg(64);
        manage_all(&seg);

        // Only heads of free blocks carry an order.
        let mut listed = 0;
        for i in 0..seg.nr_pages() {
            let page = seg.page_at(i);
            if page.order() != ORDER_UNLISTED {
                listed += 1;
                assert_eq!(page.phys_addr().val() % ptoa(1 << page.order()), 0);
            }
        }
        assert_eq!(listed, 1);
    }
}
