//! The page allocator façade.
//!
//! [`PageAlloc`] ties the per-segment buddy systems together: it receives
//! segment bounds from the bootstrap layer through [`PageAlloc::load`],
//! creates the page descriptor table in [`PageAlloc::setup`], and then
//! serves `alloc`/`free`/`lookup` for the rest of the kernel's lifetime.

use core::mem;
use core::ptr::NonNull;

use crate::addr::{LAddr, PAddr};
use crate::buddy::Seg;
use crate::cpu::CpuOps;
use crate::page::{Page, PageType};
use crate::stat::SegStat;
use crate::{atop, round_page, Selector, MAX_SEGS, PAGE_SHIFT, PAGE_SIZE};

/// Interface to the MMU layer, consumed once during setup.
pub trait Pmap {
    /// Map `size` bytes of physical memory starting at `pa` into the
    /// kernel address space, zero-fill them, and return the virtual base.
    /// `size` is a multiple of [`PAGE_SIZE`].
    fn steal_memory(&mut self, pa: PAddr, size: usize) -> LAddr;

    /// Translate a virtual address inside a stolen range back to the
    /// physical frame backing it.
    fn extract(&self, va: LAddr) -> Option<PAddr>;
}

/// Bootstrap record of a loaded segment.
#[derive(Clone, Copy)]
struct BootSeg {
    start: PAddr,
    end: PAddr,
    avail_start: PAddr,
    avail_end: PAddr,
}

impl BootSeg {
    const fn empty() -> BootSeg {
        BootSeg {
            start: PAddr::new(0),
            end: PAddr::new(0),
            avail_start: PAddr::new(0),
            avail_end: PAddr::new(0),
        }
    }

    fn loaded(&self) -> bool {
        self.end.val() != 0
    }
}

pub struct PageAlloc {
    cpu: CpuOps,
    segs: [Seg; MAX_SEGS],
    classes: [Selector; MAX_SEGS],
    boot_segs: [BootSeg; MAX_SEGS],
    segs_size: usize,
    ready: bool,
}

// All descriptor and free-list mutation happens under the owning segment
// or pool lock; allocated descriptors belong to their caller.
unsafe impl Send for PageAlloc {}
unsafe impl Sync for PageAlloc {}

impl PageAlloc {
    pub fn new(cpu: CpuOps) -> PageAlloc {
        PageAlloc {
            cpu,
            segs: core::array::from_fn(|_| Seg::new()),
            classes: [Selector::Dma; MAX_SEGS],
            boot_segs: [BootSeg::empty(); MAX_SEGS],
            segs_size: 0,
            ready: false,
        }
    }

    /// Record a segment found by the bootstrap layer.
    ///
    /// Segments must arrive in ascending class order; they are stored
    /// densely, so elided classes simply never show up.
    pub fn load(
        &mut self,
        class: Selector,
        start: PAddr,
        end: PAddr,
        avail_start: PAddr,
        avail_end: PAddr,
    ) {
        assert!(self.segs_size < MAX_SEGS);
        assert!(start.is_page_aligned());
        assert!(end.is_page_aligned());
        assert!(avail_start.is_page_aligned());
        assert!(avail_end.is_page_aligned());
        assert!(start < end);
        assert!(start <= avail_start);
        assert!(avail_end <= end);
        if self.segs_size != 0 {
            assert!(self.classes[self.segs_size - 1] < class);
        }

        self.boot_segs[self.segs_size] = BootSeg {
            start,
            end,
            avail_start,
            avail_end,
        };
        self.classes[self.segs_size] = class;
        self.segs_size += 1;
    }

    fn check_boot_segs(&self) {
        if self.segs_size == 0 {
            panic!("pmem: no physical memory loaded");
        }

        for (i, seg) in self.boot_segs.iter().enumerate() {
            if seg.loaded() != (i < self.segs_size) {
                panic!("pmem: invalid boot segment table");
            }
        }
    }

    /// Early bump allocator feeding the descriptor-table steal: takes
    /// pages off the avail range of the most accessible boot segment able
    /// to fit the request.
    fn bootalloc(&mut self, size: usize) -> PAddr {
        let mut i = self.select_seg(Selector::DirectMap);
        loop {
            let seg = &mut self.boot_segs[i];

            if size <= seg.avail_end.val() - seg.avail_start.val() {
                let pa = seg.avail_start;
                seg.avail_start = PAddr::new(pa.val() + round_page(size));
                return pa;
            }

            if i == 0 {
                break;
            }
            i -= 1;
        }

        panic!("pmem: no physical memory available");
    }

    /// Create the page descriptor table and populate the free lists.
    ///
    /// Every loaded segment gets its descriptor subrange, all descriptors
    /// start RESERVED, and the pages of each avail range are released to
    /// the buddy system. The frames backing the table itself are then
    /// found by walking its virtual range through [`Pmap::extract`] and
    /// retagged TABLE.
    pub fn setup(&mut self, pmap: &mut dyn Pmap) {
        self.check_boot_segs();

        let nr_pages: usize = (0..self.segs_size)
            .map(|i| atop(self.boot_segs[i].end.val() - self.boot_segs[i].start.val()))
            .sum();
        let table_size = round_page(nr_pages * mem::size_of::<Page>());
        log::info!(
            "pmem: page table size: {} entries ({}k)",
            nr_pages,
            table_size >> 10
        );

        let table_pa = self.bootalloc(table_size);
        let va = pmap.steal_memory(table_pa, table_size);
        let mut table = va.val() as *mut Page;

        for i in 0..self.segs_size {
            let boot_seg = self.boot_segs[i];
            let seg = &mut self.segs[i];
            let seg_pages = atop(boot_seg.end.val() - boot_seg.start.val());

            let pages = NonNull::new(table).expect("pmem: page table not mapped");
            // Safety: the table is sized for every loaded segment and
            // lives until shutdown.
            unsafe { seg.init(i as u16, boot_seg.start, boot_seg.end, pages) };

            let seg = &self.segs[i];
            let mut heap = seg.lock_heap();
            let mut pa = boot_seg.avail_start.val();
            while pa < boot_seg.avail_end.val() {
                let page = seg.page_of(PAddr::new(pa));
                page.set_page_type(PageType::Free);
                seg.free_to_buddy(&mut heap, page, 0);
                pa += PAGE_SIZE;
            }
            drop(heap);

            table = unsafe { table.add(seg_pages) };
        }

        let mut cur = va.val();
        let table_end = cur + table_size;
        while cur < table_end {
            let pa = pmap
                .extract(LAddr::new(cur as *mut u8))
                .expect("pmem: page table not mapped");
            let page = self
                .lookup(pa)
                .expect("pmem: page table outside loaded segments");
            debug_assert_eq!(page.page_type(), PageType::Reserved);
            page.set_page_type(PageType::Table);
            cur += PAGE_SIZE;
        }

        self.ready = true;
    }

    pub fn ready(&self) -> bool {
        self.ready
    }

    /// Starting segment index for a selector: the highest loaded segment
    /// whose class is at most the requested one, or the lowest loaded
    /// segment when every loaded class is less restrictive (aliasing).
    fn select_seg(&self, selector: Selector) -> usize {
        debug_assert!(self.segs_size != 0);
        (0..self.segs_size)
            .rev()
            .find(|&i| self.classes[i] <= selector)
            .unwrap_or(0)
    }

    /// Allocate a block of `pow(2, order)` pages tagged `ty`.
    ///
    /// Starting at the segment picked by `selector`, more restrictive
    /// segments are tried in turn until one succeeds.
    ///
    /// # Errors
    ///
    /// Returns `None` when every candidate segment is exhausted.
    ///
    /// # Panics
    ///
    /// Exhaustion with `ty == PageType::Pmap` panics: without page tables
    /// the system cannot make progress.
    pub fn alloc(&self, order: usize, selector: Selector, ty: PageType) -> Option<&Page> {
        log::trace!(
            "alloc: order = {:?}, selector = {:?}, ty = {:?}",
            order,
            selector,
            ty
        );

        let mut i = self.select_seg(selector);
        loop {
            if let Some(page) = self.segs[i].alloc(&self.cpu, order, ty) {
                return Some(page);
            }
            if i == 0 {
                break;
            }
            i -= 1;
        }

        if ty == PageType::Pmap {
            panic!("pmem: unable to allocate pmap page");
        }

        None
    }

    /// Release a block of `pow(2, order)` pages headed by `page`.
    pub fn free(&self, page: &Page, order: usize) {
        log::trace!("free: page = {:?}, order = {:?}", page, order);

        let i = page.seg_index();
        debug_assert!(i < self.segs_size);
        self.segs[i].free(&self.cpu, page, order);
    }

    /// The descriptor of the page containing `pa`, if managed.
    pub fn lookup(&self, pa: PAddr) -> Option<&Page> {
        (0..self.segs_size)
            .map(|i| &self.segs[i])
            .find(|seg| seg.contains(pa))
            .map(|seg| seg.page_of(pa))
    }

    /// Hand a RESERVED page over to the allocator.
    pub fn manage(&self, page: &Page) {
        let i = page.seg_index();
        debug_assert!(i < self.segs_size);
        debug_assert_eq!(page.page_type(), PageType::Reserved);

        let seg = &self.segs[i];
        seg.set_range_type(page, 0, PageType::Free);
        let mut heap = seg.lock_heap();
        seg.free_to_buddy(&mut heap, page, 0);
    }

    /// Retag the `pow(2, order)` descriptors of the block headed by `page`.
    pub fn set_type(&self, page: &Page, order: usize, ty: PageType) {
        let i = page.seg_index();
        debug_assert!(i < self.segs_size);
        self.segs[i].set_range_type(page, order, ty);
    }

    pub fn segs_size(&self) -> usize {
        self.segs_size
    }

    pub fn seg_name(&self, seg_index: usize) -> &'static str {
        assert!(seg_index < self.segs_size);
        self.classes[seg_index].name()
    }

    pub fn seg_stat(&self, seg_index: usize) -> SegStat {
        assert!(seg_index < self.segs_size);
        self.segs[seg_index].stat(self.classes[seg_index].name())
    }

    /// Log capacity and free counts of every loaded segment.
    pub fn info_all(&self) {
        for i in 0..self.segs_size {
            let seg = &self.segs[i];
            let pages = seg.nr_pages();
            let free = seg.nr_free_total();
            log::info!(
                "pmem: {}: pages: {} ({}M), free: {} ({}M)",
                self.classes[i].name(),
                pages,
                pages >> (20 - PAGE_SHIFT),
                free,
                free >> (20 - PAGE_SHIFT)
            );
        }
    }

    /// Bytes managed by segments up to DIRECTMAP. HIGHMEM needs mapping
    /// before use and is deliberately left out of this total.
    pub fn mem_size(&self) -> usize {
        (0..self.segs_size)
            .filter(|&i| self.classes[i] <= Selector::DirectMap)
            .map(|i| self.segs[i].end().val() - self.segs[i].start().val())
            .sum()
    }

    /// Free pages in segments up to DIRECTMAP, pools included. HIGHMEM is
    /// deliberately left out, like in [`PageAlloc::mem_size`].
    pub fn mem_free(&self) -> usize {
        (0..self.segs_size)
            .filter(|&i| self.classes[i] <= Selector::DirectMap)
            .map(|i| self.segs[i].nr_free_total())
            .sum()
    }
}
