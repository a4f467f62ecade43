//! Early (pre-VM) memory bootstrap.
//!
//! [`BootMem`] consumes the raw firmware information and prepares the
//! ground for the page allocator:
//!
//! 1. normalize the firmware memory map ([`map::MemMap`]),
//! 2. carve the available memory into addressability segments,
//! 3. record where the boot artifacts (kernel image, command lines,
//!    modules, ELF section data) live,
//! 4. steal a bump heap from the largest artifact-free gap of upper
//!    memory ([`heap::BootHeap`]),
//! 5. publish the segments ([`BootMem::setup`]) and finally release every
//!    surviving available page ([`BootMem::free_usable`]).

pub mod heap;
pub mod info;
pub mod map;

use core::ops::Range;

use cfg_if::cfg_if;

use crate::addr::PAddr;
use crate::alloc::PageAlloc;
use crate::{Selector, MAX_SEGS, PAGE_SHIFT, PAGE_SIZE};
use heap::{BootHeap, HeapDirection};
use info::{HypBootInfo, RawBootInfo, ShdrKind};
use map::{MapEntry, MemMap};

/// Start of memory interesting to the allocator. Everything below is
/// real-mode firmware territory.
pub const BIOSMEM_BASE: u64 = 0x1_0000;

/// End of conventional (lower) memory.
pub const BIOSMEM_END: u64 = 0xa_0000;

/// Upper bound on recorded boot-data ranges.
const MAX_BOOT_DATA: usize = 128;

/// Physical address limits of the addressability classes.
///
/// A class whose window `[previous_limit, limit)` turns out empty is not
/// loaded. `dma32` is `None` on machines that draw no DMA32 distinction.
#[derive(Debug, Clone, Copy)]
pub struct SegLimits {
    pub dma: u64,
    pub dma32: Option<u64>,
    pub directmap: u64,
    pub highmem: u64,
}

impl Default for SegLimits {
    fn default() -> SegLimits {
        cfg_if! {
            if #[cfg(target_pointer_width = "64")] {
                // Everything is directly mappable; HIGHMEM never loads.
                SegLimits {
                    dma: 0x100_0000,
                    dma32: Some(0x1_0000_0000),
                    directmap: map::trunc_page(u64::MAX),
                    highmem: map::trunc_page(u64::MAX),
                }
            } else {
                SegLimits {
                    dma: 0x100_0000,
                    dma32: None,
                    directmap: 0xc000_0000,
                    highmem: 0x10_0000_0000,
                }
            }
        }
    }
}

/// Physical bounds of one planned segment, and the available sub-range
/// that was handed to the page allocator.
#[derive(Debug, Clone, Copy)]
struct BootSeg {
    start: u64,
    end: u64,
    avail_start: u64,
    avail_end: u64,
}

impl BootSeg {
    const fn empty() -> BootSeg {
        BootSeg {
            start: 0,
            end: 0,
            avail_start: 0,
            avail_end: 0,
        }
    }

    fn size(&self) -> u64 {
        self.end - self.start
    }
}

pub struct BootMem {
    map: MemMap,
    limits: SegLimits,
    segs: [BootSeg; MAX_SEGS],
    boot_data: [(u64, u64); MAX_BOOT_DATA],
    nr_boot_data: usize,
    heap: BootHeap,
}

impl BootMem {
    pub fn new(limits: SegLimits) -> BootMem {
        BootMem {
            map: MemMap::new(),
            limits,
            segs: [BootSeg::empty(); MAX_SEGS],
            boot_data: [(0, 0); MAX_BOOT_DATA],
            nr_boot_data: 0,
            heap: BootHeap::empty(),
        }
    }

    /// Build the map, plan the segments and set up the heap from BIOS
    /// boot information.
    ///
    /// # Panics
    ///
    /// Panics when the map overflows while resolving overlaps, when no
    /// segment holds any available memory, or when no artifact-free gap
    /// remains for the heap.
    pub fn bootstrap(&mut self, info: &RawBootInfo<'_>) {
        self.map = match info.mmap {
            Some(raw) if !raw.is_empty() => MemMap::build(raw),
            _ => MemMap::build_simple(info.mem_lower, info.mem_upper),
        };

        if self.map.adjust().is_err() {
            panic!("bootmem: too many memory map entries");
        }

        self.plan_segments();
        self.record_boot_info(info);

        // Upper memory is counted from the 1 MiB mark. The heap must stay
        // inside the direct physical mapping.
        let mem_end = map::trunc_page(((info.mem_upper as u64) + 1024) << 10);
        let mem_end = mem_end.min(self.limits.directmap);
        self.setup_allocator(mem_end);
    }

    /// Hypervisor variant of [`BootMem::bootstrap`]: a flat available
    /// range, and a bottom-up heap right above the boot data, because
    /// only a small prefix of memory is mapped this early.
    pub fn bootstrap_hyp(&mut self, info: &HypBootInfo) {
        let flat = MapEntry::new(
            0,
            info.nr_pages << PAGE_SHIFT,
            map::EntryType::Available,
        );
        self.map = MemMap::build(&[flat]);

        if self.map.adjust().is_err() {
            panic!("bootmem: too many memory map entries");
        }

        self.plan_segments();
        self.record_boot_data(0, info.boot_data_end);

        let heap_start = map::round_page(info.boot_data_end);
        let heap_end = map::trunc_page(info.nr_pages << PAGE_SHIFT).min(self.limits.directmap);

        if heap_start >= heap_end {
            panic!("bootmem: unable to set up the early memory allocator");
        }

        self.heap = BootHeap::new(heap_start, heap_end, HeapDirection::BottomUp);
    }

    /// Assign the first available sub-range of each class window to its
    /// segment, in ascending class order. Empty classes are skipped.
    fn plan_segments(&mut self) {
        let classes = [
            (Selector::Dma, Some(self.limits.dma)),
            (Selector::Dma32, self.limits.dma32),
            (Selector::DirectMap, Some(self.limits.directmap)),
            (Selector::HighMem, Some(self.limits.highmem)),
        ];

        let mut prev = BIOSMEM_BASE;
        let mut loaded = false;

        for (class, limit) in classes {
            let limit = match limit {
                Some(limit) => limit,
                None => continue,
            };

            if limit > prev {
                if let Some(range) = self.map.find_avail(prev..limit) {
                    self.segs[class as usize] = BootSeg {
                        start: range.start,
                        end: range.end,
                        avail_start: 0,
                        avail_end: 0,
                    };
                    loaded = true;
                }
            }

            prev = limit;
        }

        if !loaded {
            panic!("bootmem: unable to find any memory segment");
        }
    }

    fn record_boot_data(&mut self, start: u64, end: u64) {
        if start >= end {
            return;
        }
        if self.nr_boot_data == MAX_BOOT_DATA {
            panic!("bootmem: too many boot data ranges");
        }
        self.boot_data[self.nr_boot_data] = (start, end);
        self.nr_boot_data += 1;
    }

    fn record_boot_range(&mut self, range: &Range<u64>) {
        self.record_boot_data(range.start, range.end);
    }

    fn record_boot_info(&mut self, info: &RawBootInfo<'_>) {
        self.record_boot_range(&info.kernel);

        if let Some(cmdline) = &info.cmdline {
            self.record_boot_range(cmdline);
        }

        if let Some(mods_table) = &info.mods_table {
            self.record_boot_range(mods_table);
        }

        for module in info.mods {
            self.record_boot_range(&module.image);
            if let Some(cmdline) = &module.cmdline {
                self.record_boot_range(cmdline);
            }
        }

        if let Some(shdr_table) = &info.shdr_table {
            self.record_boot_range(shdr_table);
        }

        for shdr in info.shdrs {
            if matches!(shdr.kind, ShdrKind::SymTab | ShdrKind::StrTab) {
                self.record_boot_data(shdr.addr, shdr.addr + shdr.size);
            }
        }
    }

    /// The first boot-data range starting in `min..max`: its start
    /// address and the end of its containing area.
    fn find_boot_data(&self, min: u64, max: u64) -> Option<(u64, u64)> {
        let mut start = max;
        let mut end = 0;

        for &(data_start, data_end) in &self.boot_data[..self.nr_boot_data] {
            if min <= data_start && data_start < start {
                start = data_start;
                end = data_end;
            }
        }

        if start == max {
            None
        } else {
            Some((start, end))
        }
    }

    /// Find memory for the heap: the largest gap of
    /// `[BIOSMEM_END, mem_end)` containing no boot data.
    fn setup_allocator(&mut self, mem_end: u64) {
        let mut max_heap_start = 0;
        let mut max_heap_end = 0;
        let mut next = BIOSMEM_END;

        loop {
            let heap_start = next;
            let (heap_end, data_end) = match self.find_boot_data(heap_start, mem_end) {
                Some((data_start, data_end)) => (data_start, data_end),
                None => (mem_end, 0),
            };
            next = data_end;

            if heap_end.saturating_sub(heap_start) > max_heap_end - max_heap_start {
                max_heap_start = heap_start;
                max_heap_end = heap_end;
            }

            if next == 0 {
                break;
            }
        }

        let start = map::round_page(max_heap_start);
        let end = map::trunc_page(max_heap_end);

        if start >= end {
            panic!("bootmem: unable to set up the early memory allocator");
        }

        self.heap = BootHeap::new(start, end, HeapDirection::TopDown);
    }

    /// Pre-VM page allocator.
    pub fn bootalloc(&mut self, nr_pages: usize) -> PAddr {
        self.heap.alloc(nr_pages)
    }

    /// Upper bound of memory reachable through the direct physical
    /// mapping.
    pub fn directmap_size(&self) -> PAddr {
        let end = if self.segs[Selector::DirectMap as usize].size() != 0 {
            self.segs[Selector::DirectMap as usize].end
        } else if self.segs[Selector::Dma32 as usize].size() != 0 {
            self.segs[Selector::Dma32 as usize].end
        } else {
            self.segs[Selector::Dma as usize].end
        };
        PAddr::new(end as usize)
    }

    /// Publish every planned segment to the page allocator.
    ///
    /// The available sub-range passed along is the unconsumed part of the
    /// heap, clamped into each segment; segments the heap does not touch
    /// are published fully available.
    pub fn setup(&mut self, palloc: &mut PageAlloc) {
        self.map.show();
        let heap = self.heap.range();
        log::info!("bootmem: heap: {:#x}-{:#x}", heap.start, heap.end);

        let avail = self.heap.unused_range();

        for class_index in 0..MAX_SEGS {
            if self.segs[class_index].size() == 0 {
                continue;
            }
            self.load_segment(class_index, &avail, palloc);
        }
    }

    fn load_segment(&mut self, class_index: usize, avail: &Range<u64>, palloc: &mut PageAlloc) {
        let class = match class_index {
            0 => Selector::Dma,
            1 => Selector::Dma32,
            2 => Selector::DirectMap,
            _ => Selector::HighMem,
        };

        let seg = &mut self.segs[class_index];
        let start = seg.start;
        let mut end = seg.end;
        let max_phys_end = self.limits.highmem;

        if end > max_phys_end {
            if max_phys_end <= start {
                log::warn!(
                    "bootmem: warning: segment {} physically unreachable, not loaded",
                    class.name()
                );
                return;
            }

            log::warn!(
                "bootmem: warning: segment {} truncated to {:#x}",
                class.name(),
                max_phys_end
            );
            end = max_phys_end;
        }

        let mut avail_start = avail.start;
        let mut avail_end = avail.end;

        if avail_start < start || avail_start >= end {
            avail_start = start;
        }

        if avail_end <= start || avail_end > end {
            avail_end = end;
        }

        seg.avail_start = avail_start;
        seg.avail_end = avail_end;

        palloc.load(
            class,
            PAddr::new(start as usize),
            PAddr::new(end as usize),
            PAddr::new(avail_start as usize),
            PAddr::new(avail_end as usize),
        );
    }

    fn reserved(&self, addr: u64) -> bool {
        for &(start, end) in &self.boot_data[..self.nr_boot_data] {
            if (start..end).contains(&addr) {
                return true;
            }
        }

        if self.heap.range().contains(&addr) {
            return true;
        }

        self.segs
            .iter()
            .any(|seg| (seg.avail_start..seg.avail_end).contains(&addr))
    }

    fn skip_reserved(&self, mut start: u64) -> u64 {
        let update = |start: &mut u64, res_start: u64, res_end: u64| {
            if (res_start..res_end).contains(start) {
                *start = res_end;
            }
        };

        for &(data_start, data_end) in &self.boot_data[..self.nr_boot_data] {
            update(&mut start, data_start, data_end);
        }

        let heap = self.heap.range();
        update(&mut start, heap.start, heap.end);

        for seg in self.segs.iter() {
            update(&mut start, seg.avail_start, seg.avail_end);
        }

        start
    }

    fn free_usable_range(&self, start: u64, end: u64, palloc: &PageAlloc) {
        log::info!(
            "bootmem: release to page allocator: {:#x}-{:#x} ({}k)",
            start,
            end,
            (end - start) >> 10
        );

        let mut pa = start;
        while pa < end {
            let page = palloc
                .lookup(PAddr::new(pa as usize))
                .expect("bootmem: released page outside loaded segments");
            palloc.manage(page);
            pa += PAGE_SIZE as u64;
        }
    }

    fn free_usable_entry(&self, mut start: u64, entry_end: u64, palloc: &PageAlloc) {
        loop {
            start = self.skip_reserved(start);

            if start >= entry_end {
                return;
            }

            let mut end = start;
            while end < entry_end && !self.reserved(end) {
                end += PAGE_SIZE as u64;
            }

            self.free_usable_range(start, end, palloc);
            start = end;
        }
    }

    /// Release every available page not occupied by a boot artifact, the
    /// heap, or a published avail range.
    pub fn free_usable(&self, palloc: &PageAlloc) {
        for entry in self.map.entries() {
            if entry.ty != map::EntryType::Available {
                continue;
            }

            let mut start = map::round_page(entry.base);

            if start >= self.limits.highmem {
                break;
            }

            let end = map::trunc_page(entry.base + entry.length);

            if start < BIOSMEM_BASE {
                start = BIOSMEM_BASE;
            }

            if start < end {
                self.free_usable_entry(start, end, palloc);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn heap_range(&self) -> Range<u64> {
        self.heap.range()
    }

    #[cfg(test)]
    pub(crate) fn heap_unused(&self) -> Range<u64> {
        self.heap.unused_range()
    }

    #[cfg(test)]
    pub(crate) fn seg_bounds(&self, class: Selector) -> Option<Range<u64>> {
        let seg = &self.segs[class as usize];
        (seg.size() != 0).then(|| seg.start..seg.end)
    }
}
