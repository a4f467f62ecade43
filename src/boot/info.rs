//! Boot information handed over by the firmware boot-info parser.
//!
//! All ranges are physical byte ranges. Sizes that the original loader
//! protocol leaves implicit (command line lengths for instance) are
//! resolved by the parser before this crate sees them.

use core::ops::Range;

use super::map::MapEntry;

/// Kind of an ELF section header, as far as the bootstrap cares: symbol
/// and string tables live in memory the kernel must not recycle early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShdrKind {
    SymTab,
    StrTab,
    Other,
}

/// A loaded ELF section header.
#[derive(Debug, Clone)]
pub struct ElfShdr {
    pub kind: ShdrKind,
    pub addr: u64,
    pub size: u64,
}

/// A boot module and its command line.
#[derive(Debug, Clone)]
pub struct BootModule {
    pub image: Range<u64>,
    pub cmdline: Option<Range<u64>>,
}

/// Everything the bootstrap needs from the boot loader on BIOS platforms.
#[derive(Debug, Clone)]
pub struct RawBootInfo<'a> {
    /// The firmware memory map; `None` falls back to a simple map built
    /// from `mem_lower`/`mem_upper`.
    pub mmap: Option<&'a [MapEntry]>,
    /// Lower memory size in KiB.
    pub mem_lower: u32,
    /// Upper memory size in KiB.
    pub mem_upper: u32,
    /// The kernel image.
    pub kernel: Range<u64>,
    /// The kernel command line.
    pub cmdline: Option<Range<u64>>,
    /// The module table.
    pub mods_table: Option<Range<u64>>,
    pub mods: &'a [BootModule],
    /// The ELF section header table.
    pub shdr_table: Option<Range<u64>>,
    pub shdrs: &'a [ElfShdr],
}

impl Default for RawBootInfo<'_> {
    fn default() -> Self {
        RawBootInfo {
            mmap: None,
            mem_lower: 0,
            mem_upper: 0,
            kernel: 0..0,
            cmdline: None,
            mods_table: None,
            mods: &[],
            shdr_table: None,
            shdrs: &[],
        }
    }
}

/// Boot information on hypervisor platforms.
///
/// The hypervisor grants a flat pseudo-physical space; boot data (kernel,
/// initial page tables, console rings) occupy a prefix of it.
#[derive(Debug, Clone, Copy)]
pub struct HypBootInfo {
    /// Pages granted to the domain.
    pub nr_pages: u64,
    /// End of the boot-data prefix.
    pub boot_data_end: u64,
}
