use core::fmt;
use core::ops::{Deref, DerefMut};

/// A physical address.
#[derive(Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct PAddr(usize);

impl PAddr {
    pub const fn new(addr: usize) -> Self {
        PAddr(addr)
    }

    pub const fn val(self) -> usize {
        self.0
    }

    pub fn in_page_offset(self) -> usize {
        self.0 & crate::PAGE_MASK
    }

    pub fn is_page_aligned(self) -> bool {
        self.in_page_offset() == 0
    }
}

impl Deref for PAddr {
    type Target = usize;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for PAddr {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl fmt::Debug for PAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PAddr({:#x})", self.0)
    }
}

/// A linear (virtually mapped) address.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(transparent)]
pub struct LAddr(*mut u8);

impl LAddr {
    pub const fn new(ptr: *mut u8) -> Self {
        LAddr(ptr)
    }

    pub fn val(self) -> usize {
        self.0 as usize
    }

    pub fn in_page_offset(self) -> usize {
        self.val() & crate::PAGE_MASK
    }
}

impl Deref for LAddr {
    type Target = *mut u8;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for LAddr {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl From<usize> for LAddr {
    fn from(val: usize) -> Self {
        LAddr(val as *mut u8)
    }
}
