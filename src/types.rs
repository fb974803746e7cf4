//! Common types used across the long-IPC engine
//!
//! This module defines shared machine-level types to avoid circular
//! dependencies between `kern`, `vm` and `ipc`.

/// Virtual address
pub type Address = usize;

/// Machine word as seen by user-level message buffers
pub type Mword = usize;

/// Size of a machine word in bytes
pub const WORD_SIZE: usize = core::mem::size_of::<Mword>();

/// Page shift (4 KiB pages)
pub const PAGE_SHIFT: u32 = 12;

/// Page size in bytes
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// Mask selecting the page-aligned part of an address
pub const PAGE_MASK: Address = !(PAGE_SIZE - 1);

/// Round an address down to its page boundary
#[inline]
pub const fn trunc_page(addr: Address) -> Address {
    addr & PAGE_MASK
}

/// Offset of an address within its page
#[inline]
pub const fn page_offset(addr: Address) -> usize {
    addr & !PAGE_MASK
}

/// Address-space identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SpaceId(pub u32);

/// Physical frame number
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FrameId(pub u32);

/// Kind of memory access that faulted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_helpers() {
        assert_eq!(trunc_page(0x1234), 0x1000);
        assert_eq!(page_offset(0x1234), 0x234);
        assert_eq!(trunc_page(PAGE_SIZE), PAGE_SIZE);
    }
}
