//! Flexpages and the flexpage mapper
//!
//! A flexpage describes a page-aligned, power-of-two sized region plus
//! access rights. It is encoded in a single machine word:
//!
//! ```text
//!  63            12 11    8 7        2   1     0
//! +----------------+-------+----------+-------+-------+
//! |   base page    |   0   | log2size | write | grant |
//! +----------------+-------+----------+-------+-------+
//! ```
//!
//! Mapping a send flexpage into a receive window follows the usual rules:
//! if the send flexpage is larger, the window-sized chunk of it that holds
//! the offset ("hot spot") is mapped; if it is smaller, it lands at the
//! window position selected by the offset.

use alloc::vec::Vec;
use thiserror::Error;

use crate::types::{Address, Mword, SpaceId, PAGE_MASK, PAGE_SHIFT, PAGE_SIZE};
use crate::vm::space::{Pte, Rights, SpaceTable};

const GRANT_BIT: Mword = 1 << 0;
const WRITE_BIT: Mword = 1 << 1;
const SIZE_SHIFT: u32 = 2;
const SIZE_MASK: Mword = 0x3F;

// ============================================================================
// Flexpage
// ============================================================================

/// Flexible page descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Flexpage {
    raw: Mword,
}

impl Flexpage {
    /// The nil flexpage; terminates a flexpage list
    pub const NIL: Self = Self { raw: 0 };

    /// Decode a flexpage word
    pub const fn from_raw(raw: Mword) -> Self {
        Self { raw }
    }

    /// Build a flexpage from its parts
    pub fn new(base: Address, size_log2: u32, rights: Rights, grant: bool) -> Self {
        let mut raw = (base & PAGE_MASK) | (((size_log2 as Mword) & SIZE_MASK) << SIZE_SHIFT);
        if rights.contains(Rights::WRITE) {
            raw |= WRITE_BIT;
        }
        if grant {
            raw |= GRANT_BIT;
        }
        Self { raw }
    }

    pub const fn raw(self) -> Mword {
        self.raw
    }

    pub const fn base(self) -> Address {
        self.raw & PAGE_MASK
    }

    pub const fn size_log2(self) -> u32 {
        ((self.raw >> SIZE_SHIFT) & SIZE_MASK) as u32
    }

    /// Size in bytes; only meaningful for valid flexpages
    pub const fn size(self) -> usize {
        1usize << self.size_log2()
    }

    pub fn rights(self) -> Rights {
        if self.raw & WRITE_BIT != 0 {
            Rights::READ | Rights::WRITE
        } else {
            Rights::READ
        }
    }

    /// Source mappings are moved rather than copied
    pub const fn is_grant(self) -> bool {
        self.raw & GRANT_BIT != 0
    }

    /// Non-nil, at least one page, below the address-space size, and
    /// aligned to its own size
    pub fn is_valid(self) -> bool {
        let size_log2 = self.size_log2();
        self.raw != 0
            && size_log2 >= PAGE_SHIFT
            && size_log2 < usize::BITS
            && self.base() & (self.size() - 1) == 0
    }
}

// ============================================================================
// Flexpage Mapper
// ============================================================================

/// Errors from installing a flexpage grant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MapError {
    /// Send or receive flexpage is malformed
    #[error("invalid flexpage")]
    InvalidFlexpage,
    /// Source or destination space does not exist
    #[error("no such address space")]
    NoSuchSpace,
    /// Mapping database is full
    #[error("out of mapping resources")]
    OutOfResources,
}

/// Page-table primitive that installs flexpage grants
pub trait FlexpageMapper {
    /// Map (or grant) `from` in `from_space` into the receive window `to`
    /// of `to_space`, selecting the hot spot with `offset`
    ///
    /// Returns the rights that were actually transferred; empty if the
    /// source region had nothing mapped.
    fn fpage_map(
        &self,
        from_space: SpaceId,
        from: Flexpage,
        to_space: SpaceId,
        to: Flexpage,
        offset: Address,
    ) -> Result<Rights, MapError>;
}

/// Source base, destination base and length of a flexpage transfer
fn hot_spot(from: Flexpage, to: Flexpage, offset: Address) -> (Address, Address, usize) {
    if from.size_log2() >= to.size_log2() {
        let size = to.size();
        let chunk = offset & (from.size() - 1) & !(size - 1);
        (from.base() + chunk, to.base(), size)
    } else {
        let size = from.size();
        let slot = offset & (to.size() - 1) & !(size - 1);
        (from.base(), to.base() + slot, size)
    }
}

impl FlexpageMapper for SpaceTable {
    fn fpage_map(
        &self,
        from_space: SpaceId,
        from: Flexpage,
        to_space: SpaceId,
        to: Flexpage,
        offset: Address,
    ) -> Result<Rights, MapError> {
        if !from.is_valid() || !to.is_valid() {
            return Err(MapError::InvalidFlexpage);
        }

        let (src_base, dst_base, size) = hot_spot(from, to, offset);
        let mut inner = self.inner.lock();

        let sources: Vec<(Address, Pte)> = inner
            .spaces
            .get(&from_space)
            .ok_or(MapError::NoSuchSpace)?
            .pages
            .range(src_base..=src_base + (size - PAGE_SIZE))
            .map(|(page, pte)| (*page, *pte))
            .collect();

        if !inner.spaces.contains_key(&to_space) {
            return Err(MapError::NoSuchSpace);
        }

        let mut transferred = Rights::empty();
        for (page, pte) in sources {
            let rights = pte.rights & from.rights();
            let dst_page = dst_base + (page - src_base);

            let dst = inner.spaces.get_mut(&to_space).ok_or(MapError::NoSuchSpace)?;
            if !dst.pages.contains_key(&dst_page) && dst.pages.len() >= self.mapping_limit {
                return Err(MapError::OutOfResources);
            }
            dst.insert(dst_page, Pte { frame: pte.frame, rights });
            transferred |= rights;

            if from.is_grant() && !(from_space == to_space && dst_page == page) {
                if let Some(src) = inner.spaces.get_mut(&from_space) {
                    src.remove(page);
                }
            }
        }

        Ok(transferred)
    }
}
