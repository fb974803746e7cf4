//! Address Spaces - page tables and physical frames
//!
//! The long-IPC code never walks hardware page tables itself. It asks an
//! [`AddressSpaces`] implementation three questions: which frame backs a
//! page, has anything been revoked since, and what bytes live in a frame.
//!
//! [`SpaceTable`] is the in-memory implementation used by the kernel's
//! hosted build and by the tests. Each space keeps a page map and a
//! generation counter that is bumped whenever a mapping is revoked or
//! downgraded, so window caches can tell a still-valid translation from a
//! stale one.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use bitflags::bitflags;
use spin::Mutex;

use crate::config::LongIpcConfig;
use crate::types::{trunc_page, Address, FrameId, SpaceId, PAGE_SIZE};

bitflags! {
    /// Access rights of a mapping or flexpage
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct Rights: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
    }
}

/// Page-table entry as seen by the IPC code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pte {
    pub frame: FrameId,
    pub rights: Rights,
}

/// Page-table and frame access needed by the long-IPC engine
pub trait AddressSpaces {
    /// Translate the page containing `addr`
    fn lookup(&self, space: SpaceId, addr: Address) -> Option<Pte>;

    /// Revocation generation of `space`
    fn generation(&self, space: SpaceId) -> u64;

    /// Read bytes from a frame; `false` if the frame does not exist or the
    /// range leaves the frame
    fn read_frame(&self, frame: FrameId, offset: usize, buf: &mut [u8]) -> bool;

    /// Write bytes into a frame; same failure rules as `read_frame`
    fn write_frame(&self, frame: FrameId, offset: usize, buf: &[u8]) -> bool;
}

// ============================================================================
// Space Map
// ============================================================================

#[derive(Debug, Default)]
pub(crate) struct SpaceMap {
    pub(crate) pages: BTreeMap<Address, Pte>,
    pub(crate) generation: u64,
}

impl SpaceMap {
    /// Insert a mapping; replacing or downgrading bumps the generation
    pub(crate) fn insert(&mut self, page: Address, pte: Pte) {
        if let Some(old) = self.pages.insert(page, pte) {
            if old.frame != pte.frame || !pte.rights.contains(old.rights) {
                self.generation += 1;
            }
        }
    }

    pub(crate) fn remove(&mut self, page: Address) -> Option<Pte> {
        let old = self.pages.remove(&page);
        if old.is_some() {
            self.generation += 1;
        }
        old
    }
}

/// Errors from direct space manipulation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpaceError {
    /// No such address space
    NoSuchSpace,
    /// Mapping limit of the space reached
    OutOfResources,
}

pub(crate) struct Inner {
    pub(crate) spaces: BTreeMap<SpaceId, SpaceMap>,
    frames: Vec<Box<[u8; PAGE_SIZE]>>,
    next_space: u32,
}

impl Inner {
    fn frame(&self, frame: FrameId) -> Option<&[u8; PAGE_SIZE]> {
        self.frames.get(frame.0 as usize).map(|f| &**f)
    }

    fn frame_mut(&mut self, frame: FrameId) -> Option<&mut [u8; PAGE_SIZE]> {
        self.frames.get_mut(frame.0 as usize).map(|f| &mut **f)
    }
}

// ============================================================================
// Space Table
// ============================================================================

/// In-memory address spaces backed by heap frames
pub struct SpaceTable {
    pub(crate) inner: Mutex<Inner>,
    pub(crate) mapping_limit: usize,
}

impl SpaceTable {
    /// Create an empty table with the default mapping limit
    pub fn new() -> Self {
        Self::with_config(&LongIpcConfig::new())
    }

    pub fn with_config(config: &LongIpcConfig) -> Self {
        Self {
            inner: Mutex::new(Inner {
                spaces: BTreeMap::new(),
                frames: Vec::new(),
                next_space: 1,
            }),
            mapping_limit: config.max_mappings_per_space,
        }
    }

    /// Create a new, empty address space
    pub fn create_space(&self) -> SpaceId {
        let mut inner = self.inner.lock();
        let id = SpaceId(inner.next_space);
        inner.next_space += 1;
        inner.spaces.insert(id, SpaceMap::default());
        id
    }

    /// Allocate a zeroed physical frame
    pub fn alloc_frame(&self) -> FrameId {
        let mut inner = self.inner.lock();
        let id = FrameId(inner.frames.len() as u32);
        inner.frames.push(Box::new([0u8; PAGE_SIZE]));
        id
    }

    /// Map `frame` at the page containing `addr`
    pub fn map(
        &self,
        space: SpaceId,
        addr: Address,
        frame: FrameId,
        rights: Rights,
    ) -> Result<(), SpaceError> {
        let mut inner = self.inner.lock();
        let map = inner.spaces.get_mut(&space).ok_or(SpaceError::NoSuchSpace)?;
        let page = trunc_page(addr);
        if !map.pages.contains_key(&page) && map.pages.len() >= self.mapping_limit {
            return Err(SpaceError::OutOfResources);
        }
        map.insert(page, Pte { frame, rights });
        Ok(())
    }

    /// Allocate fresh frames and map them over `[addr, addr + len)`
    pub fn map_anonymous(
        &self,
        space: SpaceId,
        addr: Address,
        len: usize,
        rights: Rights,
    ) -> Result<(), SpaceError> {
        let mut page = trunc_page(addr);
        let end = addr + len;
        while page < end {
            if self.lookup(space, page).is_none() {
                let frame = self.alloc_frame();
                self.map(space, page, frame, rights)?;
            }
            page += PAGE_SIZE;
        }
        Ok(())
    }

    /// Remove the mapping of the page containing `addr`
    pub fn unmap(&self, space: SpaceId, addr: Address) -> Option<Pte> {
        let mut inner = self.inner.lock();
        inner.spaces.get_mut(&space)?.remove(trunc_page(addr))
    }

    /// Number of mapped pages in `space`
    pub fn mapping_count(&self, space: SpaceId) -> usize {
        self.inner
            .lock()
            .spaces
            .get(&space)
            .map_or(0, |m| m.pages.len())
    }
}

impl Default for SpaceTable {
    fn default() -> Self {
        Self::new()
    }
}

impl AddressSpaces for SpaceTable {
    fn lookup(&self, space: SpaceId, addr: Address) -> Option<Pte> {
        self.inner
            .lock()
            .spaces
            .get(&space)?
            .pages
            .get(&trunc_page(addr))
            .copied()
    }

    fn generation(&self, space: SpaceId) -> u64 {
        self.inner
            .lock()
            .spaces
            .get(&space)
            .map_or(0, |m| m.generation)
    }

    fn read_frame(&self, frame: FrameId, offset: usize, buf: &mut [u8]) -> bool {
        let inner = self.inner.lock();
        match (inner.frame(frame), offset.checked_add(buf.len())) {
            (Some(data), Some(end)) if end <= PAGE_SIZE => {
                buf.copy_from_slice(&data[offset..end]);
                true
            }
            _ => false,
        }
    }

    fn write_frame(&self, frame: FrameId, offset: usize, buf: &[u8]) -> bool {
        let mut inner = self.inner.lock();
        let end = match offset.checked_add(buf.len()) {
            Some(end) if end <= PAGE_SIZE => end,
            _ => return false,
        };
        match inner.frame_mut(frame) {
            Some(data) => {
                data[offset..end].copy_from_slice(buf);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_and_lookup() {
        let table = SpaceTable::new();
        let space = table.create_space();
        let frame = table.alloc_frame();

        table.map(space, 0x4123, frame, Rights::READ).unwrap();
        let pte = table.lookup(space, 0x4fff).unwrap();
        assert_eq!(pte.frame, frame);
        assert_eq!(pte.rights, Rights::READ);
        assert!(table.lookup(space, 0x5000).is_none());
        assert_eq!(table.map(SpaceId(99), 0, frame, Rights::READ), Err(SpaceError::NoSuchSpace));
    }

    #[test]
    fn test_generation_tracks_revocation() {
        let table = SpaceTable::new();
        let space = table.create_space();
        let frame = table.alloc_frame();
        let gen0 = table.generation(space);

        table.map(space, 0x1000, frame, Rights::READ).unwrap();
        assert_eq!(table.generation(space), gen0);

        // Upgrade keeps the generation, downgrade bumps it
        table.map(space, 0x1000, frame, Rights::READ | Rights::WRITE).unwrap();
        assert_eq!(table.generation(space), gen0);
        table.map(space, 0x1000, frame, Rights::READ).unwrap();
        assert_eq!(table.generation(space), gen0 + 1);

        assert!(table.unmap(space, 0x1000).is_some());
        assert_eq!(table.generation(space), gen0 + 2);
        assert!(table.unmap(space, 0x1000).is_none());
        assert_eq!(table.generation(space), gen0 + 2);
    }

    #[test]
    fn test_frame_bounds() {
        let table = SpaceTable::new();
        let frame = table.alloc_frame();
        assert!(table.write_frame(frame, PAGE_SIZE - 2, &[1, 2]));
        assert!(!table.write_frame(frame, PAGE_SIZE - 1, &[1, 2]));

        let mut buf = [0u8; 2];
        assert!(table.read_frame(frame, PAGE_SIZE - 2, &mut buf));
        assert_eq!(buf, [1, 2]);
        assert!(!table.read_frame(FrameId(42), 0, &mut buf));
    }

    #[test]
    fn test_mapping_limit() {
        let config = LongIpcConfig {
            max_mappings_per_space: 1,
            ..LongIpcConfig::new()
        };
        let table = SpaceTable::with_config(&config);
        let space = table.create_space();
        table.map_anonymous(space, 0x1000, 1, Rights::READ).unwrap();
        assert_eq!(
            table.map_anonymous(space, 0x2000, 1, Rights::READ),
            Err(SpaceError::OutOfResources)
        );
        assert_eq!(table.mapping_count(space), 1);
    }
}
