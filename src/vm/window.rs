//! Temporary VM Windows
//!
//! A window is a per-context kernel address range that can be pointed at
//! the pages of another address space, so the kernel can touch a partner's
//! message buffer with ordinary loads and stores. Each context owns two:
//! one for the partner's message buffer and one for string destinations.
//!
//! Pointing a window at a new target does not populate anything. Page
//! slots are filled lazily by the page-fault resolver, which copies the
//! partner's page-table entry into the slot. An access to an empty slot
//! therefore faults, exactly like a hardware window would.
//!
//! ## Mapping Cache
//!
//! Windows are invalidated before every context switch, but their slots are
//! kept together with the generation of the target space at the time of
//! mapping. Re-mapping the same range while the generation is unchanged
//! revives the old slots instead of faulting every page in again; any
//! revocation in the target space bumps the generation and forces a fresh
//! mapping.

use heapless::FnvIndexMap;

use crate::config::{window_address, WINDOW_SLOTS, WINDOW_SPAN};
use crate::types::{page_offset, trunc_page, Access, Address, Mword, SpaceId, PAGE_SHIFT, PAGE_SIZE, WORD_SIZE};
use crate::vm::copyio::{required_rights, Fault, FaultKind};
use crate::vm::space::{AddressSpaces, Pte};

/// Which of a context's windows
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowId {
    /// Partner's message buffer
    Message,
    /// Destination of the current indirect string
    String,
}

impl WindowId {
    pub const ALL: [WindowId; 2] = [WindowId::Message, WindowId::String];

    pub const fn index(self) -> usize {
        match self {
            WindowId::Message => 0,
            WindowId::String => 1,
        }
    }

    /// First kernel address of this window
    pub const fn base(self) -> Address {
        window_address(self.index())
    }
}

/// How a `map` request was satisfied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapOutcome {
    /// Window already pointed at the range and was live
    Reused,
    /// Window pointed at the range but had been invalidated; slots kept
    Revived,
    /// Window was repointed and its slots dropped
    Fresh,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Target {
    space: SpaceId,
    /// Partner address shown at the first byte of the window
    base: Address,
    /// Space generation when the target was set
    generation: u64,
}

// ============================================================================
// Window
// ============================================================================

/// A single VM window
#[derive(Debug)]
pub struct Window {
    target: Option<Target>,
    live: bool,
    slots: FnvIndexMap<usize, Pte, WINDOW_SLOTS>,
}

impl Window {
    pub const fn new() -> Self {
        Self {
            target: None,
            live: false,
            slots: FnvIndexMap::new(),
        }
    }

    fn covers(&self, space: SpaceId, addr: Address, len: usize) -> bool {
        match self.target {
            Some(t) => {
                t.space == space
                    && addr >= t.base
                    && addr
                        .checked_add(len)
                        .is_some_and(|end| end <= t.base + WINDOW_SPAN)
            }
            None => false,
        }
    }

    pub fn is_live(&self) -> bool {
        self.live
    }

    /// Number of populated page slots
    pub fn populated(&self) -> usize {
        self.slots.len()
    }

    /// Target space and partner address backing kernel offset `offset`
    fn resolve(&self, offset: usize) -> Option<(SpaceId, Address)> {
        let t = self.target?;
        (offset < WINDOW_SPAN).then(|| (t.space, t.base + offset))
    }
}

impl Default for Window {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Window Set
// ============================================================================

/// The windows owned by one execution context
#[derive(Debug)]
pub struct WindowSet {
    windows: [Window; 2],
}

impl WindowSet {
    pub const fn new() -> Self {
        Self {
            windows: [Window::new(), Window::new()],
        }
    }

    pub fn window(&self, id: WindowId) -> &Window {
        &self.windows[id.index()]
    }

    /// Point window `id` at `[addr, addr + len)` in `space`
    ///
    /// `generation` is the current generation of `space`. Returns the kernel
    /// address at which `addr` is visible and how the request was satisfied.
    pub fn map(
        &mut self,
        id: WindowId,
        space: SpaceId,
        addr: Address,
        len: usize,
        generation: u64,
    ) -> (Address, MapOutcome) {
        let window = &mut self.windows[id.index()];

        let outcome = match window.target {
            Some(t) if window.covers(space, addr, len) && t.generation == generation => {
                if window.live {
                    MapOutcome::Reused
                } else {
                    window.live = true;
                    MapOutcome::Revived
                }
            }
            _ => {
                window.target = Some(Target {
                    space,
                    base: trunc_page(addr),
                    generation,
                });
                window.slots.clear();
                window.live = true;
                MapOutcome::Fresh
            }
        };

        let base = window.target.map_or(addr, |t| t.base);
        (id.base() + (addr - base), outcome)
    }

    /// Tear down all windows before the context gives up the processor
    pub fn invalidate_all(&mut self) {
        for window in &mut self.windows {
            window.live = false;
        }
    }

    /// Find the window containing kernel address `kaddr`
    ///
    /// Returns the window, its target space and the partner address.
    pub fn translate(&self, kaddr: Address) -> Option<(WindowId, SpaceId, Address)> {
        WindowId::ALL.into_iter().find_map(|id| {
            let offset = kaddr.checked_sub(id.base())?;
            let (space, addr) = self.windows[id.index()].resolve(offset)?;
            Some((id, space, addr))
        })
    }

    /// Copy a partner page-table entry into the slot for `partner_addr`
    pub fn install(&mut self, id: WindowId, partner_addr: Address, pte: Pte) -> bool {
        let window = &mut self.windows[id.index()];
        let base = match window.target {
            Some(t) => t.base,
            None => return false,
        };
        let slot = match trunc_page(partner_addr).checked_sub(base) {
            Some(delta) if delta < WINDOW_SPAN => delta >> PAGE_SHIFT,
            _ => return false,
        };
        if window.slots.len() == WINDOW_SLOTS && !window.slots.contains_key(&slot) {
            // Keep the neighbours an access straddling a page boundary needs
            window.slots.retain(|k, _| k.abs_diff(slot) <= 1);
        }
        window.slots.insert(slot, pte).is_ok()
    }

    /// Slot lookup for one access to window memory
    fn slot(&self, kaddr: Address, access: Access) -> Result<(WindowId, Pte), Fault> {
        let unexpected = Fault::new(kaddr, access, FaultKind::Unexpected);

        let id = WindowId::ALL
            .into_iter()
            .find(|id| kaddr.checked_sub(id.base()).is_some_and(|o| o < WINDOW_SPAN))
            .ok_or(unexpected)?;
        let window = &self.windows[id.index()];
        if !window.live || window.target.is_none() {
            return Err(unexpected);
        }

        let slot = (kaddr - id.base()) >> PAGE_SHIFT;
        let pte = window
            .slots
            .get(&slot)
            .copied()
            .ok_or(Fault::new(kaddr, access, FaultKind::NotMapped))?;
        if !pte.rights.contains(required_rights(access)) {
            return Err(Fault::new(kaddr, access, FaultKind::Protection));
        }
        Ok((id, pte))
    }

    fn for_each_page(
        &self,
        kaddr: Address,
        len: usize,
        access: Access,
        mut f: impl FnMut(Pte, usize, core::ops::Range<usize>) -> bool,
    ) -> Result<(), Fault> {
        let mut done = 0;
        while done < len {
            let cur = kaddr + done;
            let chunk = (PAGE_SIZE - page_offset(cur)).min(len - done);
            let (_, pte) = self.slot(cur, access)?;
            if !f(pte, page_offset(cur), done..done + chunk) {
                return Err(Fault::new(cur, access, FaultKind::Unexpected));
            }
            done += chunk;
        }
        Ok(())
    }

    /// Read partner memory through a window
    pub fn read_bytes(
        &self,
        spaces: &dyn AddressSpaces,
        kaddr: Address,
        buf: &mut [u8],
    ) -> Result<(), Fault> {
        self.for_each_page(kaddr, buf.len(), Access::Read, |pte, off, range| {
            spaces.read_frame(pte.frame, off, &mut buf[range])
        })
    }

    /// Write partner memory through a window
    pub fn write_bytes(
        &self,
        spaces: &dyn AddressSpaces,
        kaddr: Address,
        buf: &[u8],
    ) -> Result<(), Fault> {
        self.for_each_page(kaddr, buf.len(), Access::Write, |pte, off, range| {
            spaces.write_frame(pte.frame, off, &buf[range])
        })
    }

    pub fn peek_word(&self, spaces: &dyn AddressSpaces, kaddr: Address) -> Result<Mword, Fault> {
        let mut bytes = [0u8; WORD_SIZE];
        self.read_bytes(spaces, kaddr, &mut bytes)?;
        Ok(Mword::from_ne_bytes(bytes))
    }

    pub fn poke_word(
        &self,
        spaces: &dyn AddressSpaces,
        kaddr: Address,
        value: Mword,
    ) -> Result<(), Fault> {
        self.write_bytes(spaces, kaddr, &value.to_ne_bytes())
    }
}

impl Default for WindowSet {
    fn default() -> Self {
        Self::new()
    }
}
