//! Copyin/Copyout - fault-checked access to user memory
//!
//! Every access to a user buffer, whether through the caller's own address
//! space or through a VM window, returns `Result<_, Fault>` instead of
//! trapping. Callers decide from the fault kind whether the fault can be
//! resolved (page in, retry) or whether the copy must be abandoned.
//!
//! The [`checkpoint`] is the last-resort net: a fault that no resolver path
//! is prepared for is turned into a cut message instead of an escalation.

use log::warn;

use crate::ipc::error::IpcError;
use crate::types::{page_offset, Access, Address, Mword, SpaceId, PAGE_SIZE, WORD_SIZE};
use crate::vm::space::{AddressSpaces, Rights};

// ============================================================================
// Faults
// ============================================================================

/// Why an access faulted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// No translation for the page
    NotMapped,
    /// Translation exists but lacks the needed right
    Protection,
    /// Fault outside any range the resolver knows about
    Unexpected,
}

/// A faulting access
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fault {
    /// Faulting address, in the address space the access was made in
    pub addr: Address,
    pub access: Access,
    pub kind: FaultKind,
}

impl Fault {
    pub const fn new(addr: Address, access: Access, kind: FaultKind) -> Self {
        Self { addr, access, kind }
    }

    pub fn is_unexpected(&self) -> bool {
        self.kind == FaultKind::Unexpected
    }
}

/// Rights an access needs
pub(crate) fn required_rights(access: Access) -> Rights {
    match access {
        Access::Read => Rights::READ,
        Access::Write => Rights::WRITE,
    }
}

/// Pass resolvable faults through and abandon the copy on anything else
pub fn checkpoint(fault: Fault) -> Result<Fault, IpcError> {
    if fault.is_unexpected() {
        warn!("unexpected fault at {:#x} during long IPC copy", fault.addr);
        return Err(IpcError::MsgCut);
    }
    Ok(fault)
}

// ============================================================================
// Copyin / Copyout
// ============================================================================

/// Walk `[addr, addr + len)` page by page
fn for_each_chunk(
    spaces: &dyn AddressSpaces,
    space: SpaceId,
    addr: Address,
    len: usize,
    access: Access,
    mut f: impl FnMut(&dyn AddressSpaces, crate::types::FrameId, usize, core::ops::Range<usize>) -> bool,
) -> Result<(), Fault> {
    let mut done = 0;
    while done < len {
        let cur = addr.checked_add(done).ok_or(Fault::new(addr, access, FaultKind::Unexpected))?;
        let offset = page_offset(cur);
        let chunk = (PAGE_SIZE - offset).min(len - done);

        let pte = spaces
            .lookup(space, cur)
            .ok_or(Fault::new(cur, access, FaultKind::NotMapped))?;
        if !pte.rights.contains(required_rights(access)) {
            return Err(Fault::new(cur, access, FaultKind::Protection));
        }
        if !f(spaces, pte.frame, offset, done..done + chunk) {
            return Err(Fault::new(cur, access, FaultKind::Unexpected));
        }
        done += chunk;
    }
    Ok(())
}

/// Copy from user memory of `space` into `buf`
pub fn copyin(
    spaces: &dyn AddressSpaces,
    space: SpaceId,
    addr: Address,
    buf: &mut [u8],
) -> Result<(), Fault> {
    for_each_chunk(spaces, space, addr, buf.len(), Access::Read, |s, frame, off, range| {
        s.read_frame(frame, off, &mut buf[range])
    })
}

/// Copy `buf` into user memory of `space`
pub fn copyout(
    spaces: &dyn AddressSpaces,
    space: SpaceId,
    addr: Address,
    buf: &[u8],
) -> Result<(), Fault> {
    for_each_chunk(spaces, space, addr, buf.len(), Access::Write, |s, frame, off, range| {
        s.write_frame(frame, off, &buf[range])
    })
}

/// Read one machine word from user memory
pub fn copyin_word(spaces: &dyn AddressSpaces, space: SpaceId, addr: Address) -> Result<Mword, Fault> {
    let mut bytes = [0u8; WORD_SIZE];
    copyin(spaces, space, addr, &mut bytes)?;
    Ok(Mword::from_ne_bytes(bytes))
}

/// Write one machine word to user memory
pub fn copyout_word(
    spaces: &dyn AddressSpaces,
    space: SpaceId,
    addr: Address,
    value: Mword,
) -> Result<(), Fault> {
    copyout(spaces, space, addr, &value.to_ne_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::space::SpaceTable;

    #[test]
    fn test_copy_across_pages() {
        let spaces = SpaceTable::new();
        let space = spaces.create_space();
        spaces
            .map_anonymous(space, 0x1000, 2 * PAGE_SIZE, Rights::READ | Rights::WRITE)
            .unwrap();

        let data: [u8; 16] = core::array::from_fn(|i| i as u8);
        copyout(&spaces, space, 0x2000 - 8, &data).unwrap();

        let mut back = [0u8; 16];
        copyin(&spaces, space, 0x2000 - 8, &mut back).unwrap();
        assert_eq!(back, data);

        copyout_word(&spaces, space, 0x1008, 0xdead_beef).unwrap();
        assert_eq!(copyin_word(&spaces, space, 0x1008), Ok(0xdead_beef));
    }

    #[test]
    fn test_faults() {
        let spaces = SpaceTable::new();
        let space = spaces.create_space();
        spaces.map_anonymous(space, 0x1000, PAGE_SIZE, Rights::READ).unwrap();

        let mut buf = [0u8; 8];
        assert_eq!(
            copyin(&spaces, space, 0x1ffc, &mut buf),
            Err(Fault::new(0x2000, Access::Read, FaultKind::NotMapped))
        );
        assert_eq!(
            copyout(&spaces, space, 0x1000, &buf),
            Err(Fault::new(0x1000, Access::Write, FaultKind::Protection))
        );
    }

    #[test]
    fn test_checkpoint() {
        let resolvable = Fault::new(0x1000, Access::Read, FaultKind::NotMapped);
        assert_eq!(checkpoint(resolvable), Ok(resolvable));

        let stray = Fault::new(0x1000, Access::Write, FaultKind::Unexpected);
        assert_eq!(checkpoint(stray), Err(IpcError::MsgCut));
    }
}
