//! Long-IPC configuration
//!
//! Tunables that a kernel build would normally fix per architecture. The
//! defaults describe a 64-bit layout with the user half of the address
//! space below `USER_SPACE_END` and the VM windows in the kernel half.

use crate::types::{Address, PAGE_SIZE};

/// Last user-accessible address (x86_64 canonical lower half)
pub const USER_SPACE_END: Address = 0x0000_7FFF_FFFF_FFFF;

/// Kernel virtual address of VM window 0
pub const WINDOW_BASE: Address = 0xFFFF_FE00_0000_0000;

/// Pages covered by one VM window (one 4 MiB superpage)
pub const WINDOW_PAGES: usize = 1024;

/// Page-table entries a window caches at once
///
/// Must be a power of two. When the cache is full, entries that are not
/// next to the page being installed are dropped and fault in again.
pub const WINDOW_SLOTS: usize = 64;

/// Bytes covered by one VM window
pub const WINDOW_SPAN: usize = WINDOW_PAGES * PAGE_SIZE;

/// Number of message words passed in registers
pub const REG_WORDS: usize = 2;

/// Runtime configuration for the long-IPC engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LongIpcConfig {
    /// Highest address a user message buffer may touch
    pub user_space_end: Address,
    /// How often a sender retries its own faulting buffer access
    pub max_fault_retries: u32,
    /// Upper bound on mappings per address space enforced by the mapper
    pub max_mappings_per_space: usize,
}

impl LongIpcConfig {
    /// Default configuration
    pub const fn new() -> Self {
        Self {
            user_space_end: USER_SPACE_END,
            max_fault_retries: 4,
            max_mappings_per_space: 1 << 16,
        }
    }

    /// Check if `[addr, addr + len)` lies entirely in user space
    pub fn is_user_range(&self, addr: Address, len: usize) -> bool {
        if len == 0 {
            return addr <= self.user_space_end;
        }
        match addr.checked_add(len - 1) {
            Some(end) => end <= self.user_space_end,
            None => false,
        }
    }
}

/// Kernel base address of the given window
pub const fn window_address(window: usize) -> Address {
    WINDOW_BASE + window * WINDOW_SPAN
}

impl Default for LongIpcConfig {
    fn default() -> Self {
        Self::new()
    }
}
