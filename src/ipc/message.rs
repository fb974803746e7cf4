//! Long message descriptors and buffer layout
//!
//! A long message lives in a user buffer with a fixed header followed by
//! direct words and string dopes. All counts are word-indexed:
//!
//! ```text
//! word 0                      receive flexpage option
//! word 1                      size dope (capacity: dwords, strings)
//! word 2                      send dope (dwords and strings to send)
//! word 3 ..                   size.dwords direct words
//! word 3 + size.dwords ..     size.strings string dopes, 4 words each
//! ```
//!
//! A string dope is `{ snd_size, snd_str, rcv_size, rcv_str }`. The sender
//! reads the `snd_*` half; the receiver declares the `rcv_*` half and gets
//! the delivered size and address written into its `snd_*` half.

use crate::config::REG_WORDS;
use crate::types::{Address, Mword, WORD_SIZE};
use crate::vm::fpage::Flexpage;

/// Index of the receive flexpage word
pub const FPAGE_WORD: usize = 0;
/// Index of the size dope
pub const SIZE_WORD: usize = 1;
/// Index of the send dope
pub const SEND_WORD: usize = 2;
/// Words before the first direct word
pub const HEADER_WORDS: usize = 3;
/// Words per string dope
pub const STRING_DOPE_WORDS: usize = 4;

const DWORDS_SHIFT: u32 = 13;
const DWORDS_MASK: Mword = 0x7_FFFF;
const STRINGS_SHIFT: u32 = 8;
const STRINGS_MASK: Mword = 0x1F;

// ============================================================================
// Dopes
// ============================================================================

/// Size or send dope: a direct-word count and a string count
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MsgSize {
    pub dwords: u32,
    pub strings: u32,
}

impl MsgSize {
    pub const fn new(dwords: u32, strings: u32) -> Self {
        Self { dwords, strings }
    }

    pub const fn from_raw(raw: Mword) -> Self {
        Self {
            dwords: ((raw >> DWORDS_SHIFT) & DWORDS_MASK) as u32,
            strings: ((raw >> STRINGS_SHIFT) & STRINGS_MASK) as u32,
        }
    }

    pub const fn raw(self) -> Mword {
        ((self.dwords as Mword & DWORDS_MASK) << DWORDS_SHIFT)
            | ((self.strings as Mword & STRINGS_MASK) << STRINGS_SHIFT)
    }
}

/// One indirect string descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StringDope {
    pub snd_size: usize,
    pub snd_str: Address,
    pub rcv_size: usize,
    pub rcv_str: Address,
}

impl StringDope {
    pub const fn from_words(words: [Mword; STRING_DOPE_WORDS]) -> Self {
        Self {
            snd_size: words[0],
            snd_str: words[1],
            rcv_size: words[2],
            rcv_str: words[3],
        }
    }

    pub const fn to_words(self) -> [Mword; STRING_DOPE_WORDS] {
        [self.snd_size, self.snd_str, self.rcv_size, self.rcv_str]
    }
}

// ============================================================================
// Buffer Layout
// ============================================================================

/// Address of header word `index`
pub const fn header_addr(msg: Address, index: usize) -> Address {
    msg + index * WORD_SIZE
}

/// Address of direct word `index`
pub const fn dword_addr(msg: Address, index: usize) -> Address {
    msg + (HEADER_WORDS + index) * WORD_SIZE
}

/// Address of string dope `index` for a buffer with capacity `size`
pub const fn string_dope_addr(msg: Address, size: MsgSize, index: usize) -> Address {
    msg + (HEADER_WORDS + size.dwords as usize + index * STRING_DOPE_WORDS) * WORD_SIZE
}

/// Bytes covered by a buffer with capacity `size`
pub const fn buffer_len(size: MsgSize) -> usize {
    (HEADER_WORDS + size.dwords as usize + size.strings as usize * STRING_DOPE_WORDS) * WORD_SIZE
}

/// Bytes of the fixed header
pub const HEADER_LEN: usize = HEADER_WORDS * WORD_SIZE;

// ============================================================================
// Descriptors
// ============================================================================

/// Send side of an IPC call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SendDescriptor {
    /// Register words carry a flexpage and the buffer may carry more
    pub map: bool,
    /// Long message buffer in the sender's space
    pub msg: Option<Address>,
}

/// Registers of a sending thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SendRegs {
    pub desc: SendDescriptor,
    pub words: [Mword; REG_WORDS],
}

impl SendRegs {
    /// Register-only message
    pub fn short(words: [Mword; REG_WORDS]) -> Self {
        Self {
            desc: SendDescriptor::default(),
            words,
        }
    }

    /// Long message in the buffer at `msg`
    pub fn long(msg: Address, words: [Mword; REG_WORDS]) -> Self {
        Self {
            desc: SendDescriptor {
                map: false,
                msg: Some(msg),
            },
            words,
        }
    }

    /// Set the flexpage flag
    pub fn with_map(mut self) -> Self {
        self.desc.map = true;
        self
    }

    /// Hot-spot offset and flexpage passed in registers
    pub fn register_fpage(&self) -> (Address, Flexpage) {
        (self.words[0], Flexpage::from_raw(self.words[1]))
    }
}

/// Receive side of an IPC call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RcvDescriptor {
    /// Long message buffer in the receiver's space
    pub msg: Option<Address>,
    /// Receive window for a register-only receiver
    pub rmap: Option<Flexpage>,
}

impl RcvDescriptor {
    pub fn short() -> Self {
        Self::default()
    }

    pub fn long(msg: Address) -> Self {
        Self {
            msg: Some(msg),
            rmap: None,
        }
    }

    pub fn with_rmap(mut self, rmap: Flexpage) -> Self {
        self.rmap = Some(rmap);
        self
    }

    pub fn is_short(&self) -> bool {
        self.msg.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_dope_fields() {
        let size = MsgSize::new(300, 3);
        assert_eq!(size.raw(), (300 << 13) | (3 << 8));
        assert_eq!(MsgSize::from_raw(size.raw()), size);
        // Low bits are not part of the dope
        assert_eq!(MsgSize::from_raw(size.raw() | 0xFF), size);
    }

    #[test]
    fn test_layout() {
        let size = MsgSize::new(4, 2);
        assert_eq!(dword_addr(0x1000, 0), 0x1000 + 3 * WORD_SIZE);
        assert_eq!(string_dope_addr(0x1000, size, 1), 0x1000 + 11 * WORD_SIZE);
        assert_eq!(buffer_len(size), 15 * WORD_SIZE);
        assert_eq!(buffer_len(MsgSize::default()), HEADER_LEN);
    }

    #[test]
    fn test_register_fpage() {
        let fpage = Flexpage::new(0x20_0000, 21, crate::vm::space::Rights::READ, false);
        let regs = SendRegs::short([0x1000, fpage.raw()]).with_map();
        assert!(regs.desc.map);
        assert_eq!(regs.register_fpage(), (0x1000, fpage));
    }
}
