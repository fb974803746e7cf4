//! Indirect string transfer
//!
//! Strings are copied pairwise while both sides have string dopes left.
//! Each string is clipped so that its destination fits one VM window; the
//! destination is mapped into the string window once and filled in chunks
//! read from the sender's own space.
//!
//! The walk stops at the first string whose source does not fit its
//! destination. That string is still delivered up to the destination size;
//! the rest are reported as cut, not as a failure.

use log::{debug, trace};

use crate::config::WINDOW_SPAN;
use crate::ipc::error::IpcError;
use crate::ipc::long_ipc::Transfer;
use crate::ipc::message::{string_dope_addr, MsgSize, StringDope, STRING_DOPE_WORDS};
use crate::types::{page_offset, Address, Mword, WORD_SIZE};
use crate::vm::window::WindowId;

/// Bytes moved per window write
const STRING_CHUNK: usize = 256;

impl Transfer<'_, '_> {
    pub(crate) fn transfer_strings(
        &mut self,
        smsg: Address,
        snd_size: MsgSize,
        send: MsgSize,
        rmsg: Address,
        rcv_size: MsgSize,
    ) -> Result<(), IpcError> {
        let count = send.strings.min(rcv_size.strings) as usize;

        for i in 0..count {
            self.paired()?;

            let src = self.sender_dope(string_dope_addr(smsg, snd_size, i))?;
            let rcv_dope = string_dope_addr(rmsg, rcv_size, i);
            let rcv_len = self.peek_partner(WindowId::Message, rcv_dope + 2 * WORD_SIZE)?;
            let rcv_str = self.peek_partner(WindowId::Message, rcv_dope + 3 * WORD_SIZE)?;

            let limit = WINDOW_SPAN - page_offset(rcv_str);
            let len = src.snd_size.min(rcv_len).min(limit);
            let config = self.ipc.config;
            if !config.is_user_range(src.snd_str, len) || !config.is_user_range(rcv_str, len) {
                debug!("string {} outside user space", i);
                return Err(IpcError::InvalidBuffer);
            }

            self.copy_string(src.snd_str, rcv_str, len)?;

            // Delivered size and address go into the receiver's send half
            self.poke_partner(WindowId::Message, rcv_dope, len)?;
            self.poke_partner(WindowId::Message, rcv_dope + WORD_SIZE, rcv_str)?;
            self.dope.strings += 1;
            self.ipc.counters.string_bytes.add(len as u64);
            trace!("string {}: {} of {} bytes", i, len, src.snd_size);

            if len < src.snd_size {
                self.dope.combine(IpcError::MsgCut);
                return Ok(());
            }
        }

        if send.strings > rcv_size.strings {
            self.dope.combine(IpcError::MsgCut);
        }
        Ok(())
    }

    fn sender_dope(&self, addr: Address) -> Result<StringDope, IpcError> {
        let mut words: [Mword; STRING_DOPE_WORDS] = [0; STRING_DOPE_WORDS];
        for (i, word) in words.iter_mut().enumerate() {
            *word = self.read_own_word(addr + i * WORD_SIZE)?;
        }
        Ok(StringDope::from_words(words))
    }

    fn copy_string(&self, src: Address, dst: Address, len: usize) -> Result<(), IpcError> {
        let mut chunk = [0u8; STRING_CHUNK];
        let mut done = 0;
        while done < len {
            let n = STRING_CHUNK.min(len - done);
            self.read_own(src + done, &mut chunk[..n])?;
            self.write_partner(WindowId::String, dst + done, &chunk[..n])?;
            done += n;
        }
        Ok(())
    }
}
