//! IPC error codes and the message dope
//!
//! Error kinds follow the classic L4 taxonomy: each receive-side code has a
//! send-side twin that differs only in the `SND_ERROR` bit. The message dope
//! carries the transfer counts together with the first blocking error, so a
//! caller always learns exactly what was delivered.

use thiserror::Error;

/// Bit set in a raw error code when the error is reported to the sender
pub const SND_ERROR: u32 = 0x10;

/// Errors that can terminate or cut a long IPC
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum IpcError {
    /// Partner does not exist
    #[error("partner does not exist")]
    NotExistent,
    /// Operation canceled by an external actor
    #[error("operation canceled")]
    Canceled,
    /// Flexpage mapper declined a grant
    #[error("flexpage mapping failed")]
    MapFailed,
    /// Page fault in the sender's space could not be resolved in time
    #[error("send-side page fault timeout")]
    SndPfTimeout,
    /// Page fault in the receiver's space could not be resolved in time
    #[error("receive-side page fault timeout")]
    RcvPfTimeout,
    /// Partner disengaged while the transfer was in progress
    #[error("transfer aborted")]
    Aborted,
    /// Message cut: buffer too small, too few strings or a short string buffer
    #[error("message cut")]
    MsgCut,
    /// A declared buffer resolved to kernel-only memory or was malformed
    #[error("invalid message buffer")]
    InvalidBuffer,
}

impl IpcError {
    /// Raw receive-side code
    pub const fn raw(self) -> u32 {
        match self {
            IpcError::NotExistent => 0x10,
            IpcError::Canceled => 0x40,
            IpcError::MapFailed => 0x60,
            IpcError::SndPfTimeout => 0x80,
            IpcError::RcvPfTimeout => 0xA0,
            IpcError::Aborted => 0xC0,
            IpcError::MsgCut => 0xE0,
            // No slot left in the 4-bit field; reported out of band
            IpcError::InvalidBuffer => 0x100,
        }
    }

    /// Raw code as seen by the side that caused the error
    pub const fn raw_for(self, send_side: bool) -> u32 {
        match self {
            // The send bit is part of the code for NotExistent
            IpcError::NotExistent => 0x10,
            _ if send_side => self.raw() | SND_ERROR,
            _ => self.raw(),
        }
    }
}

/// Result descriptor of a long IPC
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MsgDope {
    /// Direct words delivered into the receiver's buffer
    pub dwords: u32,
    /// Indirect strings delivered
    pub strings: u32,
    /// At least one flexpage was installed
    pub fpage_received: bool,
    /// First blocking error
    pub error: Option<IpcError>,
    /// The error is reported to the side that caused it
    pub snd_error: bool,
}

impl MsgDope {
    /// Empty dope with no error
    pub const fn new() -> Self {
        Self {
            dwords: 0,
            strings: 0,
            fpage_received: false,
            error: None,
            snd_error: false,
        }
    }

    /// Dope carrying only an error
    pub const fn with_error(error: IpcError) -> Self {
        let mut dope = Self::new();
        dope.error = Some(error);
        dope
    }

    /// Fold an error into the dope; the first error wins
    pub fn combine(&mut self, error: IpcError) {
        if self.error.is_none() {
            self.error = Some(error);
        }
    }

    /// Same dope, tagged as the sender's view of the transfer
    pub fn for_sender(mut self) -> Self {
        self.snd_error = self.error.is_some();
        self
    }

    /// Raw error code including the send-side marker
    pub fn raw_error(&self) -> u32 {
        match self.error {
            Some(e) => e.raw_for(self.snd_error),
            None => 0,
        }
    }
}
