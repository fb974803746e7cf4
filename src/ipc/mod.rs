//! Long IPC
//!
//! Cross-address-space transfer of messages too large for registers,
//! including flexpage grants and indirect strings. The engine runs after the
//! short-IPC handshake has paired a sender with a receiver and finishes the
//! transfer on both sides exactly once.

pub mod error;
pub mod finish;
pub mod long_ipc;
pub mod message;
pub mod pagein;
pub mod strings;

pub use error::{IpcError, MsgDope, SND_ERROR};
pub use long_ipc::LongIpc;
pub use message::{MsgSize, RcvDescriptor, SendDescriptor, SendRegs, StringDope};
pub use pagein::{Pager, PagerError};
