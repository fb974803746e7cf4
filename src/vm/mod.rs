//! Virtual memory support for long IPC
//!
//! Address spaces and frames, flexpage grants, fault-checked user copies
//! and the per-context VM windows used to reach a partner's memory.

pub mod copyio;
pub mod fpage;
pub mod space;
pub mod window;

pub use copyio::{checkpoint, copyin, copyin_word, copyout, copyout_word, Fault, FaultKind};
pub use fpage::{Flexpage, FlexpageMapper, MapError};
pub use space::{AddressSpaces, Pte, Rights, SpaceError, SpaceTable};
pub use window::{MapOutcome, Window, WindowId, WindowSet};
