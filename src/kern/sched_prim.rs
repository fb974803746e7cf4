//! Scheduling Primitives - the seam towards the scheduler
//!
//! Ready-queue policy is not part of this crate. The long-IPC code only
//! needs to give the processor away while it waits for a partner, and to
//! tell the scheduler which context it would like to see run next.

use crate::ipc::LongIpc;
use crate::kern::thread::ThreadHandle;

// ============================================================================
// Wait Results
// ============================================================================

/// Why a blocked thread left its wait loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    /// Partner delivered a status
    Normal,
    /// Cancellation flipped the thread back to ready
    Interrupted,
    /// The partner is no longer paired with us
    PartnerGone,
}

// ============================================================================
// Scheduler
// ============================================================================

/// Cooperative scheduler interface
///
/// Implementations must not assume any thread lock is held by the caller;
/// the long-IPC code releases all locks and tears down its VM windows
/// before calling [`Scheduler::schedule`].
pub trait Scheduler {
    /// Yield the processor on behalf of `current`
    ///
    /// Returns once `current` is scheduled again. `ipc` gives the
    /// scheduler access to the engine so other contexts can run.
    fn schedule(&self, ipc: &LongIpc<'_>, current: ThreadHandle);

    /// Prefer running `target` at the next scheduling decision
    fn set_switch_hint(&self, target: ThreadHandle);
}
