//! Kern subsystem - execution contexts and kernel primitives
//!
//! Threads with their IPC state machine, per-thread locks, the scheduler
//! seam and the IPC performance counters.

pub mod counters;
pub mod lock;
pub mod sched_prim;
pub mod thread;

pub use counters::{CounterSnapshot, IpcCounter, IpcCounters};
pub use lock::{ThreadLock, ThreadLockGuard};
pub use sched_prim::{Scheduler, WaitResult};
pub use thread::{
    Effect, IpcEvent, IpcState, PageinRequest, ReceiveRegs, Thread, ThreadHandle, ThreadInner,
    ThreadTable,
};
