//! Thread Management
//!
//! An execution context is the unit that sends or receives a long IPC. Its
//! IPC-relevant state lives behind a [`ThreadLock`] and is modelled as an
//! explicit tagged state with total transitions.
//!
//! Partners refer to each other through [`ThreadHandle`]s, which are
//! generation-checked indices into a [`ThreadTable`]. A handle never keeps
//! its target alive: once a thread is destroyed, every outstanding handle
//! resolves to `None` instead of a dangling context.

use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use crate::config::REG_WORDS;
use crate::ipc::error::{IpcError, MsgDope};
use crate::ipc::message::RcvDescriptor;
use crate::kern::lock::ThreadLock;
use crate::types::{Access, Address, Mword, SpaceId};
use crate::vm::window::WindowSet;

// ============================================================================
// Thread Handle
// ============================================================================

/// Weak, generation-checked reference to a thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadHandle {
    index: u32,
    generation: u32,
}

impl ThreadHandle {
    /// Slot index in the thread table
    pub fn index(self) -> u32 {
        self.index
    }

    /// Generation the slot had when the handle was issued
    pub fn generation(self) -> u32 {
        self.generation
    }
}

// ============================================================================
// IPC State Machine
// ============================================================================

/// IPC state of a thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IpcState {
    /// No IPC in progress
    #[default]
    Idle,
    /// Running a long transfer towards `partner`
    SendLong { partner: ThreadHandle },
    /// Sender blocked until `partner` pages something in
    PollingLong { partner: ThreadHandle },
    /// Receiving a long message from `partner`
    ReceiveLong { partner: ThreadHandle },
    /// Cancelled by timeout expiry or an explicit kill
    Cancelled,
}

/// Events driving [`IpcState`] transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpcEvent {
    /// Handshake committed, this side sends to the given partner
    BeginSend(ThreadHandle),
    /// Handshake committed, this side receives from the given partner
    BeginReceive(ThreadHandle),
    /// Sender posted a page-in request and is about to block
    AwaitPagein,
    /// Partner answered the page-in request
    PageinDone,
    /// External cancellation
    Cancel,
    /// Transfer finalized or abandoned
    Finish,
}

/// Side effect requested by a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    /// Nothing to do
    None,
    /// Thread must be made ready
    Wake,
    /// Thread leaves the ready state
    Block,
    /// Event does not apply in this state; nothing changed
    Invalid,
}

impl IpcState {
    /// Transition function over all (state, event) pairs
    pub fn on(self, event: IpcEvent) -> (IpcState, Effect) {
        use IpcEvent::*;
        use IpcState::*;

        match (self, event) {
            (Idle, BeginSend(partner)) => (SendLong { partner }, Effect::None),
            (Idle, BeginReceive(partner)) => (ReceiveLong { partner }, Effect::Block),
            (SendLong { partner }, AwaitPagein) => (PollingLong { partner }, Effect::Block),
            (PollingLong { partner }, PageinDone) => (SendLong { partner }, Effect::Wake),
            (SendLong { .. } | PollingLong { .. } | ReceiveLong { .. }, Cancel) => {
                (Cancelled, Effect::Wake)
            }
            (Idle | Cancelled, Cancel) => (Cancelled, Effect::None),
            (SendLong { .. } | PollingLong { .. } | ReceiveLong { .. } | Cancelled, Finish) => {
                (Idle, Effect::Wake)
            }
            (Idle, Finish) => (Idle, Effect::None),
            (state, _) => (state, Effect::Invalid),
        }
    }

    /// Partner this state is engaged with, if any
    pub fn partner(self) -> Option<ThreadHandle> {
        match self {
            IpcState::SendLong { partner }
            | IpcState::PollingLong { partner }
            | IpcState::ReceiveLong { partner } => Some(partner),
            IpcState::Idle | IpcState::Cancelled => None,
        }
    }
}

// ============================================================================
// Page-in Request
// ============================================================================

/// Request from a blocked sender asking its partner to page in memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageinRequest {
    /// Thread to resume once the page is present
    pub applicant: ThreadHandle,
    /// Faulting address in the partner's address space
    pub addr: Address,
    /// Access that faulted
    pub access: Access,
}

// ============================================================================
// Thread
// ============================================================================

/// Receive side registers
#[derive(Debug, Clone, Copy, Default)]
pub struct ReceiveRegs {
    /// What the receiver is prepared to accept
    pub desc: RcvDescriptor,
    /// Register words delivered by the sender
    pub words: [Mword; REG_WORDS],
    /// Result written by the sender when the transfer completes
    pub result: MsgDope,
}

/// Lock-protected part of a thread
#[derive(Debug, Default)]
pub struct ThreadInner {
    pub state: IpcState,
    /// On the ready queue
    pub ready: bool,
    pub pagein: Option<PageinRequest>,
    /// Status delivered by the partner's resume, consumed by the resolver
    pub pagein_status: Option<Result<(), IpcError>>,
    pub rcv: ReceiveRegs,
}

impl ThreadInner {
    /// Apply an event and perform its readiness effect
    pub fn apply(&mut self, event: IpcEvent) -> Effect {
        let (next, effect) = self.state.on(event);
        self.state = next;
        match effect {
            Effect::Wake => self.ready = true,
            Effect::Block => self.ready = false,
            Effect::None | Effect::Invalid => {}
        }
        effect
    }

    /// Whether this thread is receiving a long message from `sender`
    pub fn in_long_ipc(&self, sender: ThreadHandle) -> bool {
        self.state == IpcState::ReceiveLong { partner: sender }
    }

    /// Drop any pending page-in request
    pub fn clear_pagein_request(&mut self) {
        self.pagein = None;
    }
}

/// An execution context
#[derive(Debug)]
pub struct Thread {
    handle: ThreadHandle,
    space: SpaceId,
    /// IPC state lock
    pub lock: ThreadLock<ThreadInner>,
    /// VM windows owned by this context while it runs a transfer
    pub windows: Mutex<WindowSet>,
}

impl Thread {
    fn new(handle: ThreadHandle, space: SpaceId) -> Self {
        Self {
            handle,
            space,
            lock: ThreadLock::new(ThreadInner {
                ready: true,
                ..ThreadInner::default()
            }),
            windows: Mutex::new(WindowSet::new()),
        }
    }

    pub fn handle(&self) -> ThreadHandle {
        self.handle
    }

    /// Address space this thread runs in
    pub fn space(&self) -> SpaceId {
        self.space
    }

    /// Snapshot of the current IPC state
    pub fn state(&self) -> IpcState {
        self.lock.lock().state
    }

    pub fn is_ready(&self) -> bool {
        self.lock.lock().ready
    }
}

// ============================================================================
// Thread Table
// ============================================================================

struct Slot {
    generation: u32,
    thread: Option<Arc<Thread>>,
}

/// Arena of threads addressed by generation-checked handles
pub struct ThreadTable {
    slots: Mutex<Vec<Slot>>,
}

impl ThreadTable {
    /// Create an empty table
    pub const fn new() -> Self {
        Self {
            slots: Mutex::new(Vec::new()),
        }
    }

    /// Create a thread in `space`, reusing a free slot if possible
    pub fn create(&self, space: SpaceId) -> ThreadHandle {
        let mut slots = self.slots.lock();

        if let Some(index) = slots.iter().position(|s| s.thread.is_none()) {
            let slot = &mut slots[index];
            let handle = ThreadHandle {
                index: index as u32,
                generation: slot.generation,
            };
            slot.thread = Some(Arc::new(Thread::new(handle, space)));
            return handle;
        }

        let handle = ThreadHandle {
            index: slots.len() as u32,
            generation: 0,
        };
        slots.push(Slot {
            generation: 0,
            thread: Some(Arc::new(Thread::new(handle, space))),
        });
        handle
    }

    /// Resolve a handle; stale handles yield `None`
    pub fn get(&self, handle: ThreadHandle) -> Option<Arc<Thread>> {
        let slots = self.slots.lock();
        let slot = slots.get(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.thread.clone()
    }

    /// Destroy a thread, invalidating every handle to it
    pub fn destroy(&self, handle: ThreadHandle) -> bool {
        let mut slots = self.slots.lock();
        match slots.get_mut(handle.index as usize) {
            Some(slot) if slot.generation == handle.generation && slot.thread.is_some() => {
                slot.thread = None;
                slot.generation = slot.generation.wrapping_add(1);
                true
            }
            _ => false,
        }
    }

    /// Number of live threads
    pub fn count(&self) -> usize {
        self.slots
            .lock()
            .iter()
            .filter(|s| s.thread.is_some())
            .count()
    }
}

impl Default for ThreadTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handles() -> (ThreadTable, ThreadHandle, ThreadHandle) {
        let table = ThreadTable::new();
        let a = table.create(SpaceId(1));
        let b = table.create(SpaceId(2));
        (table, a, b)
    }

    #[test]
    fn test_stale_handle_after_destroy() {
        let (table, a, _) = handles();
        assert!(table.get(a).is_some());
        assert!(table.destroy(a));
        assert!(table.get(a).is_none());
        assert!(!table.destroy(a));

        // Slot is reused with a new generation
        let c = table.create(SpaceId(3));
        assert_eq!(c.index(), a.index());
        assert_ne!(c.generation(), a.generation());
        assert!(table.get(a).is_none());
        assert_eq!(table.get(c).map(|t| t.space()), Some(SpaceId(3)));
    }

    #[test]
    fn test_send_and_poll_transitions() {
        let (_, _, b) = handles();
        let state = IpcState::Idle;

        let (state, effect) = state.on(IpcEvent::BeginSend(b));
        assert_eq!(state, IpcState::SendLong { partner: b });
        assert_eq!(effect, Effect::None);

        let (state, effect) = state.on(IpcEvent::AwaitPagein);
        assert_eq!(state, IpcState::PollingLong { partner: b });
        assert_eq!(effect, Effect::Block);

        let (state, effect) = state.on(IpcEvent::PageinDone);
        assert_eq!(state, IpcState::SendLong { partner: b });
        assert_eq!(effect, Effect::Wake);
    }

    #[test]
    fn test_cancel_wakes_blocked_thread() {
        let (_, a, _) = handles();
        let mut inner = ThreadInner::default();
        inner.apply(IpcEvent::BeginReceive(a));
        assert!(!inner.ready);
        assert!(inner.in_long_ipc(a));

        assert_eq!(inner.apply(IpcEvent::Cancel), Effect::Wake);
        assert!(inner.ready);
        assert_eq!(inner.state, IpcState::Cancelled);
        assert!(!inner.in_long_ipc(a));
    }

    #[test]
    fn test_invalid_events_leave_state_alone() {
        let (_, a, _) = handles();
        assert_eq!(IpcState::Idle.on(IpcEvent::PageinDone), (IpcState::Idle, Effect::Invalid));
        assert_eq!(
            IpcState::Cancelled.on(IpcEvent::BeginSend(a)),
            (IpcState::Cancelled, Effect::Invalid)
        );
        let polling = IpcState::PollingLong { partner: a };
        assert_eq!(polling.on(IpcEvent::AwaitPagein), (polling, Effect::Invalid));
    }

    #[test]
    fn test_finish_returns_to_idle() {
        let (_, a, _) = handles();
        for state in [
            IpcState::SendLong { partner: a },
            IpcState::PollingLong { partner: a },
            IpcState::ReceiveLong { partner: a },
            IpcState::Cancelled,
        ] {
            assert_eq!(state.on(IpcEvent::Finish), (IpcState::Idle, Effect::Wake));
        }
    }
}
