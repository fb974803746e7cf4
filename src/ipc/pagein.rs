//! Page-Fault Resolver
//!
//! Handles faults inside a VM window while a long IPC copies into the
//! partner's memory. The resolver moves through these states:
//!
//! - **Partner-has-page**: the partner's space already maps the page with
//!   the needed rights; its entry is copied into the window slot and the
//!   copy retries without giving up the processor.
//! - **Aborted**: the partner no longer receives from us; fail at once.
//! - **Awaiting-pagein**: post a page-in request on the partner, mark
//!   ourselves polling, tear down the windows and yield until woken.
//! - **Woken**: a cancel reports `Aborted`; otherwise re-check the pairing
//!   and continue with the status the partner delivered.
//!
//! The partner side of the protocol is [`LongIpc::serve_pagein`], run by the
//! receiver while it waits for the message.

use log::{debug, trace, warn};
use thiserror::Error;

use crate::ipc::error::{IpcError, MsgDope};
use crate::ipc::long_ipc::LongIpc;
use crate::kern::sched_prim::WaitResult;
use crate::kern::thread::{Effect, IpcEvent, IpcState, PageinRequest, Thread, ThreadHandle};
use crate::types::{Access, Address, SpaceId};
use crate::vm::copyio::{required_rights, Fault};

// ============================================================================
// Pager
// ============================================================================

/// Errors a pager can report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PagerError {
    /// No answer within the page-fault timeout
    #[error("pager timed out")]
    Timeout,
    /// Nothing can ever be mapped at the address
    #[error("no such region")]
    NotExistent,
    /// The pager refused the fault
    #[error("pager rejected the fault")]
    Rejected,
}

impl PagerError {
    /// Error reported when the sender's own buffer could not be paged in
    pub const fn for_sender(self) -> IpcError {
        match self {
            PagerError::Timeout => IpcError::SndPfTimeout,
            PagerError::NotExistent | PagerError::Rejected => IpcError::Aborted,
        }
    }

    /// Error reported when the receiver could not page in its buffer
    pub const fn for_receiver(self) -> IpcError {
        match self {
            PagerError::Timeout => IpcError::RcvPfTimeout,
            PagerError::NotExistent | PagerError::Rejected => IpcError::Aborted,
        }
    }
}

/// Resolves page faults of a thread in its own address space
pub trait Pager {
    /// Make `addr` in `space` accessible for `access`
    fn page_in(&self, space: SpaceId, addr: Address, access: Access) -> Result<(), PagerError>;
}

// ============================================================================
// Window Faults
// ============================================================================

impl LongIpc<'_> {
    /// Resolve a fault at kernel address `fault.addr` hit by `sender`
    ///
    /// `Ok` means the page is now present in the window and the access can
    /// be retried. Faults outside any window are not resolvable and cut the
    /// message.
    pub fn handle_window_fault(&self, sender: ThreadHandle, fault: Fault) -> Result<(), IpcError> {
        let snd = self.threads.get(sender).ok_or(IpcError::Aborted)?;
        let (window, space, addr) = match snd.windows.lock().translate(fault.addr) {
            Some(target) => target,
            None => {
                self.counters.unexpected_faults.inc();
                warn!("{:?} faults at {:#x} outside its windows", sender, fault.addr);
                return Err(IpcError::MsgCut);
            }
        };
        self.counters.window_faults.inc();

        let partner = match snd.state() {
            IpcState::SendLong { partner } => partner,
            _ => return Err(IpcError::Aborted),
        };
        let partner_space = self.threads.get(partner).ok_or(IpcError::Aborted)?.space();
        if partner_space != space {
            self.counters.unexpected_faults.inc();
            warn!("window {:?} of {:?} points outside its partner", window, sender);
            return Err(IpcError::MsgCut);
        }
        let needed = required_rights(fault.access);

        for _ in 0..=self.config.max_fault_retries {
            // The partner's entry is copied while it is still receiving from us
            let installed = self
                .with_paired(partner, sender, |_| {
                    self.spaces
                        .lookup(space, addr)
                        .filter(|p| p.rights.contains(needed))
                        .map(|pte| snd.windows.lock().install(window, addr, pte))
                })
                .map_err(|e| {
                    warn!("{:?} left the transfer with {:?}", partner, sender);
                    e
                })?;
            match installed {
                Some(true) => {
                    self.counters.faults_from_partner.inc();
                    trace!("{:#x} taken from {:?}", addr, partner);
                    return Ok(());
                }
                Some(false) => return Err(IpcError::MsgCut),
                None => {}
            }

            self.await_pagein(&snd, partner, addr, fault.access)?;
        }
        Err(IpcError::RcvPfTimeout)
    }

    /// Ask the receiver to page in `addr` and block until it answers
    fn await_pagein(
        &self,
        snd: &Thread,
        receiver: ThreadHandle,
        addr: Address,
        access: Access,
    ) -> Result<(), IpcError> {
        let sender = snd.handle();

        if snd.lock.lock().apply(IpcEvent::AwaitPagein) == Effect::Invalid {
            return Err(IpcError::Aborted);
        }
        let posted = self.with_paired(receiver, sender, |inner| {
            inner.pagein = Some(PageinRequest {
                applicant: sender,
                addr,
                access,
            });
            inner.ready = true;
        });
        if let Err(e) = posted {
            snd.lock.lock().apply(IpcEvent::PageinDone);
            return Err(e);
        }
        self.counters.pagein_requests.inc();
        debug!("{:?} asks {:?} to page in {:#x}", sender, receiver, addr);
        self.sched.set_switch_hint(receiver);

        match self.wait_for_partner(snd, receiver) {
            WaitResult::Normal => {
                let status = snd.lock.lock().pagein_status.take();
                self.check_paired(receiver, sender)?;
                status.unwrap_or(Err(IpcError::Aborted))
            }
            WaitResult::Interrupted => {
                warn!("page-in wait of {:?} cancelled", sender);
                Err(IpcError::Aborted)
            }
            WaitResult::PartnerGone => {
                snd.lock.lock().apply(IpcEvent::PageinDone);
                if let Some(rcv) = self.threads.get(receiver) {
                    let mut inner = rcv.lock.lock();
                    if inner.pagein.is_some_and(|r| r.applicant == sender) {
                        inner.clear_pagein_request();
                    }
                }
                warn!("{:?} left while {:?} was waiting", receiver, sender);
                Err(IpcError::Aborted)
            }
        }
    }

    /// Yield until the sender leaves the polling state
    fn wait_for_partner(&self, snd: &Thread, receiver: ThreadHandle) -> WaitResult {
        let sender = snd.handle();
        loop {
            snd.windows.lock().invalidate_all();

            match snd.state() {
                IpcState::PollingLong { .. } => {}
                IpcState::SendLong { .. } => return WaitResult::Normal,
                IpcState::Idle | IpcState::ReceiveLong { .. } | IpcState::Cancelled => {
                    return WaitResult::Interrupted
                }
            }
            if !self.in_long_ipc(receiver, sender) {
                return WaitResult::PartnerGone;
            }

            self.counters.pagein_yields.inc();
            self.sched.schedule(self, sender);
        }
    }

    // ========================================================================
    // Receiver Side
    // ========================================================================

    /// Serve the page-in request pending on `receiver`, if any
    ///
    /// Returns `Ok(true)` after a request was answered and `Ok(false)` if
    /// none was pending. Fails if the receiver is no longer receiving or the
    /// applicant could not be resumed.
    pub fn serve_pagein(&self, receiver: ThreadHandle) -> Result<bool, IpcError> {
        let rcv = self.threads.get(receiver).ok_or(IpcError::NotExistent)?;
        let request = {
            let inner = rcv.lock.lock();
            match inner.state {
                IpcState::ReceiveLong { .. } => {}
                IpcState::Cancelled => return Err(IpcError::Canceled),
                _ => return Err(IpcError::Aborted),
            }
            match inner.pagein {
                Some(request) => request,
                None => return Ok(false),
            }
        };

        debug!("{:?} pages in {:#x} for {:?}", receiver, request.addr, request.applicant);
        let status = self
            .pager
            .page_in(rcv.space(), request.addr, request.access)
            .map_err(PagerError::for_receiver);

        {
            let mut inner = rcv.lock.lock();
            inner.clear_pagein_request();
            if matches!(inner.state, IpcState::ReceiveLong { .. }) {
                inner.ready = false;
            }
        }
        self.resume_blocked_side(receiver, request.applicant, status)?;
        Ok(true)
    }

    /// Block `receiver` until its long receive completes, serving page-in
    /// requests from the sender meanwhile
    ///
    /// Returns the receiver's result. A cancelled receive reports `Canceled`.
    pub fn await_long_receive(&self, receiver: ThreadHandle) -> MsgDope {
        let rcv = match self.threads.get(receiver) {
            Some(t) => t,
            None => return MsgDope::with_error(IpcError::NotExistent),
        };

        loop {
            let pending = {
                let mut inner = rcv.lock.lock();
                match inner.state {
                    IpcState::ReceiveLong { partner } => {
                        if self.threads.get(partner).is_none() {
                            inner.rcv.result = MsgDope::with_error(IpcError::Aborted);
                            inner.apply(IpcEvent::Finish);
                            return inner.rcv.result;
                        }
                        inner.pagein.is_some()
                    }
                    IpcState::Cancelled => {
                        inner.apply(IpcEvent::Finish);
                        return MsgDope::with_error(IpcError::Canceled);
                    }
                    IpcState::Idle => return inner.rcv.result,
                    IpcState::SendLong { .. } | IpcState::PollingLong { .. } => {
                        return MsgDope::with_error(IpcError::Aborted)
                    }
                }
            };

            if !pending {
                self.sched.schedule(self, receiver);
                continue;
            }
            if let Err(e) = self.serve_pagein(receiver) {
                warn!("{:?} stops serving page-ins: {}", receiver, e);
                let mut inner = rcv.lock.lock();
                if matches!(inner.state, IpcState::ReceiveLong { .. }) {
                    inner.rcv.result = MsgDope::with_error(e);
                    inner.apply(IpcEvent::Finish);
                    return inner.rcv.result;
                }
            }
        }
    }
}
