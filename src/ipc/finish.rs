//! IPC completion and wakeup
//!
//! Finalization happens at most once per transfer: it only writes results
//! into a receiver that is still paired with the sender, and unpairs it in
//! the same critical section. Any later attempt finds the pairing gone and
//! reports an abort instead.

use log::{debug, warn};

use crate::ipc::error::{IpcError, MsgDope};
use crate::ipc::long_ipc::LongIpc;
use crate::kern::thread::{IpcEvent, IpcState, ThreadHandle};

impl LongIpc<'_> {
    /// Deliver `dope` to the receiver and release both sides
    ///
    /// Returns the sender's view: `dope` tagged with the send-side marker,
    /// or `Aborted` with the same counts if the receiver is no longer paired.
    pub fn finalize(&self, sender: ThreadHandle, receiver: ThreadHandle, dope: MsgDope) -> MsgDope {
        let snd = self.threads.get(sender);
        if let Some(snd) = &snd {
            snd.windows.lock().invalidate_all();
        }

        let delivered = match self.threads.get(receiver) {
            Some(rcv) => {
                let mut inner = rcv.lock.lock();
                if inner.in_long_ipc(sender) {
                    inner.rcv.result = dope;
                    inner.clear_pagein_request();
                    inner.apply(IpcEvent::Finish);
                    true
                } else {
                    false
                }
            }
            None => false,
        };

        if let Some(snd) = &snd {
            let mut inner = snd.lock.lock();
            if inner.state.partner() == Some(receiver) || inner.state == IpcState::Cancelled {
                inner.pagein_status = None;
                inner.apply(IpcEvent::Finish);
            }
        }

        let mut result = dope;
        if delivered {
            self.counters.completed.inc();
            if result.error == Some(IpcError::MsgCut) {
                self.counters.cut.inc();
            }
            debug!(
                "{:?} -> {:?} done: {} words, {} strings, {:?}",
                sender, receiver, result.dwords, result.strings, result.error
            );
        } else {
            warn!("{:?} no longer paired with {:?}; reporting abort", receiver, sender);
            self.counters.aborted.inc();
            result.error = Some(IpcError::Aborted);
        }
        result.for_sender()
    }

    /// Wake `blocked`, which is polling on `caller` for a page-in, with
    /// `status`
    ///
    /// Fails with `Aborted` for the caller if `blocked` is no longer waiting
    /// on it.
    pub fn resume_blocked_side(
        &self,
        caller: ThreadHandle,
        blocked: ThreadHandle,
        status: Result<(), IpcError>,
    ) -> Result<(), IpcError> {
        let thread = self.threads.get(blocked).ok_or(IpcError::Aborted)?;
        {
            let mut inner = thread.lock.lock();
            if inner.state != (IpcState::PollingLong { partner: caller }) {
                debug!("{:?} is not polling on {:?}", blocked, caller);
                return Err(IpcError::Aborted);
            }
            inner.pagein_status = Some(status);
            inner.apply(IpcEvent::PageinDone);
        }
        self.sched.set_switch_hint(blocked);
        debug!("{:?} resumes {:?} with {:?}", caller, blocked, status);
        Ok(())
    }
}
