//! Long IPC - the message transfer orchestrator
//!
//! Runs on the sender's context after the short-IPC handshake has paired a
//! sender with a receiver. The sender's own buffer is read through its own
//! address space; the receiver's buffer and string destinations are reached
//! through the sender's VM windows.
//!
//! ## Transfer Steps
//!
//! 1. Reject message buffers that reach outside user space
//! 2. Cut long messages sent to a register-only receiver
//! 3. Install the register flexpage, if any
//! 4. Map the receiver's buffer and re-check the pairing
//! 5. Copy `min(sent, capacity)` direct words
//! 6. Install the remaining flexpages from the direct words
//! 7. Flag truncated direct words
//! 8. Copy indirect strings (see `strings`)
//! 9. Finalize both sides (see `finish`)
//!
//! Errors never roll back completed work. The message dope always carries
//! the counts of what was delivered together with the first blocking error.

use alloc::sync::Arc;
use log::{debug, trace, warn};

use crate::config::{LongIpcConfig, REG_WORDS};
use crate::ipc::error::{IpcError, MsgDope};
use crate::ipc::message::{
    buffer_len, dword_addr, header_addr, MsgSize, RcvDescriptor, SendRegs, FPAGE_WORD, HEADER_LEN,
    SEND_WORD, SIZE_WORD,
};
use crate::ipc::pagein::{Pager, PagerError};
use crate::kern::counters::IpcCounters;
use crate::kern::sched_prim::Scheduler;
use crate::kern::thread::{
    Effect, IpcEvent, IpcState, ReceiveRegs, Thread, ThreadHandle, ThreadInner, ThreadTable,
};
use crate::types::{Address, Mword, WORD_SIZE};
use crate::vm::copyio::{self, copyin, Fault};
use crate::vm::fpage::{Flexpage, FlexpageMapper};
use crate::vm::space::AddressSpaces;
use crate::vm::window::{MapOutcome, WindowId, WindowSet};

// ============================================================================
// Engine
// ============================================================================

/// The long-IPC engine and the collaborators it runs against
pub struct LongIpc<'a> {
    pub threads: &'a ThreadTable,
    pub spaces: &'a dyn AddressSpaces,
    pub mapper: &'a dyn FlexpageMapper,
    pub pager: &'a dyn Pager,
    pub sched: &'a dyn Scheduler,
    pub counters: &'a IpcCounters,
    pub config: LongIpcConfig,
}

impl<'a> LongIpc<'a> {
    /// Create an engine with the default configuration
    pub fn new(
        threads: &'a ThreadTable,
        spaces: &'a dyn AddressSpaces,
        mapper: &'a dyn FlexpageMapper,
        pager: &'a dyn Pager,
        sched: &'a dyn Scheduler,
        counters: &'a IpcCounters,
    ) -> Self {
        Self {
            threads,
            spaces,
            mapper,
            pager,
            sched,
            counters,
            config: LongIpcConfig::new(),
        }
    }

    pub fn with_config(mut self, config: LongIpcConfig) -> Self {
        self.config = config;
        self
    }

    /// Whether `receiver` is still receiving a long message from `sender`
    pub fn in_long_ipc(&self, receiver: ThreadHandle, sender: ThreadHandle) -> bool {
        self.threads
            .get(receiver)
            .is_some_and(|t| t.lock.lock().in_long_ipc(sender))
    }

    /// Run `f` on the receiver's state while it still receives from `sender`
    ///
    /// The receiver is looked up through its handle every time, so a
    /// destroyed receiver reads as unpaired.
    pub(crate) fn with_paired<R>(
        &self,
        receiver: ThreadHandle,
        sender: ThreadHandle,
        f: impl FnOnce(&mut ThreadInner) -> R,
    ) -> Result<R, IpcError> {
        let rcv = self.threads.get(receiver).ok_or(IpcError::Aborted)?;
        let mut inner = rcv.lock.lock();
        if !inner.in_long_ipc(sender) {
            return Err(IpcError::Aborted);
        }
        Ok(f(&mut inner))
    }

    pub(crate) fn check_paired(&self, receiver: ThreadHandle, sender: ThreadHandle) -> Result<(), IpcError> {
        self.with_paired(receiver, sender, |_| ())
    }

    /// Checkpoint wrapper that also counts abandoned copies
    pub(crate) fn checkpoint(&self, fault: Fault) -> Result<Fault, IpcError> {
        copyio::checkpoint(fault).map_err(|e| {
            self.counters.unexpected_faults.inc();
            e
        })
    }

    fn note_map(&self, id: WindowId, addr: Address, outcome: MapOutcome) {
        match outcome {
            MapOutcome::Fresh => {
                self.counters.window_maps.inc();
                trace!("window {:?} -> {:#x}", id, addr);
            }
            MapOutcome::Revived => {
                self.counters.window_revivals.inc();
                trace!("window {:?} revived at {:#x}", id, addr);
            }
            MapOutcome::Reused => {}
        }
    }

    /// Install the post-handshake state for a long transfer
    ///
    /// Only sets up the pairing; no rendezvous is performed. The receiver's
    /// result is preset to `Aborted` so a transfer that never finalizes
    /// cannot look successful.
    pub fn commit_long_pair(
        &self,
        sender: ThreadHandle,
        receiver: ThreadHandle,
        desc: RcvDescriptor,
    ) -> Result<(), IpcError> {
        let snd = self.threads.get(sender).ok_or(IpcError::NotExistent)?;
        let rcv = self.threads.get(receiver).ok_or(IpcError::NotExistent)?;
        if sender == receiver {
            return Err(IpcError::NotExistent);
        }

        {
            let mut inner = rcv.lock.lock();
            if inner.apply(IpcEvent::BeginReceive(sender)) == Effect::Invalid {
                return Err(IpcError::Aborted);
            }
            inner.rcv = ReceiveRegs {
                desc,
                words: [0; REG_WORDS],
                result: MsgDope::with_error(IpcError::Aborted),
            };
            inner.clear_pagein_request();
        }

        let began = {
            let mut inner = snd.lock.lock();
            inner.pagein_status = None;
            inner.apply(IpcEvent::BeginSend(receiver)) != Effect::Invalid
        };
        if !began {
            rcv.lock.lock().apply(IpcEvent::Finish);
            return Err(IpcError::Aborted);
        }

        debug!("paired {:?} -> {:?}", sender, receiver);
        Ok(())
    }

    /// Transfer the long message described by `regs` from `sender` to its
    /// paired `receiver` and finalize both sides
    ///
    /// Returns the sender's view of the result.
    pub fn do_long_transfer(
        &self,
        sender: ThreadHandle,
        receiver: ThreadHandle,
        regs: &SendRegs,
    ) -> MsgDope {
        let snd = match self.threads.get(sender) {
            Some(t) => t,
            None => return MsgDope::with_error(IpcError::NotExistent).for_sender(),
        };
        let rcv = match self.threads.get(receiver) {
            Some(t)
                if snd.state() == (IpcState::SendLong { partner: receiver })
                    && t.lock.lock().in_long_ipc(sender) =>
            {
                t
            }
            _ => {
                warn!("{:?} is not sending to {:?}", sender, receiver);
                return self.finalize(sender, receiver, MsgDope::with_error(IpcError::Aborted));
            }
        };

        self.counters.transfers.inc();
        debug!("long IPC {:?} -> {:?}", sender, receiver);

        let mut transfer = Transfer {
            ipc: self,
            sender: snd,
            receiver: rcv,
            dope: MsgDope::new(),
        };
        if let Err(e) = transfer.run(regs) {
            transfer.dope.combine(e);
        }

        self.finalize(sender, receiver, transfer.dope)
    }

    /// Cancel whatever IPC `thread` is engaged in
    ///
    /// The thread is made ready. A partner is never left blocked: a paired
    /// receiver of a cancelled sender is finalized with `Aborted`, a sender
    /// polling on a cancelled receiver is resumed with `Aborted`.
    pub fn cancel(&self, thread: ThreadHandle) -> bool {
        let t = match self.threads.get(thread) {
            Some(t) => t,
            None => return false,
        };

        let previous = {
            let mut inner = t.lock.lock();
            let previous = inner.state;
            inner.apply(IpcEvent::Cancel);
            inner.clear_pagein_request();
            previous
        };
        warn!("cancel {:?} in {:?}", thread, previous);

        match previous {
            IpcState::SendLong { partner } | IpcState::PollingLong { partner } => {
                if let Some(rcv) = self.threads.get(partner) {
                    let mut inner = rcv.lock.lock();
                    if inner.in_long_ipc(thread) {
                        inner.rcv.result = MsgDope::with_error(IpcError::Aborted);
                        inner.clear_pagein_request();
                        inner.apply(IpcEvent::Finish);
                        self.counters.aborted.inc();
                    }
                }
            }
            IpcState::ReceiveLong { partner } => {
                if self.resume_blocked_side(thread, partner, Err(IpcError::Aborted)).is_ok() {
                    debug!("released {:?} polling on cancelled {:?}", partner, thread);
                }
            }
            IpcState::Idle | IpcState::Cancelled => {}
        }
        true
    }
}

// ============================================================================
// Transfer
// ============================================================================

/// State of one running transfer
pub(crate) struct Transfer<'t, 'a> {
    pub(crate) ipc: &'t LongIpc<'a>,
    pub(crate) sender: Arc<Thread>,
    pub(crate) receiver: Arc<Thread>,
    pub(crate) dope: MsgDope,
}

impl Transfer<'_, '_> {
    fn run(&mut self, regs: &SendRegs) -> Result<(), IpcError> {
        let config = self.ipc.config;
        let rcv_desc = self
            .ipc
            .with_paired(self.receiver.handle(), self.sender.handle(), |inner| inner.rcv.desc)?;

        if let Some(msg) = regs.desc.msg {
            if !config.is_user_range(msg, HEADER_LEN) {
                return Err(self.reject("send", msg));
            }
        }
        if let Some(msg) = rcv_desc.msg {
            if !config.is_user_range(msg, HEADER_LEN) {
                return Err(self.reject("receive", msg));
            }
        }

        if rcv_desc.is_short() && regs.desc.msg.is_some() {
            debug!("long message for register-only receiver {:?}", self.receiver.handle());
            return Err(IpcError::MsgCut);
        }

        // Sender header; counts are clamped to the buffer's own capacity
        let mut snd_size = MsgSize::default();
        let mut send = MsgSize::default();
        if let Some(msg) = regs.desc.msg {
            snd_size = MsgSize::from_raw(self.read_own_word(header_addr(msg, SIZE_WORD))?);
            if !config.is_user_range(msg, buffer_len(snd_size)) {
                return Err(self.reject("send", msg));
            }
            let declared = MsgSize::from_raw(self.read_own_word(header_addr(msg, SEND_WORD))?);
            send = MsgSize::new(
                declared.dwords.min(snd_size.dwords),
                declared.strings.min(snd_size.strings),
            );
        }

        // Receiver header
        let mut rcv_size = MsgSize::default();
        let mut rcv_fpage = rcv_desc.rmap;
        if let Some(msg) = rcv_desc.msg {
            rcv_size = MsgSize::from_raw(self.peek_partner(WindowId::Message, header_addr(msg, SIZE_WORD))?);
            if !config.is_user_range(msg, buffer_len(rcv_size)) {
                return Err(self.reject("receive", msg));
            }
            if rcv_fpage.is_none() {
                let raw = self.peek_partner(WindowId::Message, header_addr(msg, FPAGE_WORD))?;
                rcv_fpage = Some(Flexpage::from_raw(raw)).filter(|f| *f != Flexpage::NIL);
            }
        }

        // A mapping failure is reported with the data; later flexpages
        // are not attempted
        let mut mapping = regs.desc.map;
        if mapping {
            let to = rcv_fpage.ok_or(IpcError::MsgCut)?;
            let (offset, fpage) = regs.register_fpage();
            if !fpage.is_valid() {
                warn!("invalid register flexpage {:#x} from {:?}", fpage.raw(), self.sender.handle());
                return Err(IpcError::InvalidBuffer);
            }
            if let Err(e) = self.map_fpage(fpage, to, offset) {
                self.dope.combine(e);
                mapping = false;
            }
        }

        self.ipc
            .with_paired(self.receiver.handle(), self.sender.handle(), |inner| {
                inner.rcv.words = regs.words;
            })?;

        // Short flexpage send or register-only message
        let smsg = match regs.desc.msg {
            Some(msg) => msg,
            None => return Ok(()),
        };
        let rmsg = rcv_desc.msg.ok_or(IpcError::MsgCut)?;

        // Receiver buffer is in window 0 after the header reads; the
        // mapping may have suspended us
        self.paired()?;

        let count = send.dwords.min(rcv_size.dwords) as usize;
        for i in 0..count {
            let word = self.read_own_word(dword_addr(smsg, i))?;
            self.poke_partner(WindowId::Message, dword_addr(rmsg, i), word)?;
            self.dope.dwords += 1;
        }
        self.ipc.counters.words.add(count as u64);

        if mapping {
            if let Some(to) = rcv_fpage {
                match self.map_buffer_fpages(smsg, count, to) {
                    Ok(()) => {}
                    Err(IpcError::MapFailed) => self.dope.combine(IpcError::MapFailed),
                    Err(e) => return Err(e),
                }
            }
        }

        if send.dwords > rcv_size.dwords {
            debug!("cut {} of {} direct words", send.dwords - rcv_size.dwords, send.dwords);
            self.dope.combine(IpcError::MsgCut);
        }

        self.transfer_strings(smsg, snd_size, send, rmsg, rcv_size)
    }

    fn reject(&self, side: &str, addr: Address) -> IpcError {
        warn!("{} buffer {:#x} of {:?} outside user space", side, addr, self.sender.handle());
        IpcError::InvalidBuffer
    }

    pub(crate) fn paired(&self) -> Result<(), IpcError> {
        self.ipc.check_paired(self.receiver.handle(), self.sender.handle())
    }

    // ------------------------------------------------------------------------
    // Flexpages
    // ------------------------------------------------------------------------

    fn map_fpage(&mut self, fpage: Flexpage, to: Flexpage, offset: Address) -> Result<(), IpcError> {
        match self
            .ipc
            .mapper
            .fpage_map(self.sender.space(), fpage, self.receiver.space(), to, offset)
        {
            Ok(rights) => {
                trace!("flexpage {:#x} mapped with {:?}", fpage.raw(), rights);
                self.dope.fpage_received = true;
                self.ipc.counters.fpages.inc();
                Ok(())
            }
            Err(e) => {
                warn!("flexpage {:#x} not mapped: {}", fpage.raw(), e);
                Err(IpcError::MapFailed)
            }
        }
    }

    /// Map (offset, flexpage) pairs from the delivered direct words until
    /// the first invalid flexpage
    fn map_buffer_fpages(&mut self, msg: Address, count: usize, to: Flexpage) -> Result<(), IpcError> {
        let mut i = 0;
        while i + 1 < count {
            let offset = self.read_own_word(dword_addr(msg, i))?;
            let fpage = Flexpage::from_raw(self.read_own_word(dword_addr(msg, i + 1))?);
            if !fpage.is_valid() {
                break;
            }
            self.map_fpage(fpage, to, offset)?;
            i += 2;
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Sender memory
    // ------------------------------------------------------------------------

    /// Read from the sender's own buffer, paging in through its pager
    pub(crate) fn read_own(&self, addr: Address, buf: &mut [u8]) -> Result<(), IpcError> {
        let space = self.sender.space();
        let mut retries = 0;
        loop {
            let fault = match copyin(self.ipc.spaces, space, addr, buf) {
                Ok(()) => return Ok(()),
                Err(fault) => self.ipc.checkpoint(fault)?,
            };
            if retries == self.ipc.config.max_fault_retries {
                return Err(IpcError::SndPfTimeout);
            }
            retries += 1;

            debug!("sender {:?} faults at {:#x}", self.sender.handle(), fault.addr);
            self.ipc
                .pager
                .page_in(space, fault.addr, fault.access)
                .map_err(PagerError::for_sender)?;
            self.paired()?;
        }
    }

    pub(crate) fn read_own_word(&self, addr: Address) -> Result<Mword, IpcError> {
        let mut bytes = [0u8; WORD_SIZE];
        self.read_own(addr, &mut bytes)?;
        Ok(Mword::from_ne_bytes(bytes))
    }

    // ------------------------------------------------------------------------
    // Receiver memory
    // ------------------------------------------------------------------------

    /// Run `access` against window `id` pointed at `[addr, addr + len)`,
    /// resolving window faults until it succeeds
    fn with_window<T>(
        &self,
        id: WindowId,
        addr: Address,
        len: usize,
        mut access: impl FnMut(&WindowSet, Address) -> Result<T, Fault>,
    ) -> Result<T, IpcError> {
        let ipc = self.ipc;
        let space = self.receiver.space();
        let mut retries = 0;
        loop {
            let result = {
                let mut windows = self.sender.windows.lock();
                let (kaddr, outcome) = windows.map(id, space, addr, len, ipc.spaces.generation(space));
                ipc.note_map(id, addr, outcome);
                access(&*windows, kaddr)
            };
            let fault = match result {
                Ok(value) => return Ok(value),
                Err(fault) => ipc.checkpoint(fault)?,
            };
            if retries == ipc.config.max_fault_retries {
                return Err(IpcError::RcvPfTimeout);
            }
            retries += 1;
            ipc.handle_window_fault(self.sender.handle(), fault)?;
        }
    }

    pub(crate) fn peek_partner(&self, id: WindowId, addr: Address) -> Result<Mword, IpcError> {
        let spaces = self.ipc.spaces;
        self.with_window(id, addr, WORD_SIZE, |windows, kaddr| windows.peek_word(spaces, kaddr))
    }

    pub(crate) fn poke_partner(&self, id: WindowId, addr: Address, value: Mword) -> Result<(), IpcError> {
        let spaces = self.ipc.spaces;
        self.with_window(id, addr, WORD_SIZE, |windows, kaddr| {
            windows.poke_word(spaces, kaddr, value)
        })
    }

    pub(crate) fn write_partner(&self, id: WindowId, addr: Address, buf: &[u8]) -> Result<(), IpcError> {
        let spaces = self.ipc.spaces;
        self.with_window(id, addr, buf.len(), |windows, kaddr| {
            windows.write_bytes(spaces, kaddr, buf)
        })
    }
}
