//! Shared harness for the long-IPC integration tests
//!
//! Provides a cooperative scheduler that "runs" the hinted partner by
//! serving its page-in requests, an on-demand pager backed by the in-memory
//! space table, and helpers to lay out message buffers.

#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::sync::Arc;

use long_ipc::ipc::message::{
    dword_addr, header_addr, string_dope_addr, MsgSize, RcvDescriptor, SendRegs, StringDope,
    FPAGE_WORD, SEND_WORD, SIZE_WORD,
};
use long_ipc::ipc::{LongIpc, MsgDope, Pager, PagerError};
use long_ipc::kern::{IpcCounters, Scheduler, ThreadHandle, ThreadTable};
use long_ipc::types::{trunc_page, Access, Address, Mword, SpaceId, PAGE_SIZE, WORD_SIZE};
use long_ipc::vm::{
    copyin, copyin_word, copyout, copyout_word, AddressSpaces, Rights, SpaceTable, WindowId,
};
use long_ipc::LongIpcConfig;

/// Yields after which a test is considered hung
const MAX_YIELDS: usize = 1000;

pub type Hook = Box<dyn FnMut(&LongIpc<'_>, ThreadHandle, usize)>;

// ============================================================================
// Scheduler
// ============================================================================

/// Cooperative scheduler for tests
///
/// Without a hook, `schedule` runs the most recently hinted other thread,
/// which for a blocked sender means its receiver serves the page-in. Every
/// yield checks that the yielding thread has torn down its windows.
pub struct TestScheduler {
    yields: Cell<usize>,
    hints: RefCell<Vec<ThreadHandle>>,
    hook: RefCell<Option<Hook>>,
}

impl TestScheduler {
    pub fn new() -> Self {
        Self {
            yields: Cell::new(0),
            hints: RefCell::new(Vec::new()),
            hook: RefCell::new(None),
        }
    }

    /// Replace the default partner run with `hook(ipc, current, yield_number)`
    pub fn set_hook(&self, hook: impl FnMut(&LongIpc<'_>, ThreadHandle, usize) + 'static) {
        *self.hook.borrow_mut() = Some(Box::new(hook));
    }

    pub fn yields(&self) -> usize {
        self.yields.get()
    }
}

impl Scheduler for TestScheduler {
    fn schedule(&self, ipc: &LongIpc<'_>, current: ThreadHandle) {
        let n = self.yields.get() + 1;
        self.yields.set(n);
        assert!(n < MAX_YIELDS, "scheduler spinning on {:?}", current);
        if let Some(thread) = ipc.threads.get(current) {
            let windows = thread.windows.lock();
            for id in WindowId::ALL {
                assert!(!windows.window(id).is_live(), "{:?} yields with live {:?} window", current, id);
            }
        }

        if let Some(hook) = self.hook.borrow_mut().as_mut() {
            hook(ipc, current, n);
            return;
        }

        let partner = self.hints.borrow().iter().rev().copied().find(|h| *h != current);
        if let Some(partner) = partner {
            let _ = ipc.serve_pagein(partner);
        }
    }

    fn set_switch_hint(&self, target: ThreadHandle) {
        self.hints.borrow_mut().push(target);
    }
}

// ============================================================================
// Pager
// ============================================================================

/// Maps fresh read-write memory for every fault, except on pages set up to fail
pub struct OnDemandPager {
    spaces: Arc<SpaceTable>,
    failures: RefCell<BTreeMap<(SpaceId, Address), PagerError>>,
    calls: Cell<usize>,
}

impl OnDemandPager {
    pub fn new(spaces: Arc<SpaceTable>) -> Self {
        Self {
            spaces,
            failures: RefCell::new(BTreeMap::new()),
            calls: Cell::new(0),
        }
    }

    pub fn fail_at(&self, space: SpaceId, addr: Address, error: PagerError) {
        self.failures.borrow_mut().insert((space, trunc_page(addr)), error);
    }

    pub fn calls(&self) -> usize {
        self.calls.get()
    }
}

impl Pager for OnDemandPager {
    fn page_in(&self, space: SpaceId, addr: Address, _access: Access) -> Result<(), PagerError> {
        self.calls.set(self.calls.get() + 1);
        if let Some(error) = self.failures.borrow().get(&(space, trunc_page(addr))) {
            return Err(*error);
        }

        let rw = Rights::READ | Rights::WRITE;
        let result = match self.spaces.lookup(space, addr) {
            Some(pte) => self.spaces.map(space, addr, pte.frame, rw),
            None => self.spaces.map_anonymous(space, trunc_page(addr), PAGE_SIZE, rw),
        };
        result.map_err(|_| PagerError::Rejected)
    }
}

// ============================================================================
// Environment
// ============================================================================

pub struct Env {
    pub threads: ThreadTable,
    pub spaces: Arc<SpaceTable>,
    pub pager: OnDemandPager,
    pub sched: TestScheduler,
    pub counters: IpcCounters,
    pub config: LongIpcConfig,
}

impl Env {
    pub fn new() -> Self {
        Self::with_config(LongIpcConfig::new())
    }

    pub fn with_config(config: LongIpcConfig) -> Self {
        let spaces = Arc::new(SpaceTable::with_config(&config));
        Self {
            threads: ThreadTable::new(),
            pager: OnDemandPager::new(spaces.clone()),
            spaces,
            sched: TestScheduler::new(),
            counters: IpcCounters::new(),
            config,
        }
    }

    pub fn ipc(&self) -> LongIpc<'_> {
        LongIpc::new(
            &self.threads,
            &*self.spaces,
            &*self.spaces,
            &self.pager,
            &self.sched,
            &self.counters,
        )
        .with_config(self.config)
    }

    /// New thread in a new address space
    pub fn thread(&self) -> ThreadHandle {
        let space = self.spaces.create_space();
        self.threads.create(space)
    }

    pub fn space_of(&self, thread: ThreadHandle) -> SpaceId {
        self.threads.get(thread).expect("live thread").space()
    }

    pub fn map_rw(&self, thread: ThreadHandle, addr: Address, len: usize) {
        self.spaces
            .map_anonymous(self.space_of(thread), addr, len, Rights::READ | Rights::WRITE)
            .expect("map");
    }

    pub fn unmap(&self, thread: ThreadHandle, addr: Address) {
        self.spaces.unmap(self.space_of(thread), addr);
    }

    pub fn is_mapped(&self, thread: ThreadHandle, addr: Address) -> bool {
        self.spaces.lookup(self.space_of(thread), addr).is_some()
    }

    pub fn poke(&self, thread: ThreadHandle, addr: Address, value: Mword) {
        copyout_word(&*self.spaces, self.space_of(thread), addr, value).expect("mapped word");
    }

    pub fn peek(&self, thread: ThreadHandle, addr: Address) -> Mword {
        copyin_word(&*self.spaces, self.space_of(thread), addr).expect("mapped word")
    }

    pub fn write(&self, thread: ThreadHandle, addr: Address, bytes: &[u8]) {
        copyout(&*self.spaces, self.space_of(thread), addr, bytes).expect("mapped bytes");
    }

    pub fn read(&self, thread: ThreadHandle, addr: Address, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        copyin(&*self.spaces, self.space_of(thread), addr, &mut buf).expect("mapped bytes");
        buf
    }

    /// Lay out a send buffer at `msg`; the pages must be mapped
    pub fn send_buffer(
        &self,
        thread: ThreadHandle,
        msg: Address,
        size: MsgSize,
        send: MsgSize,
        words: &[Mword],
        strings: &[StringDope],
    ) {
        self.poke(thread, header_addr(msg, FPAGE_WORD), 0);
        self.poke(thread, header_addr(msg, SIZE_WORD), size.raw());
        self.poke(thread, header_addr(msg, SEND_WORD), send.raw());
        for (i, word) in words.iter().enumerate() {
            self.poke(thread, dword_addr(msg, i), *word);
        }
        for (i, dope) in strings.iter().enumerate() {
            for (j, word) in dope.to_words().iter().enumerate() {
                self.poke(thread, string_dope_addr(msg, size, i) + j * WORD_SIZE, *word);
            }
        }
    }

    /// Lay out a receive buffer at `msg`; the header pages must be mapped
    pub fn rcv_buffer(
        &self,
        thread: ThreadHandle,
        msg: Address,
        size: MsgSize,
        fpage: Mword,
        strings: &[(usize, Address)],
    ) {
        self.poke(thread, header_addr(msg, FPAGE_WORD), fpage);
        self.poke(thread, header_addr(msg, SIZE_WORD), size.raw());
        self.poke(thread, header_addr(msg, SEND_WORD), 0);
        for (i, (len, addr)) in strings.iter().enumerate() {
            let dope = StringDope {
                snd_size: 0,
                snd_str: 0,
                rcv_size: *len,
                rcv_str: *addr,
            };
            for (j, word) in dope.to_words().iter().enumerate() {
                self.poke(thread, string_dope_addr(msg, size, i) + j * WORD_SIZE, *word);
            }
        }
    }

    /// Receiver's string dope `index` as written back by the transfer
    pub fn rcv_string(&self, thread: ThreadHandle, msg: Address, size: MsgSize, index: usize) -> StringDope {
        let base = string_dope_addr(msg, size, index);
        StringDope::from_words(core::array::from_fn(|j| self.peek(thread, base + j * WORD_SIZE)))
    }

    /// Pair, transfer and collect both sides' results
    pub fn transfer(
        &self,
        sender: ThreadHandle,
        receiver: ThreadHandle,
        desc: RcvDescriptor,
        regs: &SendRegs,
    ) -> (MsgDope, MsgDope) {
        let ipc = self.ipc();
        ipc.commit_long_pair(sender, receiver, desc).expect("pair");
        let sent = ipc.do_long_transfer(sender, receiver, regs);
        let received = ipc.await_long_receive(receiver);
        (sent, received)
    }
}
