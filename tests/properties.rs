//! Property tests for direct-word truncation and string clipping

mod common;

use common::Env;
use long_ipc::ipc::message::{dword_addr, MsgSize, RcvDescriptor, SendRegs, StringDope};
use long_ipc::ipc::IpcError;
use long_ipc::types::{Address, Mword, PAGE_SIZE};
use proptest::prelude::*;

const SMSG: Address = 0x10000;
const RMSG: Address = 0x20000;
const SRC: Address = 0x40000;
const DST: Address = 0x100000;

/// More pages than a window caches at once
const STRING_PAGES: usize = 80;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_words_transferred_is_min(s in 0u32..48, r in 0u32..48) {
        let env = Env::new();
        let snd = env.thread();
        let rcv = env.thread();
        env.map_rw(snd, SMSG, PAGE_SIZE);
        env.map_rw(rcv, RMSG, PAGE_SIZE);

        let words: Vec<Mword> = (1..=s as Mword).collect();
        env.send_buffer(snd, SMSG, MsgSize::new(s, 0), MsgSize::new(s, 0), &words, &[]);
        env.rcv_buffer(rcv, RMSG, MsgSize::new(r, 0), 0, &[]);

        let (sent, received) =
            env.transfer(snd, rcv, RcvDescriptor::long(RMSG), &SendRegs::long(SMSG, [0; 2]));

        let n = s.min(r);
        prop_assert_eq!(sent.dwords, n);
        prop_assert_eq!(received.dwords, n);
        prop_assert_eq!(sent.error == Some(IpcError::MsgCut), s > r);
        prop_assert_eq!(sent.error.is_none(), s <= r);
        for i in 0..n as usize {
            prop_assert_eq!(env.peek(rcv, dword_addr(RMSG, i)), i as Mword + 1);
        }
        if r > n {
            prop_assert_eq!(env.peek(rcv, dword_addr(RMSG, n as usize)), 0);
        }
    }

    #[test]
    fn prop_string_copy_is_clipped_to_min(
        a in 0usize..STRING_PAGES * PAGE_SIZE,
        b in 0usize..STRING_PAGES * PAGE_SIZE,
        offset in 0usize..PAGE_SIZE,
    ) {
        let env = Env::new();
        let snd = env.thread();
        let rcv = env.thread();
        env.map_rw(snd, SMSG, PAGE_SIZE);
        env.map_rw(rcv, RMSG, PAGE_SIZE);
        env.map_rw(snd, SRC, STRING_PAGES * PAGE_SIZE);

        let data: Vec<u8> = (0..a).map(|i| (i % 251) as u8 + 1).collect();
        env.write(snd, SRC, &data);

        let size = MsgSize::new(0, 1);
        let dope = StringDope { snd_size: a, snd_str: SRC, ..StringDope::default() };
        env.send_buffer(snd, SMSG, size, size, &[], &[dope]);
        // Destination pages are faulted in through the receiver on demand
        env.rcv_buffer(rcv, RMSG, size, 0, &[(b, DST + offset)]);

        let (sent, received) =
            env.transfer(snd, rcv, RcvDescriptor::long(RMSG), &SendRegs::long(SMSG, [0; 2]));

        let n = a.min(b);
        prop_assert_eq!(received.strings, 1);
        prop_assert_eq!(env.rcv_string(rcv, RMSG, size, 0).snd_size, n);
        prop_assert_eq!(sent.error == Some(IpcError::MsgCut), a > b);
        prop_assert_eq!(env.counters.string_bytes.get(), n as u64);
        if n > 0 {
            prop_assert_eq!(env.read(rcv, DST + offset, n), data[..n].to_vec());
        }
    }
}
