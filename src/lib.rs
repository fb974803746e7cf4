//! Long IPC - cross-address-space message transfer for an L4-style microkernel
//!
//! This crate implements the long-message part of synchronous IPC: copying
//! direct words and indirect strings between two protected address spaces
//! through temporary VM windows, installing flexpage grants, resolving page
//! faults that hit the partner's memory mid-copy, and finalizing both sides
//! exactly once, also when either side is cancelled.
//!
//! Scheduling, address-space management, the short-IPC handshake and the
//! page-table primitives are collaborators behind traits
//! ([`kern::Scheduler`], [`vm::AddressSpaces`], [`vm::FlexpageMapper`],
//! [`ipc::Pager`]).

#![cfg_attr(not(any(test, feature = "std")), no_std)]

extern crate alloc;

// Core types
pub mod config;
pub mod types;

pub mod ipc;
pub mod kern;
pub mod vm;

pub use config::LongIpcConfig;
pub use ipc::{IpcError, LongIpc, MsgDope};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
