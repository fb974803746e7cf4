//! Long-IPC Performance Counters
//!
//! Atomic event counters for the paths through the transfer engine. They
//! are cheap enough to stay enabled and are the first thing to look at when
//! a workload suddenly starts faulting on every message.
//!
//! ## Counter Categories
//!
//! - **Transfer**: started, finished, aborted, cut
//! - **Window**: remaps, cache revivals, window faults
//! - **Page-in**: faults resolved from the partner, page-in requests, yields

use core::sync::atomic::{AtomicU64, Ordering};

// ============================================================================
// Counter Type
// ============================================================================

/// Event counter (atomically updated)
#[derive(Debug, Default)]
pub struct IpcCounter {
    value: AtomicU64,
}

impl IpcCounter {
    /// Create a new counter
    pub const fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    /// Increment counter by 1
    #[inline]
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment counter by n
    #[inline]
    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    /// Get current value
    #[inline]
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

// ============================================================================
// Counter Group
// ============================================================================

/// All counters of one engine instance
#[derive(Debug)]
pub struct IpcCounters {
    pub transfers: IpcCounter,
    pub completed: IpcCounter,
    pub aborted: IpcCounter,
    pub cut: IpcCounter,
    pub words: IpcCounter,
    pub string_bytes: IpcCounter,
    pub fpages: IpcCounter,
    pub window_maps: IpcCounter,
    pub window_revivals: IpcCounter,
    pub window_faults: IpcCounter,
    pub faults_from_partner: IpcCounter,
    pub pagein_requests: IpcCounter,
    pub pagein_yields: IpcCounter,
    pub unexpected_faults: IpcCounter,
}

impl IpcCounters {
    pub const fn new() -> Self {
        Self {
            transfers: IpcCounter::new(),
            completed: IpcCounter::new(),
            aborted: IpcCounter::new(),
            cut: IpcCounter::new(),
            words: IpcCounter::new(),
            string_bytes: IpcCounter::new(),
            fpages: IpcCounter::new(),
            window_maps: IpcCounter::new(),
            window_revivals: IpcCounter::new(),
            window_faults: IpcCounter::new(),
            faults_from_partner: IpcCounter::new(),
            pagein_requests: IpcCounter::new(),
            pagein_yields: IpcCounter::new(),
            unexpected_faults: IpcCounter::new(),
        }
    }

    /// Capture the current values
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            transfers: self.transfers.get(),
            completed: self.completed.get(),
            aborted: self.aborted.get(),
            cut: self.cut.get(),
            words: self.words.get(),
            string_bytes: self.string_bytes.get(),
            fpages: self.fpages.get(),
            window_maps: self.window_maps.get(),
            window_revivals: self.window_revivals.get(),
            window_faults: self.window_faults.get(),
            faults_from_partner: self.faults_from_partner.get(),
            pagein_requests: self.pagein_requests.get(),
            pagein_yields: self.pagein_yields.get(),
            unexpected_faults: self.unexpected_faults.get(),
        }
    }
}

impl Default for IpcCounters {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of [`IpcCounters`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub transfers: u64,
    pub completed: u64,
    pub aborted: u64,
    pub cut: u64,
    pub words: u64,
    pub string_bytes: u64,
    pub fpages: u64,
    pub window_maps: u64,
    pub window_revivals: u64,
    pub window_faults: u64,
    pub faults_from_partner: u64,
    pub pagein_requests: u64,
    pub pagein_yields: u64,
    pub unexpected_faults: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_basic() {
        let counter = IpcCounter::new();
        assert_eq!(counter.get(), 0);

        counter.inc();
        counter.add(4);
        assert_eq!(counter.get(), 5);
    }

    #[test]
    fn test_snapshot() {
        let counters = IpcCounters::new();
        assert_eq!(counters.snapshot(), CounterSnapshot::default());

        counters.pagein_requests.inc();
        counters.words.add(3);

        let snapshot = counters.snapshot();
        assert_eq!(snapshot.words, 3);
        assert_eq!(snapshot.pagein_requests, 1);
        assert_eq!(snapshot.transfers, 0);
    }
}
