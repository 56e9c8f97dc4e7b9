use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// # Write Buffer Stats
///
/// Lock-free counters updated by submitters and the worker. `Relaxed` is
/// enough: each counter is read on its own, nothing is synchronised through it.
#[derive(Debug, Default)]
pub struct WriteBufferStats {
    accepted: AtomicU64,
    duplicates: AtomicU64,
    rejected_overload: AtomicU64,
    written: AtomicU64,
    dropped: AtomicU64,
    failed_flushes: AtomicU64,
    pending: AtomicU64,
}

/// Point-in-time copy of [`WriteBufferStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WriteBufferSnapshot {
    /// Readings queued for writing.
    pub accepted: u64,
    /// Readings acknowledged as duplicates and not queued.
    pub duplicates: u64,
    /// Submissions refused because the queue stayed full.
    pub rejected_overload: u64,
    /// Readings confirmed written.
    pub written: u64,
    /// Readings given up on: rejected or left out by the store, or evicted
    /// from pending.
    pub dropped: u64,
    /// Flushes that ran out of retries.
    pub failed_flushes: u64,
    /// Readings held by the worker, not yet written.
    pub pending: u64,
}

impl WriteBufferStats {
    pub(crate) fn add_accepted(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_duplicate(&self) {
        self.duplicates.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_rejected_overload(&self) {
        self.rejected_overload.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_written(&self, n: usize) {
        self.written.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub(crate) fn add_dropped(&self, n: usize) {
        self.dropped.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub(crate) fn add_failed_flush(&self) {
        self.failed_flushes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn set_pending(&self, n: usize) {
        self.pending.store(n as u64, Ordering::Relaxed);
    }

    /// Reads every counter.
    pub fn snapshot(&self) -> WriteBufferSnapshot {
        WriteBufferSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            rejected_overload: self.rejected_overload.load(Ordering::Relaxed),
            written: self.written.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            failed_flushes: self.failed_flushes.load(Ordering::Relaxed),
            pending: self.pending.load(Ordering::Relaxed),
        }
    }
}
