//! Process-wide DGC counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Statistics about protocol activity
///
/// All counters are atomic and can be read at any time without locking.
#[derive(Debug, Default)]
pub struct DgcStats {
    /// Scheduler epochs run
    pub epochs: AtomicU64,
    /// Epochs that took longer than the tick period
    pub overruns: AtomicU64,
    /// Messages produced by collector ticks
    pub messages: AtomicU64,
    /// Batches delivered in-process
    pub local_batches: AtomicU64,
    /// Batches handed to the remote transport
    pub remote_batches: AtomicU64,
    /// Remote sends skipped because one was already in flight
    pub dropped_sends: AtomicU64,
    /// Batches whose delivery failed
    pub failed_sends: AtomicU64,
    /// Objects finalized as acyclic garbage
    pub acyclic: AtomicU64,
    /// Objects finalized as cyclic garbage
    pub cyclic: AtomicU64,
}

impl DgcStats {
    /// Create new empty stats
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn bump(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }

    /// Get snapshot of current stats
    pub fn snapshot(&self) -> DgcStatsSnapshot {
        DgcStatsSnapshot {
            epochs: self.epochs.load(Ordering::Relaxed),
            overruns: self.overruns.load(Ordering::Relaxed),
            messages: self.messages.load(Ordering::Relaxed),
            local_batches: self.local_batches.load(Ordering::Relaxed),
            remote_batches: self.remote_batches.load(Ordering::Relaxed),
            dropped_sends: self.dropped_sends.load(Ordering::Relaxed),
            failed_sends: self.failed_sends.load(Ordering::Relaxed),
            acyclic: self.acyclic.load(Ordering::Relaxed),
            cyclic: self.cyclic.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time snapshot of DGC statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DgcStatsSnapshot {
    pub epochs: u64,
    pub overruns: u64,
    pub messages: u64,
    pub local_batches: u64,
    pub remote_batches: u64,
    pub dropped_sends: u64,
    pub failed_sends: u64,
    pub acyclic: u64,
    pub cyclic: u64,
}

impl DgcStatsSnapshot {
    /// Objects collected so far
    pub fn collected(&self) -> u64 {
        self.acyclic + self.cyclic
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot() {
        let stats = DgcStats::new();
        DgcStats::bump(&stats.acyclic, 2);
        DgcStats::bump(&stats.cyclic, 3);
        DgcStats::bump(&stats.epochs, 1);
        let snap = stats.snapshot();
        assert_eq!(snap.epochs, 1);
        assert_eq!(snap.collected(), 5);
    }
}
