//! Request counters shared by all workers

use serde::Serialize;
use shmcache_core::Outcome;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct DaemonStats {
    served: AtomicU64,
    not_found: AtomicU64,
    failed: AtomicU64,
    aborted: AtomicU64,
    bytes: AtomicU64,
}

/// Point-in-time copy of [`DaemonStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub served: u64,
    pub not_found: u64,
    pub failed: u64,
    pub aborted: u64,
    pub bytes: u64,
}

impl StatsSnapshot {
    /// Requests that reached a final status
    pub fn total(&self) -> u64 {
        self.served + self.not_found + self.failed + self.aborted
    }
}

impl DaemonStats {
    pub fn record(&self, outcome: Outcome, bytes: u64) {
        let counter = match outcome {
            Outcome::Ok => &self.served,
            Outcome::NotFound => &self.not_found,
            Outcome::TransferFailed => &self.failed,
            Outcome::Aborted => &self.aborted,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            served: self.served.load(Ordering::Relaxed),
            not_found: self.not_found.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            aborted: self.aborted.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_counts_by_outcome() {
        let stats = DaemonStats::default();
        stats.record(Outcome::Ok, 5000);
        stats.record(Outcome::Ok, 12);
        stats.record(Outcome::NotFound, 0);
        stats.record(Outcome::Aborted, 1024);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.served, 2);
        assert_eq!(snapshot.not_found, 1);
        assert_eq!(snapshot.failed, 0);
        assert_eq!(snapshot.bytes, 6036);
        assert_eq!(snapshot.total(), 4);
    }
}
