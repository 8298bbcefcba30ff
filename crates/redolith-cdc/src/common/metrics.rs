//! Engine-level counters.
//!
//! Lock-free atomics updated on the hot path; `snapshot()` gives a
//! consistent-enough view for scraping or logging.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters maintained by the replicator.
#[derive(Debug, Default)]
pub struct ReplicatorMetrics {
    /// Committed transactions handed to the builder.
    pub transactions_commit_out: AtomicU64,
    /// Rolled-back transactions handed to the builder.
    pub transactions_rollback_out: AtomicU64,
    /// Archived redo logs fully parsed.
    pub archives_processed: AtomicU64,
    /// Online log switches observed.
    pub log_switches: AtomicU64,
    /// Watermark-gated emission rounds.
    pub watermark_drains: AtomicU64,
}

impl ReplicatorMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn emit_commit_out(&self, count: u64) {
        self.transactions_commit_out
            .fetch_add(count, Ordering::Relaxed);
    }

    pub fn emit_rollback_out(&self, count: u64) {
        self.transactions_rollback_out
            .fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_archive(&self) {
        self.archives_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_log_switch(&self) {
        self.log_switches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_drain(&self) {
        self.watermark_drains.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            transactions_commit_out: self.transactions_commit_out.load(Ordering::Relaxed),
            transactions_rollback_out: self.transactions_rollback_out.load(Ordering::Relaxed),
            archives_processed: self.archives_processed.load(Ordering::Relaxed),
            log_switches: self.log_switches.load(Ordering::Relaxed),
            watermark_drains: self.watermark_drains.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of [`ReplicatorMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub transactions_commit_out: u64,
    pub transactions_rollback_out: u64,
    pub archives_processed: u64,
    pub log_switches: u64,
    pub watermark_drains: u64,
}
