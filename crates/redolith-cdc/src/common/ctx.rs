//! Shared runtime context for the replicator and its worker tasks.
//!
//! Cancellation is cooperative: every loop polls [`Ctx::is_shutdown`] at
//! its head, and every sleep goes through [`Ctx::sleep`] so a shutdown
//! wakes sleepers immediately instead of waiting out the interval.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::info;

/// Diagnostic trace channels, off by default.
///
/// These correspond to the operator-facing trace switches of the original
/// product; each one gates a family of `tracing` debug events.
#[derive(Debug, Clone, Copy, Default)]
pub struct TraceChannels {
    /// Task start/stop lifecycles.
    pub threads: bool,
    /// Redo selection and parse dispatch decisions.
    pub redo: bool,
    /// Archive discovery scans.
    pub archive_list: bool,
    /// Path mapping registration and application.
    pub file: bool,
}

/// Runtime context shared by the controller, readers, and emission path.
#[derive(Debug)]
pub struct Ctx {
    soft_shutdown: AtomicBool,
    hard_shutdown: AtomicBool,
    replicator_finished: AtomicBool,
    shutdown_notify: Notify,

    /// Remaining log switches before a requested stop; 0 = unlimited.
    stop_log_switches: AtomicU32,
    /// Remaining emitted transactions before a requested stop; 0 = unlimited.
    stop_transactions: AtomicU32,

    /// High-water mark of buffered transaction memory, in bytes.
    memory_hwm: AtomicU64,

    pub traces: TraceChannels,
}

impl Ctx {
    pub fn new(stop_log_switches: u32, stop_transactions: u32, traces: TraceChannels) -> Self {
        Ctx {
            soft_shutdown: AtomicBool::new(false),
            hard_shutdown: AtomicBool::new(false),
            replicator_finished: AtomicBool::new(false),
            shutdown_notify: Notify::new(),
            stop_log_switches: AtomicU32::new(stop_log_switches),
            stop_transactions: AtomicU32::new(stop_transactions),
            memory_hwm: AtomicU64::new(0),
            traces,
        }
    }

    /// Request a cooperative stop. Idempotent.
    pub fn stop_soft(&self) {
        self.soft_shutdown.store(true, Ordering::SeqCst);
        self.shutdown_notify.notify_waiters();
    }

    /// Fatal-path stop: implies a soft stop so all loops unwind.
    pub fn stop_hard(&self) {
        self.hard_shutdown.store(true, Ordering::SeqCst);
        self.stop_soft();
    }

    pub fn is_shutdown(&self) -> bool {
        self.soft_shutdown.load(Ordering::SeqCst)
    }

    pub fn is_hard_shutdown(&self) -> bool {
        self.hard_shutdown.load(Ordering::SeqCst)
    }

    /// Sleep for `duration`, returning early if a shutdown is requested.
    pub async fn sleep(&self, duration: Duration) {
        if self.is_shutdown() {
            return;
        }
        tokio::select! {
            _ = self.shutdown_notify.notified() => {}
            _ = tokio::time::sleep(duration) => {}
        }
    }

    /// Count one completed log switch against the `stop_log_switches`
    /// budget. Triggers a soft shutdown on the zero crossing.
    pub fn count_log_switch(&self) {
        if self.countdown(&self.stop_log_switches) {
            info!("shutdown started - exhausted number of log switches");
            self.stop_soft();
        }
    }

    /// Count one emitted transaction against the `stop_transactions`
    /// budget. Triggers a soft shutdown on the zero crossing.
    pub fn count_transaction(&self) {
        if self.countdown(&self.stop_transactions) {
            info!("shutdown started - exhausted number of transactions");
            self.stop_soft();
        }
    }

    fn countdown(&self, counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
                if v > 0 {
                    Some(v - 1)
                } else {
                    None
                }
            })
            .map(|prev| prev == 1)
            .unwrap_or(false)
    }

    /// Record a buffered-memory sample; keeps the peak.
    pub fn record_memory(&self, bytes: u64) {
        self.memory_hwm.fetch_max(bytes, Ordering::Relaxed);
    }

    pub fn memory_hwm(&self) -> u64 {
        self.memory_hwm.load(Ordering::Relaxed)
    }

    pub fn set_replicator_finished(&self) {
        self.replicator_finished.store(true, Ordering::SeqCst);
    }

    pub fn is_replicator_finished(&self) -> bool {
        self.replicator_finished.load(Ordering::SeqCst)
    }
}

impl Default for Ctx {
    fn default() -> Self {
        Ctx::new(0, 0, TraceChannels::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    #[tokio::test]
    async fn sleep_returns_early_on_shutdown() {
        let ctx = Arc::new(Ctx::default());
        let sleeper = ctx.clone();
        let handle = tokio::spawn(async move {
            let start = Instant::now();
            sleeper.sleep(Duration::from_secs(30)).await;
            start.elapsed()
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        ctx.stop_soft();
        let elapsed = handle.await.unwrap();
        assert!(elapsed < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn sleep_is_immediate_after_shutdown() {
        let ctx = Ctx::default();
        ctx.stop_soft();
        let start = Instant::now();
        ctx.sleep(Duration::from_secs(30)).await;
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn log_switch_budget_triggers_shutdown_once() {
        let ctx = Ctx::new(2, 0, TraceChannels::default());
        ctx.count_log_switch();
        assert!(!ctx.is_shutdown());
        ctx.count_log_switch();
        assert!(ctx.is_shutdown());
        // Exhausted budget stays exhausted.
        ctx.count_log_switch();
        assert!(ctx.is_shutdown());
    }

    #[test]
    fn zero_budget_means_unlimited() {
        let ctx = Ctx::default();
        for _ in 0..100 {
            ctx.count_transaction();
        }
        assert!(!ctx.is_shutdown());
    }

    #[test]
    fn memory_hwm_keeps_peak() {
        let ctx = Ctx::default();
        ctx.record_memory(100);
        ctx.record_memory(5000);
        ctx.record_memory(300);
        assert_eq!(ctx.memory_hwm(), 5000);
    }
}
