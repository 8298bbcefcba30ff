//! Committed-transaction buffering with deferred, watermark-gated
//! emission.
//!
//! In single-thread capture a committed transaction can be flushed the
//! moment its commit record is parsed. With multiple redo threads the
//! commit order across threads is only known up to the SCN watermark, so
//! commits are parked here and drained in `(lwn_scn, commit_scn)` order
//! once the watermark passes them.

use crate::common::error::Result;
use crate::common::types::Scn;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

/// Downstream serializer the engine hands committed transactions to.
#[async_trait]
pub trait Builder: Send + Sync {
    /// The serializer's current Log Write Number index. Used together
    /// with the checkpoint to tell replayed data from new data.
    fn lwn_idx(&self) -> u64;
}

/// A parsed transaction ready to be serialized.
///
/// The buffer owns the transaction until emission; the emitter flushes
/// it, purges it, and drops it.
#[async_trait]
pub trait RedoTransaction: Send {
    /// Serialize the transaction through the builder.
    async fn flush(&mut self, builder: &dyn Builder, lwn_scn: Scn) -> Result<()>;

    /// Release pooled resources. Called exactly once, after `flush`.
    fn purge(&mut self);

    /// Buffered size in bytes, for the memory high-water mark.
    fn size(&self) -> u64;
}

/// A committed transaction parked for ordered emission.
pub struct CommittedTransaction {
    pub transaction: Box<dyn RedoTransaction>,
    /// SCN of the LWN boundary that completed the commit.
    pub lwn_scn: Scn,
    pub commit_scn: Scn,
    pub rollback: bool,
    /// Debug transactions can request a replicator shutdown.
    pub shutdown: bool,
}

impl std::fmt::Debug for CommittedTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommittedTransaction")
            .field("lwn_scn", &self.lwn_scn)
            .field("commit_scn", &self.commit_scn)
            .field("rollback", &self.rollback)
            .field("shutdown", &self.shutdown)
            .finish()
    }
}

/// Buffer of committed transactions awaiting emission.
///
/// Only the deferral surface lives here; chunk pooling for in-flight
/// (uncommitted) transactions belongs to the parser layer.
#[derive(Default)]
pub struct TransactionBuffer {
    defer_committed: AtomicBool,
    /// Keyed by `(lwn_scn, commit_scn, arrival)` so drains come out in
    /// emission order even when two commits share an LWN boundary.
    pending: Mutex<BTreeMap<(Scn, Scn, u64), CommittedTransaction>>,
    arrival: AtomicU64,
    pending_bytes: AtomicU64,
}

impl TransactionBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable commit deferral. Enabled only while the
    /// multi-thread online path runs.
    pub fn set_defer_committed(&self, defer: bool) {
        self.defer_committed.store(defer, Ordering::SeqCst);
    }

    pub fn defer_committed(&self) -> bool {
        self.defer_committed.load(Ordering::SeqCst)
    }

    /// Park a committed transaction until the watermark passes it.
    pub fn push_committed(&self, committed: CommittedTransaction) {
        let arrival = self.arrival.fetch_add(1, Ordering::Relaxed);
        self.pending_bytes
            .fetch_add(committed.transaction.size(), Ordering::Relaxed);
        let key = (committed.lwn_scn, committed.commit_scn, arrival);
        self.pending
            .lock()
            .expect("transaction buffer poisoned")
            .insert(key, committed);
    }

    /// Number of transactions currently parked.
    pub fn committed_pending(&self) -> usize {
        self.pending
            .lock()
            .expect("transaction buffer poisoned")
            .len()
    }

    /// Total buffered bytes currently parked.
    pub fn pending_bytes(&self) -> u64 {
        self.pending_bytes.load(Ordering::Relaxed)
    }

    /// Remove and return every transaction with `lwn_scn` strictly below
    /// the watermark, in ascending `(lwn_scn, commit_scn)` order.
    ///
    /// A `NONE` watermark drains nothing: no thread has produced an LWN
    /// boundary yet, so nothing is provably safe to emit.
    pub fn drain_pending_below(&self, watermark: Scn) -> Vec<CommittedTransaction> {
        if watermark.is_none() {
            return Vec::new();
        }
        let mut pending = self.pending.lock().expect("transaction buffer poisoned");
        let keep = pending.split_off(&(watermark, Scn::ZERO, 0));
        let drained: Vec<CommittedTransaction> =
            std::mem::replace(&mut *pending, keep).into_values().collect();
        let released: u64 = drained.iter().map(|ct| ct.transaction.size()).sum();
        self.pending_bytes.fetch_sub(released, Ordering::Relaxed);
        drained
    }

    /// Drop everything still parked. Called on shutdown after the final
    /// drain; anything left here was never safe to emit.
    pub fn purge(&self) {
        let mut pending = self.pending.lock().expect("transaction buffer poisoned");
        for (_, mut committed) in std::mem::take(&mut *pending) {
            committed.transaction.purge();
        }
        self.pending_bytes.store(0, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for TransactionBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionBuffer")
            .field("defer_committed", &self.defer_committed())
            .field("committed_pending", &self.committed_pending())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Minimal transaction for buffer tests.
    #[derive(Debug)]
    pub struct NoopTransaction {
        pub size: u64,
        pub purged: bool,
    }

    #[async_trait]
    impl RedoTransaction for NoopTransaction {
        async fn flush(&mut self, _builder: &dyn Builder, _lwn_scn: Scn) -> Result<()> {
            Ok(())
        }

        fn purge(&mut self) {
            self.purged = true;
        }

        fn size(&self) -> u64 {
            self.size
        }
    }

    pub fn committed(lwn: u64, commit: u64) -> CommittedTransaction {
        CommittedTransaction {
            transaction: Box::new(NoopTransaction {
                size: 64,
                purged: false,
            }),
            lwn_scn: Scn::new(lwn),
            commit_scn: Scn::new(commit),
            rollback: false,
            shutdown: false,
        }
    }
}
