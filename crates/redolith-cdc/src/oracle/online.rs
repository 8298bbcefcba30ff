//! Online redo log ingestion.
//!
//! The online set holds one parse job per redo group whose file passed
//! its header probe. A single-instance database is followed with a
//! simple poll-parse-switch loop. When the set spans more than one redo
//! thread (a RAC database), ingestion switches to a round-robin over the
//! threads with an SCN watermark: committed transactions are deferred in
//! the transaction buffer and only emitted once every thread has
//! progressed past them, which is the only way to keep the cross-thread
//! commit order intact.
//!
//! The laggard thread always runs first, and a thread that is both ahead
//! of the watermark and sitting on a large deferred backlog is skipped
//! for the cycle. Without that back-pressure a fast thread can park
//! enough committed transactions to exhaust the buffer pool.

use crate::common::ctx::Ctx;
use crate::common::error::{ReplicatorError, Result};
use crate::common::metrics::ReplicatorMetrics;
use crate::common::transaction::{Builder, TransactionBuffer};
use crate::common::types::{FileOffset, Scn, ThreadId};
use crate::oracle::mapping::PathMapper;
use crate::oracle::metadata::Metadata;
use crate::oracle::parser::{ParserFactory, ParserJob, RedoCode};
use crate::oracle::reader::ReaderPool;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// Per-thread ingestion state for the multi-thread path.
#[derive(Debug, Default)]
struct OnlineThreadState {
    /// Index of the thread's active job in the online set.
    active: Option<usize>,
    last_lwn_scn: Scn,
    finished: bool,
    yielded: bool,
}

/// Drives online ingestion for both database topologies.
pub struct OnlineIngestor {
    ctx: Arc<Ctx>,
    metadata: Arc<Metadata>,
    metrics: Arc<ReplicatorMetrics>,
    pool: Arc<ReaderPool>,
    mapper: Arc<PathMapper>,
    factory: Arc<dyn ParserFactory>,
    buffer: Arc<TransactionBuffer>,
    builder: Arc<dyn Builder>,
    redo_read_sleep: Duration,
    refresh_interval: Duration,
    max_pending_transactions: usize,

    online_set: Vec<ParserJob>,
    thread_states: BTreeMap<ThreadId, OnlineThreadState>,
    scn_watermark: Scn,
}

impl OnlineIngestor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ctx: Arc<Ctx>,
        metadata: Arc<Metadata>,
        metrics: Arc<ReplicatorMetrics>,
        pool: Arc<ReaderPool>,
        mapper: Arc<PathMapper>,
        factory: Arc<dyn ParserFactory>,
        buffer: Arc<TransactionBuffer>,
        builder: Arc<dyn Builder>,
        redo_read_sleep: Duration,
        refresh_interval: Duration,
        max_pending_transactions: usize,
    ) -> Self {
        OnlineIngestor {
            ctx,
            metadata,
            metrics,
            pool,
            mapper,
            factory,
            buffer,
            builder,
            redo_read_sleep,
            refresh_interval,
            max_pending_transactions,
            online_set: Vec::new(),
            thread_states: BTreeMap::new(),
            scn_watermark: Scn::NONE,
        }
    }

    pub fn online_set_len(&self) -> usize {
        self.online_set.len()
    }

    pub fn scn_watermark(&self) -> Scn {
        self.scn_watermark
    }

    /// Mode-specific hook; a no-op for filesystem capture.
    fn go_standby(&self) {}

    // --- online set reconciliation ---

    /// Rebuild readers from the redo log catalog and re-materialize the
    /// online set.
    pub async fn update_online_redo_log_data(&mut self) -> Result<()> {
        let mut last_group: Option<crate::common::types::Group> = None;
        let mut paths: Vec<String> = Vec::new();

        // Rows are sorted by (thread, group, path); members of one group
        // coalesce into one reader.
        for redo_log in self.metadata.redo_logs() {
            if last_group != Some(redo_log.group) {
                if let Some(group) = last_group {
                    let reader = self.pool.create_reader(group);
                    reader.set_paths(std::mem::take(&mut paths)).await;
                }
                last_group = Some(redo_log.group);
            }
            paths.push(redo_log.path.clone());
        }
        if let Some(group) = last_group {
            let reader = self.pool.create_reader(group);
            reader.set_paths(std::mem::take(&mut paths)).await;
        }

        self.check_online_redo_logs().await
    }

    /// Probe each group's members through the path mapper; the first
    /// member that passes becomes the reader's file and gets a fresh
    /// parse job. A group with no readable member is fatal.
    pub async fn check_online_redo_logs(&mut self) -> Result<()> {
        self.online_set.clear();
        self.thread_states.clear();

        for reader in self.pool.readers() {
            if reader.group() == 0 {
                continue;
            }

            let mut found = false;
            for path in reader.paths().await {
                let mapped = self.mapper.mapped(&path);
                reader.set_file_name(&mapped).await;
                if reader.check_redo_log().await {
                    let mut job = ParserJob::from_factory(
                        self.factory.as_ref(),
                        mapped.clone(),
                        reader.group(),
                        reader.thread().await,
                        reader.sequence().await,
                    );
                    job.reader = Some(reader.clone());
                    job.sync_from_reader().await;
                    info!("online redo log: {mapped}");
                    self.online_set.push(job);
                    found = true;
                    break;
                }
            }

            if !found {
                for path in reader.paths().await {
                    let mapped = self.mapper.mapped(&path);
                    reader.show_hint(&path, &mapped).await;
                }
                return Err(ReplicatorError::NoReadableMember {
                    group: reader.group(),
                });
            }
        }
        Ok(())
    }

    /// Refresh every reader in the set and copy the headers back into
    /// the jobs.
    async fn update_online_logs(&mut self) -> Result<()> {
        for job in &mut self.online_set {
            let reader = job.reader.as_ref().expect("online job has a reader");
            if !reader.update_redo_log().await {
                return Err(ReplicatorError::OnlineUpdateFailed {
                    path: job.state.path.clone(),
                });
            }
            job.sync_from_reader().await;
        }
        Ok(())
    }

    /// Whether the online job at `idx` is parseable right now: its
    /// reader holds the thread's expected sequence and the checkpoint
    /// offset lies inside the written range.
    async fn is_current(&self, idx: usize) -> bool {
        let job = &self.online_set[idx];
        let reader = job.reader.as_ref().expect("online job has a reader");
        let thread = reader.thread().await;
        let thread_seq = self.metadata.get_sequence(thread);
        if reader.sequence().await != thread_seq {
            return false;
        }
        match reader.num_blocks().await {
            None => true,
            Some(num_blocks) => {
                self.metadata.get_file_offset(thread)
                    < FileOffset::new(num_blocks, reader.block_size().await)
            }
        }
    }

    // --- entry point ---

    /// Run the online phase until it has to hand control back to the
    /// archive phase. Returns whether any log was parsed.
    pub async fn process_online_redo_logs(&mut self) -> Result<bool> {
        if self.ctx.traces.redo {
            debug!(
                target: "redolith::redo",
                "checking online redo logs, seq: {}",
                self.metadata.sequence()
            );
        }
        crate::oracle::incarnation::update_resetlogs(&self.metadata)?;
        self.update_online_logs().await?;

        let mut threads: Vec<ThreadId> = Vec::new();
        for job in &self.online_set {
            let thread = job.reader.as_ref().expect("online job has a reader").thread().await;
            if !threads.contains(&thread) {
                threads.push(thread);
            }
        }

        if threads.len() <= 1 {
            self.process_single_instance().await
        } else {
            self.process_multi_thread(threads.len()).await
        }
    }

    // --- single-instance path ---

    async fn process_single_instance(&mut self) -> Result<bool> {
        let mut logs_processed = false;

        while !self.ctx.is_shutdown() {
            if self.ctx.traces.redo {
                debug!(
                    target: "redolith::redo",
                    "searching online redo log for seq: {}",
                    self.metadata.sequence()
                );
            }

            let mut chosen: Option<usize> = None;
            // Not reset across refreshes within this search round; a
            // sequence that jumps backwards after an overwrite can keep
            // it latched.
            let mut higher = false;
            let begin = Instant::now();

            while !self.ctx.is_shutdown() {
                for idx in 0..self.online_set.len() {
                    let job = &self.online_set[idx];
                    let reader = job.reader.as_ref().expect("online job has a reader");
                    let thread = reader.thread().await;
                    if reader.sequence().await > self.metadata.get_sequence(thread) {
                        higher = true;
                    }
                    if self.is_current(idx).await {
                        let better = match chosen {
                            None => true,
                            Some(current) => {
                                let current_scn = self.online_set[current].state.first_scn;
                                let candidate_scn = self.online_set[idx].state.first_scn;
                                candidate_scn.is_some()
                                    && (current_scn.is_none() || candidate_scn < current_scn)
                            }
                        };
                        if better {
                            chosen = Some(idx);
                        }
                    }
                }

                if chosen.is_none() && !higher {
                    self.ctx.sleep(self.redo_read_sleep).await;
                } else {
                    break;
                }
                if self.ctx.is_shutdown() {
                    break;
                }

                if begin.elapsed() > self.refresh_interval {
                    if self.ctx.traces.redo {
                        debug!(
                            target: "redolith::redo",
                            "refresh interval reached, checking online redo logs again"
                        );
                    }
                    self.update_online_redo_log_data().await?;
                    self.update_online_logs().await?;
                    self.go_standby();
                    break;
                }

                self.update_online_logs().await?;
            }

            let Some(idx) = chosen else { break };
            if self.ctx.is_shutdown() {
                break;
            }
            logs_processed = true;

            let (code, thread, group) = {
                let job = &mut self.online_set[idx];
                let thread = job.state.thread;
                self.metadata.activate_thread(thread);
                let code = job.parse().await?;
                self.metadata.save_thread(thread);
                self.metadata
                    .set_first_next_scn(thread, job.state.first_scn, job.state.next_scn);
                (code, thread, job.state.group)
            };

            if self.ctx.is_shutdown() {
                break;
            }

            match code {
                RedoCode::Finished => {
                    self.metadata.set_next_sequence(thread);
                    self.metrics.record_log_switch();
                }
                RedoCode::Stopped | RedoCode::Ok => {
                    if self.ctx.traces.redo {
                        debug!(
                            target: "redolith::redo",
                            "updating redo log files, return code: {code:?}, sequence: {}, \
                             first scn: {}, next scn: {}",
                            self.metadata.sequence(),
                            self.metadata.first_scn(),
                            self.metadata.next_scn()
                        );
                    }
                    self.update_online_redo_log_data().await?;
                    self.update_online_logs().await?;
                }
                RedoCode::Overwritten => {
                    info!(
                        "online redo log has been overwritten, continuing reading from \
                         archived redo log"
                    );
                    break;
                }
                other => {
                    if group == 0 {
                        return Err(ReplicatorError::ArchiveReadCode { code: other });
                    }
                    return Err(ReplicatorError::OnlineReadCode {
                        code: other,
                        thread,
                    });
                }
            }

            self.ctx.count_log_switch();
        }

        Ok(logs_processed)
    }

    // --- multi-thread (RAC) path ---

    async fn process_multi_thread(&mut self, thread_count: usize) -> Result<bool> {
        info!(
            "RAC mode: {thread_count} redo threads detected, using round-robin parsing \
             with SCN watermark"
        );
        self.buffer.set_defer_committed(true);

        self.thread_states.clear();
        for idx in 0..self.online_set.len() {
            if !self.is_current(idx).await {
                continue;
            }
            let thread = self.online_set[idx].state.thread;
            self.online_set[idx].state.yield_on_wait = true;
            let candidate_scn = self.online_set[idx].state.first_scn;
            let state = self.thread_states.entry(thread).or_default();
            let better = match state.active {
                None => true,
                Some(current) => {
                    let current_scn = self.online_set[current].state.first_scn;
                    candidate_scn.is_some() && (current_scn.is_none() || candidate_scn < current_scn)
                }
            };
            if better {
                state.active = Some(idx);
            }
        }

        if self.thread_states.values().all(|s| s.active.is_none()) {
            self.buffer.set_defer_committed(false);
            return Ok(false);
        }

        let logs_processed = true;

        while !self.ctx.is_shutdown() {
            let mut all_yielded = true;

            for thread in self.thread_order() {
                if self.ctx.is_shutdown() {
                    break;
                }

                // Back-pressure against the leading thread.
                let state = self.thread_states.get_mut(&thread).expect("ordered thread");
                if self.scn_watermark.is_some()
                    && state.last_lwn_scn.is_some()
                    && state.last_lwn_scn > self.scn_watermark
                    && self.buffer.committed_pending() > self.max_pending_transactions
                {
                    state.yielded = true;
                    continue;
                }
                state.yielded = false;

                if state.finished {
                    self.switch_thread_log(thread).await?;
                }
                let state = self.thread_states.get(&thread).expect("ordered thread");
                let Some(idx) = state.active else { continue };

                let (code, lwn_scn) = {
                    let job = &mut self.online_set[idx];
                    self.metadata.activate_thread(thread);
                    let code = job.parse().await?;
                    self.metadata.save_thread(thread);
                    self.metadata
                        .set_first_next_scn(thread, job.state.first_scn, job.state.next_scn);
                    (code, job.lwn_scn())
                };

                let state = self.thread_states.get_mut(&thread).expect("ordered thread");
                if lwn_scn.is_some() {
                    state.last_lwn_scn = lwn_scn;
                    self.metadata.set_thread_lwn_scn(thread, lwn_scn);
                }

                match code {
                    RedoCode::Yield => {
                        state.yielded = true;
                    }
                    RedoCode::Finished => {
                        state.finished = true;
                        self.metrics.record_log_switch();
                        self.ctx.count_log_switch();
                    }
                    RedoCode::Overwritten => {
                        info!(
                            "online redo log (thread {thread}) overwritten, falling back \
                             to archives"
                        );
                        self.buffer.set_defer_committed(false);
                        self.scn_watermark = Scn::MAX;
                        self.emit_watermarked_transactions().await?;
                        return Ok(logs_processed);
                    }
                    RedoCode::Stopped | RedoCode::Ok => {}
                    other => {
                        self.buffer.set_defer_committed(false);
                        return Err(ReplicatorError::OnlineReadCode {
                            code: other,
                            thread,
                        });
                    }
                }

                if !self.thread_states[&thread].yielded {
                    all_yielded = false;
                }

                // Refresh the watermark after every thread so the
                // back-pressure check sees current data.
                self.update_scn_watermark();
            }

            // Emission happens outside the per-thread loop; emitting
            // mid-cycle would interleave commits out of SCN order.
            self.emit_watermarked_transactions().await?;

            if self.ctx.traces.redo {
                debug!(
                    target: "redolith::redo",
                    "RAC: watermark={} pending={} all_yielded={all_yielded}",
                    self.scn_watermark,
                    self.buffer.committed_pending()
                );
            }

            if self.ctx.is_shutdown() {
                break;
            }
            if all_yielded {
                self.ctx.sleep(self.redo_read_sleep).await;
            }
        }

        self.buffer.set_defer_committed(false);
        self.scn_watermark = Scn::MAX;
        self.emit_watermarked_transactions().await?;

        Ok(logs_processed)
    }

    /// Threads ordered laggard-first: unknown LWN, then ascending
    /// `last_lwn_scn`, ties by thread id.
    fn thread_order(&self) -> Vec<ThreadId> {
        let mut order: Vec<ThreadId> = self
            .thread_states
            .iter()
            .filter(|(_, state)| state.active.is_some())
            .map(|(&thread, _)| thread)
            .collect();
        order.sort_by(|a, b| {
            let scn_a = self.thread_states[a].last_lwn_scn;
            let scn_b = self.thread_states[b].last_lwn_scn;
            match (scn_a.is_none(), scn_b.is_none()) {
                (true, true) => a.cmp(b),
                (true, false) => std::cmp::Ordering::Less,
                (false, true) => std::cmp::Ordering::Greater,
                (false, false) => scn_a.cmp(&scn_b).then(a.cmp(b)),
            }
        });
        order
    }

    /// A thread finished its file: advance the checkpoint, refresh only
    /// this thread's readers, and arm the job holding the new sequence.
    async fn switch_thread_log(&mut self, thread: ThreadId) -> Result<()> {
        self.metadata.set_next_sequence(thread);

        // Refreshing another thread's reader here would flush its
        // read-ahead buffer under an in-flight parse.
        for job in &mut self.online_set {
            let reader = job.reader.as_ref().expect("online job has a reader");
            if reader.thread().await == thread && reader.update_redo_log().await {
                job.sync_from_reader().await;
            }
        }

        let state = self.thread_states.get_mut(&thread).expect("known thread");
        state.active = None;
        state.finished = false;

        let expected = self.metadata.get_sequence(thread);
        for (idx, job) in self.online_set.iter_mut().enumerate() {
            let reader = job.reader.as_ref().expect("online job has a reader");
            if reader.thread().await == thread && reader.sequence().await == expected {
                job.state.yield_on_wait = true;
                job.state.parse_resuming = false;
                self.thread_states.get_mut(&thread).expect("known thread").active = Some(idx);
                break;
            }
        }

        if self.thread_states[&thread].active.is_none() {
            info!(
                "RAC: no parser found for thread {thread} seq {expected} after log switch"
            );
            return Ok(());
        }

        self.metadata
            .set_thread_seq_file_offset(thread, expected, FileOffset::zero());
        info!("RAC: thread {thread} switched to seq {expected}");
        Ok(())
    }

    /// Recompute the emission watermark: the minimum progress over all
    /// participating threads. A live thread with no LWN boundary yet
    /// pins the watermark to "nothing is safe".
    fn update_scn_watermark(&mut self) {
        let mut min_scn = Scn::NONE;

        for state in self.thread_states.values() {
            let Some(idx) = state.active else { continue };

            if state.finished {
                let mut bound = self.online_set[idx].state.next_scn;
                if bound.is_none() {
                    bound = state.last_lwn_scn;
                }
                if bound.is_some() && (min_scn.is_none() || bound < min_scn) {
                    min_scn = bound;
                }
                continue;
            }

            if state.last_lwn_scn.is_none() {
                self.scn_watermark = Scn::NONE;
                return;
            }

            if min_scn.is_none() || state.last_lwn_scn < min_scn {
                min_scn = state.last_lwn_scn;
            }
        }

        self.scn_watermark = min_scn;
    }

    /// Emit every parked transaction below the watermark, in order.
    pub async fn emit_watermarked_transactions(&mut self) -> Result<()> {
        if self.scn_watermark.is_none() {
            return Ok(());
        }
        self.ctx.record_memory(self.buffer.pending_bytes());

        let pending = self.buffer.drain_pending_below(self.scn_watermark);
        if pending.is_empty() {
            return Ok(());
        }
        self.metrics.record_drain();

        for mut committed in pending {
            committed
                .transaction
                .flush(self.builder.as_ref(), committed.lwn_scn)
                .await?;

            if committed.rollback {
                self.metrics.emit_rollback_out(1);
            } else {
                self.metrics.emit_commit_out(1);
            }

            let new_data = self
                .metadata
                .is_new_data(committed.lwn_scn, self.builder.lwn_idx());
            if new_data {
                self.ctx.count_transaction();
            }
            if committed.shutdown && new_data {
                info!(
                    "shutdown started - initiated by debug transaction at scn {}",
                    committed.commit_scn
                );
                self.ctx.stop_soft();
            }

            committed.transaction.purge();
        }

        Ok(())
    }

    /// Final drain used by the controller's error barrier.
    pub async fn drain_all_pending(&mut self) -> Result<()> {
        self.buffer.set_defer_committed(false);
        self.scn_watermark = Scn::MAX;
        self.emit_watermarked_transactions().await
    }
}
