//! Cross-thread archive scheduling.
//!
//! Discovery fills one min-heap of parse jobs per redo thread. The
//! scheduler interleaves across the heaps one archive at a time, always
//! taking the thread whose head file starts at the lowest SCN, so the
//! merged output approximates global SCN order even when threads archive
//! at very different rates.
//!
//! A head above the thread's expected sequence is a gap: the thread is
//! skipped until the missing archive shows up, and in archive-only mode
//! the gap is reported (warning 60027).

use crate::common::ctx::Ctx;
use crate::common::error::{warning, ReplicatorError, Result, SequenceGap};
use crate::common::metrics::ReplicatorMetrics;
use crate::common::types::{FileOffset, Seq, ThreadId};
use crate::oracle::discovery::ArchiveDiscovery;
use crate::oracle::incarnation::update_resetlogs;
use crate::oracle::metadata::Metadata;
use crate::oracle::parser::{ParserJob, RedoCode};
use crate::oracle::reader::RedoReader;
use std::collections::{BTreeMap, BinaryHeap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

struct HeapEntry {
    job: ParserJob,
    /// Insertion order, the tie-breaker for equal sequences.
    order: u64,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.job.state.sequence == other.job.state.sequence && self.order == other.order
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reversed: BinaryHeap is a max-heap, we want the lowest
        // sequence (then earliest insertion) on top.
        other
            .job
            .state
            .sequence
            .cmp(&self.job.state.sequence)
            .then(other.order.cmp(&self.order))
    }
}

/// Per-thread priority queues of archive parse jobs.
#[derive(Default)]
pub struct ArchiveQueues {
    queues: BTreeMap<ThreadId, BinaryHeap<HeapEntry>>,
    next_order: u64,
}

impl ArchiveQueues {
    pub fn push(&mut self, job: ParserJob) {
        let order = self.next_order;
        self.next_order += 1;
        self.queues
            .entry(job.state.thread)
            .or_default()
            .push(HeapEntry { job, order });
    }

    pub fn is_empty(&self) -> bool {
        self.queues.values().all(BinaryHeap::is_empty)
    }

    pub fn queued(&self) -> usize {
        self.queues.values().map(BinaryHeap::len).sum()
    }

    fn head(&self, thread: ThreadId) -> Option<&ParserJob> {
        self.queues.get(&thread)?.peek().map(|entry| &entry.job)
    }

    fn pop(&mut self, thread: ThreadId) -> Option<ParserJob> {
        self.queues
            .get_mut(&thread)?
            .pop()
            .map(|entry| entry.job)
    }

    /// Drop heads that fell below their thread's checkpoint. Popping
    /// destroys the job.
    fn prune_stale(&mut self, metadata: &Metadata) {
        for (thread, queue) in &mut self.queues {
            let thread_seq = metadata.get_sequence(*thread);
            if thread_seq.is_unset() {
                continue;
            }
            while let Some(entry) = queue.peek() {
                if entry.job.state.sequence < thread_seq {
                    queue.pop();
                } else {
                    break;
                }
            }
        }
    }

    /// The SCN-based interleave rule.
    ///
    /// Only threads whose head matches the expected sequence compete;
    /// among them the lowest known `first_scn` wins, ties to the lowest
    /// thread id. Heads with unknown SCN lose to any known SCN, and when
    /// every candidate is unknown the lowest sequence wins instead.
    fn pick_next_thread(&self, metadata: &Metadata) -> Option<ThreadId> {
        let mut best: Option<(ThreadId, crate::common::types::Scn, Seq)> = None;

        for (&thread, queue) in &self.queues {
            let Some(entry) = queue.peek() else { continue };
            let head = &entry.job.state;
            let thread_seq = metadata.get_sequence(thread);

            if !thread_seq.is_unset() && head.sequence < thread_seq {
                continue; // stale, pruned on the next pass
            }
            if !thread_seq.is_unset() && head.sequence > thread_seq {
                continue; // gap
            }

            match best {
                None => best = Some((thread, head.first_scn, head.sequence)),
                Some((best_thread, best_scn, best_seq)) => {
                    if head.first_scn.is_some() && best_scn.is_some() {
                        if head.first_scn < best_scn
                            || (head.first_scn == best_scn && thread < best_thread)
                        {
                            best = Some((thread, head.first_scn, head.sequence));
                        }
                    } else if head.first_scn.is_some() {
                        best = Some((thread, head.first_scn, head.sequence));
                    } else if best_scn.is_none()
                        && (head.sequence < best_seq
                            || (head.sequence == best_seq && thread < best_thread))
                    {
                        best = Some((thread, head.first_scn, head.sequence));
                    }
                }
            }
        }

        best.map(|(thread, _, _)| thread)
    }

    /// Gaps visible at the queue heads: threads whose next queued
    /// archive is ahead of the expected sequence.
    fn gaps(&self, metadata: &Metadata) -> Vec<SequenceGap> {
        let mut gaps = Vec::new();
        for (&thread, queue) in &self.queues {
            let Some(entry) = queue.peek() else { continue };
            let thread_seq = metadata.get_sequence(thread);
            if !thread_seq.is_unset() && entry.job.state.sequence > thread_seq {
                gaps.push(SequenceGap {
                    thread,
                    expected: thread_seq,
                    found: entry.job.state.sequence,
                });
            }
        }
        gaps
    }

    pub fn clear(&mut self) {
        self.queues.clear();
    }
}

/// Drives the archive phase of the replication loop.
pub struct ArchiveScheduler {
    ctx: Arc<Ctx>,
    metadata: Arc<Metadata>,
    metrics: Arc<ReplicatorMetrics>,
    discovery: Box<dyn ArchiveDiscovery>,
    queues: ArchiveQueues,
    arch_only: bool,
    arch_read_sleep: Duration,
    arch_read_tries: u32,
}

impl ArchiveScheduler {
    pub fn new(
        ctx: Arc<Ctx>,
        metadata: Arc<Metadata>,
        metrics: Arc<ReplicatorMetrics>,
        discovery: Box<dyn ArchiveDiscovery>,
        arch_only: bool,
        arch_read_sleep: Duration,
        arch_read_tries: u32,
    ) -> Self {
        ArchiveScheduler {
            ctx,
            metadata,
            metrics,
            discovery,
            queues: ArchiveQueues::default(),
            arch_only,
            arch_read_sleep,
            arch_read_tries,
        }
    }

    pub fn queued(&self) -> usize {
        self.queues.queued()
    }

    /// One archive phase: discover, interleave, and parse until the
    /// queues drain or a gap stalls every thread. Returns whether any
    /// archive was parsed.
    pub async fn process_archived_redo_logs(
        &mut self,
        arch_reader: &Arc<RedoReader>,
    ) -> Result<bool> {
        let mut logs_processed = false;

        while !self.ctx.is_shutdown() {
            if self.ctx.traces.redo {
                debug!(
                    target: "redolith::redo",
                    "checking archived redo logs, seq: {}",
                    self.metadata.sequence()
                );
            }
            update_resetlogs(&self.metadata)?;
            for job in self.discovery.discover().await? {
                self.queues.push(job);
            }

            if self.queues.is_empty() {
                if self.arch_only {
                    if self.ctx.traces.archive_list {
                        debug!(
                            target: "redolith::archive_list",
                            "archived redo log missing for seq: {}, sleeping",
                            self.metadata.sequence()
                        );
                    }
                    self.ctx.sleep(self.arch_read_sleep).await;
                    continue;
                }
                break;
            }

            self.queues.prune_stale(&self.metadata);

            let mut any_processed = false;
            while !self.ctx.is_shutdown() {
                let Some(thread) = self.queues.pick_next_thread(&self.metadata) else {
                    if self.arch_only {
                        for gap in self.queues.gaps(&self.metadata) {
                            warn!(
                                code = warning::ARCHIVE_GAP,
                                "couldn't find archive log for {gap}, sleeping {} us",
                                self.arch_read_sleep.as_micros()
                            );
                        }
                    }
                    break;
                };

                any_processed = true;
                logs_processed = true;
                if self.process_one(thread, arch_reader).await? == RedoCode::Stopped {
                    break;
                }
            }

            if !any_processed {
                break;
            }
        }

        Ok(logs_processed)
    }

    /// Parse the head archive of `thread` through the shared archive
    /// reader. The job is owned by the scheduler for the duration and
    /// destroyed on completion; a shutdown mid-parse hands it back to
    /// its queue.
    async fn process_one(
        &mut self,
        thread: ThreadId,
        arch_reader: &Arc<RedoReader>,
    ) -> Result<RedoCode> {
        let mut job = self
            .queues
            .pop(thread)
            .expect("picked thread has a queued job");

        if self.ctx.traces.redo {
            debug!(
                target: "redolith::redo",
                "{} is thread: {thread}, seq: {}, scn: {}",
                job.state.path, job.state.sequence, job.state.first_scn
            );
        }

        // First contact with this thread: adopt the head as its start.
        if self.metadata.get_sequence(thread).is_unset() {
            self.metadata
                .set_thread_seq_file_offset(thread, job.state.sequence, FileOffset::zero());
        }

        job.reader = Some(arch_reader.clone());
        arch_reader.set_file_name(&job.state.path).await;

        let mut retry = self.arch_read_tries;
        loop {
            if arch_reader.check_redo_log().await && arch_reader.update_redo_log().await {
                break;
            }
            if retry == 0 {
                return Err(ReplicatorError::ArchiveOpenExhausted {
                    path: job.state.path.clone(),
                    tries: self.arch_read_tries,
                });
            }
            info!(
                "archived redo log {} is not ready for read, sleeping {} us",
                job.state.path,
                self.arch_read_sleep.as_micros()
            );
            self.ctx.sleep(self.arch_read_sleep).await;
            if self.ctx.is_shutdown() {
                self.queues.push(job);
                return Ok(RedoCode::Stopped);
            }
            retry -= 1;
        }

        self.metadata.activate_thread(thread);
        let code = job.parse().await?;
        self.metadata.save_thread(thread);
        self.metadata
            .set_first_next_scn(thread, job.state.first_scn, job.state.next_scn);

        if self.ctx.is_shutdown() && code != RedoCode::Finished && code != RedoCode::Stopped {
            // Interrupted mid-file; the job goes back for the next run.
            self.queues.push(job);
            return Ok(RedoCode::Stopped);
        }

        match code {
            RedoCode::Finished => {
                self.metadata.set_next_sequence(thread);
                self.metrics.record_archive();
                self.ctx.count_log_switch();
                Ok(RedoCode::Finished)
            }
            RedoCode::Stopped => Ok(RedoCode::Stopped),
            other => Err(ReplicatorError::ArchiveParseCode {
                code: other,
                thread,
                sequence: job.state.sequence,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::config::ReplicatorConfig;
    use crate::common::types::Scn;
    use crate::oracle::parser::{ParseEngine, ParserState};
    use async_trait::async_trait;

    struct NoopEngine;

    #[async_trait]
    impl ParseEngine for NoopEngine {
        async fn parse(&mut self, _state: &mut ParserState) -> Result<RedoCode> {
            Ok(RedoCode::Finished)
        }
    }

    fn job(thread: ThreadId, sequence: u32, first_scn: Scn) -> ParserJob {
        let mut state = ParserState::new(
            format!("/arch/{thread}_{sequence}_1.arc"),
            0,
            thread,
            Seq::new(sequence),
        );
        state.first_scn = first_scn;
        ParserJob::new(state, Box::new(NoopEngine))
    }

    fn metadata() -> Arc<Metadata> {
        let config = ReplicatorConfig::builder().db_name("TEST").build().unwrap();
        Arc::new(Metadata::new(&config))
    }

    #[test]
    fn heap_orders_by_sequence_then_insertion() {
        let mut queues = ArchiveQueues::default();
        queues.push(job(1, 44, Scn::NONE));
        queues.push(job(1, 42, Scn::new(10)));
        queues.push(job(1, 43, Scn::NONE));
        assert_eq!(queues.head(1).unwrap().state.sequence, Seq::new(42));
        queues.pop(1);
        assert_eq!(queues.head(1).unwrap().state.sequence, Seq::new(43));
        queues.pop(1);
        assert_eq!(queues.head(1).unwrap().state.sequence, Seq::new(44));
    }

    #[test]
    fn pick_prefers_lowest_first_scn() {
        // Scenario: T1 head seq 10 @ SCN 500, T2 head seq 7 @ SCN 300.
        let metadata = metadata();
        metadata.set_thread_seq_file_offset(1, Seq::new(10), FileOffset::zero());
        metadata.set_thread_seq_file_offset(2, Seq::new(7), FileOffset::zero());

        let mut queues = ArchiveQueues::default();
        queues.push(job(1, 10, Scn::new(500)));
        queues.push(job(2, 7, Scn::new(300)));

        assert_eq!(queues.pick_next_thread(&metadata), Some(2));

        // T2 advances; its next head starts above T1's.
        queues.pop(2);
        queues.push(job(2, 8, Scn::new(700)));
        metadata.set_thread_seq_file_offset(2, Seq::new(8), FileOffset::zero());
        metadata.set_thread_seq_file_offset(1, Seq::new(10), FileOffset::zero());
        assert_eq!(queues.pick_next_thread(&metadata), Some(1));
    }

    #[test]
    fn pick_skips_gapped_thread() {
        let metadata = metadata();
        metadata.set_thread_seq_file_offset(1, Seq::new(10), FileOffset::zero());

        let mut queues = ArchiveQueues::default();
        queues.push(job(1, 11, Scn::new(100)));
        assert_eq!(queues.pick_next_thread(&metadata), None);

        let gaps = queues.gaps(&metadata);
        assert_eq!(gaps.len(), 1);
        assert_eq!(gaps[0].expected, Seq::new(10));
        assert_eq!(gaps[0].found, Seq::new(11));
    }

    #[test]
    fn pick_prefers_known_scn_over_unknown() {
        let metadata = metadata();
        metadata.set_thread_seq_file_offset(1, Seq::new(5), FileOffset::zero());
        metadata.set_thread_seq_file_offset(2, Seq::new(9), FileOffset::zero());

        let mut queues = ArchiveQueues::default();
        queues.push(job(1, 5, Scn::NONE));
        queues.push(job(2, 9, Scn::new(800)));
        assert_eq!(queues.pick_next_thread(&metadata), Some(2));
    }

    #[test]
    fn pick_all_unknown_falls_back_to_lowest_sequence() {
        let metadata = metadata();
        metadata.set_thread_seq_file_offset(1, Seq::new(20), FileOffset::zero());
        metadata.set_thread_seq_file_offset(2, Seq::new(9), FileOffset::zero());

        let mut queues = ArchiveQueues::default();
        queues.push(job(1, 20, Scn::NONE));
        queues.push(job(2, 9, Scn::NONE));
        assert_eq!(queues.pick_next_thread(&metadata), Some(2));
    }

    #[test]
    fn pick_breaks_scn_tie_by_thread_id() {
        let metadata = metadata();
        metadata.set_thread_seq_file_offset(1, Seq::new(4), FileOffset::zero());
        metadata.set_thread_seq_file_offset(2, Seq::new(6), FileOffset::zero());

        let mut queues = ArchiveQueues::default();
        queues.push(job(2, 6, Scn::new(300)));
        queues.push(job(1, 4, Scn::new(300)));
        assert_eq!(queues.pick_next_thread(&metadata), Some(1));
    }

    #[test]
    fn prune_drops_only_stale_heads() {
        let metadata = metadata();
        metadata.set_thread_seq_file_offset(1, Seq::new(43), FileOffset::zero());

        let mut queues = ArchiveQueues::default();
        for seq in [41, 42, 43, 44] {
            queues.push(job(1, seq, Scn::NONE));
        }
        queues.prune_stale(&metadata);
        assert_eq!(queues.queued(), 2);
        assert_eq!(queues.head(1).unwrap().state.sequence, Seq::new(43));
    }

    #[test]
    fn unset_checkpoint_keeps_everything() {
        let metadata = metadata();
        let mut queues = ArchiveQueues::default();
        queues.push(job(1, 41, Scn::NONE));
        queues.push(job(1, 42, Scn::NONE));
        queues.prune_stale(&metadata);
        assert_eq!(queues.queued(), 2);
        // With no checkpoint, the lowest sequence is simply first.
        assert_eq!(queues.pick_next_thread(&metadata), Some(1));
    }
}
