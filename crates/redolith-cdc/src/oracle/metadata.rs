//! Observable replication metadata.
//!
//! This is the engine-facing view of the checkpoint store: replication
//! status, per-thread positions, the redo log catalog, and the
//! incarnation history. Persistence of this state is a concern of the
//! surrounding process; everything here is serde-ready so a checkpoint
//! writer can snapshot it.
//!
//! The active `(sequence, file_offset)` slot is what a parser reads and
//! advances; in multi-thread mode the ingestor context-switches the slot
//! from the per-thread checkpoints around every parse call.

use crate::common::config::ReplicatorConfig;
use crate::common::ctx::Ctx;
use crate::common::types::{
    DbIncarnation, FileOffset, RedoLog, Scn, Seq, ThreadCheckpoint, ThreadId,
};
use std::collections::BTreeMap;
use std::sync::Mutex;
use tokio::sync::watch;
use tracing::info;

/// Replication status, driven by the writer-side protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Waiting for a start command from the writer.
    Ready,
    /// Start requested; boot sequence may run.
    Start,
    /// Replication is active.
    Replicate,
}

#[derive(Debug)]
struct CheckpointState {
    /// Active parse slot.
    sequence: Seq,
    file_offset: FileOffset,
    /// SCN range of the file most recently parsed.
    first_scn: Scn,
    next_scn: Scn,
    resetlogs: u32,
    threads: BTreeMap<ThreadId, ThreadCheckpoint>,
    first_data_scn: Scn,
    first_schema_scn: Scn,
    schema_scn: Scn,
    checkpoints_allowed: bool,
    redo_logs: Vec<RedoLog>,
    incarnations: Vec<DbIncarnation>,
    incarnation_current: Option<usize>,
    /// Highest `(scn, lwn_idx)` already confirmed by the writer.
    confirmed: (Scn, u64),
}

/// Engine-side metadata store.
#[derive(Debug)]
pub struct Metadata {
    state: Mutex<CheckpointState>,
    status_tx: watch::Sender<Status>,

    pub db_name: String,
    pub log_archive_format: String,
    pub db_recovery_file_dest: String,
    pub db_block_checksum: String,
    pub db_timezone: i32,
    pub start_scn: Scn,
    pub start_sequence: Seq,
    pub start_time: String,
    pub start_time_rel: u64,
}

impl Metadata {
    pub fn new(config: &ReplicatorConfig) -> Self {
        let (status_tx, _) = watch::channel(Status::Start);
        Metadata {
            state: Mutex::new(CheckpointState {
                sequence: Seq::NONE,
                file_offset: FileOffset::zero(),
                first_scn: Scn::NONE,
                next_scn: Scn::NONE,
                resetlogs: 0,
                threads: BTreeMap::new(),
                first_data_scn: Scn::NONE,
                first_schema_scn: Scn::NONE,
                schema_scn: Scn::NONE,
                checkpoints_allowed: false,
                redo_logs: Vec::new(),
                incarnations: Vec::new(),
                incarnation_current: None,
                confirmed: (Scn::ZERO, 0),
            }),
            status_tx,
            db_name: config.db_name.clone(),
            log_archive_format: config.log_archive_format.clone(),
            db_recovery_file_dest: config.db_recovery_file_dest.clone(),
            db_block_checksum: config.db_block_checksum.clone(),
            db_timezone: config.db_timezone,
            start_scn: config.start_scn,
            start_sequence: config.start_sequence,
            start_time: config.start_time.clone(),
            start_time_rel: config.start_time_rel,
        }
    }

    // --- status protocol ---

    pub fn status(&self) -> Status {
        *self.status_tx.borrow()
    }

    /// Block until the writer allows progress (status is not READY) or a
    /// shutdown is requested.
    pub async fn wait_for_writer(&self, ctx: &Ctx) {
        let mut rx = self.status_tx.subscribe();
        loop {
            if ctx.is_shutdown() || *rx.borrow() != Status::Ready {
                return;
            }
            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                _ = ctx.sleep(std::time::Duration::from_secs(3600)) => {}
            }
        }
    }

    /// Boot failed under failsafe; wait for further commands.
    pub fn set_status_ready(&self) {
        self.status_tx.send_replace(Status::Ready);
    }

    /// Writer requested a (re)start.
    pub fn set_status_start(&self) {
        self.status_tx.send_replace(Status::Start);
    }

    pub fn set_status_replicate(&self) {
        self.status_tx.send_replace(Status::Replicate);
    }

    /// Re-notify status waiters without changing the status.
    pub fn wake_up(&self) {
        let current = *self.status_tx.borrow();
        self.status_tx.send_replace(current);
    }

    // --- checkpoint slots ---

    /// Set the active slot without touching per-thread state. Used by
    /// boot positioning before any thread is known.
    pub fn set_seq_file_offset(&self, sequence: Seq, file_offset: FileOffset) {
        let mut state = self.lock();
        state.sequence = sequence;
        state.file_offset = file_offset;
    }

    /// Set a thread's checkpoint and make it the active slot.
    pub fn set_thread_seq_file_offset(
        &self,
        thread: ThreadId,
        sequence: Seq,
        file_offset: FileOffset,
    ) {
        let mut state = self.lock();
        let entry = state.threads.entry(thread).or_default();
        entry.sequence = sequence;
        entry.file_offset = file_offset;
        state.sequence = sequence;
        state.file_offset = file_offset;
    }

    /// The thread's expected sequence; falls back to the active slot for
    /// threads that have no checkpoint yet.
    pub fn get_sequence(&self, thread: ThreadId) -> Seq {
        let state = self.lock();
        state
            .threads
            .get(&thread)
            .map(|t| t.sequence)
            .unwrap_or(state.sequence)
    }

    pub fn get_file_offset(&self, thread: ThreadId) -> FileOffset {
        let state = self.lock();
        state
            .threads
            .get(&thread)
            .map(|t| t.file_offset)
            .unwrap_or(state.file_offset)
    }

    /// Advance a thread to its next sequence after a FINISHED parse.
    pub fn set_next_sequence(&self, thread: ThreadId) {
        let mut state = self.lock();
        let base = match state.threads.get(&thread) {
            Some(checkpoint) => checkpoint.sequence,
            None => state.sequence,
        };
        let base = if base.is_none() { Seq::ZERO } else { base };
        let next = base.next();
        let entry = state.threads.entry(thread).or_default();
        entry.sequence = next;
        entry.file_offset = FileOffset::zero();
        state.sequence = next;
        state.file_offset = FileOffset::zero();
    }

    /// Record the SCN range of the file a thread just parsed.
    pub fn set_first_next_scn(&self, _thread: ThreadId, first_scn: Scn, next_scn: Scn) {
        let mut state = self.lock();
        state.first_scn = first_scn;
        state.next_scn = next_scn;
    }

    /// Load the active slot from a thread checkpoint (context switch
    /// in). A thread seen for the first time inherits the active slot.
    pub fn activate_thread(&self, thread: ThreadId) {
        let mut state = self.lock();
        let seed = ThreadCheckpoint {
            sequence: state.sequence,
            file_offset: state.file_offset,
            last_lwn_scn: Scn::NONE,
        };
        let cp = state.threads.entry(thread).or_insert(seed);
        let (sequence, file_offset) = (cp.sequence, cp.file_offset);
        state.sequence = sequence;
        state.file_offset = file_offset;
    }

    /// Save the active slot back into a thread checkpoint (context
    /// switch out).
    pub fn save_thread(&self, thread: ThreadId) {
        let mut state = self.lock();
        let (sequence, file_offset) = (state.sequence, state.file_offset);
        let cp = state.threads.entry(thread).or_default();
        cp.sequence = sequence;
        cp.file_offset = file_offset;
    }

    pub fn set_thread_lwn_scn(&self, thread: ThreadId, lwn_scn: Scn) {
        let mut state = self.lock();
        state.threads.entry(thread).or_default().last_lwn_scn = lwn_scn;
    }

    pub fn thread_checkpoint(&self, thread: ThreadId) -> ThreadCheckpoint {
        self.lock().threads.get(&thread).copied().unwrap_or_default()
    }

    pub fn sequence(&self) -> Seq {
        self.lock().sequence
    }

    pub fn file_offset(&self) -> FileOffset {
        self.lock().file_offset
    }

    pub fn first_scn(&self) -> Scn {
        self.lock().first_scn
    }

    pub fn next_scn(&self) -> Scn {
        self.lock().next_scn
    }

    // --- resetlogs / incarnations ---

    pub fn resetlogs(&self) -> u32 {
        self.lock().resetlogs
    }

    pub fn set_resetlogs(&self, resetlogs: u32) {
        self.lock().resetlogs = resetlogs;
    }

    pub fn set_incarnations(&self, incarnations: Vec<DbIncarnation>) {
        let mut state = self.lock();
        state.incarnation_current = None;
        state.incarnations = incarnations;
    }

    /// Run `f` with the incarnation list and per-thread checkpoints under
    /// the checkpoint mutex. The incarnation tracker uses this to make
    /// its scan-and-reset atomic.
    pub fn with_checkpoint_lock<R>(&self, f: impl FnOnce(&mut CheckpointAccess<'_>) -> R) -> R {
        let mut state = self.lock();
        let mut access = CheckpointAccess { state: &mut state };
        f(&mut access)
    }

    // --- boot bookkeeping ---

    pub fn first_data_scn(&self) -> Scn {
        self.lock().first_data_scn
    }

    pub fn set_first_data_scn(&self, scn: Scn) {
        self.lock().first_data_scn = scn;
    }

    pub fn first_schema_scn(&self) -> Scn {
        self.lock().first_schema_scn
    }

    pub fn schema_scn(&self) -> Scn {
        self.lock().schema_scn
    }

    pub fn set_schema_scn(&self, scn: Scn) {
        let mut state = self.lock();
        state.schema_scn = scn;
        if state.first_schema_scn.is_none() {
            state.first_schema_scn = scn;
        }
    }

    pub fn allow_checkpoints(&self) {
        let mut state = self.lock();
        if !state.checkpoints_allowed {
            state.checkpoints_allowed = true;
            info!("checkpoints are now allowed");
        }
    }

    pub fn checkpoints_allowed(&self) -> bool {
        self.lock().checkpoints_allowed
    }

    // --- redo log catalog ---

    pub fn set_redo_logs(&self, mut redo_logs: Vec<RedoLog>) {
        redo_logs.sort();
        self.lock().redo_logs = redo_logs;
    }

    pub fn redo_logs(&self) -> Vec<RedoLog> {
        self.lock().redo_logs.clone()
    }

    // --- emission bookkeeping ---

    /// Whether `(scn, lwn_idx)` lies beyond everything the writer has
    /// already confirmed, i.e. is not a replay.
    pub fn is_new_data(&self, scn: Scn, lwn_idx: u64) -> bool {
        let state = self.lock();
        let (confirmed_scn, confirmed_idx) = state.confirmed;
        scn > confirmed_scn || (scn == confirmed_scn && lwn_idx > confirmed_idx)
    }

    /// Writer-side confirmation hook.
    pub fn confirm(&self, scn: Scn, lwn_idx: u64) {
        let mut state = self.lock();
        if (scn, lwn_idx) > state.confirmed {
            state.confirmed = (scn, lwn_idx);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CheckpointState> {
        self.state.lock().expect("metadata checkpoint mutex poisoned")
    }
}

/// Mutable view handed out by [`Metadata::with_checkpoint_lock`].
pub struct CheckpointAccess<'a> {
    state: &'a mut CheckpointState,
}

impl CheckpointAccess<'_> {
    pub fn resetlogs(&self) -> u32 {
        self.state.resetlogs
    }

    pub fn next_scn(&self) -> Scn {
        self.state.next_scn
    }

    pub fn incarnations(&self) -> &[DbIncarnation] {
        &self.state.incarnations
    }

    pub fn current_incarnation(&self) -> Option<&DbIncarnation> {
        self.state
            .incarnation_current
            .map(|i| &self.state.incarnations[i])
    }

    pub fn set_current_incarnation(&mut self, index: Option<usize>) {
        self.state.incarnation_current = index;
    }

    /// Switch to a new resetlogs branch: adopt the id and zero every
    /// per-thread position.
    pub fn apply_resetlogs(&mut self, resetlogs: u32) {
        self.state.resetlogs = resetlogs;
        self.state.sequence = Seq::ZERO;
        self.state.file_offset = FileOffset::zero();
        for checkpoint in self.state.threads.values_mut() {
            checkpoint.sequence = Seq::ZERO;
            checkpoint.file_offset = FileOffset::zero();
        }
    }
}
