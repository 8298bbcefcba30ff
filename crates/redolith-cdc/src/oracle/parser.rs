//! Per-file parse jobs.
//!
//! A [`ParserJob`] is the unit the scheduler moves around: "parse one
//! redo file". The job owns its bookkeeping (positions, SCN range, yield
//! mode) while the actual change-vector decode sits behind the
//! [`ParseEngine`] seam, keyed off the active metadata slot.
//!
//! Ownership is single-owner throughout: a job lives in exactly one
//! per-thread queue or in the online set, and whoever pops it destroys
//! it.

use crate::common::error::Result;
use crate::common::types::{Group, Scn, Seq, ThreadId};
use crate::oracle::reader::RedoReader;
use async_trait::async_trait;
use std::sync::Arc;

/// Outcome of one `parse()` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedoCode {
    /// Made progress; more data may follow.
    Ok,
    /// The file is fully parsed (log switch for online files).
    Finished,
    /// Stopped cooperatively (shutdown request).
    Stopped,
    /// An online log was recycled underneath the parser.
    Overwritten,
    /// Would wait for data; returned instead because `yield_on_wait`.
    Yield,
    /// Decoder-level failure the caller must escalate.
    Error,
}

/// Mutable bookkeeping of one parse job, shared with the engine.
#[derive(Debug, Clone)]
pub struct ParserState {
    pub path: String,
    pub group: Group,
    pub thread: ThreadId,
    pub sequence: Seq,
    pub first_scn: Scn,
    pub next_scn: Scn,
    /// Highest SCN whose LWN boundary this job has fully observed.
    pub lwn_scn: Scn,
    /// Return [`RedoCode::Yield`] instead of blocking for more data.
    pub yield_on_wait: bool,
    /// Set when re-entering a file after a yield.
    pub parse_resuming: bool,
}

impl ParserState {
    pub fn new(path: impl Into<String>, group: Group, thread: ThreadId, sequence: Seq) -> Self {
        ParserState {
            path: path.into(),
            group,
            thread,
            sequence,
            first_scn: Scn::NONE,
            next_scn: Scn::NONE,
            lwn_scn: Scn::NONE,
            yield_on_wait: false,
            parse_resuming: false,
        }
    }
}

/// The redo-block decoder. Implementations read blocks through the
/// assigned reader, decode change vectors, and feed the transaction
/// buffer; this crate only drives them.
#[async_trait]
pub trait ParseEngine: Send + Sync {
    async fn parse(&mut self, state: &mut ParserState) -> Result<RedoCode>;
}

/// Creates one [`ParseEngine`] per redo file.
pub trait ParserFactory: Send + Sync {
    fn create(&self, group: Group, path: &str) -> Box<dyn ParseEngine>;
}

/// One "parse this redo file" job.
pub struct ParserJob {
    pub state: ParserState,
    engine: Box<dyn ParseEngine>,
    /// The reader assigned for the current pass; the archive reader for
    /// queued jobs, the group's own reader for online jobs.
    pub reader: Option<Arc<RedoReader>>,
}

impl ParserJob {
    pub fn new(state: ParserState, engine: Box<dyn ParseEngine>) -> Self {
        ParserJob {
            state,
            engine,
            reader: None,
        }
    }

    /// Build a job through a factory, the way discovery and
    /// reconciliation create them.
    pub fn from_factory(
        factory: &dyn ParserFactory,
        path: impl Into<String>,
        group: Group,
        thread: ThreadId,
        sequence: Seq,
    ) -> Self {
        let path = path.into();
        let engine = factory.create(group, &path);
        ParserJob::new(ParserState::new(path, group, thread, sequence), engine)
    }

    pub async fn parse(&mut self) -> Result<RedoCode> {
        self.engine.parse(&mut self.state).await
    }

    pub fn lwn_scn(&self) -> Scn {
        self.state.lwn_scn
    }

    /// Copy the reader's refreshed header fields into the job, as done
    /// after every online refresh.
    pub async fn sync_from_reader(&mut self) {
        if let Some(reader) = &self.reader {
            self.state.sequence = reader.sequence().await;
            self.state.thread = reader.thread().await;
            self.state.first_scn = reader.first_scn().await;
            self.state.next_scn = reader.next_scn().await;
        }
    }
}

impl std::fmt::Debug for ParserJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParserJob")
            .field("path", &self.state.path)
            .field("group", &self.state.group)
            .field("thread", &self.state.thread)
            .field("sequence", &self.state.sequence)
            .field("first_scn", &self.state.first_scn)
            .field("next_scn", &self.state.next_scn)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ScriptedEngine {
        codes: Vec<RedoCode>,
    }

    #[async_trait]
    impl ParseEngine for ScriptedEngine {
        async fn parse(&mut self, state: &mut ParserState) -> Result<RedoCode> {
            state.first_scn = Scn::new(1000);
            state.next_scn = Scn::new(1200);
            Ok(self.codes.remove(0))
        }
    }

    #[tokio::test]
    async fn job_delegates_to_engine_and_updates_state() {
        let engine = ScriptedEngine {
            codes: vec![RedoCode::Ok, RedoCode::Finished],
        };
        let state = ParserState::new("/arch/1_42_1.arc", 0, 1, Seq::new(42));
        let mut job = ParserJob::new(state, Box::new(engine));

        assert_eq!(job.parse().await.unwrap(), RedoCode::Ok);
        assert_eq!(job.state.first_scn, Scn::new(1000));
        assert_eq!(job.parse().await.unwrap(), RedoCode::Finished);
        assert_eq!(job.state.next_scn, Scn::new(1200));
    }

    #[test]
    fn fresh_state_has_unknown_scns() {
        let state = ParserState::new("/arch/x.arc", 0, 2, Seq::new(7));
        assert!(state.first_scn.is_none());
        assert!(state.next_scn.is_none());
        assert!(state.lwn_scn.is_none());
        assert!(!state.yield_on_wait);
    }
}
