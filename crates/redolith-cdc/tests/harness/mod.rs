//! Shared test harness: scripted parse engines, a recording builder,
//! and redo file fixtures.
#![allow(dead_code)]

use async_trait::async_trait;
use redolith_cdc::{
    Builder, CommittedTransaction, Ctx, ParseEngine, ParserFactory, ParserState, RedoCode,
    RedoFileHeader, RedoTransaction, Result, Scn, Seq, ThreadId, TransactionBuffer,
};
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex, Once};

pub fn init_test_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::from_default_env()
                    .add_directive("redolith_cdc=debug".parse().unwrap()),
            )
            .with_test_writer()
            .try_init();
    });
}

/// Write a redo file fixture: a valid header block plus zero-filled
/// body blocks.
pub fn write_redo_file(dir: &Path, name: &str, header: RedoFileHeader) -> String {
    let path = dir.join(name);
    let encoded = header.encode();
    let mut contents = encoded.to_vec();
    contents.resize(header.block_size as usize * header.num_blocks as usize, 0);
    std::fs::write(&path, contents).unwrap();
    path.to_string_lossy().into_owned()
}

pub fn redo_header(
    thread: ThreadId,
    sequence: u32,
    first_scn: Scn,
    next_scn: Scn,
) -> RedoFileHeader {
    RedoFileHeader {
        block_size: 512,
        num_blocks: 4,
        thread,
        sequence: Seq::new(sequence),
        resetlogs: 1,
        first_scn,
        next_scn,
    }
}

/// Builder that only exposes an LWN index; flush recording happens on
/// the transactions themselves.
pub struct RecordingBuilder;

#[async_trait]
impl Builder for RecordingBuilder {
    fn lwn_idx(&self) -> u64 {
        0
    }
}

/// A transaction that records its `(lwn_scn, commit_scn)` into a shared
/// log when flushed.
pub struct MockTransaction {
    lwn_scn: u64,
    commit_scn: u64,
    flushed: Arc<Mutex<Vec<(u64, u64)>>>,
}

#[async_trait]
impl RedoTransaction for MockTransaction {
    async fn flush(&mut self, _builder: &dyn Builder, _lwn_scn: Scn) -> Result<()> {
        self.flushed
            .lock()
            .unwrap()
            .push((self.lwn_scn, self.commit_scn));
        Ok(())
    }

    fn purge(&mut self) {}

    fn size(&self) -> u64 {
        64
    }
}

/// One scripted outcome of a `parse()` call.
#[derive(Default, Clone)]
pub struct Step {
    pub code: Option<RedoCode>,
    pub lwn_scn: Option<u64>,
    pub first_next: Option<(u64, u64)>,
    /// `(lwn_scn, commit_scn)` pairs pushed into the transaction buffer.
    pub commits: Vec<(u64, u64)>,
    /// Request a soft shutdown during this call.
    pub stop: bool,
}

impl Step {
    pub fn finished(first_scn: u64, next_scn: u64) -> Self {
        Step {
            code: Some(RedoCode::Finished),
            first_next: Some((first_scn, next_scn)),
            ..Step::default()
        }
    }

    pub fn yielding(lwn_scn: u64) -> Self {
        Step {
            code: Some(RedoCode::Yield),
            lwn_scn: Some(lwn_scn),
            ..Step::default()
        }
    }

    pub fn code(code: RedoCode) -> Self {
        Step {
            code: Some(code),
            ..Step::default()
        }
    }

    pub fn with_commits(mut self, commits: Vec<(u64, u64)>) -> Self {
        self.commits = commits;
        self
    }

    pub fn with_stop(mut self) -> Self {
        self.stop = true;
        self
    }
}

struct Runtime {
    ctx: Arc<Ctx>,
    buffer: Arc<TransactionBuffer>,
}

/// Factory producing engines that replay per-path scripts. Engines
/// created for a path pop steps from that path's shared queue; an
/// exhausted script yields.
#[derive(Default)]
pub struct ScriptedFactory {
    scripts: Arc<Mutex<HashMap<String, VecDeque<Step>>>>,
    calls: Arc<Mutex<HashMap<String, usize>>>,
    parse_log: Arc<Mutex<Vec<(ThreadId, u32)>>>,
    flushed: Arc<Mutex<Vec<(u64, u64)>>>,
    runtime: Arc<Mutex<Option<Runtime>>>,
}

impl ScriptedFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(ScriptedFactory::default())
    }

    /// Attach the runtime the engines feed commits into. Needed only by
    /// scripts that defer transactions or request a stop.
    pub fn bind(&self, ctx: Arc<Ctx>, buffer: Arc<TransactionBuffer>) {
        *self.runtime.lock().unwrap() = Some(Runtime { ctx, buffer });
    }

    pub fn script(&self, path: &str, steps: Vec<Step>) {
        self.scripts
            .lock()
            .unwrap()
            .entry(path.to_string())
            .or_default()
            .extend(steps);
    }

    pub fn calls(&self, path: &str) -> usize {
        self.calls.lock().unwrap().get(path).copied().unwrap_or(0)
    }

    /// `(thread, sequence)` for every parse call, in dispatch order.
    pub fn parse_log(&self) -> Vec<(ThreadId, u32)> {
        self.parse_log.lock().unwrap().clone()
    }

    /// `(lwn_scn, commit_scn)` of every flushed transaction, in
    /// emission order.
    pub fn flushed(&self) -> Vec<(u64, u64)> {
        self.flushed.lock().unwrap().clone()
    }
}

impl ParserFactory for ScriptedFactory {
    fn create(&self, _group: i32, path: &str) -> Box<dyn ParseEngine> {
        Box::new(ScriptedEngine {
            path: path.to_string(),
            scripts: self.scripts.clone(),
            calls: self.calls.clone(),
            parse_log: self.parse_log.clone(),
            flushed: self.flushed.clone(),
            runtime: self.runtime.clone(),
        })
    }
}

struct ScriptedEngine {
    path: String,
    scripts: Arc<Mutex<HashMap<String, VecDeque<Step>>>>,
    calls: Arc<Mutex<HashMap<String, usize>>>,
    parse_log: Arc<Mutex<Vec<(ThreadId, u32)>>>,
    flushed: Arc<Mutex<Vec<(u64, u64)>>>,
    runtime: Arc<Mutex<Option<Runtime>>>,
}

#[async_trait]
impl ParseEngine for ScriptedEngine {
    async fn parse(&mut self, state: &mut ParserState) -> Result<RedoCode> {
        self.calls
            .lock()
            .unwrap()
            .entry(self.path.clone())
            .and_modify(|c| *c += 1)
            .or_insert(1);
        self.parse_log
            .lock()
            .unwrap()
            .push((state.thread, state.sequence.value()));

        let step = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&self.path)
            .and_then(VecDeque::pop_front)
            .unwrap_or_default();

        if let Some((first, next)) = step.first_next {
            state.first_scn = Scn::new(first);
            state.next_scn = Scn::new(next);
        }
        if let Some(lwn) = step.lwn_scn {
            state.lwn_scn = Scn::new(lwn);
        }

        if !step.commits.is_empty() || step.stop {
            let runtime = self.runtime.lock().unwrap();
            let runtime = runtime
                .as_ref()
                .expect("script uses commits/stop but no runtime is bound");
            for (lwn, commit) in &step.commits {
                runtime.buffer.push_committed(CommittedTransaction {
                    transaction: Box::new(MockTransaction {
                        lwn_scn: *lwn,
                        commit_scn: *commit,
                        flushed: self.flushed.clone(),
                    }),
                    lwn_scn: Scn::new(*lwn),
                    commit_scn: Scn::new(*commit),
                    rollback: false,
                    shutdown: false,
                });
            }
            if step.stop {
                runtime.ctx.stop_soft();
            }
        }

        Ok(step.code.unwrap_or(RedoCode::Yield))
    }
}
