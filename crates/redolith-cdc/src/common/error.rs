//! Error types for the replication engine.
//!
//! Every fatal condition carries the numeric operator code of the
//! original product line so existing alerting keeps working. Boot errors
//! are a separate class: under `boot_failsafe` the controller converts
//! them into a READY retry instead of stopping.

use crate::common::types::{Seq, ThreadId};
use thiserror::Error;

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, ReplicatorError>;

/// Replication engine errors.
#[derive(Error, Debug)]
pub enum ReplicatorError {
    /// Startup precondition unmet: the starting sequence is unknown.
    #[error("[10028] starting sequence is unknown")]
    UnknownStartSequence,

    /// Startup precondition unmet: no schema checkpoint is available.
    #[error("[10040] schema file missing")]
    SchemaMissing,

    /// An archived redo log stayed unreadable through every retry.
    #[error("[10009] file: {path} - failed to open after {tries} tries")]
    ArchiveOpenExhausted { path: String, tries: u32 },

    /// A directory needed for archive discovery cannot be enumerated.
    #[error("[10012] directory: {path} - can't read: {source}")]
    DirectoryUnreadable {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// No member of an online redo group passed the header check.
    #[error("[10027] can't read any member of group {group}")]
    NoReadableMember { group: i32 },

    /// Refreshing an online redo log header failed.
    #[error("[10039] updating of online redo logs failed for {path}")]
    OnlineUpdateFailed { path: String },

    /// The configured archive location is missing.
    #[error("[10044] missing location of archived redo logs for offline mode")]
    MissingArchiveLocation,

    /// The current resetlogs id has no entry in the incarnation history.
    #[error("[10045] resetlogs ({resetlogs}) not found in incarnation list")]
    ResetlogsNotFound { resetlogs: u32 },

    /// Archive parsing returned a code the scheduler cannot dispatch.
    #[error("[10047] archive log processing returned: {code:?}, thread: {thread}, seq: {sequence}")]
    ArchiveParseCode {
        code: crate::oracle::parser::RedoCode,
        thread: ThreadId,
        sequence: Seq,
    },

    /// The archive reader returned an unexpected code on an online pass.
    #[error("[10048] read archived redo log, code: {code:?}")]
    ArchiveReadCode { code: crate::oracle::parser::RedoCode },

    /// Online parsing returned a code the ingestor cannot dispatch.
    #[error("[10049] read online redo log (thread {thread}), code: {code:?}")]
    OnlineReadCode {
        code: crate::oracle::parser::RedoCode,
        thread: ThreadId,
    },

    /// Memory allocation failure surfaced by a collaborator.
    #[error("[10018] memory allocation failed: {0}")]
    OutOfMemory(String),

    /// Malformed redo block or header detected while reading.
    #[error("[{code}] redo log error: {message}")]
    RedoLog { code: u32, message: String },

    /// Semantic inconsistency detected downstream of the parser.
    #[error("[{code}] data error: {message}")]
    Data { code: u32, message: String },

    /// Unclassified runtime failure.
    #[error("[{code}] {message}")]
    Runtime { code: u32, message: String },

    /// I/O error without a more specific classification.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Checkpoint/state serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ReplicatorError {
    /// Create a runtime error with an explicit operator code.
    pub fn runtime(code: u32, message: impl Into<String>) -> Self {
        Self::Runtime {
            code,
            message: message.into(),
        }
    }

    /// Create a redo log error with an explicit operator code.
    pub fn redo_log(code: u32, message: impl Into<String>) -> Self {
        Self::RedoLog {
            code,
            message: message.into(),
        }
    }

    /// Create a data error with an explicit operator code.
    pub fn data(code: u32, message: impl Into<String>) -> Self {
        Self::Data {
            code,
            message: message.into(),
        }
    }

    /// The numeric operator code, when the error carries one.
    pub fn code(&self) -> u32 {
        match self {
            Self::UnknownStartSequence => 10028,
            Self::SchemaMissing => 10040,
            Self::ArchiveOpenExhausted { .. } => 10009,
            Self::DirectoryUnreadable { .. } => 10012,
            Self::NoReadableMember { .. } => 10027,
            Self::OnlineUpdateFailed { .. } => 10039,
            Self::MissingArchiveLocation => 10044,
            Self::ResetlogsNotFound { .. } => 10045,
            Self::ArchiveParseCode { .. } => 10047,
            Self::ArchiveReadCode { .. } => 10048,
            Self::OnlineReadCode { .. } => 10049,
            Self::OutOfMemory(_) => 10018,
            Self::RedoLog { code, .. } | Self::Data { code, .. } | Self::Runtime { code, .. } => {
                *code
            }
            Self::Io(_) | Self::Json(_) => 0,
        }
    }

    /// Boot errors are retried under `boot_failsafe` instead of stopping
    /// the replicator.
    pub fn is_boot(&self) -> bool {
        matches!(self, Self::UnknownStartSequence | Self::SchemaMissing)
    }
}

/// Warning codes logged (never raised) by discovery and scheduling.
pub mod warning {
    /// File metadata could not be read during a directory scan.
    pub const FILE_STAT: u32 = 10003;
    /// An expected archive sequence is missing (gap detected).
    pub const ARCHIVE_GAP: u32 = 60027;
    /// A filename did not match the `log_archive_format` template.
    pub const FILENAME_PARSE: u32 = 60028;
}

/// Sequence gap description used in warning 60027.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceGap {
    pub thread: ThreadId,
    pub expected: Seq,
    pub found: Seq,
}

impl std::fmt::Display for SequenceGap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "thread: {} seq: {}, found: {}",
            self.thread, self.expected, self.found
        )
    }
}
