//! Database-agnostic building blocks of the replication engine:
//!
//! - [`types`] - SCN/sequence/offset scalar types
//! - [`error`] - typed errors with operator codes
//! - [`config`] - builder-pattern engine configuration
//! - [`ctx`] - shared runtime context and cooperative shutdown
//! - [`metrics`] - engine counters
//! - [`transaction`] - committed-transaction deferral and ordered drain

pub mod config;
pub mod ctx;
pub mod error;
pub mod metrics;
pub mod transaction;
pub mod types;

pub use config::{DiscoveryMode, ReplicatorConfig, ReplicatorConfigBuilder};
pub use ctx::{Ctx, TraceChannels};
pub use error::{ReplicatorError, Result};
pub use metrics::{MetricsSnapshot, ReplicatorMetrics};
pub use transaction::{Builder, CommittedTransaction, RedoTransaction, TransactionBuffer};
pub use types::{DbIncarnation, FileOffset, Group, RedoLog, Scn, Seq, ThreadCheckpoint, ThreadId};
