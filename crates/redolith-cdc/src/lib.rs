//! # redolith-cdc - Oracle redo log capture for Redolith
//!
//! Library-shaped change-data-capture engine that follows an
//! Oracle-compatible database's redo stream from the filesystem:
//! archived logs are discovered and replayed in SCN order, online logs
//! are tailed until they switch or get recycled, and committed
//! transactions are emitted to a downstream serializer in strict commit
//! order - across all redo threads of a clustered database.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────┐   ┌─────────────┐
//! │  archived   │   │   online     │   │   online    │
//! │  redo logs  │   │  redo (T1)   │   │  redo (T2)  │
//! └──────┬──────┘   └──────┬───────┘   └──────┬──────┘
//!        ▼                 ▼                  ▼
//! ┌─────────────────────────────────────────────────────┐
//! │        Replicator (archive + online phases)         │
//! └──────────────────────────┬──────────────────────────┘
//!                            ▼
//! ┌─────────────────────────────────────────────────────┐
//! │   TransactionBuffer ── SCN watermark ──▶ Builder    │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! # use std::sync::Arc;
//! # async fn example(
//! #     builder: Arc<dyn redolith_cdc::Builder>,
//! #     factory: Arc<dyn redolith_cdc::ParserFactory>,
//! # ) -> redolith_cdc::Result<()> {
//! use redolith_cdc::{Replicator, ReplicatorConfig};
//!
//! let config = ReplicatorConfig::builder()
//!     .db_name("ORCL")
//!     .db_recovery_file_dest("/opt/fra")
//!     .log_archive_format("%t_%s_%r.arc")
//!     .path_mapping("/opt/fra", "/mnt/fra")
//!     .schemaless(true)
//!     .build()?;
//!
//! let mut replicator = Replicator::new(config, builder, factory)?;
//! replicator.run().await?;
//! # Ok(())
//! # }
//! ```

pub mod common;
pub mod oracle;

pub use common::{
    Builder, CommittedTransaction, Ctx, DbIncarnation, DiscoveryMode, FileOffset, Group,
    MetricsSnapshot, RedoLog, RedoTransaction, ReplicatorConfig, ReplicatorError,
    ReplicatorMetrics, Result, Scn, Seq, ThreadCheckpoint, ThreadId, TraceChannels,
    TransactionBuffer,
};
pub use oracle::{
    ArchiveNameParser, Metadata, ParseEngine, ParserFactory, ParserJob, ParserState, PathMapper,
    ReaderPool, RedoCode, RedoFileHeader, RedoReader, Replicator, Status,
};
