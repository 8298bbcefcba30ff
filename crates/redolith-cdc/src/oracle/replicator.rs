//! The replication controller.
//!
//! Owns every engine component and runs the outer loop: boot rendezvous
//! with the writer, then alternating archive and online phases until a
//! shutdown is requested. All fatal errors funnel into the single error
//! barrier in [`Replicator::run`], which drains deferred transactions
//! before the task returns.

use crate::common::config::{DiscoveryMode, ReplicatorConfig};
use crate::common::ctx::Ctx;
use crate::common::error::Result;
use crate::common::metrics::ReplicatorMetrics;
use crate::common::transaction::{Builder, TransactionBuffer};
use crate::common::types::{FileOffset, Seq};
use crate::oracle::discovery::{ArchiveDiscovery, BatchList, DirectoryScan};
use crate::oracle::mapping::PathMapper;
use crate::oracle::metadata::{Metadata, Status};
use crate::oracle::online::OnlineIngestor;
use crate::oracle::parser::ParserFactory;
use crate::oracle::reader::{ReaderPool, RedoReader};
use crate::oracle::scheduler::ArchiveScheduler;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Format a timezone offset (seconds east of UTC) as `+HH:MM`.
fn format_timezone(seconds_east: i32) -> String {
    let sign = if seconds_east < 0 { '-' } else { '+' };
    let abs = seconds_east.unsigned_abs();
    format!("{sign}{:02}:{:02}", abs / 3600, (abs % 3600) / 60)
}

/// Offline-mode replication controller.
pub struct Replicator {
    ctx: Arc<Ctx>,
    config: ReplicatorConfig,
    metadata: Arc<Metadata>,
    metrics: Arc<ReplicatorMetrics>,
    buffer: Arc<TransactionBuffer>,
    pool: Arc<ReaderPool>,
    scheduler: ArchiveScheduler,
    online: OnlineIngestor,
    arch_reader: Option<Arc<RedoReader>>,
}

impl Replicator {
    /// Wire up the engine. The builder serializes emitted transactions;
    /// the factory supplies the redo-block decoder for each file.
    pub fn new(
        config: ReplicatorConfig,
        builder: Arc<dyn Builder>,
        factory: Arc<dyn ParserFactory>,
    ) -> Result<Self> {
        config.validate()?;

        let ctx = Arc::new(Ctx::new(
            config.stop_log_switches,
            config.stop_transactions,
            config.traces,
        ));
        let metadata = Arc::new(Metadata::new(&config));
        let metrics = Arc::new(ReplicatorMetrics::new());
        let buffer = Arc::new(TransactionBuffer::new());
        let mapper = Arc::new(PathMapper::from_pairs(
            &config.path_mapping,
            config.traces.file,
        ));
        let pool = Arc::new(ReaderPool::new(ctx.clone(), !config.block_checksum_off()));

        let discovery: Box<dyn ArchiveDiscovery> = match config.discovery_mode {
            DiscoveryMode::DirectoryScan => Box::new(DirectoryScan::new(
                ctx.clone(),
                metadata.clone(),
                mapper.clone(),
                factory.clone(),
            )),
            DiscoveryMode::BatchList => Box::new(BatchList::new(
                ctx.clone(),
                metadata.clone(),
                factory.clone(),
                config.redo_logs_batch.clone(),
            )),
        };

        let scheduler = ArchiveScheduler::new(
            ctx.clone(),
            metadata.clone(),
            metrics.clone(),
            discovery,
            config.arch_only,
            config.arch_read_sleep,
            config.arch_read_tries,
        );

        let online = OnlineIngestor::new(
            ctx.clone(),
            metadata.clone(),
            metrics.clone(),
            pool.clone(),
            mapper,
            factory,
            buffer.clone(),
            builder,
            config.redo_read_sleep,
            config.refresh_interval,
            config.max_pending_transactions,
        );

        Ok(Replicator {
            ctx,
            config,
            metadata,
            metrics,
            buffer,
            pool,
            scheduler,
            online,
            arch_reader: None,
        })
    }

    pub fn ctx(&self) -> Arc<Ctx> {
        self.ctx.clone()
    }

    pub fn metadata(&self) -> Arc<Metadata> {
        self.metadata.clone()
    }

    pub fn metrics(&self) -> Arc<ReplicatorMetrics> {
        self.metrics.clone()
    }

    pub fn transaction_buffer(&self) -> Arc<TransactionBuffer> {
        self.buffer.clone()
    }

    /// Request a cooperative stop and release any status waiters.
    pub fn stop(&self) {
        self.ctx.stop_soft();
        self.metadata.wake_up();
    }

    fn mode_name(&self) -> &'static str {
        "offline"
    }

    /// Mode hook: offline capture has no connection to verify.
    fn check_connection(&self) -> bool {
        true
    }

    /// Mode hook: offline capture always proceeds to the online phase.
    fn continue_with_online(&self) -> bool {
        true
    }

    /// Run the replicator until shutdown. This is the "parser task" of
    /// the process; readers run on their own tasks under the pool.
    pub async fn run(&mut self) -> Result<()> {
        if self.ctx.traces.threads {
            debug!(target: "redolith::threads", "replicator start");
        }

        let result = self.run_inner().await;
        if let Err(err) = &result {
            error!(code = err.code(), "{err}");
            self.ctx.stop_hard();
            // Deferred commits must still leave in order, even on the
            // fatal path.
            if let Err(drain_err) = self.online.drain_all_pending().await {
                error!(code = drain_err.code(), "drain on shutdown failed: {drain_err}");
            }
        }

        info!("Replicator for: {} is shutting down", self.config.db_name);
        self.buffer.purge();
        self.ctx.set_replicator_finished();
        info!(
            "transaction buffer memory HWM: {} bytes",
            self.ctx.memory_hwm()
        );
        self.pool.drop_all().await;

        if self.ctx.traces.threads {
            debug!(target: "redolith::threads", "replicator stop");
        }
        result
    }

    async fn run_inner(&mut self) -> Result<()> {
        self.metadata.wait_for_writer(&self.ctx).await;

        self.load_database_metadata();
        if !self.config.arch_only {
            self.online.update_online_redo_log_data().await?;
        }
        info!(
            "db-timezone: {}, log-timezone: {}",
            format_timezone(self.metadata.db_timezone),
            format_timezone(0)
        );

        // Boot until the writer lets us replicate.
        while self.metadata.status() != Status::Replicate {
            if self.ctx.is_shutdown() {
                return Ok(());
            }
            self.metadata.wait_for_writer(&self.ctx).await;
            if self.metadata.status() == Status::Ready {
                continue;
            }
            if self.ctx.is_shutdown() {
                return Ok(());
            }

            match self.boot() {
                Ok(()) => {
                    info!("resume writer");
                    self.metadata.set_status_replicate();
                }
                Err(err) if err.is_boot() && self.config.boot_failsafe => {
                    error!(code = err.code(), "{err}");
                    info!("replication startup failed, waiting for further commands");
                    self.metadata.set_status_ready();
                }
                Err(err) => return Err(err),
            }
        }

        // Main loop: archive phase, then online phase, then idle wait.
        while !self.ctx.is_shutdown() {
            let mut logs_processed = false;

            let arch_reader = self
                .arch_reader
                .clone()
                .expect("archive reader created at boot");
            logs_processed |= self
                .scheduler
                .process_archived_redo_logs(&arch_reader)
                .await?;
            if self.ctx.is_shutdown() {
                break;
            }

            if !self.check_connection() || !self.continue_with_online() {
                break;
            }
            if self.ctx.is_shutdown() {
                break;
            }

            if !self.config.arch_only {
                logs_processed |= self.online.process_online_redo_logs().await?;
            }
            if self.ctx.is_shutdown() {
                break;
            }

            if !logs_processed {
                info!("no redo logs to process, waiting for new redo logs");
                self.ctx.sleep(self.config.refresh_interval).await;
            }
        }

        Ok(())
    }

    /// Create the shared archive reader (group 0).
    fn load_database_metadata(&mut self) {
        self.arch_reader = Some(self.pool.create_reader(0));
    }

    /// One boot attempt. Errors classified as boot errors are retried
    /// under `boot_failsafe`; everything else is fatal.
    fn boot(&mut self) -> Result<()> {
        self.print_start_msg();
        if self.metadata.resetlogs() != 0 {
            info!("current resetlogs is: {}", self.metadata.resetlogs());
        }
        if self.metadata.first_data_scn().is_some() {
            info!("first data SCN: {}", self.metadata.first_data_scn());
        }
        if self.metadata.first_schema_scn().is_some() {
            info!("first schema SCN: {}", self.metadata.first_schema_scn());
        }

        if self.metadata.first_data_scn().is_none() || self.metadata.sequence().is_none() {
            self.position_reader();
        }

        if self.metadata.schema_scn().is_none() {
            self.create_schema()?;
        } else {
            self.metadata.allow_checkpoints();
        }

        if self.metadata.sequence().is_none() {
            return Err(crate::common::error::ReplicatorError::UnknownStartSequence);
        }

        info!(
            "last confirmed scn: {}, starting sequence: {}, offset: {}",
            self.metadata.first_data_scn(),
            self.metadata.sequence(),
            self.metadata.file_offset()
        );

        if self.config.block_checksum_off() && !self.config.disable_block_sum_check {
            info!(
                "hint: set DB_BLOCK_CHECKSUM = TYPICAL on the database or disable the \
                 block checksum consistency check for the reader"
            );
        }

        Ok(())
    }

    /// Establish the starting `(sequence, offset)` when no confirmed
    /// position exists.
    fn position_reader(&self) {
        if self.metadata.start_sequence.is_some() {
            self.metadata
                .set_seq_file_offset(self.metadata.start_sequence, FileOffset::zero());
        } else {
            self.metadata
                .set_seq_file_offset(Seq::ZERO, FileOffset::zero());
        }
    }

    /// Without a schema checkpoint only schemaless capture can proceed.
    fn create_schema(&self) -> Result<()> {
        if self.config.schemaless {
            self.metadata.allow_checkpoints();
            return Ok(());
        }
        Err(crate::common::error::ReplicatorError::SchemaMissing)
    }

    fn print_start_msg(&self) {
        let mut flags = Vec::new();
        if self.config.schemaless {
            flags.push("schemaless");
        }
        if self.config.arch_only {
            flags.push("arch-only");
        }
        let flags = if flags.is_empty() {
            String::new()
        } else {
            format!(" (flags: {})", flags.join(","))
        };

        let starting = if !self.metadata.start_time.is_empty() {
            format!("time: {}", self.metadata.start_time)
        } else if self.metadata.start_time_rel > 0 {
            format!("time-rel: {}", self.metadata.start_time_rel)
        } else if self.metadata.start_scn.is_some() {
            format!("scn: {}", self.metadata.start_scn)
        } else {
            "NOW".to_string()
        };

        let starting_seq = if self.metadata.start_sequence.is_some() {
            format!(", seq: {}", self.metadata.start_sequence)
        } else {
            String::new()
        };

        info!(
            "Replicator for {} in {} mode is starting{flags} from {starting}{starting_seq}",
            self.config.db_name,
            self.mode_name()
        );
    }
}
