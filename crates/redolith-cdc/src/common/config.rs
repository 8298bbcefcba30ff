//! Replicator configuration.
//!
//! Built once at startup and treated as immutable afterwards. The
//! defaults mirror the original product so existing deployments can port
//! their settings one-to-one.

use crate::common::ctx::TraceChannels;
use crate::common::error::{ReplicatorError, Result};
use crate::common::types::{Scn, Seq};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// How archived redo logs are located.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DiscoveryMode {
    /// Scan `db_recovery_file_dest/<db_name>/archivelog/<day>/` directories.
    #[default]
    DirectoryScan,
    /// Process an explicit, pre-registered list of files and directories.
    BatchList,
}

/// Configuration for the replication engine.
#[derive(Debug, Clone)]
pub struct ReplicatorConfig {
    /// Source database name; also the subdirectory under the recovery area.
    pub db_name: String,
    /// Archive log filename template (`%t_%s_%r.dbf` style wildcards).
    pub log_archive_format: String,
    /// Fast recovery area root on the capture host.
    pub db_recovery_file_dest: String,
    /// Source `DB_BLOCK_CHECKSUM` setting (`TYPICAL`, `FULL`, `OFF`, ...).
    pub db_block_checksum: String,
    /// Source database timezone offset, seconds east of UTC.
    pub db_timezone: i32,

    /// Ordered `(source_prefix, target_prefix)` path rewrites.
    pub path_mapping: Vec<(String, String)>,
    /// Explicit archive batch for [`DiscoveryMode::BatchList`].
    pub redo_logs_batch: Vec<PathBuf>,
    pub discovery_mode: DiscoveryMode,

    /// Outer-loop pause when neither phase made progress.
    pub refresh_interval: Duration,
    /// Pause between online redo polls.
    pub redo_read_sleep: Duration,
    /// Pause between archive availability checks.
    pub arch_read_sleep: Duration,
    /// Attempts to open an archived log before failing (code 10009).
    pub arch_read_tries: u32,

    /// Run without a schema checkpoint.
    pub schemaless: bool,
    /// Never touch online redo logs; archives only.
    pub arch_only: bool,
    /// Convert boot errors into a READY retry instead of stopping.
    pub boot_failsafe: bool,
    /// Suppress the `DB_BLOCK_CHECKSUM = OFF` operator hint.
    pub disable_block_sum_check: bool,

    /// Stop after this many log switches; 0 = unlimited.
    pub stop_log_switches: u32,
    /// Stop after this many emitted transactions; 0 = unlimited.
    pub stop_transactions: u32,
    /// Deferred-commit cap before the leading thread is throttled.
    pub max_pending_transactions: usize,

    /// Optional explicit starting point.
    pub start_scn: Scn,
    pub start_sequence: Seq,
    pub start_time: String,
    pub start_time_rel: u64,

    pub traces: TraceChannels,
}

impl Default for ReplicatorConfig {
    fn default() -> Self {
        ReplicatorConfig {
            db_name: String::new(),
            log_archive_format: "%t_%s_%r.dbf".to_string(),
            db_recovery_file_dest: String::new(),
            db_block_checksum: "TYPICAL".to_string(),
            db_timezone: 0,
            path_mapping: Vec::new(),
            redo_logs_batch: Vec::new(),
            discovery_mode: DiscoveryMode::DirectoryScan,
            refresh_interval: Duration::from_secs(10),
            redo_read_sleep: Duration::from_millis(50),
            arch_read_sleep: Duration::from_secs(10),
            arch_read_tries: 10,
            schemaless: false,
            arch_only: false,
            boot_failsafe: false,
            disable_block_sum_check: false,
            stop_log_switches: 0,
            stop_transactions: 0,
            max_pending_transactions: MAX_PENDING_TRANSACTIONS,
            start_scn: Scn::NONE,
            start_sequence: Seq::NONE,
            start_time: String::new(),
            start_time_rel: 0,
            traces: TraceChannels::default(),
        }
    }
}

/// Default deferred-commit cap. Each deferred transaction pins memory
/// chunks until emission, so the cap bounds worst-case buffer growth when
/// one redo thread runs far ahead of the others.
pub const MAX_PENDING_TRANSACTIONS: usize = 500;

impl ReplicatorConfig {
    pub fn builder() -> ReplicatorConfigBuilder {
        ReplicatorConfigBuilder::default()
    }

    /// Validate settings that have no safe fallback.
    pub fn validate(&self) -> Result<()> {
        if self.db_name.is_empty() {
            return Err(ReplicatorError::runtime(10001, "database name is empty"));
        }
        if self.arch_read_tries == 0 {
            return Err(ReplicatorError::runtime(
                10001,
                "arch-read-tries must be at least 1",
            ));
        }
        if self.max_pending_transactions == 0 {
            return Err(ReplicatorError::runtime(
                10001,
                "max-pending-transactions must be at least 1",
            ));
        }
        if self.discovery_mode == DiscoveryMode::BatchList && self.redo_logs_batch.is_empty() {
            return Err(ReplicatorError::runtime(
                10001,
                "batch discovery selected but redo-logs-batch is empty",
            ));
        }
        Ok(())
    }

    /// True when the source database runs with block checksums disabled,
    /// which weakens the reader's consistency checking.
    pub fn block_checksum_off(&self) -> bool {
        self.db_block_checksum == "OFF" || self.db_block_checksum == "FALSE"
    }
}

/// Builder for [`ReplicatorConfig`].
#[derive(Default)]
pub struct ReplicatorConfigBuilder {
    config: ReplicatorConfig,
}

impl ReplicatorConfigBuilder {
    pub fn db_name(mut self, name: impl Into<String>) -> Self {
        self.config.db_name = name.into();
        self
    }

    pub fn log_archive_format(mut self, format: impl Into<String>) -> Self {
        self.config.log_archive_format = format.into();
        self
    }

    pub fn db_recovery_file_dest(mut self, dest: impl Into<String>) -> Self {
        self.config.db_recovery_file_dest = dest.into();
        self
    }

    pub fn db_block_checksum(mut self, value: impl Into<String>) -> Self {
        self.config.db_block_checksum = value.into();
        self
    }

    pub fn db_timezone(mut self, seconds_east: i32) -> Self {
        self.config.db_timezone = seconds_east;
        self
    }

    /// Register a path mapping; first registered wins on overlap.
    pub fn path_mapping(mut self, source: impl Into<String>, target: impl Into<String>) -> Self {
        self.config.path_mapping.push((source.into(), target.into()));
        self
    }

    /// Add one path to the explicit batch and select batch discovery.
    pub fn redo_log_batch(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.redo_logs_batch.push(path.into());
        self.config.discovery_mode = DiscoveryMode::BatchList;
        self
    }

    pub fn refresh_interval(mut self, interval: Duration) -> Self {
        self.config.refresh_interval = interval;
        self
    }

    pub fn redo_read_sleep(mut self, sleep: Duration) -> Self {
        self.config.redo_read_sleep = sleep;
        self
    }

    pub fn arch_read_sleep(mut self, sleep: Duration) -> Self {
        self.config.arch_read_sleep = sleep;
        self
    }

    pub fn arch_read_tries(mut self, tries: u32) -> Self {
        self.config.arch_read_tries = tries;
        self
    }

    pub fn schemaless(mut self, enabled: bool) -> Self {
        self.config.schemaless = enabled;
        self
    }

    pub fn arch_only(mut self, enabled: bool) -> Self {
        self.config.arch_only = enabled;
        self
    }

    pub fn boot_failsafe(mut self, enabled: bool) -> Self {
        self.config.boot_failsafe = enabled;
        self
    }

    pub fn disable_block_sum_check(mut self, disabled: bool) -> Self {
        self.config.disable_block_sum_check = disabled;
        self
    }

    pub fn stop_log_switches(mut self, count: u32) -> Self {
        self.config.stop_log_switches = count;
        self
    }

    pub fn stop_transactions(mut self, count: u32) -> Self {
        self.config.stop_transactions = count;
        self
    }

    pub fn max_pending_transactions(mut self, max: usize) -> Self {
        self.config.max_pending_transactions = max;
        self
    }

    pub fn start_scn(mut self, scn: Scn) -> Self {
        self.config.start_scn = scn;
        self
    }

    pub fn start_sequence(mut self, sequence: Seq) -> Self {
        self.config.start_sequence = sequence;
        self
    }

    pub fn start_time(mut self, time: impl Into<String>) -> Self {
        self.config.start_time = time.into();
        self
    }

    pub fn start_time_rel(mut self, seconds: u64) -> Self {
        self.config.start_time_rel = seconds;
        self
    }

    pub fn traces(mut self, traces: TraceChannels) -> Self {
        self.config.traces = traces;
        self
    }

    pub fn build(self) -> Result<ReplicatorConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
