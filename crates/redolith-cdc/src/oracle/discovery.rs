//! Archived redo log discovery.
//!
//! Two interchangeable strategies produce parse jobs for the scheduler:
//! scanning the recovery area's day directories, or walking an explicit
//! batch of files and directories. Exactly one is bound at construction.
//!
//! Both apply the same filter: filenames that do not match the
//! `log_archive_format` template are skipped (sequence zero), and so is
//! anything below the thread's checkpointed sequence.

use crate::common::ctx::Ctx;
use crate::common::error::{warning, ReplicatorError, Result};
use crate::common::types::{FileOffset, Seq};
use crate::oracle::archive_format::ArchiveNameParser;
use crate::oracle::mapping::PathMapper;
use crate::oracle::metadata::Metadata;
use crate::oracle::parser::{ParserFactory, ParserJob};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Source of archive parse jobs for the scheduler.
#[async_trait]
pub trait ArchiveDiscovery: Send {
    /// Enumerate newly visible archived logs as parse jobs.
    async fn discover(&mut self) -> Result<Vec<ParserJob>>;
}

/// Scan `db_recovery_file_dest/<db_name>/archivelog/<day>/`.
pub struct DirectoryScan {
    ctx: Arc<Ctx>,
    metadata: Arc<Metadata>,
    mapper: Arc<PathMapper>,
    factory: Arc<dyn ParserFactory>,
    name_parser: ArchiveNameParser,
    last_checked_day: String,
}

impl DirectoryScan {
    pub fn new(
        ctx: Arc<Ctx>,
        metadata: Arc<Metadata>,
        mapper: Arc<PathMapper>,
        factory: Arc<dyn ParserFactory>,
    ) -> Self {
        let name_parser = ArchiveNameParser::new(metadata.log_archive_format.clone());
        DirectoryScan {
            ctx,
            metadata,
            mapper,
            factory,
            name_parser,
            last_checked_day: String::new(),
        }
    }

    pub fn last_checked_day(&self) -> &str {
        &self.last_checked_day
    }
}

#[async_trait]
impl ArchiveDiscovery for DirectoryScan {
    async fn discover(&mut self) -> Result<Vec<ParserJob>> {
        if self.metadata.log_archive_format.is_empty() {
            return Err(ReplicatorError::MissingArchiveLocation);
        }

        let mapped_path = self.mapper.mapped(&format!(
            "{}/{}/archivelog",
            self.metadata.db_recovery_file_dest, self.metadata.db_name
        ));
        if self.ctx.traces.archive_list {
            debug!(target: "redolith::archive_list", "checking path: {mapped_path}");
        }

        let mut root = tokio::fs::read_dir(&mapped_path).await.map_err(|source| {
            ReplicatorError::DirectoryUnreadable {
                path: mapped_path.clone(),
                source,
            }
        })?;

        let mut jobs = Vec::new();
        let mut new_last_checked_day = String::new();
        while let Some(entry) = root.next_entry().await? {
            let day_name = entry.file_name().to_string_lossy().into_owned();
            let day_path = format!("{mapped_path}/{day_name}");

            let file_type = match entry.file_type().await {
                Ok(file_type) => file_type,
                Err(err) => {
                    warn!(
                        code = warning::FILE_STAT,
                        "file: {day_path} - get metadata returned: {err}"
                    );
                    continue;
                }
            };
            if !file_type.is_dir() {
                continue;
            }

            // Day directories are rescanned every tick; the per-thread
            // sequence filter below keeps already-processed archives out.
            if self.ctx.traces.archive_list {
                debug!(target: "redolith::archive_list", "checking path: {day_path}");
            }

            let mut day_dir = tokio::fs::read_dir(&day_path).await.map_err(|source| {
                ReplicatorError::DirectoryUnreadable {
                    path: day_path.clone(),
                    source,
                }
            })?;
            while let Some(file_entry) = day_dir.next_entry().await? {
                let file_name = file_entry.file_name().to_string_lossy().into_owned();
                let full_path = format!("{day_path}/{file_name}");
                if let Some(job) = self.filter_and_build(&file_name, &full_path) {
                    jobs.push(job);
                }
            }

            if new_last_checked_day.is_empty() || day_name > new_last_checked_day {
                new_last_checked_day = day_name;
            }
        }

        if !new_last_checked_day.is_empty() && self.last_checked_day < new_last_checked_day {
            if self.ctx.traces.archive_list {
                debug!(
                    target: "redolith::archive_list",
                    "updating last checked day to: {new_last_checked_day}"
                );
            }
            self.last_checked_day = new_last_checked_day;
        }

        Ok(jobs)
    }
}

impl DirectoryScan {
    fn filter_and_build(&self, file_name: &str, full_path: &str) -> Option<ParserJob> {
        if self.ctx.traces.archive_list {
            debug!(target: "redolith::archive_list", "checking path: {full_path}");
        }
        let name = self.name_parser.parse(file_name);
        if self.ctx.traces.archive_list {
            debug!(target: "redolith::archive_list", "found seq: {}", name.sequence);
        }
        filter_and_build(&self.metadata, self.factory.as_ref(), name, full_path)
    }
}

/// Walk an explicit list of archive files and directories, once.
pub struct BatchList {
    ctx: Arc<Ctx>,
    metadata: Arc<Metadata>,
    factory: Arc<dyn ParserFactory>,
    name_parser: ArchiveNameParser,
    batch: Vec<PathBuf>,
}

impl BatchList {
    pub fn new(
        ctx: Arc<Ctx>,
        metadata: Arc<Metadata>,
        factory: Arc<dyn ParserFactory>,
        batch: Vec<PathBuf>,
    ) -> Self {
        let name_parser = ArchiveNameParser::new(metadata.log_archive_format.clone());
        BatchList {
            ctx,
            metadata,
            factory,
            name_parser,
            batch,
        }
    }

    fn build_from_path(
        &self,
        path: &Path,
        sequence_start: &mut Seq,
        jobs: &mut Vec<ParserJob>,
    ) {
        let Some(file_name) = path.file_name().map(|n| n.to_string_lossy().into_owned())
        else {
            return;
        };
        let name = self.name_parser.parse(&file_name);
        if self.ctx.traces.archive_list {
            debug!(target: "redolith::archive_list", "found seq: {}", name.sequence);
        }
        let full_path = path.to_string_lossy().into_owned();
        if let Some(job) = filter_and_build(&self.metadata, self.factory.as_ref(), name, &full_path)
        {
            if sequence_start.is_none() || *sequence_start > job.state.sequence {
                *sequence_start = job.state.sequence;
            }
            jobs.push(job);
        }
    }
}

#[async_trait]
impl ArchiveDiscovery for BatchList {
    async fn discover(&mut self) -> Result<Vec<ParserJob>> {
        let mut jobs = Vec::new();
        let mut sequence_start = Seq::NONE;

        for path in std::mem::take(&mut self.batch) {
            if self.ctx.traces.archive_list {
                debug!(target: "redolith::archive_list", "checking path: {}", path.display());
            }
            let stat = match tokio::fs::metadata(&path).await {
                Ok(stat) => stat,
                Err(err) => {
                    warn!(
                        code = warning::FILE_STAT,
                        "file: {} - get metadata returned: {err}",
                        path.display()
                    );
                    continue;
                }
            };

            if stat.is_dir() {
                let dir_path = path.to_string_lossy().into_owned();
                let mut dir = tokio::fs::read_dir(&path).await.map_err(|source| {
                    ReplicatorError::DirectoryUnreadable {
                        path: dir_path,
                        source,
                    }
                })?;
                while let Some(entry) = dir.next_entry().await? {
                    self.build_from_path(&entry.path(), &mut sequence_start, &mut jobs);
                }
            } else {
                self.build_from_path(&path, &mut sequence_start, &mut jobs);
            }
        }

        // The very first batch can establish the starting sequence.
        if sequence_start.is_some() && self.metadata.sequence() == Seq::ZERO {
            self.metadata
                .set_seq_file_offset(sequence_start, FileOffset::zero());
        }

        Ok(jobs)
    }
}

fn filter_and_build(
    metadata: &Metadata,
    factory: &dyn ParserFactory,
    name: crate::oracle::archive_format::ArchiveName,
    full_path: &str,
) -> Option<ParserJob> {
    if name.sequence == Seq::ZERO {
        return None;
    }
    let thread_seq = metadata.get_sequence(name.thread);
    if thread_seq.is_some() && name.sequence < thread_seq {
        return None;
    }
    Some(ParserJob::from_factory(
        factory,
        full_path,
        0,
        name.thread,
        name.sequence,
    ))
}
