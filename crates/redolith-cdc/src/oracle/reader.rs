//! Redo file readers.
//!
//! One reader exists per online redo group, plus the shared archive
//! reader in group 0. A reader owns the file handle and a block
//! read-ahead buffer; its worker task fills the buffer in the background
//! while the parse engine drains it. The controller only ever touches
//! the header surface: `check_redo_log` to probe a candidate path,
//! `update_redo_log` to refresh a header that the database keeps
//! extending, and `wake_up` during teardown.
//!
//! Refreshing a reader flushes its read-ahead buffer. That is harmless
//! between files but corrupts an in-flight parse, which is why the
//! multi-thread ingestor refreshes only the switching thread's readers.

use crate::common::ctx::Ctx;
use crate::common::error::{ReplicatorError, Result};
use crate::common::types::{Group, Scn, Seq, ThreadId};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::{BTreeMap, VecDeque};
use std::io::SeekFrom;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Magic number identifying a redo file header.
pub const REDO_MAGIC: u32 = 0x5244_4C31; // "RDL1"

/// Fixed header size in bytes, independent of the block size.
pub const REDO_HEADER_SIZE: usize = 64;

/// Blocks kept ahead of the parser per reader.
const READ_AHEAD_BLOCKS: usize = 256;

/// Blocks fetched per worker pass.
const READ_CHUNK_BLOCKS: usize = 32;

/// Decoded redo file header.
///
/// Header layout, little-endian:
/// magic(4) block_size(4) num_blocks(4) thread(2) reserved(2)
/// sequence(4) resetlogs(4) first_scn(8) next_scn(8) reserved(20) crc(4).
/// The CRC32 covers the first 60 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RedoFileHeader {
    pub block_size: u32,
    pub num_blocks: u32,
    pub thread: ThreadId,
    pub sequence: Seq,
    pub resetlogs: u32,
    pub first_scn: Scn,
    pub next_scn: Scn,
}

impl RedoFileHeader {
    /// Decode and verify a header block.
    pub fn decode(raw: &[u8], verify_checksum: bool) -> Result<Self> {
        if raw.len() < REDO_HEADER_SIZE {
            return Err(ReplicatorError::redo_log(
                20001,
                format!("short header: {} bytes", raw.len()),
            ));
        }
        let mut buf = &raw[..REDO_HEADER_SIZE];
        let magic = buf.get_u32_le();
        if magic != REDO_MAGIC {
            return Err(ReplicatorError::redo_log(
                20002,
                format!("bad header magic: {magic:#010x}"),
            ));
        }
        let block_size = buf.get_u32_le();
        let num_blocks = buf.get_u32_le();
        let thread = buf.get_u16_le();
        buf.advance(2);
        let sequence = Seq::new(buf.get_u32_le());
        let resetlogs = buf.get_u32_le();
        let first_scn = Scn::new(buf.get_u64_le());
        let next_scn = Scn::new(buf.get_u64_le());
        buf.advance(20);
        let stored_crc = buf.get_u32_le();

        if verify_checksum {
            let mut hasher = crc32fast::Hasher::new();
            hasher.update(&raw[..REDO_HEADER_SIZE - 4]);
            let crc = hasher.finalize();
            if crc != stored_crc {
                return Err(ReplicatorError::redo_log(
                    20003,
                    format!("header checksum mismatch: {crc:#010x} != {stored_crc:#010x}"),
                ));
            }
        }

        if block_size == 0 {
            return Err(ReplicatorError::redo_log(20004, "zero block size"));
        }

        Ok(RedoFileHeader {
            block_size,
            num_blocks,
            thread,
            sequence,
            resetlogs,
            first_scn,
            next_scn,
        })
    }

    /// Encode a header block. Exists for fixture generation and the
    /// surrounding tooling; the database side writes these for real.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(REDO_HEADER_SIZE);
        buf.put_u32_le(REDO_MAGIC);
        buf.put_u32_le(self.block_size);
        buf.put_u32_le(self.num_blocks);
        buf.put_u16_le(self.thread);
        buf.put_u16_le(0);
        buf.put_u32_le(self.sequence.value());
        buf.put_u32_le(self.resetlogs);
        buf.put_u64_le(self.first_scn.value());
        buf.put_u64_le(self.next_scn.value());
        buf.put_bytes(0, 20);
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&buf[..]);
        buf.put_u32_le(hasher.finalize());
        buf.freeze()
    }
}

#[derive(Debug, Default)]
struct ReaderState {
    file_name: String,
    paths: Vec<String>,
    thread: ThreadId,
    sequence: Seq,
    first_scn: Scn,
    next_scn: Scn,
    /// `None` until a header has been read ("block count unknown").
    num_blocks: Option<u32>,
    block_size: u32,
}

#[derive(Debug, Default)]
struct BlockBuffer {
    blocks: VecDeque<Bytes>,
    /// Next block index the worker will fetch (block 0 is the header).
    next_block: u32,
}

/// A redo log reader with a background read-ahead worker.
#[derive(Debug)]
pub struct RedoReader {
    group: Group,
    verify_checksum: bool,
    state: RwLock<ReaderState>,
    buffer: Mutex<BlockBuffer>,
    wake: Notify,
    stop: AtomicBool,
    finished: AtomicBool,
}

impl RedoReader {
    fn new(group: Group, verify_checksum: bool) -> Self {
        RedoReader {
            group,
            verify_checksum,
            state: RwLock::new(ReaderState {
                sequence: Seq::NONE,
                first_scn: Scn::NONE,
                next_scn: Scn::NONE,
                ..ReaderState::default()
            }),
            buffer: Mutex::new(BlockBuffer::default()),
            wake: Notify::new(),
            stop: AtomicBool::new(false),
            finished: AtomicBool::new(false),
        }
    }

    pub fn group(&self) -> Group {
        self.group
    }

    pub fn finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    /// Wake the worker (teardown or buffer-space available).
    pub fn wake_up(&self) {
        self.wake.notify_waiters();
    }

    pub async fn file_name(&self) -> String {
        self.state.read().await.file_name.clone()
    }

    pub async fn set_file_name(&self, file_name: impl Into<String>) {
        self.state.write().await.file_name = file_name.into();
    }

    pub async fn paths(&self) -> Vec<String> {
        self.state.read().await.paths.clone()
    }

    pub async fn set_paths(&self, paths: Vec<String>) {
        self.state.write().await.paths = paths;
    }

    pub async fn thread(&self) -> ThreadId {
        self.state.read().await.thread
    }

    pub async fn sequence(&self) -> Seq {
        self.state.read().await.sequence
    }

    pub async fn first_scn(&self) -> Scn {
        self.state.read().await.first_scn
    }

    pub async fn next_scn(&self) -> Scn {
        self.state.read().await.next_scn
    }

    pub async fn num_blocks(&self) -> Option<u32> {
        self.state.read().await.num_blocks
    }

    pub async fn block_size(&self) -> u32 {
        self.state.read().await.block_size
    }

    /// Probe the current `file_name`: open it and validate its header.
    ///
    /// Returns `false` (after a debug log) when the file is missing,
    /// short, or carries a bad header; probing is routine during path
    /// reconciliation and archive availability checks.
    pub async fn check_redo_log(&self) -> bool {
        let file_name = self.file_name().await;
        if file_name.is_empty() {
            return false;
        }
        match self.read_header(&file_name).await {
            Ok(header) => {
                let mut state = self.state.write().await;
                state.thread = header.thread;
                state.sequence = header.sequence;
                state.first_scn = header.first_scn;
                state.next_scn = header.next_scn;
                state.num_blocks = Some(header.num_blocks);
                state.block_size = header.block_size;
                true
            }
            Err(err) => {
                debug!(group = self.group, file = %file_name, "header check failed: {err}");
                false
            }
        }
    }

    /// Refresh the header of the armed file and flush the read-ahead
    /// buffer. The database keeps extending online logs, so `num_blocks`
    /// and `next_scn` move between refreshes.
    pub async fn update_redo_log(&self) -> bool {
        if !self.check_redo_log().await {
            return false;
        }
        let mut buffer = self.buffer.lock().await;
        buffer.blocks.clear();
        buffer.next_block = 1;
        drop(buffer);
        self.wake_up();
        true
    }

    /// Pop one read-ahead block for the parse engine.
    pub async fn next_block(&self) -> Option<Bytes> {
        let mut buffer = self.buffer.lock().await;
        let block = buffer.blocks.pop_front();
        drop(buffer);
        if block.is_some() {
            // Freed a slot; let the worker top the buffer back up.
            self.wake_up();
        }
        block
    }

    /// Log the raw and mapped path of a member that failed its probe.
    pub async fn show_hint(&self, raw: &str, mapped: &str) {
        info!(
            group = self.group,
            "check path: {raw} (mapped to: {mapped})"
        );
    }

    async fn read_header(&self, file_name: &str) -> Result<RedoFileHeader> {
        let mut file = File::open(file_name).await?;
        let mut raw = vec![0u8; REDO_HEADER_SIZE];
        file.read_exact(&mut raw).await?;
        RedoFileHeader::decode(&raw, self.verify_checksum)
    }

    /// Background read-ahead loop. Exits (and marks the reader finished)
    /// when the pool requests a stop.
    async fn run(self: Arc<Self>, ctx: Arc<Ctx>) {
        if ctx.traces.threads {
            debug!(target: "redolith::threads", group = self.group, "reader start");
        }
        loop {
            if self.stop.load(Ordering::SeqCst) || ctx.is_shutdown() {
                break;
            }

            match self.fill_buffer().await {
                Ok(true) => continue,
                Ok(false) => {}
                Err(err) => {
                    warn!(group = self.group, "reader worker error: {err}");
                }
            }

            tokio::select! {
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(Duration::from_millis(10)) => {}
            }
        }
        self.finished.store(true, Ordering::SeqCst);
        if ctx.traces.threads {
            debug!(target: "redolith::threads", group = self.group, "reader stop");
        }
    }

    /// Read the next chunk of blocks into the buffer. Returns `true`
    /// when progress was made and another pass may be useful.
    async fn fill_buffer(&self) -> Result<bool> {
        let (file_name, block_size, num_blocks) = {
            let state = self.state.read().await;
            (
                state.file_name.clone(),
                state.block_size,
                state.num_blocks,
            )
        };
        let (Some(num_blocks), true) = (num_blocks, block_size > 0 && !file_name.is_empty())
        else {
            return Ok(false);
        };

        let (start_block, room) = {
            let buffer = self.buffer.lock().await;
            if buffer.next_block == 0 {
                // Not armed yet; block 0 is the header.
                return Ok(false);
            }
            (
                buffer.next_block,
                READ_AHEAD_BLOCKS.saturating_sub(buffer.blocks.len()),
            )
        };
        if room == 0 || start_block >= num_blocks {
            return Ok(false);
        }

        let count = room.min(READ_CHUNK_BLOCKS).min((num_blocks - start_block) as usize);
        let mut file = File::open(&file_name).await?;
        file.seek(SeekFrom::Start(start_block as u64 * block_size as u64))
            .await?;
        let mut raw = vec![0u8; count * block_size as usize];
        file.read_exact(&mut raw).await?;

        let mut buffer = self.buffer.lock().await;
        // A refresh raced us and rewound the buffer; drop the stale read.
        if buffer.next_block != start_block {
            return Ok(true);
        }
        for chunk in raw.chunks_exact(block_size as usize) {
            buffer.blocks.push_back(Bytes::copy_from_slice(chunk));
        }
        buffer.next_block += count as u32;
        Ok(true)
    }
}

/// Owns every reader and its worker task.
pub struct ReaderPool {
    ctx: Arc<Ctx>,
    verify_checksum: bool,
    readers: std::sync::Mutex<BTreeMap<Group, Arc<RedoReader>>>,
    workers: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl ReaderPool {
    pub fn new(ctx: Arc<Ctx>, verify_checksum: bool) -> Self {
        ReaderPool {
            ctx,
            verify_checksum,
            readers: std::sync::Mutex::new(BTreeMap::new()),
            workers: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Get or create the reader for `group` and spawn its worker.
    /// Idempotent by group.
    pub fn create_reader(&self, group: Group) -> Arc<RedoReader> {
        let mut readers = self.readers.lock().expect("reader pool poisoned");
        if let Some(reader) = readers.get(&group) {
            return reader.clone();
        }
        let reader = Arc::new(RedoReader::new(group, self.verify_checksum));
        readers.insert(group, reader.clone());
        let worker = tokio::spawn(reader.clone().run(self.ctx.clone()));
        self.workers
            .lock()
            .expect("reader pool poisoned")
            .push(worker);
        reader
    }

    pub fn readers(&self) -> Vec<Arc<RedoReader>> {
        self.readers
            .lock()
            .expect("reader pool poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// Drain every reader: wake the stragglers until all report
    /// finished, then join and release the workers.
    pub async fn drop_all(&self) {
        let readers = self.readers();
        for reader in &readers {
            reader.stop.store(true, Ordering::SeqCst);
        }
        loop {
            let mut waking = false;
            for reader in &readers {
                if !reader.finished() {
                    reader.wake_up();
                    waking = true;
                }
            }
            if !waking {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        let workers = std::mem::take(
            &mut *self.workers.lock().expect("reader pool poisoned"),
        );
        for worker in workers {
            let _ = worker.await;
        }
        self.readers.lock().expect("reader pool poisoned").clear();
    }
}

impl std::fmt::Debug for ReaderPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReaderPool")
            .field(
                "groups",
                &self
                    .readers
                    .lock()
                    .expect("reader pool poisoned")
                    .keys()
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn header() -> RedoFileHeader {
        RedoFileHeader {
            block_size: 512,
            num_blocks: 4,
            thread: 1,
            sequence: Seq::new(42),
            resetlogs: 1,
            first_scn: Scn::new(1000),
            next_scn: Scn::new(1200),
        }
    }

    fn write_redo_file(dir: &tempfile::TempDir, name: &str, header: RedoFileHeader) -> String {
        let path = dir.path().join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        let encoded = header.encode();
        file.write_all(&encoded).unwrap();
        // Pad the header block and write the body blocks.
        file.write_all(&vec![0u8; header.block_size as usize - encoded.len()])
            .unwrap();
        for block in 1..header.num_blocks {
            file.write_all(&vec![block as u8; header.block_size as usize])
                .unwrap();
        }
        path.to_string_lossy().into_owned()
    }

    #[test]
    fn header_round_trip() {
        let original = header();
        let decoded = RedoFileHeader::decode(&original.encode(), true).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn header_rejects_bad_magic() {
        let mut raw = header().encode().to_vec();
        raw[0] ^= 0xFF;
        assert!(RedoFileHeader::decode(&raw, false).is_err());
    }

    #[test]
    fn header_rejects_bad_checksum() {
        let mut raw = header().encode().to_vec();
        raw[8] ^= 0xFF;
        assert!(RedoFileHeader::decode(&raw, true).is_err());
        // Without verification the corruption goes unnoticed.
        assert!(RedoFileHeader::decode(&raw, false).is_ok());
    }

    #[tokio::test]
    async fn check_redo_log_populates_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_redo_file(&dir, "1_42_1.arc", header());

        let pool = ReaderPool::new(Arc::new(Ctx::default()), true);
        let reader = pool.create_reader(0);
        reader.set_file_name(&path).await;

        assert!(reader.check_redo_log().await);
        assert_eq!(reader.sequence().await, Seq::new(42));
        assert_eq!(reader.thread().await, 1);
        assert_eq!(reader.first_scn().await, Scn::new(1000));
        assert_eq!(reader.num_blocks().await, Some(4));
        pool.drop_all().await;
    }

    #[tokio::test]
    async fn check_redo_log_rejects_missing_file() {
        let pool = ReaderPool::new(Arc::new(Ctx::default()), true);
        let reader = pool.create_reader(0);
        reader.set_file_name("/nonexistent/1_1_1.arc").await;
        assert!(!reader.check_redo_log().await);
        pool.drop_all().await;
    }

    #[tokio::test]
    async fn create_reader_is_idempotent_by_group() {
        let pool = ReaderPool::new(Arc::new(Ctx::default()), false);
        let a = pool.create_reader(1);
        let b = pool.create_reader(1);
        assert!(Arc::ptr_eq(&a, &b));
        let c = pool.create_reader(2);
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(pool.readers().len(), 2);
        pool.drop_all().await;
    }

    #[tokio::test]
    async fn worker_reads_ahead_after_update() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_redo_file(&dir, "1_42_1.arc", header());

        let pool = ReaderPool::new(Arc::new(Ctx::default()), true);
        let reader = pool.create_reader(0);
        reader.set_file_name(&path).await;
        assert!(reader.update_redo_log().await);

        // Blocks 1..4 become available; block 0 is the header.
        let mut blocks = Vec::new();
        for _ in 0..40 {
            if let Some(block) = reader.next_block().await {
                blocks.push(block);
                if blocks.len() == 3 {
                    break;
                }
            } else {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[0][0], 1);
        assert_eq!(blocks[2][0], 3);
        pool.drop_all().await;
    }

    #[tokio::test]
    async fn drop_all_finishes_every_worker() {
        let pool = ReaderPool::new(Arc::new(Ctx::default()), false);
        let readers: Vec<_> = (0..3).map(|g| pool.create_reader(g)).collect();
        pool.drop_all().await;
        for reader in readers {
            assert!(reader.finished());
        }
        assert!(pool.readers().is_empty());
    }
}
