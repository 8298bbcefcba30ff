//! Scalar semantic types shared across the replication engine.
//!
//! Oracle positions are tracked with two counters: the System Change
//! Number (a global commit timestamp) and the per-thread redo log
//! sequence. Both carry a distinguished `NONE` sentinel that is encoded
//! in-band so the types stay `Copy` and map-key friendly.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Redo thread identifier. `0` means "unknown" and is also the archive
/// reader's slot.
pub type ThreadId = u16;

/// Redo log group number. Group `0` is reserved for the archive reader.
pub type Group = i32;

/// System Change Number.
///
/// Totally ordered. `Scn::NONE` is a sentinel meaning "no value"; zero is
/// a valid SCN meaning "not yet observed". `Scn::MAX` is the highest
/// representable real SCN and doubles as the "drain everything" watermark
/// during shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Scn(u64);

impl Scn {
    /// Sentinel: no SCN observed/assigned.
    pub const NONE: Scn = Scn(u64::MAX);
    /// Highest real SCN; used as the drain-everything watermark.
    pub const MAX: Scn = Scn(u64::MAX - 1);
    /// The zero SCN ("not yet observed" but still a value).
    pub const ZERO: Scn = Scn(0);

    pub const fn new(value: u64) -> Self {
        Scn(value)
    }

    pub const fn is_none(self) -> bool {
        self.0 == u64::MAX
    }

    pub const fn is_some(self) -> bool {
        !self.is_none()
    }

    pub const fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Scn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "<none>")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl From<u64> for Scn {
    fn from(value: u64) -> Self {
        Scn(value)
    }
}

impl Default for Scn {
    fn default() -> Self {
        Scn::NONE
    }
}

/// Redo log sequence number, counted per redo thread.
///
/// Same sentinel discipline as [`Scn`]: `Seq::NONE` means "unknown",
/// `Seq::ZERO` is a valid value meaning "no checkpoint recorded yet".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Seq(u32);

impl Seq {
    /// Sentinel: no sequence known.
    pub const NONE: Seq = Seq(u32::MAX);
    pub const ZERO: Seq = Seq(0);

    pub const fn new(value: u32) -> Self {
        Seq(value)
    }

    pub const fn is_none(self) -> bool {
        self.0 == u32::MAX
    }

    pub const fn is_some(self) -> bool {
        !self.is_none()
    }

    /// Unknown or zero, i.e. no usable checkpoint for the thread.
    pub const fn is_unset(self) -> bool {
        self.0 == u32::MAX || self.0 == 0
    }

    pub const fn value(self) -> u32 {
        self.0
    }

    /// The next sequence. Saturates below the sentinel.
    pub fn next(self) -> Seq {
        debug_assert!(self.is_some());
        Seq(self.0.saturating_add(1).min(u32::MAX - 1))
    }
}

impl Default for Seq {
    fn default() -> Self {
        Seq::NONE
    }
}

impl fmt::Display for Seq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "<none>")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl From<u32> for Seq {
    fn from(value: u32) -> Self {
        Seq(value)
    }
}

/// Byte position inside a redo file, expressed as whole blocks.
///
/// Comparison and equality go by absolute byte offset, so offsets from
/// files with different block sizes still compare correctly.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct FileOffset {
    blocks: u32,
    block_size: u32,
}

impl PartialEq for FileOffset {
    fn eq(&self, other: &Self) -> bool {
        self.bytes() == other.bytes()
    }
}

impl Eq for FileOffset {}

impl std::hash::Hash for FileOffset {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.bytes().hash(state);
    }
}

impl FileOffset {
    pub const fn new(blocks: u32, block_size: u32) -> Self {
        FileOffset { blocks, block_size }
    }

    pub const fn zero() -> Self {
        FileOffset {
            blocks: 0,
            block_size: 0,
        }
    }

    pub const fn blocks(self) -> u32 {
        self.blocks
    }

    pub const fn block_size(self) -> u32 {
        self.block_size
    }

    pub const fn bytes(self) -> u64 {
        self.blocks as u64 * self.block_size as u64
    }

    pub const fn is_zero(self) -> bool {
        self.blocks == 0
    }
}

impl PartialOrd for FileOffset {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FileOffset {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.bytes().cmp(&other.bytes())
    }
}

impl fmt::Display for FileOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.blocks, self.bytes())
    }
}

/// One row of the database's online redo log catalog.
///
/// Multiple members of a group share `(thread, group)` and differ only by
/// `path`. Immutable after registration.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RedoLog {
    pub thread: ThreadId,
    pub group: Group,
    pub path: String,
}

impl RedoLog {
    pub fn new(thread: ThreadId, group: Group, path: impl Into<String>) -> Self {
        RedoLog {
            thread,
            group,
            path: path.into(),
        }
    }
}

/// Per-thread replication checkpoint.
///
/// `(sequence, file_offset)` identify the next byte to read from the
/// thread's redo stream; `last_lwn_scn` is the highest SCN whose Log
/// Write Number boundary has been fully observed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ThreadCheckpoint {
    pub sequence: Seq,
    pub file_offset: FileOffset,
    pub last_lwn_scn: Scn,
}

impl Default for ThreadCheckpoint {
    fn default() -> Self {
        ThreadCheckpoint {
            sequence: Seq::ZERO,
            file_offset: FileOffset::zero(),
            last_lwn_scn: Scn::NONE,
        }
    }
}

/// One entry of the database incarnation history (`V$DATABASE_INCARNATION`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbIncarnation {
    pub incarnation: u32,
    pub prior_incarnation: u32,
    pub resetlogs: u32,
    pub resetlogs_scn: Scn,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scn_sentinel_ordering() {
        assert!(Scn::NONE.is_none());
        assert!(Scn::MAX.is_some());
        assert!(Scn::ZERO.is_some());
        assert!(Scn::new(42) < Scn::MAX);
        assert!(Scn::MAX < Scn::NONE);
    }

    #[test]
    fn scn_display() {
        assert_eq!(Scn::new(1000).to_string(), "1000");
        assert_eq!(Scn::NONE.to_string(), "<none>");
    }

    #[test]
    fn seq_next_advances_by_one() {
        assert_eq!(Seq::new(41).next(), Seq::new(42));
        assert_eq!(Seq::ZERO.next(), Seq::new(1));
    }

    #[test]
    fn seq_unset_covers_zero_and_none() {
        assert!(Seq::ZERO.is_unset());
        assert!(Seq::NONE.is_unset());
        assert!(!Seq::new(7).is_unset());
    }

    #[test]
    fn file_offset_orders_by_bytes() {
        // 4 blocks of 512 bytes sort below 1 block of 4096 bytes.
        let small = FileOffset::new(4, 512);
        let large = FileOffset::new(1, 4096);
        assert!(small < large);
        assert_eq!(small.bytes(), 2048);
        assert!(FileOffset::zero() < small);
    }

    #[test]
    fn redo_log_lexicographic_order() {
        let a = RedoLog::new(1, 1, "/u01/redo01a.log");
        let b = RedoLog::new(1, 1, "/u01/redo01b.log");
        let c = RedoLog::new(1, 2, "/u01/redo02a.log");
        let d = RedoLog::new(2, 1, "/u01/redo_t2.log");
        let mut v = vec![d.clone(), c.clone(), b.clone(), a.clone()];
        v.sort();
        assert_eq!(v, vec![a, b, c, d]);
    }

    #[test]
    fn checkpoint_serde_round_trip() {
        let cp = ThreadCheckpoint {
            sequence: Seq::new(42),
            file_offset: FileOffset::new(16, 512),
            last_lwn_scn: Scn::new(123456),
        };
        let json = serde_json::to_string(&cp).unwrap();
        let back: ThreadCheckpoint = serde_json::from_str(&json).unwrap();
        assert_eq!(back.sequence, cp.sequence);
        assert_eq!(back.file_offset, cp.file_offset);
        assert_eq!(back.last_lwn_scn, cp.last_lwn_scn);
    }
}
