//! Archived log filename parsing.
//!
//! Archive filenames are produced by the database from the
//! `LOG_ARCHIVE_FORMAT` template. Scanning the template and the filename
//! in lockstep recovers the `(sequence, thread)` pair without guessing.
//!
//! Recognized wildcards:
//!
//! | wildcard | consumes | meaning |
//! |---|---|---|
//! | `%s` / `%S` | digits | sequence number (zero-filled for `%S`) |
//! | `%t` / `%T` | digits | thread id (zero-filled for `%T`) |
//! | `%r` | digits | resetlogs id (discarded) |
//! | `%a` | digits | activation id (discarded) |
//! | `%d` | digits | database id (discarded) |
//! | `%h` | `[0-9a-z]` | hash (discarded) |
//!
//! Anything else in the template must match the filename literally, and
//! both must end together. Matching is exact: no case folding, no regex,
//! no partial matches.

use crate::common::error::warning;
use crate::common::types::{Seq, ThreadId};
use tracing::warn;

/// Identifiers recovered from one archive filename.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchiveName {
    pub sequence: Seq,
    pub thread: ThreadId,
}

impl ArchiveName {
    /// The "unparseable" result: sequence zero, thread zero.
    pub const UNPARSEABLE: ArchiveName = ArchiveName {
        sequence: Seq::ZERO,
        thread: 0,
    };

    pub fn is_unparseable(&self) -> bool {
        self.sequence == Seq::ZERO && self.thread == 0
    }
}

/// Lockstep scanner for `LOG_ARCHIVE_FORMAT` templates.
#[derive(Debug, Clone)]
pub struct ArchiveNameParser {
    format: String,
}

impl ArchiveNameParser {
    pub fn new(format: impl Into<String>) -> Self {
        ArchiveNameParser {
            format: format.into(),
        }
    }

    pub fn format(&self) -> &str {
        &self.format
    }

    /// Extract `(sequence, thread)` from `file_name`.
    ///
    /// On any mismatch returns [`ArchiveName::UNPARSEABLE`] and logs
    /// warning 60028 with both scan positions, matching the original
    /// diagnostics.
    pub fn parse(&self, file_name: &str) -> ArchiveName {
        let format = self.format.as_bytes();
        let file = file_name.as_bytes();
        let mut sequence = Seq::ZERO;
        let mut thread: ThreadId = 1;
        let mut i = 0;
        let mut j = 0;

        while i < format.len() && j < file.len() {
            if format[i] == b'%' {
                let Some(&wildcard) = format.get(i + 1) else {
                    self.diagnose(file_name, i, j, "found end after %");
                    return ArchiveName::UNPARSEABLE;
                };
                let mut digits = 0usize;
                match wildcard {
                    b's' | b'S' | b't' | b'T' | b'r' | b'a' | b'd' => {
                        let mut number: u32 = 0;
                        while j < file.len() && file[j].is_ascii_digit() {
                            number = number.wrapping_mul(10).wrapping_add((file[j] - b'0') as u32);
                            j += 1;
                            digits += 1;
                        }
                        match wildcard {
                            b's' | b'S' => sequence = Seq::new(number),
                            b't' | b'T' => thread = number as ThreadId,
                            _ => {}
                        }
                        i += 2;
                    }
                    b'h' => {
                        while j < file.len()
                            && (file[j].is_ascii_digit() || file[j].is_ascii_lowercase())
                        {
                            j += 1;
                            digits += 1;
                        }
                        i += 2;
                    }
                    _ => {}
                }
                if digits == 0 {
                    self.diagnose(file_name, i, j, "found no number/hash");
                    return ArchiveName::UNPARSEABLE;
                }
            } else if file[j] == format[i] {
                i += 1;
                j += 1;
            } else {
                self.diagnose(file_name, i, j, "found different values");
                return ArchiveName::UNPARSEABLE;
            }
        }

        if i == format.len() && j == file.len() {
            return ArchiveName { sequence, thread };
        }

        self.diagnose(file_name, i, j, "found no sequence");
        ArchiveName::UNPARSEABLE
    }

    fn diagnose(&self, file_name: &str, format_pos: usize, file_pos: usize, detail: &str) {
        warn!(
            code = warning::FILENAME_PARSE,
            "can't get sequence from file: {file_name} log_archive_format: {} at position \
             {file_pos} format position {format_pos}, {detail}",
            self.format
        );
    }
}
