//! Filesystem path mapping.
//!
//! The capture host rarely mounts the database's storage under the same
//! paths the database catalog reports. An ordered list of
//! `(source_prefix, target_prefix)` pairs rewrites catalog paths into
//! local ones; the first matching prefix wins and at most one
//! substitution is applied per path.

use tracing::debug;

/// Longest path the mapper will produce. Results that would exceed the
/// cap leave the input unchanged.
pub const MAX_PATH_LENGTH: usize = 4096;

/// Ordered prefix rewriter for redo log paths.
#[derive(Debug, Clone, Default)]
pub struct PathMapper {
    mappings: Vec<(String, String)>,
    trace_file: bool,
}

impl PathMapper {
    pub fn new(trace_file: bool) -> Self {
        PathMapper {
            mappings: Vec::new(),
            trace_file,
        }
    }

    /// Build a mapper from configuration pairs, preserving order.
    pub fn from_pairs(pairs: &[(String, String)], trace_file: bool) -> Self {
        let mut mapper = PathMapper::new(trace_file);
        for (source, target) in pairs {
            mapper.add_mapping(source.clone(), target.clone());
        }
        mapper
    }

    /// Register a mapping. Earlier registrations take precedence.
    pub fn add_mapping(&mut self, source: String, target: String) {
        if self.trace_file {
            debug!(target: "redolith::file", "added mapping [{source}] -> [{target}]");
        }
        self.mappings.push((source, target));
    }

    /// Rewrite `path` in place using the first matching prefix.
    ///
    /// No-op when no prefix matches or the rewritten path would exceed
    /// [`MAX_PATH_LENGTH`].
    pub fn apply(&self, path: &mut String) {
        for (source, target) in &self.mappings {
            if !path.as_bytes().starts_with(source.as_bytes()) {
                continue;
            }
            let mapped_len = path.len() - source.len() + target.len();
            if mapped_len >= MAX_PATH_LENGTH {
                return;
            }
            let mut mapped = String::with_capacity(mapped_len);
            mapped.push_str(target);
            mapped.push_str(&path[source.len()..]);
            *path = mapped;
            return;
        }
    }

    /// Convenience for call sites that want the mapped copy.
    pub fn mapped(&self, path: &str) -> String {
        let mut mapped = path.to_string();
        self.apply(&mut mapped);
        mapped
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }
}
