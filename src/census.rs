//! Open-handle census: which paths are open, and in which mode.
//!
//! Two hash-multisets of virtual paths back the POSIX-like exclusion
//! rules layered over the remote's whole-object semantics:
//!
//! 1. a path may be open read-only any number of times concurrently;
//! 2. a path may be open writable only while no other handle of any mode
//!    exists on it;
//! 3. while any handle on a path is open, catalog updates skip that path.
//!
//! A release that finds no census entry, or that leaves a duplicate
//! writable entry behind, is a logic bug rather than a user-visible
//! error: it terminates the process.

use std::collections::HashMap;
use tracing::error;

/// A multiset of path strings with per-path counts.
#[derive(Debug, Default)]
pub struct PathMultiset {
    counts: HashMap<String, u32>,
}

impl PathMultiset {
    /// Creates an empty multiset.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds one occurrence of `path`.
    pub fn add(&mut self, path: &str) {
        *self.counts.entry(path.to_string()).or_insert(0) += 1;
    }

    /// Removes one occurrence of `path`. Returns false if absent.
    pub fn remove(&mut self, path: &str) -> bool {
        match self.counts.get_mut(path) {
            Some(count) => {
                *count -= 1;
                if *count == 0 {
                    self.counts.remove(path);
                }
                true
            }
            None => false,
        }
    }

    /// Returns true if `path` has at least one occurrence.
    pub fn contains(&self, path: &str) -> bool {
        self.counts.contains_key(path)
    }

    /// Returns the occurrence count for `path`.
    pub fn count(&self, path: &str) -> u32 {
        self.counts.get(path).copied().unwrap_or(0)
    }

    /// Returns the number of distinct paths.
    pub fn len(&self) -> usize {
        self.counts.len()
    }

    /// Returns true if no path is present.
    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Iterates over the distinct paths.
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.counts.keys().map(String::as_str)
    }
}

/// The two per-mode multisets of open paths.
#[derive(Debug, Default)]
pub struct OpenCensus {
    readonly: PathMultiset,
    writable: PathMultiset,
}

impl OpenCensus {
    /// Creates an empty census.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a read-only open. Returns false (denied) while a writable
    /// handle exists on the path.
    pub fn try_open_readonly(&mut self, path: &str) -> bool {
        if self.writable.contains(path) {
            return false;
        }
        self.readonly.add(path);
        true
    }

    /// Records a writable open. Returns false (denied) while any handle
    /// exists on the path.
    pub fn try_open_writable(&mut self, path: &str) -> bool {
        if self.readonly.contains(path) || self.writable.contains(path) {
            return false;
        }
        self.writable.add(path);
        true
    }

    /// Removes a read-only census entry.
    ///
    /// # Panics
    ///
    /// Panics if no entry exists: the handle bookkeeping is broken and
    /// continuing would corrupt the projection.
    pub fn release_readonly(&mut self, path: &str) {
        if !self.readonly.remove(path) {
            error!(path = %path, "read-only census entry missing on release");
            panic!("read-only census entry missing on release: {path}");
        }
    }

    /// Removes the writable census entry.
    ///
    /// # Panics
    ///
    /// Panics if no entry exists, or if another writable entry remains
    /// after removal (the exclusion rule allows at most one).
    pub fn release_writable(&mut self, path: &str) {
        if !self.writable.remove(path) {
            error!(path = %path, "writable census entry missing on release");
            panic!("writable census entry missing on release: {path}");
        }
        if self.writable.contains(path) {
            error!(path = %path, "duplicate writable census entry");
            panic!("duplicate writable census entry: {path}");
        }
    }

    /// Returns true if any handle is open on `path`.
    pub fn is_open(&self, path: &str) -> bool {
        self.readonly.contains(path) || self.writable.contains(path)
    }

    /// Returns true if a writable handle is open on `path`.
    pub fn is_writable(&self, path: &str) -> bool {
        self.writable.contains(path)
    }

    /// Returns the first open path equal to `prefix` or beneath it, if
    /// any. Used to keep catalog updates away from subtrees that contain
    /// open files.
    pub fn any_open_under(&self, prefix: &str) -> Option<String> {
        let matches = |p: &str| {
            p == prefix || (p.starts_with(prefix) && p[prefix.len()..].starts_with('/'))
        };
        self.readonly
            .paths()
            .chain(self.writable.paths())
            .find(|&p| matches(p))
            .map(str::to_string)
    }

    /// Returns the number of distinct open paths per mode, read-only
    /// first.
    pub fn len(&self) -> (usize, usize) {
        (self.readonly.len(), self.writable.len())
    }

    /// Returns true if nothing is open.
    pub fn is_empty(&self) -> bool {
        self.readonly.is_empty() && self.writable.is_empty()
    }
}
