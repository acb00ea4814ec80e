//! Open-handle state and the token table handed to the mount host.
//!
//! Every successful `open`/`create` produces exactly one [`OpenHandle`]
//! owning its staged descriptor and its copy of the virtual path. The
//! host keeps only the opaque token; ownership of the handle transfers
//! back through [`HandleTable::remove`] at release time.

use crate::error::{VfsError, VfsResult};
use dashmap::DashMap;
use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::sync::atomic::{AtomicU64, Ordering};

/// What a handle's release has to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleRole {
    /// Opened read-only; release just closes the staged descriptor.
    ReadOnly,
    /// Opened writable over an existing remote file; release uploads a
    /// patch when the content changed.
    WritableExisting,
    /// Created locally and never uploaded; release performs the initial
    /// upload.
    LocalNew,
}

impl HandleRole {
    /// Returns true for read-only handles.
    pub fn is_readonly(self) -> bool {
        matches!(self, HandleRole::ReadOnly)
    }
}

/// Per-open state: the staged descriptor, the originating path, and the
/// release role.
#[derive(Debug)]
pub struct OpenHandle {
    file: File,
    path: String,
    role: HandleRole,
}

impl OpenHandle {
    /// Creates a handle owning the given staged descriptor.
    pub fn new(file: File, path: String, role: HandleRole) -> Self {
        Self { file, path, role }
    }

    /// The virtual path this handle was opened on.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The release role.
    pub fn role(&self) -> HandleRole {
        self.role
    }

    /// Reads from the staged file at the given offset.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        self.file.read_at(buf, offset)
    }

    /// Writes to the staged file at the given offset.
    pub fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize> {
        self.file.write_at(buf, offset)
    }
}

/// Thread-safe table mapping opaque tokens to open handles.
///
/// Tokens start at 1; 0 is reserved for "no handle".
#[derive(Debug)]
pub struct HandleTable {
    handles: DashMap<u64, OpenHandle>,
    next_id: AtomicU64,
}

impl HandleTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self {
            handles: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Inserts a handle and returns its token.
    pub fn insert(&self, handle: OpenHandle) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.handles.insert(id, handle);
        id
    }

    /// Removes a handle, transferring ownership back to the caller.
    pub fn remove(&self, id: u64) -> Option<OpenHandle> {
        self.handles.remove(&id).map(|(_, handle)| handle)
    }

    /// Reads through the handle with the given token.
    pub fn read_at(&self, id: u64, buf: &mut [u8], offset: u64) -> VfsResult<usize> {
        let handle = self.handles.get(&id).ok_or(VfsError::InvalidHandle(id))?;
        Ok(handle.read_at(buf, offset)?)
    }

    /// Writes through the handle with the given token.
    pub fn write_at(&self, id: u64, buf: &[u8], offset: u64) -> VfsResult<usize> {
        let handle = self.handles.get(&id).ok_or(VfsError::InvalidHandle(id))?;
        Ok(handle.write_at(buf, offset)?)
    }

    /// Number of live handles.
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Returns true if no handle is live.
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}
