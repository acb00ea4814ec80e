//! The VFS adapter: the surface the mount host drives.
//!
//! A thin translation of the host's callbacks onto the folder tree and
//! the handle table. The host guarantees `getattr` precedes most other
//! calls for the same path, so mutations here do not re-check existence;
//! `getattr` is also where the single opportunistic catalog update
//! happens. Errors map to errno through [`crate::error::ToErrno`].

use crate::attr::{EntryKind, FileStat};
use crate::config::MountConfig;
use crate::error::{VfsError, VfsResult};
use crate::handles::{HandleRole, HandleTable, OpenHandle};
use crate::remote::RemoteClient;
use crate::tree::FolderTree;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Adapter between the mount host's VFS callbacks and the projection.
pub struct VfsAdapter {
    tree: Arc<FolderTree>,
    handles: HandleTable,
    cache_file: PathBuf,
}

impl VfsAdapter {
    /// Builds the projection: constructs the tree, then loads the dir
    /// cache or bootstraps from the remote.
    pub fn new(remote: Arc<dyn RemoteClient>, config: &MountConfig) -> VfsResult<Self> {
        let tree = Arc::new(FolderTree::new(remote, config)?);
        tree.load_or_bootstrap(&config.cache_file)?;
        info!(cache_file = %config.cache_file.display(), "projection ready");
        Ok(Self {
            tree,
            handles: HandleTable::new(),
            cache_file: config.cache_file.clone(),
        })
    }

    /// The underlying folder tree.
    pub fn tree(&self) -> &Arc<FolderTree> {
        &self.tree
    }

    /// Number of currently open handles.
    pub fn open_handle_count(&self) -> usize {
        self.handles.len()
    }

    /// Fills a stat record for `path`.
    ///
    /// This is the one place that triggers a non-forced catalog update;
    /// an update failure is logged and the lookup proceeds against the
    /// cached catalog. A path that exists only as a staged create gets a
    /// synthetic 0-byte record owned by the effective uid/gid.
    pub fn getattr(&self, path: &str) -> VfsResult<FileStat> {
        if let Err(e) = self.tree.update(false) {
            warn!(error = %e, "opportunistic update failed");
        }
        match self.tree.getattr(path) {
            Err(VfsError::NotFound(_)) if self.tree.is_writable_open(path) => Ok(
                FileStat::staged_placeholder(self.tree.uid(), self.tree.gid()),
            ),
            other => other,
        }
    }

    /// Emits the entries of the directory at `path`.
    pub fn readdir(
        &self,
        path: &str,
        mut emit: impl FnMut(&str, EntryKind),
    ) -> VfsResult<()> {
        for entry in self.tree.readdir(path)? {
            emit(&entry.name, entry.kind);
        }
        Ok(())
    }

    /// Creates a folder. The mode is ignored; the projection reports
    /// fixed permissions.
    pub fn mkdir(&self, path: &str, _mode: u32) -> VfsResult<()> {
        self.tree.mkdir(path)
    }

    /// Removes a folder. The host has already confirmed existence and
    /// emptiness via `getattr`/`readdir`.
    pub fn rmdir(&self, path: &str) -> VfsResult<()> {
        self.tree.rmdir(path)
    }

    /// Removes a file.
    pub fn unlink(&self, path: &str) -> VfsResult<()> {
        self.tree.unlink(path)
    }

    /// Opens an existing file and returns an opaque handle token.
    ///
    /// Read-only opens stack; a writable open requires the path to be
    /// otherwise closed. The first handle on a path fetches the current
    /// remote content into staging; later handles share that copy, so an
    /// open file stays at the revision captured when it was first opened.
    pub fn open(&self, path: &str, flags: i32) -> VfsResult<u64> {
        let readonly = flags & libc::O_ACCMODE == libc::O_RDONLY;
        let may_refresh = self.tree.begin_open(path, readonly)?;
        let file = match self.tree.open_file(path, may_refresh) {
            Ok(file) => file,
            Err(e) => {
                // roll the census entry back; the open never happened
                self.tree.note_release(path, readonly);
                return Err(e);
            }
        };
        let role = if readonly {
            HandleRole::ReadOnly
        } else {
            HandleRole::WritableExisting
        };
        let fh = self
            .handles
            .insert(OpenHandle::new(file, path.to_string(), role));
        debug!(path = %path, fh, readonly, "opened");
        Ok(fh)
    }

    /// Creates a local-only file and returns an opaque handle token. The
    /// file reaches the remote when the handle is released.
    pub fn create(&self, path: &str, _mode: u32) -> VfsResult<u64> {
        let file = self.tree.begin_create(path)?;
        let fh = self
            .handles
            .insert(OpenHandle::new(file, path.to_string(), HandleRole::LocalNew));
        debug!(path = %path, fh, "created staged file");
        Ok(fh)
    }

    /// Reads from an open handle at the given offset.
    pub fn read(&self, fh: u64, buf: &mut [u8], offset: u64) -> VfsResult<usize> {
        self.handles.read_at(fh, buf, offset)
    }

    /// Writes to an open handle at the given offset.
    pub fn write(&self, fh: u64, buf: &[u8], offset: u64) -> VfsResult<usize> {
        self.handles.write_at(fh, buf, offset)
    }

    /// Releases a handle.
    ///
    /// Read-only handles just close. A writable handle over an existing
    /// file uploads a patch when the content changed; a staged create
    /// performs its initial upload. The census entry, the staged copy,
    /// and the handle are freed on every path, success or not — the host
    /// discards the return value, and a failed upload must not leave the
    /// path locked.
    pub fn release(&self, fh: u64) -> VfsResult<()> {
        let handle = self.handles.remove(fh).ok_or(VfsError::InvalidHandle(fh))?;
        let path = handle.path().to_string();
        let role = handle.role();

        let outcome = match role {
            HandleRole::ReadOnly => Ok(()),
            HandleRole::WritableExisting => self.tree.upload_patch(&path),
            HandleRole::LocalNew => self.tree.upload_new(&path),
        };
        self.tree.note_release(&path, role.is_readonly());
        drop(handle); // closes the staged descriptor

        match outcome {
            Ok(()) => {
                if role != HandleRole::ReadOnly {
                    if let Err(e) = self.tree.update(true) {
                        warn!(path = %path, error = %e, "post-release update failed");
                    }
                }
                debug!(path = %path, fh, "released");
                Ok(())
            }
            Err(e) => {
                error!(path = %path, error = %e, "upload on release failed, staged content discarded");
                Err(VfsError::AccessDenied(format!(
                    "failed to store {path} on the remote"
                )))
            }
        }
    }

    /// Shutdown path: persists the catalog to the dir cache. Failures
    /// are logged and do not block the unmount.
    pub fn destroy(&self) {
        debug!(path = %self.cache_file.display(), "storing dir cache");
        match std::fs::File::create(&self.cache_file) {
            Ok(mut file) => {
                if let Err(e) = self.tree.store_cache(&mut file) {
                    error!(error = %e, "failed to store dir cache");
                }
            }
            Err(e) => {
                error!(error = %e, path = %self.cache_file.display(), "cannot open dir cache for writing");
            }
        }
    }
}
