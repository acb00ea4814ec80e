//! The folder tree: the coherent local projection of the remote namespace.
//!
//! One mutex guards the catalog, the open-path census, and the staging
//! bookkeeping as a single group. Every call into the remote is made with
//! that mutex dropped, and preconditions are re-validated after it is
//! re-acquired. Staged files are created in the staging directory and
//! immediately unlinked, so the only live reference is the descriptor and
//! process death cleans them up.

use crate::attr::{DirEntry, EntryKind, FileStat};
use crate::catalog::{join_child, split_parent, Catalog, Resolved};
use crate::census::OpenCensus;
use crate::config::MountConfig;
use crate::error::{VfsError, VfsResult};
use crate::persist::{CacheError, CacheImage};
use crate::remote::{validate_name, Change, ChangeRecord, FolderKey, RemoteClient, UploadKey};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Write};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// The projection of the remote namespace plus the open-handle census.
pub struct FolderTree {
    remote: Arc<dyn RemoteClient>,
    staging_dir: PathBuf,
    update_debounce: Duration,
    upload_poll_interval: Duration,
    uid: u32,
    gid: u32,
    state: Mutex<TreeState>,
}

/// Everything the single mutex guards.
#[derive(Debug)]
struct TreeState {
    catalog: Catalog,
    device_revision: u64,
    census: OpenCensus,
    /// Canonical staged file per open path; handles hold clones of it.
    staging: HashMap<String, File>,
    /// Journal records held back because their path is open, keyed by
    /// that path. Applied when the last handle closes.
    deferred: HashMap<String, Vec<ChangeRecord>>,
    last_update: Option<Instant>,
}

impl FolderTree {
    /// Creates a tree over the given remote client.
    ///
    /// Probes the staging directory for writability; the mount must not
    /// come up with a staging directory it cannot use.
    pub fn new(remote: Arc<dyn RemoteClient>, config: &MountConfig) -> VfsResult<Self> {
        tempfile::tempfile_in(&config.staging_dir).map_err(|e| {
            VfsError::InvalidArg(format!(
                "staging directory {} is not usable: {e}",
                config.staging_dir.display()
            ))
        })?;
        let uid = unsafe { libc::geteuid() };
        let gid = unsafe { libc::getegid() };
        info!(
            staging_dir = %config.staging_dir.display(),
            uid,
            gid,
            account = %remote.account_id(),
            "folder tree initialized"
        );
        Ok(Self {
            remote,
            staging_dir: config.staging_dir.clone(),
            update_debounce: config.update_debounce,
            upload_poll_interval: config.upload_poll_interval,
            uid,
            gid,
            state: Mutex::new(TreeState {
                catalog: Catalog::new(),
                device_revision: 0,
                census: OpenCensus::new(),
                staging: HashMap::new(),
                deferred: HashMap::new(),
                last_update: None,
            }),
        })
    }

    /// Effective user id the projection reports as owner.
    pub fn uid(&self) -> u32 {
        self.uid
    }

    /// Effective group id the projection reports as owner.
    pub fn gid(&self) -> u32 {
        self.gid
    }

    /// Last applied device revision.
    pub fn device_revision(&self) -> u64 {
        self.state.lock().device_revision
    }

    /// Pulls the change journal and applies it.
    ///
    /// Non-forced updates may be debounced. Records touching a path with
    /// open handles are buffered and applied when the last handle closes,
    /// so open files keep the revision captured at open time. On
    /// transport failure the catalog stays at the last good revision.
    pub fn update(&self, force: bool) -> VfsResult<()> {
        let since = {
            let state = self.state.lock();
            if !force {
                if let Some(last) = state.last_update {
                    if last.elapsed() < self.update_debounce {
                        trace!("update debounced");
                        return Ok(());
                    }
                }
            }
            state.device_revision
        };

        let journal = self.remote.device_changes(since)?;
        if journal.reset {
            debug!("remote requires a journal reset, refetching wholesale");
            return self.bootstrap();
        }

        let mut state = self.state.lock();
        let mut applied = 0usize;
        let mut deferred = 0usize;
        for record in journal.records {
            if state.apply_or_defer(record) {
                applied += 1;
            } else {
                deferred += 1;
            }
        }
        if journal.device_revision > state.device_revision {
            state.device_revision = journal.device_revision;
        }
        state.last_update = Some(Instant::now());
        if applied > 0 || deferred > 0 {
            debug!(
                applied,
                deferred,
                revision = state.device_revision,
                "change journal applied"
            );
        }
        Ok(())
    }

    /// Discards the catalog and refetches the whole namespace.
    pub fn bootstrap(&self) -> VfsResult<()> {
        let revision = self.remote.device_status()?;
        let mut catalog = Catalog::new();
        let mut queue = vec![FolderKey::root()];
        while let Some(key) = queue.pop() {
            let parent_arg = if key.is_root() { None } else { Some(&key) };
            let (folders, files) = self.remote.folder_get_content(parent_arg)?;
            for mut meta in folders {
                meta.parent = Some(key.clone());
                queue.push(meta.key.clone());
                catalog.upsert_folder(&meta);
            }
            for mut meta in files {
                meta.parent = Some(key.clone());
                catalog.upsert_file(&meta);
            }
        }
        let mut state = self.state.lock();
        info!(
            revision,
            folders = catalog.folder_count(),
            files = catalog.file_count(),
            "catalog bootstrapped from remote"
        );
        state.catalog = catalog;
        state.device_revision = revision;
        state.deferred.clear();
        state.last_update = Some(Instant::now());
        Ok(())
    }

    /// Loads the catalog from a dir-cache image, validating the header
    /// and the account identity against the live client.
    pub fn load_cache(&self, source: &mut dyn Read) -> Result<(), CacheError> {
        let image = CacheImage::read_from(source, &self.remote.account_id())?;
        let (catalog, revision) = image.into_catalog()?;
        let mut state = self.state.lock();
        debug!(
            revision,
            folders = catalog.folder_count(),
            files = catalog.file_count(),
            "catalog loaded from dir cache"
        );
        state.catalog = catalog;
        state.device_revision = revision;
        Ok(())
    }

    /// Serializes the catalog into a dir-cache image.
    pub fn store_cache(&self, sink: &mut dyn Write) -> Result<(), CacheError> {
        let state = self.state.lock();
        CacheImage::capture(
            self.remote.account_id(),
            state.device_revision,
            &state.catalog,
        )
        .write_to(sink)
    }

    /// Startup path: load the dir cache if it is present and valid, then
    /// catch up through the journal; otherwise bootstrap from scratch.
    pub fn load_or_bootstrap(&self, cache_file: &Path) -> VfsResult<()> {
        match File::open(cache_file) {
            Ok(mut file) => match self.load_cache(&mut file) {
                Ok(()) => self.update(true),
                Err(e) => {
                    warn!(error = %e, "discarding dir cache");
                    self.bootstrap()
                }
            },
            Err(e) => {
                debug!(error = %e, path = %cache_file.display(), "no usable dir cache");
                self.bootstrap()
            }
        }
    }

    /// Fills a stat record for the entry at `path`.
    pub fn getattr(&self, path: &str) -> VfsResult<FileStat> {
        let state = self.state.lock();
        match state.catalog.resolve(path)? {
            Resolved::Folder(f) => Ok(FileStat::directory(f.created, self.uid, self.gid)),
            Resolved::File(f) => Ok(FileStat::regular(f.size, f.mtime, self.uid, self.gid)),
        }
    }

    /// Enumerates `.`, `..`, then the child folders and child files of
    /// the directory at `path`.
    pub fn readdir(&self, path: &str) -> VfsResult<Vec<DirEntry>> {
        let state = self.state.lock();
        let folder = state.catalog.resolve_folder(path)?;
        let mut entries = vec![
            DirEntry::new(".", EntryKind::Directory),
            DirEntry::new("..", EntryKind::Directory),
        ];
        for key in &folder.child_folders {
            if let Some(child) = state.catalog.folder(key) {
                entries.push(DirEntry::new(child.name.clone(), EntryKind::Directory));
            }
        }
        for key in &folder.child_files {
            if let Some(child) = state.catalog.file(key) {
                entries.push(DirEntry::new(child.name.clone(), EntryKind::File));
            }
        }
        Ok(entries)
    }

    /// Resolves a folder path to its key.
    pub fn path_get_key(&self, path: &str) -> VfsResult<FolderKey> {
        let state = self.state.lock();
        Ok(state.catalog.resolve_folder(path)?.key.clone())
    }

    /// Returns true if any handle is open on `path`.
    pub fn is_open(&self, path: &str) -> bool {
        self.state.lock().census.is_open(path)
    }

    /// Returns true if a writable handle is open on `path`.
    pub fn is_writable_open(&self, path: &str) -> bool {
        self.state.lock().census.is_writable(path)
    }

    /// Applies the exclusion rules and records the open in the census.
    /// Returns whether the caller must refresh (no prior handle existed).
    pub(crate) fn begin_open(&self, path: &str, readonly: bool) -> VfsResult<bool> {
        let mut state = self.state.lock();
        let may_refresh = !state.census.is_open(path);
        let granted = if readonly {
            state.census.try_open_readonly(path)
        } else {
            state.census.try_open_writable(path)
        };
        if !granted {
            return Err(VfsError::AccessDenied(format!(
                "{path} is already open in a conflicting mode"
            )));
        }
        Ok(may_refresh)
    }

    /// Materializes (or reuses) the staged copy of the file at `path` and
    /// returns a descriptor for it.
    ///
    /// With `may_refresh` the current remote content is fetched through
    /// the file's direct-link; otherwise the staged copy belonging to the
    /// already-open handles is reused.
    pub fn open_file(&self, path: &str, may_refresh: bool) -> VfsResult<File> {
        if !may_refresh {
            let state = self.state.lock();
            let staged = state.staging.get(path).ok_or_else(|| {
                VfsError::CorruptIo(format!("open handle on {path} has no staged copy"))
            })?;
            return Ok(staged.try_clone()?);
        }

        let key = {
            let state = self.state.lock();
            state.catalog.resolve_file(path)?.key.clone()
        };
        let info = self.remote.file_get_info(&key)?;
        let staged = tempfile::tempfile_in(&self.staging_dir)?;
        let mut dst = staged.try_clone()?;
        let bytes = self.remote.download(&info.direct_link, &mut dst)?;
        trace!(path = %path, bytes, "fetched remote content into staging");

        let mut state = self.state.lock();
        if state.catalog.resolve_file(path).is_err() {
            return Err(VfsError::NotFound(path.to_string()));
        }
        let descriptor = staged.try_clone()?;
        state.staging.insert(path.to_string(), staged);
        Ok(descriptor)
    }

    /// Allocates a fresh, empty, already-unlinked staging file.
    pub fn tmp_open(&self) -> VfsResult<File> {
        Ok(tempfile::tempfile_in(&self.staging_dir)?)
    }

    /// Create path: allocates a staging file for a new local-only file,
    /// records the writable census entry, and returns the descriptor.
    pub(crate) fn begin_create(&self, path: &str) -> VfsResult<File> {
        let (_, base) = split_parent(path)?;
        validate_name(base)?;
        let staged = self.tmp_open()?;
        let mut state = self.state.lock();
        if !state.census.try_open_writable(path) {
            return Err(VfsError::AccessDenied(format!(
                "{path} is already open in a conflicting mode"
            )));
        }
        let descriptor = staged.try_clone()?;
        state.staging.insert(path.to_string(), staged);
        Ok(descriptor)
    }

    /// Removes the census entry for a released handle. When the last
    /// handle on the path closes, the staged copy is dropped and any
    /// buffered journal records for the path are applied.
    ///
    /// # Panics
    ///
    /// Panics when the census has no matching entry; that is a handle
    /// bookkeeping bug, not a user error.
    pub fn note_release(&self, path: &str, readonly: bool) {
        let mut state = self.state.lock();
        if readonly {
            state.census.release_readonly(path);
        } else {
            state.census.release_writable(path);
        }
        if !state.census.is_open(path) {
            state.staging.remove(path);
            if let Some(records) = state.deferred.remove(path) {
                debug!(path = %path, count = records.len(), "applying deferred changes");
                for record in records {
                    state.apply_record(record);
                }
            }
        }
    }

    /// Uploads the staged content of `path` as a new revision of the
    /// existing remote file, then polls until the upload is terminal.
    ///
    /// When the cached remote hash is SHA-256 the staged content is
    /// hashed first and an unchanged file skips the upload entirely.
    /// Legacy MD5 hashes cannot be recomputed here, so those files always
    /// upload.
    pub fn upload_patch(&self, path: &str) -> VfsResult<()> {
        let (key, remote_hash, staged) = {
            let state = self.state.lock();
            let record = state.catalog.resolve_file(path)?;
            let staged = state
                .staging
                .get(path)
                .ok_or_else(|| {
                    VfsError::CorruptIo(format!("open handle on {path} has no staged copy"))
                })?
                .try_clone()?;
            (record.key.clone(), record.hash.clone(), staged)
        };

        if remote_hash.len() == Sha256::output_size() * 2 {
            let staged_hash = hash_staged(&staged)?;
            if staged_hash.eq_ignore_ascii_case(&remote_hash) {
                debug!(path = %path, "staged content unchanged, skipping patch upload");
                return Ok(());
            }
        }

        let mut src = staged;
        let upload_key = self.remote.upload_patch(&key, &mut src)?;
        debug!(path = %path, key = %key, upload_key = %upload_key, "patch upload started");
        self.poll_upload(&upload_key)
    }

    /// Uploads a locally created file to its parent folder, then polls
    /// until the upload is terminal.
    pub fn upload_new(&self, path: &str) -> VfsResult<()> {
        let (dir, base) = split_parent(path)?;
        let (parent, staged) = {
            let state = self.state.lock();
            let parent = if dir == "/" {
                FolderKey::root()
            } else {
                state.catalog.resolve_folder(dir)?.key.clone()
            };
            let staged = state
                .staging
                .get(path)
                .ok_or_else(|| {
                    VfsError::CorruptIo(format!("open handle on {path} has no staged copy"))
                })?
                .try_clone()?;
            (parent, staged)
        };

        let parent_arg = if parent.is_root() { None } else { Some(&parent) };
        let mut src = staged;
        let upload_key = self.remote.upload_simple(parent_arg, &mut src, base)?;
        debug!(path = %path, upload_key = %upload_key, "initial upload started");
        self.poll_upload(&upload_key)
    }

    /// Polls an in-flight upload until terminal success or failure.
    fn poll_upload(&self, key: &UploadKey) -> VfsResult<()> {
        loop {
            let poll = self.remote.upload_poll(key)?;
            trace!(status = poll.status, file_error = poll.file_error, "upload poll");
            if poll.is_failed() {
                return Err(VfsError::AccessDenied(format!(
                    "remote rejected upload (file error {})",
                    poll.file_error
                )));
            }
            if poll.is_done() {
                return Ok(());
            }
            std::thread::sleep(self.upload_poll_interval);
        }
    }

    /// Creates a folder at `path` on the remote and syncs the catalog.
    pub fn mkdir(&self, path: &str) -> VfsResult<()> {
        let (dir, base) = split_parent(path)?;
        validate_name(base)?;
        let parent = {
            let state = self.state.lock();
            if dir == "/" {
                FolderKey::root()
            } else {
                state.catalog.resolve_folder(dir)?.key.clone()
            }
        };
        let parent_arg = if parent.is_root() { None } else { Some(&parent) };
        self.remote.folder_create(parent_arg, base)?;
        debug!(path = %path, "folder created");
        self.update(true)
    }

    /// Deletes the folder at `path` on the remote and syncs the catalog.
    ///
    /// Existence, emptiness, and not-root are the host's business; it has
    /// issued `getattr`/`readdir` beforehand.
    pub fn rmdir(&self, path: &str) -> VfsResult<()> {
        let key = self.path_get_key(path)?;
        if key.is_root() {
            return Err(VfsError::AccessDenied("cannot remove the root".to_string()));
        }
        self.remote.folder_delete(&key)?;
        debug!(path = %path, key = %key, "folder deleted");
        self.update(true)
    }

    /// Deletes the file at `path` on the remote and syncs the catalog.
    pub fn unlink(&self, path: &str) -> VfsResult<()> {
        let key = {
            let state = self.state.lock();
            state.catalog.resolve_file(path)?.key.clone()
        };
        self.remote.file_delete(&key)?;
        debug!(path = %path, key = %key, "file deleted");
        self.update(true)
    }
}

impl TreeState {
    /// Applies a journal record, or buffers it when it touches a path
    /// that currently has open handles. Returns true when applied.
    fn apply_or_defer(&mut self, record: ChangeRecord) -> bool {
        if let Some(held) = self.held_path_for(&record) {
            trace!(path = %held, "deferring change on held-open path");
            self.deferred.entry(held).or_default().push(record);
            return false;
        }
        self.apply_record(record);
        true
    }

    /// Applies a record to the catalog. Idempotence lives in the catalog:
    /// stale revisions are dropped there.
    fn apply_record(&mut self, record: ChangeRecord) {
        match record.change {
            Change::Folder(meta) => {
                self.catalog.upsert_folder(&meta);
            }
            Change::FolderDeleted(key) => {
                self.catalog.remove_folder(&key);
            }
            Change::File(meta) => {
                self.catalog.upsert_file(&meta);
            }
            Change::FileDeleted(key) => {
                self.catalog.remove_file(&key);
            }
        }
    }

    /// Returns the open path a record must not disturb, if any: the
    /// entity's current path, its post-change path, or for folders any
    /// open file underneath.
    fn held_path_for(&self, record: &ChangeRecord) -> Option<String> {
        match &record.change {
            Change::File(meta) => {
                if let Some(current) = self.catalog.file_path(&meta.key) {
                    if self.census.is_open(&current) {
                        return Some(current);
                    }
                }
                let parent = meta.parent.clone().unwrap_or_else(FolderKey::root);
                if let Some(parent_path) = self.catalog.folder_path(&parent) {
                    let target = join_child(&parent_path, &meta.name);
                    if self.census.is_open(&target) {
                        return Some(target);
                    }
                }
                None
            }
            Change::FileDeleted(key) => {
                let current = self.catalog.file_path(key)?;
                self.census.is_open(&current).then_some(current)
            }
            Change::Folder(meta) => {
                let current = self.catalog.folder_path(&meta.key)?;
                self.census.any_open_under(&current)
            }
            Change::FolderDeleted(key) => {
                let current = self.catalog.folder_path(key)?;
                self.census.any_open_under(&current)
            }
        }
    }
}

/// SHA-256 of a staged file's content, lowercase hex.
fn hash_staged(file: &File) -> std::io::Result<String> {
    let mut hasher = Sha256::new();
    let mut offset = 0u64;
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read_at(&mut buf, offset)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        offset += n as u64;
    }
    Ok(hex::encode(hasher.finalize()))
}
