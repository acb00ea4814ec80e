//! Test harness for the integration suite.
//!
//! Provides [`MockRemote`], an in-memory implementation of the remote
//! contract with a working change journal and upload polling, and
//! [`TestFs`], a mounted projection over it with convenience helpers for
//! whole-file operations.

// Not all tests use all harness methods
#![allow(dead_code)]

use cirrusfs::remote::{
    Change, ChangeJournal, ChangeRecord, FileKey, FolderKey, RemoteClient, RemoteError,
    RemoteFile, RemoteFileInfo, RemoteFolder, UploadKey, UploadPoll, UPLOAD_STATUS_DONE,
};
use cirrusfs::{MountConfig, VfsAdapter};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Status the mock reports while an upload still has polls to go.
const UPLOAD_STATUS_IN_PROGRESS: i32 = 17;

#[derive(Debug, Clone)]
struct MockFolder {
    key: FolderKey,
    name: String,
    parent: Option<FolderKey>,
    revision: u64,
    created: i64,
}

#[derive(Debug, Clone)]
struct MockFile {
    key: FileKey,
    name: String,
    parent: Option<FolderKey>,
    content: Vec<u8>,
    mtime: i64,
    revision: u64,
}

#[derive(Debug, Default)]
struct RemoteState {
    device_revision: u64,
    folders: HashMap<String, MockFolder>,
    files: HashMap<String, MockFile>,
    journal: Vec<ChangeRecord>,
    uploads: HashMap<String, u32>,
    next_key: u64,
    next_upload: u64,
    clock: i64,
}

impl RemoteState {
    fn bump(&mut self) -> u64 {
        self.device_revision += 1;
        self.device_revision
    }

    fn tick(&mut self) -> i64 {
        self.clock += 1;
        self.clock
    }

    fn new_folder_key(&mut self) -> FolderKey {
        self.next_key += 1;
        FolderKey::parse(&format!("f{:010}", self.next_key)).unwrap()
    }

    fn new_file_key(&mut self) -> FileKey {
        self.next_key += 1;
        FileKey::parse(&format!("q{:014}", self.next_key)).unwrap()
    }

    fn folder_meta(&self, folder: &MockFolder) -> RemoteFolder {
        RemoteFolder {
            key: folder.key.clone(),
            name: folder.name.clone(),
            parent: folder.parent.clone(),
            revision: folder.revision,
            created: folder.created,
        }
    }

    fn file_meta(&self, file: &MockFile) -> RemoteFile {
        RemoteFile {
            key: file.key.clone(),
            name: file.name.clone(),
            parent: file.parent.clone(),
            hash: hex::encode(Sha256::digest(&file.content)),
            size: file.content.len() as u64,
            mtime: file.mtime,
            revision: file.revision,
        }
    }

    /// Resolves a folder path; `Ok(None)` is the account root.
    fn resolve_folder(&self, path: &str) -> Option<Option<FolderKey>> {
        let mut cursor: Option<FolderKey> = None;
        for part in path.split('/').filter(|p| !p.is_empty()) {
            let next = self
                .folders
                .values()
                .find(|f| f.parent == cursor && f.name == part)?;
            cursor = Some(next.key.clone());
        }
        Some(cursor)
    }

    fn resolve_file(&self, path: &str) -> Option<FileKey> {
        let (dir, base) = path.rsplit_once('/')?;
        let parent = self.resolve_folder(if dir.is_empty() { "/" } else { dir })?;
        self.files
            .values()
            .find(|f| f.parent == parent && f.name == base)
            .map(|f| f.key.clone())
    }

    fn record_folder(&mut self, key: &FolderKey) {
        let revision = self.bump();
        if let Some(folder) = self.folders.get_mut(key.as_str()) {
            folder.revision = revision;
        }
        if let Some(folder) = self.folders.get(key.as_str()) {
            let meta = self.folder_meta(folder);
            self.journal.push(ChangeRecord {
                revision,
                change: Change::Folder(meta),
            });
        }
    }

    fn record_file(&mut self, key: &FileKey) {
        let revision = self.bump();
        if let Some(file) = self.files.get_mut(key.as_str()) {
            file.revision = revision;
        }
        if let Some(file) = self.files.get(key.as_str()) {
            let meta = self.file_meta(file);
            self.journal.push(ChangeRecord {
                revision,
                change: Change::File(meta),
            });
        }
    }
}

/// In-memory remote store implementing the full client contract.
pub struct MockRemote {
    account: String,
    state: Mutex<RemoteState>,
    fail_transport: AtomicBool,
    fail_uploads: AtomicBool,
    reset_pending: AtomicBool,
    polls_before_done: AtomicU32,
    content_calls: AtomicU32,
}

impl MockRemote {
    pub fn new(account: &str) -> Arc<Self> {
        Arc::new(Self {
            account: account.to_string(),
            state: Mutex::new(RemoteState {
                clock: 1_700_000_000,
                ..RemoteState::default()
            }),
            fail_transport: AtomicBool::new(false),
            fail_uploads: AtomicBool::new(false),
            reset_pending: AtomicBool::new(false),
            polls_before_done: AtomicU32::new(0),
            content_calls: AtomicU32::new(0),
        })
    }

    /// Makes every network call fail with a transport error.
    pub fn set_fail_transport(&self, fail: bool) {
        self.fail_transport.store(fail, Ordering::SeqCst);
    }

    /// Makes upload initiations fail with a denial.
    pub fn set_fail_uploads(&self, fail: bool) {
        self.fail_uploads.store(fail, Ordering::SeqCst);
    }

    /// Makes the next journal pull demand a wholesale refetch.
    pub fn trigger_reset(&self) {
        self.reset_pending.store(true, Ordering::SeqCst);
    }

    /// Number of in-progress answers before an upload polls as done.
    pub fn set_polls_before_done(&self, polls: u32) {
        self.polls_before_done.store(polls, Ordering::SeqCst);
    }

    /// How many `folder_get_content` calls were made (bootstrap detector).
    pub fn content_call_count(&self) -> u32 {
        self.content_calls.load(Ordering::SeqCst)
    }

    fn check_transport(&self) -> Result<(), RemoteError> {
        if self.fail_transport.load(Ordering::SeqCst) {
            return Err(RemoteError::Transport("mock transport down".into()));
        }
        Ok(())
    }

    /// Creates the folder at `path` out of band, parents included.
    pub fn seed_folder(&self, path: &str) {
        let mut state = self.state.lock();
        let mut cursor: Option<FolderKey> = None;
        for part in path.split('/').filter(|p| !p.is_empty()) {
            let existing = state
                .folders
                .values()
                .find(|f| f.parent == cursor && f.name == part)
                .map(|f| f.key.clone());
            cursor = Some(match existing {
                Some(key) => key,
                None => {
                    let key = state.new_folder_key();
                    let created = state.tick();
                    state.folders.insert(
                        key.as_str().to_string(),
                        MockFolder {
                            key: key.clone(),
                            name: part.to_string(),
                            parent: cursor.clone(),
                            revision: 0,
                            created,
                        },
                    );
                    state.record_folder(&key);
                    key
                }
            });
        }
    }

    /// Creates or replaces the file at `path` out of band.
    pub fn seed_file(&self, path: &str, content: &[u8]) {
        let (dir, base) = path.rsplit_once('/').expect("absolute path");
        if !dir.is_empty() {
            self.seed_folder(dir);
        }
        let mut state = self.state.lock();
        if let Some(key) = state.resolve_file(path) {
            let mtime = state.tick();
            if let Some(file) = state.files.get_mut(key.as_str()) {
                file.content = content.to_vec();
                file.mtime = mtime;
            }
            state.record_file(&key);
            return;
        }
        let parent = state
            .resolve_folder(if dir.is_empty() { "/" } else { dir })
            .expect("parent folder exists");
        let key = state.new_file_key();
        let mtime = state.tick();
        state.files.insert(
            key.as_str().to_string(),
            MockFile {
                key: key.clone(),
                name: base.to_string(),
                parent,
                content: content.to_vec(),
                mtime,
                revision: 0,
            },
        );
        state.record_file(&key);
    }

    /// Replaces the content of an existing file out of band.
    pub fn touch_file(&self, path: &str, content: &[u8]) {
        let mut state = self.state.lock();
        let key = state.resolve_file(path).expect("file exists");
        let mtime = state.tick();
        if let Some(file) = state.files.get_mut(key.as_str()) {
            file.content = content.to_vec();
            file.mtime = mtime;
        }
        state.record_file(&key);
    }

    /// Deletes the file at `path` out of band.
    pub fn remove_file_at(&self, path: &str) {
        let mut state = self.state.lock();
        let key = state.resolve_file(path).expect("file exists");
        state.files.remove(key.as_str());
        let revision = state.bump();
        state.journal.push(ChangeRecord {
            revision,
            change: Change::FileDeleted(key),
        });
    }

    /// Deletes the folder at `path` out of band (subtree included).
    pub fn remove_folder_at(&self, path: &str) {
        let mut state = self.state.lock();
        let key = state
            .resolve_folder(path)
            .flatten()
            .expect("folder exists and is not the root");
        remove_subtree(&mut state, &key);
        let revision = state.bump();
        state.journal.push(ChangeRecord {
            revision,
            change: Change::FolderDeleted(key),
        });
    }

    /// Current content of the file at `path`, if it exists.
    pub fn file_content(&self, path: &str) -> Option<Vec<u8>> {
        let state = self.state.lock();
        let key = state.resolve_file(path)?;
        state.files.get(key.as_str()).map(|f| f.content.clone())
    }

    /// Revision of the file at `path`, if it exists.
    pub fn file_revision(&self, path: &str) -> Option<u64> {
        let state = self.state.lock();
        let key = state.resolve_file(path)?;
        state.files.get(key.as_str()).map(|f| f.revision)
    }

    /// True if a folder exists at `path`.
    pub fn folder_exists(&self, path: &str) -> bool {
        self.state.lock().resolve_folder(path).is_some()
    }
}

fn remove_subtree(state: &mut RemoteState, key: &FolderKey) {
    let children: Vec<FolderKey> = state
        .folders
        .values()
        .filter(|f| f.parent.as_ref() == Some(key))
        .map(|f| f.key.clone())
        .collect();
    for child in children {
        remove_subtree(state, &child);
    }
    state
        .files
        .retain(|_, f| f.parent.as_ref() != Some(key));
    state.folders.remove(key.as_str());
}

impl RemoteClient for MockRemote {
    fn account_id(&self) -> String {
        self.account.clone()
    }

    fn device_status(&self) -> Result<u64, RemoteError> {
        self.check_transport()?;
        Ok(self.state.lock().device_revision)
    }

    fn device_changes(&self, since_revision: u64) -> Result<ChangeJournal, RemoteError> {
        self.check_transport()?;
        if self.reset_pending.swap(false, Ordering::SeqCst) {
            return Ok(ChangeJournal {
                device_revision: self.state.lock().device_revision,
                reset: true,
                records: Vec::new(),
            });
        }
        let state = self.state.lock();
        Ok(ChangeJournal {
            device_revision: state.device_revision,
            reset: false,
            records: state
                .journal
                .iter()
                .filter(|r| r.revision > since_revision)
                .cloned()
                .collect(),
        })
    }

    fn folder_get_content(
        &self,
        key: Option<&FolderKey>,
    ) -> Result<(Vec<RemoteFolder>, Vec<RemoteFile>), RemoteError> {
        self.check_transport()?;
        self.content_calls.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock();
        let parent = key.cloned();
        let folders = state
            .folders
            .values()
            .filter(|f| f.parent == parent)
            .map(|f| state.folder_meta(f))
            .collect();
        let files = state
            .files
            .values()
            .filter(|f| f.parent == parent)
            .map(|f| state.file_meta(f))
            .collect();
        Ok((folders, files))
    }

    fn file_get_info(&self, key: &FileKey) -> Result<RemoteFileInfo, RemoteError> {
        self.check_transport()?;
        let state = self.state.lock();
        let file = state
            .files
            .get(key.as_str())
            .ok_or_else(|| RemoteError::Protocol(format!("unknown file key {key}")))?;
        Ok(RemoteFileInfo {
            file: state.file_meta(file),
            direct_link: format!("mock://{key}"),
        })
    }

    fn folder_create(&self, parent: Option<&FolderKey>, name: &str) -> Result<(), RemoteError> {
        self.check_transport()?;
        let mut state = self.state.lock();
        let key = state.new_folder_key();
        let created = state.tick();
        state.folders.insert(
            key.as_str().to_string(),
            MockFolder {
                key: key.clone(),
                name: name.to_string(),
                parent: parent.cloned(),
                revision: 0,
                created,
            },
        );
        state.record_folder(&key);
        Ok(())
    }

    fn folder_delete(&self, key: &FolderKey) -> Result<(), RemoteError> {
        self.check_transport()?;
        let mut state = self.state.lock();
        if !state.folders.contains_key(key.as_str()) {
            return Err(RemoteError::Protocol(format!("unknown folder key {key}")));
        }
        remove_subtree(&mut state, key);
        let revision = state.bump();
        state.journal.push(ChangeRecord {
            revision,
            change: Change::FolderDeleted(key.clone()),
        });
        Ok(())
    }

    fn file_delete(&self, key: &FileKey) -> Result<(), RemoteError> {
        self.check_transport()?;
        let mut state = self.state.lock();
        if state.files.remove(key.as_str()).is_none() {
            return Err(RemoteError::Protocol(format!("unknown file key {key}")));
        }
        let revision = state.bump();
        state.journal.push(ChangeRecord {
            revision,
            change: Change::FileDeleted(key.clone()),
        });
        Ok(())
    }

    fn download(&self, url: &str, dst: &mut File) -> Result<u64, RemoteError> {
        self.check_transport()?;
        let key = url
            .strip_prefix("mock://")
            .ok_or_else(|| RemoteError::Protocol(format!("bad direct link {url}")))?;
        let content = {
            let state = self.state.lock();
            state
                .files
                .get(key)
                .map(|f| f.content.clone())
                .ok_or_else(|| RemoteError::Denied("direct link expired".into()))?
        };
        dst.seek(SeekFrom::Start(0))
            .and_then(|_| dst.write_all(&content))
            .and_then(|_| dst.set_len(content.len() as u64))
            .map_err(|e| RemoteError::Transport(e.to_string()))?;
        Ok(content.len() as u64)
    }

    fn upload_simple(
        &self,
        parent: Option<&FolderKey>,
        src: &mut File,
        name: &str,
    ) -> Result<UploadKey, RemoteError> {
        self.check_transport()?;
        if self.fail_uploads.load(Ordering::SeqCst) {
            return Err(RemoteError::Denied("upload quota exceeded".into()));
        }
        let content = read_all(src)?;
        let mut state = self.state.lock();
        let key = state.new_file_key();
        let mtime = state.tick();
        state.files.insert(
            key.as_str().to_string(),
            MockFile {
                key: key.clone(),
                name: name.to_string(),
                parent: parent.cloned(),
                content,
                mtime,
                revision: 0,
            },
        );
        state.record_file(&key);
        state.next_upload += 1;
        let upload_key = UploadKey(format!("u{}", state.next_upload));
        let polls = self.polls_before_done.load(Ordering::SeqCst);
        state.uploads.insert(upload_key.0.clone(), polls);
        Ok(upload_key)
    }

    fn upload_patch(&self, key: &FileKey, src: &mut File) -> Result<UploadKey, RemoteError> {
        self.check_transport()?;
        if self.fail_uploads.load(Ordering::SeqCst) {
            return Err(RemoteError::Denied("upload quota exceeded".into()));
        }
        let content = read_all(src)?;
        let mut state = self.state.lock();
        if !state.files.contains_key(key.as_str()) {
            return Err(RemoteError::Protocol(format!("unknown file key {key}")));
        }
        let mtime = state.tick();
        if let Some(file) = state.files.get_mut(key.as_str()) {
            file.content = content;
            file.mtime = mtime;
        }
        state.record_file(key);
        state.next_upload += 1;
        let upload_key = UploadKey(format!("u{}", state.next_upload));
        let polls = self.polls_before_done.load(Ordering::SeqCst);
        state.uploads.insert(upload_key.0.clone(), polls);
        Ok(upload_key)
    }

    fn upload_poll(&self, key: &UploadKey) -> Result<UploadPoll, RemoteError> {
        self.check_transport()?;
        let mut state = self.state.lock();
        let remaining = state
            .uploads
            .get_mut(&key.0)
            .ok_or_else(|| RemoteError::Protocol(format!("unknown upload key {key}")))?;
        if *remaining > 0 {
            *remaining -= 1;
            return Ok(UploadPoll {
                status: UPLOAD_STATUS_IN_PROGRESS,
                file_error: 0,
            });
        }
        Ok(UploadPoll {
            status: UPLOAD_STATUS_DONE,
            file_error: 0,
        })
    }
}

fn read_all(src: &mut File) -> Result<Vec<u8>, RemoteError> {
    let mut content = Vec::new();
    src.seek(SeekFrom::Start(0))
        .and_then(|_| src.read_to_end(&mut content))
        .map_err(|e| RemoteError::Transport(e.to_string()))?;
    Ok(content)
}

/// A mounted projection over a [`MockRemote`].
pub struct TestFs {
    pub fs: VfsAdapter,
    pub remote: Arc<MockRemote>,
    pub cache_file: PathBuf,
    staging: TempDir,
    cache_dir: TempDir,
}

impl TestFs {
    /// Mounts a fresh projection over an empty mock remote.
    pub fn new() -> Self {
        Self::with_remote(MockRemote::new("acct-main"))
    }

    /// Mounts a fresh projection over the given remote.
    pub fn with_remote(remote: Arc<MockRemote>) -> Self {
        let staging = TempDir::new().unwrap();
        let cache_dir = TempDir::new().unwrap();
        let cache_file = cache_dir.path().join("dircache");
        let fs = VfsAdapter::new(remote.clone(), &Self::config(&staging, &cache_file)).unwrap();
        Self {
            fs,
            remote,
            cache_file,
            staging,
            cache_dir,
        }
    }

    fn config(staging: &TempDir, cache_file: &PathBuf) -> MountConfig {
        MountConfig::new(staging.path(), cache_file)
            .update_debounce(Duration::ZERO)
            .upload_poll_interval(Duration::from_millis(1))
    }

    /// Unmounts (persisting the dir cache) and mounts again over the same
    /// remote and directories.
    pub fn restart(self) -> Self {
        let remote = self.remote.clone();
        self.restart_with_remote_arc(remote)
    }

    /// Unmounts and mounts again over a different remote, keeping the
    /// dir-cache file.
    pub fn restart_with_remote_arc(self, remote: Arc<MockRemote>) -> Self {
        self.fs.destroy();
        let TestFs {
            cache_file,
            staging,
            cache_dir,
            ..
        } = self;
        let fs = VfsAdapter::new(remote.clone(), &Self::config(&staging, &cache_file)).unwrap();
        Self {
            fs,
            remote,
            cache_file,
            staging,
            cache_dir,
        }
    }

    /// Creates a file through the adapter and uploads it via release.
    pub fn write_file(&self, path: &str, content: &[u8]) {
        let fh = self.fs.create(path, 0o644).unwrap();
        assert_eq!(self.fs.write(fh, content, 0).unwrap(), content.len());
        self.fs.release(fh).unwrap();
    }

    /// Reads a whole file through the adapter. A `getattr` runs first,
    /// like the host would issue before the open.
    pub fn read_file(&self, path: &str) -> Vec<u8> {
        let _ = self.fs.getattr(path);
        let fh = self.fs.open(path, libc::O_RDONLY).unwrap();
        let content = self.read_handle(fh);
        self.fs.release(fh).unwrap();
        content
    }

    /// Reads everything reachable through an open handle.
    pub fn read_handle(&self, fh: u64) -> Vec<u8> {
        let mut content = Vec::new();
        let mut buf = [0u8; 4096];
        let mut offset = 0u64;
        loop {
            let n = self.fs.read(fh, &mut buf, offset).unwrap();
            if n == 0 {
                break;
            }
            content.extend_from_slice(&buf[..n]);
            offset += n as u64;
        }
        content
    }

    /// Directory listing without `.` and `..`.
    pub fn listing(&self, path: &str) -> Vec<String> {
        let mut names = Vec::new();
        self.fs
            .readdir(path, |name, _| {
                if name != "." && name != ".." {
                    names.push(name.to_string());
                }
            })
            .unwrap();
        names
    }
}
