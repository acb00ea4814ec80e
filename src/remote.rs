//! Contract with the remote object store.
//!
//! The HTTP transport and its authentication live outside this crate; the
//! projection core consumes the service through [`RemoteClient`]. Keys,
//! change-journal records, and upload polling types are defined here so
//! both sides agree on the wire-adjacent shapes.

use crate::error::{VfsError, VfsResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use thiserror::Error;

/// Terminal success status reported by [`RemoteClient::upload_poll`].
pub const UPLOAD_STATUS_DONE: i32 = 99;

/// Alias accepted in parent-key position that designates the account root.
pub const ROOT_ALIAS: &str = "myfiles";

/// Sentinel key of the local root folder record.
const ROOT_SENTINEL: &str = "root";

/// Maximum length of a folder or file name on the remote.
pub const MAX_NAME_LEN: usize = 255;

/// Opaque identifier of a folder in the remote store.
///
/// Either an 11-character remote ID or the local sentinel `"root"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FolderKey(String);

impl FolderKey {
    /// The sentinel key of the account root.
    pub fn root() -> Self {
        Self(ROOT_SENTINEL.to_string())
    }

    /// Parses a folder key, validating its length.
    pub fn parse(key: &str) -> VfsResult<Self> {
        if key == ROOT_SENTINEL {
            return Ok(Self::root());
        }
        if key.len() != 11 {
            return Err(VfsError::InvalidArg(format!(
                "folder key must be 11 characters: {key:?}"
            )));
        }
        Ok(Self(key.to_string()))
    }

    /// Returns the key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true if this is the root sentinel.
    pub fn is_root(&self) -> bool {
        self.0 == ROOT_SENTINEL
    }
}

impl fmt::Display for FolderKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque identifier of a file in the remote store (11 or 15 characters).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileKey(String);

impl FileKey {
    /// Parses a file key, validating its length.
    pub fn parse(key: &str) -> VfsResult<Self> {
        if key.len() != 11 && key.len() != 15 {
            return Err(VfsError::InvalidArg(format!(
                "file key must be 11 or 15 characters: {key:?}"
            )));
        }
        Ok(Self(key.to_string()))
    }

    /// Returns the key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Normalizes a parent-key argument as accepted by the remote API.
///
/// `None` and the `"myfiles"` alias both designate the account root;
/// anything else must be a valid folder key.
pub fn normalize_parent(parent: Option<&str>) -> VfsResult<Option<FolderKey>> {
    match parent {
        None => Ok(None),
        Some(ROOT_ALIAS) => Ok(None),
        Some(key) => FolderKey::parse(key).map(|k| if k.is_root() { None } else { Some(k) }),
    }
}

/// Validates a single name component against the remote's limits.
pub fn validate_name(name: &str) -> VfsResult<()> {
    if name.is_empty() || name.contains('/') {
        return Err(VfsError::InvalidArg(format!("bad name component: {name:?}")));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(VfsError::NameTooLong(name.to_string()));
    }
    Ok(())
}

/// Errors reported by the remote transport.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// Network-level failure; retriable.
    #[error("transport failure: {0}")]
    Transport(String),

    /// The remote refused the request (ACL, quota, rejected upload).
    #[error("remote refused the request: {0}")]
    Denied(String),

    /// The remote answered with something the client cannot interpret.
    #[error("malformed remote response: {0}")]
    Protocol(String),
}

impl From<RemoteError> for VfsError {
    fn from(e: RemoteError) -> Self {
        match e {
            RemoteError::Transport(msg) => VfsError::Transient(msg),
            RemoteError::Denied(msg) => VfsError::AccessDenied(msg),
            RemoteError::Protocol(msg) => VfsError::CorruptIo(msg),
        }
    }
}

/// Folder metadata as reported by the remote.
#[derive(Debug, Clone)]
pub struct RemoteFolder {
    /// Folder key.
    pub key: FolderKey,
    /// Folder name.
    pub name: String,
    /// Parent folder key; `None` means the account root.
    pub parent: Option<FolderKey>,
    /// Revision at which this metadata was produced.
    pub revision: u64,
    /// Creation time, seconds since the epoch.
    pub created: i64,
}

/// File metadata as reported by the remote.
#[derive(Debug, Clone)]
pub struct RemoteFile {
    /// File key.
    pub key: FileKey,
    /// File name.
    pub name: String,
    /// Parent folder key; `None` means the account root.
    pub parent: Option<FolderKey>,
    /// Content hash, lowercase hex. SHA-256 (64 chars) for current
    /// uploads, MD5 (32 chars) for legacy entries.
    pub hash: String,
    /// Size in bytes.
    pub size: u64,
    /// Modification time, seconds since the epoch.
    pub mtime: i64,
    /// Revision at which this metadata was produced.
    pub revision: u64,
}

/// File metadata plus the short-lived download URL.
#[derive(Debug, Clone)]
pub struct RemoteFileInfo {
    /// The file metadata.
    pub file: RemoteFile,
    /// Direct-link URL for downloading the file's bytes.
    pub direct_link: String,
}

/// One change in the device journal.
#[derive(Debug, Clone)]
pub enum Change {
    /// A folder was created, moved, renamed, or otherwise updated.
    /// The payload carries the post-change metadata.
    Folder(RemoteFolder),
    /// A folder was deleted.
    FolderDeleted(FolderKey),
    /// A file was created, moved, renamed, or its content replaced.
    File(RemoteFile),
    /// A file was deleted.
    FileDeleted(FileKey),
}

/// A journal record: a change stamped with the device revision that
/// produced it.
#[derive(Debug, Clone)]
pub struct ChangeRecord {
    /// Device revision of this change.
    pub revision: u64,
    /// The change itself.
    pub change: Change,
}

/// The ordered journal returned by [`RemoteClient::device_changes`].
#[derive(Debug, Clone, Default)]
pub struct ChangeJournal {
    /// Device revision after the last record.
    pub device_revision: u64,
    /// True when the journal cannot be replayed incrementally (revision
    /// counter wrap or epoch change) and the catalog must be refetched
    /// wholesale.
    pub reset: bool,
    /// The records, in journal order.
    pub records: Vec<ChangeRecord>,
}

/// Handle returned by an upload initiation, used to poll for completion.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UploadKey(pub String);

impl fmt::Display for UploadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One answer from [`RemoteClient::upload_poll`].
#[derive(Debug, Clone, Copy)]
pub struct UploadPoll {
    /// Upload state; [`UPLOAD_STATUS_DONE`] is terminal success.
    pub status: i32,
    /// Nonzero when the remote rejected the upload for good.
    pub file_error: i32,
}

impl UploadPoll {
    /// Returns true if the upload reached terminal success.
    pub fn is_done(&self) -> bool {
        self.status == UPLOAD_STATUS_DONE
    }

    /// Returns true if the upload failed non-recoverably.
    pub fn is_failed(&self) -> bool {
        self.file_error != 0
    }
}

/// The calls the projection core makes against the remote store.
///
/// Uploads read their source descriptor from offset 0; implementations
/// may seek it. `parent` arguments use `None` for the account root.
pub trait RemoteClient: Send + Sync {
    /// Identity of the authenticated account, recorded in the dir cache
    /// and checked when the cache is loaded.
    fn account_id(&self) -> String;

    /// Current device revision of the account's namespace.
    fn device_status(&self) -> Result<u64, RemoteError>;

    /// Ordered change records since (exclusive) the given revision.
    fn device_changes(&self, since_revision: u64) -> Result<ChangeJournal, RemoteError>;

    /// Immediate children of a folder, for bootstrap and refresh.
    fn folder_get_content(
        &self,
        key: Option<&FolderKey>,
    ) -> Result<(Vec<RemoteFolder>, Vec<RemoteFile>), RemoteError>;

    /// File metadata including the direct-link URL.
    fn file_get_info(&self, key: &FileKey) -> Result<RemoteFileInfo, RemoteError>;

    /// Creates a folder under the given parent.
    fn folder_create(&self, parent: Option<&FolderKey>, name: &str) -> Result<(), RemoteError>;

    /// Deletes a folder.
    fn folder_delete(&self, key: &FolderKey) -> Result<(), RemoteError>;

    /// Deletes a file.
    fn file_delete(&self, key: &FileKey) -> Result<(), RemoteError>;

    /// Downloads the bytes behind a direct-link URL into the descriptor.
    /// Returns the number of bytes written.
    fn download(&self, url: &str, dst: &mut File) -> Result<u64, RemoteError>;

    /// Starts an upload of a new file under the given parent.
    fn upload_simple(
        &self,
        parent: Option<&FolderKey>,
        src: &mut File,
        name: &str,
    ) -> Result<UploadKey, RemoteError>;

    /// Starts an upload replacing the content of an existing file.
    fn upload_patch(&self, key: &FileKey, src: &mut File) -> Result<UploadKey, RemoteError>;

    /// Polls the state of an in-flight upload.
    fn upload_poll(&self, key: &UploadKey) -> Result<UploadPoll, RemoteError>;
}
