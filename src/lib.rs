//! Mountable POSIX projection of a remote cloud storage account.
//!
//! This crate implements the user-space core behind a FUSE-style mount:
//! a cached folder/file catalog kept in sync with the remote's change
//! journal, staged local copies for open files, and the path-based VFS
//! surface the mount host drives.
//!
//! # Architecture
//!
//! - [`FolderTree`] owns the catalog, the open-path census, and the
//!   staging bookkeeping behind a single mutex; network calls are made
//!   with the mutex dropped.
//! - [`VfsAdapter`] translates the host's VFS callbacks into tree and
//!   handle operations and maps errors to errno values.
//! - [`remote::RemoteClient`] is the contract the HTTP transport
//!   implements; the transport itself lives outside this crate, as does
//!   the kernel bridge that delivers the callbacks.
//!
//! # Usage
//!
//! ```ignore
//! use cirrusfs::{MountConfig, VfsAdapter};
//!
//! let config = MountConfig::new("/var/cache/cirrusfs/staging", "/var/cache/cirrusfs/dircache");
//! let fs = VfsAdapter::new(remote, &config)?;
//! // hand `fs` to the mount host; call fs.destroy() on unmount
//! ```

pub mod attr;
pub mod catalog;
pub mod census;
pub mod config;
pub mod error;
pub mod handles;
pub mod persist;
pub mod remote;
pub mod tree;
pub mod vfs;

pub use attr::{DirEntry, EntryKind, FileStat};
pub use catalog::{Catalog, FileRecord, FolderRecord};
pub use census::OpenCensus;
pub use config::MountConfig;
pub use error::{ToErrno, VfsError, VfsResult};
pub use handles::{HandleRole, HandleTable, OpenHandle};
pub use persist::{CacheError, CacheImage};
pub use remote::{
    ChangeJournal, ChangeRecord, FileKey, FolderKey, RemoteClient, RemoteError, UploadKey,
    UploadPoll, UPLOAD_STATUS_DONE,
};
pub use tree::FolderTree;
pub use vfs::VfsAdapter;
