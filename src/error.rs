//! Error handling and mapping for the VFS surface.
//!
//! This module defines the error taxonomy of the projection core and the
//! conversion to POSIX errno values that the mount host returns to the
//! kernel. Remote transport failures are deliberately not retried here;
//! they surface as [`VfsError::Transient`] (`EAGAIN`) and the host or the
//! user retries.

use std::io;
use thiserror::Error;

/// Errors produced by catalog, handle, and adapter operations.
#[derive(Debug, Error)]
pub enum VfsError {
    /// The path or key does not resolve. Distinct from an I/O failure.
    #[error("no such entry: {0}")]
    NotFound(String),

    /// Exclusion rule violated, remote ACL refusal, or upload rejection.
    #[error("access denied: {0}")]
    AccessDenied(String),

    /// Retriable remote failure (network, throttling). The catalog stays
    /// at the last successfully applied revision.
    #[error("remote temporarily unavailable: {0}")]
    Transient(String),

    /// An internal invariant does not hold or a stored image is broken.
    #[error("corrupt state: {0}")]
    CorruptIo(String),

    /// Malformed path, key of the wrong length, or similar caller error.
    #[error("invalid argument: {0}")]
    InvalidArg(String),

    /// A name component exceeds the remote's 255-byte limit.
    #[error("name too long: {0}")]
    NameTooLong(String),

    /// Unknown open-handle token.
    #[error("invalid file handle: {0}")]
    InvalidHandle(u64),

    /// Local I/O error (staging files, cache file).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl VfsError {
    /// Converts this error to a libc errno value for the mount host.
    pub fn to_errno(&self) -> i32 {
        match self {
            VfsError::NotFound(_) => libc::ENOENT,
            VfsError::AccessDenied(_) => libc::EACCES,
            VfsError::Transient(_) => libc::EAGAIN,
            VfsError::CorruptIo(_) => libc::EIO,
            VfsError::InvalidArg(_) => libc::EINVAL,
            VfsError::NameTooLong(_) => libc::ENAMETOOLONG,
            VfsError::InvalidHandle(_) => libc::EBADF,
            VfsError::Io(e) => io_error_to_errno(e),
        }
    }
}

/// Converts an I/O error to a libc errno value, defaulting to `EIO` when
/// the error carries no raw OS code.
pub fn io_error_to_errno(e: &io::Error) -> i32 {
    e.raw_os_error().unwrap_or(libc::EIO)
}

/// Result type for VFS operations.
pub type VfsResult<T> = Result<T, VfsError>;

/// Extension trait to convert errors to errno.
pub trait ToErrno {
    /// Converts this error to a libc errno value.
    fn to_errno(&self) -> i32;
}

impl ToErrno for VfsError {
    fn to_errno(&self) -> i32 {
        VfsError::to_errno(self)
    }
}

impl ToErrno for io::Error {
    fn to_errno(&self) -> i32 {
        io_error_to_errno(self)
    }
}
