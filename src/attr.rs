//! Stat records and directory entries handed to the mount host.
//!
//! The host consumes plain `stat`-shaped values; the kernel bridge fills
//! its own buffers from them. Mode bits come from `libc` so the records
//! match what the bridge expects on the platforms we mount on.

/// Default file permissions (rw-r--r--).
const FILE_PERM: u32 = 0o644;

/// Default directory permissions (rwxr-xr-x).
const DIR_PERM: u32 = 0o755;

/// A `stat`-shaped record describing one catalog entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    /// File type and permission bits (`S_IFDIR | 0o755` or `S_IFREG | 0o644`).
    pub mode: u32,
    /// Link count; always 1 for projected entries.
    pub nlink: u32,
    /// Size in bytes; 0 for folders.
    pub size: u64,
    /// Access time, seconds since the epoch.
    pub atime: i64,
    /// Modification time, seconds since the epoch.
    pub mtime: i64,
    /// Status-change time, seconds since the epoch.
    pub ctime: i64,
    /// Owning user id.
    pub uid: u32,
    /// Owning group id.
    pub gid: u32,
}

impl FileStat {
    /// Builds the record for a folder.
    pub fn directory(mtime: i64, uid: u32, gid: u32) -> Self {
        Self {
            mode: libc::S_IFDIR as u32 | DIR_PERM,
            nlink: 1,
            size: 0,
            atime: mtime,
            mtime,
            ctime: mtime,
            uid,
            gid,
        }
    }

    /// Builds the record for a regular file.
    pub fn regular(size: u64, mtime: i64, uid: u32, gid: u32) -> Self {
        Self {
            mode: libc::S_IFREG as u32 | FILE_PERM,
            nlink: 1,
            size,
            atime: mtime,
            mtime,
            ctime: mtime,
            uid,
            gid,
        }
    }

    /// Builds the synthetic record for a freshly created file that has not
    /// been uploaded yet: a 0-byte regular file owned by the caller.
    ///
    /// Editors and copy utilities `stat` a file between `create` and
    /// `release`; without this record they would observe it as missing.
    pub fn staged_placeholder(uid: u32, gid: u32) -> Self {
        Self::regular(0, 0, uid, gid)
    }

    /// Returns true if this record describes a directory.
    pub fn is_dir(&self) -> bool {
        self.mode & libc::S_IFMT as u32 == libc::S_IFDIR as u32
    }

    /// Returns true if this record describes a regular file.
    pub fn is_file(&self) -> bool {
        self.mode & libc::S_IFMT as u32 == libc::S_IFREG as u32
    }
}

/// The kind of a directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    /// A folder.
    Directory,
    /// A regular file.
    File,
}

/// One entry produced by `readdir`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// Entry name (a single path component).
    pub name: String,
    /// Entry kind.
    pub kind: EntryKind,
}

impl DirEntry {
    /// Creates a directory entry.
    pub fn new(name: impl Into<String>, kind: EntryKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}
