//! The dir-cache image: the catalog persisted across mounts.
//!
//! A framed JSON document with a magic/version header, the identity of
//! the account it was captured from, the last applied device revision,
//! and the folder/file records. Loaders reject the image on any header
//! mismatch and the caller falls back to a full remote bootstrap; a cache
//! is an optimization, never a source of truth.

use crate::catalog::{Catalog, FileRecord, FolderRecord};
use crate::error::VfsError;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use thiserror::Error;

/// Magic tag identifying a dir-cache image.
pub const CACHE_MAGIC: &str = "cirrusfs.dircache";

/// Current schema version.
pub const CACHE_VERSION: u32 = 1;

/// Why a cache image was rejected or could not be written.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Reading or writing the image failed.
    #[error("cache I/O: {0}")]
    Io(#[from] std::io::Error),

    /// The image does not parse or its records are inconsistent.
    #[error("cache image malformed: {0}")]
    Malformed(String),

    /// The image was written by a different schema.
    #[error("cache schema mismatch (magic {magic:?}, version {version})")]
    SchemaMismatch {
        /// Magic tag found in the image.
        magic: String,
        /// Version found in the image.
        version: u32,
    },

    /// The image belongs to a different account than the live client.
    #[error("cache belongs to account {cached:?}, remote reports {live:?}")]
    AccountMismatch {
        /// Account recorded in the image.
        cached: String,
        /// Account of the live remote client.
        live: String,
    },
}

impl From<CacheError> for VfsError {
    fn from(e: CacheError) -> Self {
        VfsError::CorruptIo(e.to_string())
    }
}

/// The serialized form of the catalog.
#[derive(Debug, Serialize, Deserialize)]
pub struct CacheImage {
    /// Must equal [`CACHE_MAGIC`].
    pub magic: String,
    /// Must equal [`CACHE_VERSION`].
    pub version: u32,
    /// Account the catalog was captured from.
    pub account_id: String,
    /// Last applied device revision.
    pub device_revision: u64,
    /// Folder records; child lists are derived on load.
    pub folders: Vec<FolderRecord>,
    /// File records.
    pub files: Vec<FileRecord>,
}

impl CacheImage {
    /// Captures the catalog into an image.
    pub fn capture(account_id: String, device_revision: u64, catalog: &Catalog) -> Self {
        Self {
            magic: CACHE_MAGIC.to_string(),
            version: CACHE_VERSION,
            account_id,
            device_revision,
            folders: catalog.folders().cloned().collect(),
            files: catalog.files().cloned().collect(),
        }
    }

    /// Serializes the image into the sink.
    pub fn write_to(&self, sink: &mut dyn Write) -> Result<(), CacheError> {
        serde_json::to_writer(&mut *sink, self)
            .map_err(|e| CacheError::Malformed(e.to_string()))?;
        sink.flush()?;
        Ok(())
    }

    /// Reads and validates an image against the live account identity.
    pub fn read_from(source: &mut dyn Read, live_account: &str) -> Result<Self, CacheError> {
        let image: CacheImage =
            serde_json::from_reader(source).map_err(|e| CacheError::Malformed(e.to_string()))?;
        if image.magic != CACHE_MAGIC || image.version != CACHE_VERSION {
            return Err(CacheError::SchemaMismatch {
                magic: image.magic,
                version: image.version,
            });
        }
        if image.account_id != live_account {
            return Err(CacheError::AccountMismatch {
                cached: image.account_id,
                live: live_account.to_string(),
            });
        }
        Ok(image)
    }

    /// Rebuilds the catalog and returns it with the recorded revision.
    pub fn into_catalog(self) -> Result<(Catalog, u64), CacheError> {
        let catalog = Catalog::from_records(self.folders, self.files)
            .map_err(|e| CacheError::Malformed(e.to_string()))?;
        Ok((catalog, self.device_revision))
    }
}
