//! In-memory catalog of the remote namespace.
//!
//! Flat tables of folder and file records keyed by their remote keys.
//! Parent/child relationships are key lists, never pointers, so the
//! naturally cyclic folder graph stays a plain arena. Journal records are
//! applied through [`Catalog::upsert_folder`] / [`Catalog::upsert_file`] /
//! the `remove_*` operations, all of which are idempotent: a record whose
//! revision does not advance the entity is dropped.

use crate::error::{VfsError, VfsResult};
use crate::remote::{FileKey, FolderKey, RemoteFile, RemoteFolder};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::warn;

/// One folder in the catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FolderRecord {
    /// Folder key; the root carries the sentinel key.
    pub key: FolderKey,
    /// Folder name; empty for the root.
    pub name: String,
    /// Parent folder key; `None` only for the root.
    pub parent: Option<FolderKey>,
    /// Last applied revision.
    pub revision: u64,
    /// Creation time, seconds since the epoch.
    pub created: i64,
    /// Keys of child folders. Rebuilt from parent links when a persisted
    /// image is loaded.
    #[serde(default, skip_serializing)]
    pub child_folders: Vec<FolderKey>,
    /// Keys of child files. Rebuilt from parent links on load.
    #[serde(default, skip_serializing)]
    pub child_files: Vec<FileKey>,
}

/// One file in the catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    /// File key.
    pub key: FileKey,
    /// File name, unique within its parent.
    pub name: String,
    /// Parent folder key; top-level files carry the root sentinel.
    pub parent: FolderKey,
    /// Content hash, lowercase hex (SHA-256 or legacy MD5).
    pub hash: String,
    /// Size in bytes.
    pub size: u64,
    /// Modification time, seconds since the epoch.
    pub mtime: i64,
    /// Last applied revision.
    pub revision: u64,
}

/// Outcome of a path resolution.
#[derive(Debug)]
pub enum Resolved<'a> {
    /// The path names a folder.
    Folder(&'a FolderRecord),
    /// The path names a file.
    File(&'a FileRecord),
}

/// The flat folder/file tables.
#[derive(Debug, Clone)]
pub struct Catalog {
    folders: HashMap<FolderKey, FolderRecord>,
    files: HashMap<FileKey, FileRecord>,
}

impl Catalog {
    /// Creates a catalog holding only the root folder.
    pub fn new() -> Self {
        let root = FolderRecord {
            key: FolderKey::root(),
            name: String::new(),
            parent: None,
            revision: 0,
            created: 0,
            child_folders: Vec::new(),
            child_files: Vec::new(),
        };
        let mut folders = HashMap::new();
        folders.insert(root.key.clone(), root);
        Self {
            folders,
            files: HashMap::new(),
        }
    }

    /// Rebuilds a catalog from persisted records.
    ///
    /// Child lists are reconstructed from the parent links; dangling
    /// parents, a missing root, or a parent cycle reject the image.
    pub fn from_records(
        folders: Vec<FolderRecord>,
        files: Vec<FileRecord>,
    ) -> VfsResult<Self> {
        let mut catalog = Self {
            folders: HashMap::new(),
            files: HashMap::new(),
        };
        for mut record in folders {
            record.child_folders.clear();
            record.child_files.clear();
            catalog.folders.insert(record.key.clone(), record);
        }
        match catalog.folders.get(&FolderKey::root()) {
            None => {
                return Err(VfsError::CorruptIo(
                    "catalog image lacks a root folder".to_string(),
                ))
            }
            Some(root) if root.parent.is_some() => {
                return Err(VfsError::CorruptIo(
                    "catalog image gives the root a parent".to_string(),
                ))
            }
            Some(_) => {}
        }

        let keys: Vec<FolderKey> = catalog.folders.keys().cloned().collect();
        for key in &keys {
            if key.is_root() {
                continue;
            }
            let parent = catalog
                .folders
                .get(key)
                .and_then(|r| r.parent.clone())
                .ok_or_else(|| {
                    VfsError::CorruptIo(format!("folder {key} has no parent link"))
                })?;
            let parent_record = catalog.folders.get_mut(&parent).ok_or_else(|| {
                VfsError::CorruptIo(format!("folder {key} references missing parent {parent}"))
            })?;
            parent_record.child_folders.push(key.clone());
        }
        // every folder must reach the root without looping
        for key in &keys {
            let mut cursor = key.clone();
            let mut steps = 0usize;
            while !cursor.is_root() {
                steps += 1;
                if steps > keys.len() {
                    return Err(VfsError::CorruptIo(format!(
                        "parent cycle involving folder {key}"
                    )));
                }
                cursor = match catalog.folders.get(&cursor).and_then(|r| r.parent.clone()) {
                    Some(parent) => parent,
                    None => {
                        return Err(VfsError::CorruptIo(format!(
                            "folder {cursor} detached from the root"
                        )))
                    }
                };
            }
        }

        for record in files {
            let parent_record = catalog.folders.get_mut(&record.parent).ok_or_else(|| {
                VfsError::CorruptIo(format!(
                    "file {} references missing parent {}",
                    record.key, record.parent
                ))
            })?;
            parent_record.child_files.push(record.key.clone());
            catalog.files.insert(record.key.clone(), record);
        }
        Ok(catalog)
    }

    /// Looks up a folder record by key.
    pub fn folder(&self, key: &FolderKey) -> Option<&FolderRecord> {
        self.folders.get(key)
    }

    /// Looks up a file record by key.
    pub fn file(&self, key: &FileKey) -> Option<&FileRecord> {
        self.files.get(key)
    }

    /// Number of folders, the root included.
    pub fn folder_count(&self) -> usize {
        self.folders.len()
    }

    /// Number of files.
    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    /// Iterates over all folder records.
    pub fn folders(&self) -> impl Iterator<Item = &FolderRecord> {
        self.folders.values()
    }

    /// Iterates over all file records.
    pub fn files(&self) -> impl Iterator<Item = &FileRecord> {
        self.files.values()
    }

    /// Resolves an absolute path to a folder or file record.
    pub fn resolve(&self, path: &str) -> VfsResult<Resolved<'_>> {
        let parts = split_path(path)?;
        let mut cursor = self
            .folders
            .get(&FolderKey::root())
            .ok_or_else(|| VfsError::CorruptIo("catalog lost its root folder".to_string()))?;
        for (idx, part) in parts.iter().enumerate() {
            if let Some(next) = cursor
                .child_folders
                .iter()
                .filter_map(|k| self.folders.get(k))
                .find(|f| f.name == *part)
            {
                cursor = next;
                continue;
            }
            if idx + 1 == parts.len() {
                if let Some(file) = cursor
                    .child_files
                    .iter()
                    .filter_map(|k| self.files.get(k))
                    .find(|f| f.name == *part)
                {
                    return Ok(Resolved::File(file));
                }
            }
            return Err(VfsError::NotFound(path.to_string()));
        }
        Ok(Resolved::Folder(cursor))
    }

    /// Resolves a path that must name a folder.
    pub fn resolve_folder(&self, path: &str) -> VfsResult<&FolderRecord> {
        match self.resolve(path)? {
            Resolved::Folder(f) => Ok(f),
            Resolved::File(_) => Err(VfsError::NotFound(path.to_string())),
        }
    }

    /// Resolves a path that must name a file.
    pub fn resolve_file(&self, path: &str) -> VfsResult<&FileRecord> {
        match self.resolve(path)? {
            Resolved::File(f) => Ok(f),
            Resolved::Folder(_) => Err(VfsError::NotFound(path.to_string())),
        }
    }

    /// Returns the absolute path of a folder, if it is attached to the
    /// root.
    pub fn folder_path(&self, key: &FolderKey) -> Option<String> {
        let mut cursor = self.folders.get(key)?;
        let mut names: Vec<&str> = Vec::new();
        let mut steps = 0usize;
        while !cursor.key.is_root() {
            names.push(cursor.name.as_str());
            steps += 1;
            if steps > self.folders.len() {
                return None;
            }
            cursor = self.folders.get(cursor.parent.as_ref()?)?;
        }
        names.reverse();
        Some(format!("/{}", names.join("/")))
    }

    /// Returns the absolute path of a file.
    pub fn file_path(&self, key: &FileKey) -> Option<String> {
        let record = self.files.get(key)?;
        let parent = self.folder_path(&record.parent)?;
        Some(join_child(&parent, &record.name))
    }

    /// Applies folder metadata from the journal or a refresh. Covers
    /// creation, rename, and move. Returns false when the record was
    /// dropped (stale revision, missing parent, or a link that would
    /// produce a cycle).
    pub fn upsert_folder(&mut self, meta: &RemoteFolder) -> bool {
        if meta.key.is_root() {
            return false;
        }
        let parent_key = meta.parent.clone().unwrap_or_else(FolderKey::root);
        if let Some(existing) = self.folders.get(&meta.key) {
            if meta.revision <= existing.revision {
                return false;
            }
        }
        if parent_key == meta.key || self.is_ancestor(&meta.key, &parent_key) {
            warn!(key = %meta.key, parent = %parent_key, "dropping folder record that would create a cycle");
            return false;
        }
        if !self.folders.contains_key(&parent_key) {
            warn!(key = %meta.key, parent = %parent_key, "dropping folder record with unknown parent");
            return false;
        }
        let (child_folders, child_files) = match self.folders.remove(&meta.key) {
            Some(old) => {
                if let Some(old_parent) = old.parent.as_ref().and_then(|p| self.folders.get_mut(p))
                {
                    old_parent.child_folders.retain(|k| k != &meta.key);
                }
                (old.child_folders, old.child_files)
            }
            None => (Vec::new(), Vec::new()),
        };
        self.folders.insert(
            meta.key.clone(),
            FolderRecord {
                key: meta.key.clone(),
                name: meta.name.clone(),
                parent: Some(parent_key.clone()),
                revision: meta.revision,
                created: meta.created,
                child_folders,
                child_files,
            },
        );
        if let Some(parent) = self.folders.get_mut(&parent_key) {
            if !parent.child_folders.contains(&meta.key) {
                parent.child_folders.push(meta.key.clone());
            }
        }
        true
    }

    /// Applies file metadata from the journal or a refresh. Returns false
    /// when the record was dropped.
    pub fn upsert_file(&mut self, meta: &RemoteFile) -> bool {
        let parent_key = meta.parent.clone().unwrap_or_else(FolderKey::root);
        if let Some(existing) = self.files.get(&meta.key) {
            if meta.revision <= existing.revision {
                return false;
            }
        }
        if !self.folders.contains_key(&parent_key) {
            warn!(key = %meta.key, parent = %parent_key, "dropping file record with unknown parent");
            return false;
        }
        if let Some(old) = self.files.remove(&meta.key) {
            if let Some(old_parent) = self.folders.get_mut(&old.parent) {
                old_parent.child_files.retain(|k| k != &meta.key);
            }
        }
        self.files.insert(
            meta.key.clone(),
            FileRecord {
                key: meta.key.clone(),
                name: meta.name.clone(),
                parent: parent_key.clone(),
                hash: meta.hash.clone(),
                size: meta.size,
                mtime: meta.mtime,
                revision: meta.revision,
            },
        );
        if let Some(parent) = self.folders.get_mut(&parent_key) {
            if !parent.child_files.contains(&meta.key) {
                parent.child_files.push(meta.key.clone());
            }
        }
        true
    }

    /// Removes a folder and its whole subtree. Returns false if the key
    /// was unknown (the root is never removed).
    pub fn remove_folder(&mut self, key: &FolderKey) -> bool {
        if key.is_root() {
            return false;
        }
        let Some(record) = self.folders.remove(key) else {
            return false;
        };
        if let Some(parent) = record.parent.as_ref().and_then(|p| self.folders.get_mut(p)) {
            parent.child_folders.retain(|k| k != key);
        }
        for file_key in &record.child_files {
            self.files.remove(file_key);
        }
        let mut stack = record.child_folders;
        while let Some(next) = stack.pop() {
            if let Some(sub) = self.folders.remove(&next) {
                for file_key in &sub.child_files {
                    self.files.remove(file_key);
                }
                stack.extend(sub.child_folders);
            }
        }
        true
    }

    /// Removes a file. Returns false if the key was unknown.
    pub fn remove_file(&mut self, key: &FileKey) -> bool {
        let Some(record) = self.files.remove(key) else {
            return false;
        };
        if let Some(parent) = self.folders.get_mut(&record.parent) {
            parent.child_files.retain(|k| k != key);
        }
        true
    }

    /// Returns true if `ancestor` appears on the parent chain of `key`.
    fn is_ancestor(&self, ancestor: &FolderKey, key: &FolderKey) -> bool {
        let mut cursor = key.clone();
        let mut steps = 0usize;
        while let Some(record) = self.folders.get(&cursor) {
            if &cursor == ancestor {
                return true;
            }
            steps += 1;
            if steps > self.folders.len() {
                return false;
            }
            match &record.parent {
                Some(parent) => cursor = parent.clone(),
                None => return false,
            }
        }
        cursor == *ancestor
    }
}

impl Default for Catalog {
    fn default() -> Self {
        Self::new()
    }
}

/// Splits an absolute path into its components.
pub(crate) fn split_path(path: &str) -> VfsResult<Vec<&str>> {
    if !path.starts_with('/') {
        return Err(VfsError::InvalidArg(format!(
            "path is not absolute: {path:?}"
        )));
    }
    Ok(path.split('/').filter(|c| !c.is_empty()).collect())
}

/// Splits an absolute path into (parent directory, base name), tolerating
/// a trailing slash. The root itself has no base name.
pub(crate) fn split_parent(path: &str) -> VfsResult<(&str, &str)> {
    if !path.starts_with('/') {
        return Err(VfsError::InvalidArg(format!(
            "path is not absolute: {path:?}"
        )));
    }
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(VfsError::InvalidArg("the root has no base name".to_string()));
    }
    let idx = trimmed
        .rfind('/')
        .ok_or_else(|| VfsError::InvalidArg(format!("path is not absolute: {path:?}")))?;
    let dir = if idx == 0 { "/" } else { &trimmed[..idx] };
    Ok((dir, &trimmed[idx + 1..]))
}

/// Joins a parent path and a child name.
pub(crate) fn join_child(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{name}")
    } else {
        format!("{parent}/{name}")
    }
}
