//! Mount configuration.
//!
//! Tuning knobs for the projection: where staged files and the dir cache
//! live, how often the catalog opportunistically refreshes, and how fast
//! upload completion is polled.

use std::path::PathBuf;
use std::time::Duration;

/// Default debounce interval for opportunistic catalog updates.
pub const DEFAULT_UPDATE_DEBOUNCE: Duration = Duration::from_secs(2);

/// Default interval between upload-completion polls.
///
/// The remote reports upload state asynchronously; ~1 Hz polling is what
/// the service expects from clients.
pub const DEFAULT_UPLOAD_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Configuration for a mounted projection.
#[derive(Debug, Clone)]
pub struct MountConfig {
    /// Directory where staged files are created (and immediately
    /// unlinked). Must exist and be writable at startup.
    pub staging_dir: PathBuf,

    /// Path of the dir-cache file the catalog is persisted to on unmount
    /// and loaded from at startup.
    pub cache_file: PathBuf,

    /// Minimum interval between non-forced catalog updates. Staleness
    /// between updates is bounded by this value.
    pub update_debounce: Duration,

    /// Interval between polls of an in-flight upload.
    pub upload_poll_interval: Duration,
}

impl MountConfig {
    /// Creates a configuration with default intervals.
    pub fn new(staging_dir: impl Into<PathBuf>, cache_file: impl Into<PathBuf>) -> Self {
        Self {
            staging_dir: staging_dir.into(),
            cache_file: cache_file.into(),
            update_debounce: DEFAULT_UPDATE_DEBOUNCE,
            upload_poll_interval: DEFAULT_UPLOAD_POLL_INTERVAL,
        }
    }

    /// Sets the debounce interval for non-forced updates.
    #[must_use]
    pub fn update_debounce(mut self, interval: Duration) -> Self {
        self.update_debounce = interval;
        self
    }

    /// Sets the upload polling interval.
    #[must_use]
    pub fn upload_poll_interval(mut self, interval: Duration) -> Self {
        self.upload_poll_interval = interval;
        self
    }
}
