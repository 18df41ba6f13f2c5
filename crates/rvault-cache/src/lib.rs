//! # rvault-cache
//!
//! Authoritative registry of the on-disk capture artifacts one recorder
//! owns. The cache reconciles three data sources into one view:
//!
//! 1. persisted cache-item rows,
//! 2. the files actually present in the cache directory,
//! 3. a live watch feed of out-of-band filesystem changes.
//!
//! Reconciliation runs once at startup and self-heals every mismatch it
//! finds (duplicate names, dangling rows, orphan files); afterwards the
//! watch feed keeps membership current while the cache's own operations
//! broker file creation, finalization and removal.
//!
//! ## Layout
//!
//! ```text
//! <directory>/            finished artifacts
//! <directory>/creating/   in-flight reservations (write-owning mode only)
//! <browse directory>/     browse copies    (never deleted with the master)
//! <pse directory>/        PSE reports      (never deleted with the master)
//! ```

mod cache;

pub use cache::Cache;

use std::path::PathBuf;
use std::time::Duration;

use rvault_persist::CacheItemRow;
use thiserror::Error;

/// Staging subdirectory for files still being written.
pub const CREATING_SUBDIR: &str = "creating";

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("no cache row for recorder {recorder} at {path}")]
    NoCacheRow { recorder: String, path: PathBuf },

    #[error("no creating item registered for {0}")]
    NotRegistered(String),

    #[error("an item named {0} already exists")]
    AlreadyExists(String),

    #[error(transparent)]
    Fs(#[from] rvault_fs::FsError),

    #[error(transparent)]
    Persist(#[from] rvault_persist::PersistError),
}

pub type Result<T> = std::result::Result<T, CacheError>;

/// Whether this instance owns write access to the staging subdirectory.
///
/// The recorder process opens its cache read-write; the tape-export process
/// opens the same directory read-only and never touches `creating/`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheMode {
    ReadWrite,
    ReadOnly,
}

/// Timing knobs, shrunk to milliseconds by the test suites.
#[derive(Debug, Clone)]
pub struct CacheTuning {
    /// Bound on the watch readiness handshake at startup.
    pub watch_ready_timeout: Duration,
    /// Settle delay before the first lookup for a newly appeared file,
    /// giving its writer time to close and commit its row.
    pub event_settle_delay: Duration,
    /// Delay between lookup retries for a newly appeared file.
    pub event_retry_delay: Duration,
    /// Lookup attempts before a new file is left as an unknown orphan.
    pub event_retries: u32,
}

impl Default for CacheTuning {
    fn default() -> Self {
        CacheTuning {
            watch_ready_timeout: Duration::from_secs(10),
            event_settle_delay: Duration::from_secs(2),
            event_retry_delay: Duration::from_secs(1),
            event_retries: 5,
        }
    }
}

/// Cheap change-detection snapshot for polling clients.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStatus {
    /// Bumped exactly once per externally observable mutation.
    pub change_count: u64,
    /// Finished items plus non-temporary reservations.
    pub num_items: usize,
    /// Bytes across finished items.
    pub total_size: i64,
}

/// One row of a [`Cache::contents`] listing.
#[derive(Debug, Clone, PartialEq)]
pub struct ContentsEntry {
    pub row: CacheItemRow,
    /// Still a reservation, not yet a finished artifact.
    pub creating: bool,
}
