//! # rvault-persist
//!
//! Persistence collaborator for the reelvault pipeline.
//!
//! The core components only ever talk to the [`PersistenceStore`] trait; a
//! relational database behind it is somebody else's problem. Two
//! implementations ship here:
//!
//! - [`MemoryStore`]: mutex-guarded maps, used by every test.
//! - [`JsonStore`]: a [`MemoryStore`] snapshotted to a JSON file on each
//!   mutation, enough for single-host operation of the CLI tools.

pub mod json;
pub mod memory;
pub mod rows;

pub use json::JsonStore;
pub use memory::MemoryStore;
pub use rows::{
    CacheItemRow, CacheRow, CatalogueExportRow, DestinationRow, LtoFileRow, LtoSessionRow,
    SessionRow,
};

use rvault_types::{SessionStatus, TransferStatus};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PersistError {
    #[error("{what} {id} not found")]
    NotFound { what: &'static str, id: i64 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, PersistError>;

/// Durable records for caches, sessions, destinations and LTO transfers.
///
/// Keyed lookups mirror what the pipeline actually asks of its database:
/// cache rows by recorder + path, cache items by cache id (+ filename),
/// sessions and destinations by id, LTO rows by recorder + status.
pub trait PersistenceStore: Send + Sync {
    // --- cache rows -------------------------------------------------------
    fn load_cache_row(&self, recorder: &str, path: &str) -> Result<Option<CacheRow>>;
    fn create_cache_row(&self, recorder: &str, path: &str) -> Result<CacheRow>;

    // --- cache items (hard-disk destinations linked to a cache) -----------
    fn load_cache_items(&self, cache_id: i64) -> Result<Vec<CacheItemRow>>;
    fn find_cache_item(&self, cache_id: i64, filename: &str) -> Result<Option<CacheItemRow>>;
    fn link_cache_item(&self, dest_id: i64, cache_id: i64) -> Result<()>;
    fn unlink_cache_item(&self, dest_id: i64) -> Result<()>;
    /// Write back the mutable projection of a cache item (size, duration,
    /// PSE verdict, sidecar filenames).
    fn update_cache_item(&self, row: &CacheItemRow) -> Result<()>;

    // --- recording sessions ----------------------------------------------
    fn save_session(&self, row: SessionRow) -> Result<i64>;
    fn update_session(&self, row: &SessionRow) -> Result<()>;
    fn load_session(&self, session_id: i64) -> Result<Option<SessionRow>>;
    /// Remove the session row and every destination row under it.
    fn delete_session(&self, session_id: i64) -> Result<()>;

    fn save_destination(&self, row: DestinationRow) -> Result<i64>;
    fn update_destination(&self, row: &DestinationRow) -> Result<()>;
    fn load_destinations(&self, session_id: i64) -> Result<Vec<DestinationRow>>;

    // --- instance numbering ----------------------------------------------
    /// Reserve `count` consecutive recording instance numbers for a spool,
    /// returning the first. Numbers start at 1.
    fn allocate_instance_numbers(&self, spool: &str, count: u32) -> Result<u32>;
    /// Roll the counter back to `first`, releasing a tentative allocation
    /// that turned out unusable.
    fn reset_instance_numbers(&self, spool: &str, first: u32) -> Result<()>;

    // --- LTO transfers ----------------------------------------------------
    fn save_lto_session(&self, row: LtoSessionRow) -> Result<i64>;
    fn update_lto_session(&self, row: &LtoSessionRow) -> Result<()>;
    fn load_lto_sessions(&self, recorder: &str, status: SessionStatus)
        -> Result<Vec<LtoSessionRow>>;
    fn save_lto_file(&self, row: LtoFileRow) -> Result<i64>;
    fn update_lto_file_status(&self, file_id: i64, status: TransferStatus) -> Result<()>;
    fn load_lto_files(&self, lto_session_id: i64) -> Result<Vec<LtoFileRow>>;

    // --- catalogue export -------------------------------------------------
    fn save_catalogue_export(&self, row: CatalogueExportRow) -> Result<i64>;
}
