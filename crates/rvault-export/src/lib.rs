//! # rvault-export
//!
//! The tape-export half of the pipeline: one [`TapeExportSession`] selects
//! a batch of finished cache entries (by policy or explicit list), drives
//! the LTO drive through the transfer, tracks per-file progress, and
//! cleans the cache up afterwards.
//!
//! Same concurrency shape as the recording session: one background control
//! thread polls a state machine, with an abort flag checked at the top of
//! every iteration.

pub mod export;
pub mod select;

pub use export::{
    ExportDeps, ExportPolicy, ExportSnapshot, ExportState, ExportTuning, FileProgress,
    Selection, TapeExportSession,
};
pub use select::{select_automatic, Candidate, SelectionLimits};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("invalid selection: {0}")]
    Selection(String),

    #[error(transparent)]
    Cache(#[from] rvault_cache::CacheError),

    #[error(transparent)]
    Persist(#[from] rvault_persist::PersistError),

    #[error(transparent)]
    Fs(#[from] rvault_fs::FsError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ExportError>;
