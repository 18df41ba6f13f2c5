//! # rvault-session
//!
//! The recording half of the pipeline: one [`RecordingSession`] drives a
//! single tape-to-disk ingest from record through review to completion,
//! with the [`chunk`] worker splitting a multi-item capture into per-item
//! files along the way.
//!
//! Each session owns one background control thread running a poll loop;
//! the public API only posts commands onto a channel the loop drains once
//! per tick, in a fixed priority order (abort first).

pub mod chunk;
pub mod items;
pub mod session;

pub use items::{Clip, RecordingItem, RecordingItems};
pub use session::{
    RecordingSession, SessionDeps, SessionResult, SessionSetup, SessionSnapshot, SessionState,
    SessionTuning,
};

use rvault_device::MxfWriterParams;
use rvault_types::IngestFormat;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("invalid operation: {0}")]
    Invalid(String),

    #[error(transparent)]
    Cache(#[from] rvault_cache::CacheError),

    #[error(transparent)]
    Persist(#[from] rvault_persist::PersistError),

    #[error(transparent)]
    Device(#[from] rvault_device::DeviceError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SessionError>;

/// Quality and format settings for one ingest.
///
/// Captured by value when the session starts, so later profile edits never
/// affect an in-flight session.
#[derive(Debug, Clone)]
pub struct Profile {
    pub format: IngestFormat,
    pub writer_params: MxfWriterParams,
    pub browse_enabled: bool,
    pub pse_enabled: bool,
    /// Record a backup copy to a second videotape while ingesting.
    pub backup_enabled: bool,
    /// Frame dimensions of the captured video, used by the browse repack.
    pub frame_width: usize,
    pub frame_height: usize,
}

impl Default for Profile {
    fn default() -> Self {
        Profile {
            format: IngestFormat::Uncompressed,
            writer_params: MxfWriterParams::default(),
            browse_enabled: true,
            pse_enabled: true,
            backup_enabled: false,
            frame_width: 720,
            frame_height: 576,
        }
    }
}
