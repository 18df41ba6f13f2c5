//! # rvault-types
//!
//! Shared data model for the reelvault tape digitisation pipeline.
//!
//! These types travel between the cache, the recording/export sessions and
//! the persistence layer, so they live in their own dependency-free crate.

pub mod defects;
pub mod timecode;

pub use defects::{DefectLists, DropOut, PseFailure, VtrError};
pub use timecode::{Timecode, FRAMES_PER_SECOND};

use serde::{Deserialize, Serialize};

/// Container flavour a tape is captured into.
///
/// The flavour selects the writer parameter set and the browse conversion
/// path: D10 decoders already emit planar 4:2:0, uncompressed capture needs
/// an explicit repack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IngestFormat {
    Uncompressed,
    D10,
}

impl IngestFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestFormat::Uncompressed => "uncompressed",
            IngestFormat::D10 => "d10",
        }
    }
}

/// Transport state reported by a VTR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VtrState {
    NotConnected,
    RemoteLockout,
    TapeUnthreaded,
    Stopped,
    Paused,
    Play,
    FastForward,
    FastRewind,
    Ejecting,
    Recording,
    Seeking,
    Jog,
    Other,
}

impl VtrState {
    /// A VTR we can drive: connected, locally controllable, tape laced up.
    pub fn is_usable(&self) -> bool {
        !matches!(
            self,
            VtrState::NotConnected | VtrState::RemoteLockout | VtrState::TapeUnthreaded
        )
    }
}

/// Lifecycle status of a recording or export session row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStatus {
    InProgress,
    Completed,
    Aborted,
}

/// Who asked for a session to be torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AbortInitiator {
    User,
    System,
}

/// Per-file progress of an LTO transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferStatus {
    NotStarted,
    Started,
    Completed,
    Failed,
}

/// Outcome of a PSE analysis pass over one finished item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PseVerdict {
    #[default]
    Unknown,
    Passed,
    Failed,
}

/// Descriptive record for one item on a source tape, as catalogued.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SourceItem {
    pub spool_number: String,
    pub item_number: u32,
    pub programme_number: String,
    pub magazine_prefix: String,
    pub production_code: String,
    pub programme_title: String,
    pub episode_title: String,
    /// Expected duration in frames, -1 when the catalogue has none.
    pub duration_hint: i64,
}

impl SourceItem {
    pub fn new(spool_number: &str, item_number: u32) -> Self {
        SourceItem {
            spool_number: spool_number.to_string(),
            item_number,
            duration_hint: -1,
            ..SourceItem::default()
        }
    }
}

/// Catalogue export record written after an item reaches LTO tape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogueData {
    pub source: SourceItem,
    /// Barcode of the LTO spool the item now lives on.
    pub lto_spool: String,
    /// Position of the file on that spool (1-based).
    pub lto_item: u32,
    /// Unix seconds of the transfer.
    pub transfer_date: i64,
    pub duration: i64,
}

/// Where a recording session sends its output.
///
/// Closed set: a capture lands on disk and, optionally, on a backup
/// videotape. Match on the variant instead of downcasting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Destination {
    HardDisk(HardDiskDestination),
    VideoTape(VideoTapeDestination),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardDiskDestination {
    pub filename: String,
    pub browse_filename: Option<String>,
    pub pse_filename: Option<String>,
    pub format: IngestFormat,
    /// Bytes on disk once finalized, -1 before.
    pub size: i64,
    /// Frames once finalized, -1 before.
    pub duration: i64,
    pub source: SourceItem,
    pub pse_verdict: PseVerdict,
}

impl HardDiskDestination {
    pub fn new(filename: &str, format: IngestFormat, source: SourceItem) -> Self {
        HardDiskDestination {
            filename: filename.to_string(),
            browse_filename: None,
            pse_filename: None,
            format,
            size: -1,
            duration: -1,
            source,
            pse_verdict: PseVerdict::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoTapeDestination {
    pub barcode: String,
}
