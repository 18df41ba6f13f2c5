//! # rvault-device
//!
//! Contracts for the hardware-facing collaborators of the pipeline: SDI
//! capture, VTR transport control, the LTO tape drive, MXF file access,
//! browse encoding, PSE analysis and confidence replay.
//!
//! The real implementations live with the capture hardware; everything here
//! is the call surface the core needs, plus scripted fakes in [`testing`]
//! that the session and chunker test suites drive.

pub mod browse;
pub mod testing;

use std::path::Path;
use std::time::{Duration, Instant};

use rvault_types::{CatalogueData, DefectLists, DropOut, PseFailure, PseVerdict, Timecode, VtrError, VtrState};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("capture error: {0}")]
    Capture(String),

    #[error("source file error: {0}")]
    Source(String),

    #[error("writer error: {0}")]
    Writer(String),
}

pub type Result<T> = std::result::Result<T, DeviceError>;

/// One frame of essence: video bytes, per-track audio samples, and the two
/// embedded timecode readings.
#[derive(Debug, Clone, Default)]
pub struct ContentPackage {
    pub video: Vec<u8>,
    pub audio: Vec<Vec<i16>>,
    pub vitc: Timecode,
    pub ltc: Timecode,
}

/// Running stats while a capture is in flight.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecordStats {
    pub frames_written: i64,
}

/// Everything a finished capture hands back.
#[derive(Debug, Clone, Default)]
pub struct CaptureResult {
    /// Total captured duration in frames.
    pub duration: i64,
    /// Defects accumulated while recording.
    pub defects: DefectLists,
    /// Material package identifier of the captured file.
    pub package_uid: String,
    pub file_size: i64,
}

/// SDI capture service.
pub trait Capture: Send {
    fn is_busy(&self) -> bool;
    /// Is the incoming SDI signal present and stable?
    fn signal_ok(&self) -> bool;
    fn start_record(&mut self, path: &Path, browse_path: Option<&Path>) -> bool;
    /// Multi-item capture into fixed-size page files under `dir`.
    fn start_multi_item_record(&mut self, dir: &Path, page_base: &str) -> bool;
    fn stop_record(&mut self) -> Result<CaptureResult>;
    fn stop_multi_item_record(&mut self) -> Result<CaptureResult>;
    fn abort_record(&mut self) -> bool;
    fn record_stats(&self) -> RecordStats;
}

/// VTR transport control.
pub trait VtrControl: Send {
    fn state(&self) -> VtrState;
    fn play(&mut self) -> bool;
    fn stop(&mut self) -> bool;
    fn record(&mut self) -> bool;
    fn standby_on(&mut self) -> bool;
    fn standby_off(&mut self) -> bool;
}

/// Poll a VTR until it reports `want`, bounded by `timeout`.
pub fn wait_for_vtr_state(
    vtr: &dyn VtrControl,
    want: VtrState,
    timeout: Duration,
    poll: Duration,
) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if vtr.state() == want {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(poll);
    }
}

/// Confidence replay of a captured file on the monitoring output.
pub trait ConfidenceReplay: Send {
    fn start(&mut self, file: &Path) -> bool;
    fn stop(&mut self) -> bool;
    fn is_running(&self) -> bool;
}

/// State of the tape in the LTO drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TapeState {
    NotReady,
    Ready,
    Busy,
}

/// State of a running store-to-tape operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreState {
    Idle,
    Transferring,
    Completed,
    Failed,
}

/// Progress snapshot of a store operation. The drive reports one running
/// offset into the file list, not per-file events.
#[derive(Debug, Clone, Default)]
pub struct StoreStats {
    /// Index of the file currently being written.
    pub offset: usize,
    pub state: StoreState,
    /// Name of the file at `offset`.
    pub filename: String,
}

impl Default for StoreState {
    fn default() -> Self {
        StoreState::Idle
    }
}

/// LTO tape drive.
pub trait TapeDrive: Send {
    fn tape_state(&self) -> TapeState;
    fn store_to_tape(&mut self, files: &[String], barcode: &str) -> bool;
    fn store_completed(&self) -> bool;
    fn abort_store(&mut self) -> bool;
    fn store_stats(&self) -> StoreStats;
}

/// Reader over a captured MXF file (or page-file set).
pub trait MxfReader: Send {
    /// All expected pages present and closed?
    fn is_complete(&self) -> bool;
    /// Next frame, or `None` at end of stream.
    fn next_frame(&mut self) -> Result<Option<ContentPackage>>;
    /// Skip up to `count` frames; returns how many were skipped.
    fn skip_frames(&mut self, count: i64) -> Result<i64>;
    /// Discard already-consumed page files to free disk space.
    fn forward_truncate(&mut self) -> Result<()>;
    fn pse_failures(&self) -> &[PseFailure];
    fn vtr_errors(&self) -> &[VtrError];
    fn dropouts(&self) -> &[DropOut];
}

/// Opens a reader over a captured file or page-file set.
pub trait MxfReaderFactory: Send + Sync {
    /// Open the page-file set `base` under `dir` for sequential reading.
    fn open_paged(&self, dir: &Path, base: &str) -> Result<Box<dyn MxfReader>>;
}

/// Which embedded timecode becomes the output file's primary track.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimaryTimecode {
    Vitc,
    Ltc,
}

/// Per-item writer configuration. The parameter set is fixed once at
/// creation; per-format writers interpret the fields they support.
#[derive(Debug, Clone)]
pub struct MxfWriterParams {
    pub component_depth: u8,
    pub aspect_ratio: (u32, u32),
    pub audio_tracks: u8,
    pub include_checksums: bool,
    pub primary_timecode: PrimaryTimecode,
}

impl Default for MxfWriterParams {
    fn default() -> Self {
        MxfWriterParams {
            component_depth: 8,
            aspect_ratio: (4, 3),
            audio_tracks: 2,
            include_checksums: false,
            primary_timecode: PrimaryTimecode::Vitc,
        }
    }
}

/// Writer for one output item file.
pub trait MxfWriter: Send {
    fn write_frame(&mut self, package: &ContentPackage) -> Result<()>;
    /// Close the file, embedding the item's descriptive record and its
    /// rebased defect lists.
    fn complete(&mut self, catalogue: &CatalogueData, defects: &DefectLists) -> Result<()>;
    fn frames_written(&self) -> i64;
}

/// Creates one writer per output item.
pub trait MxfWriterFactory: Send + Sync {
    fn create(&self, path: &Path, params: &MxfWriterParams) -> Result<Box<dyn MxfWriter>>;
}

/// Browse-copy encoder for one output item.
pub trait BrowseEncoder: Send {
    /// One frame: planar 4:2:0 video plus interleaved 16-bit stereo audio.
    fn encode_frame(&mut self, video: &[u8], audio: &[i16]) -> Result<()>;
    fn finish(&mut self) -> Result<()>;
}

pub trait BrowseEncoderFactory: Send + Sync {
    fn create(&self, path: &Path) -> Result<Box<dyn BrowseEncoder>>;
}

/// PSE analysis over one finished item.
pub trait PseAnalyser: Send {
    /// Analyse `file`, write the report to `report`, and return the verdict.
    /// `failures` are the capture-time flags for exactly this item's range,
    /// already rebased to item-relative positions.
    fn analyse(&mut self, file: &Path, report: &Path, failures: &[PseFailure])
        -> Result<PseVerdict>;
}
