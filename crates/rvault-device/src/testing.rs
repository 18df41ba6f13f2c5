//! Scripted fakes for every device contract.
//!
//! All fakes are cheap handles over shared state (`Arc<Mutex<_>>`), so a
//! test keeps one clone for scripting and assertions while the component
//! under test owns another behind a `Box<dyn Trait>`.

use std::collections::HashMap;
use std::fs::File;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use rvault_types::{
    CatalogueData, DefectLists, DropOut, PseFailure, PseVerdict, Timecode, VtrError, VtrState,
};

use crate::{
    BrowseEncoder, BrowseEncoderFactory, Capture, CaptureResult, ConfidenceReplay, ContentPackage,
    DeviceError, MxfReader, MxfWriter, MxfWriterFactory, MxfWriterParams, PseAnalyser,
    RecordStats, Result, StoreState, StoreStats, TapeDrive, TapeState, VtrControl,
};

// ---------------------------------------------------------------------------
// VTR
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct VtrInner {
    state: VtrState,
    respond: bool,
    commands: Vec<&'static str>,
}

/// VTR whose transport state moves as the commands say it should.
#[derive(Debug, Clone)]
pub struct FakeVtr {
    inner: Arc<Mutex<VtrInner>>,
}

impl FakeVtr {
    pub fn new(state: VtrState) -> Self {
        FakeVtr {
            inner: Arc::new(Mutex::new(VtrInner { state, respond: true, commands: Vec::new() })),
        }
    }

    pub fn set_state(&self, state: VtrState) {
        self.inner.lock().unwrap().state = state;
    }

    /// When false, every command fails and the state stays put.
    pub fn set_respond(&self, respond: bool) {
        self.inner.lock().unwrap().respond = respond;
    }

    pub fn commands(&self) -> Vec<&'static str> {
        self.inner.lock().unwrap().commands.clone()
    }

    fn command(&self, name: &'static str, new_state: Option<VtrState>) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if !inner.respond {
            return false;
        }
        inner.commands.push(name);
        if let Some(state) = new_state {
            inner.state = state;
        }
        true
    }
}

impl VtrControl for FakeVtr {
    fn state(&self) -> VtrState {
        self.inner.lock().unwrap().state
    }

    fn play(&mut self) -> bool {
        self.command("play", Some(VtrState::Play))
    }

    fn stop(&mut self) -> bool {
        self.command("stop", Some(VtrState::Stopped))
    }

    fn record(&mut self) -> bool {
        self.command("record", Some(VtrState::Recording))
    }

    fn standby_on(&mut self) -> bool {
        self.command("standby_on", Some(VtrState::Paused))
    }

    fn standby_off(&mut self) -> bool {
        self.command("standby_off", None)
    }
}

// ---------------------------------------------------------------------------
// Capture
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct CaptureInner {
    busy: bool,
    signal: bool,
    accept_start: bool,
    single_path: Option<PathBuf>,
    multi_page: Option<PathBuf>,
    result: CaptureResult,
    stats: RecordStats,
    aborted: bool,
}

/// Capture service with a scripted stop result.
#[derive(Debug, Clone)]
pub struct FakeCapture {
    inner: Arc<Mutex<CaptureInner>>,
}

impl Default for FakeCapture {
    fn default() -> Self {
        FakeCapture {
            inner: Arc::new(Mutex::new(CaptureInner {
                busy: false,
                signal: true,
                accept_start: true,
                single_path: None,
                multi_page: None,
                result: CaptureResult::default(),
                stats: RecordStats::default(),
                aborted: false,
            })),
        }
    }
}

impl FakeCapture {
    pub fn new() -> Self {
        FakeCapture::default()
    }

    pub fn set_signal(&self, ok: bool) {
        self.inner.lock().unwrap().signal = ok;
    }

    pub fn set_busy(&self, busy: bool) {
        self.inner.lock().unwrap().busy = busy;
    }

    pub fn refuse_start(&self) {
        self.inner.lock().unwrap().accept_start = false;
    }

    /// What `stop_record`/`stop_multi_item_record` will return.
    pub fn script_result(&self, result: CaptureResult) {
        self.inner.lock().unwrap().result = result;
    }

    pub fn set_stats(&self, frames_written: i64) {
        self.inner.lock().unwrap().stats = RecordStats { frames_written };
    }

    pub fn was_aborted(&self) -> bool {
        self.inner.lock().unwrap().aborted
    }

    fn finish(&self, multi: bool) -> Result<CaptureResult> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.busy {
            return Err(DeviceError::Capture("no capture in progress".into()));
        }
        inner.busy = false;
        let path = if multi { inner.multi_page.take() } else { inner.single_path.take() };
        if let Some(path) = path {
            // Leave the scripted number of bytes on disk so stat agrees.
            let mut file = File::create(&path)?;
            file.write_all(&vec![0u8; inner.result.file_size.max(0) as usize])?;
        }
        Ok(inner.result.clone())
    }
}

impl Capture for FakeCapture {
    fn is_busy(&self) -> bool {
        self.inner.lock().unwrap().busy
    }

    fn signal_ok(&self) -> bool {
        self.inner.lock().unwrap().signal
    }

    fn start_record(&mut self, path: &Path, _browse_path: Option<&Path>) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if !inner.accept_start || inner.busy {
            return false;
        }
        inner.busy = true;
        inner.single_path = Some(path.to_path_buf());
        true
    }

    fn start_multi_item_record(&mut self, dir: &Path, page_base: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if !inner.accept_start || inner.busy {
            return false;
        }
        inner.busy = true;
        inner.multi_page = Some(dir.join(format!("{}__0.mxfp", page_base)));
        true
    }

    fn stop_record(&mut self) -> Result<CaptureResult> {
        self.finish(false)
    }

    fn stop_multi_item_record(&mut self) -> Result<CaptureResult> {
        self.finish(true)
    }

    fn abort_record(&mut self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        inner.busy = false;
        inner.aborted = true;
        true
    }

    fn record_stats(&self) -> RecordStats {
        self.inner.lock().unwrap().stats
    }
}

// ---------------------------------------------------------------------------
// Confidence replay
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct ReplayInner {
    running: bool,
    current: Option<PathBuf>,
    started: Vec<PathBuf>,
}

#[derive(Debug, Clone, Default)]
pub struct FakeReplay {
    inner: Arc<Mutex<ReplayInner>>,
}

impl FakeReplay {
    pub fn new() -> Self {
        FakeReplay::default()
    }

    pub fn current(&self) -> Option<PathBuf> {
        self.inner.lock().unwrap().current.clone()
    }

    pub fn started_files(&self) -> Vec<PathBuf> {
        self.inner.lock().unwrap().started.clone()
    }
}

impl ConfidenceReplay for FakeReplay {
    fn start(&mut self, file: &Path) -> bool {
        let mut inner = self.inner.lock().unwrap();
        inner.running = true;
        inner.current = Some(file.to_path_buf());
        inner.started.push(file.to_path_buf());
        true
    }

    fn stop(&mut self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        inner.running = false;
        inner.current = None;
        true
    }

    fn is_running(&self) -> bool {
        self.inner.lock().unwrap().running
    }
}

// ---------------------------------------------------------------------------
// Tape drive
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct DriveInner {
    tape: TapeState,
    accept_store: bool,
    files: Vec<String>,
    barcode: String,
    offset: usize,
    state: StoreState,
    aborted: bool,
}

/// Tape drive whose transfer progress is advanced by the test.
#[derive(Debug, Clone)]
pub struct FakeTapeDrive {
    inner: Arc<Mutex<DriveInner>>,
}

impl FakeTapeDrive {
    pub fn new(tape: TapeState) -> Self {
        FakeTapeDrive {
            inner: Arc::new(Mutex::new(DriveInner {
                tape,
                accept_store: true,
                files: Vec::new(),
                barcode: String::new(),
                offset: 0,
                state: StoreState::Idle,
                aborted: false,
            })),
        }
    }

    pub fn set_tape_state(&self, tape: TapeState) {
        self.inner.lock().unwrap().tape = tape;
    }

    pub fn refuse_store(&self) {
        self.inner.lock().unwrap().accept_store = false;
    }

    /// Move the running offset forward `n` files.
    pub fn advance(&self, n: usize) {
        self.inner.lock().unwrap().offset += n;
    }

    pub fn finish(&self, success: bool) {
        let mut inner = self.inner.lock().unwrap();
        inner.state = if success { StoreState::Completed } else { StoreState::Failed };
        if success {
            inner.offset = inner.files.len();
        }
    }

    pub fn stored_files(&self) -> Vec<String> {
        self.inner.lock().unwrap().files.clone()
    }

    pub fn stored_barcode(&self) -> String {
        self.inner.lock().unwrap().barcode.clone()
    }

    pub fn was_aborted(&self) -> bool {
        self.inner.lock().unwrap().aborted
    }
}

impl TapeDrive for FakeTapeDrive {
    fn tape_state(&self) -> TapeState {
        self.inner.lock().unwrap().tape
    }

    fn store_to_tape(&mut self, files: &[String], barcode: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if !inner.accept_store {
            return false;
        }
        inner.files = files.to_vec();
        inner.barcode = barcode.to_string();
        inner.offset = 0;
        inner.state = StoreState::Transferring;
        true
    }

    fn store_completed(&self) -> bool {
        matches!(self.inner.lock().unwrap().state, StoreState::Completed | StoreState::Failed)
    }

    fn abort_store(&mut self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        inner.aborted = true;
        inner.state = StoreState::Failed;
        true
    }

    fn store_stats(&self) -> StoreStats {
        let inner = self.inner.lock().unwrap();
        StoreStats {
            offset: inner.offset,
            state: inner.state,
            filename: inner.files.get(inner.offset).cloned().unwrap_or_default(),
        }
    }
}

// ---------------------------------------------------------------------------
// MXF reader
// ---------------------------------------------------------------------------

/// Deterministic frame source standing in for a captured page-file set.
pub struct SyntheticMxfReader {
    total: i64,
    position: i64,
    complete: bool,
    defects: DefectLists,
    truncate_calls: usize,
}

impl SyntheticMxfReader {
    pub fn new(total_frames: i64) -> Self {
        SyntheticMxfReader {
            total: total_frames,
            position: 0,
            complete: true,
            defects: DefectLists::default(),
            truncate_calls: 0,
        }
    }

    pub fn with_defects(mut self, defects: DefectLists) -> Self {
        self.defects = defects;
        self.defects.sort_by_position();
        self
    }

    /// Report the page set as still missing pages.
    pub fn incomplete(mut self) -> Self {
        self.complete = false;
        self
    }

    pub fn truncate_calls(&self) -> usize {
        self.truncate_calls
    }
}

impl MxfReader for SyntheticMxfReader {
    fn is_complete(&self) -> bool {
        self.complete
    }

    fn next_frame(&mut self) -> Result<Option<ContentPackage>> {
        if self.position >= self.total {
            return Ok(None);
        }
        let pos = self.position;
        self.position += 1;
        Ok(Some(ContentPackage {
            video: vec![(pos % 251) as u8; 16],
            audio: vec![vec![pos as i16; 4], vec![-(pos as i16); 4]],
            vitc: Timecode::from_frames(pos),
            ltc: Timecode::from_frames(pos + 90_000),
        }))
    }

    fn skip_frames(&mut self, count: i64) -> Result<i64> {
        let skipped = count.min(self.total - self.position).max(0);
        self.position += skipped;
        Ok(skipped)
    }

    fn forward_truncate(&mut self) -> Result<()> {
        self.truncate_calls += 1;
        Ok(())
    }

    fn pse_failures(&self) -> &[PseFailure] {
        &self.defects.pse_failures
    }

    fn vtr_errors(&self) -> &[VtrError] {
        &self.defects.vtr_errors
    }

    fn dropouts(&self) -> &[DropOut] {
        &self.defects.dropouts
    }
}

/// Hands out one scripted [`SyntheticMxfReader`] per `open_paged` call.
#[derive(Clone, Default)]
pub struct SyntheticReaderFactory {
    scripted: Arc<Mutex<Vec<SyntheticMxfReader>>>,
}

impl SyntheticReaderFactory {
    pub fn new() -> Self {
        SyntheticReaderFactory::default()
    }

    pub fn script(&self, reader: SyntheticMxfReader) {
        self.scripted.lock().unwrap().push(reader);
    }
}

impl crate::MxfReaderFactory for SyntheticReaderFactory {
    fn open_paged(&self, _dir: &Path, base: &str) -> Result<Box<dyn MxfReader>> {
        match self.scripted.lock().unwrap().pop() {
            Some(reader) => Ok(Box::new(reader)),
            None => Err(DeviceError::Source(format!("no scripted reader for {}", base))),
        }
    }
}

// ---------------------------------------------------------------------------
// MXF writer
// ---------------------------------------------------------------------------

/// Everything a completed fake writer captured, for assertions.
#[derive(Debug, Clone)]
pub struct CompletedItem {
    pub frames: i64,
    pub defects: DefectLists,
    pub catalogue: CatalogueData,
    pub params: MxfWriterParams,
}

/// Factory whose writers record completion details into a shared registry.
#[derive(Clone, Default)]
pub struct CollectingWriterFactory {
    completed: Arc<Mutex<HashMap<PathBuf, CompletedItem>>>,
}

impl CollectingWriterFactory {
    pub fn new() -> Self {
        CollectingWriterFactory::default()
    }

    pub fn completed(&self, path: &Path) -> Option<CompletedItem> {
        self.completed.lock().unwrap().get(path).cloned()
    }

    pub fn completed_count(&self) -> usize {
        self.completed.lock().unwrap().len()
    }
}

impl MxfWriterFactory for CollectingWriterFactory {
    fn create(&self, path: &Path, params: &MxfWriterParams) -> Result<Box<dyn MxfWriter>> {
        let file = File::create(path)?;
        Ok(Box::new(CollectingMxfWriter {
            path: path.to_path_buf(),
            params: params.clone(),
            file,
            frames: 0,
            registry: Arc::clone(&self.completed),
        }))
    }
}

struct CollectingMxfWriter {
    path: PathBuf,
    params: MxfWriterParams,
    file: File,
    frames: i64,
    registry: Arc<Mutex<HashMap<PathBuf, CompletedItem>>>,
}

impl MxfWriter for CollectingMxfWriter {
    fn write_frame(&mut self, package: &ContentPackage) -> Result<()> {
        self.file.write_all(&package.video)?;
        self.frames += 1;
        Ok(())
    }

    fn complete(&mut self, catalogue: &CatalogueData, defects: &DefectLists) -> Result<()> {
        self.file.flush()?;
        self.registry.lock().unwrap().insert(
            self.path.clone(),
            CompletedItem {
                frames: self.frames,
                defects: defects.clone(),
                catalogue: catalogue.clone(),
                params: self.params.clone(),
            },
        );
        Ok(())
    }

    fn frames_written(&self) -> i64 {
        self.frames
    }
}

// ---------------------------------------------------------------------------
// Browse encoder
// ---------------------------------------------------------------------------

/// Factory whose encoders count frames per output path.
#[derive(Clone, Default)]
pub struct FakeBrowseFactory {
    frames: Arc<Mutex<HashMap<PathBuf, i64>>>,
}

impl FakeBrowseFactory {
    pub fn new() -> Self {
        FakeBrowseFactory::default()
    }

    pub fn frames(&self, path: &Path) -> Option<i64> {
        self.frames.lock().unwrap().get(path).copied()
    }
}

impl BrowseEncoderFactory for FakeBrowseFactory {
    fn create(&self, path: &Path) -> Result<Box<dyn BrowseEncoder>> {
        File::create(path)?;
        Ok(Box::new(FakeBrowseEncoder {
            path: path.to_path_buf(),
            frames: 0,
            registry: Arc::clone(&self.frames),
        }))
    }
}

struct FakeBrowseEncoder {
    path: PathBuf,
    frames: i64,
    registry: Arc<Mutex<HashMap<PathBuf, i64>>>,
}

impl BrowseEncoder for FakeBrowseEncoder {
    fn encode_frame(&mut self, _video: &[u8], _audio: &[i16]) -> Result<()> {
        self.frames += 1;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.registry.lock().unwrap().insert(self.path.clone(), self.frames);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// PSE analyser
// ---------------------------------------------------------------------------

/// Fails an item once it carries `fail_threshold` or more PSE flags.
#[derive(Debug, Clone)]
pub struct FakePseAnalyser {
    inner: Arc<Mutex<PseInner>>,
}

#[derive(Debug)]
struct PseInner {
    fail_threshold: usize,
    analysed: Vec<(PathBuf, usize)>,
}

impl FakePseAnalyser {
    pub fn new(fail_threshold: usize) -> Self {
        FakePseAnalyser {
            inner: Arc::new(Mutex::new(PseInner { fail_threshold, analysed: Vec::new() })),
        }
    }

    pub fn analysed(&self) -> Vec<(PathBuf, usize)> {
        self.inner.lock().unwrap().analysed.clone()
    }
}

impl PseAnalyser for FakePseAnalyser {
    fn analyse(
        &mut self,
        file: &Path,
        report: &Path,
        failures: &[PseFailure],
    ) -> Result<PseVerdict> {
        let mut inner = self.inner.lock().unwrap();
        inner.analysed.push((file.to_path_buf(), failures.len()));
        let mut out = File::create(report)?;
        for failure in failures {
            writeln!(out, "{} {} {} {}", failure.position, failure.red, failure.flash, failure.spatial)?;
        }
        Ok(if failures.len() >= inner.fail_threshold {
            PseVerdict::Failed
        } else {
            PseVerdict::Passed
        })
    }
}
