//! The recording session state machine.
//!
//! States: `NotStarted → Ready → Recording → Reviewing → End`, with the
//! multi-item branch `Recording → PrepareChunking → Chunking → Reviewing`.
//!
//! One dedicated control thread runs a tight poll loop. Public methods only
//! post commands; the loop drains them once per tick and executes at most
//! one, in priority order abort > complete > chunk > stop > start, so an
//! abort always preempts an in-flight completion attempt. All state
//! transitions and all cache/store mutations happen on the control thread.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crossbeam_channel::{Receiver, Sender, TryRecvError};
use rvault_cache::Cache;
use rvault_device::{
    wait_for_vtr_state, BrowseEncoderFactory, Capture, ConfidenceReplay, MxfReaderFactory,
    MxfWriterFactory, PseAnalyser, VtrControl,
};
use rvault_fs::{instance_filename, page_filename};
use rvault_persist::{CacheItemRow, DestinationRow, PersistenceStore, SessionRow};
use rvault_types::{
    AbortInitiator, Destination, HardDiskDestination, PseVerdict, SessionStatus, SourceItem,
    VideoTapeDestination, VtrState,
};
use serde::Serialize;
use tracing::{info, warn};

use crate::chunk::{self, ChunkItem, ChunkStatus, ChunkerConfig, ChunkerHandle};
use crate::items::RecordingItems;
use crate::{Profile, Result, SessionError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    NotStarted,
    Ready,
    Recording,
    PrepareChunking,
    Chunking,
    Reviewing,
    End,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionResult {
    Completed,
    Failed { reason: String },
}

/// Control loop timing; the defaults match live operation, tests shrink
/// them to milliseconds.
#[derive(Debug, Clone)]
pub struct SessionTuning {
    pub tick: Duration,
    pub disk_poll: Duration,
    pub vtr_timeout: Duration,
    pub vtr_poll: Duration,
    pub signal_settle: Duration,
}

impl Default for SessionTuning {
    fn default() -> Self {
        SessionTuning {
            tick: Duration::from_millis(10),
            disk_poll: Duration::from_secs(1),
            vtr_timeout: Duration::from_secs(5),
            vtr_poll: Duration::from_millis(50),
            signal_settle: Duration::from_millis(500),
        }
    }
}

/// Read-only status snapshot, safe to poll from any thread.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub result: Option<SessionResult>,
    /// Why the last action did or did not proceed, for the UI.
    pub message: String,
    pub captured_frames: i64,
    pub vtr_error_count: usize,
    pub dropout_count: usize,
}

/// Hardware and persistence collaborators one session drives.
pub struct SessionDeps {
    pub store: Arc<dyn PersistenceStore>,
    pub cache: Arc<Cache>,
    pub capture: Box<dyn Capture>,
    pub source_vtr: Box<dyn VtrControl>,
    pub backup_vtr: Option<Box<dyn VtrControl>>,
    pub replay: Box<dyn ConfidenceReplay>,
    pub reader_factory: Arc<dyn MxfReaderFactory>,
    pub writer_factory: Arc<dyn MxfWriterFactory>,
    pub browse_factory: Arc<dyn BrowseEncoderFactory>,
    pub pse: Box<dyn PseAnalyser>,
}

/// Per-session parameters fixed at start.
#[derive(Debug, Clone)]
pub struct SessionSetup {
    pub recorder: String,
    pub sources: Vec<SourceItem>,
    pub comments: String,
    /// Barcode of the backup videotape, when the profile records one.
    pub backup_barcode: Option<String>,
    /// Free-space floor; recording stops itself below this.
    pub disk_margin: u64,
    pub transfer_lock: PathBuf,
    pub chunk_throttle_sleep: Duration,
    /// Frames between the chunker's free-space probes.
    pub disk_check_frames: i64,
}

enum Command {
    Start,
    Stop,
    Chunk,
    Complete,
    Abort { from_user: bool, comments: String },
}

#[derive(Default)]
struct Pending {
    start: bool,
    stop: bool,
    chunk: bool,
    complete: bool,
    abort: Option<(bool, String)>,
}

/// One tape-to-disk ingest.
pub struct RecordingSession {
    tx: Sender<Command>,
    thread: Option<JoinHandle<()>>,
    status: Arc<Mutex<SessionSnapshot>>,
    items: Arc<Mutex<RecordingItems>>,
    session_id: i64,
}

impl RecordingSession {
    /// Create the session rows, seed the item list and start the control
    /// thread in `Ready`.
    pub fn start(
        deps: SessionDeps,
        profile: Profile,
        setup: SessionSetup,
        tuning: SessionTuning,
    ) -> Result<RecordingSession> {
        if setup.sources.is_empty() {
            return Err(SessionError::Invalid("a session needs at least one source item".into()));
        }

        let created_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        let session_row = SessionRow {
            id: 0,
            recorder: setup.recorder.clone(),
            created_at,
            comments: setup.comments.clone(),
            status: SessionStatus::InProgress,
            abort_initiator: None,
            total_vtr_errors: 0,
            total_dropouts: 0,
        };
        let session_id = deps.store.save_session(session_row.clone())?;
        let session_row = SessionRow { id: session_id, ..session_row };

        let setup_result = Self::create_destinations(&deps, &profile, &setup, &session_row);
        let (item_rows, page_row) = match setup_result {
            Ok(rows) => rows,
            Err(e) => {
                // Nothing external ever saw this session.
                let _ = deps.store.delete_session(session_id);
                return Err(e);
            }
        };

        let items = Arc::new(Mutex::new(RecordingItems::new(setup.sources.clone())));
        let status = Arc::new(Mutex::new(SessionSnapshot {
            state: SessionState::Ready,
            result: None,
            message: "Ready".to_string(),
            captured_frames: 0,
            vtr_error_count: 0,
            dropout_count: 0,
        }));

        let (tx, rx) = crossbeam_channel::unbounded();
        let mut worker = Worker {
            store: Arc::clone(&deps.store),
            cache: Arc::clone(&deps.cache),
            capture: deps.capture,
            source_vtr: deps.source_vtr,
            backup_vtr: deps.backup_vtr,
            replay: deps.replay,
            reader_factory: deps.reader_factory,
            writer_factory: deps.writer_factory,
            browse_factory: deps.browse_factory,
            pse: Some(deps.pse),
            profile,
            setup,
            tuning,
            session_row,
            item_rows,
            page_row,
            items: Arc::clone(&items),
            status: Arc::clone(&status),
            rx,
            state: SessionState::Ready,
            chunker: None,
            chunk_first_file: None,
            captured_file: None,
            recording_started: false,
            last_disk_poll: Instant::now(),
        };
        let thread = std::thread::Builder::new()
            .name("recording-session".into())
            .spawn(move || worker.run())
            .map_err(SessionError::Io)?;

        info!(component = "SESSION", session_id, "recording session ready");
        Ok(RecordingSession { tx, thread: Some(thread), status, items, session_id })
    }

    /// One hard-disk destination per item for a single-item source, or the
    /// temporary page-file reservation for a multi-item one; plus the
    /// backup videotape destination when configured.
    #[allow(clippy::type_complexity)]
    fn create_destinations(
        deps: &SessionDeps,
        profile: &Profile,
        setup: &SessionSetup,
        session_row: &SessionRow,
    ) -> Result<(Vec<(u32, CacheItemRow)>, Option<CacheItemRow>)> {
        let spool = &setup.sources[0].spool_number;
        let file_base = spool.to_lowercase();

        if profile.backup_enabled {
            let barcode = setup.backup_barcode.clone().ok_or_else(|| {
                SessionError::Invalid("backup enabled but no backup barcode".into())
            })?;
            deps.store.save_destination(DestinationRow {
                id: 0,
                session_id: session_row.id,
                destination: Destination::VideoTape(VideoTapeDestination { barcode }),
                cache_id: None,
            })?;
        }

        if setup.sources.len() > 1 {
            // Multi-item: per-item destinations are allocated at chunk
            // time, once the operator has decided the real item list. Only
            // the combined page capture is reserved now.
            let hd = HardDiskDestination::new(
                &file_base,
                profile.format,
                setup.sources[0].clone(),
            );
            let dest_id = deps.store.save_destination(DestinationRow {
                id: 0,
                session_id: session_row.id,
                destination: Destination::HardDisk(hd),
                cache_id: None,
            })?;
            let page_row = item_row_for(dest_id, &file_base, None, None, profile, session_row, &setup.sources[0]);
            return Ok((Vec::new(), Some(page_row)));
        }

        let instance = deps.store.allocate_instance_numbers(spool, 1)?;
        let filename = instance_filename(&file_base, instance, ".mxf");
        let browse = profile
            .browse_enabled
            .then(|| format!("{}.mp4", instance_filename(&file_base, instance, "")));
        let pse = profile
            .pse_enabled
            .then(|| format!("{}.pse.txt", instance_filename(&file_base, instance, "")));
        let mut hd =
            HardDiskDestination::new(&filename, profile.format, setup.sources[0].clone());
        hd.browse_filename = browse.clone();
        hd.pse_filename = pse.clone();
        let dest_id = deps.store.save_destination(DestinationRow {
            id: 0,
            session_id: session_row.id,
            destination: Destination::HardDisk(hd),
            cache_id: None,
        })?;
        let row = item_row_for(
            dest_id,
            &filename,
            browse,
            pse,
            profile,
            session_row,
            &setup.sources[0],
        );
        // The seeded item list gives the single source item id 1.
        Ok((vec![(1, row)], None))
    }

    /// Request the `Ready → Recording` transition.
    pub fn start_recording(&self) {
        let _ = self.tx.send(Command::Start);
    }

    /// Request the end of capture.
    pub fn stop_recording(&self) {
        let _ = self.tx.send(Command::Stop);
    }

    /// Request chunking of a multi-item capture.
    pub fn chunk_file(&self) {
        let _ = self.tx.send(Command::Chunk);
    }

    /// Request completion from review.
    pub fn complete(&self) {
        let _ = self.tx.send(Command::Complete);
    }

    /// Request an abort. Returns immediately; poll [`Self::snapshot`] for
    /// the terminal state.
    pub fn abort(&self, from_user: bool, comments: &str) {
        let _ = self
            .tx
            .send(Command::Abort { from_user, comments: comments.to_string() });
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.status.lock().unwrap().clone()
    }

    /// The session's item list, shared with the control thread. Review
    /// tooling mutates clip boundaries through this handle.
    pub fn items(&self) -> Arc<Mutex<RecordingItems>> {
        Arc::clone(&self.items)
    }

    pub fn session_id(&self) -> i64 {
        self.session_id
    }

    /// Poll until the session reaches `state` or the timeout passes.
    pub fn wait_for_state(&self, state: SessionState, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.snapshot().state == state {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        self.snapshot().state == state
    }

    /// Poll until the terminal state, returning its result.
    pub fn wait_for_end(&self, timeout: Duration) -> Option<SessionResult> {
        if self.wait_for_state(SessionState::End, timeout) {
            self.snapshot().result
        } else {
            None
        }
    }
}

impl Drop for RecordingSession {
    fn drop(&mut self) {
        if let Some(thread) = self.thread.take() {
            if self.snapshot().state != SessionState::End {
                let _ = self.tx.send(Command::Abort {
                    from_user: false,
                    comments: "session handle dropped".to_string(),
                });
            }
            let _ = thread.join();
        }
    }
}

fn item_row_for(
    dest_id: i64,
    filename: &str,
    browse: Option<String>,
    pse: Option<String>,
    profile: &Profile,
    session_row: &SessionRow,
    source: &SourceItem,
) -> CacheItemRow {
    CacheItemRow {
        dest_id,
        cache_id: 0,
        filename: filename.to_string(),
        browse_filename: browse,
        pse_filename: pse,
        format: profile.format,
        size: -1,
        duration: -1,
        pse_verdict: PseVerdict::Unknown,
        session_id: session_row.id,
        session_created_at: session_row.created_at,
        session_comments: session_row.comments.clone(),
        session_status: SessionStatus::InProgress,
        source: source.clone(),
    }
}

#[derive(Serialize)]
struct SessionSidecar {
    session_id: i64,
    files: Vec<String>,
    total_duration: i64,
}

struct Worker {
    store: Arc<dyn PersistenceStore>,
    cache: Arc<Cache>,
    capture: Box<dyn Capture>,
    source_vtr: Box<dyn VtrControl>,
    backup_vtr: Option<Box<dyn VtrControl>>,
    replay: Box<dyn ConfidenceReplay>,
    reader_factory: Arc<dyn MxfReaderFactory>,
    writer_factory: Arc<dyn MxfWriterFactory>,
    browse_factory: Arc<dyn BrowseEncoderFactory>,
    /// Handed to the chunker when chunking starts.
    pse: Option<Box<dyn PseAnalyser>>,
    profile: Profile,
    setup: SessionSetup,
    tuning: SessionTuning,
    session_row: SessionRow,
    /// Item id → cache row for every real output file.
    item_rows: Vec<(u32, CacheItemRow)>,
    /// Temporary reservation for the multi-item page capture.
    page_row: Option<CacheItemRow>,
    items: Arc<Mutex<RecordingItems>>,
    status: Arc<Mutex<SessionSnapshot>>,
    rx: Receiver<Command>,
    state: SessionState,
    chunker: Option<ChunkerHandle>,
    chunk_first_file: Option<String>,
    /// Staging filename currently holding the capture (page 0 for multi).
    captured_file: Option<String>,
    recording_started: bool,
    last_disk_poll: Instant,
}

impl Worker {
    fn multi_item(&self) -> bool {
        self.setup.sources.len() > 1
    }

    fn file_base(&self) -> String {
        self.setup.sources[0].spool_number.to_lowercase()
    }

    fn set_state(&mut self, state: SessionState, message: &str) {
        self.state = state;
        let mut snapshot = self.status.lock().unwrap();
        snapshot.state = state;
        snapshot.message = message.to_string();
    }

    fn set_message(&self, message: &str) {
        self.status.lock().unwrap().message = message.to_string();
    }

    fn drain_commands(&self) -> Pending {
        let mut pending = Pending::default();
        loop {
            match self.rx.try_recv() {
                Ok(Command::Start) => pending.start = true,
                Ok(Command::Stop) => pending.stop = true,
                Ok(Command::Chunk) => pending.chunk = true,
                Ok(Command::Complete) => pending.complete = true,
                Ok(Command::Abort { from_user, comments }) => {
                    pending.abort = Some((from_user, comments))
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        pending
    }

    fn run(&mut self) {
        loop {
            std::thread::sleep(self.tuning.tick);
            let pending = self.drain_commands();

            // One action per tick, abort first: an abort request preempts
            // an in-progress completion attempt.
            if let Some((from_user, comments)) = pending.abort {
                self.do_abort(from_user, &comments);
                break;
            } else if pending.complete {
                if self.state == SessionState::Reviewing {
                    match self.do_complete() {
                        Ok(()) => break,
                        Err(e) => {
                            // Completion must not leave the session
                            // half-committed.
                            self.do_abort(false, &format!("Completion failed: {}", e));
                            break;
                        }
                    }
                } else {
                    self.set_message("Not reviewing, cannot complete");
                }
            } else if pending.chunk {
                if self.state == SessionState::PrepareChunking {
                    if let Err(e) = self.do_chunk() {
                        self.set_message(&format!("Start chunking failed: {}", e));
                    }
                } else {
                    self.set_message("Not prepared for chunking");
                }
            } else if pending.stop {
                if self.state == SessionState::Recording {
                    if let Err(e) = self.do_stop() {
                        // Capture already has partial side effects on disk.
                        self.do_abort(false, &format!("Stop recording failed: {}", e));
                        break;
                    }
                }
            } else if pending.start && self.state == SessionState::Ready {
                self.do_start();
            }

            match self.state {
                SessionState::Recording => {
                    if self.last_disk_poll.elapsed() >= self.tuning.disk_poll {
                        self.last_disk_poll = Instant::now();
                        if let Ok(free) = self.cache.disk_space() {
                            if free < self.setup.disk_margin {
                                warn!(component = "SESSION", free,
                                    "disk space below margin, stopping recording");
                                if let Err(e) = self.do_stop() {
                                    self.do_abort(false, &format!("Stop recording failed: {}", e));
                                    break;
                                }
                                self.set_message("Recording stopped: disk space low");
                            }
                        }
                    }
                    let frames = self.capture.record_stats().frames_written;
                    self.status.lock().unwrap().captured_frames = frames;
                }
                SessionState::Chunking => {
                    let progress = self
                        .chunker
                        .as_ref()
                        .map(|h| (h.frames_done(), h.is_finished()));
                    if let Some((frames, finished)) = progress {
                        self.status.lock().unwrap().captured_frames = frames;
                        if finished {
                            let handle = self.chunker.take().expect("checked above");
                            let message = handle.message();
                            match handle.join() {
                                ChunkStatus::Completed => {
                                    if let Some(first) = self.chunk_first_file.clone() {
                                        let path = self.cache.creating_filename(&first);
                                        if !self.replay.start(&path) {
                                            self.set_message("Start confidence replay failed");
                                        }
                                    }
                                    self.set_state(SessionState::Reviewing, "Reviewing");
                                }
                                _ => {
                                    // A failed chunking run is an abort
                                    // request in all but name.
                                    self.do_abort(false, &format!("Chunking failed: {}", message));
                                    break;
                                }
                            }
                        }
                    }
                }
                _ => {}
            }
        }
    }

    fn do_start(&mut self) {
        if let Err(message) = self.try_start() {
            warn!(component = "SESSION", %message, "start recording refused");
            // Stop whatever transports already moved; state stays Ready.
            let _ = self.source_vtr.stop();
            if let Some(backup) = self.backup_vtr.as_mut() {
                let _ = backup.stop();
            }
            self.set_message(&message);
        }
    }

    fn try_start(&mut self) -> std::result::Result<(), String> {
        if !self.source_vtr.state().is_usable() {
            return Err("Source VTR not available".into());
        }
        if let Some(backup) = &self.backup_vtr {
            if !backup.state().is_usable() {
                return Err("Backup VTR not available".into());
            }
        }
        if self.capture.is_busy() {
            return Err("Capture already busy".into());
        }

        if !self.source_vtr.standby_on()
            || !wait_for_vtr_state(
                &*self.source_vtr,
                VtrState::Paused,
                self.tuning.vtr_timeout,
                self.tuning.vtr_poll,
            )
        {
            return Err("Pause source VTR failed".into());
        }
        if !self.source_vtr.play()
            || !wait_for_vtr_state(
                &*self.source_vtr,
                VtrState::Play,
                self.tuning.vtr_timeout,
                self.tuning.vtr_poll,
            )
        {
            return Err("Play source VTR failed".into());
        }

        std::thread::sleep(self.tuning.signal_settle);
        if !self.capture.signal_ok() {
            return Err("No stable SDI signal".into());
        }

        if let Some(backup) = self.backup_vtr.as_mut() {
            if !backup.record()
                || !wait_for_vtr_state(
                    &**backup,
                    VtrState::Recording,
                    self.tuning.vtr_timeout,
                    self.tuning.vtr_poll,
                )
            {
                return Err("Start backup VTR recording failed".into());
            }
        }

        if self.multi_item() {
            let row = self.page_row.clone().expect("multi-item session has a page row");
            self.cache
                .register_creating_item(&row, true, true)
                .map_err(|e| format!("Register page capture failed: {}", e))?;
            let base = self.file_base();
            if !self
                .capture
                .start_multi_item_record(self.cache.creating_dir(), &base)
            {
                let _ = self.cache.remove_creating_item(&base);
                return Err("Start capture failed".into());
            }
            self.captured_file = Some(page_filename(&base, 0));
        } else {
            let (_, row) = self.item_rows[0].clone();
            self.cache
                .register_creating_item(&row, false, false)
                .map_err(|e| format!("Register capture file failed: {}", e))?;
            let path = self.cache.creating_filename(&row.filename);
            let browse = row.browse_filename.as_ref().map(|n| self.cache.browse_filename(n));
            if !self.capture.start_record(&path, browse.as_deref()) {
                let _ = self.cache.remove_creating_item(&row.filename);
                return Err("Start capture failed".into());
            }
            self.captured_file = Some(row.filename.clone());
        }

        self.recording_started = true;
        self.last_disk_poll = Instant::now();
        self.set_state(SessionState::Recording, "Recording");
        Ok(())
    }

    fn do_stop(&mut self) -> Result<()> {
        let result = if self.multi_item() {
            self.capture.stop_multi_item_record()?
        } else {
            self.capture.stop_record()?
        };

        self.session_row.total_vtr_errors += result.defects.vtr_errors.len() as i64;
        self.session_row.total_dropouts += result.defects.dropouts.len() as i64;
        self.store.update_session(&self.session_row)?;
        {
            let mut snapshot = self.status.lock().unwrap();
            snapshot.vtr_error_count = self.session_row.total_vtr_errors as usize;
            snapshot.dropout_count = self.session_row.total_dropouts as usize;
            snapshot.captured_frames = result.duration;
        }

        let clip_name = if self.multi_item() {
            self.file_base()
        } else {
            self.item_rows[0].1.filename.clone()
        };
        self.items.lock().unwrap().set_combined_clip(&clip_name, result.duration)?;

        if !self.multi_item() {
            let (_, row) = &mut self.item_rows[0];
            row.duration = result.duration;
            row.size = result.file_size;
            self.cache.update_creating_item(row)?;
        }

        let _ = self.source_vtr.stop();
        if let Some(backup) = self.backup_vtr.as_mut() {
            let _ = backup.stop();
        }

        let replay_file = self.captured_file.clone().unwrap_or_default();
        if !self.replay.start(&self.cache.creating_filename(&replay_file)) {
            self.set_message("Start confidence replay failed");
        }

        if self.multi_item() {
            self.set_state(SessionState::PrepareChunking, "Mark item boundaries for chunking");
        } else {
            self.set_state(SessionState::Reviewing, "Reviewing");
        }
        Ok(())
    }

    fn do_chunk(&mut self) -> Result<()> {
        if !self.items.lock().unwrap().ready_for_chunking() {
            return Err(SessionError::Invalid(
                "every item needs an assigned clip or a disabled flag".into(),
            ));
        }

        let spool = self.setup.sources[0].spool_number.clone();
        let base = self.file_base();
        let snapshot: Vec<_> = self.items.lock().unwrap().items().to_vec();
        let real: Vec<_> = snapshot
            .iter()
            .filter(|i| !i.is_disabled && !i.is_junk && i.clip.is_some())
            .cloned()
            .collect();
        if real.is_empty() {
            return Err(SessionError::Invalid("no items left to chunk".into()));
        }

        let first_instance =
            self.store.allocate_instance_numbers(&spool, real.len() as u32)?;
        let built: Result<Vec<(u32, CacheItemRow)>> = real
            .iter()
            .enumerate()
            .map(|(k, item)| {
                let instance = first_instance + k as u32;
                let filename = instance_filename(&base, instance, ".mxf");
                let stem = instance_filename(&base, instance, "");
                let browse =
                    self.profile.browse_enabled.then(|| format!("{}.mp4", stem));
                let pse = self.profile.pse_enabled.then(|| format!("{}.pse.txt", stem));
                let mut hd =
                    HardDiskDestination::new(&filename, self.profile.format, item.source.clone());
                hd.browse_filename = browse.clone();
                hd.pse_filename = pse.clone();
                let dest_id = self.store.save_destination(DestinationRow {
                    id: 0,
                    session_id: self.session_row.id,
                    destination: Destination::HardDisk(hd),
                    cache_id: None,
                })?;
                Ok((
                    item.id,
                    item_row_for(
                        dest_id,
                        &filename,
                        browse,
                        pse,
                        &self.profile,
                        &self.session_row,
                        &item.source,
                    ),
                ))
            })
            .collect();
        let rows = match built {
            Ok(rows) => rows,
            Err(e) => {
                // Release the tentative numbers so gaps don't accumulate.
                let _ = self.store.reset_instance_numbers(&spool, first_instance);
                return Err(e);
            }
        };
        self.item_rows = rows;

        let mut plan = Vec::new();
        for item in &snapshot {
            if item.is_disabled {
                continue;
            }
            let Some(clip) = &item.clip else { continue };
            if item.is_junk {
                plan.push(ChunkItem {
                    item_id: item.id,
                    junk: true,
                    duration: clip.duration,
                    row: None,
                });
            } else {
                let row = self
                    .item_rows
                    .iter()
                    .find(|(id, _)| *id == item.id)
                    .map(|(_, row)| row.clone())
                    .ok_or_else(|| {
                        SessionError::Invalid(format!("no output row for item {}", item.id))
                    })?;
                plan.push(ChunkItem {
                    item_id: item.id,
                    junk: false,
                    duration: clip.duration,
                    row: Some(row),
                });
            }
        }
        self.chunk_first_file = plan
            .iter()
            .find(|e| !e.junk)
            .and_then(|e| e.row.as_ref())
            .map(|r| r.filename.clone());

        self.items.lock().unwrap().lock();
        let _ = self.replay.stop();

        let reader = self.reader_factory.open_paged(self.cache.creating_dir(), &base)?;
        let pse = self
            .pse
            .take()
            .ok_or_else(|| SessionError::Invalid("PSE analyser already consumed".into()))?;
        let handle = chunk::spawn(
            plan,
            reader,
            Arc::clone(&self.cache),
            Arc::clone(&self.items),
            Arc::clone(&self.writer_factory),
            Arc::clone(&self.browse_factory),
            pse,
            ChunkerConfig {
                transfer_lock: self.setup.transfer_lock.clone(),
                throttle_sleep: self.setup.chunk_throttle_sleep,
                disk_margin: self.setup.disk_margin,
                disk_check_frames: self.setup.disk_check_frames,
                format: self.profile.format,
                writer_params: self.profile.writer_params.clone(),
                video_dims: (self.profile.frame_width, self.profile.frame_height),
                pse_enabled: self.profile.pse_enabled,
            },
        )?;
        self.chunker = Some(handle);
        self.set_state(SessionState::Chunking, "Chunking");
        Ok(())
    }

    fn do_complete(&mut self) -> Result<()> {
        let _ = self.replay.stop();

        if self.multi_item() {
            if let Some(page) = &self.page_row {
                self.cache.remove_creating_item(&page.filename)?;
            }
        }

        self.session_row.status = SessionStatus::Completed;
        self.store.update_session(&self.session_row)?;

        let mut files = Vec::new();
        let mut total_duration = 0;
        for (_, row) in &mut self.item_rows {
            // The chunker refreshed size/duration/PSE on the cache's copy;
            // pick that up before stamping the final session status.
            if let Some(current) = self.cache.creating_item(&row.filename) {
                *row = current;
            }
            row.session_status = SessionStatus::Completed;
            self.cache.update_creating_item(row)?;
            self.cache.finalise_creating_item(&row.filename)?;
            files.push(row.filename.clone());
            total_duration += row.duration.max(0);
        }

        let sidecar = SessionSidecar {
            session_id: self.session_row.id,
            files,
            total_duration,
        };
        let path = self
            .cache
            .browse_filename(&format!("{}.session.json", self.file_base()));
        let file = std::fs::File::create(path)?;
        serde_json::to_writer_pretty(file, &sidecar)
            .map_err(|e| SessionError::Invalid(format!("session sidecar: {}", e)))?;

        info!(component = "SESSION", session_id = self.session_row.id, "session completed");
        self.status.lock().unwrap().result = Some(SessionResult::Completed);
        self.set_state(SessionState::End, "Completed");
        Ok(())
    }

    fn do_abort(&mut self, from_user: bool, comments: &str) {
        warn!(component = "SESSION", session_id = self.session_row.id, from_user, comments,
            "aborting session");

        if self.state == SessionState::Recording {
            let _ = self.capture.abort_record();
            let _ = self.source_vtr.stop();
            if let Some(backup) = self.backup_vtr.as_mut() {
                let _ = backup.stop();
            }
        }
        let _ = self.replay.stop();
        if let Some(handle) = self.chunker.take() {
            handle.request_stop();
            let _ = handle.join();
        }
        if let Err(e) = self.cache.remove_creating_items() {
            warn!(component = "SESSION", error = %e, "failed to clear reservations");
        }

        if !self.recording_started {
            // Nothing external ever saw this session: erase it entirely.
            if let Err(e) = self.store.delete_session(self.session_row.id) {
                warn!(component = "SESSION", error = %e, "failed to delete session rows");
            }
        } else {
            self.session_row.status = SessionStatus::Aborted;
            self.session_row.abort_initiator = Some(if from_user {
                AbortInitiator::User
            } else {
                AbortInitiator::System
            });
            if !comments.is_empty() {
                self.session_row.comments = comments.to_string();
            }
            if let Err(e) = self.store.update_session(&self.session_row) {
                warn!(component = "SESSION", error = %e, "failed to mark session aborted");
            }
        }

        self.status.lock().unwrap().result =
            Some(SessionResult::Failed { reason: comments.to_string() });
        self.set_state(SessionState::End, "Aborted");
    }
}
