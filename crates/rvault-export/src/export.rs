//! The tape-export state machine.
//!
//! `SelectingFiles → WaitingForTapeReady → Transferring → Completed`, with
//! `Failed` for drive-reported failure and `Aborted` reachable from any
//! non-terminal state. The drive reports one running offset into the file
//! list rather than per-file events, so per-file status is inferred: file
//! N is complete the moment the offset moves past N.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crossbeam_channel::{Receiver, Sender, TryRecvError};
use rvault_cache::Cache;
use rvault_device::{StoreState, TapeDrive, TapeState};
use rvault_fs::TransferLock;
use rvault_persist::{CatalogueExportRow, LtoFileRow, LtoSessionRow, PersistenceStore};
use rvault_types::{AbortInitiator, CatalogueData, SessionStatus, TransferStatus};
use tracing::{info, warn};

use crate::select::{select_automatic, validate_manual, Candidate, SelectionLimits};
use crate::{ExportError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportState {
    SelectingFiles,
    WaitingForTapeReady,
    Transferring,
    Completed,
    Failed,
    Aborted,
}

impl ExportState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExportState::Completed | ExportState::Failed | ExportState::Aborted)
    }
}

/// How the batch is chosen.
#[derive(Debug, Clone)]
pub enum Selection {
    /// Oldest-backlog-first scan under the policy caps; keeps rescanning
    /// until enough material has accumulated.
    Automatic,
    /// Operator-picked destination ids; validated strictly, never
    /// substituted.
    Manual(Vec<i64>),
}

#[derive(Debug, Clone)]
pub struct ExportPolicy {
    pub min_batch_bytes: u64,
    pub max_batch_bytes: u64,
    pub max_files: usize,
    /// Debug override: leave transferred files in the cache.
    pub keep_files: bool,
}

impl ExportPolicy {
    fn limits(&self) -> SelectionLimits {
        SelectionLimits {
            min_bytes: self.min_batch_bytes,
            max_bytes: self.max_batch_bytes,
            max_files: self.max_files,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExportTuning {
    pub tick: Duration,
}

impl Default for ExportTuning {
    fn default() -> Self {
        ExportTuning { tick: Duration::from_millis(100) }
    }
}

/// Per-file progress for polling UIs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileProgress {
    pub filename: String,
    pub source_filename: String,
    pub status: TransferStatus,
}

#[derive(Debug, Clone)]
pub struct ExportSnapshot {
    pub state: ExportState,
    pub message: String,
    pub files: Vec<FileProgress>,
}

pub struct ExportDeps {
    pub store: Arc<dyn PersistenceStore>,
    pub cache: Arc<Cache>,
    pub drive: Box<dyn TapeDrive>,
}

enum Command {
    Abort { comments: String },
}

/// One export batch to one LTO tape.
pub struct TapeExportSession {
    tx: Sender<Command>,
    thread: Option<JoinHandle<()>>,
    status: Arc<Mutex<ExportSnapshot>>,
    session_id: i64,
}

impl TapeExportSession {
    /// Validate (manual mode), persist the session row and start the
    /// control thread.
    pub fn start(
        deps: ExportDeps,
        recorder: &str,
        barcode: &str,
        selection: Selection,
        policy: ExportPolicy,
        transfer_lock: PathBuf,
        tuning: ExportTuning,
    ) -> Result<TapeExportSession> {
        // Manual selections must hold up before anything is persisted.
        let manual_batch = match &selection {
            Selection::Manual(ids) => {
                let available = completed_candidates(&deps.cache);
                let batch = validate_manual(ids, &available, &policy.limits())
                    .map_err(ExportError::Selection)?;
                Some(batch)
            }
            Selection::Automatic => None,
        };

        let created_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        let row = LtoSessionRow {
            id: 0,
            recorder: recorder.to_string(),
            barcode: barcode.to_string(),
            created_at,
            status: SessionStatus::InProgress,
            abort_initiator: None,
            comments: String::new(),
        };
        let session_id = deps.store.save_lto_session(row.clone())?;
        let row = LtoSessionRow { id: session_id, ..row };

        let (state, batch) = match manual_batch {
            Some(candidates) => {
                let batch = synthesize_batch(&candidates, barcode, session_id, created_at);
                (ExportState::WaitingForTapeReady, batch)
            }
            None => (ExportState::SelectingFiles, Vec::new()),
        };

        let status = Arc::new(Mutex::new(ExportSnapshot {
            state,
            message: match state {
                ExportState::SelectingFiles => "Selecting files".to_string(),
                _ => "Waiting for tape".to_string(),
            },
            files: progress_of(&batch),
        }));

        let (tx, rx) = crossbeam_channel::unbounded();
        let mut worker = Worker {
            store: deps.store,
            cache: deps.cache,
            drive: deps.drive,
            barcode: barcode.to_string(),
            selection,
            policy,
            tuning,
            transfer_lock,
            row,
            batch,
            state,
            status: Arc::clone(&status),
            rx,
            lock: None,
        };
        let thread = std::thread::Builder::new()
            .name("tape-export".into())
            .spawn(move || worker.run())
            .map_err(ExportError::Io)?;

        info!(component = "EXPORT", session_id, barcode, "tape export session started");
        Ok(TapeExportSession { tx, thread: Some(thread), status, session_id })
    }

    /// Request an abort; returns immediately. Poll [`Self::snapshot`] for
    /// the terminal state.
    pub fn abort(&self, comments: &str) {
        let _ = self.tx.send(Command::Abort { comments: comments.to_string() });
    }

    pub fn snapshot(&self) -> ExportSnapshot {
        self.status.lock().unwrap().clone()
    }

    pub fn session_id(&self) -> i64 {
        self.session_id
    }

    /// Poll until the session reaches a terminal state.
    pub fn wait_for_terminal(&self, timeout: Duration) -> Option<ExportState> {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            let state = self.snapshot().state;
            if state.is_terminal() {
                return Some(state);
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        let state = self.snapshot().state;
        state.is_terminal().then_some(state)
    }
}

impl Drop for TapeExportSession {
    fn drop(&mut self) {
        if let Some(thread) = self.thread.take() {
            if !self.snapshot().state.is_terminal() {
                let _ = self.tx.send(Command::Abort {
                    comments: "session handle dropped".to_string(),
                });
            }
            let _ = thread.join();
        }
    }
}

/// Exportable cache entries: finished artifacts whose owning session
/// completed successfully.
fn completed_candidates(cache: &Cache) -> Vec<Candidate> {
    cache
        .contents()
        .iter()
        .filter(|e| !e.creating && e.row.session_status == SessionStatus::Completed)
        .map(|e| Candidate::from(&e.row))
        .collect()
}

/// Number the batch in export order: `barcode + NN + .mxf`.
fn synthesize_batch(
    candidates: &[Candidate],
    barcode: &str,
    session_id: i64,
    transfer_date: i64,
) -> Vec<BatchFile> {
    candidates
        .iter()
        .enumerate()
        .map(|(i, candidate)| {
            let position = i as u32 + 1;
            BatchFile {
                dest_id: candidate.dest_id,
                row: LtoFileRow {
                    id: 0,
                    lto_session_id: session_id,
                    position,
                    filename: format!("{}{:02}.mxf", barcode, position),
                    source_filename: candidate.filename.clone(),
                    size: candidate.size,
                    duration: candidate.duration,
                    status: TransferStatus::NotStarted,
                    catalogue: CatalogueData {
                        source: candidate.source.clone(),
                        lto_spool: barcode.to_string(),
                        lto_item: position,
                        transfer_date,
                        duration: candidate.duration,
                    },
                },
            }
        })
        .collect()
}

fn progress_of(batch: &[BatchFile]) -> Vec<FileProgress> {
    batch
        .iter()
        .map(|f| FileProgress {
            filename: f.row.filename.clone(),
            source_filename: f.row.source_filename.clone(),
            status: f.row.status,
        })
        .collect()
}

fn rank(status: TransferStatus) -> u8 {
    match status {
        TransferStatus::NotStarted => 0,
        TransferStatus::Started => 1,
        TransferStatus::Completed => 2,
        TransferStatus::Failed => 3,
    }
}

struct BatchFile {
    dest_id: i64,
    row: LtoFileRow,
}

struct Worker {
    store: Arc<dyn PersistenceStore>,
    cache: Arc<Cache>,
    drive: Box<dyn TapeDrive>,
    barcode: String,
    selection: Selection,
    policy: ExportPolicy,
    tuning: ExportTuning,
    transfer_lock: PathBuf,
    row: LtoSessionRow,
    batch: Vec<BatchFile>,
    state: ExportState,
    status: Arc<Mutex<ExportSnapshot>>,
    rx: Receiver<Command>,
    lock: Option<TransferLock>,
}

impl Worker {
    fn set_state(&mut self, state: ExportState, message: &str) {
        self.state = state;
        let mut snapshot = self.status.lock().unwrap();
        snapshot.state = state;
        snapshot.message = message.to_string();
        snapshot.files = progress_of(&self.batch);
    }

    fn run(&mut self) {
        loop {
            std::thread::sleep(self.tuning.tick);

            // The abort flag outranks whatever the state wants to do next.
            match self.rx.try_recv() {
                Ok(Command::Abort { comments }) => {
                    self.finish_aborted(true, &comments, ExportState::Aborted);
                    break;
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => {}
            }

            let step = match self.state {
                ExportState::SelectingFiles => self.tick_selecting(),
                ExportState::WaitingForTapeReady => self.tick_tape_ready(),
                ExportState::Transferring => self.tick_transferring(),
                _ => break,
            };
            match step {
                Ok(()) => {
                    if self.state.is_terminal() {
                        break;
                    }
                }
                Err(e) => {
                    self.finish_aborted(false, &e.to_string(), ExportState::Failed);
                    break;
                }
            }
        }
    }

    fn tick_selecting(&mut self) -> Result<()> {
        let candidates = completed_candidates(&self.cache);
        if let Some(selected) = select_automatic(candidates, &self.policy.limits()) {
            info!(
                component = "EXPORT",
                files = selected.len(),
                "batch selected for tape"
            );
            self.batch =
                synthesize_batch(&selected, &self.barcode, self.row.id, self.row.created_at);
            self.set_state(ExportState::WaitingForTapeReady, "Waiting for tape");
        }
        Ok(())
    }

    fn tick_tape_ready(&mut self) -> Result<()> {
        if self.drive.tape_state() != TapeState::Ready {
            return Ok(());
        }

        // Files can vanish between selection and tape-ready.
        let ids: Vec<i64> = self.batch.iter().map(|f| f.dest_id).collect();
        if !self.cache.items_are_known(&ids) {
            if matches!(self.selection, Selection::Automatic) {
                warn!(component = "EXPORT", "selected file vanished, re-selecting");
                self.batch.clear();
                self.set_state(ExportState::SelectingFiles, "Selecting files");
            } else {
                // An explicit choice can't be silently substituted.
                self.finish_aborted(
                    false,
                    "a selected file vanished from the cache",
                    ExportState::Aborted,
                );
            }
            return Ok(());
        }

        for file in &mut self.batch {
            file.row.id = self.store.save_lto_file(file.row.clone())?;
        }

        self.lock = Some(TransferLock::acquire(&self.transfer_lock)?);
        let paths: Vec<String> = self
            .batch
            .iter()
            .map(|f| {
                self.cache
                    .complete_filename(&f.row.source_filename)
                    .to_string_lossy()
                    .to_string()
            })
            .collect();
        if !self.drive.store_to_tape(&paths, &self.barcode) {
            return Err(ExportError::Selection("tape drive refused the store command".into()));
        }
        self.set_state(ExportState::Transferring, "Transferring");
        Ok(())
    }

    fn tick_transferring(&mut self) -> Result<()> {
        let stats = self.drive.store_stats();

        for (idx, file) in self.batch.iter_mut().enumerate() {
            let inferred = if idx < stats.offset {
                // The offset moved past this file; it is complete whether
                // or not it ever reported Started.
                Some(TransferStatus::Completed)
            } else if idx == stats.offset && stats.state == StoreState::Transferring {
                Some(TransferStatus::Started)
            } else {
                None
            };
            if let Some(new_status) = inferred {
                if rank(new_status) > rank(file.row.status) {
                    file.row.status = new_status;
                    self.store.update_lto_file_status(file.row.id, new_status)?;
                }
            }
        }
        self.status.lock().unwrap().files = progress_of(&self.batch);

        if self.drive.store_completed() {
            match stats.state {
                StoreState::Failed => {
                    self.finish_aborted(
                        false,
                        "tape drive reported a failed store",
                        ExportState::Failed,
                    );
                }
                _ => self.finish_completed()?,
            }
        }
        Ok(())
    }

    fn finish_completed(&mut self) -> Result<()> {
        for file in &mut self.batch {
            if file.row.status != TransferStatus::Completed {
                file.row.status = TransferStatus::Completed;
                self.store.update_lto_file_status(file.row.id, TransferStatus::Completed)?;
            }
        }

        self.row.status = SessionStatus::Completed;
        self.store.update_lto_session(&self.row)?;

        for file in &self.batch {
            self.store.save_catalogue_export(CatalogueExportRow {
                id: 0,
                lto_file_id: file.row.id,
                data: file.row.catalogue.clone(),
            })?;
            if !self.policy.keep_files {
                // Browse and PSE copies survive; only the master goes.
                match self.cache.remove_item(&file.row.source_filename) {
                    Ok(true) => {}
                    Ok(false) => warn!(
                        component = "EXPORT",
                        file = %file.row.source_filename,
                        "transferred file was already gone"
                    ),
                    Err(e) => warn!(
                        component = "EXPORT",
                        file = %file.row.source_filename,
                        error = %e,
                        "failed to remove transferred file"
                    ),
                }
            }
        }

        self.lock = None;
        info!(component = "EXPORT", session_id = self.row.id, "tape export completed");
        self.set_state(ExportState::Completed, "Completed");
        Ok(())
    }

    fn finish_aborted(&mut self, from_user: bool, reason: &str, state: ExportState) {
        warn!(component = "EXPORT", session_id = self.row.id, from_user, reason,
            "tape export did not complete");
        if self.state == ExportState::Transferring {
            let _ = self.drive.abort_store();
        }
        self.lock = None;

        self.row.status = SessionStatus::Aborted;
        self.row.abort_initiator =
            Some(if from_user { AbortInitiator::User } else { AbortInitiator::System });
        self.row.comments = reason.to_string();
        if let Err(e) = self.store.update_lto_session(&self.row) {
            warn!(component = "EXPORT", error = %e, "failed to mark export session aborted");
        }

        // No cache deletions: nothing was confirmed transferred.
        self.set_state(state, reason);
    }
}
