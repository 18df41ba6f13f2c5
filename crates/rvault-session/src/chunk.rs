//! The chunking worker.
//!
//! Consumes one continuously captured page-file set and emits one finished
//! container file (plus browse copy, timecode sidecar, info sidecar and
//! PSE report) per enabled, non-junk item, rebasing every frame-indexed
//! defect record from capture position to item position as it goes.
//!
//! Runs on its own thread; the owning session polls [`ChunkerHandle`] and
//! treats any outcome other than [`ChunkStatus::Completed`] as a request
//! to abort the whole session.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use rvault_cache::Cache;
use rvault_device::browse::{mix_browse_audio, pack_planar_420};
use rvault_device::{
    BrowseEncoder, BrowseEncoderFactory, MxfReader, MxfWriter, MxfWriterFactory,
    MxfWriterParams, PseAnalyser,
};
use rvault_fs::TransferLock;
use rvault_persist::CacheItemRow;
use rvault_types::{CatalogueData, DefectLists, IngestFormat, PseVerdict, SourceItem, Timecode};
use serde::Serialize;
use tracing::{debug, error, info};

use crate::items::RecordingItems;
use crate::{Result, SessionError};

/// Frames between probes of the tape-transfer lock file.
const THROTTLE_CHECK_FRAMES: i64 = 25;

/// One entry of the chunk plan, in item order.
#[derive(Debug, Clone)]
pub struct ChunkItem {
    pub item_id: u32,
    pub junk: bool,
    /// Frames this item spans within the capture.
    pub duration: i64,
    /// Cache row for the output file; absent for junk spans.
    pub row: Option<CacheItemRow>,
}

#[derive(Debug, Clone)]
pub struct ChunkerConfig {
    /// Advisory lock file an in-progress tape transfer holds; chunking
    /// yields bandwidth while it exists.
    pub transfer_lock: PathBuf,
    pub throttle_sleep: Duration,
    /// Free-space floor; below it consumed pages are truncated away.
    pub disk_margin: u64,
    /// Frames between free-space probes.
    pub disk_check_frames: i64,
    pub format: IngestFormat,
    pub writer_params: MxfWriterParams,
    /// Capture frame dimensions, needed by the browse repack.
    pub video_dims: (usize, usize),
    pub pse_enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkStatus {
    Running,
    Completed,
    Failed,
}

#[derive(Debug)]
struct Progress {
    status: ChunkStatus,
    frames_done: i64,
    message: String,
}

/// Owning handle for a running chunk worker.
pub struct ChunkerHandle {
    thread: Option<JoinHandle<()>>,
    progress: Arc<Mutex<Progress>>,
    stop: Arc<AtomicBool>,
}

impl ChunkerHandle {
    pub fn status(&self) -> ChunkStatus {
        self.progress.lock().unwrap().status
    }

    pub fn frames_done(&self) -> i64 {
        self.progress.lock().unwrap().frames_done
    }

    pub fn message(&self) -> String {
        self.progress.lock().unwrap().message.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, |t| t.is_finished())
    }

    /// Ask the worker to stop at the next frame boundary. There is no
    /// finer-grained cancellation within a frame.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    /// Wait for the worker to exit and return its final status.
    pub fn join(mut self) -> ChunkStatus {
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        self.status()
    }
}

/// Spawn the worker over `plan`.
#[allow(clippy::too_many_arguments)]
pub fn spawn(
    plan: Vec<ChunkItem>,
    reader: Box<dyn MxfReader>,
    cache: Arc<Cache>,
    items: Arc<Mutex<RecordingItems>>,
    writer_factory: Arc<dyn MxfWriterFactory>,
    browse_factory: Arc<dyn BrowseEncoderFactory>,
    pse: Box<dyn PseAnalyser>,
    config: ChunkerConfig,
) -> Result<ChunkerHandle> {
    let progress = Arc::new(Mutex::new(Progress {
        status: ChunkStatus::Running,
        frames_done: 0,
        message: String::new(),
    }));
    let stop = Arc::new(AtomicBool::new(false));

    let worker = Worker {
        plan,
        reader,
        cache,
        items,
        writer_factory,
        browse_factory,
        pse,
        config,
        progress: Arc::clone(&progress),
        stop: Arc::clone(&stop),
    };

    let thread = std::thread::Builder::new()
        .name("chunker".into())
        .spawn(move || worker.run_to_status())
        .map_err(SessionError::Io)?;

    Ok(ChunkerHandle { thread: Some(thread), progress, stop })
}

struct Worker {
    plan: Vec<ChunkItem>,
    reader: Box<dyn MxfReader>,
    cache: Arc<Cache>,
    items: Arc<Mutex<RecordingItems>>,
    writer_factory: Arc<dyn MxfWriterFactory>,
    browse_factory: Arc<dyn BrowseEncoderFactory>,
    pse: Box<dyn PseAnalyser>,
    config: ChunkerConfig,
    progress: Arc<Mutex<Progress>>,
    stop: Arc<AtomicBool>,
}

#[derive(Serialize)]
struct InfoSidecar<'a> {
    filename: &'a str,
    source: &'a SourceItem,
    duration: i64,
}

impl Worker {
    /// Top-level catch: whatever goes wrong inside, the worker reports
    /// Failed rather than unwinding through the thread boundary.
    fn run_to_status(mut self) {
        let progress = Arc::clone(&self.progress);
        match self.run() {
            Ok(()) => {
                info!(component = "CHUNK", "chunking complete");
                progress.lock().unwrap().status = ChunkStatus::Completed;
            }
            Err(e) => {
                error!(component = "CHUNK", error = %e, "chunking failed");
                let mut p = progress.lock().unwrap();
                p.status = ChunkStatus::Failed;
                p.message = e.to_string();
            }
        }
    }

    fn run(&mut self) -> Result<()> {
        if !self.reader.is_complete() {
            return Err(SessionError::Invalid(
                "captured page set is incomplete, cannot chunk".into(),
            ));
        }

        let mut defects = DefectLists {
            pse_failures: self.reader.pse_failures().to_vec(),
            vtr_errors: self.reader.vtr_errors().to_vec(),
            dropouts: self.reader.dropouts().to_vec(),
        };
        defects.sort_by_position();
        let (mut pse_i, mut vtr_i, mut drop_i) = (0usize, 0usize, 0usize);

        let mut input_frame: i64 = 0;
        let plan = std::mem::take(&mut self.plan);
        for entry in &plan {
            if entry.junk {
                let skipped = self.reader.skip_frames(entry.duration)?;
                if skipped < entry.duration {
                    return Err(SessionError::Invalid(format!(
                        "source ended {} frames into a junk span",
                        skipped
                    )));
                }
                input_frame += entry.duration;
                // Defects inside a junked span belong to nobody.
                while pse_i < defects.pse_failures.len()
                    && defects.pse_failures[pse_i].position < input_frame
                {
                    pse_i += 1;
                }
                while vtr_i < defects.vtr_errors.len()
                    && defects.vtr_errors[vtr_i].position < input_frame
                {
                    vtr_i += 1;
                }
                while drop_i < defects.dropouts.len()
                    && defects.dropouts[drop_i].position < input_frame
                {
                    drop_i += 1;
                }
                self.progress.lock().unwrap().frames_done = input_frame;
                continue;
            }

            let row = entry.row.clone().ok_or_else(|| {
                SessionError::Invalid(format!("item {} has no cache row", entry.item_id))
            })?;
            debug!(component = "CHUNK", file = %row.filename, frames = entry.duration,
                "writing item");

            self.cache.register_creating_item(&row, false, false)?;
            let out_path = self.cache.creating_filename(&row.filename);
            let mut writer = self.writer_factory.create(&out_path, &self.config.writer_params)?;

            let mut browse = None;
            let mut tc_file = None;
            let mut info_path = None;
            if let Some(browse_name) = &row.browse_filename {
                let browse_path = self.cache.browse_filename(browse_name);
                browse = Some(self.browse_factory.create(&browse_path)?);
                tc_file = Some(BufWriter::new(File::create(
                    self.cache.browse_filename(&format!("{}.tc", browse_name)),
                )?));
                let info = browse_path.with_extension("info.json");
                write_info_sidecar(&info, &row, -1)?;
                info_path = Some(info);
            }

            let mut item_defects = DefectLists::default();
            for item_frame in 0..entry.duration {
                if self.stop.load(Ordering::Relaxed) {
                    return Err(SessionError::Invalid("chunking stopped".into()));
                }
                let package = self.reader.next_frame()?.ok_or_else(|| {
                    SessionError::Invalid("source ended before the final item".into())
                })?;

                if input_frame % THROTTLE_CHECK_FRAMES == 0
                    && TransferLock::is_held(&self.config.transfer_lock)
                {
                    // A tape transfer is running; cede disk bandwidth.
                    std::thread::sleep(self.config.throttle_sleep);
                }
                if self.config.disk_check_frames > 0
                    && input_frame % self.config.disk_check_frames == 0
                {
                    if let Ok(free) = self.cache.disk_space() {
                        if free < self.config.disk_margin {
                            self.reader.forward_truncate()?;
                        }
                    }
                }

                while pse_i < defects.pse_failures.len()
                    && defects.pse_failures[pse_i].position == input_frame
                {
                    let mut failure = defects.pse_failures[pse_i];
                    failure.position = item_frame;
                    item_defects.pse_failures.push(failure);
                    pse_i += 1;
                }
                while vtr_i < defects.vtr_errors.len()
                    && defects.vtr_errors[vtr_i].position == input_frame
                {
                    let mut error = defects.vtr_errors[vtr_i];
                    error.position = item_frame;
                    item_defects.vtr_errors.push(error);
                    vtr_i += 1;
                }
                while drop_i < defects.dropouts.len()
                    && defects.dropouts[drop_i].position == input_frame
                {
                    let mut dropout = defects.dropouts[drop_i];
                    dropout.position = item_frame;
                    item_defects.dropouts.push(dropout);
                    drop_i += 1;
                }

                writer.write_frame(&package)?;

                if let Some(encoder) = browse.as_mut() {
                    let audio = mix_browse_audio(&package.audio);
                    let video = match self.config.format {
                        IngestFormat::Uncompressed => {
                            let (w, h) = self.config.video_dims;
                            pack_planar_420(w, h, &package.video)
                        }
                        // The D10 decode path already yields planar 4:2:0.
                        IngestFormat::D10 => package.video.clone(),
                    };
                    encoder.encode_frame(&video, &audio)?;
                }
                if let Some(tc) = tc_file.as_mut() {
                    writeln!(
                        tc,
                        "{} {} {}",
                        Timecode::from_frames(item_frame),
                        package.vitc,
                        package.ltc
                    )?;
                }

                input_frame += 1;
                self.progress.lock().unwrap().frames_done = input_frame;
            }

            let catalogue = CatalogueData {
                source: row.source.clone(),
                lto_spool: String::new(),
                lto_item: 0,
                transfer_date: 0,
                duration: entry.duration,
            };
            writer.complete(&catalogue, &item_defects)?;
            if let Some(mut encoder) = browse.take() {
                encoder.finish()?;
            }
            if let Some(mut tc) = tc_file.take() {
                tc.flush()?;
            }
            if let Some(info) = info_path {
                write_info_sidecar(&info, &row, entry.duration)?;
            }

            let mut verdict = PseVerdict::Unknown;
            if self.config.pse_enabled {
                if let Some(pse_name) = &row.pse_filename {
                    verdict = self.pse.analyse(
                        &out_path,
                        &self.cache.pse_filename(pse_name),
                        &item_defects.pse_failures,
                    )?;
                }
            }

            let mut updated = row.clone();
            updated.duration = entry.duration;
            updated.size =
                std::fs::metadata(&out_path).map(|m| m.len() as i64).unwrap_or(-1);
            updated.pse_verdict = verdict;
            self.cache.update_creating_item(&updated)?;

            self.items.lock().unwrap().set_chunked(entry.item_id, &row.filename);
        }

        // The source and the summed item durations must agree exactly.
        if self.reader.next_frame()?.is_some() {
            return Err(SessionError::Invalid(
                "captured frames left over after the final item".into(),
            ));
        }
        Ok(())
    }
}

fn write_info_sidecar(path: &std::path::Path, row: &CacheItemRow, duration: i64) -> Result<()> {
    let sidecar = InfoSidecar { filename: &row.filename, source: &row.source, duration };
    let file = File::create(path)?;
    serde_json::to_writer_pretty(file, &sidecar)
        .map_err(|e| SessionError::Invalid(format!("info sidecar: {}", e)))?;
    Ok(())
}
