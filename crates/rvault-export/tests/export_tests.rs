//! Tape-export lifecycle over a fake drive, a real cache directory and an
//! in-memory store. The cache is populated through a write-owning handle,
//! then re-opened read-only the way the export process sees it.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use rvault_cache::{Cache, CacheMode, CacheTuning};
use rvault_config::testing::TestEnvironment;
use rvault_device::testing::FakeTapeDrive;
use rvault_device::TapeState;
use rvault_export::{
    ExportDeps, ExportPolicy, ExportState, ExportTuning, Selection, TapeExportSession,
};
use rvault_fs::{OsFileStore, TransferLock};
use rvault_persist::{
    CacheItemRow, DestinationRow, MemoryStore, PersistenceStore, SessionRow,
};
use rvault_types::{
    AbortInitiator, Destination, HardDiskDestination, IngestFormat, PseVerdict, SessionStatus,
    SourceItem, TransferStatus,
};

const WAIT: Duration = Duration::from_secs(10);

struct Fixture {
    env: TestEnvironment,
    store: Arc<MemoryStore>,
    cache: Arc<Cache>,
    drive: FakeTapeDrive,
}

impl Fixture {
    /// Populate the cache through a writer handle, then reopen read-only.
    fn new(items: &[(&str, i64, i64)]) -> Fixture {
        let env = TestEnvironment::new().unwrap();
        let store = Arc::new(MemoryStore::new());

        {
            let writer = open_cache(&env, &store, CacheMode::ReadWrite);
            for (i, (name, size, created_at)) in items.iter().enumerate() {
                let mut row = item_row(&store, name, *created_at, i as u32 + 1);
                writer.register_creating_item(&row, false, false).unwrap();
                std::fs::write(writer.creating_filename(name), vec![0u8; *size as usize])
                    .unwrap();
                row.size = *size;
                row.duration = 250;
                writer.update_creating_item(&row).unwrap();
                writer.finalise_creating_item(name).unwrap();
            }
        }

        let cache = Arc::new(open_cache(&env, &store, CacheMode::ReadOnly));
        Fixture { env, store, cache, drive: FakeTapeDrive::new(TapeState::NotReady) }
    }

    fn start(&self, selection: Selection, policy: ExportPolicy) -> TapeExportSession {
        TapeExportSession::start(
            ExportDeps {
                store: Arc::clone(&self.store) as Arc<dyn PersistenceStore>,
                cache: Arc::clone(&self.cache),
                drive: Box::new(self.drive.clone()),
            },
            "ingest1",
            "LTO0042",
            selection,
            policy,
            self.env.transfer_lock.clone(),
            ExportTuning { tick: Duration::from_millis(5) },
        )
        .unwrap()
    }

    fn wait_for_state(&self, session: &TapeExportSession, state: ExportState) -> bool {
        let deadline = std::time::Instant::now() + WAIT;
        while std::time::Instant::now() < deadline {
            if session.snapshot().state == state {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        session.snapshot().state == state
    }

    fn item_path(&self, name: &str) -> PathBuf {
        self.env.cache_dir.join(name)
    }
}

fn open_cache(env: &TestEnvironment, store: &Arc<MemoryStore>, mode: CacheMode) -> Cache {
    Cache::open(
        Arc::clone(store) as Arc<dyn PersistenceStore>,
        Arc::new(OsFileStore),
        mode,
        "ingest1",
        &env.cache_dir,
        &env.browse_dir,
        &env.pse_dir,
        CacheTuning {
            watch_ready_timeout: Duration::from_secs(5),
            event_settle_delay: Duration::from_millis(10),
            event_retry_delay: Duration::from_millis(20),
            event_retries: 2,
        },
    )
    .unwrap()
}

fn item_row(store: &MemoryStore, filename: &str, created_at: i64, item_number: u32) -> CacheItemRow {
    let session_id = store
        .save_session(SessionRow {
            id: 0,
            recorder: "ingest1".into(),
            created_at,
            comments: String::new(),
            status: SessionStatus::Completed,
            abort_initiator: None,
            total_vtr_errors: 0,
            total_dropouts: 0,
        })
        .unwrap();
    let source = SourceItem::new("LTA000001", item_number);
    let dest_id = store
        .save_destination(DestinationRow {
            id: 0,
            session_id,
            destination: Destination::HardDisk(HardDiskDestination::new(
                filename,
                IngestFormat::Uncompressed,
                source.clone(),
            )),
            cache_id: None,
        })
        .unwrap();
    CacheItemRow {
        dest_id,
        cache_id: 0,
        filename: filename.to_string(),
        browse_filename: None,
        pse_filename: None,
        format: IngestFormat::Uncompressed,
        size: -1,
        duration: -1,
        pse_verdict: PseVerdict::Unknown,
        session_id,
        session_created_at: created_at,
        session_comments: String::new(),
        session_status: SessionStatus::Completed,
        source,
    }
}

fn policy(min: u64, max: u64) -> ExportPolicy {
    ExportPolicy { min_batch_bytes: min, max_batch_bytes: max, max_files: 10, keep_files: false }
}

#[test]
fn test_automatic_export_end_to_end() {
    // Oldest-first sizes [600, 600, 50] under a 1000-byte cap: the batch
    // is the first and third files.
    let fx = Fixture::new(&[("a.mxf", 600, 100), ("b.mxf", 600, 200), ("c.mxf", 50, 300)]);
    let session = fx.start(Selection::Automatic, policy(100, 1000));

    assert!(fx.wait_for_state(&session, ExportState::WaitingForTapeReady));
    let files = session.snapshot().files;
    assert_eq!(files.len(), 2);
    assert_eq!(files[0].filename, "LTO004201.mxf");
    assert_eq!(files[0].source_filename, "a.mxf");
    assert_eq!(files[1].filename, "LTO004202.mxf");
    assert_eq!(files[1].source_filename, "c.mxf");

    fx.drive.set_tape_state(TapeState::Ready);
    assert!(fx.wait_for_state(&session, ExportState::Transferring));
    // The advisory lock is held for the duration of the transfer.
    assert!(TransferLock::is_held(&fx.env.transfer_lock));
    assert_eq!(fx.drive.stored_barcode(), "LTO0042");
    assert!(fx.drive.stored_files()[0].ends_with("a.mxf"));

    // Offset moves past file 0: it is complete even without a per-file
    // signal; file 1 is the one now in flight.
    fx.drive.advance(1);
    let deadline = std::time::Instant::now() + WAIT;
    loop {
        let files = session.snapshot().files;
        if files[0].status == TransferStatus::Completed
            && files[1].status == TransferStatus::Started
        {
            break;
        }
        assert!(std::time::Instant::now() < deadline, "statuses never advanced: {:?}", files);
        std::thread::sleep(Duration::from_millis(5));
    }

    fx.drive.finish(true);
    assert_eq!(session.wait_for_terminal(WAIT), Some(ExportState::Completed));
    assert!(!TransferLock::is_held(&fx.env.transfer_lock));

    // Transferred masters leave the cache and the disk; the skipped file
    // stays.
    assert!(!fx.cache.item_exists("a.mxf"));
    assert!(!fx.cache.item_exists("c.mxf"));
    assert!(!fx.item_path("a.mxf").exists());
    assert!(fx.cache.item_exists("b.mxf"));
    assert!(fx.item_path("b.mxf").exists());

    // Session row completed, one catalogue export per transferred file.
    let sessions = fx.store.load_lto_sessions("ingest1", SessionStatus::Completed).unwrap();
    assert_eq!(sessions.len(), 1);
    let lto_files = fx.store.load_lto_files(sessions[0].id).unwrap();
    assert_eq!(lto_files.len(), 2);
    assert!(lto_files.iter().all(|f| f.status == TransferStatus::Completed));
    let exports = fx.store.catalogue_exports();
    assert_eq!(exports.len(), 2);
    assert_eq!(exports[0].data.lto_spool, "LTO0042");
    assert_eq!(exports[0].data.lto_item, 1);
}

#[test]
fn test_keep_files_override_leaves_cache_alone() {
    let fx = Fixture::new(&[("a.mxf", 500, 100)]);
    let mut keep = policy(100, 1000);
    keep.keep_files = true;
    let session = fx.start(Selection::Automatic, keep);

    fx.drive.set_tape_state(TapeState::Ready);
    assert!(fx.wait_for_state(&session, ExportState::Transferring));
    fx.drive.finish(true);
    assert_eq!(session.wait_for_terminal(WAIT), Some(ExportState::Completed));

    assert!(fx.cache.item_exists("a.mxf"));
    assert!(fx.item_path("a.mxf").exists());
}

#[test]
fn test_selection_waits_for_enough_backlog() {
    let fx = Fixture::new(&[("a.mxf", 40, 100)]);
    let session = fx.start(Selection::Automatic, policy(100, 1000));

    // Not enough material: the session keeps re-scanning.
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(session.snapshot().state, ExportState::SelectingFiles);
    session.abort("test over");
    assert_eq!(session.wait_for_terminal(WAIT), Some(ExportState::Aborted));
}

#[test]
fn test_manual_unknown_id_fails_start_without_rows() {
    let fx = Fixture::new(&[("a.mxf", 500, 100)]);
    let result = TapeExportSession::start(
        ExportDeps {
            store: Arc::clone(&fx.store) as Arc<dyn PersistenceStore>,
            cache: Arc::clone(&fx.cache),
            drive: Box::new(fx.drive.clone()),
        },
        "ingest1",
        "LTO0042",
        Selection::Manual(vec![999_999]),
        policy(0, 1000),
        fx.env.transfer_lock.clone(),
        ExportTuning { tick: Duration::from_millis(5) },
    );
    assert!(result.is_err());
    // Nothing was persisted for the refused session.
    assert!(fx.store.load_lto_sessions("ingest1", SessionStatus::InProgress).unwrap().is_empty());
    assert!(fx.store.load_lto_sessions("ingest1", SessionStatus::Aborted).unwrap().is_empty());
}

#[test]
fn test_manual_aborts_when_selected_file_vanishes() {
    let fx = Fixture::new(&[("a.mxf", 500, 100)]);
    let dest_id = fx.store.find_cache_item(fx.cache.cache_id(), "a.mxf").unwrap().unwrap().dest_id;
    let session = fx.start(Selection::Manual(vec![dest_id]), policy(0, 1000));
    assert_eq!(session.snapshot().state, ExportState::WaitingForTapeReady);

    // The operator's file disappears before the tape is ready.
    fx.cache.remove_item("a.mxf").unwrap();
    fx.drive.set_tape_state(TapeState::Ready);

    assert_eq!(session.wait_for_terminal(WAIT), Some(ExportState::Aborted));
    let sessions = fx.store.load_lto_sessions("ingest1", SessionStatus::Aborted).unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].abort_initiator, Some(AbortInitiator::System));
}

#[test]
fn test_automatic_reselects_when_file_vanishes() {
    let fx = Fixture::new(&[("a.mxf", 600, 100), ("b.mxf", 300, 200)]);
    let session = fx.start(Selection::Automatic, policy(100, 1000));
    assert!(fx.wait_for_state(&session, ExportState::WaitingForTapeReady));
    assert_eq!(session.snapshot().files.len(), 2);

    fx.cache.remove_item("b.mxf").unwrap();
    fx.drive.set_tape_state(TapeState::Ready);

    // Automatic policy quietly re-selects what is left.
    assert!(fx.wait_for_state(&session, ExportState::Transferring));
    let files = session.snapshot().files;
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].source_filename, "a.mxf");

    fx.drive.finish(true);
    assert_eq!(session.wait_for_terminal(WAIT), Some(ExportState::Completed));
}

#[test]
fn test_user_abort_keeps_cache_intact() {
    let fx = Fixture::new(&[("a.mxf", 500, 100)]);
    let session = fx.start(Selection::Automatic, policy(100, 1000));
    fx.drive.set_tape_state(TapeState::Ready);
    assert!(fx.wait_for_state(&session, ExportState::Transferring));

    session.abort("operator pressed stop");
    assert_eq!(session.wait_for_terminal(WAIT), Some(ExportState::Aborted));

    assert!(fx.drive.was_aborted());
    assert!(!TransferLock::is_held(&fx.env.transfer_lock));
    assert!(fx.cache.item_exists("a.mxf"));

    let sessions = fx.store.load_lto_sessions("ingest1", SessionStatus::Aborted).unwrap();
    assert_eq!(sessions[0].abort_initiator, Some(AbortInitiator::User));
    assert_eq!(sessions[0].comments, "operator pressed stop");
}

#[test]
fn test_drive_failure_fails_session_without_deletions() {
    let fx = Fixture::new(&[("a.mxf", 500, 100)]);
    let session = fx.start(Selection::Automatic, policy(100, 1000));
    fx.drive.set_tape_state(TapeState::Ready);
    assert!(fx.wait_for_state(&session, ExportState::Transferring));

    fx.drive.finish(false);
    assert_eq!(session.wait_for_terminal(WAIT), Some(ExportState::Failed));

    assert!(fx.cache.item_exists("a.mxf"));
    assert!(fx.item_path("a.mxf").exists());
    assert!(!TransferLock::is_held(&fx.env.transfer_lock));
}
