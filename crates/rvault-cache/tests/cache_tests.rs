//! End-to-end cache behavior over a real directory, a real watch feed and
//! an in-memory persistence store.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rvault_cache::{Cache, CacheError, CacheMode, CacheTuning};
use rvault_config::testing::TestEnvironment;
use rvault_fs::OsFileStore;
use rvault_persist::{CacheItemRow, DestinationRow, MemoryStore, PersistenceStore, SessionRow};
use rvault_types::{
    Destination, HardDiskDestination, IngestFormat, PseVerdict, SessionStatus, SourceItem,
};

fn fast_tuning() -> CacheTuning {
    CacheTuning {
        watch_ready_timeout: Duration::from_secs(5),
        event_settle_delay: Duration::from_millis(10),
        event_retry_delay: Duration::from_millis(50),
        event_retries: 10,
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
        fast_tuning(),
    )
    .unwrap()
}

/// Persist session + hard-disk destination rows; returns the item row.
fn item_row(
    store: &MemoryStore,
    filename: &str,
    created_at: i64,
    item_number: u32,
    size: i64,
) -> CacheItemRow {
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
    let mut hd = HardDiskDestination::new(filename, IngestFormat::Uncompressed, source.clone());
    hd.size = size;
    let dest_id = store
        .save_destination(DestinationRow {
            id: 0,
            session_id,
            destination: Destination::HardDisk(hd),
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
        size,
        duration: -1,
        pse_verdict: PseVerdict::Unknown,
        session_id,
        session_created_at: created_at,
        session_comments: String::new(),
        session_status: SessionStatus::Completed,
        source,
    }
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    condition()
}

fn link_row(store: &MemoryStore, cache: &Cache, row: &CacheItemRow, path: &Path) {
    std::fs::write(path.join(&row.filename), vec![0u8; row.size.max(0) as usize]).unwrap();
    store.link_cache_item(row.dest_id, cache.cache_id()).unwrap();
}

#[test]
fn test_register_then_finalise_roundtrip() {
    let env = TestEnvironment::new().unwrap();
    let store = Arc::new(MemoryStore::new());
    let cache = open_cache(&env, &store, CacheMode::ReadWrite);

    let row = item_row(&store, "foo.mxf", 100, 1, -1);
    cache.register_creating_item(&row, false, false).unwrap();

    let staged = env.creating_dir().join("foo.mxf");
    assert!(staged.exists());
    assert_eq!(std::fs::metadata(&staged).unwrap().len(), 0);
    assert!(cache.creating_item("foo.mxf").is_some());
    assert!(!cache.item_exists("foo.mxf"));

    cache.finalise_creating_item("foo.mxf").unwrap();
    assert!(env.cache_dir.join("foo.mxf").exists());
    assert!(!staged.exists());
    assert!(cache.creating_item("foo.mxf").is_none());
    assert!(cache.item_exists("foo.mxf"));
}

#[test]
fn test_duplicate_rows_keep_later_session() {
    let env = TestEnvironment::new().unwrap();
    let store = Arc::new(MemoryStore::new());

    // Two rows claim bar.mxf; the T1=100 one lost its file to an overwrite.
    let older = item_row(&store, "bar.mxf", 100, 1, 10);
    let newer = item_row(&store, "bar.mxf", 200, 2, 20);
    env.create_cache_file("bar.mxf", &[0u8; 20]).unwrap();

    {
        // Pre-link both rows to the cache row the open() will find.
        let cache_row = store.create_cache_row("ingest1", &env.cache_dir.to_string_lossy()).unwrap();
        store.link_cache_item(older.dest_id, cache_row.id).unwrap();
        store.link_cache_item(newer.dest_id, cache_row.id).unwrap();
    }

    let cache = open_cache(&env, &store, CacheMode::ReadWrite);

    let survivors = store.load_cache_items(cache.cache_id()).unwrap();
    assert_eq!(survivors.len(), 1);
    assert_eq!(survivors[0].dest_id, newer.dest_id);
    assert_eq!(survivors[0].session_created_at, 200);
    assert!(cache.item_exists("bar.mxf"));
    assert_eq!(cache.status().num_items, 1);
}

#[test]
fn test_reconciliation_drops_dangling_rows_and_keeps_orphans() {
    let env = TestEnvironment::new().unwrap();
    let store = Arc::new(MemoryStore::new());

    let dangling = item_row(&store, "vanished.mxf", 100, 1, 10);
    {
        let cache_row = store.create_cache_row("ingest1", &env.cache_dir.to_string_lossy()).unwrap();
        store.link_cache_item(dangling.dest_id, cache_row.id).unwrap();
    }
    // An orphan file nothing knows about.
    env.create_cache_file("mystery.mxf", b"???").unwrap();

    let cache = open_cache(&env, &store, CacheMode::ReadWrite);

    // Dangling row unlinked, orphan left on disk but off the books.
    assert!(store.load_cache_items(cache.cache_id()).unwrap().is_empty());
    assert!(env.cache_dir.join("mystery.mxf").exists());
    assert!(!cache.item_exists("mystery.mxf"));
    assert_eq!(cache.status().num_items, 0);
}

#[test]
fn test_reconciliation_is_idempotent() {
    let env = TestEnvironment::new().unwrap();
    let store = Arc::new(MemoryStore::new());

    let older = item_row(&store, "bar.mxf", 100, 1, 10);
    let newer = item_row(&store, "bar.mxf", 200, 2, 20);
    let dangling = item_row(&store, "vanished.mxf", 150, 1, 10);
    env.create_cache_file("bar.mxf", &[0u8; 20]).unwrap();
    let cache_id = {
        let cache_row = store.create_cache_row("ingest1", &env.cache_dir.to_string_lossy()).unwrap();
        for row in [&older, &newer, &dangling] {
            store.link_cache_item(row.dest_id, cache_row.id).unwrap();
        }
        cache_row.id
    };

    let first: Vec<String> = {
        let cache = open_cache(&env, &store, CacheMode::ReadWrite);
        cache.contents().into_iter().map(|e| e.row.filename).collect()
    };
    let rows_after_first = store.load_cache_items(cache_id).unwrap();

    let second: Vec<String> = {
        let cache = open_cache(&env, &store, CacheMode::ReadWrite);
        cache.contents().into_iter().map(|e| e.row.filename).collect()
    };
    let rows_after_second = store.load_cache_items(cache_id).unwrap();

    assert_eq!(first, second);
    assert_eq!(rows_after_first, rows_after_second);
}

#[test]
fn test_staging_purged_on_open() {
    let env = TestEnvironment::new().unwrap();
    let store = Arc::new(MemoryStore::new());

    let creating = env.creating_dir();
    std::fs::create_dir_all(&creating).unwrap();
    std::fs::write(creating.join("halfdone.mxf"), b"partial").unwrap();

    let _cache = open_cache(&env, &store, CacheMode::ReadWrite);
    assert!(!creating.join("halfdone.mxf").exists());
}

#[test]
fn test_read_only_without_row_is_fatal() {
    let env = TestEnvironment::new().unwrap();
    let store = Arc::new(MemoryStore::new());

    let result = Cache::open(
        Arc::clone(&store) as Arc<dyn PersistenceStore>,
        Arc::new(OsFileStore),
        CacheMode::ReadOnly,
        "ingest1",
        &env.cache_dir,
        &env.browse_dir,
        &env.pse_dir,
        fast_tuning(),
    );
    assert!(matches!(result, Err(CacheError::NoCacheRow { .. })));
}

#[test]
fn test_read_only_rejects_reservations() {
    let env = TestEnvironment::new().unwrap();
    let store = Arc::new(MemoryStore::new());
    // Writer opens first so the row exists.
    drop(open_cache(&env, &store, CacheMode::ReadWrite));

    let cache = open_cache(&env, &store, CacheMode::ReadOnly);
    let row = item_row(&store, "foo.mxf", 100, 1, -1);
    assert!(matches!(
        cache.register_creating_item(&row, false, false),
        Err(CacheError::Config(_))
    ));
}

#[test]
fn test_watch_detects_external_addition() {
    let env = TestEnvironment::new().unwrap();
    let store = Arc::new(MemoryStore::new());
    let cache = open_cache(&env, &store, CacheMode::ReadWrite);

    let row = item_row(&store, "external.mxf", 100, 1, 5);
    link_row(&store, &cache, &row, &env.cache_dir);

    assert!(wait_until(Duration::from_secs(5), || cache.item_exists("external.mxf")));
    assert_eq!(cache.status().num_items, 1);
}

#[test]
fn test_watch_addition_retries_until_row_appears() {
    let env = TestEnvironment::new().unwrap();
    let store = Arc::new(MemoryStore::new());
    let cache = open_cache(&env, &store, CacheMode::ReadWrite);

    // File first; its row only lands a little later, as if another
    // process were mid-transaction.
    std::fs::write(env.cache_dir.join("late.mxf"), b"12345").unwrap();
    std::thread::sleep(Duration::from_millis(120));
    let row = item_row(&store, "late.mxf", 100, 1, 5);
    store.link_cache_item(row.dest_id, cache.cache_id()).unwrap();

    assert!(wait_until(Duration::from_secs(5), || cache.item_exists("late.mxf")));
}

#[test]
fn test_watch_detects_external_removal() {
    let env = TestEnvironment::new().unwrap();
    let store = Arc::new(MemoryStore::new());
    let cache = open_cache(&env, &store, CacheMode::ReadWrite);

    let row = item_row(&store, "doomed.mxf", 100, 1, -1);
    cache.register_creating_item(&row, false, false).unwrap();
    cache.finalise_creating_item("doomed.mxf").unwrap();
    assert!(cache.item_exists("doomed.mxf"));

    std::fs::remove_file(env.cache_dir.join("doomed.mxf")).unwrap();

    assert!(wait_until(Duration::from_secs(5), || !cache.item_exists("doomed.mxf")));
    assert!(store.find_cache_item(cache.cache_id(), "doomed.mxf").unwrap().is_none());
}

#[test]
fn test_status_counter_monotonic_per_mutation() {
    let env = TestEnvironment::new().unwrap();
    let store = Arc::new(MemoryStore::new());
    let cache = open_cache(&env, &store, CacheMode::ReadWrite);

    let mut last = cache.status().change_count;
    let row = fetch_and_bump(&cache, &store, &mut last, 1);
    // Each mutating call moved the counter by exactly one.
    cache.finalise_creating_item(&row.filename).unwrap();
    let now = cache.status().change_count;
    assert_eq!(now, last + 1);
    last = now;

    cache.remove_item(&row.filename).unwrap();
    assert_eq!(cache.status().change_count, last + 1);
}

fn fetch_and_bump(
    cache: &Cache,
    store: &MemoryStore,
    last: &mut u64,
    item_number: u32,
) -> CacheItemRow {
    let mut row = item_row(store, "counted.mxf", 100, item_number, -1);
    cache.register_creating_item(&row, false, false).unwrap();
    let after_register = cache.status().change_count;
    assert_eq!(after_register, *last + 1);

    row.size = 777;
    row.duration = 250;
    cache.update_creating_item(&row).unwrap();
    let after_update = cache.status().change_count;
    assert_eq!(after_update, after_register + 1);

    *last = after_update;
    row
}

#[test]
fn test_total_size_and_known_ids() {
    let env = TestEnvironment::new().unwrap();
    let store = Arc::new(MemoryStore::new());
    let cache = open_cache(&env, &store, CacheMode::ReadWrite);

    let mut ids = Vec::new();
    for (name, size) in [("a.mxf", 100i64), ("b.mxf", 200), ("c.mxf", 50)] {
        let mut row = item_row(&store, name, 100, 1, -1);
        cache.register_creating_item(&row, false, false).unwrap();
        row.size = size;
        cache.update_creating_item(&row).unwrap();
        cache.finalise_creating_item(name).unwrap();
        ids.push(row.dest_id);
    }

    assert!(cache.items_are_known(&ids));
    assert_eq!(cache.total_size(&ids), 350);
    assert_eq!(cache.total_size(&ids[..2]), 300);
}
