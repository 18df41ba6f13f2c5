//! The cache core: startup reconciliation, the watch dispatcher, and the
//! serialized mutating operations.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use rvault_fs::{page_filename, DirWatcher, FileStore, WatchEvent};
use rvault_persist::{CacheItemRow, CacheRow, PersistenceStore};
use tracing::{debug, error, info, warn};

use crate::{
    CacheError, CacheMode, CacheStatus, CacheTuning, ContentsEntry, Result, CREATING_SUBDIR,
};

/// A reservation: a file being written that is not yet an artifact.
struct CreatingEntry {
    row: CacheItemRow,
    /// Transient reservation (e.g. a multi-item page capture), excluded
    /// from contents listings.
    is_temp: bool,
    /// Filename is a page base; the files on disk are numbered pages.
    paged: bool,
}

#[derive(Default)]
struct Lists {
    items: Vec<CacheItemRow>,
    creating: Vec<CreatingEntry>,
}

struct Shared {
    mode: CacheMode,
    directory: PathBuf,
    creating_dir: PathBuf,
    browse_dir: PathBuf,
    pse_dir: PathBuf,
    row: CacheRow,
    fs: Arc<dyn FileStore>,
    store: Arc<dyn PersistenceStore>,
    tuning: CacheTuning,
    lists: Mutex<Lists>,
    status: Mutex<CacheStatus>,
}

/// Bumps the status snapshot exactly once on scope exit, however many
/// internal steps the operation took — but only if the operation armed it
/// by actually mutating something observable.
struct StatusGuard<'a> {
    shared: &'a Shared,
    armed: bool,
}

impl<'a> StatusGuard<'a> {
    fn new(shared: &'a Shared) -> Self {
        StatusGuard { shared, armed: false }
    }

    fn arm(&mut self) {
        self.armed = true;
    }
}

impl Drop for StatusGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let (num_items, total_size) = {
            let lists = self.shared.lists.lock().unwrap();
            let num = lists.items.len()
                + lists.creating.iter().filter(|c| !c.is_temp).count();
            let size = lists.items.iter().map(|i| i.size.max(0)).sum();
            (num, size)
        };
        let mut status = self.shared.status.lock().unwrap();
        status.num_items = num_items;
        status.total_size = total_size;
        status.change_count += 1;
    }
}

/// See the crate docs; one instance per recorder or exporter process.
pub struct Cache {
    shared: Arc<Shared>,
    stop: Arc<AtomicBool>,
    dispatcher: Option<JoinHandle<()>>,
}

impl Cache {
    /// Open the cache over `directory`, reconcile it against the store and
    /// the disk, and start absorbing watch events.
    ///
    /// Watch events that fire while reconciliation is still running are
    /// queued and only processed afterwards, so a file appearing mid-startup
    /// can neither be double-counted nor missed.
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        store: Arc<dyn PersistenceStore>,
        fs: Arc<dyn FileStore>,
        mode: CacheMode,
        recorder: &str,
        directory: &Path,
        browse_directory: &Path,
        pse_directory: &Path,
        tuning: CacheTuning,
    ) -> Result<Cache> {
        // The directory must pre-exist; a missing cache volume is an
        // operator problem, not something to silently create.
        fs.list_dir(directory)
            .map_err(|e| CacheError::Config(format!("cache directory {:?}: {}", directory, e)))?;

        let creating_dir = directory.join(CREATING_SUBDIR);
        if mode == CacheMode::ReadWrite {
            fs.mkdir_all(&creating_dir)?;
            // Leftover staging files are unfinished writes from a dead
            // process; they must never surface as finished artifacts.
            let stale = fs.list_dir(&creating_dir)?;
            for name in &stale {
                warn!(
                    component = "CACHE",
                    file = %name,
                    "purging stale staging file from previous run"
                );
                fs.unlink(&creating_dir.join(name))?;
            }
        }

        let path_str = directory.to_string_lossy().to_string();
        let row = match store.load_cache_row(recorder, &path_str)? {
            Some(row) => row,
            None if mode == CacheMode::ReadWrite => store.create_cache_row(recorder, &path_str)?,
            None => {
                return Err(CacheError::NoCacheRow {
                    recorder: recorder.to_string(),
                    path: directory.to_path_buf(),
                })
            }
        };

        let items = Self::reconcile(&*store, &*fs, &row, directory)?;

        // Register the watch before the dispatcher exists: events buffer in
        // the channel, and nothing consumes them until reconciliation has
        // fully settled.
        let watcher = DirWatcher::watch(directory)?;
        watcher.ready(tuning.watch_ready_timeout)?;

        let status = CacheStatus {
            change_count: 0,
            num_items: items.len(),
            total_size: items.iter().map(|i| i.size.max(0)).sum(),
        };

        let shared = Arc::new(Shared {
            mode,
            directory: directory.to_path_buf(),
            creating_dir,
            browse_dir: browse_directory.to_path_buf(),
            pse_dir: pse_directory.to_path_buf(),
            row,
            fs,
            store,
            tuning,
            lists: Mutex::new(Lists { items, creating: Vec::new() }),
            status: Mutex::new(status),
        });

        let stop = Arc::new(AtomicBool::new(false));
        let dispatcher = {
            let shared = Arc::clone(&shared);
            let stop = Arc::clone(&stop);
            std::thread::Builder::new()
                .name("cache-watch".into())
                .spawn(move || dispatch_loop(shared, watcher, stop))
                .map_err(rvault_fs::FsError::from)?
        };

        info!(
            component = "CACHE",
            directory = %path_str,
            items = shared.status.lock().unwrap().num_items,
            "cache open"
        );

        Ok(Cache { shared, stop, dispatcher: Some(dispatcher) })
    }

    /// Resolve persisted rows against the directory listing.
    fn reconcile(
        store: &dyn PersistenceStore,
        fs: &dyn FileStore,
        row: &CacheRow,
        directory: &Path,
    ) -> Result<Vec<CacheItemRow>> {
        let mut rows = store.load_cache_items(row.id)?;
        // Later session wins a filename clash: a duplicate name means the
        // earlier file was silently overwritten on disk.
        rows.sort_by_key(|r| r.session_created_at);
        let mut survivors: Vec<CacheItemRow> = Vec::new();
        for candidate in rows {
            match survivors.iter_mut().find(|s| s.filename == candidate.filename) {
                Some(existing) => {
                    let (keep_candidate, loser_id) =
                        if candidate.session_created_at > existing.session_created_at {
                            (true, existing.dest_id)
                        } else {
                            (false, candidate.dest_id)
                        };
                    warn!(
                        component = "CACHE",
                        file = %candidate.filename,
                        "duplicate cache rows, keeping the later session's"
                    );
                    store.unlink_cache_item(loser_id)?;
                    if keep_candidate {
                        *existing = candidate;
                    }
                }
                None => survivors.push(candidate),
            }
        }

        let on_disk = fs.list_dir(directory)?;
        let mut items = Vec::new();
        for row in survivors {
            if on_disk.iter().any(|n| n == &row.filename) {
                items.push(row);
            } else {
                warn!(
                    component = "CACHE",
                    file = %row.filename,
                    "cache row without a file, unlinking"
                );
                store.unlink_cache_item(row.dest_id)?;
            }
        }
        for name in &on_disk {
            if !items.iter().any(|i| &i.filename == name) {
                // Left alone for manual inspection.
                warn!(component = "CACHE", file = %name, "unknown orphan file in cache");
            }
        }
        Ok(items)
    }

    /// Stop the watch dispatcher. Called automatically on drop.
    pub fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.dispatcher.take() {
            let _ = handle.join();
        }
    }

    pub fn cache_id(&self) -> i64 {
        self.shared.row.id
    }

    pub fn mode(&self) -> CacheMode {
        self.shared.mode
    }

    pub fn status(&self) -> CacheStatus {
        *self.shared.status.lock().unwrap()
    }

    /// Free bytes on the cache volume.
    pub fn disk_space(&self) -> Result<u64> {
        Ok(self.shared.fs.disk_space(&self.shared.directory)?)
    }

    /// Full path of a (finished) cache file.
    pub fn complete_filename(&self, name: &str) -> PathBuf {
        self.shared.directory.join(name)
    }

    /// Full path of a staging file while it is being written.
    pub fn creating_filename(&self, name: &str) -> PathBuf {
        self.shared.creating_dir.join(name)
    }

    /// The staging subdirectory itself.
    pub fn creating_dir(&self) -> &Path {
        &self.shared.creating_dir
    }

    pub fn browse_filename(&self, name: &str) -> PathBuf {
        self.shared.browse_dir.join(name)
    }

    pub fn pse_filename(&self, name: &str) -> PathBuf {
        self.shared.pse_dir.join(name)
    }

    /// Register a reservation for a file about to be written.
    ///
    /// Creates the zero-byte placeholder in the staging subdirectory (for
    /// paged captures, only page 0) and links the destination row to this
    /// cache. A leftover reservation under the same name is a recovered
    /// bug: it is forcibly removed with a warning, not a hard failure.
    pub fn register_creating_item(
        &self,
        row: &CacheItemRow,
        is_temp: bool,
        paged: bool,
    ) -> Result<()> {
        let shared = &*self.shared;
        shared.require_writable()?;
        let mut status = StatusGuard::new(shared);
        {
            let mut lists = shared.lists.lock().unwrap();
            if lists.items.iter().any(|i| i.filename == row.filename) {
                return Err(CacheError::AlreadyExists(row.filename.clone()));
            }
            if let Some(pos) =
                lists.creating.iter().position(|c| c.row.filename == row.filename)
            {
                warn!(
                    component = "CACHE",
                    file = %row.filename,
                    "stale creating item under the same name, removing it"
                );
                let stale = lists.creating.remove(pos);
                status.arm();
                if let Err(e) = shared.store.unlink_cache_item(stale.row.dest_id) {
                    warn!(component = "CACHE", error = %e, "failed to unlink stale reservation");
                }
                shared.delete_staging_files(&stale)?;
            }

            let placeholder = if paged {
                shared.creating_dir.join(page_filename(&row.filename, 0))
            } else {
                shared.creating_dir.join(&row.filename)
            };
            shared.fs.create_empty(&placeholder)?;
            shared.store.link_cache_item(row.dest_id, shared.row.id)?;
            lists.creating.push(CreatingEntry { row: row.clone(), is_temp, paged });
            status.arm();
        }
        Ok(())
    }

    /// Refresh the mutable projection of a reservation (status, size,
    /// duration, PSE result). The reservation must exist; its absence is a
    /// caller bug, not a recoverable condition.
    pub fn update_creating_item(&self, row: &CacheItemRow) -> Result<()> {
        let shared = &*self.shared;
        let mut status = StatusGuard::new(shared);
        {
            let mut lists = shared.lists.lock().unwrap();
            let entry = lists
                .creating
                .iter_mut()
                .find(|c| c.row.filename == row.filename)
                .ok_or_else(|| {
                    error!(component = "CACHE", file = %row.filename, "update for unregistered item");
                    CacheError::NotRegistered(row.filename.clone())
                })?;
            entry.row = row.clone();
            shared.store.update_cache_item(row)?;
            status.arm();
        }
        Ok(())
    }

    /// Promote a reservation to a finished artifact.
    ///
    /// The staging file is renamed into the main directory first; if the
    /// rename fails the whole call fails and the item stays exactly where
    /// it was — in the creating list and nowhere else.
    pub fn finalise_creating_item(&self, filename: &str) -> Result<()> {
        let shared = &*self.shared;
        shared.require_writable()?;
        let mut status = StatusGuard::new(shared);
        {
            let mut lists = shared.lists.lock().unwrap();
            let pos = lists
                .creating
                .iter()
                .position(|c| c.row.filename == filename)
                .ok_or_else(|| {
                    error!(component = "CACHE", file = %filename, "finalise for unregistered item");
                    CacheError::NotRegistered(filename.to_string())
                })?;

            let from = shared.creating_dir.join(filename);
            let to = shared.directory.join(filename);
            shared.fs.rename(&from, &to)?;

            let mut row = lists.creating[pos].row.clone();
            if row.size < 0 {
                if let Some(size) = shared.fs.stat(&to)? {
                    row.size = size as i64;
                    shared.store.update_cache_item(&row)?;
                }
            }

            lists.creating.remove(pos);
            lists.items.push(row);
            status.arm();
            debug!(component = "CACHE", file = %filename, "reservation finalised");
        }
        Ok(())
    }

    /// Drop a reservation: unlink its row, delete its staging file(s), and
    /// forget it. Browse and PSE copies are deliberately left alone —
    /// losing the master must never also destroy the fallbacks.
    pub fn remove_creating_item(&self, filename: &str) -> Result<()> {
        let shared = &*self.shared;
        let mut status = StatusGuard::new(shared);
        {
            let mut lists = shared.lists.lock().unwrap();
            let pos = lists
                .creating
                .iter()
                .position(|c| c.row.filename == filename)
                .ok_or_else(|| CacheError::NotRegistered(filename.to_string()))?;
            let entry = lists.creating.remove(pos);
            status.arm();
            shared.store.unlink_cache_item(entry.row.dest_id)?;
            shared.delete_staging_files(&entry)?;
        }
        Ok(())
    }

    /// Drop every reservation, best effort. Used on session abort.
    pub fn remove_creating_items(&self) -> Result<()> {
        let shared = &*self.shared;
        let mut status = StatusGuard::new(shared);
        {
            let mut lists = shared.lists.lock().unwrap();
            for entry in lists.creating.drain(..) {
                status.arm();
                if let Err(e) = shared.store.unlink_cache_item(entry.row.dest_id) {
                    warn!(component = "CACHE", file = %entry.row.filename, error = %e,
                        "failed to unlink reservation row");
                }
                if let Err(e) = shared.delete_staging_files(&entry) {
                    warn!(component = "CACHE", file = %entry.row.filename, error = %e,
                        "failed to delete staging file");
                }
            }
        }
        Ok(())
    }

    /// Remove a finished artifact by name. The store row is unlinked
    /// regardless; the return value reports whether the on-disk delete
    /// actually happened ("file already gone" is worth reporting, not
    /// worth failing over).
    pub fn remove_item(&self, filename: &str) -> Result<bool> {
        let shared = &*self.shared;
        let mut status = StatusGuard::new(shared);
        {
            let mut lists = shared.lists.lock().unwrap();
            let Some(pos) = lists.items.iter().position(|i| i.filename == filename) else {
                warn!(component = "CACHE", file = %filename, "remove for unknown item");
                return Ok(false);
            };
            let entry = lists.items.remove(pos);
            status.arm();
            shared.store.unlink_cache_item(entry.dest_id)?;

            let path = shared.directory.join(filename);
            let deleted = match shared.fs.stat(&path)? {
                Some(_) => match shared.fs.unlink(&path) {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(component = "CACHE", file = %filename, error = %e, "delete failed");
                        false
                    }
                },
                None => {
                    warn!(component = "CACHE", file = %filename, "file already gone");
                    false
                }
            };
            Ok(deleted)
        }
    }

    /// Remove a finished artifact by destination id.
    pub fn remove_item_by_id(&self, dest_id: i64) -> Result<bool> {
        let name = {
            let lists = self.shared.lists.lock().unwrap();
            lists.items.iter().find(|i| i.dest_id == dest_id).map(|i| i.filename.clone())
        };
        match name {
            Some(name) => self.remove_item(&name),
            None => {
                warn!(component = "CACHE", dest_id, "remove for unknown item id");
                Ok(false)
            }
        }
    }

    pub fn item_exists(&self, filename: &str) -> bool {
        let lists = self.shared.lists.lock().unwrap();
        lists.items.iter().any(|i| i.filename == filename)
    }

    pub fn item_name(&self, dest_id: i64) -> Option<String> {
        let lists = self.shared.lists.lock().unwrap();
        lists.items.iter().find(|i| i.dest_id == dest_id).map(|i| i.filename.clone())
    }

    /// True only if every requested id is currently present.
    pub fn items_are_known(&self, dest_ids: &[i64]) -> bool {
        let lists = self.shared.lists.lock().unwrap();
        dest_ids.iter().all(|id| lists.items.iter().any(|i| i.dest_id == *id))
    }

    /// Sum of sizes across the requested (finished) items.
    pub fn total_size(&self, dest_ids: &[i64]) -> i64 {
        let lists = self.shared.lists.lock().unwrap();
        lists
            .items
            .iter()
            .filter(|i| dest_ids.contains(&i.dest_id))
            .map(|i| i.size.max(0))
            .sum()
    }

    /// The current reservation row for `filename`, if any.
    pub fn creating_item(&self, filename: &str) -> Option<CacheItemRow> {
        let lists = self.shared.lists.lock().unwrap();
        lists.creating.iter().find(|c| c.row.filename == filename).map(|c| c.row.clone())
    }

    /// Ordered listing: finished items plus non-temporary reservations,
    /// newest session first, ties broken by descending item number.
    pub fn contents(&self) -> Vec<ContentsEntry> {
        let lists = self.shared.lists.lock().unwrap();
        let mut entries: Vec<ContentsEntry> = lists
            .items
            .iter()
            .map(|row| ContentsEntry { row: row.clone(), creating: false })
            .chain(
                lists
                    .creating
                    .iter()
                    .filter(|c| !c.is_temp)
                    .map(|c| ContentsEntry { row: c.row.clone(), creating: true }),
            )
            .collect();
        entries.sort_by(|a, b| {
            b.row
                .session_created_at
                .cmp(&a.row.session_created_at)
                .then(b.row.source.item_number.cmp(&a.row.source.item_number))
        });
        entries
    }

    /// Watch-driven addition. Returns false when the row is not yet
    /// visible in the store so the dispatcher can retry: another process
    /// may still be mid-transaction.
    pub(crate) fn process_item_added(&self, name: &str) -> bool {
        shared_process_item_added(&self.shared, name)
    }

    /// Watch-driven removal. Also fires, redundantly, for files this
    /// process removed through its own API; that case is a harmless no-op.
    pub(crate) fn process_item_removed(&self, name: &str) -> bool {
        shared_process_item_removed(&self.shared, name)
    }
}

impl Drop for Cache {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Shared {
    fn require_writable(&self) -> Result<()> {
        match self.mode {
            CacheMode::ReadWrite => Ok(()),
            CacheMode::ReadOnly => {
                Err(CacheError::Config("cache is open read-only".to_string()))
            }
        }
    }

    /// Delete a reservation's staging file(s); pages are deleted 0, 1, 2, …
    /// until one is missing.
    fn delete_staging_files(&self, entry: &CreatingEntry) -> Result<()> {
        if entry.paged {
            let mut page = 0u32;
            loop {
                let path = self.creating_dir.join(page_filename(&entry.row.filename, page));
                if self.fs.stat(&path)?.is_none() {
                    break;
                }
                self.fs.unlink(&path)?;
                page += 1;
            }
        } else {
            let path = self.creating_dir.join(&entry.row.filename);
            if self.fs.stat(&path)?.is_some() {
                self.fs.unlink(&path)?;
            } else {
                warn!(component = "CACHE", file = %entry.row.filename, "staging file already gone");
            }
        }
        Ok(())
    }
}

fn shared_process_item_added(shared: &Shared, name: &str) -> bool {
    let row = match shared.store.find_cache_item(shared.row.id, name) {
        Ok(Some(row)) => row,
        Ok(None) => return false,
        Err(e) => {
            warn!(component = "CACHE", file = %name, error = %e, "store lookup failed");
            return false;
        }
    };
    let mut status = StatusGuard::new(shared);
    {
        let mut lists = shared.lists.lock().unwrap();
        let known = lists.items.iter().any(|i| i.filename == name)
            || lists.creating.iter().any(|c| c.row.filename == name);
        if known {
            return true;
        }
        info!(component = "CACHE", file = %name, "item appeared in cache directory");
        lists.items.push(row);
        status.arm();
    }
    true
}

fn shared_process_item_removed(shared: &Shared, name: &str) -> bool {
    let mut status = StatusGuard::new(shared);
    let removed = {
        let mut lists = shared.lists.lock().unwrap();
        match lists.items.iter().position(|i| i.filename == name) {
            Some(pos) => {
                let entry = lists.items.remove(pos);
                status.arm();
                info!(component = "CACHE", file = %name, "item left cache directory");
                Some(entry.dest_id)
            }
            None => None,
        }
    };
    match removed {
        Some(dest_id) => {
            if let Err(e) = shared.store.unlink_cache_item(dest_id) {
                warn!(component = "CACHE", file = %name, error = %e, "unlink failed");
            }
            true
        }
        None => {
            // Possibly our own removal echoing back; unlink any row that
            // still points at the vanished file.
            if let Ok(Some(row)) = shared.store.find_cache_item(shared.row.id, name) {
                if let Err(e) = shared.store.unlink_cache_item(row.dest_id) {
                    warn!(component = "CACHE", file = %name, error = %e, "unlink failed");
                }
            }
            false
        }
    }
}

/// Watch dispatcher thread body. Never lets an error escape: a failed
/// lookup is retried, everything else is logged and dropped, and the
/// watch stays alive either way.
fn dispatch_loop(shared: Arc<Shared>, watcher: DirWatcher, stop: Arc<AtomicBool>) {
    while !stop.load(Ordering::Relaxed) {
        let Some(event) = watcher.next_event(Duration::from_millis(100)) else {
            continue;
        };
        match event {
            WatchEvent::Created(name) | WatchEvent::MovedIn(name) => {
                handle_added(&shared, &stop, &name);
            }
            WatchEvent::Removed(name) | WatchEvent::MovedOut(name) => {
                shared_process_item_removed(&shared, &name);
            }
            WatchEvent::WatchedDirRemoved => {
                error!(component = "CACHE", directory = %shared.directory.display(),
                    "watched cache directory was removed");
            }
        }
    }
}

fn handle_added(shared: &Shared, stop: &AtomicBool, name: &str) {
    if name == CREATING_SUBDIR {
        return;
    }
    // Give the writer time to close and commit before the first lookup.
    std::thread::sleep(shared.tuning.event_settle_delay);

    match shared.fs.stat(&shared.directory.join(name)) {
        Ok(Some(_)) => {}
        // Not a regular file, or already gone again; a removal event will
        // follow in the latter case.
        _ => return,
    }

    let mut attempt = 0;
    loop {
        if shared_process_item_added(shared, name) {
            return;
        }
        attempt += 1;
        if attempt > shared.tuning.event_retries || stop.load(Ordering::Relaxed) {
            break;
        }
        debug!(component = "CACHE", file = %name, attempt, "no row yet, retrying");
        std::thread::sleep(shared.tuning.event_retry_delay);
    }
    warn!(
        component = "CACHE",
        file = %name,
        "file appeared but no row ever did; leaving it as an orphan"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use rvault_fs::OsFileStore;
    use rvault_persist::{DestinationRow, MemoryStore, SessionRow};
    use rvault_types::{
        Destination, HardDiskDestination, IngestFormat, PseVerdict, SessionStatus, SourceItem,
    };
    use std::sync::Arc;
    use tempfile::TempDir;

    fn fast_tuning() -> CacheTuning {
        CacheTuning {
            watch_ready_timeout: Duration::from_secs(5),
            event_settle_delay: Duration::from_millis(10),
            event_retry_delay: Duration::from_millis(20),
            event_retries: 3,
        }
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        _temp: TempDir,
        dir: PathBuf,
        browse: PathBuf,
        pse: PathBuf,
    }

    impl Fixture {
        fn new() -> Fixture {
            let temp = TempDir::new().unwrap();
            let dir = temp.path().join("cache");
            let browse = temp.path().join("browse");
            let pse = temp.path().join("pse");
            std::fs::create_dir_all(&dir).unwrap();
            std::fs::create_dir_all(&browse).unwrap();
            std::fs::create_dir_all(&pse).unwrap();
            Fixture { store: Arc::new(MemoryStore::new()), _temp: temp, dir, browse, pse }
        }

        fn open(&self) -> Cache {
            Cache::open(
                Arc::clone(&self.store) as Arc<dyn PersistenceStore>,
                Arc::new(OsFileStore),
                CacheMode::ReadWrite,
                "ingest1",
                &self.dir,
                &self.browse,
                &self.pse,
                fast_tuning(),
            )
            .unwrap()
        }

        /// Persist a session + destination pair and return the item row the
        /// cache will work with.
        fn item_row(&self, filename: &str, created_at: i64, item_number: u32) -> CacheItemRow {
            let session_id = self
                .store
                .save_session(SessionRow {
                    id: 0,
                    recorder: "ingest1".into(),
                    created_at,
                    comments: String::new(),
                    status: SessionStatus::InProgress,
                    abort_initiator: None,
                    total_vtr_errors: 0,
                    total_dropouts: 0,
                })
                .unwrap();
            let source = SourceItem::new("LTA000001", item_number);
            let dest_id = self
                .store
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
                session_status: SessionStatus::InProgress,
                source,
            }
        }
    }

    #[test]
    fn test_register_bumps_status_once() {
        let fx = Fixture::new();
        let cache = fx.open();
        let before = cache.status().change_count;

        let row = fx.item_row("foo.mxf", 100, 1);
        cache.register_creating_item(&row, false, false).unwrap();

        let after = cache.status();
        assert_eq!(after.change_count, before + 1);
        assert_eq!(after.num_items, 1);
    }

    #[test]
    fn test_register_duplicate_of_finalized_fails() {
        let fx = Fixture::new();
        let cache = fx.open();

        let row = fx.item_row("foo.mxf", 100, 1);
        cache.register_creating_item(&row, false, false).unwrap();
        cache.finalise_creating_item("foo.mxf").unwrap();

        let clash = fx.item_row("foo.mxf", 200, 2);
        let before = cache.status().change_count;
        assert!(matches!(
            cache.register_creating_item(&clash, false, false),
            Err(CacheError::AlreadyExists(_))
        ));
        // A refused registration is not an observable mutation.
        assert_eq!(cache.status().change_count, before);
    }

    #[test]
    fn test_register_replaces_stale_reservation() {
        let fx = Fixture::new();
        let cache = fx.open();

        let stale = fx.item_row("foo.mxf", 100, 1);
        cache.register_creating_item(&stale, false, false).unwrap();

        let fresh = fx.item_row("foo.mxf", 200, 2);
        cache.register_creating_item(&fresh, false, false).unwrap();

        let entry = cache.creating_item("foo.mxf").unwrap();
        assert_eq!(entry.dest_id, fresh.dest_id);
    }

    #[test]
    fn test_update_unregistered_is_an_error() {
        let fx = Fixture::new();
        let cache = fx.open();
        let row = fx.item_row("nope.mxf", 100, 1);
        assert!(matches!(
            cache.update_creating_item(&row),
            Err(CacheError::NotRegistered(_))
        ));
    }

    #[test]
    fn test_finalise_failure_leaves_item_creating() {
        let fx = Fixture::new();
        let cache = fx.open();

        let row = fx.item_row("foo.mxf", 100, 1);
        cache.register_creating_item(&row, false, false).unwrap();
        // Sabotage: the staging file vanishes before the rename.
        std::fs::remove_file(fx.dir.join(CREATING_SUBDIR).join("foo.mxf")).unwrap();

        assert!(cache.finalise_creating_item("foo.mxf").is_err());
        // P3: still creating, not an item — never both, never neither.
        assert!(cache.creating_item("foo.mxf").is_some());
        assert!(!cache.item_exists("foo.mxf"));
    }

    #[test]
    fn test_paged_reservation_placeholder_and_removal() {
        let fx = Fixture::new();
        let cache = fx.open();

        let row = fx.item_row("lta000001", 100, 1);
        cache.register_creating_item(&row, true, true).unwrap();

        let creating = fx.dir.join(CREATING_SUBDIR);
        assert!(creating.join("lta000001__0.mxfp").exists());

        // More pages appear as capture proceeds.
        std::fs::write(creating.join("lta000001__1.mxfp"), b"x").unwrap();
        std::fs::write(creating.join("lta000001__2.mxfp"), b"x").unwrap();

        cache.remove_creating_item("lta000001").unwrap();
        assert!(!creating.join("lta000001__0.mxfp").exists());
        assert!(!creating.join("lta000001__1.mxfp").exists());
        assert!(!creating.join("lta000001__2.mxfp").exists());
    }

    #[test]
    fn test_temp_reservation_hidden_from_contents() {
        let fx = Fixture::new();
        let cache = fx.open();

        let page = fx.item_row("lta000001", 100, 1);
        cache.register_creating_item(&page, true, true).unwrap();
        let real = fx.item_row("real.mxf", 100, 2);
        cache.register_creating_item(&real, false, false).unwrap();

        let listing = cache.contents();
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].row.filename, "real.mxf");
        assert!(listing[0].creating);
    }

    #[test]
    fn test_remove_item_reports_missing_file() {
        let fx = Fixture::new();
        let cache = fx.open();

        let row = fx.item_row("foo.mxf", 100, 1);
        cache.register_creating_item(&row, false, false).unwrap();
        cache.finalise_creating_item("foo.mxf").unwrap();

        // Out-of-band delete; the store row must still be unlinked, the
        // call just reports false.
        std::fs::remove_file(fx.dir.join("foo.mxf")).unwrap();
        assert!(!cache.remove_item("foo.mxf").unwrap());
        assert!(fx.store.find_cache_item(cache.cache_id(), "foo.mxf").unwrap().is_none());
    }

    #[test]
    fn test_contents_ordering_newest_first() {
        let fx = Fixture::new();
        let cache = fx.open();

        for (name, at, item) in
            [("a.mxf", 100, 1), ("b.mxf", 300, 1), ("c.mxf", 200, 2), ("d.mxf", 200, 1)]
        {
            let row = fx.item_row(name, at, item);
            cache.register_creating_item(&row, false, false).unwrap();
            cache.finalise_creating_item(name).unwrap();
        }

        let names: Vec<_> =
            cache.contents().into_iter().map(|e| e.row.filename).collect();
        assert_eq!(names, ["b.mxf", "c.mxf", "d.mxf", "a.mxf"]);
    }

    #[test]
    fn test_items_are_known_requires_all() {
        let fx = Fixture::new();
        let cache = fx.open();

        let row = fx.item_row("foo.mxf", 100, 1);
        let id = row.dest_id;
        cache.register_creating_item(&row, false, false).unwrap();
        cache.finalise_creating_item("foo.mxf").unwrap();

        assert!(cache.items_are_known(&[id]));
        assert!(!cache.items_are_known(&[id, id + 1000]));
        assert!(cache.items_are_known(&[]));
    }
}
