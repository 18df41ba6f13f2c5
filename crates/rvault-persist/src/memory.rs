//! In-memory store.
//!
//! One mutex over plain maps. Also the substrate of [`crate::JsonStore`],
//! which snapshots the whole table set after each mutation.

use std::collections::HashMap;
use std::sync::Mutex;

use rvault_types::{Destination, SessionStatus, TransferStatus};
use serde::{Deserialize, Serialize};

use crate::rows::{
    CacheItemRow, CacheRow, CatalogueExportRow, DestinationRow, LtoFileRow, LtoSessionRow,
    SessionRow,
};
use crate::{PersistError, PersistenceStore, Result};

#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct Tables {
    next_id: i64,
    caches: Vec<CacheRow>,
    sessions: HashMap<i64, SessionRow>,
    destinations: HashMap<i64, DestinationRow>,
    lto_sessions: HashMap<i64, LtoSessionRow>,
    lto_files: HashMap<i64, LtoFileRow>,
    catalogue_exports: Vec<CatalogueExportRow>,
    instance_counters: HashMap<String, u32>,
}

impl Tables {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    /// Join a hard-disk destination with its session projection.
    fn item_row(&self, dest: &DestinationRow) -> Option<CacheItemRow> {
        let hd = match &dest.destination {
            Destination::HardDisk(hd) => hd,
            Destination::VideoTape(_) => return None,
        };
        let session = self.sessions.get(&dest.session_id)?;
        Some(CacheItemRow {
            dest_id: dest.id,
            cache_id: dest.cache_id?,
            filename: hd.filename.clone(),
            browse_filename: hd.browse_filename.clone(),
            pse_filename: hd.pse_filename.clone(),
            format: hd.format,
            size: hd.size,
            duration: hd.duration,
            pse_verdict: hd.pse_verdict,
            session_id: session.id,
            session_created_at: session.created_at,
            session_comments: session.comments.clone(),
            session_status: session.status,
            source: hd.source.clone(),
        })
    }
}

/// [`PersistenceStore`] over mutex-guarded maps.
#[derive(Debug, Default)]
pub struct MemoryStore {
    pub(crate) tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }

    /// Catalogue export rows, in save order. Test-suite convenience; the
    /// store trait itself only ever appends these.
    pub fn catalogue_exports(&self) -> Vec<CatalogueExportRow> {
        self.tables.lock().unwrap().catalogue_exports.clone()
    }

    pub(crate) fn snapshot_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&*self.tables.lock().unwrap())?)
    }

    pub(crate) fn restore_json(&self, json: &str) -> Result<()> {
        *self.tables.lock().unwrap() = serde_json::from_str(json)?;
        Ok(())
    }
}

impl PersistenceStore for MemoryStore {
    fn load_cache_row(&self, recorder: &str, path: &str) -> Result<Option<CacheRow>> {
        let tables = self.tables.lock().unwrap();
        Ok(tables
            .caches
            .iter()
            .find(|c| c.recorder == recorder && c.path == path)
            .cloned())
    }

    fn create_cache_row(&self, recorder: &str, path: &str) -> Result<CacheRow> {
        let mut tables = self.tables.lock().unwrap();
        let row = CacheRow {
            id: tables.next_id(),
            recorder: recorder.to_string(),
            path: path.to_string(),
        };
        tables.caches.push(row.clone());
        Ok(row)
    }

    fn load_cache_items(&self, cache_id: i64) -> Result<Vec<CacheItemRow>> {
        let tables = self.tables.lock().unwrap();
        let mut items: Vec<CacheItemRow> = tables
            .destinations
            .values()
            .filter(|d| d.cache_id == Some(cache_id))
            .filter_map(|d| tables.item_row(d))
            .collect();
        items.sort_by_key(|i| i.dest_id);
        Ok(items)
    }

    fn find_cache_item(&self, cache_id: i64, filename: &str) -> Result<Option<CacheItemRow>> {
        let tables = self.tables.lock().unwrap();
        Ok(tables
            .destinations
            .values()
            .filter(|d| d.cache_id == Some(cache_id))
            .filter_map(|d| tables.item_row(d))
            .find(|i| i.filename == filename))
    }

    fn link_cache_item(&self, dest_id: i64, cache_id: i64) -> Result<()> {
        let mut tables = self.tables.lock().unwrap();
        let dest = tables
            .destinations
            .get_mut(&dest_id)
            .ok_or(PersistError::NotFound { what: "destination", id: dest_id })?;
        dest.cache_id = Some(cache_id);
        Ok(())
    }

    fn unlink_cache_item(&self, dest_id: i64) -> Result<()> {
        let mut tables = self.tables.lock().unwrap();
        if let Some(dest) = tables.destinations.get_mut(&dest_id) {
            dest.cache_id = None;
        }
        // A vanished row is already unlinked; nothing to report.
        Ok(())
    }

    fn update_cache_item(&self, row: &CacheItemRow) -> Result<()> {
        let mut tables = self.tables.lock().unwrap();
        let dest = tables
            .destinations
            .get_mut(&row.dest_id)
            .ok_or(PersistError::NotFound { what: "destination", id: row.dest_id })?;
        if let Destination::HardDisk(hd) = &mut dest.destination {
            hd.filename = row.filename.clone();
            hd.browse_filename = row.browse_filename.clone();
            hd.pse_filename = row.pse_filename.clone();
            hd.size = row.size;
            hd.duration = row.duration;
            hd.pse_verdict = row.pse_verdict;
        }
        Ok(())
    }

    fn save_session(&self, mut row: SessionRow) -> Result<i64> {
        let mut tables = self.tables.lock().unwrap();
        row.id = tables.next_id();
        let id = row.id;
        tables.sessions.insert(id, row);
        Ok(id)
    }

    fn update_session(&self, row: &SessionRow) -> Result<()> {
        let mut tables = self.tables.lock().unwrap();
        if !tables.sessions.contains_key(&row.id) {
            return Err(PersistError::NotFound { what: "session", id: row.id });
        }
        tables.sessions.insert(row.id, row.clone());
        Ok(())
    }

    fn load_session(&self, session_id: i64) -> Result<Option<SessionRow>> {
        Ok(self.tables.lock().unwrap().sessions.get(&session_id).cloned())
    }

    fn delete_session(&self, session_id: i64) -> Result<()> {
        let mut tables = self.tables.lock().unwrap();
        tables.sessions.remove(&session_id);
        tables.destinations.retain(|_, d| d.session_id != session_id);
        Ok(())
    }

    fn save_destination(&self, mut row: DestinationRow) -> Result<i64> {
        let mut tables = self.tables.lock().unwrap();
        row.id = tables.next_id();
        let id = row.id;
        tables.destinations.insert(id, row);
        Ok(id)
    }

    fn update_destination(&self, row: &DestinationRow) -> Result<()> {
        let mut tables = self.tables.lock().unwrap();
        if !tables.destinations.contains_key(&row.id) {
            return Err(PersistError::NotFound { what: "destination", id: row.id });
        }
        tables.destinations.insert(row.id, row.clone());
        Ok(())
    }

    fn load_destinations(&self, session_id: i64) -> Result<Vec<DestinationRow>> {
        let tables = self.tables.lock().unwrap();
        let mut rows: Vec<DestinationRow> = tables
            .destinations
            .values()
            .filter(|d| d.session_id == session_id)
            .cloned()
            .collect();
        rows.sort_by_key(|d| d.id);
        Ok(rows)
    }

    fn allocate_instance_numbers(&self, spool: &str, count: u32) -> Result<u32> {
        let mut tables = self.tables.lock().unwrap();
        let counter = tables.instance_counters.entry(spool.to_string()).or_insert(1);
        let first = *counter;
        *counter += count;
        Ok(first)
    }

    fn reset_instance_numbers(&self, spool: &str, first: u32) -> Result<()> {
        let mut tables = self.tables.lock().unwrap();
        tables.instance_counters.insert(spool.to_string(), first);
        Ok(())
    }

    fn save_lto_session(&self, mut row: LtoSessionRow) -> Result<i64> {
        let mut tables = self.tables.lock().unwrap();
        row.id = tables.next_id();
        let id = row.id;
        tables.lto_sessions.insert(id, row);
        Ok(id)
    }

    fn update_lto_session(&self, row: &LtoSessionRow) -> Result<()> {
        let mut tables = self.tables.lock().unwrap();
        if !tables.lto_sessions.contains_key(&row.id) {
            return Err(PersistError::NotFound { what: "lto session", id: row.id });
        }
        tables.lto_sessions.insert(row.id, row.clone());
        Ok(())
    }

    fn load_lto_sessions(
        &self,
        recorder: &str,
        status: SessionStatus,
    ) -> Result<Vec<LtoSessionRow>> {
        let tables = self.tables.lock().unwrap();
        let mut rows: Vec<LtoSessionRow> = tables
            .lto_sessions
            .values()
            .filter(|s| s.recorder == recorder && s.status == status)
            .cloned()
            .collect();
        rows.sort_by_key(|s| s.id);
        Ok(rows)
    }

    fn save_lto_file(&self, mut row: LtoFileRow) -> Result<i64> {
        let mut tables = self.tables.lock().unwrap();
        row.id = tables.next_id();
        let id = row.id;
        tables.lto_files.insert(id, row);
        Ok(id)
    }

    fn update_lto_file_status(&self, file_id: i64, status: TransferStatus) -> Result<()> {
        let mut tables = self.tables.lock().unwrap();
        let file = tables
            .lto_files
            .get_mut(&file_id)
            .ok_or(PersistError::NotFound { what: "lto file", id: file_id })?;
        file.status = status;
        Ok(())
    }

    fn load_lto_files(&self, lto_session_id: i64) -> Result<Vec<LtoFileRow>> {
        let tables = self.tables.lock().unwrap();
        let mut rows: Vec<LtoFileRow> = tables
            .lto_files
            .values()
            .filter(|f| f.lto_session_id == lto_session_id)
            .cloned()
            .collect();
        rows.sort_by_key(|f| f.position);
        Ok(rows)
    }

    fn save_catalogue_export(&self, mut row: CatalogueExportRow) -> Result<i64> {
        let mut tables = self.tables.lock().unwrap();
        row.id = tables.next_id();
        let id = row.id;
        tables.catalogue_exports.push(row);
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rvault_types::{HardDiskDestination, IngestFormat, SourceItem};

    fn store_with_session() -> (MemoryStore, i64) {
        let store = MemoryStore::new();
        let session_id = store
            .save_session(SessionRow {
                id: 0,
                recorder: "ingest1".into(),
                created_at: 1_700_000_000,
                comments: String::new(),
                status: SessionStatus::InProgress,
                abort_initiator: None,
                total_vtr_errors: 0,
                total_dropouts: 0,
            })
            .unwrap();
        (store, session_id)
    }

    fn hard_disk_row(session_id: i64, filename: &str) -> DestinationRow {
        DestinationRow {
            id: 0,
            session_id,
            destination: Destination::HardDisk(HardDiskDestination::new(
                filename,
                IngestFormat::Uncompressed,
                SourceItem::new("LTA000001", 1),
            )),
            cache_id: None,
        }
    }

    #[test]
    fn test_cache_row_create_and_load() {
        let store = MemoryStore::new();
        assert!(store.load_cache_row("ingest1", "/cache").unwrap().is_none());

        let row = store.create_cache_row("ingest1", "/cache").unwrap();
        assert!(row.id > 0);

        let loaded = store.load_cache_row("ingest1", "/cache").unwrap().unwrap();
        assert_eq!(loaded, row);
        assert!(store.load_cache_row("ingest2", "/cache").unwrap().is_none());
    }

    #[test]
    fn test_link_and_find_cache_item() {
        let (store, session_id) = store_with_session();
        let cache = store.create_cache_row("ingest1", "/cache").unwrap();
        let dest_id = store.save_destination(hard_disk_row(session_id, "a.mxf")).unwrap();

        assert!(store.find_cache_item(cache.id, "a.mxf").unwrap().is_none());
        store.link_cache_item(dest_id, cache.id).unwrap();

        let item = store.find_cache_item(cache.id, "a.mxf").unwrap().unwrap();
        assert_eq!(item.dest_id, dest_id);
        assert_eq!(item.session_created_at, 1_700_000_000);

        store.unlink_cache_item(dest_id).unwrap();
        assert!(store.find_cache_item(cache.id, "a.mxf").unwrap().is_none());
        assert!(store.load_cache_items(cache.id).unwrap().is_empty());
    }

    #[test]
    fn test_unlink_missing_is_noop() {
        let store = MemoryStore::new();
        store.unlink_cache_item(999).unwrap();
    }

    #[test]
    fn test_delete_session_cascades() {
        let (store, session_id) = store_with_session();
        store.save_destination(hard_disk_row(session_id, "a.mxf")).unwrap();
        store.save_destination(hard_disk_row(session_id, "b.mxf")).unwrap();

        store.delete_session(session_id).unwrap();
        assert!(store.load_session(session_id).unwrap().is_none());
        assert!(store.load_destinations(session_id).unwrap().is_empty());
    }

    #[test]
    fn test_instance_numbers() {
        let store = MemoryStore::new();
        assert_eq!(store.allocate_instance_numbers("LTA000001", 3).unwrap(), 1);
        assert_eq!(store.allocate_instance_numbers("LTA000001", 2).unwrap(), 4);
        assert_eq!(store.allocate_instance_numbers("LTA000002", 1).unwrap(), 1);

        store.reset_instance_numbers("LTA000001", 4).unwrap();
        assert_eq!(store.allocate_instance_numbers("LTA000001", 1).unwrap(), 4);
    }

    #[test]
    fn test_lto_file_status_update() {
        let store = MemoryStore::new();
        let lto_id = store
            .save_lto_session(LtoSessionRow {
                id: 0,
                recorder: "ingest1".into(),
                barcode: "LTO0042".into(),
                created_at: 1_700_000_100,
                status: SessionStatus::InProgress,
                abort_initiator: None,
                comments: String::new(),
            })
            .unwrap();
        let file_id = store
            .save_lto_file(LtoFileRow {
                id: 0,
                lto_session_id: lto_id,
                position: 1,
                filename: "LTO004201.mxf".into(),
                source_filename: "a.mxf".into(),
                size: 100,
                duration: 250,
                status: TransferStatus::NotStarted,
                catalogue: rvault_types::CatalogueData {
                    source: SourceItem::new("LTA000001", 1),
                    lto_spool: "LTO0042".into(),
                    lto_item: 1,
                    transfer_date: 0,
                    duration: 250,
                },
            })
            .unwrap();

        store.update_lto_file_status(file_id, TransferStatus::Completed).unwrap();
        let files = store.load_lto_files(lto_id).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].status, TransferStatus::Completed);
    }
}
