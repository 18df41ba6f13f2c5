//! JSON-file-backed store.
//!
//! Wraps a [`MemoryStore`] and rewrites the whole table set to disk after
//! every mutation, via temp-file-plus-rename so a crash never leaves a
//! half-written store behind.

use std::path::{Path, PathBuf};

use rvault_types::{SessionStatus, TransferStatus};
use tracing::debug;

use crate::rows::{
    CacheItemRow, CacheRow, CatalogueExportRow, DestinationRow, LtoFileRow, LtoSessionRow,
    SessionRow,
};
use crate::{MemoryStore, PersistenceStore, Result};

pub struct JsonStore {
    mem: MemoryStore,
    path: PathBuf,
}

impl JsonStore {
    /// Open the store at `path`, creating an empty one if the file is absent.
    pub fn open(path: &Path) -> Result<JsonStore> {
        let mem = MemoryStore::new();
        match std::fs::read_to_string(path) {
            Ok(json) => mem.restore_json(&json)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(component = "PERSIST", path = %path.display(), "creating new store");
            }
            Err(e) => return Err(e.into()),
        }
        Ok(JsonStore { mem, path: path.to_path_buf() })
    }

    fn flush(&self) -> Result<()> {
        let json = self.mem.snapshot_json()?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn mutate<T>(&self, result: Result<T>) -> Result<T> {
        let value = result?;
        self.flush()?;
        Ok(value)
    }
}

impl PersistenceStore for JsonStore {
    fn load_cache_row(&self, recorder: &str, path: &str) -> Result<Option<CacheRow>> {
        self.mem.load_cache_row(recorder, path)
    }

    fn create_cache_row(&self, recorder: &str, path: &str) -> Result<CacheRow> {
        self.mutate(self.mem.create_cache_row(recorder, path))
    }

    fn load_cache_items(&self, cache_id: i64) -> Result<Vec<CacheItemRow>> {
        self.mem.load_cache_items(cache_id)
    }

    fn find_cache_item(&self, cache_id: i64, filename: &str) -> Result<Option<CacheItemRow>> {
        self.mem.find_cache_item(cache_id, filename)
    }

    fn link_cache_item(&self, dest_id: i64, cache_id: i64) -> Result<()> {
        self.mutate(self.mem.link_cache_item(dest_id, cache_id))
    }

    fn unlink_cache_item(&self, dest_id: i64) -> Result<()> {
        self.mutate(self.mem.unlink_cache_item(dest_id))
    }

    fn update_cache_item(&self, row: &CacheItemRow) -> Result<()> {
        self.mutate(self.mem.update_cache_item(row))
    }

    fn save_session(&self, row: SessionRow) -> Result<i64> {
        self.mutate(self.mem.save_session(row))
    }

    fn update_session(&self, row: &SessionRow) -> Result<()> {
        self.mutate(self.mem.update_session(row))
    }

    fn load_session(&self, session_id: i64) -> Result<Option<SessionRow>> {
        self.mem.load_session(session_id)
    }

    fn delete_session(&self, session_id: i64) -> Result<()> {
        self.mutate(self.mem.delete_session(session_id))
    }

    fn save_destination(&self, row: DestinationRow) -> Result<i64> {
        self.mutate(self.mem.save_destination(row))
    }

    fn update_destination(&self, row: &DestinationRow) -> Result<()> {
        self.mutate(self.mem.update_destination(row))
    }

    fn load_destinations(&self, session_id: i64) -> Result<Vec<DestinationRow>> {
        self.mem.load_destinations(session_id)
    }

    fn allocate_instance_numbers(&self, spool: &str, count: u32) -> Result<u32> {
        self.mutate(self.mem.allocate_instance_numbers(spool, count))
    }

    fn reset_instance_numbers(&self, spool: &str, first: u32) -> Result<()> {
        self.mutate(self.mem.reset_instance_numbers(spool, first))
    }

    fn save_lto_session(&self, row: LtoSessionRow) -> Result<i64> {
        self.mutate(self.mem.save_lto_session(row))
    }

    fn update_lto_session(&self, row: &LtoSessionRow) -> Result<()> {
        self.mutate(self.mem.update_lto_session(row))
    }

    fn load_lto_sessions(
        &self,
        recorder: &str,
        status: SessionStatus,
    ) -> Result<Vec<LtoSessionRow>> {
        self.mem.load_lto_sessions(recorder, status)
    }

    fn save_lto_file(&self, row: LtoFileRow) -> Result<i64> {
        self.mutate(self.mem.save_lto_file(row))
    }

    fn update_lto_file_status(&self, file_id: i64, status: TransferStatus) -> Result<()> {
        self.mutate(self.mem.update_lto_file_status(file_id, status))
    }

    fn load_lto_files(&self, lto_session_id: i64) -> Result<Vec<LtoFileRow>> {
        self.mem.load_lto_files(lto_session_id)
    }

    fn save_catalogue_export(&self, row: CatalogueExportRow) -> Result<i64> {
        self.mutate(self.mem.save_catalogue_export(row))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_open_missing_creates_empty() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("store.json");
        let store = JsonStore::open(&path).unwrap();
        assert!(store.load_cache_row("ingest1", "/cache").unwrap().is_none());
    }

    #[test]
    fn test_survives_reopen() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("store.json");

        {
            let store = JsonStore::open(&path).unwrap();
            store.create_cache_row("ingest1", "/cache").unwrap();
            store.allocate_instance_numbers("LTA000001", 2).unwrap();
        }

        let store = JsonStore::open(&path).unwrap();
        assert!(store.load_cache_row("ingest1", "/cache").unwrap().is_some());
        // Counter continues where it left off.
        assert_eq!(store.allocate_instance_numbers("LTA000001", 1).unwrap(), 3);
    }
}
