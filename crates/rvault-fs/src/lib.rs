//! # rvault-fs
//!
//! Filesystem collaborator for the reelvault pipeline:
//!
//! - [`FileStore`]: the small set of raw filesystem operations the cache
//!   performs, behind a trait so tests can interpose failures.
//! - [`DirWatcher`]: push feed of create/delete/move events for one
//!   directory, built on `notify`.
//! - [`TransferLock`]: the advisory lock file a tape transfer holds so other
//!   processes throttle their disk traffic. Throttling, not mutual exclusion.

pub mod watch;

pub use watch::{DirWatcher, WatchEvent};

use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum FsError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("watch error: {0}")]
    Watch(#[from] notify::Error),

    #[error("watch on {dir} not ready within {timeout_ms}ms")]
    WatchTimeout { dir: PathBuf, timeout_ms: u64 },

    #[error("system call failed: {0}")]
    Sys(#[from] nix::Error),
}

pub type Result<T> = std::result::Result<T, FsError>;

/// Raw filesystem operations used by the cache.
///
/// All paths are absolute; directory listings return bare file names.
pub trait FileStore: Send + Sync {
    /// Size in bytes if the path exists as a regular file.
    fn stat(&self, path: &Path) -> Result<Option<u64>>;

    fn rename(&self, from: &Path, to: &Path) -> Result<()>;

    fn unlink(&self, path: &Path) -> Result<()>;

    fn mkdir_all(&self, path: &Path) -> Result<()>;

    /// Bare names of the regular files directly inside `path`.
    fn list_dir(&self, path: &Path) -> Result<Vec<String>>;

    /// Create a zero-byte file, failing if the parent is missing.
    fn create_empty(&self, path: &Path) -> Result<()>;

    /// Free bytes on the filesystem holding `path`.
    fn disk_space(&self, path: &Path) -> Result<u64>;
}

/// [`FileStore`] over the real filesystem.
#[derive(Debug, Clone, Default)]
pub struct OsFileStore;

impl FileStore for OsFileStore {
    fn stat(&self, path: &Path) -> Result<Option<u64>> {
        match fs::metadata(path) {
            Ok(meta) if meta.is_file() => Ok(Some(meta.len())),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        fs::rename(from, to)?;
        Ok(())
    }

    fn unlink(&self, path: &Path) -> Result<()> {
        fs::remove_file(path)?;
        Ok(())
    }

    fn mkdir_all(&self, path: &Path) -> Result<()> {
        fs::create_dir_all(path)?;
        Ok(())
    }

    fn list_dir(&self, path: &Path) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(path)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    fn create_empty(&self, path: &Path) -> Result<()> {
        OpenOptions::new().write(true).create(true).truncate(true).open(path)?;
        Ok(())
    }

    fn disk_space(&self, path: &Path) -> Result<u64> {
        let stat = nix::sys::statvfs::statvfs(path)?;
        Ok(stat.blocks_available() as u64 * stat.fragment_size() as u64)
    }
}

/// Advisory lock file held while an LTO transfer is running.
///
/// Other processes probe [`TransferLock::is_held`] and slow down their own
/// disk traffic while the file exists. Both sides keep making progress; the
/// lock only signals, it never excludes.
#[derive(Debug)]
pub struct TransferLock {
    path: PathBuf,
}

impl TransferLock {
    /// Create the lock file, stamping it with this process id.
    pub fn acquire(path: &Path) -> Result<TransferLock> {
        fs::write(path, format!("{}\n", std::process::id()))?;
        debug!(component = "FS", path = %path.display(), "transfer lock acquired");
        Ok(TransferLock { path: path.to_path_buf() })
    }

    /// Is some process currently holding the lock file?
    pub fn is_held(path: &Path) -> bool {
        path.exists()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TransferLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::warn!(
                    component = "FS",
                    path = %self.path.display(),
                    error = %e,
                    "failed to remove transfer lock"
                );
            }
        }
    }
}

/// Page-file name for a multi-item capture: `base__<index>.mxfp`.
pub fn page_filename(base: &str, index: u32) -> String {
    format!("{}__{}.mxfp", base, index)
}

/// Final per-item filename: `base` + two-digit instance + suffix.
pub fn instance_filename(base: &str, instance: u32, suffix: &str) -> String {
    format!("{}{:02}{}", base, instance, suffix)
}
