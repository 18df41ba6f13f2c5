//! Directory watch feed.
//!
//! Wraps a `notify` watcher on a single directory (non-recursive) and maps
//! the backend's event kinds onto the four membership changes the cache
//! cares about. Events are buffered in an unbounded channel from the moment
//! [`DirWatcher::watch`] returns, so nothing is lost between registration
//! and the first [`DirWatcher::next_event`] call.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError};
use notify::event::{Event, EventKind, ModifyKind, RenameMode};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tracing::warn;

use crate::{FsError, Result};

/// Marker files used by the readiness handshake.
const PROBE_PREFIX: &str = ".rvault-watch-probe";

/// A membership change observed in the watched directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Created(String),
    Removed(String),
    MovedIn(String),
    MovedOut(String),
    WatchedDirRemoved,
}

impl WatchEvent {
    fn name(&self) -> Option<&str> {
        match self {
            WatchEvent::Created(n)
            | WatchEvent::Removed(n)
            | WatchEvent::MovedIn(n)
            | WatchEvent::MovedOut(n) => Some(n),
            WatchEvent::WatchedDirRemoved => None,
        }
    }

    fn is_probe(&self) -> bool {
        self.name().is_some_and(|n| n.starts_with(PROBE_PREFIX))
    }
}

/// Push feed of create/delete/move events for one directory.
pub struct DirWatcher {
    dir: PathBuf,
    rx: Receiver<WatchEvent>,
    /// Events drained while waiting for the readiness probe.
    pending: Mutex<VecDeque<WatchEvent>>,
    _watcher: RecommendedWatcher,
}

impl DirWatcher {
    /// Start watching `dir`. Events queue up immediately.
    pub fn watch(dir: &Path) -> Result<DirWatcher> {
        let (tx, rx) = crossbeam_channel::unbounded();
        let watch_dir = dir.to_path_buf();

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            match res {
                Ok(event) => {
                    for mapped in map_event(&watch_dir, event) {
                        let _ = tx.send(mapped);
                    }
                }
                Err(e) => warn!(component = "WATCH", error = %e, "watch backend error"),
            }
        })?;
        watcher.watch(dir, RecursiveMode::NonRecursive)?;

        Ok(DirWatcher {
            dir: dir.to_path_buf(),
            rx,
            pending: Mutex::new(VecDeque::new()),
            _watcher: watcher,
        })
    }

    /// Prove the feed is live: drop a marker file into the directory and
    /// wait until its event comes back through the feed. Non-probe events
    /// seen meanwhile are kept for later delivery.
    pub fn ready(&self, timeout: Duration) -> Result<()> {
        let probe_name = format!("{}-{}", PROBE_PREFIX, std::process::id());
        let probe_path = self.dir.join(&probe_name);
        std::fs::write(&probe_path, b"")?;
        let _ = std::fs::remove_file(&probe_path);

        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(FsError::WatchTimeout {
                    dir: self.dir.clone(),
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
            match self.rx.recv_timeout(remaining) {
                Ok(event) if event.is_probe() => return Ok(()),
                Ok(event) => self.pending.lock().unwrap().push_back(event),
                Err(RecvTimeoutError::Timeout) => {
                    return Err(FsError::WatchTimeout {
                        dir: self.dir.clone(),
                        timeout_ms: timeout.as_millis() as u64,
                    })
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(FsError::WatchTimeout {
                        dir: self.dir.clone(),
                        timeout_ms: timeout.as_millis() as u64,
                    })
                }
            }
        }
    }

    /// Next event, waiting up to `timeout`. Probe markers are filtered out.
    pub fn next_event(&self, timeout: Duration) -> Option<WatchEvent> {
        loop {
            if let Some(event) = self.pending.lock().unwrap().pop_front() {
                if event.is_probe() {
                    continue;
                }
                return Some(event);
            }
            match self.rx.recv_timeout(timeout) {
                Ok(event) if event.is_probe() => continue,
                Ok(event) => return Some(event),
                Err(_) => return None,
            }
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

/// Reduce a backend event to the cache-relevant membership changes.
fn map_event(watch_dir: &Path, event: Event) -> Vec<WatchEvent> {
    let mut out = Vec::new();
    let name_in_dir = |path: &Path| -> Option<String> {
        if path.parent() == Some(watch_dir) {
            path.file_name().and_then(|n| n.to_str()).map(String::from)
        } else {
            None
        }
    };

    match event.kind {
        EventKind::Create(_) => {
            for path in &event.paths {
                if let Some(name) = name_in_dir(path) {
                    out.push(WatchEvent::Created(name));
                }
            }
        }
        EventKind::Remove(_) => {
            for path in &event.paths {
                if path == watch_dir {
                    out.push(WatchEvent::WatchedDirRemoved);
                } else if let Some(name) = name_in_dir(path) {
                    out.push(WatchEvent::Removed(name));
                }
            }
        }
        EventKind::Modify(ModifyKind::Name(mode)) => match mode {
            RenameMode::From => {
                for path in &event.paths {
                    if let Some(name) = name_in_dir(path) {
                        out.push(WatchEvent::MovedOut(name));
                    }
                }
            }
            RenameMode::To => {
                for path in &event.paths {
                    if let Some(name) = name_in_dir(path) {
                        out.push(WatchEvent::MovedIn(name));
                    }
                }
            }
            RenameMode::Both => {
                if let Some(name) = event.paths.first().and_then(|p| name_in_dir(p)) {
                    out.push(WatchEvent::MovedOut(name));
                }
                if let Some(name) = event.paths.get(1).and_then(|p| name_in_dir(p)) {
                    out.push(WatchEvent::MovedIn(name));
                }
            }
            // Some backends only say "a name changed"; resolve by existence.
            RenameMode::Any | RenameMode::Other => {
                for path in &event.paths {
                    if let Some(name) = name_in_dir(path) {
                        if path.exists() {
                            out.push(WatchEvent::MovedIn(name));
                        } else {
                            out.push(WatchEvent::MovedOut(name));
                        }
                    }
                }
            }
        },
        _ => {}
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const WAIT: Duration = Duration::from_secs(5);

    fn wait_for(watcher: &DirWatcher, want: &WatchEvent) -> bool {
        let deadline = Instant::now() + WAIT;
        while Instant::now() < deadline {
            if let Some(event) = watcher.next_event(Duration::from_millis(200)) {
                if &event == want {
                    return true;
                }
            }
        }
        false
    }

    #[test]
    fn test_ready_handshake() {
        let temp = TempDir::new().unwrap();
        let watcher = DirWatcher::watch(temp.path()).unwrap();
        watcher.ready(WAIT).unwrap();
    }

    #[test]
    fn test_create_event() {
        let temp = TempDir::new().unwrap();
        let watcher = DirWatcher::watch(temp.path()).unwrap();
        watcher.ready(WAIT).unwrap();

        std::fs::write(temp.path().join("new.mxf"), b"x").unwrap();
        assert!(wait_for(&watcher, &WatchEvent::Created("new.mxf".into())));
    }

    #[test]
    fn test_remove_event() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("gone.mxf");
        std::fs::write(&path, b"x").unwrap();

        let watcher = DirWatcher::watch(temp.path()).unwrap();
        watcher.ready(WAIT).unwrap();

        std::fs::remove_file(&path).unwrap();
        assert!(wait_for(&watcher, &WatchEvent::Removed("gone.mxf".into())));
    }

    #[test]
    fn test_move_in_event() {
        let outside = TempDir::new().unwrap();
        let temp = TempDir::new().unwrap();
        let src = outside.path().join("incoming.mxf");
        std::fs::write(&src, b"x").unwrap();

        let watcher = DirWatcher::watch(temp.path()).unwrap();
        watcher.ready(WAIT).unwrap();

        std::fs::rename(&src, temp.path().join("incoming.mxf")).unwrap();
        assert!(wait_for(&watcher, &WatchEvent::MovedIn("incoming.mxf".into())));
    }

    #[test]
    fn test_events_buffered_before_first_read() {
        let temp = TempDir::new().unwrap();
        let watcher = DirWatcher::watch(temp.path()).unwrap();
        watcher.ready(WAIT).unwrap();

        // Nothing reads the feed while the file appears.
        std::fs::write(temp.path().join("early.mxf"), b"x").unwrap();
        std::thread::sleep(Duration::from_millis(300));

        assert!(wait_for(&watcher, &WatchEvent::Created("early.mxf".into())));
    }
}
