//! File-backed IP deny list with hot reload.
//!
//! The list is a newline-delimited file: blank lines and `#`-prefixed lines
//! are comments, inline `# ...` tails are stripped. The file is polled every
//! five seconds; when its modification time changes the in-memory set is
//! atomically replaced. A missing file means an empty list, at startup and
//! at any later poll.
//!
//! Membership checks are O(1) and fail open: a broken deny list must never
//! block traffic.

use ahash::AHashSet;
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::{path::PathBuf, sync::Arc, time::SystemTime};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::client::ip;

/// Poll cadence for the deny-list file.
const POLL_INTERVAL: std::time::Duration = std::time::Duration::from_secs(5);

/// Hot-reloaded IP deny list.
pub struct IpBlacklist {
    entries: ArcSwap<AHashSet<String>>,
    path: Option<PathBuf>,
    last_mtime: Mutex<Option<SystemTime>>,
}

impl IpBlacklist {
    /// Creates the deny list and performs the initial load.
    ///
    /// A missing or unreadable file is not an error; the list starts empty.
    #[must_use]
    pub fn new(path: Option<PathBuf>) -> Self {
        let list = Self {
            entries: ArcSwap::from_pointee(AHashSet::new()),
            path,
            last_mtime: Mutex::new(None),
        };
        list.reload();
        list
    }

    /// O(1) membership check. Never fails; an internal problem reads as
    /// "not blacklisted".
    #[must_use]
    pub fn is_blacklisted(&self, ip: &str) -> bool {
        self.entries.load().contains(ip)
    }

    /// Number of entries currently loaded.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.load().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.load().is_empty()
    }

    /// Configured file path, for the admin snapshot.
    #[must_use]
    pub fn path(&self) -> Option<&PathBuf> {
        self.path.as_ref()
    }

    /// Spawns the 5-second poll loop.
    pub fn spawn_watcher(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) {
        if self.path.is_none() {
            debug!("no blacklist file configured; watcher not started");
            return;
        }
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(POLL_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.recv() => {
                        debug!("blacklist watcher shutting down");
                        break;
                    }
                    _ = interval.tick() => {
                        self.poll();
                    }
                }
            }
        });
    }

    /// One poll step: reload only when the file's mtime changed, or when the
    /// file disappeared while entries are loaded.
    fn poll(&self) {
        let Some(path) = &self.path else { return };
        match std::fs::metadata(path).and_then(|m| m.modified()) {
            Ok(mtime) => {
                let changed = {
                    let mut last = self.last_mtime.lock();
                    if last.map_or(true, |prev| prev != mtime) {
                        *last = Some(mtime);
                        true
                    } else {
                        false
                    }
                };
                if changed {
                    self.reload();
                }
            }
            Err(_) => {
                // File gone: drop to an empty set once.
                let had_entries = !self.entries.load().is_empty();
                let mut last = self.last_mtime.lock();
                if last.take().is_some() || had_entries {
                    drop(last);
                    self.entries.store(Arc::new(AHashSet::new()));
                    info!("blacklist file disappeared; deny list cleared");
                }
            }
        }
    }

    /// Reads and parses the file, swapping the set atomically and logging the
    /// diff. Read failures leave the current set untouched.
    fn reload(&self) {
        let Some(path) = &self.path else { return };

        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "blacklist file not present");
                return;
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "failed to read blacklist file");
                return;
            }
        };

        if let Ok(mtime) = std::fs::metadata(path).and_then(|m| m.modified()) {
            *self.last_mtime.lock() = Some(mtime);
        }

        let fresh = parse(&contents);
        let previous = self.entries.load_full();

        let added = fresh.difference(&previous).count();
        let removed = previous.difference(&fresh).count();
        for entry in fresh.difference(&previous) {
            debug!(ip = %entry, "blacklist entry added");
        }
        for entry in previous.difference(&fresh) {
            debug!(ip = %entry, "blacklist entry removed");
        }

        let total = fresh.len();
        self.entries.store(Arc::new(fresh));
        if added > 0 || removed > 0 {
            info!(total, added, removed, "blacklist reloaded");
        }
    }
}

/// Parses file contents into a normalized IP set.
fn parse(contents: &str) -> AHashSet<String> {
    let mut set = AHashSet::new();
    for line in contents.lines() {
        let entry = line.split('#').next().unwrap_or("").trim();
        if entry.is_empty() {
            continue;
        }
        match ip::normalize(entry) {
            Some(normalized) => {
                set.insert(normalized);
            }
            None => warn!(entry, "ignoring unparseable blacklist entry"),
        }
    }
    set
}
