//! Status Store
//!
//! One small JSON document per brick, shared between the monitor, the
//! brick's worker and external status readers. Every mutation is a
//! read-modify-write under an exclusive advisory lock, written to a
//! temporary file, renamed over the old one and followed by a directory
//! fsync, so readers only ever see a complete document.

use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::errno::Errno;
use nix::fcntl::{flock, FlockArg};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Placeholder for fields that have no value yet
pub const DEFAULT_STATUS: &str = "N/A";

/// Attempts at taking the lock before reporting contention
const LOCK_ATTEMPTS: u32 = 100;
const LOCK_PAUSE: Duration = Duration::from_millis(20);

/// Supervision state of one brick, in ascending severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum WorkerState {
    /// Worker survived its handshake window
    #[serde(rename = "Active")]
    Stable,
    #[serde(rename = "Initializing...")]
    Initializing,
    Faulty,
    #[serde(rename = "inconsistent")]
    Inconsistent,
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerState::Stable => write!(f, "Active"),
            WorkerState::Initializing => write!(f, "Initializing..."),
            WorkerState::Faulty => write!(f, "Faulty"),
            WorkerState::Inconsistent => write!(f, "inconsistent"),
        }
    }
}

/// Crawl phase a worker is in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrawlPhase {
    Hybrid,
    History,
    Changelog,
}

impl std::fmt::Display for CrawlPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CrawlPhase::Hybrid => write!(f, "Hybrid Crawl"),
            CrawlPhase::History => write!(f, "History Crawl"),
            CrawlPhase::Changelog => write!(f, "Changelog Crawl"),
        }
    }
}

/// Session-level state kept in the monitor status file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MonitorState {
    Created,
    Started,
    Paused,
    Stopped,
}

impl MonitorState {
    /// Per-brick status is meaningless while the session is not running
    pub fn masks_workers(&self) -> bool {
        matches!(self, MonitorState::Created | MonitorState::Paused | MonitorState::Stopped)
    }
}

impl std::fmt::Display for MonitorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MonitorState::Created => write!(f, "Created"),
            MonitorState::Started => write!(f, "Started"),
            MonitorState::Paused => write!(f, "Paused"),
            MonitorState::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Counters kept in the brick status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    Entry,
    Data,
    Meta,
    Failures,
}

/// Contents of one brick status file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrickStatus {
    pub worker_status: String,
    pub crawl_status: String,
    pub slave_node: String,
    pub last_synced: i64,
    pub last_synced_entry: i64,
    pub entry: u64,
    pub data: u64,
    pub meta: u64,
    pub failures: u64,
    pub checkpoint_time: i64,
    pub checkpoint_completed: String,
    pub checkpoint_completion_time: i64,
}

impl Default for BrickStatus {
    fn default() -> Self {
        Self {
            worker_status: DEFAULT_STATUS.to_string(),
            crawl_status: DEFAULT_STATUS.to_string(),
            slave_node: DEFAULT_STATUS.to_string(),
            last_synced: 0,
            last_synced_entry: 0,
            entry: 0,
            data: 0,
            meta: 0,
            failures: 0,
            checkpoint_time: 0,
            checkpoint_completed: DEFAULT_STATUS.to_string(),
            checkpoint_completion_time: 0,
        }
    }
}

impl BrickStatus {
    fn counter_mut(&mut self, counter: Counter) -> &mut u64 {
        match counter {
            Counter::Entry => &mut self.entry,
            Counter::Data => &mut self.data,
            Counter::Meta => &mut self.meta,
            Counter::Failures => &mut self.failures,
        }
    }

    /// Read a counter
    pub fn counter(&self, counter: Counter) -> u64 {
        match counter {
            Counter::Entry => self.entry,
            Counter::Data => self.data,
            Counter::Meta => self.meta,
            Counter::Failures => self.failures,
        }
    }
}

/// Contents of the monitor status file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorStatus {
    pub status: MonitorState,
    /// Highest-severity brick state, if any brick has reported
    #[serde(default)]
    pub aggregate: Option<WorkerState>,
}

/// Replace `path` with `bytes` through a temporary file and rename
pub fn replace_file(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(d) if !d.as_os_str().is_empty() => d.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&dir)?;

    let name = path
        .file_name()
        .ok_or_else(|| Error::Status(format!("{} is not a file path", path.display())))?;
    let tmp = dir.join(format!(".{}.tmp.{}", name.to_string_lossy(), std::process::id()));

    {
        use std::io::Write;
        let mut f = File::create(&tmp)?;
        f.write_all(bytes)?;
        f.sync_all()?;
    }
    if let Err(e) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e.into());
    }
    File::open(&dir)?.sync_all()?;
    Ok(())
}

/// Status file name for a brick: `/bricks/b1` becomes `brick_bricks-b1.status`
pub fn brick_status_name(brick: &Path) -> String {
    let flat = brick.to_string_lossy().replace('/', "-");
    format!("brick_{}.status", flat.trim_matches('-'))
}

/// Exclusive advisory lock held for one read-modify-write
struct LockGuard {
    _file: File,
}

fn lock_exclusive(lock_path: &Path) -> Result<LockGuard> {
    if let Some(parent) = lock_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(lock_path)?;

    for _ in 0..LOCK_ATTEMPTS {
        match flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
            Ok(()) => return Ok(LockGuard { _file: file }),
            Err(Errno::EAGAIN) | Err(Errno::EINTR) => std::thread::sleep(LOCK_PAUSE),
            Err(e) => return Err(e.into()),
        }
    }
    Err(Error::LockContention)
}

fn read_json<T: for<'de> Deserialize<'de> + Default>(path: &Path) -> Result<T> {
    match std::fs::read(path) {
        Ok(bytes) if bytes.is_empty() => Ok(T::default()),
        Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
        Err(e) => Err(e.into()),
    }
}

fn lock_path_for(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".lock");
    path.with_file_name(name)
}

/// Locked access to one brick status file
#[derive(Debug, Clone)]
pub struct StatusStore {
    path: PathBuf,
    lock_path: PathBuf,
}

impl StatusStore {
    /// Store for `brick` under `state_dir`
    pub fn new(state_dir: &Path, brick: &Path) -> Self {
        Self::at(state_dir.join(brick_status_name(brick)))
    }

    /// Store backed by an explicit file
    pub fn at(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let lock_path = lock_path_for(&path);
        Self { path, lock_path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current contents; a missing file reads as defaults
    pub fn load(&self) -> Result<BrickStatus> {
        read_json(&self.path)
    }

    /// Apply `f` under the lock; the file is only rewritten if something changed
    pub fn update<T>(&self, f: impl FnOnce(&mut BrickStatus) -> T) -> Result<T> {
        let _guard = lock_exclusive(&self.lock_path)?;
        let before: BrickStatus = read_json(&self.path)?;
        let mut after = before.clone();
        let out = f(&mut after);
        if after != before || !self.path.exists() {
            replace_file(&self.path, &serde_json::to_vec(&after)?)?;
        }
        Ok(out)
    }

    pub fn set_worker_status(&self, state: WorkerState) -> Result<()> {
        self.update(|s| s.worker_status = state.to_string())
    }

    pub fn set_crawl_status(&self, phase: CrawlPhase) -> Result<()> {
        self.update(|s| s.crawl_status = phase.to_string())
    }

    pub fn set_slave_node(&self, node: &str) -> Result<()> {
        self.update(|s| s.slave_node = node.to_string())
    }

    pub fn set_last_synced_entry(&self, ts: i64) -> Result<()> {
        self.update(|s| s.last_synced_entry = s.last_synced_entry.max(ts))
    }

    pub fn inc_value(&self, counter: Counter, by: u64) -> Result<()> {
        self.update(|s| {
            let c = s.counter_mut(counter);
            *c = c.saturating_add(by);
        })
    }

    /// Lower a counter, never below zero
    pub fn dec_value(&self, counter: Counter, by: u64) -> Result<()> {
        self.update(|s| {
            let c = s.counter_mut(counter);
            *c = c.saturating_sub(by);
        })
    }

    /// Record sync progress and evaluate the checkpoint.
    ///
    /// Returns true only on the call that completes `checkpoint`. A
    /// checkpoint different from the stored target resets the completion
    /// fields first; 0 clears the target.
    pub fn set_last_synced(&self, value: i64, checkpoint: i64) -> Result<bool> {
        self.update(|s| {
            s.last_synced = s.last_synced.max(value);

            if checkpoint != s.checkpoint_time {
                s.checkpoint_time = checkpoint;
                s.checkpoint_completion_time = 0;
                s.checkpoint_completed = "No".to_string();
            }

            if checkpoint > 0 && checkpoint <= s.last_synced && s.checkpoint_completed == "No" {
                s.checkpoint_completion_time = chrono::Utc::now().timestamp();
                s.checkpoint_completed = "Yes".to_string();
                return true;
            }
            false
        })
    }

    /// Clear per-run fields when a worker starts; progress and checkpoint survive
    pub fn reset_on_worker_start(&self) -> Result<()> {
        self.update(|s| {
            s.slave_node = DEFAULT_STATUS.to_string();
            s.crawl_status = DEFAULT_STATUS.to_string();
            s.entry = 0;
            s.data = 0;
            s.meta = 0;
        })
    }

    /// Status as shown to operators; a stopped session masks stale worker data
    pub fn get_status(&self, monitor: &MonitorStore) -> Result<BrickStatus> {
        let status = self.load()?;
        match monitor.load()? {
            Some(m) if m.status.masks_workers() => Ok(BrickStatus {
                worker_status: m.status.to_string(),
                ..BrickStatus::default()
            }),
            _ => Ok(status),
        }
    }
}

/// Locked access to the session's monitor status file
#[derive(Debug, Clone)]
pub struct MonitorStore {
    path: PathBuf,
    lock_path: PathBuf,
}

impl MonitorStore {
    pub fn new(state_dir: &Path) -> Self {
        let path = state_dir.join("monitor.status");
        let lock_path = lock_path_for(&path);
        Self { path, lock_path }
    }

    /// Current contents, `None` if no monitor ever ran
    pub fn load(&self) -> Result<Option<MonitorStatus>> {
        match std::fs::read(&self.path) {
            Ok(bytes) if bytes.is_empty() => Ok(None),
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn update(&self, f: impl FnOnce(&mut MonitorStatus)) -> Result<()> {
        let _guard = lock_exclusive(&self.lock_path)?;
        let before = self.load()?;
        let mut after = before.clone().unwrap_or(MonitorStatus {
            status: MonitorState::Created,
            aggregate: None,
        });
        f(&mut after);
        if before.as_ref() != Some(&after) {
            replace_file(&self.path, &serde_json::to_vec(&after)?)?;
        }
        Ok(())
    }

    pub fn set_status(&self, status: MonitorState) -> Result<()> {
        self.update(|m| m.status = status)
    }

    pub fn set_aggregate(&self, state: WorkerState) -> Result<()> {
        self.update(|m| m.aggregate = Some(state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_missing_file_reads_defaults() {
        let dir = tempdir().unwrap();
        let store = StatusStore::new(dir.path(), Path::new("/bricks/b1"));
        let status = store.load().unwrap();
        assert_eq!(status.worker_status, DEFAULT_STATUS);
        assert_eq!(status.last_synced, 0);
        assert!(store.path().ends_with("brick_bricks-b1.status"));
    }

    #[test]
    fn test_counters_clamp_at_zero() {
        let dir = tempdir().unwrap();
        let store = StatusStore::new(dir.path(), Path::new("/b"));
        store.inc_value(Counter::Entry, 3).unwrap();
        store.dec_value(Counter::Entry, 1).unwrap();
        assert_eq!(store.load().unwrap().entry, 2);
        store.dec_value(Counter::Entry, 10).unwrap();
        assert_eq!(store.load().unwrap().entry, 0);
        store.dec_value(Counter::Failures, 1).unwrap();
        assert_eq!(store.load().unwrap().failures, 0);
    }

    #[test]
    fn test_unchanged_value_skips_write() {
        let dir = tempdir().unwrap();
        let store = StatusStore::new(dir.path(), Path::new("/b"));
        store.set_worker_status(WorkerState::Faulty).unwrap();
        let before = std::fs::metadata(store.path()).unwrap().modified().unwrap();
        std::thread::sleep(Duration::from_millis(20));
        store.set_worker_status(WorkerState::Faulty).unwrap();
        let after = std::fs::metadata(store.path()).unwrap().modified().unwrap();
        assert_eq!(before, after);
        assert_eq!(store.load().unwrap().worker_status, "Faulty");
    }

    #[test]
    fn test_last_synced_is_monotonic() {
        let dir = tempdir().unwrap();
        let store = StatusStore::new(dir.path(), Path::new("/b"));
        let mut prev = 0;
        for v in [10, 20, 20, 35, 50] {
            store.set_last_synced(v, 0).unwrap();
            let now = store.load().unwrap().last_synced;
            assert!(now >= prev);
            prev = now;
        }
        store.set_last_synced(5, 0).unwrap();
        assert_eq!(store.load().unwrap().last_synced, 50);
    }

    #[test]
    fn test_checkpoint_completes_once() {
        let dir = tempdir().unwrap();
        let store = StatusStore::new(dir.path(), Path::new("/b"));

        assert!(!store.set_last_synced(90, 100).unwrap());
        let s = store.load().unwrap();
        assert_eq!(s.checkpoint_completed, "No");
        assert_eq!(s.checkpoint_time, 100);

        assert!(store.set_last_synced(100, 100).unwrap());
        let s = store.load().unwrap();
        assert_eq!(s.checkpoint_completed, "Yes");
        assert_eq!(s.checkpoint_time, 100);
        assert!(s.checkpoint_completion_time > 0);

        // stays complete and does not fire again
        assert!(!store.set_last_synced(150, 100).unwrap());
        assert_eq!(store.load().unwrap().checkpoint_completed, "Yes");

        // a new target starts over
        assert!(!store.set_last_synced(160, 200).unwrap());
        assert_eq!(store.load().unwrap().checkpoint_completed, "No");
        assert!(store.set_last_synced(200, 200).unwrap());

        // unset
        store.set_last_synced(210, 0).unwrap();
        let s = store.load().unwrap();
        assert_eq!(s.checkpoint_completed, "No");
        assert_eq!(s.checkpoint_time, 0);
    }

    #[test]
    fn test_reset_on_worker_start_keeps_progress() {
        let dir = tempdir().unwrap();
        let store = StatusStore::new(dir.path(), Path::new("/b"));
        store.set_last_synced(100, 100).unwrap();
        store.inc_value(Counter::Data, 4).unwrap();
        store.inc_value(Counter::Failures, 2).unwrap();
        store.set_crawl_status(CrawlPhase::Changelog).unwrap();

        store.reset_on_worker_start().unwrap();
        let s = store.load().unwrap();
        assert_eq!(s.data, 0);
        assert_eq!(s.crawl_status, DEFAULT_STATUS);
        assert_eq!(s.last_synced, 100);
        assert_eq!(s.checkpoint_completed, "Yes");
        assert_eq!(s.failures, 2);
    }

    #[test]
    fn test_stopped_monitor_masks_brick_status() {
        let dir = tempdir().unwrap();
        let monitor = MonitorStore::new(dir.path());
        let store = StatusStore::new(dir.path(), Path::new("/b"));
        store.set_worker_status(WorkerState::Stable).unwrap();
        store.set_last_synced(42, 0).unwrap();

        // no monitor file yet
        assert_eq!(store.get_status(&monitor).unwrap().worker_status, "Active");

        monitor.set_status(MonitorState::Started).unwrap();
        assert_eq!(store.get_status(&monitor).unwrap().last_synced, 42);

        monitor.set_status(MonitorState::Stopped).unwrap();
        let shown = store.get_status(&monitor).unwrap();
        assert_eq!(shown.worker_status, "Stopped");
        assert_eq!(shown.last_synced, 0);
    }

    #[test]
    fn test_severity_order() {
        assert!(WorkerState::Stable < WorkerState::Initializing);
        assert!(WorkerState::Initializing < WorkerState::Faulty);
        assert!(WorkerState::Faulty < WorkerState::Inconsistent);
        let worst = [WorkerState::Faulty, WorkerState::Stable].into_iter().max();
        assert_eq!(worst, Some(WorkerState::Faulty));
    }

    #[test]
    fn test_concurrent_increments() {
        let dir = tempdir().unwrap();
        let store = StatusStore::new(dir.path(), Path::new("/b"));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for _ in 0..10 {
                        store.inc_value(Counter::Meta, 1).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(store.load().unwrap().meta, 40);
    }
}
