//! Brick Worker
//!
//! One worker per local brick. It connects the secondary, starts its
//! changelog agent, signals readiness to the monitor by closing the
//! feedback descriptor, then loops over crawl, translate, entry
//! operations, data transfer and durable progress.
//!
//! Worker-fatal errors are returned to the caller and end the process;
//! restarting is the monitor's job.

pub mod agent;
pub mod progress;

pub use agent::{agent_dispatcher, serve_agent_stdio, AgentClient, AGENT_VERSION};
pub use progress::ProgressStore;

use std::collections::HashSet;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use nix::fcntl::{fcntl, FcntlArg, FdFlag};

use crate::changelog::{brick_workdir, changelog_ts, Brick, ChangeRecord, ChangelogQuery, RecordType, Translator};
use crate::config::{ConfigHandle, GeorepConfig};
use crate::db::ChangeDb;
use crate::error::{Error, ErrorClass, Result};
use crate::events::{Event, EventKind, EventPublisher};
use crate::resource::{engine_for, EntryOp, MetaOp, PendingLink, Resource, SecondaryLink, TransferEngine};
use crate::status::{Counter, CrawlPhase, StatusStore, WorkerState};

/// Entries applied per call during a hybrid crawl
const HYBRID_CHUNK: usize = 1024;

/// Changelog history parse workers requested from the agent
const HISTORY_WORKERS: usize = 1;

/// What the monitor hands a worker process
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Brick root on this node
    pub brick: PathBuf,
    /// Secondary URL
    pub secondary: String,
    /// Write end of the monitor's readiness pipe
    pub feedback_fd: Option<RawFd>,
}

/// Entry, data and metadata work derived from a batch of records
#[derive(Debug, Default)]
struct BatchPlan {
    entries: Vec<EntryOp>,
    data: Vec<String>,
    meta: Vec<MetaOp>,
}

/// Entry operation recreating what `rel` is on the brick, if it still exists
fn entry_for(root: &Path, rel: &str, meta: &std::fs::Metadata) -> Option<EntryOp> {
    let mode = meta.mode() & 0o7777;
    let (uid, gid) = (meta.uid(), meta.gid());
    let ft = meta.file_type();
    if ft.is_dir() {
        Some(EntryOp::Mkdir {
            path: rel.to_string(),
            mode,
            uid,
            gid,
        })
    } else if ft.is_symlink() {
        match std::fs::read_link(root.join(rel)) {
            Ok(target) => Some(EntryOp::Symlink {
                path: rel.to_string(),
                target: target.display().to_string(),
            }),
            Err(e) => {
                tracing::debug!("symlink {} vanished: {}", rel, e);
                None
            }
        }
    } else if ft.is_file() {
        Some(EntryOp::Create {
            path: rel.to_string(),
            mode,
            uid,
            gid,
        })
    } else if ft.is_fifo() || ft.is_socket() || ft.is_char_device() || ft.is_block_device() {
        tracing::debug!("skipping special file {}", rel);
        None
    } else {
        None
    }
}

/// Per-brick sync loop
pub struct Worker {
    config: Arc<GeorepConfig>,
    handle: Option<ConfigHandle>,
    config_mtime: Option<SystemTime>,
    brick: Brick,
    link: SecondaryLink,
    query: Box<dyn ChangelogQuery>,
    engine: Box<dyn TransferEngine>,
    status: StatusStore,
    progress: ProgressStore,
    workdir: PathBuf,
    events: EventPublisher,
    register_time: i64,
}

impl Worker {
    /// Register the brick with `query` and prepare status and progress
    pub fn new(
        config: Arc<GeorepConfig>,
        brick: &Path,
        link: SecondaryLink,
        mut query: Box<dyn ChangelogQuery>,
        events: EventPublisher,
    ) -> Result<Self> {
        let workdir = brick_workdir(&config.session.working_dir, brick);
        std::fs::create_dir_all(&workdir)?;
        query.register(brick, &workdir)?;
        let register_time = chrono::Utc::now().timestamp();

        let status = StatusStore::new(&config.session.state_dir, brick);
        status.reset_on_worker_start()?;
        status.set_slave_node(link.resource().remote_host().unwrap_or("localhost"))?;

        let progress = ProgressStore::open(&workdir, &link.resource().uuid().to_string())?;
        let engine = engine_for(&config.transfer, link.target())?;
        tracing::info!(
            "worker for {} ready: secondary {}, engine {}",
            brick.display(),
            link.resource(),
            engine.name()
        );

        Ok(Self {
            config,
            handle: None,
            config_mtime: None,
            brick: Brick::new(brick),
            link,
            query,
            engine,
            status,
            progress,
            workdir,
            events,
            register_time,
        })
    }

    /// Re-read the configuration file from `handle` when it changes
    pub fn follow_config(&mut self, handle: ConfigHandle) {
        self.config_mtime = handle.path().and_then(|p| mtime(p));
        self.handle = Some(handle);
    }

    pub fn status(&self) -> &StatusStore {
        &self.status
    }

    pub fn progress(&self) -> &ProgressStore {
        &self.progress
    }

    /// Crawl forever
    pub fn run(&mut self) -> Result<()> {
        self.startup_crawl()?;
        self.status.set_crawl_status(CrawlPhase::Changelog)?;
        loop {
            self.link.ensure_alive()?;
            self.changelog_round()?;
            std::thread::sleep(self.config.change_interval());
        }
    }

    /// Catch up to the register time: history when progress exists, otherwise a full walk
    pub fn startup_crawl(&mut self) -> Result<CrawlPhase> {
        self.status.set_worker_status(WorkerState::Stable)?;
        self.events.publish(self.event(EventKind::Active));

        let Some(stime) = self.progress.stime()? else {
            self.hybrid_crawl()?;
            return Ok(CrawlPhase::Hybrid);
        };

        self.status.set_crawl_status(CrawlPhase::History)?;
        let range = match self.query.history(stime, self.register_time, HISTORY_WORKERS) {
            Ok(r) => r,
            Err(Error::HistoryUnavailable(reason)) => {
                tracing::warn!("no changelog history from {} ({}), crawling the brick", stime, reason);
                self.hybrid_crawl()?;
                return Ok(CrawlPhase::Hybrid);
            }
            Err(e) => return Err(e),
        };
        tracing::info!(
            "history crawl {}..{}: {} changelogs",
            stime,
            range.actual_end,
            range.published
        );

        loop {
            if self.query.history_scan()? == 0 {
                break;
            }
            let changes = self.query.history_getchanges()?;
            self.process(changes, true)?;
        }

        if range.actual_end < self.register_time {
            tracing::warn!(
                "partial history (ends at {}, wanted {}), crawling the brick",
                range.actual_end,
                self.register_time
            );
            self.hybrid_crawl()?;
            return Ok(CrawlPhase::Hybrid);
        }
        Ok(CrawlPhase::History)
    }

    /// Publish and process live changelogs once
    pub fn changelog_round(&mut self) -> Result<usize> {
        self.refresh_config();
        if self.query.scan()? == 0 {
            return Ok(0);
        }
        let changes = self.query.getchanges()?;
        let n = changes.len();
        self.process(changes, false)?;
        Ok(n)
    }

    fn refresh_config(&mut self) {
        let Some(handle) = &self.handle else {
            return;
        };
        let current = handle.path().and_then(|p| mtime(p));
        if current.is_none() || current == self.config_mtime {
            return;
        }
        match handle.reload() {
            Ok(fresh) => {
                tracing::info!("configuration changed, checkpoint now {}", fresh.worker.checkpoint);
                self.config = fresh;
                self.config_mtime = current;
            }
            Err(e) => tracing::warn!("keeping previous configuration: {}", e),
        }
    }

    /// Walk the whole brick, recreating every entry parents first
    fn hybrid_crawl(&mut self) -> Result<()> {
        self.status.set_crawl_status(CrawlPhase::Hybrid)?;
        let root = self.brick.root().to_path_buf();
        let mut plan = BatchPlan::default();
        let mut total = 0usize;

        self.brick.walk(|rel, meta| {
            if let Some(op) = entry_for(&root, rel, meta) {
                if meta.is_file() {
                    plan.data.push(rel.to_string());
                }
                plan.entries.push(op);
            }
            if plan.entries.len() >= HYBRID_CHUNK {
                total += plan.entries.len();
                let chunk = std::mem::take(&mut plan);
                self.apply_entries(&chunk.entries)?;
                self.sync_data(&chunk.data)?;
            }
            Ok(())
        })?;
        total += plan.entries.len();
        self.apply_entries(&plan.entries)?;
        self.sync_data(&plan.data)?;

        self.progress.set_entry_stime(self.register_time)?;
        self.progress.set_stime(self.register_time)?;
        self.status.set_last_synced_entry(self.register_time)?;
        self.record_synced(self.register_time)?;
        tracing::info!("hybrid crawl of {} done: {} entries", root.display(), total);
        Ok(())
    }

    /// Process changelogs in sequence order, batched by size
    fn process(&mut self, changes: Vec<PathBuf>, history: bool) -> Result<()> {
        let stime = self.progress.stime()?.unwrap_or(0);
        let limit = self.config.worker.batch_size_bytes;
        let mut batch: Vec<PathBuf> = Vec::new();
        let mut size = 0u64;

        for change in changes {
            let Some(ts) = changelog_ts(&change) else {
                tracing::warn!("ignoring {}", change.display());
                continue;
            };
            if ts <= stime {
                tracing::debug!("{} already synced", change.display());
                self.mark_done(&change, history)?;
                continue;
            }
            let len = std::fs::metadata(&change).map(|m| m.len()).unwrap_or(0);
            if !batch.is_empty() && size + len > limit {
                self.process_batch(&std::mem::take(&mut batch), history)?;
                size = 0;
            }
            size += len;
            batch.push(change);
        }
        if !batch.is_empty() {
            self.process_batch(&batch, history)?;
        }
        Ok(())
    }

    fn mark_done(&mut self, change: &Path, history: bool) -> Result<()> {
        if history {
            self.query.history_done(change)
        } else {
            self.query.done(change)
        }
    }

    fn process_batch(&mut self, batch: &[PathBuf], history: bool) -> Result<()> {
        let Some(last_ts) = batch.iter().filter_map(|c| changelog_ts(c)).max() else {
            return Ok(());
        };
        tracing::debug!("processing {} changelogs up to {}", batch.len(), last_ts);

        let records = {
            let db = ChangeDb::open(&self.workdir.join("changes.db"))?;
            db.reset()?;
            let translator = Translator::new(&db, &self.brick);
            for change in batch {
                translator.ingest_file(change)?;
            }
            let stats = translator.resolve()?;
            if stats.unresolved > 0 {
                tracing::warn!("{} records left without a path", stats.unresolved);
                self.status.inc_value(Counter::Failures, stats.unresolved as u64)?;
            }
            translator.records()?
        };

        let plan = self.plan(&records);
        self.apply_entries(&plan.entries)?;
        self.progress.set_entry_stime(last_ts - 1)?;
        self.status.set_last_synced_entry(last_ts)?;

        self.sync_data(&plan.data)?;
        self.apply_meta(&plan.meta)?;

        self.progress.set_stime(last_ts - 1)?;
        self.record_synced(last_ts - 1)?;
        for change in batch {
            self.mark_done(change, history)?;
        }
        Ok(())
    }

    /// Turn translated records into secondary operations
    fn plan(&self, records: &[ChangeRecord]) -> BatchPlan {
        let root = self.brick.root();
        let mut plan = BatchPlan::default();
        let mut seen = HashSet::new();
        let mut queued = HashSet::new();
        let mut push_data = |data: &mut Vec<String>, path: &str| {
            if queued.insert(path.to_string()) {
                data.push(path.to_string());
            }
        };

        for record in records.iter().filter(|r| r.is_resolved()) {
            if !seen.insert((record.kind, record.path1.as_str(), record.path2.as_str())) {
                continue;
            }
            match record.kind {
                RecordType::New => {
                    let Ok(meta) = std::fs::symlink_metadata(root.join(&record.path1)) else {
                        // removed again before we got here
                        continue;
                    };
                    if let Some(op) = entry_for(root, &record.path1, &meta) {
                        if meta.is_file() {
                            push_data(&mut plan.data, &record.path1);
                        }
                        plan.entries.push(op);
                    }
                }
                RecordType::Rename => plan.entries.push(EntryOp::Rename {
                    from: record.path1.clone(),
                    to: record.path2.clone(),
                }),
                RecordType::Delete => {
                    if self.config.worker.ignore_deletes {
                        tracing::debug!("ignoring delete of {}", record.path1);
                    } else {
                        plan.entries.push(EntryOp::Remove {
                            path: record.path1.clone(),
                        });
                    }
                }
                RecordType::Modify => {
                    let Ok(meta) = std::fs::symlink_metadata(root.join(&record.path1)) else {
                        continue;
                    };
                    if meta.is_file() {
                        push_data(&mut plan.data, &record.path1);
                    }
                    plan.meta.push(MetaOp {
                        path: record.path1.clone(),
                        mode: meta.mode() & 0o7777,
                        uid: meta.uid(),
                        gid: meta.gid(),
                    });
                }
            }
        }
        plan
    }

    fn apply_entries(&self, ops: &[EntryOp]) -> Result<()> {
        if ops.is_empty() {
            return Ok(());
        }
        let n = ops.len() as u64;
        self.status.inc_value(Counter::Entry, n)?;
        let failures = self.link.entry_ops(ops);
        self.status.dec_value(Counter::Entry, n)?;

        let failures = failures?;
        for f in &failures {
            tracing::warn!("entry failed on secondary: {}", f);
        }
        if !failures.is_empty() {
            self.status.inc_value(Counter::Failures, failures.len() as u64)?;
        }
        Ok(())
    }

    fn apply_meta(&self, ops: &[MetaOp]) -> Result<()> {
        if ops.is_empty() {
            return Ok(());
        }
        let n = ops.len() as u64;
        self.status.inc_value(Counter::Meta, n)?;
        let failures = self.link.meta_ops(ops);
        self.status.dec_value(Counter::Meta, n)?;

        for f in failures? {
            tracing::warn!("metadata failed on secondary: {}", f);
        }
        Ok(())
    }

    /// Transfer file data, retrying the whole batch; a batch that keeps failing is skipped
    fn sync_data(&self, files: &[String]) -> Result<bool> {
        if files.is_empty() {
            return Ok(true);
        }
        let n = files.len() as u64;
        let attempts = self.config.worker.max_sync_retries.max(1);
        self.status.inc_value(Counter::Data, n)?;

        let mut synced = false;
        for attempt in 1..=attempts {
            self.link.ensure_alive()?;
            match self.engine.sync(self.brick.root(), files, self.link.target()) {
                Ok(()) => {
                    synced = true;
                    break;
                }
                Err(e) if e.class() == ErrorClass::OperatorFatal => {
                    self.status.dec_value(Counter::Data, n)?;
                    return Err(e);
                }
                Err(e) => tracing::warn!("data sync attempt {}/{} failed: {}", attempt, attempts, e),
            }
        }
        self.status.dec_value(Counter::Data, n)?;

        if !synced {
            tracing::error!("giving up on {} files after {} attempts", files.len(), attempts);
            self.status.inc_value(Counter::Failures, n)?;
        }
        Ok(synced)
    }

    /// Store sync progress in the status file and fire checkpoint completion
    fn record_synced(&self, ts: i64) -> Result<()> {
        let checkpoint = self.config.worker.checkpoint;
        if self.status.set_last_synced(ts, checkpoint)? {
            tracing::info!("checkpoint {} completed", checkpoint);
            let completed = self.status.load()?.checkpoint_completion_time;
            self.events.publish(
                self.event(EventKind::CheckpointCompleted)
                    .with("checkpoint_time", checkpoint)
                    .with("checkpoint_completion_time", completed),
            );
        }
        Ok(())
    }

    fn event(&self, kind: EventKind) -> Event {
        Event::new(kind)
            .with("primary_volume", &self.config.session.primary_volume)
            .with("brick_path", self.brick.root().display())
            .with("secondary", self.link.resource())
            .with(
                "current_secondary_host",
                self.link.resource().remote_host().unwrap_or("localhost"),
            )
    }
}

fn mtime(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Run a worker process to completion.
///
/// The feedback descriptor is kept out of every child and closed once the
/// secondary and the agent are connected; the monitor reads that as ready.
pub fn run(handle: ConfigHandle, options: WorkerOptions, events: EventPublisher) -> Result<()> {
    let config = handle.get();
    if let Some(fd) = options.feedback_fd {
        fcntl(fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
    }

    let resource = Resource::parse(&options.secondary)?;
    let pending = PendingLink::spawn(&resource, &config)?;
    let link = pending.finish(&config)?;
    if config.transfer.secondary_timeout_secs > 0 {
        link.start_keep_alive(Duration::from_secs((config.transfer.secondary_timeout_secs / 4).max(1)));
    }

    let program = match &config.worker.agent_program {
        Some(p) => p.clone(),
        None => std::env::current_exe()?,
    };
    let agent = AgentClient::spawn(&program, config.repce.workers)?;

    let mut worker = Worker::new(Arc::clone(&config), &options.brick, link, Box::new(agent), events)?;
    worker.follow_config(handle);

    if let Some(fd) = options.feedback_fd {
        nix::unistd::close(fd)?;
        tracing::debug!("readiness signalled to the monitor");
    }
    worker.run()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changelog::brick::testing::{make_dir, make_file};
    use crate::changelog::{FsChangelog, ROOT_GFID};
    use crate::config::TransferEngineKind;
    use tempfile::tempdir;

    const DOCS: &str = "d0c5d0c5-0000-4000-8000-000000000001";
    const FA: &str = "fafafafa-0000-4000-8000-00000000000a";
    const FB: &str = "fbfbfbfb-0000-4000-8000-00000000000b";

    struct Setup {
        brick: tempfile::TempDir,
        replica: tempfile::TempDir,
        state: tempfile::TempDir,
    }

    impl Setup {
        fn new() -> Self {
            Self {
                brick: tempdir().unwrap(),
                replica: tempdir().unwrap(),
                state: tempdir().unwrap(),
            }
        }

        fn config(&self, checkpoint: i64) -> Arc<GeorepConfig> {
            let mut config = GeorepConfig::default();
            config.session.state_dir = self.state.path().join("status");
            config.session.working_dir = self.state.path().join("work");
            config.transfer.engine = TransferEngineKind::Copy;
            config.worker.checkpoint = checkpoint;
            Arc::new(config)
        }

        fn worker(&self, config: Arc<GeorepConfig>) -> Worker {
            std::fs::create_dir_all(&config.session.state_dir).unwrap();
            let url = format!("file://{}", self.replica.path().display());
            let link = SecondaryLink::connect(&Resource::parse(&url).unwrap(), &config).unwrap();
            Worker::new(
                config,
                self.brick.path(),
                link,
                Box::new(FsChangelog::new()),
                EventPublisher::disabled(),
            )
            .unwrap()
        }

        fn write_changelog(&self, ts: i64, body: &str) {
            let dir = FsChangelog::changelog_dir(self.brick.path());
            std::fs::create_dir_all(&dir).unwrap();
            let content = format!("GlusterFS Changelog | version: v1.2 | encoding : 2\n{}", body);
            std::fs::write(dir.join(format!("CHANGELOG.{}", ts)), content).unwrap();
        }
    }

    #[test]
    fn test_hybrid_then_changelog_crawl() {
        let s = Setup::new();
        make_dir(s.brick.path(), DOCS, ROOT_GFID, "docs");
        make_file(s.brick.path(), FA, "docs/a.txt");

        let now = chrono::Utc::now().timestamp();
        let config = s.config(now + 50);
        let mut worker = s.worker(Arc::clone(&config));

        assert_eq!(worker.startup_crawl().unwrap(), CrawlPhase::Hybrid);
        let replica = s.replica.path();
        assert!(replica.join("docs").is_dir());
        assert_eq!(std::fs::read(replica.join("docs/a.txt")).unwrap(), b"data");
        assert!(!replica.join(".glusterfs").exists());
        let stime = worker.progress().stime().unwrap().unwrap();
        assert!(stime >= now);

        // b.txt created, a.txt removed
        make_file(s.brick.path(), FB, "docs/b.txt");
        std::fs::remove_file(s.brick.path().join("docs/a.txt")).unwrap();
        let ts = now + 100;
        s.write_changelog(
            ts,
            &format!(
                "E {fb} CREATE 33188 0 0 {d}/b.txt\0D {fb}\0E {fa} UNLINK {d}/a.txt\0",
                fa = FA,
                fb = FB,
                d = DOCS
            ),
        );

        assert_eq!(worker.changelog_round().unwrap(), 1);
        assert_eq!(std::fs::read(replica.join("docs/b.txt")).unwrap(), b"data");
        assert!(!replica.join("docs/a.txt").exists());
        assert_eq!(worker.progress().stime().unwrap(), Some(ts - 1));

        let status = worker.status().load().unwrap();
        assert_eq!(status.last_synced, ts - 1);
        assert_eq!(status.last_synced_entry, ts);
        assert_eq!(status.checkpoint_completed, "Yes");
        assert_eq!((status.entry, status.data, status.meta, status.failures), (0, 0, 0, 0));
        assert_eq!(status.worker_status, WorkerState::Stable.to_string());

        // consumed changelogs are not processed again
        assert_eq!(worker.changelog_round().unwrap(), 0);
    }

    #[test]
    fn test_restart_resumes_from_history() {
        let s = Setup::new();
        make_dir(s.brick.path(), DOCS, ROOT_GFID, "docs");
        let config = s.config(0);
        {
            let mut worker = s.worker(Arc::clone(&config));
            assert_eq!(worker.startup_crawl().unwrap(), CrawlPhase::Hybrid);
        }

        let mut worker = s.worker(config);
        assert_eq!(worker.startup_crawl().unwrap(), CrawlPhase::History);
        assert_eq!(worker.status().load().unwrap().checkpoint_completed, "No");
    }

    #[test]
    fn test_ignore_deletes_keeps_secondary_entries() {
        let s = Setup::new();
        make_dir(s.brick.path(), DOCS, ROOT_GFID, "docs");
        make_file(s.brick.path(), FA, "docs/a.txt");

        let mut config = (*s.config(0)).clone();
        config.worker.ignore_deletes = true;
        let mut worker = s.worker(Arc::new(config));
        worker.startup_crawl().unwrap();

        std::fs::remove_file(s.brick.path().join("docs/a.txt")).unwrap();
        let ts = chrono::Utc::now().timestamp() + 100;
        s.write_changelog(ts, &format!("E {} UNLINK {}/a.txt\0", FA, DOCS));
        worker.changelog_round().unwrap();

        assert!(s.replica.path().join("docs/a.txt").exists());
        assert_eq!(worker.progress().stime().unwrap(), Some(ts - 1));
    }

    fn resolved(id: i64, ts: i64, kind: RecordType, gfid: &str, path1: &str) -> ChangeRecord {
        ChangeRecord {
            id,
            ts,
            kind,
            gfid: gfid.to_string(),
            pgfid1: String::new(),
            bn1: String::new(),
            pgfid2: String::new(),
            bn2: String::new(),
            path1: path1.to_string(),
            path2: String::new(),
        }
    }

    #[test]
    fn test_plan_keeps_changelog_order_and_drops_repeats() {
        let s = Setup::new();
        for name in ["zeta", "mid", "alpha"] {
            std::fs::write(s.brick.path().join(name), b"x").unwrap();
        }
        let worker = s.worker(s.config(0));

        let records = vec![
            resolved(1, 10, RecordType::New, FA, "zeta"),
            resolved(2, 20, RecordType::Modify, FB, "mid"),
            resolved(3, 30, RecordType::Modify, DOCS, "alpha"),
            resolved(4, 30, RecordType::Modify, DOCS, "alpha"),
            resolved(5, 40, RecordType::Modify, FA, "zeta"),
        ];
        let plan = worker.plan(&records);

        assert_eq!(plan.data, vec!["zeta", "mid", "alpha"]);
        assert_eq!(plan.entries.len(), 1);
        let meta: Vec<_> = plan.meta.iter().map(|m| m.path.as_str()).collect();
        assert_eq!(meta, vec!["mid", "alpha", "zeta"]);
    }

    #[test]
    fn test_special_files_are_not_planned() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("f"), b"x").unwrap();
        std::os::unix::fs::symlink("f", dir.path().join("l")).unwrap();

        let meta = std::fs::symlink_metadata(dir.path().join("f")).unwrap();
        assert!(matches!(entry_for(dir.path(), "f", &meta), Some(EntryOp::Create { .. })));
        let meta = std::fs::symlink_metadata(dir.path().join("l")).unwrap();
        match entry_for(dir.path(), "l", &meta) {
            Some(EntryOp::Symlink { target, .. }) => assert_eq!(target, "f"),
            other => panic!("unexpected {:?}", other),
        }
    }
}
