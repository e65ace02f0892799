//! Changelog Find Tool
//!
//! Session-based incremental listing of what changed on a volume. A
//! session remembers the last processed time per volume; `pre` collects
//! the changes since then from every brick's node agent into one output
//! file, and `post` commits the new time once the caller has consumed it.
//!
//! Layout: `<session_dir>/<session>/<volume>/status` and `status.pre`,
//! node databases under `<working_dir>/<session>/<volume>/`.

pub mod node;

pub use node::{node_brickfind, node_changelog, NodeJob, NodeMode, NodeOutcome, NodeRunner, ProcessRunner};

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::changelog::escape;
use crate::config::GeorepConfig;
use crate::db::{OutputMerger, OutputRow};
use crate::error::{Error, Result};
use crate::events::{Event, EventKind, EventPublisher};
use crate::status::replace_file;

/// Options of one `pre` run
#[derive(Debug, Clone)]
pub struct PreOptions {
    pub session: String,
    pub volume: String,
    pub outfile: PathBuf,
    /// Ignore the session time and list everything
    pub full: bool,
    /// Joined in front of every output path
    pub output_prefix: String,
    /// Write paths without escaping
    pub no_encode: bool,
}

/// What a `pre` run produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreReport {
    pub start: i64,
    pub end: i64,
    pub rows: usize,
    pub failures: usize,
}

/// One line of `list`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEntry {
    pub session: String,
    pub volume: String,
    pub last_processed: Option<i64>,
}

/// Session operations of the find tool
pub struct FindTool {
    config: Arc<GeorepConfig>,
    events: EventPublisher,
}

impl FindTool {
    pub fn new(config: Arc<GeorepConfig>, events: EventPublisher) -> Self {
        Self { config, events }
    }

    fn session_root(&self, session: &str, volume: &str) -> PathBuf {
        self.config.find.session_dir.join(session).join(volume)
    }

    fn scratch(&self, session: &str, volume: &str) -> PathBuf {
        self.config.find.working_dir.join(session).join(volume)
    }

    fn require_session(&self, session: &str) -> Result<()> {
        if !self.config.find.session_dir.join(session).is_dir() {
            return Err(Error::Session(format!("invalid session {}", session)));
        }
        Ok(())
    }

    /// Bricks of `volume` as `(host, path)`
    fn bricks(&self, volume: &str) -> Result<Vec<(String, PathBuf)>> {
        let vol = self
            .config
            .find_volume(volume)
            .ok_or_else(|| Error::Session(format!("unable to get volume details for {}", volume)))?;
        vol.bricks
            .iter()
            .map(|b| {
                b.split_once(':')
                    .map(|(host, path)| (host.to_string(), PathBuf::from(path)))
                    .ok_or_else(|| Error::Config(format!("brick {} must be host:/path", b)))
            })
            .collect()
    }

    /// Start a session for `volume`; an existing one is kept only with `force`
    pub fn create(&self, session: &str, volume: &str, force: bool) -> Result<()> {
        tracing::debug!("create session {} volume {}", session, volume);
        self.bricks(volume)?;

        let root = self.session_root(session, volume);
        std::fs::create_dir_all(&root)?;
        let status = root.join("status");
        if status.exists() {
            if !force {
                return Err(Error::Session(format!("session {} already created", session)));
            }
            tracing::info!("session {} exists, keeping its time", session);
            return Ok(());
        }

        // changelogs up to this point will have rolled over by the first pre
        let start = chrono::Utc::now().timestamp() + self.config.find.rollover_secs;
        replace_file(&status, start.to_string().as_bytes())?;
        tracing::info!("session {} created for {} at {}", session, volume, start);

        self.events.publish(
            Event::new(EventKind::FindSessionCreated)
                .with("session", session)
                .with("volume", volume)
                .with("start", start),
        );
        Ok(())
    }

    /// Collect every change since the session time into `opts.outfile`
    pub fn pre(&self, opts: &PreOptions, runner: &dyn NodeRunner) -> Result<PreReport> {
        self.require_session(&opts.session)?;
        let end = chrono::Utc::now().timestamp() - self.config.find.rollover_secs;
        let root = self.session_root(&opts.session, &opts.volume);
        let status = root.join("status");

        let start: i64 = match std::fs::read_to_string(&status) {
            Ok(s) => s.trim().parse().map_err(|_| {
                Error::Session(format!("corrupt session file {}: {:?}", status.display(), s.trim()))
            })?,
            Err(e) => {
                return Err(Error::Session(format!(
                    "error opening session file {}: {}",
                    status.display(),
                    e
                )))
            }
        };
        tracing::debug!("pre session {} volume {}, start {}, end {}", opts.session, opts.volume, start, end);

        if let Some(parent) = opts.outfile.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let nodes = self.run_in_nodes(opts, start, end, runner)?;

        let scratch = self.scratch(&opts.session, &opts.volume);
        let merged_path = scratch.join("merged.db");
        remove_if_exists(&merged_path)?;
        let merged = OutputMerger::open(&merged_path)?;
        for db in &nodes {
            let added = merged.merge_from(db)?;
            tracing::debug!("merged {} new rows from {}", added, db.display());
        }

        let rows = merged.rows()?;
        let failures = merged.failures()?;
        write_output(&opts.outfile, &rows, &opts.output_prefix, !opts.no_encode)?;
        write_lines(&failures_path(&opts.outfile), &failures)?;

        replace_file(&root.join("status.pre"), end.to_string().as_bytes())?;

        for db in nodes.iter().chain(std::iter::once(&merged_path)) {
            remove_if_exists(db)?;
        }

        tracing::info!(
            "generated output file {} ({} rows, {} failures)",
            opts.outfile.display(),
            rows.len(),
            failures.len()
        );
        Ok(PreReport {
            start,
            end,
            rows: rows.len(),
            failures: failures.len(),
        })
    }

    /// Run one agent per brick in parallel, returning the node databases in brick order
    fn run_in_nodes(&self, opts: &PreOptions, start: i64, end: i64, runner: &dyn NodeRunner) -> Result<Vec<PathBuf>> {
        let scratch = self.scratch(&opts.session, &opts.volume);
        std::fs::create_dir_all(&scratch)?;

        let mode = if start == 0 || opts.full {
            NodeMode::Brickfind
        } else {
            NodeMode::Changelog
        };
        let jobs: Vec<NodeJob> = self
            .bricks(&opts.volume)?
            .into_iter()
            .enumerate()
            .map(|(idx, (host, brick))| NodeJob {
                mode,
                session: opts.session.clone(),
                volume: opts.volume.clone(),
                host,
                brick,
                outdb: scratch.join(format!("node_{}.db", idx)),
                start,
                end,
            })
            .collect();

        let outcomes: Vec<Result<()>> = std::thread::scope(|s| {
            let handles: Vec<_> = jobs
                .iter()
                .map(|job| s.spawn(move || run_with_fallback(runner, job)))
                .collect();
            handles
                .into_iter()
                .map(|h| {
                    h.join()
                        .unwrap_or_else(|_| Err(Error::Internal("node agent thread panicked".into())))
                })
                .collect()
        });

        let mut failed = 0;
        for (job, outcome) in jobs.iter().zip(&outcomes) {
            if let Err(e) = outcome {
                tracing::error!("{}:{} - change detection failed: {}", job.host, job.brick.display(), e);
                failed += 1;
            }
        }
        if failed > 0 {
            return Err(Error::Session(format!("{} of {} nodes failed", failed, jobs.len())));
        }
        Ok(jobs.into_iter().map(|j| j.outdb).collect())
    }

    /// Commit the time recorded by the last `pre`
    pub fn post(&self, session: &str, volume: &str) -> Result<()> {
        self.require_session(session)?;
        let root = self.session_root(session, volume);
        let pre = root.join("status.pre");
        if !pre.exists() {
            return Err(Error::Session("pre script is not run".into()));
        }
        std::fs::rename(&pre, root.join("status"))?;
        tracing::debug!("post session {} volume {}", session, volume);
        Ok(())
    }

    /// Drop node scratch space left by an interrupted `pre`
    pub fn cleanup(&self, session: &str, volume: &str) -> Result<()> {
        self.require_session(session)?;
        remove_dir_if_exists(&self.scratch(session, volume))?;
        tracing::debug!("cleanup session {} volume {}", session, volume);
        Ok(())
    }

    /// Remove the session of `volume` along with its scratch space
    pub fn delete(&self, session: &str, volume: &str) -> Result<()> {
        self.require_session(session)?;
        remove_dir_if_exists(&self.session_root(session, volume))?;
        remove_dir_if_exists(&self.scratch(session, volume))?;

        // last volume of the session takes the session with it
        let session_dir = self.config.find.session_dir.join(session);
        if std::fs::read_dir(&session_dir).map_or(false, |mut d| d.next().is_none()) {
            std::fs::remove_dir(&session_dir)?;
        }
        tracing::info!("session {} deleted for {}", session, volume);

        self.events.publish(
            Event::new(EventKind::FindSessionDeleted)
                .with("session", session)
                .with("volume", volume),
        );
        Ok(())
    }

    /// Sessions and their last processed time, optionally filtered
    pub fn list(&self, session: Option<&str>, volume: Option<&str>) -> Result<Vec<SessionEntry>> {
        let base = &self.config.find.session_dir;
        let sessions = match session {
            Some(name) => {
                self.require_session(name)?;
                vec![name.to_string()]
            }
            None => sorted_names(base)?,
        };

        let mut out = Vec::new();
        for session in sessions {
            for vol in sorted_names(&base.join(&session))? {
                if volume.map_or(false, |v| v != vol) {
                    continue;
                }
                let last_processed = match std::fs::read_to_string(base.join(&session).join(&vol).join("status")) {
                    Ok(s) => s.trim().parse().ok(),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
                    Err(e) => return Err(e.into()),
                };
                out.push(SessionEntry {
                    session: session.clone(),
                    volume: vol,
                    last_processed,
                });
            }
        }
        Ok(out)
    }
}

fn run_with_fallback(runner: &dyn NodeRunner, job: &NodeJob) -> Result<()> {
    remove_if_exists(&job.outdb)?;
    match runner.run(job)? {
        NodeOutcome::Done => Ok(()),
        NodeOutcome::PartialHistory => {
            tracing::info!("{}:{} fallback to brickfind", job.host, job.brick.display());
            remove_if_exists(&job.outdb)?;
            let fallback = NodeJob {
                mode: NodeMode::Brickfind,
                ..job.clone()
            };
            match runner.run(&fallback)? {
                NodeOutcome::Done => Ok(()),
                NodeOutcome::PartialHistory => Err(Error::Internal("brick crawl reported partial history".into())),
            }
        }
    }
}

/// Render the `list` table
pub fn render_list(entries: &[SessionEntry]) -> String {
    if entries.is_empty() {
        return String::new();
    }
    let mut out = format!("{:<25} {:<25} {:<25}\n{}\n", "SESSION", "VOLUME", "SESSION TIME", "-".repeat(75));
    for e in entries {
        let time = e
            .last_processed
            .and_then(|ts| chrono::DateTime::from_timestamp(ts, 0))
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "-".to_string());
        out.push_str(&format!("{:<25} {:<25} {:<25}\n", e.session, e.volume, time));
    }
    out
}

/// One output line: `TYPE path1 [path2]`
pub fn output_line(row: &OutputRow, prefix: &str, encode: bool) -> String {
    let render = |p: &str| {
        let joined = if prefix.is_empty() {
            p.to_string()
        } else {
            format!("{}/{}", prefix.trim_end_matches('/'), p)
        };
        if encode {
            escape(&joined)
        } else {
            joined
        }
    };
    if row.path2.is_empty() {
        format!("{} {}", row.kind, render(&row.path1))
    } else {
        format!("{} {} {}", row.kind, render(&row.path1), render(&row.path2))
    }
}

/// Where unresolved GFIDs of an output file go
pub fn failures_path(outfile: &Path) -> PathBuf {
    let mut name = outfile.as_os_str().to_os_string();
    name.push(".failures");
    PathBuf::from(name)
}

fn write_output(path: &Path, rows: &[OutputRow], prefix: &str, encode: bool) -> Result<()> {
    let lines: Vec<String> = rows.iter().map(|r| output_line(r, prefix, encode)).collect();
    write_lines(path, &lines)
}

fn write_lines(path: &Path, lines: &[String]) -> Result<()> {
    let mut file = std::io::BufWriter::new(std::fs::File::create(path)?);
    for line in lines {
        writeln!(file, "{}", line)?;
    }
    let file = file.into_inner().map_err(|e| Error::Io(e.into_error()))?;
    file.sync_all()?;
    Ok(())
}

fn sorted_names(dir: &Path) -> Result<Vec<String>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut names: Vec<String> = entries
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    Ok(names)
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}

fn remove_dir_if_exists(path: &Path) -> Result<()> {
    match std::fs::remove_dir_all(path) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::node::testing::InProcess;
    use super::*;
    use crate::changelog::brick::testing::{make_dir, make_file};
    use crate::changelog::{FsChangelog, RecordType, ROOT_GFID};
    use crate::config::FindVolume;
    use tempfile::{tempdir, TempDir};

    const DOCS: &str = "d0c5d0c5-0000-4000-8000-000000000001";
    const FA: &str = "fafafafa-0000-4000-8000-00000000000a";

    struct Setup {
        dir: TempDir,
        config: Arc<GeorepConfig>,
    }

    impl Setup {
        fn new() -> Self {
            let dir = tempdir().unwrap();
            std::fs::create_dir_all(dir.path().join("brick")).unwrap();
            let mut config = GeorepConfig::default();
            config.find.session_dir = dir.path().join("sessions");
            config.find.working_dir = dir.path().join("work");
            config.find.rollover_secs = 15;
            config.find.volumes = vec![FindVolume {
                name: "gv0".into(),
                bricks: vec![format!("localhost:{}", dir.path().join("brick").display())],
            }];
            Self {
                dir,
                config: Arc::new(config),
            }
        }

        fn brick(&self) -> PathBuf {
            self.dir.path().join("brick")
        }

        fn tool(&self) -> FindTool {
            FindTool::new(Arc::clone(&self.config), EventPublisher::disabled())
        }

        fn runner(&self) -> InProcess {
            InProcess((*self.config).clone())
        }

        fn status(&self) -> PathBuf {
            self.config.find.session_dir.join("s1/gv0/status")
        }

        fn opts(&self) -> PreOptions {
            PreOptions {
                session: "s1".into(),
                volume: "gv0".into(),
                outfile: self.dir.path().join("out/changes.txt"),
                full: false,
                output_prefix: ".".into(),
                no_encode: false,
            }
        }

        fn write_changelog(&self, ts: i64, body: &str) {
            let dir = FsChangelog::changelog_dir(&self.brick());
            std::fs::create_dir_all(&dir).unwrap();
            let content = format!("GlusterFS Changelog | version: v1.2 | encoding : 2\n{}", body);
            std::fs::write(dir.join(format!("CHANGELOG.{}", ts)), content).unwrap();
        }
    }

    #[test]
    fn test_create_is_guarded() {
        let s = Setup::new();
        let tool = s.tool();
        let before = chrono::Utc::now().timestamp();
        tool.create("s1", "gv0", false).unwrap();
        let start: i64 = std::fs::read_to_string(s.status()).unwrap().parse().unwrap();
        assert!(start >= before + 15);

        assert!(matches!(tool.create("s1", "gv0", false), Err(Error::Session(_))));
        tool.create("s1", "gv0", true).unwrap();
        assert!(matches!(tool.create("s1", "nope", false), Err(Error::Session(_))));
    }

    #[test]
    fn test_incremental_cycle() {
        let s = Setup::new();
        let tool = s.tool();
        tool.create("s1", "gv0", false).unwrap();
        std::fs::write(s.status(), "100").unwrap();

        make_dir(&s.brick(), DOCS, ROOT_GFID, "docs");
        make_file(&s.brick(), FA, "docs/b.txt");
        s.write_changelog(
            115,
            &format!(
                "E {fa} CREATE 33188 0 0 {d}/a.txt\0E {fa} RENAME {d}/a.txt {d}/b.txt\0",
                fa = FA,
                d = DOCS
            ),
        );

        let opts = s.opts();
        let report = tool.pre(&opts, &s.runner()).unwrap();
        assert_eq!(report.start, 100);
        assert_eq!(report.rows, 1);
        let out = std::fs::read_to_string(&opts.outfile).unwrap();
        assert_eq!(out, "NEW ./docs/b.txt\n");
        assert_eq!(std::fs::read_to_string(failures_path(&opts.outfile)).unwrap(), "");

        // status only moves on post
        assert_eq!(std::fs::read_to_string(s.status()).unwrap(), "100");
        tool.post("s1", "gv0").unwrap();
        let committed: i64 = std::fs::read_to_string(s.status()).unwrap().parse().unwrap();
        assert_eq!(committed, report.end);
        assert!(matches!(tool.post("s1", "gv0"), Err(Error::Session(_))));

        let listed = tool.list(None, None).unwrap();
        assert_eq!(
            listed,
            vec![SessionEntry {
                session: "s1".into(),
                volume: "gv0".into(),
                last_processed: Some(report.end),
            }]
        );
        assert!(render_list(&listed).starts_with("SESSION"));

        tool.delete("s1", "gv0").unwrap();
        assert!(tool.list(None, None).unwrap().is_empty());
        assert!(matches!(tool.post("s1", "gv0"), Err(Error::Session(_))));
    }

    #[test]
    fn test_partial_history_falls_back_to_brickfind() {
        let s = Setup::new();
        let tool = s.tool();
        tool.create("s1", "gv0", false).unwrap();
        std::fs::write(s.status(), "100").unwrap();

        make_dir(&s.brick(), DOCS, ROOT_GFID, "docs");
        make_file(&s.brick(), FA, "docs/a.txt");
        s.write_changelog(115, "");
        let htime = FsChangelog::changelog_dir(&s.brick()).join("htime");
        std::fs::create_dir_all(&htime).unwrap();
        std::fs::write(htime.join("HTIME.90"), "").unwrap();
        std::fs::write(htime.join("HTIME.110"), "").unwrap();

        let opts = s.opts();
        assert_eq!(tool.pre(&opts, &s.runner()).unwrap().rows, 2);
        let out = std::fs::read_to_string(&opts.outfile).unwrap();
        assert_eq!(out, "NEW ./docs\nNEW ./docs/a.txt\n");
    }

    #[test]
    fn test_full_listing_encodes_paths() {
        let s = Setup::new();
        let tool = s.tool();
        tool.create("s1", "gv0", false).unwrap();
        std::fs::write(s.brick().join("my file.txt"), b"x").unwrap();

        let mut opts = s.opts();
        opts.full = true;
        opts.output_prefix = String::new();
        tool.pre(&opts, &s.runner()).unwrap();
        assert_eq!(std::fs::read_to_string(&opts.outfile).unwrap(), "NEW my%20file.txt\n");

        opts.no_encode = true;
        tool.pre(&opts, &s.runner()).unwrap();
        assert_eq!(std::fs::read_to_string(&opts.outfile).unwrap(), "NEW my file.txt\n");

        tool.cleanup("s1", "gv0").unwrap();
        assert!(!s.config.find.working_dir.join("s1/gv0").exists());
    }

    #[test]
    fn test_output_line() {
        let row = OutputRow {
            ts: 1,
            kind: RecordType::Rename,
            gfid: String::new(),
            path1: "a b".into(),
            path2: "c%d".into(),
        };
        assert_eq!(output_line(&row, "/mnt/", true), "RENAME /mnt/a%20b /mnt/c%25d");
        assert_eq!(output_line(&row, "", false), "RENAME a b c%d");
    }

    #[test]
    fn test_corrupt_status_is_reported() {
        let s = Setup::new();
        let tool = s.tool();
        tool.create("s1", "gv0", false).unwrap();
        std::fs::write(s.status(), "12x\n").unwrap();

        let opts = s.opts();
        match tool.pre(&opts, &s.runner()) {
            Err(Error::Session(message)) => assert!(message.contains("corrupt session file")),
            other => panic!("unexpected {:?}", other),
        }
        assert!(!opts.outfile.exists());
    }

    #[test]
    fn test_unknown_session() {
        let s = Setup::new();
        let tool = s.tool();
        assert!(matches!(tool.pre(&s.opts(), &s.runner()), Err(Error::Session(_))));
        assert!(matches!(tool.list(Some("s9"), None), Err(Error::Session(_))));
        assert!(tool.list(None, None).unwrap().is_empty());
    }
}
