//! Node Agents
//!
//! Change detection for one brick, run on the node that owns it. The
//! changelog agent replays history between two timestamps and translates
//! it to paths; the brickfind agent lists every entry as NEW. Both leave
//! an [`OutputMerger`] database behind for the session merge step.

use std::path::{Path, PathBuf};
use std::process::Command;

use crate::changelog::{brick_workdir, changelog_ts, Brick, ChangelogQuery, FsChangelog, RecordType, Translator};
use crate::config::{GeorepConfig, TransferConfig};
use crate::db::{ChangeDb, OutputMerger};
use crate::error::{Error, Result};
use crate::resource::ssh::ssh_argv;

/// Change detector a node runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeMode {
    /// Changelog history replay
    Changelog,
    /// Full brick crawl
    Brickfind,
}

impl NodeMode {
    /// Subcommand name of this agent
    pub fn command(&self) -> &'static str {
        match self {
            NodeMode::Changelog => "node-changelog",
            NodeMode::Brickfind => "node-brickfind",
        }
    }
}

/// One brick's share of a `pre` run
#[derive(Debug, Clone)]
pub struct NodeJob {
    pub mode: NodeMode,
    pub session: String,
    pub volume: String,
    pub host: String,
    pub brick: PathBuf,
    /// Node result database
    pub outdb: PathBuf,
    pub start: i64,
    pub end: i64,
}

/// How a node agent finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeOutcome {
    Done,
    /// History did not reach the requested end; retry with brickfind
    PartialHistory,
}

/// Runs node agents wherever their bricks live
pub trait NodeRunner: Sync {
    fn run(&self, job: &NodeJob) -> Result<NodeOutcome>;
}

/// Changelog scratch space for `brick` within a find session
pub fn node_workdir(config: &GeorepConfig, session: &str, volume: &str, brick: &Path) -> PathBuf {
    brick_workdir(&config.find.working_dir.join(session).join(volume), brick)
}

/// Run the agent `job` names in this process
pub fn run_local(config: &GeorepConfig, job: &NodeJob) -> Result<()> {
    match job.mode {
        NodeMode::Changelog => {
            let workdir = node_workdir(config, &job.session, &job.volume, &job.brick);
            node_changelog(&workdir, &job.brick, &job.outdb, job.start, job.end).map(|_| ())
        }
        NodeMode::Brickfind => node_brickfind(&job.brick, &job.outdb, job.end).map(|_| ()),
    }
}

/// Translate the changelogs in `(start, end]` into `outdb`, returning the covered end
pub fn node_changelog(workdir: &Path, brick: &Path, outdb: &Path, start: i64, end: i64) -> Result<i64> {
    tracing::info!("{} started changelog crawl, start {}, end {}", brick.display(), start, end);
    std::fs::create_dir_all(workdir)?;

    let mut query = FsChangelog::new();
    query.register(brick, workdir)?;
    let range = match query.history(start, end, 1) {
        Ok(range) => range,
        Err(Error::HistoryUnavailable(reason)) => {
            tracing::info!("{} history unavailable: {}", brick.display(), reason);
            return Err(Error::PartialHistory {
                actual_end: start,
                requested_end: end,
            });
        }
        Err(e) => return Err(e),
    };

    let db = ChangeDb::open(&workdir.join("changes.db"))?;
    db.reset()?;
    let tree = Brick::new(brick);
    let translator = Translator::new(&db, &tree);

    let mut consumed = 0;
    while query.history_scan()? > 0 {
        for changelog in query.history_getchanges()? {
            // leftovers of an earlier run that covered them already
            if changelog_ts(&changelog).map_or(false, |ts| ts > start) {
                translator.ingest_file(&changelog)?;
                consumed += 1;
            }
            query.history_done(&changelog)?;
        }
    }

    if range.actual_end < end {
        return Err(Error::PartialHistory {
            actual_end: range.actual_end,
            requested_end: end,
        });
    }

    let stats = translator.resolve()?;
    let out = OutputMerger::open(outdb)?;
    let unresolved = out.add_records(&translator.records()?)?;
    tracing::info!(
        "{} changelog crawl done: {} changelogs, {} rows, {} unresolved",
        brick.display(),
        consumed,
        out.count()?,
        unresolved.max(stats.unresolved)
    );
    Ok(range.actual_end)
}

/// List every entry of `brick` into `outdb` as NEW
pub fn node_brickfind(brick: &Path, outdb: &Path, ts: i64) -> Result<usize> {
    tracing::info!("{} started brick crawl", brick.display());
    let tree = Brick::new(brick);
    let out = OutputMerger::open(outdb)?;

    let mut added = 0;
    out.transaction(|| {
        tree.walk(|rel, _meta| {
            if out.add(ts, RecordType::New, "", rel, "")? {
                added += 1;
            }
            Ok(())
        })
    })?;
    tracing::info!("{} brick crawl done: {} entries", brick.display(), added);
    Ok(added)
}

/// Whether `host` names this machine
pub fn is_local_host(host: &str) -> bool {
    if matches!(host, "localhost" | "127.0.0.1" | "::1") {
        return true;
    }
    match nix::unistd::gethostname() {
        Ok(name) => {
            let name = name.to_string_lossy();
            name == host || name.split('.').next() == Some(host)
        }
        Err(_) => false,
    }
}

/// Runs node agents as child processes, over ssh for remote bricks
pub struct ProcessRunner {
    /// find executable, local and remote
    pub program: PathBuf,
    /// Configuration file handed to the agents
    pub config_path: Option<PathBuf>,
    pub transfer: TransferConfig,
    pub debug: bool,
}

impl ProcessRunner {
    fn agent_args(&self, job: &NodeJob) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(path) = &self.config_path {
            args.push("--config".to_string());
            args.push(path.display().to_string());
        }
        if self.debug {
            args.push("--debug".to_string());
        }
        args.extend([
            job.mode.command().to_string(),
            job.session.clone(),
            job.volume.clone(),
            job.brick.display().to_string(),
            job.outdb.display().to_string(),
            job.start.to_string(),
            job.end.to_string(),
        ]);
        args
    }

    fn fetch(&self, job: &NodeJob) -> Result<()> {
        let mut scp = Command::new("scp");
        scp.args(&self.transfer.ssh_options)
            .arg("-P")
            .arg(self.transfer.ssh_port.to_string())
            .arg(format!("{}:{}", job.host, job.outdb.display()))
            .arg(&job.outdb);
        let status = scp.status()?;
        if !status.success() {
            return Err(Error::Session(format!("{} - copy command failed ({})", job.host, status)));
        }
        Ok(())
    }
}

impl NodeRunner for ProcessRunner {
    fn run(&self, job: &NodeJob) -> Result<NodeOutcome> {
        let local = is_local_host(&job.host);
        let mut cmd = if local {
            let mut cmd = Command::new(&self.program);
            cmd.args(self.agent_args(job));
            cmd
        } else {
            let argv = ssh_argv(&self.transfer);
            let mut cmd = Command::new(&argv[0]);
            cmd.args(&argv[1..]).arg(&job.host).arg(&self.program).args(self.agent_args(job));
            cmd
        };

        tracing::debug!("running {:?}", cmd);
        let status = cmd.status().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::MissingBinary(self.program.display().to_string())
            } else {
                Error::Io(e)
            }
        })?;
        match status.code() {
            Some(0) => {}
            Some(2) => {
                tracing::info!("{} partial history, falling back to brickfind", job.host);
                return Ok(NodeOutcome::PartialHistory);
            }
            _ => {
                return Err(Error::Session(format!(
                    "{} - change detection failed ({})",
                    job.host, status
                )))
            }
        }

        if !local {
            self.fetch(job)?;
        }
        Ok(NodeOutcome::Done)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Runs every agent in-process
    pub struct InProcess(pub GeorepConfig);

    impl NodeRunner for InProcess {
        fn run(&self, job: &NodeJob) -> Result<NodeOutcome> {
            match run_local(&self.0, job) {
                Ok(()) => Ok(NodeOutcome::Done),
                Err(Error::PartialHistory { .. }) => Ok(NodeOutcome::PartialHistory),
                Err(e) => Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changelog::brick::testing::{make_dir, make_file};
    use crate::changelog::ROOT_GFID;
    use tempfile::tempdir;

    const DOCS: &str = "d0c5d0c5-0000-4000-8000-000000000001";
    const FA: &str = "fafafafa-0000-4000-8000-00000000000a";

    fn write_changelog(brick: &Path, ts: i64, body: &str) {
        let dir = FsChangelog::changelog_dir(brick);
        std::fs::create_dir_all(&dir).unwrap();
        let content = format!("GlusterFS Changelog | version: v1.2 | encoding : 2\n{}", body);
        std::fs::write(dir.join(format!("CHANGELOG.{}", ts)), content).unwrap();
    }

    #[test]
    fn test_changelog_agent_translates_history() {
        let brick = tempdir().unwrap();
        let work = tempdir().unwrap();
        make_dir(brick.path(), DOCS, ROOT_GFID, "docs");
        make_file(brick.path(), FA, "docs/b.txt");
        write_changelog(brick.path(), 100, "");
        write_changelog(
            brick.path(),
            115,
            &format!(
                "E {fa} CREATE 33188 0 0 {d}/a.txt\0M {fa} SETATTR\0E {fa} RENAME {d}/a.txt {d}/b.txt\0",
                fa = FA,
                d = DOCS
            ),
        );

        let outdb = work.path().join("node.db");
        let end = node_changelog(&work.path().join("wd"), brick.path(), &outdb, 100, 120).unwrap();
        assert_eq!(end, 120);

        let rows = OutputMerger::open(&outdb).unwrap().rows().unwrap();
        let new: Vec<_> = rows.iter().filter(|r| r.kind == RecordType::New).collect();
        assert_eq!(new.len(), 1);
        assert_eq!(new[0].path1, "docs/b.txt");
        assert!(rows.iter().all(|r| r.kind != RecordType::Rename));
    }

    #[test]
    fn test_changelog_agent_reports_partial_history() {
        let brick = tempdir().unwrap();
        let work = tempdir().unwrap();
        for ts in [100, 115] {
            write_changelog(brick.path(), ts, "");
        }
        let dir = FsChangelog::changelog_dir(brick.path()).join("htime");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("HTIME.90"), "").unwrap();
        std::fs::write(dir.join("HTIME.110"), "").unwrap();

        let err = node_changelog(&work.path().join("wd"), brick.path(), &work.path().join("n.db"), 100, 200)
            .unwrap_err();
        assert!(matches!(err, Error::PartialHistory { .. }));
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn test_brickfind_lists_everything() {
        let brick = tempdir().unwrap();
        let work = tempdir().unwrap();
        make_dir(brick.path(), DOCS, ROOT_GFID, "docs");
        make_file(brick.path(), FA, "docs/a.txt");

        let outdb = work.path().join("node.db");
        assert_eq!(node_brickfind(brick.path(), &outdb, 7).unwrap(), 2);
        let paths: Vec<String> = OutputMerger::open(&outdb)
            .unwrap()
            .rows()
            .unwrap()
            .into_iter()
            .map(|r| r.path1)
            .collect();
        assert_eq!(paths, vec!["docs".to_string(), "docs/a.txt".to_string()]);
    }

    #[test]
    fn test_agent_args() {
        let runner = ProcessRunner {
            program: PathBuf::from("georep-find"),
            config_path: Some(PathBuf::from("/etc/georep.toml")),
            transfer: TransferConfig::default(),
            debug: true,
        };
        let job = NodeJob {
            mode: NodeMode::Brickfind,
            session: "s1".into(),
            volume: "gv0".into(),
            host: "node1".into(),
            brick: PathBuf::from("/bricks/b1"),
            outdb: PathBuf::from("/tmp/out.db"),
            start: 0,
            end: 50,
        };
        assert_eq!(
            runner.agent_args(&job),
            vec![
                "--config", "/etc/georep.toml", "--debug", "node-brickfind", "s1", "gv0",
                "/bricks/b1", "/tmp/out.db", "0", "50"
            ]
        );
        assert!(is_local_host("localhost"));
    }
}
