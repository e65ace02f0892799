//! Changelog Agent
//!
//! The worker never touches the changelog query interface directly; it
//! drives a child `georep agent` over Repce. The agent owns an
//! [`FsChangelog`] and serves each query method by name.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::changelog::{ChangelogQuery, FsChangelog, HistoryRange};
use crate::error::{Error, Result};
use crate::repce::{Dispatcher, RepceClient, RepceServer, Value};

/// Version both sides of the agent channel must agree on
pub const AGENT_VERSION: &str = "1.0";

/// How often the worker checks that its agent is still running
const AGENT_POLL: Duration = Duration::from_millis(500);

type Shared = Arc<Mutex<Box<dyn ChangelogQuery>>>;

fn lock(q: &Shared) -> MutexGuard<'_, Box<dyn ChangelogQuery>> {
    q.lock().unwrap_or_else(|e| e.into_inner())
}

fn str_arg(args: &[Value], idx: usize) -> Result<&str> {
    args.get(idx)
        .and_then(Value::as_str)
        .ok_or_else(|| Error::Repce(format!("argument {} must be a string", idx)))
}

fn int_arg(args: &[Value], idx: usize) -> Result<i64> {
    args.get(idx)
        .and_then(Value::as_i64)
        .ok_or_else(|| Error::Repce(format!("argument {} must be an integer", idx)))
}

fn path_list(paths: Vec<PathBuf>) -> Value {
    Value::List(
        paths
            .into_iter()
            .map(|p| Value::Str(p.display().to_string()))
            .collect(),
    )
}

/// Method table exposing `query` to a worker
pub fn agent_dispatcher(query: Box<dyn ChangelogQuery>) -> Dispatcher {
    let q: Shared = Arc::new(Mutex::new(query));
    let (register, scan, getchanges, done) = (q.clone(), q.clone(), q.clone(), q.clone());
    let (history, history_scan, history_getchanges, history_done) =
        (q.clone(), q.clone(), q.clone(), q);

    Dispatcher::new()
        .register("version", |_| Ok(Value::from(AGENT_VERSION)))
        .register("init", |_| Ok(Value::Null))
        .register("register", move |args| {
            let brick = str_arg(args, 0)?;
            let workdir = str_arg(args, 1)?;
            lock(&register).register(Path::new(brick), Path::new(workdir))?;
            Ok(Value::Null)
        })
        .register("scan", move |_| Ok(Value::from(lock(&scan).scan()?)))
        .register("getchanges", move |_| Ok(path_list(lock(&getchanges).getchanges()?)))
        .register("done", move |args| {
            lock(&done).done(Path::new(str_arg(args, 0)?))?;
            Ok(Value::Null)
        })
        .register("history", move |args| {
            let start = int_arg(args, 0)?;
            let end = int_arg(args, 1)?;
            let workers = int_arg(args, 2).unwrap_or(1).max(1) as usize;
            let range = lock(&history).history(start, end, workers)?;
            Ok(Value::List(vec![
                Value::from(range.published),
                Value::from(range.actual_end),
            ]))
        })
        .register("history_scan", move |_| Ok(Value::from(lock(&history_scan).history_scan()?)))
        .register("history_getchanges", move |_| {
            Ok(path_list(lock(&history_getchanges).history_getchanges()?))
        })
        .register("history_done", move |args| {
            lock(&history_done).history_done(Path::new(str_arg(args, 0)?))?;
            Ok(Value::Null)
        })
}

/// Serve the filesystem changelog interface on stdin/stdout
pub fn serve_agent_stdio(workers: usize) -> Result<()> {
    tracing::info!("changelog agent started (pid {})", std::process::id());
    let server = RepceServer::new(
        std::io::stdin(),
        std::io::stdout(),
        Arc::new(agent_dispatcher(Box::new(FsChangelog::new()))),
        workers,
    );
    server.service_loop()
}

/// Worker side of the agent channel
pub struct AgentClient {
    client: RepceClient,
    child: Option<Arc<Mutex<Child>>>,
}

impl AgentClient {
    /// Client over an already connected stream pair
    pub fn over<R, W>(reader: R, writer: W) -> Result<Self>
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        let agent = Self {
            client: RepceClient::new(reader, writer)?,
            child: None,
        };
        agent.check_versions()?;
        Ok(agent)
    }

    /// Start `program agent` as a child and handshake with it.
    ///
    /// The worker exits if the agent dies: calls in flight to a dead agent
    /// would never be answered.
    pub fn spawn(program: &Path, workers: usize) -> Result<Self> {
        let mut child = match Command::new(program)
            .arg("agent")
            .arg("--workers")
            .arg(workers.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
        {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::MissingBinary(program.display().to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Internal("agent has no stdout".into()))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Internal("agent has no stdin".into()))?;

        let child = Arc::new(Mutex::new(child));
        watch_agent(Arc::clone(&child));
        let agent = Self {
            client: RepceClient::new(stdout, stdin)?,
            child: Some(child),
        };
        agent.check_versions()?;
        tracing::info!("changelog agent ready");
        Ok(agent)
    }

    fn check_versions(&self) -> Result<()> {
        self.client.handshake()?;
        let version = self.client.call("version", Vec::new())?;
        if version.as_str() != Some(AGENT_VERSION) {
            return Err(Error::VersionMismatch {
                what: "changelog agent".into(),
                local: AGENT_VERSION.into(),
                remote: version.to_string(),
            });
        }
        self.client.call("init", Vec::new())?;
        Ok(())
    }

    fn count(&self, method: &str) -> Result<usize> {
        let v = self.client.call(method, Vec::new())?;
        v.as_i64()
            .map(|n| n.max(0) as usize)
            .ok_or_else(|| Error::Repce(format!("{} returned {}", method, v)))
    }

    fn paths(&self, method: &str) -> Result<Vec<PathBuf>> {
        let v = self.client.call(method, Vec::new())?;
        let list = v
            .as_list()
            .ok_or_else(|| Error::Repce(format!("{} returned {}", method, v)))?;
        Ok(list
            .iter()
            .filter_map(Value::as_str)
            .map(PathBuf::from)
            .collect())
    }

    fn mark(&self, method: &str, changelog: &Path) -> Result<()> {
        self.client
            .call(method, vec![Value::Str(changelog.display().to_string())])?;
        Ok(())
    }
}

impl ChangelogQuery for AgentClient {
    fn register(&mut self, brick: &Path, workdir: &Path) -> Result<()> {
        self.client.call(
            "register",
            vec![
                Value::Str(brick.display().to_string()),
                Value::Str(workdir.display().to_string()),
            ],
        )?;
        Ok(())
    }

    fn scan(&mut self) -> Result<usize> {
        self.count("scan")
    }

    fn getchanges(&mut self) -> Result<Vec<PathBuf>> {
        self.paths("getchanges")
    }

    fn done(&mut self, changelog: &Path) -> Result<()> {
        self.mark("done", changelog)
    }

    fn history(&mut self, start: i64, end: i64, workers: usize) -> Result<HistoryRange> {
        let reply = self.client.call(
            "history",
            vec![Value::from(start), Value::from(end), Value::from(workers)],
        )?;
        match reply.as_list() {
            Some([published, actual_end]) => Ok(HistoryRange {
                published: published.as_i64().unwrap_or(0).max(0) as usize,
                actual_end: actual_end
                    .as_i64()
                    .ok_or_else(|| Error::Repce(format!("history returned {}", reply)))?,
            }),
            _ => Err(Error::Repce(format!("history returned {}", reply))),
        }
    }

    fn history_scan(&mut self) -> Result<usize> {
        self.count("history_scan")
    }

    fn history_getchanges(&mut self) -> Result<Vec<PathBuf>> {
        self.paths("history_getchanges")
    }

    fn history_done(&mut self, changelog: &Path) -> Result<()> {
        self.mark("history_done", changelog)
    }
}

impl Drop for AgentClient {
    fn drop(&mut self) {
        if let Some(child) = &self.child {
            let mut guard = child.lock().unwrap_or_else(|e| e.into_inner());
            let _ = guard.kill();
            let _ = guard.wait();
        }
    }
}

fn watch_agent(child: Arc<Mutex<Child>>) {
    let spawned = std::thread::Builder::new()
        .name("agent-watch".into())
        .spawn(move || loop {
            let status = {
                let mut guard = child.lock().unwrap_or_else(|e| e.into_inner());
                guard.try_wait()
            };
            match status {
                Ok(None) => std::thread::sleep(AGENT_POLL),
                Ok(Some(status)) => {
                    tracing::error!("changelog agent exited ({}), worker stopping", status);
                    std::process::exit(1);
                }
                Err(e) => {
                    tracing::error!("cannot wait for changelog agent: {}", e);
                    std::process::exit(1);
                }
            }
        });
    if let Err(e) = spawned {
        tracing::warn!("agent watcher not started: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixStream;
    use tempfile::tempdir;

    /// Agent served on a thread, reached through a socket pair
    fn in_process_agent() -> AgentClient {
        let (near, far) = UnixStream::pair().unwrap();
        let server = RepceServer::new(
            far.try_clone().unwrap(),
            far,
            Arc::new(agent_dispatcher(Box::new(FsChangelog::new()))),
            2,
        );
        std::thread::spawn(move || {
            let _ = server.service_loop();
        });
        AgentClient::over(near.try_clone().unwrap(), near).unwrap()
    }

    fn write_changelog(brick: &Path, ts: i64) {
        let dir = FsChangelog::changelog_dir(brick);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(format!("CHANGELOG.{}", ts)), "").unwrap();
    }

    #[test]
    fn test_agent_round_trip() {
        let brick = tempdir().unwrap();
        let work = tempdir().unwrap();
        for ts in [100, 115] {
            write_changelog(brick.path(), ts);
        }

        let mut agent = in_process_agent();
        agent.register(brick.path(), work.path()).unwrap();

        let range = agent.history(99, 120, 1).unwrap();
        assert_eq!(range.actual_end, 120);
        assert_eq!(range.published, 2);
        assert_eq!(agent.history_scan().unwrap(), 2);
        let pending = agent.history_getchanges().unwrap();
        agent.history_done(&pending[0]).unwrap();
        assert_eq!(agent.history_scan().unwrap(), 1);

        write_changelog(brick.path(), 130);
        assert_eq!(agent.scan().unwrap(), 1);
        let live = agent.getchanges().unwrap();
        assert!(live[0].ends_with("CHANGELOG.130"));
        agent.done(&live[0]).unwrap();
        assert_eq!(agent.scan().unwrap(), 0);
    }

    #[test]
    fn test_agent_errors_come_back_as_data() {
        let mut agent = in_process_agent();
        // nothing registered yet
        assert!(agent.scan().is_err());
        let work = tempdir().unwrap();
        agent.register(work.path(), &work.path().join("w")).unwrap();
        assert_eq!(agent.scan().unwrap(), 0);
    }
}
