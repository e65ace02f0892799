//! Per-Brick Supervision
//!
//! Spawns the worker for one brick with the write end of a readiness
//! pipe, waits for it to connect, then waits for it to exit and decides
//! whether to respawn. A worker that does not connect within the
//! connection timeout is killed.

use std::os::unix::io::RawFd;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};
use nix::unistd::{close, pipe2};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

use super::board::StateBoard;
use super::secondary::choose_secondary;
use crate::config::{BrickConfig, ConfigHandle, GeorepConfig};
use crate::error::{Error, ErrorClass, Result};
use crate::events::{Event, EventKind, EventPublisher};
use crate::status::WorkerState;

/// What a worker's exit means for supervision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    /// Cooperative restart request (SIGUSR1)
    Restart,
    /// Failed but worth retrying
    Faulty,
    /// Unrecoverable; the whole session stops
    Inconsistent(i32),
}

/// Classify a worker exit status
pub fn classify_exit(status: &ExitStatus) -> ExitKind {
    if status.signal() == Some(libc::SIGUSR1) {
        return ExitKind::Restart;
    }
    match status.code() {
        // killed by any other signal counts as a plain failure
        None | Some(0) | Some(1) => ExitKind::Faulty,
        Some(code) => ExitKind::Inconsistent(code),
    }
}

/// Supervision loop for one brick
pub struct Supervisor {
    pub(super) idx: usize,
    pub(super) brick: BrickConfig,
    pub(super) config: Arc<ConfigHandle>,
    pub(super) board: Arc<StateBoard>,
    pub(super) events: EventPublisher,
    pub(super) cancel: CancellationToken,
    /// Held while a pipe end is inheritable
    pub(super) spawn_lock: Arc<tokio::sync::Mutex<()>>,
}

impl Supervisor {
    /// Respawn the worker until it exits inconsistently or supervision is cancelled
    pub async fn run(self) -> Result<Option<i32>> {
        let brick = self.brick.path.clone();
        loop {
            if self.cancel.is_cancelled() {
                return Ok(None);
            }
            let config = self.config.get();
            let secondary = choose_secondary(&config, self.idx, &self.brick).await;
            self.mark(WorkerState::Initializing).await?;

            let status = match self.run_once(&config, &secondary).await? {
                Some(status) => status,
                None => return Ok(None),
            };

            match classify_exit(&status) {
                ExitKind::Restart => {
                    tracing::info!("worker for {} asked for a restart", brick.display());
                }
                ExitKind::Faulty => {
                    tracing::warn!("worker for {} exited ({}), marking faulty", brick.display(), status);
                    self.mark(WorkerState::Faulty).await?;
                    self.events.publish(
                        Event::new(EventKind::Faulty)
                            .with("primary_volume", &config.session.primary_volume)
                            .with("brick_path", brick.display())
                            .with("secondary", &secondary)
                            .with("current_secondary_host", host_of(&secondary)),
                    );
                }
                ExitKind::Inconsistent(code) => {
                    tracing::error!(
                        "worker for {} exited with {}, session is inconsistent",
                        brick.display(),
                        code
                    );
                    self.mark(WorkerState::Inconsistent).await?;
                    return Ok(Some(code));
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(config.restart_backoff()) => {}
                _ = self.cancel.cancelled() => return Ok(None),
            }
        }
    }

    /// Publish this brick's state; a busy status file only costs the write
    async fn mark(&self, state: WorkerState) -> Result<()> {
        match self.board.set(&self.brick.path, state).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_retryable() => {
                tracing::warn!(
                    "status of {} not written ({}): {}",
                    self.brick.path.display(),
                    state,
                    e
                );
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Full command line for a worker
    fn command(&self, config: &GeorepConfig, secondary: &str, feedback_fd: RawFd) -> Result<Command> {
        let program = match &config.monitor.worker_program {
            Some(p) => p.clone(),
            None => std::env::current_exe()?,
        };
        let mut cmd = Command::new(program);
        cmd.args(&config.monitor.worker_args);
        if let Some(path) = self.config.path() {
            cmd.arg("--config").arg(path);
        }
        cmd.arg("--brick")
            .arg(&self.brick.path)
            .arg("--secondary")
            .arg(secondary)
            .arg("--feedback-fd")
            .arg(feedback_fd.to_string())
            .stdin(Stdio::null())
            .kill_on_drop(true);
        Ok(cmd)
    }

    /// Spawn with the feedback pipe's write end as the only extra inherited descriptor
    async fn spawn(&self, config: &GeorepConfig, secondary: &str) -> Result<(Child, RawFd)> {
        let _guard = self.spawn_lock.lock().await;
        let (read_end, write_end) = pipe2(OFlag::O_CLOEXEC)?;

        let spawned = fcntl(write_end, FcntlArg::F_SETFD(FdFlag::empty()))
            .map_err(Error::from)
            .and_then(|_| self.command(config, secondary, write_end))
            .and_then(|mut cmd| cmd.spawn().map_err(Error::from));
        if let Err(e) = close(write_end) {
            tracing::debug!("closing feedback write end: {}", e);
        }
        match spawned {
            Ok(child) => Ok((child, read_end)),
            Err(e) => {
                let _ = close(read_end);
                Err(e)
            }
        }
    }

    /// One worker lifetime; `None` when cancelled
    async fn run_once(&self, config: &GeorepConfig, secondary: &str) -> Result<Option<ExitStatus>> {
        let brick = self.brick.path.display().to_string();
        tracing::info!("starting worker for {} (secondary {})", brick, secondary);

        let (mut child, feedback) = match self.spawn(config, secondary).await {
            Ok(spawned) => spawned,
            Err(e) if e.class() == ErrorClass::OperatorFatal => return Err(e),
            Err(e) => {
                tracing::error!("cannot start worker for {}: {}", brick, e);
                return Ok(Some(ExitStatus::from_raw(1 << 8)));
            }
        };
        let started = Instant::now();
        let conn_timeout = config.connection_timeout();

        let ready = tokio::select! {
            r = tokio::time::timeout(conn_timeout, wait_closed(feedback)) => r,
            _ = self.cancel.cancelled() => {
                stop(&mut child).await;
                return Ok(None);
            }
        };

        let status = match ready {
            Ok(_) => match child.try_wait()? {
                Some(status) => {
                    tracing::info!("worker for {} died before establishing connection", brick);
                    Some(status)
                }
                None => {
                    let window = conn_timeout.saturating_sub(started.elapsed());
                    tokio::select! {
                        r = tokio::time::timeout(window, child.wait()) => match r {
                            Ok(status) => {
                                tracing::info!("worker for {} died in startup phase", brick);
                                Some(status?)
                            }
                            Err(_) => None,
                        },
                        _ = self.cancel.cancelled() => {
                            stop(&mut child).await;
                            return Ok(None);
                        }
                    }
                }
            },
            Err(_) => {
                tracing::warn!(
                    "worker for {} not confirmed in {}s, aborting it",
                    brick,
                    conn_timeout.as_secs()
                );
                Some(stop(&mut child).await.unwrap_or_else(|| ExitStatus::from_raw(libc::SIGKILL)))
            }
        };

        if let Some(status) = status {
            return Ok(Some(status));
        }

        tracing::info!("worker for {} connected", brick);
        self.mark(WorkerState::Stable).await?;
        tokio::select! {
            status = child.wait() => Ok(Some(status?)),
            _ = self.cancel.cancelled() => {
                stop(&mut child).await;
                Ok(None)
            }
        }
    }
}

/// Block until every writer of `fd` has closed it, then close it
async fn wait_closed(fd: RawFd) -> Result<()> {
    tokio::task::spawn_blocking(move || {
        let mut buf = [0u8; 64];
        let outcome = loop {
            match nix::unistd::read(fd, &mut buf) {
                Ok(0) => break Ok(()),
                Ok(_) => continue,
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => break Err(Error::from(e)),
            }
        };
        let _ = close(fd);
        outcome
    })
    .await
    .map_err(|e| Error::Internal(format!("feedback reader failed: {}", e)))?
}

/// Kill a worker and reap it
async fn stop(child: &mut Child) -> Option<ExitStatus> {
    if let Err(e) = child.start_kill() {
        tracing::debug!("kill: {}", e);
    }
    match tokio::time::timeout(Duration::from_secs(5), child.wait()).await {
        Ok(Ok(status)) => Some(status),
        _ => None,
    }
}

fn host_of(url: &str) -> String {
    crate::resource::Resource::parse(url)
        .ok()
        .and_then(|r| r.remote_host().map(str::to_string))
        .unwrap_or_else(|| "localhost".to_string())
}
