//! Secondary Link
//!
//! The primary's handle on a connected secondary. Connecting happens in
//! two phases: [`PendingLink::spawn`] starts whatever process serves the
//! secondary, [`PendingLink::finish`] handshakes with it. A worker can
//! act on "the far end is starting" before committing to the link.
//!
//! A `file://` secondary is served in-process over a socket pair; a local
//! volume by a child `georep secondary`; anything behind ssh by the same
//! subcommand on the remote host with stdio carried by the tunnel.

use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use super::secondary::{EntryFailure, EntryOp, MetaOp, SecondaryService, SECONDARY_VERSION};
use super::ssh::ssh_argv;
use super::Resource;
use crate::config::GeorepConfig;
use crate::error::{Error, Result};
use crate::repce::{RepceClient, RepceServer, Value};

/// How often a dead secondary child is noticed
const CHILD_POLL: Duration = Duration::from_millis(500);

/// Where file data for a secondary is sent
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferTarget {
    /// Directory reachable from this host
    Local(PathBuf),
    /// Directory on a remote host
    Remote { address: String, path: String },
}

impl TransferTarget {
    /// Destination argument for rsync
    pub fn rsync_destination(&self) -> String {
        match self {
            TransferTarget::Local(path) => path.display().to_string(),
            TransferTarget::Remote { address, path } => format!("{}:{}", address, path),
        }
    }
}

enum Serving {
    InProcess(PathBuf),
    Child(Child),
}

/// A secondary whose server has been started but not yet handshaken
pub struct PendingLink {
    resource: Resource,
    serving: Serving,
}

impl PendingLink {
    /// Start serving `resource`
    pub fn spawn(resource: &Resource, config: &GeorepConfig) -> Result<Self> {
        let timeout = config.transfer.secondary_timeout_secs.to_string();
        let serving = match resource {
            Resource::File { path } => Serving::InProcess(path.clone()),
            Resource::Gluster { .. } => {
                let program = std::env::current_exe()?;
                let child = Command::new(program)
                    .arg("secondary")
                    .arg(resource.canonical_url())
                    .arg("--timeout")
                    .arg(&timeout)
                    .stdin(Stdio::piped())
                    .stdout(Stdio::piped())
                    .stderr(Stdio::inherit())
                    .spawn()?;
                Serving::Child(child)
            }
            Resource::Ssh { .. } => {
                let argv = ssh_argv(&config.transfer);
                let address = resource.remote_address().unwrap_or_default();
                tracing::info!("starting ssh connection to {}", address);
                let child = match Command::new(&argv[0])
                    .args(&argv[1..])
                    .arg(&address)
                    .arg(&config.transfer.remote_program)
                    .arg("secondary")
                    .arg(resource.inner_url())
                    .arg("--timeout")
                    .arg(&timeout)
                    .stdin(Stdio::piped())
                    .stdout(Stdio::piped())
                    .stderr(Stdio::inherit())
                    .spawn()
                {
                    Ok(c) => c,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        return Err(Error::MissingBinary(argv[0].clone()))
                    }
                    Err(e) => return Err(e.into()),
                };
                Serving::Child(child)
            }
        };
        Ok(Self {
            resource: resource.clone(),
            serving,
        })
    }

    /// Handshake with the started server
    pub fn finish(self, config: &GeorepConfig) -> Result<SecondaryLink> {
        let started = std::time::Instant::now();
        let lost = Arc::new(AtomicBool::new(false));
        let stop = Arc::new(AtomicBool::new(false));

        let link = match self.serving {
            Serving::InProcess(root) => {
                if !root.is_dir() {
                    return Err(Error::Resource(format!("{} is not a directory", root.display())));
                }
                let service = Arc::new(SecondaryService::new(root.clone()));
                let (near, far) = UnixStream::pair()?;
                let server = RepceServer::new(
                    far.try_clone()?,
                    far,
                    Arc::new(SecondaryService::dispatcher(&service)),
                    config.repce.workers,
                );
                let handle = std::thread::Builder::new()
                    .name("secondary-local".into())
                    .spawn(move || {
                        if let Err(e) = server.service_loop() {
                            tracing::error!("local secondary stopped: {}", e);
                        }
                    })?;
                let socket = near.try_clone()?;
                let client = RepceClient::new(near.try_clone()?, near)?;
                check_versions(&client)?;
                SecondaryLink {
                    client: Arc::new(client),
                    resource: self.resource,
                    target: TransferTarget::Local(root),
                    lost,
                    stop,
                    child: None,
                    socket: Some(socket),
                    _server: Some(handle),
                }
            }
            Serving::Child(mut child) => {
                let stdout = child
                    .stdout
                    .take()
                    .ok_or_else(|| Error::Resource("secondary child has no stdout".into()))?;
                let stdin = child
                    .stdin
                    .take()
                    .ok_or_else(|| Error::Resource("secondary child has no stdin".into()))?;
                let client = RepceClient::new(stdout, stdin)?;
                let child = Arc::new(Mutex::new(child));
                watch_child(Arc::clone(&child), Arc::clone(&lost), Arc::clone(&stop));

                check_versions(&client)?;
                let pid = client
                    .call("pid", Vec::new())?
                    .as_i64()
                    .ok_or_else(|| Error::Resource("secondary returned no pid".into()))?;
                let path = format!("/proc/{}/cwd", pid);
                let target = match self.resource.remote_address() {
                    Some(address) => TransferTarget::Remote { address, path },
                    None => TransferTarget::Local(PathBuf::from(path)),
                };
                SecondaryLink {
                    client: Arc::new(client),
                    resource: self.resource,
                    target,
                    lost,
                    stop,
                    child: Some(child),
                    socket: None,
                    _server: None,
                }
            }
        };

        tracing::info!(
            "connected to secondary {} in {:.3}s",
            link.resource,
            started.elapsed().as_secs_f64()
        );
        Ok(link)
    }
}

/// Protocol and service version checks done before any real call
fn check_versions(client: &RepceClient) -> Result<()> {
    client.handshake()?;
    let version = client.call("version", Vec::new())?;
    if version.as_str() != Some(SECONDARY_VERSION) {
        return Err(Error::VersionMismatch {
            what: "secondary".into(),
            local: SECONDARY_VERSION.into(),
            remote: version.to_string(),
        });
    }
    Ok(())
}

fn watch_child(child: Arc<Mutex<Child>>, lost: Arc<AtomicBool>, stop: Arc<AtomicBool>) {
    let spawned = std::thread::Builder::new()
        .name("secondary-watch".into())
        .spawn(move || loop {
            if stop.load(Ordering::Relaxed) {
                break;
            }
            let status = {
                let mut guard = child.lock().unwrap_or_else(|e| e.into_inner());
                guard.try_wait()
            };
            match status {
                Ok(Some(status)) => {
                    tracing::error!("secondary process exited: {}", status);
                    lost.store(true, Ordering::Relaxed);
                    break;
                }
                Ok(None) => std::thread::sleep(CHILD_POLL),
                Err(e) => {
                    tracing::error!("cannot wait for secondary process: {}", e);
                    lost.store(true, Ordering::Relaxed);
                    break;
                }
            }
        });
    if let Err(e) = spawned {
        tracing::warn!("secondary watcher not started: {}", e);
    }
}

/// Connected secondary
pub struct SecondaryLink {
    client: Arc<RepceClient>,
    resource: Resource,
    target: TransferTarget,
    lost: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
    child: Option<Arc<Mutex<Child>>>,
    /// Near end of an in-process secondary's socket pair
    socket: Option<UnixStream>,
    _server: Option<JoinHandle<()>>,
}

impl SecondaryLink {
    /// Spawn and handshake in one step
    pub fn connect(resource: &Resource, config: &GeorepConfig) -> Result<Self> {
        PendingLink::spawn(resource, config)?.finish(config)
    }

    pub fn resource(&self) -> &Resource {
        &self.resource
    }

    /// Where the transfer engine should send data
    pub fn target(&self) -> &TransferTarget {
        &self.target
    }

    /// Fail once the secondary or its transport is known to be gone
    pub fn ensure_alive(&self) -> Result<()> {
        if self.lost.load(Ordering::Relaxed) {
            return Err(Error::PeerDisconnected);
        }
        Ok(())
    }

    pub fn pid(&self) -> Result<i64> {
        self.ensure_alive()?;
        self.client
            .call("pid", Vec::new())?
            .as_i64()
            .ok_or_else(|| Error::Resource("secondary returned no pid".into()))
    }

    pub fn keep_alive(&self) -> Result<i64> {
        self.ensure_alive()?;
        self.client
            .call("keep_alive", Vec::new())?
            .as_i64()
            .ok_or_else(|| Error::Resource("bad keep-alive reply".into()))
    }

    pub fn entry_ops(&self, ops: &[EntryOp]) -> Result<Vec<EntryFailure>> {
        if ops.is_empty() {
            return Ok(Vec::new());
        }
        self.ensure_alive()?;
        let arg = Value::List(ops.iter().map(EntryOp::to_value).collect());
        let reply = self.client.call("entry_ops", vec![arg])?;
        Ok(failures_from(&reply))
    }

    pub fn meta_ops(&self, ops: &[MetaOp]) -> Result<Vec<EntryFailure>> {
        if ops.is_empty() {
            return Ok(Vec::new());
        }
        self.ensure_alive()?;
        let arg = Value::List(ops.iter().map(MetaOp::to_value).collect());
        let reply = self.client.call("meta_ops", vec![arg])?;
        Ok(failures_from(&reply))
    }

    /// Send keep-alives every `interval` until the link is dropped
    pub fn start_keep_alive(&self, interval: Duration) {
        let client = Arc::clone(&self.client);
        let lost = Arc::clone(&self.lost);
        let stop = Arc::clone(&self.stop);
        let spawned = std::thread::Builder::new()
            .name("keep-alive".into())
            .spawn(move || {
                while !stop.load(Ordering::Relaxed) && !lost.load(Ordering::Relaxed) {
                    std::thread::sleep(interval);
                    let on_reply = Arc::clone(&lost);
                    let pushed = client.push(
                        "keep_alive",
                        Vec::new(),
                        Some(Box::new(move |result: Result<Value>| {
                            if let Err(e) = result {
                                tracing::error!("keep-alive failed: {}", e);
                                on_reply.store(true, Ordering::Relaxed);
                            }
                        })),
                    );
                    if let Err(e) = pushed {
                        tracing::error!("keep-alive could not be sent: {}", e);
                        lost.store(true, Ordering::Relaxed);
                    }
                }
            });
        if let Err(e) = spawned {
            tracing::warn!("keep-alive thread not started: {}", e);
        }
    }
}

impl Drop for SecondaryLink {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(child) = &self.child {
            let mut guard = child.lock().unwrap_or_else(|e| e.into_inner());
            let _ = guard.kill();
            let _ = guard.wait();
        }
        if let Some(socket) = &self.socket {
            let _ = socket.shutdown(std::net::Shutdown::Both);
        }
    }
}

fn failures_from(reply: &Value) -> Vec<EntryFailure> {
    reply
        .as_list()
        .map(|l| l.iter().map(EntryFailure::from_value).collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_file_secondary_in_process() {
        let dir = tempdir().unwrap();
        let url = format!("file://{}", dir.path().display());
        let resource = Resource::parse(&url).unwrap();
        let link = SecondaryLink::connect(&resource, &GeorepConfig::default()).unwrap();

        assert_eq!(link.target(), &TransferTarget::Local(dir.path().to_path_buf()));
        assert_eq!(link.pid().unwrap(), std::process::id() as i64);
        assert_eq!(link.keep_alive().unwrap(), 1);

        let failures = link
            .entry_ops(&[
                EntryOp::Mkdir {
                    path: "d".into(),
                    mode: 0o755,
                    uid: 0,
                    gid: 0,
                },
                EntryOp::Remove { path: "../x".into() },
            ])
            .unwrap();
        assert_eq!(failures.len(), 1);
        assert!(dir.path().join("d").is_dir());
        link.ensure_alive().unwrap();
    }

    #[test]
    fn test_missing_directory_fails_to_connect() {
        let resource = Resource::parse("file:///nonexistent/georep/replica").unwrap();
        assert!(SecondaryLink::connect(&resource, &GeorepConfig::default()).is_err());
    }

    #[test]
    fn test_transfer_target_destination() {
        assert_eq!(TransferTarget::Local(PathBuf::from("/a")).rsync_destination(), "/a");
        let remote = TransferTarget::Remote {
            address: "u@h".into(),
            path: "/proc/1/cwd".into(),
        };
        assert_eq!(remote.rsync_destination(), "u@h:/proc/1/cwd");
    }
}
