//! Secondary Server
//!
//! The far end of a replication link. It connects its inner resource
//! (a directory or a freshly mounted volume), then serves entry and
//! metadata operations over Repce. Every operation is addressed by a
//! path relative to the connected root and is safe to replay: creating
//! what exists or removing what is gone succeeds quietly.

use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::{symlink, PermissionsExt};
use std::path::{Component, Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nix::unistd::{fchownat, FchownatFlags, Gid, Uid};

use super::Resource;
use crate::config::GeorepConfig;
use crate::error::{Error, Result};
use crate::repce::{Dispatcher, RepceServer, Value};

/// Version reported to the primary during connect
pub const SECONDARY_VERSION: &str = "1.0";

/// One namespace operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryOp {
    Mkdir { path: String, mode: u32, uid: u32, gid: u32 },
    Create { path: String, mode: u32, uid: u32, gid: u32 },
    Symlink { path: String, target: String },
    Link { path: String, source: String },
    Rename { from: String, to: String },
    Remove { path: String },
}

impl EntryOp {
    /// Operation name on the wire
    pub fn name(&self) -> &'static str {
        match self {
            EntryOp::Mkdir { .. } => "MKDIR",
            EntryOp::Create { .. } => "CREATE",
            EntryOp::Symlink { .. } => "SYMLINK",
            EntryOp::Link { .. } => "LINK",
            EntryOp::Rename { .. } => "RENAME",
            EntryOp::Remove { .. } => "REMOVE",
        }
    }

    /// Path the operation is reported under
    pub fn path(&self) -> &str {
        match self {
            EntryOp::Mkdir { path, .. }
            | EntryOp::Create { path, .. }
            | EntryOp::Symlink { path, .. }
            | EntryOp::Link { path, .. }
            | EntryOp::Remove { path } => path,
            EntryOp::Rename { from, .. } => from,
        }
    }

    pub fn to_value(&self) -> Value {
        let mut pairs: Vec<(&str, Value)> = vec![("op", self.name().into())];
        match self {
            EntryOp::Mkdir { path, mode, uid, gid } | EntryOp::Create { path, mode, uid, gid } => {
                pairs.push(("path", path.as_str().into()));
                pairs.push(("mode", (*mode).into()));
                pairs.push(("uid", (*uid).into()));
                pairs.push(("gid", (*gid).into()));
            }
            EntryOp::Symlink { path, target } => {
                pairs.push(("path", path.as_str().into()));
                pairs.push(("target", target.as_str().into()));
            }
            EntryOp::Link { path, source } => {
                pairs.push(("path", path.as_str().into()));
                pairs.push(("source", source.as_str().into()));
            }
            EntryOp::Rename { from, to } => {
                pairs.push(("from", from.as_str().into()));
                pairs.push(("to", to.as_str().into()));
            }
            EntryOp::Remove { path } => pairs.push(("path", path.as_str().into())),
        }
        Value::map(pairs)
    }

    pub fn from_value(v: &Value) -> Result<Self> {
        let text = |key: &str| -> Result<String> {
            v.get_str(key)
                .map(str::to_string)
                .ok_or_else(|| Error::Repce(format!("entry op without {}: {}", key, v)))
        };
        let num = |key: &str| -> u32 { v.get_i64(key).unwrap_or(0) as u32 };

        let op = text("op")?;
        Ok(match op.as_str() {
            "MKDIR" => EntryOp::Mkdir {
                path: text("path")?,
                mode: num("mode"),
                uid: num("uid"),
                gid: num("gid"),
            },
            "CREATE" => EntryOp::Create {
                path: text("path")?,
                mode: num("mode"),
                uid: num("uid"),
                gid: num("gid"),
            },
            "SYMLINK" => EntryOp::Symlink {
                path: text("path")?,
                target: text("target")?,
            },
            "LINK" => EntryOp::Link {
                path: text("path")?,
                source: text("source")?,
            },
            "RENAME" => EntryOp::Rename {
                from: text("from")?,
                to: text("to")?,
            },
            "REMOVE" => EntryOp::Remove { path: text("path")? },
            other => return Err(Error::Repce(format!("unknown entry op {}", other))),
        })
    }
}

/// Attribute update for one path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaOp {
    pub path: String,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
}

impl MetaOp {
    pub fn to_value(&self) -> Value {
        Value::map([
            ("path", self.path.as_str().into()),
            ("mode", self.mode.into()),
            ("uid", self.uid.into()),
            ("gid", self.gid.into()),
        ])
    }

    pub fn from_value(v: &Value) -> Result<Self> {
        let path = v
            .get_str("path")
            .ok_or_else(|| Error::Repce(format!("meta op without path: {}", v)))?;
        Ok(Self {
            path: path.to_string(),
            mode: v.get_i64("mode").unwrap_or(0) as u32,
            uid: v.get_i64("uid").unwrap_or(0) as u32,
            gid: v.get_i64("gid").unwrap_or(0) as u32,
        })
    }
}

/// An operation the secondary could not apply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryFailure {
    pub op: String,
    pub path: String,
    pub error: String,
}

impl EntryFailure {
    fn new(op: &str, path: &str, error: impl ToString) -> Self {
        Self {
            op: op.to_string(),
            path: path.to_string(),
            error: error.to_string(),
        }
    }

    pub fn to_value(&self) -> Value {
        Value::map([
            ("op", self.op.as_str().into()),
            ("path", self.path.as_str().into()),
            ("error", self.error.as_str().into()),
        ])
    }

    pub fn from_value(v: &Value) -> Self {
        Self {
            op: v.get_str("op").unwrap_or_default().to_string(),
            path: v.get_str("path").unwrap_or_default().to_string(),
            error: v.get_str("error").unwrap_or_default().to_string(),
        }
    }
}

impl std::fmt::Display for EntryFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}: {}", self.op, self.path, self.error)
    }
}

/// Resolve `rel` under `root`, refusing anything that would escape it
fn guarded(root: &Path, rel: &str) -> Result<PathBuf> {
    let rel_path = Path::new(rel);
    let mut out = root.to_path_buf();
    let mut depth = 0usize;
    for component in rel_path.components() {
        match component {
            Component::Normal(c) => {
                out.push(c);
                depth += 1;
            }
            Component::CurDir => {}
            _ => return Err(Error::Resource(format!("path {} escapes the secondary root", rel))),
        }
    }
    if depth == 0 {
        return Err(Error::Resource(format!("empty path {:?}", rel)));
    }
    Ok(out)
}

fn set_owner(path: &Path, uid: u32, gid: u32) {
    let res = fchownat(
        None,
        path,
        Some(Uid::from_raw(uid)),
        Some(Gid::from_raw(gid)),
        FchownatFlags::NoFollowSymlink,
    );
    if let Err(e) = res {
        // unprivileged secondaries keep their own ownership
        tracing::trace!("chown {} to {}:{} skipped: {}", path.display(), uid, gid, e);
    }
}

fn set_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    if mode == 0 {
        return Ok(());
    }
    fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o7777))
}

fn ensure_parent(path: &Path) -> std::io::Result<()> {
    match path.parent() {
        Some(parent) => fs::create_dir_all(parent),
        None => Ok(()),
    }
}

/// Serving side of the secondary link
pub struct SecondaryService {
    root: PathBuf,
    keep_alive: AtomicU64,
}

impl SecondaryService {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            keep_alive: AtomicU64::new(0),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Keep-alive messages received so far
    pub fn keep_alive_count(&self) -> u64 {
        self.keep_alive.load(Ordering::Relaxed)
    }

    fn keep_alive(&self) -> u64 {
        self.keep_alive.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Apply entry operations in order, returning the ones that failed
    pub fn entry_ops(&self, ops: &[EntryOp]) -> Vec<EntryFailure> {
        let mut failures = Vec::new();
        for op in ops {
            if let Err(e) = self.apply_entry(op) {
                tracing::warn!("entry op {} {} failed: {}", op.name(), op.path(), e);
                failures.push(EntryFailure::new(op.name(), op.path(), e));
            }
        }
        failures
    }

    fn apply_entry(&self, op: &EntryOp) -> Result<()> {
        match op {
            EntryOp::Mkdir { path, mode, uid, gid } => {
                let p = guarded(&self.root, path)?;
                match fs::symlink_metadata(&p) {
                    Ok(m) if m.is_dir() => return Ok(()),
                    Ok(_) => fs::remove_file(&p)?,
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
                fs::create_dir_all(&p)?;
                set_mode(&p, *mode)?;
                set_owner(&p, *uid, *gid);
            }
            EntryOp::Create { path, mode, uid, gid } => {
                let p = guarded(&self.root, path)?;
                if fs::symlink_metadata(&p).is_ok() {
                    return Ok(());
                }
                ensure_parent(&p)?;
                fs::OpenOptions::new().write(true).create_new(true).open(&p)?;
                set_mode(&p, *mode)?;
                set_owner(&p, *uid, *gid);
            }
            EntryOp::Symlink { path, target } => {
                let p = guarded(&self.root, path)?;
                match fs::read_link(&p) {
                    Ok(existing) if existing == Path::new(target) => return Ok(()),
                    Ok(_) => fs::remove_file(&p)?,
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) if e.kind() == ErrorKind::InvalidInput => fs::remove_file(&p)?,
                    Err(e) => return Err(e.into()),
                }
                ensure_parent(&p)?;
                symlink(target, &p)?;
            }
            EntryOp::Link { path, source } => {
                let p = guarded(&self.root, path)?;
                if fs::symlink_metadata(&p).is_ok() {
                    return Ok(());
                }
                let src = guarded(&self.root, source)?;
                ensure_parent(&p)?;
                fs::hard_link(&src, &p)?;
            }
            EntryOp::Rename { from, to } => {
                let src = guarded(&self.root, from)?;
                let dst = guarded(&self.root, to)?;
                if fs::symlink_metadata(&src).is_err() {
                    if fs::symlink_metadata(&dst).is_ok() {
                        return Ok(());
                    }
                    return Err(Error::Resource(format!("rename source {} is missing", from)));
                }
                ensure_parent(&dst)?;
                fs::rename(&src, &dst)?;
            }
            EntryOp::Remove { path } => {
                let p = guarded(&self.root, path)?;
                match fs::symlink_metadata(&p) {
                    Ok(m) if m.is_dir() => fs::remove_dir(&p)?,
                    Ok(_) => fs::remove_file(&p)?,
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
        Ok(())
    }

    /// Apply attribute updates; vanished paths are skipped
    pub fn meta_ops(&self, ops: &[MetaOp]) -> Vec<EntryFailure> {
        let mut failures = Vec::new();
        for op in ops {
            let p = match guarded(&self.root, &op.path) {
                Ok(p) => p,
                Err(e) => {
                    failures.push(EntryFailure::new("META", &op.path, e));
                    continue;
                }
            };
            let meta = match fs::symlink_metadata(&p) {
                Ok(m) => m,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => {
                    failures.push(EntryFailure::new("META", &op.path, e));
                    continue;
                }
            };
            set_owner(&p, op.uid, op.gid);
            // chmod on a symlink would change its target
            if !meta.file_type().is_symlink() {
                if let Err(e) = set_mode(&p, op.mode) {
                    failures.push(EntryFailure::new("META", &op.path, e));
                }
            }
        }
        failures
    }

    /// Method table served to the primary
    pub fn dispatcher(service: &Arc<Self>) -> Dispatcher {
        let entry = Arc::clone(service);
        let meta = Arc::clone(service);
        let alive = Arc::clone(service);
        Dispatcher::new()
            .register("version", |_| Ok(Value::from(SECONDARY_VERSION)))
            .register("pid", |_| Ok(Value::from(std::process::id())))
            .register("keep_alive", move |_| Ok(Value::Int(alive.keep_alive() as i64)))
            .register("entry_ops", move |args| {
                let ops = list_arg(args)?
                    .iter()
                    .map(EntryOp::from_value)
                    .collect::<Result<Vec<_>>>()?;
                let failures = entry.entry_ops(&ops);
                Ok(Value::List(failures.iter().map(EntryFailure::to_value).collect()))
            })
            .register("meta_ops", move |args| {
                let ops = list_arg(args)?
                    .iter()
                    .map(MetaOp::from_value)
                    .collect::<Result<Vec<_>>>()?;
                let failures = meta.meta_ops(&ops);
                Ok(Value::List(failures.iter().map(EntryFailure::to_value).collect()))
            })
    }
}

fn list_arg(args: &[Value]) -> Result<&[Value]> {
    args.first()
        .and_then(Value::as_list)
        .ok_or_else(|| Error::Repce("expected a list argument".into()))
}

/// Mount `volume` privately, step into it and detach the mount point.
///
/// The mount stays alive through the process working directory, which is
/// returned as `/proc/<pid>/cwd`.
pub fn mount_volume(host: &str, volume: &str, log_file: &Path) -> Result<PathBuf> {
    let mnt = std::env::temp_dir().join(format!("georep-mnt-{}", uuid::Uuid::new_v4()));
    fs::create_dir_all(&mnt)?;

    let status = Command::new("glusterfs")
        .arg("--volfile-server")
        .arg(host)
        .arg("--volfile-id")
        .arg(volume)
        .arg("--client-pid=-1")
        .arg("--log-level")
        .arg("INFO")
        .arg("--log-file")
        .arg(log_file)
        .arg(&mnt)
        .stdin(Stdio::null())
        .status();
    let status = match status {
        Ok(s) => s,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            let _ = fs::remove_dir(&mnt);
            return Err(Error::MissingBinary("glusterfs".into()));
        }
        Err(e) => return Err(e.into()),
    };
    if !status.success() {
        let _ = fs::remove_dir(&mnt);
        return Err(Error::Mount {
            volume: volume.to_string(),
            reason: format!("glusterfs exited with {}", status),
        });
    }

    nix::unistd::chdir(&mnt)?;
    match Command::new("umount").arg("-l").arg(&mnt).status() {
        Ok(s) if s.success() => {
            let _ = fs::remove_dir(&mnt);
        }
        Ok(s) => tracing::warn!("lazy unmount of {} exited with {}", mnt.display(), s),
        Err(e) => tracing::warn!("lazy unmount of {} failed: {}", mnt.display(), e),
    }
    Ok(PathBuf::from(format!("/proc/{}/cwd", std::process::id())))
}

/// Connect the inner resource of a secondary process, returning its root
pub fn connect_inner(resource: &Resource, config: &GeorepConfig) -> Result<PathBuf> {
    match resource {
        Resource::File { path } => {
            nix::unistd::chdir(path.as_path())?;
            Ok(path.clone())
        }
        Resource::Gluster { host, volume } => {
            let log_file = config
                .session
                .working_dir
                .join(format!("secondary-{}.gluster.log", volume));
            if let Some(parent) = log_file.parent() {
                fs::create_dir_all(parent)?;
            }
            mount_volume(host, volume, &log_file)
        }
        Resource::Ssh { .. } => Err(Error::UnsupportedUrl(format!(
            "{} cannot be served as a secondary",
            resource
        ))),
    }
}

/// Stop the process when keep-alives stop arriving for `timeout`
fn spawn_idle_watchdog(service: Arc<SecondaryService>, timeout: Duration) {
    let spawned = std::thread::Builder::new()
        .name("secondary-idle".into())
        .spawn(move || {
            let mut seen = service.keep_alive_count();
            loop {
                std::thread::sleep(timeout);
                let now = service.keep_alive_count();
                if now == seen {
                    tracing::error!("no keep-alive for {:?}, secondary exiting", timeout);
                    std::process::exit(1);
                }
                seen = now;
            }
        });
    if let Err(e) = spawned {
        tracing::warn!("idle watchdog not started: {}", e);
    }
}

/// Run a secondary for `url` on this process's stdin/stdout
pub fn serve_stdio(url: &str, config: &GeorepConfig) -> Result<()> {
    let resource = Resource::parse(url)?;
    let root = connect_inner(&resource, config)?;
    tracing::info!("secondary {} serving from {}", resource, root.display());

    let service = Arc::new(SecondaryService::new(root));
    if config.transfer.secondary_timeout_secs > 0 {
        spawn_idle_watchdog(
            Arc::clone(&service),
            Duration::from_secs(config.transfer.secondary_timeout_secs),
        );
    }

    let server = RepceServer::new(
        std::io::stdin(),
        std::io::stdout(),
        Arc::new(SecondaryService::dispatcher(&service)),
        config.repce.workers,
    );
    server.service_loop()
}
