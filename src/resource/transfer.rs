//! Data Transfer Engines
//!
//! Entry operations create the namespace on the secondary; the transfer
//! engine then ships file contents for a batch of brick-relative paths.

use std::fs;
use std::io::{ErrorKind, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::process::{Command, Stdio};

use super::link::TransferTarget;
use super::ssh::ssh_argv;
use crate::config::{TransferConfig, TransferEngineKind};
use crate::error::{Error, Result};

/// rsync exit code for source files that vanished mid-transfer
const RSYNC_VANISHED: i32 = 24;

/// Lines of stderr kept in error messages
const STDERR_TAIL: usize = 5;

/// Copies file data from a brick to a secondary
pub trait TransferEngine: Send + Sync {
    fn name(&self) -> &'static str;

    /// Transfer `files` (relative to `source`) to `target`
    fn sync(&self, source: &Path, files: &[String], target: &TransferTarget) -> Result<()>;
}

/// Pick the configured engine for `target`
pub fn engine_for(config: &TransferConfig, target: &TransferTarget) -> Result<Box<dyn TransferEngine>> {
    match (config.engine, target) {
        (TransferEngineKind::Rsync, _) => Ok(Box::new(RsyncEngine::new(config))),
        (TransferEngineKind::Copy, TransferTarget::Local(_)) => Ok(Box::new(CopyEngine)),
        (TransferEngineKind::Copy, TransferTarget::Remote { .. }) => Err(Error::Config(
            "transfer.engine = \"copy\" needs a local secondary".into(),
        )),
    }
}

/// External rsync fed a NUL-separated file list on stdin
pub struct RsyncEngine {
    command: String,
    options: Vec<String>,
    xattrs: bool,
    acls: bool,
    ssh: Vec<String>,
}

impl RsyncEngine {
    pub fn new(config: &TransferConfig) -> Self {
        Self {
            command: config.rsync_command.clone(),
            options: config.rsync_options.clone(),
            xattrs: config.sync_xattrs,
            acls: config.sync_acls,
            ssh: ssh_argv(config),
        }
    }

    /// Full command line for a transfer to `target`
    pub fn argv(&self, target: &TransferTarget) -> Vec<String> {
        let mut argv: Vec<String> = [
            self.command.as_str(),
            "-aR0",
            "--inplace",
            "--files-from=-",
            "--super",
            "--stats",
            "--numeric-ids",
            "--no-implied-dirs",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        if self.xattrs {
            argv.push("--xattrs".into());
        }
        if self.acls {
            argv.push("--acls".into());
        }
        argv.extend(self.options.iter().cloned());
        if let TransferTarget::Remote { .. } = target {
            argv.push("-e".into());
            argv.push(self.ssh.join(" "));
        }
        argv.push(".".into());
        argv.push(target.rsync_destination());
        argv
    }
}

impl TransferEngine for RsyncEngine {
    fn name(&self) -> &'static str {
        "rsync"
    }

    fn sync(&self, source: &Path, files: &[String], target: &TransferTarget) -> Result<()> {
        if files.is_empty() {
            return Ok(());
        }
        let argv = self.argv(target);
        tracing::debug!("rsync {} files to {}", files.len(), target.rsync_destination());

        let mut child = match Command::new(&argv[0])
            .args(&argv[1..])
            .current_dir(source)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
        {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(Error::MissingBinary(self.command.clone())),
            Err(e) => return Err(e.into()),
        };

        let mut list = Vec::new();
        for f in files {
            list.extend_from_slice(f.as_bytes());
            list.push(0);
        }
        let stdin = child.stdin.take();
        let writer = std::thread::spawn(move || -> std::io::Result<()> {
            if let Some(mut stdin) = stdin {
                stdin.write_all(&list)?;
            }
            Ok(())
        });

        let output = child.wait_with_output()?;
        if let Ok(Err(e)) = writer.join() {
            tracing::debug!("rsync closed its file list early: {}", e);
        }

        match output.status.code() {
            Some(0) => Ok(()),
            Some(RSYNC_VANISHED) => {
                tracing::debug!("some files vanished during rsync");
                Ok(())
            }
            _ => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                let lines: Vec<&str> = stderr.lines().collect();
                let tail = lines[lines.len().saturating_sub(STDERR_TAIL)..].join("; ");
                Err(Error::Transfer(format!("rsync exited with {}: {}", output.status, tail)))
            }
        }
    }
}

/// In-process copy for local secondaries
pub struct CopyEngine;

impl CopyEngine {
    fn copy_one(source: &Path, dest: &Path, rel: &str) -> Result<()> {
        let src = source.join(rel);
        let dst = dest.join(rel);
        let meta = match fs::symlink_metadata(&src) {
            Ok(m) => m,
            // removed on the primary since the changelog was written
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        if meta.is_dir() {
            fs::create_dir_all(&dst)?;
            fs::set_permissions(&dst, fs::Permissions::from_mode(meta.permissions().mode()))?;
        } else if meta.is_file() {
            if let Some(parent) = dst.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(&src, &dst)?;
        }
        // symlinks and special files are carried by entry operations
        Ok(())
    }
}

impl TransferEngine for CopyEngine {
    fn name(&self) -> &'static str {
        "copy"
    }

    fn sync(&self, source: &Path, files: &[String], target: &TransferTarget) -> Result<()> {
        let dest = match target {
            TransferTarget::Local(path) => path,
            TransferTarget::Remote { .. } => {
                return Err(Error::Transfer("copy engine cannot reach a remote secondary".into()))
            }
        };
        for rel in files {
            Self::copy_one(source, dest, rel)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::tempdir;

    #[test]
    fn test_rsync_argv() {
        let config = TransferConfig {
            sync_xattrs: true,
            rsync_options: vec!["--bwlimit=100".into()],
            ..TransferConfig::default()
        };
        let engine = RsyncEngine::new(&config);

        let local = engine.argv(&TransferTarget::Local(PathBuf::from("/mnt/replica")));
        assert_eq!(local[0], "rsync");
        assert_eq!(local[1], "-aR0");
        assert!(local.contains(&"--xattrs".to_string()));
        assert!(!local.contains(&"--acls".to_string()));
        assert!(!local.contains(&"-e".to_string()));
        assert_eq!(&local[local.len() - 3..], ["--bwlimit=100", ".", "/mnt/replica"]);

        let remote = engine.argv(&TransferTarget::Remote {
            address: "geo@backup1".into(),
            path: "/proc/42/cwd".into(),
        });
        let e = remote.iter().position(|a| a == "-e").unwrap();
        assert!(remote[e + 1].starts_with("ssh -oPasswordAuthentication=no"));
        assert!(remote[e + 1].ends_with("-p 22"));
        assert_eq!(remote.last().unwrap(), "geo@backup1:/proc/42/cwd");
    }

    #[test]
    fn test_missing_rsync_binary() {
        let dir = tempdir().unwrap();
        let config = TransferConfig {
            rsync_command: "/nonexistent/rsync".into(),
            ..TransferConfig::default()
        };
        let engine = RsyncEngine::new(&config);
        let err = engine
            .sync(dir.path(), &["a".into()], &TransferTarget::Local(dir.path().join("out")))
            .unwrap_err();
        assert!(matches!(err, Error::MissingBinary(_)));
    }

    #[test]
    fn test_copy_engine() {
        let src = tempdir().unwrap();
        let dst = tempdir().unwrap();
        fs::create_dir_all(src.path().join("d/e")).unwrap();
        fs::write(src.path().join("d/e/f"), b"payload").unwrap();
        fs::set_permissions(src.path().join("d/e/f"), fs::Permissions::from_mode(0o600)).unwrap();

        let target = TransferTarget::Local(dst.path().to_path_buf());
        CopyEngine
            .sync(src.path(), &["d/e/f".into(), "gone".into(), "d".into()], &target)
            .unwrap();

        assert_eq!(fs::read(dst.path().join("d/e/f")).unwrap(), b"payload");
        let mode = fs::metadata(dst.path().join("d/e/f")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert!(!dst.path().join("gone").exists());
    }

    #[test]
    fn test_engine_selection() {
        let config = TransferConfig {
            engine: TransferEngineKind::Copy,
            ..TransferConfig::default()
        };
        let local = TransferTarget::Local(PathBuf::from("/x"));
        let remote = TransferTarget::Remote {
            address: "h".into(),
            path: "/p".into(),
        };
        assert_eq!(engine_for(&config, &local).unwrap().name(), "copy");
        assert!(engine_for(&config, &remote).is_err());
        assert_eq!(engine_for(&TransferConfig::default(), &remote).unwrap().name(), "rsync");
    }
}
