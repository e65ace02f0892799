//! georep Configuration
//!
//! This module provides configuration structures for the geo-replication
//! monitor, its workers and the find tool. Components receive an
//! `Arc<GeorepConfig>` at construction; a reload builds a fresh value and
//! swaps the reference held by [`ConfigHandle`].

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// Main georep configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeorepConfig {
    /// Primary/secondary pairing
    #[serde(default)]
    pub session: SessionConfig,

    /// Local bricks supervised by the monitor
    #[serde(default)]
    pub bricks: Vec<BrickConfig>,

    /// Monitor supervision settings
    #[serde(default)]
    pub monitor: MonitorConfig,

    /// Worker crawl settings
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Transfer tooling (rsync/ssh)
    #[serde(default)]
    pub transfer: TransferConfig,

    /// RPC settings
    #[serde(default)]
    pub repce: RepceConfig,

    /// Find tool settings
    #[serde(default)]
    pub find: FindConfig,

    /// Event notification settings
    #[serde(default)]
    pub events: EventsConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Primary/secondary pairing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Primary volume name
    #[serde(default)]
    pub primary_volume: String,

    /// Secondary URL (file://, gluster://, ssh:// or host::volume)
    #[serde(default)]
    pub secondary: String,

    /// Alternative secondary hosts; bricks are spread across them
    #[serde(default)]
    pub secondary_nodes: Vec<String>,

    /// Directory holding per-brick status files
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Directory holding per-brick working directories
    #[serde(default = "default_working_dir")]
    pub working_dir: PathBuf,
}

/// One local brick
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrickConfig {
    /// Brick root on this node
    pub path: PathBuf,

    /// Per-brick secondary override
    #[serde(default)]
    pub secondary: Option<String>,
}

/// Monitor supervision settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Seconds a worker has to signal readiness
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_secs: u64,

    /// Pause between worker respawns in milliseconds
    #[serde(default = "default_restart_backoff_ms")]
    pub restart_backoff_ms: u64,

    /// Worker executable (defaults to the running binary)
    #[serde(default)]
    pub worker_program: Option<PathBuf>,

    /// Arguments placed before the worker options
    #[serde(default = "default_worker_args")]
    pub worker_args: Vec<String>,
}

/// Worker crawl settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Live changelog scan interval in seconds
    #[serde(default = "default_change_interval")]
    pub change_interval_secs: u64,

    /// Upper bound on the summed size of changelogs processed together
    #[serde(default = "default_batch_size_bytes")]
    pub batch_size_bytes: u64,

    /// Data sync attempts per batch
    #[serde(default = "default_max_sync_retries")]
    pub max_sync_retries: u32,

    /// Checkpoint target (unix seconds, 0 = unset)
    #[serde(default)]
    pub checkpoint: i64,

    /// Changelog rollover interval of the storage engine in seconds
    #[serde(default = "default_rollover_secs")]
    pub rollover_secs: i64,

    /// Skip DELETE records when applying entries
    #[serde(default)]
    pub ignore_deletes: bool,

    /// Changelog agent executable (defaults to the running binary)
    #[serde(default)]
    pub agent_program: Option<PathBuf>,
}

/// Kind of data transfer engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferEngineKind {
    /// External rsync
    Rsync,
    /// In-process copy (local secondaries only)
    Copy,
}

/// Transfer tooling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Data transfer engine
    #[serde(default = "default_engine")]
    pub engine: TransferEngineKind,

    /// rsync executable
    #[serde(default = "default_rsync_command")]
    pub rsync_command: String,

    /// Extra rsync options
    #[serde(default)]
    pub rsync_options: Vec<String>,

    /// Pass --xattrs to rsync
    #[serde(default)]
    pub sync_xattrs: bool,

    /// Pass --acls to rsync
    #[serde(default)]
    pub sync_acls: bool,

    /// ssh executable
    #[serde(default = "default_ssh_command")]
    pub ssh_command: String,

    /// Extra ssh options
    #[serde(default = "default_ssh_options")]
    pub ssh_options: Vec<String>,

    /// ssh port
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,

    /// georep executable on the secondary
    #[serde(default = "default_remote_program")]
    pub remote_program: String,

    /// Seconds of keep-alive silence after which a secondary exits (0 = never)
    #[serde(default = "default_secondary_timeout")]
    pub secondary_timeout_secs: u64,
}

/// RPC settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepceConfig {
    /// Server worker pool size
    #[serde(default = "default_repce_workers")]
    pub workers: usize,
}

/// Find tool settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FindConfig {
    /// Session metadata root
    #[serde(default = "default_find_session_dir")]
    pub session_dir: PathBuf,

    /// Scratch space for node databases
    #[serde(default = "default_find_working_dir")]
    pub working_dir: PathBuf,

    /// Changelog rollover interval in seconds
    #[serde(default = "default_rollover_secs")]
    pub rollover_secs: i64,

    /// Volumes known to the find tool
    #[serde(default)]
    pub volumes: Vec<FindVolume>,
}

/// Brick layout of one volume
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FindVolume {
    /// Volume name
    pub name: String,

    /// Bricks as `host:/path`
    #[serde(default)]
    pub bricks: Vec<String>,
}

/// Event notification settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsConfig {
    /// Webhook URLs receiving JSON events
    #[serde(default)]
    pub webhooks: Vec<String>,

    /// Per-request timeout in seconds
    #[serde(default = "default_webhook_timeout")]
    pub timeout_secs: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log to file path (optional)
    pub file: Option<PathBuf>,
}

// Default value functions
fn default_state_dir() -> PathBuf {
    PathBuf::from("/var/lib/georep")
}

fn default_working_dir() -> PathBuf {
    PathBuf::from("/var/lib/misc/georep")
}

fn default_connection_timeout() -> u64 {
    60
}

fn default_restart_backoff_ms() -> u64 {
    10_000
}

fn default_worker_args() -> Vec<String> {
    vec!["worker".to_string()]
}

fn default_change_interval() -> u64 {
    5
}

fn default_batch_size_bytes() -> u64 {
    727_040
}

fn default_max_sync_retries() -> u32 {
    10
}

fn default_rollover_secs() -> i64 {
    15
}

fn default_engine() -> TransferEngineKind {
    TransferEngineKind::Rsync
}

fn default_rsync_command() -> String {
    "rsync".to_string()
}

fn default_ssh_command() -> String {
    "ssh".to_string()
}

fn default_ssh_options() -> Vec<String> {
    vec![
        "-oPasswordAuthentication=no".to_string(),
        "-oStrictHostKeyChecking=no".to_string(),
    ]
}

fn default_ssh_port() -> u16 {
    22
}

fn default_remote_program() -> String {
    "georep".to_string()
}

fn default_secondary_timeout() -> u64 {
    120
}

fn default_repce_workers() -> usize {
    6
}

fn default_find_session_dir() -> PathBuf {
    PathBuf::from("/var/lib/georep/find")
}

fn default_find_working_dir() -> PathBuf {
    PathBuf::from("/var/lib/misc/georep/find")
}

fn default_webhook_timeout() -> u64 {
    5
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            primary_volume: String::new(),
            secondary: String::new(),
            secondary_nodes: Vec::new(),
            state_dir: default_state_dir(),
            working_dir: default_working_dir(),
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            connection_timeout_secs: default_connection_timeout(),
            restart_backoff_ms: default_restart_backoff_ms(),
            worker_program: None,
            worker_args: default_worker_args(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            change_interval_secs: default_change_interval(),
            batch_size_bytes: default_batch_size_bytes(),
            max_sync_retries: default_max_sync_retries(),
            checkpoint: 0,
            rollover_secs: default_rollover_secs(),
            ignore_deletes: false,
            agent_program: None,
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            engine: default_engine(),
            rsync_command: default_rsync_command(),
            rsync_options: Vec::new(),
            sync_xattrs: false,
            sync_acls: false,
            ssh_command: default_ssh_command(),
            ssh_options: default_ssh_options(),
            ssh_port: default_ssh_port(),
            remote_program: default_remote_program(),
            secondary_timeout_secs: default_secondary_timeout(),
        }
    }
}

impl Default for RepceConfig {
    fn default() -> Self {
        Self {
            workers: default_repce_workers(),
        }
    }
}

impl Default for FindConfig {
    fn default() -> Self {
        Self {
            session_dir: default_find_session_dir(),
            working_dir: default_find_working_dir(),
            rollover_secs: default_rollover_secs(),
            volumes: Vec::new(),
        }
    }
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            webhooks: Vec::new(),
            timeout_secs: default_webhook_timeout(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            file: None,
        }
    }
}

impl Default for GeorepConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            bricks: Vec::new(),
            monitor: MonitorConfig::default(),
            worker: WorkerConfig::default(),
            transfer: TransferConfig::default(),
            repce: RepceConfig::default(),
            find: FindConfig::default(),
            events: EventsConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl GeorepConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            crate::Error::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: GeorepConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.repce.workers == 0 {
            return Err(crate::Error::Config("repce.workers must be at least 1".into()));
        }

        if self.worker.batch_size_bytes == 0 {
            return Err(crate::Error::Config("worker.batch_size_bytes cannot be 0".into()));
        }

        if self.worker.checkpoint < 0 {
            return Err(crate::Error::Config("worker.checkpoint cannot be negative".into()));
        }

        for brick in &self.bricks {
            if !brick.path.is_absolute() {
                return Err(crate::Error::Config(format!(
                    "brick path {} must be absolute",
                    brick.path.display()
                )));
            }
        }

        for volume in &self.find.volumes {
            for brick in &volume.bricks {
                if !brick.contains(":/") {
                    return Err(crate::Error::Config(format!(
                        "find brick {} of volume {} must be host:/path",
                        brick, volume.name
                    )));
                }
            }
        }

        Ok(())
    }

    /// Extra checks for running the monitor
    pub fn validate_session(&self) -> crate::Result<()> {
        if self.session.secondary.is_empty() {
            return Err(crate::Error::Config("session.secondary cannot be empty".into()));
        }

        if self.bricks.is_empty() {
            return Err(crate::Error::Config("no [[bricks]] configured".into()));
        }

        Ok(())
    }

    /// Secondary URL for one brick
    pub fn secondary_for<'a>(&'a self, brick: &'a BrickConfig) -> &'a str {
        brick.secondary.as_deref().unwrap_or(&self.session.secondary)
    }

    /// Worker handshake timeout as Duration
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.monitor.connection_timeout_secs)
    }

    /// Respawn backoff as Duration
    pub fn restart_backoff(&self) -> Duration {
        Duration::from_millis(self.monitor.restart_backoff_ms)
    }

    /// Live crawl interval as Duration
    pub fn change_interval(&self) -> Duration {
        Duration::from_secs(self.worker.change_interval_secs)
    }

    /// Find tool volume by name
    pub fn find_volume(&self, name: &str) -> Option<&FindVolume> {
        self.find.volumes.iter().find(|v| v.name == name)
    }

    /// Rewrite `path` with a new checkpoint target
    pub fn store_checkpoint(path: &Path, checkpoint: i64) -> crate::Result<Self> {
        let mut config = Self::from_file(path)?;
        config.worker.checkpoint = checkpoint;
        config.validate()?;

        let rendered = toml::to_string_pretty(&config)
            .map_err(|e| crate::Error::Config(format!("cannot render config: {}", e)))?;
        crate::status::replace_file(path, rendered.as_bytes())?;
        Ok(config)
    }
}

/// Shared handle to the current configuration value
pub struct ConfigHandle {
    /// File the configuration was loaded from
    path: Option<PathBuf>,
    /// Current value
    current: RwLock<Arc<GeorepConfig>>,
}

impl ConfigHandle {
    /// Wrap an already-built configuration
    pub fn new(config: GeorepConfig, path: Option<PathBuf>) -> Self {
        Self {
            path,
            current: RwLock::new(Arc::new(config)),
        }
    }

    /// Load from a file, remembering the path for reloads
    pub fn load(path: &Path) -> crate::Result<Self> {
        let config = GeorepConfig::from_file(path)?;
        Ok(Self::new(config, Some(path.to_path_buf())))
    }

    /// Current configuration value
    pub fn get(&self) -> Arc<GeorepConfig> {
        let guard = self.current.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&guard)
    }

    /// Path the configuration was loaded from
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Re-read the file and swap the current value
    pub fn reload(&self) -> crate::Result<Arc<GeorepConfig>> {
        let path = self
            .path
            .as_ref()
            .ok_or_else(|| crate::Error::Config("configuration has no backing file".into()))?;
        let fresh = Arc::new(GeorepConfig::from_file(path)?);
        let mut guard = self.current.write().unwrap_or_else(|e| e.into_inner());
        *guard = Arc::clone(&fresh);
        Ok(fresh)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const SAMPLE: &str = r#"
[session]
primary_volume = "gv0"
secondary = "geoaccount@backup1::gv1"
secondary_nodes = ["backup1", "backup2"]

[[bricks]]
path = "/bricks/b1"

[[bricks]]
path = "/bricks/b2"
secondary = "file:///mnt/replica"

[monitor]
connection_timeout_secs = 30

[find]
[[find.volumes]]
name = "gv0"
bricks = ["node1:/bricks/b1", "node2:/bricks/b2"]
"#;

    #[test]
    fn test_parse_config() {
        let config = GeorepConfig::from_str(SAMPLE).unwrap();
        assert_eq!(config.session.primary_volume, "gv0");
        assert_eq!(config.bricks.len(), 2);
        assert_eq!(config.secondary_for(&config.bricks[0]), "geoaccount@backup1::gv1");
        assert_eq!(config.secondary_for(&config.bricks[1]), "file:///mnt/replica");
        assert_eq!(config.connection_timeout(), Duration::from_secs(30));
        assert_eq!(config.restart_backoff(), Duration::from_secs(10));
        assert_eq!(config.worker.batch_size_bytes, 727_040);
        assert_eq!(config.repce.workers, 6);
        assert_eq!(config.find_volume("gv0").unwrap().bricks.len(), 2);
        config.validate_session().unwrap();
    }

    #[test]
    fn test_rejects_relative_brick() {
        let toml = r#"
[[bricks]]
path = "bricks/b1"
"#;
        assert!(GeorepConfig::from_str(toml).is_err());
    }

    #[test]
    fn test_reload_swaps_value() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("georep.toml");
        std::fs::write(&path, SAMPLE).unwrap();

        let handle = ConfigHandle::load(&path).unwrap();
        let before = handle.get();
        assert_eq!(before.worker.checkpoint, 0);

        GeorepConfig::store_checkpoint(&path, 1700000000).unwrap();
        let after = handle.reload().unwrap();
        assert_eq!(after.worker.checkpoint, 1700000000);
        assert_eq!(handle.get().worker.checkpoint, 1700000000);
        // old readers keep their snapshot
        assert_eq!(before.worker.checkpoint, 0);
    }
}
