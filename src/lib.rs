//! georep - Asynchronous changelog-driven geo-replication
//!
//! Replicates a primary volume to a secondary by replaying the storage
//! engine's per-brick changelogs. A monitor keeps one worker alive per
//! local brick; each worker turns changelogs into path-level entry, data
//! and metadata operations and applies them on the secondary.
//!
//! # Architecture
//!
//! - `monitor` supervises workers with restart backoff and readiness checks
//! - `worker` drives the hybrid, history and live changelog crawls
//! - `changelog` parses changelogs and resolves GFIDs to paths
//! - `repce` is the RPC transport between worker, agent and secondary
//! - `resource` parses secondary URLs and talks to the secondary
//! - `status` holds the per-brick status files operators read
//! - `find` is the session-based incremental listing tool

pub mod changelog;
pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod find;
pub mod monitor;
pub mod repce;
pub mod resource;
pub mod status;
pub mod worker;

pub use config::GeorepConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::changelog::{ChangeRecord, ChangelogQuery, FsChangelog, RecordType, Translator};
    pub use crate::config::{ConfigHandle, GeorepConfig};
    pub use crate::error::{Error, ErrorClass, Result};
    pub use crate::events::{Event, EventKind, EventPublisher};
    pub use crate::monitor::Monitor;
    pub use crate::repce::{RepceClient, RepceServer, Value};
    pub use crate::resource::Resource;
    pub use crate::status::{StatusStore, WorkerState};
    pub use crate::worker::Worker;
}
