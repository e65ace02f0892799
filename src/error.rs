//! georep Error Types

use thiserror::Error;

/// Result type alias for georep operations
pub type Result<T> = std::result::Result<T, Error>;

/// How far up the supervision tree an error is allowed to travel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retry in place after a short pause
    Transient,
    /// Let the process die; the monitor restarts it
    WorkerFatal,
    /// Log, count, skip the one record
    RecordSkip,
    /// Report on stderr and exit non-zero without retry
    OperatorFatal,
}

/// georep error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Required binary not found: {0}")]
    MissingBinary(String),

    // Changelog errors
    #[error("Changelog {path}: {reason}")]
    Changelog { path: String, reason: String },

    #[error("Malformed changelog record: {0}")]
    BadRecord(String),

    #[error("Unable to resolve path for GFID {0}")]
    Unresolved(String),

    #[error("Partial history available up to {actual_end}, requested {requested_end}")]
    PartialHistory { actual_end: i64, requested_end: i64 },

    #[error("Changelog history unavailable: {0}")]
    HistoryUnavailable(String),

    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    // RPC errors
    #[error("RPC error: {0}")]
    Repce(String),

    #[error("RPC serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Remote call {method} raised: {message}")]
    Remote { method: String, message: String },

    #[error("Peer disconnected")]
    PeerDisconnected,

    #[error("Version mismatch ({what}): local {local}, remote {remote}")]
    VersionMismatch {
        what: String,
        local: String,
        remote: String,
    },

    // Resource errors
    #[error("Unsupported URL: {0}")]
    UnsupportedUrl(String),

    #[error("Resource error: {0}")]
    Resource(String),

    #[error("Mount of {volume} failed: {reason}")]
    Mount { volume: String, reason: String },

    #[error("Transfer failed: {0}")]
    Transfer(String),

    // Status and session errors
    #[error("Status file error: {0}")]
    Status(String),

    #[error("Status file is locked")]
    LockContention,

    #[error("Session error: {0}")]
    Session(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Webhook delivery failed: {0}")]
    Http(#[from] reqwest::Error),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("System call failed: {0}")]
    Sys(#[from] nix::errno::Errno),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// errno values that are retried before being surfaced
const RETRY_ERRNOS: [i32; 2] = [libc::ESTALE, libc::EBUSY];

impl Error {
    /// Map this error onto the supervision taxonomy
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::LockContention | Error::PeerDisconnected => ErrorClass::Transient,
            Error::Io(e) if e.raw_os_error().map_or(false, |n| RETRY_ERRNOS.contains(&n)) => {
                ErrorClass::Transient
            }
            Error::Sys(errno) if RETRY_ERRNOS.contains(&(*errno as i32)) => ErrorClass::Transient,
            Error::BadRecord(_) | Error::Unresolved(_) => ErrorClass::RecordSkip,
            Error::Config(_)
            | Error::ConfigParse(_)
            | Error::MissingBinary(_)
            | Error::UnsupportedUrl(_)
            | Error::Session(_) => ErrorClass::OperatorFatal,
            _ => ErrorClass::WorkerFatal,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// Process exit code used when this error terminates a binary
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::PartialHistory { .. } => 2,
            _ => 1,
        }
    }
}
