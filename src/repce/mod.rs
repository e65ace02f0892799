//! Repce RPC Transport
//!
//! Symmetric request/response protocol multiplexed over a pair of byte
//! streams, usually a child process's stdin/stdout. Every message is a
//! self-delimiting bincode tuple: requests are `(id, method, args)`,
//! responses `(id, is_exception, result)`. A reserved method reports the
//! protocol version so peers can check compatibility before real calls.

pub mod client;
pub mod server;
pub mod value;

pub use client::RepceClient;
pub use server::{Dispatcher, RepceServer};
pub use value::Value;

use std::hash::{Hash, Hasher};
use std::io::{Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Protocol version exchanged during the handshake
pub const REPCE_VERSION: &str = "1.0";

/// Reserved method answering [`REPCE_VERSION`]
pub const VERSION_METHOD: &str = "__repce_version__";

/// Last send time handed out, keeps ids from one process distinct
static LAST_SENT_NS: AtomicU64 = AtomicU64::new(0);

/// Request identifier: `(pid, thread, send time)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId {
    pub pid: u32,
    pub thread: u64,
    pub sent_ns: u64,
}

impl RequestId {
    /// Identifier for a request sent now from the current thread
    pub fn new() -> Self {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        std::thread::current().id().hash(&mut hasher);

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        let mut prev = LAST_SENT_NS.load(Ordering::Relaxed);
        let sent_ns = loop {
            let candidate = now.max(prev + 1);
            match LAST_SENT_NS.compare_exchange_weak(prev, candidate, Ordering::Relaxed, Ordering::Relaxed) {
                Ok(_) => break candidate,
                Err(actual) => prev = actual,
            }
        };

        Self {
            pid: std::process::id(),
            thread: hasher.finish(),
            sent_ns,
        }
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

/// Client to server message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request(pub RequestId, pub String, pub Vec<Value>);

/// Server to client message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response(pub RequestId, pub bool, pub Value);

/// Write one frame and flush
pub fn write_frame<W: Write, T: Serialize>(writer: &mut W, frame: &T) -> Result<()> {
    bincode::serialize_into(&mut *writer, frame)?;
    writer.flush()?;
    Ok(())
}

/// Read one frame; end of stream maps to [`Error::PeerDisconnected`]
pub fn read_frame<R: Read, T: DeserializeOwned>(reader: &mut R) -> Result<T> {
    match bincode::deserialize_from(reader) {
        Ok(frame) => Ok(frame),
        Err(e) => {
            let disconnected = matches!(
                &*e,
                bincode::ErrorKind::Io(io) if matches!(
                    io.kind(),
                    std::io::ErrorKind::UnexpectedEof
                        | std::io::ErrorKind::BrokenPipe
                        | std::io::ErrorKind::ConnectionReset
                )
            );
            if disconnected {
                Err(Error::PeerDisconnected)
            } else {
                Err(Error::Serialization(e))
            }
        }
    }
}
