//! Repce Client
//!
//! A background listener thread reads responses and completes the pending
//! job with the matching request id. `call` is `push` plus a condition
//! variable wait. A caller waiting on a peer that died is never woken;
//! process supervision handles that case.

use std::collections::HashMap;
use std::io::{BufReader, BufWriter, Read, Write};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use super::{read_frame, write_frame, Request, RequestId, Response, Value, REPCE_VERSION, VERSION_METHOD};
use crate::error::{Error, Result};

/// Completion callback for a pushed call
pub type Callback = Box<dyn FnOnce(Result<Value>) + Send>;

struct Pending {
    method: String,
    callback: Callback,
}

type JobTable = Arc<Mutex<HashMap<RequestId, Pending>>>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Client half of a Repce channel
pub struct RepceClient {
    writer: Mutex<Box<dyn Write + Send>>,
    jobs: JobTable,
}

impl RepceClient {
    /// Start the listener on `reader`; requests go out on `writer`
    pub fn new<R, W>(reader: R, writer: W) -> Result<Self>
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        let jobs: JobTable = Arc::new(Mutex::new(HashMap::new()));
        let listener_jobs = Arc::clone(&jobs);
        let listener = std::thread::Builder::new()
            .name("repce-listener".into())
            .spawn(move || listen(BufReader::new(reader), listener_jobs));
        Self::with_listener(writer, jobs, listener.map(drop))
    }

    /// Without a listener no response is ever read, so the client is unusable
    fn with_listener<W>(writer: W, jobs: JobTable, listener: std::io::Result<()>) -> Result<Self>
    where
        W: Write + Send + 'static,
    {
        listener.map_err(|e| Error::Repce(format!("cannot start RPC listener: {}", e)))?;
        Ok(Self {
            writer: Mutex::new(Box::new(BufWriter::new(writer))),
            jobs,
        })
    }

    /// Send a call without waiting; `callback` runs on the listener thread
    pub fn push(&self, method: &str, args: Vec<Value>, callback: Option<Callback>) -> Result<RequestId> {
        let id = RequestId::new();
        let callback = callback.unwrap_or_else(|| {
            let method = method.to_string();
            let log_failure: Callback = Box::new(move |result: Result<Value>| {
                if let Err(e) = result {
                    tracing::warn!("fire-and-forget call {} failed: {}", method, e);
                }
            });
            log_failure
        });
        lock(&self.jobs).insert(
            id,
            Pending {
                method: method.to_string(),
                callback,
            },
        );

        let sent = write_frame(&mut *lock(&self.writer), &Request(id, method.to_string(), args));
        if let Err(e) = sent {
            lock(&self.jobs).remove(&id);
            return Err(e);
        }
        Ok(id)
    }

    /// Send a call and block until its response arrives
    pub fn call(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        let slot: Arc<(Mutex<Option<Result<Value>>>, Condvar)> =
            Arc::new((Mutex::new(None), Condvar::new()));
        let waker = Arc::clone(&slot);
        self.push(
            method,
            args,
            Some(Box::new(move |result: Result<Value>| {
                let (lock_, cvar) = &*waker;
                *lock(lock_) = Some(result);
                cvar.notify_one();
            })),
        )?;

        let (lock_, cvar) = &*slot;
        let mut guard = lock(lock_);
        loop {
            if let Some(result) = guard.take() {
                return result;
            }
            guard = cvar.wait(guard).unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Protocol version reported by the peer
    pub fn version(&self) -> Result<String> {
        let v = self.call(VERSION_METHOD, Vec::new())?;
        v.as_str()
            .map(str::to_string)
            .ok_or_else(|| Error::Repce(format!("bad version reply {}", v)))
    }

    /// Fail unless the peer speaks our protocol version
    pub fn handshake(&self) -> Result<()> {
        let remote = self.version()?;
        if remote != REPCE_VERSION {
            return Err(Error::VersionMismatch {
                what: "repce".into(),
                local: REPCE_VERSION.into(),
                remote,
            });
        }
        Ok(())
    }

    /// Number of calls still waiting for a response
    pub fn in_flight(&self) -> usize {
        lock(&self.jobs).len()
    }
}

fn listen<R: Read>(mut reader: R, jobs: JobTable) {
    loop {
        match read_frame::<_, Response>(&mut reader) {
            Ok(Response(id, is_exception, value)) => {
                let Some(job) = lock(&jobs).remove(&id) else {
                    tracing::warn!("response for unknown request {:?}", id);
                    continue;
                };
                let result = if is_exception {
                    Err(Error::Remote {
                        method: job.method,
                        message: value.to_string(),
                    })
                } else {
                    Ok(value)
                };
                (job.callback)(result);
            }
            Err(Error::PeerDisconnected) => {
                tracing::debug!("RPC peer closed the channel");
                break;
            }
            Err(e) => {
                tracing::error!("RPC listener stopped: {}", e);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_without_listener_is_an_error() {
        let jobs: JobTable = Arc::new(Mutex::new(HashMap::new()));
        let failed = Err(std::io::Error::new(std::io::ErrorKind::Other, "no threads left"));
        match RepceClient::with_listener(Vec::<u8>::new(), jobs, failed) {
            Err(Error::Repce(message)) => assert!(message.contains("no threads left")),
            Err(e) => panic!("unexpected error {:?}", e),
            Ok(_) => panic!("client built without a listener"),
        }
    }
}
