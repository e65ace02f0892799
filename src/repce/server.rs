//! Repce Server
//!
//! One reader thread queues incoming requests; a fixed pool of worker
//! threads dispatches them through a method-name table and writes the
//! responses. Handler errors and panics travel back as exception data.

use std::collections::HashMap;
use std::io::{BufReader, BufWriter, Read, Write};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, MutexGuard};

use super::{read_frame, write_frame, Request, Response, Value, REPCE_VERSION, VERSION_METHOD};
use crate::error::{Error, Result};

/// Handler for one method
pub type Handler = Box<dyn Fn(&[Value]) -> Result<Value> + Send + Sync>;

/// Method name to handler table
#[derive(Default)]
pub struct Dispatcher {
    handlers: HashMap<String, Handler>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a handler (builder form)
    pub fn register<F>(mut self, method: &str, handler: F) -> Self
    where
        F: Fn(&[Value]) -> Result<Value> + Send + Sync + 'static,
    {
        self.add(method, handler);
        self
    }

    /// Add a handler
    pub fn add<F>(&mut self, method: &str, handler: F)
    where
        F: Fn(&[Value]) -> Result<Value> + Send + Sync + 'static,
    {
        self.handlers.insert(method.to_string(), Box::new(handler));
    }

    /// Registered method names, sorted
    pub fn methods(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Run one call, turning every failure into an error message
    pub fn dispatch(&self, method: &str, args: &[Value]) -> std::result::Result<Value, String> {
        if method == VERSION_METHOD {
            return Ok(Value::Str(REPCE_VERSION.to_string()));
        }
        let handler = self
            .handlers
            .get(method)
            .ok_or_else(|| format!("unknown method {}", method))?;

        match catch_unwind(AssertUnwindSafe(|| handler(args))) {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(e.to_string()),
            Err(panic) => {
                let msg = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                Err(format!("{} panicked: {}", method, msg))
            }
        }
    }
}

/// Server half of a Repce channel
pub struct RepceServer<R, W> {
    reader: R,
    writer: W,
    dispatcher: Arc<Dispatcher>,
    workers: usize,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl<R, W> RepceServer<R, W>
where
    R: Read,
    W: Write + Send + 'static,
{
    pub fn new(reader: R, writer: W, dispatcher: Arc<Dispatcher>, workers: usize) -> Self {
        Self {
            reader,
            writer,
            dispatcher,
            workers: workers.max(1),
        }
    }

    /// Serve until the peer goes away; EOF is a clean return
    pub fn service_loop(self) -> Result<()> {
        let (tx, rx) = mpsc::channel::<Request>();
        let rx = Arc::new(Mutex::new(rx));
        let writer = Arc::new(Mutex::new(BufWriter::new(self.writer)));

        let mut pool = Vec::with_capacity(self.workers);
        for n in 0..self.workers {
            let rx = Arc::clone(&rx);
            let writer = Arc::clone(&writer);
            let dispatcher = Arc::clone(&self.dispatcher);
            let handle = std::thread::Builder::new()
                .name(format!("repce-worker-{}", n))
                .spawn(move || loop {
                    let next = lock(&rx).recv();
                    let Ok(Request(id, method, args)) = next else {
                        break;
                    };
                    let (is_exception, result) = match dispatcher.dispatch(&method, &args) {
                        Ok(value) => (false, value),
                        Err(msg) => {
                            tracing::warn!("call failed: {}", msg);
                            (true, Value::Str(msg))
                        }
                    };
                    if let Err(e) = write_frame(&mut *lock(&writer), &Response(id, is_exception, result)) {
                        tracing::debug!("dropping response to {}: {}", method, e);
                    }
                })?;
            pool.push(handle);
        }

        let mut reader = BufReader::new(self.reader);
        let outcome = loop {
            match read_frame::<_, Request>(&mut reader) {
                Ok(request) => {
                    tracing::trace!("request {} {:?}", request.1, request.0);
                    if tx.send(request).is_err() {
                        break Err(Error::Repce("worker pool went away".into()));
                    }
                }
                Err(Error::PeerDisconnected) => {
                    tracing::debug!("peer closed the channel");
                    break Ok(());
                }
                Err(e) => break Err(e),
            }
        };

        // let queued requests finish before returning
        drop(tx);
        for handle in pool {
            let _ = handle.join();
        }
        outcome
    }
}
