//! Event Notification
//!
//! Replication events (a worker going faulty, a checkpoint completing,
//! find sessions appearing) are published from any thread onto a channel
//! and delivered as JSON to the configured webhooks by a tokio task. The
//! monitor owns the pool and restarts it after a configuration reload.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::EventsConfig;
use crate::error::Result;

/// Kinds of events the engine emits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Faulty,
    Active,
    CheckpointCompleted,
    ConfigReloaded,
    WorkerDied,
    FindSessionCreated,
    FindSessionDeleted,
}

impl EventKind {
    /// Wire name of the event
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::Faulty => "GEOREP_FAULTY",
            EventKind::Active => "GEOREP_ACTIVE",
            EventKind::CheckpointCompleted => "GEOREP_CHECKPOINT_COMPLETED",
            EventKind::ConfigReloaded => "GEOREP_CONFIG_RELOADED",
            EventKind::WorkerDied => "GEOREP_WORKER_DIED",
            EventKind::FindSessionCreated => "GLUSTERFIND_SESSION_CREATED",
            EventKind::FindSessionDeleted => "GLUSTERFIND_SESSION_DELETED",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// One event with its key/value details
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub kind: EventKind,
    pub ts: i64,
    pub fields: BTreeMap<String, String>,
}

impl Event {
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            ts: chrono::Utc::now().timestamp(),
            fields: BTreeMap::new(),
        }
    }

    /// Add a detail (builder form)
    pub fn with(mut self, key: &str, value: impl ToString) -> Self {
        self.fields.insert(key.to_string(), value.to_string());
        self
    }

    fn field(&self, key: &str) -> &str {
        self.fields.get(key).map(String::as_str).unwrap_or("")
    }
}

type PayloadBuilder = fn(&Event) -> serde_json::Value;

/// Kinds with a dedicated payload shape; everything else uses [`generic_payload`]
const PAYLOAD_BUILDERS: &[(EventKind, PayloadBuilder)] = &[
    (EventKind::Faulty, worker_payload),
    (EventKind::Active, worker_payload),
    (EventKind::WorkerDied, worker_payload),
    (EventKind::CheckpointCompleted, checkpoint_payload),
];

fn worker_payload(event: &Event) -> serde_json::Value {
    json!({
        "event": event.kind.name(),
        "ts": event.ts,
        "message": {
            "primary_volume": event.field("primary_volume"),
            "brick_path": event.field("brick_path"),
            "secondary": event.field("secondary"),
            "current_secondary_host": event.field("current_secondary_host"),
        }
    })
}

fn checkpoint_payload(event: &Event) -> serde_json::Value {
    json!({
        "event": event.kind.name(),
        "ts": event.ts,
        "message": {
            "primary_volume": event.field("primary_volume"),
            "brick_path": event.field("brick_path"),
            "secondary": event.field("secondary"),
            "checkpoint_time": event.field("checkpoint_time"),
            "checkpoint_completion_time": event.field("checkpoint_completion_time"),
        }
    })
}

fn generic_payload(event: &Event) -> serde_json::Value {
    json!({
        "event": event.kind.name(),
        "ts": event.ts,
        "message": event.fields,
    })
}

/// JSON body delivered for `event`
pub fn payload(event: &Event) -> serde_json::Value {
    PAYLOAD_BUILDERS
        .iter()
        .find(|(kind, _)| *kind == event.kind)
        .map(|(_, build)| build(event))
        .unwrap_or_else(|| generic_payload(event))
}

type SharedSender = Arc<RwLock<Option<mpsc::UnboundedSender<Event>>>>;

/// Cheap handle for publishing events from sync or async code
#[derive(Clone, Default)]
pub struct EventPublisher {
    tx: SharedSender,
}

impl EventPublisher {
    /// Publisher that drops everything
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn publish(&self, event: Event) {
        let guard = self.tx.read().unwrap_or_else(|e| e.into_inner());
        match guard.as_ref() {
            Some(tx) => {
                tracing::debug!("event {}", event.kind);
                if tx.send(event).is_err() {
                    tracing::debug!("notification pool is gone, event dropped");
                }
            }
            None => tracing::trace!("events disabled, dropping {}", event.kind),
        }
    }
}

/// Webhook delivery task and its shared sender
pub struct NotificationPool {
    tx: SharedSender,
    task: Option<JoinHandle<()>>,
}

impl NotificationPool {
    /// Start delivering to `config.webhooks`; must run inside a tokio runtime
    pub fn start(config: &EventsConfig) -> Result<Self> {
        let mut pool = Self {
            tx: Arc::new(RwLock::new(None)),
            task: None,
        };
        pool.restart(config)?;
        Ok(pool)
    }

    pub fn publisher(&self) -> EventPublisher {
        EventPublisher {
            tx: Arc::clone(&self.tx),
        }
    }

    /// Replace the delivery task; queued events on the old one still go out
    pub fn restart(&mut self, config: &EventsConfig) -> Result<()> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(deliver(rx, client, config.webhooks.clone()));

        let old = {
            let mut guard = self.tx.write().unwrap_or_else(|e| e.into_inner());
            guard.replace(tx)
        };
        drop(old);
        self.task = Some(task);
        tracing::info!("notification pool started ({} webhooks)", config.webhooks.len());
        Ok(())
    }

    /// Stop accepting events and wait for queued ones to be delivered
    pub async fn shutdown(mut self) {
        let old = {
            let mut guard = self.tx.write().unwrap_or_else(|e| e.into_inner());
            guard.take()
        };
        drop(old);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

async fn deliver(mut rx: mpsc::UnboundedReceiver<Event>, client: reqwest::Client, webhooks: Vec<String>) {
    while let Some(event) = rx.recv().await {
        if webhooks.is_empty() {
            continue;
        }
        let body = payload(&event);
        for url in &webhooks {
            match client.post(url).json(&body).send().await {
                Ok(resp) if resp.status().is_success() => {
                    tracing::debug!("delivered {} to {}", event.kind, url);
                }
                Ok(resp) => tracing::warn!("webhook {} answered {} for {}", url, resp.status(), event.kind),
                Err(e) => tracing::warn!("webhook {} failed for {}: {}", url, event.kind, e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn test_payload_table_and_fallback() {
        let event = Event::new(EventKind::CheckpointCompleted)
            .with("brick_path", "/bricks/b1")
            .with("checkpoint_time", 100);
        let body = payload(&event);
        assert_eq!(body["event"], "GEOREP_CHECKPOINT_COMPLETED");
        assert_eq!(body["message"]["checkpoint_time"], "100");
        assert_eq!(body["message"]["brick_path"], "/bricks/b1");

        let event = Event::new(EventKind::FindSessionCreated).with("session", "s1");
        let body = payload(&event);
        assert_eq!(body["event"], "GLUSTERFIND_SESSION_CREATED");
        assert_eq!(body["message"]["session"], "s1");
    }

    #[test]
    fn test_disabled_publisher_drops_events() {
        EventPublisher::disabled().publish(Event::new(EventKind::Faulty));
    }

    /// Accept one HTTP request and return its raw bytes
    async fn receive_one(listener: TcpListener) -> String {
        let (mut sock, _) = listener.accept().await.unwrap();
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = sock.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
            if String::from_utf8_lossy(&buf).contains("\"ts\"") {
                break;
            }
        }
        sock.write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\nconnection: close\r\n\r\n")
            .await
            .unwrap();
        String::from_utf8_lossy(&buf).into_owned()
    }

    #[tokio::test]
    async fn test_delivers_to_webhook() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/hook", listener.local_addr().unwrap());
        let server = tokio::spawn(receive_one(listener));

        let config = EventsConfig {
            webhooks: vec![url],
            timeout_secs: 5,
        };
        let pool = NotificationPool::start(&config).unwrap();
        pool.publisher()
            .publish(Event::new(EventKind::Faulty).with("brick_path", "/bricks/b1"));

        let request = tokio::time::timeout(Duration::from_secs(10), server)
            .await
            .unwrap()
            .unwrap();
        assert!(request.starts_with("POST /hook"));
        assert!(request.contains("GEOREP_FAULTY"));
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_restart_switches_webhooks() {
        let mut pool = NotificationPool::start(&EventsConfig::default()).unwrap();
        let publisher = pool.publisher();
        publisher.publish(Event::new(EventKind::Active));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/after", listener.local_addr().unwrap());
        let server = tokio::spawn(receive_one(listener));

        pool.restart(&EventsConfig {
            webhooks: vec![url],
            timeout_secs: 5,
        })
        .unwrap();
        // handles taken before the restart follow it
        publisher.publish(Event::new(EventKind::ConfigReloaded).with("path", "/etc/georep.toml"));

        let request = tokio::time::timeout(Duration::from_secs(10), server)
            .await
            .unwrap()
            .unwrap();
        assert!(request.contains("GEOREP_CONFIG_RELOADED"));
        pool.shutdown().await;
    }
}
