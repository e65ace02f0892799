//! Worker Monitor
//!
//! Keeps one live worker per configured brick. Every brick is supervised
//! by its own task; the aggregate state across bricks is republished on
//! each change. SIGUSR2 reloads the configuration and restarts the
//! notification pool without touching running workers.

pub mod board;
pub mod secondary;
pub mod supervisor;

pub use board::{aggregate, StateBoard};
pub use secondary::{assigned_node, choose_secondary};
pub use supervisor::{classify_exit, ExitKind, Supervisor};

use std::sync::Arc;

use futures::future::join_all;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

use crate::config::ConfigHandle;
use crate::error::{Error, Result};
use crate::events::{Event, EventKind, EventPublisher, NotificationPool};
use crate::status::{MonitorState, MonitorStore};

/// Root supervisor of a session
pub struct Monitor {
    config: Arc<ConfigHandle>,
    pool: Option<NotificationPool>,
    board: Arc<StateBoard>,
    store: MonitorStore,
    cancel: CancellationToken,
}

impl Monitor {
    /// Monitor for the bricks in `config`; events go through `pool` when present
    pub fn new(config: ConfigHandle, pool: Option<NotificationPool>) -> Self {
        let state_dir = config.get().session.state_dir.clone();
        Self {
            config: Arc::new(config),
            pool,
            board: Arc::new(StateBoard::new(&state_dir)),
            store: MonitorStore::new(&state_dir),
            cancel: CancellationToken::new(),
        }
    }

    /// Token that stops every supervision task and its worker
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn board(&self) -> Arc<StateBoard> {
        Arc::clone(&self.board)
    }

    fn publisher(&self) -> EventPublisher {
        self.pool
            .as_ref()
            .map(NotificationPool::publisher)
            .unwrap_or_else(EventPublisher::disabled)
    }

    /// Supervise until cancelled or until a worker leaves the session inconsistent
    pub async fn run(mut self) -> Result<()> {
        let config = self.config.get();
        config.validate_session()?;
        std::fs::create_dir_all(&config.session.state_dir)?;
        self.store.set_status(MonitorState::Started)?;
        tracing::info!(
            "monitor started for {} bricks of {}",
            config.bricks.len(),
            config.session.primary_volume
        );

        let spawn_lock = Arc::new(tokio::sync::Mutex::new(()));
        let tasks: Vec<_> = config
            .bricks
            .iter()
            .cloned()
            .enumerate()
            .map(|(idx, brick)| {
                let supervisor = Supervisor {
                    idx,
                    brick,
                    config: Arc::clone(&self.config),
                    board: Arc::clone(&self.board),
                    events: self.publisher(),
                    cancel: self.cancel.clone(),
                    spawn_lock: Arc::clone(&spawn_lock),
                };
                let cancel = self.cancel.clone();
                tokio::spawn(async move {
                    let outcome = supervisor.run().await;
                    // an inconsistent brick or a hard error brings the session down
                    if !matches!(outcome, Ok(None)) {
                        cancel.cancel();
                    }
                    outcome
                })
            })
            .collect();

        let all = join_all(tasks);
        tokio::pin!(all);
        let mut reload = signal(SignalKind::user_defined2())?;
        let mut terminate = signal(SignalKind::terminate())?;

        let results = loop {
            tokio::select! {
                results = &mut all => break results,
                _ = reload.recv() => self.reload(),
                _ = terminate.recv() => {
                    tracing::info!("received SIGTERM, stopping workers");
                    self.cancel.cancel();
                }
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("received shutdown signal, stopping workers");
                    self.cancel.cancel();
                }
            }
        };

        let mut failure = None;
        for result in results {
            match result {
                Ok(Ok(None)) => {}
                Ok(Ok(Some(code))) => failure = Some(Error::Status(format!("worker exited with {}", code))),
                Ok(Err(e)) => failure = Some(e),
                Err(e) => failure = Some(Error::Internal(format!("supervision task failed: {}", e))),
            }
        }

        if let Some(pool) = self.pool.take() {
            pool.shutdown().await;
        }
        match failure {
            Some(e) => Err(e),
            None => {
                self.store.set_status(MonitorState::Stopped)?;
                tracing::info!("monitor stopped");
                Ok(())
            }
        }
    }

    fn reload(&mut self) {
        let fresh = match self.config.reload() {
            Ok(c) => c,
            Err(e) => {
                tracing::error!("reload failed, keeping current configuration: {}", e);
                return;
            }
        };
        if let Some(pool) = self.pool.as_mut() {
            if let Err(e) = pool.restart(&fresh.events) {
                tracing::error!("notification pool restart failed: {}", e);
            }
        }
        tracing::info!("configuration reloaded");
        self.publisher().publish(
            Event::new(EventKind::ConfigReloaded)
                .with("primary_volume", &fresh.session.primary_volume)
                .with("secondary", &fresh.session.secondary),
        );
    }
}
