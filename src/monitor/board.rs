//! Brick State Board
//!
//! Latest supervision state per brick, with the session-wide aggregate
//! republished to the monitor status file on every change.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tokio::sync::RwLock;

use crate::error::{Error, Result};
use crate::status::{MonitorStore, StatusStore, WorkerState};

/// Shared view of every supervised brick
pub struct StateBoard {
    states: RwLock<BTreeMap<PathBuf, WorkerState>>,
    state_dir: PathBuf,
    store: MonitorStore,
}

impl StateBoard {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            states: RwLock::new(BTreeMap::new()),
            state_dir: state_dir.to_path_buf(),
            store: MonitorStore::new(state_dir),
        }
    }

    /// Record `state` for `brick`, refresh the aggregate and write both status files
    pub async fn set(&self, brick: &Path, state: WorkerState) -> Result<WorkerState> {
        let aggregate = {
            let mut states = self.states.write().await;
            states.insert(brick.to_path_buf(), state);
            aggregate(states.values().copied()).unwrap_or(state)
        };

        // flock may wait on contention
        let brick_store = StatusStore::new(&self.state_dir, brick);
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || {
            let written = brick_store.set_worker_status(state);
            store.set_aggregate(aggregate).and(written)
        })
        .await
        .map_err(|e| Error::Internal(format!("status writer failed: {}", e)))??;
        Ok(aggregate)
    }

    pub async fn get(&self, brick: &Path) -> Option<WorkerState> {
        self.states.read().await.get(brick).copied()
    }

    /// Highest-severity state across all bricks
    pub async fn aggregate(&self) -> Option<WorkerState> {
        aggregate(self.states.read().await.values().copied())
    }
}

/// Maximum severity of `states`
pub fn aggregate(states: impl IntoIterator<Item = WorkerState>) -> Option<WorkerState> {
    states.into_iter().max()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_aggregate_is_max_severity() {
        use WorkerState::*;
        assert_eq!(aggregate(Vec::new()), None);
        assert_eq!(aggregate([Stable, Stable]), Some(Stable));
        assert_eq!(aggregate([Stable, Initializing]), Some(Initializing));
        assert_eq!(aggregate([Faulty, Initializing, Stable]), Some(Faulty));
        assert_eq!(aggregate([Faulty, Inconsistent]), Some(Inconsistent));
    }

    #[tokio::test]
    async fn test_board_publishes_aggregate() {
        let dir = tempdir().unwrap();
        let board = StateBoard::new(dir.path());
        let store = MonitorStore::new(dir.path());

        board.set(Path::new("/b1"), WorkerState::Initializing).await.unwrap();
        board.set(Path::new("/b2"), WorkerState::Faulty).await.unwrap();
        assert_eq!(store.load().unwrap().unwrap().aggregate, Some(WorkerState::Faulty));

        let agg = board.set(Path::new("/b2"), WorkerState::Stable).await.unwrap();
        assert_eq!(agg, WorkerState::Initializing);
        board.set(Path::new("/b1"), WorkerState::Stable).await.unwrap();
        assert_eq!(board.aggregate().await, Some(WorkerState::Stable));
        assert_eq!(store.load().unwrap().unwrap().aggregate, Some(WorkerState::Stable));

        let brick = StatusStore::new(dir.path(), Path::new("/b1")).load().unwrap();
        assert_eq!(brick.worker_status, "Active");
    }
}
