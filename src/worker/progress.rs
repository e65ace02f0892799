//! Progress Store
//!
//! Durable sync progress for one brick, kept in the worker's working
//! directory. The stored time is the changelog timestamp up to which the
//! secondary is known to hold every change; a restarted worker resumes
//! its crawl from there.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection};

use crate::error::{Error, Result};

/// Persistent progress tracker backed by SQLite
pub struct ProgressStore {
    /// Database connection
    conn: Mutex<Connection>,
    /// Secondary the progress refers to
    secondary_id: String,
}

impl ProgressStore {
    /// Create or open the progress database in `dir`
    pub fn open(dir: &Path, secondary_id: &str) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let conn = Connection::open(dir.join("progress.db"))?;
        Self::init(conn, secondary_id)
    }

    pub fn in_memory(secondary_id: &str) -> Result<Self> {
        Self::init(Connection::open_in_memory()?, secondary_id)
    }

    fn init(conn: Connection, secondary_id: &str) -> Result<Self> {
        conn.execute_batch(
            r#"
            PRAGMA synchronous = FULL;

            CREATE TABLE IF NOT EXISTS progress (
                secondary TEXT NOT NULL,
                key TEXT NOT NULL,
                value_int INTEGER NOT NULL,
                updated_at TEXT DEFAULT CURRENT_TIMESTAMP,
                PRIMARY KEY (secondary, key)
            );
            "#,
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
            secondary_id: secondary_id.to_string(),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn get(&self, key: &str) -> Result<Option<i64>> {
        let conn = self.conn();
        let result: std::result::Result<i64, _> = conn.query_row(
            "SELECT value_int FROM progress WHERE secondary = ?1 AND key = ?2",
            params![self.secondary_id, key],
            |row| row.get(0),
        );
        match result {
            Ok(v) => Ok(Some(v)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(Error::Database(e)),
        }
    }

    fn set(&self, key: &str, value: i64) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            r#"
            INSERT INTO progress (secondary, key, value_int) VALUES (?1, ?2, ?3)
            ON CONFLICT(secondary, key) DO UPDATE SET value_int = ?3, updated_at = CURRENT_TIMESTAMP
            "#,
            params![self.secondary_id, key, value],
        )?;
        Ok(())
    }

    /// Data sync time, `None` before the first completed crawl
    pub fn stime(&self) -> Result<Option<i64>> {
        self.get("stime")
    }

    /// Store a new data sync time; it never moves backwards
    pub fn set_stime(&self, ts: i64) -> Result<()> {
        if self.stime()?.map_or(false, |cur| cur >= ts) {
            return Ok(());
        }
        self.set("stime", ts)
    }

    /// Entry sync time
    pub fn entry_stime(&self) -> Result<Option<i64>> {
        self.get("entry_stime")
    }

    pub fn set_entry_stime(&self, ts: i64) -> Result<()> {
        if self.entry_stime()?.map_or(false, |cur| cur >= ts) {
            return Ok(());
        }
        self.set("entry_stime", ts)
    }
}
