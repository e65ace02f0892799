//! Output Merger
//!
//! Result database shared by the node agents and the merge step. Rows are
//! unique on `(type, path1, path2)`; a repeated insert is silently
//! ignored. GFIDs that never resolved are kept apart for escalation.

use std::path::Path;

use rusqlite::{params, Connection};

use crate::changelog::record::{ChangeRecord, RecordType};
use crate::error::Result;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS finallist (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    ts INTEGER NOT NULL,
    type TEXT NOT NULL,
    gfid TEXT NOT NULL,
    path1 TEXT NOT NULL,
    path2 TEXT NOT NULL DEFAULT '',
    UNIQUE (type, path1, path2) ON CONFLICT IGNORE
);

CREATE TABLE IF NOT EXISTS failures (
    gfid TEXT PRIMARY KEY ON CONFLICT IGNORE
);
"#;

/// One merged output row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputRow {
    pub ts: i64,
    pub kind: RecordType,
    pub gfid: String,
    pub path1: String,
    pub path2: String,
}

/// De-duplicating result database
pub struct OutputMerger {
    /// Database connection
    conn: Connection,
}

impl OutputMerger {
    /// Create or open a result database file
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    /// Open a private in-memory result database
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    /// Insert a resolved row; returns false when it was already present
    pub fn add(&self, ts: i64, kind: RecordType, gfid: &str, path1: &str, path2: &str) -> Result<bool> {
        let n = self.conn.execute(
            "INSERT INTO finallist (ts, type, gfid, path1, path2) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![ts, kind, gfid, path1, path2],
        )?;
        Ok(n > 0)
    }

    /// Record a GFID that could not be resolved
    pub fn add_failure(&self, gfid: &str) -> Result<()> {
        self.conn
            .execute("INSERT INTO failures (gfid) VALUES (?1)", params![gfid])?;
        Ok(())
    }

    /// Copy translated records in, splitting resolved from unresolved
    pub fn add_records(&self, records: &[ChangeRecord]) -> Result<usize> {
        self.transaction(|| {
            let mut unresolved = 0;
            for record in records {
                if record.is_resolved() {
                    self.add(record.ts, record.kind, &record.gfid, &record.path1, &record.path2)?;
                } else {
                    unresolved += 1;
                    self.add_failure(&record.gfid)?;
                }
            }
            Ok(unresolved)
        })
    }

    /// Union another result database into this one, preserving its order
    pub fn merge_from(&self, other: &Path) -> Result<u64> {
        let before = self.count()?;
        let src = Connection::open(other)?;
        src.execute_batch(SCHEMA)?;

        let mut stmt =
            src.prepare("SELECT ts, type, gfid, path1, path2 FROM finallist ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            Ok(OutputRow {
                ts: row.get(0)?,
                kind: row.get(1)?,
                gfid: row.get(2)?,
                path1: row.get(3)?,
                path2: row.get(4)?,
            })
        })?;

        let rows = rows.collect::<rusqlite::Result<Vec<_>>>()?;

        let mut stmt = src.prepare("SELECT gfid FROM failures ORDER BY gfid")?;
        let failures = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        self.transaction(|| {
            for row in &rows {
                self.add(row.ts, row.kind, &row.gfid, &row.path1, &row.path2)?;
            }
            for gfid in &failures {
                self.add_failure(gfid)?;
            }
            Ok(())
        })?;

        Ok(self.count()? - before)
    }

    /// Rows in output order
    pub fn rows(&self) -> Result<Vec<OutputRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT ts, type, gfid, path1, path2 FROM finallist ORDER BY ts ASC, id ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(OutputRow {
                ts: row.get(0)?,
                kind: row.get(1)?,
                gfid: row.get(2)?,
                path1: row.get(3)?,
                path2: row.get(4)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// GFIDs that never resolved
    pub fn failures(&self) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare("SELECT gfid FROM failures ORDER BY gfid")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Number of rows
    pub fn count(&self) -> Result<u64> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM finallist", [], |row| row.get(0))?;
        Ok(n as u64)
    }

    pub(crate) fn transaction<T>(&self, f: impl FnOnce() -> Result<T>) -> Result<T> {
        self.conn.execute_batch("BEGIN")?;
        match f() {
            Ok(v) => {
                self.conn.execute_batch("COMMIT")?;
                Ok(v)
            }
            Err(e) => {
                let _ = self.conn.execute_batch("ROLLBACK");
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_idempotent_insert() {
        let db = OutputMerger::in_memory().unwrap();
        assert!(db.add(1, RecordType::New, "g1", "a/b", "").unwrap());
        assert!(!db.add(2, RecordType::New, "g1", "a/b", "").unwrap());
        assert_eq!(db.count().unwrap(), 1);
        // same path, different kind is a different row
        assert!(db.add(3, RecordType::Modify, "g1", "a/b", "").unwrap());
        assert_eq!(db.count().unwrap(), 2);
    }

    #[test]
    fn test_merge_deduplicates_across_nodes() {
        let dir = tempdir().unwrap();
        let node1 = dir.path().join("node1.db");
        let node2 = dir.path().join("node2.db");
        {
            let a = OutputMerger::open(&node1).unwrap();
            a.add(5, RecordType::New, "g1", "/a/b", "").unwrap();
            a.add(6, RecordType::Modify, "g2", "/a/c", "").unwrap();
            a.add_failure("g9").unwrap();
            let b = OutputMerger::open(&node2).unwrap();
            b.add(5, RecordType::New, "g1", "/a/b", "").unwrap();
            b.add(4, RecordType::Delete, "g3", "/old", "").unwrap();
            b.add_failure("g9").unwrap();
        }

        let merged = OutputMerger::open(&dir.path().join("merged.db")).unwrap();
        assert_eq!(merged.merge_from(&node1).unwrap(), 2);
        assert_eq!(merged.merge_from(&node2).unwrap(), 1);

        let rows = merged.rows().unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows.iter().filter(|r| r.path1 == "/a/b").count(), 1);
        // ordered by timestamp, then insertion
        assert_eq!(rows[0].path1, "/old");
        assert_eq!(rows[1].path1, "/a/b");
        assert_eq!(merged.failures().unwrap(), vec!["g9".to_string()]);
    }

    #[test]
    fn test_add_records_splits_failures() {
        let db = OutputMerger::in_memory().unwrap();
        let resolved = ChangeRecord {
            id: 1,
            ts: 1,
            kind: RecordType::Rename,
            gfid: "g1".into(),
            pgfid1: "p".into(),
            bn1: "a".into(),
            pgfid2: "p".into(),
            bn2: "b".into(),
            path1: "a".into(),
            path2: "b".into(),
        };
        let mut half = resolved.clone();
        half.gfid = "g2".into();
        half.path2 = String::new();

        assert_eq!(db.add_records(&[resolved, half]).unwrap(), 1);
        assert_eq!(db.count().unwrap(), 1);
        assert_eq!(db.failures().unwrap(), vec!["g2".to_string()]);
    }
}
