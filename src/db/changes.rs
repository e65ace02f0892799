//! Change Database
//!
//! Per-worker SQLite store holding classified change records and the
//! in-flight path resolution state (inode to GFID pairs and candidate
//! parent directories).

use std::collections::HashSet;
use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::changelog::record::{ChangeRecord, RecordType};
use crate::error::Result;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS gfidpath (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    ts INTEGER NOT NULL,
    type TEXT NOT NULL,
    gfid TEXT NOT NULL,
    pgfid1 TEXT NOT NULL DEFAULT '',
    bn1 TEXT NOT NULL DEFAULT '',
    pgfid2 TEXT NOT NULL DEFAULT '',
    bn2 TEXT NOT NULL DEFAULT '',
    path1 TEXT NOT NULL DEFAULT '',
    path2 TEXT NOT NULL DEFAULT ''
);

CREATE INDEX IF NOT EXISTS idx_gfidpath_gfid ON gfidpath(gfid);
CREATE INDEX IF NOT EXISTS idx_gfidpath_pgfid1 ON gfidpath(pgfid1);

CREATE TABLE IF NOT EXISTS pgfid (
    pgfid TEXT PRIMARY KEY ON CONFLICT IGNORE
);

CREATE TABLE IF NOT EXISTS inodegfid (
    inode INTEGER NOT NULL,
    gfid TEXT NOT NULL,
    converted INTEGER NOT NULL DEFAULT 0,
    UNIQUE (inode, gfid) ON CONFLICT IGNORE
);
"#;

const COLUMNS: &str = "id, ts, type, gfid, pgfid1, bn1, pgfid2, bn2, path1, path2";

/// New row for the gfidpath table
#[derive(Debug, Clone, Default)]
pub struct NewChange<'a> {
    pub ts: i64,
    pub gfid: &'a str,
    pub pgfid1: &'a str,
    pub bn1: &'a str,
    pub pgfid2: &'a str,
    pub bn2: &'a str,
    pub path1: &'a str,
}

/// SQLite-backed change database owned by one worker or node agent
pub struct ChangeDb {
    /// Database connection
    conn: Connection,
}

impl ChangeDb {
    /// Create or open the database file
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    /// Open a private in-memory database
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    /// Forget everything, ready for the next batch
    pub fn reset(&self) -> Result<()> {
        self.conn.execute_batch(
            "DELETE FROM gfidpath; DELETE FROM pgfid; DELETE FROM inodegfid;",
        )?;
        Ok(())
    }

    /// Insert a record, returning its sequence id
    pub fn add(&self, kind: RecordType, change: &NewChange<'_>) -> Result<i64> {
        self.conn.execute(
            r#"
            INSERT INTO gfidpath (ts, type, gfid, pgfid1, bn1, pgfid2, bn2, path1)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                change.ts,
                kind,
                change.gfid,
                change.pgfid1,
                change.bn1,
                change.pgfid2,
                change.bn2,
                change.path1,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Id of a record of `kind` for `gfid` whose first location matches
    pub fn find_at(&self, kind: RecordType, gfid: &str, pgfid1: &str, bn1: &str) -> Result<Option<i64>> {
        let id = self
            .conn
            .query_row(
                r#"
                SELECT id FROM gfidpath
                WHERE type = ?1 AND gfid = ?2 AND pgfid1 = ?3 AND bn1 = ?4
                ORDER BY id LIMIT 1
                "#,
                params![kind, gfid, pgfid1, bn1],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }

    /// RENAME record for `gfid` whose destination is `pgfid2/bn2`
    pub fn find_rename_to(&self, gfid: &str, pgfid2: &str, bn2: &str) -> Result<Option<ChangeRecord>> {
        let sql = format!(
            "SELECT {} FROM gfidpath WHERE type = ?1 AND gfid = ?2 AND pgfid2 = ?3 AND bn2 = ?4 ORDER BY id LIMIT 1",
            COLUMNS
        );
        let record = self
            .conn
            .query_row(&sql, params![RecordType::Rename, gfid, pgfid2, bn2], read_record)
            .optional()?;
        Ok(record)
    }

    /// Whether `gfid` already has a record of one of `kinds`
    pub fn exists(&self, gfid: &str, kinds: &[RecordType]) -> Result<bool> {
        for kind in kinds {
            let found: Option<i64> = self
                .conn
                .query_row(
                    "SELECT 1 FROM gfidpath WHERE gfid = ?1 AND type = ?2 LIMIT 1",
                    params![gfid, kind],
                    |row| row.get(0),
                )
                .optional()?;
            if found.is_some() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Point a record's first location somewhere else
    pub fn set_location1(&self, id: i64, pgfid1: &str, bn1: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE gfidpath SET pgfid1 = ?1, bn1 = ?2 WHERE id = ?3",
            params![pgfid1, bn1, id],
        )?;
        Ok(())
    }

    /// Point a record's second location somewhere else
    pub fn set_location2(&self, id: i64, pgfid2: &str, bn2: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE gfidpath SET pgfid2 = ?1, bn2 = ?2 WHERE id = ?3",
            params![pgfid2, bn2, id],
        )?;
        Ok(())
    }

    /// Remove one record
    pub fn delete(&self, id: i64) -> Result<()> {
        self.conn.execute("DELETE FROM gfidpath WHERE id = ?1", params![id])?;
        Ok(())
    }

    /// Remove every record of `kind` for `gfid`, returning how many went
    pub fn delete_kind(&self, gfid: &str, kind: RecordType) -> Result<usize> {
        let n = self.conn.execute(
            "DELETE FROM gfidpath WHERE gfid = ?1 AND type = ?2",
            params![gfid, kind],
        )?;
        Ok(n)
    }

    /// Record the already-known path of a deleted entry and of its children
    pub fn propagate_deleted_path(&self, gfid: &str, pgfid: &str, bn: &str, deleted_path: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE gfidpath SET path1 = ?1 WHERE gfid = ?2 AND pgfid1 = ?3 AND bn1 = ?4",
            params![deleted_path, gfid, pgfid, bn],
        )?;
        self.conn.execute(
            "UPDATE gfidpath SET path2 = ?1 WHERE type = ?2 AND gfid = ?3 AND pgfid2 = ?4 AND bn2 = ?5",
            params![deleted_path, RecordType::Rename, gfid, pgfid, bn],
        )?;
        // children of a removed directory cannot be resolved once it is gone
        self.conn.execute(
            "UPDATE gfidpath SET path1 = ?1 || '/' || bn1 WHERE pgfid1 = ?2 AND path1 = ''",
            params![deleted_path, gfid],
        )?;
        self.conn.execute(
            "UPDATE gfidpath SET path2 = ?1 || '/' || bn2 WHERE pgfid2 = ?2 AND path2 = ''",
            params![deleted_path, gfid],
        )?;
        Ok(())
    }

    /// Parent GFIDs still referenced by an unresolved location
    pub fn unresolved_parents(&self) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT pgfid1 FROM gfidpath WHERE path1 = '' AND pgfid1 != ''
            UNION
            SELECT pgfid2 FROM gfidpath WHERE type = 'RENAME' AND path2 = '' AND pgfid2 != ''
            "#,
        )?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Resolve every location under `pgfid` now that its path is known
    pub fn set_parent_path(&self, pgfid: &str, path: &str) -> Result<()> {
        self.conn.execute(
            r#"
            UPDATE gfidpath SET path1 = CASE WHEN ?1 = '' THEN bn1 ELSE ?1 || '/' || bn1 END
            WHERE pgfid1 = ?2 AND path1 = ''
            "#,
            params![path, pgfid],
        )?;
        self.conn.execute(
            r#"
            UPDATE gfidpath SET path2 = CASE WHEN ?1 = '' THEN bn2 ELSE ?1 || '/' || bn2 END
            WHERE type = 'RENAME' AND pgfid2 = ?2 AND path2 = ''
            "#,
            params![path, pgfid],
        )?;
        Ok(())
    }

    /// GFIDs of records with no location hint and no path
    pub fn unresolved_without_parent(&self) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT DISTINCT gfid FROM gfidpath WHERE path1 = '' AND pgfid1 = '' ORDER BY gfid",
        )?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Set path1 for a GFID that was resolved directly
    pub fn set_gfid_path(&self, gfid: &str, path: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE gfidpath SET path1 = ?1 WHERE gfid = ?2 AND path1 = ''",
            params![path, gfid],
        )?;
        Ok(())
    }

    /// Remember the inode of a GFID awaiting a crawl
    pub fn add_inode(&self, inode: u64, gfid: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO inodegfid (inode, gfid) VALUES (?1, ?2)",
            params![inode as i64, gfid],
        )?;
        Ok(())
    }

    /// Remember a candidate parent directory
    pub fn add_parent_candidate(&self, pgfid: &str) -> Result<()> {
        self.conn.execute("INSERT INTO pgfid (pgfid) VALUES (?1)", params![pgfid])?;
        Ok(())
    }

    /// Drain the candidate parent directories
    pub fn take_parent_candidates(&self) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare("SELECT pgfid FROM pgfid ORDER BY pgfid")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        self.conn.execute("DELETE FROM pgfid", [])?;
        Ok(out)
    }

    /// Inodes still waiting for a path
    pub fn pending_inodes(&self) -> Result<Vec<u64>> {
        let mut stmt = self
            .conn
            .prepare("SELECT DISTINCT inode FROM inodegfid WHERE converted = 0 ORDER BY inode")?;
        let rows = stmt.query_map([], |row| row.get::<_, i64>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row? as u64);
        }
        Ok(out)
    }

    /// Resolve the GFIDs behind `inode` to `path`
    pub fn set_inode_path(&self, inode: u64, path: &str) -> Result<()> {
        self.conn.execute(
            r#"
            UPDATE gfidpath SET path1 = ?1
            WHERE path1 = '' AND gfid IN (SELECT gfid FROM inodegfid WHERE inode = ?2)
            "#,
            params![path, inode as i64],
        )?;
        self.conn.execute(
            "UPDATE inodegfid SET converted = 1 WHERE inode = ?1",
            params![inode as i64],
        )?;
        Ok(())
    }

    /// All records in output order.
    ///
    /// Resolved records repeating an earlier `(type, path1, path2)` are
    /// left out, so one change yields one operation.
    pub fn records(&self) -> Result<Vec<ChangeRecord>> {
        let sql = format!("SELECT {} FROM gfidpath ORDER BY ts ASC, id ASC", COLUMNS);
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], read_record)?;
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for row in rows {
            let record = row?;
            if record.is_resolved()
                && !seen.insert((record.kind, record.path1.clone(), record.path2.clone()))
            {
                continue;
            }
            out.push(record);
        }
        Ok(out)
    }

    /// Records for one GFID in output order
    pub fn records_for(&self, gfid: &str) -> Result<Vec<ChangeRecord>> {
        let sql = format!(
            "SELECT {} FROM gfidpath WHERE gfid = ?1 ORDER BY ts ASC, id ASC",
            COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![gfid], read_record)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Number of records
    pub fn count(&self) -> Result<u64> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM gfidpath", [], |row| row.get(0))?;
        Ok(n as u64)
    }

    /// Run `f` inside one transaction
    pub fn transaction<T>(&self, f: impl FnOnce(&Self) -> Result<T>) -> Result<T> {
        self.conn.execute_batch("BEGIN")?;
        match f(self) {
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

fn read_record(row: &Row<'_>) -> rusqlite::Result<ChangeRecord> {
    Ok(ChangeRecord {
        id: row.get(0)?,
        ts: row.get(1)?,
        kind: row.get(2)?,
        gfid: row.get(3)?,
        pgfid1: row.get(4)?,
        bn1: row.get(5)?,
        pgfid2: row.get(6)?,
        bn2: row.get(7)?,
        path1: row.get(8)?,
        path2: row.get(9)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_add_and_find() {
        let dir = tempdir().unwrap();
        let db = ChangeDb::open(&dir.path().join("changes.db")).unwrap();

        let id = db
            .add(RecordType::New, &NewChange { ts: 10, gfid: "g1", pgfid1: "p1", bn1: "a", ..Default::default() })
            .unwrap();
        assert_eq!(db.find_at(RecordType::New, "g1", "p1", "a").unwrap(), Some(id));
        assert_eq!(db.find_at(RecordType::New, "g1", "p1", "b").unwrap(), None);
        assert!(db.exists("g1", &[RecordType::Modify, RecordType::New]).unwrap());
        assert!(!db.exists("g2", &[RecordType::New]).unwrap());

        db.reset().unwrap();
        assert_eq!(db.count().unwrap(), 0);
    }

    #[test]
    fn test_parent_path_fan_out() {
        let db = ChangeDb::in_memory().unwrap();
        db.add(RecordType::New, &NewChange { ts: 1, gfid: "g1", pgfid1: "p", bn1: "a", ..Default::default() })
            .unwrap();
        db.add(
            RecordType::Rename,
            &NewChange { ts: 2, gfid: "g2", pgfid1: "q", bn1: "x", pgfid2: "p", bn2: "y", ..Default::default() },
        )
        .unwrap();

        let mut parents = db.unresolved_parents().unwrap();
        parents.sort();
        assert_eq!(parents, vec!["p".to_string(), "q".to_string()]);

        db.set_parent_path("p", "dir").unwrap();
        db.set_parent_path("q", "").unwrap();

        let records = db.records().unwrap();
        assert_eq!(records[0].path1, "dir/a");
        assert_eq!(records[1].path1, "x");
        assert_eq!(records[1].path2, "dir/y");
        assert!(db.unresolved_parents().unwrap().is_empty());
    }

    #[test]
    fn test_inode_resolution() {
        let db = ChangeDb::in_memory().unwrap();
        db.add(RecordType::Modify, &NewChange { ts: 1, gfid: "g1", ..Default::default() }).unwrap();
        db.add_inode(42, "g1").unwrap();
        db.add_inode(42, "g1").unwrap();
        assert_eq!(db.pending_inodes().unwrap(), vec![42]);

        db.set_inode_path(42, "d/f").unwrap();
        assert!(db.pending_inodes().unwrap().is_empty());
        assert_eq!(db.records().unwrap()[0].path1, "d/f");
    }

    #[test]
    fn test_repeated_resolved_change_listed_once() {
        let db = ChangeDb::in_memory().unwrap();
        // the same file modified in two changelogs
        db.add(RecordType::Modify, &NewChange { ts: 5, gfid: "g1", path1: "d/f", ..Default::default() })
            .unwrap();
        db.add(RecordType::New, &NewChange { ts: 6, gfid: "g2", path1: "d/g", ..Default::default() })
            .unwrap();
        db.add(RecordType::Modify, &NewChange { ts: 7, gfid: "g1", path1: "d/f", ..Default::default() })
            .unwrap();
        db.add(RecordType::Modify, &NewChange { ts: 8, gfid: "g3", ..Default::default() }).unwrap();
        db.add(RecordType::Modify, &NewChange { ts: 9, gfid: "g3", ..Default::default() }).unwrap();

        let records = db.records().unwrap();
        let listed: Vec<_> = records.iter().map(|r| (r.ts, r.path1.as_str())).collect();
        // unresolved rows stay so resolution can still reach them
        assert_eq!(listed, vec![(5, "d/f"), (6, "d/g"), (8, ""), (9, "")]);
        assert_eq!(db.count().unwrap(), 5);
    }

    #[test]
    fn test_parent_candidates_drain() {
        let db = ChangeDb::in_memory().unwrap();
        db.add_parent_candidate("p1").unwrap();
        db.add_parent_candidate("p1").unwrap();
        db.add_parent_candidate("p2").unwrap();
        assert_eq!(db.take_parent_candidates().unwrap().len(), 2);
        assert!(db.take_parent_candidates().unwrap().is_empty());
    }
}
