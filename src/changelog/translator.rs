//! Path Translator
//!
//! Classifies raw changelog records into NEW/MODIFY/RENAME/DELETE rows of
//! a [`ChangeDb`], collapsing create+rename, rename chains, rename-back
//! and create+delete, then resolves GFIDs to paths in three passes:
//! parent symlink walk, candidate parent directories, full crawl.

use std::collections::HashSet;
use std::path::Path;

use super::brick::{Brick, GfidEntry};
use super::parser::{self, ParsedChangelog};
use super::record::{ChangeRecord, EntryName, RawOp, RawRecord, RecordType};
use crate::db::{ChangeDb, NewChange};
use crate::error::{ErrorClass, Result};

/// Counters from one resolution pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolveStats {
    /// Parent GFIDs resolved through symlinks
    pub parents: usize,
    /// Inodes found inside candidate parent directories
    pub candidates: usize,
    /// Inodes found by the full crawl
    pub crawled: usize,
    /// Records left without a path
    pub unresolved: usize,
}

/// Changelog to path translator for one brick
pub struct Translator<'a> {
    db: &'a ChangeDb,
    brick: &'a Brick,
}

impl<'a> Translator<'a> {
    pub fn new(db: &'a ChangeDb, brick: &'a Brick) -> Self {
        Self { db, brick }
    }

    /// Parse and classify one changelog file
    pub fn ingest_file(&self, path: &Path) -> Result<usize> {
        let parsed = parser::parse_file(path)?;
        self.ingest(&parsed)
    }

    /// Classify every record of a parsed changelog
    pub fn ingest(&self, parsed: &ParsedChangelog) -> Result<usize> {
        self.db.transaction(|db| {
            for record in &parsed.records {
                classify(db, parsed.ts, record)?;
            }
            Ok(parsed.records.len())
        })
    }

    /// Resolve every pending location to a path
    pub fn resolve(&self) -> Result<ResolveStats> {
        let mut stats = ResolveStats::default();

        // pass 1: parents named by entry records
        for pgfid in self.db.unresolved_parents()? {
            match self.brick.dir_path(&pgfid) {
                Ok(Some(path)) => {
                    self.db.set_parent_path(&pgfid, &path)?;
                    stats.parents += 1;
                }
                Ok(None) => tracing::debug!("parent {} no longer on brick", pgfid),
                Err(e) if e.class() == ErrorClass::RecordSkip => {
                    tracing::warn!("skipping parent {}: {}", pgfid, e)
                }
                Err(e) => return Err(e),
            }
        }

        // pass 2: records without a location hint
        for gfid in self.db.unresolved_without_parent()? {
            match self.brick.lookup(&gfid)? {
                GfidEntry::Directory(path) => self.db.set_gfid_path(&gfid, &path)?,
                GfidEntry::File { inode } => {
                    self.db.add_inode(inode, &gfid)?;
                    let parents = self.brick.parent_gfids(&gfid)?;
                    if parents.is_empty() {
                        tracing::debug!("{} has no parent attributes, leaving it to the crawl", gfid);
                    }
                    for pgfid in parents {
                        self.db.add_parent_candidate(&pgfid)?;
                    }
                }
                GfidEntry::Missing => tracing::debug!("{} is gone from the brick", gfid),
            }
        }

        let mut pending: HashSet<u64> = self.db.pending_inodes()?.into_iter().collect();
        for pgfid in self.db.take_parent_candidates()? {
            if pending.is_empty() {
                break;
            }
            let Some(dir) = self.brick.dir_path(&pgfid)? else {
                continue;
            };
            for (inode, path) in self.brick.find_in_dir(&dir, &pending)? {
                self.db.set_inode_path(inode, &path)?;
                pending.remove(&inode);
                stats.candidates += 1;
            }
        }

        // pass 3: last resort
        if !pending.is_empty() {
            tracing::info!(
                "crawling {} for {} unresolved inodes",
                self.brick.root().display(),
                pending.len()
            );
            for (inode, path) in self.brick.crawl_for_inodes(&pending)? {
                self.db.set_inode_path(inode, &path)?;
                stats.crawled += 1;
            }
        }

        stats.unresolved = self
            .db
            .records()?
            .iter()
            .filter(|r| !r.is_resolved())
            .count();
        Ok(stats)
    }

    /// Translated records in output order
    pub fn records(&self) -> Result<Vec<ChangeRecord>> {
        self.db.records()
    }
}

/// Apply one raw record to the database
pub fn classify(db: &ChangeDb, ts: i64, record: &RawRecord) -> Result<()> {
    let gfid = record.gfid.as_str();
    match &record.op {
        RawOp::Create { entry, .. } | RawOp::Link { entry, .. } => {
            db.add(RecordType::New, &at(ts, gfid, entry))?;
        }
        RawOp::Rename { from, to } => on_rename(db, ts, gfid, from, to)?,
        RawOp::Remove {
            entry,
            deleted_path,
            ..
        } => on_remove(db, ts, gfid, entry, deleted_path.as_deref())?,
        RawOp::Data | RawOp::Meta { .. } => {
            if !db.exists(gfid, &[RecordType::New, RecordType::Modify])? {
                db.add(RecordType::Modify, &NewChange { ts, gfid, ..Default::default() })?;
            }
        }
    }
    Ok(())
}

fn at<'a>(ts: i64, gfid: &'a str, entry: &'a EntryName) -> NewChange<'a> {
    NewChange {
        ts,
        gfid,
        pgfid1: &entry.pgfid,
        bn1: &entry.basename,
        ..Default::default()
    }
}

fn on_rename(db: &ChangeDb, ts: i64, gfid: &str, from: &EntryName, to: &EntryName) -> Result<()> {
    if let Some(id) = db.find_at(RecordType::New, gfid, &from.pgfid, &from.basename)? {
        db.set_location1(id, &to.pgfid, &to.basename)?;
    } else if let Some(prev) = db.find_rename_to(gfid, &from.pgfid, &from.basename)? {
        if prev.pgfid1 == to.pgfid && prev.bn1 == to.basename {
            db.delete(prev.id)?;
        } else {
            db.set_location2(prev.id, &to.pgfid, &to.basename)?;
        }
    } else {
        db.add(
            RecordType::Rename,
            &NewChange {
                ts,
                gfid,
                pgfid1: &from.pgfid,
                bn1: &from.basename,
                pgfid2: &to.pgfid,
                bn2: &to.basename,
                ..Default::default()
            },
        )?;
    }

    // keep modify-after-rename ordering
    if db.delete_kind(gfid, RecordType::Modify)? > 0 {
        db.add(RecordType::Modify, &NewChange { ts, gfid, ..Default::default() })?;
    }
    Ok(())
}

fn on_remove(db: &ChangeDb, ts: i64, gfid: &str, entry: &EntryName, deleted_path: Option<&str>) -> Result<()> {
    if let Some(id) = db.find_at(RecordType::New, gfid, &entry.pgfid, &entry.basename)? {
        db.delete(id)?;
    } else {
        let mut change = at(ts, gfid, entry);
        change.path1 = deleted_path.unwrap_or("");
        db.add(RecordType::Delete, &change)?;
    }

    if let Some(path) = deleted_path {
        db.propagate_deleted_path(gfid, &entry.pgfid, &entry.basename, path)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::brick::testing::{make_dir, make_file, MapParents};
    use super::super::brick::ROOT_GFID;
    use super::super::parser::parse_str;
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    const G: &str = "9a9a9a9a-0000-4000-8000-00000000000a";
    const P1: &str = "p1p1p1p1-0000-4000-8000-000000000001";
    const P2: &str = "p2p2p2p2-0000-4000-8000-000000000002";
    const ROOTDIR: &str = "d0d0d0d0-0000-4000-8000-000000000000";

    fn ingest(db: &ChangeDb, ts: i64, lines: &[String]) {
        let parsed = parse_str(ts, &lines.join("\n"));
        assert_eq!(parsed.skipped, 0);
        for r in &parsed.records {
            classify(db, ts, r).unwrap();
        }
    }

    #[test]
    fn test_create_then_rename_collapses() {
        let db = ChangeDb::in_memory().unwrap();
        ingest(&db, 1, &[
            format!("E {} CREATE 33188 0 0 {}/a", G, P1),
            format!("E {} RENAME {}/a {}/b", G, P1, P2),
        ]);
        let records = db.records().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind, RecordType::New);
        assert_eq!((records[0].pgfid1.as_str(), records[0].bn1.as_str()), (P2, "b"));
    }

    #[test]
    fn test_rename_back_cancels() {
        let db = ChangeDb::in_memory().unwrap();
        ingest(&db, 1, &[format!("E {} RENAME {}/a {}/b", G, P1, P2)]);
        ingest(&db, 2, &[format!("E {} RENAME {}/b {}/a", G, P2, P1)]);
        assert!(db.records_for(G).unwrap().is_empty());
    }

    #[test]
    fn test_rename_chain_updates_destination() {
        let db = ChangeDb::in_memory().unwrap();
        ingest(&db, 1, &[
            format!("E {} RENAME {}/a {}/b", G, P1, P2),
            format!("E {} RENAME {}/b {}/c", G, P2, P2),
        ]);
        let records = db.records().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind, RecordType::Rename);
        assert_eq!((records[0].bn1.as_str(), records[0].bn2.as_str()), ("a", "c"));
    }

    #[test]
    fn test_delete_cancels_create() {
        let db = ChangeDb::in_memory().unwrap();
        ingest(&db, 1, &[
            format!("E {} CREATE 33188 0 0 {}/a", G, P1),
            format!("D {}", G),
            format!("E {} UNLINK {}/a", G, P1),
        ]);
        assert!(db.records().unwrap().is_empty());
    }

    #[test]
    fn test_delete_of_new_leaves_earlier_modify() {
        let db = ChangeDb::in_memory().unwrap();
        ingest(&db, 1, &[format!("D {}", G)]);
        ingest(&db, 2, &[
            format!("E {} CREATE 33188 0 0 {}/a", G, P1),
            format!("E {} UNLINK {}/a", G, P1),
        ]);
        let records = db.records().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!((records[0].ts, records[0].kind), (1, RecordType::Modify));
    }

    #[test]
    fn test_modify_coalesces_and_follows_rename() {
        let db = ChangeDb::in_memory().unwrap();
        ingest(&db, 1, &[
            format!("D {}", G),
            format!("M {} SETATTR", G),
            format!("D {}", G),
        ]);
        assert_eq!(db.records().unwrap().len(), 1);

        ingest(&db, 2, &[format!("E {} RENAME {}/a {}/b", G, P1, P2)]);
        let kinds: Vec<RecordType> = db.records().unwrap().iter().map(|r| r.kind).collect();
        assert_eq!(kinds, vec![RecordType::Rename, RecordType::Modify]);
    }

    #[test]
    fn test_deleted_path_reaches_children() {
        let db = ChangeDb::in_memory().unwrap();
        let child = "c1c1c1c1-0000-4000-8000-000000000001";
        ingest(&db, 1, &[
            format!("E {} UNLINK {}/f", child, G),
            format!("E {} RMDIR {}/dir gone/dir", G, P1),
        ]);
        let records = db.records().unwrap();
        assert_eq!(records[0].path1, "gone/dir/f");
        assert_eq!(records[1].path1, "gone/dir");
    }

    #[test]
    fn test_output_order_follows_timestamps() {
        let db = ChangeDb::in_memory().unwrap();
        let other = "0b0b0b0b-0000-4000-8000-00000000000b";
        ingest(&db, 5, &[format!("E {} CREATE 33188 0 0 {}/late", other, P1)]);
        ingest(&db, 3, &[format!("E {} CREATE 33188 0 0 {}/early", G, P1)]);
        let records = db.records().unwrap();
        assert_eq!(records[0].bn1, "early");
        assert_eq!(records[1].bn1, "late");
        assert!(records.windows(2).all(|w| w[0].ts <= w[1].ts));
    }

    #[test]
    fn test_end_to_end_create_modify_rename() {
        let dir = tempdir().unwrap();
        make_dir(dir.path(), ROOTDIR, ROOT_GFID, "root");
        make_file(dir.path(), G, "root/file2");

        let db = ChangeDb::in_memory().unwrap();
        let brick = Brick::new(dir.path());
        let translator = Translator::new(&db, &brick);
        let content = format!(
            "GlusterFS Changelog | version: v1.2 | encoding : 2\n\
             E {g} CREATE 33188 0 0 {r}/file1\0M {g} SETATTR\0E {g} RENAME {r}/file1 {r}/file2\0",
            g = G,
            r = ROOTDIR
        );
        translator.ingest(&parse_str(1700000000, &content)).unwrap();
        let stats = translator.resolve().unwrap();
        assert_eq!(stats.unresolved, 0);

        let records = translator.records().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind, RecordType::New);
        assert_eq!(records[0].path1, "root/file2");
    }

    #[test]
    fn test_modify_resolved_through_candidate_parent() {
        let dir = tempdir().unwrap();
        make_dir(dir.path(), ROOTDIR, ROOT_GFID, "root");
        make_file(dir.path(), G, "root/data.bin");

        let mut parents = HashMap::new();
        parents.insert(G.to_string(), vec![ROOTDIR.to_string()]);
        let brick = Brick::with_parent_lookup(dir.path(), Box::new(MapParents(parents)));

        let db = ChangeDb::in_memory().unwrap();
        let translator = Translator::new(&db, &brick);
        translator.ingest(&parse_str(1, &format!("D {}\n", G))).unwrap();
        let stats = translator.resolve().unwrap();
        assert_eq!(stats.candidates, 1);
        assert_eq!(stats.crawled, 0);
        assert_eq!(translator.records().unwrap()[0].path1, "root/data.bin");
    }

    #[test]
    fn test_modify_falls_back_to_full_crawl() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("deep/er")).unwrap();
        make_file(dir.path(), G, "deep/er/x");

        let brick = Brick::with_parent_lookup(dir.path(), Box::new(MapParents(HashMap::new())));
        let db = ChangeDb::in_memory().unwrap();
        let translator = Translator::new(&db, &brick);
        translator.ingest(&parse_str(1, &format!("M {} SETXATTR\n", G))).unwrap();
        let stats = translator.resolve().unwrap();
        assert_eq!(stats.crawled, 1);
        assert_eq!(translator.records().unwrap()[0].path1, "deep/er/x");
    }
}
