//! Changelog Query Interface
//!
//! The call boundary into the storage engine's changelog stream: register
//! a brick, scan for newly rolled-over changelogs, list them, mark them
//! consumed, and replay a historical range. [`FsChangelog`] implements it
//! directly on the brick's changelog directory; the agent process serves
//! the same calls over RPC.
//!
//! Layout read: `<brick>/.glusterfs/changelogs/CHANGELOG.<ts>` plus
//! `htime/HTIME.<ts>` markers, one per continuous changelog session.
//! Layout written: `<workdir>/.processing`, `.processed`,
//! `.history/.processing`, `.history/.processed`.

use std::path::{Path, PathBuf};

use super::brick::{retry_transient, GFID_DIR};
use super::parser::{changelog_ts, CHANGELOG_PREFIX};
use crate::error::{Error, Result};

/// Changelog directory below the brick root
pub const CHANGELOG_DIR: &str = "changelogs";

/// Prefix of changelog session markers
const HTIME_PREFIX: &str = "HTIME.";

/// Result of a history request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryRange {
    /// Last timestamp the replay covers
    pub actual_end: i64,
    /// Number of changelogs published
    pub published: usize,
}

/// Native changelog query interface
pub trait ChangelogQuery: Send {
    /// Register `brick`, publishing into `workdir`
    fn register(&mut self, brick: &Path, workdir: &Path) -> Result<()>;

    /// Publish newly rolled-over changelogs, returning how many are pending
    fn scan(&mut self) -> Result<usize>;

    /// Pending live changelogs in sequence order
    fn getchanges(&mut self) -> Result<Vec<PathBuf>>;

    /// Mark a live changelog consumed
    fn done(&mut self, changelog: &Path) -> Result<()>;

    /// Publish the historical range `(start, end]`
    fn history(&mut self, start: i64, end: i64, workers: usize) -> Result<HistoryRange>;

    /// Number of pending historical changelogs
    fn history_scan(&mut self) -> Result<usize>;

    /// Pending historical changelogs in sequence order
    fn history_getchanges(&mut self) -> Result<Vec<PathBuf>>;

    /// Mark a historical changelog consumed
    fn history_done(&mut self, changelog: &Path) -> Result<()>;
}

/// Registration state of [`FsChangelog`]
struct Registration {
    brick: PathBuf,
    workdir: PathBuf,
    /// Live changelogs newer than this are published by `scan`
    live_after: i64,
}

/// Changelog query interface over the brick's changelog directory
#[derive(Default)]
pub struct FsChangelog {
    reg: Option<Registration>,
}

impl FsChangelog {
    pub fn new() -> Self {
        Self::default()
    }

    fn registration(&self) -> Result<&Registration> {
        self.reg
            .as_ref()
            .ok_or_else(|| Error::HistoryUnavailable("brick not registered".into()))
    }

    /// Changelog directory of a brick
    pub fn changelog_dir(brick: &Path) -> PathBuf {
        brick.join(GFID_DIR).join(CHANGELOG_DIR)
    }

    /// Timestamps of all changelogs on the brick, ascending
    fn available(brick: &Path) -> Result<Vec<i64>> {
        let dir = Self::changelog_dir(brick);
        let entries = match retry_transient(|| std::fs::read_dir(&dir).map_err(Error::from)) {
            Ok(e) => e,
            Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut out: Vec<i64> = entries
            .filter_map(|e| e.ok())
            .filter_map(|e| changelog_ts(&e.path()))
            .collect();
        out.sort_unstable();
        Ok(out)
    }

    /// Start timestamps of the changelog sessions, ascending
    fn sessions(brick: &Path) -> Result<Vec<i64>> {
        let dir = Self::changelog_dir(brick).join("htime");
        let entries = match std::fs::read_dir(&dir) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut out: Vec<i64> = entries
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                e.file_name()
                    .to_str()
                    .and_then(|n| n.strip_prefix(HTIME_PREFIX))
                    .and_then(|t| t.parse().ok())
            })
            .collect();
        out.sort_unstable();
        Ok(out)
    }

    fn publish(brick: &Path, ts: i64, into: &Path) -> Result<()> {
        let name = format!("{}{}", CHANGELOG_PREFIX, ts);
        let src = Self::changelog_dir(brick).join(&name);
        let dst = into.join(&name);
        if dst.exists() {
            return Ok(());
        }
        if std::fs::hard_link(&src, &dst).is_err() {
            std::fs::copy(&src, &dst)?;
        }
        Ok(())
    }

    fn pending(dir: &Path) -> Result<Vec<PathBuf>> {
        let mut out: Vec<(i64, PathBuf)> = std::fs::read_dir(dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter_map(|p| changelog_ts(&p).map(|ts| (ts, p)))
            .collect();
        out.sort();
        Ok(out.into_iter().map(|(_, p)| p).collect())
    }

    fn consume(processing: &Path, processed: &Path, changelog: &Path) -> Result<()> {
        let name = changelog.file_name().ok_or_else(|| Error::Changelog {
            path: changelog.display().to_string(),
            reason: "not a file".into(),
        })?;
        let src = processing.join(name);
        if !src.exists() {
            return Err(Error::Changelog {
                path: changelog.display().to_string(),
                reason: "not pending".into(),
            });
        }
        std::fs::rename(&src, processed.join(name))?;
        Ok(())
    }
}

impl ChangelogQuery for FsChangelog {
    fn register(&mut self, brick: &Path, workdir: &Path) -> Result<()> {
        for sub in [".processing", ".processed", ".history/.processing", ".history/.processed"] {
            std::fs::create_dir_all(workdir.join(sub))?;
        }
        let live_after = Self::available(brick)?.last().copied().unwrap_or(0);
        tracing::info!(
            "registered brick {} (live changelogs after {})",
            brick.display(),
            live_after
        );
        self.reg = Some(Registration {
            brick: brick.to_path_buf(),
            workdir: workdir.to_path_buf(),
            live_after,
        });
        Ok(())
    }

    fn scan(&mut self) -> Result<usize> {
        let reg = self.registration()?;
        let processing = reg.workdir.join(".processing");
        let fresh: Vec<i64> = Self::available(&reg.brick)?
            .into_iter()
            .filter(|ts| *ts > reg.live_after)
            .collect();
        for ts in &fresh {
            Self::publish(&reg.brick, *ts, &processing)?;
        }
        if let (Some(last), Some(reg)) = (fresh.last().copied(), self.reg.as_mut()) {
            reg.live_after = last;
        }
        Ok(Self::pending(&processing)?.len())
    }

    fn getchanges(&mut self) -> Result<Vec<PathBuf>> {
        let reg = self.registration()?;
        Self::pending(&reg.workdir.join(".processing"))
    }

    fn done(&mut self, changelog: &Path) -> Result<()> {
        let reg = self.registration()?;
        Self::consume(
            &reg.workdir.join(".processing"),
            &reg.workdir.join(".processed"),
            changelog,
        )
    }

    fn history(&mut self, start: i64, end: i64, workers: usize) -> Result<HistoryRange> {
        let reg = self.registration()?;
        tracing::debug!("history {}..{} with {} parse workers", start, end, workers);

        let sessions = Self::sessions(&reg.brick)?;
        let available = Self::available(&reg.brick)?;

        // the session holding `start` ends where the next one begins
        let mut session_end = end;
        if !sessions.is_empty() {
            let covering = sessions.iter().rev().find(|s| **s <= start);
            if covering.is_none() {
                return Err(Error::HistoryUnavailable(format!(
                    "changelogs start at {}, requested {}",
                    sessions[0], start
                )));
            }
            if let Some(next) = sessions.iter().find(|s| **s > start) {
                session_end = session_end.min(*next - 1);
            }
        }

        let processing = reg.workdir.join(".history/.processing");
        let mut published = 0;
        let mut last_seen = start;
        for ts in available.into_iter().filter(|ts| *ts > start && *ts <= session_end) {
            Self::publish(&reg.brick, ts, &processing)?;
            published += 1;
            last_seen = ts;
        }

        let actual_end = if session_end < end { last_seen.max(start) } else { end };
        Ok(HistoryRange {
            actual_end,
            published,
        })
    }

    fn history_scan(&mut self) -> Result<usize> {
        let reg = self.registration()?;
        Ok(Self::pending(&reg.workdir.join(".history/.processing"))?.len())
    }

    fn history_getchanges(&mut self) -> Result<Vec<PathBuf>> {
        let reg = self.registration()?;
        Self::pending(&reg.workdir.join(".history/.processing"))
    }

    fn history_done(&mut self, changelog: &Path) -> Result<()> {
        let reg = self.registration()?;
        Self::consume(
            &reg.workdir.join(".history/.processing"),
            &reg.workdir.join(".history/.processed"),
            changelog,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write_changelog(brick: &Path, ts: i64) {
        let dir = FsChangelog::changelog_dir(brick);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(format!("CHANGELOG.{}", ts)), "").unwrap();
    }

    fn write_htime(brick: &Path, ts: i64) {
        let dir = FsChangelog::changelog_dir(brick).join("htime");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(format!("HTIME.{}", ts)), "").unwrap();
    }

    #[test]
    fn test_live_scan_and_done() {
        let brick = tempdir().unwrap();
        let work = tempdir().unwrap();
        write_changelog(brick.path(), 100);

        let mut q = FsChangelog::new();
        q.register(brick.path(), work.path()).unwrap();
        assert_eq!(q.scan().unwrap(), 0);

        write_changelog(brick.path(), 130);
        write_changelog(brick.path(), 115);
        assert_eq!(q.scan().unwrap(), 2);
        let changes = q.getchanges().unwrap();
        assert_eq!(changelog_ts(&changes[0]), Some(115));
        assert_eq!(changelog_ts(&changes[1]), Some(130));

        q.done(&changes[0]).unwrap();
        assert_eq!(q.scan().unwrap(), 1);
        assert!(q.done(&changes[0]).is_err());
    }

    #[test]
    fn test_history_full_range_skips_start() {
        let brick = tempdir().unwrap();
        let work = tempdir().unwrap();
        for ts in [100, 115, 130, 145] {
            write_changelog(brick.path(), ts);
        }
        let mut q = FsChangelog::new();
        q.register(brick.path(), work.path()).unwrap();

        let range = q.history(100, 140, 1).unwrap();
        assert_eq!(range.actual_end, 140);
        assert_eq!(range.published, 2);
        assert_eq!(q.history_scan().unwrap(), 2);
        for c in q.history_getchanges().unwrap() {
            q.history_done(&c).unwrap();
        }
        assert_eq!(q.history_scan().unwrap(), 0);
    }

    #[test]
    fn test_history_partial_when_session_breaks() {
        let brick = tempdir().unwrap();
        let work = tempdir().unwrap();
        write_htime(brick.path(), 50);
        write_htime(brick.path(), 200);
        for ts in [100, 115, 230] {
            write_changelog(brick.path(), ts);
        }
        let mut q = FsChangelog::new();
        q.register(brick.path(), work.path()).unwrap();

        let range = q.history(90, 300, 1).unwrap();
        assert_eq!(range.actual_end, 115);
        assert_eq!(range.published, 2);

        assert!(matches!(q.history(10, 300, 1), Err(Error::HistoryUnavailable(_))));
    }
}
