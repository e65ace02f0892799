//! Brick Backend Access
//!
//! Every object on a brick has a GFID entry under
//! `<brick>/.glusterfs/<g[0:2]>/<g[2:4]>/<gfid>`: a hard link for files
//! and a symlink for directories whose target ends in
//! `<parent-gfid>/<basename>`. Walking those symlinks up to the root GFID
//! yields a directory's path; files are matched by inode number, either
//! inside the parent directories named by their `trusted.pgfid.*`
//! attributes or by a full crawl.

use std::collections::HashSet;
use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// GFID of every brick's root directory
pub const ROOT_GFID: &str = "00000000-0000-0000-0000-000000000001";

/// Backend directory holding GFID entries
pub const GFID_DIR: &str = ".glusterfs";

/// Top-level brick directories that are never user data
pub const BRICK_IGNORE_DIRS: [&str; 2] = [".glusterfs", ".trashcan"];

/// Attribute prefix naming a file's parent directories
const PGFID_XATTR_PREFIX: &str = "trusted.pgfid.";

/// Attempts for transient errno classes
const OP_RETRIES: u32 = 10;

/// Pause between attempts
const RETRY_PAUSE: Duration = Duration::from_millis(250);

/// Symlink hops before a chain is declared looping
const MAX_DEPTH: usize = 4096;

/// Run `op`, retrying stale-handle and busy errors
pub fn retry_transient<T>(mut op: impl FnMut() -> Result<T>) -> Result<T> {
    let mut attempt = 1;
    loop {
        match op() {
            Err(e) if e.is_retryable() && attempt < OP_RETRIES => {
                tracing::debug!("retrying after transient error (attempt {}): {}", attempt, e);
                attempt += 1;
                std::thread::sleep(RETRY_PAUSE);
            }
            other => return other,
        }
    }
}

/// Reverse-parent lookup for a file's backend entry
pub trait ParentLookup: Send + Sync {
    /// Parent directory GFIDs recorded for the object at `backend_path`
    fn parent_gfids(&self, backend_path: &Path) -> Result<Vec<String>>;
}

/// Reads `trusted.pgfid.<gfid>` extended attributes
pub struct XattrParents;

impl ParentLookup for XattrParents {
    fn parent_gfids(&self, backend_path: &Path) -> Result<Vec<String>> {
        let names = match list_xattrs(backend_path) {
            Ok(names) => names,
            Err(e) if e.raw_os_error() == Some(libc::ENOTSUP) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        Ok(names
            .iter()
            .filter_map(|n| n.strip_prefix(PGFID_XATTR_PREFIX))
            .map(str::to_string)
            .collect())
    }
}

fn list_xattrs(path: &Path) -> std::io::Result<Vec<String>> {
    let c_path = CString::new(path.as_os_str().as_bytes())?;
    // SAFETY: c_path is NUL-terminated; a null buffer of size 0 asks for the length
    let size = unsafe { libc::llistxattr(c_path.as_ptr(), std::ptr::null_mut(), 0) };
    if size < 0 {
        return Err(std::io::Error::last_os_error());
    }
    let mut buf = vec![0u8; size as usize];
    // SAFETY: buf is valid for buf.len() bytes
    let n = unsafe {
        libc::llistxattr(c_path.as_ptr(), buf.as_mut_ptr() as *mut libc::c_char, buf.len())
    };
    if n < 0 {
        return Err(std::io::Error::last_os_error());
    }
    buf.truncate(n as usize);
    Ok(buf
        .split(|b| *b == 0)
        .filter(|s| !s.is_empty())
        .map(|s| String::from_utf8_lossy(s).into_owned())
        .collect())
}

/// What a GFID's backend entry turned out to be
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GfidEntry {
    /// Directory with its resolved path
    Directory(String),
    /// Regular file, symlink or device, identified by inode
    File { inode: u64 },
    /// No backend entry (already removed)
    Missing,
}

/// One brick's backend
pub struct Brick {
    /// Brick root
    root: PathBuf,
    /// Reverse-parent lookup
    parents: Box<dyn ParentLookup>,
}

impl Brick {
    /// Brick using extended attributes for parent lookup
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_parent_lookup(root, Box::new(XattrParents))
    }

    /// Brick with a custom parent lookup
    pub fn with_parent_lookup(root: impl Into<PathBuf>, parents: Box<dyn ParentLookup>) -> Self {
        Self {
            root: root.into(),
            parents,
        }
    }

    /// Brick root
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Backend GFID entry path
    pub fn backend_path(&self, gfid: &str) -> PathBuf {
        let (a, b) = (gfid.get(0..2).unwrap_or(""), gfid.get(2..4).unwrap_or(""));
        self.root.join(GFID_DIR).join(a).join(b).join(gfid)
    }

    /// Path of a directory GFID relative to the brick root, via the symlink chain
    pub fn dir_path(&self, gfid: &str) -> Result<Option<String>> {
        let mut parts: Vec<String> = Vec::new();
        let mut current = gfid.to_string();

        for _ in 0..MAX_DEPTH {
            if current == ROOT_GFID {
                parts.reverse();
                return Ok(Some(parts.join("/")));
            }
            let link = self.backend_path(&current);
            let target = match retry_transient(|| std::fs::read_link(&link).map_err(Error::from)) {
                Ok(t) => t,
                Err(Error::Io(e))
                    if e.kind() == std::io::ErrorKind::NotFound
                        || e.raw_os_error() == Some(libc::EINVAL) =>
                {
                    return Ok(None)
                }
                Err(e) => return Err(e),
            };

            let mut components = target.iter().rev();
            let basename = components.next().map(|c| c.to_string_lossy().into_owned());
            let parent = components.next().map(|c| c.to_string_lossy().into_owned());
            match (parent, basename) {
                (Some(parent), Some(basename)) => {
                    parts.push(basename);
                    current = parent;
                }
                _ => {
                    return Err(Error::Changelog {
                        path: link.display().to_string(),
                        reason: format!("unexpected symlink target {}", target.display()),
                    })
                }
            }
        }

        Err(Error::Unresolved(format!("{} (symlink loop)", gfid)))
    }

    /// Classify a GFID's backend entry
    pub fn lookup(&self, gfid: &str) -> Result<GfidEntry> {
        if gfid == ROOT_GFID {
            return Ok(GfidEntry::Directory(String::new()));
        }
        let backend = self.backend_path(gfid);
        let meta = match retry_transient(|| std::fs::symlink_metadata(&backend).map_err(Error::from)) {
            Ok(m) => m,
            Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(GfidEntry::Missing)
            }
            Err(e) => return Err(e),
        };

        if meta.file_type().is_symlink() {
            // directory entries are symlinks; a file symlink's entry is a hard link
            if let Some(path) = self.dir_path(gfid)? {
                return Ok(GfidEntry::Directory(path));
            }
        }
        Ok(GfidEntry::File { inode: meta.ino() })
    }

    /// Parent GFIDs recorded for a file
    pub fn parent_gfids(&self, gfid: &str) -> Result<Vec<String>> {
        self.parents.parent_gfids(&self.backend_path(gfid))
    }

    /// Entries of one directory whose inode is in `inodes`
    pub fn find_in_dir(&self, dir: &str, inodes: &HashSet<u64>) -> Result<Vec<(u64, String)>> {
        let mut found = Vec::new();
        let abs = if dir.is_empty() { self.root.clone() } else { self.root.join(dir) };
        let entries = match std::fs::read_dir(&abs) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(found),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if dir.is_empty() && BRICK_IGNORE_DIRS.contains(&name.as_str()) {
                continue;
            }
            let meta = match entry.metadata() {
                Ok(m) => m,
                Err(_) => continue,
            };
            if inodes.contains(&meta.ino()) {
                found.push((meta.ino(), join_rel(dir, &name)));
            }
        }
        found.sort();
        Ok(found)
    }

    /// Full crawl matching `inodes`
    pub fn crawl_for_inodes(&self, inodes: &HashSet<u64>) -> Result<Vec<(u64, String)>> {
        let mut found = Vec::new();
        let mut seen = HashSet::new();
        self.walk(|path, meta| {
            if inodes.contains(&meta.ino()) && seen.insert(meta.ino()) {
                found.push((meta.ino(), path.to_string()));
            }
            Ok(())
        })?;
        Ok(found)
    }

    /// Visit every user entry, parents before children, names sorted
    pub fn walk(&self, mut visit: impl FnMut(&str, &std::fs::Metadata) -> Result<()>) -> Result<()> {
        let mut pending = vec![String::new()];
        while let Some(dir) = pending.pop() {
            let abs = if dir.is_empty() { self.root.clone() } else { self.root.join(&dir) };
            let mut entries: Vec<(String, std::fs::Metadata)> = Vec::new();
            let reader = match std::fs::read_dir(&abs) {
                Ok(r) => r,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            for entry in reader {
                let entry = entry?;
                let name = entry.file_name().to_string_lossy().into_owned();
                if dir.is_empty() && BRICK_IGNORE_DIRS.contains(&name.as_str()) {
                    continue;
                }
                if let Ok(meta) = entry.metadata() {
                    entries.push((name, meta));
                }
            }
            entries.sort_by(|a, b| a.0.cmp(&b.0));

            let mut subdirs = Vec::new();
            for (name, meta) in entries {
                let rel = join_rel(&dir, &name);
                visit(&rel, &meta)?;
                if meta.is_dir() {
                    subdirs.push(rel);
                }
            }
            // stack: push in reverse so the first subdir is walked first
            pending.extend(subdirs.into_iter().rev());
        }
        Ok(())
    }
}

fn join_rel(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", dir, name)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::HashMap;

    /// Parent lookup answering from a fixed table keyed by GFID
    pub struct MapParents(pub HashMap<String, Vec<String>>);

    impl ParentLookup for MapParents {
        fn parent_gfids(&self, backend_path: &Path) -> Result<Vec<String>> {
            let gfid = backend_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            Ok(self.0.get(&gfid).cloned().unwrap_or_default())
        }
    }

    /// Create a directory on the brick plus its GFID symlink
    pub fn make_dir(root: &Path, gfid: &str, pgfid: &str, rel: &str) {
        std::fs::create_dir_all(root.join(rel)).unwrap();
        let name = Path::new(rel).file_name().unwrap().to_string_lossy().into_owned();
        let link = Brick::new(root).backend_path(gfid);
        std::fs::create_dir_all(link.parent().unwrap()).unwrap();
        let target = format!("../../{}/{}/{}/{}", &pgfid[0..2], &pgfid[2..4], pgfid, name);
        std::os::unix::fs::symlink(target, link).unwrap();
    }

    /// Create a file on the brick plus its GFID hard link
    pub fn make_file(root: &Path, gfid: &str, rel: &str) -> u64 {
        let path = root.join(rel);
        std::fs::write(&path, b"data").unwrap();
        let link = Brick::new(root).backend_path(gfid);
        std::fs::create_dir_all(link.parent().unwrap()).unwrap();
        std::fs::hard_link(&path, link).unwrap();
        std::fs::metadata(&path).unwrap().ino()
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use tempfile::tempdir;

    const D1: &str = "d1d1d1d1-0000-4000-8000-000000000001";
    const D2: &str = "d2d2d2d2-0000-4000-8000-000000000002";
    const F1: &str = "f1f1f1f1-0000-4000-8000-000000000003";

    #[test]
    fn test_dir_path_walks_symlinks() {
        let dir = tempdir().unwrap();
        make_dir(dir.path(), D1, ROOT_GFID, "top");
        make_dir(dir.path(), D2, D1, "top/inner");

        let brick = Brick::new(dir.path());
        assert_eq!(brick.dir_path(ROOT_GFID).unwrap(), Some(String::new()));
        assert_eq!(brick.dir_path(D1).unwrap(), Some("top".to_string()));
        assert_eq!(brick.dir_path(D2).unwrap(), Some("top/inner".to_string()));
        assert_eq!(brick.dir_path("eeeeeeee-0000-4000-8000-000000000000").unwrap(), None);
    }

    #[test]
    fn test_lookup_and_inode_search() {
        let dir = tempdir().unwrap();
        make_dir(dir.path(), D1, ROOT_GFID, "top");
        let inode = make_file(dir.path(), F1, "top/file");

        let brick = Brick::new(dir.path());
        assert_eq!(brick.lookup(D1).unwrap(), GfidEntry::Directory("top".into()));
        assert_eq!(brick.lookup(F1).unwrap(), GfidEntry::File { inode });
        assert_eq!(brick.lookup("abababab-0000-4000-8000-000000000000").unwrap(), GfidEntry::Missing);

        let wanted: HashSet<u64> = [inode].into_iter().collect();
        assert_eq!(brick.find_in_dir("top", &wanted).unwrap(), vec![(inode, "top/file".to_string())]);
        assert!(brick.find_in_dir("", &wanted).unwrap().is_empty());
        // the crawl never descends into .glusterfs, where the hard link also lives
        assert_eq!(brick.crawl_for_inodes(&wanted).unwrap(), vec![(inode, "top/file".to_string())]);
    }

    #[test]
    fn test_walk_parents_first() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("b/c")).unwrap();
        std::fs::create_dir_all(dir.path().join("a")).unwrap();
        std::fs::write(dir.path().join("b/c/f"), b"x").unwrap();
        std::fs::create_dir_all(dir.path().join(".glusterfs/00")).unwrap();

        let mut seen = Vec::new();
        Brick::new(dir.path())
            .walk(|p, _| {
                seen.push(p.to_string());
                Ok(())
            })
            .unwrap();
        assert_eq!(seen, vec!["a", "b", "b/c", "b/c/f"]);
    }

    #[test]
    fn test_retry_transient_gives_up() {
        let mut calls = 0;
        let result: Result<()> = retry_transient(|| {
            calls += 1;
            Err(Error::Sys(nix::errno::Errno::ENOENT))
        });
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }
}
