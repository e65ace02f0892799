//! Changelog Processing
//!
//! Parsing of storage-engine changelogs, classification into change
//! records, GFID to path resolution and the changelog query interface.

pub mod brick;
pub mod parser;
pub mod query;
pub mod record;
pub mod translator;

pub use brick::{Brick, ParentLookup, XattrParents, ROOT_GFID};
pub use parser::{changelog_ts, escape, parse_file, unescape, FormatVersion, ParsedChangelog};
pub use query::{ChangelogQuery, FsChangelog, HistoryRange};
pub use record::{ChangeRecord, RecordType};
pub use translator::{ResolveStats, Translator};

use sha1::{Digest, Sha1};
use std::path::{Path, PathBuf};

/// Per-brick working directory: `<base>/<sha1 of the brick path>`
pub fn brick_workdir(base: &Path, brick: &Path) -> PathBuf {
    let mut hasher = Sha1::new();
    hasher.update(brick.as_os_str().to_string_lossy().as_bytes());
    base.join(format!("{:x}", hasher.finalize()))
}
