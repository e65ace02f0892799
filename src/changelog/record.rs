//! Change Records
//!
//! Typed records produced by translating changelogs, plus the raw
//! per-line records read from a changelog file.

use serde::{Deserialize, Serialize};

/// Classified change kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordType {
    New,
    Modify,
    Rename,
    Delete,
}

impl RecordType {
    /// Canonical upper-case name, as stored in the change databases
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordType::New => "NEW",
            RecordType::Modify => "MODIFY",
            RecordType::Rename => "RENAME",
            RecordType::Delete => "DELETE",
        }
    }

    /// Parse a stored name
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "NEW" => Some(RecordType::New),
            "MODIFY" => Some(RecordType::Modify),
            "RENAME" => Some(RecordType::Rename),
            "DELETE" => Some(RecordType::Delete),
            _ => None,
        }
    }
}

impl std::fmt::Display for RecordType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl rusqlite::types::ToSql for RecordType {
    fn to_sql(&self) -> rusqlite::Result<rusqlite::types::ToSqlOutput<'_>> {
        Ok(self.as_str().into())
    }
}

impl rusqlite::types::FromSql for RecordType {
    fn column_result(value: rusqlite::types::ValueRef<'_>) -> rusqlite::types::FromSqlResult<Self> {
        let s = value.as_str()?;
        RecordType::parse(s).ok_or_else(|| rusqlite::types::FromSqlError::Other(
            format!("unknown record type {}", s).into(),
        ))
    }
}

/// One filesystem mutation discovered from a changelog or a crawl
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    /// Insertion sequence within its database
    pub id: i64,
    /// Source changelog timestamp
    pub ts: i64,
    pub kind: RecordType,
    pub gfid: String,
    pub pgfid1: String,
    pub bn1: String,
    pub pgfid2: String,
    pub bn2: String,
    /// Resolved path, empty until resolution succeeds
    pub path1: String,
    /// Resolved rename target, RENAME only
    pub path2: String,
}

impl ChangeRecord {
    /// True once every path this record needs is known
    pub fn is_resolved(&self) -> bool {
        !self.path1.is_empty() && (self.kind != RecordType::Rename || !self.path2.is_empty())
    }
}

/// Entry operation named in an `E` line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryFop {
    Create,
    Mknod,
    Mkdir,
    Link,
    Symlink,
    Rename,
    Unlink,
    Rmdir,
}

impl EntryFop {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "CREATE" => Some(EntryFop::Create),
            "MKNOD" => Some(EntryFop::Mknod),
            "MKDIR" => Some(EntryFop::Mkdir),
            "LINK" => Some(EntryFop::Link),
            "SYMLINK" => Some(EntryFop::Symlink),
            "RENAME" => Some(EntryFop::Rename),
            "UNLINK" => Some(EntryFop::Unlink),
            "RMDIR" => Some(EntryFop::Rmdir),
            _ => None,
        }
    }
}

/// `<parent-gfid>/<basename>` pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryName {
    pub pgfid: String,
    pub basename: String,
}

/// Payload of one raw changelog line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawOp {
    /// CREATE, MKNOD or MKDIR
    Create {
        fop: EntryFop,
        mode: u32,
        uid: u32,
        gid: u32,
        entry: EntryName,
    },
    /// LINK or SYMLINK
    Link { fop: EntryFop, entry: EntryName },
    Rename { from: EntryName, to: EntryName },
    /// UNLINK or RMDIR, optionally carrying the already-resolved path
    Remove {
        fop: EntryFop,
        entry: EntryName,
        deleted_path: Option<String>,
    },
    /// `D` line
    Data,
    /// `M` line with its fop name
    Meta { fop: String },
}

/// One raw changelog line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    pub gfid: String,
    pub op: RawOp,
}
