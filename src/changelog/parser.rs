//! Changelog Parser
//!
//! Reads one changelog file into raw records. The file starts with an
//! optional header line declaring the format version; records follow,
//! separated by NUL bytes or newlines, fields separated by whitespace.
//! Basenames and paths use `%20`, `%0A` and `%25` for space, newline
//! and percent.

use std::path::Path;

use super::record::{EntryFop, EntryName, RawOp, RawRecord};
use crate::error::{Error, Result};

/// Prefix of the header line
const HEADER_PREFIX: &str = "GlusterFS Changelog";

/// Prefix of changelog file names
pub const CHANGELOG_PREFIX: &str = "CHANGELOG.";

/// Known changelog format versions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatVersion {
    /// UNLINK/RMDIR carry `<pgfid>/<bn>` only
    V1_1,
    /// UNLINK/RMDIR may carry a trailing deleted path
    V1_2,
}

/// Result of parsing one changelog file
#[derive(Debug, Clone)]
pub struct ParsedChangelog {
    /// Timestamp from the file name
    pub ts: i64,
    pub version: FormatVersion,
    pub records: Vec<RawRecord>,
    /// Records that could not be parsed and were skipped
    pub skipped: usize,
}

/// Extract the timestamp from a `CHANGELOG.<ts>` path
pub fn changelog_ts(path: &Path) -> Option<i64> {
    path.file_name()?
        .to_str()?
        .strip_prefix(CHANGELOG_PREFIX)?
        .parse()
        .ok()
}

/// Parse a changelog file from disk
pub fn parse_file(path: &Path) -> Result<ParsedChangelog> {
    let ts = changelog_ts(path).ok_or_else(|| Error::Changelog {
        path: path.display().to_string(),
        reason: "file name is not CHANGELOG.<ts>".into(),
    })?;
    let bytes = std::fs::read(path)?;
    let content = String::from_utf8_lossy(&bytes);
    let parsed = parse_str(ts, &content);
    if parsed.skipped > 0 {
        tracing::warn!("{}: skipped {} malformed records", path.display(), parsed.skipped);
    }
    Ok(parsed)
}

/// Parse changelog content
pub fn parse_str(ts: i64, content: &str) -> ParsedChangelog {
    let mut version = FormatVersion::V1_2;
    let mut body = content;

    if content.starts_with(HEADER_PREFIX) {
        let (header, rest) = content.split_once('\n').unwrap_or((content, ""));
        version = parse_header(header);
        body = rest;
    }

    let mut records = Vec::new();
    let mut skipped = 0;
    for line in body.split(|c| c == '\0' || c == '\n') {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match parse_record(line, version) {
            Ok(record) => records.push(record),
            Err(e) => {
                tracing::debug!("skipping record {:?}: {}", line, e);
                skipped += 1;
            }
        }
    }

    ParsedChangelog {
        ts,
        version,
        records,
        skipped,
    }
}

fn parse_header(header: &str) -> FormatVersion {
    let version = header
        .split('|')
        .filter_map(|part| part.trim().strip_prefix("version:"))
        .map(|v| v.trim().to_string())
        .next();
    match version.as_deref() {
        Some("v1.1") => FormatVersion::V1_1,
        _ => FormatVersion::V1_2,
    }
}

/// Parse one record line
pub fn parse_record(line: &str, version: FormatVersion) -> Result<RawRecord> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    let bad = |reason: &str| Error::BadRecord(format!("{}: {}", reason, line));

    if fields.len() < 2 {
        return Err(bad("too few fields"));
    }
    let gfid = fields[1].to_string();

    let op = match fields[0] {
        "D" => RawOp::Data,
        "M" => RawOp::Meta {
            fop: fields.get(2).unwrap_or(&"SETATTR").to_string(),
        },
        "E" => {
            let fop = fields
                .get(2)
                .and_then(|f| EntryFop::parse(f))
                .ok_or_else(|| bad("unknown entry fop"))?;
            parse_entry(fop, &fields, version).ok_or_else(|| bad("wrong field count"))?
        }
        _ => return Err(bad("unknown type tag")),
    };

    Ok(RawRecord { gfid, op })
}

fn parse_entry(fop: EntryFop, fields: &[&str], version: FormatVersion) -> Option<RawOp> {
    match fop {
        EntryFop::Create | EntryFop::Mknod | EntryFop::Mkdir => {
            if fields.len() != 7 {
                return None;
            }
            Some(RawOp::Create {
                fop,
                mode: fields[3].parse().ok()?,
                uid: fields[4].parse().ok()?,
                gid: fields[5].parse().ok()?,
                entry: entry_name(fields[6])?,
            })
        }
        EntryFop::Link | EntryFop::Symlink => {
            if fields.len() != 4 {
                return None;
            }
            Some(RawOp::Link {
                fop,
                entry: entry_name(fields[3])?,
            })
        }
        EntryFop::Rename => {
            if fields.len() != 5 {
                return None;
            }
            Some(RawOp::Rename {
                from: entry_name(fields[3])?,
                to: entry_name(fields[4])?,
            })
        }
        EntryFop::Unlink | EntryFop::Rmdir => {
            let deleted_path = match (fields.len(), version) {
                (4, _) => None,
                (5, FormatVersion::V1_2) => Some(unescape(fields[4])),
                // v1.1 has no deleted path field
                (5, FormatVersion::V1_1) => None,
                _ => return None,
            };
            Some(RawOp::Remove {
                fop,
                entry: entry_name(fields[3])?,
                deleted_path: deleted_path.filter(|p| !p.is_empty()),
            })
        }
    }
}

fn entry_name(field: &str) -> Option<EntryName> {
    let (pgfid, basename) = field.split_once('/')?;
    if pgfid.is_empty() || basename.is_empty() {
        return None;
    }
    Some(EntryName {
        pgfid: pgfid.to_string(),
        basename: unescape(basename),
    })
}

/// Decode `%20`, `%0A` and `%25`
pub fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(pos) = rest.find('%') {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];
        let decoded = match tail.get(..3) {
            Some("%20") => Some(' '),
            Some("%0A") | Some("%0a") => Some('\n'),
            Some("%25") => Some('%'),
            _ => None,
        };
        match decoded {
            Some(c) => {
                out.push(c);
                rest = &tail[3..];
            }
            None => {
                out.push('%');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

/// Encode space, newline and percent
pub fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '%' => out.push_str("%25"),
            ' ' => out.push_str("%20"),
            '\n' => out.push_str("%0A"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const G1: &str = "2f6f3b0a-1111-4c3e-9f55-000000000001";
    const P1: &str = "2f6f3b0a-2222-4c3e-9f55-000000000002";

    #[test]
    fn test_parse_entry_lines() {
        let content = format!(
            "GlusterFS Changelog | version: v1.2 | encoding : 2\n\
             E {g} CREATE 33188 0 0 {p}/file%201\0\
             D {g}\0\
             M {g} SETATTR\0\
             E {g} RENAME {p}/file%201 {p}/file2\0\
             E {g} UNLINK {p}/file2 dir/file2\0",
            g = G1,
            p = P1
        );
        let parsed = parse_str(1700000000, &content);
        assert_eq!(parsed.version, FormatVersion::V1_2);
        assert_eq!(parsed.skipped, 0);
        assert_eq!(parsed.records.len(), 5);

        match &parsed.records[0].op {
            RawOp::Create { mode, entry, .. } => {
                assert_eq!(*mode, 33188);
                assert_eq!(entry.pgfid, P1);
                assert_eq!(entry.basename, "file 1");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(parsed.records[1].op, RawOp::Data);
        match &parsed.records[4].op {
            RawOp::Remove { deleted_path, .. } => {
                assert_eq!(deleted_path.as_deref(), Some("dir/file2"))
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_old_format_unlink_and_newlines() {
        let content = format!(
            "GlusterFS Changelog | version: v1.1 | encoding : 2\nE {g} UNLINK {p}/gone\nE {g} RMDIR {p}/olddir\n",
            g = G1,
            p = P1
        );
        let parsed = parse_str(1, &content);
        assert_eq!(parsed.version, FormatVersion::V1_1);
        assert_eq!(parsed.records.len(), 2);
        assert!(matches!(
            &parsed.records[0].op,
            RawOp::Remove { fop: EntryFop::Unlink, deleted_path: None, .. }
        ));
    }

    #[test]
    fn test_malformed_records_are_skipped() {
        let content = format!("X {g}\nE {g} CREATE 1 2\nE {g} FROB {p}/x\nD {g}\n", g = G1, p = P1);
        let parsed = parse_str(1, &content);
        assert_eq!(parsed.records.len(), 1);
        assert_eq!(parsed.skipped, 3);
    }

    #[test]
    fn test_escape_unescape() {
        assert_eq!(unescape("a%20b%0Ac%25d%zz"), "a b\nc%d%zz");
        assert_eq!(escape("a b\nc%d"), "a%20b%0Ac%25d");
        assert_eq!(unescape(&escape("100% sure\n")), "100% sure\n");
    }

    #[test]
    fn test_changelog_ts() {
        assert_eq!(changelog_ts(Path::new("/x/CHANGELOG.1700000015")), Some(1700000015));
        assert_eq!(changelog_ts(Path::new("/x/HTIME.1700000015")), None);
    }
}
