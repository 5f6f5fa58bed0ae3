//! JSONL reading and writing: line-addressed parsing, head/tail sampling,
//! atomic replacement, and timestamped backups.
//!
//! # Architecture overview
//!
//! Transcripts are append-only JSON-Lines files. Everything above this module
//! addresses them by 1-based physical line number, so the reader's job is to
//! hand out `{number, raw, parsed}` triples without losing the original bytes
//! of any line — including lines that fail JSON decoding, which are preserved
//! verbatim and re-emitted untouched on rewrite.
//!
//! Writing never leaves partial content observable: new bytes go to a sibling
//! temp file on the same filesystem, are fsynced, and are renamed over the
//! original. Rewrites of existing transcripts are preceded by a timestamped
//! backup copy next to the original.
//!
//! # TRADE-OFFS
//!
//! The reader materializes one `String` per line rather than borrowing from a
//! shared buffer. Transcripts top out in the tens of megabytes, and owning the
//! lines keeps every consumer free to mutate or drop them independently.

use std::fs;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::error::EvsError;

/// One physical line of a transcript, 1-based.
#[derive(Debug, Clone)]
pub struct Line {
    pub number: usize,
    pub raw: String,
    pub parsed: LineValue,
}

/// Parse outcome for a single line.
#[derive(Debug, Clone)]
pub enum LineValue {
    /// A JSON object the parser accepted.
    Entry(Value),
    /// A line that failed JSON decoding; `raw` still holds the exact bytes.
    Invalid { error: String },
    /// A blank line. Preserved so rewrites are byte-faithful.
    Blank,
}

impl Line {
    pub fn entry(&self) -> Option<&Value> {
        match &self.parsed {
            LineValue::Entry(v) => Some(v),
            _ => None,
        }
    }

    pub fn entry_mut(&mut self) -> Option<&mut Value> {
        match &mut self.parsed {
            LineValue::Entry(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_invalid(&self) -> bool {
        matches!(self.parsed, LineValue::Invalid { .. })
    }
}

/// Stream every line of `path` in order. Finite and not restartable: callers
/// that need a second pass must call again.
pub fn stream_lines(path: &Path) -> Result<impl Iterator<Item = Line>, EvsError> {
    let file = fs::File::open(path).map_err(|e| EvsError::io_at(path, e))?;
    let reader = std::io::BufReader::new(file);
    let mut number = 0usize;
    Ok(reader.lines().map_while(Result::ok).map(move |raw| {
        number += 1;
        parse_line(number, raw)
    }))
}

/// Read the whole file into memory as addressed lines.
pub fn read_all(path: &Path) -> Result<Vec<Line>, EvsError> {
    Ok(stream_lines(path)?.collect())
}

fn parse_line(number: usize, raw: String) -> Line {
    let trimmed = raw.trim();
    let parsed = if trimmed.is_empty() {
        LineValue::Blank
    } else {
        match serde_json::from_str::<Value>(trimmed) {
            Ok(v) => LineValue::Entry(v),
            Err(e) => LineValue::Invalid { error: e.to_string() },
        }
    };
    Line { number, raw, parsed }
}

/// First `max_objects` valid objects plus the count of malformed lines seen
/// while collecting them. Used by format detection, which never needs more
/// than a small head sample.
pub fn read_head(path: &Path, max_objects: usize) -> Result<(Vec<Value>, usize), EvsError> {
    let mut objects = Vec::new();
    let mut malformed = 0usize;
    for line in stream_lines(path)? {
        match line.parsed {
            LineValue::Entry(v) => {
                objects.push(v);
                if objects.len() >= max_objects {
                    break;
                }
            }
            LineValue::Invalid { .. } => malformed += 1,
            LineValue::Blank => {}
        }
    }
    Ok((objects, malformed))
}

/// Up to `max_lines` most recent lines with their original line numbers.
pub fn read_tail(path: &Path, max_lines: usize) -> Result<Vec<Line>, EvsError> {
    let all = read_all(path)?;
    let start = all.len().saturating_sub(max_lines);
    Ok(all[start..].to_vec())
}

/// Re-assemble lines into file bytes. Unchanged lines round-trip exactly;
/// the final line always gains a trailing newline, matching what the agents
/// themselves write.
pub fn assemble(lines: &[Line]) -> String {
    let mut out = String::new();
    for line in lines {
        out.push_str(&line.raw);
        out.push('\n');
    }
    out
}

/// Write `bytes` to `path` via a sibling temp file, fsync, rename.
///
/// The rename is the commit point. Fails with the offending path when the
/// parent directory cannot be created or the rename is cross-device.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), EvsError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| EvsError::io_at(parent, e))?;
    }
    let tmp = sibling_tmp_path(path);
    {
        let mut file = fs::File::create(&tmp).map_err(|e| EvsError::io_at(&tmp, e))?;
        file.write_all(bytes).map_err(|e| EvsError::io_at(&tmp, e))?;
        file.sync_all().map_err(|e| EvsError::io_at(&tmp, e))?;
    }
    fs::rename(&tmp, path).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        EvsError::io_at(path, e)
    })
}

/// Serialize `value` as one JSON object and atomically replace `path` with it.
pub fn write_json_atomic(path: &Path, value: &Value) -> Result<(), EvsError> {
    let mut bytes = serde_json::to_vec_pretty(value)?;
    bytes.push(b'\n');
    write_atomic(path, &bytes)
}

/// Append one JSON object as a line. Creates the file and parents as needed.
pub fn append_jsonl(path: &Path, value: &Value) -> Result<(), EvsError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| EvsError::io_at(parent, e))?;
    }
    let mut line = serde_json::to_string(value)?;
    line.push('\n');
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| EvsError::io_at(path, e))?;
    file.write_all(line.as_bytes())
        .map_err(|e| EvsError::io_at(path, e))?;
    Ok(())
}

/// Copy `path` to `<path>.backup-<ISO8601>` and return the backup path.
///
/// WHY: the backup lands next to the original, not in a central directory,
/// so a user staring at a rewritten transcript finds the previous version
/// without knowing anything about eversession's own file layout.
///
/// EDGE: colons are not valid in filenames on every filesystem, so the
/// timestamp uses `-` separators throughout; the instant is otherwise the
/// full ISO form, millisecond precision, so repeated rewrites in one
/// second still get distinct names.
pub fn create_backup(path: &Path) -> Result<PathBuf, EvsError> {
    let stamp = chrono::Utc::now().format("%Y-%m-%dT%H-%M-%S%.3fZ");
    let backup = PathBuf::from(format!("{}.backup-{stamp}", path.display()));
    fs::copy(path, &backup).map_err(|e| EvsError::io_at(path, e))?;
    Ok(backup)
}

/// WHY: the temp file carries the pid and sits next to the destination —
/// same filesystem (so the rename cannot go cross-device) and no collision
/// between concurrent writers racing toward the same path.
fn sibling_tmp_path(path: &Path) -> PathBuf {
    PathBuf::from(format!("{}.tmp-{}", path.display(), std::process::id()))
}

/// Source fingerprint of a transcript: `{mtimeMs, size}` at a point in time.
/// A mismatch at apply time marks a pending plan stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, Default)]
pub struct SourceFingerprint {
    #[serde(rename = "mtimeMs", skip_serializing_if = "Option::is_none")]
    pub mtime_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

impl SourceFingerprint {
    pub fn capture(path: &Path) -> Result<SourceFingerprint, EvsError> {
        let meta = fs::metadata(path).map_err(|e| EvsError::io_at(path, e))?;
        let mtime_ms = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as u64);
        Ok(SourceFingerprint {
            mtime_ms,
            size: Some(meta.len()),
        })
    }

    pub fn matches(&self, current: &SourceFingerprint) -> bool {
        self.mtime_ms == current.mtime_ms && self.size == current.size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_file(content: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("t.jsonl");
        fs::write(&path, content).unwrap();
        (dir, path)
    }

    #[test]
    fn test_read_all_preserves_raw_and_numbers() {
        let (_dir, path) = temp_file("{\"a\":1}\nnot json\n\n{\"b\":2}\n");
        let lines = read_all(&path).unwrap();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0].number, 1);
        assert!(matches!(lines[0].parsed, LineValue::Entry(_)));
        assert!(lines[1].is_invalid());
        assert_eq!(lines[1].raw, "not json");
        assert!(matches!(lines[2].parsed, LineValue::Blank));
        assert_eq!(lines[3].number, 4);
    }

    #[test]
    fn test_read_head_counts_malformed() {
        let (_dir, path) = temp_file("oops\n{\"a\":1}\n{\"b\":2}\n");
        let (objects, malformed) = read_head(&path, 10).unwrap();
        assert_eq!(objects.len(), 2);
        assert_eq!(malformed, 1);
    }

    #[test]
    fn test_read_head_stops_at_limit() {
        let (_dir, path) = temp_file("{\"a\":1}\n{\"b\":2}\n{\"c\":3}\n");
        let (objects, _) = read_head(&path, 2).unwrap();
        assert_eq!(objects.len(), 2);
    }

    #[test]
    fn test_read_tail_keeps_original_numbers() {
        let (_dir, path) = temp_file("{\"a\":1}\n{\"b\":2}\n{\"c\":3}\n");
        let tail = read_tail(&path, 2).unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].number, 2);
        assert_eq!(tail[1].number, 3);
    }

    #[test]
    fn test_assemble_round_trips() {
        let content = "{\"a\":1}\nnot json\n{\"b\":2}\n";
        let (_dir, path) = temp_file(content);
        let lines = read_all(&path).unwrap();
        assert_eq!(assemble(&lines), content);
    }

    #[test]
    fn test_write_atomic_replaces_content() {
        let (_dir, path) = temp_file("old");
        write_atomic(&path, b"new content\n").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "new content\n");
    }

    #[test]
    fn test_write_atomic_leaves_no_tmp_file() {
        let (dir, path) = temp_file("old");
        write_atomic(&path, b"new\n").unwrap();
        let names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        assert!(names.iter().all(|n| !n.contains(".tmp-")), "{names:?}");
    }

    #[test]
    fn test_create_backup_copies_next_to_original() {
        let (dir, path) = temp_file("content\n");
        let backup = create_backup(&path).unwrap();
        assert!(backup.to_string_lossy().contains(".backup-"));
        assert_eq!(backup.parent(), Some(dir.path()));
        assert_eq!(fs::read_to_string(&backup).unwrap(), "content\n");
    }

    #[test]
    fn test_fingerprint_matches_until_change() {
        let (_dir, path) = temp_file("one\n");
        let before = SourceFingerprint::capture(&path).unwrap();
        assert!(before.matches(&SourceFingerprint::capture(&path).unwrap()));
        fs::write(&path, "two two\n").unwrap();
        let after = SourceFingerprint::capture(&path).unwrap();
        assert!(!before.matches(&after));
    }

    #[test]
    fn test_append_jsonl_accumulates_lines() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("log.jsonl");
        append_jsonl(&path, &serde_json::json!({"n": 1})).unwrap();
        append_jsonl(&path, &serde_json::json!({"n": 2})).unwrap();
        let lines = read_all(&path).unwrap();
        assert_eq!(lines.len(), 2);
    }
}
