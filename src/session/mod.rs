//! The in-memory session model.
//!
//! # Architecture overview
//!
//! A transcript on disk becomes a `Transcript` — an ordered arena of physical
//! lines addressed by 1-based number, each holding its raw bytes and (when
//! decoding succeeded) a `serde_json::Value`. Agent-specific behaviour is
//! layered on top as a tagged variant:
//!
//! ```text
//! File (JSONL) → Transcript (lines + raw JSON) → Session::Claude | Session::Codex
//! ```
//!
//! # Design philosophy
//!
//! The on-disk data is open-typed: agents add arbitrary keys to entries, and
//! every key must survive a rewrite. So entries stay `serde_json::Value` and
//! the per-agent modules (`claude`, `codex`) expose typed *views* — small
//! accessor functions — over only the fields the core actually reads.
//! Mutations edit the raw `Value` in place and re-serialize the single line.
//!
//! Parent links are held together by string uuids. Entries live in the line
//! arena; `claude::uuid_index` resolves `uuid → line number` lazily per
//! operation. There are no back-pointers.

pub mod claude;
pub mod codex;

use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::detect::{self, Format};
use crate::error::EvsError;
use crate::jsonl::{self, Line};

/// Which assistant produced a transcript.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Agent {
    Claude,
    Codex,
}

impl std::fmt::Display for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Agent::Claude => write!(f, "claude"),
            Agent::Codex => write!(f, "codex"),
        }
    }
}

impl std::str::FromStr for Agent {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "claude" => Ok(Agent::Claude),
            "codex" => Ok(Agent::Codex),
            _ => Err(format!("unknown agent: {s} (valid: claude, codex)")),
        }
    }
}

/// An ordered, line-addressed view of one transcript file.
///
/// Line numbers are stable for the duration of an operation: structural
/// operations address entries by number, build a *new* line list, and
/// re-parse it, at which point numbering restarts from 1.
#[derive(Debug, Clone)]
pub struct Transcript {
    pub path: Option<PathBuf>,
    pub lines: Vec<Line>,
}

impl Transcript {
    pub fn read(path: &Path) -> Result<Transcript, EvsError> {
        Ok(Transcript {
            path: Some(path.to_path_buf()),
            lines: jsonl::read_all(path)?,
        })
    }

    /// Build from raw text, renumbering from 1. Used after every rewrite to
    /// re-validate proposed content before it is committed.
    pub fn from_text(text: &str) -> Transcript {
        let lines = text
            .lines()
            .enumerate()
            .map(|(i, raw)| {
                let raw = raw.to_string();
                let trimmed = raw.trim();
                let parsed = if trimmed.is_empty() {
                    jsonl::LineValue::Blank
                } else {
                    match serde_json::from_str::<Value>(trimmed) {
                        Ok(v) => jsonl::LineValue::Entry(v),
                        Err(e) => jsonl::LineValue::Invalid { error: e.to_string() },
                    }
                };
                Line { number: i + 1, raw, parsed }
            })
            .collect();
        Transcript { path: None, lines }
    }

    /// Entry lookup by physical line number.
    ///
    /// WHY: lines are stored densely, so `number` is an index plus one —
    /// O(1) lookup without a side map. The bounds check keeps callers
    /// honest about numbers taken from an older snapshot's numbering.
    pub fn line(&self, number: usize) -> Option<&Line> {
        if number == 0 || number > self.lines.len() {
            return None;
        }
        Some(&self.lines[number - 1])
    }

    pub fn line_mut(&mut self, number: usize) -> Option<&mut Line> {
        if number == 0 || number > self.lines.len() {
            return None;
        }
        Some(&mut self.lines[number - 1])
    }

    pub fn entry(&self, number: usize) -> Option<&Value> {
        self.line(number).and_then(|l| l.entry())
    }

    /// All accepted entries as `(line number, value)` in file order.
    pub fn entries(&self) -> impl DoubleEndedIterator<Item = (usize, &Value)> {
        self.lines
            .iter()
            .filter_map(|l| l.entry().map(|v| (l.number, v)))
    }

    pub fn invalid_lines(&self) -> impl Iterator<Item = &Line> {
        self.lines.iter().filter(|l| l.is_invalid())
    }

    /// Re-serialize the entry at `number` back into its raw line. Call after
    /// any in-place `Value` mutation so `assemble` emits the new content.
    pub fn reserialize(&mut self, number: usize) -> Result<(), EvsError> {
        let line = self
            .line_mut(number)
            .ok_or_else(|| EvsError::Other(format!("no line {number}")))?;
        if let jsonl::LineValue::Entry(v) = &line.parsed {
            line.raw = serde_json::to_string(v)?;
        }
        Ok(())
    }

    pub fn to_text(&self) -> String {
        jsonl::assemble(&self.lines)
    }
}

/// A parsed session: the transcript plus the agent tag that selects which
/// invariants, fixes, and compaction strategy apply.
#[derive(Debug, Clone)]
pub enum Session {
    Claude(Transcript),
    Codex(codex::CodexSession),
}

impl Session {
    /// Parse a transcript under an already-detected format.
    ///
    /// Operations other than `detect` refuse unknown formats — that refusal
    /// lives here so no caller can accidentally rewrite a foreign file.
    pub fn parse(transcript: Transcript, format: Format) -> Result<Session, EvsError> {
        match format {
            Format::Claude => Ok(Session::Claude(transcript)),
            Format::CodexWrapped => Ok(Session::Codex(codex::CodexSession::new(
                transcript,
                codex::CodexFlavor::Wrapped,
            ))),
            Format::CodexLegacy => Ok(Session::Codex(codex::CodexSession::new(
                transcript,
                codex::CodexFlavor::Legacy,
            ))),
            Format::Unknown => Err(EvsError::FormatUnknown(
                transcript.path.unwrap_or_else(|| PathBuf::from("<memory>")),
            )),
        }
    }

    /// Read + detect + parse in one step.
    pub fn load(path: &Path) -> Result<Session, EvsError> {
        let detection = detect::detect_path(path)?;
        let transcript = Transcript::read(path)?;
        Session::parse(transcript, detection.format)
    }

    pub fn agent(&self) -> Agent {
        match self {
            Session::Claude(_) => Agent::Claude,
            Session::Codex(_) => Agent::Codex,
        }
    }

    pub fn transcript(&self) -> &Transcript {
        match self {
            Session::Claude(t) => t,
            Session::Codex(c) => &c.transcript,
        }
    }

    pub fn transcript_mut(&mut self) -> &mut Transcript {
        match self {
            Session::Claude(t) => t,
            Session::Codex(c) => &mut c.transcript,
        }
    }

    /// The session id the agent itself uses: Agent-C `sessionId`, Agent-X
    /// `session_meta.payload.id` (or the legacy meta `id`).
    pub fn session_id(&self) -> Option<String> {
        match self {
            Session::Claude(t) => t
                .entries()
                .find_map(|(_, v)| v.get("sessionId").and_then(|s| s.as_str()))
                .map(|s| s.to_string()),
            Session::Codex(c) => c.session_id(),
        }
    }

    /// The working directory the session was started in, when recorded.
    pub fn cwd(&self) -> Option<String> {
        match self {
            Session::Claude(t) => t
                .entries()
                .find_map(|(_, v)| v.get("cwd").and_then(|s| s.as_str()))
                .map(|s| s.to_string()),
            Session::Codex(c) => c.cwd(),
        }
    }
}
