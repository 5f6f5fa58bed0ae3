//! Transcript format detection from a head sample.
//!
//! # Detection strategy
//!
//! Up to 25 head objects are sampled and checked against shape rules in a
//! fixed order. The first matching rule wins:
//!
//! 1. `{timestamp: string, type: string, payload: ...}` → Agent-X wrapped
//! 2. first object `{id: string, timestamp: string}` with no `type` → Agent-X legacy
//! 3. `{sessionId: string, uuid: string}` → Agent-C
//! 4. `type` ∈ {user, assistant, system, summary, file-history-snapshot} → Agent-C
//!
//! Rules 1–3 yield high confidence, rule 4 medium. Invalid JSON inside the
//! sample downgrades a high verdict to medium — the file is probably the
//! detected format, but something already chewed on it.

use std::path::Path;

use serde_json::Value;

use crate::error::EvsError;
use crate::jsonl;

const HEAD_SAMPLE: usize = 25;

/// On-disk transcript format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Format {
    Claude,
    CodexWrapped,
    CodexLegacy,
    Unknown,
}

impl std::fmt::Display for Format {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Format::Claude => write!(f, "claude"),
            Format::CodexWrapped => write!(f, "codex-wrapped"),
            Format::CodexLegacy => write!(f, "codex-legacy"),
            Format::Unknown => write!(f, "unknown"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

/// Detection verdict plus any notes worth surfacing (e.g. malformed lines).
#[derive(Debug, Clone)]
pub struct Detection {
    pub format: Format,
    pub confidence: Confidence,
    pub notes: Vec<String>,
}

/// Detect the format of the file at `path` from its head sample.
pub fn detect_path(path: &Path) -> Result<Detection, EvsError> {
    let (objects, malformed) = jsonl::read_head(path, HEAD_SAMPLE)?;
    Ok(detect_objects(&objects, malformed))
}

/// Pure classification over an already-sampled head.
pub fn detect_objects(objects: &[Value], malformed: usize) -> Detection {
    let mut notes = Vec::new();
    if malformed > 0 {
        notes.push(format!("{malformed} malformed line(s) in head sample"));
    }
    if objects.is_empty() {
        if malformed > 0 {
            notes.push("no valid JSON objects found".to_string());
        }
        return Detection {
            format: Format::Unknown,
            confidence: Confidence::Low,
            notes,
        };
    }

    let (format, mut confidence) = classify(objects);
    if malformed > 0 && confidence == Confidence::High {
        confidence = Confidence::Medium;
    }
    Detection { format, confidence, notes }
}

fn classify(objects: &[Value]) -> (Format, Confidence) {
    // Rule 1: wrapped envelope anywhere in the sample.
    if objects.iter().any(is_wrapped_envelope) {
        return (Format::CodexWrapped, Confidence::High);
    }

    // Rule 2: legacy meta must be the *first* object — that is its defining
    // position in the legacy layout.
    //
    // EDGE: the same `{id, timestamp}` shape deeper in the sample is just
    // some record that happens to carry those keys, not a header.
    if objects.first().is_some_and(is_legacy_meta) {
        return (Format::CodexLegacy, Confidence::High);
    }

    // Rule 3: Agent-C entries carry both sessionId and uuid.
    if objects
        .iter()
        .any(|o| is_string(o, "sessionId") && is_string(o, "uuid"))
    {
        return (Format::Claude, Confidence::High);
    }

    // Rule 4: recognizable Agent-C entry types, but without the id fields.
    const CLAUDE_TYPES: [&str; 5] = ["user", "assistant", "system", "summary", "file-history-snapshot"];
    if objects.iter().any(|o| {
        o.get("type")
            .and_then(|t| t.as_str())
            .is_some_and(|t| CLAUDE_TYPES.contains(&t))
    }) {
        return (Format::Claude, Confidence::Medium);
    }

    (Format::Unknown, Confidence::Low)
}

fn is_wrapped_envelope(o: &Value) -> bool {
    is_string(o, "timestamp") && is_string(o, "type") && o.get("payload").is_some()
}

fn is_legacy_meta(o: &Value) -> bool {
    is_string(o, "id") && is_string(o, "timestamp") && o.get("type").is_none()
}

fn is_string(o: &Value, key: &str) -> bool {
    o.get(key).is_some_and(|v| v.is_string())
}
