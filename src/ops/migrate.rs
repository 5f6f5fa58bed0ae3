//! Legacy → wrapped migration for Agent-X rollouts.
//!
//! The legacy layout has a bare meta object on line one and raw response
//! items after it. Migration wraps every record in the modern
//! `{timestamp, type, payload}` envelope and modernizes the
//! `sandbox_policy.mode` spelling. Non-legacy input is a committed no-op,
//! so migrating twice changes nothing.

use serde_json::{Value, json};

use crate::error::EvsError;
use crate::jsonl::{Line, LineValue};
use crate::session::{Session, codex};

use super::{Change, ChangeSet, Rewrite};

pub fn migrate_legacy_to_wrapped(session: &Session) -> Result<Rewrite, EvsError> {
    let Session::Codex(c) = session else {
        return Ok(Rewrite::unchanged(session.transcript()));
    };
    if c.flavor != codex::CodexFlavor::Legacy {
        return Ok(Rewrite::unchanged(&c.transcript));
    }

    let mut entries = c.transcript.entries();
    let Some((meta_line, meta)) = entries.next() else {
        return Ok(Rewrite::unchanged(&c.transcript));
    };
    let meta_timestamp = meta
        .get("timestamp")
        .and_then(|t| t.as_str())
        .unwrap_or("")
        .to_string();
    drop(entries);

    let mut changes = ChangeSet::default();
    let mut lines: Vec<Line> = Vec::with_capacity(c.transcript.lines.len());

    for line in &c.transcript.lines {
        let Some(entry) = line.entry() else {
            // Invalid and blank lines pass through untouched.
            lines.push(line.clone());
            continue;
        };

        let envelope = if line.number == meta_line {
            json!({
                "timestamp": meta_timestamp,
                "type": "session_meta",
                "payload": entry.clone(),
            })
        } else {
            let mut payload = entry.clone();
            modernize_sandbox_policy(&mut payload);
            // WHY: legacy records rarely carry their own timestamp; the
            // meta's is the best available stand-in and keeps the envelope
            // field non-empty for every consumer that sorts on it.
            let timestamp = entry
                .get("timestamp")
                .and_then(|t| t.as_str())
                .unwrap_or(&meta_timestamp);
            json!({
                "timestamp": timestamp,
                "type": "response_item",
                "payload": payload,
            })
        };
        let raw = serde_json::to_string(&envelope)?;
        lines.push(Line {
            number: line.number,
            raw,
            parsed: LineValue::Entry(envelope),
        });
        changes.changes.push(Change::UpdateLine {
            line: line.number,
            reason: "wrapped in a modern envelope".to_string(),
        });
    }

    Ok(Rewrite { lines, changes })
}

/// `sandbox_policy.mode` → `sandbox_policy.type`, preserving the value.
fn modernize_sandbox_policy(payload: &mut Value) {
    let Some(policy) = payload
        .get_mut("sandbox_policy")
        .and_then(|p| p.as_object_mut())
    else {
        return;
    };
    if policy.contains_key("type") {
        return;
    }
    if let Some(mode) = policy.remove("mode") {
        policy.insert("type".to_string(), mode);
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::detect::{self, Format};
    use crate::ops;
    use crate::session::codex::testutil as ctu;

    #[test]
    fn test_migrate_wraps_meta_and_records() {
        let s = Session::Codex(ctu::legacy_session(&[
            json!({"id": "legacy-1", "timestamp": "2025-06-01T10:00:00Z", "git": {"branch": "main"}}),
            json!({"type": "message", "role": "user", "content": [{"type": "input_text", "text": "hi"}]}),
            json!({"type": "function_call", "call_id": "c1", "name": "shell", "arguments": "{}",
                   "sandbox_policy": {"mode": "read-only"}}),
        ]));
        let rewrite = migrate_legacy_to_wrapped(&s).unwrap();
        assert_eq!(rewrite.changes.changes.len(), 3);

        let objects: Vec<Value> = rewrite
            .lines
            .iter()
            .filter_map(|l| l.entry().cloned())
            .collect();
        let d = detect::detect_objects(&objects, 0);
        assert_eq!(d.format, Format::CodexWrapped);

        assert_eq!(objects[0]["type"], "session_meta");
        assert_eq!(objects[0]["payload"]["id"], "legacy-1");
        assert_eq!(objects[1]["type"], "response_item");
        assert_eq!(objects[1]["payload"]["type"], "message");
        // Alias modernized during the wrap.
        assert_eq!(objects[2]["payload"]["sandbox_policy"]["type"], "read-only");
        assert!(objects[2]["payload"]["sandbox_policy"].get("mode").is_none());
    }

    #[test]
    fn test_migrate_noop_on_wrapped() {
        let s = Session::Codex(ctu::wrapped_session(&[
            ctu::session_meta("t1", "/p"),
            ctu::user_message("hi"),
        ]));
        let rewrite = migrate_legacy_to_wrapped(&s).unwrap();
        assert!(rewrite.changes.is_empty());
        assert_eq!(rewrite.to_text(), s.transcript().to_text());
    }

    #[test]
    fn test_migrate_twice_is_stable() {
        let s = Session::Codex(ctu::legacy_session(&[
            json!({"id": "legacy-1", "timestamp": "2025-06-01T10:00:00Z"}),
            json!({"type": "message", "role": "user", "content": []}),
        ]));
        let rewrite = migrate_legacy_to_wrapped(&s).unwrap();
        // Re-detect and re-migrate: the wrapped result must pass through.
        let text = rewrite.to_text();
        let objects: Vec<Value> = crate::session::Transcript::from_text(&text)
            .entries()
            .map(|(_, v)| v.clone())
            .collect();
        let format = detect::detect_objects(&objects, 0).format;
        let reparsed = Session::parse(crate::session::Transcript::from_text(&text), format).unwrap();
        let again = migrate_legacy_to_wrapped(&reparsed).unwrap();
        assert!(again.changes.is_empty());
        assert_eq!(again.to_text(), text);
    }

    #[test]
    fn test_migrate_noop_on_claude() {
        let s = Session::Claude(crate::session::Transcript::from_text("{\"type\":\"user\"}\n"));
        let rewrite = migrate_legacy_to_wrapped(&s).unwrap();
        assert!(rewrite.changes.is_empty());
    }

    #[test]
    fn test_commit_of_migration_round_trips() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("rollout.jsonl");
        std::fs::write(
            &path,
            concat!(
                "{\"id\":\"legacy-1\",\"timestamp\":\"2025-06-01T10:00:00Z\"}\n",
                "{\"type\":\"message\",\"role\":\"user\",\"content\":[]}\n",
            ),
        )
        .unwrap();
        let s = Session::load(&path).unwrap();
        assert!(matches!(&s, Session::Codex(c) if c.flavor == codex::CodexFlavor::Legacy));

        let rewrite = migrate_legacy_to_wrapped(&s).unwrap();
        let report = ops::commit(&s, rewrite, false, false).unwrap();
        assert!(report.written);

        let reloaded = Session::load(&path).unwrap();
        assert!(matches!(&reloaded, Session::Codex(c) if c.flavor == codex::CodexFlavor::Wrapped));
    }
}
