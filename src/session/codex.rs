//! Agent-X (Codex-style) transcript primitives.
//!
//! # System context
//!
//! Two on-disk layouts exist. The wrapped form puts every record in a
//! `{timestamp, type, payload}` envelope; relevant types are `session_meta`
//! (once, first), `response_item`, `event_msg`, `turn_context`, and
//! `compacted`. The legacy form opens with a bare `{id, timestamp, ...}`
//! meta object and follows with raw response items.
//!
//! Calls and outputs pair by `call_id` with kind compatibility:
//! `function_call` and `local_shell_call` are answered by
//! `function_call_output`; `custom_tool_call` by `custom_tool_call_output`.

use std::collections::HashMap;

use serde_json::Value;

use super::Transcript;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodexFlavor {
    Wrapped,
    Legacy,
}

/// Classification of one accepted line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    /// `{timestamp, type, payload}` envelope.
    Wrapped,
    /// The first object of a legacy file.
    LegacyMeta,
    /// Any subsequent legacy object.
    LegacyRecord,
    /// An object with neither shape.
    UnknownJson,
}

#[derive(Debug, Clone)]
pub struct CodexSession {
    pub transcript: Transcript,
    pub flavor: CodexFlavor,
}

impl CodexSession {
    pub fn new(transcript: Transcript, flavor: CodexFlavor) -> CodexSession {
        CodexSession { transcript, flavor }
    }

    pub fn session_id(&self) -> Option<String> {
        match self.flavor {
            CodexFlavor::Wrapped => self
                .transcript
                .entries()
                .find(|(_, e)| envelope_type(e) == Some("session_meta"))
                .and_then(|(_, e)| e.get("payload")?.get("id")?.as_str().map(String::from)),
            CodexFlavor::Legacy => self
                .transcript
                .entries()
                .next()
                .and_then(|(_, e)| e.get("id")?.as_str().map(String::from)),
        }
    }

    pub fn cwd(&self) -> Option<String> {
        match self.flavor {
            CodexFlavor::Wrapped => self
                .transcript
                .entries()
                .find(|(_, e)| envelope_type(e) == Some("session_meta"))
                .and_then(|(_, e)| e.get("payload")?.get("cwd")?.as_str().map(String::from)),
            CodexFlavor::Legacy => None,
        }
    }

    /// Classify each accepted entry by its position and shape.
    pub fn classify(&self, line_number: usize, entry: &Value) -> RecordKind {
        match self.flavor {
            CodexFlavor::Wrapped => {
                if is_envelope(entry) {
                    RecordKind::Wrapped
                } else {
                    RecordKind::UnknownJson
                }
            }
            CodexFlavor::Legacy => {
                let first_entry = self.transcript.entries().next().map(|(n, _)| n);
                if Some(line_number) == first_entry {
                    RecordKind::LegacyMeta
                } else if entry.is_object() {
                    RecordKind::LegacyRecord
                } else {
                    RecordKind::UnknownJson
                }
            }
        }
    }

    /// The response item carried by a line: the envelope payload for wrapped
    /// files, the object itself for legacy records.
    pub fn item<'a>(&self, entry: &'a Value) -> Option<&'a Value> {
        match self.flavor {
            CodexFlavor::Wrapped => {
                if envelope_type(entry) == Some("response_item") {
                    entry.get("payload")
                } else {
                    None
                }
            }
            CodexFlavor::Legacy => {
                if entry.get("type").is_some() {
                    Some(entry)
                } else {
                    None
                }
            }
        }
    }
}

pub fn is_envelope(entry: &Value) -> bool {
    entry.get("timestamp").is_some_and(|v| v.is_string())
        && entry.get("type").is_some_and(|v| v.is_string())
        && entry.get("payload").is_some()
}

pub fn envelope_type(entry: &Value) -> Option<&str> {
    if is_envelope(entry) {
        entry.get("type").and_then(|v| v.as_str())
    } else {
        None
    }
}

pub fn item_type(item: &Value) -> Option<&str> {
    item.get("type").and_then(|v| v.as_str())
}

pub fn call_id(item: &Value) -> Option<&str> {
    item.get("call_id").and_then(|v| v.as_str())
}

pub fn is_call(item: &Value) -> bool {
    matches!(
        item_type(item),
        Some("function_call") | Some("custom_tool_call") | Some("local_shell_call")
    )
}

pub fn is_output(item: &Value) -> bool {
    matches!(
        item_type(item),
        Some("function_call_output") | Some("custom_tool_call_output")
    )
}

/// Kind compatibility for a call/output pair sharing a `call_id`.
///
/// EDGE: `local_shell_call` has no output type of its own — the agent
/// answers it with a plain `function_call_output`, so that pairing is
/// valid even though the names disagree.
pub fn output_matches_call(call_type: &str, output_type: &str) -> bool {
    match call_type {
        "function_call" | "local_shell_call" => output_type == "function_call_output",
        "custom_tool_call" => output_type == "custom_tool_call_output",
        _ => false,
    }
}

/// The synthetic output type answering a given call type.
pub fn output_type_for_call(call_type: &str) -> &'static str {
    match call_type {
        "custom_tool_call" => "custom_tool_call_output",
        _ => "function_call_output",
    }
}

/// call_id → (line, item type) maps for both sides.
#[derive(Debug, Default)]
pub struct CallMap {
    pub calls: HashMap<String, Vec<(usize, String)>>,
    pub outputs: HashMap<String, Vec<(usize, String)>>,
}

pub fn call_map(session: &CodexSession) -> CallMap {
    let mut map = CallMap::default();
    for (number, entry) in session.transcript.entries() {
        let Some(item) = session.item(entry) else {
            continue;
        };
        let Some(id) = call_id(item) else { continue };
        let Some(ty) = item_type(item) else { continue };
        if is_call(item) {
            map.calls
                .entry(id.to_string())
                .or_default()
                .push((number, ty.to_string()));
        } else if is_output(item) {
            map.outputs
                .entry(id.to_string())
                .or_default()
                .push((number, ty.to_string()));
        }
    }
    map
}

/// `sandbox_policy.mode` is the legacy spelling of `sandbox_policy.type`.
/// Reported by the validator; rewritten by legacy migration.
pub fn has_sandbox_mode_alias(item: &Value) -> bool {
    item.get("sandbox_policy")
        .and_then(|p| p.as_object())
        .is_some_and(|p| p.contains_key("mode") && !p.contains_key("type"))
}


#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::testutil::*;
    use super::*;

    #[test]
    fn test_session_id_and_cwd_wrapped() {
        let s = wrapped_session(&[session_meta("thread-1", "/proj"), user_message("hi")]);
        assert_eq!(s.session_id().as_deref(), Some("thread-1"));
        assert_eq!(s.cwd().as_deref(), Some("/proj"));
    }

    #[test]
    fn test_session_id_legacy() {
        let s = legacy_session(&[
            json!({"id": "legacy-1", "timestamp": "2025-06-01T10:00:00Z"}),
            json!({"type": "message", "role": "user", "content": []}),
        ]);
        assert_eq!(s.session_id().as_deref(), Some("legacy-1"));
        assert_eq!(s.classify(1, s.transcript.entry(1).unwrap()), RecordKind::LegacyMeta);
        assert_eq!(s.classify(2, s.transcript.entry(2).unwrap()), RecordKind::LegacyRecord);
    }

    #[test]
    fn test_call_map_pairs_by_call_id() {
        let s = wrapped_session(&[
            session_meta("t1", "/proj"),
            function_call("c1", "shell"),
            function_output("c1", "{\"exit_code\":0}"),
        ]);
        let map = call_map(&s);
        assert_eq!(map.calls["c1"], vec![(2, "function_call".to_string())]);
        assert_eq!(map.outputs["c1"], vec![(3, "function_call_output".to_string())]);
    }

    #[test]
    fn test_output_kind_compatibility() {
        assert!(output_matches_call("function_call", "function_call_output"));
        assert!(output_matches_call("local_shell_call", "function_call_output"));
        assert!(output_matches_call("custom_tool_call", "custom_tool_call_output"));
        assert!(!output_matches_call("custom_tool_call", "function_call_output"));
        assert!(!output_matches_call("function_call", "custom_tool_call_output"));
    }

    #[test]
    fn test_sandbox_mode_alias() {
        let aliased = json!({"type": "turn_context", "sandbox_policy": {"mode": "workspace-write"}});
        assert!(has_sandbox_mode_alias(&aliased));
        let modern = json!({"type": "turn_context", "sandbox_policy": {"type": "workspace-write"}});
        assert!(!has_sandbox_mode_alias(&modern));
    }

    #[test]
    fn test_item_extraction_wrapped_vs_legacy() {
        let w = wrapped_session(&[function_call("c1", "shell")]);
        let entry = w.transcript.entry(1).unwrap();
        assert_eq!(item_type(w.item(entry).unwrap()), Some("function_call"));

        let l = legacy_session(&[
            json!({"id": "m", "timestamp": "t"}),
            json!({"type": "function_call", "call_id": "c2", "name": "shell", "arguments": "{}"}),
        ]);
        let entry = l.transcript.entry(2).unwrap();
        assert_eq!(item_type(l.item(entry).unwrap()), Some("function_call"));
    }
}
