//! Agent-C (Claude-style) transcript primitives.
//!
//! # Architecture overview
//!
//! Entries stay raw `serde_json::Value`s; this module is the set of typed
//! views and derived structures everything else builds on:
//!
//! - field accessors (`uuid`, `parent_uuid`, `role`, content blocks)
//! - the tool-id map (`tool_use` / `tool_result` pairing by id)
//! - the visible chain (what the agent re-presents to the model at resume)
//! - assistant-turn equivalence classes (streamed responses split over
//!   several entries linked by `parentUuid` and a shared merge key)
//! - thinking-block predicates
//!
//! Every derived structure is computed fresh from the line arena per
//! operation. Nothing here caches across mutations.

use std::collections::HashMap;

use serde_json::{Value, json};

use super::Transcript;

// ── Field accessors ──────────────────────────────────────────────────────────

pub fn uuid(entry: &Value) -> Option<&str> {
    entry.get("uuid").and_then(|v| v.as_str())
}

/// `parentUuid`, treating both JSON `null` and an absent key as "root".
///
/// EDGE: the agent writes an explicit `null` for roots, but hand-edited and
/// truncated files drop the key entirely; collapsing both into `None` keeps
/// every chain walk from special-casing that.
pub fn parent_uuid(entry: &Value) -> Option<&str> {
    entry.get("parentUuid").and_then(|v| v.as_str())
}

pub fn set_parent_uuid(entry: &mut Value, parent: Option<&str>) {
    let v = match parent {
        Some(p) => Value::String(p.to_string()),
        None => Value::Null,
    };
    if let Some(obj) = entry.as_object_mut() {
        obj.insert("parentUuid".to_string(), v);
    }
}

pub fn entry_type(entry: &Value) -> Option<&str> {
    entry.get("type").and_then(|v| v.as_str())
}

pub fn message(entry: &Value) -> Option<&Value> {
    entry.get("message")
}

pub fn role(entry: &Value) -> Option<&str> {
    message(entry)?.get("role").and_then(|v| v.as_str())
}

/// `message.content` — either a plain string or a list of blocks.
pub fn content(entry: &Value) -> Option<&Value> {
    message(entry)?.get("content")
}

pub fn content_blocks(entry: &Value) -> Option<&Vec<Value>> {
    content(entry)?.as_array()
}

pub fn content_blocks_mut(entry: &mut Value) -> Option<&mut Vec<Value>> {
    entry.get_mut("message")?.get_mut("content")?.as_array_mut()
}

pub fn block_type(block: &Value) -> Option<&str> {
    block.get("type").and_then(|v| v.as_str())
}

pub fn is_thinking_block(block: &Value) -> bool {
    matches!(block_type(block), Some("thinking") | Some("redacted_thinking"))
}

/// A conversational entry: `type` user/assistant with a message role.
pub fn is_message_entry(entry: &Value) -> bool {
    matches!(entry_type(entry), Some("user") | Some("assistant"))
        && matches!(role(entry), Some("user") | Some("assistant"))
}

pub fn is_assistant(entry: &Value) -> bool {
    entry_type(entry) == Some("assistant") && role(entry) == Some("assistant")
}

pub fn is_meta(entry: &Value) -> bool {
    entry.get("isMeta").and_then(|v| v.as_bool()).unwrap_or(false)
}

pub fn is_sidechain(entry: &Value) -> bool {
    entry
        .get("isSidechain")
        .and_then(|v| v.as_bool())
        .unwrap_or(false)
}

/// Synthetic API-error messages the agent writes back into the transcript.
/// They are excluded from the visible chain and removable by the fixer.
pub fn is_api_error(entry: &Value) -> bool {
    if entry
        .get("isApiErrorMessage")
        .and_then(|v| v.as_bool())
        .unwrap_or(false)
    {
        return true;
    }
    // Older agent versions mark nothing and just write the text.
    entry_type(entry) == Some("assistant")
        && content_blocks(entry).is_some_and(|blocks| {
            blocks.iter().any(|b| {
                block_type(b) == Some("text")
                    && b.get("text")
                        .and_then(|t| t.as_str())
                        .is_some_and(|t| t.starts_with("API Error:"))
            })
        })
}

/// A compact boundary: either the agent's own `summary` entry type or a user
/// entry flagged as a compact summary (the form eversession writes).
pub fn is_compact_boundary(entry: &Value) -> bool {
    entry_type(entry) == Some("summary")
        || (entry_type(entry) == Some("user")
            && entry
                .get("isCompactSummary")
                .and_then(|v| v.as_bool())
                .unwrap_or(false))
}

/// Merge key for streamed assistant chunks: prefer `message.id`, fall back
/// to `requestId`. Entries that disagree on both are never merged.
///
/// WHY: `message.id` is assigned by the API and is the stronger identity;
/// `requestId` is client-side bookkeeping that can span retries. When both
/// are present and disagree, merging would glue together two different
/// responses — refusing is the only safe answer.
pub fn merge_key(entry: &Value) -> Option<&str> {
    if let Some(id) = message(entry).and_then(|m| m.get("id")).and_then(|v| v.as_str()) {
        return Some(id);
    }
    entry.get("requestId").and_then(|v| v.as_str())
}

/// Whether two assistant entries belong to the same streamed response.
pub fn same_merge_key(a: &Value, b: &Value) -> bool {
    let a_msg = message(a).and_then(|m| m.get("id")).and_then(|v| v.as_str());
    let b_msg = message(b).and_then(|m| m.get("id")).and_then(|v| v.as_str());
    if let (Some(x), Some(y)) = (a_msg, b_msg) {
        return x == y;
    }
    let a_req = a.get("requestId").and_then(|v| v.as_str());
    let b_req = b.get("requestId").and_then(|v| v.as_str());
    if let (Some(x), Some(y)) = (a_req, b_req) {
        return x == y;
    }
    false
}

// ── Tool-id pairing ──────────────────────────────────────────────────────────

/// `tool_use` ids contributed by an entry's content blocks.
pub fn tool_use_ids(entry: &Value) -> Vec<String> {
    block_ids(entry, "tool_use", "id")
}

/// `tool_result` ids referenced by an entry's content blocks.
pub fn tool_result_ids(entry: &Value) -> Vec<String> {
    block_ids(entry, "tool_result", "tool_use_id")
}

fn block_ids(entry: &Value, btype: &str, key: &str) -> Vec<String> {
    content_blocks(entry)
        .map(|blocks| {
            blocks
                .iter()
                .filter(|b| block_type(b) == Some(btype))
                .filter_map(|b| b.get(key).and_then(|v| v.as_str()))
                .map(|s| s.to_string())
                .collect()
        })
        .unwrap_or_default()
}

/// Tool id → contributing line numbers, for both sides of the pair.
#[derive(Debug, Default)]
pub struct ToolIdMap {
    pub uses: HashMap<String, Vec<usize>>,
    pub results: HashMap<String, Vec<usize>>,
}

pub fn tool_id_map(transcript: &Transcript) -> ToolIdMap {
    let mut map = ToolIdMap::default();
    for (number, entry) in transcript.entries() {
        for id in tool_use_ids(entry) {
            map.uses.entry(id).or_default().push(number);
        }
        for id in tool_result_ids(entry) {
            map.results.entry(id).or_default().push(number);
        }
    }
    map
}

// ── Uuid index & chains ──────────────────────────────────────────────────────

/// `uuid → line number`.
///
/// WHY: when a uuid is duplicated (an invariant violation the validator
/// reports separately), the first occurrence wins — that matches how the
/// agent itself resolves parents, and resolution must agree with it even
/// on broken files.
pub fn uuid_index(transcript: &Transcript) -> HashMap<String, usize> {
    let mut index = HashMap::new();
    for (number, entry) in transcript.entries() {
        if let Some(id) = uuid(entry) {
            index.entry(id.to_string()).or_insert(number);
        }
    }
    index
}

/// The visible chain: line numbers of the messages the agent will re-present
/// at resume, in chronological order.
///
/// Starts at the newest user/assistant entry that is not an API error and
/// walks `parentUuid` backwards until a root (`null`) or an unknown uuid.
pub fn visible_chain(transcript: &Transcript) -> Vec<usize> {
    let index = uuid_index(transcript);
    let leaf = transcript
        .entries()
        .filter(|(_, e)| is_message_entry(e) && !is_api_error(e))
        .map(|(n, _)| n)
        .next_back();
    let Some(leaf) = leaf else {
        return Vec::new();
    };

    let mut chain = Vec::new();
    let mut current = Some(leaf);
    // Hop bound guards against parentUuid cycles in corrupt files.
    let mut hops = 0usize;
    while let Some(number) = current {
        if hops > transcript.lines.len() {
            break;
        }
        hops += 1;
        chain.push(number);
        let Some(entry) = transcript.entry(number) else {
            break;
        };
        current = parent_uuid(entry)
            .and_then(|p| index.get(p).copied())
            .filter(|parent| !chain.contains(parent));
    }
    chain.reverse();
    chain
}

/// Assistant-turn equivalence classes: each class is a root assistant entry
/// plus every assistant descendant reachable through `parentUuid`.
///
/// Removals that touch any member must include all members, otherwise the
/// surviving chunks of a streamed response present a half response (and a
/// thinking block that is no longer first) at resume.
pub fn assistant_turns(transcript: &Transcript) -> Vec<Vec<usize>> {
    let index = uuid_index(transcript);

    // parent line → assistant child lines
    let mut children: HashMap<usize, Vec<usize>> = HashMap::new();
    // assistant lines whose parent is also an assistant entry
    let mut has_assistant_parent: HashMap<usize, bool> = HashMap::new();

    for (number, entry) in transcript.entries() {
        if !is_assistant(entry) {
            continue;
        }
        let parent_line = parent_uuid(entry).and_then(|p| index.get(p).copied());
        let parent_is_assistant = parent_line
            .and_then(|p| transcript.entry(p))
            .is_some_and(is_assistant);
        has_assistant_parent.insert(number, parent_is_assistant);
        if let Some(p) = parent_line {
            if parent_is_assistant {
                children.entry(p).or_default().push(number);
            }
        }
    }

    let mut turns = Vec::new();
    let mut roots: Vec<usize> = has_assistant_parent
        .iter()
        .filter(|&(_, &nested)| !nested)
        .map(|(&n, _)| n)
        .collect();
    roots.sort_unstable();

    for root in roots {
        let mut members = vec![root];
        let mut stack = vec![root];
        while let Some(n) = stack.pop() {
            if let Some(kids) = children.get(&n) {
                for &kid in kids {
                    if !members.contains(&kid) {
                        members.push(kid);
                        stack.push(kid);
                    }
                }
            }
        }
        members.sort_unstable();
        turns.push(members);
    }
    turns
}

// ── Thinking predicates ──────────────────────────────────────────────────────

/// Does this content start with a thinking block, given it contains any?
/// Returns `None` when there are no thinking blocks at all (nothing to check).
pub fn thinking_order_ok(blocks: &[Value]) -> Option<bool> {
    if !blocks.iter().any(is_thinking_block) {
        return None;
    }
    Some(blocks.first().is_some_and(is_thinking_block))
}

/// Merge consecutive same-key assistant chunk contents (in chain order) and
/// report whether the merged content still begins with thinking.
pub fn merged_thinking_order_ok(chunks: &[&Value]) -> Option<bool> {
    let mut merged: Vec<&Value> = Vec::new();
    for entry in chunks {
        if let Some(blocks) = content_blocks(entry) {
            merged.extend(blocks.iter());
        }
    }
    if !merged.iter().any(|b| is_thinking_block(b)) {
        return None;
    }
    Some(merged.first().is_some_and(|b| is_thinking_block(b)))
}

// ── Synthetic entries ────────────────────────────────────────────────────────

/// Environment fields copied from a template entry onto synthetic entries so
/// the agent accepts them as its own.
const ENV_FIELDS: [&str; 6] = ["sessionId", "cwd", "version", "gitBranch", "slug", "userType"];

/// Build a synthetic user entry carrying `summary_text`, environment-cloned
/// from `template`.
pub fn synthetic_summary_entry(template: &Value, summary_text: &str, uuid: &str) -> Value {
    let mut entry = json!({
        "type": "user",
        "uuid": uuid,
        "parentUuid": null,
        "isSidechain": false,
        "isCompactSummary": true,
        "timestamp": chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        "message": {"role": "user", "content": summary_text},
    });
    for field in ENV_FIELDS {
        if let Some(v) = template.get(field) {
            entry[field] = v.clone();
        }
    }
    entry
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::super::testutil::*;
    use super::*;

    #[test]
    fn test_parent_uuid_null_and_missing_are_root() {
        let explicit = user_entry("u1", None, "hi");
        assert_eq!(parent_uuid(&explicit), None);
        let missing = json!({"uuid": "u2", "type": "user"});
        assert_eq!(parent_uuid(&missing), None);
        let set = user_entry("u3", Some("u1"), "hi");
        assert_eq!(parent_uuid(&set), Some("u1"));
    }

    #[test]
    fn test_tool_id_map_pairs_by_id() {
        let t = transcript_of(&[
            user_entry("u1", None, "run it"),
            assistant_entry("a1", Some("u1"), vec![tool_use_block("t1", "Bash")]),
            user_tool_result("u2", Some("a1"), "t1"),
        ]);
        let map = tool_id_map(&t);
        assert_eq!(map.uses.get("t1"), Some(&vec![2]));
        assert_eq!(map.results.get("t1"), Some(&vec![3]));
    }

    #[test]
    fn test_visible_chain_chronological() {
        let t = transcript_of(&[
            user_entry("u1", None, "one"),
            assistant_entry("a1", Some("u1"), vec![text_block("two")]),
            user_entry("u2", Some("a1"), "three"),
        ]);
        assert_eq!(visible_chain(&t), vec![1, 2, 3]);
    }

    #[test]
    fn test_visible_chain_skips_api_error_leaf() {
        let mut err = assistant_entry("a2", Some("u2"), vec![text_block("API Error: 400")]);
        err["isApiErrorMessage"] = json!(true);
        let t = transcript_of(&[
            user_entry("u1", None, "one"),
            user_entry("u2", Some("u1"), "two"),
            err,
        ]);
        // The chain starts at u2, not the API error entry.
        assert_eq!(visible_chain(&t), vec![1, 2]);
    }

    #[test]
    fn test_visible_chain_stops_at_unknown_parent() {
        let t = transcript_of(&[
            user_entry("u2", Some("gone"), "two"),
            assistant_entry("a1", Some("u2"), vec![text_block("three")]),
        ]);
        assert_eq!(visible_chain(&t), vec![1, 2]);
    }

    #[test]
    fn test_visible_chain_survives_parent_cycle() {
        let t = transcript_of(&[
            user_entry("u1", Some("u2"), "one"),
            user_entry("u2", Some("u1"), "two"),
        ]);
        let chain = visible_chain(&t);
        assert_eq!(chain, vec![1, 2]);
    }

    #[test]
    fn test_assistant_turns_group_streamed_chunks() {
        let t = transcript_of(&[
            user_entry("u1", None, "go"),
            assistant_entry("a1", Some("u1"), vec![thinking_block("hm")]),
            assistant_entry("a2", Some("a1"), vec![text_block("part 1")]),
            assistant_entry("a3", Some("a2"), vec![text_block("part 2")]),
            user_entry("u2", Some("a3"), "next"),
            assistant_entry("b1", Some("u2"), vec![text_block("answer")]),
        ]);
        let turns = assistant_turns(&t);
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0], vec![2, 3, 4]);
        assert_eq!(turns[1], vec![6]);
    }

    #[test]
    fn test_thinking_order_ok() {
        let good = vec![thinking_block("t"), text_block("x")];
        assert_eq!(thinking_order_ok(&good), Some(true));
        let bad = vec![text_block("x"), thinking_block("t")];
        assert_eq!(thinking_order_ok(&bad), Some(false));
        let none = vec![text_block("x")];
        assert_eq!(thinking_order_ok(&none), None);
    }

    #[test]
    fn test_merged_thinking_order() {
        let a = assistant_entry("a1", None, vec![thinking_block("t")]);
        let b = assistant_entry("a2", Some("a1"), vec![text_block("x")]);
        assert_eq!(merged_thinking_order_ok(&[&a, &b]), Some(true));
        assert_eq!(merged_thinking_order_ok(&[&b, &a]), Some(false));
    }

    #[test]
    fn test_same_merge_key_never_merges_on_disagreement() {
        let mut a = assistant_entry("a1", None, vec![]);
        let mut b = assistant_entry("a2", None, vec![]);
        // Same requestId but different message.id: message.id wins, no merge.
        a["requestId"] = json!("req-x");
        b["requestId"] = json!("req-x");
        assert!(!same_merge_key(&a, &b));
        // Drop message ids: requestId now decides.
        a["message"].as_object_mut().unwrap().remove("id");
        b["message"].as_object_mut().unwrap().remove("id");
        assert!(same_merge_key(&a, &b));
    }

    #[test]
    fn test_synthetic_summary_copies_environment() {
        let template = user_entry("u1", None, "hi");
        let s = synthetic_summary_entry(&template, "the summary", "new-uuid");
        assert_eq!(s["type"], "user");
        assert_eq!(s["uuid"], "new-uuid");
        assert_eq!(s["sessionId"], "sess-1");
        assert_eq!(s["cwd"], "/proj");
        assert_eq!(s["gitBranch"], "main");
        assert_eq!(s["isCompactSummary"], true);
        assert_eq!(s["isSidechain"], false);
        assert_eq!(s["message"]["content"], "the summary");
        assert!(is_compact_boundary(&s));
    }
}
