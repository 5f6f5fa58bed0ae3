//! Safe automatic repairs.
//!
//! # Architecture overview
//!
//! Every repair is a pure rewrite: the fixer takes a parsed session and
//! produces a proposed line list plus a change set, never touching the disk.
//! Removals go through the shared kernel (`ops`) so tool pairs stay intact.
//!
//! The option set mirrors what is actually safe to do unattended:
//!
//! - retarget broken `parentUuid`s to the nearest previous known uuid
//! - reorder thinking blocks to the front, preserving intra-category order
//! - collapse streamed assistant chunks whose merged content would present
//!   thinking out of order
//! - drop orphan tool results (hard API errors at resume)
//! - drop orphan tool uses and synthetic API error messages
//! - optionally strip thinking blocks entirely ("hard" mode, off by default)
//! - optionally insert synthetic aborted outputs for unanswered Agent-X calls
//!
//! Compact runs a restricted post-fix (`FixOptions::compact_postfix`) where
//! every history-deleting option is off.

use std::collections::BTreeMap;

use serde_json::{Value, json};

use crate::error::EvsError;
use crate::ops::{self, Change, ChangeSet, ExpansionOptions, Rewrite};
use crate::session::{Session, claude, codex};

#[derive(Debug, Clone, Copy)]
pub struct FixOptions {
    pub repair_broken_parent_uuids: bool,
    pub fix_thinking_block_order: bool,
    pub remove_orphan_tool_results: bool,
    pub remove_orphan_tool_uses: bool,
    pub remove_api_error_messages: bool,
    /// Delete every thinking block; a placeholder text block keeps content
    /// non-empty. Off unless explicitly requested.
    pub strip_thinking_blocks: bool,
    /// Agent-X: answer every unanswered call with a synthetic "aborted"
    /// output. Off unless explicitly requested.
    pub insert_aborted_outputs: bool,
}

impl Default for FixOptions {
    fn default() -> Self {
        FixOptions {
            repair_broken_parent_uuids: true,
            fix_thinking_block_order: true,
            remove_orphan_tool_results: true,
            remove_orphan_tool_uses: true,
            remove_api_error_messages: true,
            strip_thinking_blocks: false,
            insert_aborted_outputs: false,
        }
    }
}

impl FixOptions {
    /// The restricted set compact runs after inserting its summary: reorder
    /// and collapse only, no history deletions.
    pub fn compact_postfix() -> FixOptions {
        FixOptions {
            repair_broken_parent_uuids: false,
            fix_thinking_block_order: true,
            remove_orphan_tool_results: false,
            remove_orphan_tool_uses: false,
            remove_api_error_messages: false,
            strip_thinking_blocks: false,
            insert_aborted_outputs: false,
        }
    }
}

/// Apply the selected repairs and return the proposed rewrite.
pub fn apply(session: &Session, options: FixOptions) -> Result<Rewrite, EvsError> {
    match session {
        Session::Claude(_) => apply_claude(session, options),
        Session::Codex(_) => apply_codex(session, options),
    }
}

// ── Agent-C ──────────────────────────────────────────────────────────────────

fn apply_claude(session: &Session, options: FixOptions) -> Result<Rewrite, EvsError> {
    let transcript = session.transcript();
    let mut working = transcript.clone();
    let mut changes = ChangeSet::default();

    if options.fix_thinking_block_order {
        reorder_thinking_blocks(&mut working, &mut changes)?;
    }
    if options.strip_thinking_blocks {
        strip_thinking(&mut working, &mut changes)?;
    }
    if options.repair_broken_parent_uuids {
        repair_parent_uuids(&mut working, &mut changes)?;
    }

    // WHY: removals come last so they see the in-place edits above — a
    // chunk that reordering already repaired must not also be collapsed,
    // and orphan detection must run against the post-edit content.
    let mut marked: BTreeMap<usize, String> = BTreeMap::new();

    if options.fix_thinking_block_order {
        mark_streaming_collapse(&mut working, &mut marked, &mut changes)?;
    }
    if options.remove_orphan_tool_results {
        let map = claude::tool_id_map(&working);
        for (id, result_lines) in &map.results {
            if !map.uses.contains_key(id) {
                for &n in result_lines {
                    marked.insert(n, format!("orphan tool_result {id}"));
                }
            }
        }
    }
    if options.remove_orphan_tool_uses {
        let map = claude::tool_id_map(&working);
        for (id, use_lines) in &map.uses {
            if !map.results.contains_key(id) {
                for &n in use_lines {
                    marked.insert(n, format!("orphan tool_use {id}"));
                }
            }
        }
    }
    if options.remove_api_error_messages {
        for (n, entry) in working.entries() {
            if claude::is_api_error(entry) {
                marked.insert(n, "synthetic API error message".to_string());
            }
        }
    }

    let expansion = ExpansionOptions {
        tool_pairs: options.remove_orphan_tool_results || options.remove_orphan_tool_uses,
        assistant_turns: false,
    };
    let working_session = Session::Claude(working);
    let selection = ops::expand_selection(&working_session, &marked, expansion);
    let mut rewrite = ops::build_removal(&working_session, &selection);
    changes.changes.append(&mut rewrite.changes.changes);
    Ok(Rewrite { lines: rewrite.lines, changes })
}

/// Move thinking blocks to the front of each assistant message, preserving
/// order within the thinking and non-thinking groups.
fn reorder_thinking_blocks(
    working: &mut crate::session::Transcript,
    changes: &mut ChangeSet,
) -> Result<(), EvsError> {
    let targets: Vec<usize> = working
        .entries()
        .filter(|(_, e)| {
            claude::is_assistant(e)
                && claude::content_blocks(e)
                    .is_some_and(|b| claude::thinking_order_ok(b) == Some(false))
        })
        .map(|(n, _)| n)
        .collect();

    for number in targets {
        if let Some(entry) = working.line_mut(number).and_then(|l| l.entry_mut()) {
            if let Some(blocks) = claude::content_blocks_mut(entry) {
                let (thinking, rest): (Vec<Value>, Vec<Value>) =
                    blocks.drain(..).partition(|b| claude::is_thinking_block(b));
                blocks.extend(thinking);
                blocks.extend(rest);
            }
        }
        working.reserialize(number)?;
        changes.changes.push(Change::UpdateLine {
            line: number,
            reason: "thinking blocks moved to the front".to_string(),
        });
    }
    Ok(())
}

/// Delete every thinking block; insert a placeholder when content empties.
fn strip_thinking(
    working: &mut crate::session::Transcript,
    changes: &mut ChangeSet,
) -> Result<(), EvsError> {
    let targets: Vec<usize> = working
        .entries()
        .filter(|(_, e)| {
            claude::content_blocks(e).is_some_and(|b| b.iter().any(claude::is_thinking_block))
        })
        .map(|(n, _)| n)
        .collect();

    for number in targets {
        if let Some(entry) = working.line_mut(number).and_then(|l| l.entry_mut()) {
            if let Some(blocks) = claude::content_blocks_mut(entry) {
                blocks.retain(|b| !claude::is_thinking_block(b));
                if blocks.is_empty() {
                    blocks.push(json!({"type": "text", "text": "(thinking removed)"}));
                }
            }
        }
        working.reserialize(number)?;
        changes.changes.push(Change::UpdateLine {
            line: number,
            reason: "thinking blocks stripped".to_string(),
        });
    }
    Ok(())
}

/// Retarget dangling `parentUuid`s to the nearest previous known uuid in
/// file order.
fn repair_parent_uuids(
    working: &mut crate::session::Transcript,
    changes: &mut ChangeSet,
) -> Result<(), EvsError> {
    let index = claude::uuid_index(working);
    let mut repairs: Vec<(usize, Option<String>)> = Vec::new();

    for (number, entry) in working.entries() {
        let Some(parent) = claude::parent_uuid(entry) else { continue };
        if index.contains_key(parent) {
            continue;
        }
        // Nearest previous entry that has a uuid (and is not this line).
        let mut replacement: Option<String> = None;
        for (n, e) in working.entries() {
            if n >= number {
                break;
            }
            if let Some(id) = claude::uuid(e) {
                replacement = Some(id.to_string());
            }
        }
        repairs.push((number, replacement));
    }

    for (number, replacement) in repairs {
        if let Some(entry) = working.line_mut(number).and_then(|l| l.entry_mut()) {
            claude::set_parent_uuid(entry, replacement.as_deref());
        }
        working.reserialize(number)?;
        changes.changes.push(Change::UpdateLine {
            line: number,
            reason: "dangling parentUuid retargeted".to_string(),
        });
    }
    Ok(())
}

/// Collapse streamed assistant chunks: walk back from the newest assistant
/// entry through same-key assistant parents; when the chain holds thinking
/// blocks but the merged order is broken, concatenate everything into the
/// newest entry (thinking first) and mark the ancestors for removal.
fn mark_streaming_collapse(
    working: &mut crate::session::Transcript,
    marked: &mut BTreeMap<usize, String>,
    changes: &mut ChangeSet,
) -> Result<(), EvsError> {
    let index = claude::uuid_index(working);

    // Newest-first assistant entries still unvisited.
    let assistants: Vec<usize> = working
        .entries()
        .filter(|(_, e)| claude::is_assistant(e))
        .map(|(n, _)| n)
        .collect();

    let mut visited: std::collections::HashSet<usize> = std::collections::HashSet::new();

    for &newest in assistants.iter().rev() {
        if visited.contains(&newest) {
            continue;
        }
        // Chain of same-key ancestors, newest last.
        let mut chain = vec![newest];
        let mut current = newest;
        loop {
            let Some(entry) = working.entry(current) else { break };
            let Some(parent_line) = claude::parent_uuid(entry).and_then(|p| index.get(p).copied())
            else {
                break;
            };
            let Some(parent) = working.entry(parent_line) else { break };
            if !claude::is_assistant(parent) || !claude::same_merge_key(parent, entry) {
                break;
            }
            chain.push(parent_line);
            current = parent_line;
        }
        visited.extend(&chain);
        if chain.len() < 2 {
            continue;
        }
        chain.reverse(); // oldest first

        let refs: Vec<&Value> = chain.iter().filter_map(|&n| working.entry(n)).collect();
        if claude::merged_thinking_order_ok(&refs) != Some(false) {
            continue;
        }

        // Concatenate all blocks, thinking first, into the newest entry.
        let mut merged: Vec<Value> = Vec::new();
        for &n in &chain {
            if let Some(blocks) = working.entry(n).and_then(claude::content_blocks) {
                merged.extend(blocks.iter().cloned());
            }
        }
        let (thinking, rest): (Vec<Value>, Vec<Value>) =
            merged.into_iter().partition(|b| claude::is_thinking_block(b));

        let newest_line = *chain.last().ok_or_else(|| EvsError::Other("empty chain".into()))?;
        if let Some(entry) = working.line_mut(newest_line).and_then(|l| l.entry_mut()) {
            if let Some(blocks) = claude::content_blocks_mut(entry) {
                blocks.clear();
                blocks.extend(thinking);
                blocks.extend(rest);
            }
        }
        working.reserialize(newest_line)?;
        changes.changes.push(Change::UpdateLine {
            line: newest_line,
            reason: "streamed assistant chunks collapsed".to_string(),
        });
        for &n in &chain[..chain.len() - 1] {
            marked.insert(n, "streamed chunk merged into its final entry".to_string());
        }
    }
    Ok(())
}

// ── Agent-X ──────────────────────────────────────────────────────────────────

fn apply_codex(session: &Session, options: FixOptions) -> Result<Rewrite, EvsError> {
    let Session::Codex(c) = session else {
        return Err(EvsError::Other("codex fixer called on non-codex session".into()));
    };
    let mut changes = ChangeSet::default();
    let mut lines = c.transcript.lines.clone();

    if options.insert_aborted_outputs {
        let map = codex::call_map(c);
        let mut unanswered: Vec<(usize, String, String)> = Vec::new();
        for (id, calls) in &map.calls {
            if map.outputs.contains_key(id) {
                continue;
            }
            for (number, call_type) in calls {
                unanswered.push((*number, id.clone(), call_type.clone()));
            }
        }
        // WHY: inserting from the bottom up keeps every earlier call's
        // position valid while later insertions land.
        unanswered.sort_by(|a, b| b.0.cmp(&a.0));
        for (number, id, call_type) in unanswered {
            let output_type = codex::output_type_for_call(&call_type);
            let envelope = json!({
                "timestamp": crate::util::now_iso(),
                "type": "response_item",
                "payload": {
                    "type": output_type,
                    "call_id": id,
                    "output": "aborted",
                },
            });
            let raw = serde_json::to_string(&envelope)?;
            lines.insert(
                number,
                crate::jsonl::Line {
                    number: 0,
                    raw,
                    parsed: crate::jsonl::LineValue::Entry(envelope),
                },
            );
            changes.changes.push(Change::InsertAfter {
                after_line: number,
                reason: format!("synthetic aborted output for call {id}"),
            });
        }
    }
    // Renumber before the orphan scan so call-map line numbers match indices.
    for (i, line) in lines.iter_mut().enumerate() {
        line.number = i + 1;
    }

    // Orphan outputs (no matching call) are removable errors, mirroring the
    // Agent-C orphan tool_result option.
    if options.remove_orphan_tool_results {
        let working = codex::CodexSession::new(
            crate::session::Transcript { path: c.transcript.path.clone(), lines: lines.clone() },
            c.flavor,
        );
        let map = codex::call_map(&working);
        let mut to_remove: Vec<usize> = Vec::new();
        for (id, outputs) in &map.outputs {
            if !map.calls.contains_key(id) {
                to_remove.extend(outputs.iter().map(|(n, _)| *n));
            }
        }
        to_remove.sort_unstable();
        for &n in to_remove.iter().rev() {
            lines.remove(n - 1);
            changes.changes.push(Change::DeleteLine {
                line: n,
                reason: "orphan output".to_string(),
            });
        }
    }

    for (i, line) in lines.iter_mut().enumerate() {
        line.number = i + 1;
    }
    Ok(Rewrite { lines, changes })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::session::codex::testutil as ctu;
    use crate::session::testutil::*;
    use crate::validate;

    fn fix_claude(entries: &[Value], options: FixOptions) -> (Session, Rewrite) {
        let s = Session::Claude(transcript_of(entries));
        let rewrite = apply(&s, options).unwrap();
        (s, rewrite)
    }

    fn reparsed(s: &Session, rewrite: &Rewrite) -> Session {
        ops::reparse(s, &rewrite.to_text()).unwrap()
    }

    // Seed scenario 1: only the orphan result line goes, and the follower is
    // relinked past the hole.
    #[test]
    fn test_orphan_tool_result_removed_and_relinked() {
        let (s, rewrite) = fix_claude(
            &[
                user_entry("u1", None, "go"),
                assistant_entry("a1", Some("u1"), vec![tool_use_block("t1", "Bash")]),
                user_tool_result("u2", Some("a1"), "t1"),
                user_tool_result("u3", Some("u2"), "t99"),
                user_entry("u4", Some("u3"), "bye"),
            ],
            FixOptions::default(),
        );
        let fixed = reparsed(&s, &rewrite);
        assert_eq!(fixed.transcript().lines.len(), 4);
        let issues = validate::validate(&fixed);
        assert_eq!(validate::error_count(&issues), 0, "{issues:?}");
        let last = fixed.transcript().entry(4).unwrap();
        assert_eq!(claude::uuid(last), Some("u4"));
        assert_eq!(claude::parent_uuid(last), Some("u2"));
    }

    // Seed scenario 2: [text, thinking] → [thinking, text].
    #[test]
    fn test_thinking_reorder() {
        let (s, rewrite) = fix_claude(
            &[
                user_entry("u1", None, "go"),
                assistant_entry("a1", Some("u1"), vec![text_block("x"), thinking_block("t")]),
            ],
            FixOptions::default(),
        );
        let fixed = reparsed(&s, &rewrite);
        let entry = fixed.transcript().entry(2).unwrap();
        let blocks = claude::content_blocks(entry).unwrap();
        assert!(claude::is_thinking_block(&blocks[0]));
        assert_eq!(claude::block_type(&blocks[1]), Some("text"));
        assert_eq!(validate::error_count(&validate::validate(&fixed)), 0);
    }

    #[test]
    fn test_fix_is_idempotent() {
        let entries = [
            user_entry("u1", None, "go"),
            assistant_entry("a1", Some("u1"), vec![text_block("x"), thinking_block("t")]),
            user_tool_result("u2", Some("a1"), "t99"),
        ];
        let (s, rewrite) = fix_claude(&entries, FixOptions::default());
        let once = reparsed(&s, &rewrite);
        let rewrite2 = apply(&once, FixOptions::default()).unwrap();
        assert!(rewrite2.changes.is_empty(), "{:?}", rewrite2.changes);
        assert_eq!(rewrite2.to_text(), once.transcript().to_text());
    }

    #[test]
    fn test_streaming_collapse() {
        // Two chunks of one streamed response: thinking lives in the first,
        // text in the second; the merged order is fine — no collapse. Then a
        // broken variant where thinking sits in the second chunk.
        let mut c1 = assistant_entry("a1", Some("u1"), vec![text_block("part1")]);
        let mut c2 = assistant_entry("a2", Some("a1"), vec![thinking_block("late")]);
        c1["message"]["id"] = json!("msg-s");
        c2["message"]["id"] = json!("msg-s");
        let (s, rewrite) = fix_claude(
            &[user_entry("u1", None, "go"), c1, c2],
            FixOptions::default(),
        );
        let fixed = reparsed(&s, &rewrite);
        // Ancestor chunk removed, survivor holds merged content thinking-first.
        assert_eq!(fixed.transcript().lines.len(), 2);
        let merged = fixed.transcript().entry(2).unwrap();
        let blocks = claude::content_blocks(merged).unwrap();
        assert_eq!(blocks.len(), 2);
        assert!(claude::is_thinking_block(&blocks[0]));
        assert_eq!(validate::error_count(&validate::validate(&fixed)), 0);
        assert_eq!(claude::parent_uuid(merged), Some("u1"));
    }

    #[test]
    fn test_parent_repair_retargets_to_previous_uuid() {
        let (s, rewrite) = fix_claude(
            &[
                user_entry("u1", None, "one"),
                user_entry("u2", Some("missing"), "two"),
            ],
            FixOptions::default(),
        );
        let fixed = reparsed(&s, &rewrite);
        let entry = fixed.transcript().entry(2).unwrap();
        assert_eq!(claude::parent_uuid(entry), Some("u1"));
    }

    #[test]
    fn test_api_error_removal() {
        let mut err = assistant_entry("a9", Some("u1"), vec![text_block("API Error: 500")]);
        err["isApiErrorMessage"] = json!(true);
        let (s, rewrite) = fix_claude(
            &[user_entry("u1", None, "x"), err, user_entry("u2", Some("a9"), "y")],
            FixOptions::default(),
        );
        let fixed = reparsed(&s, &rewrite);
        assert_eq!(fixed.transcript().lines.len(), 2);
        let last = fixed.transcript().entry(2).unwrap();
        assert_eq!(claude::parent_uuid(last), Some("u1"));
    }

    #[test]
    fn test_strip_thinking_leaves_placeholder() {
        let opts = FixOptions { strip_thinking_blocks: true, ..FixOptions::default() };
        let (s, rewrite) = fix_claude(
            &[
                user_entry("u1", None, "x"),
                assistant_entry("a1", Some("u1"), vec![thinking_block("only")]),
            ],
            opts,
        );
        let fixed = reparsed(&s, &rewrite);
        let blocks = claude::content_blocks(fixed.transcript().entry(2).unwrap()).unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(claude::block_type(&blocks[0]), Some("text"));
    }

    #[test]
    fn test_codex_insert_aborted_outputs() {
        let s = Session::Codex(ctu::wrapped_session(&[
            ctu::session_meta("t1", "/p"),
            ctu::function_call("c1", "shell"),
        ]));
        let opts = FixOptions { insert_aborted_outputs: true, ..FixOptions::default() };
        let rewrite = apply(&s, opts).unwrap();
        let fixed = reparsed(&s, &rewrite);
        assert_eq!(fixed.transcript().lines.len(), 3);
        let inserted = fixed.transcript().entry(3).unwrap();
        assert_eq!(inserted["payload"]["type"], "function_call_output");
        assert_eq!(inserted["payload"]["output"], "aborted");
    }

    #[test]
    fn test_codex_orphan_output_removed() {
        let s = Session::Codex(ctu::wrapped_session(&[
            ctu::session_meta("t1", "/p"),
            ctu::function_output("ghost", "{}"),
            ctu::user_message("hi"),
        ]));
        let rewrite = apply(&s, FixOptions::default()).unwrap();
        let fixed = reparsed(&s, &rewrite);
        assert_eq!(fixed.transcript().lines.len(), 2);
        assert_eq!(validate::error_count(&validate::validate(&fixed)), 0);
    }
}
