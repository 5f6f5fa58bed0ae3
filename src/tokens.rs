//! Token accounting: reconstruct what the agent will re-present at resume
//! and plan prefix removals against a token budget.
//!
//! # Counting model
//!
//! Agent-C concatenates, per visible message: each `text` block (with a
//! trailing newline when absent), `[tool: <name>]` plus the JSON of the
//! input for each `tool_use`, and the stringified content of each
//! `tool_result`. Thinking blocks are not re-presented and are not counted.
//!
//! Agent-X counts each envelope payload as its serialized bytes.
//!
//! Token counts are estimated at one token per four bytes of UTF-8. What the
//! planner cares about is the *relative* weight of each message, which the
//! byte ratio preserves; its contract (tie-breaking, monotonicity, caps) is
//! independent of the estimator's absolute accuracy.

use serde_json::Value;

use crate::session::{Session, claude, codex};

/// Tokens attributed to one visible message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageTokens {
    pub line: usize,
    pub tokens: u64,
}

/// ceil(bytes / 4)
pub fn estimate_tokens(bytes: usize) -> u64 {
    (bytes as u64).div_ceil(4)
}

/// Per-visible-message token counts, in chronological order.
pub fn visible_message_tokens(session: &Session) -> Vec<MessageTokens> {
    match session {
        Session::Claude(t) => claude::visible_chain(t)
            .into_iter()
            .filter_map(|line| {
                let entry = t.entry(line)?;
                Some(MessageTokens {
                    line,
                    tokens: estimate_tokens(claude_resume_text(entry).len()),
                })
            })
            .collect(),
        Session::Codex(c) => c
            .transcript
            .entries()
            .filter(|(n, e)| match c.flavor {
                codex::CodexFlavor::Wrapped => {
                    codex::envelope_type(e).is_some_and(|t| t != "session_meta")
                }
                // The legacy meta object is line one; everything after is a
                // response item.
                codex::CodexFlavor::Legacy => {
                    *n != c.transcript.entries().next().map(|(f, _)| f).unwrap_or(0)
                }
            })
            .map(|(line, e)| {
                let payload = e.get("payload").unwrap_or(e);
                let bytes = serde_json::to_string(payload).map(|s| s.len()).unwrap_or(0);
                MessageTokens { line, tokens: estimate_tokens(bytes) }
            })
            .collect(),
    }
}

pub fn total_tokens(session: &Session) -> u64 {
    visible_message_tokens(session).iter().map(|m| m.tokens).sum()
}

/// The exact text the agent re-presents for one Agent-C entry.
///
/// WHY: thinking blocks are skipped because the agent does not replay them
/// at resume — counting them would overestimate old assistant turns and
/// make the planner remove too little.
pub fn claude_resume_text(entry: &Value) -> String {
    let mut out = String::new();
    match claude::content(entry) {
        Some(Value::String(s)) => {
            out.push_str(s);
            if !s.ends_with('\n') {
                out.push('\n');
            }
        }
        Some(Value::Array(blocks)) => {
            for block in blocks {
                match claude::block_type(block) {
                    Some("text") => {
                        let text = block.get("text").and_then(|t| t.as_str()).unwrap_or("");
                        out.push_str(text);
                        if !text.ends_with('\n') {
                            out.push('\n');
                        }
                    }
                    Some("tool_use") => {
                        let name = block.get("name").and_then(|n| n.as_str()).unwrap_or("");
                        out.push_str(&format!("[tool: {name}]\n"));
                        if let Some(input) = block.get("input") {
                            if let Ok(json) = serde_json::to_string(input) {
                                out.push_str(&json);
                            }
                        }
                    }
                    Some("tool_result") => {
                        match block.get("content") {
                            Some(Value::String(s)) => out.push_str(s),
                            Some(other) => {
                                if let Ok(json) = serde_json::to_string(other) {
                                    out.push_str(&json);
                                }
                            }
                            None => {}
                        }
                    }
                    _ => {}
                }
            }
        }
        _ => {}
    }
    out
}

// ── Prefix removal planner ───────────────────────────────────────────────────

/// Removal target, already reduced to tokens or percent-of-total.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanAmount {
    Tokens(u64),
    PercentTokens(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct RemovalPlan {
    #[serde(rename = "removeCount")]
    pub remove_count: usize,
    #[serde(rename = "maxRemovableCount")]
    pub max_removable_count: usize,
    #[serde(rename = "totalTokens")]
    pub total_tokens: u64,
    #[serde(rename = "targetRemoveTokens")]
    pub target_remove_tokens: u64,
    #[serde(rename = "selectedRemoveTokens")]
    pub selected_remove_tokens: u64,
}

/// Choose how many oldest messages to drop to free `amount` tokens.
///
/// Deterministic: the sum stops at the first index where it meets or exceeds
/// the target, so ties prefer fewer messages. `keep_last_messages` caps how
/// deep the removal may reach.
pub fn plan_prefix_removal(
    tokens_per_message: &[u64],
    amount: PlanAmount,
    keep_last_messages: Option<usize>,
) -> RemovalPlan {
    let n = tokens_per_message.len();
    let total: u64 = tokens_per_message.iter().sum();
    let target = match amount {
        PlanAmount::Tokens(t) => t,
        PlanAmount::PercentTokens(p) => total * u64::from(p) / 100,
    };
    let max_removable = match keep_last_messages {
        Some(keep) => n.saturating_sub(keep),
        None => n,
    };

    let mut selected = 0u64;
    let mut count = 0usize;
    for &tokens in tokens_per_message.iter().take(max_removable) {
        if selected >= target {
            break;
        }
        selected += tokens;
        count += 1;
    }
    // EDGE: a zero target removes nothing, whatever the loop counted —
    // "compact 0" must be the identity, not "remove one message because the
    // running sum started at 0 >= 0".
    if target == 0 {
        selected = 0;
        count = 0;
    }

    RemovalPlan {
        remove_count: count,
        max_removable_count: max_removable,
        total_tokens: total,
        target_remove_tokens: target,
        selected_remove_tokens: selected,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::session::testutil::*;

    #[test]
    fn test_resume_text_string_content() {
        let e = user_entry("u1", None, "hello");
        assert_eq!(claude_resume_text(&e), "hello\n");
    }

    #[test]
    fn test_resume_text_blocks() {
        let e = assistant_entry(
            "a1",
            None,
            vec![
                thinking_block("never counted"),
                text_block("answer"),
                tool_use_block("t1", "Bash"),
            ],
        );
        let text = claude_resume_text(&e);
        assert!(text.starts_with("answer\n"));
        assert!(text.contains("[tool: Bash]\n"));
        assert!(text.contains("\"cmd\":\"ls\""));
        assert!(!text.contains("never counted"));
    }

    #[test]
    fn test_resume_text_tool_result_content_forms() {
        let string_result = user_tool_result("u1", None, "t1");
        assert_eq!(claude_resume_text(&string_result), "ok");

        let mut structured = user_tool_result("u2", None, "t2");
        structured["message"]["content"][0]["content"] =
            json!([{"type": "text", "text": "listing"}]);
        assert!(claude_resume_text(&structured).contains("listing"));
    }

    #[test]
    fn test_estimate_tokens_rounds_up() {
        assert_eq!(estimate_tokens(0), 0);
        assert_eq!(estimate_tokens(1), 1);
        assert_eq!(estimate_tokens(4), 1);
        assert_eq!(estimate_tokens(5), 2);
    }

    #[test]
    fn test_visible_tokens_follow_chain_order() {
        let s = crate::session::Session::Claude(transcript_of(&[
            user_entry("u1", None, "aaaa"),
            assistant_entry("a1", Some("u1"), vec![text_block("bbbbbbbb")]),
            user_entry("u2", Some("a1"), "cc"),
        ]));
        let tokens = visible_message_tokens(&s);
        assert_eq!(tokens.len(), 3);
        assert_eq!(tokens[0].line, 1);
        assert!(tokens[1].tokens > tokens[2].tokens);
    }

    // Planner scenario from the seed suite: tokens [100,100,50,50,1000],
    // target 150 → remove 2 messages totalling 200.
    #[test]
    fn test_planner_seed_scenario() {
        let plan = plan_prefix_removal(&[100, 100, 50, 50, 1000], PlanAmount::Tokens(150), None);
        assert_eq!(plan.remove_count, 2);
        assert_eq!(plan.selected_remove_tokens, 200);
        assert_eq!(plan.target_remove_tokens, 150);
        assert_eq!(plan.total_tokens, 1300);
    }

    #[test]
    fn test_planner_percent() {
        let plan =
            plan_prefix_removal(&[100, 100, 100, 100], PlanAmount::PercentTokens(50), None);
        assert_eq!(plan.target_remove_tokens, 200);
        assert_eq!(plan.remove_count, 2);
    }

    #[test]
    fn test_planner_keep_last_caps_removal() {
        let plan = plan_prefix_removal(
            &[100, 100, 100, 100],
            PlanAmount::Tokens(1000),
            Some(3),
        );
        assert_eq!(plan.max_removable_count, 1);
        assert_eq!(plan.remove_count, 1);
        assert_eq!(plan.selected_remove_tokens, 100);
    }

    #[test]
    fn test_planner_zero_target() {
        let plan = plan_prefix_removal(&[10, 20], PlanAmount::Tokens(0), None);
        assert_eq!(plan.remove_count, 0);
        assert_eq!(plan.selected_remove_tokens, 0);
    }

    #[test]
    fn test_planner_monotone_in_target() {
        let tokens = [40, 10, 250, 3, 77, 500, 1];
        let mut last = 0usize;
        for target in [0u64, 10, 50, 100, 300, 500, 881, 2000] {
            let plan = plan_prefix_removal(&tokens, PlanAmount::Tokens(target), None);
            assert!(plan.remove_count >= last, "not monotone at target {target}");
            last = plan.remove_count;
        }
    }
}
