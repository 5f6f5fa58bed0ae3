//! Transcript validation: every invariant violation becomes one typed issue.
//!
//! # Design philosophy
//!
//! The validator is pure over the parsed session and *never* raises — findings
//! are values, and callers decide what an error count means. Each rule has a
//! stable string code so reports and tests can match on it across versions.
//!
//! The resume-chain rule (`claude.thinking_block_order_resume_chain`) mirrors
//! the server-side check that rejects a resumed session: it reconstructs the
//! exact prompt the agent will send — visible chain, consecutive same-key
//! assistant entries merged — and checks thinking order on the merged view.
//! Its false-positive rate must stay near zero; everything it flags would be
//! a hard API error at resume time.

use serde_json::Value;

use crate::session::claude;
use crate::session::codex::{self, CodexSession, RecordKind};
use crate::session::{Session, Transcript};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// One validator finding.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Issue {
    pub severity: Severity,
    pub code: &'static str,
    pub message: String,
    /// 1-based line number the issue anchors to, when it has one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl Issue {
    fn new(severity: Severity, code: &'static str, message: String, line: Option<usize>) -> Issue {
        Issue { severity, code, message, line, details: None }
    }
}

pub fn error_count(issues: &[Issue]) -> usize {
    issues.iter().filter(|i| i.severity == Severity::Error).count()
}

pub fn validate(session: &Session) -> Vec<Issue> {
    match session {
        Session::Claude(t) => validate_claude(t),
        Session::Codex(c) => validate_codex(c),
    }
}

// ── Agent-C rules ────────────────────────────────────────────────────────────

fn validate_claude(t: &Transcript) -> Vec<Issue> {
    let mut issues = Vec::new();

    for line in t.invalid_lines() {
        issues.push(Issue::new(
            Severity::Error,
            "claude.invalid_json_line",
            format!("line {} is not valid JSON", line.number),
            Some(line.number),
        ));
    }

    check_duplicate_uuids(t, &mut issues);
    check_parent_chain(t, &mut issues);
    check_tool_pairing(t, &mut issues);
    check_thinking_order(t, &mut issues);
    check_merged_thinking_order(t, &mut issues);
    check_resume_chain(t, &mut issues);

    for (number, entry) in t.entries() {
        if claude::is_api_error(entry) {
            issues.push(Issue::new(
                Severity::Info,
                "claude.api_error_message",
                format!("line {number} is a synthetic API error message"),
                Some(number),
            ));
        }
    }

    // Tool-pair issues come out of hash maps; sort so reports are stable.
    issues.sort_by(|a, b| (a.line, a.code).cmp(&(b.line, b.code)));
    issues
}

fn check_duplicate_uuids(t: &Transcript, issues: &mut Vec<Issue>) {
    let mut seen: std::collections::HashMap<&str, usize> = std::collections::HashMap::new();
    for (number, entry) in t.entries() {
        let Some(id) = claude::uuid(entry) else { continue };
        match seen.get(id) {
            Some(first) => issues.push(Issue::new(
                Severity::Warning,
                "claude.duplicate_uuid",
                format!("uuid {id} on line {number} already used on line {first}"),
                Some(number),
            )),
            None => {
                seen.insert(id, number);
            }
        }
    }
}

fn check_parent_chain(t: &Transcript, issues: &mut Vec<Issue>) {
    let index = claude::uuid_index(t);
    for (number, entry) in t.entries() {
        if let Some(parent) = claude::parent_uuid(entry) {
            if !index.contains_key(parent) {
                issues.push(Issue::new(
                    Severity::Warning,
                    "claude.broken_parent_chain",
                    format!("line {number} parentUuid {parent} does not exist in the file"),
                    Some(number),
                ));
            }
        }
    }
}

fn check_tool_pairing(t: &Transcript, issues: &mut Vec<Issue>) {
    let map = claude::tool_id_map(t);
    for (id, result_lines) in &map.results {
        if !map.uses.contains_key(id) {
            for &number in result_lines {
                issues.push(Issue::new(
                    Severity::Error,
                    "claude.orphan_tool_result",
                    format!("tool_result {id} on line {number} has no matching tool_use"),
                    Some(number),
                ));
            }
        }
    }
    for (id, use_lines) in &map.uses {
        if !map.results.contains_key(id) {
            for &number in use_lines {
                issues.push(Issue::new(
                    Severity::Warning,
                    "claude.orphan_tool_use",
                    format!("tool_use {id} on line {number} has no matching tool_result"),
                    Some(number),
                ));
            }
        }
    }
}

fn check_thinking_order(t: &Transcript, issues: &mut Vec<Issue>) {
    for (number, entry) in t.entries() {
        if !claude::is_assistant(entry) {
            continue;
        }
        let Some(blocks) = claude::content_blocks(entry) else {
            continue;
        };
        if claude::thinking_order_ok(blocks) == Some(false) {
            issues.push(Issue::new(
                Severity::Error,
                "claude.thinking_block_order",
                format!("line {number}: assistant content has thinking blocks but does not start with one"),
                Some(number),
            ));
        }
    }
}

/// Parent→child assistant pairs sharing a merge key must also satisfy the
/// thinking-first rule after their contents are concatenated.
///
/// WHY: the server merges streamed chunks back into one message before its
/// own order check, so two individually-clean chunks can still produce a
/// rejected resume. Checking the pair here is what catches that.
fn check_merged_thinking_order(t: &Transcript, issues: &mut Vec<Issue>) {
    let index = claude::uuid_index(t);
    for (number, entry) in t.entries() {
        if !claude::is_assistant(entry) {
            continue;
        }
        let Some(parent_line) = claude::parent_uuid(entry).and_then(|p| index.get(p).copied())
        else {
            continue;
        };
        let Some(parent) = t.entry(parent_line) else { continue };
        if !claude::is_assistant(parent) || !claude::same_merge_key(parent, entry) {
            continue;
        }
        // Only report the merged violation when each chunk is individually
        // fine — otherwise the per-entry rule already covers it.
        let parent_ok = claude::content_blocks(parent)
            .map(|b| claude::thinking_order_ok(b) != Some(false))
            .unwrap_or(true);
        let child_ok = claude::content_blocks(entry)
            .map(|b| claude::thinking_order_ok(b) != Some(false))
            .unwrap_or(true);
        if !parent_ok || !child_ok {
            continue;
        }
        if claude::merged_thinking_order_ok(&[parent, entry]) == Some(false) {
            issues.push(Issue::new(
                Severity::Error,
                "claude.thinking_block_order_merged",
                format!(
                    "lines {parent_line}+{number}: merged assistant content has thinking blocks but does not start with one"
                ),
                Some(number),
            ));
        }
    }
}

/// Reconstruct the resume prompt (visible chain, consecutive same-key
/// assistant entries merged) and check thinking order on each merged message.
///
/// WHY: merging only *consecutive* chain entries, keyed by `message.id`
/// first and `requestId` second, mirrors how the agent reassembles the
/// prompt. A looser grouping (any shared key anywhere in the file) would
/// flag files the server happily accepts, and this rule must not cry wolf.
fn check_resume_chain(t: &Transcript, issues: &mut Vec<Issue>) {
    let chain = claude::visible_chain(t);
    let mut i = 0usize;
    while i < chain.len() {
        let number = chain[i];
        let Some(entry) = t.entry(number) else {
            i += 1;
            continue;
        };
        if !claude::is_assistant(entry) {
            i += 1;
            continue;
        }
        // Collect the run of consecutive assistant entries sharing this
        // entry's merge key.
        let mut group: Vec<&Value> = vec![entry];
        let mut j = i + 1;
        while j < chain.len() {
            let Some(next) = t.entry(chain[j]) else { break };
            if claude::is_assistant(next) && claude::same_merge_key(entry, next) {
                group.push(next);
                j += 1;
            } else {
                break;
            }
        }
        if claude::merged_thinking_order_ok(&group) == Some(false) {
            issues.push(Issue::new(
                Severity::Error,
                "claude.thinking_block_order_resume_chain",
                format!(
                    "resume prompt: merged assistant message at line {number} has thinking blocks but does not start with one"
                ),
                Some(number),
            ));
        }
        i = j;
    }
}

// ── Agent-X rules ────────────────────────────────────────────────────────────

fn validate_codex(session: &CodexSession) -> Vec<Issue> {
    let mut issues = Vec::new();
    let t = &session.transcript;

    for line in t.invalid_lines() {
        issues.push(Issue::new(
            Severity::Error,
            "codex.unrecognized_format",
            format!("line {} is not valid JSON", line.number),
            Some(line.number),
        ));
    }

    for (number, entry) in t.entries() {
        if session.classify(number, entry) == RecordKind::UnknownJson {
            issues.push(Issue::new(
                Severity::Warning,
                "codex.unrecognized_format",
                format!("line {number} has neither envelope nor legacy record shape"),
                Some(number),
            ));
        }
        if let Some(item) = session.item(entry) {
            if codex::has_sandbox_mode_alias(item) {
                issues.push(Issue::new(
                    Severity::Warning,
                    "codex.sandbox_policy_mode_alias",
                    format!("line {number}: sandbox_policy uses the legacy `mode` key"),
                    Some(number),
                ));
            }
        } else if codex::envelope_type(entry) == Some("turn_context") {
            if let Some(payload) = entry.get("payload") {
                if codex::has_sandbox_mode_alias(payload) {
                    issues.push(Issue::new(
                        Severity::Warning,
                        "codex.sandbox_policy_mode_alias",
                        format!("line {number}: sandbox_policy uses the legacy `mode` key"),
                        Some(number),
                    ));
                }
            }
        }
    }

    let map = codex::call_map(session);
    for (id, outputs) in &map.outputs {
        match map.calls.get(id) {
            None => {
                for (number, _) in outputs {
                    issues.push(Issue::new(
                        Severity::Error,
                        "codex.orphan_output",
                        format!("output {id} on line {number} has no matching call"),
                        Some(*number),
                    ));
                }
            }
            Some(calls) => {
                for (number, output_type) in outputs {
                    let compatible = calls
                        .iter()
                        .any(|(_, call_type)| codex::output_matches_call(call_type, output_type));
                    if !compatible {
                        issues.push(Issue::new(
                            Severity::Error,
                            "codex.orphan_output",
                            format!("output {id} on line {number} does not match its call's kind"),
                            Some(*number),
                        ));
                    }
                }
                if outputs.len() > 1 {
                    for (number, _) in &outputs[1..] {
                        issues.push(Issue::new(
                            Severity::Error,
                            "codex.duplicate_output",
                            format!("call {id} has more than one output (line {number})"),
                            Some(*number),
                        ));
                    }
                }
            }
        }
    }

    issues.sort_by(|a, b| (a.line, a.code).cmp(&(b.line, b.code)));
    issues
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::session::codex::testutil as ctu;
    use crate::session::testutil::*;

    fn codes(issues: &[Issue]) -> Vec<&'static str> {
        issues.iter().map(|i| i.code).collect()
    }

    #[test]
    fn test_clean_session_has_no_issues() {
        let t = transcript_of(&[
            user_entry("u1", None, "hello"),
            assistant_entry(
                "a1",
                Some("u1"),
                vec![thinking_block("hm"), text_block("hi"), tool_use_block("t1", "Bash")],
            ),
            user_tool_result("u2", Some("a1"), "t1"),
        ]);
        let issues = validate(&Session::Claude(t));
        assert!(issues.is_empty(), "{issues:?}");
    }

    #[test]
    fn test_orphan_tool_result_is_error() {
        let t = transcript_of(&[
            user_entry("u1", None, "hello"),
            user_tool_result("u2", Some("u1"), "t99"),
        ]);
        let issues = validate(&Session::Claude(t));
        assert!(codes(&issues).contains(&"claude.orphan_tool_result"));
        assert_eq!(error_count(&issues), 1);
    }

    #[test]
    fn test_orphan_tool_use_is_warning() {
        let t = transcript_of(&[
            user_entry("u1", None, "hello"),
            assistant_entry("a1", Some("u1"), vec![tool_use_block("t1", "Bash")]),
        ]);
        let issues = validate(&Session::Claude(t));
        assert!(codes(&issues).contains(&"claude.orphan_tool_use"));
        assert_eq!(error_count(&issues), 0);
    }

    #[test]
    fn test_thinking_order_violation() {
        let t = transcript_of(&[
            user_entry("u1", None, "hello"),
            assistant_entry("a1", Some("u1"), vec![text_block("x"), thinking_block("t")]),
        ]);
        let issues = validate(&Session::Claude(t));
        assert!(codes(&issues).contains(&"claude.thinking_block_order"));
    }

    #[test]
    fn test_merged_thinking_order_violation() {
        // Parent chunk: text only. Child chunk: thinking first (individually
        // fine). Merged: text before thinking → error.
        let mut parent = assistant_entry("a1", Some("u1"), vec![text_block("x")]);
        let mut child = assistant_entry("a2", Some("a1"), vec![thinking_block("t")]);
        parent["message"]["id"] = json!("msg-shared");
        child["message"]["id"] = json!("msg-shared");
        let t = transcript_of(&[user_entry("u1", None, "hello"), parent, child]);
        let issues = validate(&Session::Claude(t));
        assert!(codes(&issues).contains(&"claude.thinking_block_order_merged"));
        assert!(codes(&issues).contains(&"claude.thinking_block_order_resume_chain"));
    }

    #[test]
    fn test_resume_chain_ignores_messages_outside_chain() {
        // The bad assistant entry is not reachable from the leaf, so the
        // resume-chain rule stays quiet about it; the per-entry rule fires.
        let t = transcript_of(&[
            user_entry("u1", None, "hello"),
            assistant_entry("zz", Some("u-gone-branch"), vec![text_block("x"), thinking_block("t")]),
            assistant_entry("a1", Some("u1"), vec![text_block("clean")]),
        ]);
        let issues = validate(&Session::Claude(t));
        assert!(codes(&issues).contains(&"claude.thinking_block_order"));
        assert!(!codes(&issues).contains(&"claude.thinking_block_order_resume_chain"));
    }

    #[test]
    fn test_duplicate_uuid_and_broken_parent_are_warnings() {
        let t = transcript_of(&[
            user_entry("u1", None, "one"),
            user_entry("u1", None, "two"),
            user_entry("u3", Some("nope"), "three"),
        ]);
        let issues = validate(&Session::Claude(t));
        assert!(codes(&issues).contains(&"claude.duplicate_uuid"));
        assert!(codes(&issues).contains(&"claude.broken_parent_chain"));
        assert_eq!(error_count(&issues), 0);
    }

    #[test]
    fn test_api_error_is_info() {
        let mut err = assistant_entry("a1", Some("u1"), vec![text_block("API Error: 529")]);
        err["isApiErrorMessage"] = json!(true);
        let t = transcript_of(&[user_entry("u1", None, "x"), err]);
        let issues = validate(&Session::Claude(t));
        let api: Vec<_> = issues.iter().filter(|i| i.code == "claude.api_error_message").collect();
        assert_eq!(api.len(), 1);
        assert_eq!(api[0].severity, Severity::Info);
    }

    #[test]
    fn test_codex_orphan_and_duplicate_output() {
        let s = ctu::wrapped_session(&[
            ctu::session_meta("t1", "/p"),
            ctu::function_call("c1", "shell"),
            ctu::function_output("c1", "{}"),
            ctu::function_output("c1", "{}"),
            ctu::function_output("c9", "{}"),
        ]);
        let issues = validate(&Session::Codex(s));
        assert!(codes(&issues).contains(&"codex.duplicate_output"));
        assert!(codes(&issues).contains(&"codex.orphan_output"));
    }

    #[test]
    fn test_codex_kind_mismatch_is_orphan() {
        let call = ctu::envelope(
            "response_item",
            json!({"type": "custom_tool_call", "call_id": "c1", "name": "x", "input": ""}),
        );
        let s = ctu::wrapped_session(&[
            ctu::session_meta("t1", "/p"),
            call,
            ctu::function_output("c1", "{}"),
        ]);
        let issues = validate(&Session::Codex(s));
        assert!(codes(&issues).contains(&"codex.orphan_output"));
    }

    #[test]
    fn test_codex_sandbox_alias() {
        let tc = ctu::envelope("turn_context", json!({"sandbox_policy": {"mode": "read-only"}}));
        let s = ctu::wrapped_session(&[ctu::session_meta("t1", "/p"), tc]);
        let issues = validate(&Session::Codex(s));
        assert!(codes(&issues).contains(&"codex.sandbox_policy_mode_alias"));
    }
}
