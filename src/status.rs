//! One-line session status for embedding in a prompt or status bar.
//!
//! Reads only the out-of-band files (`state.json`, `log.jsonl`) so it never
//! has to parse the transcript on the hot path.

use serde_json::Value;

use crate::error::EvsError;
use crate::jsonl;
use crate::paths::EvsPaths;

/// `"142k"`-style token display.
fn format_tokens(tokens: u64) -> String {
    if tokens >= 10_000 {
        format!("{}k", tokens / 1000)
    } else {
        tokens.to_string()
    }
}

/// Render the status line for a session, e.g.
/// `evs sess-1: 142k tokens · auto-compact ready (50%)`.
pub fn render_status_line(paths: &EvsPaths, session_id: &str) -> Result<String, EvsError> {
    let mut parts: Vec<String> = vec![format!("evs {session_id}")];

    let state_path = paths.session_state(session_id);
    if let Ok(content) = std::fs::read_to_string(&state_path) {
        if let Ok(state) = serde_json::from_str::<Value>(&content) {
            if let Some(tokens) = state.get("tokens").and_then(|t| t.as_u64()) {
                parts.push(format!("{} tokens", format_tokens(tokens)));
            }
            if state.get("pendingReload").and_then(|p| p.as_bool()) == Some(true) {
                parts.push("reload pending".to_string());
            }
        }
    }

    if let Some(last) = last_log_entry(paths, session_id)? {
        let result = last.get("result").and_then(|r| r.as_str()).unwrap_or("?");
        match result {
            "not_triggered" => {}
            "ready" => {
                let amount = last.get("amount").and_then(|a| a.as_str()).unwrap_or("");
                parts.push(format!("auto-compact ready ({amount})"));
            }
            "applied" => {
                let after = last
                    .get("tokensAfter")
                    .and_then(|t| t.as_u64())
                    .map(|t| format!(" → {}", format_tokens(t)))
                    .unwrap_or_default();
                parts.push(format!("compacted{after}"));
            }
            "failed" => parts.push("auto-compact failed".to_string()),
            other => parts.push(format!("auto-compact {other}")),
        }
    }

    Ok(parts.join(" · "))
}

fn last_log_entry(paths: &EvsPaths, session_id: &str) -> Result<Option<Value>, EvsError> {
    let path = paths.session_log(session_id);
    if !path.exists() {
        return Ok(None);
    }
    let tail = jsonl::read_tail(&path, 1)?;
    Ok(tail.into_iter().filter_map(|l| match l.parsed {
        jsonl::LineValue::Entry(v) => Some(v),
        _ => None,
    }).next())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_status_without_state_is_bare() {
        let dir = tempfile::TempDir::new().unwrap();
        let paths = EvsPaths::at(dir.path());
        let line = render_status_line(&paths, "s1").unwrap();
        assert_eq!(line, "evs s1");
    }

    #[test]
    fn test_status_shows_tokens_and_last_result() {
        let dir = tempfile::TempDir::new().unwrap();
        let paths = EvsPaths::at(dir.path());
        jsonl::write_json_atomic(
            &paths.session_state("s1"),
            &json!({"tokens": 142_300, "updatedAt": "t"}),
        )
        .unwrap();
        jsonl::append_jsonl(
            &paths.session_log("s1"),
            &json!({"ts": "t", "result": "ready", "amount": "50%"}),
        )
        .unwrap();

        let line = render_status_line(&paths, "s1").unwrap();
        assert_eq!(line, "evs s1 · 142k tokens · auto-compact ready (50%)");
    }

    #[test]
    fn test_status_applied_shows_tokens_after() {
        let dir = tempfile::TempDir::new().unwrap();
        let paths = EvsPaths::at(dir.path());
        jsonl::append_jsonl(
            &paths.session_log("s1"),
            &json!({"ts": "t", "result": "applied", "tokensAfter": 61_000}),
        )
        .unwrap();
        let line = render_status_line(&paths, "s1").unwrap();
        assert!(line.contains("compacted → 61k"));
    }

    #[test]
    fn test_status_not_triggered_stays_quiet() {
        let dir = tempfile::TempDir::new().unwrap();
        let paths = EvsPaths::at(dir.path());
        jsonl::append_jsonl(
            &paths.session_log("s1"),
            &json!({"ts": "t", "result": "not_triggered", "tokens": 10}),
        )
        .unwrap();
        assert_eq!(render_status_line(&paths, "s1").unwrap(), "evs s1");
    }
}
