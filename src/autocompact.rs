//! The auto-compact engine: decide and enqueue, never mutate.
//!
//! # Design philosophy
//!
//! This engine runs while the agent is live, so it must not touch the
//! transcript. Its entire output is a pending-compact record (the store in
//! `pending`) plus one audit line in the session log. Applying a ready plan
//! is the supervisor's job, at the only safe boundary — child stopped.
//!
//! Every run emits exactly one log line with a `result` of `not_triggered`,
//! `busy`, `already_ready`, `ready`, or `failed`. Errors between `running`
//! and `ready` become a `failed` record; the engine itself never crashes the
//! enclosing process over them.

use std::time::Duration;

use serde_json::json;

use crate::error::EvsError;
use crate::jsonl::{self, SourceFingerprint};
use crate::paths::EvsPaths;
use crate::pending::{AmountMode, PendingCompact, PendingSelection, PendingStore};
use crate::session::Session;
use crate::summarize::Summarizer;
use crate::tokens;
use crate::util::{Amount, Threshold};

pub const DEFAULT_CONTEXT_WINDOW: u64 = 200_000;
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Clone)]
pub struct AutoCompactConfig {
    pub threshold: Threshold,
    pub amount: Amount,
    pub amount_raw: String,
    pub context_window: u64,
    pub model: String,
    pub busy_timeout: Duration,
}

impl Default for AutoCompactConfig {
    fn default() -> Self {
        AutoCompactConfig {
            threshold: Threshold::Percent(80),
            amount: Amount::Percent(50),
            amount_raw: "50%".to_string(),
            context_window: DEFAULT_CONTEXT_WINDOW,
            model: "claude-haiku-4-5".to_string(),
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
        }
    }
}

/// What one engine run decided, mirrored into the session log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    NotTriggered { threshold: u64, tokens: u64 },
    Busy,
    AlreadyReady,
    Ready { tokens: u64, remove_count: usize },
    Failed { error: String },
}

impl Outcome {
    pub fn result(&self) -> &'static str {
        match self {
            Outcome::NotTriggered { .. } => "not_triggered",
            Outcome::Busy => "busy",
            Outcome::AlreadyReady => "already_ready",
            Outcome::Ready { .. } => "ready",
            Outcome::Failed { .. } => "failed",
        }
    }
}

/// Check the threshold and, when crossed, produce a ready-to-apply plan.
pub fn run(
    session: &Session,
    paths: &EvsPaths,
    config: &AutoCompactConfig,
    summarizer: &dyn Summarizer,
) -> Result<Outcome, EvsError> {
    let session_id = session
        .session_id()
        .ok_or_else(|| EvsError::Other("session has no id".into()))?;
    let store = PendingStore::open(paths, &session_id, session.agent());

    let current_tokens = tokens::total_tokens(session);
    let threshold = config.threshold.resolve(config.context_window);
    write_state(paths, &session_id, current_tokens)?;

    if current_tokens < threshold {
        let outcome = Outcome::NotTriggered { threshold, tokens: current_tokens };
        log_outcome(paths, &session_id, &outcome, config)?;
        return Ok(outcome);
    }

    let transcript_path = session.transcript().path.clone();
    match store.load()? {
        Some(existing) if existing.status == crate::pending::PendingStatus::Running => {
            // WHY: a `running` record is only a claim, not a lock — the job
            // that wrote it may have been killed mid-summary. Past the busy
            // timeout the claim is treated as abandoned and replaced;
            // without that, one crash would block auto-compact forever.
            if !existing.running_timed_out(config.busy_timeout) {
                let outcome = Outcome::Busy;
                log_outcome(paths, &session_id, &outcome, config)?;
                return Ok(outcome);
            }
        }
        Some(existing) if existing.status == crate::pending::PendingStatus::Ready => {
            let current = match &transcript_path {
                Some(p) => SourceFingerprint::capture(p)?,
                None => SourceFingerprint::default(),
            };
            if existing.is_applicable(&current) {
                let outcome = Outcome::AlreadyReady;
                log_outcome(paths, &session_id, &outcome, config)?;
                return Ok(outcome);
            }
            // Ready but stale: replace with a fresh plan.
        }
        _ => {}
    }

    let amount_mode = if config.amount.is_token_based() {
        AmountMode::Tokens
    } else {
        AmountMode::Messages
    };
    let running = PendingCompact::running(
        &session_id,
        threshold,
        current_tokens,
        amount_mode,
        &config.amount_raw,
    );
    store.save(&running)?;

    match build_plan(session, config, summarizer, &transcript_path) {
        Ok((summary, selection, source)) => {
            let remove_count = selection.remove_count;
            let mut ready = running.into_ready(summary, selection, source);
            ready.model = Some(config.model.clone());
            store.save(&ready)?;
            let outcome = Outcome::Ready { tokens: current_tokens, remove_count };
            log_outcome(paths, &session_id, &outcome, config)?;
            Ok(outcome)
        }
        Err(e) => {
            let message = e.to_string();
            store.save(&running.into_failed(message.clone()))?;
            let outcome = Outcome::Failed { error: message };
            log_outcome(paths, &session_id, &outcome, config)?;
            Ok(outcome)
        }
    }
}

/// Summarize the would-be-removed prefix and record the selection, without
/// touching the transcript.
fn build_plan(
    session: &Session,
    config: &AutoCompactConfig,
    summarizer: &dyn Summarizer,
    transcript_path: &Option<std::path::PathBuf>,
) -> Result<(String, PendingSelection, SourceFingerprint), EvsError> {
    // WHY: fingerprint before the (slow) summary call, not after — any
    // write that lands while we summarize makes the plan stale, which is
    // exactly right: the summary no longer describes the file.
    let source = match transcript_path {
        Some(p) => SourceFingerprint::capture(p)?,
        None => return Err(EvsError::Other("session has no backing file".into())),
    };

    let visible = tokens::visible_message_tokens(session);
    let remove_count =
        crate::ops::remove::resolve_remove_count(&visible, config.amount, false);
    if remove_count == 0 {
        return Err(EvsError::Other(
            "threshold crossed but the removal amount resolves to zero messages".into(),
        ));
    }

    let removed: Vec<&tokens::MessageTokens> = visible.iter().take(remove_count).collect();
    let texts: Vec<String> = match session {
        Session::Claude(t) => removed
            .iter()
            .filter_map(|m| t.entry(m.line))
            .map(tokens::claude_resume_text)
            .collect(),
        Session::Codex(c) => removed
            .iter()
            .filter_map(|m| c.transcript.entry(m.line))
            .filter_map(|e| e.get("payload"))
            .filter_map(|p| serde_json::to_string(p).ok())
            .collect(),
    };

    let summary = summarizer.summarize(&texts, &config.model, 2000)?;

    let selection = PendingSelection {
        remove_count,
        first_removed_line: removed.first().map(|m| m.line),
        last_removed_line: removed.last().map(|m| m.line),
        anchor_line: visible.first().map(|m| m.line),
    };
    Ok((summary.text, selection, source))
}

/// One line into `<session-dir>/log.jsonl`, schema per the wire format.
fn log_outcome(
    paths: &EvsPaths,
    session_id: &str,
    outcome: &Outcome,
    config: &AutoCompactConfig,
) -> Result<(), EvsError> {
    let mut entry = json!({
        "ts": crate::util::now_iso(),
        "result": outcome.result(),
        "amount": config.amount_raw,
    });
    match outcome {
        Outcome::NotTriggered { threshold, tokens } => {
            entry["threshold"] = json!(threshold);
            entry["tokens"] = json!(tokens);
        }
        Outcome::Ready { tokens, .. } => {
            entry["threshold"] = json!(config.threshold.resolve(config.context_window));
            entry["tokens"] = json!(tokens);
        }
        Outcome::Failed { error } => {
            entry["error"] = json!(error);
        }
        Outcome::Busy | Outcome::AlreadyReady => {}
    }
    jsonl::append_jsonl(&paths.session_log(session_id), &entry)
}

/// Record the latest known token count in `state.json`.
fn write_state(paths: &EvsPaths, session_id: &str, tokens: u64) -> Result<(), EvsError> {
    let path = paths.session_state(session_id);
    let mut state = std::fs::read_to_string(&path)
        .ok()
        .and_then(|c| serde_json::from_str::<serde_json::Value>(&c).ok())
        .unwrap_or_else(|| json!({}));
    state["tokens"] = json!(tokens);
    state["updatedAt"] = json!(crate::util::now_iso());
    jsonl::write_json_atomic(&path, &state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pending::PendingStatus;
    use crate::session::testutil::*;
    use crate::summarize::FixedSummarizer;

    struct FailingSummarizer;
    impl Summarizer for FailingSummarizer {
        fn summarize(
            &self,
            _messages: &[String],
            _model: &str,
            _target: u64,
        ) -> Result<crate::summarize::Summary, EvsError> {
            Err(EvsError::Other("no model available".into()))
        }
    }

    fn session_on_disk(dir: &tempfile::TempDir, messages: usize) -> Session {
        let mut entries = vec![user_entry("u0", None, &"m".repeat(400))];
        for i in 1..messages {
            entries.push(user_entry(
                &format!("u{i}"),
                Some(&format!("u{}", i - 1)),
                &"m".repeat(400),
            ));
        }
        let text: String = entries.iter().map(|e| format!("{e}\n")).collect();
        let path = dir.path().join("s.jsonl");
        std::fs::write(&path, text).unwrap();
        Session::load(&path).unwrap()
    }

    fn config(threshold_tokens: u64) -> AutoCompactConfig {
        AutoCompactConfig {
            threshold: Threshold::Tokens(threshold_tokens),
            amount: Amount::Percent(50),
            amount_raw: "50%".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_below_threshold_not_triggered() {
        let dir = tempfile::TempDir::new().unwrap();
        let paths = EvsPaths::at(dir.path().join("evs"));
        let session = session_on_disk(&dir, 4);

        let outcome = run(&session, &paths, &config(1_000_000), &FixedSummarizer("s".into()))
            .unwrap();
        assert!(matches!(outcome, Outcome::NotTriggered { .. }));

        // No plan, but a log line and a state file.
        let store = PendingStore::open(&paths, "sess-1", crate::session::Agent::Claude);
        assert!(store.load().unwrap().is_none());
        let log = std::fs::read_to_string(paths.session_log("sess-1")).unwrap();
        assert!(log.contains("\"not_triggered\""));
        assert!(paths.session_state("sess-1").exists());
    }

    #[test]
    fn test_crossed_threshold_produces_ready_plan() {
        let dir = tempfile::TempDir::new().unwrap();
        let paths = EvsPaths::at(dir.path().join("evs"));
        let session = session_on_disk(&dir, 6);

        let outcome = run(&session, &paths, &config(10), &FixedSummarizer("S".into())).unwrap();
        let Outcome::Ready { remove_count, .. } = outcome else {
            panic!("expected ready, got {outcome:?}");
        };
        assert_eq!(remove_count, 3);

        let store = PendingStore::open(&paths, "sess-1", crate::session::Agent::Claude);
        let plan = store.load().unwrap().unwrap();
        assert_eq!(plan.status, PendingStatus::Ready);
        assert_eq!(plan.summary.as_deref(), Some("S"));
        assert_eq!(plan.selection.remove_count, 3);
        assert!(plan.source.size.is_some());
        let log = std::fs::read_to_string(paths.session_log("sess-1")).unwrap();
        assert!(log.contains("\"ready\""));
    }

    #[test]
    fn test_second_run_reports_already_ready() {
        let dir = tempfile::TempDir::new().unwrap();
        let paths = EvsPaths::at(dir.path().join("evs"));
        let session = session_on_disk(&dir, 6);

        run(&session, &paths, &config(10), &FixedSummarizer("S".into())).unwrap();
        let outcome = run(&session, &paths, &config(10), &FixedSummarizer("S2".into())).unwrap();
        assert_eq!(outcome, Outcome::AlreadyReady);

        // The original plan was not replaced.
        let store = PendingStore::open(&paths, "sess-1", crate::session::Agent::Claude);
        assert_eq!(store.load().unwrap().unwrap().summary.as_deref(), Some("S"));
    }

    #[test]
    fn test_running_record_reports_busy() {
        let dir = tempfile::TempDir::new().unwrap();
        let paths = EvsPaths::at(dir.path().join("evs"));
        let session = session_on_disk(&dir, 6);

        let store = PendingStore::open(&paths, "sess-1", crate::session::Agent::Claude);
        store
            .save(&PendingCompact::running("sess-1", 10, 999, AmountMode::Messages, "50%"))
            .unwrap();

        let outcome = run(&session, &paths, &config(10), &FixedSummarizer("S".into())).unwrap();
        assert_eq!(outcome, Outcome::Busy);
    }

    #[test]
    fn test_stale_running_record_is_replaced() {
        let dir = tempfile::TempDir::new().unwrap();
        let paths = EvsPaths::at(dir.path().join("evs"));
        let session = session_on_disk(&dir, 6);

        let store = PendingStore::open(&paths, "sess-1", crate::session::Agent::Claude);
        let mut stuck = PendingCompact::running("sess-1", 10, 999, AmountMode::Messages, "50%");
        stuck.created_at = "2020-01-01T00:00:00.000Z".to_string();
        store.save(&stuck).unwrap();

        let outcome = run(&session, &paths, &config(10), &FixedSummarizer("S".into())).unwrap();
        assert!(matches!(outcome, Outcome::Ready { .. }));
    }

    #[test]
    fn test_summarizer_failure_becomes_failed_record() {
        let dir = tempfile::TempDir::new().unwrap();
        let paths = EvsPaths::at(dir.path().join("evs"));
        let session = session_on_disk(&dir, 6);

        let outcome = run(&session, &paths, &config(10), &FailingSummarizer).unwrap();
        assert!(matches!(outcome, Outcome::Failed { .. }));

        let store = PendingStore::open(&paths, "sess-1", crate::session::Agent::Claude);
        let plan = store.load().unwrap().unwrap();
        assert_eq!(plan.status, PendingStatus::Failed);
        assert!(plan.error.as_deref().unwrap().contains("no model"));
        let log = std::fs::read_to_string(paths.session_log("sess-1")).unwrap();
        assert!(log.contains("\"failed\""));
    }
}
