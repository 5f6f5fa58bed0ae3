//! Session discovery: find the "current" transcript for a working
//! directory.
//!
//! # Architecture overview
//!
//! Discovery answers one question per agent:
//!
//! - **Agent-C** stores transcripts under
//!   `~/.claude/projects/<mangled-cwd>/<session-id>.jsonl`, where the
//!   mangling has two historical spellings. Candidates are scored and the
//!   winner is returned with a confidence grade.
//! - **Agent-X** stores rollouts under
//!   `~/.codex/sessions/YYYY/MM/DD/rollout-<ts>-<id>.jsonl`. The scan walks
//!   the last `lookback_days` of the date tree and matches on the recorded
//!   `cwd`. The out-of-band cwd→thread-id state file (maintained by the
//!   notify hook) overrides the scan when it has an entry.
//!
//! # Scoring (Agent-C)
//!
//! | signal | points |
//! |---|---|
//! | file lives in the cwd's project dir | +100 |
//! | head `sessionId` matches the filename | +30 |
//! | head/tail references the target cwd | +20 |
//! | format detector agrees | +20 |
//! | malformed JSON in the sample | −50 |
//!
//! Ties break by the newest tail timestamp, then mtime. Files with no user
//! or assistant entry in either head or tail are rejected outright —
//! summary-only and snapshot-only files are not resumable sessions.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::{Value, json};
use walkdir::WalkDir;

use crate::detect::{self, Format};
use crate::error::EvsError;
use crate::jsonl;
use crate::paths::{self, EvsPaths};
use crate::session::Agent;

const HEAD_SAMPLE: usize = 10;
const TAIL_SAMPLE: usize = 10;
/// Score (and seconds-of-recency) gap above the runner-up that makes a
/// verdict high-confidence.
const SAFE_SCORE_MARGIN: i64 = 30;
const SAFE_RECENCY_MARGIN_SECS: i64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscoveryConfidence {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone)]
pub struct Candidate {
    pub path: PathBuf,
    pub agent: Agent,
    pub score: i64,
    pub session_id: Option<String>,
    /// Newest timestamp seen in the tail, for tie-breaking.
    pub last_timestamp: Option<DateTime<Utc>>,
    pub mtime: Option<std::time::SystemTime>,
}

#[derive(Debug, Clone)]
pub struct Discovery {
    pub candidate: Candidate,
    pub confidence: DiscoveryConfidence,
    pub runner_up_count: usize,
}

#[derive(Debug, Clone)]
pub struct DiscoverOptions {
    pub home: PathBuf,
    pub lookback_days: u32,
    /// When nothing matches the cwd, fall back to the most recent session.
    pub fallback: bool,
}

impl Default for DiscoverOptions {
    fn default() -> Self {
        DiscoverOptions {
            home: dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")),
            lookback_days: 14,
            fallback: true,
        }
    }
}

// ── Agent-C ──────────────────────────────────────────────────────────────────

pub fn discover_claude(cwd: &str, options: &DiscoverOptions) -> Result<Option<Discovery>, EvsError> {
    let projects = paths::claude_projects_root(&options.home);

    // Both historical spellings of the project directory.
    let mut project_files: Vec<PathBuf> = Vec::new();
    for dir_name in paths::claude_cwd_dir_names(cwd) {
        let dir = projects.join(dir_name);
        if dir.is_dir() {
            collect_jsonl(&dir, &mut project_files);
        }
    }

    let mut candidates: Vec<Candidate> = Vec::new();
    for path in &project_files {
        if let Some(c) = score_claude_candidate(path, cwd, true)? {
            candidates.push(c);
        }
    }

    // No project dir hit: optionally scan every project for a cwd mention.
    if candidates.is_empty() && options.fallback && projects.is_dir() {
        let mut all_files = Vec::new();
        collect_jsonl(&projects, &mut all_files);
        for path in &all_files {
            if let Some(c) = score_claude_candidate(path, cwd, false)? {
                // WHY: detector agreement alone (+20) is not a match — every
                // healthy transcript in every project scores that. The 40
                // floor demands an actual cwd reference on top, so fallback
                // never resumes some other project's session.
                if c.score >= 40 {
                    candidates.push(c);
                }
            }
        }
        if let Some(best) = rank(&mut candidates) {
            return Ok(Some(Discovery {
                confidence: DiscoveryConfidence::Low,
                runner_up_count: candidates.len().saturating_sub(1),
                candidate: best,
            }));
        }
        return Ok(None);
    }

    let total = candidates.len();
    let Some(best) = rank(&mut candidates) else {
        return Ok(None);
    };
    // `rank` sorted in place, so the runner-up sits right behind the winner.
    let runner_up = candidates.get(1).cloned();
    let confidence = grade(&best, runner_up.as_ref());
    Ok(Some(Discovery {
        candidate: best,
        confidence,
        runner_up_count: total.saturating_sub(1),
    }))
}

fn score_claude_candidate(
    path: &Path,
    cwd: &str,
    in_project_dir: bool,
) -> Result<Option<Candidate>, EvsError> {
    let size = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
    let (head, malformed) = jsonl::read_head(path, HEAD_SAMPLE)?;
    let tail = jsonl::read_tail(path, TAIL_SAMPLE)?;
    let tail_entries: Vec<&Value> = tail.iter().filter_map(|l| l.entry()).collect();

    // Summary-only / snapshot-only files are not resumable sessions.
    if size > 0 {
        let has_conversation = head
            .iter()
            .chain(tail_entries.iter().copied())
            .any(|e| matches!(e.get("type").and_then(|t| t.as_str()), Some("user") | Some("assistant")));
        if !has_conversation {
            return Ok(None);
        }
    }

    let mut score: i64 = 0;
    if in_project_dir {
        score += 100;
    }

    let file_stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("");
    let session_id = head
        .iter()
        .find_map(|e| e.get("sessionId").and_then(|s| s.as_str()))
        .map(String::from);
    if session_id.as_deref() == Some(file_stem) {
        score += 30;
    }

    let mentions_cwd = head
        .iter()
        .chain(tail_entries.iter().copied())
        .any(|e| e.get("cwd").and_then(|c| c.as_str()) == Some(cwd));
    if mentions_cwd {
        score += 20;
    }

    if detect::detect_objects(&head, malformed).format == Format::Claude {
        score += 20;
    }
    if malformed > 0 {
        score -= 50;
    }

    let last_timestamp = tail_entries
        .iter()
        .rev()
        .find_map(|e| e.get("timestamp").and_then(|t| t.as_str()))
        .and_then(|t| t.parse::<DateTime<Utc>>().ok());

    Ok(Some(Candidate {
        path: path.to_path_buf(),
        agent: Agent::Claude,
        score,
        session_id,
        last_timestamp,
        mtime: std::fs::metadata(path).and_then(|m| m.modified()).ok(),
    }))
}

fn collect_jsonl(dir: &Path, out: &mut Vec<PathBuf>) {
    for entry in WalkDir::new(dir).into_iter().filter_map(|e| e.ok()) {
        let path = entry.path();
        if path.extension().is_some_and(|e| e == "jsonl")
            && !path
                .file_name()
                .is_some_and(|n| n.to_string_lossy().contains(".bak"))
        {
            out.push(path.to_path_buf());
        }
    }
}

/// Sort best-first and pop the winner.
fn rank(candidates: &mut Vec<Candidate>) -> Option<Candidate> {
    candidates.sort_by(|a, b| {
        b.score
            .cmp(&a.score)
            .then_with(|| b.last_timestamp.cmp(&a.last_timestamp))
            .then_with(|| b.mtime.cmp(&a.mtime))
    });
    if candidates.is_empty() {
        None
    } else {
        Some(candidates[0].clone())
    }
}

fn grade(best: &Candidate, runner_up: Option<&Candidate>) -> DiscoveryConfidence {
    let Some(other) = runner_up else {
        return DiscoveryConfidence::High;
    };
    let score_gap = best.score - other.score;
    let recency_gap = match (best.last_timestamp, other.last_timestamp) {
        (Some(a), Some(b)) => a.signed_duration_since(b).num_seconds(),
        (Some(_), None) => i64::MAX,
        _ => 0,
    };
    if score_gap >= SAFE_SCORE_MARGIN
        || (score_gap >= 0 && recency_gap >= SAFE_RECENCY_MARGIN_SECS)
    {
        DiscoveryConfidence::High
    } else {
        DiscoveryConfidence::Medium
    }
}

// ── Agent-X ──────────────────────────────────────────────────────────────────

pub fn discover_codex(
    cwd: &str,
    options: &DiscoverOptions,
    evs: &EvsPaths,
) -> Result<Option<Discovery>, EvsError> {
    // WHY: the notify hook's state file is authoritative when it knows this
    // cwd — the hook saw the live thread id on the agent's last turn, while
    // the date-tree scan can only guess from whatever rollouts mention the
    // directory.
    if let Some(entry) = lookup_codex_state(evs, cwd)? {
        if let Some(path) = find_rollout_by_id(&options.home, &entry.thread_id, options.lookback_days)
        {
            return Ok(Some(Discovery {
                candidate: Candidate {
                    path,
                    agent: Agent::Codex,
                    score: 200,
                    session_id: Some(entry.thread_id),
                    last_timestamp: entry.updated_at.parse().ok(),
                    mtime: None,
                },
                confidence: DiscoveryConfidence::High,
                runner_up_count: 0,
            }));
        }
    }

    let mut matching: Vec<Candidate> = Vec::new();
    let mut all: Vec<Candidate> = Vec::new();
    for path in recent_rollouts(&options.home, options.lookback_days) {
        let (head, _) = jsonl::read_head(&path, 3)?;
        let meta = head
            .iter()
            .find(|e| e.get("type").and_then(|t| t.as_str()) == Some("session_meta"));
        let session_cwd = meta
            .and_then(|m| m.get("payload"))
            .and_then(|p| p.get("cwd"))
            .and_then(|c| c.as_str());
        let session_id = meta
            .and_then(|m| m.get("payload"))
            .and_then(|p| p.get("id"))
            .and_then(|i| i.as_str())
            .map(String::from);
        let candidate = Candidate {
            path: path.clone(),
            agent: Agent::Codex,
            score: if session_cwd == Some(cwd) { 100 } else { 0 },
            session_id,
            last_timestamp: rollout_timestamp(&path),
            mtime: std::fs::metadata(&path).and_then(|m| m.modified()).ok(),
        };
        if session_cwd == Some(cwd) {
            matching.push(candidate.clone());
        }
        all.push(candidate);
    }

    let total = matching.len();
    if let Some(best) = rank(&mut matching) {
        let confidence = if total > 1 {
            DiscoveryConfidence::Medium
        } else {
            DiscoveryConfidence::High
        };
        return Ok(Some(Discovery {
            candidate: best,
            confidence,
            runner_up_count: total.saturating_sub(1),
        }));
    }
    if options.fallback {
        if let Some(best) = rank(&mut all) {
            return Ok(Some(Discovery {
                confidence: DiscoveryConfidence::Low,
                runner_up_count: all.len().saturating_sub(1),
                candidate: best,
            }));
        }
    }
    Ok(None)
}

/// Walk `~/.codex/sessions/YYYY/MM/DD` for the last `lookback_days` days.
fn recent_rollouts(home: &Path, lookback_days: u32) -> Vec<PathBuf> {
    let root = paths::codex_sessions_root(home);
    let mut out = Vec::new();
    let today = Utc::now().date_naive();
    for offset in 0..=lookback_days {
        let Some(day) = today.checked_sub_signed(ChronoDuration::days(i64::from(offset))) else {
            continue;
        };
        let dir = root
            .join(format!("{:04}", chrono::Datelike::year(&day)))
            .join(format!("{:02}", chrono::Datelike::month(&day)))
            .join(format!("{:02}", chrono::Datelike::day(&day)));
        if !dir.is_dir() {
            continue;
        }
        if let Ok(entries) = std::fs::read_dir(&dir) {
            for entry in entries.filter_map(|e| e.ok()) {
                let path = entry.path();
                let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
                if name.starts_with("rollout-") && name.ends_with(".jsonl") {
                    out.push(path);
                }
            }
        }
    }
    out
}

/// `rollout-2025-06-01T10-00-00-<id>.jsonl` → the embedded timestamp.
fn rollout_timestamp(path: &Path) -> Option<DateTime<Utc>> {
    let name = path.file_name()?.to_str()?;
    let rest = name.strip_prefix("rollout-")?;
    if rest.len() < 19 {
        return None;
    }
    let ts = &rest[..19]; // YYYY-MM-DDTHH-MM-SS
    let normalized = format!(
        "{}T{}:{}:{}Z",
        &ts[..10],
        &ts[11..13],
        &ts[14..16],
        &ts[17..19]
    );
    normalized.parse().ok()
}

fn find_rollout_by_id(home: &Path, thread_id: &str, lookback_days: u32) -> Option<PathBuf> {
    recent_rollouts(home, lookback_days)
        .into_iter()
        .find(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.contains(thread_id))
        })
}

// ── cwd → thread-id state file ───────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct CodexStateEntry {
    pub thread_id: String,
    pub turn_id: Option<String>,
    pub updated_at: String,
}

/// Record the thread the notify hook just saw for a cwd.
pub fn update_codex_state(
    evs: &EvsPaths,
    cwd: &str,
    thread_id: &str,
    turn_id: Option<&str>,
) -> Result<(), EvsError> {
    let path = evs.codex_state();
    let mut state = std::fs::read_to_string(&path)
        .ok()
        .and_then(|c| serde_json::from_str::<Value>(&c).ok())
        .unwrap_or_else(|| json!({}));
    state[cwd] = json!({
        "threadId": thread_id,
        "turnId": turn_id,
        "updatedAt": crate::util::now_iso(),
    });
    jsonl::write_json_atomic(&path, &state)
}

pub fn lookup_codex_state(evs: &EvsPaths, cwd: &str) -> Result<Option<CodexStateEntry>, EvsError> {
    let path = evs.codex_state();
    let content = match std::fs::read_to_string(&path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(EvsError::io_at(&path, e)),
    };
    let state: Value = serde_json::from_str(&content)?;
    let Some(entry) = state.get(cwd) else {
        return Ok(None);
    };
    let Some(thread_id) = entry.get("threadId").and_then(|t| t.as_str()) else {
        return Ok(None);
    };
    Ok(Some(CodexStateEntry {
        thread_id: thread_id.to_string(),
        turn_id: entry.get("turnId").and_then(|t| t.as_str()).map(String::from),
        updated_at: entry
            .get("updatedAt")
            .and_then(|t| t.as_str())
            .unwrap_or("")
            .to_string(),
    }))
}
