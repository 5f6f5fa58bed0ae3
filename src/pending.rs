//! The pending-compact store: a persisted, ready-to-apply compaction plan
//! awaiting a safe boundary.
//!
//! # State machine
//!
//! ```text
//! absent → running            auto-compact job started
//! running → ready             summary produced, selection recorded
//! running → failed            any error on the way
//! ready → stale               source fingerprint stopped matching
//! any → absent                applied by the supervisor, or cleared
//! ```
//!
//! The file is the coordination primitive between the auto-compact engine
//! and the supervisor; both sides only ever replace it atomically. A plan is
//! applicable when its status is `ready` *and* the transcript still matches
//! the fingerprint captured when the plan was built.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::EvsError;
use crate::jsonl::{self, SourceFingerprint};
use crate::paths::EvsPaths;
use crate::session::Agent;
use crate::util;

pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PendingStatus {
    Running,
    Ready,
    Failed,
    Stale,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AmountMode {
    Messages,
    Tokens,
}

/// The selection the plan will remove.
///
/// WHY: recorded for display and sanity checks only — the authoritative
/// removal is recomputed at apply time against the fingerprint-verified
/// transcript. Trusting stored line numbers would silently corrupt a file
/// that gained even one line between plan and apply.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingSelection {
    pub remove_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_removed_line: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_removed_line: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub anchor_line: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingCompact {
    pub schema_version: u32,
    pub session_id: String,
    pub status: PendingStatus,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ready_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<String>,
    pub threshold_tokens: u64,
    pub tokens_at_trigger: u64,
    pub amount_mode: AmountMode,
    pub amount_raw: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    pub selection: PendingSelection,
    pub source: SourceFingerprint,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PendingCompact {
    pub fn running(
        session_id: &str,
        threshold_tokens: u64,
        tokens_at_trigger: u64,
        amount_mode: AmountMode,
        amount_raw: &str,
    ) -> PendingCompact {
        PendingCompact {
            schema_version: SCHEMA_VERSION,
            session_id: session_id.to_string(),
            status: PendingStatus::Running,
            created_at: util::now_iso(),
            ready_at: None,
            failed_at: None,
            threshold_tokens,
            tokens_at_trigger,
            amount_mode,
            amount_raw: amount_raw.to_string(),
            model: None,
            summary: None,
            selection: PendingSelection::default(),
            source: SourceFingerprint::default(),
            error: None,
        }
    }

    pub fn into_ready(
        mut self,
        summary: String,
        selection: PendingSelection,
        source: SourceFingerprint,
    ) -> PendingCompact {
        self.status = PendingStatus::Ready;
        self.ready_at = Some(util::now_iso());
        self.summary = Some(summary);
        self.selection = selection;
        self.source = source;
        self
    }

    pub fn into_failed(mut self, error: String) -> PendingCompact {
        self.status = PendingStatus::Failed;
        self.failed_at = Some(util::now_iso());
        self.error = Some(error);
        self
    }

    /// Ready and still matching the transcript it was planned against.
    pub fn is_applicable(&self, current: &SourceFingerprint) -> bool {
        self.status == PendingStatus::Ready && self.source.matches(current)
    }

    /// A `running` record older than `busy_timeout` belongs to a dead job
    /// and may be overwritten.
    pub fn running_timed_out(&self, busy_timeout: std::time::Duration) -> bool {
        if self.status != PendingStatus::Running {
            return false;
        }
        // EDGE: an unparseable timestamp counts as timed out — a record
        // whose age cannot be established must not hold the store forever.
        let Ok(created) = self.created_at.parse::<chrono::DateTime<chrono::Utc>>() else {
            return true;
        };
        let age = chrono::Utc::now().signed_duration_since(created);
        age.num_seconds() >= busy_timeout.as_secs() as i64
    }
}

/// Handle to one session's pending-compact file.
#[derive(Debug, Clone)]
pub struct PendingStore {
    path: PathBuf,
}

impl PendingStore {
    pub fn open(paths: &EvsPaths, session_id: &str, agent: Agent) -> PendingStore {
        PendingStore { path: paths.pending_compact(session_id, agent) }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// `None` when no plan exists. A file that no longer deserializes is
    /// surfaced as an error rather than silently treated as absent.
    pub fn load(&self) -> Result<Option<PendingCompact>, EvsError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(EvsError::io_at(&self.path, e)),
        };
        Ok(Some(serde_json::from_str(&content)?))
    }

    pub fn save(&self, plan: &PendingCompact) -> Result<(), EvsError> {
        jsonl::write_json_atomic(&self.path, &serde_json::to_value(plan)?)
    }

    /// Any state → absent.
    pub fn clear(&self) -> Result<(), EvsError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(EvsError::io_at(&self.path, e)),
        }
    }

    pub fn mark_stale(&self, mut plan: PendingCompact) -> Result<(), EvsError> {
        plan.status = PendingStatus::Stale;
        self.save(&plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, PendingStore) {
        let dir = tempfile::TempDir::new().unwrap();
        let paths = EvsPaths::at(dir.path());
        let store = PendingStore::open(&paths, "s1", Agent::Claude);
        (dir, store)
    }

    fn sample_running() -> PendingCompact {
        PendingCompact::running("s1", 140_000, 150_000, AmountMode::Messages, "50%")
    }

    #[test]
    fn test_load_absent_is_none() {
        let (_dir, store) = store();
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn test_save_load_round_trip() {
        let (_dir, store) = store();
        store.save(&sample_running()).unwrap();
        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.schema_version, SCHEMA_VERSION);
        assert_eq!(loaded.status, PendingStatus::Running);
        assert_eq!(loaded.session_id, "s1");
        assert_eq!(loaded.amount_raw, "50%");
    }

    #[test]
    fn test_wire_field_names_are_camel_case() {
        let (_dir, store) = store();
        store.save(&sample_running()).unwrap();
        let raw = std::fs::read_to_string(store.path()).unwrap();
        assert!(raw.contains("\"schemaVersion\""));
        assert!(raw.contains("\"sessionId\""));
        assert!(raw.contains("\"thresholdTokens\""));
        assert!(raw.contains("\"amountMode\""));
    }

    #[test]
    fn test_ready_transition_and_applicability() {
        let fp = SourceFingerprint { mtime_ms: Some(1000), size: Some(42) };
        let plan = sample_running().into_ready(
            "summary text".to_string(),
            PendingSelection { remove_count: 5, ..Default::default() },
            fp,
        );
        assert_eq!(plan.status, PendingStatus::Ready);
        assert!(plan.ready_at.is_some());
        assert!(plan.is_applicable(&fp));

        let moved = SourceFingerprint { mtime_ms: Some(2000), size: Some(42) };
        assert!(!plan.is_applicable(&moved));
    }

    #[test]
    fn test_failed_transition() {
        let plan = sample_running().into_failed("summarizer exploded".to_string());
        assert_eq!(plan.status, PendingStatus::Failed);
        assert_eq!(plan.error.as_deref(), Some("summarizer exploded"));
        assert!(!plan.is_applicable(&SourceFingerprint::default()));
    }

    #[test]
    fn test_running_timeout() {
        let mut plan = sample_running();
        assert!(!plan.running_timed_out(std::time::Duration::from_secs(600)));
        plan.created_at = "2020-01-01T00:00:00.000Z".to_string();
        assert!(plan.running_timed_out(std::time::Duration::from_secs(600)));
    }

    #[test]
    fn test_clear_is_idempotent() {
        let (_dir, store) = store();
        store.save(&sample_running()).unwrap();
        store.clear().unwrap();
        store.clear().unwrap();
        assert!(store.load().unwrap().is_none());
    }
}
