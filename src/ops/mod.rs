//! The structural operation kernel shared by remove, trim, clean, and
//! compact.
//!
//! # Architecture overview
//!
//! Every mutating operation reduces to the same two-stage pipeline:
//!
//! **Stage 1 — selection expansion.** A set of line numbers marked for
//! removal grows until the invariants cannot be broken by the removal:
//! tool pairs travel together, and (opt-in) whole assistant turns travel
//! together. Expansion iterates to a fixpoint, bounded at 100 passes as a
//! defense against malformed inputs.
//!
//! **Stage 2 — rewrite.** Surviving entries whose `parentUuid` now points
//! into the removed set are relinked past it: walk the removed-parent chain
//! (bounded at 100 hops) until a surviving ancestor or `null`.
//!
//! The output is a proposed line list plus a change set. Nothing touches the
//! disk until `commit`, which re-parses the proposal, re-validates it, and
//! refuses to write when the error count strictly worsened (unless forced).
//! On commit the original is backed up and atomically replaced under an
//! exclusive sibling lock.

pub mod compact;
pub mod migrate;
pub mod remove;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;

use fs2::FileExt;

use crate::error::EvsError;
use crate::jsonl::{self, Line};
use crate::session::{Session, Transcript, claude, codex};
use crate::validate::{self, Issue};

const MAX_EXPANSION_PASSES: usize = 100;
const MAX_RELINK_HOPS: usize = 100;

// ── Change sets ──────────────────────────────────────────────────────────────

/// One planned mutation, addressed by the pre-rewrite line numbering.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Change {
    DeleteLine { line: usize, reason: String },
    UpdateLine { line: usize, reason: String },
    InsertAfter {
        #[serde(rename = "afterLine")]
        after_line: usize,
        reason: String,
    },
}

#[derive(Debug, Clone, Default, serde::Serialize)]
#[serde(transparent)]
pub struct ChangeSet {
    pub changes: Vec<Change>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn deletions(&self) -> usize {
        self.changes
            .iter()
            .filter(|c| matches!(c, Change::DeleteLine { .. }))
            .count()
    }

    pub fn summary(&self) -> String {
        let deletes = self.deletions();
        let updates = self
            .changes
            .iter()
            .filter(|c| matches!(c, Change::UpdateLine { .. }))
            .count();
        let inserts = self
            .changes
            .iter()
            .filter(|c| matches!(c, Change::InsertAfter { .. }))
            .count();
        format!("{deletes} deleted, {updates} updated, {inserts} inserted")
    }
}

/// A proposed rewrite: the full next line list plus the change set that
/// produced it. Line numbers inside `lines` are already renumbered from 1.
#[derive(Debug, Clone)]
pub struct Rewrite {
    pub lines: Vec<Line>,
    pub changes: ChangeSet,
}

impl Rewrite {
    /// The identity rewrite: current content, no changes.
    pub fn unchanged(transcript: &Transcript) -> Rewrite {
        Rewrite {
            lines: transcript.lines.clone(),
            changes: ChangeSet::default(),
        }
    }

    pub fn to_text(&self) -> String {
        jsonl::assemble(&self.lines)
    }
}

// ── Stage 1: selection expansion ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct ExpansionOptions {
    /// Keep tool pairs together. Always on for invariant-preserving
    /// operations.
    pub tool_pairs: bool,
    /// Keep whole assistant turns together (Agent-C). Default on for
    /// compact and trim, opt-in elsewhere.
    pub assistant_turns: bool,
}

impl Default for ExpansionOptions {
    fn default() -> Self {
        ExpansionOptions { tool_pairs: true, assistant_turns: false }
    }
}

/// Expand `marked` to the full set that must be removed together, with a
/// human-readable reason per line.
pub fn expand_selection(
    session: &Session,
    marked: &BTreeMap<usize, String>,
    opts: ExpansionOptions,
) -> BTreeMap<usize, String> {
    let mut selected = marked.clone();

    for _pass in 0..MAX_EXPANSION_PASSES {
        let before = selected.len();
        match session {
            Session::Claude(t) => {
                if opts.tool_pairs {
                    expand_claude_tool_pairs(t, &mut selected);
                }
                if opts.assistant_turns {
                    expand_assistant_turns(t, &mut selected);
                }
            }
            Session::Codex(c) => {
                if opts.tool_pairs {
                    expand_codex_call_pairs(c, &mut selected);
                }
            }
        }
        if selected.len() == before {
            break;
        }
    }
    selected
}

fn expand_claude_tool_pairs(t: &Transcript, selected: &mut BTreeMap<usize, String>) {
    let map = claude::tool_id_map(t);

    // Ids contributed by any currently-selected line, on either side.
    let mut removed_ids: HashSet<String> = HashSet::new();
    for (&number, _) in selected.iter() {
        if let Some(entry) = t.entry(number) {
            removed_ids.extend(claude::tool_use_ids(entry));
            removed_ids.extend(claude::tool_result_ids(entry));
        }
    }
    for id in &removed_ids {
        for &number in map.uses.get(id).into_iter().flatten() {
            selected
                .entry(number)
                .or_insert_with(|| format!("tool_use {id} pairs with a removed entry"));
        }
        for &number in map.results.get(id).into_iter().flatten() {
            selected
                .entry(number)
                .or_insert_with(|| format!("tool_result {id} pairs with a removed entry"));
        }
    }

    // WHY: a result whose every producing use-line is gone must go too,
    // even when the id itself was never named by the original selection —
    // this is the rule that keeps multi-pass expansion converging on a set
    // with no orphans rather than chasing ids one hop per pass.
    for (id, result_lines) in &map.results {
        let Some(use_lines) = map.uses.get(id) else { continue };
        if use_lines.iter().all(|n| selected.contains_key(n)) {
            for &number in result_lines {
                selected
                    .entry(number)
                    .or_insert_with(|| format!("tool_result {id} lost its tool_use"));
            }
        }
    }
}

fn expand_assistant_turns(t: &Transcript, selected: &mut BTreeMap<usize, String>) {
    for turn in claude::assistant_turns(t) {
        if turn.iter().any(|n| selected.contains_key(n)) {
            for &number in &turn {
                selected
                    .entry(number)
                    .or_insert_with(|| "part of a removed assistant turn".to_string());
            }
        }
    }
}

fn expand_codex_call_pairs(c: &codex::CodexSession, selected: &mut BTreeMap<usize, String>) {
    let map = codex::call_map(c);
    let mut removed_ids: HashSet<String> = HashSet::new();
    for (&number, _) in selected.iter() {
        if let Some(item) = c.transcript.entry(number).and_then(|e| c.item(e)) {
            if let Some(id) = codex::call_id(item) {
                removed_ids.insert(id.to_string());
            }
        }
    }
    for id in &removed_ids {
        for (number, _) in map.calls.get(id).into_iter().flatten() {
            selected
                .entry(*number)
                .or_insert_with(|| format!("call {id} pairs with a removed entry"));
        }
        for (number, _) in map.outputs.get(id).into_iter().flatten() {
            selected
                .entry(*number)
                .or_insert_with(|| format!("output {id} pairs with a removed entry"));
        }
    }
}

// ── Stage 2: rewrite ─────────────────────────────────────────────────────────

/// Delete the selected lines and relink surviving parents past the hole.
pub fn build_removal(session: &Session, selected: &BTreeMap<usize, String>) -> Rewrite {
    let transcript = session.transcript();
    let mut changes = ChangeSet::default();
    for (&number, reason) in selected {
        changes.changes.push(Change::DeleteLine { line: number, reason: reason.clone() });
    }

    // Map each removed uuid to its own parent so survivors can walk past it.
    let is_claude = matches!(session, Session::Claude(_));
    let mut removed_parent: HashMap<String, Option<String>> = HashMap::new();
    if is_claude {
        for (&number, _) in selected {
            if let Some(entry) = transcript.entry(number) {
                if let Some(id) = claude::uuid(entry) {
                    removed_parent.insert(
                        id.to_string(),
                        claude::parent_uuid(entry).map(String::from),
                    );
                }
            }
        }
    }

    let mut surviving: Vec<Line> = Vec::new();
    for line in &transcript.lines {
        if !selected.contains_key(&line.number) {
            surviving.push(line.clone());
        }
    }

    if is_claude {
        relink_parents(&mut surviving, &removed_parent, &mut changes);
    }

    renumber(&mut surviving);
    Rewrite { lines: surviving, changes }
}

/// Rewrite `parentUuid` on survivors that point into the removed set,
/// walking the removed-parent chain to the nearest surviving ancestor.
fn relink_parents(
    surviving: &mut [Line],
    removed_parent: &HashMap<String, Option<String>>,
    changes: &mut ChangeSet,
) {
    let surviving_uuids: HashSet<String> = surviving
        .iter()
        .filter_map(|l| l.entry().and_then(claude::uuid).map(String::from))
        .collect();

    for line in surviving.iter_mut() {
        let number = line.number;
        let Some(entry) = line.entry_mut() else { continue };
        let Some(current) = claude::parent_uuid(entry).map(String::from) else {
            continue;
        };
        if !removed_parent.contains_key(&current) {
            continue;
        }

        let mut target: Option<String> = Some(current.clone());
        let mut hops = 0usize;
        while let Some(ref candidate) = target {
            if surviving_uuids.contains(candidate) {
                break;
            }
            hops += 1;
            if hops > MAX_RELINK_HOPS {
                target = None;
                break;
            }
            match removed_parent.get(candidate) {
                Some(next) => target = next.clone(),
                // EDGE: the walk landed on a uuid that is neither surviving
                // nor removed — the chain was already dangling before this
                // operation. Sever to root rather than preserve a pointer
                // into nowhere.
                None => {
                    target = None;
                }
            }
        }

        claude::set_parent_uuid(entry, target.as_deref());
        if let Ok(raw) = serde_json::to_string(entry) {
            line.raw = raw;
        }
        changes.changes.push(Change::UpdateLine {
            line: number,
            reason: format!("parentUuid relinked past removed entry {current}"),
        });
    }
}

fn renumber(lines: &mut [Line]) {
    for (i, line) in lines.iter_mut().enumerate() {
        line.number = i + 1;
    }
}

// ── Commit gate ──────────────────────────────────────────────────────────────

/// The outcome of committing (or refusing) a rewrite.
#[derive(Debug, serde::Serialize)]
pub struct CommitReport {
    pub aborted: bool,
    #[serde(rename = "errorsBefore")]
    pub errors_before: usize,
    #[serde(rename = "errorsAfter")]
    pub errors_after: usize,
    #[serde(rename = "backupPath", skip_serializing_if = "Option::is_none")]
    pub backup_path: Option<PathBuf>,
    pub written: bool,
    pub changes: ChangeSet,
    #[serde(rename = "issuesAfter", skip_serializing_if = "Vec::is_empty")]
    pub issues_after: Vec<Issue>,
}

/// Re-parse and re-validate a proposed rewrite; write it only when the error
/// count did not strictly worsen (or when forced).
///
/// An empty change set is a committed no-op: nothing is validated against,
/// nothing is written, `remove(S, ∅) == S`.
pub fn commit(session: &Session, rewrite: Rewrite, force: bool, dry_run: bool) -> Result<CommitReport, EvsError> {
    let errors_before = validate::error_count(&validate::validate(session));

    if rewrite.changes.is_empty() {
        return Ok(CommitReport {
            aborted: false,
            errors_before,
            errors_after: errors_before,
            backup_path: None,
            written: false,
            changes: rewrite.changes,
            issues_after: Vec::new(),
        });
    }

    let proposed = reparse(session, &rewrite.to_text())?;
    let issues_after = validate::validate(&proposed);
    let errors_after = validate::error_count(&issues_after);

    if errors_after > errors_before && !force {
        return Ok(CommitReport {
            aborted: true,
            errors_before,
            errors_after,
            backup_path: None,
            written: false,
            changes: rewrite.changes,
            issues_after,
        });
    }

    let mut backup_path = None;
    let mut written = false;
    if !dry_run {
        if let Some(path) = &session.transcript().path {
            let _lock = RewriteLock::acquire(path)?;
            backup_path = Some(jsonl::create_backup(path)?);
            jsonl::write_atomic(path, rewrite.to_text().as_bytes())?;
            written = true;
        }
    }

    Ok(CommitReport {
        aborted: false,
        errors_before,
        errors_after,
        backup_path,
        written,
        changes: rewrite.changes,
        issues_after,
    })
}

/// Parse proposed text under the same agent/flavor as the original session.
pub fn reparse(session: &Session, text: &str) -> Result<Session, EvsError> {
    let transcript = Transcript::from_text(text);
    Ok(match session {
        Session::Claude(_) => Session::Claude(transcript),
        Session::Codex(c) => Session::Codex(codex::CodexSession::new(transcript, c.flavor)),
    })
}

/// Exclusive sibling lock held for the duration of a transcript rewrite.
///
/// WHY: readers never take it — they tolerate mid-rewrite stat transitions
/// because the replace is atomic. The lock only serializes *writers*, so
/// two concurrent eversession invocations cannot both back up the same
/// original and then clobber each other's rewrite.
struct RewriteLock {
    file: std::fs::File,
    path: PathBuf,
}

impl RewriteLock {
    fn acquire(transcript_path: &std::path::Path) -> Result<RewriteLock, EvsError> {
        let path = PathBuf::from(format!("{}.lock", transcript_path.display()));
        let file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| EvsError::io_at(&path, e))?;
        file.lock_exclusive().map_err(|e| EvsError::io_at(&path, e))?;
        Ok(RewriteLock { file, path })
    }
}

impl Drop for RewriteLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
        let _ = std::fs::remove_file(&self.path);
    }
}

// ── Convenience used by several operations ───────────────────────────────────

/// Mark a set of line numbers with one shared reason.
pub fn mark(lines: impl IntoIterator<Item = usize>, reason: &str) -> BTreeMap<usize, String> {
    lines
        .into_iter()
        .map(|n| (n, reason.to_string()))
        .collect()
}
