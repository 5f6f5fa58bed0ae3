//! Compaction: replace the oldest visible messages with one synthetic
//! summary entry so the agent's view becomes `[summary, kept tail…]`.
//!
//! # Agent-C algorithm
//!
//! 1. Resolve the amount to a message count against the visible chain.
//! 2. Mark the oldest messages and expand the selection (tool pairs, whole
//!    assistant turns).
//! 3. Choose the insertion anchor, in order: after a prior compact boundary;
//!    after a root meta user entry; rewrite a plain root user entry in place
//!    (preserving its uuid so descendants stay linked); otherwise after the
//!    first file-history snapshot or at the top of the file.
//! 4. Build the summary entry with environment fields copied from a template
//!    entry, relink the first kept message to it, relink everything else
//!    past the removed region.
//! 5. Run the restricted post-fix (thinking order and streaming collapse
//!    only — no history deletions).
//!
//! # Agent-X algorithm
//!
//! Emit a `compacted` envelope carrying the summary, drop all prior
//! `compacted` envelopes, optionally preserve a pinned prefix of removed
//! payloads as `replacement_history`, and remove outputs orphaned by the
//! removal.

use std::collections::BTreeMap;

use serde_json::{Value, json};

use crate::error::EvsError;
use crate::fix::{self, FixOptions};
use crate::jsonl::{Line, LineValue};
use crate::session::{Session, Transcript, claude, codex};
use crate::tokens;
use crate::util::Amount;

use super::remove::resolve_remove_count;
use super::{Change, ChangeSet, ExpansionOptions, Rewrite, expand_selection};

#[derive(Debug, Clone)]
pub struct CompactOptions {
    pub amount: Amount,
    /// Reinterpret `Count(n)` as "keep the last n messages".
    pub keep_last: bool,
    /// Keep whole assistant turns together during expansion.
    pub preserve_assistant_turns: bool,
    /// Agent-X: how many removed prefix payloads survive into
    /// `replacement_history`.
    pub pinned_prefix: usize,
}

impl Default for CompactOptions {
    fn default() -> Self {
        CompactOptions {
            amount: Amount::Percent(50),
            keep_last: false,
            preserve_assistant_turns: true,
            pinned_prefix: 0,
        }
    }
}

/// Compact `session`, replacing the removed prefix with `summary`.
pub fn compact(
    session: &Session,
    options: &CompactOptions,
    summary: &str,
) -> Result<Rewrite, EvsError> {
    if options.keep_last && options.amount.is_token_based() {
        return Err(EvsError::InvalidAmountMode);
    }
    match session {
        Session::Claude(t) => compact_claude(session, t, options, summary),
        Session::Codex(c) => compact_codex(c, options, summary),
    }
}

// ── Agent-C ──────────────────────────────────────────────────────────────────

/// Where the synthetic summary goes.
enum Anchor {
    /// Insert after this line, chained to this parent uuid.
    After { line: usize, parent: Option<String> },
    /// Rewrite the root user entry in place, preserving its uuid.
    RewriteRoot { line: usize },
    /// Insert after this line (or at the top when `None`), chained to null.
    AtTop { after: Option<usize> },
}

fn compact_claude(
    session: &Session,
    t: &Transcript,
    options: &CompactOptions,
    summary: &str,
) -> Result<Rewrite, EvsError> {
    let visible = tokens::visible_message_tokens(session);
    let remove_count = resolve_remove_count(&visible, options.amount, options.keep_last);
    if remove_count == 0 {
        return Ok(Rewrite::unchanged(t));
    }
    let chain: Vec<usize> = visible.iter().map(|m| m.line).collect();

    let marked: BTreeMap<usize, String> = chain
        .iter()
        .take(remove_count)
        .map(|&n| (n, "compacted into summary".to_string()))
        .collect();
    let expansion = ExpansionOptions {
        tool_pairs: true,
        assistant_turns: options.preserve_assistant_turns,
    };
    let mut selection = expand_selection(session, &marked, expansion);

    let anchor = choose_anchor(t, &chain);
    // WHY: the anchor must survive whatever the expansion decided — the
    // summary is chained to it (or written into it), and removing it would
    // leave the new summary pointing at a deleted uuid.
    match &anchor {
        Anchor::After { line, .. } | Anchor::RewriteRoot { line } => {
            selection.remove(line);
        }
        Anchor::AtTop { after } => {
            if let Some(line) = after {
                selection.remove(line);
            }
        }
    }

    let mut changes = ChangeSet::default();
    for (&number, reason) in &selection {
        changes.changes.push(Change::DeleteLine { line: number, reason: reason.clone() });
    }

    // Environment template: the first entry that carries a sessionId.
    let template = t
        .entries()
        .find(|(_, e)| e.get("sessionId").is_some())
        .map(|(_, e)| e.clone())
        .unwrap_or_else(|| json!({}));

    // Parent map of removed entries, for relinking survivors past them.
    let mut removed_parent = std::collections::HashMap::new();
    for (&number, _) in &selection {
        if let Some(entry) = t.entry(number) {
            if let Some(id) = claude::uuid(entry) {
                removed_parent.insert(id.to_string(), claude::parent_uuid(entry).map(String::from));
            }
        }
    }

    // Assemble survivors, applying the root rewrite when that is the anchor.
    let summary_uuid;
    let mut surviving: Vec<Line> = Vec::new();
    let mut insert_after_line: Option<Option<usize>> = None; // None = no insert
    match &anchor {
        Anchor::RewriteRoot { line } => {
            let root = t
                .entry(*line)
                .ok_or_else(|| EvsError::Other(format!("anchor line {line} vanished")))?;
            let root_uuid = claude::uuid(root)
                .ok_or_else(|| EvsError::Other("root user entry has no uuid".into()))?
                .to_string();
            // Rewrite in place: only the content changes, every other key —
            // known or not — survives, and descendants stay linked.
            let mut rewritten = root.clone();
            match rewritten.get_mut("message").and_then(|m| m.as_object_mut()) {
                Some(message) => {
                    message.insert("content".to_string(), Value::String(summary.to_string()));
                }
                None => {
                    rewritten["message"] = json!({"role": "user", "content": summary});
                }
            }
            rewritten["isCompactSummary"] = json!(true);
            claude::set_parent_uuid(&mut rewritten, None);
            summary_uuid = root_uuid;
            for l in &t.lines {
                if selection.contains_key(&l.number) {
                    continue;
                }
                if l.number == *line {
                    let raw = serde_json::to_string(&rewritten)?;
                    surviving.push(Line {
                        number: l.number,
                        raw,
                        parsed: LineValue::Entry(rewritten.clone()),
                    });
                    changes.changes.push(Change::UpdateLine {
                        line: l.number,
                        reason: "root user entry rewritten as compact summary".to_string(),
                    });
                } else {
                    surviving.push(l.clone());
                }
            }
        }
        Anchor::After { line, parent } => {
            summary_uuid = uuid::Uuid::new_v4().to_string();
            let mut entry = claude::synthetic_summary_entry(&template, summary, &summary_uuid);
            claude::set_parent_uuid(&mut entry, parent.as_deref());
            for l in &t.lines {
                if !selection.contains_key(&l.number) {
                    surviving.push(l.clone());
                }
            }
            insert_entry_after(&mut surviving, Some(*line), entry)?;
            insert_after_line = Some(Some(*line));
        }
        Anchor::AtTop { after } => {
            summary_uuid = uuid::Uuid::new_v4().to_string();
            let entry = claude::synthetic_summary_entry(&template, summary, &summary_uuid);
            for l in &t.lines {
                if !selection.contains_key(&l.number) {
                    surviving.push(l.clone());
                }
            }
            insert_entry_after(&mut surviving, *after, entry)?;
            insert_after_line = Some(*after);
        }
    }
    if let Some(after) = insert_after_line {
        changes.changes.push(Change::InsertAfter {
            after_line: after.unwrap_or(0),
            reason: "compact summary inserted".to_string(),
        });
    }

    super::relink_parents(&mut surviving, &removed_parent, &mut changes);

    // The first kept visible message chains to the summary.
    let first_kept = chain
        .iter()
        .find(|&&n| !selection.contains_key(&n) && !anchor_is(&anchor, n))
        .copied();
    if let Some(first) = first_kept {
        for l in surviving.iter_mut() {
            if l.number != first {
                continue;
            }
            if let Some(entry) = l.entry_mut() {
                if claude::parent_uuid(entry) != Some(summary_uuid.as_str()) {
                    claude::set_parent_uuid(entry, Some(&summary_uuid));
                    if let Ok(raw) = serde_json::to_string(entry) {
                        l.raw = raw;
                    }
                    changes.changes.push(Change::UpdateLine {
                        line: first,
                        reason: "first kept message chained to the summary".to_string(),
                    });
                }
            }
            break;
        }
    }

    super::renumber(&mut surviving);

    // Restricted post-fix: reorder/collapse only.
    let assembled = Session::Claude(Transcript { path: t.path.clone(), lines: surviving });
    let mut postfix = fix::apply(&assembled, FixOptions::compact_postfix())?;
    changes.changes.append(&mut postfix.changes.changes);
    Ok(Rewrite { lines: postfix.lines, changes })
}

fn anchor_is(anchor: &Anchor, line: usize) -> bool {
    match anchor {
        Anchor::After { line: l, .. } | Anchor::RewriteRoot { line: l } => *l == line,
        Anchor::AtTop { after } => *after == Some(line),
    }
}

fn choose_anchor(t: &Transcript, chain: &[usize]) -> Anchor {
    // A prior compact boundary in the chain wins; chain to it.
    //
    // EDGE: the agent's own `summary` entries carry no uuid, so `parent`
    // can be `None` here — the new summary then roots itself while still
    // sitting physically after the boundary.
    if let Some(&boundary) = chain
        .iter()
        .rev()
        .find(|&&n| t.entry(n).is_some_and(claude::is_compact_boundary))
    {
        let parent = t
            .entry(boundary)
            .and_then(claude::uuid)
            .map(String::from);
        return Anchor::After { line: boundary, parent };
    }

    // A root meta user entry stays and the summary chains to it.
    let root_user = |e: &Value| {
        claude::entry_type(e) == Some("user") && claude::parent_uuid(e).is_none()
    };
    if let Some((line, entry)) = t.entries().find(|(_, e)| root_user(e) && claude::is_meta(e)) {
        let parent = claude::uuid(entry).map(String::from);
        return Anchor::After { line, parent };
    }

    // A plain root user entry is rewritten in place so its descendants stay
    // linked to a uuid that still exists.
    if let Some((line, entry)) = t.entries().find(|(_, e)| root_user(e)) {
        if claude::uuid(entry).is_some() {
            return Anchor::RewriteRoot { line };
        }
    }

    // No usable root: drop in after the first snapshot, else at the top.
    let snapshot = t
        .entries()
        .find(|(_, e)| claude::entry_type(e) == Some("file-history-snapshot"))
        .map(|(n, _)| n);
    Anchor::AtTop { after: snapshot }
}

/// Insert a synthetic entry after the surviving line numbered `after`
/// (original numbering), or at the front when `after` is `None`.
fn insert_entry_after(
    surviving: &mut Vec<Line>,
    after: Option<usize>,
    entry: Value,
) -> Result<(), EvsError> {
    let raw = serde_json::to_string(&entry)?;
    let line = Line { number: 0, raw, parsed: LineValue::Entry(entry) };
    let index = match after {
        None => 0,
        Some(n) => surviving
            .iter()
            .position(|l| l.number == n)
            .map(|i| i + 1)
            .unwrap_or(0),
    };
    surviving.insert(index, line);
    Ok(())
}

// ── Agent-X ──────────────────────────────────────────────────────────────────

fn compact_codex(
    c: &codex::CodexSession,
    options: &CompactOptions,
    summary: &str,
) -> Result<Rewrite, EvsError> {
    if c.flavor == codex::CodexFlavor::Legacy {
        return Err(EvsError::Other(
            "legacy rollouts cannot be compacted in place; migrate to the wrapped format first"
                .into(),
        ));
    }
    let session = Session::Codex(c.clone());
    let visible = tokens::visible_message_tokens(&session);
    let remove_count = resolve_remove_count(&visible, options.amount, options.keep_last);
    if remove_count == 0 {
        return Ok(Rewrite::unchanged(&c.transcript));
    }

    let mut marked: BTreeMap<usize, String> = visible
        .iter()
        .take(remove_count)
        .map(|m| (m.line, "compacted into summary".to_string()))
        .collect();
    // WHY: a fresh compaction supersedes every prior one — the agent
    // replays only the newest `compacted` envelope, so stale ones are dead
    // weight that would still count against the context window.
    for (number, entry) in c.transcript.entries() {
        if codex::envelope_type(entry) == Some("compacted") {
            marked.insert(number, "superseded compacted envelope".to_string());
        }
    }

    let expansion = ExpansionOptions { tool_pairs: true, assistant_turns: false };
    let selection = expand_selection(&session, &marked, expansion);

    let mut changes = ChangeSet::default();
    for (&number, reason) in &selection {
        changes.changes.push(Change::DeleteLine { line: number, reason: reason.clone() });
    }

    // Pinned prefix: the first N removed payloads survive inside the
    // compacted envelope.
    let replacement_history: Vec<Value> = selection
        .keys()
        .filter_map(|&n| c.transcript.entry(n))
        .filter(|e| {
            matches!(
                codex::envelope_type(e),
                Some("response_item") | Some("event_msg")
            )
        })
        .take(options.pinned_prefix)
        .filter_map(|e| e.get("payload").cloned())
        .collect();

    let mut payload = json!({"message": summary});
    if !replacement_history.is_empty() {
        payload["replacement_history"] = Value::Array(replacement_history);
    }
    let envelope = json!({
        "timestamp": crate::util::now_iso(),
        "type": "compacted",
        "payload": payload,
    });

    let mut surviving: Vec<Line> = c
        .transcript
        .lines
        .iter()
        .filter(|l| !selection.contains_key(&l.number))
        .cloned()
        .collect();

    // The envelope goes right after session_meta, or at the top without one.
    let meta_line = surviving
        .iter()
        .find(|l| l.entry().and_then(codex::envelope_type) == Some("session_meta"))
        .map(|l| l.number);
    insert_entry_after(&mut surviving, meta_line, envelope)?;
    changes.changes.push(Change::InsertAfter {
        after_line: meta_line.unwrap_or(0),
        reason: "compacted envelope inserted".to_string(),
    });

    super::renumber(&mut surviving);
    Ok(Rewrite { lines: surviving, changes })
}
