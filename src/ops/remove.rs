//! Removal-shaped operations: explicit line removal, prefix trimming, and
//! keyword cleaning. All three are thin selections over the shared kernel.

use std::collections::BTreeMap;

use crate::error::EvsError;
use crate::session::Session;
use crate::tokens::{self, PlanAmount};
use crate::util::Amount;

use super::{ExpansionOptions, Rewrite, build_removal, expand_selection};

/// Remove explicitly named lines (after pairing/turn expansion).
pub fn remove_lines(
    session: &Session,
    lines: &[usize],
    preserve_assistant_turns: bool,
) -> Rewrite {
    let marked: BTreeMap<usize, String> = lines
        .iter()
        .map(|&n| (n, "requested removal".to_string()))
        .collect();
    let opts = ExpansionOptions {
        tool_pairs: true,
        assistant_turns: preserve_assistant_turns,
    };
    let selection = expand_selection(session, &marked, opts);
    build_removal(session, &selection)
}

/// Trim the oldest visible messages without inserting a summary.
///
/// `keep_last` reinterprets `Count(n)` as "keep the last n messages". It has
/// no meaning for token amounts and is refused.
pub fn trim(session: &Session, amount: Amount, keep_last: bool) -> Result<Rewrite, EvsError> {
    if keep_last && amount.is_token_based() {
        return Err(EvsError::InvalidAmountMode);
    }

    let visible = tokens::visible_message_tokens(session);
    let remove_count = resolve_remove_count(&visible, amount, keep_last);
    let marked: BTreeMap<usize, String> = visible
        .iter()
        .take(remove_count)
        .map(|m| (m.line, "trimmed prefix message".to_string()))
        .collect();

    let opts = ExpansionOptions { tool_pairs: true, assistant_turns: true };
    let selection = expand_selection(session, &marked, opts);
    Ok(build_removal(session, &selection))
}

/// How many of the oldest visible messages an `amount` denotes.
pub fn resolve_remove_count(
    visible: &[tokens::MessageTokens],
    amount: Amount,
    keep_last: bool,
) -> usize {
    let n = visible.len();
    match amount {
        Amount::Count(count) if keep_last => n.saturating_sub(count),
        Amount::Count(count) => count.min(n),
        Amount::Percent(p) => n * usize::from(p) / 100,
        Amount::Tokens(t) => {
            let per_message: Vec<u64> = visible.iter().map(|m| m.tokens).collect();
            tokens::plan_prefix_removal(&per_message, PlanAmount::Tokens(t), None).remove_count
        }
        Amount::PercentTokens(p) => {
            let per_message: Vec<u64> = visible.iter().map(|m| m.tokens).collect();
            tokens::plan_prefix_removal(&per_message, PlanAmount::PercentTokens(p), None)
                .remove_count
        }
    }
}

/// Remove every entry whose raw line matches `pattern` (a regex), with tool
/// pairs expanded so the removal cannot orphan a result.
pub fn clean_matching(
    session: &Session,
    pattern: &str,
    preserve_assistant_turns: bool,
) -> Result<Rewrite, EvsError> {
    let re = regex::Regex::new(pattern)
        .map_err(|e| EvsError::InvalidSpec(format!("bad pattern {pattern}: {e}")))?;

    let transcript = session.transcript();
    let mut marked: BTreeMap<usize, String> = BTreeMap::new();
    for (number, _) in transcript.entries() {
        let line = transcript.line(number).map(|l| l.raw.as_str()).unwrap_or("");
        if re.is_match(line) {
            marked.insert(number, format!("matches /{pattern}/"));
        }
    }

    let opts = ExpansionOptions {
        tool_pairs: true,
        assistant_turns: preserve_assistant_turns,
    };
    let selection = expand_selection(session, &marked, opts);
    Ok(build_removal(session, &selection))
}
