//! Shared utilities: amount/threshold spec parsing, timestamps, and small
//! string helpers used across modules.

use regex::Regex;

use crate::error::EvsError;

/// How much of a session an operation should take.
///
/// Parsed from user-facing specs:
/// - `"50"` — a message count
/// - `"40%"` — percent of visible messages
/// - `"140k"`, `"2500t"` — an absolute token amount
/// - `"40%t"` — percent of total visible tokens
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Amount {
    Count(usize),
    Percent(u8),
    Tokens(u64),
    PercentTokens(u8),
}

impl Amount {
    pub fn is_token_based(&self) -> bool {
        matches!(self, Amount::Tokens(_) | Amount::PercentTokens(_))
    }
}

pub fn parse_amount(s: &str) -> Result<Amount, EvsError> {
    let re = Regex::new(r"^\s*(\d+(?:\.\d+)?)\s*([kKmM])?\s*(%t|%|tokens|tok|t)?\s*$")
        .map_err(|e| EvsError::Other(e.to_string()))?;
    let caps = re
        .captures(s)
        .ok_or_else(|| EvsError::InvalidSpec(s.to_string()))?;

    let number: f64 = caps[1]
        .parse()
        .map_err(|_| EvsError::InvalidSpec(s.to_string()))?;
    let scale = match caps.get(2).map(|m| m.as_str().to_ascii_lowercase()).as_deref() {
        Some("k") => Some(1_000.0),
        Some("m") => Some(1_000_000.0),
        _ => None,
    };
    let unit = caps.get(3).map(|m| m.as_str());

    match (scale, unit) {
        // A scale suffix always means tokens: "140k", "1m", "140k tok".
        (Some(mult), None | Some("t") | Some("tok") | Some("tokens")) => {
            Ok(Amount::Tokens((number * mult).round() as u64))
        }
        (None, Some("t") | Some("tok") | Some("tokens")) => {
            Ok(Amount::Tokens(number.round() as u64))
        }
        (None, Some("%")) => percent_of(number, s).map(Amount::Percent),
        (None, Some("%t")) => percent_of(number, s).map(Amount::PercentTokens),
        (None, None) => {
            // EDGE: a bare "3.5" is rejected rather than rounded — a
            // fractional message count is always a typo for a token or
            // percent spec.
            if number.fract() != 0.0 {
                return Err(EvsError::InvalidSpec(s.to_string()));
            }
            Ok(Amount::Count(number as usize))
        }
        // "40k%" and friends.
        _ => Err(EvsError::InvalidSpec(s.to_string())),
    }
}

/// Auto-compact trigger threshold: absolute tokens or percent of the
/// session's context window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Threshold {
    Tokens(u64),
    Percent(u8),
}

impl Threshold {
    /// Resolve against a context-window size.
    pub fn resolve(&self, context_window: u64) -> u64 {
        match self {
            Threshold::Tokens(t) => *t,
            Threshold::Percent(p) => context_window * u64::from(*p) / 100,
        }
    }
}

pub fn parse_threshold(s: &str) -> Result<Threshold, EvsError> {
    match parse_amount(s)? {
        Amount::Tokens(t) => Ok(Threshold::Tokens(t)),
        Amount::Percent(p) | Amount::PercentTokens(p) => Ok(Threshold::Percent(p)),
        Amount::Count(n) => Ok(Threshold::Tokens(n as u64)),
    }
}

fn percent_of(number: f64, original: &str) -> Result<u8, EvsError> {
    if number.fract() != 0.0 || !(0.0..=100.0).contains(&number) {
        return Err(EvsError::InvalidSpec(original.to_string()));
    }
    Ok(number as u8)
}

/// Current instant in the RFC 3339 form the transcripts themselves use.
pub fn now_iso() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Truncate at a char boundary at or below `max` bytes.
pub fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// `"1 line"` / `"n lines"` — keeps report text readable.
pub fn count_noun(n: usize, noun: &str) -> String {
    if n == 1 {
        format!("1 {noun}")
    } else {
        format!("{n} {noun}s")
    }
}
