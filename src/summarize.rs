//! Pluggable conversation summarisation.
//!
//! The core never talks to an LLM API itself. The default implementation
//! shells out to the agent's own binary in print mode and reads the summary
//! from stdout; tests and callers that already have a summary use
//! `FixedSummarizer`.

use std::io::Write;

use crate::error::EvsError;
use crate::util;

/// Max input bytes per call (~150KB ≈ 37.5K tokens at 4 bytes/token).
const MAX_INPUT_BYTES: usize = 150 * 1024;

const SUMMARY_PROMPT: &str = "Summarize the following conversation so an AI coding \
assistant can resume work from the summary alone. Keep: the user's goals, decisions \
made, current state of the work, and any constraints or open items. Be dense and \
factual; do not add commentary.\n\n---BEGIN CONVERSATION---\n";

#[derive(Debug, Clone)]
pub struct Summary {
    pub text: String,
    pub model: String,
    pub tokens: u64,
}

pub trait Summarizer {
    fn summarize(
        &self,
        messages: &[String],
        model: &str,
        target_tokens: u64,
    ) -> Result<Summary, EvsError>;
}

/// Invoke `<bin> -p --model <model>` with the conversation on stdin.
pub struct AgentSummarizer {
    pub bin: String,
}

impl Default for AgentSummarizer {
    fn default() -> Self {
        AgentSummarizer { bin: "claude".to_string() }
    }
}

impl Summarizer for AgentSummarizer {
    fn summarize(
        &self,
        messages: &[String],
        model: &str,
        target_tokens: u64,
    ) -> Result<Summary, EvsError> {
        let input = build_input(messages, target_tokens);

        let mut child = std::process::Command::new(&self.bin)
            .args(["-p", "--model", model])
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null())
            .spawn()
            .map_err(|e| EvsError::Other(format!("failed to start {}: {e}", self.bin)))?;

        if let Some(ref mut stdin) = child.stdin {
            stdin
                .write_all(input.as_bytes())
                .map_err(|e| EvsError::Other(format!("failed to write to {} stdin: {e}", self.bin)))?;
        }
        drop(child.stdin.take());

        let output = child
            .wait_with_output()
            .map_err(|e| EvsError::Other(format!("failed to read {} output: {e}", self.bin)))?;

        if !output.status.success() {
            return Err(EvsError::Other(format!(
                "{} exited with status {}",
                self.bin, output.status
            )));
        }

        let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if text.is_empty() {
            return Err(EvsError::Other(format!("{} returned an empty summary", self.bin)));
        }
        let tokens = crate::tokens::estimate_tokens(text.len());
        Ok(Summary { text, model: model.to_string(), tokens })
    }
}

/// A pre-made summary, returned as-is. Used when the user supplies the text
/// and throughout the test suite.
pub struct FixedSummarizer(pub String);

impl Summarizer for FixedSummarizer {
    fn summarize(
        &self,
        _messages: &[String],
        model: &str,
        _target_tokens: u64,
    ) -> Result<Summary, EvsError> {
        Ok(Summary {
            text: self.0.clone(),
            model: model.to_string(),
            tokens: crate::tokens::estimate_tokens(self.0.len()),
        })
    }
}

/// Assemble the prompt for the summariser call.
///
/// WHY: when the input budget overflows, the *oldest* messages are dropped
/// — the kept conversation tail is what the summary must connect to, and a
/// summary of only ancient history would leave the resumed session with a
/// gap right before its most recent work.
fn build_input(messages: &[String], target_tokens: u64) -> String {
    let budget = MAX_INPUT_BYTES.saturating_sub(SUMMARY_PROMPT.len() + 200);

    let mut kept: Vec<&String> = Vec::new();
    let mut used = 0usize;
    for message in messages.iter().rev() {
        let cost = message.len() + 1;
        if used + cost > budget && !kept.is_empty() {
            break;
        }
        used += cost;
        kept.push(message);
    }
    kept.reverse();

    let mut input = String::with_capacity(used + SUMMARY_PROMPT.len() + 100);
    input.push_str(SUMMARY_PROMPT);
    for message in kept {
        input.push_str(util::truncate(message, budget));
        input.push('\n');
    }
    input.push_str("---END CONVERSATION---\n");
    if target_tokens > 0 {
        input.push_str(&format!("\nKeep the summary under roughly {target_tokens} tokens.\n"));
    }
    input
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_summarizer_returns_text() {
        let s = FixedSummarizer("the summary".to_string());
        let out = s.summarize(&["a".to_string()], "model-x", 500).unwrap();
        assert_eq!(out.text, "the summary");
        assert_eq!(out.model, "model-x");
        assert!(out.tokens > 0);
    }

    #[test]
    fn test_build_input_contains_messages_and_prompt() {
        let input = build_input(&["first".to_string(), "second".to_string()], 100);
        assert!(input.starts_with(SUMMARY_PROMPT));
        assert!(input.contains("first\n"));
        assert!(input.contains("second\n"));
        assert!(input.contains("---END CONVERSATION---"));
        assert!(input.contains("100 tokens"));
    }

    #[test]
    fn test_build_input_keeps_newest_on_overflow() {
        let old = "x".repeat(100 * 1024);
        let newer = "y".repeat(100 * 1024);
        let input = build_input(&[old, newer], 0);
        assert!(input.len() <= MAX_INPUT_BYTES + 1024);
        assert!(input.contains('y'));
        assert!(!input.contains('x'));
    }
}
