//! The control channel between CLI commands, notify hooks, and the
//! supervisor loop: a process-owned directory holding `handshake.json` and
//! an append-only `control.jsonl`.
//!
//! The supervisor tails the control log with a byte cursor, so commands are
//! consumed exactly once and strictly in file order. Unknown commands are
//! parsed and ignored by the consumer, never an error — newer CLIs may talk
//! to older supervisors.

use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::EvsError;
use crate::jsonl;
use crate::util;

pub const HANDSHAKE_FILE: &str = "handshake.json";
pub const CONTROL_LOG_FILE: &str = "control.jsonl";

/// What the agent-side hook wrote after its first turn: enough identity to
/// resume the session after a restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    pub run_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transcript_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ts: Option<String>,
}

impl Handshake {
    /// Agent-C writes `sessionId`, Agent-X writes `threadId`; either one
    /// identifies the session to resume.
    pub fn effective_session_id(&self) -> Option<&str> {
        self.session_id.as_deref().or(self.thread_id.as_deref())
    }
}

pub fn handshake_path(control_dir: &Path) -> PathBuf {
    control_dir.join(HANDSHAKE_FILE)
}

pub fn control_log_path(control_dir: &Path) -> PathBuf {
    control_dir.join(CONTROL_LOG_FILE)
}

/// Read the current handshake, `None` when absent or not yet valid JSON
/// (the hook writes it atomically, but tolerate anything).
pub fn read_handshake(control_dir: &Path) -> Result<Option<Handshake>, EvsError> {
    let path = handshake_path(control_dir);
    let content = match std::fs::read_to_string(&path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(EvsError::io_at(&path, e)),
    };
    Ok(serde_json::from_str(&content).ok())
}

pub fn write_handshake(control_dir: &Path, handshake: &Handshake) -> Result<(), EvsError> {
    jsonl::write_json_atomic(&handshake_path(control_dir), &serde_json::to_value(handshake)?)
}

/// One line of `control.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlCommand {
    pub ts: String,
    pub cmd: String,
    #[serde(default)]
    pub reason: String,
}

impl ControlCommand {
    pub fn reload(reason: &str) -> ControlCommand {
        ControlCommand {
            ts: util::now_iso(),
            cmd: "reload".to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Append a command for a running supervisor to pick up.
pub fn append_command(control_dir: &Path, command: &ControlCommand) -> Result<(), EvsError> {
    jsonl::append_jsonl(&control_log_path(control_dir), &serde_json::to_value(command)?)
}

/// Byte-offset cursor over `control.jsonl`.
///
/// EDGE: partial trailing lines (a writer mid-append) are left unconsumed —
/// the cursor only advances past complete, newline-terminated lines, so a
/// command split across two polls is delivered once, whole, on the second.
#[derive(Debug)]
pub struct ControlCursor {
    path: PathBuf,
    offset: u64,
}

impl ControlCursor {
    pub fn new(control_dir: &Path) -> ControlCursor {
        ControlCursor { path: control_log_path(control_dir), offset: 0 }
    }

    /// All complete commands appended since the last poll, in file order.
    ///
    /// WHY: lines that fail JSON decoding are skipped *permanently* (the
    /// offset still advances past them) — re-reading garbage every poll
    /// would turn one corrupt append into an infinite warning loop.
    pub fn poll(&mut self) -> Result<Vec<ControlCommand>, EvsError> {
        let mut file = match std::fs::File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(EvsError::io_at(&self.path, e)),
        };
        file.seek(SeekFrom::Start(self.offset))
            .map_err(|e| EvsError::io_at(&self.path, e))?;
        let mut buffer = String::new();
        file.read_to_string(&mut buffer)
            .map_err(|e| EvsError::io_at(&self.path, e))?;

        let mut commands = Vec::new();
        let mut consumed = 0usize;
        for segment in buffer.split_inclusive('\n') {
            if !segment.ends_with('\n') {
                break;
            }
            consumed += segment.len();
            let trimmed = segment.trim();
            if trimmed.is_empty() {
                continue;
            }
            if let Ok(command) = serde_json::from_str::<ControlCommand>(trimmed) {
                commands.push(command);
            }
        }
        self.offset += consumed as u64;
        Ok(commands)
    }
}
