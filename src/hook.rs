//! The Agent-X notify hook: installation into the agent's own config file,
//! and the handler that runs on every turn event.
//!
//! The hook closes two loops:
//!
//! 1. It records `cwd → thread-id` in the global state file, which makes
//!    discovery authoritative for Agent-X (the rollout date tree alone
//!    cannot tell which thread is *current* for a directory).
//! 2. When spawned under a supervisor (the control-dir environment variables
//!    are set), it writes the handshake the supervisor needs before it can
//!    restart-and-resume.

use std::path::{Path, PathBuf};

use serde_json::Value;
use toml_edit::DocumentMut;

use crate::control::{self, Handshake};
use crate::discover;
use crate::error::EvsError;
use crate::paths::EvsPaths;
use crate::util;

/// The notify value the installer writes: `notify = ["evs", "notify-hook"]`.
const HOOK_COMMAND: [&str; 2] = ["evs", "notify-hook"];

/// Install the notify hook into the Agent-X config at `config_path`.
///
/// Refuses to overwrite a foreign `notify` value unless `force` is set — a
/// user's own notify script must not be clobbered silently.
pub fn install_notify_hook(config_path: &Path, force: bool) -> Result<bool, EvsError> {
    let content = match std::fs::read_to_string(config_path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(EvsError::io_at(config_path, e)),
    };
    let mut doc: DocumentMut = content
        .parse()
        .map_err(|e| EvsError::Other(format!("failed to parse {}: {e}", config_path.display())))?;

    match doc.get("notify") {
        Some(existing) if is_evs_hook(existing) => return Ok(false),
        Some(existing) if !force => {
            return Err(EvsError::Other(format!(
                "notify is already set to {} — pass --force to replace it",
                existing.to_string().trim()
            )));
        }
        _ => {}
    }

    let mut array = toml_edit::Array::new();
    for part in HOOK_COMMAND {
        array.push(part);
    }
    doc.insert("notify", toml_edit::Item::Value(toml_edit::Value::Array(array)));

    if let Some(parent) = config_path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| EvsError::io_at(parent, e))?;
    }
    std::fs::write(config_path, doc.to_string()).map_err(|e| EvsError::io_at(config_path, e))?;
    Ok(true)
}

/// Remove the hook if (and only if) it is ours.
pub fn uninstall_notify_hook(config_path: &Path) -> Result<bool, EvsError> {
    let content = match std::fs::read_to_string(config_path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(EvsError::io_at(config_path, e)),
    };
    let mut doc: DocumentMut = content
        .parse()
        .map_err(|e| EvsError::Other(format!("failed to parse {}: {e}", config_path.display())))?;

    let ours = doc.get("notify").is_some_and(is_evs_hook);
    if !ours {
        return Ok(false);
    }
    doc.remove("notify");
    std::fs::write(config_path, doc.to_string()).map_err(|e| EvsError::io_at(config_path, e))?;
    Ok(true)
}

fn is_evs_hook(item: &toml_edit::Item) -> bool {
    let Some(array) = item.as_array() else { return false };
    let parts: Vec<&str> = array.iter().filter_map(|v| v.as_str()).collect();
    // EDGE: only the leading binary name is compared, so an older install
    // with different subcommand arguments is still recognized as ours and
    // upgraded in place rather than refused.
    parts.first() == Some(&HOOK_COMMAND[0])
}

/// Handle one notify event. `payload` is the JSON the agent passed; the
/// control-dir variables come from the supervisor's augmented environment
/// (absent when the agent runs unsupervised).
pub fn handle_notify(
    paths: &EvsPaths,
    payload: &str,
    control_dir: Option<&Path>,
    run_id: Option<&str>,
) -> Result<(), EvsError> {
    let Ok(event) = serde_json::from_str::<Value>(payload) else {
        // WHY: malformed events are dropped, not errored — the agent treats
        // a failing notify command as its own problem, and eversession must
        // never be the reason a turn errors out.
        return Ok(());
    };

    let cwd = string_field(&event, &["cwd", "workdir"]);
    let thread_id = string_field(&event, &["thread-id", "thread_id", "threadId", "session-id", "session_id", "sessionId"]);
    let turn_id = string_field(&event, &["turn-id", "turn_id", "turnId"]);
    let transcript = string_field(&event, &["transcript_path", "transcriptPath", "rollout-path", "rollout_path"]);

    if let (Some(cwd), Some(thread_id)) = (&cwd, &thread_id) {
        discover::update_codex_state(paths, cwd, thread_id, turn_id.as_deref())?;
    }

    if let (Some(control_dir), Some(run_id)) = (control_dir, run_id) {
        if let Some(thread_id) = &thread_id {
            control::write_handshake(
                control_dir,
                &Handshake {
                    run_id: run_id.to_string(),
                    session_id: None,
                    thread_id: Some(thread_id.clone()),
                    transcript_path: transcript.map(PathBuf::from),
                    cwd,
                    ts: Some(util::now_iso()),
                },
            )?;
        }
    }
    Ok(())
}

fn string_field(event: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|k| event.get(k).and_then(|v| v.as_str()))
        .map(String::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_install_into_missing_config() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        assert!(install_notify_hook(&path, false).unwrap());
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("notify"));
        assert!(content.contains("\"evs\""));
        assert!(content.contains("\"notify-hook\""));
    }

    #[test]
    fn test_install_preserves_existing_keys_and_comments() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "# my settings\nmodel = \"o3\"\n").unwrap();
        install_notify_hook(&path, false).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("# my settings"));
        assert!(content.contains("model = \"o3\""));
        assert!(content.contains("notify"));
    }

    #[test]
    fn test_install_is_idempotent() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        assert!(install_notify_hook(&path, false).unwrap());
        assert!(!install_notify_hook(&path, false).unwrap(), "already ours");
    }

    #[test]
    fn test_install_refuses_foreign_value_without_force() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "notify = [\"my-script\"]\n").unwrap();
        assert!(install_notify_hook(&path, false).is_err());
        assert!(install_notify_hook(&path, true).unwrap());
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(!content.contains("my-script"));
    }

    #[test]
    fn test_uninstall_only_removes_ours() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "notify = [\"my-script\"]\n").unwrap();
        assert!(!uninstall_notify_hook(&path).unwrap());
        assert!(std::fs::read_to_string(&path).unwrap().contains("my-script"));

        install_notify_hook(&path, true).unwrap();
        assert!(uninstall_notify_hook(&path).unwrap());
        assert!(!std::fs::read_to_string(&path).unwrap().contains("notify"));
    }

    #[test]
    fn test_notify_updates_state_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let paths = EvsPaths::at(dir.path());
        let payload = r#"{"type":"agent-turn-complete","cwd":"/work/app","thread-id":"t1","turn-id":"turn-3"}"#;
        handle_notify(&paths, payload, None, None).unwrap();

        let entry = discover::lookup_codex_state(&paths, "/work/app").unwrap().unwrap();
        assert_eq!(entry.thread_id, "t1");
        assert_eq!(entry.turn_id.as_deref(), Some("turn-3"));
    }

    #[test]
    fn test_notify_writes_handshake_under_supervisor() {
        let dir = tempfile::TempDir::new().unwrap();
        let paths = EvsPaths::at(dir.path().join("evs"));
        let control_dir = dir.path().join("control");
        std::fs::create_dir_all(&control_dir).unwrap();

        let payload = r#"{"cwd":"/work/app","thread-id":"t1","rollout-path":"/tmp/r.jsonl"}"#;
        handle_notify(&paths, payload, Some(&control_dir), Some("run-7")).unwrap();

        let hs = control::read_handshake(&control_dir).unwrap().unwrap();
        assert_eq!(hs.run_id, "run-7");
        assert_eq!(hs.effective_session_id(), Some("t1"));
        assert_eq!(hs.transcript_path.as_deref(), Some(Path::new("/tmp/r.jsonl")));
    }

    #[test]
    fn test_notify_tolerates_garbage() {
        let dir = tempfile::TempDir::new().unwrap();
        let paths = EvsPaths::at(dir.path());
        handle_notify(&paths, "not json", None, None).unwrap();
        handle_notify(&paths, "{}", None, None).unwrap();
    }
}
