//! Filesystem layout: every persistent location the crate touches is
//! computed here from a single root.
//!
//! # Architecture overview
//!
//! There is no process-global mutable state anywhere in eversession; every
//! persistent bit is a named file with atomic-replace semantics. This module
//! is the one place that knows where those files live:
//!
//! ```text
//! <root>/sessions/<id>/log.jsonl            auto-compact audit log
//! <root>/sessions/<id>/state.json           latest tokens, pendingReload
//! <root>/sessions/<id>/pending-compact.<agent>.json
//! <root>/sessions/<id>/lock                 rewrite lock
//! <root>/active/<agent>-<run-id>.json       supervised-run records
//! <root>/codex-state.json                   cwd → thread-id map
//! <root>/pins.json                          user bookmarks (external tools)
//! ```
//!
//! The root defaults to `~/.eversession` and can be redirected with the
//! `EVERSESSION_ROOT` environment variable. Tests construct an `EvsPaths`
//! directly against a temp directory instead of touching the environment.

use std::path::{Path, PathBuf};

use crate::session::Agent;

/// Resolved locations for all out-of-band state.
#[derive(Debug, Clone)]
pub struct EvsPaths {
    root: PathBuf,
}

impl EvsPaths {
    /// Resolve the default root: `$EVERSESSION_ROOT`, else `~/.eversession`.
    pub fn resolve() -> EvsPaths {
        if let Ok(root) = std::env::var("EVERSESSION_ROOT") {
            if !root.is_empty() {
                return EvsPaths { root: PathBuf::from(root) };
            }
        }
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        EvsPaths { root: home.join(".eversession") }
    }

    /// Root at an explicit directory. Test entry point.
    pub fn at(root: impl Into<PathBuf>) -> EvsPaths {
        EvsPaths { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn session_dir(&self, session_id: &str) -> PathBuf {
        self.root.join("sessions").join(session_id)
    }

    pub fn session_log(&self, session_id: &str) -> PathBuf {
        self.session_dir(session_id).join("log.jsonl")
    }

    pub fn session_state(&self, session_id: &str) -> PathBuf {
        self.session_dir(session_id).join("state.json")
    }

    pub fn session_lock(&self, session_id: &str) -> PathBuf {
        self.session_dir(session_id).join("lock")
    }

    pub fn pending_compact(&self, session_id: &str, agent: Agent) -> PathBuf {
        self.session_dir(session_id)
            .join(format!("pending-compact.{agent}.json"))
    }

    pub fn active_dir(&self) -> PathBuf {
        self.root.join("active")
    }

    pub fn active_record(&self, agent: Agent, run_id: &str) -> PathBuf {
        self.active_dir().join(format!("{agent}-{run_id}.json"))
    }

    pub fn codex_state(&self) -> PathBuf {
        self.root.join("codex-state.json")
    }

    pub fn pins(&self) -> PathBuf {
        self.root.join("pins.json")
    }

    /// Control directory for a supervised run: `<tmp>/evs-<agent>/<run-id>`.
    pub fn control_dir(&self, agent: Agent, run_id: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("evs-{agent}"))
            .join(run_id)
    }
}

/// Default Agent-C transcript root: `~/.claude/projects`.
pub fn claude_projects_root(home: &Path) -> PathBuf {
    home.join(".claude").join("projects")
}

/// Default Agent-X rollout root: `~/.codex/sessions`.
pub fn codex_sessions_root(home: &Path) -> PathBuf {
    home.join(".codex").join("sessions")
}

/// Agent-X config file, edited by the notify-hook installer.
pub fn codex_config_path(home: &Path) -> PathBuf {
    home.join(".codex").join("config.toml")
}

/// The two historical spellings of the Agent-C project-directory name.
///
/// The agent derives the directory from the working directory by replacing
/// `/` with `-`; newer versions additionally replace `.`.
///
/// WHY: both spellings coexist on disk — a project used across agent
/// versions has sessions split between the two directories — so discovery
/// must enumerate both or it silently loses half the history.
pub fn claude_cwd_dir_names(cwd: &str) -> Vec<String> {
    let slash_only = cwd.replace('/', "-");
    let slash_and_dot = slash_only.replace('.', "-");
    if slash_and_dot == slash_only {
        vec![slash_only]
    } else {
        vec![slash_and_dot, slash_only]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_paths_under_root() {
        let p = EvsPaths::at("/tmp/evs-root");
        assert_eq!(
            p.session_log("s1"),
            PathBuf::from("/tmp/evs-root/sessions/s1/log.jsonl")
        );
        assert_eq!(
            p.pending_compact("s1", Agent::Claude),
            PathBuf::from("/tmp/evs-root/sessions/s1/pending-compact.claude.json")
        );
        assert_eq!(
            p.active_record(Agent::Codex, "r1"),
            PathBuf::from("/tmp/evs-root/active/codex-r1.json")
        );
    }

    #[test]
    fn test_cwd_dir_names_without_dot() {
        let names = claude_cwd_dir_names("/home/user/proj");
        assert_eq!(names, vec!["-home-user-proj"]);
    }

    #[test]
    fn test_cwd_dir_names_with_dot() {
        let names = claude_cwd_dir_names("/home/user/my.app");
        assert_eq!(names, vec!["-home-user-my-app", "-home-user-my.app"]);
    }
}
