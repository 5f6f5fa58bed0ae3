//! The supervisor: owns the agent child process and the control channel,
//! and applies pending compactions at the only safe boundary — while the
//! child is stopped between SIGTERM and respawn.
//!
//! # Scheduling model
//!
//! Single-threaded cooperative polling. The loop is the state machine
//! `idle → reload_pending → draining → applying → restarting → idle`,
//! written as straight-line code: each iteration drains new control
//! commands, then either services a pending reload or sleeps one poll
//! interval. There are no background threads; every wait point checks the
//! cancel flag.
//!
//! # Ordering guarantees
//!
//! Reload commands apply in control-log order (the cursor only moves
//! forward). A ready pending-compact plan is applied at most once: it is
//! cleared from the store in the same step that writes the transcript. A
//! plan that stopped matching its source fingerprint is marked stale and
//! skipped — the reload still restarts the child.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use wait_timeout::ChildExt;

use crate::active::{self, ActiveRun};
use crate::control::{self, ControlCursor};
use crate::error::EvsError;
use crate::jsonl::{self, SourceFingerprint};
use crate::ops;
use crate::ops::compact::{CompactOptions, compact};
use crate::paths::EvsPaths;
use crate::pending::{PendingCompact, PendingStatus, PendingStore};
use crate::session::{Agent, Session};
use crate::util::Amount;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadMode {
    Manual,
    Auto,
    Off,
}

impl std::fmt::Display for ReloadMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReloadMode::Manual => write!(f, "manual"),
            ReloadMode::Auto => write!(f, "auto"),
            ReloadMode::Off => write!(f, "off"),
        }
    }
}

impl std::str::FromStr for ReloadMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(ReloadMode::Manual),
            "auto" => Ok(ReloadMode::Auto),
            "off" => Ok(ReloadMode::Off),
            _ => Err(format!("unknown reload mode: {s} (valid: manual, auto, off)")),
        }
    }
}

/// Cooperative cancellation flag, checked at every suspension point.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> CancelToken {
        CancelToken::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct SupervisorConfig {
    pub agent: Agent,
    pub bin: String,
    pub initial_args: Vec<String>,
    /// Arguments that resume an existing session after a restart.
    pub resume_args: Box<dyn Fn(&str) -> Vec<String> + Send>,
    pub env: Vec<(String, String)>,
    pub cwd: Option<PathBuf>,
    pub control_dir: PathBuf,
    pub run_id: String,
    pub reload_mode: ReloadMode,
    pub poll_interval: Duration,
    pub handshake_timeout: Duration,
    pub restart_timeout: Duration,
}

impl SupervisorConfig {
    pub fn new(agent: Agent, bin: &str, control_dir: PathBuf, run_id: &str) -> SupervisorConfig {
        let resume_agent = agent;
        SupervisorConfig {
            agent,
            bin: bin.to_string(),
            initial_args: Vec::new(),
            resume_args: Box::new(move |session_id| match resume_agent {
                Agent::Claude => vec!["--resume".to_string(), session_id.to_string()],
                Agent::Codex => vec!["resume".to_string(), session_id.to_string()],
            }),
            env: Vec::new(),
            cwd: None,
            control_dir,
            run_id: run_id.to_string(),
            reload_mode: ReloadMode::Manual,
            poll_interval: Duration::from_millis(300),
            handshake_timeout: Duration::from_secs(15),
            restart_timeout: Duration::from_secs(10),
        }
    }
}

/// Run the supervisor until the child exits or the token cancels.
/// Returns the exit code to propagate: the child's own code, 1 when the
/// child died on a signal, 127 when it never spawned, 0 on cancel.
pub fn run(
    config: &SupervisorConfig,
    paths: &EvsPaths,
    cancel: &CancelToken,
) -> Result<i32, EvsError> {
    std::fs::create_dir_all(&config.control_dir)
        .map_err(|e| EvsError::io_at(&config.control_dir, e))?;

    let record = ActiveRun::new(
        config.agent,
        &config.run_id,
        config.control_dir.clone(),
        config.cwd.clone().unwrap_or_else(|| PathBuf::from(".")),
        &config.reload_mode.to_string(),
    );
    active::write_record(paths, &record)?;

    let result = supervise(config, paths, cancel);

    active::remove_record(paths, config.agent, &config.run_id)?;
    result
}

fn supervise(
    config: &SupervisorConfig,
    paths: &EvsPaths,
    cancel: &CancelToken,
) -> Result<i32, EvsError> {
    let mut child = match spawn(config, &config.initial_args) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("evs: failed to spawn {}: {e}", config.bin);
            return Ok(127);
        }
    };

    let mut cursor = ControlCursor::new(&config.control_dir);
    let mut reload_pending = false;

    loop {
        if cancel.is_cancelled() {
            stop_child(&mut child, config.restart_timeout);
            return Ok(0);
        }

        // The active child exiting on its own ends the supervision.
        if let Some(status) = child.try_wait().map_err(EvsError::Io)? {
            return Ok(exit_code_of(status));
        }

        // WHY: commands queued while a reload drains collapse into the
        // single pending flag — reload is idempotent, and restarting the
        // child N times for N rapid-fire commands would only churn the
        // user's session.
        for command in cursor.poll()? {
            if command.cmd == "reload" && config.reload_mode != ReloadMode::Off {
                reload_pending = true;
            }
        }

        if reload_pending {
            reload_pending = false;
            match wait_for_handshake(config, cancel) {
                Some(handshake) => {
                    let session_id = handshake.effective_session_id().map(String::from);
                    if let Some(session_id) = &session_id {
                        set_pending_reload(paths, session_id, true);
                    }
                    stop_child(&mut child, config.restart_timeout);

                    if let Some(session_id) = &session_id {
                        // WHY: the plan is applied here and nowhere else —
                        // between stop and respawn is the only moment the
                        // agent cannot be mid-append to the transcript.
                        apply_pending_plan(config, paths, session_id, &handshake);
                        set_pending_reload(paths, session_id, false);
                        match spawn(config, &(config.resume_args)(session_id)) {
                            Ok(c) => child = c,
                            Err(e) => {
                                eprintln!("evs: failed to respawn {}: {e}", config.bin);
                                return Ok(127);
                            }
                        }
                    } else {
                        // No session id: nothing to resume against.
                        match spawn(config, &config.initial_args) {
                            Ok(c) => child = c,
                            Err(e) => {
                                eprintln!("evs: failed to respawn {}: {e}", config.bin);
                                return Ok(127);
                            }
                        }
                    }
                }
                None => {
                    if cancel.is_cancelled() {
                        stop_child(&mut child, config.restart_timeout);
                        return Ok(0);
                    }
                    let timeout = EvsError::SupervisorTimeout(format!(
                        "no handshake for run {} within {:?}",
                        config.run_id, config.handshake_timeout
                    ));
                    eprintln!("evs: reload dropped: {timeout}");
                }
            }
        }

        sleep_cancellable(config.poll_interval, cancel);
    }
}

fn spawn(config: &SupervisorConfig, args: &[String]) -> std::io::Result<std::process::Child> {
    let mut command = std::process::Command::new(&config.bin);
    command.args(args);
    if let Some(cwd) = &config.cwd {
        command.current_dir(cwd);
    }
    for (key, value) in &config.env {
        command.env(key, value);
    }
    command
        .env("EVERSESSION_CONTROL_DIR", &config.control_dir)
        .env("EVERSESSION_RUN_ID", &config.run_id)
        .env("EVERSESSION_RELOAD_MODE", config.reload_mode.to_string());
    command.spawn()
}

/// SIGTERM, bounded wait, then SIGKILL. Never returns before the child is
/// reaped, so a late exit from a previous child can never be confused with
/// the active one.
fn stop_child(child: &mut std::process::Child, restart_timeout: Duration) {
    let pid = child.id() as libc::pid_t;
    unsafe {
        libc::kill(pid, libc::SIGTERM);
    }
    match child.wait_timeout(restart_timeout) {
        Ok(Some(_)) => {}
        _ => {
            unsafe {
                libc::kill(pid, libc::SIGKILL);
            }
            let _ = child.wait();
        }
    }
}

fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    // A signal death has no code; report 1.
    status.code().unwrap_or(1)
}

fn sleep_cancellable(total: Duration, cancel: &CancelToken) {
    let step = Duration::from_millis(25);
    let deadline = Instant::now() + total;
    while Instant::now() < deadline {
        if cancel.is_cancelled() {
            return;
        }
        std::thread::sleep(step.min(deadline.saturating_duration_since(Instant::now())));
    }
}

/// Poll for a handshake carrying our run id and a session identity.
fn wait_for_handshake(
    config: &SupervisorConfig,
    cancel: &CancelToken,
) -> Option<control::Handshake> {
    let deadline = Instant::now() + config.handshake_timeout;
    loop {
        if cancel.is_cancelled() {
            return None;
        }
        if let Ok(Some(handshake)) = control::read_handshake(&config.control_dir) {
            if handshake.run_id == config.run_id && handshake.effective_session_id().is_some() {
                return Some(handshake);
            }
        }
        if Instant::now() >= deadline {
            return None;
        }
        sleep_cancellable(config.poll_interval.min(Duration::from_millis(100)), cancel);
    }
}

/// While the child is stopped: apply a ready plan whose fingerprint still
/// matches, mark it stale otherwise. Failures are logged and never abort
/// the reload — the restart always proceeds.
fn apply_pending_plan(
    config: &SupervisorConfig,
    paths: &EvsPaths,
    session_id: &str,
    handshake: &control::Handshake,
) {
    let store = PendingStore::open(paths, session_id, config.agent);
    let plan = match store.load() {
        Ok(Some(plan)) => plan,
        Ok(None) => return,
        Err(e) => {
            eprintln!("evs: cannot read pending plan for {session_id}: {e}");
            return;
        }
    };
    if plan.status != PendingStatus::Ready {
        return;
    }

    let Some(transcript_path) = handshake.transcript_path.clone() else {
        eprintln!("evs: pending plan for {session_id} skipped: handshake has no transcript path");
        return;
    };

    let current = match SourceFingerprint::capture(&transcript_path) {
        Ok(fp) => fp,
        Err(e) => {
            eprintln!("evs: cannot stat {}: {e}", transcript_path.display());
            return;
        }
    };
    if !plan.is_applicable(&current) {
        let conflict = EvsError::PendingConflict { session_id: session_id.to_string() };
        if let Err(e) = store.mark_stale(plan) {
            eprintln!("evs: cannot mark plan stale for {session_id}: {e}");
        }
        log_apply(paths, session_id, "failed", None, Some(&conflict.to_string()));
        eprintln!("evs: {conflict}, reloading without it");
        return;
    }

    match apply_plan_to_file(&transcript_path, &plan) {
        Ok(Some(tokens_after)) => {
            if let Err(e) = store.clear() {
                eprintln!("evs: plan applied but not cleared for {session_id}: {e}");
            }
            log_apply(paths, session_id, "applied", Some(tokens_after), None);
            eprintln!("evs: applied pending compaction for {session_id}");
        }
        Ok(None) => {
            // Validation worsened: leave a failed record in place.
            let failed = plan.into_failed("post-compact validation worsened".to_string());
            if let Err(e) = store.save(&failed) {
                eprintln!("evs: cannot record failed plan for {session_id}: {e}");
            }
            log_apply(paths, session_id, "failed", None, Some("validation worsened"));
            eprintln!("evs: pending compaction refused for {session_id} (validation worsened)");
        }
        Err(e) => {
            let failed = plan.into_failed(e.to_string());
            if let Err(save_err) = store.save(&failed) {
                eprintln!("evs: cannot record failed plan for {session_id}: {save_err}");
            }
            log_apply(paths, session_id, "failed", None, Some(&e.to_string()));
            eprintln!("evs: pending compaction failed for {session_id}: {e}");
        }
    }
}

/// Run the stored compaction against the transcript. `Ok(None)` means the
/// commit gate refused (validation worsened).
fn apply_plan_to_file(
    transcript_path: &std::path::Path,
    plan: &PendingCompact,
) -> Result<Option<u64>, EvsError> {
    let summary = plan
        .summary
        .clone()
        .ok_or_else(|| EvsError::Other("ready plan has no summary".into()))?;
    let session = Session::load(transcript_path)?;
    let options = CompactOptions {
        amount: Amount::Count(plan.selection.remove_count),
        ..Default::default()
    };
    let rewrite = compact(&session, &options, &summary)?;
    let report = ops::commit(&session, rewrite, false, false)?;
    if report.aborted {
        return Ok(None);
    }
    let after = Session::load(transcript_path)?;
    Ok(Some(crate::tokens::total_tokens(&after)))
}

/// Mirror the reload state into `state.json` for the status line.
fn set_pending_reload(paths: &EvsPaths, session_id: &str, pending: bool) {
    let path = paths.session_state(session_id);
    let mut state = std::fs::read_to_string(&path)
        .ok()
        .and_then(|c| serde_json::from_str::<serde_json::Value>(&c).ok())
        .unwrap_or_else(|| serde_json::json!({}));
    state["pendingReload"] = serde_json::json!(pending);
    state["updatedAt"] = serde_json::json!(crate::util::now_iso());
    let _ = jsonl::write_json_atomic(&path, &state);
}

fn log_apply(
    paths: &EvsPaths,
    session_id: &str,
    result: &str,
    tokens_after: Option<u64>,
    error: Option<&str>,
) {
    let mut entry = serde_json::json!({
        "ts": crate::util::now_iso(),
        "result": result,
    });
    if let Some(t) = tokens_after {
        entry["tokensAfter"] = serde_json::json!(t);
    }
    if let Some(e) = error {
        entry["error"] = serde_json::json!(e);
    }
    let _ = jsonl::append_jsonl(&paths.session_log(session_id), &entry);
}
