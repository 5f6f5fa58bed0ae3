//! CLI entry point.
//!
//! # Architecture overview
//!
//! `main.rs` is the thin coordination layer between the CLI surface and the
//! library crate:
//!
//! 1. Parse arguments (via `clap`)
//! 2. Load `~/.config/eversession/config.toml` and merge: CLI flags win
//! 3. Resolve the target transcript — an explicit path, or discovery from
//!    the working directory
//! 4. Dispatch to the library and map the outcome to the exit-code contract:
//!    0 clean, 1 the operation found or produced errors, 2 invalid
//!    invocation / unknown format / missing session
//!
//! Every mutating subcommand shares one shape: load → operate → commit
//! (re-validate, refuse on worsening, backup, atomic write) → report.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use eversession::config::{self, Config};
use eversession::control::ControlCommand;
use eversession::detect;
use eversession::discover::{self, DiscoverOptions};
use eversession::error::EvsError;
use eversession::fix::FixOptions;
use eversession::ops;
use eversession::ops::compact::CompactOptions;
use eversession::paths::{self, EvsPaths};
use eversession::report::{self, ReportFormat};
use eversession::session::{Agent, Session};
use eversession::summarize::{AgentSummarizer, Summarizer};
use eversession::supervisor::{self, CancelToken, ReloadMode, SupervisorConfig};
use eversession::util::{self, Amount};
use eversession::{active, autocompact, control, hook, status, validate};

#[derive(Parser)]
#[command(name = "evs", about = "Keep AI coding sessions healthy", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Output machine-readable JSON instead of human text
    #[arg(long, global = true)]
    json: bool,

    /// Restrict discovery to one agent
    #[arg(long, global = true)]
    agent: Option<Agent>,
}

#[derive(Subcommand)]
enum Command {
    /// Detect the format of a transcript
    Detect { path: PathBuf },
    /// Validate a transcript and list every invariant violation
    Validate {
        /// Transcript path (omit to discover from the working directory)
        path: Option<PathBuf>,
    },
    /// Apply safe repairs (orphans, thinking order, parent chains)
    Fix {
        path: Option<PathBuf>,
        /// Delete all thinking blocks ("hard" mode)
        #[arg(long)]
        strip_thinking: bool,
        /// Insert synthetic "aborted" outputs for unanswered calls (Agent-X)
        #[arg(long)]
        insert_aborted_outputs: bool,
        /// Write even if validation worsens
        #[arg(long)]
        force: bool,
        /// Show what would change without writing
        #[arg(long)]
        dry_run: bool,
    },
    /// Remove specific lines (tool pairs travel together)
    Remove {
        path: PathBuf,
        /// Comma-separated 1-based line numbers
        #[arg(long, value_delimiter = ',')]
        lines: Vec<usize>,
        /// Also remove whole assistant turns touched by the selection
        #[arg(long)]
        turns: bool,
        #[arg(long)]
        force: bool,
        #[arg(long)]
        dry_run: bool,
    },
    /// Trim the oldest visible messages without a summary
    Trim {
        path: Option<PathBuf>,
        /// "20", "40%", "60k", or "40%t"
        #[arg(long)]
        amount: String,
        /// Reinterpret a count as "keep the last N messages"
        #[arg(long)]
        keep_last: bool,
        #[arg(long)]
        force: bool,
        #[arg(long)]
        dry_run: bool,
    },
    /// Remove entries matching a pattern (tool pairs travel together)
    Clean {
        path: Option<PathBuf>,
        /// Regex matched against raw lines
        #[arg(long = "match")]
        matching: String,
        #[arg(long)]
        force: bool,
        #[arg(long)]
        dry_run: bool,
    },
    /// Replace the oldest visible messages with a summary
    Compact {
        path: Option<PathBuf>,
        #[arg(long)]
        amount: Option<String>,
        #[arg(long)]
        keep_last: bool,
        /// Summary text; omitted → the summariser produces it
        #[arg(long)]
        summary: Option<String>,
        #[arg(long)]
        model: Option<String>,
        /// Agent-X: pin the first N removed payloads into the envelope
        #[arg(long, default_value_t = 0)]
        pin: usize,
        #[arg(long)]
        force: bool,
        #[arg(long)]
        dry_run: bool,
    },
    /// Rewrite a legacy Agent-X rollout into the wrapped format
    Migrate {
        path: PathBuf,
        #[arg(long)]
        force: bool,
        #[arg(long)]
        dry_run: bool,
    },
    /// Check the token threshold and enqueue a compaction plan
    AutoCompact {
        path: Option<PathBuf>,
        #[arg(long)]
        threshold: Option<String>,
        #[arg(long)]
        amount: Option<String>,
        #[arg(long)]
        model: Option<String>,
    },
    /// Supervise an agent process with transparent reload
    Run {
        /// Which agent to spawn
        run_agent: Agent,
        /// Reload mode: manual, auto, or off
        #[arg(long)]
        reload: Option<ReloadMode>,
        /// Arguments passed to the agent binary
        #[arg(last = true)]
        agent_args: Vec<String>,
    },
    /// Ask the running supervisor for this directory to reload
    Reload {
        #[arg(long, default_value = "requested from CLI")]
        reason: String,
    },
    /// Print the one-line session status
    Status { session_id: String },
    /// Drop a queued auto-compact plan for a session
    ClearPending {
        session_id: String,
        /// Which agent's plan to drop
        #[arg(long, default_value = "claude")]
        plan_agent: Agent,
    },
    /// List candidate transcripts for the working directory
    Sessions,
    /// Sweep stale supervisor records and control directories
    Cleanup,
    /// Install the Agent-X notify hook into its config.toml
    InstallHook {
        #[arg(long)]
        force: bool,
    },
    /// Remove the notify hook (only when it is ours)
    UninstallHook,
    /// Internal: invoked by the agent on every turn
    #[command(hide = true)]
    NotifyHook {
        /// Event JSON (stdin when omitted)
        payload: Option<String>,
    },
    /// Create a default config file
    Init,
    /// Get a config value (e.g. `evs get threshold`)
    Get { key: Option<String> },
    /// Set a config value (e.g. `evs set reload auto`)
    Set { key: String, value: String },
    /// Remove a config value
    Unset { key: String },
}

fn main() {
    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("evs: {e}");
            std::process::exit(exit_code_for(&e));
        }
    }
}

fn exit_code_for(error: &EvsError) -> i32 {
    match error {
        EvsError::FormatUnknown(_)
        | EvsError::NoSession(_)
        | EvsError::InvalidSpec(_)
        | EvsError::InvalidAmountMode => 2,
        _ => 1,
    }
}

fn run(cli: Cli) -> Result<i32, EvsError> {
    let format = if cli.json { ReportFormat::Json } else { ReportFormat::Human };
    let config = Config::load();
    let evs_paths = EvsPaths::resolve();

    match cli.command {
        Command::Detect { path } => {
            let detection = detect::detect_path(&path)?;
            Ok(report::print_detection(format, &path, &detection))
        }
        Command::Validate { path } => {
            let path = resolve_path(path, cli.agent, &config, &evs_paths)?;
            let session = Session::load(&path)?;
            let issues = validate::validate(&session);
            Ok(report::print_issues(format, &path, &issues))
        }
        Command::Fix { path, strip_thinking, insert_aborted_outputs, force, dry_run } => {
            let path = resolve_path(path, cli.agent, &config, &evs_paths)?;
            let session = Session::load(&path)?;
            let options = FixOptions {
                strip_thinking_blocks: strip_thinking,
                insert_aborted_outputs,
                ..FixOptions::default()
            };
            let rewrite = eversession::fix::apply(&session, options)?;
            let outcome = ops::commit(&session, rewrite, force, dry_run)?;
            Ok(report::print_commit(format, "fix", &path, &outcome))
        }
        Command::Remove { path, lines, turns, force, dry_run } => {
            let session = Session::load(&path)?;
            let rewrite = ops::remove::remove_lines(&session, &lines, turns);
            let outcome = ops::commit(&session, rewrite, force, dry_run)?;
            Ok(report::print_commit(format, "remove", &path, &outcome))
        }
        Command::Trim { path, amount, keep_last, force, dry_run } => {
            let path = resolve_path(path, cli.agent, &config, &evs_paths)?;
            let session = Session::load(&path)?;
            let amount = util::parse_amount(&amount)?;
            let rewrite = ops::remove::trim(&session, amount, keep_last)?;
            let outcome = ops::commit(&session, rewrite, force, dry_run)?;
            Ok(report::print_commit(format, "trim", &path, &outcome))
        }
        Command::Clean { path, matching, force, dry_run } => {
            let path = resolve_path(path, cli.agent, &config, &evs_paths)?;
            let session = Session::load(&path)?;
            let rewrite = ops::remove::clean_matching(&session, &matching, true)?;
            let outcome = ops::commit(&session, rewrite, force, dry_run)?;
            Ok(report::print_commit(format, "clean", &path, &outcome))
        }
        Command::Compact { path, amount, keep_last, summary, model, pin, force, dry_run } => {
            let path = resolve_path(path, cli.agent, &config, &evs_paths)?;
            let session = Session::load(&path)?;
            let amount = match amount.or_else(|| config.amount.clone()) {
                Some(raw) => util::parse_amount(&raw)?,
                None => Amount::Percent(50),
            };
            let options = CompactOptions { amount, keep_last, pinned_prefix: pin, ..Default::default() };

            let summary_text = match summary {
                Some(text) => text,
                None => {
                    let model = model
                        .or_else(|| config.model.clone())
                        .unwrap_or_else(|| "claude-haiku-4-5".to_string());
                    let summarizer = AgentSummarizer { bin: config.claude_bin() };
                    let visible = eversession::tokens::visible_message_tokens(&session);
                    let count = ops::remove::resolve_remove_count(&visible, amount, keep_last);
                    let texts: Vec<String> = visible
                        .iter()
                        .take(count)
                        .filter_map(|m| session.transcript().entry(m.line))
                        .map(eversession::tokens::claude_resume_text)
                        .collect();
                    summarizer.summarize(&texts, &model, 2000)?.text
                }
            };

            let rewrite = ops::compact::compact(&session, &options, &summary_text)?;
            let outcome = ops::commit(&session, rewrite, force, dry_run)?;
            Ok(report::print_commit(format, "compact", &path, &outcome))
        }
        Command::Migrate { path, force, dry_run } => {
            let session = Session::load(&path)?;
            let rewrite = ops::migrate::migrate_legacy_to_wrapped(&session)?;
            let outcome = ops::commit(&session, rewrite, force, dry_run)?;
            Ok(report::print_commit(format, "migrate", &path, &outcome))
        }
        Command::AutoCompact { path, threshold, amount, model } => {
            let path = resolve_path(path, cli.agent, &config, &evs_paths)?;
            let session = Session::load(&path)?;

            let amount_raw = amount
                .or_else(|| config.amount.clone())
                .unwrap_or_else(|| "50%".to_string());
            let threshold_raw = threshold
                .or_else(|| config.threshold.clone())
                .unwrap_or_else(|| "80%".to_string());
            let engine_config = autocompact::AutoCompactConfig {
                threshold: util::parse_threshold(&threshold_raw)?,
                amount: util::parse_amount(&amount_raw)?,
                amount_raw,
                context_window: config
                    .context_window
                    .unwrap_or(autocompact::DEFAULT_CONTEXT_WINDOW),
                model: model
                    .or_else(|| config.model.clone())
                    .unwrap_or_else(|| "claude-haiku-4-5".to_string()),
                busy_timeout: autocompact::DEFAULT_BUSY_TIMEOUT,
            };
            let summarizer = AgentSummarizer { bin: config.claude_bin() };
            let outcome = autocompact::run(&session, &evs_paths, &engine_config, &summarizer)?;
            println!("{}", outcome.result());
            Ok(match outcome {
                autocompact::Outcome::Failed { .. } => 1,
                _ => 0,
            })
        }
        Command::Run { run_agent, reload, agent_args } => {
            let reload_mode = match reload {
                Some(mode) => mode,
                None => config
                    .reload
                    .as_deref()
                    .map(|s| s.parse())
                    .transpose()
                    .map_err(EvsError::Other)?
                    .unwrap_or(ReloadMode::Manual),
            };
            let bin = match run_agent {
                Agent::Claude => config.claude_bin(),
                Agent::Codex => config.codex_bin(),
            };
            let run_id = uuid::Uuid::new_v4().to_string();
            let control_dir = evs_paths.control_dir(run_agent, &run_id);
            let mut sup = SupervisorConfig::new(run_agent, &bin, control_dir, &run_id);
            sup.initial_args = agent_args;
            sup.reload_mode = reload_mode;
            sup.cwd = std::env::current_dir().ok();
            let code = supervisor::run(&sup, &evs_paths, &CancelToken::new())?;
            Ok(code)
        }
        Command::Reload { reason } => {
            let cwd = current_dir()?;
            let mut sent = 0usize;
            for (_, record) in active::list_records(&evs_paths)? {
                if record.cwd != cwd || !active::pid_alive(record.pid) {
                    continue;
                }
                control::append_command(&record.control_dir, &ControlCommand::reload(&reason))?;
                println!("reload sent to {}-{}", record.agent, record.run_id);
                sent += 1;
            }
            if sent == 0 {
                return Err(EvsError::NoSession(format!(
                    "no active supervisor for {}",
                    cwd.display()
                )));
            }
            Ok(0)
        }
        Command::Status { session_id } => {
            println!("{}", status::render_status_line(&evs_paths, &session_id)?);
            Ok(0)
        }
        Command::ClearPending { session_id, plan_agent } => {
            let store = eversession::pending::PendingStore::open(&evs_paths, &session_id, plan_agent);
            if store.load()?.is_some() {
                store.clear()?;
                println!("cleared pending plan for {session_id}");
            } else {
                println!("no pending plan for {session_id}");
            }
            Ok(0)
        }
        Command::Sessions => {
            let cwd = current_dir()?;
            let cwd_str = cwd.to_string_lossy().to_string();
            let options = discover_options(&config);
            let mut found = false;
            if cli.agent != Some(Agent::Codex) {
                if let Some(d) = discover::discover_claude(&cwd_str, &options)? {
                    print_discovery(&d);
                    found = true;
                }
            }
            if cli.agent != Some(Agent::Claude) {
                if let Some(d) = discover::discover_codex(&cwd_str, &options, &evs_paths)? {
                    print_discovery(&d);
                    found = true;
                }
            }
            if !found {
                eprintln!("no sessions found for {}", cwd.display());
                return Ok(1);
            }
            Ok(0)
        }
        Command::Cleanup => {
            let removed = active::cleanup(&evs_paths)?;
            if removed.is_empty() {
                println!("nothing to clean up");
            } else {
                for run_id in &removed {
                    println!("removed stale run {run_id}");
                }
            }
            Ok(0)
        }
        Command::InstallHook { force } => {
            let home = home_dir()?;
            let config_path = paths::codex_config_path(&home);
            if hook::install_notify_hook(&config_path, force)? {
                println!("notify hook installed in {}", config_path.display());
            } else {
                println!("notify hook already installed");
            }
            Ok(0)
        }
        Command::UninstallHook => {
            let home = home_dir()?;
            let config_path = paths::codex_config_path(&home);
            if hook::uninstall_notify_hook(&config_path)? {
                println!("notify hook removed from {}", config_path.display());
            } else {
                println!("no eversession notify hook found");
            }
            Ok(0)
        }
        Command::NotifyHook { payload } => {
            let payload = match payload {
                Some(p) => p,
                None => {
                    use std::io::Read;
                    let mut buffer = String::new();
                    std::io::stdin().read_to_string(&mut buffer)?;
                    buffer
                }
            };
            let control_dir = std::env::var("EVERSESSION_CONTROL_DIR").ok().map(PathBuf::from);
            let run_id = std::env::var("EVERSESSION_RUN_ID").ok();
            hook::handle_notify(&evs_paths, &payload, control_dir.as_deref(), run_id.as_deref())?;
            Ok(0)
        }
        Command::Init => {
            config::init()?;
            Ok(0)
        }
        Command::Get { key } => {
            match key {
                Some(k) => config::get_value(&k)?,
                None => config::list_values()?,
            }
            Ok(0)
        }
        Command::Set { key, value } => {
            config::set_value(&key, &value)?;
            Ok(0)
        }
        Command::Unset { key } => {
            config::unset_value(&key)?;
            Ok(0)
        }
    }
}

fn current_dir() -> Result<PathBuf, EvsError> {
    std::env::current_dir().map_err(EvsError::Io)
}

fn home_dir() -> Result<PathBuf, EvsError> {
    dirs::home_dir().ok_or_else(|| EvsError::Other("cannot determine home directory".into()))
}

fn discover_options(config: &Config) -> DiscoverOptions {
    let mut options = DiscoverOptions::default();
    if let Some(days) = config.lookback_days {
        options.lookback_days = days;
    }
    options
}

/// An explicit path wins; otherwise discover from the working directory,
/// preferring Agent-C unless `--agent codex` narrowed it.
fn resolve_path(
    path: Option<PathBuf>,
    agent: Option<Agent>,
    config: &Config,
    evs_paths: &EvsPaths,
) -> Result<PathBuf, EvsError> {
    if let Some(path) = path {
        if !path.exists() {
            return Err(EvsError::NoSession(path.display().to_string()));
        }
        return Ok(path);
    }
    let cwd = current_dir()?;
    let cwd_str = cwd.to_string_lossy().to_string();
    let options = discover_options(config);

    if agent != Some(Agent::Codex) {
        if let Some(d) = discover::discover_claude(&cwd_str, &options)? {
            eprintln!(
                "using {} ({:?} confidence)",
                d.candidate.path.display(),
                d.confidence
            );
            return Ok(d.candidate.path);
        }
    }
    if agent != Some(Agent::Claude) {
        if let Some(d) = discover::discover_codex(&cwd_str, &options, evs_paths)? {
            eprintln!(
                "using {} ({:?} confidence)",
                d.candidate.path.display(),
                d.confidence
            );
            return Ok(d.candidate.path);
        }
    }
    Err(EvsError::NoSession(cwd.display().to_string()))
}

fn print_discovery(d: &discover::Discovery) {
    println!(
        "{}\t{}\t{:?}\tscore {}{}",
        d.candidate.agent,
        d.candidate.path.display(),
        d.confidence,
        d.candidate.score,
        d.candidate
            .session_id
            .as_deref()
            .map(|s| format!("\tsession {s}"))
            .unwrap_or_default(),
    );
}
