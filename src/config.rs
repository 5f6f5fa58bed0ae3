//! Configuration loading and management.
//!
//! # Architecture overview
//!
//! Configuration lives in `~/.config/eversession/config.toml` and is purely
//! optional: every option has a built-in default, so the tool works with no
//! setup. Values flow in through two paths:
//!
//! 1. **`Config::load()`** — used at runtime to fill defaults before the CLI
//!    flags are merged on top.
//! 2. **`get_value` / `set_value` / `unset_value`** — the `evs get/set/unset`
//!    subcommands, which edit the live file.
//!
//! The editable surface is a closed registry (`KNOWN_KEYS`): every key the
//! schema accepts, with the value shape it requires. `set` validates both
//! the key and the value before writing, so a typo like `evs set treshold
//! 80%` or `evs set reload sometimes` fails at the command instead of being
//! written and silently ignored by `Config::load()` forever after. The
//! schema is at most one table deep (`claude.bin`, `codex.sessions`), which
//! keeps lookup a single split rather than a tree walk.
//!
//! # TRADE-OFFS
//!
//! `toml_edit` handles the mutations instead of plain `toml` because it
//! preserves comments and formatting in the user's file. Two TOML crates is
//! the price of not destroying hand-written config comments.

use std::path::PathBuf;

use serde::Deserialize;
use toml_edit::DocumentMut;

use crate::error::EvsError;
use crate::supervisor::ReloadMode;
use crate::util;

/// Per-agent overrides from the `[claude]` / `[codex]` tables.
#[derive(Debug, Default, Deserialize)]
pub struct AgentConfig {
    /// Binary to spawn; defaults to the agent's own name.
    pub bin: Option<String>,
    /// Override for the transcript root directory.
    pub sessions: Option<String>,
}

/// Top-level config deserialized from `~/.config/eversession/config.toml`.
///
/// All fields are optional; a single-key file is valid and common. A missing
/// or unparseable file silently degrades to defaults — eversession must keep
/// working when a user has broken their own config.
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    /// Auto-compact trigger: `"140k"` or `"80%"` of the context window.
    pub threshold: Option<String>,
    /// Auto-compact amount: `"50%"`, `"20"`, `"40%t"`.
    pub amount: Option<String>,
    /// Model passed to the summariser.
    pub model: Option<String>,
    /// Context window used to resolve percent thresholds.
    pub context_window: Option<u64>,
    /// Supervisor reload mode: `"manual"`, `"auto"`, or `"off"`.
    pub reload: Option<String>,
    /// How many days of Agent-X rollouts discovery scans.
    pub lookback_days: Option<u32>,
    #[serde(default)]
    pub claude: AgentConfig,
    #[serde(default)]
    pub codex: AgentConfig,
}

impl Config {
    pub fn load() -> Config {
        let Ok(path) = config_path() else {
            return Config::default();
        };
        let Ok(content) = std::fs::read_to_string(&path) else {
            return Config::default();
        };
        toml::from_str(&content).unwrap_or_default()
    }

    pub fn claude_bin(&self) -> String {
        self.claude.bin.clone().unwrap_or_else(|| "claude".to_string())
    }

    pub fn codex_bin(&self) -> String {
        self.codex.bin.clone().unwrap_or_else(|| "codex".to_string())
    }
}

// ── Key registry ─────────────────────────────────────────────────────────────

/// Value shape a config key requires. `set` parses the raw CLI string
/// through the matching validator before anything is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyKind {
    /// Free-form string (model names, binary paths).
    Text,
    /// An amount spec: `"50%"`, `"20"`, `"60k"`, `"40%t"`.
    AmountSpec,
    /// A threshold spec: `"140k"` or `"80%"`.
    ThresholdSpec,
    /// One of the supervisor reload modes.
    ReloadModeName,
    /// A positive integer.
    Integer,
}

/// Every key the schema accepts, in display order: `(key, kind, comment)`.
/// The comment doubles as the template annotation written by `init`.
const KNOWN_KEYS: &[(&str, KeyKind, &str)] = &[
    ("threshold", KeyKind::ThresholdSpec, "auto-compact trigger: absolute tokens (\"140k\") or percent of the context window (\"80%\")"),
    ("amount", KeyKind::AmountSpec, "how much to compact away: messages (\"20\"), percent (\"50%\"), tokens (\"60k\"), or percent of tokens (\"40%t\")"),
    ("model", KeyKind::Text, "model passed to the summariser"),
    ("context_window", KeyKind::Integer, "context window used to resolve percent thresholds"),
    ("reload", KeyKind::ReloadModeName, "supervisor reload mode: \"manual\", \"auto\", or \"off\""),
    ("lookback_days", KeyKind::Integer, "how many days of rollouts discovery scans"),
    ("claude.bin", KeyKind::Text, "binary to spawn for this agent"),
    ("claude.sessions", KeyKind::Text, "transcript root override"),
    ("codex.bin", KeyKind::Text, "binary to spawn for this agent"),
    ("codex.sessions", KeyKind::Text, "rollout root override"),
];

fn kind_of(key: &str) -> Result<KeyKind, EvsError> {
    KNOWN_KEYS
        .iter()
        .find(|(name, _, _)| *name == key)
        .map(|(_, kind, _)| *kind)
        .ok_or_else(|| {
            let names: Vec<&str> = KNOWN_KEYS.iter().map(|(name, _, _)| *name).collect();
            EvsError::Other(format!("unknown key: {key} (known: {})", names.join(", ")))
        })
}

/// Validate a raw CLI string against the key's kind and produce the TOML
/// value to store.
///
/// WHY: parsing through the same spec parsers the runtime uses means a value
/// that `set` accepts is guaranteed to be usable later — there is no second,
/// looser grammar to drift out of sync.
fn parse_typed(kind: KeyKind, raw: &str) -> Result<toml_edit::Value, EvsError> {
    match kind {
        KeyKind::Text => Ok(toml_edit::Value::from(raw)),
        KeyKind::AmountSpec => {
            util::parse_amount(raw)?;
            Ok(toml_edit::Value::from(raw))
        }
        KeyKind::ThresholdSpec => {
            util::parse_threshold(raw)?;
            Ok(toml_edit::Value::from(raw))
        }
        KeyKind::ReloadModeName => {
            raw.parse::<ReloadMode>().map_err(EvsError::Other)?;
            Ok(toml_edit::Value::from(raw))
        }
        KeyKind::Integer => {
            let n: i64 = raw
                .parse()
                .map_err(|_| EvsError::Other(format!("expected an integer, got {raw}")))?;
            Ok(toml_edit::Value::from(n))
        }
    }
}

/// Split a registry key into its table/field coordinates. The schema is at
/// most one level deep, so this is a plain `split_once`, not a path walk.
fn coordinates(key: &str) -> (Option<&str>, &str) {
    match key.split_once('.') {
        Some((table, field)) => (Some(table), field),
        None => (None, key),
    }
}

fn lookup<'a>(doc: &'a DocumentMut, key: &str) -> Option<&'a toml_edit::Value> {
    let (table, field) = coordinates(key);
    let item = match table {
        Some(t) => doc.get(t)?.as_table()?.get(field)?,
        None => doc.get(field)?,
    };
    item.as_value()
}

/// Render a stored value for display. Strings print bare — `evs get model`
/// answers with the model name, not a quoted TOML literal.
fn render(value: &toml_edit::Value) -> String {
    match value {
        toml_edit::Value::String(s) => s.value().clone(),
        other => other.to_string().trim().to_string(),
    }
}

// ── Subcommands ──────────────────────────────────────────────────────────────

/// Print one config value (`evs get threshold`). Unknown keys and unset
/// keys both error, with different messages — a typo should not read as
/// "not configured".
pub fn get_value(key: &str) -> Result<(), EvsError> {
    kind_of(key)?;
    let doc = load_document()?;
    match lookup(&doc, key) {
        Some(value) => {
            println!("{}", render(value));
            Ok(())
        }
        None => Err(EvsError::Other(format!("{key} is not set"))),
    }
}

/// Write one config value (`evs set reload auto`), validating key and value
/// first. Creates the file and the agent table as needed.
pub fn set_value(key: &str, value: &str) -> Result<(), EvsError> {
    let kind = kind_of(key)?;
    let typed = parse_typed(kind, value)?;

    let mut doc = load_document_or_empty()?;
    let (table, field) = coordinates(key);
    match table {
        None => {
            doc.insert(field, toml_edit::Item::Value(typed));
        }
        Some(table) => {
            if doc.get(table).is_none_or(|item| !item.is_table()) {
                doc.insert(table, toml_edit::Item::Table(toml_edit::Table::new()));
            }
            if let Some(t) = doc.get_mut(table).and_then(|item| item.as_table_mut()) {
                t.insert(field, toml_edit::Item::Value(typed));
            }
        }
    }
    store_document(&doc)
}

/// Remove one config value. Errors when the key is unknown or not set, so
/// typos get feedback instead of silent success.
pub fn unset_value(key: &str) -> Result<(), EvsError> {
    kind_of(key)?;
    let mut doc = load_document()?;
    let (table, field) = coordinates(key);

    let removed = match table {
        None => doc.remove(field).is_some(),
        Some(table) => {
            let mut removed = false;
            let mut table_empty = false;
            if let Some(t) = doc.get_mut(table).and_then(|item| item.as_table_mut()) {
                removed = t.remove(field).is_some();
                table_empty = t.is_empty();
            }
            // An agent table with nothing left in it is noise.
            if removed && table_empty {
                doc.remove(table);
            }
            removed
        }
    };
    if !removed {
        return Err(EvsError::Other(format!("{key} is not set")));
    }
    store_document(&doc)
}

/// Print every set value as `key = value` lines, in registry order, ready
/// to paste back into `evs set`.
///
/// EDGE: keys a user wrote by hand that are not in the registry are
/// skipped — `Config::load()` ignores them too, so listing them would
/// suggest they do something.
pub fn list_values() -> Result<(), EvsError> {
    let doc = load_document()?;
    let mut any = false;
    for (key, _, _) in KNOWN_KEYS {
        if let Some(value) = lookup(&doc, key) {
            println!("{key} = {}", render(value));
            any = true;
        }
    }
    if !any {
        eprintln!("No config values set.");
    }
    Ok(())
}

/// Write the default config template. Errors if the file already exists.
pub fn init() -> Result<(), EvsError> {
    let path = config_path()?;
    if path.exists() {
        return Err(EvsError::Other(format!(
            "config file already exists: {}",
            path.display()
        )));
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&path, render_template())?;

    eprintln!("Created config file: {}", path.display());
    eprintln!();
    eprintln!("Edit it directly, or use:");
    eprintln!("  evs set threshold 80%");
    eprintln!("  evs set reload auto");
    eprintln!("  evs get");
    Ok(())
}

/// The `init` template, generated from the registry so it can never list a
/// key the schema does not accept. Everything is commented out: the file
/// documents what exists without changing any behavior.
fn render_template() -> String {
    let mut out = String::from("# eversession configuration\n# See: evs --help\n");
    let mut current_table: Option<&str> = None;
    for (key, _, comment) in KNOWN_KEYS {
        let (table, field) = coordinates(key);
        if table != current_table {
            if let Some(t) = table {
                out.push_str(&format!("\n[{t}]\n"));
            }
            current_table = table;
        }
        if table.is_none() {
            out.push('\n');
        }
        out.push_str(&format!("# {comment}\n# {field} = ...\n"));
    }
    out
}

// ── File access ──────────────────────────────────────────────────────────────

fn config_path() -> Result<PathBuf, EvsError> {
    if let Ok(path) = std::env::var("EVERSESSION_CONFIG") {
        if !path.is_empty() {
            return Ok(PathBuf::from(path));
        }
    }
    let home = dirs::home_dir()
        .ok_or_else(|| EvsError::Other("cannot determine home directory".into()))?;
    Ok(home.join(".config/eversession/config.toml"))
}

fn load_document() -> Result<DocumentMut, EvsError> {
    let path = config_path()?;
    let content = std::fs::read_to_string(&path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            EvsError::Other(format!("config file not found: {}", path.display()))
        } else {
            EvsError::Io(e)
        }
    })?;
    content
        .parse()
        .map_err(|e| EvsError::Other(format!("failed to parse config: {e}")))
}

fn load_document_or_empty() -> Result<DocumentMut, EvsError> {
    let path = config_path()?;
    match std::fs::read_to_string(&path) {
        Ok(content) => content
            .parse()
            .map_err(|e| EvsError::Other(format!("failed to parse config: {e}"))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(DocumentMut::new()),
        Err(e) => Err(EvsError::io_at(path, e)),
    }
}

fn store_document(doc: &DocumentMut) -> Result<(), EvsError> {
    let path = config_path()?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&path, doc.to_string())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_of_rejects_unknown_keys() {
        assert!(kind_of("threshold").is_ok());
        assert!(kind_of("claude.bin").is_ok());
        let err = kind_of("treshold").unwrap_err().to_string();
        assert!(err.contains("unknown key"));
        assert!(err.contains("threshold"), "hint lists the real keys");
    }

    #[test]
    fn test_parse_typed_validates_specs() {
        assert!(parse_typed(KeyKind::ThresholdSpec, "80%").is_ok());
        assert!(parse_typed(KeyKind::ThresholdSpec, "140k").is_ok());
        assert!(parse_typed(KeyKind::ThresholdSpec, "often").is_err());

        assert!(parse_typed(KeyKind::AmountSpec, "40%t").is_ok());
        assert!(parse_typed(KeyKind::AmountSpec, "a lot").is_err());

        assert!(parse_typed(KeyKind::ReloadModeName, "auto").is_ok());
        assert!(parse_typed(KeyKind::ReloadModeName, "sometimes").is_err());

        assert_eq!(
            parse_typed(KeyKind::Integer, "200000").unwrap().as_integer(),
            Some(200000)
        );
        assert!(parse_typed(KeyKind::Integer, "80%").is_err());
    }

    #[test]
    fn test_lookup_flat_and_nested() {
        let doc: DocumentMut = "threshold = \"80%\"\n\n[claude]\nbin = \"/opt/claude\"\n"
            .parse()
            .unwrap();
        assert_eq!(lookup(&doc, "threshold").map(render).as_deref(), Some("80%"));
        assert_eq!(lookup(&doc, "claude.bin").map(render).as_deref(), Some("/opt/claude"));
        assert!(lookup(&doc, "model").is_none());
        assert!(lookup(&doc, "codex.bin").is_none());
    }

    #[test]
    fn test_render_strings_bare_integers_plain() {
        let doc: DocumentMut = "model = \"opus\"\ncontext_window = 200000\n".parse().unwrap();
        assert_eq!(lookup(&doc, "model").map(render).as_deref(), Some("opus"));
        assert_eq!(
            lookup(&doc, "context_window").map(render).as_deref(),
            Some("200000")
        );
    }

    #[test]
    fn test_template_covers_registry_and_parses() {
        let template = render_template();
        for (key, _, _) in KNOWN_KEYS {
            let (_, field) = coordinates(key);
            assert!(template.contains(&format!("# {field} = ")), "missing {key}");
        }
        assert!(template.contains("[claude]"));
        assert!(template.contains("[codex]"));
        // All commented out: parsing it back yields an empty document.
        let doc: DocumentMut = template.parse().unwrap();
        assert!(KNOWN_KEYS.iter().all(|(key, _, _)| lookup(&doc, key).is_none()));
    }

    #[test]
    fn test_coordinates() {
        assert_eq!(coordinates("threshold"), (None, "threshold"));
        assert_eq!(coordinates("claude.bin"), (Some("claude"), "bin"));
    }

    #[test]
    fn test_config_deserialize() {
        let toml_str = r#"
threshold = "80%"
amount = "50%"
reload = "auto"
context_window = 200000

[claude]
bin = "/usr/local/bin/claude"
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.threshold.as_deref(), Some("80%"));
        assert_eq!(config.reload.as_deref(), Some("auto"));
        assert_eq!(config.context_window, Some(200000));
        assert_eq!(config.claude_bin(), "/usr/local/bin/claude");
        assert_eq!(config.codex_bin(), "codex");
    }

    #[test]
    fn test_config_default_bins() {
        let config = Config::default();
        assert_eq!(config.claude_bin(), "claude");
        assert_eq!(config.codex_bin(), "codex");
    }
}
