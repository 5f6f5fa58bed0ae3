use std::path::PathBuf;

/// Error taxonomy for the whole crate.
///
/// Validator findings are *not* errors — they are returned as issue lists
/// (see `validate::Issue`). Only conditions that stop an operation outright
/// appear here.
#[derive(Debug, thiserror::Error)]
pub enum EvsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("IO error at {path}: {source}")]
    IoAt {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Whole-file parse failure. Individual malformed lines are data, not
    /// errors; this fires only when a file cannot be read as JSONL at all.
    #[error("parse error at {path}:{line}: {message}")]
    Parse {
        path: PathBuf,
        line: usize,
        message: String,
    },

    #[error("unknown transcript format: {0}")]
    FormatUnknown(PathBuf),

    /// A rewrite would strictly worsen the error count and was not forced.
    #[error("operation refused: validation errors would go from {before} to {after}")]
    OperationRefused { before: usize, after: usize },

    /// A ready pending-compact plan no longer matches its source fingerprint.
    #[error("pending plan is stale for session {session_id}")]
    PendingConflict { session_id: String },

    #[error("supervisor timeout: {0}")]
    SupervisorTimeout(String),

    #[error("invalid amount spec: {0}")]
    InvalidSpec(String),

    /// `keep_last` combined with a token-based amount has no meaning.
    #[error("keep-last cannot be combined with a token amount")]
    InvalidAmountMode,

    #[error("no session found for {0}")]
    NoSession(String),

    #[error("{0}")]
    Other(String),
}

impl EvsError {
    /// Attach a path to a bare IO error. Used at every filesystem boundary so
    /// failures always name the offending file.
    pub fn io_at(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        EvsError::IoAt {
            path: path.into(),
            source,
        }
    }
}
