use std::process::ExitCode;

/// Errors that cause foreman to exit with a specific code.
#[derive(Debug, thiserror::Error)]
pub enum ExitError {
    #[error("config error: {0}")]
    Config(String),

    #[error("tool not found: {tool}")]
    ToolNotFound { tool: String },

    #[error("{tool} failed (exit {code}): {message}")]
    ToolFailed {
        tool: String,
        code: i32,
        message: String,
    },

    #[error("{tool} timed out after {timeout_secs}s")]
    Timeout { tool: String, timeout_secs: u64 },

    #[error("{0}")]
    Other(String),
}

impl ExitError {
    pub fn exit_code(&self) -> ExitCode {
        match self {
            ExitError::Config(_) => ExitCode::from(2),
            ExitError::ToolNotFound { .. } => ExitCode::from(3),
            ExitError::ToolFailed { .. } => ExitCode::from(4),
            ExitError::Timeout { .. } => ExitCode::from(5),
            ExitError::Other(_) => ExitCode::from(1),
        }
    }
}

/// Failures talking to the remote system of record.
///
/// Every variant is non-fatal for the control loop: the failing step is
/// logged and re-attempted on a later tick.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("request to {endpoint} failed: {detail}")]
    Transport { endpoint: String, detail: String },

    #[error("{endpoint} rejected the request: {detail}")]
    Api { endpoint: String, detail: String },

    #[error("work item #{0} not found on the board")]
    NotFound(u64),

    #[error("failed to decode {what}: {detail}")]
    Decode { what: &'static str, detail: String },

    #[error("board has no {kind} named {name:?}")]
    MissingField { kind: &'static str, name: String },
}

impl SourceError {
    /// Transport hiccups are expected to clear up by themselves.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SourceError::Transport { .. })
    }
}

/// Violations of the ledger's record invariants.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("work item #{0} already has an assignment")]
    DuplicateItem(u64),

    #[error("worker token {token} is already held by work item #{owner}")]
    DuplicateToken { token: String, owner: u64 },

    #[error("no assignment for work item #{0}")]
    NotFound(u64),

    #[error("ledger {path} is corrupt: {detail}")]
    Corrupt { path: String, detail: String },
}
