// Fathom Error Types
use thiserror::Error;

/// Control signal observed at a pipeline checkpoint.
///
/// Raised as `FathomError::Halted` so the executor's outer frame can tell a
/// cooperative halt apart from a real failure. The job row already carries
/// the status that produced the signal; the executor never overwrites it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    Paused,
    Cancelled,
    ClarificationRequired,
}

impl ControlSignal {
    pub fn as_str(self) -> &'static str {
        match self {
            ControlSignal::Paused => "paused",
            ControlSignal::Cancelled => "cancelled",
            ControlSignal::ClarificationRequired => "clarification_required",
        }
    }
}

impl std::fmt::Display for ControlSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum FathomError {
    #[error("store error: {0}")]
    Store(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("tool error: {0}")]
    Tool(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("halted: {0}")]
    Halted(ControlSignal),
}

impl From<rusqlite::Error> for FathomError {
    fn from(err: rusqlite::Error) -> Self {
        // Unique-constraint rejections are expected during concurrent ledger
        // writes and must stay distinguishable from genuine store failures.
        if let rusqlite::Error::SqliteFailure(code, ref msg) = err {
            if code.code == rusqlite::ErrorCode::ConstraintViolation {
                return FathomError::Conflict(
                    msg.clone().unwrap_or_else(|| "unique constraint".to_string()),
                );
            }
        }
        FathomError::Store(err.to_string())
    }
}

impl From<reqwest::Error> for FathomError {
    fn from(err: reqwest::Error) -> Self {
        FathomError::Tool(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, FathomError>;
