use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProcflowError {
    // Load-time errors
    #[error("Definition error: {0}")]
    Definition(String),

    #[error("Unknown task handler '{handler}' referenced by node '{node_id}'")]
    UnknownHandler { node_id: String, handler: String },

    #[error("Invalid config for node '{node_id}': {message}")]
    InvalidTaskConfig { node_id: String, message: String },

    // Run-time errors
    #[error("Routing error: no flow out of gateway '{gateway}' matched and no default is declared")]
    Routing { gateway: String },

    #[error("Task '{node_id}' failed: {source}")]
    Task {
        node_id: String,
        #[source]
        source: TaskError,
    },

    #[error("Compensation of '{node_id}' failed: {message}")]
    Compensation { node_id: String, message: String },

    #[error("Run cancelled")]
    Cancelled,

    #[error("Branch '{branch}' terminated abnormally: {message}")]
    BranchPanicked { branch: String, message: String },

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Format errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl ProcflowError {
    /// Whether this error was raised before any node executed.
    pub fn is_load_time(&self) -> bool {
        matches!(
            self,
            Self::Definition(_)
                | Self::UnknownHandler { .. }
                | Self::InvalidTaskConfig { .. }
                | Self::Config(_)
                | Self::ConfigNotFound(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ProcflowError>;

/// Failure reported by a task handler.
///
/// `kind` is a free-form classifier matched against a boundary policy's
/// retryable kinds. The engine itself produces `timeout` and `cancelled`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("[{kind}] {message}")]
pub struct TaskError {
    pub kind: String,
    pub message: String,
}

impl TaskError {
    pub const TIMEOUT: &'static str = "timeout";
    pub const TRANSIENT: &'static str = "transient";
    pub const PERMANENT: &'static str = "permanent";
    pub const CANCELLED: &'static str = "cancelled";

    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(Self::TRANSIENT, message)
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(Self::PERMANENT, message)
    }

    /// The handler exceeded its maximum duration.
    pub fn timeout(timeout_ms: u64) -> Self {
        Self::new(Self::TIMEOUT, format!("exceeded {}ms", timeout_ms))
    }

    pub fn is_timeout(&self) -> bool {
        self.kind == Self::TIMEOUT
    }
}
