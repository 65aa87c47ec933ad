//! Error types for Skiff.

pub mod unified;

pub use unified::ErrorCategory;

use thiserror::Error;

/// Primary error type for every Skiff operation.
#[derive(Error, Debug)]
pub enum SkiffError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Authentication expired or invalid: {0}")]
    Authentication(String),

    #[error("Permission denied by provider: {0}")]
    PermissionDenied(String),

    #[error("Rate limited: retry after {retry_after_ms:?}ms")]
    RateLimited { retry_after_ms: Option<u64> },

    #[error("Malformed provider response: {0}")]
    MalformedResponse(String),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Tool execution error: {tool_name} - {message}")]
    ToolExecution { tool_name: String, message: String },

    #[error("Maximum turns exceeded ({max_turns})")]
    MaxTurnsExceeded { max_turns: usize },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl SkiffError {
    /// Create a generic vendor error from a status code and body.
    pub fn api(status: u16, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            message: message.into(),
        }
    }

    /// Create a tool execution error.
    pub fn tool(tool_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ToolExecution {
            tool_name: tool_name.into(),
            message: message.into(),
        }
    }

    /// Classify this error into a category.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Authentication(_) => ErrorCategory::Authentication,
            Self::PermissionDenied(_) => ErrorCategory::Permission,
            Self::RateLimited { .. } => ErrorCategory::RateLimit,
            Self::Transport(_) => ErrorCategory::Transport,
            Self::MalformedResponse(_) => ErrorCategory::MalformedResponse,
            Self::Stream(_) => ErrorCategory::Transport,
            Self::Api { status, .. } => match status {
                401 => ErrorCategory::Authentication,
                403 => ErrorCategory::Permission,
                429 => ErrorCategory::RateLimit,
                500..=599 => ErrorCategory::Server,
                _ => ErrorCategory::Api,
            },
            Self::ToolExecution { .. } => ErrorCategory::ToolExecution,
            Self::MaxTurnsExceeded { .. } => ErrorCategory::MaxTurns,
            Self::Cancelled => ErrorCategory::Cancelled,
            Self::Configuration(_) | Self::InvalidArgument(_) => ErrorCategory::Configuration,
            Self::Serialization(_) => ErrorCategory::Serialization,
            Self::Io(_) => ErrorCategory::Unknown,
        }
    }

    /// Whether a caller-side retry could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::RateLimit | ErrorCategory::Transport | ErrorCategory::Server
        )
    }

    /// Whether this error ends the current task.
    ///
    /// Tool failures are recoverable (the model sees them as a tool result) and
    /// cancellation is not an application error at all.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self.category(),
            ErrorCategory::ToolExecution | ErrorCategory::Cancelled
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Short, actionable text for the person at the terminal.
    pub fn user_message(&self) -> String {
        match self {
            Self::Authentication(_) => "Authentication expired - please re-authenticate".into(),
            Self::PermissionDenied(_) => {
                "Permission denied by the provider - check the account's access to this model"
                    .into()
            }
            Self::RateLimited {
                retry_after_ms: Some(ms),
            } => format!(
                "Rate limited by the provider - try again in {}s",
                ms.div_ceil(1000)
            ),
            Self::RateLimited { retry_after_ms: None } => {
                "Rate limited by the provider - wait a moment and try again".into()
            }
            Self::MalformedResponse(_) => {
                "The provider returned a response that could not be understood".into()
            }
            Self::Transport(_) | Self::Stream(_) => {
                "Could not reach the provider - check the network connection".into()
            }
            Self::Api { status, .. } => format!("The provider rejected the request (HTTP {status})"),
            Self::ToolExecution { tool_name, message } => {
                format!("Tool '{tool_name}' failed: {message}")
            }
            Self::MaxTurnsExceeded { max_turns } => format!(
                "Stopped after {max_turns} turns without finishing - raise --max-turns to continue"
            ),
            Self::Cancelled => "Cancelled".into(),
            Self::Configuration(msg) | Self::InvalidArgument(msg) => {
                format!("Configuration problem: {msg}")
            }
            Self::Io(err) => format!("I/O failure: {err}"),
            Self::Serialization(err) => format!("Invalid JSON: {err}"),
        }
    }
}

/// Convenience alias.
pub type Result<T> = std::result::Result<T, SkiffError>;
