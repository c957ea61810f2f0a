/// Crate-wide error type.
///
/// `Decode` is recovered inside the event decoder and never reaches the
/// conversation driver; `Aborted` is the distinguished cancellation signal and
/// is swallowed by the driver instead of being shown to the user.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ChatError {
    #[error("Config error: {0}")]
    Config(String),
    #[error("API request failed: status={status}, message={message}")]
    Request { status: u16, message: String },
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Decode error: {0}")]
    Decode(String),
    #[error("Request aborted")]
    Aborted,
    #[error("Tool loop exceeded {rounds} rounds without a final answer")]
    ToolLoopExceeded { rounds: usize },
    #[error("A response is already streaming for chat '{0}'")]
    Busy(String),
    #[error("Unknown chat '{0}'")]
    UnknownChat(String),
    #[error("Persistence error: {0}")]
    Persistence(String),
    #[error("Capability fetch failed for {endpoint}: {message}")]
    CapabilityFetch { endpoint: String, message: String },
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Broad error category, used for log levels and exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Cancelled,
    Client,
    Upstream,
    Local,
}

impl ErrorCategory {
    /// Process exit code for a fatal error of this category.
    #[must_use]
    pub fn exit_code(self) -> i32 {
        match self {
            ErrorCategory::Cancelled => 130,
            ErrorCategory::Client => 2,
            ErrorCategory::Upstream => 3,
            ErrorCategory::Local => 1,
        }
    }
}

/// Map an upstream HTTP status code to an error category.
#[must_use]
pub fn category_from_upstream_status(status: u16) -> ErrorCategory {
    match status {
        400..=499 => ErrorCategory::Client,
        _ => ErrorCategory::Upstream,
    }
}

impl ChatError {
    /// `true` for the cancellation signal raised when a stop is requested.
    #[must_use]
    pub fn is_abort(&self) -> bool {
        matches!(self, ChatError::Aborted)
    }

    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            ChatError::Aborted => ErrorCategory::Cancelled,
            ChatError::Request { status, .. } => category_from_upstream_status(*status),
            ChatError::Transport(_)
            | ChatError::Decode(_)
            | ChatError::ToolLoopExceeded { .. }
            | ChatError::CapabilityFetch { .. } => ErrorCategory::Upstream,
            ChatError::Busy(_) | ChatError::UnknownChat(_) => ErrorCategory::Client,
            ChatError::Config(_) | ChatError::Persistence(_) | ChatError::Internal(_) => {
                ErrorCategory::Local
            }
        }
    }

    /// Human-readable text for the synthetic assistant message that closes a
    /// failed turn.
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            ChatError::Request { status, message } if message.is_empty() => {
                format!("Error: API request failed with status {status}")
            }
            ChatError::Request { message, .. } => format!("Error: API request failed: {message}"),
            other => format!("Error: {other}"),
        }
    }
}

impl From<reqwest::Error> for ChatError {
    fn from(err: reqwest::Error) -> Self {
        ChatError::Transport(err.to_string())
    }
}
