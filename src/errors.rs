#![allow(dead_code)]

use thiserror::Error;

/// Typed error hierarchy for swarmboard.
///
/// Use at module boundaries (provider calls, tool execution, engine runs).
/// Internal/leaf functions can continue using `anyhow::Result` — the `Internal`
/// variant allows seamless conversion via the `?` operator.
#[derive(Debug, Error)]
pub enum SwarmError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Provider error: {message}")]
    Provider { message: String, retryable: bool },

    #[error("Tool error: {tool}: {message}")]
    Tool { tool: String, message: String },

    #[error("Engine error: {0}")]
    Engine(String),

    #[error("Aborted")]
    Abort,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type SwarmResult<T> = std::result::Result<T, SwarmError>;

impl SwarmError {
    /// Whether this error is retryable (transient provider errors).
    pub fn is_retryable(&self) -> bool {
        match self {
            SwarmError::Provider { retryable, .. } => *retryable,
            _ => false,
        }
    }

    /// Whether the error message looks like a dropped or timed-out connection.
    /// Connection errors get a larger retry budget than plain API errors.
    pub fn is_connection_error(&self) -> bool {
        let msg = self.to_string().to_lowercase();
        const CONNECTION_KEYWORDS: &[&str] = &[
            "connection",
            "timeout",
            "network",
            "refused",
            "unreachable",
            "timed out",
            "temporary failure",
        ];
        CONNECTION_KEYWORDS.iter().any(|k| msg.contains(k))
    }

    /// Whether the error indicates the request exceeded the model context window.
    pub fn is_context_overflow(&self) -> bool {
        let msg = self.to_string().to_lowercase();
        msg.contains("context length")
            || msg.contains("context_length")
            || msg.contains("token limit")
            || msg.contains("maximum context")
    }
}

/// Classify an `anyhow::Error` that may or may not wrap a [`SwarmError`].
pub fn classify(e: &anyhow::Error) -> (bool, bool) {
    if let Some(se) = e.downcast_ref::<SwarmError>() {
        (se.is_connection_error(), se.is_context_overflow())
    } else {
        let msg = e.to_string().to_lowercase();
        (
            ["connection", "timeout", "network", "refused", "unreachable"]
                .iter()
                .any(|k| msg.contains(k)),
            msg.contains("context length") || msg.contains("token limit"),
        )
    }
}
