use std::time::Duration;

use ferry_api::error::TransportError;

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("invalid pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: &'static str },

    #[error("subscribe error: {0}")]
    Subscribe(String),

    #[error("publish error: {0}")]
    Publish(String),

    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    /// A state the engine's own locking should have made impossible.
    #[error("internal invariant violated: {0}")]
    InternalInvariant(String),

    #[error("config error: {0}")]
    Config(String),
}

impl RelayError {
    /// Stable tag for error payloads at the tool-call boundary.
    pub fn kind(&self) -> &'static str {
        match self {
            RelayError::Connection(_) => "ConnectionError",
            RelayError::InvalidPattern { .. } => "InvalidPattern",
            RelayError::Subscribe(_) => "SubscribeError",
            RelayError::Publish(_) => "PublishError",
            RelayError::Timeout { .. } => "TimeoutError",
            RelayError::InternalInvariant(_) => "InternalInvariant",
            RelayError::Config(_) => "ConfigError",
        }
    }

    pub(crate) fn invalid_pattern(pattern: &str, reason: &'static str) -> Self {
        RelayError::InvalidPattern {
            pattern: pattern.to_string(),
            reason,
        }
    }

    /// Add context to the error.
    ///
    /// Message-carrying variants get the context prepended; structured
    /// variants are returned unchanged.
    pub fn with_context(self, ctx: impl std::fmt::Display) -> Self {
        match self {
            RelayError::Connection(msg) => RelayError::Connection(format!("{ctx}: {msg}")),
            RelayError::Subscribe(msg) => RelayError::Subscribe(format!("{ctx}: {msg}")),
            RelayError::Publish(msg) => RelayError::Publish(format!("{ctx}: {msg}")),
            RelayError::Config(msg) => RelayError::Config(format!("{ctx}: {msg}")),
            other => other,
        }
    }
}

impl From<TransportError> for RelayError {
    /// Transport failures outside subscribe/publish are connection failures.
    fn from(e: TransportError) -> Self {
        RelayError::Connection(e.to_string())
    }
}
