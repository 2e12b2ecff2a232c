use std::fmt;

/// Error kind for broker transport errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// Broker unreachable, handshake failed or timed out on the wire.
    Connect,
    /// Credentials rejected by the broker.
    Auth,
    /// Operation requires a live session.
    NotConnected,
    /// Broker refused the request (unknown topic, ACL, ...).
    Rejected,
    /// Operation is not part of this transport's contract.
    Unsupported,
    /// Bad transport configuration (missing host, unreadable certificate, ...).
    Config,
    Io,
}

/// Transport error, returned by all `BrokerConnection` methods.
#[derive(Debug)]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn connect(msg: impl Into<String>) -> Self {
        Self { kind: TransportErrorKind::Connect, message: msg.into() }
    }

    pub fn auth(msg: impl Into<String>) -> Self {
        Self { kind: TransportErrorKind::Auth, message: msg.into() }
    }

    pub fn not_connected() -> Self {
        Self { kind: TransportErrorKind::NotConnected, message: "not connected".into() }
    }

    pub fn rejected(msg: impl Into<String>) -> Self {
        Self { kind: TransportErrorKind::Rejected, message: msg.into() }
    }

    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self { kind: TransportErrorKind::Unsupported, message: msg.into() }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self { kind: TransportErrorKind::Config, message: msg.into() }
    }

    pub fn io(msg: impl Into<String>) -> Self {
        Self { kind: TransportErrorKind::Io, message: msg.into() }
    }

    /// Add context to the error, preserving the original kind.
    ///
    /// Produces: `"context: original message"`.
    pub fn with_context(self, ctx: impl fmt::Display) -> Self {
        Self {
            kind: self.kind,
            message: format!("{ctx}: {}", self.message),
        }
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for TransportError {}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        Self::io(e.to_string())
    }
}
