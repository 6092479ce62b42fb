//! Error taxonomy for the proxy pipeline.
//!
//! Low-level failures (socket errors, SQLite errors, JSON errors) are
//! translated into one of these kinds at the component boundary, so callers
//! can decide on retry policy without inspecting platform error codes.

use std::io;

/// Classification of a network failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkErrorKind {
    Refused,
    Reset,
    Timeout,
    Other,
}

impl std::fmt::Display for NetworkErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NetworkErrorKind::Refused => "connection refused",
            NetworkErrorKind::Reset => "connection reset",
            NetworkErrorKind::Timeout => "timed out",
            NetworkErrorKind::Other => "network failure",
        };
        f.write_str(s)
    }
}

/// Errors produced by the proxy components.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// Connection refused/reset/timeout. Always retryable, never advances a checkpoint.
    #[error("Network: {kind}: {detail}")]
    Network {
        kind: NetworkErrorKind,
        detail: String,
    },

    /// Malformed or unexpected response framing.
    #[error("Protocol: {0}")]
    Protocol(String),

    /// The remote side answered with `"response":"failed"`.
    #[error("Negative acknowledgement: {info}")]
    NegativeAck { info: String },

    /// Local database failure. The current batch is rolled back.
    #[error("Storage: {0}")]
    Storage(String),

    /// A bounded cache or internal table is full and cannot grow.
    #[error("Capacity: {0}")]
    Capacity(String),

    /// Missing or contradictory configuration.
    #[error("Config: {0}")]
    Config(String),
}

impl ProxyError {
    pub fn network(kind: NetworkErrorKind, detail: impl Into<String>) -> Self {
        ProxyError::Network {
            kind,
            detail: detail.into(),
        }
    }

    /// Returns true for errors that are worth retrying on the next cycle.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ProxyError::Config(_))
    }
}

impl From<io::Error> for ProxyError {
    fn from(e: io::Error) -> Self {
        let kind = match e.kind() {
            io::ErrorKind::ConnectionRefused => NetworkErrorKind::Refused,
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof => NetworkErrorKind::Reset,
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => NetworkErrorKind::Timeout,
            _ => NetworkErrorKind::Other,
        };
        ProxyError::network(kind, e.to_string())
    }
}

impl From<rusqlite::Error> for ProxyError {
    fn from(e: rusqlite::Error) -> Self {
        ProxyError::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for ProxyError {
    fn from(e: serde_json::Error) -> Self {
        ProxyError::Protocol(format!("invalid JSON: {}", e))
    }
}

/// Convenience `Result` alias for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;
