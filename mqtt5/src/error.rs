//! Error types for mqtt5.

use std::io;

use crate::types::ReasonCode;

/// Result type alias for mqtt5.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for mqtt5 operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// Protocol error.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Connection closed by peer.
    #[error("connection closed")]
    ConnectionClosed,

    /// Invalid configuration.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Broker is already running.
    #[error("broker already running")]
    AlreadyRunning,

    /// Backend store failure.
    #[error("backend error: {0}")]
    Backend(String),

    /// Envelope (de)serialization failure.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Redis failure.
    #[cfg(feature = "redis")]
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// A protocol violation, tagged with the reason code to report to the peer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code}: {reason}")]
pub struct ProtocolError {
    /// Reason code sent in the CONNACK or DISCONNECT that closes the connection.
    pub code: ReasonCode,
    /// Diagnostic text, forwarded to the client only when configured.
    pub reason: String,
    /// Property identifier that caused the error, if any.
    pub property: Option<u8>,
}

impl ProtocolError {
    pub fn new(code: ReasonCode, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
            property: None,
        }
    }

    /// Structural wire violation (0x81).
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::new(ReasonCode::MALFORMED_PACKET, reason)
    }

    /// Semantic protocol violation (0x82).
    pub fn protocol(reason: impl Into<String>) -> Self {
        Self::new(ReasonCode::PROTOCOL_ERROR, reason)
    }

    /// Property-level violation tagged with the property identifier.
    pub fn property(id: u8, code: ReasonCode, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
            property: Some(id),
        }
    }
}
