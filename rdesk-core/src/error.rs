//! Domain-specific error types for the RDP client core.
//!
//! All fallible operations return `Result<T, RdpError>`.
//! Malformed input from the server never panics; it surfaces as a
//! [`RdpError::Protocol`] or [`RdpError::Overrun`].

use std::time::Duration;
use thiserror::Error;

/// Convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, RdpError>;

/// The canonical error type for the client core.
#[derive(Debug, Error)]
pub enum RdpError {
    // ── Connection Errors ────────────────────────────────────────
    /// The TCP/IO layer reported an error.
    #[error("connection error: {0}")]
    Connection(#[from] std::io::Error),

    /// The TCP connect did not complete in time.
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// The server ended the session with an error-info reason.
    #[error("disconnected by server (reason {0:#x})")]
    Disconnected(u32),

    // ── Protocol Errors ──────────────────────────────────────────
    /// A PDU was malformed or arrived out of sequence.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A read went past the end of the received data.
    #[error("packet overrun: need {needed} bytes, {available} available")]
    Overrun { needed: usize, available: usize },

    // ── Security Errors ──────────────────────────────────────────
    /// Key material was malformed or a signature did not verify.
    #[error("crypto error: {0}")]
    Crypto(String),

    // ── Feature Errors ───────────────────────────────────────────
    /// An order, opcode or PDU type that is not implemented.
    #[error("unsupported: {0}")]
    Unsupported(String),

    // ── Configuration Errors ─────────────────────────────────────
    /// The session configuration is invalid or unreadable.
    #[error("config error: {0}")]
    Config(String),
}

impl RdpError {
    /// Shorthand for a [`RdpError::Protocol`] error.
    pub fn protocol(msg: impl Into<String>) -> Self {
        RdpError::Protocol(msg.into())
    }

    /// Shorthand for a [`RdpError::Unsupported`] error.
    pub fn unsupported(msg: impl Into<String>) -> Self {
        RdpError::Unsupported(msg.into())
    }

    /// Shorthand for a [`RdpError::Crypto`] error.
    pub fn crypto(msg: impl Into<String>) -> Self {
        RdpError::Crypto(msg.into())
    }

    /// Whether the error only invalidates the current order batch.
    ///
    /// Everything else ends the connection.
    pub fn is_batch_local(&self) -> bool {
        matches!(self, RdpError::Unsupported(_))
    }
}

impl From<toml::de::Error> for RdpError {
    fn from(e: toml::de::Error) -> Self {
        RdpError::Config(e.to_string())
    }
}
