//! Error Types
//!
//! Operation errors surfaced to callers of the supervisor and the gateway,
//! plus the failure taxonomy carried by `error` events.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::session::SessionStatus;

/// Result alias for supervisor operations
pub type Result<T> = std::result::Result<T, ChipgateError>;

/// Errors returned synchronously by supervisor and gateway operations.
///
/// Recoverable protocol failures never show up here; they are absorbed by the
/// state machine and reported as transitions on the event bus.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ChipgateError {
    /// `send()` issued while the chip is not `connected`
    #[error("chip {chip_id} is not connected (status: {status})")]
    NotConnected {
        chip_id: String,
        status: SessionStatus,
    },

    /// The protocol client failed to create a handle
    #[error("failed to open protocol handle: {0}")]
    HandleCreationFailed(String),

    /// The protocol handle rejected an outgoing message
    #[error("message hand-off failed: {0}")]
    SendFailed(String),

    /// Malformed request (empty chip id, empty recipient, bad JSON...)
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The chip's supervisor task went away while a command was in flight
    #[error("supervisor for chip {0} is shutting down")]
    SupervisorClosed(String),
}

impl ChipgateError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::NotConnected { .. } => ErrorCode::NotConnected,
            Self::HandleCreationFailed(_) => ErrorCode::HandleCreationFailed,
            Self::SendFailed(_) => ErrorCode::SendFailed,
            Self::InvalidRequest(_) => ErrorCode::InvalidRequest,
            Self::SupervisorClosed(_) => ErrorCode::Unavailable,
        }
    }
}

/// Stable error codes exposed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    NotConnected,
    HandleCreationFailed,
    SendFailed,
    InvalidRequest,
    Unavailable,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotConnected => "not_connected",
            Self::HandleCreationFailed => "handle_creation_failed",
            Self::SendFailed => "send_failed",
            Self::InvalidRequest => "invalid_request",
            Self::Unavailable => "unavailable",
        }
    }

    /// HTTP status the gateway answers with.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::NotConnected => 409,
            Self::HandleCreationFailed => 502,
            Self::SendFailed => 502,
            Self::InvalidRequest => 400,
            Self::Unavailable => 503,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure classes reported through `error` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// QR code was not scanned within the validity window, refreshes exhausted
    PairingTimeout,
    /// Connection dropped and the reconnect budget is spent
    UnexpectedClose,
    /// Remote logout, credentials invalidated
    LoggedOut,
    NotConnected,
    HandleCreationFailed,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PairingTimeout => "pairing_timeout",
            Self::UnexpectedClose => "unexpected_close",
            Self::LoggedOut => "logged_out",
            Self::NotConnected => "not_connected",
            Self::HandleCreationFailed => "handle_creation_failed",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
