//! Session Model
//!
//! One `Session` record per chip (WhatsApp-enabled phone number). The record is
//! plain data; the live protocol handle is owned by the chip's supervisor task
//! and never lives here.

mod store;

pub use store::{SessionStore, Snapshot};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

use crate::error::ChipgateError;

/// Longest chip identifier the gateway accepts.
pub const MAX_CHIP_ID_LEN: usize = 128;

/// Externally assigned, stable chip identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChipId(String);

impl ChipId {
    /// Validate and wrap a raw identifier.
    pub fn parse(raw: &str) -> Result<Self, ChipgateError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(ChipgateError::InvalidRequest("chipId must not be empty".into()));
        }
        if trimmed.len() > MAX_CHIP_ID_LEN {
            return Err(ChipgateError::InvalidRequest(format!(
                "chipId longer than {} bytes",
                MAX_CHIP_ID_LEN
            )));
        }
        if trimmed.chars().any(|c| c.is_control() || c == '/' || c == '\\') {
            return Err(ChipgateError::InvalidRequest(
                "chipId contains forbidden characters".into(),
            ));
        }
        // Used as a path component under the credentials root
        if trimmed == "." || trimmed == ".." {
            return Err(ChipgateError::InvalidRequest(format!(
                "chipId must not be {trimmed:?}"
            )));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ChipId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for ChipId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle states of a chip connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    #[default]
    Disconnected,
    Connecting,
    QrReady,
    Authenticated,
    Connected,
    Error,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::QrReady => "qr_ready",
            Self::Authenticated => "authenticated",
            Self::Connected => "connected",
            Self::Error => "error",
        }
    }

    /// States in which a protocol handle is (or is about to be) live.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Connecting | Self::QrReady | Self::Authenticated | Self::Connected
        )
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why the protocol layer closed a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CloseReason {
    /// The device was unlinked remotely; credentials are void
    LoggedOut,
    NetworkDrop,
    /// Another client took over the same credentials
    Replaced,
    Other(String),
}

impl CloseReason {
    pub fn is_logged_out(&self) -> bool {
        matches!(self, Self::LoggedOut)
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LoggedOut => f.write_str("logged-out"),
            Self::NetworkDrop => f.write_str("network-drop"),
            Self::Replaced => f.write_str("replaced"),
            Self::Other(reason) => f.write_str(reason),
        }
    }
}

/// Opaque pointer to durable pairing credentials (directory or blob key).
///
/// Only the protocol client reads or writes what it points at.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CredentialsRef(String);

impl CredentialsRef {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Per-chip credentials location under a root directory.
    pub fn for_chip(root: &Path, chip_id: &ChipId) -> Self {
        Self(root.join(chip_id.as_str()).to_string_lossy().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// The supervisor's record of one chip's connection lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub chip_id: ChipId,
    pub status: SessionStatus,
    /// Present only while `status == qr_ready`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qr_payload: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qr_expires_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub credentials_ref: CredentialsRef,
    pub last_transition_at: DateTime<Utc>,
    /// Unexpected closes since the last successful `connected`
    pub reconnect_attempts: u32,
    /// Pairing payloads discarded for expiry in the current pairing cycle
    pub qr_refreshes: u32,
    pub created_at: DateTime<Utc>,
}

impl Session {
    pub fn new(chip_id: ChipId, credentials_ref: CredentialsRef) -> Self {
        let now = Utc::now();
        Self {
            chip_id,
            status: SessionStatus::Disconnected,
            qr_payload: None,
            qr_expires_at: None,
            credentials_ref,
            last_transition_at: now,
            reconnect_attempts: 0,
            qr_refreshes: 0,
            created_at: now,
        }
    }

    /// Move to `to`, stamping the transition time.
    ///
    /// Leaving `qr_ready` always drops the pairing payload.
    pub fn transition(&mut self, to: SessionStatus) {
        self.status = to;
        self.last_transition_at = Utc::now();
        if to != SessionStatus::QrReady {
            self.qr_payload = None;
            self.qr_expires_at = None;
        }
    }
}
