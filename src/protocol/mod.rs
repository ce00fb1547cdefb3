//! Protocol Client Boundary
//!
//! The supervisor drives WhatsApp connections through this capability and
//! nothing else: open a handle, receive its events, send through it, close it.
//! Any library offering that shape plugs in behind `ProtocolClient`.

pub mod simulated;

pub use simulated::{SentMessage, SimulatedClient, SimulatorSettings};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::session::{ChipId, CloseReason, CredentialsRef};

/// Errors a protocol client can report.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProtocolError {
    #[error("failed to open session: {0}")]
    Open(String),
    #[error("failed to send message: {0}")]
    Send(String),
    #[error("logout failed: {0}")]
    Logout(String),
    #[error("handle is closed")]
    Closed,
}

/// A chat message delivered to the chip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundMessage {
    pub message_id: String,
    pub from: String,
    pub body: String,
    pub received_at: DateTime<Utc>,
}

/// Asynchronous notifications emitted by a live handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolEvent {
    /// A pairing code is ready to be scanned
    PairingPayload(String),
    /// The phone scanned the code
    Paired,
    /// Session is open and can send/receive
    Open,
    Close(CloseReason),
    MessageReceived(InboundMessage),
}

/// Where a handle reports its events.
///
/// Every sink is stamped with the generation of the handle it was created
/// for, so events from a torn-down handle can be told apart from the live one.
#[derive(Debug, Clone)]
pub struct EventSink {
    generation: u64,
    tx: mpsc::UnboundedSender<(u64, ProtocolEvent)>,
}

impl EventSink {
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<(u64, ProtocolEvent)>) -> Self {
        Self { generation, tx }
    }

    /// Deliver an event. Returns false once the receiving supervisor is gone.
    pub fn emit(&self, event: ProtocolEvent) -> bool {
        self.tx.send((self.generation, event)).is_ok()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Factory side of the capability: one call per connection attempt.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProtocolClient: Send + Sync {
    /// Open a new connection using the chip's credentials.
    ///
    /// The handle emits `PairingPayload` when no valid credentials exist,
    /// then `Paired` and `Open`, or `Open` directly when credentials are valid.
    async fn open(
        &self,
        chip_id: &ChipId,
        credentials: &CredentialsRef,
        events: EventSink,
    ) -> Result<Box<dyn ProtocolHandle>, ProtocolError>;

    /// Invalidate stored credentials after a logout.
    async fn forget(&self, credentials: &CredentialsRef) -> Result<(), ProtocolError>;
}

/// A single live connection. Exclusively owned by one chip's supervisor.
#[async_trait]
pub trait ProtocolHandle: Send + Sync {
    /// Hand a text message to the protocol layer; returns its message id.
    async fn send(&self, recipient: &str, body: &str) -> Result<String, ProtocolError>;

    /// Unlink the device from the account.
    async fn logout(&mut self) -> Result<(), ProtocolError>;

    /// Drop the connection, keeping credentials. Idempotent.
    async fn close(&mut self);
}
