//! chipgate - WhatsApp chip session supervisor
//!
//! Keeps many concurrent WhatsApp device sessions ("chips", one per phone
//! number) paired, connected and observable. Each chip is driven by a single
//! actor that owns its lifecycle: QR pairing with bounded refreshes, automatic
//! reconnection with exponential backoff, and clean logout.
//!
//! ## Features
//!
//! - **Per-chip state machine:** `idle → connecting → qr_ready → authenticated → connected`
//! - **Event fan-out:** ordered, replay-on-subscribe event streams per chip
//! - **Gateway:** HTTP routes for commands plus a WebSocket channel for live status
//! - **Pluggable protocol:** the supervisor runs against any [`protocol::ProtocolClient`];
//!   a deterministic simulated client is bundled for tests and demos
//! - **Status mirror:** optional webhook receiving every transition
//!
//! ## Quick Start
//!
//! ```bash
//! # Write a default config
//! chipgate init
//!
//! # Serve with the simulated protocol client
//! chipgate serve --simulated
//!
//! # Pair a chip
//! curl -X POST localhost:18790/connect -H 'content-type: application/json' -d '{"chipId":"chip-1"}'
//! ```

pub mod cli;
pub mod config;
pub mod error;
pub mod events;
pub mod gateway;
pub mod logging;
pub mod mirror;
pub mod protocol;
pub mod session;
pub mod supervisor;

// Re-export commonly used types
pub use error::{ChipgateError, ErrorCode, ErrorKind, Result};
pub use events::{ChipEvent, EventBus, SessionEvent, Subscription};
pub use session::{ChipId, Session, SessionStatus};
pub use supervisor::{SendReceipt, SessionSupervisor, SupervisorPolicy};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const AUTHORS: &str = env!("CARGO_PKG_AUTHORS");
pub const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");
