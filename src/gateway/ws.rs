//! WebSocket channel.
//!
//! Clients send `{type: "subscribe" | "unsubscribe" | "get_status", chipId}`.
//! Every subscription runs a forwarder task that drains the chip's event bus
//! subscription into the connection's outbound queue; a single writer task
//! owns the socket sink and pings on a heartbeat.

use axum::extract::State;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::AppState;
use crate::error::ErrorCode;
use crate::events::{ChipEvent, EventBus, SessionEvent};
use crate::session::{ChipId, SessionStatus};

/// Messages a client may send.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    Subscribe { chip_id: String },
    Unsubscribe { chip_id: String },
    GetStatus { chip_id: String },
}

impl ClientMessage {
    fn chip_id(&self) -> &str {
        match self {
            Self::Subscribe { chip_id } | Self::Unsubscribe { chip_id } | Self::GetStatus { chip_id } => chip_id,
        }
    }
}

/// WebSocket upgrade handler.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// An `error` notice that is not a session transition (bad input, eviction).
fn notice(chip_id: Option<&ChipId>, code: ErrorCode, message: &str) -> String {
    let mut body = json!({
        "type": "error",
        "error": code.as_str(),
        "message": message,
    });
    if let Some(chip_id) = chip_id {
        body["chipId"] = json!(chip_id);
    }
    body.to_string()
}

/// Per-connection state owned by the reader.
struct Connection {
    id: Uuid,
    bus: EventBus,
    outbound: mpsc::Sender<String>,
    forwarders: HashMap<ChipId, JoinHandle<()>>,
}

impl Connection {
    async fn reply(&self, text: String) -> bool {
        self.outbound.send(text).await.is_ok()
    }

    async fn on_text(&mut self, text: &str, state: &AppState) -> bool {
        let message: ClientMessage = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(e) => {
                tracing::debug!(conn = %self.id, error = %e, "unparseable client message");
                return self
                    .reply(notice(None, ErrorCode::InvalidRequest, &format!("unrecognized message: {e}")))
                    .await;
            }
        };

        let chip_id = match ChipId::parse(message.chip_id()) {
            Ok(chip_id) => chip_id,
            Err(e) => return self.reply(notice(None, e.code(), &e.to_string())).await,
        };

        match message {
            ClientMessage::Subscribe { .. } => {
                self.subscribe(chip_id);
                true
            }
            ClientMessage::Unsubscribe { .. } => {
                if let Some(forwarder) = self.forwarders.remove(&chip_id) {
                    forwarder.abort();
                    tracing::debug!(conn = %self.id, chip_id = %chip_id, "unsubscribed");
                }
                true
            }
            ClientMessage::GetStatus { .. } => {
                let event = match state.supervisor.status(&chip_id) {
                    Some(session) if session.status == SessionStatus::QrReady => SessionEvent::qr_updated(&session),
                    Some(session) => SessionEvent::status_changed(&session, None),
                    None => SessionEvent::idle(),
                };
                match serde_json::to_string(&ChipEvent { chip_id, event }) {
                    Ok(text) => self.reply(text).await,
                    Err(_) => true,
                }
            }
        }
    }

    /// Start forwarding a chip's events. A live subscription is left alone;
    /// a finished one (evicted) is replaced, which replays the current state.
    fn subscribe(&mut self, chip_id: ChipId) {
        if self
            .forwarders
            .get(&chip_id)
            .is_some_and(|forwarder| !forwarder.is_finished())
        {
            return;
        }

        let mut subscription = self.bus.subscribe(&chip_id);
        let outbound = self.outbound.clone();
        let conn = self.id;
        let forwarded_chip = chip_id.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(event) = subscription.recv().await {
                let Ok(text) = serde_json::to_string(&event) else {
                    continue;
                };
                if outbound.send(text).await.is_err() {
                    return;
                }
            }
            tracing::warn!(conn = %conn, chip_id = %forwarded_chip, "subscription evicted");
            let _ = outbound
                .send(notice(
                    Some(&forwarded_chip),
                    ErrorCode::Unavailable,
                    "subscription dropped because the client fell behind; subscribe again",
                ))
                .await;
        });

        tracing::debug!(conn = %self.id, chip_id = %chip_id, "subscribed");
        self.forwarders.insert(chip_id, forwarder);
    }

    fn close(&mut self) {
        for (_, forwarder) in self.forwarders.drain() {
            forwarder.abort();
        }
    }
}

/// Drive one WebSocket connection until either side goes away.
async fn handle_socket(socket: WebSocket, state: AppState) {
    let id = Uuid::new_v4();
    tracing::info!(conn = %id, "websocket client connected");

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (outbound, mut outbound_rx) = mpsc::channel::<String>(state.outbound_queue);

    // Writer: outbound queue to socket, plus heartbeat pings
    let heartbeat = state.heartbeat;
    let mut writer = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(heartbeat);
        ping_interval.tick().await;

        loop {
            tokio::select! {
                message = outbound_rx.recv() => {
                    let Some(text) = message else { break };
                    if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                _ = ping_interval.tick() => {
                    if ws_tx.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                    tracing::trace!(conn = %id, "sent ping");
                }
            }
        }
        let _ = ws_tx.close().await;
    });

    let mut connection = Connection {
        id,
        bus: state.supervisor.bus().clone(),
        outbound,
        forwarders: HashMap::new(),
    };

    let reader = async {
        while let Some(Ok(message)) = ws_rx.next().await {
            match message {
                WsMessage::Text(text) => {
                    if !connection.on_text(text.as_str(), &state).await {
                        break;
                    }
                }
                WsMessage::Close(_) => break,
                _ => {}
            }
        }
    };

    tokio::select! {
        _ = reader => {}
        _ = &mut writer => {}
    }

    connection.close();
    writer.abort();
    tracing::info!(conn = %id, "websocket client disconnected");
}
