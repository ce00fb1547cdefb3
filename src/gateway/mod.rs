//! Connection Gateway
//!
//! HTTP and WebSocket surface over the session supervisor. Handlers are thin:
//! parse, validate, call the supervisor, serialize. Operation errors map to
//! their stable error code and HTTP status.

pub mod ws;

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::error::ChipgateError;
use crate::session::{ChipId, Session, SessionStatus};
use crate::supervisor::{SendReceipt, SessionSupervisor};

/// Default outbound queue per WebSocket connection.
pub const DEFAULT_OUTBOUND_QUEUE: usize = 256;

/// Where and how the gateway listens.
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub bind: String,
    pub port: u16,
    pub heartbeat: Duration,
    pub outbound_queue: usize,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 18790,
            heartbeat: Duration::from_secs(30),
            outbound_queue: DEFAULT_OUTBOUND_QUEUE,
        }
    }
}

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub supervisor: SessionSupervisor,
    pub heartbeat: Duration,
    pub outbound_queue: usize,
}

impl AppState {
    pub fn new(supervisor: SessionSupervisor, settings: &GatewaySettings) -> Self {
        Self {
            supervisor,
            heartbeat: settings.heartbeat,
            outbound_queue: settings.outbound_queue.max(1),
        }
    }
}

/// Build the router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/connect", post(connect_handler))
        .route("/disconnect", post(disconnect_handler))
        .route("/status", get(status_handler))
        .route("/send", post(send_handler))
        .route("/sessions", get(sessions_handler))
        .route("/health", get(health_handler))
        .route("/ws", get(ws::ws_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Bind the listener and serve in the background.
pub async fn start(settings: &GatewaySettings, supervisor: SessionSupervisor) -> std::io::Result<GatewayHandle> {
    let listener = TcpListener::bind((settings.bind.as_str(), settings.port)).await?;
    let local_addr = listener.local_addr()?;
    let router = build_router(AppState::new(supervisor, settings));

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move { signal.cancelled().await })
            .await
    });

    tracing::info!(addr = %local_addr, "gateway listening");

    Ok(GatewayHandle {
        local_addr,
        shutdown,
        server,
    })
}

/// Running gateway. Dropping it leaves the server running; call `shutdown`.
pub struct GatewayHandle {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    server: JoinHandle<std::io::Result<()>>,
}

impl GatewayHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Stop accepting connections and wait for in-flight requests.
    pub async fn shutdown(self) -> std::io::Result<()> {
        self.shutdown.cancel();
        match self.server.await {
            Ok(result) => result,
            Err(e) => Err(std::io::Error::other(e)),
        }
    }
}

/// An operation error rendered as `{error, message}` with the code's HTTP status.
#[derive(Debug)]
pub struct ApiError(pub ChipgateError);

impl From<ChipgateError> for ApiError {
    fn from(err: ChipgateError) -> Self {
        Self(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self(ChipgateError::InvalidRequest(rejection.body_text()))
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self(ChipgateError::InvalidRequest(rejection.body_text()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let code = self.0.code();
        let status = StatusCode::from_u16(code.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut body = json!({
            "error": code.as_str(),
            "message": self.0.to_string(),
        });
        if let ChipgateError::NotConnected { chip_id, status } = &self.0 {
            body["chipId"] = json!(chip_id);
            body["status"] = json!(status);
        }
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChipRequest {
    chip_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendRequest {
    chip_id: String,
    recipient: String,
    body: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusQuery {
    chip_id: Option<String>,
}

/// Snapshot of a chip; absent chips read as `disconnected`.
pub(crate) fn status_body(chip_id: &ChipId, session: Option<Session>) -> serde_json::Value {
    match session {
        Some(session) => json!(session),
        None => json!({
            "chipId": chip_id,
            "status": SessionStatus::Disconnected,
        }),
    }
}

async fn connect_handler(
    State(state): State<AppState>,
    payload: Result<Json<ChipRequest>, JsonRejection>,
) -> ApiResult<Json<serde_json::Value>> {
    let Json(request) = payload?;
    let chip_id = ChipId::parse(&request.chip_id)?;
    let status = state.supervisor.connect(&chip_id).await?;
    Ok(Json(json!({ "chipId": chip_id, "status": status })))
}

async fn disconnect_handler(
    State(state): State<AppState>,
    payload: Result<Json<ChipRequest>, JsonRejection>,
) -> ApiResult<Json<serde_json::Value>> {
    let Json(request) = payload?;
    let chip_id = ChipId::parse(&request.chip_id)?;
    let status = state.supervisor.disconnect(&chip_id).await?;
    Ok(Json(json!({ "chipId": chip_id, "status": status })))
}

async fn status_handler(
    State(state): State<AppState>,
    query: Result<Query<StatusQuery>, QueryRejection>,
) -> ApiResult<Json<serde_json::Value>> {
    let Query(query) = query?;
    let raw = query
        .chip_id
        .ok_or_else(|| ChipgateError::InvalidRequest("chipId query parameter is required".into()))?;
    let chip_id = ChipId::parse(&raw)?;
    Ok(Json(status_body(&chip_id, state.supervisor.status(&chip_id))))
}

async fn send_handler(
    State(state): State<AppState>,
    payload: Result<Json<SendRequest>, JsonRejection>,
) -> ApiResult<Json<SendReceipt>> {
    let Json(request) = payload?;
    let chip_id = ChipId::parse(&request.chip_id)?;
    let receipt = state
        .supervisor
        .send(&chip_id, &request.recipient, &request.body)
        .await?;
    Ok(Json(receipt))
}

async fn sessions_handler(State(state): State<AppState>) -> Json<Vec<Session>> {
    Json(state.supervisor.sessions().into_iter().collect())
}

async fn health_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "version": crate::VERSION,
        "sessions": state.supervisor.store().len(),
        "subscribers": state.supervisor.bus().subscriber_count(),
    }))
}
