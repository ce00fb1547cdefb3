//! Status Mirror
//!
//! Forwards every chip transition to an external webhook so database-backed
//! dashboards stay in sync. Runs off the bus firehose; a slow or failing
//! webhook is logged and never holds up the supervisor.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::error::ErrorKind;
use crate::events::{ChipEvent, SessionEvent};
use crate::session::{ChipId, SessionStatus};

/// Where transitions are posted.
#[derive(Debug, Clone)]
pub struct MirrorSettings {
    pub url: String,
    /// Sent as a bearer token when present
    pub token: Option<String>,
    pub timeout: Duration,
}

/// Body of one webhook call.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MirrorRecord {
    pub chip_id: ChipId,
    pub status: SessionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qr_payload: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorKind>,
    pub at: DateTime<Utc>,
}

impl MirrorRecord {
    /// Record for a status-bearing event; chat messages are not mirrored.
    pub fn from_event(event: &ChipEvent) -> Option<Self> {
        let chip_id = event.chip_id.clone();
        match &event.event {
            SessionEvent::StatusChanged { status, reason, at, .. } => Some(Self {
                chip_id,
                status: *status,
                qr_payload: None,
                error: *reason,
                at: *at,
            }),
            SessionEvent::QrUpdated {
                status, qr_payload, at, ..
            } => Some(Self {
                chip_id,
                status: *status,
                qr_payload: Some(qr_payload.clone()),
                error: None,
                at: *at,
            }),
            SessionEvent::Error { status, error, at, .. } => Some(Self {
                chip_id,
                status: *status,
                qr_payload: None,
                error: Some(*error),
                at: *at,
            }),
            SessionEvent::MessageReceived(_) => None,
        }
    }
}

pub struct StatusMirror {
    client: Client,
    settings: MirrorSettings,
}

impl StatusMirror {
    pub fn new(settings: MirrorSettings) -> Result<Self> {
        let client = Client::builder()
            .timeout(settings.timeout)
            .build()
            .context("Failed to build status mirror HTTP client")?;
        Ok(Self { client, settings })
    }

    /// POST one record to the webhook.
    pub async fn push(&self, record: &MirrorRecord) -> Result<()> {
        let mut request = self.client.post(&self.settings.url).json(record);
        if let Some(token) = &self.settings.token {
            request = request.header("Authorization", format!("Bearer {}", token));
        }

        let response = request
            .send()
            .await
            .context("Failed to reach status mirror")?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            anyhow::bail!("Status mirror error ({}): {}", status, error_text);
        }
        Ok(())
    }

    /// Mirror every event from the firehose until it closes.
    pub fn spawn(self, mut rx: broadcast::Receiver<ChipEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!(url = %self.settings.url, "status mirror started");
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        let Some(record) = MirrorRecord::from_event(&event) else {
                            continue;
                        };
                        if let Err(e) = self.push(&record).await {
                            tracing::warn!(chip_id = %record.chip_id, status = %record.status, "{:#}", e);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(skipped = n, "status mirror lagged, dropped events");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        tracing::info!("status mirror channel closed");
                        break;
                    }
                }
            }
        })
    }
}
