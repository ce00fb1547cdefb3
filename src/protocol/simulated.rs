//! Simulated WhatsApp Client
//!
//! Deterministic stand-in for a real protocol library. It walks a handle
//! through the same pairing/open sequence on timers, and exposes controls so
//! tests and demos can inject closes, pairings and inbound messages.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::{DashMap, DashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{EventSink, InboundMessage, ProtocolClient, ProtocolError, ProtocolEvent, ProtocolHandle};
use crate::session::{ChipId, CloseReason, CredentialsRef};

/// Timing of the simulated pairing flow. `None` disables that automatic step.
#[derive(Debug, Clone, Default)]
pub struct SimulatorSettings {
    /// Delay before an unpaired handle emits its pairing payload
    pub pairing_delay: Option<Duration>,
    /// Delay after the payload before the "phone" scans it
    pub auto_pair_after: Option<Duration>,
    /// Delay between pairing (or open for paired credentials) and `Open`
    pub open_delay: Option<Duration>,
}

impl SimulatorSettings {
    /// No automatic behaviour; everything is driven through the controls.
    pub fn manual() -> Self {
        Self::default()
    }
}

/// A message handed to a simulated handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub chip_id: ChipId,
    pub recipient: String,
    pub body: String,
    pub message_id: String,
}

struct Link {
    handle_id: u64,
    sink: EventSink,
}

#[derive(Default)]
struct SimState {
    next_handle: AtomicU64,
    payload_seq: AtomicU64,
    links: DashMap<ChipId, Link>,
    live: DashMap<ChipId, usize>,
    peak_live: DashMap<ChipId, usize>,
    opened: DashMap<ChipId, usize>,
    paired: DashSet<CredentialsRef>,
    forgotten: DashSet<CredentialsRef>,
    fail_opens: AtomicUsize,
    logouts: AtomicUsize,
    sent: Mutex<Vec<SentMessage>>,
    opened_notify: Notify,
}

impl SimState {
    fn next_payload(&self, chip_id: &ChipId) -> String {
        let seq = self.payload_seq.fetch_add(1, Ordering::Relaxed);
        format!("sim-qr:{}:{}:{}", chip_id, seq, Uuid::new_v4().simple())
    }
}

/// Protocol client backed by timers instead of a network.
#[derive(Clone, Default)]
pub struct SimulatedClient {
    settings: SimulatorSettings,
    state: Arc<SimState>,
}

impl SimulatedClient {
    pub fn new(settings: SimulatorSettings) -> Self {
        Self {
            settings,
            state: Arc::new(SimState::default()),
        }
    }

    /// Deliver an event through the chip's most recent handle.
    pub fn emit(&self, chip_id: &ChipId, event: ProtocolEvent) -> bool {
        match self.state.links.get(chip_id) {
            Some(link) => link.sink.emit(event),
            None => false,
        }
    }

    /// Emit a fresh, never-repeated pairing payload and return it.
    pub fn emit_pairing(&self, chip_id: &ChipId) -> Option<String> {
        let payload = self.state.next_payload(chip_id);
        self.emit(chip_id, ProtocolEvent::PairingPayload(payload.clone()))
            .then_some(payload)
    }

    /// Simulate the phone scanning the code: credentials become valid.
    pub fn complete_pairing(&self, chip_id: &ChipId, credentials: &CredentialsRef) -> bool {
        self.state.paired.insert(credentials.clone());
        self.emit(chip_id, ProtocolEvent::Paired)
    }

    /// Drop the chip's connection from the "server" side.
    pub fn drop_connection(&self, chip_id: &ChipId, reason: CloseReason) -> bool {
        tracing::debug!(chip_id = %chip_id, reason = %reason, "simulated connection drop");
        self.emit(chip_id, ProtocolEvent::Close(reason))
    }

    /// Deliver an inbound chat message.
    pub fn deliver(&self, chip_id: &ChipId, from: &str, body: &str) -> bool {
        self.emit(
            chip_id,
            ProtocolEvent::MessageReceived(InboundMessage {
                message_id: format!("sim-in-{}", Uuid::new_v4().simple()),
                from: from.to_string(),
                body: body.to_string(),
                received_at: Utc::now(),
            }),
        )
    }

    /// Make the next `count` calls to `open` fail.
    pub fn fail_next_opens(&self, count: usize) {
        self.state.fail_opens.store(count, Ordering::SeqCst);
    }

    /// Mark credentials as already paired, so handles open without a QR code.
    pub fn mark_paired(&self, credentials: &CredentialsRef) {
        self.state.paired.insert(credentials.clone());
    }

    pub fn is_paired(&self, credentials: &CredentialsRef) -> bool {
        self.state.paired.contains(credentials)
    }

    pub fn was_forgotten(&self, credentials: &CredentialsRef) -> bool {
        self.state.forgotten.contains(credentials)
    }

    /// Handles successfully opened for the chip since creation.
    pub fn opened_count(&self, chip_id: &ChipId) -> usize {
        self.state.opened.get(chip_id).map(|n| *n).unwrap_or(0)
    }

    /// Handles for the chip that are open right now.
    pub fn live_handles(&self, chip_id: &ChipId) -> usize {
        self.state.live.get(chip_id).map(|n| *n).unwrap_or(0)
    }

    /// Highest number of simultaneously open handles ever seen for the chip.
    pub fn peak_live_handles(&self, chip_id: &ChipId) -> usize {
        self.state.peak_live.get(chip_id).map(|n| *n).unwrap_or(0)
    }

    pub fn logout_count(&self) -> usize {
        self.state.logouts.load(Ordering::SeqCst)
    }

    pub async fn sent_messages(&self) -> Vec<SentMessage> {
        self.state.sent.lock().await.clone()
    }

    /// Wait until at least `count` handles have been opened for the chip.
    pub async fn wait_for_open(&self, chip_id: &ChipId, count: usize) {
        loop {
            let notified = self.state.opened_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.opened_count(chip_id) >= count {
                return;
            }
            notified.await;
        }
    }

    fn spawn_flow(&self, chip_id: ChipId, credentials: CredentialsRef, sink: EventSink, cancel: CancellationToken) {
        let settings = self.settings.clone();
        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            let flow = async {
                if !state.paired.contains(&credentials) {
                    let Some(delay) = settings.pairing_delay else { return };
                    tokio::time::sleep(delay).await;
                    if !sink.emit(ProtocolEvent::PairingPayload(state.next_payload(&chip_id))) {
                        return;
                    }
                    let Some(delay) = settings.auto_pair_after else { return };
                    tokio::time::sleep(delay).await;
                    state.paired.insert(credentials.clone());
                    if !sink.emit(ProtocolEvent::Paired) {
                        return;
                    }
                }
                let Some(delay) = settings.open_delay else { return };
                tokio::time::sleep(delay).await;
                sink.emit(ProtocolEvent::Open);
            };
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = flow => {}
            }
        });
    }
}

#[async_trait]
impl ProtocolClient for SimulatedClient {
    async fn open(
        &self,
        chip_id: &ChipId,
        credentials: &CredentialsRef,
        events: EventSink,
    ) -> Result<Box<dyn ProtocolHandle>, ProtocolError> {
        let pending_failures = self
            .state
            .fail_opens
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if pending_failures.is_ok() {
            return Err(ProtocolError::Open("simulated open failure".into()));
        }

        let handle_id = self.state.next_handle.fetch_add(1, Ordering::Relaxed);
        let live = {
            let mut live = self.state.live.entry(chip_id.clone()).or_insert(0);
            *live += 1;
            *live
        };
        {
            let mut peak = self.state.peak_live.entry(chip_id.clone()).or_insert(0);
            *peak = (*peak).max(live);
        }
        *self.state.opened.entry(chip_id.clone()).or_insert(0) += 1;
        self.state.links.insert(
            chip_id.clone(),
            Link {
                handle_id,
                sink: events.clone(),
            },
        );
        self.state.opened_notify.notify_waiters();

        tracing::debug!(chip_id = %chip_id, handle = handle_id, "simulated handle opened");

        let cancel = CancellationToken::new();
        self.spawn_flow(chip_id.clone(), credentials.clone(), events, cancel.clone());

        Ok(Box::new(SimulatedHandle {
            chip_id: chip_id.clone(),
            credentials: credentials.clone(),
            handle_id,
            cancel,
            closed: false,
            state: Arc::clone(&self.state),
        }))
    }

    async fn forget(&self, credentials: &CredentialsRef) -> Result<(), ProtocolError> {
        self.state.paired.remove(credentials);
        self.state.forgotten.insert(credentials.clone());
        Ok(())
    }
}

struct SimulatedHandle {
    chip_id: ChipId,
    credentials: CredentialsRef,
    handle_id: u64,
    cancel: CancellationToken,
    closed: bool,
    state: Arc<SimState>,
}

#[async_trait]
impl ProtocolHandle for SimulatedHandle {
    async fn send(&self, recipient: &str, body: &str) -> Result<String, ProtocolError> {
        if self.closed {
            return Err(ProtocolError::Closed);
        }
        let message_id = format!("sim-out-{}", Uuid::new_v4().simple());
        self.state.sent.lock().await.push(SentMessage {
            chip_id: self.chip_id.clone(),
            recipient: recipient.to_string(),
            body: body.to_string(),
            message_id: message_id.clone(),
        });
        Ok(message_id)
    }

    async fn logout(&mut self) -> Result<(), ProtocolError> {
        if self.closed {
            return Err(ProtocolError::Closed);
        }
        self.state.paired.remove(&self.credentials);
        self.state.logouts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.cancel.cancel();
        if let Some(mut live) = self.state.live.get_mut(&self.chip_id) {
            *live = live.saturating_sub(1);
        }
        self.state
            .links
            .remove_if(&self.chip_id, |_, link| link.handle_id == self.handle_id);
        tracing::debug!(chip_id = %self.chip_id, handle = self.handle_id, "simulated handle closed");
    }
}

impl Drop for SimulatedHandle {
    fn drop(&mut self) {
        if !self.closed {
            self.cancel.cancel();
            if let Some(mut live) = self.state.live.get_mut(&self.chip_id) {
                *live = live.saturating_sub(1);
            }
            self.state
                .links
                .remove_if(&self.chip_id, |_, link| link.handle_id == self.handle_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn sink(generation: u64) -> (EventSink, mpsc::UnboundedReceiver<(u64, ProtocolEvent)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (EventSink::new(generation, tx), rx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_unpaired_flow_emits_qr_then_open() {
        let client = SimulatedClient::new(SimulatorSettings {
            pairing_delay: Some(Duration::from_millis(10)),
            auto_pair_after: Some(Duration::from_millis(10)),
            open_delay: Some(Duration::from_millis(10)),
        });
        let chip = ChipId::from("chip-1");
        let creds = CredentialsRef::new("creds/chip-1");
        let (events, mut rx) = sink(1);

        let _handle = client.open(&chip, &creds, events).await.unwrap();

        let (_, first) = rx.recv().await.unwrap();
        assert!(matches!(first, ProtocolEvent::PairingPayload(ref p) if p.starts_with("sim-qr:chip-1")));
        assert_eq!(rx.recv().await.unwrap().1, ProtocolEvent::Paired);
        assert_eq!(rx.recv().await.unwrap().1, ProtocolEvent::Open);
        assert!(client.is_paired(&creds));
    }

    #[tokio::test(start_paused = true)]
    async fn test_paired_credentials_skip_qr() {
        let client = SimulatedClient::new(SimulatorSettings {
            pairing_delay: Some(Duration::from_millis(10)),
            auto_pair_after: None,
            open_delay: Some(Duration::from_millis(5)),
        });
        let chip = ChipId::from("chip-2");
        let creds = CredentialsRef::new("creds/chip-2");
        client.mark_paired(&creds);
        let (events, mut rx) = sink(1);

        let _handle = client.open(&chip, &creds, events).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().1, ProtocolEvent::Open);
    }

    #[tokio::test]
    async fn test_pairing_payloads_are_unique() {
        let client = SimulatedClient::new(SimulatorSettings::manual());
        let chip = ChipId::from("chip-1");
        let (events, _rx) = sink(1);
        let _handle = client
            .open(&chip, &CredentialsRef::new("c"), events)
            .await
            .unwrap();

        let p1 = client.emit_pairing(&chip).unwrap();
        let p2 = client.emit_pairing(&chip).unwrap();
        assert_ne!(p1, p2);
    }

    #[tokio::test]
    async fn test_close_tracks_live_handles() {
        let client = SimulatedClient::new(SimulatorSettings::manual());
        let chip = ChipId::from("chip-1");
        let creds = CredentialsRef::new("c");

        let (events, _rx) = sink(1);
        let mut handle = client.open(&chip, &creds, events).await.unwrap();
        assert_eq!(client.live_handles(&chip), 1);

        handle.close().await;
        handle.close().await;
        assert_eq!(client.live_handles(&chip), 0);
        assert_eq!(client.opened_count(&chip), 1);
        assert_eq!(client.peak_live_handles(&chip), 1);
        assert!(!client.emit(&chip, ProtocolEvent::Open));
    }

    #[tokio::test]
    async fn test_fail_next_opens() {
        let client = SimulatedClient::new(SimulatorSettings::manual());
        let chip = ChipId::from("chip-1");
        client.fail_next_opens(1);

        let (events, _rx) = sink(1);
        assert!(client.open(&chip, &CredentialsRef::new("c"), events).await.is_err());

        let (events, _rx) = sink(2);
        assert!(client.open(&chip, &CredentialsRef::new("c"), events).await.is_ok());
        assert_eq!(client.opened_count(&chip), 1);
    }

    #[tokio::test]
    async fn test_send_records_message() {
        let client = SimulatedClient::new(SimulatorSettings::manual());
        let chip = ChipId::from("chip-3");
        let (events, _rx) = sink(1);
        let handle = client.open(&chip, &CredentialsRef::new("c"), events).await.unwrap();

        let id = handle.send("+100", "hi").await.unwrap();
        let sent = client.sent_messages().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].message_id, id);
        assert_eq!(sent[0].recipient, "+100");
    }

    #[tokio::test]
    async fn test_logout_and_forget_invalidate_credentials() {
        let client = SimulatedClient::new(SimulatorSettings::manual());
        let chip = ChipId::from("chip-4");
        let creds = CredentialsRef::new("creds/chip-4");
        client.mark_paired(&creds);

        let (events, _rx) = sink(1);
        let mut handle = client.open(&chip, &creds, events).await.unwrap();
        handle.logout().await.unwrap();
        assert!(!client.is_paired(&creds));
        assert_eq!(client.logout_count(), 1);

        client.forget(&creds).await.unwrap();
        assert!(client.was_forgotten(&creds));
    }
}
