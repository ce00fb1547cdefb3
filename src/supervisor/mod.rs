//! Session Supervisor
//!
//! Owns the lifecycle of every chip's WhatsApp connection. Each chip gets a
//! dedicated actor task that serializes its transitions; different chips run
//! fully in parallel. The public API only posts commands and awaits replies,
//! so `connect`, `disconnect` and `send` return promptly.

mod actor;
pub mod policy;

pub use policy::{BackoffPolicy, SupervisorPolicy};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

use crate::error::{ChipgateError, Result};
use crate::events::EventBus;
use crate::protocol::ProtocolClient;
use crate::session::{ChipId, Session, SessionStatus, SessionStore, Snapshot};

use actor::ActorContext;

/// Proof that a message was handed to the protocol layer. Not a delivery receipt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendReceipt {
    pub message_id: String,
    pub enqueued_at: DateTime<Utc>,
}

pub(crate) enum Command {
    Connect {
        reply: oneshot::Sender<Result<SessionStatus>>,
    },
    Disconnect {
        reply: oneshot::Sender<SessionStatus>,
    },
    Send {
        recipient: String,
        body: String,
        reply: oneshot::Sender<Result<SendReceipt>>,
    },
    QrExpired {
        epoch: u64,
    },
    RetryDue {
        epoch: u64,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

type Mailbox = mpsc::UnboundedSender<Command>;
type Registry = DashMap<ChipId, Mailbox>;

struct Inner {
    store: Arc<SessionStore>,
    bus: EventBus,
    client: Arc<dyn ProtocolClient>,
    policy: Arc<SupervisorPolicy>,
    actors: Arc<Registry>,
}

/// Registry of per-chip actors plus the shared session store.
#[derive(Clone)]
pub struct SessionSupervisor {
    inner: Arc<Inner>,
}

impl SessionSupervisor {
    pub fn new(client: Arc<dyn ProtocolClient>, bus: EventBus, policy: SupervisorPolicy) -> Self {
        Self {
            inner: Arc::new(Inner {
                store: Arc::new(SessionStore::new()),
                bus,
                client,
                policy: Arc::new(policy),
                actors: Arc::new(DashMap::new()),
            }),
        }
    }

    pub fn store(&self) -> &SessionStore {
        &self.inner.store
    }

    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    pub fn policy(&self) -> &SupervisorPolicy {
        &self.inner.policy
    }

    /// Start connecting the chip. Returns the status right after the request
    /// was applied; never waits for pairing.
    ///
    /// Idempotent while the chip is already connecting, pairing or connected.
    pub async fn connect(&self, chip_id: &ChipId) -> Result<SessionStatus> {
        let (reply, rx) = oneshot::channel();
        self.dispatch(chip_id, Command::Connect { reply }, true)
            .map_err(|_| ChipgateError::SupervisorClosed(chip_id.to_string()))?;
        rx.await
            .map_err(|_| ChipgateError::SupervisorClosed(chip_id.to_string()))?
    }

    /// Log the chip out, cancel pending timers and drop its session.
    pub async fn disconnect(&self, chip_id: &ChipId) -> Result<SessionStatus> {
        let (reply, rx) = oneshot::channel();
        match self.dispatch(chip_id, Command::Disconnect { reply }, false) {
            // A concurrent shutdown may drop the reply; the chip is gone either way
            Ok(()) => Ok(rx.await.unwrap_or(SessionStatus::Disconnected)),
            Err(_) => Ok(SessionStatus::Disconnected),
        }
    }

    /// Hand a text message to the chip's protocol handle.
    pub async fn send(&self, chip_id: &ChipId, recipient: &str, body: &str) -> Result<SendReceipt> {
        if recipient.trim().is_empty() {
            return Err(ChipgateError::InvalidRequest("recipient must not be empty".into()));
        }
        if body.is_empty() {
            return Err(ChipgateError::InvalidRequest("body must not be empty".into()));
        }

        let (reply, rx) = oneshot::channel();
        let command = Command::Send {
            recipient: recipient.trim().to_string(),
            body: body.to_string(),
            reply,
        };
        match self.dispatch(chip_id, command, false) {
            Ok(()) => rx
                .await
                .map_err(|_| ChipgateError::SupervisorClosed(chip_id.to_string()))?,
            Err(_) => Err(ChipgateError::NotConnected {
                chip_id: chip_id.to_string(),
                status: self
                    .inner
                    .store
                    .get(chip_id)
                    .map(|session| session.status)
                    .unwrap_or_default(),
            }),
        }
    }

    /// Current record for the chip, if it has one.
    pub fn status(&self, chip_id: &ChipId) -> Option<Session> {
        self.inner.store.get(chip_id)
    }

    pub fn sessions(&self) -> Snapshot {
        self.inner.store.list()
    }

    /// Number of chips with a running actor.
    pub fn active_chips(&self) -> usize {
        self.inner.actors.len()
    }

    /// Close every live handle without logging out, keeping credentials.
    pub async fn shutdown(&self) {
        let mailboxes: Vec<(ChipId, Mailbox)> = self
            .inner
            .actors
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        tracing::info!(chips = mailboxes.len(), "shutting down session supervisor");

        let mut pending = Vec::with_capacity(mailboxes.len());
        for (chip_id, mailbox) in mailboxes {
            let (reply, rx) = oneshot::channel();
            if mailbox.send(Command::Shutdown { reply }).is_ok() {
                pending.push((chip_id, rx));
            }
        }
        for (chip_id, rx) in pending {
            if rx.await.is_err() {
                tracing::debug!(chip_id = %chip_id, "actor exited before acknowledging shutdown");
            }
        }
    }

    /// Post a command to the chip's actor, optionally starting one.
    ///
    /// The send happens while the registry entry is held, so a retiring actor
    /// can never drop a command that was accepted into its mailbox.
    fn dispatch(&self, chip_id: &ChipId, command: Command, spawn: bool) -> std::result::Result<(), Command> {
        if let Some(mailbox) = self.inner.actors.get(chip_id) {
            return mailbox.send(command).map_err(|e| e.0);
        }
        if !spawn {
            return Err(command);
        }

        let mailbox = self
            .inner
            .actors
            .entry(chip_id.clone())
            .or_insert_with(|| actor::spawn(chip_id.clone(), self.actor_context()));
        mailbox.send(command).map_err(|e| e.0)
    }

    fn actor_context(&self) -> ActorContext {
        ActorContext {
            store: Arc::clone(&self.inner.store),
            bus: self.inner.bus.clone(),
            client: Arc::clone(&self.inner.client),
            policy: Arc::clone(&self.inner.policy),
            registry: Arc::downgrade(&self.inner.actors),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::events::{ChipEvent, SessionEvent, Subscription};
    use crate::protocol::{MockProtocolClient, SimulatedClient, SimulatorSettings};
    use crate::session::{CloseReason, CredentialsRef};
    use proptest::prelude::*;
    use std::time::Duration;

    fn harness(settings: SimulatorSettings, policy: SupervisorPolicy) -> (SessionSupervisor, SimulatedClient) {
        let sim = SimulatedClient::new(settings);
        let supervisor = SessionSupervisor::new(Arc::new(sim.clone()), EventBus::default(), policy);
        (supervisor, sim)
    }

    fn manual() -> (SessionSupervisor, SimulatedClient) {
        harness(SimulatorSettings::manual(), SupervisorPolicy::default())
    }

    fn automatic() -> SimulatorSettings {
        SimulatorSettings {
            pairing_delay: Some(Duration::from_millis(10)),
            auto_pair_after: Some(Duration::from_millis(10)),
            open_delay: Some(Duration::from_millis(10)),
        }
    }

    fn creds(supervisor: &SessionSupervisor, chip: &ChipId) -> CredentialsRef {
        CredentialsRef::for_chip(&supervisor.policy().credentials_dir, chip)
    }

    async fn next(sub: &mut Subscription) -> ChipEvent {
        sub.recv().await.unwrap()
    }

    /// Skip events until the chip reaches `status`.
    async fn wait_for(sub: &mut Subscription, status: SessionStatus) -> ChipEvent {
        loop {
            let event = next(sub).await;
            if event.event.status() == Some(status) {
                return event;
            }
        }
    }

    async fn connected_chip(supervisor: &SessionSupervisor, sim: &SimulatedClient, chip: &ChipId) -> Subscription {
        let mut sub = supervisor.bus().subscribe(chip);
        supervisor.connect(chip).await.unwrap();
        sim.wait_for_open(chip, 1).await;
        sim.emit(chip, crate::protocol::ProtocolEvent::Open);
        wait_for(&mut sub, SessionStatus::Connected).await;
        sub
    }

    #[tokio::test]
    async fn test_full_pairing_flow_in_order() {
        let (supervisor, sim) = manual();
        let chip = ChipId::from("chip-1");
        let mut sub = supervisor.bus().subscribe(&chip);

        assert_eq!(supervisor.connect(&chip).await.unwrap(), SessionStatus::Connecting);
        sim.wait_for_open(&chip, 1).await;

        let p1 = sim.emit_pairing(&chip).unwrap();
        assert!(sim.complete_pairing(&chip, &creds(&supervisor, &chip)));
        assert!(sim.emit(&chip, crate::protocol::ProtocolEvent::Open));

        let mut seen = Vec::new();
        for _ in 0..5 {
            seen.push(next(&mut sub).await);
        }
        let statuses: Vec<_> = seen.iter().map(|e| e.event.status().unwrap()).collect();
        assert_eq!(
            statuses,
            vec![
                SessionStatus::Disconnected,
                SessionStatus::Connecting,
                SessionStatus::QrReady,
                SessionStatus::Authenticated,
                SessionStatus::Connected,
            ]
        );
        assert!(matches!(
            &seen[2].event,
            SessionEvent::QrUpdated { qr_payload, .. } if *qr_payload == p1
        ));

        let session = supervisor.status(&chip).unwrap();
        assert_eq!(session.status, SessionStatus::Connected);
        assert!(session.qr_payload.is_none());
        assert_eq!(session.reconnect_attempts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_qr_is_replaced_with_fresh_payload() {
        let settings = SimulatorSettings {
            pairing_delay: Some(Duration::from_millis(10)),
            auto_pair_after: None,
            open_delay: None,
        };
        let (supervisor, sim) = harness(settings, SupervisorPolicy::default());
        let chip = ChipId::from("chip-1");
        let mut sub = supervisor.bus().subscribe(&chip);

        supervisor.connect(&chip).await.unwrap();
        let first = wait_for(&mut sub, SessionStatus::QrReady).await;
        let SessionEvent::QrUpdated { qr_payload: p1, .. } = first.event else {
            unreachable!("qr_ready is always published as qr_updated")
        };

        let refreshing = next(&mut sub).await;
        assert_eq!(refreshing.event.status(), Some(SessionStatus::Connecting));

        let second = next(&mut sub).await;
        let SessionEvent::QrUpdated { qr_payload: p2, .. } = second.event else {
            unreachable!("qr_ready is always published as qr_updated")
        };
        assert_ne!(p1, p2);
        assert_eq!(supervisor.status(&chip).unwrap().qr_refreshes, 1);
        assert_eq!(sim.live_handles(&chip), 1);
        assert_eq!(sim.peak_live_handles(&chip), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_qr_refreshes_are_bounded() {
        let settings = SimulatorSettings {
            pairing_delay: Some(Duration::from_millis(10)),
            auto_pair_after: None,
            open_delay: None,
        };
        let policy = SupervisorPolicy {
            qr_timeout: Duration::from_secs(1),
            max_qr_refreshes: 1,
            ..Default::default()
        };
        let (supervisor, sim) = harness(settings, policy);
        let chip = ChipId::from("chip-1");
        let mut sub = supervisor.bus().subscribe(&chip);

        supervisor.connect(&chip).await.unwrap();
        let failed = wait_for(&mut sub, SessionStatus::Error).await;
        assert!(matches!(
            failed.event,
            SessionEvent::Error { error: ErrorKind::PairingTimeout, .. }
        ));
        assert_eq!(sim.opened_count(&chip), 2);
        assert_eq!(sim.live_handles(&chip), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_network_drop_reconnects_and_resets_attempts() {
        let (supervisor, sim) = harness(automatic(), SupervisorPolicy::default());
        let chip = ChipId::from("chip-1");
        let mut sub = supervisor.bus().subscribe(&chip);

        supervisor.connect(&chip).await.unwrap();
        wait_for(&mut sub, SessionStatus::Connected).await;

        assert!(sim.drop_connection(&chip, CloseReason::NetworkDrop));
        let retrying = next(&mut sub).await;
        assert!(matches!(
            retrying.event,
            SessionEvent::StatusChanged { status: SessionStatus::Connecting, reconnect_attempts: 1, .. }
        ));

        // Credentials are already paired, so no QR code on the way back
        let back = next(&mut sub).await;
        assert_eq!(back.event.status(), Some(SessionStatus::Connected));
        assert_eq!(supervisor.status(&chip).unwrap().reconnect_attempts, 0);
        assert_eq!(sim.opened_count(&chip), 2);
        assert_eq!(sim.peak_live_handles(&chip), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_gives_up_after_bound() {
        let (supervisor, sim) = manual();
        let chip = ChipId::from("chip-1");
        let mut sub = connected_chip(&supervisor, &sim, &chip).await;

        for attempt in 1..=10u32 {
            assert!(sim.drop_connection(&chip, CloseReason::NetworkDrop));
            let event = next(&mut sub).await;
            assert!(matches!(
                event.event,
                SessionEvent::StatusChanged { status: SessionStatus::Connecting, reconnect_attempts, .. }
                    if reconnect_attempts == attempt
            ));
            sim.wait_for_open(&chip, attempt as usize + 1).await;
        }

        assert!(sim.drop_connection(&chip, CloseReason::NetworkDrop));
        let failed = next(&mut sub).await;
        assert!(matches!(
            failed.event,
            SessionEvent::Error { error: ErrorKind::UnexpectedClose, .. }
        ));

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(sim.opened_count(&chip), 11);
        assert_eq!(sim.live_handles(&chip), 0);
        let session = supervisor.status(&chip).unwrap();
        assert_eq!(session.status, SessionStatus::Error);
        assert_eq!(session.reconnect_attempts, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_from_closed_handle_are_ignored() {
        let (supervisor, sim) = manual();
        let chip = ChipId::from("chip-1");
        let mut sub = connected_chip(&supervisor, &sim, &chip).await;

        // Both are queued by the old handle before the actor sees the close
        assert!(sim.drop_connection(&chip, CloseReason::NetworkDrop));
        assert!(sim.emit(&chip, crate::protocol::ProtocolEvent::Open));

        let retrying = next(&mut sub).await;
        assert_eq!(retrying.event.status(), Some(SessionStatus::Connecting));

        sim.wait_for_open(&chip, 2).await;
        let session = supervisor.status(&chip).unwrap();
        assert_eq!(session.status, SessionStatus::Connecting);
        assert_eq!(session.reconnect_attempts, 1);
        assert_eq!(sim.live_handles(&chip), 1);
        assert!(matches!(
            supervisor.send(&chip, "+15550001", "hi").await,
            Err(ChipgateError::NotConnected { status: SessionStatus::Connecting, .. })
        ));

        // The reopened handle still drives the chip
        assert!(sim.emit(&chip, crate::protocol::ProtocolEvent::Open));
        assert_eq!(next(&mut sub).await.event.status(), Some(SessionStatus::Connected));
        assert!(supervisor.send(&chip, "+15550001", "hi").await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_during_backoff_cancels_retry() {
        let (supervisor, sim) = manual();
        let chip = ChipId::from("chip-2");
        let mut sub = connected_chip(&supervisor, &sim, &chip).await;

        assert!(sim.drop_connection(&chip, CloseReason::NetworkDrop));
        wait_for(&mut sub, SessionStatus::Connecting).await;

        assert_eq!(supervisor.disconnect(&chip).await.unwrap(), SessionStatus::Disconnected);
        assert_eq!(next(&mut sub).await.event.status(), Some(SessionStatus::Disconnected));

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(supervisor.status(&chip).is_none());
        assert_eq!(sim.opened_count(&chip), 1);
        assert_eq!(sim.live_handles(&chip), 0);
        assert_eq!(supervisor.active_chips(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_during_qr_cancels_expiry() {
        let (supervisor, sim) = manual();
        let chip = ChipId::from("chip-2");
        let mut sub = supervisor.bus().subscribe(&chip);

        supervisor.connect(&chip).await.unwrap();
        sim.wait_for_open(&chip, 1).await;
        sim.emit_pairing(&chip).unwrap();
        wait_for(&mut sub, SessionStatus::QrReady).await;

        assert_eq!(supervisor.disconnect(&chip).await.unwrap(), SessionStatus::Disconnected);
        assert!(supervisor.status(&chip).is_none());
        assert_eq!(next(&mut sub).await.event.status(), Some(SessionStatus::Disconnected));

        tokio::time::sleep(Duration::from_secs(300)).await;
        assert!(supervisor.status(&chip).is_none());
        assert_eq!(sim.opened_count(&chip), 1);
        assert_eq!(sim.live_handles(&chip), 0);
        assert_eq!(sim.logout_count(), 1);
        assert_eq!(supervisor.active_chips(), 0);
    }

    #[tokio::test]
    async fn test_send_while_disconnected_never_reaches_client() {
        let mut client = MockProtocolClient::new();
        client.expect_open().times(0);
        client.expect_forget().times(0);
        let supervisor = SessionSupervisor::new(Arc::new(client), EventBus::default(), SupervisorPolicy::default());
        let chip = ChipId::from("chip-3");

        let err = supervisor.send(&chip, "+100", "hi").await.unwrap_err();
        assert!(matches!(
            err,
            ChipgateError::NotConnected { ref chip_id, status: SessionStatus::Disconnected } if chip_id == "chip-3"
        ));
        assert!(supervisor.status(&chip).is_none());
        assert!(supervisor.sessions().is_empty());
    }

    #[tokio::test]
    async fn test_send_while_pairing_is_rejected() {
        let (supervisor, sim) = manual();
        let chip = ChipId::from("chip-3");
        supervisor.connect(&chip).await.unwrap();
        sim.wait_for_open(&chip, 1).await;

        let err = supervisor.send(&chip, "+100", "hi").await.unwrap_err();
        assert!(matches!(err, ChipgateError::NotConnected { status: SessionStatus::Connecting, .. }));
        assert!(sim.sent_messages().await.is_empty());
    }

    #[tokio::test]
    async fn test_send_when_connected_returns_receipt() {
        let (supervisor, sim) = manual();
        let chip = ChipId::from("chip-4");
        let _sub = connected_chip(&supervisor, &sim, &chip).await;

        let receipt = supervisor.send(&chip, "+100", "hi").await.unwrap();
        let sent = sim.sent_messages().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].message_id, receipt.message_id);
        assert_eq!(sent[0].body, "hi");
    }

    #[tokio::test]
    async fn test_send_rejects_empty_recipient() {
        let (supervisor, _sim) = manual();
        let err = supervisor
            .send(&ChipId::from("chip-4"), "  ", "hi")
            .await
            .unwrap_err();
        assert!(matches!(err, ChipgateError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_logged_out_removes_session_and_credentials() {
        let (supervisor, sim) = manual();
        let chip = ChipId::from("chip-5");
        let mut sub = connected_chip(&supervisor, &sim, &chip).await;
        let credentials = creds(&supervisor, &chip);

        assert!(sim.drop_connection(&chip, CloseReason::LoggedOut));
        let gone = next(&mut sub).await;
        assert!(matches!(
            gone.event,
            SessionEvent::StatusChanged {
                status: SessionStatus::Disconnected,
                reason: Some(ErrorKind::LoggedOut),
                ..
            }
        ));
        assert!(supervisor.status(&chip).is_none());
        assert!(sim.was_forgotten(&credentials));
        assert_eq!(sim.live_handles(&chip), 0);

        assert_eq!(supervisor.connect(&chip).await.unwrap(), SessionStatus::Connecting);
        let fresh = supervisor.status(&chip).unwrap();
        assert_eq!(fresh.reconnect_attempts, 0);
        sim.wait_for_open(&chip, 2).await;
    }

    #[tokio::test]
    async fn test_connect_is_idempotent_while_active() {
        let (supervisor, sim) = manual();
        let chip = ChipId::from("chip-6");

        assert_eq!(supervisor.connect(&chip).await.unwrap(), SessionStatus::Connecting);
        sim.wait_for_open(&chip, 1).await;
        assert_eq!(supervisor.connect(&chip).await.unwrap(), SessionStatus::Connecting);

        sim.emit(&chip, crate::protocol::ProtocolEvent::Open);
        let mut sub = supervisor.bus().subscribe(&chip);
        wait_for(&mut sub, SessionStatus::Connected).await;
        assert_eq!(supervisor.connect(&chip).await.unwrap(), SessionStatus::Connected);
        assert_eq!(sim.opened_count(&chip), 1);
    }

    #[tokio::test]
    async fn test_open_failure_parks_in_error_until_operator_retry() {
        let (supervisor, sim) = manual();
        let chip = ChipId::from("chip-7");
        let mut sub = supervisor.bus().subscribe(&chip);
        sim.fail_next_opens(1);

        assert_eq!(supervisor.connect(&chip).await.unwrap(), SessionStatus::Connecting);
        let failed = wait_for(&mut sub, SessionStatus::Error).await;
        assert!(matches!(
            failed.event,
            SessionEvent::Error { error: ErrorKind::HandleCreationFailed, .. }
        ));
        assert_eq!(sim.opened_count(&chip), 0);

        assert_eq!(supervisor.connect(&chip).await.unwrap(), SessionStatus::Connecting);
        sim.wait_for_open(&chip, 1).await;
    }

    #[tokio::test]
    async fn test_messages_are_published_only_when_connected() {
        let (supervisor, sim) = manual();
        let chip = ChipId::from("chip-8");
        let mut sub = connected_chip(&supervisor, &sim, &chip).await;

        assert!(sim.deliver(&chip, "+200", "hello"));
        let event = next(&mut sub).await;
        assert!(matches!(
            event.event,
            SessionEvent::MessageReceived(ref m) if m.from == "+200" && m.body == "hello"
        ));
    }

    #[tokio::test]
    async fn test_shutdown_keeps_credentials() {
        let (supervisor, sim) = manual();
        let chip = ChipId::from("chip-9");
        let _sub = connected_chip(&supervisor, &sim, &chip).await;
        let credentials = creds(&supervisor, &chip);
        sim.mark_paired(&credentials);

        supervisor.shutdown().await;
        assert!(supervisor.sessions().is_empty());
        assert_eq!(sim.live_handles(&chip), 0);
        assert_eq!(sim.logout_count(), 0);
        assert!(sim.is_paired(&credentials));
        assert!(!sim.was_forgotten(&credentials));
    }

    #[tokio::test]
    async fn test_disconnect_unknown_chip_is_noop() {
        let (supervisor, _sim) = manual();
        let status = supervisor.disconnect(&ChipId::from("ghost")).await.unwrap();
        assert_eq!(status, SessionStatus::Disconnected);
        assert_eq!(supervisor.active_chips(), 0);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn test_concurrent_connects_open_one_handle(
            chips in prop::collection::vec(0usize..4, 1..32)
        ) {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(4)
                .enable_all()
                .build()
                .unwrap();

            runtime.block_on(async {
                let (supervisor, sim) = manual();
                let tasks: Vec<_> = chips
                    .iter()
                    .map(|n| {
                        let supervisor = supervisor.clone();
                        let chip = ChipId::from(format!("chip-{n}").as_str());
                        tokio::spawn(async move { supervisor.connect(&chip).await })
                    })
                    .collect();
                for task in tasks {
                    assert!(task.await.unwrap().is_ok());
                }

                let mut distinct = chips.clone();
                distinct.sort_unstable();
                distinct.dedup();
                for n in distinct {
                    let chip = ChipId::from(format!("chip-{n}").as_str());
                    sim.wait_for_open(&chip, 1).await;
                    assert_eq!(sim.opened_count(&chip), 1);
                    assert_eq!(sim.live_handles(&chip), 1);
                }
                assert_eq!(supervisor.sessions().len(), supervisor.active_chips());
            });
        }
    }
}
