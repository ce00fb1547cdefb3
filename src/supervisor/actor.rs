//! Per-chip actor.
//!
//! One task per chip owns the protocol handle and applies every transition
//! for that chip in mailbox order. Timers never touch state directly: they
//! post an epoch-stamped command back into the mailbox, and a command whose
//! epoch no longer matches the armed timer is ignored.

use chrono::Utc;
use std::ops::ControlFlow;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::policy::SupervisorPolicy;
use super::{Command, Mailbox, Registry, SendReceipt};
use crate::error::{ChipgateError, ErrorKind, Result};
use crate::events::{EventBus, SessionEvent};
use crate::protocol::{EventSink, ProtocolClient, ProtocolEvent, ProtocolHandle};
use crate::session::{ChipId, CloseReason, CredentialsRef, Session, SessionStatus, SessionStore};

/// Everything an actor shares with the supervisor.
#[derive(Clone)]
pub(super) struct ActorContext {
    pub store: Arc<SessionStore>,
    pub bus: EventBus,
    pub client: Arc<dyn ProtocolClient>,
    pub policy: Arc<SupervisorPolicy>,
    pub registry: Weak<Registry>,
}

#[derive(Debug, Clone, Copy)]
enum TimerKind {
    QrExpiry,
    Retry,
}

struct PendingTimer {
    epoch: u64,
    token: CancellationToken,
}

/// Start the actor for `chip_id` and return its mailbox.
pub(super) fn spawn(chip_id: ChipId, ctx: ActorContext) -> Mailbox {
    let (tx, rx) = mpsc::unbounded_channel();
    let actor = ChipActor::new(chip_id, ctx, tx.downgrade(), rx);
    tokio::spawn(actor.run());
    tx
}

struct ChipActor {
    chip_id: ChipId,
    ctx: ActorContext,
    mailbox: mpsc::WeakUnboundedSender<Command>,
    commands: mpsc::UnboundedReceiver<Command>,
    events_tx: mpsc::UnboundedSender<(u64, ProtocolEvent)>,
    events_rx: mpsc::UnboundedReceiver<(u64, ProtocolEvent)>,
    handle: Option<Box<dyn ProtocolHandle>>,
    /// Generation of the current handle; events stamped otherwise are stale
    generation: u64,
    timer: Option<PendingTimer>,
    epoch: u64,
}

impl ChipActor {
    fn new(
        chip_id: ChipId,
        ctx: ActorContext,
        mailbox: mpsc::WeakUnboundedSender<Command>,
        commands: mpsc::UnboundedReceiver<Command>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            chip_id,
            ctx,
            mailbox,
            commands,
            events_tx,
            events_rx,
            handle: None,
            generation: 0,
            timer: None,
            epoch: 0,
        }
    }

    async fn run(mut self) {
        tracing::debug!(chip_id = %self.chip_id, "chip actor started");

        loop {
            let flow = tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => {
                        self.cancel_timer();
                        self.close_handle().await;
                        ControlFlow::Break(())
                    }
                },
                Some((generation, event)) = self.events_rx.recv() => {
                    if generation == self.generation {
                        self.on_protocol_event(event).await;
                    } else {
                        tracing::trace!(chip_id = %self.chip_id, generation, "dropping event from stale handle");
                    }
                    ControlFlow::Continue(())
                }
            };

            if flow.is_break() || self.try_retire() {
                break;
            }
        }

        tracing::debug!(chip_id = %self.chip_id, "chip actor stopped");
    }

    /// Leave the registry once the chip has no session and nothing is queued.
    fn try_retire(&self) -> bool {
        if self.ctx.store.get(&self.chip_id).is_some() {
            return false;
        }
        let Some(registry) = self.ctx.registry.upgrade() else {
            return true;
        };
        let Some(mine) = self.mailbox.upgrade() else {
            return true;
        };
        if !registry
            .get(&self.chip_id)
            .is_some_and(|entry| entry.same_channel(&mine))
        {
            return true;
        }
        registry
            .remove_if(&self.chip_id, |_, tx| {
                tx.same_channel(&mine) && self.commands.is_empty()
            })
            .is_some()
    }

    fn leave_registry(&self) {
        if let (Some(registry), Some(mine)) = (self.ctx.registry.upgrade(), self.mailbox.upgrade()) {
            registry.remove_if(&self.chip_id, |_, tx| tx.same_channel(&mine));
        }
    }

    async fn handle_command(&mut self, command: Command) -> ControlFlow<()> {
        match command {
            Command::Connect { reply } => {
                if let Some(session) = self.ctx.store.get(&self.chip_id)
                    && session.status.is_active()
                {
                    let _ = reply.send(Ok(session.status));
                    return ControlFlow::Continue(());
                }
                self.begin_connect().await;
                let _ = reply.send(Ok(SessionStatus::Connecting));
                self.open_handle().await;
            }
            Command::Disconnect { reply } => {
                let status = self.disconnect().await;
                let _ = reply.send(status);
            }
            Command::Send {
                recipient,
                body,
                reply,
            } => {
                let _ = reply.send(self.send(&recipient, &body).await);
            }
            Command::QrExpired { epoch } => {
                if self.take_timer(epoch) {
                    self.on_qr_expired().await;
                }
            }
            Command::RetryDue { epoch } => {
                if self.take_timer(epoch) {
                    self.on_retry_due().await;
                }
            }
            Command::Shutdown { reply } => {
                self.cancel_timer();
                self.close_handle().await;
                if let Some(session) = self.ctx.store.remove(&self.chip_id) {
                    self.announce_removed(session, None);
                }
                self.leave_registry();
                let _ = reply.send(());
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    fn status(&self) -> SessionStatus {
        self.ctx
            .store
            .get(&self.chip_id)
            .map(|session| session.status)
            .unwrap_or_default()
    }

    /// Apply one transition to the store and publish exactly one event for it.
    fn transition(
        &self,
        to: SessionStatus,
        failure: Option<(ErrorKind, String)>,
        mutate: impl FnOnce(&mut Session),
    ) -> Session {
        let credentials = CredentialsRef::for_chip(&self.ctx.policy.credentials_dir, &self.chip_id);
        let session = self.ctx.store.upsert(
            &self.chip_id,
            || Session::new(self.chip_id.clone(), credentials),
            |session| {
                session.transition(to);
                mutate(session);
                session.clone()
            },
        );

        let event = match (to, failure) {
            (SessionStatus::QrReady, _) => SessionEvent::qr_updated(&session),
            (SessionStatus::Error, Some((kind, message))) => SessionEvent::error(&session, kind, message),
            (SessionStatus::Error, None) => {
                SessionEvent::error(&session, ErrorKind::UnexpectedClose, "session failed")
            }
            (_, failure) => SessionEvent::status_changed(&session, failure.map(|(kind, _)| kind)),
        };
        tracing::info!(chip_id = %self.chip_id, status = %to, "session transition");
        self.ctx.bus.publish(&self.chip_id, event);
        session
    }

    /// Publish the final `disconnected` state of a session just removed from the store.
    fn announce_removed(&self, mut session: Session, reason: Option<ErrorKind>) {
        session.transition(SessionStatus::Disconnected);
        tracing::info!(chip_id = %self.chip_id, status = %session.status, "session removed");
        self.ctx
            .bus
            .publish(&self.chip_id, SessionEvent::status_changed(&session, reason));
    }

    async fn begin_connect(&mut self) {
        self.cancel_timer();
        self.close_handle().await;
        self.transition(SessionStatus::Connecting, None, |session| {
            session.reconnect_attempts = 0;
            session.qr_refreshes = 0;
        });
    }

    /// Create a fresh handle for the chip. Any failure parks the chip in `error`.
    async fn open_handle(&mut self) {
        self.close_handle().await;
        let Some(session) = self.ctx.store.get(&self.chip_id) else {
            return;
        };

        let sink = EventSink::new(self.generation, self.events_tx.clone());
        match self
            .ctx
            .client
            .open(&self.chip_id, &session.credentials_ref, sink)
            .await
        {
            Ok(handle) => {
                tracing::debug!(chip_id = %self.chip_id, generation = self.generation, "protocol handle opened");
                self.handle = Some(handle);
            }
            Err(e) => {
                tracing::warn!(chip_id = %self.chip_id, error = %e, "failed to open protocol handle");
                self.fail(ErrorKind::HandleCreationFailed, e.to_string()).await;
            }
        }
    }

    /// Tear down the live handle. Whatever it already queued becomes stale.
    async fn close_handle(&mut self) {
        self.generation += 1;
        if let Some(mut handle) = self.handle.take() {
            handle.close().await;
        }
    }

    async fn fail(&mut self, kind: ErrorKind, message: String) {
        self.cancel_timer();
        self.close_handle().await;
        tracing::error!(chip_id = %self.chip_id, kind = %kind, "{}", message);
        self.transition(SessionStatus::Error, Some((kind, message)), |_| {});
    }

    async fn on_protocol_event(&mut self, event: ProtocolEvent) {
        let Some(session) = self.ctx.store.get(&self.chip_id) else {
            return;
        };
        let status = session.status;

        match event {
            ProtocolEvent::PairingPayload(payload) => {
                if !matches!(status, SessionStatus::Connecting | SessionStatus::QrReady) {
                    tracing::debug!(chip_id = %self.chip_id, status = %status, "ignoring pairing payload");
                    return;
                }
                let timeout = self.ctx.policy.qr_timeout;
                let expires_at = chrono::Duration::from_std(timeout)
                    .ok()
                    .and_then(|ttl| Utc::now().checked_add_signed(ttl));
                self.transition(SessionStatus::QrReady, None, |session| {
                    session.qr_payload = Some(payload);
                    session.qr_expires_at = expires_at;
                });
                self.schedule(TimerKind::QrExpiry, timeout);
            }
            ProtocolEvent::Paired => {
                if matches!(status, SessionStatus::QrReady | SessionStatus::Connecting) {
                    self.cancel_timer();
                    self.transition(SessionStatus::Authenticated, None, |_| {});
                }
            }
            ProtocolEvent::Open => {
                if matches!(status, SessionStatus::Authenticated | SessionStatus::Connecting) {
                    self.cancel_timer();
                    self.transition(SessionStatus::Connected, None, |session| {
                        session.reconnect_attempts = 0;
                        session.qr_refreshes = 0;
                    });
                }
            }
            ProtocolEvent::Close(reason) if reason.is_logged_out() => {
                self.on_logged_out(session).await;
            }
            ProtocolEvent::Close(reason) => {
                if status.is_active() {
                    self.on_unexpected_close(session, reason).await;
                }
            }
            ProtocolEvent::MessageReceived(message) => {
                if status == SessionStatus::Connected {
                    self.ctx
                        .bus
                        .publish(&self.chip_id, SessionEvent::MessageReceived(message));
                }
            }
        }
    }

    async fn on_logged_out(&mut self, session: Session) {
        tracing::warn!(chip_id = %self.chip_id, "device logged out remotely");
        self.cancel_timer();
        self.close_handle().await;
        if let Err(e) = self.ctx.client.forget(&session.credentials_ref).await {
            tracing::warn!(chip_id = %self.chip_id, error = %e, "failed to invalidate credentials");
        }
        if let Some(removed) = self.ctx.store.remove(&self.chip_id) {
            self.announce_removed(removed, Some(ErrorKind::LoggedOut));
        }
    }

    async fn on_unexpected_close(&mut self, session: Session, reason: CloseReason) {
        self.cancel_timer();
        self.close_handle().await;

        let attempt = session.reconnect_attempts.saturating_add(1);
        let backoff = &self.ctx.policy.backoff;
        if !backoff.allows(attempt) {
            let message = format!(
                "connection closed ({}) after {} reconnect attempts",
                reason, session.reconnect_attempts
            );
            self.fail(ErrorKind::UnexpectedClose, message).await;
            return;
        }

        let delay = backoff.delay(attempt);
        tracing::info!(
            chip_id = %self.chip_id,
            reason = %reason,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "connection closed, scheduling reconnect"
        );
        self.transition(SessionStatus::Connecting, None, |session| {
            session.reconnect_attempts = attempt;
        });
        self.schedule(TimerKind::Retry, delay);
    }

    async fn on_retry_due(&mut self) {
        if self.status() == SessionStatus::Connecting && self.handle.is_none() {
            self.open_handle().await;
        }
    }

    async fn on_qr_expired(&mut self) {
        let Some(session) = self.ctx.store.get(&self.chip_id) else {
            return;
        };
        if session.status != SessionStatus::QrReady {
            return;
        }

        let refreshes = session.qr_refreshes.saturating_add(1);
        if refreshes > self.ctx.policy.max_qr_refreshes {
            let message = format!("QR code not scanned after {} refreshes", session.qr_refreshes);
            self.fail(ErrorKind::PairingTimeout, message).await;
            return;
        }

        tracing::info!(chip_id = %self.chip_id, refreshes, "QR code expired, requesting a fresh one");
        self.close_handle().await;
        self.transition(SessionStatus::Connecting, None, |session| {
            session.qr_refreshes = refreshes;
        });
        self.open_handle().await;
    }

    async fn disconnect(&mut self) -> SessionStatus {
        self.cancel_timer();
        if let Some(handle) = self.handle.as_mut() {
            match tokio::time::timeout(self.ctx.policy.logout_timeout, handle.logout()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(chip_id = %self.chip_id, error = %e, "logout failed"),
                Err(_) => tracing::warn!(chip_id = %self.chip_id, "logout timed out"),
            }
        }
        self.close_handle().await;

        if let Some(session) = self.ctx.store.remove(&self.chip_id) {
            if let Err(e) = self.ctx.client.forget(&session.credentials_ref).await {
                tracing::warn!(chip_id = %self.chip_id, error = %e, "failed to invalidate credentials");
            }
            self.announce_removed(session, None);
        }
        SessionStatus::Disconnected
    }

    async fn send(&self, recipient: &str, body: &str) -> Result<SendReceipt> {
        let status = self.status();
        let handle = match &self.handle {
            Some(handle) if status == SessionStatus::Connected => handle,
            _ => {
                return Err(ChipgateError::NotConnected {
                    chip_id: self.chip_id.to_string(),
                    status,
                });
            }
        };

        let message_id = handle
            .send(recipient, body)
            .await
            .map_err(|e| ChipgateError::SendFailed(e.to_string()))?;
        tracing::debug!(chip_id = %self.chip_id, message_id = %message_id, "message handed off");
        Ok(SendReceipt {
            message_id,
            enqueued_at: Utc::now(),
        })
    }

    fn schedule(&mut self, kind: TimerKind, delay: Duration) {
        self.cancel_timer();
        let Some(mailbox) = self.mailbox.upgrade() else {
            return;
        };

        self.epoch += 1;
        let epoch = self.epoch;
        let token = CancellationToken::new();
        let cancelled = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancelled.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let command = match kind {
                        TimerKind::QrExpiry => Command::QrExpired { epoch },
                        TimerKind::Retry => Command::RetryDue { epoch },
                    };
                    let _ = mailbox.send(command);
                }
            }
        });
        self.timer = Some(PendingTimer { epoch, token });
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.token.cancel();
        }
    }

    /// Disarm the timer if `epoch` is the one currently armed.
    fn take_timer(&mut self, epoch: u64) -> bool {
        if self.timer.as_ref().is_some_and(|timer| timer.epoch == epoch) {
            self.timer = None;
            true
        } else {
            false
        }
    }
}
