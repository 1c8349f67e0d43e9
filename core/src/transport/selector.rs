/// Transport selection for one conversation: socket first, polling as fallback
use crate::config::SyncConfig;
use crate::error::{FetchError, Result};
use crate::sync::Generation;
use crate::transport::poller::{PollLoop, PollResult};
use crate::transport::socket::{EnvelopeStream, SocketConnector};
use crate::transport::ConnectionStatus;
use crate::types::{ConversationId, Envelope};
use futures_util::future::BoxFuture;
use futures_util::StreamExt;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Selector state. Polling runs in every state except `Connecting` (still
/// inside the grace window) and `Open`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TransportState {
    /// First socket attempt, grace window not yet over
    Connecting,
    /// Socket delivering updates
    Open,
    /// Waiting before reconnect attempt `attempt`
    Backoff { attempt: u32 },
    /// Grace window expired while the first attempt is still in flight
    Polling,
    /// Reconnect attempts exhausted; polling only
    Disconnected,
}

impl std::fmt::Display for TransportState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportState::Connecting => f.write_str("connecting"),
            TransportState::Open => f.write_str("socket"),
            TransportState::Backoff { attempt } => write!(f, "polling, reconnect #{}", attempt),
            TransportState::Polling => f.write_str("polling"),
            TransportState::Disconnected => f.write_str("polling, socket given up"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportEvent {
    SocketOpened,
    SocketFailed,
    SocketClosed,
    GraceExpired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl ReconnectPolicy {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            base_delay: config.reconnect_base_delay,
            max_delay: config.reconnect_max_delay,
            max_attempts: config.max_reconnect_attempts,
        }
    }

    /// Delay before reconnect attempt `attempt` (1-based): base doubled per
    /// attempt, capped at `max_delay`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    fn backoff(&self, attempt: u32) -> TransportState {
        if attempt > self.max_attempts {
            TransportState::Disconnected
        } else {
            TransportState::Backoff { attempt }
        }
    }
}

impl TransportState {
    /// Transition table
    pub fn on(self, event: TransportEvent, policy: &ReconnectPolicy) -> TransportState {
        use TransportEvent::*;
        use TransportState::*;

        match (self, event) {
            (Disconnected, _) => Disconnected,

            (Connecting | Polling | Backoff { .. }, SocketOpened) => Open,
            (Connecting, GraceExpired) => Polling,
            (Connecting | Polling, SocketFailed) => policy.backoff(1),
            (Backoff { attempt }, SocketFailed) => policy.backoff(attempt + 1),

            (Open, SocketClosed | SocketFailed) => policy.backoff(1),

            (state, _) => state,
        }
    }

    pub fn polling_active(&self) -> bool {
        !matches!(self, TransportState::Connecting | TransportState::Open)
    }
}

async fn next_from(socket: &mut Option<EnvelopeStream>) -> Option<Result<Envelope>> {
    match socket {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

async fn resolve<T>(pending: &mut Option<BoxFuture<'static, T>>) -> T {
    match pending {
        Some(future) => future.await,
        None => std::future::pending().await,
    }
}

async fn at_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Drives the socket channel and the polling fallback for one conversation
pub struct TransportSelector {
    conversation: ConversationId,
    generation: Generation,
    connector: Option<Arc<dyn SocketConnector>>,
    poll: Arc<PollLoop>,
    policy: ReconnectPolicy,
    grace: Duration,
    poll_interval: Duration,
    status: watch::Sender<ConnectionStatus>,
    state: TransportState,
    connected: bool,
}

impl TransportSelector {
    /// `connector = None` skips the socket entirely and polls from the start.
    pub fn new(
        conversation: ConversationId,
        generation: Generation,
        connector: Option<Arc<dyn SocketConnector>>,
        poll: PollLoop,
        config: &SyncConfig,
        status: watch::Sender<ConnectionStatus>,
    ) -> Self {
        Self {
            conversation,
            generation,
            connector,
            poll: Arc::new(poll),
            policy: ReconnectPolicy::from_config(config),
            grace: config.socket_grace,
            poll_interval: config.message_poll_interval,
            status,
            state: TransportState::Connecting,
            connected: false,
        }
    }

    fn connect(&self) -> Option<BoxFuture<'static, Result<EnvelopeStream>>> {
        let connector = self.connector.clone()?;
        let conversation = self.conversation.clone();
        Some(Box::pin(async move { connector.open(&conversation).await }))
    }

    fn transition(&mut self, event: TransportEvent) {
        let next = self.state.on(event, &self.policy);
        if next != self.state {
            info!(
                "Transport for {}: {:?} -> {:?} ({:?})",
                self.conversation, self.state, next, event
            );
            if next == TransportState::Disconnected {
                warn!(
                    "Giving up socket reconnects for {} after {} attempts; polling continues",
                    self.conversation, self.policy.max_attempts
                );
            }
            self.state = next;
        }
        self.publish();
    }

    fn set_connected(&mut self, connected: bool) {
        self.connected = connected;
        self.publish();
    }

    fn publish(&self) {
        let next = ConnectionStatus {
            connected: self.connected,
            transport: Some(self.state),
        };
        if self.status.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        }) {
            self.poll.sink().report_status(self.poll.scope(), next);
        }
    }

    fn spawn_poll(&self) -> BoxFuture<'static, std::result::Result<PollResult, FetchError>> {
        let poll = self.poll.clone();
        Box::pin(async move { poll.tick().await })
    }

    /// Run until `shutdown` flips or the registration disappears
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut connect = self.connect();
        let mut socket: Option<EnvelopeStream> = None;
        let mut in_flight: Option<BoxFuture<'static, std::result::Result<PollResult, FetchError>>> =
            None;
        let mut retry_at: Option<Instant> = None;

        let grace_deadline = Instant::now() + self.grace;
        if connect.is_none() {
            self.state = TransportState::Polling;
        }
        self.publish();

        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let polling = self.state.polling_active();
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }

                _ = sleep_until(grace_deadline), if self.state == TransportState::Connecting => {
                    debug!("Socket for {} not open within grace window", self.conversation);
                    self.transition(TransportEvent::GraceExpired);
                    ticker.reset_immediately();
                }

                opened = resolve(&mut connect) => {
                    connect = None;
                    match opened {
                        Ok(stream) => {
                            socket = Some(stream);
                            retry_at = None;
                            self.transition(TransportEvent::SocketOpened);
                            self.set_connected(true);
                        }
                        Err(e) => {
                            warn!("Socket for {} failed to open: {}", self.conversation, e);
                            let was_polling = self.state.polling_active();
                            self.transition(TransportEvent::SocketFailed);
                            retry_at = self.schedule_retry();
                            if !was_polling {
                                ticker.reset_immediately();
                            }
                        }
                    }
                }

                frame = next_from(&mut socket) => {
                    match frame {
                        Some(Ok(envelope)) => {
                            if !self.poll.sink().ingest(self.poll.scope(), self.generation, std::slice::from_ref(&envelope)) {
                                debug!("Registration for {} gone, stopping selector", self.conversation);
                                break;
                            }
                            if !self.connected {
                                self.set_connected(true);
                            }
                        }
                        Some(Err(e)) => {
                            warn!("Socket for {} dropped: {}", self.conversation, e);
                            socket = None;
                            self.on_socket_closed(&mut retry_at);
                            ticker.reset_immediately();
                        }
                        None => {
                            info!("Socket for {} closed", self.conversation);
                            socket = None;
                            self.on_socket_closed(&mut retry_at);
                            ticker.reset_immediately();
                        }
                    }
                }

                _ = at_deadline(retry_at) => {
                    retry_at = None;
                    if let TransportState::Backoff { attempt } = self.state {
                        debug!("Reconnect attempt {} for {}", attempt, self.conversation);
                        connect = self.connect();
                    }
                }

                _ = ticker.tick(), if polling && in_flight.is_none() => {
                    in_flight = Some(self.spawn_poll());
                }

                polled = resolve(&mut in_flight) => {
                    in_flight = None;
                    match polled {
                        Ok(PollResult::Applied { .. }) => {
                            if !self.connected {
                                self.set_connected(true);
                            }
                        }
                        Ok(PollResult::Discarded) => {
                            debug!("Registration for {} gone, stopping selector", self.conversation);
                            break;
                        }
                        Err(e) => {
                            warn!("Poll of {} failed: {}", self.conversation, e);
                            if self.state != TransportState::Open && self.connected {
                                self.set_connected(false);
                            }
                        }
                    }
                }
            }
        }
        debug!("Transport selector for {} stopped", self.conversation);
    }

    fn on_socket_closed(&mut self, retry_at: &mut Option<Instant>) {
        self.transition(TransportEvent::SocketClosed);
        *retry_at = self.schedule_retry();
        self.set_connected(false);
    }

    fn schedule_retry(&self) -> Option<Instant> {
        match self.state {
            TransportState::Backoff { attempt } => {
                let delay = self.policy.delay(attempt);
                debug!(
                    "Reconnecting {} in {:?} (attempt {})",
                    self.conversation, delay, attempt
                );
                Some(Instant::now() + delay)
            }
            _ => None,
        }
    }
}
