/// Sync session: owns the registry, the reconciliation engine, checkpoints and
/// the transport task of every open view.
use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::sync::dispatcher::dispatch;
use crate::sync::reconcile::{ReconciliationAnomaly, ReconciliationEngine, TimelineDelta};
use crate::sync::{
    CheckpointTracker, Generation, HandlerId, SharedHandler, SubscriptionRegistry, SummaryStore,
    TimelineEntry,
};
use crate::transport::{
    ConnectionStatus, HttpFeed, PollLoop, PollResult, PollingFetcher, SocketConnector,
    TransportSelector,
    UpdateFeed, UpdateSink, WsConnector,
};
use crate::types::{
    ChatSummary, ConversationId, Envelope, EnvelopePayload, LocalId, MessagePayload, ScopeKey,
    Timestamp,
};
use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Session-level events for UI collaborators
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    /// A timeline gained, merged or discarded entries
    TimelineChanged {
        conversation: ConversationId,
        delta: TimelineDelta,
    },
    /// Connection status of a subscribed scope changed
    StatusChanged {
        scope: String,
        status: ConnectionStatus,
    },
    /// The send request behind an optimistic entry failed
    SendFailed {
        conversation: ConversationId,
        local_id: LocalId,
        error: String,
    },
}

/// Handle returned by [`SyncSession::subscribe`]
pub struct Subscription {
    scope: ScopeKey,
    generation: Generation,
    status: watch::Receiver<ConnectionStatus>,
}

impl Subscription {
    pub fn scope(&self) -> &ScopeKey {
        &self.scope
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn is_connected(&self) -> bool {
        self.status.borrow().connected
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    /// Receiver that wakes on every status change
    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }
}

struct View {
    generation: Generation,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl View {
    fn stop(self) {
        let _ = self.shutdown.send(true);
        self.task.abort();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

struct SessionCore {
    config: SyncConfig,
    registry: Mutex<SubscriptionRegistry>,
    engine: Mutex<ReconciliationEngine>,
    summaries: Mutex<SummaryStore>,
    checkpoints: Arc<Mutex<CheckpointTracker>>,
    views: Mutex<HashMap<ScopeKey, View>>,
    events: broadcast::Sender<SyncEvent>,
    feed: Arc<dyn UpdateFeed>,
    connector: Option<Arc<dyn SocketConnector>>,
}

impl SessionCore {
    fn emit_delta(&self, conversation: &ConversationId, delta: &TimelineDelta) {
        if delta.is_empty() {
            return;
        }
        // No receivers is fine
        let _ = self.events.send(SyncEvent::TimelineChanged {
            conversation: conversation.clone(),
            delta: delta.clone(),
        });
    }

    /// Reconcile, record summaries, then fan out to handlers. Each lock is
    /// taken and released within one synchronous step.
    fn apply(&self, envelope: &Envelope) {
        let delta = envelope.conversation().and_then(|conversation| {
            let mut engine = lock(&self.engine);
            if !engine.is_open(conversation) {
                return None;
            }
            Some((conversation.clone(), engine.apply_envelope(conversation, envelope)))
        });

        if let EnvelopePayload::ChatUpdated(summary) = &envelope.payload {
            lock(&self.summaries).apply(summary);
        }

        let report = dispatch(&self.registry, envelope);
        if report.failed > 0 {
            debug!(
                "{} of {} handlers failed on {} envelope",
                report.failed,
                report.failed + report.delivered,
                envelope.kind().as_str()
            );
        }

        if let Some((conversation, delta)) = delta {
            self.emit_delta(&conversation, &delta);
        }
    }
}

impl UpdateSink for SessionCore {
    fn ingest(&self, scope: &ScopeKey, generation: Generation, envelopes: &[Envelope]) -> bool {
        for envelope in envelopes {
            if !lock(&self.registry).is_live(scope, generation) {
                debug!("Dropping update for {}: subscription no longer live", scope);
                return false;
            }
            self.apply(envelope);
        }
        true
    }

    fn report_status(&self, scope: &ScopeKey, status: ConnectionStatus) {
        let _ = self.events.send(SyncEvent::StatusChanged {
            scope: scope.to_string(),
            status,
        });
    }
}

/// Explicit, session-scoped sync object. Cheap to clone.
#[derive(Clone)]
pub struct SyncSession {
    core: Arc<SessionCore>,
}

impl SyncSession {
    /// Create a session over the given transports. `connector = None`
    /// disables the socket channel.
    pub fn new(
        config: SyncConfig,
        feed: Arc<dyn UpdateFeed>,
        connector: Option<Arc<dyn SocketConnector>>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let connector = if config.enable_socket { connector } else { None };
        let core = SessionCore {
            engine: Mutex::new(ReconciliationEngine::from_config(&config)),
            registry: Mutex::new(SubscriptionRegistry::new()),
            summaries: Mutex::new(SummaryStore::new()),
            checkpoints: Arc::new(Mutex::new(CheckpointTracker::new())),
            views: Mutex::new(HashMap::new()),
            events,
            feed,
            connector,
            config,
        };
        Self {
            core: Arc::new(core),
        }
    }

    /// Session over HTTP polling and WebSocket push as configured
    pub fn from_config(config: SyncConfig) -> Result<Self> {
        config.validate()?;
        let feed = Arc::new(HttpFeed::new(
            config.server_url.clone(),
            config.request_timeout,
        ));
        let connector: Option<Arc<dyn SocketConnector>> = if config.enable_socket {
            Some(Arc::new(WsConnector::new(config.socket_url.clone())))
        } else {
            None
        };
        info!(
            "Sync session against {} (socket: {})",
            config.server_url,
            if connector.is_some() {
                config.socket_url.as_str()
            } else {
                "disabled"
            }
        );
        Ok(Self::new(config, feed, connector))
    }

    pub fn config(&self) -> &SyncConfig {
        &self.core.config
    }

    /// Open a view on `scope`: register `handlers` (replacing any previous
    /// registration of the same scope) and start its transport. Must be
    /// called from within a tokio runtime.
    pub fn subscribe(&self, scope: ScopeKey, handlers: Vec<SharedHandler>) -> Subscription {
        let core = &self.core;
        let generation = lock(&core.registry).register(scope.clone(), handlers);
        if let Some(conversation) = scope.conversation() {
            lock(&core.engine).open(conversation);
        }

        let (status_tx, status_rx) = watch::channel(ConnectionStatus::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let poll = self.poll_loop(scope.clone(), generation);

        let task = match &scope {
            ScopeKey::Conversation(conversation) => {
                let selector = TransportSelector::new(
                    conversation.clone(),
                    generation,
                    core.connector.clone(),
                    poll,
                    &core.config,
                    status_tx,
                );
                tokio::spawn(selector.run(shutdown_rx))
            }
            ScopeKey::AllConversations => tokio::spawn(poll.run(
                core.config.summary_poll_interval,
                status_tx,
                shutdown_rx,
            )),
        };

        let view = View {
            generation,
            shutdown: shutdown_tx,
            task,
        };
        if let Some(previous) = lock(&core.views).insert(scope.clone(), view) {
            debug!(
                "Replacing view {:?} of {}",
                previous.generation, scope
            );
            previous.stop();
        }
        info!("Subscribed to {}", scope);

        Subscription {
            scope,
            generation,
            status: status_rx,
        }
    }

    /// Close the view on `scope`: drop its handlers, stop its timers, forget
    /// its timeline and checkpoint. Results still in flight are discarded.
    pub fn unsubscribe(&self, scope: &ScopeKey) -> bool {
        let core = &self.core;
        let removed = lock(&core.registry).unregister(scope);
        if let Some(view) = lock(&core.views).remove(scope) {
            view.stop();
        }
        if let Some(conversation) = scope.conversation() {
            lock(&core.engine).close(conversation);
        }
        lock(&core.checkpoints).reset(scope);
        if removed {
            info!("Unsubscribed from {}", scope);
        }
        removed
    }

    /// One-shot poll cycle bound to the current registration of `scope`,
    /// for a refresh outside the view's own timer. Its results are dropped
    /// if the view is closed or replaced before they arrive.
    pub fn poller(&self, scope: &ScopeKey) -> Option<PollLoop> {
        let generation = lock(&self.core.views).get(scope).map(|view| view.generation)?;
        Some(self.poll_loop(scope.clone(), generation))
    }

    fn poll_loop(&self, scope: ScopeKey, generation: Generation) -> PollLoop {
        let sink: Arc<dyn UpdateSink> = self.core.clone();
        PollLoop::new(
            PollingFetcher::new(self.core.feed.clone()),
            self.core.checkpoints.clone(),
            sink,
            scope,
            generation,
        )
    }

    /// Poll `scope` once right now. `None` when no view is open on it.
    pub async fn refresh(&self, scope: &ScopeKey) -> Result<Option<PollResult>> {
        let Some(poller) = self.poller(scope) else {
            return Ok(None);
        };
        Ok(Some(poller.tick().await?))
    }

    pub fn add_global_handler(&self, handler: SharedHandler) -> HandlerId {
        lock(&self.core.registry).add_global(handler)
    }

    pub fn remove_global_handler(&self, id: HandlerId) -> bool {
        lock(&self.core.registry).remove_global(id)
    }

    /// Ordered entries of a conversation's timeline
    pub fn timeline(&self, conversation: &ConversationId) -> Vec<TimelineEntry> {
        lock(&self.core.engine).entries(conversation)
    }

    /// Reconcile one envelope directly into a timeline
    pub fn apply_envelope(
        &self,
        conversation: &ConversationId,
        envelope: &Envelope,
    ) -> TimelineDelta {
        let delta = lock(&self.core.engine).apply_envelope(conversation, envelope);
        self.core.emit_delta(conversation, &delta);
        delta
    }

    /// Insert a pending entry right now and return its local id
    pub fn send_optimistic(&self, conversation: &ConversationId, content: &str) -> LocalId {
        self.send_optimistic_at(conversation, content, Utc::now())
    }

    pub fn send_optimistic_at(
        &self,
        conversation: &ConversationId,
        content: &str,
        created_at: Timestamp,
    ) -> LocalId {
        let (local_id, delta) =
            lock(&self.core.engine).send_optimistic(conversation, content, created_at);
        self.core.emit_delta(conversation, &delta);
        local_id
    }

    /// Apply the confirmed message returned by the send request of `local_id`
    pub fn complete_send(
        &self,
        conversation: &ConversationId,
        local_id: &LocalId,
        message: &MessagePayload,
    ) -> TimelineDelta {
        let delta =
            lock(&self.core.engine).complete_send(conversation, local_id, message, Utc::now());
        self.core.emit_delta(conversation, &delta);
        delta
    }

    /// Optimistic send followed by the feed request. On failure the pending
    /// entry stays, flagged as failed.
    pub async fn send(&self, conversation: &ConversationId, content: &str) -> Result<LocalId> {
        let local_id = self.send_optimistic(conversation, content);
        match self.core.feed.send_message(conversation, content).await {
            Ok(message) => {
                self.complete_send(conversation, &local_id, &message);
                Ok(local_id)
            }
            Err(e) => {
                warn!("Send {} in {} failed: {}", local_id, conversation, e);
                lock(&self.core.engine).mark_failed(conversation, &local_id);
                let _ = self.core.events.send(SyncEvent::SendFailed {
                    conversation: conversation.clone(),
                    local_id,
                    error: e.to_string(),
                });
                Err(SyncError::Fetch(e))
            }
        }
    }

    pub fn chat_summary(&self, conversation: &ConversationId) -> Option<ChatSummary> {
        lock(&self.core.summaries).get(conversation).cloned()
    }

    pub fn chat_summaries(&self) -> Vec<ChatSummary> {
        lock(&self.core.summaries).all()
    }

    pub fn anomalies(&self) -> Vec<ReconciliationAnomaly> {
        lock(&self.core.engine).anomalies().cloned().collect()
    }

    pub fn events(&self) -> broadcast::Receiver<SyncEvent> {
        self.core.events.subscribe()
    }

    pub fn is_subscribed(&self, scope: &ScopeKey) -> bool {
        lock(&self.core.registry).is_registered(scope)
    }

    /// Close every open view
    pub fn shutdown(&self) {
        let scopes: Vec<ScopeKey> = lock(&self.core.views).keys().cloned().collect();
        for scope in scopes {
            self.unsubscribe(&scope);
        }
        info!("Sync session stopped");
    }
}
