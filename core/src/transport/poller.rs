/// Interval-driven polling of one scope
use crate::error::FetchError;
use crate::sync::{CheckpointTracker, Generation};
use crate::transport::fetcher::PollingFetcher;
use crate::transport::{ConnectionStatus, UpdateSink};
use crate::types::ScopeKey;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollResult {
    /// Envelopes were processed and the checkpoint moved (or stayed, if stale)
    Applied { envelopes: usize },
    /// The registration went away while the request was in flight
    Discarded,
}

/// One poll cycle for one scope, reusable from a plain loop or from the
/// transport selector.
pub struct PollLoop {
    fetcher: PollingFetcher,
    checkpoints: Arc<Mutex<CheckpointTracker>>,
    sink: Arc<dyn UpdateSink>,
    scope: ScopeKey,
    generation: Generation,
}

impl PollLoop {
    pub fn new(
        fetcher: PollingFetcher,
        checkpoints: Arc<Mutex<CheckpointTracker>>,
        sink: Arc<dyn UpdateSink>,
        scope: ScopeKey,
        generation: Generation,
    ) -> Self {
        Self {
            fetcher,
            checkpoints,
            sink,
            scope,
            generation,
        }
    }

    pub fn scope(&self) -> &ScopeKey {
        &self.scope
    }

    pub fn sink(&self) -> &Arc<dyn UpdateSink> {
        &self.sink
    }

    /// Fetch everything after the checkpoint, hand it to the sink, and only
    /// then advance the checkpoint. A failure leaves the checkpoint untouched.
    pub async fn tick(&self) -> Result<PollResult, FetchError> {
        let since = self
            .checkpoints
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&self.scope);

        let outcome = self.fetcher.fetch(&self.scope, since).await?;
        if outcome.envelopes.is_empty() {
            debug!("Poll of {} returned no updates", self.scope);
        }

        if !self
            .sink
            .ingest(&self.scope, self.generation, &outcome.envelopes)
        {
            debug!("Discarding late poll result for {}", self.scope);
            return Ok(PollResult::Discarded);
        }

        self.checkpoints
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .advance(&self.scope, outcome.checkpoint);
        Ok(PollResult::Applied {
            envelopes: outcome.envelopes.len(),
        })
    }

    /// Poll on a fixed interval until `shutdown` flips or the registration
    /// disappears. Transport failures are retried on the next tick.
    pub async fn run(
        self,
        every: Duration,
        status: watch::Sender<ConnectionStatus>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }

            let connected = match self.tick().await {
                Ok(PollResult::Applied { .. }) => true,
                Ok(PollResult::Discarded) => break,
                Err(e) => {
                    warn!("Poll of {} failed: {}", self.scope, e);
                    false
                }
            };
            let next = ConnectionStatus {
                connected,
                transport: None,
            };
            if status.send_if_modified(|current| {
                if *current == next {
                    false
                } else {
                    *current = next;
                    true
                }
            }) {
                self.sink.report_status(&self.scope, next);
            }
        }
        debug!("Poll loop for {} stopped", self.scope);
    }
}
