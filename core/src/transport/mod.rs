/// Transports: polling fetcher, socket channel and the selector between them
pub mod fetcher;
pub mod poller;
pub mod selector;
pub mod socket;

pub use fetcher::{normalize, FetchOutcome, HttpFeed, PollingFetcher, UpdateFeed};
pub use poller::{PollLoop, PollResult};
pub use selector::{ReconnectPolicy, TransportEvent, TransportSelector, TransportState};
pub use socket::{EnvelopeStream, SocketConnector, SocketFrame, WsConnector};

use crate::sync::Generation;
use crate::types::{Envelope, ScopeKey};
use serde::Serialize;

/// Live connection status of one subscribed scope
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionStatus {
    /// Data has arrived recently through some transport
    pub connected: bool,
    /// Selector state, `None` for scopes served by polling alone
    pub transport: Option<TransportState>,
}

/// Where transports deliver what they receive
pub trait UpdateSink: Send + Sync {
    /// Process `envelopes` in order for `scope`. Returns `false` when the
    /// registration `generation` is no longer live; the remainder of the
    /// batch is then dropped and the caller must stop.
    fn ingest(&self, scope: &ScopeKey, generation: Generation, envelopes: &[Envelope]) -> bool;

    fn report_status(&self, _scope: &ScopeKey, _status: ConnectionStatus) {}
}
