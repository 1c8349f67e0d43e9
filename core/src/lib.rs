/// ChatSync - client-side real-time synchronization for a messaging console
///
/// Keeps per-conversation timelines current by combining interval polling
/// with an opportunistic socket channel, fanning updates out to subscribers
/// and reconciling optimistic local sends with server confirmations.

pub mod config;
pub mod error;
pub mod feed_server;
pub mod session;
pub mod sync;
pub mod transport;
pub mod types;

pub use config::SyncConfig;
pub use error::{FetchError, HandlerError, Result, SyncError};
pub use feed_server::{FeedServer, RunningFeed};
pub use session::{Subscription, SyncEvent, SyncSession};
pub use types::{ConversationId, Envelope, LocalId, MessagePayload, ScopeKey};
