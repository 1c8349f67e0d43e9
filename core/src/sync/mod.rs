/// Client-side consistency: checkpoints, subscriptions, dispatch and reconciliation
pub mod checkpoint;
pub mod dispatcher;
pub mod reconcile;
pub mod registry;
pub mod summaries;
pub mod timeline;

pub use checkpoint::CheckpointTracker;
pub use dispatcher::{dispatch, DispatchReport};
pub use reconcile::{DiscardReason, ReconciliationAnomaly, ReconciliationEngine, TimelineDelta};
pub use registry::{handler, Generation, HandlerId, SharedHandler, SubscriptionRegistry, UpdateHandler};
pub use summaries::SummaryStore;
pub use timeline::{Timeline, TimelineEntry};
