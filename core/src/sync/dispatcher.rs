/// Update dispatch: fan one envelope out to every matching handler
use crate::sync::registry::{SharedHandler, SubscriptionRegistry};
use crate::types::Envelope;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Mutex;
use tracing::warn;

/// Outcome of delivering one envelope
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    pub failed: usize,
}

/// Resolve the handler set under the registry lock, then invoke the handlers
/// with the lock released so a handler may subscribe or unsubscribe.
pub fn dispatch(registry: &Mutex<SubscriptionRegistry>, envelope: &Envelope) -> DispatchReport {
    let handlers = {
        let registry = registry.lock().unwrap_or_else(|e| e.into_inner());
        registry.resolve(envelope)
    };
    deliver(&handlers, envelope)
}

/// Invoke each handler in turn. A handler that returns an error or panics is
/// logged and skipped; the remaining handlers still run.
pub fn deliver(handlers: &[SharedHandler], envelope: &Envelope) -> DispatchReport {
    let mut report = DispatchReport::default();
    for (index, handler) in handlers.iter().enumerate() {
        match catch_unwind(AssertUnwindSafe(|| handler.handle(envelope))) {
            Ok(Ok(())) => report.delivered += 1,
            Ok(Err(e)) => {
                warn!(
                    "Handler #{} failed on {} envelope: {}",
                    index,
                    envelope.kind().as_str(),
                    e
                );
                report.failed += 1;
            }
            Err(panic) => {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                warn!(
                    "Handler #{} panicked on {} envelope: {}",
                    index,
                    envelope.kind().as_str(),
                    reason
                );
                report.failed += 1;
            }
        }
    }
    report
}
