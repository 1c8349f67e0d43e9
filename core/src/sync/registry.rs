/// Subscription registry: scope key -> handler set, plus global handlers
use crate::error::HandlerError;
use crate::types::{Envelope, ScopeKey};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Subscriber callback invoked with every matching envelope
pub trait UpdateHandler: Send + Sync {
    fn handle(&self, envelope: &Envelope) -> Result<(), HandlerError>;
}

impl<F> UpdateHandler for F
where
    F: Fn(&Envelope) -> Result<(), HandlerError> + Send + Sync,
{
    fn handle(&self, envelope: &Envelope) -> Result<(), HandlerError> {
        self(envelope)
    }
}

pub type SharedHandler = Arc<dyn UpdateHandler>;

/// Wrap a closure as a shared handler
pub fn handler<F>(f: F) -> SharedHandler
where
    F: Fn(&Envelope) -> Result<(), HandlerError> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Token identifying one registration of a scope. A re-registration of the
/// same scope gets a fresh generation, so results started under the old one
/// can be told apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Generation(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

struct Registration {
    generation: Generation,
    handlers: Vec<SharedHandler>,
}

/// Keyed handler registry. Owned by the session, not a module-level singleton.
#[derive(Default)]
pub struct SubscriptionRegistry {
    scoped: HashMap<ScopeKey, Registration>,
    global: HashMap<HandlerId, SharedHandler>,
    next_id: u64,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Register `handlers` for `scope`, replacing any existing registration
    /// under the same key.
    pub fn register(&mut self, scope: ScopeKey, handlers: Vec<SharedHandler>) -> Generation {
        let generation = Generation(self.next_id());
        if self
            .scoped
            .insert(scope.clone(), Registration { generation, handlers })
            .is_some()
        {
            debug!("Registration for {} replaced", scope);
        }
        generation
    }

    /// Remove the registration for `scope`
    pub fn unregister(&mut self, scope: &ScopeKey) -> bool {
        self.scoped.remove(scope).is_some()
    }

    /// Whether `scope` is still registered under exactly `generation`
    pub fn is_live(&self, scope: &ScopeKey, generation: Generation) -> bool {
        self.scoped
            .get(scope)
            .map(|r| r.generation == generation)
            .unwrap_or(false)
    }

    pub fn is_registered(&self, scope: &ScopeKey) -> bool {
        self.scoped.contains_key(scope)
    }

    pub fn add_global(&mut self, handler: SharedHandler) -> HandlerId {
        let id = HandlerId(self.next_id());
        self.global.insert(id, handler);
        id
    }

    pub fn remove_global(&mut self, id: HandlerId) -> bool {
        self.global.remove(&id).is_some()
    }

    pub fn global_count(&self) -> usize {
        self.global.len()
    }

    /// Handlers that must see `envelope`: every global handler, the handlers
    /// registered under the envelope's own scope, and the handlers registered
    /// under the all-conversations sentinel.
    pub fn resolve(&self, envelope: &Envelope) -> Vec<SharedHandler> {
        let mut handlers: Vec<SharedHandler> = self.global.values().cloned().collect();
        for (key, registration) in &self.scoped {
            let matches = match key {
                ScopeKey::AllConversations => true,
                ScopeKey::Conversation(id) => envelope.scope.as_ref() == Some(id),
            };
            if matches {
                handlers.extend(registration.handlers.iter().cloned());
            }
        }
        handlers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChatSummary, MessagePayload};
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting() -> (SharedHandler, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let shared = handler(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        (shared, hits)
    }

    fn message_in(conversation: &str) -> Envelope {
        Envelope::new_message(conversation.into(), MessagePayload::default(), Utc::now())
    }

    #[test]
    fn test_last_registration_wins() {
        let mut registry = SubscriptionRegistry::new();
        let scope = ScopeKey::Conversation("c1".into());
        let (first, _) = counting();
        let (second, _) = counting();

        let g1 = registry.register(scope.clone(), vec![first]);
        let g2 = registry.register(scope.clone(), vec![second]);
        assert_ne!(g1, g2);
        assert!(!registry.is_live(&scope, g1));
        assert!(registry.is_live(&scope, g2));
        assert_eq!(registry.resolve(&message_in("c1")).len(), 1);
    }

    #[test]
    fn test_resolution_by_scope() {
        let mut registry = SubscriptionRegistry::new();
        let (c1, _) = counting();
        let (all, _) = counting();
        let (global, _) = counting();
        registry.register(ScopeKey::Conversation("c1".into()), vec![c1]);
        registry.register(ScopeKey::AllConversations, vec![all]);
        registry.add_global(global);

        assert_eq!(registry.resolve(&message_in("c1")).len(), 3);
        assert_eq!(registry.resolve(&message_in("c2")).len(), 2);

        let summary = ChatSummary {
            conversation_id: "c2".into(),
            last_preview: None,
            unread_count: 0,
            updated_at: Utc::now(),
        };
        assert_eq!(registry.resolve(&Envelope::chat_updated(summary, Utc::now())).len(), 2);
    }

    #[test]
    fn test_global_handlers_are_independent() {
        let mut registry = SubscriptionRegistry::new();
        let (a, _) = counting();
        let (b, _) = counting();
        let id_a = registry.add_global(a);
        registry.add_global(b);
        assert_eq!(registry.global_count(), 2);

        assert!(registry.remove_global(id_a));
        assert!(!registry.remove_global(id_a));
        assert_eq!(registry.global_count(), 1);
    }
}
