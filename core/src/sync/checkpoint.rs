/// Checkpoint tracking: last fully processed update per polling scope
use crate::types::{ScopeKey, Timestamp};
use std::collections::HashMap;
use tracing::debug;

/// Monotonic timestamp cursor per scope
#[derive(Debug, Default, Clone)]
pub struct CheckpointTracker {
    cursors: HashMap<ScopeKey, Timestamp>,
}

impl CheckpointTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current cursor, `None` before the first successful pass
    pub fn get(&self, scope: &ScopeKey) -> Option<Timestamp> {
        self.cursors.get(scope).copied()
    }

    /// Move the cursor forward. Returns `false` (and changes nothing) unless
    /// `timestamp` is strictly greater than the stored value.
    pub fn advance(&mut self, scope: &ScopeKey, timestamp: Timestamp) -> bool {
        match self.cursors.get_mut(scope) {
            Some(current) if timestamp <= *current => {
                debug!(
                    "Checkpoint for {} not advanced: {} <= {}",
                    scope, timestamp, current
                );
                false
            }
            Some(current) => {
                *current = timestamp;
                true
            }
            None => {
                self.cursors.insert(scope.clone(), timestamp);
                true
            }
        }
    }

    /// Forget a scope, so the next poll does a full catch-up
    pub fn reset(&mut self, scope: &ScopeKey) {
        self.cursors.remove(scope);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn ts(secs: i64) -> Timestamp {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn test_first_advance_sets_cursor() {
        let mut tracker = CheckpointTracker::new();
        let scope = ScopeKey::AllConversations;
        assert_eq!(tracker.get(&scope), None);
        assert!(tracker.advance(&scope, ts(10)));
        assert_eq!(tracker.get(&scope), Some(ts(10)));
    }

    #[test]
    fn test_stale_advance_is_ignored() {
        let mut tracker = CheckpointTracker::new();
        let scope = ScopeKey::Conversation("c1".into());
        assert!(tracker.advance(&scope, ts(20)));
        assert!(!tracker.advance(&scope, ts(10)));
        assert!(!tracker.advance(&scope, ts(20)));
        assert_eq!(tracker.get(&scope), Some(ts(20)));
    }

    #[test]
    fn test_scopes_are_independent() {
        let mut tracker = CheckpointTracker::new();
        let a = ScopeKey::Conversation("a".into());
        let b = ScopeKey::Conversation("b".into());
        tracker.advance(&a, ts(50));
        tracker.advance(&b, ts(5));
        assert_eq!(tracker.get(&a), Some(ts(50)));
        assert_eq!(tracker.get(&b), Some(ts(5)));

        tracker.reset(&a);
        assert_eq!(tracker.get(&a), None);
    }
}
