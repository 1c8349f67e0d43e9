/// Reconciliation engine: merges optimistic entries with their confirmed
/// counterparts and suppresses duplicate reports of the same message.
///
/// Every transport funnels into [`ReconciliationEngine::apply_envelope`], and
/// the same confirmed message may arrive any number of times, in any order
/// relative to the local send that produced it. Rules, in order:
///
/// 1. an entry with the same `serverId` (or `externalId`) already exists: discard;
/// 2. the message lacks `content`, `direction` or `sentAt`: append as-is and
///    record an anomaly (a repeated identical anomalous report is discarded);
/// 3. an unconfirmed pending entry with equal content, both sides outbound, and
///    `|sentAt - createdAt| <= merge_tolerance` exists: merge in place;
/// 4. a confirmed entry with equal content and direction within
///    `duplicate_tolerance` exists: discard;
/// 5. otherwise insert in timestamp order.
///
/// Rule 1 runs before rule 3, so re-delivering an already merged message can
/// never merge it into a second pending entry. A message without a `serverId`
/// still goes through rules 3 to 5; if it ends up merged or inserted, the
/// missing id is recorded as an anomaly.
///
/// Matching on content and time is approximate: two identical outbound
/// messages sent within the merge window can be paired with each other's
/// confirmations. [`ReconciliationEngine::complete_send`] correlates by local
/// id instead whenever the send response is available.
use crate::config::SyncConfig;
use crate::sync::timeline::{Timeline, TimelineEntry};
use crate::types::{ConversationId, Direction, Envelope, LocalId, MessagePayload, Timestamp};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscardReason {
    DuplicateServerId,
    DuplicateExternalId,
    NearDuplicate,
    RepeatedAnomaly,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Discarded {
    pub reason: DiscardReason,
    pub message: MessagePayload,
}

/// A confirmed message that could not be matched because fields were missing
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReconciliationAnomaly {
    pub conversation: ConversationId,
    pub missing: Vec<&'static str>,
    pub message: MessagePayload,
    pub observed_at: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntryChange {
    /// Position in the timeline right after the change
    pub index: usize,
    pub entry: TimelineEntry,
}

/// What one reconciliation step did to a timeline
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TimelineDelta {
    pub inserted: Vec<EntryChange>,
    pub merged: Vec<EntryChange>,
    /// Entries dropped because another entry turned out to be the same
    /// message; `index` is the position before removal
    pub removed: Vec<EntryChange>,
    pub discarded: Vec<Discarded>,
    pub anomalies: Vec<ReconciliationAnomaly>,
}

impl TimelineDelta {
    /// True when the timeline itself changed
    pub fn changed(&self) -> bool {
        !self.inserted.is_empty() || !self.merged.is_empty() || !self.removed.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        !self.changed() && self.discarded.is_empty() && self.anomalies.is_empty()
    }

    pub fn extend(&mut self, other: TimelineDelta) {
        self.inserted.extend(other.inserted);
        self.merged.extend(other.merged);
        self.removed.extend(other.removed);
        self.discarded.extend(other.discarded);
        self.anomalies.extend(other.anomalies);
    }

    fn discard(reason: DiscardReason, message: &MessagePayload) -> Self {
        Self {
            discarded: vec![Discarded {
                reason,
                message: message.clone(),
            }],
            ..Default::default()
        }
    }
}

pub struct ReconciliationEngine {
    timelines: HashMap<ConversationId, Timeline>,
    merge_tolerance: chrono::Duration,
    duplicate_tolerance: chrono::Duration,
    anomalies: VecDeque<ReconciliationAnomaly>,
    anomaly_capacity: usize,
}

fn to_delta(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

fn within(a: Timestamp, b: Timestamp, tolerance: chrono::Duration) -> bool {
    let diff = if a >= b { a - b } else { b - a };
    diff <= tolerance
}

impl ReconciliationEngine {
    pub fn new(merge_tolerance: Duration, duplicate_tolerance: Duration) -> Self {
        Self {
            timelines: HashMap::new(),
            merge_tolerance: to_delta(merge_tolerance),
            duplicate_tolerance: to_delta(duplicate_tolerance),
            anomalies: VecDeque::new(),
            anomaly_capacity: 256,
        }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        let mut engine = Self::new(config.merge_tolerance, config.duplicate_tolerance);
        engine.anomaly_capacity = config.anomaly_log_capacity;
        engine
    }

    /// Make sure a timeline exists for `conversation`
    pub fn open(&mut self, conversation: &ConversationId) {
        self.timelines.entry(conversation.clone()).or_default();
    }

    /// Drop the timeline of a closed view
    pub fn close(&mut self, conversation: &ConversationId) -> bool {
        self.timelines.remove(conversation).is_some()
    }

    pub fn is_open(&self, conversation: &ConversationId) -> bool {
        self.timelines.contains_key(conversation)
    }

    pub fn timeline(&self, conversation: &ConversationId) -> Option<&Timeline> {
        self.timelines.get(conversation)
    }

    /// Snapshot of the ordered entries, empty for an unknown conversation
    pub fn entries(&self, conversation: &ConversationId) -> Vec<TimelineEntry> {
        self.timelines
            .get(conversation)
            .map(|t| t.entries().to_vec())
            .unwrap_or_default()
    }

    /// Most recent anomalies, oldest first
    pub fn anomalies(&self) -> impl Iterator<Item = &ReconciliationAnomaly> {
        self.anomalies.iter()
    }

    /// Apply one envelope to `conversation`'s timeline. Chat-level updates and
    /// messages addressed to another conversation leave it untouched.
    pub fn apply_envelope(
        &mut self,
        conversation: &ConversationId,
        envelope: &Envelope,
    ) -> TimelineDelta {
        let Some(message) = envelope.message() else {
            return TimelineDelta::default();
        };
        if let Some(target) = envelope.conversation() {
            if target != conversation {
                debug!(
                    "Envelope for {} ignored by timeline {}",
                    target, conversation
                );
                return TimelineDelta::default();
            }
        }
        self.apply_confirmed(conversation, message, envelope.observed_at)
    }

    /// Reconcile one confirmed message. `observed_at` orders the entry when the
    /// message carries no `sentAt`.
    pub fn apply_confirmed(
        &mut self,
        conversation: &ConversationId,
        message: &MessagePayload,
        observed_at: Timestamp,
    ) -> TimelineDelta {
        let merge_tolerance = self.merge_tolerance;
        let duplicate_tolerance = self.duplicate_tolerance;
        let timeline = self.timelines.entry(conversation.clone()).or_default();

        if let Some(server_id) = message.server_id.as_deref() {
            if timeline.position_by_server_id(server_id).is_some() {
                debug!("Discarding {} in {}: server id known", server_id, conversation);
                return TimelineDelta::discard(DiscardReason::DuplicateServerId, message);
            }
        }
        if let Some(external_id) = message.external_id.as_deref() {
            if timeline.position_by_external_id(external_id).is_some() {
                debug!(
                    "Discarding external {} in {}: external id known",
                    external_id, conversation
                );
                return TimelineDelta::discard(DiscardReason::DuplicateExternalId, message);
            }
        }

        let (Some(content), Some(direction), Some(sent_at)) = (
            message.content.as_deref(),
            message.direction,
            message.sent_at,
        ) else {
            return self.append_anomaly(conversation, message, observed_at);
        };

        let mut delta = TimelineDelta::default();
        let candidate = (direction == Direction::Outbound)
            .then(|| {
                timeline.iter().position(|e| {
                    e.is_pending()
                        && e.direction == Some(Direction::Outbound)
                        && e.content.as_deref() == Some(content)
                        && within(sent_at, e.timestamp, merge_tolerance)
                })
            })
            .flatten();

        if let Some(index) = candidate {
            let Some(entry) = timeline.get_mut(index) else {
                return delta;
            };
            entry.absorb(message);
            debug!(
                "Merged confirmed {:?} into pending {:?} in {}",
                message.server_id, entry.local_id, conversation
            );
            delta.merged.push(EntryChange {
                index,
                entry: entry.clone(),
            });
        } else {
            let near_duplicate = timeline.iter().any(|e| {
                e.confirmed
                    && e.direction == Some(direction)
                    && e.content.as_deref() == Some(content)
                    && within(sent_at, e.timestamp, duplicate_tolerance)
            });
            if near_duplicate {
                debug!(
                    "Discarding {:?} in {}: near-duplicate of a confirmed entry",
                    message.server_id, conversation
                );
                return TimelineDelta::discard(DiscardReason::NearDuplicate, message);
            }

            let entry = TimelineEntry::confirmed(message, observed_at);
            let index = timeline.insert_ordered(entry.clone());
            delta.inserted.push(EntryChange { index, entry });
        }

        if message.server_id.is_none() {
            let anomaly = ReconciliationAnomaly {
                conversation: conversation.clone(),
                missing: missing_fields(message),
                message: message.clone(),
                observed_at,
            };
            warn!(
                "Confirmed message in {} carries no server id",
                conversation
            );
            self.record_anomaly(anomaly.clone());
            delta.anomalies.push(anomaly);
        }
        delta
    }

    fn append_anomaly(
        &mut self,
        conversation: &ConversationId,
        message: &MessagePayload,
        observed_at: Timestamp,
    ) -> TimelineDelta {
        let entry = TimelineEntry::confirmed(message, observed_at);
        let timeline = self.timelines.entry(conversation.clone()).or_default();
        if timeline.iter().any(|e| *e == entry) {
            return TimelineDelta::discard(DiscardReason::RepeatedAnomaly, message);
        }

        let anomaly = ReconciliationAnomaly {
            conversation: conversation.clone(),
            missing: missing_fields(message),
            message: message.clone(),
            observed_at,
        };
        warn!(
            "Reconciliation anomaly in {}: missing {:?}, appending as-is",
            conversation, anomaly.missing
        );
        let index = timeline.insert_ordered(entry.clone());
        self.record_anomaly(anomaly.clone());

        TimelineDelta {
            inserted: vec![EntryChange { index, entry }],
            anomalies: vec![anomaly],
            ..Default::default()
        }
    }

    fn record_anomaly(&mut self, anomaly: ReconciliationAnomaly) {
        if self.anomaly_capacity == 0 {
            return;
        }
        while self.anomalies.len() >= self.anomaly_capacity {
            self.anomalies.pop_front();
        }
        self.anomalies.push_back(anomaly);
    }

    /// Insert a pending entry for a send the user just issued.
    ///
    /// If the confirmed message already reached the timeline (a poll that
    /// started before the send resolved first), that entry adopts the new
    /// local id instead and nothing is inserted.
    pub fn send_optimistic(
        &mut self,
        conversation: &ConversationId,
        content: &str,
        created_at: Timestamp,
    ) -> (LocalId, TimelineDelta) {
        let merge_tolerance = self.merge_tolerance;
        let local_id = LocalId::generate();
        let timeline = self.timelines.entry(conversation.clone()).or_default();

        let confirmed_already = timeline.iter().position(|e| {
            e.confirmed
                && e.local_id.is_none()
                && e.direction == Some(Direction::Outbound)
                && e.content.as_deref() == Some(content)
                && within(e.timestamp, created_at, merge_tolerance)
        });
        if let Some(index) = confirmed_already {
            if let Some(entry) = timeline.get_mut(index) {
                entry.local_id = Some(local_id.clone());
                debug!(
                    "Send {} in {} already confirmed as {:?}",
                    local_id, conversation, entry.server_id
                );
                let delta = TimelineDelta {
                    merged: vec![EntryChange {
                        index,
                        entry: entry.clone(),
                    }],
                    ..Default::default()
                };
                return (local_id, delta);
            }
        }

        let entry = TimelineEntry::pending(local_id.clone(), content.to_string(), created_at);
        let index = timeline.insert_ordered(entry.clone());
        let delta = TimelineDelta {
            inserted: vec![EntryChange { index, entry }],
            ..Default::default()
        };
        (local_id, delta)
    }

    /// Apply the confirmed message returned by the send request of `local_id`.
    pub fn complete_send(
        &mut self,
        conversation: &ConversationId,
        local_id: &LocalId,
        message: &MessagePayload,
        observed_at: Timestamp,
    ) -> TimelineDelta {
        let Some(timeline) = self.timelines.get_mut(conversation) else {
            return self.apply_confirmed(conversation, message, observed_at);
        };
        let Some(index) = timeline.position_by_local_id(local_id) else {
            return self.apply_confirmed(conversation, message, observed_at);
        };

        let (already_confirmed, known_server_id) = match timeline.get(index) {
            Some(entry) => (entry.confirmed, entry.server_id.clone()),
            None => return TimelineDelta::default(),
        };
        if already_confirmed {
            let same = match (&message.server_id, &known_server_id) {
                (None, _) => true,
                (Some(id), Some(known)) => id == known,
                // merged from a report without an id; fill it in below
                (Some(_), None) => true,
            };
            if !same {
                // The entry was paired with another confirmation; reconcile
                // this one on its own.
                return self.apply_confirmed(conversation, message, observed_at);
            }
            if known_server_id.is_some() || message.server_id.is_none() {
                return TimelineDelta::discard(DiscardReason::DuplicateServerId, message);
            }
        }

        let mut delta = TimelineDelta::default();

        // The confirmation may already sit in the timeline as its own entry,
        // inserted by a poll that fell outside the merge window. That copy
        // folds into the entry the sender knows by local id.
        let copy = message
            .server_id
            .as_deref()
            .and_then(|id| timeline.position_by_server_id(id))
            .filter(|&i| i != index)
            .filter(|&i| timeline.get(i).map_or(false, |e| e.local_id.is_none()));
        if let Some(copy_index) = copy {
            if let Some(entry) = timeline.remove(copy_index) {
                debug!(
                    "Folding confirmed {:?} into send {} in {}",
                    entry.server_id, local_id, conversation
                );
                delta.removed.push(EntryChange {
                    index: copy_index,
                    entry,
                });
            }
        } else if let Some(server_id) = message.server_id.as_deref() {
            if timeline.position_by_server_id(server_id).is_some() {
                return TimelineDelta::discard(DiscardReason::DuplicateServerId, message);
            }
        }

        let missing = missing_fields(message);
        let Some(index) = timeline.position_by_local_id(local_id) else {
            return delta;
        };
        let Some(entry) = timeline.get_mut(index) else {
            return delta;
        };
        entry.absorb(message);
        delta.merged.push(EntryChange {
            index,
            entry: entry.clone(),
        });

        if missing.contains(&"serverId") {
            let anomaly = ReconciliationAnomaly {
                conversation: conversation.clone(),
                missing,
                message: message.clone(),
                observed_at,
            };
            warn!(
                "Send {} in {} confirmed without a server id",
                local_id, conversation
            );
            self.record_anomaly(anomaly.clone());
            delta.anomalies.push(anomaly);
        }
        delta
    }

    /// Flag a pending entry whose send request failed. The entry stays in the
    /// timeline and can still be confirmed by a later report.
    pub fn mark_failed(&mut self, conversation: &ConversationId, local_id: &LocalId) -> bool {
        let Some(timeline) = self.timelines.get_mut(conversation) else {
            return false;
        };
        match timeline
            .position_by_local_id(local_id)
            .and_then(|i| timeline.get_mut(i))
        {
            Some(entry) if entry.is_pending() => {
                entry.failed = true;
                true
            }
            _ => false,
        }
    }
}

fn missing_fields(message: &MessagePayload) -> Vec<&'static str> {
    let mut missing = Vec::new();
    if message.server_id.is_none() {
        missing.push("serverId");
    }
    if message.content.is_none() {
        missing.push("content");
    }
    if message.direction.is_none() {
        missing.push("direction");
    }
    if message.sent_at.is_none() {
        missing.push("sentAt");
    }
    missing
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn at_ms(ms: i64) -> Timestamp {
        Utc.timestamp_millis_opt(1_700_000_000_000 + ms).unwrap()
    }

    fn engine() -> ReconciliationEngine {
        ReconciliationEngine::new(Duration::from_secs(5), Duration::from_secs(3))
    }

    fn confirmed(id: &str, content: &str, direction: Direction, ms: i64) -> MessagePayload {
        MessagePayload {
            server_id: Some(id.to_string()),
            content: Some(content.to_string()),
            direction: Some(direction),
            sent_at: Some(at_ms(ms)),
            ..Default::default()
        }
    }

    fn envelope(conversation: &str, message: MessagePayload, ms: i64) -> Envelope {
        Envelope::new_message(conversation.into(), message, at_ms(ms))
    }

    fn conv() -> ConversationId {
        ConversationId::from("c1")
    }

    #[test]
    fn test_applying_twice_is_idempotent() {
        let mut engine = engine();
        let e = envelope("c1", confirmed("s1", "hello", Direction::Inbound, 0), 10);

        let first = engine.apply_envelope(&conv(), &e);
        assert_eq!(first.inserted.len(), 1);
        let snapshot = engine.entries(&conv());

        let second = engine.apply_envelope(&conv(), &e);
        assert!(!second.changed());
        assert_eq!(second.discarded[0].reason, DiscardReason::DuplicateServerId);
        assert_eq!(engine.entries(&conv()), snapshot);
    }

    #[test]
    fn test_pending_merges_in_place() {
        let mut engine = engine();
        engine.apply_confirmed(&conv(), &confirmed("s0", "earlier", Direction::Inbound, -60_000), at_ms(0));
        let (local_id, _) = engine.send_optimistic(&conv(), "hi", at_ms(0));
        engine.apply_confirmed(&conv(), &confirmed("s9", "later", Direction::Inbound, 1_000), at_ms(0));

        let delta = engine.apply_envelope(&conv(), &envelope("c1", confirmed("s1", "hi", Direction::Outbound, 2_000), 2_100));
        assert_eq!(delta.merged.len(), 1);
        assert_eq!(delta.merged[0].index, 1);

        let entries = engine.entries(&conv());
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[1].local_id.as_ref(), Some(&local_id));
        assert_eq!(entries[1].server_id.as_deref(), Some("s1"));
        assert!(entries[1].confirmed);
    }

    #[test]
    fn test_no_merge_across_direction() {
        let mut engine = engine();
        engine.send_optimistic(&conv(), "hi", at_ms(0));
        let delta = engine.apply_envelope(&conv(), &envelope("c1", confirmed("s1", "hi", Direction::Inbound, 1_000), 1_000));

        assert_eq!(delta.inserted.len(), 1);
        let entries = engine.entries(&conv());
        assert_eq!(entries.len(), 2);
        assert!(entries[0].is_pending());
    }

    #[test]
    fn test_no_merge_outside_tolerance() {
        let mut engine = engine();
        engine.send_optimistic(&conv(), "hi", at_ms(0));
        engine.apply_envelope(&conv(), &envelope("c1", confirmed("s1", "hi", Direction::Outbound, 6_000), 6_000));

        let entries = engine.entries(&conv());
        assert_eq!(entries.len(), 2);
        assert!(entries[0].is_pending());
    }

    #[test]
    fn test_same_server_id_across_cycles_yields_one_entry() {
        let mut engine = engine();
        let message = confirmed("s1", "hey", Direction::Inbound, 0);
        engine.apply_envelope(&conv(), &envelope("c1", message.clone(), 100));
        engine.apply_envelope(&conv(), &envelope("c1", message, 3_100));
        assert_eq!(engine.entries(&conv()).len(), 1);
    }

    #[test]
    fn test_near_duplicate_with_new_server_id_discarded() {
        let mut engine = engine();
        engine.apply_confirmed(&conv(), &confirmed("s1", "hey", Direction::Inbound, 0), at_ms(0));
        let delta = engine.apply_confirmed(&conv(), &confirmed("wamid-77", "hey", Direction::Inbound, 2_000), at_ms(0));

        assert_eq!(delta.discarded[0].reason, DiscardReason::NearDuplicate);
        assert_eq!(engine.entries(&conv()).len(), 1);
    }

    #[test]
    fn test_external_id_match_discarded() {
        let mut engine = engine();
        let mut first = confirmed("s1", "photo", Direction::Inbound, 0);
        first.external_id = Some("ext-1".to_string());
        engine.apply_confirmed(&conv(), &first, at_ms(0));

        let mut second = confirmed("s2", "photo caption", Direction::Inbound, 60_000);
        second.external_id = Some("ext-1".to_string());
        let delta = engine.apply_confirmed(&conv(), &second, at_ms(0));
        assert_eq!(delta.discarded[0].reason, DiscardReason::DuplicateExternalId);
    }

    #[test]
    fn test_confirmed_before_pending_adopts_local_id() {
        let mut engine = engine();
        engine.apply_envelope(&conv(), &envelope("c1", confirmed("s1", "ping", Direction::Outbound, 500), 1_000));

        let (local_id, delta) = engine.send_optimistic(&conv(), "ping", at_ms(0));
        assert!(delta.inserted.is_empty());
        assert_eq!(delta.merged.len(), 1);

        let entries = engine.entries(&conv());
        assert_eq!(entries.len(), 1);
        assert!(entries[0].confirmed);
        assert_eq!(entries[0].local_id.as_ref(), Some(&local_id));
    }

    #[test]
    fn test_second_identical_send_stays_separate() {
        let mut engine = engine();
        engine.send_optimistic(&conv(), "ok", at_ms(0));
        engine.apply_confirmed(&conv(), &confirmed("s1", "ok", Direction::Outbound, 200), at_ms(200));

        let (_, delta) = engine.send_optimistic(&conv(), "ok", at_ms(1_000));
        assert_eq!(delta.inserted.len(), 1);

        let merge = engine.apply_confirmed(&conv(), &confirmed("s2", "ok", Direction::Outbound, 1_200), at_ms(1_200));
        assert_eq!(merge.merged.len(), 1);
        let entries = engine.entries(&conv());
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.confirmed));
    }

    #[test]
    fn test_race_both_orders_give_one_entry() {
        let poll = envelope("c1", confirmed("s1", "ping", Direction::Outbound, 500), 1_000);
        let response = confirmed("s1", "ping", Direction::Outbound, 500);

        // poll resolution first
        let mut a = engine();
        let (local_a, _) = a.send_optimistic(&conv(), "ping", at_ms(0));
        a.apply_envelope(&conv(), &poll);
        a.complete_send(&conv(), &local_a, &response, at_ms(1_100));

        // send completion first
        let mut b = engine();
        let (local_b, _) = b.send_optimistic(&conv(), "ping", at_ms(0));
        b.complete_send(&conv(), &local_b, &response, at_ms(900));
        b.apply_envelope(&conv(), &poll);

        for engine in [&a, &b] {
            let entries = engine.entries(&conv());
            assert_eq!(entries.len(), 1);
            assert!(entries[0].confirmed);
            assert_eq!(entries[0].server_id.as_deref(), Some("s1"));
        }
    }

    #[test]
    fn test_missing_fields_fail_open() {
        let mut engine = engine();
        let message = MessagePayload {
            content: Some("no id".to_string()),
            ..Default::default()
        };
        let e = envelope("c1", message, 0);

        let delta = engine.apply_envelope(&conv(), &e);
        assert_eq!(delta.inserted.len(), 1);
        assert_eq!(delta.anomalies.len(), 1);
        assert!(delta.anomalies[0].missing.contains(&"serverId"));
        assert_eq!(engine.anomalies().count(), 1);

        let again = engine.apply_envelope(&conv(), &e);
        assert_eq!(again.discarded[0].reason, DiscardReason::RepeatedAnomaly);
        assert_eq!(engine.entries(&conv()).len(), 1);
    }

    fn without_server_id(mut message: MessagePayload) -> MessagePayload {
        message.server_id = None;
        message
    }

    #[test]
    fn test_repeat_without_server_id_is_near_duplicate() {
        let mut engine = engine();
        let message = confirmed("s1", "hey", Direction::Inbound, 0);
        engine.apply_confirmed(&conv(), &message, at_ms(0));

        let delta = engine.apply_confirmed(&conv(), &without_server_id(message), at_ms(100));
        assert!(delta.inserted.is_empty());
        assert_eq!(delta.discarded[0].reason, DiscardReason::NearDuplicate);
        assert!(delta.anomalies.is_empty());
        assert_eq!(engine.entries(&conv()).len(), 1);
    }

    #[test]
    fn test_confirmation_without_server_id_merges_pending() {
        let mut engine = engine();
        let (local_id, _) = engine.send_optimistic(&conv(), "hi", at_ms(0));

        let report = without_server_id(confirmed("", "hi", Direction::Outbound, 1_000));
        let delta = engine.apply_confirmed(&conv(), &report, at_ms(1_000));
        assert_eq!(delta.merged.len(), 1);
        assert!(delta.inserted.is_empty());
        assert_eq!(delta.anomalies[0].missing, vec!["serverId"]);

        let entries = engine.entries(&conv());
        assert_eq!(entries.len(), 1);
        assert!(entries[0].confirmed);
        assert_eq!(entries[0].local_id.as_ref(), Some(&local_id));

        // the send response later supplies the id
        let filled = engine.complete_send(
            &conv(),
            &local_id,
            &confirmed("s1", "hi", Direction::Outbound, 1_000),
            at_ms(1_100),
        );
        assert_eq!(filled.merged.len(), 1);
        let entries = engine.entries(&conv());
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].server_id.as_deref(), Some("s1"));
    }

    #[test]
    fn test_new_message_without_server_id_inserted_with_anomaly() {
        let mut engine = engine();
        let report = without_server_id(confirmed("", "fresh", Direction::Inbound, 0));
        let delta = engine.apply_confirmed(&conv(), &report, at_ms(0));

        assert_eq!(delta.inserted.len(), 1);
        assert_eq!(delta.anomalies.len(), 1);
        assert_eq!(engine.anomalies().count(), 1);
    }

    #[test]
    fn test_send_response_folds_confirmation_outside_tolerance() {
        let mut engine = engine();
        let (local_id, _) = engine.send_optimistic(&conv(), "ping", at_ms(0));

        // clock skew puts the polled confirmation past the merge window
        let polled = confirmed("s1", "ping", Direction::Outbound, 6_000);
        let inserted = engine.apply_envelope(&conv(), &envelope("c1", polled.clone(), 6_000));
        assert_eq!(inserted.inserted.len(), 1);
        assert_eq!(engine.entries(&conv()).len(), 2);

        let delta = engine.complete_send(&conv(), &local_id, &polled, at_ms(6_100));
        assert!(delta.discarded.is_empty());
        assert_eq!(delta.removed.len(), 1);
        assert_eq!(delta.removed[0].entry.server_id.as_deref(), Some("s1"));
        assert_eq!(delta.merged.len(), 1);
        assert!(delta.changed());

        let entries = engine.entries(&conv());
        assert_eq!(entries.len(), 1);
        assert!(entries[0].confirmed);
        assert_eq!(entries[0].local_id.as_ref(), Some(&local_id));
        assert_eq!(entries[0].server_id.as_deref(), Some("s1"));
        assert!(entries.iter().all(|e| !e.is_pending()));
    }

    #[test]
    fn test_chat_updated_and_foreign_envelopes_ignored() {
        let mut engine = engine();
        let other = envelope("c2", confirmed("s1", "x", Direction::Inbound, 0), 0);
        assert!(engine.apply_envelope(&conv(), &other).is_empty());
        assert!(engine.entries(&conv()).is_empty());
    }

    #[test]
    fn test_mark_failed_only_for_pending() {
        let mut engine = engine();
        let (local_id, _) = engine.send_optimistic(&conv(), "late", at_ms(0));
        assert!(engine.mark_failed(&conv(), &local_id));
        assert!(engine.entries(&conv())[0].failed);

        engine.apply_confirmed(&conv(), &confirmed("s1", "late", Direction::Outbound, 1_000), at_ms(1_000));
        let entries = engine.entries(&conv());
        assert!(entries[0].confirmed);
        assert!(!entries[0].failed);
        assert!(!engine.mark_failed(&conv(), &local_id));
    }
}
