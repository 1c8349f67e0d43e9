/// Ordered per-conversation message timeline
use crate::types::{Direction, LocalId, MessagePayload, Timestamp};
use serde::Serialize;

/// One message in a timeline, optimistic or confirmed
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineEntry {
    /// Set for entries that started as an optimistic send
    pub local_id: Option<LocalId>,
    pub server_id: Option<String>,
    pub external_id: Option<String>,
    pub content: Option<String>,
    pub direction: Option<Direction>,
    /// `createdAt` while pending, `sentAt` once confirmed
    pub timestamp: Timestamp,
    /// Position key, fixed when the entry is first inserted. A merge in
    /// place rewrites `timestamp` but never this.
    #[serde(skip)]
    pub order_key: Timestamp,
    pub confirmed: bool,
    /// The send request for a pending entry failed
    pub failed: bool,
    pub media: Vec<serde_json::Value>,
}

impl TimelineEntry {
    pub fn pending(local_id: LocalId, content: String, created_at: Timestamp) -> Self {
        Self {
            local_id: Some(local_id),
            server_id: None,
            external_id: None,
            content: Some(content),
            direction: Some(Direction::Outbound),
            timestamp: created_at,
            order_key: created_at,
            confirmed: false,
            failed: false,
            media: Vec::new(),
        }
    }

    /// Confirmed entry built from a feed message; `fallback` stands in for a
    /// missing `sentAt`.
    pub fn confirmed(message: &MessagePayload, fallback: Timestamp) -> Self {
        let timestamp = message.sent_at.unwrap_or(fallback);
        Self {
            local_id: None,
            server_id: message.server_id.clone(),
            external_id: message.external_id.clone(),
            content: message.content.clone(),
            direction: message.direction,
            timestamp,
            order_key: timestamp,
            confirmed: true,
            failed: false,
            media: message.media.clone(),
        }
    }

    /// Replace this entry's fields with the confirmed ones, keeping its
    /// local id (and therefore its identity for the sender) and its place in
    /// the timeline. Ids the message lacks are kept.
    pub fn absorb(&mut self, message: &MessagePayload) {
        if message.server_id.is_some() {
            self.server_id = message.server_id.clone();
        }
        if message.external_id.is_some() {
            self.external_id = message.external_id.clone();
        }
        if message.content.is_some() {
            self.content = message.content.clone();
        }
        if message.direction.is_some() {
            self.direction = message.direction;
        }
        if let Some(sent_at) = message.sent_at {
            self.timestamp = sent_at;
        }
        self.media = message.media.clone();
        self.confirmed = true;
        self.failed = false;
    }

    pub fn is_pending(&self) -> bool {
        !self.confirmed
    }
}

#[derive(Debug, Clone, Default)]
pub struct Timeline {
    entries: Vec<TimelineEntry>,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[TimelineEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&TimelineEntry> {
        self.entries.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut TimelineEntry> {
        self.entries.get_mut(index)
    }

    /// Insert keeping ascending `order_key` order; ties go after existing
    /// entries so insertion order is stable.
    pub fn insert_ordered(&mut self, entry: TimelineEntry) -> usize {
        let index = self
            .entries
            .partition_point(|e| e.order_key <= entry.order_key);
        self.entries.insert(index, entry);
        index
    }

    pub fn remove(&mut self, index: usize) -> Option<TimelineEntry> {
        (index < self.entries.len()).then(|| self.entries.remove(index))
    }

    pub fn position_by_server_id(&self, server_id: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.server_id.as_deref() == Some(server_id))
    }

    pub fn position_by_external_id(&self, external_id: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.external_id.as_deref() == Some(external_id))
    }

    pub fn position_by_local_id(&self, local_id: &LocalId) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.local_id.as_ref() == Some(local_id))
    }

    pub fn iter(&self) -> impl Iterator<Item = &TimelineEntry> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn at(secs: i64) -> Timestamp {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn pending(id: &str, secs: i64) -> TimelineEntry {
        TimelineEntry::pending(LocalId::from(id), id.to_string(), at(secs))
    }

    #[test]
    fn test_insert_keeps_order_and_tie_stability() {
        let mut timeline = Timeline::new();
        timeline.insert_ordered(pending("b", 10));
        timeline.insert_ordered(pending("a", 5));
        timeline.insert_ordered(pending("c", 10));
        timeline.insert_ordered(pending("d", 7));

        let order: Vec<_> = timeline
            .iter()
            .map(|e| e.content.clone().unwrap_or_default())
            .collect();
        assert_eq!(order, vec!["a", "d", "b", "c"]);
    }

    #[test]
    fn test_absorb_keeps_local_id() {
        let mut entry = pending("x", 0);
        let message = MessagePayload {
            server_id: Some("srv-9".to_string()),
            content: Some("x".to_string()),
            direction: Some(Direction::Outbound),
            sent_at: Some(at(2)),
            ..Default::default()
        };
        entry.absorb(&message);
        assert!(entry.confirmed);
        assert_eq!(entry.local_id, Some(LocalId::from("x")));
        assert_eq!(entry.server_id.as_deref(), Some("srv-9"));
        assert_eq!(entry.timestamp, at(2));
        assert_eq!(entry.order_key, at(0));
    }

    #[test]
    fn test_merged_entry_keeps_its_slot_for_later_inserts() {
        let mut timeline = Timeline::new();
        timeline.insert_ordered(pending("mine", 0));
        let inbound = MessagePayload {
            server_id: Some("srv-1".to_string()),
            content: Some("theirs".to_string()),
            direction: Some(Direction::Inbound),
            sent_at: Some(at(10)),
            ..Default::default()
        };
        timeline.insert_ordered(TimelineEntry::confirmed(&inbound, at(10)));

        let confirmation = MessagePayload {
            server_id: Some("srv-2".to_string()),
            sent_at: Some(at(20)),
            ..Default::default()
        };
        if let Some(entry) = timeline.get_mut(0) {
            entry.absorb(&confirmation);
        }

        let late = MessagePayload {
            server_id: Some("srv-3".to_string()),
            content: Some("late".to_string()),
            direction: Some(Direction::Inbound),
            sent_at: Some(at(15)),
            ..Default::default()
        };
        let index = timeline.insert_ordered(TimelineEntry::confirmed(&late, at(15)));
        assert_eq!(index, 2);

        let keys: Vec<_> = timeline.iter().map(|e| e.order_key).collect();
        assert!(keys.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_absorb_without_ids_keeps_existing_ids() {
        let mut entry = pending("y", 0);
        entry.server_id = Some("srv-1".to_string());
        entry.confirmed = true;
        entry.absorb(&MessagePayload {
            content: Some("y".to_string()),
            ..Default::default()
        });
        assert_eq!(entry.server_id.as_deref(), Some("srv-1"));
    }
}
