/// Latest chat summary per conversation, fed by `chat_updated` envelopes
use crate::types::{ChatSummary, ConversationId};
use std::collections::HashMap;

#[derive(Debug, Default, Clone)]
pub struct SummaryStore {
    summaries: HashMap<ConversationId, ChatSummary>,
}

impl SummaryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `summary` unless a newer one is already held. Returns whether the
    /// stored value changed.
    pub fn apply(&mut self, summary: &ChatSummary) -> bool {
        match self.summaries.get(&summary.conversation_id) {
            Some(current) if current.updated_at > summary.updated_at => false,
            Some(current) if current == summary => false,
            _ => {
                self.summaries
                    .insert(summary.conversation_id.clone(), summary.clone());
                true
            }
        }
    }

    pub fn get(&self, conversation: &ConversationId) -> Option<&ChatSummary> {
        self.summaries.get(conversation)
    }

    /// All summaries, most recently updated first
    pub fn all(&self) -> Vec<ChatSummary> {
        let mut list: Vec<_> = self.summaries.values().cloned().collect();
        list.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        list
    }
}
