/// Shared types for the sync layer: ids, message payloads and update envelopes
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Server-side or client-side wall clock instant.
pub type Timestamp = DateTime<Utc>;

/// Conversation identifier as assigned by the server
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(String);

impl ConversationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConversationId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ConversationId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Client-generated id of an optimistic entry, unique within a timeline
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocalId(String);

impl LocalId {
    pub fn generate() -> Self {
        Self(format!("local-{}", uuid::Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for LocalId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Subscription scope key. The "global" scope is not a key: global handlers
/// live in their own set inside the registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ScopeKey {
    Conversation(ConversationId),
    AllConversations,
}

impl ScopeKey {
    /// Value of the `scope` query parameter for this key
    pub fn as_query(&self) -> &str {
        match self {
            ScopeKey::Conversation(id) => id.as_str(),
            ScopeKey::AllConversations => "all",
        }
    }

    pub fn conversation(&self) -> Option<&ConversationId> {
        match self {
            ScopeKey::Conversation(id) => Some(id),
            ScopeKey::AllConversations => None,
        }
    }
}

impl fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_query())
    }
}

/// A message as reported by the feed.
///
/// Every field is optional on the wire: different envelopes report the same
/// message with different shapes, and missing fields surface later as
/// reconciliation anomalies rather than parse failures.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", from = "RawMessage")]
pub struct MessagePayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<ConversationId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub direction: Option<Direction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<Timestamp>,
    /// Media descriptors, opaque to the sync layer
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub media: Vec<serde_json::Value>,
}

/// Wire shape accepted for a message. Feeds disagree on field names, so the
/// known aliases are folded into one [`MessagePayload`].
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMessage {
    #[serde(default, alias = "chatId")]
    conversation_id: Option<ConversationId>,
    #[serde(default, alias = "id", alias = "messageId")]
    server_id: Option<String>,
    #[serde(default)]
    external_id: Option<String>,
    #[serde(default, alias = "body", alias = "text")]
    content: Option<String>,
    #[serde(default)]
    direction: Option<Direction>,
    #[serde(default)]
    from_me: Option<bool>,
    #[serde(default, alias = "timestamp")]
    sent_at: Option<Timestamp>,
    #[serde(default)]
    media: Vec<serde_json::Value>,
}

impl From<RawMessage> for MessagePayload {
    fn from(raw: RawMessage) -> Self {
        let direction = raw.direction.or(raw.from_me.map(|from_me| {
            if from_me {
                Direction::Outbound
            } else {
                Direction::Inbound
            }
        }));
        Self {
            conversation_id: raw.conversation_id,
            server_id: raw.server_id,
            external_id: raw.external_id,
            content: raw.content,
            direction,
            sent_at: raw.sent_at,
            media: raw.media,
        }
    }
}

/// Coarse chat-level summary carried by `chat_updated`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSummary {
    pub conversation_id: ConversationId,
    #[serde(default)]
    pub last_preview: Option<String>,
    #[serde(default)]
    pub unread_count: u32,
    pub updated_at: Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpdateKind {
    NewMessage,
    ChatUpdated,
    GlobalNewMessage,
}

impl UpdateKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateKind::NewMessage => "new_message",
            UpdateKind::ChatUpdated => "chat_updated",
            UpdateKind::GlobalNewMessage => "global_new_message",
        }
    }

    pub fn parse(kind: &str) -> Option<Self> {
        match kind {
            "new_message" => Some(UpdateKind::NewMessage),
            "chat_updated" => Some(UpdateKind::ChatUpdated),
            "global_new_message" => Some(UpdateKind::GlobalNewMessage),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EnvelopePayload {
    NewMessage(MessagePayload),
    ChatUpdated(ChatSummary),
    GlobalNewMessage(MessagePayload),
}

/// Normalized update unit flowing from a transport to the dispatcher
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawEnvelope", into = "RawEnvelope")]
pub struct Envelope {
    /// Conversation the update belongs to, `None` for global scope
    pub scope: Option<ConversationId>,
    pub observed_at: Timestamp,
    pub payload: EnvelopePayload,
}

impl Envelope {
    pub fn new_message(
        scope: ConversationId,
        message: MessagePayload,
        observed_at: Timestamp,
    ) -> Self {
        Self {
            scope: Some(scope),
            observed_at,
            payload: EnvelopePayload::NewMessage(message),
        }
    }

    pub fn chat_updated(summary: ChatSummary, observed_at: Timestamp) -> Self {
        Self {
            scope: Some(summary.conversation_id.clone()),
            observed_at,
            payload: EnvelopePayload::ChatUpdated(summary),
        }
    }

    pub fn global_new_message(message: MessagePayload, observed_at: Timestamp) -> Self {
        Self {
            scope: None,
            observed_at,
            payload: EnvelopePayload::GlobalNewMessage(message),
        }
    }

    pub fn kind(&self) -> UpdateKind {
        match self.payload {
            EnvelopePayload::NewMessage(_) => UpdateKind::NewMessage,
            EnvelopePayload::ChatUpdated(_) => UpdateKind::ChatUpdated,
            EnvelopePayload::GlobalNewMessage(_) => UpdateKind::GlobalNewMessage,
        }
    }

    /// Conversation whose timeline this envelope targets, if any
    pub fn conversation(&self) -> Option<&ConversationId> {
        match &self.payload {
            EnvelopePayload::NewMessage(m) | EnvelopePayload::GlobalNewMessage(m) => {
                self.scope.as_ref().or(m.conversation_id.as_ref())
            }
            EnvelopePayload::ChatUpdated(s) => Some(&s.conversation_id),
        }
    }

    pub fn message(&self) -> Option<&MessagePayload> {
        match &self.payload {
            EnvelopePayload::NewMessage(m) | EnvelopePayload::GlobalNewMessage(m) => Some(m),
            EnvelopePayload::ChatUpdated(_) => None,
        }
    }
}

/// Envelope as framed on the wire, before the `kind` discriminant is resolved
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawEnvelope {
    pub kind: String,
    #[serde(default)]
    pub scope: Option<ConversationId>,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub observed_at: Timestamp,
}

impl TryFrom<RawEnvelope> for Envelope {
    type Error = String;

    fn try_from(raw: RawEnvelope) -> Result<Self, Self::Error> {
        let kind = UpdateKind::parse(&raw.kind)
            .ok_or_else(|| format!("unknown update kind: {}", raw.kind))?;
        let payload = match kind {
            UpdateKind::NewMessage => EnvelopePayload::NewMessage(
                serde_json::from_value(raw.payload).map_err(|e| e.to_string())?,
            ),
            UpdateKind::GlobalNewMessage => EnvelopePayload::GlobalNewMessage(
                serde_json::from_value(raw.payload).map_err(|e| e.to_string())?,
            ),
            UpdateKind::ChatUpdated => EnvelopePayload::ChatUpdated(
                serde_json::from_value(raw.payload).map_err(|e| e.to_string())?,
            ),
        };
        Ok(Self {
            scope: raw.scope,
            observed_at: raw.observed_at,
            payload,
        })
    }
}

impl From<Envelope> for RawEnvelope {
    fn from(envelope: Envelope) -> Self {
        let kind = envelope.kind().as_str().to_string();
        let payload = match envelope.payload {
            EnvelopePayload::NewMessage(m) | EnvelopePayload::GlobalNewMessage(m) => {
                serde_json::to_value(m)
            }
            EnvelopePayload::ChatUpdated(s) => serde_json::to_value(s),
        }
        .unwrap_or(serde_json::Value::Null);
        Self {
            kind,
            scope: envelope.scope,
            payload,
            observed_at: envelope.observed_at,
        }
    }
}

/// Body of `GET /updates`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdatesResponse {
    #[serde(default)]
    pub updates: Option<Vec<RawEnvelope>>,
    pub server_time: Timestamp,
}
