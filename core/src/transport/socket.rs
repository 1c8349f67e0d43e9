/// Socket channel: one duplex connection per conversation, normalized to envelopes
use crate::error::{Result, SyncError};
use crate::types::{ConversationId, Envelope};
use async_trait::async_trait;
use futures_util::stream::{unfold, BoxStream};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, warn};

/// Envelopes from an open channel. The stream ends when the connection closes.
pub type EnvelopeStream = BoxStream<'static, Result<Envelope>>;

/// Frames the socket endpoint sends. Only `Envelope` frames leave this module.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SocketFrame {
    Hello { conversation: ConversationId },
    Envelope { envelope: Envelope },
    Heartbeat,
}

#[async_trait]
pub trait SocketConnector: Send + Sync {
    /// Resolves once the channel reached the open state
    async fn open(&self, conversation: &ConversationId) -> Result<EnvelopeStream>;
}

/// WebSocket connector: `<base>/ws/<conversation>`
#[derive(Debug, Clone)]
pub struct WsConnector {
    base_url: String,
}

impl WsConnector {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn url_for(&self, conversation: &ConversationId) -> String {
        format!(
            "{}/ws/{}",
            self.base_url,
            urlencoding::encode(conversation.as_str())
        )
    }
}

#[async_trait]
impl SocketConnector for WsConnector {
    async fn open(&self, conversation: &ConversationId) -> Result<EnvelopeStream> {
        let url = self.url_for(conversation);
        let (ws, _response) = connect_async(url.as_str())
            .await
            .map_err(|e| SyncError::Socket(format!("connect {} failed: {}", url, e)))?;
        debug!("Socket open for {}", conversation);

        let (_sink, reader) = ws.split();
        let stream = unfold(reader, |mut reader| async move {
            loop {
                match reader.next().await {
                    Some(Ok(WsMessage::Close(frame))) => {
                        debug!("Socket closed by server: {:?}", frame);
                        return None;
                    }
                    Some(Ok(message)) => {
                        if let Some(envelope) = normalize_frame(message) {
                            return Some((Ok(envelope), reader));
                        }
                    }
                    Some(Err(e)) => {
                        return Some((Err(SyncError::Socket(e.to_string())), reader));
                    }
                    None => return None,
                }
            }
        });
        Ok(stream.boxed())
    }
}

/// Strip socket framing. Control frames, hello/heartbeat frames and frames
/// that do not parse yield `None`.
pub fn normalize_frame(message: WsMessage) -> Option<Envelope> {
    let parsed = match &message {
        WsMessage::Text(text) => serde_json::from_str::<SocketFrame>(text.as_str()),
        WsMessage::Binary(data) => serde_json::from_slice::<SocketFrame>(data),
        _ => return None,
    };
    match parsed {
        Ok(SocketFrame::Envelope { envelope }) => Some(envelope),
        Ok(_) => None,
        Err(e) => {
            warn!("Dropping unreadable socket frame: {}", e);
            None
        }
    }
}
