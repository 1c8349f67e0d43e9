/// Polling fetcher: "updates since checkpoint" over HTTP
use crate::error::FetchError;
use crate::types::{
    ConversationId, Direction, Envelope, MessagePayload, ScopeKey, Timestamp, UpdateKind,
    UpdatesResponse,
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::SecondsFormat;
use http_body_util::{BodyExt, Full};
use hyper::{Method, Request, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::debug;

/// Request side of the HTTP boundary
#[async_trait]
pub trait UpdateFeed: Send + Sync {
    /// `GET /updates?since=<checkpoint>&scope=<id|all>`
    async fn fetch_updates(
        &self,
        scope: &ScopeKey,
        since: Option<Timestamp>,
    ) -> Result<UpdatesResponse, FetchError>;

    /// `POST /messages`, returning the confirmed message
    async fn send_message(
        &self,
        conversation: &ConversationId,
        content: &str,
    ) -> Result<MessagePayload, FetchError>;
}

/// Normalized result of one poll
#[derive(Debug, Clone, PartialEq)]
pub struct FetchOutcome {
    pub envelopes: Vec<Envelope>,
    /// Value the checkpoint moves to once `envelopes` are processed
    pub checkpoint: Timestamp,
}

/// Turn a raw response into envelopes plus the next checkpoint.
///
/// An absent or empty update list is a normal outcome. Unknown kinds are
/// skipped; a known kind with an unreadable payload fails the whole response.
pub fn normalize(response: UpdatesResponse) -> Result<FetchOutcome, FetchError> {
    let raw = response.updates.unwrap_or_default();
    let newest = raw.iter().map(|e| e.observed_at).max();

    let mut envelopes = Vec::with_capacity(raw.len());
    for envelope in raw {
        if UpdateKind::parse(&envelope.kind).is_none() {
            debug!("Skipping update of unknown kind {}", envelope.kind);
            continue;
        }
        envelopes.push(Envelope::try_from(envelope).map_err(FetchError::Malformed)?);
    }

    Ok(FetchOutcome {
        envelopes,
        checkpoint: newest.unwrap_or(response.server_time),
    })
}

/// Fetcher bound to one feed; never touches checkpoints itself
#[derive(Clone)]
pub struct PollingFetcher {
    feed: Arc<dyn UpdateFeed>,
}

impl PollingFetcher {
    pub fn new(feed: Arc<dyn UpdateFeed>) -> Self {
        Self { feed }
    }

    pub async fn fetch(
        &self,
        scope: &ScopeKey,
        since: Option<Timestamp>,
    ) -> Result<FetchOutcome, FetchError> {
        let response = self.feed.fetch_updates(scope, since).await?;
        normalize(response)
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SendBody<'a> {
    conversation_id: &'a ConversationId,
    content: &'a str,
    direction: Direction,
}

/// [`UpdateFeed`] over plain HTTP/1 with hyper
#[derive(Clone)]
pub struct HttpFeed {
    base_url: String,
    client: Client<HttpConnector, Full<Bytes>>,
    timeout: Duration,
}

impl HttpFeed {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            base_url,
            client: Client::builder(TokioExecutor::new()).build_http(),
            timeout,
        }
    }

    fn updates_uri(&self, scope: &ScopeKey, since: Option<Timestamp>) -> Result<Uri, FetchError> {
        let mut uri = format!(
            "{}/updates?scope={}",
            self.base_url,
            urlencoding::encode(scope.as_query())
        );
        if let Some(since) = since {
            let since = since.to_rfc3339_opts(SecondsFormat::AutoSi, true);
            uri.push_str("&since=");
            uri.push_str(&urlencoding::encode(&since));
        }
        uri.parse()
            .map_err(|e| FetchError::InvalidRequest(format!("{}: {}", uri, e)))
    }

    async fn execute(&self, request: Request<Full<Bytes>>) -> Result<Bytes, FetchError> {
        let exchange = async {
            let response = self
                .client
                .request(request)
                .await
                .map_err(|e| FetchError::Connection(e.to_string()))?;
            let status = response.status();
            if !status.is_success() {
                return Err(FetchError::Status(status.as_u16()));
            }
            response
                .into_body()
                .collect()
                .await
                .map(|c| c.to_bytes())
                .map_err(|e| FetchError::Connection(e.to_string()))
        };
        timeout(self.timeout, exchange)
            .await
            .map_err(|_| FetchError::Timeout)?
    }

    /// `POST /messages` with an explicit direction; inbound posts simulate
    /// customer traffic against a local feed server.
    pub async fn post_message(
        &self,
        conversation: &ConversationId,
        content: &str,
        direction: Direction,
    ) -> Result<MessagePayload, FetchError> {
        let body = serde_json::to_vec(&SendBody {
            conversation_id: conversation,
            content,
            direction,
        })
        .map_err(|e| FetchError::InvalidRequest(e.to_string()))?;
        let uri: Uri = format!("{}/messages", self.base_url)
            .parse()
            .map_err(|e| FetchError::InvalidRequest(format!("{}", e)))?;
        let request = Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header("Content-Type", "application/json")
            .body(Full::new(Bytes::from(body)))
            .map_err(|e| FetchError::InvalidRequest(e.to_string()))?;
        let body = self.execute(request).await?;
        serde_json::from_slice(&body).map_err(|e| FetchError::Malformed(e.to_string()))
    }
}

#[async_trait]
impl UpdateFeed for HttpFeed {
    async fn fetch_updates(
        &self,
        scope: &ScopeKey,
        since: Option<Timestamp>,
    ) -> Result<UpdatesResponse, FetchError> {
        let request = Request::builder()
            .method(Method::GET)
            .uri(self.updates_uri(scope, since)?)
            .header("Accept", "application/json")
            .body(Full::new(Bytes::new()))
            .map_err(|e| FetchError::InvalidRequest(e.to_string()))?;
        let body = self.execute(request).await?;
        serde_json::from_slice(&body).map_err(|e| FetchError::Malformed(e.to_string()))
    }

    async fn send_message(
        &self,
        conversation: &ConversationId,
        content: &str,
    ) -> Result<MessagePayload, FetchError> {
        self.post_message(conversation, content, Direction::Outbound)
            .await
    }
}
