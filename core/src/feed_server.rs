/// Local feed server: the HTTP poll endpoint and the per-conversation socket
/// endpoint over one in-memory update log.
///
/// Ports: HTTP on `port`, socket on `port + 1`.
///
/// Endpoints:
///   GET  /updates     ?scope=<id|all>&since=<rfc3339>
///   POST /messages    body: {"conversationId":"...","content":"...","direction":"inbound|outbound"}
///   WS   /ws/:conversation
use crate::error::{Result, SyncError};
use crate::transport::SocketFrame;
use crate::types::{
    ChatSummary, ConversationId, Direction, Envelope, MessagePayload, RawEnvelope, Timestamp,
    UpdatesResponse,
};
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use http_body_util::{BodyExt, Full};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use http::StatusCode;
use hyper::{Method, Request, Response};
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{
    ErrorResponse, Request as WsRequest, Response as WsResponse,
};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, error, info, warn};

// ─── Type alias ──────────────────────────────────────────────────────────────

type BoxBody = http_body_util::combinators::BoxBody<bytes::Bytes, Infallible>;
type Resp = Response<BoxBody>;

const LIVE_CHANNEL_CAPACITY: usize = 1024;
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

// ─── Update log ──────────────────────────────────────────────────────────────

#[derive(Default)]
struct FeedLog {
    envelopes: Vec<Envelope>,
    /// Last timestamp handed out; strictly increasing
    clock: Option<Timestamp>,
    next_id: u64,
    unread: HashMap<ConversationId, u32>,
}

impl FeedLog {
    fn tick(&mut self) -> Timestamp {
        let now = Utc::now();
        let stamp = match self.clock {
            Some(last) if now <= last => last + chrono::Duration::nanoseconds(1),
            _ => now,
        };
        self.clock = Some(stamp);
        stamp
    }

    fn append(&mut self, mut envelope: Envelope) -> Envelope {
        envelope.observed_at = self.tick();
        self.envelopes.push(envelope.clone());
        envelope
    }
}

struct FeedState {
    log: Mutex<FeedLog>,
    live: broadcast::Sender<Envelope>,
    /// Bumped to force every open socket closed
    epoch: watch::Sender<u64>,
}

impl FeedState {
    fn log(&self) -> MutexGuard<'_, FeedLog> {
        self.log.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// In-memory update feed with HTTP and WebSocket front ends
#[derive(Clone)]
pub struct FeedServer {
    state: Arc<FeedState>,
}

impl Default for FeedServer {
    fn default() -> Self {
        Self::new()
    }
}

impl FeedServer {
    pub fn new() -> Self {
        let (live, _) = broadcast::channel(LIVE_CHANNEL_CAPACITY);
        let (epoch, _) = watch::channel(0);
        Self {
            state: Arc::new(FeedState {
                log: Mutex::new(FeedLog::default()),
                live,
                epoch,
            }),
        }
    }

    /// Append an envelope to the log and push it to open sockets. The
    /// envelope is re-stamped so observation times stay strictly increasing.
    pub fn publish(&self, envelope: Envelope) -> Envelope {
        let envelope = self.state.log().append(envelope);
        let _ = self.state.live.send(envelope.clone());
        envelope
    }

    /// Record a confirmed message, publishing `new_message` then `chat_updated`
    pub fn post_message(
        &self,
        conversation: &ConversationId,
        content: &str,
        direction: Direction,
    ) -> MessagePayload {
        let (message, published) = {
            let mut log = self.state.log();
            log.next_id += 1;
            let sent_at = log.tick();
            let message = MessagePayload {
                conversation_id: Some(conversation.clone()),
                server_id: Some(format!("srv-{}", log.next_id)),
                content: Some(content.to_string()),
                direction: Some(direction),
                sent_at: Some(sent_at),
                ..Default::default()
            };

            let unread = log.unread.entry(conversation.clone()).or_default();
            match direction {
                Direction::Inbound => *unread += 1,
                Direction::Outbound => *unread = 0,
            }
            let unread_count = *unread;

            let new_message = log.append(Envelope::new_message(
                conversation.clone(),
                message.clone(),
                sent_at,
            ));
            let summary = ChatSummary {
                conversation_id: conversation.clone(),
                last_preview: Some(content.to_string()),
                unread_count,
                updated_at: sent_at,
            };
            let chat_updated = log.append(Envelope::chat_updated(summary, sent_at));
            (message, [new_message, chat_updated])
        };

        for envelope in published {
            let _ = self.state.live.send(envelope);
        }
        debug!(
            "Posted {:?} message {:?} in {}",
            direction, message.server_id, conversation
        );
        message
    }

    /// Everything observed after `since` for `scope` ("all" or a conversation id)
    pub fn updates(&self, scope: &str, since: Option<Timestamp>) -> UpdatesResponse {
        let mut log = self.state.log();
        let updates: Vec<RawEnvelope> = log
            .envelopes
            .iter()
            .filter(|e| since.map_or(true, |since| e.observed_at > since))
            .filter(|e| scope == "all" || e.conversation().map(|c| c.as_str()) == Some(scope))
            .cloned()
            .map(RawEnvelope::from)
            .collect();
        UpdatesResponse {
            updates: Some(updates),
            server_time: log.tick(),
        }
    }

    pub fn len(&self) -> usize {
        self.state.log().envelopes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close every open socket connection. Clients may reconnect.
    pub fn disconnect_sockets(&self) {
        self.state.epoch.send_modify(|epoch| *epoch += 1);
    }

    /// Bind both listeners and serve them in background tasks
    pub async fn bind(&self, http_addr: SocketAddr, socket_addr: SocketAddr) -> Result<RunningFeed> {
        let http = TcpListener::bind(http_addr).await?;
        let socket = TcpListener::bind(socket_addr).await?;
        let running = RunningFeed {
            http_addr: http.local_addr()?,
            socket_addr: socket.local_addr()?,
            tasks: vec![
                tokio::spawn(serve_http(self.state.clone(), http)),
                tokio::spawn(serve_socket(self.state.clone(), socket)),
            ],
        };
        info!(
            "Feed server on http://{} (socket ws://{})",
            running.http_addr, running.socket_addr
        );
        Ok(running)
    }

    /// Serve on `port` (HTTP) and `port + 1` (socket) on loopback
    pub async fn start(&self, port: u16) -> Result<RunningFeed> {
        let socket_port = port
            .checked_add(1)
            .ok_or_else(|| SyncError::Config(format!("no socket port above {}", port)))?;
        let http_addr = SocketAddr::from(([127, 0, 0, 1], port));
        let socket_addr = SocketAddr::from(([127, 0, 0, 1], socket_port));
        self.bind(http_addr, socket_addr).await
    }
}

/// Handle on a bound feed server; dropping it stops serving
pub struct RunningFeed {
    pub http_addr: SocketAddr,
    pub socket_addr: SocketAddr,
    tasks: Vec<JoinHandle<()>>,
}

impl RunningFeed {
    pub fn http_url(&self) -> String {
        format!("http://{}", self.http_addr)
    }

    pub fn socket_url(&self) -> String {
        format!("ws://{}", self.socket_addr)
    }
}

impl Drop for RunningFeed {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

// ─── HTTP ────────────────────────────────────────────────────────────────────

fn cors_headers(builder: hyper::http::response::Builder) -> hyper::http::response::Builder {
    builder
        .header("Access-Control-Allow-Origin", "*")
        .header("Access-Control-Allow-Methods", "GET, POST, OPTIONS")
        .header("Access-Control-Allow-Headers", "Content-Type")
}

fn json_resp(status: StatusCode, body: Vec<u8>) -> Resp {
    cors_headers(Response::builder())
        .status(status)
        .header("Content-Type", "application/json")
        .body(Full::new(bytes::Bytes::from(body)).boxed())
        .unwrap_or_else(|_| Response::new(Full::new(bytes::Bytes::new()).boxed()))
}

fn json_ok<T: serde::Serialize>(value: &T) -> Resp {
    match serde_json::to_vec(value) {
        Ok(body) => json_resp(StatusCode::OK, body),
        Err(e) => json_err(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}

fn json_err(status: StatusCode, msg: &str) -> Resp {
    json_resp(
        status,
        serde_json::to_vec(&serde_json::json!({ "error": msg })).unwrap_or_default(),
    )
}

async fn serve_http(state: Arc<FeedState>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, _peer)) => {
                let io = TokioIo::new(stream);
                let state = state.clone();
                tokio::spawn(async move {
                    let svc = service_fn(move |req| {
                        let state = state.clone();
                        async move { Ok::<_, Infallible>(handle(req, state).await) }
                    });
                    if let Err(e) = http1::Builder::new().serve_connection(io, svc).await {
                        if !e.is_incomplete_message() {
                            error!("Feed HTTP connection error: {:?}", e);
                        }
                    }
                });
            }
            Err(e) => error!("Feed HTTP accept error: {}", e),
        }
    }
}

async fn handle(req: Request<hyper::body::Incoming>, state: Arc<FeedState>) -> Resp {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = req.uri().query().unwrap_or("").to_string();

    if method == Method::OPTIONS {
        return cors_headers(Response::builder())
            .status(StatusCode::NO_CONTENT)
            .body(Full::new(bytes::Bytes::new()).boxed())
            .unwrap_or_else(|_| Response::new(Full::new(bytes::Bytes::new()).boxed()));
    }

    let feed = FeedServer { state };
    match (method, path.as_str()) {
        (Method::GET, "/updates") => get_updates(&query, &feed),
        (Method::POST, "/messages") => post_messages(req, &feed).await,
        _ => json_err(StatusCode::NOT_FOUND, "not found"),
    }
}

fn get_updates(query: &str, feed: &FeedServer) -> Resp {
    let scope = parse_query(query, "scope").unwrap_or_else(|| "all".to_string());
    let since = match parse_query(query, "since") {
        None => None,
        Some(raw) => match DateTime::parse_from_rfc3339(&raw) {
            Ok(since) => Some(since.with_timezone(&Utc)),
            Err(e) => {
                return json_err(StatusCode::BAD_REQUEST, &format!("invalid since: {}", e))
            }
        },
    };
    json_ok(&feed.updates(&scope, since))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PostMessageRequest {
    #[serde(alias = "chatId")]
    conversation_id: ConversationId,
    content: String,
    #[serde(default)]
    direction: Option<Direction>,
}

async fn post_messages(req: Request<hyper::body::Incoming>, feed: &FeedServer) -> Resp {
    let body = match read_body(req).await {
        Ok(b) => b,
        Err(e) => return json_err(StatusCode::BAD_REQUEST, &format!("body read error: {}", e)),
    };
    let req: PostMessageRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => return json_err(StatusCode::BAD_REQUEST, &format!("invalid JSON: {}", e)),
    };
    if req.conversation_id.as_str().is_empty() {
        return json_err(StatusCode::BAD_REQUEST, "conversationId is empty");
    }
    let direction = req.direction.unwrap_or(Direction::Outbound);
    json_ok(&feed.post_message(&req.conversation_id, &req.content, direction))
}

async fn read_body(req: Request<hyper::body::Incoming>) -> std::result::Result<bytes::Bytes, String> {
    req.collect()
        .await
        .map(|c| c.to_bytes())
        .map_err(|e| e.to_string())
}

fn parse_query(query: &str, key: &str) -> Option<String> {
    for pair in query.split('&') {
        if let Some((k, v)) = pair.split_once('=') {
            if k == key {
                return urlencoding::decode(v).ok().map(|v| v.into_owned());
            }
        }
    }
    None
}

// ─── Socket ──────────────────────────────────────────────────────────────────

fn conversation_from_path(path: &str) -> Option<ConversationId> {
    let raw = path.strip_prefix("/ws/")?;
    let decoded = urlencoding::decode(raw).ok()?;
    if decoded.is_empty() || decoded.contains('/') {
        return None;
    }
    Some(ConversationId::new(decoded.into_owned()))
}

async fn serve_socket(state: Arc<FeedState>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let state = state.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_socket(state, stream).await {
                        debug!("Socket {} ended: {}", peer, e);
                    }
                });
            }
            Err(e) => error!("Feed socket accept error: {}", e),
        }
    }
}

async fn handle_socket(state: Arc<FeedState>, stream: TcpStream) -> Result<()> {
    // Subscribe before the handshake completes so nothing published after the
    // client sees the channel open is missed
    let mut live = state.live.subscribe();
    let mut epoch = state.epoch.subscribe();

    let mut conversation = None;
    let callback = |request: &WsRequest, response: WsResponse| {
        match conversation_from_path(request.uri().path()) {
            Some(id) => {
                conversation = Some(id);
                Ok(response)
            }
            None => {
                let mut rejection = ErrorResponse::new(Some("unknown socket path".to_string()));
                *rejection.status_mut() = StatusCode::NOT_FOUND;
                Err(rejection)
            }
        }
    };
    let ws = tokio_tungstenite::accept_hdr_async(stream, callback)
        .await
        .map_err(|e| SyncError::Socket(e.to_string()))?;
    let Some(conversation) = conversation else {
        return Ok(());
    };

    let (mut writer, mut reader) = ws.split();
    send_frame(
        &mut writer,
        &SocketFrame::Hello {
            conversation: conversation.clone(),
        },
    )
    .await?;
    debug!("Socket open for {}", conversation);

    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.tick().await;

    loop {
        tokio::select! {
            update = live.recv() => match update {
                Ok(envelope) => {
                    if envelope.conversation() == Some(&conversation) {
                        send_frame(&mut writer, &SocketFrame::Envelope { envelope }).await?;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Socket for {} lagged {} updates", conversation, n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            incoming = reader.next() => match incoming {
                Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            _ = heartbeat.tick() => send_frame(&mut writer, &SocketFrame::Heartbeat).await?,
            _ = epoch.changed() => {
                debug!("Closing socket for {} on request", conversation);
                let _ = writer.send(WsMessage::Close(None)).await;
                break;
            }
        }
    }
    debug!("Socket closed for {}", conversation);
    Ok(())
}

async fn send_frame<S>(writer: &mut S, frame: &SocketFrame) -> Result<()>
where
    S: futures_util::Sink<WsMessage> + Unpin,
    S::Error: std::fmt::Display,
{
    let text = serde_json::to_string(frame)?;
    writer
        .send(WsMessage::text(text))
        .await
        .map_err(|e| SyncError::Socket(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_post_message_publishes_message_then_summary() {
        let feed = FeedServer::new();
        let conversation = ConversationId::from("c1");
        let message = feed.post_message(&conversation, "hello", Direction::Inbound);
        assert_eq!(message.server_id.as_deref(), Some("srv-1"));

        let response = feed.updates("c1", None);
        let kinds: Vec<String> = response
            .updates
            .unwrap_or_default()
            .into_iter()
            .map(|raw| raw.kind)
            .collect();
        assert_eq!(kinds, vec!["new_message", "chat_updated"]);
    }

    #[test]
    fn test_updates_filter_by_since_and_scope() {
        let feed = FeedServer::new();
        feed.post_message(&"c1".into(), "one", Direction::Inbound);
        let first = feed.updates("all", None);
        feed.post_message(&"c2".into(), "two", Direction::Inbound);

        let later = feed.updates("all", Some(first.server_time));
        assert_eq!(later.updates.as_ref().map(Vec::len), Some(2));
        assert!(later.server_time > first.server_time);

        assert_eq!(feed.updates("c2", None).updates.map(|u| u.len()), Some(2));
        assert_eq!(feed.updates("c3", None).updates.map(|u| u.len()), Some(0));
    }

    #[test]
    fn test_observed_times_strictly_increase() {
        let feed = FeedServer::new();
        let a = feed.publish(Envelope::global_new_message(MessagePayload::default(), Utc::now()));
        let b = feed.publish(Envelope::global_new_message(MessagePayload::default(), Utc::now()));
        assert!(b.observed_at > a.observed_at);
    }

    #[test]
    fn test_unread_count_resets_on_outbound() {
        let feed = FeedServer::new();
        let conversation = ConversationId::from("c1");
        feed.post_message(&conversation, "a", Direction::Inbound);
        feed.post_message(&conversation, "b", Direction::Inbound);
        feed.post_message(&conversation, "c", Direction::Outbound);

        let counts: Vec<u64> = feed
            .updates("c1", None)
            .updates
            .unwrap_or_default()
            .into_iter()
            .filter(|raw| raw.kind == "chat_updated")
            .filter_map(|raw| raw.payload["unreadCount"].as_u64())
            .collect();
        assert_eq!(counts, vec![1, 2, 0]);
    }

    #[test]
    fn test_socket_path_parsing() {
        assert_eq!(conversation_from_path("/ws/c1"), Some("c1".into()));
        assert_eq!(conversation_from_path("/ws/a%20b"), Some("a b".into()));
        assert_eq!(conversation_from_path("/ws/"), None);
        assert_eq!(conversation_from_path("/updates"), None);
    }

    #[test]
    fn test_parse_query_decodes() {
        assert_eq!(
            parse_query("scope=all&since=2024-01-01T00%3A00%3A00Z", "since").as_deref(),
            Some("2024-01-01T00:00:00Z")
        );
        assert_eq!(parse_query("scope=all", "since"), None);
    }
}
