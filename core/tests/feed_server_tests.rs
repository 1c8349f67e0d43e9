/// Feed server tests
/// A sync session against a real local feed server over HTTP and WebSocket

extern crate chatsync_core;

use chatsync_core::transport::{HttpFeed, PollingFetcher, SocketConnector, TransportState, WsConnector};
use chatsync_core::types::Direction;
use chatsync_core::{ConversationId, FeedServer, RunningFeed, ScopeKey, SyncConfig, SyncSession};
use futures_util::StreamExt;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::{sleep, timeout};

async fn start_server() -> (FeedServer, RunningFeed) {
    let server = FeedServer::new();
    let any: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let running = server.bind(any, any).await.unwrap();
    (server, running)
}

fn config_for(running: &RunningFeed) -> SyncConfig {
    SyncConfig {
        server_url: running.http_url(),
        socket_url: running.socket_url(),
        message_poll_interval: Duration::from_millis(50),
        summary_poll_interval: Duration::from_millis(50),
        socket_grace: Duration::from_millis(500),
        reconnect_base_delay: Duration::from_millis(50),
        reconnect_max_delay: Duration::from_millis(200),
        ..SyncConfig::default()
    }
}

async fn eventually<F: Fn() -> bool>(what: &str, condition: F) {
    for _ in 0..300 {
        if condition() {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

#[tokio::test]
async fn test_http_feed_round_trip() {
    let (_server, running) = start_server().await;
    let feed = HttpFeed::new(running.http_url(), Duration::from_secs(2));
    let c1 = ConversationId::from("c 1");

    let posted = feed
        .post_message(&c1, "hello there", Direction::Inbound)
        .await
        .unwrap();
    assert_eq!(posted.direction, Some(Direction::Inbound));

    let fetcher = PollingFetcher::new(std::sync::Arc::new(feed));
    let scope = ScopeKey::Conversation(c1.clone());
    let first = fetcher.fetch(&scope, None).await.unwrap();
    assert_eq!(first.envelopes.len(), 2);
    assert_eq!(first.envelopes[0].message(), Some(&posted));

    let again = fetcher.fetch(&scope, Some(first.checkpoint)).await.unwrap();
    assert!(again.envelopes.is_empty());
    assert!(again.checkpoint > first.checkpoint);
}

#[tokio::test]
async fn test_socket_rejects_unknown_path() {
    let (_server, running) = start_server().await;
    let url = format!("{}/nowhere", running.socket_url());
    assert!(tokio_tungstenite::connect_async(url.as_str()).await.is_err());
}

#[tokio::test]
async fn test_socket_pushes_only_its_conversation() {
    let (server, running) = start_server().await;
    let connector = WsConnector::new(running.socket_url());
    let mut stream = connector.open(&"c1".into()).await.unwrap();

    server.post_message(&"c2".into(), "not for you", Direction::Inbound);
    server.post_message(&"c1".into(), "for you", Direction::Inbound);

    let envelope = timeout(Duration::from_secs(2), stream.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(envelope.conversation().map(|c| c.as_str()), Some("c1"));
    assert_eq!(
        envelope.message().and_then(|m| m.content.as_deref()),
        Some("for you")
    );
}

#[tokio::test]
async fn test_session_over_socket_with_send() {
    let (server, running) = start_server().await;
    let session = SyncSession::from_config(config_for(&running)).unwrap();
    let c1 = ConversationId::from("c1");
    let subscription = session.subscribe(ScopeKey::Conversation(c1.clone()), Vec::new());

    eventually("socket open", || {
        subscription.status().transport == Some(TransportState::Open)
    })
    .await;

    server.post_message(&c1, "hi, anyone there?", Direction::Inbound);
    eventually("inbound push", || session.timeline(&c1).len() == 1).await;

    // the socket also pushes the confirmation of our own send
    session.send(&c1, "yes, how can I help?").await.unwrap();
    sleep(Duration::from_millis(200)).await;

    let timeline = session.timeline(&c1);
    assert_eq!(timeline.len(), 2);
    assert!(timeline.iter().all(|e| e.confirmed));
    assert_eq!(timeline[1].direction, Some(Direction::Outbound));
    assert!(timeline[1].local_id.is_some());
    session.shutdown();
}

#[tokio::test]
async fn test_session_recovers_after_socket_drop() {
    let (server, running) = start_server().await;
    let session = SyncSession::from_config(config_for(&running)).unwrap();
    let c1 = ConversationId::from("c1");
    let subscription = session.subscribe(ScopeKey::Conversation(c1.clone()), Vec::new());
    let mut status = subscription.watch_status();

    eventually("socket open", || {
        subscription.status().transport == Some(TransportState::Open)
    })
    .await;

    server.disconnect_sockets();
    timeout(
        Duration::from_secs(3),
        status.wait_for(|s| matches!(s.transport, Some(TransportState::Backoff { .. }))),
    )
    .await
    .unwrap()
    .unwrap();

    // published while the socket is down, caught by polling or the new socket
    server.post_message(&c1, "during the gap", Direction::Inbound);
    eventually("gap message", || session.timeline(&c1).len() == 1).await;
    eventually("socket reopened", || {
        subscription.status().transport == Some(TransportState::Open)
    })
    .await;
    session.shutdown();
}

#[tokio::test]
async fn test_polling_only_session() {
    let (server, running) = start_server().await;
    let config = SyncConfig {
        enable_socket: false,
        ..config_for(&running)
    };
    let session = SyncSession::from_config(config).unwrap();
    let c1 = ConversationId::from("c1");
    let subscription = session.subscribe(ScopeKey::Conversation(c1.clone()), Vec::new());

    server.post_message(&c1, "polled", Direction::Inbound);
    eventually("polled message", || session.timeline(&c1).len() == 1).await;
    assert_eq!(subscription.status().transport, Some(TransportState::Polling));
    assert!(subscription.is_connected());
    session.shutdown();
}
