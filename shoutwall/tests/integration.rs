//! Integration tests for the end-to-end relay pipeline.
//!
//! These tests start a real server and connect real WebSocket clients,
//! exercising handshake, history replay, ingestion, and fan-out together.

use shoutwall::{
    Country, GeoMode, Message, RelayClient, RelayEvent, RelayServer, ServerConfig,
};
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};

/// Find a free port for testing.
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Start a server with the given config on a free port, return the port.
async fn start_server(mut config: ServerConfig) -> u16 {
    let port = free_port().await;
    config.bind_addr = format!("127.0.0.1:{port}");
    let server = RelayServer::new(config).unwrap();
    tokio::spawn(async move {
        server.run().await.unwrap();
    });
    // Give the server time to bind
    tokio::time::sleep(Duration::from_millis(50)).await;
    port
}

/// Config with the rate limiter effectively off, for tests where one
/// client (one address, one identity) posts repeatedly.
fn relaxed_config() -> ServerConfig {
    ServerConfig {
        rate_ms: 0,
        ..ServerConfig::default()
    }
}

/// Connect a client and drain its `Connected` event.
async fn connect(port: u16) -> (RelayClient, mpsc::Receiver<RelayEvent>) {
    let mut client = RelayClient::new(format!("ws://127.0.0.1:{port}"));
    let mut rx = client.take_event_rx().unwrap();
    client.connect().await.unwrap();

    match timeout(Duration::from_secs(2), rx.recv()).await {
        Ok(Some(RelayEvent::Connected)) => {}
        other => panic!("expected Connected event, got {other:?}"),
    }
    (client, rx)
}

/// Wait for the next broadcast message on a client's event stream.
async fn next_message(rx: &mut mpsc::Receiver<RelayEvent>) -> Message {
    match timeout(Duration::from_secs(2), rx.recv()).await {
        Ok(Some(RelayEvent::Message(msg))) => msg,
        other => panic!("expected Message event, got {other:?}"),
    }
}

/// Assert that no message arrives within a grace window.
async fn expect_silence(rx: &mut mpsc::Receiver<RelayEvent>, window_ms: u64) {
    if let Ok(event) = timeout(Duration::from_millis(window_ms), rx.recv()).await {
        panic!("expected silence, got {event:?}");
    }
}

#[tokio::test]
async fn test_server_accepts_connections() {
    let port = start_server(relaxed_config()).await;
    let url = format!("ws://127.0.0.1:{port}");

    let result = tokio_tungstenite::connect_async(&url).await;
    assert!(result.is_ok(), "should connect to server");
}

#[tokio::test]
async fn test_post_is_broadcast_to_every_client() {
    let port = start_server(relaxed_config()).await;

    let (alice, mut alice_rx) = connect(port).await;
    let (_bob, mut bob_rx) = connect(port).await;
    let (_carol, mut carol_rx) = connect(port).await;

    alice.post("hello everyone").await.unwrap();

    // Every client — including the sender — receives exactly one copy
    for rx in [&mut alice_rx, &mut bob_rx, &mut carol_rx] {
        let msg = next_message(rx).await;
        assert_eq!(msg.id, 1);
        assert_eq!(msg.text, "hello everyone");
        assert_eq!(msg.country, None);
        expect_silence(rx, 150).await;
    }
}

#[tokio::test]
async fn test_history_replay_on_connect() {
    let port = start_server(relaxed_config()).await;

    let (alice, mut alice_rx) = connect(port).await;
    alice.post("first").await.unwrap();
    let _ = next_message(&mut alice_rx).await;
    alice.post("second").await.unwrap();
    let _ = next_message(&mut alice_rx).await;

    // A newcomer gets the backlog, oldest first, before anything live
    let (_bob, mut bob_rx) = connect(port).await;
    let replayed_one = next_message(&mut bob_rx).await;
    let replayed_two = next_message(&mut bob_rx).await;
    assert_eq!(replayed_one.id, 1);
    assert_eq!(replayed_one.text, "first");
    assert_eq!(replayed_two.id, 2);
    assert_eq!(replayed_two.text, "second");
    expect_silence(&mut bob_rx, 150).await;
}

#[tokio::test]
async fn test_history_respects_limit() {
    let config = ServerConfig {
        history_limit: 2,
        ..relaxed_config()
    };
    let port = start_server(config).await;

    let (alice, mut alice_rx) = connect(port).await;
    for text in ["one", "two", "three"] {
        alice.post(text).await.unwrap();
        let _ = next_message(&mut alice_rx).await;
    }

    let (_bob, mut bob_rx) = connect(port).await;
    assert_eq!(next_message(&mut bob_rx).await.id, 2);
    assert_eq!(next_message(&mut bob_rx).await.id, 3);
    expect_silence(&mut bob_rx, 150).await;
}

#[tokio::test]
async fn test_rate_limit_drops_burst_then_readmits() {
    let config = ServerConfig {
        rate_ms: 400,
        ..ServerConfig::default()
    };
    let port = start_server(config).await;
    let (alice, mut alice_rx) = connect(port).await;

    alice.post("one").await.unwrap();
    let first = next_message(&mut alice_rx).await;
    assert_eq!(first.id, 1);

    // Within the window: dropped silently, no id assigned, no broadcast
    alice.post("two").await.unwrap();
    expect_silence(&mut alice_rx, 250).await;

    // After the window: admitted with the next id — 2, not 3
    tokio::time::sleep(Duration::from_millis(400)).await;
    alice.post("three").await.unwrap();
    let third = next_message(&mut alice_rx).await;
    assert_eq!(third.id, 2);
    assert_eq!(third.text, "three");
}

#[tokio::test]
async fn test_whitespace_only_post_is_dropped() {
    let port = start_server(relaxed_config()).await;
    let (alice, mut alice_rx) = connect(port).await;

    alice.post("   ").await.unwrap();
    expect_silence(&mut alice_rx, 200).await;

    alice.post("  real  ").await.unwrap();
    let msg = next_message(&mut alice_rx).await;
    assert_eq!(msg.id, 1);
    assert_eq!(msg.text, "real");
}

#[tokio::test]
async fn test_overlong_post_is_truncated() {
    let config = ServerConfig {
        max_len: 10,
        ..relaxed_config()
    };
    let port = start_server(config).await;
    let (alice, mut alice_rx) = connect(port).await;

    alice.post("0123456789abcdef").await.unwrap();
    let msg = next_message(&mut alice_rx).await;
    assert_eq!(msg.text, "0123456789");
}

#[tokio::test]
async fn test_malformed_frames_are_ignored() {
    let port = start_server(relaxed_config()).await;
    let (alice, mut alice_rx) = connect(port).await;

    alice.send_raw("not json").await.unwrap();
    alice.send_raw(r#"{"type":"subscribe","text":"x"}"#).await.unwrap();
    alice.send_raw(r#"{"type":"post"}"#).await.unwrap();

    // Connection survives and the next valid post gets id 1
    alice.post("still here").await.unwrap();
    let msg = next_message(&mut alice_rx).await;
    assert_eq!(msg.id, 1);
    assert_eq!(msg.text, "still here");
    expect_silence(&mut alice_rx, 150).await;
}

#[tokio::test]
async fn test_per_sender_ordering_preserved() {
    let port = start_server(relaxed_config()).await;
    let (alice, mut alice_rx) = connect(port).await;

    alice.post("a").await.unwrap();
    alice.post("b").await.unwrap();
    alice.post("c").await.unwrap();

    let texts: Vec<String> = [
        next_message(&mut alice_rx).await,
        next_message(&mut alice_rx).await,
        next_message(&mut alice_rx).await,
    ]
    .iter()
    .map(|m| m.text.clone())
    .collect();
    assert_eq!(texts, vec!["a", "b", "c"]);
}

#[tokio::test]
async fn test_unavailable_geo_service_degrades_to_unknown() {
    let mut config = relaxed_config();
    config.geo.mode = GeoMode::Http;
    // Nothing listens on port 1; the lookup fails fast
    config.geo.url = "http://127.0.0.1:1/{ip}/json/".to_string();
    config.geo.timeout_ms = 300;
    let port = start_server(config).await;

    let (alice, mut alice_rx) = connect(port).await;
    alice.post("where am i").await.unwrap();

    // Accepted and broadcast despite the dead collaborator
    let msg = next_message(&mut alice_rx).await;
    assert_eq!(msg.text, "where am i");
    assert_eq!(msg.country, Some(Country::Unknown));
}

#[tokio::test]
async fn test_disconnect_does_not_disturb_others() {
    let port = start_server(relaxed_config()).await;

    let (alice, mut alice_rx) = connect(port).await;
    let (mut bob, _bob_rx) = connect(port).await;

    bob.disconnect().await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    alice.post("anyone there").await.unwrap();
    let msg = next_message(&mut alice_rx).await;
    assert_eq!(msg.text, "anyone there");
}

#[tokio::test]
async fn test_ids_and_timestamps_monotonic_over_session() {
    let port = start_server(relaxed_config()).await;
    let (alice, mut alice_rx) = connect(port).await;

    let mut last_id = 0;
    let mut last_ts = 0;
    for i in 0..10 {
        alice.post(format!("tick {i}")).await.unwrap();
        let msg = next_message(&mut alice_rx).await;
        assert!(msg.id > last_id);
        assert!(msg.created_at >= last_ts);
        last_id = msg.id;
        last_ts = msg.created_at;
    }
}
