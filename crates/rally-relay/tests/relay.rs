//! Integration tests for the signaling relay
//!
//! Tests the following:
//! - Subscribe handshake and presence sync between members
//! - Broadcast fan-out without echo
//! - Presence leave on disconnect
//! - Subscribe timeout, rate limit and protocol errors
//! - The mesh crate's WebSocket client against a live relay

use axum::body::Body;
use axum::http::{Request, StatusCode};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tower::ServiceExt;

use rally_common::RelayFrame;
use rally_mesh::realtime::{Realtime, RealtimeEvent};
use rally_mesh::WsRealtime;
use rally_relay::{router, AppState, RelayConfig};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WAIT: Duration = Duration::from_secs(5);

async fn spawn_relay(config: RelayConfig) -> String {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind relay");
    let addr = listener.local_addr().expect("Failed to read bound address");
    let app = router(AppState::new(config)).into_make_service_with_connect_info::<SocketAddr>();
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("relay crashed");
    });
    format!("ws://{addr}/ws")
}

async fn connect(url: &str) -> Client {
    let (client, _) = connect_async(url).await.expect("Failed to connect");
    client
}

async fn send(client: &mut Client, frame: RelayFrame) {
    let text = serde_json::to_string(&frame).unwrap();
    client.send(Message::Text(text)).await.unwrap();
}

/// Next relay frame, or `None` once the server closed the socket.
async fn recv(client: &mut Client) -> Option<RelayFrame> {
    loop {
        let next = tokio::time::timeout(WAIT, client.next())
            .await
            .expect("timed out waiting for relay frame");
        match next {
            Some(Ok(Message::Text(text))) => return Some(serde_json::from_str(&text).unwrap()),
            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return None,
            Some(Ok(_)) => continue,
        }
    }
}

async fn member(url: &str, topic: &str, identity: &str) -> Client {
    let mut client = connect(url).await;
    send(
        &mut client,
        RelayFrame::Subscribe {
            topic: topic.into(),
            identity: identity.into(),
        },
    )
    .await;
    assert_eq!(
        recv(&mut client).await,
        Some(RelayFrame::Subscribed {
            topic: topic.into()
        })
    );
    send(&mut client, RelayFrame::Track).await;
    client
}

#[tokio::test]
async fn test_presence_sync_and_broadcast() {
    let url = spawn_relay(RelayConfig::default()).await;
    let mut alice = member(&url, "room:r1", "alice").await;
    let mut bob = member(&url, "room:r1", "bob").await;

    assert_eq!(
        recv(&mut alice).await,
        Some(RelayFrame::PresenceJoin {
            identity: "bob".into()
        })
    );
    assert_eq!(
        recv(&mut bob).await,
        Some(RelayFrame::PresenceJoin {
            identity: "alice".into()
        })
    );

    send(
        &mut alice,
        RelayFrame::Broadcast {
            from: None,
            payload: json!({"type": "hello"}),
        },
    )
    .await;
    assert_eq!(
        recv(&mut bob).await,
        Some(RelayFrame::Broadcast {
            from: Some("alice".into()),
            payload: json!({"type": "hello"}),
        })
    );

    bob.close(None).await.unwrap();
    // The next thing alice sees is bob leaving, not an echo of her broadcast.
    assert_eq!(
        recv(&mut alice).await,
        Some(RelayFrame::PresenceLeave {
            identity: "bob".into()
        })
    );
}

#[tokio::test]
async fn test_topics_are_isolated() {
    let url = spawn_relay(RelayConfig::default()).await;
    let mut alice = member(&url, "room:r1", "alice").await;
    let mut carol = member(&url, "room:r2", "carol").await;
    let mut bob = member(&url, "room:r1", "bob").await;

    assert_eq!(
        recv(&mut alice).await,
        Some(RelayFrame::PresenceJoin {
            identity: "bob".into()
        })
    );
    send(
        &mut carol,
        RelayFrame::Broadcast {
            from: None,
            payload: json!("r2 only"),
        },
    )
    .await;
    send(
        &mut bob,
        RelayFrame::Broadcast {
            from: None,
            payload: json!("r1"),
        },
    )
    .await;
    assert_eq!(
        recv(&mut alice).await,
        Some(RelayFrame::Broadcast {
            from: Some("bob".into()),
            payload: json!("r1"),
        })
    );
}

#[tokio::test]
async fn test_frames_before_subscribe_are_rejected() {
    let url = spawn_relay(RelayConfig::default()).await;
    let mut client = connect(&url).await;
    send(&mut client, RelayFrame::Track).await;
    assert_eq!(
        recv(&mut client).await,
        Some(RelayFrame::Error {
            message: "subscribe required".into()
        })
    );
    assert_eq!(recv(&mut client).await, None);
}

#[tokio::test]
async fn test_subscribe_timeout_closes_connection() {
    let url = spawn_relay(RelayConfig {
        bind_timeout: Duration::from_millis(100),
        ..RelayConfig::default()
    })
    .await;
    let mut client = connect(&url).await;
    assert_eq!(
        recv(&mut client).await,
        Some(RelayFrame::Error {
            message: "subscribe timeout".into()
        })
    );
    assert_eq!(recv(&mut client).await, None);
}

#[tokio::test]
async fn test_rate_limit_closes_connection() {
    let url = spawn_relay(RelayConfig {
        max_messages_per_minute: 3,
        ..RelayConfig::default()
    })
    .await;
    let mut client = member(&url, "room:r1", "alice").await;
    send(&mut client, RelayFrame::Track).await;
    send(&mut client, RelayFrame::Track).await;
    assert_eq!(
        recv(&mut client).await,
        Some(RelayFrame::Error {
            message: "rate limit exceeded".into()
        })
    );
}

#[tokio::test]
async fn test_invalid_json_is_rejected() {
    let url = spawn_relay(RelayConfig::default()).await;
    let mut client = connect(&url).await;
    client
        .send(Message::Text("{not json".into()))
        .await
        .unwrap();
    assert_eq!(
        recv(&mut client).await,
        Some(RelayFrame::Error {
            message: "invalid frame".into()
        })
    );
}

#[tokio::test]
async fn test_health_reports_counts() {
    let state = AppState::new(RelayConfig::default());
    let app = router(state);
    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), 4096).await.unwrap();
    let metrics: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(metrics["topics"], 0);
    assert_eq!(metrics["subscribers"], 0);
    assert_eq!(metrics["active_ws_connections"], 0);
}

#[tokio::test]
async fn test_ws_realtime_client_round_trip() {
    let url = spawn_relay(RelayConfig::default()).await;
    let realtime = WsRealtime::new(url);

    let mut alice = realtime
        .subscribe("room:r1", &"alice".into())
        .await
        .expect("alice subscribe");
    alice.sink.track().unwrap();
    let mut bob = realtime
        .subscribe("room:r1", &"bob".into())
        .await
        .expect("bob subscribe");
    bob.sink.track().unwrap();

    let joined = tokio::time::timeout(WAIT, alice.events.recv()).await.unwrap();
    assert_eq!(joined, Some(RealtimeEvent::PresenceJoin("bob".into())));
    let replayed = tokio::time::timeout(WAIT, bob.events.recv()).await.unwrap();
    assert_eq!(replayed, Some(RealtimeEvent::PresenceJoin("alice".into())));

    bob.sink.broadcast(json!({"n": 1})).unwrap();
    let got = tokio::time::timeout(WAIT, alice.events.recv()).await.unwrap();
    assert_eq!(got, Some(RealtimeEvent::Broadcast(json!({"n": 1}))));

    bob.sink.unsubscribe();
    let left = tokio::time::timeout(WAIT, alice.events.recv()).await.unwrap();
    assert_eq!(left, Some(RealtimeEvent::PresenceLeave("bob".into())));
}
