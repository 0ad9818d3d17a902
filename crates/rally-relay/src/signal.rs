use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    http::StatusCode,
    response::IntoResponse,
};
use futures::{stream::StreamExt, SinkExt};
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use rally_common::{ParticipantId, RelayFrame};

use crate::rooms::{encode, Outbox};
use crate::AppState;

const WS_OUTBOX_CAPACITY: usize = 128;
const MAX_TOPIC_BYTES: usize = 256;
const MAX_IDENTITY_BYTES: usize = 128;

async fn send_frame(tx: &Outbox, frame: &RelayFrame) -> bool {
    let Some(message) = encode(frame) else {
        return false;
    };
    tx.send(message).await.is_ok()
}

async fn send_error(tx: &Outbox, message: &str) {
    let _ = send_frame(
        tx,
        &RelayFrame::Error {
            message: message.into(),
        },
    )
    .await;
}

fn valid_subscription(topic: &str, identity: &ParticipantId) -> bool {
    let id = identity.as_str();
    !topic.is_empty()
        && topic.len() <= MAX_TOPIC_BYTES
        && !id.is_empty()
        && id.len() <= MAX_IDENTITY_BYTES
        && !id.chars().any(char::is_control)
}

/// Decrements the live connection count however the socket task ends.
struct ConnectionSlot(AppState);

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.0.connections.fetch_sub(1, Ordering::Relaxed);
    }
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> impl IntoResponse {
    let active = state.connections.fetch_add(1, Ordering::Relaxed);
    if active >= state.config.max_connections {
        state.connections.fetch_sub(1, Ordering::Relaxed);
        warn!("refusing {}: connection limit reached", addr);
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    let slot = ConnectionSlot(state.clone());
    let limit = state.config.max_message_bytes;

    ws.max_message_size(limit)
        .max_frame_size(limit)
        .on_upgrade(move |socket| async move {
            handle_socket(socket, state, addr).await;
            drop(slot);
        })
        .into_response()
}

async fn handle_socket(stream: WebSocket, state: AppState, addr: SocketAddr) {
    let conn = state.next_conn.fetch_add(1, Ordering::Relaxed);
    debug!("connection {} from {}", conn, addr);
    let (mut sender, mut receiver) = stream.split();
    let (tx, mut rx) = mpsc::channel::<Message>(WS_OUTBOX_CAPACITY);
    let (disconnect_tx, mut disconnect_rx) = mpsc::channel::<()>(1);

    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if sender.send(msg).await.is_err() || closing {
                break;
            }
        }
        let _ = disconnect_tx.try_send(());
    });

    let config = &state.config;
    let mut subscription: Option<(String, ParticipantId)> = None;
    let mut message_window_start = Instant::now();
    let mut message_count: u32 = 0;
    let bind_deadline = tokio::time::Instant::now() + config.bind_timeout;

    loop {
        tokio::select! {
            _ = disconnect_rx.recv() => break,
            _ = tokio::time::sleep_until(bind_deadline), if subscription.is_none() => {
                send_error(&tx, "subscribe timeout").await;
                break;
            }
            msg = receiver.next() => {
                let Some(Ok(msg)) = msg else { break };

                let now = Instant::now();
                if now.duration_since(message_window_start) >= Duration::from_secs(60) {
                    message_window_start = now;
                    message_count = 0;
                }
                message_count = message_count.saturating_add(1);
                if message_count > config.max_messages_per_minute {
                    send_error(&tx, "rate limit exceeded").await;
                    break;
                }

                let text = match msg {
                    Message::Text(text) => text,
                    Message::Binary(_) => {
                        send_error(&tx, "binary messages are not supported").await;
                        break;
                    }
                    Message::Close(_) => break,
                    Message::Ping(_) | Message::Pong(_) => continue,
                };
                if text.len() > config.max_message_bytes {
                    send_error(&tx, "message too large").await;
                    break;
                }

                let frame: RelayFrame = match serde_json::from_str(&text) {
                    Ok(frame) => frame,
                    Err(err) => {
                        warn!("invalid JSON from {}: {}", addr, err);
                        send_error(&tx, "invalid frame").await;
                        break;
                    }
                };

                if let RelayFrame::Subscribe { topic, identity } = frame {
                    if subscription.is_some() {
                        send_error(&tx, "already subscribed").await;
                        break;
                    }
                    if !valid_subscription(&topic, &identity) {
                        send_error(&tx, "invalid topic or identity").await;
                        break;
                    }
                    state.rooms.join(&topic, conn, identity.clone(), tx.clone()).await;
                    let _ = send_frame(&tx, &RelayFrame::Subscribed { topic: topic.clone() }).await;
                    info!("{} subscribed to {} from {}", identity, topic, addr);
                    subscription = Some((topic, identity));
                    continue;
                }

                let Some((topic, _)) = &subscription else {
                    send_error(&tx, "subscribe required").await;
                    break;
                };
                match frame {
                    RelayFrame::Track => state.rooms.track(topic, conn).await,
                    RelayFrame::Broadcast { payload, .. } => {
                        state.rooms.broadcast(topic, conn, payload).await;
                    }
                    RelayFrame::Unsubscribe => break,
                    _ => send_error(&tx, "unsupported client frame").await,
                }
            }
        }
    }

    if let Some((topic, identity)) = subscription {
        state.rooms.leave(&topic, conn).await;
        info!("{} left {}", identity, topic);
    }
    let _ = tx.try_send(Message::Close(None));
    drop(tx);
    let _ = writer.await;
    debug!("connection {} closed", conn);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscription_validation() {
        assert!(valid_subscription("room:r1", &"alice".into()));
        assert!(!valid_subscription("", &"alice".into()));
        assert!(!valid_subscription("room:r1", &"".into()));
        assert!(!valid_subscription("room:r1", &"al\nice".into()));
        assert!(!valid_subscription(&"x".repeat(MAX_TOPIC_BYTES + 1), &"alice".into()));
    }
}
