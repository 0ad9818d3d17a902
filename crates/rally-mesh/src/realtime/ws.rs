//! WebSocket client for the `rally-relay` broadcast + presence server.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message as WsMessage};
use tracing::{debug, error, info, warn};

use rally_common::{Error, ParticipantId, RelayFrame, Result};

use super::{Realtime, RealtimeEvent, RealtimeSink, Subscription};

#[derive(Debug, Clone)]
pub struct WsRealtime {
    url: String,
}

impl WsRealtime {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

fn encode(frame: &RelayFrame) -> Result<WsMessage> {
    Ok(WsMessage::Text(serde_json::to_string(frame)?))
}

fn relay_event(frame: RelayFrame) -> Option<RealtimeEvent> {
    match frame {
        RelayFrame::Broadcast { payload, .. } => Some(RealtimeEvent::Broadcast(payload)),
        RelayFrame::PresenceJoin { identity } => Some(RealtimeEvent::PresenceJoin(identity)),
        RelayFrame::PresenceLeave { identity } => Some(RealtimeEvent::PresenceLeave(identity)),
        RelayFrame::Error { message } => {
            warn!("relay error: {}", message);
            None
        }
        other => {
            debug!("ignoring relay frame {:?}", other);
            None
        }
    }
}

#[async_trait]
impl Realtime for WsRealtime {
    async fn subscribe(&self, topic: &str, identity: &ParticipantId) -> Result<Subscription> {
        let (ws_stream, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| Error::signaling(format!("failed to connect to {}: {e}", self.url)))?;
        let (mut write, mut read) = ws_stream.split();

        let subscribe = RelayFrame::Subscribe {
            topic: topic.to_string(),
            identity: identity.clone(),
        };
        write
            .send(encode(&subscribe)?)
            .await
            .map_err(Error::signaling)?;

        // Wait for the relay to confirm before anything else is sent.
        loop {
            match read.next().await {
                Some(Ok(WsMessage::Text(text))) => match serde_json::from_str::<RelayFrame>(&text)? {
                    RelayFrame::Subscribed { topic: confirmed } if confirmed == topic => break,
                    RelayFrame::Error { message } => return Err(Error::signaling(message)),
                    other => debug!("ignoring frame before subscription: {:?}", other),
                },
                Some(Ok(WsMessage::Close(_))) | None => {
                    return Err(Error::signaling("relay closed before subscription"))
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(Error::signaling(e)),
            }
        }
        info!("subscribed to {} at {}", topic, self.url);

        let (frame_tx, mut frame_rx) = mpsc::unbounded_channel::<RelayFrame>();
        tokio::spawn(async move {
            while let Some(frame) = frame_rx.recv().await {
                let leaving = matches!(frame, RelayFrame::Unsubscribe);
                let message = match encode(&frame) {
                    Ok(message) => message,
                    Err(e) => {
                        warn!("failed to encode relay frame: {}", e);
                        continue;
                    }
                };
                if let Err(e) = write.send(message).await {
                    error!("failed to send relay frame: {}", e);
                    break;
                }
                if leaving {
                    let _ = write.send(WsMessage::Close(None)).await;
                    break;
                }
            }
        });

        let (event_tx, events) = mpsc::unbounded_channel();
        let reader = tokio::spawn(async move {
            while let Some(message) = read.next().await {
                match message {
                    Ok(WsMessage::Text(text)) => {
                        let frame: RelayFrame = match serde_json::from_str(&text) {
                            Ok(frame) => frame,
                            Err(e) => {
                                warn!("failed to parse relay frame: {}", e);
                                continue;
                            }
                        };
                        if let Some(event) = relay_event(frame) {
                            if event_tx.send(event).is_err() {
                                break;
                            }
                        }
                    }
                    Ok(WsMessage::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        error!("relay websocket error: {}", e);
                        break;
                    }
                }
            }
            debug!("relay reader finished");
        });

        Ok(Subscription {
            sink: Arc::new(WsSink {
                frames: frame_tx,
                closed: AtomicBool::new(false),
                reader,
            }),
            events,
        })
    }
}

struct WsSink {
    frames: mpsc::UnboundedSender<RelayFrame>,
    closed: AtomicBool,
    reader: JoinHandle<()>,
}

impl WsSink {
    fn send(&self, frame: RelayFrame) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::signaling("subscription closed"));
        }
        self.frames
            .send(frame)
            .map_err(|_| Error::signaling("relay connection closed"))
    }
}

impl RealtimeSink for WsSink {
    fn broadcast(&self, payload: serde_json::Value) -> Result<()> {
        self.send(RelayFrame::Broadcast {
            from: None,
            payload,
        })
    }

    fn track(&self) -> Result<()> {
        self.send(RelayFrame::Track)
    }

    fn unsubscribe(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        // The writer closes the socket after flushing this.
        let _ = self.frames.send(RelayFrame::Unsubscribe);
        self.reader.abort();
    }
}

impl Drop for WsSink {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relay_frames_map_to_events() {
        assert_eq!(
            relay_event(RelayFrame::PresenceLeave {
                identity: "bob".into()
            }),
            Some(RealtimeEvent::PresenceLeave("bob".into()))
        );
        assert_eq!(
            relay_event(RelayFrame::Broadcast {
                from: Some("bob".into()),
                payload: serde_json::json!({ "a": 1 }),
            }),
            Some(RealtimeEvent::Broadcast(serde_json::json!({ "a": 1 })))
        );
        assert_eq!(relay_event(RelayFrame::Track), None);
    }

    #[tokio::test]
    async fn test_unreachable_relay_is_signaling_error() {
        let realtime = WsRealtime::new("ws://127.0.0.1:1/ws");
        let err = realtime
            .subscribe("room:r1", &"alice".into())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::Signaling(_)));
    }
}
