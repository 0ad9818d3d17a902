//! Per-topic membership and fan-out.

use axum::extract::ws::Message;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};

use rally_common::{ParticipantId, RelayFrame};

/// Outbox of one WebSocket connection.
pub type Outbox = mpsc::Sender<Message>;

struct Member {
    conn: u64,
    identity: ParticipantId,
    tracked: bool,
    outbox: Outbox,
}

pub(crate) fn encode(frame: &RelayFrame) -> Option<Message> {
    serde_json::to_string(frame).ok().map(Message::Text)
}

/// Queues a frame without waiting. A full outbox drops the frame.
pub(crate) fn deliver(outbox: &Outbox, frame: &RelayFrame) -> bool {
    let Some(message) = encode(frame) else {
        return false;
    };
    outbox.try_send(message).is_ok()
}

#[derive(Clone, Default)]
pub struct Rooms {
    topics: Arc<RwLock<HashMap<String, Vec<Member>>>>,
}

impl Rooms {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn join(&self, topic: &str, conn: u64, identity: ParticipantId, outbox: Outbox) {
        self.topics
            .write()
            .await
            .entry(topic.to_string())
            .or_default()
            .push(Member {
                conn,
                identity,
                tracked: false,
                outbox,
            });
    }

    /// Announces `conn` to the topic and replays everyone already present to
    /// it. Tracking twice announces once.
    pub async fn track(&self, topic: &str, conn: u64) {
        let mut topics = self.topics.write().await;
        let Some(members) = topics.get_mut(topic) else {
            return;
        };
        let Some(member) = members.iter_mut().find(|m| m.conn == conn) else {
            return;
        };
        if member.tracked {
            return;
        }
        member.tracked = true;
        let identity = member.identity.clone();
        let newcomer = member.outbox.clone();

        let joined = RelayFrame::PresenceJoin {
            identity: identity.clone(),
        };
        for other in members.iter().filter(|m| m.conn != conn) {
            if !deliver(&other.outbox, &joined) {
                warn!("dropped presence of {} for {}", identity, other.identity);
            }
            if other.tracked {
                deliver(
                    &newcomer,
                    &RelayFrame::PresenceJoin {
                        identity: other.identity.clone(),
                    },
                );
            }
        }
        debug!("{} tracked in {}", identity, topic);
    }

    /// Fans `payload` out to every other member. Returns how many outboxes
    /// took it.
    pub async fn broadcast(&self, topic: &str, conn: u64, payload: serde_json::Value) -> usize {
        let topics = self.topics.read().await;
        let Some(members) = topics.get(topic) else {
            return 0;
        };
        let Some(sender) = members.iter().find(|m| m.conn == conn) else {
            return 0;
        };
        let frame = RelayFrame::Broadcast {
            from: Some(sender.identity.clone()),
            payload,
        };
        let Some(message) = encode(&frame) else {
            return 0;
        };

        let mut delivered = 0;
        for other in members.iter().filter(|m| m.conn != conn) {
            if other.outbox.try_send(message.clone()).is_ok() {
                delivered += 1;
            } else {
                warn!("outbox full for {} in {}; dropping broadcast", other.identity, topic);
            }
        }
        delivered
    }

    /// Removes `conn`, announcing the departure if it had been tracked.
    pub async fn leave(&self, topic: &str, conn: u64) {
        let mut topics = self.topics.write().await;
        let Some(members) = topics.get_mut(topic) else {
            return;
        };
        let Some(index) = members.iter().position(|m| m.conn == conn) else {
            return;
        };
        let member = members.remove(index);
        if member.tracked {
            let left = RelayFrame::PresenceLeave {
                identity: member.identity.clone(),
            };
            for other in members.iter() {
                deliver(&other.outbox, &left);
            }
        }
        if members.is_empty() {
            topics.remove(topic);
        }
        debug!("{} left {}", member.identity, topic);
    }

    pub async fn topic_count(&self) -> usize {
        self.topics.read().await.len()
    }

    pub async fn subscriber_count(&self) -> usize {
        self.topics.read().await.values().map(Vec::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(message: Message) -> RelayFrame {
        match message {
            Message::Text(text) => serde_json::from_str(&text).unwrap(),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_track_syncs_presence_both_ways() {
        let rooms = Rooms::new();
        let (a_tx, mut a_rx) = mpsc::channel(8);
        let (b_tx, mut b_rx) = mpsc::channel(8);
        rooms.join("room:r1", 1, "alice".into(), a_tx).await;
        rooms.track("room:r1", 1).await;
        rooms.join("room:r1", 2, "bob".into(), b_tx).await;
        rooms.track("room:r1", 2).await;
        rooms.track("room:r1", 2).await;

        assert_eq!(
            frame(a_rx.try_recv().unwrap()),
            RelayFrame::PresenceJoin {
                identity: "bob".into()
            }
        );
        assert!(a_rx.try_recv().is_err());
        assert_eq!(
            frame(b_rx.try_recv().unwrap()),
            RelayFrame::PresenceJoin {
                identity: "alice".into()
            }
        );
    }

    #[tokio::test]
    async fn test_broadcast_skips_sender() {
        let rooms = Rooms::new();
        let (a_tx, mut a_rx) = mpsc::channel(8);
        let (b_tx, mut b_rx) = mpsc::channel(8);
        rooms.join("room:r1", 1, "alice".into(), a_tx).await;
        rooms.join("room:r1", 2, "bob".into(), b_tx).await;

        let payload = serde_json::json!({"hello": "world"});
        assert_eq!(rooms.broadcast("room:r1", 1, payload.clone()).await, 1);
        assert!(a_rx.try_recv().is_err());
        assert_eq!(
            frame(b_rx.try_recv().unwrap()),
            RelayFrame::Broadcast {
                from: Some("alice".into()),
                payload
            }
        );
    }

    #[tokio::test]
    async fn test_untracked_leave_is_silent() {
        let rooms = Rooms::new();
        let (a_tx, mut a_rx) = mpsc::channel(8);
        let (b_tx, _b_rx) = mpsc::channel(8);
        rooms.join("room:r1", 1, "alice".into(), a_tx).await;
        rooms.join("room:r1", 2, "lurker".into(), b_tx).await;

        rooms.leave("room:r1", 2).await;
        assert!(a_rx.try_recv().is_err());
        assert_eq!(rooms.subscriber_count().await, 1);

        rooms.leave("room:r1", 1).await;
        assert_eq!(rooms.topic_count().await, 0);
    }
}
