//! In-process broadcast + presence hub.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

use rally_common::{Error, ParticipantId, Result};

use super::{Realtime, RealtimeEvent, RealtimeSink, Subscription};

struct Member {
    id: u64,
    identity: ParticipantId,
    tracked: bool,
    tx: mpsc::UnboundedSender<RealtimeEvent>,
}

#[derive(Default)]
struct HubInner {
    topics: Mutex<HashMap<String, Vec<Member>>>,
    next_member: AtomicU64,
    fail_subscriptions: AtomicBool,
    stall_subscriptions: AtomicBool,
}

impl HubInner {
    fn track(&self, topic: &str, member_id: u64) {
        let mut topics = self.topics.lock();
        let Some(members) = topics.get_mut(topic) else {
            return;
        };
        let Some(index) = members.iter().position(|m| m.id == member_id) else {
            return;
        };
        if members[index].tracked {
            return;
        }
        members[index].tracked = true;
        let identity = members[index].identity.clone();
        let newcomer = members[index].tx.clone();

        for member in members.iter().filter(|m| m.id != member_id) {
            let _ = member
                .tx
                .send(RealtimeEvent::PresenceJoin(identity.clone()));
            if member.tracked {
                let _ = newcomer.send(RealtimeEvent::PresenceJoin(member.identity.clone()));
            }
        }
    }

    fn broadcast(&self, topic: &str, member_id: u64, payload: serde_json::Value) -> Result<()> {
        let topics = self.topics.lock();
        let members = topics
            .get(topic)
            .filter(|m| m.iter().any(|m| m.id == member_id))
            .ok_or_else(|| Error::signaling("not subscribed"))?;
        for member in members.iter().filter(|m| m.id != member_id) {
            let _ = member.tx.send(RealtimeEvent::Broadcast(payload.clone()));
        }
        Ok(())
    }

    fn leave(&self, topic: &str, member_id: u64) {
        let mut topics = self.topics.lock();
        let Some(members) = topics.get_mut(topic) else {
            return;
        };
        let Some(index) = members.iter().position(|m| m.id == member_id) else {
            return;
        };
        let member = members.remove(index);
        if member.tracked {
            for other in members.iter() {
                let _ = other
                    .tx
                    .send(RealtimeEvent::PresenceLeave(member.identity.clone()));
            }
        }
        if members.is_empty() {
            topics.remove(topic);
        }
        debug!("{} left {}", member.identity, topic);
    }
}

/// Broadcast + presence hub shared by every session in one process.
#[derive(Clone, Default)]
pub struct MemoryHub {
    inner: Arc<HubInner>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent subscribe fail immediately.
    pub fn fail_subscriptions(&self, fail: bool) {
        self.inner.fail_subscriptions.store(fail, Ordering::Release);
    }

    /// Makes every subsequent subscribe hang until cancelled.
    pub fn stall_subscriptions(&self, stall: bool) {
        self.inner.stall_subscriptions.store(stall, Ordering::Release);
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.inner.topics.lock().get(topic).map_or(0, Vec::len)
    }
}

#[async_trait]
impl Realtime for MemoryHub {
    async fn subscribe(&self, topic: &str, identity: &ParticipantId) -> Result<Subscription> {
        if self.inner.fail_subscriptions.load(Ordering::Acquire) {
            return Err(Error::signaling(format!("subscription to {topic} refused")));
        }
        if self.inner.stall_subscriptions.load(Ordering::Acquire) {
            std::future::pending::<()>().await;
        }

        let (tx, events) = mpsc::unbounded_channel();
        let id = self.inner.next_member.fetch_add(1, Ordering::Relaxed);
        self.inner
            .topics
            .lock()
            .entry(topic.to_string())
            .or_default()
            .push(Member {
                id,
                identity: identity.clone(),
                tracked: false,
                tx,
            });
        debug!("{} subscribed to {}", identity, topic);

        Ok(Subscription {
            sink: Arc::new(MemorySink {
                hub: Arc::clone(&self.inner),
                topic: topic.to_string(),
                member_id: id,
                closed: AtomicBool::new(false),
            }),
            events,
        })
    }
}

struct MemorySink {
    hub: Arc<HubInner>,
    topic: String,
    member_id: u64,
    closed: AtomicBool,
}

impl RealtimeSink for MemorySink {
    fn broadcast(&self, payload: serde_json::Value) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::signaling("subscription closed"));
        }
        self.hub.broadcast(&self.topic, self.member_id, payload)
    }

    fn track(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::signaling("subscription closed"));
        }
        self.hub.track(&self.topic, self.member_id);
        Ok(())
    }

    fn unsubscribe(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.hub.leave(&self.topic, self.member_id);
        }
    }
}

impl Drop for MemorySink {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_presence_sync_on_track() {
        let hub = MemoryHub::new();
        let mut alice = hub.subscribe("room:r1", &"alice".into()).await.unwrap();
        alice.sink.track().unwrap();

        let mut bob = hub.subscribe("room:r1", &"bob".into()).await.unwrap();
        bob.sink.track().unwrap();

        assert_eq!(
            alice.events.recv().await.unwrap(),
            RealtimeEvent::PresenceJoin("bob".into())
        );
        assert_eq!(
            bob.events.recv().await.unwrap(),
            RealtimeEvent::PresenceJoin("alice".into())
        );
    }

    #[tokio::test]
    async fn test_broadcast_is_not_echoed() {
        let hub = MemoryHub::new();
        let mut alice = hub.subscribe("room:r1", &"alice".into()).await.unwrap();
        let mut bob = hub.subscribe("room:r1", &"bob".into()).await.unwrap();

        alice.sink.broadcast(json!({ "hello": 1 })).unwrap();
        assert_eq!(
            bob.events.recv().await.unwrap(),
            RealtimeEvent::Broadcast(json!({ "hello": 1 }))
        );
        assert!(alice.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unsubscribe_announces_leave_once() {
        let hub = MemoryHub::new();
        let mut alice = hub.subscribe("room:r1", &"alice".into()).await.unwrap();
        let bob = hub.subscribe("room:r1", &"bob".into()).await.unwrap();
        bob.sink.track().unwrap();
        assert!(matches!(
            alice.events.recv().await.unwrap(),
            RealtimeEvent::PresenceJoin(_)
        ));

        bob.sink.unsubscribe();
        bob.sink.unsubscribe();
        drop(bob);
        assert_eq!(
            alice.events.recv().await.unwrap(),
            RealtimeEvent::PresenceLeave("bob".into())
        );
        assert!(alice.events.try_recv().is_err());
        assert_eq!(hub.subscriber_count("room:r1"), 1);
    }

    #[tokio::test]
    async fn test_topics_are_isolated() {
        let hub = MemoryHub::new();
        let mut alice = hub.subscribe("room:r1", &"alice".into()).await.unwrap();
        let bob = hub.subscribe("room:r2", &"bob".into()).await.unwrap();
        bob.sink.track().unwrap();
        bob.sink.broadcast(json!("x")).unwrap();
        assert!(alice.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_failed_subscription() {
        let hub = MemoryHub::new();
        hub.fail_subscriptions(true);
        assert!(hub.subscribe("room:r1", &"alice".into()).await.is_err());
    }
}
