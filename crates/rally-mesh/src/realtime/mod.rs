//! Topic-scoped broadcast + presence transport consumed by the signaling
//! adapter.
//!
//! Delivery is best-effort to whoever is subscribed at the time; nothing is
//! queued for late subscribers.

pub mod memory;
pub mod ws;

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

use rally_common::{ParticipantId, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum RealtimeEvent {
    Broadcast(serde_json::Value),
    PresenceJoin(ParticipantId),
    PresenceLeave(ParticipantId),
}

/// Outbound half of a confirmed subscription.
pub trait RealtimeSink: Send + Sync {
    /// Publishes to every other subscriber of the topic.
    fn broadcast(&self, payload: serde_json::Value) -> Result<()>;

    /// Announces this subscriber's presence.
    fn track(&self) -> Result<()>;

    /// Leaves the topic. Idempotent.
    fn unsubscribe(&self);
}

pub struct Subscription {
    pub sink: Arc<dyn RealtimeSink>,
    pub events: mpsc::UnboundedReceiver<RealtimeEvent>,
}

#[async_trait]
pub trait Realtime: Send + Sync {
    /// Resolves once the subscription is live.
    async fn subscribe(&self, topic: &str, identity: &ParticipantId) -> Result<Subscription>;
}
