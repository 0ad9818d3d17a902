//! Signaling channel adapter.
//!
//! Wraps a [`Realtime`] subscription for one room topic. Inbound broadcasts
//! are decoded into [`SignalMessage`]s and filtered: echoes of our own
//! messages and messages addressed to somebody else never get past here.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

use rally_common::{Error, ParticipantId, Result, SignalMessage};

use crate::realtime::{Realtime, RealtimeEvent, RealtimeSink};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Signal(SignalMessage),
    Joined(ParticipantId),
    Left(ParticipantId),
}

pub struct SignalingChannel {
    identity: ParticipantId,
    topic: String,
    sink: Mutex<Option<Arc<dyn RealtimeSink>>>,
}

impl SignalingChannel {
    pub fn new(identity: ParticipantId, topic: impl Into<String>) -> Self {
        Self {
            identity,
            topic: topic.into(),
            sink: Mutex::new(None),
        }
    }

    pub fn identity(&self) -> &ParticipantId {
        &self.identity
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn is_connected(&self) -> bool {
        self.sink.lock().is_some()
    }

    /// Subscribes to the topic and, once the subscription is confirmed,
    /// announces presence.
    pub async fn connect(&self, realtime: &dyn Realtime, timeout: Duration) -> Result<SignalingEvents> {
        if self.is_connected() {
            return Err(Error::signaling(format!("already connected to {}", self.topic)));
        }

        let subscription = tokio::time::timeout(timeout, realtime.subscribe(&self.topic, &self.identity))
            .await
            .map_err(|_| {
                Error::signaling(format!(
                    "subscription to {} timed out after {:?}",
                    self.topic, timeout
                ))
            })??;

        if let Err(e) = subscription.sink.track() {
            subscription.sink.unsubscribe();
            return Err(e);
        }
        *self.sink.lock() = Some(subscription.sink);
        info!("{} joined {}", self.identity, self.topic);

        Ok(SignalingEvents {
            identity: self.identity.clone(),
            events: subscription.events,
        })
    }

    /// Best-effort, at-most-once publish.
    pub fn send(&self, message: &SignalMessage) -> Result<()> {
        let sink = self
            .sink
            .lock()
            .clone()
            .ok_or_else(|| Error::signaling("signaling channel not connected"))?;
        trace!(
            "sending {} to {:?}",
            message.kind(),
            message.recipient().map(ParticipantId::as_str)
        );
        sink.broadcast(serde_json::to_value(message)?)
    }

    /// Unsubscribes. Safe to call at any time, any number of times.
    pub fn disconnect(&self) {
        let sink = self.sink.lock().take();
        if let Some(sink) = sink {
            sink.unsubscribe();
            info!("{} left {}", self.identity, self.topic);
        }
    }
}

impl Drop for SignalingChannel {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Inbound half of a connected channel.
pub struct SignalingEvents {
    identity: ParticipantId,
    events: mpsc::UnboundedReceiver<RealtimeEvent>,
}

impl SignalingEvents {
    /// Next event meant for us. `None` once the subscription is gone.
    pub async fn recv(&mut self) -> Option<ChannelEvent> {
        loop {
            match self.events.recv().await? {
                RealtimeEvent::Broadcast(payload) => {
                    match serde_json::from_value::<SignalMessage>(payload) {
                        Ok(message) if message.is_for(&self.identity) => {
                            return Some(ChannelEvent::Signal(message))
                        }
                        Ok(message) => trace!(
                            "dropping {} from {} not meant for us",
                            message.kind(),
                            message.sender()
                        ),
                        Err(e) => debug!("ignoring non-signaling broadcast: {}", e),
                    }
                }
                RealtimeEvent::PresenceJoin(peer) if peer != self.identity => {
                    return Some(ChannelEvent::Joined(peer))
                }
                RealtimeEvent::PresenceLeave(peer) if peer != self.identity => {
                    return Some(ChannelEvent::Left(peer))
                }
                _ => {}
            }
        }
    }
}
