//! Peer transport abstraction.
//!
//! One [`PeerTransport`] carries every track between the local participant
//! and one remote participant. Transport callbacks are turned into
//! [`LinkEvent`]s tagged with the link generation so that events from a
//! replaced link can be told apart from the current one.

pub mod rtc;

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use webrtc::track::track_remote::TrackRemote;

use rally_common::{IceCandidate, ParticipantId, Result, SessionDescription};

use crate::ice::IceConfig;
pub use crate::media::OutboundTracks;
use crate::media::{LocalTrack, TrackKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl LinkState {
    /// States that count as the peer having gone away.
    pub fn is_degraded(&self) -> bool {
        matches!(self, LinkState::Disconnected | LinkState::Failed)
    }
}

/// A track received from a remote peer.
#[derive(Clone)]
pub struct RemoteTrack {
    pub id: String,
    pub stream_id: String,
    pub kind: TrackKind,
    pub rtc: Option<Arc<TrackRemote>>,
}

impl fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("id", &self.id)
            .field("stream_id", &self.stream_id)
            .field("kind", &self.kind)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub enum TransportEvent {
    LocalCandidate(IceCandidate),
    RemoteTrack(RemoteTrack),
    StateChanged(LinkState),
}

#[derive(Debug, Clone)]
pub struct LinkEvent {
    pub peer: ParticipantId,
    pub generation: u64,
    pub event: TransportEvent,
}

/// Sink a transport reports its callbacks into.
#[derive(Clone)]
pub struct TransportEvents {
    peer: ParticipantId,
    generation: u64,
    tx: mpsc::UnboundedSender<LinkEvent>,
}

impl TransportEvents {
    pub fn new(peer: ParticipantId, generation: u64, tx: mpsc::UnboundedSender<LinkEvent>) -> Self {
        Self {
            peer,
            generation,
            tx,
        }
    }

    pub fn peer(&self) -> &ParticipantId {
        &self.peer
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Drops the event if the session loop is gone.
    pub fn emit(&self, event: TransportEvent) {
        let _ = self.tx.send(LinkEvent {
            peer: self.peer.clone(),
            generation: self.generation,
            event,
        });
    }
}

#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription>;

    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    /// Swaps the outbound video without renegotiating. Returns false when the
    /// link has no video sender to swap on.
    async fn replace_video_track(&self, track: Option<LocalTrack>) -> Result<bool>;

    /// Tears the transport down. Pending operations on it fail or are ignored.
    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(
        &self,
        ice: &IceConfig,
        tracks: OutboundTracks,
        events: TransportEvents,
    ) -> Result<Arc<dyn PeerTransport>>;
}
