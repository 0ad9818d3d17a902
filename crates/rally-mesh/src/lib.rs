//! Rally mesh core.
//!
//! Establishes and tears down direct WebRTC links between every pair of
//! participants in a room. Peers find each other through a topic-scoped
//! broadcast+presence transport ([`realtime::Realtime`]); media never goes
//! through a server.
//!
//! Entry point is [`CallSession`]: `join` a room, toggle tracks, share the
//! screen, `leave`. Everything a session creates is owned by that session.

#![forbid(unsafe_code)]

pub mod config;
pub mod engine;
pub mod ice;
pub mod media;
pub mod negotiation;
pub mod realtime;
pub mod registry;
pub mod session;
pub mod signaling;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{CallKind, MeshConfig};
pub use ice::{IceConfig, IceServer};
pub use media::{
    LocalMedia, LocalStream, LocalTrack, MediaConstraints, MediaDevices, MediaKind,
    SyntheticDevices, TrackKind,
};
pub use negotiation::{is_initiator, NegotiationState};
pub use realtime::{memory::MemoryHub, ws::WsRealtime, Realtime};
pub use registry::{PeerSnapshot, RemoteStream};
pub use session::{CallSession, SessionEvent};
pub use transport::{rtc::RtcTransportFactory, LinkState, RemoteTrack, TransportFactory};
