//! Common error types for Rally.

use thiserror::Error;

/// Result type alias using Rally's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Local capture device could not be used.
///
/// Never fatal to a call: the session continues receive-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DeviceError {
    /// The user or platform refused access to the device
    #[error("permission denied")]
    PermissionDenied,

    /// No device of the requested kind exists
    #[error("no such device")]
    NotFound,

    /// The device exists but another consumer holds it
    #[error("device busy")]
    Busy,
}

/// Top-level error type for Rally operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Camera, microphone or screen capture unavailable
    #[error("device error: {0}")]
    Device(#[from] DeviceError),

    /// Subscribing to or talking over the broadcast transport failed
    #[error("signaling error: {0}")]
    Signaling(String),

    /// Offer/answer/candidate processing failed for one peer
    #[error("negotiation error: {0}")]
    Negotiation(String),

    /// The peer transport reported a failed or disconnected state
    #[error("transport degraded: {0}")]
    TransportDegraded(String),

    /// I/O error (file, network, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Operation requires an active call
    #[error("not joined to a room")]
    NotJoined,

    /// Operation requires a local capture stream that was never acquired
    #[error("no local media")]
    NoLocalMedia,

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a signaling error from any displayable type.
    pub fn signaling(msg: impl std::fmt::Display) -> Self {
        Self::Signaling(msg.to_string())
    }

    /// Create a negotiation error from any displayable type.
    pub fn negotiation(msg: impl std::fmt::Display) -> Self {
        Self::Negotiation(msg.to_string())
    }

    /// Create a transport degraded error from any displayable type.
    pub fn transport_degraded(msg: impl std::fmt::Display) -> Self {
        Self::TransportDegraded(msg.to_string())
    }

    /// Create a serialization error from any displayable type.
    pub fn serialization(msg: impl std::fmt::Display) -> Self {
        Self::Serialization(msg.to_string())
    }

    /// Create a config error from any displayable type.
    pub fn config(msg: impl std::fmt::Display) -> Self {
        Self::Config(msg.to_string())
    }

    /// Create an internal error from any displayable type.
    pub fn internal(msg: impl std::fmt::Display) -> Self {
        Self::Internal(msg.to_string())
    }

    /// True for errors that only affect a single peer link.
    pub fn is_peer_scoped(&self) -> bool {
        matches!(self, Self::Negotiation(_) | Self::TransportDegraded(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
