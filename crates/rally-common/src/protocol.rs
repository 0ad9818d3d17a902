use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable per-user identity used as the mesh key.
///
/// Identities are totally ordered by their byte-wise string order; the
/// order decides which side of a pair issues the offer.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh identity for callers that have no account id to offer.
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ParticipantId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ParticipantId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// Session description in the browser `RTCSessionDescriptionInit` shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate in the browser `RTCIceCandidateInit` shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default)]
    pub sdp_m_line_index: Option<u16>,
    #[serde(default)]
    pub username_fragment: Option<String>,
}

/// Signaling message exchanged over the room broadcast topic.
///
/// `to` may be absent for messages meant for everyone in the topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalMessage {
    Offer {
        from: ParticipantId,
        #[serde(default)]
        to: Option<ParticipantId>,
        data: SessionDescription,
    },
    Answer {
        from: ParticipantId,
        #[serde(default)]
        to: Option<ParticipantId>,
        data: SessionDescription,
    },
    IceCandidate {
        from: ParticipantId,
        #[serde(default)]
        to: Option<ParticipantId>,
        data: IceCandidate,
    },
}

impl SignalMessage {
    pub fn sender(&self) -> &ParticipantId {
        match self {
            Self::Offer { from, .. } | Self::Answer { from, .. } | Self::IceCandidate { from, .. } => {
                from
            }
        }
    }

    pub fn recipient(&self) -> Option<&ParticipantId> {
        match self {
            Self::Offer { to, .. } | Self::Answer { to, .. } | Self::IceCandidate { to, .. } => {
                to.as_ref()
            }
        }
    }

    /// Short label for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::IceCandidate { .. } => "ice-candidate",
        }
    }

    /// False for echoes of our own messages and for messages addressed to
    /// somebody else.
    pub fn is_for(&self, me: &ParticipantId) -> bool {
        if self.sender() == me {
            return false;
        }
        match self.recipient() {
            Some(to) => to == me,
            None => true,
        }
    }
}

/// Frames spoken between a client and the broadcast+presence relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum RelayFrame {
    /// Client joins a topic under the given identity.
    Subscribe {
        topic: String,
        identity: ParticipantId,
    },
    /// Relay confirms the subscription is live.
    Subscribed { topic: String },
    /// Client announces its presence to the topic.
    Track,
    /// Client leaves the topic.
    Unsubscribe,
    /// Payload fanned out to every other subscriber.
    Broadcast {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<ParticipantId>,
        payload: serde_json::Value,
    },
    PresenceJoin { identity: ParticipantId },
    PresenceLeave { identity: ParticipantId },
    Error { message: String },
}
