//! Session configuration.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use rally_common::{env_parse, Error, Result};

use crate::ice::IceConfig;
use crate::media::MediaConstraints;

pub const DEFAULT_SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Flavour of call. The flavours share one engine and differ only in topic
/// naming and in which local media they capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CallKind {
    /// Generic room call: camera and microphone.
    #[default]
    Room,
    /// Channel-scoped voice: microphone only.
    VoiceChannel,
    /// Video-only call.
    Video,
}

impl CallKind {
    pub fn topic(&self, room_id: &str) -> String {
        match self {
            CallKind::Room => format!("room:{room_id}"),
            CallKind::VoiceChannel => format!("voice:{room_id}"),
            CallKind::Video => format!("video:{room_id}"),
        }
    }

    pub fn constraints(&self) -> MediaConstraints {
        match self {
            CallKind::Room => MediaConstraints::AUDIO_VIDEO,
            CallKind::VoiceChannel => MediaConstraints::AUDIO_ONLY,
            CallKind::Video => MediaConstraints::VIDEO_ONLY,
        }
    }
}

impl fmt::Display for CallKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CallKind::Room => "room",
            CallKind::VoiceChannel => "voice",
            CallKind::Video => "video",
        })
    }
}

impl FromStr for CallKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "room" => Ok(CallKind::Room),
            "voice" | "voice-channel" => Ok(CallKind::VoiceChannel),
            "video" => Ok(CallKind::Video),
            other => Err(Error::config(format!("unknown call kind: {other}"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MeshConfig {
    pub ice: IceConfig,
    /// Upper bound on waiting for the broadcast subscription to confirm.
    pub subscribe_timeout: Duration,
    pub kind: CallKind,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            ice: IceConfig::default(),
            subscribe_timeout: DEFAULT_SUBSCRIBE_TIMEOUT,
            kind: CallKind::default(),
        }
    }
}

impl MeshConfig {
    pub fn from_env() -> Result<Self> {
        let secs = env_parse(
            "RALLY_SUBSCRIBE_TIMEOUT_SECS",
            DEFAULT_SUBSCRIBE_TIMEOUT.as_secs(),
        );
        if secs == 0 {
            return Err(Error::config("RALLY_SUBSCRIBE_TIMEOUT_SECS must be > 0"));
        }
        Ok(Self {
            ice: IceConfig::from_env()?,
            subscribe_timeout: Duration::from_secs(secs),
            kind: CallKind::default(),
        })
    }

    pub fn with_kind(mut self, kind: CallKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_ice(mut self, ice: IceConfig) -> Self {
        self.ice = ice;
        self
    }

    pub fn with_subscribe_timeout(mut self, timeout: Duration) -> Self {
        self.subscribe_timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topics_per_kind() {
        assert_eq!(CallKind::Room.topic("r1"), "room:r1");
        assert_eq!(CallKind::VoiceChannel.topic("general"), "voice:general");
        assert_eq!(CallKind::Video.topic("r1"), "video:r1");
    }

    #[test]
    fn test_constraints_per_kind() {
        assert_eq!(CallKind::VoiceChannel.constraints(), MediaConstraints::AUDIO_ONLY);
        assert_eq!(CallKind::Video.constraints(), MediaConstraints::VIDEO_ONLY);
    }

    #[test]
    fn test_kind_parse() {
        assert_eq!("Voice".parse::<CallKind>().unwrap(), CallKind::VoiceChannel);
        assert!("lecture".parse::<CallKind>().is_err());
        assert_eq!(CallKind::Video.to_string(), "video");
    }
}
