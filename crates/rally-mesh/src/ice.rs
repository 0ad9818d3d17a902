//! Relay/reflection servers used by every peer link.

use rally_common::{Error, Result};
use serde::{Deserialize, Serialize};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;

pub const DEFAULT_STUN_SERVERS: &[&str] = &[
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

const SCHEMES: &[&str] = &["stun:", "stuns:", "turn:", "turns:"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![normalize_url(&url.into())],
            username: None,
            credential: None,
        }
    }

    pub fn turn(
        url: impl Into<String>,
        username: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        Self {
            urls: vec![normalize_url(&url.into())],
            username: Some(username.into()),
            credential: Some(credential.into()),
        }
    }

    fn is_turn(&self) -> bool {
        self.urls
            .iter()
            .any(|u| u.starts_with("turn:") || u.starts_with("turns:"))
    }
}

/// Static ICE server list shared by all links of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceConfig {
    pub servers: Vec<IceServer>,
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            servers: DEFAULT_STUN_SERVERS
                .iter()
                .map(|url| IceServer::stun(*url))
                .collect(),
        }
    }
}

/// Adds `stun:` to bare `host:port` entries.
fn normalize_url(url: &str) -> String {
    let url = url.trim();
    if url.is_empty() || url.contains("://") || SCHEMES.iter().any(|s| url.starts_with(s)) {
        url.to_string()
    } else {
        format!("stun:{url}")
    }
}

impl IceConfig {
    /// No servers at all; host candidates only. Used on loopback.
    pub fn host_only() -> Self {
        Self {
            servers: Vec::new(),
        }
    }

    /// Reads `RALLY_ICE_SERVERS` (comma separated), `RALLY_TURN_USERNAME` and
    /// `RALLY_TURN_CREDENTIAL`. Falls back to the defaults when unset.
    pub fn from_env() -> Result<Self> {
        let raw = match std::env::var("RALLY_ICE_SERVERS") {
            Ok(raw) if !raw.trim().is_empty() => raw,
            _ => return Ok(Self::default()),
        };
        let username = std::env::var("RALLY_TURN_USERNAME").ok();
        let credential = std::env::var("RALLY_TURN_CREDENTIAL").ok();
        Self::parse(&raw, username, credential)
    }

    pub fn parse(
        raw: &str,
        username: Option<String>,
        credential: Option<String>,
    ) -> Result<Self> {
        let servers = raw
            .split(',')
            .map(|url| {
                let url = normalize_url(url);
                let is_turn = url.starts_with("turn:") || url.starts_with("turns:");
                IceServer {
                    urls: vec![url],
                    username: if is_turn { username.clone() } else { None },
                    credential: if is_turn { credential.clone() } else { None },
                }
            })
            .collect();
        let config = Self { servers };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        for server in &self.servers {
            if server.urls.is_empty() {
                return Err(Error::config("ice server without urls"));
            }
            for url in &server.urls {
                if url.is_empty() {
                    return Err(Error::config("empty ice server url"));
                }
                if !SCHEMES.iter().any(|s| url.starts_with(s)) {
                    return Err(Error::config(format!("unsupported ice url scheme: {url}")));
                }
            }
            if server.is_turn() && (server.username.is_none() || server.credential.is_none()) {
                return Err(Error::config(format!(
                    "turn server {} requires username and credential",
                    server.urls.join(",")
                )));
            }
        }
        Ok(())
    }

    pub fn to_rtc_configuration(&self) -> RTCConfiguration {
        RTCConfiguration {
            ice_servers: self
                .servers
                .iter()
                .map(|s| RTCIceServer {
                    urls: s.urls.clone(),
                    username: s.username.clone().unwrap_or_default(),
                    credential: s.credential.clone().unwrap_or_default(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }
    }
}
