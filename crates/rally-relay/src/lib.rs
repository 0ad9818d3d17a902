//! Rally signaling relay.
//!
//! A WebSocket server giving each topic a broadcast channel plus presence.
//! It never looks inside payloads; peers negotiate their links over it and
//! then talk directly.

#![forbid(unsafe_code)]

pub mod rooms;
pub mod signal;

use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;

pub use rooms::Rooms;

pub const DEFAULT_MAX_CONNECTIONS: usize = 4096;
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 64 * 1024;
pub const DEFAULT_MAX_MESSAGES_PER_MINUTE: u32 = 600;
pub const DEFAULT_BIND_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub max_connections: usize,
    pub max_message_bytes: usize,
    pub max_messages_per_minute: u32,
    /// How long a fresh connection may stay without subscribing.
    pub bind_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_connections: DEFAULT_MAX_CONNECTIONS,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            max_messages_per_minute: DEFAULT_MAX_MESSAGES_PER_MINUTE,
            bind_timeout: DEFAULT_BIND_TIMEOUT,
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub rooms: Rooms,
    pub config: Arc<RelayConfig>,
    connections: Arc<AtomicUsize>,
    next_conn: Arc<AtomicU64>,
}

impl AppState {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            rooms: Rooms::new(),
            config: Arc::new(config),
            connections: Arc::new(AtomicUsize::new(0)),
            next_conn: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn active_connections(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Serialize)]
struct RuntimeMetrics {
    active_ws_connections: usize,
    topics: usize,
    subscribers: usize,
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(RuntimeMetrics {
        active_ws_connections: state.active_connections(),
        topics: state.rooms.topic_count().await,
        subscribers: state.rooms.subscriber_count().await,
    })
}

/// Routes for the relay. Serve with
/// `into_make_service_with_connect_info::<SocketAddr>()`.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(|| async { "Rally Relay Online" }))
        .route("/health", get(health))
        .route("/ws", get(signal::ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// `ws://` URL clients should use for a relay bound to `addr`.
pub fn ws_url_for_bound_addr(addr: std::net::SocketAddr) -> String {
    let host = if addr.ip().is_unspecified() {
        "127.0.0.1".to_string()
    } else {
        addr.ip().to_string()
    };
    format!("ws://{}:{}/ws", host, addr.port())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ws_url_for_unspecified_bind() {
        let addr = "0.0.0.0:4010".parse().unwrap();
        assert_eq!(ws_url_for_bound_addr(addr), "ws://127.0.0.1:4010/ws");
        let addr = "10.1.2.3:80".parse().unwrap();
        assert_eq!(ws_url_for_bound_addr(addr), "ws://10.1.2.3:80/ws");
    }
}
