use anyhow::Result;
use clap::Parser;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{info, warn};

use rally_common::env_bool;
use rally_relay::{
    router, ws_url_for_bound_addr, AppState, RelayConfig, DEFAULT_MAX_CONNECTIONS,
    DEFAULT_MAX_MESSAGES_PER_MINUTE, DEFAULT_MAX_MESSAGE_BYTES,
};

#[derive(Parser, Debug)]
#[command(name = "rally-relay")]
#[command(about = "Rally signaling relay - topic broadcast and presence over WebSocket")]
struct Args {
    /// TCP listen address
    #[arg(long, env = "RALLY_RELAY_LISTEN", default_value = "127.0.0.1:4010")]
    listen: SocketAddr,

    /// Maximum concurrent WebSocket connections
    #[arg(long, env = "RALLY_RELAY_MAX_CONNECTIONS", default_value_t = DEFAULT_MAX_CONNECTIONS)]
    max_connections: usize,

    /// Largest accepted frame in bytes
    #[arg(long, default_value_t = DEFAULT_MAX_MESSAGE_BYTES)]
    max_message_bytes: usize,

    /// Per-connection message budget per minute
    #[arg(long, default_value_t = DEFAULT_MAX_MESSAGES_PER_MINUTE)]
    max_messages_per_minute: u32,

    /// Seconds a connection may stay without subscribing
    #[arg(long, default_value_t = 10)]
    bind_timeout: u64,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn check_public_bind_allowed(addr: SocketAddr) -> Result<()> {
    if addr.ip().is_loopback() {
        return Ok(());
    }
    if env_bool("RALLY_ALLOW_PUBLIC_BIND", false) {
        return Ok(());
    }
    Err(anyhow::anyhow!(
        "refusing non-loopback bind without RALLY_ALLOW_PUBLIC_BIND=1"
    ))
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for ctrl-c: {}", err);
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    rally_common::init_tracing_with_default(&format!(
        "rally_relay={},tower_http=info",
        args.log_level
    ));

    if args.bind_timeout == 0 {
        anyhow::bail!("--bind-timeout must be at least one second");
    }
    check_public_bind_allowed(args.listen)?;

    let state = AppState::new(RelayConfig {
        max_connections: args.max_connections,
        max_message_bytes: args.max_message_bytes,
        max_messages_per_minute: args.max_messages_per_minute,
        bind_timeout: Duration::from_secs(args.bind_timeout),
    });

    let listener = TcpListener::bind(args.listen).await?;
    let bound_addr = listener.local_addr()?;
    info!("relay listening on {}", bound_addr);
    info!("relay signaling url {}", ws_url_for_bound_addr(bound_addr));

    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    Ok(())
}
