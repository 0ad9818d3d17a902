//! Rally CLI tools: join a room over a relay, run a local mesh demo.

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;
use tracing::{info, warn};

use rally_common::{DeviceError, ParticipantId};
use rally_mesh::{
    CallKind, CallSession, IceConfig, MediaKind, MemoryHub, MeshConfig, NegotiationState,
    RtcTransportFactory, SessionEvent, SyntheticDevices, WsRealtime,
};

#[derive(Parser, Debug)]
#[command(name = "rally")]
#[command(about = "Rally CLI tools")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Join a room through a relay with synthetic media until Ctrl-C
    Join {
        /// Relay WebSocket URL
        #[arg(long, env = "RALLY_RELAY_URL", default_value = "ws://127.0.0.1:4010/ws")]
        relay: String,

        /// Room id
        #[arg(short, long)]
        room: String,

        /// Participant id (random when omitted)
        #[arg(short, long)]
        identity: Option<String>,

        /// Call kind: room, voice or video
        #[arg(short, long, default_value_t = CallKind::Room)]
        kind: CallKind,

        /// Join receive-only
        #[arg(long, default_value_t = false)]
        no_camera: bool,
    },

    /// Connect N in-process participants over real WebRTC on localhost
    Demo {
        /// Number of participants
        #[arg(short, long, default_value_t = 3)]
        participants: usize,

        /// Seconds to wait for the full mesh
        #[arg(long, default_value_t = 30)]
        timeout: u64,
    },

    /// Show version information
    Version,
}

fn describe(event: &SessionEvent) -> String {
    match event {
        SessionEvent::Joined { room, topic } => format!("joined {room} ({topic})"),
        SessionEvent::MediaUnavailable { kind, error } => {
            format!("{kind:?} unavailable: {error}")
        }
        SessionEvent::PeerStateChanged { peer, state } => format!("{peer}: {state:?}"),
        SessionEvent::PeerLinkState { peer, state } => format!("{peer}: link {state:?}"),
        SessionEvent::RemoteStream { peer, stream } => {
            format!("{peer}: receiving {} track(s)", stream.tracks.len())
        }
        SessionEvent::PeerClosed { peer } => format!("{peer}: closed"),
        SessionEvent::SignalingLost => "signaling lost".to_string(),
        SessionEvent::Left => "left".to_string(),
    }
}

async fn join(
    relay: String,
    room: String,
    identity: Option<String>,
    kind: CallKind,
    no_camera: bool,
) -> Result<()> {
    let identity = identity
        .map(ParticipantId::from)
        .unwrap_or_else(ParticipantId::random);
    let config = MeshConfig::from_env()?.with_kind(kind);

    let devices = Arc::new(SyntheticDevices::new());
    if no_camera {
        devices.refuse(MediaKind::Camera, DeviceError::NotFound);
    }
    let transports = Arc::new(RtcTransportFactory::new()?);
    let mut session = CallSession::new(
        identity.clone(),
        config,
        devices,
        Arc::new(WsRealtime::new(relay.clone())),
        transports,
    );
    let mut events = session.subscribe();

    session
        .join(&room)
        .await
        .with_context(|| format!("failed to join {room} via {relay}"))?;
    println!("{identity} in {room}; Ctrl-C to leave");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(SessionEvent::SignalingLost) => {
                    warn!("relay connection lost");
                    break;
                }
                Ok(event) => println!("{}", describe(&event)),
                Err(RecvError::Lagged(n)) => warn!("missed {} session events", n),
                Err(RecvError::Closed) => break,
            }
        }
    }

    session.leave().await;
    Ok(())
}

fn fully_connected(session: &CallSession, expected: usize) -> bool {
    let peers = session.peers();
    peers.len() == expected && peers.iter().all(|p| p.state == NegotiationState::Connected)
}

async fn demo(participants: usize, timeout: Duration) -> Result<()> {
    if participants < 2 {
        anyhow::bail!("a mesh needs at least two participants");
    }
    let hub = MemoryHub::new();
    let transports = Arc::new(RtcTransportFactory::new()?);
    let config = MeshConfig::default().with_ice(IceConfig::host_only());

    let mut sessions = Vec::with_capacity(participants);
    for i in 0..participants {
        let mut session = CallSession::new(
            ParticipantId::new(format!("peer-{i}")),
            config.clone(),
            Arc::new(SyntheticDevices::new()),
            Arc::new(hub.clone()),
            transports.clone(),
        );
        session.join("demo").await?;
        sessions.push(session);
    }
    info!("{} participants joined", participants);

    let started = Instant::now();
    let deadline = started + timeout;
    let result = loop {
        if sessions.iter().all(|s| fully_connected(s, participants - 1)) {
            println!(
                "full mesh of {} participants ({} links) connected in {:?}",
                participants,
                participants * (participants - 1) / 2,
                started.elapsed()
            );
            break Ok(());
        }
        if Instant::now() > deadline {
            for session in &sessions {
                for peer in session.peers() {
                    println!(
                        "{} -> {}: {:?} / {:?}",
                        session.identity(),
                        peer.peer,
                        peer.state,
                        peer.link_state
                    );
                }
            }
            break Err(anyhow::anyhow!("mesh did not converge within {:?}", timeout));
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    };

    for session in &mut sessions {
        session.leave().await;
    }
    result
}

#[tokio::main]
async fn main() -> Result<()> {
    rally_common::init_tracing();

    let args = Args::parse();

    match args.command {
        Command::Join {
            relay,
            room,
            identity,
            kind,
            no_camera,
        } => join(relay, room, identity, kind, no_camera).await?,
        Command::Demo {
            participants,
            timeout,
        } => demo(participants, Duration::from_secs(timeout)).await?,
        Command::Version => {
            println!("rally {}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
