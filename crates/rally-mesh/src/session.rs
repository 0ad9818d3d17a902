//! Room/call session controller.
//!
//! [`CallSession`] is the public lifecycle API: join a room, toggle local
//! tracks, share the screen, leave. Everything created for a call (peer
//! registry, signaling channel, engine task) is owned by the active call and
//! torn down by [`CallSession::leave`].

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use rally_common::{DeviceError, Error, ParticipantId, Result};

use crate::config::MeshConfig;
use crate::engine::NegotiationEngine;
use crate::media::{LocalMedia, MediaConstraints, MediaDevices, MediaKind, TrackKind};
use crate::negotiation::NegotiationState;
use crate::realtime::Realtime;
use crate::registry::{PeerRegistry, PeerSnapshot, RemoteStream};
use crate::signaling::SignalingChannel;
use crate::transport::{LinkState, TransportFactory};

const EVENT_CAPACITY: usize = 256;

/// Notifications for whatever renders the call.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Joined {
        room: String,
        topic: String,
    },
    /// Local capture failed; the call continues receive-only for that kind.
    MediaUnavailable {
        kind: MediaKind,
        error: DeviceError,
    },
    PeerStateChanged {
        peer: ParticipantId,
        state: NegotiationState,
    },
    PeerLinkState {
        peer: ParticipantId,
        state: LinkState,
    },
    RemoteStream {
        peer: ParticipantId,
        stream: RemoteStream,
    },
    PeerClosed {
        peer: ParticipantId,
    },
    /// The broadcast subscription ended; every link has been closed. The
    /// owner should call `leave`.
    SignalingLost,
    Left,
}

struct ActiveCall {
    room: String,
    registry: Arc<PeerRegistry>,
    channel: Arc<SignalingChannel>,
    stop: Option<oneshot::Sender<()>>,
    engine: JoinHandle<()>,
}

pub struct CallSession {
    identity: ParticipantId,
    config: MeshConfig,
    devices: Arc<dyn MediaDevices>,
    realtime: Arc<dyn Realtime>,
    transports: Arc<dyn TransportFactory>,
    media: Arc<LocalMedia>,
    events: broadcast::Sender<SessionEvent>,
    active: Option<ActiveCall>,
}

impl CallSession {
    pub fn new(
        identity: ParticipantId,
        config: MeshConfig,
        devices: Arc<dyn MediaDevices>,
        realtime: Arc<dyn Realtime>,
        transports: Arc<dyn TransportFactory>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            identity,
            config,
            devices,
            realtime,
            transports,
            media: Arc::new(LocalMedia::new()),
            events,
            active: None,
        }
    }

    pub fn identity(&self) -> &ParticipantId {
        &self.identity
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn is_joined(&self) -> bool {
        self.active.is_some()
    }

    pub fn room(&self) -> Option<&str> {
        self.active.as_ref().map(|c| c.room.as_str())
    }

    pub fn local_media(&self) -> &LocalMedia {
        &self.media
    }

    pub fn peers(&self) -> Vec<PeerSnapshot> {
        self.active
            .as_ref()
            .map(|c| c.registry.snapshots())
            .unwrap_or_default()
    }

    pub fn remote_streams(&self) -> HashMap<ParticipantId, RemoteStream> {
        self.active
            .as_ref()
            .map(|c| c.registry.remote_streams())
            .unwrap_or_default()
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    /// Joins `room_id`. A second call while joined does nothing.
    ///
    /// Failing to capture local media is not an error: the call goes ahead
    /// receive-only. Failing to subscribe is, and leaves nothing behind.
    pub async fn join(&mut self, room_id: &str) -> Result<()> {
        if self.active.is_some() {
            debug!("{} already joined; ignoring join({})", self.identity, room_id);
            return Ok(());
        }
        self.config.ice.validate()?;
        let topic = self.config.kind.topic(room_id);

        match self
            .devices
            .acquire(MediaKind::Camera, self.config.kind.constraints())
            .await
        {
            Ok(stream) => self.media.set_camera(stream),
            Err(error) => {
                warn!("camera unavailable ({}); joining receive-only", error);
                self.emit(SessionEvent::MediaUnavailable {
                    kind: MediaKind::Camera,
                    error,
                });
            }
        }

        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let registry = Arc::new(PeerRegistry::new(
            self.config.ice.clone(),
            Arc::clone(&self.transports),
            Arc::clone(&self.media),
            link_tx,
        ));
        let channel = Arc::new(SignalingChannel::new(self.identity.clone(), topic.clone()));

        let signals = match channel
            .connect(self.realtime.as_ref(), self.config.subscribe_timeout)
            .await
        {
            Ok(signals) => signals,
            Err(e) => {
                error!("failed to join {}: {}", topic, e);
                registry.close_all().await;
                self.media.release_all();
                channel.disconnect();
                return Err(e);
            }
        };

        let (stop_tx, stop_rx) = oneshot::channel();
        let engine = NegotiationEngine::new(
            self.identity.clone(),
            Arc::clone(&registry),
            Arc::clone(&channel),
            self.events.clone(),
        );
        let engine = tokio::spawn(engine.run(signals, link_rx, stop_rx));

        self.active = Some(ActiveCall {
            room: room_id.to_string(),
            registry,
            channel,
            stop: Some(stop_tx),
            engine,
        });
        info!("{} joined {} as {}", self.identity, topic, self.config.kind);
        self.emit(SessionEvent::Joined {
            room: room_id.to_string(),
            topic,
        });
        Ok(())
    }

    /// Leaves the call. Safe to call repeatedly and after a failed join.
    ///
    /// Negotiation is stopped first; then all links are closed, all local
    /// tracks stopped and the channel disconnected, in that order.
    pub async fn leave(&mut self) {
        let Some(mut call) = self.active.take() else {
            self.media.release_all();
            return;
        };

        if let Some(stop) = call.stop.take() {
            let _ = stop.send(());
        }
        if let Err(e) = (&mut call.engine).await {
            if e.is_panic() {
                error!("negotiation engine panicked: {}", e);
            }
        }

        let closed = call.registry.close_all().await;
        self.media.release_all();
        call.channel.disconnect();

        info!("{} left {} ({} links closed)", self.identity, call.room, closed);
        self.emit(SessionEvent::Left);
    }

    fn ensure_joined(&self) -> Result<&ActiveCall> {
        self.active.as_ref().ok_or(Error::NotJoined)
    }

    /// Flips the microphone. Connections are not renegotiated.
    pub fn toggle_audio(&self) -> Result<bool> {
        self.ensure_joined()?;
        self.media.toggle(MediaKind::Camera, TrackKind::Audio)
    }

    /// Flips the camera. Connections are not renegotiated.
    pub fn toggle_video(&self) -> Result<bool> {
        self.ensure_joined()?;
        self.media.toggle(MediaKind::Camera, TrackKind::Video)
    }

    /// Replaces the outbound video on every link with a screen capture.
    pub async fn start_screen_share(&self) -> Result<()> {
        let call = self.ensure_joined()?;
        if self.media.is_sharing_screen() {
            return Ok(());
        }

        let stream = match self
            .devices
            .acquire(MediaKind::Screen, MediaConstraints::VIDEO_ONLY)
            .await
        {
            Ok(stream) => stream,
            Err(error) => {
                self.emit(SessionEvent::MediaUnavailable {
                    kind: MediaKind::Screen,
                    error,
                });
                return Err(error.into());
            }
        };
        let video = stream.track(TrackKind::Video).cloned();
        self.media.set_screen(stream);

        let links = call.registry.len();
        let replaced = call.registry.replace_outbound_video(video).await;
        if replaced < links {
            warn!(
                "screen share reaches {} of {} links; the rest have no video sender",
                replaced, links
            );
        }
        info!("{} started screen share", self.identity);
        Ok(())
    }

    /// Puts the camera back on every link and stops the screen capture.
    pub async fn stop_screen_share(&self) -> Result<()> {
        let call = self.ensure_joined()?;
        if !self.media.is_sharing_screen() {
            return Ok(());
        }
        let camera = self.media.track(MediaKind::Camera, TrackKind::Video);
        call.registry.replace_outbound_video(camera).await;
        self.media.release(MediaKind::Screen);
        info!("{} stopped screen share", self.identity);
        Ok(())
    }
}

impl Drop for CallSession {
    fn drop(&mut self) {
        let Some(mut call) = self.active.take() else {
            return;
        };
        if let Some(stop) = call.stop.take() {
            let _ = stop.send(());
        }
        self.media.release_all();
        call.channel.disconnect();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let registry = call.registry;
            handle.spawn(async move {
                registry.close_all().await;
            });
        }
    }
}
