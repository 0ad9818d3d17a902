//! webrtc-rs backed peer transport.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::{RTCRtpTransceiver, RTCRtpTransceiverInit};
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use rally_common::{Error, IceCandidate, Result, SdpKind, SessionDescription};

use super::{
    LinkState, OutboundTracks, PeerTransport, RemoteTrack, TransportEvent, TransportEvents,
    TransportFactory,
};
use crate::ice::IceConfig;
use crate::media::{LocalTrack, TrackKind};

fn rtc_err(context: &str, err: webrtc::Error) -> Error {
    Error::negotiation(format!("{context}: {err}"))
}

fn to_rtc_description(desc: SessionDescription) -> Result<RTCSessionDescription> {
    let parsed = match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp),
        SdpKind::Pranswer => RTCSessionDescription::pranswer(desc.sdp),
        SdpKind::Rollback => return Err(Error::negotiation("rollback is not supported")),
    };
    parsed.map_err(|e| rtc_err("invalid sdp", e))
}

fn from_rtc_description(desc: RTCSessionDescription) -> Result<SessionDescription> {
    let kind = match desc.sdp_type {
        RTCSdpType::Offer => SdpKind::Offer,
        RTCSdpType::Answer => SdpKind::Answer,
        RTCSdpType::Pranswer => SdpKind::Pranswer,
        RTCSdpType::Rollback => SdpKind::Rollback,
        other => return Err(Error::negotiation(format!("unexpected sdp type {other:?}"))),
    };
    Ok(SessionDescription {
        kind,
        sdp: desc.sdp,
    })
}

fn link_state(state: RTCPeerConnectionState) -> Option<LinkState> {
    match state {
        RTCPeerConnectionState::New => Some(LinkState::New),
        RTCPeerConnectionState::Connecting => Some(LinkState::Connecting),
        RTCPeerConnectionState::Connected => Some(LinkState::Connected),
        RTCPeerConnectionState::Disconnected => Some(LinkState::Disconnected),
        RTCPeerConnectionState::Failed => Some(LinkState::Failed),
        RTCPeerConnectionState::Closed => Some(LinkState::Closed),
        _ => None,
    }
}

fn track_kind(kind: RTPCodecType) -> Option<TrackKind> {
    match kind {
        RTPCodecType::Audio => Some(TrackKind::Audio),
        RTPCodecType::Video => Some(TrackKind::Video),
        _ => None,
    }
}

/// Builds one webrtc-rs API (codecs + default interceptors) and opens every
/// peer connection of a session from it.
pub struct RtcTransportFactory {
    api: Arc<API>,
}

impl RtcTransportFactory {
    pub fn new() -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| rtc_err("failed to register codecs", e))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| rtc_err("failed to register interceptors", e))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        Ok(Self { api: Arc::new(api) })
    }
}

/// Keeps RTCP flowing for a sender; interceptors only run while it is read.
fn drain_rtcp(sender: Arc<RTCRtpSender>) {
    tokio::spawn(async move {
        let mut buf = vec![0u8; 1500];
        while sender.read(&mut buf).await.is_ok() {}
    });
}

async fn add_outbound(
    pc: &RTCPeerConnection,
    kind: RTPCodecType,
    track: Option<&LocalTrack>,
) -> Result<Option<Arc<RTCRtpSender>>> {
    match track {
        Some(track) => {
            let sender = pc
                .add_track(track.rtc_track() as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(|e| rtc_err("failed to add track", e))?;
            drain_rtcp(Arc::clone(&sender));
            Ok(Some(sender))
        }
        None => {
            pc.add_transceiver_from_kind(
                kind,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Recvonly,
                    send_encodings: vec![],
                }),
            )
            .await
            .map_err(|e| rtc_err("failed to add transceiver", e))?;
            Ok(None)
        }
    }
}

#[async_trait]
impl TransportFactory for RtcTransportFactory {
    async fn create(
        &self,
        ice: &IceConfig,
        tracks: OutboundTracks,
        events: TransportEvents,
    ) -> Result<Arc<dyn PeerTransport>> {
        let pc = self
            .api
            .new_peer_connection(ice.to_rtc_configuration())
            .await
            .map_err(|e| rtc_err("failed to create peer connection", e))?;
        let pc = Arc::new(pc);

        add_outbound(&pc, RTPCodecType::Audio, tracks.audio.as_ref()).await?;
        let video_sender = add_outbound(&pc, RTPCodecType::Video, tracks.video.as_ref()).await?;

        let candidate_events = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let events = candidate_events.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => events.emit(TransportEvent::LocalCandidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_m_line_index: init.sdp_mline_index,
                        username_fragment: init.username_fragment,
                    })),
                    Err(e) => warn!("failed to serialize local candidate: {}", e),
                }
            })
        }));

        let track_events = events.clone();
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let events = track_events.clone();
                Box::pin(async move {
                    let Some(kind) = track_kind(track.kind()) else {
                        return;
                    };
                    debug!(
                        "remote {:?} track {} from {}",
                        kind,
                        track.id(),
                        events.peer()
                    );
                    events.emit(TransportEvent::RemoteTrack(RemoteTrack {
                        id: track.id(),
                        stream_id: track.stream_id(),
                        kind,
                        rtc: Some(track),
                    }));
                })
            },
        ));

        let state_events = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            if let Some(state) = link_state(state) {
                info!(
                    "link to {} (gen {}) is {:?}",
                    state_events.peer(),
                    state_events.generation(),
                    state
                );
                state_events.emit(TransportEvent::StateChanged(state));
            }
            Box::pin(async {})
        }));

        Ok(Arc::new(RtcTransport {
            pc,
            video_sender: Mutex::new(video_sender),
        }))
    }
}

pub struct RtcTransport {
    pc: Arc<RTCPeerConnection>,
    video_sender: Mutex<Option<Arc<RTCRtpSender>>>,
}

#[async_trait]
impl PeerTransport for RtcTransport {
    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| rtc_err("failed to create offer", e))?;
        from_rtc_description(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| rtc_err("failed to create answer", e))?;
        from_rtc_description(answer)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        let desc = to_rtc_description(desc)?;
        self.pc
            .set_local_description(desc)
            .await
            .map_err(|e| rtc_err("failed to set local description", e))
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        let desc = to_rtc_description(desc)?;
        self.pc
            .set_remote_description(desc)
            .await
            .map_err(|e| rtc_err("failed to set remote description", e))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        if candidate.candidate.is_empty() {
            // End-of-candidates marker.
            return Ok(());
        }
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_m_line_index,
                username_fragment: candidate.username_fragment,
            })
            .await
            .map_err(|e| rtc_err("failed to add ice candidate", e))
    }

    async fn replace_video_track(&self, track: Option<LocalTrack>) -> Result<bool> {
        let Some(sender) = self.video_sender.lock().clone() else {
            return Ok(false);
        };
        let track = track.map(|t| t.rtc_track() as Arc<dyn TrackLocal + Send + Sync>);
        sender
            .replace_track(track)
            .await
            .map_err(|e| rtc_err("failed to replace video track", e))?;
        Ok(true)
    }

    async fn close(&self) -> Result<()> {
        self.video_sender.lock().take();
        self.pc
            .close()
            .await
            .map_err(|e| Error::internal(format!("failed to close peer connection: {e}")))
    }
}
