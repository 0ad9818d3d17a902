//! Scripted transport for exercising negotiation without networking.
//!
//! Descriptions are plain text listing the sender's outbound track ids. A
//! fake link reports `Connected` once both descriptions are set and one
//! remote candidate has been applied, and then surfaces the remote tracks.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use rally_common::{Error, IceCandidate, ParticipantId, Result, SdpKind, SessionDescription};

use crate::ice::IceConfig;
use crate::media::{LocalTrack, TrackKind};
use crate::transport::{
    LinkState, OutboundTracks, PeerTransport, RemoteTrack, TransportEvent, TransportEvents,
    TransportFactory,
};

const SDP_MAGIC: &str = "fake-sdp";

#[derive(Default)]
struct Counters {
    offers: AtomicUsize,
    answers: AtomicUsize,
    live: AtomicUsize,
    applied: Mutex<Vec<String>>,
}

pub(crate) struct FakeTransportFactory {
    owner: String,
    counters: Arc<Counters>,
    transports: Mutex<HashMap<ParticipantId, Arc<FakeTransport>>>,
    offer_gate: watch::Sender<bool>,
}

impl FakeTransportFactory {
    pub(crate) fn new(owner: &str) -> Self {
        let (offer_gate, _) = watch::channel(true);
        Self {
            owner: owner.to_string(),
            counters: Arc::new(Counters::default()),
            transports: Mutex::new(HashMap::new()),
            offer_gate,
        }
    }

    pub(crate) fn offers(&self) -> usize {
        self.counters.offers.load(Ordering::SeqCst)
    }

    pub(crate) fn answers(&self) -> usize {
        self.counters.answers.load(Ordering::SeqCst)
    }

    pub(crate) fn live_transports(&self) -> usize {
        self.counters.live.load(Ordering::SeqCst)
    }

    /// Every remote candidate applied by any of this factory's transports.
    pub(crate) fn applied_candidates(&self) -> Vec<String> {
        self.counters.applied.lock().clone()
    }

    /// Offer creation blocks until [`release_offers`](Self::release_offers).
    pub(crate) fn hold_offers(&self) {
        self.offer_gate.send_replace(false);
    }

    pub(crate) fn release_offers(&self) {
        self.offer_gate.send_replace(true);
    }

    /// Makes the latest link to `peer` report a failed transport.
    pub(crate) fn degrade(&self, peer: &ParticipantId) {
        if let Some(transport) = self.transports.lock().get(peer) {
            transport.events.emit(TransportEvent::StateChanged(LinkState::Failed));
        }
    }

    /// Video track id the latest link to `peer` is sending, if any.
    pub(crate) fn outbound_video(&self, peer: &ParticipantId) -> Option<String> {
        self.transports
            .lock()
            .get(peer)
            .and_then(|t| t.state.lock().video.clone())
    }
}

#[async_trait]
impl TransportFactory for FakeTransportFactory {
    async fn create(
        &self,
        _ice: &IceConfig,
        tracks: OutboundTracks,
        events: TransportEvents,
    ) -> Result<Arc<dyn PeerTransport>> {
        let transport = Arc::new(FakeTransport {
            owner: self.owner.clone(),
            candidate: format!(
                "candidate:{} 1 udp 2122260223 127.0.0.1 {} typ host",
                self.owner,
                40000 + events.generation()
            ),
            counters: Arc::clone(&self.counters),
            gate: self.offer_gate.subscribe(),
            has_video_sender: tracks.video.is_some(),
            state: Mutex::new(FakeState {
                audio: tracks.audio.as_ref().map(|t| t.id().to_string()),
                video: tracks.video.as_ref().map(|t| t.id().to_string()),
                ..FakeState::default()
            }),
            events,
        });
        self.counters.live.fetch_add(1, Ordering::SeqCst);
        self.transports
            .lock()
            .insert(transport.events.peer().clone(), Arc::clone(&transport));
        Ok(transport)
    }
}

#[derive(Default)]
struct FakeState {
    audio: Option<String>,
    video: Option<String>,
    local_set: bool,
    remote_tracks: Option<Vec<(TrackKind, String)>>,
    remote_candidate: bool,
    connected: bool,
    closed: bool,
}

struct FakeTransport {
    owner: String,
    candidate: String,
    counters: Arc<Counters>,
    gate: watch::Receiver<bool>,
    has_video_sender: bool,
    state: Mutex<FakeState>,
    events: TransportEvents,
}

impl FakeTransport {
    fn check_open(&self) -> Result<()> {
        if self.state.lock().closed {
            return Err(Error::negotiation("transport closed"));
        }
        Ok(())
    }

    fn describe(&self, kind: SdpKind) -> SessionDescription {
        let state = self.state.lock();
        let mut sdp = format!("{SDP_MAGIC}\nstream={}\n", self.owner);
        if let Some(audio) = &state.audio {
            sdp.push_str(&format!("audio={audio}\n"));
        }
        if let Some(video) = &state.video {
            sdp.push_str(&format!("video={video}\n"));
        }
        SessionDescription { kind, sdp }
    }

    fn maybe_connect(&self) {
        let remote = {
            let mut state = self.state.lock();
            if state.closed
                || state.connected
                || !state.local_set
                || !state.remote_candidate
                || state.remote_tracks.is_none()
            {
                return;
            }
            state.connected = true;
            state.remote_tracks.clone().unwrap_or_default()
        };
        self.events
            .emit(TransportEvent::StateChanged(LinkState::Connecting));
        for (kind, id) in remote {
            self.events.emit(TransportEvent::RemoteTrack(RemoteTrack {
                id,
                stream_id: format!("stream-{}", self.events.peer()),
                kind,
                rtc: None,
            }));
        }
        self.events
            .emit(TransportEvent::StateChanged(LinkState::Connected));
    }
}

fn parse_sdp(sdp: &str) -> Result<Vec<(TrackKind, String)>> {
    let mut lines = sdp.lines();
    if lines.next() != Some(SDP_MAGIC) {
        return Err(Error::negotiation("malformed sdp"));
    }
    let mut tracks = Vec::new();
    for line in lines {
        if let Some(id) = line.strip_prefix("audio=") {
            tracks.push((TrackKind::Audio, id.to_string()));
        } else if let Some(id) = line.strip_prefix("video=") {
            tracks.push((TrackKind::Video, id.to_string()));
        }
    }
    Ok(tracks)
}

#[async_trait]
impl PeerTransport for FakeTransport {
    async fn create_offer(&self) -> Result<SessionDescription> {
        let mut gate = self.gate.clone();
        while !*gate.borrow_and_update() {
            if gate.changed().await.is_err() {
                break;
            }
        }
        self.check_open()?;
        self.counters.offers.fetch_add(1, Ordering::SeqCst);
        Ok(self.describe(SdpKind::Offer))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        self.check_open()?;
        if self.state.lock().remote_tracks.is_none() {
            return Err(Error::negotiation("no remote offer"));
        }
        self.counters.answers.fetch_add(1, Ordering::SeqCst);
        Ok(self.describe(SdpKind::Answer))
    }

    async fn set_local_description(&self, _desc: SessionDescription) -> Result<()> {
        self.check_open()?;
        self.state.lock().local_set = true;
        self.events
            .emit(TransportEvent::LocalCandidate(IceCandidate {
                candidate: self.candidate.clone(),
                sdp_mid: Some("0".into()),
                sdp_m_line_index: Some(0),
                username_fragment: None,
            }));
        self.maybe_connect();
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        self.check_open()?;
        let tracks = parse_sdp(&desc.sdp)?;
        self.state.lock().remote_tracks = Some(tracks);
        self.maybe_connect();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.check_open()?;
        {
            let mut state = self.state.lock();
            if state.remote_tracks.is_none() {
                return Err(Error::negotiation("remote description not set"));
            }
            state.remote_candidate = true;
        }
        self.counters.applied.lock().push(candidate.candidate);
        self.maybe_connect();
        Ok(())
    }

    async fn replace_video_track(&self, track: Option<LocalTrack>) -> Result<bool> {
        self.check_open()?;
        if !self.has_video_sender {
            return Ok(false);
        }
        self.state.lock().video = track.map(|t| t.id().to_string());
        Ok(true)
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        if !state.closed {
            state.closed = true;
            self.counters.live.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// Polls `condition` until it holds, failing the test after five seconds.
pub(crate) async fn wait_for(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
