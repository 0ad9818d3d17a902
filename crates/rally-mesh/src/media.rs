//! Local capture streams and the per-session media state.
//!
//! A stream owns its tracks and whatever task feeds them. Peer links only
//! hold references to the underlying RTP tracks; stopping a track is the
//! business of this module alone.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use rally_common::{DeviceError, Error, Result};

const SYNTHETIC_TICK: Duration = Duration::from_millis(20);
/// Opus TOC byte + padding for a 20 ms silence frame.
const OPUS_SILENCE: &[u8] = &[0xf8, 0xff, 0xfe];
const VP8_PLACEHOLDER: &[u8] = &[0x10, 0x02, 0x00, 0x9d, 0x01, 0x2a, 0x10, 0x00, 0x10, 0x00];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Camera,
    Screen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl MediaConstraints {
    pub const AUDIO_VIDEO: Self = Self {
        audio: true,
        video: true,
    };
    pub const AUDIO_ONLY: Self = Self {
        audio: true,
        video: false,
    };
    pub const VIDEO_ONLY: Self = Self {
        audio: false,
        video: true,
    };

    pub fn is_empty(&self) -> bool {
        !self.audio && !self.video
    }
}

struct TrackInner {
    kind: TrackKind,
    source: MediaKind,
    rtc: Arc<TrackLocalStaticSample>,
    enabled: AtomicBool,
    live: AtomicBool,
}

/// Shared handle to one local capture track.
///
/// Cloning is cheap; every peer link sending this track holds a clone.
#[derive(Clone)]
pub struct LocalTrack {
    inner: Arc<TrackInner>,
}

impl std::fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.id())
            .field("kind", &self.inner.kind)
            .field("source", &self.inner.source)
            .field("enabled", &self.is_enabled())
            .field("live", &self.is_live())
            .finish()
    }
}

impl LocalTrack {
    pub fn new(kind: TrackKind, source: MediaKind, rtc: Arc<TrackLocalStaticSample>) -> Self {
        Self {
            inner: Arc::new(TrackInner {
                kind,
                source,
                rtc,
                enabled: AtomicBool::new(true),
                live: AtomicBool::new(true),
            }),
        }
    }

    pub fn id(&self) -> &str {
        self.inner.rtc.id()
    }

    pub fn kind(&self) -> TrackKind {
        self.inner.kind
    }

    pub fn source(&self) -> MediaKind {
        self.inner.source
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::Acquire)
    }

    /// Gates sending without touching the device or any connection.
    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::Release);
    }

    pub fn is_live(&self) -> bool {
        self.inner.live.load(Ordering::Acquire)
    }

    pub fn rtc_track(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.inner.rtc)
    }

    /// Writes a sample if the track is live and enabled. Returns whether it
    /// was written.
    pub async fn write_sample(&self, sample: &Sample) -> Result<bool> {
        if !self.is_live() || !self.is_enabled() {
            return Ok(false);
        }
        self.inner
            .rtc
            .write_sample(sample)
            .await
            .map_err(Error::internal)?;
        Ok(true)
    }

    fn stop(&self) {
        self.inner.live.store(false, Ordering::Release);
    }

    pub fn same_track(&self, other: &LocalTrack) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// A camera+mic or screen capture stream.
pub struct LocalStream {
    id: String,
    kind: MediaKind,
    tracks: Vec<LocalTrack>,
    capture: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for LocalStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalStream")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("tracks", &self.tracks)
            .finish()
    }
}

impl LocalStream {
    pub fn new(kind: MediaKind, tracks: Vec<LocalTrack>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            tracks,
            capture: None,
        }
    }

    /// Attaches the task feeding this stream; it is aborted on stop.
    pub fn with_capture(mut self, capture: JoinHandle<()>) -> Self {
        self.capture = Some(capture);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn tracks(&self) -> &[LocalTrack] {
        &self.tracks
    }

    pub fn track(&self, kind: TrackKind) -> Option<&LocalTrack> {
        self.tracks.iter().find(|t| t.kind() == kind)
    }

    pub fn live_track_count(&self) -> usize {
        self.tracks.iter().filter(|t| t.is_live()).count()
    }

    /// Stops every track and the capture task. Idempotent.
    pub fn stop(&mut self) {
        for track in &self.tracks {
            track.stop();
        }
        if let Some(capture) = self.capture.take() {
            capture.abort();
        }
    }
}

impl Drop for LocalStream {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Source of local capture streams.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn acquire(
        &self,
        kind: MediaKind,
        constraints: MediaConstraints,
    ) -> std::result::Result<LocalStream, DeviceError>;
}

/// Outbound tracks a new peer link should carry.
#[derive(Debug, Clone, Default)]
pub struct OutboundTracks {
    pub audio: Option<LocalTrack>,
    pub video: Option<LocalTrack>,
}

impl OutboundTracks {
    pub fn is_empty(&self) -> bool {
        self.audio.is_none() && self.video.is_none()
    }
}

#[derive(Default)]
struct MediaSlots {
    camera: Option<LocalStream>,
    screen: Option<LocalStream>,
}

/// Local media of one session: at most one camera stream and at most one
/// screen stream.
#[derive(Default)]
pub struct LocalMedia {
    slots: Mutex<MediaSlots>,
}

impl LocalMedia {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs the camera stream, stopping any previous one.
    pub fn set_camera(&self, stream: LocalStream) {
        let previous = self.slots.lock().camera.replace(stream);
        if let Some(mut previous) = previous {
            previous.stop();
        }
    }

    /// Installs the screen stream, stopping any previous one.
    pub fn set_screen(&self, stream: LocalStream) {
        let previous = self.slots.lock().screen.replace(stream);
        if let Some(mut previous) = previous {
            previous.stop();
        }
    }

    pub fn has_camera(&self) -> bool {
        self.slots.lock().camera.is_some()
    }

    pub fn is_sharing_screen(&self) -> bool {
        self.slots.lock().screen.is_some()
    }

    pub fn track(&self, source: MediaKind, kind: TrackKind) -> Option<LocalTrack> {
        let slots = self.slots.lock();
        let stream = match source {
            MediaKind::Camera => slots.camera.as_ref(),
            MediaKind::Screen => slots.screen.as_ref(),
        };
        stream.and_then(|s| s.track(kind).cloned())
    }

    /// Audio comes from the camera stream; video from the screen while
    /// sharing, otherwise from the camera.
    pub fn outbound_tracks(&self) -> OutboundTracks {
        let slots = self.slots.lock();
        let audio = slots
            .camera
            .as_ref()
            .and_then(|s| s.track(TrackKind::Audio).cloned());
        let video = slots
            .screen
            .as_ref()
            .and_then(|s| s.track(TrackKind::Video).cloned())
            .or_else(|| {
                slots
                    .camera
                    .as_ref()
                    .and_then(|s| s.track(TrackKind::Video).cloned())
            });
        OutboundTracks { audio, video }
    }

    pub fn set_track_enabled(&self, source: MediaKind, kind: TrackKind, enabled: bool) -> Result<()> {
        let track = self.track(source, kind).ok_or(Error::NoLocalMedia)?;
        track.set_enabled(enabled);
        debug!("{:?} {:?} track enabled={}", source, kind, enabled);
        Ok(())
    }

    /// Flips a track's enabled flag and returns the new value.
    pub fn toggle(&self, source: MediaKind, kind: TrackKind) -> Result<bool> {
        let track = self.track(source, kind).ok_or(Error::NoLocalMedia)?;
        let enabled = !track.is_enabled();
        track.set_enabled(enabled);
        debug!("{:?} {:?} track toggled to enabled={}", source, kind, enabled);
        Ok(enabled)
    }

    /// Stops and drops one stream. Idempotent.
    pub fn release(&self, source: MediaKind) {
        let stream = {
            let mut slots = self.slots.lock();
            match source {
                MediaKind::Camera => slots.camera.take(),
                MediaKind::Screen => slots.screen.take(),
            }
        };
        if let Some(mut stream) = stream {
            stream.stop();
            info!("released {:?} stream {}", source, stream.id());
        }
    }

    pub fn release_all(&self) {
        self.release(MediaKind::Screen);
        self.release(MediaKind::Camera);
    }

    pub fn live_track_count(&self) -> usize {
        let slots = self.slots.lock();
        slots.camera.as_ref().map_or(0, LocalStream::live_track_count)
            + slots.screen.as_ref().map_or(0, LocalStream::live_track_count)
    }
}

/// Capture devices that synthesise silence and placeholder frames.
///
/// Stands in for real hardware in the CLI and tests. Individual kinds can be
/// made to fail with a chosen [`DeviceError`].
pub struct SyntheticDevices {
    refusals: Mutex<HashMap<MediaKind, DeviceError>>,
    paced: bool,
}

impl Default for SyntheticDevices {
    fn default() -> Self {
        Self {
            refusals: Mutex::new(HashMap::new()),
            paced: true,
        }
    }
}

impl SyntheticDevices {
    pub fn new() -> Self {
        Self::default()
    }

    /// Streams are created without a capture task; nothing is written.
    pub fn without_pacing(mut self) -> Self {
        self.paced = false;
        self
    }

    pub fn refuse(&self, kind: MediaKind, error: DeviceError) {
        self.refusals.lock().insert(kind, error);
    }

    pub fn allow(&self, kind: MediaKind) {
        self.refusals.lock().remove(&kind);
    }

    fn make_track(kind: TrackKind, source: MediaKind, stream_id: &str) -> LocalTrack {
        let capability = match kind {
            TrackKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 2,
                ..Default::default()
            },
            TrackKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90000,
                ..Default::default()
            },
        };
        let label = match kind {
            TrackKind::Audio => "audio",
            TrackKind::Video => "video",
        };
        let rtc = Arc::new(TrackLocalStaticSample::new(
            capability,
            format!("{label}-{}", uuid::Uuid::new_v4()),
            stream_id.to_owned(),
        ));
        LocalTrack::new(kind, source, rtc)
    }
}

async fn pump(tracks: Vec<LocalTrack>) {
    let mut ticker = tokio::time::interval(SYNTHETIC_TICK);
    let mut tick: u64 = 0;
    loop {
        ticker.tick().await;
        tick = tick.wrapping_add(1);
        if tracks.iter().all(|t| !t.is_live()) {
            break;
        }
        for track in &tracks {
            let sample = match track.kind() {
                TrackKind::Audio => Sample {
                    data: Bytes::from_static(OPUS_SILENCE),
                    duration: SYNTHETIC_TICK,
                    ..Default::default()
                },
                // 25 fps
                TrackKind::Video if tick % 2 == 0 => Sample {
                    data: Bytes::from_static(VP8_PLACEHOLDER),
                    duration: SYNTHETIC_TICK * 2,
                    ..Default::default()
                },
                TrackKind::Video => continue,
            };
            if let Err(e) = track.write_sample(&sample).await {
                debug!("synthetic sample write failed on {}: {}", track.id(), e);
            }
        }
    }
}

#[async_trait]
impl MediaDevices for SyntheticDevices {
    async fn acquire(
        &self,
        kind: MediaKind,
        constraints: MediaConstraints,
    ) -> std::result::Result<LocalStream, DeviceError> {
        if let Some(error) = self.refusals.lock().get(&kind).copied() {
            return Err(error);
        }

        // Screen capture carries video only.
        let constraints = match kind {
            MediaKind::Camera => constraints,
            MediaKind::Screen => MediaConstraints::VIDEO_ONLY,
        };
        if constraints.is_empty() {
            return Err(DeviceError::NotFound);
        }

        let stream_id = format!("{:?}-{}", kind, uuid::Uuid::new_v4()).to_lowercase();
        let mut tracks = Vec::new();
        if constraints.audio {
            tracks.push(Self::make_track(TrackKind::Audio, kind, &stream_id));
        }
        if constraints.video {
            tracks.push(Self::make_track(TrackKind::Video, kind, &stream_id));
        }

        let stream = LocalStream::new(kind, tracks);
        info!(
            "acquired synthetic {:?} stream {} ({} tracks)",
            kind,
            stream.id(),
            stream.tracks().len()
        );
        if self.paced {
            let capture = tokio::spawn(pump(stream.tracks().to_vec()));
            Ok(stream.with_capture(capture))
        } else {
            Ok(stream)
        }
    }
}
