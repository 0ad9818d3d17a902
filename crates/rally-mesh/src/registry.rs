//! Peer connection registry.
//!
//! Owns every live peer link of one session, keyed by remote identity. The
//! engine reads and mutates links only through this type. Every link carries
//! a generation number; operations that name a generation are ignored once
//! that link has been replaced or closed.

use futures_util::future::join_all;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use rally_common::{IceCandidate, ParticipantId, Result};

use crate::ice::IceConfig;
use crate::media::{LocalMedia, LocalTrack, TrackKind};
use crate::negotiation::{LinkContext, NegotiationState};
use crate::transport::{LinkEvent, LinkState, PeerTransport, RemoteTrack, TransportEvents, TransportFactory};

/// Closed peers remembered at once; the oldest are forgotten first.
const MAX_TOMBSTONES: usize = 256;
/// Unknown identities whose candidates are buffered at once.
const MAX_EARLY_PEERS: usize = 32;

/// Every track received from one peer, grouped as one logical stream.
#[derive(Debug, Clone)]
pub struct RemoteStream {
    pub id: String,
    pub tracks: Vec<RemoteTrack>,
}

impl RemoteStream {
    pub fn has_kind(&self, kind: TrackKind) -> bool {
        self.tracks.iter().any(|t| t.kind == kind)
    }
}

#[derive(Debug, Clone)]
pub struct PeerSnapshot {
    pub peer: ParticipantId,
    pub generation: u64,
    pub state: NegotiationState,
    pub link_state: LinkState,
    pub remote_stream: Option<RemoteStream>,
    pub pending_candidates: usize,
}

struct PeerLink {
    transport: Arc<dyn PeerTransport>,
    generation: u64,
    state: NegotiationState,
    link_state: LinkState,
    remote_stream: Option<RemoteStream>,
    pending_candidates: Vec<IceCandidate>,
    remote_description_set: bool,
    /// Local candidates gathered before our offer/answer went out.
    held_candidates: Vec<IceCandidate>,
    description_sent: bool,
}

#[derive(Default)]
struct RegistryInner {
    links: HashMap<ParticipantId, PeerLink>,
    /// Candidates from peers we have no link for yet.
    early_candidates: HashMap<ParticipantId, Vec<IceCandidate>>,
    early_order: VecDeque<ParticipantId>,
    /// Peers whose negotiation ended in `Closed`.
    closed: HashSet<ParticipantId>,
    closed_order: VecDeque<ParticipantId>,
    next_generation: u64,
    shutting_down: bool,
}

impl RegistryInner {
    fn take_early(&mut self, peer: &ParticipantId) -> Option<Vec<IceCandidate>> {
        let taken = self.early_candidates.remove(peer)?;
        self.early_order.retain(|p| p != peer);
        Some(taken)
    }

    fn push_early(&mut self, peer: &ParticipantId, candidate: IceCandidate) {
        if let Some(queue) = self.early_candidates.get_mut(peer) {
            queue.push(candidate);
            return;
        }
        while self.early_order.len() >= MAX_EARLY_PEERS {
            let Some(oldest) = self.early_order.pop_front() else {
                break;
            };
            if let Some(dropped) = self.early_candidates.remove(&oldest) {
                debug!("dropping {} candidates from {} (never joined)", dropped.len(), oldest);
            }
        }
        self.early_order.push_back(peer.clone());
        self.early_candidates.insert(peer.clone(), vec![candidate]);
    }

    fn clear_early(&mut self) {
        self.early_candidates.clear();
        self.early_order.clear();
    }

    fn tombstone(&mut self, peer: &ParticipantId) {
        if !self.closed.insert(peer.clone()) {
            return;
        }
        self.closed_order.push_back(peer.clone());
        while self.closed_order.len() > MAX_TOMBSTONES {
            if let Some(oldest) = self.closed_order.pop_front() {
                self.closed.remove(&oldest);
            }
        }
    }

    fn lift_tombstone(&mut self, peer: &ParticipantId) {
        if self.closed.remove(peer) {
            self.closed_order.retain(|p| p != peer);
        }
    }
}

pub struct PeerRegistry {
    ice: IceConfig,
    factory: Arc<dyn TransportFactory>,
    media: Arc<LocalMedia>,
    link_events: mpsc::UnboundedSender<LinkEvent>,
    inner: Mutex<RegistryInner>,
}

impl PeerRegistry {
    pub fn new(
        ice: IceConfig,
        factory: Arc<dyn TransportFactory>,
        media: Arc<LocalMedia>,
        link_events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Self {
        Self {
            ice,
            factory,
            media,
            link_events,
            inner: Mutex::new(RegistryInner::default()),
        }
    }

    /// Opens a fresh link to `peer`, closing any prior one first.
    ///
    /// Returns `None` when the peer has been closed or the registry is
    /// shutting down in the meantime; nothing is left open in that case.
    pub async fn open(&self, peer: &ParticipantId) -> Result<Option<u64>> {
        let (prior, generation) = {
            let mut inner = self.inner.lock();
            if inner.shutting_down || inner.closed.contains(peer) {
                return Ok(None);
            }
            inner.next_generation += 1;
            (inner.links.remove(peer), inner.next_generation)
        };
        if let Some(prior) = prior {
            debug!("replacing link to {} (gen {})", peer, prior.generation);
            if let Err(e) = prior.transport.close().await {
                warn!("failed to close prior link to {}: {}", peer, e);
            }
        }

        let tracks = self.media.outbound_tracks();
        let receive_only = tracks.is_empty();
        let events = TransportEvents::new(peer.clone(), generation, self.link_events.clone());
        let transport = self.factory.create(&self.ice, tracks, events).await?;

        let accepted = {
            let mut inner = self.inner.lock();
            if inner.shutting_down || inner.closed.contains(peer) || inner.links.contains_key(peer) {
                false
            } else {
                let pending_candidates = inner.take_early(peer).unwrap_or_default();
                inner.links.insert(
                    peer.clone(),
                    PeerLink {
                        transport: Arc::clone(&transport),
                        generation,
                        state: NegotiationState::Idle,
                        link_state: LinkState::New,
                        remote_stream: None,
                        pending_candidates,
                        remote_description_set: false,
                        held_candidates: Vec::new(),
                        description_sent: false,
                    },
                );
                true
            }
        };
        if !accepted {
            debug!("discarding link to {} (gen {}) opened after close", peer, generation);
            let _ = transport.close().await;
            return Ok(None);
        }

        info!(
            "opened link to {} (gen {}{})",
            peer,
            generation,
            if receive_only { ", receive-only" } else { "" }
        );
        Ok(Some(generation))
    }

    /// Tears down the link to `peer`. No-op for unknown peers.
    pub async fn close(&self, peer: &ParticipantId) -> bool {
        let link = {
            let mut inner = self.inner.lock();
            inner.take_early(peer);
            inner.links.remove(peer)
        };
        let Some(link) = link else {
            return false;
        };
        if let Err(e) = link.transport.close().await {
            warn!("failed to close link to {}: {}", peer, e);
        }
        info!("closed link to {} (gen {})", peer, link.generation);
        true
    }

    /// Closes every link and refuses new ones.
    pub async fn close_all(&self) -> usize {
        let links: Vec<(ParticipantId, PeerLink)> = {
            let mut inner = self.inner.lock();
            inner.shutting_down = true;
            inner.clear_early();
            inner.links.drain().collect()
        };
        let count = links.len();
        join_all(links.into_iter().map(|(peer, link)| async move {
            if let Err(e) = link.transport.close().await {
                warn!("failed to close link to {}: {}", peer, e);
            }
        }))
        .await;
        if count > 0 {
            info!("closed {} peer links", count);
        }
        count
    }

    /// Records `peer` as closed and tears down whatever link it still has.
    /// Links opened concurrently are refused once this returns. Only the
    /// most recent closed peers are remembered.
    pub async fn retire(&self, peer: &ParticipantId) -> bool {
        let link = {
            let mut inner = self.inner.lock();
            inner.tombstone(peer);
            inner.take_early(peer);
            inner.links.remove(peer)
        };
        let Some(link) = link else {
            return false;
        };
        if let Err(e) = link.transport.close().await {
            warn!("failed to close link to {}: {}", peer, e);
        }
        info!("retired link to {} (gen {})", peer, link.generation);
        true
    }

    pub fn revive(&self, peer: &ParticipantId) {
        self.inner.lock().lift_tombstone(peer);
    }

    pub fn is_closed(&self, peer: &ParticipantId) -> bool {
        self.inner.lock().closed.contains(peer)
    }

    pub fn context(&self, peer: &ParticipantId) -> LinkContext {
        let inner = self.inner.lock();
        match inner.links.get(peer) {
            Some(link) => LinkContext {
                state: link.state,
                generation: Some(link.generation),
                remote_description_set: link.remote_description_set,
            },
            None if inner.closed.contains(peer) => LinkContext {
                state: NegotiationState::Closed,
                ..LinkContext::default()
            },
            None => LinkContext::default(),
        }
    }

    pub fn generation(&self, peer: &ParticipantId) -> Option<u64> {
        self.inner.lock().links.get(peer).map(|l| l.generation)
    }

    pub fn is_current(&self, peer: &ParticipantId, generation: u64) -> bool {
        self.generation(peer) == Some(generation)
    }

    pub fn transport(&self, peer: &ParticipantId, generation: u64) -> Option<Arc<dyn PeerTransport>> {
        let inner = self.inner.lock();
        inner
            .links
            .get(peer)
            .filter(|l| l.generation == generation)
            .map(|l| Arc::clone(&l.transport))
    }

    pub fn set_state(&self, peer: &ParticipantId, generation: u64, state: NegotiationState) -> bool {
        let mut inner = self.inner.lock();
        match inner.links.get_mut(peer) {
            Some(link) if link.generation == generation => {
                link.state = state;
                true
            }
            _ => false,
        }
    }

    pub fn set_link_state(&self, peer: &ParticipantId, generation: u64, state: LinkState) -> bool {
        let mut inner = self.inner.lock();
        match inner.links.get_mut(peer) {
            Some(link) if link.generation == generation => {
                link.link_state = state;
                true
            }
            _ => false,
        }
    }

    /// Buffers a candidate that cannot be applied yet, in arrival order.
    pub fn queue_candidate(&self, peer: &ParticipantId, candidate: IceCandidate) {
        let mut inner = self.inner.lock();
        if let Some(link) = inner.links.get_mut(peer) {
            link.pending_candidates.push(candidate);
        } else {
            inner.push_early(peer, candidate);
        }
    }

    pub fn discard_candidates(&self, peer: &ParticipantId) -> usize {
        let mut inner = self.inner.lock();
        let mut dropped = inner.take_early(peer).map_or(0, |c| c.len());
        if let Some(link) = inner.links.get_mut(peer) {
            dropped += link.pending_candidates.len();
            link.pending_candidates.clear();
        }
        dropped
    }

    /// Marks the remote description as set and hands out the queued
    /// candidates. A second call for the same link yields nothing.
    pub fn drain_candidates(&self, peer: &ParticipantId, generation: u64) -> Option<Vec<IceCandidate>> {
        let mut inner = self.inner.lock();
        let link = inner
            .links
            .get_mut(peer)
            .filter(|l| l.generation == generation)?;
        if link.remote_description_set {
            return Some(Vec::new());
        }
        link.remote_description_set = true;
        Some(std::mem::take(&mut link.pending_candidates))
    }

    /// Routes a locally gathered candidate. It goes to `send` right away once
    /// our description is out and is held otherwise, so a peer never sees
    /// candidates for a link before that link's description. Returns false
    /// when the link is gone.
    ///
    /// `send` runs under the registry lock: it must not call back into the
    /// registry.
    pub fn forward_candidate(
        &self,
        peer: &ParticipantId,
        generation: u64,
        candidate: IceCandidate,
        send: impl FnOnce(IceCandidate),
    ) -> bool {
        let mut inner = self.inner.lock();
        let Some(link) = inner
            .links
            .get_mut(peer)
            .filter(|l| l.generation == generation)
        else {
            return false;
        };
        if link.description_sent {
            send(candidate);
        } else {
            link.held_candidates.push(candidate);
        }
        true
    }

    /// Sends our description for this link, then the candidates held until
    /// now, only if the link is still current. Both callbacks run under the
    /// registry lock, so a concurrent close or retire either happens first
    /// and nothing goes out, or happens after everything went out.
    pub fn publish_description(
        &self,
        peer: &ParticipantId,
        generation: u64,
        send_description: impl FnOnce(),
        mut send_candidate: impl FnMut(IceCandidate),
    ) -> bool {
        let mut inner = self.inner.lock();
        let Some(link) = inner
            .links
            .get_mut(peer)
            .filter(|l| l.generation == generation)
        else {
            return false;
        };
        send_description();
        link.description_sent = true;
        for candidate in std::mem::take(&mut link.held_candidates) {
            send_candidate(candidate);
        }
        true
    }

    /// Adds a remote track to the peer's single remote stream.
    pub fn merge_remote_track(
        &self,
        peer: &ParticipantId,
        generation: u64,
        track: RemoteTrack,
    ) -> Option<RemoteStream> {
        let mut inner = self.inner.lock();
        let link = inner
            .links
            .get_mut(peer)
            .filter(|l| l.generation == generation)?;
        let stream = link.remote_stream.get_or_insert_with(|| RemoteStream {
            id: track.stream_id.clone(),
            tracks: Vec::new(),
        });
        if !stream.tracks.iter().any(|t| t.id == track.id) {
            stream.tracks.push(track);
        }
        Some(stream.clone())
    }

    /// Swaps the outbound video on every open link. Returns how many links
    /// took the new track.
    pub async fn replace_outbound_video(&self, track: Option<LocalTrack>) -> usize {
        let transports: Vec<(ParticipantId, Arc<dyn PeerTransport>)> = {
            let inner = self.inner.lock();
            inner
                .links
                .iter()
                .map(|(peer, link)| (peer.clone(), Arc::clone(&link.transport)))
                .collect()
        };
        let mut replaced = 0;
        for (peer, transport) in transports {
            match transport.replace_video_track(track.clone()).await {
                Ok(true) => replaced += 1,
                Ok(false) => debug!("link to {} has no video sender", peer),
                Err(e) => warn!("failed to replace video on link to {}: {}", peer, e),
            }
        }
        replaced
    }

    pub fn snapshot(&self, peer: &ParticipantId) -> Option<PeerSnapshot> {
        let inner = self.inner.lock();
        inner.links.get(peer).map(|link| snapshot_of(peer, link))
    }

    pub fn snapshots(&self) -> Vec<PeerSnapshot> {
        let inner = self.inner.lock();
        let mut snapshots: Vec<PeerSnapshot> = inner
            .links
            .iter()
            .map(|(peer, link)| snapshot_of(peer, link))
            .collect();
        snapshots.sort_by(|a, b| a.peer.cmp(&b.peer));
        snapshots
    }

    pub fn remote_streams(&self) -> HashMap<ParticipantId, RemoteStream> {
        let inner = self.inner.lock();
        inner
            .links
            .iter()
            .filter_map(|(peer, link)| link.remote_stream.clone().map(|s| (peer.clone(), s)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, peer: &ParticipantId) -> bool {
        self.inner.lock().links.contains_key(peer)
    }
}

fn snapshot_of(peer: &ParticipantId, link: &PeerLink) -> PeerSnapshot {
    PeerSnapshot {
        peer: peer.clone(),
        generation: link.generation,
        state: link.state,
        link_state: link.link_state,
        remote_stream: link.remote_stream.clone(),
        pending_candidates: link.pending_candidates.len(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeTransportFactory;

    fn registry(factory: &Arc<FakeTransportFactory>) -> (PeerRegistry, mpsc::UnboundedReceiver<LinkEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let registry = PeerRegistry::new(
            IceConfig::host_only(),
            factory.clone(),
            Arc::new(LocalMedia::new()),
            tx,
        );
        (registry, rx)
    }

    fn candidate(n: u32) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:{n} 1 udp 1 10.0.0.{n} 9 typ host"),
            sdp_mid: Some("0".into()),
            sdp_m_line_index: Some(0),
            username_fragment: None,
        }
    }

    #[tokio::test]
    async fn test_open_replaces_prior_link() {
        let factory = Arc::new(FakeTransportFactory::new("alice"));
        let (registry, _rx) = registry(&factory);
        let bob = ParticipantId::from("bob");

        let first = registry.open(&bob).await.unwrap().unwrap();
        let second = registry.open(&bob).await.unwrap().unwrap();
        assert!(second > first);
        assert_eq!(registry.len(), 1);
        assert_eq!(factory.live_transports(), 1);
        assert!(registry.transport(&bob, first).is_none());
    }

    #[tokio::test]
    async fn test_close_unknown_is_noop() {
        let factory = Arc::new(FakeTransportFactory::new("alice"));
        let (registry, _rx) = registry(&factory);
        assert!(!registry.close(&ParticipantId::from("nobody")).await);
    }

    #[tokio::test]
    async fn test_early_candidates_move_into_link_and_drain_once() {
        let factory = Arc::new(FakeTransportFactory::new("bob"));
        let (registry, _rx) = registry(&factory);
        let alice = ParticipantId::from("alice");

        registry.queue_candidate(&alice, candidate(1));
        registry.queue_candidate(&alice, candidate(2));
        let generation = registry.open(&alice).await.unwrap().unwrap();
        registry.queue_candidate(&alice, candidate(3));
        assert_eq!(registry.snapshot(&alice).unwrap().pending_candidates, 3);

        let drained = registry.drain_candidates(&alice, generation).unwrap();
        assert_eq!(drained, vec![candidate(1), candidate(2), candidate(3)]);
        assert!(registry.context(&alice).remote_description_set);
        assert!(registry.drain_candidates(&alice, generation).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_closed_peer_refuses_open() {
        let factory = Arc::new(FakeTransportFactory::new("alice"));
        let (registry, _rx) = registry(&factory);
        let bob = ParticipantId::from("bob");

        assert!(!registry.retire(&bob).await);
        assert_eq!(registry.context(&bob).state, NegotiationState::Closed);
        assert!(registry.open(&bob).await.unwrap().is_none());
        assert_eq!(factory.live_transports(), 0);

        registry.revive(&bob);
        assert!(registry.open(&bob).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_retire_closes_live_link() {
        let factory = Arc::new(FakeTransportFactory::new("alice"));
        let (registry, _rx) = registry(&factory);
        let bob = ParticipantId::from("bob");
        registry.open(&bob).await.unwrap();

        assert!(registry.retire(&bob).await);
        assert!(!registry.contains(&bob));
        assert!(registry.is_closed(&bob));
        assert_eq!(factory.live_transports(), 0);
    }

    #[tokio::test]
    async fn test_close_all_refuses_new_links() {
        let factory = Arc::new(FakeTransportFactory::new("alice"));
        let (registry, _rx) = registry(&factory);
        registry.open(&"bob".into()).await.unwrap();
        registry.open(&"carol".into()).await.unwrap();

        assert_eq!(registry.close_all().await, 2);
        assert!(registry.is_empty());
        assert_eq!(factory.live_transports(), 0);
        assert!(registry.open(&"dave".into()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_local_candidates_wait_for_description() {
        let factory = Arc::new(FakeTransportFactory::new("alice"));
        let (registry, _rx) = registry(&factory);
        let bob = ParticipantId::from("bob");
        let generation = registry.open(&bob).await.unwrap().unwrap();
        let sent = Mutex::new(Vec::new());
        let record = |c: IceCandidate| sent.lock().push(c.candidate);

        assert!(registry.forward_candidate(&bob, generation, candidate(1), record));
        assert!(!registry.forward_candidate(&bob, generation + 1, candidate(2), record));
        assert!(sent.lock().is_empty());

        assert!(registry.publish_description(
            &bob,
            generation,
            || sent.lock().push("offer".into()),
            record
        ));
        assert!(registry.forward_candidate(&bob, generation, candidate(3), record));
        assert_eq!(
            *sent.lock(),
            vec!["offer".to_string(), candidate(1).candidate, candidate(3).candidate]
        );
    }

    #[tokio::test]
    async fn test_nothing_published_for_retired_link() {
        let factory = Arc::new(FakeTransportFactory::new("alice"));
        let (registry, _rx) = registry(&factory);
        let bob = ParticipantId::from("bob");
        let generation = registry.open(&bob).await.unwrap().unwrap();
        let sent = Mutex::new(Vec::<String>::new());
        assert!(registry.forward_candidate(&bob, generation, candidate(1), |c| {
            sent.lock().push(c.candidate)
        }));

        registry.retire(&bob).await;
        assert!(!registry.publish_description(
            &bob,
            generation,
            || sent.lock().push("offer".into()),
            |c| sent.lock().push(c.candidate),
        ));
        assert!(sent.lock().is_empty());
    }

    #[tokio::test]
    async fn test_tombstones_are_bounded() {
        let factory = Arc::new(FakeTransportFactory::new("alice"));
        let (registry, _rx) = registry(&factory);
        for n in 0..=MAX_TOMBSTONES {
            registry.retire(&ParticipantId::new(format!("gone-{n}"))).await;
        }
        assert!(!registry.is_closed(&"gone-0".into()));
        assert!(registry.is_closed(&"gone-1".into()));
        assert!(registry.is_closed(&ParticipantId::new(format!("gone-{MAX_TOMBSTONES}"))));

        registry.revive(&"gone-1".into());
        registry.retire(&"gone-1".into()).await;
        assert!(registry.is_closed(&"gone-1".into()));
    }

    #[tokio::test]
    async fn test_early_candidates_from_strangers_are_bounded() {
        let factory = Arc::new(FakeTransportFactory::new("alice"));
        let (registry, _rx) = registry(&factory);
        for n in 0..=MAX_EARLY_PEERS {
            registry.queue_candidate(&ParticipantId::new(format!("stranger-{n}")), candidate(1));
        }
        registry.queue_candidate(&"stranger-1".into(), candidate(2));

        assert_eq!(registry.discard_candidates(&"stranger-0".into()), 0);
        assert_eq!(registry.discard_candidates(&"stranger-1".into()), 2);
        let last = ParticipantId::new(format!("stranger-{MAX_EARLY_PEERS}"));
        assert_eq!(registry.discard_candidates(&last), 1);
    }

    #[tokio::test]
    async fn test_remote_tracks_merge_into_one_stream() {
        let factory = Arc::new(FakeTransportFactory::new("alice"));
        let (registry, _rx) = registry(&factory);
        let bob = ParticipantId::from("bob");
        let generation = registry.open(&bob).await.unwrap().unwrap();

        let track = |id: &str, kind| RemoteTrack {
            id: id.into(),
            stream_id: "bob-stream".into(),
            kind,
            rtc: None,
        };
        registry.merge_remote_track(&bob, generation, track("mic", TrackKind::Audio));
        registry.merge_remote_track(&bob, generation, track("cam", TrackKind::Video));
        let stream = registry
            .merge_remote_track(&bob, generation, track("cam", TrackKind::Video))
            .unwrap();
        assert_eq!(stream.tracks.len(), 2);
        assert!(stream.has_kind(TrackKind::Audio));
        assert!(registry
            .merge_remote_track(&bob, generation + 1, track("x", TrackKind::Audio))
            .is_none());
    }
}
