//! Negotiation engine.
//!
//! One event loop per session consumes signaling/presence events and
//! transport callbacks. Inputs for a peer are handed to that peer's worker
//! task and processed strictly in order; distinct peers negotiate
//! concurrently. Departures and transport failures skip the queue: the
//! peer's worker is aborted and the close runs on the loop itself.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::{AbortHandle, JoinSet};
use tracing::{debug, error, info, trace, warn};

use rally_common::{Error, IceCandidate, ParticipantId, Result, SignalMessage};

use crate::negotiation::{transition, Effect, LinkContext, NegotiationInput, NegotiationState};
use crate::registry::PeerRegistry;
use crate::session::SessionEvent;
use crate::signaling::{ChannelEvent, SignalingChannel, SignalingEvents};
use crate::transport::{LinkEvent, LinkState, PeerTransport, TransportEvent};

enum Outcome {
    /// Effects ran; the link (if any) has this generation.
    Done(Option<u64>),
    /// The link was replaced or closed underneath the step.
    Stale,
}

struct Worker {
    tx: mpsc::UnboundedSender<NegotiationInput>,
    abort: AbortHandle,
}

pub(crate) struct EngineShared {
    local: ParticipantId,
    registry: Arc<PeerRegistry>,
    channel: Arc<SignalingChannel>,
    events: broadcast::Sender<SessionEvent>,
}

impl EngineShared {
    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn send(&self, message: SignalMessage) {
        if let Err(e) = self.channel.send(&message) {
            warn!(
                "failed to send {} to {:?}: {}",
                message.kind(),
                message.recipient().map(ParticipantId::as_str),
                e
            );
        }
    }

    /// Sends our offer or answer and the candidates gathered while it was in
    /// flight. False when the link was closed first; nothing is sent then.
    fn publish(&self, peer: &ParticipantId, generation: u64, description: SignalMessage) -> bool {
        self.registry.publish_description(
            peer,
            generation,
            || self.send(description),
            |candidate| self.send_candidate(peer, candidate),
        )
    }

    fn send_candidate(&self, peer: &ParticipantId, candidate: IceCandidate) {
        self.send(SignalMessage::IceCandidate {
            from: self.local.clone(),
            to: Some(peer.clone()),
            data: candidate,
        });
    }

    fn current(&self, peer: &ParticipantId, generation: Option<u64>) -> Option<(u64, Arc<dyn PeerTransport>)> {
        let generation = generation?;
        self.registry
            .transport(peer, generation)
            .map(|transport| (generation, transport))
    }

    fn is_stale(&self, peer: &ParticipantId, generation: u64) -> bool {
        !self.registry.is_current(peer, generation)
    }

    /// Runs one input to completion for `peer`.
    async fn step(&self, peer: &ParticipantId, input: NegotiationInput) {
        let mut input = input;
        loop {
            let ctx = self.registry.context(peer);
            let label = input.label();
            let t = transition(&self.local, peer, &ctx, input);
            if t.is_noop(&ctx) {
                trace!("{}: {} ignored in {:?}", peer, label, ctx.state);
                return;
            }
            if ctx.state == NegotiationState::Closed && t.next != NegotiationState::Closed {
                self.registry.revive(peer);
            }

            match self.execute(peer, &ctx, t.effects).await {
                Ok(Outcome::Done(generation)) => {
                    self.commit(peer, ctx.state, t.next, generation).await;
                    return;
                }
                Ok(Outcome::Stale) => {
                    debug!("{}: {} superseded by a newer link", peer, label);
                    return;
                }
                Err(e) => {
                    if e.is_peer_scoped() {
                        warn!("{}: {} failed: {}", peer, label, e);
                    } else {
                        error!("{}: {} failed: {}", peer, label, e);
                    }
                    input = NegotiationInput::NegotiationFailed(e.to_string());
                }
            }
        }
    }

    async fn execute(&self, peer: &ParticipantId, ctx: &LinkContext, effects: Vec<Effect>) -> Result<Outcome> {
        let mut generation = ctx.generation;

        for effect in effects {
            match effect {
                Effect::CloseLink => {
                    self.registry.close(peer).await;
                    generation = None;
                }
                Effect::OpenLink => match self.registry.open(peer).await? {
                    Some(opened) => generation = Some(opened),
                    None => return Ok(Outcome::Stale),
                },
                Effect::SendOffer => {
                    let Some((generation, transport)) = self.current(peer, generation) else {
                        return Ok(Outcome::Stale);
                    };
                    let offer = transport.create_offer().await?;
                    if self.is_stale(peer, generation) {
                        return Ok(Outcome::Stale);
                    }
                    transport.set_local_description(offer.clone()).await?;
                    if self.is_stale(peer, generation) {
                        return Ok(Outcome::Stale);
                    }
                    let offer = SignalMessage::Offer {
                        from: self.local.clone(),
                        to: Some(peer.clone()),
                        data: offer,
                    };
                    if !self.publish(peer, generation, offer) {
                        return Ok(Outcome::Stale);
                    }
                    info!("sent offer to {}", peer);
                }
                Effect::AnswerOffer(offer) => {
                    let Some((generation, transport)) = self.current(peer, generation) else {
                        return Ok(Outcome::Stale);
                    };
                    self.registry
                        .set_state(peer, generation, NegotiationState::OfferReceived);
                    transport.set_remote_description(offer).await?;
                    if self.is_stale(peer, generation) {
                        return Ok(Outcome::Stale);
                    }
                    let answer = transport.create_answer().await?;
                    if self.is_stale(peer, generation) {
                        return Ok(Outcome::Stale);
                    }
                    transport.set_local_description(answer.clone()).await?;
                    if self.is_stale(peer, generation) {
                        return Ok(Outcome::Stale);
                    }
                    let answer = SignalMessage::Answer {
                        from: self.local.clone(),
                        to: Some(peer.clone()),
                        data: answer,
                    };
                    if !self.publish(peer, generation, answer) {
                        return Ok(Outcome::Stale);
                    }
                    info!("sent answer to {}", peer);
                }
                Effect::ApplyAnswer(answer) => {
                    let Some((generation, transport)) = self.current(peer, generation) else {
                        return Ok(Outcome::Stale);
                    };
                    transport.set_remote_description(answer).await?;
                    if self.is_stale(peer, generation) {
                        return Ok(Outcome::Stale);
                    }
                    debug!("applied answer from {}", peer);
                }
                Effect::ApplyCandidate(candidate) => {
                    let Some((generation, transport)) = self.current(peer, generation) else {
                        return Ok(Outcome::Stale);
                    };
                    if let Err(e) = transport.add_ice_candidate(candidate).await {
                        warn!("{}: candidate rejected: {}", peer, e);
                    }
                    if self.is_stale(peer, generation) {
                        return Ok(Outcome::Stale);
                    }
                }
                Effect::QueueCandidate(candidate) => {
                    trace!("{}: queueing early candidate", peer);
                    self.registry.queue_candidate(peer, candidate);
                }
                Effect::DrainCandidates => {
                    let Some((generation, transport)) = self.current(peer, generation) else {
                        return Ok(Outcome::Stale);
                    };
                    let Some(queued) = self.registry.drain_candidates(peer, generation) else {
                        return Ok(Outcome::Stale);
                    };
                    if !queued.is_empty() {
                        debug!("{}: applying {} buffered candidates", peer, queued.len());
                    }
                    for candidate in queued {
                        if let Err(e) = transport.add_ice_candidate(candidate).await {
                            warn!("{}: buffered candidate rejected: {}", peer, e);
                        }
                        if self.is_stale(peer, generation) {
                            return Ok(Outcome::Stale);
                        }
                    }
                }
                Effect::DiscardCandidates => {
                    let dropped = self.registry.discard_candidates(peer);
                    if dropped > 0 {
                        debug!("{}: discarded {} queued candidates", peer, dropped);
                    }
                }
                Effect::NotifyClosed => self.emit(SessionEvent::PeerClosed { peer: peer.clone() }),
            }
        }
        Ok(Outcome::Done(generation))
    }

    async fn commit(
        &self,
        peer: &ParticipantId,
        previous: NegotiationState,
        next: NegotiationState,
        generation: Option<u64>,
    ) {
        match (next, generation) {
            (NegotiationState::Closed, _) => {
                self.registry.retire(peer).await;
            }
            (state, Some(generation)) => {
                if !self.registry.set_state(peer, generation, state) {
                    debug!("{}: link replaced before reaching {:?}", peer, state);
                    return;
                }
            }
            (_, None) => {}
        }
        if previous != next {
            info!("{}: {:?} -> {:?}", peer, previous, next);
            self.emit(SessionEvent::PeerStateChanged {
                peer: peer.clone(),
                state: next,
            });
        }
    }
}

pub struct NegotiationEngine {
    shared: Arc<EngineShared>,
    workers: HashMap<ParticipantId, Worker>,
    tasks: JoinSet<()>,
}

fn signal_input(message: SignalMessage) -> (ParticipantId, NegotiationInput) {
    match message {
        SignalMessage::Offer { from, data, .. } => (from, NegotiationInput::OfferReceived(data)),
        SignalMessage::Answer { from, data, .. } => (from, NegotiationInput::AnswerReceived(data)),
        SignalMessage::IceCandidate { from, data, .. } => {
            (from, NegotiationInput::CandidateReceived(data))
        }
    }
}

impl NegotiationEngine {
    pub fn new(
        local: ParticipantId,
        registry: Arc<PeerRegistry>,
        channel: Arc<SignalingChannel>,
        events: broadcast::Sender<SessionEvent>,
    ) -> Self {
        Self {
            shared: Arc::new(EngineShared {
                local,
                registry,
                channel,
                events,
            }),
            workers: HashMap::new(),
            tasks: JoinSet::new(),
        }
    }

    /// Drives negotiation until `stop` fires or the signaling subscription
    /// ends. No worker is left running when this returns.
    pub async fn run(
        mut self,
        mut signals: SignalingEvents,
        mut link_events: mpsc::UnboundedReceiver<LinkEvent>,
        mut stop: oneshot::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                _ = &mut stop => {
                    debug!("negotiation engine stopping");
                    self.workers.clear();
                    self.tasks.shutdown().await;
                    return;
                }
                event = signals.recv() => match event {
                    Some(ChannelEvent::Joined(peer)) => {
                        debug!("presence: {} joined", peer);
                        self.dispatch(peer, NegotiationInput::PeerJoined);
                    }
                    Some(ChannelEvent::Left(peer)) => {
                        debug!("presence: {} left", peer);
                        self.preempt(&peer, NegotiationInput::PeerLeft).await;
                    }
                    Some(ChannelEvent::Signal(message)) => {
                        trace!("{} from {}", message.kind(), message.sender());
                        let (peer, input) = signal_input(message);
                        self.dispatch(peer, input);
                    }
                    None => {
                        error!("signaling subscription lost");
                        self.shutdown().await;
                        self.shared.emit(SessionEvent::SignalingLost);
                        return;
                    }
                },
                Some(event) = link_events.recv() => self.on_link_event(event).await,
                Some(result) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    if let Err(e) = result {
                        if e.is_panic() {
                            error!("negotiation worker panicked: {}", e);
                        }
                    }
                }
            }
        }
    }

    async fn shutdown(&mut self) {
        self.workers.clear();
        self.tasks.shutdown().await;
        self.shared.registry.close_all().await;
    }

    /// Queues `input` behind whatever the peer's worker is doing.
    fn dispatch(&mut self, peer: ParticipantId, input: NegotiationInput) {
        let input = match self.workers.get(&peer) {
            Some(worker) => match worker.tx.send(input) {
                Ok(()) => return,
                Err(mpsc::error::SendError(input)) => input,
            },
            None => input,
        };

        let (tx, mut rx) = mpsc::unbounded_channel();
        let shared = Arc::clone(&self.shared);
        let worker_peer = peer.clone();
        let abort = self.tasks.spawn(async move {
            while let Some(input) = rx.recv().await {
                shared.step(&worker_peer, input).await;
            }
        });
        let _ = tx.send(input);
        self.workers.insert(peer, Worker { tx, abort });
    }

    /// Cancels the peer's queued and in-flight work and runs `input` now.
    async fn preempt(&mut self, peer: &ParticipantId, input: NegotiationInput) {
        if let Some(worker) = self.workers.remove(peer) {
            worker.abort.abort();
        }
        self.shared.step(peer, input).await;
    }

    async fn on_link_event(&mut self, event: LinkEvent) {
        let LinkEvent {
            peer,
            generation,
            event,
        } = event;
        let registry = Arc::clone(&self.shared.registry);
        if !registry.is_current(&peer, generation) {
            trace!("dropping event from stale link to {} (gen {})", peer, generation);
            return;
        }

        match event {
            TransportEvent::LocalCandidate(candidate) => {
                let shared = &self.shared;
                registry.forward_candidate(&peer, generation, candidate, |candidate| {
                    shared.send_candidate(&peer, candidate)
                });
            }
            TransportEvent::RemoteTrack(track) => {
                if let Some(stream) = registry.merge_remote_track(&peer, generation, track) {
                    self.shared.emit(SessionEvent::RemoteStream { peer, stream });
                }
            }
            TransportEvent::StateChanged(state) => {
                registry.set_link_state(&peer, generation, state);
                self.shared.emit(SessionEvent::PeerLinkState {
                    peer: peer.clone(),
                    state,
                });
                if state == LinkState::Connected {
                    self.dispatch(peer, NegotiationInput::TransportConnected);
                } else if state.is_degraded() {
                    let err = Error::transport_degraded(format!("link to {peer} is {state:?}"));
                    warn!("{} (gen {})", err, generation);
                    self.preempt(&peer, NegotiationInput::TransportFailed).await;
                }
            }
        }
    }
}

impl Drop for NegotiationEngine {
    fn drop(&mut self) {
        self.tasks.abort_all();
    }
}
