//! Per-peer negotiation state machine.
//!
//! [`transition`] is pure: it maps the current link context and one input to
//! the next state plus a list of effects. The engine executes the effects in
//! order against the registry and the signaling channel.

use rally_common::{IceCandidate, ParticipantId, SessionDescription};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NegotiationState {
    #[default]
    Idle,
    OfferSent,
    OfferReceived,
    Answered,
    Connected,
    Closed,
}

/// True when `local` must send the offer to `remote`.
///
/// Both sides compute this with their roles swapped and always disagree,
/// so exactly one of them offers.
pub fn is_initiator(local: &ParticipantId, remote: &ParticipantId) -> bool {
    local < remote
}

/// What the state machine may know about a peer's link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LinkContext {
    pub state: NegotiationState,
    /// Generation of the live link, if any.
    pub generation: Option<u64>,
    pub remote_description_set: bool,
}

impl LinkContext {
    pub fn has_link(&self) -> bool {
        self.generation.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiationInput {
    PeerJoined,
    PeerLeft,
    OfferReceived(SessionDescription),
    AnswerReceived(SessionDescription),
    CandidateReceived(IceCandidate),
    TransportConnected,
    TransportFailed,
    NegotiationFailed(String),
}

impl NegotiationInput {
    pub fn label(&self) -> &'static str {
        match self {
            Self::PeerJoined => "peer-joined",
            Self::PeerLeft => "peer-left",
            Self::OfferReceived(_) => "offer",
            Self::AnswerReceived(_) => "answer",
            Self::CandidateReceived(_) => "ice-candidate",
            Self::TransportConnected => "transport-connected",
            Self::TransportFailed => "transport-failed",
            Self::NegotiationFailed(_) => "negotiation-failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Close and discard the current link.
    CloseLink,
    /// Open a fresh link carrying the current outbound tracks.
    OpenLink,
    /// Create an offer, set it locally and send it.
    SendOffer,
    /// Set the offer remotely, create an answer, set it locally and send it.
    AnswerOffer(SessionDescription),
    /// Set the answer remotely.
    ApplyAnswer(SessionDescription),
    ApplyCandidate(IceCandidate),
    QueueCandidate(IceCandidate),
    /// Mark the remote description set and apply everything queued so far.
    DrainCandidates,
    DiscardCandidates,
    /// Tell the session owner the peer's link is gone.
    NotifyClosed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub next: NegotiationState,
    pub effects: Vec<Effect>,
}

impl Transition {
    fn to(next: NegotiationState, effects: Vec<Effect>) -> Self {
        Self { next, effects }
    }

    fn stay(ctx: &LinkContext) -> Self {
        Self {
            next: ctx.state,
            effects: Vec::new(),
        }
    }

    pub fn is_noop(&self, ctx: &LinkContext) -> bool {
        self.effects.is_empty() && self.next == ctx.state
    }
}

pub fn transition(
    local: &ParticipantId,
    remote: &ParticipantId,
    ctx: &LinkContext,
    input: NegotiationInput,
) -> Transition {
    use NegotiationState::*;

    match input {
        NegotiationInput::PeerJoined => {
            let fresh = ctx.state == Closed || (ctx.state == Idle && !ctx.has_link());
            if !is_initiator(local, remote) {
                // The initiator may never see this duplicate, so tearing our
                // link down would leave the pair split. Keep it; a new offer
                // replaces it.
                return if fresh {
                    Transition::to(Idle, Vec::new())
                } else {
                    Transition::stay(ctx)
                };
            }
            let mut effects = Vec::new();
            if !fresh {
                // Duplicate presence: never layer on top of stale state.
                effects.push(Effect::CloseLink);
                effects.push(Effect::DiscardCandidates);
            }
            effects.push(Effect::OpenLink);
            effects.push(Effect::SendOffer);
            Transition::to(OfferSent, effects)
        }

        NegotiationInput::PeerLeft => match ctx.state {
            Closed => Transition::stay(ctx),
            _ if ctx.has_link() => Transition::to(
                Closed,
                vec![
                    Effect::CloseLink,
                    Effect::DiscardCandidates,
                    Effect::NotifyClosed,
                ],
            ),
            _ => Transition::to(Closed, vec![Effect::DiscardCandidates]),
        },

        NegotiationInput::TransportFailed | NegotiationInput::NegotiationFailed(_) => {
            if ctx.state == Closed || !ctx.has_link() {
                return Transition::stay(ctx);
            }
            Transition::to(
                Closed,
                vec![
                    Effect::CloseLink,
                    Effect::DiscardCandidates,
                    Effect::NotifyClosed,
                ],
            )
        }

        NegotiationInput::OfferReceived(offer) => match ctx.state {
            Closed => Transition::stay(ctx),
            // Glare: our own offer wins.
            OfferSent if is_initiator(local, remote) => Transition::stay(ctx),
            Idle if !ctx.has_link() => Transition::to(
                Answered,
                vec![
                    Effect::OpenLink,
                    Effect::AnswerOffer(offer),
                    Effect::DrainCandidates,
                ],
            ),
            Idle => Transition::to(
                Answered,
                vec![Effect::AnswerOffer(offer), Effect::DrainCandidates],
            ),
            _ => Transition::to(
                Answered,
                vec![
                    Effect::CloseLink,
                    Effect::OpenLink,
                    Effect::AnswerOffer(offer),
                    Effect::DrainCandidates,
                ],
            ),
        },

        NegotiationInput::AnswerReceived(answer) => match ctx.state {
            OfferSent if ctx.has_link() => Transition::to(
                Answered,
                vec![Effect::ApplyAnswer(answer), Effect::DrainCandidates],
            ),
            _ => Transition::stay(ctx),
        },

        NegotiationInput::CandidateReceived(candidate) => match ctx.state {
            Closed => Transition::stay(ctx),
            _ if ctx.has_link() && ctx.remote_description_set => {
                Transition::to(ctx.state, vec![Effect::ApplyCandidate(candidate)])
            }
            _ => Transition::to(ctx.state, vec![Effect::QueueCandidate(candidate)]),
        },

        NegotiationInput::TransportConnected => match ctx.state {
            OfferReceived | Answered if ctx.has_link() => Transition::to(Connected, Vec::new()),
            _ => Transition::stay(ctx),
        },
    }
}
