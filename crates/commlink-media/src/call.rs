//! One-to-one call state machine.
//!
//! The machine is sans-IO. Frames go straight out through the
//! [`FrameSink`] it is handed; every asynchronous step (capture, building
//! the peer connection, creating or applying descriptions, timers) is
//! returned as a [`CallEffect`] for the caller to run, and its outcome comes
//! back through [`CallMachine::on_completion`] tagged with the epoch it was
//! issued under. The epoch changes whenever a call starts or ends, so a late
//! completion from a previous call is recognised and only releases whatever
//! handle it carries.

use std::fmt;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use commlink_shared::error::{MediaError, SignalingError};
use commlink_shared::protocol::{FrameSink, IceCandidate, OutboundFrame};
use commlink_shared::types::UserId;

use crate::peer::{LocalMediaHandle, PeerEvent, PeerLinkHandle};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    #[error("You cannot call yourself")]
    SelfCall,

    #[error("Invalid user id: {0}")]
    InvalidPeer(UserId),

    #[error("Already in a call")]
    AlreadyInCall,

    #[error("Not connected")]
    NotConnected,

    #[error("No incoming call")]
    NoIncomingCall,

    #[error("Not in a call")]
    NotInCall,

    #[error("Media error: {0}")]
    Media(#[from] MediaError),

    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),

    #[error("Call was not answered in time")]
    SetupTimeout,

    #[error("Connection lost during call")]
    TransportLost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallRole {
    Caller,
    Callee,
}

/// Externally visible phase of the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallPhaseKind {
    Idle,
    Inviting,
    RingingIncoming,
    AwaitingLocalMedia,
    Negotiating,
    Active,
    /// Reported while resources are released; the machine is Idle again
    /// before the handler returns.
    Ending,
}

impl fmt::Display for CallPhaseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Inviting => "inviting",
            Self::RingingIncoming => "ringing",
            Self::AwaitingLocalMedia => "awaiting local media",
            Self::Negotiating => "negotiating",
            Self::Active => "active",
            Self::Ending => "ending",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndReason {
    LocalHangup,
    Declined,
    RemoteEnded,
    TransportLost,
    Failed(CallError),
}

/// Things the presentation layer should hear about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallNotice {
    PhaseChanged {
        phase: CallPhaseKind,
        peer: Option<UserId>,
    },
    IncomingCall {
        from: UserId,
    },
    Ended {
        peer: UserId,
        reason: EndReason,
    },
}

/// Work the machine needs done outside of its own handler.
pub enum CallEffect {
    AcquireMedia {
        epoch: u64,
    },
    OpenPeer {
        epoch: u64,
        media: LocalMediaHandle,
    },
    CreateOffer {
        epoch: u64,
        link: PeerLinkHandle,
    },
    AcceptOffer {
        epoch: u64,
        link: PeerLinkHandle,
        sdp: String,
    },
    ApplyAnswer {
        epoch: u64,
        link: PeerLinkHandle,
        sdp: String,
    },
    AddCandidate {
        epoch: u64,
        link: PeerLinkHandle,
        candidate: IceCandidate,
    },
    ClosePeer {
        link: PeerLinkHandle,
    },
    ArmSetupTimer {
        epoch: u64,
        after: Duration,
    },
    Notify(CallNotice),
}

impl fmt::Debug for CallEffect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AcquireMedia { epoch } => write!(f, "AcquireMedia({epoch})"),
            Self::OpenPeer { epoch, .. } => write!(f, "OpenPeer({epoch})"),
            Self::CreateOffer { epoch, .. } => write!(f, "CreateOffer({epoch})"),
            Self::AcceptOffer { epoch, .. } => write!(f, "AcceptOffer({epoch})"),
            Self::ApplyAnswer { epoch, .. } => write!(f, "ApplyAnswer({epoch})"),
            Self::AddCandidate {
                epoch, candidate, ..
            } => write!(f, "AddCandidate({epoch}, {})", candidate.candidate),
            Self::ClosePeer { .. } => f.write_str("ClosePeer"),
            Self::ArmSetupTimer { epoch, after } => write!(f, "ArmSetupTimer({epoch}, {after:?})"),
            Self::Notify(notice) => write!(f, "Notify({notice:?})"),
        }
    }
}

/// Outcome of a [`CallEffect`], fed back into the machine.
pub enum CallCompletion {
    MediaAcquired {
        epoch: u64,
        result: Result<LocalMediaHandle, MediaError>,
    },
    PeerOpened {
        epoch: u64,
        result: Result<PeerLinkHandle, MediaError>,
    },
    OfferCreated {
        epoch: u64,
        result: Result<String, MediaError>,
    },
    OfferAccepted {
        epoch: u64,
        result: Result<String, MediaError>,
    },
    AnswerApplied {
        epoch: u64,
        result: Result<(), MediaError>,
    },
    CandidateApplied {
        epoch: u64,
        result: Result<(), MediaError>,
    },
    Peer {
        epoch: u64,
        event: PeerEvent,
    },
    SetupTimeout {
        epoch: u64,
    },
}

impl CallCompletion {
    pub fn epoch(&self) -> u64 {
        match self {
            Self::MediaAcquired { epoch, .. }
            | Self::PeerOpened { epoch, .. }
            | Self::OfferCreated { epoch, .. }
            | Self::OfferAccepted { epoch, .. }
            | Self::AnswerApplied { epoch, .. }
            | Self::CandidateApplied { epoch, .. }
            | Self::Peer { epoch, .. }
            | Self::SetupTimeout { epoch } => *epoch,
        }
    }
}

impl fmt::Debug for CallCompletion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::MediaAcquired { .. } => "MediaAcquired",
            Self::PeerOpened { .. } => "PeerOpened",
            Self::OfferCreated { .. } => "OfferCreated",
            Self::OfferAccepted { .. } => "OfferAccepted",
            Self::AnswerApplied { .. } => "AnswerApplied",
            Self::CandidateApplied { .. } => "CandidateApplied",
            Self::Peer { .. } => "Peer",
            Self::SetupTimeout { .. } => "SetupTimeout",
        };
        write!(f, "{name}({})", self.epoch())
    }
}

/// Negotiation bookkeeping, alive from local media ready until the call ends.
struct Negotiation {
    peer: UserId,
    role: CallRole,
    media: LocalMediaHandle,
    link: Option<PeerLinkHandle>,
    /// Offer received before the peer connection existed (callee only).
    pending_offer: Option<String>,
    local_description_sent: bool,
    remote_op_in_flight: bool,
    remote_description_applied: bool,
    pending_remote_candidates: Vec<IceCandidate>,
    pending_local_candidates: Vec<IceCandidate>,
    candidates_applied: usize,
}

impl Negotiation {
    fn new(
        peer: UserId,
        role: CallRole,
        media: LocalMediaHandle,
        pending_offer: Option<String>,
    ) -> Self {
        Self {
            peer,
            role,
            media,
            link: None,
            pending_offer,
            local_description_sent: false,
            remote_op_in_flight: false,
            remote_description_applied: false,
            pending_remote_candidates: Vec::new(),
            pending_local_candidates: Vec::new(),
            candidates_applied: 0,
        }
    }

    /// Both descriptions are in place and at least one candidate relayed by
    /// the peer was accepted. A `Connected` report from the peer connection
    /// alone does not count.
    fn is_established(&self) -> bool {
        self.remote_description_applied && self.candidates_applied > 0
    }
}

enum Phase {
    Idle,
    Ringing {
        peer: UserId,
        pending_offer: Option<String>,
    },
    AwaitingLocalMedia {
        peer: UserId,
        role: CallRole,
        pending_offer: Option<String>,
    },
    Negotiating(Negotiation),
    Active(Negotiation),
}

impl Phase {
    fn kind(&self) -> CallPhaseKind {
        match self {
            Phase::Idle => CallPhaseKind::Idle,
            Phase::Ringing { .. } => CallPhaseKind::RingingIncoming,
            Phase::AwaitingLocalMedia { .. } => CallPhaseKind::AwaitingLocalMedia,
            Phase::Negotiating(_) => CallPhaseKind::Negotiating,
            Phase::Active(_) => CallPhaseKind::Active,
        }
    }

    fn peer(&self) -> Option<UserId> {
        match self {
            Phase::Idle => None,
            Phase::Ringing { peer, .. } | Phase::AwaitingLocalMedia { peer, .. } => Some(*peer),
            Phase::Negotiating(n) | Phase::Active(n) => Some(n.peer),
        }
    }

    fn role(&self) -> Option<CallRole> {
        match self {
            Phase::Idle => None,
            Phase::Ringing { .. } => Some(CallRole::Callee),
            Phase::AwaitingLocalMedia { role, .. } => Some(*role),
            Phase::Negotiating(n) | Phase::Active(n) => Some(n.role),
        }
    }

    fn negotiation_mut(&mut self) -> Option<&mut Negotiation> {
        match self {
            Phase::Negotiating(n) | Phase::Active(n) => Some(n),
            _ => None,
        }
    }
}

pub struct CallMachine {
    local: UserId,
    setup_timeout: Option<Duration>,
    phase: Phase,
    epoch: u64,
    audio_enabled: bool,
    video_enabled: bool,
}

impl CallMachine {
    pub fn new(local: UserId, setup_timeout: Option<Duration>) -> Self {
        Self {
            local,
            setup_timeout,
            phase: Phase::Idle,
            epoch: 0,
            audio_enabled: true,
            video_enabled: true,
        }
    }

    pub fn phase(&self) -> CallPhaseKind {
        self.phase.kind()
    }

    pub fn peer(&self) -> Option<UserId> {
        self.phase.peer()
    }

    pub fn role(&self) -> Option<CallRole> {
        self.phase.role()
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.phase, Phase::Idle)
    }

    pub fn audio_enabled(&self) -> bool {
        self.audio_enabled
    }

    pub fn video_enabled(&self) -> bool {
        self.video_enabled
    }

    /// Invite `peer`. The invite goes out before local media is requested.
    pub fn start_call(
        &mut self,
        peer: UserId,
        sink: &dyn FrameSink,
    ) -> Result<Vec<CallEffect>, CallError> {
        if peer == self.local {
            return Err(CallError::SelfCall);
        }
        if !peer.is_valid() {
            return Err(CallError::InvalidPeer(peer));
        }
        if !self.is_idle() {
            return Err(CallError::AlreadyInCall);
        }
        if !sink.is_open() {
            return Err(CallError::NotConnected);
        }

        sink.send_frame(&OutboundFrame::CallInvite { target_id: peer })
            .map_err(|e| {
                warn!(peer = %peer, error = %e, "Call invite not sent");
                CallError::NotConnected
            })?;

        self.epoch += 1;
        self.reset_toggles();
        info!(peer = %peer, epoch = self.epoch, "Calling");

        let mut effects = vec![CallEffect::Notify(CallNotice::PhaseChanged {
            phase: CallPhaseKind::Inviting,
            peer: Some(peer),
        })];
        self.phase = Phase::AwaitingLocalMedia {
            peer,
            role: CallRole::Caller,
            pending_offer: None,
        };
        effects.push(self.phase_notice());
        effects.push(CallEffect::AcquireMedia { epoch: self.epoch });
        if let Some(after) = self.setup_timeout {
            effects.push(CallEffect::ArmSetupTimer {
                epoch: self.epoch,
                after,
            });
        }
        Ok(effects)
    }

    pub fn accept(&mut self, sink: &dyn FrameSink) -> Result<Vec<CallEffect>, CallError> {
        let Phase::Ringing { peer, pending_offer } = &mut self.phase else {
            return Err(CallError::NoIncomingCall);
        };
        if !sink.is_open() {
            return Err(CallError::NotConnected);
        }

        let peer = *peer;
        let pending_offer = pending_offer.take();
        info!(peer = %peer, "Accepting call");

        self.reset_toggles();
        self.phase = Phase::AwaitingLocalMedia {
            peer,
            role: CallRole::Callee,
            pending_offer,
        };

        let mut effects = vec![
            self.phase_notice(),
            CallEffect::AcquireMedia { epoch: self.epoch },
        ];
        if let Some(after) = self.setup_timeout {
            effects.push(CallEffect::ArmSetupTimer {
                epoch: self.epoch,
                after,
            });
        }
        Ok(effects)
    }

    pub fn decline(&mut self, sink: &dyn FrameSink) -> Result<Vec<CallEffect>, CallError> {
        if !matches!(self.phase, Phase::Ringing { .. }) {
            return Err(CallError::NoIncomingCall);
        }
        info!(peer = ?self.peer(), "Declining call");
        Ok(self.end(sink, true, EndReason::Declined))
    }

    pub fn hang_up(&mut self, sink: &dyn FrameSink) -> Result<Vec<CallEffect>, CallError> {
        match self.phase {
            Phase::Idle => Err(CallError::NotInCall),
            Phase::Ringing { .. } => self.decline(sink),
            _ => Ok(self.end(sink, true, EndReason::LocalHangup)),
        }
    }

    /// Enable or disable the microphone for the current call.
    pub fn set_audio_enabled(&mut self, enabled: bool) -> Result<(), CallError> {
        if self.is_idle() {
            return Err(CallError::NotInCall);
        }
        self.audio_enabled = enabled;
        if let Some(n) = self.phase.negotiation_mut() {
            n.media.set_audio_enabled(enabled);
        }
        Ok(())
    }

    pub fn set_video_enabled(&mut self, enabled: bool) -> Result<(), CallError> {
        if self.is_idle() {
            return Err(CallError::NotInCall);
        }
        self.video_enabled = enabled;
        if let Some(n) = self.phase.negotiation_mut() {
            n.media.set_video_enabled(enabled);
        }
        Ok(())
    }

    pub fn handle_invite(&mut self, from: UserId, sink: &dyn FrameSink) -> Vec<CallEffect> {
        if from == self.local || !from.is_valid() {
            debug!(from = %from, "Ignoring invite from invalid peer");
            return Vec::new();
        }

        if self.peer() == Some(from) {
            debug!(from = %from, phase = %self.phase(), "Ignoring repeated invite from current peer");
            return Vec::new();
        }

        if !self.is_idle() {
            info!(from = %from, phase = %self.phase(), "Busy, rejecting invite");
            send_best_effort(sink, &OutboundFrame::CallEnd { target_id: from });
            return Vec::new();
        }

        self.epoch += 1;
        info!(from = %from, epoch = self.epoch, "Incoming call");
        self.phase = Phase::Ringing {
            peer: from,
            pending_offer: None,
        };
        vec![
            CallEffect::Notify(CallNotice::IncomingCall { from }),
            self.phase_notice(),
        ]
    }

    pub fn handle_offer(&mut self, from: UserId, sdp: String, sink: &dyn FrameSink) -> Vec<CallEffect> {
        if self.peer() != Some(from) {
            debug!(from = %from, committed = ?self.peer(), "Discarding offer from uncommitted peer");
            return Vec::new();
        }
        if self.role() != Some(CallRole::Callee) {
            debug!(from = %from, "Discarding offer: local side is the caller");
            return Vec::new();
        }
        if sdp.trim().is_empty() {
            return self.fail(sink, SignalingError::Malformed("empty offer".into()).into());
        }

        let epoch = self.epoch;
        let kind = self.phase.kind();
        match &mut self.phase {
            Phase::Ringing { pending_offer, .. }
            | Phase::AwaitingLocalMedia { pending_offer, .. } => {
                debug!(from = %from, "Buffering offer until local media is ready");
                *pending_offer = Some(sdp);
                Vec::new()
            }
            Phase::Negotiating(n)
                if !n.remote_op_in_flight && !n.remote_description_applied =>
            {
                match &n.link {
                    Some(link) => {
                        n.remote_op_in_flight = true;
                        vec![CallEffect::AcceptOffer {
                            epoch,
                            link: link.clone(),
                            sdp,
                        }]
                    }
                    None => {
                        n.pending_offer = Some(sdp);
                        Vec::new()
                    }
                }
            }
            _ => {
                log_out_of_sequence("webrtc_offer", kind);
                Vec::new()
            }
        }
    }

    pub fn handle_answer(&mut self, from: UserId, sdp: String, sink: &dyn FrameSink) -> Vec<CallEffect> {
        if self.peer() != Some(from) || self.role() != Some(CallRole::Caller) {
            debug!(from = %from, "Discarding answer");
            return Vec::new();
        }
        if sdp.trim().is_empty() {
            return self.fail(sink, SignalingError::Malformed("empty answer".into()).into());
        }

        let epoch = self.epoch;
        let kind = self.phase.kind();
        match &mut self.phase {
            Phase::Negotiating(n)
                if n.local_description_sent
                    && !n.remote_op_in_flight
                    && !n.remote_description_applied =>
            {
                let Some(link) = n.link.clone() else {
                    return Vec::new();
                };
                n.remote_op_in_flight = true;
                vec![CallEffect::ApplyAnswer { epoch, link, sdp }]
            }
            _ => {
                log_out_of_sequence("webrtc_answer", kind);
                Vec::new()
            }
        }
    }

    pub fn handle_remote_candidate(&mut self, from: UserId, candidate: IceCandidate) -> Vec<CallEffect> {
        if self.peer() != Some(from) {
            debug!(from = %from, "Dropping candidate from uncommitted peer");
            return Vec::new();
        }

        let epoch = self.epoch;
        let Some(n) = self.phase.negotiation_mut() else {
            debug!(from = %from, "Dropping candidate: no peer connection yet");
            return Vec::new();
        };
        let Some(link) = n.link.clone() else {
            debug!(from = %from, "Dropping candidate: no peer connection yet");
            return Vec::new();
        };

        if !n.remote_description_applied {
            n.pending_remote_candidates.push(candidate);
            return Vec::new();
        }
        vec![CallEffect::AddCandidate {
            epoch,
            link,
            candidate,
        }]
    }

    pub fn handle_remote_end(&mut self, from: UserId, sink: &dyn FrameSink) -> Vec<CallEffect> {
        if self.peer() != Some(from) {
            debug!(from = %from, "Ignoring call_end for another peer");
            return Vec::new();
        }
        info!(peer = %from, "Peer ended the call");
        self.end(sink, false, EndReason::RemoteEnded)
    }

    /// The persistent connection is gone; nothing can reach the peer.
    pub fn on_transport_closed(&mut self, sink: &dyn FrameSink) -> Vec<CallEffect> {
        match self.phase {
            Phase::Idle => Vec::new(),
            Phase::Ringing { .. } => self.end(sink, false, EndReason::TransportLost),
            _ => {
                warn!(peer = ?self.peer(), phase = %self.phase(), "Connection lost during call");
                self.end(sink, false, EndReason::Failed(CallError::TransportLost))
            }
        }
    }

    pub fn on_completion(&mut self, completion: CallCompletion, sink: &dyn FrameSink) -> Vec<CallEffect> {
        if completion.epoch() != self.epoch || self.is_idle() {
            debug!(completion = ?completion, current = self.epoch, "Stale completion");
            return release(completion);
        }

        match completion {
            CallCompletion::MediaAcquired { result, .. } => self.on_media_acquired(result, sink),
            CallCompletion::PeerOpened { result, .. } => self.on_peer_opened(result, sink),
            CallCompletion::OfferCreated { result, .. } => self.on_offer_created(result, sink),
            CallCompletion::OfferAccepted { result, .. } => self.on_offer_accepted(result, sink),
            CallCompletion::AnswerApplied { result, .. } => self.on_answer_applied(result, sink),
            CallCompletion::CandidateApplied { result, .. } => self.on_candidate_applied(result),
            CallCompletion::Peer { event, .. } => self.on_peer_event(event, sink),
            CallCompletion::SetupTimeout { .. } => {
                if matches!(self.phase, Phase::Active(_)) {
                    Vec::new()
                } else {
                    self.fail(sink, CallError::SetupTimeout)
                }
            }
        }
    }

    fn on_media_acquired(
        &mut self,
        result: Result<LocalMediaHandle, MediaError>,
        sink: &dyn FrameSink,
    ) -> Vec<CallEffect> {
        let Phase::AwaitingLocalMedia { .. } = self.phase else {
            if let Ok(media) = result {
                media.stop();
            }
            return Vec::new();
        };
        let media = match result {
            Ok(media) => media,
            Err(e) => return self.fail(sink, e.into()),
        };

        let Phase::AwaitingLocalMedia {
            peer,
            role,
            pending_offer,
        } = std::mem::replace(&mut self.phase, Phase::Idle)
        else {
            return Vec::new();
        };

        media.set_audio_enabled(self.audio_enabled);
        media.set_video_enabled(self.video_enabled);
        debug!(peer = %peer, role = ?role, "Local media ready");

        self.phase = Phase::Negotiating(Negotiation::new(peer, role, media.clone(), pending_offer));
        vec![
            self.phase_notice(),
            CallEffect::OpenPeer {
                epoch: self.epoch,
                media,
            },
        ]
    }

    fn on_peer_opened(
        &mut self,
        result: Result<PeerLinkHandle, MediaError>,
        sink: &dyn FrameSink,
    ) -> Vec<CallEffect> {
        let epoch = self.epoch;
        let link = match result {
            Ok(link) => link,
            Err(e) => return self.fail(sink, e.into()),
        };
        let Phase::Negotiating(n) = &mut self.phase else {
            return vec![CallEffect::ClosePeer { link }];
        };
        if n.link.is_some() {
            return vec![CallEffect::ClosePeer { link }];
        }

        n.link = Some(link.clone());
        match n.role {
            CallRole::Caller => vec![CallEffect::CreateOffer { epoch, link }],
            CallRole::Callee => match n.pending_offer.take() {
                Some(sdp) => {
                    n.remote_op_in_flight = true;
                    vec![CallEffect::AcceptOffer { epoch, link, sdp }]
                }
                None => {
                    debug!(peer = %n.peer, "Peer connection ready, waiting for offer");
                    Vec::new()
                }
            },
        }
    }

    fn on_offer_created(&mut self, result: Result<String, MediaError>, sink: &dyn FrameSink) -> Vec<CallEffect> {
        let sdp = match result {
            Ok(sdp) => sdp,
            Err(e) => return self.fail(sink, e.into()),
        };
        let Phase::Negotiating(n) = &mut self.phase else {
            return Vec::new();
        };
        if n.role != CallRole::Caller || n.local_description_sent {
            return Vec::new();
        }

        let frame = OutboundFrame::WebrtcOffer {
            target_id: n.peer,
            sdp,
        };
        if let Err(e) = sink.send_frame(&frame) {
            warn!(error = %e, "Offer not sent");
            return self.fail(sink, CallError::NotConnected);
        }
        n.local_description_sent = true;
        debug!(peer = %n.peer, "Offer sent");
        flush_local_candidates(n, sink);
        Vec::new()
    }

    fn on_offer_accepted(&mut self, result: Result<String, MediaError>, sink: &dyn FrameSink) -> Vec<CallEffect> {
        let answer = match result {
            Ok(answer) => answer,
            Err(e) => return self.fail(sink, e.into()),
        };
        let epoch = self.epoch;
        let Phase::Negotiating(n) = &mut self.phase else {
            return Vec::new();
        };
        if n.role != CallRole::Callee || !n.remote_op_in_flight {
            return Vec::new();
        }

        n.remote_op_in_flight = false;
        n.remote_description_applied = true;

        let frame = OutboundFrame::WebrtcAnswer {
            target_id: n.peer,
            sdp: answer,
        };
        if let Err(e) = sink.send_frame(&frame) {
            warn!(error = %e, "Answer not sent");
            return self.fail(sink, CallError::NotConnected);
        }
        n.local_description_sent = true;
        debug!(peer = %n.peer, "Answer sent");
        flush_local_candidates(n, sink);

        let mut effects = drain_remote_candidates(n, epoch);
        effects.extend(self.promote_if_established());
        effects
    }

    fn on_answer_applied(&mut self, result: Result<(), MediaError>, sink: &dyn FrameSink) -> Vec<CallEffect> {
        if let Err(e) = result {
            return self.fail(sink, e.into());
        }
        let epoch = self.epoch;
        let Phase::Negotiating(n) = &mut self.phase else {
            return Vec::new();
        };
        if n.role != CallRole::Caller || !n.remote_op_in_flight {
            return Vec::new();
        }

        n.remote_op_in_flight = false;
        n.remote_description_applied = true;
        debug!(peer = %n.peer, "Answer applied");

        let mut effects = drain_remote_candidates(n, epoch);
        effects.extend(self.promote_if_established());
        effects
    }

    fn on_candidate_applied(&mut self, result: Result<(), MediaError>) -> Vec<CallEffect> {
        let Some(n) = self.phase.negotiation_mut() else {
            return Vec::new();
        };
        match result {
            Ok(()) => {
                n.candidates_applied += 1;
                self.promote_if_established()
            }
            Err(e) => {
                // One bad candidate does not break the call; others may work.
                warn!(peer = %n.peer, error = %e, "Remote candidate rejected");
                Vec::new()
            }
        }
    }

    fn on_peer_event(&mut self, event: PeerEvent, sink: &dyn FrameSink) -> Vec<CallEffect> {
        match event {
            PeerEvent::LocalCandidate(candidate) => {
                if let Some(n) = self.phase.negotiation_mut() {
                    if n.local_description_sent {
                        send_best_effort(
                            sink,
                            &OutboundFrame::WebrtcIce {
                                target_id: n.peer,
                                candidate,
                            },
                        );
                    } else {
                        n.pending_local_candidates.push(candidate);
                    }
                }
                Vec::new()
            }
            PeerEvent::Connected => {
                if let Some(n) = self.phase.negotiation_mut() {
                    info!(peer = %n.peer, "Media connected");
                }
                Vec::new()
            }
            PeerEvent::Failed(reason) => self.fail(sink, MediaError::PeerConnection(reason).into()),
        }
    }

    fn promote_if_established(&mut self) -> Vec<CallEffect> {
        let ready = matches!(&self.phase, Phase::Negotiating(n) if n.is_established());
        if !ready {
            return Vec::new();
        }
        let Phase::Negotiating(n) = std::mem::replace(&mut self.phase, Phase::Idle) else {
            return Vec::new();
        };
        info!(peer = %n.peer, role = ?n.role, "Call active");
        self.phase = Phase::Active(n);
        vec![self.phase_notice()]
    }

    fn fail(&mut self, sink: &dyn FrameSink, error: CallError) -> Vec<CallEffect> {
        warn!(peer = ?self.peer(), phase = %self.phase(), error = %error, "Call failed");
        self.end(sink, true, EndReason::Failed(error))
    }

    /// Release everything the call owns and return to Idle.
    fn end(&mut self, sink: &dyn FrameSink, notify_peer: bool, reason: EndReason) -> Vec<CallEffect> {
        let phase = std::mem::replace(&mut self.phase, Phase::Idle);
        let Some(peer) = phase.peer() else {
            return Vec::new();
        };

        let mut effects = vec![CallEffect::Notify(CallNotice::PhaseChanged {
            phase: CallPhaseKind::Ending,
            peer: Some(peer),
        })];

        if let Phase::Negotiating(n) | Phase::Active(n) = phase {
            n.media.stop();
            if let Some(link) = n.link {
                effects.push(CallEffect::ClosePeer { link });
            }
        }

        if notify_peer && sink.is_open() {
            send_best_effort(sink, &OutboundFrame::CallEnd { target_id: peer });
        }

        self.epoch += 1;
        info!(peer = %peer, reason = ?reason, "Call ended");

        effects.push(CallEffect::Notify(CallNotice::Ended { peer, reason }));
        effects.push(self.phase_notice());
        effects
    }

    fn phase_notice(&self) -> CallEffect {
        CallEffect::Notify(CallNotice::PhaseChanged {
            phase: self.phase(),
            peer: self.peer(),
        })
    }

    fn reset_toggles(&mut self) {
        self.audio_enabled = true;
        self.video_enabled = true;
    }
}

fn send_best_effort(sink: &dyn FrameSink, frame: &OutboundFrame) {
    if let Err(e) = sink.send_frame(frame) {
        debug!(frame = frame.kind(), error = %e, "Frame not sent");
    }
}

fn flush_local_candidates(n: &mut Negotiation, sink: &dyn FrameSink) {
    for candidate in n.pending_local_candidates.drain(..) {
        send_best_effort(
            sink,
            &OutboundFrame::WebrtcIce {
                target_id: n.peer,
                candidate,
            },
        );
    }
}

fn drain_remote_candidates(n: &mut Negotiation, epoch: u64) -> Vec<CallEffect> {
    let Some(link) = n.link.clone() else {
        return Vec::new();
    };
    n.pending_remote_candidates
        .drain(..)
        .map(|candidate| CallEffect::AddCandidate {
            epoch,
            link: link.clone(),
            candidate,
        })
        .collect()
}

fn release(completion: CallCompletion) -> Vec<CallEffect> {
    match completion {
        CallCompletion::MediaAcquired {
            result: Ok(media), ..
        } => {
            media.stop();
            Vec::new()
        }
        CallCompletion::PeerOpened { result: Ok(link), .. } => vec![CallEffect::ClosePeer { link }],
        _ => Vec::new(),
    }
}

fn log_out_of_sequence(frame: &str, phase: CallPhaseKind) {
    let err = SignalingError::OutOfSequence {
        frame: frame.to_string(),
        phase: phase.to_string(),
    };
    debug!(error = %err, "Dropping frame");
}
