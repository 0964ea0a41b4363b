//! Call Session - Zustandsmaschine eines Endpoints
//!
//! Die Session ist reiner Zustand: jedes Event erzeugt einen neuen Zustand
//! und eine Liste von Effekten (Nachrichten senden, Media holen, Handles
//! freigeben, ...). Ausgeführt werden die Effekte von der `CallEngine`.
//! Dadurch lässt sich die Maschine ohne Transport und ohne Geräte testen.
//!
//! Asynchrone Schritte tragen eine `CallId`. Kommt ein Ergebnis für einen
//! bereits beendeten Anruf zurück, wird es verworfen und die mitgelieferte
//! Ressource sofort wieder freigegeben.

use crate::signaling::{
    CallKind, EndpointId, IceCandidate, InboundSignal, OutboundSignal, SdpType,
    SessionDescription, Signal,
};
use std::time::Duration;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Fehler bei Benutzeraktionen, die im aktuellen Zustand nicht erlaubt sind
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    #[error("Already in a call")]
    AlreadyInCall,

    #[error("No incoming call")]
    NoIncomingCall,

    #[error("Cannot call yourself")]
    SelfCall,

    #[error("Call engine stopped")]
    EngineStopped,
}

// ============================================================================
// TYPES
// ============================================================================

/// Epoche eines Anrufs, wird pro Anruf hochgezählt
pub type CallId = u64;

/// Lokale Media (Mikrofon/Kamera), gehört exklusiv der Session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MediaHandle(pub u64);

/// Negotiation Handle (Peer Connection), gehört exklusiv der Session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NegotiationHandle(pub u64);

/// Phase des Anrufs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Dialing,
    Ringing,
    Negotiating,
    Active,
    /// Nur während des Abbaus sichtbar, danach sofort wieder `Idle`
    Ended,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::Dialing => "dialing",
            Phase::Ringing => "ringing",
            Phase::Negotiating => "negotiating",
            Phase::Active => "active",
            Phase::Ended => "ended",
        }
    }
}

/// Wer den Anruf gestartet hat
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Caller,
    Callee,
}

/// Warum ein Anruf beendet wurde
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndReason {
    LocalHangup,
    RemoteHangup,
    LocalReject,
    RemoteReject,
    DeviceError(String),
    NegotiationFailed(String),
    DialTimeout,
}

/// Alles, was die Session verarbeitet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    // Benutzer
    StartCall { peer: EndpointId, kind: CallKind },
    Accept,
    Reject,
    Hangup,

    // Relay
    Signal(InboundSignal),

    // Plattform
    MediaAcquired {
        call: CallId,
        media: MediaHandle,
    },
    MediaFailed {
        call: CallId,
        reason: String,
    },
    OfferReady {
        call: CallId,
        negotiation: NegotiationHandle,
        offer: SessionDescription,
    },
    AnswerReady {
        call: CallId,
        negotiation: NegotiationHandle,
        answer: SessionDescription,
    },
    NegotiationFailed {
        call: CallId,
        reason: String,
    },
    LocalCandidate {
        call: CallId,
        candidate: IceCandidate,
    },
    DialTimeout {
        call: CallId,
    },
}

/// Nach oben gemeldete Ereignisse
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    PhaseChanged(Phase),
    IncomingCall {
        from: EndpointId,
        kind: CallKind,
    },
    CallEnded {
        peer: Option<EndpointId>,
        reason: EndReason,
    },
    /// Ein zweiter Anrufer wurde automatisch abgewiesen
    BusyRejected {
        from: EndpointId,
    },
    /// Remote Candidate wurde von der Plattform abgelehnt, der Anruf läuft weiter
    CandidateFailed {
        reason: String,
    },
}

/// Seiteneffekte, die die Engine ausführt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    Send(OutboundSignal),
    AcquireMedia {
        call: CallId,
        kind: CallKind,
    },
    /// Handle anlegen, Offer erzeugen und als Local Description setzen
    PrepareOffer {
        call: CallId,
        media: MediaHandle,
    },
    /// Handle anlegen, Remote Offer setzen, Answer erzeugen und setzen
    PrepareAnswer {
        call: CallId,
        media: MediaHandle,
        offer: SessionDescription,
    },
    ApplyAnswer {
        call: CallId,
        negotiation: NegotiationHandle,
        answer: SessionDescription,
    },
    ApplyCandidate {
        negotiation: NegotiationHandle,
        candidate: IceCandidate,
    },
    ReleaseMedia(MediaHandle),
    ReleaseNegotiation(NegotiationHandle),
    ArmDialTimer {
        call: CallId,
        after: Duration,
    },
    Notify(Notification),
}

// ============================================================================
// CALL SESSION
// ============================================================================

/// Lokale Sicht auf einen laufenden oder anstehenden Anruf
#[derive(Debug, Clone)]
pub struct CallSession {
    call_id: CallId,
    phase: Phase,
    role: Option<Role>,
    peer: Option<EndpointId>,
    kind: Option<CallKind>,
    local_media: Option<MediaHandle>,
    negotiation: Option<NegotiationHandle>,
    pending_candidates: Vec<IceCandidate>,

    /// Lokale Candidates, bevor Offer/Answer verschickt ist
    outgoing_candidates: Vec<IceCandidate>,
    media_pending: bool,
    accepted: bool,
    held_offer: Option<SessionDescription>,
    remote_description_set: bool,
    dial_timeout: Option<Duration>,
}

impl Default for CallSession {
    fn default() -> Self {
        Self::new(None)
    }
}

impl CallSession {
    pub fn new(dial_timeout: Option<Duration>) -> Self {
        Self {
            call_id: 0,
            phase: Phase::Idle,
            role: None,
            peer: None,
            kind: None,
            local_media: None,
            negotiation: None,
            pending_candidates: Vec::new(),
            outgoing_candidates: Vec::new(),
            media_pending: false,
            accepted: false,
            held_offer: None,
            remote_description_set: false,
            dial_timeout,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn call_id(&self) -> CallId {
        self.call_id
    }

    pub fn role(&self) -> Option<Role> {
        self.role
    }

    pub fn peer(&self) -> Option<&str> {
        self.peer.as_deref()
    }

    pub fn kind(&self) -> Option<CallKind> {
        self.kind
    }

    pub fn local_media(&self) -> Option<MediaHandle> {
        self.local_media
    }

    pub fn negotiation(&self) -> Option<NegotiationHandle> {
        self.negotiation
    }

    pub fn pending_candidates(&self) -> &[IceCandidate] {
        &self.pending_candidates
    }

    pub fn is_idle(&self) -> bool {
        self.phase == Phase::Idle
    }

    /// Verarbeitet genau ein Event
    ///
    /// Fehler gibt es nur für Benutzeraktionen. Unerwartete Nachrichten vom
    /// Relay sind No-ops.
    pub fn handle(&mut self, event: SessionEvent) -> Result<Vec<Effect>, CallError> {
        match event {
            SessionEvent::StartCall { peer, kind } => self.start_call(peer, kind),
            SessionEvent::Accept => self.accept(),
            SessionEvent::Reject => self.reject(),
            SessionEvent::Hangup => Ok(self.teardown(Some(Signal::CallEnd), EndReason::LocalHangup)),
            SessionEvent::Signal(inbound) => Ok(self.on_signal(inbound)),
            SessionEvent::MediaAcquired { call, media } => Ok(self.on_media_acquired(call, media)),
            SessionEvent::MediaFailed { call, reason } => Ok(self.on_media_failed(call, reason)),
            SessionEvent::OfferReady {
                call,
                negotiation,
                offer,
            } => Ok(self.on_offer_ready(call, negotiation, offer)),
            SessionEvent::AnswerReady {
                call,
                negotiation,
                answer,
            } => Ok(self.on_answer_ready(call, negotiation, answer)),
            SessionEvent::NegotiationFailed { call, reason } => {
                if !self.is_current(call) {
                    return Ok(Vec::new());
                }
                Ok(self.teardown(Some(Signal::CallEnd), EndReason::NegotiationFailed(reason)))
            }
            SessionEvent::LocalCandidate { call, candidate } => {
                Ok(self.on_local_candidate(call, candidate))
            }
            SessionEvent::DialTimeout { call } => {
                if !self.is_current(call) || !self.awaiting_answer() {
                    return Ok(Vec::new());
                }
                tracing::info!("Dial timeout for call {}", call);
                Ok(self.teardown(Some(Signal::CallEnd), EndReason::DialTimeout))
            }
        }
    }

    // ========================================================================
    // USER ACTIONS
    // ========================================================================

    fn start_call(&mut self, peer: EndpointId, kind: CallKind) -> Result<Vec<Effect>, CallError> {
        if self.phase != Phase::Idle {
            return Err(CallError::AlreadyInCall);
        }

        self.call_id += 1;
        self.role = Some(Role::Caller);
        self.peer = Some(peer);
        self.kind = Some(kind);
        self.media_pending = true;

        let mut effects = self.enter(Phase::Dialing);
        effects.push(Effect::AcquireMedia {
            call: self.call_id,
            kind,
        });
        if let Some(after) = self.dial_timeout {
            effects.push(Effect::ArmDialTimer {
                call: self.call_id,
                after,
            });
        }
        Ok(effects)
    }

    fn accept(&mut self) -> Result<Vec<Effect>, CallError> {
        if self.phase != Phase::Ringing {
            return Err(CallError::NoIncomingCall);
        }
        if self.accepted {
            return Ok(Vec::new());
        }

        self.accepted = true;
        self.media_pending = true;
        let kind = self.kind.unwrap_or(CallKind::Audio);
        Ok(vec![Effect::AcquireMedia {
            call: self.call_id,
            kind,
        }])
    }

    fn reject(&mut self) -> Result<Vec<Effect>, CallError> {
        if self.phase != Phase::Ringing {
            return Err(CallError::NoIncomingCall);
        }
        Ok(self.teardown(Some(Signal::CallReject), EndReason::LocalReject))
    }

    // ========================================================================
    // RELAY MESSAGES
    // ========================================================================

    fn on_signal(&mut self, inbound: InboundSignal) -> Vec<Effect> {
        let InboundSignal { from, signal } = inbound;

        match signal {
            Signal::CallIncoming { call_kind, .. } | Signal::CallRequest { call_kind } => {
                self.on_incoming(from, call_kind)
            }
            other => {
                if self.phase == Phase::Idle || self.peer.as_deref() != Some(from.as_str()) {
                    tracing::debug!(
                        "Ignoring {} from {} in phase {}",
                        other.tag(),
                        from,
                        self.phase.as_str()
                    );
                    return Vec::new();
                }
                self.on_peer_signal(other)
            }
        }
    }

    fn on_incoming(&mut self, from: EndpointId, kind: CallKind) -> Vec<Effect> {
        if self.phase != Phase::Idle {
            // Besetzt: sofort ablehnen, eigener Zustand bleibt unverändert
            tracing::info!("Busy, rejecting call from {}", from);
            return vec![
                Effect::Send(OutboundSignal::new(from.clone(), Signal::CallReject)),
                Effect::Notify(Notification::BusyRejected { from }),
            ];
        }

        self.call_id += 1;
        self.role = Some(Role::Callee);
        self.peer = Some(from.clone());
        self.kind = Some(kind);
        self.accepted = false;

        let mut effects = self.enter(Phase::Ringing);
        effects.push(Effect::Notify(Notification::IncomingCall { from, kind }));
        effects
    }

    fn on_peer_signal(&mut self, signal: Signal) -> Vec<Effect> {
        match signal {
            Signal::NegotiationOffer {
                session_description,
            } => {
                if self.phase != Phase::Ringing
                    || session_description.sdp_type != SdpType::Offer
                {
                    return Vec::new();
                }
                match self.local_media {
                    Some(media) => self.start_answer(media, session_description),
                    None => {
                        // Erst beantworten, wenn der Benutzer angenommen hat
                        self.held_offer = Some(session_description);
                        Vec::new()
                    }
                }
            }

            Signal::NegotiationAnswer {
                session_description,
            } => {
                let Some(negotiation) = self.negotiation else {
                    return Vec::new();
                };
                if self.phase != Phase::Negotiating
                    || self.role != Some(Role::Caller)
                    || self.remote_description_set
                    || session_description.sdp_type != SdpType::Answer
                {
                    return Vec::new();
                }

                self.remote_description_set = true;
                let mut effects = vec![Effect::ApplyAnswer {
                    call: self.call_id,
                    negotiation,
                    answer: session_description,
                }];
                effects.extend(self.drain_candidates());
                effects.extend(self.enter(Phase::Active));
                effects
            }

            Signal::IceCandidate { candidate } => match self.ready_negotiation() {
                Some(negotiation) => vec![Effect::ApplyCandidate {
                    negotiation,
                    candidate,
                }],
                None => {
                    self.pending_candidates.push(candidate);
                    Vec::new()
                }
            },

            Signal::CallReject => self.teardown(None, EndReason::RemoteReject),

            Signal::CallEnd => self.teardown(None, EndReason::RemoteHangup),

            Signal::CallIncoming { .. } | Signal::CallRequest { .. } => Vec::new(),
        }
    }

    // ========================================================================
    // PLATFORM COMPLETIONS
    // ========================================================================

    fn on_media_acquired(&mut self, call: CallId, media: MediaHandle) -> Vec<Effect> {
        let expected = self.is_current(call)
            && self.media_pending
            && self.local_media.is_none()
            && matches!(self.phase, Phase::Dialing | Phase::Ringing);
        if !expected {
            tracing::debug!("Releasing media from stale call {}", call);
            return vec![Effect::ReleaseMedia(media)];
        }

        self.local_media = Some(media);
        self.media_pending = false;

        match self.phase {
            Phase::Dialing => {
                let (Some(peer), Some(kind)) = (self.peer.clone(), self.kind) else {
                    return Vec::new();
                };
                vec![
                    Effect::Send(OutboundSignal::new(
                        peer,
                        Signal::CallRequest { call_kind: kind },
                    )),
                    Effect::PrepareOffer { call, media },
                ]
            }
            _ => match self.held_offer.take() {
                Some(offer) => self.start_answer(media, offer),
                None => Vec::new(),
            },
        }
    }

    fn on_media_failed(&mut self, call: CallId, reason: String) -> Vec<Effect> {
        if !self.is_current(call) || !self.media_pending {
            return Vec::new();
        }

        tracing::warn!("Local media unavailable: {}", reason);
        let reply = match self.phase {
            Phase::Ringing => Some(Signal::CallReject),
            _ => Some(Signal::CallEnd),
        };
        self.teardown(reply, EndReason::DeviceError(reason))
    }

    fn on_offer_ready(
        &mut self,
        call: CallId,
        negotiation: NegotiationHandle,
        offer: SessionDescription,
    ) -> Vec<Effect> {
        if !self.is_current(call) || self.phase != Phase::Dialing || self.negotiation.is_some() {
            return vec![Effect::ReleaseNegotiation(negotiation)];
        }
        let Some(peer) = self.peer.clone() else {
            return vec![Effect::ReleaseNegotiation(negotiation)];
        };

        self.negotiation = Some(negotiation);
        let mut effects = self.enter(Phase::Negotiating);
        effects.push(Effect::Send(OutboundSignal::new(
            peer,
            Signal::NegotiationOffer {
                session_description: offer,
            },
        )));
        effects.extend(self.flush_outgoing());
        effects
    }

    fn on_answer_ready(
        &mut self,
        call: CallId,
        negotiation: NegotiationHandle,
        answer: SessionDescription,
    ) -> Vec<Effect> {
        if !self.is_current(call)
            || self.phase != Phase::Negotiating
            || self.role != Some(Role::Callee)
            || self.negotiation.is_some()
        {
            return vec![Effect::ReleaseNegotiation(negotiation)];
        }
        let Some(peer) = self.peer.clone() else {
            return vec![Effect::ReleaseNegotiation(negotiation)];
        };

        self.negotiation = Some(negotiation);
        let mut effects = vec![Effect::Send(OutboundSignal::new(
            peer,
            Signal::NegotiationAnswer {
                session_description: answer,
            },
        ))];
        effects.extend(self.flush_outgoing());
        effects.extend(self.drain_candidates());
        effects.extend(self.enter(Phase::Active));
        effects
    }

    fn on_local_candidate(&mut self, call: CallId, candidate: IceCandidate) -> Vec<Effect> {
        if !self.is_current(call) || self.phase == Phase::Idle {
            return Vec::new();
        }
        let Some(peer) = self.peer.clone() else {
            return Vec::new();
        };

        if self.negotiation.is_none() {
            // Offer/Answer muss vor den Candidates beim Peer sein
            self.outgoing_candidates.push(candidate);
            return Vec::new();
        }
        vec![Effect::Send(OutboundSignal::new(
            peer,
            Signal::IceCandidate { candidate },
        ))]
    }

    // ========================================================================
    // HELPERS
    // ========================================================================

    fn is_current(&self, call: CallId) -> bool {
        call == self.call_id && self.phase != Phase::Idle
    }

    /// Anrufer wartet noch auf das Answer des Peers
    fn awaiting_answer(&self) -> bool {
        self.role == Some(Role::Caller)
            && matches!(self.phase, Phase::Dialing | Phase::Negotiating)
            && !self.remote_description_set
    }

    /// Handle existiert und Remote Description ist gesetzt
    fn ready_negotiation(&self) -> Option<NegotiationHandle> {
        if self.remote_description_set {
            self.negotiation
        } else {
            None
        }
    }

    fn start_answer(&mut self, media: MediaHandle, offer: SessionDescription) -> Vec<Effect> {
        self.remote_description_set = true;
        let mut effects = self.enter(Phase::Negotiating);
        effects.push(Effect::PrepareAnswer {
            call: self.call_id,
            media,
            offer,
        });
        effects
    }

    fn drain_candidates(&mut self) -> Vec<Effect> {
        let Some(negotiation) = self.ready_negotiation() else {
            return Vec::new();
        };
        self.pending_candidates
            .drain(..)
            .map(|candidate| Effect::ApplyCandidate {
                negotiation,
                candidate,
            })
            .collect()
    }

    fn flush_outgoing(&mut self) -> Vec<Effect> {
        let Some(peer) = self.peer.clone() else {
            return Vec::new();
        };
        self.outgoing_candidates
            .drain(..)
            .map(|candidate| {
                Effect::Send(OutboundSignal::new(
                    peer.clone(),
                    Signal::IceCandidate { candidate },
                ))
            })
            .collect()
    }

    fn enter(&mut self, phase: Phase) -> Vec<Effect> {
        if self.phase == phase {
            return Vec::new();
        }
        tracing::debug!("Call phase {} -> {}", self.phase.as_str(), phase.as_str());
        self.phase = phase;
        vec![Effect::Notify(Notification::PhaseChanged(phase))]
    }

    /// Weiß der Peer schon von diesem Anruf?
    fn peer_aware(&self) -> bool {
        match self.phase {
            Phase::Idle | Phase::Ended => false,
            // call-request geht erst raus, wenn die Media da ist
            Phase::Dialing => self.local_media.is_some(),
            Phase::Ringing | Phase::Negotiating | Phase::Active => true,
        }
    }

    /// Abbau: gibt alles frei und kehrt nach `Idle` zurück
    ///
    /// Idempotent, ein zweiter Aufruf in `Idle` liefert keine Effekte.
    fn teardown(&mut self, reply: Option<Signal>, reason: EndReason) -> Vec<Effect> {
        if self.phase == Phase::Idle {
            return Vec::new();
        }

        let mut effects = Vec::new();
        if let (Some(signal), Some(peer)) = (reply, self.peer.clone()) {
            if self.peer_aware() {
                effects.push(Effect::Send(OutboundSignal::new(peer, signal)));
            }
        }

        if let Some(negotiation) = self.negotiation.take() {
            effects.push(Effect::ReleaseNegotiation(negotiation));
        }
        if let Some(media) = self.local_media.take() {
            effects.push(Effect::ReleaseMedia(media));
        }

        self.pending_candidates.clear();
        self.outgoing_candidates.clear();
        self.held_offer = None;
        self.media_pending = false;
        self.accepted = false;
        self.remote_description_set = false;
        self.role = None;
        self.kind = None;
        let peer = self.peer.take();

        tracing::info!("Call {} ended: {:?}", self.call_id, reason);
        effects.extend(self.enter(Phase::Ended));
        effects.push(Effect::Notify(Notification::CallEnded { peer, reason }));
        effects.extend(self.enter(Phase::Idle));
        effects
    }
}
