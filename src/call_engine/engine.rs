//! Call Engine - führt die Call Session aus
//!
//! Ein Task verarbeitet die Events der Session strikt nacheinander. Die
//! Plattform-Operationen (Media holen, Offer/Answer, Candidates) laufen auf
//! einem eigenen Worker in FIFO-Reihenfolge. Während der Worker wartet,
//! nimmt die Session weiter Events an; Ergebnisse kommen als Events zurück.
//! Endet der Anruf, bricht der Worker den laufenden Schritt ab.

use super::platform::{CandidateSink, MediaPlatform};
use super::session::{
    CallError, CallId, CallSession, Effect, MediaHandle, NegotiationHandle, Notification, Phase,
    SessionEvent,
};
use crate::config::CallConfig;
use crate::signaling::{CallKind, EndpointId, InboundSignal, OutboundSignal};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

// ============================================================================
// TYPES
// ============================================================================

/// Eingänge der Engine
#[derive(Debug)]
pub(crate) enum EngineInput {
    Event(SessionEvent),
    User {
        event: SessionEvent,
        reply: oneshot::Sender<Result<(), CallError>>,
    },
}

/// Momentaufnahme der Session für Abfragen von außen
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub call_id: CallId,
    pub phase: Phase,
    pub peer: Option<EndpointId>,
    pub kind: Option<CallKind>,
}

impl SessionSnapshot {
    fn of(session: &CallSession) -> Self {
        Self {
            call_id: session.call_id(),
            phase: session.phase(),
            peer: session.peer().map(str::to_string),
            kind: session.kind(),
        }
    }
}

// ============================================================================
// CALL ENGINE
// ============================================================================

/// Handle auf die laufende Engine eines Endpoints
///
/// Klonbar; die Engine stoppt, sobald der letzte Klon gedroppt ist. Beim
/// Stoppen wird ein laufender Anruf wie bei `hangup` abgebaut.
#[derive(Clone)]
pub struct CallEngine {
    inputs: mpsc::UnboundedSender<EngineInput>,
    notifications: broadcast::Sender<Notification>,
    snapshot: Arc<RwLock<SessionSnapshot>>,
}

impl CallEngine {
    /// Startet Session-Task und Plattform-Worker
    ///
    /// Ausgehende Nachrichten landen in `outbound` und müssen vom Aufrufer
    /// an das Relay weitergegeben werden.
    pub fn spawn<P: MediaPlatform>(
        platform: P,
        config: &CallConfig,
        outbound: mpsc::UnboundedSender<OutboundSignal>,
    ) -> Self {
        let (inputs, input_rx) = mpsc::unbounded_channel();
        let (jobs, job_rx) = mpsc::unbounded_channel();
        let (notifications, _) = broadcast::channel(100);

        let session = CallSession::new(config.dial_timeout);
        let snapshot = Arc::new(RwLock::new(SessionSnapshot::of(&session)));
        // 0 = kein Anruf
        let (live_call, live_rx) = watch::channel(0);

        let worker = Worker {
            platform,
            media: HashMap::new(),
            negotiations: HashMap::new(),
            next_handle: 0,
            events: inputs.downgrade(),
            notifications: notifications.clone(),
            live_call: live_rx,
        };
        tokio::spawn(worker.run(job_rx));

        let runner = SessionRunner {
            session,
            jobs,
            outbound,
            notifications: notifications.clone(),
            snapshot: Arc::clone(&snapshot),
            live_call,
            inputs: inputs.downgrade(),
        };
        tokio::spawn(runner.run(input_rx));

        Self {
            inputs,
            notifications,
            snapshot,
        }
    }

    /// Gibt einen Receiver für Notifications zurück
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.notifications.subscribe()
    }

    pub fn state(&self) -> SessionSnapshot {
        self.snapshot.read().clone()
    }

    pub fn phase(&self) -> Phase {
        self.snapshot.read().phase
    }

    /// Startet einen ausgehenden Anruf
    pub async fn start_call(
        &self,
        peer: impl Into<EndpointId>,
        kind: CallKind,
    ) -> Result<(), CallError> {
        self.request(SessionEvent::StartCall {
            peer: peer.into(),
            kind,
        })
        .await
    }

    /// Nimmt den klingelnden Anruf an
    pub async fn accept(&self) -> Result<(), CallError> {
        self.request(SessionEvent::Accept).await
    }

    /// Lehnt den klingelnden Anruf ab
    pub async fn reject(&self) -> Result<(), CallError> {
        self.request(SessionEvent::Reject).await
    }

    /// Beendet den Anruf; ohne Anruf ein No-op
    pub async fn hangup(&self) -> Result<(), CallError> {
        self.request(SessionEvent::Hangup).await
    }

    /// Übergibt eine Nachricht vom Relay
    pub fn deliver(&self, inbound: InboundSignal) {
        let _ = self
            .inputs
            .send(EngineInput::Event(SessionEvent::Signal(inbound)));
    }

    async fn request(&self, event: SessionEvent) -> Result<(), CallError> {
        let (reply, rx) = oneshot::channel();
        self.inputs
            .send(EngineInput::User { event, reply })
            .map_err(|_| CallError::EngineStopped)?;
        rx.await.map_err(|_| CallError::EngineStopped)?
    }
}

impl std::fmt::Debug for CallEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallEngine")
            .field("state", &self.state())
            .finish()
    }
}

// ============================================================================
// SESSION TASK
// ============================================================================

struct SessionRunner {
    session: CallSession,
    jobs: mpsc::UnboundedSender<Effect>,
    outbound: mpsc::UnboundedSender<OutboundSignal>,
    notifications: broadcast::Sender<Notification>,
    snapshot: Arc<RwLock<SessionSnapshot>>,
    live_call: watch::Sender<CallId>,
    inputs: mpsc::WeakUnboundedSender<EngineInput>,
}

impl SessionRunner {
    async fn run(mut self, mut input_rx: mpsc::UnboundedReceiver<EngineInput>) {
        while let Some(input) = input_rx.recv().await {
            match input {
                EngineInput::Event(event) => {
                    // Protokollfehler sind No-ops, Events liefern nie Err
                    if let Ok(effects) = self.session.handle(event) {
                        self.apply(effects);
                    }
                }
                EngineInput::User { event, reply } => {
                    let result = self.session.handle(event).map(|effects| self.apply(effects));
                    let _ = reply.send(result);
                }
            }
        }

        // Alle Handles weg: laufenden Anruf sauber abbauen
        if let Ok(effects) = self.session.handle(SessionEvent::Hangup) {
            self.apply(effects);
        }
        tracing::debug!("Call engine stopped");
    }

    fn apply(&mut self, effects: Vec<Effect>) {
        let live = if self.session.is_idle() {
            0
        } else {
            self.session.call_id()
        };
        self.live_call.send_if_modified(|current| {
            let changed = *current != live;
            *current = live;
            changed
        });
        *self.snapshot.write() = SessionSnapshot::of(&self.session);

        for effect in effects {
            match effect {
                Effect::Send(outbound) => {
                    tracing::debug!("Sending {} to {}", outbound.signal.tag(), outbound.to);
                    if self.outbound.send(outbound).is_err() {
                        tracing::warn!("Signaling channel closed, message dropped");
                    }
                }
                Effect::Notify(notification) => {
                    let _ = self.notifications.send(notification);
                }
                Effect::ArmDialTimer { call, after } => {
                    let inputs = self.inputs.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(after).await;
                        if let Some(tx) = inputs.upgrade() {
                            let _ = tx.send(EngineInput::Event(SessionEvent::DialTimeout { call }));
                        }
                    });
                }
                job => {
                    if self.jobs.send(job).is_err() {
                        tracing::error!("Platform worker stopped");
                    }
                }
            }
        }
    }
}

// ============================================================================
// PLATFORM WORKER
// ============================================================================

/// Besitzt alle Plattform-Ressourcen der Session
struct Worker<P: MediaPlatform> {
    platform: P,
    media: HashMap<MediaHandle, P::Media>,
    negotiations: HashMap<NegotiationHandle, P::Negotiation>,
    next_handle: u64,
    events: mpsc::WeakUnboundedSender<EngineInput>,
    notifications: broadcast::Sender<Notification>,
    live_call: watch::Receiver<CallId>,
}

impl<P: MediaPlatform> Worker<P> {
    async fn run(mut self, mut jobs: mpsc::UnboundedReceiver<Effect>) {
        while let Some(job) = jobs.recv().await {
            self.execute(job).await;
        }

        // Was beim Stoppen noch übrig ist, freigeben
        for (_, negotiation) in self.negotiations.drain() {
            self.platform.close_negotiation(negotiation).await;
        }
        for (_, media) in self.media.drain() {
            self.platform.release_media(media).await;
        }
    }

    async fn execute(&mut self, job: Effect) {
        match job {
            Effect::AcquireMedia { call, kind } => {
                if !self.is_live(call) {
                    return;
                }
                let acquired = while_live(
                    self.live_call.clone(),
                    call,
                    self.platform.acquire_media(kind),
                )
                .await;
                let Some(acquired) = acquired else {
                    tracing::debug!("Call {} ended while acquiring media", call);
                    return;
                };
                match acquired {
                    Ok(media) => {
                        let handle = MediaHandle(self.mint());
                        self.media.insert(handle, media);
                        self.post(SessionEvent::MediaAcquired {
                            call,
                            media: handle,
                        });
                    }
                    Err(e) => self.post(SessionEvent::MediaFailed {
                        call,
                        reason: e.to_string(),
                    }),
                }
            }

            Effect::PrepareOffer { call, media } => {
                if !self.is_live(call) {
                    return;
                }
                let Some(negotiation) = self.create_negotiation(call, media).await else {
                    return;
                };
                let offered = while_live(
                    self.live_call.clone(),
                    call,
                    self.platform.create_offer(&negotiation),
                )
                .await;
                let Some(offered) = offered else {
                    tracing::debug!("Call {} ended while creating offer", call);
                    self.platform.close_negotiation(negotiation).await;
                    return;
                };
                match offered {
                    Ok(offer) => {
                        let handle = NegotiationHandle(self.mint());
                        self.negotiations.insert(handle, negotiation);
                        self.post(SessionEvent::OfferReady {
                            call,
                            negotiation: handle,
                            offer,
                        });
                    }
                    Err(e) => {
                        self.platform.close_negotiation(negotiation).await;
                        self.post(SessionEvent::NegotiationFailed {
                            call,
                            reason: e.to_string(),
                        });
                    }
                }
            }

            Effect::PrepareAnswer { call, media, offer } => {
                if !self.is_live(call) {
                    return;
                }
                let Some(negotiation) = self.create_negotiation(call, media).await else {
                    return;
                };
                let answered = while_live(
                    self.live_call.clone(),
                    call,
                    self.platform.create_answer(&negotiation, offer),
                )
                .await;
                let Some(answered) = answered else {
                    tracing::debug!("Call {} ended while creating answer", call);
                    self.platform.close_negotiation(negotiation).await;
                    return;
                };
                match answered {
                    Ok(answer) => {
                        let handle = NegotiationHandle(self.mint());
                        self.negotiations.insert(handle, negotiation);
                        self.post(SessionEvent::AnswerReady {
                            call,
                            negotiation: handle,
                            answer,
                        });
                    }
                    Err(e) => {
                        self.platform.close_negotiation(negotiation).await;
                        self.post(SessionEvent::NegotiationFailed {
                            call,
                            reason: e.to_string(),
                        });
                    }
                }
            }

            Effect::ApplyAnswer {
                call,
                negotiation,
                answer,
            } => {
                let Some(pc) = self.negotiations.get(&negotiation) else {
                    return;
                };
                let applied = while_live(
                    self.live_call.clone(),
                    call,
                    self.platform.apply_answer(pc, answer),
                )
                .await;
                // Abgebrochen: die Freigabe kommt als eigener Job
                if let Some(Err(e)) = applied {
                    self.post(SessionEvent::NegotiationFailed {
                        call,
                        reason: e.to_string(),
                    });
                }
            }

            Effect::ApplyCandidate {
                negotiation,
                candidate,
            } => {
                let Some(pc) = self.negotiations.get(&negotiation) else {
                    return;
                };
                // Nicht fatal, der Anruf läuft weiter
                if let Err(e) = self.platform.add_candidate(pc, candidate).await {
                    tracing::warn!("Failed to add ICE candidate: {}", e);
                    let _ = self.notifications.send(Notification::CandidateFailed {
                        reason: e.to_string(),
                    });
                }
            }

            Effect::ReleaseMedia(handle) => {
                if let Some(media) = self.media.remove(&handle) {
                    self.platform.release_media(media).await;
                }
            }

            Effect::ReleaseNegotiation(handle) => {
                if let Some(negotiation) = self.negotiations.remove(&handle) {
                    self.platform.close_negotiation(negotiation).await;
                }
            }

            Effect::Send(_) | Effect::Notify(_) | Effect::ArmDialTimer { .. } => {}
        }
    }

    async fn create_negotiation(
        &self,
        call: CallId,
        media: MediaHandle,
    ) -> Option<P::Negotiation> {
        let Some(local) = self.media.get(&media) else {
            tracing::debug!("Media {:?} already released, skipping negotiation", media);
            return None;
        };
        let sink = CandidateSink::new(call, self.events.clone());
        let created = while_live(
            self.live_call.clone(),
            call,
            self.platform.create_negotiation(local, sink),
        )
        .await;

        match created? {
            Ok(negotiation) => Some(negotiation),
            Err(e) => {
                self.post(SessionEvent::NegotiationFailed {
                    call,
                    reason: e.to_string(),
                });
                None
            }
        }
    }

    /// Jobs eines bereits beendeten Anrufs werden übersprungen
    fn is_live(&self, call: CallId) -> bool {
        *self.live_call.borrow() == call
    }

    fn mint(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn post(&self, event: SessionEvent) {
        if let Some(tx) = self.events.upgrade() {
            let _ = tx.send(EngineInput::Event(event));
        }
    }
}

/// Wartet, bis `call` nicht mehr der laufende Anruf ist
async fn ended(mut live: watch::Receiver<CallId>, call: CallId) {
    loop {
        let current = *live.borrow_and_update();
        if current != call {
            return;
        }
        if live.changed().await.is_err() {
            return;
        }
    }
}

/// Führt `step` aus, solange `call` läuft; `None`, wenn der Anruf vorher endet
///
/// Ein bereits fertiger Schritt gewinnt, damit sein Ergebnis über den
/// normalen Weg freigegeben wird.
async fn while_live<F: Future>(
    live: watch::Receiver<CallId>,
    call: CallId,
    step: F,
) -> Option<F::Output> {
    tokio::select! {
        biased;
        output = step => Some(output),
        _ = ended(live, call) => None,
    }
}
