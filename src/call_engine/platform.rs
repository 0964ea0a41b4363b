//! Schnittstelle zur Media-Plattform
//!
//! Media Capture, Encoding und die eigentliche Peer Connection stellt die
//! Plattform bereit. Die Engine entscheidet nur, wann welche Operation
//! aufgerufen wird.

use super::engine::EngineInput;
use super::session::{CallId, SessionEvent};
use crate::signaling::{CallKind, IceCandidate, SessionDescription};
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlatformError {
    #[error("Media device unavailable: {0}")]
    MediaUnavailable(String),

    #[error("WebRTC error: {0}")]
    WebRTC(String),

    #[error("Invalid SDP: {0}")]
    InvalidSdp(String),

    #[error("Invalid ICE candidate: {0}")]
    InvalidCandidate(String),
}

/// Nimmt lokal gefundene ICE Candidates einer Negotiation entgegen
///
/// Hält die Engine nicht am Leben: ist sie beendet, werden Candidates
/// verworfen.
#[derive(Clone)]
pub struct CandidateSink {
    call: CallId,
    tx: mpsc::WeakUnboundedSender<EngineInput>,
}

impl CandidateSink {
    pub(crate) fn new(call: CallId, tx: mpsc::WeakUnboundedSender<EngineInput>) -> Self {
        Self { call, tx }
    }

    /// Gibt `false` zurück, wenn die Engine nicht mehr läuft
    pub fn push(&self, candidate: IceCandidate) -> bool {
        let Some(tx) = self.tx.upgrade() else {
            return false;
        };
        tx.send(EngineInput::Event(SessionEvent::LocalCandidate {
            call: self.call,
            candidate,
        }))
        .is_ok()
    }
}

impl std::fmt::Debug for CandidateSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CandidateSink")
            .field("call", &self.call)
            .finish()
    }
}

/// Media- und Negotiation-API des Hosts
///
/// Alle Operationen einer Engine laufen nacheinander auf einem Worker;
/// zwei Description-Operationen überlappen sich nie.
#[async_trait]
pub trait MediaPlatform: Send + Sync + 'static {
    /// Lokale Tracks (Mikrofon, ggf. Kamera)
    type Media: Send + Sync + 'static;
    /// Peer Connection
    type Negotiation: Send + Sync + 'static;

    async fn acquire_media(&self, kind: CallKind) -> Result<Self::Media, PlatformError>;

    /// Legt eine Negotiation an und hängt die lokale Media an
    async fn create_negotiation(
        &self,
        media: &Self::Media,
        candidates: CandidateSink,
    ) -> Result<Self::Negotiation, PlatformError>;

    /// Erzeugt ein Offer und setzt es als Local Description
    async fn create_offer(
        &self,
        negotiation: &Self::Negotiation,
    ) -> Result<SessionDescription, PlatformError>;

    /// Setzt das Remote Offer, erzeugt ein Answer und setzt es lokal
    async fn create_answer(
        &self,
        negotiation: &Self::Negotiation,
        offer: SessionDescription,
    ) -> Result<SessionDescription, PlatformError>;

    /// Setzt das Remote Answer
    async fn apply_answer(
        &self,
        negotiation: &Self::Negotiation,
        answer: SessionDescription,
    ) -> Result<(), PlatformError>;

    async fn add_candidate(
        &self,
        negotiation: &Self::Negotiation,
        candidate: IceCandidate,
    ) -> Result<(), PlatformError>;

    async fn release_media(&self, media: Self::Media);

    async fn close_negotiation(&self, negotiation: Self::Negotiation);
}
