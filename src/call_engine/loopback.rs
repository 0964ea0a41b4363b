//! Loopback-Plattform ohne echte Geräte
//!
//! Erzeugt synthetische SDPs und Candidates und führt Buch über alle
//! angelegten und freigegebenen Ressourcen. Gedacht für Headless-Endpoints
//! (z.B. Signaling-Tests gegen einen laufenden Relay).

use super::platform::{CandidateSink, MediaPlatform, PlatformError};
use crate::signaling::{CallKind, IceCandidate, SdpType, SessionDescription};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Zähler für alle Plattform-Operationen
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Ledger {
    pub media_acquired: usize,
    pub media_released: usize,
    pub negotiations_created: usize,
    pub negotiations_closed: usize,
    pub remote_descriptions: Vec<SdpType>,
    pub applied_candidates: Vec<String>,
}

impl Ledger {
    /// Alles, was angelegt wurde, ist auch wieder freigegeben
    pub fn is_balanced(&self) -> bool {
        self.media_acquired == self.media_released
            && self.negotiations_created == self.negotiations_closed
    }
}

#[derive(Debug)]
pub struct LoopbackMedia {
    id: u64,
    kind: CallKind,
}

#[derive(Debug)]
pub struct LoopbackNegotiation {
    id: u64,
    kind: CallKind,
    sink: CandidateSink,
}

#[derive(Debug, Clone, Default)]
pub struct LoopbackPlatform {
    ledger: Arc<Mutex<Ledger>>,
    next_id: Arc<AtomicU64>,
    fail_media: bool,
    local_candidates: usize,
}

impl LoopbackPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simuliert ein verweigertes Mikrofon/Kamera
    pub fn with_failing_media(mut self) -> Self {
        self.fail_media = true;
        self
    }

    /// Anzahl lokaler Candidates pro gesetzter Local Description
    pub fn with_local_candidates(mut self, count: usize) -> Self {
        self.local_candidates = count;
        self
    }

    pub fn ledger(&self) -> Ledger {
        self.ledger.lock().clone()
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn sdp(&self, sdp_type: SdpType, negotiation: &LoopbackNegotiation) -> SessionDescription {
        let body = format!(
            "v=0\r\no=- {} 2 IN IP4 127.0.0.1\r\ns=-\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\n{}",
            negotiation.id,
            if negotiation.kind.has_video() {
                "m=video 9 UDP/TLS/RTP/SAVPF 96\r\n"
            } else {
                ""
            }
        );
        match sdp_type {
            SdpType::Offer => SessionDescription::offer(body),
            SdpType::Answer => SessionDescription::answer(body),
        }
    }

    fn gather(&self, negotiation: &LoopbackNegotiation) {
        for n in 0..self.local_candidates {
            let mut candidate = IceCandidate::new(format!(
                "candidate:{} 1 udp 2122260223 127.0.0.1 {} typ host",
                negotiation.id,
                50000 + n
            ));
            candidate.sdp_mid = Some("0".to_string());
            candidate.sdp_mline_index = Some(0);
            negotiation.sink.push(candidate);
        }
    }
}

#[async_trait]
impl MediaPlatform for LoopbackPlatform {
    type Media = LoopbackMedia;
    type Negotiation = LoopbackNegotiation;

    async fn acquire_media(&self, kind: CallKind) -> Result<LoopbackMedia, PlatformError> {
        if self.fail_media {
            return Err(PlatformError::MediaUnavailable(format!(
                "{} device denied",
                kind
            )));
        }
        self.ledger.lock().media_acquired += 1;
        Ok(LoopbackMedia {
            id: self.next_id(),
            kind,
        })
    }

    async fn create_negotiation(
        &self,
        media: &LoopbackMedia,
        candidates: CandidateSink,
    ) -> Result<LoopbackNegotiation, PlatformError> {
        self.ledger.lock().negotiations_created += 1;
        tracing::debug!("Loopback negotiation for media {}", media.id);
        Ok(LoopbackNegotiation {
            id: self.next_id(),
            kind: media.kind,
            sink: candidates,
        })
    }

    async fn create_offer(
        &self,
        negotiation: &LoopbackNegotiation,
    ) -> Result<SessionDescription, PlatformError> {
        let offer = self.sdp(SdpType::Offer, negotiation);
        self.gather(negotiation);
        Ok(offer)
    }

    async fn create_answer(
        &self,
        negotiation: &LoopbackNegotiation,
        offer: SessionDescription,
    ) -> Result<SessionDescription, PlatformError> {
        if offer.sdp_type != SdpType::Offer || offer.sdp.is_empty() {
            return Err(PlatformError::InvalidSdp("expected an offer".to_string()));
        }
        self.ledger.lock().remote_descriptions.push(SdpType::Offer);
        let answer = self.sdp(SdpType::Answer, negotiation);
        self.gather(negotiation);
        Ok(answer)
    }

    async fn apply_answer(
        &self,
        _negotiation: &LoopbackNegotiation,
        answer: SessionDescription,
    ) -> Result<(), PlatformError> {
        if answer.sdp_type != SdpType::Answer {
            return Err(PlatformError::InvalidSdp("expected an answer".to_string()));
        }
        self.ledger.lock().remote_descriptions.push(SdpType::Answer);
        Ok(())
    }

    async fn add_candidate(
        &self,
        _negotiation: &LoopbackNegotiation,
        candidate: IceCandidate,
    ) -> Result<(), PlatformError> {
        if !candidate.candidate.starts_with("candidate:") {
            return Err(PlatformError::InvalidCandidate(candidate.candidate));
        }
        self.ledger.lock().applied_candidates.push(candidate.candidate);
        Ok(())
    }

    async fn release_media(&self, media: LoopbackMedia) {
        tracing::debug!("Loopback media {} released", media.id);
        self.ledger.lock().media_released += 1;
    }

    async fn close_negotiation(&self, negotiation: LoopbackNegotiation) {
        tracing::debug!("Loopback negotiation {} closed", negotiation.id);
        self.ledger.lock().negotiations_closed += 1;
    }
}
