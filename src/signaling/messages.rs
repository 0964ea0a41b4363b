//! Message Types für das Signaling-Protokoll
//!
//! Alle Frames sind JSON-Textframes. Das Feld `type` trägt den Tag der
//! Nachricht (kebab-case), alle weiteren Felder sind camelCase, damit
//! Browser-Clients die Nachrichten ohne Mapping verwenden können.

use serde::{Deserialize, Serialize};

/// Opaque Kennung einer Verbindung, vom Relay beim Connect vergeben
pub type EndpointId = String;

// ============================================================================
// PAYLOAD TYPES
// ============================================================================

/// Art des Anrufs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallKind {
    Audio,
    Video,
}

impl CallKind {
    pub fn has_video(self) -> bool {
        matches!(self, CallKind::Video)
    }
}

impl std::fmt::Display for CallKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallKind::Audio => f.write_str("audio"),
            CallKind::Video => f.write_str("video"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// Negotiation Description (SDP Offer oder Answer)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE Candidate im Format von `RTCIceCandidateInit`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }
}

// ============================================================================
// SIGNAL MESSAGES
// ============================================================================

/// Alle Signal-Nachrichten, die über das Relay laufen
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Signal {
    /// Anrufer möchte anrufen (Client → Server)
    CallRequest {
        #[serde(rename = "callKind")]
        call_kind: CallKind,
    },

    /// Eingehender Anruf (Server → Client)
    CallIncoming {
        #[serde(rename = "callKind")]
        call_kind: CallKind,
        #[serde(rename = "fromId")]
        from_id: EndpointId,
    },

    NegotiationOffer {
        #[serde(rename = "sessionDescription")]
        session_description: SessionDescription,
    },

    NegotiationAnswer {
        #[serde(rename = "sessionDescription")]
        session_description: SessionDescription,
    },

    IceCandidate { candidate: IceCandidate },

    CallReject,

    CallEnd,
}

impl Signal {
    /// Tag wie er auf dem Draht steht
    pub fn tag(&self) -> &'static str {
        match self {
            Signal::CallRequest { .. } => "call-request",
            Signal::CallIncoming { .. } => "call-incoming",
            Signal::NegotiationOffer { .. } => "negotiation-offer",
            Signal::NegotiationAnswer { .. } => "negotiation-answer",
            Signal::IceCandidate { .. } => "ice-candidate",
            Signal::CallReject => "call-reject",
            Signal::CallEnd => "call-end",
        }
    }
}

/// Umschlag für jede Signal-Nachricht auf dem Draht
///
/// `from` wird vom Server gestempelt. Ein vom Client mitgeschickter Wert
/// wird beim Relay überschrieben.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalEnvelope {
    pub to: EndpointId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<EndpointId>,
    #[serde(flatten)]
    pub signal: Signal,
}

// ============================================================================
// SERVER → CLIENT FRAMES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WelcomeKind {
    #[serde(rename = "registered")]
    Registered,
}

/// Erster Frame nach dem Connect: teilt dem Endpoint seine ID mit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Welcome {
    #[serde(rename = "type")]
    pub kind: WelcomeKind,
    pub id: EndpointId,
    pub timestamp: i64,
}

impl Welcome {
    pub fn new(id: EndpointId) -> Self {
        Self {
            kind: WelcomeKind::Registered,
            id,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// Alles, was der Server an einen Client schickt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerFrame {
    Welcome(Welcome),
    Signal(SignalEnvelope),
}

// ============================================================================
// HELPER TYPES
// ============================================================================

/// Eingehende Nachricht aus Sicht einer Call Session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundSignal {
    pub from: EndpointId,
    pub signal: Signal,
}

/// Ausgehende Nachricht einer Call Session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundSignal {
    pub to: EndpointId,
    pub signal: Signal,
}

impl OutboundSignal {
    pub fn new(to: impl Into<EndpointId>, signal: Signal) -> Self {
        Self {
            to: to.into(),
            signal,
        }
    }

    pub fn into_envelope(self) -> SignalEnvelope {
        SignalEnvelope {
            to: self.to,
            from: None,
            signal: self.signal,
        }
    }
}

impl SignalEnvelope {
    /// Nur gestempelte Umschläge (mit `from`) sind für eine Session gültig
    pub fn into_inbound(self) -> Option<InboundSignal> {
        let from = self.from?;
        Some(InboundSignal {
            from,
            signal: self.signal,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_call_request_wire_shape() {
        let envelope = OutboundSignal::new(
            "peer-b",
            Signal::CallRequest {
                call_kind: CallKind::Video,
            },
        )
        .into_envelope();

        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(
            value,
            json!({ "type": "call-request", "to": "peer-b", "callKind": "video" })
        );
    }

    #[test]
    fn test_parse_browser_offer() {
        let text = r#"{
            "type": "negotiation-offer",
            "to": "peer-a",
            "from": "spoofed",
            "sessionDescription": { "type": "offer", "sdp": "v=0" }
        }"#;

        let envelope: SignalEnvelope = serde_json::from_str(text).unwrap();
        assert_eq!(envelope.to, "peer-a");
        assert_eq!(envelope.from.as_deref(), Some("spoofed"));
        assert_eq!(
            envelope.signal,
            Signal::NegotiationOffer {
                session_description: SessionDescription::offer("v=0"),
            }
        );
    }

    #[test]
    fn test_unit_variants_carry_only_tag() {
        let envelope: SignalEnvelope =
            serde_json::from_str(r#"{"type":"call-end","to":"x"}"#).unwrap();
        assert_eq!(envelope.signal, Signal::CallEnd);
        assert_eq!(envelope.signal.tag(), "call-end");
        assert!(envelope.into_inbound().is_none());
    }

    #[test]
    fn test_candidate_optional_fields() {
        let text = r#"{"type":"ice-candidate","to":"x","from":"y",
            "candidate":{"candidate":"candidate:1 1 UDP 1 10.0.0.1 5000 typ host","sdpMid":"0","sdpMLineIndex":0}}"#;
        let inbound = serde_json::from_str::<SignalEnvelope>(text)
            .unwrap()
            .into_inbound()
            .unwrap();

        match inbound.signal {
            Signal::IceCandidate { candidate } => {
                assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
                assert_eq!(candidate.sdp_mline_index, Some(0));
                assert!(candidate.username_fragment.is_none());
            }
            other => panic!("unexpected signal {:?}", other),
        }
    }

    #[test]
    fn test_server_frame_distinguishes_welcome() {
        let welcome: ServerFrame =
            serde_json::from_str(r#"{"type":"registered","id":"abc","timestamp":1}"#).unwrap();
        assert!(matches!(welcome, ServerFrame::Welcome(ref w) if w.id == "abc"));

        let signal: ServerFrame =
            serde_json::from_str(r#"{"type":"call-reject","to":"abc","from":"def"}"#).unwrap();
        assert!(matches!(signal, ServerFrame::Signal(ref e) if e.signal == Signal::CallReject));
    }
}
