//! Call Engine Module - Call Session und WebRTC
//!
//! Dieses Modul verwaltet:
//! - Die Zustandsmaschine eines Anrufs
//! - Die Ausführung ihrer Effekte auf einer Media-Plattform
//! - WebRTC Peer Connections mit Opus/VP8 Tracks

mod engine;
mod loopback;
mod platform;
mod session;
mod webrtc;

pub use engine::{CallEngine, SessionSnapshot};
pub use loopback::{Ledger, LoopbackMedia, LoopbackNegotiation, LoopbackPlatform};
pub use platform::{CandidateSink, MediaPlatform, PlatformError};
pub use session::{
    CallError, CallId, CallSession, Effect, EndReason, MediaHandle, NegotiationHandle,
    Notification, Phase, Role, SessionEvent,
};
pub use self::webrtc::{WebRtcMedia, WebRtcPlatform};
