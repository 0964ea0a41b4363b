//! Pulse Rendezvous - Signaling für P2P Audio/Video-Calls
//!
//! Zwei Endpoints finden sich über einen Relay-Server und handeln danach
//! eine direkte WebRTC-Verbindung aus:
//! - Relay Router mit WebSocket-Server (`signaling`)
//! - Call Session als Zustandsmaschine plus Engine (`call_engine`)
//! - `CallApp` verdrahtet beides für einen Endpoint

pub mod call_engine;
pub mod config;
pub mod signaling;

use call_engine::{
    CallEngine, CallError, MediaPlatform, Notification, Phase, SessionSnapshot, WebRtcPlatform,
};
use config::CallConfig;
use signaling::{CallKind, EndpointId, SignalingClient, SignalingError, SignalingEvent};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing_subscriber::EnvFilter;

/// Log-Filter, falls `RUST_LOG` nicht gesetzt ist
pub const DEFAULT_LOG_DIRECTIVES: &str = "rendezvous_lib=debug,pulse_rendezvous=debug,webrtc=warn";

/// Initialisiert das Logging (mehrfacher Aufruf ist harmlos)
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_DIRECTIVES));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

// ============================================================================
// CALL APP
// ============================================================================

/// Ein Endpoint: Verbindung zum Relay plus Call Engine
///
/// Eingehende Nachrichten gehen an die Engine, ausgehende über den
/// Signaling Client. Beim Drop wird ein laufender Anruf beendet und die
/// Verbindung geschlossen.
pub struct CallApp {
    endpoint_id: EndpointId,
    signaling: SignalingClient,
    engine: CallEngine,
    inbound_task: JoinHandle<()>,
}

impl CallApp {
    /// Verbindet mit dem Relay und startet die Engine auf `platform`
    pub async fn connect<P: MediaPlatform>(
        config: &CallConfig,
        platform: P,
    ) -> Result<Self, SignalingError> {
        tracing::info!("Starting endpoint...");

        let mut signaling = SignalingClient::new(config.signaling_url.clone());
        let mut signal_rx = signaling.connect().await?;

        let endpoint_id = signaling.endpoint_id().ok_or_else(|| {
            SignalingError::RegistrationFailed("No endpoint id".to_string())
        })?;
        let sender = signaling.sender().ok_or(SignalingError::NotConnected)?;

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
        let engine = CallEngine::spawn(platform, config, outbound_tx);

        // Engine -> Relay; endet, wenn die Engine stoppt
        tokio::spawn(async move {
            while let Some(outbound) = outbound_rx.recv().await {
                if let Err(e) = sender.send(outbound) {
                    tracing::error!("Failed to send signal: {}", e);
                }
            }
        });

        // Relay -> Engine
        let engine_ref = engine.clone();
        let inbound_task = tokio::spawn(async move {
            while let Some(inbound) = signal_rx.recv().await {
                tracing::debug!("Received {} from {}", inbound.signal.tag(), inbound.from);
                engine_ref.deliver(inbound);
            }
            tracing::info!("Signaling connection closed");
        });

        tracing::info!("Endpoint ready with id: {}", endpoint_id);
        Ok(Self {
            endpoint_id,
            signaling,
            engine,
            inbound_task,
        })
    }

    /// Wie `connect`, mit WebRTC als Media-Plattform
    pub async fn connect_webrtc(config: &CallConfig) -> Result<Self, SignalingError> {
        Self::connect(config, WebRtcPlatform::new(config)).await
    }

    /// Eigene ID, die an Anrufer weitergegeben werden kann
    pub fn endpoint_id(&self) -> &str {
        &self.endpoint_id
    }

    pub fn is_connected(&self) -> bool {
        self.signaling.is_connected()
    }

    /// Ruft einen anderen Endpoint an
    pub async fn start_call(&self, peer: &str, kind: CallKind) -> Result<(), CallError> {
        if peer == self.endpoint_id {
            return Err(CallError::SelfCall);
        }
        tracing::info!("Calling {} ({})", peer, kind);
        self.engine.start_call(peer, kind).await
    }

    pub async fn accept(&self) -> Result<(), CallError> {
        self.engine.accept().await
    }

    pub async fn reject(&self) -> Result<(), CallError> {
        self.engine.reject().await
    }

    pub async fn hangup(&self) -> Result<(), CallError> {
        self.engine.hangup().await
    }

    pub fn phase(&self) -> Phase {
        self.engine.phase()
    }

    pub fn state(&self) -> SessionSnapshot {
        self.engine.state()
    }

    /// Notifications der Call Session
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.engine.subscribe()
    }

    /// Verbindungs-Events des Signaling Clients
    pub fn subscribe_signaling(&self) -> broadcast::Receiver<SignalingEvent> {
        self.signaling.subscribe()
    }
}

impl Drop for CallApp {
    fn drop(&mut self) {
        // Ohne den Inbound-Task hält nur noch `self.engine` die Engine am Leben
        self.inbound_task.abort();
    }
}

impl std::fmt::Debug for CallApp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallApp")
            .field("endpoint_id", &self.endpoint_id)
            .field("engine", &self.engine)
            .finish()
    }
}
