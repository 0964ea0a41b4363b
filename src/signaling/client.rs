//! WebSocket Client für den Signaling-Relay
//!
//! Verbindet einen Endpoint mit dem Relay:
//! - Verbindung aufbauen und auf die zugewiesene Endpoint-ID warten
//! - Ausgehende Nachrichten in Reihenfolge senden
//! - Eingehende Nachrichten parsen und weiterreichen

use super::messages::*;
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

/// Wie lange auf die Welcome-Nachricht gewartet wird
const REGISTRATION_TIMEOUT_SECS: u64 = 10;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalingError {
    #[error("Invalid signaling URL: {0}")]
    InvalidUrl(String),

    #[error("WebSocket connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Not connected to signaling server")]
    NotConnected,

    #[error("Failed to send message: {0}")]
    SendFailed(String),

    #[error("Registration failed: {0}")]
    RegistrationFailed(String),
}

// ============================================================================
// SIGNALING EVENTS
// ============================================================================

/// Events die vom SignalingClient ausgelöst werden
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingEvent {
    /// Verbunden mit dem Relay
    Connected,

    /// Endpoint-ID vom Relay erhalten
    Registered { endpoint_id: EndpointId },

    /// Verbindung getrennt
    Disconnected,
}

// ============================================================================
// CLIENT STATE
// ============================================================================

#[derive(Debug, Clone, Default)]
struct ClientState {
    is_connected: bool,
    endpoint_id: Option<EndpointId>,
}

/// Normalisiert die Relay-URL (`http` -> `ws`, `https` -> `wss`)
pub fn websocket_url(server_url: &str) -> Result<Url, SignalingError> {
    let mut url =
        Url::parse(server_url).map_err(|e| SignalingError::InvalidUrl(e.to_string()))?;

    let scheme = match url.scheme() {
        "ws" | "http" => "ws",
        "wss" | "https" => "wss",
        other => {
            return Err(SignalingError::InvalidUrl(format!(
                "unsupported scheme '{}'",
                other
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| SignalingError::InvalidUrl(server_url.to_string()))?;
    Ok(url)
}

// ============================================================================
// SIGNALING CLIENT
// ============================================================================

/// WebSocket Client für die Kommunikation mit dem Relay
pub struct SignalingClient {
    server_url: String,
    state: Arc<RwLock<ClientState>>,
    tx: Option<mpsc::UnboundedSender<String>>,
    event_tx: broadcast::Sender<SignalingEvent>,
}

impl SignalingClient {
    pub fn new(server_url: impl Into<String>) -> Self {
        let (event_tx, _) = broadcast::channel(100);

        Self {
            server_url: server_url.into(),
            state: Arc::new(RwLock::new(ClientState::default())),
            tx: None,
            event_tx,
        }
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<SignalingEvent> {
        self.event_tx.subscribe()
    }

    /// Vom Relay zugewiesene ID (falls registriert)
    pub fn endpoint_id(&self) -> Option<EndpointId> {
        self.state.read().endpoint_id.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state.read().is_connected
    }

    /// Verbindet mit dem Relay und wartet auf die Endpoint-ID
    ///
    /// Gibt den Receiver für eingehende Nachrichten zurück. Er liefert jede
    /// Nachricht genau einmal und in Empfangsreihenfolge.
    pub async fn connect(
        &mut self,
    ) -> Result<mpsc::UnboundedReceiver<InboundSignal>, SignalingError> {
        let ws_url = websocket_url(&self.server_url)?;
        tracing::info!("Connecting to signaling relay: {}", ws_url);

        let (ws_stream, _) = connect_async(ws_url.as_str())
            .await
            .map_err(|e| SignalingError::ConnectionFailed(e.to_string()))?;

        let (mut write, mut read) = ws_stream.split();

        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        self.tx = Some(tx);

        {
            let mut state = self.state.write();
            state.is_connected = true;
            state.endpoint_id = None;
        }
        let _ = self.event_tx.send(SignalingEvent::Connected);

        let (signal_tx, signal_rx) = mpsc::unbounded_channel::<InboundSignal>();
        let (reg_tx, reg_rx) = oneshot::channel::<EndpointId>();

        // Read-Task
        let state = Arc::clone(&self.state);
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            let mut reg_tx = Some(reg_tx);

            while let Some(msg_result) = read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerFrame>(&text) {
                        Ok(ServerFrame::Welcome(welcome)) => {
                            tracing::info!("Registered as {}", welcome.id);
                            state.write().endpoint_id = Some(welcome.id.clone());
                            if let Some(reg_tx) = reg_tx.take() {
                                let _ = reg_tx.send(welcome.id.clone());
                            }
                            let _ = event_tx.send(SignalingEvent::Registered {
                                endpoint_id: welcome.id,
                            });
                        }
                        Ok(ServerFrame::Signal(envelope)) => match envelope.into_inbound() {
                            Some(inbound) => {
                                let _ = signal_tx.send(inbound);
                            }
                            None => tracing::warn!("Dropping relay frame without sender"),
                        },
                        Err(e) => {
                            tracing::warn!("Ignoring malformed relay frame: {}", e);
                        }
                    },
                    Ok(Message::Close(_)) => {
                        tracing::info!("WebSocket closed by relay");
                        break;
                    }
                    Err(e) => {
                        tracing::error!("WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }

            state.write().is_connected = false;
            let _ = event_tx.send(SignalingEvent::Disconnected);
        });

        // Write-Task
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = write.send(Message::Text(msg)).await {
                    tracing::error!("Failed to send WebSocket message: {}", e);
                    break;
                }
            }
            let _ = write.close().await;
        });

        tokio::select! {
            result = reg_rx => {
                result.map_err(|_| {
                    SignalingError::RegistrationFailed("Connection closed".to_string())
                })?;
                Ok(signal_rx)
            }
            _ = tokio::time::sleep(tokio::time::Duration::from_secs(REGISTRATION_TIMEOUT_SECS)) => {
                Err(SignalingError::RegistrationFailed("Timeout".to_string()))
            }
        }
    }

    /// Gibt einen Sender zurück, der unabhängig vom Client genutzt werden kann
    pub fn sender(&self) -> Option<SignalSender> {
        self.tx.clone().map(|tx| SignalSender { tx })
    }

    /// Sendet eine Nachricht an einen anderen Endpoint (non-blocking)
    pub fn send(&self, outbound: OutboundSignal) -> Result<(), SignalingError> {
        let tx = self.tx.as_ref().ok_or(SignalingError::NotConnected)?;
        SignalSender { tx: tx.clone() }.send(outbound)
    }

    /// Trennt die Verbindung; der Relay meldet den Endpoint ab
    pub fn disconnect(&mut self) {
        self.tx = None;
    }
}

impl std::fmt::Debug for SignalingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalingClient")
            .field("server_url", &self.server_url)
            .field("state", &*self.state.read())
            .finish()
    }
}

/// Klonbarer Sende-Handle auf eine bestehende Verbindung
#[derive(Debug, Clone)]
pub struct SignalSender {
    tx: mpsc::UnboundedSender<String>,
}

impl SignalSender {
    pub fn send(&self, outbound: OutboundSignal) -> Result<(), SignalingError> {
        let json = serde_json::to_string(&outbound.into_envelope())
            .map_err(|e| SignalingError::SendFailed(e.to_string()))?;
        self.tx
            .send(json)
            .map_err(|_| SignalingError::NotConnected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_websocket_url_maps_http_schemes() {
        assert_eq!(
            websocket_url("http://localhost:5000/ws").unwrap().as_str(),
            "ws://localhost:5000/ws"
        );
        assert_eq!(
            websocket_url("https://relay.example.com/ws").unwrap().scheme(),
            "wss"
        );
        assert_eq!(
            websocket_url("ws://127.0.0.1:5000/ws").unwrap().as_str(),
            "ws://127.0.0.1:5000/ws"
        );
    }

    #[test]
    fn test_websocket_url_rejects_garbage() {
        assert!(matches!(
            websocket_url("not a url"),
            Err(SignalingError::InvalidUrl(_))
        ));
        assert!(matches!(
            websocket_url("ftp://localhost/ws"),
            Err(SignalingError::InvalidUrl(_))
        ));
    }

    #[test]
    fn test_send_without_connection_fails() {
        let client = SignalingClient::new("ws://localhost:5000/ws");
        assert!(!client.is_connected());
        assert!(client.endpoint_id().is_none());
        assert!(client.sender().is_none());
        assert_eq!(
            client.send(OutboundSignal::new("peer", Signal::CallEnd)),
            Err(SignalingError::NotConnected)
        );
    }

    #[test]
    fn test_sender_writes_envelope_json() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sender = SignalSender { tx };

        sender
            .send(OutboundSignal::new(
                "peer-b",
                Signal::CallRequest {
                    call_kind: CallKind::Video,
                },
            ))
            .unwrap();

        let json: serde_json::Value = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(json["type"], "call-request");
        assert_eq!(json["to"], "peer-b");
        assert_eq!(json["callKind"], "video");
        assert!(json.get("from").is_none());
    }
}
