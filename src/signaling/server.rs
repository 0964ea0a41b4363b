//! WebSocket Signaling-Server
//!
//! Jede WebSocket-Verbindung wird beim Relay Router registriert. Eingehende
//! Frames werden geparst, mit der ID des Absenders gestempelt und an das
//! Ziel weitergeleitet. Fehlerhafte Frames werden verworfen, die Verbindung
//! bleibt offen.

use super::messages::{ServerFrame, Signal, SignalEnvelope};
use super::router::{RelayRouter, RouteOutcome};
use crate::config::RelayConfig;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    http::{HeaderValue, Method},
    response::Response,
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Invalid allowed origin '{0}'")]
    InvalidOrigin(String),

    #[error("Server I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Baut den CORS-Layer aus dem konfigurierten Origin (`*` = beliebig)
pub fn cors_layer(allowed_origin: &str) -> Result<CorsLayer, ServerError> {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET])
        .allow_headers(Any);

    if allowed_origin.trim() == "*" {
        return Ok(layer.allow_origin(Any));
    }

    let origin = HeaderValue::from_str(allowed_origin.trim())
        .map_err(|_| ServerError::InvalidOrigin(allowed_origin.to_string()))?;
    Ok(layer.allow_origin(origin))
}

/// Axum-Router mit `/ws` und `/health`
pub fn app(router: Arc<RelayRouter>, config: &RelayConfig) -> Result<Router, ServerError> {
    Ok(Router::new()
        .route("/ws", get(websocket_handler))
        .route("/health", get(health_check))
        .with_state(router)
        .layer(cors_layer(&config.allowed_origin)?)
        .layer(TraceLayer::new_for_http()))
}

/// Startet den Server auf einem bereits gebundenen Listener
pub async fn serve(
    listener: TcpListener,
    router: Arc<RelayRouter>,
    config: &RelayConfig,
) -> Result<(), ServerError> {
    let app = app(router, config)?;
    if let Ok(addr) = listener.local_addr() {
        tracing::info!("Signaling relay listening on {}", addr);
    }
    axum::serve(listener, app).await?;
    Ok(())
}

async fn health_check(State(router): State<Arc<RelayRouter>>) -> String {
    format!("ok ({} endpoints)", router.len())
}

async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(router): State<Arc<RelayRouter>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, router))
}

async fn handle_socket(socket: WebSocket, router: Arc<RelayRouter>) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerFrame>();
    let endpoint_id = router.register(tx);

    // Write-Task: Frames in Reihenfolge auf den Socket schreiben
    let writer_id = endpoint_id.clone();
    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let json = match serde_json::to_string(&frame) {
                Ok(json) => json,
                Err(e) => {
                    tracing::error!("Failed to encode frame for {}: {}", writer_id, e);
                    continue;
                }
            };
            if sink.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
        tracing::debug!("Writer task ended for {}", writer_id);
    });

    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(text)) => match serde_json::from_str::<SignalEnvelope>(&text) {
                Ok(envelope) => {
                    relay(&router, &endpoint_id, envelope);
                }
                Err(e) => {
                    tracing::warn!("Ignoring malformed frame from {}: {}", endpoint_id, e);
                }
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!("WebSocket error from {}: {}", endpoint_id, e);
                break;
            }
        }
    }

    router.deregister(&endpoint_id);
    writer.abort();
}

/// Leitet einen Client-Frame weiter
///
/// `call-request` wird für den Angerufenen zu `call-incoming` mit der ID
/// des Anrufers. Das vom Client gelieferte `from` spielt keine Rolle.
pub fn relay(router: &RelayRouter, sender: &str, envelope: SignalEnvelope) -> RouteOutcome {
    let signal = match envelope.signal {
        Signal::CallRequest { call_kind } | Signal::CallIncoming { call_kind, .. } => {
            Signal::CallIncoming {
                call_kind,
                from_id: sender.to_string(),
            }
        }
        other => other,
    };

    router.route(&envelope.to, signal, sender)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::messages::{CallKind, EndpointId};

    fn connect(router: &RelayRouter) -> (EndpointId, mpsc::UnboundedReceiver<ServerFrame>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = router.register(tx);
        let _welcome = rx.try_recv();
        (id, rx)
    }

    fn next_signal(rx: &mut mpsc::UnboundedReceiver<ServerFrame>) -> SignalEnvelope {
        match rx.try_recv() {
            Ok(ServerFrame::Signal(envelope)) => envelope,
            other => panic!("expected signal frame, got {:?}", other),
        }
    }

    #[test]
    fn test_call_request_becomes_call_incoming() {
        let router = RelayRouter::new();
        let (x, _rx_x) = connect(&router);
        let (y, mut rx_y) = connect(&router);

        let envelope = SignalEnvelope {
            to: y.clone(),
            from: None,
            signal: Signal::CallRequest {
                call_kind: CallKind::Audio,
            },
        };
        assert_eq!(relay(&router, &x, envelope), RouteOutcome::Delivered);

        let delivered = next_signal(&mut rx_y);
        assert_eq!(delivered.from.as_deref(), Some(x.as_str()));
        assert_eq!(
            delivered.signal,
            Signal::CallIncoming {
                call_kind: CallKind::Audio,
                from_id: x.clone(),
            }
        );
    }

    #[test]
    fn test_client_supplied_from_is_overwritten() {
        let router = RelayRouter::new();
        let (x, _rx_x) = connect(&router);
        let (y, mut rx_y) = connect(&router);

        let envelope: SignalEnvelope = serde_json::from_str(&format!(
            r#"{{"type":"call-incoming","to":"{}","from":"mallory","callKind":"video","fromId":"mallory"}}"#,
            y
        ))
        .unwrap();
        relay(&router, &x, envelope);

        let delivered = next_signal(&mut rx_y);
        assert_eq!(delivered.from.as_deref(), Some(x.as_str()));
        assert_eq!(
            delivered.signal,
            Signal::CallIncoming {
                call_kind: CallKind::Video,
                from_id: x.clone(),
            }
        );
    }

    #[test]
    fn test_relay_to_self_is_noop() {
        let router = RelayRouter::new();
        let (x, mut rx_x) = connect(&router);

        let envelope = SignalEnvelope {
            to: x.clone(),
            from: None,
            signal: Signal::CallEnd,
        };
        assert_eq!(relay(&router, &x, envelope), RouteOutcome::SelfLoop);
        assert!(rx_x.try_recv().is_err());
    }

    #[test]
    fn test_cors_layer_accepts_wildcard_and_exact_origin() {
        assert!(cors_layer("*").is_ok());
        assert!(cors_layer("http://localhost:5173").is_ok());
        assert!(matches!(
            cors_layer("bad\norigin"),
            Err(ServerError::InvalidOrigin(_))
        ));
    }
}
