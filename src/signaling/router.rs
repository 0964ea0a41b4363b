//! Relay Router - adressbasiertes Weiterleiten von Signal-Nachrichten
//!
//! Jeder verbundene Endpoint bekommt beim Connect eine frische ID und
//! einen eigenen FIFO-Kanal. Der Router interpretiert keine Payloads:
//! er stempelt nur den Absender und legt die Nachricht in den Kanal
//! des Ziels.

use super::messages::{EndpointId, ServerFrame, Signal, SignalEnvelope, Welcome};
use parking_lot::RwLock;
use std::collections::HashMap;
use tokio::sync::mpsc;

/// Sendeseite einer Verbindung (Frames werden in Reihenfolge geschrieben)
pub type Connection = mpsc::UnboundedSender<ServerFrame>;

/// Ergebnis eines `route` Aufrufs
///
/// Kein Fehler: ein unerreichbarer Peer ist für den Absender unsichtbar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    Delivered,
    Unreachable,
    SelfLoop,
}

/// Tabelle ID → Verbindung
#[derive(Default)]
pub struct RelayRouter {
    connections: RwLock<HashMap<EndpointId, Connection>>,
}

impl RelayRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bindet eine neue Verbindung an eine frische ID
    ///
    /// Der Verbindung wird sofort ein Welcome-Frame mit ihrer ID geschickt.
    pub fn register(&self, connection: Connection) -> EndpointId {
        let mut connections = self.connections.write();

        let id = loop {
            let candidate = uuid::Uuid::new_v4().to_string();
            if !connections.contains_key(&candidate) {
                break candidate;
            }
        };

        let _ = connection.send(ServerFrame::Welcome(Welcome::new(id.clone())));
        connections.insert(id.clone(), connection);

        tracing::info!("Endpoint registered: {} ({} online)", id, connections.len());
        id
    }

    /// Liefert `signal` an `target` aus und stempelt `sender` als Absender
    pub fn route(&self, target: &str, signal: Signal, sender: &str) -> RouteOutcome {
        if target == sender {
            tracing::debug!("Dropping {} from {} addressed to itself", signal.tag(), sender);
            return RouteOutcome::SelfLoop;
        }

        let tag = signal.tag();
        let envelope = SignalEnvelope {
            to: target.to_string(),
            from: Some(sender.to_string()),
            signal,
        };

        let connections = self.connections.read();
        let Some(connection) = connections.get(target) else {
            tracing::debug!("{} from {} to {}: peer unreachable", tag, sender, target);
            return RouteOutcome::Unreachable;
        };

        match connection.send(ServerFrame::Signal(envelope)) {
            Ok(()) => {
                tracing::debug!("{} routed {} -> {}", tag, sender, target);
                RouteOutcome::Delivered
            }
            Err(_) => {
                // Verbindung schließt gerade, deregister folgt
                tracing::debug!("{} from {} to {}: connection closing", tag, sender, target);
                RouteOutcome::Unreachable
            }
        }
    }

    /// Löst die ID von ihrer Verbindung; mehrfacher Aufruf ist harmlos
    pub fn deregister(&self, id: &str) -> bool {
        let mut connections = self.connections.write();
        let removed = connections.remove(id).is_some();
        if removed {
            tracing::info!("Endpoint deregistered: {} ({} online)", id, connections.len());
        }
        removed
    }

    pub fn is_registered(&self, id: &str) -> bool {
        self.connections.read().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.read().is_empty()
    }
}

impl std::fmt::Debug for RelayRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayRouter")
            .field("endpoints", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::messages::CallKind;

    fn connect(router: &RelayRouter) -> (EndpointId, mpsc::UnboundedReceiver<ServerFrame>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = router.register(tx);
        match rx.try_recv() {
            Ok(ServerFrame::Welcome(welcome)) => assert_eq!(welcome.id, id),
            other => panic!("expected welcome frame, got {:?}", other),
        }
        (id, rx)
    }

    #[test]
    fn test_register_assigns_unique_ids() {
        let router = RelayRouter::new();
        let (a, _rx_a) = connect(&router);
        let (b, _rx_b) = connect(&router);

        assert_ne!(a, b);
        assert_eq!(router.len(), 2);
        assert!(router.is_registered(&a));
    }

    #[test]
    fn test_route_stamps_sender() {
        let router = RelayRouter::new();
        let (a, _rx_a) = connect(&router);
        let (b, mut rx_b) = connect(&router);

        let outcome = router.route(&b, Signal::CallEnd, &a);
        assert_eq!(outcome, RouteOutcome::Delivered);

        match rx_b.try_recv() {
            Ok(ServerFrame::Signal(envelope)) => {
                assert_eq!(envelope.from.as_deref(), Some(a.as_str()));
                assert_eq!(envelope.to, b);
                assert_eq!(envelope.signal, Signal::CallEnd);
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn test_route_preserves_order() {
        let router = RelayRouter::new();
        let (a, _rx_a) = connect(&router);
        let (b, mut rx_b) = connect(&router);

        router.route(
            &b,
            Signal::CallRequest {
                call_kind: CallKind::Audio,
            },
            &a,
        );
        router.route(&b, Signal::CallReject, &a);
        router.route(&b, Signal::CallEnd, &a);

        let tags: Vec<&str> = std::iter::from_fn(|| rx_b.try_recv().ok())
            .map(|frame| match frame {
                ServerFrame::Signal(envelope) => envelope.signal.tag(),
                ServerFrame::Welcome(_) => "welcome",
            })
            .collect();
        assert_eq!(tags, vec!["call-request", "call-reject", "call-end"]);
    }

    #[test]
    fn test_unknown_target_is_silent() {
        let router = RelayRouter::new();
        let (a, mut rx_a) = connect(&router);

        assert_eq!(
            router.route("nobody", Signal::CallEnd, &a),
            RouteOutcome::Unreachable
        );
        assert!(rx_a.try_recv().is_err());
    }

    #[test]
    fn test_self_loop_is_dropped() {
        let router = RelayRouter::new();
        let (a, mut rx_a) = connect(&router);

        assert_eq!(router.route(&a, Signal::CallEnd, &a), RouteOutcome::SelfLoop);
        assert!(rx_a.try_recv().is_err());
    }

    #[test]
    fn test_deregister_makes_routes_noops() {
        let router = RelayRouter::new();
        let (a, _rx_a) = connect(&router);
        let (b, _rx_b) = connect(&router);

        assert!(router.deregister(&b));
        assert!(!router.deregister(&b));
        assert_eq!(
            router.route(&b, Signal::CallEnd, &a),
            RouteOutcome::Unreachable
        );
        assert_eq!(router.len(), 1);
    }

    #[test]
    fn test_closed_receiver_is_unreachable() {
        let router = RelayRouter::new();
        let (a, _rx_a) = connect(&router);
        let (b, rx_b) = connect(&router);
        drop(rx_b);

        assert_eq!(
            router.route(&b, Signal::CallEnd, &a),
            RouteOutcome::Unreachable
        );
    }
}
