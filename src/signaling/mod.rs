//! Signaling Module - Relay-Server und WebSocket Client
//!
//! Dieses Modul verwaltet die Kommunikation zwischen zwei Endpoints:
//! - Nachrichtenformat auf dem Draht
//! - Relay Router (ID-Vergabe, Weiterleitung)
//! - WebSocket-Server und -Client

mod client;
mod messages;
mod router;
mod server;

pub use client::{websocket_url, SignalSender, SignalingClient, SignalingError, SignalingEvent};
pub use messages::*;
pub use router::{Connection, RelayRouter, RouteOutcome};
pub use server::{app, cors_layer, relay, serve, ServerError};
