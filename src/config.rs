//! Konfiguration für Relay-Server und Endpoints

use clap::Parser;
use std::env;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Standard STUN Server
pub const DEFAULT_STUN_SERVERS: &[&str] = &[
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
    "stun:stun2.l.google.com:19302",
];

pub const DEFAULT_SIGNALING_URL: &str = "ws://localhost:5000/ws";

// ============================================================================
// RELAY SERVER
// ============================================================================

#[derive(Parser, Debug, Clone, PartialEq, Eq)]
#[command(name = "pulse-rendezvous")]
#[command(about = "Signaling relay for P2P audio/video calls")]
pub struct RelayConfig {
    /// Port auf dem der Relay lauscht
    #[arg(long, env = "PORT", default_value_t = 5000)]
    pub port: u16,

    /// Erlaubter Origin für CORS (`*` = beliebig)
    #[arg(long, env = "FRONTEND_ORIGIN", default_value = "*")]
    pub allowed_origin: String,
}

impl RelayConfig {
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.port))
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port: 5000,
            allowed_origin: "*".to_string(),
        }
    }
}

// ============================================================================
// ENDPOINT
// ============================================================================

/// Konfiguration eines Endpoints (Anrufer/Angerufener)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallConfig {
    pub signaling_url: String,
    pub ice_servers: Vec<String>,
    /// `None` = kein Timeout beim Wählen
    pub dial_timeout: Option<Duration>,
}

impl CallConfig {
    /// Liest `SIGNALING_URL` und `DIAL_TIMEOUT_SECS`
    pub fn from_env() -> Self {
        let signaling_url =
            env::var("SIGNALING_URL").unwrap_or_else(|_| DEFAULT_SIGNALING_URL.to_string());
        let dial_timeout = env::var("DIAL_TIMEOUT_SECS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);

        Self {
            signaling_url,
            dial_timeout,
            ..Self::default()
        }
    }

    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = Some(timeout);
        self
    }
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            signaling_url: DEFAULT_SIGNALING_URL.to_string(),
            ice_servers: DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect(),
            dial_timeout: None,
        }
    }
}
