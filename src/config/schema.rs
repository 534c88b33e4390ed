//! Configuration schema definitions.
//!
//! All fields deserialize from the optional config file and can be
//! overridden by command-line flags; defaults match the well-known
//! CashShuffle ports.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Main shuffle port (TCP).
    pub port: u16,

    /// WebSocket shuffle port; 0 disables the websocket listener.
    pub websocket_port: u16,

    /// Stats HTTP port; 0 disables the stats listener.
    pub stats_port: u16,

    /// Players per pool.
    pub pool_size: usize,

    /// Path to a PEM certificate for TLS; empty disables.
    pub cert: String,

    /// Path to the matching PEM private key.
    pub key: String,

    /// Hostname to manage via ACME. Mutually exclusive with cert/key.
    pub auto_cert: String,

    /// Address the public listeners bind to.
    pub bind_ip: String,

    /// Verbose wire logging.
    pub debug: bool,

    /// Enable the secondary tor listener set.
    pub tor: bool,

    /// Address the tor listeners bind to.
    pub tor_bind_ip: String,

    pub tor_port: u16,
    pub tor_websocket_port: u16,
    pub tor_stats_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 1337,
            websocket_port: 1338,
            stats_port: 8080,
            pool_size: 5,
            cert: String::new(),
            key: String::new(),
            auto_cert: String::new(),
            bind_ip: "0.0.0.0".to_string(),
            debug: false,
            tor: false,
            tor_bind_ip: "127.0.0.1".to_string(),
            tor_port: 1339,
            tor_websocket_port: 1340,
            tor_stats_port: 8081,
        }
    }
}

impl ServerConfig {
    pub fn tls_enabled(&self) -> bool {
        !self.auto_cert.is_empty() || (!self.cert.is_empty() && !self.key.is_empty())
    }
}
