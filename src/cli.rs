//! Command-line argument parsing. Flags override the config file.

use clap::Parser;

use crate::config::ServerConfig;

#[derive(Parser, Debug)]
#[command(name = "cashshuffle", about = "CashShuffle server.", disable_version_flag = true)]
pub struct Cli {
    /// Server port
    #[arg(short = 'p', long)]
    pub port: Option<u16>,

    /// Websocket port
    #[arg(short = 'w', long)]
    pub websocket_port: Option<u16>,

    /// Stats server port
    #[arg(short = 'z', long)]
    pub stats_port: Option<u16>,

    /// Pool size
    #[arg(short = 's', long)]
    pub pool_size: Option<usize>,

    /// Path to server.crt for TLS
    #[arg(short = 'c', long)]
    pub cert: Option<String>,

    /// Path to server.key for TLS
    #[arg(short = 'k', long)]
    pub key: Option<String>,

    /// Register hostname with LetsEncrypt
    #[arg(short = 'a', long, conflicts_with_all = ["cert", "key"])]
    pub auto_cert: Option<String>,

    /// IP address to bind to
    #[arg(short = 'b', long)]
    pub bind_ip: Option<String>,

    /// Enable secondary listener for tor connections
    #[arg(short = 't', long)]
    pub tor: bool,

    /// IP address to bind to for tor
    #[arg(long)]
    pub tor_bind_ip: Option<String>,

    /// Tor server port
    #[arg(long)]
    pub tor_port: Option<u16>,

    /// Tor websocket port
    #[arg(long)]
    pub tor_websocket_port: Option<u16>,

    /// Tor stats server port
    #[arg(long)]
    pub tor_stats_port: Option<u16>,

    /// Debug mode
    #[arg(short = 'd', long)]
    pub debug: bool,

    /// Display version
    #[arg(short = 'v', long)]
    pub version: bool,
}

impl Cli {
    /// Overlay the parsed flags on a loaded config.
    pub fn apply(&self, config: &mut ServerConfig) {
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(port) = self.websocket_port {
            config.websocket_port = port;
        }
        if let Some(port) = self.stats_port {
            config.stats_port = port;
        }
        if let Some(size) = self.pool_size {
            config.pool_size = size;
        }
        if let Some(cert) = &self.cert {
            config.cert = cert.clone();
        }
        if let Some(key) = &self.key {
            config.key = key.clone();
        }
        if let Some(host) = &self.auto_cert {
            config.auto_cert = host.clone();
        }
        if let Some(ip) = &self.bind_ip {
            config.bind_ip = ip.clone();
        }
        if self.tor {
            config.tor = true;
        }
        if let Some(ip) = &self.tor_bind_ip {
            config.tor_bind_ip = ip.clone();
        }
        if let Some(port) = self.tor_port {
            config.tor_port = port;
        }
        if let Some(port) = self.tor_websocket_port {
            config.tor_websocket_port = port;
        }
        if let Some(port) = self.tor_stats_port {
            config.tor_stats_port = port;
        }
        if self.debug {
            config.debug = true;
        }
    }
}
