//! Transport layer: framing, connection handles, and the TCP/TLS/WebSocket
//! listeners that feed the dispatcher.

pub mod connection;
pub mod framing;
pub mod listener;
pub mod tls;
pub mod websocket;

pub use connection::{ConnId, Connection};
pub use listener::ServerContext;
