//! CashShuffle coordination server.
//!
//! Untrusted clients negotiate a joint CoinShuffle transaction through this
//! semi-trusted relay: it frames and relays signed messages it never
//! inspects cryptographically, groups clients into fixed-size pools by mix
//! parameters, and adjudicates in-protocol blame with IP-level defenses
//! against repeat offenders.

pub mod cli;
pub mod config;
pub mod net;
pub mod proto;
pub mod security;
pub mod shuffle;
pub mod stats;

pub use config::ServerConfig;
pub use net::ServerContext;
pub use shuffle::Tracker;
