//! The coordination core: player and pool state, the global tracker, and
//! the dispatcher that serializes every inbound envelope.

pub mod dispatcher;
pub mod player;
pub mod pool;
pub mod session;
pub mod tracker;

pub use dispatcher::PacketInfo;
pub use player::PlayerData;
pub use pool::Pool;
pub use tracker::Tracker;
