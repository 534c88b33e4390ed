//! Server configuration: schema, defaults, and on-disk loading.

pub mod loader;
pub mod schema;

pub use loader::{config_dir, load};
pub use schema::ServerConfig;
