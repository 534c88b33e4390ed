//! Accept-time defenses.

pub mod rate_limit;

pub use rate_limit::AcceptLimiter;
