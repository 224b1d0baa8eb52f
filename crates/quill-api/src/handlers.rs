//! HTTP handlers.

pub mod alerts;
pub mod health;
pub mod limit_reached;
pub mod purchases;
pub mod quota;
pub mod usage;

pub use health::{health, ready};
