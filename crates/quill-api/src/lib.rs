//! Axum HTTP API server for the token quota core.
//!
//! This crate provides:
//! - Usage recording, quota status, alerts and purchase endpoints
//! - HS256 bearer token verification
//! - The quota gate blocking over-quota users
//! - Rate limiting and security headers
//! - Prometheus metrics

pub mod auth;
pub mod config;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod routes;
pub mod services;
pub mod state;

pub use config::ApiConfig;
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use services::{PurchaseService, QuotaService, StalePurchaseSweeper};
pub use state::AppState;
