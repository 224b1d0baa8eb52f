//! Application state.

use std::sync::Arc;

use quill_store::Store;

use crate::auth::TokenVerifier;
use crate::config::ApiConfig;
use crate::services::{PurchaseService, QuotaService};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: ApiConfig,
    pub store: Arc<Store>,
    pub verifier: TokenVerifier,
    pub quota_service: QuotaService,
    pub purchase_service: PurchaseService,
}

impl AppState {
    /// Create new application state.
    pub async fn new(config: ApiConfig) -> Result<Self, Box<dyn std::error::Error>> {
        let store = Arc::new(Store::connect(&config.database_url).await?);
        Ok(Self::with_store(config, store))
    }

    /// Build state around an existing store (used by tests with an
    /// in-memory database).
    pub fn with_store(config: ApiConfig, store: Arc<Store>) -> Self {
        let verifier = TokenVerifier::new(&config.jwt_secret);
        let quota_service = QuotaService::new(Arc::clone(&store));
        let purchase_service = PurchaseService::new(Arc::clone(&store));

        Self {
            config,
            store,
            verifier,
            quota_service,
            purchase_service,
        }
    }
}
