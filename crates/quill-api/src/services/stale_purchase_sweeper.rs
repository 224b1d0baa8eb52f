//! Background service for reconciling abandoned purchases.
//!
//! A purchase left in processing means the user closed the payment flow
//! or the provider callback never arrived. The sweeper runs
//! periodically, finds transactions still processing past a cutoff, and
//! cancels them so the user can start a fresh purchase.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::interval;
use tracing::{error, info, warn};

use quill_models::PurchaseLookup;
use quill_store::Store;

use crate::metrics;

/// Interval between sweep runs.
const SWEEP_INTERVAL: Duration = Duration::from_secs(300);

/// Default age after which a processing purchase counts as abandoned.
const DEFAULT_MAX_AGE_HOURS: i64 = 24;

/// Stale purchase sweeper service.
pub struct StalePurchaseSweeper {
    store: Arc<Store>,
    enabled: bool,
    max_age: chrono::Duration,
}

impl StalePurchaseSweeper {
    /// Create a new sweeper.
    pub fn new(store: Arc<Store>) -> Self {
        let enabled = std::env::var("ENABLE_STALE_SWEEP")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(true); // Enabled by default

        let max_age_hours = std::env::var("STALE_PURCHASE_MAX_AGE_HOURS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_MAX_AGE_HOURS);

        Self {
            store,
            enabled,
            max_age: chrono::Duration::hours(max_age_hours),
        }
    }

    /// Start the background sweep loop.
    ///
    /// This function runs indefinitely and should be spawned as a background task.
    pub async fn run(&self) {
        if !self.enabled {
            info!("Stale purchase sweeping is disabled");
            return;
        }

        info!("Starting stale purchase sweeper (interval: {:?})", SWEEP_INTERVAL);

        let mut ticker = interval(SWEEP_INTERVAL);

        loop {
            ticker.tick().await;

            if let Err(e) = self.sweep_once().await {
                error!("Stale purchase sweep error: {}", e);
            }
        }
    }

    /// Run a single sweep cycle. Returns the number of purchases cancelled.
    pub async fn sweep_once(&self) -> anyhow::Result<u32> {
        let cutoff = Utc::now() - self.max_age;
        let stale = self.store.purchases().stale_processing(cutoff).await?;

        if stale.is_empty() {
            return Ok(0);
        }

        let mut cancelled = 0u32;
        for purchase in stale {
            warn!(
                user_id = %purchase.user_id,
                transaction_id = %purchase.transaction_id,
                created_at = %purchase.created_at,
                "Detected stale purchase transaction"
            );

            match self
                .store
                .purchases()
                .cancel(&PurchaseLookup::PurchaseId(purchase.id), Utc::now())
                .await
            {
                Ok(_) => {
                    cancelled += 1;
                    metrics::record_stale_purchase_cancelled();
                }
                Err(e) => {
                    error!(
                        transaction_id = %purchase.transaction_id,
                        "Failed to cancel stale purchase: {}", e
                    );
                }
            }
        }

        info!("Stale purchase sweep complete: {} cancelled", cancelled);
        Ok(cancelled)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{Duration, Utc};
    use quill_models::PaymentStatus;
    use quill_store::{InitiatePurchase, Store};

    use super::StalePurchaseSweeper;

    fn request(user: &str) -> InitiatePurchase {
        InitiatePurchase {
            user_id: user.to_string(),
            tokens_purchased: 1000,
            amount_paid_cents: 500,
            currency: "USD".to_string(),
            payment_provider: "stripe".to_string(),
            idempotency_key: None,
        }
    }

    #[tokio::test]
    async fn test_sweep_cancels_only_old_purchases() {
        let store = Arc::new(Store::in_memory().await.unwrap());

        let old = store
            .purchases()
            .initiate(&request("u1"), Utc::now() - Duration::hours(48))
            .await
            .unwrap();
        let fresh = store
            .purchases()
            .initiate(&request("u2"), Utc::now())
            .await
            .unwrap();

        let sweeper = StalePurchaseSweeper::new(Arc::clone(&store));
        let cancelled = sweeper.sweep_once().await.unwrap();
        assert_eq!(cancelled, 1);

        let old = store
            .purchases()
            .find(&quill_models::PurchaseLookup::PurchaseId(old.id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(old.payment_status, PaymentStatus::Failed);

        let fresh = store
            .purchases()
            .find(&quill_models::PurchaseLookup::PurchaseId(fresh.id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fresh.payment_status, PaymentStatus::Processing);
    }
}
