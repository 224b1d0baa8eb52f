//! Purchase service: ownership checks and metrics around the
//! transactional purchase repository.

use std::sync::Arc;

use chrono::Utc;

use quill_models::{PaymentStatus, PurchaseLookup, PurchaseTransaction};
use quill_store::{InitiatePurchase, Store};

use crate::auth::AuthUser;
use crate::error::{ApiError, ApiResult};
use crate::metrics;

/// Purchase operations on behalf of an authenticated user.
#[derive(Clone)]
pub struct PurchaseService {
    store: Arc<Store>,
}

impl PurchaseService {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Start a purchase for the authenticated user.
    pub async fn initiate(
        &self,
        user: &AuthUser,
        tokens_purchased: i64,
        amount_paid_cents: i64,
        currency: String,
        payment_provider: String,
        idempotency_key: Option<String>,
    ) -> ApiResult<PurchaseTransaction> {
        let request = InitiatePurchase {
            user_id: user.user_id.clone(),
            tokens_purchased,
            amount_paid_cents,
            currency,
            payment_provider,
            idempotency_key,
        };
        let purchase = self.store.purchases().initiate(&request, Utc::now()).await?;
        metrics::record_purchase("initiated");
        Ok(purchase)
    }

    /// Confirm a purchase and credit its tokens.
    pub async fn complete(
        &self,
        user: &AuthUser,
        lookup: &PurchaseLookup,
        payment_id: Option<&str>,
    ) -> ApiResult<PurchaseTransaction> {
        let existing = self.find_owned(user, lookup).await?;
        let already_completed = existing.payment_status == PaymentStatus::Completed;

        let purchase = self
            .store
            .purchases()
            .complete(lookup, payment_id, Utc::now())
            .await?;

        if !already_completed {
            metrics::record_purchase("completed");
            metrics::record_purchased_tokens(purchase.tokens_purchased);
        }
        Ok(purchase)
    }

    /// Cancel a purchase without crediting anything.
    pub async fn cancel(
        &self,
        user: &AuthUser,
        lookup: &PurchaseLookup,
    ) -> ApiResult<PurchaseTransaction> {
        self.find_owned(user, lookup).await?;
        let purchase = self.store.purchases().cancel(lookup, Utc::now()).await?;
        metrics::record_purchase("cancelled");
        Ok(purchase)
    }

    /// Mark a completed purchase refunded. Staff only.
    pub async fn refund(
        &self,
        user: &AuthUser,
        lookup: &PurchaseLookup,
    ) -> ApiResult<PurchaseTransaction> {
        if !user.staff {
            return Err(ApiError::forbidden("refunds require staff access"));
        }
        let purchase = self.store.purchases().refund(lookup, Utc::now()).await?;
        metrics::record_purchase("refunded");
        Ok(purchase)
    }

    /// The authenticated user's purchases, newest first.
    pub async fn list(&self, user: &AuthUser, limit: u32) -> ApiResult<Vec<PurchaseTransaction>> {
        Ok(self.store.purchases().list_for_user(&user.user_id, limit).await?)
    }

    /// Find a purchase the user is allowed to act on. Staff can act on
    /// any purchase.
    async fn find_owned(
        &self,
        user: &AuthUser,
        lookup: &PurchaseLookup,
    ) -> ApiResult<PurchaseTransaction> {
        let purchase = self
            .store
            .purchases()
            .find(lookup)
            .await?
            .ok_or_else(|| ApiError::not_found("purchase not found"))?;

        if purchase.user_id != user.user_id && !user.staff {
            return Err(ApiError::forbidden("purchase belongs to another user"));
        }
        Ok(purchase)
    }
}
