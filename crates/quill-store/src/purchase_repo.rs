//! Purchase transaction repository: exactly-once settlement.
//!
//! Initiation, completion and cancellation each run in one database
//! transaction. Idempotency keys and the single-in-flight rule are
//! backed by unique indexes, so retried or concurrent requests resolve
//! to the same row instead of duplicating side effects.

use chrono::{DateTime, Utc};
use sqlx::{SqliteConnection, SqlitePool};
use tracing::{info, warn};
use uuid::Uuid;

use quill_models::{PaymentStatus, PurchaseLookup, PurchaseTransaction};

use crate::db::begin_write;
use crate::error::{StoreError, StoreResult};
use crate::quota_repo::credit_tokens_tx;

/// Row mapping for `purchase_transactions`.
#[derive(sqlx::FromRow)]
struct PurchaseRow {
    id: String,
    transaction_id: String,
    idempotency_key: String,
    user_id: String,
    tokens_purchased: i64,
    amount_paid_cents: i64,
    currency: String,
    payment_provider: String,
    payment_id: Option<String>,
    payment_status: String,
    is_processing: bool,
    created_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl PurchaseRow {
    fn into_model(self) -> StoreResult<PurchaseTransaction> {
        let id = Uuid::parse_str(&self.id)
            .map_err(|_| StoreError::corrupt(format!("bad purchase id {}", self.id)))?;
        let transaction_id = Uuid::parse_str(&self.transaction_id).map_err(|_| {
            StoreError::corrupt(format!("bad transaction id {}", self.transaction_id))
        })?;
        let payment_status = PaymentStatus::from_str(&self.payment_status).ok_or_else(|| {
            StoreError::corrupt(format!("unknown payment status {}", self.payment_status))
        })?;
        Ok(PurchaseTransaction {
            id,
            transaction_id,
            idempotency_key: self.idempotency_key,
            user_id: self.user_id,
            tokens_purchased: self.tokens_purchased,
            amount_paid_cents: self.amount_paid_cents,
            currency: self.currency,
            payment_provider: self.payment_provider,
            payment_id: self.payment_id,
            payment_status,
            is_processing: self.is_processing,
            created_at: self.created_at,
            completed_at: self.completed_at,
        })
    }
}

const SELECT_PURCHASE: &str = "\
    SELECT id, transaction_id, idempotency_key, user_id, tokens_purchased, \
           amount_paid_cents, currency, payment_provider, payment_id, \
           payment_status, is_processing, created_at, completed_at \
    FROM purchase_transactions";

/// Parameters for initiating a purchase.
#[derive(Debug, Clone)]
pub struct InitiatePurchase {
    pub user_id: String,
    pub tokens_purchased: i64,
    pub amount_paid_cents: i64,
    pub currency: String,
    pub payment_provider: String,
    /// Client-supplied retry-safety key; generated when absent.
    pub idempotency_key: Option<String>,
}

/// Repository for purchase transactions.
pub struct PurchaseRepository {
    pool: SqlitePool,
}

impl PurchaseRepository {
    /// Create a new purchase repository.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Find a purchase by any of its identifying references.
    pub async fn find(&self, lookup: &PurchaseLookup) -> StoreResult<Option<PurchaseTransaction>> {
        let mut conn = self.pool.acquire().await?;
        fetch_by_lookup(&mut conn, lookup).await
    }

    /// List a user's purchases, newest first.
    pub async fn list_for_user(
        &self,
        user_id: &str,
        limit: u32,
    ) -> StoreResult<Vec<PurchaseTransaction>> {
        let sql = format!("{SELECT_PURCHASE} WHERE user_id = ? ORDER BY created_at DESC LIMIT ?");
        let rows = sqlx::query_as::<_, PurchaseRow>(&sql)
            .bind(user_id)
            .bind(limit.clamp(1, 100) as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(PurchaseRow::into_model).collect()
    }

    /// Purchases still marked processing past a cutoff, for the
    /// reconciliation sweeper.
    pub async fn stale_processing(
        &self,
        older_than: DateTime<Utc>,
    ) -> StoreResult<Vec<PurchaseTransaction>> {
        let sql = format!(
            "{SELECT_PURCHASE} WHERE is_processing = 1 AND created_at < ? ORDER BY created_at"
        );
        let rows = sqlx::query_as::<_, PurchaseRow>(&sql)
            .bind(older_than)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(PurchaseRow::into_model).collect()
    }

    /// Initiate a purchase.
    ///
    /// A retried request with the same idempotency key returns the
    /// original transaction unchanged. A user with another in-flight
    /// transaction gets a conflict and no new row. Both guarantees are
    /// enforced by unique indexes, so concurrent initiations cannot
    /// both slip past the checks.
    pub async fn initiate(
        &self,
        request: &InitiatePurchase,
        now: DateTime<Utc>,
    ) -> StoreResult<PurchaseTransaction> {
        if request.tokens_purchased <= 0 {
            return Err(StoreError::validation("tokens_purchased must be positive"));
        }
        if request.amount_paid_cents < 0 {
            return Err(StoreError::validation("amount_paid_cents must not be negative"));
        }
        if request.currency.len() != 3 || !request.currency.chars().all(|c| c.is_ascii_alphabetic())
        {
            return Err(StoreError::validation("currency must be a 3-letter code"));
        }

        let key = request
            .idempotency_key
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut tx = begin_write(&self.pool).await?;

        // Retry with a known key returns the original row, whatever its state.
        if let Some(existing) = fetch_by_key(&mut tx, &key).await? {
            return Ok(existing);
        }

        let in_flight: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM purchase_transactions \
             WHERE user_id = ? AND is_processing = 1",
        )
        .bind(&request.user_id)
        .fetch_one(&mut *tx)
        .await?;
        if in_flight.0 > 0 {
            return Err(StoreError::conflict(
                "another transaction is already in progress for this user",
            ));
        }

        let purchase = PurchaseTransaction {
            id: Uuid::new_v4(),
            transaction_id: Uuid::new_v4(),
            idempotency_key: key.clone(),
            user_id: request.user_id.clone(),
            tokens_purchased: request.tokens_purchased,
            amount_paid_cents: request.amount_paid_cents,
            currency: request.currency.to_ascii_uppercase(),
            payment_provider: request.payment_provider.clone(),
            payment_id: None,
            payment_status: PaymentStatus::Processing,
            is_processing: true,
            created_at: now,
            completed_at: None,
        };

        let inserted = sqlx::query(
            "INSERT INTO purchase_transactions \
             (id, transaction_id, idempotency_key, user_id, tokens_purchased, \
              amount_paid_cents, currency, payment_provider, payment_id, \
              payment_status, is_processing, created_at, completed_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, NULL, ?, 1, ?, NULL)",
        )
        .bind(purchase.id.to_string())
        .bind(purchase.transaction_id.to_string())
        .bind(&purchase.idempotency_key)
        .bind(&purchase.user_id)
        .bind(purchase.tokens_purchased)
        .bind(purchase.amount_paid_cents)
        .bind(&purchase.currency)
        .bind(&purchase.payment_provider)
        .bind(purchase.payment_status.as_str())
        .bind(purchase.created_at)
        .execute(&mut *tx)
        .await;

        match inserted {
            Ok(_) => {
                tx.commit().await?;
                info!(
                    user_id = %purchase.user_id,
                    transaction_id = %purchase.transaction_id,
                    tokens = purchase.tokens_purchased,
                    "Initiated token purchase"
                );
                Ok(purchase)
            }
            Err(e) => {
                let err = StoreError::from(e);
                if err.is_unique_violation() {
                    // Lost a race: either the same key landed first (return
                    // the winner) or another in-flight row appeared (conflict).
                    drop(tx);
                    let mut conn = self.pool.acquire().await?;
                    if let Some(existing) = fetch_by_key(&mut conn, &key).await? {
                        return Ok(existing);
                    }
                    return Err(StoreError::conflict(
                        "another transaction is already in progress for this user",
                    ));
                }
                Err(err)
            }
        }
    }

    /// Confirm a purchase and credit the user's quota account.
    ///
    /// Idempotent on retry: an already-completed purchase is returned
    /// unchanged and credits nothing. The status flip and the quota
    /// credit commit together or not at all.
    pub async fn complete(
        &self,
        lookup: &PurchaseLookup,
        payment_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> StoreResult<PurchaseTransaction> {
        let mut tx = begin_write(&self.pool).await?;

        let purchase = fetch_by_lookup(&mut tx, lookup)
            .await?
            .ok_or_else(|| StoreError::not_found("purchase not found"))?;

        if purchase.payment_status == PaymentStatus::Completed {
            return Ok(purchase);
        }
        if !purchase.can_complete() {
            return Err(StoreError::conflict(format!(
                "transaction is not in processing state (status: {})",
                purchase.payment_status
            )));
        }

        sqlx::query(
            "UPDATE purchase_transactions \
             SET payment_status = 'completed', completed_at = ?, is_processing = 0, \
                 payment_id = COALESCE(payment_id, ?) \
             WHERE id = ?",
        )
        .bind(now)
        .bind(payment_id)
        .bind(purchase.id.to_string())
        .execute(&mut *tx)
        .await?;

        credit_tokens_tx(&mut tx, &purchase.user_id, purchase.tokens_purchased, now).await?;

        let updated = fetch_by_lookup(&mut tx, &PurchaseLookup::PurchaseId(purchase.id))
            .await?
            .ok_or_else(|| StoreError::corrupt("purchase vanished mid-transaction"))?;

        tx.commit().await?;

        info!(
            user_id = %updated.user_id,
            transaction_id = %updated.transaction_id,
            tokens = updated.tokens_purchased,
            "Completed token purchase"
        );
        Ok(updated)
    }

    /// Cancel a purchase. Already failed or refunded purchases are
    /// returned unchanged; completed purchases cannot be cancelled.
    /// The quota account is never touched (no credit was given).
    pub async fn cancel(
        &self,
        lookup: &PurchaseLookup,
        now: DateTime<Utc>,
    ) -> StoreResult<PurchaseTransaction> {
        let mut tx = begin_write(&self.pool).await?;

        let purchase = fetch_by_lookup(&mut tx, lookup)
            .await?
            .ok_or_else(|| StoreError::not_found("purchase not found"))?;

        match purchase.payment_status {
            PaymentStatus::Failed | PaymentStatus::Refunded => return Ok(purchase),
            PaymentStatus::Completed => {
                return Err(StoreError::conflict(
                    "completed transactions cannot be cancelled",
                ));
            }
            PaymentStatus::Pending | PaymentStatus::Processing => {}
        }

        sqlx::query(
            "UPDATE purchase_transactions \
             SET payment_status = 'failed', is_processing = 0 \
             WHERE id = ?",
        )
        .bind(purchase.id.to_string())
        .execute(&mut *tx)
        .await?;

        let updated = fetch_by_lookup(&mut tx, &PurchaseLookup::PurchaseId(purchase.id))
            .await?
            .ok_or_else(|| StoreError::corrupt("purchase vanished mid-transaction"))?;

        tx.commit().await?;

        warn!(
            user_id = %updated.user_id,
            transaction_id = %updated.transaction_id,
            at = %now,
            "Cancelled token purchase"
        );
        Ok(updated)
    }

    /// Mark a completed purchase refunded (driven by the payment
    /// processor). Tokens already consumed are not clawed back.
    pub async fn refund(
        &self,
        lookup: &PurchaseLookup,
        now: DateTime<Utc>,
    ) -> StoreResult<PurchaseTransaction> {
        let mut tx = begin_write(&self.pool).await?;

        let purchase = fetch_by_lookup(&mut tx, lookup)
            .await?
            .ok_or_else(|| StoreError::not_found("purchase not found"))?;

        match purchase.payment_status {
            PaymentStatus::Refunded => return Ok(purchase),
            PaymentStatus::Completed => {}
            other => {
                return Err(StoreError::conflict(format!(
                    "only completed transactions can be refunded (status: {other})"
                )));
            }
        }

        sqlx::query(
            "UPDATE purchase_transactions \
             SET payment_status = 'refunded', is_processing = 0 \
             WHERE id = ?",
        )
        .bind(purchase.id.to_string())
        .execute(&mut *tx)
        .await?;

        let updated = fetch_by_lookup(&mut tx, &PurchaseLookup::PurchaseId(purchase.id))
            .await?
            .ok_or_else(|| StoreError::corrupt("purchase vanished mid-transaction"))?;

        tx.commit().await?;

        info!(
            user_id = %updated.user_id,
            transaction_id = %updated.transaction_id,
            at = %now,
            "Refunded token purchase"
        );
        Ok(updated)
    }
}

async fn fetch_by_key(
    conn: &mut SqliteConnection,
    idempotency_key: &str,
) -> StoreResult<Option<PurchaseTransaction>> {
    let sql = format!("{SELECT_PURCHASE} WHERE idempotency_key = ?");
    let row = sqlx::query_as::<_, PurchaseRow>(&sql)
        .bind(idempotency_key)
        .fetch_optional(conn)
        .await?;
    row.map(PurchaseRow::into_model).transpose()
}

async fn fetch_by_lookup(
    conn: &mut SqliteConnection,
    lookup: &PurchaseLookup,
) -> StoreResult<Option<PurchaseTransaction>> {
    let (clause, value) = match lookup {
        PurchaseLookup::PurchaseId(id) => ("id = ?", id.to_string()),
        PurchaseLookup::TransactionId(id) => ("transaction_id = ?", id.to_string()),
        PurchaseLookup::PaymentId(payment_id) => ("payment_id = ?", payment_id.clone()),
    };
    let sql = format!("{SELECT_PURCHASE} WHERE {clause}");
    let row = sqlx::query_as::<_, PurchaseRow>(&sql)
        .bind(value)
        .fetch_optional(conn)
        .await?;
    row.map(PurchaseRow::into_model).transpose()
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use quill_models::{PaymentStatus, PurchaseLookup, SubscriptionTier};

    use super::InitiatePurchase;
    use crate::Store;

    fn request(user: &str, key: Option<&str>) -> InitiatePurchase {
        InitiatePurchase {
            user_id: user.to_string(),
            tokens_purchased: 1000,
            amount_paid_cents: 500,
            currency: "USD".to_string(),
            payment_provider: "stripe".to_string(),
            idempotency_key: key.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn test_idempotent_initiate() {
        let store = Store::in_memory().await.unwrap();
        let repo = store.purchases();
        let now = Utc::now();

        let first = repo.initiate(&request("u1", Some("abc")), now).await.unwrap();
        let second = repo.initiate(&request("u1", Some("abc")), now).await.unwrap();

        assert_eq!(first.transaction_id, second.transaction_id);
        assert_eq!(first.id, second.id);
        assert_eq!(repo.list_for_user("u1", 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_single_in_flight_transaction() {
        let store = Store::in_memory().await.unwrap();
        let repo = store.purchases();
        let now = Utc::now();

        repo.initiate(&request("u1", None), now).await.unwrap();
        let err = repo.initiate(&request("u1", None), now).await.unwrap_err();
        assert!(matches!(err, crate::StoreError::Conflict(_)));
        assert_eq!(repo.list_for_user("u1", 10).await.unwrap().len(), 1);

        // A different user is unaffected
        repo.initiate(&request("u2", None), now).await.unwrap();
    }

    #[tokio::test]
    async fn test_complete_credits_exactly_once() {
        let store = Store::in_memory().await.unwrap();
        let repo = store.purchases();
        let now = Utc::now();

        store
            .quota()
            .get_or_create("u1", SubscriptionTier::Free)
            .await
            .unwrap();

        let purchase = repo.initiate(&request("u1", None), now).await.unwrap();
        let lookup = PurchaseLookup::TransactionId(purchase.transaction_id);

        let completed = repo.complete(&lookup, Some("pay_123"), now).await.unwrap();
        assert_eq!(completed.payment_status, PaymentStatus::Completed);
        assert!(!completed.is_processing);
        assert_eq!(completed.payment_id.as_deref(), Some("pay_123"));

        // Second completion is a no-op returning the same row
        let again = repo.complete(&lookup, Some("pay_456"), now).await.unwrap();
        assert_eq!(again.payment_id.as_deref(), Some("pay_123"));

        let account = store.quota().get("u1").await.unwrap().unwrap();
        assert_eq!(account.monthly_limit, 51_000);
    }

    #[tokio::test]
    async fn test_complete_creates_account_if_absent() {
        let store = Store::in_memory().await.unwrap();
        let repo = store.purchases();
        let now = Utc::now();

        let purchase = repo.initiate(&request("fresh", None), now).await.unwrap();
        repo.complete(&PurchaseLookup::PurchaseId(purchase.id), None, now)
            .await
            .unwrap();

        let account = store.quota().get("fresh").await.unwrap().unwrap();
        assert_eq!(account.monthly_limit, 1000);
    }

    #[tokio::test]
    async fn test_concurrent_completions_credit_once() {
        let store = Store::in_memory().await.unwrap();
        let now = Utc::now();

        store
            .quota()
            .get_or_create("u1", SubscriptionTier::Free)
            .await
            .unwrap();
        let purchase = store
            .purchases()
            .initiate(&request("u1", None), now)
            .await
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..4 {
            let repo = store.purchases();
            let lookup = PurchaseLookup::PurchaseId(purchase.id);
            handles.push(tokio::spawn(async move {
                repo.complete(&lookup, None, Utc::now()).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let account = store.quota().get("u1").await.unwrap().unwrap();
        assert_eq!(account.monthly_limit, 51_000);
    }

    #[tokio::test]
    async fn test_cancel_does_not_credit() {
        let store = Store::in_memory().await.unwrap();
        let repo = store.purchases();
        let now = Utc::now();

        store
            .quota()
            .get_or_create("u1", SubscriptionTier::Free)
            .await
            .unwrap();
        let purchase = repo.initiate(&request("u1", None), now).await.unwrap();
        let lookup = PurchaseLookup::PurchaseId(purchase.id);

        let cancelled = repo.cancel(&lookup, now).await.unwrap();
        assert_eq!(cancelled.payment_status, PaymentStatus::Failed);
        assert!(!cancelled.is_processing);

        // Idempotent
        let again = repo.cancel(&lookup, now).await.unwrap();
        assert_eq!(again.payment_status, PaymentStatus::Failed);

        let account = store.quota().get("u1").await.unwrap().unwrap();
        assert_eq!(account.monthly_limit, 50_000);

        // The user can start a new purchase afterwards
        repo.initiate(&request("u1", None), now).await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_completed_is_conflict() {
        let store = Store::in_memory().await.unwrap();
        let repo = store.purchases();
        let now = Utc::now();

        let purchase = repo.initiate(&request("u1", None), now).await.unwrap();
        let lookup = PurchaseLookup::PurchaseId(purchase.id);
        repo.complete(&lookup, None, now).await.unwrap();

        let err = repo.cancel(&lookup, now).await.unwrap_err();
        assert!(matches!(err, crate::StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_refund_requires_completed() {
        let store = Store::in_memory().await.unwrap();
        let repo = store.purchases();
        let now = Utc::now();

        let purchase = repo.initiate(&request("u1", None), now).await.unwrap();
        let lookup = PurchaseLookup::PurchaseId(purchase.id);

        let err = repo.refund(&lookup, now).await.unwrap_err();
        assert!(matches!(err, crate::StoreError::Conflict(_)));

        repo.complete(&lookup, None, now).await.unwrap();
        let refunded = repo.refund(&lookup, now).await.unwrap();
        assert_eq!(refunded.payment_status, PaymentStatus::Refunded);

        // Idempotent
        let again = repo.refund(&lookup, now).await.unwrap();
        assert_eq!(again.payment_status, PaymentStatus::Refunded);
    }

    #[tokio::test]
    async fn test_lookup_not_found() {
        let store = Store::in_memory().await.unwrap();
        let err = store
            .purchases()
            .complete(
                &PurchaseLookup::PaymentId("pay_missing".to_string()),
                None,
                Utc::now(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, crate::StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_initiate_validation() {
        let store = Store::in_memory().await.unwrap();
        let repo = store.purchases();
        let now = Utc::now();

        let mut bad = request("u1", None);
        bad.tokens_purchased = 0;
        assert!(repo.initiate(&bad, now).await.is_err());

        let mut bad = request("u1", None);
        bad.amount_paid_cents = -5;
        assert!(repo.initiate(&bad, now).await.is_err());

        let mut bad = request("u1", None);
        bad.currency = "DOLLARS".to_string();
        assert!(repo.initiate(&bad, now).await.is_err());

        assert!(repo.list_for_user("u1", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stale_processing_sweep() {
        let store = Store::in_memory().await.unwrap();
        let repo = store.purchases();
        let old = Utc::now() - Duration::hours(48);

        let purchase = repo.initiate(&request("u1", None), old).await.unwrap();
        repo.initiate(&request("u2", None), Utc::now()).await.unwrap();

        let cutoff = Utc::now() - Duration::hours(24);
        let stale = repo.stale_processing(cutoff).await.unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].id, purchase.id);
    }
}
