//! Quota account repository: atomic usage accounting.
//!
//! The account row is the serialization point for all counter updates.
//! Every mutation here runs inside a single database transaction; the
//! increment is expressed as an atomic SQL update rather than a
//! read-modify-write, so concurrent consumers can never lose updates.

use chrono::{DateTime, Datelike, Utc};
use sqlx::{SqliteConnection, SqlitePool};
use tracing::{debug, info};
use uuid::Uuid;

use quill_models::quota::{DEFAULT_ALERT_THRESHOLD, DEFAULT_TRIAL_DAYS};
use quill_models::{QuotaAccount, SubscriptionTier, UsageContext, UsageEvent};

use crate::alert_repo::insert_threshold_alerts_tx;
use crate::db::begin_write;
use crate::error::{StoreError, StoreResult};
use crate::usage_repo::insert_event_tx;

/// Row mapping for `quota_accounts`.
#[derive(sqlx::FromRow)]
struct AccountRow {
    user_id: String,
    monthly_limit: i64,
    current_usage: i64,
    last_reset: DateTime<Utc>,
    alert_threshold: i64,
    is_trial: bool,
    trial_start: DateTime<Utc>,
    trial_days: i64,
    has_seen_conversion: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<AccountRow> for QuotaAccount {
    fn from(row: AccountRow) -> Self {
        QuotaAccount {
            user_id: row.user_id,
            monthly_limit: row.monthly_limit,
            current_usage: row.current_usage,
            last_reset: row.last_reset,
            alert_threshold: row.alert_threshold,
            is_trial: row.is_trial,
            trial_start: row.trial_start,
            trial_days: row.trial_days,
            has_seen_conversion: row.has_seen_conversion,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

const SELECT_ACCOUNT: &str = "\
    SELECT user_id, monthly_limit, current_usage, last_reset, alert_threshold, \
           is_trial, trial_start, trial_days, has_seen_conversion, created_at, updated_at \
    FROM quota_accounts WHERE user_id = ?";

/// Repository for quota accounts.
pub struct QuotaRepository {
    pool: SqlitePool,
}

impl QuotaRepository {
    /// Create a new quota repository.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Fetch an account, if it exists.
    pub async fn get(&self, user_id: &str) -> StoreResult<Option<QuotaAccount>> {
        let row = sqlx::query_as::<_, AccountRow>(SELECT_ACCOUNT)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Into::into))
    }

    /// Return the user's account, creating one with the tier's default
    /// allowance when absent.
    ///
    /// Creation races are resolved by the primary key: the losing
    /// insert is a no-op and both callers read the same row back.
    pub async fn get_or_create(
        &self,
        user_id: &str,
        tier: SubscriptionTier,
    ) -> StoreResult<QuotaAccount> {
        if let Some(account) = self.get(user_id).await? {
            return Ok(account);
        }

        let now = Utc::now();
        let mut conn = self.pool.acquire().await?;
        insert_account_if_absent_tx(&mut conn, user_id, tier.monthly_tokens(), now).await?;
        drop(conn);

        info!(user_id = %user_id, tier = %tier, "Created quota account");

        self.get(user_id)
            .await?
            .ok_or_else(|| StoreError::corrupt(format!("account for {user_id} vanished after insert")))
    }

    /// Roll the accounting period over if `now` is in a later calendar
    /// month than the account's `last_reset`.
    ///
    /// Writes the archival snapshot of the outgoing period and zeroes
    /// the counter in one transaction. Returns whether a reset
    /// occurred; a second call in the same month is a no-op.
    pub async fn check_and_reset(&self, user_id: &str, now: DateTime<Utc>) -> StoreResult<bool> {
        let mut tx = begin_write(&self.pool).await?;

        let account = fetch_account_tx(&mut tx, user_id)
            .await?
            .ok_or_else(|| StoreError::not_found(format!("no quota account for {user_id}")))?;

        let reset = reset_if_needed_tx(&mut tx, &account, now).await?;
        tx.commit().await?;

        if reset {
            info!(
                user_id = %user_id,
                archived_month = account.last_reset.month(),
                archived_year = account.last_reset.year(),
                archived_usage = account.current_usage,
                "Monthly quota reset"
            );
        }
        Ok(reset)
    }

    /// Record token consumption: the one entry point for every
    /// token-consuming action.
    ///
    /// In a single transaction: ensure the account exists, roll the
    /// month if needed, increment the counter, append the ledger
    /// event, and evaluate alert thresholds. Either all of it commits
    /// or none of it does.
    ///
    /// `alerts_exempt` skips threshold evaluation for staff/unlimited
    /// accounts; the counter and ledger are still updated.
    pub async fn record_usage(
        &self,
        user_id: &str,
        tokens_used: i64,
        context: &UsageContext,
        tier: SubscriptionTier,
        alerts_exempt: bool,
        now: DateTime<Utc>,
    ) -> StoreResult<QuotaAccount> {
        if tokens_used <= 0 {
            return Err(StoreError::validation("tokens_used must be positive"));
        }

        let mut tx = begin_write(&self.pool).await?;

        insert_account_if_absent_tx(&mut tx, user_id, tier.monthly_tokens(), now).await?;

        let account = fetch_account_tx(&mut tx, user_id)
            .await?
            .ok_or_else(|| StoreError::corrupt(format!("account for {user_id} vanished mid-transaction")))?;

        reset_if_needed_tx(&mut tx, &account, now).await?;

        sqlx::query(
            "UPDATE quota_accounts SET current_usage = current_usage + ?, updated_at = ? \
             WHERE user_id = ?",
        )
        .bind(tokens_used)
        .bind(now)
        .bind(user_id)
        .execute(&mut *tx)
        .await?;

        let event = UsageEvent {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            feature: context.feature,
            tokens_used,
            character_id: context.character_id,
            conversation_id: context.conversation_id,
            story_id: context.story_id,
            world_id: context.world_id,
            timestamp: now,
        };
        insert_event_tx(&mut tx, &event).await?;

        let account = fetch_account_tx(&mut tx, user_id)
            .await?
            .ok_or_else(|| StoreError::corrupt(format!("account for {user_id} vanished mid-transaction")))?;

        if !alerts_exempt {
            insert_threshold_alerts_tx(
                &mut tx,
                user_id,
                account.current_usage,
                account.monthly_limit,
                now,
            )
            .await?;
        }

        tx.commit().await?;

        debug!(
            user_id = %user_id,
            feature = context.feature.as_str(),
            tokens = tokens_used,
            total_used = account.current_usage,
            "Recorded token usage"
        );

        Ok(account)
    }

    /// Mark the trial conversion prompt as seen.
    pub async fn set_conversion_seen(&self, user_id: &str) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE quota_accounts SET has_seen_conversion = 1, updated_at = ? WHERE user_id = ?",
        )
        .bind(Utc::now())
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::not_found(format!("no quota account for {user_id}")));
        }
        Ok(())
    }
}

/// Insert an account with defaults unless one already exists.
pub(crate) async fn insert_account_if_absent_tx(
    conn: &mut SqliteConnection,
    user_id: &str,
    monthly_limit: i64,
    now: DateTime<Utc>,
) -> StoreResult<()> {
    sqlx::query(
        "INSERT INTO quota_accounts \
         (user_id, monthly_limit, current_usage, last_reset, alert_threshold, \
          is_trial, trial_start, trial_days, has_seen_conversion, created_at, updated_at) \
         VALUES (?, ?, 0, ?, ?, 1, ?, ?, 0, ?, ?) \
         ON CONFLICT(user_id) DO NOTHING",
    )
    .bind(user_id)
    .bind(monthly_limit)
    .bind(now)
    .bind(DEFAULT_ALERT_THRESHOLD)
    .bind(now)
    .bind(DEFAULT_TRIAL_DAYS)
    .bind(now)
    .bind(now)
    .execute(conn)
    .await?;
    Ok(())
}

/// Fetch an account inside an open transaction.
pub(crate) async fn fetch_account_tx(
    conn: &mut SqliteConnection,
    user_id: &str,
) -> StoreResult<Option<QuotaAccount>> {
    let row = sqlx::query_as::<_, AccountRow>(SELECT_ACCOUNT)
        .bind(user_id)
        .fetch_optional(conn)
        .await?;
    Ok(row.map(Into::into))
}

/// Archive the outgoing period and zero the counter when the calendar
/// month has rolled over.
///
/// The snapshot insert is keyed on `(user, month, year)` so a period is
/// archived at most once, and the reset update is guarded on the
/// previously observed `last_reset` so two concurrent callers cannot
/// both reset.
pub(crate) async fn reset_if_needed_tx(
    conn: &mut SqliteConnection,
    account: &QuotaAccount,
    now: DateTime<Utc>,
) -> StoreResult<bool> {
    if !account.needs_reset(now) {
        return Ok(false);
    }

    sqlx::query(
        "INSERT INTO monthly_usage_history \
         (id, user_id, month, year, total_usage, allocated_limit, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT(user_id, month, year) DO NOTHING",
    )
    .bind(Uuid::new_v4().to_string())
    .bind(&account.user_id)
    .bind(account.last_reset.month() as i64)
    .bind(account.last_reset.year() as i64)
    .bind(account.current_usage)
    .bind(account.monthly_limit)
    .bind(now)
    .execute(&mut *conn)
    .await?;

    let result = sqlx::query(
        "UPDATE quota_accounts SET current_usage = 0, last_reset = ?, updated_at = ? \
         WHERE user_id = ? AND last_reset = ?",
    )
    .bind(now)
    .bind(now)
    .bind(&account.user_id)
    .bind(account.last_reset)
    .execute(conn)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Credit purchased tokens to the account's monthly limit, creating the
/// account when absent. Runs inside the purchase-completion transaction.
pub(crate) async fn credit_tokens_tx(
    conn: &mut SqliteConnection,
    user_id: &str,
    amount: i64,
    now: DateTime<Utc>,
) -> StoreResult<()> {
    let result = sqlx::query(
        "UPDATE quota_accounts SET monthly_limit = monthly_limit + ?, updated_at = ? \
         WHERE user_id = ?",
    )
    .bind(amount)
    .bind(now)
    .bind(user_id)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        // First interaction with the system is a purchase: the account
        // starts with exactly the purchased tokens.
        insert_account_if_absent_tx(conn, user_id, amount, now).await?;
    }
    Ok(())
}
