//! Quota service: account status and gate decisions.
//!
//! The transactional heavy lifting lives in `quill-store`; this layer
//! applies staff exemptions, folds in alert counts, and shapes the
//! status payload handlers return.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;

use quill_models::{QuotaAccount, UsageContext};
use quill_store::Store;

use crate::auth::AuthUser;
use crate::error::ApiResult;
use crate::metrics;

/// Outcome of evaluating the quota gate for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    Allow,
    Block,
}

/// Quota status payload for the authenticated user.
#[derive(Debug, Serialize)]
pub struct QuotaStatus {
    pub current_usage: i64,
    pub monthly_limit: i64,
    pub remaining: i64,
    pub percent_used: f64,
    pub is_over_quota: bool,
    pub days_until_reset: i64,
    pub is_trial: bool,
    pub days_left_in_trial: i64,
    pub show_conversion_prompt: bool,
    pub unacknowledged_alerts: i64,
}

impl QuotaStatus {
    fn from_account(account: &QuotaAccount, unacknowledged_alerts: i64, now: DateTime<Utc>) -> Self {
        Self {
            current_usage: account.current_usage,
            monthly_limit: account.monthly_limit,
            remaining: account.remaining_tokens(),
            percent_used: account.percent_used(),
            is_over_quota: account.is_over_quota(),
            days_until_reset: account.days_until_reset(now),
            is_trial: account.is_trial,
            days_left_in_trial: account.days_left_in_trial(now),
            show_conversion_prompt: account.should_show_conversion(now),
            unacknowledged_alerts,
        }
    }
}

/// Quota operations on behalf of an authenticated user.
#[derive(Clone)]
pub struct QuotaService {
    store: Arc<Store>,
}

impl QuotaService {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Record token consumption for a user.
    ///
    /// Staff accounts are exempt from threshold alerts but their usage
    /// is still metered.
    pub async fn record_usage(
        &self,
        user: &AuthUser,
        tokens_used: i64,
        context: &UsageContext,
    ) -> ApiResult<QuotaAccount> {
        let account = self
            .store
            .quota()
            .record_usage(
                &user.user_id,
                tokens_used,
                context,
                user.tier,
                user.staff,
                Utc::now(),
            )
            .await?;

        metrics::record_usage_tokens(context.feature.as_str(), tokens_used);
        Ok(account)
    }

    /// Current quota status, rolling the month over first if due.
    pub async fn status(&self, user: &AuthUser) -> ApiResult<QuotaStatus> {
        let now = Utc::now();
        let account = self.fresh_account(user, now).await?;
        let unacknowledged = self
            .store
            .alerts()
            .unacknowledged_count(&user.user_id)
            .await?;
        Ok(QuotaStatus::from_account(&account, unacknowledged, now))
    }

    /// Decide whether a token-consuming request may proceed.
    ///
    /// Staff always pass. Everyone else gets their month rolled if due,
    /// then a block when the counter has reached the limit. Every
    /// evaluation also records any threshold alerts the user has
    /// crossed, so alerts appear as soon as a threshold is passed, not
    /// only once the wall is hit.
    pub async fn evaluate_gate(&self, user: &AuthUser, path: &str) -> ApiResult<GateDecision> {
        if user.staff {
            return Ok(GateDecision::Allow);
        }

        let now = Utc::now();
        let account = self.fresh_account(user, now).await?;

        let created = self
            .store
            .alerts()
            .record_threshold_alerts(
                &user.user_id,
                account.current_usage,
                account.monthly_limit,
                now,
            )
            .await?;
        metrics::record_alerts_created(created);

        if !account.is_over_quota() {
            return Ok(GateDecision::Allow);
        }

        metrics::record_gate_block(path);

        warn!(
            user_id = %user.user_id,
            current_usage = account.current_usage,
            monthly_limit = account.monthly_limit,
            path = %path,
            "Blocked request: token quota exhausted"
        );
        Ok(GateDecision::Block)
    }

    /// Mark the trial conversion prompt as seen.
    pub async fn mark_conversion_seen(&self, user: &AuthUser) -> ApiResult<()> {
        self.store.quota().get_or_create(&user.user_id, user.tier).await?;
        self.store.quota().set_conversion_seen(&user.user_id).await?;
        Ok(())
    }

    /// Account with the monthly reset applied when due.
    async fn fresh_account(&self, user: &AuthUser, now: DateTime<Utc>) -> ApiResult<QuotaAccount> {
        let quota = self.store.quota();
        let account = quota.get_or_create(&user.user_id, user.tier).await?;

        if !account.needs_reset(now) {
            return Ok(account);
        }

        if quota.check_and_reset(&user.user_id, now).await? {
            metrics::record_quota_reset();
        }
        let account = quota.get_or_create(&user.user_id, user.tier).await?;
        Ok(account)
    }
}
