//! Quota account data model.
//!
//! One account per user, tracking token consumption against a monthly
//! limit that resets on calendar-month boundaries. All percentage and
//! threshold math lives here; presentation and enforcement code call
//! these accessors rather than recomputing.

use chrono::{DateTime, Datelike, Duration, TimeZone, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::tier::SubscriptionTier;

/// Default alert threshold percentage for new accounts.
pub const DEFAULT_ALERT_THRESHOLD: i64 = 80;

/// Default trial length in days.
pub const DEFAULT_TRIAL_DAYS: i64 = 14;

/// Show the trial conversion prompt when this many days (or fewer) remain.
const CONVERSION_PROMPT_DAYS: i64 = 3;

/// Per-user token quota account.
///
/// `current_usage` counts tokens consumed since `last_reset`. Updates to
/// it are serialized by the store; this type only carries state and the
/// pure derivations over it.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct QuotaAccount {
    /// Owning user.
    pub user_id: String,

    /// Tokens allowed per calendar month.
    pub monthly_limit: i64,

    /// Tokens consumed since `last_reset`.
    pub current_usage: i64,

    /// Start of the current accounting period.
    pub last_reset: DateTime<Utc>,

    /// Informational alert threshold percentage (default 80).
    pub alert_threshold: i64,

    /// Whether the user is in their trial period.
    pub is_trial: bool,

    /// When the trial started.
    pub trial_start: DateTime<Utc>,

    /// Length of the trial in days.
    pub trial_days: i64,

    /// Whether the user has seen the trial conversion prompt.
    pub has_seen_conversion: bool,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl QuotaAccount {
    /// Create a fresh account for a user on the given tier.
    pub fn new(user_id: impl Into<String>, tier: SubscriptionTier, now: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.into(),
            monthly_limit: tier.monthly_tokens(),
            current_usage: 0,
            last_reset: now,
            alert_threshold: DEFAULT_ALERT_THRESHOLD,
            is_trial: true,
            trial_start: now,
            trial_days: DEFAULT_TRIAL_DAYS,
            has_seen_conversion: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Percentage of the monthly limit consumed, capped at 100.
    ///
    /// A zero limit yields 0, not a division error.
    pub fn percent_used(&self) -> f64 {
        if self.monthly_limit == 0 {
            return 0.0;
        }
        let pct = (self.current_usage as f64 / self.monthly_limit as f64) * 100.0;
        pct.min(100.0)
    }

    /// Whether the account has exhausted its monthly limit.
    ///
    /// A zero limit means the account was never allocated tokens and is
    /// not treated as over quota.
    pub fn is_over_quota(&self) -> bool {
        self.monthly_limit > 0 && self.current_usage >= self.monthly_limit
    }

    /// Remaining tokens this period.
    pub fn remaining_tokens(&self) -> i64 {
        (self.monthly_limit - self.current_usage).max(0)
    }

    /// Whether `last_reset` falls in a different calendar month than `now`.
    pub fn needs_reset(&self, now: DateTime<Utc>) -> bool {
        self.last_reset.month() != now.month() || self.last_reset.year() != now.year()
    }

    /// Whole days until the first day of the next calendar month.
    pub fn days_until_reset(&self, now: DateTime<Utc>) -> i64 {
        let (next_year, next_month) = if now.month() == 12 {
            (now.year() + 1, 1)
        } else {
            (now.year(), now.month() + 1)
        };
        // First instant of next month is always a valid timestamp.
        let next_month_start = Utc
            .with_ymd_and_hms(next_year, next_month, 1, 0, 0, 0)
            .single()
            .unwrap_or(now);
        (next_month_start - now).num_days()
    }

    /// Whole days remaining in the trial period; 0 when not on trial or expired.
    pub fn days_left_in_trial(&self, now: DateTime<Utc>) -> i64 {
        if !self.is_trial {
            return 0;
        }
        let trial_end = self.trial_start + Duration::days(self.trial_days);
        if now >= trial_end {
            return 0;
        }
        (trial_end - now).num_days()
    }

    /// Whether the trial conversion prompt should be shown.
    pub fn should_show_conversion(&self, now: DateTime<Utc>) -> bool {
        if !self.is_trial || self.has_seen_conversion {
            return false;
        }
        self.days_left_in_trial(now) <= CONVERSION_PROMPT_DAYS
    }
}
