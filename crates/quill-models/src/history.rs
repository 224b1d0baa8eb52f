//! Archived monthly usage history.
//!
//! One snapshot per user per month, written at the moment a monthly
//! reset rolls the accounting period over.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Final usage state of a closed billing period.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct MonthlyUsageHistory {
    pub user_id: String,

    /// Month of the archived period (1-12).
    pub month: i64,

    /// Year of the archived period.
    pub year: i64,

    /// Total tokens consumed in the period.
    pub total_usage: i64,

    /// Limit that was allocated for the period.
    pub allocated_limit: i64,

    pub created_at: DateTime<Utc>,
}

impl MonthlyUsageHistory {
    /// Percentage of the allocated limit consumed, capped at 100.
    pub fn percent_used(&self) -> f64 {
        if self.allocated_limit == 0 {
            return 0.0;
        }
        let pct = (self.total_usage as f64 / self.allocated_limit as f64) * 100.0;
        pct.min(100.0)
    }
}
