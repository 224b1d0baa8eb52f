//! Usage threshold alert data model.
//!
//! Alerts mark the first time a user's usage crosses a percentage
//! threshold within a billing period. At most one alert exists per
//! `(user, threshold, month, year)`.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Thresholds evaluated at every evaluation point, in ascending order.
pub const ALERT_THRESHOLDS: [i64; 4] = [50, 80, 95, 100];

/// A usage threshold alert.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct UsageAlert {
    /// Unique identifier (UUID).
    pub id: Uuid,

    /// User the alert belongs to.
    pub user_id: String,

    /// Threshold percentage crossed (50, 80, 95 or 100).
    pub threshold: i64,

    /// Billing-period month (1-12) the alert applies to.
    pub month: i64,

    /// Billing-period year the alert applies to.
    pub year: i64,

    /// Usage at the moment the alert was created.
    pub usage_at_alert: i64,

    /// Limit at the moment the alert was created.
    pub limit_at_alert: i64,

    /// Whether the user has acknowledged the alert.
    pub is_acknowledged: bool,

    pub created_at: DateTime<Utc>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub acknowledged_at: Option<DateTime<Utc>>,
}

impl UsageAlert {
    /// Human-readable description of the threshold.
    pub fn threshold_label(&self) -> String {
        if self.threshold >= 100 {
            "100% of limit (limit reached)".to_string()
        } else {
            format!("{}% of limit", self.threshold)
        }
    }
}
