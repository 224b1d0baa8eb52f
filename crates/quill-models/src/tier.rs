//! Subscription tiers and token allowances.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Monthly token allowance for each subscription tier.
pub const FREE_MONTHLY_TOKENS: i64 = 50_000;
pub const BASIC_MONTHLY_TOKENS: i64 = 200_000;
pub const ENTERPRISE_MONTHLY_TOKENS: i64 = 500_000;

/// Subscription tier enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionTier {
    #[default]
    Free,
    Basic,
    Enterprise,
}

impl SubscriptionTier {
    /// Parse from string (case-insensitive). Unknown values fall back to free.
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "basic" => SubscriptionTier::Basic,
            "enterprise" => SubscriptionTier::Enterprise,
            _ => SubscriptionTier::Free,
        }
    }

    /// Monthly token allowance granted to new accounts on this tier.
    pub fn monthly_tokens(&self) -> i64 {
        match self {
            SubscriptionTier::Free => FREE_MONTHLY_TOKENS,
            SubscriptionTier::Basic => BASIC_MONTHLY_TOKENS,
            SubscriptionTier::Enterprise => ENTERPRISE_MONTHLY_TOKENS,
        }
    }

    /// Get the tier name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionTier::Free => "free",
            SubscriptionTier::Basic => "basic",
            SubscriptionTier::Enterprise => "enterprise",
        }
    }
}

impl std::fmt::Display for SubscriptionTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
