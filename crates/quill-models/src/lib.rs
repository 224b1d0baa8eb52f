//! Shared data models for the Quill backend.
//!
//! This crate provides Serde-serializable types for:
//! - Quota accounts and subscription tiers
//! - Token usage events and the feature taxonomy
//! - Usage threshold alerts
//! - Token purchase transactions and their lifecycle
//! - Archived monthly usage history

pub mod alert;
pub mod history;
pub mod purchase;
pub mod quota;
pub mod tier;
pub mod usage;

// Re-export common types
pub use alert::{UsageAlert, ALERT_THRESHOLDS};
pub use history::MonthlyUsageHistory;
pub use purchase::{PaymentStatus, PurchaseLookup, PurchaseTransaction};
pub use quota::QuotaAccount;
pub use tier::SubscriptionTier;
pub use usage::{UsageContext, UsageEvent, UsageFeature};
