//! Relational persistence layer for the Quill backend.
//!
//! This crate owns every transactional invariant of the token quota
//! core:
//! - Atomic usage increments (counter + ledger event + alerts commit
//!   together or not at all)
//! - Exactly-once monthly resets with archival snapshots
//! - Idempotent threshold-alert insertion
//! - Purchase lifecycle with idempotency keys and single-in-flight
//!   enforcement per user
//!
//! Mutations run inside database transactions; unique indexes back the
//! idempotency guarantees so concurrent writers cannot duplicate rows.

pub mod alert_repo;
pub mod db;
pub mod error;
pub mod history_repo;
pub mod purchase_repo;
pub mod quota_repo;
pub mod usage_repo;

pub use alert_repo::AlertRepository;
pub use db::Store;
pub use error::{StoreError, StoreResult};
pub use history_repo::HistoryRepository;
pub use purchase_repo::{InitiatePurchase, PurchaseRepository};
pub use quota_repo::QuotaRepository;
pub use usage_repo::UsageEventRepository;

use chrono::{DateTime, TimeZone, Utc};

/// First instant of the given month and of the following month.
///
/// Used to bound ledger queries to a billing period. Callers pass the
/// period straight from query parameters, so an unrepresentable year or
/// month is a validation error, not a panic.
pub(crate) fn month_bounds(year: i32, month: u32) -> StoreResult<(DateTime<Utc>, DateTime<Utc>)> {
    let start = Utc
        .with_ymd_and_hms(year, month, 1, 0, 0, 0)
        .single()
        .ok_or_else(|| StoreError::validation(format!("invalid billing period {year}-{month}")))?;
    let (next_year, next_month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    let end = Utc
        .with_ymd_and_hms(next_year, next_month, 1, 0, 0, 0)
        .single()
        .ok_or_else(|| StoreError::validation(format!("invalid billing period {year}-{month}")))?;
    Ok((start, end))
}
