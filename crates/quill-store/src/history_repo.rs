//! Monthly usage history repository.
//!
//! Snapshots are written by the reset path in `quota_repo`; this
//! repository only reads them back for reporting.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use quill_models::MonthlyUsageHistory;

use crate::error::StoreResult;

#[derive(sqlx::FromRow)]
struct HistoryRow {
    user_id: String,
    month: i64,
    year: i64,
    total_usage: i64,
    allocated_limit: i64,
    created_at: DateTime<Utc>,
}

impl From<HistoryRow> for MonthlyUsageHistory {
    fn from(row: HistoryRow) -> Self {
        MonthlyUsageHistory {
            user_id: row.user_id,
            month: row.month,
            year: row.year,
            total_usage: row.total_usage,
            allocated_limit: row.allocated_limit,
            created_at: row.created_at,
        }
    }
}

const SELECT_HISTORY: &str = "\
    SELECT user_id, month, year, total_usage, allocated_limit, created_at \
    FROM monthly_usage_history";

/// Repository for archived billing periods.
pub struct HistoryRepository {
    pool: SqlitePool,
}

impl HistoryRepository {
    /// Create a new history repository.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// All archived periods for a user, most recent first.
    pub async fn list_for_user(&self, user_id: &str) -> StoreResult<Vec<MonthlyUsageHistory>> {
        let sql = format!("{SELECT_HISTORY} WHERE user_id = ? ORDER BY year DESC, month DESC");
        let rows = sqlx::query_as::<_, HistoryRow>(&sql)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// Archived periods for a user within one calendar year, in month
    /// order.
    pub async fn yearly(&self, user_id: &str, year: i32) -> StoreResult<Vec<MonthlyUsageHistory>> {
        let sql = format!("{SELECT_HISTORY} WHERE user_id = ? AND year = ? ORDER BY month");
        let rows = sqlx::query_as::<_, HistoryRow>(&sql)
            .bind(user_id)
            .bind(year as i64)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }
}
