//! Usage alert repository: idempotent threshold tracking.

use chrono::{DateTime, Datelike, Utc};
use sqlx::{SqliteConnection, SqlitePool};
use tracing::info;
use uuid::Uuid;

use quill_models::{UsageAlert, ALERT_THRESHOLDS};

use crate::error::{StoreError, StoreResult};

/// Row mapping for `usage_alerts`.
#[derive(sqlx::FromRow)]
struct AlertRow {
    id: String,
    user_id: String,
    threshold: i64,
    month: i64,
    year: i64,
    usage_at_alert: i64,
    limit_at_alert: i64,
    is_acknowledged: bool,
    created_at: DateTime<Utc>,
    acknowledged_at: Option<DateTime<Utc>>,
}

impl AlertRow {
    fn into_model(self) -> StoreResult<UsageAlert> {
        let id = Uuid::parse_str(&self.id)
            .map_err(|_| StoreError::corrupt(format!("bad alert id {}", self.id)))?;
        Ok(UsageAlert {
            id,
            user_id: self.user_id,
            threshold: self.threshold,
            month: self.month,
            year: self.year,
            usage_at_alert: self.usage_at_alert,
            limit_at_alert: self.limit_at_alert,
            is_acknowledged: self.is_acknowledged,
            created_at: self.created_at,
            acknowledged_at: self.acknowledged_at,
        })
    }
}

const SELECT_ALERT: &str = "\
    SELECT id, user_id, threshold, month, year, usage_at_alert, limit_at_alert, \
           is_acknowledged, created_at, acknowledged_at \
    FROM usage_alerts";

/// Repository for usage threshold alerts.
pub struct AlertRepository {
    pool: SqlitePool,
}

impl AlertRepository {
    /// Create a new alert repository.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// List a user's alerts, newest first.
    pub async fn list(
        &self,
        user_id: &str,
        include_acknowledged: bool,
    ) -> StoreResult<Vec<UsageAlert>> {
        let sql = if include_acknowledged {
            format!("{SELECT_ALERT} WHERE user_id = ? ORDER BY created_at DESC")
        } else {
            format!(
                "{SELECT_ALERT} WHERE user_id = ? AND is_acknowledged = 0 ORDER BY created_at DESC"
            )
        };
        let rows = sqlx::query_as::<_, AlertRow>(&sql)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(AlertRow::into_model).collect()
    }

    /// Number of unacknowledged alerts for a user.
    pub async fn unacknowledged_count(&self, user_id: &str) -> StoreResult<i64> {
        let count: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM usage_alerts WHERE user_id = ? AND is_acknowledged = 0",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count.0)
    }

    /// Acknowledge an alert. Idempotent: acknowledging twice keeps the
    /// original `acknowledged_at` and succeeds.
    pub async fn acknowledge(
        &self,
        alert_id: Uuid,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<UsageAlert> {
        let result = sqlx::query(
            "UPDATE usage_alerts \
             SET is_acknowledged = 1, acknowledged_at = COALESCE(acknowledged_at, ?) \
             WHERE id = ? AND user_id = ?",
        )
        .bind(now)
        .bind(alert_id.to_string())
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::not_found(format!("no alert {alert_id} for {user_id}")));
        }

        let sql = format!("{SELECT_ALERT} WHERE id = ?");
        let row = sqlx::query_as::<_, AlertRow>(&sql)
            .bind(alert_id.to_string())
            .fetch_one(&self.pool)
            .await?;
        row.into_model()
    }

    /// Evaluate thresholds for the current state and insert any missing
    /// alerts. Safe to call from the request gate on every pass-through.
    pub async fn record_threshold_alerts(
        &self,
        user_id: &str,
        current_usage: i64,
        monthly_limit: i64,
        now: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let mut conn = self.pool.acquire().await?;
        insert_threshold_alerts_tx(&mut conn, user_id, current_usage, monthly_limit, now).await
    }
}

/// Insert one alert per crossed threshold, ascending, keyed on
/// `(user, threshold, month, year)`. Pre-existing rows are left
/// untouched. Returns the number of alerts actually created.
pub(crate) async fn insert_threshold_alerts_tx(
    conn: &mut SqliteConnection,
    user_id: &str,
    current_usage: i64,
    monthly_limit: i64,
    now: DateTime<Utc>,
) -> StoreResult<u64> {
    if monthly_limit == 0 {
        return Ok(0);
    }

    let percent = ((current_usage as f64 / monthly_limit as f64) * 100.0).min(100.0);
    let mut created = 0u64;

    for threshold in ALERT_THRESHOLDS {
        if percent < threshold as f64 {
            break;
        }
        let result = sqlx::query(
            "INSERT INTO usage_alerts \
             (id, user_id, threshold, month, year, usage_at_alert, limit_at_alert, \
              is_acknowledged, created_at, acknowledged_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, 0, ?, NULL) \
             ON CONFLICT(user_id, threshold, month, year) DO NOTHING",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(user_id)
        .bind(threshold)
        .bind(now.month() as i64)
        .bind(now.year() as i64)
        .bind(current_usage)
        .bind(monthly_limit)
        .bind(now)
        .execute(&mut *conn)
        .await?;
        created += result.rows_affected();
    }

    if created > 0 {
        info!(
            user_id = %user_id,
            created = created,
            percent = percent,
            "Created usage threshold alerts"
        );
    }
    Ok(created)
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use crate::Store;

    #[tokio::test]
    async fn test_threshold_alerts_are_idempotent() {
        let store = Store::in_memory().await.unwrap();
        let repo = store.alerts();
        let now = Utc.with_ymd_and_hms(2025, 6, 10, 0, 0, 0).unwrap();

        // 96% of limit: alerts at 50, 80 and 95, but not 100
        let created = repo.record_threshold_alerts("u1", 960, 1000, now).await.unwrap();
        assert_eq!(created, 3);

        // Re-evaluating the same state creates nothing new
        let created = repo.record_threshold_alerts("u1", 960, 1000, now).await.unwrap();
        assert_eq!(created, 0);

        let alerts = repo.list("u1", true).await.unwrap();
        let mut thresholds: Vec<i64> = alerts.iter().map(|a| a.threshold).collect();
        thresholds.sort_unstable();
        assert_eq!(thresholds, vec![50, 80, 95]);
    }

    #[tokio::test]
    async fn test_hundred_percent_alert_fires_at_limit() {
        let store = Store::in_memory().await.unwrap();
        let repo = store.alerts();
        let now = Utc.with_ymd_and_hms(2025, 6, 10, 0, 0, 0).unwrap();

        let created = repo.record_threshold_alerts("u1", 1000, 1000, now).await.unwrap();
        assert_eq!(created, 4);

        // Over the limit changes nothing: all four already exist
        let created = repo.record_threshold_alerts("u1", 1500, 1000, now).await.unwrap();
        assert_eq!(created, 0);
    }

    #[tokio::test]
    async fn test_zero_limit_creates_no_alerts() {
        let store = Store::in_memory().await.unwrap();
        let repo = store.alerts();
        let created = repo
            .record_threshold_alerts("u1", 500, 0, Utc::now())
            .await
            .unwrap();
        assert_eq!(created, 0);
    }

    #[tokio::test]
    async fn test_new_month_gets_fresh_alerts() {
        let store = Store::in_memory().await.unwrap();
        let repo = store.alerts();
        let june = Utc.with_ymd_and_hms(2025, 6, 10, 0, 0, 0).unwrap();
        let july = Utc.with_ymd_and_hms(2025, 7, 2, 0, 0, 0).unwrap();

        repo.record_threshold_alerts("u1", 600, 1000, june).await.unwrap();
        let created = repo.record_threshold_alerts("u1", 600, 1000, july).await.unwrap();
        // Same threshold, new period: a fresh alert
        assert_eq!(created, 1);
    }

    #[tokio::test]
    async fn test_acknowledge_is_idempotent() {
        let store = Store::in_memory().await.unwrap();
        let repo = store.alerts();
        let now = Utc.with_ymd_and_hms(2025, 6, 10, 0, 0, 0).unwrap();

        repo.record_threshold_alerts("u1", 600, 1000, now).await.unwrap();
        let alert = repo.list("u1", false).await.unwrap().remove(0);

        let first = repo.acknowledge(alert.id, "u1", now).await.unwrap();
        assert!(first.is_acknowledged);
        let first_at = first.acknowledged_at.unwrap();

        let later = Utc.with_ymd_and_hms(2025, 6, 11, 0, 0, 0).unwrap();
        let second = repo.acknowledge(alert.id, "u1", later).await.unwrap();
        assert_eq!(second.acknowledged_at.unwrap(), first_at);

        assert_eq!(repo.unacknowledged_count("u1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_acknowledge_unknown_alert_is_not_found() {
        let store = Store::in_memory().await.unwrap();
        let err = store
            .alerts()
            .acknowledge(uuid::Uuid::new_v4(), "u1", Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, crate::StoreError::NotFound(_)));
    }
}
