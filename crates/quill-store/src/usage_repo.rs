//! Usage event repository: the append-only token ledger.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use sqlx::{SqliteConnection, SqlitePool};
use uuid::Uuid;

use quill_models::{UsageEvent, UsageFeature};

use crate::error::{StoreError, StoreResult};
use crate::month_bounds;

/// Row mapping for `usage_events`.
#[derive(sqlx::FromRow)]
struct EventRow {
    id: String,
    user_id: String,
    feature: String,
    tokens_used: i64,
    character_id: Option<i64>,
    conversation_id: Option<i64>,
    story_id: Option<i64>,
    world_id: Option<i64>,
    timestamp: DateTime<Utc>,
}

impl EventRow {
    fn into_model(self) -> StoreResult<UsageEvent> {
        let id = Uuid::parse_str(&self.id)
            .map_err(|_| StoreError::corrupt(format!("bad usage event id {}", self.id)))?;
        let feature = UsageFeature::from_str(&self.feature)
            .ok_or_else(|| StoreError::corrupt(format!("unknown feature {}", self.feature)))?;
        Ok(UsageEvent {
            id,
            user_id: self.user_id,
            feature,
            tokens_used: self.tokens_used,
            character_id: self.character_id,
            conversation_id: self.conversation_id,
            story_id: self.story_id,
            world_id: self.world_id,
            timestamp: self.timestamp,
        })
    }
}

const SELECT_EVENT: &str = "\
    SELECT id, user_id, feature, tokens_used, character_id, conversation_id, \
           story_id, world_id, timestamp \
    FROM usage_events";

/// Repository for the usage ledger.
pub struct UsageEventRepository {
    pool: SqlitePool,
}

impl UsageEventRepository {
    /// Create a new usage event repository.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// List a user's events newest first, with cursor pagination.
    ///
    /// `before` is the `(timestamp, id)` of the last event from the
    /// previous page; the id breaks ties between events sharing a
    /// timestamp so no event is skipped at page boundaries. Returns the
    /// page and the cursor for the next one, if any.
    pub async fn list_page(
        &self,
        user_id: &str,
        limit: u32,
        before: Option<(DateTime<Utc>, Uuid)>,
    ) -> StoreResult<(Vec<UsageEvent>, Option<(DateTime<Utc>, Uuid)>)> {
        let effective_limit = limit.clamp(1, 100) as i64;

        let rows = match before {
            Some((timestamp, id)) => {
                let sql = format!(
                    "{SELECT_EVENT} WHERE user_id = ? \
                     AND (timestamp < ? OR (timestamp = ? AND id < ?)) \
                     ORDER BY timestamp DESC, id DESC LIMIT ?"
                );
                sqlx::query_as::<_, EventRow>(&sql)
                    .bind(user_id)
                    .bind(timestamp)
                    .bind(timestamp)
                    .bind(id.to_string())
                    .bind(effective_limit)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                let sql = format!(
                    "{SELECT_EVENT} WHERE user_id = ? ORDER BY timestamp DESC, id DESC LIMIT ?"
                );
                sqlx::query_as::<_, EventRow>(&sql)
                    .bind(user_id)
                    .bind(effective_limit)
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        let events: Vec<UsageEvent> = rows
            .into_iter()
            .map(EventRow::into_model)
            .collect::<StoreResult<_>>()?;

        let next_cursor = if events.len() == effective_limit as usize {
            events.last().map(|e| (e.timestamp, e.id))
        } else {
            None
        };
        Ok((events, next_cursor))
    }

    /// Tokens used per feature within a billing period.
    pub async fn month_summary(
        &self,
        user_id: &str,
        year: i32,
        month: u32,
    ) -> StoreResult<HashMap<String, i64>> {
        let (start, end) = month_bounds(year, month)?;

        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT feature, COALESCE(SUM(tokens_used), 0) FROM usage_events \
             WHERE user_id = ? AND timestamp >= ? AND timestamp < ? \
             GROUP BY feature",
        )
        .bind(user_id)
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;

        let mut summary: HashMap<String, i64> = UsageFeature::all()
            .iter()
            .map(|f| (f.as_str().to_string(), 0))
            .collect();
        for (feature, total) in rows {
            summary.insert(feature, total);
        }
        Ok(summary)
    }

    /// Total tokens used within a billing period.
    pub async fn month_total(&self, user_id: &str, year: i32, month: u32) -> StoreResult<i64> {
        let (start, end) = month_bounds(year, month)?;
        let total: (i64,) = sqlx::query_as(
            "SELECT COALESCE(SUM(tokens_used), 0) FROM usage_events \
             WHERE user_id = ? AND timestamp >= ? AND timestamp < ?",
        )
        .bind(user_id)
        .bind(start)
        .bind(end)
        .fetch_one(&self.pool)
        .await?;
        Ok(total.0)
    }
}

/// Append a ledger event inside an open transaction.
pub(crate) async fn insert_event_tx(
    conn: &mut SqliteConnection,
    event: &UsageEvent,
) -> StoreResult<()> {
    sqlx::query(
        "INSERT INTO usage_events \
         (id, user_id, feature, tokens_used, character_id, conversation_id, \
          story_id, world_id, timestamp) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(event.id.to_string())
    .bind(&event.user_id)
    .bind(event.feature.as_str())
    .bind(event.tokens_used)
    .bind(event.character_id)
    .bind(event.conversation_id)
    .bind(event.story_id)
    .bind(event.world_id)
    .bind(event.timestamp)
    .execute(conn)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use quill_models::{SubscriptionTier, UsageContext, UsageFeature};

    use crate::Store;

    #[tokio::test]
    async fn test_month_summary_by_feature() {
        let store = Store::in_memory().await.unwrap();
        let quota = store.quota();
        let june = Utc.with_ymd_and_hms(2025, 6, 10, 0, 0, 0).unwrap();

        let chat = UsageContext::new(UsageFeature::CharacterChat);
        let story = UsageContext::new(UsageFeature::StoryAssistance);
        quota
            .record_usage("u1", 300, &chat, SubscriptionTier::Free, false, june)
            .await
            .unwrap();
        quota
            .record_usage("u1", 200, &chat, SubscriptionTier::Free, false, june)
            .await
            .unwrap();
        quota
            .record_usage("u1", 150, &story, SubscriptionTier::Free, false, june)
            .await
            .unwrap();

        let summary = store.usage().month_summary("u1", 2025, 6).await.unwrap();
        assert_eq!(summary["character_chat"], 500);
        assert_eq!(summary["story_assistance"], 150);
        assert_eq!(summary["world_building"], 0);

        assert_eq!(store.usage().month_total("u1", 2025, 6).await.unwrap(), 650);
        assert_eq!(store.usage().month_total("u1", 2025, 5).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_list_page_pagination() {
        let store = Store::in_memory().await.unwrap();
        let quota = store.quota();
        let ctx = UsageContext::new(UsageFeature::CharacterChat);

        for i in 0..5 {
            let at = Utc.with_ymd_and_hms(2025, 6, 10, 12, i, 0).unwrap();
            quota
                .record_usage("u1", 100, &ctx, SubscriptionTier::Free, false, at)
                .await
                .unwrap();
        }

        let (page, cursor) = store.usage().list_page("u1", 2, None).await.unwrap();
        assert_eq!(page.len(), 2);
        let cursor = cursor.expect("more pages");
        // Newest first
        assert!(page[0].timestamp > page[1].timestamp);

        let (page2, _) = store.usage().list_page("u1", 2, Some(cursor)).await.unwrap();
        assert_eq!(page2.len(), 2);
        assert!(page2[0].timestamp < page[1].timestamp);
    }

    #[tokio::test]
    async fn test_list_page_is_lossless_on_tied_timestamps() {
        let store = Store::in_memory().await.unwrap();
        let quota = store.quota();
        let ctx = UsageContext::new(UsageFeature::CharacterChat);
        let at = Utc.with_ymd_and_hms(2025, 6, 10, 12, 0, 0).unwrap();

        // All five events share the exact same timestamp
        for _ in 0..5 {
            quota
                .record_usage("u1", 100, &ctx, SubscriptionTier::Free, false, at)
                .await
                .unwrap();
        }

        let mut seen = std::collections::HashSet::new();
        let mut cursor = None;
        loop {
            let (page, next) = store.usage().list_page("u1", 2, cursor).await.unwrap();
            for event in &page {
                assert!(seen.insert(event.id), "event returned twice");
            }
            match next {
                Some(c) => cursor = Some(c),
                None => break,
            }
        }
        assert_eq!(seen.len(), 5);
    }

    #[tokio::test]
    async fn test_summary_rejects_unrepresentable_period() {
        let store = Store::in_memory().await.unwrap();

        let err = store.usage().month_summary("u1", 999_999, 5).await.unwrap_err();
        assert!(matches!(err, crate::StoreError::Validation(_)));

        let err = store.usage().month_total("u1", 999_999, 5).await.unwrap_err();
        assert!(matches!(err, crate::StoreError::Validation(_)));
    }
}
