//! Usage ledger API handlers.

use std::collections::HashMap;

use axum::extract::{Query, State};
use axum::Json;
use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use quill_models::{MonthlyUsageHistory, UsageContext, UsageEvent, UsageFeature};

use crate::auth::AuthUser;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// Maximum allowed limit for history queries.
const MAX_LIMIT: u32 = 100;

fn default_limit() -> u32 {
    50
}

/// Request body for recording token consumption.
#[derive(Debug, Deserialize)]
pub struct RecordUsageRequest {
    /// Feature that consumed the tokens. Must be one of the known
    /// feature names (character_chat, story_assistance, ...).
    pub feature: String,
    /// Number of tokens consumed (must be positive).
    pub tokens_used: i64,
    pub character_id: Option<i64>,
    pub conversation_id: Option<i64>,
    pub story_id: Option<i64>,
    pub world_id: Option<i64>,
}

/// Response after recording usage.
#[derive(Serialize)]
pub struct RecordUsageResponse {
    pub current_usage: i64,
    pub monthly_limit: i64,
    pub remaining: i64,
    pub percent_used: f64,
    pub is_over_quota: bool,
}

/// Record token consumption for the authenticated user.
pub async fn record_usage(
    State(state): State<AppState>,
    user: AuthUser,
    Json(body): Json<RecordUsageRequest>,
) -> ApiResult<Json<RecordUsageResponse>> {
    let feature = UsageFeature::from_str(body.feature.trim()).ok_or_else(|| {
        ApiError::bad_request(format!("Unknown feature '{}'", body.feature))
    })?;

    let mut context = UsageContext::new(feature);
    if let Some(id) = body.character_id {
        context = context.with_character(id);
    }
    if let Some(id) = body.conversation_id {
        context = context.with_conversation(id);
    }
    if let Some(id) = body.story_id {
        context = context.with_story(id);
    }
    if let Some(id) = body.world_id {
        context = context.with_world(id);
    }

    let account = state
        .quota_service
        .record_usage(&user, body.tokens_used, &context)
        .await?;

    Ok(Json(RecordUsageResponse {
        current_usage: account.current_usage,
        monthly_limit: account.monthly_limit,
        remaining: account.remaining_tokens(),
        percent_used: account.percent_used(),
        is_over_quota: account.is_over_quota(),
    }))
}

/// Query parameters for the usage history endpoint.
#[derive(Debug, Deserialize)]
pub struct UsageHistoryQuery {
    /// Maximum number of events to return (clamped to 1..100).
    #[serde(default = "default_limit")]
    pub limit: u32,
    /// Opaque page token from the previous response's
    /// `next_page_token`.
    pub cursor: Option<String>,
}

/// Page tokens are `<rfc3339 timestamp>|<event id>`; the id breaks
/// ties between events sharing a timestamp.
fn parse_page_token(token: &str) -> Result<(DateTime<Utc>, Uuid), ApiError> {
    let malformed = || ApiError::bad_request("malformed page token");
    let (timestamp, id) = token.split_once('|').ok_or_else(malformed)?;
    let timestamp = DateTime::parse_from_rfc3339(timestamp)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| malformed())?;
    let id = Uuid::parse_str(id).map_err(|_| malformed())?;
    Ok((timestamp, id))
}

/// Usage event response (serializable version).
#[derive(Serialize)]
pub struct UsageEventResponse {
    pub id: String,
    pub feature: String,
    pub feature_label: String,
    pub tokens_used: i64,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub character_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub story_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub world_id: Option<i64>,
}

impl From<UsageEvent> for UsageEventResponse {
    fn from(event: UsageEvent) -> Self {
        Self {
            id: event.id.to_string(),
            feature: event.feature.as_str().to_string(),
            feature_label: event.feature.label().to_string(),
            tokens_used: event.tokens_used,
            timestamp: event.timestamp.to_rfc3339(),
            character_id: event.character_id,
            conversation_id: event.conversation_id,
            story_id: event.story_id,
            world_id: event.world_id,
        }
    }
}

/// Usage history response.
#[derive(Serialize)]
pub struct UsageHistoryResponse {
    pub events: Vec<UsageEventResponse>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_page_token: Option<String>,
}

/// Paginated ledger of the authenticated user's usage events.
pub async fn usage_history(
    State(state): State<AppState>,
    user: AuthUser,
    Query(query): Query<UsageHistoryQuery>,
) -> ApiResult<Json<UsageHistoryResponse>> {
    let cursor = query.cursor.as_deref().map(parse_page_token).transpose()?;

    let effective_limit = query.limit.clamp(1, MAX_LIMIT);
    let (events, next_cursor) = state
        .store
        .usage()
        .list_page(&user.user_id, effective_limit, cursor)
        .await?;

    Ok(Json(UsageHistoryResponse {
        events: events.into_iter().map(Into::into).collect(),
        next_page_token: next_cursor.map(|(ts, id)| format!("{}|{id}", ts.to_rfc3339())),
    }))
}

/// Query parameters for the month summary endpoint.
#[derive(Debug, Deserialize)]
pub struct UsageSummaryQuery {
    /// Year of the billing period (defaults to the current one).
    pub year: Option<i32>,
    /// Month of the billing period, 1-12 (defaults to the current one).
    pub month: Option<u32>,
}

/// Per-feature summary for one billing period.
#[derive(Serialize)]
pub struct UsageSummaryResponse {
    /// Period in YYYY-MM format.
    pub month: String,
    pub total: i64,
    pub by_feature: HashMap<String, i64>,
}

/// Tokens used per feature in a billing period.
pub async fn usage_summary(
    State(state): State<AppState>,
    user: AuthUser,
    Query(query): Query<UsageSummaryQuery>,
) -> ApiResult<Json<UsageSummaryResponse>> {
    let now = Utc::now();
    let year = query.year.unwrap_or_else(|| now.year());
    let month = query.month.unwrap_or_else(|| now.month());
    if !(1..=12).contains(&month) {
        return Err(ApiError::bad_request("month must be between 1 and 12"));
    }

    let by_feature = state.store.usage().month_summary(&user.user_id, year, month).await?;
    let total = state.store.usage().month_total(&user.user_id, year, month).await?;

    Ok(Json(UsageSummaryResponse {
        month: format!("{year:04}-{month:02}"),
        total,
        by_feature,
    }))
}

/// Archived monthly period response.
#[derive(Serialize)]
pub struct MonthlyHistoryResponse {
    pub month: i64,
    pub year: i64,
    pub total_usage: i64,
    pub allocated_limit: i64,
    pub percent_used: f64,
}

impl From<MonthlyUsageHistory> for MonthlyHistoryResponse {
    fn from(h: MonthlyUsageHistory) -> Self {
        let percent_used = h.percent_used();
        Self {
            month: h.month,
            year: h.year,
            total_usage: h.total_usage,
            allocated_limit: h.allocated_limit,
            percent_used,
        }
    }
}

/// Archived billing periods, most recent first.
pub async fn usage_months(
    State(state): State<AppState>,
    user: AuthUser,
) -> ApiResult<Json<Vec<MonthlyHistoryResponse>>> {
    let months = state.store.history().list_for_user(&user.user_id).await?;
    Ok(Json(months.into_iter().map(Into::into).collect()))
}
