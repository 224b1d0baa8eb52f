//! Usage alert API handlers.

use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use quill_models::UsageAlert;

use crate::auth::AuthUser;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// Query parameters for the alert list endpoint.
#[derive(Debug, Deserialize)]
pub struct AlertListQuery {
    /// Include already-acknowledged alerts (default: false).
    #[serde(default)]
    pub include_acknowledged: bool,
}

/// Usage alert response (serializable version).
#[derive(Serialize)]
pub struct AlertResponse {
    pub id: String,
    pub threshold: i64,
    pub label: String,
    pub month: i64,
    pub year: i64,
    pub usage_at_alert: i64,
    pub limit_at_alert: i64,
    pub is_acknowledged: bool,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acknowledged_at: Option<String>,
}

impl From<UsageAlert> for AlertResponse {
    fn from(alert: UsageAlert) -> Self {
        let label = alert.threshold_label();
        Self {
            id: alert.id.to_string(),
            threshold: alert.threshold,
            label,
            month: alert.month,
            year: alert.year,
            usage_at_alert: alert.usage_at_alert,
            limit_at_alert: alert.limit_at_alert,
            is_acknowledged: alert.is_acknowledged,
            created_at: alert.created_at.to_rfc3339(),
            acknowledged_at: alert.acknowledged_at.map(|t| t.to_rfc3339()),
        }
    }
}

/// Alert list response.
#[derive(Serialize)]
pub struct AlertListResponse {
    pub alerts: Vec<AlertResponse>,
    pub unacknowledged: i64,
}

/// The authenticated user's threshold alerts, newest first.
pub async fn list_alerts(
    State(state): State<AppState>,
    user: AuthUser,
    Query(query): Query<AlertListQuery>,
) -> ApiResult<Json<AlertListResponse>> {
    let alerts = state
        .store
        .alerts()
        .list(&user.user_id, query.include_acknowledged)
        .await?;
    let unacknowledged = state.store.alerts().unacknowledged_count(&user.user_id).await?;

    Ok(Json(AlertListResponse {
        alerts: alerts.into_iter().map(Into::into).collect(),
        unacknowledged,
    }))
}

/// Acknowledge one alert. Idempotent.
pub async fn acknowledge_alert(
    State(state): State<AppState>,
    user: AuthUser,
    Path(alert_id): Path<String>,
) -> ApiResult<Json<AlertResponse>> {
    let alert_id = Uuid::parse_str(&alert_id)
        .map_err(|_| ApiError::bad_request("alert id must be a UUID"))?;

    let alert = state
        .store
        .alerts()
        .acknowledge(alert_id, &user.user_id, Utc::now())
        .await?;
    Ok(Json(alert.into()))
}
