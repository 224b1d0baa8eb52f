//! Quota status API handlers.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;

use crate::auth::AuthUser;
use crate::error::ApiResult;
use crate::services::quota::QuotaStatus;
use crate::state::AppState;

/// Current quota status for the authenticated user.
///
/// Creating the account on first sight and rolling the month over are
/// both handled here, so the response always reflects the current
/// billing period.
pub async fn quota_status(
    State(state): State<AppState>,
    user: AuthUser,
) -> ApiResult<Json<QuotaStatus>> {
    let status = state.quota_service.status(&user).await?;
    Ok(Json(status))
}

/// Mark the trial conversion prompt as seen so it is not shown again.
pub async fn conversion_seen(
    State(state): State<AppState>,
    user: AuthUser,
) -> ApiResult<StatusCode> {
    state.quota_service.mark_conversion_seen(&user).await?;
    Ok(StatusCode::NO_CONTENT)
}
