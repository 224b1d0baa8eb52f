//! Limit-reached page data.
//!
//! Requests blocked by the quota gate are redirected here. The
//! frontend renders the block page from this payload: how far over the
//! user is, when the quota resets, and what a purchase would get them.

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use crate::auth::AuthUser;
use crate::error::ApiResult;
use crate::services::quota::QuotaStatus;
use crate::state::AppState;

/// A purchase option shown on the block page.
#[derive(Serialize)]
pub struct PurchaseOption {
    pub tokens: i64,
    pub amount_cents: i64,
    pub currency: &'static str,
}

/// Limit-reached page payload.
#[derive(Serialize)]
pub struct LimitReachedResponse {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quota: Option<QuotaStatus>,
    pub purchase_options: Vec<PurchaseOption>,
}

fn purchase_options() -> Vec<PurchaseOption> {
    vec![
        PurchaseOption {
            tokens: 50_000,
            amount_cents: 499,
            currency: "USD",
        },
        PurchaseOption {
            tokens: 150_000,
            amount_cents: 1299,
            currency: "USD",
        },
        PurchaseOption {
            tokens: 500_000,
            amount_cents: 3999,
            currency: "USD",
        },
    ]
}

/// Block page data. Works without authentication so the page can still
/// render after a session expires mid-redirect.
pub async fn limit_reached(
    State(state): State<AppState>,
    user: Option<AuthUser>,
) -> ApiResult<Json<LimitReachedResponse>> {
    let quota = match user {
        Some(ref user) => Some(state.quota_service.status(user).await?),
        None => None,
    };

    Ok(Json(LimitReachedResponse {
        message: "You have used your monthly token allowance. Purchase more tokens \
                  or wait for the next billing period."
            .to_string(),
        quota,
        purchase_options: purchase_options(),
    }))
}
