//! Token purchase API handlers.

use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use quill_models::{PurchaseLookup, PurchaseTransaction};

use crate::auth::AuthUser;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

fn default_currency() -> String {
    "USD".to_string()
}

fn default_provider() -> String {
    "stripe".to_string()
}

fn default_limit() -> u32 {
    50
}

/// Request body for starting a purchase.
#[derive(Debug, Deserialize)]
pub struct InitiatePurchaseRequest {
    /// Tokens to credit once payment settles (must be positive).
    pub tokens_purchased: i64,
    /// Price in the smallest currency unit (cents).
    pub amount_paid_cents: i64,
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(default = "default_provider")]
    pub payment_provider: String,
    /// Client-supplied retry-safety key; generated when absent.
    pub idempotency_key: Option<String>,
}

/// Purchase transaction response (serializable version).
#[derive(Serialize)]
pub struct PurchaseResponse {
    pub id: String,
    pub transaction_id: String,
    pub tokens_purchased: i64,
    pub amount_paid_cents: i64,
    pub currency: String,
    pub payment_provider: String,
    pub payment_status: String,
    pub is_processing: bool,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
}

impl From<PurchaseTransaction> for PurchaseResponse {
    fn from(tx: PurchaseTransaction) -> Self {
        Self {
            id: tx.id.to_string(),
            transaction_id: tx.transaction_id.to_string(),
            tokens_purchased: tx.tokens_purchased,
            amount_paid_cents: tx.amount_paid_cents,
            currency: tx.currency,
            payment_provider: tx.payment_provider,
            payment_status: tx.payment_status.as_str().to_string(),
            is_processing: tx.is_processing,
            created_at: tx.created_at.to_rfc3339(),
            payment_id: tx.payment_id,
            completed_at: tx.completed_at.map(|t| t.to_rfc3339()),
        }
    }
}

/// Start a token purchase for the authenticated user.
///
/// The idempotency key can come from the `Idempotency-Key` header or
/// the request body; the header wins when both are present.
pub async fn initiate_purchase(
    State(state): State<AppState>,
    user: AuthUser,
    headers: HeaderMap,
    Json(body): Json<InitiatePurchaseRequest>,
) -> ApiResult<Json<PurchaseResponse>> {
    let idempotency_key = headers
        .get("Idempotency-Key")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or(body.idempotency_key);

    if let Some(ref key) = idempotency_key {
        if key.is_empty() || key.len() > 128 {
            return Err(ApiError::bad_request(
                "idempotency key must be 1-128 characters",
            ));
        }
    }

    let purchase = state
        .purchase_service
        .initiate(
            &user,
            body.tokens_purchased,
            body.amount_paid_cents,
            body.currency,
            body.payment_provider,
            idempotency_key,
        )
        .await?;
    Ok(Json(purchase.into()))
}

/// Query parameters for the purchase list endpoint.
#[derive(Debug, Deserialize)]
pub struct PurchaseListQuery {
    /// Maximum number of purchases to return (clamped to 1..100).
    #[serde(default = "default_limit")]
    pub limit: u32,
}

/// The authenticated user's purchases, newest first.
pub async fn list_purchases(
    State(state): State<AppState>,
    user: AuthUser,
    Query(query): Query<PurchaseListQuery>,
) -> ApiResult<Json<Vec<PurchaseResponse>>> {
    let purchases = state.purchase_service.list(&user, query.limit).await?;
    Ok(Json(purchases.into_iter().map(Into::into).collect()))
}

/// Reference to an existing purchase. Exactly one of the fields must
/// be set.
#[derive(Debug, Deserialize)]
pub struct PurchaseRef {
    pub purchase_id: Option<String>,
    pub transaction_id: Option<String>,
    pub payment_id: Option<String>,
}

impl PurchaseRef {
    fn lookup(&self) -> Result<PurchaseLookup, ApiError> {
        let set = [
            self.purchase_id.is_some(),
            self.transaction_id.is_some(),
            self.payment_id.is_some(),
        ]
        .iter()
        .filter(|b| **b)
        .count();
        if set != 1 {
            return Err(ApiError::bad_request(
                "provide exactly one of purchase_id, transaction_id, payment_id",
            ));
        }

        if let Some(ref id) = self.purchase_id {
            let id = Uuid::parse_str(id)
                .map_err(|_| ApiError::bad_request("purchase_id must be a UUID"))?;
            return Ok(PurchaseLookup::PurchaseId(id));
        }
        if let Some(ref id) = self.transaction_id {
            let id = Uuid::parse_str(id)
                .map_err(|_| ApiError::bad_request("transaction_id must be a UUID"))?;
            return Ok(PurchaseLookup::TransactionId(id));
        }
        // Guarded by the count check above
        Ok(PurchaseLookup::PaymentId(
            self.payment_id.clone().unwrap_or_default(),
        ))
    }
}

/// Request body for confirming a purchase.
#[derive(Debug, Deserialize)]
pub struct CompletePurchaseRequest {
    #[serde(flatten)]
    pub purchase: PurchaseRef,
    /// Payment processor reference to attach on completion.
    pub provider_payment_id: Option<String>,
}

/// Confirm a purchase and credit its tokens. Idempotent on retry.
pub async fn complete_purchase(
    State(state): State<AppState>,
    user: AuthUser,
    Json(body): Json<CompletePurchaseRequest>,
) -> ApiResult<Json<PurchaseResponse>> {
    let lookup = body.purchase.lookup()?;
    let purchase = state
        .purchase_service
        .complete(&user, &lookup, body.provider_payment_id.as_deref())
        .await?;
    Ok(Json(purchase.into()))
}

/// Request body for cancelling or refunding a purchase.
#[derive(Debug, Deserialize)]
pub struct PurchaseActionRequest {
    #[serde(flatten)]
    pub purchase: PurchaseRef,
}

/// Cancel a purchase that has not settled. No tokens are credited.
pub async fn cancel_purchase(
    State(state): State<AppState>,
    user: AuthUser,
    Json(body): Json<PurchaseActionRequest>,
) -> ApiResult<Json<PurchaseResponse>> {
    let lookup = body.purchase.lookup()?;
    let purchase = state.purchase_service.cancel(&user, &lookup).await?;
    Ok(Json(purchase.into()))
}

/// Mark a completed purchase refunded. Staff only.
pub async fn refund_purchase(
    State(state): State<AppState>,
    user: AuthUser,
    Json(body): Json<PurchaseActionRequest>,
) -> ApiResult<Json<PurchaseResponse>> {
    let lookup = body.purchase.lookup()?;
    let purchase = state.purchase_service.refund(&user, &lookup).await?;
    Ok(Json(purchase.into()))
}
