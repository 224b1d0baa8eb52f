//! API routes.

use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::limit::RequestBodyLimitLayer;

use crate::handlers::alerts::{acknowledge_alert, list_alerts};
use crate::handlers::limit_reached::limit_reached;
use crate::handlers::purchases::{
    cancel_purchase, complete_purchase, initiate_purchase, list_purchases, refund_purchase,
};
use crate::handlers::quota::{conversion_seen, quota_status};
use crate::handlers::usage::{record_usage, usage_history, usage_months, usage_summary};
use crate::handlers::{health, ready};
use crate::metrics::metrics_middleware;
use crate::middleware::{
    cors_layer, quota_gate, rate_limit_middleware, request_id, request_logging, security_headers,
    RateLimiterCache,
};
use crate::state::AppState;

/// Create the API router.
pub fn create_router(state: AppState, metrics_handle: Option<PrometheusHandle>) -> Router {
    let usage_routes = Router::new()
        .route("/usage", post(record_usage))
        .route("/usage/history", get(usage_history))
        .route("/usage/summary", get(usage_summary))
        .route("/usage/months", get(usage_months));

    let quota_routes = Router::new()
        .route("/quota", get(quota_status))
        .route("/quota/conversion-seen", post(conversion_seen));

    let alert_routes = Router::new()
        .route("/alerts", get(list_alerts))
        .route("/alerts/:alert_id/acknowledge", post(acknowledge_alert));

    let purchase_routes = Router::new()
        .route("/purchases", post(initiate_purchase).get(list_purchases))
        .route("/purchases/complete", post(complete_purchase))
        .route("/purchases/cancel", post(cancel_purchase))
        .route("/purchases/refund", post(refund_purchase));

    // Create rate limiter for API routes
    let rate_limiter = std::sync::Arc::new(RateLimiterCache::new(state.config.rate_limit_rps));

    let api_routes = Router::new()
        .merge(usage_routes)
        .merge(quota_routes)
        .merge(alert_routes)
        .merge(purchase_routes)
        .layer(middleware::from_fn_with_state(
            rate_limiter,
            rate_limit_middleware,
        ));

    let health_routes = Router::new()
        .route("/health", get(health))
        .route("/healthz", get(health))
        .route("/ready", get(ready));

    // Metrics endpoint (if enabled)
    let metrics_routes = if let Some(handle) = metrics_handle {
        Router::new().route("/metrics", get(move || async move { handle.render() }))
    } else {
        Router::new()
    };

    Router::new()
        .nest("/api", api_routes)
        .route("/limit-reached", get(limit_reached))
        .merge(health_routes)
        .merge(metrics_routes)
        // The gate sits outside /api nesting so it sees full request paths
        .layer(middleware::from_fn_with_state(state.clone(), quota_gate))
        .layer(RequestBodyLimitLayer::new(state.config.max_body_size))
        .layer(middleware::from_fn(metrics_middleware))
        .layer(middleware::from_fn(security_headers))
        .layer(middleware::from_fn(request_id))
        .layer(middleware::from_fn(request_logging))
        .layer(cors_layer(&state.config.cors_origins))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use chrono::Utc;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use tower::ServiceExt;

    use quill_models::{SubscriptionTier, UsageContext, UsageFeature};
    use quill_store::Store;

    use crate::auth::Claims;
    use crate::config::ApiConfig;
    use crate::state::AppState;

    const SECRET: &str = "test-secret";

    async fn test_state() -> AppState {
        let mut config = ApiConfig::default();
        config.jwt_secret = SECRET.to_string();
        let store = Arc::new(Store::in_memory().await.unwrap());
        AppState::with_store(config, store)
    }

    fn token(sub: &str, staff: bool, tier: &str) -> String {
        let now = Utc::now().timestamp();
        let claims = Claims {
            sub: sub.to_string(),
            exp: now + 3600,
            iat: now,
            staff,
            tier: tier.to_string(),
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap()
    }

    fn get(path: &str, bearer: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().uri(path);
        if let Some(token) = bearer {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        builder.body(Body::empty()).unwrap()
    }

    fn post_json(path: &str, bearer: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(path)
            .header(header::AUTHORIZATION, format!("Bearer {bearer}"))
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_is_public() {
        let app = super::create_router(test_state().await, None);
        let response = app.oneshot(get("/health", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_quota_requires_auth() {
        let app = super::create_router(test_state().await, None);
        let response = app.oneshot(get("/api/quota", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_record_usage_and_status() {
        let state = test_state().await;
        let app = super::create_router(state, None);
        let token = token("u1", false, "free");

        let response = app
            .clone()
            .oneshot(post_json(
                "/api/usage",
                &token,
                r#"{"feature": "character_chat", "tokens_used": 500, "character_id": 7}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app.oneshot(get("/api/quota", Some(&token))).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let status: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(status["current_usage"], 500);
        assert_eq!(status["monthly_limit"], 50_000);
    }

    #[tokio::test]
    async fn test_unknown_feature_is_rejected() {
        let app = super::create_router(test_state().await, None);
        let token = token("u1", false, "free");

        let response = app
            .oneshot(post_json(
                "/api/usage",
                &token,
                r#"{"feature": "mind_reading", "tokens_used": 10}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_gate_redirects_over_quota_user() {
        let state = test_state().await;
        let ctx = UsageContext::new(UsageFeature::CharacterChat);
        state
            .store
            .quota()
            .record_usage("u1", 50_000, &ctx, SubscriptionTier::Free, false, Utc::now())
            .await
            .unwrap();

        let app = super::create_router(state, None);
        let token = token("u1", false, "free");

        // Non-exempt consuming route is redirected
        let response = app
            .clone()
            .oneshot(post_json(
                "/api/usage",
                &token,
                r#"{"feature": "character_chat", "tokens_used": 10}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(
            response.headers().get(header::LOCATION).unwrap(),
            "/limit-reached"
        );

        // Quota visibility stays reachable
        let response = app
            .clone()
            .oneshot(get("/api/quota", Some(&token)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        // And the block page itself
        let response = app
            .oneshot(get("/limit-reached", Some(&token)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_staff_pass_gate_over_quota() {
        let state = test_state().await;
        let ctx = UsageContext::new(UsageFeature::CharacterChat);
        state
            .store
            .quota()
            .record_usage("admin", 60_000, &ctx, SubscriptionTier::Free, true, Utc::now())
            .await
            .unwrap();

        let app = super::create_router(state, None);
        let token = token("admin", true, "free");

        let response = app
            .oneshot(post_json(
                "/api/usage",
                &token,
                r#"{"feature": "character_chat", "tokens_used": 10}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_purchase_flow_over_http() {
        let state = test_state().await;
        let app = super::create_router(state.clone(), None);
        let token = token("u1", false, "free");

        let response = app
            .clone()
            .oneshot(post_json(
                "/api/purchases",
                &token,
                r#"{"tokens_purchased": 1000, "amount_paid_cents": 500, "idempotency_key": "abc"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let purchase: serde_json::Value = serde_json::from_slice(&body).unwrap();
        let transaction_id = purchase["transaction_id"].as_str().unwrap().to_string();
        assert_eq!(purchase["payment_status"], "processing");

        let response = app
            .clone()
            .oneshot(post_json(
                "/api/purchases/complete",
                &token,
                &format!(r#"{{"transaction_id": "{transaction_id}", "provider_payment_id": "pay_9"}}"#),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let account = state.store.quota().get("u1").await.unwrap();
        // Completing credited the account (created on the fly)
        assert_eq!(account.unwrap().monthly_limit, 1000);
    }

    #[tokio::test]
    async fn test_refund_forbidden_for_non_staff() {
        let state = test_state().await;
        let app = super::create_router(state, None);
        let token = token("u1", false, "free");

        let response = app
            .clone()
            .oneshot(post_json(
                "/api/purchases",
                &token,
                r#"{"tokens_purchased": 1000, "amount_paid_cents": 500, "idempotency_key": "k1"}"#,
            ))
            .await
            .unwrap();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let purchase: serde_json::Value = serde_json::from_slice(&body).unwrap();
        let transaction_id = purchase["transaction_id"].as_str().unwrap().to_string();

        let response = app
            .oneshot(post_json(
                "/api/purchases/refund",
                &token,
                &format!(r#"{{"transaction_id": "{transaction_id}"}}"#),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }
}
