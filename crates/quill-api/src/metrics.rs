//! Prometheus metrics for the API server.

use axum::body::Body;
use axum::http::{Request, Response};
use axum::middleware::Next;
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::time::Instant;

/// Initialize the Prometheus metrics recorder.
/// Returns a handle that can be used to render metrics.
pub fn init_metrics() -> PrometheusHandle {
    PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus recorder")
}

/// Metric names as constants for consistency.
pub mod names {
    // HTTP metrics
    pub const HTTP_REQUESTS_TOTAL: &str = "quill_http_requests_total";
    pub const HTTP_REQUEST_DURATION_SECONDS: &str = "quill_http_request_duration_seconds";
    pub const HTTP_REQUESTS_IN_FLIGHT: &str = "quill_http_requests_in_flight";

    // Quota metrics
    pub const USAGE_TOKENS_TOTAL: &str = "quill_usage_tokens_total";
    pub const QUOTA_GATE_BLOCKS_TOTAL: &str = "quill_quota_gate_blocks_total";
    pub const QUOTA_RESETS_TOTAL: &str = "quill_quota_resets_total";
    pub const USAGE_ALERTS_CREATED_TOTAL: &str = "quill_usage_alerts_created_total";

    // Purchase metrics
    pub const PURCHASES_TOTAL: &str = "quill_purchases_total";
    pub const PURCHASED_TOKENS_TOTAL: &str = "quill_purchased_tokens_total";
    pub const STALE_PURCHASES_CANCELLED_TOTAL: &str = "quill_stale_purchases_cancelled_total";

    // Rate limiting metrics
    pub const RATE_LIMIT_HITS_TOTAL: &str = "quill_rate_limit_hits_total";
}

/// Record an HTTP request.
pub fn record_http_request(method: &str, path: &str, status: u16, duration_secs: f64) {
    let labels = [
        ("method", method.to_string()),
        ("path", sanitize_path(path)),
        ("status", status.to_string()),
    ];

    counter!(names::HTTP_REQUESTS_TOTAL, &labels).increment(1);
    histogram!(names::HTTP_REQUEST_DURATION_SECONDS, &labels).record(duration_secs);
}

/// Record tokens consumed through the ledger.
pub fn record_usage_tokens(feature: &str, tokens: i64) {
    let labels = [("feature", feature.to_string())];
    counter!(names::USAGE_TOKENS_TOTAL, &labels).increment(tokens.max(0) as u64);
}

/// Record a request blocked by the quota gate.
pub fn record_gate_block(path: &str) {
    let labels = [("path", sanitize_path(path))];
    counter!(names::QUOTA_GATE_BLOCKS_TOTAL, &labels).increment(1);
}

/// Record a monthly quota reset.
pub fn record_quota_reset() {
    counter!(names::QUOTA_RESETS_TOTAL).increment(1);
}

/// Record threshold alerts created.
pub fn record_alerts_created(count: u64) {
    if count > 0 {
        counter!(names::USAGE_ALERTS_CREATED_TOTAL).increment(count);
    }
}

/// Record a purchase lifecycle event.
pub fn record_purchase(status: &str) {
    let labels = [("status", status.to_string())];
    counter!(names::PURCHASES_TOTAL, &labels).increment(1);
}

/// Record tokens credited by completed purchases.
pub fn record_purchased_tokens(tokens: i64) {
    counter!(names::PURCHASED_TOKENS_TOTAL).increment(tokens.max(0) as u64);
}

/// Record a stale purchase cancelled by the sweeper.
pub fn record_stale_purchase_cancelled() {
    counter!(names::STALE_PURCHASES_CANCELLED_TOTAL).increment(1);
}

/// Record rate limit hit.
pub fn record_rate_limit_hit(endpoint: &str) {
    let labels = [("endpoint", endpoint.to_string())];
    counter!(names::RATE_LIMIT_HITS_TOTAL, &labels).increment(1);
}

/// Sanitize path for metrics labels (remove IDs, etc.).
fn sanitize_path(path: &str) -> String {
    // Replace UUIDs and numeric IDs with placeholders
    let path =
        regex_lite::Regex::new(r"[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}")
            .unwrap()
            .replace_all(path, ":id");
    let path = regex_lite::Regex::new(r"/[0-9]+(/|$)")
        .unwrap()
        .replace_all(&path, "/:id$1");
    path.to_string()
}

/// Metrics middleware for HTTP requests.
pub async fn metrics_middleware(request: Request<Body>, next: Next) -> Response<Body> {
    let method = request.method().to_string();
    let path = request.uri().path().to_string();
    let start = Instant::now();

    // Increment in-flight counter
    gauge!(names::HTTP_REQUESTS_IN_FLIGHT).increment(1.0);

    let response = next.run(request).await;

    // Decrement in-flight counter
    gauge!(names::HTTP_REQUESTS_IN_FLIGHT).decrement(1.0);

    let status = response.status().as_u16();
    let duration = start.elapsed().as_secs_f64();

    record_http_request(&method, &path, status, duration);

    response
}
