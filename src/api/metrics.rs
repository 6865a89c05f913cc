//! Prometheus metrics: the `/metrics` endpoint and HTTP request tracking.

use axum::{
    body::Body,
    extract::{MatchedPath, State},
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use std::sync::Arc;
use std::time::Instant;

use crate::AppState;

pub const HTTP_REQUESTS_TOTAL: &str = "http_requests_total";
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "http_request_duration_seconds";
pub const MEETING_OPERATIONS_TOTAL: &str = "meeting_operations_total";
pub const NOTIFICATIONS_SENT_TOTAL: &str = "notifications_sent_total";
pub const PAYMENTS_TOTAL: &str = "payments_total";
pub const SESSIONS_UPCOMING: &str = "sessions_upcoming";

/// Install the global Prometheus recorder. Call once at startup.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;

    describe_counter!(HTTP_REQUESTS_TOTAL, "Total number of HTTP requests received");
    describe_histogram!(HTTP_REQUEST_DURATION_SECONDS, "HTTP request duration in seconds");
    describe_counter!(
        MEETING_OPERATIONS_TOTAL,
        "Meeting provider calls by operation (create/update/cancel) and outcome"
    );
    describe_counter!(
        NOTIFICATIONS_SENT_TOTAL,
        "Notification deliveries by channel and outcome"
    );
    describe_counter!(PAYMENTS_TOTAL, "Applied payment transitions by gateway and status");
    describe_gauge!(SESSIONS_UPCOMING, "Scheduled class sessions from today onwards");

    Ok(handle)
}

/// GET /metrics
pub async fn metrics_endpoint(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let today = chrono::Utc::now()
        .with_timezone(&state.config.server.utc_offset())
        .format("%Y-%m-%d")
        .to_string();
    if let Ok(count) = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM class_sessions WHERE status = 'scheduled' AND date >= ?",
    )
    .bind(&today)
    .fetch_one(&state.db)
    .await
    {
        gauge!(SESSIONS_UPCOMING).set(count as f64);
    }

    match state.metrics_handle.as_ref() {
        Some(handle) => (StatusCode::OK, handle.render()),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            "Metrics not initialized".to_string(),
        ),
    }
}

/// Records `http_requests_total` and `http_request_duration_seconds` per matched route
pub async fn metrics_middleware(request: Request<Body>, next: Next) -> Response {
    let start = Instant::now();
    let path = request
        .extensions()
        .get::<MatchedPath>()
        .map(|mp| mp.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());
    let method = request.method().to_string();

    let response = next.run(request).await;

    let status = response.status().as_u16().to_string();
    counter!(HTTP_REQUESTS_TOTAL, "method" => method.clone(), "path" => path.clone(), "status" => status)
        .increment(1);
    histogram!(HTTP_REQUEST_DURATION_SECONDS, "method" => method, "path" => path)
        .record(start.elapsed().as_secs_f64());

    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_names() {
        for name in [HTTP_REQUESTS_TOTAL, MEETING_OPERATIONS_TOTAL, NOTIFICATIONS_SENT_TOTAL, PAYMENTS_TOTAL] {
            assert!(name.ends_with("_total"), "{} should be a counter name", name);
        }
        assert!(HTTP_REQUEST_DURATION_SECONDS.ends_with("_seconds"));
    }
}
