//! Prometheus metrics for statebridge.
//!
//! Installs a global Prometheus recorder using `metrics-exporter-prometheus`,
//! defines metric name constants, provides an axum middleware for HTTP RED
//! metrics, and exposes the `/metrics` endpoint handler.

use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Instant;

// -- Metric name constants ----------------------------------------------------

/// Total HTTP requests (counter). Labels: method, path, status.
pub const HTTP_REQUESTS_TOTAL: &str = "statebridge_http_requests_total";

/// HTTP request duration in seconds (histogram). Labels: method, path.
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "statebridge_http_request_duration_seconds";

/// State and lock operations (counter). Labels: operation, status.
pub const STATE_OPERATIONS_TOTAL: &str = "statebridge_state_operations_total";

/// Rejected S3 requests (counter). Labels: reason.
pub const AUTH_FAILURES_TOTAL: &str = "statebridge_auth_failures_total";

/// Credentials issued by the exchange endpoint (counter).
pub const CREDENTIALS_ISSUED_TOTAL: &str = "statebridge_credentials_issued_total";

/// Dependency-graph refreshes (counter). Labels: outcome.
pub const GRAPH_REFRESHES_TOTAL: &str = "statebridge_graph_refresh_total";

/// Bytes of state accepted by PUT (counter).
pub const STATE_BYTES_WRITTEN_TOTAL: &str = "statebridge_state_bytes_written_total";

// -- Global recorder installation ---------------------------------------------

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the global Prometheus recorder. Idempotent.
pub fn init_metrics() -> anyhow::Result<&'static PrometheusHandle> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle);
    }
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("failed to install Prometheus recorder: {e}"))?;
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle))
}

/// Register metric descriptions with the global recorder. Call once after
/// `init_metrics()`.
pub fn describe_metrics() {
    describe_counter!(HTTP_REQUESTS_TOTAL, "Total HTTP requests");
    describe_histogram!(
        HTTP_REQUEST_DURATION_SECONDS,
        "HTTP request duration in seconds"
    );
    describe_counter!(STATE_OPERATIONS_TOTAL, "State and lock operations by outcome");
    describe_counter!(AUTH_FAILURES_TOTAL, "Rejected S3 requests by reason");
    describe_counter!(CREDENTIALS_ISSUED_TOTAL, "Credentials issued");
    describe_counter!(GRAPH_REFRESHES_TOTAL, "Dependency graph refreshes by outcome");
    describe_counter!(STATE_BYTES_WRITTEN_TOTAL, "Bytes of state written");
}

/// Count one state or lock operation.
pub fn record_state_op(operation: &'static str, status: &'static str) {
    counter!(STATE_OPERATIONS_TOTAL, "operation" => operation, "status" => status).increment(1);
}

pub fn record_auth_failure(reason: &'static str) {
    counter!(AUTH_FAILURES_TOTAL, "reason" => reason).increment(1);
}

pub fn record_graph_refresh(outcome: &'static str) {
    counter!(GRAPH_REFRESHES_TOTAL, "outcome" => outcome).increment(1);
}

// -- Metrics middleware -------------------------------------------------------

/// Axum middleware that records HTTP RED metrics for every request.
///
/// `/metrics` itself is not instrumented.
pub async fn metrics_middleware(
    req: Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> Response {
    if req.uri().path() == "/metrics" {
        return next.run(req).await;
    }
    let method = req.method().to_string();
    let path = normalize_path(req.uri().path());

    let start = Instant::now();
    let response = next.run(req).await;
    let duration = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    counter!(HTTP_REQUESTS_TOTAL, "method" => method.clone(), "path" => path, "status" => status)
        .increment(1);
    histogram!(HTTP_REQUEST_DURATION_SECONDS, "method" => method, "path" => path).record(duration);

    response
}

// -- Path normalization -------------------------------------------------------

/// Map a request path to a low-cardinality route label.
///
/// - `/health` -> `/health`
/// - `/s3/tfstate` -> `/s3/{bucket}`
/// - `/s3/tfstate/org/app/terraform.tfstate` -> `/s3/{bucket}/{unit}/state`
/// - `/s3/tfstate/org/app/terraform.tfstate.tflock` -> `/s3/{bucket}/{unit}/lock`
fn normalize_path(path: &str) -> &'static str {
    match path {
        "/" => "/",
        "/health" => "/health",
        "/metrics" => "/metrics",
        "/openapi.json" => "/openapi.json",
        "/v1/auth/issue-s3-creds" => "/v1/auth/issue-s3-creds",
        _ => {
            let Some(rest) = path.strip_prefix("/s3/") else {
                return "other";
            };
            let rest = rest.trim_end_matches('/');
            if !rest.contains('/') {
                "/s3/{bucket}"
            } else if rest.ends_with(".lock") || rest.ends_with(".tflock") {
                "/s3/{bucket}/{unit}/lock"
            } else if rest.ends_with("/terraform.tfstate") {
                "/s3/{bucket}/{unit}/state"
            } else {
                "/s3/{bucket}/{key}"
            }
        }
    }
}

// -- Metrics endpoint handler -------------------------------------------------

/// `GET /metrics` -- Render Prometheus exposition format text.
pub async fn metrics_handler() -> Response {
    match PROMETHEUS_HANDLE.get() {
        Some(handle) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::SERVICE_UNAVAILABLE.into_response(),
    }
}

// -- Tests --------------------------------------------------------------------
