//! Metrics tracking middleware
//!
//! Tracks request latency, counts, and status codes for Prometheus metrics,
//! plus auth outcomes recorded by the services.
//!
//! Author: hephaex@gmail.com

use axum::{
    extract::{MatchedPath, Request},
    middleware::Next,
    response::Response,
};
use prometheus::{Encoder, HistogramVec, IntCounterVec, TextEncoder};
use std::time::Instant;

lazy_static::lazy_static! {
    pub static ref HTTP_REQUESTS_TOTAL: IntCounterVec = prometheus::register_int_counter_vec!(
        "gatehouse_http_requests_total",
        "HTTP requests by endpoint and status",
        &["method", "endpoint", "status"]
    ).expect("register gatehouse_http_requests_total");

    pub static ref HTTP_REQUEST_DURATION_SECONDS: HistogramVec = prometheus::register_histogram_vec!(
        "gatehouse_http_request_duration_seconds",
        "HTTP request latency",
        &["method", "endpoint"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]
    ).expect("register gatehouse_http_request_duration_seconds");

    pub static ref AUTH_OUTCOMES_TOTAL: IntCounterVec = prometheus::register_int_counter_vec!(
        "gatehouse_auth_outcomes_total",
        "Auth operations by outcome",
        &["operation", "outcome"]
    ).expect("register gatehouse_auth_outcomes_total");
}

/// Count one auth operation (`login`, `refresh`, `register`, `logout`, `validate`)
pub fn record_auth_outcome(operation: &str, outcome: &str) {
    AUTH_OUTCOMES_TOTAL
        .with_label_values(&[operation, outcome])
        .inc();
}

/// Label for requests that matched no route
const UNMATCHED_ENDPOINT: &str = "unmatched";

/// Metrics tracking middleware
///
/// Records:
/// - Request count per endpoint
/// - Request latency distribution
/// - Response status codes
///
/// The endpoint label is the matched route template, so path parameters
/// (user ids, invitation tokens) never reach a label and unknown paths
/// share one series.
pub async fn metrics_middleware(request: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = request.method().to_string();
    let endpoint = request
        .extensions()
        .get::<MatchedPath>()
        .map(|path| path.as_str().to_string())
        .unwrap_or_else(|| UNMATCHED_ENDPOINT.to_string());

    let response = next.run(request).await;

    let status = response.status().as_u16().to_string();
    HTTP_REQUESTS_TOTAL
        .with_label_values(&[&method, &endpoint, &status])
        .inc();
    HTTP_REQUEST_DURATION_SECONDS
        .with_label_values(&[&method, &endpoint])
        .observe(start.elapsed().as_secs_f64());

    response
}

/// Prometheus text exposition of the default registry
pub fn render() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&prometheus::gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}
