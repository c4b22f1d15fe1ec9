use std::sync::OnceLock;

use axum::body::Body;
use axum::http::{Response, StatusCode, header};

use crate::headers;
use crate::http::RequestInfo;
use crate::metrics;

/// Remote alerting is only armed when a Sentry DSN was present at startup;
/// without it every report degrades to a structured log line.
static REMOTE_REPORTING: OnceLock<bool> = OnceLock::new();

pub fn init_reporting(sentry_dsn: Option<&str>) {
    let enabled = sentry_dsn.map(|dsn| !dsn.trim().is_empty()).unwrap_or(false);
    let _ = REMOTE_REPORTING.set(enabled);
    if enabled {
        tracing::info!("workhorse.error_reporting_enabled");
    }
}

fn remote_reporting() -> bool {
    *REMOTE_REPORTING.get().unwrap_or(&false)
}

pub fn fail_500(info: &RequestInfo, what: &str, err: &dyn std::fmt::Display) -> Response<Body> {
    report_error(info, what, err);
    error_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
}

pub fn service_unavailable(
    info: &RequestInfo,
    what: &str,
    err: &dyn std::fmt::Display,
) -> Response<Body> {
    report_error(info, what, err);
    error_response(StatusCode::SERVICE_UNAVAILABLE, "Service Unavailable")
}

pub fn too_many_requests(
    info: &RequestInfo,
    what: &str,
    err: &dyn std::fmt::Display,
) -> Response<Body> {
    report_error(info, what, err);
    error_response(StatusCode::TOO_MANY_REQUESTS, "Too Many Requests")
}

pub fn not_found() -> Response<Body> {
    error_response(StatusCode::NOT_FOUND, "Not Found")
}

pub fn forbidden() -> Response<Body> {
    error_response(StatusCode::FORBIDDEN, "Forbidden")
}

/// Counts and logs an error without touching the response. Used once body
/// bytes may already have reached the client; hyper aborts the connection
/// when the body stream fails, which is the mid-stream error contract.
pub fn report_error(info: &RequestInfo, what: &str, err: &dyn std::fmt::Display) {
    metrics::observe_error(what, remote_reporting());
    tracing::error!(
        correlation_id = %info.id,
        method = %info.method,
        uri = %info.uri,
        error = %err,
        reported = remote_reporting(),
        "workhorse.{}", what
    );
}

/// Known-benign failures stay out of the alert channel entirely.
pub fn log_benign(info: &RequestInfo, what: &str, err: &dyn std::fmt::Display) {
    tracing::debug!(
        correlation_id = %info.id,
        method = %info.method,
        uri = %info.uri,
        error = %err,
        "workhorse.{}", what
    );
}

fn error_response(status: StatusCode, message: &'static str) -> Response<Body> {
    let mut response = Response::new(Body::from(message));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    headers::set_no_cache_headers(response.headers_mut());
    response
}
