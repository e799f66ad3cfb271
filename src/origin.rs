//! Origin/CORS gate — whitelist plus `chrome-extension://` pattern, 403 on violation.
//!
//! Grounded on `beach-road/src/main.rs`'s `CorsLayer`, tightened here to an explicit allow-list
//! `axum::middleware::from_fn` layer since `beach-road` uses `CorsLayer::permissive()` and this
//! crate needs a real whitelist with credentialed, non-wildcard origins.

use axum::extract::Request;
use axum::http::{HeaderValue, Method, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::warn;

/// Fixed whitelist of production/local-dev origins.
const ALLOWED_ORIGINS: &[&str] = &[
    "https://app.anava.ai",
    "https://console.anava.ai",
    "http://localhost:3000",
    "http://localhost:5173",
];

const EXTENSION_ORIGIN_PREFIX: &str = "chrome-extension://";

/// Whether `origin` matches the fixed whitelist or the `chrome-extension://` pattern.
pub fn is_allowed_origin(origin: &str) -> bool {
    ALLOWED_ORIGINS.contains(&origin) || origin.starts_with(EXTENSION_ORIGIN_PREFIX)
}

/// Axum middleware enforcing the origin whitelist: empty `Origin` is permitted (direct loopback access);
/// whitelisted origins get echoed-back CORS headers and credentials enabled; everything else is
/// 403'd before the handler runs. `OPTIONS` on an allowed origin short-circuits with just the CORS
/// headers, never reaching the handler.
pub async fn origin_gate(req: Request, next: Next) -> Response {
    let origin = req
        .headers()
        .get(axum::http::header::ORIGIN)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let Some(origin) = origin.filter(|o| !o.is_empty()) else {
        return next.run(req).await;
    };

    if !is_allowed_origin(&origin) {
        warn!(origin = %origin, "rejecting request from non-allowed origin");
        return StatusCode::FORBIDDEN.into_response();
    }

    let is_preflight = req.method() == Method::OPTIONS;
    let mut response = if is_preflight {
        StatusCode::OK.into_response()
    } else {
        next.run(req).await
    };

    apply_cors_headers(response.headers_mut(), &origin);
    response
}

fn apply_cors_headers(headers: &mut axum::http::HeaderMap, origin: &str) {
    if let Ok(value) = HeaderValue::from_str(origin) {
        headers.insert(axum::http::header::ACCESS_CONTROL_ALLOW_ORIGIN, value);
    }
    headers.insert(
        axum::http::header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("POST, GET, OPTIONS"),
    );
    headers.insert(
        axum::http::header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type"),
    );
    headers.insert(
        axum::http::header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
        HeaderValue::from_static("true"),
    );
}
