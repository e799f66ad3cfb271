//! Proxy Service HTTP/WebSocket server (C6, §4.6) — the loopback-only axum app that fronts the
//! auth engine, the multipart uploader, and the scan orchestrator.
//!
//! Grounded on `beach-road/src/main.rs`'s router assembly (`Router::new().route(...).layer(...)`,
//! `TraceLayer::new_for_http()`) and `websocket.rs`'s `WebSocketUpgrade` handler shape, adapted
//! from per-session signaling fan-out to per-scan progress fan-out.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::http::{HeaderValue, Request, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use tower::ServiceBuilder;
use tower_http::request_id::{MakeRequestId, PropagateRequestIdLayer, RequestId, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn, Span};

use crate::auth::{self, ProxyRequest, ProxyResponse};
use crate::http_client::HttpClients;
use crate::multipart::{self, MultipartField};
use crate::origin::origin_gate;
use crate::scan::{ScanRegistry, ScanRequest};

/// Everything a route handler needs; cheap to clone (every field is an `Arc`/`Client` handle).
#[derive(Clone)]
pub struct AppState {
    pub clients: HttpClients,
    pub scans: ScanRegistry,
    pub scan_workers: usize,
}

/// Generates a monotonically increasing request id shared across every handler invocation —
/// the reference server's per-request span convention, without pulling in a UUID generator this
/// crate has no other use for.
#[derive(Clone, Default)]
struct SequentialRequestId(Arc<AtomicU64>);

impl MakeRequestId for SequentialRequestId {
    fn make_request_id<B>(&mut self, _request: &Request<B>) -> Option<RequestId> {
        let id = self.0.fetch_add(1, Ordering::Relaxed);
        HeaderValue::from_str(&id.to_string())
            .ok()
            .map(RequestId::new)
    }
}

/// Builds the tracing span for one request, carrying method/path/request-id (§10 ambient
/// logging: "every request handler is wrapped in a tracing span carrying method/path/request-id").
fn request_span<B>(request: &Request<B>) -> Span {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("-");
    tracing::info_span!(
        "http_request",
        method = %request.method(),
        path = %request.uri().path(),
        request_id = %request_id,
    )
}

/// Builds the router: CORS/origin gate and request tracing wrap every route (§4.6, §4.9). The
/// request-id layer runs outermost so both the trace span and the response carry it; origin
/// gating runs inside that so even rejected requests are spanned and tagged.
pub fn build_router(state: AppState) -> Router {
    let tracing_stack = ServiceBuilder::new()
        .layer(SetRequestIdLayer::x_request_id(SequentialRequestId::default()))
        .layer(TraceLayer::new_for_http().make_span_with(request_span))
        .layer(PropagateRequestIdLayer::x_request_id());

    Router::new()
        .route("/health", get(health))
        .route("/proxy", post(proxy))
        .route("/upload-acap", post(upload_acap))
        .route("/upload-license", post(upload_license))
        .route("/scan-network", post(scan_network))
        .route("/scan-results", get(scan_results))
        .layer(axum::middleware::from_fn(origin_gate))
        .layer(tracing_stack)
        .with_state(state)
}

/// Binds and serves the router on loopback only (§4.6: the service never listens beyond
/// `127.0.0.1`, since it is meant to be reached by the browser extension and the local Host).
pub async fn serve(port: u16, state: AppState) -> anyhow::Result<()> {
    let app = build_router(state);
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "proxy service listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        sigterm.recv().await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received, draining connections");
}

#[derive(Serialize)]
struct HealthBody {
    status: &'static str,
}

/// `GET /health` — non-blocking, constant-time (§4.6).
async fn health() -> Json<HealthBody> {
    Json(HealthBody { status: "ok" })
}

/// `POST /proxy` — runs a single request through the auth engine and returns the normalized
/// response. A resolved upstream status (even a non-2xx one) is forwarded as HTTP 200 with that
/// status embedded in the body; a transport failure or protocol error (`NotResponding`,
/// `MalformedChallenge` — no `status`) surfaces as HTTP 500 per §7.
async fn proxy(State(state): State<AppState>, Json(req): Json<ProxyRequest>) -> Response {
    let response = auth::execute(&state.clients, &req).await;
    let http_status = if response.status.is_some() {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    (http_status, Json(response)).into_response()
}

#[derive(Deserialize)]
struct UploadAcapRequest {
    download_url: String,
    camera_url: String,
    username: String,
    password: String,
}

#[derive(Serialize)]
struct UploadOutcome {
    status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// `POST /upload-acap` — fetches the package bytes from `download_url`, then pushes them to the
/// camera's ACAP upload endpoint via the Digest-authenticated multipart flow (§4.8).
async fn upload_acap(
    State(state): State<AppState>,
    Json(req): Json<UploadAcapRequest>,
) -> impl IntoResponse {
    let package = match state.clients.upload.get(&req.download_url).send().await {
        Ok(resp) => match resp.bytes().await {
            Ok(bytes) => bytes,
            Err(e) => return upload_error(format!("failed to read package bytes: {e}")),
        },
        Err(e) => return upload_error(format!("failed to download package: {e}")),
    };

    let field = MultipartField::acap_package(package);
    match multipart::upload(
        &state.clients,
        &req.camera_url,
        &req.username,
        &req.password,
        field,
    )
    .await
    {
        Ok(response) => {
            let status = response.status().as_u16();
            Json(UploadOutcome { status: Some(status), error: None }).into_response()
        }
        Err(err) => {
            warn!(error = %err, "acap upload failed");
            upload_error(err.to_string())
        }
    }
}

/// A failed upload (transport failure, malformed challenge, or a rejected license per §8 S7)
/// reports HTTP 400 with the failure text as `error`.
fn upload_error(message: String) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(UploadOutcome { status: None, error: Some(message) }),
    )
        .into_response()
}

#[derive(Deserialize)]
struct UploadLicenseRequest {
    license_xml: String,
    camera_url: String,
    username: String,
    password: String,
}

/// `POST /upload-license` — same transport as ACAP upload, but the response body is inspected for
/// the `Error: <n>` convention (§4.8, S7).
async fn upload_license(
    State(state): State<AppState>,
    Json(req): Json<UploadLicenseRequest>,
) -> impl IntoResponse {
    let field = MultipartField::license(req.license_xml);
    let response = match multipart::upload(
        &state.clients,
        &req.camera_url,
        &req.username,
        &req.password,
        field,
    )
    .await
    {
        Ok(r) => r,
        Err(err) => {
            warn!(error = %err, "license upload failed");
            return upload_error(err.to_string());
        }
    };

    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    match multipart::license_outcome(status, &body) {
        Ok(()) => Json(UploadOutcome { status: Some(status), error: None }).into_response(),
        Err(err) => upload_error(err.to_string()),
    }
}

/// `POST /scan-network` — accepts the scan and returns `202` immediately; the worker pool runs
/// detached (§4.7).
async fn scan_network(State(state): State<AppState>, Json(req): Json<ScanRequest>) -> Response {
    match state.scans.start(state.clients.clone(), state.scan_workers, req) {
        Ok(accepted) => (StatusCode::ACCEPTED, Json(accepted)).into_response(),
        Err(err) => (StatusCode::BAD_REQUEST, Json(ErrorBody { error: err.to_string() })).into_response(),
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Deserialize)]
struct ScanResultsQuery {
    scan_id: String,
}

/// `GET /scan-results?scan_id=...` — upgrades to a WebSocket and forwards the scan's broadcast
/// progress events as JSON text frames until `is_complete` (§4.7.1).
async fn scan_results(
    State(state): State<AppState>,
    Query(query): Query<ScanResultsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(record) = state.scans.get(&query.scan_id) else {
        return (
            StatusCode::NOT_FOUND,
            Json(ErrorBody { error: format!("unknown scan id: {}", query.scan_id) }),
        )
            .into_response();
    };

    ws.on_upgrade(move |socket| stream_scan_progress(socket, record))
}

async fn stream_scan_progress(mut socket: WebSocket, record: Arc<crate::scan::ScanRecord>) {
    let mut events = record.subscribe();

    loop {
        match events.recv().await {
            Ok(event) => {
                let is_complete = event.is_complete;
                let Ok(json) = serde_json::to_string(&event) else {
                    continue;
                };
                if socket.send(Message::Text(json)).await.is_err() {
                    debug!(scan_id = %record.scan_id, "scan-results socket closed by client");
                    break;
                }
                if is_complete {
                    break;
                }
            }
            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(scan_id = %record.scan_id, skipped, "scan-results subscriber lagged, dropping events");
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        }
    }

    let _ = socket.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tower::ServiceExt;

    fn test_state() -> (tempfile::TempDir, AppState) {
        let dir = tempfile::tempdir().unwrap();
        let pin_store = Arc::new(crate::pinning::PinStore::load(dir.path().join("pins.json")));
        let clients = HttpClients::build(pin_store).expect("client build");
        (
            dir,
            AppState {
                clients,
                scans: ScanRegistry::new(),
                scan_workers: 4,
            },
        )
    }

    #[tokio::test]
    async fn health_returns_ok() {
        let (_dir, state) = test_state();
        let app = build_router(state);
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/health")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn scan_results_404s_for_unknown_scan_id() {
        let (_dir, state) = test_state();
        let app = build_router(state);
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/scan-results?scan_id=not-a-real-scan")
                    .header("sec-websocket-version", "13")
                    .header("sec-websocket-key", "dGhlIHNhbXBsZSBub25jZQ==")
                    .header("connection", "upgrade")
                    .header("upgrade", "websocket")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn health_response_carries_a_request_id_header() {
        let (_dir, state) = test_state();
        let app = build_router(state);
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/health")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert!(response.headers().contains_key("x-request-id"));
    }

    #[tokio::test]
    async fn proxy_surfaces_not_responding_as_http_500() {
        let (_dir, state) = test_state();
        let app = build_router(state);
        let body = serde_json::to_vec(&serde_json::json!({
            "url": "http://127.0.0.1:1/nope",
            "method": "GET",
            "username": "",
            "password": "",
        }))
        .unwrap();
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/proxy")
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn scan_network_rejects_empty_target_list() {
        let (_dir, state) = test_state();
        let app = build_router(state);
        let body = serde_json::to_vec(&serde_json::json!({"ips": [], "username": "", "password": ""})).unwrap();
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/scan-network")
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
