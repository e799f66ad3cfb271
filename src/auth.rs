//! Auth engine — the core request path. Probes unauthenticated first, then falls back to
//! protocol-ordered Basic/Digest.
//!
//! Built from RFC 2617, reusing `beach-manager`/`beach-cabana`'s "build a `reqwest::Client`, send,
//! await" idiom and the same per-subsystem `thiserror` enum convention as `entitlement.rs`'s
//! `EntitlementError`.

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use reqwest::header::WWW_AUTHENTICATE;
use reqwest::{Method, Response, Url};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::digest::{DigestChallenge, DigestResponse};
use crate::error::AuthError;
use crate::http_client::{HttpClients, PROBE_TIMEOUT};
use crate::sanitize::Masked;

pub const USER_AGENT: &str = concat!("anava-connector/", env!("CARGO_PKG_VERSION"));

/// A single camera request.
#[derive(Debug, Clone, Deserialize)]
pub struct ProxyRequest {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub body: Option<Value>,
}

fn default_method() -> String {
    "GET".to_string()
}

/// The normalized reply.
#[derive(Debug, Clone, Serialize)]
pub struct ProxyResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProxyResponse {
    fn transport_failure(error: impl ToString) -> Self {
        Self {
            status: None,
            data: None,
            error: Some(error.to_string()),
        }
    }
}

/// Runs the full probe-then-authenticate flow for one request, never returning an `Err` to the
/// caller — transport failures and protocol errors are folded into [`ProxyResponse`] so HTTP
/// handlers can decide the wire-level status code from `response.status.is_some()`.
pub async fn execute(clients: &HttpClients, req: &ProxyRequest) -> ProxyResponse {
    debug!(
        url = %req.url,
        method = %req.method,
        username = %Masked(&req.username),
        "executing proxy request"
    );
    match run(clients, req).await {
        Ok(response) => response,
        Err(AuthError::NotResponding(detail)) => {
            ProxyResponse::transport_failure(format!("device not responding: {detail}"))
        }
        Err(err) => ProxyResponse::transport_failure(err),
    }
}

async fn run(clients: &HttpClients, req: &ProxyRequest) -> Result<ProxyResponse, AuthError> {
    let url = Url::parse(&req.url).map_err(|e| AuthError::InvalidUrl(e.to_string()))?;
    let method = req
        .method
        .parse::<Method>()
        .map_err(|e| AuthError::InvalidUrl(format!("invalid method {}: {e}", req.method)))?;
    let https = url.scheme() == "https";

    let probe = send_plain(clients, &method, &url, req.body.as_ref(), Some(PROBE_TIMEOUT)).await;
    let probe = match probe {
        Ok(resp) => resp,
        Err(e) if is_not_responding(&e) => {
            return Err(AuthError::NotResponding(e.to_string()));
        }
        Err(e) => return Err(AuthError::Transport(e)),
    };

    if probe.status().as_u16() == 200 {
        return Ok(to_proxy_response(probe).await);
    }
    if probe.status().as_u16() != 401 {
        return Ok(to_proxy_response(probe).await);
    }

    let challenge_header = probe
        .headers()
        .get(WWW_AUTHENTICATE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let final_response = if https {
        let basic = send_basic(clients, &method, &url, req).await?;
        if basic.status().as_u16() == 200 {
            basic
        } else {
            send_digest(clients, &method, &url, req, challenge_header.as_deref()).await?
        }
    } else {
        let digest = send_digest(clients, &method, &url, req, challenge_header.as_deref()).await?;
        if digest.status().as_u16() == 200 {
            digest
        } else {
            send_basic(clients, &method, &url, req).await?
        }
    };

    Ok(to_proxy_response(final_response).await)
}

fn is_not_responding(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

async fn send_plain(
    clients: &HttpClients,
    method: &Method,
    url: &Url,
    body: Option<&Value>,
    timeout: Option<std::time::Duration>,
) -> Result<Response, reqwest::Error> {
    let mut builder = clients
        .probe
        .request(method.clone(), url.clone())
        .header("User-Agent", USER_AGENT);
    if let Some(t) = timeout {
        builder = builder.timeout(t);
    }
    if let Some(body) = body {
        builder = builder.header("Content-Type", "application/json").json(body);
    }
    builder.send().await
}

async fn send_basic(
    clients: &HttpClients,
    method: &Method,
    url: &Url,
    req: &ProxyRequest,
) -> Result<Response, AuthError> {
    let credentials = BASE64_STANDARD.encode(format!("{}:{}", req.username, req.password));
    let mut builder = clients
        .probe
        .request(method.clone(), url.clone())
        .header("User-Agent", USER_AGENT)
        .header("Authorization", format!("Basic {credentials}"));
    if let Some(body) = req.body.as_ref() {
        builder = builder.header("Content-Type", "application/json").json(body);
    }
    builder.send().await.map_err(AuthError::Transport)
}

async fn send_digest(
    clients: &HttpClients,
    method: &Method,
    url: &Url,
    req: &ProxyRequest,
    known_challenge: Option<&str>,
) -> Result<Response, AuthError> {
    let challenge_header = match known_challenge {
        Some(header) => header.to_string(),
        None => {
            // No prior 401 to reuse (e.g. called outside the probe-first flow): do the first,
            // unauthenticated leg ourselves.
            let first = send_plain(clients, method, url, req.body.as_ref(), None)
                .await
                .map_err(AuthError::Transport)?;
            if first.status().as_u16() != 401 {
                return Ok(first);
            }
            first
                .headers()
                .get(WWW_AUTHENTICATE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
                .ok_or_else(|| {
                    AuthError::MalformedChallenge("401 response carried no WWW-Authenticate".into())
                })?
        }
    };

    let challenge = DigestChallenge::parse(&challenge_header)?;
    let uri = uri_of(url);
    let computed = DigestResponse::compute(&challenge, &req.username, &req.password, method.as_str(), &uri);

    let mut builder = clients
        .probe
        .request(method.clone(), url.clone())
        .header("User-Agent", USER_AGENT)
        .header("Authorization", computed.to_header_value());
    if let Some(body) = req.body.as_ref() {
        builder = builder.header("Content-Type", "application/json").json(body);
    }
    builder.send().await.map_err(AuthError::Transport)
}

/// Path + query of `url`, with scheme and authority stripped — the `uri` Digest uses.
pub fn uri_of(url: &Url) -> String {
    match url.query() {
        Some(q) => format!("{}?{q}", url.path()),
        None => url.path().to_string(),
    }
}

/// Converts an upstream HTTP response into the wire-level `{status, data, error}` shape.
pub async fn to_proxy_response(resp: Response) -> ProxyResponse {
    let status = resp.status();
    let status_num = status.as_u16();
    let reason = status.canonical_reason().unwrap_or("Unknown").to_string();
    let body_text = resp.text().await.unwrap_or_default();

    let data = match serde_json::from_str::<Value>(&body_text) {
        Ok(v) if v.is_object() || v.is_array() => v,
        _ => json!({ "text": body_text }),
    };

    let error = if status_num >= 400 {
        Some(synthesize_error(&data, &body_text, status_num, &reason))
    } else {
        None
    };

    if let Some(err) = &error {
        warn!(status = status_num, error = %err, "upstream returned an error status");
    }

    ProxyResponse {
        status: Some(status_num),
        data: Some(data),
        error,
    }
}

fn synthesize_error(data: &Value, raw_text: &str, status: u16, reason: &str) -> String {
    if let Some(err) = data.get("error").and_then(Value::as_str) {
        return err.to_string();
    }
    if let Some(text) = data.get("text").and_then(Value::as_str) {
        if !text.is_empty() {
            return text.to_string();
        }
    }
    if !raw_text.is_empty() {
        return raw_text.to_string();
    }
    format!("HTTP {status}: {reason}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uri_of_strips_scheme_and_authority() {
        let url = Url::parse("https://192.168.1.5/axis-cgi/basicdeviceinfo.cgi?x=1").unwrap();
        assert_eq!(uri_of(&url), "/axis-cgi/basicdeviceinfo.cgi?x=1");
    }

    #[test]
    fn uri_of_without_query() {
        let url = Url::parse("http://192.168.1.5/path").unwrap();
        assert_eq!(uri_of(&url), "/path");
    }

    #[test]
    fn synthesizes_error_from_status_when_body_is_empty() {
        let data = json!({"text": ""});
        assert_eq!(synthesize_error(&data, "", 500, "Internal Server Error"), "HTTP 500: Internal Server Error");
    }

    #[test]
    fn prefers_explicit_error_field() {
        let data = json!({"error": "bad credentials"});
        assert_eq!(synthesize_error(&data, "{\"error\":\"bad credentials\"}", 401, "Unauthorized"), "bad credentials");
    }
}
