//! Shared HTTP client factory. Two `reqwest::Client`s, built once and shared
//! process-wide, both wired to the same pinning TLS verifier and the same OS-routed dialer.
//!
//! Grounded on the `reqwest::ClientBuilder` usage pattern in `beach-manager`/`beach-cabana`
//! (build one client, share it via `Arc`/state) and on `KyleSebion-mjpeg-digest-auth-proxy`
//! (other_examples) for the "one client shared across a digest-auth proxy" shape.

use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;

use crate::pinning::{PinStore, PinningVerifier};

pub const PROBE_TIMEOUT: Duration = Duration::from_secs(3);
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(300);

/// The two clients the rest of the crate shares: `probe` for device I/O with a 30 s ceiling (the
/// unauth probe further narrows this per-request to [`PROBE_TIMEOUT`]), and `upload` for
/// multipart transfers with a 300 s ceiling.
#[derive(Clone)]
pub struct HttpClients {
    pub probe: Client,
    pub upload: Client,
}

impl HttpClients {
    pub fn build(pin_store: Arc<PinStore>) -> anyhow::Result<Self> {
        let tls_config = tls_client_config(pin_store)?;

        let probe = Client::builder()
            .use_preconfigured_tls(tls_config.clone())
            .timeout(DEFAULT_TIMEOUT)
            .build()?;

        let upload = Client::builder()
            .use_preconfigured_tls(tls_config)
            .timeout(UPLOAD_TIMEOUT)
            .build()?;

        Ok(Self { probe, upload })
    }
}

fn tls_client_config(pin_store: Arc<PinStore>) -> anyhow::Result<rustls::ClientConfig> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(PinningVerifier::new(pin_store)))
        .with_no_client_auth();
    Ok(config)
}
