//! Scan orchestrator (C7, §4.7) — CIDR expansion, bounded-concurrency worker pool, per-scan
//! lifecycle, WebSocket progress broadcast, and the adaptive batching variant used by
//! single-target call sites.
//!
//! Grounded on `beach-road/src/websocket.rs`'s `DashMap<String, ...>` registry and its background
//! `tokio::spawn` heartbeat-monitor loop (here: the per-scan GC timer). The bounded-concurrency
//! worker pool itself uses `futures_util::stream::StreamExt::buffer_unordered`, the same
//! "N concurrent tasks over an iterator" idiom as the `Semaphore`-gated pool in
//! `CambrianTech-continuum`'s `worker_pool.rs`.

use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use futures_util::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::info;

use crate::auth::{self, ProxyRequest};
use crate::device::{identity_probe_body, CameraDescriptor, DeviceProperties};
use crate::error::ScanError;
use crate::http_client::HttpClients;

pub const DEFAULT_WORKERS: usize = 50;
const PROGRESS_CHANNEL_CAPACITY: usize = 100;
const DRAIN_WINDOW: Duration = Duration::from_secs(2);
const GC_DELAY: Duration = Duration::from_secs(60);

/// `{ips, cidr, username, password}` — the `/scan-network` request body (§4.7).
#[derive(Debug, Clone, Deserialize)]
pub struct ScanRequest {
    #[serde(default)]
    pub ips: Vec<String>,
    #[serde(default)]
    pub cidr: Option<String>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

/// The `202 Accepted` payload returned immediately on scan start.
#[derive(Debug, Clone, Serialize)]
pub struct ScanAccepted {
    pub scan_id: String,
    pub total_ips: usize,
    pub status: &'static str,
}

/// One progress update (§3 Scan progress event).
#[derive(Debug, Clone, Serialize)]
pub struct ScanEvent {
    pub scan_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub camera: Option<CameraDescriptor>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub scanned: usize,
    pub total: usize,
    pub cameras_found: usize,
    pub percent: u8,
    pub is_complete: bool,
}

/// A scan's live state (§3 Scan). Owned exclusively by its orchestrator task; the registry holds
/// a shared `Arc` so HTTP handlers can read counters and subscribe to `events` without touching
/// the orchestrator.
pub struct ScanRecord {
    pub scan_id: String,
    pub total: usize,
    pub scanned: AtomicUsize,
    pub cameras_found: AtomicUsize,
    pub started_at: Instant,
    pub events: broadcast::Sender<ScanEvent>,
}

impl ScanRecord {
    /// A subscriber joining now sees only events emitted after this call — no snapshot replay
    /// (§4.7.1, §9 open question 2).
    pub fn subscribe(&self) -> broadcast::Receiver<ScanEvent> {
        self.events.subscribe()
    }
}

/// The active-scans registry: single-writer map, many readers (§5).
#[derive(Clone)]
pub struct ScanRegistry {
    scans: Arc<DashMap<String, Arc<ScanRecord>>>,
}

impl Default for ScanRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ScanRegistry {
    pub fn new() -> Self {
        Self {
            scans: Arc::new(DashMap::new()),
        }
    }

    pub fn get(&self, scan_id: &str) -> Option<Arc<ScanRecord>> {
        self.scans.get(scan_id).map(|entry| entry.clone())
    }

    /// Accepts a scan (§4.7 step 1) and detaches the worker pool to run in the background.
    pub fn start(
        &self,
        clients: HttpClients,
        workers: usize,
        req: ScanRequest,
    ) -> Result<ScanAccepted, ScanError> {
        let ips = resolve_targets(&req)?;
        let total = ips.len();
        let scan_id = format!("scan_{}", now_nanos());

        let (events, _unused_receiver) = broadcast::channel(PROGRESS_CHANNEL_CAPACITY);
        let record = Arc::new(ScanRecord {
            scan_id: scan_id.clone(),
            total,
            scanned: AtomicUsize::new(0),
            cameras_found: AtomicUsize::new(0),
            started_at: Instant::now(),
            events,
        });
        self.scans.insert(scan_id.clone(), record.clone());

        let registry = self.clone();
        let username = req.username.clone();
        let password = req.password.clone();
        tokio::spawn(async move {
            run_scan(record, clients, workers.max(1), ips, username, password, registry).await;
        });

        Ok(ScanAccepted {
            scan_id,
            total_ips: total,
            status: "scanning",
        })
    }
}

fn resolve_targets(req: &ScanRequest) -> Result<Vec<String>, ScanError> {
    if !req.ips.is_empty() {
        return Ok(req.ips.clone());
    }
    if let Some(cidr) = &req.cidr {
        return expand_cidr(cidr);
    }
    Err(ScanError::EmptyTargets)
}

fn now_nanos() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0)
}

async fn run_scan(
    record: Arc<ScanRecord>,
    clients: HttpClients,
    workers: usize,
    ips: Vec<String>,
    username: String,
    password: String,
    registry: ScanRegistry,
) {
    let total = record.total;

    let probes = stream::iter(ips).map(|ip| {
        let clients = clients.clone();
        let username = username.clone();
        let password = password.clone();
        async move { probe_ip(&clients, ip, &username, &password).await }
    });
    let mut probes = Box::pin(probes.buffer_unordered(workers));

    while let Some((ip, camera, error)) = probes.next().await {
        let scanned = record.scanned.fetch_add(1, Ordering::SeqCst) + 1;
        if camera.is_some() {
            record.cameras_found.fetch_add(1, Ordering::SeqCst);
        }
        let cameras_found = record.cameras_found.load(Ordering::SeqCst);
        let percent = percent_complete(scanned, total);

        // Progress is advisory: if there are no subscribers (or a slow one falls behind the
        // broadcast channel's capacity), the send/lag is silently ignored.
        let _ = record.events.send(ScanEvent {
            scan_id: record.scan_id.clone(),
            ip: Some(ip),
            camera,
            error,
            scanned,
            total,
            cameras_found,
            percent,
            is_complete: false,
        });
    }

    let cameras_found = record.cameras_found.load(Ordering::SeqCst);
    let _ = record.events.send(ScanEvent {
        scan_id: record.scan_id.clone(),
        ip: None,
        camera: None,
        error: None,
        scanned: total,
        total,
        cameras_found,
        percent: 100,
        is_complete: true,
    });

    info!(
        scan_id = %record.scan_id,
        cameras_found,
        elapsed_ms = record.started_at.elapsed().as_millis() as u64,
        "scan complete"
    );

    tokio::time::sleep(DRAIN_WINDOW).await;

    let scan_id = record.scan_id.clone();
    tokio::spawn(async move {
        tokio::time::sleep(GC_DELAY).await;
        registry.scans.remove(&scan_id);
    });
}

fn percent_complete(scanned: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    ((scanned as f64 / total as f64) * 100.0).round().min(100.0) as u8
}

/// Probes a single candidate IP with the identity request, classifying the result as a camera
/// hit, a non-camera response, or an error (§4.7 step 2).
async fn probe_ip(
    clients: &HttpClients,
    ip: String,
    username: &str,
    password: &str,
) -> (String, Option<CameraDescriptor>, Option<String>) {
    let req = ProxyRequest {
        url: format!("https://{ip}/axis-cgi/basicdeviceinfo.cgi"),
        method: "POST".to_string(),
        username: username.to_string(),
        password: password.to_string(),
        body: Some(identity_probe_body()),
    };
    let response = auth::execute(clients, &req).await;

    match response.status {
        Some(200) => {
            let properties: Option<DeviceProperties> = response
                .data
                .as_ref()
                .and_then(|root| root.get("data"))
                .and_then(|data| data.get("propertyList"))
                .and_then(|props| serde_json::from_value(props.clone()).ok());
            let camera = properties.and_then(|props| props.as_camera(&ip));
            (ip, camera, None)
        }
        Some(status) => (ip, None, Some(format!("HTTP {status}"))),
        None => (ip, None, response.error),
    }
}

/// Expands an IPv4 CIDR block into its concrete host addresses (network and broadcast excluded
/// for blocks of /30 or larger). IPv6 is rejected per the non-goals (§9 open question 5).
pub fn expand_cidr(cidr: &str) -> Result<Vec<String>, ScanError> {
    if cidr.contains(':') {
        return Err(ScanError::Ipv6Unsupported);
    }
    let (addr_part, prefix_part) = cidr
        .split_once('/')
        .ok_or_else(|| ScanError::InvalidCidr(cidr.to_string()))?;
    let base: Ipv4Addr = addr_part
        .parse()
        .map_err(|_| ScanError::InvalidCidr(cidr.to_string()))?;
    let prefix: u32 = prefix_part
        .parse()
        .map_err(|_| ScanError::InvalidCidr(cidr.to_string()))?;
    if prefix > 32 {
        return Err(ScanError::InvalidCidr(cidr.to_string()));
    }

    let host_bits = 32 - prefix;
    let network = if host_bits == 32 {
        0
    } else {
        (u32::from(base) >> host_bits) << host_bits
    };
    let count: u64 = 1u64 << host_bits;

    let (start, end): (u64, u64) = if host_bits >= 2 {
        (1, count - 2)
    } else {
        (0, count.saturating_sub(1))
    };

    let mut ips = Vec::with_capacity((end - start + 1) as usize);
    for offset in start..=end {
        ips.push(Ipv4Addr::from(network + offset as u32).to_string());
    }
    Ok(ips)
}

/// Whether `ip` falls in an RFC 1918 private range (LAN) vs. anything else (WAN) — used to pick
/// the adaptive scanner's step size (§4.7).
pub fn is_lan(ip: &Ipv4Addr) -> bool {
    ip.is_private()
}

/// Named intensity presets for the adaptive single-target scanner (§4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntensityPreset {
    Conservative,
    Balanced,
    Aggressive,
    /// Clamped to [5, 200]; `max = min(200, 2 * value)`.
    Custom(u32),
}

#[derive(Debug, Clone, Copy)]
pub struct AdaptiveConfig {
    pub batch: u32,
    pub max: u32,
    pub delay_ms: u64,
    pub timeout_secs: u64,
}

impl IntensityPreset {
    pub fn config(self) -> AdaptiveConfig {
        match self {
            IntensityPreset::Conservative => AdaptiveConfig {
                batch: 15,
                max: 30,
                delay_ms: 100,
                timeout_secs: 7,
            },
            IntensityPreset::Balanced => AdaptiveConfig {
                batch: 30,
                max: 80,
                delay_ms: 50,
                timeout_secs: 5,
            },
            IntensityPreset::Aggressive => AdaptiveConfig {
                batch: 50,
                max: 150,
                delay_ms: 20,
                timeout_secs: 3,
            },
            IntensityPreset::Custom(value) => {
                let batch = value.clamp(5, 200);
                AdaptiveConfig {
                    batch,
                    max: (2 * batch).min(200),
                    delay_ms: 50,
                    timeout_secs: 5,
                }
            }
        }
    }
}

const TARGET_ERROR_RATE: f64 = 0.02;
const CEILING_ERROR_RATE: f64 = 0.05;
const MIN_BATCH: u32 = 1;
const ERROR_RATE_WINDOW: usize = 3;

/// Per-batch outcome counts fed into [`AdaptiveScanner::record_batch`].
#[derive(Debug, Clone, Copy, Default)]
pub struct BatchMetrics {
    pub success: u32,
    pub timeout: u32,
    pub error: u32,
    pub avg_response_ms: u64,
}

/// Self-throttling batch-size/delay state for single-target adaptive scanning (§4.7, §3 Adaptive
/// scanner state).
pub struct AdaptiveScanner {
    pub current_batch: u32,
    pub min: u32,
    pub max: u32,
    pub delay: Duration,
    base_delay: Duration,
    recent_error_rates: VecDeque<f64>,
    is_lan: bool,
}

impl AdaptiveScanner {
    pub fn new(preset: IntensityPreset, is_lan: bool) -> Self {
        let config = preset.config();
        Self {
            current_batch: config.batch,
            min: MIN_BATCH,
            max: config.max,
            delay: Duration::from_millis(config.delay_ms),
            base_delay: Duration::from_millis(config.delay_ms),
            recent_error_rates: VecDeque::with_capacity(ERROR_RATE_WINDOW),
            is_lan,
        }
    }

    /// Applies one batch's outcome per §4.7's adaptive rules: halve on timeout/high error rate,
    /// grow on low error rate and fast responses, and triple the inter-batch delay while the
    /// recent-error window stays above the ceiling.
    pub fn record_batch(&mut self, metrics: BatchMetrics) {
        let n = (metrics.success + metrics.timeout + metrics.error).max(1);
        let error_rate = (metrics.timeout + metrics.error) as f64 / n as f64;

        if metrics.timeout > 0 || error_rate > CEILING_ERROR_RATE {
            self.current_batch = self.min.max(self.current_batch / 2);
        } else if error_rate < TARGET_ERROR_RATE && metrics.avg_response_ms < 1000 {
            let step = if self.is_lan { 10 } else { 5 };
            self.current_batch = self.max.min(self.current_batch + step);
        }

        self.recent_error_rates.push_back(error_rate);
        while self.recent_error_rates.len() > ERROR_RATE_WINDOW {
            self.recent_error_rates.pop_front();
        }
        let recently_unhealthy = self
            .recent_error_rates
            .iter()
            .any(|&rate| rate > CEILING_ERROR_RATE);
        self.delay = if recently_unhealthy {
            self.base_delay * 3
        } else {
            self.base_delay
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expands_a_slash_28() {
        let ips = expand_cidr("192.168.1.0/28").unwrap();
        assert_eq!(ips.len(), 14);
        assert_eq!(ips.first().unwrap(), "192.168.1.1");
        assert_eq!(ips.last().unwrap(), "192.168.1.14");
    }

    #[test]
    fn rejects_ipv6() {
        assert!(matches!(
            expand_cidr("::1/128"),
            Err(ScanError::Ipv6Unsupported)
        ));
    }

    #[test]
    fn rejects_malformed_cidr() {
        assert!(matches!(
            expand_cidr("not-an-ip/24"),
            Err(ScanError::InvalidCidr(_))
        ));
        assert!(matches!(
            expand_cidr("10.0.0.0"),
            Err(ScanError::InvalidCidr(_))
        ));
    }

    #[test]
    fn lan_detection_matches_rfc1918() {
        assert!(is_lan(&"192.168.1.1".parse().unwrap()));
        assert!(is_lan(&"10.0.0.1".parse().unwrap()));
        assert!(!is_lan(&"8.8.8.8".parse().unwrap()));
    }

    #[test]
    fn percent_complete_caps_at_100() {
        assert_eq!(percent_complete(14, 14), 100);
        assert_eq!(percent_complete(0, 14), 0);
        assert_eq!(percent_complete(7, 14), 50);
    }

    #[test]
    fn resolve_targets_requires_ips_or_cidr() {
        let req = ScanRequest {
            ips: vec![],
            cidr: None,
            username: String::new(),
            password: String::new(),
        };
        assert!(matches!(
            resolve_targets(&req),
            Err(ScanError::EmptyTargets)
        ));
    }

    #[test]
    fn adaptive_scanner_halves_on_timeout() {
        let mut scanner = AdaptiveScanner::new(IntensityPreset::Balanced, true);
        assert_eq!(scanner.current_batch, 30);
        scanner.record_batch(BatchMetrics {
            success: 25,
            timeout: 1,
            error: 0,
            avg_response_ms: 200,
        });
        assert_eq!(scanner.current_batch, 15);
    }

    #[test]
    fn adaptive_scanner_grows_on_healthy_batch() {
        let mut scanner = AdaptiveScanner::new(IntensityPreset::Balanced, true);
        scanner.record_batch(BatchMetrics {
            success: 30,
            timeout: 0,
            error: 0,
            avg_response_ms: 100,
        });
        assert_eq!(scanner.current_batch, 40);
    }

    #[test]
    fn adaptive_scanner_never_exceeds_max() {
        let mut scanner = AdaptiveScanner::new(IntensityPreset::Custom(190), true);
        assert_eq!(scanner.max, 200);
        scanner.record_batch(BatchMetrics {
            success: 190,
            timeout: 0,
            error: 0,
            avg_response_ms: 50,
        });
        assert_eq!(scanner.current_batch, 200);
    }

    #[test]
    fn custom_preset_clamps_batch_to_5_200() {
        assert_eq!(IntensityPreset::Custom(1).config().batch, 5);
        assert_eq!(IntensityPreset::Custom(1000).config().batch, 200);
        assert_eq!(IntensityPreset::Custom(1000).config().max, 200);
    }

    #[test]
    fn delay_triples_after_sustained_high_error_rate() {
        let mut scanner = AdaptiveScanner::new(IntensityPreset::Balanced, true);
        let base = scanner.delay;
        for _ in 0..3 {
            scanner.record_batch(BatchMetrics {
                success: 10,
                timeout: 0,
                error: 10,
                avg_response_ms: 200,
            });
        }
        assert_eq!(scanner.delay, base * 3);
    }
}
