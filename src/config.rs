//! Process-level configuration resolved once at startup.
//!
//! Mirrors `beach-road`'s `Config::from_env` shape: read from the environment, fall back to a
//! hardcoded default, never fail at parse time.

use std::env;

#[derive(Debug, Clone)]
pub struct Config {
    pub proxy_port: u16,
    pub scan_workers: usize,
    pub scan_intensity: String,
}

const DEFAULT_PORT: u16 = 9876;
const DEFAULT_SCAN_WORKERS: usize = 50;

impl Config {
    pub fn from_env() -> Self {
        Self {
            proxy_port: env::var("ANAVA_PROXY_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_PORT),
            scan_workers: env::var("ANAVA_SCAN_WORKERS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_SCAN_WORKERS),
            scan_intensity: env::var("ANAVA_SCAN_INTENSITY").unwrap_or_else(|_| "balanced".into()),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            proxy_port: DEFAULT_PORT,
            scan_workers: DEFAULT_SCAN_WORKERS,
            scan_intensity: "balanced".to_string(),
        }
    }
}

/// Persisted runtime configuration written by `CONFIGURE` and read back by later
/// `HEALTH_CHECK` / `PROXY_REQUEST` calls that need the backend session token.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RuntimeConfig {
    pub backend_url: String,
    pub project_id: String,
    pub session_token: String,
}

impl RuntimeConfig {
    pub fn load(path: &std::path::Path) -> Option<Self> {
        let bytes = std::fs::read(path).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    pub fn save(&self, path: &std::path::Path) -> std::io::Result<()> {
        let bytes = serde_json::to_vec_pretty(self)?;
        crate::paths::write_owner_only(path, &bytes)
    }
}
