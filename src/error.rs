use thiserror::Error;

/// Errors raised while walking a single request through the auth engine.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("device not responding: {0}")]
    NotResponding(String),
    #[error("malformed digest challenge: {0}")]
    MalformedChallenge(String),
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("invalid request url: {0}")]
    InvalidUrl(String),
}

/// Errors raised by the scan orchestrator.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("unknown scan id: {0}")]
    UnknownScan(String),
    #[error("invalid cidr block: {0}")]
    InvalidCidr(String),
    #[error("ipv6 is not supported")]
    Ipv6Unsupported,
    #[error("no target ips supplied")]
    EmptyTargets,
}

/// Errors raised by the TLS pinning store.
#[derive(Debug, Error)]
pub enum PinError {
    #[error("io error reading pin store: {0}")]
    Io(#[from] std::io::Error),
    #[error("pin store is not valid json: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Errors raised by single-instance lifecycle management.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("another instance is already running (pid {0})")]
    AlreadyRunning(u32),
    #[error("io error managing lockfile: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by the stdio Host dispatcher.
#[derive(Debug, Error)]
pub enum HostError {
    #[error("stdio framing violation: {0}")]
    Protocol(String),
    #[error("backend authentication failed: {0}")]
    BackendAuthFailed(String),
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors raised by the multipart uploader.
#[derive(Debug, Error)]
pub enum UploadError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("upstream license error code {0}")]
    LicenseRejected(u32),
}
