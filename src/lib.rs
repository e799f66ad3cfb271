//! Local Connector core: the stdio Host, the Proxy Service, and the shared lifecycle/auth
//! machinery between them.

pub mod auth;
pub mod config;
pub mod device;
pub mod digest;
pub mod error;
pub mod framing;
pub mod host;
pub mod http_client;
pub mod lockfile;
pub mod logging;
pub mod multipart;
pub mod origin;
pub mod paths;
pub mod pinning;
pub mod sanitize;
pub mod scan;
pub mod server;
