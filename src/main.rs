use anava_connector::config::Config;
use anava_connector::http_client::HttpClients;
use anava_connector::pinning::PinStore;
use anava_connector::{host, lockfile, logging, paths, server};

use clap::Parser;
use tracing::{error, info};

/// Local Connector entry point: a single binary that runs in one of three mutually exclusive
/// modes (§6).
#[derive(Parser, Debug)]
#[command(name = "anava-connector")]
#[command(about = "Native companion for discovering, authenticating to, and deploying on AXIS cameras")]
struct Cli {
    /// Run the stdio Host: read one length-prefixed JSON message, write one reply, exit.
    #[arg(long, conflicts_with_all = ["proxy_service", "version"])]
    native_messaging: bool,

    /// Run the loopback HTTP/WebSocket Proxy Service.
    #[arg(long, conflicts_with_all = ["native_messaging", "version"])]
    proxy_service: bool,

    /// Print the version and exit.
    #[arg(long, conflicts_with_all = ["native_messaging", "proxy_service"])]
    version: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if cli.version {
        println!("anava-connector {}", env!("CARGO_PKG_VERSION"));
        return;
    }

    if !cli.native_messaging && !cli.proxy_service {
        eprintln!("usage: anava-connector [--native-messaging | --proxy-service | --version]");
        std::process::exit(1);
    }

    let config = Config::from_env();
    let paths = paths::StatePaths::resolve();
    if let Err(e) = paths.ensure_dirs() {
        eprintln!("failed to create state directories: {e}");
        std::process::exit(1);
    }

    let log_path = if cli.proxy_service {
        paths.proxy_log_path()
    } else {
        paths.host_log_path()
    };
    let _log_guard = match logging::init(&log_path, "info") {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("failed to initialize logging: {e}");
            None
        }
    };

    let pin_store = std::sync::Arc::new(PinStore::load(paths.pin_store_path()));
    let clients = match HttpClients::build(pin_store) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "failed to build HTTP clients");
            std::process::exit(1);
        }
    };

    if cli.proxy_service {
        run_proxy_service(config, paths, clients).await;
    } else {
        run_native_messaging(config, paths, clients).await;
    }
}

async fn run_proxy_service(
    config: Config,
    paths: paths::StatePaths,
    clients: HttpClients,
) {
    let lock = match lockfile::Lock::acquire(paths.lockfile_path()) {
        Ok(lock) => lock,
        Err(e) => {
            error!(error = %e, "another instance is already running");
            eprintln!("{e}");
            std::process::exit(1);
        }
    };

    info!(port = config.proxy_port, workers = config.scan_workers, "starting proxy service");

    let state = server::AppState {
        clients,
        scans: anava_connector::scan::ScanRegistry::new(),
        scan_workers: config.scan_workers,
    };

    if let Err(e) = server::serve(config.proxy_port, state).await {
        error!(error = %e, "proxy service exited with an error");
    }

    lock.release();
}

async fn run_native_messaging(config: Config, paths: paths::StatePaths, clients: HttpClients) {
    let ctx = host::HostContext {
        clients,
        proxy_base_url: host::loopback_url(config.proxy_port),
        runtime_config_path: paths.runtime_config_path(),
    };

    let mut stdin = tokio::io::stdin();
    let mut stdout = tokio::io::stdout();

    if let Err(e) = host::run_once(&mut stdin, &mut stdout, &ctx).await {
        error!(error = %e, "stdio host failed");
        std::process::exit(1);
    }
}
