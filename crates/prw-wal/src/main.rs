use std::sync::Arc;

use prw_wal::{Config, RemoteWriteExporter, Wal};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Exceptional start-up failure: log and exit.
fn fatal(msg: &str, error: &dyn std::fmt::Display) -> ! {
    error!(%error, "{msg}");
    std::process::exit(1);
}

fn setup_logging() {
    use tracing_subscriber::filter::LevelFilter;
    use tracing_subscriber::prelude::*;

    let level = std::env::var("PRW_WAL_LOG_LEVEL")
        .ok()
        .and_then(|val| {
            val.parse::<LevelFilter>().ok().or_else(|| {
                eprintln!("invalid PRW_WAL_LOG_LEVEL: {val:?}, defaulting to WARN");
                None
            })
        })
        .unwrap_or(LevelFilter::WARN);

    tracing_subscriber::registry()
        .with(level)
        .with(tracing_microjson::JsonLayer::new(std::io::stderr).with_target(true))
        .init();
}

fn setup_rustls() {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("failed to install rustls ring provider");
}

/// Drain a write-ahead log left behind by a previous run to the configured
/// endpoint, until interrupted.
#[tokio::main]
async fn main() {
    setup_logging();
    setup_rustls();

    let config = Config::from_env().unwrap_or_else(|e| fatal("config error", &e));
    let Some(wal_config) = config.wal else {
        fatal("nothing to drain", &"PRW_WAL_DIRECTORY is not set");
    };

    let exporter = RemoteWriteExporter::new(&config.exporter)
        .unwrap_or_else(|e| fatal("failed to build HTTP client", &e));
    let wal = match Wal::new(Some(wal_config), Arc::new(exporter)) {
        Ok(Some(wal)) => wal,
        Ok(None) => fatal("nothing to drain", &"write-ahead log disabled"),
        Err(e) => fatal("failed to open write-ahead log", &e),
    };

    let cancel = CancellationToken::new();
    wal.run(&cancel)
        .unwrap_or_else(|e| fatal("failed to start drain loop", &e));
    info!(endpoint = %config.exporter.endpoint, "draining write-ahead log");

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for shutdown signal");
    }
    info!("shutting down");

    cancel.cancel();
    if let Err(e) = wal.stop().await {
        fatal("failed to close write-ahead log", &e);
    }
}
