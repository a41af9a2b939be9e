//! tls-echo: A buffering TLS echo server
//!
//! Accepts TLS connections and echoes every byte back to its sender.
//!
//! Features:
//! - Single-threaded readiness-based event loop (epoll/kqueue via mio)
//! - Fixed table of 256 slots with accept throttling when full
//! - Per-connection 4 KiB circular buffer with partial-write continuation
//! - Configuration via CLI arguments or TOML file

mod config;
mod runtime;
mod tls;

use config::Config;
use std::process::ExitCode;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("tls-echo: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        host = %config.host,
        port = config.port,
        cert = %config.tls.cert_file.display(),
        verify_client = config.tls.verify_client,
        "Starting tls-echo server"
    );

    let tls_config = tls::load_server_config(&config.tls)?;
    runtime::run(&config, tls_config)?;
    Ok(())
}
