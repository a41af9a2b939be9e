//! mio-based event loop.
//!
//! Readiness-based I/O using mio (epoll on Linux, kqueue on macOS).

mod event_loop;

use crate::config::Config;
use rustls::ServerConfig;
use std::sync::Arc;

/// Run the server using the mio backend.
pub fn run(config: &Config, tls_config: Arc<ServerConfig>) -> std::io::Result<()> {
    event_loop::run(config, tls_config)
}
