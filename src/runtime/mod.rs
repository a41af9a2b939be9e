//! Single-threaded runtime for the echo server.
//!
//! Readiness-based I/O using mio (epoll on Linux, kqueue on macOS).
//!
//! Components:
//! - `RingBuffer`: per-connection circular buffer
//! - `SecureChannel`: non-blocking encrypted transport (`TlsChannel`)
//! - `Connection`: per-connection read/write state machine
//! - `ConnectionRegistry`: bounded slot table and acceptance throttle
//! - `mio`: the event loop driving all of the above

mod buffer;
mod channel;
mod connection;
mod mio;
mod registry;

use crate::config::Config;
use rustls::ServerConfig;
use std::sync::Arc;

/// Size of the connection table, including the listening socket.
pub const MAX_CONNECTIONS: usize = 256;

/// Per-connection buffer capacity in bytes.
pub const BUFFER_SIZE: usize = 4096;

/// Run the server. Only returns on a fatal error.
pub fn run(config: &Config, tls_config: Arc<ServerConfig>) -> std::io::Result<()> {
    mio::run(config, tls_config)
}
