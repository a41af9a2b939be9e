//! mio event loop implementation.
//!
//! Readiness-based model: poll tells us when sockets are ready, then the
//! connection state machines perform non-blocking channel I/O.
//! Uses epoll on Linux, kqueue on macOS.
//!
//! mio only reports readiness edges, so the readiness seen for each socket is
//! kept until the channel reports it would block in that direction. Poll
//! blocks indefinitely unless some recorded readiness is still actionable.

use crate::config::Config;
use crate::runtime::channel::{CloseStatus, SecureChannel, TlsChannel};
use crate::runtime::connection::Readiness;
use crate::runtime::registry::ConnectionRegistry;
use crate::runtime::{BUFFER_SIZE, MAX_CONNECTIONS};
use mio::event::Event;
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token};
use rustls::ServerConfig;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);

/// Single-threaded echo server driving every connection from one poll.
struct EventLoop {
    poll: Poll,
    listener: TcpListener,
    /// Readiness observed on the listener and not yet used up.
    listener_ready: bool,
    connections: ConnectionRegistry<TlsChannel>,
    tls_config: Arc<ServerConfig>,
    /// Staging area shared by every connection's channel I/O.
    scratch: Vec<u8>,
}

/// Run the server until a fatal error occurs.
pub fn run(config: &Config, tls_config: Arc<ServerConfig>) -> io::Result<()> {
    let addr = resolve_ipv4(&config.host, config.port)?;
    let listener = create_listener(addr, MAX_CONNECTIONS)?;
    let mut event_loop = EventLoop::new(TcpListener::from_std(listener), tls_config)?;

    info!(
        addr = %addr,
        max_connections = MAX_CONNECTIONS,
        buffer_size = BUFFER_SIZE,
        "Listening"
    );

    event_loop.run()
}

impl EventLoop {
    fn new(mut listener: TcpListener, tls_config: Arc<ServerConfig>) -> io::Result<Self> {
        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

        Ok(Self {
            poll,
            listener,
            listener_ready: false,
            // Slot 0 of the table belongs to the listener
            connections: ConnectionRegistry::new(MAX_CONNECTIONS - 1, BUFFER_SIZE),
            tls_config,
            scratch: vec![0u8; BUFFER_SIZE],
        })
    }

    fn run(&mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(MAX_CONNECTIONS);

        loop {
            let timeout = self.has_pending().then_some(Duration::ZERO);
            if let Err(e) = self.poll.poll(&mut events, timeout) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(e);
            }

            for event in events.iter() {
                self.record(event);
            }

            if self.listener_ready && !self.connections.throttled() {
                self.accept_one();
            }

            let poll = &self.poll;
            self.connections
                .service_all(&mut self.scratch, |conn_id, mut channel| {
                    let _ = poll.registry().deregister(&mut channel);
                    debug!(conn_id, peer = %channel.peer_addr(), "Released connection");
                });
        }
    }

    fn has_pending(&self) -> bool {
        (self.listener_ready && !self.connections.throttled()) || self.connections.has_pending()
    }

    /// Merge a poll event into the recorded readiness.
    fn record(&mut self, event: &Event) {
        match event.token() {
            LISTENER_TOKEN => {
                if event.is_readable() {
                    self.listener_ready = true;
                }
            }
            Token(conn_id) => {
                if let Some(ready) = self.connections.ready_mut(conn_id) {
                    *ready |= readiness_of(event);
                }
            }
        }
    }

    /// Accept a single pending connection into a free slot.
    fn accept_one(&mut self) {
        let (stream, peer) = match self.listener.accept() {
            Ok(accepted) => accepted,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.listener_ready = false;
                return;
            }
            Err(e) => {
                error!(error = %e, "Accept error");
                return;
            }
        };

        let Some(conn_id) = self.connections.vacant_key() else {
            warn!(peer = %peer, "Connection limit reached");
            return;
        };

        let mut channel = match TlsChannel::accept(stream, peer, Arc::clone(&self.tls_config)) {
            Ok(channel) => channel,
            Err(e) => {
                warn!(peer = %peer, error = %e, "TLS accept failed");
                return;
            }
        };

        if let Err(e) = self.poll.registry().register(
            &mut channel,
            Token(conn_id),
            Interest::READABLE | Interest::WRITABLE,
        ) {
            warn!(peer = %peer, error = %e, "Failed to register connection");
            return;
        }

        match self.connections.admit(channel) {
            Ok(conn_id) => debug!(
                conn_id,
                peer = %peer,
                connections = self.connections.len(),
                "Accepted connection"
            ),
            Err(mut channel) => {
                let _ = self.poll.registry().deregister(&mut channel);
                while let CloseStatus::WouldBlock(_) = channel.close() {}
            }
        }
    }
}

/// Translate a mio event into readiness bits.
fn readiness_of(event: &Event) -> Readiness {
    let mut ready = Readiness::EMPTY;
    if event.is_readable() {
        ready |= Readiness::READABLE;
    }
    if event.is_writable() {
        ready |= Readiness::WRITABLE;
    }
    if event.is_error() || (event.is_read_closed() && event.is_write_closed()) {
        ready |= Readiness::HANGUP;
    }
    ready
}

/// Resolve `host:port` to its first IPv4 address.
pub fn resolve_ipv4(host: &str, port: u16) -> io::Result<SocketAddr> {
    (host, port)
        .to_socket_addrs()?
        .find(SocketAddr::is_ipv4)
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("no IPv4 address for {host}:{port}"),
            )
        })
}

/// Create a non-blocking TCP listener with SO_REUSEADDR.
pub fn create_listener(addr: SocketAddr, backlog: usize) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        socket2::Domain::IPV4,
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog as i32)?;

    Ok(socket.into())
}
