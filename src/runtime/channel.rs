//! Secure channel abstraction.
//!
//! A secure channel wraps a non-blocking stream socket and exposes
//! read/write/close operations that never block. When the underlying socket
//! cannot make progress the operation reports which readiness it needs
//! before it can be retried.
//!
//! The rustls-backed implementation is `TlsChannel`.

use mio::event::Source;
use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use rustls::{ServerConfig, ServerConnection};
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::sync::Arc;

/// Socket readiness an operation is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Want {
    Read,
    Write,
}

/// Outcome of a channel read or write.
#[derive(Debug)]
pub enum ChannelIo {
    /// Bytes transferred. For reads, 0 means the peer closed the stream.
    Progress(usize),
    /// No progress until the socket reports the given readiness.
    WouldBlock(Want),
    /// Unrecoverable failure; the connection must be closed.
    Failed(io::Error),
}

/// Outcome of a channel close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseStatus {
    Done,
    WouldBlock(Want),
}

/// Non-blocking encrypted transport.
///
/// `WouldBlock(Want::Read)` may only be reported after the socket itself
/// reported `WouldBlock` on a read, and `WouldBlock(Want::Write)` only after
/// it did so on a write. The event loop relies on this to know when a
/// readiness notification has been used up.
pub trait SecureChannel {
    /// Read decrypted bytes into `buf`.
    fn read(&mut self, buf: &mut [u8]) -> ChannelIo;

    /// Write `buf` to the peer.
    ///
    /// After `WouldBlock`, the caller must retry with a buffer that starts
    /// with the same bytes.
    fn write(&mut self, buf: &[u8]) -> ChannelIo;

    /// Shut the session down. Must be called until it returns `Done`.
    fn close(&mut self) -> CloseStatus;
}

/// Server-side TLS session over a mio TCP stream.
pub struct TlsChannel {
    session: ServerConnection,
    stream: TcpStream,
    peer: SocketAddr,
    /// Plaintext accepted by the session whose ciphertext is not yet flushed.
    unflushed: usize,
    close_notify_sent: bool,
}

impl TlsChannel {
    /// Set up the server side of a new TLS session.
    ///
    /// Only session state is created here; handshake flights are exchanged
    /// by `read` as the peer's records arrive, so this never blocks.
    pub fn accept(
        stream: TcpStream,
        peer: SocketAddr,
        config: Arc<ServerConfig>,
    ) -> io::Result<Self> {
        let session = ServerConnection::new(config)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        stream.set_nodelay(true)?;

        Ok(Self {
            session,
            stream,
            peer,
            unflushed: 0,
            close_notify_sent: false,
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Write pending TLS records to the socket.
    fn flush_tls(&mut self) -> io::Result<()> {
        while self.session.wants_write() {
            match self.session.write_tls(&mut self.stream) {
                Ok(_) => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Pull TLS records from the socket and decrypt them.
    ///
    /// Returns `Ok(false)` on TCP end of stream.
    fn fill_tls(&mut self) -> io::Result<bool> {
        let n = loop {
            match self.session.read_tls(&mut self.stream) {
                Ok(n) => break n,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        };

        if let Err(e) = self.session.process_new_packets() {
            // Best effort: let the peer see the alert
            let _ = self.session.write_tls(&mut self.stream);
            return Err(io::Error::new(io::ErrorKind::InvalidData, e));
        }

        Ok(n > 0)
    }
}

fn classify(e: io::Error, want: Want) -> ChannelIo {
    if e.kind() == io::ErrorKind::WouldBlock {
        ChannelIo::WouldBlock(want)
    } else {
        ChannelIo::Failed(e)
    }
}

impl SecureChannel for TlsChannel {
    fn read(&mut self, buf: &mut [u8]) -> ChannelIo {
        loop {
            if let Err(e) = self.flush_tls() {
                return classify(e, Want::Write);
            }

            match self.session.reader().read(buf) {
                Ok(n) => return ChannelIo::Progress(n),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
                // Peer closed the socket without close_notify
                Err(ref e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    return ChannelIo::Progress(0)
                }
                Err(e) => return ChannelIo::Failed(e),
            }

            match self.fill_tls() {
                Ok(true) => {}
                Ok(false) => {
                    // Deliver whatever arrived together with the EOF
                    return match self.session.reader().read(buf) {
                        Ok(n) => ChannelIo::Progress(n),
                        Err(_) => ChannelIo::Progress(0),
                    };
                }
                Err(e) => return classify(e, Want::Read),
            }
        }
    }

    fn write(&mut self, buf: &[u8]) -> ChannelIo {
        if self.unflushed == 0 {
            if buf.is_empty() {
                return ChannelIo::Progress(0);
            }
            match self.session.writer().write(buf) {
                Ok(n) => self.unflushed = n,
                Err(e) => return ChannelIo::Failed(e),
            }
        }

        match self.flush_tls() {
            Ok(()) => ChannelIo::Progress(std::mem::take(&mut self.unflushed)),
            Err(e) => classify(e, Want::Write),
        }
    }

    fn close(&mut self) -> CloseStatus {
        if !self.close_notify_sent {
            self.session.send_close_notify();
            self.close_notify_sent = true;
        }

        match self.flush_tls() {
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                return CloseStatus::WouldBlock(Want::Write)
            }
            // Peer is gone, nothing left to deliver
            Ok(()) | Err(_) => {}
        }

        let _ = self.stream.shutdown(Shutdown::Both);
        CloseStatus::Done
    }
}

impl Source for TlsChannel {
    fn register(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        self.stream.register(registry, token, interests)
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        self.stream.reregister(registry, token, interests)
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        self.stream.deregister(registry)
    }
}
