//! Connection state machine for echoing bytes through a secure channel.
//!
//! Each connection alternates between draining its channel into its buffer
//! (`Reading`) and draining its buffer back into the channel (`Writing`).
//! On every readiness notification it attempts at most one direction and
//! records which socket events it needs next.

use crate::runtime::buffer::RingBuffer;
use crate::runtime::channel::{ChannelIo, CloseStatus, SecureChannel, Want};
use std::ops::{BitOr, BitOrAssign};
use tracing::{trace, warn};

/// Set of socket readiness conditions.
///
/// Used both for the events a connection requests and for the events the
/// poller observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Readiness(u8);

impl Readiness {
    pub const EMPTY: Readiness = Readiness(0);
    pub const READABLE: Readiness = Readiness(0b001);
    pub const WRITABLE: Readiness = Readiness(0b010);
    pub const HANGUP: Readiness = Readiness(0b100);

    pub fn is_hangup(self) -> bool {
        self.contains(Self::HANGUP)
    }

    pub fn contains(self, other: Readiness) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(self, other: Readiness) -> bool {
        self.0 & other.0 != 0
    }

    pub fn remove(&mut self, other: Readiness) {
        self.0 &= !other.0;
    }
}

impl BitOr for Readiness {
    type Output = Readiness;

    fn bitor(self, rhs: Readiness) -> Readiness {
        Readiness(self.0 | rhs.0)
    }
}

impl BitOrAssign for Readiness {
    fn bitor_assign(&mut self, rhs: Readiness) {
        self.0 |= rhs.0;
    }
}

impl From<Want> for Readiness {
    fn from(want: Want) -> Self {
        match want {
            Want::Read => Readiness::READABLE,
            Want::Write => Readiness::WRITABLE,
        }
    }
}

/// Direction a connection attempts next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Draining the channel into the buffer.
    Reading,
    /// Draining the buffer into the channel.
    Writing,
}

/// What the owner must do after a readiness notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Continue,
    Close,
}

/// A single peer connection.
#[derive(Debug)]
pub struct Connection<C> {
    state: ConnState,
    buffer: RingBuffer,
    /// Events currently requested from the poller.
    interest: Readiness,
    channel: C,
}

impl<C: SecureChannel> Connection<C> {
    /// Create a new connection in the initial reading state.
    pub fn new(channel: C, buffer_size: usize) -> Self {
        Self {
            state: ConnState::Reading,
            buffer: RingBuffer::new(buffer_size),
            interest: Readiness::READABLE | Readiness::HANGUP,
            channel,
        }
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    #[cfg(test)]
    pub fn interest(&self) -> Readiness {
        self.interest
    }

    /// Bytes received and not yet confirmed as echoed.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Whether `ready` gives this connection something to do.
    pub fn is_actionable(&self, ready: Readiness) -> bool {
        ready.is_hangup() || ready.intersects(self.interest)
    }

    /// Handle one readiness notification.
    ///
    /// `ready` holds the readiness observed for this connection; the bit for
    /// a direction is cleared once the channel reports it would block there.
    /// `scratch` is the staging area for channel I/O and bounds the size of a
    /// single read or write.
    pub fn on_ready(&mut self, ready: &mut Readiness, scratch: &mut [u8]) -> Step {
        if ready.is_hangup() {
            trace!(buffered = self.buffer.len(), "hangup");
            return Step::Close;
        }
        if !ready.intersects(self.interest) {
            return Step::Continue;
        }

        match self.state {
            ConnState::Reading => self.read_step(ready, scratch),
            ConnState::Writing => self.write_step(ready, scratch),
        }
    }

    fn read_step(&mut self, ready: &mut Readiness, scratch: &mut [u8]) -> Step {
        match self.channel.read(scratch) {
            ChannelIo::WouldBlock(want) => {
                self.wait_for(want, ready);
                Step::Continue
            }
            ChannelIo::Failed(e) => {
                warn!(error = %e, "channel read failed");
                Step::Close
            }
            ChannelIo::Progress(0) => Step::Close,
            ChannelIo::Progress(n) => {
                let put = self.buffer.put_in(&scratch[..n]);
                trace!(bytes = put, "put into buffer");
                if put != n {
                    warn!(read = n, stored = put, "connection buffer overrun");
                    return Step::Close;
                }
                self.state = ConnState::Writing;
                self.interest = Readiness::WRITABLE | Readiness::HANGUP;
                Step::Continue
            }
        }
    }

    fn write_step(&mut self, ready: &mut Readiness, scratch: &mut [u8]) -> Step {
        if self.buffer.is_empty() {
            // Nothing to send; wait for the next notification
            ready.remove(Readiness::WRITABLE);
            return Step::Continue;
        }
        let len = self.buffer.peek_out(scratch);
        trace!(bytes = len, "got from buffer");

        match self.channel.write(&scratch[..len]) {
            ChannelIo::WouldBlock(want) => {
                self.wait_for(want, ready);
                Step::Continue
            }
            ChannelIo::Failed(e) => {
                warn!(error = %e, "channel write failed");
                Step::Close
            }
            ChannelIo::Progress(n) => {
                let consumed = self.buffer.consume(n);
                trace!(bytes = consumed, "consumed from buffer");
                if n == len {
                    self.state = ConnState::Reading;
                    self.interest = Readiness::READABLE | Readiness::HANGUP;
                }
                Step::Continue
            }
        }
    }

    fn wait_for(&mut self, want: Want, ready: &mut Readiness) {
        let needed = Readiness::from(want);
        ready.remove(needed);
        self.interest = needed | Readiness::HANGUP;
    }

    /// Close the channel, retrying until it reports completion.
    ///
    /// Retries back to back without waiting for readiness, so a peer that
    /// stops reading while the socket send buffer is full holds up the whole
    /// loop until the close_notify drains or the socket fails.
    ///
    /// Hands the closed channel back so the owner can release its socket.
    pub fn close(mut self) -> C {
        let mut attempts = 0usize;
        while let CloseStatus::WouldBlock(want) = self.channel.close() {
            attempts += 1;
            trace!(?want, attempts, "close needs retry");
        }
        self.channel
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::channel::mock::{MockChannel, ReadStep, WriteStep};

    const CAP: usize = 4096;

    fn ready_all() -> Readiness {
        Readiness::READABLE | Readiness::WRITABLE
    }

    fn assert_writing_has_data(conn: &Connection<MockChannel>) {
        if conn.state() == ConnState::Writing {
            assert!(conn.buffered() > 0, "writing with an empty buffer");
        }
    }

    #[test]
    fn test_readiness_ops() {
        let mut r = Readiness::READABLE | Readiness::HANGUP;
        assert!(r.contains(Readiness::READABLE));
        assert!(r.is_hangup());
        assert!(!r.contains(Readiness::WRITABLE));
        assert!(r.intersects(Readiness::READABLE | Readiness::WRITABLE));

        r.remove(Readiness::READABLE);
        assert!(!r.contains(Readiness::READABLE));
        r.remove(Readiness::HANGUP);
        assert_eq!(r, Readiness::EMPTY);

        assert_eq!(Readiness::from(Want::Write), Readiness::WRITABLE);
    }

    #[test]
    fn test_echo_hello() {
        let channel = MockChannel::new();
        channel.push_read(ReadStep::Data(b"hello".to_vec()));
        let mut conn = Connection::new(channel.clone(), CAP);
        let mut scratch = vec![0u8; CAP];

        assert_eq!(conn.state(), ConnState::Reading);
        assert_eq!(conn.interest(), Readiness::READABLE | Readiness::HANGUP);

        let mut ready = ready_all();
        assert_eq!(conn.on_ready(&mut ready, &mut scratch), Step::Continue);
        assert_eq!(conn.state(), ConnState::Writing);
        assert_eq!(conn.interest(), Readiness::WRITABLE | Readiness::HANGUP);
        assert_eq!(conn.buffered(), 5);
        assert_writing_has_data(&conn);

        assert_eq!(conn.on_ready(&mut ready, &mut scratch), Step::Continue);
        assert_eq!(conn.state(), ConnState::Reading);
        assert_eq!(conn.buffered(), 0);
        assert_eq!(channel.state.borrow().written, b"hello");
        assert!(!channel.state.borrow().closed);
    }

    #[test]
    fn test_not_ready_for_interest_does_nothing() {
        let channel = MockChannel::new();
        channel.push_read(ReadStep::Data(b"hello".to_vec()));
        let mut conn = Connection::new(channel.clone(), CAP);
        let mut scratch = vec![0u8; CAP];

        let mut ready = Readiness::WRITABLE;
        assert_eq!(conn.on_ready(&mut ready, &mut scratch), Step::Continue);
        assert_eq!(channel.state.borrow().read_calls, 0);
        assert_eq!(conn.state(), ConnState::Reading);
    }

    #[test]
    fn test_read_would_block() {
        let channel = MockChannel::new();
        channel.push_read(ReadStep::Block(Want::Write));
        channel.push_read(ReadStep::Block(Want::Read));
        let mut conn = Connection::new(channel.clone(), CAP);
        let mut scratch = vec![0u8; CAP];

        let mut ready = ready_all();
        assert_eq!(conn.on_ready(&mut ready, &mut scratch), Step::Continue);
        assert_eq!(conn.state(), ConnState::Reading);
        assert_eq!(conn.interest(), Readiness::WRITABLE | Readiness::HANGUP);
        assert_eq!(ready, Readiness::READABLE);

        let mut ready = Readiness::WRITABLE;
        assert_eq!(conn.on_ready(&mut ready, &mut scratch), Step::Continue);
        assert_eq!(conn.state(), ConnState::Reading);
        assert_eq!(conn.interest(), Readiness::READABLE | Readiness::HANGUP);
        assert_eq!(ready, Readiness::WRITABLE);
    }

    #[test]
    fn test_read_eof_closes() {
        let channel = MockChannel::new();
        channel.push_read(ReadStep::Eof);
        let mut conn = Connection::new(channel.clone(), CAP);
        let mut scratch = vec![0u8; CAP];

        let mut ready = Readiness::READABLE;
        assert_eq!(conn.on_ready(&mut ready, &mut scratch), Step::Close);

        let _ = conn.close();
        assert!(channel.state.borrow().closed);
    }

    #[test]
    fn test_read_error_closes() {
        let channel = MockChannel::new();
        channel.push_read(ReadStep::Fail);
        let mut conn = Connection::new(channel, CAP);
        let mut scratch = vec![0u8; CAP];

        let mut ready = Readiness::READABLE;
        assert_eq!(conn.on_ready(&mut ready, &mut scratch), Step::Close);
    }

    #[test]
    fn test_buffer_overrun_closes() {
        let channel = MockChannel::new();
        channel.push_read(ReadStep::Data(vec![1u8; 16]));
        let mut conn = Connection::new(channel, 8);
        let mut scratch = vec![0u8; 16];

        let mut ready = Readiness::READABLE;
        assert_eq!(conn.on_ready(&mut ready, &mut scratch), Step::Close);
    }

    #[test]
    fn test_hangup_closes_with_pending_output() {
        let channel = MockChannel::new();
        channel.push_read(ReadStep::Data(b"pending".to_vec()));
        let mut conn = Connection::new(channel.clone(), CAP);
        let mut scratch = vec![0u8; CAP];

        let mut ready = Readiness::READABLE;
        conn.on_ready(&mut ready, &mut scratch);
        assert_eq!(conn.state(), ConnState::Writing);

        let mut ready = Readiness::WRITABLE | Readiness::HANGUP;
        assert_eq!(conn.on_ready(&mut ready, &mut scratch), Step::Close);
        assert_eq!(channel.state.borrow().write_calls, 0);
    }

    #[test]
    fn test_write_would_block_consumes_nothing() {
        let channel = MockChannel::new();
        channel.push_read(ReadStep::Data(b"abc".to_vec()));
        channel.push_write(WriteStep::Block(Want::Read));
        let mut conn = Connection::new(channel.clone(), CAP);
        let mut scratch = vec![0u8; CAP];

        let mut ready = ready_all();
        conn.on_ready(&mut ready, &mut scratch);
        conn.on_ready(&mut ready, &mut scratch);

        assert_eq!(conn.state(), ConnState::Writing);
        assert_eq!(conn.interest(), Readiness::READABLE | Readiness::HANGUP);
        assert_eq!(conn.buffered(), 3);
        assert!(!ready.contains(Readiness::READABLE));
        assert_writing_has_data(&conn);

        // Retry delivers the same bytes
        let mut ready = Readiness::READABLE;
        conn.on_ready(&mut ready, &mut scratch);
        assert_eq!(conn.state(), ConnState::Reading);
        assert_eq!(channel.state.borrow().written, b"abc");
    }

    #[test]
    fn test_write_error_closes() {
        let channel = MockChannel::new();
        channel.push_read(ReadStep::Data(b"abc".to_vec()));
        channel.push_write(WriteStep::Fail);
        let mut conn = Connection::new(channel, CAP);
        let mut scratch = vec![0u8; CAP];

        let mut ready = ready_all();
        assert_eq!(conn.on_ready(&mut ready, &mut scratch), Step::Continue);
        assert_eq!(conn.on_ready(&mut ready, &mut scratch), Step::Close);
    }

    #[test]
    fn test_partial_writes_drain_full_payload() {
        let payload: Vec<u8> = (0..CAP).map(|i| (i % 251) as u8).collect();
        let channel = MockChannel::new();
        channel.push_read(ReadStep::Data(payload.clone()));
        for _ in 0..100 {
            channel.push_write(WriteStep::Accept(100));
        }
        let mut conn = Connection::new(channel.clone(), CAP);
        let mut scratch = vec![0u8; CAP];

        let mut ready = ready_all();
        conn.on_ready(&mut ready, &mut scratch);
        assert_eq!(conn.buffered(), CAP);

        let mut attempts = 0;
        while conn.state() == ConnState::Writing {
            let before = conn.buffered();
            assert_eq!(conn.on_ready(&mut ready, &mut scratch), Step::Continue);
            attempts += 1;
            assert_eq!(before - conn.buffered(), before.min(100));
            assert_writing_has_data(&conn);
        }

        assert_eq!(attempts, CAP.div_ceil(100));
        assert_eq!(channel.state.borrow().write_calls, attempts);
        assert_eq!(conn.buffered(), 0);
        assert_eq!(conn.state(), ConnState::Reading);
        assert_eq!(channel.state.borrow().written, payload);
    }

    #[test]
    fn test_close_retries_until_done() {
        let channel = MockChannel::new();
        channel.state.borrow_mut().close_blocks = 3;
        let conn = Connection::new(channel.clone(), CAP);

        let _ = conn.close();
        let state = channel.state.borrow();
        assert_eq!(state.close_calls, 4);
        assert!(state.closed);
    }
}
