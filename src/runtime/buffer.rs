//! Per-connection circular byte buffer.
//!
//! Decouples the secure channel's read side from its write side. Bytes read
//! from the peer are appended with `put_in`, handed back to the channel with
//! `peek_out`, and only released with `consume` once the channel confirms
//! they were sent.
//!
//! ## Cursors
//!
//! Three positions into the storage, all wrapping modulo its length:
//! - `read`: first byte not yet confirmed as sent
//! - `peek`: end of the region last handed out by `peek_out`
//! - `write`: next free position
//!
//! Unconsumed bytes live in `[read, write)`. `peek` always sits inside that
//! range, so `consume` can never release bytes the caller has not seen.
//!
//! One byte of storage is kept empty to tell a full buffer from an empty one,
//! so a buffer built with `new(capacity)` allocates `capacity + 1` bytes.

/// Fixed-capacity circular buffer with speculative reads.
pub struct RingBuffer {
    /// Backing storage, one byte larger than the usable capacity.
    storage: Box<[u8]>,
    read: usize,
    peek: usize,
    write: usize,
}

impl RingBuffer {
    /// Create an empty buffer able to hold `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            storage: vec![0u8; capacity + 1].into_boxed_slice(),
            read: 0,
            peek: 0,
            write: 0,
        }
    }

    /// Maximum number of bytes the buffer can hold.
    pub fn capacity(&self) -> usize {
        self.storage.len() - 1
    }

    /// Bytes held and not yet consumed.
    pub fn len(&self) -> usize {
        self.distance(self.read, self.write)
    }

    pub fn is_empty(&self) -> bool {
        self.read == self.write
    }

    /// Bytes that can still be accepted by `put_in`.
    pub fn free(&self) -> usize {
        self.capacity() - self.len()
    }

    /// Bytes handed out by the last `peek_out` and not yet consumed.
    pub fn peeked(&self) -> usize {
        self.distance(self.read, self.peek)
    }

    /// Mark up to `n` previously peeked bytes as drained.
    ///
    /// Never advances past the peek cursor. Returns the number of bytes
    /// actually released.
    pub fn consume(&mut self, n: usize) -> usize {
        let n = n.min(self.peeked());
        self.read = self.wrap(self.read + n);
        n
    }

    /// Copy buffered bytes into `dst` without consuming them.
    ///
    /// Copying always starts at the read cursor, so bytes that were peeked
    /// but never consumed are offered again. The peek cursor is moved to the
    /// end of the copied region. Returns the number of bytes copied, which is
    /// 0 when the buffer is empty.
    pub fn peek_out(&mut self, dst: &mut [u8]) -> usize {
        let n = dst.len().min(self.len());
        if n == 0 {
            return 0;
        }

        let start = self.read;
        let first = n.min(self.storage.len() - start);
        dst[..first].copy_from_slice(&self.storage[start..start + first]);
        dst[first..n].copy_from_slice(&self.storage[..n - first]);

        self.peek = self.wrap(start + n);
        n
    }

    /// Append bytes from `src` at the write cursor.
    ///
    /// Stops when the buffer is full. Returns the number of bytes copied.
    pub fn put_in(&mut self, src: &[u8]) -> usize {
        let n = src.len().min(self.free());
        if n == 0 {
            return 0;
        }

        let start = self.write;
        let first = n.min(self.storage.len() - start);
        self.storage[start..start + first].copy_from_slice(&src[..first]);
        self.storage[..n - first].copy_from_slice(&src[first..n]);

        self.write = self.wrap(start + n);
        n
    }

    fn distance(&self, from: usize, to: usize) -> usize {
        if to >= from {
            to - from
        } else {
            self.storage.len() - from + to
        }
    }

    fn wrap(&self, pos: usize) -> usize {
        pos % self.storage.len()
    }
}

impl std::fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBuffer")
            .field("capacity", &self.capacity())
            .field("read", &self.read)
            .field("peek", &self.peek)
            .field("write", &self.write)
            .finish()
    }
}
