//! Bounded table of connection slots.
//!
//! Provides O(1) slot acquisition and release on top of a slab, tracks the
//! readiness observed for every slot, and owns the acceptance throttle: while
//! every slot is occupied the event loop stops accepting new connections.

use crate::runtime::channel::SecureChannel;
use crate::runtime::connection::{Connection, Readiness, Step};
use slab::Slab;
use tracing::{debug, info};

/// An occupied slot.
struct Slot<C> {
    conn: Connection<C>,
    /// Readiness observed by the poller and not yet used up.
    ready: Readiness,
}

/// Registry of live connections with a fixed number of slots.
pub struct ConnectionRegistry<C> {
    slots: Slab<Slot<C>>,
    max_connections: usize,
    buffer_size: usize,
    throttled: bool,
}

impl<C: SecureChannel> ConnectionRegistry<C> {
    /// Create a registry with `max_connections` slots, each connection
    /// owning a buffer of `buffer_size` bytes.
    pub fn new(max_connections: usize, buffer_size: usize) -> Self {
        Self {
            slots: Slab::with_capacity(max_connections),
            max_connections,
            buffer_size,
            throttled: max_connections == 0,
        }
    }

    /// Key the next admitted connection will occupy, if any slot is free.
    pub fn vacant_key(&self) -> Option<usize> {
        self.has_free_slot().then(|| self.slots.vacant_key())
    }

    pub fn has_free_slot(&self) -> bool {
        self.slots.len() < self.max_connections
    }

    /// Whether new connections should currently be refused.
    pub fn throttled(&self) -> bool {
        self.throttled
    }

    /// Place a new connection in a free slot.
    ///
    /// Hands the channel back when the table is full; the caller is
    /// responsible for closing it.
    pub fn admit(&mut self, channel: C) -> Result<usize, C> {
        if !self.has_free_slot() {
            self.update_throttle();
            return Err(channel);
        }

        let key = self.slots.insert(Slot {
            conn: Connection::new(channel, self.buffer_size),
            ready: Readiness::EMPTY,
        });
        self.update_throttle();
        Ok(key)
    }

    /// Remove and close the connection in slot `key`.
    ///
    /// Returns the closed channel, or `None` if the slot was free.
    pub fn release(&mut self, key: usize) -> Option<C> {
        let slot = self.slots.try_remove(key)?;
        let state = slot.conn.state();
        let discarded = slot.conn.buffered();
        let channel = slot.conn.close();
        self.update_throttle();
        debug!(conn_id = key, ?state, discarded, "Connection closed");
        Some(channel)
    }

    /// Readiness recorded for slot `key`, for the poller to update.
    pub fn ready_mut(&mut self, key: usize) -> Option<&mut Readiness> {
        self.slots.get_mut(key).map(|slot| &mut slot.ready)
    }

    #[cfg(test)]
    pub fn get(&self, key: usize) -> Option<&Connection<C>> {
        self.slots.get(key).map(|slot| &slot.conn)
    }

    /// Whether any slot holds readiness it has not acted on yet.
    pub fn has_pending(&self) -> bool {
        self.slots
            .iter()
            .any(|(_, slot)| slot.conn.is_actionable(slot.ready))
    }

    /// Run the state machine once for every occupied slot, in slot order.
    ///
    /// Connections that finish are closed and their channels passed to
    /// `on_closed` along with the slot key.
    pub fn service_all(&mut self, scratch: &mut [u8], mut on_closed: impl FnMut(usize, C)) {
        for key in 0..self.max_connections {
            let step = match self.slots.get_mut(key) {
                Some(slot) => slot.conn.on_ready(&mut slot.ready, scratch),
                None => continue,
            };

            if step == Step::Close {
                if let Some(channel) = self.release(key) {
                    on_closed(key, channel);
                }
            }
        }
    }

    /// Number of occupied slots.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn update_throttle(&mut self) {
        let throttled = !self.has_free_slot();
        if throttled != self.throttled {
            if throttled {
                info!(connections = self.slots.len(), "Connection table full, pausing accepts");
            } else {
                info!(connections = self.slots.len(), "Slot freed, resuming accepts");
            }
            self.throttled = throttled;
        }
    }
}
