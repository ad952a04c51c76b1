//! Receive-side reorder buffer.
//!
//! [`InputBuffer`] holds data packets keyed by their starting byte offset
//! until the application consumes them in order.  It owns `rcv_nxt` (the
//! connection's `ack_num`), which advances only when the packet at exactly
//! that offset is taken out.
//!
//! Admission rules for an inbound, checksum-valid data packet:
//!
//! ```text
//!   seq before rcv_nxt, or already buffered  ──▶ Duplicate  (re-ACK)
//!   seq == rcv_nxt                           ──▶ Accepted   (even when full)
//!   new and buffer has room                  ──▶ Accepted
//!   otherwise                                ──▶ Discarded  (no ACK)
//! ```
//!
//! Accepting the next-expected packet regardless of capacity guarantees the
//! stream can always make progress once the application drains the buffer.

use std::collections::BTreeMap;

use crate::packet::Packet;
use crate::window::seq_lt;

/// Outcome of [`InputBuffer::offer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offer {
    /// Newly buffered; ACK it.
    Accepted,
    /// Already delivered or already buffered; ACK it again.
    Duplicate,
    /// No room and not the next-expected packet; drop silently.
    Discarded,
}

impl Offer {
    /// `true` when the sender should receive an ACK for this packet.
    pub fn should_ack(self) -> bool {
        !matches!(self, Offer::Discarded)
    }
}

#[derive(Debug)]
pub struct InputBuffer {
    rcv_nxt: i32,
    capacity: usize,
    packets: BTreeMap<i32, Packet>,
}

impl InputBuffer {
    /// `rcv_nxt` is the peer's initial sequence number.
    pub fn new(rcv_nxt: i32, capacity: usize) -> Self {
        Self {
            rcv_nxt,
            capacity: capacity.max(1),
            packets: BTreeMap::new(),
        }
    }

    /// Next byte offset expected from the peer (the value we ACK with).
    pub fn ack_number(&self) -> i32 {
        self.rcv_nxt
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    /// `true` when the packet at `rcv_nxt` is ready to be taken.
    pub fn has_next(&self) -> bool {
        self.packets.contains_key(&self.rcv_nxt)
    }

    /// Admit an inbound data packet.  The caller must have already rejected
    /// corrupt packets.
    pub fn offer(&mut self, packet: Packet) -> Offer {
        let seq = packet.header.seq;

        // Zero-length data would be indistinguishable from end-of-stream.
        if packet.payload.is_empty() {
            return Offer::Discarded;
        }
        if seq_lt(seq, self.rcv_nxt) || self.packets.contains_key(&seq) {
            return Offer::Duplicate;
        }
        if seq == self.rcv_nxt || self.packets.len() < self.capacity {
            self.packets.insert(seq, packet);
            return Offer::Accepted;
        }
        Offer::Discarded
    }

    /// Remove the packet at `rcv_nxt`, advance `rcv_nxt` past it and return
    /// its payload.
    pub fn take_next(&mut self) -> Option<Vec<u8>> {
        let packet = self.packets.remove(&self.rcv_nxt)?;
        self.rcv_nxt = packet.end_seq();
        Some(packet.payload)
    }
}
