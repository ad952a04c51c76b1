//! Send-side sliding window.
//!
//! [`OutputWindow`] holds every transmitted-but-not-yet-trimmed data packet,
//! ordered by sequence number.  Unlike Go-Back-N, acknowledgements are
//! **selective**: an ACK marks exactly the entry it matches, and only a prefix
//! of acknowledged entries leaves the window.  A later packet's ACK never
//! frees the slot of an earlier, still-unacknowledged one.
//!
//! The window also owns `next_seq`, so building a packet, appending it and
//! advancing the sequence counter happen under one lock.
//!
//! This module only manages state; all socket I/O is the caller's
//! responsibility.

use std::collections::VecDeque;

use crate::packet::Packet;

/// `true` when offset `a` comes strictly before `b` in wrap-around space.
#[inline]
pub(crate) fn seq_lt(a: i32, b: i32) -> bool {
    a.wrapping_sub(b) < 0
}

/// A single transmitted segment occupying one slot of the window.
#[derive(Debug, Clone)]
pub struct WindowEntry {
    pub packet: Packet,
    pub acked: bool,
    /// Total number of times this segment has been transmitted.
    pub tx_count: u32,
}

/// Selective-repeat send-side state for one connection.
///
/// ```text
///  front (oldest)                          next_seq
///      │                                      │
///  ────┼──────────────────────────────────────┼──────▶ byte offsets
///      │ [ack?][ack?][ack?] ... up to capacity│
/// ```
#[derive(Debug)]
pub struct OutputWindow {
    next_seq: i32,
    capacity: usize,
    entries: VecDeque<WindowEntry>,
}

impl OutputWindow {
    /// `isn` is the first byte offset this side sends; `capacity` bounds the
    /// number of entries (≥ 1).
    pub fn new(isn: i32, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            next_seq: isn,
            capacity,
            entries: VecDeque::with_capacity(capacity),
        }
    }

    /// Byte offset the next data packet will carry.
    pub fn next_seq(&self) -> i32 {
        self.next_seq
    }

    /// `true` when there is room for at least one more packet.
    pub fn can_send(&self) -> bool {
        self.entries.len() < self.capacity
    }

    /// Number of entries currently held (acknowledged ones included until
    /// they reach the front).
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of entries still waiting for their ACK.
    pub fn unacked(&self) -> usize {
        self.entries.iter().filter(|e| !e.acked).count()
    }

    /// Build a data packet at `next_seq`, append it and advance `next_seq`.
    ///
    /// Returns `None` without side effects when the window is full.
    pub fn push(&mut self, payload: Vec<u8>, ack: i32) -> Option<Packet> {
        if !self.can_send() {
            return None;
        }
        let packet = Packet::data(self.next_seq, ack, payload);
        self.next_seq = packet.end_seq();
        self.entries.push_back(WindowEntry {
            packet: packet.clone(),
            acked: false,
            tx_count: 1,
        });
        Some(packet)
    }

    /// Process an inbound ACK.
    ///
    /// Marks the entry whose `seq + len == ack_num` as acknowledged, then pops
    /// the acknowledged prefix.  Returns the number of entries removed.
    pub fn acknowledge(&mut self, ack_num: i32) -> usize {
        for entry in self.entries.iter_mut().filter(|e| !e.acked) {
            if entry.packet.end_seq() == ack_num {
                entry.acked = true;
            }
        }

        let mut trimmed = 0;
        while self.entries.front().is_some_and(|e| e.acked) {
            self.entries.pop_front();
            trimmed += 1;
        }
        trimmed
    }

    /// `true` when the packet starting at `seq` was sent and is still
    /// waiting for its ACK.
    pub fn is_pending(&self, seq: i32) -> bool {
        self.entries.iter().any(|e| e.packet.header.seq == seq && !e.acked)
    }

    /// Fetch the still-unacknowledged packet starting at `seq` for
    /// retransmission.  Also returns how many times it will have been sent.
    pub fn retransmit(&mut self, seq: i32) -> Option<(Packet, u32)> {
        let entry = self
            .entries
            .iter_mut()
            .find(|e| e.packet.header.seq == seq && !e.acked)?;
        entry.tx_count += 1;
        Some((entry.packet.clone(), entry.tx_count))
    }

    /// Forget every in-flight packet (connection lost).
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Iterate over held entries from oldest to newest.
    #[cfg(test)]
    pub fn entries(&self) -> impl Iterator<Item = &WindowEntry> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_state() {
        let w = OutputWindow::new(100, 4);
        assert_eq!(w.next_seq(), 100);
        assert!(w.can_send());
        assert!(w.is_empty());
        assert_eq!(w.unacked(), 0);
    }

    #[test]
    fn push_advances_next_seq() {
        let mut w = OutputWindow::new(0, 4);
        let pkt = w.push(vec![1, 2, 3], 77).unwrap();

        assert_eq!(pkt.header.seq, 0);
        assert_eq!(pkt.header.ack, 77);
        assert!(!pkt.is_corrupt());
        assert_eq!(w.next_seq(), 3);
        assert_eq!(w.len(), 1);
    }

    #[test]
    fn full_window_refuses_push() {
        let mut w = OutputWindow::new(0, 2);
        assert!(w.push(vec![0; 5], 0).is_some());
        assert!(w.push(vec![0; 5], 0).is_some());

        assert!(!w.can_send());
        assert!(w.push(vec![0; 5], 0).is_none());
        assert_eq!(w.next_seq(), 10, "refused push must not consume offsets");
    }

    #[test]
    fn in_order_ack_trims_front() {
        let mut w = OutputWindow::new(0, 4);
        w.push(vec![0; 10], 0);

        assert_eq!(w.acknowledge(10), 1);
        assert!(w.is_empty());
    }

    #[test]
    fn later_ack_does_not_free_earlier_slot() {
        let mut w = OutputWindow::new(0, 3);
        for _ in 0..3 {
            w.push(vec![0; 5], 0);
        }

        // ACK for the second packet only: marked, but the front is still
        // unacknowledged so nothing leaves the window.
        assert_eq!(w.acknowledge(10), 0);
        assert_eq!(w.len(), 3);
        assert_eq!(w.unacked(), 2);
        assert!(!w.can_send());
        assert!(!w.is_pending(5));
        assert!(w.is_pending(0));

        // Front ACK releases both.
        assert_eq!(w.acknowledge(5), 2);
        assert_eq!(w.len(), 1);
        assert!(w.is_pending(10));
    }

    #[test]
    fn duplicate_and_unknown_acks_are_harmless() {
        let mut w = OutputWindow::new(0, 4);
        w.push(vec![0; 5], 0);

        assert_eq!(w.acknowledge(5), 1);
        assert_eq!(w.acknowledge(5), 0);
        assert_eq!(w.acknowledge(1000), 0);
        assert!(w.is_empty());
    }

    #[test]
    fn retransmit_returns_only_unacked_packets() {
        let mut w = OutputWindow::new(0, 4);
        w.push(b"aa".to_vec(), 0);
        w.push(b"bb".to_vec(), 0);
        w.acknowledge(4);

        assert!(w.retransmit(2).is_none());
        let (again, tx_count) = w.retransmit(0).unwrap();
        assert_eq!(again.payload, b"aa");
        assert_eq!(tx_count, 2);
        assert_eq!(w.retransmit(0).map(|(_, n)| n), Some(3));
        assert_eq!(w.entries().next().unwrap().tx_count, 3);
    }

    #[test]
    fn never_holds_more_than_capacity() {
        let mut w = OutputWindow::new(0, 3);
        for i in 0..50 {
            w.push(vec![0; 4], 0);
            assert!(w.len() <= 3);
            if i % 2 == 0 {
                let front = w.entries().next().unwrap().packet.end_seq();
                w.acknowledge(front);
            }
        }
    }

    #[test]
    fn seq_wrap_around() {
        let start = i32::MAX - 5;
        let mut w = OutputWindow::new(start, 4);
        w.push(vec![0; 10], 0);

        let expected_ack = start.wrapping_add(10);
        assert_eq!(w.next_seq(), expected_ack);
        assert_eq!(w.acknowledge(expected_ack), 1);
        assert!(seq_lt(start, expected_ack));
    }
}
