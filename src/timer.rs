//! Retransmission deadline queue.
//!
//! Each Selective-Repeat connection keeps a single [`RetransmitQueue`]: a
//! min-heap of [`Deadline`]s ordered by firing time.  The retransmit task
//! sleeps until [`RetransmitQueue::next_deadline`], pops everything that has
//! expired and decides per entry whether to resend, reschedule or declare the
//! connection lost.
//!
//! ```text
//!   send() ──Deadline{seq, tries_left}──▶ mpsc ──▶ RetransmitQueue
//!                                                      │ pop_expired(now)
//!                                                      ▼
//!                                              resend + reschedule(tries-1)
//! ```
//!
//! The queue itself holds no packets; the output window stays the single
//! source of truth for what is still unacknowledged.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use tokio::time::Instant;

/// A scheduled retransmission check for the packet starting at `seq`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    pub at: Instant,
    pub seq: i32,
    /// Retransmissions still allowed before the connection is declared lost.
    pub tries_left: u32,
}

impl Ord for Deadline {
    fn cmp(&self, other: &Self) -> Ordering {
        self.at
            .cmp(&other.at)
            .then_with(|| self.seq.cmp(&other.seq))
            .then_with(|| self.tries_left.cmp(&other.tries_left))
    }
}

impl PartialOrd for Deadline {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
pub struct RetransmitQueue {
    heap: BinaryHeap<Reverse<Deadline>>,
}

impl RetransmitQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, deadline: Deadline) {
        self.heap.push(Reverse(deadline));
    }

    /// Firing time of the earliest pending deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|Reverse(d)| d.at)
    }

    /// Remove and return every deadline with `at <= now`, earliest first.
    pub fn pop_expired(&mut self, now: Instant) -> Vec<Deadline> {
        let mut expired = Vec::new();
        while let Some(Reverse(d)) = self.heap.peek() {
            if d.at > now {
                break;
            }
            if let Some(Reverse(d)) = self.heap.pop() {
                expired.push(d);
            }
        }
        expired
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.heap.len()
    }

    #[cfg(test)]
    fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}
