//! Shared per-connection state.
//!
//! [`ConnState`] is the one structure every task of a connection touches: the
//! application's `send`/`recv` calls, the background receiver and the
//! retransmit task.  Synchronisation is field-level:
//!
//! - lifecycle flags are independent `AtomicBool`s;
//! - `seq_num` lives inside the output window's mutex and `ack_num` inside the
//!   input buffer's mutex, so a counter and the structure it describes always
//!   change together;
//! - a `watch` channel acts as a change signal.  Every mutation that could
//!   unblock a waiter calls [`ConnState::notify`].
//!
//! ```text
//!             ┌──────────── ConnState ─────────────┐
//!  send() ───▶│ Mutex<OutputWindow>   (seq_num)    │◀─── receiver task (ACK)
//!  recv() ───▶│ Mutex<InputBuffer>    (ack_num)    │◀─── receiver task (DATA)
//!             │ AtomicBool × 4        (lifecycle)  │◀─── retransmit task
//!             │ watch::Sender<()>     (changed)    │
//!             └────────────────────────────────────┘
//! ```

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;

use crate::buffer::InputBuffer;
use crate::window::OutputWindow;

/// Coarse lifecycle derived from the flags, mostly for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Data may flow in both directions.
    Established,
    /// The peer sent FIN; no more data will arrive.
    PeerClosed,
    /// A packet ran out of retransmissions.
    Lost,
    /// Local teardown finished.
    Closed,
}

impl std::fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Lifecycle::Established => "established",
            Lifecycle::PeerClosed => "peer-closed",
            Lifecycle::Lost => "lost",
            Lifecycle::Closed => "closed",
        };
        f.write_str(s)
    }
}

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug)]
pub struct ConnState {
    peer: SocketAddr,

    requested_close: AtomicBool,
    received_fin_ack: AtomicBool,
    lost_connection: AtomicBool,
    closed: AtomicBool,

    output: Mutex<OutputWindow>,
    input: Mutex<InputBuffer>,

    changed: watch::Sender<()>,
}

impl ConnState {
    /// `isn` is our first sequence number, `peer_isn` the first offset we
    /// expect from the peer.
    pub fn new(
        peer: SocketAddr,
        isn: i32,
        peer_isn: i32,
        window_size: usize,
        input_buffer_size: usize,
    ) -> Self {
        let (changed, _) = watch::channel(());
        Self {
            peer,
            requested_close: AtomicBool::new(false),
            received_fin_ack: AtomicBool::new(false),
            lost_connection: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            output: Mutex::new(OutputWindow::new(isn, window_size)),
            input: Mutex::new(InputBuffer::new(peer_isn, input_buffer_size)),
            changed,
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// `true` when a datagram from `addr` belongs to this connection.
    pub fn matches_peer(&self, addr: SocketAddr) -> bool {
        addr == self.peer
    }

    // -----------------------------------------------------------------------
    // Lifecycle flags
    // -----------------------------------------------------------------------

    pub fn requested_close(&self) -> bool {
        self.requested_close.load(Ordering::Acquire)
    }

    pub fn set_requested_close(&self) {
        self.requested_close.store(true, Ordering::Release);
        self.notify();
    }

    pub fn received_fin_ack(&self) -> bool {
        self.received_fin_ack.load(Ordering::Acquire)
    }

    pub fn set_received_fin_ack(&self) {
        self.received_fin_ack.store(true, Ordering::Release);
        self.notify();
    }

    pub fn lost_connection(&self) -> bool {
        self.lost_connection.load(Ordering::Acquire)
    }

    /// Declare the connection lost and forget everything still in flight.
    pub fn mark_lost(&self) {
        self.lost_connection.store(true, Ordering::Release);
        lock(&self.output).clear();
        self.notify();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn set_closed(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify();
    }

    pub fn lifecycle(&self) -> Lifecycle {
        if self.is_closed() {
            Lifecycle::Closed
        } else if self.lost_connection() {
            Lifecycle::Lost
        } else if self.requested_close() {
            Lifecycle::PeerClosed
        } else {
            Lifecycle::Established
        }
    }

    // -----------------------------------------------------------------------
    // Window / buffer access
    // -----------------------------------------------------------------------

    /// Lock the output window (and with it `seq_num`).
    pub fn output(&self) -> MutexGuard<'_, OutputWindow> {
        lock(&self.output)
    }

    /// Lock the input buffer (and with it `ack_num`).
    pub fn input(&self) -> MutexGuard<'_, InputBuffer> {
        lock(&self.input)
    }

    pub fn seq_num(&self) -> i32 {
        self.output().next_seq()
    }

    pub fn ack_num(&self) -> i32 {
        self.input().ack_number()
    }

    // -----------------------------------------------------------------------
    // Change signal
    // -----------------------------------------------------------------------

    /// Wake every task blocked in [`ConnState::wait_until`].
    pub fn notify(&self) {
        self.changed.send_replace(());
    }

    /// Resolve once `ready` returns `true`.
    ///
    /// The subscription is taken before the first check, so a notification
    /// racing with the check is never missed.
    pub async fn wait_until(&self, mut ready: impl FnMut(&Self) -> bool) {
        let mut rx = self.changed.subscribe();
        while !ready(self) {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Packet;
    use std::sync::Arc;
    use std::time::Duration;

    fn state() -> ConnState {
        ConnState::new("127.0.0.1:9000".parse().unwrap(), 100, 500, 4, 4)
    }

    #[test]
    fn counters_follow_their_structures() {
        let s = state();
        assert_eq!(s.seq_num(), 100);
        assert_eq!(s.ack_num(), 500);

        s.output().push(b"abc".to_vec(), 500);
        assert_eq!(s.seq_num(), 103);

        s.input().offer(Packet::data(500, 0, b"xy".to_vec()));
        s.input().take_next();
        assert_eq!(s.ack_num(), 502);
    }

    #[test]
    fn peer_filter() {
        let s = state();
        assert!(s.matches_peer("127.0.0.1:9000".parse().unwrap()));
        assert!(!s.matches_peer("127.0.0.1:9001".parse().unwrap()));
        assert!(!s.matches_peer("127.0.0.2:9000".parse().unwrap()));
    }

    #[test]
    fn lifecycle_tracks_flags() {
        let s = state();
        assert_eq!(s.lifecycle(), Lifecycle::Established);
        s.set_requested_close();
        assert_eq!(s.lifecycle(), Lifecycle::PeerClosed);
        s.output().push(b"x".to_vec(), 0);
        s.mark_lost();
        assert_eq!(s.lifecycle(), Lifecycle::Lost);
        assert!(s.output().is_empty());
        s.set_closed();
        assert_eq!(s.lifecycle(), Lifecycle::Closed);
    }

    #[tokio::test]
    async fn wait_until_wakes_on_flag_change() {
        let s = Arc::new(state());
        let waiter = {
            let s = Arc::clone(&s);
            tokio::spawn(async move { s.wait_until(|s| s.received_fin_ack()).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        s.set_received_fin_ack();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter not woken")
            .unwrap();
    }

    #[tokio::test]
    async fn wait_until_returns_immediately_when_ready() {
        let s = state();
        s.set_closed();
        tokio::time::timeout(Duration::from_millis(100), s.wait_until(|s| s.is_closed()))
            .await
            .unwrap();
    }
}
