//! Selective-Repeat delivery engine.
//!
//! # Tasks
//!
//! ```text
//!  Application            SelectiveRepeat                 background
//!      │ send(data) ──▶ OutputWindow.push ──Deadline──▶ retransmit task
//!      │                     │                                │ resend /
//!      │                     ▼                                │ mark lost
//!      │                  Socket ◀────────────────────────────┘
//!      │                     ▲
//!      │ recv() ◀── InputBuffer.take_next ◀── receiver task ◀── UDP
//! ```
//!
//! - The **receiver task** owns every read from the socket.  It applies ACKs
//!   to the output window, admits data into the input buffer (ACKing accepted
//!   and duplicate packets individually), answers FIN with FIN-ACK and records
//!   the peer's FIN-ACK.  It keeps running until the connection is closed
//!   locally, so a retransmitted FIN is always answered.
//! - The **retransmit task** keeps one [`RetransmitQueue`] for the whole
//!   connection.  A fired deadline resends the packet if it is still
//!   unacknowledged and reschedules it with one try fewer; at zero tries the
//!   connection is declared lost.
//!
//! Application calls never touch the socket for reading; they wait on the
//! shared [`ConnState`] change signal instead.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::buffer::Offer;
use crate::config::RdtConfig;
use crate::engine::DeliveryEngine;
use crate::error::{RdtError, Result};
use crate::packet::{Packet, PacketKind};
use crate::socket::Socket;
use crate::state::{lock, ConnState};
use crate::timer::{Deadline, RetransmitQueue};

#[derive(Debug)]
pub struct SelectiveRepeat {
    socket: Arc<Socket>,
    state: Arc<ConnState>,
    config: RdtConfig,
    timers: mpsc::UnboundedSender<Deadline>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SelectiveRepeat {
    /// Start the receiver and retransmit tasks for one connection.
    pub fn spawn(socket: Arc<Socket>, state: Arc<ConnState>, config: RdtConfig) -> Self {
        let (timers, scheduled) = mpsc::unbounded_channel();

        let receiver = tokio::spawn(receive_loop(Arc::clone(&socket), Arc::clone(&state)));
        let retransmitter = tokio::spawn(retransmit_loop(
            Arc::clone(&socket),
            Arc::clone(&state),
            scheduled,
            config.resend_time,
        ));

        Self {
            socket,
            state,
            config,
            timers,
            tasks: Mutex::new(vec![receiver, retransmitter]),
        }
    }
}

impl DeliveryEngine for SelectiveRepeat {
    /// Waits while the window is full, then transmits one data packet.
    async fn send(&self, payload: &[u8]) -> Result<usize> {
        if payload.is_empty() {
            return Ok(0);
        }
        let payload = &payload[..payload.len().min(self.config.max_payload())];

        let packet = loop {
            if self.state.is_closed() {
                return Err(RdtError::Closed);
            }
            if self.state.lost_connection() {
                return Err(RdtError::LostConnection);
            }

            let ack = self.state.ack_num();
            let pushed = self.state.output().push(payload.to_vec(), ack);
            if let Some(packet) = pushed {
                break packet;
            }

            self.state
                .wait_until(|s| s.output().can_send() || s.lost_connection() || s.is_closed())
                .await;
        };

        // The packet is in the window from here on, so it counts as accepted
        // even if this first write fails: the retransmit task owns it now.
        let _ = self.timers.send(Deadline {
            at: Instant::now() + self.config.resend_time,
            seq: packet.header.seq,
            tries_left: self.config.retries,
        });
        match self.socket.send_to(&packet, self.state.peer()).await {
            Ok(()) => log::debug!(
                "[sr] → DATA seq={} len={} ack={}",
                packet.header.seq,
                payload.len(),
                packet.header.ack
            ),
            Err(e) => log::debug!("[sr] first transmission of seq={} failed: {e}", packet.header.seq),
        }
        Ok(payload.len())
    }

    /// Waits for the next in-order packet or the peer's FIN.
    async fn recv(&self) -> Result<Vec<u8>> {
        loop {
            self.state
                .wait_until(|s| {
                    s.input().has_next() || s.requested_close() || s.is_closed() || s.lost_connection()
                })
                .await;

            let next = self.state.input().take_next();
            if let Some(payload) = next {
                return Ok(payload);
            }
            if self.state.requested_close() || self.state.is_closed() {
                return Ok(Vec::new());
            }
            if self.state.lost_connection() {
                return Err(RdtError::LostConnection);
            }
            // Another reader took the packet first.
        }
    }

    async fn drain(&self) {
        self.state
            .wait_until(|s| s.output().is_empty() || s.lost_connection() || s.is_closed())
            .await;
    }

    async fn send_fin(&self) -> Result<()> {
        let fin = Packet::fin(self.state.seq_num(), self.state.ack_num());
        self.socket.send_to(&fin, self.state.peer()).await?;
        Ok(())
    }

    async fn await_fin_ack(&self, within: Duration) -> bool {
        tokio::time::timeout(within, self.state.wait_until(|s| s.received_fin_ack()))
            .await
            .is_ok()
    }

    async fn shutdown(&self) {
        self.state.notify();
        let tasks = std::mem::take(&mut *lock(&self.tasks));
        for task in tasks {
            let _ = task.await;
        }
    }
}

impl Drop for SelectiveRepeat {
    fn drop(&mut self) {
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
    }
}

// ---------------------------------------------------------------------------
// Receiver task
// ---------------------------------------------------------------------------

async fn receive_loop(socket: Arc<Socket>, state: Arc<ConnState>) {
    loop {
        let received = tokio::select! {
            r = socket.recv_from() => r,
            _ = state.wait_until(|s| s.is_closed()) => break,
        };

        let (packet, from) = match received {
            Ok(v) => v,
            Err(e) if e.is_malformed_datagram() => {
                log::debug!("[sr] dropping malformed datagram: {e}");
                continue;
            }
            Err(e) => {
                log::warn!("[sr] receiver stopped: {e}");
                state.mark_lost();
                break;
            }
        };

        if !state.matches_peer(from) {
            log::debug!("[sr] ignoring datagram from foreign address {from}");
            continue;
        }
        if packet.is_corrupt() {
            log::debug!("[sr] ← corrupt {} seq={}; dropped", packet.kind(), packet.header.seq);
            continue;
        }

        on_packet(&socket, &state, packet).await;
    }
    log::trace!("[sr] receiver task for {} finished", state.peer());
}

async fn on_packet(socket: &Socket, state: &ConnState, packet: Packet) {
    let peer = state.peer();
    match packet.kind() {
        PacketKind::Ack => {
            let ack = packet.header.ack;
            let (trimmed, in_flight) = {
                let mut window = state.output();
                let trimmed = window.acknowledge(ack);
                (trimmed, window.unacked())
            };
            log::debug!("[sr] ← ACK ack={ack} (trimmed {trimmed}, {in_flight} in flight)");
            state.notify();
        }
        PacketKind::Data => {
            let seq = packet.header.seq;
            let len = packet.payload.len();
            let end = packet.end_seq();
            let (outcome, buffered) = {
                let mut input = state.input();
                let outcome = input.offer(packet);
                (outcome, input.len())
            };
            log::debug!("[sr] ← DATA seq={seq} len={len} {outcome:?} ({buffered} buffered)");

            if outcome.should_ack() {
                if let Err(e) = socket.send_to(&Packet::ack(end), peer).await {
                    log::debug!("[sr] failed to ACK seq={seq}: {e}");
                }
            }
            if outcome == Offer::Accepted {
                state.notify();
            }
        }
        PacketKind::Fin => {
            log::debug!("[sr] ← FIN; → FIN-ACK");
            if let Err(e) = socket.send_to(&Packet::fin_ack(), peer).await {
                log::debug!("[sr] failed to send FIN-ACK: {e}");
            }
            if !state.requested_close() {
                log::info!("[sr] {peer} closed its side of the connection");
            }
            state.set_requested_close();
        }
        PacketKind::FinAck => {
            log::debug!("[sr] ← FIN-ACK");
            state.set_received_fin_ack();
        }
        PacketKind::Syn | PacketKind::SynAck => {
            log::debug!("[sr] ignoring stray {} from {peer}", packet.kind());
        }
    }
}

// ---------------------------------------------------------------------------
// Retransmit task
// ---------------------------------------------------------------------------

async fn retransmit_loop(
    socket: Arc<Socket>,
    state: Arc<ConnState>,
    mut scheduled: mpsc::UnboundedReceiver<Deadline>,
    resend_time: Duration,
) {
    let mut queue = RetransmitQueue::new();

    loop {
        let next = queue.next_deadline();
        tokio::select! {
            _ = state.wait_until(|s| s.is_closed()) => break,
            deadline = scheduled.recv() => match deadline {
                Some(d) => queue.schedule(d),
                None => break,
            },
            _ = tokio::time::sleep_until(next.unwrap_or_else(Instant::now)), if next.is_some() => {
                for deadline in queue.pop_expired(Instant::now()) {
                    if let Some(again) = fire(&socket, &state, deadline, resend_time).await {
                        queue.schedule(again);
                    }
                }
            }
        }
    }
    log::trace!("[sr] retransmit task for {} finished", state.peer());
}

/// Handle one expired deadline, returning the follow-up deadline if the
/// packet was resent.
async fn fire(socket: &Socket, state: &ConnState, deadline: Deadline, resend_time: Duration) -> Option<Deadline> {
    if state.is_closed() || state.received_fin_ack() {
        return None;
    }

    let resend = {
        let mut window = state.output();
        if !window.is_pending(deadline.seq) {
            return None;
        }
        if deadline.tries_left == 0 {
            None
        } else {
            window.retransmit(deadline.seq)
        }
    };

    let Some((packet, tx_count)) = resend else {
        log::warn!(
            "[sr] seq={} exhausted its retransmissions; connection to {} lost",
            deadline.seq,
            state.peer()
        );
        state.mark_lost();
        return None;
    };

    log::debug!(
        "[sr] timeout, retransmitting seq={} (transmission {tx_count}, {} tries left)",
        deadline.seq,
        deadline.tries_left - 1
    );
    if let Err(e) = socket.send_to(&packet, state.peer()).await {
        log::debug!("[sr] retransmission of seq={} failed: {e}", deadline.seq);
    }

    Some(Deadline {
        at: Instant::now() + resend_time,
        seq: deadline.seq,
        tries_left: deadline.tries_left - 1,
    })
}
