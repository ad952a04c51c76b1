//! Stop-and-Wait delivery engine.
//!
//! Exactly one data packet is in flight.  There are no background tasks: every
//! read from the socket happens inside an application call, bounded by a
//! datagram-level timeout.
//!
//! ```text
//!  Sender                          Receiver
//!    │ ── DATA seq=x len=n ──────▶   │
//!    │          (timeout)            │   lost, resend
//!    │ ── DATA seq=x len=n ──────▶   │
//!    │ ◀────────── ACK ack=x+n ──    │
//! ```
//!
//! `send` and `recv` take the same I/O lock, so the connection is half-duplex.
//! Whatever arrives while one of them is reading (data, FIN, FIN-ACK) is
//! applied to the shared [`ConnState`] and picked up by the next call.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::config::RdtConfig;
use crate::engine::DeliveryEngine;
use crate::error::{RdtError, Result};
use crate::packet::{Packet, PacketKind};
use crate::socket::Socket;
use crate::state::ConnState;

#[derive(Debug)]
pub struct StopAndWait {
    socket: Arc<Socket>,
    state: Arc<ConnState>,
    config: RdtConfig,
    io: Mutex<()>,
}

impl StopAndWait {
    pub fn new(socket: Arc<Socket>, state: Arc<ConnState>, config: RdtConfig) -> Self {
        Self {
            socket,
            state,
            config,
            io: Mutex::new(()),
        }
    }

    /// Next checksum-valid packet from the peer, or `None` once `deadline`
    /// passes.
    async fn next_packet(&self, deadline: Option<Instant>) -> Result<Option<Packet>> {
        loop {
            let received = match deadline {
                Some(at) => match tokio::time::timeout_at(at, self.socket.recv_from()).await {
                    Ok(r) => r,
                    Err(_elapsed) => return Ok(None),
                },
                None => self.socket.recv_from().await,
            };

            match received {
                Ok((_, from)) if !self.state.matches_peer(from) => {
                    log::debug!("[sw] ignoring datagram from foreign address {from}");
                }
                Ok((packet, _)) if packet.is_corrupt() => {
                    log::debug!("[sw] ← corrupt {} seq={}; dropped", packet.kind(), packet.header.seq);
                }
                Ok((packet, _)) => return Ok(Some(packet)),
                Err(e) if e.is_malformed_datagram() => {
                    log::debug!("[sw] dropping malformed datagram: {e}");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Apply one inbound packet to the connection state.
    async fn on_packet(&self, packet: Packet) -> Result<()> {
        let peer = self.state.peer();
        match packet.kind() {
            PacketKind::Ack => {
                let ack = packet.header.ack;
                self.state.output().acknowledge(ack);
                log::debug!("[sw] ← ACK ack={ack}");
                self.state.notify();
            }
            PacketKind::Data => {
                let seq = packet.header.seq;
                let end = packet.end_seq();
                let outcome = self.state.input().offer(packet);
                log::debug!("[sw] ← DATA seq={seq} {outcome:?}");
                if outcome.should_ack() {
                    self.socket.send_to(&Packet::ack(end), peer).await?;
                }
            }
            PacketKind::Fin => {
                log::debug!("[sw] ← FIN; → FIN-ACK");
                self.socket.send_to(&Packet::fin_ack(), peer).await?;
                self.state.set_requested_close();
            }
            PacketKind::FinAck => {
                log::debug!("[sw] ← FIN-ACK");
                self.state.set_received_fin_ack();
            }
            PacketKind::Syn | PacketKind::SynAck => {
                log::debug!("[sw] ignoring stray {} from {peer}", packet.kind());
            }
        }
        Ok(())
    }
}

impl DeliveryEngine for StopAndWait {
    /// Transmit one packet and wait for its ACK, resending after every
    /// `resend_time` of silence.
    async fn send(&self, payload: &[u8]) -> Result<usize> {
        if payload.is_empty() {
            return Ok(0);
        }
        let payload = &payload[..payload.len().min(self.config.max_payload())];

        let _io = self.io.lock().await;
        if self.state.is_closed() {
            return Err(RdtError::Closed);
        }
        if self.state.lost_connection() {
            return Err(RdtError::LostConnection);
        }

        let ack = self.state.ack_num();
        let pushed = self.state.output().push(payload.to_vec(), ack);
        // The window only stays occupied when an earlier send gave up.
        let packet = pushed.ok_or(RdtError::LostConnection)?;
        let seq = packet.header.seq;
        let peer = self.state.peer();

        let attempts = self.config.retries.max(1);
        // A failed write is treated like a lost datagram: the packet already
        // holds the window slot and only an ACK or the retry budget frees it.
        for attempt in 1..=attempts {
            match self.socket.send_to(&packet, peer).await {
                Ok(()) => log::debug!("[sw] → DATA seq={seq} len={} attempt={attempt}/{attempts}", payload.len()),
                Err(e) => log::debug!("[sw] DATA seq={seq} attempt={attempt}/{attempts} failed: {e}"),
            }

            let deadline = Instant::now() + self.config.resend_time;
            loop {
                let inbound = match self.next_packet(Some(deadline)).await {
                    Ok(Some(inbound)) => inbound,
                    Ok(None) => break,
                    Err(e) => {
                        log::warn!("[sw] socket failed while waiting for ACK of seq={seq}: {e}");
                        self.state.mark_lost();
                        return Err(e);
                    }
                };
                if let Err(e) = self.on_packet(inbound).await {
                    log::debug!("[sw] reply while waiting for ACK failed: {e}");
                }
                if !self.state.output().is_pending(seq) {
                    return Ok(payload.len());
                }
            }
            log::debug!("[sw] timeout waiting for ACK of seq={seq}");
        }

        log::warn!("[sw] no ACK for seq={seq} after {attempts} attempts; connection to {peer} lost");
        self.state.mark_lost();
        Err(RdtError::LostConnection)
    }

    /// Wait for the packet at `ack_num`; empty once the peer sent FIN.
    async fn recv(&self) -> Result<Vec<u8>> {
        let _io = self.io.lock().await;
        loop {
            let next = self.state.input().take_next();
            if let Some(payload) = next {
                return Ok(payload);
            }
            if self.state.requested_close() || self.state.is_closed() {
                return Ok(Vec::new());
            }

            if let Some(inbound) = self.next_packet(None).await? {
                self.on_packet(inbound).await?;
            }
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
        let _io = self.io.lock().await;
        let deadline = Instant::now() + within;
        while !self.state.received_fin_ack() {
            match self.next_packet(Some(deadline)).await {
                Ok(Some(inbound)) => {
                    if let Err(e) = self.on_packet(inbound).await {
                        log::debug!("[sw] reply during FIN exchange failed: {e}");
                    }
                }
                Ok(None) => return false,
                Err(e) => {
                    log::debug!("[sw] read during FIN exchange failed: {e}");
                    return false;
                }
            }
        }
        true
    }

    async fn shutdown(&self) {
        self.state.notify();
    }
}
