//! Async UDP socket abstraction.
//!
//! [`Socket`] is a thin wrapper around `tokio::net::UdpSocket` that speaks
//! [`crate::packet::Packet`] instead of raw bytes.  All protocol logic lives
//! elsewhere; this module owns only byte I/O and, when a
//! [`Simulator`] is attached, the fault injection on the send path.

use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;

use crate::packet::{Packet, PacketError};
use crate::simulator::{Fault, Simulator};

/// Largest UDP payload that fits in one IPv4 datagram.
pub const MAX_DATAGRAM: usize = 65_507;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can arise from socket operations.
#[derive(Debug, Error)]
pub enum SocketError {
    /// Underlying I/O error from the OS.
    #[error("socket I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// The received datagram could not be decoded as a packet.
    #[error("packet decode error: {0}")]
    Packet(#[from] PacketError),
}

impl SocketError {
    /// `true` for errors caused by a single bad datagram; the socket itself
    /// is still usable.
    pub fn is_malformed_datagram(&self) -> bool {
        matches!(self, SocketError::Packet(_))
    }
}

// ---------------------------------------------------------------------------
// Socket
// ---------------------------------------------------------------------------

/// An async, packet-oriented UDP socket.
///
/// All methods are `&self` so the socket can be shared across tasks.
#[derive(Debug)]
pub struct Socket {
    /// Address this socket is bound to (filled in after OS assigns ephemeral port).
    pub local_addr: SocketAddr,
    inner: Arc<UdpSocket>,
    simulator: Option<Arc<Simulator>>,
    /// Receive buffer reused for every datagram.  Only one reader runs at a
    /// time per socket, so the lock is never contended in practice.
    recv_buf: Mutex<Vec<u8>>,
}

impl Socket {
    /// Bind a new socket to `local_addr`.
    ///
    /// Passing `0.0.0.0:0` lets the OS choose an ephemeral port.
    pub async fn bind(local_addr: SocketAddr) -> Result<Self, SocketError> {
        let inner = UdpSocket::bind(local_addr).await?;
        let local_addr = inner.local_addr()?;
        Ok(Self {
            local_addr,
            inner: Arc::new(inner),
            simulator: None,
            recv_buf: Mutex::new(vec![0u8; MAX_DATAGRAM]),
        })
    }

    /// Route every outbound packet through `simulator`.
    pub fn with_simulator(mut self, simulator: Arc<Simulator>) -> Self {
        self.simulator = Some(simulator);
        self
    }

    pub fn simulator(&self) -> Option<&Arc<Simulator>> {
        self.simulator.as_ref()
    }

    /// Encode `packet` and send it as a single UDP datagram to `dest`.
    ///
    /// Packets dropped by an attached simulator still report success, exactly
    /// like a datagram lost in the network.
    pub async fn send_to(&self, packet: &Packet, dest: SocketAddr) -> Result<(), SocketError> {
        let mut bytes = packet.encode();
        let Some(sim) = &self.simulator else {
            self.inner.send_to(&bytes, dest).await?;
            return Ok(());
        };

        match sim.decide(packet) {
            Fault::Deliver => {
                self.inner.send_to(&bytes, dest).await?;
            }
            Fault::Drop => {
                log::trace!("[sim] dropped {} seq={} ack={}", packet.kind(), packet.header.seq, packet.header.ack);
            }
            Fault::Duplicate => {
                self.inner.send_to(&bytes, dest).await?;
                self.inner.send_to(&bytes, dest).await?;
            }
            Fault::Corrupt => {
                sim.corrupt(&mut bytes);
                self.inner.send_to(&bytes, dest).await?;
            }
            Fault::Delay(delay) => {
                let inner = Arc::clone(&self.inner);
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = inner.send_to(&bytes, dest).await;
                });
            }
        }
        Ok(())
    }

    /// Receive the next datagram and decode it into a [`Packet`].
    ///
    /// Returns `(packet, sender_address)`.  Datagrams that fail to decode are
    /// returned as `Err`; the caller decides whether to retry.
    pub async fn recv_from(&self) -> Result<(Packet, SocketAddr), SocketError> {
        let mut buf = self.recv_buf.lock().await;
        let (n, addr) = self.inner.recv_from(&mut buf[..]).await?;
        let packet = Packet::decode(&buf[..n])?;
        Ok((packet, addr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::PacketKind;

    async fn loopback() -> Socket {
        Socket::bind("127.0.0.1:0".parse().unwrap()).await.unwrap()
    }

    #[tokio::test]
    async fn packets_cross_loopback() {
        let a = loopback().await;
        let b = loopback().await;

        let pkt = Packet::data(1, 2, b"over udp".to_vec());
        a.send_to(&pkt, b.local_addr).await.unwrap();

        let (got, from) = b.recv_from().await.unwrap();
        assert_eq!(got, pkt);
        assert_eq!(from, a.local_addr);
    }

    #[tokio::test]
    async fn scripted_drop_never_reaches_peer() {
        let sim = Arc::new(Simulator::passthrough());
        sim.drop_next(PacketKind::Ack, 1);
        let a = loopback().await.with_simulator(Arc::clone(&sim));
        let b = loopback().await;

        a.send_to(&Packet::ack(1), b.local_addr).await.unwrap();
        a.send_to(&Packet::ack(2), b.local_addr).await.unwrap();

        let (got, _) = b.recv_from().await.unwrap();
        assert_eq!(got.header.ack, 2);
        assert_eq!(sim.stats().dropped, 1);
    }

    #[tokio::test]
    async fn receive_buffer_is_reused_across_datagrams() {
        let a = loopback().await;
        let b = loopback().await;

        let long = Packet::data(0, 0, vec![9u8; 4096]);
        let short = Packet::data(4096, 0, b"tail".to_vec());
        a.send_to(&long, b.local_addr).await.unwrap();
        a.send_to(&short, b.local_addr).await.unwrap();

        let (first, _) = b.recv_from().await.unwrap();
        let (second, _) = b.recv_from().await.unwrap();
        assert_eq!(first, long);
        assert_eq!(second, short, "stale bytes from the longer datagram must not leak");
        assert!(!second.is_corrupt());
        assert_eq!(b.recv_buf.lock().await.len(), MAX_DATAGRAM);
    }

    #[tokio::test]
    async fn largest_datagram_crosses_loopback() {
        let a = loopback().await;
        let b = loopback().await;

        let pkt = Packet::data(0, 0, vec![1u8; MAX_DATAGRAM - crate::packet::HEADER_LEN]);
        a.send_to(&pkt, b.local_addr).await.unwrap();
        let (got, _) = b.recv_from().await.unwrap();
        assert_eq!(got.payload.len(), MAX_DATAGRAM - crate::packet::HEADER_LEN);
    }

    #[tokio::test]
    async fn runt_datagram_is_a_decode_error() {
        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b = loopback().await;
        a.send_to(&[1, 2, 3], b.local_addr).await.unwrap();

        let err = b.recv_from().await.unwrap_err();
        assert!(err.is_malformed_datagram());
    }
}
