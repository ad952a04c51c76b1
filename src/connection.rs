//! A single reliable connection.
//!
//! A [`Connection`] is created either by an active open ([`Connection::connect`],
//! client side) or by the [`crate::listener::Listener`] when a new peer's SYN
//! arrives (server side).  Either way it owns:
//! - a dedicated UDP [`Socket`] talking to exactly one peer;
//! - the shared [`ConnState`] (counters, window, buffer, lifecycle flags);
//! - the [`Engine`] chosen by [`RdtConfig::discipline`].
//!
//! # Handshake
//!
//! ```text
//!  Client                                   Listener (port P)
//!    │ ── SYN seq=c ───────────────────────▶  │ new socket on port E
//!    │ ◀────────── SYN-ACK seq=s ack=c "E" ── │ (resent on repeated SYN)
//!    │                                        │
//!    │ ═══ data to port E, seq from c, ack from s ═══▶
//! ```
//!
//! There is no third packet: the client is established as soon as a SYN-ACK
//! arrives, and the server-side connection already exists when the SYN-ACK is
//! sent.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Weak};

use rand::Rng;
use tokio::time::Instant;

use crate::config::{Discipline, RdtConfig};
use crate::engine::{DeliveryEngine, Engine};
use crate::error::{RdtError, Result};
use crate::listener::Registry;
use crate::packet::Packet;
use crate::socket::Socket;
use crate::state::{ConnState, Lifecycle};
use crate::teardown::{self, Shutdown};

/// Random initial sequence number in `0..=1000`.
pub(crate) fn initial_seq() -> i32 {
    rand::rng().random_range(0..=1000)
}

#[derive(Debug)]
pub struct Connection {
    engine: Engine,
    state: Arc<ConnState>,
    local_addr: SocketAddr,
    config: RdtConfig,
    parent: Option<Weak<Registry<Connection>>>,
}

impl Connection {
    // -----------------------------------------------------------------------
    // Construction
    // -----------------------------------------------------------------------

    /// Wire up state and engine for a connection whose handshake is done.
    pub(crate) fn established(
        socket: Socket,
        peer: SocketAddr,
        isn: i32,
        peer_isn: i32,
        config: RdtConfig,
        parent: Option<Weak<Registry<Connection>>>,
    ) -> Self {
        let (window_size, input_buffer_size) = match config.discipline {
            Discipline::StopAndWait => (1, 1),
            Discipline::SelectiveRepeat => (config.window_size, config.input_buffer_size),
        };
        let local_addr = socket.local_addr;
        let state = Arc::new(ConnState::new(peer, isn, peer_isn, window_size, input_buffer_size));
        let engine = Engine::start(Arc::new(socket), Arc::clone(&state), &config);

        Self {
            engine,
            state,
            local_addr,
            config,
            parent,
        }
    }

    /// Active open towards a listener at `addr` from a fresh ephemeral socket.
    pub async fn connect(addr: SocketAddr, config: RdtConfig) -> Result<Self> {
        let local: SocketAddr = if addr.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = Socket::bind(local).await?;
        Self::connect_on(socket, addr, config).await
    }

    /// Active open using an already-bound socket (for example one with a
    /// simulator attached).
    ///
    /// Sends a SYN and waits `resend_time` for a SYN-ACK, up to `retries`
    /// times.  Only a SYN-ACK from the listener's IP that names a port is
    /// accepted; the connection then talks to that port.
    pub async fn connect_on(socket: Socket, addr: SocketAddr, config: RdtConfig) -> Result<Self> {
        let isn = initial_seq();
        let syn = Packet::syn(isn);
        let attempts = config.retries.max(1);

        for attempt in 1..=attempts {
            socket.send_to(&syn, addr).await?;
            log::debug!("[connect] → SYN seq={isn} to {addr} attempt={attempt}/{attempts}");

            let deadline = Instant::now() + config.resend_time;
            if let Some((server_isn, port)) = await_syn_ack(&socket, addr, deadline).await? {
                let peer = SocketAddr::new(addr.ip(), port);
                log::info!(
                    "[connect] connected {} → {peer} ({}, isn={isn}, peer isn={server_isn})",
                    socket.local_addr,
                    config.discipline
                );
                return Ok(Self::established(socket, peer, isn, server_isn, config, None));
            }
            log::debug!("[connect] no SYN-ACK from {addr} within {:?}", config.resend_time);
        }

        log::warn!("[connect] {addr} unreachable after {attempts} attempts");
        Err(RdtError::ServerUnreachable { attempts })
    }

    // -----------------------------------------------------------------------
    // Data transfer
    // -----------------------------------------------------------------------

    /// Send one message.  At most `mss - HEADER_LEN` bytes go out per call;
    /// the return value is the number of bytes accepted.
    pub async fn send(&self, data: &[u8]) -> Result<usize> {
        self.engine.send(data).await
    }

    /// Receive the next in-order message.  An empty vector means the peer
    /// closed its side.
    pub async fn recv(&self) -> Result<Vec<u8>> {
        self.engine.recv().await
    }

    // -----------------------------------------------------------------------
    // Teardown
    // -----------------------------------------------------------------------

    /// Wait for every sent message to be acknowledged, exchange FIN/FIN-ACK
    /// and release the connection.
    pub async fn close_sender(mut self) -> Shutdown {
        let parent = self.parent.take();
        teardown::close_sender(&self.engine, &self.state, &self.config, parent).await
    }

    /// Release the connection without sending FIN.  Used by the side that
    /// saw end-of-stream from `recv`.
    pub async fn close_receiver(mut self) {
        let parent = self.parent.take();
        teardown::close_receiver(&self.engine, &self.state, parent).await
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.state.peer()
    }

    pub fn discipline(&self) -> Discipline {
        self.engine.discipline()
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.state.lifecycle()
    }
}

impl Drop for Connection {
    /// A connection dropped without closing still leaves its listener's
    /// books, so a later SYN from the same peer starts a fresh handshake.
    fn drop(&mut self) {
        if let Some(registry) = self.parent.take().and_then(|weak| weak.upgrade()) {
            log::debug!("[close] connection to {} dropped without close", self.state.peer());
            registry.release(self.state.peer());
        }
    }
}

/// Wait until `deadline` for a valid SYN-ACK from `server`'s IP.
///
/// Returns the server's initial sequence number and the advertised port.
async fn await_syn_ack(socket: &Socket, server: SocketAddr, deadline: Instant) -> Result<Option<(i32, u16)>> {
    loop {
        let received = match tokio::time::timeout_at(deadline, socket.recv_from()).await {
            Ok(r) => r,
            Err(_elapsed) => return Ok(None),
        };
        let (packet, from) = match received {
            Ok(v) => v,
            Err(e) if e.is_malformed_datagram() => continue,
            Err(e) => return Err(e.into()),
        };

        if from.ip() != server.ip() {
            log::debug!("[connect] ignoring datagram from {from}");
            continue;
        }
        if packet.is_corrupt() || !packet.is_syn_ack() {
            log::debug!("[connect] ignoring {} from {from}", packet.kind());
            continue;
        }
        match packet.port() {
            Some(port) => {
                log::debug!("[connect] ← SYN-ACK seq={} port={port}", packet.header.seq);
                return Ok(Some((packet.header.seq, port)));
            }
            None => log::debug!("[connect] SYN-ACK from {from} carries no port"),
        }
    }
}
