//! Connection teardown.
//!
//! ```text
//!  close_sender                         peer
//!    │ drain output window                │
//!    │ ── FIN ─────────────────────────▶  │  (marks requested_close)
//!    │ ◀──────────────────── FIN-ACK ──   │
//!    │ closed; stop tasks; release socket │
//!    │ deregister from parent listener    │
//! ```
//!
//! The FIN exchange is retried up to `retries` times, `resend_time` apart.
//! An unresponsive peer never turns into an error: the connection is closed
//! locally anyway and the outcome says what happened.

use std::net::SocketAddr;
use std::sync::Weak;

use crate::config::RdtConfig;
use crate::connection::Connection;
use crate::engine::{DeliveryEngine, Engine};
use crate::listener::Registry;
use crate::state::ConnState;

/// How a [`Connection::close_sender`] call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shutdown {
    /// All data acknowledged and the peer confirmed our FIN.
    Graceful,
    /// All data acknowledged, but no FIN-ACK arrived within the retry budget.
    PeerUnresponsive,
    /// A data packet ran out of retransmissions; no FIN was sent.
    ConnectionLost,
}

impl std::fmt::Display for Shutdown {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Shutdown::Graceful => f.write_str("graceful"),
            Shutdown::PeerUnresponsive => f.write_str("peer unresponsive"),
            Shutdown::ConnectionLost => f.write_str("connection lost"),
        }
    }
}

pub(crate) async fn close_sender(
    engine: &Engine,
    state: &ConnState,
    config: &RdtConfig,
    parent: Option<Weak<Registry<Connection>>>,
) -> Shutdown {
    engine.drain().await;

    let outcome = if state.lost_connection() {
        log::debug!("[close] connection to {} already lost; skipping FIN", state.peer());
        Shutdown::ConnectionLost
    } else {
        exchange_fin(engine, state, config).await
    };

    release(engine, state, parent).await;
    log::info!("[close] connection to {} closed ({outcome})", state.peer());
    outcome
}

pub(crate) async fn close_receiver(engine: &Engine, state: &ConnState, parent: Option<Weak<Registry<Connection>>>) {
    release(engine, state, parent).await;
    log::info!("[close] receiver side of {} closed", state.peer());
}

async fn exchange_fin(engine: &Engine, state: &ConnState, config: &RdtConfig) -> Shutdown {
    let attempts = config.retries.max(1);
    for attempt in 1..=attempts {
        match engine.send_fin().await {
            Ok(()) => log::debug!("[close] → FIN to {} attempt={attempt}/{attempts}", state.peer()),
            Err(e) => log::debug!("[close] FIN attempt {attempt} failed: {e}"),
        }
        if engine.await_fin_ack(config.resend_time).await {
            return Shutdown::Graceful;
        }
    }
    log::warn!("[close] no FIN-ACK from {} after {attempts} attempts", state.peer());
    Shutdown::PeerUnresponsive
}

async fn release(engine: &Engine, state: &ConnState, parent: Option<Weak<Registry<Connection>>>) {
    state.set_requested_close();
    state.set_closed();
    engine.shutdown().await;
    deregister(parent, state.peer());
}

fn deregister(parent: Option<Weak<Registry<Connection>>>, peer: SocketAddr) {
    if let Some(registry) = parent.and_then(|weak| weak.upgrade()) {
        registry.release(peer);
    }
}
