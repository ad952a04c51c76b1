//! The delivery-engine abstraction.
//!
//! A connection moves bytes through exactly one [`DeliveryEngine`], chosen
//! from [`RdtConfig::discipline`] when the connection is built:
//!
//! ```text
//!                 ┌────────── Engine ──────────┐
//!  Connection ───▶│ StopAndWait │ SelectiveRepeat │
//!                 └──────┬──────┴───────┬──────┘
//!                        │  Arc<ConnState> + Arc<Socket>
//!                        ▼
//!                    peer over UDP
//! ```
//!
//! The teardown coordinator only needs the engine-neutral primitives below
//! (`drain`, `send_fin`, `await_fin_ack`, `shutdown`), so FIN handling is
//! written once for both disciplines.

use std::sync::Arc;
use std::time::Duration;

use crate::config::{Discipline, RdtConfig};
use crate::error::Result;
use crate::selective_repeat::SelectiveRepeat;
use crate::socket::Socket;
use crate::state::ConnState;
use crate::stop_and_wait::StopAndWait;

/// One reliable-delivery discipline.
#[allow(async_fn_in_trait)]
pub trait DeliveryEngine {
    /// Transmit one message, returning how many bytes were accepted.
    async fn send(&self, payload: &[u8]) -> Result<usize>;

    /// Next in-order message; empty once the peer has closed.
    async fn recv(&self) -> Result<Vec<u8>>;

    /// Resolve when everything sent so far is acknowledged or the connection
    /// is lost.
    async fn drain(&self);

    /// Put one FIN on the wire.
    async fn send_fin(&self) -> Result<()>;

    /// Wait up to `within` for the peer's FIN-ACK.
    async fn await_fin_ack(&self, within: Duration) -> bool;

    /// Stop background work.  The shared state must already be marked closed.
    async fn shutdown(&self);
}

/// Static dispatch over the two disciplines.
#[derive(Debug)]
pub enum Engine {
    StopAndWait(StopAndWait),
    SelectiveRepeat(SelectiveRepeat),
}

impl Engine {
    /// Build the engine selected by `config.discipline`.  Selective-Repeat
    /// spawns its background tasks immediately.
    pub fn start(socket: Arc<Socket>, state: Arc<ConnState>, config: &RdtConfig) -> Self {
        match config.discipline {
            Discipline::StopAndWait => Engine::StopAndWait(StopAndWait::new(socket, state, config.clone())),
            Discipline::SelectiveRepeat => {
                Engine::SelectiveRepeat(SelectiveRepeat::spawn(socket, state, config.clone()))
            }
        }
    }

    pub fn discipline(&self) -> Discipline {
        match self {
            Engine::StopAndWait(_) => Discipline::StopAndWait,
            Engine::SelectiveRepeat(_) => Discipline::SelectiveRepeat,
        }
    }
}

impl DeliveryEngine for Engine {
    async fn send(&self, payload: &[u8]) -> Result<usize> {
        match self {
            Engine::StopAndWait(e) => e.send(payload).await,
            Engine::SelectiveRepeat(e) => e.send(payload).await,
        }
    }

    async fn recv(&self) -> Result<Vec<u8>> {
        match self {
            Engine::StopAndWait(e) => e.recv().await,
            Engine::SelectiveRepeat(e) => e.recv().await,
        }
    }

    async fn drain(&self) {
        match self {
            Engine::StopAndWait(e) => e.drain().await,
            Engine::SelectiveRepeat(e) => e.drain().await,
        }
    }

    async fn send_fin(&self) -> Result<()> {
        match self {
            Engine::StopAndWait(e) => e.send_fin().await,
            Engine::SelectiveRepeat(e) => e.send_fin().await,
        }
    }

    async fn await_fin_ack(&self, within: Duration) -> bool {
        match self {
            Engine::StopAndWait(e) => e.await_fin_ack(within).await,
            Engine::SelectiveRepeat(e) => e.await_fin_ack(within).await,
        }
    }

    async fn shutdown(&self) {
        match self {
            Engine::StopAndWait(e) => e.shutdown().await,
            Engine::SelectiveRepeat(e) => e.shutdown().await,
        }
    }
}
