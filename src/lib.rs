//! `rdt-transport`: a reliable, connection-oriented byte transport over UDP.
//!
//! # Architecture
//!
//! ```text
//!  ┌──────────────┐  accept()   ┌──────────────────────────────┐
//!  │   Listener   │────────────▶│          Connection          │
//!  │ (SYN task,   │             │  send / recv / close_*       │
//!  │  backlog)    │             └──────┬───────────────────────┘
//!  └──────┬───────┘                    │ DeliveryEngine
//!         │                 ┌──────────┴───────────┐
//!         │                 │ StopAndWait          │ SelectiveRepeat
//!         │                 │ (half-duplex, no     │ (receiver task +
//!         │                 │  background tasks)   │  retransmit task)
//!         │                 └──────────┬───────────┘
//!         │                            │ ConnState (window, buffer, flags)
//!  ┌──────▼────────────────────────────▼──┐
//!  │ Socket (tokio UdpSocket + Simulator) │
//!  └──────────────────────────────────────┘
//! ```
//!
//! Each module has a single responsibility:
//! - [`packet`]            wire format, checksum, classification
//! - [`config`]            tunable parameters and the delivery discipline
//! - [`error`]             errors surfaced to applications
//! - [`socket`]            async UDP socket speaking packets
//! - [`simulator`]         seeded loss/duplication/corruption/delay for tests
//! - [`window`]            send-side selective window
//! - [`buffer`]            receive-side reorder buffer
//! - [`state`]             shared per-connection state and change signal
//! - [`timer`]             retransmission deadline queue
//! - [`engine`]            the delivery-engine trait and dispatch enum
//! - [`selective_repeat`]  sliding-window engine
//! - [`stop_and_wait`]     one-packet-in-flight engine
//! - [`connection`]        handshake (client side) and the public handle
//! - [`listener`]          handshake (server side), backlog, accept
//! - [`teardown`]          FIN/FIN-ACK exchange and resource release
//!
//! # Example
//!
//! ```no_run
//! # async fn demo() -> rdt_transport::Result<()> {
//! use rdt_transport::{Connection, Listener, RdtConfig};
//!
//! let listener = Listener::bind("127.0.0.1:9000".parse().unwrap(), RdtConfig::default()).await?;
//! listener.listen(8);
//!
//! let client = Connection::connect(listener.local_addr(), RdtConfig::default()).await?;
//! let (server_side, _peer) = listener.accept().await?;
//!
//! client.send(b"hello").await?;
//! assert_eq!(server_side.recv().await?, b"hello");
//!
//! client.close_sender().await;
//! assert!(server_side.recv().await?.is_empty());
//! server_side.close_receiver().await;
//! listener.close_server().await;
//! # Ok(())
//! # }
//! ```

pub mod buffer;
pub mod config;
pub mod connection;
pub mod engine;
pub mod error;
pub mod listener;
pub mod packet;
pub mod selective_repeat;
pub mod simulator;
pub mod socket;
pub mod state;
pub mod stop_and_wait;
pub mod teardown;
pub mod timer;
pub mod window;

pub use config::{Discipline, RdtConfig};
pub use connection::Connection;
pub use engine::DeliveryEngine;
pub use error::{RdtError, Result};
pub use listener::Listener;
pub use teardown::Shutdown;
