//! Server-side connection multiplexer.
//!
//! A [`Listener`] owns the well-known socket.  [`Listener::listen`] spawns a
//! background task that answers SYNs; every new peer gets its own
//! [`Connection`] on a fresh ephemeral port, so after the handshake the
//! listening socket never sees that peer's data.
//!
//! ```text
//!                  ┌──────────── Registry ─────────────┐
//!  SYN (new) ────▶ │ unaccepted: FIFO (peer, SYN-ACK,  │ ── accept() ──▶ app
//!                  │                   Connection)     │        │
//!  SYN (repeat) ─▶ │ accepted:   peer → SYN-ACK        │ ◀──────┘
//!   resend SYN-ACK └───────────────────────────────────┘
//!                        ▲ release(peer) on close
//! ```
//!
//! A peer address lives in at most one of the two maps.  The backlog bounds
//! only `unaccepted`: while it is full, SYNs from new peers are dropped
//! without reply and the client simply retries.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::RdtConfig;
use crate::connection::{initial_seq, Connection};
use crate::error::{RdtError, Result};
use crate::packet::Packet;
use crate::socket::{Socket, SocketError};
use crate::state::lock;

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Pending<T> {
    peer: SocketAddr,
    syn_ack: Packet,
    conn: T,
}

/// Bookkeeping shared by the listen task, `accept` and closing connections.
///
/// Lock order is always `unaccepted` before `accepted`.
#[derive(Debug)]
pub struct Registry<T> {
    unaccepted: Mutex<VecDeque<Pending<T>>>,
    accepted: Mutex<HashMap<SocketAddr, Packet>>,
    listening: AtomicBool,
    changed: watch::Sender<()>,
}

impl<T> Registry<T> {
    pub(crate) fn new() -> Self {
        let (changed, _) = watch::channel(());
        Self {
            unaccepted: Mutex::new(VecDeque::new()),
            accepted: Mutex::new(HashMap::new()),
            listening: AtomicBool::new(false),
            changed,
        }
    }

    fn notify(&self) {
        self.changed.send_replace(());
    }

    fn is_listening(&self) -> bool {
        self.listening.load(Ordering::Acquire)
    }

    fn set_listening(&self, listening: bool) {
        self.listening.store(listening, Ordering::Release);
        self.notify();
    }

    /// The SYN-ACK already sent to `peer`, if it is known in either map.
    fn syn_ack_for(&self, peer: SocketAddr) -> Option<Packet> {
        let unaccepted = lock(&self.unaccepted);
        if let Some(pending) = unaccepted.iter().find(|p| p.peer == peer) {
            return Some(pending.syn_ack.clone());
        }
        lock(&self.accepted).get(&peer).cloned()
    }

    fn pending(&self) -> usize {
        lock(&self.unaccepted).len()
    }

    fn established(&self) -> usize {
        lock(&self.accepted).len()
    }

    fn register(&self, peer: SocketAddr, syn_ack: Packet, conn: T) {
        lock(&self.unaccepted).push_back(Pending { peer, syn_ack, conn });
        self.notify();
    }

    /// Move the oldest unaccepted connection into `accepted`.
    fn pop_accept(&self) -> Option<(SocketAddr, T)> {
        let mut unaccepted = lock(&self.unaccepted);
        let Pending { peer, syn_ack, conn } = unaccepted.pop_front()?;
        lock(&self.accepted).insert(peer, syn_ack);
        Some((peer, conn))
    }

    /// Forget `peer` entirely.  Called when its connection closes.
    pub(crate) fn release(&self, peer: SocketAddr) {
        let removed = {
            let mut unaccepted = lock(&self.unaccepted);
            let index = unaccepted.iter().position(|p| p.peer == peer);
            index.and_then(|i| unaccepted.remove(i))
        };
        lock(&self.accepted).remove(&peer);
        drop(removed);
        self.notify();
    }

    fn take_unaccepted(&self) -> Vec<(SocketAddr, T)> {
        lock(&self.unaccepted).drain(..).map(|p| (p.peer, p.conn)).collect()
    }
}

// ---------------------------------------------------------------------------
// Listener
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct Listener {
    socket: Arc<Socket>,
    config: RdtConfig,
    registry: Arc<Registry<Connection>>,
    task: Mutex<Option<JoinHandle<()>>>,
    stop: watch::Sender<bool>,
}

impl Listener {
    /// Bind the listening socket.  Call [`Listener::listen`] to start
    /// answering SYNs.
    pub async fn bind(addr: SocketAddr, config: RdtConfig) -> Result<Self> {
        let socket = Socket::bind(addr).await?;
        Ok(Self::from_socket(socket, config))
    }

    /// Wrap an already-bound socket.  Connections spawned by this listener
    /// inherit the socket's simulator.
    pub fn from_socket(socket: Socket, config: RdtConfig) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            socket: Arc::new(socket),
            config,
            registry: Arc::new(Registry::new()),
            task: Mutex::new(None),
            stop,
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr
    }

    /// Start the background listen task.  At most `backlog` handshakes wait
    /// for [`Listener::accept`] at any time.  Calling it again is a no-op.
    pub fn listen(&self, backlog: usize) {
        let mut task = lock(&self.task);
        if task.is_some() {
            return;
        }
        self.registry.set_listening(true);
        *task = Some(tokio::spawn(listen_loop(
            Arc::clone(&self.socket),
            Arc::clone(&self.registry),
            self.config.clone(),
            backlog,
            self.stop.subscribe(),
        )));
        log::info!("[listen] listening on {} (backlog {backlog})", self.socket.local_addr);
    }

    /// Wait for the oldest completed handshake and hand its connection out.
    pub async fn accept(&self) -> Result<(Connection, SocketAddr)> {
        let mut changed = self.registry.changed.subscribe();
        loop {
            if !self.registry.is_listening() {
                return Err(RdtError::NotListening);
            }
            if let Some((peer, conn)) = self.registry.pop_accept() {
                log::info!("[listen] accepted {peer} on {}", conn.local_addr());
                return Ok((conn, peer));
            }
            if changed.changed().await.is_err() {
                return Err(RdtError::NotListening);
            }
        }
    }

    /// Handshakes completed but not yet accepted.
    pub fn pending(&self) -> usize {
        self.registry.pending()
    }

    /// Accepted connections that have not closed yet.
    pub fn established(&self) -> usize {
        self.registry.established()
    }

    /// Stop the listen task and force-close every connection nobody accepted.
    /// Accepted connections are unaffected.
    pub async fn close_server(self) {
        self.registry.set_listening(false);
        let _ = self.stop.send(true);

        let task = lock(&self.task).take();
        if let Some(task) = task {
            let _ = task.await;
        }

        let orphans = self.registry.take_unaccepted();
        let count = orphans.len();
        for (_, conn) in orphans {
            conn.close_receiver().await;
        }
        log::info!(
            "[listen] closed listener on {} ({count} unaccepted connection(s) dropped)",
            self.socket.local_addr
        );
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.task).take() {
            task.abort();
        }
    }
}

// ---------------------------------------------------------------------------
// Listen task
// ---------------------------------------------------------------------------

async fn listen_loop(
    socket: Arc<Socket>,
    registry: Arc<Registry<Connection>>,
    config: RdtConfig,
    backlog: usize,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        let received = tokio::select! {
            r = socket.recv_from() => r,
            _ = stop.changed() => break,
        };

        let (packet, from) = match received {
            Ok(v) => v,
            Err(e) if e.is_malformed_datagram() => {
                log::debug!("[listen] dropping malformed datagram: {e}");
                continue;
            }
            Err(e) => {
                log::warn!("[listen] listening socket failed: {e}");
                break;
            }
        };

        if packet.is_corrupt() || !packet.is_syn() {
            log::debug!("[listen] ignoring {} from {from}", packet.kind());
            continue;
        }

        if let Some(syn_ack) = registry.syn_ack_for(from) {
            log::debug!("[listen] repeated SYN from {from}; resending SYN-ACK");
            if let Err(e) = socket.send_to(&syn_ack, from).await {
                log::debug!("[listen] failed to resend SYN-ACK to {from}: {e}");
            }
            continue;
        }

        if registry.pending() >= backlog {
            log::debug!("[listen] backlog full ({backlog}); dropping SYN from {from}");
            continue;
        }

        if let Err(e) = open_connection(&socket, &registry, &config, from, packet.header.seq).await {
            log::warn!("[listen] could not open connection for {from}: {e}");
        }
    }
    registry.set_listening(false);
    log::trace!("[listen] listen task on {} finished", socket.local_addr);
}

/// Create the per-peer connection, register it and answer with a SYN-ACK
/// naming its port.
async fn open_connection(
    listener: &Socket,
    registry: &Arc<Registry<Connection>>,
    config: &RdtConfig,
    peer: SocketAddr,
    client_isn: i32,
) -> std::result::Result<(), SocketError> {
    let mut socket = Socket::bind(SocketAddr::new(listener.local_addr.ip(), 0)).await?;
    if let Some(sim) = listener.simulator() {
        socket = socket.with_simulator(Arc::clone(sim));
    }

    let isn = initial_seq();
    let port = socket.local_addr.port();
    let syn_ack = Packet::syn_ack(isn, client_isn, port);
    let conn = Connection::established(
        socket,
        peer,
        isn,
        client_isn,
        config.clone(),
        Some(Arc::downgrade(registry)),
    );

    registry.register(peer, syn_ack.clone(), conn);
    log::info!("[listen] {peer} connected; serving on port {port}");

    listener.send_to(&syn_ack, peer).await?;
    log::debug!("[listen] → SYN-ACK seq={isn} ack={client_isn} port={port} to {peer}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn syn_ack(port: u16) -> Packet {
        Packet::syn_ack(1, 2, port)
    }

    #[test]
    fn accept_moves_oldest_entry_to_accepted() {
        let reg: Registry<&str> = Registry::new();
        reg.register(addr(1), syn_ack(5001), "first");
        reg.register(addr(2), syn_ack(5002), "second");
        assert_eq!(reg.pending(), 2);

        assert_eq!(reg.pop_accept(), Some((addr(1), "first")));
        assert_eq!(reg.pending(), 1);
        assert_eq!(reg.established(), 1);
    }

    #[test]
    fn repeated_syn_finds_original_syn_ack_in_either_map() {
        let reg: Registry<u8> = Registry::new();
        reg.register(addr(1), syn_ack(5001), 0);
        assert_eq!(reg.syn_ack_for(addr(1)).and_then(|p| p.port()), Some(5001));

        reg.pop_accept();
        assert_eq!(reg.syn_ack_for(addr(1)).and_then(|p| p.port()), Some(5001));
        assert!(reg.syn_ack_for(addr(9)).is_none());
    }

    #[test]
    fn release_forgets_peer() {
        let reg: Registry<u8> = Registry::new();
        reg.register(addr(1), syn_ack(5001), 0);
        reg.register(addr(2), syn_ack(5002), 0);
        reg.pop_accept();

        reg.release(addr(1));
        reg.release(addr(2));
        assert_eq!(reg.pending(), 0);
        assert_eq!(reg.established(), 0);
        assert!(reg.syn_ack_for(addr(1)).is_none());
    }

    #[test]
    fn take_unaccepted_empties_queue_in_order() {
        let reg: Registry<u8> = Registry::new();
        reg.register(addr(1), syn_ack(5001), 10);
        reg.register(addr(2), syn_ack(5002), 20);

        let taken: Vec<u8> = reg.take_unaccepted().into_iter().map(|(_, c)| c).collect();
        assert_eq!(taken, vec![10, 20]);
        assert!(reg.pop_accept().is_none());
    }

    #[tokio::test]
    async fn accept_before_listen_is_an_error() {
        let listener = Listener::bind(addr(0), RdtConfig::default()).await.unwrap();
        assert!(matches!(listener.accept().await, Err(RdtError::NotListening)));
    }
}
