//! Errors surfaced to applications using the transport.
//!
//! Peer misbehaviour (corrupt, foreign or unexpected datagrams, SYNs beyond the
//! backlog) is never reported here; it is logged and dropped.  Only exhausted
//! local retry budgets and local I/O failures reach the caller.

use thiserror::Error;

use crate::socket::SocketError;

#[derive(Debug, Error)]
pub enum RdtError {
    /// The handshake got no SYN-ACK within the retry budget.
    #[error("server unreachable: no SYN-ACK after {attempts} attempts")]
    ServerUnreachable { attempts: u32 },

    /// A packet exhausted its retransmission budget; the connection cannot
    /// send any more data and should be torn down.
    #[error("lost connection: retransmission budget exhausted")]
    LostConnection,

    /// The local side already started tearing the connection down.
    #[error("connection is closed")]
    Closed,

    /// `accept` on a listener that is not (or no longer) listening.
    #[error("listener is not listening")]
    NotListening,

    #[error(transparent)]
    Socket(#[from] SocketError),
}

impl From<std::io::Error> for RdtError {
    fn from(e: std::io::Error) -> Self {
        Self::Socket(SocketError::Io(e))
    }
}

pub type Result<T> = std::result::Result<T, RdtError>;
