//! Tunable protocol parameters.
//!
//! Every endpoint carries one [`RdtConfig`].  Both peers must agree on the
//! wire format, but nothing here is negotiated: window sizes, retry budgets and
//! timeouts are purely local policy.

use std::time::Duration;

use crate::packet::HEADER_LEN;
use crate::socket::MAX_DATAGRAM;

/// Delivery discipline used by a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Discipline {
    /// One unacknowledged packet at a time.
    StopAndWait,
    /// Sliding window with per-packet acknowledgement and retransmission.
    #[default]
    SelectiveRepeat,
}

impl std::fmt::Display for Discipline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Discipline::StopAndWait => f.write_str("stop-and-wait"),
            Discipline::SelectiveRepeat => f.write_str("selective-repeat"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RdtConfig {
    /// Delivery engine built for every new connection.
    pub discipline: Discipline,
    /// Maximum number of unacknowledged packets in flight (selective repeat).
    pub window_size: usize,
    /// Maximum number of packets held for in-order delivery.
    pub input_buffer_size: usize,
    /// Retry budget for handshakes, retransmissions and FIN exchange.
    pub retries: u32,
    /// Time to wait for an acknowledgement before resending.
    pub resend_time: Duration,
    /// Largest datagram produced, header included.
    pub mss: usize,
}

impl Default for RdtConfig {
    fn default() -> Self {
        Self {
            discipline: Discipline::SelectiveRepeat,
            window_size: 8,
            input_buffer_size: 32,
            retries: 17,
            resend_time: Duration::from_millis(500),
            mss: 1500,
        }
    }
}

impl RdtConfig {
    pub fn with_discipline(mut self, discipline: Discipline) -> Self {
        self.discipline = discipline;
        self
    }

    /// Window size, clamped to at least one packet.
    pub fn with_window_size(mut self, window_size: usize) -> Self {
        self.window_size = window_size.max(1);
        self
    }

    pub fn with_input_buffer_size(mut self, input_buffer_size: usize) -> Self {
        self.input_buffer_size = input_buffer_size.max(1);
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_resend_time(mut self, resend_time: Duration) -> Self {
        self.resend_time = resend_time;
        self
    }

    /// MSS, clamped between a header plus one payload byte and the largest
    /// UDP datagram.
    pub fn with_mss(mut self, mss: usize) -> Self {
        self.mss = mss.clamp(HEADER_LEN + 1, MAX_DATAGRAM);
        self
    }

    /// Largest payload a single `send` call puts on the wire.
    pub fn max_payload(&self) -> usize {
        self.mss.min(MAX_DATAGRAM).saturating_sub(HEADER_LEN).max(1)
    }
}
