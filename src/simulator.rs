//! Fault-injecting network model for testing.
//!
//! Real networks drop, reorder, duplicate and corrupt datagrams.  To exercise
//! the reliability mechanisms without depending on actual network conditions,
//! a [`Simulator`] can be attached to a [`crate::socket::Socket`]; every
//! outbound packet is then run through [`Simulator::decide`]:
//!
//! | Fault       | Description                                          |
//! |-------------|------------------------------------------------------|
//! | Loss        | Drop a packet with probability `loss_rate`.          |
//! | Duplication | Deliver a packet twice.                              |
//! | Corruption  | Flip one bit outside the checksum field.             |
//! | Delay       | Hold a packet back by `delay`, letting later packets |
//! |             | overtake it.                                         |
//!
//! Besides the random model, tests can script exact faults
//! ("drop the next 3 FINs") with [`Simulator::drop_next`] and
//! [`Simulator::corrupt_next`].  Scripted rules take priority.
//!
//! The RNG is seeded so failures are reproducible.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::packet::{Packet, PacketKind, HEADER_LEN};

/// Configuration for the random fault model.
///
/// All probabilities are in the range `[0.0, 1.0]`.
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    /// Probability that any given packet is silently dropped.
    pub loss_rate: f64,
    /// Probability that a packet is sent twice.
    pub duplicate_rate: f64,
    /// Probability that a packet has one bit flipped.
    pub corrupt_rate: f64,
    /// Probability that a packet is delayed.
    pub delay_rate: f64,
    /// How long delayed packets are held back.
    pub delay: Duration,
    /// RNG seed.
    pub seed: u64,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        // No faults by default.
        Self {
            loss_rate: 0.0,
            duplicate_rate: 0.0,
            corrupt_rate: 0.0,
            delay_rate: 0.0,
            delay: Duration::ZERO,
            seed: 0,
        }
    }
}

impl SimulatorConfig {
    /// Independent loss of `loss_rate`, nothing else.
    pub fn lossy(loss_rate: f64, seed: u64) -> Self {
        Self {
            loss_rate,
            seed,
            ..Self::default()
        }
    }
}

/// What happens to one outbound packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    Deliver,
    Drop,
    Duplicate,
    Corrupt,
    Delay(Duration),
}

/// Counters of faults applied so far.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimulatorStats {
    pub delivered: u64,
    pub dropped: u64,
    pub duplicated: u64,
    pub corrupted: u64,
    pub delayed: u64,
}

#[derive(Debug, Default)]
struct Script {
    drop: HashMap<PacketKind, u32>,
    corrupt: HashMap<PacketKind, u32>,
}

/// A seeded fault model shared by every socket of one endpoint.
#[derive(Debug)]
pub struct Simulator {
    config: SimulatorConfig,
    rng: Mutex<StdRng>,
    script: Mutex<Script>,
    delivered: AtomicU64,
    dropped: AtomicU64,
    duplicated: AtomicU64,
    corrupted: AtomicU64,
    delayed: AtomicU64,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Simulator {
    pub fn new(config: SimulatorConfig) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        Self {
            config,
            rng: Mutex::new(rng),
            script: Mutex::new(Script::default()),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            duplicated: AtomicU64::new(0),
            corrupted: AtomicU64::new(0),
            delayed: AtomicU64::new(0),
        }
    }

    /// A simulator with no random faults; only scripted rules apply.
    pub fn passthrough() -> Self {
        Self::new(SimulatorConfig::default())
    }

    /// Drop the next `count` outbound packets of `kind`.
    pub fn drop_next(&self, kind: PacketKind, count: u32) {
        *lock(&self.script).drop.entry(kind).or_insert(0) += count;
    }

    /// Corrupt the next `count` outbound packets of `kind`.
    pub fn corrupt_next(&self, kind: PacketKind, count: u32) {
        *lock(&self.script).corrupt.entry(kind).or_insert(0) += count;
    }

    /// Decide the fate of `packet` and record it in the counters.
    pub fn decide(&self, packet: &Packet) -> Fault {
        let fault = self.scripted(packet.kind()).unwrap_or_else(|| self.roll());
        let counter = match fault {
            Fault::Deliver => &self.delivered,
            Fault::Drop => &self.dropped,
            Fault::Duplicate => &self.duplicated,
            Fault::Corrupt => &self.corrupted,
            Fault::Delay(_) => &self.delayed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        fault
    }

    fn scripted(&self, kind: PacketKind) -> Option<Fault> {
        let mut guard = lock(&self.script);
        let script = &mut *guard;
        for (rules, fault) in [(&mut script.drop, Fault::Drop), (&mut script.corrupt, Fault::Corrupt)] {
            if let Some(left) = rules.get_mut(&kind) {
                if *left > 0 {
                    *left -= 1;
                    return Some(fault);
                }
            }
        }
        None
    }

    fn roll(&self) -> Fault {
        let c = &self.config;
        let mut rng = lock(&self.rng);
        if rng.random_bool(c.loss_rate.clamp(0.0, 1.0)) {
            Fault::Drop
        } else if rng.random_bool(c.corrupt_rate.clamp(0.0, 1.0)) {
            Fault::Corrupt
        } else if rng.random_bool(c.duplicate_rate.clamp(0.0, 1.0)) {
            Fault::Duplicate
        } else if rng.random_bool(c.delay_rate.clamp(0.0, 1.0)) {
            Fault::Delay(c.delay)
        } else {
            Fault::Deliver
        }
    }

    /// Flip one bit of an encoded packet, never inside the checksum field.
    ///
    /// Payload bytes are preferred; header-only packets get a sequence number
    /// bit flipped instead.
    pub fn corrupt(&self, bytes: &mut [u8]) {
        let mut rng = lock(&self.rng);
        let index = if bytes.len() > HEADER_LEN {
            rng.random_range(HEADER_LEN..bytes.len())
        } else {
            rng.random_range(0..4)
        };
        if let Some(byte) = bytes.get_mut(index) {
            *byte ^= 1 << rng.random_range(0..8u32);
        }
    }

    pub fn stats(&self) -> SimulatorStats {
        SimulatorStats {
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            duplicated: self.duplicated.load(Ordering::Relaxed),
            corrupted: self.corrupted.load(Ordering::Relaxed),
            delayed: self.delayed.load(Ordering::Relaxed),
        }
    }
}
