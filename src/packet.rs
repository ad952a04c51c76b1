//! Wire-format definitions for protocol packets.
//!
//! Every datagram exchanged between peers is a [`Packet`].  This module is
//! responsible for:
//! - Defining the on-wire binary layout (header fields, flags, payload).
//! - Serialising a [`Packet`] into a byte buffer ready for transmission.
//! - Deserialising a raw byte slice back into a [`Packet`].
//! - Computing and verifying the internet checksum.
//!
//! No I/O happens here.
//!
//! # Wire format
//!
//! All multi-byte integers are **big-endian**.
//!
//! ```text
//!  0               1               2               3
//!  0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                        Sequence Number                        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                    Acknowledgment Number                      |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                           Checksum                            |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |      SYN      |      ACK      |      FIN      |  Payload ...  |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Total header size: [`HEADER_LEN`] = 15 bytes.
//! seq(4) + ack(4) + checksum(4) + syn(1) + ack(1) + fin(1)
//!
//! There is no length field: the payload is everything after the header.

use thiserror::Error;

/// Bit-flag constants for the in-memory `flags` header field.
///
/// On the wire each flag occupies its own byte (`0` or `1`).
pub mod flags {
    /// Synchronise sequence numbers (handshake initiation).
    pub const SYN: u8 = 0b0000_0001;
    /// Acknowledgement field is valid.
    pub const ACK: u8 = 0b0000_0010;
    /// Finish: sender has no more data to send.
    pub const FIN: u8 = 0b0000_0100;
}

/// Byte length of the fixed-size header on the wire.
pub const HEADER_LEN: usize = 15;

// Byte offsets of each field within the serialised header.
const OFF_SEQ: usize = 0;
const OFF_ACK: usize = 4;
const OFF_CHECKSUM: usize = 8;
const OFF_SYN: usize = 12;
const OFF_ACK_FLAG: usize = 13;
const OFF_FIN: usize = 14;

/// Fixed-size protocol header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    /// Byte offset of the first payload byte in the sender's stream.
    pub seq: i32,
    /// Next byte offset the sender expects from its peer.
    pub ack: i32,
    /// Internet checksum over every other header field and the payload.
    ///
    /// Only the low 16 bits are ever set by [`Packet::compute_checksum`].
    pub checksum: u32,
    /// Bitmask of [`flags`] constants.
    pub flags: u8,
}

/// How an inbound packet is handled by the connection machinery.
///
/// FIN-ACK and plain ACK both carry the ACK bit; the classifier keeps them
/// apart so a FIN-ACK is never mistaken for a data acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketKind {
    Syn,
    SynAck,
    Ack,
    Fin,
    FinAck,
    Data,
}

impl std::fmt::Display for PacketKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PacketKind::Syn => "SYN",
            PacketKind::SynAck => "SYN-ACK",
            PacketKind::Ack => "ACK",
            PacketKind::Fin => "FIN",
            PacketKind::FinAck => "FIN-ACK",
            PacketKind::Data => "DATA",
        };
        f.write_str(name)
    }
}

/// A complete protocol datagram: header + payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub header: Header,
    pub payload: Vec<u8>,
}

impl Packet {
    /// Build a packet and stamp it with a freshly computed checksum.
    pub fn new(seq: i32, ack: i32, flags: u8, payload: Vec<u8>) -> Self {
        let mut packet = Packet {
            header: Header {
                seq,
                ack,
                checksum: 0,
                flags,
            },
            payload,
        };
        packet.header.checksum = packet.compute_checksum();
        packet
    }

    /// Handshake initiation carrying the client's initial sequence number.
    pub fn syn(seq: i32) -> Self {
        Self::new(seq, 0, flags::SYN, Vec::new())
    }

    /// Handshake reply.  The payload is the server's per-connection port,
    /// written as decimal ASCII.
    pub fn syn_ack(seq: i32, ack: i32, port: u16) -> Self {
        Self::new(seq, ack, flags::SYN | flags::ACK, port.to_string().into_bytes())
    }

    /// Pure acknowledgement of every byte before `ack`.
    pub fn ack(ack: i32) -> Self {
        Self::new(0, ack, flags::ACK, Vec::new())
    }

    /// Data segment.
    pub fn data(seq: i32, ack: i32, payload: Vec<u8>) -> Self {
        Self::new(seq, ack, 0, payload)
    }

    pub fn fin(seq: i32, ack: i32) -> Self {
        Self::new(seq, ack, flags::FIN, Vec::new())
    }

    pub fn fin_ack() -> Self {
        Self::new(0, 0, flags::FIN | flags::ACK, Vec::new())
    }

    /// Port advertised in a SYN-ACK payload, if it parses.
    pub fn port(&self) -> Option<u16> {
        std::str::from_utf8(&self.payload).ok()?.trim().parse().ok()
    }

    fn has(&self, flag: u8) -> bool {
        self.header.flags & flag != 0
    }

    pub fn is_syn(&self) -> bool {
        self.has(flags::SYN) && !self.has(flags::ACK)
    }

    pub fn is_syn_ack(&self) -> bool {
        self.has(flags::SYN) && self.has(flags::ACK)
    }

    /// Plain ACK: ACK without FIN (and outside the handshake).
    pub fn is_ack(&self) -> bool {
        self.has(flags::ACK) && !self.has(flags::FIN) && !self.has(flags::SYN)
    }

    pub fn is_fin(&self) -> bool {
        self.has(flags::FIN) && !self.has(flags::ACK)
    }

    pub fn is_fin_ack(&self) -> bool {
        self.has(flags::FIN) && self.has(flags::ACK)
    }

    /// Classify this packet for dispatch.
    pub fn kind(&self) -> PacketKind {
        if self.is_syn_ack() {
            PacketKind::SynAck
        } else if self.is_syn() {
            PacketKind::Syn
        } else if self.is_fin_ack() {
            PacketKind::FinAck
        } else if self.is_fin() {
            PacketKind::Fin
        } else if self.is_ack() {
            PacketKind::Ack
        } else {
            PacketKind::Data
        }
    }

    /// Byte offset one past the last payload byte; the ACK number that
    /// acknowledges this packet.
    pub fn end_seq(&self) -> i32 {
        self.header.seq.wrapping_add(self.payload.len() as i32)
    }

    /// `true` when the transmitted checksum disagrees with the contents.
    pub fn is_corrupt(&self) -> bool {
        self.header.checksum != self.compute_checksum()
    }

    /// Internet checksum (RFC 1071) over every field except `checksum`.
    ///
    /// The header fields and the payload are each zero-padded to an even
    /// length before being folded into 16-bit words.
    pub fn compute_checksum(&self) -> u32 {
        let mut header = [0u8; HEADER_LEN - 4];
        header[0..4].copy_from_slice(&self.header.seq.to_be_bytes());
        header[4..8].copy_from_slice(&self.header.ack.to_be_bytes());
        header[8] = self.has(flags::SYN) as u8;
        header[9] = self.has(flags::ACK) as u8;
        header[10] = self.has(flags::FIN) as u8;

        let sum = ones_complement_sum(0, &header);
        let sum = ones_complement_sum(sum, &self.payload);
        u32::from(!fold(sum))
    }

    /// Serialise this packet into a newly allocated byte vector.
    ///
    /// The stored checksum is written as-is; build packets through
    /// [`Packet::new`] (or its helpers) to have it computed.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; HEADER_LEN + self.payload.len()];

        buf[OFF_SEQ..OFF_SEQ + 4].copy_from_slice(&self.header.seq.to_be_bytes());
        buf[OFF_ACK..OFF_ACK + 4].copy_from_slice(&self.header.ack.to_be_bytes());
        buf[OFF_CHECKSUM..OFF_CHECKSUM + 4].copy_from_slice(&self.header.checksum.to_be_bytes());
        buf[OFF_SYN] = self.has(flags::SYN) as u8;
        buf[OFF_ACK_FLAG] = self.has(flags::ACK) as u8;
        buf[OFF_FIN] = self.has(flags::FIN) as u8;
        buf[HEADER_LEN..].copy_from_slice(&self.payload);

        buf
    }

    /// Parse a [`Packet`] from a raw byte slice.
    ///
    /// The checksum is *not* verified here; callers check
    /// [`Packet::is_corrupt`] and treat corrupt packets as never received.
    pub fn decode(buf: &[u8]) -> Result<Self, PacketError> {
        if buf.len() < HEADER_LEN {
            return Err(PacketError::BufferTooShort(buf.len()));
        }

        let word = |off: usize| [buf[off], buf[off + 1], buf[off + 2], buf[off + 3]];

        let mut flag_bits = 0;
        if buf[OFF_SYN] != 0 {
            flag_bits |= flags::SYN;
        }
        if buf[OFF_ACK_FLAG] != 0 {
            flag_bits |= flags::ACK;
        }
        if buf[OFF_FIN] != 0 {
            flag_bits |= flags::FIN;
        }

        Ok(Packet {
            header: Header {
                seq: i32::from_be_bytes(word(OFF_SEQ)),
                ack: i32::from_be_bytes(word(OFF_ACK)),
                checksum: u32::from_be_bytes(word(OFF_CHECKSUM)),
                flags: flag_bits,
            },
            payload: buf[HEADER_LEN..].to_vec(),
        })
    }
}

/// Errors that can arise when parsing a raw datagram.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    /// Datagram shorter than the fixed header size.
    #[error("datagram of {0} bytes is too short to contain a header")]
    BufferTooShort(usize),
}

/// Add `data` to a running one's-complement sum as 16-bit big-endian words.
///
/// An odd trailing byte is padded with a zero byte on the right.
fn ones_complement_sum(mut sum: u32, data: &[u8]) -> u32 {
    let mut chunks = data.chunks_exact(2);
    for pair in &mut chunks {
        sum += u32::from(u16::from_be_bytes([pair[0], pair[1]]));
        sum = (sum & 0xffff) + (sum >> 16);
    }
    if let [last] = chunks.remainder() {
        sum += u32::from(*last) << 8;
        sum = (sum & 0xffff) + (sum >> 16);
    }
    sum
}

/// Fold the end-around carries back into 16 bits.
fn fold(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    sum as u16
}
