//! Packet diversion boundary.
//!
//! The synthesis core never touches a socket; it consumes observed packets
//! from, and hands synthesized ones back to, an implementation of [`Divert`].
//! One packet per call, blocking, with explicit per-packet [`Direction`]
//! metadata — direction is always passed as a value, never mutated on a
//! shared handle.

use serde::{Deserialize, Serialize};

#[cfg(target_os = "linux")]
pub mod afpacket;

/// Observed or intended traffic direction relative to this host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    /// The opposite direction; a synthesized reply travels against the
    /// capture direction of the segment it answers.
    pub fn reversed(self) -> Self {
        match self {
            Direction::Inbound => Direction::Outbound,
            Direction::Outbound => Direction::Inbound,
        }
    }
}

/// Per-packet capture metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketMeta {
    pub direction: Direction,
    /// Interface the packet was observed on (0 when unknown).
    pub if_index: u32,
}

/// Transport failure at the diversion boundary.
///
/// Transient errors abandon only the current packet; the capture loop logs
/// them and keeps running. Fatal errors mean the handle itself is gone and
/// the run must end.
#[derive(Debug, thiserror::Error)]
pub enum DivertError {
    #[error("transient capture I/O error: {0}")]
    Io(#[source] std::io::Error),
    #[error("capture handle unusable: {0}")]
    Closed(#[source] std::io::Error),
}

impl DivertError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, DivertError::Closed(_))
    }
}

/// Blocking one-packet-at-a-time capture and injection.
pub trait Divert {
    /// Receives one raw IPv4 packet into `buf`, returning its length and
    /// capture metadata.
    fn recv(&mut self, buf: &mut [u8]) -> Result<(usize, PacketMeta), DivertError>;

    /// Injects one raw IPv4 packet. `meta.direction` states which way the
    /// packet should appear to travel; synthesized replies are tagged with
    /// the direction opposite their trigger's capture.
    fn send(&mut self, packet: &[u8], meta: PacketMeta) -> Result<(), DivertError>;
}

/// Predicate over packet metadata selecting which captured packets the
/// engine acts on. The structured equivalent of a capture filter expression
/// like `outbound && !loopback && ip && tcp.PayloadLength > 0`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterSpec {
    /// Only admit packets captured in this direction; `None` admits both.
    pub direction: Option<Direction>,
    pub allow_loopback: bool,
    pub min_payload_len: u16,
}

impl Default for FilterSpec {
    fn default() -> Self {
        FilterSpec {
            direction: None,
            allow_loopback: false,
            min_payload_len: 1,
        }
    }
}

impl FilterSpec {
    pub fn admits(&self, direction: Direction, loopback: bool, payload_len: usize) -> bool {
        if let Some(wanted) = self.direction {
            if direction != wanted {
                return false;
            }
        }
        if loopback && !self.allow_loopback {
            return false;
        }
        payload_len >= usize::from(self.min_payload_len)
    }
}
