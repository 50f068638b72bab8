//! Synthetic TCP segment construction.
//!
//! Everything here is a pure function from an observed IPv4+TCP segment to
//! owned wire bytes ready for injection. Builders hold no state and perform
//! no I/O; the caller decides transmission order and direction. Sequence and
//! acknowledgment arithmetic wraps modulo 2^32 per TCP sequence space.
//!
//! Two families of builders exist. The role-reversing family speaks as the
//! observed segment's destination back to its source: [`build_data`] injects
//! a payload continuing the stream the real destination would have sent, and
//! [`build_fin`] closes it immediately after that payload. [`build_reset`]
//! keeps the observed roles and tears down the path toward the original
//! destination. The replacement family ([`build_replacement_data`],
//! [`build_replacement_fin`]) keeps the observed roles and stream position,
//! substituting an intercepted segment in place.

use wire_types::checksum;
use wire_types::ip::ipv4::{self, Ipv4Fields, IPV4_LEN};
use wire_types::ip::IpProto;
use wire_types::prependable::Prependable;
use wire_types::tcp::{
    self, TcpFields, TCP_FLAG_ACK, TCP_FLAG_FIN, TCP_FLAG_PSH, TCP_FLAG_RST, TCP_LEN,
};

/// Failure to decode a captured packet. Any of these means the packet is
/// skipped; no segment is synthesized for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("packet shorter than the minimum IPv4 header")]
    TruncatedIp,
    #[error("not an IPv4 packet (version {0})")]
    NotIpv4(u8),
    #[error("not a TCP segment (protocol {0})")]
    NotTcp(u8),
    #[error("TCP header extends past the captured bytes")]
    TruncatedTcp,
}

/// Immutable decoded view over one captured IPv4+TCP packet.
///
/// Borrows the capture buffer; nothing is copied until a builder runs. The
/// view is created per received packet and discarded once synthesis decisions
/// for that packet are made.
#[derive(Debug, Clone, Copy)]
pub struct ObservedSegment<'a> {
    ip: &'a [u8],
    tcp: &'a [u8],
}

impl<'a> ObservedSegment<'a> {
    /// Validates header sizes and protocol discriminants over the captured
    /// bytes. The IPv4 total length field bounds the segment, so trailing
    /// capture padding is not mistaken for payload.
    pub fn parse(packet: &'a [u8]) -> Result<Self, ParseError> {
        if packet.len() < IPV4_LEN {
            return Err(ParseError::TruncatedIp);
        }
        let version = ipv4::version(packet);
        if version != 4 {
            return Err(ParseError::NotIpv4(version));
        }
        let ihl = ipv4::ihl(packet);
        if ihl < IPV4_LEN || packet.len() < ihl {
            return Err(ParseError::TruncatedIp);
        }
        let protocol = ipv4::protocol(packet);
        if protocol != IpProto::Tcp as u8 {
            return Err(ParseError::NotTcp(protocol));
        }

        let total_len = usize::from(ipv4::total_len(packet)).min(packet.len());
        if total_len < ihl + TCP_LEN {
            return Err(ParseError::TruncatedTcp);
        }
        let tcp = &packet[ihl..total_len];
        let thl = tcp::hdr_len(tcp);
        if thl < TCP_LEN || tcp.len() < thl {
            return Err(ParseError::TruncatedTcp);
        }

        Ok(Self {
            ip: &packet[..total_len],
            tcp,
        })
    }

    pub fn src_addr(&self) -> [u8; 4] {
        ipv4::src_addr(self.ip)
    }

    pub fn dst_addr(&self) -> [u8; 4] {
        ipv4::dst_addr(self.ip)
    }

    pub fn src_port(&self) -> u16 {
        tcp::src_port(self.tcp)
    }

    pub fn dst_port(&self) -> u16 {
        tcp::dst_port(self.tcp)
    }

    pub fn seq_num(&self) -> u32 {
        tcp::seq_num(self.tcp)
    }

    pub fn ack_seq(&self) -> u32 {
        tcp::ack_seq(self.tcp)
    }

    pub fn window(&self) -> u16 {
        tcp::window(self.tcp)
    }

    #[allow(dead_code)]
    pub fn flags(&self) -> u8 {
        tcp::tcp_flags(self.tcp)
    }

    /// The TCP payload: everything after the TCP header, bounded by the IPv4
    /// total length.
    pub fn payload(&self) -> &'a [u8] {
        &self.tcp[tcp::hdr_len(self.tcp)..]
    }

    fn payload_len(&self) -> u32 {
        self.payload().len() as u32
    }

    /// Recomputes the observed TCP checksum. Intercepted traffic is not
    /// guaranteed well-formed (checksum offload leaves it unfilled on the
    /// sending host), so a mismatch is a diagnostic, not a reason to skip
    /// synthesis.
    pub fn verify_checksum(&self) -> bool {
        let acc = checksum::pseudo_header_sum(
            IpProto::Tcp as u8,
            self.src_addr(),
            self.dst_addr(),
            self.tcp.len() as u16,
        );
        checksum::finalize(checksum::sum(self.tcp, acc)) == 0
    }
}

/// Zero-length ACK|RST addressed exactly as the observed sender→receiver,
/// with the observed sequence and acknowledgment numbers. Tears down the
/// path toward the original destination.
pub fn build_reset(obs: &ObservedSegment<'_>) -> Vec<u8> {
    emit(
        obs.src_addr(),
        obs.dst_addr(),
        &TcpFields {
            src_port: obs.src_port(),
            dst_port: obs.dst_port(),
            seq_num: obs.seq_num(),
            ack_seq: obs.ack_seq(),
            flags: TCP_FLAG_ACK | TCP_FLAG_RST,
            window: obs.window(),
        },
        &[],
    )
}

/// ACK|PSH segment carrying `payload`, with address and port roles reversed:
/// the synthesizer speaks as the observed destination back to the observed
/// source. Sequence continues the stream the real destination would have
/// sent (the observed acknowledgment number); the acknowledgment covers
/// everything the source has sent so far.
pub fn build_data(obs: &ObservedSegment<'_>, payload: &[u8]) -> Vec<u8> {
    emit(
        obs.dst_addr(),
        obs.src_addr(),
        &TcpFields {
            src_port: obs.dst_port(),
            dst_port: obs.src_port(),
            seq_num: obs.ack_seq(),
            ack_seq: obs.seq_num().wrapping_add(obs.payload_len()),
            flags: TCP_FLAG_ACK | TCP_FLAG_PSH,
            window: obs.window(),
        },
        payload,
    )
}

/// Zero-length ACK|FIN with the same reversed roles as [`build_data`],
/// positioned immediately after a `payload_len`-byte data segment in the
/// synthesized stream. Must follow [`build_data`] for the same observed
/// segment (or stand alone with `payload_len` 0 when no data is injected).
pub fn build_fin(obs: &ObservedSegment<'_>, payload_len: u32) -> Vec<u8> {
    emit(
        obs.dst_addr(),
        obs.src_addr(),
        &TcpFields {
            src_port: obs.dst_port(),
            dst_port: obs.src_port(),
            seq_num: obs.ack_seq().wrapping_add(payload_len),
            ack_seq: obs.seq_num().wrapping_add(obs.payload_len()),
            flags: TCP_FLAG_ACK | TCP_FLAG_FIN,
            window: obs.window(),
        },
        &[],
    )
}

/// ACK|PSH segment substituted in place of the observed one: same roles,
/// same sequence and acknowledgment numbers, new payload. Used when the
/// intercepted segment itself is the one being replaced (a captured server
/// response rewritten on its way to the client).
pub fn build_replacement_data(obs: &ObservedSegment<'_>, payload: &[u8]) -> Vec<u8> {
    emit(
        obs.src_addr(),
        obs.dst_addr(),
        &TcpFields {
            src_port: obs.src_port(),
            dst_port: obs.dst_port(),
            seq_num: obs.seq_num(),
            ack_seq: obs.ack_seq(),
            flags: TCP_FLAG_ACK | TCP_FLAG_PSH,
            window: obs.window(),
        },
        payload,
    )
}

/// Zero-length ACK|FIN closing the stream right after a `payload_len`-byte
/// replacement segment; same roles as the observed segment.
pub fn build_replacement_fin(obs: &ObservedSegment<'_>, payload_len: u32) -> Vec<u8> {
    emit(
        obs.src_addr(),
        obs.dst_addr(),
        &TcpFields {
            src_port: obs.src_port(),
            dst_port: obs.dst_port(),
            seq_num: obs.seq_num().wrapping_add(payload_len),
            ack_seq: obs.ack_seq(),
            flags: TCP_FLAG_ACK | TCP_FLAG_FIN,
            window: obs.window(),
        },
        &[],
    )
}

/// Assembles one segment innermost-out: payload and TCP header first, then
/// the TCP checksum over the pseudo-header, then the IPv4 header in front.
/// The buffer is sized exactly, so both reservations are infallible.
fn emit(src_addr: [u8; 4], dst_addr: [u8; 4], fields: &TcpFields, payload: &[u8]) -> Vec<u8> {
    let tcp_size = TCP_LEN + payload.len();
    let mut hdr = Prependable::new(IPV4_LEN + tcp_size);

    let seg = hdr
        .prepend(tcp_size)
        .expect("buffer sized for the TCP segment");
    tcp::encode(seg, fields);
    seg[TCP_LEN..].copy_from_slice(payload);

    let mut acc = checksum::pseudo_header_sum(IpProto::Tcp as u8, src_addr, dst_addr, tcp_size as u16);
    acc = checksum::sum(seg, acc);
    tcp::set_checksum(seg, checksum::finalize(acc));

    let ip = hdr
        .prepend(IPV4_LEN)
        .expect("buffer sized for the IPv4 header");
    ipv4::encode(
        ip,
        &Ipv4Fields {
            total_len: (IPV4_LEN + tcp_size) as u16,
            protocol: IpProto::Tcp,
            src_addr,
            dst_addr,
        },
    );

    hdr.into_view()
}
