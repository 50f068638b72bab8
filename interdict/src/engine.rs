//! The capture → classify → synthesize → inject loop.
//!
//! One policy runs per process. The request policy answers intercepted HTTP
//! requests in the server's place: RST toward the real server, then the
//! configured response and a FIN back toward the client. The response policy
//! substitutes intercepted HTTP responses in place on their way to the
//! client. Passthrough only observes, logging matches and re-injecting every
//! packet unmodified.
//!
//! The loop owns a single receive buffer reused across iterations; each
//! synthesized segment owns its bytes, so nothing aliases the scratch buffer
//! once a send is issued.

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::classify::{classify, Classification};
use crate::divert::{Direction, Divert, DivertError, FilterSpec, PacketMeta};
use crate::synth::{
    build_data, build_fin, build_replacement_data, build_replacement_fin, build_reset,
    ObservedSegment,
};

/// Largest possible IPv4 packet; the receive scratch buffer is sized for it.
const MAX_PACKET_LEN: usize = 65535;

/// Which interception policy the engine runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Answer intercepted HTTP requests in the server's place.
    Request,
    /// Substitute intercepted HTTP responses in place.
    Response,
    /// Observe and re-inject only.
    Passthrough,
}

impl Mode {
    /// Capture direction a policy listens to when the filter does not pin
    /// one: requests leave this host, responses arrive at it.
    pub fn default_direction(self) -> Option<Direction> {
        match self {
            Mode::Request => Some(Direction::Outbound),
            Mode::Response => Some(Direction::Inbound),
            Mode::Passthrough => None,
        }
    }
}

/// Renders the HTTP/1.1 response injected in place of real traffic.
pub fn render_response(body: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 200 OK\r\n\
         Content-Type: text/plain\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {}",
        body.len(),
        body
    )
    .into_bytes()
}

pub struct Engine<D> {
    divert: D,
    mode: Mode,
    filter: FilterSpec,
    response: Vec<u8>,
}

impl<D: Divert> Engine<D> {
    pub fn new(divert: D, mode: Mode, mut filter: FilterSpec, body: &str) -> Self {
        filter.direction = filter.direction.or(mode.default_direction());
        Engine {
            divert,
            mode,
            filter,
            response: render_response(body),
        }
    }

    /// Runs until the diversion handle fails fatally. Transient errors and
    /// malformed packets abandon only the current iteration.
    pub fn run(&mut self) -> Result<(), DivertError> {
        let mut buf = vec![0u8; MAX_PACKET_LEN];
        loop {
            let (len, meta) = match self.divert.recv(&mut buf) {
                Ok(recv) => recv,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(event_name = "engine.recv_failed", error = %e, "skipping packet");
                    continue;
                }
            };

            self.handle_packet(&buf[..len], meta)?;
        }
    }

    fn handle_packet(&mut self, packet: &[u8], meta: PacketMeta) -> Result<(), DivertError> {
        let obs = match ObservedSegment::parse(packet) {
            Ok(obs) => obs,
            Err(e) => {
                debug!(event_name = "engine.skip_packet", reason = %e, "not an IPv4/TCP segment");
                if self.mode == Mode::Passthrough {
                    return self.send_logged(packet, meta, "forward");
                }
                return Ok(());
            }
        };

        let loopback = obs.src_addr()[0] == 127 || obs.dst_addr()[0] == 127;
        if !self
            .filter
            .admits(meta.direction, loopback, obs.payload().len())
        {
            if self.mode == Mode::Passthrough {
                return self.send_logged(packet, meta, "forward");
            }
            return Ok(());
        }

        match self.mode {
            Mode::Passthrough => {
                let class = classify(obs.payload());
                if class != Classification::Unknown {
                    info!(
                        event_name = "engine.http_detected",
                        class = ?class,
                        direction = ?meta.direction,
                        src_port = obs.src_port(),
                        dst_port = obs.dst_port(),
                        "HTTP boundary observed"
                    );
                }
                self.send_logged(packet, meta, "forward")
            }
            Mode::Request => {
                if classify(obs.payload()) != Classification::Request {
                    return Ok(());
                }
                self.intercept_request(&obs, meta)
            }
            Mode::Response => {
                if classify(obs.payload()) != Classification::Response {
                    return Ok(());
                }
                self.intercept_response(&obs, meta)
            }
        }
    }

    /// Tears down the intercepted connection toward the server and answers
    /// the client as if the server had replied.
    fn intercept_request(
        &mut self,
        obs: &ObservedSegment<'_>,
        meta: PacketMeta,
    ) -> Result<(), DivertError> {
        info!(
            event_name = "engine.request_intercepted",
            src_port = obs.src_port(),
            dst_port = obs.dst_port(),
            payload_len = obs.payload().len(),
            if_index = meta.if_index,
            "answering HTTP request locally"
        );
        if !obs.verify_checksum() {
            debug!(
                event_name = "engine.input_checksum_mismatch",
                "observed segment fails checksum verification, synthesizing anyway"
            );
        }

        let rst = build_reset(obs);
        self.send_logged(&rst, meta, "rst")?;

        let reply_meta = PacketMeta {
            direction: meta.direction.reversed(),
            ..meta
        };
        let payload_len = self.response.len() as u32;
        if payload_len > 0 {
            let data = build_data(obs, &self.response);
            self.send_logged(&data, reply_meta, "data")?;
        }
        let fin = build_fin(obs, payload_len);
        self.send_logged(&fin, reply_meta, "fin")
    }

    /// Replaces the intercepted response in the server→client stream.
    fn intercept_response(
        &mut self,
        obs: &ObservedSegment<'_>,
        meta: PacketMeta,
    ) -> Result<(), DivertError> {
        info!(
            event_name = "engine.response_intercepted",
            src_port = obs.src_port(),
            dst_port = obs.dst_port(),
            payload_len = obs.payload().len(),
            if_index = meta.if_index,
            "substituting HTTP response"
        );
        if !obs.verify_checksum() {
            debug!(
                event_name = "engine.input_checksum_mismatch",
                "observed segment fails checksum verification, synthesizing anyway"
            );
        }

        let payload_len = self.response.len() as u32;
        if payload_len > 0 {
            let data = build_replacement_data(obs, &self.response);
            self.send_logged(&data, meta, "data")?;
        }
        let fin = build_replacement_fin(obs, payload_len);
        self.send_logged(&fin, meta, "fin")
    }

    /// Sends one segment, logging transient failures and propagating fatal
    /// ones. Injection is at-most-once; a failed send is not retried.
    fn send_logged(
        &mut self,
        packet: &[u8],
        meta: PacketMeta,
        what: &str,
    ) -> Result<(), DivertError> {
        match self.divert.send(packet, meta) {
            Ok(()) => Ok(()),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                warn!(event_name = "engine.send_failed", segment = what, error = %e, "injection failed");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::io;

    use super::*;
    use wire_types::ip::ipv4;
    use wire_types::tcp::{TCP_FLAG_ACK, TCP_FLAG_FIN, TCP_FLAG_PSH, TCP_FLAG_RST};

    const CLIENT: [u8; 4] = [192, 168, 0, 10];
    const SERVER: [u8; 4] = [93, 184, 216, 34];

    struct MockDivert {
        incoming: VecDeque<(Vec<u8>, PacketMeta)>,
        sent: Vec<(Vec<u8>, PacketMeta)>,
    }

    impl MockDivert {
        fn with_packets(packets: Vec<(Vec<u8>, PacketMeta)>) -> Self {
            MockDivert {
                incoming: packets.into(),
                sent: Vec::new(),
            }
        }
    }

    impl Divert for MockDivert {
        fn recv(&mut self, buf: &mut [u8]) -> Result<(usize, PacketMeta), DivertError> {
            match self.incoming.pop_front() {
                Some((packet, meta)) => {
                    buf[..packet.len()].copy_from_slice(&packet);
                    Ok((packet.len(), meta))
                }
                None => Err(DivertError::Closed(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "capture drained",
                ))),
            }
        }

        fn send(&mut self, packet: &[u8], meta: PacketMeta) -> Result<(), DivertError> {
            self.sent.push((packet.to_vec(), meta));
            Ok(())
        }
    }

    fn tcp_packet(
        src_addr: [u8; 4],
        dst_addr: [u8; 4],
        src_port: u16,
        dst_port: u16,
        seq: u32,
        ack: u32,
        payload: &[u8],
    ) -> Vec<u8> {
        use wire_types::checksum;
        use wire_types::ip::ipv4::{Ipv4Fields, IPV4_LEN};
        use wire_types::ip::IpProto;
        use wire_types::tcp::{self, TcpFields, TCP_LEN};

        let tcp_size = TCP_LEN + payload.len();
        let mut packet = vec![0u8; IPV4_LEN + tcp_size];
        let fields = TcpFields {
            src_port,
            dst_port,
            seq_num: seq,
            ack_seq: ack,
            flags: TCP_FLAG_ACK | TCP_FLAG_PSH,
            window: 2048,
        };
        tcp::encode(&mut packet[IPV4_LEN..], &fields);
        packet[IPV4_LEN + TCP_LEN..].copy_from_slice(payload);
        let mut acc =
            checksum::pseudo_header_sum(IpProto::Tcp as u8, src_addr, dst_addr, tcp_size as u16);
        acc = checksum::sum(&packet[IPV4_LEN..], acc);
        let tcp_sum = checksum::finalize(acc);
        tcp::set_checksum(&mut packet[IPV4_LEN..], tcp_sum);
        ipv4::encode(
            &mut packet[..IPV4_LEN],
            &Ipv4Fields {
                total_len: (IPV4_LEN + tcp_size) as u16,
                protocol: IpProto::Tcp,
                src_addr,
                dst_addr,
            },
        );
        packet
    }

    fn outbound() -> PacketMeta {
        PacketMeta {
            direction: Direction::Outbound,
            if_index: 2,
        }
    }

    fn inbound() -> PacketMeta {
        PacketMeta {
            direction: Direction::Inbound,
            if_index: 2,
        }
    }

    fn run_engine(mode: Mode, packets: Vec<(Vec<u8>, PacketMeta)>) -> Vec<(Vec<u8>, PacketMeta)> {
        let divert = MockDivert::with_packets(packets);
        let mut engine = Engine::new(divert, mode, FilterSpec::default(), "blocked");
        let err = engine.run().unwrap_err();
        assert!(err.is_fatal());
        engine.divert.sent
    }

    #[test]
    fn request_policy_emits_rst_data_fin() {
        let request = tcp_packet(
            CLIENT,
            SERVER,
            52100,
            80,
            100,
            5000,
            b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n",
        );
        let sent = run_engine(Mode::Request, vec![(request, outbound())]);
        assert_eq!(sent.len(), 3);

        let (rst, rst_meta) = &sent[0];
        let rst_seg = ObservedSegment::parse(rst).unwrap();
        assert_eq!(rst_meta.direction, Direction::Outbound);
        assert_eq!(rst_seg.flags(), TCP_FLAG_ACK | TCP_FLAG_RST);
        assert_eq!(rst_seg.src_addr(), CLIENT);
        assert_eq!(rst_seg.dst_addr(), SERVER);
        assert_eq!(rst_seg.seq_num(), 100);
        assert_eq!(rst_seg.ack_seq(), 5000);

        let (data, data_meta) = &sent[1];
        let data_seg = ObservedSegment::parse(data).unwrap();
        assert_eq!(data_meta.direction, Direction::Inbound);
        assert_eq!(data_seg.flags(), TCP_FLAG_ACK | TCP_FLAG_PSH);
        assert_eq!(data_seg.src_addr(), SERVER);
        assert_eq!(data_seg.dst_addr(), CLIENT);
        assert_eq!(data_seg.src_port(), 80);
        assert_eq!(data_seg.dst_port(), 52100);
        assert_eq!(data_seg.seq_num(), 5000);
        assert!(data_seg.payload().starts_with(b"HTTP/1.1 200 OK\r\n"));
        assert!(data_seg.payload().ends_with(b"\r\n\r\nblocked"));

        let (fin, fin_meta) = &sent[2];
        let fin_seg = ObservedSegment::parse(fin).unwrap();
        assert_eq!(fin_meta.direction, Direction::Inbound);
        assert_eq!(fin_seg.flags(), TCP_FLAG_ACK | TCP_FLAG_FIN);
        let injected_len = data_seg.payload().len() as u32;
        assert_eq!(fin_seg.seq_num(), 5000 + injected_len);
        assert_eq!(fin_seg.ack_seq(), data_seg.ack_seq());
    }

    #[test]
    fn response_policy_substitutes_in_place() {
        let response = tcp_packet(
            SERVER,
            CLIENT,
            80,
            52100,
            7000,
            300,
            b"HTTP/1.1 200 OK\r\n\r\nreal body",
        );
        let sent = run_engine(Mode::Response, vec![(response, inbound())]);
        assert_eq!(sent.len(), 2);

        let (data, data_meta) = &sent[0];
        let data_seg = ObservedSegment::parse(data).unwrap();
        assert_eq!(data_meta.direction, Direction::Inbound);
        assert_eq!(data_seg.src_addr(), SERVER);
        assert_eq!(data_seg.dst_addr(), CLIENT);
        assert_eq!(data_seg.src_port(), 80);
        assert_eq!(data_seg.seq_num(), 7000);
        assert_eq!(data_seg.ack_seq(), 300);
        assert!(data_seg.payload().starts_with(b"HTTP/1.1 200 OK\r\n"));

        let (fin, _) = &sent[1];
        let fin_seg = ObservedSegment::parse(fin).unwrap();
        assert_eq!(fin_seg.flags(), TCP_FLAG_ACK | TCP_FLAG_FIN);
        assert_eq!(
            fin_seg.seq_num(),
            7000 + data_seg.payload().len() as u32
        );
        assert_eq!(fin_seg.ack_seq(), 300);
    }

    #[test]
    fn non_matching_payload_synthesizes_nothing() {
        let telnet = tcp_packet(CLIENT, SERVER, 52100, 23, 1, 1, b"login: ");
        let sent = run_engine(Mode::Request, vec![(telnet, outbound())]);
        assert!(sent.is_empty());
    }

    #[test]
    fn wrong_direction_is_filtered_out() {
        let request = tcp_packet(CLIENT, SERVER, 52100, 80, 100, 5000, b"GET / HTTP/1.1\r\n\r\n");
        // Request policy listens outbound by default; an inbound capture of
        // the same bytes is ignored.
        let sent = run_engine(Mode::Request, vec![(request, inbound())]);
        assert!(sent.is_empty());
    }

    #[test]
    fn malformed_packets_are_skipped() {
        let sent = run_engine(Mode::Request, vec![(vec![0u8; 12], outbound())]);
        assert!(sent.is_empty());
    }

    #[test]
    fn passthrough_reinjects_everything() {
        let request = tcp_packet(CLIENT, SERVER, 52100, 80, 100, 5000, b"GET / HTTP/1.1\r\n\r\n");
        let other = tcp_packet(CLIENT, SERVER, 52100, 9000, 4, 9, b"\x00\x01binary");
        let sent = run_engine(
            Mode::Passthrough,
            vec![(request.clone(), outbound()), (other.clone(), inbound())],
        );
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].0, request);
        assert_eq!(sent[0].1.direction, Direction::Outbound);
        assert_eq!(sent[1].0, other);
        assert_eq!(sent[1].1.direction, Direction::Inbound);
    }

    #[test]
    fn loopback_traffic_is_ignored_by_default() {
        let request = tcp_packet([127, 0, 0, 1], SERVER, 52100, 80, 1, 1, b"GET / HTTP/1.1\r\n\r\n");
        let sent = run_engine(Mode::Request, vec![(request, outbound())]);
        assert!(sent.is_empty());
    }

    #[test]
    fn render_response_is_well_formed() {
        let bytes = render_response("Hello World!");
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Length: 12\r\n"));
        assert!(text.ends_with("\r\n\r\nHello World!"));
    }
}
