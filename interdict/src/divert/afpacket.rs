//! Linux diversion backend: AF_PACKET capture, raw-socket injection.
//!
//! Capture uses a cooked (`SOCK_DGRAM`) packet socket bound to one
//! interface, so received buffers start at the IPv4 header and the kernel
//! reports per-packet direction through `sll_pkttype`. Injection uses an
//! `IPPROTO_RAW` socket with `IP_HDRINCL`, so synthesized packets carry the
//! headers exactly as built.
//!
//! AF_PACKET taps copies of traffic rather than diverting it: the original
//! packets still reach their destination. Deployments that need the original
//! flow suppressed pair this backend with a firewall drop rule for the
//! matched traffic.

use std::ffi::CString;
use std::io;
use std::mem;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::fd::AsRawFd;

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tracing::debug;

use wire_types::ip::ipv4::{self, IPV4_LEN};

use super::{Direction, Divert, DivertError, PacketMeta};

/// `sll_pkttype` value for locally originated packets (linux/if_packet.h).
const PACKET_OUTGOING: u8 = 4;

pub struct AfPacketDivert {
    capture: Socket,
    inject: Socket,
    if_index: u32,
}

impl AfPacketDivert {
    /// Opens a capture socket bound to `interface` and a raw injection
    /// socket. Requires `CAP_NET_RAW`.
    pub fn open(interface: &str) -> Result<Self, DivertError> {
        let if_index = interface_index(interface)?;

        let protocol = i32::from((libc::ETH_P_IP as u16).to_be());
        let capture = Socket::new(Domain::PACKET, Type::DGRAM, Some(Protocol::from(protocol)))
            .map_err(DivertError::Closed)?;
        bind_to_interface(&capture, if_index, protocol).map_err(DivertError::Closed)?;

        let inject = Socket::new(
            Domain::IPV4,
            Type::RAW,
            Some(Protocol::from(libc::IPPROTO_RAW)),
        )
        .map_err(DivertError::Closed)?;
        inject
            .set_header_included_v4(true)
            .map_err(DivertError::Closed)?;

        debug!(
            event_name = "divert.open",
            interface, if_index, "capture and injection sockets ready"
        );
        Ok(Self {
            capture,
            inject,
            if_index,
        })
    }
}

impl Divert for AfPacketDivert {
    fn recv(&mut self, buf: &mut [u8]) -> Result<(usize, PacketMeta), DivertError> {
        let mut addr: libc::sockaddr_ll = unsafe { mem::zeroed() };
        let mut addr_len = mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t;

        let n = unsafe {
            libc::recvfrom(
                self.capture.as_raw_fd(),
                buf.as_mut_ptr().cast(),
                buf.len(),
                0,
                (&mut addr as *mut libc::sockaddr_ll).cast(),
                &mut addr_len,
            )
        };
        if n < 0 {
            return Err(classify_io(io::Error::last_os_error()));
        }

        let direction = if addr.sll_pkttype == PACKET_OUTGOING {
            Direction::Outbound
        } else {
            Direction::Inbound
        };
        Ok((
            n as usize,
            PacketMeta {
                direction,
                if_index: self.if_index,
            },
        ))
    }

    fn send(&mut self, packet: &[u8], meta: PacketMeta) -> Result<(), DivertError> {
        if packet.len() < IPV4_LEN {
            return Err(DivertError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "packet shorter than an IPv4 header",
            )));
        }
        // The kernel routes raw packets by destination address; direction
        // metadata is informational for this backend.
        let dst = Ipv4Addr::from(ipv4::dst_addr(packet));
        let addr = SockAddr::from(SocketAddrV4::new(dst, 0));
        debug!(
            event_name = "divert.send",
            dst = %dst,
            direction = ?meta.direction,
            len = packet.len(),
            "injecting packet"
        );
        self.inject
            .send_to(packet, &addr)
            .map_err(classify_io)
            .map(|_| ())
    }
}

fn interface_index(interface: &str) -> Result<u32, DivertError> {
    let name = CString::new(interface).map_err(|_| {
        DivertError::Closed(io::Error::new(
            io::ErrorKind::InvalidInput,
            "interface name contains a NUL byte",
        ))
    })?;
    let index = unsafe { libc::if_nametoindex(name.as_ptr()) };
    if index == 0 {
        return Err(DivertError::Closed(io::Error::last_os_error()));
    }
    Ok(index)
}

fn bind_to_interface(socket: &Socket, if_index: u32, protocol: i32) -> io::Result<()> {
    let mut addr: libc::sockaddr_ll = unsafe { mem::zeroed() };
    addr.sll_family = libc::AF_PACKET as u16;
    addr.sll_protocol = protocol as u16;
    addr.sll_ifindex = if_index as i32;

    let rc = unsafe {
        libc::bind(
            socket.as_raw_fd(),
            (&addr as *const libc::sockaddr_ll).cast(),
            mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Errors that mean the socket itself is gone are fatal; everything else is
/// a transient per-packet failure.
fn classify_io(e: io::Error) -> DivertError {
    match e.raw_os_error() {
        Some(libc::EBADF) | Some(libc::ENOTSOCK) | Some(libc::ENODEV) => DivertError::Closed(e),
        _ => DivertError::Io(e),
    }
}
