//! Pieces shared by the raw link-layer backends.
//!
//! Outbound frame construction, inbound frame validation and the fallback
//! UDP socket that reserves the port while frames are captured raw.

use std::io::{self, Read};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::fd::OwnedFd;

use macaddr::MacAddr6;
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use tracing::debug;

use crate::domain::{Iface, Pkt4, SocketInfo};
use crate::error::{FrameError, PktFilterError};
use crate::frame::{self, Headers, LinkType};
use crate::parser::BootpParser;

/// Size of a single frame read from a packet socket
pub(crate) const RECV_BUF_LEN: usize = 4096;

/// Hardware destination for an outbound packet.
///
/// A broadcast IP destination, or a zero hardware address, is sent to the
/// link broadcast address. Otherwise the packet must carry the hardware
/// address of the client or relay; it is never guessed.
pub fn resolve_remote_hw_addr(pkt: &Pkt4) -> Result<MacAddr6, PktFilterError> {
    if pkt.remote_addr == Ipv4Addr::BROADCAST {
        return Ok(MacAddr6::broadcast());
    }
    match pkt.remote_hw_addr {
        Some(mac) if mac.is_nil() => Ok(MacAddr6::broadcast()),
        Some(mac) => Ok(mac),
        None => Err(PktFilterError::UnresolvedHardwareAddress(pkt.remote_addr)),
    }
}

/// Build the complete link frame for `pkt`.
pub(crate) fn build_frame(
    iface: &Iface,
    socket: &SocketInfo,
    pkt: &Pkt4,
) -> Result<Vec<u8>, PktFilterError> {
    let (src_mac, dst_mac) = match socket.link() {
        LinkType::Ethernet => {
            let src = iface
                .mac
                .ok_or_else(|| PktFilterError::MissingHardwareAddress(iface.name.clone()))?;
            (src, resolve_remote_hw_addr(pkt)?)
        }
        LinkType::Null => (MacAddr6::nil(), MacAddr6::nil()),
    };

    let src_ip = if pkt.local_addr.is_unspecified() {
        socket.addr()
    } else {
        pkt.local_addr
    };
    let src_port = if pkt.local_port == 0 {
        socket.port()
    } else {
        pkt.local_port
    };

    let headers = Headers {
        src_mac,
        dst_mac,
        src_ip,
        dst_ip: pkt.remote_addr,
        src_port,
        dst_port: pkt.remote_port,
    };

    frame::encode(socket.link(), &headers, &pkt.data)
        .map_err(|e| PktFilterError::Send(io::Error::new(io::ErrorKind::InvalidInput, e)))
}

/// Turn a captured frame into a packet, or drop it.
///
/// Every reason for dropping is logged at debug level; none is an error.
pub(crate) fn decode_inbound(iface: &Iface, socket: &SocketInfo, data: &[u8]) -> Option<Pkt4> {
    match parse_inbound(iface, socket, data) {
        Ok(pkt) => Some(pkt),
        Err(e) => {
            debug!("Dropping {} byte frame on {}: {}", data.len(), iface.name, e);
            None
        }
    }
}

fn parse_inbound(iface: &Iface, socket: &SocketInfo, data: &[u8]) -> Result<Pkt4, FrameError> {
    let frame = frame::decode(socket.link(), data)?;
    let headers = frame.headers;

    if headers.dst_port != socket.port() {
        return Err(FrameError::WrongPort(headers.dst_port));
    }

    let bound = socket.addr();
    if !bound.is_unspecified() && headers.dst_ip != bound && headers.dst_ip != Ipv4Addr::BROADCAST
    {
        return Err(FrameError::NotForUs(headers.dst_ip));
    }

    BootpParser::new().validate(frame.payload)?;

    let mut pkt = Pkt4::new(frame.payload.to_vec())
        .with_local(headers.dst_ip, headers.dst_port)
        .with_remote(headers.src_ip, headers.src_port)
        .with_iface(iface.name.clone(), iface.index);

    if socket.link() == LinkType::Ethernet {
        pkt.local_hw_addr = Some(headers.dst_mac);
        pkt.remote_hw_addr = Some(headers.src_mac);
    }

    Ok(pkt)
}

/// Open the UDP socket that holds `addr:port` for a raw socket.
///
/// Datagrams arriving on it are duplicates of captured frames; they are
/// drained on every receive.
pub(crate) fn open_fallback_socket(
    iface: &Iface,
    addr: Ipv4Addr,
    port: u16,
) -> Result<OwnedFd, PktFilterError> {
    let open = |e| PktFilterError::open(&iface.name, e);

    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).map_err(open)?;
    socket.set_reuse_address(true).map_err(open)?;
    socket
        .bind(&SocketAddrV4::new(addr, port).into())
        .map_err(open)?;
    socket.set_nonblocking(true).map_err(open)?;

    debug!("Fallback socket bound to {}:{} on {}", addr, port, iface.name);
    Ok(OwnedFd::from(socket))
}

/// Discard everything queued on the fallback socket.
pub(crate) fn drain_fallback(iface: &Iface, socket: &SocketInfo) {
    let Some(fd) = socket.fallback() else {
        return;
    };
    let fallback = SockRef::from(&fd);
    let mut buf = [0u8; RECV_BUF_LEN];

    loop {
        match (&*fallback).read(&mut buf) {
            Ok(_) => continue,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => {
                debug!("Fallback socket on {}: {}", iface.name, e);
                break;
            }
        }
    }
}

/// Split a BSD packet filter read buffer into the captured frames.
///
/// Each record is a `bpf_hdr` (timestamp of `tstamp_len` bytes, then
/// caplen u32, datalen u32, hdrlen u16, all in host order) followed by
/// caplen bytes, padded to `align`. A record that overruns the buffer ends
/// the walk.
#[cfg_attr(target_os = "linux", allow(dead_code))]
pub(crate) fn split_bpf_records(buf: &[u8], tstamp_len: usize, align: usize) -> Vec<Vec<u8>> {
    let min_hdr = tstamp_len + 10;
    let mut frames = Vec::new();
    let mut pos = 0;

    while pos + min_hdr <= buf.len() {
        let at = pos + tstamp_len;
        let caplen = u32::from_ne_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]) as usize;
        let hdrlen = u16::from_ne_bytes([buf[at + 8], buf[at + 9]]) as usize;

        if hdrlen < min_hdr || pos + hdrlen + caplen > buf.len() {
            debug!("Truncated packet filter record at offset {}", pos);
            break;
        }

        frames.push(buf[pos + hdrlen..pos + hdrlen + caplen].to_vec());
        pos += word_align(hdrlen + caplen, align);
    }

    frames
}

fn word_align(x: usize, align: usize) -> usize {
    (x + align - 1) & !(align - 1)
}
