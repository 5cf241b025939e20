//! Portable packet filter over ordinary UDP sockets.

use std::io::Read;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::fd::OwnedFd;

use socket2::{Domain, Protocol, SockRef, Socket, Type};
use tracing::{debug, info};

use super::raw::RECV_BUF_LEN;
use super::{validate_open, PktFilter};
use crate::domain::{Iface, Pkt4, SocketInfo};
use crate::error::PktFilterError;
use crate::parser::BootpParser;

/// Packet filter using the kernel's UDP/IP stack.
///
/// Works unprivileged on every platform. Replies can only be addressed by
/// IP, so a client that has no address yet cannot be answered directly.
#[derive(Debug, Default, Clone, Copy)]
pub struct PktFilterInet;

impl PktFilterInet {
    pub fn new() -> Self {
        Self
    }
}

impl PktFilter for PktFilterInet {
    fn name(&self) -> &'static str {
        "inet"
    }

    fn is_direct_response_supported(&self) -> bool {
        false
    }

    fn open_socket(
        &self,
        iface: &Iface,
        addr: Ipv4Addr,
        port: u16,
        receive_bcast: bool,
        send_bcast: bool,
    ) -> Result<SocketInfo, PktFilterError> {
        validate_open(iface, receive_bcast, send_bcast)?;
        let open = |e| PktFilterError::open(&iface.name, e);

        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).map_err(open)?;
        socket.set_reuse_address(true).map_err(open)?;

        // Broadcasts are only delivered to sockets bound to the wildcard
        // address, so tie the socket to the device instead.
        let bind_addr = if receive_bcast {
            #[cfg(target_os = "linux")]
            socket
                .bind_device(Some(iface.name.as_bytes()))
                .map_err(open)?;
            Ipv4Addr::UNSPECIFIED
        } else {
            addr
        };

        if send_bcast {
            socket.set_broadcast(true).map_err(open)?;
        }

        socket
            .bind(&SocketAddrV4::new(bind_addr, port).into())
            .map_err(open)?;

        info!(
            "Opened UDP socket on {} ({}:{}, bound {})",
            iface.name, addr, port, bind_addr
        );
        Ok(SocketInfo::datagram(OwnedFd::from(socket), addr, port))
    }

    fn receive(&self, iface: &Iface, socket: &SocketInfo) -> Result<Option<Pkt4>, PktFilterError> {
        let sock = SockRef::from(socket);
        // Sender of the queued datagram, then the datagram itself
        let from = sock.peek_sender().map_err(PktFilterError::Receive)?;
        let mut buf = [0u8; RECV_BUF_LEN];
        let len = (&*sock).read(&mut buf).map_err(PktFilterError::Receive)?;

        let Some(from) = from.as_socket_ipv4() else {
            debug!("Dropping datagram from non-IPv4 peer on {}", iface.name);
            return Ok(None);
        };

        let data = &buf[..len];
        if let Err(e) = BootpParser::new().validate(data) {
            debug!("Dropping datagram from {} on {}: {}", from, iface.name, e);
            return Ok(None);
        }

        let pkt = Pkt4::new(data.to_vec())
            .with_local(socket.addr(), socket.port())
            .with_remote(*from.ip(), from.port())
            .with_iface(iface.name.clone(), iface.index);
        Ok(Some(pkt))
    }

    fn send(&self, iface: &Iface, socket: &SocketInfo, pkt: &Pkt4) -> Result<(), PktFilterError> {
        if pkt.direct_response {
            return Err(PktFilterError::DirectResponseUnsupported);
        }

        let dest = SocketAddrV4::new(pkt.remote_addr, pkt.remote_port);
        SockRef::from(socket)
            .send_to(&pkt.data, &dest.into())
            .map_err(PktFilterError::Send)?;

        debug!("Sent {} bytes to {} via {}", pkt.len(), dest, iface.name);
        Ok(())
    }
}
