//! Linux packet filter: AF_PACKET sockets with a kernel classifier.

use std::io::{self, Read};
use std::mem;
use std::net::Ipv4Addr;
use std::os::fd::{AsRawFd, OwnedFd};

use socket2::{Domain, Protocol, SockRef, Socket, Type};
use tracing::{debug, info};

use super::raw::{self, RECV_BUF_LEN};
use super::{validate_open, PktFilter};
use crate::domain::{Iface, Pkt4, SocketInfo};
use crate::error::PktFilterError;
use crate::frame::{dhcp_program, exclude_outgoing, BpfInsn, LinkType};

/// All protocols, in network order as packet sockets expect
const ETH_P_ALL_BE: u16 = (libc::ETH_P_ALL as u16).to_be();

/// Packet filter over Linux packet sockets.
///
/// Frames are captured below the IP stack, so requests from clients without
/// an address are seen and replies can be unicast to a hardware address.
/// Requires CAP_NET_RAW.
#[derive(Debug, Default, Clone, Copy)]
pub struct PktFilterLpf;

impl PktFilterLpf {
    pub fn new() -> Self {
        Self
    }
}

impl PktFilter for PktFilterLpf {
    fn name(&self) -> &'static str {
        "lpf"
    }

    fn is_direct_response_supported(&self) -> bool {
        true
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
        if iface.mac.is_none() {
            return Err(PktFilterError::MissingHardwareAddress(iface.name.clone()));
        }

        // Reserve the port before capturing
        let fallback = raw::open_fallback_socket(iface, addr, port)?;

        let open = |e| PktFilterError::open(&iface.name, e);
        let socket = Socket::new(
            Domain::PACKET,
            Type::RAW,
            Some(Protocol::from(ETH_P_ALL_BE as i32)),
        )
        .map_err(open)?;

        let program = capture_program(port);
        attach_filter(&socket, &program).map_err(|source| PktFilterError::ClassifierInstall {
            iface: iface.name.clone(),
            source,
        })?;

        bind_to_iface(&socket, iface.index).map_err(open)?;

        info!(
            "Opened packet socket on {} (ifindex {}, {}:{})",
            iface.name, iface.index, addr, port
        );
        Ok(SocketInfo::raw(
            OwnedFd::from(socket),
            fallback,
            addr,
            port,
            LinkType::Ethernet,
            program,
        ))
    }

    fn receive(&self, iface: &Iface, socket: &SocketInfo) -> Result<Option<Pkt4>, PktFilterError> {
        raw::drain_fallback(iface, socket);

        let mut buf = [0u8; RECV_BUF_LEN];
        let sock = SockRef::from(socket);
        let len = (&*sock).read(&mut buf).map_err(PktFilterError::Receive)?;

        Ok(raw::decode_inbound(iface, socket, &buf[..len]))
    }

    fn send(&self, iface: &Iface, socket: &SocketInfo, pkt: &Pkt4) -> Result<(), PktFilterError> {
        let frame = raw::build_frame(iface, socket, pkt)?;

        let sent = SockRef::from(socket)
            .send(&frame)
            .map_err(PktFilterError::Send)?;
        if sent != frame.len() {
            return Err(PktFilterError::Send(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("short write: {} of {} bytes", sent, frame.len()),
            )));
        }

        debug!(
            "Sent {} byte frame to {}:{} via {}",
            frame.len(),
            pkt.remote_addr,
            pkt.remote_port,
            iface.name
        );
        Ok(())
    }
}

/// Classifier for a packet socket: DHCP to `port`, never our own frames.
fn capture_program(port: u16) -> Vec<BpfInsn> {
    exclude_outgoing(&dhcp_program(LinkType::Ethernet, port))
}

/// Install `program` as the socket's kernel filter.
fn attach_filter(socket: &Socket, program: &[BpfInsn]) -> io::Result<()> {
    let fprog = libc::sock_fprog {
        len: program.len() as u16,
        // BpfInsn has the layout of sock_filter
        filter: program.as_ptr() as *mut libc::sock_filter,
    };

    // SAFETY: fprog points at `program`, which outlives the call; the kernel
    // copies the instructions.
    let rc = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_ATTACH_FILTER,
            &fprog as *const _ as *const libc::c_void,
            mem::size_of::<libc::sock_fprog>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Bind a packet socket to one interface so it sees, and sends on, only that link.
fn bind_to_iface(socket: &Socket, ifindex: u32) -> io::Result<()> {
    // SAFETY: sockaddr_ll is plain data; all-zero is a valid value.
    let mut sll: libc::sockaddr_ll = unsafe { mem::zeroed() };
    sll.sll_family = libc::AF_PACKET as u16;
    sll.sll_protocol = ETH_P_ALL_BE;
    sll.sll_ifindex = ifindex as i32;

    // SAFETY: sll is a fully initialized sockaddr_ll and the length matches.
    let rc = unsafe {
        libc::bind(
            socket.as_raw_fd(),
            &sll as *const _ as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
