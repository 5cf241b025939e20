//! Runtime records for open sockets.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};

use crate::frame::{BpfInsn, LinkType};

/// How a socket exchanges packets with the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketMode {
    /// Ordinary addressed UDP socket.
    Datagram,
    /// Raw link-layer capture handle.
    Raw,
}

/// One open socket and its binding.
///
/// The socket owns its handle; dropping it closes the handle, the fallback
/// socket if any, and releases the kernel classifier attached to it.
#[derive(Debug)]
pub struct SocketInfo {
    fd: OwnedFd,
    fallback: Option<OwnedFd>,
    addr: Ipv4Addr,
    port: u16,
    mode: SocketMode,
    link: LinkType,
    classifier: Vec<BpfInsn>,
    read_len: usize,
    backlog: RefCell<VecDeque<Vec<u8>>>,
}

impl SocketInfo {
    /// Record for an ordinary datagram socket.
    pub fn datagram(fd: OwnedFd, addr: Ipv4Addr, port: u16) -> Self {
        Self {
            fd,
            fallback: None,
            addr,
            port,
            mode: SocketMode::Datagram,
            link: LinkType::Ethernet,
            classifier: Vec::new(),
            read_len: 0,
            backlog: RefCell::new(VecDeque::new()),
        }
    }

    /// Record for a raw capture handle with its installed classifier.
    pub fn raw(
        fd: OwnedFd,
        fallback: OwnedFd,
        addr: Ipv4Addr,
        port: u16,
        link: LinkType,
        classifier: Vec<BpfInsn>,
    ) -> Self {
        Self {
            fd,
            fallback: Some(fallback),
            addr,
            port,
            mode: SocketMode::Raw,
            link,
            classifier,
            read_len: 0,
            backlog: RefCell::new(VecDeque::new()),
        }
    }

    /// Set the size of reads from the handle (BSD packet filter buffer length).
    pub fn with_read_len(mut self, len: usize) -> Self {
        self.read_len = len;
        self
    }

    pub fn fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    pub fn fallback(&self) -> Option<BorrowedFd<'_>> {
        self.fallback.as_ref().map(|fd| fd.as_fd())
    }

    pub fn addr(&self) -> Ipv4Addr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Address family of the bound address. Only IPv4 is handled here.
    pub fn family(&self) -> socket2::Domain {
        socket2::Domain::IPV4
    }

    pub fn mode(&self) -> SocketMode {
        self.mode
    }

    pub fn is_raw(&self) -> bool {
        self.mode == SocketMode::Raw
    }

    pub fn link(&self) -> LinkType {
        self.link
    }

    /// Classifier program installed in the kernel (empty for datagram sockets).
    pub fn classifier(&self) -> &[BpfInsn] {
        &self.classifier
    }

    pub fn read_len(&self) -> usize {
        self.read_len
    }

    /// Whether frames read earlier are still waiting to be consumed.
    pub fn has_pending(&self) -> bool {
        !self.backlog.borrow().is_empty()
    }

    #[cfg_attr(target_os = "linux", allow(dead_code))]
    pub(crate) fn push_pending(&self, frame: Vec<u8>) {
        self.backlog.borrow_mut().push_back(frame);
    }

    #[cfg_attr(target_os = "linux", allow(dead_code))]
    pub(crate) fn pop_pending(&self) -> Option<Vec<u8>> {
        self.backlog.borrow_mut().pop_front()
    }
}

impl AsFd for SocketInfo {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}
