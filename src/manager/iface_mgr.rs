//! Interface manager.
//!
//! Owns the interfaces, the selected packet filter and every open socket,
//! and multiplexes receives across them with poll(2).

use std::net::Ipv4Addr;
use std::os::fd::RawFd;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::domain::{interfaces, Iface, Pkt4, SocketInfo};
use crate::error::PktFilterError;
use crate::filter::PktFilter;

struct IfaceEntry {
    iface: Iface,
    sockets: Vec<SocketInfo>,
}

/// Interfaces and their sockets, served through one packet filter.
pub struct IfaceMgr {
    ifaces: Vec<IfaceEntry>,
    filter: Box<dyn PktFilter>,
}

impl IfaceMgr {
    /// Create a manager with no interfaces using `filter` for all I/O.
    pub fn new(filter: Box<dyn PktFilter>) -> Self {
        Self {
            ifaces: Vec::new(),
            filter,
        }
    }

    /// Add every interface the system reports. Returns how many were new.
    pub fn detect_ifaces(&mut self) -> usize {
        let mut added = 0;
        for iface in interfaces() {
            if self.find(&iface.name).is_none() {
                added += 1;
            }
            self.add_iface(iface);
        }
        debug!("Detected {} new interfaces", added);
        added
    }

    /// Add an interface, or refresh the descriptor of a known one.
    ///
    /// Sockets already open on the interface are kept.
    pub fn add_iface(&mut self, iface: Iface) {
        match self.ifaces.iter_mut().find(|e| e.iface.name == iface.name) {
            Some(entry) => entry.iface = iface,
            None => self.ifaces.push(IfaceEntry {
                iface,
                sockets: Vec::new(),
            }),
        }
    }

    pub fn iface(&self, name: &str) -> Option<&Iface> {
        self.find(name).map(|e| &e.iface)
    }

    pub fn ifaces(&self) -> impl Iterator<Item = &Iface> {
        self.ifaces.iter().map(|e| &e.iface)
    }

    /// Sockets open on the named interface.
    pub fn sockets(&self, name: &str) -> &[SocketInfo] {
        self.find(name).map(|e| e.sockets.as_slice()).unwrap_or(&[])
    }

    /// Total number of open sockets.
    pub fn socket_count(&self) -> usize {
        self.ifaces.iter().map(|e| e.sockets.len()).sum()
    }

    pub fn filter_name(&self) -> &'static str {
        self.filter.name()
    }

    /// Replace the packet filter.
    ///
    /// Sockets belong to the filter that opened them, so the change is
    /// refused while any is open.
    pub fn set_packet_filter(&mut self, filter: Box<dyn PktFilter>) -> Result<(), PktFilterError> {
        if self.socket_count() > 0 {
            return Err(PktFilterError::FilterChangeDenied);
        }
        info!("Packet filter changed from {} to {}", self.filter.name(), filter.name());
        self.filter = filter;
        Ok(())
    }

    pub fn is_direct_response_supported(&self) -> bool {
        self.filter.is_direct_response_supported()
    }

    /// Open one socket on the named interface. Returns its handle.
    pub fn open_socket(
        &mut self,
        name: &str,
        addr: Ipv4Addr,
        port: u16,
        receive_bcast: bool,
        send_bcast: bool,
    ) -> Result<RawFd, PktFilterError> {
        let entry = self
            .ifaces
            .iter_mut()
            .find(|e| e.iface.name == name)
            .ok_or_else(|| PktFilterError::UnknownIface(name.to_string()))?;

        let socket = self
            .filter
            .open_socket(&entry.iface, addr, port, receive_bcast, send_bcast)?;
        let fd = socket.fd();
        entry.sockets.push(socket);
        Ok(fd)
    }

    /// Open a socket on every usable interface.
    ///
    /// Interfaces that are down, loopback, or without an IPv4 address are
    /// skipped. A failure on one interface is logged and does not stop the
    /// others. Returns how many sockets were opened.
    pub fn open_sockets4(&mut self, port: u16, use_bcast: bool) -> usize {
        let mut opened = 0;

        for entry in &mut self.ifaces {
            let iface = &entry.iface;
            if !iface.flags.up || iface.flags.loopback {
                debug!("Skipping {} ({})", iface.name, iface.flags);
                continue;
            }
            let Some(addr) = iface.first_addr() else {
                debug!("Skipping {}: no IPv4 address", iface.name);
                continue;
            };

            let bcast = use_bcast && iface.flags.broadcast;
            match self.filter.open_socket(iface, addr, port, bcast, bcast) {
                Ok(socket) => {
                    entry.sockets.push(socket);
                    opened += 1;
                }
                Err(e) => warn!("Failed to open socket on {}: {}", iface.name, e),
            }
        }

        info!("Opened {} sockets on port {} using {}", opened, port, self.filter.name());
        opened
    }

    /// Close every socket.
    pub fn close_sockets(&mut self) {
        let closed = self.socket_count();
        for entry in &mut self.ifaces {
            entry.sockets.clear();
        }
        debug!("Closed {} sockets", closed);
    }

    /// Close the sockets of one interface. Returns how many were closed.
    pub fn close_sockets_on(&mut self, name: &str) -> Result<usize, PktFilterError> {
        let entry = self
            .ifaces
            .iter_mut()
            .find(|e| e.iface.name == name)
            .ok_or_else(|| PktFilterError::UnknownIface(name.to_string()))?;

        let closed = entry.sockets.len();
        entry.sockets.clear();
        debug!("Closed {} sockets on {}", closed, name);
        Ok(closed)
    }

    /// Send `pkt` on the interface it names.
    ///
    /// Uses the socket bound to `pkt.local_addr`, or the interface's first
    /// socket when none matches.
    pub fn send(&self, pkt: &Pkt4) -> Result<(), PktFilterError> {
        if pkt.direct_response && !self.filter.is_direct_response_supported() {
            return Err(PktFilterError::DirectResponseUnsupported);
        }

        let entry = self
            .find(&pkt.iface)
            .ok_or_else(|| PktFilterError::UnknownIface(pkt.iface.clone()))?;

        let socket = entry
            .sockets
            .iter()
            .find(|s| s.addr() == pkt.local_addr)
            .or_else(|| entry.sockets.first())
            .ok_or_else(|| PktFilterError::NoSocket(pkt.iface.clone()))?;

        self.filter.send(&entry.iface, socket, pkt)
    }

    /// Wait up to `timeout` for a packet on any socket.
    ///
    /// `Ok(None)` covers a timeout, an interrupted wait, and a frame that
    /// was read but dropped. Frames already buffered by a socket are served
    /// before waiting.
    pub fn receive4(&self, timeout: Duration) -> Result<Option<Pkt4>, PktFilterError> {
        for entry in &self.ifaces {
            if let Some(socket) = entry.sockets.iter().find(|s| s.has_pending()) {
                return self.filter.receive(&entry.iface, socket);
            }
        }

        let mut pollfds = Vec::new();
        let mut owners = Vec::new();
        for entry in &self.ifaces {
            for socket in &entry.sockets {
                pollfds.push(libc::pollfd {
                    fd: socket.fd(),
                    events: libc::POLLIN,
                    revents: 0,
                });
                owners.push((&entry.iface, socket));
            }
        }
        if pollfds.is_empty() {
            return Err(PktFilterError::NoSocket("any interface".to_string()));
        }

        let timeout_ms = timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;
        // SAFETY: pollfds is a valid array of pollfd for its whole length.
        let rc = unsafe {
            libc::poll(
                pollfds.as_mut_ptr(),
                pollfds.len() as libc::nfds_t,
                timeout_ms,
            )
        };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                return Ok(None);
            }
            return Err(PktFilterError::Receive(err));
        }
        if rc == 0 {
            return Ok(None);
        }

        let ready = libc::POLLIN | libc::POLLERR | libc::POLLHUP;
        match pollfds.iter().position(|p| p.revents & ready != 0) {
            Some(i) => {
                let (iface, socket) = owners[i];
                self.filter.receive(iface, socket)
            }
            None => Ok(None),
        }
    }

    fn find(&self, name: &str) -> Option<&IfaceEntry> {
        self.ifaces.iter().find(|e| e.iface.name == name)
    }
}
