//! Packet filter double for tests of code that sits above the filters.
//!
//! Needs no privilege and touches no network. Each "socket" is one end of a
//! Unix datagram pair, so it can be polled like a real one: queuing a packet
//! writes a wake-up byte to the other end.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::io::{self, Read};
use std::net::Ipv4Addr;
use std::os::fd::{OwnedFd, RawFd};
use std::os::unix::net::UnixDatagram;
use std::rc::Rc;

use socket2::SockRef;
use tracing::debug;

use super::{validate_open, PktFilter};
use crate::domain::{Iface, Pkt4, SocketInfo};
use crate::error::PktFilterError;

/// A packet handed to [`TestPktFilter::send`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentPacket {
    /// Interface the packet was sent on
    pub iface: String,
    /// Handle of the socket it was sent through
    pub sockfd: RawFd,
    pub pkt: Pkt4,
}

#[derive(Debug, Default)]
struct TestState {
    direct_response: bool,
    /// Packets waiting to be received, per interface
    inbound: HashMap<String, VecDeque<Pkt4>>,
    /// Queued packets no socket has been woken for yet
    unsignalled: HashMap<String, usize>,
    /// Wake-up ends of the socket pairs, per interface
    peers: HashMap<String, Vec<UnixDatagram>>,
    sent: Vec<SentPacket>,
    fail_open: HashSet<String>,
    opened: usize,
}

impl TestState {
    /// Wake one live socket on `iface`; dead peers are forgotten.
    fn signal(&mut self, iface: &str) -> bool {
        let Some(peers) = self.peers.get_mut(iface) else {
            return false;
        };
        while let Some(peer) = peers.first() {
            match peer.send(&[1]) {
                Ok(_) => return true,
                Err(e) => {
                    debug!("Dropping closed test socket on {}: {}", iface, e);
                    peers.remove(0);
                }
            }
        }
        false
    }
}

/// Scriptable packet filter.
///
/// Clones share state, so a test can keep one handle while the code under
/// test owns another.
#[derive(Debug, Clone, Default)]
pub struct TestPktFilter {
    state: Rc<RefCell<TestState>>,
}

impl TestPktFilter {
    pub fn new(direct_response: bool) -> Self {
        let filter = Self::default();
        filter.set_direct_response_supported(direct_response);
        filter
    }

    pub fn set_direct_response_supported(&self, supported: bool) {
        self.state.borrow_mut().direct_response = supported;
    }

    /// Queue `pkt` to be returned by `receive` on the interface named in
    /// `pkt.iface`.
    pub fn queue_packet(&self, pkt: Pkt4) {
        let mut state = self.state.borrow_mut();
        let iface = pkt.iface.clone();
        state.inbound.entry(iface.clone()).or_default().push_back(pkt);
        if !state.signal(&iface) {
            *state.unsignalled.entry(iface).or_default() += 1;
        }
    }

    /// Every packet sent so far, oldest first.
    pub fn sent(&self) -> Vec<SentPacket> {
        self.state.borrow().sent.clone()
    }

    /// Make `open_socket` fail on the named interface.
    pub fn fail_open_on(&self, iface: impl Into<String>) {
        self.state.borrow_mut().fail_open.insert(iface.into());
    }

    /// Number of sockets successfully opened.
    pub fn open_count(&self) -> usize {
        self.state.borrow().opened
    }
}

impl PktFilter for TestPktFilter {
    fn name(&self) -> &'static str {
        "test"
    }

    fn is_direct_response_supported(&self) -> bool {
        self.state.borrow().direct_response
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

        let mut state = self.state.borrow_mut();
        if state.fail_open.contains(&iface.name) {
            return Err(PktFilterError::SocketOpen {
                iface: iface.name.clone(),
                source: io::Error::new(io::ErrorKind::AddrInUse, "open failure requested"),
            });
        }

        let open = |e| PktFilterError::open(&iface.name, e);
        let (local, peer) = UnixDatagram::pair().map_err(open)?;
        local.set_nonblocking(true).map_err(open)?;
        peer.set_nonblocking(true).map_err(open)?;

        // Wake the new socket for packets queued before it existed
        let pending = state.unsignalled.remove(&iface.name).unwrap_or(0);
        for _ in 0..pending {
            peer.send(&[1]).map_err(open)?;
        }

        state.peers.entry(iface.name.clone()).or_default().push(peer);
        state.opened += 1;

        Ok(SocketInfo::datagram(OwnedFd::from(local), addr, port))
    }

    fn receive(&self, iface: &Iface, socket: &SocketInfo) -> Result<Option<Pkt4>, PktFilterError> {
        let mut byte = [0u8; 1];
        match (&*SockRef::from(socket)).read(&mut byte) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => return Err(PktFilterError::Receive(e)),
        }

        let mut state = self.state.borrow_mut();
        Ok(state
            .inbound
            .get_mut(&iface.name)
            .and_then(|queue| queue.pop_front()))
    }

    fn send(&self, iface: &Iface, socket: &SocketInfo, pkt: &Pkt4) -> Result<(), PktFilterError> {
        let mut state = self.state.borrow_mut();
        if pkt.direct_response && !state.direct_response {
            return Err(PktFilterError::DirectResponseUnsupported);
        }
        state.sent.push(SentPacket {
            iface: iface.name.clone(),
            sockfd: socket.fd(),
            pkt: pkt.clone(),
        });
        Ok(())
    }
}
