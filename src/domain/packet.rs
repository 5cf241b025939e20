//! The logical DHCPv4 packet exchanged with the packet filters.

use std::net::Ipv4Addr;

use macaddr::MacAddr6;

use crate::error::FrameError;
use crate::parser::{BootpHeader, BootpParser};

/// One DHCPv4 message plus its addressing.
///
/// `data` is the DHCP message as carried in the UDP payload; option encoding
/// is left to the message layer. On a received packet the addressing fields
/// describe where it came from and which interface it arrived on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pkt4 {
    /// DHCP message bytes
    pub data: Vec<u8>,
    /// Local IPv4 address (source when sending, destination when received)
    pub local_addr: Ipv4Addr,
    /// Remote IPv4 address (destination when sending, source when received)
    pub remote_addr: Ipv4Addr,
    pub local_port: u16,
    pub remote_port: u16,
    /// Interface name
    pub iface: String,
    /// Interface index
    pub ifindex: u32,
    /// Local hardware address, filled in on raw receive
    pub local_hw_addr: Option<MacAddr6>,
    /// Remote hardware address; the link-layer destination on raw send
    pub remote_hw_addr: Option<MacAddr6>,
    /// Reply addressed straight to a client that has no IP address yet
    pub direct_response: bool,
}

impl Pkt4 {
    /// Wrap DHCP message bytes with empty addressing.
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            local_addr: Ipv4Addr::UNSPECIFIED,
            remote_addr: Ipv4Addr::UNSPECIFIED,
            local_port: 0,
            remote_port: 0,
            iface: String::new(),
            ifindex: 0,
            local_hw_addr: None,
            remote_hw_addr: None,
            direct_response: false,
        }
    }

    pub fn with_local(mut self, addr: Ipv4Addr, port: u16) -> Self {
        self.local_addr = addr;
        self.local_port = port;
        self
    }

    pub fn with_remote(mut self, addr: Ipv4Addr, port: u16) -> Self {
        self.remote_addr = addr;
        self.remote_port = port;
        self
    }

    pub fn with_iface(mut self, name: impl Into<String>, index: u32) -> Self {
        self.iface = name.into();
        self.ifindex = index;
        self
    }

    pub fn with_remote_hw_addr(mut self, mac: MacAddr6) -> Self {
        self.remote_hw_addr = Some(mac);
        self
    }

    /// Address the packet to `hw_addr` at the link layer, for a client that
    /// does not own `remote_addr` yet.
    pub fn with_direct_response(mut self, hw_addr: MacAddr6) -> Self {
        self.remote_hw_addr = Some(hw_addr);
        self.direct_response = true;
        self
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Parse the BOOTP fixed header of the message.
    pub fn header(&self) -> Result<BootpHeader, FrameError> {
        BootpParser::new().parse(&self.data)
    }
}
