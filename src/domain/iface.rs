//! Network interface descriptors.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};

use macaddr::MacAddr6;
use pnet::datalink::{self, NetworkInterface};

/// Interface capability and state flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IfaceFlags {
    pub loopback: bool,
    pub broadcast: bool,
    pub multicast: bool,
    pub up: bool,
    pub running: bool,
}

impl fmt::Display for IfaceFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (self.up, "UP"),
            (self.running, "RUNNING"),
            (self.loopback, "LOOPBACK"),
            (self.broadcast, "BROADCAST"),
            (self.multicast, "MULTICAST"),
        ];
        let set: Vec<_> = names
            .iter()
            .filter(|(on, _)| *on)
            .map(|(_, name)| *name)
            .collect();
        write!(f, "{}", set.join(","))
    }
}

/// A network interface as seen by the packet filters.
///
/// Immutable once enumerated. Filters only borrow it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Iface {
    /// Interface name (e.g. "eth0")
    pub name: String,
    /// OS-assigned interface index
    pub index: u32,
    /// Hardware address, if the link has one
    pub mac: Option<MacAddr6>,
    /// IPv4 addresses configured on the interface
    pub addrs: Vec<Ipv4Addr>,
    /// Capability and state flags
    pub flags: IfaceFlags,
}

impl Iface {
    /// Create an interface descriptor with no address and all flags cleared.
    pub fn new(name: impl Into<String>, index: u32) -> Self {
        Self {
            name: name.into(),
            index,
            mac: None,
            addrs: Vec::new(),
            flags: IfaceFlags::default(),
        }
    }

    pub fn with_mac(mut self, mac: MacAddr6) -> Self {
        self.mac = Some(mac);
        self
    }

    pub fn with_addr(mut self, addr: Ipv4Addr) -> Self {
        self.addrs.push(addr);
        self
    }

    pub fn with_flags(mut self, flags: IfaceFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Whether packets can be sent and received on the interface.
    pub fn is_usable(&self) -> bool {
        self.flags.up && self.flags.running
    }

    /// First IPv4 address on the interface.
    pub fn first_addr(&self) -> Option<Ipv4Addr> {
        self.addrs.first().copied()
    }
}

impl From<&NetworkInterface> for Iface {
    fn from(iface: &NetworkInterface) -> Self {
        let mac = iface
            .mac
            .map(|m| MacAddr6::from(m.octets()))
            .filter(|m| !m.is_nil());

        let addrs = iface
            .ips
            .iter()
            .filter_map(|net| match net.ip() {
                IpAddr::V4(v4) => Some(v4),
                IpAddr::V6(_) => None,
            })
            .collect();

        Self {
            name: iface.name.clone(),
            index: iface.index,
            mac,
            addrs,
            flags: IfaceFlags {
                loopback: iface.is_loopback(),
                broadcast: iface.is_broadcast(),
                multicast: iface.is_multicast(),
                up: iface.is_up(),
                running: iface.is_running(),
            },
        }
    }
}

/// Enumerate the interfaces present on the host.
pub fn interfaces() -> Vec<Iface> {
    datalink::interfaces().iter().map(Iface::from).collect()
}
