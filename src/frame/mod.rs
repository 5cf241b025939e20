//! Link/IPv4/UDP framing for the raw capture backends.
//!
//! Pure encode/decode over byte buffers, built on pnet packet views, plus
//! the kernel classifier program.
//! Nothing here touches a socket.

mod classifier;
mod codec;

pub use classifier::{dhcp_program, exclude_outgoing, BpfInsn, PACKET_OUTGOING};
pub use codec::{decode, encode, Frame, Headers};

/// Ethernet header: destination, source, EtherType
pub const ETHERNET_HEADER_LEN: usize = 14;
/// BSD null/loopback header: address family in host byte order
pub const NULL_HEADER_LEN: usize = 4;
/// IPv4 header without options
pub const IPV4_HEADER_LEN: usize = 20;
pub const UDP_HEADER_LEN: usize = 8;

pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const IPPROTO_UDP: u8 = 17;

/// Type of service for outbound datagrams (low delay)
pub const IPTOS_LOWDELAY: u8 = 0x10;
/// TTL for outbound datagrams
pub const DEFAULT_TTL: u8 = 128;

/// `AF_INET` as written in a null link header.
#[cfg(unix)]
pub(crate) const AF_INET: u32 = libc::AF_INET as u32;
#[cfg(not(unix))]
pub(crate) const AF_INET: u32 = 2;

/// Link-layer framing carried by a raw capture handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkType {
    /// Ethernet II
    Ethernet,
    /// BSD loopback: 4-byte address family, no hardware addresses
    Null,
}

impl LinkType {
    pub fn header_len(&self) -> usize {
        match self {
            Self::Ethernet => ETHERNET_HEADER_LEN,
            Self::Null => NULL_HEADER_LEN,
        }
    }
}
