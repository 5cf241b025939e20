//! BOOTP fixed-header parser.
//!
//! Validates that a UDP payload is a DHCPv4 message (RFC 2131 fixed header
//! followed by the magic cookie) and exposes the header fields the packet
//! I/O layer needs. Options are left to the message layer.

use std::net::Ipv4Addr;

use macaddr::MacAddr6;

use crate::error::FrameError;

/// DHCP magic cookie: 0x63825363
pub const DHCP_MAGIC_COOKIE: [u8; 4] = [0x63, 0x82, 0x53, 0x63];

/// Fixed BOOTP header size (without the magic cookie)
pub const BOOTP_HEADER_LEN: usize = 236;

/// Smallest valid DHCP message: fixed header plus magic cookie
pub const MIN_DHCP_LEN: usize = BOOTP_HEADER_LEN + DHCP_MAGIC_COOKIE.len();

const BOOTREQUEST: u8 = 1;
const BOOTREPLY: u8 = 2;
const FLAG_BROADCAST: u16 = 0x8000;

/// Fields of the BOOTP fixed header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootpHeader {
    /// Operation: 1 = BOOTREQUEST, 2 = BOOTREPLY
    pub op: u8,
    /// Hardware type (1 = Ethernet)
    pub htype: u8,
    /// Hardware address length
    pub hlen: u8,
    /// Relay hops
    pub hops: u8,
    /// Transaction ID
    pub xid: u32,
    pub secs: u16,
    pub flags: u16,
    /// Client IP address (if already known)
    pub ciaddr: Ipv4Addr,
    /// 'Your' IP address (assigned by server)
    pub yiaddr: Ipv4Addr,
    pub siaddr: Ipv4Addr,
    /// Relay agent address
    pub giaddr: Ipv4Addr,
    /// Client hardware address
    pub chaddr: MacAddr6,
}

impl BootpHeader {
    pub fn is_request(&self) -> bool {
        self.op == BOOTREQUEST
    }

    pub fn is_reply(&self) -> bool {
        self.op == BOOTREPLY
    }

    /// Client asked for replies to be broadcast.
    pub fn wants_broadcast(&self) -> bool {
        self.flags & FLAG_BROADCAST != 0
    }

    /// The message came through a relay agent.
    pub fn is_relayed(&self) -> bool {
        !self.giaddr.is_unspecified()
    }
}

/// Parser for the BOOTP fixed header.
pub struct BootpParser;

impl BootpParser {
    pub fn new() -> Self {
        Self
    }

    /// Parse the fixed header of a DHCP message.
    ///
    /// The input is the UDP payload.
    pub fn parse(&self, data: &[u8]) -> Result<BootpHeader, FrameError> {
        if data.len() < MIN_DHCP_LEN {
            return Err(FrameError::Truncated {
                layer: "dhcp",
                expected: MIN_DHCP_LEN,
                actual: data.len(),
            });
        }

        if data[BOOTP_HEADER_LEN..MIN_DHCP_LEN] != DHCP_MAGIC_COOKIE {
            return Err(FrameError::InvalidMagicCookie);
        }

        Ok(BootpHeader {
            op: data[0],
            htype: data[1],
            hlen: data[2],
            hops: data[3],
            xid: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            secs: u16::from_be_bytes([data[8], data[9]]),
            flags: u16::from_be_bytes([data[10], data[11]]),
            ciaddr: Ipv4Addr::new(data[12], data[13], data[14], data[15]),
            yiaddr: Ipv4Addr::new(data[16], data[17], data[18], data[19]),
            siaddr: Ipv4Addr::new(data[20], data[21], data[22], data[23]),
            giaddr: Ipv4Addr::new(data[24], data[25], data[26], data[27]),
            // chaddr is 16 bytes; Ethernet uses the first 6
            chaddr: MacAddr6::new(data[28], data[29], data[30], data[31], data[32], data[33]),
        })
    }

    /// Check that the payload is a DHCP message without keeping the fields.
    pub fn validate(&self, data: &[u8]) -> Result<(), FrameError> {
        self.parse(data).map(|_| ())
    }
}

impl Default for BootpParser {
    fn default() -> Self {
        Self::new()
    }
}
