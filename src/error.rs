use std::io;
use std::net::Ipv4Addr;

use thiserror::Error;

/// Errors reported by packet filter backends and the interface manager.
#[derive(Error, Debug)]
pub enum PktFilterError {
    #[error("Invalid packet filter: {0}")]
    InvalidPacketFilter(String),

    #[error("Packet filter cannot be changed while sockets are open")]
    FilterChangeDenied,

    #[error("Interface '{0}' is down")]
    IfaceDown(String),

    #[error("Interface '{0}' does not support broadcast")]
    BroadcastUnsupported(String),

    #[error("Insufficient permissions to open socket on '{0}' (try running as root)")]
    InsufficientPermissions(String),

    #[error("Failed to open socket on '{iface}': {source}")]
    SocketOpen {
        iface: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to install packet classifier on '{iface}': {source}")]
    ClassifierInstall {
        iface: String,
        #[source]
        source: io::Error,
    },

    #[error("Unsupported link type {link_type} on '{iface}'")]
    UnsupportedLinkType { iface: String, link_type: u32 },

    #[error("Interface '{0}' has no hardware address")]
    MissingHardwareAddress(String),

    #[error("Failed to send packet: {0}")]
    Send(#[source] io::Error),

    #[error("Failed to receive packet: {0}")]
    Receive(#[source] io::Error),

    #[error("No hardware address to reach {0}")]
    UnresolvedHardwareAddress(Ipv4Addr),

    #[error("Direct response is not supported by the active packet filter")]
    DirectResponseUnsupported,

    #[error("No socket open on interface '{0}'")]
    NoSocket(String),

    #[error("Interface '{0}' not found")]
    UnknownIface(String),
}

impl PktFilterError {
    /// Returns true for failures raised while opening a socket.
    ///
    /// These are recoverable: the caller may try another backend, retry, or
    /// skip the interface.
    pub fn is_socket_open_error(&self) -> bool {
        matches!(
            self,
            Self::IfaceDown(_)
                | Self::BroadcastUnsupported(_)
                | Self::InsufficientPermissions(_)
                | Self::SocketOpen { .. }
                | Self::ClassifierInstall { .. }
                | Self::UnsupportedLinkType { .. }
                | Self::MissingHardwareAddress(_)
        )
    }

    /// Map an I/O error from socket setup, singling out permission failures.
    pub(crate) fn open(iface: &str, source: io::Error) -> Self {
        match source.kind() {
            io::ErrorKind::PermissionDenied => Self::InsufficientPermissions(iface.to_string()),
            _ => Self::SocketOpen {
                iface: iface.to_string(),
                source,
            },
        }
    }
}

/// Reasons a captured frame is discarded by the raw receive path.
///
/// These never reach the caller of `receive`; they are logged and the frame
/// is dropped.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("{layer} truncated: expected {expected} bytes, got {actual}")]
    Truncated {
        layer: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("Not an IPv4 frame (link protocol {0:#06x})")]
    NotIpv4(u32),

    #[error("Bad IP version {0}")]
    BadIpVersion(u8),

    #[error("Bad IP header length {0}")]
    BadHeaderLength(usize),

    #[error("IP total length {declared} inconsistent with {available} captured bytes")]
    TotalLength { declared: usize, available: usize },

    #[error("Bad IP header checksum")]
    BadChecksum,

    #[error("Fragmented datagram")]
    Fragmented,

    #[error("Not UDP (protocol {0})")]
    NotUdp(u8),

    #[error("UDP length {declared} inconsistent with {available} bytes")]
    UdpLength { declared: usize, available: usize },

    #[error("Destination port {0} is not ours")]
    WrongPort(u16),

    #[error("Destination {0} is not addressed to this socket")]
    NotForUs(Ipv4Addr),

    #[error("Invalid DHCP magic cookie")]
    InvalidMagicCookie,

    #[error("Payload of {0} bytes does not fit in one datagram")]
    Oversized(usize),
}

/// Errors loading the configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid value for '{key}': {value}")]
    InvalidValue { key: String, value: String },
}
