//! Packet filters.
//!
//! This module defines the `PktFilter` trait and its backends: a portable
//! one over ordinary UDP sockets, a raw link-layer one per platform, and a
//! test double. Callers depend on the trait and pick a backend once with
//! [`FilterKind::create`].

mod inet;
mod raw;
mod test_double;

#[cfg(target_os = "linux")]
mod lpf;

#[cfg(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd",
    target_os = "dragonfly"
))]
mod bpf;

pub use inet::PktFilterInet;
pub use raw::resolve_remote_hw_addr;
pub use test_double::{SentPacket, TestPktFilter};

#[cfg(target_os = "linux")]
pub use lpf::PktFilterLpf;

#[cfg(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd",
    target_os = "dragonfly"
))]
pub use bpf::PktFilterBpf;

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use tracing::debug;

use crate::domain::{Iface, Pkt4, SocketInfo};
use crate::error::PktFilterError;

/// How DHCPv4 packets are exchanged with the network (Strategy).
///
/// Implementations keep no per-socket state of their own: everything a
/// socket needs lives in its [`SocketInfo`]. All methods take `&self`, so a
/// single filter serves every interface.
pub trait PktFilter {
    /// Short backend name for logs and listings.
    fn name(&self) -> &'static str;

    /// Whether replies can be addressed to a client that has no IP address
    /// yet, using the hardware address from the request.
    fn is_direct_response_supported(&self) -> bool;

    /// Open a socket on `iface` bound to `addr:port`.
    ///
    /// Broadcast receive and broadcast send are configured independently;
    /// requesting either on an interface without broadcast support fails.
    fn open_socket(
        &self,
        iface: &Iface,
        addr: Ipv4Addr,
        port: u16,
        receive_bcast: bool,
        send_bcast: bool,
    ) -> Result<SocketInfo, PktFilterError>;

    /// Read one packet from a readable socket.
    ///
    /// `Ok(None)` means a frame was read and dropped: malformed, not DHCP,
    /// or not addressed to this socket. Errors are reserved for I/O faults.
    fn receive(&self, iface: &Iface, socket: &SocketInfo) -> Result<Option<Pkt4>, PktFilterError>;

    /// Send one packet through `socket`.
    fn send(&self, iface: &Iface, socket: &SocketInfo, pkt: &Pkt4) -> Result<(), PktFilterError>;
}

/// Backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FilterKind {
    /// The platform raw backend when privileged, otherwise `Inet`
    #[default]
    Auto,
    /// Ordinary UDP sockets
    Inet,
    /// Linux packet sockets
    Lpf,
    /// BSD packet filter devices
    Bpf,
}

#[cfg(target_os = "linux")]
const RAW_KIND: Option<FilterKind> = Some(FilterKind::Lpf);

#[cfg(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd",
    target_os = "dragonfly"
))]
const RAW_KIND: Option<FilterKind> = Some(FilterKind::Bpf);

#[cfg(not(any(
    target_os = "linux",
    target_os = "macos",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd",
    target_os = "dragonfly"
)))]
const RAW_KIND: Option<FilterKind> = None;

impl FilterKind {
    /// Backends compiled for this platform, `Auto` excluded.
    pub fn available() -> Vec<FilterKind> {
        let mut kinds = vec![FilterKind::Inet];
        kinds.extend(RAW_KIND);
        kinds
    }

    /// Whether this backend can be created on this platform.
    pub fn is_available(&self) -> bool {
        match self {
            Self::Auto | Self::Inet => true,
            raw => RAW_KIND == Some(*raw),
        }
    }

    /// Resolve `Auto` to a concrete backend; other kinds resolve to themselves.
    pub fn resolve(self) -> FilterKind {
        match self {
            Self::Auto => match RAW_KIND {
                Some(raw) if is_privileged() => raw,
                _ => Self::Inet,
            },
            kind => kind,
        }
    }

    /// Create the backend.
    ///
    /// Fails with `InvalidPacketFilter` when the backend is not compiled
    /// for this platform.
    pub fn create(self) -> Result<Box<dyn PktFilter>, PktFilterError> {
        let kind = self.resolve();
        if !kind.is_available() {
            return Err(PktFilterError::InvalidPacketFilter(format!(
                "{} is not supported on this platform",
                kind
            )));
        }
        debug!("Selected packet filter {} (requested {})", kind, self);
        instantiate(kind)
    }
}

fn instantiate(kind: FilterKind) -> Result<Box<dyn PktFilter>, PktFilterError> {
    match kind {
        FilterKind::Inet => Ok(Box::new(PktFilterInet::new())),
        #[cfg(target_os = "linux")]
        FilterKind::Lpf => Ok(Box::new(PktFilterLpf::new())),
        #[cfg(any(
            target_os = "macos",
            target_os = "freebsd",
            target_os = "openbsd",
            target_os = "netbsd",
            target_os = "dragonfly"
        ))]
        FilterKind::Bpf => Ok(Box::new(PktFilterBpf::new())),
        other => Err(PktFilterError::InvalidPacketFilter(other.to_string())),
    }
}

/// Raw sockets need an effective uid of 0.
fn is_privileged() -> bool {
    // SAFETY: geteuid has no preconditions and cannot fail.
    unsafe { libc::geteuid() == 0 }
}

impl fmt::Display for FilterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Auto => "auto",
            Self::Inet => "inet",
            Self::Lpf => "lpf",
            Self::Bpf => "bpf",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for FilterKind {
    type Err = PktFilterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "inet" | "udp" => Ok(Self::Inet),
            "lpf" => Ok(Self::Lpf),
            "bpf" => Ok(Self::Bpf),
            other => Err(PktFilterError::InvalidPacketFilter(other.to_string())),
        }
    }
}

/// Checks shared by every backend before any OS resource is allocated.
pub(crate) fn validate_open(
    iface: &Iface,
    receive_bcast: bool,
    send_bcast: bool,
) -> Result<(), PktFilterError> {
    if !iface.flags.up {
        return Err(PktFilterError::IfaceDown(iface.name.clone()));
    }
    if (receive_bcast || send_bcast) && !iface.flags.broadcast {
        return Err(PktFilterError::BroadcastUnsupported(iface.name.clone()));
    }
    Ok(())
}
