//! pktfilter - DHCPv4 packet filter layer
//!
//! Moves DHCPv4 packets between a server and the network through
//! interchangeable backends. The portable backend uses ordinary UDP
//! sockets. The raw backends (Linux packet sockets, BSD packet filter
//! devices) capture below the IP stack so a server can answer clients that
//! have no IP address yet, addressing the reply by hardware address.
//!
//! The crate is organized as follows:
//! - `domain`: Interfaces, socket records and packets
//! - `frame`: Link/IPv4/UDP framing, checksums and the kernel classifier
//! - `parser`: BOOTP fixed-header validation
//! - `filter`: The `PktFilter` trait and its backends
//! - `manager`: Interface and socket ownership with poll(2) multiplexing
//! - `config`: File and environment configuration

pub mod config;
pub mod domain;
pub mod error;
pub mod filter;
pub mod frame;
pub mod manager;
pub mod parser;

pub use config::Config;
pub use domain::{Iface, IfaceFlags, Pkt4, SocketInfo};
pub use error::{ConfigError, FrameError, PktFilterError};
pub use filter::{FilterKind, PktFilter, PktFilterInet, TestPktFilter};
pub use manager::IfaceMgr;
