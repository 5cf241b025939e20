//! Data model shared by the packet filters.
//!
//! Interfaces, open socket records and packets. These carry no I/O of their
//! own; the filters operate on them.

mod iface;
mod packet;
mod socket;

pub use iface::{interfaces, Iface, IfaceFlags};
pub use packet::Pkt4;
pub use socket::{SocketInfo, SocketMode};
