//! DHCP message validation.
//!
//! This module is responsible for recognising DHCP payloads inside UDP
//! datagrams. Option decoding belongs to the message layer.

mod bootp_parser;

pub use bootp_parser::{BootpHeader, BootpParser, DHCP_MAGIC_COOKIE, MIN_DHCP_LEN};
