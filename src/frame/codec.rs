//! Frame encoder and decoder.

use std::net::Ipv4Addr;

use macaddr::MacAddr6;
use pnet::packet::ethernet::{EtherTypes, EthernetPacket, MutableEthernetPacket};
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::{self, Ipv4Flags, Ipv4Packet, MutableIpv4Packet};
use pnet::packet::udp::{self, MutableUdpPacket, UdpPacket};
use pnet::util::MacAddr;

use super::{
    LinkType, AF_INET, DEFAULT_TTL, ETHERNET_HEADER_LEN, IPTOS_LOWDELAY, IPV4_HEADER_LEN,
    NULL_HEADER_LEN, UDP_HEADER_LEN,
};
use crate::error::FrameError;

/// Addressing of one frame at every layer.
///
/// Hardware addresses are nil on links without them (null/loopback).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Headers {
    pub src_mac: MacAddr6,
    pub dst_mac: MacAddr6,
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
}

/// A decoded frame borrowing its payload from the capture buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame<'a> {
    pub headers: Headers,
    pub payload: &'a [u8],
}

/// Build a complete frame around `payload`.
///
/// Writes the link header, an option-less IPv4 header with its checksum, and
/// a UDP header with its pseudo-header checksum, followed by the payload
/// unchanged.
pub fn encode(link: LinkType, headers: &Headers, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    let udp_len = UDP_HEADER_LEN + payload.len();
    let ip_len = IPV4_HEADER_LEN + udp_len;
    if ip_len > u16::MAX as usize {
        return Err(FrameError::Oversized(payload.len()));
    }

    let link_len = link.header_len();
    let mut buf = vec![0u8; link_len + ip_len];

    let (link_buf, rest) = buf.split_at_mut(link_len);
    let (ip_buf, udp_buf) = rest.split_at_mut(IPV4_HEADER_LEN);
    write_link_header(link, link_buf, headers)?;
    write_ipv4_header(ip_buf, headers, ip_len as u16)?;
    write_udp(udp_buf, headers, udp_len as u16, payload)?;

    Ok(buf)
}

fn too_short(layer: &'static str, expected: usize, actual: usize) -> FrameError {
    FrameError::Truncated {
        layer,
        expected,
        actual,
    }
}

fn to_pnet_mac(mac: MacAddr6) -> MacAddr {
    let [a, b, c, d, e, f] = mac.into_array();
    MacAddr::new(a, b, c, d, e, f)
}

fn write_link_header(link: LinkType, buf: &mut [u8], headers: &Headers) -> Result<(), FrameError> {
    match link {
        LinkType::Ethernet => {
            let len = buf.len();
            let mut eth = MutableEthernetPacket::new(buf)
                .ok_or_else(|| too_short("ethernet", ETHERNET_HEADER_LEN, len))?;
            eth.set_destination(to_pnet_mac(headers.dst_mac));
            eth.set_source(to_pnet_mac(headers.src_mac));
            eth.set_ethertype(EtherTypes::Ipv4);
        }
        LinkType::Null => {
            buf[..NULL_HEADER_LEN].copy_from_slice(&AF_INET.to_ne_bytes());
        }
    }
    Ok(())
}

fn write_ipv4_header(buf: &mut [u8], headers: &Headers, total_len: u16) -> Result<(), FrameError> {
    let len = buf.len();
    let mut ip =
        MutableIpv4Packet::new(buf).ok_or_else(|| too_short("ipv4", IPV4_HEADER_LEN, len))?;
    ip.set_version(4);
    ip.set_header_length((IPV4_HEADER_LEN / 4) as u8);
    // TOS byte: DSCP in the upper six bits
    ip.set_dscp(IPTOS_LOWDELAY >> 2);
    ip.set_total_length(total_len);
    ip.set_identification(0);
    ip.set_flags(Ipv4Flags::DontFragment);
    ip.set_ttl(DEFAULT_TTL);
    ip.set_next_level_protocol(IpNextHeaderProtocols::Udp);
    ip.set_source(headers.src_ip);
    ip.set_destination(headers.dst_ip);
    let checksum = ipv4::checksum(&ip.to_immutable());
    ip.set_checksum(checksum);
    Ok(())
}

fn write_udp(
    buf: &mut [u8],
    headers: &Headers,
    udp_len: u16,
    payload: &[u8],
) -> Result<(), FrameError> {
    let len = buf.len();
    let mut udp =
        MutableUdpPacket::new(buf).ok_or_else(|| too_short("udp", UDP_HEADER_LEN, len))?;
    udp.set_source(headers.src_port);
    udp.set_destination(headers.dst_port);
    udp.set_length(udp_len);
    udp.set_payload(payload);
    let checksum = udp_checksum(&udp.to_immutable(), &headers.src_ip, &headers.dst_ip);
    udp.set_checksum(checksum);
    Ok(())
}

/// UDP checksum over the IPv4 pseudo-header.
///
/// A computed 0 is sent as 0xFFFF: 0 on the wire means "no checksum".
fn udp_checksum(packet: &UdpPacket, src: &Ipv4Addr, dst: &Ipv4Addr) -> u16 {
    match udp::ipv4_checksum(packet, src, dst) {
        0 => 0xffff,
        checksum => checksum,
    }
}

/// Parse a captured frame down to its UDP payload.
///
/// Every length field is checked against the bytes actually captured. Any
/// inconsistency is reported as a [`FrameError`] so the caller can drop the
/// frame.
pub fn decode(link: LinkType, data: &[u8]) -> Result<Frame<'_>, FrameError> {
    let (src_mac, dst_mac) = match link {
        LinkType::Ethernet => {
            let ethernet = EthernetPacket::new(data).ok_or(FrameError::Truncated {
                layer: "ethernet",
                expected: ETHERNET_HEADER_LEN,
                actual: data.len(),
            })?;
            let ethertype = ethernet.get_ethertype();
            if ethertype != EtherTypes::Ipv4 {
                return Err(FrameError::NotIpv4(ethertype.0 as u32));
            }
            (
                MacAddr6::from(ethernet.get_source().octets()),
                MacAddr6::from(ethernet.get_destination().octets()),
            )
        }
        LinkType::Null => {
            if data.len() < NULL_HEADER_LEN {
                return Err(FrameError::Truncated {
                    layer: "link",
                    expected: NULL_HEADER_LEN,
                    actual: data.len(),
                });
            }
            let family = u32::from_ne_bytes([data[0], data[1], data[2], data[3]]);
            if family != AF_INET {
                return Err(FrameError::NotIpv4(family));
            }
            (MacAddr6::nil(), MacAddr6::nil())
        }
    };

    let l3 = &data[link.header_len()..];
    let ip = Ipv4Packet::new(l3).ok_or(FrameError::Truncated {
        layer: "ipv4",
        expected: IPV4_HEADER_LEN,
        actual: l3.len(),
    })?;

    if ip.get_version() != 4 {
        return Err(FrameError::BadIpVersion(ip.get_version()));
    }

    let ihl = ip.get_header_length() as usize * 4;
    if ihl < IPV4_HEADER_LEN || ihl > l3.len() {
        return Err(FrameError::BadHeaderLength(ihl));
    }

    // Trailing link padding is allowed; a short capture is not
    let total = ip.get_total_length() as usize;
    if total < ihl + UDP_HEADER_LEN || total > l3.len() {
        return Err(FrameError::TotalLength {
            declared: total,
            available: l3.len(),
        });
    }

    if ipv4::checksum(&ip) != ip.get_checksum() {
        return Err(FrameError::BadChecksum);
    }

    if ip.get_flags() & Ipv4Flags::MoreFragments != 0 || ip.get_fragment_offset() != 0 {
        return Err(FrameError::Fragmented);
    }

    if ip.get_next_level_protocol() != IpNextHeaderProtocols::Udp {
        return Err(FrameError::NotUdp(ip.get_next_level_protocol().0));
    }

    let l4 = &l3[ihl..total];
    let udp = UdpPacket::new(l4).ok_or(FrameError::Truncated {
        layer: "udp",
        expected: UDP_HEADER_LEN,
        actual: l4.len(),
    })?;

    let udp_len = udp.get_length() as usize;
    if udp_len < UDP_HEADER_LEN || udp_len > l4.len() {
        return Err(FrameError::UdpLength {
            declared: udp_len,
            available: l4.len(),
        });
    }

    Ok(Frame {
        headers: Headers {
            src_mac,
            dst_mac,
            src_ip: ip.get_source(),
            dst_ip: ip.get_destination(),
            src_port: udp.get_source(),
            dst_port: udp.get_destination(),
        },
        payload: &l4[UDP_HEADER_LEN..udp_len],
    })
}
