//! Kernel classifier program for DHCP capture.
//!
//! Classic BPF, accepted both by Linux `SO_ATTACH_FILTER` and by the BSD
//! `BIOCSETF` ioctl. The program keeps IPv4/UDP datagrams that are not
//! fragments and whose destination port is the socket's port. Everything
//! else is dropped in the kernel.

use super::{LinkType, AF_INET, ETHERTYPE_IPV4, IPPROTO_UDP};

/// One classic BPF instruction.
///
/// Same layout as Linux `struct sock_filter` and BSD `struct bpf_insn`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BpfInsn {
    pub code: u16,
    pub jt: u8,
    pub jf: u8,
    pub k: u32,
}

const _: () = assert!(std::mem::size_of::<BpfInsn>() == 8);

impl BpfInsn {
    pub const fn new(code: u16, jt: u8, jf: u8, k: u32) -> Self {
        Self { code, jt, jf, k }
    }
}

// Instruction classes
const BPF_LD: u16 = 0x00;
const BPF_LDX: u16 = 0x01;
const BPF_JMP: u16 = 0x05;
const BPF_RET: u16 = 0x06;

// Sizes
const BPF_W: u16 = 0x00;
const BPF_H: u16 = 0x08;
const BPF_B: u16 = 0x10;

// Modes
const BPF_ABS: u16 = 0x20;
const BPF_IND: u16 = 0x40;
const BPF_MSH: u16 = 0xa0;

// Jumps
const BPF_JEQ: u16 = 0x10;
const BPF_JSET: u16 = 0x40;
const BPF_K: u16 = 0x00;

/// Fragment offset and More Fragments bits of the flags word
const IP_FRAGMENT_MASK: u32 = 0x3fff;

/// Accept the whole frame
const ACCEPT: u32 = u32::MAX;

/// Linux ancillary load of the packet type (`SKF_AD_OFF + SKF_AD_PKTTYPE`)
const SKF_AD_PKTTYPE_OFF: u32 = (-0x1000i32 + 4) as u32;

/// Packet type Linux reports for frames sent by this host
pub const PACKET_OUTGOING: u32 = 4;

/// Build the DHCP classifier for `link` framing and destination `port`.
///
/// ```text
///   [0] link protocol        ; ldh [12] (ethernet) / ld [0] (null)
///   [1] jeq #IPv4  +0 drop
///   [2] ldb [L+9]            ; IP protocol
///   [3] jeq #17    +0 drop
///   [4] ldh [L+6]            ; flags + fragment offset
///   [5] jset #0x3fff drop +0
///   [6] ldxb 4*([L]&0xf)     ; X = IP header length
///   [7] ldh [x+L+2]          ; UDP destination port
///   [8] jeq #port  +0 drop
///   [9] ret #-1              ; accept
///  [10] ret #0               ; drop
/// ```
pub fn dhcp_program(link: LinkType, port: u16) -> Vec<BpfInsn> {
    let l = link.header_len() as u32;

    let (load_proto, ipv4) = match link {
        LinkType::Ethernet => (
            BpfInsn::new(BPF_LD | BPF_H | BPF_ABS, 0, 0, 12),
            ETHERTYPE_IPV4 as u32,
        ),
        // The family is stored in host order and BPF loads big-endian
        LinkType::Null => (
            BpfInsn::new(BPF_LD | BPF_W | BPF_ABS, 0, 0, 0),
            u32::from_be_bytes(AF_INET.to_ne_bytes()),
        ),
    };

    vec![
        load_proto,
        BpfInsn::new(BPF_JMP | BPF_JEQ | BPF_K, 0, 8, ipv4),
        BpfInsn::new(BPF_LD | BPF_B | BPF_ABS, 0, 0, l + 9),
        BpfInsn::new(BPF_JMP | BPF_JEQ | BPF_K, 0, 6, IPPROTO_UDP as u32),
        BpfInsn::new(BPF_LD | BPF_H | BPF_ABS, 0, 0, l + 6),
        BpfInsn::new(BPF_JMP | BPF_JSET | BPF_K, 4, 0, IP_FRAGMENT_MASK),
        BpfInsn::new(BPF_LDX | BPF_B | BPF_MSH, 0, 0, l),
        BpfInsn::new(BPF_LD | BPF_H | BPF_IND, 0, 0, l + 2),
        BpfInsn::new(BPF_JMP | BPF_JEQ | BPF_K, 0, 1, port as u32),
        BpfInsn::new(BPF_RET | BPF_K, 0, 0, ACCEPT),
        BpfInsn::new(BPF_RET | BPF_K, 0, 0, 0),
    ]
}

/// Prefix `program` with a check that drops frames this host sent.
///
/// Linux packet sockets also capture outbound frames; without the check a
/// server would read its own replies back. The packet type comes from the
/// kernel's ancillary load, so the prefix is Linux-only. The last
/// instruction of `program` must be its drop.
pub fn exclude_outgoing(program: &[BpfInsn]) -> Vec<BpfInsn> {
    let to_drop = program.len().saturating_sub(1) as u8;

    let mut prefixed = Vec::with_capacity(program.len() + 2);
    prefixed.push(BpfInsn::new(BPF_LD | BPF_B | BPF_ABS, 0, 0, SKF_AD_PKTTYPE_OFF));
    prefixed.push(BpfInsn::new(BPF_JMP | BPF_JEQ | BPF_K, to_drop, 0, PACKET_OUTGOING));
    prefixed.extend_from_slice(program);
    prefixed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{encode, Headers};
    use macaddr::MacAddr6;
    use std::net::Ipv4Addr;

    /// Packet types as Linux reports them for inbound frames
    const PACKET_HOST: u32 = 0;
    const PACKET_BROADCAST: u32 = 1;

    fn execute(program: &[BpfInsn], packet: &[u8]) -> u32 {
        execute_as(program, packet, PACKET_HOST)
    }

    /// Run a classic BPF program over a packet of the given packet type.
    ///
    /// Supports the subset the classifier uses: LD (W/H/B with ABS/IND and
    /// the packet type ancillary load), LDX MSH, JEQ/JSET with constants,
    /// RET. Out-of-bounds loads reject, as the kernel does.
    fn execute_as(program: &[BpfInsn], packet: &[u8], pkttype: u32) -> u32 {
        let load = |off: usize, size: u16| -> Option<u32> {
            match size {
                BPF_W => packet
                    .get(off..off + 4)
                    .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]])),
                BPF_H => packet
                    .get(off..off + 2)
                    .map(|b| u16::from_be_bytes([b[0], b[1]]) as u32),
                BPF_B => packet.get(off).map(|b| *b as u32),
                _ => None,
            }
        };

        let mut a: u32 = 0;
        let mut x: u32 = 0;
        let mut pc = 0usize;

        while pc < program.len() {
            let insn = program[pc];
            let class = insn.code & 0x07;
            let size = insn.code & 0x18;
            let mode = insn.code & 0xe0;
            pc += 1;

            match class {
                BPF_LD if mode == BPF_ABS && insn.k == SKF_AD_PKTTYPE_OFF => a = pkttype,
                BPF_LD => {
                    let off = match mode {
                        BPF_ABS => insn.k as usize,
                        BPF_IND => (x + insn.k) as usize,
                        _ => return 0,
                    };
                    match load(off, size) {
                        Some(v) => a = v,
                        None => return 0,
                    }
                }
                BPF_LDX if mode == BPF_MSH => match packet.get(insn.k as usize) {
                    Some(b) => x = 4 * (*b as u32 & 0x0f),
                    None => return 0,
                },
                BPF_JMP => {
                    let taken = match insn.code & 0xf0 {
                        BPF_JEQ => a == insn.k,
                        BPF_JSET => a & insn.k != 0,
                        _ => return 0,
                    };
                    pc += if taken { insn.jt } else { insn.jf } as usize;
                }
                BPF_RET => return insn.k,
                _ => return 0,
            }
        }
        0
    }

    fn dhcp_frame(link: LinkType, dst_port: u16) -> Vec<u8> {
        let headers = Headers {
            src_mac: MacAddr6::new(0x11, 0x22, 0x33, 0x44, 0x55, 0x66),
            dst_mac: MacAddr6::broadcast(),
            src_ip: Ipv4Addr::UNSPECIFIED,
            dst_ip: Ipv4Addr::BROADCAST,
            src_port: 68,
            dst_port,
        };
        encode(link, &headers, &[0u8; 300]).unwrap()
    }

    #[test]
    fn test_program_shape() {
        let program = dhcp_program(LinkType::Ethernet, 67);
        assert_eq!(program.len(), 11);
        assert_eq!(program[8].k, 67);
        assert_eq!(program[9], BpfInsn::new(BPF_RET | BPF_K, 0, 0, ACCEPT));
        assert_eq!(program[10], BpfInsn::new(BPF_RET | BPF_K, 0, 0, 0));
    }

    #[test]
    fn test_jumps_stay_in_program() {
        for link in [LinkType::Ethernet, LinkType::Null] {
            for program in [
                dhcp_program(link, 67),
                exclude_outgoing(&dhcp_program(link, 67)),
            ] {
                for (i, insn) in program.iter().enumerate() {
                    if insn.code & 0x07 == BPF_JMP {
                        assert!(i + 1 + (insn.jt as usize) < program.len());
                        assert!(i + 1 + (insn.jf as usize) < program.len());
                    }
                }
            }
        }
    }

    #[test]
    fn test_accepts_dhcp_on_port() {
        let program = dhcp_program(LinkType::Ethernet, 67);
        assert_eq!(execute(&program, &dhcp_frame(LinkType::Ethernet, 67)), ACCEPT);
    }

    #[test]
    fn test_rejects_other_port() {
        let program = dhcp_program(LinkType::Ethernet, 67);
        assert_eq!(execute(&program, &dhcp_frame(LinkType::Ethernet, 68)), 0);
        assert_eq!(execute(&program, &dhcp_frame(LinkType::Ethernet, 53)), 0);
    }

    #[test]
    fn test_port_is_patched_in() {
        let program = dhcp_program(LinkType::Ethernet, 1067);
        assert_eq!(execute(&program, &dhcp_frame(LinkType::Ethernet, 1067)), ACCEPT);
        assert_eq!(execute(&program, &dhcp_frame(LinkType::Ethernet, 67)), 0);
    }

    #[test]
    fn test_rejects_arp() {
        let program = dhcp_program(LinkType::Ethernet, 67);
        let mut frame = dhcp_frame(LinkType::Ethernet, 67);
        frame[12..14].copy_from_slice(&[0x08, 0x06]);
        assert_eq!(execute(&program, &frame), 0);
    }

    #[test]
    fn test_rejects_tcp() {
        let program = dhcp_program(LinkType::Ethernet, 67);
        let mut frame = dhcp_frame(LinkType::Ethernet, 67);
        frame[23] = 6;
        assert_eq!(execute(&program, &frame), 0);
    }

    #[test]
    fn test_rejects_fragments() {
        let program = dhcp_program(LinkType::Ethernet, 67);

        let mut more_fragments = dhcp_frame(LinkType::Ethernet, 67);
        more_fragments[20..22].copy_from_slice(&0x2000u16.to_be_bytes());
        assert_eq!(execute(&program, &more_fragments), 0);

        let mut offset = dhcp_frame(LinkType::Ethernet, 67);
        offset[20..22].copy_from_slice(&0x4010u16.to_be_bytes());
        assert_eq!(execute(&program, &offset), 0);
    }

    #[test]
    fn test_honours_ip_options() {
        // Grow the IP header to 24 bytes; the port must be found behind it
        let frame = dhcp_frame(LinkType::Ethernet, 67);
        let mut with_options = frame[..34].to_vec();
        with_options[14] = 0x46;
        with_options.extend_from_slice(&[1, 1, 1, 0]);
        with_options.extend_from_slice(&frame[34..]);

        let program = dhcp_program(LinkType::Ethernet, 67);
        assert_eq!(execute(&program, &with_options), ACCEPT);
    }

    #[test]
    fn test_null_link() {
        let program = dhcp_program(LinkType::Null, 67);
        assert_eq!(execute(&program, &dhcp_frame(LinkType::Null, 67)), ACCEPT);
        assert_eq!(execute(&program, &dhcp_frame(LinkType::Null, 68)), 0);

        let mut other_family = dhcp_frame(LinkType::Null, 67);
        other_family[0..4].copy_from_slice(&30u32.to_ne_bytes());
        assert_eq!(execute(&program, &other_family), 0);
    }

    #[test]
    fn test_short_frame_is_rejected() {
        let program = dhcp_program(LinkType::Ethernet, 67);
        assert_eq!(execute(&program, &[0u8; 13]), 0);
    }

    mod outgoing_tests {
        use super::*;

        fn program() -> Vec<BpfInsn> {
            exclude_outgoing(&dhcp_program(LinkType::Ethernet, 67))
        }

        #[test]
        fn test_own_frames_are_dropped() {
            let frame = dhcp_frame(LinkType::Ethernet, 67);
            assert_eq!(execute_as(&program(), &frame, PACKET_OUTGOING), 0);
        }

        #[test]
        fn test_inbound_frames_pass() {
            let frame = dhcp_frame(LinkType::Ethernet, 67);
            assert_eq!(execute_as(&program(), &frame, PACKET_HOST), ACCEPT);
            assert_eq!(execute_as(&program(), &frame, PACKET_BROADCAST), ACCEPT);
        }

        #[test]
        fn test_inbound_filtering_is_unchanged() {
            let frame = dhcp_frame(LinkType::Ethernet, 68);
            assert_eq!(execute_as(&program(), &frame, PACKET_HOST), 0);
        }

        #[test]
        fn test_prefix_shape() {
            let program = program();
            assert_eq!(program.len(), 13);
            assert_eq!(program[0].k, 0xffff_f004);
            assert_eq!(program[1].jt, 10);
            assert_eq!(program[12], BpfInsn::new(BPF_RET | BPF_K, 0, 0, 0));
        }
    }
}
