use std::net::{Ipv4Addr, UdpSocket};
use std::time::Duration;

use macaddr::MacAddr6;
use pktfilter::filter::SentPacket;
use pktfilter::frame::{decode, encode, Headers, LinkType};
use pktfilter::parser::DHCP_MAGIC_COOKIE;
use pktfilter::{
    FilterKind, Iface, IfaceFlags, IfaceMgr, Pkt4, PktFilter, PktFilterError, PktFilterInet,
    TestPktFilter,
};

const CLIENT_MAC: MacAddr6 = MacAddr6::new(0x11, 0x22, 0x33, 0x44, 0x55, 0x66);
const SERVER_MAC: MacAddr6 = MacAddr6::new(0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff);

fn ethernet(name: &str, index: u32, addr: Ipv4Addr) -> Iface {
    Iface::new(name, index)
        .with_mac(SERVER_MAC)
        .with_addr(addr)
        .with_flags(IfaceFlags {
            up: true,
            running: true,
            broadcast: true,
            multicast: true,
            loopback: false,
        })
}

fn loopback() -> Iface {
    Iface::new("lo", 1)
        .with_addr(Ipv4Addr::LOCALHOST)
        .with_flags(IfaceFlags {
            up: true,
            running: true,
            loopback: true,
            ..Default::default()
        })
}

fn dhcp_message(xid: u32) -> Vec<u8> {
    let mut data = vec![0u8; 300];
    data[0] = 1;
    data[1] = 1;
    data[2] = 6;
    data[4..8].copy_from_slice(&xid.to_be_bytes());
    data[28..34].copy_from_slice(CLIENT_MAC.as_bytes());
    data[236..240].copy_from_slice(&DHCP_MAGIC_COOKIE);
    data
}

fn manager_with(filter: &TestPktFilter) -> IfaceMgr {
    let mut mgr = IfaceMgr::new(Box::new(filter.clone()));
    mgr.add_iface(ethernet("eth0", 2, Ipv4Addr::new(192, 0, 2, 1)));
    mgr.add_iface(ethernet("eth1", 3, Ipv4Addr::new(198, 51, 100, 1)));
    mgr
}

#[test]
fn test_portable_backend_on_loopback_rejects_direct_response() {
    let mut mgr = IfaceMgr::new(Box::new(PktFilterInet::new()));
    mgr.add_iface(loopback());

    mgr.open_socket("lo", Ipv4Addr::LOCALHOST, 0, false, false)
        .unwrap();
    assert!(!mgr.is_direct_response_supported());

    let pkt = Pkt4::new(dhcp_message(1))
        .with_iface("lo", 1)
        .with_local(Ipv4Addr::LOCALHOST, 67)
        .with_remote(Ipv4Addr::new(192, 0, 2, 50), 68)
        .with_direct_response(CLIENT_MAC);
    assert!(matches!(
        mgr.send(&pkt),
        Err(PktFilterError::DirectResponseUnsupported)
    ));
}

#[test]
fn test_portable_backend_sends_and_receives_through_manager() {
    let mut mgr = IfaceMgr::new(Box::new(PktFilterInet::new()));
    mgr.add_iface(loopback());
    mgr.open_socket("lo", Ipv4Addr::LOCALHOST, 0, false, false)
        .unwrap();

    let port = socket2::SockRef::from(&mgr.sockets("lo")[0])
        .local_addr()
        .unwrap()
        .as_socket_ipv4()
        .unwrap()
        .port();

    let client = UdpSocket::bind("127.0.0.1:0").unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    client.send_to(&dhcp_message(7), ("127.0.0.1", port)).unwrap();

    let pkt = mgr.receive4(Duration::from_secs(2)).unwrap().unwrap();
    assert_eq!(pkt.header().unwrap().xid, 7);
    assert_eq!(pkt.iface, "lo");

    let client_port = client.local_addr().unwrap().port();
    let reply = Pkt4::new(vec![2u8; 64])
        .with_iface("lo", 1)
        .with_local(Ipv4Addr::LOCALHOST, port)
        .with_remote(Ipv4Addr::LOCALHOST, client_port);
    mgr.send(&reply).unwrap();

    let mut buf = [0u8; 128];
    let (len, _) = client.recv_from(&mut buf).unwrap();
    assert_eq!(&buf[..len], &[2u8; 64]);
}

#[test]
fn test_raw_frame_carries_link_addresses_and_payload() {
    let payload = dhcp_message(0xdeadbeef);
    let headers = Headers {
        src_mac: SERVER_MAC,
        dst_mac: CLIENT_MAC,
        src_ip: Ipv4Addr::new(192, 0, 2, 1),
        dst_ip: Ipv4Addr::new(192, 0, 2, 50),
        src_port: 67,
        dst_port: 68,
    };

    let bytes = encode(LinkType::Ethernet, &headers, &payload).unwrap();
    assert_eq!(&bytes[0..6], CLIENT_MAC.as_bytes());
    assert_eq!(&bytes[6..12], SERVER_MAC.as_bytes());

    let frame = decode(LinkType::Ethernet, &bytes).unwrap();
    assert_eq!(frame.headers, headers);
    assert_eq!(frame.payload.len(), payload.len());
    assert_eq!(frame.payload, payload.as_slice());
}

#[test]
fn test_double_round_trip() {
    let filter = TestPktFilter::new(true);
    let mut mgr = manager_with(&filter);
    assert_eq!(mgr.open_sockets4(67, true), 2);
    assert!(mgr.is_direct_response_supported());

    let inbound = Pkt4::new(dhcp_message(42))
        .with_iface("eth1", 3)
        .with_remote(Ipv4Addr::UNSPECIFIED, 68)
        .with_remote_hw_addr(CLIENT_MAC);
    filter.queue_packet(inbound.clone());

    let received = mgr.receive4(Duration::from_secs(1)).unwrap().unwrap();
    assert_eq!(received, inbound);

    let reply = Pkt4::new(vec![9u8; 300])
        .with_iface("eth1", 3)
        .with_local(Ipv4Addr::new(198, 51, 100, 1), 67)
        .with_remote(Ipv4Addr::new(198, 51, 100, 77), 68)
        .with_direct_response(CLIENT_MAC);
    mgr.send(&reply).unwrap();

    let sent = filter.sent();
    assert_eq!(
        sent,
        vec![SentPacket {
            iface: "eth1".to_string(),
            sockfd: mgr.sockets("eth1")[0].fd(),
            pkt: reply,
        }]
    );
    assert_eq!(sent[0].pkt.data, vec![9u8; 300]);
    assert_eq!(sent[0].pkt.remote_hw_addr, Some(CLIENT_MAC));
}

#[test]
fn test_send_uses_socket_bound_to_local_address() {
    let filter = TestPktFilter::new(false);
    let mut mgr = IfaceMgr::new(Box::new(filter.clone()));
    mgr.add_iface(
        ethernet("eth0", 2, Ipv4Addr::new(192, 0, 2, 1)).with_addr(Ipv4Addr::new(192, 0, 2, 2)),
    );

    let first = mgr
        .open_socket("eth0", Ipv4Addr::new(192, 0, 2, 1), 67, false, false)
        .unwrap();
    let second = mgr
        .open_socket("eth0", Ipv4Addr::new(192, 0, 2, 2), 67, false, false)
        .unwrap();

    let to_second = Pkt4::new(vec![1])
        .with_iface("eth0", 2)
        .with_local(Ipv4Addr::new(192, 0, 2, 2), 67);
    let unmatched = Pkt4::new(vec![2])
        .with_iface("eth0", 2)
        .with_local(Ipv4Addr::new(192, 0, 2, 9), 67);
    mgr.send(&to_second).unwrap();
    mgr.send(&unmatched).unwrap();

    let sent = filter.sent();
    assert_eq!(sent[0].sockfd, second);
    assert_eq!(sent[1].sockfd, first);
}

#[test]
fn test_send_errors_name_the_problem() {
    let filter = TestPktFilter::new(false);
    let mgr = manager_with(&filter);

    let no_iface = Pkt4::new(vec![]).with_iface("wlan0", 9);
    assert!(matches!(mgr.send(&no_iface), Err(PktFilterError::UnknownIface(_))));

    let no_socket = Pkt4::new(vec![]).with_iface("eth0", 2);
    assert!(matches!(mgr.send(&no_socket), Err(PktFilterError::NoSocket(_))));
}

#[test]
fn test_direct_response_checked_before_filter() {
    let filter = TestPktFilter::new(false);
    let mut mgr = manager_with(&filter);
    mgr.open_sockets4(67, false);

    let pkt = Pkt4::new(vec![1])
        .with_iface("eth0", 2)
        .with_direct_response(CLIENT_MAC);
    assert!(matches!(
        mgr.send(&pkt),
        Err(PktFilterError::DirectResponseUnsupported)
    ));

    filter.set_direct_response_supported(true);
    mgr.send(&pkt).unwrap();
    assert_eq!(filter.sent().len(), 1);
}

#[test]
fn test_open_close_reopen() {
    let filter = TestPktFilter::new(false);
    let mut mgr = manager_with(&filter);

    for _ in 0..3 {
        assert_eq!(mgr.open_sockets4(67, true), 2);
        assert_eq!(mgr.socket_count(), 2);
        mgr.close_sockets();
        assert_eq!(mgr.socket_count(), 0);
    }
    assert_eq!(filter.open_count(), 6);
}

#[test]
fn test_portable_backend_reopens_fixed_port() {
    const PORT: u16 = 16769;
    let mut mgr = IfaceMgr::new(Box::new(PktFilterInet::new()));
    mgr.add_iface(loopback());

    for round in 0..3u32 {
        mgr.open_socket("lo", Ipv4Addr::LOCALHOST, PORT, false, false)
            .unwrap();

        let client = UdpSocket::bind("127.0.0.1:0").unwrap();
        client
            .send_to(&dhcp_message(round), ("127.0.0.1", PORT))
            .unwrap();
        let pkt = mgr.receive4(Duration::from_secs(2)).unwrap().unwrap();
        assert_eq!(pkt.header().unwrap().xid, round);

        mgr.close_sockets();
        assert_eq!(mgr.socket_count(), 0);

        // A socket without SO_REUSEADDR can only bind once nothing holds the port
        drop(UdpSocket::bind(("127.0.0.1", PORT)).unwrap());
    }
}

#[test]
fn test_closing_one_iface_leaves_siblings_open() {
    let filter = TestPktFilter::new(false);
    let mut mgr = manager_with(&filter);
    mgr.open_sockets4(67, true);

    assert_eq!(mgr.close_sockets_on("eth0").unwrap(), 1);
    assert!(mgr.sockets("eth0").is_empty());
    assert_eq!(mgr.sockets("eth1").len(), 1);

    filter.queue_packet(Pkt4::new(dhcp_message(5)).with_iface("eth1", 3));
    let pkt = mgr.receive4(Duration::from_secs(1)).unwrap().unwrap();
    assert_eq!(pkt.iface, "eth1");

    mgr.open_socket("eth0", Ipv4Addr::new(192, 0, 2, 1), 67, true, true)
        .unwrap();
    assert_eq!(mgr.socket_count(), 2);

    assert!(matches!(
        mgr.close_sockets_on("eth7"),
        Err(PktFilterError::UnknownIface(_))
    ));
}

#[test]
fn test_open_sockets4_skips_unusable_and_failing_ifaces() {
    let filter = TestPktFilter::new(false);
    let mut mgr = manager_with(&filter);

    mgr.add_iface(loopback());

    let mut down = ethernet("eth2", 4, Ipv4Addr::new(203, 0, 113, 1));
    down.flags.up = false;
    mgr.add_iface(down);

    let mut no_addr = ethernet("eth3", 5, Ipv4Addr::UNSPECIFIED);
    no_addr.addrs.clear();
    mgr.add_iface(no_addr);

    filter.fail_open_on("eth1");

    assert_eq!(mgr.open_sockets4(67, true), 1);
    assert_eq!(mgr.sockets("eth0").len(), 1);
    for name in ["eth1", "eth2", "eth3", "lo"] {
        assert!(mgr.sockets(name).is_empty(), "{}", name);
    }
}

#[test]
fn test_open_sockets4_does_not_request_broadcast_unsupported() {
    let filter = TestPktFilter::new(false);
    let mut mgr = IfaceMgr::new(Box::new(filter.clone()));

    let mut p2p = ethernet("ppp0", 6, Ipv4Addr::new(10, 64, 0, 1));
    p2p.flags.broadcast = false;
    mgr.add_iface(p2p);

    assert_eq!(mgr.open_sockets4(67, true), 1);
}

#[test]
fn test_broadcast_send_on_non_broadcast_iface_fails_everywhere() {
    let mut iface = ethernet("ppp0", 6, Ipv4Addr::new(10, 64, 0, 1));
    iface.flags.broadcast = false;

    let mut filters: Vec<Box<dyn PktFilter>> = vec![
        Box::new(PktFilterInet::new()),
        Box::new(TestPktFilter::new(false)),
        Box::new(TestPktFilter::new(true)),
    ];
    for kind in FilterKind::available() {
        filters.push(kind.create().unwrap());
    }

    for filter in &filters {
        let err = filter
            .open_socket(&iface, Ipv4Addr::new(10, 64, 0, 1), 67, false, true)
            .unwrap_err();
        assert!(err.is_socket_open_error(), "{}", filter.name());
        assert!(
            matches!(err, PktFilterError::BroadcastUnsupported(_)),
            "{}",
            filter.name()
        );
    }
}

#[test]
fn test_capability_is_stable_and_needs_no_socket() {
    for kind in FilterKind::available() {
        let filter = kind.create().unwrap();
        let first = filter.is_direct_response_supported();
        for _ in 0..3 {
            assert_eq!(filter.is_direct_response_supported(), first);
        }
        assert_eq!(first, kind != FilterKind::Inet);
    }
}

#[test]
fn test_filter_change_allowed_after_close() {
    let filter = TestPktFilter::new(false);
    let mut mgr = manager_with(&filter);
    mgr.open_sockets4(67, true);

    assert!(matches!(
        mgr.set_packet_filter(Box::new(TestPktFilter::new(true))),
        Err(PktFilterError::FilterChangeDenied)
    ));
    assert!(!mgr.is_direct_response_supported());

    mgr.close_sockets();
    mgr.set_packet_filter(Box::new(TestPktFilter::new(true)))
        .unwrap();
    assert!(mgr.is_direct_response_supported());
}
