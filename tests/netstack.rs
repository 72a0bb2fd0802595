//! End-to-end stack scenarios against a frame-capturing interface and
//! the loopback device, at the 100 Hz tick.

mod common;

use std::net::Ipv4Addr;

use common::*;
use limpet::io::Error;
use limpet::net::socket::{self, PollEvents, SockAddr, SockOptValue};
use limpet::net::tcp::TcpState;
use limpet::net::wire::{
	checksum, ArpPacket, EtherType, IcmpHeader, IpProto, TcpFlags, UdpHeader, ARP_OP_REPLY,
	ARP_OP_REQUEST, ARP_PKT_LEN,
};
use limpet::net::{self, device};
use limpet::time::TimeVal;

const LOCALHOST: Ipv4Addr = Ipv4Addr::new(127, 0, 0, 1);

#[test]
fn arp_miss_queues_frame_then_reply_releases_it() {
	let _serial = serial();
	let (nic, driver) = setup();

	let sock = socket::create(socket::AF_INET, socket::SOCK_DGRAM, 0).unwrap();
	sock.bind(SockAddr::new(HOST_IP, 1024)).unwrap();
	let payload: Vec<u8> = (0..100u8).collect();
	sock.send_to(&payload, Some(SockAddr::new(PEER_IP, 30000)), true, None)
		.unwrap();

	// The datagram is parked; only the broadcast who-has went out.
	let frames = driver.take();
	assert_eq!(frames.len(), 1);
	let (eth, arp) = parse_arp_frame(&frames[0]).unwrap();
	assert!(eth.dst.is_broadcast());
	assert_eq!(arp.op, ARP_OP_REQUEST);
	assert_eq!(arp.target_ip, PEER_IP);
	assert_eq!(arp.sender_ip, HOST_IP);

	// Reply arrives: the pending frame leaves with the learned MAC,
	// well inside the 100 ms re-request window.
	let mut reply = vec![0u8; ARP_PKT_LEN];
	ArpPacket {
		op: ARP_OP_REPLY,
		sender_mac: PEER_MAC,
		sender_ip: PEER_IP,
		target_mac: host_mac(nic),
		target_ip: HOST_IP,
	}
	.encode(&mut reply);
	inject(nic, &eth_frame(host_mac(nic), PEER_MAC, EtherType::Arp, &reply));

	let frames = driver.take();
	assert_eq!(frames.len(), 1);
	let (ip_part, udp, data) = parse_udp_frame(&frames[0]).unwrap();
	assert_eq!(ip_part.eth.dst, PEER_MAC);
	assert_eq!(ip_part.ip.dst, PEER_IP);
	assert_eq!(udp.src_port, 1024);
	assert_eq!(udp.dst_port, 30000);
	assert_eq!(data, payload);

	// Peer echoes; recvfrom reports the peer as the source.
	let echo = udp_frame(nic, (PEER_IP, 30000), (HOST_IP, 1024), &data);
	inject(nic, &echo);
	let mut buf = [0u8; 256];
	let (n, src) = sock.recv_from(&mut buf, true, None).unwrap();
	assert_eq!(n, 100);
	assert_eq!(&buf[..n], &payload[..]);
	assert_eq!(src, SockAddr::new(PEER_IP, 30000));
}

#[test]
fn arp_retry_gives_up_and_drops_pending_frames() {
	let _serial = serial();
	let (_nic, driver) = setup();

	let sock = socket::create(socket::AF_INET, socket::SOCK_DGRAM, 0).unwrap();
	sock.send_to(b"late", Some(SockAddr::new(PEER_IP, 9)), true, None)
		.unwrap();
	assert_eq!(driver.take().len(), 1); // first who-has

	// Re-requests every 100 ms (10 ticks), bounded.
	run_ticks(10);
	assert_eq!(driver.take().len(), 1);
	run_ticks(10);
	assert_eq!(driver.take().len(), 1);
	run_ticks(10);
	assert_eq!(driver.take().len(), 1);
	run_ticks(10);
	assert_eq!(driver.take().len(), 1);
	// Budget exhausted: entry and pending frame are gone, nothing
	// further is transmitted.
	run_ticks(100);
	assert_eq!(driver.take().len(), 0);
}

#[test]
fn udp_loopback_roundtrip() {
	let _serial = serial();
	limpet::init();

	let a = socket::create(socket::AF_INET, socket::SOCK_DGRAM, 0).unwrap();
	let b = socket::create(socket::AF_INET, socket::SOCK_DGRAM, 0).unwrap();
	a.bind(SockAddr::new(LOCALHOST, 5000)).unwrap();
	b.bind(SockAddr::new(LOCALHOST, 6000)).unwrap();

	a.send_to(b"ping", Some(SockAddr::new(LOCALHOST, 6000)), true, None)
		.unwrap();
	net::poll();

	let mut buf = [0u8; 16];
	let (n, src) = b.recv_from(&mut buf, true, None).unwrap();
	assert_eq!(&buf[..n], b"ping");
	assert_eq!(src, SockAddr::new(LOCALHOST, 5000));

	// recv consumes one whole message; a short buffer truncates it.
	b.send_to(b"0123456789", Some(src), true, None).unwrap();
	net::poll();
	let mut short = [0u8; 4];
	let (n, _) = a.recv_from(&mut short, true, None).unwrap();
	assert_eq!(n, 4);
	assert_eq!(&short, b"0123");
	assert_eq!(a.recv_from(&mut buf, true, None), Err(Error::EAGAIN));
}

#[test]
fn udp_payload_bounds() {
	let _serial = serial();
	limpet::init();

	let sock = socket::create(socket::AF_INET, socket::SOCK_DGRAM, 0).unwrap();
	sock.bind(SockAddr::new(LOCALHOST, 7000)).unwrap();
	let max = vec![0xa5u8; 65507];
	assert_eq!(
		sock.send_to(&max, Some(SockAddr::new(LOCALHOST, 7000)), true, None),
		Ok(65507)
	);
	let over = vec![0u8; 65508];
	assert_eq!(
		sock.send_to(&over, Some(SockAddr::new(LOCALHOST, 7000)), true, None),
		Err(Error::EMSGSIZE)
	);
	net::poll();
	let mut buf = vec![0u8; 65536];
	let (n, _) = sock.recv_from(&mut buf, true, None).unwrap();
	assert_eq!(n, 65507);
}

#[test]
fn udp_bind_rules() {
	let _serial = serial();
	limpet::init();

	let a = socket::create(socket::AF_INET, socket::SOCK_DGRAM, 0).unwrap();
	a.bind(SockAddr::new(LOCALHOST, 4000)).unwrap();

	// Exact duplicate and wildcard overlap are both in use.
	let b = socket::create(socket::AF_INET, socket::SOCK_DGRAM, 0).unwrap();
	assert_eq!(
		b.bind(SockAddr::new(LOCALHOST, 4000)),
		Err(Error::EADDRINUSE)
	);
	assert_eq!(
		b.bind(SockAddr::new(Ipv4Addr::UNSPECIFIED, 4000)),
		Err(Error::EADDRINUSE)
	);

	// Port zero assigns an ephemeral port at or above 49152.
	b.bind(SockAddr::new(LOCALHOST, 0)).unwrap();
	assert!(b.local_name().port >= 49152);

	// sendto with an explicit destination on a connected socket.
	let c = socket::create(socket::AF_INET, socket::SOCK_DGRAM, 0).unwrap();
	c.connect(SockAddr::new(LOCALHOST, 4000), true, None).unwrap();
	assert_eq!(
		c.send_to(b"x", Some(SockAddr::new(LOCALHOST, 4000)), true, None),
		Err(Error::EISCONN)
	);
	// Unconnected send without a destination has nowhere to go.
	let d = socket::create(socket::AF_INET, socket::SOCK_DGRAM, 0).unwrap();
	assert_eq!(d.send_to(b"x", None, true, None), Err(Error::EDESTADDRREQ));
}

#[test]
fn udp_unserved_port_triggers_icmp_unreachable() {
	let _serial = serial();
	let (nic, driver) = setup();
	seed_arp(nic);
	driver.take();

	inject(nic, &udp_frame(nic, (PEER_IP, 1234), (HOST_IP, 9), b"nobody"));
	let frames = driver.take();
	assert_eq!(frames.len(), 1);
	let (ip_part, icmp, quoted) = parse_icmp_frame(&frames[0]).unwrap();
	assert_eq!(ip_part.ip.dst, PEER_IP);
	assert_eq!(icmp.icmp_type, 3);
	assert_eq!(icmp.code, 3);
	// The quote carries the offending IP header + 8 bytes.
	assert_eq!(quoted[0] >> 4, 4);
	assert_eq!(quoted.len(), 20 + 8);
}

#[test]
fn icmp_echo_request_is_answered() {
	let _serial = serial();
	let (nic, driver) = setup();
	seed_arp(nic);
	driver.take();

	let body = b"abcdefgh12345678";
	let mut echo = vec![0u8; 8 + body.len()];
	IcmpHeader {
		icmp_type: 8,
		code: 0,
		rest: 0x0042_0007,
	}
	.encode(&mut echo);
	echo[8..].copy_from_slice(body);
	let csum = checksum(&echo);
	echo[2..4].copy_from_slice(&csum.to_be_bytes());
	inject(
		nic,
		&eth_frame(
			host_mac(nic),
			PEER_MAC,
			EtherType::Ipv4,
			&ip_packet(PEER_IP, HOST_IP, IpProto::Icmp, &echo),
		),
	);

	let frames = driver.take();
	assert_eq!(frames.len(), 1);
	let (ip_part, icmp, payload) = parse_icmp_frame(&frames[0]).unwrap();
	assert_eq!(ip_part.ip.dst, PEER_IP);
	assert_eq!(icmp.icmp_type, 0);
	assert_eq!(icmp.rest, 0x0042_0007);
	assert_eq!(payload, body);
}

#[test]
fn icmp_unreachable_surfaces_on_connected_udp_socket() {
	let _serial = serial();
	let (nic, driver) = setup();
	seed_arp(nic);

	let sock = socket::create(socket::AF_INET, socket::SOCK_DGRAM, 0).unwrap();
	sock.bind(SockAddr::new(HOST_IP, 2000)).unwrap();
	sock.connect(SockAddr::new(PEER_IP, 7), true, None).unwrap();
	sock.send(b"probe", true, None).unwrap();
	driver.take();

	// Peer says: nobody listens on port 7.
	let mut inner_udp = [0u8; 8];
	UdpHeader {
		src_port: 2000,
		dst_port: 7,
		len: 8,
		checksum: 0,
	}
	.encode(&mut inner_udp);
	let inner = ip_packet(HOST_IP, PEER_IP, IpProto::Udp, &inner_udp);
	let mut icmp = vec![0u8; 8 + inner.len()];
	IcmpHeader {
		icmp_type: 3,
		code: 3,
		rest: 0,
	}
	.encode(&mut icmp);
	icmp[8..].copy_from_slice(&inner);
	let csum = checksum(&icmp);
	icmp[2..4].copy_from_slice(&csum.to_be_bytes());
	inject(
		nic,
		&eth_frame(
			host_mac(nic),
			PEER_MAC,
			EtherType::Ipv4,
			&ip_packet(PEER_IP, HOST_IP, IpProto::Icmp, &icmp),
		),
	);

	let mut buf = [0u8; 8];
	assert_eq!(
		sock.recv(&mut buf, true, None),
		Err(Error::ECONNREFUSED)
	);
}

/// Drive an active open up to ESTABLISHED against the harness peer.
/// Returns (socket, local port, iss, peer iss).
fn establish(
	nic: device::NicId,
	driver: &TestNic,
) -> (std::sync::Arc<socket::Socket>, u16, u32, u32) {
	seed_arp(nic);
	driver.take();

	let sock = socket::create(socket::AF_INET, socket::SOCK_STREAM, 0).unwrap();
	assert_eq!(
		sock.connect(SockAddr::new(PEER_IP, 80), true, None),
		Err(Error::EINPROGRESS)
	);
	assert_eq!(sock.tcp_state(), Some(TcpState::SynSent));

	let frames = driver.take();
	assert_eq!(frames.len(), 1);
	let syn = parse_tcp_frame(&frames[0]).unwrap();
	assert!(syn.tcp.flags.contains(TcpFlags::SYN));
	assert!(!syn.tcp.flags.contains(TcpFlags::ACK));
	assert_eq!(syn.tcp.mss, Some(1460));
	let local_port = syn.tcp.src_port;
	let iss = syn.tcp.seq;

	let peer_iss = 5000u32;
	inject(
		nic,
		&tcp_frame(
			nic,
			(PEER_IP, 80),
			(HOST_IP, local_port),
			peer_iss,
			iss.wrapping_add(1),
			TcpFlags::SYN | TcpFlags::ACK,
			65535,
			Some(1460),
			&[],
		),
	);
	assert_eq!(sock.tcp_state(), Some(TcpState::Established));

	// The handshake completes with our ACK.
	let frames = driver.take();
	assert_eq!(frames.len(), 1);
	let ack = parse_tcp_frame(&frames[0]).unwrap();
	assert_eq!(ack.tcp.flags, TcpFlags::ACK);
	assert_eq!(ack.tcp.ack, peer_iss.wrapping_add(1));

	(sock, local_port, iss, peer_iss)
}

#[test]
fn tcp_three_way_handshake_uses_peer_mss() {
	let _serial = serial();
	let (nic, driver) = setup();
	let (sock, _port, iss, _peer_iss) = establish(nic, &driver);

	// First data segment is clamped to SMSS = 1460 by the initial
	// congestion window.
	let data = vec![0x55u8; 2000];
	assert_eq!(sock.send(&data, true, None), Ok(2000));
	let frames = driver.take();
	assert_eq!(frames.len(), 1);
	let seg = parse_tcp_frame(&frames[0]).unwrap();
	assert_eq!(seg.payload.len(), 1460);
	assert_eq!(seg.tcp.seq, iss.wrapping_add(1));
}

#[test]
fn tcp_retransmission_backs_off_and_aborts() {
	let _serial = serial();
	let (nic, driver) = setup();
	let (sock, local_port, iss, peer_iss) = establish(nic, &driver);

	assert_eq!(sock.send(b"unacked-data", true, None), Ok(12));
	let frames = driver.take();
	assert_eq!(frames.len(), 1);
	let first = parse_tcp_frame(&frames[0]).unwrap();
	assert_eq!(first.tcp.seq, iss.wrapping_add(1));

	// 1 s: first retransmission.
	run_ticks(99);
	assert_eq!(driver.tx_count(), 0);
	run_ticks(1);
	let frames = driver.take();
	assert_eq!(frames.len(), 1);
	let rtx = parse_tcp_frame(&frames[0]).unwrap();
	assert_eq!(rtx.tcp.seq, iss.wrapping_add(1));
	assert_eq!(rtx.payload, b"unacked-data");

	// Exponential backoff: next after 2 s, then 4 s.
	run_ticks(199);
	assert_eq!(driver.tx_count(), 0);
	run_ticks(1);
	assert_eq!(driver.take().len(), 1);
	run_ticks(399);
	assert_eq!(driver.tx_count(), 0);
	run_ticks(1);
	assert_eq!(driver.take().len(), 1);

	// Retries 4 and 5, then the connection aborts.
	run_ticks(800);
	run_ticks(1600);
	assert_eq!(driver.take().len(), 2);
	run_ticks(3200);
	assert_eq!(driver.take().len(), 0);
	assert_eq!(sock.tcp_state(), Some(TcpState::Closed));
	assert_eq!(sock.last_error(), Some(Error::ETIMEDOUT));
	assert_eq!(sock.send(b"more", true, None), Err(Error::ETIMEDOUT));

	// The socket no longer answers; a fresh segment earns a RST.
	driver.take();
	inject(
		nic,
		&tcp_frame(
			nic,
			(PEER_IP, 80),
			(HOST_IP, local_port),
			peer_iss.wrapping_add(1),
			iss.wrapping_add(13),
			TcpFlags::ACK,
			65535,
			None,
			&[],
		),
	);
	let frames = driver.take();
	assert_eq!(frames.len(), 1);
	assert!(parse_tcp_frame(&frames[0])
		.unwrap()
		.tcp
		.flags
		.contains(TcpFlags::RST));
}

#[test]
fn tcp_fast_retransmit_on_three_duplicate_acks() {
	let _serial = serial();
	let (nic, driver) = setup();
	let (sock, local_port, iss, peer_iss) = establish(nic, &driver);

	assert_eq!(sock.send(&vec![0x33u8; 1460], true, None), Ok(1460));
	assert_eq!(driver.take().len(), 1);

	let dup = || {
		tcp_frame(
			nic,
			(PEER_IP, 80),
			(HOST_IP, local_port),
			peer_iss.wrapping_add(1),
			iss.wrapping_add(1), // still expecting the lost segment
			TcpFlags::ACK,
			65535,
			None,
			&[],
		)
	};
	inject(nic, &dup());
	inject(nic, &dup());
	assert_eq!(driver.take().len(), 0);
	// Third duplicate: immediate retransmission, no timer involved.
	inject(nic, &dup());
	let frames = driver.take();
	assert_eq!(frames.len(), 1);
	let rtx = parse_tcp_frame(&frames[0]).unwrap();
	assert_eq!(rtx.tcp.seq, iss.wrapping_add(1));
	assert_eq!(rtx.payload.len(), 1460);
}

#[test]
fn tcp_out_of_order_data_is_acked_immediately_and_dropped() {
	let _serial = serial();
	let (nic, driver) = setup();
	let (sock, local_port, iss, peer_iss) = establish(nic, &driver);

	// A segment beyond RCV.NXT: duplicate ACK now, payload dropped.
	inject(
		nic,
		&tcp_frame(
			nic,
			(PEER_IP, 80),
			(HOST_IP, local_port),
			peer_iss.wrapping_add(101),
			iss.wrapping_add(1),
			TcpFlags::ACK,
			65535,
			None,
			b"out-of-order",
		),
	);
	let frames = driver.take();
	assert_eq!(frames.len(), 1);
	let ack = parse_tcp_frame(&frames[0]).unwrap();
	assert_eq!(ack.tcp.ack, peer_iss.wrapping_add(1));
	let mut buf = [0u8; 64];
	assert_eq!(sock.recv(&mut buf, true, None), Err(Error::EAGAIN));

	// The in-order segment is delivered and acknowledged (delayed).
	inject(
		nic,
		&tcp_frame(
			nic,
			(PEER_IP, 80),
			(HOST_IP, local_port),
			peer_iss.wrapping_add(1),
			iss.wrapping_add(1),
			TcpFlags::ACK,
			65535,
			None,
			b"in-order",
		),
	);
	let n = sock.recv(&mut buf, true, None).unwrap();
	assert_eq!(&buf[..n], b"in-order");
	run_ticks(2);
	let frames = driver.take();
	assert!(!frames.is_empty());
	let ack = parse_tcp_frame(frames.last().unwrap()).unwrap();
	assert_eq!(ack.tcp.ack, peer_iss.wrapping_add(9));
}

#[test]
fn tcp_peer_reset_surfaces_econnreset_then_epipe() {
	let _serial = serial();
	let (nic, driver) = setup();
	let (sock, local_port, iss, peer_iss) = establish(nic, &driver);
	driver.take();

	inject(
		nic,
		&tcp_frame(
			nic,
			(PEER_IP, 80),
			(HOST_IP, local_port),
			peer_iss.wrapping_add(1),
			iss.wrapping_add(1),
			TcpFlags::RST,
			0,
			None,
			&[],
		),
	);
	assert_eq!(sock.tcp_state(), Some(TcpState::Closed));
	let mut buf = [0u8; 8];
	assert_eq!(sock.recv(&mut buf, true, None), Err(Error::ECONNRESET));
	assert_eq!(sock.send(b"x", true, None), Err(Error::ECONNRESET));
	assert_eq!(sock.send(b"x", true, None), Err(Error::EPIPE));
}

#[test]
fn tcp_listen_backlog_overflow_drops_syn_silently() {
	let _serial = serial();
	let (nic, driver) = setup();
	seed_arp(nic);
	driver.take();

	let listener = socket::create(socket::AF_INET, socket::SOCK_STREAM, 0).unwrap();
	listener.bind(SockAddr::new(HOST_IP, 80)).unwrap();
	listener.listen(1).unwrap();

	inject(
		nic,
		&tcp_frame(nic, (PEER_IP, 40000), (HOST_IP, 80), 9000, 0, TcpFlags::SYN, 8192, Some(1460), &[]),
	);
	// Queue is full now; the second SYN gets no answer at all.
	inject(
		nic,
		&tcp_frame(nic, (PEER_IP, 40001), (HOST_IP, 80), 9100, 0, TcpFlags::SYN, 8192, Some(1460), &[]),
	);

	let frames = driver.take();
	let syn_acks: Vec<_> = frames
		.iter()
		.filter_map(|f| parse_tcp_frame(f))
		.filter(|seg| seg.tcp.flags.contains(TcpFlags::SYN | TcpFlags::ACK))
		.collect();
	assert_eq!(syn_acks.len(), 1);
	assert_eq!(syn_acks[0].tcp.dst_port, 40000);
}

#[test]
fn tcp_loopback_transfer_is_ordered_and_terminates_cleanly() {
	let _serial = serial();
	limpet::init();

	let listener = socket::create(socket::AF_INET, socket::SOCK_STREAM, 0).unwrap();
	listener.bind(SockAddr::new(LOCALHOST, 8080)).unwrap();
	listener.listen(0).unwrap();

	let client = socket::create(socket::AF_INET, socket::SOCK_STREAM, 0).unwrap();
	assert_eq!(
		client.connect(SockAddr::new(LOCALHOST, 8080), true, None),
		Err(Error::EINPROGRESS)
	);
	net::poll();
	assert_eq!(client.tcp_state(), Some(TcpState::Established));

	let server = listener.accept(true, None).unwrap();
	assert_eq!(server.tcp_state(), Some(TcpState::Established));
	assert_eq!(server.peer_name().unwrap().addr, LOCALHOST);

	// Bytes arrive in order, without duplicates or gaps.
	let data: Vec<u8> = (0..50_000u32).map(|i| (i * 7 % 251) as u8).collect();
	let mut sent = 0;
	let mut received = Vec::new();
	let mut buf = [0u8; 4096];
	for _ in 0..20_000 {
		if sent < data.len() {
			match client.send(&data[sent..], true, None) {
				Ok(n) => sent += n,
				Err(Error::EAGAIN) => {}
				Err(err) => panic!("send failed: {err}"),
			}
		}
		limpet::tick();
		net::poll();
		loop {
			match server.recv(&mut buf, true, None) {
				Ok(0) => break,
				Ok(n) => received.extend_from_slice(&buf[..n]),
				Err(Error::EAGAIN) => break,
				Err(err) => panic!("recv failed: {err}"),
			}
		}
		if received.len() == data.len() {
			break;
		}
	}
	assert_eq!(received.len(), data.len());
	assert_eq!(received, data);

	// Orderly shutdown: both sides observe EOF.
	client.close();
	run_ticks(3);
	net::poll();
	assert_eq!(server.recv(&mut buf, true, None), Ok(0));
	server.close();
	run_ticks(3);
	net::poll();
	assert_eq!(client.recv(&mut buf, true, None), Ok(0));
	assert_eq!(client.tcp_state(), Some(TcpState::TimeWait));

	// 2·MSL: 60 s of ticks release the socket.
	run_ticks(6001);
	assert_eq!(client.tcp_state(), Some(TcpState::Closed));
}

#[test]
fn select_wakes_on_readiness_and_times_out_empty() {
	let _serial = serial();
	limpet::init();

	let a = socket::create(socket::AF_INET, socket::SOCK_DGRAM, 0).unwrap();
	let b = socket::create(socket::AF_INET, socket::SOCK_DGRAM, 0).unwrap();
	a.bind(SockAddr::new(LOCALHOST, 9000)).unwrap();
	b.bind(SockAddr::new(LOCALHOST, 9001)).unwrap();

	// Nothing readable yet; zero timeout polls.
	let ready = socket::select(&[(a.clone(), PollEvents::IN)], Some(0), None).unwrap();
	assert!(ready[0].is_empty());

	// Writability is always on for UDP.
	let ready = socket::select(&[(a.clone(), PollEvents::OUT)], Some(0), None).unwrap();
	assert_eq!(ready[0], PollEvents::OUT);

	b.send_to(b"hi", Some(SockAddr::new(LOCALHOST, 9000)), true, None)
		.unwrap();
	net::poll();
	let ready = socket::select(
		&[(a.clone(), PollEvents::IN), (b.clone(), PollEvents::IN)],
		Some(0),
		None,
	)
	.unwrap();
	assert_eq!(ready[0], PollEvents::IN);
	assert!(ready[1].is_empty());

	// Timeout conversion handles month-long timeouts without overflow.
	let tv = TimeVal::new(31 * 24 * 3600, 0);
	assert_eq!(tv.to_ticks(), Some(267_840_000));
}

#[test]
fn setsockopt_timeouts_and_reuseaddr() {
	let _serial = serial();
	limpet::init();

	let sock = socket::create(socket::AF_INET, socket::SOCK_DGRAM, 0).unwrap();
	sock.setsockopt(
		socket::SOL_SOCKET,
		socket::SO_RCVTIMEO,
		SockOptValue::Time(TimeVal::new(0, 50_000)),
	)
	.unwrap();
	sock.setsockopt(
		socket::SOL_SOCKET,
		socket::SO_REUSEADDR,
		SockOptValue::Flag(true),
	)
	.unwrap();
	assert_eq!(
		sock.setsockopt(socket::SOL_SOCKET, 999, SockOptValue::Flag(true)),
		Err(Error::EINVAL)
	);

	// A receive timeout turns a blocking recv into a bounded wait;
	// the clock advances on another thread until the wait ends.
	sock.bind(SockAddr::new(LOCALHOST, 9100)).unwrap();
	let done = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
	let ticking = done.clone();
	let ticker = std::thread::spawn(move || {
		while !ticking.load(std::sync::atomic::Ordering::Acquire) {
			limpet::tick();
			std::thread::yield_now();
		}
	});
	let mut buf = [0u8; 4];
	let err = sock.recv(&mut buf, false, None);
	done.store(true, std::sync::atomic::Ordering::Release);
	ticker.join().unwrap();
	assert_eq!(err, Err(Error::EAGAIN));
}

#[test]
fn raw_socket_sees_icmp_traffic() {
	let _serial = serial();
	let (nic, driver) = setup();
	seed_arp(nic);
	driver.take();

	let raw = socket::create(socket::AF_INET, socket::SOCK_RAW, IpProto::Icmp as i32).unwrap();

	let mut echo = vec![0u8; 12];
	IcmpHeader {
		icmp_type: 0,
		code: 0,
		rest: 7,
	}
	.encode(&mut echo);
	echo[8..].copy_from_slice(b"pong");
	let csum = checksum(&echo);
	echo[2..4].copy_from_slice(&csum.to_be_bytes());
	inject(
		nic,
		&eth_frame(
			host_mac(nic),
			PEER_MAC,
			EtherType::Ipv4,
			&ip_packet(PEER_IP, HOST_IP, IpProto::Icmp, &echo),
		),
	);

	// Raw sockets get the datagram from the IP header on.
	let mut buf = [0u8; 128];
	let (n, src) = raw.recv_from(&mut buf, true, None).unwrap();
	assert_eq!(src.addr, PEER_IP);
	assert_eq!(buf[0] >> 4, 4);
	assert_eq!(&buf[n - 4..n], b"pong");
}

#[test]
fn nic_registry_and_route_admin() {
	let _serial = serial();
	let (nic, _driver) = setup();

	let dev = device::get(nic).unwrap();
	assert_eq!(dev.addr(), HOST_IP);
	assert_eq!(dev.mtu, 1500);
	assert!(device::by_addr(HOST_IP).is_some());

	// The connected route was installed at registration.
	let route = limpet::net::ip::route_lookup(PEER_IP).unwrap();
	assert_eq!(route.nic, nic);
	assert!(route.gateway.is_none());

	// A default route catches everything else, longest prefix first.
	limpet::net::ip::route_add(
		Ipv4Addr::UNSPECIFIED,
		Ipv4Addr::UNSPECIFIED,
		Some(Ipv4Addr::new(10, 0, 2, 1)),
		nic,
	);
	let far = limpet::net::ip::route_lookup(Ipv4Addr::new(192, 0, 2, 99)).unwrap();
	assert_eq!(far.gateway, Some(Ipv4Addr::new(10, 0, 2, 1)));
	assert_eq!(
		limpet::net::ip::get_src_addr(Ipv4Addr::new(192, 0, 2, 99)).unwrap(),
		HOST_IP
	);
}
