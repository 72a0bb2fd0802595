//! Shared test harness: a frame-capturing NIC driver, peer-side frame
//! builders and a serialization lock for the singleton kernel state.

#![allow(dead_code)]

use std::net::Ipv4Addr;
use std::sync::{Mutex, MutexGuard, OnceLock};
use std::sync::Arc;
use std::vec::Vec;

use limpet::net::device::{self, DriverConfig, NicDriver, NicId};
use limpet::net::netmsg::NetMsg;
use limpet::net::wire::{
	pseudo_header, ArpPacket, Checksum, EthHeader, EtherType, IcmpHeader, IpProto, Ipv4Header,
	MacAddr, TcpFlags, TcpHeader, UdpHeader, ARP_PKT_LEN, ETH_HDR_LEN, ICMP_HDR_LEN,
	IPV4_HDR_LEN, TCP_HDR_LEN, UDP_HDR_LEN,
};
use limpet::io::Result;

pub const HOST_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 2, 20);
pub const PEER_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 2, 21);
pub const NETMASK: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 0);
pub const PEER_MAC: MacAddr = MacAddr([0x52, 0x54, 0x00, 0x12, 0x34, 0x56]);

/// The kernel singletons are process-wide; tests take this lock for
/// their whole body.
pub fn serial() -> MutexGuard<'static, ()> {
	static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
	LOCK.get_or_init(|| Mutex::new(()))
		.lock()
		.unwrap_or_else(|e| e.into_inner())
}

/// NIC driver that records every transmitted frame.
pub struct TestNic {
	frames: Mutex<Vec<Vec<u8>>>,
	mac: MacAddr,
}

impl TestNic {
	pub fn new() -> Arc<Self> {
		Arc::new(Self {
			frames: Mutex::new(Vec::new()),
			mac: MacAddr([0x52, 0x54, 0x00, 0xaa, 0xbb, 0x01]),
		})
	}

	pub fn mac(&self) -> MacAddr {
		self.mac
	}

	/// Drain the captured frames.
	pub fn take(&self) -> Vec<Vec<u8>> {
		core::mem::take(&mut self.frames.lock().unwrap())
	}

	pub fn tx_count(&self) -> usize {
		self.frames.lock().unwrap().len()
	}
}

impl NicDriver for TestNic {
	fn tx_msg(&self, msg: NetMsg) -> Result<()> {
		self.frames.lock().unwrap().push(msg.as_slice().to_vec());
		Ok(())
	}

	fn get_config(&self) -> Result<DriverConfig> {
		Ok(DriverConfig {
			mac: self.mac,
			mtu: 1500,
		})
	}
}

/// Fresh kernel with one harness interface on 10.0.2.20/24.
pub fn setup() -> (NicId, Arc<TestNic>) {
	limpet::init();
	let driver = TestNic::new();
	let nic = limpet::net::register_nic("eth0", driver.clone(), HOST_IP, NETMASK).unwrap();
	(nic, driver)
}

/// Feed a peer frame into the stack and drain deferred work.
pub fn inject(nic: NicId, frame: &[u8]) {
	device::enqueue_rx(nic, NetMsg::from_frame(frame));
	limpet::net::poll();
}

pub fn host_mac(nic: NicId) -> MacAddr {
	device::get(nic).unwrap().mac
}

/// Let the ARP cache learn the peer by injecting a request from it.
pub fn seed_arp(nic: NicId) {
	let mut arp = vec![0u8; ARP_PKT_LEN];
	ArpPacket {
		op: 1,
		sender_mac: PEER_MAC,
		sender_ip: PEER_IP,
		target_mac: MacAddr::NULL,
		target_ip: HOST_IP,
	}
	.encode(&mut arp);
	inject(nic, &eth_frame(host_mac(nic), PEER_MAC, EtherType::Arp, &arp));
}

// ── Frame builders (the "peer" side of the wire) ────────────────────────

pub fn eth_frame(dst: MacAddr, src: MacAddr, ethertype: EtherType, payload: &[u8]) -> Vec<u8> {
	let mut frame = vec![0u8; ETH_HDR_LEN + payload.len()];
	EthHeader {
		dst,
		src,
		ethertype: ethertype as u16,
	}
	.encode(&mut frame);
	frame[ETH_HDR_LEN..].copy_from_slice(payload);
	frame
}

pub fn ip_packet(src: Ipv4Addr, dst: Ipv4Addr, proto: IpProto, payload: &[u8]) -> Vec<u8> {
	let mut packet = vec![0u8; IPV4_HDR_LEN + payload.len()];
	Ipv4Header {
		header_len: IPV4_HDR_LEN,
		total_len: (IPV4_HDR_LEN + payload.len()) as u16,
		id: 0x4242,
		flags_frag: 0,
		ttl: 64,
		proto: proto as u8,
		src,
		dst,
	}
	.encode(&mut packet);
	packet[IPV4_HDR_LEN..].copy_from_slice(payload);
	packet
}

/// Complete peer → host UDP frame with a valid checksum.
pub fn udp_frame(
	nic: NicId,
	src: (Ipv4Addr, u16),
	dst: (Ipv4Addr, u16),
	payload: &[u8],
) -> Vec<u8> {
	let udp_len = (UDP_HDR_LEN + payload.len()) as u16;
	let mut segment = vec![0u8; udp_len as usize];
	let mut header = UdpHeader {
		src_port: src.1,
		dst_port: dst.1,
		len: udp_len,
		checksum: 0,
	};
	header.encode(&mut segment);
	segment[UDP_HDR_LEN..].copy_from_slice(payload);
	let mut csum = Checksum::new();
	csum.add_bytes(&pseudo_header(src.0, dst.0, IpProto::Udp, udp_len));
	csum.add_bytes(&segment);
	header.checksum = match csum.finish() {
		0 => 0xffff,
		c => c,
	};
	header.encode(&mut segment);
	eth_frame(
		host_mac(nic),
		PEER_MAC,
		EtherType::Ipv4,
		&ip_packet(src.0, dst.0, IpProto::Udp, &segment),
	)
}

/// Complete peer → host TCP frame with a valid checksum.
#[allow(clippy::too_many_arguments)]
pub fn tcp_frame(
	nic: NicId,
	src: (Ipv4Addr, u16),
	dst: (Ipv4Addr, u16),
	seq: u32,
	ack: u32,
	flags: TcpFlags,
	window: u16,
	mss: Option<u16>,
	payload: &[u8],
) -> Vec<u8> {
	let header = TcpHeader {
		src_port: src.1,
		dst_port: dst.1,
		seq,
		ack,
		data_off: TCP_HDR_LEN + if mss.is_some() { 4 } else { 0 },
		flags,
		window,
		checksum: 0,
		urgent: 0,
		mss,
	};
	let header_len = header.encoded_len();
	let mut segment = vec![0u8; header_len + payload.len()];
	header.encode(&mut segment);
	segment[header_len..].copy_from_slice(payload);
	let mut csum = Checksum::new();
	csum.add_bytes(&pseudo_header(
		src.0,
		dst.0,
		IpProto::Tcp,
		segment.len() as u16,
	));
	csum.add_bytes(&segment);
	let csum = csum.finish();
	segment[16..18].copy_from_slice(&csum.to_be_bytes());
	eth_frame(
		host_mac(nic),
		PEER_MAC,
		EtherType::Ipv4,
		&ip_packet(src.0, dst.0, IpProto::Tcp, &segment),
	)
}

// ── Captured-frame parsing ──────────────────────────────────────────────

pub struct TxIp {
	pub eth: EthHeader,
	pub ip: Ipv4Header,
	pub payload: Vec<u8>,
}

pub fn parse_ip_frame(frame: &[u8]) -> Option<TxIp> {
	let eth = EthHeader::parse(frame)?;
	if eth.ethertype != EtherType::Ipv4 as u16 {
		return None;
	}
	let ip = Ipv4Header::parse(&frame[ETH_HDR_LEN..])?;
	let start = ETH_HDR_LEN + ip.header_len;
	let end = ETH_HDR_LEN + ip.total_len as usize;
	Some(TxIp {
		eth,
		ip,
		payload: frame[start..end].to_vec(),
	})
}

pub struct TxTcp {
	pub eth: EthHeader,
	pub ip: Ipv4Header,
	pub tcp: TcpHeader,
	pub payload: Vec<u8>,
}

pub fn parse_tcp_frame(frame: &[u8]) -> Option<TxTcp> {
	let ip_part = parse_ip_frame(frame)?;
	if ip_part.ip.proto != IpProto::Tcp as u8 {
		return None;
	}
	let tcp = TcpHeader::parse(&ip_part.payload)?;
	let payload = ip_part.payload[tcp.data_off..].to_vec();
	Some(TxTcp {
		eth: ip_part.eth,
		ip: ip_part.ip,
		tcp,
		payload,
	})
}

pub fn parse_udp_frame(frame: &[u8]) -> Option<(TxIp, UdpHeader, Vec<u8>)> {
	let ip_part = parse_ip_frame(frame)?;
	if ip_part.ip.proto != IpProto::Udp as u8 {
		return None;
	}
	let udp = UdpHeader::parse(&ip_part.payload)?;
	let payload = ip_part.payload[UDP_HDR_LEN..udp.len as usize].to_vec();
	Some((ip_part, udp, payload))
}

pub fn parse_arp_frame(frame: &[u8]) -> Option<(EthHeader, ArpPacket)> {
	let eth = EthHeader::parse(frame)?;
	if eth.ethertype != EtherType::Arp as u16 {
		return None;
	}
	Some((eth, ArpPacket::parse(&frame[ETH_HDR_LEN..])?))
}

pub fn parse_icmp_frame(frame: &[u8]) -> Option<(TxIp, IcmpHeader, Vec<u8>)> {
	let ip_part = parse_ip_frame(frame)?;
	if ip_part.ip.proto != IpProto::Icmp as u8 {
		return None;
	}
	let icmp = IcmpHeader::parse(&ip_part.payload)?;
	let payload = ip_part.payload[ICMP_HDR_LEN..].to_vec();
	Some((ip_part, icmp, payload))
}

/// Advance the kernel clock by `n` ticks.
pub fn run_ticks(n: u64) {
	for _ in 0..n {
		limpet::tick();
	}
}
