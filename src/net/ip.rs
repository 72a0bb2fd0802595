//! IPv4: route table, source address selection, ingress demux, egress.
//!
//! No forwarding and no reassembly — fragmented or non-local datagrams
//! are dropped. Lock order on egress is routing → interface → ARP, and
//! a transport protocol never calls back up into a socket while the
//! route lock is held.

use alloc::sync::Arc;
use core::net::Ipv4Addr;
use core::sync::atomic::{AtomicU16, Ordering};

use hermit_sync::SpinMutex;
use smallvec::SmallVec;

use crate::io::{Error, Result};
use crate::net::device::{self, Nic, NicId};
use crate::net::netmsg::NetMsg;
use crate::net::wire::{IpProto, Ipv4Header, IP_DEFAULT_TTL, IP_FLAG_DF, IPV4_HDR_LEN};
use crate::net::{ethernet, icmp, socket, tcp, udp};

bitflags::bitflags! {
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	pub struct RouteFlags: u32 {
		const UP = 0x1;
		const GATEWAY = 0x2;
		const HOST = 0x4;
	}
}

#[derive(Debug, Clone, Copy)]
pub struct Route {
	pub dest: Ipv4Addr,
	pub genmask: Ipv4Addr,
	pub gateway: Option<Ipv4Addr>,
	pub nic: NicId,
	pub flags: RouteFlags,
}

static ROUTES: SpinMutex<SmallVec<[Route; 8]>> = SpinMutex::new(SmallVec::new_const());
static IP_ID: AtomicU16 = AtomicU16::new(1);

pub fn route_add(dest: Ipv4Addr, genmask: Ipv4Addr, gateway: Option<Ipv4Addr>, nic: NicId) {
	let mut flags = RouteFlags::UP;
	if gateway.is_some() {
		flags |= RouteFlags::GATEWAY;
	}
	if genmask == Ipv4Addr::BROADCAST {
		flags |= RouteFlags::HOST;
	}
	ROUTES.lock().push(Route {
		dest,
		genmask,
		gateway,
		nic,
		flags,
	});
}

pub fn route_del(dest: Ipv4Addr, genmask: Ipv4Addr) {
	ROUTES
		.lock()
		.retain(|r| !(r.dest == dest && r.genmask == genmask));
}

pub fn route_flush() {
	ROUTES.lock().clear();
}

pub fn routes() -> SmallVec<[Route; 8]> {
	ROUTES.lock().clone()
}

fn mask_bits(mask: Ipv4Addr) -> u32 {
	u32::from_be_bytes(mask.octets()).count_ones()
}

/// Longest-prefix match; insertion order breaks ties.
pub fn route_lookup(dst: Ipv4Addr) -> Option<Route> {
	let routes = ROUTES.lock();
	let dst_bits = u32::from_be_bytes(dst.octets());
	let mut best: Option<(u32, Route)> = None;
	for route in routes.iter() {
		let mask = u32::from_be_bytes(route.genmask.octets());
		if dst_bits & mask != u32::from_be_bytes(route.dest.octets()) & mask {
			continue;
		}
		let bits = mask_bits(route.genmask);
		if best.map(|(b, _)| bits > b).unwrap_or(true) {
			best = Some((bits, *route));
		}
	}
	best.map(|(_, r)| r)
}

/// Primary address of the egress interface for `dst`.
pub fn get_src_addr(dst: Ipv4Addr) -> Result<Ipv4Addr> {
	let route = route_lookup(dst).ok_or(Error::ENETUNREACH)?;
	Ok(device::get(route.nic)?.addr())
}

/// Local-delivery test: one of our unicast addresses, a broadcast, or
/// loopback.
fn is_local(nic: &Arc<Nic>, dst: Ipv4Addr) -> bool {
	if dst.is_broadcast() || dst.is_loopback() || dst == nic.addr() {
		return true;
	}
	// Subnet broadcast on the receiving interface.
	let config = nic.ip_config();
	let mask = u32::from_be_bytes(config.netmask.octets());
	let net = u32::from_be_bytes(config.addr.octets()) & mask;
	u32::from_be_bytes(dst.octets()) == net | !mask
}

/// Ingress: validate, demux by protocol. Raw sockets see a copy of
/// every datagram of their protocol before the stack consumes it.
pub fn ingress(nic: &Arc<Nic>, mut msg: NetMsg) {
	msg.ip_hdr = Some(msg.start_offset());
	let Some(header) = Ipv4Header::parse(msg.as_slice()) else {
		debug!("malformed ip header on {}, dropping", nic.name);
		return;
	};
	if header.is_fragmented() {
		debug!("dropping fragment from {} (no reassembly)", header.src);
		return;
	}
	if !is_local(nic, header.dst) {
		trace!("datagram for {} not local, dropping", header.dst);
		return;
	}

	// Strip link padding before the transport sees the payload.
	msg.truncate(usize::from(header.total_len));
	msg.ip_src = header.src;
	msg.ip_dst = header.dst;
	msg.ip_len = header.total_len;
	msg.ip_proto = header.proto;
	if msg.cut_off(header.header_len).is_err() {
		return;
	}

	socket::raw_ingress(&msg);

	match IpProto::try_from(header.proto) {
		Ok(IpProto::Icmp) => icmp::ingress(nic, msg),
		Ok(IpProto::Udp) => udp::ingress(nic, msg),
		Ok(IpProto::Tcp) => tcp::ingress(nic, msg),
		Err(_) => {
			trace!("unhandled ip protocol {}, dropping", header.proto);
		}
	}
}

/// Egress: route, fill in the header and hand the frame to Ethernet.
/// `src` is `None` when the caller wants source selection here.
pub fn send(
	mut msg: NetMsg,
	src: Option<Ipv4Addr>,
	dst: Ipv4Addr,
	proto: IpProto,
	df: bool,
) -> Result<()> {
	let route = route_lookup(dst).ok_or(Error::ENETUNREACH)?;
	let nic = device::get(route.nic)?;
	let src = match src {
		Some(addr) => addr,
		None => nic.addr(),
	};

	let total_len = msg.len() + IPV4_HDR_LEN;
	if total_len > usize::from(nic.mtu) {
		return Err(Error::EMSGSIZE);
	}

	let header = Ipv4Header {
		header_len: IPV4_HDR_LEN,
		total_len: total_len as u16,
		id: IP_ID.fetch_add(1, Ordering::Relaxed),
		flags_frag: if df { IP_FLAG_DF } else { 0 },
		ttl: IP_DEFAULT_TTL,
		proto: proto as u8,
		src,
		dst,
	};
	header.encode(msg.prepend(IPV4_HDR_LEN)?);
	msg.ip_hdr = Some(msg.start_offset());
	msg.ip_src = src;
	msg.ip_dst = dst;
	msg.ip_len = header.total_len;
	msg.ip_proto = proto as u8;
	msg.df = df;

	let next_hop = route.gateway.unwrap_or(dst);
	ethernet::send(&nic, msg, next_hop)
}

pub(crate) fn reset() {
	route_flush();
	IP_ID.store(1, Ordering::Relaxed);
}
