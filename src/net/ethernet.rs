//! Ethernet II framing and dispatch.

use alloc::sync::Arc;
use core::net::Ipv4Addr;

use crate::io::{Error, Result};
use crate::net::device::{Nic, NicId};
use crate::net::netmsg::NetMsg;
use crate::net::wire::{EthHeader, EtherType, MacAddr, ETH_HDR_LEN};
use crate::net::{arp, device, ip};

/// Ingress entry point: called for every frame a driver delivers.
///
/// Tags the message with the header offset, filters on the destination
/// MAC and dispatches by ethertype. Anything unknown is dropped.
pub fn ingress(nic_id: NicId, mut msg: NetMsg) {
	let Ok(nic) = device::get(nic_id) else {
		debug!("frame from unregistered nic {:?}", nic_id);
		return;
	};
	if msg.len() < ETH_HDR_LEN {
		debug!("runt frame ({} bytes) on {}", msg.len(), nic.name);
		return;
	}

	msg.eth_hdr = Some(msg.start_offset());
	let Some(header) = EthHeader::parse(msg.as_slice()) else {
		return;
	};
	if !nic.loopback && header.dst != nic.mac && !header.dst.is_broadcast() {
		trace!("frame for {} not ours, dropping", header.dst);
		return;
	}
	if msg.cut_off(ETH_HDR_LEN).is_err() {
		return;
	}
	msg.nic = Some(nic.id);

	match EtherType::try_from(header.ethertype) {
		Ok(EtherType::Ipv4) => ip::ingress(&nic, msg),
		Ok(EtherType::Arp) => arp::ingress(&nic, msg),
		Err(_) => {
			trace!("dropping ethertype {:#06x}", header.ethertype);
		}
	}
}

/// Egress for IP traffic: resolve the next hop and transmit, or park
/// the frame in the ARP pending queue. Returns `Ok` on a queued frame —
/// the resolution outcome decides its fate later.
pub fn send(nic: &Arc<Nic>, msg: NetMsg, next_hop: Ipv4Addr) -> Result<()> {
	if nic.loopback {
		return transmit(nic, msg, nic.mac, EtherType::Ipv4);
	}
	if next_hop.is_broadcast() {
		return transmit(nic, msg, MacAddr::BROADCAST, EtherType::Ipv4);
	}

	match arp::resolve(nic, next_hop) {
		arp::Resolve::Hit(mac) => transmit(nic, msg, mac, EtherType::Ipv4),
		arp::Resolve::Trigger | arp::Resolve::Incomplete => {
			arp::enqueue_pending(nic.id, next_hop, msg)
		}
		arp::Resolve::None => {
			debug!("no resolution path for {}, dropping", next_hop);
			Err(Error::EHOSTUNREACH)
		}
	}
}

/// Prepend the 14-byte header and hand the frame to the driver.
pub(crate) fn transmit(
	nic: &Arc<Nic>,
	mut msg: NetMsg,
	dst: MacAddr,
	ethertype: EtherType,
) -> Result<()> {
	let header = EthHeader {
		dst,
		src: nic.mac,
		ethertype: ethertype as u16,
	};
	header.encode(msg.prepend(ETH_HDR_LEN)?);
	msg.eth_hdr = Some(msg.start_offset());
	nic.transmit(msg)
}
