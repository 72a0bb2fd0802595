//! ARP cache with pending-frame queue and timed re-requests.
//!
//! An address is in one of three states: absent (FREE), `Incomplete`
//! (request on the wire, frames parked) or `Valid`. Frames queued
//! behind an unresolved address are released exactly once — either
//! retransmitted when the reply arrives or dropped when the retry
//! budget is exhausted.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::net::Ipv4Addr;

use hashbrown::HashMap;
use hermit_sync::{Lazy, SpinMutex};
use smallvec::SmallVec;

use crate::io::{Error, Result};
use crate::net::device::{Nic, NicId};
use crate::net::netmsg::NetMsg;
use crate::net::wire::{ArpPacket, EtherType, MacAddr, ARP_OP_REPLY, ARP_OP_REQUEST, ARP_PKT_LEN};
use crate::net::{device, ethernet};
use crate::time;

/// Cache capacity.
pub const ARP_CACHE_SIZE: usize = 1024;
/// Upper bound on frames parked behind unresolved addresses.
pub const ARP_PENDING_MAX: usize = 1024;
/// Delay between re-requests: 100 ms.
pub const ARP_RETRY_TICKS: u64 = 100 / time::MS_PER_TICK;
/// Requests sent before an incomplete entry is discarded.
pub const ARP_MAX_RETRIES: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryStatus {
	Incomplete,
	Valid,
}

#[derive(Debug, Clone, Copy)]
struct ArpEntry {
	mac: MacAddr,
	status: EntryStatus,
	nic: NicId,
	last_request: u64,
	retries: u32,
}

struct Pending {
	nic: NicId,
	ip: Ipv4Addr,
	msg: NetMsg,
}

struct ArpState {
	cache: HashMap<Ipv4Addr, ArpEntry>,
	pending: VecDeque<Pending>,
}

static STATE: Lazy<SpinMutex<ArpState>> = Lazy::new(|| {
	SpinMutex::new(ArpState {
		cache: HashMap::new(),
		pending: VecDeque::new(),
	})
});

/// Outcome of a resolution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolve {
	/// Address known; frame can go out now.
	Hit(MacAddr),
	/// Request already outstanding; park the frame.
	Incomplete,
	/// This call created the entry and broadcast a request; park the
	/// frame.
	Trigger,
	/// No entry and none can be created.
	None,
}

/// Resolve `ip` on `nic`, sending a broadcast request on a cache miss.
/// Never blocks: a miss parks the caller's frame instead.
pub fn resolve(nic: &Arc<Nic>, ip: Ipv4Addr) -> Resolve {
	if ip.is_broadcast() {
		return Resolve::Hit(MacAddr::BROADCAST);
	}

	{
		let mut state = STATE.lock();
		match state.cache.get(&ip) {
			Some(entry) if entry.status == EntryStatus::Valid => {
				return Resolve::Hit(entry.mac);
			}
			Some(_) => return Resolve::Incomplete,
			None => {}
		}
		if state.cache.len() >= ARP_CACHE_SIZE && !evict_one(&mut state.cache) {
			return Resolve::None;
		}
		state.cache.insert(
			ip,
			ArpEntry {
				mac: MacAddr::NULL,
				status: EntryStatus::Incomplete,
				nic: nic.id,
				last_request: time::now(),
				retries: 0,
			},
		);
	}

	send_request(nic, ip);
	Resolve::Trigger
}

/// Look up without side effects.
pub fn lookup(ip: Ipv4Addr) -> Option<MacAddr> {
	let state = STATE.lock();
	state
		.cache
		.get(&ip)
		.filter(|e| e.status == EntryStatus::Valid)
		.map(|e| e.mac)
}

/// Park a frame until `ip` resolves. Bounded; a full queue surfaces as
/// a recoverable buffer shortage to the caller.
pub fn enqueue_pending(nic: NicId, ip: Ipv4Addr, msg: NetMsg) -> Result<()> {
	let mut state = STATE.lock();
	if state.pending.len() >= ARP_PENDING_MAX {
		debug!("arp pending queue full, dropping frame for {}", ip);
		return Err(Error::ENOBUFS);
	}
	state.pending.push_back(Pending { nic, ip, msg });
	Ok(())
}

/// Drop the oldest valid entry to make room. Incomplete entries stay —
/// they own parked frames.
fn evict_one(cache: &mut HashMap<Ipv4Addr, ArpEntry>) -> bool {
	let victim = cache
		.iter()
		.filter(|(_, e)| e.status == EntryStatus::Valid)
		.min_by_key(|(_, e)| e.last_request)
		.map(|(ip, _)| *ip);
	match victim {
		Some(ip) => {
			cache.remove(&ip);
			true
		}
		None => false,
	}
}

fn send_request(nic: &Arc<Nic>, target_ip: Ipv4Addr) {
	let mut msg = NetMsg::new(ARP_PKT_LEN);
	let packet = ArpPacket {
		op: ARP_OP_REQUEST,
		sender_mac: nic.mac,
		sender_ip: nic.addr(),
		target_mac: MacAddr::NULL,
		target_ip,
	};
	match msg.append(ARP_PKT_LEN) {
		Ok(buf) => packet.encode(buf),
		Err(_) => return,
	}
	msg.arp_hdr = Some(msg.start_offset());
	trace!("arp who-has {} tell {}", target_ip, nic.addr());
	if let Err(err) = ethernet::transmit(nic, msg, MacAddr::BROADCAST, EtherType::Arp) {
		debug!("arp request tx failed: {}", err);
	}
}

/// Handle a received ARP packet: learn the sender, drain any frames
/// parked behind it, answer requests that target one of our addresses.
pub fn ingress(nic: &Arc<Nic>, mut msg: NetMsg) {
	msg.arp_hdr = Some(msg.start_offset());
	let Some(packet) = ArpPacket::parse(msg.as_slice()) else {
		debug!("malformed arp packet, dropping");
		return;
	};

	let ready = learn(nic.id, packet.sender_ip, packet.sender_mac);
	for pending in ready {
		retransmit(pending, packet.sender_mac);
	}

	if packet.op == ARP_OP_REQUEST && packet.target_ip == nic.addr() {
		let reply = ArpPacket {
			op: ARP_OP_REPLY,
			sender_mac: nic.mac,
			sender_ip: nic.addr(),
			target_mac: packet.sender_mac,
			target_ip: packet.sender_ip,
		};
		let mut out = NetMsg::new(ARP_PKT_LEN);
		match out.append(ARP_PKT_LEN) {
			Ok(buf) => reply.encode(buf),
			Err(_) => return,
		}
		if let Err(err) = ethernet::transmit(nic, out, packet.sender_mac, EtherType::Arp) {
			debug!("arp reply tx failed: {}", err);
		}
	}
}

/// Insert or refresh a cache entry and detach the frames now ready to
/// go. The frames are returned so transmission happens off the lock.
fn learn(nic: NicId, ip: Ipv4Addr, mac: MacAddr) -> SmallVec<[Pending; 4]> {
	let mut state = STATE.lock();
	if !state.cache.contains_key(&ip)
		&& state.cache.len() >= ARP_CACHE_SIZE
		&& !evict_one(&mut state.cache)
	{
		return SmallVec::new();
	}
	state.cache.insert(
		ip,
		ArpEntry {
			mac,
			status: EntryStatus::Valid,
			nic,
			last_request: time::now(),
			retries: 0,
		},
	);

	let mut ready: SmallVec<[Pending; 4]> = SmallVec::new();
	let mut keep = VecDeque::new();
	while let Some(pending) = state.pending.pop_front() {
		if pending.ip == ip {
			ready.push(pending);
		} else {
			keep.push_back(pending);
		}
	}
	state.pending = keep;
	ready
}

fn retransmit(pending: Pending, mac: MacAddr) {
	let Ok(nic) = device::get(pending.nic) else {
		return;
	};
	if let Err(err) = ethernet::transmit(&nic, pending.msg, mac, EtherType::Ipv4) {
		debug!("deferred frame tx failed: {}", err);
	}
}

/// Timer path: re-request unresolved addresses every 100 ms, discard
/// entries (and their parked frames) once the retry budget is gone.
pub fn tick() {
	let now = time::now();
	let mut requests: SmallVec<[(NicId, Ipv4Addr); 4]> = SmallVec::new();
	let mut expired: SmallVec<[Ipv4Addr; 4]> = SmallVec::new();

	{
		let mut state = STATE.lock();
		for (ip, entry) in state.cache.iter_mut() {
			if entry.status != EntryStatus::Incomplete
				|| now.saturating_sub(entry.last_request) < ARP_RETRY_TICKS
			{
				continue;
			}
			if entry.retries + 1 >= ARP_MAX_RETRIES {
				expired.push(*ip);
			} else {
				entry.retries += 1;
				entry.last_request = now;
				requests.push((entry.nic, *ip));
			}
		}
		for ip in &expired {
			state.cache.remove(ip);
			let before = state.pending.len();
			state.pending.retain(|p| p.ip != *ip);
			let dropped = before - state.pending.len();
			if dropped > 0 {
				debug!("host {} unreachable, dropped {} pending frames", ip, dropped);
			}
		}
	}

	for (nic_id, ip) in requests {
		if let Ok(nic) = device::get(nic_id) {
			send_request(&nic, ip);
		}
	}
}

pub(crate) fn reset() {
	let mut state = STATE.lock();
	state.cache.clear();
	state.pending.clear();
}
