//! The TCP/IP stack.
//!
//! Ingress: driver → [`ethernet`] → [`arp`]/[`ip`] → [`icmp`]/[`udp`]/
//! [`tcp`] → a socket's receive buffer. Egress retraces the path:
//! socket → protocol → [`ip`] (route + source selection) → [`arp`]
//! (resolution) → [`ethernet`] → driver.
//!
//! Everything here is a process-wide singleton with explicit init and
//! per-structure locks. Lock acquisition order is routing → interface →
//! ARP on the way down and socket → protocol → IP from the top;
//! nothing takes a socket lock while holding a lower-layer lock.

pub mod arp;
pub mod device;
pub mod ethernet;
pub mod icmp;
pub mod ip;
pub mod netmsg;
pub mod socket;
pub mod tcp;
pub mod udp;
pub mod wire;

use alloc::sync::Arc;
use core::net::Ipv4Addr;

use crate::io::Result;
use crate::workqueue;

use device::{IpConfig, LoopbackDriver, NicDriver, NicId};

/// Reset every stack singleton and bring up the loopback interface.
pub fn init() {
	socket::reset();
	arp::reset();
	ip::reset();
	device::reset();
	workqueue::register(&device::NET_RX_QUEUE);

	let driver = LoopbackDriver::new();
	let config = IpConfig {
		addr: Ipv4Addr::new(127, 0, 0, 1),
		netmask: Ipv4Addr::new(255, 0, 0, 0),
	};
	let id = device::register("lo", driver.clone(), config, true)
		.expect("loopback registration cannot fail");
	driver.attach(id);
	ip::route_add(
		Ipv4Addr::new(127, 0, 0, 0),
		Ipv4Addr::new(255, 0, 0, 0),
		None,
		id,
	);
}

/// Register a hardware interface and its directly connected route.
pub fn register_nic(
	name: &str,
	driver: Arc<dyn NicDriver>,
	addr: Ipv4Addr,
	netmask: Ipv4Addr,
) -> Result<NicId> {
	let id = device::register(name, driver, IpConfig { addr, netmask }, false)?;
	let mask = u32::from_be_bytes(netmask.octets());
	let net = u32::from_be_bytes(addr.octets()) & mask;
	ip::route_add(Ipv4Addr::from(net.to_be_bytes()), netmask, None, id);
	Ok(id)
}

/// Drain deferred work (staged RX frames, loopback deliveries) now
/// instead of waiting for the next tick.
pub fn poll() {
	device::NET_RX_QUEUE.trigger();
}

/// Per-tick driver: ARP re-requests, TCP timers, deferred frames.
pub fn tick() {
	arp::tick();
	tcp::tick();
	device::NET_RX_QUEUE.trigger();
}
