//! NIC driver contract and interface registry.
//!
//! A driver implements [`NicDriver`] and hands received frames to
//! [`enqueue_rx`]; the stack owns everything above that line. `tx_msg`
//! is called with the per-NIC TX lock held and must never block — a
//! driver that cannot take the frame returns an error and the upper
//! layer decides whether to retry.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::net::Ipv4Addr;

use alloc::collections::VecDeque;
use hermit_sync::SpinMutex;

use crate::io::{Error, Result};
use crate::net::netmsg::NetMsg;
use crate::net::wire::MacAddr;
use crate::workqueue::WorkQueue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NicId(pub usize);

/// Hardware-side configuration reported by the driver.
#[derive(Debug, Clone, Copy)]
pub struct DriverConfig {
	pub mac: MacAddr,
	pub mtu: u16,
}

/// Stack-side interface addressing.
#[derive(Debug, Clone, Copy)]
pub struct IpConfig {
	pub addr: Ipv4Addr,
	pub netmask: Ipv4Addr,
}

pub trait NicDriver: Send + Sync {
	/// Transmit one fully framed message. Must not block or sleep.
	fn tx_msg(&self, msg: NetMsg) -> Result<()>;

	/// Report MAC address and link MTU.
	fn get_config(&self) -> Result<DriverConfig>;

	/// Optional driver diagnostics hook.
	fn debug(&self) {}
}

pub struct Nic {
	pub id: NicId,
	pub name: String,
	pub mac: MacAddr,
	pub mtu: u16,
	pub loopback: bool,
	driver: Arc<dyn NicDriver>,
	ip: SpinMutex<IpConfig>,
	tx_lock: SpinMutex<()>,
}

impl Nic {
	pub fn addr(&self) -> Ipv4Addr {
		self.ip.lock().addr
	}

	pub fn netmask(&self) -> Ipv4Addr {
		self.ip.lock().netmask
	}

	pub fn ip_config(&self) -> IpConfig {
		*self.ip.lock()
	}

	pub fn set_ip_config(&self, config: IpConfig) {
		*self.ip.lock() = config;
	}

	/// Serialized hand-off to the driver.
	pub fn transmit(&self, msg: NetMsg) -> Result<()> {
		let _guard = self.tx_lock.lock();
		self.driver.tx_msg(msg)
	}
}

static NICS: SpinMutex<Vec<Arc<Nic>>> = SpinMutex::new(Vec::new());

/// Register an interface. The driver is queried once for its hardware
/// configuration; addressing may be changed later via `set_ip_config`.
pub fn register(
	name: &str,
	driver: Arc<dyn NicDriver>,
	config: IpConfig,
	loopback: bool,
) -> Result<NicId> {
	let hw = driver.get_config()?;
	let mut nics = NICS.lock();
	let id = NicId(nics.len());
	info!("registering nic {} ({}) mtu {}", name, hw.mac, hw.mtu);
	nics.push(Arc::new(Nic {
		id,
		name: String::from(name),
		mac: hw.mac,
		mtu: hw.mtu,
		loopback,
		driver,
		ip: SpinMutex::new(config),
		tx_lock: SpinMutex::new(()),
	}));
	Ok(id)
}

pub fn get(id: NicId) -> Result<Arc<Nic>> {
	NICS.lock().get(id.0).cloned().ok_or(Error::ENODEV)
}

pub fn all() -> Vec<Arc<Nic>> {
	NICS.lock().clone()
}

/// Find the interface owning a local address.
pub fn by_addr(addr: Ipv4Addr) -> Option<Arc<Nic>> {
	NICS.lock().iter().find(|nic| nic.addr() == addr).cloned()
}

pub(crate) fn reset() {
	NICS.lock().clear();
	RX_STAGE.lock().clear();
}

// ── Deferred receive path ───────────────────────────────────────────────

/// Frames staged by drivers (ISR context) until the work queue runs.
static RX_STAGE: SpinMutex<VecDeque<NetMsg>> = SpinMutex::new(VecDeque::new());

/// Work queue driving staged RX and deferred loopback TX.
pub static NET_RX_QUEUE: WorkQueue = WorkQueue::new("net-rx");

fn drain_rx(_arg: usize) {
	loop {
		let Some(msg) = RX_STAGE.lock().pop_front() else {
			return;
		};
		let Some(nic) = msg.nic else {
			debug!("staged frame without nic reference, dropping");
			continue;
		};
		crate::net::ethernet::ingress(nic, msg);
	}
}

/// Driver-facing ingress: stage a received frame for processing outside
/// interrupt context. `msg.start..end` must span the whole frame.
pub fn enqueue_rx(nic: NicId, mut msg: NetMsg) {
	msg.nic = Some(nic);
	RX_STAGE.lock().push_back(msg);
	if NET_RX_QUEUE.schedule(drain_rx, 0, None).is_err() {
		// Queue full: an already scheduled drain will pick the frame up.
		trace!("rx work queue full, frame remains staged");
	}
}

// ── Loopback ────────────────────────────────────────────────────────────

/// Software interface: every transmitted frame is re-injected into the
/// receive path at the next work-queue trigger, never on the caller's
/// stack.
pub struct LoopbackDriver {
	id: SpinMutex<Option<NicId>>,
}

impl LoopbackDriver {
	pub fn new() -> Arc<Self> {
		Arc::new(Self {
			id: SpinMutex::new(None),
		})
	}

	pub fn attach(&self, id: NicId) {
		*self.id.lock() = Some(id);
	}
}

impl NicDriver for LoopbackDriver {
	fn tx_msg(&self, msg: NetMsg) -> Result<()> {
		let Some(id) = *self.id.lock() else {
			return Err(Error::ENODEV);
		};
		enqueue_rx(id, msg);
		Ok(())
	}

	fn get_config(&self) -> Result<DriverConfig> {
		// Big enough for a maximum IP datagram; loopback never
		// fragments.
		Ok(DriverConfig {
			mac: MacAddr([0x02, 0, 0, 0, 0, 0x01]),
			mtu: u16::MAX,
		})
	}
}
