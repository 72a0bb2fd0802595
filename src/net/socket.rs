//! Generic socket layer.
//!
//! A [`Socket`] is the protocol-independent half of a connection: local
//! and foreign name, sticky error, timeouts, the two condition
//! variables blocking senders and receivers, and the select-waiter
//! list. The protocol payload is an embedded tagged union
//! ([`Proto`]); dispatch goes by the immutable socket kind so no lock
//! is needed to pick the implementation.
//!
//! Lock order: the global socket table is only held to translate an id
//! into an `Arc`, never across a per-socket lock; per-socket state is
//! serialized by one spinlock; the condition variables and select
//! semaphores are leaves.

use alloc::collections::{BTreeMap, VecDeque};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::net::Ipv4Addr;
use core::sync::atomic::{AtomicU16, AtomicUsize, Ordering};

use hermit_sync::SpinMutex;
use smallvec::SmallVec;

use crate::io::{Error, Result};
use crate::net::netmsg::NetMsg;
use crate::net::wire::IpProto;
use crate::net::{ip, tcp, udp};
use crate::synch::{CancelToken, CondVar, Semaphore, WaitOutcome};
use crate::time::{self, TimeVal};

pub const AF_INET: i32 = 2;

pub const SOCK_STREAM: i32 = 1;
pub const SOCK_DGRAM: i32 = 2;
pub const SOCK_RAW: i32 = 3;

pub const SOL_SOCKET: i32 = 1;
pub const SO_REUSEADDR: i32 = 2;
pub const SO_SNDTIMEO: i32 = 21;
pub const SO_RCVTIMEO: i32 = 20;

pub const SHUT_RD: i32 = 0;
pub const SHUT_WR: i32 = 1;
pub const SHUT_RDWR: i32 = 2;

/// First ephemeral port handed out by `bind(0)` and `connect`.
pub const EPHEMERAL_PORT_BASE: u16 = 49152;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SockAddr {
	pub addr: Ipv4Addr,
	pub port: u16,
}

impl SockAddr {
	pub const UNSPECIFIED: SockAddr = SockAddr {
		addr: Ipv4Addr::UNSPECIFIED,
		port: 0,
	};

	pub const fn new(addr: Ipv4Addr, port: u16) -> Self {
		Self { addr, port }
	}

	pub fn is_specified(&self) -> bool {
		self.port != 0 || !self.addr.is_unspecified()
	}
}

impl fmt::Display for SockAddr {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}:{}", self.addr, self.port)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SockKind {
	Stream,
	Dgram,
	Raw,
}

bitflags::bitflags! {
	#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
	pub struct PollEvents: u8 {
		const IN = 0x1;
		const OUT = 0x2;
	}
}

/// One registered `select` waiter.
pub(crate) struct SelectWaiter {
	pub mask: PollEvents,
	pub sem: Arc<Semaphore>,
	/// Events actually seen while the waiter was registered.
	pub hits: Arc<SpinMutex<PollEvents>>,
	pub token: usize,
}

/// Protocol payload, embedded tagged-union style.
pub(crate) enum Proto {
	Udp(udp::UdpPcb),
	Tcp(tcp::Tcb),
	Raw(RawPcb),
}

/// Raw-IP socket state: a protocol filter and a queue of datagrams
/// (full IP packets, header included).
pub(crate) struct RawPcb {
	pub proto: u8,
	pub rcv_queue: VecDeque<NetMsg>,
}

pub(crate) struct SocketInner {
	pub local: SockAddr,
	pub foreign: SockAddr,
	pub bound: bool,
	pub connected: bool,
	/// Sticky error set by protocol events (RST, ICMP errors).
	pub error: Option<Error>,
	pub snd_timeout: Option<u64>,
	pub rcv_timeout: Option<u64>,
	pub reuse_addr: bool,
	/// Listener that spawned this socket, for accepted connections.
	pub parent: Option<SocketId>,
	pub(crate) waiters: SmallVec<[SelectWaiter; 2]>,
	pub proto: Proto,
}

pub struct Socket {
	pub id: SocketId,
	pub kind: SockKind,
	pub(crate) inner: SpinMutex<SocketInner>,
	/// Receive-buffer state changes, new connections, connect
	/// completion.
	pub(crate) rcv_cv: CondVar,
	/// Send-buffer state changes.
	pub(crate) snd_cv: CondVar,
}

static SOCKETS: SpinMutex<BTreeMap<SocketId, Arc<Socket>>> = SpinMutex::new(BTreeMap::new());
static NEXT_ID: AtomicUsize = AtomicUsize::new(1);
static NEXT_WAITER_TOKEN: AtomicUsize = AtomicUsize::new(1);
static EPHEMERAL: AtomicU16 = AtomicU16::new(EPHEMERAL_PORT_BASE);

pub(crate) fn ephemeral_port() -> u16 {
	let port = EPHEMERAL.fetch_add(1, Ordering::SeqCst);
	if port == 0 {
		EPHEMERAL.store(EPHEMERAL_PORT_BASE, Ordering::SeqCst);
		EPHEMERAL_PORT_BASE
	} else {
		port
	}
}

pub(crate) fn all_sockets() -> Vec<Arc<Socket>> {
	SOCKETS.lock().values().cloned().collect()
}

pub(crate) fn get(id: SocketId) -> Option<Arc<Socket>> {
	SOCKETS.lock().get(&id).cloned()
}

pub(crate) fn unregister(id: SocketId) {
	SOCKETS.lock().remove(&id);
}

pub(crate) fn register(kind: SockKind, proto: Proto) -> Arc<Socket> {
	let id = SocketId(NEXT_ID.fetch_add(1, Ordering::SeqCst));
	let socket = Arc::new(Socket {
		id,
		kind,
		inner: SpinMutex::new(SocketInner {
			local: SockAddr::UNSPECIFIED,
			foreign: SockAddr::UNSPECIFIED,
			bound: false,
			connected: false,
			error: None,
			snd_timeout: None,
			rcv_timeout: None,
			reuse_addr: false,
			parent: None,
			waiters: SmallVec::new(),
			proto,
		}),
		rcv_cv: CondVar::new(),
		snd_cv: CondVar::new(),
	});
	SOCKETS.lock().insert(id, socket.clone());
	socket
}

/// `socket(domain, type, protocol)`.
pub fn create(domain: i32, sock_type: i32, protocol: i32) -> Result<Arc<Socket>> {
	if domain != AF_INET {
		return Err(Error::EAFNOSUPPORT);
	}
	match sock_type {
		SOCK_DGRAM => {
			if protocol != 0 && protocol != IpProto::Udp as i32 {
				return Err(Error::EPROTONOSUPPORT);
			}
			Ok(register(SockKind::Dgram, Proto::Udp(udp::UdpPcb::new())))
		}
		SOCK_STREAM => {
			if protocol != 0 && protocol != IpProto::Tcp as i32 {
				return Err(Error::EPROTONOSUPPORT);
			}
			Ok(register(SockKind::Stream, Proto::Tcp(tcp::Tcb::new())))
		}
		SOCK_RAW => {
			let proto = u8::try_from(protocol).map_err(|_| Error::EPROTONOSUPPORT)?;
			Ok(register(
				SockKind::Raw,
				Proto::Raw(RawPcb {
					proto,
					rcv_queue: VecDeque::new(),
				}),
			))
		}
		_ => Err(Error::EPROTONOSUPPORT),
	}
}

/// Wake protocol-event waiters: condition variables plus every
/// matching select waiter. Call with the socket lock held and any
/// protocol borrow already released.
pub(crate) fn wake(sock: &Socket, inner: &mut SocketInner, events: PollEvents) {
	if events.contains(PollEvents::IN) {
		sock.rcv_cv.broadcast();
	}
	if events.contains(PollEvents::OUT) {
		sock.snd_cv.broadcast();
	}
	for waiter in inner.waiters.iter() {
		let matched = waiter.mask & events;
		if !matched.is_empty() {
			*waiter.hits.lock() |= matched;
			waiter.sem.up();
		}
	}
}

impl Socket {
	pub fn bind(self: &Arc<Self>, addr: SockAddr) -> Result<()> {
		match self.kind {
			SockKind::Dgram => udp::bind(self, addr),
			SockKind::Stream => tcp::bind(self, addr),
			SockKind::Raw => {
				let mut inner = self.inner.lock();
				inner.local = addr;
				inner.bound = true;
				Ok(())
			}
		}
	}

	pub fn connect(
		self: &Arc<Self>,
		addr: SockAddr,
		nonblocking: bool,
		cancel: Option<&CancelToken>,
	) -> Result<()> {
		match self.kind {
			SockKind::Dgram => udp::connect(self, addr),
			SockKind::Stream => tcp::connect(self, addr, nonblocking, cancel),
			SockKind::Raw => {
				let mut inner = self.inner.lock();
				inner.foreign = addr;
				inner.connected = true;
				Ok(())
			}
		}
	}

	pub fn listen(self: &Arc<Self>, backlog: i32) -> Result<()> {
		match self.kind {
			SockKind::Stream => tcp::listen(self, backlog),
			_ => Err(Error::EOPNOTSUPP),
		}
	}

	pub fn accept(
		self: &Arc<Self>,
		nonblocking: bool,
		cancel: Option<&CancelToken>,
	) -> Result<Arc<Socket>> {
		match self.kind {
			SockKind::Stream => tcp::accept(self, nonblocking, cancel),
			_ => Err(Error::EOPNOTSUPP),
		}
	}

	pub fn send(
		self: &Arc<Self>,
		buf: &[u8],
		nonblocking: bool,
		cancel: Option<&CancelToken>,
	) -> Result<usize> {
		self.send_to(buf, None, nonblocking, cancel)
	}

	pub fn send_to(
		self: &Arc<Self>,
		buf: &[u8],
		dst: Option<SockAddr>,
		nonblocking: bool,
		cancel: Option<&CancelToken>,
	) -> Result<usize> {
		match self.kind {
			SockKind::Dgram => udp::send_to(self, buf, dst, nonblocking, cancel),
			SockKind::Stream => {
				if dst.is_some() {
					return Err(Error::EISCONN);
				}
				tcp::send(self, buf, nonblocking, cancel)
			}
			SockKind::Raw => self.raw_send_to(buf, dst),
		}
	}

	pub fn recv(
		self: &Arc<Self>,
		buf: &mut [u8],
		nonblocking: bool,
		cancel: Option<&CancelToken>,
	) -> Result<usize> {
		self.recv_from(buf, nonblocking, cancel).map(|(n, _)| n)
	}

	pub fn recv_from(
		self: &Arc<Self>,
		buf: &mut [u8],
		nonblocking: bool,
		cancel: Option<&CancelToken>,
	) -> Result<(usize, SockAddr)> {
		match self.kind {
			SockKind::Dgram => udp::recv_from(self, buf, nonblocking, cancel),
			SockKind::Stream => {
				let n = tcp::recv(self, buf, nonblocking, cancel)?;
				let peer = self.inner.lock().foreign;
				Ok((n, peer))
			}
			SockKind::Raw => self.raw_recv_from(buf, nonblocking, cancel),
		}
	}

	pub fn shutdown(self: &Arc<Self>, how: i32) -> Result<()> {
		if !(SHUT_RD..=SHUT_RDWR).contains(&how) {
			return Err(Error::EINVAL);
		}
		match self.kind {
			SockKind::Stream => tcp::shutdown(self, how),
			_ => Ok(()),
		}
	}

	/// Release the protocol state and wake everyone still blocked on
	/// the socket. The storage goes away when the last `Arc` drops.
	pub fn close(self: &Arc<Self>) {
		match self.kind {
			SockKind::Dgram => udp::close(self),
			SockKind::Stream => tcp::close(self),
			SockKind::Raw => {
				let mut inner = self.inner.lock();
				if let Proto::Raw(pcb) = &mut inner.proto {
					pcb.rcv_queue.clear();
				}
				inner.error = Some(Error::EBADF);
				wake(self, &mut inner, PollEvents::IN | PollEvents::OUT);
				drop(inner);
				unregister(self.id);
			}
		}
	}

	pub fn setsockopt(self: &Arc<Self>, level: i32, name: i32, value: SockOptValue) -> Result<()> {
		if level != SOL_SOCKET {
			return Err(Error::EINVAL);
		}
		let mut inner = self.inner.lock();
		match (name, value) {
			(SO_REUSEADDR, SockOptValue::Flag(on)) => {
				inner.reuse_addr = on;
				Ok(())
			}
			(SO_SNDTIMEO, SockOptValue::Time(tv)) => {
				inner.snd_timeout = timeout_from(tv)?;
				Ok(())
			}
			(SO_RCVTIMEO, SockOptValue::Time(tv)) => {
				inner.rcv_timeout = timeout_from(tv)?;
				Ok(())
			}
			_ => Err(Error::EINVAL),
		}
	}

	/// Local name (`getsockname`).
	pub fn local_name(&self) -> SockAddr {
		self.inner.lock().local
	}

	/// Peer name; fails on unconnected sockets.
	pub fn peer_name(&self) -> Result<SockAddr> {
		let inner = self.inner.lock();
		if inner.connected {
			Ok(inner.foreign)
		} else {
			Err(Error::ENOTCONN)
		}
	}

	pub fn last_error(&self) -> Option<Error> {
		self.inner.lock().error
	}

	/// Connection state of a TCP socket, netstat-style.
	pub fn tcp_state(&self) -> Option<tcp::TcpState> {
		match &self.inner.lock().proto {
			Proto::Tcp(tcb) => Some(tcb.state),
			_ => None,
		}
	}

	/// Immediate readiness, no side effects.
	pub fn poll_ready(&self, mask: PollEvents) -> PollEvents {
		let inner = self.inner.lock();
		let mut ready = PollEvents::empty();
		if inner.error.is_some() {
			// A pending error is both readable and writable: the next
			// call reports it.
			return mask;
		}
		match &inner.proto {
			Proto::Udp(pcb) => {
				if !pcb.rcv_queue.is_empty() {
					ready |= PollEvents::IN;
				}
				ready |= PollEvents::OUT;
			}
			Proto::Tcp(tcb) => ready = tcb.poll_ready(),
			Proto::Raw(pcb) => {
				if !pcb.rcv_queue.is_empty() {
					ready |= PollEvents::IN;
				}
				ready |= PollEvents::OUT;
			}
		}
		ready & mask
	}

	pub(crate) fn add_waiter(&self, waiter: SelectWaiter) {
		self.inner.lock().waiters.push(waiter);
	}

	/// Atomic cancellation of a registered waiter.
	pub(crate) fn remove_waiter(&self, token: usize) -> PollEvents {
		let mut inner = self.inner.lock();
		let mut hits = PollEvents::empty();
		inner.waiters.retain(|w| {
			if w.token == token {
				hits |= *w.hits.lock();
				false
			} else {
				true
			}
		});
		hits
	}

	// ── Raw-IP implementation ───────────────────────────────────────

	fn raw_send_to(self: &Arc<Self>, buf: &[u8], dst: Option<SockAddr>) -> Result<usize> {
		let (proto, dst_addr) = {
			let inner = self.inner.lock();
			let Proto::Raw(pcb) = &inner.proto else {
				return Err(Error::EINVAL);
			};
			let dst_addr = match dst {
				Some(d) => d.addr,
				None if inner.connected => inner.foreign.addr,
				None => return Err(Error::EDESTADDRREQ),
			};
			(pcb.proto, dst_addr)
		};
		let mut msg = NetMsg::new(buf.len());
		msg.append(buf.len())?.copy_from_slice(buf);
		ip::send(msg, None, dst_addr, ip_proto_of(proto)?, false)?;
		Ok(buf.len())
	}

	fn raw_recv_from(
		self: &Arc<Self>,
		buf: &mut [u8],
		nonblocking: bool,
		cancel: Option<&CancelToken>,
	) -> Result<(usize, SockAddr)> {
		let deadline = deadline_from(self.inner.lock().rcv_timeout);
		let mut guard = self.inner.lock();
		loop {
			if let Some(err) = guard.error {
				return Err(err);
			}
			if let Proto::Raw(pcb) = &mut guard.proto {
				if let Some(msg) = pcb.rcv_queue.pop_front() {
					let data = msg.as_slice();
					let n = data.len().min(buf.len());
					buf[..n].copy_from_slice(&data[..n]);
					return Ok((n, SockAddr::new(msg.ip_src, 0)));
				}
			}
			if nonblocking {
				return Err(Error::EAGAIN);
			}
			let (g, outcome) = self.rcv_cv.wait(&self.inner, guard, deadline, cancel);
			guard = g;
			match outcome {
				WaitOutcome::Ready => {}
				WaitOutcome::Timeout => return Err(Error::EAGAIN),
				WaitOutcome::Cancelled => return Err(Error::EINTR),
			}
		}
	}
}

/// Mirror every matching datagram into raw sockets. Called by the IP
/// layer before protocol demux; the message still carries its header
/// at `ip_hdr`.
pub(crate) fn raw_ingress(msg: &NetMsg) {
	let sockets = all_sockets();
	for sock in sockets {
		if sock.kind != SockKind::Raw {
			continue;
		}
		let mut inner = sock.inner.lock();
		let deliver = match &inner.proto {
			Proto::Raw(pcb) => pcb.proto == msg.ip_proto,
			_ => false,
		};
		if !deliver || (inner.connected && inner.foreign.addr != msg.ip_src) {
			continue;
		}
		// Raw sockets see the datagram from the IP header on.
		let Some(ip_hdr) = msg.ip_hdr else {
			continue;
		};
		let mut copy = NetMsg::new(msg.bytes_from(ip_hdr).len());
		let len = msg.bytes_from(ip_hdr).len();
		if let Ok(buf) = copy.append(len) {
			buf.copy_from_slice(msg.bytes_from(ip_hdr));
			copy.ip_src = msg.ip_src;
			copy.ip_dst = msg.ip_dst;
			copy.ip_proto = msg.ip_proto;
			if let Proto::Raw(pcb) = &mut inner.proto {
				if pcb.rcv_queue.len() < 64 {
					pcb.rcv_queue.push_back(copy);
				} else {
					debug!("raw socket queue full, dropping datagram");
					continue;
				}
			}
			wake(&sock, &mut inner, PollEvents::IN);
		}
	}
}

/// `setsockopt` value carrier.
#[derive(Debug, Clone, Copy)]
pub enum SockOptValue {
	Flag(bool),
	Time(TimeVal),
}

fn timeout_from(tv: TimeVal) -> Result<Option<u64>> {
	let ticks = tv.to_ticks().ok_or(Error::EINVAL)?;
	Ok(if ticks == 0 { None } else { Some(ticks) })
}

pub(crate) fn deadline_from(timeout: Option<u64>) -> Option<u64> {
	timeout.map(|t| time::now().saturating_add(t))
}

fn ip_proto_of(raw: u8) -> Result<IpProto> {
	IpProto::try_from(raw).map_err(|_| Error::EPROTONOSUPPORT)
}

// ── select ──────────────────────────────────────────────────────────────

/// Wait until any socket in `entries` is ready for its mask.
///
/// Returns per-entry readiness in registration order. A zero-tick
/// timeout polls; `None` blocks without bound.
pub fn select(
	entries: &[(Arc<Socket>, PollEvents)],
	timeout: Option<u64>,
	cancel: Option<&CancelToken>,
) -> Result<Vec<PollEvents>> {
	let mut ready: Vec<PollEvents> = entries
		.iter()
		.map(|(sock, mask)| sock.poll_ready(*mask))
		.collect();
	let poll_only = timeout == Some(0);
	if poll_only || ready.iter().any(|r| !r.is_empty()) {
		return Ok(ready);
	}

	let sem = Arc::new(Semaphore::new(0));
	let token = NEXT_WAITER_TOKEN.fetch_add(1, Ordering::SeqCst);
	for (sock, mask) in entries {
		sock.add_waiter(SelectWaiter {
			mask: *mask,
			sem: sem.clone(),
			hits: Arc::new(SpinMutex::new(PollEvents::empty())),
			token,
		});
	}

	// Events may have landed between the poll and the registration.
	let registered_ready: Vec<PollEvents> = entries
		.iter()
		.map(|(sock, mask)| sock.poll_ready(*mask))
		.collect();
	let outcome = if registered_ready.iter().any(|r| !r.is_empty()) {
		WaitOutcome::Ready
	} else {
		let deadline = deadline_from(timeout);
		sem.down(deadline, cancel)
	};

	for (i, (sock, mask)) in entries.iter().enumerate() {
		let hits = sock.remove_waiter(token);
		ready[i] = (hits | sock.poll_ready(*mask)) & *mask;
	}

	match outcome {
		WaitOutcome::Cancelled if ready.iter().all(|r| r.is_empty()) => Err(Error::EINTR),
		_ => Ok(ready),
	}
}

pub(crate) fn reset() {
	SOCKETS.lock().clear();
	EPHEMERAL.store(EPHEMERAL_PORT_BASE, Ordering::SeqCst);
}
