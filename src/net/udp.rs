//! UDP: port-keyed datagram sockets.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::net::Ipv4Addr;

use hermit_sync::SpinMutex;

use crate::io::{Error, Result};
use crate::net::device::Nic;
use crate::net::netmsg::NetMsg;
use crate::net::socket::{self, wake, PollEvents, Proto, SockAddr, SockKind, Socket};
use crate::net::wire::{pseudo_header, Checksum, IpProto, UdpHeader, UDP_HDR_LEN};
use crate::net::{icmp, ip};
use crate::synch::{CancelToken, WaitOutcome};

/// Largest datagram payload: 65535 minus IP and UDP headers.
pub const UDP_MAX_PAYLOAD: usize = 65535 - 20 - UDP_HDR_LEN;

/// Messages parked per socket before new arrivals are dropped.
const UDP_RX_QUEUE_MAX: usize = 64;

/// One received datagram, cut down to its payload.
pub(crate) struct Datagram {
	pub src: SockAddr,
	pub msg: NetMsg,
}

pub(crate) struct UdpPcb {
	pub rcv_queue: VecDeque<Datagram>,
}

impl UdpPcb {
	pub(crate) fn new() -> Self {
		Self {
			rcv_queue: VecDeque::new(),
		}
	}
}

/// Serializes bind decisions so the duplicate check and the insertion
/// are one step; individual socket locks stay fine-grained.
static BIND_LOCK: SpinMutex<()> = SpinMutex::new(());

fn port_in_use(addr: SockAddr, skip: &Socket, reuse: bool) -> bool {
	for other in socket::all_sockets() {
		if other.id == skip.id || other.kind != SockKind::Dgram {
			continue;
		}
		let other_inner = other.inner.lock();
		if !other_inner.bound || other_inner.local.port != addr.port {
			continue;
		}
		let exact = other_inner.local.addr == addr.addr;
		let overlap =
			exact || other_inner.local.addr.is_unspecified() || addr.addr.is_unspecified();
		if overlap && !(reuse && other_inner.reuse_addr && !exact) {
			return true;
		}
	}
	false
}

fn pick_ephemeral(addr: Ipv4Addr, sock: &Socket) -> Result<u16> {
	for _ in 0..=u16::MAX - socket::EPHEMERAL_PORT_BASE {
		let port = socket::ephemeral_port();
		if !port_in_use(SockAddr::new(addr, port), sock, false) {
			return Ok(port);
		}
	}
	Err(Error::EADDRINUSE)
}

pub(crate) fn bind(sock: &Arc<Socket>, mut addr: SockAddr) -> Result<()> {
	let _bind_guard = BIND_LOCK.lock();
	let reuse = sock.inner.lock().reuse_addr;
	if addr.port == 0 {
		addr.port = pick_ephemeral(addr.addr, sock)?;
	} else if port_in_use(addr, sock, reuse) {
		return Err(Error::EADDRINUSE);
	}

	let mut inner = sock.inner.lock();
	if inner.bound {
		return Err(Error::EINVAL);
	}
	inner.local = addr;
	inner.bound = true;
	Ok(())
}

pub(crate) fn connect(sock: &Arc<Socket>, addr: SockAddr) -> Result<()> {
	if !addr.is_specified() {
		return Err(Error::EINVAL);
	}
	autobind(sock)?;
	let mut inner = sock.inner.lock();
	inner.foreign = addr;
	inner.connected = true;
	Ok(())
}

fn autobind(sock: &Arc<Socket>) -> Result<()> {
	let bound = sock.inner.lock().bound;
	if !bound {
		bind(sock, SockAddr::UNSPECIFIED)?;
	}
	Ok(())
}

pub(crate) fn send_to(
	sock: &Arc<Socket>,
	buf: &[u8],
	dst: Option<SockAddr>,
	_nonblocking: bool,
	_cancel: Option<&CancelToken>,
) -> Result<usize> {
	if buf.len() > UDP_MAX_PAYLOAD {
		return Err(Error::EMSGSIZE);
	}
	autobind(sock)?;

	let (src, dst) = {
		let mut inner = sock.inner.lock();
		if let Some(err) = inner.error.take() {
			return Err(err);
		}
		let dst = match dst {
			Some(d) => {
				if inner.connected {
					return Err(Error::EISCONN);
				}
				d
			}
			None => {
				if !inner.connected {
					return Err(Error::EDESTADDRREQ);
				}
				inner.foreign
			}
		};
		if dst.port == 0 {
			return Err(Error::EINVAL);
		}
		let src_addr = if inner.local.addr.is_unspecified() {
			ip::get_src_addr(dst.addr)?
		} else {
			inner.local.addr
		};
		(SockAddr::new(src_addr, inner.local.port), dst)
	};

	let udp_len = (UDP_HDR_LEN + buf.len()) as u16;
	let mut msg = NetMsg::new(buf.len());
	msg.append(buf.len())?.copy_from_slice(buf);

	let mut header = UdpHeader {
		src_port: src.port,
		dst_port: dst.port,
		len: udp_len,
		checksum: 0,
	};
	let mut csum = Checksum::new();
	csum.add_bytes(&pseudo_header(src.addr, dst.addr, IpProto::Udp, udp_len));
	let mut header_bytes = [0u8; UDP_HDR_LEN];
	header.encode(&mut header_bytes);
	csum.add_bytes(&header_bytes).add_bytes(buf);
	// An all-zero checksum means "none" on the wire.
	header.checksum = match csum.finish() {
		0 => 0xffff,
		c => c,
	};
	header.encode(msg.prepend(UDP_HDR_LEN)?);
	msg.udp_hdr = Some(msg.start_offset());

	ip::send(msg, Some(src.addr), dst.addr, IpProto::Udp, false)?;
	Ok(buf.len())
}

pub(crate) fn recv_from(
	sock: &Arc<Socket>,
	buf: &mut [u8],
	nonblocking: bool,
	cancel: Option<&CancelToken>,
) -> Result<(usize, SockAddr)> {
	let deadline = socket::deadline_from(sock.inner.lock().rcv_timeout);
	let mut guard = sock.inner.lock();
	loop {
		if let Some(err) = guard.error.take() {
			return Err(err);
		}
		if let Proto::Udp(pcb) = &mut guard.proto {
			if let Some(datagram) = pcb.rcv_queue.pop_front() {
				// One message per call; the unread tail is discarded.
				let data = datagram.msg.as_slice();
				let n = data.len().min(buf.len());
				buf[..n].copy_from_slice(&data[..n]);
				return Ok((n, datagram.src));
			}
		}
		if nonblocking {
			return Err(Error::EAGAIN);
		}
		let (g, outcome) = sock.rcv_cv.wait(&sock.inner, guard, deadline, cancel);
		guard = g;
		match outcome {
			WaitOutcome::Ready => {}
			WaitOutcome::Timeout => return Err(Error::EAGAIN),
			WaitOutcome::Cancelled => return Err(Error::EINTR),
		}
	}
}

pub(crate) fn close(sock: &Arc<Socket>) {
	{
		let mut inner = sock.inner.lock();
		if let Proto::Udp(pcb) = &mut inner.proto {
			pcb.rcv_queue.clear();
		}
		inner.error = Some(Error::EBADF);
		wake(sock, &mut inner, PollEvents::IN | PollEvents::OUT);
	}
	socket::unregister(sock.id);
}

/// Demux an incoming datagram. The best-matching socket wins: an exact
/// local address beats the wildcard, a connected socket filters on its
/// peer.
pub(crate) fn ingress(nic: &Arc<Nic>, mut msg: NetMsg) {
	msg.udp_hdr = Some(msg.start_offset());
	let Some(header) = UdpHeader::parse(msg.as_slice()) else {
		debug!("malformed udp header on {}, dropping", nic.name);
		return;
	};

	msg.truncate(usize::from(header.len));
	if header.checksum != 0 {
		let mut csum = Checksum::new();
		csum.add_bytes(&pseudo_header(msg.ip_src, msg.ip_dst, IpProto::Udp, header.len));
		csum.add_bytes(msg.as_slice());
		if csum.finish() != 0 {
			debug!("udp checksum mismatch from {}, dropping", msg.ip_src);
			return;
		}
	}
	if msg.cut_off(UDP_HDR_LEN).is_err() {
		return;
	}
	let src = SockAddr::new(msg.ip_src, header.src_port);

	let mut best: Option<(u32, Arc<Socket>)> = None;
	for sock in socket::all_sockets() {
		if sock.kind != SockKind::Dgram {
			continue;
		}
		let inner = sock.inner.lock();
		if !inner.bound || inner.local.port != header.dst_port {
			continue;
		}
		let mut score = 1u32;
		if inner.local.addr == msg.ip_dst {
			score += 2;
		} else if !inner.local.addr.is_unspecified() {
			continue;
		}
		if inner.connected {
			if inner.foreign != src {
				continue;
			}
			score += 4;
		}
		drop(inner);
		if best.as_ref().map(|(s, _)| score > *s).unwrap_or(true) {
			best = Some((score, sock));
		}
	}

	let Some((_, sock)) = best else {
		trace!("no udp socket on port {}", header.dst_port);
		if !msg.ip_dst.is_broadcast() {
			let _ = icmp::send_port_unreachable(&msg);
		}
		return;
	};

	let mut inner = sock.inner.lock();
	if let Proto::Udp(pcb) = &mut inner.proto {
		if pcb.rcv_queue.len() >= UDP_RX_QUEUE_MAX {
			debug!("udp receive queue full on port {}, dropping", header.dst_port);
			return;
		}
		pcb.rcv_queue.push_back(Datagram { src, msg });
	}
	wake(&sock, &mut inner, PollEvents::IN);
}

/// ICMP error feedback: surface on the matching connected socket.
pub(crate) fn icmp_error(local_port: u16, peer: Ipv4Addr, peer_port: u16, error: Error) {
	for sock in socket::all_sockets() {
		if sock.kind != SockKind::Dgram {
			continue;
		}
		let mut inner = sock.inner.lock();
		if inner.connected
			&& inner.local.port == local_port
			&& inner.foreign == SockAddr::new(peer, peer_port)
		{
			inner.error = Some(error);
			wake(&sock, &mut inner, PollEvents::IN | PollEvents::OUT);
			return;
		}
	}
}
