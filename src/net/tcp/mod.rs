//! TCP: socket operations, segment demux and the connection API.
//!
//! The state machine lives in [`input`]; segment building and the
//! send engine in [`output`]; the four timers in [`timer`]; the
//! control block and constants in [`tcb`].

mod input;
mod output;
pub(crate) mod tcb;
mod timer;

pub use tcb::TcpState;
pub(crate) use tcb::Tcb;

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::net::Ipv4Addr;

use hermit_sync::SpinMutex;

use crate::io::{Error, Result};
use crate::net::device::{self, Nic};
use crate::net::netmsg::NetMsg;
use crate::net::socket::{
	self, wake, PollEvents, Proto, SockAddr, SockKind, Socket, SocketId,
};
use crate::net::wire::{pseudo_header, Checksum, IpProto, TcpFlags, TcpHeader};
use crate::net::{ip, tcp::input::Segment};
use crate::synch::{CancelToken, WaitOutcome};
use crate::time;

use tcb::{generate_isn, RTO_MIN, TCP_DEFAULT_BACKLOG, TCP_DEFAULT_MSS};

/// Largest segment the path to `dst` can carry: egress MTU minus the
/// IP and TCP headers.
pub(crate) fn path_mss(dst: Ipv4Addr) -> u32 {
	match ip::route_lookup(dst).and_then(|r| device::get(r.nic).ok()) {
		Some(nic) => u32::from(nic.mtu).saturating_sub(40).max(TCP_DEFAULT_MSS),
		None => TCP_DEFAULT_MSS,
	}
}

static BIND_LOCK: SpinMutex<()> = SpinMutex::new(());

fn port_in_use(addr: SockAddr, skip: &Socket, reuse: bool) -> bool {
	for other in socket::all_sockets() {
		if other.id == skip.id || other.kind != SockKind::Stream {
			continue;
		}
		let other_inner = other.inner.lock();
		if !other_inner.bound || other_inner.local.port != addr.port {
			continue;
		}
		// With SO_REUSEADDR a lingering TIME-WAIT occupant is ignored.
		if reuse {
			if let Proto::Tcp(tcb) = &other_inner.proto {
				if tcb.state == TcpState::TimeWait {
					continue;
				}
			}
		}
		let overlap = other_inner.local.addr == addr.addr
			|| other_inner.local.addr.is_unspecified()
			|| addr.addr.is_unspecified();
		// A listener shares its port with its own children.
		if overlap && other_inner.foreign == SockAddr::UNSPECIFIED {
			return true;
		}
	}
	false
}

pub(crate) fn bind(sock: &Arc<Socket>, mut addr: SockAddr) -> Result<()> {
	let _bind_guard = BIND_LOCK.lock();
	let reuse = sock.inner.lock().reuse_addr;
	if addr.port == 0 {
		loop {
			let port = socket::ephemeral_port();
			if !port_in_use(SockAddr::new(addr.addr, port), sock, false) {
				addr.port = port;
				break;
			}
		}
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

pub(crate) fn listen(sock: &Arc<Socket>, backlog: i32) -> Result<()> {
	if backlog < 0 {
		return Err(Error::EINVAL);
	}
	let mut inner = sock.inner.lock();
	if !inner.bound {
		return Err(Error::EINVAL);
	}
	let Proto::Tcp(tcb) = &mut inner.proto else {
		return Err(Error::EINVAL);
	};
	if tcb.state != TcpState::Closed {
		return Err(Error::EINVAL);
	}
	tcb.state = TcpState::Listen;
	tcb.backlog = if backlog == 0 {
		TCP_DEFAULT_BACKLOG
	} else {
		backlog as usize
	};
	Ok(())
}

pub(crate) fn accept(
	sock: &Arc<Socket>,
	nonblocking: bool,
	cancel: Option<&CancelToken>,
) -> Result<Arc<Socket>> {
	let deadline = socket::deadline_from(sock.inner.lock().rcv_timeout);
	loop {
		let pending: Vec<SocketId> = {
			let inner = sock.inner.lock();
			let Proto::Tcp(tcb) = &inner.proto else {
				return Err(Error::EINVAL);
			};
			if tcb.state != TcpState::Listen {
				return Err(Error::EINVAL);
			}
			tcb.pending.iter().copied().collect()
		};

		let mut stale: Vec<SocketId> = Vec::new();
		let mut established: Option<Arc<Socket>> = None;
		for id in pending {
			let Some(child) = socket::get(id) else {
				stale.push(id);
				continue;
			};
			let state = child.tcp_state();
			match state {
				Some(TcpState::Established | TcpState::CloseWait) => {
					established = Some(child);
					break;
				}
				Some(TcpState::Closed) | None => stale.push(id),
				_ => {}
			}
		}

		if !stale.is_empty() || established.is_some() {
			let mut inner = sock.inner.lock();
			if let Proto::Tcp(tcb) = &mut inner.proto {
				tcb.pending.retain(|id| !stale.contains(id));
				if let Some(child) = &established {
					let before = tcb.pending.len();
					tcb.pending.retain(|id| *id != child.id);
					if tcb.pending.len() < before {
						tcb.ready_children = tcb.ready_children.saturating_sub(1);
					}
				}
			}
		}
		if let Some(child) = established {
			child.inner.lock().parent = None;
			return Ok(child);
		}

		if nonblocking {
			return Err(Error::EAGAIN);
		}
		let guard = sock.inner.lock();
		let ready = matches!(&guard.proto, Proto::Tcp(tcb) if tcb.ready_children > 0);
		if ready {
			continue;
		}
		let (_guard, outcome) = sock.rcv_cv.wait(&sock.inner, guard, deadline, cancel);
		match outcome {
			WaitOutcome::Ready => {}
			WaitOutcome::Timeout => return Err(Error::EAGAIN),
			WaitOutcome::Cancelled => return Err(Error::EINTR),
		}
	}
}

pub(crate) fn connect(
	sock: &Arc<Socket>,
	addr: SockAddr,
	nonblocking: bool,
	cancel: Option<&CancelToken>,
) -> Result<()> {
	if !addr.is_specified() || addr.port == 0 {
		return Err(Error::EINVAL);
	}
	let src_addr = ip::get_src_addr(addr.addr)?;

	{
		let bound = sock.inner.lock().bound;
		if !bound {
			bind(sock, SockAddr::new(src_addr, 0))?;
		}
	}

	{
		let mut inner = sock.inner.lock();
		if inner.local.addr.is_unspecified() {
			inner.local.addr = src_addr;
		}
		let local = inner.local;
		let Proto::Tcp(tcb) = &mut inner.proto else {
			return Err(Error::EINVAL);
		};
		match tcb.state {
			TcpState::Closed => {}
			TcpState::SynSent | TcpState::SynRcvd => return Err(Error::EALREADY),
			_ => return Err(Error::EISCONN),
		}

		tcb.iss = generate_isn(local, addr);
		tcb.snd_una = tcb.iss;
		tcb.snd_nxt = tcb.iss.wrapping_add(1);
		tcb.snd_max = tcb.snd_nxt;
		tcb.rmss = path_mss(addr.addr);
		tcb.smss = TCP_DEFAULT_MSS;
		tcb.state = TcpState::SynSent;
		tcb.rtx_count = 0;
		output::send_syn(tcb, local, addr);
		tcb.timers.rtx = Some(time::now() + RTO_MIN);

		inner.foreign = addr;
		inner.connected = true;
	}

	if nonblocking {
		return Err(Error::EINPROGRESS);
	}

	let deadline = socket::deadline_from(sock.inner.lock().snd_timeout);
	let mut guard = sock.inner.lock();
	loop {
		if let Some(err) = guard.error.take() {
			return Err(err);
		}
		if let Proto::Tcp(tcb) = &guard.proto {
			match tcb.state {
				TcpState::SynSent | TcpState::SynRcvd => {}
				TcpState::Closed => return Err(Error::ECONNREFUSED),
				_ => return Ok(()),
			}
		}
		let (g, outcome) = sock.snd_cv.wait(&sock.inner, guard, deadline, cancel);
		guard = g;
		match outcome {
			WaitOutcome::Ready => {}
			WaitOutcome::Timeout => return Err(Error::ETIMEDOUT),
			WaitOutcome::Cancelled => return Err(Error::EINTR),
		}
	}
}

pub(crate) fn send(
	sock: &Arc<Socket>,
	buf: &[u8],
	nonblocking: bool,
	cancel: Option<&CancelToken>,
) -> Result<usize> {
	let deadline = socket::deadline_from(sock.inner.lock().snd_timeout);
	let mut total = 0usize;
	let mut guard = sock.inner.lock();
	loop {
		if let Some(err) = guard.error {
			// A reset reports once, then the connection is a broken pipe.
			if err == Error::ECONNRESET {
				guard.error = Some(Error::EPIPE);
			}
			return Err(err);
		}

		let local = guard.local;
		let foreign = guard.foreign;
		let Proto::Tcp(tcb) = &mut guard.proto else {
			return Err(Error::EINVAL);
		};
		match tcb.state {
			TcpState::Established | TcpState::CloseWait => {}
			TcpState::Closed | TcpState::Listen | TcpState::SynSent | TcpState::SynRcvd => {
				return Err(Error::ENOTCONN);
			}
			_ => return Err(Error::EPIPE),
		}
		if tcb.fin_pending {
			return Err(Error::EPIPE);
		}

		let n = tcb.snd_buf.write(&buf[total..]);
		if n > 0 {
			total += n;
			output::output_tcb(tcb, local, foreign);
		}
		if total == buf.len() {
			return Ok(total);
		}
		if nonblocking {
			return if total > 0 { Ok(total) } else { Err(Error::EAGAIN) };
		}

		let (g, outcome) = sock.snd_cv.wait(&sock.inner, guard, deadline, cancel);
		guard = g;
		match outcome {
			WaitOutcome::Ready => {}
			// Partial progress beats an error report.
			WaitOutcome::Timeout => {
				return if total > 0 { Ok(total) } else { Err(Error::EAGAIN) };
			}
			WaitOutcome::Cancelled => {
				return if total > 0 { Ok(total) } else { Err(Error::EINTR) };
			}
		}
	}
}

pub(crate) fn recv(
	sock: &Arc<Socket>,
	buf: &mut [u8],
	nonblocking: bool,
	cancel: Option<&CancelToken>,
) -> Result<usize> {
	let deadline = socket::deadline_from(sock.inner.lock().rcv_timeout);
	let mut guard = sock.inner.lock();
	loop {
		let local = guard.local;
		let foreign = guard.foreign;
		if let Proto::Tcp(tcb) = &mut guard.proto {
			if tcb.state == TcpState::Listen {
				return Err(Error::ENOTCONN);
			}
			if !tcb.rcv_buf.is_empty() {
				let was_full = tcb.rcv_buf.free() == 0;
				let n = tcb.rcv_buf.read(buf);
				if was_full {
					// The closed window just reopened; tell the peer.
					tcb.ack_now = true;
					output::output_tcb(tcb, local, foreign);
				}
				return Ok(n);
			}
			if tcb.eof || tcb.rd_shutdown {
				return Ok(0);
			}
		}
		if let Some(err) = guard.error {
			return Err(err);
		}
		if matches!(&guard.proto, Proto::Tcp(tcb) if tcb.state == TcpState::Closed) {
			return Ok(0);
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

pub(crate) fn shutdown(sock: &Arc<Socket>, how: i32) -> Result<()> {
	let mut inner = sock.inner.lock();
	let local = inner.local;
	let foreign = inner.foreign;
	let Proto::Tcp(tcb) = &mut inner.proto else {
		return Err(Error::EINVAL);
	};
	if matches!(tcb.state, TcpState::Closed | TcpState::Listen | TcpState::SynSent) {
		return Err(Error::ENOTCONN);
	}
	let mut events = PollEvents::empty();
	if how == socket::SHUT_RD || how == socket::SHUT_RDWR {
		tcb.rd_shutdown = true;
		events |= PollEvents::IN;
	}
	if (how == socket::SHUT_WR || how == socket::SHUT_RDWR) && !tcb.fin_pending {
		tcb.fin_pending = true;
		match tcb.state {
			TcpState::Established => tcb.state = TcpState::FinWait1,
			TcpState::CloseWait => tcb.state = TcpState::LastAck,
			_ => {}
		}
		output::output_tcb(tcb, local, foreign);
	}
	if !events.is_empty() {
		wake(sock, &mut inner, events);
	}
	Ok(())
}

/// Close from the descriptor layer. An established connection starts
/// the orderly FIN sequence; everything else tears down immediately.
pub(crate) fn close(sock: &Arc<Socket>) {
	let mut unregister = false;
	let mut orphans: Vec<SocketId> = Vec::new();
	{
		let mut inner = sock.inner.lock();
		let local = inner.local;
		let foreign = inner.foreign;
		let Proto::Tcp(tcb) = &mut inner.proto else {
			return;
		};
		tcb.closed = true;
		match tcb.state {
			TcpState::Closed | TcpState::SynSent => {
				tcb.state = TcpState::Closed;
				tcb.timers = Default::default();
				unregister = true;
			}
			TcpState::Listen => {
				orphans.extend(tcb.pending.iter().copied());
				tcb.pending.clear();
				tcb.ready_children = 0;
				tcb.state = TcpState::Closed;
				unregister = true;
			}
			TcpState::Established | TcpState::SynRcvd => {
				tcb.fin_pending = true;
				tcb.state = TcpState::FinWait1;
				output::output_tcb(tcb, local, foreign);
			}
			TcpState::CloseWait => {
				tcb.fin_pending = true;
				tcb.state = TcpState::LastAck;
				output::output_tcb(tcb, local, foreign);
			}
			// Already closing; the timers finish the job.
			_ => {}
		}
		wake(sock, &mut inner, PollEvents::IN | PollEvents::OUT);
	}
	for id in orphans {
		if let Some(child) = socket::get(id) {
			child.close();
		}
	}
	if unregister {
		socket::unregister(sock.id);
	}
}

/// Demultiplex an incoming segment: exact four-tuple first, then a
/// listener on the local port. Segments for nobody get a RST.
pub(crate) fn ingress(nic: &Arc<Nic>, mut msg: NetMsg) {
	msg.tcp_hdr = Some(msg.start_offset());
	let Some(header) = TcpHeader::parse(msg.as_slice()) else {
		debug!("malformed tcp header on {}, dropping", nic.name);
		return;
	};

	let mut csum = Checksum::new();
	csum.add_bytes(&pseudo_header(
		msg.ip_src,
		msg.ip_dst,
		IpProto::Tcp,
		msg.len() as u16,
	));
	csum.add_bytes(msg.as_slice());
	if csum.finish() != 0 {
		debug!("tcp checksum mismatch from {}, dropping", msg.ip_src);
		return;
	}

	if msg.cut_off(header.data_off).is_err() {
		return;
	}
	let seg = Segment {
		src: SockAddr::new(msg.ip_src, header.src_port),
		dst: SockAddr::new(msg.ip_dst, header.dst_port),
		seq: header.seq,
		ack: header.ack,
		flags: header.flags,
		wnd: u32::from(header.window),
		mss: header.mss,
		payload: msg,
	};

	let mut exact: Option<Arc<Socket>> = None;
	let mut listener: Option<Arc<Socket>> = None;
	for sock in socket::all_sockets() {
		if sock.kind != SockKind::Stream {
			continue;
		}
		let inner = sock.inner.lock();
		if !inner.bound || inner.local.port != seg.dst.port {
			continue;
		}
		let is_listen = matches!(&inner.proto, Proto::Tcp(tcb) if tcb.state == TcpState::Listen);
		if is_listen {
			if inner.local.addr.is_unspecified() || inner.local.addr == seg.dst.addr {
				drop(inner);
				listener.get_or_insert(sock);
			}
		} else if inner.foreign == seg.src && inner.local.addr == seg.dst.addr {
			drop(inner);
			exact = Some(sock);
			break;
		}
	}

	match exact.or(listener) {
		Some(sock) => input::process(&sock, seg),
		None => {
			trace!("segment for {} has no socket", seg.dst);
			if !seg.flags.contains(TcpFlags::RST) {
				output::send_rst_for(seg.src, seg.dst, seg.seq, seg.ack, seg.flags, seg.seg_len());
			}
		}
	}
}

/// ICMP feedback: a connection attempt to an unreachable host fails
/// fast; established connections treat it as a soft error.
pub(crate) fn icmp_error(local_port: u16, peer: Ipv4Addr, peer_port: u16, error: Error) {
	for sock in socket::all_sockets() {
		if sock.kind != SockKind::Stream {
			continue;
		}
		let mut inner = sock.inner.lock();
		if inner.local.port != local_port || inner.foreign != SockAddr::new(peer, peer_port) {
			continue;
		}
		let Proto::Tcp(tcb) = &mut inner.proto else {
			continue;
		};
		if matches!(tcb.state, TcpState::SynSent | TcpState::SynRcvd) {
			tcb.state = TcpState::Closed;
			tcb.timers = Default::default();
			inner.error = Some(error);
			wake(&sock, &mut inner, PollEvents::IN | PollEvents::OUT);
		} else {
			trace!("soft icmp error on established connection: {}", error);
		}
		return;
	}
}

pub(crate) fn tick() {
	timer::tick();
}
