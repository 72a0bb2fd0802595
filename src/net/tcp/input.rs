//! TCP segment arrival processing (RFC 793 event "SEGMENT ARRIVES").

use alloc::sync::Arc;
use smallvec::SmallVec;

use crate::io::Error;
use crate::net::netmsg::NetMsg;
use crate::net::socket::{self, wake, PollEvents, Proto, SockAddr, SockKind, Socket, SocketId};
use crate::net::tcp::output;
use crate::net::tcp::tcb::{
	seq_ge, seq_gt, seq_le, seq_lt, generate_isn, Tcb, TcpState, DELACK_TICKS, RTO_MIN,
	TIME_WAIT_TICKS,
};
use crate::net::wire::TcpFlags;
use crate::time;

pub(crate) struct Segment {
	pub src: SockAddr,
	pub dst: SockAddr,
	pub seq: u32,
	pub ack: u32,
	pub flags: TcpFlags,
	pub wnd: u32,
	pub mss: Option<u16>,
	/// Cut down to the payload bytes.
	pub payload: NetMsg,
}

impl Segment {
	/// Sequence space the segment occupies.
	pub(crate) fn seg_len(&self) -> u32 {
		let mut len = self.payload.len() as u32;
		if self.flags.contains(TcpFlags::SYN) {
			len += 1;
		}
		if self.flags.contains(TcpFlags::FIN) {
			len += 1;
		}
		len
	}
}

/// Work that must run after the socket lock is released.
enum PostAction {
	NotifyParent(SocketId, SocketId),
	Unregister(SocketId),
}

pub(crate) fn process(sock: &Arc<Socket>, seg: Segment) {
	if sock.inner.lock().is_listener() {
		handle_listen(sock, seg);
		return;
	}

	let mut post: SmallVec<[PostAction; 2]> = SmallVec::new();
	{
		let mut inner = sock.inner.lock();
		let events = segment_arrives(sock.id, &mut inner, seg, &mut post);
		if !events.is_empty() {
			wake(sock, &mut inner, events);
		}
	}

	for action in post {
		match action {
			PostAction::NotifyParent(parent, child) => notify_parent(parent, child),
			PostAction::Unregister(id) => socket::unregister(id),
		}
	}
}

trait ListenerCheck {
	fn is_listener(&self) -> bool;
}

impl ListenerCheck for crate::net::socket::SocketInner {
	fn is_listener(&self) -> bool {
		matches!(&self.proto, Proto::Tcp(tcb) if tcb.state == TcpState::Listen)
	}
}

/// SYN arriving at a listener spawns a half-open child socket; the
/// listener lock is never held across the child's creation.
fn handle_listen(listener: &Arc<Socket>, seg: Segment) {
	if seg.flags.contains(TcpFlags::RST) {
		return;
	}
	if seg.flags.contains(TcpFlags::ACK) {
		output::send_rst_for(seg.src, seg.dst, seg.seq, seg.ack, seg.flags, seg.seg_len());
		return;
	}
	if !seg.flags.contains(TcpFlags::SYN) {
		return;
	}

	{
		let inner = listener.inner.lock();
		let Proto::Tcp(tcb) = &inner.proto else {
			return;
		};
		if tcb.pending.len() >= tcb.backlog {
			// Backlog exhausted: drop the SYN silently, the peer will
			// retransmit once the queue drains.
			debug!("listen backlog full on {}, dropping syn", inner.local);
			return;
		}
	}

	let child = socket::register(SockKind::Stream, Proto::Tcp(Tcb::new()));
	{
		let mut inner = child.inner.lock();
		inner.local = seg.dst;
		inner.foreign = seg.src;
		inner.bound = true;
		inner.parent = Some(listener.id);
		let local = inner.local;
		let foreign = inner.foreign;
		if let Proto::Tcp(tcb) = &mut inner.proto {
			tcb.state = TcpState::SynRcvd;
			tcb.irs = seg.seq;
			tcb.rcv_nxt = seg.seq.wrapping_add(1);
			tcb.rcv_adv = tcb.rcv_nxt;
			tcb.iss = generate_isn(local, foreign);
			tcb.snd_una = tcb.iss;
			tcb.snd_nxt = tcb.iss.wrapping_add(1);
			tcb.snd_max = tcb.snd_nxt;
			tcb.snd_wnd = seg.wnd;
			tcb.snd_wl1 = seg.seq;
			tcb.snd_wl2 = seg.ack;
			tcb.rmss = crate::net::tcp::path_mss(foreign.addr);
			tcb.smss = u32::from(seg.mss.unwrap_or(536)).min(tcb.rmss);
			tcb.cwnd = tcb.smss;
			output::send_syn_ack(tcb, local, foreign);
			tcb.timers.rtx = Some(time::now() + RTO_MIN);
		}
	}

	let mut inner = listener.inner.lock();
	let Proto::Tcp(tcb) = &mut inner.proto else {
		return;
	};
	if tcb.state == TcpState::Listen && tcb.pending.len() < tcb.backlog {
		tcb.pending.push_back(child.id);
	} else {
		drop(inner);
		socket::unregister(child.id);
	}
}

/// A freshly established child makes the listener readable.
fn notify_parent(parent: SocketId, child: SocketId) {
	let Some(listener) = socket::get(parent) else {
		return;
	};
	let mut inner = listener.inner.lock();
	let known = match &mut inner.proto {
		Proto::Tcp(tcb) if tcb.state == TcpState::Listen => {
			if tcb.pending.contains(&child) {
				tcb.ready_children += 1;
				true
			} else {
				false
			}
		}
		_ => false,
	};
	if known {
		wake(&listener, &mut inner, PollEvents::IN);
	}
}

fn reset_connection(tcb: &mut Tcb, error: Error) -> Error {
	tcb.state = TcpState::Closed;
	tcb.timers = Default::default();
	tcb.current_rtt = -1;
	error
}

fn segment_arrives(
	self_id: SocketId,
	inner: &mut crate::net::socket::SocketInner,
	seg: Segment,
	post: &mut SmallVec<[PostAction; 2]>,
) -> PollEvents {
	let local = inner.local;
	let foreign = inner.foreign;
	let mut events = PollEvents::empty();
	let mut became_connected = false;
	let mut sticky_error = None;

	let Proto::Tcp(tcb) = &mut inner.proto else {
		return events;
	};

	match tcb.state {
		TcpState::Closed => {
			if !seg.flags.contains(TcpFlags::RST) {
				output::send_rst_for(seg.src, seg.dst, seg.seq, seg.ack, seg.flags, seg.seg_len());
			}
			return events;
		}
		TcpState::SynSent => {
			let ack_ok = seg.flags.contains(TcpFlags::ACK)
				&& seq_gt(seg.ack, tcb.snd_una)
				&& seq_le(seg.ack, tcb.snd_max);
			if seg.flags.contains(TcpFlags::ACK) && !ack_ok {
				if !seg.flags.contains(TcpFlags::RST) {
					output::send_rst_for(
						seg.src,
						seg.dst,
						seg.seq,
						seg.ack,
						seg.flags,
						seg.seg_len(),
					);
				}
				return events;
			}
			if seg.flags.contains(TcpFlags::RST) {
				if ack_ok {
					sticky_error = Some(reset_connection(tcb, Error::ECONNREFUSED));
					events |= PollEvents::IN | PollEvents::OUT;
				}
			} else if seg.flags.contains(TcpFlags::SYN) {
				tcb.irs = seg.seq;
				tcb.rcv_nxt = seg.seq.wrapping_add(1);
				tcb.rcv_adv = tcb.rcv_nxt;
				if let Some(mss) = seg.mss {
					tcb.smss = u32::from(mss).min(crate::net::tcp::path_mss(foreign.addr));
				}
				if ack_ok {
					tcb.snd_una = seg.ack;
					tcb.state = TcpState::Established;
					tcb.cwnd = tcb.smss;
					tcb.snd_wnd = seg.wnd;
					tcb.snd_wl1 = seg.seq;
					tcb.snd_wl2 = seg.ack;
					tcb.max_wnd = seg.wnd;
					tcb.timers.rtx = None;
					tcb.rtx_count = 0;
					tcb.backoff_shift = 0;
					tcb.ack_now = true;
					became_connected = true;
					events |= PollEvents::OUT;
					trace!("{} -> {} established, smss {}", local, foreign, tcb.smss);
					output::output_tcb(tcb, local, foreign);
				} else {
					// Simultaneous open.
					tcb.state = TcpState::SynRcvd;
					output::send_syn_ack(tcb, local, foreign);
				}
			}
			if sticky_error.is_some() {
				inner.error = sticky_error;
			}
			if became_connected {
				inner.connected = true;
			}
			return events;
		}
		_ => {}
	}

	// Step 1: acceptance test against the advertised window.
	let seg_len = seg.seg_len();
	let rcv_wnd = tcb.rcv_adv.wrapping_sub(tcb.rcv_nxt);
	let seq_in_window = |seq: u32| {
		seq_ge(seq, tcb.rcv_nxt) && seq_lt(seq, tcb.rcv_nxt.wrapping_add(rcv_wnd))
	};
	let acceptable = if seg_len == 0 {
		if rcv_wnd == 0 {
			seg.seq == tcb.rcv_nxt
		} else {
			seq_in_window(seg.seq)
		}
	} else if rcv_wnd == 0 {
		false
	} else {
		seq_in_window(seg.seq) || seq_in_window(seg.seq.wrapping_add(seg_len - 1))
	};
	if !acceptable {
		if !seg.flags.contains(TcpFlags::RST) {
			output::send_ack(tcb, local, foreign);
		}
		return events;
	}

	// Step 2: RST.
	if seg.flags.contains(TcpFlags::RST) {
		let error = match tcb.state {
			TcpState::SynRcvd => Error::ECONNREFUSED,
			TcpState::Closing | TcpState::LastAck | TcpState::TimeWait => {
				reset_connection(tcb, Error::ECONNRESET);
				post.push(PostAction::Unregister(self_id));
				return events;
			}
			_ => Error::ECONNRESET,
		};
		sticky_error = Some(reset_connection(tcb, error));
		events |= PollEvents::IN | PollEvents::OUT;
		if tcb.closed {
			post.push(PostAction::Unregister(self_id));
		}
		inner.error = sticky_error;
		return events;
	}

	// Step 4: SYN in the window is an error.
	if seg.flags.contains(TcpFlags::SYN) {
		output::send_rst_for(seg.src, seg.dst, seg.seq, seg.ack, seg.flags, seg_len);
		inner.error = Some(reset_connection(tcb, Error::ECONNRESET));
		events |= PollEvents::IN | PollEvents::OUT;
		return events;
	}

	// Step 5: ACK processing.
	if !seg.flags.contains(TcpFlags::ACK) {
		return events;
	}

	if tcb.state == TcpState::SynRcvd {
		if seq_gt(seg.ack, tcb.snd_una) && seq_le(seg.ack, tcb.snd_max) {
			tcb.state = TcpState::Established;
			tcb.cwnd = tcb.smss;
			became_connected = true;
			if let Some(parent) = inner.parent {
				post.push(PostAction::NotifyParent(parent, self_id));
			}
		} else {
			output::send_rst_for(seg.src, seg.dst, seg.seq, seg.ack, seg.flags, seg_len);
			return events;
		}
	}

	if seq_gt(seg.ack, tcb.snd_max) {
		// Acknowledgement of data we never sent.
		tcb.ack_now = true;
	} else if seq_gt(seg.ack, tcb.snd_una) {
		let acked = seg.ack.wrapping_sub(tcb.snd_una);

		if tcb.current_rtt >= 0 && seq_gt(seg.ack, tcb.timed_seq) {
			let sample = tcb.current_rtt;
			tcb.update_rtt(sample);
			tcb.current_rtt = -1;
		}

		let mut data_acked = acked as usize;
		if tcb.fin_sent && seq_gt(seg.ack, tcb.fin_seq) {
			data_acked -= 1;
		}
		tcb.snd_buf.drop_front(data_acked);
		tcb.snd_una = seg.ack;
		tcb.dupacks = 0;
		tcb.rtx_count = 0;
		tcb.backoff_shift = 0;

		if tcb.cwnd < tcb.ssthresh {
			tcb.cwnd = tcb.cwnd.saturating_add(tcb.smss);
		} else {
			let step = (tcb.smss.saturating_mul(tcb.smss) / tcb.cwnd.max(1)).max(1);
			tcb.cwnd = tcb.cwnd.saturating_add(step);
		}

		tcb.timers.rtx = if tcb.snd_una == tcb.snd_max {
			None
		} else {
			Some(time::now() + tcb.rto)
		};
		events |= PollEvents::OUT;

		if tcb.fin_sent && seq_gt(seg.ack, tcb.fin_seq) {
			match tcb.state {
				TcpState::FinWait1 => tcb.state = TcpState::FinWait2,
				TcpState::Closing => {
					tcb.state = TcpState::TimeWait;
					tcb.timers = Default::default();
					tcb.timers.timewait = Some(time::now() + TIME_WAIT_TICKS);
				}
				TcpState::LastAck => {
					reset_connection(tcb, Error::ECONNRESET);
					post.push(PostAction::Unregister(self_id));
					return events;
				}
				_ => {}
			}
		}
	} else if seg.ack == tcb.snd_una
		&& seg_len == 0
		&& tcb.snd_max != tcb.snd_una
		&& seg.wnd == tcb.snd_wnd
	{
		tcb.dupacks += 1;
		if tcb.dupacks == 3 {
			// Fast retransmit.
			let in_flight = tcb.in_flight();
			tcb.ssthresh = (in_flight / 2).max(2 * tcb.smss);
			tcb.cwnd = tcb.ssthresh;
			trace!("fast retransmit at {}", tcb.snd_una);
			output::retransmit_one(tcb, local, foreign);
			tcb.timers.rtx = Some(time::now() + tcb.rto);
		}
	}

	// Window update.
	if seq_lt(tcb.snd_wl1, seg.seq)
		|| (tcb.snd_wl1 == seg.seq && seq_le(tcb.snd_wl2, seg.ack))
	{
		tcb.snd_wnd = seg.wnd;
		tcb.snd_wl1 = seg.seq;
		tcb.snd_wl2 = seg.ack;
		if tcb.snd_wnd > tcb.max_wnd {
			tcb.max_wnd = tcb.snd_wnd;
		}
		if tcb.snd_wnd > 0 {
			tcb.timers.persist = None;
			tcb.persist_shift = 0;
			events |= PollEvents::OUT;
		}
	}

	// Step 7: payload.
	let payload_len = seg.payload.len();
	if payload_len > 0
		&& matches!(
			tcb.state,
			TcpState::Established | TcpState::FinWait1 | TcpState::FinWait2
		) {
		if seg.seq == tcb.rcv_nxt {
			let taken = tcb.rcv_buf.write(seg.payload.as_slice());
			tcb.rcv_nxt = tcb.rcv_nxt.wrapping_add(taken as u32);
			events |= PollEvents::IN;
			if taken < payload_len {
				// Out of buffer: ack what fit, the rest will come back.
				tcb.ack_now = true;
			} else if payload_len as u32 >= tcb.smss {
				tcb.delack_segs += 1;
				if tcb.delack_segs >= 2 {
					tcb.ack_now = true;
					tcb.delack_segs = 0;
				} else if tcb.timers.delack.is_none() {
					tcb.timers.delack = Some(time::now() + DELACK_TICKS);
				}
			} else if !tcb.ack_now && tcb.timers.delack.is_none() {
				tcb.timers.delack = Some(time::now() + DELACK_TICKS);
			}
		} else {
			// Out of order: immediate duplicate ACK, payload dropped.
			tcb.ack_now = true;
		}
	}

	// Step 8: FIN.
	if seg.flags.contains(TcpFlags::FIN) {
		let fin_seq = seg.seq.wrapping_add(payload_len as u32);
		if fin_seq == tcb.rcv_nxt
			&& matches!(
				tcb.state,
				TcpState::Established | TcpState::FinWait1 | TcpState::FinWait2
			) {
			tcb.rcv_nxt = tcb.rcv_nxt.wrapping_add(1);
			tcb.eof = true;
			tcb.ack_now = true;
			events |= PollEvents::IN;
			match tcb.state {
				TcpState::Established => tcb.state = TcpState::CloseWait,
				TcpState::FinWait1 => {
					// Our FIN was not yet acknowledged, else the ACK
					// branch above had moved us to FIN_WAIT_2.
					tcb.state = TcpState::Closing;
				}
				TcpState::FinWait2 => {
					tcb.state = TcpState::TimeWait;
					tcb.timers = Default::default();
					tcb.timers.timewait = Some(time::now() + TIME_WAIT_TICKS);
				}
				_ => {}
			}
		} else if tcb.state == TcpState::TimeWait {
			// Peer retransmitted its FIN: re-acknowledge, restart 2MSL.
			tcb.ack_now = true;
			tcb.timers.timewait = Some(time::now() + TIME_WAIT_TICKS);
		}
	}

	output::output_tcb(tcb, local, foreign);

	if became_connected {
		inner.connected = true;
	}
	events
}
