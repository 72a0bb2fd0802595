//! TCP segment construction and the send-side engine.
//!
//! The retransmit queue is implicit: the send buffer keeps every byte
//! between `SND.UNA` and the newest write, addressable by offset, so a
//! retransmission is a `peek` at offset zero.

use crate::io::Result;
use crate::net::ip;
use crate::net::netmsg::NetMsg;
use crate::net::socket::{Proto, SockAddr, SocketInner};
use crate::net::tcp::tcb::{seq_ge, seq_gt, Tcb, TcpState};
use crate::net::wire::{pseudo_header, Checksum, IpProto, TcpFlags, TcpHeader};
use crate::time;

/// Put one segment on the wire.
pub(crate) fn transmit(
	src: SockAddr,
	dst: SockAddr,
	seq: u32,
	ack: u32,
	flags: TcpFlags,
	window: u16,
	mss: Option<u16>,
	payload: &[u8],
) -> Result<()> {
	let header = TcpHeader {
		src_port: src.port,
		dst_port: dst.port,
		seq,
		ack,
		data_off: 20 + if mss.is_some() { 4 } else { 0 },
		flags,
		window,
		checksum: 0,
		urgent: 0,
		mss,
	};
	let header_len = header.encoded_len();

	let mut msg = NetMsg::new(payload.len());
	msg.append(payload.len())?.copy_from_slice(payload);
	header.encode(msg.prepend(header_len)?);
	msg.tcp_hdr = Some(msg.start_offset());

	let seg_len = (header_len + payload.len()) as u16;
	let mut csum = Checksum::new();
	csum.add_bytes(&pseudo_header(src.addr, dst.addr, IpProto::Tcp, seg_len));
	csum.add_bytes(msg.as_slice());
	let csum = csum.finish();
	msg.as_mut_slice()[16..18].copy_from_slice(&csum.to_be_bytes());

	ip::send(msg, Some(src.addr), dst.addr, IpProto::Tcp, true)
}

/// Answer a segment that reached no connection (RFC 793 RST rules).
pub(crate) fn send_rst_for(src: SockAddr, dst: SockAddr, seq: u32, ack: u32, flags: TcpFlags, seg_len: u32) {
	let result = if flags.contains(TcpFlags::ACK) {
		transmit(dst, src, ack, 0, TcpFlags::RST, 0, None, &[])
	} else {
		transmit(
			dst,
			src,
			0,
			seq.wrapping_add(seg_len),
			TcpFlags::RST | TcpFlags::ACK,
			0,
			None,
			&[],
		)
	};
	if let Err(err) = result {
		debug!("rst tx failed: {}", err);
	}
}

/// Pure ACK, clearing any delayed-ACK obligation.
pub(crate) fn send_ack(tcb: &mut Tcb, local: SockAddr, foreign: SockAddr) {
	let window = tcb.advertised_window();
	let result = transmit(
		local,
		foreign,
		tcb.snd_nxt,
		tcb.rcv_nxt,
		TcpFlags::ACK,
		window,
		None,
		&[],
	);
	if let Err(err) = result {
		debug!("ack tx failed: {}", err);
	}
	tcb.ack_now = false;
	tcb.timers.delack = None;
	tcb.delack_segs = 0;
}

/// The initial SYN of an active open.
pub(crate) fn send_syn(tcb: &mut Tcb, local: SockAddr, foreign: SockAddr) {
	let window = tcb.advertised_window();
	let result = transmit(
		local,
		foreign,
		tcb.iss,
		0,
		TcpFlags::SYN,
		window,
		Some(tcb.rmss as u16),
		&[],
	);
	if let Err(err) = result {
		debug!("syn tx failed: {}", err);
	}
}

/// SYN-ACK of a passive open.
pub(crate) fn send_syn_ack(tcb: &mut Tcb, local: SockAddr, foreign: SockAddr) {
	let window = tcb.advertised_window();
	let result = transmit(
		local,
		foreign,
		tcb.iss,
		tcb.rcv_nxt,
		TcpFlags::SYN | TcpFlags::ACK,
		window,
		Some(tcb.rmss as u16),
		&[],
	);
	if let Err(err) = result {
		debug!("syn-ack tx failed: {}", err);
	}
}

/// Dispatcher for call sites holding the socket lock.
pub(crate) fn output(inner: &mut SocketInner) {
	let local = inner.local;
	let foreign = inner.foreign;
	if let Proto::Tcp(tcb) = &mut inner.proto {
		output_tcb(tcb, local, foreign);
	}
}

/// Push as much buffered data as the effective window allows, then a
/// FIN once the buffer drains, then any owed ACK.
pub(crate) fn output_tcb(tcb: &mut Tcb, local: SockAddr, foreign: SockAddr) {
	let data_state = matches!(
		tcb.state,
		TcpState::Established
			| TcpState::CloseWait
			| TcpState::FinWait1
			| TcpState::Closing
			| TcpState::LastAck
	);
	if !data_state {
		if tcb.ack_now {
			send_ack(tcb, local, foreign);
		}
		return;
	}

	let now = time::now();
	loop {
		let fin_in_flight = u32::from(tcb.fin_sent && seq_gt(tcb.snd_nxt, tcb.fin_seq));
		// An unacknowledged SYN can still occupy sequence space here
		// (close during the handshake), hence the saturation.
		let sent_unacked = tcb.in_flight() - fin_in_flight;
		let unsent = (tcb.snd_buf.len() as u32).saturating_sub(sent_unacked);
		if unsent == 0 || tcb.fin_sent {
			break;
		}

		let window = tcb.send_window();
		if tcb.in_flight() >= window {
			if tcb.snd_wnd == 0 && tcb.timers.persist.is_none() {
				// Zero window: probe instead of retransmit.
				tcb.timers.rtx = None;
				tcb.timers.persist = Some(now + tcb.rto);
			}
			break;
		}

		let n = unsent.min(tcb.smss).min(window - tcb.in_flight()) as usize;
		if n == 0 {
			break;
		}
		let mut payload = vec![0u8; n];
		tcb.snd_buf.peek(sent_unacked as usize, &mut payload);

		let mut flags = TcpFlags::ACK;
		if n as u32 == unsent {
			flags |= TcpFlags::PSH;
		}
		let window_adv = tcb.advertised_window();
		let result = transmit(
			local,
			foreign,
			tcb.snd_nxt,
			tcb.rcv_nxt,
			flags,
			window_adv,
			None,
			&payload,
		);
		if let Err(err) = result {
			debug!("segment tx failed: {}", err);
			break;
		}

		// Time the segment unless another one is already being timed
		// or this is old data (Karn's rule lives in the retransmit
		// path, which never starts a timing).
		if tcb.current_rtt < 0 && seq_ge(tcb.snd_nxt, tcb.snd_max) {
			tcb.timed_seq = tcb.snd_nxt;
			tcb.current_rtt = 0;
		}

		tcb.snd_nxt = tcb.snd_nxt.wrapping_add(n as u32);
		if seq_gt(tcb.snd_nxt, tcb.snd_max) {
			tcb.snd_max = tcb.snd_nxt;
		}
		if tcb.timers.rtx.is_none() {
			tcb.timers.rtx = Some(now + tcb.rto);
		}
		tcb.ack_now = false;
		tcb.timers.delack = None;
		tcb.delack_segs = 0;
	}

	// FIN goes out once every data byte has been sent.
	let fin_due = tcb.fin_pending
		&& !tcb.fin_sent
		&& tcb.snd_buf.len() as u32 == tcb.in_flight();
	if fin_due {
		let window_adv = tcb.advertised_window();
		let result = transmit(
			local,
			foreign,
			tcb.snd_nxt,
			tcb.rcv_nxt,
			TcpFlags::FIN | TcpFlags::ACK,
			window_adv,
			None,
			&[],
		);
		match result {
			Ok(()) => {
				tcb.fin_seq = tcb.snd_nxt;
				tcb.fin_sent = true;
				tcb.snd_nxt = tcb.snd_nxt.wrapping_add(1);
				if seq_gt(tcb.snd_nxt, tcb.snd_max) {
					tcb.snd_max = tcb.snd_nxt;
				}
				if tcb.timers.rtx.is_none() {
					tcb.timers.rtx = Some(now + tcb.rto);
				}
				tcb.ack_now = false;
			}
			Err(err) => debug!("fin tx failed: {}", err),
		}
	}

	if tcb.ack_now {
		send_ack(tcb, local, foreign);
	}
}

/// Resend the oldest unacknowledged segment. Never takes an RTT
/// sample (Karn's rule).
pub(crate) fn retransmit_one(tcb: &mut Tcb, local: SockAddr, foreign: SockAddr) {
	tcb.current_rtt = -1;
	match tcb.state {
		TcpState::SynSent => send_syn(tcb, local, foreign),
		TcpState::SynRcvd => send_syn_ack(tcb, local, foreign),
		_ => {
			let fin_in_flight = tcb.fin_sent && seq_gt(tcb.snd_nxt, tcb.fin_seq);
			let sent_unacked = tcb.in_flight() - u32::from(fin_in_flight);
			let data_resend = sent_unacked
				.min(tcb.smss)
				.min(tcb.snd_buf.len() as u32) as usize;
			if data_resend > 0 {
				let mut payload = vec![0u8; data_resend];
				tcb.snd_buf.peek(0, &mut payload);
				let window_adv = tcb.advertised_window();
				let result = transmit(
					local,
					foreign,
					tcb.snd_una,
					tcb.rcv_nxt,
					TcpFlags::ACK | TcpFlags::PSH,
					window_adv,
					None,
					&payload,
				);
				if let Err(err) = result {
					debug!("retransmit tx failed: {}", err);
				}
			} else if fin_in_flight {
				let window_adv = tcb.advertised_window();
				let result = transmit(
					local,
					foreign,
					tcb.fin_seq,
					tcb.rcv_nxt,
					TcpFlags::FIN | TcpFlags::ACK,
					window_adv,
					None,
					&[],
				);
				if let Err(err) = result {
					debug!("fin retransmit tx failed: {}", err);
				}
			}
		}
	}
}

/// Zero-window probe: one byte past the closed window. `snd_nxt` does
/// not advance; the byte travels again in the regular path when the
/// window opens.
pub(crate) fn send_probe(tcb: &mut Tcb, local: SockAddr, foreign: SockAddr) {
	let fin_in_flight = u32::from(tcb.fin_sent && seq_gt(tcb.snd_nxt, tcb.fin_seq));
	let sent_unacked = (tcb.in_flight() - fin_in_flight) as usize;
	if tcb.snd_buf.len() <= sent_unacked {
		return;
	}
	let mut probe = [0u8; 1];
	if tcb.snd_buf.peek(sent_unacked, &mut probe) != 1 {
		return;
	}
	let window_adv = tcb.advertised_window();
	let result = transmit(
		local,
		foreign,
		tcb.snd_nxt,
		tcb.rcv_nxt,
		TcpFlags::ACK,
		window_adv,
		None,
		&probe,
	);
	if let Err(err) = result {
		debug!("window probe tx failed: {}", err);
	}
}
