//! The four TCP timers, driven from the global tick.
//!
//! Timers take the same locks as the user paths: each socket is locked
//! once per tick, expired timers are handled inline, and any wakeups
//! happen before the lock is released.

use crate::io::Error;
use crate::net::socket::{self, wake, PollEvents, Proto, SockKind};
use crate::net::tcp::output;
use crate::net::tcp::tcb::{
	TcpState, RTO_MAX, RTO_MAX_BACKOFF, RTO_SYN_MAX, TCP_MAX_DATA_RETRIES, TCP_MAX_SYN_RETRIES,
};
use crate::time;

fn due(slot: Option<u64>, now: u64) -> bool {
	slot.is_some_and(|t| now >= t)
}

pub(crate) fn tick() {
	let now = time::now();
	for sock in socket::all_sockets() {
		if sock.kind != SockKind::Stream {
			continue;
		}
		let mut unregister = false;
		{
			let mut inner = sock.inner.lock();
			let local = inner.local;
			let foreign = inner.foreign;
			let mut events = PollEvents::empty();
			let mut sticky = None;

			let Proto::Tcp(tcb) = &mut inner.proto else {
				continue;
			};

			// The segment being timed ages by one tick.
			if tcb.current_rtt >= 0 {
				tcb.current_rtt += 1;
			}

			if due(tcb.timers.rtx, now) {
				tcb.timers.rtx = None;
				tcb.rtx_count += 1;
				let syn_phase = matches!(tcb.state, TcpState::SynSent | TcpState::SynRcvd);
				let retry_limit = if syn_phase {
					TCP_MAX_SYN_RETRIES
				} else {
					TCP_MAX_DATA_RETRIES
				};
				if tcb.rtx_count > retry_limit {
					debug!("{} -> {}: retry budget exhausted, aborting", local, foreign);
					sticky = Some(Error::ETIMEDOUT);
					tcb.state = TcpState::Closed;
					tcb.timers = Default::default();
					tcb.current_rtt = -1;
					events |= PollEvents::IN | PollEvents::OUT;
					if tcb.closed {
						unregister = true;
					}
				} else {
					tcb.ssthresh = (tcb.cwnd / 2).max(2 * tcb.smss);
					tcb.cwnd = tcb.smss;
					if tcb.backoff_shift < RTO_MAX_BACKOFF {
						tcb.backoff_shift += 1;
						let ceiling = if syn_phase { RTO_SYN_MAX } else { RTO_MAX };
						tcb.rto = (tcb.rto * 2).min(ceiling);
					}
					trace!(
						"{} -> {}: retransmit #{}, rto {} ticks",
						local,
						foreign,
						tcb.rtx_count,
						tcb.rto
					);
					output::retransmit_one(tcb, local, foreign);
					tcb.timers.rtx = Some(now + tcb.rto);
				}
			}

			if due(tcb.timers.delack, now) {
				tcb.timers.delack = None;
				output::send_ack(tcb, local, foreign);
			}

			if due(tcb.timers.persist, now) {
				output::send_probe(tcb, local, foreign);
				if tcb.persist_shift < RTO_MAX_BACKOFF {
					tcb.persist_shift += 1;
				}
				tcb.timers.persist = Some(now + (tcb.rto << tcb.persist_shift).min(RTO_MAX));
			}

			if due(tcb.timers.timewait, now) {
				trace!("{} -> {}: 2msl elapsed, releasing", local, foreign);
				tcb.state = TcpState::Closed;
				tcb.timers = Default::default();
				events |= PollEvents::IN | PollEvents::OUT;
				unregister = true;
			}

			if sticky.is_some() {
				inner.error = sticky;
			}
			if !events.is_empty() {
				wake(&sock, &mut inner, events);
			}
		}
		if unregister {
			socket::unregister(sock.id);
		}
	}
}
