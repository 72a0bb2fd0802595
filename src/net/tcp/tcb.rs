//! Transmission control block: per-connection state, sequence-space
//! arithmetic and the RTT estimator.

use alloc::boxed::Box;
use alloc::collections::VecDeque;

use crate::net::socket::{PollEvents, SockAddr, SocketId};
use crate::time;

// ── Protocol constants ──────────────────────────────────────────────────

/// Send buffer capacity per connection.
pub(crate) const TCP_SND_BUF: usize = 65536;
/// Receive buffer capacity per connection.
pub(crate) const TCP_RCV_BUF: usize = 8192;
/// Listen queue depth when `listen(0)` is called.
pub(crate) const TCP_DEFAULT_BACKLOG: usize = 15;
/// MSS assumed when the peer offers none (RFC 1122).
pub(crate) const TCP_DEFAULT_MSS: u32 = 536;

/// Initial and minimum retransmission timeout: 1 s.
pub(crate) const RTO_MIN: u64 = 1000 / time::MS_PER_TICK;
/// Retransmission timeout ceiling for data: 120 s.
pub(crate) const RTO_MAX: u64 = 120_000 / time::MS_PER_TICK;
/// Retransmission timeout ceiling while connecting: 600 s.
pub(crate) const RTO_SYN_MAX: u64 = 600_000 / time::MS_PER_TICK;
/// Backoff doublings are capped here.
pub(crate) const RTO_MAX_BACKOFF: u32 = 10;
/// Data retransmissions before the connection is reset.
pub(crate) const TCP_MAX_DATA_RETRIES: u32 = 5;
/// SYN retransmissions before the attempt is abandoned.
pub(crate) const TCP_MAX_SYN_RETRIES: u32 = 5;

/// Maximum segment lifetime: 30 s. TIME-WAIT holds 2·MSL.
pub(crate) const MSL_TICKS: u64 = 30_000 / time::MS_PER_TICK;
pub(crate) const TIME_WAIT_TICKS: u64 = 2 * MSL_TICKS;
/// Delayed-ACK latency: one tick.
pub(crate) const DELACK_TICKS: u64 = 1;

/// Initial slow-start threshold.
pub(crate) const SSTHRESH_INIT: u32 = 65536;

// ── Sequence-space arithmetic (signed 32-bit delta) ─────────────────────

pub(crate) fn seq_lt(a: u32, b: u32) -> bool {
	(a.wrapping_sub(b) as i32) < 0
}

pub(crate) fn seq_le(a: u32, b: u32) -> bool {
	(a.wrapping_sub(b) as i32) <= 0
}

pub(crate) fn seq_gt(a: u32, b: u32) -> bool {
	(a.wrapping_sub(b) as i32) > 0
}

pub(crate) fn seq_ge(a: u32, b: u32) -> bool {
	(a.wrapping_sub(b) as i32) >= 0
}

/// Initial sequence number: time-driven with a per-tuple offset, so
/// successive connections on the same tuple get monotone ISNs.
pub(crate) fn generate_isn(local: SockAddr, foreign: SockAddr) -> u32 {
	let mut hash: u32 = 0x811c_9dc5;
	let mut mix = |byte: u8| {
		hash ^= u32::from(byte);
		hash = hash.wrapping_mul(0x0100_0193);
	};
	for byte in local.addr.octets() {
		mix(byte);
	}
	for byte in local.port.to_be_bytes() {
		mix(byte);
	}
	for byte in foreign.addr.octets() {
		mix(byte);
	}
	for byte in foreign.port.to_be_bytes() {
		mix(byte);
	}
	hash.wrapping_add((time::now() as u32) << 7)
}

// ── Ring buffers ────────────────────────────────────────────────────────

/// Fixed-capacity byte ring. The send buffer keeps unacknowledged data
/// addressable by offset (the implicit retransmit queue); the receive
/// buffer is a plain FIFO.
pub(crate) struct RingBuffer {
	buf: Box<[u8]>,
	head: usize,
	len: usize,
}

impl RingBuffer {
	pub(crate) fn new(capacity: usize) -> Self {
		Self {
			buf: vec![0; capacity].into_boxed_slice(),
			head: 0,
			len: 0,
		}
	}

	pub(crate) fn capacity(&self) -> usize {
		self.buf.len()
	}

	pub(crate) fn len(&self) -> usize {
		self.len
	}

	pub(crate) fn free(&self) -> usize {
		self.buf.len() - self.len
	}

	pub(crate) fn is_empty(&self) -> bool {
		self.len == 0
	}

	/// Append as much of `data` as fits; returns the amount taken.
	pub(crate) fn write(&mut self, data: &[u8]) -> usize {
		let n = data.len().min(self.free());
		let cap = self.buf.len();
		let mut at = (self.head + self.len) % cap;
		for &byte in &data[..n] {
			self.buf[at] = byte;
			at = (at + 1) % cap;
		}
		self.len += n;
		n
	}

	/// Consume up to `out.len()` bytes from the front.
	pub(crate) fn read(&mut self, out: &mut [u8]) -> usize {
		let n = self.peek(0, out);
		self.drop_front(n);
		n
	}

	/// Copy without consuming, starting `offset` bytes past the front.
	/// This is the retransmission view into unacknowledged data.
	pub(crate) fn peek(&self, offset: usize, out: &mut [u8]) -> usize {
		if offset >= self.len {
			return 0;
		}
		let n = out.len().min(self.len - offset);
		let cap = self.buf.len();
		for (i, slot) in out[..n].iter_mut().enumerate() {
			*slot = self.buf[(self.head + offset + i) % cap];
		}
		n
	}

	/// Release `n` acknowledged bytes from the front.
	pub(crate) fn drop_front(&mut self, n: usize) {
		let n = n.min(self.len);
		self.head = (self.head + n) % self.buf.len();
		self.len -= n;
	}
}

// ── Connection state ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
	Closed,
	Listen,
	SynSent,
	SynRcvd,
	Established,
	CloseWait,
	FinWait1,
	FinWait2,
	Closing,
	LastAck,
	TimeWait,
}

/// The four per-connection timers, as absolute expiry ticks.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct TcpTimers {
	pub rtx: Option<u64>,
	pub delack: Option<u64>,
	pub persist: Option<u64>,
	pub timewait: Option<u64>,
}

pub(crate) struct Tcb {
	pub state: TcpState,

	// Listener side.
	pub backlog: usize,
	pub pending: VecDeque<SocketId>,
	pub ready_children: usize,

	// Send sequence space.
	pub iss: u32,
	pub snd_una: u32,
	pub snd_nxt: u32,
	pub snd_max: u32,
	pub snd_wnd: u32,
	pub snd_wl1: u32,
	pub snd_wl2: u32,

	// Receive sequence space.
	pub irs: u32,
	pub rcv_nxt: u32,
	/// Right window edge last advertised; never moves left.
	pub rcv_adv: u32,
	/// Largest window the peer ever advertised.
	pub max_wnd: u32,

	// Congestion control.
	pub cwnd: u32,
	pub ssthresh: u32,
	pub smss: u32,
	pub rmss: u32,

	// RTT estimation, SRTT/RTTVAR stored left-shifted by 3 (tick/8).
	pub srtt: i64,
	pub rttvar: i64,
	pub rto: u64,
	pub timed_seq: u32,
	/// Ticks the timed segment has been in flight; −1 when idle.
	pub current_rtt: i64,
	pub first_rtt_done: bool,

	// Loss handling.
	pub dupacks: u32,
	pub rtx_count: u32,
	pub backoff_shift: u32,
	pub persist_shift: u32,

	// FIN bookkeeping.
	pub fin_pending: bool,
	pub fin_sent: bool,
	pub fin_seq: u32,

	// Receive-side status.
	pub eof: bool,
	pub rd_shutdown: bool,

	pub snd_buf: RingBuffer,
	pub rcv_buf: RingBuffer,
	pub timers: TcpTimers,

	/// ACK owed to the peer; sent by the next output pass or the
	/// delayed-ACK timer.
	pub ack_now: bool,
	/// In-order full-MSS segments since the last ACK.
	pub delack_segs: u32,

	/// The owning descriptor was closed.
	pub closed: bool,
}

impl Tcb {
	pub(crate) fn new() -> Self {
		Self {
			state: TcpState::Closed,
			backlog: 0,
			pending: VecDeque::new(),
			ready_children: 0,
			iss: 0,
			snd_una: 0,
			snd_nxt: 0,
			snd_max: 0,
			snd_wnd: 0,
			snd_wl1: 0,
			snd_wl2: 0,
			irs: 0,
			rcv_nxt: 0,
			rcv_adv: 0,
			max_wnd: 0,
			cwnd: TCP_DEFAULT_MSS,
			ssthresh: SSTHRESH_INIT,
			smss: TCP_DEFAULT_MSS,
			rmss: TCP_DEFAULT_MSS,
			srtt: 0,
			rttvar: 0,
			rto: RTO_MIN,
			timed_seq: 0,
			current_rtt: -1,
			first_rtt_done: false,
			dupacks: 0,
			rtx_count: 0,
			backoff_shift: 0,
			persist_shift: 0,
			fin_pending: false,
			fin_sent: false,
			fin_seq: 0,
			eof: false,
			rd_shutdown: false,
			snd_buf: RingBuffer::new(TCP_SND_BUF),
			rcv_buf: RingBuffer::new(TCP_RCV_BUF),
			timers: TcpTimers::default(),
			ack_now: false,
			delack_segs: 0,
			closed: false,
		}
	}

	/// Unacknowledged bytes in flight.
	pub(crate) fn in_flight(&self) -> u32 {
		self.snd_nxt.wrapping_sub(self.snd_una)
	}

	/// Effective send window: the smaller of the peer's window and the
	/// congestion window.
	pub(crate) fn send_window(&self) -> u32 {
		self.snd_wnd.min(self.cwnd)
	}

	/// Take an RTT sample (in ticks) per RFC 6298, with SRTT and RTTVAR
	/// kept in eighth-tick fixed point.
	pub(crate) fn update_rtt(&mut self, sample: i64) {
		if self.first_rtt_done {
			let delta = sample - (self.srtt >> 3);
			self.srtt = (self.srtt + delta).max(1);
			self.rttvar = (self.rttvar - (self.rttvar >> 2) + 2 * delta.abs()).max(1);
		} else {
			self.srtt = sample << 3;
			self.rttvar = sample << 2;
			self.first_rtt_done = true;
		}
		let rto = (self.srtt >> 3) + (self.rttvar >> 1).max(1);
		self.rto = (rto as u64).clamp(RTO_MIN, RTO_MAX);
	}

	/// The window to advertise: free receive space, but the right edge
	/// never retreats.
	pub(crate) fn advertised_window(&mut self) -> u16 {
		let edge = self.rcv_nxt.wrapping_add(self.rcv_buf.free() as u32);
		if seq_gt(edge, self.rcv_adv) {
			self.rcv_adv = edge;
		}
		self.rcv_adv.wrapping_sub(self.rcv_nxt).min(65535) as u16
	}

	/// Immediate readiness for `select`.
	pub(crate) fn poll_ready(&self) -> PollEvents {
		let mut ready = PollEvents::empty();
		match self.state {
			TcpState::Listen => {
				if self.ready_children > 0 {
					ready |= PollEvents::IN;
				}
			}
			TcpState::Closed => {
				ready |= PollEvents::IN | PollEvents::OUT;
			}
			_ => {
				if !self.rcv_buf.is_empty() || self.eof || self.rd_shutdown {
					ready |= PollEvents::IN;
				}
				if matches!(self.state, TcpState::Established | TcpState::CloseWait)
					&& !self.fin_pending
					&& self.snd_buf.free() > 0
				{
					ready |= PollEvents::OUT;
				}
			}
		}
		ready
	}
}
