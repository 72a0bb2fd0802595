//! Global tick counter and tick arithmetic.
//!
//! The kernel runs a single 100 Hz clock. All protocol timers (TCP
//! retransmission, ARP re-requests, work-queue expiry) are expressed as
//! absolute tick values against this counter; nothing in the core ever
//! consults a wall clock.

use core::sync::atomic::{AtomicU64, Ordering};

/// Timer interrupt frequency in Hz.
pub const TICK_HZ: u64 = 100;

/// Milliseconds per tick.
pub const MS_PER_TICK: u64 = 1000 / TICK_HZ;

static CLOCK: AtomicU64 = AtomicU64::new(0);

/// `timeval` as the C library hands it to `select` and `setsockopt`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TimeVal {
	pub tv_sec: i64,
	pub tv_usec: i64,
}

impl TimeVal {
	pub const fn new(tv_sec: i64, tv_usec: i64) -> Self {
		Self { tv_sec, tv_usec }
	}

	/// Convert to a tick count, saturating instead of overflowing.
	///
	/// Sub-tick remainders round up so that a positive timeout never
	/// becomes a zero-tick (busy) wait.
	pub fn to_ticks(self) -> Option<u64> {
		if self.tv_sec < 0 || self.tv_usec < 0 {
			return None;
		}
		let from_sec = (self.tv_sec as u64).saturating_mul(TICK_HZ);
		let usec_per_tick = 1_000_000 / TICK_HZ;
		let from_usec = (self.tv_usec as u64).div_ceil(usec_per_tick);
		Some(from_sec.saturating_add(from_usec))
	}
}

/// Current tick count since boot.
pub fn now() -> u64 {
	CLOCK.load(Ordering::Acquire)
}

/// Advance the clock by one tick. Called from the timer interrupt path.
pub(crate) fn tick() {
	CLOCK.fetch_add(1, Ordering::AcqRel);
}

/// Convert a millisecond count to ticks, rounding up.
pub fn ms_to_ticks(ms: u64) -> u64 {
	ms.div_ceil(MS_PER_TICK)
}
