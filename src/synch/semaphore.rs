use alloc::collections::VecDeque;
use alloc::sync::Arc;

use hermit_sync::SpinMutex;

use super::{CancelToken, WaitOutcome, Waiter};

struct SemaphoreState {
	/// Resource available count
	count: isize,
	/// FIFO queue of parked waiters
	queue: VecDeque<Arc<Waiter>>,
}

/// A counting, blocking semaphore.
///
/// Access is granted while the counter is positive. `down` blocks the
/// calling thread until a unit is available, the optional deadline
/// passes, or the optional token is cancelled; `up` hands a unit to the
/// oldest waiter or, with no waiter queued, increments the counter.
pub struct Semaphore {
	state: SpinMutex<SemaphoreState>,
}

impl Semaphore {
	/// Creates a new semaphore with the given initial count. A negative
	/// count is valid and means `-count` extra `up` calls are needed
	/// before the first `down` can pass.
	pub const fn new(count: isize) -> Self {
		Self {
			state: SpinMutex::new(SemaphoreState {
				count,
				queue: VecDeque::new(),
			}),
		}
	}

	/// Acquire one unit.
	///
	/// `deadline` is an absolute tick count; `None` waits forever.
	pub fn down(&self, deadline: Option<u64>, cancel: Option<&CancelToken>) -> WaitOutcome {
		let waiter = {
			let mut state = self.state.lock();
			if state.count > 0 {
				state.count -= 1;
				return WaitOutcome::Ready;
			}
			let waiter = Waiter::new();
			state.queue.push_back(waiter.clone());
			waiter
		};

		let outcome = waiter.park(deadline, cancel);
		if outcome == WaitOutcome::Ready {
			return outcome;
		}

		// Lost the race to `up` while giving up? The unit was already
		// consumed on our behalf, so report success.
		let mut state = self.state.lock();
		if waiter.is_signaled() {
			return WaitOutcome::Ready;
		}
		state.queue.retain(|w| !Arc::ptr_eq(w, &waiter));
		outcome
	}

	/// Acquire one unit without blocking.
	pub fn try_down(&self) -> bool {
		let mut state = self.state.lock();
		if state.count > 0 {
			state.count -= 1;
			true
		} else {
			false
		}
	}

	/// Release one unit, waking the oldest waiter if any.
	pub fn up(&self) {
		let mut state = self.state.lock();
		if let Some(waiter) = state.queue.pop_front() {
			waiter.signal();
		} else {
			state.count += 1;
		}
	}
}

impl Default for Semaphore {
	fn default() -> Self {
		Self::new(0)
	}
}
