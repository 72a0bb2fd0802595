use alloc::collections::VecDeque;
use alloc::sync::Arc;

use hermit_sync::{SpinMutex, SpinMutexGuard};

use super::{CancelToken, WaitOutcome, Waiter};

/// Condition variable paired with a [`SpinMutex`].
///
/// `wait` enqueues the caller and releases the guard in one step, so a
/// `broadcast` between the release and the park cannot be lost. The
/// caller gets the lock back in every outcome.
pub struct CondVar {
	waiters: SpinMutex<VecDeque<Arc<Waiter>>>,
}

impl CondVar {
	pub const fn new() -> Self {
		Self {
			waiters: SpinMutex::new(VecDeque::new()),
		}
	}

	/// Atomically release `guard` and block until a broadcast, the
	/// absolute tick `deadline`, or cancellation. Relocks `mutex`
	/// before returning.
	pub fn wait<'a, T>(
		&self,
		mutex: &'a SpinMutex<T>,
		guard: SpinMutexGuard<'a, T>,
		deadline: Option<u64>,
		cancel: Option<&CancelToken>,
	) -> (SpinMutexGuard<'a, T>, WaitOutcome) {
		let waiter = Waiter::new();
		self.waiters.lock().push_back(waiter.clone());
		drop(guard);

		let mut outcome = waiter.park(deadline, cancel);
		if outcome != WaitOutcome::Ready {
			let mut waiters = self.waiters.lock();
			if waiter.is_signaled() {
				outcome = WaitOutcome::Ready;
			} else {
				waiters.retain(|w| !Arc::ptr_eq(w, &waiter));
			}
		}

		(mutex.lock(), outcome)
	}

	/// Wake every current waiter.
	pub fn broadcast(&self) {
		let mut waiters = self.waiters.lock();
		while let Some(waiter) = waiters.pop_front() {
			waiter.signal();
		}
	}

	/// Wake the oldest waiter, if any.
	pub fn notify_one(&self) {
		if let Some(waiter) = self.waiters.lock().pop_front() {
			waiter.signal();
		}
	}
}

impl Default for CondVar {
	fn default() -> Self {
		Self::new()
	}
}
