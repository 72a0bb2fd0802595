//! Synchronization primitives.
//!
//! Spinlocks come from `hermit-sync`. On top of those this module adds
//! the two blocking primitives the core needs: a counting [`Semaphore`]
//! with a FIFO waiter queue and a [`CondVar`] paired with a `SpinMutex`.
//! Both support deadlines (absolute tick counts) and cooperative
//! cancellation; a finished wait reports one of three
//! [`WaitOutcome`]s, so callers can tell a timeout from a cancellation
//! without inspecting shared state.
//!
//! Scheduling is outside this crate, so a blocked thread parks by
//! spinning with exponential backoff rather than by a scheduler call.

pub use hermit_sync::{Lazy, OnceCell, RwSpinLock, SpinMutex, SpinMutexGuard, TicketMutex};

mod condvar;
mod semaphore;

pub use condvar::CondVar;
pub use semaphore::Semaphore;

use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crossbeam_utils::Backoff;

/// Result of a blocking wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
	/// The waited-for event occurred.
	Ready,
	/// The deadline passed first.
	Timeout,
	/// The wait was cancelled through its [`CancelToken`].
	Cancelled,
}

/// Cooperative cancellation handle for blocking operations.
///
/// Cloning yields another handle to the same flag. Cancellation is
/// sticky: once set, every wait carrying the token returns
/// [`WaitOutcome::Cancelled`].
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
	flag: Arc<AtomicBool>,
}

impl CancelToken {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn cancel(&self) {
		self.flag.store(true, Ordering::Release);
	}

	pub fn is_cancelled(&self) -> bool {
		self.flag.load(Ordering::Acquire)
	}
}

const WAITING: u32 = 0;
const SIGNALED: u32 = 1;

/// One parked thread. Queued in a semaphore or condition variable and
/// flipped to `SIGNALED` by the waker.
#[derive(Debug)]
pub(crate) struct Waiter {
	state: AtomicU32,
}

impl Waiter {
	pub(crate) fn new() -> Arc<Self> {
		Arc::new(Self {
			state: AtomicU32::new(WAITING),
		})
	}

	pub(crate) fn signal(&self) {
		self.state.store(SIGNALED, Ordering::Release);
	}

	pub(crate) fn is_signaled(&self) -> bool {
		self.state.load(Ordering::Acquire) == SIGNALED
	}

	/// Park until signaled, past `deadline`, or cancelled.
	pub(crate) fn park(&self, deadline: Option<u64>, cancel: Option<&CancelToken>) -> WaitOutcome {
		let backoff = Backoff::new();
		loop {
			if self.is_signaled() {
				return WaitOutcome::Ready;
			}
			if let Some(token) = cancel {
				if token.is_cancelled() {
					return WaitOutcome::Cancelled;
				}
			}
			if let Some(deadline) = deadline {
				if crate::time::now() >= deadline {
					return WaitOutcome::Timeout;
				}
			}
			backoff.snooze();
		}
	}
}
