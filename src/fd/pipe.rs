//! In-kernel FIFO backing `pipe(2)`.
//!
//! End counts track open-file objects, not descriptors: `dup` and
//! `fork` share the open file and leave the counts alone; the counts
//! move only when an end is created or its open file is dropped.

use alloc::collections::VecDeque;
use alloc::sync::Arc;

use hermit_sync::SpinMutex;

use crate::io::{Error, Result};
use crate::synch::{CancelToken, CondVar, WaitOutcome};

/// Writes up to this size are atomic: they never interleave with
/// other writers and never land partially.
pub const PIPE_BUF: usize = 4096;

/// Ring capacity; at least `PIPE_BUF` so an atomic write can always
/// make progress once the pipe drains.
pub const PIPE_CAPACITY: usize = 16384;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeEnd {
	Read,
	Write,
}

struct PipeInner {
	buf: VecDeque<u8>,
	readers: usize,
	writers: usize,
}

pub struct Pipe {
	inner: SpinMutex<PipeInner>,
	/// Signaled when bytes are consumed (space for writers).
	space_cv: CondVar,
	/// Signaled when bytes arrive or the last writer leaves.
	data_cv: CondVar,
}

impl Pipe {
	/// A fresh pipe with one reader and one writer end.
	pub fn new() -> Arc<Self> {
		Arc::new(Self {
			inner: SpinMutex::new(PipeInner {
				buf: VecDeque::with_capacity(PIPE_CAPACITY),
				readers: 1,
				writers: 1,
			}),
			space_cv: CondVar::new(),
			data_cv: CondVar::new(),
		})
	}

	pub fn release_end(&self, end: PipeEnd) {
		let mut inner = self.inner.lock();
		match end {
			PipeEnd::Read => inner.readers = inner.readers.saturating_sub(1),
			PipeEnd::Write => inner.writers = inner.writers.saturating_sub(1),
		}
		drop(inner);
		// Blocked peers must notice the hang-up.
		self.space_cv.broadcast();
		self.data_cv.broadcast();
	}

	/// Block until data or EOF (writer count zero → return 0).
	pub fn read(
		&self,
		buf: &mut [u8],
		nonblocking: bool,
		cancel: Option<&CancelToken>,
	) -> Result<usize> {
		if buf.is_empty() {
			return Ok(0);
		}
		let mut guard = self.inner.lock();
		loop {
			if !guard.buf.is_empty() {
				let n = buf.len().min(guard.buf.len());
				for slot in buf[..n].iter_mut() {
					*slot = guard.buf.pop_front().expect("length checked above");
				}
				drop(guard);
				self.space_cv.broadcast();
				return Ok(n);
			}
			if guard.writers == 0 {
				return Ok(0);
			}
			if nonblocking {
				return Err(Error::EAGAIN);
			}
			let (g, outcome) = self.data_cv.wait(&self.inner, guard, None, cancel);
			guard = g;
			match outcome {
				WaitOutcome::Ready => {}
				WaitOutcome::Timeout => return Err(Error::EAGAIN),
				WaitOutcome::Cancelled => return Err(Error::EINTR),
			}
		}
	}

	/// Writes ≤ `PIPE_BUF` are all-or-nothing; larger writes may land
	/// in pieces. No reader left means `EPIPE`.
	pub fn write(
		&self,
		buf: &[u8],
		nonblocking: bool,
		cancel: Option<&CancelToken>,
	) -> Result<usize> {
		if buf.is_empty() {
			return Ok(0);
		}
		let atomic = buf.len() <= PIPE_BUF;
		let mut total = 0;
		let mut guard = self.inner.lock();
		loop {
			if guard.readers == 0 {
				return Err(Error::EPIPE);
			}
			let free = PIPE_CAPACITY - guard.buf.len();
			if atomic {
				if free >= buf.len() {
					guard.buf.extend(buf.iter().copied());
					drop(guard);
					self.data_cv.broadcast();
					return Ok(buf.len());
				}
			} else if free > 0 {
				let n = free.min(buf.len() - total);
				guard.buf.extend(buf[total..total + n].iter().copied());
				total += n;
				self.data_cv.broadcast();
				if total == buf.len() {
					return Ok(total);
				}
			}

			if nonblocking {
				return if total > 0 {
					Ok(total)
				} else {
					Err(Error::EAGAIN)
				};
			}
			let (g, outcome) = self.space_cv.wait(&self.inner, guard, None, cancel);
			guard = g;
			match outcome {
				WaitOutcome::Ready => {}
				WaitOutcome::Timeout => {
					return if total > 0 { Ok(total) } else { Err(Error::EAGAIN) };
				}
				WaitOutcome::Cancelled => {
					return if total > 0 { Ok(total) } else { Err(Error::EINTR) };
				}
			}
		}
	}

	/// Readiness for `select`: readable on data or EOF, writable on
	/// space or missing readers (the write would fail fast).
	pub fn poll(&self, end: PipeEnd) -> (bool, bool) {
		let inner = self.inner.lock();
		match end {
			PipeEnd::Read => (!inner.buf.is_empty() || inner.writers == 0, false),
			PipeEnd::Write => (false, inner.buf.len() < PIPE_CAPACITY || inner.readers == 0),
		}
	}
}
