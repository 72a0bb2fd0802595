//! Deferred-work queues.
//!
//! A [`WorkQueue`] is a bounded ring of `(handler, arg, expiry)`
//! records. Work is inserted with [`WorkQueue::schedule`] and executed
//! by [`WorkQueue::trigger`], which runs every entry whose expiry tick
//! has been reached. The timer path calls [`tick`], which re-triggers
//! all registered queues — this is how the loopback TX path and other
//! NIC-bound work get off the caller's stack without ever blocking.

use hermit_sync::SpinMutex;
use smallvec::SmallVec;

use crate::io::{Error, Result};
use crate::time;

/// Ring capacity of one work queue.
pub const WORK_QUEUE_SIZE: usize = 64;

pub type WorkHandler = fn(usize);

#[derive(Clone, Copy)]
struct WorkItem {
	handler: WorkHandler,
	arg: usize,
	expires: u64,
	/// Trigger passes survived while not yet due.
	iteration: u64,
}

pub struct WorkQueue {
	name: &'static str,
	ring: SpinMutex<heapless::Deque<WorkItem, WORK_QUEUE_SIZE>>,
}

impl WorkQueue {
	pub const fn new(name: &'static str) -> Self {
		Self {
			name,
			ring: SpinMutex::new(heapless::Deque::new()),
		}
	}

	/// Insert a work item. `delay` is in ticks from now; `None` makes
	/// the item due at the next trigger.
	pub fn schedule(&self, handler: WorkHandler, arg: usize, delay: Option<u64>) -> Result<()> {
		let expires = time::now().saturating_add(delay.unwrap_or(0));
		let item = WorkItem {
			handler,
			arg,
			expires,
			iteration: 0,
		};
		self.ring.lock().push_back(item).map_err(|_| {
			debug!("work queue {} full, rejecting entry", self.name);
			Error::EAGAIN
		})
	}

	/// Run every due entry. Handlers execute outside the ring lock and
	/// are free to schedule follow-up work on the same queue.
	pub fn trigger(&self) {
		let now = time::now();
		let mut due: SmallVec<[WorkItem; 8]> = SmallVec::new();
		{
			let mut ring = self.ring.lock();
			for _ in 0..ring.len() {
				let Some(mut item) = ring.pop_front() else {
					break;
				};
				if item.expires <= now {
					due.push(item);
				} else {
					item.iteration += 1;
					// Capacity cannot be exceeded: we only rotate.
					let _ = ring.push_back(item);
				}
			}
		}
		for item in due {
			(item.handler)(item.arg);
		}
	}

	pub fn len(&self) -> usize {
		self.ring.lock().len()
	}

	pub fn is_empty(&self) -> bool {
		self.ring.lock().is_empty()
	}
}

static REGISTRY: SpinMutex<SmallVec<[&'static WorkQueue; 4]>> = SpinMutex::new(SmallVec::new_const());

/// Attach a queue to the timer path. Idempotent.
pub fn register(queue: &'static WorkQueue) {
	let mut registry = REGISTRY.lock();
	if !registry.iter().any(|q| core::ptr::eq(*q, queue)) {
		registry.push(queue);
	}
}

pub(crate) fn reset() {
	REGISTRY.lock().clear();
}

/// Timer entry: re-trigger every registered queue.
pub fn tick(_cpu: usize) {
	let queues: SmallVec<[&'static WorkQueue; 4]> = REGISTRY.lock().clone();
	for queue in queues {
		queue.trigger();
	}
}
