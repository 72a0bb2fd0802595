//! Limpet is the networking and file-system core of a small x86 kernel.
//!
//! The crate carries two tightly coupled subsystems: a TCP/IP stack
//! (Ethernet dispatch, ARP, IPv4 routing, ICMP, UDP and a full TCP state
//! machine with retransmission and congestion control behind a socket
//! layer) and a virtual file system (mount table, path resolution, block
//! cache, pipes and per-process descriptor tables).
//!
//! Everything that needs a CPU architecture — paging, interrupt wiring,
//! context switches, concrete device drivers — stays outside this crate
//! and is reached through the narrow driver contracts in [`net::device`]
//! and [`fs::blockdev`].

#![no_std]
#![allow(dead_code)]

#[macro_use]
extern crate alloc;
#[macro_use]
extern crate log;

#[cfg(test)]
extern crate std;

pub mod errno;
pub mod fd;
pub mod fs;
pub mod io;
pub mod net;
pub mod synch;
pub mod time;
pub mod workqueue;

/// Upper bound on threads concurrently entering core routines.
pub const SMP_MAX: usize = 32;

/// Bring every kernel-core singleton into a defined state.
///
/// Safe to call more than once; a second call tears the old state down
/// first. The root file system (an empty ramfs) is mounted and the
/// loopback interface is registered.
pub fn init() {
	workqueue::reset();
	fd::init();
	fs::init();
	net::init();
	info!("limpet core initialized");
}

/// 100 Hz timer tick entry point, called by the platform timer handler.
///
/// Advances the global tick counter, then drives every tick-driven
/// machine: ARP re-requests, the four TCP timers and the work queues.
pub fn tick() {
	time::tick();
	net::tick();
	workqueue::tick(0);
}
