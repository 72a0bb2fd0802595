//! Network message buffers.
//!
//! A [`NetMsg`] owns one contiguous allocation and two cursors into it:
//! `start` (first used byte) and `end` (one past the last). Headers are
//! built front-to-back by `prepend` on the egress path and stripped by
//! `cut_off` on ingress, so a payload is copied exactly once per
//! direction. Per-layer header positions are kept as integer offsets
//! into the allocation, never as references, which keeps the buffer
//! freely movable between queues.
//!
//! Ownership is by move: a message belongs to exactly one queue at a
//! time (NIC ring, ARP pending queue, socket receive buffer), and the
//! queue that drops it frees it.

use alloc::vec::Vec;
use core::net::Ipv4Addr;

use crate::io::{Error, Result};
use crate::net::device::NicId;

/// Default headroom reserved in front of the payload; enough for
/// Ethernet + IPv4 + TCP headers without a copy.
pub const DEFAULT_HEADROOM: usize = 128;

#[derive(Debug, Clone)]
pub struct NetMsg {
	buf: Vec<u8>,
	start: usize,
	end: usize,

	/// Per-layer header offsets into the allocation.
	pub eth_hdr: Option<usize>,
	pub arp_hdr: Option<usize>,
	pub ip_hdr: Option<usize>,
	pub icmp_hdr: Option<usize>,
	pub tcp_hdr: Option<usize>,
	pub udp_hdr: Option<usize>,

	/// Routing metadata filled by the IP layer.
	pub ip_src: Ipv4Addr,
	pub ip_dst: Ipv4Addr,
	pub ip_len: u16,
	pub ip_proto: u8,
	pub df: bool,
	pub nic: Option<NicId>,
}

impl NetMsg {
	/// Allocate a message able to carry `size` payload bytes behind the
	/// default headroom.
	pub fn new(size: usize) -> Self {
		Self::create(size, DEFAULT_HEADROOM)
	}

	/// Allocate with an explicit headroom.
	pub fn create(size: usize, headroom: usize) -> Self {
		Self {
			buf: vec![0; headroom + size],
			start: headroom,
			end: headroom,
			eth_hdr: None,
			arp_hdr: None,
			ip_hdr: None,
			icmp_hdr: None,
			tcp_hdr: None,
			udp_hdr: None,
			ip_src: Ipv4Addr::UNSPECIFIED,
			ip_dst: Ipv4Addr::UNSPECIFIED,
			ip_len: 0,
			ip_proto: 0,
			df: false,
			nic: None,
		}
	}

	/// Build a message around received frame contents. The frame starts
	/// at offset 0 with no headroom; ingress never prepends.
	pub fn from_frame(frame: &[u8]) -> Self {
		let mut msg = Self::create(frame.len(), 0);
		msg.append(frame.len())
			.expect("fresh buffer has room for its own frame")
			.copy_from_slice(frame);
		msg
	}

	pub fn len(&self) -> usize {
		self.end - self.start
	}

	pub fn is_empty(&self) -> bool {
		self.start == self.end
	}

	/// Bytes still free in front of `start`.
	pub fn headroom(&self) -> usize {
		self.start
	}

	/// Bytes still free behind `end`.
	pub fn tailroom(&self) -> usize {
		self.buf.len() - self.end
	}

	/// Offset of the first used byte within the allocation. Header
	/// offset fields are expressed in the same coordinate system.
	pub fn start_offset(&self) -> usize {
		self.start
	}

	/// Grow the used region at the front by `n` bytes and return it.
	pub fn prepend(&mut self, n: usize) -> Result<&mut [u8]> {
		if self.start < n {
			return Err(Error::ENOBUFS);
		}
		self.start -= n;
		self.check_cursors();
		Ok(&mut self.buf[self.start..self.start + n])
	}

	/// Grow the used region at the back by `n` bytes and return it.
	pub fn append(&mut self, n: usize) -> Result<&mut [u8]> {
		if self.tailroom() < n {
			return Err(Error::ENOBUFS);
		}
		let at = self.end;
		self.end += n;
		self.check_cursors();
		Ok(&mut self.buf[at..at + n])
	}

	/// Drop `n` bytes from the front (strip a parsed header).
	pub fn cut_off(&mut self, n: usize) -> Result<()> {
		if self.len() < n {
			return Err(Error::EINVAL);
		}
		self.start += n;
		self.check_cursors();
		Ok(())
	}

	/// Shrink the used region to `len` bytes (drop link-layer padding).
	pub fn truncate(&mut self, len: usize) {
		if len < self.len() {
			self.end = self.start + len;
			self.check_cursors();
		}
	}

	/// The used region.
	pub fn as_slice(&self) -> &[u8] {
		&self.buf[self.start..self.end]
	}

	pub fn as_mut_slice(&mut self) -> &mut [u8] {
		&mut self.buf[self.start..self.end]
	}

	/// View from an absolute header offset to the end of the used
	/// region. `offset` usually comes from one of the `*_hdr` fields.
	pub fn bytes_from(&self, offset: usize) -> &[u8] {
		&self.buf[offset..self.end]
	}

	pub fn bytes_from_mut(&mut self, offset: usize) -> &mut [u8] {
		&mut self.buf[offset..self.end]
	}

	fn check_cursors(&self) {
		// Freeing or corrupting a message that queues still reference
		// would show up here; this invariant is fatal by design of the
		// error policy.
		assert!(
			self.start <= self.end && self.end <= self.buf.len(),
			"net_msg cursor invariant violated"
		);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn cursors_start_at_headroom() {
		let msg = NetMsg::new(100);
		assert_eq!(msg.len(), 0);
		assert_eq!(msg.headroom(), DEFAULT_HEADROOM);
		assert_eq!(msg.tailroom(), 100);
	}

	#[test]
	fn append_prepend_cut_roundtrip() {
		let mut msg = NetMsg::new(64);
		msg.append(4).unwrap().copy_from_slice(b"data");
		msg.prepend(4).unwrap().copy_from_slice(b"hdr:");
		assert_eq!(msg.as_slice(), b"hdr:data");
		msg.cut_off(4).unwrap();
		assert_eq!(msg.as_slice(), b"data");
	}

	#[test]
	fn prepend_beyond_headroom_fails() {
		let mut msg = NetMsg::create(16, 8);
		assert_eq!(msg.prepend(9).err(), Some(Error::ENOBUFS));
		// Failure must not move the cursor.
		assert_eq!(msg.headroom(), 8);
	}

	#[test]
	fn append_beyond_capacity_fails() {
		let mut msg = NetMsg::create(16, 8);
		msg.append(16).unwrap();
		assert_eq!(msg.append(1).err(), Some(Error::ENOBUFS));
	}

	#[test]
	fn cut_off_more_than_len_fails() {
		let mut msg = NetMsg::new(8);
		msg.append(4).unwrap();
		assert_eq!(msg.cut_off(5).err(), Some(Error::EINVAL));
		assert_eq!(msg.len(), 4);
	}

	#[test]
	fn clone_is_independent() {
		let mut msg = NetMsg::new(8);
		msg.append(3).unwrap().copy_from_slice(b"abc");
		msg.ip_proto = 17;
		let mut copy = msg.clone();
		copy.as_mut_slice()[0] = b'x';
		assert_eq!(msg.as_slice(), b"abc");
		assert_eq!(copy.as_slice(), b"xbc");
		assert_eq!(copy.ip_proto, 17);
	}
}
