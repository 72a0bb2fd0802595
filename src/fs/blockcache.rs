//! Block cache: `(device, block)` keyed, read-through, write-through.
//!
//! A cache hit returns a pinned [`CachedBlock`]; the buffer stays
//! valid while the `Arc` lives, and eviction skips pinned blocks.
//! Writes go through to the device before the call returns, so a later
//! reader of the same device-block always sees them.

use alloc::collections::VecDeque;
use alloc::sync::Arc;

use hashbrown::HashMap;
use hermit_sync::{Lazy, SpinMutex};

use crate::fs::{devices, DeviceId};
use crate::io::Result;

/// Cache unit in bytes.
pub const BLOCK_SIZE: usize = 1024;

/// Cached blocks kept before eviction starts.
const CACHE_CAPACITY: usize = 256;

pub struct CachedBlock {
	pub dev: DeviceId,
	pub block: u64,
	data: SpinMutex<[u8; BLOCK_SIZE]>,
}

impl CachedBlock {
	pub fn with_data<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
		f(&*self.data.lock())
	}
}

struct CacheState {
	map: HashMap<(DeviceId, u64), Arc<CachedBlock>>,
	lru: VecDeque<(DeviceId, u64)>,
}

static CACHE: Lazy<SpinMutex<CacheState>> = Lazy::new(|| {
	SpinMutex::new(CacheState {
		map: HashMap::new(),
		lru: VecDeque::new(),
	})
});

fn touch(lru: &mut VecDeque<(DeviceId, u64)>, key: (DeviceId, u64)) {
	if let Some(at) = lru.iter().position(|k| *k == key) {
		lru.remove(at);
	}
	lru.push_back(key);
}

fn evict(state: &mut CacheState) {
	let mut scanned = 0;
	while state.map.len() > CACHE_CAPACITY && scanned < state.lru.len() {
		let Some(key) = state.lru.pop_front() else {
			break;
		};
		let pinned = state
			.map
			.get(&key)
			.map(|b| Arc::strong_count(b) > 1)
			.unwrap_or(false);
		if pinned {
			// Still referenced; rotate to the young end.
			state.lru.push_back(key);
			scanned += 1;
		} else {
			state.map.remove(&key);
		}
	}
}

/// Fetch a block, reading it from the device on a miss. The returned
/// `Arc` pins the block in the cache.
pub fn get(dev: DeviceId, block: u64) -> Result<Arc<CachedBlock>> {
	{
		let mut state = CACHE.lock();
		if let Some(hit) = state.map.get(&(dev, block)).cloned() {
			touch(&mut state.lru, (dev, block));
			return Ok(hit);
		}
	}

	// Device I/O happens off the cache lock.
	let ops = devices::blockdev(dev.major)?;
	let mut buf = [0u8; BLOCK_SIZE];
	ops.read(dev.minor, block, &mut buf)?;

	let mut state = CACHE.lock();
	// A concurrent miss may have filled the slot meanwhile.
	if let Some(hit) = state.map.get(&(dev, block)).cloned() {
		touch(&mut state.lru, (dev, block));
		return Ok(hit);
	}
	let cached = Arc::new(CachedBlock {
		dev,
		block,
		data: SpinMutex::new(buf),
	});
	state.map.insert((dev, block), cached.clone());
	state.lru.push_back((dev, block));
	evict(&mut state);
	Ok(cached)
}

/// Read `buf.len()` bytes starting at byte `offset` on the device.
pub fn read(dev: DeviceId, offset: u64, buf: &mut [u8]) -> Result<()> {
	let mut done = 0;
	while done < buf.len() {
		let block = (offset + done as u64) / BLOCK_SIZE as u64;
		let within = ((offset + done as u64) % BLOCK_SIZE as u64) as usize;
		let n = (BLOCK_SIZE - within).min(buf.len() - done);
		let cached = get(dev, block)?;
		cached.with_data(|data| buf[done..done + n].copy_from_slice(&data[within..within + n]));
		done += n;
	}
	Ok(())
}

/// Write through the cache: the cached copy and the device are updated
/// before the call returns.
pub fn write(dev: DeviceId, offset: u64, buf: &[u8]) -> Result<()> {
	let ops = devices::blockdev(dev.major)?;
	let mut done = 0;
	while done < buf.len() {
		let block = (offset + done as u64) / BLOCK_SIZE as u64;
		let within = ((offset + done as u64) % BLOCK_SIZE as u64) as usize;
		let n = (BLOCK_SIZE - within).min(buf.len() - done);
		let cached = get(dev, block)?;
		{
			let mut data = cached.data.lock();
			data[within..within + n].copy_from_slice(&buf[done..done + n]);
			ops.write(dev.minor, block, &data[..])?;
		}
		done += n;
	}
	Ok(())
}

/// Drop every cached block of a device (unmount path).
pub fn invalidate(dev: DeviceId) {
	let mut state = CACHE.lock();
	state.map.retain(|key, _| key.0 != dev);
	state.lru.retain(|key| key.0 != dev);
}

pub(crate) fn reset() {
	let mut state = CACHE.lock();
	state.map.clear();
	state.lru.clear();
}
