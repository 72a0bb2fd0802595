//! Character and block device registries, keyed by major number.

use alloc::sync::Arc;

use hashbrown::HashMap;
use hermit_sync::{Lazy, RwSpinLock, SpinMutex};

use crate::io::{Error, Result};

/// Major number the TTY driver registers under; `isatty` keys off it.
pub const TTY_MAJOR: u32 = 4;
/// Major number of memory-backed block devices.
pub const MEMDISK_MAJOR: u32 = 240;

pub trait CharDevOps: Send + Sync {
	fn open(&self, _minor: u32) -> Result<()> {
		Ok(())
	}

	fn close(&self, _minor: u32) {}

	fn read(&self, _minor: u32, _buf: &mut [u8]) -> Result<usize> {
		Err(Error::ENOSYS)
	}

	fn write(&self, _minor: u32, _buf: &[u8]) -> Result<usize> {
		Err(Error::ENOSYS)
	}

	fn ioctl(&self, _minor: u32, _cmd: u32, _arg: usize) -> Result<i32> {
		Err(Error::ENOTTY)
	}
}

pub trait BlockDevOps: Send + Sync {
	fn open(&self, _minor: u32) -> Result<()> {
		Ok(())
	}

	fn close(&self, _minor: u32) {}

	/// Read whole blocks; `buf` length is a multiple of the cache's
	/// block size.
	fn read(&self, minor: u32, first_block: u64, buf: &mut [u8]) -> Result<()>;

	fn write(&self, minor: u32, first_block: u64, buf: &[u8]) -> Result<()>;

	/// Hardware sector size, used in request queueing.
	fn sector_size(&self) -> usize {
		512
	}
}

static CHAR_DEVS: Lazy<SpinMutex<HashMap<u32, Arc<dyn CharDevOps>>>> =
	Lazy::new(|| SpinMutex::new(HashMap::new()));
static BLOCK_DEVS: Lazy<SpinMutex<HashMap<u32, Arc<dyn BlockDevOps>>>> =
	Lazy::new(|| SpinMutex::new(HashMap::new()));

pub fn register_chardev(major: u32, ops: Arc<dyn CharDevOps>) -> Result<()> {
	match CHAR_DEVS.lock().try_insert(major, ops) {
		Ok(_) => Ok(()),
		Err(_) => Err(Error::EBUSY),
	}
}

pub fn register_blockdev(major: u32, ops: Arc<dyn BlockDevOps>) -> Result<()> {
	match BLOCK_DEVS.lock().try_insert(major, ops) {
		Ok(_) => Ok(()),
		Err(_) => Err(Error::EBUSY),
	}
}

pub fn chardev(major: u32) -> Result<Arc<dyn CharDevOps>> {
	CHAR_DEVS.lock().get(&major).cloned().ok_or(Error::ENODEV)
}

pub fn blockdev(major: u32) -> Result<Arc<dyn BlockDevOps>> {
	BLOCK_DEVS.lock().get(&major).cloned().ok_or(Error::ENODEV)
}

pub(crate) fn reset() {
	CHAR_DEVS.lock().clear();
	BLOCK_DEVS.lock().clear();
}

/// Memory-backed block device, the stand-in disk for cache and
/// filesystem plumbing.
pub struct MemBlockDevice {
	blocks: RwSpinLock<alloc::vec::Vec<u8>>,
}

impl MemBlockDevice {
	pub fn new(size_blocks: usize) -> Arc<Self> {
		Arc::new(Self {
			blocks: RwSpinLock::new(vec![0; size_blocks * super::blockcache::BLOCK_SIZE]),
		})
	}
}

impl BlockDevOps for MemBlockDevice {
	fn read(&self, _minor: u32, first_block: u64, buf: &mut [u8]) -> Result<()> {
		let store = self.blocks.read();
		let at = first_block as usize * super::blockcache::BLOCK_SIZE;
		if at + buf.len() > store.len() {
			return Err(Error::EINVAL);
		}
		buf.copy_from_slice(&store[at..at + buf.len()]);
		Ok(())
	}

	fn write(&self, _minor: u32, first_block: u64, buf: &[u8]) -> Result<()> {
		let mut store = self.blocks.write();
		let at = first_block as usize * super::blockcache::BLOCK_SIZE;
		if at + buf.len() > store.len() {
			return Err(Error::EINVAL);
		}
		store[at..at + buf.len()].copy_from_slice(buf);
		Ok(())
	}
}
