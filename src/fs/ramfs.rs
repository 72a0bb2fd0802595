//! In-memory filesystem implementing the driver contract.
//!
//! Every mount gets a fresh tree; the "device" passed at mount time
//! only provides the `(dev, ino)` namespace for the new superblock.
//! Directories carry explicit `.` and `..` entries, so generic path
//! resolution needs no special cases here.

use alloc::string::{String, ToString};
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use alloc::collections::BTreeMap;
use hermit_sync::{RwSpinLock, SpinMutex};

use crate::fs::{
	DeviceId, DirEntry, FileAttr, FileMode, FsDriver, Inode, Superblock, S_IFMT,
};
use crate::io::{Error, Result};
use crate::time;

pub const RAMFS_ROOT_INO: u64 = 1;

/// Directory-removal flag for `unlink`.
pub const UNLINK_RMDIR: u32 = 0x1;

enum NodeData {
	File(Vec<u8>),
	Dir(Vec<DirEntry>),
	Device(DeviceId),
}

struct RamNode {
	sb: Weak<RamSuperblock>,
	dev: DeviceId,
	ino: u64,
	mode: SpinMutex<FileMode>,
	/// (atime, mtime, ctime) in ticks.
	times: SpinMutex<(u64, u64, u64)>,
	data: RwSpinLock<NodeData>,
}

impl RamNode {
	fn sb(&self) -> Arc<RamSuperblock> {
		self.sb.upgrade().expect("superblock outlives its inodes")
	}

	fn touch_mtime(&self) {
		let now = time::now();
		let mut times = self.times.lock();
		times.1 = now;
		times.2 = now;
	}
}

impl Inode for RamNode {
	fn dev(&self) -> DeviceId {
		self.dev
	}

	fn ino(&self) -> u64 {
		self.ino
	}

	fn mode(&self) -> FileMode {
		*self.mode.lock()
	}

	fn size(&self) -> u64 {
		match &*self.data.read() {
			NodeData::File(data) => data.len() as u64,
			NodeData::Dir(entries) => entries.len() as u64,
			NodeData::Device(_) => 0,
		}
	}

	fn attr(&self) -> FileAttr {
		let times = *self.times.lock();
		FileAttr {
			dev: self.dev,
			ino: self.ino,
			mode: self.mode(),
			nlink: 1,
			size: self.size(),
			atime: times.0,
			mtime: times.1,
			ctime: times.2,
		}
	}

	fn superblock(&self) -> Arc<dyn Superblock> {
		self.sb()
	}

	fn set_mode(&self, mode: FileMode) -> Result<()> {
		let mut current = self.mode.lock();
		// Only permission bits change; the file type is immutable.
		*current = FileMode((current.0 & S_IFMT) | mode.perm());
		Ok(())
	}

	fn utime(&self, atime: u64, mtime: u64) -> Result<()> {
		let mut times = self.times.lock();
		times.0 = atime;
		times.1 = mtime;
		Ok(())
	}

	fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
		match &*self.data.read() {
			NodeData::File(data) => {
				let offset = offset as usize;
				if offset >= data.len() {
					return Ok(0);
				}
				let n = buf.len().min(data.len() - offset);
				buf[..n].copy_from_slice(&data[offset..offset + n]);
				Ok(n)
			}
			NodeData::Dir(_) => Err(Error::EISDIR),
			NodeData::Device(_) => Err(Error::ENOSYS),
		}
	}

	fn write(&self, offset: u64, buf: &[u8]) -> Result<usize> {
		match &mut *self.data.write() {
			NodeData::File(data) => {
				let offset = offset as usize;
				if offset + buf.len() > data.len() {
					data.resize(offset + buf.len(), 0);
				}
				data[offset..offset + buf.len()].copy_from_slice(buf);
				self.touch_mtime();
				Ok(buf.len())
			}
			NodeData::Dir(_) => Err(Error::EISDIR),
			NodeData::Device(_) => Err(Error::ENOSYS),
		}
	}

	fn trunc(&self, size: u64) -> Result<()> {
		match &mut *self.data.write() {
			NodeData::File(data) => {
				data.resize(size as usize, 0);
				self.touch_mtime();
				Ok(())
			}
			NodeData::Dir(_) => Err(Error::EISDIR),
			NodeData::Device(_) => Err(Error::ENOSYS),
		}
	}

	fn get_direntry(&self, index: usize) -> Result<Option<DirEntry>> {
		match &*self.data.read() {
			NodeData::Dir(entries) => Ok(entries.get(index).cloned()),
			_ => Err(Error::ENOTDIR),
		}
	}

	fn create(&self, name: &str, mode: FileMode) -> Result<Arc<dyn Inode>> {
		let sb = self.sb();
		let data = if mode.is_dir() {
			NodeData::Dir(Vec::new())
		} else if mode.is_file() {
			NodeData::File(Vec::new())
		} else {
			return Err(Error::EINVAL);
		};
		let node = self.insert_child(&sb, name, mode, data)?;
		Ok(node)
	}

	fn mknod(&self, name: &str, mode: FileMode, rdev: DeviceId) -> Result<Arc<dyn Inode>> {
		if !mode.is_chardev() && !mode.is_blockdev() {
			return Err(Error::EINVAL);
		}
		let sb = self.sb();
		let node = self.insert_child(&sb, name, mode, NodeData::Device(rdev))?;
		Ok(node)
	}

	fn unlink(&self, name: &str, flags: u32) -> Result<()> {
		if name == "." || name == ".." {
			return Err(Error::EINVAL);
		}
		let sb = self.sb();
		let mut data = self.data.write();
		let NodeData::Dir(entries) = &mut *data else {
			return Err(Error::ENOTDIR);
		};
		let at = entries
			.iter()
			.position(|e| e.name == name)
			.ok_or(Error::ENOENT)?;
		let ino = entries[at].ino;
		let victim = sb.get_inode(ino)?;

		if victim.is_dir() {
			if flags & UNLINK_RMDIR == 0 {
				return Err(Error::EISDIR);
			}
			// Only `.` and `..` may remain.
			if victim.get_direntry(2)?.is_some() {
				return Err(Error::ENOTEMPTY);
			}
		} else if flags & UNLINK_RMDIR != 0 {
			return Err(Error::ENOTDIR);
		}

		entries.remove(at);
		drop(data);
		drop(victim);
		sb.inodes.lock().remove(&ino);
		self.touch_mtime();
		Ok(())
	}

	fn rdev(&self) -> Option<DeviceId> {
		match &*self.data.read() {
			NodeData::Device(dev) => Some(*dev),
			_ => None,
		}
	}
}

impl RamNode {
	fn insert_child(
		&self,
		sb: &Arc<RamSuperblock>,
		name: &str,
		mode: FileMode,
		data: NodeData,
	) -> Result<Arc<dyn Inode>> {
		if name.is_empty() || name.contains('/') {
			return Err(Error::EINVAL);
		}
		let mut dir = self.data.write();
		let NodeData::Dir(entries) = &mut *dir else {
			return Err(Error::ENOTDIR);
		};
		if entries.iter().any(|e| e.name == name) {
			return Err(Error::EEXIST);
		}

		let ino = sb.next_ino.fetch_add(1, Ordering::SeqCst);
		let data = match data {
			// A fresh directory learns its place in the tree.
			NodeData::Dir(_) => NodeData::Dir(vec![
				DirEntry {
					ino,
					name: String::from("."),
				},
				DirEntry {
					ino: self.ino,
					name: String::from(".."),
				},
			]),
			other => other,
		};
		let now = time::now();
		let node = Arc::new(RamNode {
			sb: Arc::downgrade(sb),
			dev: sb.device,
			ino,
			mode: SpinMutex::new(mode),
			times: SpinMutex::new((now, now, now)),
			data: RwSpinLock::new(data),
		});
		sb.inodes.lock().insert(ino, node.clone());
		entries.push(DirEntry {
			ino,
			name: name.to_string(),
		});
		drop(dir);
		self.touch_mtime();
		Ok(node as Arc<dyn Inode>)
	}
}

pub struct RamSuperblock {
	device: DeviceId,
	inodes: SpinMutex<BTreeMap<u64, Arc<RamNode>>>,
	next_ino: AtomicU64,
}

impl RamSuperblock {
	fn new(device: DeviceId) -> Arc<Self> {
		Arc::new_cyclic(|weak: &Weak<RamSuperblock>| {
			let now = time::now();
			let root = Arc::new(RamNode {
				sb: weak.clone(),
				dev: device,
				ino: RAMFS_ROOT_INO,
				mode: SpinMutex::new(FileMode::dir(0o755)),
				times: SpinMutex::new((now, now, now)),
				data: RwSpinLock::new(NodeData::Dir(vec![
					DirEntry {
						ino: RAMFS_ROOT_INO,
						name: String::from("."),
					},
					DirEntry {
						ino: RAMFS_ROOT_INO,
						name: String::from(".."),
					},
				])),
			});
			let mut inodes = BTreeMap::new();
			inodes.insert(RAMFS_ROOT_INO, root);
			Self {
				device,
				inodes: SpinMutex::new(inodes),
				next_ino: AtomicU64::new(RAMFS_ROOT_INO + 1),
			}
		})
	}
}

impl Superblock for RamSuperblock {
	fn device(&self) -> DeviceId {
		self.device
	}

	fn root_ino(&self) -> u64 {
		RAMFS_ROOT_INO
	}

	fn get_inode(&self, ino: u64) -> Result<Arc<dyn Inode>> {
		let inodes = self.inodes.lock();
		let node = inodes.get(&ino).ok_or(Error::ENOENT)?;
		Ok(node.clone() as Arc<dyn Inode>)
	}

	fn is_busy(&self) -> bool {
		// The table's reference is the baseline; anything beyond it is
		// an open file, a CWD or the mount table.
		self.inodes
			.lock()
			.values()
			.any(|node| Arc::strong_count(node) > 1)
	}
}

struct RamFsDriver;

impl FsDriver for RamFsDriver {
	fn name(&self) -> &'static str {
		"ramfs"
	}

	fn probe(&self, _device: DeviceId) -> Result<bool> {
		Ok(true)
	}

	fn get_superblock(&self, device: DeviceId) -> Result<Arc<dyn Superblock>> {
		Ok(RamSuperblock::new(device))
	}
}

pub(crate) fn driver() -> Arc<dyn FsDriver> {
	Arc::new(RamFsDriver)
}
