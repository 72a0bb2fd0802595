//! Virtual file system core.
//!
//! Filesystem drivers plug in through three traits: [`FsDriver`]
//! (probe a device, produce a superblock), [`Superblock`] (inode
//! factory and busy bookkeeping) and [`Inode`] (the per-object ops
//! vtable). The VFS itself owns the mount table and path resolution;
//! it never interprets on-disk data.
//!
//! Path resolution is dentry-less: directory contents are enumerated
//! through `get_direntry` until a component matches, mount points are
//! crossed transparently in both directions, and `..` at the root of a
//! mounted filesystem steps to the parent of its mount point.

pub mod blockcache;
pub mod devices;
pub mod ramfs;

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use hermit_sync::SpinMutex;

use crate::io::{Error, Result};

/// Device numbers, `(major, minor)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DeviceId {
	pub major: u32,
	pub minor: u32,
}

impl DeviceId {
	pub const NONE: DeviceId = DeviceId { major: 0, minor: 0 };

	pub const fn new(major: u32, minor: u32) -> Self {
		Self { major, minor }
	}
}

impl fmt::Display for DeviceId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}:{}", self.major, self.minor)
	}
}

// ── File modes ──────────────────────────────────────────────────────────

pub const S_IFMT: u32 = 0o170000;
pub const S_IFSOCK: u32 = 0o140000;
pub const S_IFREG: u32 = 0o100000;
pub const S_IFBLK: u32 = 0o060000;
pub const S_IFDIR: u32 = 0o040000;
pub const S_IFCHR: u32 = 0o020000;
pub const S_IFIFO: u32 = 0o010000;

/// Type and permission bits, classic `st_mode` layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FileMode(pub u32);

impl FileMode {
	pub const fn file(perm: u32) -> Self {
		Self(S_IFREG | perm)
	}

	pub const fn dir(perm: u32) -> Self {
		Self(S_IFDIR | perm)
	}

	pub fn file_type(self) -> u32 {
		self.0 & S_IFMT
	}

	pub fn perm(self) -> u32 {
		self.0 & 0o7777
	}

	pub fn is_dir(self) -> bool {
		self.file_type() == S_IFDIR
	}

	pub fn is_file(self) -> bool {
		self.file_type() == S_IFREG
	}

	pub fn is_chardev(self) -> bool {
		self.file_type() == S_IFCHR
	}

	pub fn is_blockdev(self) -> bool {
		self.file_type() == S_IFBLK
	}
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FileAttr {
	pub dev: DeviceId,
	pub ino: u64,
	pub mode: FileMode,
	pub nlink: u32,
	pub size: u64,
	/// Timestamps in ticks since boot.
	pub atime: u64,
	pub mtime: u64,
	pub ctime: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DirEntry {
	pub ino: u64,
	pub name: String,
}

// ── Driver contracts ────────────────────────────────────────────────────

/// Per-object operations. Defaults return `ENOSYS` so a driver only
/// implements what its objects support.
pub trait Inode: Send + Sync {
	fn dev(&self) -> DeviceId;
	fn ino(&self) -> u64;
	fn mode(&self) -> FileMode;
	fn size(&self) -> u64;
	fn attr(&self) -> FileAttr;
	fn superblock(&self) -> Arc<dyn Superblock>;

	fn set_mode(&self, _mode: FileMode) -> Result<()> {
		Err(Error::ENOSYS)
	}

	fn utime(&self, _atime: u64, _mtime: u64) -> Result<()> {
		Err(Error::ENOSYS)
	}

	fn read(&self, _offset: u64, _buf: &mut [u8]) -> Result<usize> {
		Err(Error::ENOSYS)
	}

	fn write(&self, _offset: u64, _buf: &[u8]) -> Result<usize> {
		Err(Error::ENOSYS)
	}

	fn trunc(&self, _size: u64) -> Result<()> {
		Err(Error::ENOSYS)
	}

	/// Enumerate directory contents; `None` past the last entry.
	fn get_direntry(&self, _index: usize) -> Result<Option<DirEntry>> {
		Err(Error::ENOTDIR)
	}

	fn create(&self, _name: &str, _mode: FileMode) -> Result<Arc<dyn Inode>> {
		Err(Error::ENOSYS)
	}

	/// Create a device node. `rdev` names the device the node stands
	/// for; the mode carries the char/block type bit.
	fn mknod(&self, _name: &str, _mode: FileMode, _rdev: DeviceId) -> Result<Arc<dyn Inode>> {
		Err(Error::ENOSYS)
	}

	fn unlink(&self, _name: &str, _flags: u32) -> Result<()> {
		Err(Error::ENOSYS)
	}

	/// Device numbers of the object a device node refers to.
	fn rdev(&self) -> Option<DeviceId> {
		None
	}

	fn is_dir(&self) -> bool {
		self.mode().is_dir()
	}
}

pub trait Superblock: Send + Sync {
	fn device(&self) -> DeviceId;
	fn root_ino(&self) -> u64;
	fn get_inode(&self, ino: u64) -> Result<Arc<dyn Inode>>;
	/// True while any inode of this filesystem is referenced outside
	/// the superblock itself (open files, CWDs, the mount table).
	fn is_busy(&self) -> bool;
	/// Final teardown after a successful unmount.
	fn release(&self) {}
}

pub trait FsDriver: Send + Sync {
	fn name(&self) -> &'static str;
	fn probe(&self, device: DeviceId) -> Result<bool>;
	fn get_superblock(&self, device: DeviceId) -> Result<Arc<dyn Superblock>>;
}

// ── Mount table ─────────────────────────────────────────────────────────

struct Mount {
	/// `(dev, ino)` of the mount point; `None` for the root mount.
	mpoint: Option<(DeviceId, u64)>,
	mpoint_inode: Option<Arc<dyn Inode>>,
	sb: Arc<dyn Superblock>,
	root: Arc<dyn Inode>,
}

static MOUNTS: SpinMutex<Vec<Mount>> = SpinMutex::new(Vec::new());
static FS_DRIVERS: SpinMutex<Vec<Arc<dyn FsDriver>>> = SpinMutex::new(Vec::new());

pub fn register_fs(driver: Arc<dyn FsDriver>) {
	let mut drivers = FS_DRIVERS.lock();
	if !drivers.iter().any(|d| d.name() == driver.name()) {
		drivers.push(driver);
	}
}

fn driver_by_name(name: &str) -> Result<Arc<dyn FsDriver>> {
	FS_DRIVERS
		.lock()
		.iter()
		.find(|d| d.name() == name)
		.cloned()
		.ok_or(Error::ENODEV)
}

/// Reset the VFS and mount a fresh ramfs as the root filesystem.
pub fn init() {
	{
		let mut mounts = MOUNTS.lock();
		mounts.clear();
	}
	FS_DRIVERS.lock().clear();
	blockcache::reset();
	devices::reset();
	register_fs(ramfs::driver());
	mount_root(DeviceId::NONE, "ramfs").expect("root mount cannot fail on a fresh table");
}

/// Mount the root filesystem; the mount-point inode is the null inode.
pub fn mount_root(device: DeviceId, fstype: &str) -> Result<()> {
	let driver = driver_by_name(fstype)?;
	if !driver.probe(device)? {
		return Err(Error::EINVAL);
	}
	let mut mounts = MOUNTS.lock();
	if mounts.iter().any(|m| m.mpoint.is_none()) {
		return Err(Error::EBUSY);
	}
	let sb = driver.get_superblock(device)?;
	let root = sb.get_inode(sb.root_ino())?;
	info!("mounting {} as root filesystem", fstype);
	mounts.push(Mount {
		mpoint: None,
		mpoint_inode: None,
		sb,
		root,
	});
	Ok(())
}

/// Mount `device` with `fstype` on the directory `mpoint`.
pub fn mount(mpoint: &Arc<dyn Inode>, device: DeviceId, fstype: &str) -> Result<()> {
	if !mpoint.is_dir() {
		return Err(Error::ENOTDIR);
	}
	let driver = driver_by_name(fstype)?;
	if !driver.probe(device)? {
		return Err(Error::EINVAL);
	}

	let key = (mpoint.dev(), mpoint.ino());
	{
		let mounts = MOUNTS.lock();
		if mounts.iter().any(|m| m.mpoint == Some(key)) {
			return Err(Error::EBUSY);
		}
		if mounts.iter().any(|m| m.sb.device() == device && device != DeviceId::NONE) {
			return Err(Error::EBUSY);
		}
	}

	let sb = driver.get_superblock(device)?;
	let root = sb.get_inode(sb.root_ino())?;
	let mut mounts = MOUNTS.lock();
	if mounts.iter().any(|m| m.mpoint == Some(key)) {
		return Err(Error::EBUSY);
	}
	info!("mounting {} (device {}) on inode {}:{}", fstype, device, key.0, key.1);
	mounts.push(Mount {
		mpoint: Some(key),
		mpoint_inode: Some(mpoint.clone()),
		sb,
		root,
	});
	Ok(())
}

/// Unmount the filesystem whose root is `(dev, ino)`. Fails with
/// `EBUSY` while anything outside the mount table references its
/// inodes — callers must drop their own resolved reference first.
pub fn unmount_at(dev: DeviceId, ino: u64) -> Result<()> {
	let key = (dev, ino);
	let mount = {
		let mut mounts = MOUNTS.lock();
		let index = mounts
			.iter()
			.position(|m| {
				m.mpoint.is_some() && m.root.dev() == key.0 && m.root.ino() == key.1
			})
			.ok_or(Error::EINVAL)?;
		mounts.remove(index)
	};

	// Drop the table's own root reference before asking the driver;
	// only then does `is_busy` see external users alone.
	let Mount {
		mpoint,
		mpoint_inode,
		sb,
		root: table_root,
	} = mount;
	drop(table_root);

	if sb.is_busy() {
		let root = sb.get_inode(sb.root_ino())?;
		MOUNTS.lock().push(Mount {
			mpoint,
			mpoint_inode,
			sb,
			root,
		});
		return Err(Error::EBUSY);
	}
	sb.release();
	Ok(())
}

/// Root inode of the root mount.
pub fn root_inode() -> Result<Arc<dyn Inode>> {
	MOUNTS
		.lock()
		.iter()
		.find(|m| m.mpoint.is_none())
		.map(|m| m.root.clone())
		.ok_or(Error::ENOENT)
}

fn mounted_root_at(dev: DeviceId, ino: u64) -> Option<Arc<dyn Inode>> {
	MOUNTS
		.lock()
		.iter()
		.find(|m| m.mpoint == Some((dev, ino)))
		.map(|m| m.root.clone())
}

/// Mount point whose mounted filesystem has `(dev, ino)` as its root.
fn mount_point_of(dev: DeviceId, ino: u64) -> Option<Arc<dyn Inode>> {
	MOUNTS.lock().iter().find_map(|m| {
		if m.mpoint.is_some() && m.root.dev() == dev && m.root.ino() == ino {
			m.mpoint_inode.clone()
		} else {
			None
		}
	})
}

/// Substitute a mounted filesystem's root for its mount point.
fn follow_mount(inode: Arc<dyn Inode>) -> Arc<dyn Inode> {
	match mounted_root_at(inode.dev(), inode.ino()) {
		Some(root) => root,
		None => inode,
	}
}

/// Find `name` in `dir` by scanning directory entries.
pub fn lookup_name(dir: &Arc<dyn Inode>, name: &str) -> Result<Option<Arc<dyn Inode>>> {
	let mut index = 0;
	loop {
		match dir.get_direntry(index)? {
			None => return Ok(None),
			Some(entry) if entry.name == name => {
				return dir.superblock().get_inode(entry.ino).map(Some);
			}
			Some(_) => index += 1,
		}
	}
}

/// `..`, crossing a mount boundary when `cur` is a mounted root.
fn parent_of(cur: Arc<dyn Inode>) -> Result<Arc<dyn Inode>> {
	let base = match mount_point_of(cur.dev(), cur.ino()) {
		Some(mpoint) => mpoint,
		None => cur,
	};
	lookup_name(&base, "..")?.ok_or(Error::ENOENT)
}

/// Resolve `path` starting at `start` (ignored for absolute paths).
pub fn resolve_at(start: Option<&Arc<dyn Inode>>, path: &str) -> Result<Arc<dyn Inode>> {
	let mut cur = if path.starts_with('/') {
		root_inode()?
	} else {
		start.ok_or(Error::EINVAL)?.clone()
	};

	for component in path.split('/').filter(|c| !c.is_empty()) {
		if !cur.is_dir() {
			return Err(Error::ENOTDIR);
		}
		cur = match component {
			"." => cur,
			".." => parent_of(cur)?,
			name => {
				let next = lookup_name(&cur, name)?.ok_or(Error::ENOENT)?;
				follow_mount(next)
			}
		};
	}
	Ok(cur)
}

/// Split into `(parent path, final component)` for creation-style
/// calls. Fails on paths ending in `.` or `..`.
pub fn split_path(path: &str) -> Result<(&str, &str)> {
	let trimmed = path.trim_end_matches('/');
	if trimmed.is_empty() {
		return Err(Error::EINVAL);
	}
	let (dir, name) = match trimmed.rfind('/') {
		Some(at) => (&trimmed[..at + 1], &trimmed[at + 1..]),
		None => ("", trimmed),
	};
	if name.is_empty() || name == "." || name == ".." {
		return Err(Error::EINVAL);
	}
	Ok((dir, name))
}

/// Absolute path of `inode`, built by walking parent links and
/// scanning each parent for the child's name. Crosses mount
/// boundaries like `..` does.
pub fn path_of(inode: &Arc<dyn Inode>) -> Result<String> {
	let root = root_inode()?;
	let mut cur = inode.clone();
	let mut names: Vec<String> = Vec::new();

	for _ in 0..256 {
		if cur.dev() == root.dev() && cur.ino() == root.ino() {
			if names.is_empty() {
				return Ok(String::from("/"));
			}
			let mut path = String::new();
			for name in names.iter().rev() {
				path.push('/');
				path.push_str(name);
			}
			return Ok(path);
		}

		// Step across a mount boundary before asking for the parent,
		// so the name search happens in the right filesystem.
		let base = match mount_point_of(cur.dev(), cur.ino()) {
			Some(mpoint) => mpoint,
			None => cur,
		};
		let parent = lookup_name(&base, "..")?.ok_or(Error::ENOENT)?;

		let mut index = 0;
		let name = loop {
			match parent.get_direntry(index)? {
				None => return Err(Error::ENOENT),
				Some(entry) if entry.ino == base.ino() && entry.name != "." && entry.name != ".." => {
					break entry.name;
				}
				Some(_) => index += 1,
			}
		};
		names.push(name);
		cur = parent;
	}
	Err(Error::ENOENT)
}
