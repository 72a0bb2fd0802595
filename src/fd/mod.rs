//! Per-process descriptor tables and the POSIX-facing file API.
//!
//! A descriptor is a small integer indexing into its process's slot
//! table; the slot holds a reference-counted [`OpenFile`]. `dup`,
//! `dup2` and `fork` share the open file (position, status flags and
//! all); the object underneath is released when the last reference
//! drops.

pub mod pipe;

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};

use hermit_sync::SpinMutex;
use num_enum::TryFromPrimitive;

use crate::fs::devices::{self, BlockDevOps, CharDevOps, TTY_MAJOR};
use crate::fs::{self, blockcache, DeviceId, DirEntry, FileAttr, FileMode, Inode};
use crate::io::{Error, Result};
use crate::net::socket::{self, PollEvents, SockAddr, SockOptValue, Socket};
use crate::synch::{CancelToken, Semaphore};
use crate::time::TimeVal;

pub use pipe::{Pipe, PipeEnd, PIPE_BUF};

pub type Pid = u32;
pub type FileDescriptor = i32;

/// `openat` sentinel: resolve relative to the per-process CWD.
pub const AT_FDCWD: FileDescriptor = -100;

/// Slots per process.
pub const FD_MAX: usize = 256;

bitflags::bitflags! {
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	pub struct OpenFlags: u32 {
		const O_WRONLY = 0o1;
		const O_RDWR = 0o2;
		const O_CREAT = 0o100;
		const O_EXCL = 0o200;
		const O_TRUNC = 0o1000;
		const O_APPEND = 0o2000;
		const O_NONBLOCK = 0o4000;
		const O_DIRECTORY = 0o200000;
		const O_CLOEXEC = 0o2000000;
	}
}

pub const O_RDONLY: OpenFlags = OpenFlags::empty();

/// Status flags `F_SETFL` may change.
const SETTABLE_STATUS: OpenFlags = OpenFlags::O_APPEND.union(OpenFlags::O_NONBLOCK);

pub const F_DUPFD: i32 = 0;
pub const F_GETFD: i32 = 1;
pub const F_SETFD: i32 = 2;
pub const F_GETFL: i32 = 3;
pub const F_SETFL: i32 = 4;

pub const FD_CLOEXEC: i32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(i32)]
pub enum SeekWhence {
	Set = 0,
	Cur = 1,
	End = 2,
}

/// What an open file refers to.
pub enum OpenObject {
	Regular {
		inode: Arc<dyn Inode>,
	},
	Directory {
		inode: Arc<dyn Inode>,
	},
	CharDev {
		inode: Arc<dyn Inode>,
		rdev: DeviceId,
		ops: Arc<dyn CharDevOps>,
	},
	BlockDev {
		inode: Arc<dyn Inode>,
		rdev: DeviceId,
		ops: Arc<dyn BlockDevOps>,
	},
	Pipe {
		pipe: Arc<Pipe>,
		end: PipeEnd,
	},
	Socket {
		socket: Arc<Socket>,
	},
}

/// Shared open-file state: one instance per `open`/`pipe`/`socket`
/// call, shared by all descriptors cloned from it.
pub struct OpenFile {
	pub object: OpenObject,
	readable: bool,
	writable: bool,
	pos: SpinMutex<i64>,
	flags: SpinMutex<OpenFlags>,
	cloexec: AtomicBool,
}

impl OpenFile {
	fn new(object: OpenObject, readable: bool, writable: bool, flags: OpenFlags) -> Arc<Self> {
		Arc::new(Self {
			object,
			readable,
			writable,
			pos: SpinMutex::new(0),
			flags: SpinMutex::new(flags & SETTABLE_STATUS),
			cloexec: AtomicBool::new(flags.contains(OpenFlags::O_CLOEXEC)),
		})
	}

	pub fn status_flags(&self) -> OpenFlags {
		*self.flags.lock()
	}

	fn nonblocking(&self) -> bool {
		self.status_flags().contains(OpenFlags::O_NONBLOCK)
	}

	fn inode(&self) -> Option<&Arc<dyn Inode>> {
		match &self.object {
			OpenObject::Regular { inode }
			| OpenObject::Directory { inode }
			| OpenObject::CharDev { inode, .. }
			| OpenObject::BlockDev { inode, .. } => Some(inode),
			_ => None,
		}
	}
}

impl Drop for OpenFile {
	fn drop(&mut self) {
		match &self.object {
			OpenObject::CharDev { rdev, ops, .. } => ops.close(rdev.minor),
			OpenObject::BlockDev { rdev, ops, .. } => ops.close(rdev.minor),
			OpenObject::Pipe { pipe, end } => pipe.release_end(*end),
			OpenObject::Socket { socket } => socket.close(),
			OpenObject::Regular { .. } | OpenObject::Directory { .. } => {}
		}
	}
}

struct ProcessFiles {
	slots: Vec<Option<Arc<OpenFile>>>,
	cwd: Arc<dyn Inode>,
	umask: u32,
}

static PROCS: SpinMutex<BTreeMap<Pid, ProcessFiles>> = SpinMutex::new(BTreeMap::new());

pub fn init() {
	PROCS.lock().clear();
}

/// Create an empty descriptor table with the root directory as CWD.
pub fn process_init(pid: Pid) -> Result<()> {
	let cwd = fs::root_inode()?;
	let mut procs = PROCS.lock();
	if procs.contains_key(&pid) {
		return Err(Error::EEXIST);
	}
	procs.insert(
		pid,
		ProcessFiles {
			slots: Vec::new(),
			cwd,
			umask: 0o022,
		},
	);
	Ok(())
}

/// Fork-time duplication: the child shares every open file.
pub fn process_clone(src: Pid, dst: Pid) -> Result<()> {
	let mut procs = PROCS.lock();
	if procs.contains_key(&dst) {
		return Err(Error::EEXIST);
	}
	let parent = procs.get(&src).ok_or(Error::EINVAL)?;
	let child = ProcessFiles {
		slots: parent.slots.clone(),
		cwd: parent.cwd.clone(),
		umask: parent.umask,
	};
	procs.insert(dst, child);
	Ok(())
}

/// Release every descriptor of a process (exit path).
pub fn fs_close_all(pid: Pid) {
	PROCS.lock().remove(&pid);
}

fn with_process<R>(pid: Pid, f: impl FnOnce(&mut ProcessFiles) -> Result<R>) -> Result<R> {
	let mut procs = PROCS.lock();
	let proc = procs.get_mut(&pid).ok_or(Error::EINVAL)?;
	f(proc)
}

fn get_file(pid: Pid, fd: FileDescriptor) -> Result<Arc<OpenFile>> {
	with_process(pid, |proc| {
		usize::try_from(fd)
			.ok()
			.and_then(|fd| proc.slots.get(fd))
			.and_then(|slot| slot.clone())
			.ok_or(Error::EBADF)
	})
}

fn install_from(proc: &mut ProcessFiles, file: Arc<OpenFile>, min: usize) -> Result<FileDescriptor> {
	for (fd, slot) in proc.slots.iter_mut().enumerate().skip(min) {
		if slot.is_none() {
			*slot = Some(file);
			return Ok(fd as FileDescriptor);
		}
	}
	let fd = proc.slots.len().max(min);
	if fd >= FD_MAX {
		return Err(Error::EMFILE);
	}
	proc.slots.resize(fd + 1, None);
	proc.slots[fd] = Some(file);
	Ok(fd as FileDescriptor)
}

fn install(pid: Pid, file: Arc<OpenFile>) -> Result<FileDescriptor> {
	with_process(pid, |proc| install_from(proc, file, 0))
}

fn cwd_of(pid: Pid) -> Result<Arc<dyn Inode>> {
	with_process(pid, |proc| Ok(proc.cwd.clone()))
}

fn resolve_from(pid: Pid, dirfd: FileDescriptor, path: &str) -> Result<Arc<dyn Inode>> {
	let start = if path.starts_with('/') {
		None
	} else if dirfd == AT_FDCWD {
		Some(cwd_of(pid)?)
	} else {
		let file = get_file(pid, dirfd)?;
		match &file.object {
			OpenObject::Directory { inode } => Some(inode.clone()),
			_ => return Err(Error::ENOTDIR),
		}
	};
	fs::resolve_at(start.as_ref(), path)
}

fn object_for(inode: Arc<dyn Inode>, writable: bool) -> Result<OpenObject> {
	let mode = inode.mode();
	if mode.is_dir() {
		if writable {
			return Err(Error::EISDIR);
		}
		Ok(OpenObject::Directory { inode })
	} else if mode.is_file() {
		Ok(OpenObject::Regular { inode })
	} else if mode.is_chardev() {
		let rdev = inode.rdev().ok_or(Error::ENODEV)?;
		let ops = devices::chardev(rdev.major)?;
		ops.open(rdev.minor)?;
		Ok(OpenObject::CharDev { inode, rdev, ops })
	} else if mode.is_blockdev() {
		let rdev = inode.rdev().ok_or(Error::ENODEV)?;
		let ops = devices::blockdev(rdev.major)?;
		ops.open(rdev.minor)?;
		Ok(OpenObject::BlockDev { inode, rdev, ops })
	} else {
		Err(Error::EINVAL)
	}
}

// ── open / close ────────────────────────────────────────────────────────

pub fn open(pid: Pid, path: &str, flags: OpenFlags, mode: u32) -> Result<FileDescriptor> {
	openat(pid, AT_FDCWD, path, flags, mode)
}

pub fn openat(
	pid: Pid,
	dirfd: FileDescriptor,
	path: &str,
	flags: OpenFlags,
	mode: u32,
) -> Result<FileDescriptor> {
	let accmode = flags.bits() & 0o3;
	let readable = accmode != OpenFlags::O_WRONLY.bits();
	let writable = accmode != 0;

	let inode = match resolve_from(pid, dirfd, path) {
		Ok(inode) => {
			if flags.contains(OpenFlags::O_CREAT | OpenFlags::O_EXCL) {
				return Err(Error::EEXIST);
			}
			inode
		}
		Err(Error::ENOENT) if flags.contains(OpenFlags::O_CREAT) => {
			let (dir_path, name) = fs::split_path(path)?;
			let dir = if dir_path.is_empty() {
				resolve_from(pid, dirfd, ".")?
			} else {
				resolve_from(pid, dirfd, dir_path)?
			};
			let umask = with_process(pid, |proc| Ok(proc.umask))?;
			let perm = mode & 0o7777 & !umask;
			dir.create(name, FileMode::file(perm))?
		}
		Err(err) => return Err(err),
	};

	if flags.contains(OpenFlags::O_DIRECTORY) && !inode.is_dir() {
		return Err(Error::ENOTDIR);
	}
	let object = object_for(inode, writable)?;
	if writable && flags.contains(OpenFlags::O_TRUNC) {
		if let OpenObject::Regular { inode } = &object {
			inode.trunc(0)?;
		}
	}

	let file = OpenFile::new(object, readable, writable, flags);
	install(pid, file)
}

pub fn close(pid: Pid, fd: FileDescriptor) -> Result<()> {
	with_process(pid, |proc| {
		let slot = usize::try_from(fd)
			.ok()
			.and_then(|fd| proc.slots.get_mut(fd))
			.ok_or(Error::EBADF)?;
		slot.take().map(|_| ()).ok_or(Error::EBADF)
	})
}

// ── read / write / seek ─────────────────────────────────────────────────

fn check_len(len: usize) -> Result<()> {
	if len > i32::MAX as usize {
		Err(Error::EOVERFLOW)
	} else {
		Ok(())
	}
}

pub fn read(pid: Pid, fd: FileDescriptor, buf: &mut [u8]) -> Result<usize> {
	read_cancellable(pid, fd, buf, None)
}

pub fn read_cancellable(
	pid: Pid,
	fd: FileDescriptor,
	buf: &mut [u8],
	cancel: Option<&CancelToken>,
) -> Result<usize> {
	check_len(buf.len())?;
	let file = get_file(pid, fd)?;
	if !file.readable {
		return Err(Error::EBADF);
	}
	match &file.object {
		OpenObject::Regular { inode } => {
			let mut pos = file.pos.lock();
			let n = inode.read(*pos as u64, buf)?;
			*pos += n as i64;
			Ok(n)
		}
		OpenObject::Directory { .. } => Err(Error::EISDIR),
		OpenObject::CharDev { rdev, ops, .. } => ops.read(rdev.minor, buf),
		OpenObject::BlockDev { rdev, .. } => {
			let mut pos = file.pos.lock();
			blockcache::read(*rdev, *pos as u64, buf)?;
			*pos += buf.len() as i64;
			Ok(buf.len())
		}
		OpenObject::Pipe { pipe, end } => {
			if *end != PipeEnd::Read {
				return Err(Error::EBADF);
			}
			pipe.read(buf, file.nonblocking(), cancel)
		}
		OpenObject::Socket { socket } => socket.recv(buf, file.nonblocking(), cancel),
	}
}

pub fn write(pid: Pid, fd: FileDescriptor, buf: &[u8]) -> Result<usize> {
	write_cancellable(pid, fd, buf, None)
}

pub fn write_cancellable(
	pid: Pid,
	fd: FileDescriptor,
	buf: &[u8],
	cancel: Option<&CancelToken>,
) -> Result<usize> {
	check_len(buf.len())?;
	let file = get_file(pid, fd)?;
	if !file.writable {
		return Err(Error::EBADF);
	}
	match &file.object {
		OpenObject::Regular { inode } => {
			let mut pos = file.pos.lock();
			if file.status_flags().contains(OpenFlags::O_APPEND) {
				*pos = inode.size() as i64;
			}
			let n = inode.write(*pos as u64, buf)?;
			*pos += n as i64;
			Ok(n)
		}
		OpenObject::Directory { .. } => Err(Error::EISDIR),
		OpenObject::CharDev { rdev, ops, .. } => ops.write(rdev.minor, buf),
		OpenObject::BlockDev { rdev, .. } => {
			let mut pos = file.pos.lock();
			blockcache::write(*rdev, *pos as u64, buf)?;
			*pos += buf.len() as i64;
			Ok(buf.len())
		}
		OpenObject::Pipe { pipe, end } => {
			if *end != PipeEnd::Write {
				return Err(Error::EBADF);
			}
			pipe.write(buf, file.nonblocking(), cancel)
		}
		OpenObject::Socket { socket } => socket.send(buf, file.nonblocking(), cancel),
	}
}

pub fn lseek(pid: Pid, fd: FileDescriptor, offset: i64, whence: SeekWhence) -> Result<i64> {
	let file = get_file(pid, fd)?;
	let size = match &file.object {
		OpenObject::Regular { inode } | OpenObject::Directory { inode } => inode.size() as i64,
		OpenObject::BlockDev { .. } => i64::from(i32::MAX),
		_ => return Err(Error::ESPIPE),
	};
	let mut pos = file.pos.lock();
	let base = match whence {
		SeekWhence::Set => 0,
		SeekWhence::Cur => *pos,
		SeekWhence::End => size,
	};
	let next = base.checked_add(offset).ok_or(Error::EINVAL)?;
	if next < 0 || next > i64::from(i32::MAX) {
		return Err(Error::EINVAL);
	}
	*pos = next;
	Ok(next)
}

/// One directory entry per call, like a cursor-style `readdir`.
pub fn readdir(pid: Pid, fd: FileDescriptor) -> Result<Option<DirEntry>> {
	let file = get_file(pid, fd)?;
	let OpenObject::Directory { inode } = &file.object else {
		return Err(Error::ENOTDIR);
	};
	let mut pos = file.pos.lock();
	let entry = inode.get_direntry(*pos as usize)?;
	if entry.is_some() {
		*pos += 1;
	}
	Ok(entry)
}

pub fn ftruncate(pid: Pid, fd: FileDescriptor, length: i64) -> Result<()> {
	if length < 0 {
		return Err(Error::EINVAL);
	}
	let file = get_file(pid, fd)?;
	if !file.writable {
		return Err(Error::EINVAL);
	}
	match &file.object {
		OpenObject::Regular { inode } => inode.trunc(length as u64),
		OpenObject::Directory { .. } => Err(Error::EISDIR),
		_ => Err(Error::EINVAL),
	}
}

// ── dup / fcntl ─────────────────────────────────────────────────────────

pub fn dup(pid: Pid, fd: FileDescriptor) -> Result<FileDescriptor> {
	let file = get_file(pid, fd)?;
	install(pid, file)
}

pub fn dup2(pid: Pid, oldfd: FileDescriptor, newfd: FileDescriptor) -> Result<FileDescriptor> {
	let file = get_file(pid, oldfd)?;
	if oldfd == newfd {
		return Ok(newfd);
	}
	let new = usize::try_from(newfd).map_err(|_| Error::EBADF)?;
	if new >= FD_MAX {
		return Err(Error::EBADF);
	}
	with_process(pid, |proc| {
		if proc.slots.len() <= new {
			proc.slots.resize(new + 1, None);
		}
		// An occupied target is closed by the replacement.
		proc.slots[new] = Some(file);
		Ok(newfd)
	})
}

pub fn fcntl(pid: Pid, fd: FileDescriptor, cmd: i32, arg: i32) -> Result<i32> {
	let file = get_file(pid, fd)?;
	match cmd {
		F_DUPFD => {
			let min = usize::try_from(arg).map_err(|_| Error::EINVAL)?;
			if min >= FD_MAX {
				return Err(Error::EINVAL);
			}
			with_process(pid, |proc| install_from(proc, file.clone(), min))
		}
		F_GETFD => Ok(if file.cloexec.load(Ordering::Relaxed) {
			FD_CLOEXEC
		} else {
			0
		}),
		F_SETFD => {
			file.cloexec.store(arg & FD_CLOEXEC != 0, Ordering::Relaxed);
			Ok(0)
		}
		F_GETFL => {
			let acc = match (file.readable, file.writable) {
				(true, true) => OpenFlags::O_RDWR.bits(),
				(false, true) => OpenFlags::O_WRONLY.bits(),
				_ => 0,
			};
			Ok((file.status_flags().bits() | acc) as i32)
		}
		F_SETFL => {
			let requested = OpenFlags::from_bits_truncate(arg as u32) & SETTABLE_STATUS;
			let mut flags = file.flags.lock();
			*flags = (*flags - SETTABLE_STATUS) | requested;
			Ok(0)
		}
		_ => Err(Error::EINVAL),
	}
}

// ── metadata ────────────────────────────────────────────────────────────

pub fn stat(pid: Pid, path: &str) -> Result<FileAttr> {
	let inode = resolve_from(pid, AT_FDCWD, path)?;
	Ok(inode.attr())
}

pub fn fstat(pid: Pid, fd: FileDescriptor) -> Result<FileAttr> {
	let file = get_file(pid, fd)?;
	match &file.object {
		OpenObject::Pipe { .. } => Ok(FileAttr {
			mode: FileMode(fs::S_IFIFO | 0o600),
			..Default::default()
		}),
		OpenObject::Socket { .. } => Ok(FileAttr {
			mode: FileMode(fs::S_IFSOCK | 0o600),
			..Default::default()
		}),
		_ => {
			let inode = file.inode().ok_or(Error::EBADF)?;
			Ok(inode.attr())
		}
	}
}

pub fn chmod(pid: Pid, path: &str, mode: u32) -> Result<()> {
	let inode = resolve_from(pid, AT_FDCWD, path)?;
	inode.set_mode(FileMode(mode & 0o7777))
}

pub fn utime(pid: Pid, path: &str, atime: u64, mtime: u64) -> Result<()> {
	let inode = resolve_from(pid, AT_FDCWD, path)?;
	inode.utime(atime, mtime)
}

/// Set the file-creation mask, returning the previous one.
pub fn umask(pid: Pid, mask: u32) -> Result<u32> {
	with_process(pid, |proc| {
		let old = proc.umask;
		proc.umask = mask & 0o777;
		Ok(old)
	})
}

// ── working directory ───────────────────────────────────────────────────

pub fn chdir(pid: Pid, path: &str) -> Result<()> {
	let inode = resolve_from(pid, AT_FDCWD, path)?;
	if !inode.is_dir() {
		return Err(Error::ENOTDIR);
	}
	with_process(pid, |proc| {
		proc.cwd = inode;
		Ok(())
	})
}

pub fn fchdir(pid: Pid, fd: FileDescriptor) -> Result<()> {
	let file = get_file(pid, fd)?;
	let OpenObject::Directory { inode } = &file.object else {
		return Err(Error::ENOTDIR);
	};
	let inode = inode.clone();
	with_process(pid, |proc| {
		proc.cwd = inode;
		Ok(())
	})
}

pub fn getcwd(pid: Pid) -> Result<String> {
	let cwd = cwd_of(pid)?;
	fs::path_of(&cwd)
}

// ── pipes, devices, mounts ──────────────────────────────────────────────

pub fn pipe(pid: Pid) -> Result<(FileDescriptor, FileDescriptor)> {
	let fifo = Pipe::new();
	let read_end = OpenFile::new(
		OpenObject::Pipe {
			pipe: fifo.clone(),
			end: PipeEnd::Read,
		},
		true,
		false,
		OpenFlags::empty(),
	);
	let write_end = OpenFile::new(
		OpenObject::Pipe {
			pipe: fifo,
			end: PipeEnd::Write,
		},
		false,
		true,
		OpenFlags::empty(),
	);
	with_process(pid, |proc| {
		let rfd = install_from(proc, read_end.clone(), 0)?;
		match install_from(proc, write_end.clone(), 0) {
			Ok(wfd) => Ok((rfd, wfd)),
			Err(err) => {
				proc.slots[rfd as usize] = None;
				Err(err)
			}
		}
	})
}

pub fn isatty(pid: Pid, fd: FileDescriptor) -> Result<bool> {
	let file = get_file(pid, fd)?;
	Ok(matches!(
		&file.object,
		OpenObject::CharDev { rdev, .. } if rdev.major == TTY_MAJOR
	))
}

pub fn ioctl(pid: Pid, fd: FileDescriptor, cmd: u32, arg: usize) -> Result<i32> {
	let file = get_file(pid, fd)?;
	match &file.object {
		OpenObject::CharDev { rdev, ops, .. } => ops.ioctl(rdev.minor, cmd, arg),
		_ => Err(Error::ENOTTY),
	}
}

pub fn mount(pid: Pid, path: &str, device: DeviceId, fstype: &str) -> Result<()> {
	let inode = resolve_from(pid, AT_FDCWD, path)?;
	fs::mount(&inode, device, fstype)
}

pub fn unmount(pid: Pid, path: &str) -> Result<()> {
	let key = {
		let inode = resolve_from(pid, AT_FDCWD, path)?;
		(inode.dev(), inode.ino())
	};
	fs::unmount_at(key.0, key.1)
}

// ── sockets ─────────────────────────────────────────────────────────────

fn socket_of(file: &OpenFile) -> Result<&Arc<Socket>> {
	match &file.object {
		OpenObject::Socket { socket } => Ok(socket),
		_ => Err(Error::ENOTSOCK),
	}
}

pub fn socket(pid: Pid, domain: i32, sock_type: i32, protocol: i32) -> Result<FileDescriptor> {
	let sock = socket::create(domain, sock_type, protocol)?;
	let file = OpenFile::new(
		OpenObject::Socket { socket: sock },
		true,
		true,
		OpenFlags::empty(),
	);
	install(pid, file)
}

pub fn bind(pid: Pid, fd: FileDescriptor, addr: SockAddr) -> Result<()> {
	let file = get_file(pid, fd)?;
	socket_of(&file)?.bind(addr)
}

pub fn connect(pid: Pid, fd: FileDescriptor, addr: SockAddr) -> Result<()> {
	let file = get_file(pid, fd)?;
	let nonblocking = file.nonblocking();
	socket_of(&file)?.connect(addr, nonblocking, None)
}

pub fn listen(pid: Pid, fd: FileDescriptor, backlog: i32) -> Result<()> {
	let file = get_file(pid, fd)?;
	socket_of(&file)?.listen(backlog)
}

pub fn accept(pid: Pid, fd: FileDescriptor) -> Result<(FileDescriptor, SockAddr)> {
	let file = get_file(pid, fd)?;
	let nonblocking = file.nonblocking();
	let child = socket_of(&file)?.accept(nonblocking, None)?;
	let peer = child.peer_name()?;
	let child_file = OpenFile::new(
		OpenObject::Socket { socket: child },
		true,
		true,
		OpenFlags::empty(),
	);
	Ok((install(pid, child_file)?, peer))
}

pub fn send(pid: Pid, fd: FileDescriptor, buf: &[u8]) -> Result<usize> {
	let file = get_file(pid, fd)?;
	let nonblocking = file.nonblocking();
	socket_of(&file)?.send(buf, nonblocking, None)
}

pub fn sendto(pid: Pid, fd: FileDescriptor, buf: &[u8], dst: SockAddr) -> Result<usize> {
	let file = get_file(pid, fd)?;
	let nonblocking = file.nonblocking();
	socket_of(&file)?.send_to(buf, Some(dst), nonblocking, None)
}

pub fn recv(pid: Pid, fd: FileDescriptor, buf: &mut [u8]) -> Result<usize> {
	let file = get_file(pid, fd)?;
	let nonblocking = file.nonblocking();
	socket_of(&file)?.recv(buf, nonblocking, None)
}

pub fn recvfrom(pid: Pid, fd: FileDescriptor, buf: &mut [u8]) -> Result<(usize, SockAddr)> {
	let file = get_file(pid, fd)?;
	let nonblocking = file.nonblocking();
	socket_of(&file)?.recv_from(buf, nonblocking, None)
}

pub fn setsockopt(
	pid: Pid,
	fd: FileDescriptor,
	level: i32,
	name: i32,
	value: SockOptValue,
) -> Result<()> {
	let file = get_file(pid, fd)?;
	socket_of(&file)?.setsockopt(level, name, value)
}

pub fn getsockaddr(pid: Pid, fd: FileDescriptor) -> Result<SockAddr> {
	let file = get_file(pid, fd)?;
	Ok(socket_of(&file)?.local_name())
}

pub fn getpeeraddr(pid: Pid, fd: FileDescriptor) -> Result<SockAddr> {
	let file = get_file(pid, fd)?;
	socket_of(&file)?.peer_name()
}

pub fn shutdown(pid: Pid, fd: FileDescriptor, how: i32) -> Result<()> {
	let file = get_file(pid, fd)?;
	socket_of(&file)?.shutdown(how)
}

// ── select ──────────────────────────────────────────────────────────────

pub const FD_SETSIZE: usize = 1024;

/// The classic `fd_set` bit array.
#[derive(Clone)]
pub struct FdSet {
	bits: [u64; FD_SETSIZE / 64],
}

impl FdSet {
	pub const fn new() -> Self {
		Self {
			bits: [0; FD_SETSIZE / 64],
		}
	}

	pub fn set(&mut self, fd: FileDescriptor) {
		if let Ok(fd) = usize::try_from(fd) {
			if fd < FD_SETSIZE {
				self.bits[fd / 64] |= 1 << (fd % 64);
			}
		}
	}

	pub fn clear(&mut self, fd: FileDescriptor) {
		if let Ok(fd) = usize::try_from(fd) {
			if fd < FD_SETSIZE {
				self.bits[fd / 64] &= !(1 << (fd % 64));
			}
		}
	}

	pub fn is_set(&self, fd: FileDescriptor) -> bool {
		match usize::try_from(fd) {
			Ok(fd) if fd < FD_SETSIZE => self.bits[fd / 64] & (1 << (fd % 64)) != 0,
			_ => false,
		}
	}

	pub fn zero(&mut self) {
		self.bits = [0; FD_SETSIZE / 64];
	}

	pub fn count(&self) -> usize {
		self.bits.iter().map(|w| w.count_ones() as usize).sum()
	}
}

impl Default for FdSet {
	fn default() -> Self {
		Self::new()
	}
}

/// Immediate readiness of a non-socket open file.
fn quick_poll(file: &OpenFile, mask: PollEvents) -> PollEvents {
	let mut ready = PollEvents::empty();
	match &file.object {
		OpenObject::Pipe { pipe, end } => {
			let (r, w) = pipe.poll(*end);
			if r {
				ready |= PollEvents::IN;
			}
			if w {
				ready |= PollEvents::OUT;
			}
		}
		// Regular files and devices never block here.
		_ => ready = PollEvents::IN | PollEvents::OUT,
	}
	ready & mask
}

/// `select(nfds, readfds, writefds, errorfds, timeout)`.
///
/// Blocking readiness is driven by socket events; other descriptor
/// kinds report their instantaneous state. Exceptional conditions are
/// not tracked, so `errorfds` only ever comes back empty.
pub fn select(
	pid: Pid,
	nfds: i32,
	mut readfds: Option<&mut FdSet>,
	mut writefds: Option<&mut FdSet>,
	mut errorfds: Option<&mut FdSet>,
	timeout: Option<TimeVal>,
	cancel: Option<&CancelToken>,
) -> Result<i32> {
	if !(0..=FD_SETSIZE as i32).contains(&nfds) {
		return Err(Error::EINVAL);
	}
	let ticks = match timeout {
		Some(tv) => Some(tv.to_ticks().ok_or(Error::EINVAL)?),
		None => None,
	};

	struct Entry {
		fd: FileDescriptor,
		file: Arc<OpenFile>,
		mask: PollEvents,
	}
	let mut entries: Vec<Entry> = Vec::new();
	for fd in 0..nfds {
		let mut mask = PollEvents::empty();
		if readfds.as_ref().map(|s| s.is_set(fd)).unwrap_or(false) {
			mask |= PollEvents::IN;
		}
		if writefds.as_ref().map(|s| s.is_set(fd)).unwrap_or(false) {
			mask |= PollEvents::OUT;
		}
		if mask.is_empty() {
			continue;
		}
		entries.push(Entry {
			fd,
			file: get_file(pid, fd)?,
			mask,
		});
	}

	let mut ready: Vec<PollEvents> = vec![PollEvents::empty(); entries.len()];
	let mut any = false;
	let mut sockets: Vec<(usize, Arc<Socket>)> = Vec::new();
	for (i, entry) in entries.iter().enumerate() {
		match &entry.file.object {
			OpenObject::Socket { socket } => sockets.push((i, socket.clone())),
			_ => {
				ready[i] = quick_poll(&entry.file, entry.mask);
				any |= !ready[i].is_empty();
			}
		}
	}

	if any || ticks == Some(0) || (sockets.is_empty() && entries.is_empty()) {
		// Poll pass only; sockets still report their current state.
		for (i, socket) in &sockets {
			ready[*i] = socket.poll_ready(entries[*i].mask);
		}
	} else if sockets.is_empty() {
		// Nothing to wait on but time.
		let sem = Semaphore::new(0);
		let _ = sem.down(socket::deadline_from(ticks), cancel);
		for (i, entry) in entries.iter().enumerate() {
			ready[i] = quick_poll(&entry.file, entry.mask);
		}
	} else {
		let wait_entries: Vec<(Arc<Socket>, PollEvents)> = sockets
			.iter()
			.map(|(i, socket)| (socket.clone(), entries[*i].mask))
			.collect();
		let results = socket::select(&wait_entries, ticks, cancel)?;
		for ((i, _), result) in sockets.iter().zip(results) {
			ready[*i] = result;
		}
		// Re-check quick descriptors after the wait.
		for (i, entry) in entries.iter().enumerate() {
			if !matches!(entry.file.object, OpenObject::Socket { .. }) {
				ready[i] = quick_poll(&entry.file, entry.mask);
			}
		}
	}

	if let Some(set) = readfds.as_deref_mut() {
		set.zero();
	}
	if let Some(set) = writefds.as_deref_mut() {
		set.zero();
	}
	if let Some(set) = errorfds.as_deref_mut() {
		set.zero();
	}
	let mut count = 0;
	for (entry, events) in entries.iter().zip(ready) {
		if events.contains(PollEvents::IN) {
			if let Some(set) = readfds.as_deref_mut() {
				set.set(entry.fd);
				count += 1;
			}
		}
		if events.contains(PollEvents::OUT) {
			if let Some(set) = writefds.as_deref_mut() {
				set.set(entry.fd);
				count += 1;
			}
		}
	}
	Ok(count)
}
