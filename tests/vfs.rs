//! VFS, descriptor-table and pipe behavior through the POSIX surface.

mod common;

use std::sync::Arc;

use common::serial;
use limpet::fd::{self, FdSet, OpenFlags, SeekWhence, O_RDONLY};
use limpet::fs::devices::{self, CharDevOps, TTY_MAJOR};
use limpet::fs::{self, DeviceId, FileMode};
use limpet::io::{Error, Result};
use limpet::time::TimeVal;

const PID: fd::Pid = 1;

fn setup() {
	limpet::init();
	fd::process_init(PID).unwrap();
}

fn mkdir(path: &str) {
	let (dir, name) = fs::split_path(path).unwrap();
	let parent = fs::resolve_at(None, if dir.is_empty() { "/" } else { dir }).unwrap();
	parent.create(name, FileMode::dir(0o755)).unwrap();
}

#[test]
fn path_resolution_rules() {
	let _serial = serial();
	setup();
	mkdir("/etc");
	mkdir("/etc/rc.d");

	let fd1 = fd::open(PID, "/etc/rc.d/boot", OpenFlags::O_CREAT | OpenFlags::O_RDWR, 0o644).unwrap();
	assert_eq!(fd::write(PID, fd1, b"startup"), Ok(7));
	fd::close(PID, fd1).unwrap();

	// `/` is idempotent and `p/.` equals `p` for directories.
	let root_a = fs::resolve_at(None, "/").unwrap();
	let root_b = fs::resolve_at(None, "/").unwrap();
	assert_eq!((root_a.dev(), root_a.ino()), (root_b.dev(), root_b.ino()));
	let d1 = fs::resolve_at(None, "/etc/rc.d").unwrap();
	let d2 = fs::resolve_at(None, "/etc/rc.d/.").unwrap();
	assert_eq!((d1.dev(), d1.ino()), (d2.dev(), d2.ino()));

	// `..` walks up, extra slashes collapse.
	let back = fs::resolve_at(None, "/etc/rc.d/../..//etc/./rc.d").unwrap();
	assert_eq!((back.dev(), back.ino()), (d1.dev(), d1.ino()));
	// `..` at the root stays at the root.
	let still_root = fs::resolve_at(None, "/..").unwrap();
	assert_eq!(still_root.ino(), root_a.ino());

	// Components through a non-directory fail.
	assert_eq!(
		fs::resolve_at(None, "/etc/rc.d/boot/nope").err(),
		Some(Error::ENOTDIR)
	);
	assert_eq!(fs::resolve_at(None, "/missing").err(), Some(Error::ENOENT));

	// Relative paths resolve against the CWD.
	fd::chdir(PID, "/etc").unwrap();
	let fd2 = fd::open(PID, "rc.d/boot", O_RDONLY, 0).unwrap();
	let mut buf = [0u8; 16];
	assert_eq!(fd::read(PID, fd2, &mut buf), Ok(7));
	assert_eq!(&buf[..7], b"startup");
	fd::close(PID, fd2).unwrap();
	assert_eq!(fd::getcwd(PID).unwrap(), "/etc");
	fd::chdir(PID, "rc.d").unwrap();
	assert_eq!(fd::getcwd(PID).unwrap(), "/etc/rc.d");
	fd::chdir(PID, "/").unwrap();
	assert_eq!(fd::getcwd(PID).unwrap(), "/");
}

#[test]
fn file_io_seek_truncate_append() {
	let _serial = serial();
	setup();

	let fd1 = fd::open(PID, "/notes", OpenFlags::O_CREAT | OpenFlags::O_RDWR, 0o644).unwrap();
	assert_eq!(fd::write(PID, fd1, b"hello world"), Ok(11));
	assert_eq!(fd::lseek(PID, fd1, 0, SeekWhence::Set), Ok(0));
	let mut buf = [0u8; 32];
	assert_eq!(fd::read(PID, fd1, &mut buf), Ok(11));
	assert_eq!(&buf[..11], b"hello world");

	// SEEK_CUR and SEEK_END arithmetic.
	assert_eq!(fd::lseek(PID, fd1, -5, SeekWhence::End), Ok(6));
	assert_eq!(fd::read(PID, fd1, &mut buf[..5]), Ok(5));
	assert_eq!(&buf[..5], b"world");
	assert_eq!(fd::lseek(PID, fd1, -2, SeekWhence::Cur), Ok(9));

	// Range checks: negative and beyond INT32_MAX fail.
	assert_eq!(
		fd::lseek(PID, fd1, i64::from(i32::MAX) + 1, SeekWhence::Set),
		Err(Error::EINVAL)
	);
	assert_eq!(fd::lseek(PID, fd1, -1, SeekWhence::Set), Err(Error::EINVAL));

	// Sparse write past the end zero-fills the gap.
	assert_eq!(fd::lseek(PID, fd1, 20, SeekWhence::Set), Ok(20));
	assert_eq!(fd::write(PID, fd1, b"x"), Ok(1));
	assert_eq!(fd::fstat(PID, fd1).unwrap().size, 21);
	assert_eq!(fd::lseek(PID, fd1, 11, SeekWhence::Set), Ok(11));
	assert_eq!(fd::read(PID, fd1, &mut buf[..9]), Ok(9));
	assert_eq!(&buf[..9], [0u8; 9]);

	// ftruncate shrinks; directories and read-only descriptors are
	// rejected.
	fd::ftruncate(PID, fd1, 5).unwrap();
	assert_eq!(fd::fstat(PID, fd1).unwrap().size, 5);
	let ro = fd::open(PID, "/notes", O_RDONLY, 0).unwrap();
	assert_eq!(fd::ftruncate(PID, ro, 0), Err(Error::EINVAL));
	let dirfd = fd::open(PID, "/", O_RDONLY, 0).unwrap();
	assert_eq!(fd::ftruncate(PID, dirfd, 0), Err(Error::EISDIR));

	// O_APPEND always writes at the end.
	let ap = fd::open(PID, "/notes", OpenFlags::O_WRONLY | OpenFlags::O_APPEND, 0).unwrap();
	assert_eq!(fd::write(PID, ap, b"!"), Ok(1));
	assert_eq!(fd::fstat(PID, ap).unwrap().size, 6);

	// O_TRUNC empties on open for writing.
	let tr = fd::open(PID, "/notes", OpenFlags::O_WRONLY | OpenFlags::O_TRUNC, 0).unwrap();
	assert_eq!(fd::fstat(PID, tr).unwrap().size, 0);

	for f in [fd1, ro, dirfd, ap, tr] {
		fd::close(PID, f).unwrap();
	}
}

#[test]
fn descriptor_table_semantics() {
	let _serial = serial();
	setup();

	let fd1 = fd::open(PID, "/data", OpenFlags::O_CREAT | OpenFlags::O_RDWR, 0o600).unwrap();
	// Lowest free slot: closing and reopening reuses it.
	let probe = fd::open(PID, "/data", O_RDONLY, 0).unwrap();
	fd::close(PID, probe).unwrap();
	let again = fd::open(PID, "/data", O_RDONLY, 0).unwrap();
	assert_eq!(again, probe);

	// dup shares the open file, including the position.
	assert_eq!(fd::write(PID, fd1, b"abcdef"), Ok(6));
	let dup = fd::dup(PID, fd1).unwrap();
	assert_eq!(fd::lseek(PID, dup, 0, SeekWhence::Set), Ok(0));
	let mut buf = [0u8; 3];
	assert_eq!(fd::read(PID, fd1, &mut buf), Ok(3));
	assert_eq!(&buf, b"abc");
	assert_eq!(fd::lseek(PID, dup, 0, SeekWhence::Cur), Ok(3));

	// dup2 closes its target slot first; same-fd dup2 is a no-op.
	assert_eq!(fd::dup2(PID, fd1, again).unwrap(), again);
	assert_eq!(fd::lseek(PID, again, 0, SeekWhence::Cur), Ok(3));
	assert_eq!(fd::dup2(PID, fd1, fd1).unwrap(), fd1);
	assert_eq!(fd::dup2(PID, 99, 7), Err(Error::EBADF));

	// fcntl: cloexec and status flags.
	assert_eq!(fd::fcntl(PID, fd1, fd::F_GETFD, 0).unwrap(), 0);
	fd::fcntl(PID, fd1, fd::F_SETFD, fd::FD_CLOEXEC).unwrap();
	assert_eq!(fd::fcntl(PID, fd1, fd::F_GETFD, 0).unwrap(), fd::FD_CLOEXEC);
	fd::fcntl(PID, fd1, fd::F_SETFL, OpenFlags::O_APPEND.bits() as i32).unwrap();
	let fl = fd::fcntl(PID, fd1, fd::F_GETFL, 0).unwrap() as u32;
	assert!(OpenFlags::from_bits_truncate(fl).contains(OpenFlags::O_APPEND));
	// Only O_APPEND and O_NONBLOCK are settable; access mode is not.
	fd::fcntl(PID, fd1, fd::F_SETFL, 0).unwrap();
	let fl = fd::fcntl(PID, fd1, fd::F_GETFL, 0).unwrap() as u32;
	assert!(!OpenFlags::from_bits_truncate(fl).contains(OpenFlags::O_APPEND));
	assert!(OpenFlags::from_bits_truncate(fl).contains(OpenFlags::O_RDWR));

	// F_DUPFD honors the minimum.
	let high = fd::fcntl(PID, fd1, fd::F_DUPFD, 10).unwrap();
	assert!(high >= 10);

	// fork duplicates the table; both processes read the shared file.
	fd::process_clone(PID, 2).unwrap();
	fd::close(PID, fd1).unwrap();
	assert_eq!(fd::lseek(2, fd1, 0, SeekWhence::Set), Ok(0));
	let mut buf6 = [0u8; 6];
	assert_eq!(fd::read(2, fd1, &mut buf6), Ok(6));
	assert_eq!(&buf6, b"abcdef");
	fd::fs_close_all(2);
	assert_eq!(fd::read(2, fd1, &mut buf6), Err(Error::EINVAL));
}

#[test]
fn openat_and_open_flags() {
	let _serial = serial();
	setup();
	mkdir("/work");

	let dirfd = fd::open(PID, "/work", O_RDONLY, 0).unwrap();
	let f = fd::openat(PID, dirfd, "file", OpenFlags::O_CREAT | OpenFlags::O_RDWR, 0o644).unwrap();
	assert_eq!(fd::write(PID, f, b"at"), Ok(2));
	fd::close(PID, f).unwrap();
	assert_eq!(fd::stat(PID, "/work/file").unwrap().size, 2);

	// The CWD sentinel behaves exactly like open.
	fd::chdir(PID, "/work").unwrap();
	let g = fd::openat(PID, fd::AT_FDCWD, "file", O_RDONLY, 0).unwrap();
	let mut buf = [0u8; 2];
	assert_eq!(fd::read(PID, g, &mut buf), Ok(2));
	fd::close(PID, g).unwrap();

	assert_eq!(
		fd::openat(PID, dirfd, "file", OpenFlags::O_CREAT | OpenFlags::O_EXCL, 0o644),
		Err(Error::EEXIST)
	);
	assert_eq!(
		fd::open(PID, "/work/file", OpenFlags::O_DIRECTORY, 0),
		Err(Error::ENOTDIR)
	);
	// Directories cannot be opened for writing.
	assert_eq!(
		fd::open(PID, "/work", OpenFlags::O_RDWR, 0),
		Err(Error::EISDIR)
	);
	fd::close(PID, dirfd).unwrap();
}

#[test]
fn readdir_enumerates_entries() {
	let _serial = serial();
	setup();
	mkdir("/spool");
	for name in ["alpha", "beta"] {
		let f = fd::open(
			PID,
			&format!("/spool/{name}"),
			OpenFlags::O_CREAT | OpenFlags::O_WRONLY,
			0o644,
		)
		.unwrap();
		fd::close(PID, f).unwrap();
	}

	let dirfd = fd::open(PID, "/spool", O_RDONLY, 0).unwrap();
	let mut names = Vec::new();
	while let Some(entry) = fd::readdir(PID, dirfd).unwrap() {
		names.push(entry.name);
	}
	assert_eq!(names, [".", "..", "alpha", "beta"]);
	// Rewind via lseek and a non-directory readdir error.
	fd::lseek(PID, dirfd, 0, SeekWhence::Set).unwrap();
	assert_eq!(fd::readdir(PID, dirfd).unwrap().unwrap().name, ".");
	fd::close(PID, dirfd).unwrap();
	let f = fd::open(PID, "/spool/alpha", O_RDONLY, 0).unwrap();
	assert_eq!(fd::readdir(PID, f), Err(Error::ENOTDIR));
	fd::close(PID, f).unwrap();
}

#[test]
fn mount_crossing_and_busy_unmount() {
	let _serial = serial();
	setup();
	mkdir("/tmp");
	let dev_b = DeviceId::new(8, 1);

	fd::mount(PID, "/tmp", dev_b, "ramfs").unwrap();

	// New files land on the mounted device.
	let f = fd::open(PID, "/tmp/test", OpenFlags::O_CREAT | OpenFlags::O_RDWR, 0o644).unwrap();
	let attr = fd::stat(PID, "/tmp/test").unwrap();
	assert_eq!(attr.dev, dev_b);
	let root_b = fd::stat(PID, "/tmp").unwrap();
	assert_eq!(root_b.dev, dev_b);
	assert_eq!(root_b.ino, 1);

	// `..` crosses back into the parent filesystem.
	let up = fd::stat(PID, "/tmp/..").unwrap();
	let root_a = fd::stat(PID, "/").unwrap();
	assert_eq!((up.dev, up.ino), (root_a.dev, root_a.ino));

	// getcwd shows the path across the boundary.
	fd::chdir(PID, "/tmp").unwrap();
	assert_eq!(fd::getcwd(PID).unwrap(), "/tmp");

	// Open files and CWDs below the mount keep it busy.
	assert_eq!(fd::unmount(PID, "/tmp"), Err(Error::EBUSY));
	fd::chdir(PID, "/").unwrap();
	assert_eq!(fd::unmount(PID, "/tmp"), Err(Error::EBUSY));
	fd::close(PID, f).unwrap();
	fd::unmount(PID, "/tmp").unwrap();

	// After the unmount the old directory shows through again.
	let plain = fd::stat(PID, "/tmp").unwrap();
	assert_eq!(plain.dev, root_a.dev);

	// Double mount on the same point is rejected.
	fd::mount(PID, "/tmp", dev_b, "ramfs").unwrap();
	assert_eq!(
		fd::mount(PID, "/tmp/..", DeviceId::new(8, 2), "nosuchfs"),
		Err(Error::ENODEV)
	);
	assert_eq!(fd::mount(PID, "/", dev_b, "ramfs"), Err(Error::EBUSY));
	fd::unmount(PID, "/tmp").unwrap();
}

#[test]
fn pipe_through_descriptors() {
	let _serial = serial();
	setup();

	let (rfd, wfd) = fd::pipe(PID).unwrap();
	assert_eq!(fd::write(PID, wfd, b"through the pipe"), Ok(16));
	let mut buf = [0u8; 32];
	assert_eq!(fd::read(PID, rfd, &mut buf), Ok(16));
	assert_eq!(&buf[..16], b"through the pipe");

	// Wrong-direction access.
	assert_eq!(fd::read(PID, wfd, &mut buf), Err(Error::EBADF));
	assert_eq!(fd::write(PID, rfd, b"x"), Err(Error::EBADF));
	// Seeking a pipe is illegal.
	assert_eq!(fd::lseek(PID, rfd, 0, SeekWhence::Set), Err(Error::ESPIPE));

	// Nonblocking empty read.
	fd::fcntl(PID, rfd, fd::F_SETFL, OpenFlags::O_NONBLOCK.bits() as i32).unwrap();
	assert_eq!(fd::read(PID, rfd, &mut buf), Err(Error::EAGAIN));

	// A dup of the write end keeps the pipe alive; EOF needs both
	// gone.
	let wdup = fd::dup(PID, wfd).unwrap();
	fd::close(PID, wfd).unwrap();
	assert_eq!(fd::write(PID, wdup, b"last"), Ok(4));
	fd::close(PID, wdup).unwrap();
	assert_eq!(fd::read(PID, rfd, &mut buf), Ok(4));
	assert_eq!(fd::read(PID, rfd, &mut buf), Ok(0));

	// No readers: writing breaks the pipe.
	let (rfd2, wfd2) = fd::pipe(PID).unwrap();
	fd::close(PID, rfd2).unwrap();
	assert_eq!(fd::write(PID, wfd2, b"x"), Err(Error::EPIPE));
	fd::close(PID, rfd).unwrap();
	fd::close(PID, wfd2).unwrap();

	// fstat reports a FIFO.
	let (rfd3, wfd3) = fd::pipe(PID).unwrap();
	assert_eq!(
		fd::fstat(PID, rfd3).unwrap().mode.file_type(),
		fs::S_IFIFO
	);
	fd::close(PID, rfd3).unwrap();
	fd::close(PID, wfd3).unwrap();
}

#[test]
fn umask_chmod_utime_stat() {
	let _serial = serial();
	setup();

	assert_eq!(fd::umask(PID, 0o077).unwrap(), 0o022);
	let f = fd::open(PID, "/secret", OpenFlags::O_CREAT | OpenFlags::O_RDWR, 0o666).unwrap();
	assert_eq!(fd::stat(PID, "/secret").unwrap().mode.perm(), 0o600);

	fd::chmod(PID, "/secret", 0o640).unwrap();
	let attr = fd::stat(PID, "/secret").unwrap();
	assert_eq!(attr.mode.perm(), 0o640);
	assert!(attr.mode.is_file());

	fd::utime(PID, "/secret", 111, 222).unwrap();
	let attr = fd::stat(PID, "/secret").unwrap();
	assert_eq!(attr.atime, 111);
	assert_eq!(attr.mtime, 222);
	fd::close(PID, f).unwrap();
}

/// TTY stand-in: echoes writes back on reads, answers one ioctl.
struct EchoTty {
	last: std::sync::Mutex<Vec<u8>>,
}

impl CharDevOps for EchoTty {
	fn read(&self, _minor: u32, buf: &mut [u8]) -> Result<usize> {
		let last = self.last.lock().unwrap();
		let n = buf.len().min(last.len());
		buf[..n].copy_from_slice(&last[..n]);
		Ok(n)
	}

	fn write(&self, _minor: u32, buf: &[u8]) -> Result<usize> {
		*self.last.lock().unwrap() = buf.to_vec();
		Ok(buf.len())
	}

	fn ioctl(&self, _minor: u32, cmd: u32, _arg: usize) -> Result<i32> {
		if cmd == 0x5401 {
			Ok(1)
		} else {
			Err(Error::ENOTTY)
		}
	}
}

#[test]
fn device_nodes_and_isatty() {
	let _serial = serial();
	setup();
	mkdir("/dev");

	devices::register_chardev(
		TTY_MAJOR,
		Arc::new(EchoTty {
			last: std::sync::Mutex::new(Vec::new()),
		}),
	)
	.unwrap();

	let dev_dir = fs::resolve_at(None, "/dev").unwrap();
	dev_dir
		.mknod("tty0", FileMode(fs::S_IFCHR | 0o620), DeviceId::new(TTY_MAJOR, 0))
		.unwrap();

	let tty = fd::open(PID, "/dev/tty0", OpenFlags::O_RDWR, 0).unwrap();
	assert!(fd::isatty(PID, tty).unwrap());
	assert_eq!(fd::write(PID, tty, b"console"), Ok(7));
	let mut buf = [0u8; 16];
	assert_eq!(fd::read(PID, tty, &mut buf), Ok(7));
	assert_eq!(&buf[..7], b"console");
	assert_eq!(fd::ioctl(PID, tty, 0x5401, 0), Ok(1));
	assert_eq!(fd::ioctl(PID, tty, 0x9999, 0), Err(Error::ENOTTY));

	// Everything else is not a tty.
	let plain = fd::open(PID, "/plain", OpenFlags::O_CREAT | OpenFlags::O_RDWR, 0o644).unwrap();
	assert!(!fd::isatty(PID, plain).unwrap());
	assert_eq!(fd::ioctl(PID, plain, 0x5401, 0), Err(Error::ENOTTY));

	fd::close(PID, tty).unwrap();
	fd::close(PID, plain).unwrap();
}

#[test]
fn unlink_semantics() {
	let _serial = serial();
	setup();
	mkdir("/work");
	let f = fd::open(PID, "/work/junk", OpenFlags::O_CREAT | OpenFlags::O_WRONLY, 0o644).unwrap();
	fd::close(PID, f).unwrap();

	let work = fs::resolve_at(None, "/work").unwrap();
	// rmdir flag on a file, unlink on a directory, then the real
	// removals.
	assert_eq!(
		work.unlink("junk", limpet::fs::ramfs::UNLINK_RMDIR).err(),
		Some(Error::ENOTDIR)
	);
	mkdir("/work/sub");
	assert_eq!(work.unlink("sub", 0).err(), Some(Error::EISDIR));
	let sub = fs::resolve_at(None, "/work/sub").unwrap();
	sub.create("inner", FileMode::file(0o644)).unwrap();
	assert_eq!(
		work.unlink("sub", limpet::fs::ramfs::UNLINK_RMDIR).err(),
		Some(Error::ENOTEMPTY)
	);
	sub.unlink("inner", 0).unwrap();
	drop(sub);
	work.unlink("sub", limpet::fs::ramfs::UNLINK_RMDIR).unwrap();
	work.unlink("junk", 0).unwrap();
	assert_eq!(fd::stat(PID, "/work/junk").err(), Some(Error::ENOENT));
}

#[test]
fn select_over_descriptors() {
	let _serial = serial();
	setup();

	// Empty sets with a zero timeout return immediately with 0.
	let mut empty = FdSet::new();
	assert_eq!(
		fd::select(
			PID,
			0,
			Some(&mut empty),
			None,
			None,
			Some(TimeVal::new(0, 0)),
			None
		),
		Ok(0)
	);

	let (rfd, wfd) = fd::pipe(PID).unwrap();
	let mut rset = FdSet::new();
	let mut wset = FdSet::new();
	rset.set(rfd);
	wset.set(wfd);
	let n = fd::select(
		PID,
		wfd.max(rfd) + 1,
		Some(&mut rset),
		Some(&mut wset),
		None,
		Some(TimeVal::new(0, 0)),
		None,
	)
	.unwrap();
	// The empty pipe is writable but not readable.
	assert_eq!(n, 1);
	assert!(!rset.is_set(rfd));
	assert!(wset.is_set(wfd));

	fd::write(PID, wfd, b"wake").unwrap();
	let mut rset = FdSet::new();
	rset.set(rfd);
	let n = fd::select(
		PID,
		rfd + 1,
		Some(&mut rset),
		None,
		None,
		Some(TimeVal::new(0, 0)),
		None,
	)
	.unwrap();
	assert_eq!(n, 1);
	assert!(rset.is_set(rfd));

	fd::close(PID, rfd).unwrap();
	fd::close(PID, wfd).unwrap();
}
