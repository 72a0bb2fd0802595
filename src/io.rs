//! Crate-wide error type.
//!
//! Every fallible kernel-side API returns [`Result`]. The variants carry
//! their errno value as discriminant, so the user-visible wrapper of a
//! system call can report `-err.errno()` without a translation table.

use alloc::collections::TryReserveError;
use core::result;

use thiserror::Error;

#[allow(clippy::upper_case_acronyms)]
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Error {
	#[error("operation not permitted")]
	EPERM = crate::errno::EPERM,
	#[error("no such file or directory")]
	ENOENT = crate::errno::ENOENT,
	#[error("interrupted system call")]
	EINTR = crate::errno::EINTR,
	#[error("I/O error")]
	EIO = crate::errno::EIO,
	#[error("bad file number")]
	EBADF = crate::errno::EBADF,
	#[error("try again")]
	EAGAIN = crate::errno::EAGAIN,
	#[error("out of memory")]
	ENOMEM = crate::errno::ENOMEM,
	#[error("permission denied")]
	EACCES = crate::errno::EACCES,
	#[error("device or resource busy")]
	EBUSY = crate::errno::EBUSY,
	#[error("file exists")]
	EEXIST = crate::errno::EEXIST,
	#[error("no such device")]
	ENODEV = crate::errno::ENODEV,
	#[error("not a directory")]
	ENOTDIR = crate::errno::ENOTDIR,
	#[error("is a directory")]
	EISDIR = crate::errno::EISDIR,
	#[error("invalid argument")]
	EINVAL = crate::errno::EINVAL,
	#[error("too many open files")]
	EMFILE = crate::errno::EMFILE,
	#[error("not a typewriter")]
	ENOTTY = crate::errno::ENOTTY,
	#[error("no space left on device")]
	ENOSPC = crate::errno::ENOSPC,
	#[error("illegal seek")]
	ESPIPE = crate::errno::ESPIPE,
	#[error("read-only file system")]
	EROFS = crate::errno::EROFS,
	#[error("broken pipe")]
	EPIPE = crate::errno::EPIPE,
	#[error("function not implemented")]
	ENOSYS = crate::errno::ENOSYS,
	#[error("directory not empty")]
	ENOTEMPTY = crate::errno::ENOTEMPTY,
	#[error("value too large for defined data type")]
	EOVERFLOW = crate::errno::EOVERFLOW,
	#[error("socket operation on non-socket")]
	ENOTSOCK = crate::errno::ENOTSOCK,
	#[error("destination address required")]
	EDESTADDRREQ = crate::errno::EDESTADDRREQ,
	#[error("message too long")]
	EMSGSIZE = crate::errno::EMSGSIZE,
	#[error("protocol not supported")]
	EPROTONOSUPPORT = crate::errno::EPROTONOSUPPORT,
	#[error("operation not supported on transport endpoint")]
	EOPNOTSUPP = crate::errno::EOPNOTSUPP,
	#[error("address family not supported by protocol")]
	EAFNOSUPPORT = crate::errno::EAFNOSUPPORT,
	#[error("address already in use")]
	EADDRINUSE = crate::errno::EADDRINUSE,
	#[error("cannot assign requested address")]
	EADDRNOTAVAIL = crate::errno::EADDRNOTAVAIL,
	#[error("network is unreachable")]
	ENETUNREACH = crate::errno::ENETUNREACH,
	#[error("connection reset by peer")]
	ECONNRESET = crate::errno::ECONNRESET,
	#[error("no buffer space available")]
	ENOBUFS = crate::errno::ENOBUFS,
	#[error("transport endpoint is already connected")]
	EISCONN = crate::errno::EISCONN,
	#[error("transport endpoint is not connected")]
	ENOTCONN = crate::errno::ENOTCONN,
	#[error("cannot send after transport endpoint shutdown")]
	ESHUTDOWN = crate::errno::ESHUTDOWN,
	#[error("connection timed out")]
	ETIMEDOUT = crate::errno::ETIMEDOUT,
	#[error("connection refused")]
	ECONNREFUSED = crate::errno::ECONNREFUSED,
	#[error("no route to host")]
	EHOSTUNREACH = crate::errno::EHOSTUNREACH,
	#[error("operation already in progress")]
	EALREADY = crate::errno::EALREADY,
	#[error("operation now in progress")]
	EINPROGRESS = crate::errno::EINPROGRESS,
}

impl Error {
	/// The errno value of this error, as the C library would see it.
	pub fn errno(self) -> i32 {
		self as i32
	}
}

impl From<TryReserveError> for Error {
	fn from(_value: TryReserveError) -> Self {
		Self::ENOMEM
	}
}

pub type Result<T> = result::Result<T, Error>;
