// SPDX-License-Identifier: GPL-2.0

//! Error handling types and utilities

use core::fmt;

/// Kernel error type.
///
/// Every fallible surface in the kernel (VFS, FAT32, block layer, NVM
/// syscalls) speaks this type; the raw negative errno form only appears at
/// the bytecode syscall boundary via [`Error::to_errno`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
	/// Operation not permitted (EPERM)
	EPERM,
	/// No such file or directory (ENOENT)
	ENOENT,
	/// No such process (ESRCH)
	ESRCH,
	/// I/O error (EIO)
	EIO,
	/// Bad file descriptor (EBADF)
	EBADF,
	/// Out of memory (ENOMEM)
	ENOMEM,
	/// Permission denied (EACCES)
	EACCES,
	/// Resource busy (EBUSY)
	EBUSY,
	/// File exists (EEXIST)
	EEXIST,
	/// No such device (ENODEV)
	ENODEV,
	/// Not a directory (ENOTDIR)
	ENOTDIR,
	/// Is a directory (EISDIR)
	EISDIR,
	/// Invalid argument (EINVAL)
	EINVAL,
	/// Too many open files (EMFILE)
	EMFILE,
	/// Inappropriate ioctl for device (ENOTTY)
	ENOTTY,
	/// No space left on device (ENOSPC)
	ENOSPC,
	/// Read-only filesystem or device (EROFS)
	EROFS,
	/// Directory not empty (ENOTEMPTY)
	ENOTEMPTY,
	/// Operation not implemented by this driver (ENOSYS).
	///
	/// Filesystem and device traits use this as the explicit "no such
	/// operation" marker; the VFS dispatcher falls back to the legacy
	/// table when a mounted filesystem reports it.
	Unsupported,
}

impl Error {
	/// Convert the error to a negative POSIX errno value.
	pub fn to_errno(self) -> i32 {
		match self {
			Error::EPERM => -1,
			Error::ENOENT => -2,
			Error::ESRCH => -3,
			Error::EIO => -5,
			Error::EBADF => -9,
			Error::ENOMEM => -12,
			Error::EACCES => -13,
			Error::EBUSY => -16,
			Error::EEXIST => -17,
			Error::ENODEV => -19,
			Error::ENOTDIR => -20,
			Error::EISDIR => -21,
			Error::EINVAL => -22,
			Error::EMFILE => -24,
			Error::ENOTTY => -25,
			Error::ENOSPC => -28,
			Error::EROFS => -30,
			Error::Unsupported => -38,
			Error::ENOTEMPTY => -39,
		}
	}
}

impl fmt::Display for Error {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let msg = match self {
			Error::EPERM => "Operation not permitted",
			Error::ENOENT => "No such file or directory",
			Error::ESRCH => "No such process",
			Error::EIO => "Input/output error",
			Error::EBADF => "Bad file descriptor",
			Error::ENOMEM => "Out of memory",
			Error::EACCES => "Permission denied",
			Error::EBUSY => "Resource busy",
			Error::EEXIST => "File exists",
			Error::ENODEV => "No such device",
			Error::ENOTDIR => "Not a directory",
			Error::EISDIR => "Is a directory",
			Error::EINVAL => "Invalid argument",
			Error::EMFILE => "Too many open files",
			Error::ENOTTY => "Inappropriate ioctl for device",
			Error::ENOSPC => "No space left on device",
			Error::EROFS => "Read-only filesystem",
			Error::Unsupported => "Operation not supported",
			Error::ENOTEMPTY => "Directory not empty",
		};
		write!(f, "{}", msg)
	}
}

/// Kernel result type
pub type Result<T> = core::result::Result<T, Error>;
