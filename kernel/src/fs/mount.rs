// SPDX-License-Identifier: GPL-2.0

//! Filesystem drivers and mount points

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use core::any::Any;

use bitflags::bitflags;

use crate::error::{Error, Result};

use super::{OpenFlags, VfsDirent, VfsStat};

bitflags! {
	/// Capabilities a filesystem driver declares at registration.
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	pub struct FsFlags: u32 {
		const READONLY = 0x01;
		/// Mounts without a backing block device.
		const NODEV = 0x02;
		const VIRTUAL = 0x04;
	}
}

bitflags! {
	/// Per-mount options.
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	pub struct MountFlags: u32 {
		const READONLY = 0x01;
	}
}

/// Per-mount driver state, produced by [`FilesystemOps::mount`].
pub type FsPrivate = Box<dyn Any + Send + Sync>;

/// Per-handle driver state, produced by [`FilesystemOps::open`].
pub type HandlePrivate = Box<dyn Any + Send>;

/// The generic filesystem operations interface.
///
/// Optional operations default to [`Error::Unsupported`]; the VFS
/// dispatcher falls back to the legacy slot table exactly when a mounted
/// filesystem reports that.
pub trait FilesystemOps: Send + Sync {
	/// Build the per-mount state for a new mount of this filesystem.
	fn mount(&self, device: Option<&str>, data: Option<&str>) -> Result<FsPrivate>;

	fn unmount(&self, state: &mut FsPrivate) -> Result<()> {
		let _ = state;
		Ok(())
	}

	fn open(&self, state: &FsPrivate, path: &str, flags: OpenFlags) -> Result<HandlePrivate> {
		let _ = (state, path, flags);
		Err(Error::Unsupported)
	}

	fn close(&self, state: &FsPrivate, handle: &mut HandlePrivate) -> Result<()> {
		let _ = (state, handle);
		Ok(())
	}

	fn read(
		&self,
		state: &FsPrivate,
		handle: &mut HandlePrivate,
		pos: &mut i64,
		buf: &mut [u8],
	) -> Result<usize> {
		let _ = (state, handle, pos, buf);
		Err(Error::Unsupported)
	}

	fn write(
		&self,
		state: &FsPrivate,
		handle: &mut HandlePrivate,
		pos: &mut i64,
		buf: &[u8],
	) -> Result<usize> {
		let _ = (state, handle, pos, buf);
		Err(Error::Unsupported)
	}

	fn seek(
		&self,
		state: &FsPrivate,
		handle: &mut HandlePrivate,
		pos: &mut i64,
		offset: i64,
		whence: i32,
	) -> Result<i64> {
		let _ = (state, handle, pos, offset, whence);
		Err(Error::Unsupported)
	}

	fn mkdir(&self, state: &FsPrivate, path: &str) -> Result<()> {
		let _ = (state, path);
		Err(Error::Unsupported)
	}

	fn rmdir(&self, state: &FsPrivate, path: &str) -> Result<()> {
		let _ = (state, path);
		Err(Error::Unsupported)
	}

	fn readdir(&self, state: &FsPrivate, path: &str, entries: &mut [VfsDirent]) -> Result<usize> {
		let _ = (state, path, entries);
		Err(Error::Unsupported)
	}

	fn stat(&self, state: &FsPrivate, path: &str) -> Result<VfsStat> {
		let _ = (state, path);
		Err(Error::Unsupported)
	}

	fn unlink(&self, state: &FsPrivate, path: &str) -> Result<()> {
		let _ = (state, path);
		Err(Error::Unsupported)
	}

	fn ioctl(
		&self,
		state: &FsPrivate,
		handle: &mut HandlePrivate,
		request: u64,
		arg: usize,
	) -> Result<i32> {
		let _ = (state, handle, request, arg);
		Err(Error::Unsupported)
	}

	fn sync(&self, state: &FsPrivate) -> Result<()> {
		let _ = state;
		Err(Error::Unsupported)
	}
}

/// A registered filesystem driver.
pub struct Filesystem {
	pub name: String,
	pub ops: Arc<dyn FilesystemOps>,
	pub flags: FsFlags,
}

/// One active mount.
///
/// `ref_count` counts open handles rooted here; a non-zero count blocks
/// unmounting.
pub(super) struct Mount {
	pub mount_point: String,
	pub device: String,
	pub fs_index: usize,
	pub fs_private: FsPrivate,
	pub flags: MountFlags,
	pub ref_count: u32,
}
