// SPDX-License-Identifier: GPL-2.0

//! Device filesystem
//!
//! devfs registers as a virtual filesystem mounted at `/dev` (answering
//! `readdir`/`stat` from its own entry list) and installs the core device
//! nodes as legacy pseudo files, so `/dev` paths resolve through either
//! route. The null/zero/full/stdin/stdout/stderr nodes are pinned to
//! their fixed descriptors.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::crypto::ChaCha20Rng;
use crate::error::{Error, Result};
use crate::sync::Spinlock;

use super::{
	DeviceOps, FileType, FilesystemOps, FsFlags, FsPrivate, MountFlags, VfsDirent, VfsStat, Vfs,
	DEV_FULL_FD, DEV_NULL_FD, DEV_STDERR_FD, DEV_STDIN_FD, DEV_STDOUT_FD, DEV_ZERO_FD, S_IFBLK,
	S_IFCHR, S_IFDIR,
};

/// Listing type of a devfs entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DevKind {
	Char,
	Block,
}

struct DevEntry {
	name: String,
	kind: DevKind,
}

/// Names answering `/dev` listings through the mounted route. The block
/// device shim adds its nodes here as drivers register.
static DEV_ENTRIES: Spinlock<Vec<DevEntry>> = Spinlock::new(Vec::new());

/// Record a device name for `/dev` listings.
pub(super) fn add_entry(name: &str, kind: DevKind) {
	let mut entries = DEV_ENTRIES.lock();
	if entries.iter().any(|e| e.name == name) {
		return;
	}
	entries.push(DevEntry {
		name: String::from(name),
		kind,
	});
}

// ----------------------------------------------------------------------
// Device node implementations
// ----------------------------------------------------------------------

struct DevNull;

impl DeviceOps for DevNull {
	fn read(&self, _buf: &mut [u8], _pos: &mut i64) -> Result<usize> {
		Ok(0)
	}

	fn write(&self, buf: &[u8], _pos: &mut i64) -> Result<usize> {
		Ok(buf.len())
	}

	fn seek(&self, _offset: i64, _whence: i32, pos: &mut i64) -> Result<i64> {
		*pos = 0;
		Ok(0)
	}
}

struct DevZero;

impl DeviceOps for DevZero {
	fn read(&self, buf: &mut [u8], _pos: &mut i64) -> Result<usize> {
		buf.fill(0);
		Ok(buf.len())
	}

	fn write(&self, buf: &[u8], _pos: &mut i64) -> Result<usize> {
		Ok(buf.len())
	}
}

struct DevFull;

impl DeviceOps for DevFull {
	fn read(&self, buf: &mut [u8], _pos: &mut i64) -> Result<usize> {
		buf.fill(0);
		Ok(buf.len())
	}

	fn write(&self, _buf: &[u8], _pos: &mut i64) -> Result<usize> {
		Err(Error::ENOSPC)
	}
}

struct DevUrandom {
	rng: Spinlock<Option<ChaCha20Rng>>,
}

impl DevUrandom {
	fn new() -> Self {
		Self {
			rng: Spinlock::new(None),
		}
	}
}

impl DeviceOps for DevUrandom {
	fn read(&self, buf: &mut [u8], _pos: &mut i64) -> Result<usize> {
		let mut rng = self.rng.lock();
		let rng = rng.get_or_insert_with(|| ChaCha20Rng::new(crate::arch::hw_entropy()));
		rng.fill_bytes(buf);
		Ok(buf.len())
	}

	fn write(&self, _buf: &[u8], _pos: &mut i64) -> Result<usize> {
		Err(Error::EACCES)
	}
}

struct DevTty;

impl DeviceOps for DevTty {
	fn read(&self, _buf: &mut [u8], _pos: &mut i64) -> Result<usize> {
		// Keyboard input is routed by the shell, not the tty node.
		Ok(0)
	}

	fn write(&self, buf: &[u8], _pos: &mut i64) -> Result<usize> {
		for &byte in buf {
			crate::console::write_byte(byte);
		}
		Ok(buf.len())
	}
}

/// Placeholder behind the std descriptors; actual std traffic is handled
/// by descriptor number before device dispatch.
struct StdStream;

impl DeviceOps for StdStream {}

// ----------------------------------------------------------------------
// Mounted route
// ----------------------------------------------------------------------

struct DevfsOps;

impl FilesystemOps for DevfsOps {
	fn mount(&self, _device: Option<&str>, _data: Option<&str>) -> Result<FsPrivate> {
		Ok(Box::new(()))
	}

	fn readdir(&self, _state: &FsPrivate, path: &str, entries: &mut [VfsDirent]) -> Result<usize> {
		if !path.is_empty() {
			let entries_guard = DEV_ENTRIES.lock();
			return if entries_guard.iter().any(|e| e.name == path) {
				Err(Error::ENOTDIR)
			} else {
				Err(Error::ENOENT)
			};
		}

		let list = DEV_ENTRIES.lock();
		let mut count = 0;
		for entry in list.iter() {
			if count >= entries.len() {
				break;
			}
			entries[count] = VfsDirent {
				name: entry.name.clone(),
				d_type: FileType::Device,
			};
			count += 1;
		}
		Ok(count)
	}

	fn stat(&self, _state: &FsPrivate, path: &str) -> Result<VfsStat> {
		if path.is_empty() {
			return Ok(VfsStat {
				st_mode: S_IFDIR | 0o755,
				st_size: 0,
				st_blksize: 512,
				st_mtime: 0,
			});
		}
		let entries = DEV_ENTRIES.lock();
		let entry = entries.iter().find(|e| e.name == path).ok_or(Error::ENOENT)?;
		let st_mode = match entry.kind {
			DevKind::Char => S_IFCHR | 0o666,
			DevKind::Block => S_IFBLK | 0o660,
		};
		Ok(VfsStat {
			st_mode,
			st_size: 0,
			st_blksize: 512,
			st_mtime: 0,
		})
	}
}

/// Install the device nodes and mount devfs at `/dev`.
pub fn init(vfs: &mut Vfs) {
	let fixed: [(&str, i32, Arc<dyn DeviceOps>); 6] = [
		("/dev/null", DEV_NULL_FD, Arc::new(DevNull)),
		("/dev/zero", DEV_ZERO_FD, Arc::new(DevZero)),
		("/dev/full", DEV_FULL_FD, Arc::new(DevFull)),
		("/dev/stdin", DEV_STDIN_FD, Arc::new(StdStream)),
		("/dev/stdout", DEV_STDOUT_FD, Arc::new(StdStream)),
		("/dev/stderr", DEV_STDERR_FD, Arc::new(StdStream)),
	];
	for (path, fd, ops) in fixed {
		if let Err(e) = vfs.pseudo_register_with_fd(path, fd, ops) {
			crate::log_warn!("devfs: could not register {}: {}", path, e);
		}
	}

	vfs.pseudo_register("/dev/urandom", Arc::new(DevUrandom::new())).ok();
	vfs.pseudo_register("/dev/tty", Arc::new(DevTty)).ok();

	vfs.link_std_fd(0, "/dev/stdin");
	vfs.link_std_fd(1, "/dev/stdout");
	vfs.link_std_fd(2, "/dev/stderr");

	for name in ["null", "zero", "full", "urandom", "tty", "stdin", "stdout", "stderr"] {
		add_entry(name, DevKind::Char);
	}

	vfs.register_filesystem("devfs", Arc::new(DevfsOps), FsFlags::VIRTUAL | FsFlags::NODEV)
		.ok();
	if let Err(e) = vfs.mount_fs("devfs", "/dev", None, MountFlags::empty(), None) {
		crate::log_warn!("devfs: mount failed: {}", e);
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::fs::OpenFlags;

	fn vfs() -> Vfs {
		let mut vfs = Vfs::new();
		vfs.init();
		vfs
	}

	#[test]
	fn null_reads_empty_and_swallows_writes() {
		let mut vfs = vfs();
		let fd = vfs.open("/dev/null", OpenFlags::READ | OpenFlags::WRITE).unwrap();
		let mut buf = [0xffu8; 8];
		assert_eq!(vfs.readfd(fd, &mut buf).unwrap(), 0);
		assert_eq!(vfs.writefd(fd, b"discard").unwrap(), 7);
		vfs.close(fd).unwrap();
	}

	#[test]
	fn zero_fills_the_buffer() {
		let mut vfs = vfs();
		let fd = vfs.open("/dev/zero", OpenFlags::READ).unwrap();
		let mut buf = [0xffu8; 16];
		assert_eq!(vfs.readfd(fd, &mut buf).unwrap(), 16);
		assert!(buf.iter().all(|&b| b == 0));
		vfs.close(fd).unwrap();
	}

	#[test]
	fn full_rejects_writes_with_enospc() {
		let mut vfs = vfs();
		let fd = vfs.open("/dev/full", OpenFlags::READ | OpenFlags::WRITE).unwrap();
		assert_eq!(vfs.writefd(fd, b"x"), Err(Error::ENOSPC));
		let mut buf = [0xffu8; 4];
		assert_eq!(vfs.readfd(fd, &mut buf).unwrap(), 4);
		assert!(buf.iter().all(|&b| b == 0));
		vfs.close(fd).unwrap();
	}

	#[test]
	fn urandom_reads_bytes_and_rejects_writes() {
		let mut vfs = vfs();
		let fd = vfs.open("/dev/urandom", OpenFlags::READ | OpenFlags::WRITE).unwrap();

		let mut a = [0u8; 64];
		let mut b = [0u8; 64];
		assert_eq!(vfs.readfd(fd, &mut a).unwrap(), 64);
		assert_eq!(vfs.readfd(fd, &mut b).unwrap(), 64);
		// Consecutive draws from the stream do not repeat.
		assert_ne!(a, b);

		assert_eq!(vfs.writefd(fd, b"seed"), Err(Error::EACCES));
		vfs.close(fd).unwrap();
	}

	#[test]
	fn dev_listing_contains_core_nodes() {
		let vfs = vfs();
		let mut entries = alloc::vec![VfsDirent::empty(); 32];
		let n = vfs.readdir("/dev", &mut entries).unwrap();
		let names: Vec<&str> = entries[..n].iter().map(|e| e.name.as_str()).collect();
		for expected in ["null", "zero", "full", "urandom", "tty"] {
			assert!(names.contains(&expected), "missing {}", expected);
		}
	}

	#[test]
	fn fixed_descriptors_work_without_open() {
		let mut vfs = vfs();
		let mut buf = [0xffu8; 4];
		// /dev/zero is pre-bound to its well-known descriptor.
		assert_eq!(vfs.readfd(DEV_ZERO_FD, &mut buf).unwrap(), 4);
		assert!(buf.iter().all(|&b| b == 0));
		assert_eq!(vfs.writefd(DEV_FULL_FD, b"x"), Err(Error::ENOSPC));
	}
}
