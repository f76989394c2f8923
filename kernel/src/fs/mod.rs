// SPDX-License-Identifier: GPL-2.0

//! Virtual filesystem
//!
//! Two layers cooperate here. Registered filesystem drivers are mounted
//! at path prefixes and receive operations via [`FilesystemOps`]; a flat
//! legacy slot table catches everything no mount claims (pseudo device
//! files, the boot directory skeleton, scratch files). Every path-taking
//! operation first resolves the longest matching mount and falls back to
//! the legacy table when the mounted driver does not implement the
//! operation.

pub mod blockdev;
pub mod devfs;
pub mod fat32;
pub mod file;
pub mod mount;
pub mod path;
pub mod procfs;

use alloc::string::String;
use alloc::sync::Arc;

use bitflags::bitflags;

use crate::error::{Error, Result};
use crate::sync::Spinlock;

pub use file::{DeviceOps, FileType, VfsNode};
pub use mount::{Filesystem, FilesystemOps, FsFlags, FsPrivate, HandlePrivate, MountFlags};

use file::Handle;
use mount::Mount;

pub const MAX_FILES: usize = 256;
pub const MAX_HANDLES: usize = 64;
pub const MAX_FILENAME: usize = 256;
pub const MAX_FILE_SIZE: usize = 128 * 1024 * 1024;
pub const MAX_FS_NAME: usize = 32;
pub const MAX_REGISTERED_FS: usize = 16;
pub const MAX_MOUNTS: usize = 32;

/// Fixed descriptors for the core device files.
pub const DEV_NULL_FD: i32 = 1000;
pub const DEV_ZERO_FD: i32 = 1001;
pub const DEV_FULL_FD: i32 = 1002;
pub const DEV_STDIN_FD: i32 = 1003;
pub const DEV_STDOUT_FD: i32 = 1004;
pub const DEV_STDERR_FD: i32 = 1005;

const RESERVED_FDS: [i32; 6] = [
	DEV_NULL_FD,
	DEV_ZERO_FD,
	DEV_FULL_FD,
	DEV_STDIN_FD,
	DEV_STDOUT_FD,
	DEV_STDERR_FD,
];

pub const SEEK_SET: i32 = 0;
pub const SEEK_CUR: i32 = 1;
pub const SEEK_END: i32 = 2;

/// File mode bits for [`VfsStat::st_mode`].
pub const S_IFMT: u32 = 0xF000;
pub const S_IFREG: u32 = 0x8000;
pub const S_IFDIR: u32 = 0x4000;
pub const S_IFCHR: u32 = 0x2000;
pub const S_IFBLK: u32 = 0x6000;

bitflags! {
	/// Open mode and behavior bits.
	#[derive(Debug, Clone, Copy, PartialEq, Eq)]
	pub struct OpenFlags: u32 {
		const READ = 0x01;
		const WRITE = 0x02;
		const CREAT = 0x04;
		const APPEND = 0x08;
	}
}

/// File metadata.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VfsStat {
	pub st_mode: u32,
	pub st_size: i64,
	pub st_blksize: u32,
	pub st_mtime: u64,
}

/// One directory listing entry.
#[derive(Debug, Clone)]
pub struct VfsDirent {
	pub name: String,
	pub d_type: FileType,
}

impl VfsDirent {
	pub fn empty() -> Self {
		Self {
			name: String::new(),
			d_type: FileType::File,
		}
	}
}

/// The whole VFS state: legacy slots, handles, registered filesystems and
/// the mount table.
pub struct Vfs {
	nodes: [Option<VfsNode>; MAX_FILES],
	handles: [Option<Handle>; MAX_HANDLES],
	filesystems: [Option<Filesystem>; MAX_REGISTERED_FS],
	mounts: [Option<Mount>; MAX_MOUNTS],
	next_fd: i32,
}

impl Vfs {
	pub const fn new() -> Self {
		const NO_NODE: Option<VfsNode> = None;
		const NO_HANDLE: Option<Handle> = None;
		const NO_FS: Option<Filesystem> = None;
		const NO_MOUNT: Option<Mount> = None;
		Self {
			nodes: [NO_NODE; MAX_FILES],
			handles: [NO_HANDLE; MAX_HANDLES],
			filesystems: [NO_FS; MAX_REGISTERED_FS],
			mounts: [NO_MOUNT; MAX_MOUNTS],
			next_fd: 3,
		}
	}

	/// Reset all tables, claim the std descriptors and build the boot
	/// directory skeleton, then bring up devfs and procfs.
	pub fn init(&mut self) {
		*self = Self::new();

		self.handles[0] = Some(Handle::std(0, OpenFlags::READ));
		self.handles[1] = Some(Handle::std(1, OpenFlags::WRITE));
		self.handles[2] = Some(Handle::std(2, OpenFlags::WRITE));

		for dir in ["/home", "/tmp", "/var", "/var/log", "/var/cache", "/dev"] {
			self.mkdir(dir).ok();
		}

		devfs::init(self);
		procfs::init(self);
	}

	// ------------------------------------------------------------------
	// Lookup helpers
	// ------------------------------------------------------------------

	fn find_node(&self, name: &str) -> Option<usize> {
		self.nodes
			.iter()
			.position(|n| n.as_ref().is_some_and(|n| n.name == name))
	}

	fn free_node_slot(&self) -> Option<usize> {
		self.nodes.iter().position(|n| n.is_none())
	}

	fn handle_index(&self, fd: i32) -> Option<usize> {
		self.handles
			.iter()
			.position(|h| h.as_ref().is_some_and(|h| h.fd == fd))
	}

	fn free_handle_slot(&self) -> Option<usize> {
		self.handles.iter().position(|h| h.is_none())
	}

	pub fn exists(&self, path: &str) -> bool {
		self.find_node(path).is_some()
	}

	pub fn is_dir(&self, path: &str) -> bool {
		self.find_node(path)
			.is_some_and(|i| self.nodes[i].as_ref().unwrap().ftype == FileType::Dir)
	}

	/// Number of occupied legacy slots.
	pub fn node_count(&self) -> usize {
		self.nodes.iter().flatten().count()
	}

	fn mount_ops(&self, mount_index: usize) -> Arc<dyn FilesystemOps> {
		let fs_index = self.mounts[mount_index].as_ref().unwrap().fs_index;
		self.filesystems[fs_index].as_ref().unwrap().ops.clone()
	}

	/// Longest-prefix mount lookup.
	///
	/// A prefix only matches at a path boundary: the byte after it must be
	/// `/` or the end of the path (the root mount matches everything).
	/// Returns the mount index and the path relative to the mount point.
	pub(super) fn find_mount(&self, path: &str) -> Option<(usize, String)> {
		let mut best: Option<(usize, usize)> = None;
		for (i, slot) in self.mounts.iter().enumerate() {
			let Some(mount) = slot else { continue };
			let mp = mount.mount_point.as_str();
			let matches = if mp == "/" {
				path.starts_with('/')
			} else {
				path.starts_with(mp)
					&& (path.len() == mp.len() || path.as_bytes()[mp.len()] == b'/')
			};
			if matches && best.map_or(true, |(_, len)| mp.len() > len) {
				best = Some((i, mp.len()));
			}
		}
		best.map(|(i, len)| (i, String::from(path[len..].trim_start_matches('/'))))
	}

	fn allocate_fd(&mut self) -> Option<i32> {
		let limit = MAX_HANDLES as i32 + 3;
		let in_use = |vfs: &Self, fd: i32| vfs.handle_index(fd).is_some();

		for fd in self.next_fd..limit {
			if RESERVED_FDS.contains(&fd) || in_use(self, fd) {
				continue;
			}
			self.next_fd = if fd + 1 >= limit { 3 } else { fd + 1 };
			return Some(fd);
		}
		for fd in 3..limit {
			if RESERVED_FDS.contains(&fd) || in_use(self, fd) {
				continue;
			}
			self.next_fd = fd + 1;
			return Some(fd);
		}
		None
	}

	// ------------------------------------------------------------------
	// Legacy table management
	// ------------------------------------------------------------------

	pub fn mkdir(&mut self, dirname: &str) -> Result<()> {
		if dirname.is_empty() || dirname.len() >= MAX_FILENAME {
			return Err(Error::EINVAL);
		}

		if let Some((mi, rel)) = self.find_mount(dirname) {
			let ops = self.mount_ops(mi);
			let mount = self.mounts[mi].as_ref().unwrap();
			match ops.mkdir(&mount.fs_private, &rel) {
				Err(Error::Unsupported) => {}
				other => return other,
			}
		}

		if let Some(i) = self.find_node(dirname) {
			return if self.nodes[i].as_ref().unwrap().ftype == FileType::Dir {
				Ok(())
			} else {
				Err(Error::EEXIST)
			};
		}

		let slot = self.free_node_slot().ok_or(Error::ENOMEM)?;
		self.nodes[slot] = Some(VfsNode::dir(dirname));
		Ok(())
	}

	pub fn create(&mut self, filename: &str, data: &[u8]) -> Result<()> {
		if filename.is_empty() || filename.len() >= MAX_FILENAME || data.len() > MAX_FILE_SIZE {
			return Err(Error::EINVAL);
		}

		if let Some(i) = self.find_node(filename) {
			let node = self.nodes[i].as_mut().unwrap();
			return match node.ftype {
				FileType::Dir => Err(Error::EISDIR),
				FileType::Device => Err(Error::EEXIST),
				FileType::File => {
					node.data = data.to_vec();
					Ok(())
				}
			};
		}

		let slot = self.free_node_slot().ok_or(Error::ENOMEM)?;
		self.nodes[slot] = Some(VfsNode::file(filename, data));
		Ok(())
	}

	pub fn delete(&mut self, filename: &str) -> Result<()> {
		if let Some((mi, rel)) = self.find_mount(filename) {
			let ops = self.mount_ops(mi);
			let mount = self.mounts[mi].as_ref().unwrap();
			match ops.unlink(&mount.fs_private, &rel) {
				Err(Error::Unsupported) => {}
				other => return other,
			}
		}

		let index = self.find_node(filename).ok_or(Error::ENOENT)?;
		if self.nodes[index].as_ref().unwrap().ftype == FileType::Dir {
			return Err(Error::EISDIR);
		}
		if self.handles.iter().flatten().any(|h| h.node == Some(index)) {
			return Err(Error::EBUSY);
		}
		self.nodes[index] = None;
		Ok(())
	}

	pub fn rmdir(&mut self, dirname: &str) -> Result<()> {
		if dirname.is_empty() || dirname.len() >= MAX_FILENAME {
			return Err(Error::EINVAL);
		}

		if let Some((mi, rel)) = self.find_mount(dirname) {
			let ops = self.mount_ops(mi);
			let mount = self.mounts[mi].as_ref().unwrap();
			match ops.rmdir(&mount.fs_private, &rel) {
				Err(Error::Unsupported) => {}
				other => return other,
			}
		}

		if dirname == "/" {
			return Err(Error::EBUSY);
		}

		let index = self.find_node(dirname).ok_or(Error::ENOENT)?;
		if self.nodes[index].as_ref().unwrap().ftype != FileType::Dir {
			return Err(Error::ENOTDIR);
		}
		if self.handles.iter().flatten().any(|h| h.node == Some(index)) {
			return Err(Error::EBUSY);
		}

		let prefix = path::normalize_dir(dirname);
		let has_descendants = self.nodes.iter().flatten().any(|n| {
			n.name.len() > prefix.len() + 1
				&& n.name.starts_with(prefix)
				&& n.name.as_bytes()[prefix.len()] == b'/'
		});
		if has_descendants {
			return Err(Error::ENOTEMPTY);
		}

		self.nodes[index] = None;
		Ok(())
	}

	/// Install a device slot at `path`.
	pub fn pseudo_register(&mut self, path: &str, ops: Arc<dyn DeviceOps>) -> Result<usize> {
		if path.is_empty() || path.len() >= MAX_FILENAME {
			return Err(Error::EINVAL);
		}

		if let Some(i) = self.find_node(path) {
			let node = self.nodes[i].as_mut().unwrap();
			if node.ftype == FileType::Dir {
				return Err(Error::EISDIR);
			}
			node.ftype = FileType::Device;
			node.device = Some(ops);
			return Ok(i);
		}

		let slot = self.free_node_slot().ok_or(Error::ENOMEM)?;
		self.nodes[slot] = Some(VfsNode::device(path, ops));
		Ok(slot)
	}

	/// Install a device slot and bind it to a fixed descriptor.
	pub fn pseudo_register_with_fd(
		&mut self,
		path: &str,
		fixed_fd: i32,
		ops: Arc<dyn DeviceOps>,
	) -> Result<i32> {
		if self.handle_index(fixed_fd).is_some() {
			return Err(Error::EBUSY);
		}

		let node_index = self.pseudo_register(path, ops)?;
		let slot = self.free_handle_slot().ok_or(Error::EMFILE)?;

		let flags = if path.ends_with("/stdout") || path.ends_with("/stderr") {
			OpenFlags::WRITE
		} else if path.ends_with("/stdin") {
			OpenFlags::READ
		} else {
			OpenFlags::READ | OpenFlags::WRITE
		};

		self.handles[slot] = Some(Handle {
			fd: fixed_fd,
			node: Some(node_index),
			mount: None,
			rel_path: String::new(),
			position: 0,
			flags,
			fs_data: None,
		});
		Ok(fixed_fd)
	}

	/// Re-point one of the std descriptors (0/1/2) at a device slot.
	pub fn link_std_fd(&mut self, std_fd: i32, dev_path: &str) {
		let Some(node_index) = self.find_node(dev_path) else {
			return;
		};
		if !(0..3).contains(&std_fd) {
			return;
		}
		if let Some(handle) = self.handles[std_fd as usize].as_mut() {
			handle.node = Some(node_index);
		}
	}

	// ------------------------------------------------------------------
	// Filesystem registry and mounts
	// ------------------------------------------------------------------

	pub fn register_filesystem(
		&mut self,
		name: &str,
		ops: Arc<dyn FilesystemOps>,
		flags: FsFlags,
	) -> Result<()> {
		if name.is_empty() || name.len() >= MAX_FS_NAME {
			return Err(Error::EINVAL);
		}
		if self.find_filesystem(name).is_some() {
			return Err(Error::EEXIST);
		}
		let slot = self
			.filesystems
			.iter()
			.position(|f| f.is_none())
			.ok_or(Error::ENOMEM)?;
		self.filesystems[slot] = Some(Filesystem {
			name: String::from(name),
			ops,
			flags,
		});
		Ok(())
	}

	pub fn unregister_filesystem(&mut self, name: &str) -> Result<()> {
		let index = self.find_filesystem(name).ok_or(Error::ENOENT)?;
		if self.mounts.iter().flatten().any(|m| m.fs_index == index) {
			return Err(Error::EBUSY);
		}
		self.filesystems[index] = None;
		Ok(())
	}

	pub fn find_filesystem(&self, name: &str) -> Option<usize> {
		self.filesystems
			.iter()
			.position(|f| f.as_ref().is_some_and(|f| f.name == name))
	}

	pub fn mount_fs(
		&mut self,
		fs_name: &str,
		mount_point: &str,
		device: Option<&str>,
		flags: MountFlags,
		data: Option<&str>,
	) -> Result<()> {
		if mount_point.is_empty() || mount_point.len() >= MAX_FILENAME {
			return Err(Error::EINVAL);
		}
		let fs_index = self.find_filesystem(fs_name).ok_or(Error::ENODEV)?;

		let mount_point = path::normalize_dir(mount_point);
		if self
			.mounts
			.iter()
			.flatten()
			.any(|m| m.mount_point == mount_point)
		{
			return Err(Error::EBUSY);
		}
		let slot = self
			.mounts
			.iter()
			.position(|m| m.is_none())
			.ok_or(Error::ENOMEM)?;

		let ops = self.filesystems[fs_index].as_ref().unwrap().ops.clone();
		let fs_private = ops.mount(device, data)?;

		self.mounts[slot] = Some(Mount {
			mount_point: String::from(mount_point),
			device: String::from(device.unwrap_or("")),
			fs_index,
			fs_private,
			flags,
			ref_count: 0,
		});
		crate::log_info!("mounted {} on {}", fs_name, mount_point);
		Ok(())
	}

	pub fn unmount(&mut self, mount_point: &str) -> Result<()> {
		let mount_point = path::normalize_dir(mount_point);
		let index = self
			.mounts
			.iter()
			.position(|m| m.as_ref().is_some_and(|m| m.mount_point == mount_point))
			.ok_or(Error::ENOENT)?;

		if self.mounts[index].as_ref().unwrap().ref_count > 0 {
			return Err(Error::EBUSY);
		}

		let ops = self.mount_ops(index);
		let mut mount = self.mounts[index].take().unwrap();
		if let Err(e) = ops.unmount(&mut mount.fs_private) {
			// The mount is gone either way; the driver just could not
			// flush its state.
			crate::log_warn!("unmount of {} reported {}", mount_point, e);
		}
		if mount.device.is_empty() {
			crate::log_info!("unmounted {}", mount_point);
		} else {
			crate::log_info!("unmounted {} (device {})", mount_point, mount.device);
		}
		Ok(())
	}

	// ------------------------------------------------------------------
	// Descriptor operations
	// ------------------------------------------------------------------

	pub fn open(&mut self, filename: &str, flags: OpenFlags) -> Result<i32> {
		if filename.is_empty() || filename.len() >= MAX_FILENAME {
			return Err(Error::EINVAL);
		}

		if let Some((mi, rel)) = self.find_mount(filename) {
			let ops = self.mount_ops(mi);
			let mount = self.mounts[mi].as_ref().unwrap();
			match ops.open(&mount.fs_private, &rel, flags) {
				Err(Error::Unsupported) => {}
				Err(e) => return Err(e),
				Ok(fs_data) => {
					let slot = self.free_handle_slot().ok_or(Error::EMFILE)?;
					let fd = self.allocate_fd().ok_or(Error::EMFILE)?;
					self.handles[slot] = Some(Handle {
						fd,
						node: None,
						mount: Some(mi),
						rel_path: rel,
						position: 0,
						flags,
						fs_data: Some(fs_data),
					});
					self.mounts[mi].as_mut().unwrap().ref_count += 1;
					return Ok(fd);
				}
			}
		}

		let node_index = match self.find_node(filename) {
			Some(i) => i,
			None if flags.contains(OpenFlags::CREAT) => {
				self.create(filename, &[])?;
				self.find_node(filename).ok_or(Error::ENOENT)?
			}
			None => return Err(Error::ENOENT),
		};

		let slot = self.free_handle_slot().ok_or(Error::EMFILE)?;
		let fd = self.allocate_fd().ok_or(Error::EMFILE)?;
		self.handles[slot] = Some(Handle {
			fd,
			node: Some(node_index),
			mount: None,
			rel_path: String::new(),
			position: 0,
			flags,
			fs_data: None,
		});
		Ok(fd)
	}

	pub fn close(&mut self, fd: i32) -> Result<()> {
		if fd < 3 {
			// The std descriptors are never closed.
			return Ok(());
		}
		let index = self.handle_index(fd).ok_or(Error::EBADF)?;
		let mut handle = self.handles[index].take().unwrap();

		if let Some(mi) = handle.mount {
			let ops = self.mount_ops(mi);
			let mount = self.mounts[mi].as_ref().unwrap();
			if let Some(fs_data) = handle.fs_data.as_mut() {
				ops.close(&mount.fs_private, fs_data).ok();
			}
			crate::log_trace!("closed fd {} ({})", fd, handle.rel_path);
			let mount = self.mounts[mi].as_mut().unwrap();
			mount.ref_count = mount.ref_count.saturating_sub(1);
		}
		Ok(())
	}

	pub fn readfd(&mut self, fd: i32, buf: &mut [u8]) -> Result<usize> {
		let index = self.handle_index(fd).ok_or(Error::EBADF)?;
		if !self.handles[index].as_ref().unwrap().flags.contains(OpenFlags::READ) {
			return Err(Error::EACCES);
		}
		if fd == 0 || fd == DEV_STDIN_FD {
			// No keyboard line discipline behind stdin yet.
			return Ok(0);
		}

		if let Some(mi) = self.handles[index].as_ref().unwrap().mount {
			let ops = self.mount_ops(mi);
			let mut fs_data = self.handles[index]
				.as_mut()
				.unwrap()
				.fs_data
				.take()
				.ok_or(Error::EBADF)?;
			let mut pos = self.handles[index].as_ref().unwrap().position;
			let mount = self.mounts[mi].as_ref().unwrap();
			let result = ops.read(&mount.fs_private, &mut fs_data, &mut pos, buf);
			let handle = self.handles[index].as_mut().unwrap();
			handle.fs_data = Some(fs_data);
			handle.position = pos;
			return result;
		}

		let node_index = self.handles[index].as_ref().unwrap().node.ok_or(Error::EBADF)?;
		let node = self.nodes[node_index].as_ref().ok_or(Error::EBADF)?;

		if node.ftype == FileType::Device {
			let dev = node.device.clone().ok_or(Error::EACCES)?;
			let mut pos = self.handles[index].as_ref().unwrap().position;
			let result = match dev.read(buf, &mut pos) {
				Err(Error::Unsupported) => Err(Error::EACCES),
				other => other,
			};
			self.handles[index].as_mut().unwrap().position = pos;
			return result;
		}

		let pos = self.handles[index].as_ref().unwrap().position.max(0) as usize;
		if pos >= node.data.len() {
			return Ok(0);
		}
		let to_read = buf.len().min(node.data.len() - pos);
		buf[..to_read].copy_from_slice(&node.data[pos..pos + to_read]);
		self.handles[index].as_mut().unwrap().position += to_read as i64;
		Ok(to_read)
	}

	pub fn writefd(&mut self, fd: i32, buf: &[u8]) -> Result<usize> {
		let index = self.handle_index(fd).ok_or(Error::EBADF)?;
		if !self.handles[index].as_ref().unwrap().flags.contains(OpenFlags::WRITE) {
			return Err(Error::EACCES);
		}
		if fd == 1 || fd == 2 || fd == DEV_STDOUT_FD || fd == DEV_STDERR_FD {
			// Console traffic is emitted by the syscall layer; the
			// descriptor itself just accepts the bytes.
			return Ok(buf.len());
		}

		if let Some(mi) = self.handles[index].as_ref().unwrap().mount {
			if self.mounts[mi]
				.as_ref()
				.unwrap()
				.flags
				.contains(MountFlags::READONLY)
			{
				return Err(Error::EROFS);
			}
			let ops = self.mount_ops(mi);
			let mut fs_data = self.handles[index]
				.as_mut()
				.unwrap()
				.fs_data
				.take()
				.ok_or(Error::EBADF)?;
			let mut pos = self.handles[index].as_ref().unwrap().position;
			let mount = self.mounts[mi].as_ref().unwrap();
			let result = ops.write(&mount.fs_private, &mut fs_data, &mut pos, buf);
			let handle = self.handles[index].as_mut().unwrap();
			handle.fs_data = Some(fs_data);
			handle.position = pos;
			return result;
		}

		let node_index = self.handles[index].as_ref().unwrap().node.ok_or(Error::EBADF)?;
		let node_type = self.nodes[node_index].as_ref().ok_or(Error::EBADF)?.ftype;

		if node_type == FileType::Device {
			let dev = self.nodes[node_index]
				.as_ref()
				.unwrap()
				.device
				.clone()
				.ok_or(Error::EACCES)?;
			let mut pos = self.handles[index].as_ref().unwrap().position;
			let result = match dev.write(buf, &mut pos) {
				Err(Error::Unsupported) => Err(Error::EACCES),
				other => other,
			};
			self.handles[index].as_mut().unwrap().position = pos;
			return result;
		}

		let append = self.handles[index].as_ref().unwrap().flags.contains(OpenFlags::APPEND);
		let node = self.nodes[node_index].as_mut().unwrap();
		let mut pos = if append {
			node.data.len()
		} else {
			self.handles[index].as_ref().unwrap().position.max(0) as usize
		};

		let mut count = buf.len();
		if pos + count > MAX_FILE_SIZE {
			count = MAX_FILE_SIZE - pos.min(MAX_FILE_SIZE);
		}
		if count == 0 {
			return Err(Error::ENOSPC);
		}

		let node = self.nodes[node_index].as_mut().unwrap();
		if pos + count > node.data.len() {
			node.data.resize(pos + count, 0);
		}
		node.data[pos..pos + count].copy_from_slice(&buf[..count]);
		pos += count;
		self.handles[index].as_mut().unwrap().position = pos as i64;
		Ok(count)
	}

	pub fn seek(&mut self, fd: i32, offset: i64, whence: i32) -> Result<i64> {
		let index = self.handle_index(fd).ok_or(Error::EBADF)?;

		if let Some(mi) = self.handles[index].as_ref().unwrap().mount {
			let ops = self.mount_ops(mi);
			let mut fs_data = self.handles[index]
				.as_mut()
				.unwrap()
				.fs_data
				.take()
				.ok_or(Error::EBADF)?;
			let mut pos = self.handles[index].as_ref().unwrap().position;
			let mount = self.mounts[mi].as_ref().unwrap();
			let result = ops.seek(&mount.fs_private, &mut fs_data, &mut pos, offset, whence);
			let result = match result {
				// No driver seek; plain cursor arithmetic.
				Err(Error::Unsupported) => match whence {
					SEEK_SET => {
						pos = offset.max(0);
						Ok(pos)
					}
					SEEK_CUR => {
						pos = (pos + offset).max(0);
						Ok(pos)
					}
					_ => Err(Error::EINVAL),
				},
				other => other,
			};
			let handle = self.handles[index].as_mut().unwrap();
			handle.fs_data = Some(fs_data);
			handle.position = pos;
			return result;
		}

		let node_index = self.handles[index].as_ref().unwrap().node.ok_or(Error::EBADF)?;
		let node = self.nodes[node_index].as_ref().ok_or(Error::EBADF)?;

		if node.ftype == FileType::Device {
			if let Some(dev) = node.device.clone() {
				let mut pos = self.handles[index].as_ref().unwrap().position;
				match dev.seek(offset, whence, &mut pos) {
					Err(Error::Unsupported) => {}
					other => {
						self.handles[index].as_mut().unwrap().position = pos;
						return other;
					}
				}
			}
		}

		let size = node.size() as i64;
		let current = self.handles[index].as_ref().unwrap().position;
		let mut new_pos = match whence {
			SEEK_SET => offset,
			SEEK_CUR => current + offset,
			SEEK_END => size + offset,
			_ => return Err(Error::EINVAL),
		};
		if new_pos < 0 {
			new_pos = 0;
		}
		if new_pos > size {
			new_pos = size;
		}
		self.handles[index].as_mut().unwrap().position = new_pos;
		Ok(new_pos)
	}

	pub fn ioctl(&mut self, fd: i32, request: u64, arg: usize) -> Result<i32> {
		let index = self.handle_index(fd).ok_or(Error::EBADF)?;

		if let Some(mi) = self.handles[index].as_ref().unwrap().mount {
			let ops = self.mount_ops(mi);
			let mut fs_data = self.handles[index]
				.as_mut()
				.unwrap()
				.fs_data
				.take()
				.ok_or(Error::EBADF)?;
			let mount = self.mounts[mi].as_ref().unwrap();
			let result = ops.ioctl(&mount.fs_private, &mut fs_data, request, arg);
			self.handles[index].as_mut().unwrap().fs_data = Some(fs_data);
			return result;
		}

		let node_index = self.handles[index].as_ref().unwrap().node.ok_or(Error::EBADF)?;
		let node = self.nodes[node_index].as_ref().ok_or(Error::EBADF)?;
		if node.ftype == FileType::Device {
			if let Some(dev) = node.device.clone() {
				return dev.ioctl(request, arg);
			}
		}
		Err(Error::ENOTTY)
	}

	// ------------------------------------------------------------------
	// Metadata
	// ------------------------------------------------------------------

	pub fn stat(&self, filepath: &str) -> Result<VfsStat> {
		if filepath.is_empty() || filepath.len() >= MAX_FILENAME {
			return Err(Error::EINVAL);
		}

		if let Some((mi, rel)) = self.find_mount(filepath) {
			let ops = self.mount_ops(mi);
			let mount = self.mounts[mi].as_ref().unwrap();
			match ops.stat(&mount.fs_private, &rel) {
				Err(Error::Unsupported) => {}
				other => return other,
			}
		}

		if filepath == "/" {
			return Ok(VfsStat {
				st_mode: S_IFDIR | 0o755,
				st_size: 0,
				st_blksize: 512,
				st_mtime: 0,
			});
		}

		let node = self
			.find_node(filepath)
			.and_then(|i| self.nodes[i].as_ref())
			.ok_or(Error::ENOENT)?;
		let st_mode = match node.ftype {
			FileType::File => S_IFREG | 0o644,
			FileType::Dir => S_IFDIR | 0o755,
			FileType::Device => S_IFCHR | 0o666,
		};
		Ok(VfsStat {
			st_mode,
			st_size: node.size() as i64,
			st_blksize: 512,
			st_mtime: 0,
		})
	}

	pub fn readdir(&self, dirpath: &str, entries: &mut [VfsDirent]) -> Result<usize> {
		if dirpath.is_empty() || dirpath.len() >= MAX_FILENAME {
			return Err(Error::EINVAL);
		}

		if let Some((mi, rel)) = self.find_mount(dirpath) {
			let ops = self.mount_ops(mi);
			let mount = self.mounts[mi].as_ref().unwrap();
			match ops.readdir(&mount.fs_private, &rel, entries) {
				Err(Error::Unsupported) => {}
				other => return other,
			}
		}

		let dir = path::normalize_dir(dirpath);
		let mut count = 0;
		for node in self.nodes.iter().flatten() {
			if count >= entries.len() {
				break;
			}
			if path::is_direct_child(dir, &node.name) {
				entries[count] = VfsDirent {
					name: String::from(path::basename(&node.name)),
					d_type: node.ftype,
				};
				count += 1;
			}
		}
		Ok(count)
	}
}

// ----------------------------------------------------------------------
// Global instance
// ----------------------------------------------------------------------

static VFS: Spinlock<Vfs> = Spinlock::new(Vfs::new());

/// Run `f` against the locked global VFS.
///
/// Callers must not already hold the VFS lock (the process table uses
/// this to maintain `/proc` entries from process birth/death paths).
pub(crate) fn with_vfs<R>(f: impl FnOnce(&mut Vfs) -> R) -> R {
	f(&mut VFS.lock())
}

/// Initialize the global VFS and publish registered block devices.
pub fn init() {
	VFS.lock().init();
	blockdev::init();
	crate::log_info!("vfs initialized");
}

pub fn mkdir(path: &str) -> Result<()> {
	VFS.lock().mkdir(path)
}

pub fn create(path: &str, data: &[u8]) -> Result<()> {
	VFS.lock().create(path, data)
}

pub fn delete(path: &str) -> Result<()> {
	VFS.lock().delete(path)
}

pub fn rmdir(path: &str) -> Result<()> {
	VFS.lock().rmdir(path)
}

pub fn pseudo_register(path: &str, ops: Arc<dyn DeviceOps>) -> Result<usize> {
	VFS.lock().pseudo_register(path, ops)
}

pub fn pseudo_register_with_fd(path: &str, fixed_fd: i32, ops: Arc<dyn DeviceOps>) -> Result<i32> {
	VFS.lock().pseudo_register_with_fd(path, fixed_fd, ops)
}

pub fn link_std_fd(std_fd: i32, dev_path: &str) {
	VFS.lock().link_std_fd(std_fd, dev_path)
}

pub fn register_filesystem(name: &str, ops: Arc<dyn FilesystemOps>, flags: FsFlags) -> Result<()> {
	VFS.lock().register_filesystem(name, ops, flags)
}

pub fn unregister_filesystem(name: &str) -> Result<()> {
	VFS.lock().unregister_filesystem(name)
}

pub fn mount_fs(
	fs_name: &str,
	mount_point: &str,
	device: Option<&str>,
	flags: MountFlags,
	data: Option<&str>,
) -> Result<()> {
	VFS.lock().mount_fs(fs_name, mount_point, device, flags, data)
}

pub fn unmount(mount_point: &str) -> Result<()> {
	VFS.lock().unmount(mount_point)
}

pub fn open(path: &str, flags: OpenFlags) -> Result<i32> {
	VFS.lock().open(path, flags)
}

pub fn close(fd: i32) -> Result<()> {
	VFS.lock().close(fd)
}

pub fn readfd(fd: i32, buf: &mut [u8]) -> Result<usize> {
	VFS.lock().readfd(fd, buf)
}

pub fn writefd(fd: i32, buf: &[u8]) -> Result<usize> {
	VFS.lock().writefd(fd, buf)
}

pub fn seek(fd: i32, offset: i64, whence: i32) -> Result<i64> {
	VFS.lock().seek(fd, offset, whence)
}

pub fn ioctl(fd: i32, request: u64, arg: usize) -> Result<i32> {
	VFS.lock().ioctl(fd, request, arg)
}

pub fn stat(path: &str) -> Result<VfsStat> {
	VFS.lock().stat(path)
}

pub fn readdir(path: &str, entries: &mut [VfsDirent]) -> Result<usize> {
	VFS.lock().readdir(path, entries)
}

#[cfg(test)]
mod tests {
	use super::*;
	use alloc::boxed::Box;
	use alloc::vec;
	use alloc::vec::Vec;

	struct NullFs;

	impl FilesystemOps for NullFs {
		fn mount(&self, _device: Option<&str>, _data: Option<&str>) -> Result<FsPrivate> {
			Ok(Box::new(()))
		}
	}

	struct EchoFs;

	impl FilesystemOps for EchoFs {
		fn mount(&self, _device: Option<&str>, _data: Option<&str>) -> Result<FsPrivate> {
			Ok(Box::new(()))
		}

		fn open(&self, _state: &FsPrivate, path: &str, _flags: OpenFlags) -> Result<HandlePrivate> {
			Ok(Box::new(String::from(path)))
		}

		fn read(
			&self,
			_state: &FsPrivate,
			handle: &mut HandlePrivate,
			pos: &mut i64,
			buf: &mut [u8],
		) -> Result<usize> {
			let path = handle.downcast_ref::<String>().unwrap();
			let bytes = path.as_bytes();
			let at = (*pos).max(0) as usize;
			if at >= bytes.len() {
				return Ok(0);
			}
			let n = buf.len().min(bytes.len() - at);
			buf[..n].copy_from_slice(&bytes[at..at + n]);
			*pos += n as i64;
			Ok(n)
		}
	}

	fn fresh_vfs() -> Vfs {
		let mut vfs = Vfs::new();
		vfs.init();
		vfs
	}

	#[test]
	fn legacy_file_round_trip() {
		let mut vfs = fresh_vfs();

		vfs.create("/tmp/x", b"hi").unwrap();
		let fd = vfs.open("/tmp/x", OpenFlags::READ).unwrap();

		let mut buf = [0u8; 8];
		assert_eq!(vfs.readfd(fd, &mut buf).unwrap(), 2);
		assert_eq!(&buf[..2], b"hi");
		// Second read hits EOF.
		assert_eq!(vfs.readfd(fd, &mut buf).unwrap(), 0);

		vfs.close(fd).unwrap();
		vfs.delete("/tmp/x").unwrap();
		assert!(!vfs.exists("/tmp/x"));
	}

	#[test]
	fn open_missing_file_fails_without_creat() {
		let mut vfs = fresh_vfs();
		assert_eq!(vfs.open("/tmp/nope", OpenFlags::READ), Err(Error::ENOENT));

		let fd = vfs
			.open("/tmp/nope", OpenFlags::READ | OpenFlags::WRITE | OpenFlags::CREAT)
			.unwrap();
		assert!(vfs.exists("/tmp/nope"));
		vfs.close(fd).unwrap();
	}

	#[test]
	fn write_extends_and_seek_clamps() {
		let mut vfs = fresh_vfs();
		vfs.create("/tmp/w", b"").unwrap();

		let fd = vfs.open("/tmp/w", OpenFlags::READ | OpenFlags::WRITE).unwrap();
		assert_eq!(vfs.writefd(fd, b"hello").unwrap(), 5);

		// SEEK_END past the size clamps back to the size.
		assert_eq!(vfs.seek(fd, 10, SEEK_END).unwrap(), 5);
		// Negative absolute positions clamp to zero.
		assert_eq!(vfs.seek(fd, -3, SEEK_SET).unwrap(), 0);

		let mut buf = [0u8; 5];
		assert_eq!(vfs.readfd(fd, &mut buf).unwrap(), 5);
		assert_eq!(&buf, b"hello");
		vfs.close(fd).unwrap();
	}

	#[test]
	fn access_mode_is_enforced() {
		let mut vfs = fresh_vfs();
		vfs.create("/tmp/ro", b"data").unwrap();

		let fd = vfs.open("/tmp/ro", OpenFlags::READ).unwrap();
		assert_eq!(vfs.writefd(fd, b"x"), Err(Error::EACCES));
		vfs.close(fd).unwrap();

		let fd = vfs.open("/tmp/ro", OpenFlags::WRITE).unwrap();
		let mut buf = [0u8; 4];
		assert_eq!(vfs.readfd(fd, &mut buf), Err(Error::EACCES));
		vfs.close(fd).unwrap();
	}

	#[test]
	fn descriptors_are_unique_until_closed() {
		let mut vfs = fresh_vfs();
		vfs.create("/tmp/a", b"1").unwrap();
		vfs.create("/tmp/b", b"2").unwrap();

		let fd_a = vfs.open("/tmp/a", OpenFlags::READ).unwrap();
		let fd_b = vfs.open("/tmp/b", OpenFlags::READ).unwrap();
		assert_ne!(fd_a, fd_b);
		assert!(fd_a >= 3 && fd_b >= 3);

		vfs.close(fd_a).unwrap();
		let fd_c = vfs.open("/tmp/b", OpenFlags::READ).unwrap();
		assert_ne!(fd_c, fd_b);
		vfs.close(fd_b).unwrap();
		vfs.close(fd_c).unwrap();
	}

	#[test]
	fn reserved_fds_are_never_allocated() {
		let mut vfs = fresh_vfs();
		vfs.create("/tmp/f", b"x").unwrap();
		let mut fds = vec![];
		for _ in 0..32 {
			let fd = vfs.open("/tmp/f", OpenFlags::READ).unwrap();
			assert!(!RESERVED_FDS.contains(&fd));
			assert!(fd >= 3);
			fds.push(fd);
		}
		for fd in fds {
			vfs.close(fd).unwrap();
		}
	}

	#[test]
	fn longest_prefix_mount_wins() {
		let mut vfs = fresh_vfs();
		vfs.register_filesystem("rootfs", Arc::new(NullFs), FsFlags::VIRTUAL).unwrap();
		vfs.register_filesystem("procish", Arc::new(NullFs), FsFlags::VIRTUAL).unwrap();

		vfs.mount_fs("rootfs", "/", None, MountFlags::empty(), None).unwrap();
		vfs.mount_fs("procish", "/proc2", None, MountFlags::empty(), None).unwrap();

		let (mi, rel) = vfs.find_mount("/proc2/self").unwrap();
		assert_eq!(vfs.mounts[mi].as_ref().unwrap().mount_point, "/proc2");
		assert_eq!(rel, "self");

		let (mi, rel) = vfs.find_mount("/proc2ish").unwrap();
		assert_eq!(vfs.mounts[mi].as_ref().unwrap().mount_point, "/");
		assert_eq!(rel, "proc2ish");
	}

	#[test]
	fn mount_boundary_requires_separator() {
		let mut vfs = fresh_vfs();
		vfs.register_filesystem("nullfs", Arc::new(NullFs), FsFlags::VIRTUAL).unwrap();
		vfs.mount_fs("nullfs", "/data", None, MountFlags::empty(), None).unwrap();

		assert!(vfs.find_mount("/data").is_some());
		assert!(vfs.find_mount("/data/x").is_some());
		assert!(vfs.find_mount("/database").is_none());
	}

	#[test]
	fn unmount_is_blocked_by_open_handles() {
		let mut vfs = fresh_vfs();
		vfs.register_filesystem("echofs", Arc::new(EchoFs), FsFlags::VIRTUAL).unwrap();
		vfs.mount_fs("echofs", "/echo", None, MountFlags::empty(), None).unwrap();

		let fd = vfs.open("/echo/hello", OpenFlags::READ).unwrap();
		assert_eq!(vfs.unmount("/echo"), Err(Error::EBUSY));

		vfs.close(fd).unwrap();
		vfs.unmount("/echo").unwrap();
		assert!(vfs.find_mount("/echo/hello").is_none());
	}

	#[test]
	fn mounted_reads_dispatch_to_the_driver() {
		let mut vfs = fresh_vfs();
		vfs.register_filesystem("echofs", Arc::new(EchoFs), FsFlags::VIRTUAL).unwrap();
		vfs.mount_fs("echofs", "/echo", None, MountFlags::empty(), None).unwrap();

		let fd = vfs.open("/echo/name", OpenFlags::READ).unwrap();
		let mut buf = [0u8; 16];
		let n = vfs.readfd(fd, &mut buf).unwrap();
		assert_eq!(&buf[..n], b"name");
		vfs.close(fd).unwrap();
	}

	#[test]
	fn rmdir_refuses_non_empty_directories() {
		let mut vfs = fresh_vfs();
		vfs.mkdir("/tmp/sub").unwrap();
		vfs.create("/tmp/sub/file", b"x").unwrap();

		assert_eq!(vfs.rmdir("/tmp/sub"), Err(Error::ENOTEMPTY));
		vfs.delete("/tmp/sub/file").unwrap();
		vfs.rmdir("/tmp/sub").unwrap();
		assert!(!vfs.exists("/tmp/sub"));
	}

	#[test]
	fn rmdir_type_checks() {
		let mut vfs = fresh_vfs();
		vfs.create("/tmp/file", b"x").unwrap();
		assert_eq!(vfs.rmdir("/tmp/file"), Err(Error::ENOTDIR));
		assert_eq!(vfs.rmdir("/missing"), Err(Error::ENOENT));
		assert_eq!(vfs.rmdir("/"), Err(Error::EBUSY));
		assert_eq!(vfs.delete("/tmp"), Err(Error::EISDIR));
	}

	#[test]
	fn delete_refuses_open_files() {
		let mut vfs = fresh_vfs();
		vfs.create("/tmp/busy", b"x").unwrap();
		let fd = vfs.open("/tmp/busy", OpenFlags::READ).unwrap();
		assert_eq!(vfs.delete("/tmp/busy"), Err(Error::EBUSY));
		vfs.close(fd).unwrap();
		vfs.delete("/tmp/busy").unwrap();
	}

	#[test]
	fn readdir_lists_direct_children_only() {
		let mut vfs = fresh_vfs();
		vfs.create("/var/log/kern", b"").unwrap();
		vfs.create("/var/log/user", b"").unwrap();

		let mut entries = vec![VfsDirent::empty(); 16];
		let n = vfs.readdir("/var/log", &mut entries).unwrap();
		let mut names: Vec<&str> = entries[..n].iter().map(|e| e.name.as_str()).collect();
		names.sort_unstable();
		assert_eq!(names, ["kern", "user"]);

		let n = vfs.readdir("/var", &mut entries).unwrap();
		let mut names: Vec<&str> = entries[..n].iter().map(|e| e.name.as_str()).collect();
		names.sort_unstable();
		assert_eq!(names, ["cache", "log"]);

		// Root listing shows only the first level.
		let n = vfs.readdir("/", &mut entries).unwrap();
		let names: Vec<&str> = entries[..n].iter().map(|e| e.name.as_str()).collect();
		assert!(names.contains(&"tmp"));
		assert!(names.contains(&"home"));
		assert!(!names.contains(&"log"));
	}

	#[test]
	fn stat_reports_types_and_sizes() {
		let mut vfs = fresh_vfs();
		vfs.create("/tmp/s", b"abcd").unwrap();

		let st = vfs.stat("/tmp/s").unwrap();
		assert_eq!(st.st_mode & S_IFMT, S_IFREG);
		assert_eq!(st.st_size, 4);

		let st = vfs.stat("/tmp").unwrap();
		assert_eq!(st.st_mode & S_IFMT, S_IFDIR);

		let st = vfs.stat("/dev/null").unwrap();
		assert_eq!(st.st_mode & S_IFMT, S_IFCHR);

		assert_eq!(vfs.stat("/nope"), Err(Error::ENOENT));
	}

	#[test]
	fn write_past_cap_reports_enospc() {
		let mut vfs = fresh_vfs();
		vfs.create("/tmp/cap", b"").unwrap();
		let fd = vfs.open("/tmp/cap", OpenFlags::WRITE).unwrap();
		// Force the cursor to the cap, then any write is out of space.
		{
			let index = vfs.handle_index(fd).unwrap();
			vfs.handles[index].as_mut().unwrap().position = MAX_FILE_SIZE as i64;
		}
		assert_eq!(vfs.writefd(fd, b"x"), Err(Error::ENOSPC));
		vfs.close(fd).unwrap();
	}

	#[test]
	fn unregister_in_use_filesystem_is_busy() {
		let mut vfs = fresh_vfs();
		vfs.register_filesystem("nullfs", Arc::new(NullFs), FsFlags::VIRTUAL).unwrap();
		vfs.mount_fs("nullfs", "/n", None, MountFlags::empty(), None).unwrap();
		assert_eq!(vfs.unregister_filesystem("nullfs"), Err(Error::EBUSY));
		vfs.unmount("/n").unwrap();
		vfs.unregister_filesystem("nullfs").unwrap();
	}
}
