// SPDX-License-Identifier: GPL-2.0

//! Legacy file table types
//!
//! The flat slot table predates the mount layer and still backs pseudo
//! files, the boot-time directory skeleton and anything created with
//! `CREAT` outside a mount. Device slots carry a [`DeviceOps`] trait
//! object where the historical design kept four nullable function
//! pointers plus a `void*`.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::any::Any;

use crate::error::{Error, Result};

use super::OpenFlags;

/// What a legacy slot holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
	File,
	Dir,
	Device,
}

/// Per-device operations for pseudo files.
///
/// Unimplemented operations report [`Error::Unsupported`]; the VFS maps
/// that to the access error the caller expects. State the old `dev_data`
/// pointer carried lives inside the implementing type.
pub trait DeviceOps: Send + Sync {
	fn read(&self, buf: &mut [u8], pos: &mut i64) -> Result<usize> {
		let _ = (buf, pos);
		Err(Error::Unsupported)
	}

	fn write(&self, buf: &[u8], pos: &mut i64) -> Result<usize> {
		let _ = (buf, pos);
		Err(Error::Unsupported)
	}

	fn seek(&self, offset: i64, whence: i32, pos: &mut i64) -> Result<i64> {
		let _ = (offset, whence, pos);
		Err(Error::Unsupported)
	}

	fn ioctl(&self, request: u64, arg: usize) -> Result<i32> {
		let _ = (request, arg);
		Err(Error::ENOTTY)
	}
}

/// One legacy slot: a regular file with an inline buffer, a directory
/// marker, or a device dispatching through [`DeviceOps`].
pub struct VfsNode {
	pub name: String,
	pub ftype: FileType,
	pub data: Vec<u8>,
	pub device: Option<Arc<dyn DeviceOps>>,
}

impl VfsNode {
	pub fn file(name: &str, data: &[u8]) -> Self {
		Self {
			name: String::from(name),
			ftype: FileType::File,
			data: data.to_vec(),
			device: None,
		}
	}

	pub fn dir(name: &str) -> Self {
		Self {
			name: String::from(name),
			ftype: FileType::Dir,
			data: Vec::new(),
			device: None,
		}
	}

	pub fn device(name: &str, ops: Arc<dyn DeviceOps>) -> Self {
		Self {
			name: String::from(name),
			ftype: FileType::Device,
			data: Vec::new(),
			device: Some(ops),
		}
	}

	pub fn size(&self) -> usize {
		self.data.len()
	}
}

/// An open descriptor.
///
/// Exactly one of `node` (legacy slot index) or `mount` (mount table
/// index, with driver state in `fs_data`) is set, except for the three
/// std descriptors which may be re-linked onto device slots.
pub(super) struct Handle {
	pub fd: i32,
	pub node: Option<usize>,
	pub mount: Option<usize>,
	pub rel_path: String,
	pub position: i64,
	pub flags: OpenFlags,
	pub fs_data: Option<Box<dyn Any + Send>>,
}

impl Handle {
	pub fn std(fd: i32, flags: OpenFlags) -> Self {
		Self {
			fd,
			node: None,
			mount: None,
			rel_path: String::new(),
			position: 0,
			flags,
			fs_data: None,
		}
	}
}
