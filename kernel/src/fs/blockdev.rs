// SPDX-License-Identifier: GPL-2.0

//! Block device nodes under `/dev`
//!
//! Glue between the VFS and the block layer: every registered block
//! device gets a pseudo file whose byte-addressed reads are translated to
//! whole-block transfers through a staging buffer.

use alloc::format;
use alloc::sync::Arc;
use alloc::vec;

use crate::block::BlockDevice;
use crate::error::{Error, Result};

use super::devfs::{self, DevKind};
use super::{DeviceOps, Vfs};

struct BlockDevFile {
	dev: Arc<BlockDevice>,
}

impl DeviceOps for BlockDevFile {
	fn read(&self, buf: &mut [u8], pos: &mut i64) -> Result<usize> {
		let block_size = self.dev.block_size as usize;
		let extent = self.dev.size_bytes() as i64;
		let mut current = (*pos).max(0);

		if current >= extent {
			return Ok(0);
		}

		let mut staging = vec![0u8; block_size];
		let mut copied = 0usize;
		let mut remaining = buf.len();

		while remaining > 0 {
			let lba = current as u64 / block_size as u64;
			let offset = current as usize % block_size;
			if lba >= self.dev.total_blocks {
				break;
			}

			if let Err(e) = self.dev.read_blocks(lba, 1, &mut staging) {
				if copied > 0 {
					break;
				}
				return Err(e);
			}

			let mut take = block_size - offset;
			if take > remaining {
				take = remaining;
			}
			// Clamp the final block at the device's byte extent.
			if current + take as i64 > extent {
				take = (extent - current) as usize;
			}
			if take == 0 {
				break;
			}

			buf[copied..copied + take].copy_from_slice(&staging[offset..offset + take]);
			copied += take;
			current += take as i64;
			remaining -= take;
		}

		*pos = current;
		Ok(copied)
	}

	fn write(&self, _buf: &[u8], _pos: &mut i64) -> Result<usize> {
		// Byte-granular writes would need read-modify-write; forward the
		// attempt so read-only drivers answer with EROFS themselves.
		self.dev.write_blocks(0, 0, &[])?;
		Ok(0)
	}

	fn seek(&self, offset: i64, whence: i32, pos: &mut i64) -> Result<i64> {
		let extent = self.dev.size_bytes() as i64;
		let mut new_pos = match whence {
			super::SEEK_SET => offset,
			super::SEEK_CUR => *pos + offset,
			super::SEEK_END => extent + offset,
			_ => return Err(Error::EINVAL),
		};
		if new_pos < 0 {
			new_pos = 0;
		}
		if new_pos > extent {
			new_pos = extent;
		}
		*pos = new_pos;
		Ok(new_pos)
	}
}

/// Publish one block device as `/dev/<name>`.
pub fn publish(vfs: &mut Vfs, dev: Arc<BlockDevice>) {
	let path = format!("/dev/{}", dev.name);
	devfs::add_entry(&dev.name, DevKind::Block);
	if let Err(e) = vfs.pseudo_register(&path, Arc::new(BlockDevFile { dev })) {
		crate::log_warn!("blockdev: could not register {}: {}", path, e);
	} else {
		crate::log_info!("blockdev: registered {}", path);
	}
}

/// Publish every currently registered block device into the global VFS.
pub fn init() {
	let devices = crate::block::devices();
	super::with_vfs(|vfs| {
		for dev in devices {
			publish(vfs, dev);
		}
	});
}
