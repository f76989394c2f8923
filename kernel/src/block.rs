// SPDX-License-Identifier: GPL-2.0

//! Block device layer
//!
//! Drivers register named devices into a fixed-size table; filesystems and
//! the `/dev` shim look them up by name and talk to them in whole blocks.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::error::{Error, Result};
use crate::sync::Spinlock;

/// Registry capacity.
pub const MAX_BLOCK_DEVICES: usize = 16;

/// The operations every block driver provides.
///
/// `buf` always spans exactly `count` blocks. Read-only drivers return
/// `EROFS` from [`BlockDriver::write_blocks`].
pub trait BlockDriver: Send + Sync {
	fn read_blocks(&self, lba: u64, count: usize, buf: &mut [u8]) -> Result<()>;
	fn write_blocks(&self, lba: u64, count: usize, buf: &[u8]) -> Result<()>;
}

/// A registered block device.
pub struct BlockDevice {
	pub name: String,
	pub block_size: u32,
	pub total_blocks: u64,
	driver: alloc::boxed::Box<dyn BlockDriver>,
}

impl core::fmt::Debug for BlockDevice {
	fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
		f.debug_struct("BlockDevice")
			.field("name", &self.name)
			.field("block_size", &self.block_size)
			.field("total_blocks", &self.total_blocks)
			.finish()
	}
}

impl BlockDevice {
	/// Device extent in bytes.
	pub fn size_bytes(&self) -> u64 {
		self.total_blocks * self.block_size as u64
	}

	pub fn read_blocks(&self, lba: u64, count: usize, buf: &mut [u8]) -> Result<()> {
		if buf.len() < count * self.block_size as usize {
			return Err(Error::EINVAL);
		}
		self.driver.read_blocks(lba, count, buf)
	}

	pub fn write_blocks(&self, lba: u64, count: usize, buf: &[u8]) -> Result<()> {
		self.driver.write_blocks(lba, count, buf)
	}
}

/// Fixed-capacity table of registered devices.
pub struct BlockRegistry {
	devices: [Option<Arc<BlockDevice>>; MAX_BLOCK_DEVICES],
}

impl BlockRegistry {
	pub const fn new() -> Self {
		const VACANT: Option<Arc<BlockDevice>> = None;
		Self {
			devices: [VACANT; MAX_BLOCK_DEVICES],
		}
	}

	pub fn register(
		&mut self,
		name: &str,
		block_size: u32,
		total_blocks: u64,
		driver: alloc::boxed::Box<dyn BlockDriver>,
	) -> Result<Arc<BlockDevice>> {
		if name.is_empty() || block_size == 0 {
			return Err(Error::EINVAL);
		}
		if self.find(name).is_some() {
			return Err(Error::EEXIST);
		}

		for slot in self.devices.iter_mut() {
			if slot.is_none() {
				let device = Arc::new(BlockDevice {
					name: String::from(name),
					block_size,
					total_blocks,
					driver,
				});
				*slot = Some(device.clone());
				return Ok(device);
			}
		}
		Err(Error::ENOMEM)
	}

	pub fn find(&self, name: &str) -> Option<Arc<BlockDevice>> {
		self.devices
			.iter()
			.flatten()
			.find(|d| d.name == name)
			.cloned()
	}

	pub fn devices(&self) -> Vec<Arc<BlockDevice>> {
		self.devices.iter().flatten().cloned().collect()
	}
}

static REGISTRY: Spinlock<BlockRegistry> = Spinlock::new(BlockRegistry::new());

/// Reset the registry.
pub fn init() {
	*REGISTRY.lock() = BlockRegistry::new();
	crate::log_info!("block device layer initialized");
}

/// Register a device in the global table.
pub fn register(
	name: &str,
	block_size: u32,
	total_blocks: u64,
	driver: alloc::boxed::Box<dyn BlockDriver>,
) -> Result<Arc<BlockDevice>> {
	let device = REGISTRY.lock().register(name, block_size, total_blocks, driver);
	match &device {
		Ok(d) => crate::log_info!(
			"registered block device '{}' ({} x {} bytes)",
			d.name,
			d.total_blocks,
			d.block_size
		),
		Err(e) => crate::log_warn!("could not register block device '{}': {}", name, e),
	}
	device
}

/// Look up a device by name.
pub fn find(name: &str) -> Option<Arc<BlockDevice>> {
	REGISTRY.lock().find(name)
}

/// Snapshot of every registered device.
pub fn devices() -> Vec<Arc<BlockDevice>> {
	REGISTRY.lock().devices()
}

#[cfg(test)]
pub(crate) mod testutil {
	use super::*;
	use crate::sync::Spinlock as Lock;

	/// RAM-backed read/write driver for unit tests.
	pub struct MemDisk {
		pub block_size: usize,
		pub data: Lock<Vec<u8>>,
	}

	impl MemDisk {
		pub fn new(block_size: usize, blocks: usize) -> Self {
			Self {
				block_size,
				data: Lock::new(alloc::vec![0u8; block_size * blocks]),
			}
		}

		pub fn from_image(block_size: usize, image: Vec<u8>) -> Self {
			Self {
				block_size,
				data: Lock::new(image),
			}
		}
	}

	impl BlockDriver for MemDisk {
		fn read_blocks(&self, lba: u64, count: usize, buf: &mut [u8]) -> Result<()> {
			let offset = lba as usize * self.block_size;
			let bytes = count * self.block_size;
			let data = self.data.lock();
			if offset + bytes > data.len() {
				return Err(Error::EINVAL);
			}
			buf[..bytes].copy_from_slice(&data[offset..offset + bytes]);
			Ok(())
		}

		fn write_blocks(&self, lba: u64, count: usize, buf: &[u8]) -> Result<()> {
			let offset = lba as usize * self.block_size;
			let bytes = count * self.block_size;
			let mut data = self.data.lock();
			if offset + bytes > data.len() || buf.len() < bytes {
				return Err(Error::EINVAL);
			}
			data[offset..offset + bytes].copy_from_slice(&buf[..bytes]);
			Ok(())
		}
	}
}
