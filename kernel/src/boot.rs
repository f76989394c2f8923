// SPDX-License-Identifier: GPL-2.0

//! Boot environment interface
//!
//! The loader glue translates its protocol structures into these records
//! before the core ever sees them: the physical memory map feeding the
//! buddy pool, the higher-half direct-map offset, and the raw boot
//! modules.

use crate::types::PhysAddr;

/// One physical memory map entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
	pub base: PhysAddr,
	pub length: u64,
	pub usable: bool,
}

/// What a boot module turned out to contain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleKind {
	/// "CD001" volume descriptor signature at offset 0x8001.
	Iso9660,
	/// 0x55 0xAA boot signature in the last two bytes of sector 0.
	DiskImage,
	/// Anything else is treated as an initramfs record stream.
	Initramfs,
}

const ISO_SIGNATURE_OFFSET: usize = 0x8001;
const ISO_SIGNATURE: &[u8; 5] = b"CD001";

/// Classify a raw boot module by its magic bytes.
pub fn classify_module(data: &[u8]) -> ModuleKind {
	if data.len() > ISO_SIGNATURE_OFFSET + ISO_SIGNATURE.len()
		&& &data[ISO_SIGNATURE_OFFSET..ISO_SIGNATURE_OFFSET + ISO_SIGNATURE.len()] == ISO_SIGNATURE
	{
		return ModuleKind::Iso9660;
	}
	if data.len() >= 512 && data[510] == 0x55 && data[511] == 0xaa {
		return ModuleKind::DiskImage;
	}
	ModuleKind::Initramfs
}

/// Pick the largest usable region from the memory map; the buddy pool is
/// carved out of it.
pub fn largest_usable_region(map: &[MemoryRegion]) -> Option<MemoryRegion> {
	map.iter()
		.filter(|r| r.usable)
		.max_by_key(|r| r.length)
		.copied()
}

/// Feed the chosen region to the buddy allocator.
///
/// # Safety
///
/// The region must describe real, exclusively-owned RAM and `hhdm_offset`
/// must be the loader-provided direct-map offset.
pub unsafe fn init_memory(map: &[MemoryRegion], hhdm_offset: u64) {
	let Some(region) = largest_usable_region(map) else {
		panic!("boot: no usable memory region");
	};
	crate::log_info!(
		"boot: memory pool at {} ({} KiB)",
		region.base,
		region.length / 1024
	);
	let pool = region.base.to_virt(hhdm_offset);
	unsafe {
		crate::memory::init(pool.as_mut_ptr::<u8>(), region.length as usize, hhdm_offset);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn classifies_iso_images() {
		let mut data = alloc::vec![0u8; 0x9000];
		data[0x8001..0x8006].copy_from_slice(b"CD001");
		assert_eq!(classify_module(&data), ModuleKind::Iso9660);
	}

	#[test]
	fn classifies_mbr_disk_images() {
		let mut data = alloc::vec![0u8; 512];
		data[510] = 0x55;
		data[511] = 0xaa;
		assert_eq!(classify_module(&data), ModuleKind::DiskImage);
	}

	#[test]
	fn everything_else_is_initramfs() {
		assert_eq!(classify_module(b"NVM0ish blob"), ModuleKind::Initramfs);
		assert_eq!(classify_module(&[]), ModuleKind::Initramfs);
	}

	#[test]
	fn picks_largest_usable_region() {
		let map = [
			MemoryRegion {
				base: PhysAddr::new(0x1000),
				length: 0x4000,
				usable: true,
			},
			MemoryRegion {
				base: PhysAddr::new(0x100000),
				length: 0x100000,
				usable: false,
			},
			MemoryRegion {
				base: PhysAddr::new(0x200000),
				length: 0x80000,
				usable: true,
			},
		];
		let best = largest_usable_region(&map).unwrap();
		assert_eq!(best.base, PhysAddr::new(0x200000));
	}

	#[test]
	fn no_usable_region_is_none() {
		let map = [MemoryRegion {
			base: PhysAddr::new(0),
			length: 0x1000,
			usable: false,
		}];
		assert!(largest_usable_region(&map).is_none());
	}
}
