// SPDX-License-Identifier: GPL-2.0

//! FAT32 read support
//!
//! Mounts a registered block device, walks cluster chains through the FAT
//! and parses 8.3 plus long-file-name directory entries. File data writes
//! are not implemented; FAT entry writes exist so cluster chains can be
//! extended and released.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use crate::block::BlockDevice;
use crate::error::{Error, Result};

use super::{
	FileType, FilesystemOps, FsFlags, FsPrivate, VfsDirent, VfsStat, S_IFDIR, S_IFREG,
};

/// FAT entry values (28 significant bits).
pub const FAT_FREE: u32 = 0;
pub const FAT_BAD: u32 = 0x0fff_fff7;
pub const FAT_EOC: u32 = 0x0fff_fff8;
const FAT_ENTRY_MASK: u32 = 0x0fff_ffff;

/// A volume with fewer clusters is FAT12/16 by definition.
const MIN_FAT32_CLUSTERS: u32 = 65525;

const DIR_ENTRY_SIZE: usize = 32;
const ATTR_READ_ONLY: u8 = 0x01;
const ATTR_VOLUME_ID: u8 = 0x08;
const ATTR_DIRECTORY: u8 = 0x10;
/// Long-name entries carry read-only|hidden|system|volume-id.
const ATTR_LFN: u8 = 0x0f;

/// Sequence bit marking the first (highest) entry of an LFN run.
const LFN_LAST_ENTRY: u8 = 0x40;
/// UTF-16 code units per LFN entry (5 + 6 + 2).
const LFN_CHARS_PER_ENTRY: usize = 13;
/// 20 entries x 13 chars bounds a name at 260 units (255 used).
const LFN_MAX_ENTRIES: usize = 20;

/// Mounted FAT32 volume state.
#[derive(Debug)]
pub struct Fat32Fs {
	dev: Arc<BlockDevice>,
	bytes_per_sector: u32,
	sectors_per_cluster: u32,
	bytes_per_cluster: u32,
	reserved_sectors: u32,
	num_fats: u32,
	fat_size: u32,
	root_cluster: u32,
	total_sectors: u32,
	data_start_sector: u32,
	total_clusters: u32,
}

/// A parsed directory entry.
#[derive(Debug, Clone)]
pub struct DirEntryInfo {
	pub name: String,
	pub first_cluster: u32,
	pub file_size: u32,
	pub attr: u8,
	pub is_dir: bool,
}

fn read_u16(buf: &[u8], offset: usize) -> u16 {
	u16::from_le_bytes([buf[offset], buf[offset + 1]])
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
	u32::from_le_bytes([
		buf[offset],
		buf[offset + 1],
		buf[offset + 2],
		buf[offset + 3],
	])
}

/// 8.3 alias checksum stored in every LFN entry.
fn lfn_checksum(short_name: &[u8]) -> u8 {
	let mut sum: u8 = 0;
	for &byte in &short_name[..11] {
		sum = (if sum & 1 != 0 { 0x80u8 } else { 0 })
			.wrapping_add(sum >> 1)
			.wrapping_add(byte);
	}
	sum
}

/// Accumulator for one run of LFN entries preceding an 8.3 entry.
struct LfnState {
	buf: [u16; LFN_MAX_ENTRIES * LFN_CHARS_PER_ENTRY],
	checksum: u8,
	valid: bool,
}

impl LfnState {
	fn new() -> Self {
		Self {
			buf: [0; LFN_MAX_ENTRIES * LFN_CHARS_PER_ENTRY],
			checksum: 0,
			valid: false,
		}
	}

	fn reset(&mut self) {
		self.valid = false;
	}

	/// Feed one LFN entry. The run starts at the entry carrying
	/// [`LFN_LAST_ENTRY`]; later entries must repeat its checksum or the
	/// whole run is discarded.
	fn feed(&mut self, entry: &[u8]) {
		let seq = entry[0];
		let checksum = entry[13];

		if seq & LFN_LAST_ENTRY != 0 {
			self.buf.fill(0);
			self.checksum = checksum;
			self.valid = true;
		} else if !self.valid || checksum != self.checksum {
			self.reset();
			return;
		}

		let index = (seq & 0x1f) as usize;
		if index == 0 || index > LFN_MAX_ENTRIES {
			self.reset();
			return;
		}
		let base = (index - 1) * LFN_CHARS_PER_ENTRY;

		// Three UTF-16 fragments: 5, 6 and 2 units.
		for (k, offset) in [1usize, 3, 5, 7, 9].iter().enumerate() {
			self.buf[base + k] = read_u16(entry, *offset);
		}
		for (k, offset) in [14usize, 16, 18, 20, 22, 24].iter().enumerate() {
			self.buf[base + 5 + k] = read_u16(entry, *offset);
		}
		for (k, offset) in [28usize, 30].iter().enumerate() {
			self.buf[base + 11 + k] = read_u16(entry, *offset);
		}
	}

	/// Finish the run against the following 8.3 entry's checksum.
	fn take(&mut self, short_checksum: u8) -> Option<String> {
		if !self.valid || self.checksum != short_checksum {
			self.reset();
			return None;
		}
		let mut name = String::new();
		for &unit in self.buf.iter() {
			if unit == 0 {
				break;
			}
			name.push(if unit < 128 { unit as u8 as char } else { '?' });
		}
		self.reset();
		if name.is_empty() {
			None
		} else {
			Some(name)
		}
	}
}

/// "NAME    EXT" with space padding into "NAME.EXT".
fn format_short_name(raw: &[u8]) -> String {
	let mut name = String::new();
	for &byte in raw[..8].iter() {
		if byte == b' ' {
			break;
		}
		name.push(if byte < 128 { byte as char } else { '?' });
	}
	let ext_len = raw[8..11].iter().take_while(|&&b| b != b' ').count();
	if ext_len > 0 {
		name.push('.');
		for &byte in &raw[8..8 + ext_len] {
			name.push(if byte < 128 { byte as char } else { '?' });
		}
	}
	name
}

impl Fat32Fs {
	/// Parse the boot sector of `dev` and validate FAT32 geometry.
	pub fn mount(dev: Arc<BlockDevice>) -> Result<Self> {
		let mut boot = vec![0u8; dev.block_size as usize];
		dev.read_blocks(0, 1, &mut boot)?;

		if boot.len() < 512 || read_u16(&boot, 510) != 0xaa55 {
			crate::log_error!("fat32: missing 0xAA55 boot signature on '{}'", dev.name);
			return Err(Error::EINVAL);
		}
		if &boot[82..90] != b"FAT32   " {
			crate::log_warn!("fat32: volume on '{}' does not label itself FAT32", dev.name);
		}

		let bytes_per_sector = read_u16(&boot, 11) as u32;
		let sectors_per_cluster = boot[13] as u32;
		if bytes_per_sector == 0 || sectors_per_cluster == 0 {
			return Err(Error::EINVAL);
		}
		if bytes_per_sector != dev.block_size {
			crate::log_error!(
				"fat32: sector size {} does not match device block size {}",
				bytes_per_sector,
				dev.block_size
			);
			return Err(Error::EINVAL);
		}

		let reserved_sectors = read_u16(&boot, 14) as u32;
		let num_fats = boot[16] as u32;
		let fat_size = read_u32(&boot, 36);
		let root_cluster = read_u32(&boot, 44);
		let total_sectors_16 = read_u16(&boot, 19) as u32;
		let total_sectors = if total_sectors_16 != 0 {
			total_sectors_16
		} else {
			read_u32(&boot, 32)
		};

		let data_start_sector = reserved_sectors + num_fats * fat_size;
		if total_sectors <= data_start_sector {
			return Err(Error::EINVAL);
		}
		let total_clusters = (total_sectors - data_start_sector) / sectors_per_cluster;
		if total_clusters < MIN_FAT32_CLUSTERS {
			crate::log_error!(
				"fat32: {} clusters is below the FAT32 minimum of {}",
				total_clusters,
				MIN_FAT32_CLUSTERS
			);
			return Err(Error::EINVAL);
		}

		let fs = Self {
			dev,
			bytes_per_sector,
			sectors_per_cluster,
			bytes_per_cluster: bytes_per_sector * sectors_per_cluster,
			reserved_sectors,
			num_fats,
			fat_size,
			root_cluster,
			total_sectors,
			data_start_sector,
			total_clusters,
		};
		crate::log_info!(
			"fat32: mounted '{}': {} sectors, {} clusters of {} bytes, root at {}",
			fs.dev.name,
			fs.total_sectors,
			fs.total_clusters,
			fs.bytes_per_cluster,
			fs.root_cluster
		);
		Ok(fs)
	}

	pub fn root_cluster(&self) -> u32 {
		self.root_cluster
	}

	fn cluster_in_range(&self, cluster: u32) -> bool {
		(2..self.total_clusters + 2).contains(&cluster)
	}

	/// First sector of a data cluster.
	pub fn cluster_to_sector(&self, cluster: u32) -> Result<u64> {
		if !self.cluster_in_range(cluster) {
			return Err(Error::EINVAL);
		}
		Ok(self.data_start_sector as u64
			+ (cluster as u64 - 2) * self.sectors_per_cluster as u64)
	}

	/// Read one whole cluster; `buf` must span `bytes_per_cluster`.
	pub fn read_cluster(&self, cluster: u32, buf: &mut [u8]) -> Result<()> {
		if buf.len() < self.bytes_per_cluster as usize {
			return Err(Error::EINVAL);
		}
		let sector = self.cluster_to_sector(cluster)?;
		self.dev
			.read_blocks(sector, self.sectors_per_cluster as usize, buf)
	}

	fn fat_entry_offset(&self, cluster: u32) -> (u32, usize) {
		let byte = cluster * 4;
		(byte / self.bytes_per_sector, (byte % self.bytes_per_sector) as usize)
	}

	/// Read a FAT entry (28 significant bits).
	pub fn read_fat_entry(&self, cluster: u32) -> Result<u32> {
		if cluster >= self.total_clusters + 2 {
			return Err(Error::EINVAL);
		}
		let (sector, offset) = self.fat_entry_offset(cluster);
		let mut buf = vec![0u8; self.bytes_per_sector as usize];
		self.dev
			.read_blocks((self.reserved_sectors + sector) as u64, 1, &mut buf)?;
		Ok(read_u32(&buf, offset) & FAT_ENTRY_MASK)
	}

	/// Write a FAT entry into every FAT copy, preserving the upper four
	/// bits of the raw 32-bit value.
	pub fn write_fat_entry(&self, cluster: u32, value: u32) -> Result<()> {
		if cluster >= self.total_clusters + 2 {
			return Err(Error::EINVAL);
		}
		let (sector, offset) = self.fat_entry_offset(cluster);
		let mut buf = vec![0u8; self.bytes_per_sector as usize];

		for copy in 0..self.num_fats {
			let lba = (self.reserved_sectors + copy * self.fat_size + sector) as u64;
			self.dev.read_blocks(lba, 1, &mut buf)?;
			let raw = read_u32(&buf, offset);
			let new = (raw & !FAT_ENTRY_MASK) | (value & FAT_ENTRY_MASK);
			buf[offset..offset + 4].copy_from_slice(&new.to_le_bytes());
			self.dev.write_blocks(lba, 1, &buf)?;
		}
		Ok(())
	}

	/// Next cluster in a chain, `None` at end-of-chain/bad/out-of-range.
	pub fn next_cluster(&self, cluster: u32) -> Result<Option<u32>> {
		let value = self.read_fat_entry(cluster)?;
		if value == FAT_BAD || value >= FAT_EOC || !self.cluster_in_range(value) {
			return Ok(None);
		}
		Ok(Some(value))
	}

	/// Number of clusters in the chain starting at `start`. Walks are
	/// bounded by the cluster count so a corrupted cyclic FAT terminates.
	pub fn chain_length(&self, start: u32) -> Result<u32> {
		let mut cluster = start;
		let mut length = 0;
		while length < self.total_clusters {
			length += 1;
			match self.next_cluster(cluster)? {
				Some(next) => cluster = next,
				None => break,
			}
		}
		Ok(length)
	}

	/// Claim the first free cluster and mark it end-of-chain.
	pub fn allocate_cluster(&self) -> Result<u32> {
		for cluster in 2..self.total_clusters + 2 {
			if self.read_fat_entry(cluster)? == FAT_FREE {
				self.write_fat_entry(cluster, FAT_EOC)?;
				return Ok(cluster);
			}
		}
		Err(Error::ENOSPC)
	}

	/// Append a fresh cluster after `last` and return it.
	pub fn extend_chain(&self, last: u32) -> Result<u32> {
		if !self.cluster_in_range(last) {
			return Err(Error::EINVAL);
		}
		let new = self.allocate_cluster()?;
		self.write_fat_entry(last, new)?;
		Ok(new)
	}

	/// Release every cluster of the chain starting at `start`.
	pub fn free_chain(&self, start: u32) -> Result<()> {
		if !self.cluster_in_range(start) {
			return Err(Error::EINVAL);
		}
		let mut cluster = start;
		for _ in 0..self.total_clusters {
			let next = self.next_cluster(cluster)?;
			self.write_fat_entry(cluster, FAT_FREE)?;
			match next {
				Some(n) => cluster = n,
				None => break,
			}
		}
		Ok(())
	}

	/// Parse every entry of the directory rooted at `start_cluster`.
	pub fn read_dir(&self, start_cluster: u32) -> Result<Vec<DirEntryInfo>> {
		let mut out = Vec::new();
		let mut lfn = LfnState::new();
		let mut buf = vec![0u8; self.bytes_per_cluster as usize];
		let mut cluster = start_cluster;
		let mut hops = 0;

		loop {
			self.read_cluster(cluster, &mut buf)?;

			for entry in buf.chunks_exact(DIR_ENTRY_SIZE) {
				match entry[0] {
					// Free entry terminating the directory.
					0x00 => return Ok(out),
					// Deleted slot.
					0xe5 => {
						lfn.reset();
						continue;
					}
					_ => {}
				}

				let attr = entry[11];
				if attr & 0x3f == ATTR_LFN {
					lfn.feed(entry);
					continue;
				}
				if attr & ATTR_VOLUME_ID != 0 {
					lfn.reset();
					continue;
				}

				let short = format_short_name(&entry[..11]);
				let name = lfn.take(lfn_checksum(&entry[..11])).unwrap_or(short);
				let first_cluster =
					(read_u16(entry, 20) as u32) << 16 | read_u16(entry, 26) as u32;
				out.push(DirEntryInfo {
					name,
					first_cluster,
					file_size: read_u32(entry, 28),
					attr,
					is_dir: attr & ATTR_DIRECTORY != 0,
				});
			}

			hops += 1;
			match self.next_cluster(cluster)? {
				Some(next) if hops < self.total_clusters => cluster = next,
				_ => break,
			}
		}
		Ok(out)
	}

	/// Case-insensitive single-component lookup.
	pub fn find_in_dir(&self, dir_cluster: u32, name: &str) -> Result<Option<DirEntryInfo>> {
		Ok(self
			.read_dir(dir_cluster)?
			.into_iter()
			.find(|e| e.name.eq_ignore_ascii_case(name)))
	}

	/// Resolve a `/`-separated path from the root directory. The empty
	/// path names the root itself.
	pub fn resolve_path(&self, path: &str) -> Result<DirEntryInfo> {
		let mut current = DirEntryInfo {
			name: String::from("/"),
			first_cluster: self.root_cluster,
			file_size: 0,
			attr: ATTR_DIRECTORY,
			is_dir: true,
		};

		for component in path.split('/').filter(|c| !c.is_empty()) {
			if !current.is_dir {
				return Err(Error::ENOTDIR);
			}
			if current.first_cluster == 0 {
				return Err(Error::EINVAL);
			}
			current = self
				.find_in_dir(current.first_cluster, component)?
				.ok_or(Error::ENOENT)?;
		}
		Ok(current)
	}
}

// ----------------------------------------------------------------------
// VFS driver
// ----------------------------------------------------------------------

struct Fat32Ops;

impl FilesystemOps for Fat32Ops {
	fn mount(&self, device: Option<&str>, _data: Option<&str>) -> Result<FsPrivate> {
		let name = device.ok_or(Error::ENODEV)?;
		let dev = crate::block::find(name).ok_or(Error::ENODEV)?;
		let fs = Fat32Fs::mount(dev)?;
		Ok(Box::new(fs))
	}

	fn unmount(&self, _state: &mut FsPrivate) -> Result<()> {
		crate::log_info!("fat32: unmounted");
		Ok(())
	}

	fn stat(&self, state: &FsPrivate, path: &str) -> Result<VfsStat> {
		let fs = state.downcast_ref::<Fat32Fs>().ok_or(Error::EINVAL)?;
		let entry = fs.resolve_path(path)?;
		Ok(VfsStat {
			st_mode: if entry.is_dir {
				S_IFDIR | 0o755
			} else if entry.attr & ATTR_READ_ONLY != 0 {
				S_IFREG | 0o444
			} else {
				S_IFREG | 0o644
			},
			st_size: entry.file_size as i64,
			st_blksize: fs.bytes_per_cluster,
			st_mtime: 0,
		})
	}

	fn readdir(&self, state: &FsPrivate, path: &str, entries: &mut [VfsDirent]) -> Result<usize> {
		let fs = state.downcast_ref::<Fat32Fs>().ok_or(Error::EINVAL)?;
		let dir = fs.resolve_path(path)?;
		if !dir.is_dir {
			return Err(Error::ENOTDIR);
		}
		if dir.first_cluster == 0 {
			return Err(Error::EINVAL);
		}

		let mut count = 0;
		for entry in fs.read_dir(dir.first_cluster)? {
			if count >= entries.len() {
				break;
			}
			if entry.name == "." || entry.name == ".." {
				continue;
			}
			entries[count] = VfsDirent {
				d_type: if entry.is_dir {
					FileType::Dir
				} else {
					FileType::File
				},
				name: entry.name,
			};
			count += 1;
		}
		Ok(count)
	}
}

/// Register the FAT32 driver with the global VFS.
pub fn init() {
	if let Err(e) = super::register_filesystem("fat32", Arc::new(Fat32Ops), FsFlags::empty()) {
		crate::log_warn!("fat32: driver registration failed: {}", e);
	} else {
		crate::log_info!("fat32 filesystem driver registered");
	}
}

/// Register the FAT32 driver into a specific VFS instance.
pub fn register(vfs: &mut super::Vfs) -> Result<()> {
	vfs.register_filesystem("fat32", Arc::new(Fat32Ops), FsFlags::empty())
}
