// SPDX-License-Identifier: GPL-2.0

//! Process information filesystem
//!
//! procfs mirrors devfs's two routes: a virtual filesystem mounted at
//! `/proc` for listings/stat, plus legacy pseudo files for the actual
//! content. The static entries describe the machine; per-PID directories
//! appear when a process is created and vanish when it exits.

use alloc::boxed::Box;
use alloc::format;
use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::error::{Error, Result};
use crate::sync::Spinlock;

use super::{
	DeviceOps, FileType, FilesystemOps, FsFlags, FsPrivate, MountFlags, VfsDirent, VfsStat, Vfs,
	S_IFDIR, S_IFREG,
};

const BASE_ENTRIES: [&str; 5] = ["cpuinfo", "meminfo", "pci", "uptime", "version"];
const PID_ENTRIES: [&str; 3] = ["status", "stack", "bytecode"];

/// PIDs with a live `/proc/<pid>` directory.
static PROC_PIDS: Spinlock<Vec<u8>> = Spinlock::new(Vec::new());

/// Copy the window of `text` at `*pos` into `buf`.
fn serve_text(text: &str, buf: &mut [u8], pos: &mut i64) -> usize {
	let bytes = text.as_bytes();
	let at = (*pos).max(0) as usize;
	if at >= bytes.len() {
		return 0;
	}
	let n = buf.len().min(bytes.len() - at);
	buf[..n].copy_from_slice(&bytes[at..at + n]);
	*pos += n as i64;
	n
}

// ----------------------------------------------------------------------
// Static entries
// ----------------------------------------------------------------------

fn cpuinfo_text() -> String {
	#[cfg(target_arch = "x86_64")]
	{
		let leaf0 = unsafe { core::arch::x86_64::__cpuid(0) };
		let mut vendor = [0u8; 12];
		vendor[0..4].copy_from_slice(&leaf0.ebx.to_le_bytes());
		vendor[4..8].copy_from_slice(&leaf0.edx.to_le_bytes());
		vendor[8..12].copy_from_slice(&leaf0.ecx.to_le_bytes());
		let vendor = core::str::from_utf8(&vendor).unwrap_or("unknown");

		let mut brand = [0u8; 48];
		for (i, leaf) in (0x8000_0002u32..=0x8000_0004).enumerate() {
			let regs = unsafe { core::arch::x86_64::__cpuid(leaf) };
			let base = i * 16;
			brand[base..base + 4].copy_from_slice(&regs.eax.to_le_bytes());
			brand[base + 4..base + 8].copy_from_slice(&regs.ebx.to_le_bytes());
			brand[base + 8..base + 12].copy_from_slice(&regs.ecx.to_le_bytes());
			brand[base + 12..base + 16].copy_from_slice(&regs.edx.to_le_bytes());
		}
		let brand = core::str::from_utf8(&brand).unwrap_or("unknown").trim_matches('\0').trim();

		format!(
			"processor\t: 0\nvendor_id\t: {}\nmodel name\t: {}\n",
			vendor, brand
		)
	}
	#[cfg(not(target_arch = "x86_64"))]
	{
		String::from("processor\t: 0\nvendor_id\t: unknown\nmodel name\t: unknown\n")
	}
}

struct CpuinfoFile;

impl DeviceOps for CpuinfoFile {
	fn read(&self, buf: &mut [u8], pos: &mut i64) -> Result<usize> {
		Ok(serve_text(&cpuinfo_text(), buf, pos))
	}
}

struct MeminfoFile;

impl DeviceOps for MeminfoFile {
	fn read(&self, buf: &mut [u8], pos: &mut i64) -> Result<usize> {
		let total = crate::memory::total_bytes();
		let used = crate::memory::used_bytes();
		let text = format!(
			"MemTotal       : {} KiB\nMemUsed        : {} KiB\nMemFree        : {} KiB\n",
			total / 1024,
			used / 1024,
			total.saturating_sub(used) / 1024
		);
		Ok(serve_text(&text, buf, pos))
	}
}

struct PciFile;

impl DeviceOps for PciFile {
	fn read(&self, _buf: &mut [u8], _pos: &mut i64) -> Result<usize> {
		// Bus enumeration lives outside the core.
		Ok(0)
	}
}

struct UptimeFile;

impl DeviceOps for UptimeFile {
	fn read(&self, buf: &mut [u8], pos: &mut i64) -> Result<usize> {
		let ms = crate::time::uptime_ms();
		let text = format!("{}.{:02}\n", ms / 1000, (ms % 1000) / 10);
		Ok(serve_text(&text, buf, pos))
	}
}

struct VersionFile;

impl DeviceOps for VersionFile {
	fn read(&self, buf: &mut [u8], pos: &mut i64) -> Result<usize> {
		let text = format!("{} {}\n", crate::NAME, crate::VERSION);
		Ok(serve_text(&text, buf, pos))
	}
}

// ----------------------------------------------------------------------
// Per-PID entries
// ----------------------------------------------------------------------

struct PidStatusFile {
	pid: u8,
}

impl DeviceOps for PidStatusFile {
	fn read(&self, buf: &mut [u8], pos: &mut i64) -> Result<usize> {
		let text = crate::nvm::report_status(self.pid)?;
		Ok(serve_text(&text, buf, pos))
	}
}

struct PidStackFile {
	pid: u8,
}

impl DeviceOps for PidStackFile {
	fn read(&self, buf: &mut [u8], pos: &mut i64) -> Result<usize> {
		let text = crate::nvm::report_stack(self.pid)?;
		Ok(serve_text(&text, buf, pos))
	}
}

struct PidBytecodeFile {
	pid: u8,
}

impl DeviceOps for PidBytecodeFile {
	fn read(&self, buf: &mut [u8], pos: &mut i64) -> Result<usize> {
		let text = crate::nvm::report_bytecode(self.pid)?;
		Ok(serve_text(&text, buf, pos))
	}
}

// ----------------------------------------------------------------------
// Mounted route
// ----------------------------------------------------------------------

struct ProcfsOps;

impl FilesystemOps for ProcfsOps {
	fn mount(&self, _device: Option<&str>, _data: Option<&str>) -> Result<FsPrivate> {
		Ok(Box::new(()))
	}

	fn readdir(&self, _state: &FsPrivate, path: &str, entries: &mut [VfsDirent]) -> Result<usize> {
		let mut listing: Vec<VfsDirent> = Vec::new();

		if path.is_empty() {
			for name in BASE_ENTRIES {
				listing.push(VfsDirent {
					name: String::from(name),
					d_type: FileType::File,
				});
			}
			for pid in PROC_PIDS.lock().iter() {
				listing.push(VfsDirent {
					name: pid.to_string(),
					d_type: FileType::Dir,
				});
			}
		} else if let Ok(pid) = path.parse::<u8>() {
			if !PROC_PIDS.lock().contains(&pid) {
				return Err(Error::ENOENT);
			}
			for name in PID_ENTRIES {
				listing.push(VfsDirent {
					name: String::from(name),
					d_type: FileType::File,
				});
			}
		} else if BASE_ENTRIES.contains(&path) {
			return Err(Error::ENOTDIR);
		} else {
			return Err(Error::ENOENT);
		}

		let count = listing.len().min(entries.len());
		for (slot, entry) in entries.iter_mut().zip(listing.into_iter()) {
			*slot = entry;
		}
		Ok(count)
	}

	fn stat(&self, _state: &FsPrivate, path: &str) -> Result<VfsStat> {
		let dir_stat = VfsStat {
			st_mode: S_IFDIR | 0o555,
			st_size: 0,
			st_blksize: 512,
			st_mtime: 0,
		};
		let file_stat = VfsStat {
			st_mode: S_IFREG | 0o444,
			st_size: 0,
			st_blksize: 512,
			st_mtime: 0,
		};

		if path.is_empty() {
			return Ok(dir_stat);
		}
		if BASE_ENTRIES.contains(&path) {
			return Ok(file_stat);
		}

		let mut parts = path.splitn(2, '/');
		let pid_part = parts.next().unwrap_or("");
		let rest = parts.next();
		let pid: u8 = pid_part.parse().map_err(|_| Error::ENOENT)?;
		if !PROC_PIDS.lock().contains(&pid) {
			return Err(Error::ENOENT);
		}
		match rest {
			None => Ok(dir_stat),
			Some(entry) if PID_ENTRIES.contains(&entry) => Ok(file_stat),
			Some(_) => Err(Error::ENOENT),
		}
	}
}

/// Install the static entries and mount procfs at `/proc`.
pub fn init(vfs: &mut Vfs) {
	vfs.mkdir("/proc").ok();
	vfs.pseudo_register("/proc/cpuinfo", Arc::new(CpuinfoFile)).ok();
	vfs.pseudo_register("/proc/meminfo", Arc::new(MeminfoFile)).ok();
	vfs.pseudo_register("/proc/pci", Arc::new(PciFile)).ok();
	vfs.pseudo_register("/proc/uptime", Arc::new(UptimeFile)).ok();
	vfs.pseudo_register("/proc/version", Arc::new(VersionFile)).ok();

	vfs.register_filesystem("procfs", Arc::new(ProcfsOps), FsFlags::VIRTUAL | FsFlags::NODEV)
		.ok();
	if let Err(e) = vfs.mount_fs("procfs", "/proc", None, MountFlags::empty(), None) {
		crate::log_warn!("procfs: mount failed: {}", e);
	}
}

/// Create `/proc/<pid>` with its status/stack/bytecode files.
pub fn register_pid(vfs: &mut Vfs, pid: u8) {
	let dir = format!("/proc/{}", pid);
	vfs.mkdir(&dir).ok();
	vfs.pseudo_register(&format!("{}/status", dir), Arc::new(PidStatusFile { pid })).ok();
	vfs.pseudo_register(&format!("{}/stack", dir), Arc::new(PidStackFile { pid })).ok();
	vfs.pseudo_register(&format!("{}/bytecode", dir), Arc::new(PidBytecodeFile { pid })).ok();

	let mut pids = PROC_PIDS.lock();
	if !pids.contains(&pid) {
		pids.push(pid);
	}
}

/// Tear down `/proc/<pid>`.
pub fn unregister_pid(vfs: &mut Vfs, pid: u8) {
	let dir = format!("/proc/{}", pid);
	for entry in PID_ENTRIES {
		vfs.delete(&format!("{}/{}", dir, entry)).ok();
	}
	vfs.rmdir(&dir).ok();
	PROC_PIDS.lock().retain(|&p| p != pid);
}

/// Process-table hook: maintain `/proc/<pid>` in the global VFS.
pub(crate) fn register_pid_global(pid: u8) {
	super::with_vfs(|vfs| register_pid(vfs, pid));
}

/// Process-table hook: drop `/proc/<pid>` from the global VFS.
pub(crate) fn unregister_pid_global(pid: u8) {
	super::with_vfs(|vfs| unregister_pid(vfs, pid));
}
