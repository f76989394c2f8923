// SPDX-License-Identifier: GPL-2.0

//! The nova kernel crate.
//!
//! This crate provides the core kernel subsystems: physical memory
//! management (buddy allocator plus the tagged `kmalloc` layer), the block
//! device registry, the virtual filesystem with its devfs/procfs/FAT32
//! backends, and the NVM bytecode runtime with its cooperative scheduler
//! and capability-gated syscalls.
//!
//! The crate builds freestanding for the kernel proper and with `std` for
//! the host test suite; architecture-specific pieces are compiled only for
//! bare-metal x86_64 targets.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod arch;
pub mod block;
pub mod boot;
pub mod console;
pub mod crypto;
pub mod error;
pub mod fs;
pub mod initramfs;
pub mod logging;
pub mod memory;
pub mod nvm;
pub mod panic;
pub mod sync;
pub mod time;
pub mod types;

/// Kernel version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = "nova";

/// Bring up every subsystem that does not depend on boot-loader data.
///
/// The boot stage is expected to have called [`memory::init`] with the
/// region picked from the memory map before this runs; block drivers
/// register themselves afterwards and are published into `/dev` by
/// [`fs::blockdev::init`].
pub fn init() {
	logging::init();
	block::init();
	fs::init();
	fs::fat32::init();
	nvm::init();
	crate::log_info!("{} {} core initialized", NAME, VERSION);
}
