// SPDX-License-Identifier: GPL-2.0

//! Memory management

pub mod buddy;
pub mod heap;
pub mod kmalloc;

pub use buddy::BuddyAllocator;
pub use kmalloc::{kfree, kmalloc};

use crate::sync::Spinlock;

/// Global buddy allocator; this lock is the allocator's spinlock.
pub(crate) static BUDDY: Spinlock<Option<BuddyAllocator>> = Spinlock::new(None);

/// Hand the memory pool picked by the boot stage to the buddy allocator.
///
/// # Safety
///
/// `pool_start..pool_start + pool_size` must be exclusively owned, mapped,
/// writable memory. Must be called once, before anything allocates from
/// the pool.
pub unsafe fn init(pool_start: *mut u8, pool_size: usize, hhdm_offset: u64) {
	let allocator = unsafe { BuddyAllocator::new(pool_start, pool_size, hhdm_offset) };
	let total = allocator.total_bytes();

	let mut buddy = BUDDY.lock();
	if buddy.is_some() {
		panic!("memory: buddy allocator initialized twice");
	}
	*buddy = Some(allocator);
	drop(buddy);

	crate::log_info!("buddy allocator manages {} KiB", total / 1024);
}

/// Usable pool size in bytes, 0 before init.
pub fn total_bytes() -> usize {
	BUDDY.lock().as_ref().map_or(0, |b| b.total_bytes())
}

/// Bytes currently free in the pool, 0 before init.
pub fn free_bytes() -> usize {
	BUDDY.lock().as_ref().map_or(0, |b| b.free_bytes())
}

/// Bytes handed out through kmalloc and not yet freed.
pub fn used_bytes() -> usize {
	kmalloc::allocated_bytes()
}
