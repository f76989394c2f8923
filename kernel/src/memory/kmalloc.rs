// SPDX-License-Identifier: GPL-2.0

//! Tagged kernel allocations on top of the buddy allocator
//!
//! Every allocation is preceded by a small header recording the buddy
//! order, a magic value and the user-visible size. `kfree` trusts nothing:
//! a wrong magic or an impossible order means the header was trampled and
//! the kernel stops.

use core::ptr::NonNull;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::memory::buddy::{self, BuddyAllocator};

/// Marker written into every allocation header.
pub const ALLOC_MAGIC: u32 = 0xA110_C123;

#[repr(C)]
struct AllocHeader {
	order: u32,
	magic: u32,
	user_size: usize,
}

const HEADER_SIZE: usize = core::mem::size_of::<AllocHeader>();

/// Payload alignment every kmalloc allocation guarantees.
pub const KMALLOC_ALIGN: usize = HEADER_SIZE;

static ALLOCATED_BYTES: AtomicUsize = AtomicUsize::new(0);
static ALLOC_COUNT: AtomicUsize = AtomicUsize::new(0);
static FREE_COUNT: AtomicUsize = AtomicUsize::new(0);

fn alloc_from(allocator: &mut BuddyAllocator, size: usize) -> Option<NonNull<u8>> {
	if size == 0 {
		return None;
	}
	let total = size.checked_add(HEADER_SIZE)?;
	let order = buddy::order_for(total)?;

	let block = allocator.alloc(total)?;
	let header = block.as_ptr() as *mut AllocHeader;
	unsafe {
		header.write(AllocHeader {
			order,
			magic: ALLOC_MAGIC,
			user_size: size,
		});
		NonNull::new(block.as_ptr().add(HEADER_SIZE))
	}
}

/// Returns the user size recorded in the header.
///
/// # Panics
///
/// Panics on a corrupted header (bad magic or impossible order); by the
/// time that is observable the heap can no longer be trusted.
unsafe fn free_into(allocator: &mut BuddyAllocator, ptr: NonNull<u8>) -> usize {
	let header_ptr = unsafe { ptr.as_ptr().sub(HEADER_SIZE) } as *mut AllocHeader;
	let header = unsafe { header_ptr.read() };

	if header.magic != ALLOC_MAGIC {
		panic!(
			"kfree: corrupted allocation header at {:p} (magic {:#010x})",
			ptr, header.magic
		);
	}
	if !(buddy::MIN_ORDER..=buddy::MAX_ORDER).contains(&header.order) {
		panic!(
			"kfree: impossible order {} in allocation header at {:p}",
			header.order, ptr
		);
	}

	allocator.free(header_ptr as *mut u8, header.order);
	header.user_size
}

/// Allocate `size` bytes from the kernel pool, `None` on exhaustion.
pub fn kmalloc(size: usize) -> Option<NonNull<u8>> {
	let mut guard = crate::memory::BUDDY.lock();
	let allocator = guard.as_mut()?;
	let ptr = alloc_from(allocator, size)?;
	drop(guard);

	ALLOCATED_BYTES.fetch_add(size, Ordering::Relaxed);
	ALLOC_COUNT.fetch_add(1, Ordering::Relaxed);
	Some(ptr)
}

/// Release a pointer previously returned by [`kmalloc`].
///
/// # Safety
///
/// `ptr` must come from `kmalloc` and must not be used afterwards.
pub unsafe fn kfree(ptr: NonNull<u8>) {
	let mut guard = crate::memory::BUDDY.lock();
	let Some(allocator) = guard.as_mut() else {
		drop(guard);
		crate::log_error!("kfree before the buddy pool exists: {:p}", ptr);
		return;
	};
	let user_size = unsafe { free_into(allocator, ptr) };
	drop(guard);

	let mut outstanding = ALLOCATED_BYTES.load(Ordering::Relaxed);
	loop {
		let next = outstanding.saturating_sub(user_size);
		match ALLOCATED_BYTES.compare_exchange_weak(
			outstanding,
			next,
			Ordering::Relaxed,
			Ordering::Relaxed,
		) {
			Ok(_) => break,
			Err(seen) => outstanding = seen,
		}
	}
	FREE_COUNT.fetch_add(1, Ordering::Relaxed);
}

/// Bytes handed out and not yet freed.
pub fn allocated_bytes() -> usize {
	ALLOCATED_BYTES.load(Ordering::Relaxed)
}

/// Number of successful `kmalloc` calls.
pub fn alloc_count() -> usize {
	ALLOC_COUNT.load(Ordering::Relaxed)
}

/// Number of completed `kfree` calls.
pub fn free_count() -> usize {
	FREE_COUNT.load(Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
	use super::*;
	use core::alloc::Layout;

	fn with_allocator(test: impl FnOnce(&mut BuddyAllocator)) {
		let size = 2 * 1024 * 1024 + 64 * 1024;
		let layout = Layout::from_size_align(size, 4096).unwrap();
		let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
		assert!(!ptr.is_null());
		let mut allocator = unsafe { BuddyAllocator::new(ptr, size, 0) };
		test(&mut allocator);
		drop(allocator);
		unsafe { std::alloc::dealloc(ptr, layout) };
	}

	#[test]
	fn round_trip_restores_pool() {
		with_allocator(|buddy| {
			let initial = buddy.free_bytes();

			let p = alloc_from(buddy, 256).unwrap();
			unsafe {
				core::ptr::write_bytes(p.as_ptr(), 0xab, 256);
			}
			assert!(buddy.free_bytes() < initial);

			let user = unsafe { free_into(buddy, p) };
			assert_eq!(user, 256);
			assert_eq!(buddy.free_bytes(), initial);
		});
	}

	#[test]
	fn payload_is_aligned() {
		with_allocator(|buddy| {
			let p = alloc_from(buddy, 100).unwrap();
			assert_eq!(p.as_ptr() as usize % KMALLOC_ALIGN, 0);
			unsafe { free_into(buddy, p) };
		});
	}

	#[test]
	fn zero_size_fails() {
		with_allocator(|buddy| {
			assert!(alloc_from(buddy, 0).is_none());
		});
	}

	#[test]
	#[should_panic(expected = "corrupted allocation header")]
	fn corrupted_magic_panics() {
		with_allocator(|buddy| {
			let p = alloc_from(buddy, 64).unwrap();
			unsafe {
				// Trample the magic field right behind the payload.
				let header = p.as_ptr().sub(HEADER_SIZE) as *mut u32;
				header.add(1).write(0xdead_beef);
				free_into(buddy, p);
			}
		});
	}

	#[test]
	fn global_kmalloc_without_pool_fails() {
		// The global pool is only initialized by the boot path.
		assert!(kmalloc(64).is_none());
	}
}
