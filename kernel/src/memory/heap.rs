// SPDX-License-Identifier: GPL-2.0

//! Kernel heap glue
//!
//! `alloc` collections used throughout the kernel need a global allocator
//! on freestanding builds. Until the buddy pool exists, allocations come
//! from a fixed bootstrap heap; afterwards they are plain kmalloc blocks.
//! Host/test builds use the platform allocator and none of this is
//! compiled.

#[cfg(all(not(test), target_os = "none"))]
mod freestanding {
	use core::alloc::{GlobalAlloc, Layout};
	use core::ptr::{self, NonNull};

	use linked_list_allocator::Heap;

	use crate::memory::kmalloc::{kfree, kmalloc, KMALLOC_ALIGN};
	use crate::sync::Spinlock;

	const BOOT_HEAP_SIZE: usize = 1024 * 1024;

	static mut BOOT_HEAP_SPACE: [u8; BOOT_HEAP_SIZE] = [0; BOOT_HEAP_SIZE];
	static BOOT_HEAP: Spinlock<Heap> = Spinlock::new(Heap::empty());

	fn boot_heap_range() -> (usize, usize) {
		let start = ptr::addr_of!(BOOT_HEAP_SPACE) as usize;
		(start, start + BOOT_HEAP_SIZE)
	}

	struct KernelAllocator;

	unsafe impl GlobalAlloc for KernelAllocator {
		unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
			// kmalloc payloads are only KMALLOC_ALIGN-aligned; anything
			// stricter stays on the bootstrap heap, which honors layouts.
			if layout.align() <= KMALLOC_ALIGN {
				if let Some(ptr) = kmalloc(layout.size()) {
					return ptr.as_ptr();
				}
			}

			let mut heap = BOOT_HEAP.lock();
			if heap.size() == 0 {
				unsafe {
					heap.init(ptr::addr_of_mut!(BOOT_HEAP_SPACE) as *mut u8, BOOT_HEAP_SIZE);
				}
			}
			heap.allocate_first_fit(layout)
				.map(|p| p.as_ptr())
				.unwrap_or(ptr::null_mut())
		}

		unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
			let addr = ptr as usize;
			let (start, end) = boot_heap_range();
			if addr >= start && addr < end {
				unsafe {
					BOOT_HEAP.lock().deallocate(NonNull::new_unchecked(ptr), layout);
				}
			} else {
				unsafe { kfree(NonNull::new_unchecked(ptr)) };
			}
		}
	}

	#[global_allocator]
	static ALLOCATOR: KernelAllocator = KernelAllocator;
}
