// SPDX-License-Identifier: GPL-2.0

//! Synchronization primitives

// Re-export common synchronization types
pub use alloc::sync::Arc;
use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

pub use spin::Mutex;
pub use spin::Once;
pub use spin::RwLock;

/// Test-and-set spinlock.
///
/// The scheduler is cooperative and single-threaded, but the allocator and
/// the global subsystem tables are still guarded so driver paths (and a
/// future multi-core port) stay correct.
pub struct Spinlock<T> {
	locked: AtomicBool,
	data: UnsafeCell<T>,
}

unsafe impl<T: Send> Sync for Spinlock<T> {}
unsafe impl<T: Send> Send for Spinlock<T> {}

impl<T> Spinlock<T> {
	pub const fn new(data: T) -> Self {
		Self {
			locked: AtomicBool::new(false),
			data: UnsafeCell::new(data),
		}
	}

	pub fn lock(&self) -> SpinlockGuard<'_, T> {
		while self
			.locked
			.compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
			.is_err()
		{
			while self.locked.load(Ordering::Relaxed) {
				core::hint::spin_loop();
			}
		}

		SpinlockGuard { lock: self }
	}

	/// Acquire the lock without spinning; `None` if it is already held.
	pub fn try_lock(&self) -> Option<SpinlockGuard<'_, T>> {
		if self
			.locked
			.compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
			.is_ok()
		{
			Some(SpinlockGuard { lock: self })
		} else {
			None
		}
	}
}

pub struct SpinlockGuard<'a, T> {
	lock: &'a Spinlock<T>,
}

impl<T> Deref for SpinlockGuard<'_, T> {
	type Target = T;

	fn deref(&self) -> &Self::Target {
		unsafe { &*self.lock.data.get() }
	}
}

impl<T> DerefMut for SpinlockGuard<'_, T> {
	fn deref_mut(&mut self) -> &mut Self::Target {
		unsafe { &mut *self.lock.data.get() }
	}
}

impl<T> Drop for SpinlockGuard<'_, T> {
	fn drop(&mut self) {
		self.lock.locked.store(false, Ordering::Release);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn lock_round_trip() {
		let lock = Spinlock::new(5u32);
		{
			let mut guard = lock.lock();
			*guard += 1;
		}
		assert_eq!(*lock.lock(), 6);
	}

	#[test]
	fn try_lock_fails_while_held() {
		let lock = Spinlock::new(());
		let guard = lock.lock();
		assert!(lock.try_lock().is_none());
		drop(guard);
		assert!(lock.try_lock().is_some());
	}
}
