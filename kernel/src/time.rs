// SPDX-License-Identifier: GPL-2.0

//! Time keeping
//!
//! The platform timer fires every millisecond and calls [`timer_tick`],
//! which advances the jiffies counter and drives the NVM scheduler.

use core::sync::atomic::{AtomicU64, Ordering};

/// Timer tick rate (ticks per second).
pub const HZ: u64 = 1000;

static JIFFIES: AtomicU64 = AtomicU64::new(0);

/// One timer interrupt worth of bookkeeping.
pub fn timer_tick() {
	JIFFIES.fetch_add(1, Ordering::Relaxed);
	crate::nvm::timer_tick();
}

/// Ticks since boot.
pub fn jiffies() -> u64 {
	JIFFIES.load(Ordering::Relaxed)
}

/// Milliseconds since boot.
pub fn uptime_ms() -> u64 {
	jiffies() * 1000 / HZ
}
