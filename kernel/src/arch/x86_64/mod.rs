// SPDX-License-Identifier: GPL-2.0

//! x86_64 specific primitives

pub mod port;

/// Derive a 64-bit entropy seed from the time stamp counter.
pub fn entropy_seed() -> u64 {
	let tsc = unsafe { core::arch::x86_64::_rdtsc() };
	// SplitMix64 scramble so low-entropy TSC bits spread over the word.
	let mut z = tsc.wrapping_add(0x9e37_79b9_7f4a_7c15);
	z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
	z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
	z ^ (z >> 31)
}
