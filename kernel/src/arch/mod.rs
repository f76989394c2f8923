// SPDX-License-Identifier: GPL-2.0

//! Architecture support

#[cfg(target_arch = "x86_64")]
pub mod x86_64;

pub mod io;

/// Best-effort hardware entropy for seeding the urandom generator.
///
/// Not suitable for key material on its own; good enough to decorrelate
/// boots.
pub fn hw_entropy() -> u64 {
	#[cfg(target_arch = "x86_64")]
	{
		x86_64::entropy_seed()
	}
	#[cfg(not(target_arch = "x86_64"))]
	{
		0x9e37_79b9_7f4a_7c15
	}
}
