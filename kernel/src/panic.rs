// SPDX-License-Identifier: GPL-2.0

//! Kernel panic handling

/// Stop the CPU for good.
pub fn halt_loop() -> ! {
	loop {
		#[cfg(all(target_arch = "x86_64", target_os = "none"))]
		unsafe {
			core::arch::asm!("hlt");
		}

		#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
		core::hint::spin_loop();
	}
}

#[cfg(all(not(test), target_os = "none"))]
#[panic_handler]
fn panic_handler(info: &core::panic::PanicInfo) -> ! {
	// Interrupts stay off from here on; nothing below may allocate.
	#[cfg(target_arch = "x86_64")]
	unsafe {
		core::arch::asm!("cli");
	}

	crate::console::write_str("\n\n=== KERNEL PANIC ===\n");
	crate::console::write_fmt(format_args!("{}\n", info));
	crate::console::write_str("====================\n");

	halt_loop()
}
