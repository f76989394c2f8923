// SPDX-License-Identifier: GPL-2.0

//! Cooperative round-robin scheduler
//!
//! A one-millisecond tick advances a counter; every `TIME_SLICE_MS` ticks
//! the cursor moves to the next runnable process, which then executes up
//! to a quantum of instructions in-line. There is no preemption inside a
//! quantum; a process leaves it by halting, faulting, blocking or simply
//! using up its instructions.

use super::{Nvm, MAX_PROCESSES, QUANTUM_INSTRUCTIONS, TIME_SLICE_MS};

impl Nvm {
	fn runnable(&self, pid: usize) -> bool {
		let proc = &self.processes[pid];
		proc.active && !proc.blocked
	}

	/// One timer tick; runs a quantum when the slice boundary is hit.
	pub fn timer_tick(&mut self) {
		self.ticks = self.ticks.wrapping_add(1);
		if self.ticks % TIME_SLICE_MS != 0 {
			return;
		}

		// Advance the cursor to the next runnable process, wrapping at
		// most once around the pool.
		let start = self.current;
		loop {
			self.current = (self.current + 1) % MAX_PROCESSES;
			if self.runnable(self.current) || self.current == start {
				break;
			}
		}

		if !self.runnable(self.current) {
			// Nothing to do; leave the cursor where it was.
			self.current = start;
			return;
		}

		let pid = self.current;
		for _ in 0..QUANTUM_INSTRUCTIONS {
			let proc = &self.processes[pid];
			if proc.active && !proc.blocked && proc.ip < proc.size() {
				if !self.execute_instruction(pid) {
					break;
				}
			} else {
				// Walking off the end of the program is a clean exit.
				let proc = &mut self.processes[pid];
				if proc.active && proc.ip >= proc.size() {
					proc.active = false;
					proc.exit_code = 0;
				}
				break;
			}
		}
	}
}
