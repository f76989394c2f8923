// SPDX-License-Identifier: GPL-2.0

//! NVM bytecode runtime
//!
//! Programs are raw byte streams starting with the `NVM0` signature and
//! run on a stack machine with 32-bit signed cells: an instruction
//! pointer, an operand stack with a frame pointer, a local variable file
//! and a capability list gating the privileged operations. Processes live
//! in a fixed pool and are driven by the cooperative round-robin
//! scheduler in [`sched`].

pub mod caps;
pub mod instructions;
pub mod sched;
pub mod syscalls;

use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;

use crate::error::{Error, Result};
use crate::sync::Spinlock;

pub const MAX_PROCESSES: usize = 16;
pub const STACK_SIZE: usize = 1024;
pub const MAX_LOCALS: usize = 256;
pub const MAX_CAPS: usize = 8;
pub const MAX_MESSAGES: usize = 32;

/// Scheduler quantum length in timer ticks.
pub const TIME_SLICE_MS: u32 = 10;
/// Instructions executed per quantum.
pub const QUANTUM_INSTRUCTIONS: u32 = 5000;

/// Every program leads with these four bytes; `ip` starts right after.
pub const SIGNATURE: [u8; 4] = *b"NVM0";

/// One process slot.
pub struct Process {
	pub pid: u8,
	pub active: bool,
	pub blocked: bool,
	pub wakeup_reason: u32,
	pub bytecode: Vec<u8>,
	pub ip: u32,
	pub stack: [i32; STACK_SIZE],
	pub sp: u32,
	pub fp: i32,
	pub locals: [i32; MAX_LOCALS],
	pub capabilities: [u16; MAX_CAPS],
	pub caps_count: u8,
	pub exit_code: i32,
}

impl Process {
	pub const fn vacant() -> Self {
		Self {
			pid: 0,
			active: false,
			blocked: false,
			wakeup_reason: 0,
			bytecode: Vec::new(),
			ip: 0,
			stack: [0; STACK_SIZE],
			sp: 0,
			fp: -1,
			locals: [0; MAX_LOCALS],
			capabilities: [0; MAX_CAPS],
			caps_count: 0,
			exit_code: 0,
		}
	}

	pub fn size(&self) -> u32 {
		self.bytecode.len() as u32
	}

	/// Terminate the process on a guard violation; the return value is
	/// what the instruction handler hands back to the execution loop.
	pub(crate) fn fault(&mut self, reason: &str) -> bool {
		crate::log_warn!("process {}: {}", self.pid, reason);
		self.exit_code = -1;
		self.active = false;
		false
	}

	/// Push a value; `false` when the stack is full.
	pub(crate) fn push(&mut self, value: i32) -> bool {
		if (self.sp as usize) < STACK_SIZE {
			self.stack[self.sp as usize] = value;
			self.sp += 1;
			true
		} else {
			false
		}
	}

	/// Fetch one immediate byte at `ip`.
	pub(crate) fn fetch_u8(&mut self) -> Option<u8> {
		if self.ip < self.size() {
			let byte = self.bytecode[self.ip as usize];
			self.ip += 1;
			Some(byte)
		} else {
			None
		}
	}

	/// Fetch a big-endian 32-bit immediate at `ip`.
	pub(crate) fn fetch_u32(&mut self) -> Option<u32> {
		if self.ip + 3 < self.size() {
			let at = self.ip as usize;
			let value = (self.bytecode[at] as u32) << 24
				| (self.bytecode[at + 1] as u32) << 16
				| (self.bytecode[at + 2] as u32) << 8
				| self.bytecode[at + 3] as u32;
			self.ip += 4;
			Some(value)
		} else {
			None
		}
	}
}

/// One queued IPC message.
#[derive(Debug, Clone, Copy)]
pub struct Message {
	pub recipient: u16,
	pub sender: u16,
	pub content: u8,
}

/// The whole runtime state: process pool, scheduler cursor and the
/// process-wide FIFO message queue.
pub struct Nvm {
	pub processes: [Process; MAX_PROCESSES],
	pub(super) current: usize,
	pub(super) ticks: u32,
	pub(super) messages: Vec<Message>,
}

impl Nvm {
	pub const fn new() -> Self {
		const VACANT: Process = Process::vacant();
		Self {
			processes: [VACANT; MAX_PROCESSES],
			current: 0,
			ticks: 0,
			messages: Vec::new(),
		}
	}

	fn signature_ok(bytecode: &[u8]) -> bool {
		bytecode.len() >= SIGNATURE.len() && bytecode[..SIGNATURE.len()] == SIGNATURE
	}

	fn claim_slot(&mut self) -> Option<usize> {
		self.processes.iter().position(|p| !p.active)
	}

	/// Create a process with an empty operand stack.
	pub fn create_process(&mut self, bytecode: Vec<u8>, initial_caps: &[u16]) -> Result<u8> {
		self.create_process_with_stack(bytecode, initial_caps, &[])
	}

	/// Create a process with a prepared initial stack.
	///
	/// The stack encodes the `main(argc, argv)` convention: slot 0 holds
	/// `argc`, slots 1..=argc hold offsets into the same array where each
	/// argument's characters live one per cell, zero-terminated. Each
	/// character run is reversed during copy-in so the usual pop order
	/// reads the argument front to back.
	pub fn create_process_with_stack(
		&mut self,
		bytecode: Vec<u8>,
		initial_caps: &[u16],
		initial_stack: &[i32],
	) -> Result<u8> {
		if !Self::signature_ok(&bytecode) {
			crate::log_warn!("invalid NVM signature");
			return Err(Error::EINVAL);
		}
		if initial_stack.len() > STACK_SIZE {
			crate::log_warn!(
				"initial stack of {} words exceeds the {}-word stack",
				initial_stack.len(),
				STACK_SIZE
			);
			return Err(Error::EINVAL);
		}

		let Some(slot) = self.claim_slot() else {
			crate::log_warn!("no free process slots");
			return Err(Error::ENOMEM);
		};

		let mut proc = Process::vacant();
		proc.pid = slot as u8;
		proc.active = true;
		proc.ip = SIGNATURE.len() as u32;
		proc.bytecode = bytecode;
		proc.stack[..initial_stack.len()].copy_from_slice(initial_stack);
		proc.sp = initial_stack.len() as u32;

		if !initial_stack.is_empty() {
			let argc = initial_stack[0];
			for arg in 0..argc.max(0) as usize {
				let Some(&pointer) = initial_stack.get(1 + arg) else {
					break;
				};
				if pointer < 0 || pointer as usize >= initial_stack.len() {
					continue;
				}
				let start = pointer as usize;
				let mut end = start;
				while end < initial_stack.len() && proc.stack[end] != 0 {
					end += 1;
				}
				proc.stack[start..end].reverse();
			}
		}

		let count = initial_caps.len().min(MAX_CAPS);
		proc.capabilities[..count].copy_from_slice(&initial_caps[..count]);
		proc.caps_count = count as u8;

		self.processes[slot] = proc;
		crate::fs::procfs::register_pid_global(slot as u8);
		Ok(slot as u8)
	}

	/// Run one instruction of `pid`. Returns `false` when the quantum
	/// must end (halt, fault, block via syscall).
	pub fn execute_instruction(&mut self, pid: usize) -> bool {
		let opcode = {
			let proc = &mut self.processes[pid];
			if proc.ip >= proc.size() {
				return proc.fault("instruction pointer out of bounds");
			}
			let opcode = proc.bytecode[proc.ip as usize];
			proc.ip += 1;
			opcode
		};
		instructions::dispatch(self, pid, opcode)
	}

	pub fn process(&self, pid: u8) -> Option<&Process> {
		self.processes.get(pid as usize)
	}

	pub fn is_process_active(&self, pid: u8) -> bool {
		self.process(pid).is_some_and(|p| p.active)
	}

	/// Exit code of a finished process; -1 while it is still running or
	/// for an invalid pid.
	pub fn exit_code(&self, pid: u8) -> i32 {
		match self.process(pid) {
			Some(p) if !p.active => p.exit_code,
			_ => -1,
		}
	}
}

// ----------------------------------------------------------------------
// Global runtime
// ----------------------------------------------------------------------

static NVM: Spinlock<Nvm> = Spinlock::new(Nvm::new());

/// Reset the process pool.
pub fn init() {
	*NVM.lock() = Nvm::new();
	crate::log_info!("nvm runtime initialized");
}

/// Timer hook driving the scheduler.
pub fn timer_tick() {
	NVM.lock().timer_tick();
}

pub fn create_process(bytecode: Vec<u8>, initial_caps: &[u16]) -> Result<u8> {
	NVM.lock().create_process(bytecode, initial_caps)
}

pub fn create_process_with_stack(
	bytecode: Vec<u8>,
	initial_caps: &[u16],
	initial_stack: &[i32],
) -> Result<u8> {
	NVM.lock().create_process_with_stack(bytecode, initial_caps, initial_stack)
}

pub fn is_process_active(pid: u8) -> bool {
	NVM.lock().is_process_active(pid)
}

pub fn exit_code(pid: u8) -> i32 {
	NVM.lock().exit_code(pid)
}

// ----------------------------------------------------------------------
// procfs reports
//
// These run under the VFS lock while a reader walks /proc; try_lock keeps
// a process reading its own entry from deadlocking against the quantum
// that issued the read.
// ----------------------------------------------------------------------

fn with_process<R>(pid: u8, f: impl FnOnce(&Process) -> R) -> Result<R> {
	let nvm = NVM.try_lock().ok_or(Error::EBUSY)?;
	let proc = nvm.process(pid).ok_or(Error::ESRCH)?;
	Ok(f(proc))
}

/// `/proc/<pid>/status` text.
pub fn report_status(pid: u8) -> Result<String> {
	with_process(pid, |p| {
		format!(
			"pid: {}\nactive: {}\nblocked: {}\nsp: {}\nip: {}\nsize: {}\nexit_code: {}\nwakeup_reason: {}\ncaps_count: {}\n",
			p.pid,
			if p.active { "yes" } else { "no" },
			if p.blocked { "yes" } else { "no" },
			p.sp,
			p.ip,
			p.size(),
			p.exit_code,
			p.wakeup_reason,
			p.caps_count
		)
	})
}

/// `/proc/<pid>/stack` text: the live operand stack, eight words a line.
pub fn report_stack(pid: u8) -> Result<String> {
	with_process(pid, |p| {
		let mut out = String::from("Stack dump (hex):\n");
		for (i, value) in p.stack[..p.sp as usize].iter().enumerate() {
			if i > 0 && i % 8 == 0 {
				out.push('\n');
			}
			out.push_str(&format!("0x{:08x} ", *value as u32));
		}
		out.push('\n');
		out
	})
}

/// `/proc/<pid>/bytecode` text: a 16-byte hex dump with an ASCII gutter.
pub fn report_bytecode(pid: u8) -> Result<String> {
	const LIMIT: usize = 8192;
	with_process(pid, |p| {
		let mut out = String::from("Bytecode (hex):\n");
		for chunk in p.bytecode.chunks(16) {
			if out.len() >= LIMIT {
				out.push_str("...[truncated]\n");
				break;
			}
			for byte in chunk {
				out.push_str(&format!("{:02x} ", byte));
			}
			for _ in chunk.len()..16 {
				out.push_str("   ");
			}
			out.push_str(" |");
			for &byte in chunk {
				out.push(if (32..127).contains(&byte) {
					byte as char
				} else {
					'.'
				});
			}
			out.push_str("|\n");
		}
		out.push_str(&format!("\nBytecode size: {} bytes\n", p.bytecode.len()));
		out
	})
}


#[cfg(test)]
mod tests {
	use super::testutil::{program, run};
	use super::*;
	use crate::nvm::caps::{CAP_ALL, CAP_DRV_ACCESS};
	use crate::nvm::syscalls::SYS_EXIT;

	#[test]
	fn bad_signature_fails_creation() {
		let mut nvm = Nvm::new();
		let err = nvm.create_process(alloc::vec![0x58, 0x58, 0x58, 0x58, 0x00], &[]).unwrap_err();
		assert_eq!(err, Error::EINVAL);
		let err = nvm.create_process(Vec::new(), &[]).unwrap_err();
		assert_eq!(err, Error::EINVAL);
	}

	#[test]
	fn creation_sets_up_the_slot() {
		let mut nvm = Nvm::new();
		let pid = nvm.create_process(program(&[0x00]), &[CAP_ALL]).unwrap();
		let proc = nvm.process(pid).unwrap();
		assert!(proc.active);
		assert_eq!(proc.ip, 4);
		assert_eq!(proc.sp, 0);
		assert_eq!(proc.fp, -1);
		assert_eq!(proc.caps_count, 1);
		assert_eq!(proc.capabilities[0], CAP_ALL);
	}

	#[test]
	fn pool_is_bounded() {
		let mut nvm = Nvm::new();
		for _ in 0..MAX_PROCESSES {
			nvm.create_process(program(&[0x00]), &[]).unwrap();
		}
		let err = nvm.create_process(program(&[0x00]), &[]).unwrap_err();
		assert_eq!(err, Error::ENOMEM);
	}

	#[test]
	fn halt_exits_cleanly() {
		let mut nvm = Nvm::new();
		let pid = nvm.create_process(program(&[0x00]), &[]).unwrap();
		run(&mut nvm, pid);
		assert!(!nvm.is_process_active(pid));
		assert_eq!(nvm.exit_code(pid), 0);
	}

	#[test]
	fn push_add_exit_computes() {
		let mut nvm = Nvm::new();
		// 2 + 3, exit with the sum.
		let pid = nvm
			.create_process(
				program(&[
					0x02, 0, 0, 0, 2, // PUSH 2
					0x02, 0, 0, 0, 3, // PUSH 3
					0x10, // ADD
					0x50, SYS_EXIT,
				]),
				&[],
			)
			.unwrap();
		run(&mut nvm, pid);
		assert_eq!(nvm.exit_code(pid), 5);
	}

	#[test]
	fn initial_stack_reverses_argument_strings() {
		let mut nvm = Nvm::new();
		// argc = 1, argv[0] at offset 2 spelling "hi".
		let initial = [1, 2, 'h' as i32, 'i' as i32, 0];
		let pid = nvm
			.create_process_with_stack(program(&[0x00]), &[], &initial)
			.unwrap();
		let proc = nvm.process(pid).unwrap();
		assert_eq!(proc.sp, 5);
		assert_eq!(proc.stack[0], 1);
		assert_eq!(proc.stack[1], 2);
		// Characters are reversed so pops yield "h" then "i".
		assert_eq!(proc.stack[2], 'i' as i32);
		assert_eq!(proc.stack[3], 'h' as i32);
		assert_eq!(proc.stack[4], 0);
	}

	#[test]
	fn oversized_initial_stack_is_rejected() {
		let mut nvm = Nvm::new();
		let too_big = alloc::vec![0i32; STACK_SIZE + 1];
		let err = nvm
			.create_process_with_stack(program(&[0x00]), &[], &too_big)
			.unwrap_err();
		assert_eq!(err, Error::EINVAL);
	}

	#[test]
	fn capability_gate_faults_absolute_loads() {
		let mut nvm = Nvm::new();
		// PUSH an address, then LOAD_ABS without CAP_DRV_ACCESS.
		let pid = nvm
			.create_process(program(&[0x02, 0, 0x10, 0, 0, 0x44, 0x00]), &[])
			.unwrap();
		run(&mut nvm, pid);
		assert!(!nvm.is_process_active(pid));
		assert_eq!(nvm.exit_code(pid), -1);
	}

	#[test]
	fn capability_gate_faults_absolute_stores() {
		let mut nvm = Nvm::new();
		let pid = nvm
			.create_process(
				program(&[0x02, 0, 0x10, 0, 0, 0x02, 0, 0, 0, 7, 0x45, 0x00]),
				&[],
			)
			.unwrap();
		run(&mut nvm, pid);
		assert_eq!(nvm.exit_code(pid), -1);
	}

	#[test]
	fn absolute_access_with_capability_does_not_fault() {
		let mut nvm = Nvm::new();
		// The store itself only happens on bare metal; the guard path
		// must still accept the capability.
		let pid = nvm
			.create_process(program(&[0x02, 0, 0x10, 0, 0, 0x44, 0x00]), &[CAP_DRV_ACCESS])
			.unwrap();
		run(&mut nvm, pid);
		assert_eq!(nvm.exit_code(pid), 0);
	}

	#[test]
	fn status_report_covers_the_fields() {
		// The report helpers read the global pool.
		init();
		let pid = create_process(program(&[0x00]), &[]).unwrap();
		let text = report_status(pid).unwrap();
		assert!(text.contains(&format!("pid: {}", pid)));
		assert!(text.contains("active: yes"));
		assert!(text.contains("caps_count: 0"));

		let dump = report_bytecode(pid).unwrap();
		assert!(dump.contains("4e 56 4d 30"));
		assert!(dump.contains("|NVM0"));
	}
}
