// SPDX-License-Identifier: GPL-2.0

//! Capability-checked syscalls and the message queue
//!
//! Syscall failures push -1 and never terminate the caller; only an
//! unknown syscall id is treated like an illegal opcode. Blocking exists
//! in exactly one place: `MSG_RECEIVE` with no matching message parks the
//! process until a matching `MSG_SEND` delivers into its stack.

use alloc::string::String;
use alloc::vec::Vec;

use crate::fs::OpenFlags;

use super::caps::{self, CAPS_NONE, CAP_DRV_ACCESS, CAP_FS_READ, CAP_FS_WRITE};
use super::{Message, Nvm, Process, MAX_MESSAGES, MAX_PROCESSES, STACK_SIZE};

pub const SYS_EXIT: u8 = 0x00;
pub const SYS_SPAWN: u8 = 0x01;
pub const SYS_OPEN: u8 = 0x02;
pub const SYS_READ: u8 = 0x03;
pub const SYS_WRITE: u8 = 0x04;
pub const SYS_MSG_SEND: u8 = 0x05;
pub const SYS_MSG_RECEIVE: u8 = 0x06;
pub const SYS_PORT_IN_BYTE: u8 = 0x07;
pub const SYS_PORT_OUT_BYTE: u8 = 0x08;
pub const SYS_PRINT: u8 = 0x09;

/// Largest argv a spawn request may carry.
const SPAWN_MAX_ARGS: i32 = 32;

fn push_result(proc: &mut Process, value: i32) {
	if !proc.push(value) {
		crate::log_warn!("process {}: dropping syscall result, stack full", proc.pid);
	}
}

pub(super) fn dispatch(nvm: &mut Nvm, pid: usize, id: u8) -> bool {
	match id {
		SYS_EXIT => sys_exit(nvm, pid),
		SYS_SPAWN => sys_spawn(nvm, pid),
		SYS_OPEN => sys_open(&mut nvm.processes[pid]),
		SYS_READ => sys_read(&mut nvm.processes[pid]),
		SYS_WRITE => sys_write(&mut nvm.processes[pid]),
		SYS_MSG_SEND => sys_msg_send(nvm, pid),
		SYS_MSG_RECEIVE => sys_msg_receive(nvm, pid),
		SYS_PORT_IN_BYTE => sys_port_in(&mut nvm.processes[pid]),
		SYS_PORT_OUT_BYTE => sys_port_out(&mut nvm.processes[pid]),
		SYS_PRINT => sys_print(&mut nvm.processes[pid]),
		unknown => {
			let proc = &mut nvm.processes[pid];
			crate::log_warn!("process {}: unknown syscall {:#04x}", proc.pid, unknown);
			proc.exit_code = -1;
			proc.active = false;
		}
	}
	true
}

fn sys_exit(nvm: &mut Nvm, pid: usize) {
	let proc = &mut nvm.processes[pid];
	proc.exit_code = if proc.sp >= 1 {
		proc.stack[proc.sp as usize - 1]
	} else {
		0
	};
	if proc.sp > 0 {
		proc.sp -= 1;
	}
	proc.active = false;
	// The program buffer dies with the process.
	proc.bytecode = Vec::new();
	crate::fs::procfs::unregister_pid_global(proc.pid);
}

/// Read a program out of a descriptor and start it as a child carrying
/// the caller's capabilities.
///
/// Stack on entry, top first: target fd, argc, then each argument as a
/// zero-preceded character run. The filename characters sit *above* their
/// terminator.
fn sys_spawn(nvm: &mut Nvm, pid: usize) {
	let (target_fd, argv) = {
		let proc = &mut nvm.processes[pid];
		if !caps::has_capability(proc, CAP_FS_READ) {
			return push_result(proc, -1);
		}
		if proc.sp < 2 {
			return push_result(proc, -1);
		}

		let target_fd = proc.stack[proc.sp as usize - 1];
		let argc = proc.stack[proc.sp as usize - 2];
		if !(0..=SPAWN_MAX_ARGS).contains(&argc) {
			return push_result(proc, -1);
		}
		proc.sp -= 2;

		// Walk the argument runs downward; each is terminated (below) by
		// a zero cell.
		let mut argv: Vec<String> = Vec::new();
		let mut cursor = proc.sp as i32 - 1;
		for _ in 0..argc {
			let end = cursor;
			let mut start = -1;
			while cursor >= 0 {
				if proc.stack[cursor as usize] == 0 {
					start = cursor + 1;
					break;
				}
				cursor -= 1;
			}
			if start == -1 || start > end {
				return push_result(proc, -1);
			}
			let mut arg = String::new();
			for slot in start..=end {
				arg.push((proc.stack[slot as usize] & 0xff) as u8 as char);
			}
			argv.push(arg);
			cursor = start - 2;
		}
		proc.sp = (cursor + 1).max(0) as u32;
		(target_fd, argv)
	};

	// Slurp the program. Short files simply fail the signature check.
	let mut bytecode = Vec::new();
	loop {
		let mut byte = [0u8; 1];
		match crate::fs::readfd(target_fd, &mut byte) {
			Ok(1) => bytecode.push(byte[0]),
			_ => break,
		}
	}

	// Child stack: argc, argv offsets, then the character runs.
	let argc = argv.len();
	let mut initial: Vec<i32> = Vec::new();
	initial.push(argc as i32);
	for _ in 0..argc {
		initial.push(0);
	}
	for (i, arg) in argv.iter().enumerate() {
		initial[1 + i] = initial.len() as i32;
		for byte in arg.bytes() {
			initial.push(byte as i32);
		}
		initial.push(0);
	}

	let parent_caps = nvm.processes[pid].capabilities;
	let parent_caps_count = nvm.processes[pid].caps_count;

	match nvm.create_process_with_stack(bytecode, &[CAPS_NONE], &initial) {
		Ok(child) => {
			caps::copy_caps(&parent_caps, parent_caps_count, &mut nvm.processes[child as usize]);
			push_result(&mut nvm.processes[pid], child as i32);
		}
		Err(_) => push_result(&mut nvm.processes[pid], -1),
	}
}

/// Open the path spelled on the stack above its zero terminator and push
/// the resulting descriptor.
fn sys_open(proc: &mut Process) {
	if !caps::has_capability(proc, CAP_FS_READ) {
		return push_result(proc, -1);
	}
	if proc.sp < 1 {
		return push_result(proc, -1);
	}

	let top = proc.sp as i32;
	let mut terminator = -1;
	for slot in (0..top).rev() {
		if proc.stack[slot as usize] & 0xff == 0 {
			terminator = slot;
			break;
		}
	}
	if terminator == -1 {
		return push_result(proc, -1);
	}

	let mut filename = String::new();
	for slot in terminator + 1..top {
		filename.push((proc.stack[slot as usize] & 0xff) as u8 as char);
	}
	proc.sp = terminator as u32;

	let fd = match crate::fs::open(&filename, OpenFlags::READ | OpenFlags::WRITE) {
		Ok(fd) => fd,
		Err(e) => e.to_errno(),
	};
	push_result(proc, fd);
}

/// Pop a descriptor and push one byte from it (0 at EOF, -1 on error).
fn sys_read(proc: &mut Process) {
	if !caps::has_capability(proc, CAP_FS_READ) {
		return push_result(proc, -1);
	}
	if proc.sp < 1 {
		return push_result(proc, -1);
	}

	proc.sp -= 1;
	let fd = proc.stack[proc.sp as usize];

	let result = if fd < 0 {
		-1
	} else {
		let mut byte = [0u8; 1];
		match crate::fs::readfd(fd, &mut byte) {
			Ok(1) => byte[0] as i32,
			Ok(_) => 0,
			Err(_) => -1,
		}
	};
	push_result(proc, result);
}

/// Pop (fd, byte) and write the byte; descriptors 1/2 go to the console.
fn sys_write(proc: &mut Process) {
	if !caps::has_capability(proc, CAP_FS_WRITE) {
		return push_result(proc, -1);
	}
	if proc.sp < 2 {
		return push_result(proc, -1);
	}

	let fd = proc.stack[proc.sp as usize - 2];
	let value = proc.stack[proc.sp as usize - 1];
	proc.sp -= 2;

	let result = if fd < 0 {
		-1
	} else if fd == 1 || fd == 2 {
		crate::console::write_byte((value & 0xff) as u8);
		1
	} else {
		match crate::fs::writefd(fd, &[(value & 0xff) as u8]) {
			Ok(n) => n as i32,
			Err(e) => e.to_errno(),
		}
	};
	push_result(proc, result);
}

/// Move the first queued message for `pid` onto its stack and wake it.
fn deliver_pending(nvm: &mut Nvm, pid: usize) {
	let Some(index) = nvm
		.messages
		.iter()
		.position(|m| m.recipient as usize == pid)
	else {
		return;
	};
	if nvm.processes[pid].sp as usize + 2 > STACK_SIZE {
		// No room; the message stays queued and the process parked.
		return;
	}
	let message = nvm.messages.remove(index);
	let proc = &mut nvm.processes[pid];
	proc.push(message.sender as i32);
	proc.push(message.content as i32);
	proc.blocked = false;
	proc.wakeup_reason = 1;
}

/// Pop (recipient, byte) and enqueue; a blocked recipient is woken with
/// the message delivered onto its stack.
fn sys_msg_send(nvm: &mut Nvm, pid: usize) {
	let (recipient, content) = {
		let proc = &mut nvm.processes[pid];
		if proc.sp < 2 {
			return push_result(proc, -1);
		}
		let recipient = (proc.stack[proc.sp as usize - 2] & 0xffff) as u16;
		let content = (proc.stack[proc.sp as usize - 1] & 0xff) as u8;
		proc.sp -= 2;
		(recipient, content)
	};

	if nvm.messages.len() >= MAX_MESSAGES {
		return push_result(&mut nvm.processes[pid], -1);
	}
	nvm.messages.push(Message {
		recipient,
		sender: pid as u16,
		content,
	});

	let rpid = recipient as usize;
	if rpid < MAX_PROCESSES && nvm.processes[rpid].active && nvm.processes[rpid].blocked {
		deliver_pending(nvm, rpid);
	}
}

/// Receive the first message addressed to the caller, pushing (sender,
/// content); with nothing queued the caller blocks.
fn sys_msg_receive(nvm: &mut Nvm, pid: usize) {
	let has_message = nvm
		.messages
		.iter()
		.any(|m| m.recipient as usize == pid);
	if !has_message {
		nvm.processes[pid].blocked = true;
		return;
	}
	if nvm.processes[pid].sp as usize + 2 > STACK_SIZE {
		return push_result(&mut nvm.processes[pid], -1);
	}
	deliver_pending(nvm, pid);
	// Delivery without a wakeup; the process never blocked.
	nvm.processes[pid].blocked = false;
}

/// Replace the top of stack (a port number) with the byte read from it.
fn sys_port_in(proc: &mut Process) {
	if !caps::has_capability(proc, CAP_DRV_ACCESS) {
		return push_result(proc, -1);
	}
	if proc.sp < 1 {
		return push_result(proc, -1);
	}
	let port = (proc.stack[proc.sp as usize - 1] & 0xffff) as u16;
	let value = unsafe { crate::arch::io::inb(port) };
	proc.stack[proc.sp as usize - 1] = value as i32;
}

/// Pop (port, byte) and write the byte to the port.
fn sys_port_out(proc: &mut Process) {
	if !caps::has_capability(proc, CAP_DRV_ACCESS) {
		return push_result(proc, -1);
	}
	if proc.sp < 2 {
		return push_result(proc, -1);
	}
	let port = (proc.stack[proc.sp as usize - 2] & 0xffff) as u16;
	let value = (proc.stack[proc.sp as usize - 1] & 0xff) as u8;
	unsafe { crate::arch::io::outb(port, value) };
	proc.sp -= 2;
}

/// Pop one byte and print it.
fn sys_print(proc: &mut Process) {
	if proc.sp < 1 {
		return push_result(proc, -1);
	}
	let value = (proc.stack[proc.sp as usize - 1] & 0xff) as u8;
	crate::console::write_byte(value);
	proc.sp -= 1;
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::nvm::caps::CAP_ALL;
	use crate::nvm::testutil::{program, run};
	use std::sync::Once;

	static FS_INIT: Once = Once::new();

	fn global_fs() {
		FS_INIT.call_once(crate::fs::init);
	}

	fn spawn_process(nvm: &mut Nvm, caps: &[u16]) -> u8 {
		nvm.create_process(program(&[0x00]), caps).unwrap()
	}

	fn push_all(proc: &mut Process, values: &[i32]) {
		for &v in values {
			assert!(proc.push(v));
		}
	}

	#[test]
	fn exit_records_the_popped_code() {
		let mut nvm = Nvm::new();
		let pid = nvm
			.create_process(program(&[0x02, 0, 0, 0, 9, 0x50, SYS_EXIT]), &[])
			.unwrap();
		run(&mut nvm, pid);
		assert!(!nvm.is_process_active(pid));
		assert_eq!(nvm.exit_code(pid), 9);
		// The program buffer was released with the process.
		assert_eq!(nvm.process(pid).unwrap().bytecode.len(), 0);
	}

	#[test]
	fn unknown_syscall_faults_the_process() {
		let mut nvm = Nvm::new();
		let pid = nvm.create_process(program(&[0x50, 0x7f, 0x00]), &[]).unwrap();
		run(&mut nvm, pid);
		assert!(!nvm.is_process_active(pid));
		assert_eq!(nvm.exit_code(pid), -1);
	}

	#[test]
	fn port_out_without_capability_pushes_minus_one() {
		let mut nvm = Nvm::new();
		let pid = spawn_process(&mut nvm, &[CAP_FS_READ]) as usize;
		let before = crate::console::bytes_written();

		push_all(&mut nvm.processes[pid], &[0x80, 0]);
		dispatch(&mut nvm, pid, SYS_PORT_OUT_BYTE);

		let proc = &nvm.processes[pid];
		// Still alive, nothing emitted, -1 on top of the operands.
		assert!(proc.active);
		assert_eq!(proc.sp, 3);
		assert_eq!(proc.stack[2], -1);
		assert_eq!(crate::console::bytes_written(), before);
	}

	#[test]
	fn port_out_with_capability_consumes_operands() {
		let mut nvm = Nvm::new();
		let pid = spawn_process(&mut nvm, &[CAP_DRV_ACCESS]) as usize;
		push_all(&mut nvm.processes[pid], &[0x80, 0]);
		dispatch(&mut nvm, pid, SYS_PORT_OUT_BYTE);
		assert_eq!(nvm.processes[pid].sp, 0);
	}

	#[test]
	fn print_emits_one_byte() {
		let mut nvm = Nvm::new();
		let pid = spawn_process(&mut nvm, &[]) as usize;
		let before = crate::console::bytes_written();
		push_all(&mut nvm.processes[pid], &['A' as i32]);
		dispatch(&mut nvm, pid, SYS_PRINT);
		assert_eq!(nvm.processes[pid].sp, 0);
		assert_eq!(crate::console::bytes_written(), before + 1);
	}

	#[test]
	fn message_rendezvous_wakes_the_receiver() {
		let mut nvm = Nvm::new();
		// A: receive, then halt. B: send 42 to A, then halt.
		let a = nvm
			.create_process(program(&[0x50, SYS_MSG_RECEIVE, 0x00]), &[])
			.unwrap();
		let b = nvm
			.create_process(
				program(&[
					0x02, 0, 0, 0, a as u8, // PUSH recipient
					0x02, 0, 0, 0, 42, // PUSH content
					0x50, SYS_MSG_SEND, 0x00,
				]),
				&[],
			)
			.unwrap();

		run(&mut nvm, a);
		assert!(nvm.processes[a as usize].blocked);

		run(&mut nvm, b);
		let proc = &nvm.processes[a as usize];
		assert!(!proc.blocked);
		assert_eq!(proc.wakeup_reason, 1);
		assert_eq!(proc.sp, 2);
		assert_eq!(proc.stack[0], b as i32);
		assert_eq!(proc.stack[1], 42);

		// A resumes and halts cleanly.
		run(&mut nvm, a);
		assert_eq!(nvm.exit_code(a), 0);
	}

	#[test]
	fn receive_with_queued_message_does_not_block() {
		let mut nvm = Nvm::new();
		let a = spawn_process(&mut nvm, &[]) as usize;
		let b = spawn_process(&mut nvm, &[]) as usize;

		push_all(&mut nvm.processes[b], &[a as i32, 7]);
		dispatch(&mut nvm, b, SYS_MSG_SEND);

		dispatch(&mut nvm, a, SYS_MSG_RECEIVE);
		let proc = &nvm.processes[a];
		assert!(!proc.blocked);
		assert_eq!(proc.sp, 2);
		assert_eq!(proc.stack[0], b as i32);
		assert_eq!(proc.stack[1], 7);
	}

	#[test]
	fn message_delivery_is_fifo_per_recipient() {
		let mut nvm = Nvm::new();
		let a = spawn_process(&mut nvm, &[]) as usize;
		let b = spawn_process(&mut nvm, &[]) as usize;

		for content in [1, 2, 3] {
			push_all(&mut nvm.processes[b], &[a as i32, content]);
			dispatch(&mut nvm, b, SYS_MSG_SEND);
		}
		for expected in [1, 2, 3] {
			dispatch(&mut nvm, a, SYS_MSG_RECEIVE);
			let proc = &nvm.processes[a];
			assert_eq!(proc.stack[proc.sp as usize - 1], expected);
		}
	}

	#[test]
	fn queue_capacity_is_bounded() {
		let mut nvm = Nvm::new();
		let a = spawn_process(&mut nvm, &[]) as usize;
		let b = spawn_process(&mut nvm, &[]) as usize;

		// Address an inactive pid so nothing is consumed.
		for _ in 0..MAX_MESSAGES {
			push_all(&mut nvm.processes[b], &[15, 1]);
			dispatch(&mut nvm, b, SYS_MSG_SEND);
		}
		push_all(&mut nvm.processes[b], &[15, 1]);
		dispatch(&mut nvm, b, SYS_MSG_SEND);
		let proc = &nvm.processes[b];
		assert_eq!(proc.stack[proc.sp as usize - 1], -1);
		let _ = a;
	}

	#[test]
	fn open_takes_the_path_above_the_terminator() {
		global_fs();
		crate::fs::create("/tmp/sysopen", b"Z").unwrap();

		let mut nvm = Nvm::new();
		let pid = spawn_process(&mut nvm, &[CAP_FS_READ]) as usize;

		let mut stack = alloc::vec![0i32];
		stack.extend("/tmp/sysopen".bytes().map(|b| b as i32));
		push_all(&mut nvm.processes[pid], &stack);

		dispatch(&mut nvm, pid, SYS_OPEN);
		let fd = {
			let proc = &nvm.processes[pid];
			// Terminator and path consumed; only the descriptor remains.
			assert_eq!(proc.sp, 1);
			proc.stack[0]
		};
		assert!(fd >= 3);

		// READ pops the descriptor and pushes the first byte.
		dispatch(&mut nvm, pid, SYS_READ);
		let proc = &nvm.processes[pid];
		assert_eq!(proc.stack[proc.sp as usize - 1], 'Z' as i32);

		crate::fs::close(fd).unwrap();
		crate::fs::delete("/tmp/sysopen").unwrap();
	}

	#[test]
	fn open_without_capability_pushes_minus_one() {
		let mut nvm = Nvm::new();
		let pid = spawn_process(&mut nvm, &[]) as usize;
		push_all(&mut nvm.processes[pid], &[0, 'x' as i32]);
		dispatch(&mut nvm, pid, SYS_OPEN);
		let proc = &nvm.processes[pid];
		assert_eq!(proc.stack[proc.sp as usize - 1], -1);
		assert!(proc.active);
	}

	#[test]
	fn write_to_stdout_goes_to_the_console() {
		let mut nvm = Nvm::new();
		let pid = spawn_process(&mut nvm, &[CAP_FS_WRITE]) as usize;
		let before = crate::console::bytes_written();

		push_all(&mut nvm.processes[pid], &[1, '!' as i32]);
		dispatch(&mut nvm, pid, SYS_WRITE);

		let proc = &nvm.processes[pid];
		assert_eq!(proc.stack[proc.sp as usize - 1], 1);
		assert_eq!(crate::console::bytes_written(), before + 1);
	}

	#[test]
	fn spawn_builds_a_child_with_inherited_capabilities() {
		global_fs();
		// A trivial program the child can run.
		let image = program(&[0x00]);
		crate::fs::create("/tmp/spawnee", &image).unwrap();
		let fd = crate::fs::open("/tmp/spawnee", OpenFlags::READ).unwrap();

		let mut nvm = Nvm::new();
		let pid = spawn_process(&mut nvm, &[CAP_FS_READ, CAP_FS_WRITE]) as usize;

		// One argument "hi", then argc and the descriptor on top.
		push_all(
			&mut nvm.processes[pid],
			&[0, 'h' as i32, 'i' as i32, 1, fd],
		);
		dispatch(&mut nvm, pid, SYS_SPAWN);

		let child = {
			let proc = &nvm.processes[pid];
			assert_eq!(proc.sp, 1, "spawn must consume its whole request");
			proc.stack[0]
		};
		assert!(child >= 0);
		let child = child as usize;

		let cp = &nvm.processes[child];
		assert!(cp.active);
		assert_eq!(cp.bytecode, image);
		// argc plus offset plus "hi" (reversed) plus terminator.
		assert_eq!(cp.sp, 5);
		assert_eq!(cp.stack[0], 1);
		assert_eq!(cp.stack[1], 2);
		assert_eq!(cp.stack[2], 'i' as i32);
		assert_eq!(cp.stack[3], 'h' as i32);
		assert_eq!(cp.stack[4], 0);
		assert!(caps::has_capability(cp, CAP_FS_READ));
		assert!(caps::has_capability(cp, CAP_FS_WRITE));
		assert!(!caps::has_capability(cp, CAP_DRV_ACCESS));

		// The child is a full process; it runs to completion.
		let child_pid = child as u8;
		run(&mut nvm, child_pid);
		assert_eq!(nvm.exit_code(child_pid), 0);

		crate::fs::close(fd).unwrap();
		crate::fs::delete("/tmp/spawnee").unwrap();
	}

	#[test]
	fn spawn_with_bad_descriptor_fails() {
		let mut nvm = Nvm::new();
		let pid = spawn_process(&mut nvm, &[CAP_ALL]) as usize;
		push_all(&mut nvm.processes[pid], &[0, 'x' as i32, 1, -5]);
		dispatch(&mut nvm, pid, SYS_SPAWN);
		let proc = &nvm.processes[pid];
		assert_eq!(proc.stack[proc.sp as usize - 1], -1);
	}
}
