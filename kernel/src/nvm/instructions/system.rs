// SPDX-License-Identifier: GPL-2.0

//! System escape instructions

use crate::nvm::{syscalls, Nvm, Process};

/// Fetch the syscall id and hand off to the syscall layer.
pub(in crate::nvm) fn syscall(nvm: &mut Nvm, pid: usize) -> bool {
	let Some(id) = nvm.processes[pid].fetch_u8() else {
		// The missing immediate is caught as an out-of-bounds ip on the
		// next fetch.
		return true;
	};
	syscalls::dispatch(nvm, pid, id)
}

pub(super) fn brk(proc: &mut Process) -> bool {
	crate::log_debug!("process {}: BREAK", proc.pid);
	true
}
