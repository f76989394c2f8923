// SPDX-License-Identifier: GPL-2.0

//! Arithmetic and comparison instructions
//!
//! All binary operations consume the top two cells and leave one result;
//! arithmetic wraps on overflow.

use crate::nvm::Process;

/// Pop the two operands as (second, top), or fault.
fn operands(proc: &mut Process, what: &str) -> Option<(i32, i32)> {
	if proc.sp < 2 {
		proc.fault(what);
		return None;
	}
	let sp = proc.sp as usize;
	Some((proc.stack[sp - 2], proc.stack[sp - 1]))
}

fn replace(proc: &mut Process, result: i32) {
	proc.stack[proc.sp as usize - 2] = result;
	proc.sp -= 1;
}

pub(super) fn add(proc: &mut Process) -> bool {
	let Some((second, top)) = operands(proc, "stack underflow in ADD") else {
		return false;
	};
	replace(proc, second.wrapping_add(top));
	true
}

pub(super) fn sub(proc: &mut Process) -> bool {
	let Some((second, top)) = operands(proc, "stack underflow in SUB") else {
		return false;
	};
	replace(proc, second.wrapping_sub(top));
	true
}

pub(super) fn mul(proc: &mut Process) -> bool {
	let Some((second, top)) = operands(proc, "stack underflow in MUL") else {
		return false;
	};
	replace(proc, second.wrapping_mul(top));
	true
}

pub(super) fn div(proc: &mut Process) -> bool {
	let Some((second, top)) = operands(proc, "stack underflow in DIV") else {
		return false;
	};
	if top == 0 {
		return proc.fault("division by zero in DIV");
	}
	replace(proc, second.wrapping_div(top));
	true
}

pub(super) fn rem(proc: &mut Process) -> bool {
	let Some((second, top)) = operands(proc, "stack underflow in MOD") else {
		return false;
	};
	if top == 0 {
		return proc.fault("division by zero in MOD");
	}
	replace(proc, second.wrapping_rem(top));
	true
}

/// Three-way compare of second against top: -1, 0 or 1.
pub(super) fn cmp(proc: &mut Process) -> bool {
	let Some((second, top)) = operands(proc, "stack underflow in CMP") else {
		return false;
	};
	let result = if second < top {
		-1
	} else if second == top {
		0
	} else {
		1
	};
	replace(proc, result);
	true
}

pub(super) fn eq(proc: &mut Process) -> bool {
	let Some((second, top)) = operands(proc, "stack underflow in EQ") else {
		return false;
	};
	replace(proc, (second == top) as i32);
	true
}

pub(super) fn neq(proc: &mut Process) -> bool {
	let Some((second, top)) = operands(proc, "stack underflow in NEQ") else {
		return false;
	};
	replace(proc, (second != top) as i32);
	true
}

pub(super) fn gt(proc: &mut Process) -> bool {
	let Some((second, top)) = operands(proc, "stack underflow in GT") else {
		return false;
	};
	replace(proc, (second > top) as i32);
	true
}

pub(super) fn lt(proc: &mut Process) -> bool {
	let Some((second, top)) = operands(proc, "stack underflow in LT") else {
		return false;
	};
	replace(proc, (second < top) as i32);
	true
}
