// SPDX-License-Identifier: GPL-2.0

//! Block device drivers

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod ramdisk;
