// SPDX-License-Identifier: GPL-2.0

//! Kernel cryptography

pub mod chacha20;

pub use chacha20::ChaCha20Rng;
