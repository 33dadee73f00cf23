//! The bekOS kernel.
//!
//! Turns a freshly-booted AArch64 core with the MMU off into a
//! multitasking system running unprivileged programs against USB HID
//! devices, an xHCI controller behind PCIe, a framebuffer, and a
//! filesystem on a block device.
//!
//! Hardware-independent logic (device-tree model, rings, allocator
//! plumbing, path parsing, record serialisation, scheduling policy) builds
//! and tests on the host; the AArch64 bring-up lives behind
//! `target_os = "none"`.

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]

extern crate alloc;

pub mod api;
pub mod arch;
pub mod devicetree;
pub mod drivers;
pub mod fs;
pub mod mm;
pub mod proc;
pub mod syscall;

#[cfg(target_os = "none")]
pub mod boot;

#[cfg(target_os = "none")]
mod panic;

pub use bekos_core::{SysError, SysResult};

/// The global heap, served by the three-tier allocator in `bekos-mm`.
#[cfg(target_os = "none")]
#[global_allocator]
static GLOBAL_HEAP: bekos_mm::heap::GlobalHeap = bekos_mm::heap::GlobalHeap;
