//! `bekos-core` --- foundation types shared by every bekOS kernel crate.
//!
//! Provides typed physical/virtual/DMA addresses and regions, spin-based
//! synchronisation primitives, an interrupt-masking guard, the kernel
//! logging facade, and the system-wide error code set.

#![cfg_attr(not(test), no_std)]

pub mod addr;
pub mod error;
pub mod log;
pub mod sync;

pub use addr::{DmaAddr, PhysAddr, PhysRegion, UserRegion, VirtAddr, VirtRegion};
pub use error::{SysError, SysResult};
