//! Kernel binary entry shim.
//!
//! The real entry point is the assembly stub in `arch::aarch64::start`,
//! which reaches [`bekos_kernel::boot::kernel_main`] with the MMU on. This
//! file only exists so Cargo has a binary target to link.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(target_os = "none")]
#[allow(unused_imports)]
use bekos_kernel as _;

#[cfg(not(target_os = "none"))]
fn main() {
    eprintln!("the bekos kernel only runs on aarch64-unknown-none targets");
}
