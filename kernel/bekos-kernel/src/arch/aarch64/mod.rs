//! AArch64 backend.
//!
//! Boot order: the assembly stub in [`start`] drops to EL1 and calls the
//! physical-address table builder in [`early`], which maps the kernel high
//! and enables the MMU; control then reaches `boot::kernel_main` in the
//! high half. [`exceptions`] installs the vector table, [`context`]
//! provides the switch and entry trampolines, [`cache`] the DMA
//! maintenance, and [`mmu`] the runtime TLB and TTBR operations.

pub mod cache;
pub mod context;
pub mod early;
pub mod exceptions;
pub mod mmu;
pub mod start;

pub use context::{
    prepare_fork_child, prepare_kernel_entry, prepare_user_first_entry, switch_context,
};
pub use mmu::install_user_table;

use aarch64_cpu::asm;

/// Idles the core until the next interrupt.
pub fn wait_for_interrupt() {
    asm::wfi();
}

/// Masks IRQs, returning the prior DAIF for the paired restore.
fn mask_interrupts() -> u64 {
    use aarch64_cpu::registers::DAIF;
    use tock_registers::interfaces::{Readable, Writeable};
    let saved = DAIF.get();
    DAIF.set(saved | (1 << 7)); // I bit
    saved
}

/// Restores a DAIF value saved by [`mask_interrupts`].
fn restore_interrupts(saved: u64) {
    use aarch64_cpu::registers::DAIF;
    use tock_registers::interfaces::Writeable;
    DAIF.set(saved);
}

/// Unmasks IRQs. Called once interrupt delivery is safe.
pub fn enable_interrupts() {
    use aarch64_cpu::registers::DAIF;
    use tock_registers::interfaces::{Readable, Writeable};
    DAIF.set(DAIF.get() & !(1 << 7));
}

/// Hooks the architecture into the portable seams: the interrupt-mask
/// guard, the TLB flush, and the DMA cache operations. Called once, early
/// in `kernel_main`.
pub fn register_portable_hooks() {
    bekos_core::sync::register_interrupt_mask(mask_interrupts, restore_interrupts);
    bekos_mm::table::register_tlb_flush(mmu::flush_tlb_page);
    bekos_mm::dma::register_cache_ops(cache::clean_range, cache::invalidate_range);
}
