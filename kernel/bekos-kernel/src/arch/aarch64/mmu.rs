//! Runtime MMU operations: TLB maintenance and user-table installation.

use aarch64_cpu::registers::TTBR0_EL1;
use bekos_core::addr::{PhysAddr, VirtAddr};
use tock_registers::interfaces::Writeable;

/// Invalidates the TLB entry covering one page of the kernel half.
///
/// Registered as the table manager's flush callback: `unmap_region`
/// invokes it per removed page (once per removed block).
pub fn flush_tlb_page(virt: VirtAddr) {
    let page = virt.as_u64() >> 12;
    // SAFETY: TLB maintenance has no memory side effects beyond dropping
    // cached translations.
    unsafe {
        core::arch::asm!(
            "dsb ishst",
            "tlbi vae1is, {page}",
            "dsb ish",
            "isb",
            page = in(reg) page,
        );
    }
}

/// Installs a user root table for the next EL0 return.
///
/// All user tables share ASID 0, so the switch invalidates every
/// ASID-tagged entry; kernel (global) entries survive.
pub fn install_user_table(root: PhysAddr) {
    TTBR0_EL1.set(root.as_u64());
    // SAFETY: As in `flush_tlb_page`.
    unsafe {
        core::arch::asm!("isb", "tlbi aside1is, xzr", "dsb ish", "isb");
    }
}
