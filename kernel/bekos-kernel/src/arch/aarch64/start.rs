//! The very first instructions.
//!
//! Firmware enters at `_start` with the device-tree blob's physical
//! address in x0 and the MMU off. The stub parks secondary cores, drops
//! from EL2 to EL1 if required, points SP at the boot stack (through its
//! physical alias), zeroes `.bss`, calls the table builder, flips the MMU
//! on, and takes an absolute jump into the high half.

use core::arch::global_asm;

global_asm!(
    "
    .section .text.boot, \"ax\"
    .global _start
    _start:
    // Only the boot core proceeds.
    mrs x9, mpidr_el1
    and x9, x9, #0b11
    cbz x9, 1f
    0: wfe
    b 0b
    1:
    // Keep the DTB pointer in a callee-ignored register.
    mov x27, x0

    // Physical load base (this stub sits at __kernel_start).
    adr x28, _start

    // Drop to EL1 if firmware left us in EL2.
    mrs x9, currentel
    lsr x9, x9, #2
    cmp x9, #2
    b.ne 2f
    // EL1 is AArch64; disable EL2 traps; route execution to EL1h.
    mov x9, #(1 << 31)
    msr hcr_el2, x9
    mov x9, #0x3C5
    msr spsr_el2, x9
    adr x9, 2f
    msr elr_el2, x9
    eret
    2:
    // No trapping of FP/SIMD at EL1/EL0.
    mov x9, #(0b11 << 20)
    msr cpacr_el1, x9
    isb

    // Boot stack, through its physical alias: the high half is linked
    // at KERNEL_VBASE + physical, so phys = link - KERNEL_VBASE.
    ldr x9, =__boot_stack_top
    ldr x10, =0xFFFF800000000000
    sub x9, x9, x10
    mov sp, x9

    // Zero .bss through its physical alias.
    ldr x11, =__bss_start
    sub x11, x11, x10
    ldr x12, =__bss_end
    sub x12, x12, x10
    3:
    cmp x11, x12
    b.hs 4f
    str xzr, [x11], #8
    b 3b
    4:

    // Build the boot tables: x0 = load base, x1 = DTB physical.
    mov x0, x28
    mov x1, x27
    bl setup_early_tables
    cbz x0, 5f
    // Table construction failed: hang with the code in x0.
    6: wfe
    b 6b
    5:

    // MMU + caches on.
    mrs x9, sctlr_el1
    orr x9, x9, #(1 << 0)   // M
    orr x9, x9, #(1 << 2)   // C
    orr x9, x9, #(1 << 12)  // I
    msr sctlr_el1, x9
    isb

    // Absolute jump into the high half; the stack moves with it.
    ldr x9, =__boot_stack_top
    mov sp, x9
    ldr x9, =kernel_main
    br x9
    ",
);
