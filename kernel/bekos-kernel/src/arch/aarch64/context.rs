//! Context switching and entry trampolines.
//!
//! [`switch_context`] saves the callee-saved state of the current kernel
//! context into the outgoing [`SavedRegs`] and resumes the incoming one.
//! Fresh contexts never "return" from a switch; their `pc` points at one
//! of the trampolines below, which receive their operands in x19/x20 (the
//! first two slots of the saved register file).

use core::arch::{global_asm, naked_asm};

use crate::arch::SavedRegs;

/// Saves the current context into `from` and resumes `to`.
///
/// Returns when something later switches back to `from`.
///
/// # Safety
///
/// Both pointers must reference valid [`SavedRegs`]; `to` must describe a
/// resumable context (a prior save, or a prepared trampoline entry), and
/// the caller must be at a point where losing the CPU is safe (the
/// scheduler's critical section).
#[unsafe(naked)]
pub unsafe extern "C" fn switch_context(from: *mut SavedRegs, to: *const SavedRegs) {
    naked_asm!(
        // Save callee-saved integer state.
        "stp x19, x20, [x0, #0]",
        "stp x21, x22, [x0, #16]",
        "stp x23, x24, [x0, #32]",
        "stp x25, x26, [x0, #48]",
        "stp x27, x28, [x0, #64]",
        "stp x29, x30, [x0, #80]",
        "mov x9, sp",
        "str x9, [x0, #96]",
        // Resuming the saved context means returning to our caller.
        "str x30, [x0, #104]",
        "mrs x9, spsr_el1",
        "str x9, [x0, #112]",
        "mrs x9, tpidr_el0",
        "str x9, [x0, #120]",
        // Callee-saved vector registers.
        "stp q8, q9, [x0, #128]",
        "stp q10, q11, [x0, #160]",
        "stp q12, q13, [x0, #192]",
        "stp q14, q15, [x0, #224]",
        // Restore the incoming context.
        "ldp x19, x20, [x1, #0]",
        "ldp x21, x22, [x1, #16]",
        "ldp x23, x24, [x1, #32]",
        "ldp x25, x26, [x1, #48]",
        "ldp x27, x28, [x1, #64]",
        "ldp x29, x30, [x1, #80]",
        "ldr x9, [x1, #96]",
        "mov sp, x9",
        "ldr x9, [x1, #112]",
        "msr spsr_el1, x9",
        "ldr x9, [x1, #120]",
        "msr tpidr_el0, x9",
        "ldp q8, q9, [x1, #128]",
        "ldp q10, q11, [x1, #160]",
        "ldp q12, q13, [x1, #192]",
        "ldp q14, q15, [x1, #224]",
        "ldr x9, [x1, #104]",
        "br x9",
    );
}

global_asm!(
    // Fresh kernel context: x19 = entry fn, x20 = argument. Switches
    // happen with IRQs masked; a fresh thread starts unmasked.
    ".global kernel_entry_trampoline",
    "kernel_entry_trampoline:",
    "msr daifclr, #2",
    "mov x0, x20",
    "blr x19",
    "b kernel_thread_exit_shim",
    // First drop to EL0: x19 = user pc, x20 = user sp.
    "
    .global user_first_entry_trampoline
    user_first_entry_trampoline:
    msr elr_el1, x19
    msr sp_el0, x20
    // EL0t, interrupts enabled.
    msr spsr_el1, xzr
    msr tpidr_el0, xzr
    mov x0, xzr
    mov x1, xzr
    mov x2, xzr
    mov x3, xzr
    mov x4, xzr
    mov x5, xzr
    mov x6, xzr
    mov x7, xzr
    mov x8, xzr
    mov x9, xzr
    mov x10, xzr
    mov x11, xzr
    mov x12, xzr
    mov x13, xzr
    mov x14, xzr
    mov x15, xzr
    mov x16, xzr
    mov x17, xzr
    mov x18, xzr
    mov x19, xzr
    mov x20, xzr
    mov x21, xzr
    mov x22, xzr
    mov x23, xzr
    mov x24, xzr
    mov x25, xzr
    mov x26, xzr
    mov x27, xzr
    mov x28, xzr
    mov x29, xzr
    mov x30, xzr
    eret
    ",
    // Fork child: sp points at the copied trap frame; the shared frame
    // restore pops it and erets after the parent's `svc`.
    "
    .global fork_return_trampoline
    fork_return_trampoline:
    b trap_frame_restore
    ",
);

unsafe extern "C" {
    /// Entry shim for fresh kernel contexts (assembly label).
    pub fn kernel_entry_trampoline();
    /// Entry shim for first EL0 entry (assembly label).
    pub fn user_first_entry_trampoline();
    /// Entry shim for fork children (assembly label).
    pub fn fork_return_trampoline();
}

/// Called when a kernel thread's entry function returns.
#[unsafe(no_mangle)]
extern "C" fn kernel_thread_exit_shim() -> ! {
    crate::proc::exit_current(0);
}

/// Fills `regs` to run `entry(arg)` on a fresh kernel stack.
pub fn prepare_kernel_entry(regs: &mut SavedRegs, entry: usize, arg: usize, stack_top: u64) {
    *regs = SavedRegs::zeroed();
    regs.x[0] = entry as u64; // x19
    regs.x[1] = arg as u64; // x20
    regs.sp = stack_top;
    regs.pc = kernel_entry_trampoline as usize as u64;
    // EL1h, interrupts enabled once the context runs.
    regs.spsr = 0b0101;
}

/// Fills `regs` to drop into userspace at `user_pc` with `user_sp`.
pub fn prepare_user_first_entry(
    regs: &mut SavedRegs,
    user_pc: u64,
    user_sp: u64,
    kernel_stack_top: u64,
) {
    *regs = SavedRegs::zeroed();
    regs.x[0] = user_pc; // x19
    regs.x[1] = user_sp; // x20
    regs.sp = kernel_stack_top;
    regs.pc = user_first_entry_trampoline as usize as u64;
    regs.spsr = 0b0101;
}

/// Fills `regs` for a fork child: `frame_base` is where the copied trap
/// frame sits on the child's kernel stack.
pub fn prepare_fork_child(regs: &mut SavedRegs, frame_base: u64) {
    *regs = SavedRegs::zeroed();
    regs.sp = frame_base;
    regs.pc = fork_return_trampoline as usize as u64;
    regs.spsr = 0b0101;
}
