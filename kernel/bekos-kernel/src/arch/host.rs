//! Host stand-in for the architecture interface.
//!
//! Lets the process manager and scheduler logic build and test off-target.
//! Context preparation fills [`SavedRegs`] deterministically; an actual
//! switch is a programming error on the host.

use bekos_core::PhysAddr;

use super::SavedRegs;

/// Performs a context switch.
///
/// # Safety
///
/// Never valid on the host; panics.
pub unsafe fn switch_context(_from: *mut SavedRegs, _to: *const SavedRegs) {
    unreachable!("context switch attempted in a host build");
}

/// Fills `regs` to enter a kernel function on a fresh stack.
pub fn prepare_kernel_entry(regs: &mut SavedRegs, entry: usize, arg: usize, stack_top: u64) {
    *regs = SavedRegs::zeroed();
    regs.pc = entry as u64;
    regs.x[0] = entry as u64;
    regs.x[1] = arg as u64;
    regs.sp = stack_top;
}

/// Fills `regs` to drop into userspace for the first time.
pub fn prepare_user_first_entry(
    regs: &mut SavedRegs,
    user_pc: u64,
    user_sp: u64,
    kernel_stack_top: u64,
) {
    *regs = SavedRegs::zeroed();
    regs.x[0] = user_pc;
    regs.x[1] = user_sp;
    regs.sp = kernel_stack_top;
    regs.pc = user_pc;
}

/// Fills `regs` for a fork child resuming from its copied trap frame.
pub fn prepare_fork_child(regs: &mut SavedRegs, frame_base: u64) {
    *regs = SavedRegs::zeroed();
    regs.sp = frame_base;
    regs.pc = frame_base;
}

/// Installs a user root table. A no-op on the host.
pub fn install_user_table(_root: PhysAddr) {}

/// Idles until the next interrupt. A no-op on the host.
pub fn wait_for_interrupt() {}
