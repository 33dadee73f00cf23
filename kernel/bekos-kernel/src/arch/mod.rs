//! Architecture interface.
//!
//! Defines the context types the process subsystem works with
//! ([`SavedRegs`] for kernel-side context switches, [`TrapFrame`] for the
//! EL0 exception frame) plus the operations each backend provides.
//! The AArch64 backend is the real kernel; a host stub keeps the generic
//! code testable off-target.

pub mod tcr;

#[cfg(all(target_arch = "aarch64", target_os = "none"))]
pub mod aarch64;

#[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
mod host;

#[cfg(all(target_arch = "aarch64", target_os = "none"))]
pub use aarch64::{
    install_user_table, prepare_fork_child, prepare_kernel_entry, prepare_user_first_entry,
    switch_context, wait_for_interrupt,
};

#[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
pub use host::{
    install_user_table, prepare_fork_child, prepare_kernel_entry, prepare_user_first_entry,
    switch_context, wait_for_interrupt,
};

/// An architecturally sufficient snapshot of a suspended kernel context:
/// callee-saved integer registers, frame pointer, link register, stack
/// pointer, resume address, status, thread pointer, and the callee-saved
/// half of the FP/SIMD file.
#[derive(Debug, Clone)]
#[repr(C)]
pub struct SavedRegs {
    /// x19..x28.
    pub x: [u64; 10],
    /// Frame pointer (x29).
    pub fp: u64,
    /// Link register (x30).
    pub lr: u64,
    /// Stack pointer at suspension.
    pub sp: u64,
    /// Resume address.
    pub pc: u64,
    /// Saved processor state.
    pub spsr: u64,
    /// Thread-pointer register (TPIDR_EL0).
    pub tpidr: u64,
    /// q8..q15 (the callee-saved vector registers).
    pub q: [u128; 8],
}

impl SavedRegs {
    /// An all-zero context; filled in by the `prepare_*` functions.
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            x: [0; 10],
            fp: 0,
            lr: 0,
            sp: 0,
            pc: 0,
            spsr: 0,
            tpidr: 0,
            q: [0; 8],
        }
    }
}

/// The frame the EL0 exception entry pushes at the top of the kernel
/// stack: every general-purpose register plus the EL0 stack pointer,
/// return address, status, and thread pointer.
///
/// `sys_fork` copies exactly [`TRAP_FRAME_SIZE`] bytes from the top of the
/// parent's kernel stack to the child's, then rewrites the saved `x0`.
#[derive(Debug, Clone)]
#[repr(C)]
pub struct TrapFrame {
    /// x0..x30.
    pub x: [u64; 31],
    /// EL0 stack pointer.
    pub sp_el0: u64,
    /// Exception return address (ELR_EL1).
    pub elr: u64,
    /// Saved status (SPSR_EL1).
    pub spsr: u64,
    /// Thread pointer (TPIDR_EL0).
    pub tpidr: u64,
    /// Keeps the frame 16-byte aligned on the stack.
    pub _reserved: u64,
}

/// Byte size of the EL0 trap frame.
pub const TRAP_FRAME_SIZE: usize = size_of::<TrapFrame>();

const _: () = assert!(TRAP_FRAME_SIZE % 16 == 0);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trap_frame_layout() {
        // 31 GPRs + 4 system values + padding, 16-byte aligned.
        assert_eq!(TRAP_FRAME_SIZE, 36 * 8);
        assert_eq!(core::mem::offset_of!(TrapFrame, sp_el0), 31 * 8);
        assert_eq!(core::mem::offset_of!(TrapFrame, elr), 32 * 8);
    }

    #[test]
    fn saved_regs_offsets_match_switch_asm() {
        // The context-switch assembly stores pairs at these offsets.
        assert_eq!(core::mem::offset_of!(SavedRegs, x), 0);
        assert_eq!(core::mem::offset_of!(SavedRegs, fp), 10 * 8);
        assert_eq!(core::mem::offset_of!(SavedRegs, lr), 11 * 8);
        assert_eq!(core::mem::offset_of!(SavedRegs, sp), 12 * 8);
        assert_eq!(core::mem::offset_of!(SavedRegs, pc), 13 * 8);
        assert_eq!(core::mem::offset_of!(SavedRegs, spsr), 14 * 8);
        assert_eq!(core::mem::offset_of!(SavedRegs, tpidr), 15 * 8);
        assert_eq!(core::mem::offset_of!(SavedRegs, q), 16 * 8);
    }
}
