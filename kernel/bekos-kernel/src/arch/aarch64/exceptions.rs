//! Exception vectors and handlers.
//!
//! The vector table routes everything through a common frame push: the
//! full GPR file plus SP_EL0, ELR, SPSR, and TPIDR, the
//! [`TrapFrame`](crate::arch::TrapFrame) that `sys_fork` copies. EL0
//! synchronous exceptions carrying `svc #0` become syscalls; EL0 faults
//! terminate the process; EL1 faults are fatal. IRQs are claimed from the
//! registered interrupt controller, dispatched, and followed by a
//! deferred-call drain on the way out, the "safe point" where the
//! scheduler actually switches.

use core::arch::global_asm;

use aarch64_cpu::registers::{ESR_EL1, FAR_EL1, VBAR_EL1};
use tock_registers::interfaces::{Readable, Writeable};

use crate::arch::TrapFrame;

// The vector table: 16 slots of 128 bytes. Only the four current-EL and
// lower-EL (AArch64) vectors are populated; the rest trap fatally.
global_asm!(
    "
    .macro PUSH_FRAME
    sub sp, sp, #288
    stp x0, x1, [sp, #0]
    stp x2, x3, [sp, #16]
    stp x4, x5, [sp, #32]
    stp x6, x7, [sp, #48]
    stp x8, x9, [sp, #64]
    stp x10, x11, [sp, #80]
    stp x12, x13, [sp, #96]
    stp x14, x15, [sp, #112]
    stp x16, x17, [sp, #128]
    stp x18, x19, [sp, #144]
    stp x20, x21, [sp, #160]
    stp x22, x23, [sp, #176]
    stp x24, x25, [sp, #192]
    stp x26, x27, [sp, #208]
    stp x28, x29, [sp, #224]
    str x30, [sp, #240]
    mrs x9, sp_el0
    str x9, [sp, #248]
    mrs x9, elr_el1
    str x9, [sp, #256]
    mrs x9, spsr_el1
    str x9, [sp, #264]
    mrs x9, tpidr_el0
    str x9, [sp, #272]
    .endm

    .global trap_frame_restore
    trap_frame_restore:
    // No interrupts while the frame is being popped; eret re-applies the
    // saved PSTATE mask.
    msr daifset, #2
    ldr x9, [sp, #248]
    msr sp_el0, x9
    ldr x9, [sp, #256]
    msr elr_el1, x9
    ldr x9, [sp, #264]
    msr spsr_el1, x9
    ldr x9, [sp, #272]
    msr tpidr_el0, x9
    ldp x0, x1, [sp, #0]
    ldp x2, x3, [sp, #16]
    ldp x4, x5, [sp, #32]
    ldp x6, x7, [sp, #48]
    ldp x8, x9, [sp, #64]
    ldp x10, x11, [sp, #80]
    ldp x12, x13, [sp, #96]
    ldp x14, x15, [sp, #112]
    ldp x16, x17, [sp, #128]
    ldp x18, x19, [sp, #144]
    ldp x20, x21, [sp, #160]
    ldp x22, x23, [sp, #176]
    ldp x24, x25, [sp, #192]
    ldp x26, x27, [sp, #208]
    ldp x28, x29, [sp, #224]
    ldr x30, [sp, #240]
    add sp, sp, #288
    eret

    // The pushed frame is larger than a 128-byte vector slot, so every
    // slot is a single branch to a shared stub.
    .macro STUB name, handler
    \\name:
    PUSH_FRAME
    mov x0, sp
    bl \\handler
    b trap_frame_restore
    .endm

    STUB el1_fatal_stub, el1_fatal_entry
    STUB el1_sync_stub, el1_sync_entry
    STUB el0_sync_stub, el0_sync_entry
    STUB el0_fault_stub, el0_fault_entry
    STUB irq_stub, irq_entry

    .macro VECTOR stub
    .balign 0x80
    b \\stub
    .endm

    .balign 0x800
    .global exception_vector_table
    exception_vector_table:
    // Current EL, SP_EL0.
    VECTOR el1_fatal_stub
    VECTOR el1_fatal_stub
    VECTOR el1_fatal_stub
    VECTOR el1_fatal_stub
    // Current EL, SP_ELx.
    VECTOR el1_sync_stub
    VECTOR irq_stub
    VECTOR el1_fatal_stub
    VECTOR el1_fatal_stub
    // Lower EL, AArch64.
    VECTOR el0_sync_stub
    VECTOR irq_stub
    VECTOR el1_fatal_stub
    VECTOR el0_fault_stub
    // Lower EL, AArch32 (unsupported).
    VECTOR el1_fatal_stub
    VECTOR el1_fatal_stub
    VECTOR el1_fatal_stub
    VECTOR el1_fatal_stub
    ",
);

unsafe extern "C" {
    static exception_vector_table: u8;
}

/// Installs the vector table. Called once during bring-up.
pub fn install_vector_table() {
    // SAFETY: The label is the statically linked table above.
    VBAR_EL1.set(core::ptr::addr_of!(exception_vector_table) as u64);
}

/// ESR exception-class value for `svc` from AArch64.
const EC_SVC64: u64 = 0x15;
/// ESR exception-class values for EL0 aborts.
const EC_INSTR_ABORT_LOWER: u64 = 0x20;
const EC_DATA_ABORT_LOWER: u64 = 0x24;

#[unsafe(no_mangle)]
extern "C" fn el0_sync_entry(frame: &mut TrapFrame) {
    let esr = ESR_EL1.get();
    let ec = (esr >> 26) & 0x3F;

    // Syscalls may block (Sleep spins on a timer callback), so interrupt
    // delivery resumes while the handler runs.
    super::enable_interrupts();

    match ec {
        EC_SVC64 => {
            // Call number in the low 32 bits of x0, arguments in x1..x7.
            let result = crate::syscall::dispatch(
                frame.x[0] as u32,
                [
                    frame.x[1], frame.x[2], frame.x[3], frame.x[4], frame.x[5], frame.x[6],
                    frame.x[7],
                ],
            );
            frame.x[0] = result as u64;
        }
        EC_INSTR_ABORT_LOWER | EC_DATA_ABORT_LOWER => {
            // A user fault with no matching region: terminate the process.
            bekos_core::kwarn!(
                "trap",
                "user fault: esr {:#x}, far {:#x}, elr {:#x}",
                esr,
                FAR_EL1.get(),
                frame.elr
            );
            crate::proc::exit_current(i64::from(bekos_core::SysError::BadAddress.errno()) as i32);
        }
        _ => {
            bekos_core::kwarn!("trap", "unhandled EL0 exception, esr {:#x}", esr);
            crate::proc::exit_current(-1);
        }
    }
    // A syscall may have been the process's last act.
    crate::drivers::irq::deferred::drain();
}

#[unsafe(no_mangle)]
extern "C" fn el0_fault_entry(frame: &mut TrapFrame) {
    bekos_core::kwarn!("trap", "EL0 SError, elr {:#x}", frame.elr);
    crate::proc::exit_current(-1);
}

#[unsafe(no_mangle)]
extern "C" fn el1_sync_entry(frame: &mut TrapFrame) {
    // A fault in kernel mode is a programming error.
    panic!(
        "kernel exception: esr {:#x}, far {:#x}, elr {:#x}",
        ESR_EL1.get(),
        FAR_EL1.get(),
        frame.elr
    );
}

#[unsafe(no_mangle)]
extern "C" fn el1_fatal_entry(frame: &mut TrapFrame) {
    panic!("exception from unexpected vector, elr {:#x}", frame.elr);
}

#[unsafe(no_mangle)]
extern "C" fn irq_entry(_frame: &mut TrapFrame) {
    // Claim and dispatch every pending line, then run the deferred work
    // the handlers queued. The deferred drain is the safe point at which
    // the scheduler may switch away from this context.
    loop {
        let line = crate::drivers::irq::with_controller(|c| c.claim());
        match line {
            Ok(Some(line)) => crate::drivers::irq::dispatch(line),
            _ => break,
        }
    }
    crate::drivers::irq::deferred::drain();
}
