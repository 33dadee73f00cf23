//! Synchronisation primitives.

mod interrupts;
mod irq_spinlock;
mod spinlock;

pub use interrupts::{InterruptGuard, register_interrupt_mask};
pub use irq_spinlock::{IrqSpinLock, IrqSpinLockGuard};
pub use spinlock::{SpinLock, SpinLockGuard};
