//! Scoped interrupt masking.
//!
//! [`InterruptGuard`] masks interrupts on construction and restores the
//! previous state on drop. The actual mask/restore operations are
//! architecture code registered at boot via [`register_interrupt_mask`];
//! before registration (and in host tests) the guard is a no-op.

use core::sync::atomic::{AtomicPtr, Ordering};

/// Masks interrupts, returning an opaque token describing the prior state.
pub type MaskFn = fn() -> u64;
/// Restores interrupts from a token produced by the paired [`MaskFn`].
pub type RestoreFn = fn(u64);

fn nop_mask() -> u64 {
    0
}

fn nop_restore(_state: u64) {}

static MASK_FN: AtomicPtr<()> = AtomicPtr::new(nop_mask as *mut ());
static RESTORE_FN: AtomicPtr<()> = AtomicPtr::new(nop_restore as *mut ());

/// Registers the architecture's interrupt mask/restore pair.
///
/// Must be called during early boot, before any code relies on
/// [`InterruptGuard`] for mutual exclusion with interrupt handlers.
pub fn register_interrupt_mask(mask: MaskFn, restore: RestoreFn) {
    MASK_FN.store(mask as *mut (), Ordering::Release);
    RESTORE_FN.store(restore as *mut (), Ordering::Release);
}

/// RAII guard that masks interrupts for its lifetime.
///
/// Used around critical-section counter updates and any state shared with
/// interrupt handlers.
pub struct InterruptGuard {
    saved: u64,
}

impl InterruptGuard {
    /// Masks interrupts and captures the previous state.
    #[must_use]
    pub fn new() -> Self {
        let ptr = MASK_FN.load(Ordering::Acquire);
        // SAFETY: Only valid `MaskFn` pointers (or the initial no-op) are
        // ever stored into MASK_FN.
        let mask: MaskFn = unsafe { core::mem::transmute(ptr) };
        Self { saved: mask() }
    }
}

impl Default for InterruptGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        let ptr = RESTORE_FN.load(Ordering::Acquire);
        // SAFETY: Only valid `RestoreFn` pointers (or the initial no-op)
        // are ever stored into RESTORE_FN.
        let restore: RestoreFn = unsafe { core::mem::transmute(ptr) };
        restore(self.saved);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_is_noop_before_registration() {
        let _guard = InterruptGuard::new();
        // Nested guards must also be fine.
        let _inner = InterruptGuard::new();
    }
}
