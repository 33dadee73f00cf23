//! Interrupt routing and deferred calls.
//!
//! The concrete interrupt controller lives outside this core; the kernel
//! talks to it through [`InterruptController`]. Drivers bind a handler to
//! a line with [`register_handler`]; the controller's driver calls
//! [`dispatch`] from its top-level interrupt entry.
//!
//! Long-running work never runs in an interrupt handler: handlers enqueue
//! a [`deferred`] call, and the exception return path drains the queue
//! once the handler has finished.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;

use bekos_core::sync::IrqSpinLock;
use bekos_core::{SysError, SysResult};

/// The interface an interrupt-controller driver provides.
pub trait InterruptController: Send + Sync {
    /// Unmasks a line.
    fn enable_interrupt(&self, line: u32);

    /// Masks a line.
    fn disable_interrupt(&self, line: u32);

    /// Acknowledges and returns the highest-priority pending line, or
    /// `None` when nothing is pending. Called from the IRQ vector.
    fn claim(&self) -> Option<u32>;

    /// Signals completion of the in-service interrupt.
    fn end_of_interrupt(&self, line: u32);
}

static CONTROLLER: IrqSpinLock<Option<Arc<dyn InterruptController>>> = IrqSpinLock::new(None);

/// Handler slots; lines above this bound are rejected.
const MAX_LINES: usize = 256;

type Handler = Box<dyn FnMut() + Send>;

static HANDLERS: IrqSpinLock<Option<Vec<Option<Handler>>>> = IrqSpinLock::new(None);

/// Installs the system interrupt controller.
pub fn set_controller(controller: Arc<dyn InterruptController>) {
    *CONTROLLER.lock() = Some(controller);
    let mut handlers = HANDLERS.lock();
    if handlers.is_none() {
        let mut table = Vec::with_capacity(MAX_LINES);
        table.resize_with(MAX_LINES, || None);
        *handlers = Some(table);
    }
}

/// Runs a closure with the installed controller.
///
/// # Errors
///
/// `ENODEV` before [`set_controller`].
pub fn with_controller<R>(f: impl FnOnce(&dyn InterruptController) -> R) -> SysResult<R> {
    let guard = CONTROLLER.lock();
    let controller = guard.as_ref().ok_or(SysError::NoDevice)?;
    Ok(f(controller.as_ref()))
}

/// Binds `handler` to `line` and unmasks it.
///
/// # Errors
///
/// `EINVAL` for an out-of-range line, `ENODEV` before a controller is
/// installed, `EEXIST` if the line already has a handler.
pub fn register_handler(line: u32, handler: Handler) -> SysResult<()> {
    if line as usize >= MAX_LINES {
        return Err(SysError::InvalidArgument);
    }
    {
        let mut guard = HANDLERS.lock();
        let table = guard.as_mut().ok_or(SysError::NoDevice)?;
        let slot = &mut table[line as usize];
        if slot.is_some() {
            return Err(SysError::Exists);
        }
        *slot = Some(handler);
    }
    with_controller(|c| c.enable_interrupt(line))
}

/// Dispatches a pending interrupt: invoked by the controller driver with
/// the decoded line number. Runs the bound handler, then signals EOI.
pub fn dispatch(line: u32) {
    {
        let mut guard = HANDLERS.lock();
        if let Some(table) = guard.as_mut() {
            if let Some(Some(handler)) = table.get_mut(line as usize) {
                handler();
            } else {
                bekos_core::kwarn!("irq", "spurious interrupt on line {}", line);
            }
        }
    }
    let _ = with_controller(|c| c.end_of_interrupt(line));
}

// ---------------------------------------------------------------------------
// Deferred calls
// ---------------------------------------------------------------------------

/// Deferred-call machinery.
pub mod deferred {
    use super::{Box, IrqSpinLock, SysError, SysResult, Vec};

    /// Bound on simultaneously queued calls.
    const MAX_DEFERRED: usize = 32;

    static QUEUE: IrqSpinLock<Vec<Box<dyn FnOnce() + Send>>> = IrqSpinLock::new(Vec::new());

    /// Enqueues work to run after the current interrupt returns.
    ///
    /// # Errors
    ///
    /// `EFAIL` when the queue is full; the caller loses the tick, which is
    /// tolerable for periodic work and fatal by assertion for one-shots.
    pub fn queue_call(call: impl FnOnce() + Send + 'static) -> SysResult<()> {
        let mut queue = QUEUE.lock();
        if queue.len() >= MAX_DEFERRED {
            return Err(SysError::Failed);
        }
        queue.push(Box::new(call));
        Ok(())
    }

    /// Drains and runs every queued call. Invoked from the exception
    /// return path, outside interrupt context.
    pub fn drain() {
        loop {
            let next = QUEUE.lock().pop();
            match next {
                Some(call) => call(),
                None => break,
            }
        }
    }

    /// Returns the number of queued calls (diagnostics).
    #[must_use]
    pub fn pending() -> usize {
        QUEUE.lock().len()
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use alloc::sync::Arc;
        use core::sync::atomic::{AtomicUsize, Ordering};

        #[test]
        fn queued_calls_run_on_drain() {
            let counter = Arc::new(AtomicUsize::new(0));
            for _ in 0..3 {
                let counter = counter.clone();
                queue_call(move || {
                    counter.fetch_add(1, Ordering::Relaxed);
                })
                .unwrap();
            }
            drain();
            assert_eq!(counter.load(Ordering::Relaxed), 3);
            assert_eq!(pending(), 0);
        }

        #[test]
        fn deferred_call_may_requeue() {
            // A drained call queuing more work: the same drain picks it up.
            let counter = Arc::new(AtomicUsize::new(0));
            let inner_counter = counter.clone();
            queue_call(move || {
                let counter = inner_counter.clone();
                queue_call(move || {
                    counter.fetch_add(10, Ordering::Relaxed);
                })
                .unwrap();
                inner_counter.fetch_add(1, Ordering::Relaxed);
            })
            .unwrap();
            drain();
            assert_eq!(counter.load(Ordering::Relaxed), 11);
        }
    }
}
