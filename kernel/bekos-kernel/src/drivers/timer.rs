//! The timing manager.
//!
//! The concrete timer lives outside this core; it appears here as
//! [`TimerDevice`], a monotonic tick counter at a fixed frequency plus a
//! one-shot compare. The [`TimingManager`] keeps a deadline-sorted list of
//! callbacks, arms the device for the earliest one, and on each hardware
//! interrupt runs everything due, rescheduling per callback verdict.

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, Ordering};

use planck_noalloc::vec::ArrayVec;

use bekos_core::sync::{InterruptGuard, IrqSpinLock};
use bekos_core::{SysError, SysResult};

use super::device::Device;

/// Nanoseconds per second.
const NS_PER_S: u64 = 1_000_000_000;

/// Estimated cost of servicing one timer operation, used as the minimum
/// programmable delay.
const OPERATION_NS_ESTIMATE: u64 = 1_000;

/// Bound on simultaneously pending callbacks; insertion happens with
/// interrupts masked, so the list is fixed-capacity rather than heap-grown.
const MAX_PENDING: usize = 64;

/// The interface a hardware timer driver provides.
pub trait TimerDevice: Send + Sync {
    /// Counter frequency in Hz.
    fn frequency(&self) -> u64;

    /// Monotonic tick count since boot.
    fn ticks(&self) -> u64;

    /// Arms the compare to fire `ticks_from_now` ticks in the future. The
    /// driver routes the resulting interrupt to [`on_timer_interrupt`].
    fn arm_oneshot(&self, ticks_from_now: u64);
}

/// What a timing callback wants next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackAction {
    /// Unregister the callback.
    Cancel,
    /// Fire again after this many nanoseconds.
    Reschedule(u64),
}

type TimingCallback = Box<dyn FnMut(u64) -> CallbackAction + Send>;

struct TimingNode {
    callback: TimingCallback,
    /// Tick value at which this node fires.
    next_trigger: u64,
}

/// Deadline-sorted callback list over one timer device.
pub struct TimingManager {
    device: Arc<dyn Device>,
    /// Sorted ascending by `next_trigger`.
    pending: ArrayVec<TimingNode, MAX_PENDING>,
    min_delay_ticks: u64,
}

impl TimingManager {
    /// Builds the manager over a registered timer device.
    ///
    /// # Panics
    ///
    /// Panics if `device` does not expose [`TimerDevice`].
    #[must_use]
    pub fn new(device: Arc<dyn Device>) -> Self {
        let frequency = device
            .as_timer()
            .expect("timing manager needs a timer device")
            .frequency();
        Self {
            device,
            pending: ArrayVec::new(),
            min_delay_ticks: (OPERATION_NS_ESTIMATE * frequency / NS_PER_S).max(1),
        }
    }

    fn timer(&self) -> &dyn TimerDevice {
        self.device.as_timer().expect("timer device vanished")
    }

    fn ns_to_ticks(&self, ns: u64) -> u64 {
        (ns as u128 * u128::from(self.timer().frequency()) / u128::from(NS_PER_S)) as u64
    }

    /// Nanoseconds since the counter started.
    #[must_use]
    pub fn nanoseconds_since_start(&self) -> u64 {
        let timer = self.timer();
        (u128::from(timer.ticks()) * u128::from(NS_PER_S) / u128::from(timer.frequency())) as u64
    }

    /// Registers `callback` to fire after `period_ns` nanoseconds.
    ///
    /// There is no cancellation handle: a callback unregisters itself by
    /// returning [`CallbackAction::Cancel`].
    pub fn schedule_callback(&mut self, callback: TimingCallback, period_ns: u64) {
        let period = self.ns_to_ticks(period_ns).max(self.min_delay_ticks);
        let node = TimingNode {
            callback,
            next_trigger: self.timer().ticks() + period,
        };
        self.queue_node(node);
    }

    fn queue_node(&mut self, node: TimingNode) {
        let _guard = InterruptGuard::new();
        assert!(!self.pending.is_full(), "timing callback table full");
        let position = self
            .pending
            .iter()
            .position(|other| node.next_trigger < other.next_trigger)
            .unwrap_or(self.pending.len());
        let rearm = position == 0;
        self.pending.insert(position, node);
        if rearm {
            let now = self.timer().ticks();
            let delay = self.pending[0]
                .next_trigger
                .saturating_sub(now)
                .max(self.min_delay_ticks);
            self.timer().arm_oneshot(delay);
        }
    }

    /// Runs every due callback; called from the timer interrupt. Returns
    /// the arm-delay chosen for the next deadline, if any remain.
    pub fn on_tick(&mut self) -> Option<u64> {
        loop {
            let now = self.timer().ticks();
            if self
                .pending
                .as_slice()
                .first()
                .is_none_or(|node| node.next_trigger > now)
            {
                break;
            }
            let mut node = self.pending.remove(0);
            match (node.callback)(now) {
                CallbackAction::Cancel => {}
                CallbackAction::Reschedule(ns) => {
                    let period = self.ns_to_ticks(ns).max(self.min_delay_ticks);
                    node.next_trigger = now + period;
                    // Insert without re-arming: we arm below exactly once.
                    let position = self
                        .pending
                        .iter()
                        .position(|other| node.next_trigger < other.next_trigger)
                        .unwrap_or(self.pending.len());
                    self.pending.insert(position, node);
                }
            }
        }

        self.pending.as_slice().first().map(|node| {
            let delay = node
                .next_trigger
                .saturating_sub(self.timer().ticks())
                .max(self.min_delay_ticks);
            self.timer().arm_oneshot(delay);
            delay
        })
    }

    /// Number of pending callbacks (diagnostics).
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

// ---------------------------------------------------------------------------
// Global timing service
// ---------------------------------------------------------------------------

static TIMING: IrqSpinLock<Option<TimingManager>> = IrqSpinLock::new(None);

/// Installs the timing manager over the first registered timer device.
///
/// # Errors
///
/// `ENODEV` if no timer has been registered.
pub fn initialise() -> SysResult<()> {
    let device = crate::drivers::registry::with(|r| {
        r.find_first_of_kind(crate::drivers::device::DeviceKind::Timer)
    })
    .ok_or(SysError::NoDevice)?;
    let mut timing = TIMING.lock();
    assert!(timing.is_none(), "timing manager already initialised");
    *timing = Some(TimingManager::new(device));
    Ok(())
}

/// Registers a callback with the global manager.
///
/// Must not be called from inside a timing callback (the manager is held
/// while callbacks run); a callback reschedules itself by returning
/// [`CallbackAction::Reschedule`].
///
/// # Panics
///
/// Panics before [`initialise`].
pub fn schedule_callback(
    callback: impl FnMut(u64) -> CallbackAction + Send + 'static,
    period_ns: u64,
) {
    let mut timing = TIMING.lock();
    timing
        .as_mut()
        .expect("timing manager not initialised")
        .schedule_callback(Box::new(callback), period_ns);
}

/// Timer-interrupt entry: drives the global manager.
pub fn on_timer_interrupt() {
    let mut timing = TIMING.lock();
    if let Some(manager) = timing.as_mut() {
        manager.on_tick();
    }
}

/// Nanoseconds since boot (0 before the manager exists).
#[must_use]
pub fn nanoseconds_since_start() -> u64 {
    let timing = TIMING.lock();
    timing
        .as_ref()
        .map_or(0, TimingManager::nanoseconds_since_start)
}

/// Busy-waits for `microseconds`. This is what the `Sleep` syscall does:
/// the caller spins against the timer without yielding.
pub fn spindelay_us(microseconds: u64) {
    let completed = Arc::new(AtomicBool::new(false));
    {
        let completed = completed.clone();
        let mut timing = TIMING.lock();
        let Some(manager) = timing.as_mut() else {
            return;
        };
        manager.schedule_callback(
            Box::new(move |_| {
                completed.store(true, Ordering::Release);
                CallbackAction::Cancel
            }),
            microseconds * 1_000,
        );
    }
    while !completed.load(Ordering::Acquire) {
        core::hint::spin_loop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::device::DeviceKind;
    use bekos_core::sync::SpinLock;
    use core::sync::atomic::AtomicU64;

    /// A timer whose clock only moves when the test advances it.
    struct MockTimer {
        now: AtomicU64,
        armed: AtomicU64,
    }

    impl MockTimer {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                now: AtomicU64::new(0),
                armed: AtomicU64::new(u64::MAX),
            })
        }

        fn advance(&self, ticks: u64) {
            self.now.fetch_add(ticks, Ordering::Relaxed);
        }
    }

    impl TimerDevice for MockTimer {
        fn frequency(&self) -> u64 {
            1_000_000 // 1 MHz: one tick per microsecond.
        }
        fn ticks(&self) -> u64 {
            self.now.load(Ordering::Relaxed)
        }
        fn arm_oneshot(&self, ticks_from_now: u64) {
            self.armed.store(ticks_from_now, Ordering::Relaxed);
        }
    }

    struct MockTimerDevice(Arc<MockTimer>);
    impl Device for MockTimerDevice {
        fn kind(&self) -> DeviceKind {
            DeviceKind::Timer
        }
        fn as_timer(&self) -> Option<&dyn TimerDevice> {
            Some(self.0.as_ref())
        }
    }

    fn manager() -> (TimingManager, Arc<MockTimer>) {
        let timer = MockTimer::new();
        let manager = TimingManager::new(Arc::new(MockTimerDevice(timer.clone())));
        (manager, timer)
    }

    #[test]
    fn callback_fires_once_after_period() {
        let (mut manager, timer) = manager();
        let fired = Arc::new(AtomicU64::new(0));
        let fired2 = fired.clone();
        manager.schedule_callback(
            Box::new(move |_| {
                fired2.fetch_add(1, Ordering::Relaxed);
                CallbackAction::Cancel
            }),
            5_000, // 5 µs = 5 ticks at 1 MHz.
        );
        assert_eq!(manager.pending_count(), 1);

        // Not due yet.
        timer.advance(3);
        manager.on_tick();
        assert_eq!(fired.load(Ordering::Relaxed), 0);

        timer.advance(3);
        manager.on_tick();
        assert_eq!(fired.load(Ordering::Relaxed), 1);
        assert_eq!(manager.pending_count(), 0);
    }

    #[test]
    fn reschedule_keeps_firing() {
        let (mut manager, timer) = manager();
        let fired = Arc::new(AtomicU64::new(0));
        let fired2 = fired.clone();
        manager.schedule_callback(
            Box::new(move |_| {
                fired2.fetch_add(1, Ordering::Relaxed);
                CallbackAction::Reschedule(10_000)
            }),
            10_000,
        );

        for _ in 0..4 {
            timer.advance(10);
            manager.on_tick();
        }
        assert_eq!(fired.load(Ordering::Relaxed), 4);
        assert_eq!(manager.pending_count(), 1);
    }

    #[test]
    fn earliest_deadline_first() {
        let (mut manager, timer) = manager();
        let order = Arc::new(SpinLock::new(Vec::new()));

        for (tag, period) in [(1u32, 30_000u64), (2, 10_000), (3, 20_000)] {
            let order = order.clone();
            manager.schedule_callback(
                Box::new(move |_| {
                    order.lock().push(tag);
                    CallbackAction::Cancel
                }),
                period,
            );
        }

        timer.advance(100);
        manager.on_tick();
        assert_eq!(*order.lock(), alloc::vec![2, 3, 1]);
    }

    #[test]
    fn device_is_armed_for_nearest_deadline() {
        let (mut manager, timer) = manager();
        manager.schedule_callback(Box::new(|_| CallbackAction::Cancel), 50_000);
        assert_eq!(timer.armed.load(Ordering::Relaxed), 50);
        // A nearer deadline re-arms.
        manager.schedule_callback(Box::new(|_| CallbackAction::Cancel), 5_000);
        assert_eq!(timer.armed.load(Ordering::Relaxed), 5);
        // A later one does not.
        manager.schedule_callback(Box::new(|_| CallbackAction::Cancel), 90_000);
        assert_eq!(timer.armed.load(Ordering::Relaxed), 5);
    }

    #[test]
    fn nanoseconds_follow_ticks() {
        let (manager, timer) = manager();
        timer.advance(2_500);
        // 2500 ticks at 1 MHz = 2.5 ms.
        assert_eq!(manager.nanoseconds_since_start(), 2_500_000);
    }

    #[test]
    fn minimum_period_clamped() {
        let (mut manager, timer) = manager();
        // A zero-period request must still land at least the minimum ahead.
        manager.schedule_callback(Box::new(|_| CallbackAction::Cancel), 0);
        assert!(timer.armed.load(Ordering::Relaxed) >= 1);
    }
}
