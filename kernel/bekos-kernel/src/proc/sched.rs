//! Scheduling policy.
//!
//! Round-robin by starvation credit: each process carries an integer time
//! counter. On a tick the current process's counter drops to zero, the
//! runnable process with the highest counter wins, and if nobody holds a
//! positive counter everyone is topped up by one and the search repeats.
//! The policy is pure over a summary slice so it is testable without a
//! process table.

/// Scheduler view of one process slot.
#[derive(Debug, Clone, Copy)]
pub struct SchedEntry {
    /// `true` when the slot holds a `Running` process.
    pub runnable: bool,
    /// Starvation credit.
    pub counter: i64,
}

/// Picks the next slot to run, mutating counters per the policy.
///
/// Returns `None` when no slot is runnable (the caller keeps its current
/// context; in practice the adopted boot thread is always runnable).
#[must_use]
pub fn pick_next(entries: &mut [SchedEntry]) -> Option<usize> {
    if !entries.iter().any(|e| e.runnable) {
        return None;
    }
    loop {
        let mut best: Option<usize> = None;
        let mut max_counter = -1;
        for (index, entry) in entries.iter().enumerate() {
            if entry.runnable && entry.counter > max_counter {
                max_counter = entry.counter;
                best = Some(index);
            }
        }
        if max_counter > 0 {
            return best;
        }
        // Everyone is spent: top up and try again.
        for entry in entries.iter_mut() {
            entry.counter += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    fn running(counter: i64) -> SchedEntry {
        SchedEntry {
            runnable: true,
            counter,
        }
    }

    #[test]
    fn empty_table_picks_nothing() {
        assert_eq!(pick_next(&mut []), None);
        let mut stopped = [SchedEntry {
            runnable: false,
            counter: 5,
        }];
        assert_eq!(pick_next(&mut stopped), None);
    }

    #[test]
    fn highest_counter_wins() {
        let mut entries = [running(1), running(3), running(2)];
        assert_eq!(pick_next(&mut entries), Some(1));
    }

    #[test]
    fn refill_when_everyone_spent() {
        let mut entries = [running(0), running(0)];
        // Both at zero: a top-up round makes both 1, index 0 wins the tie.
        assert_eq!(pick_next(&mut entries), Some(0));
        assert_eq!(entries[0].counter, 1);
        assert_eq!(entries[1].counter, 1);
    }

    #[test]
    fn stopped_processes_never_chosen_but_still_refilled() {
        let mut entries = [
            SchedEntry {
                runnable: false,
                counter: 100,
            },
            running(0),
        ];
        assert_eq!(pick_next(&mut entries), Some(1));
        // The refill touched every slot, matching the original policy.
        assert_eq!(entries[0].counter, 101);
    }

    /// Steady-state fairness: with N running processes, each is chosen at
    /// least once in every N consecutive ticks.
    #[test]
    fn fairness_over_n_ticks() {
        const N: usize = 5;
        let mut entries: Vec<SchedEntry> = (0..N).map(|_| running(0)).collect();
        let mut history = Vec::new();

        let mut current = 0usize;
        for _ in 0..N * 6 {
            // The tick zeroes the current process's credit, then picks.
            entries[current].counter = 0;
            let chosen = pick_next(&mut entries).unwrap();
            history.push(chosen);
            current = chosen;
        }

        for window in history.windows(N) {
            for expected in 0..N {
                assert!(
                    window.contains(&expected),
                    "process {expected} starved in window {window:?}"
                );
            }
        }
    }

    #[test]
    fn single_runnable_is_always_chosen() {
        let mut entries = [running(0)];
        for _ in 0..10 {
            entries[0].counter = 0;
            assert_eq!(pick_next(&mut entries), Some(0));
        }
    }
}
