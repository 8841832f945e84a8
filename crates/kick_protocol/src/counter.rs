use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

/// Wraparound-safe `current >= target` for 32-bit completion values.
pub fn counter_reached(current: u32, target: u32) -> bool {
    (current.wrapping_sub(target) as i32) >= 0
}

/// Host/GPU shared completion value pair.
///
/// `next_to_signal` is owned by the host and bumped before a submission that asks the GPU to
/// write it. `current` stands in for the mapped location the GPU writes once that work is done.
/// Clones share the same cell.
#[derive(Clone)]
pub struct CompletionCounter {
    cell: Arc<CounterCell>,
}

struct CounterCell {
    next_to_signal: AtomicU32,
    current: AtomicU32,
}

impl CompletionCounter {
    pub fn new() -> Self {
        Self::starting_at(0)
    }

    pub fn starting_at(value: u32) -> Self {
        Self {
            cell: Arc::new(CounterCell {
                next_to_signal: AtomicU32::new(value),
                current: AtomicU32::new(value),
            }),
        }
    }

    pub fn next_to_signal(&self) -> u32 {
        self.cell.next_to_signal.load(Ordering::Acquire)
    }

    pub fn current(&self) -> u32 {
        self.cell.current.load(Ordering::Acquire)
    }

    /// The value the next submission carrying this counter will confirm.
    pub fn pending_value(&self) -> u32 {
        self.next_to_signal().wrapping_add(1)
    }

    pub fn is_reached(&self, target: u32) -> bool {
        counter_reached(self.current(), target)
    }

    pub fn is_idle(&self) -> bool {
        self.current() == self.next_to_signal()
    }

    /// Speculatively advance `next_to_signal`, returning the new value. Pair with
    /// [`CompletionCounter::restore_next_to_signal`] when the submission does not go through.
    pub fn reserve_next(&self) -> u32 {
        self.cell
            .next_to_signal
            .fetch_add(1, Ordering::AcqRel)
            .wrapping_add(1)
    }

    pub fn restore_next_to_signal(&self, value: u32) {
        self.cell.next_to_signal.store(value, Ordering::Release);
    }

    /// GPU-side write of `current`. Stale values are ignored so readers never see it go back.
    pub fn signal(&self, value: u32) -> bool {
        let mut observed = self.cell.current.load(Ordering::Acquire);
        loop {
            if observed == value || counter_reached(observed, value) {
                return false;
            }
            match self.cell.current.compare_exchange_weak(
                observed,
                value,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => observed = actual,
            }
        }
    }

    pub fn same_counter(&self, other: &CompletionCounter) -> bool {
        Arc::ptr_eq(&self.cell, &other.cell)
    }
}

impl Default for CompletionCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for CompletionCounter {
    fn eq(&self, other: &Self) -> bool {
        self.same_counter(other)
    }
}

impl Eq for CompletionCounter {}

impl fmt::Debug for CompletionCounter {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("CompletionCounter")
            .field("next_to_signal", &self.next_to_signal())
            .field("current", &self.current())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::{CompletionCounter, counter_reached};

    #[test]
    fn reached_handles_wraparound() {
        assert!(counter_reached(5, 5));
        assert!(counter_reached(6, 5));
        assert!(!counter_reached(4, 5));
        assert!(counter_reached(2, u32::MAX - 1));
        assert!(!counter_reached(u32::MAX - 1, 2));
    }

    #[test]
    fn signal_never_moves_current_backwards() {
        let counter = CompletionCounter::new();
        assert!(counter.signal(3));
        assert!(!counter.signal(2));
        assert!(!counter.signal(3));
        assert_eq!(counter.current(), 3);
        assert!(counter.signal(4));
        assert_eq!(counter.current(), 4);
    }

    #[test]
    fn reserve_and_restore_next_to_signal() {
        let counter = CompletionCounter::starting_at(u32::MAX);
        let previous = counter.next_to_signal();
        assert_eq!(counter.reserve_next(), 0);
        assert_eq!(counter.pending_value(), 1);
        counter.restore_next_to_signal(previous);
        assert_eq!(counter.next_to_signal(), u32::MAX);
        assert!(counter.is_idle());
    }

    #[test]
    fn clones_share_state_and_compare_by_identity() {
        let counter = CompletionCounter::new();
        let clone = counter.clone();
        clone.signal(1);
        assert_eq!(counter.current(), 1);
        assert_eq!(counter, clone);
        assert_ne!(counter, CompletionCounter::new());
    }
}
