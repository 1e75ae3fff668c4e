//! Monotonic counters for frame sequence numbers and connection generations.
//!
//! # Sequence numbers
//!
//! Every frame submitted during a session carries a sequence number.  The
//! service echoes it back in `result_saved`, which is how the station tells a
//! fresh result from a duplicate delivery.  Numbering restarts at 1 for every
//! session.
//!
//! # Generations
//!
//! Every time the transport opens a connection it takes a new *generation*
//! number and stamps it on every event that connection produces.  After a
//! reconnect, anything still arriving from the old connection carries an old
//! generation and is dropped by the state machine.  Generations are never
//! reset: one counter is shared by every session in the process, so even
//! stragglers from a previous session cannot collide with a live connection.
//!
//! Both counters use `AtomicU64` so they can be shared between the session
//! loop and the transport task without a lock.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// A thread-safe, monotonically increasing counter for frame sequence numbers.
///
/// The first call to [`next`](Self::next) returns 1.
///
/// # Examples
///
/// ```rust
/// use omr_core::protocol::SequenceCounter;
///
/// let counter = SequenceCounter::new();
/// assert_eq!(counter.next(), 1);
/// assert_eq!(counter.next(), 2);
/// assert_eq!(counter.current(), 2);
/// ```
#[derive(Debug, Default)]
pub struct SequenceCounter {
    inner: AtomicU64,
}

impl SequenceCounter {
    /// Creates a new counter; nothing has been issued yet.
    pub fn new() -> Self {
        Self {
            inner: AtomicU64::new(0),
        }
    }

    /// Issues the next sequence number.
    ///
    /// `Ordering::Relaxed` is sufficient: the number orders frames, it does
    /// not publish any other memory.
    pub fn next(&self) -> u64 {
        self.inner.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }

    /// Returns the most recently issued number (0 if none yet).
    pub fn current(&self) -> u64 {
        self.inner.load(Ordering::Relaxed)
    }
}

/// Identifies one underlying connection instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Generation(pub u64);

impl Generation {
    /// The generation before any connection has been opened.
    pub const NONE: Generation = Generation(0);
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gen#{}", self.0)
    }
}

/// Process-wide source of connection generations.
#[derive(Debug, Default)]
pub struct GenerationCounter {
    inner: AtomicU64,
}

impl GenerationCounter {
    pub fn new() -> Self {
        Self {
            inner: AtomicU64::new(0),
        }
    }

    /// Allocates a fresh generation, strictly greater than every earlier one.
    pub fn advance(&self) -> Generation {
        Generation(self.inner.fetch_add(1, Ordering::AcqRel) + 1)
    }

    /// Returns the most recently allocated generation.
    pub fn current(&self) -> Generation {
        Generation(self.inner.load(Ordering::Acquire))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_sequence_counter_starts_at_one() {
        // Arrange
        let counter = SequenceCounter::new();

        // Act
        let first = counter.next();

        // Assert
        assert_eq!(first, 1);
    }

    #[test]
    fn test_sequence_counter_current_does_not_increment() {
        let counter = SequenceCounter::new();
        counter.next();

        assert_eq!(counter.current(), 1);
        assert_eq!(counter.current(), 1);
        assert_eq!(counter.next(), 2);
    }

    #[test]
    fn test_sequence_counter_reports_zero_before_first_issue() {
        assert_eq!(SequenceCounter::default().current(), 0);
    }

    #[test]
    fn test_generation_counter_is_strictly_increasing() {
        // Arrange
        let counter = GenerationCounter::new();

        // Act
        let values: Vec<Generation> = (0..50).map(|_| counter.advance()).collect();

        // Assert
        assert_eq!(values[0], Generation(1));
        for window in values.windows(2) {
            assert!(window[1] > window[0]);
        }
        assert_eq!(counter.current(), Generation(50));
    }

    #[test]
    fn test_generation_counter_unique_across_threads() {
        // Arrange
        let counter = Arc::new(GenerationCounter::new());

        // Act – allocate from several threads at once
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let c = Arc::clone(&counter);
                thread::spawn(move || (0..250).map(|_| c.advance()).collect::<Vec<_>>())
            })
            .collect();
        let mut all: Vec<Generation> = handles
            .into_iter()
            .flat_map(|h| h.join().expect("thread panicked"))
            .collect();

        // Assert – no two connections ever share a generation
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 1000);
    }

    #[test]
    fn test_generation_none_precedes_first_allocation() {
        let counter = GenerationCounter::new();
        assert_eq!(counter.current(), Generation::NONE);
        assert!(counter.advance() > Generation::NONE);
    }

    #[test]
    fn test_generation_display() {
        assert_eq!(Generation(7).to_string(), "gen#7");
    }
}
