//! Tick sources for pool expiration bookkeeping.
//!
//! Ticks are milliseconds on a monotonic timeline. Only differences between
//! ticks are meaningful.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::time::Instant;

// ============================================================================
// Clock
// ============================================================================

/// Source of monotonically non-decreasing millisecond ticks.
pub trait Clock: Send + Sync + 'static {
    /// Returns the current tick.
    fn now_ticks(&self) -> u64;
}

/// Converts a duration to ticks.
#[inline]
#[must_use]
pub fn duration_to_ticks(duration: Duration) -> u64 {
    duration.as_millis() as u64
}

// ============================================================================
// MonotonicClock
// ============================================================================

/// Clock backed by [`tokio::time::Instant`].
///
/// Follows tokio's paused time in tests.
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    /// Creates a clock whose tick zero is now.
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_ticks(&self) -> u64 {
        duration_to_ticks(self.origin.elapsed())
    }
}

impl fmt::Debug for MonotonicClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MonotonicClock")
            .field("ticks", &self.now_ticks())
            .finish()
    }
}

// ============================================================================
// ManualClock
// ============================================================================

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    ticks: AtomicU64,
}

impl ManualClock {
    /// Creates a clock starting at `ticks`.
    #[must_use]
    pub const fn new(ticks: u64) -> Self {
        Self {
            ticks: AtomicU64::new(ticks),
        }
    }

    /// Sets the current tick. Values lower than the current tick are ignored.
    pub fn set(&self, ticks: u64) {
        self.ticks.fetch_max(ticks, Ordering::Relaxed);
    }

    /// Moves the clock forward.
    pub fn advance(&self, duration: Duration) {
        self.ticks
            .fetch_add(duration_to_ticks(duration), Ordering::Relaxed);
    }
}

impl Clock for ManualClock {
    fn now_ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_monotonic_clock_follows_paused_time() {
        let clock = MonotonicClock::new();
        assert_eq!(clock.now_ticks(), 0);

        tokio::time::advance(Duration::from_millis(1500)).await;
        assert_eq!(clock.now_ticks(), 1500);
    }

    #[test]
    fn test_manual_clock_never_goes_backwards() {
        let clock = ManualClock::new(100);
        clock.set(50);
        assert_eq!(clock.now_ticks(), 100);

        clock.advance(Duration::from_secs(1));
        assert_eq!(clock.now_ticks(), 1100);
    }
}
