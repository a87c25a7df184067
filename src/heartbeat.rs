//! Periodic heartbeat driving pool expiration.
//!
//! Connections register a callback on first use of their stream pool. The
//! heartbeat invokes every registered callback roughly once per interval,
//! without any guarantee of exact timing.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────┐   tick (≈1s)   ┌──────────────────────────┐
//! │ Heartbeat             │───────────────►│ Connection A: sweep pool │
//! │ interval + cancel     │───────────────►│ Connection B: sweep pool │
//! └───────────────────────┘                └──────────────────────────┘
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

// ============================================================================
// Types
// ============================================================================

/// Callback invoked on every heartbeat.
pub type HeartbeatCallback = Arc<dyn Fn() + Send + Sync>;

/// Handle returned by [`HeartbeatSource::on_heartbeat`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HeartbeatRegistration(u64);

// ============================================================================
// HeartbeatSource
// ============================================================================

/// A periodic callback facility.
pub trait HeartbeatSource: Send + Sync + 'static {
    /// Registers a callback to run on every heartbeat.
    fn on_heartbeat(&self, callback: HeartbeatCallback) -> HeartbeatRegistration;

    /// Removes a previously registered callback.
    fn remove(&self, registration: HeartbeatRegistration);
}

// ============================================================================
// Heartbeat
// ============================================================================

/// Interval-driven [`HeartbeatSource`].
///
/// Callbacks are snapshotted before invocation so a callback may register or
/// remove callbacks without deadlocking.
pub struct Heartbeat {
    /// Tick period.
    period: Duration,
    /// Registered callbacks.
    callbacks: Mutex<FxHashMap<u64, HeartbeatCallback>>,
    /// Next registration ID.
    next_id: AtomicU64,
    /// Stops the timer task.
    cancel: CancellationToken,
}

impl Heartbeat {
    /// Creates a heartbeat that has not started ticking.
    #[must_use]
    pub fn new(period: Duration) -> Arc<Self> {
        Arc::new(Self {
            period,
            callbacks: Mutex::new(FxHashMap::default()),
            next_id: AtomicU64::new(1),
            cancel: CancellationToken::new(),
        })
    }

    /// Creates a heartbeat and starts its timer task.
    #[must_use]
    pub fn start(period: Duration) -> Arc<Self> {
        let heartbeat = Self::new(period);

        let heartbeat_clone = Arc::clone(&heartbeat);
        tokio::spawn(async move {
            heartbeat_clone.run().await;
        });

        heartbeat
    }

    /// Stops the timer task. Registered callbacks stay registered.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Returns the number of registered callbacks.
    #[inline]
    #[must_use]
    pub fn callback_count(&self) -> usize {
        self.callbacks.lock().len()
    }

    /// Runs one round of callbacks immediately.
    pub fn tick(&self) {
        let snapshot: Vec<HeartbeatCallback> = self.callbacks.lock().values().cloned().collect();

        trace!(callbacks = snapshot.len(), "Heartbeat tick");

        for callback in snapshot {
            callback();
        }
    }

    /// Timer loop.
    async fn run(&self) {
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(period_ms = self.period.as_millis() as u64, "Heartbeat started");

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!("Heartbeat stopping");
                    break;
                }
                _ = ticker.tick() => {
                    self.tick();
                }
            }
        }
    }
}

impl HeartbeatSource for Heartbeat {
    fn on_heartbeat(&self, callback: HeartbeatCallback) -> HeartbeatRegistration {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks.lock().insert(id, callback);
        HeartbeatRegistration(id)
    }

    fn remove(&self, registration: HeartbeatRegistration) {
        self.callbacks.lock().remove(&registration.0);
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl fmt::Debug for Heartbeat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Heartbeat")
            .field("period", &self.period)
            .field("callbacks", &self.callback_count())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::AtomicUsize;

    fn counter() -> (Arc<AtomicUsize>, HeartbeatCallback) {
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);
        let callback: HeartbeatCallback = Arc::new(move || {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });
        (count, callback)
    }

    #[test]
    fn test_tick_invokes_callbacks() {
        let heartbeat = Heartbeat::new(Duration::from_secs(1));
        let (count, callback) = counter();

        heartbeat.on_heartbeat(callback);
        heartbeat.tick();
        heartbeat.tick();

        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_removed_callback_not_invoked() {
        let heartbeat = Heartbeat::new(Duration::from_secs(1));
        let (count, callback) = counter();

        let registration = heartbeat.on_heartbeat(callback);
        heartbeat.remove(registration);
        heartbeat.tick();

        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(heartbeat.callback_count(), 0);
    }

    #[test]
    fn test_callback_may_register_during_tick() {
        let heartbeat = Heartbeat::new(Duration::from_secs(1));
        let heartbeat_clone = Arc::clone(&heartbeat);
        heartbeat.on_heartbeat(Arc::new(move || {
            heartbeat_clone.on_heartbeat(Arc::new(|| {}));
        }));

        heartbeat.tick();
        assert_eq!(heartbeat.callback_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_ticks_until_stopped() {
        let heartbeat = Heartbeat::start(Duration::from_secs(1));
        let (count, callback) = counter();
        heartbeat.on_heartbeat(callback);

        tokio::time::sleep(Duration::from_millis(2500)).await;
        let ticks = count.load(Ordering::SeqCst);
        assert!(ticks >= 2, "expected at least two ticks, got {ticks}");

        heartbeat.stop();
        tokio::time::sleep(Duration::from_millis(10)).await;
        let stopped_at = count.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(count.load(Ordering::SeqCst), stopped_at);
    }
}
