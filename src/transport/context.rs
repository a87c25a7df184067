//! Settings shared by a listener and every connection it produces.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;

use crate::clock::{Clock, MonotonicClock, duration_to_ticks};
use crate::heartbeat::HeartbeatSource;
use crate::options::TransportOptions;

// ============================================================================
// TransportContext
// ============================================================================

/// Options, clock and heartbeat used by connections and streams.
///
/// Built by [`ListenerBuilder`](super::ListenerBuilder), or directly when
/// wrapping client-side connections.
#[derive(Clone)]
pub struct TransportContext {
    options: TransportOptions,
    clock: Arc<dyn Clock>,
    heartbeat: Option<Arc<dyn HeartbeatSource>>,
}

impl TransportContext {
    /// Creates a context with a [`MonotonicClock`] and no heartbeat.
    ///
    /// Without a heartbeat, pooled streams never expire; they are released
    /// when their connection is disposed.
    #[must_use]
    pub fn new(options: TransportOptions) -> Self {
        Self {
            options,
            clock: Arc::new(MonotonicClock::new()),
            heartbeat: None,
        }
    }

    /// Replaces the tick source.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Sets the heartbeat that drives pool expiration.
    #[must_use]
    pub fn with_heartbeat(mut self, heartbeat: Arc<dyn HeartbeatSource>) -> Self {
        self.heartbeat = Some(heartbeat);
        self
    }

    /// Returns the transport options.
    #[inline]
    #[must_use]
    pub fn options(&self) -> &TransportOptions {
        &self.options
    }

    /// Returns the tick source.
    #[inline]
    #[must_use]
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Returns the heartbeat, if any.
    #[inline]
    #[must_use]
    pub fn heartbeat(&self) -> Option<&Arc<dyn HeartbeatSource>> {
        self.heartbeat.as_ref()
    }

    /// Idle lifetime of a pooled stream, in ticks.
    #[inline]
    pub(crate) fn stream_pool_expiry_ticks(&self) -> u64 {
        duration_to_ticks(self.options.stream_pool_expiry())
    }
}

impl Default for TransportContext {
    fn default() -> Self {
        Self::new(TransportOptions::default())
    }
}

impl fmt::Debug for TransportContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportContext")
            .field("options", &self.options)
            .field("heartbeat", &self.heartbeat.is_some())
            .finish_non_exhaustive()
    }
}
