//! Transport configuration options.
//!
//! Provides a type-safe interface for tuning the adapter: stream pool
//! bounds and expiry, pipe backpressure thresholds, and default error codes.
//!
//! # Example
//!
//! ```
//! use streamplex::TransportOptions;
//!
//! let options = TransportOptions::new()
//!     .with_max_stream_pool_size(32)
//!     .with_max_read_buffer_size(256 * 1024);
//!
//! assert!(options.validate().is_ok());
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// Initial size of a connection's stream pool array.
pub const DEFAULT_INITIAL_STREAM_POOL_CAPACITY: usize = 5;

/// Maximum number of idle streams retained per connection.
pub const DEFAULT_MAX_STREAM_POOL_SIZE: usize = 100;

/// How long an idle stream stays in the pool.
pub const DEFAULT_STREAM_POOL_EXPIRY_MS: u64 = 5_000;

/// Input pipe pause threshold (1 MiB).
pub const DEFAULT_MAX_READ_BUFFER_SIZE: usize = 1024 * 1024;

/// Output pipe pause threshold (64 KiB).
pub const DEFAULT_MAX_WRITE_BUFFER_SIZE: usize = 64 * 1024;

/// Minimum buffer handed to a raw read.
pub const DEFAULT_MIN_ALLOC_BUFFER_SIZE: usize = 4096;

/// Period of the bundled heartbeat.
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 1_000;

// ============================================================================
// TransportOptions
// ============================================================================

/// Tunables for listeners, connections and streams.
///
/// None of these values is semantically load-bearing; they trade memory for
/// allocation churn and throughput.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportOptions {
    /// Initial size of each connection's stream pool array.
    pub initial_stream_pool_capacity: usize,

    /// Maximum number of pooled streams per connection.
    pub max_stream_pool_size: usize,

    /// Idle lifetime of a pooled stream, in milliseconds.
    pub stream_pool_expiry_ms: u64,

    /// Buffered input bytes at which the receive pump pauses (0 = unbounded).
    pub max_read_buffer_size: usize,

    /// Buffered output bytes at which application writes pause (0 = unbounded).
    pub max_write_buffer_size: usize,

    /// Size of each raw read issued by the receive pump.
    pub min_alloc_buffer_size: usize,

    /// Error code used when a stream is aborted before any code was set.
    pub default_stream_error_code: u64,

    /// Error code used to close a connection when no peer code was observed.
    pub default_close_error_code: u64,

    /// Period of the bundled [`Heartbeat`](crate::heartbeat::Heartbeat), in milliseconds.
    pub heartbeat_interval_ms: u64,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Constructors
// ============================================================================

impl TransportOptions {
    /// Creates options with default settings.
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self {
            initial_stream_pool_capacity: DEFAULT_INITIAL_STREAM_POOL_CAPACITY,
            max_stream_pool_size: DEFAULT_MAX_STREAM_POOL_SIZE,
            stream_pool_expiry_ms: DEFAULT_STREAM_POOL_EXPIRY_MS,
            max_read_buffer_size: DEFAULT_MAX_READ_BUFFER_SIZE,
            max_write_buffer_size: DEFAULT_MAX_WRITE_BUFFER_SIZE,
            min_alloc_buffer_size: DEFAULT_MIN_ALLOC_BUFFER_SIZE,
            default_stream_error_code: 0,
            default_close_error_code: 0,
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
        }
    }

    /// Parses options from JSON. Missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the JSON is malformed or the resulting
    /// options fail [`validate`](Self::validate).
    pub fn from_json(json: &str) -> Result<Self> {
        let options: Self = serde_json::from_str(json)
            .map_err(|e| Error::config(format!("Invalid transport options: {e}")))?;
        options.validate()?;
        Ok(options)
    }
}

// ============================================================================
// Builder Methods
// ============================================================================

impl TransportOptions {
    /// Sets the initial stream pool array size.
    #[inline]
    #[must_use]
    pub fn with_initial_stream_pool_capacity(mut self, capacity: usize) -> Self {
        self.initial_stream_pool_capacity = capacity;
        self
    }

    /// Sets the maximum number of pooled streams per connection.
    #[inline]
    #[must_use]
    pub fn with_max_stream_pool_size(mut self, size: usize) -> Self {
        self.max_stream_pool_size = size;
        self
    }

    /// Sets how long a pooled stream may stay idle.
    #[inline]
    #[must_use]
    pub fn with_stream_pool_expiry(mut self, expiry: Duration) -> Self {
        self.stream_pool_expiry_ms = expiry.as_millis() as u64;
        self
    }

    /// Sets the input pipe pause threshold.
    #[inline]
    #[must_use]
    pub fn with_max_read_buffer_size(mut self, size: usize) -> Self {
        self.max_read_buffer_size = size;
        self
    }

    /// Sets the output pipe pause threshold.
    #[inline]
    #[must_use]
    pub fn with_max_write_buffer_size(mut self, size: usize) -> Self {
        self.max_write_buffer_size = size;
        self
    }

    /// Sets the raw read size used by the receive pump.
    #[inline]
    #[must_use]
    pub fn with_min_alloc_buffer_size(mut self, size: usize) -> Self {
        self.min_alloc_buffer_size = size;
        self
    }

    /// Sets the default stream abort error code.
    #[inline]
    #[must_use]
    pub fn with_default_stream_error_code(mut self, code: u64) -> Self {
        self.default_stream_error_code = code;
        self
    }

    /// Sets the default connection close error code.
    #[inline]
    #[must_use]
    pub fn with_default_close_error_code(mut self, code: u64) -> Self {
        self.default_close_error_code = code;
        self
    }

    /// Sets the bundled heartbeat period.
    #[inline]
    #[must_use]
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval_ms = interval.as_millis() as u64;
        self
    }
}

// ============================================================================
// Accessors
// ============================================================================

impl TransportOptions {
    /// Validates the options.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first invalid field.
    pub fn validate(&self) -> Result<()> {
        if self.max_stream_pool_size == 0 {
            return Err(Error::config("max_stream_pool_size must be greater than zero"));
        }
        if self.initial_stream_pool_capacity > self.max_stream_pool_size {
            return Err(Error::config(format!(
                "initial_stream_pool_capacity ({}) exceeds max_stream_pool_size ({})",
                self.initial_stream_pool_capacity, self.max_stream_pool_size
            )));
        }
        if self.min_alloc_buffer_size == 0 {
            return Err(Error::config("min_alloc_buffer_size must be greater than zero"));
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(Error::config("heartbeat_interval_ms must be greater than zero"));
        }
        Ok(())
    }

    /// Returns the pooled stream idle lifetime.
    #[inline]
    #[must_use]
    pub const fn stream_pool_expiry(&self) -> Duration {
        Duration::from_millis(self.stream_pool_expiry_ms)
    }

    /// Returns the bundled heartbeat period.
    #[inline]
    #[must_use]
    pub const fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = TransportOptions::default();
        assert_eq!(options.initial_stream_pool_capacity, 5);
        assert_eq!(options.max_stream_pool_size, 100);
        assert_eq!(options.stream_pool_expiry(), Duration::from_secs(5));
        assert_eq!(options.heartbeat_interval(), Duration::from_secs(1));
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_builder_chain() {
        let options = TransportOptions::new()
            .with_max_stream_pool_size(10)
            .with_initial_stream_pool_capacity(2)
            .with_stream_pool_expiry(Duration::from_millis(250))
            .with_default_close_error_code(0x100);

        assert_eq!(options.max_stream_pool_size, 10);
        assert_eq!(options.initial_stream_pool_capacity, 2);
        assert_eq!(options.stream_pool_expiry_ms, 250);
        assert_eq!(options.default_close_error_code, 0x100);
    }

    #[test]
    fn test_validate_rejects_zero_pool() {
        let options = TransportOptions::new()
            .with_max_stream_pool_size(0)
            .with_initial_stream_pool_capacity(0);
        assert!(matches!(options.validate(), Err(Error::Config { .. })));
    }

    #[test]
    fn test_validate_rejects_initial_above_max() {
        let options = TransportOptions::new()
            .with_max_stream_pool_size(4)
            .with_initial_stream_pool_capacity(8);
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_from_json_partial() {
        let options = TransportOptions::from_json(r#"{ "max_stream_pool_size": 7 }"#)
            .expect("valid options");
        assert_eq!(options.max_stream_pool_size, 7);
        assert_eq!(options.min_alloc_buffer_size, DEFAULT_MIN_ALLOC_BUFFER_SIZE);
    }

    #[test]
    fn test_from_json_malformed() {
        let err = TransportOptions::from_json("{ not json").unwrap_err();
        assert!(err.to_string().starts_with("Configuration error: Invalid transport options"));
    }
}
