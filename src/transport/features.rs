//! Capability traits exposed to the protocol layer.
//!
//! Rather than one wide interface, connections and streams implement a set of
//! small traits. A protocol layer depends only on the capabilities it uses.
//!
//! | Trait | Implemented by | Purpose |
//! |-------|----------------|---------|
//! | [`DuplexTransport`] | `Connection`, `Stream` | Identity, endpoints, closed signal, abort |
//! | [`StreamDirection`] | `Stream` | Which directions carry data |
//! | [`StreamIdentity`] | `Stream` | Transport-assigned stream ID |
//! | [`ProtocolErrorCode`] | `Connection`, `Stream` | Error code used by aborts and close |
//! | [`PersistentState`] | `Stream` | State that survives stream reuse |
//! | [`StreamAbort`] | `Stream` | Abort one direction |
//! | [`StreamClosed`] | `Stream` | Callbacks run when the stream closes |

// ============================================================================
// Imports
// ============================================================================

use std::any::{Any, TypeId};
use std::fmt;
use std::net::SocketAddr;

use rustc_hash::FxHashMap;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::identifiers::StreamId;

// ============================================================================
// Types
// ============================================================================

/// Callback run once when a stream closes.
pub type ClosedCallback = Box<dyn FnOnce() + Send>;

// ============================================================================
// DuplexTransport
// ============================================================================

/// Shape shared by connections and streams.
pub trait DuplexTransport {
    /// Returns the identifier used in logs.
    ///
    /// Streams report `{connection}:{stream}`.
    fn connection_id(&self) -> String;

    /// Returns the local endpoint.
    fn local_addr(&self) -> SocketAddr;

    /// Returns the remote endpoint.
    fn remote_addr(&self) -> SocketAddr;

    /// Returns a token cancelled when the transport closes.
    fn closed_token(&self) -> CancellationToken;

    /// Aborts the transport. Only the first call has an effect.
    fn abort(&self, reason: Error);
}

// ============================================================================
// Stream Capabilities
// ============================================================================

/// Reports which directions of a stream carry data.
pub trait StreamDirection {
    /// Returns `true` if the stream can be read.
    fn can_read(&self) -> bool;

    /// Returns `true` if the stream can be written.
    fn can_write(&self) -> bool;
}

/// Reports the transport-assigned stream ID.
pub trait StreamIdentity {
    /// Returns the stream ID.
    fn stream_id(&self) -> StreamId;
}

/// Application error code used when aborting or closing.
pub trait ProtocolErrorCode {
    /// Returns the current error code, if one was set or observed.
    fn error_code(&self) -> Option<u64>;

    /// Sets the error code used by subsequent aborts.
    fn set_error_code(&self, code: u64);
}

/// Per-stream state that survives pooling.
///
/// Protocol layers cache expensive per-stream objects here; they are handed
/// back when the stream object is reused for a later stream.
pub trait PersistentState {
    /// Returns the persistent state bag.
    fn persistent_state(&mut self) -> &mut StateBag;
}

/// Aborts one direction of a stream.
pub trait StreamAbort {
    /// Aborts reading with `error_code`, recording `reason`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] if the stream cannot be read.
    fn abort_read(&self, error_code: u64, reason: Error) -> Result<()>;

    /// Aborts writing with `error_code`, recording `reason`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] if the stream cannot be written.
    fn abort_write(&self, error_code: u64, reason: Error) -> Result<()>;
}

/// Registers callbacks for stream closure.
pub trait StreamClosed {
    /// Runs `callback` once when the stream closes.
    ///
    /// Callbacks registered after closure never run. Registrations are
    /// dropped when the stream object is reused.
    fn on_closed(&self, callback: ClosedCallback);
}

/// Direction requested for an outbound stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamDirectionHint {
    /// The stream must be readable.
    pub can_read: bool,
    /// The stream must be writable.
    pub can_write: bool,
}

impl StreamDirectionHint {
    /// Hint for a bidirectional stream.
    pub const BIDIRECTIONAL: Self = Self {
        can_read: true,
        can_write: true,
    };

    /// Hint for a send-only stream.
    pub const SEND_ONLY: Self = Self {
        can_read: false,
        can_write: true,
    };
}

// ============================================================================
// StateBag
// ============================================================================

/// Type-keyed storage, one value per type.
#[derive(Default)]
pub struct StateBag {
    values: FxHashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl StateBag {
    /// Creates an empty bag.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a value, returning the previous value of the same type.
    pub fn insert<T: Any + Send + Sync>(&mut self, value: T) -> Option<T> {
        self.values
            .insert(TypeId::of::<T>(), Box::new(value))
            .and_then(|previous| previous.downcast().ok().map(|boxed| *boxed))
    }

    /// Returns a reference to the value of type `T`.
    #[must_use]
    pub fn get<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.values
            .get(&TypeId::of::<T>())
            .and_then(|value| value.downcast_ref())
    }

    /// Returns a mutable reference to the value of type `T`.
    pub fn get_mut<T: Any + Send + Sync>(&mut self) -> Option<&mut T> {
        self.values
            .get_mut(&TypeId::of::<T>())
            .and_then(|value| value.downcast_mut())
    }

    /// Removes and returns the value of type `T`.
    pub fn remove<T: Any + Send + Sync>(&mut self) -> Option<T> {
        self.values
            .remove(&TypeId::of::<T>())
            .and_then(|value| value.downcast().ok().map(|boxed| *boxed))
    }

    /// Returns the number of stored values.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns `true` if the bag is empty.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Removes every value.
    pub fn clear(&mut self) {
        self.values.clear();
    }
}

impl fmt::Debug for StateBag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateBag")
            .field("len", &self.values.len())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct HeaderCache(Vec<String>);

    #[test]
    fn test_state_bag_insert_get() {
        let mut bag = StateBag::new();
        assert!(bag.insert(HeaderCache(vec!["host".into()])).is_none());
        assert!(bag.insert(7u32).is_none());

        assert_eq!(bag.get::<u32>(), Some(&7));
        assert_eq!(bag.get::<HeaderCache>().map(|c| c.0.len()), Some(1));
        assert_eq!(bag.len(), 2);
    }

    #[test]
    fn test_state_bag_replace_returns_previous() {
        let mut bag = StateBag::new();
        bag.insert(1u64);
        assert_eq!(bag.insert(2u64), Some(1));

        if let Some(value) = bag.get_mut::<u64>() {
            *value += 1;
        }
        assert_eq!(bag.remove::<u64>(), Some(3));
        assert!(bag.is_empty());
    }

    #[test]
    fn test_state_bag_clear() {
        let mut bag = StateBag::new();
        bag.insert("value");
        bag.clear();
        assert!(bag.get::<&str>().is_none());
    }

    #[test]
    fn test_direction_hints() {
        assert!(StreamDirectionHint::BIDIRECTIONAL.can_read);
        assert!(!StreamDirectionHint::SEND_ONLY.can_read);
        assert!(StreamDirectionHint::SEND_ONLY.can_write);
    }
}
