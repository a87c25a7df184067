//! Type-safe identifiers for transport entities.
//!
//! Newtype wrappers prevent mixing connection and stream identifiers at
//! compile time.
//!
//! | Type | Source |
//! |------|--------|
//! | [`ConnectionId`] | Generated locally when a connection is accepted |
//! | [`StreamId`] | Assigned by the raw transport |

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// ConnectionId
// ============================================================================

/// Opaque identifier of a [`Connection`](crate::transport::Connection).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Generates a new random connection ID.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns the underlying UUID.
    #[inline]
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Simple form keeps log lines short.
        write!(f, "{}", self.0.simple())
    }
}

// ============================================================================
// StreamId
// ============================================================================

/// Identifier of a stream within one connection.
///
/// Uses the QUIC numbering scheme: the lowest bit is the initiator
/// (0 = client, 1 = server), the next bit the directionality
/// (0 = bidirectional, 1 = unidirectional).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StreamId(u64);

impl StreamId {
    /// Creates a stream ID from its raw value.
    #[inline]
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Builds the ID of the `index`-th stream of a given kind.
    #[inline]
    #[must_use]
    pub const fn from_parts(index: u64, server_initiated: bool, unidirectional: bool) -> Self {
        Self((index << 2) | ((unidirectional as u64) << 1) | server_initiated as u64)
    }

    /// Returns the raw value.
    #[inline]
    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    /// Returns `true` if the stream was opened by the server.
    #[inline]
    #[must_use]
    pub const fn is_server_initiated(&self) -> bool {
        self.0 & 0x1 == 0x1
    }

    /// Returns `true` if the stream carries data in both directions.
    #[inline]
    #[must_use]
    pub const fn is_bidirectional(&self) -> bool {
        self.0 & 0x2 == 0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Tests
// ============================================================================
