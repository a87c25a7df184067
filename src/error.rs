//! Error types for streamplex.
//!
//! This module defines all error types used throughout the crate.
//!
//! # Usage
//!
//! All fallible operations return [`Result<T>`] which uses [`Error`]:
//!
//! ```ignore
//! use streamplex::{Result, Error};
//!
//! async fn example(connection: &Connection<C>) -> Result<()> {
//!     let cancel = CancellationToken::new();
//!     while let Some(stream) = connection.accept_stream(&cancel).await? {
//!         handle(stream).await?;
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Error Categories
//!
//! | Category | Variants |
//! |----------|----------|
//! | Configuration | [`Error::Config`] |
//! | Peer abort | [`Error::ConnectionReset`], [`Error::StreamReset`] |
//! | Local abort | [`Error::Aborted`] |
//! | Lifecycle | [`Error::ConnectionClosed`], [`Error::SendCompleted`], [`Error::InvalidState`] |
//! | External | [`Error::Transport`] |
//!
//! [`TransportError`] is the error surface of the raw transport primitives
//! in [`crate::raw`]. Transport errors the adapter recognizes (peer abort,
//! local abort) are translated into the variants above; anything else is
//! wrapped in [`Error::Transport`].

// ============================================================================
// Imports
// ============================================================================

use std::result::Result as StdResult;

use thiserror::Error;

// ============================================================================
// Result Alias
// ============================================================================

/// Result type alias using crate [`enum@Error`].
///
/// All fallible operations in this crate return this type.
pub type Result<T> = StdResult<T, Error>;

// ============================================================================
// TransportError
// ============================================================================

/// Failure reported by a raw transport primitive.
///
/// Mirrors the handful of conditions a multiplexed transport distinguishes
/// when an operation does not complete normally.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The peer closed the whole connection with an application error code.
    #[error("Connection aborted by peer with error code {code}")]
    ConnectionAborted {
        /// Application error code sent by the peer.
        code: u64,
    },

    /// The peer aborted this stream direction with an application error code.
    #[error("Stream aborted by peer with error code {code}")]
    StreamAborted {
        /// Application error code sent by the peer.
        code: u64,
    },

    /// The operation was aborted locally (local abort or close).
    #[error("Operation aborted")]
    OperationAborted,

    /// Any other transport failure.
    #[error("{0}")]
    Other(String),
}

impl TransportError {
    /// Creates an unclassified transport error.
    #[inline]
    pub fn other(message: impl Into<String>) -> Self {
        Self::Other(message.into())
    }
}

// ============================================================================
// Error Enum
// ============================================================================

/// Main error type for the crate.
///
/// Cloneable: a pipe completion error is handed to every subsequent read or
/// flush on that pipe.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Configuration error.
    ///
    /// Returned when transport options are invalid or cannot be parsed.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration error.
        message: String,
    },

    // ========================================================================
    // Peer Abort Errors
    // ========================================================================
    /// The peer aborted the connection.
    #[error("Connection reset by peer (error code {code})")]
    ConnectionReset {
        /// Application error code sent by the peer.
        code: u64,
    },

    /// The peer aborted the stream.
    #[error("Stream reset by peer (error code {code})")]
    StreamReset {
        /// Application error code sent by the peer.
        code: u64,
    },

    // ========================================================================
    // Local Abort Errors
    // ========================================================================
    /// The application aborted the connection or stream.
    ///
    /// Carries the reason handed to `abort`.
    #[error("Aborted: {message}")]
    Aborted {
        /// Reason given by the aborting party.
        message: String,
    },

    // ========================================================================
    // Lifecycle
    // ========================================================================
    /// The connection is closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// The send loop finished without error.
    ///
    /// Recorded as the shutdown reason of a stream whose writes completed
    /// gracefully. Input that arrives after that point fails with it.
    #[error("The send loop completed gracefully")]
    SendCompleted,

    /// An operation was attempted in a state that does not allow it.
    #[error("Invalid state: {message}")]
    InvalidState {
        /// Description of the violated precondition.
        message: String,
    },

    // ========================================================================
    // External Errors
    // ========================================================================
    /// Unexpected raw transport error.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

// ============================================================================
// Error Constructors
// ============================================================================

impl Error {
    /// Creates a configuration error.
    #[inline]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates a local abort error.
    #[inline]
    pub fn aborted(message: impl Into<String>) -> Self {
        Self::Aborted {
            message: message.into(),
        }
    }

    /// Creates an invalid state error.
    #[inline]
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    /// Creates a connection reset error.
    #[inline]
    pub fn connection_reset(code: u64) -> Self {
        Self::ConnectionReset { code }
    }

    /// Creates a stream reset error.
    #[inline]
    pub fn stream_reset(code: u64) -> Self {
        Self::StreamReset { code }
    }
}

// ============================================================================
// Error Predicates
// ============================================================================

impl Error {
    /// Returns `true` if the peer aborted the connection or stream.
    #[inline]
    #[must_use]
    pub fn is_reset(&self) -> bool {
        matches!(
            self,
            Self::ConnectionReset { .. } | Self::StreamReset { .. }
        )
    }

    /// Returns `true` if this is a local abort.
    #[inline]
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted { .. })
    }

    /// Returns `true` if this error ends the connection.
    #[inline]
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::ConnectionReset { .. } | Self::ConnectionClosed | Self::Aborted { .. }
        )
    }

    /// Returns the peer's application error code, if any.
    #[inline]
    #[must_use]
    pub fn error_code(&self) -> Option<u64> {
        match self {
            Self::ConnectionReset { code } | Self::StreamReset { code } => Some(*code),
            _ => None,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
