//! Raw multiplexed transport primitives.
//!
//! The adapter consumes a connectionless, encrypted, stream-multiplexing
//! transport through these traits. Frame encoding, congestion control and
//! the TLS handshake live behind them.
//!
//! # Traits
//!
//! | Trait | Role |
//! |-------|------|
//! | [`RawListener`] | Accepts incoming connections |
//! | [`RawConnection`] | Accepts and opens streams, closes with an error code |
//! | [`RawStream`] | Reads, writes, aborts and shuts down one stream |
//!
//! All operations report failures as [`TransportError`]. Implementations
//! must use [`TransportError::OperationAborted`] for operations interrupted
//! by a local abort or close, and the `*Aborted { code }` variants for
//! aborts initiated by the peer.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `memory` | In-process loopback transport |

// ============================================================================
// Imports
// ============================================================================

use std::net::SocketAddr;

use async_trait::async_trait;

use crate::error::TransportError;
use crate::identifiers::StreamId;

// ============================================================================
// Submodules
// ============================================================================

/// In-process loopback transport.
pub mod memory;

// ============================================================================
// Types
// ============================================================================

/// Result of a raw transport operation.
pub type TransportResult<T> = Result<T, TransportError>;

// ============================================================================
// RawListener
// ============================================================================

/// Accepts incoming raw connections.
#[async_trait]
pub trait RawListener: Send + Sync + 'static {
    /// Connection type produced by this listener.
    type Connection: RawConnection;

    /// Waits for the next connection.
    ///
    /// Returns [`TransportError::OperationAborted`] once the listener is
    /// closed.
    async fn accept(&self) -> TransportResult<Self::Connection>;

    /// Returns the bound address.
    fn local_addr(&self) -> SocketAddr;

    /// Stops accepting. Pending and future accepts fail with
    /// [`TransportError::OperationAborted`].
    async fn close(&self);
}

// ============================================================================
// RawConnection
// ============================================================================

/// One multiplexed connection.
#[async_trait]
pub trait RawConnection: Send + Sync + 'static {
    /// Stream type carried by this connection.
    type Stream: RawStream;

    /// Waits for the peer to open a stream.
    async fn accept_stream(&self) -> TransportResult<Self::Stream>;

    /// Opens an outbound stream.
    async fn open_stream(&self, bidirectional: bool) -> TransportResult<Self::Stream>;

    /// Closes the connection with an application error code.
    async fn close(&self, error_code: u64) -> TransportResult<()>;

    /// Releases the connection's resources. Called once, after close.
    async fn release(&self);

    /// Returns the peer address.
    fn remote_addr(&self) -> SocketAddr;

    /// Returns the local address.
    fn local_addr(&self) -> SocketAddr;

    /// Returns the application protocol negotiated during the handshake.
    fn negotiated_protocol(&self) -> Option<Vec<u8>>;
}

// ============================================================================
// RawStream
// ============================================================================

/// One stream of a [`RawConnection`].
///
/// Reads and writes may run concurrently from different tasks.
#[async_trait]
pub trait RawStream: Send + Sync + 'static {
    /// Returns the transport-assigned stream ID.
    fn id(&self) -> StreamId;

    /// Returns `true` if data can be received on this stream.
    fn can_read(&self) -> bool;

    /// Returns `true` if data can be sent on this stream.
    fn can_write(&self) -> bool;

    /// Returns `true` once the peer's final byte has been read.
    ///
    /// Lets the receive pump deliver the last chunk together with
    /// end-of-stream. Transports that cannot tell return `false`.
    fn reads_completed(&self) -> bool {
        false
    }

    /// Reads into `buf`. Returns `0` at the clean end of the stream.
    async fn read(&self, buf: &mut [u8]) -> TransportResult<usize>;

    /// Writes all of `data`, optionally marking the end of the stream.
    async fn write(&self, data: &[u8], end_stream: bool) -> TransportResult<()>;

    /// Aborts the receiving direction with an application error code.
    fn abort_read(&self, error_code: u64);

    /// Aborts the sending direction with an application error code.
    fn abort_write(&self, error_code: u64);

    /// Gracefully finishes the sending direction.
    async fn shutdown(&self) -> TransportResult<()>;
}
