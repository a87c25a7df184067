//! streamplex - Buffered, reusable duplex streams over multiplexed transports.
//!
//! This library adapts a raw stream-multiplexing transport (QUIC-style:
//! many independent byte streams per connection) into buffered duplex
//! streams with backpressure, abort semantics and stream object reuse.
//!
//! # Architecture
//!
//! - **Raw layer** ([`raw`]): traits for listeners, connections and streams.
//!   Frame encoding, congestion control and TLS live behind them.
//! - **Transport layer** ([`transport`]): a [`Listener`] yields
//!   [`Connection`]s; each accepted or opened stream becomes a [`Stream`]
//!   with two pump tasks moving bytes between the raw stream and two
//!   bounded [`Pipe`]s.
//!
//! Key design principles:
//!
//! - Each raw stream is owned by exactly one [`Stream`] at a time
//! - Cleanly finished bidirectional streams are pooled per connection and
//!   expired by a periodic heartbeat
//! - Peer aborts surface as reset errors through the pipes, never as panics
//!   in the pumps
//!
//! # Quick Start
//!
//! ```no_run
//! use std::net::SocketAddr;
//!
//! use streamplex::raw::memory::MemoryListener;
//! use streamplex::{Listener, Result, TransportOptions};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let addr: SocketAddr = "127.0.0.1:4433".parse().expect("address");
//!     let (raw, _connector) = MemoryListener::bind(addr, Some(b"h3"));
//!
//!     let listener = Listener::builder()
//!         .options(TransportOptions::default())
//!         .bind(raw)?;
//!
//!     while let Some(connection) = listener.accept().await? {
//!         let cancel = CancellationToken::new();
//!         while let Some(stream) = connection.accept_stream(&cancel).await? {
//!             let request = stream.input().read().await?;
//!             stream.input().advance(request.buffer.len());
//!             stream.output().write_all(b"ok").await?;
//!             stream.dispose().await;
//!         }
//!         connection.dispose().await;
//!     }
//!
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`clock`] | Tick sources for pool expiration |
//! | [`error`] | Error types and [`Result`] alias |
//! | [`heartbeat`] | Periodic heartbeat driving pool expiration |
//! | [`identifiers`] | Connection and stream IDs |
//! | [`options`] | [`TransportOptions`] configuration |
//! | [`pipe`] | Bounded byte pipe with backpressure |
//! | [`raw`] | Raw transport traits and the in-memory transport |
//! | [`transport`] | Listener, connection, stream and pool |

// ============================================================================
// Modules
// ============================================================================

/// Tick sources for pool expiration bookkeeping.
pub mod clock;

/// Error types and result aliases.
///
/// All fallible operations return [`Result<T>`] which uses [`Error`].
pub mod error;

/// Periodic heartbeat driving pool expiration.
pub mod heartbeat;

/// Type-safe identifiers for connections and streams.
pub mod identifiers;

/// Transport configuration.
pub mod options;

/// Bounded in-memory byte pipe with backpressure.
pub mod pipe;

/// Raw multiplexed transport primitives.
///
/// Implement these traits to plug a transport into the adapter.
pub mod raw;

/// Listener, connections, streams and stream pooling.
pub mod transport;

// ============================================================================
// Re-exports
// ============================================================================

// Clock and heartbeat
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use heartbeat::{Heartbeat, HeartbeatSource};

// Error types
pub use error::{Error, Result, TransportError};

// Identifier types
pub use identifiers::{ConnectionId, StreamId};

// Configuration
pub use options::TransportOptions;

// Pipes
pub use pipe::{FlushResult, Pipe, PipeReader, PipeWriter, ReadResult};

// Transport types
pub use transport::{
    Connection, DuplexTransport, Listener, ListenerBuilder, PersistentState, ProtocolErrorCode,
    StateBag, Stream, StreamAbort, StreamClosed, StreamDirection, StreamDirectionHint,
    StreamIdentity, TransportContext,
};
