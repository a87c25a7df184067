//! Transport adapter: listener, connections, streams and stream pooling.
//!
//! Adapts a raw multiplexed transport ([`crate::raw`]) into buffered duplex
//! streams with backpressure, abort handling and stream reuse.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────┐ accept ┌────────────┐ accept_stream ┌────────┐  input()  ┌─────────────┐
//! │ Listener │───────►│ Connection │──────────────►│ Stream │◄─────────►│ Application │
//! └──────────┘        │  + pool    │◄──────────────│ pumps  │  output() └─────────────┘
//!                     └────────────┘    dispose    └────────┘
//!                           ▲
//!                 heartbeat │ remove_expired
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `listener` | Listener and its builder |
//! | `connection` | Connection: accept, connect, abort, dispose |
//! | `stream` | Stream: pumps, abort, dispose, reuse |
//! | `pool` | Expiring LIFO stream pool |
//! | `features` | Capability traits and `StateBag` |
//! | `context` | Options, clock and heartbeat shared by connections |

// ============================================================================
// Submodules
// ============================================================================

/// Options, clock and heartbeat shared by connections.
pub mod context;

/// Multiplexed connection and its stream pool.
pub mod connection;

/// Capability traits.
pub mod features;

/// Connection listener.
pub mod listener;

/// Expiring LIFO stream pool.
pub mod pool;

/// Buffered duplex stream.
pub mod stream;

// ============================================================================
// Re-exports
// ============================================================================

pub use connection::Connection;
pub use context::TransportContext;
pub use features::{
    ClosedCallback, DuplexTransport, PersistentState, ProtocolErrorCode, StateBag, StreamAbort,
    StreamClosed, StreamDirection, StreamDirectionHint, StreamIdentity,
};
pub use listener::{Listener, ListenerBuilder};
pub use pool::{Expiring, StreamPool};
pub use stream::Stream;
