//! Connection listener.
//!
//! # Example
//!
//! ```ignore
//! let listener = Listener::builder()
//!     .options(TransportOptions::default())
//!     .bind(raw_listener)?;
//!
//! while let Some(connection) = listener.accept().await? {
//!     tokio::spawn(serve(connection));
//! }
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::marker::PhantomData;
use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{debug, info};

use crate::clock::Clock;
use crate::error::{Error, Result, TransportError};
use crate::heartbeat::{Heartbeat, HeartbeatSource};
use crate::options::TransportOptions;
use crate::raw::{RawConnection, RawListener};

use super::connection::Connection;
use super::context::TransportContext;

// ============================================================================
// HeartbeatChoice
// ============================================================================

/// Where pool expiration ticks come from.
#[derive(Default)]
enum HeartbeatChoice {
    /// Start a [`Heartbeat`] at the configured interval.
    #[default]
    Bundled,
    /// Use a caller-supplied source.
    External(Arc<dyn HeartbeatSource>),
    /// No expiration; pooled streams live until their connection is disposed.
    Disabled,
}

// ============================================================================
// ListenerBuilder
// ============================================================================

/// Builder for a [`Listener`].
///
/// Use [`Listener::builder()`] to create a new builder.
pub struct ListenerBuilder<L> {
    options: TransportOptions,
    clock: Option<Arc<dyn Clock>>,
    heartbeat: HeartbeatChoice,
    _listener: PhantomData<fn() -> L>,
}

impl<L> Default for ListenerBuilder<L> {
    fn default() -> Self {
        Self {
            options: TransportOptions::default(),
            clock: None,
            heartbeat: HeartbeatChoice::default(),
            _listener: PhantomData,
        }
    }
}

impl<L: RawListener> ListenerBuilder<L> {
    /// Creates a builder with default options and a bundled heartbeat.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the transport options.
    #[inline]
    #[must_use]
    pub fn options(mut self, options: TransportOptions) -> Self {
        self.options = options;
        self
    }

    /// Sets the tick source used for pool expiration.
    #[inline]
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Uses an external heartbeat instead of starting one.
    #[inline]
    #[must_use]
    pub fn heartbeat(mut self, heartbeat: Arc<dyn HeartbeatSource>) -> Self {
        self.heartbeat = HeartbeatChoice::External(heartbeat);
        self
    }

    /// Disables pool expiration.
    #[inline]
    #[must_use]
    pub fn without_heartbeat(mut self) -> Self {
        self.heartbeat = HeartbeatChoice::Disabled;
        self
    }

    /// Wraps a bound raw listener.
    ///
    /// Starts the bundled heartbeat unless another choice was made, so this
    /// must be called within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the options are invalid.
    pub fn bind(self, raw: L) -> Result<Listener<L>> {
        self.options.validate()?;

        let mut context = TransportContext::new(self.options);
        if let Some(clock) = self.clock {
            context = context.with_clock(clock);
        }

        let owned_heartbeat = match self.heartbeat {
            HeartbeatChoice::Bundled => {
                let heartbeat = Heartbeat::start(context.options().heartbeat_interval());
                context = context.with_heartbeat(heartbeat.clone());
                Some(heartbeat)
            }
            HeartbeatChoice::External(heartbeat) => {
                context = context.with_heartbeat(heartbeat);
                None
            }
            HeartbeatChoice::Disabled => None,
        };

        let local_addr = raw.local_addr();
        info!(%local_addr, "Listener bound");

        Ok(Listener {
            raw,
            context: Arc::new(context),
            owned_heartbeat,
            local_addr,
        })
    }
}

impl<L> fmt::Debug for ListenerBuilder<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let heartbeat = match self.heartbeat {
            HeartbeatChoice::Bundled => "bundled",
            HeartbeatChoice::External(_) => "external",
            HeartbeatChoice::Disabled => "disabled",
        };
        f.debug_struct("ListenerBuilder")
            .field("options", &self.options)
            .field("clock", &self.clock.is_some())
            .field("heartbeat", &heartbeat)
            .finish()
    }
}

// ============================================================================
// Listener
// ============================================================================

/// Accepts connections from a raw listener.
pub struct Listener<L: RawListener> {
    raw: L,
    context: Arc<TransportContext>,
    /// Heartbeat started by the builder, stopped on unbind.
    owned_heartbeat: Option<Arc<Heartbeat>>,
    local_addr: SocketAddr,
}

impl<L: RawListener> Listener<L> {
    /// Creates a new listener builder.
    #[inline]
    #[must_use]
    pub fn builder() -> ListenerBuilder<L> {
        ListenerBuilder::new()
    }

    /// Waits for the next connection.
    ///
    /// Returns `Ok(None)` once the listener is unbound.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transport`] if the raw listener fails.
    pub async fn accept(&self) -> Result<Option<Connection<L::Connection>>> {
        match self.raw.accept().await {
            Ok(raw) => {
                let connection = Connection::new(raw, Arc::clone(&self.context));
                debug!(
                    connection_id = %connection.id(),
                    remote_addr = %connection.raw().remote_addr(),
                    "Accepted connection"
                );
                Ok(Some(connection))
            }
            Err(TransportError::OperationAborted) => {
                debug!(local_addr = %self.local_addr, "Listener stopped accepting");
                Ok(None)
            }
            Err(e) => Err(Error::Transport(e)),
        }
    }

    /// Stops accepting connections and stops the bundled heartbeat.
    pub async fn unbind(&self) {
        self.raw.close().await;
        if let Some(heartbeat) = &self.owned_heartbeat {
            heartbeat.stop();
        }
        info!(local_addr = %self.local_addr, "Listener unbound");
    }

    /// Returns the bound address.
    #[inline]
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Returns the context shared with accepted connections.
    #[inline]
    #[must_use]
    pub fn context(&self) -> &Arc<TransportContext> {
        &self.context
    }
}

impl<L: RawListener> Drop for Listener<L> {
    fn drop(&mut self) {
        if let Some(heartbeat) = &self.owned_heartbeat {
            heartbeat.stop();
        }
    }
}

impl<L: RawListener> fmt::Debug for Listener<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("local_addr", &self.local_addr)
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Tests
// ============================================================================
