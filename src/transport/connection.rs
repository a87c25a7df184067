//! Multiplexed connection and its stream pool.
//!
//! A [`Connection`] accepts inbound streams (reusing pooled [`Stream`]
//! objects where possible), opens outbound streams, and manages the
//! connection-level abort and close.
//!
//! # Stream Reuse
//!
//! ```text
//!  accept_stream ──► pool.try_pop() ──hit──► initialize ─► start ─► application
//!                        │ miss                                        │
//!                        └──► Stream::new                              ▼
//!  heartbeat ──► remove_expired(now)        pool ◄── try_return_stream ◄── dispose
//! ```
//!
//! Only bidirectional inbound streams are pooled. Outbound streams are few
//! and live as long as the connection.
//!
//! # Abort and Close
//!
//! `abort` records the first reason and starts the raw close in the
//! background. `dispose` starts the close if needed, waits for it, releases
//! pooled streams and finally the raw connection.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::error::{Error, Result, TransportError};
use crate::heartbeat::HeartbeatRegistration;
use crate::identifiers::ConnectionId;
use crate::raw::{RawConnection, RawStream};

use super::context::TransportContext;
use super::features::{DuplexTransport, ProtocolErrorCode, StreamDirectionHint};
use super::pool::{Expiring, StreamPool};
use super::stream::Stream;

// ============================================================================
// Types
// ============================================================================

/// Memoized raw close, awaitable from any number of callers.
type CloseFuture = Shared<BoxFuture<'static, std::result::Result<(), TransportError>>>;

/// Abort and close bookkeeping.
#[derive(Default)]
struct ShutdownState {
    /// Code observed from the peer or set by the protocol layer.
    error_code: Option<u64>,
    /// First local abort reason.
    abort_reason: Option<Error>,
    /// Raw close, started at most once.
    close: Option<CloseFuture>,
}

/// Pool and heartbeat registration, guarded by one lock.
struct PoolState<C: RawConnection> {
    streams: StreamPool<Stream<C>>,
    heartbeat_initialized: bool,
    registration: Option<HeartbeatRegistration>,
}

// ============================================================================
// ConnectionInner
// ============================================================================

/// State shared by connection handles, pooled streams and the heartbeat.
pub(crate) struct ConnectionInner<C: RawConnection> {
    id: ConnectionId,
    raw: Arc<C>,
    context: Arc<TransportContext>,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    closed: CancellationToken,
    shutdown: Mutex<ShutdownState>,
    pool: Mutex<PoolState<C>>,
    /// Last heartbeat time, used to stamp pooled streams.
    heartbeat_ticks: AtomicU64,
    disposed: AtomicBool,
}

impl<C: RawConnection> ConnectionInner<C> {
    #[inline]
    pub(crate) fn id(&self) -> ConnectionId {
        self.id
    }

    #[inline]
    pub(crate) fn context(&self) -> &TransportContext {
        &self.context
    }

    #[inline]
    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    #[inline]
    pub(crate) fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Offers a disposed stream to the pool.
    ///
    /// Registers the heartbeat callback on first use. Hands the stream back
    /// if it is not reusable, the pool is full, or the connection is gone.
    pub(crate) fn try_return_stream(
        self: &Arc<Self>,
        mut stream: Stream<C>,
    ) -> std::result::Result<(), Stream<C>> {
        let mut pool = self.pool.lock();

        if !pool.heartbeat_initialized {
            if let Some(heartbeat) = self.context.heartbeat() {
                let weak = Arc::downgrade(self);
                pool.registration = Some(heartbeat.on_heartbeat(Arc::new(move || {
                    if let Some(inner) = weak.upgrade() {
                        inner.remove_expired_streams();
                    }
                })));
            }
            self.heartbeat_ticks
                .store(self.context.clock().now_ticks(), Ordering::Release);
            pool.heartbeat_initialized = true;
        }

        if !stream.is_reusable() || self.disposed.load(Ordering::Acquire) {
            return Err(stream);
        }

        let expires = self.heartbeat_ticks.load(Ordering::Acquire)
            + self.context.stream_pool_expiry_ticks();
        stream.set_pool_expiration_tick(expires);

        let max = self.context.options().max_stream_pool_size;
        pool.streams.push_within(stream, max)?;

        trace!(connection_id = %self.id, pooled = pool.streams.count(), "Stream returned to pool");
        Ok(())
    }

    /// Heartbeat callback: refreshes the tick and sweeps the pool.
    fn remove_expired_streams(&self) {
        let mut pool = self.pool.lock();
        let now = self.context.clock().now_ticks();
        self.heartbeat_ticks.store(now, Ordering::Release);

        let removed = pool.streams.remove_expired(now);
        if removed > 0 {
            trace!(connection_id = %self.id, removed, "Expired pooled streams released");
        }
    }

    fn start_close(&self, error_code: u64) -> CloseFuture {
        let raw = Arc::clone(&self.raw);
        let task = tokio::spawn(async move { raw.close(error_code).await });

        async move {
            task.await
                .unwrap_or_else(|e| Err(TransportError::other(e.to_string())))
        }
        .boxed()
        .shared()
    }

    fn abort_reason(&self) -> Option<Error> {
        self.shutdown.lock().abort_reason.clone()
    }

    fn translate_error(&self, error: TransportError) -> Error {
        match error {
            TransportError::ConnectionAborted { code } => Error::connection_reset(code),
            TransportError::OperationAborted => {
                self.abort_reason().unwrap_or(Error::ConnectionClosed)
            }
            other => Error::Transport(other),
        }
    }
}

impl<C: RawConnection> Drop for ConnectionInner<C> {
    fn drop(&mut self) {
        // Connections dropped without `dispose` still leave the heartbeat.
        let registration = self.pool.get_mut().registration.take();
        if let (Some(registration), Some(heartbeat)) = (registration, self.context.heartbeat()) {
            heartbeat.remove(registration);
            trace!(connection_id = %self.id, "Heartbeat callback removed on drop");
        }
    }
}

// ============================================================================
// Connection
// ============================================================================

/// A multiplexed connection.
///
/// Cheap to clone; all clones share the same connection.
///
/// # Example
///
/// ```ignore
/// let cancel = CancellationToken::new();
/// while let Some(stream) = connection.accept_stream(&cancel).await? {
///     tokio::spawn(handle(stream));
/// }
/// connection.dispose().await;
/// ```
pub struct Connection<C: RawConnection> {
    inner: Arc<ConnectionInner<C>>,
}

impl<C: RawConnection> Clone for Connection<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: RawConnection> Connection<C> {
    /// Wraps a raw connection.
    #[must_use]
    pub fn new(raw: C, context: Arc<TransportContext>) -> Self {
        let capacity = context.options().initial_stream_pool_capacity;
        let local_addr = raw.local_addr();
        let remote_addr = raw.remote_addr();

        Self {
            inner: Arc::new(ConnectionInner {
                id: ConnectionId::new(),
                raw: Arc::new(raw),
                context,
                local_addr,
                remote_addr,
                closed: CancellationToken::new(),
                shutdown: Mutex::new(ShutdownState::default()),
                pool: Mutex::new(PoolState {
                    streams: StreamPool::new(capacity),
                    heartbeat_initialized: false,
                    registration: None,
                }),
                heartbeat_ticks: AtomicU64::new(0),
                disposed: AtomicBool::new(false),
            }),
        }
    }

    // ========================================================================
    // Streams
    // ========================================================================

    /// Waits for the peer to open a stream.
    ///
    /// Returns `Ok(None)` if `cancel` fires while no abort is in progress.
    ///
    /// # Errors
    ///
    /// - [`Error::ConnectionReset`] if the peer closed the connection
    /// - The local abort reason if the connection was aborted
    /// - [`Error::Transport`] for any other transport failure
    pub async fn accept_stream(&self, cancel: &CancellationToken) -> Result<Option<Stream<C>>> {
        let inner = &self.inner;

        let accepted = tokio::select! {
            result = inner.raw.accept_stream() => result,
            () = cancel.cancelled() => {
                return match inner.abort_reason() {
                    Some(reason) => Err(reason),
                    None => Ok(None),
                };
            }
        };

        match accepted {
            Ok(raw) => {
                let bidirectional = raw.can_read() && raw.can_write();
                let pooled = if bidirectional {
                    inner.pool.lock().streams.try_pop()
                } else {
                    None
                };
                let reused = pooled.is_some();

                let mut stream = match pooled {
                    Some(mut stream) => {
                        stream.reset_features();
                        stream
                    }
                    None => Stream::new(inner),
                };
                stream.initialize(raw)?;
                stream.start();

                debug!(
                    connection_id = %inner.id,
                    stream = %stream.display_id(),
                    reused,
                    "Accepted stream"
                );
                Ok(Some(stream))
            }

            Err(TransportError::ConnectionAborted { code }) => {
                inner.shutdown.lock().error_code = Some(code);
                info!(connection_id = %inner.id, error_code = code, "Connection aborted by peer");
                inner.closed.cancel();
                Err(Error::connection_reset(code))
            }

            Err(TransportError::OperationAborted) => {
                if inner.abort_reason().is_none() {
                    self.abort(Error::aborted("Unexpected error when accepting stream"));
                }
                Err(inner.abort_reason().unwrap_or(Error::ConnectionClosed))
            }

            Err(e) => {
                error!(connection_id = %inner.id, error = %e, "Unexpected error accepting stream");
                debug_assert!(false, "unexpected transport error accepting a stream: {e}");
                Err(Error::Transport(e))
            }
        }
    }

    /// Opens an outbound stream.
    ///
    /// `None` opens a bidirectional stream. A hint that does not need reading
    /// opens a unidirectional one. Outbound streams are never pooled.
    ///
    /// # Errors
    ///
    /// - [`Error::ConnectionReset`] if the peer closed the connection
    /// - The local abort reason if the connection was aborted
    /// - [`Error::Transport`] for any other transport failure
    pub async fn connect(&self, hint: Option<StreamDirectionHint>) -> Result<Stream<C>> {
        let inner = &self.inner;
        let bidirectional = hint.is_none_or(|hint| hint.can_read);

        let raw = inner
            .raw
            .open_stream(bidirectional)
            .await
            .map_err(|e| inner.translate_error(e))?;

        let mut stream = Stream::new(inner);
        stream.initialize(raw)?;
        stream.start();

        debug!(
            connection_id = %inner.id,
            stream = %stream.display_id(),
            bidirectional,
            "Connected stream"
        );
        Ok(stream)
    }

    // ========================================================================
    // Shutdown
    // ========================================================================

    /// Aborts the connection and starts closing it in the background.
    ///
    /// Closes with the observed or configured error code. Only the first call
    /// has an effect.
    pub fn abort(&self, reason: Error) {
        let inner = &self.inner;
        let mut shutdown = inner.shutdown.lock();
        if shutdown.abort_reason.is_some() {
            return;
        }

        let error_code = shutdown
            .error_code
            .unwrap_or(inner.context.options().default_close_error_code);
        info!(connection_id = %inner.id, error_code, reason = %reason, "Connection aborting");

        shutdown.abort_reason = Some(reason);
        if shutdown.close.is_none() {
            shutdown.close = Some(inner.start_close(error_code));
        }
    }

    /// Closes the connection and releases its resources.
    ///
    /// Close failures are logged, not returned. Pooled streams are released.
    /// Later calls have no effect.
    pub async fn dispose(&self) {
        let inner = &self.inner;
        if inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }

        let close = {
            let mut shutdown = inner.shutdown.lock();
            let error_code = shutdown
                .error_code
                .unwrap_or(inner.context.options().default_close_error_code);
            shutdown
                .close
                .get_or_insert_with(|| inner.start_close(error_code))
                .clone()
        };

        if let Err(e) = close.await {
            warn!(connection_id = %inner.id, error = %e, "Failed to gracefully shutdown connection");
        }

        let pooled = {
            let mut pool = inner.pool.lock();
            if let (Some(registration), Some(heartbeat)) =
                (pool.registration.take(), inner.context.heartbeat())
            {
                heartbeat.remove(registration);
            }
            pool.streams.drain()
        };
        let released = pooled.len();
        for stream in pooled {
            stream.release();
        }

        inner.raw.release().await;
        inner.closed.cancel();

        debug!(connection_id = %inner.id, released, "Connection disposed");
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Returns the connection ID.
    #[inline]
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    /// Returns the application protocol negotiated during the handshake.
    #[must_use]
    pub fn negotiated_protocol(&self) -> Option<Vec<u8>> {
        self.inner.raw.negotiated_protocol()
    }

    /// Returns a token cancelled when the connection closes.
    #[must_use]
    pub fn closed_token(&self) -> CancellationToken {
        self.inner.closed.clone()
    }

    /// Returns the local abort reason, if the connection was aborted.
    #[must_use]
    pub fn abort_reason(&self) -> Option<Error> {
        self.inner.abort_reason()
    }

    /// Returns the number of pooled streams.
    #[must_use]
    pub fn pooled_stream_count(&self) -> usize {
        self.inner.pool.lock().streams.count()
    }

    /// Returns the raw connection.
    #[inline]
    #[must_use]
    pub fn raw(&self) -> &C {
        &self.inner.raw
    }

    /// Returns the shared transport context.
    #[inline]
    #[must_use]
    pub fn context(&self) -> &Arc<TransportContext> {
        &self.inner.context
    }
}

impl<C: RawConnection> fmt::Debug for Connection<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("local_addr", &self.inner.local_addr)
            .field("remote_addr", &self.inner.remote_addr)
            .field("aborted", &self.abort_reason().is_some())
            .finish()
    }
}

// ============================================================================
// Features
// ============================================================================

impl<C: RawConnection> DuplexTransport for Connection<C> {
    fn connection_id(&self) -> String {
        self.inner.id.to_string()
    }

    fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    fn remote_addr(&self) -> SocketAddr {
        self.inner.remote_addr
    }

    fn closed_token(&self) -> CancellationToken {
        Connection::closed_token(self)
    }

    fn abort(&self, reason: Error) {
        Connection::abort(self, reason);
    }
}

impl<C: RawConnection> ProtocolErrorCode for Connection<C> {
    fn error_code(&self) -> Option<u64> {
        self.inner.shutdown.lock().error_code
    }

    fn set_error_code(&self, code: u64) {
        self.inner.shutdown.lock().error_code = Some(code);
    }
}

// ============================================================================
// Tests
// ============================================================================
