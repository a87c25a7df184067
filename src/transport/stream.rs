//! Buffered duplex stream over one raw stream.
//!
//! A [`Stream`] couples a raw stream with two [`Pipe`]s and two pump tasks:
//!
//! ```text
//!            ┌──────────── receive pump ────────────┐
//!  raw.read ─┤ read ≤ min_alloc ─► input.write ─► flush (pause/resume)
//!            └──────────────────────────────────────┘─► input()  (application)
//!
//!  output()  (application) ─┐
//!            ┌──────────── send pump ───────────────┐
//!            │ output.read ─► raw.write(end_stream) ├─► raw.shutdown
//!            └──────────────────────────────────────┘
//! ```
//!
//! # Lifecycle
//!
//! `initialize` binds a raw stream, `start` spawns the pumps, `dispose` waits
//! for them and hands the object back to its connection's pool when both
//! directions finished cleanly. A pooled object is re-initialized for a later
//! stream; its pipes are reset and its per-use state is cleared.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::Poll;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result, TransportError};
use crate::identifiers::{ConnectionId, StreamId};
use crate::pipe::{Pipe, PipeReader, PipeWriter};
use crate::raw::{RawConnection, RawStream};

use super::connection::ConnectionInner;
use super::features::{
    ClosedCallback, DuplexTransport, PersistentState, ProtocolErrorCode, StateBag, StreamAbort,
    StreamClosed, StreamDirection, StreamIdentity,
};
use super::pool::Expiring;

// ============================================================================
// Constants
// ============================================================================

/// Source of per-object instance IDs.
static NEXT_INSTANCE_ID: AtomicU64 = AtomicU64::new(1);

// ============================================================================
// StreamState
// ============================================================================

/// Per-use state, guarded by the stream's shutdown lock.
struct StreamState<S> {
    /// Owned raw stream. Pumps hold clones only while running.
    raw: Option<Arc<S>>,
    stream_id: StreamId,
    can_read: bool,
    can_write: bool,
    /// Code observed from the peer or set by the protocol layer.
    error_code: Option<u64>,
    shutdown_read_reason: Option<Error>,
    shutdown_write_reason: Option<Error>,
    shutdown_reason: Option<Error>,
    peer_aborted: bool,
    locally_aborted: bool,
    unexpected_error: bool,
    /// Receive pump saw the raw end of stream.
    read_clean: bool,
    /// Send pump wrote the end of stream and shut down successfully.
    write_clean: bool,
    /// Computed by `dispose`.
    reusable: bool,
    closed: bool,
    closed_token: CancellationToken,
    closed_callbacks: Vec<ClosedCallback>,
}

impl<S> StreamState<S> {
    fn new() -> Self {
        Self {
            raw: None,
            stream_id: StreamId::new(0),
            can_read: false,
            can_write: false,
            error_code: None,
            shutdown_read_reason: None,
            shutdown_write_reason: None,
            shutdown_reason: None,
            peer_aborted: false,
            locally_aborted: false,
            unexpected_error: false,
            read_clean: false,
            write_clean: false,
            reusable: false,
            closed: false,
            closed_token: CancellationToken::new(),
            closed_callbacks: Vec::new(),
        }
    }

    fn is_reusable(&self) -> bool {
        self.can_read
            && self.can_write
            && self.read_clean
            && self.write_clean
            && !self.peer_aborted
            && !self.locally_aborted
            && !self.unexpected_error
    }
}

// ============================================================================
// StreamShared
// ============================================================================

/// State shared between a [`Stream`] and its pump tasks.
struct StreamShared<S> {
    /// Receive pump → application.
    input: Pipe,
    /// Application → send pump.
    output: Pipe,
    state: Mutex<StreamState<S>>,
    min_alloc_buffer_size: usize,
    default_error_code: u64,
}

impl<S: RawStream> StreamShared<S> {
    // ========================================================================
    // Receive Pump
    // ========================================================================

    async fn receive_loop(self: Arc<Self>, raw: Arc<S>, display_id: String) {
        let writer = self.input.writer();

        let error = match self.receive_data(&raw, &writer, &display_id).await {
            Ok(()) => None,
            Err(error) => Some(self.classify_pump_error(error, "receive", &display_id)),
        };

        writer.complete(self.resolve_receive_completion(error));

        self.fire_closed(&display_id).await;
    }

    async fn receive_data(&self, raw: &S, writer: &PipeWriter, display_id: &str) -> Result<()> {
        let mut buffer = vec![0u8; self.min_alloc_buffer_size.max(1)];

        loop {
            let read = raw.read(&mut buffer).await?;
            if read == 0 {
                self.state.lock().read_clean = true;
                trace!(stream = display_id, "Stream read side completed");
                return Ok(());
            }

            writer.write(&buffer[..read])?;

            // Deliver the final chunk together with end of stream.
            if raw.reads_completed() {
                self.state.lock().read_clean = true;
                trace!(stream = display_id, "Stream read side completed");
                return Ok(());
            }

            let flush = writer.flush();
            tokio::pin!(flush);
            let flushed = match futures_util::poll!(flush.as_mut()) {
                Poll::Ready(result) => result,
                Poll::Pending => {
                    trace!(stream = display_id, "Stream paused");
                    let result = flush.await;
                    trace!(stream = display_id, "Stream resumed");
                    result
                }
            };

            match flushed {
                Ok(result) if !result.is_completed && !result.is_canceled => {}
                _ => return Ok(()),
            }
        }
    }

    /// Explicit read shutdown reason, else the general shutdown reason, else
    /// the loop's own error.
    ///
    /// Once the send pump has finished, the general reason is set (at least
    /// [`Error::SendCompleted`]), so input cut short by the send side never
    /// completes cleanly.
    fn resolve_receive_completion(&self, error: Option<Error>) -> Option<Error> {
        let state = self.state.lock();
        state
            .shutdown_read_reason
            .clone()
            .or_else(|| state.shutdown_reason.clone())
            .or(error)
    }

    // ========================================================================
    // Send Pump
    // ========================================================================

    async fn send_loop(self: Arc<Self>, raw: Arc<S>, display_id: String) {
        let reader = self.output.reader();

        let (completed, error) = match self.send_data(&raw, &reader).await {
            Ok(completed) => (completed, None),
            Err(error) => (false, Some(self.classify_pump_error(error, "send", &display_id))),
        };

        let reason = self.record_write_shutdown(error);
        let graceful = reason == Error::SendCompleted;
        debug!(stream = %display_id, reason = %reason, "Stream shutdown write");

        match raw.shutdown().await {
            Ok(()) => {
                if completed && graceful {
                    self.state.lock().write_clean = true;
                }
            }
            Err(e) if graceful => {
                warn!(stream = %display_id, error = %e, "Stream failed to gracefully shutdown");
            }
            Err(e) => {
                trace!(stream = %display_id, error = %e, "Stream shutdown after failure");
            }
        }

        reader.complete((!graceful).then_some(reason));

        // Release a receive pump suspended on backpressure.
        self.input.writer().cancel_pending_flush();

        let can_read = self.state.lock().can_read;
        if !can_read {
            self.fire_closed(&display_id).await;
        }
    }

    /// Returns `true` if the application completed the output pipe.
    async fn send_data(&self, raw: &S, reader: &PipeReader) -> Result<bool> {
        loop {
            let result = reader.read().await?;
            if result.is_canceled {
                return Ok(false);
            }

            let end_stream = result.is_completed;
            if !result.buffer.is_empty() {
                raw.write(&result.buffer, end_stream).await?;
            }
            reader.advance(result.buffer.len());

            if end_stream {
                return Ok(true);
            }
        }
    }

    /// Records the write shutdown reason and returns it.
    fn record_write_shutdown(&self, error: Option<Error>) -> Error {
        let mut state = self.state.lock();
        let reason = state
            .shutdown_write_reason
            .clone()
            .or_else(|| state.shutdown_reason.clone())
            .or(error)
            .unwrap_or(Error::SendCompleted);

        if state.shutdown_reason.is_none() {
            state.shutdown_reason = Some(reason.clone());
        }
        reason
    }

    // ========================================================================
    // Shared Pump Helpers
    // ========================================================================

    fn classify_pump_error(&self, error: Error, pump: &str, display_id: &str) -> Error {
        let mut state = self.state.lock();
        match error {
            Error::Transport(TransportError::StreamAborted { code }) => {
                state.error_code = Some(code);
                state.peer_aborted = true;
                debug!(stream = display_id, pump, error_code = code, "Stream aborted by peer");
                Error::stream_reset(code)
            }
            Error::Transport(TransportError::ConnectionAborted { code }) => {
                state.error_code = Some(code);
                state.peer_aborted = true;
                debug!(stream = display_id, pump, error_code = code, "Connection aborted by peer");
                Error::connection_reset(code)
            }
            Error::Transport(TransportError::OperationAborted) => {
                trace!(stream = display_id, pump, "Stream operation aborted locally");
                Error::aborted(format!("The stream's {pump} side was aborted"))
            }
            other => {
                warn!(stream = display_id, pump, error = %other, "Unexpected error in stream pump");
                state.unexpected_error = true;
                other
            }
        }
    }

    /// Cancels the closed token and runs closed callbacks on a separate task,
    /// then waits for it. Only the first call per use has an effect.
    async fn fire_closed(&self, display_id: &str) {
        let (token, callbacks) = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            (
                state.closed_token.clone(),
                std::mem::take(&mut state.closed_callbacks),
            )
        };

        let (done_tx, done_rx) = oneshot::channel();
        tokio::spawn(async move {
            token.cancel();
            for callback in callbacks {
                callback();
            }
            let _ = done_tx.send(());
        });

        if done_rx.await.is_err() {
            warn!(stream = display_id, "Stream closed callback panicked");
        }
    }

    // ========================================================================
    // Abort
    // ========================================================================

    fn abort(&self, reason: Error, display_id: &str) {
        {
            let mut state = self.state.lock();
            let Some(raw) = state.raw.clone() else {
                return;
            };
            if state.locally_aborted {
                return;
            }
            state.locally_aborted = true;

            let error_code = state.error_code.unwrap_or(self.default_error_code);
            debug!(stream = display_id, error_code, reason = %reason, "Stream aborted");

            if state.shutdown_reason.is_none() {
                state.shutdown_reason = Some(reason);
            }
            if state.can_read {
                raw.abort_read(error_code);
            }
            if state.can_write {
                raw.abort_write(error_code);
            }
        }

        // Wake the send pump.
        self.output.reader().cancel_pending_read();
    }
}

// ============================================================================
// Stream
// ============================================================================

/// A buffered, reusable duplex stream.
///
/// The application reads from [`input`](Self::input) and writes to
/// [`output`](Self::output). Call [`dispose`](Self::dispose) when done; it is
/// the only path that returns the object to its connection's pool.
///
/// Dropping a stream without disposing it completes both application pipe
/// ends so the pumps wind down on their own; the object is not pooled.
pub struct Stream<C: RawConnection> {
    shared: Arc<StreamShared<C::Stream>>,
    connection: Weak<ConnectionInner<C>>,
    connection_id: ConnectionId,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    instance_id: u64,
    receive_task: Option<JoinHandle<()>>,
    send_task: Option<JoinHandle<()>>,
    persistent_state: StateBag,
    items: StateBag,
    pool_expiration_tick: u64,
}

impl<C: RawConnection> Stream<C> {
    /// Allocates an uninitialized stream for `connection`.
    pub(crate) fn new(connection: &Arc<ConnectionInner<C>>) -> Self {
        let options = connection.context().options();
        Self {
            shared: Arc::new(StreamShared {
                input: Pipe::with_limit(options.max_read_buffer_size),
                output: Pipe::with_limit(options.max_write_buffer_size),
                state: Mutex::new(StreamState::new()),
                min_alloc_buffer_size: options.min_alloc_buffer_size,
                default_error_code: options.default_stream_error_code,
            }),
            connection: Arc::downgrade(connection),
            connection_id: connection.id(),
            local_addr: connection.local_addr(),
            remote_addr: connection.remote_addr(),
            instance_id: NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed),
            receive_task: None,
            send_task: None,
            persistent_state: StateBag::new(),
            items: StateBag::new(),
            pool_expiration_tick: 0,
        }
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Binds a raw stream.
    ///
    /// Resets per-use state. Pipes are reset only when this object is being
    /// reused.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] if a raw stream is already bound.
    pub(crate) fn initialize(&mut self, raw: C::Stream) -> Result<()> {
        let reused = {
            let mut state = self.shared.state.lock();
            if state.raw.is_some() {
                return Err(Error::invalid_state(
                    "Stream is already bound to a raw stream",
                ));
            }

            let reused = state.reusable;

            state.stream_id = raw.id();
            state.can_read = raw.can_read();
            state.can_write = raw.can_write();
            state.error_code = None;
            state.shutdown_read_reason = None;
            state.shutdown_write_reason = None;
            state.shutdown_reason = None;
            state.peer_aborted = false;
            state.locally_aborted = false;
            state.unexpected_error = false;
            state.read_clean = false;
            state.write_clean = false;
            state.reusable = false;
            state.closed = false;
            state.closed_callbacks.clear();
            if state.closed_token.is_cancelled() {
                state.closed_token = CancellationToken::new();
            }
            state.raw = Some(Arc::new(raw));

            reused
        };

        if reused {
            self.shared.input.reset();
            self.shared.output.reset();
        }
        self.pool_expiration_tick = 0;

        Ok(())
    }

    /// Clears per-use features before a pooled object is handed out again.
    pub(crate) fn reset_features(&mut self) {
        self.items.clear();
    }

    /// Spawns a pump for each supported direction.
    pub(crate) fn start(&mut self) {
        let (raw, can_read, can_write) = {
            let state = self.shared.state.lock();
            (state.raw.clone(), state.can_read, state.can_write)
        };
        let Some(raw) = raw else {
            return;
        };
        let display_id = self.display_id();

        if can_read {
            let shared = Arc::clone(&self.shared);
            self.receive_task = Some(tokio::spawn(shared.receive_loop(
                Arc::clone(&raw),
                display_id.clone(),
            )));
        } else {
            self.shared.input.writer().complete(None);
        }

        if can_write {
            let shared = Arc::clone(&self.shared);
            self.send_task = Some(tokio::spawn(shared.send_loop(raw, display_id)));
        } else {
            self.shared.output.reader().complete(None);
        }
    }

    /// Aborts both directions with the current error code.
    ///
    /// Only the first call has an effect.
    pub fn abort(&self, reason: Error) {
        self.shared.abort(reason, &self.display_id());
    }

    /// Completes the application's pipe ends, waits for both pumps and
    /// returns the object to the connection's pool if it can be reused.
    ///
    /// A stream whose peer has not finished sending blocks here until it
    /// does; abort such streams first.
    pub async fn dispose(mut self) {
        let display_id = self.display_id();

        self.shared.input.reader().complete(None);
        self.shared.output.writer().complete(None);

        for task in [self.receive_task.take(), self.send_task.take()]
            .into_iter()
            .flatten()
        {
            if let Err(e) = task.await {
                warn!(stream = %display_id, error = %e, "Stream pump task failed");
            }
        }

        let reusable = {
            let mut state = self.shared.state.lock();
            state.reusable = state.is_reusable();
            state.raw = None;
            state.reusable
        };

        trace!(stream = %display_id, reusable, "Stream disposed");

        match self.connection.upgrade() {
            Some(connection) => {
                if let Err(stream) = connection.try_return_stream(self) {
                    stream.release();
                }
            }
            None => self.release(),
        }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Returns the application's reading end (data from the peer).
    #[inline]
    #[must_use]
    pub fn input(&self) -> PipeReader {
        self.shared.input.reader()
    }

    /// Returns the application's writing end (data to the peer).
    #[inline]
    #[must_use]
    pub fn output(&self) -> PipeWriter {
        self.shared.output.writer()
    }

    /// Returns a token cancelled when the stream closes.
    #[must_use]
    pub fn closed_token(&self) -> CancellationToken {
        self.shared.state.lock().closed_token.clone()
    }

    /// Identifies the stream object. Unchanged across pool reuse.
    #[inline]
    #[must_use]
    pub fn instance_id(&self) -> u64 {
        self.instance_id
    }

    /// Returns per-use state, cleared when the object is reused.
    #[inline]
    pub fn items(&mut self) -> &mut StateBag {
        &mut self.items
    }

    /// Returns `{connection}:{stream}`.
    #[must_use]
    pub fn display_id(&self) -> String {
        format!("{}:{}", self.connection_id, self.stream_id())
    }

    pub(crate) fn is_reusable(&self) -> bool {
        self.shared.state.lock().reusable
    }

    pub(crate) fn set_pool_expiration_tick(&mut self, tick: u64) {
        self.pool_expiration_tick = tick;
    }

    /// Returns `true` if both pipes hold no bytes.
    #[cfg(test)]
    pub(crate) fn pipes_are_empty(&self) -> bool {
        self.shared.input.is_empty() && self.shared.output.is_empty()
    }
}

impl<C: RawConnection> Expiring for Stream<C> {
    fn pool_expiration_tick(&self) -> u64 {
        self.pool_expiration_tick
    }

    fn release(self) {
        trace!(stream = %self.display_id(), instance_id = self.instance_id, "Stream released");
        self.shared.state.lock().closed_callbacks.clear();
    }
}

impl<C: RawConnection> Drop for Stream<C> {
    fn drop(&mut self) {
        if self.receive_task.is_some() || self.send_task.is_some() {
            self.shared.input.reader().complete(None);
            self.shared.output.writer().complete(None);
        }
    }
}

impl<C: RawConnection> fmt::Debug for Stream<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("Stream")
            .field("connection_id", &self.connection_id)
            .field("stream_id", &state.stream_id)
            .field("instance_id", &self.instance_id)
            .field("can_read", &state.can_read)
            .field("can_write", &state.can_write)
            .field("bound", &state.raw.is_some())
            .finish()
    }
}

// ============================================================================
// Features
// ============================================================================

impl<C: RawConnection> DuplexTransport for Stream<C> {
    fn connection_id(&self) -> String {
        self.display_id()
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    fn closed_token(&self) -> CancellationToken {
        Stream::closed_token(self)
    }

    fn abort(&self, reason: Error) {
        Stream::abort(self, reason);
    }
}

impl<C: RawConnection> StreamDirection for Stream<C> {
    fn can_read(&self) -> bool {
        self.shared.state.lock().can_read
    }

    fn can_write(&self) -> bool {
        self.shared.state.lock().can_write
    }
}

impl<C: RawConnection> StreamIdentity for Stream<C> {
    fn stream_id(&self) -> StreamId {
        self.shared.state.lock().stream_id
    }
}

impl<C: RawConnection> ProtocolErrorCode for Stream<C> {
    fn error_code(&self) -> Option<u64> {
        self.shared.state.lock().error_code
    }

    fn set_error_code(&self, code: u64) {
        self.shared.state.lock().error_code = Some(code);
    }
}

impl<C: RawConnection> PersistentState for Stream<C> {
    fn persistent_state(&mut self) -> &mut StateBag {
        &mut self.persistent_state
    }
}

impl<C: RawConnection> StreamAbort for Stream<C> {
    fn abort_read(&self, error_code: u64, reason: Error) -> Result<()> {
        let display_id = self.display_id();
        let mut state = self.shared.state.lock();
        if !state.can_read {
            return Err(Error::invalid_state(
                "Unable to abort reading from a stream that doesn't support reading",
            ));
        }
        let Some(raw) = state.raw.clone() else {
            return Ok(());
        };

        debug!(stream = %display_id, error_code, reason = %reason, "Stream read aborted");
        if state.shutdown_read_reason.is_none() {
            state.shutdown_read_reason = Some(reason);
        }
        raw.abort_read(error_code);
        Ok(())
    }

    fn abort_write(&self, error_code: u64, reason: Error) -> Result<()> {
        let display_id = self.display_id();
        {
            let mut state = self.shared.state.lock();
            if !state.can_write {
                return Err(Error::invalid_state(
                    "Unable to abort writing to a stream that doesn't support writing",
                ));
            }
            let Some(raw) = state.raw.clone() else {
                return Ok(());
            };

            debug!(stream = %display_id, error_code, reason = %reason, "Stream write aborted");
            if state.shutdown_write_reason.is_none() {
                state.shutdown_write_reason = Some(reason);
            }
            raw.abort_write(error_code);
        }

        self.shared.output.reader().cancel_pending_read();
        Ok(())
    }
}

impl<C: RawConnection> StreamClosed for Stream<C> {
    fn on_closed(&self, callback: ClosedCallback) {
        let mut state = self.shared.state.lock();
        if !state.closed {
            state.closed_callbacks.push(callback);
        }
    }
}
