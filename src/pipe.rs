//! Bounded in-memory byte pipe with backpressure.
//!
//! A [`Pipe`] pairs one producer ([`PipeWriter`]) with one consumer
//! ([`PipeReader`]). Each stream owns two pipes: the input pipe is written by
//! the receive pump and read by the application, the output pipe is written by
//! the application and read by the send pump.
//!
//! # Flow
//!
//! ```text
//!  PipeWriter                                   PipeReader
//!  ──────────                                   ──────────
//!  write(&[u8])  ──► unflushed ──flush()──► readable ──► read() / advance(n)
//!                                   ▲                         │
//!                                   └── pauses while readable ┘
//!                                       ≥ pause threshold
//! ```
//!
//! Either side may complete, with or without an error. A reader sees the
//! writer's completion as `is_completed` (or the writer's error); a writer sees
//! the reader's completion as `is_completed` on its next flush (or the
//! reader's error).

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::{Error, Result};

// ============================================================================
// Results
// ============================================================================

/// Outcome of [`PipeReader::read`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadResult {
    /// All readable bytes, including bytes returned by earlier reads and not
    /// yet consumed.
    pub buffer: Bytes,
    /// The writer completed; no more data will arrive.
    pub is_completed: bool,
    /// The read was cancelled by [`PipeReader::cancel_pending_read`].
    pub is_canceled: bool,
}

/// Outcome of [`PipeWriter::flush`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushResult {
    /// The reader completed; further writes are discarded.
    pub is_completed: bool,
    /// The flush was cancelled by [`PipeWriter::cancel_pending_flush`].
    pub is_canceled: bool,
}

// ============================================================================
// Completion
// ============================================================================

/// Terminal state of one side of the pipe.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
enum Completion {
    #[default]
    Open,
    Clean,
    Failed(Error),
}

impl Completion {
    #[inline]
    fn is_done(&self) -> bool {
        !matches!(self, Self::Open)
    }

    fn from_error(error: Option<Error>) -> Self {
        match error {
            Some(error) => Self::Failed(error),
            None => Self::Clean,
        }
    }
}

// ============================================================================
// Shared State
// ============================================================================

#[derive(Default)]
struct PipeState {
    /// Flushed bytes not yet consumed by the reader.
    readable: BytesMut,
    /// Prefix of `readable` already handed to the reader.
    examined: usize,
    /// Written bytes not yet flushed.
    unflushed: BytesMut,
    writer: Completion,
    reader: Completion,
    read_cancel_requested: bool,
    flush_cancel_requested: bool,
}

impl PipeState {
    /// Moves unflushed bytes into the readable region.
    fn publish(&mut self) {
        if !self.unflushed.is_empty() {
            let Self {
                readable,
                unflushed,
                ..
            } = self;
            readable.extend_from_slice(unflushed);
            unflushed.clear();
        }
    }
}

struct PipeShared {
    state: Mutex<PipeState>,
    /// Wakes a reader waiting for data, completion or cancellation.
    reader_wake: Notify,
    /// Wakes a writer waiting in flush.
    writer_wake: Notify,
    /// Readable bytes at which a flush suspends (0 = never).
    pause_threshold: usize,
    /// Readable bytes below which a suspended flush resumes.
    resume_threshold: usize,
}

// ============================================================================
// Pipe
// ============================================================================

/// A bounded single-producer single-consumer byte channel.
///
/// Reader and writer handles are cheap to clone and all refer to the same
/// buffer. Use [`reset`](Self::reset) to make a completed pipe reusable.
#[derive(Clone)]
pub struct Pipe {
    shared: Arc<PipeShared>,
}

impl Pipe {
    /// Creates a pipe.
    ///
    /// # Arguments
    ///
    /// * `pause_threshold` - Readable bytes at which flushes suspend (0 = unbounded)
    /// * `resume_threshold` - Readable bytes below which suspended flushes resume
    #[must_use]
    pub fn new(pause_threshold: usize, resume_threshold: usize) -> Self {
        Self {
            shared: Arc::new(PipeShared {
                state: Mutex::new(PipeState::default()),
                reader_wake: Notify::new(),
                writer_wake: Notify::new(),
                pause_threshold,
                resume_threshold: resume_threshold.min(pause_threshold),
            }),
        }
    }

    /// Creates a pipe that pauses at `max_buffer_size` and resumes at half.
    #[must_use]
    pub fn with_limit(max_buffer_size: usize) -> Self {
        Self::new(max_buffer_size, max_buffer_size / 2)
    }

    /// Returns a handle to the consuming side.
    #[inline]
    #[must_use]
    pub fn reader(&self) -> PipeReader {
        PipeReader {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Returns a handle to the producing side.
    #[inline]
    #[must_use]
    pub fn writer(&self) -> PipeWriter {
        PipeWriter {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Discards all buffered bytes and completion state.
    ///
    /// Only call once both pumps and the consumer are done with the pipe.
    pub fn reset(&self) {
        *self.shared.state.lock() = PipeState::default();
    }

    /// Returns `true` if no bytes are buffered, flushed or not.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        let state = self.shared.state.lock();
        state.readable.is_empty() && state.unflushed.is_empty()
    }

    /// Returns `true` if neither side has completed.
    #[must_use]
    pub fn is_open(&self) -> bool {
        let state = self.shared.state.lock();
        !state.reader.is_done() && !state.writer.is_done()
    }
}

impl fmt::Debug for Pipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("Pipe")
            .field("readable", &state.readable.len())
            .field("unflushed", &state.unflushed.len())
            .field("writer", &state.writer)
            .field("reader", &state.reader)
            .finish()
    }
}

// ============================================================================
// PipeReader
// ============================================================================

/// Consuming side of a [`Pipe`].
#[derive(Clone)]
pub struct PipeReader {
    shared: Arc<PipeShared>,
}

impl PipeReader {
    /// Waits for bytes that have not been examined yet, writer completion, or
    /// a cancellation.
    ///
    /// # Errors
    ///
    /// - The writer's completion error, if it completed with one
    /// - [`Error::InvalidState`] if this reader was already completed
    pub async fn read(&self) -> Result<ReadResult> {
        loop {
            let notified = self.shared.reader_wake.notified();
            {
                let mut state = self.shared.state.lock();

                if state.reader.is_done() {
                    return Err(Error::invalid_state(
                        "Reading is not allowed after the reader was completed",
                    ));
                }

                if state.read_cancel_requested {
                    state.read_cancel_requested = false;
                    return Ok(ReadResult {
                        buffer: Bytes::copy_from_slice(&state.readable),
                        is_completed: false,
                        is_canceled: true,
                    });
                }

                if let Completion::Failed(error) = &state.writer {
                    return Err(error.clone());
                }

                let is_completed = state.writer.is_done();
                if state.readable.len() > state.examined || is_completed {
                    state.examined = state.readable.len();
                    return Ok(ReadResult {
                        buffer: Bytes::copy_from_slice(&state.readable),
                        is_completed,
                        is_canceled: false,
                    });
                }
            }
            notified.await;
        }
    }

    /// Consumes `consumed` bytes from the front of the readable region.
    ///
    /// Bytes returned by the last read and not consumed count as examined:
    /// the next read waits for more data.
    pub fn advance(&self, consumed: usize) {
        let mut state = self.shared.state.lock();
        let consumed = consumed.min(state.readable.len());
        let _ = state.readable.split_to(consumed);
        state.examined = state.examined.saturating_sub(consumed);

        if state.readable.len() < self.shared.resume_threshold.max(1) {
            self.shared.writer_wake.notify_waiters();
        }
    }

    /// Completes the reader. The writer observes it on its next flush.
    ///
    /// Has no effect if already completed.
    pub fn complete(&self, error: Option<Error>) {
        let mut state = self.shared.state.lock();
        if state.reader.is_done() {
            return;
        }
        state.reader = Completion::from_error(error);
        drop(state);

        self.shared.writer_wake.notify_waiters();
    }

    /// Makes the pending (or next) read return with `is_canceled` set.
    pub fn cancel_pending_read(&self) {
        self.shared.state.lock().read_cancel_requested = true;
        self.shared.reader_wake.notify_waiters();
    }
}

// ============================================================================
// PipeWriter
// ============================================================================

/// Producing side of a [`Pipe`].
#[derive(Clone)]
pub struct PipeWriter {
    shared: Arc<PipeShared>,
}

impl PipeWriter {
    /// Appends bytes to the unflushed region.
    ///
    /// Bytes are not visible to the reader until [`flush`](Self::flush) or
    /// [`complete`](Self::complete). Writes after the reader completed are
    /// discarded.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] if the writer was already completed.
    pub fn write(&self, data: &[u8]) -> Result<()> {
        let mut state = self.shared.state.lock();
        if state.writer.is_done() {
            return Err(Error::invalid_state(
                "Writing is not allowed after the writer was completed",
            ));
        }
        if !state.reader.is_done() {
            state.unflushed.extend_from_slice(data);
        }
        Ok(())
    }

    /// Publishes written bytes to the reader, suspending while the reader
    /// lags behind.
    ///
    /// # Errors
    ///
    /// Returns the reader's completion error, if it completed with one.
    pub async fn flush(&self) -> Result<FlushResult> {
        {
            let mut state = self.shared.state.lock();
            state.publish();
        }
        self.shared.reader_wake.notify_waiters();

        let mut paused = false;
        loop {
            let notified = self.shared.writer_wake.notified();
            {
                let mut state = self.shared.state.lock();

                match &state.reader {
                    Completion::Failed(error) => return Err(error.clone()),
                    Completion::Clean => {
                        return Ok(FlushResult {
                            is_completed: true,
                            is_canceled: false,
                        });
                    }
                    Completion::Open => {}
                }

                if state.flush_cancel_requested {
                    state.flush_cancel_requested = false;
                    return Ok(FlushResult {
                        is_completed: false,
                        is_canceled: true,
                    });
                }

                let limit = if paused {
                    self.shared.resume_threshold.max(1)
                } else {
                    self.shared.pause_threshold
                };
                if self.shared.pause_threshold == 0 || state.readable.len() < limit {
                    return Ok(FlushResult::default());
                }
            }
            paused = true;
            notified.await;
        }
    }

    /// Writes and flushes in one call.
    ///
    /// # Errors
    ///
    /// See [`write`](Self::write) and [`flush`](Self::flush).
    pub async fn write_all(&self, data: &[u8]) -> Result<FlushResult> {
        self.write(data)?;
        self.flush().await
    }

    /// Completes the writer, publishing any unflushed bytes.
    ///
    /// Has no effect if already completed.
    pub fn complete(&self, error: Option<Error>) {
        let mut state = self.shared.state.lock();
        if state.writer.is_done() {
            return;
        }
        state.publish();
        state.writer = Completion::from_error(error);
        drop(state);

        self.shared.reader_wake.notify_waiters();
    }

    /// Makes the pending (or next) flush return with `is_canceled` set.
    pub fn cancel_pending_flush(&self) {
        self.shared.state.lock().flush_cancel_requested = true;
        self.shared.writer_wake.notify_waiters();
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use tokio_test::{assert_pending, assert_ready, assert_ready_ok, task};

    #[tokio::test]
    async fn test_write_flush_read() {
        let pipe = Pipe::with_limit(1024);
        let (reader, writer) = (pipe.reader(), pipe.writer());

        writer.write(b"hello").expect("write");
        let flush = writer.flush().await.expect("flush");
        assert_eq!(flush, FlushResult::default());

        let result = reader.read().await.expect("read");
        assert_eq!(&result.buffer[..], b"hello");
        assert!(!result.is_completed);
        reader.advance(result.buffer.len());

        assert!(pipe.is_empty());
    }

    #[test]
    fn test_read_waits_for_flush() {
        let pipe = Pipe::with_limit(1024);
        let writer = pipe.writer();
        let reader = pipe.reader();
        let mut read = task::spawn(async move { reader.read().await });

        assert_pending!(read.poll());

        writer.write(b"abc").expect("write");
        assert_pending!(read.poll());

        let mut flush = task::spawn(writer.flush());
        assert_ready_ok!(flush.poll());

        assert!(read.is_woken());
        let result = assert_ready_ok!(read.poll());
        assert_eq!(&result.buffer[..], b"abc");
    }

    #[test]
    fn test_partial_advance_waits_for_more_data() {
        let pipe = Pipe::with_limit(1024);
        let (reader, writer) = (pipe.reader(), pipe.writer());

        writer.write(b"header").expect("write");
        let mut flush = task::spawn(writer.flush());
        assert_ready_ok!(flush.poll());
        drop(flush);

        let mut read = task::spawn(reader.read());
        let result = assert_ready_ok!(read.poll());
        drop(read);
        reader.advance(2);

        // Remaining "ader" is examined; the next read waits for new bytes.
        let mut read = task::spawn(reader.read());
        assert_pending!(read.poll());

        writer.write(b"!").expect("write");
        let mut flush = task::spawn(writer.flush());
        assert_ready_ok!(flush.poll());

        let result_2 = assert_ready_ok!(read.poll());
        assert_eq!(result.buffer.len(), 6);
        assert_eq!(&result_2.buffer[..], b"ader!");
    }

    #[test]
    fn test_flush_pauses_until_reader_consumes() {
        let pipe = Pipe::new(8, 4);
        let (reader, writer) = (pipe.reader(), pipe.writer());

        writer.write(&[0u8; 10]).expect("write");
        let mut flush = task::spawn(writer.flush());
        assert_pending!(flush.poll());

        // Dropping to 5 bytes is still above the resume threshold.
        reader.advance(5);
        assert_pending!(flush.poll());

        reader.advance(2);
        assert!(flush.is_woken());
        let result = assert_ready_ok!(flush.poll());
        assert_eq!(result, FlushResult::default());
    }

    #[test]
    fn test_cancel_pending_flush_releases_writer() {
        let pipe = Pipe::new(4, 2);
        let writer = pipe.writer();

        writer.write(&[1u8; 4]).expect("write");
        let mut flush = task::spawn(writer.flush());
        assert_pending!(flush.poll());

        pipe.writer().cancel_pending_flush();
        assert!(flush.is_woken());
        let result = assert_ready_ok!(flush.poll());
        assert!(result.is_canceled);
    }

    #[test]
    fn test_cancel_pending_read_before_read_is_remembered() {
        let pipe = Pipe::with_limit(16);
        let reader = pipe.reader();

        reader.cancel_pending_read();
        let mut read = task::spawn(reader.read());
        let result = assert_ready_ok!(read.poll());
        assert!(result.is_canceled);
        drop(read);

        // One-shot: the next read waits again.
        let mut read = task::spawn(reader.read());
        assert_pending!(read.poll());
    }

    #[test]
    fn test_writer_complete_publishes_and_ends() {
        let pipe = Pipe::with_limit(16);
        let (reader, writer) = (pipe.reader(), pipe.writer());

        writer.write(b"tail").expect("write");
        writer.complete(None);

        let mut read = task::spawn(reader.read());
        let result = assert_ready_ok!(read.poll());
        assert_eq!(&result.buffer[..], b"tail");
        assert!(result.is_completed);

        assert!(writer.write(b"more").is_err());
    }

    #[test]
    fn test_writer_error_surfaces_on_read() {
        let pipe = Pipe::with_limit(16);
        pipe.writer().complete(Some(Error::stream_reset(7)));

        let reader = pipe.reader();
        let mut read = task::spawn(reader.read());
        let err = assert_ready!(read.poll()).unwrap_err();
        assert_eq!(err, Error::stream_reset(7));
    }

    #[test]
    fn test_reader_complete_completes_flush() {
        let pipe = Pipe::new(4, 2);
        let writer = pipe.writer();

        writer.write(&[0u8; 8]).expect("write");
        let mut flush = task::spawn(writer.flush());
        assert_pending!(flush.poll());

        pipe.reader().complete(None);
        let result = assert_ready_ok!(flush.poll());
        assert!(result.is_completed);
    }

    #[test]
    fn test_reader_error_surfaces_on_flush() {
        let pipe = Pipe::with_limit(16);
        pipe.reader().complete(Some(Error::aborted("stop")));

        let writer = pipe.writer();
        writer.write(b"x").expect("write");
        let mut flush = task::spawn(writer.flush());
        let err = assert_ready!(flush.poll()).unwrap_err();
        assert!(err.is_aborted());
    }

    #[test]
    fn test_reset_restores_fresh_state() {
        let pipe = Pipe::with_limit(16);
        pipe.writer().write(b"stale").expect("write");
        pipe.writer().complete(Some(Error::stream_reset(1)));
        pipe.reader().complete(None);
        assert!(!pipe.is_open());

        pipe.reset();

        assert!(pipe.is_empty());
        assert!(pipe.is_open());
        let reader = pipe.reader();
        let mut read = task::spawn(reader.read());
        assert_pending!(read.poll());
    }

    #[test]
    fn test_unbounded_pipe_never_pauses() {
        let pipe = Pipe::with_limit(0);
        let writer = pipe.writer();

        writer.write(&vec![0u8; 1 << 20]).expect("write");
        let mut flush = task::spawn(writer.flush());
        assert_ready_ok!(flush.poll());
    }
}
