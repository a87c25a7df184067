//! In-process loopback transport.
//!
//! Implements the raw transport traits over shared memory so the adapter
//! can be exercised without sockets, certificates or packet loss. Both ends
//! of a connection are ordinary [`MemoryConnection`]s; the client end is
//! returned by [`MemoryConnector::connect`] and the server end is delivered
//! to [`MemoryListener::accept`].
//!
//! # Semantics
//!
//! - Stream IDs follow QUIC numbering (`index << 2 | direction | initiator`).
//! - Stream data is buffered without limit; writes never suspend.
//! - `abort_write` resets the stream: the peer's reads fail with
//!   `StreamAborted { code }` and buffered data is discarded.
//! - `abort_read` stops the stream: the peer's writes fail with
//!   `StreamAborted { code }`.
//! - `close(code)` fails local operations with `OperationAborted` and peer
//!   operations with `ConnectionAborted { code }`.
//!
//! # Example
//!
//! ```ignore
//! let (listener, connector) = MemoryListener::bind(addr, Some(b"h3"));
//! let client = connector.connect()?;
//! let server = listener.accept().await?;
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::collections::VecDeque;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, Notify, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::TransportError;
use crate::identifiers::StreamId;

use super::{RawConnection, RawListener, RawStream, TransportResult};

// ============================================================================
// Constants
// ============================================================================

/// First ephemeral port handed to client connections.
const FIRST_CLIENT_PORT: u16 = 49152;

/// Endpoint index of the connecting side.
const CLIENT: usize = 0;

/// Endpoint index of the accepting side.
const SERVER: usize = 1;

// ============================================================================
// TransportStats
// ============================================================================

/// Counters of abortive operations on one connection, shared by both ends.
#[derive(Debug, Default)]
pub struct TransportStats {
    read_aborts: AtomicUsize,
    write_aborts: AtomicUsize,
    closes: AtomicUsize,
}

impl TransportStats {
    /// Number of `abort_read` calls on any stream of the connection.
    #[must_use]
    pub fn read_aborts(&self) -> usize {
        self.read_aborts.load(Ordering::SeqCst)
    }

    /// Number of `abort_write` calls on any stream of the connection.
    #[must_use]
    pub fn write_aborts(&self) -> usize {
        self.write_aborts.load(Ordering::SeqCst)
    }

    /// Number of `close` calls from either end.
    #[must_use]
    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

// ============================================================================
// Channel
// ============================================================================

/// One direction of stream data.
#[derive(Default)]
struct Channel {
    state: Mutex<ChannelState>,
    notify: Notify,
}

#[derive(Default)]
struct ChannelState {
    /// Sent, not yet read.
    data: BytesMut,
    /// Sender finished the direction.
    finished: bool,
    /// Sender aborted with this code.
    reset: Option<u64>,
    /// Receiver aborted with this code.
    stopped: Option<u64>,
    /// Receiver aborted locally.
    read_aborted: bool,
    /// Sender aborted locally.
    write_aborted: bool,
}

impl Channel {
    fn wake(&self) {
        self.notify.notify_waiters();
    }
}

// ============================================================================
// Link
// ============================================================================

/// Connection close state as seen from one end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseState {
    Local,
    Peer(u64),
}

#[derive(Default)]
struct Endpoint {
    /// Streams opened by the other end, waiting to be accepted.
    incoming: Mutex<VecDeque<MemoryStream>>,
    notify: Notify,
    closed: Mutex<Option<CloseState>>,
    released: AtomicBool,
    /// Next stream index, `[bidirectional, unidirectional]`.
    next_index: [AtomicU64; 2],
}

/// State shared by both ends of a connection.
#[derive(Default)]
struct Link {
    endpoints: [Endpoint; 2],
    /// Every channel ever opened, for close notifications.
    channels: Mutex<Vec<Weak<Channel>>>,
    stats: TransportStats,
}

impl Link {
    fn close_error(&self, side: usize) -> Option<TransportError> {
        match *self.endpoints[side].closed.lock() {
            Some(CloseState::Local) => Some(TransportError::OperationAborted),
            Some(CloseState::Peer(code)) => Some(TransportError::ConnectionAborted { code }),
            None => None,
        }
    }

    fn register(&self, channel: &Arc<Channel>) {
        let mut channels = self.channels.lock();
        channels.retain(|weak| weak.strong_count() > 0);
        channels.push(Arc::downgrade(channel));
    }

    /// Closes from `side`. Returns `false` if that end was already closed.
    fn close(&self, side: usize, code: u64) -> bool {
        {
            let mut local = self.endpoints[side].closed.lock();
            if local.is_some() {
                return false;
            }
            *local = Some(CloseState::Local);
        }
        {
            let mut peer = self.endpoints[1 - side].closed.lock();
            if peer.is_none() {
                *peer = Some(CloseState::Peer(code));
            }
        }

        for endpoint in &self.endpoints {
            endpoint.notify.notify_waiters();
        }
        let channels: Vec<Arc<Channel>> = self
            .channels
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .collect();
        for channel in channels {
            channel.wake();
        }
        true
    }
}

// ============================================================================
// MemoryStream
// ============================================================================

/// One end of a loopback stream.
pub struct MemoryStream {
    id: StreamId,
    link: Arc<Link>,
    side: usize,
    recv: Option<Arc<Channel>>,
    send: Option<Arc<Channel>>,
}

impl MemoryStream {
    fn recv_channel(&self) -> TransportResult<&Arc<Channel>> {
        self.recv
            .as_ref()
            .ok_or_else(|| TransportError::other("Stream does not support reading"))
    }

    fn send_channel(&self) -> TransportResult<&Arc<Channel>> {
        self.send
            .as_ref()
            .ok_or_else(|| TransportError::other("Stream does not support writing"))
    }

    /// Reads until the peer finishes the stream and returns everything read.
    ///
    /// # Errors
    ///
    /// Any error from [`RawStream::read`].
    pub async fn read_to_end(&self) -> TransportResult<Vec<u8>> {
        let mut out = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = self.read(&mut buf).await?;
            if n == 0 {
                return Ok(out);
            }
            out.extend_from_slice(&buf[..n]);
        }
    }

    /// Returns the code the peer stopped reading with, if any.
    #[must_use]
    pub fn stopped_code(&self) -> Option<u64> {
        self.send.as_ref().and_then(|c| c.state.lock().stopped)
    }

    /// Returns the code the peer reset its sending side with, if any.
    #[must_use]
    pub fn reset_code(&self) -> Option<u64> {
        self.recv.as_ref().and_then(|c| c.state.lock().reset)
    }
}

#[async_trait]
impl RawStream for MemoryStream {
    fn id(&self) -> StreamId {
        self.id
    }

    fn can_read(&self) -> bool {
        self.recv.is_some()
    }

    fn can_write(&self) -> bool {
        self.send.is_some()
    }

    fn reads_completed(&self) -> bool {
        self.recv.as_ref().is_some_and(|channel| {
            let state = channel.state.lock();
            state.finished && state.data.is_empty() && state.reset.is_none()
        })
    }

    async fn read(&self, buf: &mut [u8]) -> TransportResult<usize> {
        let channel = self.recv_channel()?;
        loop {
            let notified = channel.notify.notified();
            if let Some(error) = self.link.close_error(self.side) {
                return Err(error);
            }
            {
                let mut state = channel.state.lock();
                if state.read_aborted {
                    return Err(TransportError::OperationAborted);
                }
                if let Some(code) = state.reset {
                    return Err(TransportError::StreamAborted { code });
                }
                if !state.data.is_empty() {
                    let n = buf.len().min(state.data.len());
                    let chunk = state.data.split_to(n);
                    buf[..n].copy_from_slice(&chunk);
                    return Ok(n);
                }
                if state.finished {
                    return Ok(0);
                }
            }
            notified.await;
        }
    }

    async fn write(&self, data: &[u8], end_stream: bool) -> TransportResult<()> {
        let channel = self.send_channel()?;
        if let Some(error) = self.link.close_error(self.side) {
            return Err(error);
        }
        {
            let mut state = channel.state.lock();
            if state.write_aborted {
                return Err(TransportError::OperationAborted);
            }
            if let Some(code) = state.stopped {
                return Err(TransportError::StreamAborted { code });
            }
            if state.finished {
                return Err(TransportError::other("Write after end of stream"));
            }
            state.data.extend_from_slice(data);
            state.finished |= end_stream;
        }
        channel.wake();
        Ok(())
    }

    fn abort_read(&self, error_code: u64) {
        let Some(channel) = &self.recv else {
            return;
        };
        self.link.stats.read_aborts.fetch_add(1, Ordering::SeqCst);
        {
            let mut state = channel.state.lock();
            state.read_aborted = true;
            if state.stopped.is_none() {
                state.stopped = Some(error_code);
            }
        }
        trace!(stream_id = %self.id, error_code, "Memory stream read aborted");
        channel.wake();
    }

    fn abort_write(&self, error_code: u64) {
        let Some(channel) = &self.send else {
            return;
        };
        self.link.stats.write_aborts.fetch_add(1, Ordering::SeqCst);
        {
            let mut state = channel.state.lock();
            state.write_aborted = true;
            if !state.finished {
                state.reset = Some(error_code);
                state.data.clear();
            }
        }
        trace!(stream_id = %self.id, error_code, "Memory stream write aborted");
        channel.wake();
    }

    async fn shutdown(&self) -> TransportResult<()> {
        let channel = self.send_channel()?;
        if let Some(error) = self.link.close_error(self.side) {
            return Err(error);
        }
        {
            let mut state = channel.state.lock();
            if state.write_aborted {
                return Err(TransportError::OperationAborted);
            }
            if let Some(code) = state.stopped {
                return Err(TransportError::StreamAborted { code });
            }
            state.finished = true;
        }
        channel.wake();
        Ok(())
    }
}

impl fmt::Debug for MemoryStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryStream")
            .field("id", &self.id)
            .field("can_read", &self.can_read())
            .field("can_write", &self.can_write())
            .finish()
    }
}

// ============================================================================
// MemoryConnection
// ============================================================================

/// One end of a loopback connection.
pub struct MemoryConnection {
    link: Arc<Link>,
    side: usize,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    protocol: Option<Vec<u8>>,
}

impl MemoryConnection {
    /// Returns counters shared with the other end.
    #[must_use]
    pub fn stats(&self) -> &TransportStats {
        &self.link.stats
    }

    /// Returns `true` once [`RawConnection::release`] was called on this end.
    #[must_use]
    pub fn is_released(&self) -> bool {
        self.link.endpoints[self.side].released.load(Ordering::SeqCst)
    }

    /// Returns `true` once either end closed the connection.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.link.endpoints[self.side].closed.lock().is_some()
    }
}

#[async_trait]
impl RawConnection for MemoryConnection {
    type Stream = MemoryStream;

    async fn accept_stream(&self) -> TransportResult<MemoryStream> {
        let endpoint = &self.link.endpoints[self.side];
        loop {
            let notified = endpoint.notify.notified();
            if let Some(error) = self.link.close_error(self.side) {
                return Err(error);
            }
            if let Some(stream) = endpoint.incoming.lock().pop_front() {
                return Ok(stream);
            }
            notified.await;
        }
    }

    async fn open_stream(&self, bidirectional: bool) -> TransportResult<MemoryStream> {
        if let Some(error) = self.link.close_error(self.side) {
            return Err(error);
        }

        let kind = usize::from(!bidirectional);
        let index = self.link.endpoints[self.side].next_index[kind].fetch_add(1, Ordering::SeqCst);
        let id = StreamId::from_parts(index, self.side == SERVER, !bidirectional);

        let outbound = Arc::new(Channel::default());
        self.link.register(&outbound);
        let inbound = bidirectional.then(|| {
            let channel = Arc::new(Channel::default());
            self.link.register(&channel);
            channel
        });

        let local = MemoryStream {
            id,
            link: Arc::clone(&self.link),
            side: self.side,
            recv: inbound.clone(),
            send: Some(Arc::clone(&outbound)),
        };
        let remote = MemoryStream {
            id,
            link: Arc::clone(&self.link),
            side: 1 - self.side,
            recv: Some(outbound),
            send: inbound,
        };

        let peer = &self.link.endpoints[1 - self.side];
        peer.incoming.lock().push_back(remote);
        peer.notify.notify_waiters();

        trace!(stream_id = %id, bidirectional, "Memory stream opened");
        Ok(local)
    }

    async fn close(&self, error_code: u64) -> TransportResult<()> {
        self.link.stats.closes.fetch_add(1, Ordering::SeqCst);
        if self.link.close(self.side, error_code) {
            debug!(error_code, local = %self.local_addr, "Memory connection closed");
        }
        Ok(())
    }

    async fn release(&self) {
        let endpoint = &self.link.endpoints[self.side];
        endpoint.released.store(true, Ordering::SeqCst);
        endpoint.incoming.lock().clear();
    }

    fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn negotiated_protocol(&self) -> Option<Vec<u8>> {
        self.protocol.clone()
    }
}

impl fmt::Debug for MemoryConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryConnection")
            .field("local_addr", &self.local_addr)
            .field("remote_addr", &self.remote_addr)
            .field("server", &(self.side == SERVER))
            .finish()
    }
}

// ============================================================================
// MemoryListener
// ============================================================================

/// Accepting end of the loopback transport.
pub struct MemoryListener {
    addr: SocketAddr,
    incoming: AsyncMutex<mpsc::UnboundedReceiver<MemoryConnection>>,
    closed: CancellationToken,
}

/// Dials a [`MemoryListener`].
#[derive(Clone)]
pub struct MemoryConnector {
    addr: SocketAddr,
    protocol: Option<Vec<u8>>,
    sender: mpsc::UnboundedSender<MemoryConnection>,
    next_port: Arc<AtomicU16>,
}

impl MemoryListener {
    /// Creates a listener at `addr` and a connector that dials it.
    ///
    /// # Arguments
    ///
    /// * `addr` - Address reported as the listener's local address
    /// * `protocol` - Application protocol every connection negotiates
    #[must_use]
    pub fn bind(addr: SocketAddr, protocol: Option<&[u8]>) -> (Self, MemoryConnector) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let listener = Self {
            addr,
            incoming: AsyncMutex::new(receiver),
            closed: CancellationToken::new(),
        };
        let connector = MemoryConnector {
            addr,
            protocol: protocol.map(<[u8]>::to_vec),
            sender,
            next_port: Arc::new(AtomicU16::new(FIRST_CLIENT_PORT)),
        };
        (listener, connector)
    }
}

impl MemoryConnector {
    /// Opens a connection and returns its client end.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Other`] if the listener is gone.
    pub fn connect(&self) -> TransportResult<MemoryConnection> {
        let port = self.next_port.fetch_add(1, Ordering::Relaxed);
        let client_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port);
        let link = Arc::new(Link::default());

        let client = MemoryConnection {
            link: Arc::clone(&link),
            side: CLIENT,
            local_addr: client_addr,
            remote_addr: self.addr,
            protocol: self.protocol.clone(),
        };
        let server = MemoryConnection {
            link,
            side: SERVER,
            local_addr: self.addr,
            remote_addr: client_addr,
            protocol: self.protocol.clone(),
        };

        self.sender
            .send(server)
            .map_err(|_| TransportError::other("Connection refused"))?;
        Ok(client)
    }
}

#[async_trait]
impl RawListener for MemoryListener {
    type Connection = MemoryConnection;

    async fn accept(&self) -> TransportResult<MemoryConnection> {
        let mut incoming = tokio::select! {
            _ = self.closed.cancelled() => return Err(TransportError::OperationAborted),
            guard = self.incoming.lock() => guard,
        };
        tokio::select! {
            _ = self.closed.cancelled() => Err(TransportError::OperationAborted),
            connection = incoming.recv() => connection.ok_or(TransportError::OperationAborted),
        }
    }

    fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    async fn close(&self) {
        self.closed.cancel();
    }
}

impl fmt::Debug for MemoryListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryListener")
            .field("addr", &self.addr)
            .field("closed", &self.closed.is_cancelled())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn listener_addr() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 4433)
    }

    async fn connected_pair() -> (MemoryConnection, MemoryConnection) {
        let (listener, connector) = MemoryListener::bind(listener_addr(), Some(b"h3"));
        let client = connector.connect().expect("connect");
        let server = listener.accept().await.expect("accept");
        (client, server)
    }

    #[tokio::test]
    async fn test_connect_and_accept() {
        let (client, server) = connected_pair().await;

        assert_eq!(server.local_addr(), listener_addr());
        assert_eq!(server.remote_addr(), client.local_addr());
        assert_eq!(server.negotiated_protocol().as_deref(), Some(&b"h3"[..]));
    }

    #[tokio::test]
    async fn test_bidirectional_round_trip() {
        let (client, server) = connected_pair().await;

        let outbound = client.open_stream(true).await.expect("open");
        outbound.write(b"ping", true).await.expect("write");

        let inbound = server.accept_stream().await.expect("accept stream");
        assert_eq!(inbound.id(), StreamId::new(0));
        assert!(inbound.can_read() && inbound.can_write());
        assert_eq!(inbound.read_to_end().await.expect("read"), b"ping");
        assert!(inbound.reads_completed());

        inbound.write(b"pong", false).await.expect("write");
        inbound.shutdown().await.expect("shutdown");
        assert_eq!(outbound.read_to_end().await.expect("read"), b"pong");
    }

    #[tokio::test]
    async fn test_unidirectional_ids_and_direction() {
        let (client, server) = connected_pair().await;

        let first = server.open_stream(false).await.expect("open");
        let second = server.open_stream(false).await.expect("open");
        assert_eq!(first.id(), StreamId::new(3));
        assert_eq!(second.id(), StreamId::new(7));
        assert!(!first.can_read() && first.can_write());

        let remote = client.accept_stream().await.expect("accept");
        assert!(remote.can_read() && !remote.can_write());
    }

    #[tokio::test]
    async fn test_abort_write_resets_peer_read() {
        let (client, server) = connected_pair().await;

        let outbound = client.open_stream(true).await.expect("open");
        outbound.write(b"partial", false).await.expect("write");
        outbound.abort_write(7);

        let inbound = server.accept_stream().await.expect("accept");
        let mut buf = [0u8; 16];
        let err = inbound.read(&mut buf).await.unwrap_err();
        assert_eq!(err, TransportError::StreamAborted { code: 7 });
        assert_eq!(client.stats().write_aborts(), 1);
    }

    #[tokio::test]
    async fn test_abort_read_stops_peer_write() {
        let (client, server) = connected_pair().await;

        let outbound = client.open_stream(true).await.expect("open");
        let inbound = server.accept_stream().await.expect("accept");
        inbound.abort_read(9);

        let err = outbound.write(b"x", false).await.unwrap_err();
        assert_eq!(err, TransportError::StreamAborted { code: 9 });
        assert_eq!(outbound.stopped_code(), Some(9));

        let mut buf = [0u8; 4];
        let local = inbound.read(&mut buf).await.unwrap_err();
        assert_eq!(local, TransportError::OperationAborted);
    }

    #[tokio::test]
    async fn test_close_fails_pending_operations() {
        let (client, server) = connected_pair().await;

        let pending = tokio::spawn(async move {
            let result = server.accept_stream().await;
            (server, result)
        });
        tokio::task::yield_now().await;

        client.close(42).await.expect("close");
        let (server, result) = pending.await.expect("join");
        assert_eq!(
            result.unwrap_err(),
            TransportError::ConnectionAborted { code: 42 }
        );
        assert!(server.is_closed());

        let local = client.accept_stream().await.unwrap_err();
        assert_eq!(local, TransportError::OperationAborted);
        assert_eq!(client.stats().closes(), 1);
    }

    #[tokio::test]
    async fn test_listener_close_aborts_accept() {
        let (listener, _connector) = MemoryListener::bind(listener_addr(), None);
        listener.close().await;

        let err = listener.accept().await.unwrap_err();
        assert_eq!(err, TransportError::OperationAborted);
    }

    #[tokio::test]
    async fn test_release_marks_endpoint() {
        let (client, server) = connected_pair().await;
        server.release().await;
        assert!(server.is_released());
        assert!(!client.is_released());
    }
}
