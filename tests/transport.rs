//! End-to-end tests over the in-memory loopback transport.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use streamplex::raw::memory::{MemoryConnection, MemoryConnector, MemoryListener, MemoryStream};
use streamplex::raw::{RawConnection, RawStream};
use streamplex::{
    Connection, DuplexTransport, Error, Listener, PersistentState, ProtocolErrorCode, Stream,
    StreamAbort, StreamClosed, StreamDirection, StreamDirectionHint, StreamIdentity,
    TransportOptions,
};

// ============================================================================
// Helpers
// ============================================================================

const WAIT: Duration = Duration::from_secs(5);

fn addr() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 4433)
}

struct Peer {
    listener: Listener<MemoryListener>,
    connector: MemoryConnector,
}

impl Peer {
    fn bind(options: TransportOptions) -> Self {
        let (raw, connector) = MemoryListener::bind(addr(), Some(b"h3"));
        let listener = Listener::builder()
            .options(options)
            .without_heartbeat()
            .bind(raw)
            .expect("bind");
        Self {
            listener,
            connector,
        }
    }

    async fn connect(&self) -> (Connection<MemoryConnection>, MemoryConnection) {
        let client = self.connector.connect().expect("connect");
        let server = self
            .listener
            .accept()
            .await
            .expect("accept")
            .expect("connection");
        (server, client)
    }
}

async fn accept(server: &Connection<MemoryConnection>) -> Stream<MemoryConnection> {
    let cancel = CancellationToken::new();
    timeout(WAIT, server.accept_stream(&cancel))
        .await
        .expect("accept timed out")
        .expect("accept")
        .expect("stream")
}

async fn request(
    server: &Connection<MemoryConnection>,
    client: &MemoryConnection,
    body: &[u8],
) -> (Stream<MemoryConnection>, MemoryStream) {
    let outbound = client.open_stream(true).await.expect("open");
    outbound.write(body, true).await.expect("write");
    (accept(server).await, outbound)
}

/// Reads the input until it completes and returns everything read.
async fn read_all(stream: &Stream<MemoryConnection>) -> streamplex::Result<Vec<u8>> {
    let input = stream.input();
    let mut body = Vec::new();
    loop {
        let result = input.read().await?;
        body.extend_from_slice(&result.buffer);
        input.advance(result.buffer.len());
        if result.is_completed {
            return Ok(body);
        }
    }
}

async fn respond(stream: Stream<MemoryConnection>, body: &[u8]) {
    stream.output().write_all(body).await.expect("write");
    timeout(WAIT, stream.dispose()).await.expect("dispose timed out");
}

// ============================================================================
// Reuse
// ============================================================================

#[tokio::test]
async fn test_clean_stream_reused_by_next_accept() {
    let peer = Peer::bind(TransportOptions::default());
    let (server, client) = peer.connect().await;

    let (stream, outbound) = request(&server, &client, b"GET /a").await;
    let instance = stream.instance_id();
    assert_eq!(read_all(&stream).await.expect("read"), b"GET /a");
    respond(stream, b"a").await;
    assert_eq!(outbound.read_to_end().await.expect("response"), b"a");
    assert_eq!(server.pooled_stream_count(), 1);

    let (stream, outbound) = request(&server, &client, b"GET /b").await;
    assert_eq!(stream.instance_id(), instance);
    assert_eq!(stream.stream_id(), outbound.id());
    assert_eq!(read_all(&stream).await.expect("read"), b"GET /b");
    respond(stream, b"b").await;
    assert_eq!(outbound.read_to_end().await.expect("response"), b"b");
}

#[tokio::test]
async fn test_reused_stream_starts_with_empty_pipes() {
    let peer = Peer::bind(TransportOptions::default());
    let (server, client) = peer.connect().await;

    // The first use never reads its request; the bytes stay buffered.
    let (stream, _outbound) = request(&server, &client, b"stale request").await;
    timeout(WAIT, stream.closed_token().cancelled())
        .await
        .expect("closed");
    respond(stream, b"").await;
    assert_eq!(server.pooled_stream_count(), 1);

    let (stream, _outbound) = request(&server, &client, b"fresh").await;
    assert_eq!(read_all(&stream).await.expect("read"), b"fresh");
    respond(stream, b"").await;
}

#[tokio::test]
async fn test_pool_bound_releases_extra_stream() {
    let peer = Peer::bind(TransportOptions::default());
    let (server, client) = peer.connect().await;

    let mut streams = Vec::new();
    for _ in 0..101 {
        streams.push(request(&server, &client, b"q").await.0);
    }
    let last_instance = streams.last().map(Stream::instance_id);

    for stream in streams {
        respond(stream, b"r").await;
    }
    assert_eq!(server.pooled_stream_count(), 100);

    // Pool is LIFO; the 101st stream never entered it.
    let (stream, _outbound) = request(&server, &client, b"q").await;
    assert_ne!(Some(stream.instance_id()), last_instance);
    respond(stream, b"r").await;
}

#[tokio::test]
async fn test_persistent_state_survives_reuse_items_do_not() {
    #[derive(Debug, PartialEq)]
    struct Decoder(u32);

    let peer = Peer::bind(TransportOptions::default());
    let (server, client) = peer.connect().await;

    let (mut stream, _outbound) = request(&server, &client, b"1").await;
    stream.persistent_state().insert(Decoder(42));
    stream.items().insert("per-request");
    read_all(&stream).await.expect("read");
    respond(stream, b"").await;

    let (mut stream, _outbound) = request(&server, &client, b"2").await;
    assert_eq!(stream.persistent_state().get::<Decoder>(), Some(&Decoder(42)));
    assert!(stream.items().is_empty());
    respond(stream, b"").await;
}

// ============================================================================
// Aborts
// ============================================================================

#[tokio::test]
async fn test_peer_abort_surfaces_reset_and_prevents_reuse() {
    let peer = Peer::bind(TransportOptions::default());
    let (server, client) = peer.connect().await;

    let outbound = client.open_stream(true).await.expect("open");
    outbound.write(b"partial", false).await.expect("write");
    let stream = accept(&server).await;
    outbound.abort_write(7);

    let err = read_all(&stream).await.unwrap_err();
    assert_eq!(err, Error::stream_reset(7));
    assert!(err.is_reset());
    assert_eq!(stream.error_code(), Some(7));

    respond(stream, b"").await;
    assert_eq!(server.pooled_stream_count(), 0);
}

#[tokio::test]
async fn test_local_abort_is_idempotent_and_prevents_reuse() {
    let peer = Peer::bind(TransportOptions::default().with_default_stream_error_code(0x10c));
    let (server, client) = peer.connect().await;

    let (stream, outbound) = request(&server, &client, b"q").await;
    stream.abort(Error::aborted("cancelled"));
    stream.abort(Error::aborted("again"));

    let stats = server.raw().stats();
    assert_eq!(stats.read_aborts(), 1);
    assert_eq!(stats.write_aborts(), 1);
    assert_eq!(outbound.stopped_code(), Some(0x10c));

    timeout(WAIT, stream.dispose()).await.expect("dispose");
    assert_eq!(server.pooled_stream_count(), 0);
}

#[tokio::test]
async fn test_abort_uses_protocol_error_code() {
    let peer = Peer::bind(TransportOptions::default());
    let (server, client) = peer.connect().await;

    let outbound = client.open_stream(true).await.expect("open");
    let stream = accept(&server).await;
    stream.set_error_code(0x102);
    stream.abort(Error::aborted("request rejected"));

    let mut buf = [0u8; 8];
    let err = outbound.read(&mut buf).await.unwrap_err();
    assert_eq!(err, streamplex::TransportError::StreamAborted { code: 0x102 });
    timeout(WAIT, stream.dispose()).await.expect("dispose");
}

#[tokio::test]
async fn test_abort_write_fails_application_writes() {
    let peer = Peer::bind(TransportOptions::default());
    let (server, client) = peer.connect().await;

    let (stream, outbound) = request(&server, &client, b"q").await;
    timeout(WAIT, stream.closed_token().cancelled())
        .await
        .expect("request received");
    stream
        .abort_write(0x10b, Error::aborted("response cancelled"))
        .expect("abort write");

    timeout(WAIT, async {
        loop {
            if stream.output().write_all(b"late").await.is_err() {
                break;
            }
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("output failed");

    assert_eq!(outbound.reset_code(), Some(0x10b));
    assert_eq!(read_all(&stream).await.expect("read"), b"q");
    timeout(WAIT, stream.dispose()).await.expect("dispose");
    assert_eq!(server.pooled_stream_count(), 0);
}

#[tokio::test]
async fn test_abort_read_records_reason_for_input() {
    let peer = Peer::bind(TransportOptions::default());
    let (server, client) = peer.connect().await;

    let _outbound = client.open_stream(true).await.expect("open");
    let stream = accept(&server).await;
    stream
        .abort_read(0x10b, Error::aborted("body not needed"))
        .expect("abort read");

    let err = read_all(&stream).await.unwrap_err();
    assert_eq!(err, Error::aborted("body not needed"));
    stream.abort(Error::aborted("done"));
    timeout(WAIT, stream.dispose()).await.expect("dispose");
}

#[tokio::test]
async fn test_abort_unsupported_direction_is_rejected() {
    let peer = Peer::bind(TransportOptions::default());
    let (server, _client) = peer.connect().await;

    let control = server
        .connect(Some(StreamDirectionHint::SEND_ONLY))
        .await
        .expect("connect");
    assert!(!control.can_read());
    assert!(control.can_write());

    let err = control
        .abort_read(0x101, Error::aborted("nothing to read"))
        .unwrap_err();
    assert!(matches!(err, Error::InvalidState { .. }));

    control.abort(Error::aborted("done"));
    timeout(WAIT, control.dispose()).await.expect("dispose");
}

// ============================================================================
// Connection Abort
// ============================================================================

#[tokio::test]
async fn test_abort_during_pending_accept_reports_local_reason() {
    let peer = Peer::bind(TransportOptions::default());
    let (server, client) = peer.connect().await;

    let accepting = server.clone();
    let pending = tokio::spawn(async move {
        let cancel = CancellationToken::new();
        accepting.accept_stream(&cancel).await
    });
    tokio::task::yield_now().await;

    server.abort(Error::aborted("server shutting down"));
    server.abort(Error::aborted("ignored"));

    let result = timeout(WAIT, pending).await.expect("accept").expect("join");
    assert_eq!(result.unwrap_err(), Error::aborted("server shutting down"));

    server.dispose().await;
    assert_eq!(server.raw().stats().closes(), 1);
    assert!(client.is_closed());
}

#[tokio::test]
async fn test_cancel_after_abort_reports_local_reason() {
    let peer = Peer::bind(TransportOptions::default());
    let (server, _client) = peer.connect().await;

    server.abort(Error::aborted("going away"));
    let cancel = CancellationToken::new();
    cancel.cancel();

    let result = server.accept_stream(&cancel).await;
    assert_eq!(result.unwrap_err(), Error::aborted("going away"));
}

#[tokio::test]
async fn test_peer_close_fails_streams_and_accept() {
    let peer = Peer::bind(TransportOptions::default());
    let (server, client) = peer.connect().await;

    let _outbound = client.open_stream(true).await.expect("open");
    let stream = accept(&server).await;
    client.close(0x100).await.expect("close");

    let err = read_all(&stream).await.unwrap_err();
    assert_eq!(err, Error::connection_reset(0x100));

    let cancel = CancellationToken::new();
    let err = server.accept_stream(&cancel).await.unwrap_err();
    assert_eq!(err, Error::connection_reset(0x100));
    assert!(server.closed_token().is_cancelled());

    timeout(WAIT, stream.dispose()).await.expect("dispose");
    assert_eq!(server.pooled_stream_count(), 0);
}

// ============================================================================
// Pumps
// ============================================================================

#[tokio::test]
async fn test_send_failure_releases_paused_receive_pump() {
    let options = TransportOptions::default()
        .with_max_read_buffer_size(16)
        .with_min_alloc_buffer_size(16);
    let peer = Peer::bind(options);
    let (server, client) = peer.connect().await;

    let outbound = client.open_stream(true).await.expect("open");
    outbound.write(&[7u8; 256], false).await.expect("write");
    let stream = accept(&server).await;

    // Nobody reads the input, so the receive pump pauses on backpressure.
    tokio::task::yield_now().await;
    outbound.abort_read(9);
    stream.output().write_all(b"response").await.expect("write");

    timeout(WAIT, stream.closed_token().cancelled())
        .await
        .expect("receive pump released");

    let err = stream.input().read().await.unwrap_err();
    assert_eq!(err, Error::stream_reset(9));
    timeout(WAIT, stream.dispose()).await.expect("dispose");
}

#[tokio::test]
async fn test_input_after_graceful_send_fails_instead_of_truncating() {
    let peer = Peer::bind(TransportOptions::default());
    let (server, client) = peer.connect().await;

    let outbound = client.open_stream(true).await.expect("open");
    outbound.write(b"part1", false).await.expect("write");
    let stream = accept(&server).await;

    let first = stream.input().read().await.expect("read");
    assert_eq!(&first.buffer[..], b"part1");
    stream.input().advance(first.buffer.len());

    // Server finishes its response while the peer is still sending.
    stream.output().write_all(b"ok").await.expect("write");
    stream.output().complete(None);
    assert_eq!(outbound.read_to_end().await.expect("response"), b"ok");

    outbound.write(b"part2", false).await.expect("write");
    timeout(WAIT, stream.closed_token().cancelled())
        .await
        .expect("receive pump finished");

    let err = read_all(&stream).await.unwrap_err();
    assert_eq!(err, Error::SendCompleted);

    outbound.write(b"part3", true).await.expect("write");
    timeout(WAIT, stream.dispose()).await.expect("dispose");
    assert_eq!(server.pooled_stream_count(), 0);
}

#[tokio::test]
async fn test_final_chunk_arrives_with_completion() {
    let peer = Peer::bind(TransportOptions::default());
    let (server, client) = peer.connect().await;

    let (stream, _outbound) = request(&server, &client, b"ping").await;
    timeout(WAIT, stream.closed_token().cancelled())
        .await
        .expect("closed");

    let result = stream.input().read().await.expect("read");
    assert_eq!(&result.buffer[..], b"ping");
    assert!(result.is_completed);
    stream.input().advance(result.buffer.len());
    respond(stream, b"pong").await;
}

#[tokio::test]
async fn test_large_transfer_with_backpressure() -> anyhow::Result<()> {
    let options = TransportOptions::default()
        .with_max_read_buffer_size(1024)
        .with_max_write_buffer_size(1024)
        .with_min_alloc_buffer_size(256);
    let peer = Peer::bind(options);
    let (server, client) = peer.connect().await;

    let payload: Vec<u8> = (0..64 * 1024).map(|i| (i % 251) as u8).collect();
    let (stream, outbound) = request(&server, &client, &payload).await;

    let received = read_all(&stream).await?;
    assert_eq!(received, payload);

    for chunk in payload.chunks(4096) {
        stream.output().write_all(chunk).await?;
    }
    respond(stream, b"").await;
    assert_eq!(outbound.read_to_end().await?, payload);
    Ok(())
}

// ============================================================================
// Closed Notification
// ============================================================================

#[tokio::test]
async fn test_closed_callbacks_run_once() {
    let peer = Peer::bind(TransportOptions::default());
    let (server, client) = peer.connect().await;

    let outbound = client.open_stream(true).await.expect("open");
    let stream = accept(&server).await;

    let calls = Arc::new(AtomicUsize::new(0));
    let calls_clone = Arc::clone(&calls);
    stream.on_closed(Box::new(move || {
        calls_clone.fetch_add(1, Ordering::SeqCst);
    }));
    assert!(!stream.closed_token().is_cancelled());

    outbound.write(b"bye", true).await.expect("write");
    timeout(WAIT, stream.closed_token().cancelled())
        .await
        .expect("closed");
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // Registered after closure: never runs.
    let late = Arc::clone(&calls);
    stream.on_closed(Box::new(move || {
        late.fetch_add(1, Ordering::SeqCst);
    }));
    respond(stream, b"").await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_duplex_transport_identity() {
    let peer = Peer::bind(TransportOptions::default());
    let (server, client) = peer.connect().await;

    let (stream, _outbound) = request(&server, &client, b"q").await;
    assert_eq!(
        stream.connection_id(),
        format!("{}:{}", server.id(), stream.stream_id())
    );
    assert_eq!(DuplexTransport::local_addr(&stream), addr());
    assert_eq!(DuplexTransport::remote_addr(&stream), client.local_addr());
    respond(stream, b"").await;
}

// ============================================================================
// Heartbeat Expiry
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_bundled_heartbeat_expires_pooled_streams() {
    let (raw, connector) = MemoryListener::bind(addr(), None);
    let listener = Listener::builder()
        .options(TransportOptions::default().with_stream_pool_expiry(Duration::from_secs(5)))
        .bind(raw)
        .expect("bind");

    let client = connector.connect().expect("connect");
    let server = listener.accept().await.expect("accept").expect("connection");

    let (stream, _outbound) = request(&server, &client, b"q").await;
    respond(stream, b"r").await;
    assert_eq!(server.pooled_stream_count(), 1);

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(server.pooled_stream_count(), 1);

    tokio::time::sleep(Duration::from_secs(4)).await;
    assert_eq!(server.pooled_stream_count(), 0);

    server.dispose().await;
    listener.unbind().await;
}
