//! Echo server over the in-memory loopback transport.
//!
//! Demonstrates:
//! - Binding a Listener with the bundled heartbeat
//! - Serving request streams and echoing their bodies
//! - Stream reuse across requests (same instance ID)
//! - A peer abort surfacing as a reset and skipping the pool
//!
//! Usage:
//!   cargo run --example loopback_echo
//!   cargo run --example loopback_echo -- --debug

// ============================================================================
// Imports
// ============================================================================

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use streamplex::raw::memory::{MemoryConnection, MemoryListener};
use streamplex::raw::{RawConnection, RawStream};
use streamplex::{Connection, Error, Listener, Result, Stream, TransportOptions};

// ============================================================================
// Constants
// ============================================================================

const REQUESTS: &[&str] = &["GET /alpha", "GET /beta", "GET /gamma"];

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() {
    let debug = std::env::args().any(|a| a == "--debug");
    let filter = if debug { "streamplex=trace" } else { "streamplex=info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_target(false)
        .init();

    if let Err(e) = run().await {
        eprintln!("\n[ERROR] {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    println!("=== Loopback Echo ===\n");

    // ========================================================================
    // Bind
    // ========================================================================

    println!("[1] Binding listener...");

    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 4433);
    let (raw, connector) = MemoryListener::bind(addr, Some(b"echo/1"));
    let listener = Listener::builder()
        .options(TransportOptions::default())
        .bind(raw)?;

    println!("    ✓ Listening on {}\n", listener.local_addr());

    let client = connector.connect()?;
    let Some(server) = listener.accept().await? else {
        return Err(Error::invalid_state("Listener closed before accepting"));
    };
    println!("    ✓ Connection {} accepted\n", server.id());

    let cancel = CancellationToken::new();
    let serving = tokio::spawn(serve(server.clone(), cancel.clone()));

    // ========================================================================
    // Requests
    // ========================================================================

    println!("[2] Sending requests...");

    for body in REQUESTS {
        let outbound = client.open_stream(true).await?;
        outbound.write(body.as_bytes(), true).await?;
        let response = outbound.read_to_end().await?;
        println!(
            "    ✓ {body} -> {} (pooled: {})",
            String::from_utf8_lossy(&response),
            server.pooled_stream_count()
        );
    }
    println!();

    // ========================================================================
    // Peer Abort
    // ========================================================================

    println!("[3] Aborting a request mid-body...");

    let outbound = client.open_stream(true).await?;
    outbound.write(b"PUT /partial", false).await?;
    tokio::task::yield_now().await;
    outbound.abort_write(0x10c);
    tokio::task::yield_now().await;

    println!("    ✓ Pooled streams: {}\n", server.pooled_stream_count());

    // ========================================================================
    // Cleanup
    // ========================================================================

    println!("[Cleanup] Disposing...");
    cancel.cancel();
    if let Ok(Err(e)) = serving.await {
        println!("          - Serve loop ended: {e}");
    }
    server.dispose().await;
    client.close(0).await?;
    listener.unbind().await;
    println!("          ✓ Done");

    Ok(())
}

// ============================================================================
// Server
// ============================================================================

async fn serve(connection: Connection<MemoryConnection>, cancel: CancellationToken) -> Result<()> {
    while let Some(stream) = connection.accept_stream(&cancel).await? {
        tokio::spawn(echo(stream));
    }
    Ok(())
}

async fn echo(stream: Stream<MemoryConnection>) {
    let instance = stream.instance_id();
    let input = stream.input();
    let mut body = Vec::new();

    let outcome = loop {
        match input.read().await {
            Ok(result) => {
                body.extend_from_slice(&result.buffer);
                input.advance(result.buffer.len());
                if result.is_completed {
                    break Ok(());
                }
            }
            Err(e) => break Err(e),
        }
    };

    match outcome {
        Ok(()) => {
            println!("    · {} instance #{instance}", stream.display_id());
            let _ = stream.output().write_all(&body).await;
        }
        Err(e) => println!("    · {} failed: {e}", stream.display_id()),
    }
    stream.dispose().await;
}
