use std::time::Instant;

use tokio::io::copy_bidirectional;
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::Result;

/// Dials a node's `host:port` directly over raw TCP.
///
/// This is the documented simplification at the center of this gateway:
/// front-ends do not speak the node's own proxy protocol (SOCKS5/HTTP) to
/// negotiate the client's requested target through it. They dial the node
/// itself and relay bytes verbatim in both directions. A future revision
/// that wants a real upstream handshake has everything it needs — the
/// front-ends already preserve the client's parsed target — but performing
/// that handshake is out of scope here.
pub async fn dial_upstream(host: &str, port: u16) -> Result<TcpStream> {
    let stream = TcpStream::connect((host, port)).await?;
    Ok(stream)
}

/// Relays bytes between a client connection and an upstream connection
/// until either side closes, returning the elapsed wall time in
/// milliseconds for the scheduler's `report_success` feedback.
pub async fn relay(mut client: TcpStream, mut upstream: TcpStream) -> Result<f64> {
    let started = Instant::now();
    let (from_client, from_upstream) = copy_bidirectional(&mut client, &mut upstream).await?;
    let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
    debug!(from_client, from_upstream, elapsed_ms, "relay session ended");
    Ok(elapsed_ms)
}
