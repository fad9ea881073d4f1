pub mod http;
pub mod relay;
pub mod socks5;

use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{error, info};

use crate::error::Result;
use crate::scheduler::SchedulerRegistry;
use crate::store::NodeStore;

/// The client's requested destination, parsed from either the SOCKS5
/// `CONNECT` request or the HTTP `CONNECT`/absolute-form request line.
/// Kept around (rather than discarded once a node is picked) so a future
/// revision that performs a real upstream handshake has the target
/// without re-parsing the client's original bytes.
#[derive(Debug, Clone)]
pub struct ConnectTarget {
    pub host: String,
    pub port: u16,
}

/// Accepts SOCKS5 client connections and spawns one task per connection.
pub async fn run_socks5_listener(
    listen_host: String,
    port: u16,
    store: Arc<NodeStore>,
    registry: Arc<SchedulerRegistry>,
) -> Result<()> {
    let listener = TcpListener::bind((listen_host.as_str(), port)).await?;
    info!(port, "socks5 front-end listening");

    loop {
        let (socket, peer) = listener.accept().await?;
        let store = store.clone();
        let scheduler = registry.get_scheduler();
        tokio::spawn(async move {
            if let Err(e) = socks5::handle(socket, store, scheduler).await {
                error!(%peer, error = %e, "socks5 session ended with error");
            }
        });
    }
}

/// Accepts HTTP proxy client connections (CONNECT tunnels and plain
/// absolute-form requests) and spawns one task per connection.
pub async fn run_http_listener(
    listen_host: String,
    port: u16,
    store: Arc<NodeStore>,
    registry: Arc<SchedulerRegistry>,
) -> Result<()> {
    let listener = TcpListener::bind((listen_host.as_str(), port)).await?;
    info!(port, "http proxy front-end listening");

    loop {
        let (socket, peer) = listener.accept().await?;
        let store = store.clone();
        let scheduler = registry.get_scheduler();
        tokio::spawn(async move {
            if let Err(e) = http::handle(socket, store, scheduler).await {
                error!(%peer, error = %e, "http proxy session ended with error");
            }
        });
    }
}
