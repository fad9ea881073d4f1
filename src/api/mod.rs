mod handlers;
mod routes;
mod state;

pub use state::AppState;

use tracing::info;

use crate::error::Result;

/// Serves the admin HTTP API. Thin by design: every handler delegates
/// straight to the store, scheduler registry, or health checker.
pub async fn serve(listen_host: String, port: u16, state: AppState) -> Result<()> {
    let app = routes::build(state);
    let listener = tokio::net::TcpListener::bind((listen_host.as_str(), port)).await?;
    info!(port, "admin api listening");
    axum::serve(listener, app).await?;
    Ok(())
}
