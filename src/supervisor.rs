use std::sync::Arc;

use tokio::sync::watch;
use tracing::{info, warn};

use crate::api;
use crate::config::AppConfig;
use crate::error::Result;
use crate::health::HealthChecker;
use crate::proxy::{run_http_listener, run_socks5_listener};
use crate::scheduler::SchedulerRegistry;
use crate::store::NodeStore;

/// Owns every long-running task this gateway runs: the SOCKS5 and HTTP
/// proxy front-ends, the admin API, and the background health checker.
/// Boots them all, then waits for a shutdown signal and tears them down.
pub struct Supervisor {
    config: AppConfig,
    store: Arc<NodeStore>,
    registry: Arc<SchedulerRegistry>,
}

impl Supervisor {
    pub async fn bootstrap(config: AppConfig) -> Result<Self> {
        let store = Arc::new(NodeStore::new(&config.database.connection_url(), config.database.max_connections).await?);
        let registry = Arc::new(SchedulerRegistry::default());
        Ok(Self {
            config,
            store,
            registry,
        })
    }

    pub async fn run(self) -> Result<()> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let health_checker = Arc::new(HealthChecker::new(self.store.clone(), self.config.health_check.clone()));
        let health_task = {
            let checker = health_checker.clone();
            let rx = shutdown_rx.clone();
            tokio::spawn(async move { checker.run(rx).await })
        };

        let socks5_task = tokio::spawn(run_socks5_listener(
            self.config.listen_host.clone(),
            self.config.socks5_port,
            self.store.clone(),
            self.registry.clone(),
        ));

        let http_task = tokio::spawn(run_http_listener(
            self.config.listen_host.clone(),
            self.config.http_proxy_port,
            self.store.clone(),
            self.registry.clone(),
        ));

        let api_state = api::AppState {
            store: self.store.clone(),
            registry: self.registry.clone(),
            health_checker: health_checker.clone(),
        };
        let api_task = {
            let listen_host = self.config.listen_host.clone();
            let api_port = self.config.api_port;
            tokio::spawn(async move { api::serve(listen_host, api_port, api_state).await })
        };

        shutdown_signal().await;
        info!("shutdown signal received, stopping front-ends");
        shutdown_tx.send(true).ok();

        socks5_task.abort();
        http_task.abort();
        api_task.abort();

        if let Err(e) = health_task.await {
            if !e.is_cancelled() {
                warn!(error = %e, "health checker task exited unexpectedly");
            }
        }

        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install sigterm handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
