use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinSet;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::config::HealthCheckConfig;
use crate::domain::HealthCheckResult;
use crate::error::Result;
use crate::store::NodeStore;

/// Background health checker. Periodically dials every active node's
/// target URL *through that node* (the node is used as the proxy for its
/// own probe request) and commits the batch of results in one
/// transaction.
pub struct HealthChecker {
    store: Arc<NodeStore>,
    config: HealthCheckConfig,
}

impl HealthChecker {
    pub fn new(store: Arc<NodeStore>, config: HealthCheckConfig) -> Self {
        Self { store, config }
    }

    /// Probes every active node concurrently and commits the batch. Called
    /// both by the periodic loop and by the admin API's on-demand
    /// `POST /api/health-check`.
    pub async fn check_all(&self) -> Result<usize> {
        let nodes = self.store.list_active().await?;
        if nodes.is_empty() {
            return Ok(0);
        }

        let mut joins = JoinSet::new();
        for node in nodes {
            let url = self.config.url.clone();
            let timeout = Duration::from_secs(self.config.timeout_secs);
            joins.spawn(async move {
                let result = probe_one(&node.probe_proxy_url(), &url, timeout).await;
                (node.id, result)
            });
        }

        let mut results = Vec::new();
        while let Some(joined) = joins.join_next().await {
            match joined {
                Ok((id, result)) => results.push((id, result)),
                Err(e) => error!(error = %e, "health probe task panicked"),
            }
        }

        let checked = results.len();
        self.store.apply_probe_results(&results).await?;
        info!(checked, "health check tick committed");
        Ok(checked)
    }

    /// Probes immediately on entry, then every `interval_secs` after that,
    /// backing off 10s on error instead of busy-looping.
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        loop {
            if let Err(e) = self.check_all().await {
                warn!(error = %e, "health check tick failed, backing off");
                tokio::select! {
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            info!("health checker shutting down");
                            return;
                        }
                    }
                    _ = sleep(Duration::from_secs(10)) => {}
                }
                continue;
            }

            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("health checker shutting down");
                        return;
                    }
                }
                _ = sleep(Duration::from_secs(self.config.interval_secs)) => {}
            }
        }
    }
}

async fn probe_one(proxy_url: &str, target_url: &str, timeout: Duration) -> HealthCheckResult {
    let started = Instant::now();

    let client = match reqwest::Client::builder()
        .proxy(match reqwest::Proxy::all(proxy_url) {
            Ok(p) => p,
            Err(e) => return HealthCheckResult::failure(format!("invalid proxy url: {e}")),
        })
        .timeout(timeout)
        .build()
    {
        Ok(c) => c,
        Err(e) => return HealthCheckResult::failure(format!("client build failed: {e}")),
    };

    match client.get(target_url).send().await {
        Ok(resp) if resp.status() == reqwest::StatusCode::OK => {
            HealthCheckResult::success(started.elapsed().as_secs_f64() * 1000.0)
        }
        Ok(resp) => HealthCheckResult::failure(format!("unexpected status {}", resp.status())),
        Err(e) => HealthCheckResult::failure(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_result_carries_the_sentinel_latency() {
        let result = HealthCheckResult::failure("boom");
        assert_eq!(result.response_time_ms, HealthCheckResult::FAILURE_SENTINEL_MS);
        assert!(!result.success);
    }
}
