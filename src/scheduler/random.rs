use async_trait::async_trait;
use rand::seq::SliceRandom;

use crate::domain::ProxyNode;
use crate::error::{ProxyPoolError, Result};
use crate::store::NodeStore;

use super::{claim, release, Scheduler, SchedulerKind};

/// Picks uniformly at random among the candidate set. The simplest policy
/// and the registry's default.
#[derive(Debug, Default)]
pub struct RandomScheduler;

#[async_trait]
impl Scheduler for RandomScheduler {
    async fn pick(&self, store: &NodeStore) -> Result<ProxyNode> {
        let candidates = store.list_candidates().await?;
        let node = candidates
            .choose(&mut rand::thread_rng())
            .cloned()
            .ok_or(ProxyPoolError::NoUpstreamAvailable)?;
        claim(store, &node).await?;
        Ok(node)
    }

    async fn report_success(&self, store: &NodeStore, node_id: i64, _response_time_ms: f64) -> Result<()> {
        release(store, node_id).await
    }

    async fn report_failure(&self, store: &NodeStore, node_id: i64) -> Result<()> {
        release(store, node_id).await
    }

    fn kind(&self) -> SchedulerKind {
        SchedulerKind::Random
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_is_random() {
        assert_eq!(RandomScheduler.kind(), SchedulerKind::Random);
    }
}
