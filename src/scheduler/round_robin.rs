use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use async_trait::async_trait;

use crate::domain::ProxyNode;
use crate::error::{ProxyPoolError, Result};
use crate::store::NodeStore;

use super::{claim, release, Scheduler, SchedulerKind};

/// Weighted round robin by projected relative load: each candidate's
/// `(current_connections + 1) / weight` is computed as if it were picked
/// next, and the node with the smallest projected load wins — so a node
/// with weight 3 absorbs three connections for every one a weight-1 node
/// gets before the two come due again. Ties (same projected load) go to
/// the higher-weight node first, then to whichever candidate was least
/// recently used.
#[derive(Debug, Default)]
pub struct RoundRobinScheduler {
    last_used: Mutex<HashMap<i64, Instant>>,
}

impl RoundRobinScheduler {
    fn projected_load(node: &ProxyNode) -> f64 {
        (node.current_connections as f64 + 1.0) / node.weight.max(1) as f64
    }

    fn select<'a>(&self, candidates: &'a [ProxyNode]) -> &'a ProxyNode {
        let last_used = self.last_used.lock().expect("last_used mutex poisoned");
        candidates
            .iter()
            .min_by(|a, b| {
                Self::projected_load(a)
                    .partial_cmp(&Self::projected_load(b))
                    .unwrap()
                    .then_with(|| b.weight.cmp(&a.weight))
                    .then_with(|| last_used.get(&a.id).cmp(&last_used.get(&b.id)))
                    .then_with(|| a.id.cmp(&b.id))
            })
            .expect("candidates is non-empty")
    }
}

#[async_trait]
impl Scheduler for RoundRobinScheduler {
    async fn pick(&self, store: &NodeStore) -> Result<ProxyNode> {
        let candidates = store.list_candidates().await?;
        if candidates.is_empty() {
            return Err(ProxyPoolError::NoUpstreamAvailable);
        }

        let chosen = self.select(&candidates).clone();
        self.last_used
            .lock()
            .expect("last_used mutex poisoned")
            .insert(chosen.id, Instant::now());

        claim(store, &chosen).await?;
        Ok(chosen)
    }

    async fn report_success(&self, store: &NodeStore, node_id: i64, _response_time_ms: f64) -> Result<()> {
        release(store, node_id).await
    }

    async fn report_failure(&self, store: &NodeStore, node_id: i64) -> Result<()> {
        release(store, node_id).await
    }

    fn kind(&self) -> SchedulerKind {
        SchedulerKind::WeightedRoundRobin
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::NodeProtocol;
    use chrono::Utc;

    fn node(id: i64, weight: i32, current_connections: i32) -> ProxyNode {
        let now = Utc::now();
        ProxyNode {
            id,
            name: None,
            host: "h".to_string(),
            port: 1,
            protocol: NodeProtocol::Http,
            username: None,
            password: None,
            is_active: true,
            is_healthy: true,
            response_time_ms: 50.0,
            success_rate: 99.0,
            weight,
            max_connections: 100,
            current_connections,
            country: None,
            region: None,
            tags: None,
            created_at: now,
            updated_at: now,
            last_check: None,
        }
    }

    #[test]
    fn kind_is_weighted_round_robin() {
        assert_eq!(
            RoundRobinScheduler::default().kind(),
            SchedulerKind::WeightedRoundRobin
        );
    }

    /// weight(A)=1, weight(B)=3 over four consecutive selections (no
    /// release in between, so `current_connections` climbs exactly like a
    /// per-node pick tally) must yield B, B, B, A.
    #[test]
    fn weighted_selection_favors_heavier_node_three_to_one() {
        let scheduler = RoundRobinScheduler::default();
        let mut pool = vec![node(1, 1, 0), node(2, 3, 0)];

        let mut order = Vec::new();
        for _ in 0..4 {
            let chosen_id = scheduler.select(&pool).id;
            order.push(chosen_id);
            scheduler
                .last_used
                .lock()
                .unwrap()
                .insert(chosen_id, Instant::now());
            for n in pool.iter_mut() {
                if n.id == chosen_id {
                    n.current_connections += 1;
                }
            }
        }

        assert_eq!(order, vec![2, 2, 2, 1]);
    }
}
