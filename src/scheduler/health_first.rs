use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::seq::SliceRandom;

use crate::domain::ProxyNode;
use crate::error::{ProxyPoolError, Result};
use crate::store::NodeStore;

use super::{claim, release, Scheduler, SchedulerKind};

const SCORE_CACHE_TTL: Duration = Duration::from_secs(60);

/// Deterministic composite-score selection: `score = 0.4*resp + 0.3*succ +
/// 0.2*load + 0.1*wt`, argmax wins, ties broken uniformly at random among
/// the exactly-tied candidates. Scores are cached per node for 60s since
/// they only change on a feedback report or a health probe, and are
/// invalidated eagerly by `report_success`/`report_failure`.
#[derive(Debug, Default)]
pub struct HealthFirstScheduler {
    cache: Mutex<HashMap<i64, (f64, Instant)>>,
}

impl HealthFirstScheduler {
    fn raw_score(node: &ProxyNode) -> f64 {
        let resp = (100.0 - node.response_time_ms.min(1000.0) / 10.0).max(0.0);
        let succ = node.success_rate;
        let load = 100.0
            * (1.0 - (node.current_connections as f64 / node.max_connections.max(1) as f64).min(1.0));
        let wt = (node.weight as f64 * 10.0).min(100.0);
        0.4 * resp + 0.3 * succ + 0.2 * load + 0.1 * wt
    }

    fn score(&self, node: &ProxyNode) -> f64 {
        let mut cache = self.cache.lock().expect("score cache mutex poisoned");
        if let Some((score, cached_at)) = cache.get(&node.id) {
            if cached_at.elapsed() < SCORE_CACHE_TTL {
                return *score;
            }
        }
        let score = Self::raw_score(node);
        cache.insert(node.id, (score, Instant::now()));
        score
    }

    fn invalidate(&self, node_id: i64) {
        self.cache
            .lock()
            .expect("score cache mutex poisoned")
            .remove(&node_id);
    }

    fn select<'a>(&self, candidates: &'a [ProxyNode]) -> &'a ProxyNode {
        let scored: Vec<(f64, &ProxyNode)> = candidates.iter().map(|n| (self.score(n), n)).collect();
        let best = scored
            .iter()
            .map(|(score, _)| *score)
            .fold(f64::MIN, f64::max);
        let tied: Vec<&ProxyNode> = scored
            .into_iter()
            .filter(|(score, _)| *score == best)
            .map(|(_, node)| node)
            .collect();
        tied.choose(&mut rand::thread_rng())
            .expect("candidates is non-empty")
    }
}

#[async_trait]
impl Scheduler for HealthFirstScheduler {
    async fn pick(&self, store: &NodeStore) -> Result<ProxyNode> {
        let candidates = store.list_candidates().await?;
        if candidates.is_empty() {
            return Err(ProxyPoolError::NoUpstreamAvailable);
        }

        let chosen = self.select(&candidates).clone();
        claim(store, &chosen).await?;
        Ok(chosen)
    }

    async fn report_success(&self, store: &NodeStore, node_id: i64, response_time_ms: f64) -> Result<()> {
        release(store, node_id).await?;
        store.apply_success_response_time(node_id, response_time_ms).await?;
        self.invalidate(node_id);
        Ok(())
    }

    async fn report_failure(&self, store: &NodeStore, node_id: i64) -> Result<()> {
        release(store, node_id).await?;
        store.apply_failure_success_rate_penalty(node_id).await?;
        self.invalidate(node_id);
        Ok(())
    }

    fn kind(&self) -> SchedulerKind {
        SchedulerKind::HealthFirst
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

    fn sample(id: i64, response_time_ms: f64, success_rate: f64) -> ProxyNode {
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
            response_time_ms,
            success_rate,
            weight: 1,
            max_connections: 100,
            current_connections: 0,
            country: None,
            region: None,
            tags: None,
            created_at: now,
            updated_at: now,
            last_check: None,
        }
    }

    #[test]
    fn faster_node_scores_higher() {
        let fast = sample(1, 10.0, 100.0);
        let slow = sample(2, 1000.0, 100.0);
        assert!(HealthFirstScheduler::raw_score(&fast) > HealthFirstScheduler::raw_score(&slow));
    }

    #[test]
    fn zero_success_rate_still_yields_positive_weight() {
        let node = sample(1, 100.0, 0.0);
        assert!(HealthFirstScheduler::raw_score(&node) > 0.0);
    }

    /// Two nodes with identical fields must score identically and the
    /// random tie-break must land on each roughly half the time.
    #[test]
    fn exact_ties_split_roughly_evenly() {
        let scheduler = HealthFirstScheduler::default();
        let a = sample(1, 50.0, 95.0);
        let b = sample(2, 50.0, 95.0);
        let pool = [a, b];

        let mut counts = [0u32; 2];
        for _ in 0..1000 {
            let chosen = scheduler.select(&pool);
            counts[(chosen.id - 1) as usize] += 1;
        }

        assert!(counts[0] >= 400 && counts[0] <= 600, "counts = {counts:?}");
        assert!(counts[1] >= 400 && counts[1] <= 600, "counts = {counts:?}");
    }

    #[test]
    fn score_cache_invalidates_on_feedback() {
        let scheduler = HealthFirstScheduler::default();
        let node = sample(1, 50.0, 95.0);
        let first = scheduler.score(&node);
        assert!(scheduler.cache.lock().unwrap().contains_key(&1));

        scheduler.invalidate(1);
        assert!(!scheduler.cache.lock().unwrap().contains_key(&1));

        let degraded = sample(1, 900.0, 10.0);
        let second = scheduler.score(&degraded);
        assert!(second < first);
    }
}
