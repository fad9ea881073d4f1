mod health_first;
mod random;
mod round_robin;
pub mod rule_based;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use async_trait::async_trait;

use crate::domain::ProxyNode;
use crate::error::{ProxyPoolError, Result};
use crate::store::NodeStore;

pub use health_first::HealthFirstScheduler;
pub use random::RandomScheduler;
pub use round_robin::RoundRobinScheduler;
pub use rule_based::RuleBasedScheduler;

/// The pluggable upstream-selection strategy. Front-ends call `pick`
/// exactly once per inbound connection and must report the outcome back
/// through `report_success`/`report_failure` — the original Python
/// implementation defined these callbacks but its front-ends never called
/// them, which left the health-weighted policies starved of feedback.
#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Selects a candidate node, bumping its `current_connections` by one.
    /// Returns `Err(ProxyPoolError::NoUpstreamAvailable)` when the
    /// candidate set (`is_active AND is_healthy`) is empty.
    async fn pick(&self, store: &NodeStore) -> Result<ProxyNode>;

    /// Called by a front-end once a relay session to `node_id` finishes
    /// successfully. `response_time_ms` is the dial latency observed by
    /// the front-end, not a health-check probe.
    async fn report_success(&self, store: &NodeStore, node_id: i64, response_time_ms: f64) -> Result<()>;

    /// Called by a front-end when dialing or relaying to `node_id` failed.
    async fn report_failure(&self, store: &NodeStore, node_id: i64) -> Result<()>;

    fn kind(&self) -> SchedulerKind;

    /// Lets the admin API downcast to `RuleBasedScheduler` to manage rules
    /// when that policy is active; every other policy just returns `self`.
    fn as_any(&self) -> &dyn std::any::Any;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerKind {
    Random,
    WeightedRoundRobin,
    HealthFirst,
    RuleBased,
}

impl SchedulerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Random => "random",
            Self::WeightedRoundRobin => "weighted_round_robin",
            Self::HealthFirst => "health_first",
            Self::RuleBased => "rule_based",
        }
    }
}

impl fmt::Display for SchedulerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SchedulerKind {
    type Err = ProxyPoolError;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "random" => Ok(Self::Random),
            "weighted_round_robin" | "round_robin" | "weighted-round-robin" => {
                Ok(Self::WeightedRoundRobin)
            }
            "health_first" | "health-first" | "health_weighted" => Ok(Self::HealthFirst),
            "rule_based" | "rule-based" => Ok(Self::RuleBased),
            other => Err(ProxyPoolError::Internal(format!(
                "unknown scheduler kind: {other}"
            ))),
        }
    }
}

fn build(kind: SchedulerKind) -> Arc<dyn Scheduler> {
    match kind {
        SchedulerKind::Random => Arc::new(RandomScheduler::default()),
        SchedulerKind::WeightedRoundRobin => Arc::new(RoundRobinScheduler::default()),
        SchedulerKind::HealthFirst => Arc::new(HealthFirstScheduler::default()),
        SchedulerKind::RuleBased => Arc::new(RuleBasedScheduler::default()),
    }
}

/// Process-wide, hot-swappable current scheduler. The admin API's
/// `PUT /api/scheduler` replaces the active policy without restarting any
/// front-end; in-flight `pick` calls hold their own `Arc` and are
/// unaffected by a subsequent swap.
pub struct SchedulerRegistry {
    current: ArcSwapOption<(SchedulerKind, Arc<dyn Scheduler>)>,
}

impl SchedulerRegistry {
    pub fn new(initial: SchedulerKind) -> Self {
        let registry = Self {
            current: ArcSwapOption::from(None),
        };
        registry.set_scheduler(initial);
        registry
    }

    pub fn set_scheduler(&self, kind: SchedulerKind) {
        self.current.store(Some(Arc::new((kind, build(kind)))));
    }

    /// Returns the active scheduler, lazily constructing the default
    /// (`health_first`) if `set_scheduler` was never called.
    pub fn get_scheduler(&self) -> Arc<dyn Scheduler> {
        match self.current.load_full() {
            Some(pair) => pair.1.clone(),
            None => {
                self.set_scheduler(SchedulerKind::HealthFirst);
                self.current.load_full().expect("just set").1.clone()
            }
        }
    }

    pub fn current_kind(&self) -> SchedulerKind {
        match self.current.load_full() {
            Some(pair) => pair.0,
            None => SchedulerKind::HealthFirst,
        }
    }
}

impl Default for SchedulerRegistry {
    fn default() -> Self {
        Self::new(SchedulerKind::HealthFirst)
    }
}

/// Shared helper: bumps `current_connections` on the picked node. Every
/// policy calls this at the end of `pick` so the bookkeeping lives in one
/// place.
pub(crate) async fn claim(store: &NodeStore, node: &ProxyNode) -> Result<()> {
    store.adjust_connections(node.id, 1).await
}

pub(crate) async fn release(store: &NodeStore, node_id: i64) -> Result<()> {
    store.adjust_connections(node_id, -1).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheduler_kind_round_trips() {
        for kind in [
            SchedulerKind::Random,
            SchedulerKind::WeightedRoundRobin,
            SchedulerKind::HealthFirst,
            SchedulerKind::RuleBased,
        ] {
            assert_eq!(SchedulerKind::from_str(kind.as_str()).unwrap(), kind);
        }
    }

    #[test]
    fn registry_defaults_to_health_first() {
        let registry = SchedulerRegistry::default();
        assert_eq!(registry.current_kind(), SchedulerKind::HealthFirst);
        assert_eq!(registry.get_scheduler().kind(), SchedulerKind::HealthFirst);
    }

    #[test]
    fn registry_swaps_kind() {
        let registry = SchedulerRegistry::default();
        registry.set_scheduler(SchedulerKind::HealthFirst);
        assert_eq!(registry.current_kind(), SchedulerKind::HealthFirst);
    }
}
