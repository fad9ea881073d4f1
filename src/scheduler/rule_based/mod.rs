pub mod expr;

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::domain::ProxyNode;
use crate::error::{ProxyPoolError, Result};
use crate::store::NodeStore;

use self::expr::Expr;
use super::{claim, release, Scheduler, SchedulerKind};

/// A single routing rule: `priority` is added to a node's score whenever
/// `condition` evaluates true for it. Rules are keyed by `name`, not a
/// generated id, so operators can `add`/`remove` them by the identifier
/// they chose.
#[derive(Debug, Clone)]
pub struct Rule {
    pub name: String,
    pub priority: i32,
    pub condition: String,
    compiled: Arc<Expr>,
}

/// Rule-based scheduler. A node's score is the sum of `priority` over
/// every rule whose condition matches it; `pick` returns the argmax,
/// breaking ties by ascending node id. Rules live in an in-memory
/// `DashMap` keyed by name — the parsed `Expr` is cached on the `Rule`
/// itself at insert time so `pick` never re-parses a condition string.
#[derive(Default)]
pub struct RuleBasedScheduler {
    rules: DashMap<String, Rule>,
}

impl RuleBasedScheduler {
    pub fn add_rule(&self, name: &str, priority: i32, condition: &str) -> Result<()> {
        let compiled = expr::parse(condition)?;
        self.rules.insert(
            name.to_string(),
            Rule {
                name: name.to_string(),
                priority,
                condition: condition.to_string(),
                compiled: Arc::new(compiled),
            },
        );
        Ok(())
    }

    pub fn remove_rule(&self, name: &str) -> bool {
        self.rules.remove(name).is_some()
    }

    pub fn clear_rules(&self) {
        self.rules.clear();
    }

    pub fn list_rules(&self) -> Vec<Rule> {
        let mut rules: Vec<Rule> = self.rules.iter().map(|r| r.value().clone()).collect();
        rules.sort_by(|a, b| a.name.cmp(&b.name));
        rules
    }

    /// Score of a node is the sum of `priority` over every rule whose
    /// condition matches it. Unresolvable fields evaluate to `Null`
    /// (falsy), so a rule referencing them simply contributes zero
    /// rather than erroring.
    fn score(&self, rules: &[Rule], node: &ProxyNode) -> i32 {
        rules
            .iter()
            .filter(|rule| expr::eval(&rule.compiled, node))
            .map(|rule| rule.priority)
            .sum()
    }

    fn select<'a>(&self, candidates: &'a [ProxyNode]) -> Option<&'a ProxyNode> {
        let rules = self.list_rules();
        candidates
            .iter()
            .map(|node| (self.score(&rules, node), node))
            .max_by(|a, b| a.0.cmp(&b.0).then_with(|| b.1.id.cmp(&a.1.id)))
            .map(|(_, node)| node)
    }
}

#[async_trait]
impl Scheduler for RuleBasedScheduler {
    async fn pick(&self, store: &NodeStore) -> Result<ProxyNode> {
        let candidates = store.list_candidates().await?;
        let chosen = self
            .select(&candidates)
            .cloned()
            .ok_or(ProxyPoolError::NoUpstreamAvailable)?;
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
        SchedulerKind::RuleBased
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

    fn node(id: i64, country: &str, tags: Option<&str>) -> ProxyNode {
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
            weight: 1,
            max_connections: 100,
            current_connections: 0,
            country: Some(country.to_string()),
            region: None,
            tags: tags.map(str::to_string),
            created_at: now,
            updated_at: now,
            last_check: None,
        }
    }

    /// spec §8 scenario 6: rules `country == 'US'` (priority 80) and
    /// `'premium' in tags` (priority 60); node A matches only the first,
    /// node B matches only the second. A wins on summed score (80 > 60).
    #[test]
    fn summed_priority_picks_highest_scoring_node() {
        let scheduler = RuleBasedScheduler::default();
        scheduler.add_rule("us", 80, "country == 'US'").unwrap();
        scheduler.add_rule("premium", 60, "'premium' in tags").unwrap();

        let a = node(1, "US", Some("basic"));
        let b = node(2, "JP", Some("premium,x"));
        let candidates = vec![a, b];

        let chosen = scheduler.select(&candidates).unwrap();
        assert_eq!(chosen.id, 1);
    }

    #[test]
    fn matching_multiple_rules_sums_their_priorities() {
        let scheduler = RuleBasedScheduler::default();
        scheduler.add_rule("us", 10, "country == 'US'").unwrap();
        scheduler.add_rule("premium", 10, "'premium' in tags").unwrap();

        let both = node(1, "US", Some("premium"));
        let one = node(2, "US", Some("basic"));
        let candidates = vec![both, one];

        let chosen = scheduler.select(&candidates).unwrap();
        assert_eq!(chosen.id, 1);
    }

    #[test]
    fn falls_back_to_tie_break_when_no_rule_matches() {
        let scheduler = RuleBasedScheduler::default();
        scheduler.add_rule("fr", 1, "country == 'FR'").unwrap();

        let candidates = vec![node(1, "DE", None), node(2, "US", None)];
        let chosen = scheduler.select(&candidates).unwrap();
        assert_eq!(chosen.id, 1, "both score 0, tie-break picks ascending id");
    }

    #[test]
    fn remove_rule_drops_it_from_consideration() {
        let scheduler = RuleBasedScheduler::default();
        scheduler.add_rule("us", 1, "country == 'US'").unwrap();
        assert!(scheduler.remove_rule("us"));
        assert!(scheduler.list_rules().is_empty());
    }
}
