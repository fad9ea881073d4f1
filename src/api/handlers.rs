use std::str::FromStr;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::domain::{NodeCreate, NodeFilter, NodePatch, NodeProtocol, PoolStatistics, ProxyNode};
use crate::error::{ProxyPoolError, Result};
use crate::scheduler::{RuleBasedScheduler, SchedulerKind};

use super::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    is_active: Option<bool>,
    is_healthy: Option<bool>,
    protocol: Option<String>,
    country: Option<String>,
    search: Option<String>,
    #[serde(default)]
    skip: i64,
    #[serde(default = "default_limit")]
    limit: i64,
}

fn default_limit() -> i64 {
    100
}

pub async fn list_nodes(
    State(state): State<AppState>,
    Query(q): Query<ListQuery>,
) -> Result<Json<Vec<ProxyNode>>> {
    let filter = NodeFilter {
        is_active: q.is_active,
        is_healthy: q.is_healthy,
        protocol: q.protocol.as_deref().map(NodeProtocol::from_str).transpose()
            .map_err(ProxyPoolError::Internal)?,
        country: q.country,
        search: q.search,
    };
    let nodes = state.store.list(&filter, q.skip, q.limit).await?;
    Ok(Json(nodes))
}

pub async fn create_node(
    State(state): State<AppState>,
    Json(payload): Json<NodeCreate>,
) -> Result<(StatusCode, Json<ProxyNode>)> {
    let node = state.store.create(&payload).await?;
    Ok((StatusCode::CREATED, Json(node)))
}

pub async fn get_node(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<ProxyNode>> {
    state
        .store
        .get_by_id(id)
        .await?
        .map(Json)
        .ok_or_else(|| ProxyPoolError::NotFound(format!("node {id} not found")))
}

pub async fn update_node(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(patch): Json<NodePatch>,
) -> Result<Json<ProxyNode>> {
    state
        .store
        .update(id, &patch)
        .await?
        .map(Json)
        .ok_or_else(|| ProxyPoolError::NotFound(format!("node {id} not found")))
}

pub async fn delete_node(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<StatusCode> {
    if state.store.delete(id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ProxyPoolError::NotFound(format!("node {id} not found")))
    }
}

pub async fn get_statistics(State(state): State<AppState>) -> Result<Json<PoolStatistics>> {
    Ok(Json(state.store.statistics().await?))
}

#[derive(Debug, Serialize)]
pub struct SchedulerStatus {
    kind: String,
}

pub async fn get_scheduler(State(state): State<AppState>) -> Json<SchedulerStatus> {
    Json(SchedulerStatus {
        kind: state.registry.current_kind().to_string(),
    })
}

#[derive(Debug, Deserialize)]
pub struct SetSchedulerBody {
    kind: String,
}

pub async fn set_scheduler(
    State(state): State<AppState>,
    Json(body): Json<SetSchedulerBody>,
) -> Result<Json<SchedulerStatus>> {
    let kind = SchedulerKind::from_str(&body.kind)?;
    state.registry.set_scheduler(kind);
    Ok(Json(SchedulerStatus {
        kind: kind.to_string(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct AddRuleBody {
    name: String,
    priority: i32,
    condition: String,
}

#[derive(Debug, Serialize)]
pub struct RuleView {
    name: String,
    priority: i32,
    condition: String,
}

fn active_rule_scheduler(state: &AppState) -> Result<std::sync::Arc<dyn crate::scheduler::Scheduler>> {
    let scheduler = state.registry.get_scheduler();
    if scheduler.as_any().downcast_ref::<RuleBasedScheduler>().is_some() {
        Ok(scheduler)
    } else {
        Err(ProxyPoolError::Internal(
            "rule management requires the rule_based scheduler to be active".to_string(),
        ))
    }
}

pub async fn list_rules(State(state): State<AppState>) -> Result<Json<Vec<RuleView>>> {
    let scheduler = active_rule_scheduler(&state)?;
    let rule_based = scheduler
        .as_any()
        .downcast_ref::<RuleBasedScheduler>()
        .expect("checked above");
    let rules = rule_based
        .list_rules()
        .into_iter()
        .map(|r| RuleView {
            name: r.name,
            priority: r.priority,
            condition: r.condition,
        })
        .collect();
    Ok(Json(rules))
}

pub async fn add_rule(
    State(state): State<AppState>,
    Json(body): Json<AddRuleBody>,
) -> Result<(StatusCode, Json<RuleView>)> {
    let scheduler = active_rule_scheduler(&state)?;
    let rule_based = scheduler
        .as_any()
        .downcast_ref::<RuleBasedScheduler>()
        .expect("checked above");
    rule_based.add_rule(&body.name, body.priority, &body.condition)?;
    Ok((
        StatusCode::CREATED,
        Json(RuleView {
            name: body.name,
            priority: body.priority,
            condition: body.condition,
        }),
    ))
}

pub async fn remove_rule(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<StatusCode> {
    let scheduler = active_rule_scheduler(&state)?;
    let rule_based = scheduler
        .as_any()
        .downcast_ref::<RuleBasedScheduler>()
        .expect("checked above");
    if rule_based.remove_rule(&name) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ProxyPoolError::NotFound(format!("rule {name} not found")))
    }
}

#[derive(Debug, Serialize)]
pub struct HealthCheckSummary {
    checked: usize,
}

pub async fn run_health_check(State(state): State<AppState>) -> Result<Json<HealthCheckSummary>> {
    let checked = state.health_checker.check_all().await?;
    Ok(Json(HealthCheckSummary { checked }))
}

pub async fn healthz() -> StatusCode {
    StatusCode::OK
}
