use std::collections::HashMap;
use std::str::FromStr;

use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Row, Transaction};
use tracing::{info, instrument};

use crate::domain::{
    HealthCheckResult, NodeCreate, NodeFilter, NodePatch, NodeProtocol, PoolStatistics, ProxyNode,
};
use crate::error::{ProxyPoolError, Result};

/// PostgreSQL-backed node store. One `async fn` per operation, hand-written
/// SQL via `sqlx::query`/`query_as` rather than the compile-time-checked
/// `query!` macros (this crate has no `DATABASE_URL` available at build
/// time).
#[derive(Clone)]
pub struct NodeStore {
    pool: PgPool,
}

fn row_to_node(row: &PgRow) -> Result<ProxyNode> {
    let protocol_raw: String = row.get("protocol");
    let protocol = NodeProtocol::from_str(&protocol_raw)
        .map_err(|e| ProxyPoolError::Internal(format!("corrupt protocol column: {e}")))?;
    let port: i32 = row.get("port");

    Ok(ProxyNode {
        id: row.get("id"),
        name: row.get("name"),
        host: row.get("host"),
        port: port as u16,
        protocol,
        username: row.get("username"),
        password: row.get("password"),
        is_active: row.get("is_active"),
        is_healthy: row.get("is_healthy"),
        response_time_ms: row.get("response_time_ms"),
        success_rate: row.get("success_rate"),
        weight: row.get("weight"),
        max_connections: row.get("max_connections"),
        current_connections: row.get("current_connections"),
        country: row.get("country"),
        region: row.get("region"),
        tags: row.get("tags"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        last_check: row.get("last_check"),
    })
}

impl NodeStore {
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Creates the table if it does not already exist. This system has no
    /// prior schema to migrate from, so a plain `CREATE TABLE IF NOT
    /// EXISTS` stands in for a migration runner.
    async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS proxy_nodes (
                id BIGSERIAL PRIMARY KEY,
                name TEXT,
                host TEXT NOT NULL,
                port INTEGER NOT NULL,
                protocol TEXT NOT NULL,
                username TEXT,
                password TEXT,
                is_active BOOLEAN NOT NULL DEFAULT TRUE,
                is_healthy BOOLEAN NOT NULL DEFAULT TRUE,
                response_time_ms DOUBLE PRECISION NOT NULL DEFAULT 0,
                success_rate DOUBLE PRECISION NOT NULL DEFAULT 100,
                weight INTEGER NOT NULL DEFAULT 1,
                max_connections INTEGER NOT NULL DEFAULT 100,
                current_connections INTEGER NOT NULL DEFAULT 0,
                country TEXT,
                region TEXT,
                tags TEXT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                last_check TIMESTAMPTZ
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_proxy_nodes_id ON proxy_nodes (id)")
            .execute(&self.pool)
            .await?;

        info!("proxy_nodes table ready");
        Ok(())
    }

    #[instrument(skip(self, node))]
    pub async fn create(&self, node: &NodeCreate) -> Result<ProxyNode> {
        let row = sqlx::query(
            r#"
            INSERT INTO proxy_nodes
                (name, host, port, protocol, username, password, weight,
                 max_connections, country, region, tags)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            RETURNING *
            "#,
        )
        .bind(&node.name)
        .bind(&node.host)
        .bind(node.port as i32)
        .bind(node.protocol.as_str())
        .bind(&node.username)
        .bind(&node.password)
        .bind(node.weight)
        .bind(node.max_connections)
        .bind(&node.country)
        .bind(&node.region)
        .bind(&node.tags)
        .fetch_one(&self.pool)
        .await?;

        row_to_node(&row)
    }

    pub async fn get_by_id(&self, id: i64) -> Result<Option<ProxyNode>> {
        let row = sqlx::query("SELECT * FROM proxy_nodes WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_node).transpose()
    }

    pub async fn list(&self, filter: &NodeFilter, skip: i64, limit: i64) -> Result<Vec<ProxyNode>> {
        let mut sql = String::from("SELECT * FROM proxy_nodes WHERE 1=1");
        let mut binds: Vec<String> = Vec::new();
        let mut next_param = 1;

        if filter.is_active.is_some() {
            sql.push_str(&format!(" AND is_active = ${next_param}"));
            next_param += 1;
        }
        if filter.is_healthy.is_some() {
            sql.push_str(&format!(" AND is_healthy = ${next_param}"));
            next_param += 1;
        }
        if filter.protocol.is_some() {
            sql.push_str(&format!(" AND protocol = ${next_param}"));
            next_param += 1;
        }
        if filter.country.is_some() {
            sql.push_str(&format!(" AND country = ${next_param}"));
            next_param += 1;
        }
        if let Some(search) = &filter.search {
            sql.push_str(&format!(
                " AND (host LIKE ${next_param} OR name LIKE ${next_param} OR tags LIKE ${next_param})"
            ));
            binds.push(format!("%{search}%"));
            next_param += 1;
        }

        sql.push_str(&format!(" ORDER BY id ASC OFFSET ${next_param}"));
        next_param += 1;
        sql.push_str(&format!(" LIMIT ${next_param}"));

        let mut q = sqlx::query(&sql);
        if let Some(v) = filter.is_active {
            q = q.bind(v);
        }
        if let Some(v) = filter.is_healthy {
            q = q.bind(v);
        }
        if let Some(v) = filter.protocol {
            q = q.bind(v.as_str());
        }
        if let Some(v) = &filter.country {
            q = q.bind(v.clone());
        }
        for b in &binds {
            q = q.bind(b.clone());
        }
        q = q.bind(skip).bind(limit);

        let rows = q.fetch_all(&self.pool).await?;
        rows.iter().map(row_to_node).collect()
    }

    /// Candidate set consumed by every scheduler: `is_active AND is_healthy`.
    pub async fn list_candidates(&self) -> Result<Vec<ProxyNode>> {
        let rows = sqlx::query(
            "SELECT * FROM proxy_nodes WHERE is_active = TRUE AND is_healthy = TRUE ORDER BY id ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_node).collect()
    }

    /// All active nodes, regardless of health — the population the health
    /// checker probes each tick.
    pub async fn list_active(&self) -> Result<Vec<ProxyNode>> {
        let rows = sqlx::query("SELECT * FROM proxy_nodes WHERE is_active = TRUE ORDER BY id ASC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_node).collect()
    }

    #[instrument(skip(self, patch))]
    pub async fn update(&self, id: i64, patch: &NodePatch) -> Result<Option<ProxyNode>> {
        if self.get_by_id(id).await?.is_none() {
            return Ok(None);
        }

        let mut sets: Vec<String> = Vec::new();
        let mut idx = 1;
        macro_rules! set_field {
            ($name:expr) => {{
                sets.push(format!("{} = ${}", $name, idx));
                idx += 1;
            }};
        }

        if patch.name.is_some() {
            set_field!("name");
        }
        if patch.host.is_some() {
            set_field!("host");
        }
        if patch.port.is_some() {
            set_field!("port");
        }
        if patch.protocol.is_some() {
            set_field!("protocol");
        }
        if patch.username.is_some() {
            set_field!("username");
        }
        if patch.password.is_some() {
            set_field!("password");
        }
        if patch.is_active.is_some() {
            set_field!("is_active");
        }
        if patch.weight.is_some() {
            set_field!("weight");
        }
        if patch.max_connections.is_some() {
            set_field!("max_connections");
        }
        if patch.country.is_some() {
            set_field!("country");
        }
        if patch.region.is_some() {
            set_field!("region");
        }
        if patch.tags.is_some() {
            set_field!("tags");
        }

        if sets.is_empty() {
            return self.get_by_id(id).await;
        }

        sets.push("updated_at = now()".to_string());
        let sql = format!(
            "UPDATE proxy_nodes SET {} WHERE id = ${} RETURNING *",
            sets.join(", "),
            idx
        );

        let mut q = sqlx::query(&sql);
        if let Some(v) = &patch.name {
            q = q.bind(v.clone());
        }
        if let Some(v) = &patch.host {
            q = q.bind(v.clone());
        }
        if let Some(v) = patch.port {
            q = q.bind(v as i32);
        }
        if let Some(v) = patch.protocol {
            q = q.bind(v.as_str());
        }
        if let Some(v) = &patch.username {
            q = q.bind(v.clone());
        }
        if let Some(v) = &patch.password {
            q = q.bind(v.clone());
        }
        if let Some(v) = patch.is_active {
            q = q.bind(v);
        }
        if let Some(v) = patch.weight {
            q = q.bind(v);
        }
        if let Some(v) = patch.max_connections {
            q = q.bind(v);
        }
        if let Some(v) = &patch.country {
            q = q.bind(v.clone());
        }
        if let Some(v) = &patch.region {
            q = q.bind(v.clone());
        }
        if let Some(v) = &patch.tags {
            q = q.bind(v.clone());
        }
        q = q.bind(id);

        let row = q.fetch_one(&self.pool).await?;
        Ok(Some(row_to_node(&row)?))
    }

    pub async fn delete(&self, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM proxy_nodes WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn statistics(&self) -> Result<PoolStatistics> {
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM proxy_nodes")
            .fetch_one(&self.pool)
            .await?;
        let active: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM proxy_nodes WHERE is_active = TRUE")
                .fetch_one(&self.pool)
                .await?;
        let healthy_active: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM proxy_nodes WHERE is_active = TRUE AND is_healthy = TRUE",
        )
        .fetch_one(&self.pool)
        .await?;
        let avg_response_time_ms: f64 = sqlx::query_scalar(
            "SELECT COALESCE(AVG(response_time_ms), 0) FROM proxy_nodes WHERE is_active = TRUE AND is_healthy = TRUE",
        )
        .fetch_one(&self.pool)
        .await?;

        let protocol_rows = sqlx::query("SELECT protocol, COUNT(*) AS c FROM proxy_nodes GROUP BY protocol")
            .fetch_all(&self.pool)
            .await?;
        let mut by_protocol = HashMap::new();
        for row in protocol_rows {
            let protocol: String = row.get("protocol");
            let count: i64 = row.get("c");
            by_protocol.insert(protocol, count);
        }

        let country_rows = sqlx::query(
            "SELECT country, COUNT(*) AS c FROM proxy_nodes WHERE country IS NOT NULL GROUP BY country",
        )
        .fetch_all(&self.pool)
        .await?;
        let mut by_country = HashMap::new();
        for row in country_rows {
            let country: String = row.get("country");
            let count: i64 = row.get("c");
            by_country.insert(country, count);
        }

        Ok(PoolStatistics {
            total,
            active,
            healthy_active,
            avg_response_time_ms,
            by_protocol,
            by_country,
        })
    }

    /// Saturating `current_connections += delta` (delta may be negative),
    /// clamped at zero, computed atomically in SQL. Used by every
    /// scheduler's pick (`+1`) and report_success/report_failure (`-1`).
    pub async fn adjust_connections(&self, id: i64, delta: i32) -> Result<()> {
        sqlx::query(
            "UPDATE proxy_nodes SET current_connections = GREATEST(current_connections + $1, 0), updated_at = now() WHERE id = $2",
        )
        .bind(delta)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Health-First's `report_success`: exponential smoothing of
    /// `response_time_ms` with alpha = 0.3, computed atomically.
    pub async fn apply_success_response_time(&self, id: i64, observed_ms: f64) -> Result<()> {
        sqlx::query(
            "UPDATE proxy_nodes SET response_time_ms = 0.7 * response_time_ms + 0.3 * $1, updated_at = now() WHERE id = $2",
        )
        .bind(observed_ms)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Health-First's `report_failure`: `success_rate -= 1`, clamped at 0.
    pub async fn apply_failure_success_rate_penalty(&self, id: i64) -> Result<()> {
        sqlx::query(
            "UPDATE proxy_nodes SET success_rate = GREATEST(success_rate - 1, 0), updated_at = now() WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Commits an entire health-check tick as a single transaction: per
    /// §4.3 step 4, `is_healthy`, `response_time_ms`, `success_rate` and
    /// `last_check` all move together.
    pub async fn apply_probe_results(&self, results: &[(i64, HealthCheckResult)]) -> Result<()> {
        let mut tx: Transaction<'_, sqlx::Postgres> = self.pool.begin().await?;

        for (id, result) in results {
            let success_rate_delta: f64 = if result.success { 1.0 } else { -5.0 };
            sqlx::query(
                r#"
                UPDATE proxy_nodes SET
                    is_healthy = $1,
                    response_time_ms = $2,
                    success_rate = LEAST(GREATEST(success_rate + $3, 0), 100),
                    last_check = $4,
                    updated_at = now()
                WHERE id = $5
                "#,
            )
            .bind(result.success)
            .bind(result.response_time_ms)
            .bind(success_rate_delta)
            .bind(result.timestamp)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_sentinel_matches_data_model() {
        assert_eq!(HealthCheckResult::FAILURE_SENTINEL_MS, 10_000.0);
    }
}
