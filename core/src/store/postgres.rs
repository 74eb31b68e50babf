//! Replicated SQL cluster backend, for multi-controller deployment behind
//! a shared database. Grounded on the headend's `db.rs` migration style:
//! idempotent `CREATE TABLE IF NOT EXISTS` plus per-column
//! `ALTER TABLE ... ADD COLUMN IF NOT EXISTS`, run once at startup against
//! a pooled `sqlx::PgPool`. Transient failures (connection loss, pool
//! exhaustion) are retried by the caller via `with_backoff`.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};

use crate::duration as dur;
use crate::error::{Result, StoreError};
use crate::model::*;

use super::{with_backoff, Store};

pub struct PostgresStore {
    pool: PgPool,
    bounds: super::IntervalBounds,
}

impl PostgresStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        Self::connect_with_bounds(database_url, super::IntervalBounds::default()).await
    }

    pub async fn connect_with_bounds(database_url: &str, bounds: super::IntervalBounds) -> Result<Self> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| StoreError::Fatal(format!("connecting to postgres: {e}")))?;
        let store = Self { pool, bounds };
        store.migrate().await?;
        Ok(store)
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            bounds: super::IntervalBounds::default(),
        }
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sites (
                id BIGSERIAL PRIMARY KEY,
                url TEXT NOT NULL UNIQUE,
                name TEXT NOT NULL,
                scan_interval_secs DOUBLE PRECISION NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(map_err)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS site_checks (
                id BIGSERIAL PRIMARY KEY,
                site_id BIGINT NOT NULL REFERENCES sites(id),
                status TEXT NOT NULL,
                response_time DOUBLE PRECISION,
                status_code INTEGER,
                error_message TEXT,
                checked_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(map_err)?;
        sqlx::query("CREATE INDEX IF NOT EXISTS site_checks_site_idx ON site_checks(site_id, checked_at DESC)")
            .execute(&self.pool)
            .await
            .map_err(map_err)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS agents (
                id BIGSERIAL PRIMARY KEY,
                name TEXT NOT NULL,
                api_key_hash TEXT NOT NULL UNIQUE,
                description TEXT,
                os TEXT,
                platform TEXT,
                architecture TEXT,
                version TEXT,
                remote_ip TEXT,
                last_seen TIMESTAMPTZ,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(map_err)?;
        for col in ["os TEXT", "platform TEXT", "architecture TEXT", "version TEXT"] {
            sqlx::query(&format!("ALTER TABLE agents ADD COLUMN IF NOT EXISTS {col}"))
                .execute(&self.pool)
                .await
                .map_err(map_err)?;
        }

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS monitor_tasks (
                id BIGSERIAL PRIMARY KEY,
                site_id BIGINT NOT NULL REFERENCES sites(id),
                monitor_type TEXT NOT NULL,
                url TEXT NOT NULL,
                interval_secs DOUBLE PRECISION NOT NULL,
                timeout_secs DOUBLE PRECISION NOT NULL,
                enabled BOOLEAN NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                UNIQUE(site_id, monitor_type)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(map_err)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS agent_task_assignments (
                agent_id BIGINT NOT NULL,
                task_id BIGINT NOT NULL,
                assigned BOOLEAN NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                PRIMARY KEY (agent_id, task_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(map_err)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS monitor_results (
                id BIGSERIAL PRIMARY KEY,
                task_id BIGINT NOT NULL,
                agent_id BIGINT NOT NULL,
                status TEXT NOT NULL,
                response_time DOUBLE PRECISION,
                status_code INTEGER,
                error_message TEXT,
                metadata JSONB NOT NULL DEFAULT '{}'::jsonb,
                checked_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(map_err)?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS monitor_results_task_idx ON monitor_results(task_id, checked_at DESC)",
        )
        .execute(&self.pool)
        .await
        .map_err(map_err)?;

        Ok(())
    }
}

fn map_err(e: sqlx::Error) -> StoreError {
    match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            StoreError::AlreadyExists(db.message().to_string())
        }
        sqlx::Error::RowNotFound => StoreError::NotFound("row not found".into()),
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::PoolClosed => {
            StoreError::Transient(e.to_string())
        }
        _ => StoreError::Fatal(e.to_string()),
    }
}

fn row_to_site(row: &sqlx::postgres::PgRow) -> Site {
    let secs: f64 = row.get("scan_interval_secs");
    Site {
        id: row.get("id"),
        url: row.get("url"),
        name: row.get("name"),
        scan_interval: Duration::from_secs_f64(secs),
        created_at: row.get::<DateTime<Utc>, _>("created_at"),
    }
}

fn row_to_check(row: &sqlx::postgres::PgRow) -> SiteCheck {
    let status: String = row.get("status");
    let status_code: Option<i32> = row.get("status_code");
    SiteCheck {
        id: row.get("id"),
        site_id: row.get("site_id"),
        status: if status == "up" {
            CheckStatus::Up
        } else {
            CheckStatus::Down
        },
        response_time: row.get("response_time"),
        status_code: status_code.map(|c| c as u16),
        error_message: row.get("error_message"),
        checked_at: row.get("checked_at"),
    }
}

fn row_to_agent(row: &sqlx::postgres::PgRow) -> Agent {
    Agent {
        id: row.get("id"),
        name: row.get("name"),
        api_key_hash: row.get("api_key_hash"),
        description: row.get("description"),
        os: row.get("os"),
        platform: row.get("platform"),
        architecture: row.get("architecture"),
        version: row.get("version"),
        remote_ip: row.get("remote_ip"),
        last_seen: row.get("last_seen"),
        status: AgentStatus::Unknown,
        created_at: row.get("created_at"),
    }
}

fn row_to_task(row: &sqlx::postgres::PgRow) -> MonitorTask {
    let monitor_type: String = row.get("monitor_type");
    let interval: f64 = row.get("interval_secs");
    let timeout: f64 = row.get("timeout_secs");
    MonitorTask {
        id: row.get("id"),
        site_id: row.get("site_id"),
        monitor_type: monitor_type.parse().unwrap_or(MonitorType::Http),
        url: row.get("url"),
        interval: Duration::from_secs_f64(interval),
        timeout: Duration::from_secs_f64(timeout),
        enabled: row.get("enabled"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

fn row_to_result(row: &sqlx::postgres::PgRow) -> MonitorResult {
    let status: String = row.get("status");
    let status_code: Option<i32> = row.get("status_code");
    let metadata: serde_json::Value = row.get("metadata");
    MonitorResult {
        id: row.get("id"),
        task_id: row.get("task_id"),
        agent_id: row.get("agent_id"),
        status: status.parse().unwrap_or(ResultStatus::Error),
        response_time: row.get("response_time"),
        status_code: status_code.map(|c| c as u16),
        error_message: row.get("error_message"),
        metadata,
        checked_at: row.get("checked_at"),
    }
}

fn validate_url_and_interval(url: &str, interval: Duration, bounds: &super::IntervalBounds) -> Result<()> {
    if !(url.starts_with("http://") || url.starts_with("https://") || url.starts_with("ping://")) {
        return Err(StoreError::invalid(format!("unsupported url scheme: {url}")));
    }
    if interval < bounds.min || interval > bounds.max {
        return Err(StoreError::invalid(format!(
            "scan_interval {} outside [{}, {}]",
            dur::format(interval),
            dur::format(bounds.min),
            dur::format(bounds.max)
        )));
    }
    Ok(())
}

#[async_trait]
impl Store for PostgresStore {
    async fn add_site(&self, url: &str, name: &str, scan_interval: Duration) -> Result<Site> {
        validate_url_and_interval(url, scan_interval, &self.bounds)?;
        if name.trim().is_empty() {
            return Err(StoreError::invalid("name must not be empty"));
        }
        with_backoff(|| async {
            let row = sqlx::query(
                "INSERT INTO sites (url, name, scan_interval_secs) VALUES ($1, $2, $3) RETURNING *",
            )
            .bind(url)
            .bind(name)
            .bind(scan_interval.as_secs_f64())
            .fetch_one(&self.pool)
            .await
            .map_err(map_err)?;
            Ok(row_to_site(&row))
        })
        .await
    }

    async fn delete_site(&self, id: i64) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(map_err)?;
        let existing = sqlx::query("SELECT id FROM sites WHERE id = $1")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(map_err)?;
        if existing.is_none() {
            return Err(StoreError::not_found(format!("site {id}")));
        }
        sqlx::query(
            "DELETE FROM monitor_results WHERE task_id IN (SELECT id FROM monitor_tasks WHERE site_id = $1)",
        )
        .bind(id)
        .execute(&mut *tx)
        .await
        .map_err(map_err)?;
        sqlx::query(
            "DELETE FROM agent_task_assignments WHERE task_id IN (SELECT id FROM monitor_tasks WHERE site_id = $1)",
        )
        .bind(id)
        .execute(&mut *tx)
        .await
        .map_err(map_err)?;
        sqlx::query("DELETE FROM monitor_tasks WHERE site_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(map_err)?;
        sqlx::query("DELETE FROM site_checks WHERE site_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(map_err)?;
        sqlx::query("DELETE FROM sites WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(map_err)?;
        tx.commit().await.map_err(map_err)?;
        Ok(())
    }

    async fn get_sites(&self) -> Result<Vec<Site>> {
        with_backoff(|| async {
            let rows = sqlx::query("SELECT * FROM sites ORDER BY id ASC")
                .fetch_all(&self.pool)
                .await
                .map_err(map_err)?;
            Ok(rows.iter().map(row_to_site).collect())
        })
        .await
    }

    async fn get_site(&self, id: i64) -> Result<Site> {
        with_backoff(|| async {
            let row = sqlx::query("SELECT * FROM sites WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(map_err)?
                .ok_or_else(|| StoreError::not_found(format!("site {id}")))?;
            Ok(row_to_site(&row))
        })
        .await
    }

    async fn get_site_status(&self) -> Result<Vec<SiteStatus>> {
        let sites = self.get_sites().await?;
        let mut out = Vec::with_capacity(sites.len());
        for site in sites {
            let latest_check = sqlx::query(
                "SELECT * FROM site_checks WHERE site_id = $1 ORDER BY checked_at DESC LIMIT 1",
            )
            .bind(site.id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_err)?
            .map(|r| row_to_check(&r));

            let latest_result = sqlx::query(
                r#"SELECT r.* FROM monitor_results r
                   JOIN monitor_tasks t ON t.id = r.task_id
                   WHERE t.site_id = $1
                   ORDER BY r.checked_at DESC LIMIT 1"#,
            )
            .bind(site.id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_err)?
            .map(|r| row_to_result(&r));

            let latest = match (latest_check, latest_result) {
                (Some(c), Some(r)) if c.checked_at >= r.checked_at => Some(LatestOutcome::from(&c)),
                (Some(_), Some(r)) => Some(LatestOutcome::from(&r)),
                (Some(c), None) => Some(LatestOutcome::from(&c)),
                (None, Some(r)) => Some(LatestOutcome::from(&r)),
                (None, None) => None,
            };

            let up_count: i64 = sqlx::query(
                "SELECT COUNT(*) AS c FROM site_checks WHERE site_id = $1 AND status = 'up'",
            )
            .bind(site.id)
            .fetch_one(&self.pool)
            .await
            .map_err(map_err)?
            .get("c");
            let down_count: i64 = sqlx::query(
                "SELECT COUNT(*) AS c FROM site_checks WHERE site_id = $1 AND status = 'down'",
            )
            .bind(site.id)
            .fetch_one(&self.pool)
            .await
            .map_err(map_err)?
            .get("c");

            out.push(SiteStatus {
                site,
                latest,
                up_count,
                down_count,
            });
        }
        Ok(out)
    }

    async fn get_site_history(&self, id: i64, limit: i64) -> Result<Vec<SiteCheck>> {
        with_backoff(|| async {
            let rows = sqlx::query(
                "SELECT * FROM site_checks WHERE site_id = $1 ORDER BY checked_at DESC LIMIT $2",
            )
            .bind(id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(map_err)?;
            Ok(rows.iter().map(row_to_check).collect())
        })
        .await
    }

    async fn record_check(&self, check: NewSiteCheck) -> Result<SiteCheck> {
        check.validate()?;
        with_backoff(|| async {
            let row = sqlx::query(
                r#"INSERT INTO site_checks (site_id, status, response_time, status_code, error_message, checked_at)
                   VALUES ($1, $2, $3, $4, $5, $6) RETURNING *"#,
            )
            .bind(check.site_id)
            .bind(check.status.as_str())
            .bind(check.response_time)
            .bind(check.status_code.map(|c| c as i32))
            .bind(&check.error_message)
            .bind(check.checked_at)
            .fetch_one(&self.pool)
            .await
            .map_err(map_err)?;
            Ok(row_to_check(&row))
        })
        .await
    }

    async fn add_agent(
        &self,
        name: &str,
        api_key_hash: &str,
        description: Option<&str>,
    ) -> Result<Agent> {
        if name.trim().is_empty() {
            return Err(StoreError::invalid("name must not be empty"));
        }
        with_backoff(|| async {
            let row = sqlx::query(
                "INSERT INTO agents (name, api_key_hash, description) VALUES ($1, $2, $3) RETURNING *",
            )
            .bind(name)
            .bind(api_key_hash)
            .bind(description)
            .fetch_one(&self.pool)
            .await
            .map_err(map_err)?;
            Ok(row_to_agent(&row))
        })
        .await
    }

    async fn get_agents(&self) -> Result<Vec<Agent>> {
        with_backoff(|| async {
            let rows = sqlx::query("SELECT * FROM agents ORDER BY id ASC")
                .fetch_all(&self.pool)
                .await
                .map_err(map_err)?;
            Ok(rows.iter().map(row_to_agent).collect())
        })
        .await
    }

    async fn delete_agent(&self, id: i64) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(map_err)?;
        let existing = sqlx::query("SELECT id FROM agents WHERE id = $1")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(map_err)?;
        if existing.is_none() {
            return Err(StoreError::not_found(format!("agent {id}")));
        }
        sqlx::query("DELETE FROM monitor_results WHERE agent_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(map_err)?;
        sqlx::query("DELETE FROM agent_task_assignments WHERE agent_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(map_err)?;
        sqlx::query("DELETE FROM agents WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(map_err)?;
        tx.commit().await.map_err(map_err)?;
        Ok(())
    }

    async fn validate_agent_api_key(&self, api_key_hash: &str) -> Result<Agent> {
        with_backoff(|| async {
            let row = sqlx::query("SELECT * FROM agents WHERE api_key_hash = $1")
                .bind(api_key_hash)
                .fetch_optional(&self.pool)
                .await
                .map_err(map_err)?;
            row.map(|r| row_to_agent(&r))
                .ok_or_else(|| StoreError::Unauthorized("unknown api key".into()))
        })
        .await
    }

    async fn touch_agent(
        &self,
        id: i64,
        remote_ip: Option<&str>,
        os: Option<&str>,
        platform: Option<&str>,
        architecture: Option<&str>,
        version: Option<&str>,
    ) -> Result<()> {
        with_backoff(|| async {
            sqlx::query(
                r#"UPDATE agents SET
                    last_seen = now(),
                    remote_ip = COALESCE($1, remote_ip),
                    os = COALESCE($2, os),
                    platform = COALESCE($3, platform),
                    architecture = COALESCE($4, architecture),
                    version = COALESCE($5, version)
                   WHERE id = $6"#,
            )
            .bind(remote_ip)
            .bind(os)
            .bind(platform)
            .bind(architecture)
            .bind(version)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(map_err)?;
            Ok(())
        })
        .await
    }

    async fn upsert_task(&self, task: NewMonitorTask) -> Result<MonitorTask> {
        with_backoff(|| async {
            let row = sqlx::query(
                r#"INSERT INTO monitor_tasks (site_id, monitor_type, url, interval_secs, timeout_secs, enabled, updated_at)
                   VALUES ($1, $2, $3, $4, $5, $6, now())
                   ON CONFLICT (site_id, monitor_type) DO UPDATE SET
                     url = excluded.url,
                     interval_secs = excluded.interval_secs,
                     timeout_secs = excluded.timeout_secs,
                     enabled = excluded.enabled,
                     updated_at = now()
                   RETURNING *"#,
            )
            .bind(task.site_id)
            .bind(task.monitor_type.as_str())
            .bind(&task.url)
            .bind(task.interval.as_secs_f64())
            .bind(task.timeout.as_secs_f64())
            .bind(task.enabled)
            .fetch_one(&self.pool)
            .await
            .map_err(map_err)?;
            Ok(row_to_task(&row))
        })
        .await
    }

    async fn list_enabled_tasks(&self) -> Result<Vec<MonitorTask>> {
        with_backoff(|| async {
            let rows = sqlx::query("SELECT * FROM monitor_tasks WHERE enabled ORDER BY id ASC")
                .fetch_all(&self.pool)
                .await
                .map_err(map_err)?;
            Ok(rows.iter().map(row_to_task).collect())
        })
        .await
    }

    async fn set_assignment(&self, agent_id: i64, task_id: i64, on: bool) -> Result<()> {
        with_backoff(|| async {
            sqlx::query(
                r#"INSERT INTO agent_task_assignments (agent_id, task_id, assigned, updated_at)
                   VALUES ($1, $2, $3, now())
                   ON CONFLICT (agent_id, task_id) DO UPDATE SET assigned = excluded.assigned, updated_at = now()"#,
            )
            .bind(agent_id)
            .bind(task_id)
            .bind(on)
            .execute(&self.pool)
            .await
            .map_err(map_err)?;
            Ok(())
        })
        .await
    }

    async fn list_assignments_for_agent(&self, agent_id: i64) -> Result<Vec<AgentTaskAssignment>> {
        with_backoff(|| async {
            let rows = sqlx::query("SELECT * FROM agent_task_assignments WHERE agent_id = $1")
                .bind(agent_id)
                .fetch_all(&self.pool)
                .await
                .map_err(map_err)?;
            Ok(rows
                .iter()
                .map(|row| AgentTaskAssignment {
                    agent_id: row.get("agent_id"),
                    task_id: row.get("task_id"),
                    assigned: row.get("assigned"),
                    updated_at: row.get("updated_at"),
                })
                .collect())
        })
        .await
    }

    async fn record_result(&self, result: NewMonitorResult) -> Result<MonitorResult> {
        result.validate()?;
        with_backoff(|| async {
            let row = sqlx::query(
                r#"INSERT INTO monitor_results (task_id, agent_id, status, response_time, status_code, error_message, metadata, checked_at)
                   VALUES ($1, $2, $3, $4, $5, $6, $7, $8) RETURNING *"#,
            )
            .bind(result.task_id)
            .bind(result.agent_id)
            .bind(result.status.as_str())
            .bind(result.response_time)
            .bind(result.status_code.map(|c| c as i32))
            .bind(&result.error_message)
            .bind(&result.metadata)
            .bind(result.checked_at)
            .fetch_one(&self.pool)
            .await
            .map_err(map_err)?;
            Ok(row_to_result(&row))
        })
        .await
    }

    async fn get_stats(&self) -> Result<Stats> {
        let statuses = self.get_site_status().await?;
        let mut stats = Stats {
            total: statuses.len() as i64,
            ..Default::default()
        };
        let mut rt_sum = 0.0;
        let mut rt_count = 0i64;
        for s in &statuses {
            if let Some(latest) = &s.latest {
                match latest.status.as_str() {
                    "up" => stats.up += 1,
                    "down" => stats.down += 1,
                    _ => {}
                }
                if let Some(rt) = latest.response_time {
                    rt_sum += rt;
                    rt_count += 1;
                }
            }
        }
        stats.avg_response_time = if rt_count > 0 { rt_sum / rt_count as f64 } else { 0.0 };
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    // Exercised only against a real cluster; gated behind DATABASE_URL so
    // the default test run never requires a running Postgres.
    use super::*;

    async fn connect_if_configured() -> Option<PostgresStore> {
        let url = std::env::var("DATABASE_URL").ok()?;
        PostgresStore::connect(&url).await.ok()
    }

    #[tokio::test]
    #[ignore]
    async fn add_then_get_site_round_trips() {
        let Some(store) = connect_if_configured().await else {
            return;
        };
        let site = store
            .add_site("http://pg-test.example/", "pg", Duration::from_secs(30))
            .await
            .unwrap();
        let fetched = store.get_site(site.id).await.unwrap();
        assert_eq!(fetched.url, "http://pg-test.example/");
        store.delete_site(site.id).await.unwrap();
    }
}
