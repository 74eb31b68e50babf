//! Embedded single-file backend, for single-node deployment. One SQLite
//! database file holds every table listed in the data model. Grounded on
//! the `ServerDatabase` pattern from the network-monitoring reference
//! corpus: idempotent `CREATE TABLE IF NOT EXISTS` migrations run once on
//! `open`, and a single connection is shared behind an async mutex since
//! `rusqlite::Connection` is `Send` but not `Sync`.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use tokio::sync::Mutex;

use crate::duration as dur;
use crate::error::{Result, StoreError};
use crate::model::*;

use super::Store;

pub struct SqliteStore {
    conn: Mutex<Connection>,
    bounds: super::IntervalBounds,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>, bounds: super::IntervalBounds) -> Result<Self> {
        let conn = Connection::open(path.as_ref())
            .map_err(|e| StoreError::Fatal(format!("opening sqlite db: {e}")))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .map_err(|e| StoreError::Fatal(format!("configuring sqlite db: {e}")))?;
        let store = Self {
            conn: Mutex::new(conn),
            bounds,
        };
        store.migrate_sync()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::open_in_memory_with_bounds(super::IntervalBounds::default())
    }

    pub fn open_in_memory_with_bounds(bounds: super::IntervalBounds) -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| StoreError::Fatal(format!("opening sqlite db: {e}")))?;
        let store = Self {
            conn: Mutex::new(conn),
            bounds,
        };
        store.migrate_sync()?;
        Ok(store)
    }

    fn migrate_sync(&self) -> Result<()> {
        let conn = self.conn.blocking_lock();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS sites (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                url TEXT NOT NULL UNIQUE,
                name TEXT NOT NULL,
                scan_interval_secs REAL NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS site_checks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                site_id INTEGER NOT NULL REFERENCES sites(id),
                status TEXT NOT NULL,
                response_time REAL,
                status_code INTEGER,
                error_message TEXT,
                checked_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS site_checks_site_idx ON site_checks(site_id, checked_at DESC);

            CREATE TABLE IF NOT EXISTS agents (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                api_key_hash TEXT NOT NULL UNIQUE,
                description TEXT,
                os TEXT,
                platform TEXT,
                architecture TEXT,
                version TEXT,
                remote_ip TEXT,
                last_seen TEXT,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS monitor_tasks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                site_id INTEGER NOT NULL REFERENCES sites(id),
                monitor_type TEXT NOT NULL,
                url TEXT NOT NULL,
                interval_secs REAL NOT NULL,
                timeout_secs REAL NOT NULL,
                enabled INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE(site_id, monitor_type)
            );

            CREATE TABLE IF NOT EXISTS agent_task_assignments (
                agent_id INTEGER NOT NULL,
                task_id INTEGER NOT NULL,
                assigned INTEGER NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (agent_id, task_id)
            );

            CREATE TABLE IF NOT EXISTS monitor_results (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id INTEGER NOT NULL,
                agent_id INTEGER NOT NULL,
                status TEXT NOT NULL,
                response_time REAL,
                status_code INTEGER,
                error_message TEXT,
                metadata TEXT NOT NULL,
                checked_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS monitor_results_task_idx ON monitor_results(task_id, checked_at DESC);
            "#,
        )
        .map_err(|e| StoreError::Fatal(format!("migrating sqlite db: {e}")))?;
        Ok(())
    }
}

fn map_err(e: rusqlite::Error) -> StoreError {
    match &e {
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            StoreError::AlreadyExists(e.to_string())
        }
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == rusqlite::ErrorCode::DatabaseBusy
                || err.code == rusqlite::ErrorCode::DatabaseLocked =>
        {
            StoreError::Transient(e.to_string())
        }
        rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound(e.to_string()),
        _ => StoreError::Fatal(e.to_string()),
    }
}

fn row_to_site(row: &rusqlite::Row) -> rusqlite::Result<Site> {
    let secs: f64 = row.get("scan_interval_secs")?;
    let created_at: String = row.get("created_at")?;
    Ok(Site {
        id: row.get("id")?,
        url: row.get("url")?,
        name: row.get("name")?,
        scan_interval: Duration::from_secs_f64(secs),
        created_at: parse_ts(&created_at),
    })
}

fn row_to_check(row: &rusqlite::Row) -> rusqlite::Result<SiteCheck> {
    let status: String = row.get("status")?;
    let checked_at: String = row.get("checked_at")?;
    let status_code: Option<i64> = row.get("status_code")?;
    Ok(SiteCheck {
        id: row.get("id")?,
        site_id: row.get("site_id")?,
        status: if status == "up" {
            CheckStatus::Up
        } else {
            CheckStatus::Down
        },
        response_time: row.get("response_time")?,
        status_code: status_code.map(|c| c as u16),
        error_message: row.get("error_message")?,
        checked_at: parse_ts(&checked_at),
    })
}

fn row_to_agent(row: &rusqlite::Row) -> rusqlite::Result<Agent> {
    let created_at: String = row.get("created_at")?;
    let last_seen: Option<String> = row.get("last_seen")?;
    Ok(Agent {
        id: row.get("id")?,
        name: row.get("name")?,
        api_key_hash: row.get("api_key_hash")?,
        description: row.get("description")?,
        os: row.get("os")?,
        platform: row.get("platform")?,
        architecture: row.get("architecture")?,
        version: row.get("version")?,
        remote_ip: row.get("remote_ip")?,
        last_seen: last_seen.map(|s| parse_ts(&s)),
        status: AgentStatus::Unknown,
        created_at: parse_ts(&created_at),
    })
}

fn row_to_task(row: &rusqlite::Row) -> rusqlite::Result<MonitorTask> {
    let monitor_type: String = row.get("monitor_type")?;
    let interval: f64 = row.get("interval_secs")?;
    let timeout: f64 = row.get("timeout_secs")?;
    let enabled: i64 = row.get("enabled")?;
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;
    Ok(MonitorTask {
        id: row.get("id")?,
        site_id: row.get("site_id")?,
        monitor_type: monitor_type.parse().unwrap_or(MonitorType::Http),
        url: row.get("url")?,
        interval: Duration::from_secs_f64(interval),
        timeout: Duration::from_secs_f64(timeout),
        enabled: enabled != 0,
        created_at: parse_ts(&created_at),
        updated_at: parse_ts(&updated_at),
    })
}

fn row_to_result(row: &rusqlite::Row) -> rusqlite::Result<MonitorResult> {
    let status: String = row.get("status")?;
    let checked_at: String = row.get("checked_at")?;
    let status_code: Option<i64> = row.get("status_code")?;
    let metadata: String = row.get("metadata")?;
    Ok(MonitorResult {
        id: row.get("id")?,
        task_id: row.get("task_id")?,
        agent_id: row.get("agent_id")?,
        status: status.parse().unwrap_or(ResultStatus::Error),
        response_time: row.get("response_time")?,
        status_code: status_code.map(|c| c as u16),
        error_message: row.get("error_message")?,
        metadata: serde_json::from_str(&metadata).unwrap_or(serde_json::Value::Null),
        checked_at: parse_ts(&checked_at),
    })
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339()
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
impl Store for SqliteStore {
    async fn add_site(&self, url: &str, name: &str, scan_interval: Duration) -> Result<Site> {
        validate_url_and_interval(url, scan_interval, &self.bounds)?;
        if name.trim().is_empty() {
            return Err(StoreError::invalid("name must not be empty"));
        }
        let conn = self.conn.lock().await;
        let existing: Option<i64> = conn
            .query_row("SELECT id FROM sites WHERE url = ?1", params![url], |r| r.get(0))
            .optional()
            .map_err(map_err)?;
        if existing.is_some() {
            return Err(StoreError::already_exists(format!("site url {url}")));
        }
        let now = fmt_ts(Utc::now());
        conn.execute(
            "INSERT INTO sites (url, name, scan_interval_secs, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![url, name, scan_interval.as_secs_f64(), now],
        )
        .map_err(map_err)?;
        let id = conn.last_insert_rowid();
        conn.query_row("SELECT * FROM sites WHERE id = ?1", params![id], row_to_site)
            .map_err(map_err)
    }

    async fn delete_site(&self, id: i64) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction().map_err(map_err)?;
        let existing: Option<i64> = tx
            .query_row("SELECT id FROM sites WHERE id = ?1", params![id], |r| r.get(0))
            .optional()
            .map_err(map_err)?;
        if existing.is_none() {
            return Err(StoreError::not_found(format!("site {id}")));
        }
        tx.execute(
            "DELETE FROM monitor_results WHERE task_id IN (SELECT id FROM monitor_tasks WHERE site_id = ?1)",
            params![id],
        )
        .map_err(map_err)?;
        tx.execute(
            "DELETE FROM agent_task_assignments WHERE task_id IN (SELECT id FROM monitor_tasks WHERE site_id = ?1)",
            params![id],
        )
        .map_err(map_err)?;
        tx.execute("DELETE FROM monitor_tasks WHERE site_id = ?1", params![id])
            .map_err(map_err)?;
        tx.execute("DELETE FROM site_checks WHERE site_id = ?1", params![id])
            .map_err(map_err)?;
        tx.execute("DELETE FROM sites WHERE id = ?1", params![id])
            .map_err(map_err)?;
        tx.commit().map_err(map_err)?;
        Ok(())
    }

    async fn get_sites(&self) -> Result<Vec<Site>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare("SELECT * FROM sites ORDER BY id ASC")
            .map_err(map_err)?;
        let rows = stmt
            .query_map([], row_to_site)
            .map_err(map_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(map_err)?;
        Ok(rows)
    }

    async fn get_site(&self, id: i64) -> Result<Site> {
        let conn = self.conn.lock().await;
        conn.query_row("SELECT * FROM sites WHERE id = ?1", params![id], row_to_site)
            .map_err(map_err)
    }

    async fn get_site_status(&self) -> Result<Vec<SiteStatus>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare("SELECT * FROM sites ORDER BY id ASC")
            .map_err(map_err)?;
        let sites = stmt
            .query_map([], row_to_site)
            .map_err(map_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(map_err)?;

        let mut out = Vec::with_capacity(sites.len());
        for site in sites {
            let latest_check: Option<SiteCheck> = conn
                .query_row(
                    "SELECT * FROM site_checks WHERE site_id = ?1 ORDER BY checked_at DESC LIMIT 1",
                    params![site.id],
                    row_to_check,
                )
                .optional()
                .map_err(map_err)?;
            let latest_result: Option<MonitorResult> = conn
                .query_row(
                    r#"SELECT r.* FROM monitor_results r
                       JOIN monitor_tasks t ON t.id = r.task_id
                       WHERE t.site_id = ?1
                       ORDER BY r.checked_at DESC LIMIT 1"#,
                    params![site.id],
                    row_to_result,
                )
                .optional()
                .map_err(map_err)?;

            let latest = match (latest_check, latest_result) {
                (Some(c), Some(r)) if c.checked_at >= r.checked_at => Some(LatestOutcome::from(&c)),
                (Some(_), Some(r)) => Some(LatestOutcome::from(&r)),
                (Some(c), None) => Some(LatestOutcome::from(&c)),
                (None, Some(r)) => Some(LatestOutcome::from(&r)),
                (None, None) => None,
            };

            let up_count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM site_checks WHERE site_id = ?1 AND status = 'up'",
                    params![site.id],
                    |r| r.get(0),
                )
                .map_err(map_err)?;
            let down_count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM site_checks WHERE site_id = ?1 AND status = 'down'",
                    params![site.id],
                    |r| r.get(0),
                )
                .map_err(map_err)?;

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
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare("SELECT * FROM site_checks WHERE site_id = ?1 ORDER BY checked_at DESC LIMIT ?2")
            .map_err(map_err)?;
        let rows = stmt
            .query_map(params![id, limit], row_to_check)
            .map_err(map_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(map_err)?;
        Ok(rows)
    }

    async fn record_check(&self, check: NewSiteCheck) -> Result<SiteCheck> {
        check.validate()?;
        let conn = self.conn.lock().await;
        conn.execute(
            r#"INSERT INTO site_checks (site_id, status, response_time, status_code, error_message, checked_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6)"#,
            params![
                check.site_id,
                check.status.as_str(),
                check.response_time,
                check.status_code.map(|c| c as i64),
                check.error_message,
                fmt_ts(check.checked_at),
            ],
        )
        .map_err(map_err)?;
        let id = conn.last_insert_rowid();
        conn.query_row("SELECT * FROM site_checks WHERE id = ?1", params![id], row_to_check)
            .map_err(map_err)
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
        let conn = self.conn.lock().await;
        let existing: Option<i64> = conn
            .query_row(
                "SELECT id FROM agents WHERE api_key_hash = ?1",
                params![api_key_hash],
                |r| r.get(0),
            )
            .optional()
            .map_err(map_err)?;
        if existing.is_some() {
            return Err(StoreError::already_exists("agent api key"));
        }
        let now = fmt_ts(Utc::now());
        conn.execute(
            "INSERT INTO agents (name, api_key_hash, description, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![name, api_key_hash, description, now],
        )
        .map_err(map_err)?;
        let id = conn.last_insert_rowid();
        conn.query_row("SELECT * FROM agents WHERE id = ?1", params![id], row_to_agent)
            .map_err(map_err)
    }

    async fn get_agents(&self) -> Result<Vec<Agent>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare("SELECT * FROM agents ORDER BY id ASC")
            .map_err(map_err)?;
        let rows = stmt
            .query_map([], row_to_agent)
            .map_err(map_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(map_err)?;
        Ok(rows)
    }

    async fn delete_agent(&self, id: i64) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction().map_err(map_err)?;
        let existing: Option<i64> = tx
            .query_row("SELECT id FROM agents WHERE id = ?1", params![id], |r| r.get(0))
            .optional()
            .map_err(map_err)?;
        if existing.is_none() {
            return Err(StoreError::not_found(format!("agent {id}")));
        }
        tx.execute(
            "DELETE FROM monitor_results WHERE agent_id = ?1",
            params![id],
        )
        .map_err(map_err)?;
        tx.execute(
            "DELETE FROM agent_task_assignments WHERE agent_id = ?1",
            params![id],
        )
        .map_err(map_err)?;
        tx.execute("DELETE FROM agents WHERE id = ?1", params![id])
            .map_err(map_err)?;
        tx.commit().map_err(map_err)?;
        Ok(())
    }

    async fn validate_agent_api_key(&self, api_key_hash: &str) -> Result<Agent> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT * FROM agents WHERE api_key_hash = ?1",
            params![api_key_hash],
            row_to_agent,
        )
        .optional()
        .map_err(map_err)?
        .ok_or_else(|| StoreError::Unauthorized("unknown api key".into()))
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
        let conn = self.conn.lock().await;
        conn.execute(
            r#"UPDATE agents SET
                last_seen = ?1,
                remote_ip = COALESCE(?2, remote_ip),
                os = COALESCE(?3, os),
                platform = COALESCE(?4, platform),
                architecture = COALESCE(?5, architecture),
                version = COALESCE(?6, version)
               WHERE id = ?7"#,
            params![fmt_ts(Utc::now()), remote_ip, os, platform, architecture, version, id],
        )
        .map_err(map_err)?;
        Ok(())
    }

    async fn upsert_task(&self, task: NewMonitorTask) -> Result<MonitorTask> {
        let conn = self.conn.lock().await;
        let now = fmt_ts(Utc::now());
        let existing: Option<i64> = conn
            .query_row(
                "SELECT id FROM monitor_tasks WHERE site_id = ?1 AND monitor_type = ?2",
                params![task.site_id, task.monitor_type.as_str()],
                |r| r.get(0),
            )
            .optional()
            .map_err(map_err)?;

        let id = if let Some(id) = existing {
            conn.execute(
                r#"UPDATE monitor_tasks SET url = ?1, interval_secs = ?2, timeout_secs = ?3,
                   enabled = ?4, updated_at = ?5 WHERE id = ?6"#,
                params![
                    task.url,
                    task.interval.as_secs_f64(),
                    task.timeout.as_secs_f64(),
                    task.enabled as i64,
                    now,
                    id
                ],
            )
            .map_err(map_err)?;
            id
        } else {
            conn.execute(
                r#"INSERT INTO monitor_tasks (site_id, monitor_type, url, interval_secs, timeout_secs, enabled, created_at, updated_at)
                   VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"#,
                params![
                    task.site_id,
                    task.monitor_type.as_str(),
                    task.url,
                    task.interval.as_secs_f64(),
                    task.timeout.as_secs_f64(),
                    task.enabled as i64,
                    now,
                    now,
                ],
            )
            .map_err(map_err)?;
            conn.last_insert_rowid()
        };

        conn.query_row("SELECT * FROM monitor_tasks WHERE id = ?1", params![id], row_to_task)
            .map_err(map_err)
    }

    async fn list_enabled_tasks(&self) -> Result<Vec<MonitorTask>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare("SELECT * FROM monitor_tasks WHERE enabled = 1 ORDER BY id ASC")
            .map_err(map_err)?;
        let rows = stmt
            .query_map([], row_to_task)
            .map_err(map_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(map_err)?;
        Ok(rows)
    }

    async fn set_assignment(&self, agent_id: i64, task_id: i64, on: bool) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            r#"INSERT INTO agent_task_assignments (agent_id, task_id, assigned, updated_at)
               VALUES (?1, ?2, ?3, ?4)
               ON CONFLICT(agent_id, task_id) DO UPDATE SET assigned = excluded.assigned, updated_at = excluded.updated_at"#,
            params![agent_id, task_id, on as i64, fmt_ts(Utc::now())],
        )
        .map_err(map_err)?;
        Ok(())
    }

    async fn list_assignments_for_agent(&self, agent_id: i64) -> Result<Vec<AgentTaskAssignment>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare("SELECT * FROM agent_task_assignments WHERE agent_id = ?1")
            .map_err(map_err)?;
        let rows = stmt
            .query_map(params![agent_id], |row| {
                let assigned: i64 = row.get("assigned")?;
                let updated_at: String = row.get("updated_at")?;
                Ok(AgentTaskAssignment {
                    agent_id: row.get("agent_id")?,
                    task_id: row.get("task_id")?,
                    assigned: assigned != 0,
                    updated_at: parse_ts(&updated_at),
                })
            })
            .map_err(map_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(map_err)?;
        Ok(rows)
    }

    async fn record_result(&self, result: NewMonitorResult) -> Result<MonitorResult> {
        result.validate()?;
        let conn = self.conn.lock().await;
        conn.execute(
            r#"INSERT INTO monitor_results (task_id, agent_id, status, response_time, status_code, error_message, metadata, checked_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"#,
            params![
                result.task_id,
                result.agent_id,
                result.status.as_str(),
                result.response_time,
                result.status_code.map(|c| c as i64),
                result.error_message,
                result.metadata.to_string(),
                fmt_ts(result.checked_at),
            ],
        )
        .map_err(map_err)?;
        let id = conn.last_insert_rowid();
        conn.query_row("SELECT * FROM monitor_results WHERE id = ?1", params![id], row_to_result)
            .map_err(map_err)
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
    use super::*;

    fn store() -> SqliteStore {
        SqliteStore::open_in_memory().unwrap()
    }

    #[tokio::test]
    async fn add_then_get_site_round_trips() {
        let s = store();
        let site = s
            .add_site("http://example.test/", "ex", Duration::from_secs(10))
            .await
            .unwrap();
        let fetched = s.get_site(site.id).await.unwrap();
        assert_eq!(fetched.url, "http://example.test/");
        assert_eq!(fetched.scan_interval, Duration::from_secs(10));
    }

    #[tokio::test]
    async fn duplicate_url_is_already_exists() {
        let s = store();
        s.add_site("http://example.test/", "ex", Duration::from_secs(10))
            .await
            .unwrap();
        let err = s
            .add_site("http://example.test/", "ex2", Duration::from_secs(10))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(_)));
        assert_eq!(s.get_sites().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn interval_out_of_bounds_is_invalid() {
        let s = store();
        let err = s
            .add_site("http://example.test/", "ex", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Invalid(_)));
    }

    #[tokio::test]
    async fn delete_site_cascades() {
        let s = store();
        let site = s
            .add_site("http://example.test/", "ex", Duration::from_secs(10))
            .await
            .unwrap();
        s.record_check(NewSiteCheck {
            site_id: site.id,
            status: CheckStatus::Up,
            response_time: Some(0.1),
            status_code: Some(200),
            error_message: None,
            checked_at: Utc::now(),
        })
        .await
        .unwrap();
        let task = s
            .upsert_task(NewMonitorTask {
                site_id: site.id,
                monitor_type: MonitorType::Http,
                url: site.url.clone(),
                interval: Duration::from_secs(10),
                timeout: Duration::from_secs(5),
                enabled: true,
            })
            .await
            .unwrap();
        s.set_assignment(1, task.id, true).await.unwrap();

        s.delete_site(site.id).await.unwrap();
        assert!(s.get_site(site.id).await.is_err());
        assert_eq!(s.get_site_history(site.id, 100).await.unwrap().len(), 0);
        assert_eq!(s.list_enabled_tasks().await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn rejects_out_of_range_status_code() {
        let s = store();
        let site = s
            .add_site("http://example.test/", "ex", Duration::from_secs(10))
            .await
            .unwrap();
        let err = s
            .record_check(NewSiteCheck {
                site_id: site.id,
                status: CheckStatus::Up,
                response_time: None,
                status_code: Some(250 + 450),
                error_message: None,
                checked_at: Utc::now(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Invalid(_)));
    }

    #[tokio::test]
    async fn upsert_task_enforces_one_per_site_and_type() {
        let s = store();
        let site = s
            .add_site("http://example.test/", "ex", Duration::from_secs(10))
            .await
            .unwrap();
        let t1 = s
            .upsert_task(NewMonitorTask {
                site_id: site.id,
                monitor_type: MonitorType::Http,
                url: site.url.clone(),
                interval: Duration::from_secs(10),
                timeout: Duration::from_secs(5),
                enabled: true,
            })
            .await
            .unwrap();
        let t2 = s
            .upsert_task(NewMonitorTask {
                site_id: site.id,
                monitor_type: MonitorType::Http,
                url: site.url.clone(),
                interval: Duration::from_secs(20),
                timeout: Duration::from_secs(5),
                enabled: true,
            })
            .await
            .unwrap();
        assert_eq!(t1.id, t2.id);
        assert_eq!(s.list_enabled_tasks().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn checks_are_appended_never_before_site_creation_and_never_removed() {
        let s = store();
        let site = s
            .add_site("http://example.test/", "ex", Duration::from_secs(10))
            .await
            .unwrap();

        for _ in 0..3 {
            s.record_check(NewSiteCheck {
                site_id: site.id,
                status: CheckStatus::Up,
                response_time: Some(0.05),
                status_code: Some(200),
                error_message: None,
                checked_at: Utc::now(),
            })
            .await
            .unwrap();
        }

        let history = s.get_site_history(site.id, 100).await.unwrap();
        assert_eq!(history.len(), 3);
        for check in &history {
            assert!(check.checked_at >= site.created_at);
        }

        // Appending more never shrinks the recorded count.
        s.record_check(NewSiteCheck {
            site_id: site.id,
            status: CheckStatus::Down,
            response_time: None,
            status_code: None,
            error_message: Some("boom".into()),
            checked_at: Utc::now(),
        })
        .await
        .unwrap();
        assert_eq!(s.get_site_history(site.id, 100).await.unwrap().len(), 4);
    }
}
