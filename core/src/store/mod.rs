mod postgres;
mod sqlite;

pub use postgres::PostgresStore;
pub use sqlite::SqliteStore;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{
    Agent, AgentTaskAssignment, MonitorResult, MonitorTask, NewMonitorResult, NewMonitorTask,
    NewSiteCheck, Site, SiteCheck, SiteStatus, Stats,
};

/// Bounds a `Site::scan_interval` / `MonitorTask::interval` must fall
/// inside (§3). Controller-wide, not per-site.
#[derive(Clone, Copy, Debug)]
pub struct IntervalBounds {
    pub min: Duration,
    pub max: Duration,
}

impl Default for IntervalBounds {
    fn default() -> Self {
        Self {
            min: Duration::from_secs(5),
            max: Duration::from_secs(24 * 3600),
        }
    }
}

/// Uniform operation set the rest of the system calls, regardless of which
/// backend (embedded single-file, or replicated SQL cluster) is behind it.
/// Every operation is safe under concurrent callers; writes spanning
/// multiple tables commit in one transaction.
#[async_trait]
pub trait Store: Send + Sync {
    async fn add_site(&self, url: &str, name: &str, scan_interval: Duration) -> Result<Site>;
    async fn delete_site(&self, id: i64) -> Result<()>;
    async fn get_sites(&self) -> Result<Vec<Site>>;
    async fn get_site(&self, id: i64) -> Result<Site>;
    async fn get_site_status(&self) -> Result<Vec<SiteStatus>>;
    async fn get_site_history(&self, id: i64, limit: i64) -> Result<Vec<SiteCheck>>;
    async fn record_check(&self, check: NewSiteCheck) -> Result<SiteCheck>;

    async fn add_agent(
        &self,
        name: &str,
        api_key_hash: &str,
        description: Option<&str>,
    ) -> Result<Agent>;
    async fn get_agents(&self) -> Result<Vec<Agent>>;
    async fn delete_agent(&self, id: i64) -> Result<()>;
    async fn validate_agent_api_key(&self, api_key_hash: &str) -> Result<Agent>;
    async fn touch_agent(
        &self,
        id: i64,
        remote_ip: Option<&str>,
        os: Option<&str>,
        platform: Option<&str>,
        architecture: Option<&str>,
        version: Option<&str>,
    ) -> Result<()>;

    async fn upsert_task(&self, task: NewMonitorTask) -> Result<MonitorTask>;
    async fn list_enabled_tasks(&self) -> Result<Vec<MonitorTask>>;
    async fn set_assignment(&self, agent_id: i64, task_id: i64, on: bool) -> Result<()>;
    async fn list_assignments_for_agent(&self, agent_id: i64) -> Result<Vec<AgentTaskAssignment>>;

    async fn record_result(&self, result: NewMonitorResult) -> Result<MonitorResult>;

    async fn get_stats(&self) -> Result<Stats>;
}

/// Runs an async fallible operation with bounded exponential backoff:
/// base 50ms, cap 2s, at most 5 attempts, doubling each retry. Only
/// `StoreError::Transient` is retried; everything else returns immediately.
pub(crate) async fn with_backoff<T, F, Fut>(mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    const BASE: Duration = Duration::from_millis(50);
    const CAP: Duration = Duration::from_secs(2);
    const MAX_ATTEMPTS: u32 = 5;

    let mut attempt = 0;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() && attempt + 1 < MAX_ATTEMPTS => {
                let backoff = BASE.saturating_mul(1 << attempt).min(CAP);
                tracing::warn!(attempt, ?backoff, "store contention, retrying: {e}");
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
