//! Validates and persists results received from agents, over either
//! transport. Invalid results are logged and dropped without closing the
//! connection; storage failures are retried by the Store's own backoff,
//! and exhaustion is logged and counted rather than surfaced to the agent.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use probe_core::model::NewMonitorResult;
use probe_core::Store;

use crate::registry::AgentRegistry;

/// Count of results dropped after validation or storage failure, exposed
/// as a `tracing` field rather than a persisted metric (spec's Non-goals
/// exclude long-term rollups; this is process-lifetime observability).
pub static DROPPED_RESULTS: AtomicU64 = AtomicU64::new(0);

pub async fn handle_result(
    store: &Arc<dyn Store>,
    registry: &Arc<AgentRegistry>,
    agent_id: i64,
    result: NewMonitorResult,
) {
    if let Err(e) = result.validate() {
        tracing::warn!(agent_id, task_id = result.task_id, error = %e, "dropping invalid result");
        DROPPED_RESULTS.fetch_add(1, Ordering::Relaxed);
        return;
    }

    match store.record_result(result).await {
        Ok(_) => {}
        Err(e) => {
            tracing::error!(agent_id, error = %e, "dropping result after store failure");
            DROPPED_RESULTS.fetch_add(1, Ordering::Relaxed);
        }
    }

    registry.touch(agent_id).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use probe_core::model::ResultStatus;
    use probe_core::SqliteStore;
    use std::time::Duration;

    #[tokio::test]
    async fn invalid_result_is_dropped_and_not_persisted() {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
        let registry = AgentRegistry::new(Duration::from_secs(90));
        let before = DROPPED_RESULTS.load(Ordering::Relaxed);

        handle_result(
            &store,
            &registry,
            1,
            NewMonitorResult {
                task_id: 1,
                agent_id: 1,
                status: ResultStatus::Up,
                response_time: Some(42.0),
                status_code: Some(700),
                error_message: None,
                metadata: serde_json::json!({}),
                checked_at: chrono::Utc::now(),
            },
        )
        .await;

        assert_eq!(DROPPED_RESULTS.load(Ordering::Relaxed), before + 1);
    }

    #[tokio::test]
    async fn valid_result_touches_registry() {
        use crate::registry::{AgentMetadata, ConnectedAgent};
        use tokio_util::sync::CancellationToken;

        let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
        let site = store.add_site("http://e/", "e", Duration::from_secs(10)).await.unwrap();
        let task = store
            .upsert_task(probe_core::model::NewMonitorTask {
                site_id: site.id,
                monitor_type: probe_core::model::MonitorType::Http,
                url: site.url.clone(),
                interval: Duration::from_secs(10),
                timeout: Duration::from_secs(5),
                enabled: true,
            })
            .await
            .unwrap();

        let registry = AgentRegistry::new(Duration::from_secs(90));
        let old_seen = chrono::Utc::now() - chrono::Duration::seconds(60);
        registry
            .register(ConnectedAgent {
                agent_id: 1,
                connected_at: old_seen,
                last_seen: old_seen,
                metadata: AgentMetadata {
                    os: None,
                    platform: None,
                    architecture: None,
                    version: None,
                    remote_ip: None,
                },
                sender: None,
                cancel: CancellationToken::new(),
            })
            .await;

        handle_result(
            &store,
            &registry,
            1,
            NewMonitorResult {
                task_id: task.id,
                agent_id: 1,
                status: ResultStatus::Up,
                response_time: Some(42.0),
                status_code: Some(200),
                error_message: None,
                metadata: serde_json::json!({}),
                checked_at: chrono::Utc::now(),
            },
        )
        .await;

        let snapshot = registry.snapshot().await;
        assert!(snapshot[0].last_seen > old_seen);
    }
}
