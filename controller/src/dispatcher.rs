//! Computes which tasks each online agent should run and pushes updates
//! when the desired set changes. Sorts before round-robin so map
//! iteration order never leaks into the assignment (§9).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use probe_core::model::MonitorTask;
use probe_core::Store;
use tokio::sync::{Mutex, RwLock};

use crate::pb;
use crate::registry::{AgentId, AgentRegistry};

pub struct Dispatcher {
    store: Arc<dyn Store>,
    registry: Arc<AgentRegistry>,
    last_pushed: RwLock<HashMap<AgentId, Vec<i64>>>,
    push_locks: Mutex<HashMap<AgentId, Arc<Mutex<()>>>>,
    /// Whether the controller's own Scheduler is probing every enabled
    /// task locally (standalone composition). All-or-nothing per
    /// deployment, not per task, so unlike a cached id set this can never
    /// go stale when the task catalog changes at runtime.
    local_scheduling: AtomicBool,
}

impl Dispatcher {
    pub fn new(store: Arc<dyn Store>, registry: Arc<AgentRegistry>) -> Arc<Self> {
        Arc::new(Self {
            store,
            registry,
            last_pushed: RwLock::new(HashMap::new()),
            push_locks: Mutex::new(HashMap::new()),
            local_scheduling: AtomicBool::new(false),
        })
    }

    pub fn set_local_scheduling(&self, enabled: bool) {
        self.local_scheduling.store(enabled, Ordering::Relaxed);
    }

    /// Deterministic mapping from sorted tasks onto sorted online agents:
    /// `tasks[i % agents.len()]` assigned to `agents[i]`.
    pub fn assign(agent_ids: &[AgentId], task_ids: &[i64]) -> HashMap<AgentId, Vec<i64>> {
        let mut out: HashMap<AgentId, Vec<i64>> = agent_ids.iter().map(|a| (*a, Vec::new())).collect();
        if agent_ids.is_empty() {
            return out;
        }
        for (i, task_id) in task_ids.iter().enumerate() {
            let agent = agent_ids[i % agent_ids.len()];
            out.get_mut(&agent).unwrap().push(*task_id);
        }
        out
    }

    /// Recomputes desired assignments and pushes a full `Tasks` message to
    /// every agent whose desired set changed since the last push.
    pub async fn recompute(&self) -> probe_core::Result<()> {
        let enabled = self.store.list_enabled_tasks().await?;
        let local_scheduling = self.local_scheduling.load(Ordering::Relaxed);
        let mut task_ids: Vec<i64> = enabled
            .iter()
            .filter(|t| t.enabled && !local_scheduling)
            .map(|t| t.id)
            .collect();
        task_ids.sort_unstable();

        let agent_ids = self.registry.online_ids().await;
        let desired = Self::assign(&agent_ids, &task_ids);

        let task_by_id: HashMap<i64, MonitorTask> = enabled.into_iter().map(|t| (t.id, t)).collect();

        for (agent_id, mut desired_tasks) in desired {
            desired_tasks.sort_unstable();

            let changed = {
                let last = self.last_pushed.read().await;
                last.get(&agent_id).map(|v| v.as_slice()) != Some(desired_tasks.as_slice())
            };
            if !changed {
                continue;
            }

            let lock = self.agent_push_lock(agent_id).await;
            let _guard = lock.lock().await;

            // Re-check under the per-agent lock: a newer recompute may
            // already have pushed this exact set while we waited.
            let still_changed = {
                let last = self.last_pushed.read().await;
                last.get(&agent_id).map(|v| v.as_slice()) != Some(desired_tasks.as_slice())
            };
            if !still_changed {
                continue;
            }

            if let Some(sender) = self.registry.sender_for(agent_id).await {
                let tasks_pb = desired_tasks
                    .iter()
                    .filter_map(|id| task_by_id.get(id))
                    .map(task_to_proto)
                    .collect();
                let msg = pb::ControllerToAgent {
                    msg: Some(pb::controller_to_agent::Msg::Tasks(pb::Tasks { tasks: tasks_pb })),
                };
                if sender.send(msg).await.is_err() {
                    tracing::warn!(agent_id, "agent channel closed before push delivered");
                    continue;
                }
            }

            self.last_pushed.write().await.insert(agent_id, desired_tasks);
        }

        Ok(())
    }

    async fn agent_push_lock(&self, agent_id: AgentId) -> Arc<Mutex<()>> {
        let mut locks = self.push_locks.lock().await;
        Arc::clone(locks.entry(agent_id).or_insert_with(|| Arc::new(Mutex::new(()))))
    }

    pub async fn forget_agent(&self, agent_id: AgentId) {
        self.last_pushed.write().await.remove(&agent_id);
    }

    /// Resolves the agent's current desired task set to full `MonitorTask`
    /// rows. Backs the HTTP fallback's poll-based `GET /api/agent/tasks`,
    /// which has no push channel to deliver `recompute`'s `Tasks` message.
    pub async fn tasks_for(&self, agent_id: AgentId) -> probe_core::Result<Vec<MonitorTask>> {
        self.recompute().await?;
        let task_ids = self
            .last_pushed
            .read()
            .await
            .get(&agent_id)
            .cloned()
            .unwrap_or_default();
        let all = self.store.list_enabled_tasks().await?;
        let by_id: HashMap<i64, MonitorTask> = all.into_iter().map(|t| (t.id, t)).collect();
        Ok(task_ids.into_iter().filter_map(|id| by_id.get(&id).cloned()).collect())
    }
}

fn task_to_proto(task: &MonitorTask) -> pb::Task {
    pb::Task {
        task_id: task.id.to_string(),
        monitor_type: task.monitor_type.as_str().to_string(),
        url: task.url.clone(),
        interval_ms: task.interval.as_millis() as u64,
        timeout_ms: task.timeout.as_millis() as u64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assign_is_deterministic_round_robin() {
        let agents = vec![1, 2];
        let tasks = vec![10, 20, 30];
        let assignment = Dispatcher::assign(&agents, &tasks);
        assert_eq!(assignment[&1], vec![10, 30]);
        assert_eq!(assignment[&2], vec![20]);
    }

    #[test]
    fn assign_with_no_agents_is_empty() {
        let assignment = Dispatcher::assign(&[], &[1, 2, 3]);
        assert!(assignment.is_empty());
    }

    #[test]
    fn assign_reassigns_evenly_after_agent_drops() {
        let tasks = vec![1, 2, 3];
        let with_two = Dispatcher::assign(&[1, 2], &tasks);
        assert_eq!(with_two[&1], vec![1, 3]);
        assert_eq!(with_two[&2], vec![2]);

        let with_one = Dispatcher::assign(&[1], &tasks);
        assert_eq!(with_one[&1], vec![1, 2, 3]);
    }
}
