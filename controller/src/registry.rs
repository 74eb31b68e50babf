//! In-memory agent connection tracking. Never persisted — mirrors the
//! teacher's `agent_streams: Arc<RwLock<HashMap<..>>>` field, generalized
//! from "agent streams" to the four operations spec names: register,
//! touch, drop, snapshot.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;

use crate::pb;

pub type AgentId = i64;
pub type OutboundSender = mpsc::Sender<pb::ControllerToAgent>;

#[derive(Clone, Debug)]
pub struct AgentMetadata {
    pub os: Option<String>,
    pub platform: Option<String>,
    pub architecture: Option<String>,
    pub version: Option<String>,
    pub remote_ip: Option<String>,
}

/// One live agent connection. `sender` is `None` for HTTP-fallback agents
/// that poll `GET /api/agent/tasks` instead of holding a push channel.
#[derive(Clone)]
pub struct ConnectedAgent {
    pub agent_id: AgentId,
    pub connected_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub metadata: AgentMetadata,
    pub sender: Option<OutboundSender>,
    pub cancel: CancellationToken,
}

#[derive(Clone)]
pub struct SnapshotEntry {
    pub agent_id: AgentId,
    pub connected_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub metadata: AgentMetadata,
}

pub struct AgentRegistry {
    agents: RwLock<HashMap<AgentId, ConnectedAgent>>,
    heartbeat_timeout: Duration,
}

impl AgentRegistry {
    pub fn new(heartbeat_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            agents: RwLock::new(HashMap::new()),
            heartbeat_timeout,
        })
    }

    /// Replaces any existing connection for `agent_id`, cancelling the old
    /// one first — last-writer-wins, matching §4.D.
    pub async fn register(&self, conn: ConnectedAgent) {
        let mut agents = self.agents.write().await;
        if let Some(previous) = agents.insert(conn.agent_id, conn) {
            previous.cancel.cancel();
            tracing::info!(agent_id = previous.agent_id, "agent connection superseded");
        }
    }

    pub async fn touch(&self, agent_id: AgentId) {
        let mut agents = self.agents.write().await;
        if let Some(entry) = agents.get_mut(&agent_id) {
            entry.last_seen = Utc::now();
        }
    }

    /// Like `touch`, but inserts a sender-less entry when `agent_id` isn't
    /// tracked yet — the HTTP fallback's `heartbeat` and `tasks` routes
    /// have no metadata to offer, unlike `register`, but still need the
    /// agent to count as online for `online_ids`/`tasks_for`.
    pub async fn touch_or_register(&self, agent_id: AgentId) {
        let mut agents = self.agents.write().await;
        match agents.get_mut(&agent_id) {
            Some(entry) => entry.last_seen = Utc::now(),
            None => {
                let now = Utc::now();
                agents.insert(
                    agent_id,
                    ConnectedAgent {
                        agent_id,
                        connected_at: now,
                        last_seen: now,
                        metadata: AgentMetadata {
                            os: None,
                            platform: None,
                            architecture: None,
                            version: None,
                            remote_ip: None,
                        },
                        sender: None,
                        cancel: CancellationToken::new(),
                    },
                );
            }
        }
    }

    pub async fn drop_agent(&self, agent_id: AgentId) {
        let mut agents = self.agents.write().await;
        if let Some(conn) = agents.remove(&agent_id) {
            conn.cancel.cancel();
        }
    }

    pub async fn snapshot(&self) -> Vec<SnapshotEntry> {
        let agents = self.agents.read().await;
        let mut out: Vec<_> = agents
            .values()
            .map(|c| SnapshotEntry {
                agent_id: c.agent_id,
                connected_at: c.connected_at,
                last_seen: c.last_seen,
                metadata: c.metadata.clone(),
            })
            .collect();
        out.sort_by_key(|e| e.agent_id);
        out
    }

    pub async fn is_online(&self, agent_id: AgentId) -> bool {
        let agents = self.agents.read().await;
        agents
            .get(&agent_id)
            .map(|c| Utc::now().signed_duration_since(c.last_seen).num_seconds() as u64 <= self.heartbeat_timeout.as_secs())
            .unwrap_or(false)
    }

    pub async fn online_ids(&self) -> Vec<AgentId> {
        let cutoff = self.heartbeat_timeout;
        let agents = self.agents.read().await;
        let mut ids: Vec<_> = agents
            .values()
            .filter(|c| Utc::now().signed_duration_since(c.last_seen).num_seconds() as u64 <= cutoff.as_secs())
            .map(|c| c.agent_id)
            .collect();
        ids.sort();
        ids
    }

    pub async fn sender_for(&self, agent_id: AgentId) -> Option<OutboundSender> {
        let agents = self.agents.read().await;
        agents.get(&agent_id).and_then(|c| c.sender.clone())
    }

    /// Drops connections whose `last_seen` has aged past `heartbeat_timeout`.
    /// Intended to run on a 15s interval for the life of the process.
    pub async fn sweep(&self) {
        let cutoff = self.heartbeat_timeout;
        let mut agents = self.agents.write().await;
        let stale: Vec<AgentId> = agents
            .values()
            .filter(|c| Utc::now().signed_duration_since(c.last_seen).num_seconds() as u64 > cutoff.as_secs())
            .map(|c| c.agent_id)
            .collect();
        for id in stale {
            if let Some(conn) = agents.remove(&id) {
                conn.cancel.cancel();
                tracing::warn!(agent_id = id, "agent connection aged out, dropping");
            }
        }
    }

    pub async fn run_sweep_loop(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(Duration::from_secs(15));
        loop {
            tokio::select! {
                _ = ticker.tick() => self.sweep().await,
                _ = shutdown.cancelled() => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn(id: AgentId, last_seen: DateTime<Utc>) -> ConnectedAgent {
        ConnectedAgent {
            agent_id: id,
            connected_at: last_seen,
            last_seen,
            metadata: AgentMetadata {
                os: None,
                platform: None,
                architecture: None,
                version: None,
                remote_ip: None,
            },
            sender: None,
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn register_replaces_and_cancels_previous() {
        let registry = AgentRegistry::new(Duration::from_secs(90));
        let first = conn(1, Utc::now());
        let first_token = first.cancel.clone();
        registry.register(first).await;
        registry.register(conn(1, Utc::now())).await;
        assert!(first_token.is_cancelled());
        assert_eq!(registry.snapshot().await.len(), 1);
    }

    #[tokio::test]
    async fn sweep_drops_stale_connections() {
        let registry = AgentRegistry::new(Duration::from_secs(1));
        let stale_at = Utc::now() - chrono::Duration::seconds(10);
        registry.register(conn(1, stale_at)).await;
        registry.sweep().await;
        assert!(registry.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn online_ids_sorted_ascending() {
        let registry = AgentRegistry::new(Duration::from_secs(90));
        registry.register(conn(3, Utc::now())).await;
        registry.register(conn(1, Utc::now())).await;
        registry.register(conn(2, Utc::now())).await;
        assert_eq!(registry.online_ids().await, vec![1, 2, 3]);
    }
}
