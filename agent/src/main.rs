//! Agent binary: maintains an outbound gRPC stream to the controller
//! (agent initiates; no inbound listener), runs each assigned task on its
//! own ticker via `probe_core::prober::probe`, and reports results and
//! heartbeats upstream. Reconnects with exponential backoff + full jitter
//! when the stream drops, falling back to the HTTP surface when the gRPC
//! channel cannot be established at all.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use futures_util::StreamExt;
use probe_core::model::MonitorType;
use probe_core::prober;
use rand::Rng;
use tokio::sync::{mpsc, RwLock};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub mod pb {
    tonic::include_proto!("agent");
}
use pb::agent_link_client::AgentLinkClient;
use pb::{agent_to_controller, controller_to_agent, AgentToController, ControllerToAgent, Register};

mod config;
mod http_fallback;
mod runner;

use config::AgentConfig;
use runner::TaskRunner;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cfg = AgentConfig::from_env().context("loading agent configuration")?;
    let runner = TaskRunner::new();

    run_reconnect_loop(cfg, runner).await;
    Ok(())
}

/// Reconnects forever with exponential backoff (base 1s, cap 60s, full
/// jitter). Falls back to the HTTP surface for one round when the gRPC
/// channel itself cannot be established — register/heartbeat/results go
/// over HTTP and tasks are polled, until a gRPC connection succeeds again.
async fn run_reconnect_loop(cfg: AgentConfig, runner: Arc<TaskRunner>) {
    let mut attempt: u32 = 0;
    loop {
        match AgentLinkClient::connect(cfg.controller_grpc.clone()).await {
            Ok(client) => {
                attempt = 0;
                if let Err(e) = run_grpc_session(client, &cfg, &runner).await {
                    tracing::warn!(error = %e, "grpc session ended, will reconnect");
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "grpc connect failed, falling back to http for this round");
                if let Err(e) = http_fallback::run_round(&cfg, &runner).await {
                    tracing::warn!(error = %e, "http fallback round failed");
                }
            }
        }

        let backoff = reconnect_backoff(attempt);
        attempt = attempt.saturating_add(1);
        tokio::time::sleep(backoff).await;
    }
}

fn reconnect_backoff(attempt: u32) -> Duration {
    const BASE: Duration = Duration::from_secs(1);
    const CAP: Duration = Duration::from_secs(60);
    let exp = BASE.saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX)).min(CAP);
    let jitter_ms = rand::thread_rng().gen_range(0..=exp.as_millis() as u64);
    Duration::from_millis(jitter_ms)
}

async fn run_grpc_session(
    mut client: AgentLinkClient<tonic::transport::Channel>,
    cfg: &AgentConfig,
    runner: &Arc<TaskRunner>,
) -> Result<()> {
    let (tx, rx) = mpsc::channel::<AgentToController>(32);
    let outbound = ReceiverStream::new(rx);

    let mut request = tonic::Request::new(outbound);
    request
        .metadata_mut()
        .insert("x-agent-id", cfg.agent_id.parse()?);
    request
        .metadata_mut()
        .insert("x-api-key", cfg.api_key.parse()?);

    let response = client.stream(request).await.context("opening agent stream")?;
    let mut inbound = response.into_inner();

    send_register(&tx, &cfg.agent_id).await?;

    let active: Arc<RwLock<HashMap<i64, CancellationToken>>> = Arc::new(RwLock::new(HashMap::new()));
    let heartbeat_tx = tx.clone();
    let heartbeat_agent_id = cfg.agent_id.clone();
    let heartbeat_handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(20));
        loop {
            ticker.tick().await;
            let msg = AgentToController {
                msg: Some(agent_to_controller::Msg::Heartbeat(pb::Heartbeat {
                    agent_id: heartbeat_agent_id.clone(),
                    timestamp: Utc::now().to_rfc3339(),
                })),
            };
            if heartbeat_tx.send(msg).await.is_err() {
                break;
            }
        }
    });

    let result = loop {
        match inbound.next().await {
            Some(Ok(frame)) => {
                if let Some(controller_to_agent::Msg::Tasks(tasks)) = frame.msg {
                    reseat_tasks(Arc::clone(&active), tasks.tasks, tx.clone(), Arc::clone(runner));
                }
                // Heartbeat push from the controller needs no reply; its
                // only purpose is to keep the connection from idling out.
            }
            Some(Err(e)) => break Err(anyhow::anyhow!(e)),
            None => break Ok(()),
        }
    };

    heartbeat_handle.abort();
    let stale = active.write().await.drain().map(|(_, c)| c).collect::<Vec<_>>();
    for c in stale {
        c.cancel();
    }
    result
}

async fn send_register(tx: &mpsc::Sender<AgentToController>, agent_id: &str) -> Result<()> {
    let msg = AgentToController {
        msg: Some(agent_to_controller::Msg::Register(Register {
            agent_id: agent_id.to_string(),
            os: std::env::consts::OS.to_string(),
            platform: std::env::consts::FAMILY.to_string(),
            architecture: std::env::consts::ARCH.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        })),
    };
    tx.send(msg).await.context("sending register message")
}

/// Replaces the set of locally-running task tickers with the one the
/// controller just pushed: stop anything no longer assigned, start
/// anything new. Pushes are always the full desired set (§4.F), so a
/// diff against the currently-running ids is sufficient.
fn reseat_tasks(
    active: Arc<RwLock<HashMap<i64, CancellationToken>>>,
    tasks: Vec<pb::Task>,
    tx: mpsc::Sender<AgentToController>,
    runner: Arc<TaskRunner>,
) {
    tokio::spawn(async move {
        let desired: HashMap<i64, pb::Task> = tasks
            .into_iter()
            .filter_map(|t| t.task_id.parse::<i64>().ok().map(|id| (id, t)))
            .collect();

        let mut guard = active.write().await;
        let stale: Vec<i64> = guard.keys().copied().filter(|id| !desired.contains_key(id)).collect();
        for id in stale {
            if let Some(cancel) = guard.remove(&id) {
                cancel.cancel();
            }
        }

        for (id, task) in desired {
            if guard.contains_key(&id) {
                continue;
            }
            let Ok(monitor_type) = task.monitor_type.parse::<MonitorType>() else {
                tracing::warn!(task_id = id, monitor_type = %task.monitor_type, "unknown monitor_type, skipping");
                continue;
            };
            let cancel = CancellationToken::new();
            guard.insert(id, cancel.clone());
            tokio::spawn(run_task_ticker(
                id,
                monitor_type,
                task.url,
                Duration::from_millis(task.interval_ms),
                Duration::from_millis(task.timeout_ms),
                tx.clone(),
                cancel,
                Arc::clone(&runner),
            ));
        }
    });
}

async fn run_task_ticker(
    task_id: i64,
    monitor_type: MonitorType,
    url: String,
    interval: Duration,
    timeout: Duration,
    tx: mpsc::Sender<AgentToController>,
    cancel: CancellationToken,
    runner: Arc<TaskRunner>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let outcome = prober::probe(monitor_type, &url, timeout).await;
                let result = runner.to_result_proto(task_id, &outcome);
                let msg = AgentToController {
                    msg: Some(agent_to_controller::Msg::Result(result)),
                };
                if tx.send(msg).await.is_err() {
                    break;
                }
            }
            _ = cancel.cancelled() => break,
        }
    }
}
