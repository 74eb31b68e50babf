//! HTTP fallback transport (§4.E): used only when a gRPC channel cannot
//! be established. Semantically equivalent to the gRPC path but strictly
//! less efficient — one request per register/heartbeat/result, and tasks
//! are polled rather than pushed.

use std::time::Duration;

use anyhow::{Context, Result};
use probe_core::model::MonitorType;

use crate::config::AgentConfig;
use crate::runner::TaskRunner;

#[derive(serde::Deserialize)]
struct PolledTask {
    id: i64,
    monitor_type: String,
    url: String,
    #[serde(rename = "timeout")]
    timeout_str: String,
}

/// Registers, polls the task list once, probes each task exactly once,
/// reports results, and sends one heartbeat. The outer reconnect loop
/// calls this repeatedly on its own backoff schedule while gRPC stays
/// unreachable, so a full round functions as one fallback "tick".
pub async fn run_round(cfg: &AgentConfig, runner: &std::sync::Arc<TaskRunner>) -> Result<()> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(15))
        .build()
        .context("building fallback http client")?;

    register(&client, cfg).await?;
    heartbeat(&client, cfg).await?;

    let tasks = poll_tasks(&client, cfg).await?;
    for task in tasks {
        let Ok(monitor_type) = task.monitor_type.parse::<MonitorType>() else {
            tracing::warn!(task_id = task.id, monitor_type = %task.monitor_type, "unknown monitor_type, skipping");
            continue;
        };
        let timeout = probe_core::duration::parse(&task.timeout_str).unwrap_or(Duration::from_secs(30));
        let outcome = probe_core::prober::probe(monitor_type, &task.url, timeout).await;
        let result = runner.to_result_proto(task.id, &outcome);
        report_result(&client, cfg, &result).await?;
    }

    Ok(())
}

fn auth_headers(cfg: &AgentConfig) -> Vec<(&'static str, String)> {
    vec![
        ("x-agent-id", cfg.agent_id.clone()),
        ("x-api-key", cfg.api_key.clone()),
    ]
}

async fn register(client: &reqwest::Client, cfg: &AgentConfig) -> Result<()> {
    let mut req = client.post(format!("{}/api/agent/register", cfg.controller_http)).json(&serde_json::json!({
        "os": std::env::consts::OS,
        "platform": std::env::consts::FAMILY,
        "architecture": std::env::consts::ARCH,
        "version": env!("CARGO_PKG_VERSION"),
    }));
    for (k, v) in auth_headers(cfg) {
        req = req.header(k, v);
    }
    req.send().await.context("posting register")?.error_for_status().context("register rejected")?;
    Ok(())
}

async fn heartbeat(client: &reqwest::Client, cfg: &AgentConfig) -> Result<()> {
    let mut req = client.post(format!("{}/api/agent/heartbeat", cfg.controller_http));
    for (k, v) in auth_headers(cfg) {
        req = req.header(k, v);
    }
    req.send().await.context("posting heartbeat")?.error_for_status().context("heartbeat rejected")?;
    Ok(())
}

async fn poll_tasks(client: &reqwest::Client, cfg: &AgentConfig) -> Result<Vec<PolledTask>> {
    let mut req = client.get(format!("{}/api/agent/tasks", cfg.controller_http));
    for (k, v) in auth_headers(cfg) {
        req = req.header(k, v);
    }
    let resp = req.send().await.context("polling tasks")?.error_for_status().context("tasks rejected")?;
    resp.json().await.context("decoding tasks response")
}

async fn report_result(client: &reqwest::Client, cfg: &AgentConfig, result: &crate::pb::Result) -> Result<()> {
    let mut req = client.post(format!("{}/api/agent/results", cfg.controller_http)).json(&serde_json::json!({
        "task_id": result.task_id.parse::<i64>().unwrap_or_default(),
        "status": result.status,
        "response_time_ms": result.response_time_ms,
        "status_code": result.status_code,
        "error_message": result.error_message,
        "metadata": serde_json::Value::Null,
    }));
    for (k, v) in auth_headers(cfg) {
        req = req.header(k, v);
    }
    req.send().await.context("posting result")?.error_for_status().context("result rejected")?;
    Ok(())
}
