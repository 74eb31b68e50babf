//! Reads a YAML fleet description and spawns one `agent` process per
//! entry, for demonstrating standalone mode without hand-exporting env
//! vars per agent. Each child runs until killed, same as the teacher's
//! launcher.

use std::collections::HashMap;
use std::process::Stdio;

use anyhow::{Context, Result};
use serde::Deserialize;
use tokio::process::Command;
use tokio::task::JoinHandle;

#[derive(Debug, Deserialize)]
struct FleetFile {
    controller_grpc: String,
    #[serde(default)]
    controller_http: Option<String>,
    agents: Vec<AgentCfg>,
}

#[derive(Debug, Deserialize)]
struct AgentCfg {
    id: String,
    api_key: String,
    name: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let fleet_path = std::env::var("FLEET_PATH").unwrap_or_else(|_| "fleet.yaml".to_string());
    let fleet = load_fleet(&fleet_path)?;

    let mut handles: Vec<JoinHandle<Result<()>>> = Vec::new();
    for agent in fleet.agents {
        let envs = build_envs(&agent, &fleet.controller_grpc, fleet.controller_http.as_deref());
        let handle = tokio::spawn(async move {
            let mut cmd = Command::new("cargo");
            cmd.arg("run")
                .arg("-p")
                .arg("agent")
                .envs(envs)
                .stdout(Stdio::inherit())
                .stderr(Stdio::inherit());
            println!("launching agent {}", agent.name);
            let status = cmd.status().await.context("launching agent")?;
            if !status.success() {
                anyhow::bail!("agent {} exited with {:?}", agent.name, status);
            }
            Ok(())
        });
        handles.push(handle);
    }

    for h in handles {
        let _ = h.await?;
    }
    Ok(())
}

fn load_fleet(path: &str) -> Result<FleetFile> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {path}"))?;
    serde_yaml::from_str(&raw).context("parsing fleet file")
}

fn build_envs(agent: &AgentCfg, controller_grpc: &str, controller_http: Option<&str>) -> HashMap<String, String> {
    let mut envs = HashMap::new();
    envs.insert("AGENT_ID".into(), agent.id.clone());
    envs.insert("AGENT_API_KEY".into(), agent.api_key.clone());
    envs.insert("AGENT_NAME".into(), agent.name.clone());
    envs.insert("CONTROLLER_GRPC".into(), controller_grpc.to_string());
    if let Some(http) = controller_http {
        envs.insert("CONTROLLER_HTTP".into(), http.to_string());
    }
    envs
}
