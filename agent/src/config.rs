//! Environment-driven configuration, the same shape as
//! `edge_agent::AgentConfig::from_env` generalized to the probe agent's
//! fields (`CONTROLLER_GRPC`, `AGENT_ID`, `AGENT_API_KEY`, `AGENT_NAME`).

use anyhow::{Context, Result};

#[derive(Clone, Debug)]
pub struct AgentConfig {
    pub agent_id: String,
    pub api_key: String,
    pub name: String,
    pub controller_grpc: String,
    pub controller_http: String,
}

impl AgentConfig {
    pub fn from_env() -> Result<Self> {
        let agent_id = std::env::var("AGENT_ID").context("AGENT_ID not set")?;
        let api_key = std::env::var("AGENT_API_KEY").context("AGENT_API_KEY not set")?;
        let name = std::env::var("AGENT_NAME").unwrap_or_else(|_| format!("agent-{agent_id}"));

        let raw_grpc = std::env::var("CONTROLLER_GRPC").context("CONTROLLER_GRPC not set")?;
        let controller_grpc = if raw_grpc.starts_with("http://") || raw_grpc.starts_with("https://") {
            raw_grpc
        } else {
            format!("http://{raw_grpc}")
        };

        let controller_http = std::env::var("CONTROLLER_HTTP")
            .unwrap_or_else(|_| "http://127.0.0.1:8080".to_string());

        Ok(Self {
            agent_id,
            api_key,
            name,
            controller_grpc,
            controller_http,
        })
    }
}
