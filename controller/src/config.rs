//! Environment-driven configuration, the same `from_env` shape
//! `edge_agent::AgentConfig` uses: every field has a sane default, missing
//! `DATABASE_URL` selects the embedded store instead of failing.

use std::time::Duration;

use probe_core::duration as dur;

#[derive(Clone, Debug)]
pub struct Config {
    pub http_addr: String,
    pub grpc_addr: String,
    pub database_url: Option<String>,
    pub sqlite_path: String,
    pub min_scan_interval: Duration,
    pub max_scan_interval: Duration,
    pub heartbeat_timeout: Duration,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            http_addr: env_or("CONTROLLER_HTTP_ADDR", "0.0.0.0:8080"),
            grpc_addr: env_or("CONTROLLER_GRPC_ADDR", "0.0.0.0:9090"),
            database_url: std::env::var("DATABASE_URL").ok().filter(|s| !s.is_empty()),
            sqlite_path: env_or("SQLITE_PATH", "controller.db"),
            min_scan_interval: env_duration("MIN_SCAN_INTERVAL", Duration::from_secs(5)),
            max_scan_interval: env_duration("MAX_SCAN_INTERVAL", Duration::from_secs(24 * 3600)),
            heartbeat_timeout: env_duration("HEARTBEAT_TIMEOUT_SECS", Duration::from_secs(90)),
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_duration(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|raw| dur::parse(&raw).ok())
        .unwrap_or(default)
}
