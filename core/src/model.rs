use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::duration;
use crate::error::StoreError;

/// An endpoint the controller is asked to monitor.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Site {
    pub id: i64,
    pub url: String,
    pub name: String,
    #[serde(with = "duration_secs")]
    pub scan_interval: Duration,
    pub created_at: DateTime<Utc>,
}

/// `up`/`down` outcome of a single local probe.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Up,
    Down,
}

impl CheckStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckStatus::Up => "up",
            CheckStatus::Down => "down",
        }
    }
}

/// One probe result recorded against a site by the local Scheduler/Prober
/// path. Append-only; never mutated after insertion.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SiteCheck {
    pub id: i64,
    pub site_id: i64,
    pub status: CheckStatus,
    pub response_time: Option<f64>,
    pub status_code: Option<u16>,
    pub error_message: Option<String>,
    pub checked_at: DateTime<Utc>,
}

/// Fields supplied by the Prober when recording a new check; `id` is
/// assigned by the Store.
#[derive(Clone, Debug)]
pub struct NewSiteCheck {
    pub site_id: i64,
    pub status: CheckStatus,
    pub response_time: Option<f64>,
    pub status_code: Option<u16>,
    pub error_message: Option<String>,
    pub checked_at: DateTime<Utc>,
}

impl NewSiteCheck {
    /// Enforces the §3 range invariants before the Store ever sees this.
    pub fn validate(&self) -> Result<(), StoreError> {
        if let Some(code) = self.status_code {
            if !(100..=599).contains(&code) {
                return Err(StoreError::invalid(format!(
                    "status_code {code} out of range [100,599]"
                )));
            }
        }
        if let Some(rt) = self.response_time {
            if rt < 0.0 {
                return Err(StoreError::invalid("response_time must be >= 0"));
            }
        }
        Ok(())
    }
}

/// Liveness state of an Agent row. Derived from connection state, never
/// user-writable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Online,
    Offline,
    Unknown,
}

/// A remote probe executor registered with the controller.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Agent {
    pub id: i64,
    pub name: String,
    #[serde(skip_serializing)]
    pub api_key_hash: String,
    pub description: Option<String>,
    pub os: Option<String>,
    pub platform: Option<String>,
    pub architecture: Option<String>,
    pub version: Option<String>,
    pub remote_ip: Option<String>,
    pub last_seen: Option<DateTime<Utc>>,
    pub status: AgentStatus,
    pub created_at: DateTime<Utc>,
}

/// What kind of probe a `MonitorTask` describes. Deliberately small and
/// closed: the Prober only knows how to execute these two.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MonitorType {
    Http,
    Ping,
}

impl MonitorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MonitorType::Http => "http",
            MonitorType::Ping => "ping",
        }
    }

    pub fn from_url(url: &str) -> Result<Self, StoreError> {
        if url.starts_with("http://") || url.starts_with("https://") {
            Ok(MonitorType::Http)
        } else if url.starts_with("ping://") {
            Ok(MonitorType::Ping)
        } else {
            Err(StoreError::invalid(format!("unsupported url scheme: {url}")))
        }
    }
}

impl std::str::FromStr for MonitorType {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "http" => Ok(MonitorType::Http),
            "ping" => Ok(MonitorType::Ping),
            other => Err(StoreError::invalid(format!("unknown monitor_type: {other}"))),
        }
    }
}

/// A probe definition the controller may assign to agents.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MonitorTask {
    pub id: i64,
    pub site_id: i64,
    pub monitor_type: MonitorType,
    pub url: String,
    #[serde(with = "duration_secs")]
    pub interval: Duration,
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub struct NewMonitorTask {
    pub site_id: i64,
    pub monitor_type: MonitorType,
    pub url: String,
    pub interval: Duration,
    pub timeout: Duration,
    pub enabled: bool,
}

/// Which agent owns which task.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentTaskAssignment {
    pub agent_id: i64,
    pub task_id: i64,
    pub assigned: bool,
    pub updated_at: DateTime<Utc>,
}

/// `up`/`down`/`degraded`/`timeout`/`error` outcome of a remote probe.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    Up,
    Down,
    Degraded,
    Timeout,
    Error,
}

impl ResultStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultStatus::Up => "up",
            ResultStatus::Down => "down",
            ResultStatus::Degraded => "degraded",
            ResultStatus::Timeout => "timeout",
            ResultStatus::Error => "error",
        }
    }
}

impl std::str::FromStr for ResultStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "up" => Ok(ResultStatus::Up),
            "down" => Ok(ResultStatus::Down),
            "degraded" => Ok(ResultStatus::Degraded),
            "timeout" => Ok(ResultStatus::Timeout),
            "error" => Ok(ResultStatus::Error),
            other => Err(StoreError::invalid(format!("unknown result status: {other}"))),
        }
    }
}

/// A result produced by an agent executing a task. Append-only.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MonitorResult {
    pub id: i64,
    pub task_id: i64,
    pub agent_id: i64,
    pub status: ResultStatus,
    pub response_time: Option<f64>,
    pub status_code: Option<u16>,
    pub error_message: Option<String>,
    pub metadata: serde_json::Value,
    pub checked_at: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub struct NewMonitorResult {
    pub task_id: i64,
    pub agent_id: i64,
    pub status: ResultStatus,
    pub response_time: Option<f64>,
    pub status_code: Option<u16>,
    pub error_message: Option<String>,
    pub metadata: serde_json::Value,
    pub checked_at: DateTime<Utc>,
}

impl NewMonitorResult {
    /// §4.G validation: invalid results are logged and dropped, never
    /// persisted and never close the connection.
    pub fn validate(&self) -> Result<(), StoreError> {
        if self.task_id <= 0 {
            return Err(StoreError::invalid("task_id must be > 0"));
        }
        if let Some(code) = self.status_code {
            if !(100..=599).contains(&code) {
                return Err(StoreError::invalid(format!(
                    "status_code {code} out of range [100,599]"
                )));
            }
        }
        if let Some(rt) = self.response_time {
            if rt < 0.0 {
                return Err(StoreError::invalid("response_time must be >= 0"));
            }
        }
        Ok(())
    }
}

/// The newest outcome for a site, from either the local or remote path,
/// normalized to one shape for the status view.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LatestOutcome {
    pub source: OutcomeSource,
    pub status: String,
    pub response_time: Option<f64>,
    pub status_code: Option<u16>,
    pub error_message: Option<String>,
    pub checked_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeSource {
    Local,
    Agent,
}

impl From<&SiteCheck> for LatestOutcome {
    fn from(c: &SiteCheck) -> Self {
        LatestOutcome {
            source: OutcomeSource::Local,
            status: c.status.as_str().to_string(),
            response_time: c.response_time,
            status_code: c.status_code,
            error_message: c.error_message.clone(),
            checked_at: c.checked_at,
        }
    }
}

impl From<&MonitorResult> for LatestOutcome {
    fn from(r: &MonitorResult) -> Self {
        LatestOutcome {
            source: OutcomeSource::Agent,
            status: r.status.as_str().to_string(),
            response_time: r.response_time,
            status_code: r.status_code,
            error_message: r.error_message.clone(),
            checked_at: r.checked_at,
        }
    }
}

/// A Site joined with its newest SiteCheck-or-MonitorResult, plus up/down
/// totals — §3's derived SiteStatus view.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SiteStatus {
    pub site: Site,
    pub latest: Option<LatestOutcome>,
    pub up_count: i64,
    pub down_count: i64,
}

/// `Store::get_stats` contract output, field names matching the wire
/// shape of `GET /api/stats` (§6).
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct Stats {
    #[serde(rename = "total_sites")]
    pub total: i64,
    #[serde(rename = "sites_up")]
    pub up: i64,
    #[serde(rename = "sites_down")]
    pub down: i64,
    #[serde(rename = "average_response_time")]
    pub avg_response_time: f64,
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    use crate::duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&duration::format(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(d)?;
        duration::parse(&raw).map_err(serde::de::Error::custom)
    }
}
