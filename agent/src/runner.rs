//! Shared conversion from a local `ProbeOutcome` to the wire `Result`
//! message, used by both the gRPC ticker and the HTTP fallback poller so
//! the two transports report identically-shaped results.

use chrono::Utc;
use probe_core::prober::ProbeOutcome;

use crate::pb;

pub struct TaskRunner;

impl TaskRunner {
    pub fn new() -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self)
    }

    pub fn to_result_proto(&self, task_id: i64, outcome: &ProbeOutcome) -> pb::Result {
        pb::Result {
            task_id: task_id.to_string(),
            status: outcome.status.as_str().to_string(),
            // MonitorResult.response_time is milliseconds (§3); the Prober
            // reports seconds, matching SiteCheck's unit.
            response_time_ms: outcome.response_time.map(|secs| secs * 1000.0),
            status_code: outcome.status_code.map(|c| c as u32),
            error_message: outcome.error_message.clone(),
            metadata_json: "{}".to_string(),
            checked_at: Utc::now().to_rfc3339(),
        }
    }
}
