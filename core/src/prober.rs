//! HTTP and ICMP probe execution. Grounded on the `Probe` trait from the
//! network-monitoring reference corpus: a lazily-built `reqwest::Client`
//! shared across probes, and `surge_ping` for raw ICMP. Unlike that
//! reference the controller only ever needs two probe kinds, so there is
//! no trait object here — `probe()` dispatches on `MonitorType` directly.

use std::time::{Duration, Instant};

use once_cell::sync::Lazy;

use crate::model::{CheckStatus, MonitorType};

/// Normalized outcome of one probe. The Prober only ever reports `up` or
/// `down` — richer agent-side statuses (`degraded`, `timeout`, `error`)
/// are a judgment the caller layers on top (e.g. "the task's own deadline
/// fired before this outcome came back"), not something the Prober itself
/// distinguishes.
#[derive(Clone, Debug)]
pub struct ProbeOutcome {
    pub status: CheckStatus,
    pub response_time: Option<f64>,
    pub status_code: Option<u16>,
    pub error_message: Option<String>,
}

impl ProbeOutcome {
    pub fn is_up(&self) -> bool {
        matches!(self.status, CheckStatus::Up)
    }
}

const PING_DEADLINE: Duration = Duration::from_secs(5);

static HTTP_CLIENT: Lazy<reqwest::Client> = Lazy::new(|| {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .connect_timeout(Duration::from_secs(10))
        .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
        .build()
        .expect("building shared http client")
});

/// Runs the probe described by `monitor_type` against `url`. `timeout` is
/// the caller's own deadline (a `MonitorTask.timeout`, independent of the
/// Prober's internal per-protocol timeouts); the Prober never returns
/// `Err` since a failed probe is itself a successful observation.
pub async fn probe(monitor_type: MonitorType, url: &str, timeout: Duration) -> ProbeOutcome {
    let outcome = match monitor_type {
        MonitorType::Http => probe_http(url),
        MonitorType::Ping => probe_ping(url),
    };
    match tokio::time::timeout(timeout, outcome).await {
        Ok(outcome) => outcome,
        Err(_) => ProbeOutcome {
            status: CheckStatus::Down,
            response_time: None,
            status_code: None,
            error_message: Some(format!("timed out after {}", crate::duration::format(timeout))),
        },
    }
}

async fn probe_http(url: &str) -> ProbeOutcome {
    let started = Instant::now();
    match HTTP_CLIENT.get(url).send().await {
        Ok(resp) => {
            let code = resp.status().as_u16();
            let elapsed = started.elapsed().as_secs_f64();
            drop(resp);
            if (200..400).contains(&code) {
                ProbeOutcome {
                    status: CheckStatus::Up,
                    response_time: Some(elapsed),
                    status_code: Some(code),
                    error_message: None,
                }
            } else {
                ProbeOutcome {
                    status: CheckStatus::Down,
                    response_time: Some(elapsed),
                    status_code: Some(code),
                    error_message: Some(format!("HTTP {code}")),
                }
            }
        }
        Err(e) => ProbeOutcome {
            status: CheckStatus::Down,
            response_time: None,
            status_code: None,
            error_message: Some(e.to_string()),
        },
    }
}

async fn probe_ping(url: &str) -> ProbeOutcome {
    let host = url.trim_start_matches("ping://");
    let ip = match tokio::net::lookup_host((host, 0)).await {
        Ok(mut addrs) => addrs.next().map(|a| a.ip()),
        Err(_) => None,
    };

    let Some(ip) = ip else {
        return ProbeOutcome {
            status: CheckStatus::Down,
            response_time: None,
            status_code: None,
            error_message: Some("ping failed".into()),
        };
    };

    let started = Instant::now();
    let payload = [0u8; 32];
    match tokio::time::timeout(PING_DEADLINE, surge_ping::ping(ip, &payload)).await {
        Ok(Ok(_)) => ProbeOutcome {
            status: CheckStatus::Up,
            response_time: Some(started.elapsed().as_secs_f64()),
            status_code: None,
            error_message: None,
        },
        _ => ProbeOutcome {
            status: CheckStatus::Down,
            response_time: None,
            status_code: None,
            error_message: Some("ping failed".into()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ping_unresolvable_host_is_down_with_ping_failed() {
        let outcome = probe(
            MonitorType::Ping,
            "ping://this-host-does-not-resolve.invalid",
            Duration::from_secs(2),
        )
        .await;
        assert_eq!(outcome.status, CheckStatus::Down);
        assert_eq!(outcome.error_message.as_deref(), Some("ping failed"));
        assert!(outcome.response_time.is_none());
    }

    #[tokio::test]
    async fn ping_unroutable_address_is_down_with_ping_failed() {
        // RFC 5737/6598-style unroutable target, matching the S3 scenario.
        let outcome = probe(MonitorType::Ping, "ping://10.255.255.1", Duration::from_secs(6)).await;
        assert_eq!(outcome.status, CheckStatus::Down);
        assert_eq!(outcome.error_message.as_deref(), Some("ping failed"));
        assert!(outcome.response_time.is_none());
    }

    #[tokio::test]
    async fn http_connection_refused_is_down() {
        // Port 1 is reserved and nothing listens there in CI sandboxes.
        let outcome = probe_http("http://127.0.0.1:1/").await;
        assert_eq!(outcome.status, CheckStatus::Down);
        assert!(outcome.error_message.is_some());
    }
}
