//! Per-site tickers driving the local probe path. Grounded in the
//! teacher's per-asset tick loop, generalized from "one shared loop" to
//! "one cancellable task per site" since each site has its own interval.

use std::collections::HashMap;
use std::sync::Arc;

use probe_core::model::{CheckStatus, MonitorType, NewSiteCheck, Site};
use probe_core::{prober, Store};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

struct TickerHandle {
    interval: std::time::Duration,
    cancel: CancellationToken,
    join: tokio::task::JoinHandle<()>,
}

pub struct Scheduler {
    store: Arc<dyn Store>,
    tickers: Mutex<HashMap<i64, TickerHandle>>,
    site_locks: Mutex<HashMap<i64, Arc<Mutex<()>>>>,
}

impl Scheduler {
    pub fn new(store: Arc<dyn Store>) -> Arc<Self> {
        Arc::new(Self {
            store,
            tickers: Mutex::new(HashMap::new()),
            site_locks: Mutex::new(HashMap::new()),
        })
    }

    /// Loads all sites and starts one ticker each, at their configured
    /// interval. Call once at startup.
    pub async fn start(self: &Arc<Self>) -> probe_core::Result<()> {
        let sites = self.store.get_sites().await?;
        for site in sites {
            self.spawn_ticker(site).await;
        }
        Ok(())
    }

    /// Diffs the live ticker map against the Store: stops removed sites,
    /// starts added sites, reseats sites whose interval changed, leaves
    /// unchanged sites alone (invariant 9 — never restart a no-op ticker).
    pub async fn refresh_monitoring(self: &Arc<Self>) -> probe_core::Result<()> {
        let sites = self.store.get_sites().await?;
        let live_ids: std::collections::HashSet<i64> = sites.iter().map(|s| s.id).collect();

        let stale_ids: Vec<i64> = {
            let tickers = self.tickers.lock().await;
            tickers
                .keys()
                .copied()
                .filter(|id| !live_ids.contains(id))
                .collect()
        };
        for id in stale_ids {
            self.stop_ticker(id).await;
        }

        for site in sites {
            let needs_spawn = {
                let tickers = self.tickers.lock().await;
                match tickers.get(&site.id) {
                    None => true,
                    Some(existing) => existing.interval != site.scan_interval,
                }
            };
            if needs_spawn {
                self.stop_ticker(site.id).await;
                self.spawn_ticker(site).await;
            }
        }
        Ok(())
    }

    async fn spawn_ticker(self: &Arc<Self>, site: Site) {
        let cancel = CancellationToken::new();
        let interval = site.scan_interval;
        let this = Arc::clone(self);
        let site_id = site.id;
        let token = cancel.clone();

        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        this.check_site(site_id).await;
                    }
                    _ = token.cancelled() => break,
                }
            }
        });

        let mut tickers = self.tickers.lock().await;
        tickers.insert(
            site_id,
            TickerHandle {
                interval,
                cancel,
                join,
            },
        );
    }

    async fn stop_ticker(&self, site_id: i64) {
        let handle = {
            let mut tickers = self.tickers.lock().await;
            tickers.remove(&site_id)
        };
        if let Some(handle) = handle {
            handle.cancel.cancel();
            let _ = handle.join.await;
        }
    }

    async fn site_lock(&self, site_id: i64) -> Arc<Mutex<()>> {
        let mut locks = self.site_locks.lock().await;
        Arc::clone(locks.entry(site_id).or_insert_with(|| Arc::new(Mutex::new(()))))
    }

    async fn check_site(&self, site_id: i64) {
        let lock = self.site_lock(site_id).await;
        let _guard = lock.lock().await;

        let site = match self.store.get_site(site_id).await {
            Ok(site) => site,
            Err(e) => {
                tracing::warn!(site_id, error = %e, "site vanished before scheduled check");
                return;
            }
        };

        let monitor_type = match MonitorType::from_url(&site.url) {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!(site_id, error = %e, "unprobeable site url");
                return;
            }
        };

        let outcome = prober::probe(monitor_type, &site.url, site.scan_interval).await;
        let check = NewSiteCheck {
            site_id,
            status: outcome.status,
            response_time: outcome.response_time,
            status_code: outcome.status_code,
            error_message: outcome.error_message,
            checked_at: chrono::Utc::now(),
        };
        if let Err(e) = self.store.record_check(check).await {
            tracing::error!(site_id, error = %e, "failed to record scheduled check");
        }
    }

    /// Runs a synchronous probe for the named sites (or all sites when
    /// `ids` is `None`), records each, and returns the outcomes. Backs the
    /// manual-check endpoint.
    pub async fn check_sites_by_id(&self, ids: Option<Vec<i64>>) -> probe_core::Result<Vec<(i64, CheckStatus)>> {
        let targets = match ids {
            Some(ids) => ids,
            None => self.store.get_sites().await?.into_iter().map(|s| s.id).collect(),
        };

        let mut results = Vec::with_capacity(targets.len());
        for site_id in targets {
            let lock = self.site_lock(site_id).await;
            let _guard = lock.lock().await;

            let site = self.store.get_site(site_id).await?;
            let monitor_type = MonitorType::from_url(&site.url)?;
            let outcome = prober::probe(monitor_type, &site.url, site.scan_interval).await;
            let status = outcome.status;
            self.store
                .record_check(NewSiteCheck {
                    site_id,
                    status: outcome.status,
                    response_time: outcome.response_time,
                    status_code: outcome.status_code,
                    error_message: outcome.error_message,
                    checked_at: chrono::Utc::now(),
                })
                .await?;
            results.push((site_id, status));
        }
        Ok(results)
    }

    /// Cancels every ticker and waits up to 30s for in-flight probes to
    /// finish, matching §5's shutdown grace window.
    pub async fn shutdown(&self) {
        let handles: Vec<TickerHandle> = {
            let mut tickers = self.tickers.lock().await;
            tickers.drain().map(|(_, h)| h).collect()
        };
        for handle in &handles {
            handle.cancel.cancel();
        }
        let joins = handles.into_iter().map(|h| h.join);
        let _ = tokio::time::timeout(std::time::Duration::from_secs(30), futures_util::future::join_all(joins)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use probe_core::SqliteStore;
    use std::time::Duration;

    async fn store_with_site(interval: Duration) -> (Arc<dyn Store>, i64) {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
        let site = store.add_site("http://127.0.0.1:1/", "s", interval).await.unwrap();
        (store, site.id)
    }

    #[tokio::test]
    async fn refresh_with_no_changes_does_not_restart_tickers() {
        let (store, _id) = store_with_site(Duration::from_secs(5)).await;
        let scheduler = Scheduler::new(store);
        scheduler.start().await.unwrap();

        let before_cancel = {
            let tickers = scheduler.tickers.lock().await;
            tickers.values().next().unwrap().cancel.clone()
        };
        scheduler.refresh_monitoring().await.unwrap();
        scheduler.refresh_monitoring().await.unwrap();

        assert!(!before_cancel.is_cancelled());
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn refresh_removes_deleted_site_ticker() {
        let (store, id) = store_with_site(Duration::from_secs(5)).await;
        let scheduler = Scheduler::new(store.clone());
        scheduler.start().await.unwrap();
        assert_eq!(scheduler.tickers.lock().await.len(), 1);

        store.delete_site(id).await.unwrap();
        scheduler.refresh_monitoring().await.unwrap();
        assert_eq!(scheduler.tickers.lock().await.len(), 0);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn manual_check_records_a_check() {
        let (store, id) = store_with_site(Duration::from_secs(30)).await;
        let scheduler = Scheduler::new(store.clone());
        let outcomes = scheduler.check_sites_by_id(Some(vec![id])).await.unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(store.get_site_history(id, 10).await.unwrap().len(), 1);
    }

    /// Minimal single-shot HTTP stub: accepts one connection, sleeps
    /// `delay`, writes `status_line` and closes. Good enough to drive the
    /// real `reqwest`-backed Prober end to end without a mock-server crate.
    async fn spawn_http_stub(status_line: &'static str, delay: Duration) -> std::net::SocketAddr {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;
                tokio::time::sleep(delay).await;
                let body = "ok";
                let response = format!(
                    "{status_line}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });
        addr
    }

    /// S1: a 200 response with ~50ms latency records an `up` SiteCheck
    /// with `status_code=200` and `response_time` in [0.03, 0.5].
    #[tokio::test]
    async fn s1_http_probe_success_records_up() {
        let addr = spawn_http_stub("HTTP/1.1 200 OK", Duration::from_millis(50)).await;
        let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
        let site = store
            .add_site(&format!("http://{addr}/"), "ex", Duration::from_secs(10))
            .await
            .unwrap();
        let scheduler = Scheduler::new(store.clone());

        scheduler.check_sites_by_id(Some(vec![site.id])).await.unwrap();

        let history = store.get_site_history(site.id, 1).await.unwrap();
        let check = &history[0];
        assert_eq!(check.status, CheckStatus::Up);
        assert_eq!(check.status_code, Some(200));
        let rt = check.response_time.expect("response_time recorded");
        assert!((0.03..0.5).contains(&rt), "response_time {rt} out of expected range");
    }

    /// S2: a 500 response records `down` with `status_code=500` and
    /// `error_message="HTTP 500"`.
    #[tokio::test]
    async fn s2_http_probe_500_records_down() {
        let addr = spawn_http_stub("HTTP/1.1 500 Internal Server Error", Duration::ZERO).await;
        let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
        let site = store
            .add_site(&format!("http://{addr}/"), "ex", Duration::from_secs(10))
            .await
            .unwrap();
        let scheduler = Scheduler::new(store.clone());

        scheduler.check_sites_by_id(Some(vec![site.id])).await.unwrap();

        let history = store.get_site_history(site.id, 1).await.unwrap();
        let check = &history[0];
        assert_eq!(check.status, CheckStatus::Down);
        assert_eq!(check.status_code, Some(500));
        assert_eq!(check.error_message.as_deref(), Some("HTTP 500"));
    }
}
