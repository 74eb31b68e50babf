//! The Management API (§6) plus the agent HTTP fallback (§4.F), both
//! mounted on the same axum router. Handlers map `StoreError` to status
//! codes ad hoc, matching the teacher's `http.rs`, which never centralizes
//! that mapping behind an `IntoResponse` impl either.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use probe_core::model::{
    Agent, MonitorType, NewMonitorResult, NewMonitorTask, ResultStatus, Site, SiteStatus, Stats,
};
use probe_core::{duration, IntervalBounds, Store, StoreError};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::auth::{authenticate_http, hash_api_key};
use crate::dispatcher::Dispatcher;
use crate::ingest;
use crate::registry::{AgentMetadata, AgentRegistry, ConnectedAgent};
use crate::scheduler::Scheduler;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub registry: Arc<AgentRegistry>,
    pub dispatcher: Arc<Dispatcher>,
    pub scheduler: Arc<Scheduler>,
    pub interval_bounds: IntervalBounds,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/sites", get(list_sites).post(create_site))
        .route("/api/sites/status", get(sites_status))
        .route("/api/sites/{id}", delete(delete_site))
        .route("/api/sites/{id}/history", get(site_history))
        .route("/api/agents", get(list_agents).post(create_agent))
        .route("/api/agents/{id}", delete(delete_agent))
        .route("/api/check/manual", post(manual_check))
        .route("/api/stats", get(stats))
        .route("/api/agent/register", post(agent_register))
        .route("/api/agent/heartbeat", post(agent_heartbeat))
        .route("/api/agent/results", post(agent_results))
        .route("/api/agent/tasks", get(agent_tasks))
        .with_state(state)
}

/// Wraps a `StoreError` so it can implement `IntoResponse` without
/// orphan-rule trouble (the trait and the type both live outside this crate).
struct ApiError(StoreError);

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            StoreError::Invalid(_) => StatusCode::BAD_REQUEST,
            StoreError::AlreadyExists(_) => StatusCode::CONFLICT,
            StoreError::NotFound(_) => StatusCode::NOT_FOUND,
            StoreError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            StoreError::Transient(_) => StatusCode::INTERNAL_SERVER_ERROR,
            StoreError::Fatal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.0.to_string()).into_response()
    }
}

async fn health() -> &'static str {
    "ok"
}

#[derive(Deserialize)]
struct CreateSiteRequest {
    url: String,
    name: String,
    scan_interval: String,
}

async fn create_site(
    State(state): State<AppState>,
    Json(req): Json<CreateSiteRequest>,
) -> std::result::Result<Json<Site>, ApiError> {
    let interval = duration::parse(&req.scan_interval).map_err(ApiError)?;
    if interval < state.interval_bounds.min || interval > state.interval_bounds.max {
        return Err(ApiError(StoreError::invalid(format!(
            "scan_interval must be between {} and {}",
            duration::format(state.interval_bounds.min),
            duration::format(state.interval_bounds.max),
        ))));
    }

    let site = state.store.add_site(&req.url, &req.name, interval).await?;

    // §9 Open Question resolution: a Site always gets a companion
    // MonitorTask so the Management API needs no separate task endpoint.
    let monitor_type = MonitorType::from_url(&site.url)?;
    state
        .store
        .upsert_task(NewMonitorTask {
            site_id: site.id,
            monitor_type,
            url: site.url.clone(),
            interval: site.scan_interval,
            timeout: site.scan_interval.min(Duration::from_secs(30)),
            enabled: true,
        })
        .await?;

    state.scheduler.refresh_monitoring().await?;
    if let Err(e) = state.dispatcher.recompute().await {
        tracing::warn!(error = %e, "dispatcher recompute after site creation failed");
    }

    Ok(Json(site))
}

async fn list_sites(State(state): State<AppState>) -> std::result::Result<Json<Vec<Site>>, ApiError> {
    Ok(Json(state.store.get_sites().await?))
}

async fn sites_status(State(state): State<AppState>) -> std::result::Result<Json<Vec<SiteStatus>>, ApiError> {
    Ok(Json(state.store.get_site_status().await?))
}

#[derive(Deserialize)]
struct HistoryQuery {
    limit: Option<i64>,
}

async fn site_history(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(q): Query<HistoryQuery>,
) -> std::result::Result<Response, ApiError> {
    let limit = q.limit.unwrap_or(50).clamp(1, 1000);
    let history = state.store.get_site_history(id, limit).await?;
    Ok(Json(history).into_response())
}

async fn delete_site(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> std::result::Result<StatusCode, ApiError> {
    state.store.delete_site(id).await?;
    state.scheduler.refresh_monitoring().await?;
    if let Err(e) = state.dispatcher.recompute().await {
        tracing::warn!(error = %e, "dispatcher recompute after site deletion failed");
    }
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct CreateAgentRequest {
    name: String,
    description: Option<String>,
}

#[derive(Serialize)]
struct CreateAgentResponse {
    #[serde(flatten)]
    agent: Agent,
    /// The plaintext key, returned exactly once — the Store only ever
    /// keeps the hash (§3).
    api_key: String,
}

async fn create_agent(
    State(state): State<AppState>,
    Json(req): Json<CreateAgentRequest>,
) -> std::result::Result<Json<CreateAgentResponse>, ApiError> {
    let api_key = generate_api_key();
    let agent = state
        .store
        .add_agent(&req.name, &hash_api_key(&api_key), req.description.as_deref())
        .await?;
    Ok(Json(CreateAgentResponse { agent, api_key }))
}

fn generate_api_key() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let bytes: [u8; 32] = rng.gen();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[derive(Serialize)]
struct AgentWithLiveness {
    #[serde(flatten)]
    agent: Agent,
    /// Live registry state, not the persisted `status` column — an agent
    /// can be `connected=true` the instant it streams in, well before any
    /// sweep would otherwise update a stored column (§3, §4.D).
    connected: bool,
}

async fn list_agents(
    State(state): State<AppState>,
) -> std::result::Result<Json<Vec<AgentWithLiveness>>, ApiError> {
    let agents = state.store.get_agents().await?;
    let mut out = Vec::with_capacity(agents.len());
    for agent in agents {
        let connected = state.registry.is_online(agent.id).await;
        out.push(AgentWithLiveness { agent, connected });
    }
    Ok(Json(out))
}

async fn delete_agent(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> std::result::Result<StatusCode, ApiError> {
    state.store.delete_agent(id).await?;
    state.registry.drop_agent(id).await;
    state.dispatcher.forget_agent(id).await;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct ManualCheckRequest {
    site_ids: Option<Vec<i64>>,
}

#[derive(Serialize)]
struct ManualCheckResult {
    site_id: i64,
    status: String,
}

async fn manual_check(
    State(state): State<AppState>,
    Json(req): Json<ManualCheckRequest>,
) -> std::result::Result<Json<Vec<ManualCheckResult>>, ApiError> {
    let outcomes = state.scheduler.check_sites_by_id(req.site_ids).await?;
    Ok(Json(
        outcomes
            .into_iter()
            .map(|(site_id, status)| ManualCheckResult {
                site_id,
                status: status.as_str().to_string(),
            })
            .collect(),
    ))
}

#[derive(Serialize)]
struct StatsResponse {
    #[serde(flatten)]
    stats: Stats,
    connected_agents: usize,
}

async fn stats(State(state): State<AppState>) -> std::result::Result<Json<StatsResponse>, ApiError> {
    let stats = state.store.get_stats().await?;
    let connected_agents = state.registry.online_ids().await.len();
    Ok(Json(StatsResponse { stats, connected_agents }))
}

#[derive(Deserialize)]
struct AgentRegisterRequest {
    os: Option<String>,
    platform: Option<String>,
    architecture: Option<String>,
    version: Option<String>,
}

async fn agent_register(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<AgentRegisterRequest>,
) -> std::result::Result<StatusCode, ApiError> {
    let agent = authenticate_http(&state.store, &headers).await?;
    state
        .store
        .touch_agent(
            agent.id,
            None,
            req.os.as_deref(),
            req.platform.as_deref(),
            req.architecture.as_deref(),
            req.version.as_deref(),
        )
        .await?;

    // Gives the polling agent a registry entry with no push channel, so
    // it counts as online for `online_ids`/`tasks_for` same as a gRPC
    // agent does (§4.E: the two transports are semantically equivalent).
    state
        .registry
        .register(ConnectedAgent {
            agent_id: agent.id,
            connected_at: chrono::Utc::now(),
            last_seen: chrono::Utc::now(),
            metadata: AgentMetadata {
                os: req.os.clone(),
                platform: req.platform.clone(),
                architecture: req.architecture.clone(),
                version: req.version.clone(),
                remote_ip: None,
            },
            sender: None,
            cancel: CancellationToken::new(),
        })
        .await;
    if let Err(e) = state.dispatcher.recompute().await {
        tracing::warn!(error = %e, "dispatcher recompute after http agent register failed");
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn agent_heartbeat(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> std::result::Result<StatusCode, ApiError> {
    let agent = authenticate_http(&state.store, &headers).await?;
    state.registry.touch_or_register(agent.id).await;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct AgentResultRequest {
    task_id: i64,
    status: String,
    response_time_ms: Option<f64>,
    status_code: Option<u16>,
    error_message: Option<String>,
    #[serde(default)]
    metadata: serde_json::Value,
}

async fn agent_results(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<AgentResultRequest>,
) -> std::result::Result<StatusCode, ApiError> {
    let agent = authenticate_http(&state.store, &headers).await?;
    let status: ResultStatus = req.status.parse().map_err(ApiError)?;
    let new_result = NewMonitorResult {
        task_id: req.task_id,
        agent_id: agent.id,
        status,
        response_time: req.response_time_ms,
        status_code: req.status_code,
        error_message: req.error_message,
        metadata: req.metadata,
        checked_at: chrono::Utc::now(),
    };
    ingest::handle_result(&state.store, &state.registry, agent.id, new_result).await;
    Ok(StatusCode::NO_CONTENT)
}

async fn agent_tasks(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> std::result::Result<Response, ApiError> {
    let agent = authenticate_http(&state.store, &headers).await?;
    state.registry.touch_or_register(agent.id).await;
    let tasks = state.dispatcher.tasks_for(agent.id).await?;
    Ok(Json(tasks).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use probe_core::SqliteStore;
    use tower::ServiceExt;

    fn test_state() -> AppState {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
        let registry = AgentRegistry::new(Duration::from_secs(90));
        let dispatcher = Dispatcher::new(store.clone(), registry.clone());
        let scheduler = Scheduler::new(store.clone());
        AppState {
            store,
            registry,
            dispatcher,
            scheduler,
            interval_bounds: IntervalBounds::default(),
        }
    }

    #[tokio::test]
    async fn create_site_also_creates_a_monitor_task() {
        let state = test_state();
        let app = router(state.clone());

        let req = Request::builder()
            .method("POST")
            .uri("/api/sites")
            .header("content-type", "application/json")
            .body(Body::from(
                serde_json::to_vec(&serde_json::json!({
                    "url": "http://example.com",
                    "name": "example",
                    "scan_interval": "10s",
                }))
                .unwrap(),
            ))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let tasks = state.store.list_enabled_tasks().await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].url, "http://example.com");
    }

    #[tokio::test]
    async fn create_site_rejects_interval_out_of_bounds() {
        let state = test_state();
        let app = router(state);

        let req = Request::builder()
            .method("POST")
            .uri("/api/sites")
            .header("content-type", "application/json")
            .body(Body::from(
                serde_json::to_vec(&serde_json::json!({
                    "url": "http://example.com",
                    "name": "example",
                    "scan_interval": "1s",
                }))
                .unwrap(),
            ))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn agent_routes_reject_missing_api_key() {
        let state = test_state();
        let app = router(state);

        let req = Request::builder()
            .method("POST")
            .uri("/api/agent/heartbeat")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let state = test_state();
        let app = router(state);
        let req = Request::builder().uri("/api/health").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    /// S4: a registered agent is rejected with a bad key, then a correct
    /// key lets it authenticate and show up as connected.
    #[tokio::test]
    async fn s4_agent_lifecycle_auth_then_connected() {
        let state = test_state();
        let agent = state
            .store
            .add_agent(
                "a1",
                &hash_api_key("a-very-long-shared-secret-at-least-64-characters-aaaaaaaaaaaaaaaaaaa"),
                None,
            )
            .await
            .unwrap();

        let app = router(state.clone());
        let bad_req = Request::builder()
            .method("POST")
            .uri("/api/agent/heartbeat")
            .header("x-agent-id", agent.id.to_string())
            .header("x-api-key", "wrong-key")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(bad_req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let app = router(state.clone());
        let good_req = Request::builder()
            .method("POST")
            .uri("/api/agent/heartbeat")
            .header("x-agent-id", agent.id.to_string())
            .header(
                "x-api-key",
                "a-very-long-shared-secret-at-least-64-characters-aaaaaaaaaaaaaaaaaaa",
            )
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(good_req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);

        assert!(state.registry.is_online(agent.id).await);
    }

    /// S6: a submitted result with an out-of-range status_code is
    /// rejected and never persisted; a valid one updates the site's
    /// latest status.
    #[tokio::test]
    async fn s6_result_ingestion_updates_site_status() {
        let state = test_state();
        let site = state
            .store
            .add_site("http://example.com", "ex", Duration::from_secs(10))
            .await
            .unwrap();
        let task = state
            .store
            .upsert_task(probe_core::model::NewMonitorTask {
                site_id: site.id,
                monitor_type: MonitorType::Http,
                url: site.url.clone(),
                interval: Duration::from_secs(10),
                timeout: Duration::from_secs(5),
                enabled: true,
            })
            .await
            .unwrap();
        state
            .store
            .add_agent("a1", &hash_api_key("k-aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa"), None)
            .await
            .unwrap();

        let app = router(state.clone());
        let bad_req = Request::builder()
            .method("POST")
            .uri("/api/agent/results")
            .header("x-agent-id", "1")
            .header(
                "x-api-key",
                "k-aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa",
            )
            .header("content-type", "application/json")
            .body(Body::from(
                serde_json::to_vec(&serde_json::json!({
                    "task_id": task.id,
                    "status": "up",
                    "status_code": 700,
                }))
                .unwrap(),
            ))
            .unwrap();
        app.oneshot(bad_req).await.unwrap();
        assert!(state.store.get_site_status().await.unwrap()[0].latest.is_none());

        let app = router(state.clone());
        let good_req = Request::builder()
            .method("POST")
            .uri("/api/agent/results")
            .header("x-agent-id", "1")
            .header(
                "x-api-key",
                "k-aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa",
            )
            .header("content-type", "application/json")
            .body(Body::from(
                serde_json::to_vec(&serde_json::json!({
                    "task_id": task.id,
                    "status": "up",
                    "response_time_ms": 42,
                    "status_code": 200,
                }))
                .unwrap(),
            ))
            .unwrap();
        app.oneshot(good_req).await.unwrap();

        let status = state.store.get_site_status().await.unwrap();
        let latest = status[0].latest.as_ref().expect("latest outcome recorded");
        assert_eq!(latest.status, "up");
        assert_eq!(latest.status_code, Some(200));
    }
}
