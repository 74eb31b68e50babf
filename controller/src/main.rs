//! The controller binary: Store, Scheduler, AgentRegistry, Dispatcher and
//! the two transports (HTTP Management API + gRPC AgentLink) wired
//! together and run concurrently, shutting down together on Ctrl-C.

mod auth;
mod config;
mod dispatcher;
mod grpc;
mod http;
mod ingest;
mod registry;
mod scheduler;

pub mod pb {
    tonic::include_proto!("agent");
}

use std::sync::Arc;

use probe_core::{IntervalBounds, PostgresStore, SqliteStore, Store};
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tower_http::trace::TraceLayer;
use tracing::Level;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::auth::AuthHeaders;
use crate::config::Config;
use crate::dispatcher::Dispatcher;
use crate::grpc::AgentLinkService;
use crate::http::AppState;
use crate::registry::AgentRegistry;
use crate::scheduler::Scheduler;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();
    let interval_bounds = IntervalBounds {
        min: config.min_scan_interval,
        max: config.max_scan_interval,
    };

    let store: Arc<dyn Store> = match &config.database_url {
        Some(url) => {
            tracing::info!("connecting to postgres store");
            Arc::new(PostgresStore::connect_with_bounds(url, interval_bounds).await?)
        }
        None => {
            tracing::info!(path = %config.sqlite_path, "opening sqlite store");
            Arc::new(SqliteStore::open(&config.sqlite_path, interval_bounds)?)
        }
    };

    let registry = AgentRegistry::new(config.heartbeat_timeout);
    let dispatcher = Dispatcher::new(store.clone(), registry.clone());
    let scheduler = Scheduler::new(store.clone());

    // §9 Open Question resolution: every Site's companion MonitorTask runs
    // locally by default, so a single-node deployment needs no agents to
    // function; LOCAL_SCHEDULING=false hands every task to remote agents
    // instead, which is what lets a replicated controller (or the test
    // harness for §8's S5 scenario) avoid double-probing the same site.
    // The flag applies to the whole catalog, present and future, so the
    // Dispatcher re-derives the exclusion on every recompute instead of
    // caching a task id set that a later `create_site` could outrun.
    let local_scheduling = std::env::var("LOCAL_SCHEDULING")
        .map(|v| v != "false" && v != "0")
        .unwrap_or(true);
    dispatcher.set_local_scheduling(local_scheduling);
    if local_scheduling {
        scheduler.start().await?;
    } else {
        tracing::info!("LOCAL_SCHEDULING=false: all tasks handed to remote agents");
    }

    let shutdown = CancellationToken::new();
    tokio::spawn(registry.clone().run_sweep_loop(shutdown.clone()));

    let app_state = AppState {
        store: store.clone(),
        registry: registry.clone(),
        dispatcher: dispatcher.clone(),
        scheduler: scheduler.clone(),
        interval_bounds,
    };
    let http_router = http::router(app_state).layer(
        TraceLayer::new_for_http()
            .make_span_with(|request: &axum::http::Request<_>| {
                tracing::span!(
                    Level::INFO,
                    "http_request",
                    method = %request.method(),
                    path = %request.uri().path(),
                    x_request_id = ?request.headers().get("x-request-id"),
                )
            })
            .on_request(|request: &axum::http::Request<_>, _span: &tracing::Span| {
                tracing::info!(method = %request.method(), path = %request.uri().path(), "request received");
            })
            .on_response(|response: &axum::http::Response<_>, latency: std::time::Duration, span: &tracing::Span| {
                tracing::info!(parent: span, status = %response.status(), latency_ms = %latency.as_millis(), "response sent");
            })
            .on_failure(|error: tower_http::classify::ServerErrorsFailureClass, latency: std::time::Duration, span: &tracing::Span| {
                tracing::error!(parent: span, %error, latency_ms = %latency.as_millis(), "request failed");
            }),
    );

    let http_addr: std::net::SocketAddr = config.http_addr.parse()?;
    let grpc_addr: std::net::SocketAddr = config.grpc_addr.parse()?;

    let agent_link = AgentLinkService {
        store: store.clone(),
        registry: registry.clone(),
        dispatcher: dispatcher.clone(),
    };
    let auth_interceptor = AuthHeaders;

    let http_listener = tokio::net::TcpListener::bind(http_addr).await?;
    tracing::info!(%http_addr, "management api listening");
    let http_shutdown = shutdown.clone();
    let http_server = axum::serve(http_listener, http_router)
        .with_graceful_shutdown(async move { http_shutdown.cancelled().await });

    tracing::info!(%grpc_addr, "agent link listening");
    let grpc_shutdown = shutdown.clone();
    let grpc_server = Server::builder()
        .add_service(pb::agent_link_server::AgentLinkServer::with_interceptor(
            agent_link,
            auth_interceptor,
        ))
        .serve_with_shutdown(grpc_addr, async move { grpc_shutdown.cancelled().await });

    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown signal received");
        shutdown.cancel();
    };

    let (http_result, grpc_result, _) = tokio::join!(http_server, grpc_server, ctrl_c);
    if let Err(e) = http_result {
        tracing::error!(error = %e, "http server exited with error");
    }
    if let Err(e) = grpc_result {
        tracing::error!(error = %e, "grpc server exited with error");
    }

    scheduler.shutdown().await;
    tracing::info!("shutdown complete");
    Ok(())
}
