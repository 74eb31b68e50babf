//! gRPC implementation of the agent transport (§4.E): one bidirectional
//! `Stream` RPC. Credentials are read from request metadata by
//! `auth::AuthHeaders` before this handler ever runs; here we hash the
//! presented key, look up the Agent row, and reject unauthenticated
//! connections before `Registry::register` creates any state — closer to
//! spec's ordering than the teacher's original in-stream `Register`.

use std::pin::Pin;
use std::sync::Arc;

use chrono::Utc;
use futures_util::Stream;
use probe_core::model::{NewMonitorResult, ResultStatus};
use probe_core::Store;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tonic::{Request, Response, Status, Streaming};

use crate::auth::{hash_api_key, RawCredentials};
use crate::dispatcher::Dispatcher;
use crate::ingest;
use crate::pb;
use crate::registry::{AgentMetadata, AgentRegistry, ConnectedAgent};

pub struct AgentLinkService {
    pub store: Arc<dyn Store>,
    pub registry: Arc<AgentRegistry>,
    pub dispatcher: Arc<Dispatcher>,
}

#[tonic::async_trait]
impl pb::agent_link_server::AgentLink for AgentLinkService {
    type StreamStream = Pin<Box<dyn Stream<Item = Result<pb::ControllerToAgent, Status>> + Send>>;

    async fn stream(
        &self,
        request: Request<Streaming<pb::AgentToController>>,
    ) -> Result<Response<Self::StreamStream>, Status> {
        let creds = request
            .extensions()
            .get::<RawCredentials>()
            .cloned()
            .unwrap_or(RawCredentials {
                agent_id: None,
                api_key: None,
            });
        let remote_ip = request.remote_addr().map(|a| a.to_string());

        let api_key = creds
            .api_key
            .ok_or_else(|| Status::unauthenticated("missing x-api-key"))?;
        let agent = self
            .store
            .validate_agent_api_key(&hash_api_key(&api_key))
            .await
            .map_err(|_| Status::unauthenticated("unknown api key"))?;

        if let Some(header_id) = creds.agent_id.as_deref() {
            if header_id.parse::<i64>().ok() != Some(agent.id) {
                return Err(Status::unauthenticated("agent id does not match api key"));
            }
        }

        let mut inbound = request.into_inner();
        let (tx, rx) = mpsc::channel::<pb::ControllerToAgent>(32);
        let cancel = tokio_util::sync::CancellationToken::new();

        self.registry
            .register(ConnectedAgent {
                agent_id: agent.id,
                connected_at: Utc::now(),
                last_seen: Utc::now(),
                metadata: AgentMetadata {
                    os: None,
                    platform: None,
                    architecture: None,
                    version: None,
                    remote_ip: remote_ip.clone(),
                },
                sender: Some(tx.clone()),
                cancel: cancel.clone(),
            })
            .await;
        tracing::info!(agent_id = agent.id, remote_ip = ?remote_ip, "agent connected");

        let store = Arc::clone(&self.store);
        let registry = Arc::clone(&self.registry);
        let dispatcher = Arc::clone(&self.dispatcher);
        let agent_id = agent.id;

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    msg = inbound.next() => {
                        match msg {
                            Some(Ok(frame)) => handle_inbound(&store, &registry, agent_id, frame).await,
                            Some(Err(e)) => {
                                tracing::info!(agent_id, error = %e, "agent stream error, closing");
                                break;
                            }
                            None => {
                                tracing::info!(agent_id, "agent stream ended");
                                break;
                            }
                        }
                    }
                    _ = cancel.cancelled() => break,
                }
            }
            registry.drop_agent(agent_id).await;
            dispatcher.forget_agent(agent_id).await;
            if let Err(e) = dispatcher.recompute().await {
                tracing::warn!(agent_id, error = %e, "recompute after disconnect failed");
            }
        });

        // Server-side heartbeat (§4.E: the controller MAY also send one).
        let heartbeat_tx = tx.clone();
        let heartbeat_cancel = cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(30));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let msg = pb::ControllerToAgent {
                            msg: Some(pb::controller_to_agent::Msg::Heartbeat(pb::Heartbeat {
                                agent_id: agent_id.to_string(),
                                timestamp: Utc::now().to_rfc3339(),
                            })),
                        };
                        if heartbeat_tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                    _ = heartbeat_cancel.cancelled() => break,
                }
            }
        });

        if let Err(e) = self.dispatcher.recompute().await {
            tracing::warn!(agent_id, error = %e, "initial recompute after connect failed");
        }

        let outbound = ReceiverStream::new(rx).map(Ok);
        Ok(Response::new(Box::pin(outbound)))
    }
}

async fn handle_inbound(
    store: &Arc<dyn Store>,
    registry: &Arc<AgentRegistry>,
    agent_id: i64,
    frame: pb::AgentToController,
) {
    match frame.msg {
        Some(pb::agent_to_controller::Msg::Heartbeat(_)) => {
            registry.touch(agent_id).await;
        }
        Some(pb::agent_to_controller::Msg::Register(reg)) => {
            // §9 Open Question: metadata is carried at handshake time over
            // the in-band Register message, not the connect headers.
            if let Err(e) = store
                .touch_agent(
                    agent_id,
                    None,
                    Some(reg.os.as_str()),
                    Some(reg.platform.as_str()),
                    Some(reg.architecture.as_str()),
                    Some(reg.version.as_str()),
                )
                .await
            {
                tracing::warn!(agent_id, error = %e, "failed to persist agent metadata");
            }
            registry.touch(agent_id).await;
        }
        Some(pb::agent_to_controller::Msg::Result(r)) => {
            handle_result_frame(store, registry, agent_id, r).await;
        }
        None => {}
    }
}

async fn handle_result_frame(
    store: &Arc<dyn Store>,
    registry: &Arc<AgentRegistry>,
    agent_id: i64,
    r: pb::Result,
) {
    let Ok(task_id) = r.task_id.parse::<i64>() else {
        tracing::warn!(agent_id, task_id = %r.task_id, "result with unparsable task_id, dropping");
        return;
    };
    let Ok(status) = r.status.parse::<ResultStatus>() else {
        tracing::warn!(agent_id, status = %r.status, "result with unknown status, dropping");
        return;
    };
    let metadata = serde_json::from_str(&r.metadata_json).unwrap_or(serde_json::Value::Null);
    let checked_at = chrono::DateTime::parse_from_rfc3339(&r.checked_at)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now());

    let new_result = NewMonitorResult {
        task_id,
        agent_id,
        status,
        response_time: r.response_time_ms,
        status_code: r.status_code.map(|c| c as u16),
        error_message: r.error_message,
        metadata,
        checked_at,
    };
    ingest::handle_result(store, registry, agent_id, new_result).await;
}
