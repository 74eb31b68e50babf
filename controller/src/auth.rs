//! API-key hashing and the gRPC metadata interceptor that authenticates
//! an agent connection before its stream is accepted. Hashing grounded in
//! the `compute_sha256` helper from the pack's sentinel reference file.

use axum::http::HeaderMap;
use probe_core::model::Agent;
use probe_core::{Store, StoreError};
use sha2::{Digest, Sha256};
use std::sync::Arc;

pub fn hash_api_key(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Reads `x-agent-id` / `x-api-key` from gRPC request metadata and
/// extracts them into the request extensions. Actual validation against
/// the Store happens in the service handler, since the interceptor has no
/// async access to the Store (`tonic::service::Interceptor::call` is
/// synchronous) — this only shapes the credentials for that lookup,
/// matching §4.E's "reject before Registry.Register" ordering at the
/// point the handler runs, before any stream state is created.
#[derive(Clone)]
pub struct AuthHeaders;

impl tonic::service::Interceptor for AuthHeaders {
    fn call(&mut self, mut req: tonic::Request<()>) -> Result<tonic::Request<()>, tonic::Status> {
        let agent_id = req
            .metadata()
            .get("x-agent-id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let api_key = req
            .metadata()
            .get("x-api-key")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        req.extensions_mut().insert(RawCredentials { agent_id, api_key });
        Ok(req)
    }
}

#[derive(Clone)]
pub struct RawCredentials {
    pub agent_id: Option<String>,
    pub api_key: Option<String>,
}

/// Same `x-agent-id` / `x-api-key` credential pair, read from an axum
/// `HeaderMap` instead of gRPC metadata, for the agent HTTP fallback
/// routes (§4.F). Fails closed: a missing or unknown key is `Unauthorized`.
pub async fn authenticate_http(store: &Arc<dyn Store>, headers: &HeaderMap) -> probe_core::Result<Agent> {
    let api_key = headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| StoreError::Unauthorized("missing x-api-key".into()))?;
    let agent = store.validate_agent_api_key(&hash_api_key(api_key)).await?;

    if let Some(header_id) = headers.get("x-agent-id").and_then(|v| v.to_str().ok()) {
        if header_id.parse::<i64>().ok() != Some(agent.id) {
            return Err(StoreError::Unauthorized("agent id does not match api key".into()));
        }
    }
    Ok(agent)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_deterministic_and_sha256_shaped() {
        let h1 = hash_api_key("a-very-long-shared-secret-at-least-64-characters-aaaaaaaaaaaaaaaaaaa");
        let h2 = hash_api_key("a-very-long-shared-secret-at-least-64-characters-aaaaaaaaaaaaaaaaaaa");
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 64);
    }

    #[test]
    fn different_keys_hash_differently() {
        assert_ne!(hash_api_key("key-one"), hash_api_key("key-two"));
    }
}
