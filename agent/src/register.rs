//! Agent-side call to the edge's `POST /api/register` endpoint.

use crate::error::RegisterError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

#[derive(Debug, Serialize)]
struct RegisterRequest<'a> {
    client_id: &'a str,
    ports: &'a [u16],
    config: &'a Value,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RegisterResponse {
    Ok { tunnels: HashMap<String, String> },
    Err { error: String },
}

/// Registers `client_id`/`ports` with the edge at `worker_url`, returning
/// `{port → subdomain}` on success.
pub async fn register(
    client: &reqwest::Client,
    worker_url: &str,
    client_id: &str,
    ports: &[u16],
    config: &Value,
) -> Result<HashMap<String, String>, RegisterError> {
    let url = format!("{}/api/register", worker_url.trim_end_matches('/'));
    let body = RegisterRequest { client_id, ports, config };

    let response = client
        .post(&url)
        .json(&body)
        .send()
        .await
        .map_err(|source| RegisterError::Unreachable { url: url.clone(), source })?;

    let parsed: RegisterResponse = response
        .json()
        .await
        .map_err(|source| RegisterError::Unreachable { url, source })?;

    match parsed {
        RegisterResponse::Ok { tunnels } => Ok(tunnels),
        RegisterResponse::Err { error } => Err(RegisterError::Rejected(error)),
    }
}
