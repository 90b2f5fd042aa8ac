//! Remote API adapter.
//!
//! The sync processor pushes each queue item through a [`RemoteApi`]. The
//! item id travels as the idempotency key, so a retried push the server
//! already applied is acknowledged instead of applied twice.

use async_trait::async_trait;
use encore_engine::{ItemId, OperationType, QueueItem, RemoteVersion, Version};
use reqwest::{Client, StatusCode};
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;

/// One push of a queue item.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteRequest {
    pub item_id: ItemId,
    pub operation_type: OperationType,
    pub operation_name: String,
    pub entity_key: Option<String>,
    pub payload: Value,
    pub base_version: Option<Version>,
    pub actor_id: Option<String>,
    pub tenant_id: Option<String>,
}

impl RemoteRequest {
    pub fn from_item(item: &QueueItem) -> Self {
        Self {
            item_id: item.id.clone(),
            operation_type: item.operation_type,
            operation_name: item.metadata.operation_name.clone(),
            entity_key: item.entity_key.clone(),
            payload: item.payload.clone(),
            base_version: item.base_version,
            actor_id: item.metadata.actor_id.clone(),
            tenant_id: item.metadata.tenant_id.clone(),
        }
    }
}

/// Successful push. `value` is the server's view of the entity, if it sent one.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RemoteAck {
    pub value: Option<Value>,
}

/// Remote failures.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RemoteError {
    #[error("Transient remote failure: {0}")]
    Transient(String),

    #[error("Remote request timed out")]
    Timeout,

    #[error("Rejected with status {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("Remote entity changed (version {:?})", .0.version)]
    Conflict(RemoteVersion),
}

impl RemoteError {
    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteError::Transient(_) | RemoteError::Timeout)
    }
}

/// The server side of synchronization.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    async fn apply(&self, request: &RemoteRequest) -> Result<RemoteAck, RemoteError>;
}

/// Endpoint family for an operation type.
pub fn endpoint_segment(operation_type: OperationType) -> &'static str {
    match operation_type {
        OperationType::Mutation => "mutations",
        OperationType::Query => "queries",
        OperationType::FileUpload => "uploads",
        OperationType::UserAction => "actions",
    }
}

/// [`RemoteApi`] over HTTP with JSON bodies.
#[derive(Debug, Clone)]
pub struct HttpRemote {
    client: Client,
    base_url: String,
}

impl HttpRemote {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(client, base_url))
    }

    pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
        let base_url: String = base_url.into();
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn url_for(&self, request: &RemoteRequest) -> String {
        format!(
            "{}/{}/{}",
            self.base_url,
            endpoint_segment(request.operation_type),
            request.operation_name
        )
    }
}

#[async_trait]
impl RemoteApi for HttpRemote {
    async fn apply(&self, request: &RemoteRequest) -> Result<RemoteAck, RemoteError> {
        let url = self.url_for(request);

        let response = self
            .client
            .post(&url)
            .header("Idempotency-Key", &request.item_id)
            .json(request)
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        if status.is_success() {
            let body = response.bytes().await.map_err(classify_transport)?;
            let value = if body.is_empty() {
                None
            } else {
                serde_json::from_slice(&body).ok()
            };
            return Ok(RemoteAck { value });
        }

        if status == StatusCode::CONFLICT {
            return match response.json::<RemoteVersion>().await {
                Ok(remote) => Err(RemoteError::Conflict(remote)),
                Err(e) => Err(RemoteError::Transient(format!(
                    "Unreadable conflict body: {}",
                    e
                ))),
            };
        }

        if status.is_client_error() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| status.to_string());
            return Err(RemoteError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        Err(RemoteError::Transient(format!("Server returned {}", status)))
    }
}

fn classify_transport(e: reqwest::Error) -> RemoteError {
    if e.is_timeout() {
        RemoteError::Timeout
    } else {
        RemoteError::Transient(format!("Network error: {}", e))
    }
}
