use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::GenerationError;

/// Opaque addresses returned by the queue when a job is accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobHandle {
    pub request_id: Option<String>,
    pub status_url: String,
    pub response_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteStatus {
    Queued,
    InProgress,
    Completed,
    Failed,
    Unknown(String),
}

impl RemoteStatus {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "IN_QUEUE" | "QUEUED" | "PENDING" => RemoteStatus::Queued,
            "IN_PROGRESS" | "PROCESSING" | "RUNNING" => RemoteStatus::InProgress,
            "COMPLETED" | "SUCCEEDED" | "SUCCEED" | "SUCCESS" => RemoteStatus::Completed,
            "FAILED" | "ERROR" => RemoteStatus::Failed,
            _ => RemoteStatus::Unknown(raw.to_string()),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RemoteStatus::Completed | RemoteStatus::Failed)
    }
}

#[derive(Debug, Clone)]
pub struct StatusReport {
    pub status: RemoteStatus,
    pub error: Option<String>,
    /// Full status body; some deployments inline the result here.
    pub payload: Value,
}

/// The remote queue-based generation service.
#[async_trait]
pub trait JobBackend: Send + Sync {
    async fn submit(
        &self,
        model: &str,
        body: &Value,
        token: &str,
    ) -> Result<JobHandle, GenerationError>;

    async fn status(&self, handle: &JobHandle, token: &str)
        -> Result<StatusReport, GenerationError>;

    async fn result(&self, handle: &JobHandle, token: &str) -> Result<Value, GenerationError>;
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    request_id: Option<String>,
    status_url: Option<String>,
    response_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    status: Option<String>,
    error: Option<Value>,
}

#[derive(Clone, Debug)]
pub struct QueueClient {
    http: Client,
    base_url: String,
}

impl QueueClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, GenerationError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| GenerationError::Network(format!("build http client failed: {err}")))?;
        Ok(Self::with_client(http, base_url))
    }

    pub fn with_client(http: Client, base_url: &str) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn http(&self) -> &Client {
        &self.http
    }

    async fn read_json(response: reqwest::Response) -> Result<Value, GenerationError> {
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(GenerationError::Remote {
                status: status.as_u16(),
                message: remote_message(&text),
            });
        }
        serde_json::from_str(&text).map_err(|err| {
            GenerationError::InvalidResponse(format!("{err}, body: {}", truncate(&text, 200)))
        })
    }
}

#[async_trait]
impl JobBackend for QueueClient {
    async fn submit(
        &self,
        model: &str,
        body: &Value,
        token: &str,
    ) -> Result<JobHandle, GenerationError> {
        let url = format!("{}/{}", self.base_url, model.trim_start_matches('/'));
        debug!(%url, "submitting generation job");
        let response = self
            .http
            .post(&url)
            .bearer_auth(token)
            .json(body)
            .send()
            .await?;
        let payload = Self::read_json(response).await?;
        let parsed: SubmitResponse = serde_json::from_value(payload)
            .map_err(|err| GenerationError::InvalidResponse(err.to_string()))?;

        let status_url = parsed
            .status_url
            .filter(|value| !value.trim().is_empty())
            .ok_or_else(|| GenerationError::InvalidResponse("missing status_url".to_string()))?;
        let response_url = parsed
            .response_url
            .filter(|value| !value.trim().is_empty())
            .ok_or_else(|| GenerationError::InvalidResponse("missing response_url".to_string()))?;

        debug!(request_id = ?parsed.request_id, "generation job queued");
        Ok(JobHandle {
            request_id: parsed.request_id,
            status_url,
            response_url,
        })
    }

    async fn status(
        &self,
        handle: &JobHandle,
        token: &str,
    ) -> Result<StatusReport, GenerationError> {
        let response = self
            .http
            .get(&handle.status_url)
            .bearer_auth(token)
            .send()
            .await?;
        let payload = Self::read_json(response).await?;
        let parsed: StatusResponse = serde_json::from_value(payload.clone())
            .map_err(|err| GenerationError::InvalidResponse(err.to_string()))?;
        let status = parsed
            .status
            .map(|raw| RemoteStatus::parse(&raw))
            .ok_or_else(|| GenerationError::InvalidResponse("missing status".to_string()))?;

        Ok(StatusReport {
            status,
            error: parsed.error.as_ref().and_then(error_text),
            payload,
        })
    }

    async fn result(&self, handle: &JobHandle, token: &str) -> Result<Value, GenerationError> {
        let response = self
            .http
            .get(&handle.response_url)
            .bearer_auth(token)
            .send()
            .await?;
        Self::read_json(response).await
    }
}

/// Error bodies come as `{"detail": ...}`, `{"error": ...}` or `{"message": ...}`.
fn remote_message(body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<Value>(body) {
        for key in ["detail", "error", "message"] {
            if let Some(text) = value.get(key).and_then(error_text) {
                return text;
            }
        }
    }
    let trimmed = body.trim();
    if trimmed.is_empty() {
        "empty response body".to_string()
    } else {
        truncate(trimmed, 500)
    }
}

fn error_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) if !text.trim().is_empty() => Some(text.trim().to_string()),
        Value::Object(map) => map.get("message").and_then(error_text),
        Value::Array(items) => items.first().and_then(|item| {
            item.get("msg")
                .and_then(error_text)
                .or_else(|| error_text(item))
        }),
        _ => None,
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut cut: String = text.chars().take(max_chars).collect();
    cut.push('…');
    cut
}
