use serde_json::{Map, Value, json};
use tracing::info;

use crate::config::RetryPolicy;
use crate::error::GenerationError;
use crate::queue_client::{JobBackend, JobHandle};
use crate::retry::execute_with_retry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    Generation,
    Enhancement,
}

impl JobKind {
    pub fn label(self) -> &'static str {
        match self {
            JobKind::Generation => "generation",
            JobKind::Enhancement => "enhancement",
        }
    }
}

/// Source image for a job. Inline data wins when both forms are present.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImagePayload {
    pub inline: Option<String>,
    pub remote_url: Option<String>,
}

impl ImagePayload {
    pub fn inline(data_uri: impl Into<String>) -> Self {
        Self {
            inline: Some(data_uri.into()),
            remote_url: None,
        }
    }

    pub fn remote(url: impl Into<String>) -> Self {
        Self {
            inline: None,
            remote_url: Some(url.into()),
        }
    }

    pub fn resolve(&self) -> Option<&str> {
        self.inline
            .as_deref()
            .or(self.remote_url.as_deref())
            .filter(|value| !value.trim().is_empty())
    }
}

#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub kind: JobKind,
    pub prompt: Option<String>,
    pub image: ImagePayload,
    pub aspect_ratio: Option<String>,
    pub image_count: u32,
    pub upscale_factor: Option<f32>,
}

impl SubmitRequest {
    pub fn to_body(&self) -> Result<Value, GenerationError> {
        let image = self
            .image
            .resolve()
            .ok_or_else(|| GenerationError::ImageConversion("no source image supplied".to_string()))?;

        let mut body = Map::new();
        body.insert("image_url".to_string(), json!(image));
        if let Some(prompt) = self.prompt.as_deref().filter(|p| !p.trim().is_empty()) {
            body.insert("prompt".to_string(), json!(prompt));
        }
        match self.kind {
            JobKind::Generation => {
                if let Some(ratio) = self.aspect_ratio.as_deref() {
                    body.insert("aspect_ratio".to_string(), json!(ratio));
                }
                body.insert("num_images".to_string(), json!(self.image_count.max(1)));
            }
            JobKind::Enhancement => {
                if let Some(factor) = self.upscale_factor {
                    body.insert("upscale_factor".to_string(), json!(factor));
                }
            }
        }
        Ok(Value::Object(body))
    }
}

/// Exchanges a prepared request for a pollable job handle.
///
/// Submission is not idempotent: a request that failed ambiguously may still
/// have been queued remotely, so transient retries can create duplicates.
pub async fn submit_job(
    backend: &dyn JobBackend,
    model: &str,
    request: &SubmitRequest,
    token: Option<&str>,
    policy: &RetryPolicy,
) -> Result<JobHandle, GenerationError> {
    let token = token
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or(GenerationError::Unauthenticated)?;
    let body = request.to_body()?;

    let description = format!("{} submission to {model}", request.kind.label());
    let handle = execute_with_retry(&description, policy, || backend.submit(model, &body, token))
        .await?;
    info!(
        kind = request.kind.label(),
        request_id = ?handle.request_id,
        "job submitted"
    );
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::ScriptedBackend;
    use std::time::Duration;

    fn request() -> SubmitRequest {
        SubmitRequest {
            kind: JobKind::Generation,
            prompt: Some("a lighthouse".into()),
            image: ImagePayload::inline("data:image/jpeg;base64,AAAA"),
            aspect_ratio: Some("3:4".into()),
            image_count: 1,
            upscale_factor: None,
        }
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
        }
    }

    #[test]
    fn test_inline_image_takes_priority() {
        let payload = ImagePayload {
            inline: Some("data:image/png;base64,AA".into()),
            remote_url: Some("https://cdn.example/a.png".into()),
        };
        assert_eq!(payload.resolve(), Some("data:image/png;base64,AA"));
        assert_eq!(
            ImagePayload::remote("https://cdn.example/a.png").resolve(),
            Some("https://cdn.example/a.png")
        );
    }

    #[test]
    fn test_generation_body_fields() {
        let body = request().to_body().unwrap();
        assert_eq!(body["prompt"], "a lighthouse");
        assert_eq!(body["image_url"], "data:image/jpeg;base64,AAAA");
        assert_eq!(body["aspect_ratio"], "3:4");
        assert_eq!(body["num_images"], 1);
        assert!(body.get("upscale_factor").is_none());
    }

    #[test]
    fn test_enhancement_body_fields() {
        let request = SubmitRequest {
            kind: JobKind::Enhancement,
            prompt: None,
            image: ImagePayload::remote("https://cdn.example/a.png"),
            aspect_ratio: Some("1:1".into()),
            image_count: 1,
            upscale_factor: Some(2.0),
        };
        let body = request.to_body().unwrap();
        assert_eq!(body["upscale_factor"], 2.0);
        assert!(body.get("aspect_ratio").is_none());
        assert!(body.get("prompt").is_none());
    }

    #[tokio::test]
    async fn test_missing_token_fails_before_network() {
        let backend = ScriptedBackend::new();
        let err = submit_job(&backend, "model", &request(), None, &fast_policy())
            .await
            .unwrap_err();
        assert!(matches!(err, GenerationError::Unauthenticated));
        assert_eq!(backend.submit_calls(), 0);

        let err = submit_job(&backend, "model", &request(), Some("  "), &fast_policy())
            .await
            .unwrap_err();
        assert!(matches!(err, GenerationError::Unauthenticated));
        assert_eq!(backend.submit_calls(), 0);
    }

    #[tokio::test]
    async fn test_transient_submit_failures_are_retried() {
        let backend = ScriptedBackend::new();
        backend.fail_submit(GenerationError::Network("connection reset".into()));
        backend.fail_submit(GenerationError::RequestTimeout("timed out".into()));

        let handle = submit_job(&backend, "model", &request(), Some("token"), &fast_policy())
            .await
            .unwrap();

        assert_eq!(backend.submit_calls(), 3);
        assert_eq!(handle.request_id.as_deref(), Some("scripted-job"));
    }

    #[tokio::test]
    async fn test_transient_failures_exhaust_after_three_attempts() {
        let backend = ScriptedBackend::new();
        for n in 0..3 {
            backend.fail_submit(GenerationError::Network(format!("network down {n}")));
        }

        let err = submit_job(&backend, "model", &request(), Some("token"), &fast_policy())
            .await
            .unwrap_err();

        assert_eq!(backend.submit_calls(), 3);
        assert!(matches!(err, GenerationError::Network(ref msg) if msg == "network down 2"));
    }

    #[tokio::test]
    async fn test_rejection_is_not_retried() {
        let backend = ScriptedBackend::new();
        backend.fail_submit(GenerationError::Remote {
            status: 422,
            message: "prompt too long".into(),
        });

        let err = submit_job(&backend, "model", &request(), Some("token"), &fast_policy())
            .await
            .unwrap_err();

        assert_eq!(backend.submit_calls(), 1);
        assert!(matches!(err, GenerationError::Remote { status: 422, .. }));
    }
}
