//! The upward interface: one call from a source image to a finished, saved
//! image, reporting progress along the way.

use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use reqwest::Client;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, info, warn};

use crate::config::{JobEndpoint, PipelineConfig};
use crate::error::GenerationError;
use crate::image_processing::prepare_image;
use crate::persistence::{PersistContext, PersistenceFinalizer};
use crate::poll::{GenerationResult, poll_job};
use crate::progress::{
    CancelHandle, CancelToken, ProgressEvent, ProgressReporter, ProgressSink, cancellation,
};
use crate::prompt::{Scene, build_prompt};
use crate::queue_client::JobBackend;
use crate::quota::{PlanCatalog, QuotaDecision, QuotaRejection, UsageQuotaGate};
use crate::storage::{
    AuthProvider, EntitlementProvider, ImageRecordStore, ObjectStorage, UsageStore,
};
use crate::submitter::{ImagePayload, JobKind, SubmitRequest, submit_job};

/// Where the source image comes from.
#[derive(Debug, Clone, PartialEq)]
pub enum ImageSource {
    LocalFile(PathBuf),
    RemoteUrl(String),
    /// A `data:` URI, sent as-is
    InlineData(String),
}

#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub source: ImageSource,
    pub scene: Option<Scene>,
    pub gender: Option<String>,
    /// Replaces the scene template when set
    pub prompt: Option<String>,
    pub aspect_ratio: Option<String>,
    pub image_count: u32,
    pub user_id: Option<String>,
}

impl GenerationRequest {
    pub fn new(source: ImageSource) -> Self {
        Self {
            source,
            scene: None,
            gender: None,
            prompt: None,
            aspect_ratio: None,
            image_count: 1,
            user_id: None,
        }
    }

    fn into_job(self) -> Job {
        let prompt = match self.prompt.filter(|prompt| !prompt.trim().is_empty()) {
            Some(prompt) => prompt,
            None => build_prompt(self.scene.as_ref(), self.gender.as_deref()),
        };
        Job {
            kind: JobKind::Generation,
            source: self.source,
            prompt: Some(prompt),
            scene: self.scene,
            aspect_ratio: self.aspect_ratio,
            image_count: self.image_count,
            upscale_factor: None,
            user_id: self.user_id,
        }
    }
}

/// Upscale and clean up an existing image.
#[derive(Debug, Clone)]
pub struct EnhanceRequest {
    pub source: ImageSource,
    pub upscale_factor: Option<f32>,
    pub user_id: Option<String>,
}

impl EnhanceRequest {
    fn into_job(self) -> Job {
        Job {
            kind: JobKind::Enhancement,
            source: self.source,
            prompt: None,
            scene: None,
            aspect_ratio: None,
            image_count: 1,
            upscale_factor: self.upscale_factor,
            user_id: self.user_id,
        }
    }
}

struct Job {
    kind: JobKind,
    source: ImageSource,
    prompt: Option<String>,
    scene: Option<Scene>,
    aspect_ratio: Option<String>,
    image_count: u32,
    upscale_factor: Option<f32>,
    user_id: Option<String>,
}

/// What the caller always gets back: either a success with the image or a
/// failure with a readable message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl GenerationOutcome {
    fn failed(err: &GenerationError) -> Self {
        Self {
            success: false,
            image_url: None,
            seed: None,
            image_id: None,
            error: Some(err.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    Progress(ProgressEvent),
    /// Always the last event of a run
    Finished(GenerationOutcome),
}

/// A pipeline run in flight, consumed as a stream of events.
pub struct GenerationRun {
    events: UnboundedReceiverStream<PipelineEvent>,
    cancel: CancelHandle,
}

impl GenerationRun {
    /// Stops local polling and progress events. A job already queued
    /// remotely is left running. Dropping the run has the same effect.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Drains the stream, handing progress to `on_progress`, and returns the
    /// final outcome.
    pub async fn finish(mut self, mut on_progress: impl FnMut(ProgressEvent)) -> GenerationOutcome {
        while let Some(event) = self.events.next().await {
            match event {
                PipelineEvent::Progress(progress) => on_progress(progress),
                PipelineEvent::Finished(outcome) => return outcome,
            }
        }
        GenerationOutcome::failed(&GenerationError::Cancelled)
    }
}

impl Drop for GenerationRun {
    /// Losing interest in a run stops it like an explicit cancel.
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl Stream for GenerationRun {
    type Item = PipelineEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.events).poll_next(cx)
    }
}

/// External services the pipeline talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub backend: Arc<dyn JobBackend>,
    pub auth: Arc<dyn AuthProvider>,
    pub storage: Arc<dyn ObjectStorage>,
    pub usage: Arc<dyn UsageStore>,
    pub images: Arc<dyn ImageRecordStore>,
    pub entitlements: Arc<dyn EntitlementProvider>,
    pub http: Client,
}

#[derive(Clone)]
pub struct GenerationPipeline {
    config: Arc<PipelineConfig>,
    backend: Arc<dyn JobBackend>,
    auth: Arc<dyn AuthProvider>,
    images: Arc<dyn ImageRecordStore>,
    gate: UsageQuotaGate,
    finalizer: PersistenceFinalizer,
}

impl GenerationPipeline {
    pub fn new(config: PipelineConfig, collaborators: Collaborators) -> Self {
        Self::with_plan_catalog(config, collaborators, PlanCatalog::default())
    }

    pub fn with_plan_catalog(
        config: PipelineConfig,
        collaborators: Collaborators,
        catalog: PlanCatalog,
    ) -> Self {
        let Collaborators {
            backend,
            auth,
            storage,
            usage,
            images,
            entitlements,
            http,
        } = collaborators;
        let gate = UsageQuotaGate::new(usage, entitlements, catalog);
        let finalizer =
            PersistenceFinalizer::new(http, storage, images.clone(), config.storage_bucket.clone());
        Self {
            config: Arc::new(config),
            backend,
            auth,
            images,
            gate,
            finalizer,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn images(&self) -> &Arc<dyn ImageRecordStore> {
        &self.images
    }

    pub async fn check_quota(&self, user_id: &str) -> QuotaDecision {
        self.gate.can_generate(user_id).await
    }

    /// Runs a generation to completion. `on_progress` sees non-decreasing
    /// percentages, except for a single reset to 0 when the run fails.
    pub async fn generate(
        &self,
        request: GenerationRequest,
        on_progress: impl Fn(ProgressEvent) + Send + Sync + 'static,
    ) -> GenerationOutcome {
        let mut reporter = ProgressReporter::new(Arc::new(on_progress), CancelToken::never());
        self.run(request.into_job(), &mut reporter, &CancelToken::never())
            .await
    }

    pub async fn enhance(
        &self,
        request: EnhanceRequest,
        on_progress: impl Fn(ProgressEvent) + Send + Sync + 'static,
    ) -> GenerationOutcome {
        let mut reporter = ProgressReporter::new(Arc::new(on_progress), CancelToken::never());
        self.run(request.into_job(), &mut reporter, &CancelToken::never())
            .await
    }

    /// Starts a generation on the runtime and returns its event stream.
    pub fn start(&self, request: GenerationRequest) -> GenerationRun {
        self.spawn(request.into_job())
    }

    pub fn start_enhance(&self, request: EnhanceRequest) -> GenerationRun {
        self.spawn(request.into_job())
    }

    fn spawn(&self, job: Job) -> GenerationRun {
        let (sender, receiver) = mpsc::unbounded_channel();
        let (cancel, token) = cancellation();

        let progress_sender = sender.clone();
        let sink: ProgressSink = Arc::new(move |event: ProgressEvent| {
            let _ = progress_sender.send(PipelineEvent::Progress(event));
        });
        let pipeline = self.clone();
        tokio::spawn(async move {
            let mut reporter = ProgressReporter::new(sink, token.clone());
            let outcome = pipeline.run(job, &mut reporter, &token).await;
            let _ = sender.send(PipelineEvent::Finished(outcome));
        });

        GenerationRun {
            events: UnboundedReceiverStream::new(receiver),
            cancel,
        }
    }

    async fn run(
        &self,
        job: Job,
        reporter: &mut ProgressReporter,
        cancel: &CancelToken,
    ) -> GenerationOutcome {
        let kind = job.kind;
        match self.execute(job, reporter, cancel).await {
            Ok(outcome) => outcome,
            Err(err) => {
                match &err {
                    GenerationError::Cancelled => info!(kind = kind.label(), "run cancelled"),
                    // the poll loop already reset progress for remote failures
                    GenerationError::JobFailed(_) => {
                        warn!(kind = kind.label(), error = %err, "run failed")
                    }
                    _ => {
                        warn!(kind = kind.label(), error = %err, "run failed");
                        reporter.fail("Generation failed");
                    }
                }
                GenerationOutcome::failed(&err)
            }
        }
    }

    async fn execute(
        &self,
        job: Job,
        reporter: &mut ProgressReporter,
        cancel: &CancelToken,
    ) -> Result<GenerationOutcome, GenerationError> {
        let token = self
            .auth
            .session_token()
            .await
            .filter(|token| !token.trim().is_empty())
            .ok_or(GenerationError::Unauthenticated)?;

        reporter.report(0, "Checking credits");
        match job.user_id.as_deref() {
            Some(user_id) => {
                let decision = self.gate.can_generate(user_id).await;
                if !decision.allowed {
                    let reason = decision.reason.unwrap_or(QuotaRejection::UnableToVerify);
                    info!(
                        user_id,
                        tier = decision.tier.as_str(),
                        reason = %reason,
                        "quota rejected run"
                    );
                    return Err(GenerationError::QuotaExceeded(reason));
                }
            }
            None if self.config.allow_anonymous => {
                debug!(kind = job.kind.label(), "anonymous run, quota not checked")
            }
            None => return Err(GenerationError::UserRequired),
        }

        reporter.report(5, "Preparing image");
        let image = self.resolve_image(&job.source).await?;
        ensure_active(cancel)?;

        reporter.report(10, "Submitting request");
        let endpoint = self.endpoint(job.kind);
        let request = SubmitRequest {
            kind: job.kind,
            prompt: job.prompt.clone(),
            image,
            aspect_ratio: job.aspect_ratio.clone(),
            image_count: job.image_count,
            upscale_factor: job.upscale_factor,
        };
        let handle = submit_job(
            self.backend.as_ref(),
            &endpoint.model,
            &request,
            Some(token.as_str()),
            &self.config.submit_retry,
        )
        .await?;
        ensure_active(cancel)?;

        let result = poll_job(
            self.backend.as_ref(),
            &handle,
            &token,
            &endpoint.schedule,
            &self.config.status_retry,
            reporter,
            cancel,
        )
        .await?;

        Ok(self.settle(&job, result).await)
    }

    /// Persistence and usage accounting after a successful job. Neither can
    /// turn the run into a failure.
    async fn settle(&self, job: &Job, result: GenerationResult) -> GenerationOutcome {
        let mut image_url = result.image_url.clone();
        let mut image_id = None;

        if let Some(user_id) = job.user_id.as_deref() {
            if self.config.auto_save {
                let context = PersistContext {
                    user_id: user_id.to_string(),
                    prompt: job.prompt.clone().unwrap_or_default(),
                    scene: job.scene.clone(),
                };
                let persisted = self.finalizer.finalize(&result, &context).await;
                image_url = persisted.image_url;
                image_id = persisted.image_id;
            }

            if let Err(err) = self.gate.increment_usage(user_id).await {
                warn!(
                    operation = "increment_usage",
                    collaborator = "usage_store",
                    user_id,
                    error = %err,
                    "usage not counted"
                );
            }
        }

        info!(kind = job.kind.label(), request_id = ?result.request_id, "run complete");
        GenerationOutcome {
            success: true,
            image_url: Some(image_url),
            seed: result.seed,
            image_id,
            error: None,
        }
    }

    async fn resolve_image(&self, source: &ImageSource) -> Result<ImagePayload, GenerationError> {
        match source {
            ImageSource::LocalFile(path) => {
                let prepared = prepare_image(path, &self.config.image).await?;
                Ok(ImagePayload::inline(prepared.data_uri))
            }
            ImageSource::RemoteUrl(url) => Ok(ImagePayload::remote(url.trim())),
            ImageSource::InlineData(data_uri) => Ok(ImagePayload::inline(data_uri.trim())),
        }
    }

    fn endpoint(&self, kind: JobKind) -> &JobEndpoint {
        match kind {
            JobKind::Generation => &self.config.generation,
            JobKind::Enhancement => &self.config.enhancement,
        }
    }
}

fn ensure_active(cancel: &CancelToken) -> Result<(), GenerationError> {
    if cancel.is_cancelled() {
        Err(GenerationError::Cancelled)
    } else {
        Ok(())
    }
}
