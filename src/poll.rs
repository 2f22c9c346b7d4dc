use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::{PollSchedule, RetryPolicy};
use crate::error::GenerationError;
use crate::extraction::{extract_description, extract_image_url, extract_seed, find_image_url};
use crate::progress::{CancelToken, ProgressReporter};
use crate::queue_client::{JobBackend, JobHandle, RemoteStatus};
use crate::retry::execute_with_retry;

const QUEUED_FLOOR: u8 = 20;
const IN_PROGRESS_FLOOR: u8 = 50;
const FALLBACK_FAILURE_MESSAGE: &str = "Image generation failed";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationResult {
    pub image_url: String,
    pub seed: Option<u64>,
    pub description: Option<String>,
    pub request_id: Option<String>,
}

impl GenerationResult {
    fn from_payload(payload: &Value, handle: &JobHandle) -> Result<Self, GenerationError> {
        Ok(Self {
            image_url: extract_image_url(payload)?,
            seed: extract_seed(payload),
            description: extract_description(payload),
            request_id: handle.request_id.clone(),
        })
    }
}

/// Progress for a non-terminal status after `attempt` of `max_attempts` checks.
///
/// Interpolates linearly between the schedule's floor and ceiling; the queued
/// and in-progress floors win when they are higher.
pub fn progress_for(status: &RemoteStatus, attempt: u32, schedule: &PollSchedule) -> u8 {
    let floor = schedule.progress_floor as u32;
    let ceiling = schedule.progress_ceiling.max(schedule.progress_floor) as u32;
    let max_attempts = schedule.max_attempts.max(1);
    let attempt = attempt.min(max_attempts);
    let interpolated = floor + (ceiling - floor) * attempt / max_attempts;

    let state_floor = match status {
        RemoteStatus::Queued => QUEUED_FLOOR as u32,
        RemoteStatus::InProgress => IN_PROGRESS_FLOOR as u32,
        _ => 0,
    };
    interpolated.max(state_floor).min(ceiling) as u8
}

pub fn status_phrase(status: &RemoteStatus) -> &'static str {
    match status {
        RemoteStatus::Queued => "Waiting in queue",
        RemoteStatus::InProgress => "Generating your image",
        RemoteStatus::Completed => "Complete",
        RemoteStatus::Failed => "Generation failed",
        RemoteStatus::Unknown(_) => "Processing",
    }
}

/// Polls a submitted job until it completes, fails, runs out of attempts or
/// is cancelled. Status checks are issued one at a time.
pub async fn poll_job(
    backend: &dyn JobBackend,
    handle: &JobHandle,
    token: &str,
    schedule: &PollSchedule,
    status_retry: &RetryPolicy,
    reporter: &mut ProgressReporter,
    cancel: &CancelToken,
) -> Result<GenerationResult, GenerationError> {
    let request_id = handle.request_id.as_deref().unwrap_or("unknown");

    for attempt in 1..=schedule.max_attempts {
        if cancel.sleep_or_cancel(schedule.interval(attempt)).await {
            info!(request_id, attempt, "polling cancelled");
            return Err(GenerationError::Cancelled);
        }

        let description = format!("status check {attempt} for job {request_id}");
        let report = execute_with_retry(&description, status_retry, || {
            backend.status(handle, token)
        })
        .await?;
        if cancel.is_cancelled() {
            return Err(GenerationError::Cancelled);
        }
        debug!(request_id, attempt, status = ?report.status, "job status");

        match report.status {
            RemoteStatus::Completed => {
                let result = match find_image_url(&report.payload) {
                    Some((strategy, _)) => {
                        debug!(request_id, strategy, "result inlined in status response");
                        GenerationResult::from_payload(&report.payload, handle)?
                    }
                    None => {
                        let payload = execute_with_retry(
                            &format!("result fetch for job {request_id}"),
                            status_retry,
                            || backend.result(handle, token),
                        )
                        .await?;
                        GenerationResult::from_payload(&payload, handle)?
                    }
                };
                reporter.report(100, status_phrase(&RemoteStatus::Completed));
                info!(request_id, attempt, "job completed");
                return Ok(result);
            }
            RemoteStatus::Failed => {
                let message = report
                    .error
                    .filter(|message| !message.trim().is_empty())
                    .unwrap_or_else(|| FALLBACK_FAILURE_MESSAGE.to_string());
                warn!(request_id, attempt, error = %message, "job failed remotely");
                reporter.fail(status_phrase(&RemoteStatus::Failed));
                return Err(GenerationError::JobFailed(message));
            }
            ref status => {
                reporter.report(progress_for(status, attempt, schedule), status_phrase(status));
            }
        }
    }

    warn!(request_id, attempts = schedule.max_attempts, "job did not finish in time");
    Err(GenerationError::TimedOut {
        attempts: schedule.max_attempts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::{ProgressEvent, ProgressSink, cancellation};
    use crate::test_utils::{ScriptedBackend, fast_retry, fast_schedule};
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    fn recorder() -> (ProgressReporter, Arc<Mutex<Vec<ProgressEvent>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink_events = events.clone();
        let sink: ProgressSink = Arc::new(move |event: ProgressEvent| sink_events.lock().unwrap().push(event));
        (ProgressReporter::new(sink, CancelToken::never()), events)
    }

    fn percents(events: &Arc<Mutex<Vec<ProgressEvent>>>) -> Vec<u8> {
        events.lock().unwrap().iter().map(|e| e.percent).collect()
    }

    #[test]
    fn test_progress_interpolation_and_state_floors() {
        let schedule = PollSchedule::generation();
        assert_eq!(progress_for(&RemoteStatus::Unknown("x".into()), 0, &schedule), 10);
        assert_eq!(progress_for(&RemoteStatus::Queued, 1, &schedule), 20);
        assert_eq!(progress_for(&RemoteStatus::InProgress, 1, &schedule), 50);
        assert_eq!(progress_for(&RemoteStatus::InProgress, 45, &schedule), 70);
        assert_eq!(progress_for(&RemoteStatus::Queued, 60, &schedule), 90);
        assert_eq!(progress_for(&RemoteStatus::Queued, 500, &schedule), 90);
    }

    #[test]
    fn test_progress_is_monotonic_over_attempts() {
        let schedule = PollSchedule::enhancement();
        let mut last = 0;
        for attempt in 1..=schedule.max_attempts {
            let value = progress_for(&RemoteStatus::InProgress, attempt, &schedule);
            assert!(value >= last);
            assert!(value <= 95);
            last = value;
        }
    }

    #[tokio::test]
    async fn test_job_completes_after_queue_and_progress() {
        let backend = ScriptedBackend::new();
        backend.push_status(RemoteStatus::Queued);
        backend.push_status(RemoteStatus::InProgress);
        backend.push_status(RemoteStatus::Completed);
        backend.set_result(json!({
            "images": [{"url": "https://cdn.example/final.png"}],
            "seed": 42
        }));
        let (mut reporter, events) = recorder();

        let result = poll_job(
            &backend,
            &backend.handle(),
            "token",
            &fast_schedule(60),
            &fast_retry(2),
            &mut reporter,
            &CancelToken::never(),
        )
        .await
        .unwrap();

        assert_eq!(result.image_url, "https://cdn.example/final.png");
        assert_eq!(result.seed, Some(42));
        assert_eq!(backend.status_calls(), 3);
        assert_eq!(backend.result_calls(), 1);
        let percents = percents(&events);
        assert_eq!(percents.last(), Some(&100));
        assert!(percents.windows(2).all(|pair| pair[0] <= pair[1]));
    }

    #[tokio::test]
    async fn test_inline_result_skips_result_fetch() {
        let backend = ScriptedBackend::new();
        backend.push_status_payload(json!({
            "status": "COMPLETED",
            "output_images": ["https://cdn.example/inline.png"]
        }));
        let (mut reporter, _) = recorder();

        let result = poll_job(
            &backend,
            &backend.handle(),
            "token",
            &fast_schedule(5),
            &fast_retry(2),
            &mut reporter,
            &CancelToken::never(),
        )
        .await
        .unwrap();

        assert_eq!(result.image_url, "https://cdn.example/inline.png");
        assert_eq!(backend.result_calls(), 0);
    }

    #[tokio::test]
    async fn test_remote_failure_surfaces_reason_and_resets_progress() {
        let backend = ScriptedBackend::new();
        backend.push_status(RemoteStatus::InProgress);
        backend.push_failure(Some("Content policy violation"));
        let (mut reporter, events) = recorder();

        let err = poll_job(
            &backend,
            &backend.handle(),
            "token",
            &fast_schedule(10),
            &fast_retry(2),
            &mut reporter,
            &CancelToken::never(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, GenerationError::JobFailed(ref msg) if msg == "Content policy violation"));
        assert_eq!(percents(&events), vec![50, 0]);
    }

    #[tokio::test]
    async fn test_remote_failure_without_reason_uses_fallback() {
        let backend = ScriptedBackend::new();
        backend.push_failure(None);
        let (mut reporter, _) = recorder();

        let err = poll_job(
            &backend,
            &backend.handle(),
            "token",
            &fast_schedule(10),
            &fast_retry(2),
            &mut reporter,
            &CancelToken::never(),
        )
        .await
        .unwrap_err();

        assert_eq!(err.to_string(), FALLBACK_FAILURE_MESSAGE);
    }

    #[tokio::test]
    async fn test_never_finishing_job_times_out() {
        let backend = ScriptedBackend::new();
        backend.push_status(RemoteStatus::Queued);
        backend.push_status(RemoteStatus::InProgress);
        let (mut reporter, events) = recorder();

        let err = poll_job(
            &backend,
            &backend.handle(),
            "token",
            &fast_schedule(60),
            &fast_retry(2),
            &mut reporter,
            &CancelToken::never(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, GenerationError::TimedOut { attempts: 60 }));
        assert_eq!(backend.status_calls(), 60);
        let percents = percents(&events);
        assert_eq!(percents.len(), 60);
        assert!(percents.windows(2).all(|pair| pair[0] <= pair[1]));
        assert_eq!(percents.last(), Some(&90));
    }

    #[tokio::test]
    async fn test_transient_status_error_is_retried_within_attempt() {
        let backend = ScriptedBackend::new();
        backend.push_status_error(GenerationError::Network("connection reset".into()));
        backend.push_status(RemoteStatus::Completed);
        let (mut reporter, _) = recorder();

        let result = poll_job(
            &backend,
            &backend.handle(),
            "token",
            &fast_schedule(3),
            &fast_retry(2),
            &mut reporter,
            &CancelToken::never(),
        )
        .await
        .unwrap();

        assert_eq!(backend.status_calls(), 2);
        assert_eq!(result.image_url, ScriptedBackend::DEFAULT_IMAGE_URL);
    }

    #[tokio::test]
    async fn test_status_errors_past_retry_budget_abort() {
        let backend = ScriptedBackend::new();
        backend.push_status_error(GenerationError::Network("down 1".into()));
        backend.push_status_error(GenerationError::Network("down 2".into()));
        let (mut reporter, _) = recorder();

        let err = poll_job(
            &backend,
            &backend.handle(),
            "token",
            &fast_schedule(10),
            &fast_retry(2),
            &mut reporter,
            &CancelToken::never(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, GenerationError::Network(ref msg) if msg == "down 2"));
    }

    #[tokio::test]
    async fn test_cancel_stops_polling_and_callbacks() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.push_status(RemoteStatus::Queued);
        let (handle, token) = cancellation();
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink_events = events.clone();
        let sink: ProgressSink = Arc::new(move |event: ProgressEvent| sink_events.lock().unwrap().push(event));
        let mut reporter = ProgressReporter::new(sink, token.clone());

        let poll_backend = backend.clone();
        let task = tokio::spawn(async move {
            let job = poll_backend.handle();
            poll_job(
                poll_backend.as_ref(),
                &job,
                "token",
                &PollSchedule {
                    base_interval: std::time::Duration::from_millis(20),
                    max_interval: std::time::Duration::from_millis(20),
                    ..fast_schedule(1_000)
                },
                &fast_retry(2),
                &mut reporter,
                &token,
            )
            .await
        });
        tokio::time::sleep(std::time::Duration::from_millis(70)).await;
        handle.cancel();
        let err = task.await.unwrap().unwrap_err();

        assert!(matches!(err, GenerationError::Cancelled));
        let calls_at_cancel = backend.status_calls();
        let events_at_cancel = events.lock().unwrap().len();
        tokio::time::sleep(std::time::Duration::from_millis(60)).await;
        assert_eq!(backend.status_calls(), calls_at_cancel);
        assert_eq!(events.lock().unwrap().len(), events_at_cancel);
        assert!(calls_at_cancel < 1_000);
    }
}
