use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{Value, json};

use crate::config::{PollSchedule, RetryPolicy};
use crate::error::{GenerationError, StorageError, StorageResult};
use crate::queue_client::{JobBackend, JobHandle, RemoteStatus, StatusReport};
use crate::storage::{
    Entitlement, EntitlementProvider, GeneratedImageRecord, ImageRecordStore, ObjectStorage,
    UsageRecord, UsageStore,
};

pub fn at(year: i32, month: u32, day: u32, hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(year, month, day, hour, 0, 0).unwrap()
}

pub fn fast_schedule(max_attempts: u32) -> PollSchedule {
    PollSchedule {
        base_interval: Duration::from_millis(1),
        step: Duration::ZERO,
        max_interval: Duration::from_millis(1),
        max_attempts,
        progress_floor: 10,
        progress_ceiling: 90,
    }
}

pub fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(2),
    }
}

/// In-memory job backend that replays queued responses.
///
/// Once the scripted statuses run out the last one is repeated, which makes a
/// job that never reaches a terminal state easy to express.
pub struct ScriptedBackend {
    submit_failures: Mutex<VecDeque<GenerationError>>,
    statuses: Mutex<VecDeque<Result<StatusReport, GenerationError>>>,
    last_status: Mutex<Option<StatusReport>>,
    result: Mutex<Option<Value>>,
    submitted_bodies: Mutex<Vec<Value>>,
    submit_calls: AtomicU32,
    status_calls: AtomicU32,
    result_calls: AtomicU32,
}

impl ScriptedBackend {
    pub const DEFAULT_IMAGE_URL: &'static str = "https://cdn.example/generated.png";

    pub fn new() -> Self {
        Self {
            submit_failures: Mutex::new(VecDeque::new()),
            statuses: Mutex::new(VecDeque::new()),
            last_status: Mutex::new(None),
            result: Mutex::new(None),
            submitted_bodies: Mutex::new(Vec::new()),
            submit_calls: AtomicU32::new(0),
            status_calls: AtomicU32::new(0),
            result_calls: AtomicU32::new(0),
        }
    }

    pub fn handle(&self) -> JobHandle {
        JobHandle {
            request_id: Some("scripted-job".to_string()),
            status_url: "scripted://status".to_string(),
            response_url: "scripted://result".to_string(),
        }
    }

    pub fn fail_submit(&self, err: GenerationError) {
        self.submit_failures.lock().unwrap().push_back(err);
    }

    pub fn push_status(&self, status: RemoteStatus) {
        let raw = match &status {
            RemoteStatus::Queued => "IN_QUEUE".to_string(),
            RemoteStatus::InProgress => "IN_PROGRESS".to_string(),
            RemoteStatus::Completed => "COMPLETED".to_string(),
            RemoteStatus::Failed => "FAILED".to_string(),
            RemoteStatus::Unknown(raw) => raw.clone(),
        };
        self.push_report(StatusReport {
            status,
            error: None,
            payload: json!({ "status": raw }),
        });
    }

    pub fn push_status_payload(&self, payload: Value) {
        let status = payload
            .get("status")
            .and_then(Value::as_str)
            .map(RemoteStatus::parse)
            .unwrap_or(RemoteStatus::Unknown(String::new()));
        self.push_report(StatusReport {
            status,
            error: None,
            payload,
        });
    }

    pub fn push_failure(&self, reason: Option<&str>) {
        self.push_report(StatusReport {
            status: RemoteStatus::Failed,
            error: reason.map(str::to_string),
            payload: json!({ "status": "FAILED", "error": reason }),
        });
    }

    pub fn push_status_error(&self, err: GenerationError) {
        self.statuses.lock().unwrap().push_back(Err(err));
    }

    fn push_report(&self, report: StatusReport) {
        self.statuses.lock().unwrap().push_back(Ok(report));
    }

    pub fn set_result(&self, payload: Value) {
        *self.result.lock().unwrap() = Some(payload);
    }

    pub fn submit_calls(&self) -> u32 {
        self.submit_calls.load(Ordering::SeqCst)
    }

    pub fn status_calls(&self) -> u32 {
        self.status_calls.load(Ordering::SeqCst)
    }

    pub fn result_calls(&self) -> u32 {
        self.result_calls.load(Ordering::SeqCst)
    }

    pub fn submitted_bodies(&self) -> Vec<Value> {
        self.submitted_bodies.lock().unwrap().clone()
    }
}

#[async_trait]
impl JobBackend for ScriptedBackend {
    async fn submit(
        &self,
        _model: &str,
        body: &Value,
        _token: &str,
    ) -> Result<JobHandle, GenerationError> {
        self.submit_calls.fetch_add(1, Ordering::SeqCst);
        self.submitted_bodies.lock().unwrap().push(body.clone());
        if let Some(err) = self.submit_failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        Ok(self.handle())
    }

    async fn status(
        &self,
        _handle: &JobHandle,
        _token: &str,
    ) -> Result<StatusReport, GenerationError> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        let next = self.statuses.lock().unwrap().pop_front();
        match next {
            Some(Ok(report)) => {
                *self.last_status.lock().unwrap() = Some(report.clone());
                Ok(report)
            }
            Some(Err(err)) => Err(err),
            None => Ok(self
                .last_status
                .lock()
                .unwrap()
                .clone()
                .unwrap_or(StatusReport {
                    status: RemoteStatus::Queued,
                    error: None,
                    payload: json!({ "status": "IN_QUEUE" }),
                })),
        }
    }

    async fn result(&self, _handle: &JobHandle, _token: &str) -> Result<Value, GenerationError> {
        self.result_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.result.lock().unwrap().clone().unwrap_or_else(|| {
            json!({
                "images": [{ "url": Self::DEFAULT_IMAGE_URL }],
                "seed": 1234
            })
        }))
    }
}

/// Every collaborator call fails as if the backing service were down.
pub struct FailingStore;

fn unavailable() -> StorageError {
    StorageError::Unavailable("service down".to_string())
}

#[async_trait]
impl UsageStore for FailingStore {
    async fn get_usage(&self, _user_id: &str) -> StorageResult<Option<UsageRecord>> {
        Err(unavailable())
    }

    async fn upsert_usage(&self, _record: &UsageRecord) -> StorageResult<()> {
        Err(unavailable())
    }
}

#[async_trait]
impl EntitlementProvider for FailingStore {
    async fn active_entitlement(&self, _user_id: &str) -> StorageResult<Option<Entitlement>> {
        Err(unavailable())
    }
}

#[async_trait]
impl ImageRecordStore for FailingStore {
    async fn insert_image(&self, _record: &GeneratedImageRecord) -> StorageResult<()> {
        Err(unavailable())
    }

    async fn list_images(
        &self,
        _user_id: &str,
        _limit: usize,
    ) -> StorageResult<Vec<GeneratedImageRecord>> {
        Err(unavailable())
    }
}

#[async_trait]
impl ObjectStorage for FailingStore {
    async fn upload(
        &self,
        _bucket: &str,
        _key: &str,
        _data: Vec<u8>,
        _content_type: &str,
    ) -> StorageResult<String> {
        Err(unavailable())
    }

    async fn delete(&self, _bucket: &str, _key: &str) -> StorageResult<()> {
        Err(unavailable())
    }
}
