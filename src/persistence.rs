use std::sync::Arc;

use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::GenerationError;
use crate::image_processing::{decode_data_uri, detect_mime_type, extension_for_mime};
use crate::poll::GenerationResult;
use crate::prompt::Scene;
use crate::storage::hash::user_key;
use crate::storage::{GeneratedImageRecord, ImageRecordStore, ObjectStorage, compute_hash};

const DEFAULT_TITLE: &str = "Generated Image";
const DEFAULT_CATEGORY: &str = "custom";

/// Who and what a finished generation belongs to.
#[derive(Debug, Clone)]
pub struct PersistContext {
    pub user_id: String,
    pub prompt: String,
    pub scene: Option<Scene>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PersistOutcome {
    /// Storage URL when the copy succeeded, otherwise the remote result URL
    pub image_url: String,
    pub image_id: Option<String>,
}

/// Object key inside the bucket: `{user_key}/{timestamp_ms}_{seed}.{ext}`.
/// The user segment is hashed so any user id yields a URL-safe key.
pub fn object_key(user_id: &str, timestamp_ms: i64, seed: Option<u64>, extension: &str) -> String {
    format!(
        "{}/{timestamp_ms}_{}.{extension}",
        user_key(user_id),
        seed.unwrap_or(0)
    )
}

/// Best-effort save of a finished image: copy it into object storage, then
/// write a record pointing at it. Every failure is logged and swallowed.
#[derive(Clone)]
pub struct PersistenceFinalizer {
    http: Client,
    storage: Arc<dyn ObjectStorage>,
    records: Arc<dyn ImageRecordStore>,
    bucket: String,
}

impl PersistenceFinalizer {
    pub fn new(
        http: Client,
        storage: Arc<dyn ObjectStorage>,
        records: Arc<dyn ImageRecordStore>,
        bucket: impl Into<String>,
    ) -> Self {
        Self {
            http,
            storage,
            records,
            bucket: bucket.into(),
        }
    }

    pub async fn finalize(&self, result: &GenerationResult, context: &PersistContext) -> PersistOutcome {
        let now = Utc::now();
        let user_id = context.user_id.as_str();

        let image_url = match self.store_copy(result, user_id, now).await {
            Ok(url) => url,
            Err(err) => {
                warn!(
                    operation = "upload_result",
                    collaborator = "object_storage",
                    user_id,
                    error = %err,
                    "keeping remote image url"
                );
                result.image_url.clone()
            }
        };

        let record = build_record(&image_url, result, context, now);
        let image_id = match self.records.insert_image(&record).await {
            Ok(()) => {
                info!(user_id, image_id = %record.id, "generated image saved");
                Some(record.id)
            }
            Err(err) => {
                warn!(
                    operation = "insert_image_record",
                    collaborator = "image_records",
                    user_id,
                    error = %err,
                    "image record not written"
                );
                None
            }
        };

        PersistOutcome {
            image_url,
            image_id,
        }
    }

    async fn store_copy(
        &self,
        result: &GenerationResult,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<String, GenerationError> {
        let (bytes, mime_type) = self.download(&result.image_url).await?;
        let key = object_key(
            user_id,
            now.timestamp_millis(),
            result.seed,
            extension_for_mime(&mime_type),
        );
        let url = self.storage.upload(&self.bucket, &key, bytes, &mime_type).await?;
        debug!(user_id, key = %key, "result copied to object storage");
        Ok(url)
    }

    async fn download(&self, url: &str) -> Result<(Vec<u8>, String), GenerationError> {
        if url.starts_with("data:") {
            let (mime_type, bytes) = decode_data_uri(url).ok_or_else(|| {
                GenerationError::InvalidResponse("result data uri is malformed".to_string())
            })?;
            return Ok((bytes, mime_type));
        }

        let response = self.http.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(GenerationError::Remote {
                status: status.as_u16(),
                message: format!("image download failed with HTTP {status}"),
            });
        }
        let header_mime = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.split(';').next().unwrap_or(value).trim().to_string());
        let bytes = response.bytes().await?;
        let mime_type = detect_mime_type(&bytes)
            .map(str::to_string)
            .or(header_mime)
            .unwrap_or_else(|| "image/png".to_string());
        Ok((bytes.to_vec(), mime_type))
    }
}

fn build_record(
    image_url: &str,
    result: &GenerationResult,
    context: &PersistContext,
    now: DateTime<Utc>,
) -> GeneratedImageRecord {
    let id = compute_hash(&format!(
        "{}:{}:{}",
        context.user_id,
        image_url,
        now.timestamp_millis()
    ));
    let scene = context.scene.as_ref();
    GeneratedImageRecord {
        id,
        title: scene
            .map(|scene| scene.name.clone())
            .unwrap_or_else(|| DEFAULT_TITLE.to_string()),
        image_url: image_url.to_string(),
        category: scene
            .map(|scene| scene.category.clone())
            .unwrap_or_else(|| DEFAULT_CATEGORY.to_string()),
        prompt: context.prompt.clone(),
        seed: result.seed,
        user_id: context.user_id.clone(),
        scene_id: scene.map(|scene| scene.id.clone()),
        scene_name: scene.map(|scene| scene.name.clone()),
        like_count: 0,
        view_count: 0,
        created_at: now,
    }
}
