use std::path::PathBuf;

use async_trait::async_trait;
use chrono::Utc;
use tokio::fs;
use tracing::warn;

use super::hash::user_key;
use super::{
    Entitlement, EntitlementProvider, GeneratedImageRecord, ImageRecordStore, LocalFileStorage,
    StorageResult, UsageRecord, UsageStore,
};

const USAGE_DIR: &str = "records/usage";
const IMAGE_DIR: &str = "records/images";
const ENTITLEMENT_DIR: &str = "records/entitlements";

/// JSON documents under the local storage directory, one file per row.
#[derive(Clone, Debug)]
pub struct JsonRecordStore {
    storage: LocalFileStorage,
}

impl JsonRecordStore {
    pub fn new(storage: LocalFileStorage) -> Self {
        Self { storage }
    }

    fn usage_key(user_id: &str) -> String {
        format!("{USAGE_DIR}/{}.json", user_key(user_id))
    }

    fn entitlement_key(user_id: &str) -> String {
        format!("{ENTITLEMENT_DIR}/{}.json", user_key(user_id))
    }

    fn image_key(record: &GeneratedImageRecord) -> String {
        let created_at = record.created_at.format("%Y%m%dT%H%M%S%.3fZ");
        format!(
            "{IMAGE_DIR}/{}/{created_at}_{}.json",
            user_key(&record.user_id),
            record.id
        )
    }

    /// Grants a plan to a user, mirroring what the subscription service reports.
    pub async fn put_entitlement(
        &self,
        user_id: &str,
        entitlement: &Entitlement,
    ) -> StorageResult<()> {
        let payload = serde_json::to_vec_pretty(entitlement)?;
        self.storage
            .put(&Self::entitlement_key(user_id), &payload)
            .await
    }
}

#[async_trait]
impl UsageStore for JsonRecordStore {
    async fn get_usage(&self, user_id: &str) -> StorageResult<Option<UsageRecord>> {
        match self.storage.get(&Self::usage_key(user_id)).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn upsert_usage(&self, record: &UsageRecord) -> StorageResult<()> {
        let payload = serde_json::to_vec_pretty(record)?;
        self.storage
            .put(&Self::usage_key(&record.user_id), &payload)
            .await
    }
}

#[async_trait]
impl ImageRecordStore for JsonRecordStore {
    async fn insert_image(&self, record: &GeneratedImageRecord) -> StorageResult<()> {
        let payload = serde_json::to_vec_pretty(record)?;
        self.storage.put(&Self::image_key(record), &payload).await
    }

    async fn list_images(
        &self,
        user_id: &str,
        limit: usize,
    ) -> StorageResult<Vec<GeneratedImageRecord>> {
        let dir_path = self
            .storage
            .resolve_path(&format!("{IMAGE_DIR}/{}", user_key(user_id)))?;
        let mut entries: Vec<PathBuf> = Vec::new();
        let mut dir = match fs::read_dir(&dir_path).await {
            Ok(dir) => dir,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) == Some("json") {
                entries.push(path);
            }
        }
        // file names start with the creation timestamp
        entries.sort_by(|a, b| b.cmp(a));

        let mut records = Vec::new();
        for path in entries {
            if records.len() >= limit {
                break;
            }
            let bytes = fs::read(&path).await?;
            match serde_json::from_slice::<GeneratedImageRecord>(&bytes) {
                Ok(record) => records.push(record),
                Err(err) => warn!(path = %path.display(), error = %err, "skipping unreadable image record"),
            }
        }
        Ok(records)
    }
}

#[async_trait]
impl EntitlementProvider for JsonRecordStore {
    async fn active_entitlement(&self, user_id: &str) -> StorageResult<Option<Entitlement>> {
        let Some(bytes) = self.storage.get(&Self::entitlement_key(user_id)).await? else {
            return Ok(None);
        };
        let entitlement: Entitlement = serde_json::from_slice(&bytes)?;
        Ok(Some(entitlement).filter(|entitlement| entitlement.is_active_at(Utc::now())))
    }
}
