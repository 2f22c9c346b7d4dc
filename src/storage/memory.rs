use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use super::{
    Entitlement, EntitlementProvider, GeneratedImageRecord, ImageRecordStore, ObjectStorage,
    StorageError, StorageResult, UsageRecord, UsageStore,
};

fn poisoned<T>(_: T) -> StorageError {
    StorageError::Unavailable("in-memory store lock poisoned".to_string())
}

/// In-memory rows for dry runs and tests.
#[derive(Default)]
pub struct MemoryRecordStore {
    usage: Mutex<HashMap<String, UsageRecord>>,
    images: Mutex<Vec<GeneratedImageRecord>>,
    entitlements: Mutex<HashMap<String, Entitlement>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_entitlement(&self, user_id: &str, entitlement: Entitlement) -> StorageResult<()> {
        self.entitlements
            .lock()
            .map_err(poisoned)?
            .insert(user_id.to_string(), entitlement);
        Ok(())
    }

    pub fn image_count(&self) -> usize {
        self.images.lock().map(|images| images.len()).unwrap_or(0)
    }
}

#[async_trait]
impl UsageStore for MemoryRecordStore {
    async fn get_usage(&self, user_id: &str) -> StorageResult<Option<UsageRecord>> {
        Ok(self.usage.lock().map_err(poisoned)?.get(user_id).cloned())
    }

    async fn upsert_usage(&self, record: &UsageRecord) -> StorageResult<()> {
        self.usage
            .lock()
            .map_err(poisoned)?
            .insert(record.user_id.clone(), record.clone());
        Ok(())
    }
}

#[async_trait]
impl ImageRecordStore for MemoryRecordStore {
    async fn insert_image(&self, record: &GeneratedImageRecord) -> StorageResult<()> {
        self.images.lock().map_err(poisoned)?.push(record.clone());
        Ok(())
    }

    async fn list_images(
        &self,
        user_id: &str,
        limit: usize,
    ) -> StorageResult<Vec<GeneratedImageRecord>> {
        let images = self.images.lock().map_err(poisoned)?;
        let mut matching: Vec<GeneratedImageRecord> = images
            .iter()
            .filter(|record| record.user_id == user_id)
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        matching.truncate(limit);
        Ok(matching)
    }
}

#[async_trait]
impl EntitlementProvider for MemoryRecordStore {
    async fn active_entitlement(&self, user_id: &str) -> StorageResult<Option<Entitlement>> {
        let entitlements = self.entitlements.lock().map_err(poisoned)?;
        Ok(entitlements
            .get(user_id)
            .filter(|entitlement| entitlement.is_active_at(Utc::now()))
            .cloned())
    }
}

/// In-memory object storage handing out URLs under a fake base.
pub struct MemoryObjectStorage {
    base_url: String,
    objects: Mutex<HashMap<String, (Vec<u8>, String)>>,
}

impl MemoryObjectStorage {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            objects: Mutex::new(HashMap::new()),
        }
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<(Vec<u8>, String)> {
        self.objects
            .lock()
            .ok()
            .and_then(|objects| objects.get(&format!("{bucket}/{key}")).cloned())
    }

    pub fn len(&self) -> usize {
        self.objects.lock().map(|objects| objects.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ObjectStorage for MemoryObjectStorage {
    async fn upload(
        &self,
        bucket: &str,
        key: &str,
        data: Vec<u8>,
        content_type: &str,
    ) -> StorageResult<String> {
        let object_key = format!("{bucket}/{key}");
        self.objects
            .lock()
            .map_err(poisoned)?
            .insert(object_key.clone(), (data, content_type.to_string()));
        Ok(format!("{}/{object_key}", self.base_url))
    }

    async fn delete(&self, bucket: &str, key: &str) -> StorageResult<()> {
        self.objects
            .lock()
            .map_err(poisoned)?
            .remove(&format!("{bucket}/{key}"));
        Ok(())
    }
}
