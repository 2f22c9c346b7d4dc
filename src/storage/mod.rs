use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

pub use crate::error::{StorageError, StorageResult};

pub mod hash;
pub mod local;
pub mod memory;
pub mod records;

pub use hash::compute_hash;
pub use local::LocalFileStorage;
pub use records::JsonRecordStore;

/// Per-user generation counters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub user_id: String,
    pub period_count: u32,
    pub period_end: Option<DateTime<Utc>>,
    pub daily_count: u32,
    pub last_reset_date: NaiveDate,
    pub plan_id: Option<String>,
}

impl UsageRecord {
    pub fn empty(user_id: &str, today: NaiveDate) -> Self {
        Self {
            user_id: user_id.to_string(),
            period_count: 0,
            period_end: None,
            daily_count: 0,
            last_reset_date: today,
            plan_id: None,
        }
    }
}

/// Saved output of a successful generation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GeneratedImageRecord {
    pub id: String,
    pub title: String,
    pub image_url: String,
    pub category: String,
    pub prompt: String,
    pub seed: Option<u64>,
    pub user_id: String,
    pub scene_id: Option<String>,
    pub scene_name: Option<String>,
    pub like_count: u32,
    pub view_count: u32,
    pub created_at: DateTime<Utc>,
}

/// A user's active subscription plan.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entitlement {
    pub product_id: String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Entitlement {
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_none_or(|expires_at| expires_at > now)
    }
}

/// Supplies the bearer credential of the signed-in user.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// `None` when nobody is signed in
    async fn session_token(&self) -> Option<String>;
}

/// Binary object storage with public URLs.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Store bytes and return their public URL
    async fn upload(
        &self,
        bucket: &str,
        key: &str,
        data: Vec<u8>,
        content_type: &str,
    ) -> StorageResult<String>;

    /// Remove an object; missing objects are not an error
    async fn delete(&self, bucket: &str, key: &str) -> StorageResult<()>;
}

#[async_trait]
pub trait UsageStore: Send + Sync {
    /// Get the counters of a user, if any were ever written
    async fn get_usage(&self, user_id: &str) -> StorageResult<Option<UsageRecord>>;

    /// Insert or replace the counters of a user
    async fn upsert_usage(&self, record: &UsageRecord) -> StorageResult<()>;
}

#[async_trait]
pub trait ImageRecordStore: Send + Sync {
    /// Insert a new generated image row
    async fn insert_image(&self, record: &GeneratedImageRecord) -> StorageResult<()>;

    /// Most recent images of a user, newest first
    async fn list_images(
        &self,
        user_id: &str,
        limit: usize,
    ) -> StorageResult<Vec<GeneratedImageRecord>>;
}

#[async_trait]
pub trait EntitlementProvider: Send + Sync {
    /// The user's current plan, `None` when there is no active subscription
    async fn active_entitlement(&self, user_id: &str) -> StorageResult<Option<Entitlement>>;
}

/// Auth provider backed by a fixed credential, used by the MCP server where
/// the process itself is the signed-in client.
pub struct StaticTokenAuth {
    token: Option<String>,
}

impl StaticTokenAuth {
    pub fn new(token: Option<String>) -> Self {
        Self {
            token: token.filter(|value| !value.trim().is_empty()),
        }
    }
}

#[async_trait]
impl AuthProvider for StaticTokenAuth {
    async fn session_token(&self) -> Option<String> {
        self.token.clone()
    }
}
