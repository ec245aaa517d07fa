//! Read-through cache in front of the metadata store.
//!
//! [`Cache`] is a small string key/value interface with per-entry TTL. It is
//! never authoritative: misses and failures only cost a database round trip.
//! [`ObjectCache`] layers the blob-object key scheme on top.

use crate::models::{BlobObject, FileEntry};
use async_trait::async_trait;
use moka::{Expiry, future::Cache as MokaInner};
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tracing::warn;
use uuid::Uuid;

pub const OBJECT_PREFIX: &str = "file:object";
pub const OBJECT_HASH_PREFIX: &str = "file:object:hash";
pub const OBJECT_PATH_PREFIX: &str = "file:object:path";
pub const USER_FILE_LIST_PREFIX: &str = "user:file:list";

#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &str) -> Option<String>;
    async fn set(&self, key: &str, value: String, ttl: Duration);
    async fn delete(&self, key: &str);
    /// Drop every key starting with `prefix`.
    async fn delete_prefix(&self, prefix: &str);
}

#[derive(Clone)]
struct Entry {
    value: String,
    ttl: Duration,
}

struct EntryTtl;

impl Expiry<String, Entry> for EntryTtl {
    fn expire_after_create(&self, _key: &String, value: &Entry, _created_at: Instant) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &Entry,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// In-process cache backed by `moka`, bounded by entry count.
#[derive(Clone)]
pub struct MokaCache {
    inner: MokaInner<String, Entry>,
}

impl MokaCache {
    pub fn new(capacity: u64) -> Self {
        let inner = MokaInner::builder()
            .max_capacity(capacity)
            .expire_after(EntryTtl)
            .build();
        Self { inner }
    }
}

#[async_trait]
impl Cache for MokaCache {
    async fn get(&self, key: &str) -> Option<String> {
        self.inner.get(key).await.map(|entry| entry.value)
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) {
        self.inner.insert(key.to_string(), Entry { value, ttl }).await;
    }

    async fn delete(&self, key: &str) {
        self.inner.invalidate(key).await;
    }

    async fn delete_prefix(&self, prefix: &str) {
        let keys: Vec<Arc<String>> = self
            .inner
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key)
            .collect();
        for key in keys {
            self.inner.invalidate(key.as_str()).await;
        }
    }
}

pub fn object_key(id: Uuid) -> String {
    format!("{OBJECT_PREFIX}:{id}")
}

pub fn object_hash_key(hash: &str) -> String {
    format!("{OBJECT_HASH_PREFIX}:{hash}")
}

pub fn object_path_key(bucket: &str, key: &str) -> String {
    format!("{OBJECT_PATH_PREFIX}:{bucket}:{key}")
}

pub fn user_file_list_prefix(owner_id: Uuid) -> String {
    format!("{USER_FILE_LIST_PREFIX}:{owner_id}:")
}

pub fn user_file_list_key(owner_id: Uuid, parent_id: Option<Uuid>) -> String {
    match parent_id {
        Some(parent) => format!("{}{parent}", user_file_list_prefix(owner_id)),
        None => format!("{}root", user_file_list_prefix(owner_id)),
    }
}

/// Blob-object view of the cache: the row under its id, plus hash and path
/// index keys pointing at that id.
#[derive(Clone)]
pub struct ObjectCache {
    cache: Arc<dyn Cache>,
    ttl: Duration,
}

impl ObjectCache {
    pub fn new(cache: Arc<dyn Cache>, ttl: Duration) -> Self {
        Self { cache, ttl }
    }

    pub async fn object(&self, id: Uuid) -> Option<BlobObject> {
        let key = object_key(id);
        let raw = self.cache.get(&key).await?;
        match serde_json::from_str(&raw) {
            Ok(object) => Some(object),
            Err(err) => {
                warn!(key = %key, error = %err, "dropping undecodable cache entry");
                self.cache.delete(&key).await;
                None
            }
        }
    }

    pub async fn id_by_hash(&self, hash: &str) -> Option<Uuid> {
        self.index(&object_hash_key(hash)).await
    }

    pub async fn id_by_path(&self, bucket: &str, key: &str) -> Option<Uuid> {
        self.index(&object_path_key(bucket, key)).await
    }

    async fn index(&self, key: &str) -> Option<Uuid> {
        let raw = self.cache.get(key).await?;
        match raw.parse() {
            Ok(id) => Some(id),
            Err(_) => {
                self.cache.delete(key).await;
                None
            }
        }
    }

    /// Cache the row under all three keys.
    pub async fn store(&self, object: &BlobObject) {
        match serde_json::to_string(object) {
            Ok(json) => self.cache.set(&object_key(object.id), json, self.ttl).await,
            Err(err) => {
                warn!(id = %object.id, error = %err, "failed to encode object for cache");
                return;
            }
        }
        let id = object.id.to_string();
        self.cache
            .set(&object_hash_key(&object.content_hash), id.clone(), self.ttl)
            .await;
        self.cache
            .set(&object_path_key(&object.bucket, &object.object_key), id, self.ttl)
            .await;
    }

    pub async fn forget(&self, object: &BlobObject) {
        self.cache.delete(&object_key(object.id)).await;
        self.cache.delete(&object_hash_key(&object.content_hash)).await;
        self.cache
            .delete(&object_path_key(&object.bucket, &object.object_key))
            .await;
    }

    pub async fn forget_id(&self, id: Uuid) {
        self.cache.delete(&object_key(id)).await;
    }

    pub async fn forget_hash(&self, hash: &str) {
        self.cache.delete(&object_hash_key(hash)).await;
    }

    pub async fn forget_path(&self, bucket: &str, key: &str) {
        self.cache.delete(&object_path_key(bucket, key)).await;
    }

    pub async fn file_list(&self, owner_id: Uuid, parent_id: Option<Uuid>) -> Option<Vec<FileEntry>> {
        let key = user_file_list_key(owner_id, parent_id);
        let raw = self.cache.get(&key).await?;
        match serde_json::from_str(&raw) {
            Ok(entries) => Some(entries),
            Err(err) => {
                warn!(key = %key, error = %err, "dropping undecodable cache entry");
                self.cache.delete(&key).await;
                None
            }
        }
    }

    pub async fn store_file_list(&self, owner_id: Uuid, parent_id: Option<Uuid>, entries: &[FileEntry]) {
        match serde_json::to_string(entries) {
            Ok(json) => {
                self.cache
                    .set(&user_file_list_key(owner_id, parent_id), json, self.ttl)
                    .await
            }
            Err(err) => warn!(owner = %owner_id, error = %err, "failed to encode file list for cache"),
        }
    }

    /// Drop cached file listings for an owner after their entries change.
    pub async fn forget_file_lists(&self, owner_id: Uuid) {
        self.cache.delete_prefix(&user_file_list_prefix(owner_id)).await;
    }
}
