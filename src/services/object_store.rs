//! Reference-counted, content-addressed blob objects.
//!
//! One [`BlobObject`] row exists per distinct content hash. File entries point
//! at it and hold one reference each; the blob is removed from the backend
//! when the last reference goes away. Lookups read through [`ObjectCache`];
//! reference counts and availability always come from the database and the
//! backend.

use super::{FileCatalog, StoreError, StoreResult};
use crate::{
    backend::{
        BlobBackend,
        presign::{PARAM_CONTENT_DISPOSITION, PARAM_CONTENT_TYPE},
    },
    cache::ObjectCache,
    db::is_unique_violation,
    models::{BlobObject, FileEntry, NewBlobObject, NewFileEntry},
};
use chrono::Utc;
use serde::Serialize;
use sqlx::SqlitePool;
use std::{collections::BTreeMap, path::Path, sync::Arc, time::Duration};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Backend key of the canonical blob for `hash`.
pub fn object_name(owner_id: Uuid, hash: &str) -> String {
    format!("files/{owner_id}/{hash}")
}

#[derive(Clone, Debug)]
pub struct FastUploadRequest {
    pub content_hash: String,
    pub size: i64,
    pub file_name: String,
    pub parent_id: Option<Uuid>,
}

/// Why a fast upload could not be served from an existing object.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NeedUploadReason {
    HashNotFound,
    SizeMismatch,
    ObjectMissing,
}

impl NeedUploadReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            NeedUploadReason::HashNotFound => "hash_not_found",
            NeedUploadReason::SizeMismatch => "size_mismatch",
            NeedUploadReason::ObjectMissing => "object_missing",
        }
    }
}

#[derive(Debug)]
pub enum FastUploadOutcome {
    Instant(FileEntry),
    NeedUpload(NeedUploadReason),
}

pub struct ObjectStore {
    db: SqlitePool,
    cache: ObjectCache,
    backend: Arc<dyn BlobBackend>,
    catalog: Arc<dyn FileCatalog>,
}

impl ObjectStore {
    pub fn new(
        db: SqlitePool,
        cache: ObjectCache,
        backend: Arc<dyn BlobBackend>,
        catalog: Arc<dyn FileCatalog>,
    ) -> Self {
        Self {
            db,
            cache,
            backend,
            catalog,
        }
    }

    pub fn db(&self) -> &SqlitePool {
        &self.db
    }

    pub fn backend(&self) -> &Arc<dyn BlobBackend> {
        &self.backend
    }

    async fn row_by_id(&self, id: Uuid) -> StoreResult<Option<BlobObject>> {
        let row = sqlx::query_as::<_, BlobObject>(
            "SELECT id, owner_id, content_hash, bucket, object_key, size_bytes, ref_count, created_at
             FROM blob_objects WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.db)
        .await?;
        Ok(row)
    }

    /// Resolve an id taken from a cache index. Misses purge nothing; the
    /// caller decides whether the index entry is stale.
    async fn resolve_cached_id(&self, id: Uuid) -> StoreResult<Option<BlobObject>> {
        if let Some(object) = self.cache.object(id).await {
            return Ok(Some(object));
        }
        let row = self.row_by_id(id).await?;
        if let Some(object) = &row {
            self.cache.store(object).await;
        }
        Ok(row)
    }

    pub async fn find_by_id(&self, id: Uuid) -> StoreResult<Option<BlobObject>> {
        self.resolve_cached_id(id).await
    }

    pub async fn find_by_hash(&self, hash: &str) -> StoreResult<Option<BlobObject>> {
        if let Some(id) = self.cache.id_by_hash(hash).await {
            match self.resolve_cached_id(id).await? {
                Some(object) if object.content_hash == hash => return Ok(Some(object)),
                _ => {
                    debug!(hash, %id, "purging stale hash cache entry");
                    self.cache.forget_hash(hash).await;
                    self.cache.forget_id(id).await;
                }
            }
        }

        let row = sqlx::query_as::<_, BlobObject>(
            "SELECT id, owner_id, content_hash, bucket, object_key, size_bytes, ref_count, created_at
             FROM blob_objects WHERE content_hash = ?",
        )
        .bind(hash)
        .fetch_optional(&self.db)
        .await?;
        if let Some(object) = &row {
            self.cache.store(object).await;
        }
        Ok(row)
    }

    pub async fn find_by_bucket_key(
        &self,
        bucket: &str,
        key: &str,
    ) -> StoreResult<Option<BlobObject>> {
        if let Some(id) = self.cache.id_by_path(bucket, key).await {
            match self.resolve_cached_id(id).await? {
                Some(object) if object.bucket == bucket && object.object_key == key => {
                    return Ok(Some(object));
                }
                _ => {
                    debug!(bucket, key, %id, "purging stale path cache entry");
                    self.cache.forget_path(bucket, key).await;
                    self.cache.forget_id(id).await;
                }
            }
        }

        let row = sqlx::query_as::<_, BlobObject>(
            "SELECT id, owner_id, content_hash, bucket, object_key, size_bytes, ref_count, created_at
             FROM blob_objects WHERE bucket = ? AND object_key = ?
             ORDER BY created_at LIMIT 1",
        )
        .bind(bucket)
        .bind(key)
        .fetch_optional(&self.db)
        .await?;
        if let Some(object) = &row {
            self.cache.store(object).await;
        }
        Ok(row)
    }

    pub async fn create_object(&self, new: NewBlobObject) -> StoreResult<BlobObject> {
        let inserted = sqlx::query_as::<_, BlobObject>(
            "INSERT INTO blob_objects
                (id, owner_id, content_hash, bucket, object_key, size_bytes, ref_count, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             RETURNING id, owner_id, content_hash, bucket, object_key, size_bytes, ref_count, created_at",
        )
        .bind(Uuid::new_v4())
        .bind(new.owner_id)
        .bind(&new.content_hash)
        .bind(&new.bucket)
        .bind(&new.object_key)
        .bind(new.size_bytes)
        .bind(new.ref_count)
        .bind(Utc::now())
        .fetch_one(&self.db)
        .await;

        match inserted {
            Ok(object) => {
                self.cache.store(&object).await;
                debug!(id = %object.id, hash = %object.content_hash, "created blob object");
                Ok(object)
            }
            Err(err) if is_unique_violation(&err) => Err(StoreError::Conflict(format!(
                "object with hash {} already exists",
                new.content_hash
            ))),
            Err(err) => Err(StoreError::Sqlx(err)),
        }
    }

    pub async fn increase_ref_count(&self, id: Uuid) -> StoreResult<i64> {
        let count: Option<i64> = sqlx::query_scalar(
            "UPDATE blob_objects SET ref_count = ref_count + 1 WHERE id = ? RETURNING ref_count",
        )
        .bind(id)
        .fetch_optional(&self.db)
        .await?;
        self.cache.forget_id(id).await;
        count.ok_or_else(|| StoreError::NotFound(format!("blob object {id}")))
    }

    /// Drop one reference. At zero the blob, the row, its cache keys, and any
    /// leftover chunk rows for the same (owner, hash) are removed. Returns the
    /// remaining count.
    pub async fn decrease_ref_count(&self, id: Uuid) -> StoreResult<i64> {
        let remaining: Option<i64> = sqlx::query_scalar(
            "UPDATE blob_objects SET ref_count = ref_count - 1
             WHERE id = ? AND ref_count > 0 RETURNING ref_count",
        )
        .bind(id)
        .fetch_optional(&self.db)
        .await?;
        self.cache.forget_id(id).await;

        match remaining {
            Some(count) if count > 0 => Ok(count),
            Some(_) => {
                self.reclaim(id).await?;
                Ok(0)
            }
            None => match self.row_by_id(id).await? {
                // already at zero: finish an interrupted reclaim
                Some(_) => {
                    self.reclaim(id).await?;
                    Ok(0)
                }
                None => Err(StoreError::NotFound(format!("blob object {id}"))),
            },
        }
    }

    async fn reclaim(&self, id: Uuid) -> StoreResult<()> {
        let Some(object) = self.row_by_id(id).await? else {
            return Ok(());
        };
        if object.ref_count > 0 {
            // re-referenced while we were deciding
            return Ok(());
        }

        self.backend
            .remove(&object.bucket, &object.object_key)
            .await?;
        sqlx::query("DELETE FROM blob_objects WHERE id = ? AND ref_count = 0")
            .bind(id)
            .execute(&self.db)
            .await?;
        self.cache.forget(&object).await;

        let chunks = sqlx::query(
            "DELETE FROM file_chunks WHERE upload_id IN
                (SELECT upload_id FROM upload_sessions WHERE owner_id = ? AND content_hash = ?)",
        )
        .bind(object.owner_id)
        .bind(&object.content_hash)
        .execute(&self.db)
        .await?;

        info!(
            id = %object.id,
            hash = %object.content_hash,
            stale_chunks = chunks.rows_affected(),
            "reclaimed unreferenced blob object"
        );
        Ok(())
    }

    pub async fn release(&self, id: Uuid) -> StoreResult<i64> {
        self.decrease_ref_count(id).await
    }

    /// Whether the object's blob is actually present in the backend.
    pub async fn is_available(&self, object: &BlobObject) -> StoreResult<bool> {
        Ok(self
            .backend
            .head(&object.bucket, &object.object_key)
            .await?
            .is_some())
    }

    pub async fn create_entry(&self, entry: NewFileEntry) -> StoreResult<FileEntry> {
        let owner_id = entry.owner_id;
        let created = self.catalog.create_entry(entry).await?;
        self.cache.forget_file_lists(owner_id).await;
        Ok(created)
    }

    /// Take a reference on `object` and record a file entry for it. The
    /// reference is given back if the entry cannot be created.
    pub async fn attach_existing(
        &self,
        owner_id: Uuid,
        object: &BlobObject,
        file_name: &str,
        parent_id: Option<Uuid>,
    ) -> StoreResult<FileEntry> {
        self.increase_ref_count(object.id).await?;

        let created = self
            .create_entry(NewFileEntry {
                owner_id,
                parent_id,
                name: file_name.to_string(),
                object_id: object.id,
                size_bytes: object.size_bytes,
            })
            .await;

        match created {
            Ok(entry) => Ok(entry),
            Err(err) => {
                if let Err(rollback) = self.decrease_ref_count(object.id).await {
                    warn!(id = %object.id, error = %rollback, "failed to roll back reference");
                }
                Err(err)
            }
        }
    }

    /// Serve an upload from an existing object with the same content hash.
    pub async fn fast_upload(
        &self,
        owner_id: Uuid,
        req: &FastUploadRequest,
    ) -> StoreResult<FastUploadOutcome> {
        let Some(object) = self.find_by_hash(&req.content_hash).await? else {
            return Ok(FastUploadOutcome::NeedUpload(NeedUploadReason::HashNotFound));
        };
        if req.size > 0 && object.size_bytes > 0 && req.size != object.size_bytes {
            return Ok(FastUploadOutcome::NeedUpload(NeedUploadReason::SizeMismatch));
        }
        if !self.is_available(&object).await? {
            return Ok(FastUploadOutcome::NeedUpload(NeedUploadReason::ObjectMissing));
        }

        let entry = self
            .attach_existing(owner_id, &object, &req.file_name, req.parent_id)
            .await?;
        Ok(FastUploadOutcome::Instant(entry))
    }

    /// Point an object at a new blob location after a repair.
    pub async fn update_location(
        &self,
        id: Uuid,
        bucket: &str,
        key: &str,
        size_bytes: i64,
    ) -> StoreResult<BlobObject> {
        let previous = self
            .row_by_id(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("blob object {id}")))?;

        let updated = sqlx::query_as::<_, BlobObject>(
            "UPDATE blob_objects SET bucket = ?, object_key = ?, size_bytes = ? WHERE id = ?
             RETURNING id, owner_id, content_hash, bucket, object_key, size_bytes, ref_count, created_at",
        )
        .bind(bucket)
        .bind(key)
        .bind(size_bytes)
        .bind(id)
        .fetch_optional(&self.db)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("blob object {id}")))?;

        self.cache
            .forget_path(&previous.bucket, &previous.object_key)
            .await;
        self.cache.store(&updated).await;
        Ok(updated)
    }

    /// Remove a row outright, regardless of its reference count.
    pub async fn delete_row(&self, id: Uuid) -> StoreResult<()> {
        let removed = sqlx::query_as::<_, BlobObject>(
            "DELETE FROM blob_objects WHERE id = ?
             RETURNING id, owner_id, content_hash, bucket, object_key, size_bytes, ref_count, created_at",
        )
        .bind(id)
        .fetch_optional(&self.db)
        .await?;
        match removed {
            Some(object) => self.cache.forget(&object).await,
            None => self.cache.forget_id(id).await,
        }
        Ok(())
    }

    /// Files directly under `parent_id`, read through the listing cache.
    pub async fn list_files(&self, owner_id: Uuid, parent_id: Option<Uuid>) -> StoreResult<Vec<FileEntry>> {
        if let Some(entries) = self.cache.file_list(owner_id, parent_id).await {
            return Ok(entries);
        }
        let entries = self.catalog.list_entries(owner_id, parent_id).await?;
        self.cache.store_file_list(owner_id, parent_id, &entries).await;
        Ok(entries)
    }

    /// Delete one of the owner's file entries and drop its reference.
    pub async fn delete_file(&self, owner_id: Uuid, entry_id: Uuid) -> StoreResult<FileEntry> {
        let entry = self.catalog.delete_entry(owner_id, entry_id).await?;
        self.cache.forget_file_lists(owner_id).await;
        match self.release(entry.object_id).await {
            Ok(remaining) => {
                debug!(object = %entry.object_id, remaining, "released file reference");
            }
            Err(StoreError::NotFound(_)) => {
                warn!(object = %entry.object_id, "file entry pointed at a missing object");
            }
            Err(err) => return Err(err),
        }
        Ok(entry)
    }

    /// Presigned download URL that makes clients save the blob under
    /// `file_name`.
    pub async fn presign_download(
        &self,
        object: &BlobObject,
        file_name: &str,
        ttl: Duration,
    ) -> StoreResult<String> {
        let mut params = BTreeMap::new();
        params.insert(
            PARAM_CONTENT_TYPE.to_string(),
            content_type_for(file_name).to_string(),
        );
        params.insert(
            PARAM_CONTENT_DISPOSITION.to_string(),
            format!(
                "attachment; filename=\"{}\"",
                sanitize_header_filename(file_name)
            ),
        );

        match self
            .backend
            .presign(&object.bucket, &object.object_key, ttl, &params)
            .await
        {
            Ok(url) => Ok(url),
            Err(err) => {
                warn!(id = %object.id, error = %err, "presign with response headers failed, retrying plain");
                Ok(self
                    .backend
                    .presign(&object.bucket, &object.object_key, ttl, &BTreeMap::new())
                    .await?)
            }
        }
    }
}

/// MIME type inferred from the file extension.
pub fn content_type_for(file_name: &str) -> &'static str {
    let ext = Path::new(file_name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "txt" => "text/plain; charset=utf-8",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "tar" => "application/x-tar",
        "gz" => "application/gzip",
        "mp4" => "video/mp4",
        _ => "application/octet-stream",
    }
}

/// Strip characters that would break a quoted header parameter.
pub fn sanitize_header_filename(name: &str) -> String {
    let clean: String = name
        .trim()
        .chars()
        .filter(|c| !matches!(c, '\r' | '\n' | '"'))
        .collect();
    if clean.is_empty() {
        "download".to_string()
    } else {
        clean
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::{PutOptions, bytes_stream},
        services::SqlCatalog,
        test_support::Harness,
    };

    async fn stored_object(h: &Harness, hash: &str, body: &'static str) -> BlobObject {
        let owner = Uuid::new_v4();
        let key = object_name(owner, hash);
        h.backend
            .put(&h.bucket, &key, bytes_stream(body), None, PutOptions::default())
            .await
            .unwrap();
        h.store
            .create_object(NewBlobObject {
                owner_id: owner,
                content_hash: hash.to_string(),
                bucket: h.bucket.clone(),
                object_key: key,
                size_bytes: body.len() as i64,
                ref_count: 1,
            })
            .await
            .unwrap()
    }

    async fn ref_count(h: &Harness, id: Uuid) -> Option<i64> {
        sqlx::query_scalar("SELECT ref_count FROM blob_objects WHERE id = ?")
            .bind(id)
            .fetch_optional(&h.pool)
            .await
            .unwrap()
    }

    fn request(hash: &str, size: i64) -> FastUploadRequest {
        FastUploadRequest {
            content_hash: hash.to_string(),
            size,
            file_name: "copy.txt".into(),
            parent_id: None,
        }
    }

    #[tokio::test]
    async fn lookups_agree_across_keys() {
        let h = Harness::new().await;
        let object = stored_object(&h, "h1", "abc").await;

        let by_hash = h.store.find_by_hash("h1").await.unwrap().unwrap();
        let by_id = h.store.find_by_id(object.id).await.unwrap().unwrap();
        let by_path = h
            .store
            .find_by_bucket_key(&object.bucket, &object.object_key)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_hash.id, object.id);
        assert_eq!(by_id.id, object.id);
        assert_eq!(by_path.id, object.id);
        assert!(h.store.find_by_hash("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_hash_is_a_conflict() {
        let h = Harness::new().await;
        let object = stored_object(&h, "h1", "abc").await;
        let err = h
            .store
            .create_object(NewBlobObject {
                owner_id: Uuid::new_v4(),
                content_hash: "h1".into(),
                bucket: object.bucket.clone(),
                object_key: "files/x/h1".into(),
                size_bytes: 3,
                ref_count: 1,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn stale_cache_entry_is_purged() {
        let h = Harness::new().await;
        let object = stored_object(&h, "h1", "abc").await;
        h.store.find_by_hash("h1").await.unwrap();

        // row disappears behind the cache's back
        sqlx::query("DELETE FROM blob_objects WHERE id = ?")
            .bind(object.id)
            .execute(&h.pool)
            .await
            .unwrap();
        h.objects.forget_id(object.id).await;

        assert!(h.store.find_by_hash("h1").await.unwrap().is_none());
        assert_eq!(h.objects.id_by_hash("h1").await, None);
    }

    #[tokio::test]
    async fn ref_count_reaching_zero_removes_blob_and_row() {
        let h = Harness::new().await;
        let object = stored_object(&h, "h1", "abc").await;

        assert_eq!(h.store.increase_ref_count(object.id).await.unwrap(), 2);
        assert_eq!(h.store.decrease_ref_count(object.id).await.unwrap(), 1);
        assert!(h.store.is_available(&object).await.unwrap());

        assert_eq!(h.store.decrease_ref_count(object.id).await.unwrap(), 0);
        assert!(!h.store.is_available(&object).await.unwrap());
        assert_eq!(ref_count(&h, object.id).await, None);
        assert!(h.store.find_by_hash("h1").await.unwrap().is_none());

        let err = h.store.decrease_ref_count(object.id).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn zero_reaching_release_clears_leftover_chunks() {
        let h = Harness::new().await;
        let object = stored_object(&h, "h1", "abc").await;
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO upload_sessions (upload_id, owner_id, content_hash, file_name, declared_size,
                 chunk_size, total_chunks, status, created_at, updated_at)
             VALUES ('up1', ?, 'h1', 'a.txt', 3, 3, 1, 'open', ?, ?)",
        )
        .bind(object.owner_id)
        .bind(now)
        .bind(now)
        .execute(&h.pool)
        .await
        .unwrap();
        sqlx::query(
            "INSERT INTO file_chunks (upload_id, chunk_index, chunk_size_bytes, chunk_blob_path, status, updated_at)
             VALUES ('up1', 0, 3, 'chunks/up1/0', 'committed', ?)",
        )
        .bind(now)
        .execute(&h.pool)
        .await
        .unwrap();

        h.store.release(object.id).await.unwrap();
        let chunks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM file_chunks")
            .fetch_one(&h.pool)
            .await
            .unwrap();
        assert_eq!(chunks, 0);
    }

    #[tokio::test]
    async fn fast_upload_hits_increment_once() {
        let h = Harness::new().await;
        let object = stored_object(&h, "h1", "abc").await;
        let owner = Uuid::new_v4();

        let outcome = h.store.fast_upload(owner, &request("h1", 3)).await.unwrap();
        let FastUploadOutcome::Instant(entry) = outcome else {
            panic!("expected instant upload");
        };
        assert_eq!(entry.object_id, object.id);
        assert_eq!(entry.owner_id, owner);
        assert_eq!(ref_count(&h, object.id).await, Some(2));
    }

    #[tokio::test]
    async fn fast_upload_misses_do_not_touch_ref_count() {
        let h = Harness::new().await;
        let object = stored_object(&h, "h1", "abc").await;
        let owner = Uuid::new_v4();

        let outcome = h.store.fast_upload(owner, &request("other", 3)).await.unwrap();
        assert!(matches!(
            outcome,
            FastUploadOutcome::NeedUpload(NeedUploadReason::HashNotFound)
        ));

        let outcome = h.store.fast_upload(owner, &request("h1", 4)).await.unwrap();
        assert!(matches!(
            outcome,
            FastUploadOutcome::NeedUpload(NeedUploadReason::SizeMismatch)
        ));

        // unknown client size skips the size check
        h.backend
            .remove(&object.bucket, &object.object_key)
            .await
            .unwrap();
        let outcome = h.store.fast_upload(owner, &request("h1", 0)).await.unwrap();
        assert!(matches!(
            outcome,
            FastUploadOutcome::NeedUpload(NeedUploadReason::ObjectMissing)
        ));

        assert_eq!(ref_count(&h, object.id).await, Some(1));
    }

    #[tokio::test]
    async fn failed_entry_creation_rolls_back_reference() {
        let h = Harness::new().await;
        let object = stored_object(&h, "h1", "abc").await;

        let mut req = request("h1", 3);
        req.file_name = "  ".into();
        let err = h.store.fast_upload(Uuid::new_v4(), &req).await.unwrap_err();
        assert!(matches!(err, StoreError::Invalid(_)));
        assert_eq!(ref_count(&h, object.id).await, Some(1));
    }

    #[tokio::test]
    async fn delete_file_releases_object() {
        let h = Harness::new().await;
        let object = stored_object(&h, "h1", "abc").await;
        let owner = Uuid::new_v4();
        let FastUploadOutcome::Instant(entry) =
            h.store.fast_upload(owner, &request("h1", 3)).await.unwrap()
        else {
            panic!("expected instant upload");
        };

        h.store.delete_file(owner, entry.id).await.unwrap();
        assert_eq!(ref_count(&h, object.id).await, Some(1));
        let err = h.store.delete_file(owner, entry.id).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn file_listing_is_cached_until_entries_change() {
        let h = Harness::new().await;
        let object = stored_object(&h, "h-list", "listed").await;
        let owner = object.owner_id;
        let entry = |name: &str| NewFileEntry {
            owner_id: owner,
            parent_id: None,
            name: name.into(),
            object_id: object.id,
            size_bytes: object.size_bytes,
        };

        let first = h.store.create_entry(entry("one.txt")).await.unwrap();
        assert_eq!(h.store.list_files(owner, None).await.unwrap(), vec![first.clone()]);

        // rows written around the store stay invisible while the listing is cached
        SqlCatalog::new(h.pool.clone())
            .create_entry(entry("sideways.txt"))
            .await
            .unwrap();
        assert_eq!(h.store.list_files(owner, None).await.unwrap().len(), 1);

        let second = h.store.create_entry(entry("two.txt")).await.unwrap();
        let names: Vec<String> = h
            .store
            .list_files(owner, None)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec!["one.txt", "sideways.txt", "two.txt"]);

        h.store.delete_file(owner, second.id).await.unwrap();
        assert_eq!(h.store.list_files(owner, None).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn update_location_moves_path_index() {
        let h = Harness::new().await;
        let object = stored_object(&h, "h1", "abc").await;
        h.store
            .find_by_bucket_key(&object.bucket, &object.object_key)
            .await
            .unwrap();

        let moved = h
            .store
            .update_location(object.id, &object.bucket, "files/repaired/h1", 5)
            .await
            .unwrap();
        assert_eq!(moved.size_bytes, 5);
        assert_eq!(h.objects.id_by_path(&object.bucket, &object.object_key).await, None);
        assert_eq!(
            h.objects.id_by_path(&object.bucket, "files/repaired/h1").await,
            Some(object.id)
        );
    }

    #[tokio::test]
    async fn presigned_download_carries_name_and_type() {
        let h = Harness::new().await;
        let object = stored_object(&h, "h1", "abc").await;

        let url = h
            .store
            .presign_download(&object, "holiday \"pics\".PNG", Duration::from_secs(60))
            .await
            .unwrap();
        let parsed = url::Url::parse(&url).unwrap();
        let query: std::collections::HashMap<_, _> = parsed.query_pairs().into_owned().collect();
        assert_eq!(query[PARAM_CONTENT_TYPE], "image/png");
        assert_eq!(
            query[PARAM_CONTENT_DISPOSITION],
            "attachment; filename=\"holiday pics.PNG\""
        );
    }

    #[test]
    fn header_filenames_are_sanitized() {
        assert_eq!(sanitize_header_filename("  "), "download");
        assert_eq!(sanitize_header_filename("a\r\nb\".txt"), "ab.txt");
        assert_eq!(content_type_for("archive.tar.gz"), "application/gzip");
        assert_eq!(content_type_for("noext"), "application/octet-stream");
    }
}
