//! Chunked uploads: session init with instant reuse, idempotent chunk
//! commits, and merge-under-lease into a deduplicated blob object.

use super::{
    MergeLock, ObjectStore, StoreError, StoreResult,
    object_store::object_name,
};
use crate::{
    backend::{BlobRef, ByteStream, PutOptions, bytes_stream},
    models::{
        BlobObject, FileChunk, FileEntry, NewBlobObject, NewFileEntry, SessionStatus, UploadSession,
    },
};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Clone, Debug)]
pub struct InitRequest {
    pub content_hash: String,
    pub file_name: String,
    pub size: i64,
    pub chunk_size: i64,
    pub total_chunks: i64,
    pub parent_id: Option<Uuid>,
}

#[derive(Clone, Debug)]
pub struct CompleteRequest {
    pub content_hash: String,
    pub file_name: String,
    /// Zero or negative means "use the session's".
    pub total_chunks: i64,
    /// Zero or negative means "use the session's".
    pub size: i64,
    pub parent_id: Option<Uuid>,
}

/// Result of checking whether an init can be served by an existing object.
#[derive(Debug)]
pub enum ReuseOutcome {
    Reused(FileEntry),
    NotReusable,
}

#[derive(Debug, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InitOutcome {
    Instant { entry: FileEntry },
    Upload { upload_id: String, uploaded: Vec<i64> },
}

pub fn chunk_path(upload_id: &str, index: i64) -> String {
    format!("chunks/{upload_id}/{index}")
}

pub struct UploadAssembler {
    store: Arc<ObjectStore>,
    lock: MergeLock,
    bucket: String,
}

impl UploadAssembler {
    pub fn new(store: Arc<ObjectStore>, lock: MergeLock, bucket: impl Into<String>) -> Self {
        Self {
            store,
            lock,
            bucket: bucket.into(),
        }
    }

    pub async fn init_session(&self, owner_id: Uuid, req: &InitRequest) -> StoreResult<InitOutcome> {
        if req.content_hash.trim().is_empty() {
            return Err(StoreError::Invalid("hash must not be empty".into()));
        }
        if req.total_chunks < 0 || req.chunk_size < 0 || req.size < 0 {
            return Err(StoreError::Invalid(
                "size, chunk_size and total_chunks must not be negative".into(),
            ));
        }

        match self.try_instant_reuse(owner_id, req).await? {
            ReuseOutcome::Reused(entry) => {
                info!(owner = %owner_id, hash = %req.content_hash, "multipart init served instantly");
                Ok(InitOutcome::Instant { entry })
            }
            ReuseOutcome::NotReusable => self.begin_upload_flow(owner_id, req).await,
        }
    }

    async fn try_instant_reuse(&self, owner_id: Uuid, req: &InitRequest) -> StoreResult<ReuseOutcome> {
        let Some(object) = self.store.find_by_hash(&req.content_hash).await? else {
            return Ok(ReuseOutcome::NotReusable);
        };
        if !self.store.is_available(&object).await? {
            debug!(id = %object.id, "existing object has no blob, falling back to upload");
            return Ok(ReuseOutcome::NotReusable);
        }
        let entry = self
            .store
            .attach_existing(owner_id, &object, &req.file_name, req.parent_id)
            .await?;
        Ok(ReuseOutcome::Reused(entry))
    }

    async fn begin_upload_flow(&self, owner_id: Uuid, req: &InitRequest) -> StoreResult<InitOutcome> {
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO upload_sessions
                (upload_id, owner_id, content_hash, file_name, declared_size, chunk_size,
                 total_chunks, status, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, 'open', ?, ?)
             ON CONFLICT(owner_id, content_hash) DO NOTHING",
        )
        .bind(Uuid::new_v4().simple().to_string())
        .bind(owner_id)
        .bind(&req.content_hash)
        .bind(&req.file_name)
        .bind(req.size)
        .bind(req.chunk_size)
        .bind(req.total_chunks)
        .bind(now)
        .bind(now)
        .execute(self.store.db())
        .await?;

        let session = self
            .session_by_hash(owner_id, &req.content_hash)
            .await?
            .ok_or_else(|| StoreError::NotFound("upload session".into()))?;
        let uploaded = self.committed_indices(&session.upload_id).await?;
        Ok(InitOutcome::Upload {
            upload_id: session.upload_id,
            uploaded,
        })
    }

    async fn session_by_hash(&self, owner_id: Uuid, hash: &str) -> StoreResult<Option<UploadSession>> {
        let session = sqlx::query_as::<_, UploadSession>(
            "SELECT upload_id, owner_id, content_hash, file_name, declared_size, chunk_size,
                    total_chunks, status, created_at, updated_at
             FROM upload_sessions WHERE owner_id = ? AND content_hash = ?",
        )
        .bind(owner_id)
        .bind(hash)
        .fetch_optional(self.store.db())
        .await?;
        Ok(session)
    }

    async fn session_by_upload_id(&self, upload_id: &str) -> StoreResult<Option<UploadSession>> {
        let session = sqlx::query_as::<_, UploadSession>(
            "SELECT upload_id, owner_id, content_hash, file_name, declared_size, chunk_size,
                    total_chunks, status, created_at, updated_at
             FROM upload_sessions WHERE upload_id = ?",
        )
        .bind(upload_id)
        .fetch_optional(self.store.db())
        .await?;
        Ok(session)
    }

    async fn committed_chunks(&self, upload_id: &str) -> StoreResult<Vec<FileChunk>> {
        let chunks = sqlx::query_as::<_, FileChunk>(
            "SELECT upload_id, chunk_index, chunk_size_bytes, chunk_blob_path, status, updated_at
             FROM file_chunks WHERE upload_id = ? AND status = 'committed'
             ORDER BY chunk_index ASC",
        )
        .bind(upload_id)
        .fetch_all(self.store.db())
        .await?;
        Ok(chunks)
    }

    async fn committed_indices(&self, upload_id: &str) -> StoreResult<Vec<i64>> {
        Ok(self
            .committed_chunks(upload_id)
            .await?
            .into_iter()
            .map(|chunk| chunk.chunk_index)
            .collect())
    }

    /// Committed chunk indices for the owner's session on `hash`, for resume.
    pub async fn uploaded_chunks(&self, owner_id: Uuid, hash: &str) -> StoreResult<Vec<i64>> {
        match self.session_by_hash(owner_id, hash).await? {
            Some(session) => self.committed_indices(&session.upload_id).await,
            None => Ok(Vec::new()),
        }
    }

    /// Store one chunk. Resubmitting an index overwrites the same blob and row.
    pub async fn commit_chunk(
        &self,
        owner_id: Uuid,
        upload_id: &str,
        index: i64,
        body: ByteStream,
        size: Option<u64>,
    ) -> StoreResult<FileChunk> {
        let session = self
            .session_by_upload_id(upload_id)
            .await?
            .ok_or_else(|| StoreError::NotFound("upload session".into()))?;
        if session.owner_id != owner_id {
            return Err(StoreError::Forbidden("upload session forbidden".into()));
        }
        if index < 0 || index >= session.total_chunks {
            return Err(StoreError::Invalid("chunk index out of range".into()));
        }

        let path = chunk_path(upload_id, index);
        let written = self
            .store
            .backend()
            .put(&self.bucket, &path, body, size, PutOptions::default())
            .await?;

        let now = Utc::now();
        let chunk = sqlx::query_as::<_, FileChunk>(
            "INSERT INTO file_chunks
                (upload_id, chunk_index, chunk_size_bytes, chunk_blob_path, status, updated_at)
             VALUES (?, ?, ?, ?, 'committed', ?)
             ON CONFLICT(upload_id, chunk_index) DO UPDATE SET
                chunk_size_bytes = excluded.chunk_size_bytes,
                chunk_blob_path = excluded.chunk_blob_path,
                status = excluded.status,
                updated_at = excluded.updated_at
             RETURNING upload_id, chunk_index, chunk_size_bytes, chunk_blob_path, status, updated_at",
        )
        .bind(upload_id)
        .bind(index)
        .bind(written as i64)
        .bind(&path)
        .bind(now)
        .fetch_one(self.store.db())
        .await?;

        sqlx::query("UPDATE upload_sessions SET updated_at = ? WHERE upload_id = ?")
            .bind(now)
            .bind(upload_id)
            .execute(self.store.db())
            .await?;

        debug!(upload_id, index, size = written, "chunk committed");
        Ok(chunk)
    }

    /// Merge the owner's chunks for `hash` into a deduplicated object and
    /// create the file entry. Serialized per (owner, hash) by the merge lease.
    pub async fn complete(&self, owner_id: Uuid, req: &CompleteRequest) -> StoreResult<FileEntry> {
        let key = MergeLock::key_for(owner_id, &req.content_hash);
        let guard = self.lock.acquire(&key).await?;
        let result = self.complete_locked(owner_id, req).await;
        self.lock.release(guard).await;
        result
    }

    async fn complete_locked(&self, owner_id: Uuid, req: &CompleteRequest) -> StoreResult<FileEntry> {
        let session = self
            .session_by_hash(owner_id, &req.content_hash)
            .await?
            .ok_or_else(|| StoreError::NotFound("upload session".into()))?;

        let total = if req.total_chunks <= 0 {
            session.total_chunks
        } else if req.total_chunks != session.total_chunks {
            return Err(StoreError::Invalid("total_chunks mismatch".into()));
        } else {
            req.total_chunks
        };
        let size = if req.size <= 0 && session.declared_size > 0 {
            session.declared_size
        } else {
            req.size
        };

        let chunks = self.committed_chunks(&session.upload_id).await?;
        if chunks.len() as i64 != total {
            return Err(StoreError::Invalid("chunks not complete".into()));
        }
        if total == 0 && size != 0 {
            return Err(StoreError::Invalid("invalid total_chunks".into()));
        }

        self.set_session_status(&session.upload_id, SessionStatus::Merging).await?;
        match self.merge(owner_id, req, &chunks, total).await {
            Ok(entry) => {
                self.cleanup(&session, &chunks).await;
                info!(
                    owner = %owner_id,
                    hash = %req.content_hash,
                    object = %entry.object_id,
                    "multipart upload completed"
                );
                Ok(entry)
            }
            Err(err) => {
                if let Err(reset) = self.set_session_status(&session.upload_id, SessionStatus::Open).await {
                    warn!(upload_id = %session.upload_id, error = %reset, "failed to reopen session");
                }
                Err(err)
            }
        }
    }

    async fn merge(
        &self,
        owner_id: Uuid,
        req: &CompleteRequest,
        chunks: &[FileChunk],
        total: i64,
    ) -> StoreResult<FileEntry> {
        let (object, created) = match self.store.find_by_hash(&req.content_hash).await? {
            Some(existing) => (self.reuse_existing(existing, chunks, total).await?, false),
            None => self.create_new(owner_id, req, chunks, total).await?,
        };

        let created_entry = self
            .store
            .create_entry(NewFileEntry {
                owner_id,
                parent_id: req.parent_id,
                name: req.file_name.clone(),
                object_id: object.id,
                size_bytes: object.size_bytes,
            })
            .await;

        match created_entry {
            Ok(entry) => Ok(entry),
            Err(err) => {
                self.compensate(&object, created).await;
                Err(err)
            }
        }
    }

    /// Repair the existing object if its blob is gone, then take a reference.
    async fn reuse_existing(
        &self,
        existing: BlobObject,
        chunks: &[FileChunk],
        total: i64,
    ) -> StoreResult<BlobObject> {
        let object = if self.store.is_available(&existing).await? {
            existing
        } else {
            warn!(id = %existing.id, "repairing blob object from uploaded chunks");
            let written = self
                .write_object(&existing.bucket, &existing.object_key, chunks, total)
                .await?;
            self.store
                .update_location(
                    existing.id,
                    &existing.bucket,
                    &existing.object_key,
                    written as i64,
                )
                .await?
        };
        self.store.increase_ref_count(object.id).await?;
        Ok(object)
    }

    async fn create_new(
        &self,
        owner_id: Uuid,
        req: &CompleteRequest,
        chunks: &[FileChunk],
        total: i64,
    ) -> StoreResult<(BlobObject, bool)> {
        let key = object_name(owner_id, &req.content_hash);
        let written = self.write_object(&self.bucket, &key, chunks, total).await?;

        let created = self
            .store
            .create_object(NewBlobObject {
                owner_id,
                content_hash: req.content_hash.clone(),
                bucket: self.bucket.clone(),
                object_key: key.clone(),
                size_bytes: written as i64,
                ref_count: 1,
            })
            .await;

        match created {
            Ok(object) => Ok((object, true)),
            Err(err) => {
                self.remove_blob(&key).await;
                // another owner finished the same content first
                if let StoreError::Conflict(_) = err {
                    if let Some(existing) = self.store.find_by_hash(&req.content_hash).await? {
                        return Ok((self.reuse_existing(existing, chunks, total).await?, false));
                    }
                }
                Err(err)
            }
        }
    }

    async fn write_object(
        &self,
        bucket: &str,
        key: &str,
        chunks: &[FileChunk],
        total: i64,
    ) -> StoreResult<u64> {
        let backend = self.store.backend();
        if total == 0 {
            return Ok(backend
                .put(bucket, key, bytes_stream(Vec::new()), Some(0), PutOptions::default())
                .await?);
        }
        let sources: Vec<BlobRef> = chunks
            .iter()
            .map(|chunk| BlobRef::new(self.bucket.clone(), chunk.chunk_blob_path.clone()))
            .collect();
        Ok(backend.compose(&BlobRef::new(bucket, key), &sources).await?)
    }

    async fn compensate(&self, object: &BlobObject, created: bool) {
        if created {
            if let Err(err) = self
                .store
                .backend()
                .remove(&object.bucket, &object.object_key)
                .await
            {
                warn!(id = %object.id, error = %err, "failed to remove blob after failed merge");
            }
            if let Err(err) = self.store.delete_row(object.id).await {
                warn!(id = %object.id, error = %err, "failed to delete object row after failed merge");
            }
        } else if let Err(err) = self.store.decrease_ref_count(object.id).await {
            warn!(id = %object.id, error = %err, "failed to roll back reference after failed merge");
        }
    }

    async fn remove_blob(&self, key: &str) {
        if let Err(err) = self.store.backend().remove(&self.bucket, key).await {
            warn!(key, error = %err, "failed to remove orphaned blob");
        }
    }

    async fn set_session_status(&self, upload_id: &str, status: SessionStatus) -> StoreResult<()> {
        sqlx::query("UPDATE upload_sessions SET status = ?, updated_at = ? WHERE upload_id = ?")
            .bind(status)
            .bind(Utc::now())
            .bind(upload_id)
            .execute(self.store.db())
            .await?;
        Ok(())
    }

    /// Best effort: chunk blobs, chunk rows, then the session row.
    async fn cleanup(&self, session: &UploadSession, chunks: &[FileChunk]) {
        for chunk in chunks {
            self.remove_blob(&chunk.chunk_blob_path).await;
        }
        let db = self.store.db();
        if let Err(err) = sqlx::query("DELETE FROM file_chunks WHERE upload_id = ?")
            .bind(&session.upload_id)
            .execute(db)
            .await
        {
            warn!(upload_id = %session.upload_id, error = %err, "failed to delete chunk rows");
        }
        if let Err(err) = sqlx::query("DELETE FROM upload_sessions WHERE upload_id = ?")
            .bind(&session.upload_id)
            .execute(db)
            .await
        {
            warn!(upload_id = %session.upload_id, error = %err, "failed to delete upload session");
        }
    }
}
