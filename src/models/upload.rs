//! Chunked upload sessions and their committed chunks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Lifecycle of an [`UploadSession`]. Merged sessions are deleted, so a row is
/// either accepting chunks or being merged under the merge lock.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Open,
    Merging,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ChunkStatus {
    Pending,
    Committed,
}

/// A chunked upload in progress for one (owner, content hash) pair.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct UploadSession {
    /// Unique upload ID (returned to client).
    pub upload_id: String,

    /// Owner of the session; chunk commits from anyone else are rejected.
    pub owner_id: Uuid,

    /// Hash of the complete content being assembled.
    pub content_hash: String,

    /// File name the finished entry will carry.
    pub file_name: String,

    /// Total size declared by the client at init.
    pub declared_size: i64,

    /// Size of each chunk except possibly the last.
    pub chunk_size: i64,

    /// Number of chunks that must be committed before merge.
    pub total_chunks: i64,

    pub status: SessionStatus,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

/// One uploaded chunk; unique on `(upload_id, chunk_index)`.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct FileChunk {
    /// Reference to the parent upload session.
    pub upload_id: String,

    /// Chunk position (0-based).
    pub chunk_index: i64,

    /// Size in bytes.
    pub chunk_size_bytes: i64,

    /// Backend key of the chunk payload.
    pub chunk_blob_path: String,

    pub status: ChunkStatus,

    /// Last time the chunk was (re)committed.
    pub updated_at: DateTime<Utc>,
}
