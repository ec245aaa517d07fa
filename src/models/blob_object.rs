//! Represents a deduplicated physical blob, keyed by content hash.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// The physical-content record shared by every file entry with identical bytes.
///
/// The blob itself lives in the backend at `bucket/object_key`; this row only
/// tracks where it is and how many file entries still point at it.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq, Eq)]
pub struct BlobObject {
    /// Internal UUID for DB indexing.
    pub id: Uuid,

    /// Owner that first uploaded the content.
    pub owner_id: Uuid,

    /// Content hash; globally unique and used as the dedup key.
    pub content_hash: String,

    /// Backend bucket holding the payload.
    pub bucket: String,

    /// Backend key of the payload within `bucket`.
    pub object_key: String,

    /// Size in bytes.
    pub size_bytes: i64,

    /// Number of live file entries referencing this object.
    pub ref_count: i64,

    /// When the row was created.
    pub created_at: DateTime<Utc>,
}

/// Insert payload for [`BlobObject`].
#[derive(Clone, Debug)]
pub struct NewBlobObject {
    pub owner_id: Uuid,
    pub content_hash: String,
    pub bucket: String,
    pub object_key: String,
    pub size_bytes: i64,
    pub ref_count: i64,
}
