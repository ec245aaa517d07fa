//! Asynchronous remote download tasks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Task state machine:
/// `pending -> running -> {completed | retrying -> pending | failed}`.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    Pending,
    Running,
    Retrying,
    Completed,
    Failed,
}

impl DownloadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadStatus::Pending => "pending",
            DownloadStatus::Running => "running",
            DownloadStatus::Retrying => "retrying",
            DownloadStatus::Completed => "completed",
            DownloadStatus::Failed => "failed",
        }
    }

    /// Terminal states are never left once entered.
    pub fn is_terminal(&self) -> bool {
        matches!(self, DownloadStatus::Completed | DownloadStatus::Failed)
    }
}

/// A remote URL scheduled to be fetched into storage for an owner.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct DownloadTask {
    /// Internal UUID for DB indexing.
    pub id: Uuid,

    /// Owner who requested the download.
    pub owner_id: Uuid,

    /// Remote http(s) URL to fetch.
    pub source_url: String,

    /// Bucket the payload is written into.
    pub target_bucket: String,

    /// Backend key the payload is written to.
    pub target_object_key: String,

    /// Name of the file entry created on success.
    pub file_name: String,

    pub status: DownloadStatus,

    /// 0 until the task completes, then 100.
    pub progress: i64,

    /// Number of retries scheduled so far.
    pub retry_count: i64,

    /// When the next retry becomes due, if one is scheduled.
    pub next_retry_at: Option<DateTime<Utc>>,

    /// Last failure message.
    pub error_msg: Option<String>,

    pub started_at: Option<DateTime<Utc>>,

    pub finished_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}
