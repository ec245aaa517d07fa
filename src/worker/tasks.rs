//! Download task rows and their state machine:
//! `pending -> running -> {completed | retrying -> pending | failed}`.

use super::fetch::{FetchError, RemoteFetcher};
use crate::{
    backend::{BackendError, ByteStream, PutOptions},
    models::{BlobObject, DownloadStatus, DownloadTask, FileEntry, NewBlobObject, NewFileEntry},
    queue::{Broker, DeadLetterRecord, QueueError, TaskMessage},
    services::{ObjectStore, StoreError, object_store::object_name},
};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use parking_lot::Mutex;
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

pub const DEFAULT_LIST_LIMIT: i64 = 20;

const TASK_COLUMNS: &str = "id, owner_id, source_url, target_bucket, target_object_key, file_name,
    status, progress, retry_count, next_retry_at, error_msg, started_at, finished_at,
    created_at, updated_at";

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("download task {0} not found")]
    NotFound(Uuid),

    #[error("download cancelled")]
    Cancelled,

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

/// What the worker does with a delivery whose processing failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Disposition {
    /// Return the message untouched; this was not an attempt.
    Requeue,
    Retry,
    Terminal,
}

impl TaskError {
    pub fn disposition(&self) -> Disposition {
        match self {
            TaskError::Cancelled | TaskError::Fetch(FetchError::Cancelled) => Disposition::Requeue,
            TaskError::NotFound(_) => Disposition::Terminal,
            TaskError::Fetch(FetchError::HttpStatus { status }) => {
                if *status == StatusCode::REQUEST_TIMEOUT
                    || *status == StatusCode::TOO_MANY_REQUESTS
                    || status.is_server_error()
                {
                    Disposition::Retry
                } else {
                    Disposition::Terminal
                }
            }
            TaskError::Fetch(
                FetchError::InvalidUrl(_)
                | FetchError::Forbidden(_)
                | FetchError::UnknownLength
                | FetchError::TooLarge { .. }
                | FetchError::TooManyRedirects,
            ) => Disposition::Terminal,
            TaskError::Store(
                StoreError::NotFound(_) | StoreError::Forbidden(_) | StoreError::Invalid(_),
            ) => Disposition::Terminal,
            _ => Disposition::Retry,
        }
    }
}

pub type TaskResult<T> = Result<T, TaskError>;

#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// 0 disables retries.
    pub max: u32,
    pub delays: Vec<Duration>,
}

/// Delay before retry number `attempt` (1-based). Attempts past the table
/// reuse its last entry.
pub fn pick_retry_delay(delays: &[Duration], attempt: u32) -> Duration {
    let Some(last) = delays.last() else {
        return Duration::ZERO;
    };
    let index = attempt.saturating_sub(1) as usize;
    delays.get(index).copied().unwrap_or(*last)
}

fn file_name_from_url(url: &Url) -> String {
    url.path_segments()
        .and_then(|mut segments| segments.rfind(|s| !s.is_empty()).map(str::to_string))
        .unwrap_or_else(|| "download".to_string())
}

pub struct DownloadTasks {
    store: Arc<ObjectStore>,
    broker: Arc<dyn Broker>,
    fetcher: Arc<RemoteFetcher>,
    bucket: String,
    retry: RetryPolicy,
}

impl DownloadTasks {
    pub fn new(
        store: Arc<ObjectStore>,
        broker: Arc<dyn Broker>,
        fetcher: Arc<RemoteFetcher>,
        bucket: impl Into<String>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            broker,
            fetcher,
            bucket: bucket.into(),
            retry,
        }
    }

    pub async fn get_task(&self, id: Uuid) -> TaskResult<Option<DownloadTask>> {
        let task = sqlx::query_as::<_, DownloadTask>(&format!(
            "SELECT {TASK_COLUMNS} FROM download_tasks WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(self.store.db())
        .await?;
        Ok(task)
    }

    /// Validate `source_url`, record a pending task and queue it.
    pub async fn create_task(
        &self,
        owner_id: Uuid,
        source_url: &str,
        file_name: &str,
    ) -> TaskResult<DownloadTask> {
        let url = self.fetcher.validate_url(source_url).await?;
        let file_name = match file_name.trim() {
            "" => file_name_from_url(&url),
            name => name.to_string(),
        };
        let token = Uuid::new_v4().simple().to_string();
        let now = Utc::now();

        let task = sqlx::query_as::<_, DownloadTask>(&format!(
            "INSERT INTO download_tasks
                (id, owner_id, source_url, target_bucket, target_object_key, file_name,
                 status, progress, retry_count, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, 0, 0, ?, ?)
             RETURNING {TASK_COLUMNS}"
        ))
        .bind(Uuid::new_v4())
        .bind(owner_id)
        .bind(url.as_str())
        .bind(&self.bucket)
        .bind(object_name(owner_id, &token))
        .bind(&file_name)
        .bind(DownloadStatus::Pending)
        .bind(now)
        .bind(now)
        .fetch_one(self.store.db())
        .await?;

        let msg = TaskMessage {
            task_id: task.id,
            attempt: 0,
        };
        if let Err(err) = self.broker.publish_task(&msg).await {
            warn!(task = %task.id, error = %err, "failed to queue download task");
            self.persist_failure(task.id, &err.to_string()).await?;
            return Err(err.into());
        }

        info!(task = %task.id, owner = %owner_id, url = %url, "download task created");
        Ok(task)
    }

    /// Newest first. A non-positive `limit` means [`DEFAULT_LIST_LIMIT`].
    pub async fn list_tasks(&self, owner_id: Uuid, limit: i64) -> TaskResult<Vec<DownloadTask>> {
        let limit = if limit <= 0 { DEFAULT_LIST_LIMIT } else { limit };
        let tasks = sqlx::query_as::<_, DownloadTask>(&format!(
            "SELECT {TASK_COLUMNS} FROM download_tasks WHERE owner_id = ?
             ORDER BY created_at DESC, rowid DESC LIMIT ?"
        ))
        .bind(owner_id)
        .bind(limit)
        .fetch_all(self.store.db())
        .await?;
        Ok(tasks)
    }

    /// Run one download. Returns the created entry, or `None` when the task
    /// was already finished or claimed by someone else.
    pub async fn process_download_task(
        &self,
        task_id: Uuid,
        cancel: &CancellationToken,
    ) -> TaskResult<Option<FileEntry>> {
        let task = self
            .get_task(task_id)
            .await?
            .ok_or(TaskError::NotFound(task_id))?;
        if task.status == DownloadStatus::Completed {
            debug!(task = %task_id, "download task already completed");
            return Ok(None);
        }

        let now = Utc::now();
        let claimed = sqlx::query(
            "UPDATE download_tasks SET status = ?, started_at = ?, updated_at = ?
             WHERE id = ? AND status IN ('pending', 'retrying')",
        )
        .bind(DownloadStatus::Running)
        .bind(now)
        .bind(now)
        .bind(task_id)
        .execute(self.store.db())
        .await?;
        if claimed.rows_affected() == 0 {
            debug!(task = %task_id, status = task.status.as_str(), "download task not claimable");
            return Ok(None);
        }

        let outcome = self.download(&task, cancel).await;

        match outcome {
            Ok(entry) => {
                self.mark_completed(task_id).await?;
                info!(task = %task_id, entry = %entry.id, size = entry.size_bytes, "download completed");
                Ok(Some(entry))
            }
            Err(err) => {
                if err.disposition() == Disposition::Requeue {
                    self.release_claim(task_id).await;
                }
                Err(err)
            }
        }
    }

    /// Fetch and store the payload, then register it. Only the transfer
    /// observes `cancel`; once the blob is stored, registration and its
    /// compensation run to completion.
    async fn download(&self, task: &DownloadTask, cancel: &CancellationToken) -> TaskResult<FileEntry> {
        let transfer = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TaskError::Cancelled),
            stored = self.transfer(task, cancel) => stored,
        };
        let (size, hash) = match transfer {
            Ok(stored) => stored,
            Err(err) => {
                if matches!(err, TaskError::Cancelled) {
                    self.discard_blob(task).await;
                }
                return Err(err);
            }
        };
        self.register(task, size, hash).await
    }

    /// Stream the remote body into the target key while hashing it.
    async fn transfer(&self, task: &DownloadTask, cancel: &CancellationToken) -> TaskResult<(u64, String)> {
        let fetched = self.fetcher.fetch(&task.source_url, cancel).await?;

        let hasher = Arc::new(Mutex::new(Sha256::new()));
        let tap = hasher.clone();
        let body: ByteStream = Box::pin(fetched.body.map(move |chunk| {
            if let Ok(bytes) = &chunk {
                tap.lock().update(bytes);
            }
            chunk
        }));

        let size = self
            .store
            .backend()
            .put(
                &task.target_bucket,
                &task.target_object_key,
                body,
                fetched.content_length,
                PutOptions {
                    content_type: fetched.content_type,
                },
            )
            .await?;
        let hash = hex::encode(hasher.lock().clone().finalize());
        debug!(task = %task.id, %hash, size, "remote payload stored");
        Ok((size, hash))
    }

    /// Attach the stored blob to an object and create the file entry.
    async fn register(&self, task: &DownloadTask, size: u64, hash: String) -> TaskResult<FileEntry> {
        let (object, created) = match self.store.find_by_hash(&hash).await? {
            Some(existing) => (self.adopt_existing(task, existing, size).await?, false),
            None => {
                let created = self
                    .store
                    .create_object(NewBlobObject {
                        owner_id: task.owner_id,
                        content_hash: hash.clone(),
                        bucket: task.target_bucket.clone(),
                        object_key: task.target_object_key.clone(),
                        size_bytes: size as i64,
                        ref_count: 1,
                    })
                    .await;
                match created {
                    Ok(object) => (object, true),
                    Err(err) => {
                        self.discard_blob(task).await;
                        return Err(err.into());
                    }
                }
            }
        };

        let entry = self
            .store
            .create_entry(NewFileEntry {
                owner_id: task.owner_id,
                parent_id: None,
                name: task.file_name.clone(),
                object_id: object.id,
                size_bytes: object.size_bytes,
            })
            .await;
        match entry {
            Ok(entry) => Ok(entry),
            Err(err) => {
                if created {
                    self.discard_blob(task).await;
                    if let Err(cleanup) = self.store.delete_row(object.id).await {
                        warn!(id = %object.id, error = %cleanup, "failed to delete object row");
                    }
                } else if let Err(rollback) = self.store.decrease_ref_count(object.id).await {
                    warn!(id = %object.id, error = %rollback, "failed to roll back reference");
                }
                Err(err.into())
            }
        }
    }

    /// Attach to an object that already has this content. A ghost object is
    /// repointed at the freshly stored blob; otherwise the fresh blob goes.
    async fn adopt_existing(
        &self,
        task: &DownloadTask,
        existing: BlobObject,
        size: u64,
    ) -> TaskResult<BlobObject> {
        if self.store.is_available(&existing).await? {
            self.discard_blob(task).await;
            self.store.increase_ref_count(existing.id).await?;
            let mut object = existing;
            object.ref_count += 1;
            info!(task = %task.id, object = %object.id, "download deduplicated");
            return Ok(object);
        }

        warn!(id = %existing.id, "repairing blob object from download");
        let mut object = self
            .store
            .update_location(
                existing.id,
                &task.target_bucket,
                &task.target_object_key,
                size as i64,
            )
            .await?;
        object.ref_count = self.store.increase_ref_count(object.id).await?;
        Ok(object)
    }

    async fn discard_blob(&self, task: &DownloadTask) {
        if let Err(err) = self
            .store
            .backend()
            .remove(&task.target_bucket, &task.target_object_key)
            .await
        {
            warn!(task = %task.id, error = %err, "failed to remove downloaded blob");
        }
    }

    async fn mark_completed(&self, task_id: Uuid) -> TaskResult<()> {
        let now = Utc::now();
        sqlx::query(
            "UPDATE download_tasks SET status = ?, progress = 100, error_msg = NULL,
                next_retry_at = NULL, finished_at = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(DownloadStatus::Completed)
        .bind(now)
        .bind(now)
        .bind(task_id)
        .execute(self.store.db())
        .await?;
        Ok(())
    }

    async fn release_claim(&self, task_id: Uuid) {
        let released = sqlx::query(
            "UPDATE download_tasks SET status = ?, updated_at = ? WHERE id = ? AND status = ?",
        )
        .bind(DownloadStatus::Pending)
        .bind(Utc::now())
        .bind(task_id)
        .bind(DownloadStatus::Running)
        .execute(self.store.db())
        .await;
        if let Err(err) = released {
            warn!(task = %task_id, error = %err, "failed to release download task");
        }
    }

    /// Persist a retry and park the message on the retry queue, or fail the
    /// task once retries are exhausted. Returns the status written.
    pub async fn schedule_retry(&self, msg: &TaskMessage, error: &str) -> TaskResult<DownloadStatus> {
        let next = msg.attempt.saturating_add(1);
        if self.retry.max == 0 || next > self.retry.max {
            self.mark_failed(msg, error).await?;
            return Ok(DownloadStatus::Failed);
        }

        let delay = pick_retry_delay(&self.retry.delays, next);
        let now = Utc::now();
        let next_retry_at: DateTime<Utc> = now
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        sqlx::query(
            "UPDATE download_tasks SET status = ?, error_msg = ?, retry_count = ?,
                next_retry_at = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(DownloadStatus::Retrying)
        .bind(error)
        .bind(i64::from(next))
        .bind(next_retry_at)
        .bind(now)
        .bind(msg.task_id)
        .execute(self.store.db())
        .await?;

        self.broker
            .publish_retry(
                &TaskMessage {
                    task_id: msg.task_id,
                    attempt: next,
                },
                delay,
            )
            .await?;
        info!(task = %msg.task_id, attempt = next, delay_ms = delay.as_millis() as u64, "download retry scheduled");
        Ok(DownloadStatus::Retrying)
    }

    /// Persist the failure, then report it on the dead-letter queue.
    pub async fn mark_failed(&self, msg: &TaskMessage, error: &str) -> TaskResult<()> {
        let failed_at = self.persist_failure(msg.task_id, error).await?;
        let record = DeadLetterRecord {
            task_id: msg.task_id,
            attempt: msg.attempt,
            error: error.to_string(),
            failed_at,
        };
        if let Err(err) = self.broker.publish_dlq(&record).await {
            warn!(task = %msg.task_id, error = %err, "failed to publish dead letter");
        }
        warn!(task = %msg.task_id, attempt = msg.attempt, error, "download task failed");
        Ok(())
    }

    async fn persist_failure(&self, task_id: Uuid, error: &str) -> TaskResult<DateTime<Utc>> {
        let now = Utc::now();
        sqlx::query(
            "UPDATE download_tasks SET status = ?, error_msg = ?, finished_at = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(DownloadStatus::Failed)
        .bind(error)
        .bind(now)
        .bind(now)
        .bind(task_id)
        .execute(self.store.db())
        .await?;
        Ok(now)
    }

    /// Put `running` tasks claimed longer than `older_than` ago back on the
    /// queue. Returns how many were recovered.
    pub async fn recover_stale(&self, older_than: Duration) -> TaskResult<usize> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(older_than).unwrap_or_else(|_| chrono::Duration::zero());
        let running = sqlx::query_as::<_, DownloadTask>(&format!(
            "SELECT {TASK_COLUMNS} FROM download_tasks WHERE status = ?"
        ))
        .bind(DownloadStatus::Running)
        .fetch_all(self.store.db())
        .await?;

        let mut recovered = 0;
        for task in running {
            if task.started_at.is_some_and(|started| started > cutoff) {
                continue;
            }
            let reset = sqlx::query(
                "UPDATE download_tasks SET status = ?, updated_at = ? WHERE id = ? AND status = ?",
            )
            .bind(DownloadStatus::Pending)
            .bind(Utc::now())
            .bind(task.id)
            .bind(DownloadStatus::Running)
            .execute(self.store.db())
            .await?;
            if reset.rows_affected() == 0 {
                continue;
            }
            self.broker
                .publish_task(&TaskMessage {
                    task_id: task.id,
                    attempt: u32::try_from(task.retry_count).unwrap_or(0),
                })
                .await?;
            recovered += 1;
        }
        if recovered > 0 {
            info!(recovered, "recovered stale download tasks");
        }
        Ok(recovered)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{
        backend::fs::collect,
        queue::{DLQ_QUEUE, DOWNLOAD_QUEUE, RETRY_QUEUE, SqliteBroker},
        services::{FileCatalog, SqlCatalog, StoreResult},
        test_support::Harness,
        worker::fetch::FetchPolicy,
    };
    use async_trait::async_trait;
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{method, path},
    };

    pub(crate) struct Fixture {
        pub h: Harness,
        pub broker: Arc<SqliteBroker>,
        pub tasks: Arc<DownloadTasks>,
    }

    pub(crate) async fn fixture(retry: RetryPolicy) -> Fixture {
        let h = Harness::new().await;
        let broker = Arc::new(SqliteBroker::new(
            h.pool.clone(),
            Duration::from_millis(10),
            Duration::from_secs(60),
        ));
        broker.declare_topology().await.unwrap();
        let tasks = Arc::new(DownloadTasks::new(
            h.store.clone(),
            broker.clone(),
            local_fetcher(),
            h.bucket.clone(),
            retry,
        ));
        Fixture { h, broker, tasks }
    }

    fn local_fetcher() -> Arc<RemoteFetcher> {
        Arc::new(
            RemoteFetcher::new(FetchPolicy {
                allow_private: true,
                timeout: Duration::from_secs(10),
                ..Default::default()
            })
            .unwrap(),
        )
    }

    /// Fires the shutdown token while the file entry is being written.
    struct CancellingCatalog {
        inner: SqlCatalog,
        cancel: CancellationToken,
    }

    #[async_trait]
    impl FileCatalog for CancellingCatalog {
        async fn create_entry(&self, entry: NewFileEntry) -> StoreResult<FileEntry> {
            self.cancel.cancel();
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.inner.create_entry(entry).await
        }

        async fn delete_entry(&self, owner_id: Uuid, entry_id: Uuid) -> StoreResult<FileEntry> {
            self.inner.delete_entry(owner_id, entry_id).await
        }

        async fn list_entries(
            &self,
            owner_id: Uuid,
            parent_id: Option<Uuid>,
        ) -> StoreResult<Vec<FileEntry>> {
            self.inner.list_entries(owner_id, parent_id).await
        }
    }

    pub(crate) fn retry_policy() -> RetryPolicy {
        RetryPolicy {
            max: 3,
            delays: vec![
                Duration::from_secs(10),
                Duration::from_secs(30),
                Duration::from_secs(120),
            ],
        }
    }

    async fn serve(server: &MockServer, at: &str, body: &'static [u8]) {
        Mock::given(method("GET"))
            .and(path(at))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body.to_vec()))
            .mount(server)
            .await;
    }

    #[test]
    fn retry_delay_table_is_clamped() {
        let delays = retry_policy().delays;
        assert_eq!(pick_retry_delay(&delays, 0), Duration::from_secs(10));
        assert_eq!(pick_retry_delay(&delays, 1), Duration::from_secs(10));
        assert_eq!(pick_retry_delay(&delays, 3), Duration::from_secs(120));
        assert_eq!(pick_retry_delay(&delays, 9), Duration::from_secs(120));
        assert_eq!(pick_retry_delay(&[], 2), Duration::ZERO);
    }

    #[test]
    fn errors_are_classified() {
        let http = |code: u16| {
            TaskError::Fetch(FetchError::HttpStatus {
                status: StatusCode::from_u16(code).unwrap(),
            })
            .disposition()
        };
        assert_eq!(http(408), Disposition::Retry);
        assert_eq!(http(429), Disposition::Retry);
        assert_eq!(http(502), Disposition::Retry);
        assert_eq!(http(404), Disposition::Terminal);
        assert_eq!(http(403), Disposition::Terminal);

        assert_eq!(TaskError::Cancelled.disposition(), Disposition::Requeue);
        assert_eq!(
            TaskError::Fetch(FetchError::Cancelled).disposition(),
            Disposition::Requeue
        );
        assert_eq!(
            TaskError::NotFound(Uuid::nil()).disposition(),
            Disposition::Terminal
        );
        assert_eq!(
            TaskError::Fetch(FetchError::Forbidden("ip not allowed")).disposition(),
            Disposition::Terminal
        );
        assert_eq!(
            TaskError::Store(StoreError::Invalid("bad".into())).disposition(),
            Disposition::Terminal
        );
        assert_eq!(
            TaskError::Fetch(FetchError::Unresolvable).disposition(),
            Disposition::Retry
        );
        assert_eq!(
            TaskError::Backend(BackendError::NoAvailableNodes).disposition(),
            Disposition::Retry
        );
    }

    #[tokio::test]
    async fn create_task_validates_and_queues() {
        let f = fixture(retry_policy()).await;
        let owner = Uuid::new_v4();

        let task = f
            .tasks
            .create_task(owner, "http://127.0.0.1:9/files/report.pdf", " ")
            .await
            .unwrap();
        assert_eq!(task.status, DownloadStatus::Pending);
        assert_eq!(task.file_name, "report.pdf");
        assert!(task.target_object_key.starts_with(&format!("files/{owner}/")));
        assert_eq!(f.broker.depth(DOWNLOAD_QUEUE).await.unwrap(), 1);

        let err = f
            .tasks
            .create_task(owner, "ftp://example.com/x", "x")
            .await
            .unwrap_err();
        assert_eq!(err.disposition(), Disposition::Terminal);
        assert_eq!(f.h.count("download_tasks").await, 1);
    }

    #[tokio::test]
    async fn list_tasks_is_newest_first_and_limited() {
        let f = fixture(retry_policy()).await;
        let owner = Uuid::new_v4();
        let mut ids = Vec::new();
        for name in ["a", "b", "c"] {
            let task = f
                .tasks
                .create_task(owner, "http://127.0.0.1:9/x", name)
                .await
                .unwrap();
            ids.push(task.id);
        }
        f.tasks
            .create_task(Uuid::new_v4(), "http://127.0.0.1:9/x", "other")
            .await
            .unwrap();

        let listed: Vec<Uuid> = f
            .tasks
            .list_tasks(owner, 0)
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.id)
            .collect();
        ids.reverse();
        assert_eq!(listed, ids);
        assert_eq!(f.tasks.list_tasks(owner, 2).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn download_stores_hashed_object_and_entry() {
        let f = fixture(retry_policy()).await;
        let server = MockServer::start().await;
        serve(&server, "/song.mp3", b"la la la").await;
        let owner = Uuid::new_v4();

        let task = f
            .tasks
            .create_task(owner, &format!("{}/song.mp3", server.uri()), "song.mp3")
            .await
            .unwrap();
        let entry = f
            .tasks
            .process_download_task(task.id, &CancellationToken::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.name, "song.mp3");
        assert_eq!(entry.size_bytes, 8);

        let hash = hex::encode(Sha256::digest(b"la la la"));
        let object = f.h.store.find_by_hash(&hash).await.unwrap().unwrap();
        assert_eq!(object.ref_count, 1);
        assert_eq!(object.object_key, task.target_object_key);
        let reader = f.h.backend.get(&object.bucket, &object.object_key).await.unwrap();
        assert_eq!(collect(reader.body).await, b"la la la");

        let done = f.tasks.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(done.status, DownloadStatus::Completed);
        assert_eq!(done.progress, 100);
        assert!(done.finished_at.is_some());

        // a second run is a no-op
        let again = f
            .tasks
            .process_download_task(task.id, &CancellationToken::new())
            .await
            .unwrap();
        assert!(again.is_none());
        assert_eq!(f.h.count("file_entries").await, 1);
    }

    #[tokio::test]
    async fn identical_downloads_share_one_object() {
        let f = fixture(retry_policy()).await;
        let server = MockServer::start().await;
        serve(&server, "/a", b"same bytes").await;
        serve(&server, "/b", b"same bytes").await;
        let owner = Uuid::new_v4();

        for at in ["/a", "/b"] {
            let task = f
                .tasks
                .create_task(owner, &format!("{}{at}", server.uri()), "copy.bin")
                .await
                .unwrap();
            f.tasks
                .process_download_task(task.id, &CancellationToken::new())
                .await
                .unwrap()
                .unwrap();
        }

        assert_eq!(f.h.count("blob_objects").await, 1);
        assert_eq!(f.h.count("file_entries").await, 2);
        let hash = hex::encode(Sha256::digest(b"same bytes"));
        let object = f.h.store.find_by_hash(&hash).await.unwrap().unwrap();
        assert_eq!(object.ref_count, 2);
        assert_eq!(f.h.backend.list(&f.h.bucket).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn missing_task_is_not_found() {
        let f = fixture(retry_policy()).await;
        let err = f
            .tasks
            .process_download_task(Uuid::new_v4(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::NotFound(_)));
    }

    #[tokio::test]
    async fn cancelled_download_releases_the_claim() {
        let f = fixture(retry_policy()).await;
        let task = f
            .tasks
            .create_task(Uuid::new_v4(), "http://127.0.0.1:9/x", "x")
            .await
            .unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = f
            .tasks
            .process_download_task(task.id, &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.disposition(), Disposition::Requeue);
        let task = f.tasks.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(task.status, DownloadStatus::Pending);
    }

    #[tokio::test]
    async fn shutdown_after_the_blob_is_stored_still_finishes_registration() {
        let f = fixture(retry_policy()).await;
        let server = MockServer::start().await;
        serve(&server, "/late.bin", b"late payload").await;

        let cancel = CancellationToken::new();
        let store = Arc::new(ObjectStore::new(
            f.h.pool.clone(),
            f.h.objects.clone(),
            f.h.backend.clone(),
            Arc::new(CancellingCatalog {
                inner: SqlCatalog::new(f.h.pool.clone()),
                cancel: cancel.clone(),
            }),
        ));
        let tasks = DownloadTasks::new(
            store,
            f.broker.clone(),
            local_fetcher(),
            f.h.bucket.clone(),
            retry_policy(),
        );
        let task = tasks
            .create_task(Uuid::new_v4(), &format!("{}/late.bin", server.uri()), "late.bin")
            .await
            .unwrap();

        let entry = tasks
            .process_download_task(task.id, &cancel)
            .await
            .unwrap()
            .unwrap();
        assert!(cancel.is_cancelled());

        let ref_count: i64 = sqlx::query_scalar("SELECT ref_count FROM blob_objects WHERE id = ?")
            .bind(entry.object_id)
            .fetch_one(&f.h.pool)
            .await
            .unwrap();
        assert_eq!(f.h.count("blob_objects").await, 1);
        assert_eq!(ref_count, f.h.count("file_entries").await);
        assert_eq!(ref_count, 1);
        let task = tasks.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(task.status, DownloadStatus::Completed);
    }

    #[tokio::test]
    async fn retry_below_max_parks_message_with_table_delay() {
        let f = fixture(retry_policy()).await;
        let task = f
            .tasks
            .create_task(Uuid::new_v4(), "http://127.0.0.1:9/x", "x")
            .await
            .unwrap();
        let before = Utc::now();

        let status = f
            .tasks
            .schedule_retry(
                &TaskMessage {
                    task_id: task.id,
                    attempt: 1,
                },
                "bad status: 503",
            )
            .await
            .unwrap();
        assert_eq!(status, DownloadStatus::Retrying);

        let task = f.tasks.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(task.status, DownloadStatus::Retrying);
        assert_eq!(task.retry_count, 2);
        assert_eq!(task.error_msg.as_deref(), Some("bad status: 503"));
        let wait = task.next_retry_at.unwrap() - before;
        assert!(wait >= chrono::Duration::seconds(29) && wait <= chrono::Duration::seconds(31));
        assert_eq!(f.broker.depth(RETRY_QUEUE).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn retry_at_max_fails_and_dead_letters_once() {
        let f = fixture(retry_policy()).await;
        let task = f
            .tasks
            .create_task(Uuid::new_v4(), "http://127.0.0.1:9/x", "x")
            .await
            .unwrap();

        let status = f
            .tasks
            .schedule_retry(
                &TaskMessage {
                    task_id: task.id,
                    attempt: 3,
                },
                "bad status: 500",
            )
            .await
            .unwrap();
        assert_eq!(status, DownloadStatus::Failed);

        let task = f.tasks.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(task.status, DownloadStatus::Failed);
        assert!(task.finished_at.is_some());
        assert_eq!(f.broker.depth(DLQ_QUEUE).await.unwrap(), 1);
        assert_eq!(f.broker.depth(RETRY_QUEUE).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn stale_running_tasks_are_requeued() {
        let f = fixture(retry_policy()).await;
        let task = f
            .tasks
            .create_task(Uuid::new_v4(), "http://127.0.0.1:9/x", "x")
            .await
            .unwrap();
        sqlx::query("UPDATE download_tasks SET status = ?, started_at = ? WHERE id = ?")
            .bind(DownloadStatus::Running)
            .bind(Utc::now() - chrono::Duration::hours(2))
            .bind(task.id)
            .execute(&f.h.pool)
            .await
            .unwrap();

        assert_eq!(f.tasks.recover_stale(Duration::from_secs(3600)).await.unwrap(), 1);
        let task = f.tasks.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(task.status, DownloadStatus::Pending);
        assert_eq!(f.broker.depth(DOWNLOAD_QUEUE).await.unwrap(), 2);

        assert_eq!(f.tasks.recover_stale(Duration::from_secs(3600)).await.unwrap(), 0);
    }
}
