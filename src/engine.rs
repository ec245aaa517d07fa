//! Wires the engine's components from configuration. Everything is built
//! once and shared as `Arc` handles.

use crate::{
    backend::{BlobBackend, FsBackend, PresignSigner, StorageCluster},
    cache::{MokaCache, ObjectCache},
    config::AppConfig,
    queue::SqliteBroker,
    services::{MergeLock, ObjectStore, SqlCatalog, UploadAssembler},
    state::AppState,
    worker::{DownloadTasks, DownloadWorker, FetchPolicy, RemoteFetcher, RetryPolicy},
};
use anyhow::{Context, Result};
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::info;

pub struct Engine {
    pub config: AppConfig,
    pub db: SqlitePool,
    pub signer: Arc<PresignSigner>,
    pub backend: Arc<dyn BlobBackend>,
    /// Set when multiple storage nodes are configured.
    pub cluster: Option<Arc<StorageCluster>>,
    pub store: Arc<ObjectStore>,
    pub assembler: Arc<UploadAssembler>,
    pub broker: Arc<SqliteBroker>,
    pub tasks: Arc<DownloadTasks>,
}

impl Engine {
    pub async fn build(config: AppConfig, db: SqlitePool) -> Result<Self> {
        let signer = Arc::new(
            PresignSigner::new(&config.public_endpoint, config.presign_secret.as_bytes())
                .context("building presign signer")?,
        );

        let cluster = if config.cluster.nodes.is_empty() {
            None
        } else {
            let cluster = StorageCluster::from_settings(&config.cluster, &config.bucket, signer.clone())
                .context("building storage cluster")?;
            info!(
                nodes = config.cluster.nodes.len(),
                strategy = %config.cluster.strategy,
                replicas = config.cluster.replica_count,
                "using storage cluster"
            );
            Some(Arc::new(cluster))
        };
        let backend: Arc<dyn BlobBackend> = match &cluster {
            Some(cluster) => cluster.clone() as Arc<dyn BlobBackend>,
            None => {
                info!(root = %config.storage_dir, "using single filesystem backend");
                Arc::new(FsBackend::new(&config.storage_dir, signer.clone()))
            }
        };

        let cache = ObjectCache::new(
            Arc::new(MokaCache::new(config.cache_capacity)),
            config.cache_ttl,
        );
        let store = Arc::new(ObjectStore::new(
            db.clone(),
            cache,
            backend.clone(),
            Arc::new(SqlCatalog::new(db.clone())),
        ));
        let assembler = Arc::new(UploadAssembler::new(
            store.clone(),
            MergeLock::new(db.clone(), config.merge_lock_ttl),
            config.bucket.clone(),
        ));

        let broker = Arc::new(SqliteBroker::new(
            db.clone(),
            config.worker.poll_interval,
            config.worker.lease,
        ));
        let fetcher = Arc::new(
            RemoteFetcher::new(FetchPolicy {
                allow_private: config.worker.allow_private,
                allowed_hosts: config.worker.allowed_hosts.clone(),
                max_bytes: config.worker.max_bytes,
                timeout: config.worker.http_timeout,
            })
            .context("building http client")?,
        );
        let tasks = Arc::new(DownloadTasks::new(
            store.clone(),
            broker.clone(),
            fetcher,
            config.bucket.clone(),
            RetryPolicy {
                max: config.worker.retry_max,
                delays: config.worker.retry_delays.clone(),
            },
        ));

        Ok(Self {
            config,
            db,
            signer,
            backend,
            cluster,
            store,
            assembler,
            broker,
            tasks,
        })
    }

    pub fn state(&self) -> AppState {
        AppState {
            db: self.db.clone(),
            backend: self.backend.clone(),
            signer: self.signer.clone(),
            bucket: self.config.bucket.clone(),
        }
    }

    pub fn worker(&self) -> Arc<DownloadWorker> {
        Arc::new(DownloadWorker::new(
            self.broker.clone(),
            self.tasks.clone(),
            &self.config.worker,
        ))
    }
}
