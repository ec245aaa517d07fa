//! Shared fixtures for unit tests: an in-memory database, a filesystem
//! backend in a temp dir, and an object store wired to both.

use crate::{
    backend::{BlobBackend, FsBackend, PresignSigner},
    cache::{MokaCache, ObjectCache},
    db,
    services::{ObjectStore, SqlCatalog},
};
use sqlx::SqlitePool;
use std::{sync::Arc, time::Duration};
use tempfile::TempDir;

pub const ENDPOINT: &str = "http://127.0.0.1:3000";
pub const SECRET: &str = "test-secret";

pub struct Harness {
    pub pool: SqlitePool,
    pub bucket: String,
    pub signer: Arc<PresignSigner>,
    pub backend: Arc<dyn BlobBackend>,
    pub objects: ObjectCache,
    pub store: Arc<ObjectStore>,
    pub dir: TempDir,
}

impl Harness {
    pub async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let pool = db::connect_in_memory().await.unwrap();
        let signer = Arc::new(PresignSigner::new(ENDPOINT, SECRET).unwrap());
        let backend: Arc<dyn BlobBackend> =
            Arc::new(FsBackend::new(dir.path().join("objects"), signer.clone()));
        let objects = ObjectCache::new(Arc::new(MokaCache::new(1_000)), Duration::from_secs(300));
        let store = Arc::new(ObjectStore::new(
            pool.clone(),
            objects.clone(),
            backend.clone(),
            Arc::new(SqlCatalog::new(pool.clone())),
        ));
        Self {
            pool,
            bucket: "netdisk".to_string(),
            signer,
            backend,
            objects,
            store,
            dir,
        }
    }

    pub async fn count(&self, table: &str) -> i64 {
        sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(&self.pool)
            .await
            .unwrap()
    }
}
