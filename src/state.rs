//! Shared state handed to every HTTP handler.

use crate::backend::{BlobBackend, PresignSigner};
use sqlx::SqlitePool;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub db: SqlitePool,
    pub backend: Arc<dyn BlobBackend>,
    pub signer: Arc<PresignSigner>,
    /// Bucket the readiness check writes into.
    pub bucket: String,
}
