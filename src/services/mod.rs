//! Metadata-side services: the reference-counted object store, the file
//! catalog it writes entries into, the merge lock, and chunked upload
//! assembly.

pub mod catalog;
pub mod merge_lock;
pub mod object_store;
pub mod upload_assembler;

use crate::backend::BackendError;
use thiserror::Error;

pub use catalog::{FileCatalog, SqlCatalog};
pub use merge_lock::{MergeGuard, MergeLock};
pub use object_store::{FastUploadOutcome, FastUploadRequest, NeedUploadReason, ObjectStore};
pub use upload_assembler::{CompleteRequest, InitOutcome, InitRequest, UploadAssembler};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("invalid request: {0}")]
    Invalid(String),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;
