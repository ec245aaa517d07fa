//! Blob backends: the key/bucket object stores the metadata layer sits on.
//!
//! [`BlobBackend`] is the seam every higher layer talks to. [`fs::FsBackend`]
//! keeps payloads on local disk; [`cluster::StorageCluster`] spreads them over
//! several nodes with replication and migration.

pub mod cluster;
pub mod fs;
pub mod presign;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt, TryStreamExt, stream};
use std::{collections::BTreeMap, io, pin::Pin, time::Duration};
use thiserror::Error;

pub use cluster::StorageCluster;
pub use fs::FsBackend;
pub use presign::PresignSigner;

/// A boxed stream of payload bytes, used for both writes and reads.
pub type ByteStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("object `{key}` not found in bucket `{bucket}`")]
    NotFound { bucket: String, key: String },
    #[error("bucket `{name}` invalid: {reason}")]
    InvalidBucketName { name: String, reason: String },
    #[error("invalid object key `{0}`")]
    InvalidObjectKey(String),
    #[error("size mismatch for `{key}`: expected {expected} bytes, received {actual}")]
    SizeMismatch {
        key: String,
        expected: u64,
        actual: u64,
    },
    #[error("no available storage nodes")]
    NoAvailableNodes,
    #[error("invalid presign endpoint: {0}")]
    InvalidEndpoint(String),
    #[error("invalid presign secret: {0}")]
    InvalidSecret(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl BackendError {
    pub fn not_found(bucket: &str, key: &str) -> Self {
        BackendError::NotFound {
            bucket: bucket.to_string(),
            key: key.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, BackendError::NotFound { .. })
    }
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Location of a blob.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct BlobRef {
    pub bucket: String,
    pub key: String,
}

impl BlobRef {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectInfo {
    pub key: String,
    pub size: u64,
}

#[derive(Clone, Debug, Default)]
pub struct PutOptions {
    pub content_type: Option<String>,
}

/// An opened blob ready for streaming out.
pub struct BlobReader {
    pub body: ByteStream,
    pub size: u64,
}

impl BlobReader {
    /// Buffer the whole payload. Only meant for small blobs and tests.
    pub async fn into_bytes(self) -> io::Result<Bytes> {
        let mut buf = BytesMut::with_capacity(self.size as usize);
        let mut body = self.body;
        while let Some(chunk) = body.try_next().await? {
            buf.extend_from_slice(&chunk);
        }
        Ok(buf.freeze())
    }
}

/// Object store operations the engine relies on.
///
/// Writes are atomic on their destination: an interrupted `put` or `compose`
/// leaves any previous payload at the key untouched.
#[async_trait]
pub trait BlobBackend: Send + Sync {
    /// Stream `body` into `bucket/key`. When `expected_size` is given, a
    /// different byte count fails the write. Returns the bytes written.
    async fn put(
        &self,
        bucket: &str,
        key: &str,
        body: ByteStream,
        expected_size: Option<u64>,
        opts: PutOptions,
    ) -> BackendResult<u64>;

    async fn get(&self, bucket: &str, key: &str) -> BackendResult<BlobReader>;

    async fn head(&self, bucket: &str, key: &str) -> BackendResult<Option<ObjectInfo>>;

    /// Remove a blob. Missing blobs are not an error.
    async fn remove(&self, bucket: &str, key: &str) -> BackendResult<()>;

    /// Concatenate `sources` in order into `dest`. Returns the composed size.
    async fn compose(&self, dest: &BlobRef, sources: &[BlobRef]) -> BackendResult<u64>;

    /// Time-limited URL for reading a blob without credentials.
    async fn presign(
        &self,
        bucket: &str,
        key: &str,
        ttl: Duration,
        response_params: &BTreeMap<String, String>,
    ) -> BackendResult<String>;

    async fn list(&self, bucket: &str) -> BackendResult<Vec<ObjectInfo>>;
}

/// Wrap an in-memory payload as a [`ByteStream`].
pub fn bytes_stream(data: impl Into<Bytes>) -> ByteStream {
    let data: Bytes = data.into();
    if data.is_empty() {
        return stream::empty().boxed();
    }
    stream::once(async move { Ok(data) }).boxed()
}
