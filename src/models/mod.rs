//! Core data models for the deduplicating storage engine.
//!
//! Rows map to SQLite tables via `sqlx::FromRow` and serialize as JSON via
//! `serde` so they can be cached and surfaced by callers.

pub mod blob_object;
pub mod download_task;
pub mod file_entry;
pub mod storage_node;
pub mod upload;

pub use blob_object::{BlobObject, NewBlobObject};
pub use download_task::{DownloadStatus, DownloadTask};
pub use file_entry::{FileEntry, NewFileEntry};
pub use storage_node::StorageNode;
pub use upload::{ChunkStatus, FileChunk, SessionStatus, UploadSession};
