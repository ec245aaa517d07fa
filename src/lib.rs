//! Content-addressed, deduplicating blob storage engine.
//!
//! Objects are stored once per content hash and shared between file entries
//! through a reference count. Large files arrive as resumable chunk uploads,
//! remote URLs are fetched by a queue-driven worker pool, and blobs live on a
//! single filesystem root or a weighted cluster of nodes.

pub mod backend;
pub mod cache;
pub mod config;
pub mod db;
pub mod engine;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod queue;
pub mod routes;
pub mod services;
pub mod state;
pub mod worker;

#[cfg(test)]
pub(crate) mod test_support;
