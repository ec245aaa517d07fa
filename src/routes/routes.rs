//! HTTP surface of the storage engine.
//!
//! - `GET /healthz`: liveness
//! - `GET /readyz`: database and blob storage readiness
//! - `GET /blobs/{bucket}/{*key}`: redeem a presigned download URL
//!
//! The wildcard `*key` allows nested keys like `files/{owner}/{hash}`.

use crate::{
    handlers::{
        blob_handlers::get_blob,
        health_handlers::{healthz, readyz},
    },
    state::AppState,
};
use axum::{Router, routing::get};

/// Build the router. Handlers share [`AppState`].
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/blobs/{bucket}/{*key}", get(get_blob))
}
