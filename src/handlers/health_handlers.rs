//! Health & readiness handlers.
//!
//! - GET /healthz  -> simple liveness ("ok")
//! - GET /readyz   -> readiness that checks DB connectivity and blob storage I/O

use crate::{
    backend::{PutOptions, bytes_stream},
    state::AppState,
};
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use std::collections::HashMap;
use uuid::Uuid;

const PROBE_BODY: &[u8] = b"readyz";

/// `GET /healthz`
///
/// Very small liveness check. Always 200 and never performs I/O.
pub async fn healthz() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".into(),
        }),
    )
}

/// `GET /readyz`
///
/// Readiness check that:
/// 1. Runs a lightweight query against SQLite (`SELECT 1`).
/// 2. Writes, reads back and removes a canary blob through the backend.
///
/// HTTP 200 when all checks pass, HTTP 503 when any check fails.
pub async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let sqlite_check = match sqlx::query_scalar::<_, i64>("SELECT 1")
        .fetch_one(&state.db)
        .await
    {
        Ok(1) => (true, None::<String>),
        Ok(v) => (false, Some(format!("unexpected result: {}", v))),
        Err(e) => (false, Some(format!("error: {}", e))),
    };

    let storage_check = check_storage(&state).await;

    let overall_ok = sqlite_check.0 && storage_check.0;
    let mut checks = HashMap::new();
    checks.insert(
        "sqlite",
        CheckStatus {
            ok: sqlite_check.0,
            error: sqlite_check.1,
        },
    );
    checks.insert(
        "storage",
        CheckStatus {
            ok: storage_check.0,
            error: storage_check.1,
        },
    );

    let body = ReadyResponse {
        status: if overall_ok { "ok" } else { "error" }.into(),
        checks,
    };
    let status = if overall_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

async fn check_storage(state: &AppState) -> (bool, Option<String>) {
    let key = format!("readyz/{}", Uuid::new_v4());
    let backend = &state.backend;

    if let Err(e) = backend
        .put(
            &state.bucket,
            &key,
            bytes_stream(PROBE_BODY),
            Some(PROBE_BODY.len() as u64),
            PutOptions::default(),
        )
        .await
    {
        return (false, Some(format!("could not write canary blob: {}", e)));
    }

    let read = match backend.get(&state.bucket, &key).await {
        Ok(reader) => reader.into_bytes().await.map_err(|e| e.to_string()),
        Err(e) => Err(e.to_string()),
    };
    let removed = backend.remove(&state.bucket, &key).await;

    match (read, removed) {
        (Ok(bytes), Ok(())) if bytes.as_ref() == PROBE_BODY => (true, None),
        (Ok(bytes), Err(e)) if bytes.as_ref() == PROBE_BODY => {
            (true, Some(format!("could not remove canary blob: {}", e)))
        }
        (Ok(_), _) => (false, Some("canary content mismatch".to_string())),
        (Err(e), _) => (false, Some(format!("could not read canary blob: {}", e))),
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: String,
    checks: HashMap<&'static str, CheckStatus>,
}

#[derive(Serialize)]
struct CheckStatus {
    ok: bool,
    error: Option<String>,
}
