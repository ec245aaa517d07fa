//! Redeems presigned blob URLs by streaming the payload straight from the
//! backend.

use crate::{errors::AppError, state::AppState};
use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::Response,
};
use std::collections::HashMap;

/// `GET /blobs/{bucket}/{*key}?expires=…&signature=…`
pub async fn get_blob(
    State(state): State<AppState>,
    Path((bucket, key)): Path<(String, String)>,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Response, AppError> {
    let overrides = state.signer.verify(&bucket, &key, &query)?;
    let reader = state.backend.get(&bucket, &key).await?;
    let size = reader.size;

    let mut response = Response::new(Body::from_stream(reader.body));
    *response.status_mut() = StatusCode::OK;
    set_blob_headers(
        response.headers_mut(),
        size,
        overrides.content_type.as_deref(),
        overrides.content_disposition.as_deref(),
    );
    Ok(response)
}

fn set_blob_headers(
    headers: &mut HeaderMap,
    size: u64,
    content_type: Option<&str>,
    disposition: Option<&str>,
) {
    let content_type = content_type.unwrap_or("application/octet-stream");
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(content_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(size));
    if let Some(value) = disposition.and_then(|d| HeaderValue::from_str(d).ok()) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
}
