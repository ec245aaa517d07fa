//! Presigned blob URLs.
//!
//! A URL looks like
//! `{endpoint}/blobs/{bucket}/{key}?expires=<unix>&response-…=…&signature=<sig>`.
//! The signature is an HMAC-SHA256 over the bucket, key, expiry, and every
//! `response-*` parameter, so none of them can be altered after signing.

use super::{BackendError, BackendResult};
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::{
    collections::{BTreeMap, HashMap},
    time::Duration,
};
use thiserror::Error;
use url::Url;

pub const PARAM_CONTENT_TYPE: &str = "response-content-type";
pub const PARAM_CONTENT_DISPOSITION: &str = "response-content-disposition";

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PresignError {
    #[error("missing `{0}` parameter")]
    Missing(&'static str),
    #[error("malformed expiry")]
    MalformedExpiry,
    #[error("url expired")]
    Expired,
    #[error("signature mismatch")]
    BadSignature,
}

/// Response header overrides carried by a verified URL.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ResponseOverrides {
    pub content_type: Option<String>,
    pub content_disposition: Option<String>,
}

#[derive(Clone)]
pub struct PresignSigner {
    endpoint: Url,
    /// Keyed with the secret; cloned per signature.
    keyed: HmacSha256,
}

impl PresignSigner {
    pub fn new(endpoint: &str, secret: impl AsRef<[u8]>) -> BackendResult<Self> {
        let endpoint =
            Url::parse(endpoint).map_err(|err| BackendError::InvalidEndpoint(err.to_string()))?;
        if endpoint.cannot_be_a_base() {
            return Err(BackendError::InvalidEndpoint(endpoint.to_string()));
        }
        let keyed = HmacSha256::new_from_slice(secret.as_ref())
            .map_err(|err| BackendError::InvalidSecret(err.to_string()))?;
        Ok(Self { endpoint, keyed })
    }

    pub fn sign(
        &self,
        bucket: &str,
        key: &str,
        ttl: Duration,
        response_params: &BTreeMap<String, String>,
    ) -> BackendResult<String> {
        let expires = Utc::now().timestamp() + ttl.as_secs() as i64;
        self.sign_until(bucket, key, expires, response_params)
    }

    fn sign_until(
        &self,
        bucket: &str,
        key: &str,
        expires: i64,
        response_params: &BTreeMap<String, String>,
    ) -> BackendResult<String> {
        let params: BTreeMap<String, String> = response_params
            .iter()
            .filter(|(name, _)| name.starts_with("response-"))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();

        let mut url = self.endpoint.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| BackendError::InvalidEndpoint(self.endpoint.to_string()))?;
            segments.pop_if_empty().push("blobs").push(bucket);
            segments.extend(key.split('/'));
        }
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("expires", &expires.to_string());
            for (name, value) in &params {
                query.append_pair(name, value);
            }
            query.append_pair(
                "signature",
                &URL_SAFE_NO_PAD.encode(self.mac(bucket, key, expires, &params).finalize().into_bytes()),
            );
        }
        Ok(url.to_string())
    }

    /// Check the query of a redeemed URL and return the headers it asks for.
    pub fn verify(
        &self,
        bucket: &str,
        key: &str,
        query: &HashMap<String, String>,
    ) -> Result<ResponseOverrides, PresignError> {
        let expires = query
            .get("expires")
            .ok_or(PresignError::Missing("expires"))?
            .parse::<i64>()
            .map_err(|_| PresignError::MalformedExpiry)?;
        let provided = query
            .get("signature")
            .ok_or(PresignError::Missing("signature"))?;

        let params: BTreeMap<String, String> = query
            .iter()
            .filter(|(name, _)| name.starts_with("response-"))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        let provided = URL_SAFE_NO_PAD
            .decode(provided)
            .map_err(|_| PresignError::BadSignature)?;
        self.mac(bucket, key, expires, &params)
            .verify_slice(&provided)
            .map_err(|_| PresignError::BadSignature)?;
        if expires < Utc::now().timestamp() {
            return Err(PresignError::Expired);
        }

        Ok(ResponseOverrides {
            content_type: params.get(PARAM_CONTENT_TYPE).cloned(),
            content_disposition: params.get(PARAM_CONTENT_DISPOSITION).cloned(),
        })
    }

    fn mac(
        &self,
        bucket: &str,
        key: &str,
        expires: i64,
        params: &BTreeMap<String, String>,
    ) -> HmacSha256 {
        let mut mac = self.keyed.clone();
        mac.update(canonical_request(bucket, key, expires, params).as_bytes());
        mac
    }
}

/// Newline-joined fields covered by the signature.
fn canonical_request(
    bucket: &str,
    key: &str,
    expires: i64,
    params: &BTreeMap<String, String>,
) -> String {
    let mut canonical = format!("{bucket}\n{key}\n{expires}");
    for (name, value) in params {
        canonical.push('\n');
        canonical.push_str(name);
        canonical.push('=');
        canonical.push_str(value);
    }
    canonical
}

impl std::fmt::Debug for PresignSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PresignSigner")
            .field("endpoint", &self.endpoint.as_str())
            .finish_non_exhaustive()
    }
}
