//! Outbound HTTP for remote downloads, guarded against requests into
//! private networks.

use crate::backend::ByteStream;
use async_trait::async_trait;
use futures::TryStreamExt;
use reqwest::{StatusCode, header, redirect};
use std::{
    io,
    net::{IpAddr, Ipv6Addr},
    sync::Arc,
    time::Duration,
};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

pub const MAX_REDIRECTS: usize = 10;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("{0}")]
    Forbidden(&'static str),

    #[error("host not resolvable")]
    Unresolvable,

    #[error("bad status: {status}")]
    HttpStatus { status: StatusCode },

    #[error("unknown content length")]
    UnknownLength,

    #[error("content too large: {size} bytes exceeds {limit}")]
    TooLarge { size: u64, limit: u64 },

    #[error("stopped after {} redirects", MAX_REDIRECTS)]
    TooManyRedirects,

    #[error("fetch cancelled")]
    Cancelled,

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

#[derive(Clone, Debug, Default)]
pub struct FetchPolicy {
    pub allow_private: bool,
    /// Exact host names, or `.suffix` entries. Empty allows every host.
    pub allowed_hosts: Vec<String>,
    /// 0 disables the size cap.
    pub max_bytes: u64,
    pub timeout: Duration,
}

pub struct FetchedBody {
    pub url: Url,
    pub content_length: Option<u64>,
    pub content_type: Option<String>,
    pub body: ByteStream,
}

impl std::fmt::Debug for FetchedBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchedBody")
            .field("url", &self.url.as_str())
            .field("content_length", &self.content_length)
            .field("content_type", &self.content_type)
            .finish_non_exhaustive()
    }
}

/// Host name resolution used by the private network guard.
#[async_trait]
pub trait HostResolver: Send + Sync {
    async fn resolve(&self, host: &str, port: u16) -> io::Result<Vec<IpAddr>>;
}

/// Resolves through the system resolver.
pub struct SystemResolver;

#[async_trait]
impl HostResolver for SystemResolver {
    async fn resolve(&self, host: &str, port: u16) -> io::Result<Vec<IpAddr>> {
        Ok(tokio::net::lookup_host((host, port))
            .await?
            .map(|addr| addr.ip())
            .collect())
    }
}

pub struct RemoteFetcher {
    client: reqwest::Client,
    policy: FetchPolicy,
    resolver: Arc<dyn HostResolver>,
}

fn host_allowed(host: &str, allowed: &[String]) -> bool {
    if allowed.is_empty() {
        return true;
    }
    let host = host.trim().to_ascii_lowercase();
    allowed.iter().any(|entry| {
        let entry = entry.trim().to_ascii_lowercase();
        if entry.is_empty() {
            false
        } else if entry.starts_with('.') {
            host.ends_with(&entry)
        } else {
            host == entry
        }
    })
}

fn is_local_hostname(host: &str) -> bool {
    let host = host.trim().to_ascii_lowercase();
    host == "localhost" || host == "localhost.localdomain" || host.ends_with(".local")
}

fn is_unique_local(ip: &Ipv6Addr) -> bool {
    (ip.segments()[0] & 0xfe00) == 0xfc00
}

fn is_unicast_link_local(ip: &Ipv6Addr) -> bool {
    (ip.segments()[0] & 0xffc0) == 0xfe80
}

pub fn is_blocked_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_multicast()
                || v4.is_unspecified()
                || v4.is_broadcast()
        }
        IpAddr::V6(v6) => {
            if let Some(mapped) = v6.to_ipv4_mapped() {
                return is_blocked_ip(IpAddr::V4(mapped));
            }
            v6.is_loopback()
                || v6.is_multicast()
                || v6.is_unspecified()
                || is_unique_local(&v6)
                || is_unicast_link_local(&v6)
        }
    }
}

/// Reject a host unless it resolved to at least one address and none of
/// them is private.
pub fn check_resolved(addrs: &[IpAddr]) -> Result<(), FetchError> {
    if addrs.is_empty() {
        return Err(FetchError::Unresolvable);
    }
    if addrs.iter().any(|ip| is_blocked_ip(*ip)) {
        return Err(FetchError::Forbidden("ip not allowed"));
    }
    Ok(())
}

impl RemoteFetcher {
    pub fn new(policy: FetchPolicy) -> Result<Self, FetchError> {
        Self::with_resolver(policy, Arc::new(SystemResolver))
    }

    pub fn with_resolver(
        policy: FetchPolicy,
        resolver: Arc<dyn HostResolver>,
    ) -> Result<Self, FetchError> {
        let mut builder = reqwest::Client::builder().redirect(redirect::Policy::none());
        if !policy.timeout.is_zero() {
            builder = builder.timeout(policy.timeout);
        }
        Ok(Self {
            client: builder.build()?,
            policy,
            resolver,
        })
    }

    pub fn policy(&self) -> &FetchPolicy {
        &self.policy
    }

    /// Parse `raw` and check it against the scheme, host allow-list and
    /// private network rules.
    pub async fn validate_url(&self, raw: &str) -> Result<Url, FetchError> {
        let url = Url::parse(raw.trim()).map_err(|err| FetchError::InvalidUrl(err.to_string()))?;
        self.validate(url).await
    }

    async fn validate(&self, url: Url) -> Result<Url, FetchError> {
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(FetchError::Forbidden("unsupported scheme"));
        }
        let host = match url.host_str() {
            Some(host) if !host.is_empty() => host.to_string(),
            _ => return Err(FetchError::Forbidden("missing host")),
        };
        // IPv6 literals come back bracketed
        let bare = host.trim_start_matches('[').trim_end_matches(']');

        if !host_allowed(bare, &self.policy.allowed_hosts) {
            return Err(FetchError::Forbidden("host not allowed"));
        }
        if self.policy.allow_private {
            return Ok(url);
        }
        if is_local_hostname(bare) {
            return Err(FetchError::Forbidden("host not allowed"));
        }
        if let Ok(ip) = bare.parse::<IpAddr>() {
            if is_blocked_ip(ip) {
                return Err(FetchError::Forbidden("ip not allowed"));
            }
            return Ok(url);
        }

        let port = url.port_or_known_default().unwrap_or(80);
        let addrs = self
            .resolver
            .resolve(bare, port)
            .await
            .map_err(|_| FetchError::Unresolvable)?;
        check_resolved(&addrs)?;
        Ok(url)
    }

    /// GET `raw`, following up to [`MAX_REDIRECTS`] redirects with every hop
    /// re-validated. Only a 200 response is returned.
    pub async fn fetch(&self, raw: &str, cancel: &CancellationToken) -> Result<FetchedBody, FetchError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(FetchError::Cancelled),
            fetched = self.fetch_inner(raw) => fetched,
        }
    }

    async fn fetch_inner(&self, raw: &str) -> Result<FetchedBody, FetchError> {
        let mut url = self.validate_url(raw).await?;

        for _ in 0..=MAX_REDIRECTS {
            let response = self.client.get(url.clone()).send().await?;
            let status = response.status();

            if status.is_redirection() {
                let location = response
                    .headers()
                    .get(header::LOCATION)
                    .and_then(|value| value.to_str().ok())
                    .ok_or_else(|| FetchError::InvalidUrl("redirect without location".into()))?;
                let next = url
                    .join(location)
                    .map_err(|err| FetchError::InvalidUrl(err.to_string()))?;
                debug!(from = %url, to = %next, "following redirect");
                url = self.validate(next).await?;
                continue;
            }

            if status != StatusCode::OK {
                return Err(FetchError::HttpStatus { status });
            }

            let content_length = response.content_length();
            if self.policy.max_bytes > 0 {
                match content_length {
                    None => return Err(FetchError::UnknownLength),
                    Some(size) if size > self.policy.max_bytes => {
                        return Err(FetchError::TooLarge {
                            size,
                            limit: self.policy.max_bytes,
                        });
                    }
                    Some(_) => {}
                }
            }
            let content_type = response
                .headers()
                .get(header::CONTENT_TYPE)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string);

            return Ok(FetchedBody {
                url,
                content_length,
                content_type,
                body: Box::pin(response.bytes_stream().map_err(io::Error::other)),
            });
        }
        Err(FetchError::TooManyRedirects)
    }
}
