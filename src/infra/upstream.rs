//! HTTP origin: forwards requests to the configured upstream server.
//!
//! The upstream may veto caching of a response by sending the
//! [`SKIP_CACHE_HEADER`] response header; it is stripped before the response
//! leaves the proxy.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{
        HeaderMap, HeaderName, Request, StatusCode,
        header::{
            ACCEPT_ENCODING, CONNECTION, CONTENT_LENGTH, HOST, TE, TRAILER, TRANSFER_ENCODING,
            UPGRADE,
        },
    },
    response::{IntoResponse, Response},
};
use thiserror::Error;
use tracing::{instrument, warn};
use url::Url;

use crate::{
    cache::{CacheError, SkipCache},
    config::OriginSettings,
};

/// Response header an upstream sets to keep a page out of the cache.
pub const SKIP_CACHE_HEADER: &str = "x-page-cache-skip";

const REQUEST_BODY_LIMIT: usize = 10 * 1024 * 1024;
const HOP_BY_HOP: [HeaderName; 9] = [
    CONNECTION,
    CONTENT_LENGTH,
    HOST,
    HeaderName::from_static("keep-alive"),
    HeaderName::from_static("proxy-connection"),
    TE,
    TRAILER,
    TRANSFER_ENCODING,
    UPGRADE,
];

#[derive(Debug, Error)]
pub enum OriginError {
    #[error("failed to build upstream client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("invalid upstream url `{url}`: {source}")]
    Url {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("failed to read request body: {0}")]
    RequestBody(#[source] axum::Error),
    #[error("upstream request failed: {0}")]
    Upstream(#[source] reqwest::Error),
}

/// A response received from the upstream.
#[derive(Debug)]
pub struct Forwarded {
    pub response: Response,
    /// The upstream asked for this response not to be cached.
    pub skip_cache: bool,
}

#[derive(Debug, Clone)]
pub struct UpstreamOrigin {
    client: reqwest::Client,
    base: Url,
}

impl UpstreamOrigin {
    /// Builds the origin; fails when no upstream is configured.
    pub fn new(settings: &OriginSettings) -> Result<Self, CacheError> {
        let base = settings
            .upstream_url
            .clone()
            .ok_or_else(|| CacheError::configuration("`origin.upstream_url` is not set"))?;
        let client = reqwest::Client::builder()
            .timeout(settings.timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|err| CacheError::configuration(OriginError::Client(err).to_string()))?;
        Ok(Self { client, base })
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    /// Resolves the upstream URL for a request path and query.
    pub fn target(&self, path_and_query: &str) -> Result<Url, OriginError> {
        let joined = format!(
            "{}{}",
            self.base.as_str().trim_end_matches('/'),
            path_and_query
        );
        Url::parse(&joined).map_err(|source| OriginError::Url {
            url: joined,
            source,
        })
    }

    pub async fn forward(&self, request: Request<Body>) -> Result<Forwarded, OriginError> {
        let (parts, body) = request.into_parts();
        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|value| value.as_str())
            .unwrap_or("/");
        let target = self.target(path_and_query)?;

        // Pages are captured and stored as identity-encoded bytes.
        let mut headers = strip_hop_by_hop(parts.headers);
        headers.remove(ACCEPT_ENCODING);

        let body = axum::body::to_bytes(body, REQUEST_BODY_LIMIT)
            .await
            .map_err(OriginError::RequestBody)?;

        let upstream = self
            .client
            .request(parts.method, target)
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(OriginError::Upstream)?;

        let status = upstream.status();
        let mut headers = strip_hop_by_hop(upstream.headers().clone());
        let skip_cache = headers.remove(SKIP_CACHE_HEADER).is_some();
        let bytes = upstream.bytes().await.map_err(OriginError::Upstream)?;

        let mut response = Response::new(Body::from(bytes));
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        Ok(Forwarded {
            response,
            skip_cache,
        })
    }
}

fn strip_hop_by_hop(mut headers: HeaderMap) -> HeaderMap {
    for name in &HOP_BY_HOP {
        headers.remove(name);
    }
    headers
}

/// Fallback handler proxying every request to the upstream.
#[instrument(skip_all, fields(path = %request.uri().path()))]
pub async fn proxy(State(origin): State<Arc<UpstreamOrigin>>, request: Request<Body>) -> Response {
    let skip = request.extensions().get::<SkipCache>().cloned();
    match origin.forward(request).await {
        Ok(forwarded) => {
            if forwarded.skip_cache
                && let Some(skip) = skip
            {
                skip.skip();
            }
            forwarded.response
        }
        Err(err) => {
            warn!(error = %err, "origin request failed");
            StatusCode::BAD_GATEWAY.into_response()
        }
    }
}
