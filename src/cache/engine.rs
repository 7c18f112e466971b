//! Request handling for the page cache.
//!
//! A request moves through HTTPS enforcement, the media-miss check, the
//! eligibility gate, the cache lookup and, on a miss, origin rendering followed
//! by validation and storage. Every branch ends in an [`Outcome`].

use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use axum::http::{HeaderMap, StatusCode};
use bytes::Bytes;
use metrics::counter;
use tracing::{debug, instrument, warn};

use super::{
    config::CacheConfig,
    context::RequestContext,
    error::CacheError,
    keys::{CacheKey, KeyBuilder},
    policy::{EligibilityPolicy, is_media_miss},
    store::CacheStore,
};

pub(crate) const METRIC_HIT: &str = "pagecache_hit_total";
pub(crate) const METRIC_MISS: &str = "pagecache_miss_total";
pub(crate) const METRIC_BYPASS: &str = "pagecache_bypass_total";
pub(crate) const METRIC_STORE_FAILED: &str = "pagecache_store_failed_total";

const DOCUMENT_MARKER: &[u8] = b"<html";
const ERROR_MARKER: &[u8] = b"error404";

/// Request-local veto on storing the response being rendered.
///
/// Clones share the same flag; a fresh handle is created for every request.
#[derive(Debug, Clone, Default)]
pub struct SkipCache(Arc<AtomicBool>);

impl SkipCache {
    pub fn skip(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Fully buffered origin response.
#[derive(Debug, Clone)]
pub struct OriginOutput {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl OriginOutput {
    pub fn new(status: StatusCode, headers: HeaderMap, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers,
            body: body.into(),
        }
    }

    /// A 200 response without headers.
    pub fn ok(body: impl Into<Bytes>) -> Self {
        Self::new(StatusCode::OK, HeaderMap::new(), body)
    }
}

/// What happened to a freshly rendered page.
#[derive(Debug)]
pub enum Stored {
    Yes,
    /// Validation refused the output.
    Rejected(&'static str),
    /// Validation passed but persistence failed.
    Failed(CacheError),
}

/// Terminal state of one request.
#[derive(Debug)]
pub enum Outcome {
    /// Plain HTTP outside permissive mode; permanent redirect.
    RedirectHttps { location: String },
    /// Image request reaching the cache; redirect to the placeholder.
    MediaPlaceholder { location: String },
    /// Not cacheable; the origin output is returned untouched.
    Bypass(OriginOutput),
    /// Fresh stored page.
    Hit { key: CacheKey, body: Bytes },
    /// Rendered by the origin after a lookup miss.
    Miss {
        key: CacheKey,
        output: OriginOutput,
        stored: Stored,
    },
}

impl Outcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::RedirectHttps { .. } => "redirect_https",
            Self::MediaPlaceholder { .. } => "media_placeholder",
            Self::Bypass(_) => "bypass",
            Self::Hit { .. } => "hit",
            Self::Miss { .. } => "miss",
        }
    }
}

/// The page cache: ties the store, key derivation and eligibility together.
#[derive(Debug, Clone)]
pub struct PageCache {
    config: CacheConfig,
    store: CacheStore,
    keys: KeyBuilder,
    policy: EligibilityPolicy,
}

impl PageCache {
    pub fn new(config: CacheConfig) -> Self {
        let store = CacheStore::new(config.root.clone());
        let keys = KeyBuilder::new(&config.special_countries);
        let policy =
            EligibilityPolicy::new(config.ignore_paths.clone(), config.ignored_params.clone());
        Self {
            config,
            store,
            keys,
            policy,
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    pub fn keys(&self) -> &KeyBuilder {
        &self.keys
    }

    /// Handles one request, invoking `origin` only when the cache cannot answer.
    ///
    /// Origin errors are returned as-is and nothing is stored; storage errors
    /// never fail the request.
    #[instrument(skip_all, fields(path = %ctx.path()))]
    pub async fn handle<S, F, Fut, E>(
        &self,
        ctx: &RequestContext,
        dimensions: &[S],
        origin: F,
    ) -> Result<Outcome, E>
    where
        S: AsRef<str>,
        F: FnOnce(SkipCache) -> Fut,
        Fut: Future<Output = Result<OriginOutput, E>>,
    {
        if !ctx.is_https() && !self.config.is_permissive(ctx.host()) {
            debug!(cache = "page", outcome = "redirect_https", "enforcing https");
            return Ok(Outcome::RedirectHttps {
                location: ctx.https_url(),
            });
        }

        if is_media_miss(ctx.path()) {
            debug!(cache = "page", outcome = "media_placeholder", "image miss");
            return Ok(Outcome::MediaPlaceholder {
                location: self.config.placeholder_url.clone(),
            });
        }

        let skip = SkipCache::default();
        if !self.policy.is_cacheable(ctx, skip.is_set()) {
            debug!(cache = "page", outcome = "bypass", "request not cacheable");
            counter!(METRIC_BYPASS).increment(1);
            let output = origin(skip).await?;
            return Ok(Outcome::Bypass(output));
        }

        let key = self.keys.build_key(ctx, dimensions);
        if let Some(body) = self.store.get(key.as_str(), self.config.max_age()).await {
            debug!(cache = "page", outcome = "hit", key = %key, "serving cached page");
            counter!(METRIC_HIT).increment(1);
            return Ok(Outcome::Hit { key, body });
        }

        debug!(cache = "page", outcome = "miss", key = %key, "rendering via origin");
        counter!(METRIC_MISS).increment(1);
        let output = origin(skip.clone()).await?;

        let stored = match validate(&output, &skip) {
            Err(reason) => {
                debug!(cache = "page", key = %key, reason, "not storing rendered page");
                Stored::Rejected(reason)
            }
            Ok(()) => match self.store.set(key.as_str(), &output.body).await {
                Ok(()) => Stored::Yes,
                Err(err) => {
                    warn!(
                        cache = "page",
                        key = %key,
                        kind = err.kind(),
                        error = %err,
                        "failed to store rendered page"
                    );
                    counter!(METRIC_STORE_FAILED, "kind" => err.kind()).increment(1);
                    Stored::Failed(err)
                }
            },
        };

        Ok(Outcome::Miss {
            key,
            output,
            stored,
        })
    }
}

fn validate(output: &OriginOutput, skip: &SkipCache) -> Result<(), &'static str> {
    if skip.is_set() {
        return Err("skip_requested");
    }
    if output.status != StatusCode::OK {
        return Err("non_ok_status");
    }
    if !contains(&output.body, DOCUMENT_MARKER) {
        return Err("not_a_document");
    }
    if contains(&output.body, ERROR_MARKER) {
        return Err("error_page");
    }
    Ok(())
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack
        .windows(needle.len())
        .any(|window| window == needle)
}
