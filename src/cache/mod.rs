//! Pagecache core
//!
//! A filesystem-backed full-page response cache:
//!
//! - **Store**: raw pages with TTL freshness, expiring JSON entries, append-only logs
//! - **Keys**: `sha256(url)-BUCKET-dims`, varying by country bucket and named dimensions
//! - **Policy**: ignore paths, query/body parameters, media misses, skip-cache veto
//! - **Engine**: HTTPS enforcement, hit/miss dispatch, origin validation, storage
//! - **Access**: sliding-window per-client request counts over the append log
//!
//! ## Configuration
//!
//! ```toml
//! [cache]
//! root = "cache"
//! max_age_seconds = 86400
//! ignore_paths = ["/contact-us/", "/account"]
//! special_countries = ["CN", "NL"]
//! # ... see config.rs for all options
//! ```

mod access;
mod config;
mod context;
mod engine;
mod error;
mod keys;
mod middleware;
mod policy;
mod store;

pub use access::{ACCESS_LOG_KEY, AccessDecision, AccessRateLimiter};
pub use config::{CacheConfig, RateLimitConfig};
pub use context::{
    DEFAULT_COUNTRY, RequestContext, RequestContextBuilder, UNKNOWN_CLIENT, country_from_header,
};
pub use engine::{OriginOutput, Outcome, PageCache, SkipCache, Stored};
pub use error::CacheError;
pub use keys::{CacheKey, KeyBuilder, WORLD_BUCKET, hash_url};
pub use middleware::{CACHE_STATUS_HEADER, CacheState, page_cache_layer};
pub use policy::{EligibilityPolicy, is_media_miss};
pub use store::{CacheStore, collapse_whitespace};
