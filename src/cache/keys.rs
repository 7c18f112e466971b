//! Cache key derivation.
//!
//! A key is `sha256(full_url)-BUCKET-dim1-dim2...`. Identical URLs, buckets and
//! dimensions always produce identical keys; no URL normalization is applied.

use std::fmt;

use sha2::{Digest, Sha256};

use super::context::RequestContext;

/// Bucket shared by every country without its own variant.
pub const WORLD_BUCKET: &str = "WORLD";

/// Deterministic identifier of one cached page variant.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Derives cache keys from request context and variant dimensions.
#[derive(Debug, Clone)]
pub struct KeyBuilder {
    special_countries: Vec<String>,
}

impl KeyBuilder {
    pub fn new<I, S>(special_countries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            special_countries: special_countries
                .into_iter()
                .map(|code| code.as_ref().to_ascii_uppercase())
                .collect(),
        }
    }

    /// Maps a country code onto a bounded set of buckets.
    pub fn country_bucket<'a>(&self, country: &'a str) -> &'a str {
        if self
            .special_countries
            .iter()
            .any(|code| code.eq_ignore_ascii_case(country))
        {
            country
        } else {
            WORLD_BUCKET
        }
    }

    pub fn build_key<S: AsRef<str>>(&self, ctx: &RequestContext, dimensions: &[S]) -> CacheKey {
        let digest = hash_url(&ctx.full_url());
        let bucket = self.country_bucket(ctx.country());
        let dims = dimensions
            .iter()
            .map(AsRef::as_ref)
            .collect::<Vec<_>>()
            .join("-");
        CacheKey(format!("{digest}-{bucket}-{dims}"))
    }
}

/// Lowercase hex SHA-256 of a URL.
pub fn hash_url(url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    hex::encode(hasher.finalize())
}
