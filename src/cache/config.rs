//! Cache configuration.
//!
//! Controls the page cache and access ceiling via the `[cache]` and
//! `[rate_limit]` sections of `pagecache.toml`.

use std::{path::PathBuf, time::Duration};

use serde::Deserialize;

const DEFAULT_ROOT: &str = "cache";
const DEFAULT_MAX_AGE_SECS: u64 = 60 * 60 * 24;
const DEFAULT_COUNTRY_HEADER: &str = "cf-ipcountry";
const DEFAULT_PLACEHOLDER_URL: &str = "/assets/images/noimg.jpg";
const DEFAULT_SPECIAL_COUNTRIES: [&str; 2] = ["CN", "NL"];
const DEFAULT_IGNORED_PARAMS: [&str; 2] = ["_pjax", "_"];
const DEFAULT_RATE_WINDOW_SECS: u64 = 5;
const DEFAULT_RATE_MAX_REQUESTS: u64 = 50;

/// Page cache configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Directory holding every cache entry.
    pub root: PathBuf,
    /// Lifetime of stored pages.
    pub max_age_seconds: u64,
    /// Path substrings that are never cached.
    pub ignore_paths: Vec<String>,
    /// Parameters that do not disqualify a request from caching.
    pub ignored_params: Vec<String>,
    /// Countries that get their own key bucket; all others share `WORLD`.
    pub special_countries: Vec<String>,
    /// Trusted header carrying the visitor's country code.
    pub country_header: String,
    /// Headers whose values become extra key dimensions, in order.
    pub vary_headers: Vec<String>,
    /// Serve plain HTTP instead of redirecting to HTTPS.
    pub permissive: bool,
    /// Host substrings that switch a request into permissive mode.
    pub permissive_host_markers: Vec<String>,
    /// Redirect target for image requests that reach the cache.
    pub placeholder_url: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(DEFAULT_ROOT),
            max_age_seconds: DEFAULT_MAX_AGE_SECS,
            ignore_paths: Vec::new(),
            ignored_params: DEFAULT_IGNORED_PARAMS.map(String::from).to_vec(),
            special_countries: DEFAULT_SPECIAL_COUNTRIES.map(String::from).to_vec(),
            country_header: DEFAULT_COUNTRY_HEADER.to_string(),
            vary_headers: Vec::new(),
            permissive: false,
            permissive_host_markers: Vec::new(),
            placeholder_url: DEFAULT_PLACEHOLDER_URL.to_string(),
        }
    }
}

impl CacheConfig {
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_seconds)
    }

    /// Returns true when HTTPS enforcement is off for `host`.
    pub fn is_permissive(&self, host: &str) -> bool {
        self.permissive
            || self
                .permissive_host_markers
                .iter()
                .any(|marker| !marker.is_empty() && host.contains(marker.as_str()))
    }
}

/// Access ceiling enforced in front of the cache.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub window_seconds: u64,
    pub max_requests: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            window_seconds: DEFAULT_RATE_WINDOW_SECS,
            max_requests: DEFAULT_RATE_MAX_REQUESTS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let config = CacheConfig::default();
        assert_eq!(config.root, PathBuf::from("cache"));
        assert_eq!(config.max_age(), Duration::from_secs(86_400));
        assert_eq!(config.ignored_params, vec!["_pjax", "_"]);
        assert_eq!(config.special_countries, vec!["CN", "NL"]);
        assert_eq!(config.country_header, "cf-ipcountry");
        assert!(!config.permissive);
    }

    #[test]
    fn permissive_by_host_marker() {
        let config = CacheConfig {
            permissive_host_markers: vec![".io".to_string()],
            ..Default::default()
        };
        assert!(config.is_permissive("staging.example.io"));
        assert!(!config.is_permissive("example.com"));
    }

    #[test]
    fn empty_marker_never_matches() {
        let config = CacheConfig {
            permissive_host_markers: vec![String::new()],
            ..Default::default()
        };
        assert!(!config.is_permissive("example.com"));
    }

    #[test]
    fn rate_limit_disabled_by_default() {
        let config = RateLimitConfig::default();
        assert!(!config.enabled);
        assert_eq!(config.window_seconds, 5);
        assert_eq!(config.max_requests, 50);
    }
}
