//! Cache eligibility rules.

use super::context::RequestContext;

const MEDIA_SUFFIXES: [&str; 3] = [".jpg", ".png", ".gif"];

/// True when the path names an image; such requests reaching the cache are
/// treated as misses and redirected to a placeholder.
pub fn is_media_miss(path: &str) -> bool {
    MEDIA_SUFFIXES.iter().any(|suffix| path.ends_with(suffix))
}

/// Decides whether a request may be read from or written to the cache.
#[derive(Debug, Clone)]
pub struct EligibilityPolicy {
    ignore_paths: Vec<String>,
    ignored_params: Vec<String>,
}

impl EligibilityPolicy {
    pub fn new(ignore_paths: Vec<String>, ignored_params: Vec<String>) -> Self {
        Self {
            ignore_paths,
            ignored_params,
        }
    }

    pub fn is_cacheable(&self, ctx: &RequestContext, skip: bool) -> bool {
        if skip {
            return false;
        }

        let path = ctx.path();
        if self
            .ignore_paths
            .iter()
            .any(|fragment| path.contains(fragment.as_str()))
        {
            return false;
        }

        if ctx.has_unparsed_body() {
            return false;
        }

        let mut params = ctx.merged_params();
        for name in &self.ignored_params {
            params.remove(name.as_str());
        }
        if !params.is_empty() {
            return false;
        }

        !is_media_miss(path)
    }
}
