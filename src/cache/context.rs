//! Per-request snapshot handed to every cache component.
//!
//! Built once at the transport boundary and never mutated afterwards. The
//! cache core reads request facts only through this type.

use std::{collections::BTreeMap, net::IpAddr};

use axum::http::{HeaderMap, Method};

/// Country reported when the geolocation header is absent or unusable.
pub const DEFAULT_COUNTRY: &str = "US";
/// Client address reported when nothing better can be determined.
pub const UNKNOWN_CLIENT: &str = "unknown";

const FORWARDED_FOR: &str = "x-forwarded-for";
const CLIENT_IP: &str = "client-ip";

/// Immutable facts about one inbound request.
#[derive(Debug, Clone)]
pub struct RequestContext {
    method: Method,
    host: String,
    path: String,
    query: String,
    query_params: Vec<(String, String)>,
    body_params: Vec<(String, String)>,
    unparsed_body: bool,
    https: bool,
    remote_addr: Option<IpAddr>,
    headers: HeaderMap,
    country: String,
}

impl RequestContext {
    pub fn builder(host: impl Into<String>, path: impl Into<String>) -> RequestContextBuilder {
        RequestContextBuilder::new(host.into(), path.into())
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Raw query string without the leading `?`.
    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn is_https(&self) -> bool {
        self.https
    }

    /// Two-letter country code of the visitor.
    pub fn country(&self) -> &str {
        &self.country
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    /// Full URL as requested, with the query string reproduced verbatim.
    pub fn full_url(&self) -> String {
        let scheme = if self.https { "https" } else { "http" };
        self.url_with_scheme(scheme)
    }

    /// HTTPS equivalent of [`full_url`](Self::full_url).
    pub fn https_url(&self) -> String {
        self.url_with_scheme("https")
    }

    fn url_with_scheme(&self, scheme: &str) -> String {
        if self.query.is_empty() {
            format!("{scheme}://{}{}", self.host, self.path)
        } else {
            format!("{scheme}://{}{}?{}", self.host, self.path, self.query)
        }
    }

    /// Query parameters followed by body parameters; later keys win.
    pub fn merged_params(&self) -> BTreeMap<&str, &str> {
        self.query_params
            .iter()
            .chain(self.body_params.iter())
            .map(|(key, value)| (key.as_str(), value.as_str()))
            .collect()
    }

    /// True when the request carries form fields that were not parsed
    /// (multipart or oversized bodies); such requests never touch the cache.
    pub fn has_unparsed_body(&self) -> bool {
        self.unparsed_body
    }

    /// Resolves the requester's address.
    ///
    /// The directly observed peer wins; proxy headers are consulted only when
    /// no peer address is known.
    pub fn client_ip(&self) -> String {
        if let Some(addr) = self.remote_addr {
            return addr.to_string();
        }

        let forwarded = self
            .header(FORWARDED_FOR)
            .and_then(|chain| chain.split(',').next())
            .map(str::trim)
            .filter(|value| !value.is_empty());
        if let Some(addr) = forwarded {
            return addr.to_string();
        }

        self.header(CLIENT_IP)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or(UNKNOWN_CLIENT)
            .to_string()
    }
}

/// Normalizes a geolocation header value into a two-letter country code.
pub fn country_from_header(value: Option<&str>) -> String {
    value
        .map(str::trim)
        .filter(|code| code.len() == 2 && code.bytes().all(|b| b.is_ascii_alphabetic()))
        .map(str::to_ascii_uppercase)
        .unwrap_or_else(|| DEFAULT_COUNTRY.to_string())
}

fn parse_params(encoded: &str) -> Vec<(String, String)> {
    url::form_urlencoded::parse(encoded.as_bytes())
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect()
}

#[derive(Debug)]
pub struct RequestContextBuilder {
    inner: RequestContext,
}

impl RequestContextBuilder {
    fn new(host: String, path: String) -> Self {
        Self {
            inner: RequestContext {
                method: Method::GET,
                host,
                path,
                query: String::new(),
                query_params: Vec::new(),
                body_params: Vec::new(),
                unparsed_body: false,
                https: false,
                remote_addr: None,
                headers: HeaderMap::new(),
                country: DEFAULT_COUNTRY.to_string(),
            },
        }
    }

    pub fn method(mut self, method: Method) -> Self {
        self.inner.method = method;
        self
    }

    /// Sets the raw query string and parses its parameters.
    pub fn query(mut self, query: impl Into<String>) -> Self {
        let query = query.into();
        self.inner.query_params = parse_params(&query);
        self.inner.query = query;
        self
    }

    /// Parses an `application/x-www-form-urlencoded` body into parameters.
    pub fn form_body(mut self, body: &str) -> Self {
        self.inner.body_params = parse_params(body);
        self
    }

    /// Marks the body as carrying fields that were not parsed.
    pub fn unparsed_body(mut self, unparsed: bool) -> Self {
        self.inner.unparsed_body = unparsed;
        self
    }

    pub fn https(mut self, https: bool) -> Self {
        self.inner.https = https;
        self
    }

    pub fn remote_addr(mut self, addr: Option<IpAddr>) -> Self {
        self.inner.remote_addr = addr;
        self
    }

    pub fn headers(mut self, headers: HeaderMap) -> Self {
        self.inner.headers = headers;
        self
    }

    pub fn country(mut self, code: Option<&str>) -> Self {
        self.inner.country = country_from_header(code);
        self
    }

    pub fn build(self) -> RequestContext {
        self.inner
    }
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    #[test]
    fn full_url_keeps_query_verbatim() {
        let ctx = RequestContext::builder("example.com", "/blog")
            .query("b=2&a=1")
            .https(true)
            .build();
        assert_eq!(ctx.full_url(), "https://example.com/blog?b=2&a=1");
    }

    #[test]
    fn https_url_upgrades_scheme() {
        let ctx = RequestContext::builder("example.com", "/blog").build();
        assert_eq!(ctx.full_url(), "http://example.com/blog");
        assert_eq!(ctx.https_url(), "https://example.com/blog");
    }

    #[test]
    fn merged_params_last_wins() {
        let ctx = RequestContext::builder("example.com", "/")
            .query("page=1&page=2")
            .form_body("page=3&q=rust")
            .build();
        let params = ctx.merged_params();
        assert_eq!(params.get("page"), Some(&"3"));
        assert_eq!(params.get("q"), Some(&"rust"));
    }

    #[test]
    fn client_ip_prefers_remote_addr() {
        let mut headers = HeaderMap::new();
        headers.insert(FORWARDED_FOR, HeaderValue::from_static("10.0.0.1"));
        let ctx = RequestContext::builder("example.com", "/")
            .headers(headers)
            .remote_addr(Some("192.0.2.7".parse().expect("ip")))
            .build();
        assert_eq!(ctx.client_ip(), "192.0.2.7");
    }

    #[test]
    fn client_ip_falls_back_to_forwarded_chain() {
        let mut headers = HeaderMap::new();
        headers.insert(
            FORWARDED_FOR,
            HeaderValue::from_static("203.0.113.9, 10.0.0.1"),
        );
        headers.insert(CLIENT_IP, HeaderValue::from_static("198.51.100.1"));
        let ctx = RequestContext::builder("example.com", "/")
            .headers(headers)
            .build();
        assert_eq!(ctx.client_ip(), "203.0.113.9");
    }

    #[test]
    fn client_ip_uses_placeholder_when_unknown() {
        let ctx = RequestContext::builder("example.com", "/").build();
        assert_eq!(ctx.client_ip(), UNKNOWN_CLIENT);
    }

    #[test]
    fn country_defaults_and_normalizes() {
        assert_eq!(country_from_header(None), "US");
        assert_eq!(country_from_header(Some("nl")), "NL");
        assert_eq!(country_from_header(Some("T1")), "US");
        assert_eq!(country_from_header(Some("")), "US");
    }
}
