//! Page cache middleware.
//!
//! Builds a [`RequestContext`] from the axum request, records the access,
//! applies the optional access ceiling, and runs the downstream handler as the origin. Handlers can
//! veto storage through the [`SkipCache`] extension.

use std::{net::SocketAddr, sync::Arc};

use axum::{
    body::{Body, HttpBody},
    extract::{ConnectInfo, State},
    http::{
        HeaderMap, HeaderValue, Request, StatusCode,
        header::{CONTENT_LENGTH, CONTENT_TYPE, HOST, LOCATION, RETRY_AFTER},
        request::Parts,
    },
    middleware::Next,
    response::{IntoResponse, Response},
};
use http_body_util::BodyExt;
use metrics::counter;
use tracing::{debug, instrument, warn};

use super::{
    access::AccessRateLimiter,
    config::RateLimitConfig,
    context::RequestContext,
    engine::{OriginOutput, Outcome, PageCache, SkipCache},
};

pub(crate) const METRIC_RATE_LIMITED: &str = "pagecache_rate_limited_total";

/// Response header reporting how the cache handled the request.
pub const CACHE_STATUS_HEADER: &str = "x-page-cache";

const FORM_BODY_LIMIT: usize = 1024 * 1024;
const FORWARDED_PROTO: &str = "x-forwarded-proto";
const FALLBACK_HOST: &str = "localhost";

/// Shared state for the cache middleware.
#[derive(Clone)]
pub struct CacheState {
    pub cache: Arc<PageCache>,
    pub limiter: AccessRateLimiter,
    pub rate_limit: RateLimitConfig,
}

impl CacheState {
    pub fn new(cache: PageCache, rate_limit: RateLimitConfig) -> Self {
        let limiter = AccessRateLimiter::new(cache.store().clone());
        Self {
            cache: Arc::new(cache),
            limiter,
            rate_limit,
        }
    }
}

/// Middleware serving cached pages and storing fresh ones.
#[instrument(skip_all, fields(path = %request.uri().path()))]
pub async fn page_cache_layer(
    State(state): State<CacheState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let (ctx, request) = match build_context(&state, request).await {
        Ok(built) => built,
        Err(response) => return response,
    };

    if state.rate_limit.enabled {
        let decision = state
            .limiter
            .check(
                &ctx,
                state.rate_limit.window_seconds,
                state.rate_limit.max_requests,
            )
            .await;
        if !decision.allowed {
            counter!(METRIC_RATE_LIMITED).increment(1);
            warn!(
                client_ip = %ctx.client_ip(),
                recent = decision.recent,
                "rejecting request over access ceiling"
            );
            return too_many_requests(state.rate_limit.window_seconds);
        }
    } else {
        state.limiter.log_access(&ctx).await;
    }

    let dimensions = vary_dimensions(&state.cache.config().vary_headers, &ctx);
    let outcome = state
        .cache
        .handle(&ctx, &dimensions, |skip: SkipCache| async move {
            let mut request = request;
            request.extensions_mut().insert(skip);
            buffer_response(next.run(request).await).await
        })
        .await;

    match outcome {
        Ok(outcome) => render_outcome(outcome),
        Err(response) => response,
    }
}

async fn build_context(
    state: &CacheState,
    request: Request<Body>,
) -> Result<(RequestContext, Request<Body>), Response> {
    let (parts, body) = request.into_parts();

    let (body, form, unparsed) = match form_kind(&parts.headers) {
        None => (body, None, false),
        Some(FormKind::Multipart) => (body, None, true),
        Some(FormKind::UrlEncoded) => match declared_length(&parts.headers, &body) {
            Some(length) if length <= FORM_BODY_LIMIT => {
                let bytes = axum::body::to_bytes(body, FORM_BODY_LIMIT)
                    .await
                    .map_err(|err| {
                        debug!(error = %err, "failed to buffer form body");
                        StatusCode::BAD_REQUEST.into_response()
                    })?;
                let form = String::from_utf8_lossy(&bytes).into_owned();
                (Body::from(bytes), Some(form), false)
            }
            length => {
                debug!(?length, "form body not buffered, passing through");
                (body, None, true)
            }
        },
    };

    let ctx = context_from_parts(state, &parts, form.as_deref(), unparsed);
    Ok((ctx, Request::from_parts(parts, body)))
}

fn context_from_parts(
    state: &CacheState,
    parts: &Parts,
    form: Option<&str>,
    unparsed: bool,
) -> RequestContext {
    let config = state.cache.config();
    let host = parts
        .headers
        .get(HOST)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .or_else(|| parts.uri.authority().map(|authority| authority.to_string()))
        .unwrap_or_else(|| FALLBACK_HOST.to_string());

    let https = parts.uri.scheme_str() == Some("https")
        || parts
            .headers
            .get(FORWARDED_PROTO)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|proto| proto.eq_ignore_ascii_case("https"));

    let remote_addr = parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());

    let country = parts
        .headers
        .get(config.country_header.as_str())
        .and_then(|value| value.to_str().ok());

    let mut builder = RequestContext::builder(host, parts.uri.path())
        .method(parts.method.clone())
        .query(parts.uri.query().unwrap_or(""))
        .https(https)
        .remote_addr(remote_addr)
        .country(country)
        .unparsed_body(unparsed)
        .headers(parts.headers.clone());
    if let Some(form) = form {
        builder = builder.form_body(form);
    }
    builder.build()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FormKind {
    UrlEncoded,
    Multipart,
}

fn form_kind(headers: &HeaderMap) -> Option<FormKind> {
    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())?
        .trim_start()
        .to_ascii_lowercase();
    if content_type.starts_with("application/x-www-form-urlencoded") {
        Some(FormKind::UrlEncoded)
    } else if content_type.starts_with("multipart/") {
        Some(FormKind::Multipart)
    } else {
        None
    }
}

/// Body length from `Content-Length`, else from the body's exact size hint.
fn declared_length(headers: &HeaderMap, body: &Body) -> Option<usize> {
    headers
        .get(CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .or_else(|| body.size_hint().exact())
        .map(|length| usize::try_from(length).unwrap_or(usize::MAX))
}

/// Key dimensions taken from the configured headers, sanitized for use in a
/// filename.
fn vary_dimensions(headers: &[String], ctx: &RequestContext) -> Vec<String> {
    headers
        .iter()
        .map(|name| {
            let value = ctx.header(name).unwrap_or("none");
            value
                .chars()
                .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
                .collect()
        })
        .collect()
}

async fn buffer_response(response: Response) -> Result<OriginOutput, Response> {
    let (parts, body) = response.into_parts();
    match body.collect().await {
        Ok(collected) => Ok(OriginOutput::new(
            parts.status,
            parts.headers,
            collected.to_bytes(),
        )),
        Err(err) => {
            warn!(error = %err, "failed to buffer origin response");
            Err(StatusCode::INTERNAL_SERVER_ERROR.into_response())
        }
    }
}

fn render_outcome(outcome: Outcome) -> Response {
    let label = outcome.label();
    let mut response = match outcome {
        Outcome::RedirectHttps { location } => redirect(StatusCode::MOVED_PERMANENTLY, &location),
        Outcome::MediaPlaceholder { location } => redirect(StatusCode::FOUND, &location),
        Outcome::Hit { body, .. } => {
            let mut response = Response::new(Body::from(body));
            response.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_static("text/html; charset=utf-8"),
            );
            response
        }
        Outcome::Bypass(output) | Outcome::Miss { output, .. } => {
            let mut response = Response::new(Body::from(output.body));
            *response.status_mut() = output.status;
            *response.headers_mut() = output.headers;
            response
        }
    };
    response
        .headers_mut()
        .insert(CACHE_STATUS_HEADER, HeaderValue::from_static(label));
    response
}

fn redirect(status: StatusCode, location: &str) -> Response {
    match HeaderValue::from_str(location) {
        Ok(value) => (status, [(LOCATION, value)]).into_response(),
        Err(_) => {
            warn!(location, "redirect target is not a valid header value");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

fn too_many_requests(window_seconds: u64) -> Response {
    let retry_after = HeaderValue::from(window_seconds.max(1));
    (StatusCode::TOO_MANY_REQUESTS, [(RETRY_AFTER, retry_after)]).into_response()
}
