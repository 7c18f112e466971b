//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{
    net::SocketAddr,
    num::NonZeroU64,
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use axum::http::HeaderName;
use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use url::Url;

use crate::cache::{CacheConfig, RateLimitConfig};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "pagecache";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 3000;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;
const DEFAULT_ORIGIN_TIMEOUT_SECS: u64 = 30;
const DEFAULT_ACCESS_WINDOW_SECS: u64 = 5;

/// Command-line arguments for the pagecache binary.
#[derive(Debug, Parser)]
#[command(name = "pagecache", version, about = "Full-page HTTP response cache")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "PAGECACHE_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Serve cached pages in front of the configured origin.
    Serve(Box<ServeArgs>),
    /// Delete every cached entry, including the access log.
    Purge(PurgeArgs),
    /// Print how often an address accessed the site recently.
    #[command(name = "access-count")]
    AccessCount(AccessCountArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct CacheRootOverride {
    /// Override the cache root directory.
    #[arg(long = "cache-root", value_name = "PATH")]
    pub cache_root: Option<PathBuf>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    #[command(flatten)]
    pub cache: CacheRootOverride,

    /// Override the listener host.
    #[arg(long = "server-host", value_name = "HOST")]
    pub server_host: Option<String>,

    /// Override the listener port.
    #[arg(long = "server-port", value_name = "PORT")]
    pub server_port: Option<u16>,

    /// Override the graceful shutdown timeout.
    #[arg(long = "server-graceful-shutdown-seconds", value_name = "SECONDS")]
    pub server_graceful_shutdown_seconds: Option<u64>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Serve plain HTTP instead of redirecting to HTTPS.
    #[arg(
        long = "cache-permissive",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub cache_permissive: Option<bool>,

    /// Override the page lifetime.
    #[arg(long = "cache-max-age-seconds", value_name = "SECONDS")]
    pub cache_max_age_seconds: Option<u64>,

    /// Override the origin base URL.
    #[arg(long = "origin-url", value_name = "URL")]
    pub origin_url: Option<String>,

    /// Override the origin request timeout.
    #[arg(long = "origin-timeout-seconds", value_name = "SECONDS")]
    pub origin_timeout_seconds: Option<u64>,

    /// Toggle the per-client access ceiling.
    #[arg(
        long = "rate-limit-enabled",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub rate_limit_enabled: Option<bool>,

    /// Override the rate limit window size.
    #[arg(long = "rate-limit-window-seconds", value_name = "SECONDS")]
    pub rate_limit_window_seconds: Option<u64>,

    /// Override the rate limit request ceiling.
    #[arg(long = "rate-limit-max-requests", value_name = "COUNT")]
    pub rate_limit_max_requests: Option<u64>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct PurgeArgs {
    #[command(flatten)]
    pub cache: CacheRootOverride,
}

#[derive(Debug, Args, Clone)]
pub struct AccessCountArgs {
    #[command(flatten)]
    pub cache: CacheRootOverride,

    /// Client address to count.
    #[arg(long, value_name = "IP")]
    pub ip: String,

    /// Window size in seconds.
    #[arg(long, value_name = "SECONDS", default_value_t = DEFAULT_ACCESS_WINDOW_SECS)]
    pub window: u64,
}

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub cache: CacheConfig,
    pub origin: OriginSettings,
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub addr: SocketAddr,
    pub graceful_shutdown: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct OriginSettings {
    /// Base URL of the origin; `serve` refuses to start without it.
    pub upstream_url: Option<Url>,
    pub timeout: Duration,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix("PAGECACHE").separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        Some(Command::Purge(args)) => raw.apply_cache_root_override(&args.cache),
        Some(Command::AccessCount(args)) => raw.apply_cache_root_override(&args.cache),
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    cache: RawCacheSettings,
    origin: RawOriginSettings,
    rate_limit: RawRateLimitSettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(host) = overrides.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(port) = overrides.server_port {
            self.server.port = Some(port);
        }
        if let Some(seconds) = overrides.server_graceful_shutdown_seconds {
            self.server.graceful_shutdown_seconds = Some(seconds);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(permissive) = overrides.cache_permissive {
            self.cache.permissive = Some(permissive);
        }
        if let Some(seconds) = overrides.cache_max_age_seconds {
            self.cache.max_age_seconds = Some(seconds);
        }
        if let Some(url) = overrides.origin_url.as_ref() {
            self.origin.upstream_url = Some(url.clone());
        }
        if let Some(seconds) = overrides.origin_timeout_seconds {
            self.origin.timeout_seconds = Some(seconds);
        }
        if let Some(enabled) = overrides.rate_limit_enabled {
            self.rate_limit.enabled = Some(enabled);
        }
        if let Some(window) = overrides.rate_limit_window_seconds {
            self.rate_limit.window_seconds = Some(window);
        }
        if let Some(max) = overrides.rate_limit_max_requests {
            self.rate_limit.max_requests = Some(max);
        }

        self.apply_cache_root_override(&overrides.cache);
    }

    fn apply_cache_root_override(&mut self, overrides: &CacheRootOverride) {
        if let Some(root) = overrides.cache_root.as_ref() {
            self.cache.root = Some(root.clone());
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            cache,
            origin,
            rate_limit,
        } = raw;

        let server = build_server_settings(server)?;
        let logging = build_logging_settings(logging)?;
        let cache = build_cache_settings(cache)?;
        let origin = build_origin_settings(origin)?;
        let rate_limit = build_rate_limit_settings(rate_limit)?;

        Ok(Self {
            server,
            logging,
            cache,
            origin,
            rate_limit,
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());

    let port = server.port.unwrap_or(DEFAULT_PORT);
    if port == 0 {
        return Err(LoadError::invalid(
            "server.port",
            "port must be greater than zero",
        ));
    }

    let addr = parse_socket_addr(&host, port)
        .map_err(|reason| LoadError::invalid("server.addr", reason))?;

    let graceful_secs = server
        .graceful_shutdown_seconds
        .unwrap_or(DEFAULT_GRACEFUL_SHUTDOWN_SECS);
    if graceful_secs == 0 {
        return Err(LoadError::invalid(
            "server.graceful_shutdown_seconds",
            "must be greater than zero",
        ));
    }

    Ok(ServerSettings {
        addr,
        graceful_shutdown: Duration::from_secs(graceful_secs),
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheConfig, LoadError> {
    let defaults = CacheConfig::default();

    let root = cache.root.unwrap_or(defaults.root);
    if root.as_os_str().is_empty() {
        return Err(LoadError::invalid("cache.root", "path must not be empty"));
    }

    let max_age_seconds = non_zero_u64(
        cache.max_age_seconds.unwrap_or(defaults.max_age_seconds),
        "cache.max_age_seconds",
    )?
    .get();

    let country_header = cache
        .country_header
        .unwrap_or(defaults.country_header)
        .trim()
        .to_ascii_lowercase();
    HeaderName::from_str(&country_header).map_err(|err| {
        LoadError::invalid("cache.country_header", format!("invalid header name: {err}"))
    })?;

    let vary_headers = cache.vary_headers.unwrap_or(defaults.vary_headers);
    for name in &vary_headers {
        HeaderName::from_str(name).map_err(|err| {
            LoadError::invalid(
                "cache.vary_headers",
                format!("invalid header name `{name}`: {err}"),
            )
        })?;
    }

    let special_countries = cache
        .special_countries
        .unwrap_or(defaults.special_countries)
        .into_iter()
        .map(|code| code.trim().to_ascii_uppercase())
        .collect::<Vec<_>>();
    if let Some(code) = special_countries
        .iter()
        .find(|code| code.len() != 2 || !code.bytes().all(|b| b.is_ascii_alphabetic()))
    {
        return Err(LoadError::invalid(
            "cache.special_countries",
            format!("`{code}` is not a two-letter country code"),
        ));
    }

    let placeholder_url = cache.placeholder_url.unwrap_or(defaults.placeholder_url);
    if placeholder_url.trim().is_empty() {
        return Err(LoadError::invalid(
            "cache.placeholder_url",
            "must not be empty",
        ));
    }

    let ignore_paths = cache
        .ignore_paths
        .unwrap_or(defaults.ignore_paths)
        .into_iter()
        .filter(|fragment| !fragment.is_empty())
        .collect();

    Ok(CacheConfig {
        root,
        max_age_seconds,
        ignore_paths,
        ignored_params: cache.ignored_params.unwrap_or(defaults.ignored_params),
        special_countries,
        country_header,
        vary_headers,
        permissive: cache.permissive.unwrap_or(defaults.permissive),
        permissive_host_markers: cache
            .permissive_host_markers
            .unwrap_or(defaults.permissive_host_markers),
        placeholder_url,
    })
}

fn build_origin_settings(origin: RawOriginSettings) -> Result<OriginSettings, LoadError> {
    let upstream_url = origin
        .upstream_url
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .map(|value| {
            Url::parse(&value).map_err(|err| {
                LoadError::invalid("origin.upstream_url", format!("invalid url `{value}`: {err}"))
            })
        })
        .transpose()?;

    if upstream_url
        .as_ref()
        .is_some_and(|url| !matches!(url.scheme(), "http" | "https"))
    {
        return Err(LoadError::invalid(
            "origin.upstream_url",
            "scheme must be http or https",
        ));
    }

    let timeout_secs = non_zero_u64(
        origin.timeout_seconds.unwrap_or(DEFAULT_ORIGIN_TIMEOUT_SECS),
        "origin.timeout_seconds",
    )?;

    Ok(OriginSettings {
        upstream_url,
        timeout: Duration::from_secs(timeout_secs.get()),
    })
}

fn build_rate_limit_settings(
    rate_limit: RawRateLimitSettings,
) -> Result<RateLimitConfig, LoadError> {
    let defaults = RateLimitConfig::default();

    let window_seconds = non_zero_u64(
        rate_limit.window_seconds.unwrap_or(defaults.window_seconds),
        "rate_limit.window_seconds",
    )?;
    let max_requests = non_zero_u64(
        rate_limit.max_requests.unwrap_or(defaults.max_requests),
        "rate_limit.max_requests",
    )?;

    Ok(RateLimitConfig {
        enabled: rate_limit.enabled.unwrap_or(defaults.enabled),
        window_seconds: window_seconds.get(),
        max_requests: max_requests.get(),
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    port: Option<u16>,
    graceful_shutdown_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    root: Option<PathBuf>,
    max_age_seconds: Option<u64>,
    ignore_paths: Option<Vec<String>>,
    ignored_params: Option<Vec<String>>,
    special_countries: Option<Vec<String>>,
    country_header: Option<String>,
    vary_headers: Option<Vec<String>>,
    permissive: Option<bool>,
    permissive_host_markers: Option<Vec<String>>,
    placeholder_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawOriginSettings {
    upstream_url: Option<String>,
    timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRateLimitSettings {
    enabled: Option<bool>,
    window_seconds: Option<u64>,
    max_requests: Option<u64>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

fn non_zero_u64(value: u64, key: &'static str) -> Result<NonZeroU64, LoadError> {
    NonZeroU64::new(value).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[cfg(test)]
mod tests;
