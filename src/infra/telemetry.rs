//! Process-wide observability: the tracing subscriber and `pagecache_*`
//! metric descriptions.
//!
//! Metrics go through the `metrics` facade; no exporter is installed here, so
//! counters are dropped unless the embedding binary or a test installs a
//! recorder.

use std::sync::Once;

use metrics::{Unit, describe_counter};
use tracing::Subscriber;
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    registry::LookupSpan,
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Installs the global subscriber; `RUST_LOG` directives refine the configured level.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(filter)
        .with(ErrorLayer::default())
        .with(output_layer(logging.format))
        .try_init()
        .map_err(|err| InfraError::telemetry(format!("subscriber already installed: {err}")))
}

fn output_layer<S>(format: LogFormat) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'span> LookupSpan<'span>,
{
    match format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().boxed(),
    }
}

fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "pagecache_hit_total",
            Unit::Count,
            "Total number of pages served from the cache."
        );
        describe_counter!(
            "pagecache_miss_total",
            Unit::Count,
            "Total number of cacheable requests rendered by the origin."
        );
        describe_counter!(
            "pagecache_bypass_total",
            Unit::Count,
            "Total number of requests passed to the origin without touching the cache."
        );
        describe_counter!(
            "pagecache_store_failed_total",
            Unit::Count,
            "Total number of rendered pages that could not be persisted."
        );
        describe_counter!(
            "pagecache_rate_limited_total",
            Unit::Count,
            "Total number of requests rejected by the access ceiling."
        );
    });
}
