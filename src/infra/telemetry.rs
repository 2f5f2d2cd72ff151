//! Process-wide tracing subscriber and metric descriptions.

use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static DESCRIBED: Once = Once::new();

const COUNTERS: &[(&str, &str)] = &[
    ("tessera_cache_hit_total", "Response-cache hits."),
    ("tessera_cache_miss_total", "Response-cache misses."),
    ("tessera_cache_store_total", "Responses written to the cache."),
    (
        "tessera_cache_backend_error_total",
        "Cache backend failures that degraded to a miss or a skipped store.",
    ),
    (
        "tessera_resolver_tier_hit_total",
        "Template resolutions answered, labelled by tier.",
    ),
    (
        "tessera_resolver_backfill_total",
        "Background copies of a template into a faster tier.",
    ),
    (
        "tessera_resolver_negative_hit_total",
        "Resolutions answered by a negative cache entry.",
    ),
    (
        "tessera_component_validate_total",
        "Component validations, labelled by outcome.",
    ),
];

/// Install the global subscriber. `RUST_LOG` refines the configured level.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let output = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_span_list(false)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().boxed(),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(ErrorLayer::default())
        .with(output)
        .try_init()
        .map_err(|err| InfraError::telemetry(format!("subscriber already installed: {err}")))
}

fn describe_metrics() {
    DESCRIBED.call_once(|| {
        for (name, description) in COUNTERS {
            describe_counter!(*name, Unit::Count, *description);
        }
        describe_histogram!(
            "tessera_render_ms",
            Unit::Milliseconds,
            "Template execution latency in milliseconds, labelled by mode."
        );
    });
}
