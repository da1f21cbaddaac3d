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

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

/// Register units and help text for every metric the cache emits.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "quire_render_hit_total",
            Unit::Count,
            "Total number of renders served from the render cache."
        );
        describe_counter!(
            "quire_render_miss_total",
            Unit::Count,
            "Total number of renders that had to run the render function."
        );
        describe_histogram!(
            "quire_render_ms",
            Unit::Milliseconds,
            "Render function latency on a cache miss."
        );
        describe_counter!(
            "quire_touch_total",
            Unit::Count,
            "Total number of entities touched, dependents included."
        );
        describe_counter!(
            "quire_touch_keys_deleted_total",
            Unit::Count,
            "Total number of render entries deleted by touches."
        );
        describe_histogram!(
            "quire_touch_ms",
            Unit::Milliseconds,
            "Latency of a touch including dependency propagation."
        );
        describe_counter!(
            "quire_lock_timeout_total",
            Unit::Count,
            "Total number of entity lock acquisitions that timed out."
        );
    });
}
