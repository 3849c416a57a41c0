use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, filter::Directive, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Overrides `logging.level` when set, with `RUST_LOG` syntax.
const LOG_ENV_VAR: &str = "FEATURETAG_LOG";

/// sqlx logs each executed statement at `info`.
const QUIET_SQLX: &str = "sqlx::query=warn";

/// Install the global subscriber for the binary and describe exported metrics.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let quiet_sqlx: Directive = QUIET_SQLX
        .parse()
        .map_err(|err| InfraError::telemetry(format!("invalid log directive: {err}")))?;
    let env_filter = EnvFilter::builder()
        .with_env_var(LOG_ENV_VAR)
        .with_default_directive(logging.level.into())
        .from_env_lossy()
        .add_directive(quiet_sqlx);

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(false).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| InfraError::telemetry(format!("subscriber already installed: {err}")))
}

pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "featuretag_cache_contains_total",
            Unit::Count,
            "Strong etag lookups, labelled by backend and hit/miss result."
        );
        describe_gauge!(
            "featuretag_cache_naive_entries",
            Unit::Count,
            "Weak etags held by the in-process cache."
        );
        describe_counter!(
            "featuretag_listener_events_total",
            Unit::Count,
            "Completed change notifications, labelled by action."
        );
        describe_gauge!(
            "featuretag_listener_pending_messages",
            Unit::Count,
            "Multi-page notifications still waiting for their last page."
        );
        describe_histogram!(
            "featuretag_listener_apply_ms",
            Unit::Milliseconds,
            "Time spent applying one change notification to the cache."
        );
    });
}
