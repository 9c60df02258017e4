use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

use crate::config::ObservabilityConfig;
use crate::types::{MergeStyle, PullId};

/// Install the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over the configured level. Only binaries
/// should call this; the library itself never installs a subscriber.
pub fn init_telemetry(config: &ObservabilityConfig) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.log_level)?,
    };

    let registry = tracing_subscriber::registry().with(filter);
    if config.json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(true)
                    .with_writer(std::io::stderr),
            )
            .try_init()?;
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .compact()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .try_init()?;
    }

    tracing::debug!("Telemetry initialized");
    Ok(())
}

/// Generate a correlation ID for linking the steps of one merge attempt
pub fn generate_correlation_id() -> String {
    Uuid::new_v4().to_string()
}

/// Span wrapping one merge attempt
pub fn create_merge_span(pull_id: PullId, style: MergeStyle, correlation_id: &str) -> tracing::Span {
    tracing::info_span!(
        "merge",
        pull.id = pull_id,
        merge.style = %style,
        correlation.id = correlation_id,
    )
}

/// Span wrapping one auto-merge queue delivery
pub fn create_queue_span(key: &str) -> tracing::Span {
    tracing::info_span!("auto_merge", queue.key = key)
}
