use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

use crate::config::ObservabilityConfig;
use crate::submission::types::{RecordId, UserId};

/// Initialize structured logging.
///
/// `RUST_LOG` wins over the configured level when set.
pub fn init_telemetry(config: &ObservabilityConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))?;

    let registry = tracing_subscriber::registry().with(filter);
    if config.json_logs {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(true),
            )
            .try_init()?;
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()?;
    }

    tracing::info!("einvoice-pipeline telemetry initialized");
    Ok(())
}

/// Generate a correlation ID for linking related operations
pub fn generate_correlation_id() -> String {
    Uuid::new_v4().to_string()
}

/// Span wrapping one `submit()` run
pub fn create_submission_span(
    record_id: RecordId,
    initiator_id: Option<UserId>,
    worker_id: &str,
    correlation_id: &str,
) -> tracing::Span {
    tracing::info_span!(
        "einvoice_submission",
        record.id = record_id,
        initiator.id = initiator_id,
        worker.id = worker_id,
        correlation.id = correlation_id,
        attempt.id = tracing::field::Empty,
        tenant.id = tracing::field::Empty,
    )
}

/// Worker identity: host name plus a per-process suffix. Each run leases
/// records as `<worker>/<correlation id>`.
pub fn worker_identity() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "unknown-host".to_string());
    let correlation = generate_correlation_id();
    let suffix = correlation.split('-').next().unwrap_or(&correlation);
    format!("{host}-{suffix}")
}
