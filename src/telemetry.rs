//! Logging and optional OpenTelemetry export.
//!
//! Console output always goes to stderr so command output on stdout stays
//! machine readable. When telemetry is enabled, spans are also exported over
//! OTLP/gRPC. The exporter runs on the tokio runtime, so initialization must
//! happen inside one.

use crate::config::TelemetryConfig;
use anyhow::{Context, Result};
use opentelemetry::trace::TracerProvider;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::trace::TracerProvider as SdkTracerProvider;
use opentelemetry_sdk::Resource;
use tracing::Level;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global subscriber.
///
/// `RUST_LOG` wins over `log_level` when set. Returns an error if the OTLP
/// exporter cannot be built.
pub fn init_telemetry(config: &TelemetryConfig, log_level: Level) -> Result<()> {
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level.to_string()));

    if !config.enabled {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .init();
        return Ok(());
    }

    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(config.otlp_endpoint.as_str())
        .build()
        .context("Failed to build OTLP span exporter")?;

    let provider = SdkTracerProvider::builder()
        .with_batch_exporter(exporter, opentelemetry_sdk::runtime::Tokio)
        .with_resource(Resource::new(vec![opentelemetry::KeyValue::new(
            "service.name",
            config.service_name.clone(),
        )]))
        .build();

    let tracer = provider.tracer(config.service_name.clone());
    opentelemetry::global::set_tracer_provider(provider);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .with(tracing_opentelemetry::layer().with_tracer(tracer))
        .init();

    tracing::info!(
        otlp_endpoint = %config.otlp_endpoint,
        service_name = %config.service_name,
        "OpenTelemetry tracing enabled"
    );
    Ok(())
}

/// Flush pending spans. Call before the runtime shuts down.
pub fn shutdown_telemetry(config: &TelemetryConfig) {
    if config.enabled {
        opentelemetry::global::shutdown_tracer_provider();
        tracing::debug!("OpenTelemetry tracer provider shut down");
    }
}
