//! Tracing setup for the search server.
//!
//! Console output through a `fmt` layer is always installed. When enabled,
//! spans are also exported over OTLP/gRPC so a request can be followed from
//! the HTTP layer through hybrid search, archive fetches and the matcher.

use anyhow::{Context, Result};
use opentelemetry::trace::TracerProvider;
use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::trace::{Tracer, TracerProvider as SdkTracerProvider};
use opentelemetry_sdk::Resource;
use tracing::Level;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global subscriber.
///
/// `RUST_LOG` takes precedence over `log_level`. Fails if the OTLP exporter
/// cannot be built or a subscriber is already installed.
pub fn init_telemetry(
    enabled: bool,
    otlp_endpoint: &str,
    service_name: &str,
    log_level: Level,
) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level.to_string()));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_line_number(false);

    let tracer = if enabled {
        Some(otlp_tracer(otlp_endpoint, service_name)?)
    } else {
        None
    };
    let otel_layer = tracer.map(|t| tracing_opentelemetry::layer().with_tracer(t));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .with(otel_layer)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    if enabled {
        tracing::info!(otlp_endpoint, service_name, "OpenTelemetry export enabled");
    } else {
        tracing::debug!("OpenTelemetry export disabled");
    }
    Ok(())
}

fn otlp_tracer(otlp_endpoint: &str, service_name: &str) -> Result<Tracer> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(otlp_endpoint)
        .build()
        .context("Failed to build OTLP span exporter")?;

    let provider = SdkTracerProvider::builder()
        .with_batch_exporter(exporter, opentelemetry_sdk::runtime::Tokio)
        .with_resource(Resource::new(vec![
            KeyValue::new("service.name", service_name.to_owned()),
            KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
        ]))
        .build();
    let tracer = provider.tracer(service_name.to_owned());
    // registered globally so shutdown can flush it
    opentelemetry::global::set_tracer_provider(provider);
    Ok(tracer)
}

/// Flush pending spans. Call once on shutdown.
pub fn shutdown_telemetry() {
    opentelemetry::global::shutdown_tracer_provider();
}
