//! Tracing setup.
//!
//! Console logs are human readable unless `KEYSHARE_LOG_FORMAT=json`, which
//! emits one JSON object per event. With the `otel` feature, spans are also
//! exported over OTLP/HTTP to `OTEL_EXPORTER_OTLP_ENDPOINT`
//! (default `http://localhost:4318`).

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_FILTER: &str = "keyshare_server=info,actix_web=info";

#[cfg(feature = "otel")]
const SERVICE_NAME: &str = "keyshare-server";

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_FILTER.into())
}

fn json_logs() -> bool {
    std::env::var("KEYSHARE_LOG_FORMAT")
        .map(|v| v.trim().eq_ignore_ascii_case("json"))
        .unwrap_or(false)
}

/// Initialize tracing with console output only.
#[cfg(not(feature = "otel"))]
pub fn init_tracing() {
    let json = json_logs();

    tracing_subscriber::registry()
        .with(env_filter())
        .with(json.then(|| fmt::layer().json()))
        .with((!json).then(fmt::layer))
        .init();
}

/// No-op shutdown when OpenTelemetry is disabled.
#[cfg(not(feature = "otel"))]
pub fn shutdown_tracing() {}

#[cfg(feature = "otel")]
mod otel {
    use std::sync::OnceLock;

    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::trace::SdkTracerProvider;

    /// Global tracer provider for shutdown.
    pub(super) static TRACER_PROVIDER: OnceLock<SdkTracerProvider> = OnceLock::new();

    pub(super) fn tracer_provider() -> Result<SdkTracerProvider, String> {
        let endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
            .unwrap_or_else(|_| "http://localhost:4318".to_string());

        let exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_http()
            .with_endpoint(endpoint)
            .build()
            .map_err(|e| format!("failed to create OTLP exporter: {e}"))?;

        let resource = opentelemetry_sdk::Resource::builder()
            .with_service_name(super::SERVICE_NAME)
            .build();

        Ok(SdkTracerProvider::builder()
            .with_batch_exporter(exporter)
            .with_resource(resource)
            .build())
    }
}

/// Initialize tracing with console output and OTLP export.
///
/// An exporter that cannot be built leaves console logging working and is
/// reported once the subscriber is up.
#[cfg(feature = "otel")]
pub fn init_tracing() {
    use opentelemetry::trace::TracerProvider as _;
    use tracing_opentelemetry::OpenTelemetryLayer;

    let json = json_logs();

    let (otel_layer, otel_error) = match otel::tracer_provider() {
        Ok(provider) => {
            let tracer = provider.tracer(SERVICE_NAME);
            let _ = otel::TRACER_PROVIDER.set(provider.clone());
            opentelemetry::global::set_tracer_provider(provider);
            (Some(OpenTelemetryLayer::new(tracer)), None)
        }
        Err(e) => (None, Some(e)),
    };

    tracing_subscriber::registry()
        .with(env_filter())
        .with(json.then(|| fmt::layer().json()))
        .with((!json).then(fmt::layer))
        .with(otel_layer)
        .init();

    if let Some(error) = otel_error {
        tracing::warn!(%error, "OpenTelemetry export disabled");
    }
}

/// Shutdown OpenTelemetry and flush remaining spans.
#[cfg(feature = "otel")]
pub fn shutdown_tracing() {
    if let Some(provider) = otel::TRACER_PROVIDER.get()
        && let Err(e) = provider.shutdown()
    {
        tracing::error!("Error shutting down tracer provider: {e:?}");
    }
}
