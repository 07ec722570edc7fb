//! Logging setup. Logs go to stderr, filtered by `FOREMAN_LOG` (default
//! `info`), as text or as JSON lines when `FOREMAN_LOG_FORMAT=json`.
//!
//! With the `otel` feature and `OTEL_EXPORTER_OTLP_ENDPOINT` set, spans are
//! also exported over OTLP/HTTP.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

pub const LOG_ENV: &str = "FOREMAN_LOG";
pub const LOG_FORMAT_ENV: &str = "FOREMAN_LOG_FORMAT";

/// Flushes exporters when dropped. Hold it for the life of `main`.
pub struct TelemetryGuard {
    #[cfg(feature = "otel")]
    provider: Option<opentelemetry_sdk::trace::SdkTracerProvider>,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        #[cfg(feature = "otel")]
        if let Some(provider) = self.provider.take() {
            if let Err(e) = provider.shutdown() {
                eprintln!("foreman: failed to flush traces: {e}");
            }
        }
    }
}

fn json_requested() -> bool {
    std::env::var(LOG_FORMAT_ENV).is_ok_and(|v| v.eq_ignore_ascii_case("json"))
}

pub fn init() -> TelemetryGuard {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    let json = json_requested();
    let json_layer = json.then(|| fmt::layer().json().with_writer(std::io::stderr));
    let text_layer = (!json).then(|| {
        fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr)
    });

    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(text_layer);

    #[cfg(feature = "otel")]
    {
        use opentelemetry::trace::TracerProvider as _;

        let provider = otel::provider();
        let otel_layer = provider
            .as_ref()
            .map(|p| tracing_opentelemetry::layer().with_tracer(p.tracer("foreman")));
        // A second init (tests, embedding) keeps the first subscriber.
        let _ = registry.with(otel_layer).try_init();
        TelemetryGuard { provider }
    }

    #[cfg(not(feature = "otel"))]
    {
        let _ = registry.try_init();
        TelemetryGuard {}
    }
}

#[cfg(feature = "otel")]
mod otel {
    use opentelemetry_sdk::Resource;
    use opentelemetry_sdk::trace::SdkTracerProvider;

    /// A batch-exporting provider, or None when no endpoint is configured.
    pub fn provider() -> Option<SdkTracerProvider> {
        std::env::var_os("OTEL_EXPORTER_OTLP_ENDPOINT")?;
        let exporter = match opentelemetry_otlp::SpanExporter::builder()
            .with_http()
            .build()
        {
            Ok(exporter) => exporter,
            Err(e) => {
                eprintln!("foreman: OTLP export disabled: {e}");
                return None;
            }
        };
        Some(
            SdkTracerProvider::builder()
                .with_batch_exporter(exporter)
                .with_resource(Resource::builder().with_service_name("foreman").build())
                .build(),
        )
    }
}
