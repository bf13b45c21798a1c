use std::borrow::Cow;

use opentelemetry::trace::TracerProvider as _;
use opentelemetry::KeyValue;
use opentelemetry_sdk::Resource;
use tracing::Subscriber;
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::{EnvFilter, Layer};

/// Guard object that ensures tracer provider shutdown (flush) on drop.
pub struct OtelGuard {
    _private: (),
}

impl Drop for OtelGuard {
    fn drop(&mut self) {
        // Best-effort flush on shutdown.
        opentelemetry::global::shutdown_tracer_provider();
    }
}

struct ErrorCounterLayer;

impl<S> Layer<S> for ErrorCounterLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        if *event.metadata().level() == tracing::Level::ERROR {
            metrics::counter!("tracing_error_events").increment(1);
        }
    }
}

/// Build a `tracing` dispatcher configured for:
/// - JSON logs to stdout
/// - EnvFilter that respects `RUST_LOG` (takes precedence) and falls back to `default_level`
/// - `tracing_error_events` counter for ERROR events
/// - OpenTelemetry OTLP trace export when `OTEL_EXPORTER_OTLP_ENDPOINT` is set
/// - Pretty-printed spans on stdout when `debug_spans` is set
pub fn build_dispatch(
    service_name: impl Into<Cow<'static, str>>,
    default_level: &str,
    debug_spans: bool,
) -> (tracing::Dispatch, Option<OtelGuard>) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .json();

    let service_name = service_name.into();

    let mut provider_builder = opentelemetry_sdk::trace::TracerProvider::builder();
    let mut have_exporter = false;

    // Only enable OTLP export if the endpoint env var exists; local runs
    // stay logs-and-metrics only.
    if let Ok(endpoint) = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT") {
        use opentelemetry_otlp::WithExportConfig;

        match opentelemetry_otlp::SpanExporter::builder()
            .with_http()
            .with_endpoint(endpoint)
            .build()
        {
            Ok(exporter) => {
                // Requires a Tokio runtime; the bot binary is #[tokio::main].
                provider_builder =
                    provider_builder.with_batch_exporter(exporter, opentelemetry_sdk::runtime::Tokio);
                have_exporter = true;
            }
            Err(e) => {
                // Best-effort: fall back to logs+metrics only.
                eprintln!("failed to build OTLP span exporter: {e}");
            }
        }
    }

    if debug_spans {
        provider_builder =
            provider_builder.with_simple_exporter(opentelemetry_stdout::SpanExporter::default());
        have_exporter = true;
    }

    if have_exporter {
        let resource = Resource::new(vec![KeyValue::new(
            "service.name",
            service_name.to_string(),
        )]);
        let provider = provider_builder.with_resource(resource).build();
        let tracer = provider.tracer("wikipatrol");
        let _ = opentelemetry::global::set_tracer_provider(provider);

        let subscriber = tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .with(ErrorCounterLayer)
            .with(tracing_opentelemetry::layer().with_tracer(tracer));

        (
            tracing::Dispatch::new(subscriber),
            Some(OtelGuard { _private: () }),
        )
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .with(ErrorCounterLayer);

        (tracing::Dispatch::new(subscriber), None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_dispatch_without_otel_endpoint() {
        std::env::remove_var("OTEL_EXPORTER_OTLP_ENDPOINT");
        let (dispatch, guard) = build_dispatch("patrol-test", "info", false);
        assert!(guard.is_none());
        tracing::dispatcher::with_default(&dispatch, || {
            tracing::info!("dispatch smoke test");
        });
    }
}
