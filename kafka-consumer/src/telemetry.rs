use std::time::Duration;

use common_kafka::Record;
use opentelemetry::propagation::{Extractor, TextMapCompositePropagator};
use opentelemetry::trace::TraceError;
use opentelemetry::{global, Context, KeyValue, Value};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::propagation::{BaggagePropagator, TraceContextPropagator};
use opentelemetry_sdk::trace::{BatchConfig, RandomIdGenerator, Sampler, Tracer};
use opentelemetry_sdk::{runtime, Resource};
use tracing::level_filters::LevelFilter;
use tracing::{info, warn, Subscriber};
use tracing_opentelemetry::OpenTelemetryLayer;
use tracing_subscriber::filter::Filtered;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::config::Config;

/// Exposes record headers to an OpenTelemetry propagator.
pub struct HeaderExtractor<'a>(pub &'a Record);

impl Extractor for HeaderExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0
            .header(key)
            .and_then(|value| std::str::from_utf8(value).ok())
    }

    fn keys(&self) -> Vec<&str> {
        self.0.headers().iter().map(|(k, _)| k.as_str()).collect()
    }
}

/// W3C trace context plus baggage.
pub fn propagator() -> TextMapCompositePropagator {
    TextMapCompositePropagator::new(vec![
        Box::new(TraceContextPropagator::new()),
        Box::new(BaggagePropagator::new()),
    ])
}

/// Trace context carried by the record headers, via the global propagator.
/// Empty if the producer did not propagate one.
pub fn trace_context(record: &Record) -> Context {
    global::get_text_map_propagator(|propagator| propagator.extract(&HeaderExtractor(record)))
}

/// Owns the OTLP trace pipeline, when enabled.
pub struct Telemetry {
    tracer: Option<Tracer>,
}

impl Telemetry {
    pub fn disabled() -> Self {
        Self { tracer: None }
    }

    /// Installs the trace-context and baggage propagators and, if
    /// `OTEL_ENABLED`, starts a batching OTLP exporter.
    pub fn init(config: &Config) -> Result<Self, TraceError> {
        global::set_text_map_propagator(propagator());

        if !config.otel_enabled {
            return Ok(Self::disabled());
        }
        let Some(url) = config.otel_url.as_deref() else {
            return Ok(Self::disabled());
        };

        if let Err(e) = global::set_error_handler(|e| warn!("opentelemetry error: {e}")) {
            warn!("failed to install opentelemetry error handler: {e}");
        }

        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_trace_config(
                opentelemetry_sdk::trace::Config::default()
                    .with_sampler(Sampler::ParentBased(Box::new(Sampler::TraceIdRatioBased(
                        config.otel_sampling_rate,
                    ))))
                    .with_id_generator(RandomIdGenerator::default())
                    .with_resource(Resource::new(vec![KeyValue::new(
                        "service.name",
                        Value::from(config.app_name.clone()),
                    )])),
            )
            .with_batch_config(BatchConfig::default())
            .with_exporter(
                opentelemetry_otlp::new_exporter()
                    .tonic()
                    .with_endpoint(url)
                    .with_timeout(Duration::from_secs(3)),
            )
            .install_batch(runtime::Tokio)?;

        Ok(Self {
            tracer: Some(tracer),
        })
    }

    /// Flushes pending spans and stops the exporter. Failures are only logged.
    pub async fn shutdown(self) {
        if self.tracer.is_none() {
            return;
        }
        match tokio::task::spawn_blocking(global::shutdown_tracer_provider).await {
            Ok(()) => info!("tracer provider shut down"),
            Err(e) => warn!("tracer provider shutdown failed: {e}"),
        }
    }
}

/// Installs the global subscriber: JSON logs filtered by `RUST_LOG`
/// (default INFO), plus span export when telemetry is enabled.
pub fn init_tracing(telemetry: &Telemetry) {
    let log_layer = tracing_subscriber::fmt::layer().json().with_filter(
        EnvFilter::builder()
            .with_default_directive(LevelFilter::INFO.into())
            .from_env_lossy(),
    );
    let otel_layer = telemetry.tracer.clone().map(span_export_layer);

    if let Err(e) = tracing_subscriber::registry()
        .with(log_layer)
        .with(otel_layer)
        .try_init()
    {
        warn!("tracing subscriber already installed: {e}");
    }
}

/// Exports spans at INFO and above to `tracer`.
pub fn span_export_layer<S>(
    tracer: Tracer,
) -> Filtered<OpenTelemetryLayer<S, Tracer>, LevelFilter, S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    OpenTelemetryLayer::new(tracer).with_filter(LevelFilter::INFO)
}
