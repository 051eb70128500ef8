use common_kafka::config::KafkaConfigError;
use opentelemetry::trace::TraceError;
use thiserror::Error;

/// Configuration rejected by [`crate::config::Config::validate`].
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("APP_NAME must not be empty")]
    EmptyAppName,
    #[error("OTEL_SAMPLING_RATE must be within [0, 1], got {0}")]
    InvalidSamplingRate(f64),
    #[error("OTEL_ENABLED is set but OTEL_URL is missing")]
    MissingOtelUrl,
    #[error(transparent)]
    Kafka(#[from] KafkaConfigError),
}

/// Startup failures. Anything returned from here aborts the process before
/// the consumer or the probe server start.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("failed to create kafka client: {0}")]
    Kafka(#[from] KafkaConfigError),
    #[error("failed to initialize tracing exporter: {0}")]
    Telemetry(#[from] TraceError),
    #[error("failed to install metrics recorder: {0}")]
    Metrics(#[from] metrics_exporter_prometheus::BuildError),
    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },
}
