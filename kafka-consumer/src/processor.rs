use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use common_kafka::Record;
use tracing::{field, info_span, Instrument, Span};
use tracing_opentelemetry::OpenTelemetrySpanExt;

use crate::metrics_consts::{MESSAGES_PROCESSED, MESSAGE_PROCESSING_DURATION_MS};
use crate::telemetry::trace_context;

/// Business logic for one record.
///
/// Implementations are shared by every in-flight task, so they take `&self`
/// and must be safe to call concurrently. An `Err` is logged by the
/// dispatcher and the record is not retried.
#[async_trait]
pub trait Processor: Send + Sync {
    async fn process_record(&self, record: &Record) -> anyhow::Result<()>;
}

#[async_trait]
impl<P: Processor + ?Sized> Processor for Arc<P> {
    async fn process_record(&self, record: &Record) -> anyhow::Result<()> {
        (**self).process_record(record).await
    }
}

/// Wraps a [`Processor`] with a consumer span, a processed-records counter
/// and a duration histogram. The inner result is returned untouched.
pub struct InstrumentingProcessor<P> {
    inner: P,
}

impl<P: Processor> InstrumentingProcessor<P> {
    pub fn new(inner: P) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<P: Processor> Processor for InstrumentingProcessor<P> {
    async fn process_record(&self, record: &Record) -> anyhow::Result<()> {
        let span = info_span!(
            "process_record",
            otel.name = %format!("{} process", record.topic()),
            otel.kind = "consumer",
            otel.status_code = field::Empty,
            messaging.system = "kafka",
            messaging.destination.name = %record.topic(),
            messaging.kafka.partition = record.partition(),
            messaging.kafka.offset = record.offset(),
        );
        span.set_parent(trace_context(record));

        let mut outcome = Outcome::start(record.topic(), span.clone());
        let result = self.inner.process_record(record).instrument(span).await;
        outcome.success = result.is_ok();

        result
    }
}

// Records the outcome when dropped, so a panicking or cancelled inner future
// is still counted, as a failure.
struct Outcome<'a> {
    topic: &'a str,
    started: Instant,
    success: bool,
    span: Span,
}

impl<'a> Outcome<'a> {
    fn start(topic: &'a str, span: Span) -> Self {
        Self {
            topic,
            started: Instant::now(),
            success: false,
            span,
        }
    }
}

impl Drop for Outcome<'_> {
    fn drop(&mut self) {
        let success = if self.success { "true" } else { "false" };
        let elapsed_ms = self.started.elapsed().as_secs_f64() * 1000.0;

        metrics::counter!(MESSAGES_PROCESSED, "topic" => self.topic.to_owned(), "success" => success)
            .increment(1);
        metrics::histogram!(MESSAGE_PROCESSING_DURATION_MS, "topic" => self.topic.to_owned(), "success" => success)
            .record(elapsed_ms);

        if !self.success {
            self.span.record("otel.status_code", "ERROR");
        }
    }
}
