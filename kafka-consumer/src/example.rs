use anyhow::{anyhow, Context};
use async_trait::async_trait;
use common_kafka::Record;
use kafka_consumer::Processor;
use serde::Deserialize;
use tracing::{debug, Span};
use tracing_opentelemetry::OpenTelemetrySpanExt;

/// Outcome of a payment transaction, as published by the upstream service.
#[derive(Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ResultMessage {
    pub transaction_ref: String,
    pub code: String,
}

/// Decodes result messages, tags the processing span with them and logs them.
pub struct ExampleProcessor;

impl ExampleProcessor {
    pub fn decode(record: &Record) -> anyhow::Result<ResultMessage> {
        let payload = record
            .value()
            .filter(|v| !v.is_empty())
            .ok_or_else(|| anyhow!("record has no payload"))?;

        serde_json::from_slice(payload).context("failed to decode result message")
    }
}

#[async_trait]
impl Processor for ExampleProcessor {
    async fn process_record(&self, record: &Record) -> anyhow::Result<()> {
        let message = Self::decode(record)?;

        let span = Span::current();
        span.set_attribute("transaction.ref", message.transaction_ref.clone());
        span.set_attribute("ddp.result.code", message.code.clone());

        debug!(
            transaction_ref = %message.transaction_ref,
            code = %message.code,
            partition = record.partition(),
            offset = record.offset(),
            "processed result message"
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::future::{ready, Future};
    use std::pin::Pin;
    use std::sync::{Arc, Mutex};

    use kafka_consumer::telemetry::span_export_layer;
    use kafka_consumer::InstrumentingProcessor;
    use opentelemetry::trace::{Status, TracerProvider as _};
    use opentelemetry_sdk::export::trace::{ExportResult, SpanData, SpanExporter};
    use opentelemetry_sdk::trace::TracerProvider;
    use tracing_subscriber::layer::SubscriberExt;

    use super::*;

    #[derive(Debug, Clone, Default)]
    struct CollectingExporter(Arc<Mutex<Vec<SpanData>>>);

    impl SpanExporter for CollectingExporter {
        fn export(
            &mut self,
            batch: Vec<SpanData>,
        ) -> Pin<Box<dyn Future<Output = ExportResult> + Send + 'static>> {
            self.0.lock().unwrap().extend(batch);
            Box::pin(ready(Ok(())))
        }
    }

    // Runs one record through the instrumented processor with span export
    // filtered the same way as in production.
    async fn process_exported(record: &Record) -> (anyhow::Result<()>, Vec<SpanData>) {
        let exporter = CollectingExporter::default();
        let provider = TracerProvider::builder()
            .with_simple_exporter(exporter.clone())
            .build();
        let subscriber =
            tracing_subscriber::registry().with(span_export_layer(provider.tracer("example")));
        let _guard = tracing::subscriber::set_default(subscriber);

        let result = InstrumentingProcessor::new(ExampleProcessor)
            .process_record(record)
            .await;
        assert!(provider.force_flush().iter().all(|r| r.is_ok()));

        let spans = std::mem::take(&mut *exporter.0.lock().unwrap());
        (result, spans)
    }

    fn attribute(span: &SpanData, key: &str) -> Option<String> {
        span.attributes
            .iter()
            .find(|kv| kv.key.as_str() == key)
            .map(|kv| kv.value.to_string())
    }

    #[tokio::test]
    async fn decodes_result_message() {
        let record = Record::new("results", 0, 1)
            .with_value(r#"{"transactionRef":"tx-42","code":"APPROVED"}"#);

        assert_eq!(
            ExampleProcessor::decode(&record).unwrap(),
            ResultMessage {
                transaction_ref: "tx-42".to_string(),
                code: "APPROVED".to_string(),
            }
        );
        ExampleProcessor.process_record(&record).await.unwrap();
    }

    #[tokio::test]
    async fn rejects_malformed_payloads() {
        for record in [
            Record::new("results", 0, 2),
            Record::new("results", 0, 3).with_value(""),
            Record::new("results", 0, 4).with_value("not json"),
            Record::new("results", 0, 5).with_value(r#"{"code":"APPROVED"}"#),
        ] {
            assert!(ExampleProcessor.process_record(&record).await.is_err());
        }
    }

    #[tokio::test]
    async fn result_fields_are_exported_on_the_processing_span() {
        let record = Record::new("results", 3, 17)
            .with_value(r#"{"transactionRef":"tx-7","code":"DECLINED"}"#);

        let (result, spans) = process_exported(&record).await;
        result.unwrap();

        assert_eq!(spans.len(), 1);
        let span = &spans[0];
        assert_eq!(span.name, "results process");
        assert_eq!(attribute(span, "transaction.ref").as_deref(), Some("tx-7"));
        assert_eq!(attribute(span, "ddp.result.code").as_deref(), Some("DECLINED"));
        assert!(!matches!(span.status, Status::Error { .. }));
    }

    #[tokio::test]
    async fn undecodable_payload_marks_the_span_as_failed() {
        let record = Record::new("results", 0, 18).with_value("not json");

        let (result, spans) = process_exported(&record).await;
        assert!(result.is_err());

        assert_eq!(spans.len(), 1);
        assert!(matches!(spans[0].status, Status::Error { .. }));
        assert_eq!(attribute(&spans[0], "transaction.ref"), None);
    }
}
